//! Liveness checks over derived state.
//!
//! A thing that sleeps between reports is still "up" as long as a report
//! landed recently enough. The sweep looks at the timestamp of each thing's
//! derived document and publishes a [`StatusReport`] through a
//! [`StatusSink`]; the default sink just logs, a transport can publish to a
//! dashboard instead.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::{error, info, warn};

use trellis_codec::{parse_timestamp, BOOT_KEY};
use trellis_store::{ShadowStore, DERIVED};

use crate::error::Result;
use crate::sweep::Sweep;

/// How long a thing may stay silent before it is considered down.
pub const DOWN_AFTER_MINUTES: i64 = 5;

const DISPLAY_FORMAT: &str = "%Y-%m-%d %H:%M";

/// Whether a thing is up, and since when.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Liveness {
    /// Heard from recently. `since` is the boot instant when the thing
    /// reported one.
    Up { since: Option<DateTime<Utc>> },
    /// Silent past the threshold.
    Down { last_seen: DateTime<Utc> },
}

/// One thing's liveness at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    /// Canonical thing name.
    pub thing: String,
    /// Alias-decorated name for display.
    pub name: String,
    pub liveness: Liveness,
}

/// Where status reports go.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn publish(&self, report: StatusReport) -> Result<()>;
}

/// Sink that writes reports to the log, down things at error level.
pub struct LogSink;

#[async_trait]
impl StatusSink for LogSink {
    async fn publish(&self, report: StatusReport) -> Result<()> {
        match report.liveness {
            Liveness::Up { since: Some(since) } => {
                info!("{} is up since: {}", report.name, since.format(DISPLAY_FORMAT));
            }
            Liveness::Up { since: None } => {
                info!("{} is up", report.name);
            }
            Liveness::Down { last_seen } => {
                error!(
                    "{} is down. Last seen: {}",
                    report.name,
                    last_seen.format(DISPLAY_FORMAT)
                );
            }
        }
        Ok(())
    }
}

/// Checks every thing's liveness and publishes the verdicts.
pub struct UptimeSweep {
    store: Arc<ShadowStore>,
    sink: Arc<dyn StatusSink>,
}

impl UptimeSweep {
    pub fn new(store: Arc<ShadowStore>, sink: Arc<dyn StatusSink>) -> Self {
        Self { store, sink }
    }

    /// Judge one thing. `None` means it cannot be judged yet.
    fn check_thing(&self, thing: &str, now: DateTime<Utc>) -> Result<Option<StatusReport>> {
        let derived = match self.store.get(thing, DERIVED)? {
            Some(derived) => derived,
            None => {
                warn!("{} has no derived state yet; skipping the check", thing);
                return Ok(None);
            }
        };
        let last_seen = match derived.timestamp() {
            Ok(last_seen) => last_seen,
            Err(e) => {
                warn!("Derived state of {} carries a bad timestamp: {}", thing, e);
                return Ok(None);
            }
        };

        let name = match self.store.alias_of(thing)? {
            Some(alias) => format!("{} ({})", alias, thing),
            None => thing.to_string(),
        };

        let liveness = if now.signed_duration_since(last_seen)
            > Duration::minutes(DOWN_AFTER_MINUTES)
        {
            Liveness::Down { last_seen }
        } else {
            let since = derived
                .state
                .get(BOOT_KEY)
                .and_then(|boot| boot.as_str())
                .and_then(|boot| parse_timestamp(boot).ok());
            Liveness::Up { since }
        };

        Ok(Some(StatusReport {
            thing: thing.to_string(),
            name,
            liveness,
        }))
    }
}

#[async_trait]
impl Sweep for UptimeSweep {
    fn name(&self) -> &str {
        "uptime"
    }

    async fn run(&self) -> Result<()> {
        let now = Utc::now();
        for thing in self.store.things()? {
            let report = match self.check_thing(&thing, now) {
                Ok(Some(report)) => report,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Liveness check for {} failed: {}", thing, e);
                    continue;
                }
            };
            if let Err(e) = self.sink.publish(report).await {
                warn!("Publishing the status of {} failed: {}", thing, e);
            }
        }
        Ok(())
    }
}
