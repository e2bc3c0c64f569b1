//! The shadow store: one directory per thing, one JSON document per axis.
//!
//! A thing directory holds `<axis>.json` documents (pretty-printed), a
//! `history/` tree of superseded documents, and optionally a set of
//! symlinked static view files. Writes archive the superseded document
//! before replacing it, stamp the new one, and touch the store-wide
//! last-modified marker. All writes to one thing serialize on a per-thing
//! lock; readers only ever see fully renamed-in files.

use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use trellis_codec::{explode, format_timestamp, parse_timestamp, PreviousState};

use crate::alias::{AliasNamespace, ALIAS_DIR};
use crate::document::StateDocument;
use crate::error::{Error, Result};
use crate::history;

/// Axis holding device-originated truth.
pub const REPORTED: &str = "reported";
/// Axis holding operator-originated target configuration.
pub const DESIRED: &str = "desired";
/// Axis holding per-thing derivation formulas.
pub const FORMULAS: &str = "formulas";
/// Axis the derived-value sweep writes its augmented copy to.
pub const DERIVED: &str = "derived";

/// Store-root file stamped after every successful write.
pub const LAST_MODIFIED_FILE: &str = "last-modified.txt";

/// Flag file queueing a thing for the next derived-value sweep.
const DERIVE_PENDING_FLAG: &str = ".derive-pending";

/// A store of device shadows rooted at one directory.
pub struct ShadowStore {
    root: PathBuf,
    aliases: AliasNamespace,
    view_dir: Option<PathBuf>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ShadowStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            aliases: AliasNamespace::new(root.clone()),
            root,
            view_dir: None,
            locks: DashMap::new(),
        })
    }

    /// Link the files of this directory into every newly created thing, so
    /// a static file server can expose a per-thing view page.
    pub fn with_view_dir(mut self, view_dir: impl Into<PathBuf>) -> Self {
        self.view_dir = Some(view_dir.into());
        self
    }

    /// The store root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Provision a new thing directory. Fails if the id is already taken.
    pub fn create_thing(&self, thing: &str) -> Result<()> {
        let dir = self.thing_dir(thing);
        if dir.exists() {
            return Err(Error::ThingExists(thing.to_string()));
        }
        fs::create_dir_all(&dir)?;
        if let Some(view_dir) = &self.view_dir {
            if let Err(e) = link_view_files(view_dir, &dir) {
                warn!("Could not link view files for {}: {}", thing, e);
            }
        }
        info!("Created thing {}", thing);
        Ok(())
    }

    /// Resolve a name to a canonical thing id.
    pub fn resolve(&self, name: &str) -> Result<String> {
        self.aliases.resolve(name)
    }

    /// Point `alias` at a thing, replacing any alias it had before.
    pub fn rename_thing(&self, thing: &str, alias: &str) -> Result<()> {
        let canonical = self.resolve(thing)?;
        self.aliases.rename(&canonical, alias)
    }

    /// The alias currently decorating a thing, if any.
    pub fn alias_of(&self, thing: &str) -> Result<Option<String>> {
        self.aliases.alias_of(thing)
    }

    /// Canonical ids of every thing in the store, sorted.
    pub fn things(&self) -> Result<Vec<String>> {
        let mut things = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(_) => continue,
            };
            if name == ALIAS_DIR || name.starts_with('.') {
                continue;
            }
            things.push(name);
        }
        things.sort();
        Ok(things)
    }

    /// The current document for `(thing, axis)`, or `None` before the
    /// first write.
    pub fn get(&self, thing: &str, axis: &str) -> Result<Option<StateDocument>> {
        let canonical = self.resolve(thing)?;
        self.read_document(&canonical, axis)
    }

    /// Replace the current document for `(thing, axis)`, archiving the one
    /// it supersedes. The thing must already exist.
    pub fn put(&self, thing: &str, axis: &str, payload: &Value) -> Result<()> {
        validate_axis(axis)?;
        validate_payload(payload, axis == DESIRED)?;
        let canonical = self.resolve(thing)?;
        let lock = self.lock(&canonical);
        let _guard = lock.lock();
        self.put_locked(&canonical, axis, payload.clone(), Utc::now())?;
        self.touch_last_modified()
    }

    /// Intake path for device reports. Resolves the thing, creating it on
    /// first contact; explodes the payload against the previous document;
    /// archives and replaces `reported`; and seeds `desired` from the
    /// reported config when no desired document exists yet.
    pub fn update_reported(&self, thing: &str, payload: &Value) -> Result<()> {
        validate_payload(payload, false)?;
        let canonical = match self.resolve(thing) {
            Ok(canonical) => canonical,
            Err(Error::NoSuchThing(_)) => {
                info!("First contact from {}", thing);
                self.create_thing(thing)?;
                thing.to_string()
            }
            Err(e) => return Err(e),
        };

        let lock = self.lock(&canonical);
        let _guard = lock.lock();

        let now = Utc::now();
        let previous = self.read_document(&canonical, REPORTED)?;
        let exploded = match &previous {
            Some(previous_document) => match previous_document.timestamp() {
                Ok(taken_at) => explode(
                    payload,
                    Some(PreviousState {
                        payload: &previous_document.state,
                        taken_at,
                    }),
                    now,
                ),
                Err(e) => {
                    warn!(
                        "Previous reported timestamp for {} does not parse: {}",
                        canonical, e
                    );
                    explode(payload, None, now)
                }
            },
            None => explode(payload, None, now),
        };

        self.put_locked(&canonical, REPORTED, exploded.clone(), now)?;

        if !document_path(&self.thing_dir(&canonical), DESIRED).exists() {
            let seed = exploded
                .get("config")
                .cloned()
                .unwrap_or_else(|| Value::Object(Map::new()));
            self.put_locked(&canonical, DESIRED, seed, now)?;
            info!("Seeded desired state for {} from its reported config", canonical);
        }

        self.mark_derive_pending(&canonical)?;
        self.touch_last_modified()
    }

    /// Replace the desired configuration. Unlike a report, this never
    /// creates the thing.
    pub fn update_desired(&self, thing: &str, payload: &Value) -> Result<()> {
        self.put(thing, DESIRED, payload)
    }

    /// Write a document without archiving, restamping, or touching the
    /// last-modified marker. Derived-value sweeps use this: their output is
    /// recomputed from `reported`, not versioned alongside it.
    pub fn write_snapshot(&self, thing: &str, axis: &str, document: &StateDocument) -> Result<()> {
        validate_axis(axis)?;
        let canonical = self.resolve(thing)?;
        let lock = self.lock(&canonical);
        let _guard = lock.lock();
        let dir = self.thing_dir(&canonical);
        write_atomic(&dir, &format!("{}.json", axis), &document.to_pretty()?)
    }

    /// Everything stored for `(thing, axis)` over the last `since_days`
    /// days: day archives, hot logs, and the current document, sorted
    /// ascending by timestamp.
    pub fn load_history(
        &self,
        thing: &str,
        axis: &str,
        since_days: i64,
    ) -> Result<Vec<StateDocument>> {
        let canonical = self.resolve(thing)?;
        let now = Utc::now();
        let cutoff = now - Duration::days(since_days);

        let mut documents = history::load(&self.thing_dir(&canonical), axis, since_days, now)?;
        if let Some(current) = self.read_document(&canonical, axis)? {
            documents.push(current);
        }

        let mut stamped = Vec::with_capacity(documents.len());
        for document in documents {
            match document.timestamp() {
                Ok(taken_at) if taken_at >= cutoff => stamped.push((taken_at, document)),
                Ok(_) => {}
                Err(e) => debug!("Dropping history entry with an unreadable timestamp: {}", e),
            }
        }
        stamped.sort_by_key(|(taken_at, _)| *taken_at);
        Ok(stamped.into_iter().map(|(_, document)| document).collect())
    }

    /// Instant of the most recent write anywhere in the store.
    pub fn last_modified(&self) -> Result<Option<DateTime<Utc>>> {
        let raw = match fs::read_to_string(self.root.join(LAST_MODIFIED_FILE)) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match parse_timestamp(raw.trim()) {
            Ok(at) => Ok(Some(at)),
            Err(e) => {
                warn!("Last-modified stamp does not parse: {}", e);
                Ok(None)
            }
        }
    }

    /// Queue a thing for the next derived-value sweep.
    pub fn mark_derive_pending(&self, thing: &str) -> Result<()> {
        fs::write(self.thing_dir(thing).join(DERIVE_PENDING_FLAG), b"")?;
        Ok(())
    }

    /// Consume a thing's derive-pending flag, reporting whether it was set.
    pub fn take_derive_pending(&self, thing: &str) -> Result<bool> {
        match fs::remove_file(self.thing_dir(thing).join(DERIVE_PENDING_FLAG)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn thing_dir(&self, canonical: &str) -> PathBuf {
        self.root.join(canonical)
    }

    fn lock(&self, canonical: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(canonical.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn read_document(&self, canonical: &str, axis: &str) -> Result<Option<StateDocument>> {
        let path = document_path(&self.thing_dir(canonical), axis);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No {} document for {} yet", axis, canonical);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Some(StateDocument::parse(&raw)?))
    }

    /// Archive the current document, then swap in the new one. Caller holds
    /// the thing lock.
    fn put_locked(
        &self,
        canonical: &str,
        axis: &str,
        payload: Value,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let dir = self.thing_dir(canonical);
        self.archive_current(&dir, canonical, axis, at)?;
        let document = StateDocument::wrap(payload, at);
        write_atomic(&dir, &format!("{}.json", axis), &document.to_pretty()?)
    }

    fn archive_current(
        &self,
        dir: &Path,
        canonical: &str,
        axis: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let raw = match fs::read_to_string(document_path(dir, axis)) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        match StateDocument::parse(&raw) {
            Ok(document) => {
                history::append(dir, axis, &document.to_compact()?, at.date_naive())?;
            }
            Err(e) => {
                // An unreadable document must not wedge the write path.
                warn!(
                    "Superseded {} document for {} does not parse, not archiving it: {}",
                    axis, canonical, e
                );
            }
        }
        Ok(())
    }

    fn touch_last_modified(&self) -> Result<()> {
        write_atomic(&self.root, LAST_MODIFIED_FILE, &format_timestamp(Utc::now()))
    }
}

fn document_path(thing_dir: &Path, axis: &str) -> PathBuf {
    thing_dir.join(format!("{}.json", axis))
}

/// Temp-write then rename, so a reader never observes a torn document.
fn write_atomic(dir: &Path, file_name: &str, contents: &str) -> Result<()> {
    let staged = dir.join(format!(".{}.tmp", file_name));
    fs::write(&staged, contents)?;
    fs::rename(&staged, dir.join(file_name))?;
    Ok(())
}

fn link_view_files(view_dir: &Path, thing_dir: &Path) -> Result<()> {
    for entry in fs::read_dir(view_dir)? {
        let entry = entry?;
        if !entry.path().is_file() {
            continue;
        }
        let target = fs::canonicalize(entry.path())?;
        let link = thing_dir.join(entry.file_name());
        if link.symlink_metadata().is_ok() {
            continue;
        }
        symlink(&target, &link)?;
    }
    Ok(())
}

/// Payloads are bare mappings; the `state` wrapper is the store's to add.
/// Desired documents hold config contents directly, so a nested `config`
/// key there means the caller double-wrapped.
fn validate_payload(payload: &Value, desired: bool) -> Result<()> {
    let map = match payload {
        Value::Object(map) => map,
        other => {
            return Err(Error::InvalidPayload(format!(
                "Expected a mapping, got: {}",
                other
            )))
        }
    };
    if map.contains_key("state") {
        return Err(Error::InvalidPayload(
            "The state wrapper is added by the store, not the caller".to_string(),
        ));
    }
    if desired && map.contains_key("config") {
        return Err(Error::InvalidPayload(
            "Desired documents hold config contents directly".to_string(),
        ));
    }
    Ok(())
}

/// Axis names become file names, so anything path-like is refused.
fn validate_axis(axis: &str) -> Result<()> {
    if axis.is_empty() || !axis.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(Error::InvalidPayload(format!("Unusable axis name: {}", axis)));
    }
    Ok(())
}
