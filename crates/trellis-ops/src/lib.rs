//! Operational layer over the shadow store.
//!
//! Two halves: the [`operator`] answers pub/sub traffic from devices
//! (updates in, deltas out, errors on a dedicated topic), and the periodic
//! [`sweep`]s keep the store healthy in the background (deriving display
//! values, watching liveness, pushing a replica). Transports stay outside;
//! everything here works in terms of topics, payloads and sinks.

pub mod derive;
pub mod error;
pub mod operator;
pub mod replica;
pub mod sweep;
pub mod uptime;

pub use derive::DeriveSweep;
pub use error::{Error, Result};
pub use operator::{
    Answer, Operator, DELTA_FAILED, ERROR_TOPIC, MESSAGE_NOT_HANDLED, MESSAGE_NOT_JSON,
    WRONG_FORMAT_REPORTED_DESIRED, WRONG_FORMAT_STATE,
};
pub use replica::{
    ReplicaOutcome, ReplicaSweep, ReplicaTransport, RsyncTransport, VANISHED_FILES_EXIT,
};
pub use sweep::{
    Sweep, SweepScheduler, DERIVE_SWEEP_SECS, REPLICA_SWEEP_SECS, UPTIME_SWEEP_SECS,
};
pub use uptime::{
    Liveness, LogSink, StatusReport, StatusSink, UptimeSweep, DOWN_AFTER_MINUTES,
};
