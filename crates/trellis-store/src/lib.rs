//! Filesystem-backed device shadow store.
//!
//! Each thing gets a directory of per-axis JSON documents under the store
//! root. Writes version the superseded document into an append-only,
//! self-archiving history; reads resolve human-friendly aliases first.
//! [`delta`] reconciles what a device last reported against what an
//! operator wants it to run.
//!
//! The store is plain files all the way down so that ordinary tools
//! (`cat`, `grep`, `rsync`) keep working against it.

pub mod alias;
pub mod delta;
pub mod document;
pub mod error;
pub mod history;
pub mod shadow;

pub use alias::{AliasNamespace, ALIAS_DIR};
pub use delta::{compute_delta, dealias};
pub use document::StateDocument;
pub use error::{Error, Result};
pub use history::HOT_RETENTION_DAYS;
pub use shadow::{
    ShadowStore, DERIVED, DESIRED, FORMULAS, LAST_MODIFIED_FILE, REPORTED,
};
