//! Human-friendly alias names for things.
//!
//! Aliases live as relative symlinks under `<root>/aliases/`, each pointing
//! at a thing directory one level up. Resolution prefers a real thing
//! directory over an alias of the same name, so an alias can never shadow
//! a thing.

use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{Error, Result};

/// Directory under the store root holding alias symlinks.
pub const ALIAS_DIR: &str = "aliases";

/// The alias namespace of one store root.
pub struct AliasNamespace {
    root: PathBuf,
}

impl AliasNamespace {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn alias_dir(&self) -> PathBuf {
        self.root.join(ALIAS_DIR)
    }

    /// Resolve a name to a canonical thing id. A real thing directory wins
    /// over an alias; an alias resolves only while its target still exists.
    pub fn resolve(&self, name: &str) -> Result<String> {
        if !valid_name(name) {
            return Err(Error::NoSuchThing(name.to_string()));
        }
        if self.root.join(name).is_dir() {
            return Ok(name.to_string());
        }
        let link = self.alias_dir().join(name);
        if let Ok(target) = fs::read_link(&link) {
            if let Some(thing) = file_name_of(&target) {
                if self.root.join(&thing).is_dir() {
                    debug!("Resolved alias {} to {}", name, thing);
                    return Ok(thing);
                }
            }
        }
        Err(Error::NoSuchThing(name.to_string()))
    }

    /// Point `alias` at `thing`, dropping any alias that previously pointed
    /// there. The switch is staged and renamed so a concurrent resolve never
    /// sees a half-written link.
    pub fn rename(&self, thing: &str, alias: &str) -> Result<()> {
        if !self.root.join(thing).is_dir() {
            return Err(Error::NoSuchThing(thing.to_string()));
        }
        if !valid_name(alias) {
            return Err(Error::InvalidPayload(format!("Unusable alias: {}", alias)));
        }
        if self.root.join(alias).is_dir() {
            return Err(Error::ThingExists(alias.to_string()));
        }

        let alias_dir = self.alias_dir();
        fs::create_dir_all(&alias_dir)?;

        for existing in self.aliases_of(thing)? {
            if existing != alias {
                fs::remove_file(alias_dir.join(&existing))?;
                debug!("Dropped alias {} of {}", existing, thing);
            }
        }

        let staged = alias_dir.join(format!(".{}.tmp", alias));
        if staged.symlink_metadata().is_ok() {
            fs::remove_file(&staged)?;
        }
        symlink(Path::new("..").join(thing), &staged)?;
        fs::rename(&staged, alias_dir.join(alias))?;
        info!("Thing {} is now known as {}", thing, alias);
        Ok(())
    }

    /// The alias currently pointing at a thing, if any.
    pub fn alias_of(&self, thing: &str) -> Result<Option<String>> {
        Ok(self.aliases_of(thing)?.into_iter().next())
    }

    fn aliases_of(&self, thing: &str) -> Result<Vec<String>> {
        let alias_dir = self.alias_dir();
        if !alias_dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&alias_dir)? {
            let entry = entry?;
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(_) => continue,
            };
            if name.starts_with('.') {
                continue;
            }
            if let Ok(target) = fs::read_link(entry.path()) {
                if file_name_of(&target).as_deref() == Some(thing) {
                    names.push(name);
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Names double as directory entries, so anything that could escape the
/// store root is refused outright.
fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name != ALIAS_DIR
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn file_name_of(target: &Path) -> Option<String> {
    target.file_name().and_then(|n| n.to_str()).map(String::from)
}
