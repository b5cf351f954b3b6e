//! Content-addressed resource storage for the deployment server.
//!
//! Every blob lives under a single flat directory and is named
//! `ORIGINAL_NAME#VERSION#HASH8`, where `HASH8` is the first eight lowercase
//! hex digits of the SHA-256 of the content. Identical bytes always produce
//! the identical name, so deduplication falls out of the naming scheme and
//! files are never rewritten once present.

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, info};

/// First eight hex digits of `sha256("")`, reserved as the canonical
/// "no resource" placeholder.
pub const EMPTY_CONTENT_HASH: &str = "e3b0c442";

const HASH_PREFIX_LEN: usize = 8;
const NAME_SEPARATOR: char = '#';

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("resource `{0}` not found")]
    NotFound(String),
    #[error("malformed resource name `{name}`: {reason}")]
    MalformedName { name: String, reason: &'static str },
    #[error("resource `{0}` already exists with different content")]
    HashCollision(String),
    #[error("`{0}` may not contain `#`")]
    ReservedCharacter(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parsed form of a resource filename.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResourceName {
    original_name: String,
    version: String,
    hash8: String,
}

impl ResourceName {
    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        let malformed = |reason| StoreError::MalformedName {
            name: raw.to_string(),
            reason,
        };
        let (rest, hash8) = raw
            .rsplit_once(NAME_SEPARATOR)
            .ok_or_else(|| malformed("expected NAME#VERSION#HASH8"))?;
        let (original_name, version) = rest
            .rsplit_once(NAME_SEPARATOR)
            .ok_or_else(|| malformed("expected NAME#VERSION#HASH8"))?;
        if original_name.is_empty() || original_name.contains(NAME_SEPARATOR) {
            return Err(malformed("bad original name"));
        }
        if hash8.len() != HASH_PREFIX_LEN
            || !hash8.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        {
            return Err(malformed("hash suffix must be 8 lowercase hex digits"));
        }
        Ok(Self {
            original_name: original_name.to_string(),
            version: version.to_string(),
            hash8: hash8.to_string(),
        })
    }

    pub fn original_name(&self) -> &str {
        &self.original_name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn hash8(&self) -> &str {
        &self.hash8
    }

    /// Whether this name carries the reserved empty-content hash.
    pub fn is_placeholder(&self) -> bool {
        self.hash8 == EMPTY_CONTENT_HASH
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{sep}{}{sep}{}",
            self.original_name,
            self.version,
            self.hash8,
            sep = NAME_SEPARATOR
        )
    }
}

pub fn content_hash8(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    let digest = hex::encode(hasher.finalize());
    digest[..HASH_PREFIX_LEN].to_string()
}

/// Flat directory of immutable, content-addressed blobs.
#[derive(Clone, Debug)]
pub struct ResourceStore {
    dir: PathBuf,
}

impl ResourceStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ensure_dir(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    /// Stores `content` under its content-addressed name. Adding identical
    /// bytes twice is a no-op on the second call and returns the same name.
    pub fn add(
        &self,
        content: &[u8],
        original_name: &str,
        version: &str,
    ) -> Result<ResourceName, StoreError> {
        for component in [original_name, version] {
            if component.contains(NAME_SEPARATOR) {
                return Err(StoreError::ReservedCharacter(component.to_string()));
            }
        }
        if original_name.is_empty() {
            return Err(StoreError::ReservedCharacter(String::new()));
        }
        let name = ResourceName {
            original_name: original_name.to_string(),
            version: version.to_string(),
            hash8: content_hash8(content),
        };
        let dst = self.dir.join(name.to_string());
        if dst.exists() {
            if fs::read(&dst)? == content {
                debug!(target: "fab::store", resource = %name, "resource already present");
                return Ok(name);
            }
            return Err(StoreError::HashCollision(name.to_string()));
        }
        fs::create_dir_all(&self.dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(content)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&dst).map_err(|err| err.error)?;
        info!(target: "fab::store", resource = %name, bytes = content.len(), "resource added");
        Ok(name)
    }

    /// Resolves a resource name to its on-disk path. With `must_exist`, a
    /// missing blob is a `NotFound` error; otherwise the would-be path is
    /// returned unchecked.
    pub fn path_of(&self, name: &str, must_exist: bool) -> Result<PathBuf, StoreError> {
        let parsed = ResourceName::parse(name)?;
        let path = self.dir.join(parsed.to_string());
        if must_exist && !path.is_file() {
            return Err(StoreError::NotFound(name.to_string()));
        }
        Ok(path)
    }

    pub fn read(&self, name: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.path_of(name, true)?;
        Ok(fs::read(path)?)
    }

    pub fn contains(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.path_of(name, false)?.is_file())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, ResourceStore) {
        let dir = tempdir().unwrap();
        let store = ResourceStore::new(dir.path().join("resources"));
        store.ensure_dir().unwrap();
        (dir, store)
    }

    #[test]
    fn add_is_idempotent_and_deduplicates() {
        let (_tmp, store) = store();
        let first = store.add(b"bundle bits", "toolkit.tar", "1.0").unwrap();
        let second = store.add(b"bundle bits", "toolkit.tar", "1.0").unwrap();
        assert_eq!(first, second);

        let entries = fs::read_dir(store.dir()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn identical_content_yields_identical_hash_suffix() {
        let (_tmp, store) = store();
        let a = store.add(b"same", "a.img", "").unwrap();
        let b = store.add(b"same", "b.img", "2").unwrap();
        assert_eq!(a.hash8(), b.hash8());
        assert_ne!(a.to_string(), b.to_string());
    }

    #[test]
    fn same_name_different_content_is_a_collision() {
        let (_tmp, store) = store();
        let name = store.add(b"payload", "fw.bin", "3").unwrap();
        // Force a forged file under the same name with different bytes.
        fs::write(store.dir().join(name.to_string()), b"tampered").unwrap();
        let err = store.add(b"payload", "fw.bin", "3").unwrap_err();
        assert!(matches!(err, StoreError::HashCollision(_)));
    }

    #[test]
    fn parse_then_display_round_trips() {
        for raw in [
            "toolkit.tar#1.2.3#0011aabb",
            "fab.json##e3b0c442",
            "hwid#spring_v2#deadbeef",
        ] {
            let parsed = ResourceName::parse(raw).unwrap();
            assert_eq!(parsed.to_string(), raw);
        }
    }

    #[test]
    fn parse_rejects_malformed_names() {
        for raw in [
            "noseparator",
            "only#one",
            "name#ver#SHORT",
            "name#ver#UPPERHEX0",
            "name#ver#g0000000",
            "name#ver#123456789",
            "#ver#00112233",
        ] {
            assert!(
                matches!(
                    ResourceName::parse(raw),
                    Err(StoreError::MalformedName { .. })
                ),
                "expected malformed: {raw}"
            );
        }
    }

    #[test]
    fn reserved_separator_rejected_in_components() {
        let (_tmp, store) = store();
        assert!(matches!(
            store.add(b"x", "bad#name", ""),
            Err(StoreError::ReservedCharacter(_))
        ));
        assert!(matches!(
            store.add(b"x", "ok", "bad#version"),
            Err(StoreError::ReservedCharacter(_))
        ));
    }

    #[test]
    fn path_of_honours_must_exist() {
        let (_tmp, store) = store();
        let name = store.add(b"blob", "img", "").unwrap();
        assert!(store.path_of(&name.to_string(), true).is_ok());

        let missing = "ghost#1#00112233";
        assert!(matches!(
            store.path_of(missing, true),
            Err(StoreError::NotFound(_))
        ));
        // Unchecked resolution still yields the would-be path.
        let path = store.path_of(missing, false).unwrap();
        assert_eq!(path, store.dir().join(missing));
    }

    #[test]
    fn empty_content_matches_reserved_hash() {
        let (_tmp, store) = store();
        let name = store.add(b"", "placeholder.json", "").unwrap();
        assert_eq!(name.hash8(), EMPTY_CONTENT_HASH);
        assert!(name.is_placeholder());
    }

    #[test]
    fn read_returns_stored_bytes() {
        let (_tmp, store) = store();
        let name = store.add(b"exact bytes", "blob", "v").unwrap();
        assert_eq!(store.read(&name.to_string()).unwrap(), b"exact bytes");
    }
}
