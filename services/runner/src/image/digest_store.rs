//! Digest Store: the last manifest digest seen for each reference.
//!
//! Each record is one small file under `digests/`, named by the sha256 of the
//! canonical reference string and holding the digest as text. Records are
//! replaced by atomic rename, so concurrent processes never read a torn
//! record. A missing record means "unknown", never an error.

use std::fs;
use std::io;
use std::path::PathBuf;

use tracing::warn;

use super::reference::ImageReference;
use super::store::StoreError;
use crate::cache::{digest_path, sha256_hex, write_atomic, CacheLayout};

#[derive(Debug, Clone)]
pub struct DigestStore {
    dir: PathBuf,
    tmp: PathBuf,
}

impl DigestStore {
    /// Open the store, creating its directories if needed.
    pub fn open(layout: &CacheLayout) -> Result<Self, StoreError> {
        let store = Self {
            dir: layout.digests_dir(),
            tmp: layout.tmp_dir(),
        };
        for dir in [&store.dir, &store.tmp] {
            fs::create_dir_all(dir).map_err(|source| StoreError::Init {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(store)
    }

    fn record_path(&self, reference: &ImageReference) -> PathBuf {
        self.dir.join(sha256_hex(reference.to_string().as_bytes()))
    }

    /// The last digest recorded for `reference`, if any.
    ///
    /// A record that doesn't hold a well-formed digest is ignored.
    pub fn get(&self, reference: &ImageReference) -> Result<Option<String>, StoreError> {
        let path = self.record_path(reference);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let digest = raw.trim();
        if digest_path(&self.dir, digest).is_none() {
            warn!(reference = %reference, path = %path.display(), "Ignoring malformed digest record");
            return Ok(None);
        }
        Ok(Some(digest.to_string()))
    }

    /// Record `digest` as the current digest for `reference`.
    pub fn put(&self, reference: &ImageReference, digest: &str) -> Result<(), StoreError> {
        if digest_path(&self.dir, digest).is_none() {
            return Err(StoreError::InvalidDigest(digest.to_string()));
        }
        write_atomic(&self.tmp, &self.record_path(reference), digest.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(c: char) -> String {
        format!("sha256:{}", c.to_string().repeat(64))
    }

    fn open() -> (tempfile::TempDir, DigestStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = DigestStore::open(&CacheLayout::new(dir.path())).unwrap();
        (dir, store)
    }

    #[test]
    fn test_missing_record_is_none() {
        let (_dir, store) = open();
        let r = ImageReference::parse("registry.example/fn:v1").unwrap();
        assert_eq!(store.get(&r).unwrap(), None);
    }

    #[test]
    fn test_put_then_get_and_overwrite() {
        let (_dir, store) = open();
        let r = ImageReference::parse("registry.example/fn:v1").unwrap();

        store.put(&r, &digest('a')).unwrap();
        assert_eq!(store.get(&r).unwrap(), Some(digest('a')));

        store.put(&r, &digest('b')).unwrap();
        assert_eq!(store.get(&r).unwrap(), Some(digest('b')));
    }

    #[test]
    fn test_records_are_per_reference() {
        let (_dir, store) = open();
        let v1 = ImageReference::parse("registry.example/fn:v1").unwrap();
        let v2 = ImageReference::parse("registry.example/fn:v2").unwrap();

        store.put(&v1, &digest('a')).unwrap();
        assert_eq!(store.get(&v2).unwrap(), None);
    }

    #[test]
    fn test_equivalent_references_share_a_record() {
        let (_dir, store) = open();
        let short = ImageReference::parse("alpine").unwrap();
        let long = ImageReference::parse("docker.io/library/alpine:latest").unwrap();

        store.put(&short, &digest('c')).unwrap();
        assert_eq!(store.get(&long).unwrap(), Some(digest('c')));
    }

    #[test]
    fn test_malformed_record_is_ignored() {
        let (_dir, store) = open();
        let r = ImageReference::parse("registry.example/fn:v1").unwrap();
        fs::write(store.record_path(&r), "garbage").unwrap();
        assert_eq!(store.get(&r).unwrap(), None);
    }

    #[test]
    fn test_put_rejects_malformed_digest() {
        let (_dir, store) = open();
        let r = ImageReference::parse("registry.example/fn:v1").unwrap();
        assert!(matches!(
            store.put(&r, "sha256:short"),
            Err(StoreError::InvalidDigest(_))
        ));
    }
}
