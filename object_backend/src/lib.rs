use std::collections::BTreeMap;

pub mod local;
pub mod memory;

/// Per-object metadata, carried out-of-band next to the payload.
/// Ordered so that serializations of the same map are identical.
pub type ObjectMeta = BTreeMap<String, String>;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("no such object: {0}")]
    NoSuchObject(String),
    #[error("transient backend failure: {0}")]
    Transient(String),
    #[error("malformed object metadata for {0}")]
    BadMeta(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BackendError>;

/// Backend abstract interface over a remote key/value store.
///
/// Implementations declare their consistency guarantees through the
/// capability predicates; callers pick between immediate and
/// retry-until-propagated operation variants accordingly.
pub trait Backend: Send + Sync {
    /// Fetch only the metadata of `key`.
    fn lookup(&self, key: &str) -> Result<ObjectMeta>;
    /// Fetch metadata and payload of `key`.
    fn get(&self, key: &str) -> Result<(ObjectMeta, Vec<u8>)>;
    /// Store `data` under `key`. `is_compressed` records that the payload
    /// has already been run through the compressor.
    fn put(&self, key: &str, data: &[u8], meta: &ObjectMeta, is_compressed: bool) -> Result<()>;
    /// Remove `key`. Fails with `NoSuchObject` if it is not (yet) visible.
    fn delete(&self, key: &str) -> Result<()>;
    /// All keys starting with `prefix`.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;
    /// Remove every object in the bucket.
    fn clear(&self) -> Result<()>;

    fn contains(&self, key: &str) -> Result<bool> {
        match self.lookup(key) {
            Ok(_) => Ok(true),
            Err(BackendError::NoSuchObject(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Server-less copy: fetch `src` and store it again under `dst`.
    fn copy(&self, src: &str, dst: &str) -> Result<()> {
        let (meta, data) = self.get(src)?;
        self.put(dst, &data, &meta, true)
    }

    /// A `get` directly after `put` of a new key returns the object.
    fn read_after_create_consistent(&self) -> bool;
    /// A `get` directly after `delete` fails with `NoSuchObject`.
    fn read_after_delete_consistent(&self) -> bool;
    /// A `list` directly after `delete` no longer shows the key.
    fn list_after_delete_consistent(&self) -> bool;
    /// Two consecutive `get`s of the same key return the same data.
    fn is_get_consistent(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemBackend;

    #[test]
    fn contains_uses_lookup() -> Result<()> {
        let backend = MemBackend::new();
        assert!(!backend.contains("a")?);
        backend.put("a", b"x", &ObjectMeta::new(), false)?;
        assert!(backend.contains("a")?);
        Ok(())
    }

    #[test]
    fn copy_preserves_meta() -> Result<()> {
        let backend = MemBackend::new();
        let mut meta = ObjectMeta::new();
        meta.insert("seq_no".to_string(), "7".to_string());
        backend.put("src", b"payload", &meta, true)?;
        backend.copy("src", "dst")?;
        let (meta2, data) = backend.get("dst")?;
        assert_eq!(meta2.get("seq_no").map(String::as_str), Some("7"));
        assert_eq!(data, b"payload");
        Ok(())
    }
}
