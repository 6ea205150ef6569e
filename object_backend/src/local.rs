use crate::{Backend, BackendError, ObjectMeta, Result};
use log::*;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Backend that keeps one file per object in a local directory.
///
/// The payload of key `k` lives in `<root>/<escaped k>.dat`, its metadata
/// in `<root>/<escaped k>.meta` (JSON). Local filesystems are fully
/// consistent, so all capability predicates answer `true`.
pub struct LocalBackend {
    root: PathBuf,
}

/// Escape everything outside `[A-Za-z0-9._-]` so any key maps to a safe
/// file name. `%` itself is escaped, making the mapping reversible.
fn escape(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'-' => out.push(b as char),
            _ => out.push_str(&format!("%{:02x}", b)),
        }
    }
    out
}

fn unescape(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

impl LocalBackend {
    pub fn new(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)?;
        Ok(Self { root: root.to_path_buf() })
    }

    fn data_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.dat", escape(key)))
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.meta", escape(key)))
    }

    fn read_meta(&self, key: &str) -> Result<ObjectMeta> {
        match fs::read(self.meta_path(key)) {
            Ok(raw) => serde_json::from_slice(&raw)
                .map_err(|_| BackendError::BadMeta(key.to_string())),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(BackendError::NoSuchObject(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Backend for LocalBackend {
    fn lookup(&self, key: &str) -> Result<ObjectMeta> {
        self.read_meta(key)
    }

    fn get(&self, key: &str) -> Result<(ObjectMeta, Vec<u8>)> {
        let meta = self.read_meta(key)?;
        let data = fs::read(self.data_path(key))?;
        Ok((meta, data))
    }

    fn put(&self, key: &str, data: &[u8], meta: &ObjectMeta, _is_compressed: bool) -> Result<()> {
        debug!("local put: {} ({} bytes)", key, data.len());
        // Write through a temp name so a crash never leaves a torn object
        let tmp = self.root.join(format!("{}.tmp", escape(key)));
        fs::write(&tmp, data)?;
        fs::rename(&tmp, self.data_path(key))?;
        let raw = serde_json::to_vec(meta).expect("meta serializes");
        fs::write(&tmp, raw)?;
        fs::rename(&tmp, self.meta_path(key))?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        for path in [self.meta_path(key), self.data_path(key)] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    return Err(BackendError::NoSuchObject(key.to_string()));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = vec![];
        for entry in fs::read_dir(&self.root)? {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name.strip_suffix(".dat") {
                if let Some(key) = unescape(stem) {
                    if key.starts_with(prefix) {
                        keys.push(key);
                    }
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn clear(&self) -> Result<()> {
        for key in self.list("")? {
            self.delete(&key)?;
        }
        Ok(())
    }

    fn read_after_create_consistent(&self) -> bool { true }
    fn read_after_delete_consistent(&self) -> bool { true }
    fn list_after_delete_consistent(&self) -> bool { true }
    fn is_get_consistent(&self) -> bool { true }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_round_trip() {
        for key in ["s3ql_data_42", "s3ql_metadata", "a/b c%d"] {
            assert_eq!(unescape(&escape(key)).as_deref(), Some(key));
        }
    }

    #[test]
    fn put_get_delete() -> Result<()> {
        let dir = std::env::temp_dir().join(format!("object_backend_test_{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        let backend = LocalBackend::new(&dir)?;
        let mut meta = ObjectMeta::new();
        meta.insert("label".to_string(), "test".to_string());
        backend.put("s3ql_data_1", b"hello", &meta, false)?;
        let (meta2, data) = backend.get("s3ql_data_1")?;
        assert_eq!(data, b"hello");
        assert_eq!(meta2, meta);
        assert_eq!(backend.list("s3ql_data_")?, vec!["s3ql_data_1".to_string()]);
        backend.delete("s3ql_data_1")?;
        assert!(matches!(backend.get("s3ql_data_1"), Err(BackendError::NoSuchObject(_))));
        fs::remove_dir_all(&dir).ok();
        Ok(())
    }
}
