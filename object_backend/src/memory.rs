use crate::{Backend, BackendError, ObjectMeta, Result};
use parking_lot::Mutex;
use std::collections::HashMap;

/// In-memory backend for tests.
///
/// Fully consistent by default. `new_weak()` reports S3-style weak
/// consistency and lets tests inject `NoSuchObject` failures on `delete`
/// to simulate propagation delay.
pub struct MemBackend {
    objects: Mutex<HashMap<String, (ObjectMeta, Vec<u8>)>>,
    consistent: bool,
    delete_failures: Mutex<u32>,
    puts: Mutex<u64>,
}

impl MemBackend {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            consistent: true,
            delete_failures: Mutex::new(0),
            puts: Mutex::new(0),
        }
    }

    pub fn new_weak() -> Self {
        Self { consistent: false, ..Self::new() }
    }

    /// The next `n` deletes of existing keys fail with `NoSuchObject`,
    /// as if the object had not yet propagated.
    pub fn inject_delete_failures(&self, n: u32) {
        *self.delete_failures.lock() = n;
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().len()
    }

    /// Total number of `put` calls, for upload-counting tests.
    pub fn put_count(&self) -> u64 {
        *self.puts.lock()
    }
}

impl Default for MemBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for MemBackend {
    fn lookup(&self, key: &str) -> Result<ObjectMeta> {
        self.objects
            .lock()
            .get(key)
            .map(|(meta, _)| meta.clone())
            .ok_or_else(|| BackendError::NoSuchObject(key.to_string()))
    }

    fn get(&self, key: &str) -> Result<(ObjectMeta, Vec<u8>)> {
        self.objects
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| BackendError::NoSuchObject(key.to_string()))
    }

    fn put(&self, key: &str, data: &[u8], meta: &ObjectMeta, _is_compressed: bool) -> Result<()> {
        *self.puts.lock() += 1;
        self.objects
            .lock()
            .insert(key.to_string(), (meta.clone(), data.to_vec()));
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        {
            let mut failures = self.delete_failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(BackendError::NoSuchObject(key.to_string()));
            }
        }
        self.objects
            .lock()
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| BackendError::NoSuchObject(key.to_string()))
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .objects
            .lock()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn clear(&self) -> Result<()> {
        self.objects.lock().clear();
        Ok(())
    }

    fn read_after_create_consistent(&self) -> bool { self.consistent }
    fn read_after_delete_consistent(&self) -> bool { self.consistent }
    fn list_after_delete_consistent(&self) -> bool { self.consistent }
    fn is_get_consistent(&self) -> bool { self.consistent }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delete_failure_injection() -> Result<()> {
        let backend = MemBackend::new_weak();
        backend.put("k", b"v", &ObjectMeta::new(), false)?;
        backend.inject_delete_failures(2);
        assert!(matches!(backend.delete("k"), Err(BackendError::NoSuchObject(_))));
        assert!(matches!(backend.delete("k"), Err(BackendError::NoSuchObject(_))));
        backend.delete("k")?;
        assert_eq!(backend.object_count(), 0);
        Ok(())
    }

    #[test]
    fn list_filters_by_prefix() -> Result<()> {
        let backend = MemBackend::new();
        backend.put("s3ql_data_1", b"", &ObjectMeta::new(), false)?;
        backend.put("s3ql_data_2", b"", &ObjectMeta::new(), false)?;
        backend.put("s3ql_seq_no_0", b"", &ObjectMeta::new(), false)?;
        assert_eq!(backend.list("s3ql_data_")?.len(), 2);
        assert_eq!(backend.list("s3ql_seq_no_")?.len(), 1);
        Ok(())
    }
}
