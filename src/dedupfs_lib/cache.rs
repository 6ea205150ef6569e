/// On-disk cache of open block files, keyed by (inode, blockno).
///
/// A clean entry lives at `<ino>_<blockno>`, a dirty one at
/// `<ino>_<blockno>.d`. The rename back to the committed name is the
/// atomic commit point after a successful upload.
use crate::dedupfs_lib::errors::Result;
use crate::dedupfs_lib::BlockKey;
use log::*;
use lru::LruCache;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub struct CacheEntry {
    pub inode: i64,
    pub blockno: u64,
    file: File,
    /// Committed path; the dirty twin is this plus ".d".
    path: PathBuf,
    pub size: u64,
    pub dirty: bool,
    pub modified_after_upload: bool,
    /// Bound block, none while the entry awaits first content assignment.
    pub block_id: Option<i64>,
}

impl CacheEntry {
    /// Write `data` to a fresh cache file and open it read/write.
    pub fn create(
        cachedir: &Path,
        inode: i64,
        blockno: u64,
        data: &[u8],
        block_id: Option<i64>,
    ) -> Result<Self> {
        let path = cachedir.join(format!("{}_{}", inode, blockno));
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.write_all(data)?;
        Ok(Self {
            inode,
            blockno,
            file,
            path,
            size: data.len() as u64,
            dirty: false,
            modified_after_upload: false,
            block_id,
        })
    }

    pub fn key(&self) -> BlockKey {
        (self.inode, self.blockno)
    }

    fn dirty_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".d");
        PathBuf::from(name)
    }

    /// Move the file to its `.d` name before the first write.
    pub fn mark_dirty(&mut self) -> Result<()> {
        if !self.dirty {
            std::fs::rename(&self.path, self.dirty_path())?;
            self.dirty = true;
        }
        Ok(())
    }

    /// Commit the upload: rename `.d` back to the clean name. A missing
    /// file means the entry was removed while uploading and is fine.
    pub fn commit(&mut self) -> Result<()> {
        self.dirty = false;
        self.modified_after_upload = false;
        match std::fs::rename(self.dirty_path(), &self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Independent handle on the dirty file, so the compress stage can
    /// read without disturbing this entry's cursor.
    pub fn reopen_dirty(&self) -> Result<File> {
        Ok(OpenOptions::new().read(true).open(self.dirty_path())?)
    }

    /// Read up to `len` bytes at `offset`; short at end of file.
    pub fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        if offset >= self.size {
            return Ok(vec![]);
        }
        let n = len.min((self.size - offset) as usize);
        self.file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; n];
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        self.size = self.size.max(offset + data.len() as u64);
        Ok(())
    }

    pub fn truncate_to(&mut self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        self.size = len;
        Ok(())
    }

    pub fn fsync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Remove both file names from disk; missing names are ignored.
    pub fn unlink_files(&self) {
        for path in [self.dirty_path(), self.path.clone()] {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != ErrorKind::NotFound {
                    warn!("could not remove cache file {:?}: {}", path, e);
                }
            }
        }
    }
}

pub struct BlockCache {
    entries: LruCache<BlockKey, CacheEntry>,
    pub max_size: u64,
    pub used: u64,
}

impl BlockCache {
    pub fn new(max_size: u64) -> Self {
        Self {
            entries: LruCache::unbounded(),
            max_size,
            used: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &BlockKey) -> bool {
        self.entries.contains(key)
    }

    /// Fetch and touch (moves the entry to most-recently-used).
    pub fn get_mut(&mut self, key: &BlockKey) -> Option<&mut CacheEntry> {
        self.entries.get_mut(key)
    }

    /// Fetch without touching; used by background workers.
    pub fn peek_mut(&mut self, key: &BlockKey) -> Option<&mut CacheEntry> {
        self.entries.peek_mut(key)
    }

    pub fn insert(&mut self, entry: CacheEntry) {
        self.used += entry.size;
        if let Some(old) = self.entries.put(entry.key(), entry) {
            self.used -= old.size;
        }
    }

    /// Drop an entry from the map without touching its files.
    pub fn remove(&mut self, key: &BlockKey) -> Option<CacheEntry> {
        let entry = self.entries.pop(key);
        if let Some(e) = &entry {
            self.used -= e.size;
        }
        entry
    }

    /// Caller grew or shrank an entry in place.
    pub fn note_size_change(&mut self, old: u64, new: u64) {
        self.used = self.used + new - old;
    }

    /// Keys in least-recently-used-first order.
    pub fn lru_keys(&self) -> Vec<BlockKey> {
        let mut keys: Vec<BlockKey> = self.entries.iter().map(|(k, _)| *k).collect();
        keys.reverse();
        keys
    }

    pub fn keys_of_inode(&self, inode: i64) -> Vec<BlockKey> {
        self.entries
            .iter()
            .map(|(k, _)| *k)
            .filter(|(ino, _)| *ino == inode)
            .collect()
    }

    pub fn dirty_keys_of_inode(&self, inode: i64) -> Vec<BlockKey> {
        self.entries
            .iter()
            .filter(|((ino, _), e)| *ino == inode && e.dirty)
            .map(|(k, _)| *k)
            .collect()
    }

    pub fn dirty_keys(&self) -> Vec<BlockKey> {
        self.entries
            .iter()
            .filter(|(_, e)| e.dirty)
            .map(|(k, _)| *k)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn dirty_commit_cycle() -> Result<()> {
        let dir = TempDir::new()?;
        let mut entry = CacheEntry::create(dir.path(), 2, 0, b"abc", None)?;
        assert!(!entry.dirty);
        assert!(dir.path().join("2_0").exists());

        entry.mark_dirty()?;
        assert!(entry.dirty);
        assert!(dir.path().join("2_0.d").exists());
        assert!(!dir.path().join("2_0").exists());

        entry.write_at(3, b"def")?;
        assert_eq!(entry.size, 6);
        assert_eq!(entry.read_at(0, 16)?, b"abcdef");

        entry.commit()?;
        assert!(!entry.dirty);
        assert!(dir.path().join("2_0").exists());
        Ok(())
    }

    #[test]
    fn commit_tolerates_removed_entry() -> Result<()> {
        let dir = TempDir::new()?;
        let mut entry = CacheEntry::create(dir.path(), 2, 1, b"abc", None)?;
        entry.mark_dirty()?;
        entry.unlink_files();
        entry.commit()?;
        Ok(())
    }

    #[test]
    fn lru_order_and_accounting() -> Result<()> {
        let dir = TempDir::new()?;
        let mut cache = BlockCache::new(1024);
        cache.insert(CacheEntry::create(dir.path(), 2, 0, b"aa", None)?);
        cache.insert(CacheEntry::create(dir.path(), 2, 1, b"bbb", None)?);
        cache.insert(CacheEntry::create(dir.path(), 3, 0, b"c", None)?);
        assert_eq!(cache.used, 6);

        // Touch (2, 0) so (2, 1) becomes the eviction candidate
        cache.get_mut(&(2, 0)).unwrap();
        assert_eq!(cache.lru_keys()[0], (2, 1));

        assert_eq!(cache.keys_of_inode(2).len(), 2);
        cache.remove(&(2, 1)).unwrap();
        assert_eq!(cache.used, 3);
        Ok(())
    }
}
