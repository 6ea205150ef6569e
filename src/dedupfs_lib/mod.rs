/// Block management core of the filesystem.
use object_backend::Backend;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub mod cache;
pub mod commit;
pub mod db;
pub mod errors;
pub mod fs;
pub mod fsck;
pub mod threads;
pub mod upload;
pub mod utils;

use self::cache::BlockCache;
use self::db::MetaDb;
use self::errors::{FsError, Result};
use self::upload::UploadManager;

/// Filesystem format revision; mounting refuses on mismatch.
pub const CURRENT_FS_REV: u32 = 1;
pub const ROOT_INODE: i64 = 1;

pub const MAX_UPLOAD_THREADS: usize = 10;
pub const MAX_COMPRESS_THREADS: usize = 1;
pub const MAX_REMOVAL_THREADS: usize = 20;
/// Above this many bytes in transit, new uploads are admitted to at most
/// two parallel upload threads.
pub const MIN_TRANSIT_SIZE: u64 = 1024 * 1024;
/// Wall-clock bound for retrying against propagation delays.
pub const RETRY_TIMEOUT: Duration = Duration::from_secs(300);
/// Rotated `s3ql_metadata_bak_<n>` generations kept on the backend.
pub const METADATA_BACKUPS: u32 = 3;
pub const DEFAULT_CACHE_SIZE: u64 = 100 * 1024 * 1024;
/// Inode ids at or above this trigger renumbering during fsck.
pub const MAX_INODE_BEFORE_RENUMBER: i64 = 1 << 31;

pub const METADATA_KEY: &str = "s3ql_metadata";
pub const PASSPHRASE_KEY: &str = "s3ql_passphrase";
pub const DATA_KEY_PREFIX: &str = "s3ql_data_";
pub const SEQNO_KEY_PREFIX: &str = "s3ql_seq_no_";
pub const BAK_KEY_PREFIX: &str = "s3ql_metadata_bak_";

/// Cache and transit entries are addressed by (inode, blockno).
pub type BlockKey = (i64, u64);

/// Everything the global lock protects: metadata database, block cache
/// state, and in-transit accounting. Worker threads lock it only at
/// publish/retract points.
pub struct FsState {
    pub db: MetaDb,
    pub cache: BlockCache,
    pub blocksize: u64,
    pub in_transit: HashSet<BlockKey>,
    pub transit_size: u64,
    pub encountered_errors: bool,
    pub embedded_errors: Vec<String>,
}

impl FsState {
    /// Flag the filesystem as needing fsck. Failure to write the flag is
    /// ignored: we are already on an error path.
    pub fn mark_damaged(&mut self) {
        self.encountered_errors = true;
        if let Err(e) = self.db.execute("UPDATE parameters SET needs_fsck = 1", []) {
            log::error!("could not set needs_fsck flag: {}", e);
        }
    }
}

#[derive(Clone)]
pub struct DedupFs {
    pub state: Arc<Mutex<FsState>>,
    pub backend: Arc<dyn Backend>,
    pub um: Arc<UploadManager>,
    pub cachedir: PathBuf,
}

impl DedupFs {
    /// Assemble a filesystem from already initialized parts. `mount` is
    /// the entry point for real use; tests construct directly.
    pub fn with_parts(
        db: MetaDb,
        backend: Arc<dyn Backend>,
        cachedir: PathBuf,
        blocksize: u64,
        cache_size: u64,
    ) -> Result<Self> {
        std::fs::create_dir_all(&cachedir)?;
        let state = Arc::new(Mutex::new(FsState {
            db,
            cache: BlockCache::new(cache_size),
            blocksize,
            in_transit: HashSet::new(),
            transit_size: 0,
            encountered_errors: false,
            embedded_errors: Vec::new(),
        }));
        let um = UploadManager::new(state.clone(), backend.clone());
        Ok(Self { state, backend, um, cachedir })
    }

    /// Surface the first pending background failure as EIO, like the
    /// foreground would observe an embedded exception.
    pub fn check_embedded(&self) -> Result<()> {
        let mut st = self.state.lock();
        if let Some(msg) = st.embedded_errors.pop() {
            st.encountered_errors = true;
            return Err(FsError::Embedded(msg));
        }
        Ok(())
    }
}

/// Current block binding of a file position, if any. Blockno 0 lives
/// inline on the inode row; all other positions in `inode_blocks`.
pub(crate) fn get_block_id(db: &MetaDb, inode: i64, blockno: u64) -> Result<Option<i64>> {
    if blockno == 0 {
        db.get_val(
            "SELECT block_id FROM inodes WHERE id = ?",
            rusqlite::params![inode],
        )
    } else {
        match db.get_val(
            "SELECT block_id FROM inode_blocks WHERE inode = ? AND blockno = ?",
            rusqlite::params![inode, blockno],
        ) {
            Ok(id) => Ok(Some(id)),
            Err(FsError::NoSuchRow) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

pub(crate) fn bind_block(
    db: &MetaDb,
    inode: i64,
    blockno: u64,
    block_id: i64,
    had_prev: bool,
) -> Result<()> {
    if blockno == 0 {
        db.execute(
            "UPDATE inodes SET block_id = ? WHERE id = ?",
            rusqlite::params![block_id, inode],
        )?;
    } else if had_prev {
        db.execute(
            "UPDATE inode_blocks SET block_id = ? WHERE inode = ? AND blockno = ?",
            rusqlite::params![block_id, inode, blockno],
        )?;
    } else {
        db.execute(
            "INSERT INTO inode_blocks (block_id, inode, blockno) VALUES (?, ?, ?)",
            rusqlite::params![block_id, inode, blockno],
        )?;
    }
    Ok(())
}

pub(crate) fn unbind_block(db: &MetaDb, inode: i64, blockno: u64) -> Result<()> {
    if blockno == 0 {
        db.execute(
            "UPDATE inodes SET block_id = NULL WHERE id = ?",
            rusqlite::params![inode],
        )?;
    } else {
        db.execute(
            "DELETE FROM inode_blocks WHERE inode = ? AND blockno = ?",
            rusqlite::params![inode, blockno],
        )?;
    }
    Ok(())
}

/// Drop one reference from a block. When the block dies, its object loses
/// a reference too; a dead object row is deleted and its id returned so
/// the caller can schedule backend removal.
pub(crate) fn deref_block(db: &MetaDb, block_id: i64) -> Result<Option<i64>> {
    let refcount: i64 = db.get_val(
        "SELECT refcount FROM blocks WHERE id = ?",
        rusqlite::params![block_id],
    )?;
    if refcount > 1 {
        db.execute(
            "UPDATE blocks SET refcount = refcount - 1 WHERE id = ?",
            rusqlite::params![block_id],
        )?;
        return Ok(None);
    }
    let obj_id: i64 = db.get_val(
        "SELECT obj_id FROM blocks WHERE id = ?",
        rusqlite::params![block_id],
    )?;
    db.execute("DELETE FROM blocks WHERE id = ?", rusqlite::params![block_id])?;
    let obj_refcount: i64 = db.get_val(
        "SELECT refcount FROM objects WHERE id = ?",
        rusqlite::params![obj_id],
    )?;
    if obj_refcount > 1 {
        db.execute(
            "UPDATE objects SET refcount = refcount - 1 WHERE id = ?",
            rusqlite::params![obj_id],
        )?;
        Ok(None)
    } else {
        db.execute("DELETE FROM objects WHERE id = ?", rusqlite::params![obj_id])?;
        Ok(Some(obj_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedupfs_lib::db::{create_tables, init_tables};

    fn test_db() -> MetaDb {
        let db = MetaDb::open_in_memory().unwrap();
        create_tables(&db).unwrap();
        init_tables(&db).unwrap();
        db
    }

    #[test]
    fn inline_slot_for_blockno_zero() -> Result<()> {
        let db = test_db();
        db.execute("INSERT INTO objects (id, refcount, size) VALUES (1, 1, 4)", [])?;
        db.execute(
            "INSERT INTO blocks (id, refcount, hash, obj_id) VALUES (1, 1, x'00', 1)",
            [],
        )?;
        assert_eq!(get_block_id(&db, ROOT_INODE, 0)?, None);
        bind_block(&db, ROOT_INODE, 0, 1, false)?;
        assert_eq!(get_block_id(&db, ROOT_INODE, 0)?, Some(1));
        unbind_block(&db, ROOT_INODE, 0)?;
        assert_eq!(get_block_id(&db, ROOT_INODE, 0)?, None);
        Ok(())
    }

    #[test]
    fn deref_block_cascades_to_object() -> Result<()> {
        let db = test_db();
        db.execute("INSERT INTO objects (id, refcount, size) VALUES (7, 1, 4)", [])?;
        db.execute(
            "INSERT INTO blocks (id, refcount, hash, obj_id) VALUES (3, 2, x'01', 7)",
            [],
        )?;
        assert_eq!(deref_block(&db, 3)?, None);
        assert_eq!(deref_block(&db, 3)?, Some(7));
        assert!(!db.has_val("SELECT 1 FROM blocks WHERE id = 3", [])?);
        assert!(!db.has_val("SELECT 1 FROM objects WHERE id = 7", [])?);
        Ok(())
    }
}
