/// Consistency check and repair.
///
/// Rebuilds the name/inode/block/object refcount chain from scratch,
/// commits stray cache files left by a crash, reconciles the object
/// table with the backend in both directions, and renumbers inodes when
/// the id space approaches 2^31.
use crate::dedupfs_lib::commit::{
    cycle_metadata, download_metadata, get_seq_no, upload_metadata, CachePaths, Parameters,
};
use crate::dedupfs_lib::db::{create_tables, MetaDb};
use crate::dedupfs_lib::errors::{FsError, Result};
use crate::dedupfs_lib::utils::{compress, data_key, now_ts, seq_no_key, sha256_bytes};
use crate::dedupfs_lib::{
    bind_block, deref_block, get_block_id, unbind_block, CURRENT_FS_REV, DATA_KEY_PREFIX,
    MAX_INODE_BEFORE_RENUMBER, METADATA_KEY, ROOT_INODE,
};
use log::*;
use object_backend::{Backend, BackendError, ObjectMeta};
use rusqlite::params;
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Default)]
pub struct FsckOptions {
    /// Exit instead of prompting when user input would be required.
    pub batch: bool,
    /// Check even when the file system is marked clean.
    pub force: bool,
    /// Use outdated metadata without asking (set by the CLI prompt).
    pub accept_outdated: bool,
}

pub struct Fsck<'a> {
    db: &'a MetaDb,
    backend: &'a dyn Backend,
    cachedir: PathBuf,
    pub found_errors: bool,
    pub uncorrectable: bool,
}

impl<'a> Fsck<'a> {
    pub fn new(db: &'a MetaDb, backend: &'a dyn Backend, cachedir: PathBuf) -> Self {
        Self { db, backend, cachedir, found_errors: false, uncorrectable: false }
    }

    pub fn check(&mut self) -> Result<()> {
        self.check_cache()?;
        self.check_contents()?;
        self.check_names()?;
        self.check_inode_refcounts()?;
        self.check_inode_blocks()?;
        self.check_block_refcounts()?;
        self.check_object_refcounts()?;
        self.check_missing_objects()?;
        self.check_orphaned_objects()?;
        Ok(())
    }

    fn log_error(&mut self, msg: String) {
        warn!("{}", msg);
        self.found_errors = true;
    }

    /// Commit stray cache files through the dedup path: dirty blocks are
    /// re-hashed, linked or uploaded, then all files are removed.
    fn check_cache(&mut self) -> Result<()> {
        if !self.cachedir.exists() {
            return Ok(());
        }
        info!("checking cached objects...");
        for entry in std::fs::read_dir(&self.cachedir)? {
            let path = entry?.path();
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) => n.to_string(),
                None => continue,
            };
            let (stem, dirty) = match name.strip_suffix(".d") {
                Some(s) => (s, true),
                None => (name.as_str(), false),
            };
            let parsed = stem
                .split_once('_')
                .and_then(|(i, b)| Some((i.parse::<i64>().ok()?, b.parse::<u64>().ok()?)));
            if let (Some((inode, blockno)), true) = (parsed, dirty) {
                self.log_error(format!(
                    "committing dirty cached block ({}, {})",
                    inode, blockno
                ));
                let data = std::fs::read(&path)?;
                self.commit_stray_block(inode, blockno, &data)?;
            }
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }

    fn commit_stray_block(&mut self, inode: i64, blockno: u64, data: &[u8]) -> Result<()> {
        if !self
            .db
            .has_val("SELECT 1 FROM inodes WHERE id = ?", params![inode])?
        {
            return Ok(());
        }
        let old_block_id = get_block_id(self.db, inode, blockno)?;
        let hash = sha256_bytes(data);
        let new_block_id = match self
            .db
            .get_val("SELECT id FROM blocks WHERE hash = ?", params![hash])
        {
            Ok(hit) => {
                if old_block_id == Some(hit) {
                    return Ok(());
                }
                self.db.execute(
                    "UPDATE blocks SET refcount = refcount + 1 WHERE id = ?",
                    params![hit],
                )?;
                hit
            }
            Err(FsError::NoSuchRow) => {
                let obj_id = self.db.rowid(
                    "INSERT INTO objects (refcount, size) VALUES (1, ?)",
                    params![data.len() as i64],
                )?;
                let block_id = self.db.rowid(
                    "INSERT INTO blocks (refcount, hash, obj_id) VALUES (1, ?, ?)",
                    params![hash, obj_id],
                )?;
                let body = compress(data)?;
                self.backend
                    .put(&data_key(obj_id), &body, &ObjectMeta::new(), true)?;
                self.db.execute(
                    "UPDATE objects SET compr_size = ? WHERE id = ?",
                    params![body.len() as i64, obj_id],
                )?;
                block_id
            }
            Err(e) => return Err(e),
        };
        bind_block(self.db, inode, blockno, new_block_id, old_block_id.is_some())?;
        if let Some(old) = old_block_id {
            if let Some(obj_id) = deref_block(self.db, old)? {
                self.delete_backend_object(obj_id);
            }
        }
        Ok(())
    }

    /// Directory entries referring to missing inodes or names are dropped.
    fn check_contents(&mut self) -> Result<()> {
        info!("checking directory entries...");
        let dangling: Vec<(i64, i64)> = self.db.query_rows(
            "SELECT parent_inode, name_id FROM contents
             WHERE inode NOT IN (SELECT id FROM inodes)
                OR parent_inode NOT IN (SELECT id FROM inodes)
                OR name_id NOT IN (SELECT id FROM names)",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        for (parent, name_id) in dangling {
            self.log_error(format!(
                "dropping dangling directory entry ({}, name_id {})",
                parent, name_id
            ));
            self.db.execute(
                "DELETE FROM contents WHERE parent_inode = ? AND name_id = ?",
                params![parent, name_id],
            )?;
        }
        Ok(())
    }

    fn check_names(&mut self) -> Result<()> {
        info!("checking names...");
        let names: Vec<(i64, i64)> = self.db.query_rows(
            "SELECT id, refcount FROM names",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        for (id, refcount) in names {
            let actual: i64 = self.db.get_val(
                "SELECT (SELECT COUNT(*) FROM contents WHERE name_id = ?)
                      + (SELECT COUNT(*) FROM ext_attributes WHERE name_id = ?)",
                params![id, id],
            )?;
            if actual == 0 {
                self.log_error(format!("deleting unused name {}", id));
                self.db.execute("DELETE FROM names WHERE id = ?", params![id])?;
            } else if actual != refcount {
                self.log_error(format!(
                    "name {} refcount {} should be {}",
                    id, refcount, actual
                ));
                self.db.execute(
                    "UPDATE names SET refcount = ? WHERE id = ?",
                    params![actual, id],
                )?;
            }
        }
        Ok(())
    }

    /// Inode refcounts equal the number of directory entries; orphaned
    /// inodes are released entirely.
    fn check_inode_refcounts(&mut self) -> Result<()> {
        info!("checking inode refcounts...");
        let inodes: Vec<(i64, i64)> = self.db.query_rows(
            "SELECT id, refcount FROM inodes",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        for (ino, refcount) in inodes {
            let mut actual: i64 = self.db.get_val(
                "SELECT COUNT(*) FROM contents WHERE inode = ?",
                params![ino],
            )?;
            if ino == ROOT_INODE {
                actual = actual.max(1);
            }
            if actual == 0 {
                self.log_error(format!("releasing orphaned inode {}", ino));
                self.release_inode(ino)?;
            } else if actual != refcount {
                self.log_error(format!(
                    "inode {} refcount {} should be {}",
                    ino, refcount, actual
                ));
                self.db.execute(
                    "UPDATE inodes SET refcount = ? WHERE id = ?",
                    params![actual, ino],
                )?;
            }
        }
        Ok(())
    }

    fn release_inode(&mut self, ino: i64) -> Result<()> {
        let mut positions: Vec<(u64, i64)> = self.db.query_rows(
            "SELECT blockno, block_id FROM inode_blocks WHERE inode = ?",
            params![ino],
            |row| Ok((row.get::<_, i64>(0)? as u64, row.get(1)?)),
        )?;
        if let Some(block_id) = get_block_id(self.db, ino, 0)? {
            positions.push((0, block_id));
        }
        for (blockno, block_id) in positions {
            unbind_block(self.db, ino, blockno)?;
            if let Some(obj_id) = deref_block(self.db, block_id)? {
                self.delete_backend_object(obj_id);
            }
        }
        self.db
            .execute("DELETE FROM ext_attributes WHERE inode = ?", params![ino])?;
        self.db
            .execute("DELETE FROM symlink_targets WHERE inode = ?", params![ino])?;
        self.db
            .execute("DELETE FROM inodes WHERE id = ?", params![ino])?;
        Ok(())
    }

    /// Block mappings must point at existing inodes and blocks.
    fn check_inode_blocks(&mut self) -> Result<()> {
        info!("checking block mappings...");
        let bad: Vec<(i64, i64)> = self.db.query_rows(
            "SELECT inode, blockno FROM inode_blocks
             WHERE inode NOT IN (SELECT id FROM inodes)
                OR block_id NOT IN (SELECT id FROM blocks)",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        for (inode, blockno) in bad {
            self.log_error(format!(
                "dropping invalid block mapping ({}, {})",
                inode, blockno
            ));
            self.db.execute(
                "DELETE FROM inode_blocks WHERE inode = ? AND blockno = ?",
                params![inode, blockno],
            )?;
        }
        let cleared = self.db.execute(
            "UPDATE inodes SET block_id = NULL
             WHERE block_id IS NOT NULL AND block_id NOT IN (SELECT id FROM blocks)",
            [],
        )?;
        if cleared > 0 {
            self.log_error(format!("cleared {} invalid inline block slots", cleared));
        }
        Ok(())
    }

    fn check_block_refcounts(&mut self) -> Result<()> {
        info!("checking block refcounts...");
        let mut actual: HashMap<i64, i64> = HashMap::new();
        for (block_id, count) in self.db.query_rows(
            "SELECT block_id, COUNT(*) FROM inode_blocks GROUP BY block_id",
            [],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
        )? {
            *actual.entry(block_id).or_default() += count;
        }
        for (block_id, count) in self.db.query_rows(
            "SELECT block_id, COUNT(*) FROM inodes WHERE block_id IS NOT NULL GROUP BY block_id",
            [],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
        )? {
            *actual.entry(block_id).or_default() += count;
        }

        let blocks: Vec<(i64, i64)> = self.db.query_rows(
            "SELECT id, refcount FROM blocks",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        for (id, refcount) in blocks {
            let count = actual.get(&id).copied().unwrap_or(0);
            if count == 0 {
                self.log_error(format!("deleting unreferenced block {}", id));
                self.db
                    .execute("DELETE FROM blocks WHERE id = ?", params![id])?;
            } else if count != refcount {
                self.log_error(format!(
                    "block {} refcount {} should be {}",
                    id, refcount, count
                ));
                self.db.execute(
                    "UPDATE blocks SET refcount = ? WHERE id = ?",
                    params![count, id],
                )?;
            }
        }
        Ok(())
    }

    fn check_object_refcounts(&mut self) -> Result<()> {
        info!("checking object refcounts...");
        let objects: Vec<(i64, i64)> = self.db.query_rows(
            "SELECT id, refcount FROM objects",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        for (id, refcount) in objects {
            let actual: i64 = self.db.get_val(
                "SELECT COUNT(*) FROM blocks WHERE obj_id = ?",
                params![id],
            )?;
            if actual == 0 {
                self.log_error(format!("deleting unreferenced object {}", id));
                self.db
                    .execute("DELETE FROM objects WHERE id = ?", params![id])?;
                self.delete_backend_object(id);
            } else if actual != refcount {
                self.log_error(format!(
                    "object {} refcount {} should be {}",
                    id, refcount, actual
                ));
                self.db.execute(
                    "UPDATE objects SET refcount = ? WHERE id = ?",
                    params![actual, id],
                )?;
            }
        }
        Ok(())
    }

    /// Object rows whose backend data is gone: the affected blocks are
    /// dropped and their positions become holes.
    fn check_missing_objects(&mut self) -> Result<()> {
        info!("checking for missing backend objects...");
        let ids: Vec<i64> = self.db.query_col("SELECT id FROM objects", [])?;
        for obj_id in ids {
            if self.backend.contains(&data_key(obj_id))? {
                continue;
            }
            self.log_error(format!(
                "backend object {} is gone, dropping affected blocks",
                data_key(obj_id)
            ));
            let block_ids: Vec<i64> = self.db.query_col(
                "SELECT id FROM blocks WHERE obj_id = ?",
                params![obj_id],
            )?;
            for block_id in block_ids {
                self.db.execute(
                    "DELETE FROM inode_blocks WHERE block_id = ?",
                    params![block_id],
                )?;
                self.db.execute(
                    "UPDATE inodes SET block_id = NULL WHERE block_id = ?",
                    params![block_id],
                )?;
                self.db
                    .execute("DELETE FROM blocks WHERE id = ?", params![block_id])?;
            }
            self.db
                .execute("DELETE FROM objects WHERE id = ?", params![obj_id])?;
        }
        Ok(())
    }

    /// Backend data keys without an object row are deleted.
    fn check_orphaned_objects(&mut self) -> Result<()> {
        info!("checking for orphaned backend objects...");
        for key in self.backend.list(DATA_KEY_PREFIX)? {
            let obj_id: i64 = match key
                .strip_prefix(DATA_KEY_PREFIX)
                .and_then(|s| s.parse().ok())
            {
                Some(id) => id,
                None => {
                    self.log_error(format!("deleting malformed data key {}", key));
                    self.delete_key(&key);
                    continue;
                }
            };
            if !self
                .db
                .has_val("SELECT 1 FROM objects WHERE id = ?", params![obj_id])?
            {
                self.log_error(format!("deleting orphaned object {}", key));
                self.delete_key(&key);
            }
        }
        Ok(())
    }

    fn delete_backend_object(&mut self, obj_id: i64) {
        self.delete_key(&data_key(obj_id));
    }

    fn delete_key(&mut self, key: &str) {
        match self.backend.delete(key) {
            Ok(()) | Err(BackendError::NoSuchObject(_)) => {}
            Err(e) => {
                warn!("could not delete {}: {}", key, e);
                self.found_errors = true;
            }
        }
    }
}

const ALL_TABLES: &[&str] = &[
    "parameters",
    "names",
    "inodes",
    "symlink_targets",
    "contents",
    "ext_attributes",
    "objects",
    "blocks",
    "inode_blocks",
];

const KEEP_TABLES: &[&str] = &["parameters", "names", "objects", "blocks"];

const INDEXES: &[&str] = &[
    "ix_contents_inode",
    "ix_blocks_obj_id",
    "ix_inode_blocks_block_id",
    "ix_ext_attributes_inode",
];

/// Renumber all inodes into a contiguous range starting at the root,
/// preserving every mapping through a temporary `inode_map` table.
pub fn renumber_inodes(db: &MetaDb) -> Result<()> {
    info!("renumbering inodes...");
    for table in ALL_TABLES {
        db.execute(&format!("ALTER TABLE {} RENAME TO {}_old", table, table), [])?;
    }
    for index in INDEXES {
        db.execute(&format!("DROP INDEX IF EXISTS {}", index), [])?;
    }
    create_tables(db)?;
    for table in KEEP_TABLES {
        db.execute(&format!("DROP TABLE {}", table), [])?;
        db.execute(&format!("ALTER TABLE {}_old RENAME TO {}", table, table), [])?;
    }

    db.execute(
        "CREATE TEMPORARY TABLE inode_map
         (rowid INTEGER PRIMARY KEY AUTOINCREMENT, id INTEGER UNIQUE)",
        [],
    )?;
    db.execute(
        "INSERT INTO inode_map (rowid, id) VALUES (?, ?)",
        params![ROOT_INODE, ROOT_INODE],
    )?;
    db.execute(
        "INSERT INTO inode_map (id) SELECT id FROM inodes_old WHERE id > ? ORDER BY id ASC",
        params![ROOT_INODE],
    )?;

    db.execute(
        "INSERT INTO inodes (id, mode, uid, gid, mtime, atime, ctime, refcount,
                             size, rdev, locked, block_id)
         SELECT (SELECT rowid FROM inode_map WHERE inode_map.id = inodes_old.id),
                mode, uid, gid, mtime, atime, ctime, refcount, size, rdev, locked, block_id
         FROM inodes_old",
        [],
    )?;
    db.execute(
        "INSERT INTO inode_blocks (inode, blockno, block_id)
         SELECT (SELECT rowid FROM inode_map WHERE inode_map.id = inode_blocks_old.inode),
                blockno, block_id
         FROM inode_blocks_old",
        [],
    )?;
    db.execute(
        "INSERT INTO contents (name_id, inode, parent_inode)
         SELECT name_id,
                (SELECT rowid FROM inode_map WHERE inode_map.id = contents_old.inode),
                (SELECT rowid FROM inode_map WHERE inode_map.id = contents_old.parent_inode)
         FROM contents_old",
        [],
    )?;
    db.execute(
        "INSERT INTO symlink_targets (inode, target)
         SELECT (SELECT rowid FROM inode_map WHERE inode_map.id = symlink_targets_old.inode),
                target
         FROM symlink_targets_old",
        [],
    )?;
    db.execute(
        "INSERT INTO ext_attributes (inode, name_id, value)
         SELECT (SELECT rowid FROM inode_map WHERE inode_map.id = ext_attributes_old.inode),
                name_id, value
         FROM ext_attributes_old",
        [],
    )?;

    for table in ["inodes", "inode_blocks", "symlink_targets", "contents", "ext_attributes"] {
        db.execute(&format!("DROP TABLE {}_old", table), [])?;
    }
    db.execute("DROP TABLE inode_map", [])?;
    Ok(())
}

/// Full check-and-repair flow against a backend, as driven by the CLI.
pub fn fsck_run(backend: &dyn Backend, paths: &CachePaths, opts: &FsckOptions) -> Result<()> {
    if paths.lock().exists() && !opts.force {
        error!("file system appears to be mounted, refusing to check");
        return Err(FsError::Usage(libc::EBUSY));
    }

    let seq_no = get_seq_no(backend)?;
    let param_remote = Parameters::from_meta(&backend.lookup(METADATA_KEY)?)?;

    let mut db_opt = None;
    let mut param = if paths.params().exists() {
        let local = Parameters::load_file(&paths.params())?;
        if local.seq_no < seq_no {
            info!("ignoring locally cached metadata (outdated)");
            param_remote.clone()
        } else {
            info!("using cached metadata");
            db_opt = Some(MetaDb::open(&paths.db())?);
            local
        }
    } else {
        param_remote.clone()
    };
    if param_remote.seq_no != param.seq_no {
        warn!("remote metadata is outdated");
        param.needs_fsck = true;
    }

    if param.revision != CURRENT_FS_REV {
        error!(
            "file system revision {} does not match this version ({})",
            param.revision, CURRENT_FS_REV
        );
        return Err(FsError::Usage(libc::EINVAL));
    }

    if param.seq_no < seq_no {
        if backend.is_get_consistent() {
            warn!(
                "up to date metadata is not available; the file system was probably not \
                 unmounted properly, try running fsck where it was mounted most recently"
            );
        } else {
            warn!(
                "up to date metadata is not available; either the file system was not \
                 unmounted cleanly or the data has not yet propagated through the backend"
            );
        }
        if opts.batch {
            error!("in batch mode, exiting");
            return Err(FsError::Usage(libc::EINVAL));
        }
        if !opts.accept_outdated && !confirm_outdated() {
            return Err(FsError::Usage(libc::EINVAL));
        }
        param.seq_no = seq_no;
        param.needs_fsck = true;
    }

    if !param.needs_fsck
        && param.max_inode < MAX_INODE_BEFORE_RENUMBER
        && now_ts() - param.last_fsck < 60.0 * 60.0 * 24.0 * 31.0
        && !opts.force
    {
        info!("file system is marked clean, use --force to check anyway");
        return Ok(());
    }

    let db = match db_opt {
        Some(db) => {
            info!("checking DB integrity...");
            db.integrity_check()?;
            db
        }
        None => {
            info!("downloading and decompressing metadata...");
            download_metadata(backend, &paths.db())?.1
        }
    };

    // Open a new epoch before touching anything, so that a crash during
    // the check is itself detected
    param.seq_no += 1;
    param.needs_fsck = true;
    backend.put(&seq_no_key(param.seq_no), b"Empty", &ObjectMeta::new(), false)?;
    param.save_file(&paths.params())?;

    let mut fsck = Fsck::new(&db, backend, paths.cache());
    fsck.check()?;
    param.max_inode = db.get_val("SELECT MAX(id) FROM inodes", [])?;

    if fsck.uncorrectable {
        error!("uncorrectable errors found, aborting");
        return Err(FsError::Corrupt("uncorrectable errors".to_string()));
    }
    if fsck.found_errors {
        info!("found and repaired errors");
    }
    std::fs::remove_dir(paths.cache()).ok();

    if param.max_inode >= MAX_INODE_BEFORE_RENUMBER {
        renumber_inodes(&db)?;
        param.inode_gen += 1;
        param.max_inode = db.get_val("SELECT MAX(id) FROM inodes", [])?;
    }

    cycle_metadata(backend)?;
    param.needs_fsck = false;
    param.last_fsck = now_ts();
    param.last_modified = now_ts();
    param.save_db(&db)?;

    info!("compressing and uploading metadata...");
    upload_metadata(backend, &db, &param)?;
    param.save_file(&paths.params())?;
    db.vacuum()?;
    std::fs::remove_file(paths.lock()).ok();
    Ok(())
}

fn confirm_outdated() -> bool {
    println!("Enter \"continue\" to use the outdated data anyway:");
    let mut line = String::new();
    if std::io::stdin().read_line(&mut line).is_err() {
        return false;
    }
    line.trim() == "continue"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedupfs_lib::db::init_tables;
    use object_backend::memory::MemBackend;

    fn seeded_db() -> MetaDb {
        let db = MetaDb::open_in_memory().unwrap();
        create_tables(&db).unwrap();
        init_tables(&db).unwrap();
        Parameters::new("t".to_string(), 4096).save_db(&db).unwrap();
        db
    }

    fn add_file(db: &MetaDb, name: &[u8], content_hash: &[u8], obj_id: i64) -> i64 {
        db.execute(
            "INSERT OR IGNORE INTO objects (id, refcount, size) VALUES (?, 1, 4)",
            params![obj_id],
        )
        .unwrap();
        let block_id = db
            .rowid(
                "INSERT INTO blocks (refcount, hash, obj_id) VALUES (1, ?, ?)",
                params![content_hash, obj_id],
            )
            .unwrap();
        let ino = db
            .rowid(
                "INSERT INTO inodes (mode, uid, gid, mtime, atime, ctime, refcount, size, block_id)
                 VALUES (?, 0, 0, 0, 0, 0, 1, 4, ?)",
                params![libc::S_IFREG | 0o644, block_id],
            )
            .unwrap();
        let name_id = db
            .rowid("INSERT INTO names (name, refcount) VALUES (?, 1)", params![name])
            .unwrap();
        db.execute(
            "INSERT INTO contents (name_id, inode, parent_inode) VALUES (?, ?, ?)",
            params![name_id, ino, ROOT_INODE],
        )
        .unwrap();
        ino
    }

    #[test]
    fn rebuilds_broken_refcounts() {
        let db = seeded_db();
        let backend = MemBackend::new();
        backend
            .put(&data_key(1), b"x", &ObjectMeta::new(), true)
            .unwrap();
        add_file(&db, b"a", &[1u8; 32], 1);
        // Corrupt every refcount in the chain
        db.execute("UPDATE inodes SET refcount = 7 WHERE id != 1", []).unwrap();
        db.execute("UPDATE blocks SET refcount = 7", []).unwrap();
        db.execute("UPDATE objects SET refcount = 7", []).unwrap();
        db.execute("UPDATE names SET refcount = 7", []).unwrap();

        let mut fsck = Fsck::new(&db, &backend, PathBuf::from("/nonexistent"));
        fsck.check().unwrap();
        assert!(fsck.found_errors);

        let v: i64 = db.get_val("SELECT refcount FROM inodes WHERE id != 1", []).unwrap();
        assert_eq!(v, 1);
        let v: i64 = db.get_val("SELECT refcount FROM blocks", []).unwrap();
        assert_eq!(v, 1);
        let v: i64 = db.get_val("SELECT refcount FROM objects", []).unwrap();
        assert_eq!(v, 1);
        let v: i64 = db.get_val("SELECT refcount FROM names", []).unwrap();
        assert_eq!(v, 1);
    }

    #[test]
    fn removes_orphaned_backend_objects() {
        let db = seeded_db();
        let backend = MemBackend::new();
        backend
            .put(&data_key(1), b"live", &ObjectMeta::new(), true)
            .unwrap();
        backend
            .put(&data_key(42), b"orphan", &ObjectMeta::new(), true)
            .unwrap();
        add_file(&db, b"a", &[2u8; 32], 1);

        let mut fsck = Fsck::new(&db, &backend, PathBuf::from("/nonexistent"));
        fsck.check().unwrap();
        assert!(fsck.found_errors);
        assert!(backend.contains(&data_key(1)).unwrap());
        assert!(!backend.contains(&data_key(42)).unwrap());
    }

    #[test]
    fn drops_blocks_of_lost_objects() {
        let db = seeded_db();
        let backend = MemBackend::new();
        // object 5 has no backend data at all
        let ino = add_file(&db, b"a", &[3u8; 32], 5);

        let mut fsck = Fsck::new(&db, &backend, PathBuf::from("/nonexistent"));
        fsck.check().unwrap();
        assert!(fsck.found_errors);
        let blocks: i64 = db.get_val("SELECT COUNT(*) FROM blocks", []).unwrap();
        assert_eq!(blocks, 0);
        let slot: Option<i64> = db
            .get_val("SELECT block_id FROM inodes WHERE id = ?", params![ino])
            .unwrap();
        assert_eq!(slot, None);
    }

    #[test]
    fn releases_orphaned_inodes() {
        let db = seeded_db();
        let backend = MemBackend::new();
        backend
            .put(&data_key(1), b"x", &ObjectMeta::new(), true)
            .unwrap();
        let ino = add_file(&db, b"a", &[4u8; 32], 1);
        db.execute("DELETE FROM contents WHERE inode = ?", params![ino]).unwrap();

        let mut fsck = Fsck::new(&db, &backend, PathBuf::from("/nonexistent"));
        fsck.check().unwrap();
        assert!(!db
            .has_val("SELECT 1 FROM inodes WHERE id = ?", params![ino])
            .unwrap());
        // its object became orphaned and was removed from the backend too
        assert!(!backend.contains(&data_key(1)).unwrap());
    }

    #[test]
    fn renumbering_compacts_and_preserves() {
        let db = seeded_db();
        let huge = MAX_INODE_BEFORE_RENUMBER + 5;
        db.execute(
            "INSERT INTO inodes (id, mode, uid, gid, mtime, atime, ctime, refcount, size)
             VALUES (?, ?, 0, 0, 0, 0, 0, 1, 0)",
            params![huge, libc::S_IFDIR | 0o755],
        )
        .unwrap();
        let name_id = db
            .rowid("INSERT INTO names (name, refcount) VALUES (?, 1)", params![b"big".to_vec()])
            .unwrap();
        db.execute(
            "INSERT INTO contents (name_id, inode, parent_inode) VALUES (?, ?, ?)",
            params![name_id, huge, ROOT_INODE],
        )
        .unwrap();

        renumber_inodes(&db).unwrap();

        let max: i64 = db.get_val("SELECT MAX(id) FROM inodes", []).unwrap();
        assert_eq!(max, 2);
        let mapped: i64 = db
            .get_val(
                "SELECT inode FROM contents WHERE name_id = ?",
                params![name_id],
            )
            .unwrap();
        assert_eq!(mapped, 2);
        let root: i64 = db
            .get_val("SELECT id FROM inodes WHERE id = 1", [])
            .unwrap();
        assert_eq!(root, ROOT_INODE);
    }
}
