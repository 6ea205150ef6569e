/// Inode-level filesystem operations on top of the block core.
///
/// Path resolution belongs to the request layer above; everything here
/// is addressed by inode number or (parent inode, name).
use crate::dedupfs_lib::cache::CacheEntry;
use crate::dedupfs_lib::db::{with_txn, MetaDb};
use crate::dedupfs_lib::errors::{FsError, Result};
use crate::dedupfs_lib::upload::RemoveTask;
use crate::dedupfs_lib::utils::{data_key, decompress, now_ts, sha256_bytes};
use crate::dedupfs_lib::{deref_block, get_block_id, unbind_block, BlockKey, DedupFs, ROOT_INODE};
use log::*;
use rusqlite::params;

#[derive(Debug, Clone)]
pub struct InodeAttr {
    pub ino: i64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub nlink: u32,
    pub rdev: u32,
    pub atime: f64,
    pub mtime: f64,
    pub ctime: f64,
}

#[derive(Debug, Default)]
pub struct SetAttr {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<f64>,
    pub mtime: Option<f64>,
}

#[derive(Debug)]
pub struct DirEntry {
    pub name: Vec<u8>,
    pub inode: i64,
    pub mode: u32,
}

#[derive(Debug)]
pub struct StatFs {
    pub blocksize: u64,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
}

fn load_attr(db: &MetaDb, ino: i64) -> Result<InodeAttr> {
    db.get_row(
        "SELECT mode, uid, gid, size, refcount, rdev, atime, mtime, ctime
         FROM inodes WHERE id = ?",
        params![ino],
        |row| {
            Ok(InodeAttr {
                ino,
                mode: row.get(0)?,
                uid: row.get(1)?,
                gid: row.get(2)?,
                size: row.get::<_, i64>(3)? as u64,
                nlink: row.get(4)?,
                rdev: row.get(5)?,
                atime: row.get(6)?,
                mtime: row.get(7)?,
                ctime: row.get(8)?,
            })
        },
    )
}

fn is_dir(mode: u32) -> bool {
    mode & libc::S_IFMT == libc::S_IFDIR
}

/// Intern `name`, creating the row or bumping its refcount.
fn intern_name(db: &MetaDb, name: &[u8]) -> Result<i64> {
    match db.get_val("SELECT id FROM names WHERE name = ?", params![name]) {
        Ok(id) => {
            db.execute(
                "UPDATE names SET refcount = refcount + 1 WHERE id = ?",
                params![id],
            )?;
            Ok(id)
        }
        Err(FsError::NoSuchRow) => {
            db.rowid("INSERT INTO names (name, refcount) VALUES (?, 1)", params![name])
        }
        Err(e) => Err(e),
    }
}

fn deref_name(db: &MetaDb, name_id: i64) -> Result<()> {
    let refcount: i64 = db.get_val(
        "SELECT refcount FROM names WHERE id = ?",
        params![name_id],
    )?;
    if refcount > 1 {
        db.execute(
            "UPDATE names SET refcount = refcount - 1 WHERE id = ?",
            params![name_id],
        )?;
    } else {
        db.execute("DELETE FROM names WHERE id = ?", params![name_id])?;
    }
    Ok(())
}

/// (name_id, inode) of the directory entry, ENOENT when missing.
fn lookup_entry(db: &MetaDb, parent: i64, name: &[u8]) -> Result<(i64, i64)> {
    db.get_row(
        "SELECT contents.name_id, contents.inode FROM contents
         JOIN names ON names.id = contents.name_id
         WHERE contents.parent_inode = ? AND names.name = ?",
        params![parent, name],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )
}

fn update_parent_mtime(db: &MetaDb, parent: i64) -> Result<()> {
    db.execute(
        "UPDATE inodes SET mtime = ? WHERE id = ?",
        params![now_ts(), parent],
    )?;
    Ok(())
}

fn update_atime(db: &MetaDb, ino: i64) -> Result<()> {
    db.execute(
        "UPDATE inodes SET atime = ? WHERE id = ?",
        params![now_ts(), ino],
    )?;
    Ok(())
}

fn create_inode(
    db: &MetaDb,
    mode: u32,
    uid: u32,
    gid: u32,
    rdev: u32,
    size: u64,
) -> Result<i64> {
    let now = now_ts();
    let ino = db.rowid(
        "INSERT INTO inodes (mode, uid, gid, mtime, atime, ctime, refcount, size, rdev)
         VALUES (?, ?, ?, ?, ?, ?, 1, ?, ?)",
        params![mode, uid, gid, now, now, now, size as i64, rdev],
    )?;
    db.execute(
        "UPDATE parameters SET max_inode = MAX(max_inode, ?)",
        params![ino],
    )?;
    Ok(ino)
}

/// Check the parent exists and is a directory, and `name` is free.
fn check_create(db: &MetaDb, parent: i64, name: &[u8]) -> Result<()> {
    let parent_attr = load_attr(db, parent)?;
    if !is_dir(parent_attr.mode) {
        return Err(FsError::Usage(libc::ENOTDIR));
    }
    match lookup_entry(db, parent, name) {
        Ok(_) => Err(FsError::Usage(libc::EEXIST)),
        Err(FsError::NoSuchRow) => Ok(()),
        Err(e) => Err(e),
    }
}

fn add_dirent(db: &MetaDb, parent: i64, name: &[u8], ino: i64) -> Result<()> {
    let name_id = intern_name(db, name)?;
    db.execute(
        "INSERT INTO contents (name_id, inode, parent_inode) VALUES (?, ?, ?)",
        params![name_id, ino, parent],
    )?;
    update_parent_mtime(db, parent)?;
    Ok(())
}

impl DedupFs {
    pub fn getattr(&self, ino: i64) -> Result<InodeAttr> {
        let st = self.state.lock();
        load_attr(&st.db, ino)
    }

    pub fn lookup(&self, parent: i64, name: &[u8]) -> Result<InodeAttr> {
        let st = self.state.lock();
        let (_, ino) = lookup_entry(&st.db, parent, name)?;
        load_attr(&st.db, ino)
    }

    pub fn setattr(&self, ino: i64, changes: &SetAttr) -> Result<InodeAttr> {
        if let Some(size) = changes.size {
            self.truncate(ino, size)?;
        }
        let st = self.state.lock();
        let attr = load_attr(&st.db, ino)?;
        let mode = changes.mode.unwrap_or(attr.mode);
        let uid = changes.uid.unwrap_or(attr.uid);
        let gid = changes.gid.unwrap_or(attr.gid);
        let atime = changes.atime.unwrap_or(attr.atime);
        let mtime = changes.mtime.unwrap_or(attr.mtime);
        st.db.execute(
            "UPDATE inodes SET mode = ?, uid = ?, gid = ?, atime = ?, mtime = ?, ctime = ?
             WHERE id = ?",
            params![mode, uid, gid, atime, mtime, now_ts(), ino],
        )?;
        load_attr(&st.db, ino)
    }

    pub fn mknod(
        &self,
        parent: i64,
        name: &[u8],
        mode: u32,
        rdev: u32,
        uid: u32,
        gid: u32,
    ) -> Result<InodeAttr> {
        let st = self.state.lock();
        check_create(&st.db, parent, name)?;
        let ino = with_txn(&st.db, || {
            let ino = create_inode(&st.db, mode, uid, gid, rdev, 0)?;
            add_dirent(&st.db, parent, name, ino)?;
            Ok(ino)
        })?;
        load_attr(&st.db, ino)
    }

    pub fn mkdir(&self, parent: i64, name: &[u8], mode: u32, uid: u32, gid: u32) -> Result<InodeAttr> {
        let st = self.state.lock();
        check_create(&st.db, parent, name)?;
        let ino = with_txn(&st.db, || {
            let ino = create_inode(&st.db, mode | libc::S_IFDIR, uid, gid, 0, 0)?;
            add_dirent(&st.db, parent, name, ino)?;
            Ok(ino)
        })?;
        load_attr(&st.db, ino)
    }

    pub fn symlink(
        &self,
        parent: i64,
        name: &[u8],
        target: &[u8],
        uid: u32,
        gid: u32,
    ) -> Result<InodeAttr> {
        let st = self.state.lock();
        check_create(&st.db, parent, name)?;
        let ino = with_txn(&st.db, || {
            let ino = create_inode(
                &st.db,
                libc::S_IFLNK | 0o777,
                uid,
                gid,
                0,
                target.len() as u64,
            )?;
            st.db.execute(
                "INSERT INTO symlink_targets (inode, target) VALUES (?, ?)",
                params![ino, target],
            )?;
            add_dirent(&st.db, parent, name, ino)?;
            Ok(ino)
        })?;
        load_attr(&st.db, ino)
    }

    pub fn readlink(&self, ino: i64) -> Result<Vec<u8>> {
        let st = self.state.lock();
        let target: Vec<u8> = st.db.get_val(
            "SELECT target FROM symlink_targets WHERE inode = ?",
            params![ino],
        )?;
        update_atime(&st.db, ino)?;
        Ok(target)
    }

    /// Create a hard link to `ino` at (new_parent, new_name).
    pub fn link(&self, ino: i64, new_parent: i64, new_name: &[u8]) -> Result<InodeAttr> {
        let st = self.state.lock();
        let attr = load_attr(&st.db, ino)?;
        if is_dir(attr.mode) {
            return Err(FsError::Usage(libc::EPERM));
        }
        check_create(&st.db, new_parent, new_name)?;
        with_txn(&st.db, || {
            add_dirent(&st.db, new_parent, new_name, ino)?;
            st.db.execute(
                "UPDATE inodes SET refcount = refcount + 1, ctime = ? WHERE id = ?",
                params![now_ts(), ino],
            )?;
            Ok(())
        })?;
        load_attr(&st.db, ino)
    }

    pub fn unlink(&self, parent: i64, name: &[u8]) -> Result<()> {
        self.check_embedded()?;
        let tasks = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            let (name_id, ino) = lookup_entry(&st.db, parent, name)?;
            let attr = load_attr(&st.db, ino)?;
            if is_dir(attr.mode) {
                return Err(FsError::Usage(libc::EISDIR));
            }
            self.remove_dirent(st, parent, name_id, ino)?
        };
        for task in tasks {
            self.um.spawn_removal(task);
        }
        Ok(())
    }

    pub fn rmdir(&self, parent: i64, name: &[u8]) -> Result<()> {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        let (name_id, ino) = lookup_entry(&st.db, parent, name)?;
        let attr = load_attr(&st.db, ino)?;
        if !is_dir(attr.mode) {
            return Err(FsError::Usage(libc::ENOTDIR));
        }
        if st.db.has_val(
            "SELECT 1 FROM contents WHERE parent_inode = ? LIMIT 1",
            params![ino],
        )? {
            return Err(FsError::Usage(libc::ENOTEMPTY));
        }
        let tasks = self.remove_dirent(st, parent, name_id, ino)?;
        debug_assert!(tasks.is_empty(), "directories have no blocks");
        Ok(())
    }

    pub fn rename(
        &self,
        parent: i64,
        name: &[u8],
        new_parent: i64,
        new_name: &[u8],
    ) -> Result<()> {
        self.check_embedded()?;
        if parent == new_parent && name == new_name {
            return Ok(());
        }
        let tasks = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            let (name_id, ino) = lookup_entry(&st.db, parent, name)?;
            let attr = load_attr(&st.db, ino)?;

            let mut tasks = vec![];
            match lookup_entry(&st.db, new_parent, new_name) {
                Ok((target_name_id, target_ino)) => {
                    let target = load_attr(&st.db, target_ino)?;
                    if is_dir(target.mode) != is_dir(attr.mode) {
                        return Err(FsError::Usage(if is_dir(target.mode) {
                            libc::EISDIR
                        } else {
                            libc::ENOTDIR
                        }));
                    }
                    if is_dir(target.mode)
                        && st.db.has_val(
                            "SELECT 1 FROM contents WHERE parent_inode = ? LIMIT 1",
                            params![target_ino],
                        )?
                    {
                        return Err(FsError::Usage(libc::ENOTEMPTY));
                    }
                    tasks = self.remove_dirent(st, new_parent, target_name_id, target_ino)?;
                }
                Err(FsError::NoSuchRow) => {}
                Err(e) => return Err(e),
            }

            with_txn(&st.db, || {
                let new_name_id = intern_name(&st.db, new_name)?;
                st.db.execute(
                    "UPDATE contents SET name_id = ?, parent_inode = ?
                     WHERE parent_inode = ? AND name_id = ?",
                    params![new_name_id, new_parent, parent, name_id],
                )?;
                deref_name(&st.db, name_id)?;
                st.db.execute(
                    "UPDATE inodes SET ctime = ? WHERE id = ?",
                    params![now_ts(), ino],
                )?;
                update_parent_mtime(&st.db, parent)?;
                update_parent_mtime(&st.db, new_parent)?;
                Ok(())
            })?;
            tasks
        };
        for task in tasks {
            self.um.spawn_removal(task);
        }
        Ok(())
    }

    pub fn readdir(&self, ino: i64) -> Result<Vec<DirEntry>> {
        let st = self.state.lock();
        let attr = load_attr(&st.db, ino)?;
        if !is_dir(attr.mode) {
            return Err(FsError::Usage(libc::ENOTDIR));
        }
        let parent: i64 = if ino == ROOT_INODE {
            ROOT_INODE
        } else {
            st.db.get_val(
                "SELECT parent_inode FROM contents WHERE inode = ? LIMIT 1",
                params![ino],
            )?
        };
        let mut entries = vec![
            DirEntry { name: b".".to_vec(), inode: ino, mode: attr.mode },
            DirEntry { name: b"..".to_vec(), inode: parent, mode: libc::S_IFDIR },
        ];
        entries.extend(st.db.query_rows(
            "SELECT names.name, inodes.id, inodes.mode FROM contents
             JOIN names ON names.id = contents.name_id
             JOIN inodes ON inodes.id = contents.inode
             WHERE contents.parent_inode = ? ORDER BY names.name",
            params![ino],
            |row| {
                Ok(DirEntry {
                    name: row.get(0)?,
                    inode: row.get(1)?,
                    mode: row.get(2)?,
                })
            },
        )?);
        update_atime(&st.db, ino)?;
        Ok(entries)
    }

    /// Read up to `len` bytes at `offset`. Holes and unwritten block
    /// tails read as zeros; reads past EOF are short.
    pub fn read(&self, ino: i64, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.check_embedded()?;
        let (blocksize, size) = {
            let st = self.state.lock();
            let size: i64 = st
                .db
                .get_val("SELECT size FROM inodes WHERE id = ?", params![ino])?;
            (st.blocksize, size as u64)
        };
        if offset >= size {
            return Ok(vec![]);
        }
        let len = len.min((size - offset) as usize);
        let mut out: Vec<u8> = Vec::with_capacity(len);
        while out.len() < len {
            let pos = offset + out.len() as u64;
            let blockno = pos / blocksize;
            let block_off = pos % blocksize;
            let want = (len - out.len()).min((blocksize - block_off) as usize);

            let mapped = {
                let st = self.state.lock();
                st.cache.contains(&(ino, blockno))
                    || get_block_id(&st.db, ino, blockno)?.is_some()
            };
            if !mapped {
                out.resize(out.len() + want, 0);
                continue;
            }
            loop {
                self.ensure_cached(ino, blockno)?;
                let mut st = self.state.lock();
                if let Some(entry) = st.cache.get_mut(&(ino, blockno)) {
                    let chunk = entry.read_at(block_off, want)?;
                    out.extend_from_slice(&chunk);
                    // short block: the rest is a hole inside the file
                    out.resize(out.len() + (want - chunk.len()), 0);
                    break;
                }
            }
        }
        {
            let st = self.state.lock();
            update_atime(&st.db, ino)?;
        }
        Ok(out)
    }

    /// Write `data` at `offset`, touching exactly the overlapped blocks.
    pub fn write(&self, ino: i64, offset: u64, data: &[u8]) -> Result<usize> {
        self.check_embedded()?;
        let blocksize = self.state.lock().blocksize;
        let mut written = 0usize;
        while written < data.len() {
            let pos = offset + written as u64;
            let blockno = pos / blocksize;
            let block_off = pos % blocksize;
            let n = (data.len() - written).min((blocksize - block_off) as usize);
            loop {
                self.ensure_cached(ino, blockno)?;
                let mut guard = self.state.lock();
                let st = &mut *guard;
                if let Some(entry) = st.cache.get_mut(&(ino, blockno)) {
                    let old_size = entry.size;
                    entry.mark_dirty()?;
                    entry.write_at(block_off, &data[written..written + n])?;
                    if st.in_transit.contains(&(ino, blockno)) {
                        entry.modified_after_upload = true;
                    }
                    let new_size = entry.size;
                    st.cache.note_size_change(old_size, new_size);
                    break;
                }
            }
            written += n;
        }
        {
            let st = self.state.lock();
            let now = now_ts();
            st.db.execute(
                "UPDATE inodes SET size = MAX(size, ?), mtime = ?, ctime = ? WHERE id = ?",
                params![(offset + written as u64) as i64, now, now, ino],
            )?;
        }
        self.expire_cache()?;
        Ok(written)
    }

    /// Shrinking unbinds whole blocks past the new end and trims the
    /// partial last block; extending is sparse.
    pub fn truncate(&self, ino: i64, len: u64) -> Result<()> {
        self.check_embedded()?;
        let (blocksize, old_size) = {
            let st = self.state.lock();
            let size: i64 = st
                .db
                .get_val("SELECT size FROM inodes WHERE id = ?", params![ino])?;
            (st.blocksize, size as u64)
        };

        // The partial last block must be trimmed through the cache, which
        // may require a download first
        if len < old_size && len % blocksize != 0 {
            let lastno = (len - 1) / blocksize;
            let mapped = {
                let st = self.state.lock();
                get_block_id(&st.db, ino, lastno)?.is_some()
            };
            if mapped {
                self.ensure_cached(ino, lastno)?;
            }
        }

        let tasks = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            let mut tasks = vec![];
            if len < old_size {
                let last_keep: Option<u64> = if len == 0 {
                    None
                } else {
                    Some((len - 1) / blocksize)
                };

                let mut positions: Vec<(u64, i64)> = st.db.query_rows(
                    "SELECT blockno, block_id FROM inode_blocks
                     WHERE inode = ? AND blockno > ?",
                    params![ino, last_keep.map(|n| n as i64).unwrap_or(-1)],
                    |row| Ok((row.get::<_, i64>(0)? as u64, row.get(1)?)),
                )?;
                if last_keep.is_none() {
                    if let Some(block_id) = get_block_id(&st.db, ino, 0)? {
                        positions.push((0, block_id));
                    }
                }

                for (blockno, block_id) in positions {
                    unbind_block(&st.db, ino, blockno)?;
                    if let Some(obj_id) = deref_block(&st.db, block_id)? {
                        let key = (ino, blockno);
                        let transit_key = st.in_transit.contains(&key).then_some(key);
                        tasks.push(RemoveTask { obj_id, transit_key });
                    }
                }

                for key in st.cache.keys_of_inode(ino) {
                    let (_, blockno) = key;
                    let keep = match last_keep {
                        None => false,
                        Some(lk) => blockno <= lk,
                    };
                    if !keep {
                        if let Some(entry) = st.cache.remove(&key) {
                            entry.unlink_files();
                        }
                    } else if Some(blockno) == last_keep {
                        let within = len - blockno * blocksize;
                        if let Some(entry) = st.cache.peek_mut(&key) {
                            if entry.size > within {
                                let old = entry.size;
                                entry.mark_dirty()?;
                                entry.truncate_to(within)?;
                                if st.in_transit.contains(&key) {
                                    entry.modified_after_upload = true;
                                }
                                st.cache.note_size_change(old, within);
                            }
                        }
                    }
                }
            }
            let now = now_ts();
            st.db.execute(
                "UPDATE inodes SET size = ?, mtime = ?, ctime = ? WHERE id = ?",
                params![len as i64, now, now, ino],
            )?;
            tasks
        };
        for task in tasks {
            self.um.spawn_removal(task);
        }
        Ok(())
    }

    /// Enqueue every dirty block of `ino` without waiting.
    pub fn flush_inode(&self, ino: i64) -> Result<()> {
        let dirty = {
            let st = self.state.lock();
            let keys = st.cache.dirty_keys_of_inode(ino);
            keys.into_iter()
                .filter(|k| !st.in_transit.contains(k))
                .collect::<Vec<_>>()
        };
        for key in dirty {
            self.um.queue(key)?;
        }
        Ok(())
    }

    /// Upload every dirty block of `ino` and wait until none is dirty or
    /// in transit. A block overwritten while its upload runs gets a
    /// second upload cycle here.
    pub fn fsync(&self, ino: i64) -> Result<()> {
        self.check_embedded()?;
        loop {
            let dirty = {
                let st = self.state.lock();
                let keys = st.cache.dirty_keys_of_inode(ino);
                keys.into_iter()
                    .filter(|k| !st.in_transit.contains(k))
                    .collect::<Vec<_>>()
            };
            for key in &dirty {
                {
                    let mut st = self.state.lock();
                    if let Some(entry) = st.cache.peek_mut(key) {
                        entry.fsync()?;
                    }
                }
                self.um.queue(*key)?;
            }
            let busy = {
                let st = self.state.lock();
                !st.cache.dirty_keys_of_inode(ino).is_empty()
                    || st.in_transit.iter().any(|(i, _)| *i == ino)
            };
            if !busy {
                return Ok(());
            }
            self.um.join_one();
            self.check_embedded()?;
        }
    }

    pub fn statfs(&self) -> Result<StatFs> {
        let st = self.state.lock();
        let objects: i64 = st.db.get_val("SELECT COUNT(id) FROM objects", [])?;
        let inodes: i64 = st.db.get_val("SELECT COUNT(id) FROM inodes", [])?;
        // Backend capacity is unbounded; report a half-full filesystem
        Ok(StatFs {
            blocksize: st.blocksize,
            blocks: 2 * objects as u64,
            bfree: objects as u64,
            bavail: objects as u64,
            files: 2 * inodes as u64,
            ffree: inodes as u64,
        })
    }

    pub fn setxattr(&self, ino: i64, name: &[u8], value: &[u8]) -> Result<()> {
        let st = self.state.lock();
        load_attr(&st.db, ino)?;
        with_txn(&st.db, || {
            match st.db.get_val::<i64, _>(
                "SELECT name_id FROM ext_attributes WHERE inode = ?
                 AND name_id = (SELECT id FROM names WHERE name = ?)",
                params![ino, name],
            ) {
                Ok(name_id) => {
                    st.db.execute(
                        "UPDATE ext_attributes SET value = ? WHERE inode = ? AND name_id = ?",
                        params![value, ino, name_id],
                    )?;
                }
                Err(FsError::NoSuchRow) => {
                    let name_id = intern_name(&st.db, name)?;
                    st.db.execute(
                        "INSERT INTO ext_attributes (inode, name_id, value) VALUES (?, ?, ?)",
                        params![ino, name_id, value],
                    )?;
                }
                Err(e) => return Err(e),
            }
            st.db.execute(
                "UPDATE inodes SET ctime = ? WHERE id = ?",
                params![now_ts(), ino],
            )?;
            Ok(())
        })
    }

    pub fn getxattr(&self, ino: i64, name: &[u8]) -> Result<Vec<u8>> {
        let st = self.state.lock();
        match st.db.get_val(
            "SELECT value FROM ext_attributes WHERE inode = ?
             AND name_id = (SELECT id FROM names WHERE name = ?)",
            params![ino, name],
        ) {
            Err(FsError::NoSuchRow) => Err(FsError::Usage(libc::ENODATA)),
            other => other,
        }
    }

    pub fn listxattr(&self, ino: i64) -> Result<Vec<Vec<u8>>> {
        let st = self.state.lock();
        load_attr(&st.db, ino)?;
        st.db.query_col(
            "SELECT names.name FROM ext_attributes
             JOIN names ON names.id = ext_attributes.name_id
             WHERE ext_attributes.inode = ? ORDER BY names.name",
            params![ino],
        )
    }

    pub fn removexattr(&self, ino: i64, name: &[u8]) -> Result<()> {
        let st = self.state.lock();
        let name_id: i64 = match st.db.get_val(
            "SELECT name_id FROM ext_attributes WHERE inode = ?
             AND name_id = (SELECT id FROM names WHERE name = ?)",
            params![ino, name],
        ) {
            Err(FsError::NoSuchRow) => return Err(FsError::Usage(libc::ENODATA)),
            other => other?,
        };
        with_txn(&st.db, || {
            st.db.execute(
                "DELETE FROM ext_attributes WHERE inode = ? AND name_id = ?",
                params![ino, name_id],
            )?;
            deref_name(&st.db, name_id)?;
            st.db.execute(
                "UPDATE inodes SET ctime = ? WHERE id = ?",
                params![now_ts(), ino],
            )?;
            Ok(())
        })
    }

    /// Upload all dirty blocks, wait for quiescence, then drop every
    /// cache entry. Used on unmount.
    pub fn drop_all_cache(&self) -> Result<()> {
        loop {
            let dirty = {
                let st = self.state.lock();
                let keys = st.cache.dirty_keys();
                keys.into_iter()
                    .filter(|k| !st.in_transit.contains(k))
                    .collect::<Vec<_>>()
            };
            for key in dirty {
                self.um.queue(key)?;
            }
            let busy = {
                let st = self.state.lock();
                !st.cache.dirty_keys().is_empty() || !st.in_transit.is_empty()
            };
            if !busy {
                break;
            }
            self.um.join_one();
            self.check_embedded()?;
        }
        let mut guard = self.state.lock();
        let st = &mut *guard;
        for key in st.cache.lru_keys() {
            if let Some(entry) = st.cache.remove(&key) {
                entry.unlink_files();
            }
        }
        Ok(())
    }

    /// Resolve a block into the cache, downloading and verifying it from
    /// the backend when needed. Unmapped positions get an empty entry.
    fn ensure_cached(&self, ino: i64, blockno: u64) -> Result<()> {
        let key = (ino, blockno);
        let resolved = {
            let st = self.state.lock();
            if st.cache.contains(&key) {
                return Ok(());
            }
            match get_block_id(&st.db, ino, blockno)? {
                None => None,
                Some(block_id) => {
                    let (hash, obj_id): (Vec<u8>, i64) = st.db.get_row(
                        "SELECT hash, obj_id FROM blocks WHERE id = ?",
                        params![block_id],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )?;
                    Some((block_id, hash, obj_id))
                }
            }
        };

        let (data, block_id) = match resolved {
            None => (vec![], None),
            Some((block_id, hash, obj_id)) => {
                let obj_key = data_key(obj_id);
                let raw = if self.backend.read_after_create_consistent() {
                    self.backend.get(&obj_key).map_err(FsError::from)?.1
                } else {
                    // Freshly created objects may not have propagated yet
                    crate::dedupfs_lib::upload::retry_exc(crate::dedupfs_lib::RETRY_TIMEOUT, || {
                        self.backend.get(&obj_key)
                    })?
                    .1
                };
                let data = decompress(&raw)?;
                if sha256_bytes(&data) != hash {
                    error!(
                        "hash mismatch for {} (expected {}), marking filesystem damaged",
                        obj_key,
                        hex::encode(&hash)
                    );
                    self.state.lock().mark_damaged();
                    return Err(FsError::HashMismatch(obj_key));
                }
                (data, Some(block_id))
            }
        };

        let entry = CacheEntry::create(&self.cachedir, ino, blockno, &data, block_id)?;
        let mut st = self.state.lock();
        if !st.cache.contains(&key) {
            st.cache.insert(entry);
        }
        Ok(())
    }

    /// LRU eviction down to the configured cache size. Dirty victims are
    /// offered to the upload manager first and evicted once clean.
    fn expire_cache(&self) -> Result<()> {
        loop {
            let candidates = {
                let st = self.state.lock();
                if st.cache.used <= st.cache.max_size {
                    return Ok(());
                }
                st.cache.lru_keys()
            };
            let mut queued = false;
            for key in candidates {
                let evict_or_queue = {
                    let mut guard = self.state.lock();
                    let st = &mut *guard;
                    if st.cache.used <= st.cache.max_size {
                        return Ok(());
                    }
                    if st.in_transit.contains(&key) {
                        None
                    } else {
                        match st.cache.peek_mut(&key) {
                            Some(entry) if entry.dirty => Some(true),
                            Some(_) => {
                                if let Some(entry) = st.cache.remove(&key) {
                                    entry.unlink_files();
                                }
                                Some(false)
                            }
                            None => None,
                        }
                    }
                };
                if evict_or_queue == Some(true) {
                    self.um.queue(key)?;
                    queued = true;
                }
            }
            let over = {
                let st = self.state.lock();
                st.cache.used > st.cache.max_size
            };
            if !over {
                return Ok(());
            }
            if !queued && !self.um.upload_in_progress() {
                // Nothing left to evict or wait for
                return Ok(());
            }
            self.um.join_one();
            self.check_embedded()?;
        }
    }

    /// Remove one directory entry and release the inode when its link
    /// count drops to zero. Returns backend removals to schedule after
    /// the lock is released.
    fn remove_dirent(
        &self,
        st: &mut crate::dedupfs_lib::FsState,
        parent: i64,
        name_id: i64,
        ino: i64,
    ) -> Result<Vec<RemoveTask>> {
        let refcount: i64 = st.db.get_val(
            "SELECT refcount FROM inodes WHERE id = ?",
            params![ino],
        )?;
        st.db.execute(
            "DELETE FROM contents WHERE parent_inode = ? AND name_id = ?",
            params![parent, name_id],
        )?;
        deref_name(&st.db, name_id)?;
        update_parent_mtime(&st.db, parent)?;

        if refcount > 1 {
            st.db.execute(
                "UPDATE inodes SET refcount = refcount - 1, ctime = ? WHERE id = ?",
                params![now_ts(), ino],
            )?;
            return Ok(vec![]);
        }
        self.delete_inode(st, ino)
    }

    /// Release every block of `ino`, drop its cache entries and auxiliary
    /// rows, and delete the inode row itself.
    fn delete_inode(
        &self,
        st: &mut crate::dedupfs_lib::FsState,
        ino: i64,
    ) -> Result<Vec<RemoveTask>> {
        debug!("delete_inode({})", ino);
        let mut positions: Vec<(u64, i64)> = st.db.query_rows(
            "SELECT blockno, block_id FROM inode_blocks WHERE inode = ?",
            params![ino],
            |row| Ok((row.get::<_, i64>(0)? as u64, row.get(1)?)),
        )?;
        if let Some(block_id) = get_block_id(&st.db, ino, 0)? {
            positions.push((0, block_id));
        }

        let mut tasks = vec![];
        for (blockno, block_id) in positions {
            if let Some(obj_id) = deref_block(&st.db, block_id)? {
                let key: BlockKey = (ino, blockno);
                let transit_key = st.in_transit.contains(&key).then_some(key);
                tasks.push(RemoveTask { obj_id, transit_key });
            }
        }

        for key in st.cache.keys_of_inode(ino) {
            if let Some(entry) = st.cache.remove(&key) {
                entry.unlink_files();
            }
        }

        let xattr_names: Vec<i64> = st.db.query_col(
            "SELECT name_id FROM ext_attributes WHERE inode = ?",
            params![ino],
        )?;
        for name_id in xattr_names {
            deref_name(&st.db, name_id)?;
        }
        st.db.execute("DELETE FROM ext_attributes WHERE inode = ?", params![ino])?;
        st.db.execute("DELETE FROM symlink_targets WHERE inode = ?", params![ino])?;
        st.db.execute("DELETE FROM inode_blocks WHERE inode = ?", params![ino])?;
        st.db.execute("DELETE FROM inodes WHERE id = ?", params![ino])?;
        Ok(tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedupfs_lib::db::{create_tables, init_tables};
    use object_backend::memory::MemBackend;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn test_fs(dir: &TempDir, blocksize: u64) -> DedupFs {
        let db = MetaDb::open_in_memory().unwrap();
        create_tables(&db).unwrap();
        init_tables(&db).unwrap();
        DedupFs::with_parts(
            db,
            Arc::new(MemBackend::new()),
            dir.path().to_path_buf(),
            blocksize,
            1024 * 1024,
        )
        .unwrap()
    }

    #[test]
    fn mknod_lookup_getattr() -> Result<()> {
        let dir = TempDir::new()?;
        let fs = test_fs(&dir, 1024);
        let attr = fs.mknod(ROOT_INODE, b"a", libc::S_IFREG | 0o644, 0, 1000, 1000)?;
        assert_eq!(attr.nlink, 1);
        assert_eq!(attr.size, 0);
        let found = fs.lookup(ROOT_INODE, b"a")?;
        assert_eq!(found.ino, attr.ino);
        assert!(matches!(
            fs.mknod(ROOT_INODE, b"a", libc::S_IFREG | 0o644, 0, 0, 0),
            Err(FsError::Usage(libc::EEXIST))
        ));
        Ok(())
    }

    #[test]
    fn hard_links_share_inode() -> Result<()> {
        let dir = TempDir::new()?;
        let fs = test_fs(&dir, 1024);
        let attr = fs.mknod(ROOT_INODE, b"a", libc::S_IFREG | 0o644, 0, 0, 0)?;
        let linked = fs.link(attr.ino, ROOT_INODE, b"b")?;
        assert_eq!(linked.nlink, 2);
        fs.unlink(ROOT_INODE, b"a")?;
        assert_eq!(fs.getattr(attr.ino)?.nlink, 1);
        fs.unlink(ROOT_INODE, b"b")?;
        assert!(matches!(fs.getattr(attr.ino), Err(FsError::NoSuchRow)));
        Ok(())
    }

    #[test]
    fn rmdir_refuses_non_empty() -> Result<()> {
        let dir = TempDir::new()?;
        let fs = test_fs(&dir, 1024);
        let d = fs.mkdir(ROOT_INODE, b"d", 0o755, 0, 0)?;
        fs.mknod(d.ino, b"f", libc::S_IFREG | 0o644, 0, 0, 0)?;
        assert!(matches!(
            fs.rmdir(ROOT_INODE, b"d"),
            Err(FsError::Usage(libc::ENOTEMPTY))
        ));
        fs.unlink(d.ino, b"f")?;
        fs.rmdir(ROOT_INODE, b"d")?;
        Ok(())
    }

    #[test]
    fn symlink_round_trip() -> Result<()> {
        let dir = TempDir::new()?;
        let fs = test_fs(&dir, 1024);
        fs.symlink(ROOT_INODE, b"l", b"/somewhere/else", 0, 0)?;
        let attr = fs.lookup(ROOT_INODE, b"l")?;
        assert_eq!(fs.readlink(attr.ino)?, b"/somewhere/else");
        Ok(())
    }

    #[test]
    fn write_then_read_back() -> Result<()> {
        let dir = TempDir::new()?;
        let fs = test_fs(&dir, 16);
        let attr = fs.mknod(ROOT_INODE, b"a", libc::S_IFREG | 0o644, 0, 0, 0)?;
        // spans three 16-byte blocks
        let data: Vec<u8> = (0..40u8).collect();
        assert_eq!(fs.write(attr.ino, 0, &data)?, 40);
        assert_eq!(fs.getattr(attr.ino)?.size, 40);
        assert_eq!(fs.read(attr.ino, 0, 100)?, data);
        assert_eq!(fs.read(attr.ino, 18, 4)?, &data[18..22]);
        Ok(())
    }

    #[test]
    fn holes_read_as_zeros() -> Result<()> {
        let dir = TempDir::new()?;
        let fs = test_fs(&dir, 16);
        let attr = fs.mknod(ROOT_INODE, b"a", libc::S_IFREG | 0o644, 0, 0, 0)?;
        fs.write(attr.ino, 40, b"xy")?;
        assert_eq!(fs.getattr(attr.ino)?.size, 42);
        let content = fs.read(attr.ino, 0, 64)?;
        assert_eq!(content.len(), 42);
        assert!(content[..40].iter().all(|b| *b == 0));
        assert_eq!(&content[40..], b"xy");
        // only the block containing the bytes is mapped
        let st = fs.state.lock();
        assert_eq!(get_block_id(&st.db, attr.ino, 0).unwrap(), None);
        assert_eq!(get_block_id(&st.db, attr.ino, 1).unwrap(), None);
        Ok(())
    }

    #[test]
    fn read_past_eof_is_short() -> Result<()> {
        let dir = TempDir::new()?;
        let fs = test_fs(&dir, 16);
        let attr = fs.mknod(ROOT_INODE, b"a", libc::S_IFREG | 0o644, 0, 0, 0)?;
        fs.write(attr.ino, 0, b"abc")?;
        assert_eq!(fs.read(attr.ino, 3, 10)?, b"");
        assert_eq!(fs.read(attr.ino, 100, 10)?, b"");
        Ok(())
    }

    #[test]
    fn truncate_shrinks_and_extends_sparsely() -> Result<()> {
        let dir = TempDir::new()?;
        let fs = test_fs(&dir, 16);
        let attr = fs.mknod(ROOT_INODE, b"a", libc::S_IFREG | 0o644, 0, 0, 0)?;
        let data: Vec<u8> = (0..48u8).collect();
        fs.write(attr.ino, 0, &data)?;
        fs.fsync(attr.ino)?;

        fs.truncate(attr.ino, 20)?;
        assert_eq!(fs.getattr(attr.ino)?.size, 20);
        assert_eq!(fs.read(attr.ino, 0, 64)?, &data[..20]);
        {
            let st = fs.state.lock();
            assert_eq!(get_block_id(&st.db, attr.ino, 2).unwrap(), None);
        }

        fs.truncate(attr.ino, 100)?;
        let content = fs.read(attr.ino, 0, 200)?;
        assert_eq!(content.len(), 100);
        assert_eq!(&content[..20], &data[..20]);
        assert!(content[20..].iter().all(|b| *b == 0));
        Ok(())
    }

    #[test]
    fn xattr_lifecycle() -> Result<()> {
        let dir = TempDir::new()?;
        let fs = test_fs(&dir, 1024);
        let attr = fs.mknod(ROOT_INODE, b"a", libc::S_IFREG | 0o644, 0, 0, 0)?;
        assert!(matches!(
            fs.getxattr(attr.ino, b"user.color"),
            Err(FsError::Usage(libc::ENODATA))
        ));
        fs.setxattr(attr.ino, b"user.color", b"red")?;
        assert_eq!(fs.getxattr(attr.ino, b"user.color")?, b"red");
        fs.setxattr(attr.ino, b"user.color", b"blue")?;
        assert_eq!(fs.getxattr(attr.ino, b"user.color")?, b"blue");
        assert_eq!(fs.listxattr(attr.ino)?, vec![b"user.color".to_vec()]);
        fs.removexattr(attr.ino, b"user.color")?;
        assert!(fs.listxattr(attr.ino)?.is_empty());
        Ok(())
    }

    #[test]
    fn readdir_lists_children_sorted() -> Result<()> {
        let dir = TempDir::new()?;
        let fs = test_fs(&dir, 1024);
        fs.mknod(ROOT_INODE, b"b", libc::S_IFREG | 0o644, 0, 0, 0)?;
        fs.mknod(ROOT_INODE, b"a", libc::S_IFREG | 0o644, 0, 0, 0)?;
        let entries = fs.readdir(ROOT_INODE)?;
        let names: Vec<&[u8]> = entries.iter().map(|e| e.name.as_slice()).collect();
        assert_eq!(names, vec![b".".as_slice(), b"..", b"a", b"b"]);
        Ok(())
    }

    #[test]
    fn rename_replaces_target() -> Result<()> {
        let dir = TempDir::new()?;
        let fs = test_fs(&dir, 1024);
        let a = fs.mknod(ROOT_INODE, b"a", libc::S_IFREG | 0o644, 0, 0, 0)?;
        fs.mknod(ROOT_INODE, b"b", libc::S_IFREG | 0o644, 0, 0, 0)?;
        fs.rename(ROOT_INODE, b"a", ROOT_INODE, b"b")?;
        assert!(matches!(fs.lookup(ROOT_INODE, b"a"), Err(FsError::NoSuchRow)));
        assert_eq!(fs.lookup(ROOT_INODE, b"b")?.ino, a.ino);
        // names table kept consistent: only "b" remains
        let st = fs.state.lock();
        let names: i64 = st.db.get_val("SELECT COUNT(*) FROM names", []).unwrap();
        assert_eq!(names, 1);
        Ok(())
    }
}
