/// Filesystem-wide commit protocol with the backend: sequence numbers,
/// metadata cycling, mkfs, mount and unmount.
///
/// Mounting bumps the sequence number and writes a marker object; a clean
/// unmount uploads the metadata dump carrying that sequence number. After
/// a crash the dump on the backend lags behind the markers, which the
/// next mount or fsck detects.
use crate::dedupfs_lib::db::{create_tables, dump_metadata, init_tables, restore_metadata, MetaDb};
use crate::dedupfs_lib::errors::{FsError, Result};
use crate::dedupfs_lib::utils::{
    bak_key, compress, decompress, escape_storage_url, now_ts, seq_no_key,
};
use crate::dedupfs_lib::{
    DedupFs, CURRENT_FS_REV, METADATA_BACKUPS, METADATA_KEY, PASSPHRASE_KEY, ROOT_INODE,
    SEQNO_KEY_PREFIX,
};
use log::*;
use object_backend::{Backend, ObjectMeta};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// The singleton `parameters` record. Lives in the database, in the
/// local `.params` file, and as object metadata on `s3ql_metadata`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parameters {
    pub revision: u32,
    pub seq_no: u64,
    pub label: String,
    pub blocksize: u64,
    pub needs_fsck: bool,
    pub last_fsck: f64,
    pub last_modified: f64,
    pub max_inode: i64,
    pub inode_gen: i64,
}

impl Parameters {
    pub fn new(label: String, blocksize: u64) -> Self {
        let now = now_ts();
        Self {
            revision: CURRENT_FS_REV,
            seq_no: 0,
            label,
            blocksize,
            needs_fsck: false,
            last_fsck: now,
            last_modified: now,
            max_inode: ROOT_INODE,
            inode_gen: 0,
        }
    }

    pub fn to_meta(&self) -> ObjectMeta {
        let mut meta = ObjectMeta::new();
        meta.insert("revision".to_string(), self.revision.to_string());
        meta.insert("seq_no".to_string(), self.seq_no.to_string());
        meta.insert("label".to_string(), self.label.clone());
        meta.insert("blocksize".to_string(), self.blocksize.to_string());
        meta.insert("needs_fsck".to_string(), (self.needs_fsck as u8).to_string());
        meta.insert("last_fsck".to_string(), self.last_fsck.to_string());
        meta.insert("last_modified".to_string(), self.last_modified.to_string());
        meta.insert("max_inode".to_string(), self.max_inode.to_string());
        meta.insert("inode_gen".to_string(), self.inode_gen.to_string());
        meta
    }

    pub fn from_meta(meta: &ObjectMeta) -> Result<Self> {
        fn field<T: std::str::FromStr>(meta: &ObjectMeta, key: &str) -> Result<T> {
            meta.get(key)
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| FsError::Corrupt(format!("parameters field {} missing", key)))
        }
        Ok(Self {
            revision: field(meta, "revision")?,
            seq_no: field(meta, "seq_no")?,
            label: meta.get("label").cloned().unwrap_or_default(),
            blocksize: field(meta, "blocksize")?,
            needs_fsck: field::<u8>(meta, "needs_fsck")? != 0,
            last_fsck: field(meta, "last_fsck")?,
            last_modified: field(meta, "last_modified")?,
            max_inode: field(meta, "max_inode")?,
            inode_gen: field(meta, "inode_gen")?,
        })
    }

    pub fn load_db(db: &MetaDb) -> Result<Self> {
        db.get_row(
            "SELECT revision, seq_no, label, blocksize, needs_fsck, last_fsck,
                    last_modified, max_inode, inode_gen
             FROM parameters WHERE id = 0",
            [],
            |row| {
                Ok(Self {
                    revision: row.get(0)?,
                    seq_no: row.get::<_, i64>(1)? as u64,
                    label: row.get(2)?,
                    blocksize: row.get::<_, i64>(3)? as u64,
                    needs_fsck: row.get(4)?,
                    last_fsck: row.get(5)?,
                    last_modified: row.get(6)?,
                    max_inode: row.get(7)?,
                    inode_gen: row.get(8)?,
                })
            },
        )
    }

    pub fn save_db(&self, db: &MetaDb) -> Result<()> {
        db.execute(
            "INSERT OR REPLACE INTO parameters
             (id, revision, seq_no, label, blocksize, needs_fsck, last_fsck,
              last_modified, max_inode, inode_gen)
             VALUES (0, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            rusqlite::params![
                self.revision,
                self.seq_no as i64,
                self.label,
                self.blocksize as i64,
                self.needs_fsck,
                self.last_fsck,
                self.last_modified,
                self.max_inode,
                self.inode_gen
            ],
        )?;
        Ok(())
    }

    pub fn load_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path)?;
        serde_json::from_slice(&raw)
            .map_err(|e| FsError::Corrupt(format!("parameters file: {}", e)))
    }

    pub fn save_file(&self, path: &Path) -> Result<()> {
        let raw = serde_json::to_vec_pretty(self).expect("parameters serialize");
        std::fs::write(path, raw)?;
        Ok(())
    }
}

/// Local file locations for one filesystem, derived from its storage URL:
/// `<name>.db`, `<name>.params`, `<name>-cache/` and `<name>.lock`.
#[derive(Debug, Clone)]
pub struct CachePaths {
    base: PathBuf,
}

impl CachePaths {
    pub fn new(cachedir: &Path, storage_url: &str) -> Self {
        Self { base: cachedir.join(escape_storage_url(storage_url)) }
    }

    fn with_suffix(&self, suffix: &str) -> PathBuf {
        let mut name = self.base.as_os_str().to_owned();
        name.push(suffix);
        PathBuf::from(name)
    }

    pub fn db(&self) -> PathBuf {
        self.with_suffix(".db")
    }

    pub fn params(&self) -> PathBuf {
        self.with_suffix(".params")
    }

    pub fn cache(&self) -> PathBuf {
        self.with_suffix("-cache")
    }

    pub fn lock(&self) -> PathBuf {
        self.with_suffix(".lock")
    }

    pub fn parent(&self) -> Option<&Path> {
        self.base.parent()
    }
}

/// Current filesystem epoch: the largest `k` among `s3ql_seq_no_<k>`.
pub fn get_seq_no(backend: &dyn Backend) -> Result<u64> {
    backend
        .list(SEQNO_KEY_PREFIX)?
        .iter()
        .filter_map(|key| key.strip_prefix(SEQNO_KEY_PREFIX)?.parse::<u64>().ok())
        .max()
        .ok_or_else(|| FsError::Corrupt("no sequence number markers found".to_string()))
}

/// Dump, compress and store the metadata, parameters riding as object
/// metadata.
pub fn upload_metadata(backend: &dyn Backend, db: &MetaDb, params: &Parameters) -> Result<()> {
    let mut raw = vec![];
    dump_metadata(db, &mut raw)?;
    let body = compress(&raw)?;
    info!(
        "uploading metadata ({} bytes compressed, seq_no {})",
        body.len(),
        params.seq_no
    );
    backend.put(METADATA_KEY, &body, &params.to_meta(), true)?;
    Ok(())
}

/// Fetch and restore the metadata dump into a fresh database at `db_path`.
pub fn download_metadata(backend: &dyn Backend, db_path: &Path) -> Result<(Parameters, MetaDb)> {
    let (meta, body) = backend.get(METADATA_KEY)?;
    let params = Parameters::from_meta(&meta)?;
    let raw = decompress(&body)?;
    if db_path.exists() {
        std::fs::remove_file(db_path)?;
    }
    let db = MetaDb::open(db_path)?;
    create_tables(&db)?;
    restore_metadata(raw.as_slice(), &db)?;
    Ok((params, db))
}

/// Rotate the current metadata into the backup slots, keeping
/// `METADATA_BACKUPS` generations.
pub fn cycle_metadata(backend: &dyn Backend) -> Result<()> {
    for n in (0..METADATA_BACKUPS.saturating_sub(1)).rev() {
        let src = bak_key(n);
        if backend.contains(&src)? {
            backend.copy(&src, &bak_key(n + 1))?;
        }
    }
    if backend.contains(METADATA_KEY)? {
        backend.copy(METADATA_KEY, &bak_key(0))?;
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct MkfsOptions {
    pub blocksize_kib: u64,
    pub label: String,
    pub plain: bool,
    pub force: bool,
}

impl Default for MkfsOptions {
    fn default() -> Self {
        Self { blocksize_kib: 10240, label: String::new(), plain: false, force: false }
    }
}

/// Initialize a new filesystem on the backend.
pub fn mkfs(backend: &dyn Backend, paths: &CachePaths, opts: &MkfsOptions) -> Result<()> {
    if backend.contains(METADATA_KEY)? {
        if !opts.force {
            error!("found existing file system, use --force to overwrite");
            return Err(FsError::Usage(libc::EEXIST));
        }
        info!("purging existing file system data..");
        backend.clear()?;
        if !backend.list_after_delete_consistent() || !backend.read_after_delete_consistent() {
            info!(
                "note: the new file system may appear inconsistent \
                 until the removals have propagated through the backend"
            );
        }
    }

    if !opts.plain {
        // The wrapping of this key happens outside the core; we only
        // generate and store the raw data passphrase
        let mut key = [0u8; 32];
        rand::thread_rng().fill(&mut key[..]);
        backend.put(PASSPHRASE_KEY, &key, &ObjectMeta::new(), false)?;
    }

    // No filesystem can own these local files anymore
    if paths.db().exists() {
        std::fs::remove_file(paths.db())?;
    }
    if paths.cache().exists() {
        std::fs::remove_dir_all(paths.cache())?;
    }
    if let Some(parent) = paths.parent() {
        std::fs::create_dir_all(parent)?;
    }

    info!("creating metadata tables...");
    let db = MetaDb::open(&paths.db())?;
    create_tables(&db)?;
    init_tables(&db)?;

    let params = Parameters::new(opts.label.clone(), opts.blocksize_kib * 1024);
    backend.put(&seq_no_key(params.seq_no), b"Empty", &ObjectMeta::new(), false)?;
    params.save_db(&db)?;

    info!("compressing and uploading metadata..");
    upload_metadata(backend, &db, &params)?;
    params.save_file(&paths.params())?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct MountOptions {
    pub cache_size: u64,
    /// Operator confirmation to mount despite a sequence number mismatch.
    pub force: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self { cache_size: crate::dedupfs_lib::DEFAULT_CACHE_SIZE, force: false }
    }
}

/// Mount handshake: resolve the metadata to use, verify sequence numbers,
/// open a new epoch and return the live filesystem.
pub fn mount(backend: Arc<dyn Backend>, paths: &CachePaths, opts: &MountOptions) -> Result<DedupFs> {
    if let Some(parent) = paths.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if paths.lock().exists() {
        error!("file system appears to be mounted already ({:?})", paths.lock());
        return Err(FsError::Usage(libc::EBUSY));
    }
    if paths.cache().exists() {
        error!("local cache directory exists, file system was not unmounted cleanly; run fsck");
        return Err(FsError::Usage(libc::EBUSY));
    }

    let seq_no = get_seq_no(backend.as_ref())?;
    let param_remote = Parameters::from_meta(&backend.lookup(METADATA_KEY)?)?;

    let (mut params, db) = if paths.params().exists() {
        let local = Parameters::load_file(&paths.params())?;
        if local.seq_no == seq_no {
            info!("using cached metadata");
            (local, MetaDb::open(&paths.db())?)
        } else {
            info!("local metadata outdated, downloading");
            download_metadata(backend.as_ref(), &paths.db())?
        }
    } else {
        download_metadata(backend.as_ref(), &paths.db())?
    };

    if params.revision != CURRENT_FS_REV {
        error!(
            "file system revision {} does not match this version ({})",
            params.revision, CURRENT_FS_REV
        );
        return Err(FsError::Usage(libc::EINVAL));
    }
    if param_remote.seq_no != params.seq_no {
        warn!("remote metadata is outdated, file system was not unmounted cleanly");
        params.needs_fsck = true;
    }
    if params.needs_fsck && !opts.force {
        error!("file system damaged or not unmounted cleanly, run fsck");
        return Err(FsError::Corrupt("file system needs fsck".to_string()));
    }

    // Open a new epoch: the metadata upload at unmount carries this
    // sequence number, so a crash leaves the markers ahead of the dump
    params.seq_no = seq_no + 1;
    backend.put(&seq_no_key(params.seq_no), b"Empty", &ObjectMeta::new(), false)?;
    params.save_db(&db)?;
    params.save_file(&paths.params())?;

    std::fs::write(paths.lock(), std::process::id().to_string())?;
    std::fs::create_dir_all(paths.cache())?;

    let blocksize = params.blocksize;
    DedupFs::with_parts(db, backend, paths.cache(), blocksize, opts.cache_size)
}

/// Clean unmount: flush everything, then publish the metadata dump under
/// the current sequence number and rotate the previous generation.
pub fn unmount(fs: DedupFs, paths: &CachePaths) -> Result<()> {
    info!("flushing cache...");
    fs.drop_all_cache()?;
    fs.um.join_all();
    fs.um.join_removals();
    fs.check_embedded()?;
    {
        let st = fs.state.lock();
        if st.encountered_errors {
            error!("background errors occurred, refusing to unmount cleanly");
            return Err(FsError::Embedded("unmount after background errors".to_string()));
        }
    }

    let st = fs.state.lock();
    let mut params = Parameters::load_db(&st.db)?;
    params.needs_fsck = false;
    params.last_modified = now_ts();

    cycle_metadata(fs.backend.as_ref())?;
    params.save_db(&st.db)?;
    st.db.vacuum()?;
    upload_metadata(fs.backend.as_ref(), &st.db, &params)?;
    params.save_file(&paths.params())?;
    drop(st);

    std::fs::remove_dir(paths.cache()).ok();
    std::fs::remove_file(paths.lock()).ok();
    info!("unmounted cleanly");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_backend::memory::MemBackend;
    use tempfile::TempDir;

    #[test]
    fn parameters_meta_round_trip() {
        let mut params = Parameters::new("home".to_string(), 4096);
        params.seq_no = 9;
        params.needs_fsck = true;
        let back = Parameters::from_meta(&params.to_meta()).unwrap();
        assert_eq!(back.seq_no, 9);
        assert_eq!(back.label, "home");
        assert!(back.needs_fsck);
        assert_eq!(back.blocksize, 4096);
    }

    #[test]
    fn seq_no_is_max_of_markers() {
        let backend = MemBackend::new();
        assert!(get_seq_no(&backend).is_err());
        for n in [0u64, 3, 11] {
            backend
                .put(&seq_no_key(n), b"Empty", &ObjectMeta::new(), false)
                .unwrap();
        }
        assert_eq!(get_seq_no(&backend).unwrap(), 11);
    }

    #[test]
    fn cycle_rotates_backups() {
        let backend = MemBackend::new();
        backend
            .put(METADATA_KEY, b"gen2", &ObjectMeta::new(), true)
            .unwrap();
        backend
            .put(&bak_key(0), b"gen1", &ObjectMeta::new(), true)
            .unwrap();
        backend
            .put(&bak_key(1), b"gen0", &ObjectMeta::new(), true)
            .unwrap();
        cycle_metadata(&backend).unwrap();
        assert_eq!(backend.get(&bak_key(0)).unwrap().1, b"gen2");
        assert_eq!(backend.get(&bak_key(1)).unwrap().1, b"gen1");
        assert_eq!(backend.get(&bak_key(2)).unwrap().1, b"gen0");
    }

    #[test]
    fn mkfs_mount_unmount_cycle() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(MemBackend::new());
        let paths = CachePaths::new(dir.path(), "local://bucket");

        mkfs(backend.as_ref(), &paths, &MkfsOptions::default()).unwrap();
        assert!(backend.contains(METADATA_KEY).unwrap());
        assert!(backend.contains(&seq_no_key(0)).unwrap());
        assert!(backend.contains(PASSPHRASE_KEY).unwrap());

        let fs = mount(backend.clone(), &paths, &MountOptions::default()).unwrap();
        assert_eq!(get_seq_no(backend.as_ref()).unwrap(), 1);
        unmount(fs, &paths).unwrap();

        // Clean remount: remote metadata matches the markers again
        let fs = mount(backend.clone(), &paths, &MountOptions::default()).unwrap();
        unmount(fs, &paths).unwrap();
    }

    #[test]
    fn mkfs_refuses_existing_without_force() {
        let dir = TempDir::new().unwrap();
        let backend = MemBackend::new();
        let paths = CachePaths::new(dir.path(), "local://bucket");
        mkfs(&backend, &paths, &MkfsOptions::default()).unwrap();
        let res = mkfs(&backend, &paths, &MkfsOptions::default());
        assert!(matches!(res, Err(FsError::Usage(libc::EEXIST))));
        let mut opts = MkfsOptions::default();
        opts.force = true;
        mkfs(&backend, &paths, &opts).unwrap();
    }

    #[test]
    fn mount_detects_unclean_epoch() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(MemBackend::new());
        let paths = CachePaths::new(dir.path(), "local://bucket");
        mkfs(backend.as_ref(), &paths, &MkfsOptions::default()).unwrap();

        // Crash simulation: mount writes the new marker, no clean unmount
        let fs = mount(backend.clone(), &paths, &MountOptions::default()).unwrap();
        drop(fs);
        std::fs::remove_dir_all(paths.cache()).unwrap();
        std::fs::remove_file(paths.lock()).unwrap();

        let res = mount(backend.clone(), &paths, &MountOptions::default());
        assert!(matches!(res, Err(FsError::Corrupt(_))));
    }
}
