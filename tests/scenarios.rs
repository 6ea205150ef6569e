/// End-to-end scenarios over the in-memory backend: deduplication,
/// orphan removal, crash recovery and the concurrent-write protocol.
use dedupfs::commit::{mkfs, mount, unmount, CachePaths, MkfsOptions, MountOptions};
use dedupfs::fsck::{fsck_run, FsckOptions};
use dedupfs::utils::{data_key, decompress};
use dedupfs::{DedupFs, ROOT_INODE};
use object_backend::memory::MemBackend;
use object_backend::{Backend, ObjectMeta, Result as BackendResult};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn mkfs_opts(blocksize_kib: u64) -> MkfsOptions {
    MkfsOptions { blocksize_kib, plain: true, ..MkfsOptions::default() }
}

fn setup(blocksize_kib: u64) -> (TempDir, Arc<MemBackend>, CachePaths) {
    let dir = TempDir::new().unwrap();
    let backend = Arc::new(MemBackend::new());
    let paths = CachePaths::new(dir.path(), "local://test-bucket");
    mkfs(backend.as_ref(), &paths, &mkfs_opts(blocksize_kib)).unwrap();
    (dir, backend, paths)
}

fn create_file(fs: &DedupFs, name: &[u8]) -> i64 {
    fs.mknod(ROOT_INODE, name, libc::S_IFREG | 0o644, 0, 1000, 1000)
        .unwrap()
        .ino
}

fn data_objects(backend: &MemBackend) -> usize {
    backend.list("s3ql_data_").unwrap().len()
}

#[test]
fn write_flush_dedup_unlink_cycle() {
    let (_dir, backend, paths) = setup(1);
    let fs = mount(backend.clone(), &paths, &MountOptions::default()).unwrap();

    // Scenario 1: one small file, one object
    let a = create_file(&fs, b"a");
    fs.write(a, 0, b"hello").unwrap();
    fs.fsync(a).unwrap();
    assert_eq!(data_objects(&backend), 1);
    {
        let st = fs.state.lock();
        let blocks: i64 = st.db.get_val("SELECT COUNT(*) FROM blocks", []).unwrap();
        let objects: i64 = st.db.get_val("SELECT COUNT(*) FROM objects", []).unwrap();
        assert_eq!((blocks, objects), (1, 1));
    }

    // Scenario 2: same content in a second file deduplicates
    let b = create_file(&fs, b"b");
    fs.write(b, 0, b"hello").unwrap();
    fs.fsync(b).unwrap();
    assert_eq!(data_objects(&backend), 1);
    {
        let st = fs.state.lock();
        let refcount: i64 = st.db.get_val("SELECT refcount FROM blocks", []).unwrap();
        assert_eq!(refcount, 2);
        let a_block: Option<i64> = st
            .db
            .get_val("SELECT block_id FROM inodes WHERE id = ?", [a])
            .unwrap();
        let b_block: Option<i64> = st
            .db
            .get_val("SELECT block_id FROM inodes WHERE id = ?", [b])
            .unwrap();
        assert_eq!(a_block, b_block);
        assert!(a_block.is_some());
    }
    assert_eq!(fs.getattr(a).unwrap().nlink, 1);
    assert_eq!(fs.getattr(b).unwrap().nlink, 1);

    // Scenario 3: unlinking one file keeps the shared block and object
    fs.unlink(ROOT_INODE, b"a").unwrap();
    fs.um.join_removals();
    assert_eq!(data_objects(&backend), 1);
    {
        let st = fs.state.lock();
        let refcount: i64 = st.db.get_val("SELECT refcount FROM blocks", []).unwrap();
        assert_eq!(refcount, 1);
    }

    // Scenario 4: the last unlink removes the object from the backend
    fs.unlink(ROOT_INODE, b"b").unwrap();
    fs.um.join_removals();
    assert_eq!(data_objects(&backend), 0);
    {
        let st = fs.state.lock();
        let blocks: i64 = st.db.get_val("SELECT COUNT(*) FROM blocks", []).unwrap();
        let objects: i64 = st.db.get_val("SELECT COUNT(*) FROM objects", []).unwrap();
        assert_eq!((blocks, objects), (0, 0));
    }

    unmount(fs, &paths).unwrap();
}

#[test]
fn data_survives_remount() {
    let (_dir, backend, paths) = setup(1);
    let payload: Vec<u8> = (0..200u8).cycle().take(3000).collect();

    let fs = mount(backend.clone(), &paths, &MountOptions::default()).unwrap();
    let ino = create_file(&fs, b"f");
    // crosses several 1 KiB blocks at an unaligned offset
    fs.write(ino, 1500, &payload).unwrap();
    unmount(fs, &paths).unwrap();

    let fs = mount(backend.clone(), &paths, &MountOptions::default()).unwrap();
    let attr = fs.lookup(ROOT_INODE, b"f").unwrap();
    assert_eq!(attr.size, 1500 + 3000);
    assert_eq!(fs.read(attr.ino, 1500, 3000).unwrap(), payload);
    // the leading hole reads as zeros
    assert!(fs.read(attr.ino, 0, 1500).unwrap().iter().all(|b| *b == 0));
    unmount(fs, &paths).unwrap();
}

#[test]
fn fsync_is_idempotent() {
    let (_dir, backend, paths) = setup(1);
    let fs = mount(backend.clone(), &paths, &MountOptions::default()).unwrap();
    let ino = create_file(&fs, b"f");
    fs.write(ino, 0, b"content").unwrap();
    fs.fsync(ino).unwrap();
    let puts = backend.put_count();
    fs.fsync(ino).unwrap();
    fs.fsync(ino).unwrap();
    assert_eq!(backend.put_count(), puts);
    unmount(fs, &paths).unwrap();
}

#[test]
fn repeated_truncate_is_noop_on_backend() {
    let (_dir, backend, paths) = setup(1);
    let fs = mount(backend.clone(), &paths, &MountOptions::default()).unwrap();
    let ino = create_file(&fs, b"f");
    fs.write(ino, 0, &[7u8; 2500]).unwrap();
    fs.fsync(ino).unwrap();

    fs.truncate(ino, 1200).unwrap();
    fs.fsync(ino).unwrap();
    fs.um.join_removals();
    let puts = backend.put_count();
    let objects = data_objects(&backend);

    fs.truncate(ino, 1200).unwrap();
    fs.fsync(ino).unwrap();
    fs.um.join_removals();
    assert_eq!(backend.put_count(), puts);
    assert_eq!(data_objects(&backend), objects);
    unmount(fs, &paths).unwrap();
}

#[test]
fn boundary_write_touches_only_affected_blocks() {
    let (_dir, backend, paths) = setup(1);
    let fs = mount(backend.clone(), &paths, &MountOptions::default()).unwrap();
    let ino = create_file(&fs, b"f");
    fs.write(ino, 0, &[1u8; 3 * 1024]).unwrap();
    fs.fsync(ino).unwrap();
    let puts = backend.put_count();

    // rewrite across the boundary of blocks 1 and 2 only
    fs.write(ino, 2000, &[2u8; 100]).unwrap();
    fs.fsync(ino).unwrap();
    // blocks 1 and 2 changed, block 0 did not
    assert_eq!(backend.put_count(), puts + 2);
    unmount(fs, &paths).unwrap();
}

#[test]
fn crash_recovery_removes_orphan_and_keeps_data() {
    let (_dir, backend, paths) = setup(1);

    // Session that never unmounts cleanly
    let fs = mount(backend.clone(), &paths, &MountOptions::default()).unwrap();
    let ino = create_file(&fs, b"kept");
    fs.write(ino, 0, b"precious bytes").unwrap();
    fs.fsync(ino).unwrap();
    drop(fs);

    // The crash left an object that never made it into the metadata
    backend
        .put(&data_key(4242), b"orphan", &ObjectMeta::new(), true)
        .unwrap();

    // A plain mount must detect the stale epoch
    std::fs::remove_file(paths.lock()).unwrap();
    std::fs::remove_dir_all(paths.cache()).unwrap();
    assert!(mount(backend.clone(), &paths, &MountOptions::default()).is_err());

    fsck_run(
        backend.as_ref(),
        &paths,
        &FsckOptions { batch: false, force: true, accept_outdated: true },
    )
    .unwrap();
    assert!(!backend.contains(&data_key(4242)).unwrap());

    // Clean mount afterwards, with the flushed data intact
    let fs = mount(backend.clone(), &paths, &MountOptions::default()).unwrap();
    let attr = fs.lookup(ROOT_INODE, b"kept").unwrap();
    assert_eq!(fs.read(attr.ino, 0, 64).unwrap(), b"precious bytes");
    unmount(fs, &paths).unwrap();
}

/// Backend whose data puts block until the gate opens, to freeze an
/// upload mid-flight.
struct GatedBackend {
    inner: MemBackend,
    gate: (Mutex<bool>, Condvar),
    data_puts: std::sync::atomic::AtomicU64,
}

impl GatedBackend {
    fn new() -> Self {
        Self {
            inner: MemBackend::new(),
            gate: (Mutex::new(false), Condvar::new()),
            data_puts: std::sync::atomic::AtomicU64::new(0),
        }
    }

    fn close_gate(&self) {
        *self.gate.0.lock() = true;
    }

    fn open_gate(&self) {
        *self.gate.0.lock() = false;
        self.gate.1.notify_all();
    }
}

impl Backend for GatedBackend {
    fn lookup(&self, key: &str) -> BackendResult<ObjectMeta> {
        self.inner.lookup(key)
    }
    fn get(&self, key: &str) -> BackendResult<(ObjectMeta, Vec<u8>)> {
        self.inner.get(key)
    }
    fn put(&self, key: &str, data: &[u8], meta: &ObjectMeta, is_compressed: bool) -> BackendResult<()> {
        if key.starts_with("s3ql_data_") {
            self.data_puts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let (lock, cond) = &self.gate;
            let mut closed = lock.lock();
            while *closed {
                cond.wait(&mut closed);
            }
        }
        self.inner.put(key, data, meta, is_compressed)
    }
    fn delete(&self, key: &str) -> BackendResult<()> {
        self.inner.delete(key)
    }
    fn list(&self, prefix: &str) -> BackendResult<Vec<String>> {
        self.inner.list(prefix)
    }
    fn clear(&self) -> BackendResult<()> {
        self.inner.clear()
    }
    fn read_after_create_consistent(&self) -> bool { true }
    fn read_after_delete_consistent(&self) -> bool { true }
    fn list_after_delete_consistent(&self) -> bool { true }
    fn is_get_consistent(&self) -> bool { true }
}

#[test]
fn overwrite_during_upload_triggers_second_cycle() {
    let dir = TempDir::new().unwrap();
    let backend = Arc::new(GatedBackend::new());
    let paths = CachePaths::new(dir.path(), "local://gated-bucket");
    mkfs(backend.as_ref(), &paths, &mkfs_opts(1)).unwrap();
    let fs = mount(backend.clone(), &paths, &MountOptions::default()).unwrap();

    let ino = create_file(&fs, b"f");
    fs.write(ino, 0, b"first version").unwrap();

    // Freeze the first upload inside the backend put
    backend.close_gate();
    fs.flush_inode(ino).unwrap();
    while !fs.state.lock().in_transit.contains(&(ino, 0)) {
        std::thread::sleep(Duration::from_millis(1));
    }

    // Overwrite while the upload is frozen
    fs.write(ino, 0, b"final version").unwrap();
    {
        let st = fs.state.lock();
        assert_eq!(st.in_transit.len(), 1);
    }

    backend.open_gate();
    fs.fsync(ino).unwrap();
    fs.um.join_removals();

    // Exactly two data puts, and the surviving object holds the second write
    assert_eq!(backend.data_puts.load(std::sync::atomic::Ordering::SeqCst), 2);
    let keys = backend.list("s3ql_data_").unwrap();
    assert_eq!(keys.len(), 1);
    let (_, body) = backend.get(&keys[0]).unwrap();
    assert_eq!(decompress(&body).unwrap(), b"final version");
    assert_eq!(fs.read(ino, 0, 64).unwrap(), b"final version");

    unmount(fs, &paths).unwrap();
}
