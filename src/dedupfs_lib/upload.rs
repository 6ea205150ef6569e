/// Deduplication and the compress/upload/removal pipeline.
///
/// Dirty cache entries enter through `queue`, which implements the
/// atomic add transition: hash, dedup lookup, (re)binding of the file
/// position, refcount maintenance, and admission into the in-transit
/// set. New content then flows compress thread -> upload thread ->
/// backend, while orphaned objects flow to the removal threads.
use crate::dedupfs_lib::errors::{FsError, Result};
use crate::dedupfs_lib::threads::ThreadGroup;
use crate::dedupfs_lib::utils::{compress, data_key, sha256_bytes};
use crate::dedupfs_lib::{
    bind_block, deref_block, BlockKey, FsState, MAX_COMPRESS_THREADS, MAX_REMOVAL_THREADS,
    MAX_UPLOAD_THREADS, MIN_TRANSIT_SIZE, RETRY_TIMEOUT,
};
use log::*;
use object_backend::{Backend, BackendError, ObjectMeta};
use parking_lot::Mutex;
use retry::OperationResult;
use rusqlite::params;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

/// Clones share all pipeline state; workers carry a clone.
#[derive(Clone)]
pub struct UploadManager {
    state: Arc<Mutex<FsState>>,
    backend: Arc<dyn Backend>,
    pub compress_threads: ThreadGroup,
    pub upload_threads: ThreadGroup,
    pub removal_threads: ThreadGroup,
}

/// Deferred backend removal of one orphaned object. If `transit_key` is
/// set, the worker waits until that position has left the in-transit set
/// before deleting, so the create/put/delete order per object holds.
pub struct RemoveTask {
    pub obj_id: i64,
    pub transit_key: Option<BlockKey>,
}

impl UploadManager {
    pub fn new(state: Arc<Mutex<FsState>>, backend: Arc<dyn Backend>) -> Arc<Self> {
        Arc::new(Self {
            state,
            backend,
            compress_threads: ThreadGroup::new(MAX_COMPRESS_THREADS),
            upload_threads: ThreadGroup::new(MAX_UPLOAD_THREADS),
            removal_threads: ThreadGroup::new(MAX_REMOVAL_THREADS),
        })
    }

    /// Upload the dirty cache entry at `key` asynchronously, linking to
    /// an existing block instead when the content already exists.
    /// Returns the uncompressed size. Must be called without the global
    /// lock held.
    pub fn queue(&self, key: BlockKey) -> Result<u64> {
        let (inode, blockno) = key;
        debug!("queue(inode={}, blockno={}): start", inode, blockno);

        // Reopen the dirty file so reading is independent of the entry's
        // cursor; the read and the hashing happen outside the lock.
        let (old_block_id, mut fh) = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            if st.in_transit.contains(&key) {
                return Err(FsError::InvariantViolated(format!(
                    "block ({}, {}) already in transit",
                    inode, blockno
                )));
            }
            let entry = match st.cache.peek_mut(&key) {
                Some(e) if e.dirty => e,
                _ => return Ok(0),
            };
            (entry.block_id, entry.reopen_dirty()?)
        };

        let mut buf = Vec::new();
        fh.read_to_end(&mut buf)?;
        drop(fh);
        let size = buf.len() as u64;
        let hash = sha256_bytes(&buf);

        let (need_upload, to_delete) = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            if st.in_transit.contains(&key) {
                // Raced with another handler that queued this position
                return Ok(size);
            }
            let entry = match st.cache.peek_mut(&key) {
                Some(e) if e.dirty => e,
                _ => return Ok(0),
            };

            let found: Option<i64> = match st
                .db
                .get_val("SELECT id FROM blocks WHERE hash = ?", params![hash])
            {
                Ok(id) => Some(id),
                Err(FsError::NoSuchRow) => None,
                Err(e) => return Err(e),
            };

            let mut need_upload = None;
            match found {
                Some(hit) if old_block_id == Some(hit) => {
                    debug!(
                        "queue(inode={}, blockno={}): unchanged, block_id={}",
                        inode, blockno, hit
                    );
                    entry.commit()?;
                    return Ok(size);
                }
                Some(hit) => {
                    debug!(
                        "queue(inode={}, blockno={}): (re)linking to block {}",
                        inode, blockno, hit
                    );
                    st.db.execute(
                        "UPDATE blocks SET refcount = refcount + 1 WHERE id = ?",
                        params![hit],
                    )?;
                    entry.block_id = Some(hit);
                }
                None => {
                    let obj_id = st.db.rowid(
                        "INSERT INTO objects (refcount, size) VALUES (1, ?)",
                        params![size as i64],
                    )?;
                    let block_id = st.db.rowid(
                        "INSERT INTO blocks (refcount, hash, obj_id) VALUES (1, ?, ?)",
                        params![hash, obj_id],
                    )?;
                    debug!(
                        "queue(inode={}, blockno={}): created block {} / object {}",
                        inode, blockno, block_id, obj_id
                    );
                    entry.block_id = Some(block_id);
                    need_upload = Some(obj_id);
                }
            }

            let new_block_id = entry.block_id.expect("bound above");
            bind_block(&st.db, inode, blockno, new_block_id, old_block_id.is_some())?;

            let mut to_delete = None;
            if let Some(old) = old_block_id {
                to_delete = deref_block(&st.db, old)?;
            }

            if need_upload.is_some() {
                entry.modified_after_upload = false;
                st.in_transit.insert(key);
            } else {
                entry.commit()?;
            }
            (need_upload, to_delete)
        };

        if let Some(obj_id) = need_upload {
            let um = self.clone();
            self.spawn_logged(&self.compress_threads, None, move || {
                run_compress(um, key, buf, obj_id)
            });
        }
        if let Some(obj_id) = to_delete {
            debug!(
                "queue(inode={}, blockno={}): removing object {}",
                inode, blockno, obj_id
            );
            // The old object cannot itself be in transit: its last block
            // reference died only now, after any upload of it completed
            self.spawn_removal(RemoveTask { obj_id, transit_key: None });
        }
        debug!("queue(inode={}, blockno={}): end", inode, blockno);
        Ok(size)
    }

    pub fn spawn_removal(&self, task: RemoveTask) {
        let um = self.clone();
        self.spawn_logged(&self.removal_threads, None, move || run_removal(um, task));
    }

    /// Wait until all blocks in transit have been uploaded.
    pub fn join_all(&self) {
        self.compress_threads.join_all();
        self.upload_threads.join_all();
    }

    /// Wait until one block has been uploaded, preferring the upload
    /// stage when it is busy. Returns immediately when idle.
    pub fn join_one(&self) {
        if self.upload_threads.is_empty() {
            self.compress_threads.join_one();
        }
        self.upload_threads.join_one();
    }

    pub fn join_removals(&self) {
        self.removal_threads.join_all();
    }

    pub fn upload_in_progress(&self) -> bool {
        self.compress_threads.len() + self.upload_threads.len() > 0
    }

    /// Spawn into `group`, recording a failure as an embedded error for
    /// the next foreground operation to observe.
    fn spawn_logged<F>(&self, group: &ThreadGroup, max_override: Option<usize>, task: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let state = self.state.clone();
        group.spawn(
            move || match task() {
                Ok(()) => Ok(()),
                Err(e) => {
                    error!("background task failed: {}", e);
                    let mut st = state.lock();
                    st.encountered_errors = true;
                    st.embedded_errors.push(e.to_string());
                    Err(e)
                }
            },
            max_override,
        );
    }
}

/// Compress stage: produce the object payload, account it as in transit,
/// record the compressed size, and hand off to the upload stage.
fn run_compress(um: UploadManager, key: BlockKey, buf: Vec<u8>, obj_id: i64) -> Result<()> {
    let body = match compress(&buf) {
        Ok(b) => b,
        Err(e) => {
            um.state.lock().in_transit.remove(&key);
            return Err(e);
        }
    };
    let compr_size = body.len() as u64;
    debug!(
        "compress(inode={}, blockno={}): {} -> {} bytes",
        key.0,
        key.1,
        buf.len(),
        compr_size
    );

    let max_override = {
        let mut guard = um.state.lock();
        let st = &mut *guard;
        // Once enough bytes are in transit the network is saturated;
        // admit at most two parallel upload threads from here on
        let max_override = if st.transit_size > MIN_TRANSIT_SIZE {
            Some(2)
        } else {
            None
        };
        st.transit_size += compr_size;
        if let Err(e) = st.db.execute(
            "UPDATE objects SET compr_size = ? WHERE id = ?",
            params![compr_size as i64, obj_id],
        ) {
            st.in_transit.remove(&key);
            st.transit_size -= compr_size;
            return Err(e);
        }
        max_override
    };

    let um2 = um.clone();
    um.spawn_logged(&um.upload_threads, max_override, move || {
        run_upload(um2, key, body, obj_id)
    });
    Ok(())
}

/// Upload stage: perform the put, then publish the result under the
/// global lock. The commit rename happens only if the entry was not
/// modified while the upload ran.
fn run_upload(um: UploadManager, key: BlockKey, body: Vec<u8>, obj_id: i64) -> Result<()> {
    let res = um
        .backend
        .put(&data_key(obj_id), &body, &ObjectMeta::new(), true);

    let mut guard = um.state.lock();
    let st = &mut *guard;
    st.in_transit.remove(&key);
    st.transit_size -= body.len() as u64;
    res.map_err(FsError::from)?;

    if let Some(entry) = st.cache.peek_mut(&key) {
        if !entry.modified_after_upload {
            // Entry may have been removed while uploading; tolerated
            entry.commit()?;
        }
    }
    debug!("upload(inode={}, blockno={}): object {} stored", key.0, key.1, obj_id);
    Ok(())
}

fn run_removal(um: UploadManager, task: RemoveTask) -> Result<()> {
    if let Some(transit_key) = task.transit_key {
        loop {
            if !um.state.lock().in_transit.contains(&transit_key) {
                break;
            }
            um.join_one();
        }
    }
    let key = data_key(task.obj_id);
    if um.backend.read_after_create_consistent() {
        match um.backend.delete(&key) {
            Err(BackendError::NoSuchObject(_)) => {
                warn!("backend seems to have lost object {}", key);
                um.state.lock().encountered_errors = true;
                Ok(())
            }
            other => other.map_err(FsError::from),
        }
    } else {
        // Deletes may race with create/list propagation; keep trying
        retry_exc(RETRY_TIMEOUT, || um.backend.delete(&key))
    }
}

/// Delay sequence for `retry_exc`: 0.2 s base, doubling, capped at half
/// the timeout, bounded by the timeout in total.
fn retry_delays(timeout: Duration) -> Vec<Duration> {
    let cap = timeout / 2;
    let mut delays = vec![];
    let mut step = Duration::from_millis(200);
    let mut waited = Duration::ZERO;
    while waited < timeout {
        delays.push(step);
        waited += step;
        if step < cap {
            step = (step * 2).min(cap);
        }
    }
    delays
}

/// Keep calling `f` until it succeeds or `timeout` of backoff is spent.
/// `NoSuchObject` and `Transient` failures are retried and promoted to
/// `Timeout` on exhaustion; everything else aborts immediately.
pub fn retry_exc<T>(
    timeout: Duration,
    mut f: impl FnMut() -> object_backend::Result<T>,
) -> Result<T> {
    match retry::retry(retry_delays(timeout), || match f() {
        Ok(v) => OperationResult::Ok(v),
        Err(BackendError::NoSuchObject(k)) => {
            warn!("object {} not yet visible, retrying", k);
            OperationResult::Retry(FsError::NoSuchObject(k))
        }
        Err(BackendError::Transient(m)) => {
            warn!("transient backend failure, retrying: {}", m);
            OperationResult::Retry(FsError::Transient(m))
        }
        Err(e) => OperationResult::Err(FsError::from(e)),
    }) {
        Ok(v) => Ok(v),
        Err(e) => match e.error {
            FsError::NoSuchObject(_) | FsError::Transient(_) => Err(FsError::Timeout),
            other => Err(other),
        },
    }
}
