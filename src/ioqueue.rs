//! Asynchronous, buffer-owning, bucketed disk IO.
//!
//! The engine never issues syscalls itself: it stages commands on an
//! [`IoQueue`], commits them as a batch, and a single background worker
//! drains the batch in order. Buffers travel *into* the queue by value;
//! read buffers come back through a per-read reply channel once filled, and
//! write buffers are returned to the loanable pool by the worker.
//!
//! Failure is sticky: the first IO error parks the worker in drain mode
//! (buffers still flow back, fences are poisoned so waiters wake) and is
//! surfaced to the driver through [`IoQueue::check_error`].

use crossbeam_channel::{Receiver, Sender, unbounded};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::fence::{FENCE_POISON, Fence};
use crate::heap::IoBuf;
use crate::layout::FileId;
use crate::phase3::Phase3Error;

/// Logical seek origin for bucketed streams.
#[derive(Clone, Copy, Debug)]
pub enum SeekOrigin {
    Begin,
}

/// Budget-tracked pool the IO worker and engine loan transient buffers
/// from. The un-carved remainder of the fixed heap backs this pool.
pub struct BufferPool {
    state: Mutex<usize>,
    cond: Condvar,
    budget: usize,
    block_size: usize,
}

impl BufferPool {
    pub fn new(budget: usize, block_size: usize) -> Self {
        Self {
            state: Mutex::new(budget),
            cond: Condvar::new(),
            budget,
            block_size,
        }
    }

    fn charge(&self, bytes: usize) -> usize {
        bytes.div_ceil(self.block_size) * self.block_size
    }

    /// Loan a buffer, blocking until the budget allows it.
    pub fn get_blocking(&self, bytes: usize) -> IoBuf {
        let charge = self.charge(bytes);
        assert!(
            charge <= self.budget,
            "buffer request of {charge} bytes exceeds the pool budget of {}",
            self.budget
        );
        let mut available = self.state.lock().unwrap();
        while *available < charge {
            available = self.cond.wait(available).unwrap();
        }
        *available -= charge;
        IoBuf::new(charge)
    }

    /// Loan a buffer if the budget allows it right now.
    pub fn try_get(&self, bytes: usize) -> Option<IoBuf> {
        let charge = self.charge(bytes);
        let mut available = self.state.lock().unwrap();
        if *available < charge {
            return None;
        }
        *available -= charge;
        Some(IoBuf::new(charge))
    }

    /// Return a loan to the pool.
    pub fn release(&self, buf: IoBuf) {
        let credit = self.charge(buf.len());
        drop(buf);
        let mut available = self.state.lock().unwrap();
        *available += credit;
        self.cond.notify_all();
    }
}

enum IoCommand {
    InitFileSet {
        file: FileId,
        buckets: u32,
        truncate: bool,
    },
    SeekBucketSet {
        file: FileId,
    },
    SeekFile {
        file: FileId,
        bucket: u32,
    },
    Read {
        file: FileId,
        bucket: u32,
        buf: IoBuf,
        offset: usize,
        len: usize,
        reply: Sender<IoBuf>,
    },
    Write {
        file: FileId,
        bucket: u32,
        buf: IoBuf,
        len: usize,
    },
    WriteBuckets {
        file: FileId,
        buf: IoBuf,
        /// Bytes per bucket, concatenated in bucket order in `buf`.
        sizes: Vec<u32>,
    },
    DeleteFile {
        file: FileId,
        bucket: u32,
    },
    SignalFence {
        fence: Fence,
        value: u64,
    },
    Shutdown,
}

/// A read whose buffer is still owned by the IO worker.
pub struct PendingBuf {
    rx: Receiver<IoBuf>,
}

impl PendingBuf {
    /// Reclaim the buffer. Returns once the worker has processed the read;
    /// on IO failure the buffer comes back unfilled and the error is
    /// reported through the queue's error slot.
    pub fn wait(self) -> IoBuf {
        self.rx.recv().expect("io worker disconnected")
    }
}

#[derive(Default)]
struct ErrorSlot {
    failed: bool,
    error: Option<Phase3Error>,
}

/// Handle to the background IO worker. Commands accumulate in a staged
/// batch until [`commit`](IoQueue::commit) flushes them.
pub struct IoQueue {
    staged: Vec<IoCommand>,
    tx: Sender<Vec<IoCommand>>,
    pool: Arc<BufferPool>,
    error: Arc<Mutex<ErrorSlot>>,
    worker: Option<JoinHandle<()>>,
}

impl IoQueue {
    pub fn new(root: &Path, pool_budget: usize, block_size: usize) -> Self {
        let pool = Arc::new(BufferPool::new(pool_budget, block_size));
        let error = Arc::new(Mutex::new(ErrorSlot::default()));
        let (tx, rx) = unbounded::<Vec<IoCommand>>();

        let worker = {
            let root = root.to_path_buf();
            let pool = Arc::clone(&pool);
            let error = Arc::clone(&error);
            std::thread::Builder::new()
                .name("p3-io".into())
                .spawn(move || IoWorker::new(root, pool, error).run(rx))
                .expect("failed to spawn io worker")
        };

        Self {
            staged: Vec::new(),
            tx,
            pool,
            error,
            worker: Some(worker),
        }
    }

    /// Register a bucketed file set. Inputs produced by earlier phases must
    /// not be truncated; this engine's own outputs are.
    pub fn init_file_set(&mut self, file: FileId, buckets: u32, truncate: bool) {
        self.staged.push(IoCommand::InitFileSet { file, buckets, truncate });
    }

    /// Rewind every bucket of a file set.
    pub fn seek_bucket(&mut self, file: FileId, origin: SeekOrigin) {
        let SeekOrigin::Begin = origin;
        self.staged.push(IoCommand::SeekBucketSet { file });
    }

    /// Rewind a single bucket of a file set.
    pub fn seek_file(&mut self, file: FileId, bucket: u32, origin: SeekOrigin) {
        let SeekOrigin::Begin = origin;
        self.staged.push(IoCommand::SeekFile { file, bucket });
    }

    /// Read `len` bytes from the bucket's cursor into the front of `buf`.
    pub fn read_file(&mut self, file: FileId, bucket: u32, buf: IoBuf, len: usize) -> PendingBuf {
        self.read_file_at(file, bucket, buf, 0, len)
    }

    /// Read `len` bytes into `buf` starting at `offset` bytes.
    pub fn read_file_at(
        &mut self,
        file: FileId,
        bucket: u32,
        buf: IoBuf,
        offset: usize,
        len: usize,
    ) -> PendingBuf {
        debug_assert!(offset + len <= buf.len());
        let (reply, rx) = unbounded();
        self.staged.push(IoCommand::Read { file, bucket, buf, offset, len, reply });
        PendingBuf { rx }
    }

    /// Write the first `len` bytes of `buf` at the bucket's write cursor.
    /// The buffer returns to the pool once written.
    pub fn write_file(&mut self, file: FileId, bucket: u32, buf: IoBuf, len: usize) {
        self.staged.push(IoCommand::Write { file, bucket, buf, len });
    }

    /// Scatter-write one slice per bucket; `sizes[b]` bytes go to bucket
    /// `b`, packed back-to-back in `buf`. The buffer returns to the pool.
    pub fn write_buckets(&mut self, file: FileId, buf: IoBuf, sizes: Vec<u32>) {
        self.staged.push(IoCommand::WriteBuckets { file, buf, sizes });
    }

    pub fn delete_file(&mut self, file: FileId, bucket: u32) {
        self.staged.push(IoCommand::DeleteFile { file, bucket });
    }

    /// Enqueue a fence signal behind the staged commands.
    pub fn signal_fence(&mut self, fence: &Fence, value: u64) {
        self.staged.push(IoCommand::SignalFence { fence: fence.clone(), value });
    }

    /// Flush the staged batch to the worker.
    pub fn commit(&mut self) {
        if self.staged.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.staged);
        self.tx.send(batch).expect("io worker disconnected");
    }

    pub fn get_buffer_blocking(&self, bytes: usize) -> IoBuf {
        self.pool.get_blocking(bytes)
    }

    pub fn try_get_buffer(&self, bytes: usize) -> Option<IoBuf> {
        self.pool.try_get(bytes)
    }

    pub fn release_buffer(&self, buf: IoBuf) {
        self.pool.release(buf);
    }

    /// Surface the worker's sticky error, if any.
    pub fn check_error(&self) -> Result<(), Phase3Error> {
        let mut slot = self.error.lock().unwrap();
        if slot.failed {
            return Err(slot.error.take().unwrap_or(Phase3Error::IoQueueFailed));
        }
        Ok(())
    }

    /// Flush outstanding commands, stop the worker, and report any error.
    pub fn shutdown(mut self) -> Result<(), Phase3Error> {
        self.staged.push(IoCommand::Shutdown);
        self.commit();
        if let Some(worker) = self.worker.take() {
            worker.join().expect("io worker panicked");
        }
        self.check_error()
    }
}

impl Drop for IoQueue {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.staged.push(IoCommand::Shutdown);
            let batch = std::mem::take(&mut self.staged);
            if self.tx.send(batch).is_ok() {
                let _ = worker.join();
            }
        }
    }
}

struct BucketFile {
    file: File,
    path: PathBuf,
    read_pos: u64,
    write_pos: u64,
}

struct FileSet {
    buckets: Vec<Option<BucketFile>>,
}

struct IoWorker {
    root: PathBuf,
    pool: Arc<BufferPool>,
    error: Arc<Mutex<ErrorSlot>>,
    sets: HashMap<FileId, FileSet>,
}

impl IoWorker {
    fn new(root: PathBuf, pool: Arc<BufferPool>, error: Arc<Mutex<ErrorSlot>>) -> Self {
        Self { root, pool, error, sets: HashMap::new() }
    }

    fn run(mut self, rx: Receiver<Vec<IoCommand>>) {
        for batch in rx.iter() {
            for cmd in batch {
                if matches!(cmd, IoCommand::Shutdown) {
                    return;
                }
                if self.error.lock().unwrap().failed {
                    self.drain(cmd);
                    continue;
                }
                if let Err(e) = self.execute(cmd) {
                    let mut slot = self.error.lock().unwrap();
                    slot.failed = true;
                    slot.error.get_or_insert(e);
                }
            }
        }
    }

    /// After a failure, keep ownership flowing: buffers return to their
    /// owners, fences are poisoned so no consumer deadlocks.
    fn drain(&mut self, cmd: IoCommand) {
        match cmd {
            IoCommand::Read { buf, reply, .. } => {
                let _ = reply.send(buf);
            }
            IoCommand::Write { buf, .. } | IoCommand::WriteBuckets { buf, .. } => {
                self.pool.release(buf);
            }
            IoCommand::SignalFence { fence, .. } => fence.signal(FENCE_POISON),
            _ => {}
        }
    }

    fn execute(&mut self, cmd: IoCommand) -> Result<(), Phase3Error> {
        match cmd {
            IoCommand::InitFileSet { file, buckets, truncate } => {
                let mut set = FileSet { buckets: Vec::with_capacity(buckets as usize) };
                for bucket in 0..buckets {
                    let path = file.bucket_path(&self.root, bucket);
                    let handle = OpenOptions::new()
                        .read(true)
                        .write(true)
                        .create(true)
                        .truncate(truncate)
                        .open(&path)
                        .map_err(|e| io_error(file, bucket, e))?;
                    set.buckets.push(Some(BucketFile {
                        file: handle,
                        path,
                        read_pos: 0,
                        write_pos: 0,
                    }));
                }
                self.sets.insert(file, set);
                Ok(())
            }
            IoCommand::SeekBucketSet { file } => {
                let set = self.set_mut(file)?;
                for bucket in set.buckets.iter_mut().flatten() {
                    bucket.read_pos = 0;
                    bucket.write_pos = 0;
                }
                Ok(())
            }
            IoCommand::SeekFile { file, bucket } => {
                let b = self.bucket_mut(file, bucket)?;
                b.read_pos = 0;
                b.write_pos = 0;
                Ok(())
            }
            IoCommand::Read { file, bucket, mut buf, offset, len, reply } => {
                let result = self.do_read(file, bucket, &mut buf, offset, len);
                let _ = reply.send(buf);
                result
            }
            IoCommand::Write { file, bucket, buf, len } => {
                let result = self.do_write(file, bucket, buf.as_bytes(), len);
                self.pool.release(buf);
                result
            }
            IoCommand::WriteBuckets { file, buf, sizes } => {
                let result = self.do_write_buckets(file, buf.as_bytes(), &sizes);
                self.pool.release(buf);
                result
            }
            IoCommand::DeleteFile { file, bucket } => {
                let b = self.bucket_mut(file, bucket)?;
                let path = b.path.clone();
                self.set_mut(file)?.buckets[bucket as usize] = None;
                std::fs::remove_file(&path).map_err(|e| io_error(file, bucket, e))
            }
            IoCommand::SignalFence { fence, value } => {
                fence.signal(value);
                Ok(())
            }
            IoCommand::Shutdown => Ok(()),
        }
    }

    fn do_read(
        &mut self,
        file: FileId,
        bucket: u32,
        buf: &mut IoBuf,
        offset: usize,
        len: usize,
    ) -> Result<(), Phase3Error> {
        if len == 0 {
            return Ok(());
        }
        let b = self.bucket_mut(file, bucket)?;
        b.file
            .seek(SeekFrom::Start(b.read_pos))
            .and_then(|_| b.file.read_exact(&mut buf.as_bytes_mut()[offset..offset + len]))
            .map_err(|e| io_error(file, bucket, e))?;
        b.read_pos += len as u64;
        Ok(())
    }

    fn do_write(
        &mut self,
        file: FileId,
        bucket: u32,
        bytes: &[u8],
        len: usize,
    ) -> Result<(), Phase3Error> {
        if len == 0 {
            return Ok(());
        }
        let b = self.bucket_mut(file, bucket)?;
        b.file
            .seek(SeekFrom::Start(b.write_pos))
            .and_then(|_| b.file.write_all(&bytes[..len]))
            .map_err(|e| io_error(file, bucket, e))?;
        b.write_pos += len as u64;
        Ok(())
    }

    fn do_write_buckets(
        &mut self,
        file: FileId,
        bytes: &[u8],
        sizes: &[u32],
    ) -> Result<(), Phase3Error> {
        let mut offset = 0usize;
        for (bucket, &size) in sizes.iter().enumerate() {
            let size = size as usize;
            self.do_write(file, bucket as u32, &bytes[offset..offset + size], size)?;
            offset += size;
        }
        Ok(())
    }

    fn set_mut(&mut self, file: FileId) -> Result<&mut FileSet, Phase3Error> {
        self.sets
            .get_mut(&file)
            .ok_or_else(|| Phase3Error::Inconsistency(format!("file set {file:?} not initialized")))
    }

    fn bucket_mut(&mut self, file: FileId, bucket: u32) -> Result<&mut BucketFile, Phase3Error> {
        self.set_mut(file)?
            .buckets
            .get_mut(bucket as usize)
            .and_then(Option::as_mut)
            .ok_or_else(|| {
                Phase3Error::Inconsistency(format!("bucket {bucket} of {file:?} unavailable"))
            })
    }
}

fn io_error(file: FileId, bucket: u32, source: std::io::Error) -> Phase3Error {
    Phase3Error::IoFile { name: file.name(), bucket, source }
}
