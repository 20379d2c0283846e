pub mod carray;
pub mod iter;
pub mod partition;
pub mod record;

use std::{
    cell::UnsafeCell,
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering},
        Arc, Condvar, Mutex, RwLock,
    },
    thread,
    time::Duration,
};

use log::{debug, info, warn};

use crate::{
    config::Options,
    error::{DbError, DbResult},
    lsn::Lsn,
    stats::{Stats, STATS},
};

use self::{
    carray::{ConsolidationArray, GROUP_MAX},
    iter::LogScanner,
    partition::{partition_path, scan_partition_numbers},
    record::{LogRecord, MIN_RECORD_SIZE},
};

/// Poison value published to a consolidation group whose leader failed to
/// reserve log space.
const POISON_BASE: u64 = u64::MAX;

/// Segment buffer. Concurrent inserters copy into disjoint byte ranges
/// handed out by the consolidation array; the per-byte `UnsafeCell`
/// representation keeps those disjoint writes inside one allocation.
struct SegBuf {
    data: Box<[UnsafeCell<u8>]>,
}

unsafe impl Sync for SegBuf {}
unsafe impl Send for SegBuf {}

impl SegBuf {
    fn new(size: usize) -> Self {
        let mut v = Vec::with_capacity(size);
        v.resize_with(size, || UnsafeCell::new(0));
        Self {
            data: v.into_boxed_slice(),
        }
    }

    /// Copy `bytes` to `off`. The caller owns `[off, off+len)` through a
    /// consolidation-array reservation; ranges of concurrent writers
    /// never overlap.
    fn write(&self, off: usize, bytes: &[u8]) {
        debug_assert!(off + bytes.len() <= self.data.len());
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.data[off].get(), bytes.len());
        }
    }

    /// Copy out `[off, off+len)`. Only called on quiesced (fully copied)
    /// prefixes of the segment.
    fn read_vec(&self, off: usize, len: usize) -> Vec<u8> {
        debug_assert!(off + len <= self.data.len());
        let mut v = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(self.data[off].get(), v.as_mut_ptr(), len);
        }
        v
    }
}

struct DaemonState {
    /// Segment base the `flushed` watermark refers to.
    seg: u64,
    /// Bytes of the current segment already written and synced.
    flushed: usize,
    /// Currently open partition file.
    file: Option<(u32, crate::io::DbFile)>,
}

/// The write-ahead log: append via the consolidation array, group-commit
/// flush daemon, random fetch by LSN, partition files on disk.
pub struct LogManager {
    dir: PathBuf,
    segsize: usize,
    partition_size: u64,
    max_partitions: u32,
    delete_old_partitions: bool,
    group_commit_size: usize,
    group_commit_timeout_ms: u64,
    page_img_compression: u32,

    buf: SegBuf,
    carray: ConsolidationArray,

    /// LSN of the first byte of the in-memory segment.
    seg_base: AtomicU64,
    /// Bytes reserved in the current segment.
    reserved: AtomicUsize,
    /// Bytes copied into the current segment.
    completed: AtomicUsize,

    /// Readers reserve under this; rollover and the flush daemon's
    /// escalation path take it exclusively to freeze reservations.
    reserve_lock: RwLock<()>,
    rollover_lock: Mutex<()>,

    durable: AtomicU64,
    oldest_partition: AtomicU32,

    daemon_state: Mutex<DaemonState>,
    wake: (Mutex<bool>, Condvar),
    durable_wait: (Mutex<()>, Condvar),
    shutdown: AtomicBool,
    daemon: Mutex<Option<thread::JoinHandle<()>>>,

    /// Invoked with the used-partition count when log space crosses the
    /// warning watermark.
    space_callback: Mutex<Option<Box<dyn Fn(u32) + Send>>>,
}

impl LogManager {
    pub fn new(opts: &Options) -> Result<Arc<Self>, DbError> {
        let dir = PathBuf::from(opts.get_string("sm_logdir", "log"));
        std::fs::create_dir_all(&dir)?;

        let segsize = opts.get_int("sm_logbufsize", 1 << 20) as usize;
        assert!(segsize.is_power_of_two() && segsize % 512 == 0);
        let partition_mib = opts.get_int("sm_log_partition_size", 64) as u64;
        let mut partition_size = partition_mib << 20;
        // partitions hold a whole number of segments
        partition_size -= partition_size % segsize as u64;
        assert!(partition_size >= segsize as u64);

        let carray_slots = opts.get_int("sm_carray_slots", 8) as usize;

        let log = Self {
            dir: dir.clone(),
            segsize,
            partition_size,
            max_partitions: opts.get_int("sm_log_max_partitions", 0) as u32,
            delete_old_partitions: opts.get_bool("sm_log_delete_old_partitions", false),
            group_commit_size: opts.get_int("sm_group_commit_size", 64 << 10) as usize,
            group_commit_timeout_ms: opts.get_int("sm_group_commit_timeout", 10) as u64,
            page_img_compression: opts.get_int("sm_page_img_compression", 0) as u32,
            buf: SegBuf::new(segsize),
            carray: ConsolidationArray::new(carray_slots),
            seg_base: AtomicU64::new(0),
            reserved: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            reserve_lock: RwLock::new(()),
            rollover_lock: Mutex::new(()),
            durable: AtomicU64::new(0),
            oldest_partition: AtomicU32::new(1),
            daemon_state: Mutex::new(DaemonState {
                seg: 0,
                flushed: 0,
                file: None,
            }),
            wake: (Mutex::new(false), Condvar::new()),
            durable_wait: (Mutex::new(()), Condvar::new()),
            shutdown: AtomicBool::new(false),
            daemon: Mutex::new(None),
            space_callback: Mutex::new(None),
        };
        log.open_tail()?;

        let log = Arc::new(log);
        Self::start_flush_daemon(&log);
        Ok(log)
    }

    /// Locate the durable end of the existing log (if any) and position
    /// the in-memory segment at the next segment boundary.
    fn open_tail(&self) -> DbResult {
        let partitions = scan_partition_numbers(&self.dir)?;
        if partitions.is_empty() {
            let base = Lsn::new(1, 0);
            self.seg_base.store(base.to_u64(), Ordering::SeqCst);
            self.durable.store(base.to_u64(), Ordering::SeqCst);
            self.oldest_partition.store(1, Ordering::SeqCst);
            // touch the first partition file
            crate::io::DbFile::open(partition_path(&self.dir, 1))?;
            return Ok(());
        }

        let oldest = *partitions.first().unwrap();
        let last = *partitions.last().unwrap();
        self.oldest_partition.store(oldest, Ordering::SeqCst);

        let end = partition::find_partition_end(&self.dir, last, self.segsize)?;
        debug!("log tail found at {}", end);

        // start inserting on a fresh segment boundary; pad the durable
        // tail with a skip record when it ends mid-segment
        let mut offset = end.offset() as u64;
        if offset % self.segsize as u64 != 0 {
            let boundary = (offset / self.segsize as u64 + 1) * self.segsize as u64;
            let tail = (boundary - offset) as usize;
            let file = crate::io::DbFile::open(partition_path(&self.dir, last))?;
            if tail >= MIN_RECORD_SIZE {
                file.write_at(offset, &LogRecord::encode_skip(tail))?;
            } else {
                file.write_at(offset, &vec![0u8; tail])?;
            }
            file.sync()?;
            offset = boundary;
        }
        let base = if offset >= self.partition_size {
            Lsn::new(last + 1, 0)
        } else {
            Lsn::new(last, offset as u32)
        };
        self.seg_base.store(base.to_u64(), Ordering::SeqCst);
        self.durable.store(base.to_u64(), Ordering::SeqCst);
        Ok(())
    }

    fn start_flush_daemon(log: &Arc<Self>) {
        let me = Arc::clone(log);
        let handle = thread::Builder::new()
            .name("log-flush".to_string())
            .spawn(move || me.flush_daemon())
            .expect("spawn log flush daemon");
        *log.daemon.lock().unwrap() = Some(handle);
    }

    pub fn page_img_compression(&self) -> u32 {
        self.page_img_compression
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn segment_size(&self) -> usize {
        self.segsize
    }

    pub fn partition_size(&self) -> u64 {
        self.partition_size
    }

    pub fn curr_lsn(&self) -> Lsn {
        let base = Lsn::from_u64(self.seg_base.load(Ordering::Acquire));
        base.advance(self.reserved.load(Ordering::Acquire) as u32)
    }

    pub fn durable_lsn(&self) -> Lsn {
        Lsn::from_u64(self.durable.load(Ordering::Acquire))
    }

    pub fn oldest_lsn(&self) -> Lsn {
        Lsn::new(self.oldest_partition.load(Ordering::Acquire), 0)
    }

    pub fn set_space_callback(&self, cb: Box<dyn Fn(u32) + Send>) {
        *self.space_callback.lock().unwrap() = Some(cb);
    }

    // -- append --------------------------------------------------------

    /// Append a record; returns its LSN. The record is in the in-memory
    /// segment on return; it is durable only once the flush daemon has
    /// caught up (see `flush`).
    pub fn insert(&self, rec: &LogRecord) -> Result<Lsn, DbError> {
        let bytes = rec.encode();
        let len = bytes.len();
        assert!(len <= GROUP_MAX, "log record of {} bytes", len);

        let mut hasher = DefaultHasher::new();
        thread::current().id().hash(&mut hasher);
        let hint = hasher.finish() as usize;

        let joined = self.carray.join(hint, len);
        if joined.leader {
            let (total, count) = self.carray.close(joined.slot);
            match self.reserve(total) {
                Ok((base, buf_off)) => self.carray.publish(joined.slot, base, buf_off, count),
                Err(e) => {
                    self.carray
                        .publish(joined.slot, Lsn::from_u64(POISON_BASE), 0, count);
                    self.carray.depart(joined.slot);
                    return Err(e);
                }
            }
        }

        let (base, buf_off) = self.carray.wait_published(joined.slot);
        if base.to_u64() == POISON_BASE {
            if !joined.leader {
                self.carray.depart(joined.slot);
            }
            return Err(DbError::OutOfLogSpace);
        }

        let lsn = base.advance(joined.my_off as u32);
        self.buf.write(buf_off + joined.my_off, &bytes);
        self.completed.fetch_add(len, Ordering::AcqRel);
        self.carray.depart(joined.slot);

        Stats::bump(&STATS.log_inserts);
        Stats::add(&STATS.log_bytes, len as u64);

        let unflushed = self
            .curr_lsn()
            .to_u64()
            .saturating_sub(self.durable.load(Ordering::Acquire));
        if unflushed as usize >= self.group_commit_size {
            self.wake_daemon();
        }
        Ok(lsn)
    }

    fn reserve(&self, total: usize) -> Result<(Lsn, usize), DbError> {
        assert!(total <= self.segsize);
        loop {
            {
                let _r = self.reserve_lock.read().unwrap();
                let r = self.reserved.load(Ordering::Acquire);
                if r + total <= self.segsize {
                    if self
                        .reserved
                        .compare_exchange(r, r + total, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        let base = Lsn::from_u64(self.seg_base.load(Ordering::Acquire));
                        return Ok((base.advance(r as u32), r));
                    }
                    continue;
                }
            }
            self.rollover(total)?;
        }
    }

    /// Close out the current segment (pad, flush, advance). Serialized by
    /// `rollover_lock`; reservations are frozen while the pad is placed.
    fn rollover(&self, need: usize) -> DbResult {
        let _g = self.rollover_lock.lock().unwrap();

        // someone else may have advanced the segment already
        if self.reserved.load(Ordering::Acquire) + need <= self.segsize {
            return Ok(());
        }

        let _w = self.reserve_lock.write().unwrap();
        while self.completed.load(Ordering::Acquire) < self.reserved.load(Ordering::Acquire) {
            std::hint::spin_loop();
        }

        let r = self.reserved.load(Ordering::Acquire);
        let seg_base = Lsn::from_u64(self.seg_base.load(Ordering::Acquire));
        let tail = self.segsize - r;
        if tail >= MIN_RECORD_SIZE {
            self.buf.write(r, &LogRecord::encode_skip(tail));
        } else if tail > 0 {
            self.buf.write(r, &vec![0u8; tail]);
        }
        self.reserved.store(self.segsize, Ordering::SeqCst);
        self.completed.store(self.segsize, Ordering::SeqCst);

        let seg_end = Lsn::from_u64(seg_base.to_u64() + self.segsize as u64);
        self.wake_daemon();
        self.wait_durable(seg_end)?;

        let next = if (seg_base.offset() as u64 + self.segsize as u64) >= self.partition_size {
            self.on_partition_rollover(seg_base.partition() + 1)?;
            Lsn::new(seg_base.partition() + 1, 0)
        } else {
            seg_base.advance(self.segsize as u32)
        };
        self.seg_base.store(next.to_u64(), Ordering::SeqCst);
        self.reserved.store(0, Ordering::SeqCst);
        self.completed.store(0, Ordering::SeqCst);
        Ok(())
    }

    fn on_partition_rollover(&self, new_partition: u32) -> DbResult {
        let used = new_partition - self.oldest_partition.load(Ordering::Acquire) + 1;
        if self.max_partitions > 0 {
            if used > self.max_partitions {
                warn!("log space exhausted: {} partitions in use", used);
                return Err(DbError::OutOfLogSpace);
            }
            if used * 10 >= self.max_partitions * 8 {
                if let Some(cb) = self.space_callback.lock().unwrap().as_ref() {
                    cb(used);
                }
            }
        }
        info!("log opened partition {}", new_partition);
        Ok(())
    }

    /// Drop partition files strictly below `lsn` (archiver watermark).
    pub fn delete_old_partitions(&self, lsn: Lsn) -> DbResult {
        if !self.delete_old_partitions {
            return Ok(());
        }
        let keep = lsn.partition();
        let oldest = self.oldest_partition.load(Ordering::Acquire);
        for p in oldest..keep {
            let path = partition_path(&self.dir, p);
            if path.exists() {
                std::fs::remove_file(&path)?;
                info!("log partition {} deleted", p);
            }
        }
        if keep > oldest {
            self.oldest_partition.store(keep, Ordering::SeqCst);
        }
        Ok(())
    }

    // -- flush ---------------------------------------------------------

    fn wake_daemon(&self) {
        let (lock, cv) = &self.wake;
        let mut pending = lock.lock().unwrap();
        *pending = true;
        cv.notify_one();
    }

    fn wait_durable(&self, lsn: Lsn) -> DbResult {
        let (lock, cv) = &self.durable_wait;
        let mut guard = lock.lock().unwrap();
        loop {
            if self.durable.load(Ordering::Acquire) >= lsn.to_u64() {
                return Ok(());
            }
            if self.shutdown.load(Ordering::Acquire) {
                return Err(DbError::Timeout);
            }
            self.wake_daemon();
            let (g, _) = cv
                .wait_timeout(guard, Duration::from_millis(50))
                .unwrap();
            guard = g;
        }
    }

    /// Block until everything up to `lsn` is durable. A null `lsn` means
    /// the current end of log.
    pub fn flush(&self, lsn: Lsn) -> DbResult {
        let target = if lsn.is_null() { self.curr_lsn() } else { lsn };
        if self.durable.load(Ordering::Acquire) >= target.to_u64() {
            return Ok(());
        }
        self.wake_daemon();
        self.wait_durable(target)
    }

    fn flush_daemon(self: Arc<Self>) {
        debug!("log flush daemon started");
        loop {
            {
                let (lock, cv) = &self.wake;
                let mut pending = lock.lock().unwrap();
                if !*pending {
                    let (g, _) = cv
                        .wait_timeout(pending, Duration::from_millis(self.group_commit_timeout_ms))
                        .unwrap();
                    pending = g;
                }
                *pending = false;
            }
            self.flush_work();
            if self.shutdown.load(Ordering::Acquire) {
                self.flush_work();
                break;
            }
        }
        debug!("log flush daemon stopped");
    }

    /// Take a quiesced snapshot of the copied segment prefix.
    fn quiesce_snapshot(&self) -> Option<usize> {
        let r1 = self.reserved.load(Ordering::Acquire);
        let c = self.completed.load(Ordering::Acquire);
        let r2 = self.reserved.load(Ordering::Acquire);
        if r1 == r2 && c == r1 {
            Some(r1)
        } else {
            None
        }
    }

    fn flush_work(&self) {
        let mut st = self.daemon_state.lock().unwrap();
        let sb = self.seg_base.load(Ordering::Acquire);
        if st.seg != sb {
            st.seg = sb;
            st.flushed = 0;
        }

        // Sample for a quiesced prefix; if the segment never settles, try
        // to freeze reservations. try_write (never a blocking write): a
        // rollover in progress holds the lock exclusively while it waits
        // for this daemon, and it has already quiesced the segment, so
        // sampling is guaranteed to succeed in that case.
        let n = loop {
            if let Some(n) = self.quiesce_snapshot() {
                break n;
            }
            if let Ok(w) = self.reserve_lock.try_write() {
                while self.completed.load(Ordering::Acquire)
                    < self.reserved.load(Ordering::Acquire)
                {
                    std::hint::spin_loop();
                }
                let n = self.reserved.load(Ordering::Acquire);
                drop(w);
                break n;
            }
            thread::yield_now();
        };

        if n <= st.flushed {
            return;
        }
        let base = Lsn::from_u64(st.seg);
        let partition = base.partition();
        if st.file.as_ref().map(|(p, _)| *p) != Some(partition) {
            let file = match crate::io::DbFile::open(partition_path(&self.dir, partition)) {
                Ok(f) => f,
                Err(e) => panic!("cannot open log partition {}: {}", partition, e),
            };
            st.file = Some((partition, file));
        }
        let data = self.buf.read_vec(st.flushed, n - st.flushed);
        let off = base.offset() as u64 + st.flushed as u64;
        let file = &st.file.as_ref().unwrap().1;
        // a failed log write leaves committed data at risk; nothing to
        // do but stop the engine
        file.write_at(off, &data).expect("log write failed");
        file.sync().expect("log fsync failed");

        st.flushed = n;
        self.durable
            .store(base.to_u64() + n as u64, Ordering::SeqCst);
        Stats::bump(&STATS.log_flushes);

        let (_l, cv) = &self.durable_wait;
        cv.notify_all();
    }

    // -- fetch ---------------------------------------------------------

    /// Random read of the record at `lsn`. Forces a flush first when the
    /// record is still in the in-memory segment.
    pub fn fetch(&self, lsn: Lsn) -> Result<LogRecord, DbError> {
        if lsn.is_null() || lsn >= self.curr_lsn() {
            return Err(DbError::BadLogRec(format!("fetch past end: {}", lsn)));
        }
        if lsn.to_u64() >= self.durable.load(Ordering::Acquire) {
            self.flush(Lsn::from_u64(lsn.to_u64() + 1))?;
        }
        let file = crate::io::DbFile::open_readonly(partition_path(&self.dir, lsn.partition()))?;
        let mut head = [0u8; 4];
        file.read_at(lsn.offset() as u64, &mut head)?;
        let len = u32::from_le_bytes(head) as usize;
        if len < MIN_RECORD_SIZE || len > self.segsize {
            return Err(DbError::BadLogRec(format!(
                "bad length {} at {}",
                len, lsn
            )));
        }
        let mut bytes = vec![0u8; len];
        file.read_at(lsn.offset() as u64, &mut bytes)?;
        let mut rec = LogRecord::decode(&bytes)?;
        rec.lsn = lsn;
        Ok(rec)
    }

    /// Forward scan over `[from, to)`; `to` is capped at the durable end.
    pub fn scan(self: &Arc<Self>, from: Lsn, to: Lsn) -> LogScanner {
        let end = std::cmp::min(to, self.durable_lsn());
        LogScanner::new(Arc::clone(self), from, end)
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.wake_daemon();
        if let Some(handle) = self.daemon.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for LogManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
