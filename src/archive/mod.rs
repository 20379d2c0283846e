pub mod merger;
pub mod probe;
pub mod run;

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex, RwLock,
    },
    thread,
    time::Duration,
};

use log::{debug, info};

use crate::{
    config::Options,
    error::{DbError, DbResult},
    wal::LogManager,
    lsn::Lsn,
    stats::{Stats, STATS},
    utils::HandyRwLock,
};

use self::run::{RunEntry, RunMeta, RunWriter};

/// Shared view of the archive directory: the set of runs on disk.
/// The archiver appends level-0 runs, the merger replaces groups of
/// runs with higher-level ones, and probes read whatever is there.
pub struct ArchiveDir {
    dir: PathBuf,
    bucket_size: usize,
    runs: RwLock<Vec<RunMeta>>,
}

impl ArchiveDir {
    pub fn new(opts: &Options) -> Result<Arc<Self>, DbError> {
        let dir = PathBuf::from(opts.get_string("sm_archdir", "archive"));
        std::fs::create_dir_all(&dir)?;
        let mut runs = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if let Some(meta) = RunMeta::parse_file_name(&dir, &name.to_string_lossy()) {
                runs.push(meta);
            }
        }
        runs.sort_by_key(|r| (r.level, r.start));
        Ok(Arc::new(Self {
            dir,
            bucket_size: opts.get_int("sm_archiver_bucket_size", 4096) as usize,
            runs: RwLock::new(runs),
        }))
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    pub fn bucket_size(&self) -> usize {
        self.bucket_size
    }

    pub fn add_run(&self, meta: RunMeta) {
        let mut runs = self.runs.wl();
        runs.push(meta);
        runs.sort_by_key(|r| (r.level, r.start));
    }

    pub fn all_runs(&self) -> Vec<RunMeta> {
        self.runs.rl().clone()
    }

    pub fn runs_at_level(&self, level: u32) -> Vec<RunMeta> {
        self.runs
            .rl()
            .iter()
            .filter(|r| r.level == level)
            .cloned()
            .collect()
    }

    /// Take runs out of the directory listing; `delete_files` also
    /// unlinks them (kept on disk as extra copies otherwise).
    pub fn retire_runs(&self, retire: &[RunMeta], delete_files: bool) -> DbResult {
        let mut runs = self.runs.wl();
        for meta in retire {
            runs.retain(|r| r.path != meta.path);
            if delete_files && meta.path.exists() {
                std::fs::remove_file(&meta.path)?;
            }
        }
        Ok(())
    }

    /// Everything below this LSN is covered by some run on disk.
    pub fn last_archived_lsn(&self) -> Lsn {
        self.runs
            .rl()
            .iter()
            .map(|r| r.end)
            .max()
            .unwrap_or(Lsn::NULL)
    }
}

/// The archiver daemon: consumes the durable tail of the log and turns
/// it into (pid, lsn)-sorted level-0 runs.
pub struct LogArchiver {
    log: Arc<LogManager>,
    dir: Arc<ArchiveDir>,
    workspace_size: usize,
    grace_period_ms: u64,
    /// Keep consuming as long as durable log is uncovered, instead of
    /// sleeping out the grace period between passes.
    eager: bool,
    /// Stop each pass at a segment boundary so the consumed tail is
    /// always read in whole blocks (the synchronous catch-up path is
    /// exempt: it must reach an exact LSN).
    read_whole_blocks: bool,
    shutdown: AtomicBool,
    wake: (Mutex<bool>, Condvar),
    /// The in-memory sort workspace is owned by whichever thread runs
    /// `run_once`; the mutex makes that single-runner contract explicit.
    workspace: Mutex<Workspace>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

struct Workspace {
    entries: Vec<RunEntry>,
    bytes: usize,
    next_lsn: Lsn,
}

impl LogArchiver {
    pub fn new(log: Arc<LogManager>, dir: Arc<ArchiveDir>, opts: &Options) -> Arc<Self> {
        let next = {
            let archived = dir.last_archived_lsn();
            if archived.is_null() {
                log.oldest_lsn()
            } else {
                archived
            }
        };
        Arc::new(Self {
            log,
            dir,
            workspace_size: opts.get_int("sm_archiver_workspace_size", 8 << 20) as usize,
            grace_period_ms: opts.get_int("sm_archiver_slow_log_grace_period", 100) as u64,
            eager: opts.get_bool("sm_archiver_eager", false),
            read_whole_blocks: opts.get_bool("sm_archiver_read_whole_blocks", false),
            shutdown: AtomicBool::new(false),
            wake: (Mutex::new(false), Condvar::new()),
            workspace: Mutex::new(Workspace {
                entries: Vec::new(),
                bytes: 0,
                next_lsn: next,
            }),
            handle: Mutex::new(None),
        })
    }

    pub fn start(self: &Arc<Self>) {
        let me = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("log-archiver".to_string())
            .spawn(move || me.main_loop())
            .expect("spawn archiver");
        *self.handle.lock().unwrap() = Some(handle);
    }

    pub fn wakeup(&self) {
        let (lock, cv) = &self.wake;
        *lock.lock().unwrap() = true;
        cv.notify_one();
    }

    fn main_loop(self: Arc<Self>) {
        debug!("log archiver started");
        while !self.shutdown.load(Ordering::Acquire) {
            // an eager archiver only sleeps once it has caught up
            if !(self.eager && self.is_behind()) {
                let (lock, cv) = &self.wake;
                let mut pending = lock.lock().unwrap();
                if !*pending {
                    let (g, _) = cv
                        .wait_timeout(pending, Duration::from_millis(self.grace_period_ms))
                        .unwrap();
                    pending = g;
                }
                *pending = false;
            }
            if let Err(e) = self.run_once() {
                log::error!("archiver error: {}", e);
            }
        }
        debug!("log archiver stopped");
    }

    fn is_behind(&self) -> bool {
        let ws = self.workspace.lock().unwrap();
        // same horizon run_pass uses, or the two disagree and the
        // eager loop spins on a tail it refuses to consume
        ws.next_lsn < self.pass_horizon(false)
    }

    /// How far a pass may consume: the durable end, rounded down to a
    /// segment boundary when whole-block reads are requested.
    fn pass_horizon(&self, exact: bool) -> Lsn {
        let durable = self.log.durable_lsn();
        if self.read_whole_blocks && !exact {
            let segsize = self.log.segment_size() as u32;
            Lsn::new(
                durable.partition(),
                durable.offset() - durable.offset() % segsize,
            )
        } else {
            durable
        }
    }

    /// Archive whatever is durable and not yet in a run. Returns the LSN
    /// the archive now covers.
    pub fn run_once(&self) -> Result<Lsn, DbError> {
        self.run_pass(false)
    }

    fn run_pass(&self, exact: bool) -> Result<Lsn, DbError> {
        let mut ws = self.workspace.lock().unwrap();
        let durable = self.pass_horizon(exact);
        if ws.next_lsn >= durable {
            return Ok(ws.next_lsn);
        }

        let mut scanner = self.log.scan(ws.next_lsn, durable);
        loop {
            let rec = match scanner.next() {
                None => break,
                Some(Err(e)) => return Err(e),
                Some(Ok(rec)) => rec,
            };
            if !rec.is_redo() || rec.pid == 0 {
                continue;
            }
            let bytes = rec.encode();
            ws.bytes += bytes.len();
            ws.entries.push(RunEntry {
                pid: rec.pid,
                lsn: rec.lsn,
                bytes: bytes.clone(),
            });
            // a multi-page record is filed under both pids
            if rec.is_multi_page() && rec.page2_pid != 0 {
                ws.bytes += bytes.len();
                ws.entries.push(RunEntry {
                    pid: rec.page2_pid,
                    lsn: rec.lsn,
                    bytes,
                });
            }
            if ws.bytes >= self.workspace_size {
                let from = ws.next_lsn;
                let upto = scanner.next_lsn();
                self.flush_workspace(&mut ws, from, upto)?;
            }
        }
        let end = scanner.next_lsn().max(durable);
        let from = ws.next_lsn;
        self.flush_workspace(&mut ws, from, end)?;
        ws.next_lsn = end;
        Ok(end)
    }

    fn flush_workspace(&self, ws: &mut Workspace, from: Lsn, to: Lsn) -> DbResult {
        if ws.entries.is_empty() {
            ws.next_lsn = to;
            return Ok(());
        }
        ws.entries.sort_by_key(|e| (e.pid, e.lsn));
        let mut writer = RunWriter::create(
            self.dir.dir(),
            0,
            from,
            to,
            self.dir.bucket_size(),
        )?;
        for entry in &ws.entries {
            writer.append(entry)?;
        }
        let meta = writer.finish()?;
        info!(
            "archived run [{} - {}) with {} entries",
            meta.start,
            meta.end,
            ws.entries.len()
        );
        Stats::bump(&STATS.archive_runs);
        Stats::add(&STATS.archive_records, ws.entries.len() as u64);
        self.dir.add_run(meta);
        ws.entries.clear();
        ws.bytes = 0;
        ws.next_lsn = to;
        Ok(())
    }

    /// Synchronously archive at least up to `lsn` (flushes the log
    /// first). Used when a volume fails: restore reads only the archive.
    pub fn archive_until(&self, lsn: Lsn) -> DbResult {
        self.log.flush(lsn)?;
        loop {
            let covered = self.run_pass(true)?;
            if covered >= lsn {
                return Ok(());
            }
        }
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.wakeup();
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}
