use std::{
    cmp::Reverse,
    collections::BinaryHeap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

use log::{debug, info};

use crate::{
    config::Options,
    error::DbError,
    lsn::Lsn,
    stats::{Stats, STATS},
};

use super::{
    run::{RunEntry, RunMeta, RunReader, RunWriter},
    ArchiveDir,
};

/// Merges groups of same-level runs into one higher-level run, keeping
/// probe depth bounded. Inputs are reclaimed once the replication factor
/// is satisfied.
pub struct RunMerger {
    dir: Arc<ArchiveDir>,
    fanin: usize,
    replication_factor: u32,
    interval_ms: u64,
    shutdown: AtomicBool,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl RunMerger {
    pub fn new(dir: Arc<ArchiveDir>, opts: &Options) -> Arc<Self> {
        Arc::new(Self {
            dir,
            fanin: opts.get_int("sm_archiver_fanin", 5) as usize,
            replication_factor: opts.get_int("sm_archiver_replication_factor", 1) as u32,
            interval_ms: opts.get_int("sm_archiver_merge_interval", 250) as u64,
            shutdown: AtomicBool::new(false),
            handle: Mutex::new(None),
        })
    }

    pub fn start(self: &Arc<Self>) {
        let me = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("run-merger".to_string())
            .spawn(move || me.main_loop())
            .expect("spawn merger");
        *self.handle.lock().unwrap() = Some(handle);
    }

    fn main_loop(self: Arc<Self>) {
        debug!("run merger started");
        while !self.shutdown.load(Ordering::Acquire) {
            match self.merge_once() {
                Ok(true) => {}
                Ok(false) => thread::sleep(Duration::from_millis(self.interval_ms)),
                Err(e) => {
                    log::error!("merger error: {}", e);
                    thread::sleep(Duration::from_millis(self.interval_ms));
                }
            }
        }
        debug!("run merger stopped");
    }

    /// Merge the oldest `fanin` runs of the lowest level that has enough
    /// of them. Returns whether a merge happened.
    pub fn merge_once(&self) -> Result<bool, DbError> {
        let mut level = 0;
        loop {
            let runs = self.dir.runs_at_level(level);
            if runs.len() >= self.fanin {
                let inputs: Vec<RunMeta> = runs.into_iter().take(self.fanin).collect();
                self.merge(level, &inputs)?;
                return Ok(true);
            }
            if runs.is_empty() && level > 0 {
                return Ok(false);
            }
            if level > 8 {
                return Ok(false);
            }
            level += 1;
        }
    }

    fn merge(&self, level: u32, inputs: &[RunMeta]) -> Result<(), DbError> {
        let start = inputs.iter().map(|r| r.start).min().unwrap();
        let end = inputs.iter().map(|r| r.end).max().unwrap();

        // k-way merge by (pid, lsn) over the input runs
        let mut sources: Vec<Vec<RunEntry>> = Vec::with_capacity(inputs.len());
        for meta in inputs {
            sources.push(RunReader::open(meta)?.scan_all()?);
        }
        let mut cursors = vec![0usize; sources.len()];
        let mut heap: BinaryHeap<Reverse<(u32, Lsn, usize)>> = BinaryHeap::new();
        for (i, src) in sources.iter().enumerate() {
            if let Some(e) = src.first() {
                heap.push(Reverse((e.pid, e.lsn, i)));
            }
        }

        let mut writer = RunWriter::create(
            self.dir.dir(),
            level + 1,
            start,
            end,
            self.dir.bucket_size(),
        )?;
        while let Some(Reverse((_, _, i))) = heap.pop() {
            let entry = &sources[i][cursors[i]];
            writer.append(entry)?;
            cursors[i] += 1;
            if let Some(e) = sources[i].get(cursors[i]) {
                heap.push(Reverse((e.pid, e.lsn, i)));
            }
        }
        let meta = writer.finish()?;
        info!(
            "merged {} level-{} runs into [{} - {}) at level {}",
            inputs.len(),
            level,
            meta.start,
            meta.end,
            level + 1
        );
        self.dir.add_run(meta);
        Stats::bump(&STATS.archive_merges);

        // the lowest level's files are reclaimable only once enough
        // copies exist above it
        let delete_files = level > 0 || self.replication_factor <= 1;
        self.dir.retire_runs(inputs, delete_files)?;
        Ok(())
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}
