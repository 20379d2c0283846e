use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex,
    },
    thread,
};

use log::{debug, info, warn};

use crate::{
    archive::{probe::archive_iterator, ArchiveDir},
    btree::page::BTreePage,
    config::Options,
    error::{DbError, DbResult},
    wal::{
        record::{LogPayload, LogRecord, CAT_SYSTEM},
        LogManager,
    },
    lsn::Lsn,
    page::{new_page_image, PageHeader, PageImage, PageTag},
    page_id::PageID,
    recovery::spr,
    stats::{Stats, STATS},
    vol::Volume,
};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum SegState {
    NotStarted,
    InProgress,
    Restored,
}

struct CoordState {
    segments: Vec<SegState>,
    /// Priority requests jump ahead of the sequential sweep.
    queue: VecDeque<usize>,
    /// Pages a reader is waiting on; the restored image is stashed here
    /// so the reader needs no second disk read.
    requested: HashMap<PageID, Option<Vec<u8>>>,
    restored: usize,
}

/// On-line restore of a failed volume: the pid space is carved into
/// segments, each rebuilt from the latest backup plus the archived log
/// chain up to the failure LSN and written back in place. Readers
/// blocked on a segment are woken as soon as it is restored.
pub struct RestoreCoordinator {
    vol: Arc<Volume>,
    log: Arc<LogManager>,
    archive: Arc<ArchiveDir>,
    failure_lsn: Lsn,
    segment_pages: usize,
    last_used_pid: PageID,
    nsegments: usize,
    /// Instant restore: reads jump the segment queue and get the
    /// restored image delivered directly. Without it, readers simply
    /// block until the sequential sweep reaches their segment.
    instant: bool,

    state: Mutex<CoordState>,
    cv: Condvar,
    done: AtomicBool,
    shutdown: AtomicBool,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl RestoreCoordinator {
    pub fn new(
        vol: Arc<Volume>,
        log: Arc<LogManager>,
        archive: Arc<ArchiveDir>,
        failure_lsn: Lsn,
        opts: &Options,
    ) -> Arc<Self> {
        let segment_pages = std::cmp::max(1, opts.get_int("sm_batch_segment_size", 64) as usize);
        let last_used_pid = vol.get_last_allocated_pid();
        let nsegments = (last_used_pid as usize + segment_pages) / segment_pages;
        info!(
            "restore coordinator: {} segments of {} pages, failure lsn {}",
            nsegments, segment_pages, failure_lsn
        );
        Arc::new(Self {
            vol,
            log,
            archive,
            failure_lsn,
            segment_pages,
            last_used_pid,
            nsegments,
            instant: opts.get_bool("sm_restore_instant", true),
            state: Mutex::new(CoordState {
                segments: vec![SegState::NotStarted; nsegments],
                queue: VecDeque::new(),
                requested: HashMap::new(),
                restored: 0,
            }),
            cv: Condvar::new(),
            done: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            handle: Mutex::new(None),
        })
    }

    pub fn start(self: &Arc<Self>) {
        let me = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("restore-coordinator".to_string())
            .spawn(move || me.run())
            .expect("spawn restore coordinator");
        *self.handle.lock().unwrap() = Some(handle);
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub fn join(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.cv.notify_all();
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    /// A reader needs `pid` from the failed volume.
    ///
    /// Restored segment: return false and let the regular read proceed.
    /// Otherwise the segment jumps the queue and the caller blocks until
    /// it is restored; when possible the restored image is delivered
    /// straight into `img` (return true).
    pub fn request_restore(&self, pid: PageID, img: &mut PageImage) -> Result<bool, DbError> {
        if pid > self.last_used_pid {
            // past the end of the volume: implicitly zero
            for b in img.iter_mut() {
                *b = 0;
            }
            return Ok(true);
        }
        let seg = pid as usize / self.segment_pages;
        let mut state = self.state.lock().unwrap();
        if state.segments[seg] == SegState::Restored {
            return Ok(false);
        }
        if self.instant {
            Stats::bump(&STATS.restore_priority_requests);
            if state.segments[seg] == SegState::NotStarted && !state.queue.contains(&seg) {
                state.queue.push_front(seg);
            }
            state.requested.entry(pid).or_insert(None);
            self.cv.notify_all();
        }

        while state.segments[seg] != SegState::Restored {
            if self.shutdown.load(Ordering::Acquire) {
                return Err(DbError::VolFailed);
            }
            state = self.cv.wait(state).unwrap();
        }
        match state.requested.remove(&pid) {
            Some(Some(bytes)) => {
                img.copy_from_slice(&bytes);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn run(self: Arc<Self>) {
        debug!("restore coordinator running");
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return;
            }
            let seg = {
                let mut state = self.state.lock().unwrap();
                if state.restored == self.nsegments {
                    break;
                }
                let seg = loop {
                    match state.queue.pop_front() {
                        Some(s) if state.segments[s] == SegState::NotStarted => break Some(s),
                        Some(_) => continue,
                        None => {
                            break state
                                .segments
                                .iter()
                                .position(|s| *s == SegState::NotStarted)
                        }
                    }
                };
                match seg {
                    Some(s) => {
                        state.segments[s] = SegState::InProgress;
                        s
                    }
                    None => break, // everything claimed; wait for finishes
                }
            };
            if let Err(e) = self.restore_segment(seg) {
                warn!("restore of segment {} failed: {}", seg, e);
                let mut state = self.state.lock().unwrap();
                state.segments[seg] = SegState::NotStarted;
                continue;
            }
        }
        self.done.store(true, Ordering::Release);
        self.cv.notify_all();
        info!("restore complete: {} segments", self.nsegments);
    }

    /// Rebuild one segment: base images from the backup, log chains from
    /// the archive, single-page redo, then one write back in place.
    fn restore_segment(&self, seg: usize) -> DbResult {
        let first = (seg * self.segment_pages) as PageID;
        let count = std::cmp::min(
            self.segment_pages as u32,
            self.last_used_pid + 1 - first,
        );
        let backup = self.vol.open_latest_backup()?;
        let mut images = Vec::with_capacity(count as usize);

        for i in 0..count {
            let pid = first + i;
            let mut img = new_page_image();
            backup.read_page(pid, &mut img)?;

            let records = archive_iterator(
                &self.archive,
                pid,
                Lsn::from_u64(1),
                self.failure_lsn,
            )?;
            let is_btree = match PageHeader::decode(&img[..]) {
                Ok(hdr) => hdr.tag == PageTag::Btree,
                Err(_) => crate::page::is_zero_image(&img[..]),
            };
            if is_btree && !records.is_empty() {
                let mut page = if crate::page::is_zero_image(&img[..]) {
                    let mut p = BTreePage::empty();
                    p.hdr.pid = pid;
                    p
                } else {
                    BTreePage::parse(&img)?
                };
                spr::apply_records(pid, &mut page, &records);
                img = page.to_image();
            }
            images.push(img);
        }

        // metadata pages (header, stnode, alloc bitmaps) pass through
        // from the backup; the in-memory caches rewrite them on shutdown
        self.vol.write_many_pages(first, &images, true)?;
        self.vol.sync()?;

        let mut rec = LogRecord::new(
            CAT_SYSTEM,
            LogPayload::RestoreSegment {
                segment: seg as u32,
                first_pid: first,
                page_count: count,
            },
        );
        rec.pid = first;
        self.log.insert(&rec)?;
        Stats::bump(&STATS.restore_segments);

        let mut state = self.state.lock().unwrap();
        state.segments[seg] = SegState::Restored;
        state.restored += 1;
        let requested: Vec<PageID> = state
            .requested
            .iter()
            .filter(|(pid, v)| {
                **pid >= first && **pid < first + count && v.is_none()
            })
            .map(|(pid, _)| *pid)
            .collect();
        for pid in requested {
            let img = &images[(pid - first) as usize];
            state.requested.insert(pid, Some(img.to_vec()));
        }
        self.cv.notify_all();
        debug!("segment {} restored ({} pages)", seg, count);
        Ok(())
    }
}
