//! Per-video activity trackers.
//!
//! There is one tracker each for encoding (publishing), live streams and
//! imports. An entry records the video's cancellation state and the encoder
//! processes it owns. Finished entries stay behind as tombstones so late
//! echoes and status queries still resolve, and are evicted after a
//! retention period.

use crate::encode::ProcessHandle;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Error type for tracker operations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TrackerError {
    /// The video already has live activity of this kind
    #[error("{kind} already active for video {video_id}")]
    AlreadyActive { kind: TrackerKind, video_id: String },

    /// The video's activity of this kind is winding down
    #[error("{kind} stopping for video {video_id}")]
    Stopping { kind: TrackerKind, video_id: String },
}

/// Which tracker an entry belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackerKind {
    Encoding,
    Stream,
    Import,
}

impl std::fmt::Display for TrackerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackerKind::Encoding => write!(f, "publishing"),
            TrackerKind::Stream => write!(f, "streaming"),
            TrackerKind::Import => write!(f, "import"),
        }
    }
}

/// Two-phase cancellation.
///
/// `request_stop` sets a soft flag that checkpoints observe. `terminate`
/// cancels the kill token shared by every process the entry owns. Both are
/// one-way.
#[derive(Debug, Default)]
pub struct Cancellation {
    stopping: AtomicBool,
    terminate: CancellationToken,
}

impl Cancellation {
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Set the soft flag. Returns true only for the call that set it.
    pub fn request_stop(&self) -> bool {
        !self.stopping.swap(true, Ordering::AcqRel)
    }

    /// Force-kill everything holding a kill token.
    pub fn terminate(&self) {
        self.terminate.cancel();
    }

    pub fn is_terminated(&self) -> bool {
        self.terminate.is_cancelled()
    }

    /// Soft then hard. Returns true if this call set the soft flag.
    pub fn stop(&self) -> bool {
        let first = self.request_stop();
        self.terminate();
        first
    }

    /// Token for one process; cancelled by [`Self::terminate`].
    pub fn kill_token(&self) -> CancellationToken {
        self.terminate.child_token()
    }
}

/// State tracked for one video
#[derive(Debug, Default)]
pub struct TrackerEntry {
    generation: u64,
    cancellation: Cancellation,
    processes: Mutex<HashMap<u64, ProcessHandle>>,
    finished_at: Mutex<Option<Instant>>,
}

impl TrackerEntry {
    fn with_generation(generation: u64) -> Self {
        Self {
            generation,
            ..Self::default()
        }
    }

    /// Increases with every entry a tracker creates
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn cancellation(&self) -> &Cancellation {
        &self.cancellation
    }

    pub fn is_stopping(&self) -> bool {
        self.cancellation.is_stopping()
    }

    /// Register a launched process
    pub fn attach(&self, handle: ProcessHandle) {
        self.processes.lock().insert(handle.id, handle);
    }

    /// Forget a process once it has been observed exiting
    pub fn detach(&self, handle_id: u64) {
        self.processes.lock().remove(&handle_id);
    }

    pub fn processes(&self) -> Vec<ProcessHandle> {
        self.processes.lock().values().cloned().collect()
    }

    pub fn mark_finished(&self) {
        self.finished_at.lock().get_or_insert_with(Instant::now);
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.lock().is_some()
    }

    fn expired(&self, now: Instant, retention: Duration) -> bool {
        match *self.finished_at.lock() {
            Some(at) => now.saturating_duration_since(at) >= retention,
            None => false,
        }
    }
}

/// Map from video id to its entry for one kind of activity
#[derive(Debug)]
pub struct Tracker {
    kind: TrackerKind,
    entries: DashMap<String, Arc<TrackerEntry>>,
    retention: Duration,
    generations: AtomicU64,
}

impl Tracker {
    pub fn new(kind: TrackerKind, retention: Duration) -> Self {
        Self {
            kind,
            entries: DashMap::new(),
            retention,
            generations: AtomicU64::new(0),
        }
    }

    fn fresh_entry(&self) -> Arc<TrackerEntry> {
        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        Arc::new(TrackerEntry::with_generation(generation))
    }

    pub fn kind(&self) -> TrackerKind {
        self.kind
    }

    /// Start fresh activity. Replaces a finished tombstone; rejects a live entry.
    pub fn begin(&self, video_id: &str) -> Result<Arc<TrackerEntry>, TrackerError> {
        match self.entries.entry(video_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().is_finished() {
                    return Err(TrackerError::AlreadyActive {
                        kind: self.kind,
                        video_id: video_id.to_string(),
                    });
                }
                let entry = self.fresh_entry();
                occupied.insert(entry.clone());
                Ok(entry)
            }
            Entry::Vacant(vacant) => Ok(vacant.insert(self.fresh_entry()).clone()),
        }
    }

    /// Join live activity or start fresh. Activity that is stopping can't be joined.
    pub fn enlist(&self, video_id: &str) -> Result<Arc<TrackerEntry>, TrackerError> {
        match self.entries.entry(video_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get();
                if !current.is_finished() {
                    if current.is_stopping() {
                        return Err(TrackerError::Stopping {
                            kind: self.kind,
                            video_id: video_id.to_string(),
                        });
                    }
                    return Ok(current.clone());
                }
                let entry = self.fresh_entry();
                occupied.insert(entry.clone());
                Ok(entry)
            }
            Entry::Vacant(vacant) => Ok(vacant.insert(self.fresh_entry()).clone()),
        }
    }

    pub fn get(&self, video_id: &str) -> Option<Arc<TrackerEntry>> {
        self.entries.get(video_id).map(|e| e.value().clone())
    }

    /// Live (not finished) entry for a video
    pub fn active(&self, video_id: &str) -> Option<Arc<TrackerEntry>> {
        self.get(video_id).filter(|e| !e.is_finished())
    }

    pub fn is_active(&self, video_id: &str) -> bool {
        self.active(video_id).is_some()
    }

    /// Ids of videos with live entries
    pub fn active_ids(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| !e.value().is_finished())
            .map(|e| e.key().clone())
            .collect()
    }

    /// Drop tombstones older than the retention period. Returns how many went.
    pub fn evict_expired(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| !entry.expired(now, self.retention));
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The three trackers, shared by every service
#[derive(Debug)]
pub struct Trackers {
    pub encoding: Tracker,
    pub streams: Tracker,
    pub imports: Tracker,
    /// Serializes starts that must not overlap another kind
    claims: Mutex<()>,
}

impl Trackers {
    pub fn new(retention: Duration) -> Self {
        Self {
            encoding: Tracker::new(TrackerKind::Encoding, retention),
            streams: Tracker::new(TrackerKind::Stream, retention),
            imports: Tracker::new(TrackerKind::Import, retention),
            claims: Mutex::new(()),
        }
    }

    /// Run `start` unless the video has `conflicting` activity. Two starts
    /// going through here for the same video never both succeed.
    pub fn exclusive<T>(
        &self,
        video_id: &str,
        conflicting: TrackerKind,
        start: impl FnOnce() -> Result<T, TrackerError>,
    ) -> Result<T, TrackerError> {
        let _claim = self.claims.lock();
        if self.get(conflicting).is_active(video_id) {
            return Err(TrackerError::AlreadyActive {
                kind: conflicting,
                video_id: video_id.to_string(),
            });
        }
        start()
    }

    pub fn get(&self, kind: TrackerKind) -> &Tracker {
        match kind {
            TrackerKind::Encoding => &self.encoding,
            TrackerKind::Stream => &self.streams,
            TrackerKind::Import => &self.imports,
        }
    }

    pub fn evict_expired(&self, now: Instant) -> usize {
        self.encoding.evict_expired(now) + self.streams.evict_expired(now) + self.imports.evict_expired(now)
    }

    /// Stop and kill everything still active. Returns the number of entries.
    pub fn stop_all(&self) -> usize {
        let mut stopped = 0;
        for tracker in [&self.encoding, &self.streams, &self.imports] {
            for video_id in tracker.active_ids() {
                if let Some(entry) = tracker.active(&video_id) {
                    entry.cancellation().stop();
                    stopped += 1;
                }
            }
        }
        stopped
    }

    /// Videos being imported, published or streamed, sorted and deduplicated
    pub fn busy_videos(&self) -> Vec<String> {
        let mut ids = self.encoding.active_ids();
        ids.extend(self.streams.active_ids());
        ids.extend(self.imports.active_ids());
        ids.sort();
        ids.dedup();
        ids
    }
}
