//! Per-stream session state machine.
//!
//! A session owns one on-disk directory, one event playlist, the pending
//! segment queue with its ordered write cursor, the stall watcher, and the
//! supervised uploader child. All mutation is serialized through the session
//! lock; the registry decides which session an upload lands in.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Local;
use tokio::sync::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, TargetMismatchPolicy};
use crate::errors::{AppError, PlaylistError, StorageError, UploaderError};
use crate::models::{
    PendingSegment, RelayTarget, SegmentType, SegmentUpload, SessionEvent, SessionStatus,
    UploaderStatus,
};
use crate::playlist::PlaylistWriter;
use crate::registry::StreamRegistry;
use crate::storage::SegmentStore;
use crate::uploader::{self, ChildStatus, UploaderHandle};

const STALL_TICK: Duration = Duration::from_secs(1);

/// What an admit did, for the HTTP response and registry upkeep.
#[derive(Debug, Clone, Copy)]
pub struct AdmitOutcome {
    /// False when the session had already been finalized.
    pub accepted: bool,
    /// The segment's sequence was at or behind the write cursor.
    pub stale: bool,
    /// The session is finalized after this admit.
    pub finalized: bool,
}

pub struct StreamSession {
    stream_key: String,
    session_id: String,
    store: SegmentStore,
    config: Arc<Config>,
    registry: Weak<StreamRegistry>,
    state: Mutex<SessionState>,
    shutdown: CancellationToken,
}

struct SessionState {
    playlist: PlaylistWriter,
    pending: BTreeMap<u64, PendingSegment>,
    final_marker: bool,
    last_written_sequence: i64,
    map_written: bool,
    period_index: u32,
    written_media_count: u64,
    gap_wait: Option<(u64, Instant)>,
    last_upload: Instant,
    last_advance: Instant,
    finalized: bool,
    watcher_started: bool,
    uploader: Option<UploaderHandle>,
    target: Option<RelayTarget>,
    target_mismatch_reported: bool,
    last_uploader_exit: Option<String>,
    events: VecDeque<SessionEvent>,
    upload_durations: VecDeque<(Instant, f64)>,
}

impl SessionState {
    fn new(playlist_path: PathBuf) -> Self {
        let now = Instant::now();
        Self {
            playlist: PlaylistWriter::new(playlist_path),
            pending: BTreeMap::new(),
            final_marker: false,
            last_written_sequence: -1,
            map_written: false,
            period_index: 0,
            written_media_count: 0,
            gap_wait: None,
            last_upload: now,
            last_advance: now,
            finalized: false,
            watcher_started: false,
            uploader: None,
            target: None,
            target_mismatch_reported: false,
            last_uploader_exit: None,
            events: VecDeque::new(),
            upload_durations: VecDeque::new(),
        }
    }
}

impl StreamSession {
    /// Create a fresh session with its own timestamped directory.
    ///
    /// The timestamp resolution is one second; rotations landing in the same
    /// second get a numeric disambiguator so session ids stay process-unique.
    pub async fn create(
        stream_key: &str,
        config: Arc<Config>,
        registry: Weak<StreamRegistry>,
    ) -> Result<Arc<Self>, StorageError> {
        let base = config.storage.segments_dir.clone();
        tokio::fs::create_dir_all(&base)
            .await
            .map_err(|source| StorageError::CreateDir {
                path: base.display().to_string(),
                source,
            })?;

        let stamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
        let mut session_id = format!("{stream_key}_{stamp}");
        let mut attempt = 0u32;
        let dir = loop {
            let candidate = base.join(&session_id);
            match tokio::fs::create_dir(&candidate).await {
                Ok(()) => break candidate,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    attempt += 1;
                    session_id = format!("{stream_key}_{stamp}_{attempt}");
                }
                Err(source) => {
                    return Err(StorageError::CreateDir {
                        path: candidate.display().to_string(),
                        source,
                    });
                }
            }
        };

        info!(stream_key, session_id = %session_id, "session created");
        let playlist_path = dir.join("playlist.m3u8");
        Ok(Arc::new(Self {
            stream_key: stream_key.to_string(),
            session_id,
            store: SegmentStore::new(dir),
            config,
            registry,
            state: Mutex::new(SessionState::new(playlist_path)),
            shutdown: CancellationToken::new(),
        }))
    }

    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn dir(&self) -> &Path {
        self.store.dir()
    }

    pub fn playlist_path(&self) -> PathBuf {
        self.store.dir().join("playlist.m3u8")
    }

    /// Delete the on-disk directory of a session that lost a creation race
    /// before receiving any data.
    pub async fn discard(&self) {
        if let Err(e) = tokio::fs::remove_dir_all(self.store.dir()).await {
            debug!(session_id = %self.session_id, "failed to remove unused session dir: {e}");
        }
    }

    /// Whether an arriving upload forces the registry to rotate this session
    /// out: already finalized, or an init re-entering the written sequence
    /// space (the encoder restarted counting).
    pub async fn needs_rotation(&self, upload: &SegmentUpload) -> bool {
        let state = self.state.lock().await;
        if state.finalized {
            return true;
        }
        upload.segment_type == SegmentType::Initialization
            && state.map_written
            && upload.sequence as i64 <= state.last_written_sequence
    }

    /// Accept one authenticated, parsed upload: persist the body under the
    /// period-aware filename and run the state machine. The whole procedure
    /// holds the session lock, so concurrent uploads for the same stream key
    /// observe a coherent period/map state.
    pub async fn admit(
        self: &Arc<Self>,
        upload: &SegmentUpload,
        body: &[u8],
        request_started: Instant,
    ) -> Result<AdmitOutcome, AppError> {
        let mut state = self.state.lock().await;
        if state.finalized {
            debug!(
                session_id = %self.session_id,
                sequence = upload.sequence,
                "segment for finalized session ignored"
            );
            return Ok(AdmitOutcome {
                accepted: false,
                stale: false,
                finalized: true,
            });
        }

        // An init arriving after the first map belongs to the period it is
        // about to open.
        let is_init = upload.segment_type == SegmentType::Initialization;
        let period = if is_init && state.map_written {
            state.period_index + 1
        } else {
            state.period_index
        };
        let filename = SegmentStore::segment_filename(period, upload.sequence, is_init);
        self.store.persist(&filename, body).await?;

        state.last_upload = Instant::now();
        self.ensure_watcher(&mut state);

        let mut stale = false;
        match upload.segment_type {
            SegmentType::Initialization => {
                if !state.map_written {
                    state.playlist.write_header(upload.sequence, &filename).await?;
                    state.map_written = true;
                    // The init owns its sequence number; media starts one past it.
                    state.last_written_sequence = upload.sequence as i64;
                } else {
                    state.playlist.append_new_period(&filename).await?;
                    state.period_index += 1;
                    let period = state.period_index;
                    self.record_event(
                        &mut state,
                        format!("period {period} opened at sequence {}", upload.sequence),
                    );
                }
            }
            SegmentType::Media | SegmentType::Finalization => {
                if upload.sequence as i64 <= state.last_written_sequence {
                    state.pending.remove(&upload.sequence);
                    stale = true;
                    let cursor = state.last_written_sequence;
                    self.record_event(
                        &mut state,
                        format!("stale segment {} dropped (cursor at {cursor})", upload.sequence),
                    );
                } else {
                    state.pending.insert(
                        upload.sequence,
                        PendingSegment {
                            filename: filename.clone(),
                            duration: upload.duration,
                            discontinuity: upload.discontinuity,
                        },
                    );
                }
                if upload.segment_type == SegmentType::Finalization {
                    state.final_marker = true;
                }
            }
        }

        self.drain(&mut state).await?;

        if !state.finalized {
            self.evaluate_uploader(&mut state, &upload.target).await;
        }

        self.record_upload_sample(&mut state, request_started.elapsed());

        Ok(AdmitOutcome {
            accepted: true,
            stale,
            finalized: state.finalized,
        })
    }

    /// Advance the ordered write cursor as far as the pending queue allows,
    /// skipping past a gap once it has been missing for the configured
    /// timeout. Runs the finalization marker afterwards.
    async fn drain(&self, state: &mut SessionState) -> Result<(), PlaylistError> {
        if state.map_written {
            loop {
                let next = (state.last_written_sequence + 1) as u64;
                if let Some(segment) = state.pending.remove(&next) {
                    self.append_and_advance(state, next, segment, false).await?;
                    continue;
                }

                match state.gap_wait {
                    Some((waiting_on, since)) if waiting_on == next => {
                        if since.elapsed() < self.config.relay.gap_skip_timeout {
                            break;
                        }
                        let Some((&resume_at, _)) = state.pending.range(next..).next() else {
                            break;
                        };
                        let segment = state
                            .pending
                            .remove(&resume_at)
                            .expect("sequence was just found in the pending range");
                        // The survivor of a skip is always marked discontinuous.
                        self.append_and_advance(state, resume_at, segment, true).await?;
                        self.record_event(state, format!("skipped {next}; resumed at {resume_at}"));
                    }
                    _ => {
                        state.gap_wait = Some((next, Instant::now()));
                        break;
                    }
                }
            }
        }

        if state.final_marker {
            state.final_marker = false;
            self.finalize_locked(state, "finalization marker received").await;
        }
        Ok(())
    }

    async fn append_and_advance(
        &self,
        state: &mut SessionState,
        sequence: u64,
        segment: PendingSegment,
        force_discontinuity: bool,
    ) -> Result<(), PlaylistError> {
        let with_discontinuity = force_discontinuity || segment.discontinuity;
        state
            .playlist
            .append_media(&segment.filename, segment.duration, with_discontinuity)
            .await?;
        state.written_media_count += 1;
        state.last_written_sequence = sequence as i64;
        state.gap_wait = None;
        state.last_advance = Instant::now();
        Ok(())
    }

    /// One-way finalization: ENDLIST, watcher stop, uploader teardown. The
    /// caller is responsible for registry removal once the lock is released.
    async fn finalize_locked(&self, state: &mut SessionState, reason: &str) {
        if state.finalized {
            return;
        }
        state.finalized = true;

        if let Err(e) = state.playlist.append_endlist().await {
            warn!(session_id = %self.session_id, "failed to write ENDLIST: {e}");
        }
        self.record_event(state, format!("finalized: {reason}"));
        self.shutdown.cancel();

        if let Some(handle) = state.uploader.take() {
            let session_id = self.session_id.clone();
            tokio::spawn(async move {
                if let Some(exit) = handle.shutdown().await {
                    info!(session_id, "uploader terminated ({exit})");
                }
            });
        }
    }

    /// Retire this session out of the registry's rotation path: stop the
    /// watcher, finalize, and terminate the uploader inline.
    pub async fn retire(&self) {
        self.shutdown.cancel();
        let mut state = self.state.lock().await;
        let uploader = state.uploader.take();
        if !state.finalized {
            self.finalize_locked(&mut state, "session retired").await;
        }
        drop(state);

        if let Some(handle) = uploader {
            let exit = handle.shutdown().await;
            let mut state = self.state.lock().await;
            let message = match exit {
                Some(exit) => format!("uploader terminated ({exit})"),
                None => "uploader terminated".to_string(),
            };
            self.record_event(&mut state, message);
        }
    }

    fn ensure_watcher(self: &Arc<Self>, state: &mut SessionState) {
        if state.watcher_started {
            return;
        }
        state.watcher_started = true;
        let session = Arc::clone(self);
        tokio::spawn(async move { session.run_stall_watcher().await });
    }

    /// Finalize the session once neither uploads nor playlist progress have
    /// happened within the stall timeout.
    async fn run_stall_watcher(self: Arc<Self>) {
        let timeout = self.config.relay.missing_segment_timeout;
        let mut tick = tokio::time::interval(STALL_TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tick.tick() => {}
            }

            let mut state = self.state.lock().await;
            if state.finalized {
                break;
            }
            let upload_stalled = state.last_upload.elapsed() > timeout;
            let advance_stalled = state.last_advance.elapsed() > timeout;
            if !(upload_stalled || advance_stalled) {
                continue;
            }

            let reason = if upload_stalled {
                "no uploads within the stall timeout"
            } else {
                "no playlist progress within the stall timeout"
            };
            warn!(session_id = %self.session_id, "stall detected: {reason}");
            self.finalize_locked(&mut state, reason).await;
            drop(state);

            if let Some(registry) = self.registry.upgrade() {
                registry.remove_if_current(&self).await;
            }
            break;
        }
    }

    /// Decide whether an uploader must be started, evaluated at the end of
    /// every accepted admit.
    async fn evaluate_uploader(&self, state: &mut SessionState, target_header: &str) {
        let threshold = self.config.relay.segments_before_relay;
        if state.written_media_count < threshold {
            return;
        }

        if state.written_media_count == threshold {
            if state.uploader.is_none() && state.last_uploader_exit.is_none() {
                self.start_uploader(state, target_header, Some(0)).await;
            }
            return;
        }

        let status = state.uploader.as_mut().map(UploaderHandle::try_status);
        let restart = match status {
            None => true,
            Some(ChildStatus::Running) => false,
            Some(ChildStatus::Exited(exit)) => {
                state.uploader = None;
                state.last_uploader_exit = Some(exit.clone());
                self.record_event(state, format!("uploader exited ({exit})"));
                true
            }
        };
        if restart {
            self.start_uploader(state, target_header, None).await;
            return;
        }

        // Uploader is alive; deal with a changed Target header per policy.
        if let (Some(current), Ok(requested)) =
            (state.target, target_header.parse::<RelayTarget>())
        {
            if requested == current {
                return;
            }
            match self.config.relay.on_target_change {
                TargetMismatchPolicy::Reject => {
                    if !state.target_mismatch_reported {
                        state.target_mismatch_reported = true;
                        self.record_event(
                            state,
                            format!(
                                "target change to {requested} rejected (uploader running for {current})"
                            ),
                        );
                    }
                }
                TargetMismatchPolicy::Restart => {
                    if let Some(handle) = state.uploader.take() {
                        if let Some(exit) = handle.shutdown().await {
                            state.last_uploader_exit = Some(exit);
                        }
                    }
                    self.record_event(
                        state,
                        format!("target changed {current} -> {requested}, restarting uploader"),
                    );
                    self.start_uploader(state, target_header, None).await;
                }
            }
        }
    }

    async fn start_uploader(
        &self,
        state: &mut SessionState,
        target_header: &str,
        start_index: Option<u64>,
    ) {
        let target = match target_header.parse::<RelayTarget>() {
            Ok(target) => target,
            Err(other) => {
                let e = UploaderError::UnsupportedTarget(other);
                warn!(session_id = %self.session_id, "{e}");
                self.record_event(state, e.to_string());
                return;
            }
        };

        match uploader::spawn(
            &self.config,
            &self.session_id,
            &self.stream_key,
            target,
            start_index,
        ) {
            Ok(handle) => {
                state.target = Some(target);
                state.uploader = Some(handle);
                state.target_mismatch_reported = false;
                let message = match start_index {
                    Some(index) => {
                        format!("uploader started (target {target}, start index {index})")
                    }
                    None => format!("uploader restarted at live edge (target {target})"),
                };
                self.record_event(state, message);
            }
            Err(e) => {
                warn!(session_id = %self.session_id, "uploader failed to start: {e}");
                self.record_event(state, format!("uploader failed to start: {e}"));
            }
        }
    }

    fn record_event(&self, state: &mut SessionState, message: impl Into<String>) {
        let message = message.into();
        debug!(session_id = %self.session_id, "{message}");
        state.events.push_back(SessionEvent::now(message));
        while state.events.len() > self.config.relay.max_event_history {
            state.events.pop_front();
        }
    }

    fn record_upload_sample(&self, state: &mut SessionState, elapsed: Duration) {
        let now = Instant::now();
        state.upload_durations.push_back((now, elapsed.as_secs_f64()));
        Self::prune_samples(state, now, self.config.relay.upload_util_window);
    }

    fn prune_samples(state: &mut SessionState, now: Instant, window: Duration) {
        while let Some((taken, _)) = state.upload_durations.front() {
            if now.duration_since(*taken) > window {
                state.upload_durations.pop_front();
            } else {
                break;
            }
        }
    }

    /// Point-in-time snapshot for the status endpoint.
    pub async fn status(&self) -> SessionStatus {
        let mut state = self.state.lock().await;

        let running = match state.uploader.as_mut().map(UploaderHandle::try_status) {
            Some(ChildStatus::Running) => true,
            Some(ChildStatus::Exited(exit)) => {
                if state.last_uploader_exit.is_none() {
                    state.last_uploader_exit = Some(exit);
                }
                false
            }
            None => false,
        };

        let window = self.config.relay.upload_util_window;
        Self::prune_samples(&mut state, Instant::now(), window);
        let busy: f64 = state.upload_durations.iter().map(|(_, secs)| secs).sum();

        SessionStatus {
            stream_key: self.stream_key.clone(),
            session_id: self.session_id.clone(),
            period_index: state.period_index,
            last_written_sequence: state.last_written_sequence,
            written_media_count: state.written_media_count,
            gap_wait_sequence: state.gap_wait.map(|(sequence, _)| sequence),
            finalized: state.finalized,
            uploader: UploaderStatus {
                running,
                target: state.target,
                last_exit: state.last_uploader_exit.clone(),
            },
            upload_utilization: busy / window.as_secs_f64(),
            events: state.events.iter().cloned().collect(),
        }
    }
}
