//! Stream registry: the only process-wide mutable map.
//!
//! Maps each stream key to its currently-active session. The registry lock is
//! held only across the get-or-rotate decision; retirement of a displaced
//! session and all per-session work happen outside it.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::Config;
use crate::errors::StorageError;
use crate::models::{SegmentUpload, SessionStatus};
use crate::session::StreamSession;

pub struct StreamRegistry {
    config: Arc<Config>,
    sessions: Mutex<HashMap<String, Arc<StreamSession>>>,
}

impl StreamRegistry {
    pub fn new(config: Arc<Config>) -> Arc<Self> {
        Arc::new(Self {
            config,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    /// Resolve the session that will receive this upload, creating or
    /// rotating one as needed. The registry lock is only held across map
    /// lookups and the swap itself; session setup I/O and retirement of a
    /// displaced session happen outside it.
    pub async fn resolve(
        self: &Arc<Self>,
        upload: &SegmentUpload,
    ) -> Result<Arc<StreamSession>, StorageError> {
        let current = {
            let sessions = self.sessions.lock().await;
            sessions.get(&upload.stream_key).cloned()
        };
        let rotate = match &current {
            None => true,
            Some(session) => session.needs_rotation(upload).await,
        };
        if !rotate {
            return Ok(current.expect("non-rotating resolve always has a current session"));
        }

        if current.is_some() {
            info!(
                stream_key = %upload.stream_key,
                sequence = upload.sequence,
                "rotating session"
            );
        }
        let fresh = StreamSession::create(
            &upload.stream_key,
            self.config.clone(),
            Arc::downgrade(self),
        )
        .await?;

        // Re-check under the lock: another request may have rotated (or a
        // finalization may have removed the entry) while we were creating.
        let mut displaced = None;
        let session = {
            let mut sessions = self.sessions.lock().await;
            let unchanged = match (&current, sessions.get(&upload.stream_key)) {
                (None, None) | (Some(_), None) => true,
                (Some(old), Some(registered)) => Arc::ptr_eq(old, registered),
                (None, Some(_)) => false,
            };
            if unchanged {
                displaced = sessions.insert(upload.stream_key.clone(), fresh.clone());
                fresh.clone()
            } else {
                sessions
                    .get(&upload.stream_key)
                    .cloned()
                    .expect("entry observed in the race check")
            }
        };

        if let Some(old) = displaced {
            old.retire().await;
        }
        if !Arc::ptr_eq(&session, &fresh) {
            debug!(
                stream_key = %upload.stream_key,
                "lost session creation race, discarding unused session"
            );
            fresh.discard().await;
        }

        Ok(session)
    }

    /// Drop a finalized session, but only while it is still the registered
    /// one for its key (a rotation may already have replaced it).
    pub async fn remove_if_current(&self, session: &Arc<StreamSession>) {
        let mut sessions = self.sessions.lock().await;
        if let Some(current) = sessions.get(session.stream_key()) {
            if Arc::ptr_eq(current, session) {
                sessions.remove(session.stream_key());
                debug!(
                    stream_key = %session.stream_key(),
                    session_id = %session.session_id(),
                    "session removed from registry"
                );
            }
        }
    }

    pub async fn get(&self, stream_key: &str) -> Option<Arc<StreamSession>> {
        self.sessions.lock().await.get(stream_key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    /// Status snapshots for every registered session. Session locks are taken
    /// one at a time, after the registry lock has been released.
    pub async fn statuses(&self) -> Vec<SessionStatus> {
        let sessions: Vec<Arc<StreamSession>> =
            self.sessions.lock().await.values().cloned().collect();

        let mut statuses = Vec::with_capacity(sessions.len());
        for session in sessions {
            statuses.push(session.status().await);
        }
        statuses.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        statuses
    }

    /// Retire every session; used on process shutdown so downstream readers
    /// see finalized playlists.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<StreamSession>> =
            self.sessions.lock().await.drain().map(|(_, s)| s).collect();

        for session in sessions {
            session.retire().await;
        }
    }
}
