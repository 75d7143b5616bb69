//! Presence tracking: who is looking at which document.
//!
//! A session opens on the first heartbeat for a `(document, author)` pair
//! without an active session, is refreshed by later heartbeats, and ends on
//! an explicit leave or when no heartbeat arrives within the timeout.
//!
//! Expiry is evaluated lazily on every read and eagerly by
//! [`PresenceTracker::sweep_expired`]; both use the tracker's single
//! `timeout`, so a session is never active for one and expired for the other.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use concord_core::{AuthorId, DocumentId};

use crate::time::Clock;

/// One editing session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceSession {
    pub id: Uuid,
    pub document_id: DocumentId,
    pub author: AuthorId,
    /// Opaque cursor/selection payload from the client.
    pub payload: Vec<u8>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_heartbeat: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub started_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl PresenceSession {
    pub fn is_active(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        self.ended_at.is_none() && now - self.last_heartbeat < timeout
    }

    fn expires_at(&self, timeout: Duration) -> DateTime<Utc> {
        self.last_heartbeat + timeout
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PresenceChange {
    Joined,
    Refreshed,
    Left,
    Expired,
}

/// Published on `document:<id>:presence`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEvent {
    pub document_id: DocumentId,
    pub author: AuthorId,
    pub change: PresenceChange,
    pub payload: Vec<u8>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub at: DateTime<Utc>,
    /// Active sessions on the document after this change.
    pub active_count: usize,
}

/// Result of [`PresenceTracker::heartbeat`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatOutcome {
    pub session: PresenceSession,
    /// `Joined` for a new session, `Refreshed` otherwise.
    pub change: PresenceChange,
    pub active_count: usize,
}

/// Owns every presence session.
pub struct PresenceTracker {
    sessions: RwLock<HashMap<DocumentId, Vec<PresenceSession>>>,
    timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl PresenceTracker {
    pub fn new(timeout: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            timeout,
            clock,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Upsert the session for `(document, author)` and refresh its heartbeat.
    pub async fn heartbeat(
        &self,
        document: DocumentId,
        author: &AuthorId,
        payload: Vec<u8>,
    ) -> HeartbeatOutcome {
        let now = self.clock.now();
        let timeout = self.timeout;
        let mut sessions = self.sessions.write().await;
        let doc_sessions = sessions.entry(document).or_default();

        let open = doc_sessions
            .iter_mut()
            .find(|s| s.author == *author && s.ended_at.is_none());

        let (session, change) = match open {
            Some(s) if s.is_active(now, timeout) => {
                s.last_heartbeat = now;
                s.payload = payload;
                (s.clone(), PresenceChange::Refreshed)
            }
            stale => {
                // Expired but not yet swept: close it where it lapsed.
                if let Some(s) = stale {
                    s.ended_at = Some(s.expires_at(timeout));
                }
                let session = PresenceSession {
                    id: Uuid::new_v4(),
                    document_id: document,
                    author: author.clone(),
                    payload,
                    last_heartbeat: now,
                    started_at: now,
                    ended_at: None,
                };
                doc_sessions.push(session.clone());
                log::debug!("Presence session {} opened for {author} on {document}", session.id);
                (session, PresenceChange::Joined)
            }
        };

        let active_count = doc_sessions
            .iter()
            .filter(|s| s.is_active(now, timeout))
            .count();
        log::trace!("Heartbeat from {author} on {document}: {active_count} active");
        HeartbeatOutcome {
            session,
            change,
            active_count,
        }
    }

    /// End the author's open session. Returns it, if there was one.
    pub async fn leave(&self, document: DocumentId, author: &AuthorId) -> Option<PresenceSession> {
        let now = self.clock.now();
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(&document)?
            .iter_mut()
            .find(|s| s.author == *author && s.ended_at.is_none())?;
        session.ended_at = Some(if session.is_active(now, self.timeout) {
            now
        } else {
            session.expires_at(self.timeout)
        });
        log::debug!("Presence session {} left by {author} on {document}", session.id);
        Some(session.clone())
    }

    /// Sessions on `document` with a heartbeat within the timeout.
    pub async fn active_sessions(&self, document: DocumentId) -> Vec<PresenceSession> {
        let now = self.clock.now();
        self.sessions
            .read()
            .await
            .get(&document)
            .map(|list| {
                list.iter()
                    .filter(|s| s.is_active(now, self.timeout))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn active_count(&self, document: DocumentId) -> usize {
        self.active_sessions(document).await.len()
    }

    /// Every session ever recorded for `document`, ended ones included.
    pub async fn sessions(&self, document: DocumentId) -> Vec<PresenceSession> {
        self.sessions
            .read()
            .await
            .get(&document)
            .cloned()
            .unwrap_or_default()
    }

    /// Mark every open session past the timeout as ended. Returns the
    /// sessions ended by this call.
    pub async fn sweep_expired(&self) -> Vec<PresenceSession> {
        let now = self.clock.now();
        let timeout = self.timeout;
        let mut ended = Vec::new();
        let mut sessions = self.sessions.write().await;
        for list in sessions.values_mut() {
            for s in list.iter_mut() {
                if s.ended_at.is_none() && !s.is_active(now, timeout) {
                    s.ended_at = Some(s.expires_at(timeout));
                    ended.push(s.clone());
                }
            }
        }
        if !ended.is_empty() {
            log::info!("Expired {} presence sessions", ended.len());
        }
        ended
    }

    /// Forget sessions that ended more than `retention` ago.
    pub async fn purge_ended(&self, retention: Duration) -> usize {
        let cutoff = self.clock.now() - retention;
        let mut sessions = self.sessions.write().await;
        let mut purged = 0;
        sessions.retain(|_, list| {
            let before = list.len();
            list.retain(|s| !matches!(s.ended_at, Some(ended) if ended < cutoff));
            purged += before - list.len();
            !list.is_empty()
        });
        purged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualClock;

    fn tracker() -> (Arc<ManualClock>, PresenceTracker) {
        let clock = Arc::new(ManualClock::starting_now());
        let tracker = PresenceTracker::new(Duration::minutes(5), clock.clone());
        (clock, tracker)
    }

    #[tokio::test]
    async fn test_first_heartbeat_joins_then_refreshes() {
        let (_clock, tracker) = tracker();
        let doc = DocumentId::new_v4();
        let c = AuthorId::from("carol");
        let first = tracker.heartbeat(doc, &c, vec![1]).await;
        assert_eq!(first.change, PresenceChange::Joined);
        assert_eq!(first.active_count, 1);
        let second = tracker.heartbeat(doc, &c, vec![2]).await;
        assert_eq!(second.change, PresenceChange::Refreshed);
        assert_eq!(second.session.id, first.session.id);
        assert_eq!(second.session.payload, vec![2]);
    }

    #[tokio::test]
    async fn test_heartbeats_keep_session_alive_then_expire() {
        let (clock, tracker) = tracker();
        let doc = DocumentId::new_v4();
        let c = AuthorId::from("carol");
        tracker.heartbeat(doc, &c, vec![]).await;
        clock.advance(Duration::minutes(2));
        tracker.heartbeat(doc, &c, vec![]).await;
        assert_eq!(tracker.active_count(doc).await, 1);

        clock.advance(Duration::minutes(6));
        assert!(tracker.active_sessions(doc).await.is_empty());

        let ended = tracker.sweep_expired().await;
        assert_eq!(ended.len(), 1);
        assert!(ended[0].ended_at.is_some());
        // Idempotent.
        assert!(tracker.sweep_expired().await.is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_after_lapse_opens_new_session() {
        let (clock, tracker) = tracker();
        let doc = DocumentId::new_v4();
        let c = AuthorId::from("carol");
        let first = tracker.heartbeat(doc, &c, vec![]).await;
        clock.advance(Duration::minutes(10));
        let second = tracker.heartbeat(doc, &c, vec![]).await;
        assert_eq!(second.change, PresenceChange::Joined);
        assert_ne!(second.session.id, first.session.id);

        let all = tracker.sessions(doc).await;
        assert_eq!(all.len(), 2);
        assert_eq!(
            all[0].ended_at,
            Some(first.session.last_heartbeat + Duration::minutes(5))
        );
    }

    #[tokio::test]
    async fn test_leave_ends_session() {
        let (_clock, tracker) = tracker();
        let doc = DocumentId::new_v4();
        let a = AuthorId::from("alice");
        let b = AuthorId::from("bob");
        tracker.heartbeat(doc, &a, vec![]).await;
        tracker.heartbeat(doc, &b, vec![]).await;
        let left = tracker.leave(doc, &a).await.unwrap();
        assert!(left.ended_at.is_some());
        let active = tracker.active_sessions(doc).await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].author, b);
        assert!(tracker.leave(doc, &a).await.is_none());
    }

    #[tokio::test]
    async fn test_purge_ended() {
        let (clock, tracker) = tracker();
        let doc = DocumentId::new_v4();
        let a = AuthorId::from("alice");
        tracker.heartbeat(doc, &a, vec![]).await;
        tracker.leave(doc, &a).await;
        assert_eq!(tracker.purge_ended(Duration::hours(1)).await, 0);
        clock.advance(Duration::hours(2));
        assert_eq!(tracker.purge_ended(Duration::hours(1)).await, 1);
        assert!(tracker.sessions(doc).await.is_empty());
    }

    #[tokio::test]
    async fn test_documents_are_independent() {
        let (_clock, tracker) = tracker();
        let a = AuthorId::from("alice");
        let d1 = DocumentId::new_v4();
        let d2 = DocumentId::new_v4();
        tracker.heartbeat(d1, &a, vec![]).await;
        assert_eq!(tracker.active_count(d1).await, 1);
        assert_eq!(tracker.active_count(d2).await, 0);
    }
}
