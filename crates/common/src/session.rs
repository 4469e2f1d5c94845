use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::SessionError;
use crate::filters::FilterSet;
use crate::types::BusinessRecord;

/// Status of a crawl session.
///
/// Allowed moves: `running -> {paused, completed, failed}` and
/// `paused -> running`. Completed and failed are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Paused,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }

    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        matches!(
            (self, next),
            (Self::Running, Self::Paused)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
                | (Self::Paused, Self::Running)
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Browser cookie captured for session resumption
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    /// Seconds since epoch, -1 for session cookies
    pub expires: f64,
    pub http_only: bool,
    pub secure: bool,
}

/// Durable state of one crawl run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScraperSession {
    pub id: String,
    pub start_time: DateTime<Utc>,
    pub query: String,
    pub status: SessionStatus,
    pub processed_items: usize,
    pub results: Vec<BusinessRecord>,
    pub filters: Option<FilterSet>,
    #[serde(default)]
    pub cookies: Vec<SessionCookie>,
    pub error_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionStats {
    pub total_sessions: usize,
    pub sessions_by_status: HashMap<String, usize>,
}

/// File-backed store of crawl sessions.
///
/// Each session lives in `<dir>/<session_id>.json` and the whole record is
/// rewritten before every mutating call returns, so the file always holds
/// the last acknowledged state. Writes go through a temp file and a rename.
#[derive(Clone)]
pub struct SessionStore {
    dir: PathBuf,
    sessions: Arc<RwLock<HashMap<String, ScraperSession>>>,
}

impl SessionStore {
    /// Open (or create) a store directory and load every session file in it.
    /// Unreadable files are skipped with a warning.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, SessionError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;

        let mut sessions = HashMap::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            let loaded = tokio::fs::read(&path)
                .await
                .map_err(SessionError::from)
                .and_then(|bytes| {
                    serde_json::from_slice::<ScraperSession>(&bytes).map_err(SessionError::from)
                });

            match loaded {
                Ok(session) => {
                    sessions.insert(session.id.clone(), session);
                }
                Err(e) => warn!(path = %path.display(), "Skipping unreadable session file: {}", e),
            }
        }

        info!(dir = %dir.display(), sessions = sessions.len(), "Session store opened");

        Ok(Self {
            dir,
            sessions: Arc::new(RwLock::new(sessions)),
        })
    }

    /// Create a running session and persist it
    pub async fn create_session(
        &self,
        query: &str,
        filters: Option<FilterSet>,
    ) -> Result<String, SessionError> {
        let now = Utc::now();
        let suffix = Uuid::new_v4().simple().to_string();
        let id = format!("session_{}_{}", now.timestamp_millis(), &suffix[..8]);

        let session = ScraperSession {
            id: id.clone(),
            start_time: now,
            query: query.to_string(),
            status: SessionStatus::Running,
            processed_items: 0,
            results: Vec::new(),
            filters,
            cookies: Vec::new(),
            error_reason: None,
        };

        let mut sessions = self.sessions.write().await;
        self.persist(&session).await?;
        sessions.insert(id.clone(), session);

        info!(session_id = %id, query = %query, "Session created");
        Ok(id)
    }

    /// Move a session to a new status.
    ///
    /// Setting the current status again only refreshes `error_reason`.
    pub async fn update_status(
        &self,
        id: &str,
        status: SessionStatus,
        reason: Option<String>,
    ) -> Result<(), SessionError> {
        self.mutate(id, |session| {
            if session.status != status && !session.status.can_transition_to(status) {
                return Err(SessionError::InvalidTransition {
                    id: session.id.clone(),
                    from: session.status,
                    to: status,
                });
            }
            session.status = status;
            if reason.is_some() {
                session.error_reason = reason;
            }
            Ok(())
        })
        .await?;

        debug!(session_id = %id, status = %status, "Session status updated");
        Ok(())
    }

    /// Record progress and append newly discovered records.
    ///
    /// `processed_items` of None keeps the current counter. Results are only
    /// ever appended.
    pub async fn update_progress(
        &self,
        id: &str,
        processed_items: Option<usize>,
        new_results: Vec<BusinessRecord>,
    ) -> Result<(), SessionError> {
        self.mutate(id, |session| {
            if let Some(processed) = processed_items {
                session.processed_items = processed;
            }
            session.results.extend(new_results);
            Ok(())
        })
        .await
    }

    /// Fold enriched fields into the stored copy of a record (same place id).
    /// Records never seen before are appended.
    pub async fn merge_result(&self, id: &str, record: BusinessRecord) -> Result<(), SessionError> {
        self.mutate(id, |session| {
            match session
                .results
                .iter_mut()
                .find(|r| r.place_id == record.place_id)
            {
                Some(existing) => *existing = record,
                None => session.results.push(record),
            }
            Ok(())
        })
        .await
    }

    pub async fn save_cookies(
        &self,
        id: &str,
        cookies: Vec<SessionCookie>,
    ) -> Result<(), SessionError> {
        self.mutate(id, |session| {
            session.cookies = cookies;
            Ok(())
        })
        .await
    }

    pub async fn get_session(&self, id: &str) -> Option<ScraperSession> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Sessions that are running or paused, oldest first
    pub async fn list_active(&self) -> Vec<ScraperSession> {
        let sessions = self.sessions.read().await;
        let mut active: Vec<ScraperSession> = sessions
            .values()
            .filter(|s| s.status.is_active())
            .cloned()
            .collect();
        active.sort_by_key(|s| s.start_time);
        active
    }

    pub async fn get_stats(&self) -> SessionStats {
        let sessions = self.sessions.read().await;

        SessionStats {
            total_sessions: sessions.len(),
            sessions_by_status: sessions.values().fold(HashMap::new(), |mut acc, session| {
                *acc.entry(session.status.to_string()).or_insert(0) += 1;
                acc
            }),
        }
    }

    /// Apply a change to a copy, persist it, then publish it in memory.
    /// A failed write leaves the in-memory state untouched.
    async fn mutate<F>(&self, id: &str, change: F) -> Result<(), SessionError>
    where
        F: FnOnce(&mut ScraperSession) -> Result<(), SessionError>,
    {
        let mut sessions = self.sessions.write().await;
        let current = sessions
            .get(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;

        let mut updated = current.clone();
        change(&mut updated)?;
        self.persist(&updated).await?;
        sessions.insert(id.to_string(), updated);
        Ok(())
    }

    async fn persist(&self, session: &ScraperSession) -> Result<(), SessionError> {
        let path = self.dir.join(format!("{}.json", session.id));
        let tmp = self.dir.join(format!("{}.json.tmp", session.id));
        let bytes = serde_json::to_vec_pretty(session)?;
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}
