//! Upload session lifecycle and resume records
//!
//! A session is bound to a source of a given length and to one destination.
//! Its record is written to the state directory before the first chunk is
//! sent and removed once the remote confirms the file, so an interrupted run
//! can pick the session up again.

use crate::error::{Error, Result};
use crate::path;
use crate::retry::RetryPolicy;
use crate::source::UploadTarget;
use crate::transport::{ConflictBehavior, UploadTransport};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Remote upload session and what it is bound to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSession {
    /// Opaque, pre-authenticated URL issued by the remote
    pub upload_url: String,
    /// Identity of the local source
    pub source: String,
    /// Normalized destination path
    pub destination: String,
    /// Source length when the session was opened
    #[serde(default)]
    pub size: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl UploadSession {
    /// Whether this session was opened for exactly this source and destination
    pub fn is_bound_to(&self, source: &str, destination: &str, size: u64) -> bool {
        self.source == source && self.destination == destination && self.size == size
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// How a session came to be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOrigin {
    Created,
    Resumed,
}

#[derive(Debug, Clone)]
pub struct ResolvedSession {
    pub session: UploadSession,
    pub origin: SessionOrigin,
}

/// Directory of JSON resume records, one per local source
#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Record file name: SHA-256 of the source identity
    pub fn key(source: &str) -> String {
        hex::encode(Sha256::digest(source.as_bytes()))
    }

    pub fn record_path(&self, source: &str) -> PathBuf {
        self.dir.join(format!("{}.json", Self::key(source)))
    }

    /// Load the record for `source`. Unreadable records are dropped.
    pub async fn load(&self, source: &str) -> Result<Option<UploadSession>> {
        let path = self.record_path(source);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_str(&content) {
            Ok(session) => Ok(Some(session)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Discarding corrupt session record");
                self.remove(source).await?;
                Ok(None)
            }
        }
    }

    /// Durably write the record: temp file, then rename over the old one
    pub async fn save(&self, session: &UploadSession) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.record_path(&session.source);
        let tmp = path.with_extension("json.tmp");

        let content = serde_json::to_vec_pretty(session)?;
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&content).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp, &path).await?;
        debug!(path = %path.display(), "Session record saved");
        Ok(())
    }

    /// Delete the record; returns whether one existed
    pub async fn remove(&self, source: &str) -> Result<bool> {
        match tokio::fs::remove_file(self.record_path(source)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Every readable record in the directory
    pub async fn list(&self) -> Result<Vec<UploadSession>> {
        let mut sessions = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(sessions),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = tokio::fs::read_to_string(&path).await?;
            match serde_json::from_str::<UploadSession>(&content) {
                Ok(session) => sessions.push(session),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping corrupt session record"),
            }
        }

        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(sessions)
    }

    /// Remove every record; returns how many were deleted
    pub async fn clear(&self) -> Result<usize> {
        let sessions = self.list().await?;
        let mut removed = 0;
        for session in &sessions {
            if self.remove(&session.source).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Creates, resumes and retires upload sessions
pub struct SessionManager {
    transport: Arc<dyn UploadTransport>,
    store: SessionStore,
    retry: RetryPolicy,
    conflict: ConflictBehavior,
}

impl SessionManager {
    pub fn new(
        transport: Arc<dyn UploadTransport>,
        store: SessionStore,
        retry: RetryPolicy,
        conflict: ConflictBehavior,
    ) -> Self {
        Self {
            transport,
            store,
            retry,
            conflict,
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Resume the persisted session for `target` or create a new one
    pub async fn resolve(&self, target: &UploadTarget) -> Result<ResolvedSession> {
        let source = target.identity();
        let destination = path::normalize(&target.destination);

        if let Some(existing) = self.store.load(source).await? {
            if !existing.is_bound_to(source, &destination, target.len()) {
                info!(
                    source,
                    previous = %existing.destination,
                    destination = %destination,
                    previous_size = existing.size,
                    size = target.len(),
                    "Discarding session bound to another destination or size"
                );
                self.store.remove(source).await?;
            } else if existing.is_expired(Utc::now()) {
                info!(source, "Discarding expired session record");
                self.store.remove(source).await?;
            } else {
                info!(source, destination = %destination, "Resuming upload session");
                return Ok(ResolvedSession {
                    session: existing,
                    origin: SessionOrigin::Resumed,
                });
            }
        }

        let session = self.create(target).await?;
        Ok(ResolvedSession {
            session,
            origin: SessionOrigin::Created,
        })
    }

    /// Open a fresh remote session and persist its record
    pub async fn create(&self, target: &UploadTarget) -> Result<UploadSession> {
        let destination = path::normalize(&target.destination);
        let transport = &self.transport;
        let dest = destination.as_str();
        let conflict = self.conflict;

        let reply = match self
            .retry
            .execute("create_session", move || transport.create_session(dest, conflict))
            .await
        {
            Ok(reply) => reply,
            Err(e @ Error::Authentication(_)) => return Err(e),
            Err(e) => {
                return Err(Error::SessionCreate {
                    status: None,
                    message: e.to_string(),
                })
            }
        };

        let status = reply.status.as_u16();
        if !reply.status.is_success() {
            return Err(match status {
                401 | 409 | 412 => reply.into_error(),
                _ => Error::SessionCreate {
                    status: Some(status),
                    message: reply.body,
                },
            });
        }

        let info = reply.session_info().unwrap_or_default();
        let upload_url = info.upload_url.ok_or_else(|| Error::SessionCreate {
            status: Some(status),
            message: "response carries no uploadUrl".to_string(),
        })?;
        let expires_at = info
            .expiration_date_time
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));

        let session = UploadSession {
            upload_url,
            source: target.identity().to_string(),
            destination,
            size: target.len(),
            created_at: Utc::now(),
            expires_at,
        };
        self.store.save(&session).await?;
        info!(
            source = %session.source,
            destination = %session.destination,
            "Upload session created"
        );
        Ok(session)
    }

    /// The remote confirmed the file: retire the record
    pub async fn complete(&self, source: &str) -> Result<()> {
        self.store.remove(source).await?;
        Ok(())
    }

    /// Drop the local record so the next resolve opens a fresh session
    pub async fn abandon(&self, source: &str) -> Result<bool> {
        self.store.remove(source).await
    }

    /// Cancel the session on the remote, then drop the local record.
    ///
    /// A remote that no longer knows the session is not an error.
    pub async fn abandon_remote(&self, source: &str) -> Result<bool> {
        let Some(session) = self.store.load(source).await? else {
            return Ok(false);
        };

        let transport = &self.transport;
        let url = session.upload_url.as_str();
        let reply = self
            .retry
            .execute("delete_session", move || transport.delete_session(url))
            .await?;
        match reply.status.as_u16() {
            s if (200..300).contains(&s) || s == 404 || s == 410 => {}
            _ => return Err(reply.into_error()),
        }

        self.store.remove(source).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Call, FakeDrive, Injected, MemorySource};

    fn manager(drive: Arc<FakeDrive>, dir: &Path, conflict: ConflictBehavior) -> SessionManager {
        SessionManager::new(drive, SessionStore::new(dir), RetryPolicy::none(), conflict)
    }

    fn target(identity: &str, destination: &str) -> UploadTarget {
        UploadTarget::new(MemorySource::new(identity, vec![7u8; 16]), destination)
    }

    #[tokio::test]
    async fn test_create_persists_before_returning() {
        let dir = tempfile::tempdir().unwrap();
        let drive = Arc::new(FakeDrive::new());
        let manager = manager(drive.clone(), dir.path(), ConflictBehavior::Replace);
        let target = target("/data/a.pdf", "Docs/Q1 2024/a.pdf");

        let resolved = manager.resolve(&target).await.unwrap();
        assert_eq!(resolved.origin, SessionOrigin::Created);
        assert_eq!(resolved.session.destination, "Docs/Q1%202024/a.pdf");
        assert!(resolved.session.expires_at.is_some());

        let stored = manager.store().load("/data/a.pdf").await.unwrap().unwrap();
        assert_eq!(stored, resolved.session);
        assert_eq!(
            drive.calls()[0],
            Call::Create {
                destination: "Docs/Q1%202024/a.pdf".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_resolve_resumes_bound_record() {
        let dir = tempfile::tempdir().unwrap();
        let drive = Arc::new(FakeDrive::new());
        let manager = manager(drive.clone(), dir.path(), ConflictBehavior::Replace);
        let target = target("/data/a.pdf", "Docs/a.pdf");

        let first = manager.resolve(&target).await.unwrap();
        let second = manager.resolve(&target).await.unwrap();

        assert_eq!(second.origin, SessionOrigin::Resumed);
        assert_eq!(second.session.upload_url, first.session.upload_url);
        assert_eq!(drive.creates(), 1);
    }

    #[tokio::test]
    async fn test_record_for_other_destination_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let drive = Arc::new(FakeDrive::new());
        let manager = manager(drive.clone(), dir.path(), ConflictBehavior::Replace);

        let first = manager.resolve(&target("/data/a.pdf", "Old/a.pdf")).await.unwrap();
        let second = manager.resolve(&target("/data/a.pdf", "New/a.pdf")).await.unwrap();

        assert_eq!(second.origin, SessionOrigin::Created);
        assert_ne!(second.session.upload_url, first.session.upload_url);
        assert_eq!(drive.creates(), 2);
    }

    #[tokio::test]
    async fn test_record_for_resized_source_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let drive = Arc::new(FakeDrive::new());
        let manager = manager(drive.clone(), dir.path(), ConflictBehavior::Replace);
        let before = UploadTarget::new(MemorySource::new("/src/f", vec![1u8; 10]), "Docs/f");
        let after = UploadTarget::new(MemorySource::new("/src/f", vec![2u8; 20]), "Docs/f");

        let first = manager.resolve(&before).await.unwrap();
        assert_eq!(first.session.size, 10);
        let second = manager.resolve(&after).await.unwrap();

        assert_eq!(second.origin, SessionOrigin::Created);
        assert_ne!(second.session.upload_url, first.session.upload_url);
        assert_eq!(second.session.size, 20);
    }

    #[test]
    fn test_record_without_size_loads() {
        let json = r#"{"upload_url":"https://up/1","source":"/src/a","destination":"a","created_at":"2024-01-01T00:00:00Z"}"#;
        let session: UploadSession = serde_json::from_str(json).unwrap();
        assert_eq!(session.size, 0);
        assert!(!session.is_bound_to("/src/a", "a", 5));
    }

    #[tokio::test]
    async fn test_expired_record_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let drive = Arc::new(FakeDrive::new());
        let manager = manager(drive.clone(), dir.path(), ConflictBehavior::Replace);
        let stale = UploadSession {
            upload_url: "https://fake.drive/upload/old".to_string(),
            source: "/data/a.pdf".to_string(),
            destination: "Docs/a.pdf".to_string(),
            size: 16,
            created_at: Utc::now() - chrono::Duration::days(3),
            expires_at: Some(Utc::now() - chrono::Duration::days(1)),
        };
        manager.store().save(&stale).await.unwrap();

        let resolved = manager.resolve(&target("/data/a.pdf", "Docs/a.pdf")).await.unwrap();
        assert_eq!(resolved.origin, SessionOrigin::Created);
    }

    #[tokio::test]
    async fn test_create_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let drive = Arc::new(FakeDrive::new());
        drive.inject_create(Injected::status(409));
        let manager = manager(drive, dir.path(), ConflictBehavior::Fail);

        let err = manager.resolve(&target("/data/a.pdf", "Docs/a.pdf")).await.unwrap_err();
        assert!(matches!(err, Error::Conflict { status: 409, .. }));
        assert!(manager.store().list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_server_error_is_session_create() {
        let dir = tempfile::tempdir().unwrap();
        let drive = Arc::new(FakeDrive::new());
        drive.inject_create(Injected::status(400));
        let manager = manager(drive, dir.path(), ConflictBehavior::Replace);

        let err = manager.create(&target("/data/a.pdf", "Docs/a.pdf")).await.unwrap_err();
        assert!(matches!(err, Error::SessionCreate { status: Some(400), .. }));
    }

    #[tokio::test]
    async fn test_create_unauthorized() {
        let dir = tempfile::tempdir().unwrap();
        let drive = Arc::new(FakeDrive::new());
        drive.inject_create(Injected::status(401));
        let manager = manager(drive, dir.path(), ConflictBehavior::Replace);

        let err = manager.create(&target("/data/a.pdf", "Docs/a.pdf")).await.unwrap_err();
        assert!(matches!(err, Error::Authentication(_)));
    }

    #[tokio::test]
    async fn test_abandon_remote_deletes_session_and_record() {
        let dir = tempfile::tempdir().unwrap();
        let drive = Arc::new(FakeDrive::new());
        let manager = manager(drive.clone(), dir.path(), ConflictBehavior::Replace);
        let resolved = manager.resolve(&target("/data/a.pdf", "Docs/a.pdf")).await.unwrap();

        assert!(manager.abandon_remote("/data/a.pdf").await.unwrap());
        assert!(drive.calls().contains(&Call::Delete {
            url: resolved.session.upload_url
        }));
        assert!(manager.store().load("/data/a.pdf").await.unwrap().is_none());
        assert!(!manager.abandon_remote("/data/a.pdf").await.unwrap());
    }

    #[tokio::test]
    async fn test_store_list_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("sessions"));
        assert!(store.list().await.unwrap().is_empty());

        for name in ["a", "b", "c"] {
            store
                .save(&UploadSession {
                    upload_url: format!("https://up/{}", name),
                    source: format!("/src/{}", name),
                    destination: format!("dst/{}", name),
                    size: 1,
                    created_at: Utc::now(),
                    expires_at: None,
                })
                .await
                .unwrap();
        }
        assert_eq!(store.list().await.unwrap().len(), 3);
        assert_eq!(store.clear().await.unwrap(), 3);
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_record_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        std::fs::write(store.record_path("/src/a"), b"{not json").unwrap();

        assert!(store.load("/src/a").await.unwrap().is_none());
        assert!(!store.record_path("/src/a").exists());
    }

    #[test]
    fn test_key_is_sha256_hex() {
        let key = SessionStore::key("/data/a.pdf");
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(key, SessionStore::key("/data/b.pdf"));
    }
}
