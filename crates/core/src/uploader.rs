//! Per-target upload orchestration

use crate::config::ConfigFile;
use crate::engine::{ChunkEngine, ProgressFn};
use crate::error::{Error, FailureKind, Result};
use crate::retry::RetryPolicy;
use crate::session::{SessionManager, SessionOrigin, SessionStore};
use crate::source::UploadTarget;
use crate::transport::{ConflictBehavior, UploadTransport};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Uploads one target to completion or a classified error
#[async_trait]
pub trait FileUploader: Send + Sync {
    /// Returns the normalized remote path
    async fn upload(&self, target: &UploadTarget, cancel: &CancellationToken) -> Result<String>;
}

/// Knobs for [`Uploader`]
#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub chunk_size: u64,
    pub conflict: ConflictBehavior,
    pub retry: RetryPolicy,
    pub max_rate_limit_pauses: u32,
}

impl UploadOptions {
    pub fn from_config(config: &ConfigFile) -> Self {
        Self {
            chunk_size: config.chunk_size(),
            conflict: config.upload.conflict_behavior,
            retry: config.retry_policy(),
            max_rate_limit_pauses: config.upload.max_rate_limit_pauses,
        }
    }
}

/// Resolves a session and runs the chunk engine for each target
pub struct Uploader {
    sessions: SessionManager,
    engine: ChunkEngine,
}

impl Uploader {
    pub fn new(transport: Arc<dyn UploadTransport>, store: SessionStore, options: UploadOptions) -> Self {
        let sessions = SessionManager::new(
            transport.clone(),
            store,
            options.retry.clone(),
            options.conflict,
        );
        let engine = ChunkEngine::new(transport, options.retry, options.chunk_size)
            .with_max_rate_limit_pauses(options.max_rate_limit_pauses);
        Self { sessions, engine }
    }

    pub fn from_config(config: &ConfigFile, transport: Arc<dyn UploadTransport>) -> Result<Self> {
        let store = SessionStore::new(config.state_dir()?);
        Ok(Self::new(transport, store, UploadOptions::from_config(config)))
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Upload `target`, reporting acknowledged bytes to `progress`.
    ///
    /// An expired session is replaced by a fresh one exactly once. A resumed
    /// session that fails permanently is forgotten so the next run starts over.
    pub async fn upload_with_progress(
        &self,
        target: &UploadTarget,
        cancel: &CancellationToken,
        progress: Option<&ProgressFn<'_>>,
    ) -> Result<String> {
        if target.is_empty() {
            return Err(Error::EmptySource(target.identity().to_string()));
        }

        let resolved = self.sessions.resolve(target).await?;
        let outcome = self
            .engine
            .transfer(&resolved.session, resolved.origin, target, cancel, progress)
            .await;

        let remote_path = match outcome {
            Err(e)
                if resolved.origin == SessionOrigin::Resumed
                    && e.kind() == FailureKind::Fatal
                    && !matches!(e, Error::SessionExpired | Error::Cancelled | Error::Authentication(_)) =>
            {
                warn!(
                    source = target.identity(),
                    error = %e,
                    "Resumed session failed permanently, discarding its record"
                );
                self.sessions.abandon(target.identity()).await?;
                return Err(e);
            }
            Err(Error::SessionExpired) => {
                warn!(
                    source = target.identity(),
                    "Upload session expired, starting a fresh one"
                );
                self.sessions.abandon(target.identity()).await?;
                let fresh = self.sessions.create(target).await?;
                self.engine
                    .transfer(&fresh, SessionOrigin::Created, target, cancel, progress)
                    .await?
            }
            other => other?,
        };

        self.sessions.complete(target.identity()).await?;
        info!(source = target.identity(), remote = %remote_path, bytes = target.len(), "File uploaded");
        Ok(remote_path)
    }
}

#[async_trait]
impl FileUploader for Uploader {
    async fn upload(&self, target: &UploadTarget, cancel: &CancellationToken) -> Result<String> {
        self.upload_with_progress(target, cancel, None).await
    }
}
