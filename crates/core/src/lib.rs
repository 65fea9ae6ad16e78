//! spmigrate-core - Core library for the spmigrate CLI
//!
//! This library provides resumable chunked uploads to Microsoft Graph drives
//! (SharePoint document libraries and OneDrive), including token caching,
//! upload session persistence, retry/backoff and a bounded worker pool.

pub mod auth;
pub mod config;
pub mod engine;
pub mod error;
pub mod path;
pub mod pool;
pub mod retry;
pub mod scan;
pub mod session;
pub mod source;
pub mod transport;
pub mod uploader;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use auth::{ClientCredentials, Credential, TokenCache, TokenExchange, TokenGrant};
pub use config::{config_exists, get_config_path, load_config, load_config_from, save_config, save_config_to, validate_config};
pub use config::{AdvancedConfig, Config, ConfigFile, GraphConfig, LoggingConfig, UploadConfig};
pub use engine::{ChunkEngine, ProgressFn, TransferCursor};
pub use error::{Error, FailureKind, Result};
pub use pool::{Observer, PoolOptions, RunStatistics, TargetOutcome, TargetReport, WorkerPool};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use scan::{scan_folder, FolderScan, ScanSummary};
pub use session::{ResolvedSession, SessionManager, SessionOrigin, SessionStore, UploadSession};
pub use source::{ByteSource, FileSource, UploadTarget};
pub use transport::{build_http_client, ConflictBehavior, DriveAddressing, GraphTransport, UploadTransport};
pub use uploader::{FileUploader, UploadOptions, Uploader};
