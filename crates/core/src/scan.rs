//! Folder scanner feeding the worker pool
//!
//! The directory walk is blocking, so it runs on a blocking thread and hands
//! targets over a bounded channel. The final tally arrives on a oneshot once
//! the walk is over.

use crate::source::{ByteSource, FileSource, UploadTarget};
use futures::Stream;
use std::path::{Path, PathBuf};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Folder name format inserted below the destination root
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Targets buffered between the walker and the pool
const CHANNEL_CAPACITY: usize = 256;

/// Tally of a finished scan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanSummary {
    /// Files handed to the consumer
    pub files: usize,
    pub bytes: u64,
    pub skipped_empty: usize,
    pub skipped_unreadable: usize,
}

/// A running scan
pub struct FolderScan {
    pub targets: mpsc::Receiver<UploadTarget>,
    pub summary: oneshot::Receiver<ScanSummary>,
}

impl FolderScan {
    /// Split into a target stream and the summary receiver
    pub fn into_parts(
        self,
    ) -> (
        impl Stream<Item = UploadTarget> + Send,
        oneshot::Receiver<ScanSummary>,
    ) {
        let stream = futures::stream::unfold(self.targets, |mut rx| async move {
            rx.recv().await.map(|target| (target, rx))
        });
        (stream, self.summary)
    }
}

/// Timestamp folder name for a run started now
pub fn run_timestamp() -> String {
    chrono::Local::now().format(TIMESTAMP_FORMAT).to_string()
}

/// `<root>/<timestamp>/<relative>` with forward slashes
pub fn destination_for(destination_root: &str, timestamp: Option<&str>, relative: &Path) -> String {
    let relative = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");

    [destination_root.trim_matches('/'), timestamp.unwrap_or(""), relative.as_str()]
        .into_iter()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Start walking `root`; must be called inside a Tokio runtime
pub fn scan_folder(root: impl Into<PathBuf>, destination_root: impl Into<String>, timestamp: Option<String>) -> FolderScan {
    let root = root.into();
    let destination_root = destination_root.into();
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (summary_tx, summary_rx) = oneshot::channel();

    tokio::task::spawn_blocking(move || {
        let summary = walk(&root, &destination_root, timestamp.as_deref(), &tx);
        // the consumer may have stopped listening
        let _ = summary_tx.send(summary);
    });

    FolderScan {
        targets: rx,
        summary: summary_rx,
    }
}

fn walk(
    root: &Path,
    destination_root: &str,
    timestamp: Option<&str>,
    tx: &mpsc::Sender<UploadTarget>,
) -> ScanSummary {
    let mut summary = ScanSummary::default();

    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "Skipping unreadable entry");
                summary.skipped_unreadable += 1;
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let source = match FileSource::open_blocking(entry.path()) {
            Ok(source) => source,
            Err(e) => {
                warn!(path = %entry.path().display(), error = %e, "Skipping unreadable file");
                summary.skipped_unreadable += 1;
                continue;
            }
        };
        if source.len() == 0 {
            debug!(path = %entry.path().display(), "Skipping empty file");
            summary.skipped_empty += 1;
            continue;
        }

        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let destination = destination_for(destination_root, timestamp, relative);
        let len = source.len();

        if tx.blocking_send(UploadTarget::new(source, destination)).is_err() {
            debug!("Target receiver dropped, stopping scan");
            break;
        }
        summary.files += 1;
        summary.bytes += len;
    }

    summary
}
