//! Chunk transfer loop
//!
//! Streams a source into an open upload session, one fixed-size chunk at a
//! time, and interprets what the remote acknowledges. The server's view of
//! the next expected byte is authoritative whenever it offers one.

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use crate::session::{SessionOrigin, UploadSession};
use crate::source::UploadTarget;
use crate::transport::{ChunkRange, HttpReply, UploadTransport};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default fragment size (5 MiB, a multiple of 320 KiB)
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// Progress callback: acknowledged bytes, total bytes
pub type ProgressFn<'a> = dyn Fn(u64, u64) + Send + Sync + 'a;

/// Position of the next unacknowledged byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferCursor {
    offset: u64,
    total: u64,
}

impl TransferCursor {
    pub fn new(total: u64) -> Self {
        Self { offset: 0, total }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn remaining(&self) -> u64 {
        self.total - self.offset
    }

    pub fn is_complete(&self) -> bool {
        self.offset >= self.total
    }

    /// Move forward by `n` bytes, never past the end
    pub fn advance(&mut self, n: u64) {
        self.offset = (self.offset + n).min(self.total);
    }

    /// Adopt a server-reported offset if it lies ahead of ours
    pub fn adopt(&mut self, server_offset: u64) -> bool {
        let next = server_offset.min(self.total);
        if next > self.offset {
            self.offset = next;
            true
        } else {
            false
        }
    }
}

/// Drives chunk writes for one session at a time
pub struct ChunkEngine {
    transport: Arc<dyn UploadTransport>,
    retry: RetryPolicy,
    chunk_size: u64,
    max_rate_limit_pauses: u32,
}

impl ChunkEngine {
    pub fn new(transport: Arc<dyn UploadTransport>, retry: RetryPolicy, chunk_size: u64) -> Self {
        Self {
            transport,
            retry,
            chunk_size: chunk_size.max(1),
            max_rate_limit_pauses: 8,
        }
    }

    pub fn with_max_rate_limit_pauses(mut self, pauses: u32) -> Self {
        self.max_rate_limit_pauses = pauses;
        self
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Transfer `target` into `session`; returns the remote path on completion.
    ///
    /// Cancellation is honoured before each chunk request. A write already
    /// on the wire is allowed to finish.
    pub async fn transfer(
        &self,
        session: &UploadSession,
        origin: SessionOrigin,
        target: &UploadTarget,
        cancel: &CancellationToken,
        progress: Option<&ProgressFn<'_>>,
    ) -> Result<String> {
        let total = target.len();
        let mut cursor = TransferCursor::new(total);
        let report = |cursor: &TransferCursor| {
            if let Some(progress) = progress {
                progress(cursor.offset(), cursor.total());
            }
        };

        if origin == SessionOrigin::Resumed {
            let server_offset = self.query_offset(&session.upload_url).await?;
            cursor.adopt(server_offset);
            info!(
                destination = %session.destination,
                offset = cursor.offset(),
                total,
                "Resuming transfer"
            );
            report(&cursor);
        }

        let mut buf = vec![0u8; self.chunk_size.min(total) as usize];
        let mut rate_limit_pauses = 0u32;

        while !cursor.is_complete() {
            if cancel.is_cancelled() {
                info!(destination = %session.destination, offset = cursor.offset(), "Transfer cancelled");
                return Err(Error::Cancelled);
            }

            let want = self.chunk_size.min(cursor.remaining()) as usize;
            let read = target
                .source
                .read_at(cursor.offset(), &mut buf[..want])
                .await?;
            if read == 0 {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!(
                        "source ended at {} of {} bytes: {}",
                        cursor.offset(),
                        total,
                        target.identity()
                    ),
                )));
            }

            let range = ChunkRange::new(cursor.offset(), read as u64, total);
            debug!(
                destination = %session.destination,
                range = %range.content_range(),
                "Sending chunk"
            );
            let reply = self.put(&session.upload_url, range, &buf[..read]).await?;

            match reply.status.as_u16() {
                200 | 201 => {
                    cursor.advance(cursor.remaining());
                    report(&cursor);
                    info!(destination = %session.destination, total, "Upload complete");
                    return Ok(session.destination.clone());
                }
                202 | 204 | 308 => {
                    match reply.next_expected_offset() {
                        Some(next) if next > range.start => {
                            cursor.adopt(next);
                        }
                        _ => cursor.advance(range.len()),
                    }
                    rate_limit_pauses = 0;
                    report(&cursor);
                }
                429 => {
                    rate_limit_pauses += 1;
                    if rate_limit_pauses > self.max_rate_limit_pauses {
                        return Err(reply.into_error());
                    }
                    let delay = self.retry.delay_for(rate_limit_pauses - 1, reply.retry_after);
                    warn!(
                        destination = %session.destination,
                        range = %range.content_range(),
                        pause = rate_limit_pauses,
                        delay_ms = delay.as_millis() as u64,
                        "Rate limited, resending the same range"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                    }
                }
                416 => {
                    let server_offset = self.query_offset(&session.upload_url).await?;
                    if !cursor.adopt(server_offset) {
                        return Err(reply.into_error());
                    }
                    warn!(
                        destination = %session.destination,
                        offset = cursor.offset(),
                        "Range rejected, continuing from server offset"
                    );
                    report(&cursor);
                }
                // session dropped by the remote mid-transfer
                404 | 410 => return Err(Error::SessionExpired),
                _ => return Err(reply.into_error()),
            }
        }

        // Every byte was sent but no reply confirmed the file
        match self.query_offset(&session.upload_url).await {
            Ok(offset) if offset >= total => {
                info!(destination = %session.destination, total, "Upload confirmed by status query");
                Ok(session.destination.clone())
            }
            Ok(offset) => Err(Error::IncompleteTransfer { offset, total }),
            Err(Error::SessionExpired) => Err(Error::IncompleteTransfer {
                offset: cursor.offset(),
                total,
            }),
            Err(e) => Err(e),
        }
    }

    async fn put(&self, upload_url: &str, range: ChunkRange, data: &[u8]) -> Result<HttpReply> {
        let transport = &self.transport;
        self.retry
            .execute("put_chunk", move || transport.put_chunk(upload_url, range, data))
            .await
    }

    /// Next offset the server expects; 0 when it does not say
    async fn query_offset(&self, upload_url: &str) -> Result<u64> {
        let transport = &self.transport;
        let reply = self
            .retry
            .execute("query_session", move || transport.query_session(upload_url))
            .await?;

        match reply.status.as_u16() {
            404 | 410 => Err(Error::SessionExpired),
            _ if reply.status.is_success() => Ok(reply.next_expected_offset().unwrap_or(0)),
            _ => Err(reply.into_error()),
        }
    }
}
