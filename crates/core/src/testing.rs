//! In-memory drive used by the upload tests

use crate::error::{Error, Result};
use crate::source::ByteSource;
use crate::transport::{ChunkRange, ConflictBehavior, HttpReply, UploadTransport};
use async_trait::async_trait;
use http::StatusCode;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// In-memory source for generated payloads
#[derive(Debug, Clone)]
pub struct MemorySource {
    identity: String,
    data: Arc<Vec<u8>>,
}

impl MemorySource {
    pub fn new(identity: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            identity: identity.into(),
            data: Arc::new(data),
        }
    }
}

#[async_trait]
impl ByteSource for MemorySource {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn identity(&self) -> &str {
        &self.identity
    }

    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let start = usize::try_from(offset)
            .map_err(|_| Error::InvalidInput(format!("offset {} out of range", offset)))?
            .min(self.data.len());
        let n = buf.len().min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        Ok(n)
    }
}

/// Source that never returns more than `cap` bytes per read, like a pipe
/// or a network filesystem handing out partial reads
#[derive(Debug, Clone)]
pub struct CappedSource {
    inner: MemorySource,
    cap: usize,
}

impl CappedSource {
    pub fn new(inner: MemorySource, cap: usize) -> Self {
        Self { inner, cap: cap.max(1) }
    }
}

#[async_trait]
impl ByteSource for CappedSource {
    fn len(&self) -> u64 {
        self.inner.len()
    }

    fn identity(&self) -> &str {
        self.inner.identity()
    }

    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let n = buf.len().min(self.cap);
        self.inner.read_at(offset, &mut buf[..n]).await
    }
}

/// A request as seen by the fake drive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Create { destination: String },
    Put { url: String, range: ChunkRange },
    Query { url: String },
    Delete { url: String },
}

/// Canned answer that replaces the drive's own behaviour for one request
#[derive(Debug, Clone)]
pub enum Injected {
    Reply {
        status: StatusCode,
        body: String,
        retry_after: Option<Duration>,
    },
    NetworkError,
}

impl Injected {
    pub fn status(status: u16) -> Self {
        Injected::Reply {
            status: StatusCode::from_u16(status).unwrap(),
            body: String::new(),
            retry_after: None,
        }
    }

    fn into_result(self) -> Result<HttpReply> {
        match self {
            Injected::Reply {
                status,
                body,
                retry_after,
            } => {
                let mut reply = HttpReply::new(status, body);
                reply.retry_after = retry_after;
                Ok(reply)
            }
            Injected::NetworkError => Err(Error::Network("connection reset by fake".to_string())),
        }
    }
}

#[derive(Debug, Default)]
struct FakeSession {
    destination: String,
    received: Vec<u8>,
    expired: bool,
}

#[derive(Default)]
struct DriveState {
    sessions: HashMap<String, FakeSession>,
    files: HashMap<String, Vec<u8>>,
    calls: Vec<Call>,
    next_id: u32,
    create_faults: VecDeque<Injected>,
    put_faults: VecDeque<Injected>,
    query_faults: VecDeque<Injected>,
    /// Answer 202 instead of 201 for the final chunk
    withhold_completion: bool,
    /// Number of chunk writes accepted before every further one fails
    fail_puts_after: Option<usize>,
    puts_accepted: usize,
}

/// Fake upload endpoint that reassembles uploaded bytes
#[derive(Default)]
pub struct FakeDrive {
    state: Mutex<DriveState>,
}

impl FakeDrive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inject_create(&self, fault: Injected) {
        self.state.lock().unwrap().create_faults.push_back(fault);
    }

    pub fn inject_put(&self, fault: Injected) {
        self.state.lock().unwrap().put_faults.push_back(fault);
    }

    pub fn inject_query(&self, fault: Injected) {
        self.state.lock().unwrap().query_faults.push_back(fault);
    }

    pub fn withhold_completion(&self) {
        self.state.lock().unwrap().withhold_completion = true;
    }

    /// Accept `n` more chunk writes, then fail every further write with 500
    pub fn fail_puts_after(&self, n: usize) {
        let mut state = self.state.lock().unwrap();
        state.fail_puts_after = Some(state.puts_accepted + n);
    }

    pub fn heal(&self) {
        self.state.lock().unwrap().fail_puts_after = None;
    }

    /// Forget every open session, as the remote does when one expires
    pub fn expire_sessions(&self) {
        for session in self.state.lock().unwrap().sessions.values_mut() {
            session.expired = true;
        }
    }

    /// Bytes the remote holds for a session without the client having sent them
    pub fn preload(&self, url: &str, bytes: &[u8]) {
        let mut state = self.state.lock().unwrap();
        if let Some(session) = state.sessions.get_mut(url) {
            session.received.extend_from_slice(bytes);
        }
    }

    pub fn file(&self, destination: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().files.get(destination).cloned()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn puts(&self) -> Vec<ChunkRange> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Put { range, .. } => Some(range),
                _ => None,
            })
            .collect()
    }

    pub fn creates(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Create { .. }))
            .count()
    }

    pub fn received(&self, url: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .sessions
            .get(url)
            .map(|s| s.received.len())
            .unwrap_or(0)
    }
}

fn ranges_body(next: usize) -> String {
    format!(r#"{{"nextExpectedRanges":["{}-"]}}"#, next)
}

#[async_trait]
impl UploadTransport for FakeDrive {
    async fn create_session(&self, destination: &str, conflict: ConflictBehavior) -> Result<HttpReply> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Create {
            destination: destination.to_string(),
        });
        if let Some(fault) = state.create_faults.pop_front() {
            return fault.into_result();
        }
        if conflict == ConflictBehavior::Fail && state.files.contains_key(destination) {
            return Ok(HttpReply::new(StatusCode::CONFLICT, r#"{"error":{"code":"nameAlreadyExists"}}"#));
        }

        state.next_id += 1;
        let url = format!("https://fake.drive/upload/{}", state.next_id);
        state.sessions.insert(
            url.clone(),
            FakeSession {
                destination: destination.to_string(),
                ..FakeSession::default()
            },
        );
        Ok(HttpReply::new(
            StatusCode::OK,
            format!(
                r#"{{"uploadUrl":"{}","expirationDateTime":"2099-01-01T00:00:00Z","nextExpectedRanges":["0-"]}}"#,
                url
            ),
        ))
    }

    async fn put_chunk(&self, upload_url: &str, range: ChunkRange, data: &[u8]) -> Result<HttpReply> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Put {
            url: upload_url.to_string(),
            range,
        });
        if let Some(fault) = state.put_faults.pop_front() {
            return fault.into_result();
        }
        if state.fail_puts_after.is_some_and(|limit| state.puts_accepted >= limit) {
            return Ok(HttpReply::new(StatusCode::INTERNAL_SERVER_ERROR, "injected outage"));
        }
        assert_eq!(range.len() as usize, data.len(), "Content-Length mismatch");

        let withhold = state.withhold_completion;
        let Some(session) = state.sessions.get_mut(upload_url).filter(|s| !s.expired) else {
            return Ok(HttpReply::new(StatusCode::NOT_FOUND, "itemNotFound"));
        };
        if range.start as usize != session.received.len() {
            return Ok(HttpReply::new(
                StatusCode::RANGE_NOT_SATISFIABLE,
                ranges_body(session.received.len()),
            ));
        }
        session.received.extend_from_slice(data);
        let received = session.received.len();

        if received as u64 == range.total {
            let destination = session.destination.clone();
            let bytes = session.received.clone();
            state.puts_accepted += 1;
            state.files.insert(destination, bytes);
            if withhold {
                return Ok(HttpReply::new(StatusCode::ACCEPTED, ""));
            }
            return Ok(HttpReply::new(StatusCode::CREATED, r#"{"id":"item"}"#));
        }
        state.puts_accepted += 1;
        Ok(HttpReply::new(StatusCode::ACCEPTED, ranges_body(received)))
    }

    async fn query_session(&self, upload_url: &str) -> Result<HttpReply> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Query {
            url: upload_url.to_string(),
        });
        if let Some(fault) = state.query_faults.pop_front() {
            return fault.into_result();
        }
        match state.sessions.get(upload_url).filter(|s| !s.expired) {
            Some(session) => Ok(HttpReply::new(StatusCode::OK, ranges_body(session.received.len()))),
            None => Ok(HttpReply::new(StatusCode::NOT_FOUND, "itemNotFound")),
        }
    }

    async fn delete_session(&self, upload_url: &str) -> Result<HttpReply> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Delete {
            url: upload_url.to_string(),
        });
        match state.sessions.remove(upload_url) {
            Some(_) => Ok(HttpReply::new(StatusCode::NO_CONTENT, "")),
            None => Ok(HttpReply::new(StatusCode::NOT_FOUND, "")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_source_past_end() {
        let source = MemorySource::new("mem", vec![1, 2, 3]);
        let mut buf = [0u8; 8];
        assert_eq!(source.read_at(1, &mut buf).await.unwrap(), 2);
        assert_eq!(source.read_at(3, &mut buf).await.unwrap(), 0);
        assert_eq!(source.read_at(100, &mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_capped_source_reads_short() {
        let source = CappedSource::new(MemorySource::new("mem", vec![9u8; 10]), 3);
        let mut buf = [0u8; 8];
        assert_eq!(source.read_at(0, &mut buf).await.unwrap(), 3);
        assert_eq!(source.read_at(9, &mut buf).await.unwrap(), 1);
    }
}
