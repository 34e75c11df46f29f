//! Bounded capture of the interpreter's stdout and stderr

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

const CHUNK_SIZE: usize = 8 * 1024;

/// Byte budget shared by both output streams
///
/// Readers claim bytes before buffering them, so the two captures together
/// never hold more than `limit` bytes.
#[derive(Debug)]
pub struct OutputBudget {
    limit: usize,
    used: AtomicUsize,
    exceeded: AtomicBool,
    notify: Notify,
}

impl OutputBudget {
    #[must_use]
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            limit,
            used: AtomicUsize::new(0),
            exceeded: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    /// Claim `len` bytes and return how many of them may be kept
    pub fn claim(&self, len: usize) -> usize {
        let before = self.used.fetch_add(len, Ordering::SeqCst);
        let granted = self.limit.saturating_sub(before).min(len);
        if granted < len {
            self.exceeded.store(true, Ordering::SeqCst);
            self.notify.notify_one();
        }
        granted
    }

    #[must_use]
    pub fn is_exceeded(&self) -> bool {
        self.exceeded.load(Ordering::SeqCst)
    }

    /// Resolves once some reader has been refused bytes
    pub async fn exceeded(&self) {
        if self.is_exceeded() {
            return;
        }
        self.notify.notified().await;
    }
}

/// One stream being drained into memory by a background task
#[derive(Debug)]
pub struct Capture {
    buffer: Arc<Mutex<Vec<u8>>>,
    task: JoinHandle<()>,
}

impl Capture {
    /// Start reading `reader` until EOF or until the budget runs out
    pub fn spawn<R>(reader: R, budget: Arc<OutputBudget>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let task = tokio::spawn(read_into(reader, Arc::clone(&buffer), budget));
        Self { buffer, task }
    }

    /// Wait up to `timeout` for the reader to finish, then take the bytes
    ///
    /// A reader still blocked after `timeout` (a grandchild holding the pipe
    /// open, say) is aborted and whatever it collected so far is returned.
    pub async fn finish(mut self, timeout: Duration) -> Vec<u8> {
        if tokio::time::timeout(timeout, &mut self.task).await.is_err() {
            tracing::debug!("output reader did not reach EOF, aborting it");
            self.task.abort();
        }
        std::mem::take(&mut *self.buffer.lock())
    }
}

async fn read_into<R>(mut reader: R, buffer: Arc<Mutex<Vec<u8>>>, budget: Arc<OutputBudget>)
where
    R: AsyncRead + Unpin,
{
    let mut chunk = vec![0u8; CHUNK_SIZE];
    loop {
        let read = match reader.read(&mut chunk).await {
            Ok(0) => return,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(error = %e, "output read failed");
                return;
            }
        };
        let keep = budget.claim(read);
        buffer.lock().extend_from_slice(&chunk[..keep]);
        if keep < read {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_grants_up_to_limit() {
        let budget = OutputBudget::new(10);
        assert_eq!(budget.claim(4), 4);
        assert_eq!(budget.claim(6), 6);
        assert!(!budget.is_exceeded());
        assert_eq!(budget.claim(1), 0);
        assert!(budget.is_exceeded());
    }

    #[test]
    fn partial_grant_marks_exceeded() {
        let budget = OutputBudget::new(5);
        assert_eq!(budget.claim(8), 5);
        assert!(budget.is_exceeded());
    }

    #[tokio::test]
    async fn capture_reads_to_eof() {
        let budget = OutputBudget::new(1024);
        let capture = Capture::spawn(&b"hello world"[..], Arc::clone(&budget));
        let bytes = capture.finish(Duration::from_secs(1)).await;
        assert_eq!(bytes, b"hello world");
        assert!(!budget.is_exceeded());
    }

    #[tokio::test]
    async fn streams_share_one_budget() {
        let budget = OutputBudget::new(6);
        let out = Capture::spawn(&b"aaaa"[..], Arc::clone(&budget))
            .finish(Duration::from_secs(1))
            .await;
        let err = Capture::spawn(&b"bbbb"[..], Arc::clone(&budget))
            .finish(Duration::from_secs(1))
            .await;
        assert_eq!(out.len() + err.len(), 6);
        assert_eq!(err, b"bb");
        budget.exceeded().await;
    }

    #[tokio::test]
    async fn stuck_reader_is_abandoned() {
        let (_writer, reader) = tokio::io::duplex(64);
        let capture = Capture::spawn(reader, OutputBudget::new(64));
        let bytes = capture.finish(Duration::from_millis(20)).await;
        assert!(bytes.is_empty());
    }
}
