//! Live build log distribution.
//!
//! [`LogBus`] is the single path by which a build writes to its ledger:
//! [`emit`](LogBus::emit) appends the line to the [`BuildStore`] (which
//! assigns the line number) and only then publishes it to live subscribers
//! of that build.
//!
//! [`subscribe`](LogBus::subscribe) replays the persisted backlog first, then
//! forwards live lines. A terminal `status` line (or a build that is already
//! terminal) ends the stream with [`StreamMessage::Complete`].

use anyhow::{anyhow, Result};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::models::{BuildStatus, LogKind, LogLine};
use crate::store::BuildStore;

/// How long a subscriber to a finished build waits for its closing status
/// line when finalization was observed before the line was written.
const FINAL_STATUS_GRACE: Duration = Duration::from_secs(2);

/// Outbound buffer per subscriber.
const SUBSCRIBER_BUFFER: usize = 256;

/// One message on a build's live stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamMessage {
    Line(LogLine),
    Complete { build_id: i64 },
}

impl StreamMessage {
    /// Wire shape: `{buildId, lineNumber, type, data, timestamp}` for lines,
    /// `{type: "complete", buildId}` for the end of stream.
    pub fn to_json(&self) -> Value {
        match self {
            StreamMessage::Line(line) => json!({
                "buildId": line.build_id,
                "lineNumber": line.line_number,
                "type": line.kind.as_str(),
                "data": line.content,
                "timestamp": line.created_at.to_rfc3339(),
            }),
            StreamMessage::Complete { build_id } => json!({
                "type": "complete",
                "buildId": build_id,
            }),
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, StreamMessage::Complete { .. })
    }
}

type Registry = HashMap<i64, HashMap<u64, mpsc::UnboundedSender<LogLine>>>;

/// Registry of live subscribers keyed by build id, in front of the store.
pub struct LogBus {
    store: Arc<dyn BuildStore>,
    subscribers: Mutex<Registry>,
    next_subscriber: AtomicU64,
    /// Per-build lock held across append + publish so live order equals
    /// line order. Builds never wait on each other.
    emit_locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl LogBus {
    pub fn new(store: Arc<dyn BuildStore>) -> Self {
        Self {
            store,
            subscribers: Mutex::new(HashMap::new()),
            next_subscriber: AtomicU64::new(1),
            emit_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn BuildStore> {
        &self.store
    }

    fn registry(&self) -> Result<std::sync::MutexGuard<'_, Registry>> {
        self.subscribers
            .lock()
            .map_err(|_| anyhow!("log bus registry lock poisoned"))
    }

    /// Persist one line, then publish it to the build's subscribers.
    pub async fn emit(&self, build_id: i64, kind: LogKind, content: &str) -> Result<LogLine> {
        let lock = self.emit_lock(build_id)?;
        let _guard = lock.lock().await;
        let line = self.store.append_log_line(build_id, kind, content).await?;
        self.publish(&line)?;
        if line.is_terminal_status() {
            self.release_emit_lock(build_id);
        }
        Ok(line)
    }

    fn emit_lock(&self, build_id: i64) -> Result<Arc<tokio::sync::Mutex<()>>> {
        let mut locks = self
            .emit_locks
            .lock()
            .map_err(|_| anyhow!("log bus emit lock table poisoned"))?;
        Ok(locks.entry(build_id).or_default().clone())
    }

    fn release_emit_lock(&self, build_id: i64) {
        if let Ok(mut locks) = self.emit_locks.lock() {
            locks.remove(&build_id);
        }
    }

    fn publish(&self, line: &LogLine) -> Result<()> {
        let mut registry = self.registry()?;
        if let Some(subs) = registry.get_mut(&line.build_id) {
            subs.retain(|_, tx| tx.send(line.clone()).is_ok());
            if subs.is_empty() {
                registry.remove(&line.build_id);
            }
        }
        Ok(())
    }

    fn register(&self, build_id: i64) -> Result<(u64, mpsc::UnboundedReceiver<LogLine>)> {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.registry()?.entry(build_id).or_default().insert(id, tx);
        Ok((id, rx))
    }

    fn unregister(&self, build_id: i64, subscriber: u64) {
        if let Ok(mut registry) = self.registry() {
            if let Some(subs) = registry.get_mut(&build_id) {
                subs.remove(&subscriber);
                if subs.is_empty() {
                    registry.remove(&build_id);
                }
            }
        }
    }

    /// Number of live subscribers attached to a build.
    pub fn subscriber_count(&self, build_id: i64) -> usize {
        self.registry()
            .map(|r| r.get(&build_id).map_or(0, HashMap::len))
            .unwrap_or(0)
    }

    /// Attach to a build: backlog, then live lines, then `Complete`.
    ///
    /// Errors when the build does not exist. Dropping the returned stream
    /// unregisters the subscriber.
    pub async fn subscribe(self: &Arc<Self>, build_id: i64) -> Result<ReceiverStream<StreamMessage>> {
        // Register before reading the backlog so nothing falls between the two.
        let (subscriber, mut live) = self.register(build_id)?;

        let build = match self.store.get_build(build_id).await {
            Ok(Some(build)) => build,
            Ok(None) => {
                self.unregister(build_id, subscriber);
                anyhow::bail!("build {} not found", build_id);
            }
            Err(e) => {
                self.unregister(build_id, subscriber);
                return Err(e);
            }
        };
        let backlog = match self.store.log_lines(build_id).await {
            Ok(lines) => lines,
            Err(e) => {
                self.unregister(build_id, subscriber);
                return Err(e);
            }
        };

        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let bus = Arc::clone(self);

        tokio::spawn(async move {
            let mut last = 0;
            let mut finished = false;
            for line in backlog {
                last = line.line_number;
                finished |= line.is_terminal_status();
                if tx.send(StreamMessage::Line(line)).await.is_err() {
                    bus.unregister(build_id, subscriber);
                    return;
                }
            }

            if !finished && build.status.is_terminal() {
                // Finalized, but the closing status line may still be in flight.
                let _ = tokio::time::timeout(FINAL_STATUS_GRACE, async {
                    while let Some(line) = live.recv().await {
                        if line.line_number <= last {
                            continue;
                        }
                        last = line.line_number;
                        let terminal = line.is_terminal_status();
                        if tx.send(StreamMessage::Line(line)).await.is_err() || terminal {
                            break;
                        }
                    }
                })
                .await;
                finished = true;
            }

            while !finished {
                tokio::select! {
                    next = live.recv() => match next {
                        Some(line) => {
                            if line.line_number <= last {
                                continue;
                            }
                            last = line.line_number;
                            finished = line.is_terminal_status();
                            if tx.send(StreamMessage::Line(line)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = tx.closed() => break,
                }
            }

            if finished {
                let _ = tx.send(StreamMessage::Complete { build_id }).await;
            }
            bus.unregister(build_id, subscriber);
            debug!(build_id, subscriber, "log stream closed");
        });

        Ok(ReceiverStream::new(rx))
    }

    /// Ledger handle bound to one build.
    pub fn build_log(self: &Arc<Self>, build_id: i64) -> BuildLog {
        BuildLog {
            bus: Arc::clone(self),
            build_id,
        }
    }
}

/// Writer for one build's ledger, handed to each pipeline stage.
#[derive(Clone)]
pub struct BuildLog {
    bus: Arc<LogBus>,
    build_id: i64,
}

impl BuildLog {
    pub fn build_id(&self) -> i64 {
        self.build_id
    }

    pub async fn line(&self, kind: LogKind, content: &str) -> Result<LogLine> {
        self.bus.emit(self.build_id, kind, content).await
    }

    pub async fn stdout(&self, content: impl AsRef<str>) -> Result<()> {
        self.line(LogKind::Stdout, content.as_ref()).await.map(|_| ())
    }

    pub async fn stderr(&self, content: impl AsRef<str>) -> Result<()> {
        self.line(LogKind::Stderr, content.as_ref()).await.map(|_| ())
    }

    pub async fn status(&self, status: BuildStatus) -> Result<()> {
        self.line(LogKind::Status, status.as_str()).await.map(|_| ())
    }
}
