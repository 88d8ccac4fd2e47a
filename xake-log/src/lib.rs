//! The leveled, multi-sink build log.
//!
//! A [`Logger`] fans every message out to its sinks; each sink filters
//! independently against its own maximum [`Level`]. The console sink
//! serialises writes with a mutex, the file sink owns its file behind a
//! dedicated mailbox task so writers never block on disk I/O.

use std::fmt;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use futures::channel::{mpsc, oneshot};
use futures::future::BoxFuture;
use futures::StreamExt;

/// Verbosity of a log message, ranked `Silent < Quiet < Normal < Loud <
/// Chatty < Diag`.
///
/// A sink configured at level `L` accepts messages at `L` and below. A sink
/// configured `Silent` accepts nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Silent,
    Quiet,
    Normal,
    Loud,
    Chatty,
    Diag,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Level::Silent => "silent",
            Level::Quiet => "quiet",
            Level::Normal => "normal",
            Level::Loud => "loud",
            Level::Chatty => "chatty",
            Level::Diag => "diag",
        };
        f.write_str(name)
    }
}

/// A single destination for log messages.
pub trait LogSink: Send + Sync {
    /// The most verbose level this sink accepts.
    fn max_level(&self) -> Level;

    /// Write one message. Filtering already happened at the [`Logger`].
    fn write(&self, level: Level, message: &str);

    /// Wait until previously written messages are durable.
    fn flush(&self) -> BoxFuture<'static, ()> {
        Box::pin(futures::future::ready(()))
    }
}

/// Sink writing to stderr, serialised by a mutex.
pub struct ConsoleSink {
    max_level: Level,
    out: Mutex<std::io::Stderr>,
}

impl ConsoleSink {
    pub fn new(max_level: Level) -> Self {
        ConsoleSink {
            max_level,
            out: Mutex::new(std::io::stderr()),
        }
    }
}

impl LogSink for ConsoleSink {
    fn max_level(&self) -> Level {
        self.max_level
    }

    fn write(&self, level: Level, message: &str) {
        let mut out = self.out.lock().expect("console sink lock poisoned");
        let _ = writeln!(out, "[{level}] {message}");
    }
}

enum FileMessage {
    Write(String),
    Flush(oneshot::Sender<()>),
}

/// Sink appending to a log file.
///
/// The open file lives on a mailbox task, so `write` only enqueues. Must be
/// created from within a tokio runtime.
pub struct FileSink {
    max_level: Level,
    tx: mpsc::UnboundedSender<FileMessage>,
}

impl FileSink {
    /// Create (truncating) the log file at `path` and spawn the writer task.
    pub fn create(path: &Path, max_level: Level) -> std::io::Result<Self> {
        let file = std::fs::File::create(path)?;
        let (tx, mut rx) = mpsc::unbounded();

        tokio::spawn(async move {
            let mut file = file;
            while let Some(message) = rx.next().await {
                match message {
                    FileMessage::Write(line) => {
                        let _ = writeln!(file, "{line}");
                    }
                    FileMessage::Flush(reply) => {
                        let _ = file.flush();
                        let _ = reply.send(());
                    }
                }
            }
            let _ = file.flush();
        });

        Ok(FileSink { max_level, tx })
    }
}

impl LogSink for FileSink {
    fn max_level(&self) -> Level {
        self.max_level
    }

    fn write(&self, level: Level, message: &str) {
        let line = format!("[{level}] {message}");
        // The receiver going away means we're shutting down, drop the line.
        let _ = self.tx.unbounded_send(FileMessage::Write(line));
    }

    fn flush(&self) -> BoxFuture<'static, ()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self.tx.unbounded_send(FileMessage::Flush(reply_tx));
        Box::pin(async move {
            let _ = reply_rx.await;
        })
    }
}

/// Cheap-clone handle fanning messages out to a set of sinks.
#[derive(Clone)]
pub struct Logger {
    sinks: Arc<Vec<Box<dyn LogSink>>>,
}

impl Logger {
    pub fn new(sinks: Vec<Box<dyn LogSink>>) -> Self {
        Logger {
            sinks: Arc::new(sinks),
        }
    }

    /// A logger that discards everything.
    pub fn silent() -> Self {
        Logger::new(Vec::new())
    }

    /// Write `message` to every sink whose level admits it.
    pub fn write(&self, level: Level, message: impl fmt::Display) {
        if level == Level::Silent {
            return;
        }
        // `level` is at least `Quiet` here, so a `Silent` sink never passes.
        if !self.sinks.iter().any(|sink| level <= sink.max_level()) {
            return;
        }

        let message = message.to_string();
        for sink in self.sinks.iter() {
            if level <= sink.max_level() {
                sink.write(level, &message);
            }
        }
    }

    pub async fn flush(&self) {
        for sink in self.sinks.iter() {
            sink.flush().await;
        }
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}
