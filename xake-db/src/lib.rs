//! The persistent build database.
//!
//! Stores the last successful [`BuildResult`] per [`Target`] in an
//! append-only binary log at `<project_root>/.xake`. All access goes through
//! a single-writer mailbox so reads are always consistent with writes.
//!
//! On open the log is replayed; the latest record per target wins. A
//! corrupted or truncated tail is dropped and the file is cut back to the
//! last consistent prefix, so a crash mid-write costs at most one record.

use std::collections::BTreeMap;
use std::io::{Read, Seek, Write};
use std::path::{Path, PathBuf};

use futures::channel::{mpsc, oneshot};
use futures::StreamExt;
use xake_types::{BuildResult, Target};

/// Name of the database file, relative to the project root.
pub static DB_FILENAME: &str = ".xake";

const MAGIC: [u8; 4] = *b"XKDB";
const VERSION: u8 = 1;

/// Errors that can be returned from database operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to persist record: {0}")]
    Write(String),
    #[error("database is closed")]
    Closed,
}

enum Request {
    Get {
        target: Target,
        reply: oneshot::Sender<Option<BuildResult>>,
    },
    Put {
        result: BuildResult,
        reply: oneshot::Sender<Result<(), String>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the build database.
///
/// Cheap to clone; every clone talks to the same writer task. Must be opened
/// from within a tokio runtime.
#[derive(Debug, Clone)]
pub struct Database {
    tx: mpsc::UnboundedSender<Request>,
}

impl Database {
    /// Open (or create) the database under `project_root` and spawn the
    /// writer task.
    ///
    /// Corrupt content is recovered up to the last consistent prefix; only a
    /// file that cannot be read or created at all is an error.
    pub fn open(project_root: &Path) -> Result<Self, Error> {
        let path = project_root.join(DB_FILENAME);
        let (map, file) = load(&path)?;
        tracing::debug!(path = ?path, entries = map.len(), "opened build database");
        Ok(Database::spawn(map, Some(file)))
    }

    /// A database that lives only in memory. Used when the on-disk store is
    /// unusable but the build should still proceed.
    pub fn ephemeral() -> Self {
        Database::spawn(BTreeMap::new(), None)
    }

    fn spawn(map: BTreeMap<Target, BuildResult>, file: Option<std::fs::File>) -> Self {
        let (tx, rx) = mpsc::unbounded();
        tokio::spawn(run_actor(map, file, rx));
        Database { tx }
    }

    /// Fetch the last persisted result for `target`.
    pub async fn get(&self, target: &Target) -> Result<Option<BuildResult>, Error> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = Request::Get {
            target: target.clone(),
            reply: reply_tx,
        };
        self.tx.unbounded_send(request).map_err(|_| Error::Closed)?;
        reply_rx.await.map_err(|_| Error::Closed)
    }

    /// Persist `result`, replacing any previous record for its target.
    pub async fn put(&self, result: BuildResult) -> Result<(), Error> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = Request::Put {
            result,
            reply: reply_tx,
        };
        self.tx.unbounded_send(request).map_err(|_| Error::Closed)?;
        let outcome = reply_rx.await.map_err(|_| Error::Closed)?;
        outcome.map_err(Error::Write)
    }

    /// Flush outstanding writes and shut the writer task down.
    pub async fn close_and_flush(&self) -> Result<(), Error> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = Request::Close { reply: reply_tx };
        self.tx.unbounded_send(request).map_err(|_| Error::Closed)?;
        reply_rx.await.map_err(|_| Error::Closed)
    }
}

async fn run_actor(
    mut map: BTreeMap<Target, BuildResult>,
    mut file: Option<std::fs::File>,
    mut rx: mpsc::UnboundedReceiver<Request>,
) {
    while let Some(request) = rx.next().await {
        match request {
            Request::Get { target, reply } => {
                let _ = reply.send(map.get(&target).cloned());
            }
            Request::Put { result, reply } => {
                let outcome = match file.as_mut() {
                    Some(file) => append_record(file, &result),
                    None => Ok(()),
                };
                if outcome.is_ok() {
                    map.insert(result.target.clone(), result);
                }
                let _ = reply.send(outcome);
            }
            Request::Close { reply } => {
                if let Some(file) = file.as_mut() {
                    let _ = file.sync_all();
                }
                let _ = reply.send(());
                break;
            }
        }
    }
}

fn append_record(file: &mut std::fs::File, result: &BuildResult) -> Result<(), String> {
    let bytes = bincode::serialize(result).map_err(|err| err.to_string())?;
    let len = u32::try_from(bytes.len()).map_err(|_| "record too large".to_string())?;
    file.write_all(&len.to_le_bytes())
        .and_then(|()| file.write_all(&bytes))
        .map_err(|err| err.to_string())
}

/// Read the log at `path`, returning the recovered map and the file
/// positioned for appending.
fn load(path: &PathBuf) -> Result<(BTreeMap<Target, BuildResult>, std::fs::File), Error> {
    let mut file = std::fs::File::options()
        .read(true)
        .write(true)
        .create(true)
        .open(path)?;

    let mut buffer = Vec::new();
    file.read_to_end(&mut buffer)?;

    if buffer.is_empty() {
        file.write_all(&MAGIC)?;
        file.write_all(&[VERSION])?;
        return Ok((BTreeMap::new(), file));
    }

    if buffer.len() < MAGIC.len() + 1 || buffer[..MAGIC.len()] != MAGIC {
        tracing::warn!(path = ?path, "unrecognized build database header, starting empty");
        reset(&mut file)?;
        return Ok((BTreeMap::new(), file));
    }
    if buffer[MAGIC.len()] != VERSION {
        tracing::warn!(
            path = ?path,
            version = buffer[MAGIC.len()],
            "unsupported build database version, starting empty",
        );
        reset(&mut file)?;
        return Ok((BTreeMap::new(), file));
    }

    let mut map = BTreeMap::new();
    let mut offset = MAGIC.len() + 1;
    loop {
        let Some(header) = buffer.get(offset..offset + 4) else {
            break;
        };
        let len = u32::from_le_bytes(header.try_into().expect("sliced 4 bytes")) as usize;
        let Some(record) = buffer.get(offset + 4..offset + 4 + len) else {
            break;
        };
        match bincode::deserialize::<BuildResult>(record) {
            Ok(result) => {
                map.insert(result.target.clone(), result);
                offset += 4 + len;
            }
            Err(err) => {
                tracing::warn!(path = ?path, offset, %err, "corrupt build database record");
                break;
            }
        }
    }

    if offset < buffer.len() {
        tracing::warn!(
            path = ?path,
            recovered = offset,
            total = buffer.len(),
            "dropping corrupt build database tail",
        );
        file.set_len(offset as u64)?;
    }
    file.seek(std::io::SeekFrom::End(0))?;

    Ok((map, file))
}

/// Truncate the file and write a fresh header.
fn reset(file: &mut std::fs::File) -> Result<(), Error> {
    file.set_len(0)?;
    file.seek(std::io::SeekFrom::Start(0))?;
    file.write_all(&MAGIC)?;
    file.write_all(&[VERSION])?;
    Ok(())
}
