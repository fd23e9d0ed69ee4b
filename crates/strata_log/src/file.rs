//! File-backed log with CRC32-framed records.
//!
//! Every record is `len(u32 BE) | crc32(u32 BE) | body`. The body holds the
//! entry index, the append timestamp and the opaque entry bytes. On open the
//! whole file is read back so a restarted node can replay every entry.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use bytes::{Buf, BufMut};
use parking_lot::Mutex;

use crate::memory::LogBuffer;
use crate::types::{LogEntry, LogIndex, ReplicatedLog};

/// Upper bound on one record body. A length header above it is corruption.
pub const MAX_RECORD_BYTES: usize = 64 * 1024 * 1024;

const FRAME_HEADER: usize = 4 + 4;
const ENTRY_HEADER: usize = 8 + 8 + 4;

/// Sync strategy used after each append.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncMode {
    /// Flush to the OS only.
    None,
    /// `fdatasync` after every append.
    Data,
}

struct Inner {
    path: PathBuf,
    file: Mutex<File>,
    buffer: LogBuffer,
    sync: SyncMode,
}

/// Durable append-only log stored in a single file.
#[derive(Clone)]
pub struct FileLog {
    inner: Arc<Inner>,
}

impl FileLog {
    /// Open (or create) the log file and load every existing entry.
    pub fn open(path: impl AsRef<Path>, sync: SyncMode) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("create log dir")?;
        }
        let entries = read_log_entries(&path)
            .with_context(|| format!("load log file {}", path.display()))?;
        for (pos, entry) in entries.iter().enumerate() {
            anyhow::ensure!(
                entry.index == pos as LogIndex + 1,
                "log {} is not contiguous: expected index {}, found {}",
                path.display(),
                pos + 1,
                entry.index
            );
        }
        tracing::info!(path = %path.display(), entries = entries.len(), "opened file log");

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open log file {}", path.display()))?;
        Ok(Self {
            inner: Arc::new(Inner {
                path,
                file: Mutex::new(file),
                buffer: LogBuffer::new(entries),
                sync,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }
}

impl Inner {
    fn append_blocking(&self, payload: Vec<u8>) -> anyhow::Result<LogIndex> {
        let mut file = self.file.lock();
        self.buffer.append_with(payload, |entry| {
            let frame = encode_frame(entry)?;
            write_or_rollback(&mut file, |file| {
                file.write_all(&frame)?;
                file.flush()?;
                if self.sync == SyncMode::Data {
                    file.sync_data()?;
                }
                Ok(())
            })
        })
    }
}

#[async_trait]
impl ReplicatedLog for FileLog {
    async fn append(&self, payload: Vec<u8>) -> anyhow::Result<LogIndex> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || inner.append_blocking(payload))
            .await
            .context("file log append task")?
    }

    async fn read_from(&self, from: LogIndex, max: usize) -> anyhow::Result<Vec<LogEntry>> {
        Ok(self.inner.buffer.read_from(from, max))
    }

    fn last_index(&self) -> LogIndex {
        self.inner.buffer.last_index()
    }

    async fn wait_for(&self, index: LogIndex) {
        self.inner.buffer.wait_for(index).await
    }
}

/// Run `write` against the end of `file`. On failure the file is cut back to
/// its previous length, so a torn record never precedes the next append.
fn write_or_rollback<F>(file: &mut File, write: F) -> anyhow::Result<()>
where
    F: FnOnce(&mut File) -> std::io::Result<()>,
{
    let len = file.metadata().context("stat log file")?.len();
    if let Err(err) = write(file) {
        if let Err(trunc_err) = file.set_len(len) {
            tracing::error!(
                error = ?trunc_err,
                len,
                "could not cut torn record from log file"
            );
        }
        return Err(anyhow::Error::new(err).context("write log record"));
    }
    Ok(())
}

fn encode_frame(entry: &LogEntry) -> anyhow::Result<Vec<u8>> {
    let body_len = ENTRY_HEADER + entry.payload.len();
    anyhow::ensure!(
        body_len <= MAX_RECORD_BYTES,
        "log entry {} is {body_len} bytes, over the {MAX_RECORD_BYTES} byte limit",
        entry.index
    );
    let mut frame = Vec::with_capacity(FRAME_HEADER + body_len);
    frame.put_u32(body_len as u32);
    frame.put_u32(0);
    frame.put_u64(entry.index);
    frame.put_u64(entry.appended_unix_ms);
    frame.put_u32(entry.payload.len() as u32);
    frame.put_slice(&entry.payload);
    let crc = crc32fast::hash(&frame[FRAME_HEADER..]);
    frame[4..FRAME_HEADER].copy_from_slice(&crc.to_be_bytes());
    Ok(frame)
}

fn read_log_entries(path: &Path) -> anyhow::Result<Vec<LogEntry>> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut rest = data.as_slice();
    let mut entries = Vec::new();
    while rest.has_remaining() {
        let at = data.len() - rest.remaining();
        anyhow::ensure!(
            rest.remaining() >= FRAME_HEADER,
            "log record at byte {at} truncated in header"
        );
        let len = rest.get_u32() as usize;
        let crc = rest.get_u32();
        anyhow::ensure!(
            len <= MAX_RECORD_BYTES,
            "log record at byte {at} claims {len} bytes, over the {MAX_RECORD_BYTES} byte limit"
        );
        anyhow::ensure!(
            rest.remaining() >= len,
            "log record at byte {at} truncated in body"
        );
        let (body, tail) = rest.split_at(len);
        anyhow::ensure!(
            crc32fast::hash(body) == crc,
            "log checksum mismatch at byte {at}"
        );
        entries.push(decode_entry(body).with_context(|| format!("log record at byte {at}"))?);
        rest = tail;
    }
    Ok(entries)
}

fn decode_entry(mut body: &[u8]) -> anyhow::Result<LogEntry> {
    anyhow::ensure!(body.remaining() >= ENTRY_HEADER, "log entry header short");
    let index = body.get_u64();
    let appended_unix_ms = body.get_u64();
    let len = body.get_u32() as usize;
    anyhow::ensure!(
        body.remaining() == len,
        "log entry {index} carries {} payload bytes, header says {len}",
        body.remaining()
    );
    Ok(LogEntry {
        index,
        appended_unix_ms,
        payload: body.to_vec(),
    })
}
