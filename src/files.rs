//! Chunked file transfer.
//!
//! Files ride the streaming plane as sequences of `file_chunk` envelopes,
//! one file per uuid. The sender streams chunks sequentially on a single
//! edge; the receiver appends them to `<destination>/<filename>.part`,
//! buffering a bounded window of out-of-order arrivals, and atomically
//! renames on completion. Every chunk carries its SHA-256; a mismatch is
//! re-requested up to [`MAX_CHUNK_RETRIES`] times before the transfer is
//! failed.
//!
//! Resume: when a `.part` for the same filename already exists, the
//! receiver answers the first chunk with `file_resume_from` carrying the
//! next expected index, and the sender seeks forward.
//!
//! Flow control: when the out-of-order window fills, the receiver emits
//! `flow_pause` for that file id and `flow_resume` once drained.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::address::Address;
use crate::messages::{Command, Envelope, FileChunk};

/// Default chunk size: 64 KiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 64 * 1024;

/// Out-of-order chunks buffered per file before `flow_pause` is sent.
pub const OUT_OF_ORDER_WINDOW: u64 = 32;

/// Re-requests of a corrupted chunk before the transfer is abandoned.
pub const MAX_CHUNK_RETRIES: u32 = 3;

/// How long a finished sender lingers for late re-requests.
const SENDER_LINGER: Duration = Duration::from_secs(3);

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let digest = Sha256::digest(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// Handed to the `file_handling_callback` when a file completes.
#[derive(Debug, Clone)]
pub struct FileEvent {
    pub filename: String,
    pub size: u64,
    pub source: Address,
    pub topic: String,
    pub destination_folder: PathBuf,
    /// Opaque application attachment sent alongside the file.
    pub attachment: Vec<u8>,
}

pub type FileCallback = Arc<dyn Fn(FileEvent) + Send + Sync>;

/// Control messages routed from the receiving peer to a sender task.
#[derive(Debug, Clone)]
pub(crate) enum SenderCtrl {
    ResumeFrom(u64),
    Pause,
    Resume,
    Abort(String),
}

/// Stream one file to one peer, sequentially on that peer's edge queue.
///
/// Controls (pause/resume/seek/abort) arrive from the node actor, which
/// routes the peer's `file_resume_from` / `flow_pause` / `flow_resume` /
/// `file_transfer_failed` envelopes here by `(peer, file_id)`.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn run_sender(
    edge_tx: mpsc::Sender<Envelope>,
    origin: Address,
    topic: String,
    path: PathBuf,
    file_id: Uuid,
    chunk_size: u64,
    attachment: Vec<u8>,
    mut ctrl: mpsc::Receiver<SenderCtrl>,
) -> anyhow::Result<()> {
    let mut file = File::open(&path).await?;
    let size = file.metadata().await?.len();
    let total_chunks = size.div_ceil(chunk_size).max(1);
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_id.to_string());

    debug!(
        file = %filename,
        id = %file_id,
        size,
        total_chunks,
        "starting file send"
    );

    let mut index: u64 = 0;
    let mut paused = false;
    let mut buf = vec![0u8; chunk_size as usize];

    'outer: while index < total_chunks {
        // Apply any controls that arrived since the last chunk.
        loop {
            let next = if paused {
                match ctrl.recv().await {
                    Some(c) => Some(c),
                    None => break 'outer, // node stopped
                }
            } else {
                match ctrl.try_recv() {
                    Ok(c) => Some(c),
                    Err(mpsc::error::TryRecvError::Empty) => None,
                    Err(mpsc::error::TryRecvError::Disconnected) => break 'outer,
                }
            };
            match next {
                Some(SenderCtrl::Pause) => paused = true,
                Some(SenderCtrl::Resume) => paused = false,
                Some(SenderCtrl::ResumeFrom(next_index)) => {
                    index = next_index.min(total_chunks);
                    paused = false;
                }
                Some(SenderCtrl::Abort(reason)) => {
                    anyhow::bail!("transfer {file_id} aborted by peer: {reason}");
                }
                None => break,
            }
        }
        if index >= total_chunks {
            break;
        }

        let offset = index * chunk_size;
        file.seek(SeekFrom::Start(offset)).await?;
        let want = ((size - offset).min(chunk_size)) as usize;
        file.read_exact(&mut buf[..want]).await?;
        let data = buf[..want].to_vec();

        let chunk = FileChunk {
            file_id,
            filename: filename.clone(),
            index,
            total_chunks,
            chunk_size,
            size,
            sha256: sha256(&data),
            data,
            eof: index + 1 == total_chunks,
            attachment: if index == 0 {
                attachment.clone()
            } else {
                Vec::new()
            },
        };

        let envelope =
            Envelope::new(origin.clone(), Command::FileChunk(chunk)).with_topic(topic.clone());
        if edge_tx.send(envelope).await.is_err() {
            anyhow::bail!("edge closed during transfer {file_id}");
        }
        index += 1;
    }

    // Linger for late re-requests of corrupted chunks.
    loop {
        match tokio::time::timeout(SENDER_LINGER, ctrl.recv()).await {
            Ok(Some(SenderCtrl::ResumeFrom(next_index))) if next_index < total_chunks => {
                let mut resend = next_index;
                while resend < total_chunks {
                    let offset = resend * chunk_size;
                    file.seek(SeekFrom::Start(offset)).await?;
                    let want = ((size - offset).min(chunk_size)) as usize;
                    file.read_exact(&mut buf[..want]).await?;
                    let data = buf[..want].to_vec();
                    let chunk = FileChunk {
                        file_id,
                        filename: filename.clone(),
                        index: resend,
                        total_chunks,
                        chunk_size,
                        size,
                        sha256: sha256(&data),
                        data,
                        eof: resend + 1 == total_chunks,
                        attachment: Vec::new(),
                    };
                    let envelope = Envelope::new(origin.clone(), Command::FileChunk(chunk))
                        .with_topic(topic.clone());
                    if edge_tx.send(envelope).await.is_err() {
                        anyhow::bail!("edge closed during transfer {file_id}");
                    }
                    resend += 1;
                }
            }
            Ok(Some(SenderCtrl::Abort(reason))) => {
                anyhow::bail!("transfer {file_id} aborted by peer: {reason}");
            }
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => break,
        }
    }

    debug!(file = %filename, id = %file_id, "file send complete");
    Ok(())
}

struct FileRecord {
    source: Address,
    topic: String,
    filename: String,
    part_path: PathBuf,
    final_path: PathBuf,
    file: File,
    total_chunks: u64,
    size: u64,
    next_expected: u64,
    /// Out-of-order chunks keyed by index.
    pending: BTreeMap<u64, FileChunk>,
    retries: HashMap<u64, u32>,
    paused: bool,
    last_activity: Instant,
    attachment: Vec<u8>,
}

/// Receive-side file transfer table. Owned by the node actor; every method
/// returns the control commands to send back to the sending peer.
pub(crate) struct FileIntake {
    destination: PathBuf,
    allow_incoming: bool,
    max_concurrent: usize,
    callback: Option<FileCallback>,
    records: HashMap<Uuid, FileRecord>,
    /// Recently finished (or failed) transfers; late replayed chunks for
    /// these are dropped instead of re-triggering a transfer.
    finished: HashSet<Uuid>,
}

impl FileIntake {
    pub fn new(
        destination: PathBuf,
        allow_incoming: bool,
        max_concurrent: usize,
        callback: Option<FileCallback>,
    ) -> Self {
        Self {
            destination,
            allow_incoming,
            max_concurrent,
            callback,
            records: HashMap::new(),
            finished: HashSet::new(),
        }
    }

    fn mark_finished(&mut self, file_id: Uuid) {
        if self.finished.len() >= 256 {
            self.finished.clear();
        }
        self.finished.insert(file_id);
    }

    pub fn active(&self) -> usize {
        self.records.len()
    }

    /// Process one incoming chunk; returns replies for the sending peer.
    pub async fn handle_chunk(
        &mut self,
        from: &Address,
        topic: Option<&str>,
        chunk: FileChunk,
    ) -> Vec<Command> {
        if !self.allow_incoming {
            if chunk.index == 0 {
                return vec![Command::FileTransferFailed {
                    file_id: chunk.file_id,
                    reason: "incoming files disabled".into(),
                }];
            }
            return Vec::new();
        }

        let file_id = chunk.file_id;
        if self.finished.contains(&file_id) {
            return Vec::new(); // late replay of a settled transfer
        }
        if !self.records.contains_key(&file_id) {
            if chunk.index != 0 {
                // Mid-stream chunk for an unknown transfer: ask the sender
                // to restart from the beginning of what we are missing.
                return vec![Command::FileResumeFrom {
                    file_id,
                    next_index: 0,
                }];
            }
            if self.records.len() >= self.max_concurrent {
                return vec![Command::FileTransferFailed {
                    file_id,
                    reason: "busy".into(),
                }];
            }
            match self.open_record(from, topic, &chunk).await {
                Ok((record, replies)) => {
                    let resuming = record.next_expected > 0;
                    self.records.insert(file_id, record);
                    if resuming {
                        // The sender will seek; replayed chunks below
                        // next_expected are dropped on arrival.
                        return replies;
                    }
                }
                Err(e) => {
                    warn!(file = %chunk.filename, error = %e, "cannot open file record");
                    return vec![Command::FileTransferFailed {
                        file_id,
                        reason: format!("receiver error: {e}"),
                    }];
                }
            }
        }

        let mut replies = Vec::new();
        let mut completed = None;
        if let Some(record) = self.records.get_mut(&file_id) {
            record.last_activity = Instant::now();

            if sha256(&chunk.data) != chunk.sha256 {
                let tries = record.retries.entry(chunk.index).or_insert(0);
                *tries += 1;
                if *tries > MAX_CHUNK_RETRIES {
                    warn!(
                        file = %record.filename,
                        index = chunk.index,
                        "chunk failed integrity check {MAX_CHUNK_RETRIES} times, aborting"
                    );
                    replies.push(Command::FileTransferFailed {
                        file_id,
                        reason: format!("chunk {} failed integrity check", chunk.index),
                    });
                    self.records.remove(&file_id);
                    self.mark_finished(file_id);
                    return replies;
                }
                replies.push(Command::FileResumeFrom {
                    file_id,
                    next_index: chunk.index,
                });
                return replies;
            }

            if chunk.index < record.next_expected {
                return replies; // replay of an already-written chunk
            }

            if chunk.index == record.next_expected {
                if let Err(e) = Self::append_in_order(record, chunk).await {
                    warn!(error = %e, "file write failed");
                    replies.push(Command::FileTransferFailed {
                        file_id,
                        reason: format!("write error: {e}"),
                    });
                    self.records.remove(&file_id);
                    self.mark_finished(file_id);
                    return replies;
                }
                if record.paused && (record.pending.len() as u64) < OUT_OF_ORDER_WINDOW / 2 {
                    record.paused = false;
                    replies.push(Command::FlowResume { file_id });
                }
            } else {
                record.pending.insert(chunk.index, chunk);
                if !record.paused && record.pending.len() as u64 >= OUT_OF_ORDER_WINDOW {
                    record.paused = true;
                    replies.push(Command::FlowPause { file_id });
                }
            }

            if record.next_expected >= record.total_chunks {
                completed = Some(file_id);
            }
        }

        if let Some(file_id) = completed {
            self.mark_finished(file_id);
            if let Some(record) = self.records.remove(&file_id) {
                match Self::finalize(record).await {
                    Ok(event) => {
                        if let Some(callback) = &self.callback {
                            callback(event);
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "file finalize failed");
                        replies.push(Command::FileTransferFailed {
                            file_id,
                            reason: format!("finalize error: {e}"),
                        });
                    }
                }
            }
        }
        replies
    }

    /// The sending peer abandoned the transfer.
    pub fn handle_failed(&mut self, file_id: Uuid, reason: &str) {
        if let Some(record) = self.records.remove(&file_id) {
            warn!(file = %record.filename, reason, "incoming transfer failed");
            self.mark_finished(file_id);
        }
    }

    /// Drop records with no traffic for `timeout`. The `.part` stays on disk
    /// so a later offer can resume it.
    pub fn sweep_idle(&mut self, timeout: Duration) -> usize {
        let before = self.records.len();
        self.records
            .retain(|_, record| record.last_activity.elapsed() < timeout);
        before - self.records.len()
    }

    async fn open_record(
        &self,
        from: &Address,
        topic: Option<&str>,
        chunk: &FileChunk,
    ) -> anyhow::Result<(FileRecord, Vec<Command>)> {
        if chunk.chunk_size == 0 || chunk.total_chunks == 0 {
            anyhow::bail!("malformed transfer geometry");
        }
        // Only the final path component is honored; a sender cannot steer
        // writes outside the destination folder.
        let filename = Path::new(&chunk.filename)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| anyhow::anyhow!("invalid filename"))?;

        tokio::fs::create_dir_all(&self.destination).await?;
        let part_path = self.destination.join(format!("{filename}.part"));
        let final_path = self.destination.join(&filename);

        let mut replies = Vec::new();
        let mut next_expected = 0u64;
        if let Ok(meta) = tokio::fs::metadata(&part_path).await {
            // Resume from the last whole chunk; a torn tail is discarded.
            let whole = meta.len() / chunk.chunk_size;
            if whole > 0 && whole < chunk.total_chunks {
                next_expected = whole;
                let file = OpenOptions::new().write(true).open(&part_path).await?;
                file.set_len(whole * chunk.chunk_size).await?;
                replies.push(Command::FileResumeFrom {
                    file_id: chunk.file_id,
                    next_index: whole,
                });
                debug!(file = %filename, resume_at = whole, "resuming partial transfer");
            } else {
                tokio::fs::remove_file(&part_path).await.ok();
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&part_path)
            .await?;

        Ok((
            FileRecord {
                source: from.clone(),
                topic: topic.unwrap_or_default().to_string(),
                filename,
                part_path,
                final_path,
                file,
                total_chunks: chunk.total_chunks,
                size: chunk.size,
                next_expected,
                pending: BTreeMap::new(),
                retries: HashMap::new(),
                paused: false,
                last_activity: Instant::now(),
                attachment: chunk.attachment.clone(),
            },
            replies,
        ))
    }

    async fn append_in_order(record: &mut FileRecord, chunk: FileChunk) -> anyhow::Result<()> {
        record.file.write_all(&chunk.data).await?;
        record.next_expected += 1;
        // Drain buffered successors that are now in order.
        while let Some(next) = record.pending.remove(&record.next_expected) {
            record.file.write_all(&next.data).await?;
            record.next_expected += 1;
        }
        Ok(())
    }

    async fn finalize(mut record: FileRecord) -> anyhow::Result<FileEvent> {
        record.file.flush().await?;
        record.file.sync_all().await?;
        drop(record.file);
        tokio::fs::rename(&record.part_path, &record.final_path).await?;
        debug!(file = %record.filename, size = record.size, "file transfer complete");
        Ok(FileEvent {
            filename: record.filename,
            size: record.size,
            source: record.source,
            topic: record.topic,
            destination_folder: record
                .final_path
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .to_path_buf(),
            attachment: record.attachment,
        })
    }
}
