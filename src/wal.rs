use crate::wire::LogEntry;
use crate::{Error, LogIndex, NodeId, Result, Term};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

const STATE_FILE: &str = "state.json";
const BASE_FILE: &str = "base.json";
const CHUNK_PREFIX: &str = "chunk-";
const CHUNK_SUFFIX: &str = ".wal";

/// Raft state that must be durable before any message depending on it is
/// answered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: Term,
    pub voted_for: Option<NodeId>,
    pub commit_index: LogIndex,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct LogBase {
    index: LogIndex,
    term: Term,
}

#[derive(Debug, Clone)]
pub struct WalOptions {
    pub flush_interval: Duration,
    pub flush_max_bytes: u64,
    pub chunk_max_bytes: u64,
}

impl Default for WalOptions {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(100),
            flush_max_bytes: 4 * 1024 * 1024,
            chunk_max_bytes: 8 * 1024 * 1024,
        }
    }
}

/// Resolves once the entry group containing the caller's append has been
/// fsynced. An fsync failure poisons the whole group: every waiter sees
/// `DurabilityError`.
#[derive(Debug)]
pub struct AppendAck {
    rx: oneshot::Receiver<Result<()>>,
}

impl AppendAck {
    pub async fn wait(self) -> Result<()> {
        self.rx.await.map_err(|_| Error::Durability {
            reason: "log flush worker exited before acknowledging".into(),
        })?
    }
}

struct FlushRequest {
    frames: Vec<u8>,
    first_index: LogIndex,
    entry_sizes: Vec<u64>,
    done: oneshot::Sender<Result<()>>,
}

#[derive(Debug, Clone)]
struct FilePos {
    chunk_first: LogIndex,
    offset: u64,
}

struct ChunkMeta {
    /// Index of the first entry framed in this chunk file.
    first_index: LogIndex,
    last_index: LogIndex,
    path: PathBuf,
}

struct FileState {
    dir: PathBuf,
    chunks: Vec<ChunkMeta>,
    active: Option<File>,
    active_len: u64,
    positions: BTreeMap<LogIndex, FilePos>,
}

struct MemState {
    base_index: LogIndex,
    base_term: Term,
    entries: VecDeque<LogEntry>,
}

impl MemState {
    fn last_index(&self) -> LogIndex {
        self.base_index + self.entries.len() as u64
    }

    fn entry(&self, index: LogIndex) -> Option<&LogEntry> {
        if index <= self.base_index || index > self.last_index() {
            return None;
        }
        self.entries.get((index - self.base_index - 1) as usize)
    }
}

/// Append-only on-disk log. Entries are grouped into fixed-size chunks;
/// appends flow through a single group-commit worker that amortizes one
/// fsync across all writers in the group.
pub struct Wal {
    mem: RwLock<MemState>,
    files: Arc<std::sync::Mutex<FileState>>,
    hard_state: RwLock<HardState>,
    flush_tx: mpsc::UnboundedSender<FlushRequest>,
    poisoned: Arc<AtomicBool>,
    durable: Arc<AtomicU64>,
    dir: PathBuf,
}

impl std::fmt::Debug for Wal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mem = self.mem.read();
        f.debug_struct("Wal")
            .field("base_index", &mem.base_index)
            .field("last_index", &mem.last_index())
            .finish()
    }
}

fn frame_entry(entry: &LogEntry) -> Result<Vec<u8>> {
    let body = bincode::serialize(entry)?;
    let mut frame = Vec::with_capacity(body.len() + 4);
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

fn chunk_path(dir: &Path, first_index: LogIndex) -> PathBuf {
    dir.join(format!("{CHUNK_PREFIX}{first_index:016x}{CHUNK_SUFFIX}"))
}

fn parse_chunk_name(name: &str) -> Option<LogIndex> {
    let hex = name.strip_prefix(CHUNK_PREFIX)?.strip_suffix(CHUNK_SUFFIX)?;
    LogIndex::from_str_radix(hex, 16).ok()
}

fn write_json_atomic<T: Serialize>(dir: &Path, name: &str, value: &T) -> Result<()> {
    let tmp = dir.join(format!(".{name}.tmp"));
    let body = serde_json::to_vec_pretty(value).map_err(|e| Error::Durability {
        reason: format!("encode {name}: {e}"),
    })?;
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&body)?;
        file.sync_data()?;
    }
    std::fs::rename(&tmp, dir.join(name))?;
    Ok(())
}

fn read_json<T: for<'de> Deserialize<'de> + Default>(dir: &Path, name: &str) -> Result<T> {
    let path = dir.join(name);
    if !path.exists() {
        return Ok(T::default());
    }
    let body = std::fs::read(&path)?;
    serde_json::from_slice(&body).map_err(|e| Error::Durability {
        reason: format!("decode {name}: {e}"),
    })
}

impl Wal {
    /// Open the log directory, recovering the chunk suffix beyond the
    /// compaction base. A partial final frame in the last chunk is
    /// truncated; the same condition in an earlier chunk is corruption.
    pub fn open(dir: &Path, opts: WalOptions) -> Result<Arc<Wal>> {
        std::fs::create_dir_all(dir)?;
        let hard_state: HardState = read_json(dir, STATE_FILE)?;
        let base: LogBase = read_json(dir, BASE_FILE)?;

        let mut chunk_starts: Vec<LogIndex> = std::fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .filter_map(|e| parse_chunk_name(&e.file_name().to_string_lossy()))
            .collect();
        chunk_starts.sort_unstable();

        let mut mem = MemState {
            base_index: base.index,
            base_term: base.term,
            entries: VecDeque::new(),
        };
        let mut files = FileState {
            dir: dir.to_path_buf(),
            chunks: Vec::new(),
            active: None,
            active_len: 0,
            positions: BTreeMap::new(),
        };

        let chunk_count = chunk_starts.len();
        for (chunk_no, first_index) in chunk_starts.into_iter().enumerate() {
            let path = chunk_path(dir, first_index);
            let is_last = chunk_no + 1 == chunk_count;
            let (entries, valid_len, file_len) = scan_chunk(&path)?;
            if valid_len < file_len {
                if is_last {
                    warn!(
                        chunk = %path.display(),
                        dropped = file_len - valid_len,
                        "truncating partial entry at log tail"
                    );
                    let file = OpenOptions::new().write(true).open(&path)?;
                    file.set_len(valid_len)?;
                    file.sync_data()?;
                } else {
                    return Err(Error::Durability {
                        reason: format!("torn frame inside non-final chunk {}", path.display()),
                    });
                }
            }
            let mut last_index = first_index.saturating_sub(1);
            let mut offset = 0u64;
            for (entry, frame_len) in entries {
                if entry.index > mem.base_index {
                    let expected = mem.last_index() + 1;
                    if entry.index != expected {
                        return Err(Error::Durability {
                            reason: format!(
                                "log gap: expected index {expected}, found {} in {}",
                                entry.index,
                                path.display()
                            ),
                        });
                    }
                    files.positions.insert(
                        entry.index,
                        FilePos {
                            chunk_first: first_index,
                            offset,
                        },
                    );
                    mem.entries.push_back(entry.clone());
                }
                last_index = entry.index;
                offset += frame_len;
            }
            files.chunks.push(ChunkMeta {
                first_index,
                last_index,
                path: path.clone(),
            });
            if is_last {
                let file = OpenOptions::new().append(true).open(&path)?;
                files.active = Some(file);
                files.active_len = valid_len;
            }
        }

        info!(
            base_index = mem.base_index,
            last_index = mem.last_index(),
            term = hard_state.term,
            commit = hard_state.commit_index,
            "write-ahead log recovered"
        );

        let (flush_tx, flush_rx) = mpsc::unbounded_channel();
        let durable = Arc::new(AtomicU64::new(mem.last_index()));
        let files = Arc::new(std::sync::Mutex::new(files));
        let poisoned = Arc::new(AtomicBool::new(false));
        let wal = Arc::new(Wal {
            mem: RwLock::new(mem),
            files: Arc::clone(&files),
            hard_state: RwLock::new(hard_state),
            flush_tx,
            poisoned: Arc::clone(&poisoned),
            durable: Arc::clone(&durable),
            dir: dir.to_path_buf(),
        });
        tokio::spawn(flush_worker(flush_rx, files, poisoned, durable, opts));
        Ok(wal)
    }

    /// Highest index whose group commit has fsynced. The leader counts
    /// itself toward replication quorum only up to this watermark.
    pub fn durable_index(&self) -> LogIndex {
        self.durable.load(Ordering::Acquire)
    }

    pub fn hard_state(&self) -> HardState {
        self.hard_state.read().clone()
    }

    /// Persist term / vote / commit with an immediate fsync. Callers must
    /// not answer a vote or append until this returns.
    pub fn save_hard_state(&self, state: &HardState) -> Result<()> {
        write_json_atomic(&self.dir, STATE_FILE, state)?;
        *self.hard_state.write() = state.clone();
        Ok(())
    }

    pub fn base_index(&self) -> LogIndex {
        self.mem.read().base_index
    }

    pub fn base_term(&self) -> Term {
        self.mem.read().base_term
    }

    pub fn last_index(&self) -> LogIndex {
        self.mem.read().last_index()
    }

    pub fn last_term(&self) -> Term {
        let mem = self.mem.read();
        mem.entries.back().map_or(mem.base_term, |e| e.term)
    }

    /// Term of the entry at `index`, if it is still in the log (or is the
    /// compaction base itself).
    pub fn entry_term(&self, index: LogIndex) -> Option<Term> {
        let mem = self.mem.read();
        if index == mem.base_index {
            return Some(mem.base_term);
        }
        mem.entry(index).map(|e| e.term)
    }

    pub fn entry(&self, index: LogIndex) -> Option<LogEntry> {
        self.mem.read().entry(index).cloned()
    }

    /// Entries from `from` (inclusive) up to `max_bytes` of payload, always
    /// returning at least one entry when available.
    pub fn entries_from(&self, from: LogIndex, max_bytes: u64) -> Vec<LogEntry> {
        let mem = self.mem.read();
        let mut out = Vec::new();
        let mut bytes = 0u64;
        let mut index = from;
        while let Some(entry) = mem.entry(index) {
            bytes += entry.payload.len() as u64 + 32;
            if !out.is_empty() && bytes > max_bytes {
                break;
            }
            out.push(entry.clone());
            index += 1;
        }
        out
    }

    /// Append contiguous entries and schedule them for group commit. The
    /// returned ack resolves once the group's fsync completes.
    pub fn append(&self, entries: Vec<LogEntry>) -> Result<AppendAck> {
        if self.poisoned.load(Ordering::Acquire) {
            return Err(Error::Durability {
                reason: "log poisoned by earlier fsync failure".into(),
            });
        }
        let (done, rx) = oneshot::channel();
        if entries.is_empty() {
            let _ = done.send(Ok(()));
            return Ok(AppendAck { rx });
        }
        let first_index = entries[0].index;
        let mut frames = Vec::new();
        let mut entry_sizes = Vec::with_capacity(entries.len());
        {
            let mut mem = self.mem.write();
            if first_index != mem.last_index() + 1 {
                return Err(Error::Durability {
                    reason: format!(
                        "non-contiguous append: log ends at {}, got {first_index}",
                        mem.last_index()
                    ),
                });
            }
            for entry in &entries {
                let frame = frame_entry(entry)?;
                entry_sizes.push(frame.len() as u64);
                frames.extend_from_slice(&frame);
            }
            for entry in entries {
                mem.entries.push_back(entry);
            }
        }
        self.flush_tx
            .send(FlushRequest {
                frames,
                first_index,
                entry_sizes,
                done,
            })
            .map_err(|_| Error::Durability {
                reason: "log flush worker is gone".into(),
            })?;
        Ok(AppendAck { rx })
    }

    /// Wait until everything queued so far is durable.
    pub async fn flush_now(&self) -> Result<()> {
        // An empty request rides through the queue behind all pending work.
        let (done, rx) = oneshot::channel();
        self.flush_tx
            .send(FlushRequest {
                frames: Vec::new(),
                first_index: 0,
                entry_sizes: Vec::new(),
                done,
            })
            .map_err(|_| Error::Durability {
                reason: "log flush worker is gone".into(),
            })?;
        AppendAck { rx }.wait().await
    }

    /// Drop the uncommitted suffix starting at `from`. Used by followers
    /// reconciling a conflicting log with a new leader.
    pub async fn truncate_from(&self, from: LogIndex) -> Result<()> {
        self.flush_now().await?;
        let mut mem = self.mem.write();
        if from <= mem.base_index {
            return Err(Error::Durability {
                reason: format!(
                    "cannot truncate at {from}: already compacted through {}",
                    mem.base_index
                ),
            });
        }
        if from > mem.last_index() {
            return Ok(());
        }
        let keep = (from - mem.base_index - 1) as usize;
        mem.entries.truncate(keep);

        let mut files = self.files.lock().expect("wal file state lock");
        let pos = files.positions.get(&from).cloned();
        if let Some(pos) = pos {
            // Remove whole chunks past the cut, then shorten the one
            // containing it.
            let cut_chunk = pos.chunk_first;
            let mut removed = Vec::new();
            files.chunks.retain(|c| {
                if c.first_index > cut_chunk {
                    removed.push(c.path.clone());
                    false
                } else {
                    true
                }
            });
            for path in removed {
                std::fs::remove_file(&path)?;
            }
            let chunk = files
                .chunks
                .last_mut()
                .ok_or_else(|| Error::Durability {
                    reason: "truncate position points at a missing chunk".into(),
                })?;
            chunk.last_index = from.saturating_sub(1);
            let file = OpenOptions::new().write(true).open(&chunk.path)?;
            file.set_len(pos.offset)?;
            file.sync_data()?;
            let active = OpenOptions::new().append(true).open(&chunk.path)?;
            files.active = Some(active);
            files.active_len = pos.offset;
            files.positions.split_off(&from);
        }
        self.durable
            .fetch_min(from.saturating_sub(1), Ordering::AcqRel);
        debug!(from, "log truncated");
        Ok(())
    }

    /// Discard chunks wholly covered by a durable snapshot at `through`.
    /// Chunks that straddle the boundary are kept intact.
    pub async fn compact_through(&self, through: LogIndex) -> Result<()> {
        let term = match self.entry_term(through) {
            Some(term) => term,
            None => {
                return Err(Error::Durability {
                    reason: format!("compaction point {through} is not in the log"),
                })
            }
        };
        self.flush_now().await?;
        {
            let mut mem = self.mem.write();
            if through <= mem.base_index {
                return Ok(());
            }
            let drop_count = (through - mem.base_index) as usize;
            for _ in 0..drop_count.min(mem.entries.len()) {
                mem.entries.pop_front();
            }
            mem.base_index = through;
            mem.base_term = term;
        }
        write_json_atomic(
            &self.dir,
            BASE_FILE,
            &LogBase {
                index: through,
                term,
            },
        )?;
        let mut files = self.files.lock().expect("wal file state lock");
        let active_first = files.chunks.last().map(|c| c.first_index);
        let mut removed = Vec::new();
        files.chunks.retain(|c| {
            let removable = c.last_index <= through && Some(c.first_index) != active_first;
            if removable {
                removed.push(c.path.clone());
            }
            !removable
        });
        for path in &removed {
            std::fs::remove_file(path)?;
        }
        let positions = files.positions.split_off(&(through + 1));
        files.positions = positions;
        // Entries up to the boundary are durable via the snapshot itself.
        self.durable.fetch_max(through, Ordering::AcqRel);
        if !removed.is_empty() {
            info!(through, chunks = removed.len(), "log compacted");
        }
        Ok(())
    }

    /// Replace the entire log with a snapshot boundary. Used when a
    /// follower installs a snapshot that is ahead of its log.
    pub async fn reset_to_snapshot(&self, index: LogIndex, term: Term) -> Result<()> {
        self.flush_now().await?;
        {
            let mut mem = self.mem.write();
            mem.entries.clear();
            mem.base_index = index;
            mem.base_term = term;
        }
        write_json_atomic(&self.dir, BASE_FILE, &LogBase { index, term })?;
        let mut files = self.files.lock().expect("wal file state lock");
        for chunk in files.chunks.drain(..) {
            std::fs::remove_file(&chunk.path)?;
        }
        files.active = None;
        files.active_len = 0;
        files.positions.clear();
        self.durable.store(index, Ordering::Release);
        info!(index, term, "log reset to snapshot boundary");
        Ok(())
    }
}

/// Parse one chunk file. Returns the decoded entries with their frame
/// lengths, the byte length of the valid prefix, and the file length.
fn scan_chunk(path: &Path) -> Result<(Vec<(LogEntry, u64)>, u64, u64)> {
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let mut entries = Vec::new();
    let mut valid = 0u64;
    loop {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let body_len = u32::from_le_bytes(len_buf) as u64;
        if valid + 4 + body_len > file_len {
            break;
        }
        let mut body = vec![0u8; body_len as usize];
        match reader.read_exact(&mut body) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        match bincode::deserialize::<LogEntry>(&body) {
            Ok(entry) => {
                let frame_len = 4 + body_len;
                entries.push((entry, frame_len));
                valid += frame_len;
            }
            Err(_) => break,
        }
    }
    Ok((entries, valid, file_len))
}

async fn flush_worker(
    mut rx: mpsc::UnboundedReceiver<FlushRequest>,
    files: Arc<std::sync::Mutex<FileState>>,
    poisoned: Arc<AtomicBool>,
    durable: Arc<AtomicU64>,
    opts: WalOptions,
) {
    while let Some(first) = rx.recv().await {
        let mut group = vec![first];
        let mut group_bytes = group[0].frames.len() as u64;
        let deadline = tokio::time::Instant::now() + opts.flush_interval;
        while group_bytes < opts.flush_max_bytes {
            tokio::select! {
                more = rx.recv() => match more {
                    Some(req) => {
                        group_bytes += req.frames.len() as u64;
                        group.push(req);
                    }
                    None => break,
                },
                () = tokio::time::sleep_until(deadline) => break,
            }
        }

        let group_last = group
            .iter()
            .filter(|r| !r.entry_sizes.is_empty())
            .map(|r| r.first_index + r.entry_sizes.len() as u64 - 1)
            .max();
        let files = Arc::clone(&files);
        let chunk_max = opts.chunk_max_bytes;
        let result = tokio::task::spawn_blocking(move || -> (Vec<oneshot::Sender<Result<()>>>, Result<()>) {
            let mut state = files.lock().expect("wal file state lock");
            let mut done = Vec::with_capacity(group.len());
            let mut outcome = Ok(());
            for req in group {
                if outcome.is_ok() {
                    outcome = write_group_frames(&mut state, &req, chunk_max);
                }
                done.push(req.done);
            }
            if outcome.is_ok() {
                if let Some(active) = state.active.as_ref() {
                    if let Err(e) = active.sync_data() {
                        outcome = Err(Error::Durability {
                            reason: format!("fsync: {e}"),
                        });
                    }
                }
            }
            (done, outcome)
        })
        .await;

        match result {
            Ok((done, outcome)) => {
                if outcome.is_ok() {
                    if let Some(last) = group_last {
                        durable.fetch_max(last, Ordering::AcqRel);
                    }
                } else {
                    poisoned.store(true, Ordering::Release);
                    warn!("group commit failed, poisoning the log");
                }
                for tx in done {
                    let reply = match &outcome {
                        Ok(()) => Ok(()),
                        Err(_) => Err(Error::Durability {
                            reason: "group commit fsync failed".into(),
                        }),
                    };
                    let _ = tx.send(reply);
                }
            }
            Err(join_err) => {
                poisoned.store(true, Ordering::Release);
                warn!(error = %join_err, "flush worker write task panicked");
            }
        }
    }
}

fn write_group_frames(state: &mut FileState, req: &FlushRequest, chunk_max: u64) -> Result<()> {
    if req.frames.is_empty() {
        return Ok(());
    }
    // Rotate at request granularity: a chunk never splits one append call.
    let rotate = match state.active {
        Some(_) => state.active_len + req.frames.len() as u64 > chunk_max && state.active_len > 0,
        None => true,
    };
    if rotate {
        if let Some(active) = state.active.take() {
            active.sync_data()?;
        }
        let path = chunk_path(&state.dir, req.first_index);
        let file = OpenOptions::new().create_new(true).append(true).open(&path)?;
        state.chunks.push(ChunkMeta {
            first_index: req.first_index,
            last_index: req.first_index.saturating_sub(1),
            path,
        });
        state.active = Some(file);
        state.active_len = 0;
    }
    let chunk_first = state
        .chunks
        .last()
        .map(|c| c.first_index)
        .expect("active chunk has metadata");
    let mut offset = state.active_len;
    for (i, size) in req.entry_sizes.iter().enumerate() {
        state.positions.insert(
            req.first_index + i as u64,
            FilePos {
                chunk_first,
                offset,
            },
        );
        offset += size;
    }
    state
        .active
        .as_mut()
        .expect("active chunk file")
        .write_all(&req.frames)?;
    state.active_len = offset;
    if let Some(chunk) = state.chunks.last_mut() {
        chunk.last_index = req.first_index + req.entry_sizes.len() as u64 - 1;
    }
    Ok(())
}
