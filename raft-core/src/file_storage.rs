//! Durable log store.
//!
//! Layout of the data directory:
//! - `meta.json`: hard state, replaced atomically (write temp, fsync, rename)
//! - `<first-index>.log`: append-only segments, one `<sha256> <json>` record
//!   per line
//! - `snapshot.bin`: JSON header line followed by the raw state-machine image
//!
//! Opening the store verifies every checksum and that indexes are
//! contiguous. Any mismatch is reported as [`RaftError::Corruption`] and the
//! store is never repaired automatically.

use async_trait::async_trait;
use crate::error::RaftError;
use crate::storage::{HardState, Snapshot, Storage};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use shared::types::{Index, LogEntry, Term};
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

const DEFAULT_SEGMENT_CAPACITY: u64 = 1024;
const META_FILE: &str = "meta.json";
const SNAPSHOT_FILE: &str = "snapshot.bin";
const SEGMENT_EXT: &str = "log";

#[derive(Debug, Clone)]
struct Segment {
    first_index: Index,
    last_index: Index,
    path: PathBuf,
}

impl Segment {
    fn len(&self) -> u64 {
        self.last_index + 1 - self.first_index
    }
}

#[derive(Serialize, Deserialize)]
struct SnapshotHeader {
    last_included_index: Index,
    last_included_term: Term,
    checksum: String,
}

pub struct FileStorage {
    dir: PathBuf,
    segment_capacity: u64,
    segments: Vec<Segment>,
    hard_state: HardState,
    snapshot_index: Index,
}

fn checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn encode_record(entry: &LogEntry) -> Result<String, RaftError> {
    let json = serde_json::to_string(entry)?;
    Ok(format!("{} {}\n", checksum(json.as_bytes()), json))
}

fn decode_segment(path: &Path, contents: &str) -> Result<Vec<LogEntry>, RaftError> {
    if !contents.is_empty() && !contents.ends_with('\n') {
        return Err(RaftError::Corruption(format!("{}: torn trailing record", path.display())));
    }

    let mut entries = Vec::new();
    for (line_no, line) in contents.lines().enumerate() {
        let (sum, json) = line.split_once(' ').ok_or_else(|| {
            RaftError::Corruption(format!("{}:{}: malformed record", path.display(), line_no + 1))
        })?;
        if checksum(json.as_bytes()) != sum {
            return Err(RaftError::Corruption(format!(
                "{}:{}: checksum mismatch",
                path.display(),
                line_no + 1
            )));
        }
        let entry: LogEntry = serde_json::from_str(json).map_err(|e| {
            RaftError::Corruption(format!("{}:{}: {}", path.display(), line_no + 1, e))
        })?;
        if let Some(prev) = entries.last().map(|e: &LogEntry| e.index) {
            if entry.index != prev + 1 {
                return Err(RaftError::Corruption(format!(
                    "{}: index {} follows {}",
                    path.display(),
                    entry.index,
                    prev
                )));
            }
        }
        entries.push(entry);
    }
    Ok(entries)
}

async fn read_segment_file(path: &Path) -> Result<Vec<LogEntry>, RaftError> {
    let bytes = fs::read(path).await?;
    let contents = String::from_utf8(bytes)
        .map_err(|e| RaftError::Corruption(format!("{}: not valid UTF-8 ({})", path.display(), e.utf8_error())))?;
    decode_segment(path, &contents)
}

/// Make renames and removals inside `dir` durable.
#[cfg(unix)]
async fn sync_dir(dir: &Path) -> Result<(), RaftError> {
    fs::File::open(dir).await?.sync_all().await?;
    Ok(())
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> Result<(), RaftError> {
    Ok(())
}

async fn write_atomic(dir: &Path, name: &str, bytes: &[u8]) -> Result<(), RaftError> {
    let temp_path = dir.join(format!("{}.tmp", name));
    let mut file = fs::File::create(&temp_path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(&temp_path, dir.join(name)).await?;
    sync_dir(dir).await
}

impl FileStorage {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, RaftError> {
        Self::open_with_capacity(dir, DEFAULT_SEGMENT_CAPACITY).await
    }

    pub async fn open_with_capacity(dir: impl Into<PathBuf>, segment_capacity: u64) -> Result<Self, RaftError> {
        let dir = dir.into();
        if segment_capacity == 0 {
            return Err(RaftError::Configuration("segment capacity must be positive".into()));
        }
        fs::create_dir_all(&dir).await?;

        let mut storage = Self {
            dir,
            segment_capacity,
            segments: Vec::new(),
            hard_state: HardState::default(),
            snapshot_index: 0,
        };

        storage.hard_state = storage.read_hard_state().await?;
        if let Some(snapshot) = storage.read_snapshot().await? {
            storage.snapshot_index = snapshot.last_included_index;
        }
        storage.scan_segments().await?;

        info!(
            "Opened log store at {} ({} segments, snapshot through {})",
            storage.dir.display(),
            storage.segments.len(),
            storage.snapshot_index
        );
        Ok(storage)
    }

    fn segment_path(&self, first_index: Index) -> PathBuf {
        self.dir.join(format!("{:020}.{}", first_index, SEGMENT_EXT))
    }

    async fn read_hard_state(&self) -> Result<HardState, RaftError> {
        let path = self.dir.join(META_FILE);
        if !fs::try_exists(&path).await? {
            return Ok(HardState::default());
        }
        let contents = fs::read(&path).await?;
        serde_json::from_slice(&contents)
            .map_err(|e| RaftError::Corruption(format!("{}: {}", path.display(), e)))
    }

    async fn read_snapshot(&self) -> Result<Option<Snapshot>, RaftError> {
        let path = self.dir.join(SNAPSHOT_FILE);
        if !fs::try_exists(&path).await? {
            return Ok(None);
        }
        let contents = fs::read(&path).await?;
        let split = contents
            .iter()
            .position(|b| *b == b'\n')
            .ok_or_else(|| RaftError::Corruption(format!("{}: missing header", path.display())))?;
        let header: SnapshotHeader = serde_json::from_slice(&contents[..split])
            .map_err(|e| RaftError::Corruption(format!("{}: {}", path.display(), e)))?;
        let data = contents[split + 1..].to_vec();
        if checksum(&data) != header.checksum {
            return Err(RaftError::Corruption(format!("{}: checksum mismatch", path.display())));
        }

        Ok(Some(Snapshot {
            last_included_index: header.last_included_index,
            last_included_term: header.last_included_term,
            data,
        }))
    }

    async fn scan_segments(&mut self) -> Result<(), RaftError> {
        let mut firsts = Vec::new();
        let mut dir = fs::read_dir(&self.dir).await?;
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SEGMENT_EXT) {
                continue;
            }
            let first = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<Index>().ok())
                .ok_or_else(|| RaftError::Corruption(format!("unexpected segment name {}", path.display())))?;
            firsts.push(first);
        }
        firsts.sort_unstable();

        let mut segments: Vec<Segment> = Vec::new();
        for first in firsts {
            let path = self.segment_path(first);
            let entries = read_segment_file(&path).await?;
            let last = match (entries.first(), entries.last()) {
                (Some(head), Some(tail)) => {
                    if head.index != first {
                        return Err(RaftError::Corruption(format!(
                            "{} starts at index {}",
                            path.display(),
                            head.index
                        )));
                    }
                    tail.index
                }
                _ => {
                    // An empty segment carries nothing; drop it.
                    fs::remove_file(&path).await?;
                    continue;
                }
            };
            if let Some(prev) = segments.last() {
                if first != prev.last_index + 1 {
                    return Err(RaftError::Corruption(format!(
                        "segment {} does not follow index {}",
                        path.display(),
                        prev.last_index
                    )));
                }
            }
            segments.push(Segment {
                first_index: first,
                last_index: last,
                path,
            });
        }

        if let Some(head) = segments.first() {
            if head.first_index > self.snapshot_index + 1 {
                return Err(RaftError::Corruption(format!(
                    "log starts at {} but snapshot ends at {}",
                    head.first_index, self.snapshot_index
                )));
            }
        }

        self.segments = segments;
        Ok(())
    }

    async fn read_segment(&self, segment: &Segment) -> Result<Vec<LogEntry>, RaftError> {
        read_segment_file(&segment.path).await
    }

    async fn write_segment(&self, first_index: Index, entries: &[LogEntry]) -> Result<(), RaftError> {
        let mut buf = String::new();
        for entry in entries {
            buf.push_str(&encode_record(entry)?);
        }
        let name = format!("{:020}.{}", first_index, SEGMENT_EXT);
        write_atomic(&self.dir, &name, buf.as_bytes()).await
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn get_hard_state(&self) -> Result<HardState, RaftError> {
        Ok(self.hard_state)
    }

    async fn set_hard_state(&mut self, state: HardState) -> Result<(), RaftError> {
        if state == self.hard_state {
            return Ok(());
        }
        let json = serde_json::to_vec_pretty(&state)?;
        write_atomic(&self.dir, META_FILE, &json).await?;
        self.hard_state = state;
        Ok(())
    }

    async fn get_log(&self) -> Result<Vec<LogEntry>, RaftError> {
        let mut log = Vec::new();
        for segment in &self.segments {
            let entries = self.read_segment(segment).await?;
            log.extend(entries.into_iter().filter(|e| e.index > self.snapshot_index));
        }
        Ok(log)
    }

    async fn append_log(&mut self, entries: &[LogEntry]) -> Result<(), RaftError> {
        let mut remaining = entries;
        while let Some(first) = remaining.first() {
            let needs_new = match self.segments.last() {
                Some(segment) => segment.len() >= self.segment_capacity,
                None => true,
            };
            if needs_new {
                let path = self.segment_path(first.index);
                self.segments.push(Segment {
                    first_index: first.index,
                    last_index: first.index - 1,
                    path,
                });
            }

            let segment = self
                .segments
                .last_mut()
                .ok_or_else(|| RaftError::Storage("no open segment".into()))?;
            if first.index != segment.last_index + 1 {
                return Err(RaftError::Storage(format!(
                    "append of index {} does not follow {}",
                    first.index, segment.last_index
                )));
            }
            let room = (self.segment_capacity - segment.len()) as usize;
            let take = room.min(remaining.len());
            let (batch, rest) = remaining.split_at(take);

            let mut buf = String::new();
            for entry in batch {
                buf.push_str(&encode_record(entry)?);
            }
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&segment.path)
                .await?;
            file.write_all(buf.as_bytes()).await?;
            file.sync_data().await?;

            segment.last_index += take as Index;
            remaining = rest;
        }
        Ok(())
    }

    async fn truncate_log(&mut self, from_index: Index) -> Result<(), RaftError> {
        while let Some(segment) = self.segments.last().cloned() {
            if segment.first_index >= from_index {
                fs::remove_file(&segment.path).await?;
                self.segments.pop();
                continue;
            }
            if segment.last_index >= from_index {
                let kept: Vec<LogEntry> = self
                    .read_segment(&segment)
                    .await?
                    .into_iter()
                    .filter(|e| e.index < from_index)
                    .collect();
                self.write_segment(segment.first_index, &kept).await?;
                if let Some(last) = self.segments.last_mut() {
                    last.last_index = from_index - 1;
                }
            }
            break;
        }
        sync_dir(&self.dir).await?;
        debug!("Truncated log from index {}", from_index);
        Ok(())
    }

    async fn get_snapshot(&self) -> Result<Option<Snapshot>, RaftError> {
        self.read_snapshot().await
    }

    async fn save_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), RaftError> {
        let header = SnapshotHeader {
            last_included_index: snapshot.last_included_index,
            last_included_term: snapshot.last_included_term,
            checksum: checksum(&snapshot.data),
        };
        let mut bytes = serde_json::to_vec(&header)?;
        bytes.push(b'\n');
        bytes.extend_from_slice(&snapshot.data);
        write_atomic(&self.dir, SNAPSHOT_FILE, &bytes).await?;
        self.snapshot_index = snapshot.last_included_index;

        // Segments entirely covered by the snapshot are no longer needed.
        let mut kept = Vec::with_capacity(self.segments.len());
        for segment in std::mem::take(&mut self.segments) {
            if segment.last_index <= snapshot.last_included_index {
                fs::remove_file(&segment.path).await?;
            } else {
                kept.push(segment);
            }
        }
        self.segments = kept;
        sync_dir(&self.dir).await?;

        info!("Saved snapshot through index {}", snapshot.last_included_index);
        Ok(())
    }
}
