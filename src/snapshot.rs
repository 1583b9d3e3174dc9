use crate::model::{AuditEvent, ConfigEntry, Namespace, Timestamp};
use crate::wire::{compress_into, decompress_from};
use crate::{Error, LogIndex, Result, Term};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const MAGIC: &[u8; 8] = b"CFMSNAP\0";

/// Current on-disk format. Version 1 predates the blob side-channel and
/// has no manifest section; readers accept both.
pub const FORMAT_VERSION: u16 = 2;

const SNAPSHOT_SUFFIX: &str = ".snap";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub snapshot_index: LogIndex,
    pub snapshot_term: Term,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone)]
pub struct SnapshotFile {
    pub path: PathBuf,
    pub meta: SnapshotMeta,
}

fn snapshot_path(dir: &Path, index: LogIndex) -> PathBuf {
    dir.join(format!("snapshot-{index:016x}{SNAPSHOT_SUFFIX}"))
}

/// Serialize the full materialized state into `dir`, streaming through a
/// temp file that is atomically renamed once complete. The state never
/// exists as a single in-memory buffer.
pub fn write_snapshot(
    dir: &Path,
    meta: &SnapshotMeta,
    configs: &[ConfigEntry],
    namespaces: &[Namespace],
    audit_events: &[AuditEvent],
    blob_manifest: &[String],
) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let final_path = snapshot_path(dir, meta.snapshot_index);
    let tmp_path = dir.join(format!(
        ".snapshot-{:016x}.tmp-{}",
        meta.snapshot_index,
        std::process::id()
    ));
    let started = std::time::Instant::now();
    {
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(MAGIC)?;
        writer.write_all(&FORMAT_VERSION.to_le_bytes())?;
        let mut encoder = compress_into(writer);
        bincode::serialize_into(&mut encoder, meta)?;
        write_section(&mut encoder, configs)?;
        write_section(&mut encoder, namespaces)?;
        write_section(&mut encoder, audit_events)?;
        write_section(&mut encoder, blob_manifest)?;
        let mut writer = encoder.finish().map_err(|e| Error::Snapshot {
            reason: format!("finish compression: {e}"),
        })?;
        writer.flush()?;
        writer.get_ref().sync_data()?;
    }
    std::fs::rename(&tmp_path, &final_path)?;
    info!(
        index = meta.snapshot_index,
        configs = configs.len(),
        namespaces = namespaces.len(),
        audit_events = audit_events.len(),
        blobs = blob_manifest.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "snapshot written"
    );
    Ok(final_path)
}

fn write_section<W: Write, T: Serialize>(writer: &mut W, records: &[T]) -> Result<()> {
    bincode::serialize_into(&mut *writer, &(records.len() as u64))?;
    for record in records {
        bincode::serialize_into(&mut *writer, record)?;
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Configs,
    Namespaces,
    AuditEvents,
    BlobManifest,
    Done,
}

/// Streaming decoder. Sections must be drained in order; `next_*_chunk`
/// returns `None` once its section is exhausted.
pub struct SnapshotReader {
    decoder: lz4_flex::frame::FrameDecoder<BufReader<File>>,
    pub version: u16,
    pub meta: SnapshotMeta,
    section: Section,
    remaining: u64,
}

impl SnapshotReader {
    pub fn open(path: &Path) -> Result<SnapshotReader> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(Error::Snapshot {
                reason: format!("{} is not a snapshot file", path.display()),
            });
        }
        let mut version_buf = [0u8; 2];
        reader.read_exact(&mut version_buf)?;
        let version = u16::from_le_bytes(version_buf);
        if version == 0 || version > FORMAT_VERSION {
            return Err(Error::Snapshot {
                reason: format!("unsupported snapshot version {version}"),
            });
        }
        let mut decoder = decompress_from(reader);
        let meta: SnapshotMeta = bincode::deserialize_from(&mut decoder).map_err(|e| {
            Error::Snapshot {
                reason: format!("snapshot header: {e}"),
            }
        })?;
        let mut snapshot_reader = SnapshotReader {
            decoder,
            version,
            meta,
            section: Section::Configs,
            remaining: 0,
        };
        snapshot_reader.remaining = snapshot_reader.read_count()?;
        Ok(snapshot_reader)
    }

    fn read_count(&mut self) -> Result<u64> {
        bincode::deserialize_from(&mut self.decoder).map_err(|e| Error::Snapshot {
            reason: format!("section count: {e}"),
        })
    }

    fn advance_section(&mut self) -> Result<()> {
        self.section = match self.section {
            Section::Configs => Section::Namespaces,
            Section::Namespaces => Section::AuditEvents,
            Section::AuditEvents => {
                // Pre-blob snapshots end here; the manifest defaults to
                // empty for them.
                if self.version >= 2 {
                    Section::BlobManifest
                } else {
                    self.remaining = 0;
                    self.section = Section::Done;
                    return Ok(());
                }
            }
            Section::BlobManifest | Section::Done => Section::Done,
        };
        if self.section == Section::Done {
            self.remaining = 0;
        } else {
            self.remaining = self.read_count()?;
        }
        Ok(())
    }

    fn next_chunk<T: DeserializeOwned>(
        &mut self,
        section: Section,
        max: usize,
    ) -> Result<Option<Vec<T>>> {
        while self.section != section {
            // Reaching Done early is fine for sections a pre-blob file
            // simply does not have; they read as empty.
            if self.section == Section::Done {
                return Ok(None);
            }
            if self.remaining > 0 {
                return Err(Error::Snapshot {
                    reason: "snapshot sections read out of order".into(),
                });
            }
            self.advance_section()?;
        }
        if self.remaining == 0 {
            self.advance_section()?;
            return Ok(None);
        }
        let take = (self.remaining).min(max as u64);
        let mut out = Vec::with_capacity(take as usize);
        for _ in 0..take {
            let record: T = bincode::deserialize_from(&mut self.decoder).map_err(|e| {
                Error::Snapshot {
                    reason: format!("snapshot record: {e}"),
                }
            })?;
            out.push(record);
        }
        self.remaining -= take;
        Ok(Some(out))
    }

    pub fn next_configs_chunk(&mut self, max: usize) -> Result<Option<Vec<ConfigEntry>>> {
        self.next_chunk(Section::Configs, max)
    }

    pub fn next_namespaces_chunk(&mut self, max: usize) -> Result<Option<Vec<Namespace>>> {
        self.next_chunk(Section::Namespaces, max)
    }

    pub fn next_audit_chunk(&mut self, max: usize) -> Result<Option<Vec<AuditEvent>>> {
        self.next_chunk(Section::AuditEvents, max)
    }

    pub fn next_manifest_chunk(&mut self, max: usize) -> Result<Option<Vec<String>>> {
        self.next_chunk(Section::BlobManifest, max)
    }
}

/// The most recent complete snapshot in `dir`, if any. Only renamed-in
/// files are considered; temp files from interrupted writes are ignored.
pub fn find_latest(dir: &Path) -> Result<Option<SnapshotFile>> {
    if !dir.exists() {
        return Ok(None);
    }
    let mut best: Option<SnapshotFile> = None;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with("snapshot-") || !name.ends_with(SNAPSHOT_SUFFIX) {
            continue;
        }
        let path = entry.path();
        match SnapshotReader::open(&path) {
            Ok(reader) => {
                if best
                    .as_ref()
                    .map_or(true, |b| reader.meta.snapshot_index > b.meta.snapshot_index)
                {
                    best = Some(SnapshotFile {
                        path,
                        meta: reader.meta,
                    });
                }
            }
            Err(e) => {
                warn!(file = %path.display(), error = %e, "skipping unreadable snapshot");
            }
        }
    }
    Ok(best)
}

/// Remove snapshots older than the newest one, keeping `keep` most recent.
pub fn prune_old(dir: &Path, keep: usize) -> Result<()> {
    let mut files: Vec<(LogIndex, PathBuf)> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let name = e.file_name().to_string_lossy().into_owned();
            let hex = name
                .strip_prefix("snapshot-")?
                .strip_suffix(SNAPSHOT_SUFFIX)?;
            Some((LogIndex::from_str_radix(hex, 16).ok()?, e.path()))
        })
        .collect();
    files.sort_by_key(|(index, _)| std::cmp::Reverse(*index));
    for (_, path) in files.into_iter().skip(keep) {
        std::fs::remove_file(&path)?;
    }
    Ok(())
}

/// Install raw snapshot bytes received from a leader: validate the header,
/// stream to a temp file, atomically rename.
pub fn install_bytes(dir: &Path, bytes: &[u8]) -> Result<SnapshotFile> {
    std::fs::create_dir_all(dir)?;
    let tmp_path = dir.join(format!(".snapshot-install.tmp-{}", std::process::id()));
    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_data()?;
    }
    let meta = match SnapshotReader::open(&tmp_path) {
        Ok(reader) => reader.meta,
        Err(e) => {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(e);
        }
    };
    let final_path = snapshot_path(dir, meta.snapshot_index);
    std::fs::rename(&tmp_path, &final_path)?;
    Ok(SnapshotFile {
        path: final_path,
        meta,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AuditAction, AuditVerb, ResourceType, ValueType};
    use chrono::Utc;

    fn sample_state() -> (Vec<ConfigEntry>, Vec<Namespace>, Vec<AuditEvent>, Vec<String>) {
        let now = Utc::now();
        let configs = (0..500)
            .map(|i| ConfigEntry {
                namespace: format!("ns{}", i % 5),
                key: format!("key{i}"),
                value: Some(format!("value-{i}").into_bytes()),
                blob_id: None,
                value_type: ValueType::String,
                version: i as u64 + 1,
                updated_at: now,
                updated_by: "snapshot-test".into(),
            })
            .collect();
        let namespaces = (0..5)
            .map(|i| Namespace {
                path: format!("ns{i}"),
                description: format!("namespace {i}"),
                owner: "platform".into(),
                created_at: now,
            })
            .collect();
        let audit_events = (0..50)
            .map(|i| {
                let ts = now + chrono::Duration::microseconds(i);
                AuditEvent {
                    id: AuditEvent::deterministic_id(ts, "ns0", &format!("key{i}")),
                    timestamp: ts,
                    action: AuditAction {
                        resource: ResourceType::Config,
                        verb: AuditVerb::Created,
                    },
                    actor: "alice".into(),
                    namespace: "ns0".into(),
                    key: format!("key{i}"),
                    old_value: None,
                    new_value: Some(format!("value-{i}")),
                }
            })
            .collect();
        let manifest = vec!["ab".repeat(32), "cd".repeat(32)];
        (configs, namespaces, audit_events, manifest)
    }

    #[test]
    fn snapshot_round_trips_all_sections() {
        let dir = tempfile::tempdir().unwrap();
        let (configs, namespaces, audit_events, manifest) = sample_state();
        let meta = SnapshotMeta {
            snapshot_index: 1234,
            snapshot_term: 7,
            timestamp: Utc::now(),
        };
        write_snapshot(
            dir.path(),
            &meta,
            &configs,
            &namespaces,
            &audit_events,
            &manifest,
        )
        .unwrap();

        let mut reader = SnapshotReader::open(&snapshot_path(dir.path(), 1234)).unwrap();
        assert_eq!(reader.version, FORMAT_VERSION);
        assert_eq!(reader.meta.snapshot_index, 1234);
        assert_eq!(reader.meta.snapshot_term, 7);

        let mut got_configs = Vec::new();
        while let Some(chunk) = reader.next_configs_chunk(64).unwrap() {
            got_configs.extend(chunk);
        }
        assert_eq!(got_configs, configs);

        let mut got_ns = Vec::new();
        while let Some(chunk) = reader.next_namespaces_chunk(64).unwrap() {
            got_ns.extend(chunk);
        }
        assert_eq!(got_ns, namespaces);

        let mut got_audit = Vec::new();
        while let Some(chunk) = reader.next_audit_chunk(64).unwrap() {
            got_audit.extend(chunk);
        }
        assert_eq!(got_audit, audit_events);

        let mut got_manifest = Vec::new();
        while let Some(chunk) = reader.next_manifest_chunk(64).unwrap() {
            got_manifest.extend(chunk);
        }
        assert_eq!(got_manifest, manifest);
    }

    #[test]
    fn find_latest_prefers_highest_index() {
        let dir = tempfile::tempdir().unwrap();
        let (configs, namespaces, audit_events, manifest) = sample_state();
        for index in [10u64, 50, 30] {
            let meta = SnapshotMeta {
                snapshot_index: index,
                snapshot_term: 1,
                timestamp: Utc::now(),
            };
            write_snapshot(
                dir.path(),
                &meta,
                &configs,
                &namespaces,
                &audit_events,
                &manifest,
            )
            .unwrap();
        }
        let latest = find_latest(dir.path()).unwrap().unwrap();
        assert_eq!(latest.meta.snapshot_index, 50);
    }

    #[test]
    fn sections_must_drain_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let (configs, namespaces, audit_events, manifest) = sample_state();
        let meta = SnapshotMeta {
            snapshot_index: 5,
            snapshot_term: 1,
            timestamp: Utc::now(),
        };
        write_snapshot(
            dir.path(),
            &meta,
            &configs,
            &namespaces,
            &audit_events,
            &manifest,
        )
        .unwrap();
        let mut reader = SnapshotReader::open(&snapshot_path(dir.path(), 5)).unwrap();
        // Jumping ahead while configs remain is a usage error.
        assert!(reader.next_audit_chunk(10).is_err());
    }

    #[test]
    fn install_bytes_round_trip() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let (configs, namespaces, audit_events, manifest) = sample_state();
        let meta = SnapshotMeta {
            snapshot_index: 99,
            snapshot_term: 3,
            timestamp: Utc::now(),
        };
        let path = write_snapshot(
            src.path(),
            &meta,
            &configs,
            &namespaces,
            &audit_events,
            &manifest,
        )
        .unwrap();
        let bytes = std::fs::read(path).unwrap();
        let installed = install_bytes(dst.path(), &bytes).unwrap();
        assert_eq!(installed.meta.snapshot_index, 99);
        assert_eq!(installed.meta.snapshot_term, 3);
        let latest = find_latest(dst.path()).unwrap().unwrap();
        assert_eq!(latest.meta.snapshot_index, 99);
    }

    #[test]
    fn rejects_non_snapshot_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot-0000000000000001.snap");
        std::fs::write(&path, b"definitely not a snapshot").unwrap();
        assert!(SnapshotReader::open(&path).is_err());
        assert!(find_latest(dir.path()).unwrap().is_none());
    }

    #[test]
    fn prune_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        let (configs, namespaces, audit_events, manifest) = sample_state();
        for index in [1u64, 2, 3, 4] {
            let meta = SnapshotMeta {
                snapshot_index: index,
                snapshot_term: 1,
                timestamp: Utc::now(),
            };
            write_snapshot(
                dir.path(),
                &meta,
                &configs,
                &namespaces,
                &audit_events,
                &manifest,
            )
            .unwrap();
        }
        prune_old(dir.path(), 2).unwrap();
        let remaining: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().any(|n| n.contains("0000000000000004")));
        assert!(remaining.iter().any(|n| n.contains("0000000000000003")));
    }
}
