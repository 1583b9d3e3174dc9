use super::validate_blob_id;
use crate::wire::{compress_into, decompress_from};
use crate::{Error, Result};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

const HASH_CHUNK: usize = 64 * 1024;

#[derive(Debug, Default, Clone, Copy)]
pub struct GcStats {
    pub examined: usize,
    pub deleted: usize,
    pub kept_young: usize,
}

/// Content-addressed local blob store: `<root>/<xx>/<sha256-hex>`, each
/// file LZ4-compressed. Files are immutable once placed; concurrent
/// writers of the same id race harmlessly because the rename target is
/// byte-identical.
#[derive(Debug)]
pub struct BlobStore {
    root: PathBuf,
    max_blob_size: u64,
}

impl BlobStore {
    pub fn open(root: &Path, max_blob_size: u64) -> Result<BlobStore> {
        std::fs::create_dir_all(root)?;
        Ok(BlobStore {
            root: root.to_path_buf(),
            max_blob_size,
        })
    }

    fn blob_path(&self, id: &str) -> PathBuf {
        self.root.join(&id[..2]).join(id)
    }

    fn temp_path(&self, id: &str) -> PathBuf {
        self.root.join(format!(
            ".tmp-{}-{}-{id}",
            std::process::id(),
            uuid::Uuid::new_v4().simple()
        ))
    }

    pub fn contains(&self, id: &str) -> bool {
        validate_blob_id(id).is_ok() && self.blob_path(id).exists()
    }

    pub fn max_blob_size(&self) -> u64 {
        self.max_blob_size
    }

    /// Store an uncompressed value: one pass computes the SHA-256 and the
    /// compressed file simultaneously, then an atomic rename publishes it.
    /// Returns the blob id and the compressed size.
    pub fn put_value(&self, value: &[u8]) -> Result<(String, u64)> {
        if value.len() as u64 > self.max_blob_size {
            return Err(Error::ValueTooLarge {
                size: value.len() as u64,
                max: self.max_blob_size,
            });
        }
        let mut hasher = Sha256::new();
        let probe = self.temp_path("pending");
        let file = File::create(&probe)?;
        let mut encoder = compress_into(BufWriter::new(file));
        for chunk in value.chunks(HASH_CHUNK) {
            hasher.update(chunk);
            encoder.write_all(chunk)?;
        }
        let mut writer = encoder.finish().map_err(|e| Error::Durability {
            reason: format!("compress blob: {e}"),
        })?;
        writer.flush()?;
        writer.get_ref().sync_data()?;
        let compressed_len = writer.get_ref().metadata()?.len();
        drop(writer);

        let id = hex::encode(hasher.finalize());
        let final_path = self.blob_path(&id);
        std::fs::create_dir_all(final_path.parent().expect("blob path has a shard dir"))?;
        std::fs::rename(&probe, &final_path)?;
        debug!(blob_id = %id, bytes = value.len(), compressed = compressed_len, "blob stored");
        Ok((id, compressed_len))
    }

    /// Store a blob received in compressed form. The content hash is
    /// verified after decompression before the file is published.
    pub fn put_compressed(&self, id: &str, compressed: &[u8]) -> Result<()> {
        validate_blob_id(id)?;
        let mut hasher = Sha256::new();
        let mut decoder = decompress_from(compressed);
        let mut buf = vec![0u8; HASH_CHUNK];
        let mut total = 0u64;
        loop {
            let n = decoder.read(&mut buf)?;
            if n == 0 {
                break;
            }
            total += n as u64;
            if total > self.max_blob_size {
                return Err(Error::ValueTooLarge {
                    size: total,
                    max: self.max_blob_size,
                });
            }
            hasher.update(&buf[..n]);
        }
        let computed = hex::encode(hasher.finalize());
        if computed != id {
            return Err(Error::BlobIntegrity {
                blob_id: id.to_string(),
                computed,
            });
        }
        let tmp = self.temp_path(id);
        {
            let mut file = File::create(&tmp)?;
            file.write_all(compressed)?;
            file.sync_data()?;
        }
        let final_path = self.blob_path(id);
        std::fs::create_dir_all(final_path.parent().expect("blob path has a shard dir"))?;
        std::fs::rename(&tmp, &final_path)?;
        Ok(())
    }

    /// Read and decompress a blob, verifying its content hash. A mismatch
    /// deletes the corrupt file so the next read refetches it.
    pub fn read_value(&self, id: &str) -> Result<Vec<u8>> {
        validate_blob_id(id)?;
        let path = self.blob_path(id);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::BlobUnavailable(id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let mut decoder = decompress_from(BufReader::new(file));
        let mut value = Vec::new();
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; HASH_CHUNK];
        loop {
            let n = decoder.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            value.extend_from_slice(&buf[..n]);
        }
        let computed = hex::encode(hasher.finalize());
        if computed != id {
            warn!(blob_id = %id, computed = %computed, "local blob failed verification, discarding");
            let _ = std::fs::remove_file(&path);
            return Err(Error::BlobIntegrity {
                blob_id: id.to_string(),
                computed,
            });
        }
        Ok(value)
    }

    /// The stored (compressed) bytes, for serving to peers.
    pub fn read_compressed(&self, id: &str) -> Result<Vec<u8>> {
        validate_blob_id(id)?;
        match std::fs::read(self.blob_path(id)) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::BlobUnavailable(id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn remove(&self, id: &str) -> Result<()> {
        validate_blob_id(id)?;
        match std::fs::remove_file(self.blob_path(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Mark-and-sweep pass. `live` is the union of every blob id the
    /// materialized store references; anything else older than `grace`
    /// is deleted. Temp files from dead writers are swept the same way.
    pub fn gc_sweep(&self, live: &HashSet<String>, grace: Duration) -> Result<GcStats> {
        let mut stats = GcStats::default();
        let cutoff = SystemTime::now()
            .checked_sub(grace)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        for shard in std::fs::read_dir(&self.root)? {
            let shard = shard?;
            let shard_path = shard.path();
            let name = shard.file_name().to_string_lossy().into_owned();
            if name.starts_with(".tmp-") {
                if modified_before(&shard_path, cutoff) {
                    let _ = std::fs::remove_file(&shard_path);
                    stats.deleted += 1;
                }
                continue;
            }
            if !shard_path.is_dir() {
                continue;
            }
            for entry in std::fs::read_dir(&shard_path)? {
                let entry = entry?;
                let id = entry.file_name().to_string_lossy().into_owned();
                stats.examined += 1;
                if live.contains(&id) {
                    continue;
                }
                if modified_before(&entry.path(), cutoff) {
                    let _ = std::fs::remove_file(entry.path());
                    stats.deleted += 1;
                } else {
                    stats.kept_young += 1;
                }
            }
        }
        if stats.deleted > 0 {
            info!(
                examined = stats.examined,
                deleted = stats.deleted,
                "blob gc sweep complete"
            );
        }
        Ok(stats)
    }
}

fn modified_before(path: &Path, cutoff: SystemTime) -> bool {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map(|m| m < cutoff)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store(dir: &tempfile::TempDir) -> BlobStore {
        BlobStore::open(dir.path(), 16 * 1024 * 1024).unwrap()
    }

    #[test]
    fn put_then_read_round_trips_and_hashes() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let value: Vec<u8> = (0..200_000u32).flat_map(|i| i.to_le_bytes()).collect();
        let (id, compressed_len) = store.put_value(&value).unwrap();
        assert_eq!(id, hex::encode(Sha256::digest(&value)));
        assert!(compressed_len < value.len() as u64);
        assert!(store.contains(&id));
        assert_eq!(store.read_value(&id).unwrap(), value);
    }

    #[test]
    fn duplicate_puts_converge_on_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let (id1, _) = store.put_value(b"same bytes").unwrap();
        let (id2, _) = store.put_value(b"same bytes").unwrap();
        assert_eq!(id1, id2);
        let shard = dir.path().join(&id1[..2]);
        assert_eq!(std::fs::read_dir(shard).unwrap().count(), 1);
    }

    #[test]
    fn compressed_transfer_round_trip() {
        let dir1 = tempfile::tempdir().unwrap();
        let dir2 = tempfile::tempdir().unwrap();
        let src = open_store(&dir1);
        let dst = open_store(&dir2);
        let value = vec![42u8; 100_000];
        let (id, _) = src.put_value(&value).unwrap();
        let compressed = src.read_compressed(&id).unwrap();
        dst.put_compressed(&id, &compressed).unwrap();
        assert_eq!(dst.read_value(&id).unwrap(), value);
    }

    #[test]
    fn put_compressed_rejects_wrong_hash() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let compressed = crate::wire::compress_bytes(b"actual contents").unwrap();
        let bogus_id = "ab".repeat(32);
        let err = store.put_compressed(&bogus_id, &compressed).unwrap_err();
        assert!(matches!(err, Error::BlobIntegrity { .. }));
        assert!(!store.contains(&bogus_id));
    }

    #[test]
    fn corrupted_file_is_discarded_on_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let (id, _) = store.put_value(b"these bytes will rot").unwrap();
        // Overwrite with a valid LZ4 frame of different content.
        let forged = crate::wire::compress_bytes(b"rotten").unwrap();
        std::fs::write(dir.path().join(&id[..2]).join(&id), forged).unwrap();
        let err = store.read_value(&id).unwrap_err();
        assert!(matches!(err, Error::BlobIntegrity { .. }));
        assert!(!store.contains(&id));
    }

    #[test]
    fn oversized_values_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path(), 1024).unwrap();
        let err = store.put_value(&vec![0u8; 2048]).unwrap_err();
        assert!(matches!(err, Error::ValueTooLarge { .. }));
    }

    #[test]
    fn gc_spares_live_and_young_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let (live_id, _) = store.put_value(b"still referenced").unwrap();
        let (dead_id, _) = store.put_value(b"orphaned").unwrap();

        let mut live = HashSet::new();
        live.insert(live_id.clone());

        // Everything is young: nothing is deleted.
        let stats = store
            .gc_sweep(&live, Duration::from_secs(3600))
            .unwrap();
        assert_eq!(stats.deleted, 0);
        assert_eq!(stats.kept_young, 1);

        // Once the files age past the grace period the orphan goes and
        // the live blob stays.
        std::thread::sleep(Duration::from_millis(25));
        let stats = store.gc_sweep(&live, Duration::from_millis(5)).unwrap();
        assert_eq!(stats.deleted, 1);
        assert!(store.contains(&live_id));
        assert!(!store.contains(&dead_id));
    }
}
