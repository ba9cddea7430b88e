//! On-disk archive layout and the shard writer.
//!
//! Per log directory: `sth.json` (the trusted STH), `resume.json` (open-shard
//! high-water mark plus the full-tree builder's subroot stack), and
//! `shards/NNNNNNNN.bin` data files with their `NNNNNNNN.manifest.json`
//! manifests. Shard data is a concatenation of length-prefixed records
//! (`u24 leaf || u24 extra_data`, TLS `opaque<0..2^24-1>` framing), so files
//! are self-delimiting.
//!
//! Durability contract: a leaf is fsynced to the data file before its index
//! appears in any manifest, and every piece of JSON state is replaced
//! atomically via temp file + rename + directory fsync.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::entry::Entry;
use crate::error::MirrorError;
use crate::merkle::TreeBuilder;
use crate::sth::SignedTreeHead;
use crate::{leaf_hash, Hash};

pub const DEFAULT_SHARD_SIZE: u64 = 65_536;

const RECORD_LEN_MAX: usize = (1 << 24) - 1;

fn shard_file_name(shard_no: u64) -> String {
    format!("{shard_no:08}.bin")
}

fn manifest_file_name(shard_no: u64) -> String {
    format!("{shard_no:08}.manifest.json")
}

fn corrupt(msg: String) -> MirrorError {
    MirrorError::Disk(std::io::Error::new(ErrorKind::InvalidData, msg))
}

/// Manifest of a sealed shard; what the packager consumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardManifest {
    pub first_index: u64,
    pub last_index: u64,
    pub count: u64,
    /// Data file name within the `shards/` directory.
    pub data_file: String,
    pub data_len: u64,
    /// Merkle root over this shard's leaves alone, for auditability.
    #[serde(with = "crate::b64")]
    pub subroot: Hash,
}

/// State persisted at COMMIT for the shard left open by a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeState {
    /// One past the last committed index; always equals the trusted STH's
    /// tree size at rest.
    pub high_water: u64,
    /// Full-tree builder state at the high-water mark.
    pub tree: TreeBuilder,
}

/// One log's archive directory.
#[derive(Debug, Clone)]
pub struct Archive {
    root: PathBuf,
    log_dir: PathBuf,
    shards_dir: PathBuf,
    shard_size: u64,
}

impl Archive {
    pub fn open(root: &Path, log_name: &str, shard_size: u64) -> Result<Self, MirrorError> {
        if shard_size < 2 || !shard_size.is_power_of_two() {
            return Err(MirrorError::Config(format!(
                "shard size {shard_size} is not a power of two >= 2"
            )));
        }
        let log_dir = root.join(log_name);
        let shards_dir = log_dir.join("shards");
        fs::create_dir_all(&shards_dir)?;
        Ok(Self {
            root: root.to_path_buf(),
            log_dir,
            shards_dir,
            shard_size,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn shards_dir(&self) -> &Path {
        &self.shards_dir
    }

    pub fn shard_size(&self) -> u64 {
        self.shard_size
    }

    pub fn shard_data_path(&self, manifest: &ShardManifest) -> PathBuf {
        self.shards_dir.join(&manifest.data_file)
    }

    pub fn shard_manifest_path(&self, manifest: &ShardManifest) -> PathBuf {
        self.shards_dir
            .join(manifest_file_name(manifest.first_index / self.shard_size))
    }

    fn sth_path(&self) -> PathBuf {
        self.log_dir.join("sth.json")
    }

    fn resume_path(&self) -> PathBuf {
        self.log_dir.join("resume.json")
    }

    pub fn load_trusted_sth(&self) -> Result<Option<SignedTreeHead>, MirrorError> {
        read_json_opt(&self.sth_path())
    }

    /// Atomically replace the trusted STH.
    pub fn store_trusted_sth(&self, sth: &SignedTreeHead) -> Result<(), MirrorError> {
        write_json_atomic(&self.sth_path(), sth)
    }

    pub fn load_resume(&self) -> Result<Option<ResumeState>, MirrorError> {
        read_json_opt(&self.resume_path())
    }

    pub fn store_resume(&self, state: &ResumeState) -> Result<(), MirrorError> {
        write_json_atomic(&self.resume_path(), state)
    }

    pub fn clear_resume(&self) -> Result<(), MirrorError> {
        match fs::remove_file(self.resume_path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// All sealed shard manifests, ordered by first index.
    pub fn sealed_manifests(&self) -> Result<Vec<ShardManifest>, MirrorError> {
        let mut manifests = Vec::new();
        for dirent in fs::read_dir(&self.shards_dir)? {
            let path = dirent?.path();
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if !name.ends_with(".manifest.json") {
                continue;
            }
            let manifest: ShardManifest = read_json_opt(&path)?
                .ok_or_else(|| corrupt(format!("manifest vanished: {}", path.display())))?;
            manifests.push(manifest);
        }
        manifests.sort_by_key(|m| m.first_index);
        Ok(manifests)
    }

    /// Rebuild the full-tree builder by streaming the first `up_to` archived
    /// leaves back off disk. Used when `resume.json` is missing or does not
    /// match the trusted STH.
    pub fn rebuild_tree(&self, up_to: u64) -> Result<TreeBuilder, MirrorError> {
        let mut builder = TreeBuilder::new();
        let mut shard_no = 0;
        while builder.size() < up_to {
            let path = self.shards_dir.join(shard_file_name(shard_no));
            if !path.exists() {
                return Err(corrupt(format!(
                    "archive holds {} of {up_to} leaves; {} is missing",
                    builder.size(),
                    path.display()
                )));
            }
            let mut in_shard = 0;
            for record in ShardReader::open(&path)? {
                let (leaf, _extra) = record?;
                builder.push(leaf_hash(&leaf));
                in_shard += 1;
                if builder.size() == up_to {
                    break;
                }
            }
            if builder.size() < up_to && in_shard < self.shard_size {
                return Err(corrupt(format!(
                    "shard {shard_no} holds {in_shard} of {} records",
                    self.shard_size
                )));
            }
            shard_no += 1;
        }
        Ok(builder)
    }
}

/// Sequential reader over a shard data file.
pub struct ShardReader {
    reader: BufReader<File>,
}

impl ShardReader {
    pub fn open(path: &Path) -> Result<Self, MirrorError> {
        Ok(Self {
            reader: BufReader::new(File::open(path)?),
        })
    }

    fn read_len(&mut self, at_boundary: bool) -> Result<Option<usize>, MirrorError> {
        let mut prefix = [0u8; 3];
        let mut got = 0;
        while got < 3 {
            match self.reader.read(&mut prefix[got..]) {
                Ok(0) if got == 0 && at_boundary => return Ok(None),
                Ok(0) => return Err(corrupt("shard record truncated".into())),
                Ok(n) => got += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(Some(u32::from_be_bytes([0, prefix[0], prefix[1], prefix[2]]) as usize))
    }

    fn read_field(&mut self, len: usize) -> Result<Vec<u8>, MirrorError> {
        let mut buf = vec![0u8; len];
        self.reader
            .read_exact(&mut buf)
            .map_err(|_| corrupt("shard record truncated".into()))?;
        Ok(buf)
    }
}

impl Iterator for ShardReader {
    type Item = Result<(Vec<u8>, Vec<u8>), MirrorError>;

    fn next(&mut self) -> Option<Self::Item> {
        let leaf_len = match self.read_len(true) {
            Ok(None) => return None,
            Ok(Some(len)) => len,
            Err(e) => return Some(Err(e)),
        };
        let result = (|| {
            let leaf = self.read_field(leaf_len)?;
            let extra_len = self
                .read_len(false)?
                .expect("read_len only yields None at a record boundary");
            let extra = self.read_field(extra_len)?;
            Ok((leaf, extra))
        })();
        Some(result)
    }
}

/// Appends verified entries to the current shard, sealing and manifesting it
/// whenever a write crosses the shard boundary. Writes are strictly
/// sequential; sealed shards are never reopened.
pub struct ShardWriter {
    shards_dir: PathBuf,
    shard_size: u64,
    next_index: u64,
    current: Option<OpenShard>,
}

struct OpenShard {
    file: File,
    first_index: u64,
    count: u64,
    bytes: u64,
    builder: TreeBuilder,
}

impl ShardWriter {
    /// Position the writer at `next_index`. If that lands mid-shard, the
    /// existing data file is scanned up to the high-water mark, its subroot
    /// builder is reconstructed from the scan, and anything beyond (from an
    /// aborted run) is truncated away.
    pub fn resume(archive: &Archive, next_index: u64) -> Result<Self, MirrorError> {
        let shard_size = archive.shard_size();
        let shard_start = next_index - next_index % shard_size;
        let mut writer = Self {
            shards_dir: archive.shards_dir().to_path_buf(),
            shard_size,
            next_index,
            current: None,
        };
        if next_index > shard_start {
            let path = writer.shards_dir.join(shard_file_name(shard_start / shard_size));
            let expected = next_index - shard_start;
            let mut builder = TreeBuilder::new();
            let mut offset = 0u64;
            let mut reader = ShardReader::open(&path)?;
            while builder.size() < expected {
                match reader.next() {
                    Some(Ok((leaf, extra))) => {
                        builder.push(leaf_hash(&leaf));
                        offset += 6 + leaf.len() as u64 + extra.len() as u64;
                    }
                    Some(Err(e)) => return Err(e),
                    None => {
                        return Err(corrupt(format!(
                            "open shard holds {} of {expected} committed records",
                            builder.size()
                        )))
                    }
                }
            }
            drop(reader);

            let mut file = OpenOptions::new().write(true).open(&path)?;
            file.set_len(offset)?;
            file.seek(SeekFrom::End(0))?;
            writer.current = Some(OpenShard {
                file,
                first_index: shard_start,
                count: expected,
                bytes: offset,
                builder,
            });
        }
        Ok(writer)
    }

    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    /// Append one entry; returns the manifest when this write seals a shard.
    pub fn append(&mut self, entry: &Entry) -> Result<Option<ShardManifest>, MirrorError> {
        debug_assert_eq!(entry.index, self.next_index);
        if self.current.is_none() {
            let shard_no = self.next_index / self.shard_size;
            let path = self.shards_dir.join(shard_file_name(shard_no));
            self.current = Some(OpenShard {
                file: File::create(path)?,
                first_index: self.next_index,
                count: 0,
                bytes: 0,
                builder: TreeBuilder::new(),
            });
        }

        let shard = self.current.as_mut().expect("just ensured");
        let record = encode_record(entry)?;
        shard.file.write_all(&record)?;
        shard.builder.push(entry.leaf_hash);
        shard.count += 1;
        shard.bytes += record.len() as u64;
        self.next_index += 1;

        if self.next_index % self.shard_size == 0 {
            return self.seal().map(Some);
        }
        Ok(None)
    }

    fn seal(&mut self) -> Result<ShardManifest, MirrorError> {
        let shard = self.current.take().expect("seal with no open shard");
        shard.file.sync_all()?;
        let shard_no = shard.first_index / self.shard_size;
        let manifest = ShardManifest {
            first_index: shard.first_index,
            last_index: shard.first_index + shard.count - 1,
            count: shard.count,
            data_file: shard_file_name(shard_no),
            data_len: shard.bytes,
            subroot: shard.builder.root(),
        };
        write_json_atomic(&self.shards_dir.join(manifest_file_name(shard_no)), &manifest)?;
        Ok(manifest)
    }

    /// Fsync the open shard's data file, if any. Called before resume state
    /// is committed so every recorded leaf is durable first.
    pub fn sync_open(&self) -> Result<(), MirrorError> {
        if let Some(shard) = &self.current {
            shard.file.sync_all()?;
        }
        Ok(())
    }
}

fn encode_record(entry: &Entry) -> Result<Vec<u8>, MirrorError> {
    if entry.leaf_bytes.len() > RECORD_LEN_MAX || entry.extra_data.len() > RECORD_LEN_MAX {
        return Err(MirrorError::decode(entry.index, "entry exceeds 2^24-1 bytes"));
    }
    let mut out = Vec::with_capacity(6 + entry.leaf_bytes.len() + entry.extra_data.len());
    out.extend_from_slice(&(entry.leaf_bytes.len() as u32).to_be_bytes()[1..]);
    out.extend_from_slice(&entry.leaf_bytes);
    out.extend_from_slice(&(entry.extra_data.len() as u32).to_be_bytes()[1..]);
    out.extend_from_slice(&entry.extra_data);
    Ok(out)
}

fn read_json_opt<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, MirrorError> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&raw)
        .map(Some)
        .map_err(|e| corrupt(format!("{}: {e}", path.display())))
}

/// Write JSON durably: temp file in the same directory, fsync, rename over
/// the target, fsync the directory.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), MirrorError> {
    let dir = path
        .parent()
        .ok_or_else(|| MirrorError::Config(format!("{} has no parent", path.display())))?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| MirrorError::Config(format!("{} has no file name", path.display())))?;
    let tmp = dir.join(format!(".{file_name}.tmp"));

    let mut file = File::create(&tmp)?;
    serde_json::to_writer(&mut file, value)
        .map_err(|e| corrupt(format!("serializing {}: {e}", path.display())))?;
    file.flush()?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp, path)?;
    File::open(dir)?.sync_all()?;
    Ok(())
}
