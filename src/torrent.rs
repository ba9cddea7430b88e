//! The packager: BEP 3 torrent metainfo, magnet links, and the per-log RSS
//! feed for every sealed shard.
//!
//! Failures here never invalidate the archive; the caller logs them and
//! moves on. Sealed shards are immutable, so re-running the packager over
//! the same manifests reproduces identical torrents.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use sha1::{Digest, Sha1};
use tracing::info;

use crate::error::MirrorError;
use crate::shard::{Archive, ShardManifest};

/// Piece length floor; 32 KiB.
const MIN_PIECE_LENGTH: u64 = 1 << 15;
/// Aim for roughly this many pieces per torrent.
const TARGET_PIECE_COUNT: u64 = 1500;

/// Settings the packager needs beyond the archive itself.
#[derive(Debug, Clone)]
pub struct PackagerConfig {
    pub torrent_dir: PathBuf,
    /// HTTP prefix under which the operator serves the `.torrent` files;
    /// referenced from the RSS enclosures.
    pub download_url: String,
    pub trackers: Vec<String>,
    /// Seed peers in `host:port` form (BEP 9 `x.pe`).
    pub peers: Vec<String>,
    /// AS number announced in the torrent comment, if any.
    pub asn: Option<u32>,
}

/// What one packaged shard produced.
#[derive(Debug, Clone)]
pub struct PackagedShard {
    pub shard_no: u64,
    pub torrent_file: String,
    pub info_hash: [u8; 20],
    pub magnet: String,
    pub total_len: u64,
}

/// Bencode values per BEP 3. Dictionary keys sort lexicographically, which
/// `BTreeMap` gives us for free.
enum Bencode {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Bencode>),
    Dict(BTreeMap<Vec<u8>, Bencode>),
}

impl Bencode {
    fn str(s: &str) -> Self {
        Self::Bytes(s.as_bytes().to_vec())
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Self::Int(i) => {
                out.push(b'i');
                out.extend_from_slice(i.to_string().as_bytes());
                out.push(b'e');
            }
            Self::Bytes(bytes) => {
                out.extend_from_slice(bytes.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(bytes);
            }
            Self::List(items) => {
                out.push(b'l');
                for item in items {
                    item.encode_into(out);
                }
                out.push(b'e');
            }
            Self::Dict(map) => {
                out.push(b'd');
                for (key, value) in map {
                    Self::Bytes(key.clone()).encode_into(out);
                    value.encode_into(out);
                }
                out.push(b'e');
            }
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }
}

/// Package every manifest, logging and skipping per-shard failures.
pub fn package_shards(
    config: &PackagerConfig,
    archive: &Archive,
    log_name: &str,
    manifests: &[ShardManifest],
) -> Result<Vec<PackagedShard>, MirrorError> {
    fs::create_dir_all(&config.torrent_dir)?;
    let mut packaged = Vec::new();
    for manifest in manifests {
        match package_shard(config, archive, log_name, manifest) {
            Ok(shard) => {
                info!(log = log_name, torrent = %shard.torrent_file, "wrote torrent");
                packaged.push(shard);
            }
            Err(e) => {
                // The archive stays valid; this shard is picked up again by
                // the next run or by `rebuild-torrents`.
                tracing::error!(log = log_name, first = manifest.first_index, error = %e,
                    "packaging shard failed");
            }
        }
    }
    if !packaged.is_empty() {
        merge_magnets(&config.torrent_dir, log_name)?;
        update_rss_feed(config, log_name, &packaged)?;
    }
    Ok(packaged)
}

fn package_shard(
    config: &PackagerConfig,
    archive: &Archive,
    log_name: &str,
    manifest: &ShardManifest,
) -> Result<PackagedShard, MirrorError> {
    let shard_no = manifest.first_index / archive.shard_size();
    let name = format!("{log_name}_{shard_no:08}");

    // The swarm carries the data file and its manifest, so downloaders can
    // check the subroot without reaching the log.
    let data_path = archive.shard_data_path(manifest);
    let manifest_path = archive.shard_manifest_path(manifest);
    let files: Vec<(PathBuf, String)> = vec![
        (data_path, manifest.data_file.clone()),
        (
            manifest_path.clone(),
            manifest_path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("manifest.json")
                .to_string(),
        ),
    ];

    let total_len: u64 = files
        .iter()
        .map(|(path, _)| Ok(fs::metadata(path)?.len()))
        .sum::<Result<u64, MirrorError>>()?;

    // Aim for ~1500 pieces, rounded down to an 8 KiB multiple, never below
    // 32 KiB.
    let piece_length = MIN_PIECE_LENGTH.max(((total_len / TARGET_PIECE_COUNT) >> 13) << 13);
    let pieces = hash_pieces(&files, piece_length)?;

    let mut file_dicts = Vec::new();
    for (path, torrent_path) in &files {
        let mut d = BTreeMap::new();
        d.insert(b"length".to_vec(), Bencode::Int(fs::metadata(path)?.len() as i64));
        d.insert(
            b"path".to_vec(),
            Bencode::List(vec![Bencode::str(torrent_path)]),
        );
        file_dicts.push(Bencode::Dict(d));
    }

    let mut info = BTreeMap::new();
    info.insert(b"name".to_vec(), Bencode::str(&name));
    info.insert(b"piece length".to_vec(), Bencode::Int(piece_length as i64));
    info.insert(b"pieces".to_vec(), Bencode::Bytes(pieces));
    info.insert(b"files".to_vec(), Bencode::List(file_dicts));
    let info_encoded = Bencode::Dict(info).encode();
    let info_hash: [u8; 20] = Sha1::digest(&info_encoded).into();

    let mut torrent = BTreeMap::new();
    // `info` is spliced in pre-encoded so the bytes hashed for the info-hash
    // are exactly the bytes written.
    torrent.insert(b"creation date".to_vec(), Bencode::Int(unix_now() as i64));
    torrent.insert(
        b"created by".to_vec(),
        Bencode::str(concat!("ctmirror ", env!("CARGO_PKG_VERSION"))),
    );
    if let Some(asn) = config.asn {
        torrent.insert(
            b"comment".to_vec(),
            Bencode::str(&format!("Downloaded from AS{asn}")),
        );
    }
    if let Some(first) = config.trackers.first() {
        torrent.insert(b"announce".to_vec(), Bencode::str(first));
        torrent.insert(
            b"announce-list".to_vec(),
            Bencode::List(vec![Bencode::List(
                config.trackers.iter().map(|t| Bencode::str(t)).collect(),
            )]),
        );
    } else if !config.peers.is_empty() {
        // Trackerless torrent: fall back to the nodes metadata.
        torrent.insert(
            b"nodes".to_vec(),
            Bencode::List(
                config
                    .peers
                    .iter()
                    .filter_map(|peer| {
                        let (host, port) = peer.rsplit_once(':')?;
                        let port: i64 = port.parse().ok()?;
                        Some(Bencode::List(vec![Bencode::str(host), Bencode::Int(port)]))
                    })
                    .collect(),
            ),
        );
    }

    let mut out = Vec::new();
    out.push(b'd');
    for (key, value) in &torrent {
        if key.as_slice() > b"info".as_slice() {
            continue;
        }
        Bencode::Bytes(key.clone()).encode_into(&mut out);
        value.encode_into(&mut out);
    }
    Bencode::str("info").encode_into(&mut out);
    out.extend_from_slice(&info_encoded);
    for (key, value) in &torrent {
        if key.as_slice() <= b"info".as_slice() {
            continue;
        }
        Bencode::Bytes(key.clone()).encode_into(&mut out);
        value.encode_into(&mut out);
    }
    out.push(b'e');

    let torrent_file = format!("{name}.torrent");
    fs::write(config.torrent_dir.join(&torrent_file), &out)?;

    let magnet = build_magnet(&info_hash, &name, &config.trackers, &config.peers);
    fs::write(config.torrent_dir.join(format!("{name}.magnet")), &magnet)?;

    Ok(PackagedShard {
        shard_no,
        torrent_file,
        info_hash,
        magnet,
        total_len,
    })
}

/// SHA-1 every `piece_length` bytes of the concatenated file contents; the
/// tail of one file runs into the head of the next, and only the final piece
/// may be short.
fn hash_pieces(files: &[(PathBuf, String)], piece_length: u64) -> Result<Vec<u8>, MirrorError> {
    let mut pieces = Vec::new();
    let mut hasher = Sha1::new();
    let mut in_piece = 0u64;
    let mut buf = vec![0u8; 64 * 1024];
    for (path, _) in files {
        let mut file = File::open(path)?;
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            let mut chunk = &buf[..n];
            while !chunk.is_empty() {
                let room = (piece_length - in_piece) as usize;
                let take = room.min(chunk.len());
                hasher.update(&chunk[..take]);
                in_piece += take as u64;
                chunk = &chunk[take..];
                if in_piece == piece_length {
                    pieces.extend_from_slice(&hasher.finalize_reset());
                    in_piece = 0;
                }
            }
        }
    }
    if in_piece > 0 {
        pieces.extend_from_slice(&hasher.finalize_reset());
    }
    Ok(pieces)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn build_magnet(info_hash: &[u8; 20], name: &str, trackers: &[String], peers: &[String]) -> String {
    let mut magnet = format!("magnet:?xt=urn:btih:{}&dn={name}", hex::encode(info_hash));
    for peer in peers {
        magnet.push_str("&x.pe=");
        magnet.push_str(peer);
    }
    for tracker in trackers {
        magnet.push_str("&tr=");
        magnet.push_str(tracker);
    }
    magnet
}

/// Concatenate every magnet link of this log into `<log>.magnets`, one per
/// line, so mirrors can be bootstrapped from a single download.
fn merge_magnets(torrent_dir: &Path, log_name: &str) -> Result<(), MirrorError> {
    let prefix = format!("{log_name}_");
    let mut names = Vec::new();
    for dirent in fs::read_dir(torrent_dir)? {
        let path = dirent?.path();
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if name.starts_with(&prefix) && name.ends_with(".magnet") {
            names.push(path);
        }
    }
    names.sort();
    let mut merged = String::new();
    for path in names {
        merged.push_str(fs::read_to_string(path)?.trim_end());
        merged.push('\n');
    }
    fs::write(torrent_dir.join(format!("{log_name}.magnets")), merged)?;
    Ok(())
}

fn xml_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn rss_skeleton(log_name: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?><rss version=\"2.0\"><channel>\
<ttl>1440</ttl>\
<title>CT archive torrents for {log}</title>\
<description>Torrents carrying the sharded, verified archive of the CT log {log}.</description>\
<link>https://github.com/ctmirror/ctmirror</link>\
</channel></rss>",
        log = xml_escape(log_name)
    )
}

/// Append one `<item>` per new torrent to the log's RSS 2.0 feed, creating
/// the feed on first use.
fn update_rss_feed(
    config: &PackagerConfig,
    log_name: &str,
    packaged: &[PackagedShard],
) -> Result<(), MirrorError> {
    let path = config.torrent_dir.join(format!("{log_name}.rss"));
    let feed = match fs::read_to_string(&path) {
        Ok(feed) => feed,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => rss_skeleton(log_name),
        Err(e) => return Err(e.into()),
    };

    let mut download_url = config.download_url.clone();
    if !download_url.ends_with('/') {
        download_url.push('/');
    }

    let mut items = String::new();
    for shard in packaged {
        let guid = hex::encode(shard.info_hash);
        // Re-packaged shards keep their info-hash, so skip duplicates.
        if feed.contains(&guid) {
            continue;
        }
        items.push_str(&format!(
            "<item>\
<title>Shard {:08} of {}</title>\
<description>Verified CT log shard, {} bytes.</description>\
<guid isPermaLink=\"false\">{guid}</guid>\
<enclosure url=\"{}{}\" type=\"application/x-bittorrent\" length=\"{}\"/>\
</item>",
            shard.shard_no,
            xml_escape(log_name),
            shard.total_len,
            xml_escape(&download_url),
            xml_escape(&shard.torrent_file),
            shard.total_len,
        ));
    }

    let Some(at) = feed.rfind("</channel>") else {
        return Err(MirrorError::Config(format!(
            "{} is not a feed this tool wrote",
            path.display()
        )));
    };
    let mut updated = String::with_capacity(feed.len() + items.len());
    updated.push_str(&feed[..at]);
    updated.push_str(&items);
    updated.push_str(&feed[at..]);
    fs::write(&path, updated)?;
    Ok(())
}
