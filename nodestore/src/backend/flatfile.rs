//! Append-only flat-file backend.
//!
//! Objects live in a single `objects.dat` log of CRC-framed records, with
//! an in-memory hash index rebuilt on open. A torn tail (partial record or
//! checksum mismatch) is truncated during recovery; corruption hit on the
//! read path is reported, never repaired.

use super::{Backend, Fetched};
use crate::object::{NodeObject, NodeObjectType};
use alloy_primitives::B256;
use crc32fast::Hasher;
use eyre::{eyre, Result, WrapErr};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::warn;

const DATA_FILE_NAME: &str = "objects.dat";

// Record layout: [type u8][hash 32][len u32 LE][payload][crc32 LE].
// The checksum covers everything before it.
const RECORD_HEADER_LEN: u64 = 1 + 32 + 4;

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    offset: u64,
}

struct FlatState {
    file: File,
    index: HashMap<B256, IndexEntry>,
    end: u64,
}

pub struct FlatFileBackend {
    path: PathBuf,
    state: Mutex<FlatState>,
    writes: AtomicU64,
}

fn type_tag(otype: NodeObjectType) -> u8 {
    match otype {
        NodeObjectType::LedgerHeader => 0,
        NodeObjectType::InnerNode => 1,
        NodeObjectType::LeafNode => 2,
        NodeObjectType::Transaction => 3,
    }
}

fn tag_type(tag: u8) -> Option<NodeObjectType> {
    match tag {
        0 => Some(NodeObjectType::LedgerHeader),
        1 => Some(NodeObjectType::InnerNode),
        2 => Some(NodeObjectType::LeafNode),
        3 => Some(NodeObjectType::Transaction),
        _ => None,
    }
}

fn record_crc(tag: u8, hash: &B256, len: u32, payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&[tag]);
    hasher.update(hash.as_slice());
    hasher.update(&len.to_le_bytes());
    hasher.update(payload);
    hasher.finalize()
}

/// One decoded record, or `None` when the bytes at `offset` do not form a
/// whole, checksum-valid record.
fn read_record(file: &mut File, offset: u64) -> Result<Option<(u8, B256, Vec<u8>, u64)>> {
    file.seek(SeekFrom::Start(offset))?;
    let mut header = [0u8; RECORD_HEADER_LEN as usize];
    let mut read = 0;
    while read < header.len() {
        let n = file.read(&mut header[read..])?;
        if n == 0 {
            return Ok(None);
        }
        read += n;
    }
    let tag = header[0];
    let hash = B256::from_slice(&header[1..33]);
    let len = u32::from_le_bytes(header[33..37].try_into().expect("fixed slice"));
    let mut payload = vec![0u8; len as usize];
    if file.read_exact(&mut payload).is_err() {
        return Ok(None);
    }
    let mut crc_buf = [0u8; 4];
    if file.read_exact(&mut crc_buf).is_err() {
        return Ok(None);
    }
    if record_crc(tag, &hash, len, &payload) != u32::from_le_bytes(crc_buf) {
        return Ok(None);
    }
    let next = offset + RECORD_HEADER_LEN + u64::from(len) + 4;
    Ok(Some((tag, hash, payload, next)))
}

impl FlatFileBackend {
    /// Open (or create) the backend under `dir`, rebuilding the index and
    /// truncating any torn tail.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).wrap_err("failed to create backend dir")?;
        let path = dir.join(DATA_FILE_NAME);
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)
            .wrap_err("failed to open objects.dat")?;

        let mut index = HashMap::new();
        let mut offset = 0u64;
        while let Some((_, hash, _, next)) = read_record(&mut file, offset)? {
            index.insert(hash, IndexEntry { offset });
            offset = next;
        }
        let file_len = file.metadata()?.len();
        if offset < file_len {
            warn!(
                path = %path.display(),
                torn = file_len - offset,
                "truncating torn tail of objects.dat"
            );
            file.set_len(offset)?;
        }

        Ok(Self {
            path,
            state: Mutex::new(FlatState {
                file,
                index,
                end: offset,
            }),
            writes: AtomicU64::new(0),
        })
    }
}

impl Backend for FlatFileBackend {
    fn name(&self) -> &str {
        "flatfile"
    }

    fn store(&self, object: &Arc<NodeObject>) -> Result<()> {
        let tag = type_tag(object.object_type());
        let len = object.data().len() as u32;
        let crc = record_crc(tag, object.hash(), len, object.data());

        let mut state = self.state.lock().expect("backend lock");
        let offset = state.end;
        state.file.write_all(&[tag])?;
        state.file.write_all(object.hash().as_slice())?;
        state.file.write_all(&len.to_le_bytes())?;
        state.file.write_all(object.data())?;
        state.file.write_all(&crc.to_le_bytes())?;
        state.file.flush()?;
        state.end = offset + RECORD_HEADER_LEN + u64::from(len) + 4;
        state.index.insert(*object.hash(), IndexEntry { offset });
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn fetch(&self, hash: &B256) -> Result<Fetched> {
        let mut state = self.state.lock().expect("backend lock");
        let Some(entry) = state.index.get(hash).copied() else {
            return Ok(Fetched::NotFound);
        };
        match read_record(&mut state.file, entry.offset)? {
            Some((tag, stored_hash, payload, _)) if stored_hash == *hash => {
                let Some(otype) = tag_type(tag) else {
                    warn!(%hash, tag, "unknown object type tag in objects.dat");
                    return Ok(Fetched::Corrupt);
                };
                Ok(Fetched::Found(NodeObject::new(otype, payload, stored_hash)))
            }
            _ => {
                warn!(%hash, path = %self.path.display(), "checksum mismatch in objects.dat");
                Ok(Fetched::Corrupt)
            }
        }
    }

    fn for_each(&self, f: &mut dyn FnMut(Arc<NodeObject>)) -> Result<()> {
        let mut state = self.state.lock().expect("backend lock");
        let offsets: Vec<u64> = state.index.values().map(|e| e.offset).collect();
        for offset in offsets {
            let Some((tag, hash, payload, _)) = read_record(&mut state.file, offset)? else {
                return Err(eyre!("unreadable record at offset {offset}"));
            };
            let Some(otype) = tag_type(tag) else {
                return Err(eyre!("unknown object type tag {tag} at offset {offset}"));
            };
            f(NodeObject::new(otype, payload, hash));
        }
        Ok(())
    }

    fn fd_limit(&self) -> u32 {
        2
    }

    fn write_load(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}
