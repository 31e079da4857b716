//! On-disk entry set layout.
//!
//! An entry set (`jset`) is the unit the writer driver puts on disk: a fixed
//! 48-byte header followed by a dense sequence of `jset_entry` chunks, padded
//! out to a whole number of filesystem blocks.  The layout is little-endian
//! and stable; replay depends on it bit for bit.
//!
//!   jset:
//!     `magic`:      u64
//!     `version`:    u32
//!     `block_size`: u32
//!     `checksum`:   u32 (CRC32C of everything after this field, minus padding)
//!     `_pad`:       u32
//!     `seq`:        u64
//!     `last_seq`:   u64
//!     `u64s`:       u32 (payload length in u64 units)
//!     `_pad2`:      u32
//!
//!   jset_entry (one u64, followed by `u64s` x u64 of keys):
//!     `u64s`:     u32
//!     `btree_id`: u8
//!     `level`:    u8
//!     `kind`:     u8
//!     `_pad`:     u8

use bytes::{Buf, BufMut, BytesMut};
use crc32fast::Hasher;

use crate::common::SECTOR_SIZE;

pub(crate) const JSET_MAGIC: u64 = 0x8d3a_66e5_0c5f_41b9;
pub(crate) const JSET_VERSION: u32 = 1;

/// Entry set header length, in u64 units.
pub const JSET_HEADER_U64S: u32 = 6;

/// `jset_entry` chunk header length, in u64 units.
pub const JSET_ENTRY_HEADER_U64S: u32 = 1;

/// Worst-case size of a single btree root key, in u64 units.
pub const BKEY_EXTENT_U64S_MAX: u32 = 8;

/// Space one `jset_entry` carrying `key_u64s` of keys occupies.
pub const fn jset_u64s(key_u64s: u32) -> u32 {
    JSET_ENTRY_HEADER_U64S + key_u64s
}

/// Every open entry holds this much back so the writer driver can append one
/// root per btree at dispatch time.
pub(crate) const fn entry_u64s_reserve() -> u32 {
    BtreeId::NR as u32 * jset_u64s(BKEY_EXTENT_U64S_MAX)
}

/// The btrees whose keys and roots flow through the journal.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum BtreeId {
    Extents = 0,
    Inodes = 1,
    Dirents = 2,
    Xattrs = 3,
    Alloc = 4,
    Quotas = 5,
}

impl BtreeId {
    pub const NR: usize = 6;
}

/// Kinds of `jset_entry` chunk.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum JsetEntryKind {
    BtreeKeys = 0,
    BtreeRoot = 1,
    PrioPtrs = 2,
    Blacklist = 3,
}

impl JsetEntryKind {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::BtreeKeys),
            1 => Some(Self::BtreeRoot),
            2 => Some(Self::PrioPtrs),
            3 => Some(Self::Blacklist),
            _ => None,
        }
    }
}

/// Packs a `jset_entry` chunk header into its on-disk u64.
pub(crate) fn pack_entry_header(key_u64s: u32, btree_id: u8, level: u8, kind: JsetEntryKind) -> u64 {
    u64::from(key_u64s)
        | (u64::from(btree_id) << 32)
        | (u64::from(level) << 40)
        | ((kind as u64) << 48)
}

fn unpack_entry_header(word: u64) -> (u32, u8, u8, u8) {
    (
        (word & 0xffff_ffff) as u32,
        ((word >> 32) & 0xff) as u8,
        ((word >> 40) & 0xff) as u8,
        ((word >> 48) & 0xff) as u8,
    )
}

/// Header fields of an entry set about to be written.
#[derive(Clone, Copy, Debug)]
pub(crate) struct JsetHeader {
    pub seq: u64,
    pub last_seq: u64,
    pub u64s: u32,
    pub block_size: u32,
}

/// Encodes a full entry set, padded to whole blocks, ready for submission.
pub(crate) fn encode_jset(header: JsetHeader, payload: &[u64]) -> BytesMut {
    assert_eq!(payload.len(), header.u64s as usize);

    let body_len = JSET_HEADER_U64S as usize * 8 + payload.len() * 8;
    let block_size = header.block_size as usize;
    let padded_len = body_len.div_ceil(block_size) * block_size;

    let mut buf = BytesMut::with_capacity(padded_len);
    buf.put_u64_le(JSET_MAGIC);
    buf.put_u32_le(JSET_VERSION);
    buf.put_u32_le(header.block_size);
    buf.put_u32_le(0); // checksum, patched below
    buf.put_u32_le(0);
    buf.put_u64_le(header.seq);
    buf.put_u64_le(header.last_seq);
    buf.put_u32_le(header.u64s);
    buf.put_u32_le(0);
    for word in payload {
        buf.put_u64_le(*word);
    }

    let checksum = jset_checksum(&buf[20..]);
    buf[16..20].copy_from_slice(&checksum.to_le_bytes());

    buf.resize(padded_len, 0);
    debug_assert_eq!(buf.len() % SECTOR_SIZE, 0);
    buf
}

fn jset_checksum(bytes: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

/// One decoded `jset_entry` chunk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JsetEntry {
    pub kind: JsetEntryKind,
    pub btree_id: u8,
    pub level: u8,
    pub keys: Vec<u64>,
}

/// A decoded entry set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Jset {
    pub seq: u64,
    pub last_seq: u64,
    pub version: u32,
    pub block_size: u32,
    pub u64s: u32,
    pub entries: Vec<JsetEntry>,
}

/// Result of checking whether a buffer holds a valid entry set.
#[derive(Debug)]
pub enum JsetStatus {
    /// The entry set decoded cleanly and its checksum matched.
    Valid(Jset),
    /// The entry set decoded but the stored checksum did not match.
    Corrupted { calculated: u32, actual: u32 },
    /// The buffer does not hold a well-formed entry set.
    Invalid(String),
}

/// Decodes the entry set at the start of `bytes`.
///
/// Used by replay tooling and by tests asserting the on-disk layout; the
/// running write path never reads entries back.
pub fn decode_jset(bytes: &[u8]) -> JsetStatus {
    let header_len = JSET_HEADER_U64S as usize * 8;
    if bytes.len() < header_len {
        return JsetStatus::Invalid(format!(
            "{} bytes is too short for an entry set header",
            bytes.len()
        ));
    }

    let mut buf = bytes;
    let magic = buf.get_u64_le();
    if magic != JSET_MAGIC {
        return JsetStatus::Invalid(format!("bad magic {magic:#018x}"));
    }
    let version = buf.get_u32_le();
    let block_size = buf.get_u32_le();
    let actual = buf.get_u32_le();
    let _pad = buf.get_u32_le();
    let seq = buf.get_u64_le();
    let last_seq = buf.get_u64_le();
    let u64s = buf.get_u32_le();
    let _pad2 = buf.get_u32_le();

    let payload_len = u64s as usize * 8;
    if buf.remaining() < payload_len {
        return JsetStatus::Invalid(format!(
            "payload truncated: header claims {u64s} u64s, {} bytes remain",
            buf.remaining()
        ));
    }

    let calculated = jset_checksum(&bytes[20..header_len + payload_len]);
    if calculated != actual {
        return JsetStatus::Corrupted { calculated, actual };
    }

    let mut words = Vec::with_capacity(u64s as usize);
    for _ in 0..u64s {
        words.push(buf.get_u64_le());
    }

    let mut entries = Vec::new();
    let mut pos = 0usize;
    while pos < words.len() {
        let (key_u64s, btree_id, level, kind) = unpack_entry_header(words[pos]);
        let Some(kind) = JsetEntryKind::from_u8(kind) else {
            return JsetStatus::Invalid(format!("unknown entry kind {kind} at u64 {pos}"));
        };
        let keys_start = pos + 1;
        let keys_end = keys_start + key_u64s as usize;
        if keys_end > words.len() {
            return JsetStatus::Invalid(format!(
                "entry at u64 {pos} overruns the payload ({key_u64s} keys claimed)"
            ));
        }
        entries.push(JsetEntry {
            kind,
            btree_id,
            level,
            keys: words[keys_start..keys_end].to_vec(),
        });
        pos = keys_end;
    }

    JsetStatus::Valid(Jset {
        seq,
        last_seq,
        version,
        block_size,
        u64s,
        entries,
    })
}

/// A btree root to be appended to an entry at dispatch time.
#[derive(Clone, Debug)]
pub struct BtreeRoot {
    pub btree_id: BtreeId,
    pub level: u8,
    pub key: Vec<u64>,
}

/// Source of the btree roots the writer driver stamps into every entry.
///
/// Implemented by the interior-update machinery of the wider filesystem; the
/// journal only requires that each returned key fits the per-root reserve.
pub trait RootSource: Send + Sync {
    fn btree_roots(&self) -> Vec<BtreeRoot>;
}

/// Root source for journals running before the btree is wired up.
pub struct NoRoots;

impl RootSource for NoRoots {
    fn btree_roots(&self) -> Vec<BtreeRoot> {
        Vec::new()
    }
}
