use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use parking_lot::RwLock;
use tokio::sync::Notify;

/// Width of the per-buffer inode presence filter, in bits.
const HAS_INODE_BITS: usize = 1024;
const HAS_INODE_WORDS: usize = HAS_INODE_BITS / 64;

const GOLDEN_RATIO_64: u64 = 0x61c8_8646_80b5_83eb;

/// Hashes an inode number into the presence filter.
pub(crate) fn inode_hash(inode: u64) -> usize {
    (inode.wrapping_mul(GOLDEN_RATIO_64) >> (64 - HAS_INODE_BITS.ilog2())) as usize
}

/// One of the two rotating in-memory entry buffers.
///
/// While its entry is open, reservation holders write key chunks directly
/// into `body` at their ticket offsets; the ranges are disjoint by
/// construction, so plain relaxed stores into atomic slots suffice.  Once the
/// entry is sealed the body is only read (by the writer driver) until the
/// buffer rotates back into use and is reinitialized.
///
/// The body lives behind an `RwLock` purely so it can be swapped for a larger
/// allocation at rotation time; ticket writes take the (uncontended) read
/// side.
pub(crate) struct JournalBuf {
    seq: AtomicU64,
    last_seq: AtomicU64,
    u64s: AtomicU32,
    disk_sectors: AtomicU32,
    body: RwLock<Box<[AtomicU64]>>,
    has_inode: [AtomicU64; HAS_INODE_WORDS],
    /// Waiters to be woken when this buffer's write completes or fails.
    pub wait: Notify,
}

fn alloc_body(u64s: usize) -> Box<[AtomicU64]> {
    (0..u64s).map(|_| AtomicU64::new(0)).collect()
}

impl JournalBuf {
    pub fn new(size_bytes: usize) -> Self {
        Self {
            seq: AtomicU64::new(0),
            last_seq: AtomicU64::new(0),
            u64s: AtomicU32::new(0),
            disk_sectors: AtomicU32::new(0),
            body: RwLock::new(alloc_body(size_bytes / 8)),
            has_inode: [const { AtomicU64::new(0) }; HAS_INODE_WORDS],
            wait: Notify::new(),
        }
    }

    /// Size of the buffer, in bytes.
    pub fn size(&self) -> usize {
        self.body.read().len() * 8
    }

    /// Capacity of the body, in u64 units.
    pub fn capacity_u64s(&self) -> u32 {
        self.body.read().len() as u32
    }

    /// Replaces the body with a larger allocation.
    ///
    /// Only valid between the completion of this buffer's write and its next
    /// `init_for_seq`; there are no reservation holders then, and the old
    /// contents are dead.
    pub fn grow_to(&self, size_bytes: usize) {
        let mut body = self.body.write();
        if body.len() * 8 < size_bytes {
            *body = alloc_body(size_bytes / 8);
        }
    }

    /// Resets the buffer to carry the entry for `seq`.
    pub fn init_for_seq(&self, seq: u64) {
        self.seq.store(seq, Ordering::Release);
        self.last_seq.store(0, Ordering::Release);
        self.u64s.store(0, Ordering::Release);
        self.disk_sectors.store(0, Ordering::Release);
        for word in &self.has_inode {
            word.store(0, Ordering::Release);
        }
    }

    pub fn seq(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq.load(Ordering::Acquire)
    }

    pub fn set_last_seq(&self, last_seq: u64) {
        self.last_seq.store(last_seq, Ordering::Release);
    }

    pub fn u64s(&self) -> u32 {
        self.u64s.load(Ordering::Acquire)
    }

    /// Seals the payload length.  Set once, by `buf_switch`, when the entry
    /// closes; never changed afterwards.
    pub fn seal(&self, u64s: u32) {
        self.u64s.store(u64s, Ordering::Release);
    }

    pub fn disk_sectors(&self) -> u32 {
        self.disk_sectors.load(Ordering::Acquire)
    }

    pub fn set_disk_sectors(&self, sectors: u32) {
        self.disk_sectors.store(sectors, Ordering::Release);
    }

    /// Writes `words` into the body starting at `offset` (u64 units).
    ///
    /// Callers must stay within a range handed out by the reservation
    /// machinery; ranges from distinct reservations never overlap.
    pub fn write_at(&self, offset: u32, words: &[u64]) {
        let body = self.body.read();
        let start = offset as usize;
        let slots = &body[start..start + words.len()];
        for (slot, word) in slots.iter().zip(words) {
            slot.store(*word, Ordering::Relaxed);
        }
    }

    /// Appends `words` past the current payload length, outside any
    /// reservation.  Only valid while no entry is open on this buffer (start
    /// time blacklist entries take this path).
    pub fn append(&self, words: &[u64]) {
        let offset = self.u64s.load(Ordering::Acquire);
        self.write_at(offset, words);
        self.u64s.store(offset + words.len() as u32, Ordering::Release);
    }

    /// Snapshots the first `len` u64s of the body.
    pub fn read_payload(&self, len: u32) -> Vec<u64> {
        let body = self.body.read();
        body[..len as usize]
            .iter()
            .map(|slot| slot.load(Ordering::Relaxed))
            .collect()
    }

    pub fn set_has_inode(&self, inode: u64) {
        let bit = inode_hash(inode);
        self.has_inode[bit / 64].fetch_or(1 << (bit % 64), Ordering::AcqRel);
    }

    pub fn has_inode(&self, inode: u64) -> bool {
        let bit = inode_hash(inode);
        self.has_inode[bit / 64].load(Ordering::Acquire) & (1 << (bit % 64)) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_clears_previous_entry_state() {
        let buf = JournalBuf::new(4096);
        buf.append(&[1, 2, 3]);
        buf.set_has_inode(42);
        buf.seal(3);

        buf.init_for_seq(9);
        assert_eq!(buf.seq(), 9);
        assert_eq!(buf.u64s(), 0);
        assert!(!buf.has_inode(42));
    }

    #[test]
    fn disjoint_writes_land_at_their_offsets() {
        let buf = JournalBuf::new(4096);
        buf.write_at(0, &[10, 11]);
        buf.write_at(5, &[50]);
        let payload = buf.read_payload(6);
        assert_eq!(payload[0], 10);
        assert_eq!(payload[1], 11);
        assert_eq!(payload[5], 50);
    }

    #[test]
    fn growth_is_monotone() {
        let buf = JournalBuf::new(4096);
        buf.grow_to(16384);
        assert_eq!(buf.size(), 16384);
        buf.grow_to(8192);
        assert_eq!(buf.size(), 16384);
    }

    #[test]
    fn inode_filter_is_a_hash() {
        let buf = JournalBuf::new(4096);
        buf.set_has_inode(7);
        assert!(buf.has_inode(7));
        // A different inode may collide, but the hash must be deterministic.
        assert_eq!(inode_hash(7), inode_hash(7));
        assert!(inode_hash(7) < HAS_INODE_BITS);
    }
}
