use std::{
    fmt::Write as _,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};

use crossbeam_utils::atomic::AtomicCell;
use metrics::histogram;
use parking_lot::{Mutex, MutexGuard};
use snafu::Snafu;
use tokio::{sync::Notify, task::JoinHandle};

use crate::{
    buf::JournalBuf,
    common::{block_sectors, JournalConfig, JOURNAL_PIN, SECTOR_SIZE},
    device::{entry_sectors, Allocator, JournalDevice, SuperBlock},
    entry::{
        entry_u64s_reserve, jset_u64s, pack_entry_header, BtreeId, JsetEntryKind, RootSource,
        JSET_HEADER_U64S,
    },
    io::BlockDev,
    pin::{FlushFn, PinEntry, PinFifo, PinHandle},
    state::{ReservationState, OFFSET_CLOSED},
};

/// Errors surfaced to journal clients.
#[derive(Debug, Snafu)]
pub enum JournalError {
    /// The journal has hit a fatal I/O error and been halted.  Latched: every
    /// subsequent reservation and flush reports this.
    #[snafu(display("journal has shut down following an I/O error"))]
    Io,

    /// Not enough read-write member devices remain to place an entry; the
    /// filesystem must go read-only.
    #[snafu(display("insufficient rw devices for journal write"))]
    RoFs,
}

/// A slice of the open entry handed to one writer.
///
/// The holder owns `[offset, offset + u64s)` of the entry body for `seq` and
/// must release it with [`Journal::res_put`] once its keys are in place.
/// Release consumes the reservation, so a double release is a compile error
/// rather than a runtime one.
#[derive(Debug)]
#[must_use = "a journal reservation must be released with res_put"]
pub struct Reservation {
    pub seq: u64,
    pub(crate) offset: u32,
    pub(crate) u64s: u32,
    pub(crate) idx: usize,
    pub(crate) used: u32,
}

impl Reservation {
    /// Offset of this reservation in the entry body, in u64 units.
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Total space granted, in u64 units.
    pub fn u64s(&self) -> u32 {
        self.u64s
    }

    /// Space not yet consumed by [`Journal::entry_write`].
    pub fn remaining(&self) -> u32 {
        self.u64s - self.used
    }
}

/// Outcome of trying to close the current entry.  The lock travels with the
/// outcome: every variant except `Unlocked` hands the guard back.
pub(crate) enum BufSwitch<'a, D: BlockDev> {
    /// The journal is in its error state.
    Error(MutexGuard<'a, Inner<D>>),
    /// The previous buffer is still being written out.
    Inuse(MutexGuard<'a, Inner<D>>),
    /// No entry was open; nothing to close.
    Closed(MutexGuard<'a, Inner<D>>),
    /// The entry was closed; the lock was dropped on the way out.
    Unlocked,
}

enum Flushed {
    Done,
    Errored,
    NotYet,
}

/// Journal state protected by the journal lock.
pub(crate) struct Inner<D> {
    pub pin: PinFifo,
    pub devices: Vec<JournalDevice<D>>,
    pub buf_size_want: usize,
    pub cur_buf_sectors: u32,
    pub prev_buf_sectors: u32,
    pub write_deadline: Option<Instant>,
    /// Devices targeted by the write currently in flight.
    pub prev_targets: Vec<u8>,
    pub write_in_flight: bool,
}

/// The write-ahead journal of one filesystem instance.
///
/// Clients reserve space in the open entry with [`Journal::res_get`], copy
/// their keys in, and release with [`Journal::res_put`]; a background driver
/// seals entries, writes them to every read-write member device's journal
/// bucket ring and signals durability to waiters.  See the crate docs for the
/// full data flow.
pub struct Journal<D: BlockDev> {
    pub(crate) config: JournalConfig,
    pub(crate) state: ReservationState,
    /// Capacity of the open entry, in u64 units.  Valid while an entry is
    /// open; published before the open transition.
    pub(crate) cur_entry_u64s: AtomicU32,
    /// `cur_seq`: the newest allocated sequence number.
    pub(crate) seq: AtomicU64,
    /// Newest sequence durable on disk.
    pub(crate) seq_ondisk: AtomicU64,
    /// `last_seq` stamp of the newest durable entry; bounds bucket reclaim.
    pub(crate) last_seq_ondisk: AtomicU64,
    pub(crate) bufs: [JournalBuf; 2],
    pub(crate) inner: Mutex<Inner<D>>,
    /// The journal wait queue: reservation waiters, flush waiters, stop.
    pub(crate) wait: Notify,
    /// Kicks the writer driver task.
    pub(crate) write_kick: Notify,
    /// Kicks the reclaim task ahead of its next tick.
    pub(crate) reclaim_kick: Notify,
    pub(crate) need_write: AtomicBool,
    pub(crate) replay_done: AtomicBool,
    pub(crate) stopping: AtomicBool,
    pub(crate) res_get_blocked_start: AtomicCell<Option<Instant>>,
    pub(crate) need_write_time: AtomicCell<Option<Instant>>,
    next_pin_id: AtomicU64,
    pub(crate) allocator: Arc<dyn Allocator>,
    pub(crate) sb: Arc<dyn SuperBlock>,
    pub(crate) roots: Arc<dyn RootSource>,
    /// Outer lock ordering: taken before the journal lock, never inside it.
    pub(crate) sb_lock: tokio::sync::Mutex<()>,
    pub(crate) tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<D: BlockDev> Journal<D> {
    pub fn new(
        config: JournalConfig,
        allocator: Arc<dyn Allocator>,
        sb: Arc<dyn SuperBlock>,
        roots: Arc<dyn RootSource>,
    ) -> Arc<Self> {
        let entry_size_min = config.entry_size_min;
        Arc::new(Self {
            state: ReservationState::new(),
            cur_entry_u64s: AtomicU32::new(0),
            seq: AtomicU64::new(0),
            seq_ondisk: AtomicU64::new(0),
            last_seq_ondisk: AtomicU64::new(0),
            bufs: [
                JournalBuf::new(entry_size_min),
                JournalBuf::new(entry_size_min),
            ],
            inner: Mutex::new(Inner {
                pin: PinFifo::new(JOURNAL_PIN),
                devices: Vec::new(),
                buf_size_want: entry_size_min,
                cur_buf_sectors: 0,
                prev_buf_sectors: 0,
                write_deadline: None,
                prev_targets: Vec::new(),
                write_in_flight: false,
            }),
            wait: Notify::new(),
            write_kick: Notify::new(),
            reclaim_kick: Notify::new(),
            need_write: AtomicBool::new(false),
            replay_done: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            res_get_blocked_start: AtomicCell::new(None),
            need_write_time: AtomicCell::new(None),
            next_pin_id: AtomicU64::new(1),
            allocator,
            sb,
            roots,
            sb_lock: tokio::sync::Mutex::new(()),
            tasks: Mutex::new(Vec::new()),
            config,
        })
    }

    pub fn config(&self) -> &JournalConfig {
        &self.config
    }

    /// `cur_seq`: the newest allocated sequence number.
    pub fn cur_seq(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    /// `last_seq`: the oldest sequence still held live by a pin.
    pub fn last_seq(&self) -> u64 {
        self.inner.lock().pin.front_seq()
    }

    /// Newest sequence durable on disk.
    pub fn seq_ondisk(&self) -> u64 {
        self.seq_ondisk.load(Ordering::Acquire)
    }

    /// `last_seq` stamp of the newest durable entry.
    pub fn last_seq_ondisk(&self) -> u64 {
        self.last_seq_ondisk.load(Ordering::Acquire)
    }

    /// Whether the journal has been halted by an I/O error.
    pub fn error(&self) -> bool {
        self.state.load().is_error()
    }

    /// Marks journal replay as finished; purely informational, surfaced by
    /// the introspection dump.
    pub fn set_replay_done(&self) {
        self.replay_done.store(true, Ordering::Release);
    }

    // Reservations.

    /// Lock-free reservation attempt on the open entry.  Never sleeps, never
    /// allocates.
    fn res_get_fast(&self, u64s_min: u32, u64s_max: u32) -> Option<Reservation> {
        let mut grant = (0, 0, 0);
        let outcome = self.state.update(|s| {
            // A closed or errored entry fails this bound check on its own:
            // the sentinel offsets sit above any real entry capacity.
            let offset = s.cur_entry_offset();
            let cur_entry_u64s = self.cur_entry_u64s.load(Ordering::Acquire);
            if offset.checked_add(u64s_min)? > cur_entry_u64s {
                return None;
            }
            let u64s = u64s_max.min(cur_entry_u64s - offset);
            grant = (offset, u64s, s.idx());
            Some(s.inc_count(s.idx()).with_offset(offset + u64s))
        });

        outcome.ok().map(|_| {
            let (offset, u64s, idx) = grant;
            Reservation {
                // Stable while we hold a count on this buffer.
                seq: self.bufs[idx].seq(),
                offset,
                u64s,
                idx,
                used: 0,
            }
        })
    }

    /// One pass of the slow path.  `Ok(None)` means the journal is currently
    /// full and the caller should park on the wait queue.
    fn try_res_get(
        &self,
        u64s_min: u32,
        u64s_max: u32,
        for_meta: bool,
    ) -> Result<Option<Reservation>, JournalError> {
        loop {
            if let Some(res) = self.res_get_fast(u64s_min, u64s_max) {
                return Ok(Some(res));
            }

            let mut inner = self.inner.lock();

            // Recheck under the lock so we don't close an entry another
            // thread just opened.
            if let Some(res) = self.res_get_fast(u64s_min, u64s_max) {
                return Ok(Some(res));
            }

            // The entry filled while the device had room for a bigger one:
            // ask for larger buffers at the next rotation.
            let s = self.state.load();
            if s.entry_is_open() {
                let buf = &self.bufs[s.idx()];
                let size = buf.size();
                if (size / SECTOR_SIZE) < buf.disk_sectors() as usize
                    && size < self.config.entry_size_max
                {
                    inner.buf_size_want = inner
                        .buf_size_want
                        .max(size * 2)
                        .min(self.config.entry_size_max);
                }
            }

            match self.buf_switch(inner, false) {
                BufSwitch::Error(_guard) => return Err(JournalError::Io),
                BufSwitch::Inuse(guard) => {
                    drop(guard);
                    trace!("journal entry full, previous write still in flight");
                    self.mark_res_blocked();
                    return Ok(None);
                }
                BufSwitch::Closed(mut guard) => {
                    if self.entry_open(&mut guard, for_meta)? {
                        drop(guard);
                        continue;
                    }
                    drop(guard);
                    // Direct reclaim: the background tick may be frozen
                    // behind us, so make progress inline.
                    self.reclaim_work();
                    trace!("journal full, reservation blocked");
                    self.mark_res_blocked();
                    return Ok(None);
                }
                BufSwitch::Unlocked => continue,
            }
        }
    }

    fn mark_res_blocked(&self) {
        if self.res_get_blocked_start.load().is_none() {
            self.res_get_blocked_start.store(Some(Instant::now()));
        }
    }

    async fn res_get_inner(
        &self,
        u64s_min: u32,
        u64s_max: u32,
        for_meta: bool,
    ) -> Result<Reservation, JournalError> {
        assert!(u64s_min > 0 && u64s_min <= u64s_max);
        loop {
            let parked = self.wait.notified();
            tokio::pin!(parked);
            parked.as_mut().enable();
            match self.try_res_get(u64s_min, u64s_max, for_meta)? {
                Some(res) => return Ok(res),
                None => parked.await,
            }
        }
    }

    /// Acquires space for between `u64s_min` and `u64s_max` u64s on the
    /// current entry.
    ///
    /// The fast path is a single CAS; when the entry is full this closes it,
    /// opens the next one, and may park the caller until the journal has
    /// room.  To ensure forward progress the caller must not be holding any
    /// btree node write locks.
    ///
    /// # Errors
    ///
    /// `Io` once the journal has been halted; `RoFs` when no read-write
    /// member device can take an entry.
    pub async fn res_get(
        &self,
        u64s_min: u32,
        u64s_max: u32,
    ) -> Result<Reservation, JournalError> {
        self.res_get_inner(u64s_min, u64s_max, false).await
    }

    /// Releases a reservation, padding any unused tail.
    ///
    /// The releasing caller that brings the sealed buffer's count to zero
    /// hands it to the writer driver.
    pub fn res_put(&self, mut res: Reservation) {
        let remaining = res.remaining();
        if remaining > 0 {
            // A zero word decodes as an empty btree_keys chunk, so the unused
            // tail pads out to a dense run of no-op entries.
            self.bufs[res.idx].write_at(res.offset + res.used, &vec![0u64; remaining as usize]);
            res.used = res.u64s;
        }
        self.buf_put(res.idx, false);
    }

    /// Packs one key chunk into the reservation.
    ///
    /// Panics if the chunk does not fit the reservation; that is a caller
    /// accounting bug, not a runtime condition.
    pub fn entry_write(
        &self,
        res: &mut Reservation,
        kind: JsetEntryKind,
        btree_id: BtreeId,
        level: u8,
        keys: &[u64],
    ) {
        let u64s = jset_u64s(keys.len() as u32);
        assert!(
            res.used + u64s <= res.u64s,
            "journal reservation overflowed: {} + {} > {}",
            res.used,
            u64s,
            res.u64s
        );
        let mut words = Vec::with_capacity(u64s as usize);
        words.push(pack_entry_header(
            keys.len() as u32,
            btree_id as u8,
            level,
            kind,
        ));
        words.extend_from_slice(keys);
        self.bufs[res.idx].write_at(res.offset + res.used, &words);
        res.used += u64s;
    }

    /// Marks `inode` present in the reservation's entry, for
    /// [`Journal::inode_journal_seq`] lookups.
    pub fn set_has_inode(&self, res: &Reservation, inode: u64) {
        self.bufs[res.idx].set_has_inode(inode);
    }

    /// If `inode` has keys in the journal not yet flushed, returns the
    /// sequence number that needs flushing; 0 otherwise.  Lets fsync pick a
    /// flush target without scanning keys.
    pub fn inode_journal_seq(&self, inode: u64) -> u64 {
        if !self.bufs[0].has_inode(inode) && !self.bufs[1].has_inode(inode) {
            return 0;
        }

        let _inner = self.inner.lock();
        let s = self.state.load();
        let cur = self.cur_seq();
        if self.bufs[s.idx()].has_inode(inode) {
            cur
        } else if self.bufs[1 - s.idx()].has_inode(inode) {
            cur - 1
        } else {
            0
        }
    }

    /// Drops one reservation count on buffer `idx`; when that seals the
    /// closed buffer, kicks the writer driver.
    pub(crate) fn buf_put(&self, idx: usize, _need_write_just_set: bool) {
        let new = self.state.dec_count(idx);
        if new.count(idx) == 0 && new.idx() != idx && new.prev_buf_unwritten() {
            self.write_kick.notify_one();
        }
    }

    // Entry lifecycle.

    /// Atomically closes the current entry, rotating to the other buffer.
    /// Called with the journal lock held; on success the lock is released
    /// (`Unlocked`) after dispatch bookkeeping.
    pub(crate) fn buf_switch<'a>(
        &'a self,
        mut inner: MutexGuard<'a, Inner<D>>,
        need_write_just_set: bool,
    ) -> BufSwitch<'a, D> {
        let old = match self.state.update(|s| {
            if s.cur_entry_offset() == OFFSET_CLOSED || s.is_error() || s.prev_buf_unwritten() {
                return None;
            }
            // The write reservation: keeps res_put from starting the write
            // before the sealed length below is in place.
            Some(
                s.inc_count(s.idx())
                    .with_offset(OFFSET_CLOSED)
                    .flip_idx()
                    .with_prev_buf_unwritten(true),
            )
        }) {
            Ok(old) => old,
            Err(observed) => {
                return if observed.is_error() {
                    BufSwitch::Error(inner)
                } else if observed.cur_entry_offset() == OFFSET_CLOSED {
                    BufSwitch::Closed(inner)
                } else {
                    BufSwitch::Inuse(inner)
                };
            }
        };

        assert_eq!(
            old.count(1 - old.idx()),
            0,
            "rotating into a buffer with outstanding reservations"
        );

        self.need_write.store(false, Ordering::Release);

        let old_idx = old.idx();
        let buf = &self.bufs[old_idx];
        buf.seal(old.cur_entry_offset());

        let sealed_bytes =
            (JSET_HEADER_U64S + old.cur_entry_offset() + entry_u64s_reserve()) as usize * 8;
        inner.prev_buf_sectors = block_sectors(sealed_bytes, self.config.block_size);
        debug_assert!(inner.prev_buf_sectors <= inner.cur_buf_sectors);

        inner.pin.reclaim_fast();
        // last_seq is stamped at close, not at dispatch: waiters read it from
        // the sealed header before the write goes out.
        buf.set_last_seq(inner.pin.front_seq());

        // The pin slot push and the seq increment must be one step.
        let seq = self.seq.fetch_add(1, Ordering::AcqRel) + 1;
        let pushed = inner.pin.push(1);
        debug_assert_eq!(pushed, seq);

        let new_buf = &self.bufs[1 - old_idx];
        if inner.buf_size_want > new_buf.size() {
            debug!(
                buf_size_want = inner.buf_size_want,
                "growing journal buffer"
            );
            new_buf.grow_to(inner.buf_size_want);
        }
        new_buf.init_for_seq(seq);

        inner.cur_buf_sectors = 0;
        inner.write_deadline = None;

        drop(inner);

        self.buf_put(old_idx, need_write_just_set);
        BufSwitch::Unlocked
    }

    /// Tries to open the next entry.  `Ok(false)` means the journal is full
    /// (pin fifo or device space) and the caller must wait.
    pub(crate) fn entry_open(
        &self,
        inner: &mut Inner<D>,
        for_meta: bool,
    ) -> Result<bool, JournalError> {
        debug_assert!(!self.state.load().entry_is_open());

        // The slot for the entry opened here is only pushed when it closes;
        // keeping one slot of headroom for that push is what the ordinary
        // path's stricter bound provides.  The meta path runs inside reclaim
        // and gets the last slot.
        let required_slots = if for_meta { 1 } else { 2 };
        if inner.pin.free() < required_slots {
            return Ok(false);
        }

        // The sealed previous entry may not have been placed on the rings
        // yet; its sectors are spoken for.
        let pending = if self.state.load().prev_buf_unwritten() {
            inner.prev_buf_sectors
        } else {
            0
        };
        let sectors = entry_sectors(&inner.devices, pending)?;
        if sectors == 0 {
            return Ok(false);
        }

        let buf = &self.bufs[self.state.load().idx()];
        buf.set_disk_sectors(sectors);

        let sectors = sectors.min((buf.size() / SECTOR_SIZE) as u32);
        inner.cur_buf_sectors = sectors;

        let mut u64s = (sectors as usize * SECTOR_SIZE / 8) as i64;
        u64s -= i64::from(JSET_HEADER_U64S);
        // Btree roots and prio pointers are appended at dispatch time.
        u64s -= i64::from(entry_u64s_reserve());
        let u64s = u64s.max(0) as u32;
        debug_assert!(u64s < OFFSET_CLOSED);

        if u64s <= buf.u64s() {
            return Ok(false);
        }

        // Must be published before the entry is marked open.
        self.cur_entry_u64s.store(u64s, Ordering::Release);

        let opened = self.state.update(|s| {
            if s.is_error() {
                None
            } else {
                // Pick up anything already added to the buffer.
                Some(s.with_offset(buf.u64s()))
            }
        });
        if opened.is_err() {
            return Err(JournalError::Io);
        }

        if let Some(blocked_since) = self.res_get_blocked_start.swap(None) {
            histogram!(
                "journal_res_get_blocked_seconds",
                blocked_since.elapsed().as_secs_f64()
            );
        }

        inner.write_deadline = Some(Instant::now() + self.config.write_delay);
        self.write_kick.notify_one();
        self.wait.notify_waiters();
        Ok(true)
    }

    /// One-way transition into the error state.  All subsequent reservations
    /// fail with `Io`; every waiter is woken to observe the error.
    pub fn halt(&self) {
        if !self.state.halt() {
            return;
        }
        error!("journal halted");
        self.wait.notify_waiters();
        self.bufs[0].wait.notify_waiters();
        self.bufs[1].wait.notify_waiters();
        self.write_kick.notify_one();
        self.reclaim_kick.notify_one();
    }

    // Durability waiters.

    /// Waits for `seq` to become durable without forcing a write; with no
    /// other activity that can take up to the configured write delay.
    pub async fn wait_on_seq(&self, seq: u64) -> Result<(), JournalError> {
        loop {
            let target_idx = {
                let _inner = self.inner.lock();
                let cur = self.cur_seq();
                assert!(seq <= cur, "waiting on an unallocated journal sequence");

                if seq <= self.seq_ondisk() {
                    return Ok(());
                }
                if self.error() {
                    return Err(JournalError::Io);
                }

                let s = self.state.load();
                if seq == cur {
                    s.idx()
                } else if seq + 1 == cur && s.prev_buf_unwritten() {
                    1 - s.idx()
                } else {
                    // Older than the in-flight window; completion ordering
                    // means it is already durable.
                    return Ok(());
                }
            };

            let completed = self.bufs[target_idx].wait.notified();
            tokio::pin!(completed);
            completed.as_mut().enable();

            // Raced with write completion (or failure)?
            if seq <= self.seq_ondisk() {
                return Ok(());
            }
            if self.error() {
                return Err(JournalError::Io);
            }

            completed.await;
        }
    }

    fn seq_flushed(&self, seq: u64) -> Flushed {
        let inner = self.inner.lock();
        let cur = self.cur_seq();
        assert!(seq <= cur, "flushing an unallocated journal sequence");

        if seq <= self.seq_ondisk() {
            return Flushed::Done;
        }
        if self.error() {
            return Flushed::Errored;
        }

        if seq == cur {
            assert!(
                self.state.load().entry_is_open(),
                "flushing the current sequence with no entry open"
            );

            let set_need_write = !self.need_write.swap(true, Ordering::AcqRel);
            if set_need_write {
                self.need_write_time.store(Some(Instant::now()));
            }

            return match self.buf_switch(inner, set_need_write) {
                BufSwitch::Error(_guard) => Flushed::Errored,
                BufSwitch::Closed(_guard) => {
                    unreachable!("entry went from open to closed under the journal lock")
                }
                BufSwitch::Inuse(_guard) => Flushed::NotYet,
                BufSwitch::Unlocked => Flushed::NotYet,
            };
        }

        Flushed::NotYet
    }

    /// Waits until `seq` is on stable storage, forcing the entry out if it is
    /// still open.
    ///
    /// Dropping the returned future cancels the wait without consuming any
    /// pins.
    ///
    /// # Errors
    ///
    /// `Io` if the journal was halted before `seq` became durable.  Sequences
    /// that were already durable when the halt happened still report `Ok`.
    pub async fn flush_seq(&self, seq: u64) -> Result<(), JournalError> {
        let start = Instant::now();
        let result = loop {
            let parked = self.wait.notified();
            tokio::pin!(parked);
            parked.as_mut().enable();
            match self.seq_flushed(seq) {
                Flushed::Done => break Ok(()),
                Flushed::Errored => break Err(JournalError::Io),
                Flushed::NotYet => parked.await,
            }
        };
        histogram!(
            "journal_flush_seq_seconds",
            start.elapsed().as_secs_f64()
        );
        result
    }

    /// Flushes the currently open entry, or the last one if none is open.
    pub async fn flush(&self) -> Result<(), JournalError> {
        let seq = {
            let _inner = self.inner.lock();
            let cur = self.cur_seq();
            if self.state.load().entry_is_open() {
                cur
            } else if cur > 0 {
                cur - 1
            } else {
                return Ok(());
            }
        };
        self.flush_seq(seq).await
    }

    /// Forces some entry to progress: reserves a minimum-sized no-op entry,
    /// releases it, and flushes its sequence.
    ///
    /// This is the reentry path the allocator is allowed to use from inside
    /// reclaim, so it runs with the relaxed pin-fifo bound.
    pub async fn meta(&self) -> Result<(), JournalError> {
        let u64s = jset_u64s(0);
        let res = self.res_get_inner(u64s, u64s, true).await?;
        let seq = res.seq;
        self.res_put(res);
        self.flush_seq(seq).await
    }

    /// Ensures the entry carrying `seq` is open, opening it if necessary and
    /// waiting (with reclaim kicked) while the journal is full.
    ///
    /// Used by interior-node updates writing new btree roots: roots ride in
    /// every entry, so no reservation is needed, just an open entry.
    pub async fn open_seq(&self, seq: u64) -> Result<(), JournalError> {
        loop {
            let parked = self.wait.notified();
            tokio::pin!(parked);
            parked.as_mut().enable();

            let opened = {
                let mut inner = self.inner.lock();
                let cur = self.cur_seq();
                assert!(seq <= cur, "opening an unallocated journal sequence");
                if seq < cur || self.state.load().entry_is_open() {
                    return Ok(());
                }
                self.entry_open(&mut inner, false)?
            };
            if opened {
                return Ok(());
            }

            self.reclaim_work();
            parked.await;
        }
    }

    /// The oldest sequence not yet written out.
    pub fn last_unwritten_seq(&self) -> u64 {
        let _inner = self.inner.lock();
        let mut seq = self.cur_seq();
        if self.state.load().prev_buf_unwritten() {
            seq -= 1;
        }
        seq
    }

    // Pins.

    /// Holds entry `seq` live until the returned handle is surrendered to
    /// [`Journal::pin_drop`].  `flush` runs exactly once, after the entry is
    /// durable and the last reference is gone.
    pub fn pin_add(
        &self,
        seq: u64,
        name: &'static str,
        flush: Option<FlushFn>,
    ) -> PinHandle {
        let mut inner = self.inner.lock();
        assert!(
            inner.pin.contains(seq),
            "pinning a sequence outside the live window"
        );
        let id = self.next_pin_id.fetch_add(1, Ordering::Relaxed);
        let slot = inner.pin.slot_mut(seq);
        slot.count += 1;
        slot.list.push(PinEntry { id, name, flush });
        PinHandle { seq, id }
    }

    /// Releases a pin.  If that leaves the entry durable and unreferenced,
    /// its flush callbacks run and reclamation advances past it.
    pub fn pin_drop(&self, pin: PinHandle) {
        let callbacks = {
            let mut inner = self.inner.lock();
            debug_assert!(inner.pin.contains(pin.seq));
            let ondisk = self.seq_ondisk();
            let slot = inner.pin.slot_mut(pin.seq);
            slot.count = slot
                .count
                .checked_sub(1)
                .expect("journal pin refcount underflow");

            if slot.count == 0 && pin.seq <= ondisk {
                let callbacks = slot.flush_all();
                inner.pin.reclaim_fast();
                self.reclaim_kick.notify_one();
                self.wait.notify_waiters();
                callbacks
            } else {
                // Not durable yet: the writer driver flushes this slot when
                // the entry lands.
                Vec::new()
            }
        };

        for callback in callbacks {
            callback();
        }
    }

    // Introspection.

    /// Read-only dump of journal state, one `key: value` per line.
    pub fn debug_state(&self) -> String {
        let inner = self.inner.lock();
        let s = self.state.load();
        let mut out = String::new();

        let _ = writeln!(out, "active journal entries:\t{}", inner.pin.used());
        let _ = writeln!(out, "seq:\t\t\t{}", self.cur_seq());
        let _ = writeln!(out, "last_seq:\t\t{}", inner.pin.front_seq());
        let _ = writeln!(out, "last_seq_ondisk:\t{}", self.last_seq_ondisk());
        let _ = writeln!(out, "reservation count:\t{}", s.count(s.idx()));
        let _ = writeln!(out, "reservation offset:\t{}", s.cur_entry_offset());
        let _ = writeln!(
            out,
            "current entry u64s:\t{}",
            self.cur_entry_u64s.load(Ordering::Acquire)
        );
        let _ = writeln!(out, "io in flight:\t\t{}", i32::from(s.prev_buf_unwritten()));
        let _ = writeln!(
            out,
            "need write:\t\t{}",
            i32::from(self.need_write.load(Ordering::Acquire))
        );
        let _ = writeln!(out, "dirty:\t\t\t{}", i32::from(s.entry_is_open()));
        let _ = writeln!(
            out,
            "replay done:\t\t{}",
            i32::from(self.replay_done.load(Ordering::Acquire))
        );

        for dev in inner.devices.iter().filter(|dev| dev.nr() > 0) {
            let _ = writeln!(out, "dev {}:", dev.idx);
            let _ = writeln!(out, "\tnr\t\t{}", dev.nr());
            let _ = writeln!(
                out,
                "\tcur_idx\t\t{} (seq {})",
                dev.cur_idx, dev.bucket_seq[dev.cur_idx]
            );
            let _ = writeln!(
                out,
                "\tlast_idx\t{} (seq {})",
                dev.last_idx, dev.bucket_seq[dev.last_idx]
            );
        }

        out
    }

    /// Read-only dump of the pin fifo: per-sequence refcounts and registered
    /// flush callbacks.
    pub fn debug_pins(&self) -> String {
        let inner = self.inner.lock();
        let mut out = String::new();

        for (seq, slot) in inner.pin.iter() {
            let _ = writeln!(out, "{}: count {}", seq, slot.count);
            for entry in &slot.list {
                let _ = writeln!(out, "\t{}", entry.name);
            }
            if !slot.flushed.is_empty() {
                let _ = writeln!(out, "flushed:");
                for name in &slot.flushed {
                    let _ = writeln!(out, "\t{}", name);
                }
            }
        }

        out
    }

    // Lifecycle.

    /// Brings the journal online: preloads the pin fifo past any blacklisted
    /// sequences, opens bookkeeping for the first entry, stages blacklist
    /// ranges into it and spawns the background machinery.
    ///
    /// `blacklist` holds `[start, end]` sequence ranges replay must skip.
    pub fn start(self: &Arc<Self>, blacklist: &[(u64, u64)]) {
        let blacklist_max = blacklist.iter().map(|&(_, end)| end).max().unwrap_or(0);

        {
            let mut inner = self.inner.lock();

            // New sequences must begin past the blacklist.
            while self.cur_seq() < blacklist_max {
                self.seq.fetch_add(1, Ordering::AcqRel);
                inner.pin.push(0);
            }

            // buf_switch only initializes the next entry when it closes an
            // open one; the very first entry is initialized here.
            let seq = self.seq.fetch_add(1, Ordering::AcqRel) + 1;
            let pushed = inner.pin.push(1);
            debug_assert_eq!(pushed, seq);

            let idx = self.state.load().idx();
            self.bufs[idx].init_for_seq(seq);

            // Blacklist ranges only have to go down with the next entry we
            // write, so they simply ride in it.
            for &(start, end) in blacklist {
                self.bufs[idx].append(&[
                    pack_entry_header(2, 0, 0, JsetEntryKind::Blacklist),
                    start,
                    end,
                ]);
            }
        }

        debug!(seq = self.cur_seq(), "journal started");
        self.spawn_tasks();
        self.reclaim_kick.notify_one();
    }

    /// Quiesces and shuts down the journal: flushes anything open, waits out
    /// in-flight writes, and joins the background tasks.
    pub async fn stop(&self) {
        loop {
            let parked = self.wait.notified();
            tokio::pin!(parked);
            parked.as_mut().enable();
            if self.flush_write() {
                break;
            }
            parked.await;
        }

        self.stopping.store(true, Ordering::Release);
        self.write_kick.notify_one();
        self.reclaim_kick.notify_one();

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        debug!("journal stopped");
    }

    /// Closes the open entry if any.  Returns true when there is nothing left
    /// to flush and no write in flight.
    pub(crate) fn flush_write(&self) -> bool {
        let inner = self.inner.lock();
        let s = self.state.load();
        let quiesced = !s.prev_buf_unwritten();

        if !s.entry_is_open() {
            return quiesced;
        }

        let set_need_write = !self.need_write.swap(true, Ordering::AcqRel);
        if set_need_write {
            self.need_write_time.store(Some(Instant::now()));
        }
        match self.buf_switch(inner, set_need_write) {
            BufSwitch::Unlocked => false,
            BufSwitch::Error(_guard) | BufSwitch::Inuse(_guard) | BufSwitch::Closed(_guard) => {
                quiesced
            }
        }
    }
}
