//! The writer driver.
//!
//! A sealed buffer whose last reservation has been released is handed to the
//! background driver task, which places it on every read-write member
//! device's journal bucket ring, submits the writes, and on completion
//! publishes durability, releases pins and wakes every waiter.  The same task
//! owns the delayed-write timer that forces an idle open entry out after the
//! configured delay; a second task drives periodic reclamation.

use std::{
    sync::{atomic::Ordering, Arc},
    time::Instant,
};

use metrics::histogram;
use parking_lot::MutexGuard;

use crate::{
    common::block_sectors,
    entry::{
        encode_jset, pack_entry_header, JsetEntryKind, JsetHeader, BKEY_EXTENT_U64S_MAX,
        JSET_HEADER_U64S,
    },
    io::BlockDev,
    journal::{Inner, Journal},
};

impl<D: BlockDev> Journal<D> {
    pub(crate) fn spawn_tasks(self: &Arc<Self>) {
        let writer = {
            let journal = Arc::clone(self);
            tokio::spawn(async move { journal.write_loop().await })
        };
        let reclaim = {
            let journal = Arc::clone(self);
            tokio::spawn(async move { journal.reclaim_loop().await })
        };
        self.tasks.lock().extend([writer, reclaim]);
    }

    /// True when the sealed buffer has no outstanding reservations and is not
    /// yet being written.
    fn write_ready(&self) -> bool {
        let s = self.state.load();
        s.prev_buf_unwritten()
            && s.count(1 - s.idx()) == 0
            && !self.inner.lock().write_in_flight
    }

    async fn write_loop(self: Arc<Self>) {
        loop {
            let kicked = self.write_kick.notified();
            tokio::pin!(kicked);
            kicked.as_mut().enable();

            if self.write_ready() {
                self.do_write().await;
                continue;
            }

            if self.stopping.load(Ordering::Acquire) {
                break;
            }

            let deadline = self.inner.lock().write_deadline;
            match deadline {
                Some(deadline) => {
                    let sleep =
                        tokio::time::sleep_until(tokio::time::Instant::from_std(deadline));
                    tokio::select! {
                        _ = kicked => {}
                        _ = sleep => self.write_timer_fire(),
                    }
                }
                None => kicked.await,
            }
        }
    }

    /// The delayed-write timer: force out an entry that has sat open for the
    /// configured write delay.
    fn write_timer_fire(&self) {
        {
            let mut inner = self.inner.lock();
            match inner.write_deadline {
                // Disarm before switching; completion re-arms if needed.
                Some(deadline) if deadline <= Instant::now() => inner.write_deadline = None,
                _ => return,
            }
        }
        trace!("write delay elapsed, forcing entry out");
        self.flush_write();
    }

    async fn do_write(&self) {
        let (idx, seq, header, payload, targets) = {
            let mut inner = self.inner.lock();
            if inner.write_in_flight {
                return;
            }
            let s = self.state.load();
            if !(s.prev_buf_unwritten() && s.count(1 - s.idx()) == 0) {
                return;
            }

            let idx = 1 - s.idx();
            let buf = &self.bufs[idx];
            let seq = buf.seq();
            let mut payload = buf.read_payload(buf.u64s());

            // Btree roots ride in every entry; they go into the space the
            // reservation path held back.
            let roots = self.roots.btree_roots();
            for root in &roots {
                assert!(root.key.len() as u32 <= BKEY_EXTENT_U64S_MAX);
                payload.push(pack_entry_header(
                    root.key.len() as u32,
                    root.btree_id as u8,
                    root.level,
                    JsetEntryKind::BtreeRoot,
                ));
                payload.extend_from_slice(&root.key);
            }

            let u64s = payload.len() as u32;
            let header = JsetHeader {
                seq,
                last_seq: buf.last_seq(),
                u64s,
                block_size: self.config.block_size,
            };
            let sectors =
                block_sectors((JSET_HEADER_U64S + u64s) as usize * 8, self.config.block_size);
            debug_assert!(sectors <= inner.prev_buf_sectors);

            let mut targets = Vec::new();
            for dev in inner
                .devices
                .iter_mut()
                .filter(|dev| dev.rw && dev.nr() > 0)
            {
                match dev.place_write(sectors, seq) {
                    Some(start_sector) => {
                        targets.push((dev.idx, Arc::clone(&dev.dev), start_sector));
                    }
                    None => {
                        warn!(dev = dev.idx, "journal bucket ring full, skipping device");
                    }
                }
            }

            let target_idxs: Vec<u8> = targets.iter().map(|(idx, _, _)| *idx).collect();
            inner.pin.slot_mut(seq).devs = target_idxs.clone();
            inner.prev_targets = target_idxs;
            inner.write_in_flight = true;

            (idx, seq, header, payload, targets)
        };

        let bytes = encode_jset(header, &payload);

        let mut ok_devs = Vec::with_capacity(targets.len());
        for (dev_idx, dev, start_sector) in targets {
            let result = async {
                dev.write_sectors(start_sector, &bytes).await?;
                dev.flush().await
            }
            .await;

            match result {
                Ok(()) => ok_devs.push(dev_idx),
                Err(error) => {
                    error!(dev = dev_idx, %error, "journal write failed");
                }
            }
        }

        trace!(
            seq,
            bytes = bytes.len(),
            devs = ok_devs.len(),
            "journal write completed"
        );
        self.write_done(idx, seq, header.last_seq, ok_devs);
    }

    /// Completion: publish durability, release the entry's implicit pin
    /// reference, run flush callbacks that are now runnable, and wake
    /// everything that might be waiting on this write.
    fn write_done(&self, idx: usize, seq: u64, last_seq: u64, ok_devs: Vec<u8>) {
        let success = !ok_devs.is_empty();

        let callbacks = {
            let mut inner = self.inner.lock();
            inner.write_in_flight = false;
            inner.prev_targets.clear();

            if !success {
                return self.write_failed(inner, idx);
            }

            self.seq_ondisk.store(seq, Ordering::Release);
            self.last_seq_ondisk.store(last_seq, Ordering::Release);
            inner.pin.slot_mut(seq).devs = ok_devs;

            // Release the reference the entry was born with; from here only
            // client pins hold it.
            let slot = inner.pin.slot_mut(seq);
            slot.count = slot
                .count
                .checked_sub(1)
                .expect("entry's implicit pin reference already released");

            let mut callbacks = Vec::new();
            for s in inner.pin.front_seq()..=seq {
                if inner.pin.slot(s).count == 0 {
                    callbacks.extend(inner.pin.slot_mut(s).flush_all());
                }
            }
            inner.pin.reclaim_fast();

            // A flush arrived while this write was in flight: force the next
            // entry out promptly.
            if self.need_write.load(Ordering::Acquire)
                && self.state.load().entry_is_open()
            {
                inner.write_deadline = Some(Instant::now());
                self.write_kick.notify_one();
            }

            callbacks
        };

        if let Some(need_write_since) = self.need_write_time.swap(None) {
            histogram!(
                "journal_write_delay_seconds",
                need_write_since.elapsed().as_secs_f64()
            );
        }

        self.state
            .update(|s| Some(s.with_prev_buf_unwritten(false)))
            .ok();

        self.bufs[idx].wait.notify_waiters();
        self.wait.notify_waiters();
        self.reclaim_kick.notify_one();

        for callback in callbacks {
            callback();
        }
    }

    /// Every device write failed: the entry cannot be made durable, so the
    /// journal is done.  The entry keeps its implicit pin reference so
    /// reclamation never advances past an entry that is not on disk.
    fn write_failed(&self, inner: MutexGuard<'_, Inner<D>>, idx: usize) {
        drop(inner);
        self.state
            .update(|s| Some(s.with_prev_buf_unwritten(false)))
            .ok();
        self.halt();
        self.bufs[idx].wait.notify_waiters();
        self.wait.notify_waiters();
    }

    /// Deeper reclamation: advance `last_seq` past unreferenced entries and
    /// per-device `last_idx` past buckets no longer required on disk.
    ///
    /// Runs from the background tick, and directly from the reservation slow
    /// path so progress does not depend on a schedulable worker.
    pub(crate) fn reclaim_work(&self) {
        let (popped, released) = {
            let mut inner = self.inner.lock();
            let popped = inner.pin.reclaim_fast();
            let last_seq_ondisk = self.last_seq_ondisk.load(Ordering::Acquire);
            let mut released = 0;
            for dev in &mut inner.devices {
                released += dev.reclaim_buckets(last_seq_ondisk);
            }
            (popped, released)
        };

        if popped > 0 || released > 0 {
            trace!(popped, released, "journal reclaim made progress");
            // Freed pin slots or buckets may unblock reservations.
            self.wait.notify_waiters();
        }
    }

    async fn reclaim_loop(self: Arc<Self>) {
        loop {
            let kicked = self.reclaim_kick.notified();
            tokio::pin!(kicked);
            kicked.as_mut().enable();

            if self.stopping.load(Ordering::Acquire) {
                break;
            }

            tokio::select! {
                _ = kicked => {}
                _ = tokio::time::sleep(self.config.reclaim_delay) => {}
            }

            if self.stopping.load(Ordering::Acquire) {
                break;
            }
            self.reclaim_work();
        }
    }
}
