use std::{io, sync::Arc};

use async_trait::async_trait;
use snafu::{ResultExt, Snafu};

use crate::{
    common::JOURNAL_BUCKETS_MIN,
    io::BlockDev,
    journal::{Journal, JournalError},
};

/// Error from the external bucket allocator.
#[derive(Debug, Snafu)]
pub enum AllocError {
    /// The device has no free bucket to hand out.
    #[snafu(display("no free buckets available on device"))]
    NoSpace,
}

/// Error from device-level journal operations.
#[derive(Debug, Snafu)]
pub enum DeviceError {
    /// Bucket allocation failed and growth cannot proceed.
    #[snafu(display("journal bucket allocation failed: {}", source))]
    Alloc { source: AllocError },

    /// The superblock layer refused the updated bucket list.
    #[snafu(display("superblock update failed: {}", source))]
    Superblock { source: SbError },

    /// The named device is not a member of this journal.
    #[snafu(display("unknown device {}", dev))]
    UnknownDevice { dev: u8 },
}

/// Error from the external superblock layer.
#[derive(Debug, Snafu)]
pub enum SbError {
    #[snafu(display("superblock I/O error: {}", source))]
    Io { source: io::Error },

    #[snafu(display("superblock field resize failed: {}", reason))]
    Resize { reason: String },
}

/// Allocation priority, forwarded to the external allocator.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Reserve {
    /// Draw from the allocator's own reserve; journal growth uses this so it
    /// cannot starve behind normal data writes.
    Alloc,
    /// Normal-priority allocation.
    None,
}

/// A freshly allocated bucket, held open until returned via
/// [`Allocator::open_bucket_put`].
#[derive(Debug)]
pub struct OpenBucket {
    pub dev: u8,
    pub bucket: u64,
}

/// Contract with the on-disk extent/bucket allocator.
///
/// The journal consumes buckets; it never frees them directly.  Allocation
/// may suspend while the allocator finds or reclaims space.
#[async_trait]
pub trait Allocator: Send + Sync {
    /// Reserves `sectors` of raw space ahead of a bucket allocation, so that
    /// the allocation below cannot overcommit the device.
    async fn disk_reservation(&self, sectors: u64) -> Result<(), AllocError>;

    /// Returns a reservation taken with [`Allocator::disk_reservation`].
    fn disk_reservation_put(&self, sectors: u64);

    /// Allocates one bucket on `dev`.
    async fn bucket_alloc(&self, dev: u8, reserve: Reserve) -> Result<OpenBucket, AllocError>;

    /// Releases the open-bucket token once the bucket is recorded.
    fn open_bucket_put(&self, ob: OpenBucket);

    /// Allocation path for a filesystem still being created, where the free
    /// space maps are not yet live.
    fn bucket_alloc_new_fs(&self, dev: u8) -> Result<u64, AllocError>;

    /// Accounts `bucket` as metadata in the usage bookkeeping.
    fn mark_metadata_bucket(&self, dev: u8, bucket: u64, new_fs: bool);
}

/// Contract with the superblock I/O layer.
#[async_trait]
pub trait SuperBlock: Send + Sync {
    /// The bucket list recorded for `dev`, as read at mount time.
    fn journal_buckets(&self, dev: u8) -> Vec<u64>;

    /// Stages an updated bucket list for `dev` in the in-memory superblock.
    fn resize_journal(&self, dev: u8, buckets: &[u64]) -> Result<(), SbError>;

    /// Writes the staged superblock out to all devices.
    async fn write_super(&self) -> Result<(), SbError>;
}

/// Per-device journal state: a circular array of buckets.
///
/// `cur_idx` is the bucket being written, `last_idx` the oldest bucket whose
/// newest entry is still required on disk.  `bucket_seq[i]` is the highest
/// sequence written into `buckets[i]`.
pub(crate) struct JournalDevice<D> {
    pub idx: u8,
    pub dev: Arc<D>,
    pub rw: bool,
    pub buckets: Vec<u64>,
    pub bucket_seq: Vec<u64>,
    pub cur_idx: usize,
    pub last_idx: usize,
    /// Sectors still unwritten in the current bucket.
    pub sectors_free: u32,
}

impl<D: BlockDev> JournalDevice<D> {
    pub fn new(idx: u8, dev: Arc<D>, buckets: Vec<u64>) -> Self {
        let sectors_free = dev.bucket_sectors();
        let nr = buckets.len();
        Self {
            idx,
            dev,
            rw: true,
            bucket_seq: vec![0; nr],
            buckets,
            cur_idx: 0,
            last_idx: 0,
            sectors_free,
        }
    }

    pub fn nr(&self) -> usize {
        self.buckets.len()
    }

    /// Whether `cur_idx` may advance to the next bucket without overrunning
    /// unreclaimed entries.
    pub fn ring_has_free_bucket(&self) -> bool {
        self.free_buckets_ahead() > 0
    }

    /// Buckets `cur_idx` can still advance into before hitting `last_idx`.
    fn free_buckets_ahead(&self) -> usize {
        let nr = self.nr();
        if nr == 0 {
            return 0;
        }
        (self.last_idx + nr - 1 - self.cur_idx) % nr
    }

    /// The largest contiguous write this device can accept once a pending
    /// entry of `pending` sectors (the sealed-but-unwritten buffer) has been
    /// placed.
    pub fn contiguous_sectors(&self, pending: u32) -> u32 {
        let bucket_sectors = self.dev.bucket_sectors();
        let mut sectors_free = self.sectors_free;
        let mut free_buckets = self.free_buckets_ahead();

        if pending > 0 {
            if sectors_free < pending {
                if free_buckets == 0 {
                    return 0;
                }
                free_buckets -= 1;
                sectors_free = bucket_sectors;
            }
            sectors_free = sectors_free.saturating_sub(pending);
        }

        if free_buckets > 0 {
            sectors_free.max(bucket_sectors)
        } else {
            sectors_free
        }
    }

    /// Positions the device for a write of `sectors`, advancing to the next
    /// bucket if the current one cannot hold it contiguously.  Returns the
    /// starting sector, or `None` if the device has no room.
    pub fn place_write(&mut self, sectors: u32, seq: u64) -> Option<u64> {
        if self.nr() == 0 {
            return None;
        }
        if self.sectors_free < sectors {
            if !self.ring_has_free_bucket() {
                return None;
            }
            self.cur_idx = (self.cur_idx + 1) % self.nr();
            self.sectors_free = self.dev.bucket_sectors();
            if self.sectors_free < sectors {
                return None;
            }
        }

        let bucket_sectors = u64::from(self.dev.bucket_sectors());
        let start = self.buckets[self.cur_idx] * bucket_sectors
            + u64::from(self.dev.bucket_sectors() - self.sectors_free);
        self.bucket_seq[self.cur_idx] = seq;
        self.sectors_free -= sectors;
        Some(start)
    }

    /// Advances `last_idx` past buckets whose newest entry is no longer
    /// required on disk, freeing them for reuse.  Returns how many buckets
    /// were released.
    pub fn reclaim_buckets(&mut self, last_seq_ondisk: u64) -> usize {
        let mut released = 0;
        while self.last_idx != self.cur_idx && self.bucket_seq[self.last_idx] < last_seq_ondisk {
            self.last_idx = (self.last_idx + 1) % self.nr();
            released += 1;
        }
        released
    }

    /// Inserts a newly allocated bucket at the tail of the circular order.
    pub fn insert_bucket(&mut self, bucket: u64) {
        let old_nr = self.nr();
        self.buckets.insert(self.last_idx, bucket);
        self.bucket_seq.insert(self.last_idx, 0);
        if self.last_idx < old_nr {
            if self.cur_idx >= self.last_idx {
                self.cur_idx += 1;
            }
            self.last_idx += 1;
        }
        if old_nr == 0 {
            self.sectors_free = self.dev.bucket_sectors();
        }
    }
}

/// Initial ring size for a fresh device: one bucket per 256, clamped to
/// `[JOURNAL_BUCKETS_MIN, min(1024, 512MiB / bucket_size)]`.
pub(crate) fn initial_nr_buckets<D: BlockDev>(dev: &D) -> usize {
    let by_size = ((1u64 << 20) / u64::from(dev.bucket_sectors())).min(1024) as usize;
    ((dev.nbuckets() >> 8) as usize).clamp(JOURNAL_BUCKETS_MIN, by_size.max(JOURNAL_BUCKETS_MIN))
}

/// Sectors spanned by `nr` buckets of `dev`.
pub(crate) fn buckets_to_sectors<D: BlockDev>(dev: &D, nr: usize) -> u64 {
    nr as u64 * u64::from(dev.bucket_sectors())
}

/// The largest entry, in sectors, every read-write device can take
/// contiguously once `pending` sectors of sealed-but-unwritten entry have
/// been placed.  Zero means the journal is out of device space until
/// reclamation frees buckets; no read-write device at all means the
/// filesystem must go read-only.
pub(crate) fn entry_sectors<D: BlockDev>(
    devices: &[JournalDevice<D>],
    pending: u32,
) -> Result<u32, JournalError> {
    let mut sectors = u32::MAX;
    let mut nr_rw = 0;
    for dev in devices.iter().filter(|dev| dev.rw && dev.nr() > 0) {
        sectors = sectors.min(dev.contiguous_sectors(pending));
        nr_rw += 1;
    }
    if nr_rw == 0 {
        return Err(JournalError::RoFs);
    }
    Ok(sectors)
}

impl<D: BlockDev> Journal<D> {
    /// Adopts a member device whose journal bucket list was read from its
    /// superblock at mount time.
    pub fn dev_journal_init(&self, dev_idx: u8, dev: Arc<D>) {
        let buckets = self.sb.journal_buckets(dev_idx);
        debug!(dev = dev_idx, nr = buckets.len(), "journal device adopted");
        self.inner
            .lock()
            .devices
            .push(JournalDevice::new(dev_idx, dev, buckets));
    }

    /// Allocates a journal on a fresh device, sized by
    /// [`initial_nr_buckets`], through the new-filesystem allocation path.
    pub async fn dev_journal_alloc(&self, dev_idx: u8, dev: Arc<D>) -> Result<(), DeviceError> {
        let nr = initial_nr_buckets(dev.as_ref());
        self.inner
            .lock()
            .devices
            .push(JournalDevice::new(dev_idx, dev, Vec::new()));
        self.grow_journal(dev_idx, nr, true).await
    }

    /// Expands a device's journal ring to `nr` buckets.  Shrinking is not
    /// supported; a smaller `nr` is a no-op.
    pub async fn set_nr_journal_buckets(&self, dev_idx: u8, nr: usize) -> Result<(), DeviceError> {
        self.grow_journal(dev_idx, nr, false).await
    }

    async fn grow_journal(&self, dev_idx: u8, nr: usize, new_fs: bool) -> Result<(), DeviceError> {
        let (dev, current_nr) = {
            let inner = self.inner.lock();
            let device = inner
                .devices
                .iter()
                .find(|device| device.idx == dev_idx)
                .ok_or(DeviceError::UnknownDevice { dev: dev_idx })?;
            (Arc::clone(&device.dev), device.nr())
        };
        if nr <= current_nr {
            return Ok(());
        }

        let _sb_guard = self.sb_lock.lock().await;

        // Journal buckets aren't counted as used sectors until marked, but
        // the reservation guarantees the allocations below can't overcommit
        // the device.
        let reserved = buckets_to_sectors(dev.as_ref(), nr - current_nr);
        if !new_fs {
            self.allocator
                .disk_reservation(reserved)
                .await
                .context(AllocSnafu)?;
        }

        let result = self.grow_journal_inner(dev_idx, current_nr, nr, new_fs).await;

        if !new_fs {
            self.allocator.disk_reservation_put(reserved);
        }
        result
    }

    async fn grow_journal_inner(
        &self,
        dev_idx: u8,
        current_nr: usize,
        nr: usize,
        new_fs: bool,
    ) -> Result<(), DeviceError> {
        let mut result = Ok(());
        let mut added = false;

        for _ in current_nr..nr {
            let (bucket, open_bucket) = if new_fs {
                match self.allocator.bucket_alloc_new_fs(dev_idx) {
                    Ok(bucket) => (bucket, None),
                    Err(error) => {
                        result = Err(error).context(AllocSnafu);
                        break;
                    }
                }
            } else {
                match self.allocator.bucket_alloc(dev_idx, Reserve::Alloc).await {
                    Ok(ob) => (ob.bucket, Some(ob)),
                    Err(error) => {
                        result = Err(error).context(AllocSnafu);
                        break;
                    }
                }
            };

            // New buckets go in at the ring tail; the on-disk list follows.
            let buckets = {
                let mut inner = self.inner.lock();
                let device = inner
                    .devices
                    .iter_mut()
                    .find(|device| device.idx == dev_idx)
                    .expect("device removed during journal growth");
                device.insert_bucket(bucket);
                device.buckets.clone()
            };

            if let Err(error) = self.sb.resize_journal(dev_idx, &buckets) {
                result = Err(error).context(SuperblockSnafu);
                break;
            }

            self.allocator.mark_metadata_bucket(dev_idx, bucket, new_fs);
            if let Some(ob) = open_bucket {
                self.allocator.open_bucket_put(ob);
            }
            added = true;
        }

        if added {
            if let Err(error) = self.sb.write_super().await {
                if result.is_ok() {
                    result = Err(error).context(SuperblockSnafu);
                }
            }
        }
        result
    }

    /// Drops `dev_idx` from future journal writes and waits out any write
    /// currently targeting it.
    pub async fn dev_journal_stop(&self, dev_idx: u8) {
        {
            let mut inner = self.inner.lock();
            if let Some(device) = inner
                .devices
                .iter_mut()
                .find(|device| device.idx == dev_idx)
            {
                device.rw = false;
            }
        }

        loop {
            let parked = self.wait.notified();
            tokio::pin!(parked);
            parked.as_mut().enable();
            if !self.writing_to_device(dev_idx) {
                return;
            }
            parked.await;
        }
    }

    fn writing_to_device(&self, dev_idx: u8) -> bool {
        let inner = self.inner.lock();
        self.state.load().prev_buf_unwritten() && inner.prev_targets.contains(&dev_idx)
    }
}
