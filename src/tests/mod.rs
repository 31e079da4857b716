use std::{
    collections::HashMap,
    io,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::{
    common::SECTOR_SIZE,
    device::{AllocError, Allocator, OpenBucket, Reserve, SbError, SuperBlock},
    entry::{decode_jset, Jset, JsetStatus, NoRoots},
    io::BlockDev,
    journal::Journal,
    JournalConfig, JournalConfigBuilder,
};

mod invariants;
mod rollover;

pub(crate) fn install_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// An in-memory device: one flat byte region, with pause and failure
/// injection so tests can hold a write in flight or kill it outright.
pub(crate) struct MemoryDev {
    nbuckets: u64,
    bucket_sectors: u32,
    data: Mutex<Vec<u8>>,
    fail_writes: AtomicBool,
    paused: AtomicBool,
    unpause: Notify,
    /// Writes that have started, including ones held by `pause`.
    pub attempts: AtomicU64,
    /// Writes that have completed successfully.
    pub writes: AtomicU64,
}

impl MemoryDev {
    pub fn new(nbuckets: u64, bucket_sectors: u32) -> Self {
        Self {
            nbuckets,
            bucket_sectors,
            data: Mutex::new(vec![0; (nbuckets * u64::from(bucket_sectors)) as usize * SECTOR_SIZE]),
            fail_writes: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            unpause: Notify::new(),
            attempts: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Makes every subsequent write fail with an I/O error.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Release);
    }

    /// Holds subsequent writes in flight until `resume` is called.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        self.unpause.notify_waiters();
    }

    pub fn read_bytes(&self, sector: u64, len: usize) -> Vec<u8> {
        let data = self.data.lock();
        let start = sector as usize * SECTOR_SIZE;
        data[start..start + len].to_vec()
    }
}

#[async_trait]
impl BlockDev for MemoryDev {
    fn nbuckets(&self) -> u64 {
        self.nbuckets
    }

    fn bucket_sectors(&self) -> u32 {
        self.bucket_sectors
    }

    async fn write_sectors(&self, sector: u64, data: &[u8]) -> io::Result<()> {
        self.attempts.fetch_add(1, Ordering::AcqRel);
        loop {
            let resumed = self.unpause.notified();
            tokio::pin!(resumed);
            resumed.as_mut().enable();
            if !self.paused.load(Ordering::Acquire) {
                break;
            }
            resumed.await;
        }

        if self.fail_writes.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected write error"));
        }

        let mut stored = self.data.lock();
        let start = sector as usize * SECTOR_SIZE;
        stored[start..start + data.len()].copy_from_slice(data);
        self.writes.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn read_sectors(&self, sector: u64, buf: &mut [u8]) -> io::Result<()> {
        let stored = self.data.lock();
        let start = sector as usize * SECTOR_SIZE;
        buf.copy_from_slice(&stored[start..start + buf.len()]);
        Ok(())
    }

    async fn flush(&self) -> io::Result<()> {
        Ok(())
    }
}

/// Allocator handing out sequential bucket numbers per device.
pub(crate) struct MemAllocator {
    next_bucket: Mutex<HashMap<u8, u64>>,
    no_space: AtomicBool,
    pub marked: AtomicU64,
}

impl MemAllocator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_bucket: Mutex::new(HashMap::new()),
            no_space: AtomicBool::new(false),
            marked: AtomicU64::new(0),
        })
    }

    pub fn set_no_space(&self, no_space: bool) {
        self.no_space.store(no_space, Ordering::Release);
    }

    fn alloc(&self, dev: u8) -> Result<u64, AllocError> {
        if self.no_space.load(Ordering::Acquire) {
            return Err(AllocError::NoSpace);
        }
        let mut next = self.next_bucket.lock();
        let bucket = next.entry(dev).or_insert(1);
        let allocated = *bucket;
        *bucket += 1;
        Ok(allocated)
    }
}

#[async_trait]
impl Allocator for MemAllocator {
    async fn disk_reservation(&self, _sectors: u64) -> Result<(), AllocError> {
        if self.no_space.load(Ordering::Acquire) {
            return Err(AllocError::NoSpace);
        }
        Ok(())
    }

    fn disk_reservation_put(&self, _sectors: u64) {}

    async fn bucket_alloc(&self, dev: u8, _reserve: Reserve) -> Result<OpenBucket, AllocError> {
        self.alloc(dev).map(|bucket| OpenBucket { dev, bucket })
    }

    fn open_bucket_put(&self, _ob: OpenBucket) {}

    fn bucket_alloc_new_fs(&self, dev: u8) -> Result<u64, AllocError> {
        self.alloc(dev)
    }

    fn mark_metadata_bucket(&self, _dev: u8, _bucket: u64, _new_fs: bool) {
        self.marked.fetch_add(1, Ordering::AcqRel);
    }
}

/// Superblock stub recording staged bucket lists and write-outs.
pub(crate) struct MemSuperBlock {
    buckets: Mutex<HashMap<u8, Vec<u64>>>,
    pub writes: AtomicU64,
}

impl MemSuperBlock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            buckets: Mutex::new(HashMap::new()),
            writes: AtomicU64::new(0),
        })
    }

    pub fn buckets_for(&self, dev: u8) -> Vec<u64> {
        self.buckets.lock().get(&dev).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl SuperBlock for MemSuperBlock {
    fn journal_buckets(&self, dev: u8) -> Vec<u64> {
        self.buckets_for(dev)
    }

    fn resize_journal(&self, dev: u8, buckets: &[u64]) -> Result<(), SbError> {
        self.buckets.lock().insert(dev, buckets.to_vec());
        Ok(())
    }

    async fn write_super(&self) -> Result<(), SbError> {
        self.writes.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

pub(crate) const TEST_BUCKET_SECTORS: u32 = 16;

pub(crate) fn test_config() -> JournalConfig {
    JournalConfigBuilder::default()
        .block_size(512)
        .entry_size_min(4096)
        .entry_size_max(16384)
        // Keep the delayed-write timer out of the way; tests that want it
        // build their own config.
        .write_delay(Duration::from_secs(60))
        .reclaim_delay(Duration::from_millis(20))
        .build()
        .expect("test configuration must be valid")
}

pub(crate) struct TestJournal {
    pub journal: Arc<Journal<MemoryDev>>,
    pub devs: Vec<Arc<MemoryDev>>,
    pub allocator: Arc<MemAllocator>,
    pub sb: Arc<MemSuperBlock>,
}

impl TestJournal {
    /// The sector where the `nth` bucket in write order starts.
    ///
    /// Ring growth appends at the tail, so write order equals allocation
    /// order, and the test allocator numbers buckets from 1.
    pub fn bucket_sector(&self, _dev: u8, nth: usize) -> u64 {
        (nth as u64 + 1) * u64::from(TEST_BUCKET_SECTORS)
    }

    /// Decodes the entry set stored at `sector` on device `dev`.
    pub fn read_jset_at(&self, dev: u8, sector: u64) -> JsetStatus {
        let header = self.devs[dev as usize].read_bytes(sector, 48);
        let u64s = u32::from_le_bytes(header[40..44].try_into().unwrap());
        let total = 48 + u64s as usize * 8;
        decode_jset(&self.devs[dev as usize].read_bytes(sector, total))
    }

    /// Like `read_jset_at`, panicking unless the entry set is valid.
    pub fn jset_at(&self, dev: u8, sector: u64) -> Jset {
        match self.read_jset_at(dev, sector) {
            JsetStatus::Valid(jset) => jset,
            other => panic!("expected a valid entry set at sector {sector}: {other:?}"),
        }
    }
}

pub(crate) async fn new_journal(nr_devs: usize) -> TestJournal {
    build_journal(test_config(), nr_devs, &[]).await
}

pub(crate) async fn new_journal_with(config: JournalConfig, nr_devs: usize) -> TestJournal {
    build_journal(config, nr_devs, &[]).await
}

pub(crate) async fn build_journal(
    config: JournalConfig,
    nr_devs: usize,
    blacklist: &[(u64, u64)],
) -> TestJournal {
    install_tracing();

    let allocator = MemAllocator::new();
    let sb = MemSuperBlock::new();
    let journal = Journal::new(
        config,
        Arc::clone(&allocator) as Arc<dyn Allocator>,
        Arc::clone(&sb) as Arc<dyn SuperBlock>,
        Arc::new(NoRoots),
    );

    let mut devs = Vec::with_capacity(nr_devs);
    for idx in 0..nr_devs {
        let dev = Arc::new(MemoryDev::new(512, TEST_BUCKET_SECTORS));
        journal
            .dev_journal_alloc(idx as u8, Arc::clone(&dev))
            .await
            .expect("device journal allocation should not fail");
        devs.push(dev);
    }

    journal.start(blacklist);

    TestJournal {
        journal,
        devs,
        allocator,
        sb,
    }
}
