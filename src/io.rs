use std::{io, path::Path};

use async_trait::async_trait;
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom},
    sync::Mutex,
};

use crate::common::SECTOR_SIZE;

/// Generalized interface to one member device's journal region.
///
/// The journal addresses a device as `nbuckets` fixed-size buckets of
/// `bucket_sectors` sectors each, and only ever issues whole-sector,
/// bucket-contiguous writes.  Block device submission itself lives outside
/// this crate; parameterizing over this trait is also what lets the test
/// suite run against in-memory devices with failure injection.
#[async_trait]
pub trait BlockDev: Send + Sync + 'static {
    /// Total buckets on the device usable by any consumer, journal included.
    fn nbuckets(&self) -> u64;

    /// Size of one bucket, in sectors.
    fn bucket_sectors(&self) -> u32;

    /// Writes `data` (a whole number of sectors) starting at `sector`.
    async fn write_sectors(&self, sector: u64, data: &[u8]) -> io::Result<()>;

    /// Reads `buf.len()` bytes starting at `sector`.  The running write path
    /// never reads; replay tooling and tests do.
    async fn read_sectors(&self, sector: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Flushes the device's volatile write cache.
    async fn flush(&self) -> io::Result<()>;
}

/// A file-backed device.
///
/// Stands in for real block device submission: one flat file, sized to the
/// full device, with sector-granular positioned I/O.
pub struct FileBlockDev {
    file: Mutex<File>,
    nbuckets: u64,
    bucket_sectors: u32,
}

impl FileBlockDev {
    /// Opens (creating and sizing if necessary) the backing file.
    pub async fn open<P: AsRef<Path>>(
        path: P,
        nbuckets: u64,
        bucket_sectors: u32,
    ) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .await?;
        file.set_len(nbuckets * u64::from(bucket_sectors) * SECTOR_SIZE as u64)
            .await?;

        Ok(Self {
            file: Mutex::new(file),
            nbuckets,
            bucket_sectors,
        })
    }
}

#[async_trait]
impl BlockDev for FileBlockDev {
    fn nbuckets(&self) -> u64 {
        self.nbuckets
    }

    fn bucket_sectors(&self) -> u32 {
        self.bucket_sectors
    }

    async fn write_sectors(&self, sector: u64, data: &[u8]) -> io::Result<()> {
        debug_assert_eq!(data.len() % SECTOR_SIZE, 0);
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(sector * SECTOR_SIZE as u64))
            .await?;
        file.write_all(data).await?;
        Ok(())
    }

    async fn read_sectors(&self, sector: u64, buf: &mut [u8]) -> io::Result<()> {
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(sector * SECTOR_SIZE as u64))
            .await?;
        file.read_exact(buf).await?;
        Ok(())
    }

    async fn flush(&self) -> io::Result<()> {
        let file = self.file.lock().await;
        file.sync_all().await
    }
}

#[cfg(test)]
mod tests {
    use temp_dir::TempDir;

    use super::*;

    #[tokio::test]
    async fn file_device_round_trips_sectors() {
        let dir = TempDir::new().expect("temp dir");
        let dev = FileBlockDev::open(dir.child("dev0"), 4, 8)
            .await
            .expect("open should size the backing file");
        assert_eq!(dev.nbuckets(), 4);
        assert_eq!(dev.bucket_sectors(), 8);

        let data = vec![0xAB; 2 * SECTOR_SIZE];
        dev.write_sectors(3, &data).await.expect("write");
        dev.flush().await.expect("flush");

        let mut back = vec![0; 2 * SECTOR_SIZE];
        dev.read_sectors(3, &mut back).await.expect("read");
        assert_eq!(back, data);
    }
}
