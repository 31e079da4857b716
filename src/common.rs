use std::time::Duration;

use serde::{Deserialize, Serialize};
use snafu::Snafu;

/// Device sector size, in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Smallest in-memory entry buffer, and the size both buffers start at.
pub const JOURNAL_ENTRY_SIZE_MIN: usize = 64 * 1024;

/// Largest an entry buffer is ever grown to.  No entry may exceed this, and
/// therefore no entry may exceed the largest journal bucket either.
pub const JOURNAL_ENTRY_SIZE_MAX: usize = 4 * 1024 * 1024;

/// Fewest journal buckets a device ring is ever sized to.
pub const JOURNAL_BUCKETS_MIN: usize = 8;

// The pin fifo is a fixed-size ring; it is never resized at runtime.  Under
// test it is kept small so the fifo-full reservation path is reachable
// without writing tens of thousands of entries.
#[cfg(not(test))]
pub(crate) const JOURNAL_PIN: usize = 1 << 15;
#[cfg(test)]
pub(crate) const JOURNAL_PIN: usize = 64;

const DEFAULT_WRITE_DELAY: Duration = Duration::from_millis(1000);
const DEFAULT_RECLAIM_DELAY: Duration = Duration::from_millis(100);
const DEFAULT_BLOCK_SIZE: u32 = 4096;

#[derive(Debug, Snafu)]
pub enum BuildError {
    #[snafu(display("parameter '{}' was invalid: {}", param_name, reason))]
    InvalidParameter {
        param_name: &'static str,
        reason: String,
    },
}

/// Journal configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JournalConfig {
    /// How long an open entry may sit idle before the delayed-write timer
    /// forces it out.
    pub(crate) write_delay: Duration,

    /// Interval of the background reclaim tick.
    pub(crate) reclaim_delay: Duration,

    /// Initial size, in bytes, of each of the two entry buffers.
    pub(crate) entry_size_min: usize,

    /// Upper bound, in bytes, that an entry buffer may be grown to.
    pub(crate) entry_size_max: usize,

    /// Filesystem block size, in bytes.  Entries are padded out to a whole
    /// number of blocks on disk.
    pub(crate) block_size: u32,
}

impl Default for JournalConfig {
    fn default() -> Self {
        JournalConfigBuilder::default()
            .build()
            .expect("default configuration must be valid")
    }
}

/// Builder for [`JournalConfig`].
#[derive(Clone, Debug, Default)]
pub struct JournalConfigBuilder {
    write_delay: Option<Duration>,
    reclaim_delay: Option<Duration>,
    entry_size_min: Option<usize>,
    entry_size_max: Option<usize>,
    block_size: Option<u32>,
}

impl JournalConfigBuilder {
    /// Sets how long an open entry may sit idle before being forced out.
    ///
    /// Defaults to 1000ms.
    pub fn write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = Some(delay);
        self
    }

    /// Sets the interval of the background reclaim tick.
    ///
    /// Defaults to 100ms.
    pub fn reclaim_delay(mut self, delay: Duration) -> Self {
        self.reclaim_delay = Some(delay);
        self
    }

    /// Sets the initial size, in bytes, of each entry buffer.
    ///
    /// Must be a power of two.  Defaults to 64KiB.
    pub fn entry_size_min(mut self, size: usize) -> Self {
        self.entry_size_min = Some(size);
        self
    }

    /// Sets the size, in bytes, that an entry buffer may be grown to.
    ///
    /// Must be a power of two.  Defaults to 4MiB.
    pub fn entry_size_max(mut self, size: usize) -> Self {
        self.entry_size_max = Some(size);
        self
    }

    /// Sets the filesystem block size, in bytes.
    ///
    /// Must be a power of two and a multiple of the sector size.  Defaults
    /// to 4096.
    pub fn block_size(mut self, size: u32) -> Self {
        self.block_size = Some(size);
        self
    }

    /// Consumes this builder and constructs a `JournalConfig`.
    pub fn build(self) -> Result<JournalConfig, BuildError> {
        let write_delay = self.write_delay.unwrap_or(DEFAULT_WRITE_DELAY);
        let reclaim_delay = self.reclaim_delay.unwrap_or(DEFAULT_RECLAIM_DELAY);
        let entry_size_min = self.entry_size_min.unwrap_or(JOURNAL_ENTRY_SIZE_MIN);
        let entry_size_max = self.entry_size_max.unwrap_or(JOURNAL_ENTRY_SIZE_MAX);
        let block_size = self.block_size.unwrap_or(DEFAULT_BLOCK_SIZE);

        if !entry_size_min.is_power_of_two() {
            return Err(BuildError::InvalidParameter {
                param_name: "entry_size_min",
                reason: "must be a power of two".to_string(),
            });
        }

        if !entry_size_max.is_power_of_two() {
            return Err(BuildError::InvalidParameter {
                param_name: "entry_size_max",
                reason: "must be a power of two".to_string(),
            });
        }

        if entry_size_min > entry_size_max {
            return Err(BuildError::InvalidParameter {
                param_name: "entry_size_min",
                reason: format!("must not exceed entry_size_max ({entry_size_max})"),
            });
        }

        if !block_size.is_power_of_two() || (block_size as usize) % SECTOR_SIZE != 0 {
            return Err(BuildError::InvalidParameter {
                param_name: "block_size",
                reason: format!("must be a power-of-two multiple of {SECTOR_SIZE}"),
            });
        }

        if entry_size_min < block_size as usize {
            return Err(BuildError::InvalidParameter {
                param_name: "entry_size_min",
                reason: format!("must be at least one block ({block_size} bytes)"),
            });
        }

        Ok(JournalConfig {
            write_delay,
            reclaim_delay,
            entry_size_min,
            entry_size_max,
            block_size,
        })
    }
}

/// Rounds a byte length up to whole blocks and returns it in sectors.
pub(crate) fn block_sectors(bytes: usize, block_size: u32) -> u32 {
    let block_size = block_size as usize;
    let blocks = bytes.div_ceil(block_size);
    ((blocks * block_size) / SECTOR_SIZE) as u32
}
