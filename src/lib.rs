// strata-db: the core runtime of a multi-threaded, disk-backed relational
// storage engine. Heap page I/O, a buffer pool with partitioned free lists
// and second-chance eviction, a packed two-bit transaction status log, a
// partitioned lock manager with deadlock detection, and the session layer
// with its process-wide master lock.

pub mod buffer;
pub mod catalog;
pub mod common;
pub mod error;
pub mod heap;
pub mod lock;
pub mod session;
pub mod storage;
pub mod system;
pub mod txlog;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub use error::{Result, StoreError};
pub use system::System;

/// Engine configuration. Out-of-range values are rejected at `System`
/// construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    /// Page size in bytes.
    pub page_size: usize,
    /// Initial buffer pool size, in pages.
    pub buffers: usize,
    /// Hard cap for buffer pool growth.
    pub max_buffers: usize,
    /// Fraction of the pool reserved for index pages (0.0 to 0.5).
    pub index_buffer_reserve: f32,
    /// Pool growth factor applied when the flush threshold is exceeded
    /// (0.05 to 0.50).
    pub buffer_scale: f32,
    /// Second-chance eviction: recently used buffers survive one pass.
    pub lingering_buffers: bool,
    /// How long an evictor waits on an empty free list before driving a
    /// flush, in milliseconds.
    pub buffer_wait_ms: u64,
    /// Capacity of the environment map.
    pub max_backends: usize,
    /// Multiuser mode; single-user mode flushes status-log writes
    /// synchronously and forces careful commits.
    pub multiuser: bool,
    /// Number of lock table partitions.
    pub lock_partitions: usize,
    /// How long a lock waiter sleeps before re-running deadlock detection,
    /// in milliseconds.
    pub deadlock_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            page_size: 8192,
            buffers: 64,
            max_buffers: 1024,
            index_buffer_reserve: 0.0,
            buffer_scale: 0.10,
            lingering_buffers: false,
            buffer_wait_ms: 400,
            max_backends: 64,
            multiuser: true,
            lock_partitions: num_cpus::get(),
            deadlock_interval_ms: 1000,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if !(512..=65536).contains(&self.page_size) || !self.page_size.is_power_of_two() {
            return Err(StoreError::Config(format!(
                "page_size {} must be a power of two between 512 and 65536",
                self.page_size
            )));
        }
        if self.buffers < 2 {
            return Err(StoreError::Config("buffers must be at least 2".into()));
        }
        if self.max_buffers < self.buffers {
            return Err(StoreError::Config(
                "max_buffers must be at least the initial pool size".into(),
            ));
        }
        if !(0.0..=0.5).contains(&self.index_buffer_reserve) {
            return Err(StoreError::Config(format!(
                "index_buffer_reserve {} out of range 0.0 to 0.5",
                self.index_buffer_reserve
            )));
        }
        if !(0.05..=0.50).contains(&self.buffer_scale) {
            return Err(StoreError::Config(format!(
                "buffer_scale {} out of range 0.05 to 0.50",
                self.buffer_scale
            )));
        }
        if self.max_backends == 0 {
            return Err(StoreError::Config("max_backends must be positive".into()));
        }
        if self.lock_partitions == 0 {
            return Err(StoreError::Config(
                "lock_partitions must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn test_out_of_range_tunables_rejected() {
        let mut config = EngineConfig {
            index_buffer_reserve: 0.9,
            ..EngineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(StoreError::Config(_))
        ));

        config.index_buffer_reserve = 0.25;
        config.buffer_scale = 0.01;
        assert!(config.validate().is_err());

        config.buffer_scale = 0.10;
        config.page_size = 1000;
        assert!(config.validate().is_err());
    }
}
