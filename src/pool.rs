//! Fixed-block memory pool with live metrics and leak detection.
//!
//! A contiguous arena divided into equal blocks, handed out whole even
//! for smaller requests. One coarse lock guards the free list, the
//! per-block metadata, and the counters, so metric snapshots are always
//! consistent with the allocation state.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::config::MemoryPoolConfig;
use crate::errors::{Result, TransportError};
use crate::metrics;

/// Opaque handle to an allocated block.
///
/// The pool owns the block; the caller holds only this handle until it
/// deallocates. Handles from one pool are meaningless to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockHandle {
    index: usize,
}

/// Metadata recorded per live allocation.
#[derive(Debug, Clone)]
struct BlockMeta {
    requested_size: usize,
    allocated_at: Instant,
    thread_id: String,
    context: String,
}

/// Point-in-time pool metrics.
///
/// Invariant: `allocated_size + free_size == total_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolMetrics {
    pub total_size: usize,
    pub allocated_size: usize,
    pub free_size: usize,
    pub peak_usage: usize,
    pub allocation_count: u64,
    pub deallocation_count: u64,
    /// Integer percent of free blocks: 100 when empty, 0 when
    /// exhausted. This reads as a free-ratio, not external
    /// fragmentation; the name is kept for continuity.
    pub fragmentation_ratio: u32,
}

/// One suspected leak.
#[derive(Debug, Clone)]
pub struct LeakRecord {
    pub address: usize,
    pub size: usize,
    pub age: Duration,
    pub thread_id: String,
    pub allocation_context: String,
}

struct PoolInner {
    buffer: Vec<u8>,
    free_list: Vec<usize>,
    live: HashMap<usize, BlockMeta>,
    allocated_size: usize,
    peak_usage: usize,
    allocation_count: u64,
    deallocation_count: u64,
}

/// Fixed-size block allocator.
pub struct MemoryPool {
    config: MemoryPoolConfig,
    total_blocks: usize,
    inner: Mutex<PoolInner>,
}

impl MemoryPool {
    pub fn new(config: MemoryPoolConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| TransportError::Configuration(e.to_string()))?;
        let total_blocks = config.total_size / config.block_size;
        let inner = PoolInner {
            buffer: vec![0u8; config.total_size],
            // LIFO free list: block 0 is handed out first.
            free_list: (0..total_blocks).rev().collect(),
            live: HashMap::new(),
            allocated_size: 0,
            peak_usage: 0,
            allocation_count: 0,
            deallocation_count: 0,
        };
        debug!(
            total_size = config.total_size,
            block_size = config.block_size,
            total_blocks,
            "Memory pool created"
        );
        Ok(Self {
            config,
            total_blocks,
            inner: Mutex::new(inner),
        })
    }

    /// Allocate one block for a request of `size` bytes.
    ///
    /// Returns `None` when `size` exceeds the block size or the pool is
    /// exhausted. Accounting is by block, not by requested size.
    pub fn allocate(&self, size: usize, context: &str) -> Option<BlockHandle> {
        if size > self.config.block_size {
            warn!(
                size,
                block_size = self.config.block_size,
                "Allocation larger than block size refused"
            );
            return None;
        }

        let mut inner = self.inner.lock().unwrap();
        let index = inner.free_list.pop()?;

        inner.live.insert(
            index,
            BlockMeta {
                requested_size: size,
                allocated_at: Instant::now(),
                thread_id: format!("{:?}", std::thread::current().id()),
                context: if context.is_empty() {
                    "anonymous".to_string()
                } else {
                    context.to_string()
                },
            },
        );
        inner.allocated_size += self.config.block_size;
        inner.allocation_count += 1;
        inner.peak_usage = inner.peak_usage.max(inner.allocated_size);

        metrics::MEMORY_POOL_ALLOCATED_BYTES.set(inner.allocated_size as i64);
        metrics::MEMORY_POOL_ALLOCATIONS_TOTAL.inc();

        Some(BlockHandle { index })
    }

    /// Return a block to the free list. Double-free is a caller error
    /// and is reported rather than corrupting the free list.
    pub fn deallocate(&self, handle: BlockHandle) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.live.remove(&handle.index).is_none() {
            return Err(TransportError::Protocol(format!(
                "deallocate of block {} which is not live",
                handle.index
            )));
        }
        inner.free_list.push(handle.index);
        inner.allocated_size -= self.config.block_size;
        inner.deallocation_count += 1;

        metrics::MEMORY_POOL_ALLOCATED_BYTES.set(inner.allocated_size as i64);
        metrics::MEMORY_POOL_DEALLOCATIONS_TOTAL.inc();
        Ok(())
    }

    /// Copy `data` into the block. Fails if `data` exceeds the block.
    pub fn copy_in(&self, handle: BlockHandle, data: &[u8]) -> Result<()> {
        if data.len() > self.config.block_size {
            return Err(TransportError::ResourceExhausted(format!(
                "{} bytes exceeds block size {}",
                data.len(),
                self.config.block_size
            )));
        }
        let mut inner = self.inner.lock().unwrap();
        if !inner.live.contains_key(&handle.index) {
            return Err(TransportError::Protocol("write to freed block".into()));
        }
        let offset = handle.index * self.config.block_size;
        inner.buffer[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Copy the first `len` bytes of the block out.
    pub fn copy_out(&self, handle: BlockHandle, len: usize) -> Result<Vec<u8>> {
        if len > self.config.block_size {
            return Err(TransportError::ResourceExhausted(format!(
                "{len} bytes exceeds block size {}",
                self.config.block_size
            )));
        }
        let inner = self.inner.lock().unwrap();
        if !inner.live.contains_key(&handle.index) {
            return Err(TransportError::Protocol("read from freed block".into()));
        }
        let offset = handle.index * self.config.block_size;
        Ok(inner.buffer[offset..offset + len].to_vec())
    }

    /// Return every block to the free list and zero all metadata.
    /// `total_size`, `peak_usage`, and the lifetime counters survive.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.live.clear();
        inner.free_list = (0..self.total_blocks).rev().collect();
        inner.allocated_size = 0;
        metrics::MEMORY_POOL_ALLOCATED_BYTES.set(0);
        debug!("Memory pool reset");
    }

    /// Consistent snapshot of the pool counters.
    pub fn metrics(&self) -> PoolMetrics {
        let inner = self.inner.lock().unwrap();
        let free_blocks = inner.free_list.len();
        PoolMetrics {
            total_size: self.config.total_size,
            allocated_size: inner.allocated_size,
            free_size: self.config.total_size - inner.allocated_size,
            peak_usage: inner.peak_usage,
            allocation_count: inner.allocation_count,
            deallocation_count: inner.deallocation_count,
            fragmentation_ratio: ((free_blocks * 100) / self.total_blocks) as u32,
        }
    }

    /// Live allocations whose age has reached the configured threshold.
    ///
    /// Ages and thread IDs come from the allocation-time record, not
    /// from the detecting thread.
    pub fn detect_leaks(&self) -> Vec<LeakRecord> {
        if !self.config.leak_detection_enabled {
            return Vec::new();
        }
        let inner = self.inner.lock().unwrap();
        let base = inner.buffer.as_ptr() as usize;
        let now = Instant::now();
        let mut leaks: Vec<LeakRecord> = inner
            .live
            .iter()
            .filter_map(|(index, meta)| {
                let age = now.duration_since(meta.allocated_at);
                if age >= self.config.leak_threshold {
                    Some(LeakRecord {
                        address: base + index * self.config.block_size,
                        size: meta.requested_size,
                        age,
                        thread_id: meta.thread_id.clone(),
                        allocation_context: meta.context.clone(),
                    })
                } else {
                    None
                }
            })
            .collect();
        leaks.sort_by_key(|l| l.address);
        if !leaks.is_empty() {
            warn!(count = leaks.len(), "Leak detection found aged allocations");
        }
        leaks
    }

    /// Arena base address; block addresses are offsets from this.
    pub fn base_address(&self) -> usize {
        self.inner.lock().unwrap().buffer.as_ptr() as usize
    }

    /// Address of a live block, as reported in leak records.
    pub fn address_of(&self, handle: BlockHandle) -> usize {
        self.base_address() + handle.index * self.config.block_size
    }

    pub fn block_size(&self) -> usize {
        self.config.block_size
    }

    pub fn total_blocks(&self) -> usize {
        self.total_blocks
    }
}
