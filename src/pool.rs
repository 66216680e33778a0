// Copyright 2024 Saptak Santra
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Chunk pool shared between managers
//!
//! The free list is a lock-free queue: `acquire` never blocks and falls back to a fresh
//! allocation when nothing is pooled. `release` bumps the buffer's sequence number before
//! pooling it, so stale references to the old lease can be detected.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::queue::SegQueue;

use crate::chunk::ChunkBuffer;

/// Lock-free pool of 16 KiB chunk buffers
pub struct ChunkPool {
    free: SegQueue<ChunkBuffer>,
    pooled: AtomicUsize,
    leased: AtomicUsize,
    allocated: AtomicUsize,
    max_pooled: usize,
}

impl ChunkPool {
    /// Pool that retains every released buffer
    pub fn new() -> Self {
        Self::with_max_pooled(0)
    }

    /// Pool that frees released buffers once `max_pooled` are idle (0 = unbounded)
    pub fn with_max_pooled(max_pooled: usize) -> Self {
        Self {
            free: SegQueue::new(),
            pooled: AtomicUsize::new(0),
            leased: AtomicUsize::new(0),
            allocated: AtomicUsize::new(0),
            max_pooled,
        }
    }

    /// Lease a buffer. Contents are unspecified; callers zero what they use.
    pub fn acquire(&self) -> ChunkBuffer {
        let buffer = match self.free.pop() {
            Some(buffer) => {
                self.pooled.fetch_sub(1, Ordering::Relaxed);
                buffer
            }
            None => {
                let _allocated = self.allocated.fetch_add(1, Ordering::Relaxed) + 1;
                #[cfg(feature = "profiling")]
                tracing::debug!(allocated = _allocated, "chunk pool allocated fresh chunk");
                ChunkBuffer::allocate()
            }
        };
        self.leased.fetch_add(1, Ordering::Relaxed);
        buffer
    }

    /// Return a leased buffer
    pub fn release(&self, mut buffer: ChunkBuffer) {
        buffer.bump_sequence();
        self.leased.fetch_sub(1, Ordering::Relaxed);

        if self.max_pooled != 0 && self.pooled.load(Ordering::Relaxed) >= self.max_pooled {
            self.allocated.fetch_sub(1, Ordering::Relaxed);
            return;
        }
        self.pooled.fetch_add(1, Ordering::Relaxed);
        self.free.push(buffer);
    }

    /// Buffers currently leased out
    pub fn leased(&self) -> usize {
        self.leased.load(Ordering::Relaxed)
    }

    /// Buffers idle in the free list
    pub fn pooled(&self) -> usize {
        self.pooled.load(Ordering::Relaxed)
    }

    /// Buffers alive in total (leased + pooled)
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Free every idle buffer
    pub fn trim(&self) -> usize {
        let mut freed = 0;
        while self.free.pop().is_some() {
            self.pooled.fetch_sub(1, Ordering::Relaxed);
            self.allocated.fetch_sub(1, Ordering::Relaxed);
            freed += 1;
        }
        freed
    }
}

impl Default for ChunkPool {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ChunkPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkPool")
            .field("leased", &self.leased())
            .field("pooled", &self.pooled())
            .field("allocated", &self.allocated())
            .field("max_pooled", &self.max_pooled)
            .finish()
    }
}
