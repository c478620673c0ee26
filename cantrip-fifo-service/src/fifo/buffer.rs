// Copyright 2022 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Double-buffered runlist memory.
//!
//! Each runlist owns two DMA buffers. At most one of them is live (last
//! submitted and acknowledged by the hardware); new runlists are always
//! built in the other one so the hardware never reads a half-written list.

use cantrip_fifo_interface::*;
use log::error;

/// The runlist under construction does not fit in its buffer.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RunlistFull;

/// Hands out successive entry-sized slots of a buffer.
pub struct RunlistCursor<'a> {
    mem: &'a mut [u8],
    entry_size: usize,
    count: usize,
}
impl<'a> RunlistCursor<'a> {
    pub fn new(mem: &'a mut [u8], entry_size: usize) -> Self {
        assert!(entry_size > 0);
        RunlistCursor {
            mem,
            entry_size,
            count: 0,
        }
    }

    pub fn capacity(&self) -> usize { self.mem.len() / self.entry_size }
    pub fn count(&self) -> usize { self.count }
    pub fn remaining(&self) -> usize { self.capacity() - self.count }

    /// Claims the next slot.
    pub fn next_slot(&mut self) -> Result<&mut [u8], RunlistFull> {
        if self.remaining() == 0 {
            return Err(RunlistFull);
        }
        let start = self.count * self.entry_size;
        self.count = self.count.checked_add(1).ok_or(RunlistFull)?;
        Ok(&mut self.mem[start..start + self.entry_size])
    }
}

pub struct RunlistBuffers {
    bufs: [Option<DmaBuffer>; MAX_RUNLIST_BUFFERS],
    cur: Option<usize>,
    count: usize,
    entry_size: usize,
}
impl RunlistBuffers {
    pub const fn empty() -> Self {
        RunlistBuffers {
            bufs: [None, None],
            cur: None,
            count: 0,
            entry_size: 0,
        }
    }

    /// Allocates both buffers, each large enough for |max_entries|.
    /// Nothing is left allocated on failure.
    pub fn alloc(
        dma: &dyn DmaAllocator,
        entry_size: usize,
        max_entries: usize,
    ) -> Result<Self, FifoError> {
        let size = entry_size
            .checked_mul(max_entries)
            .ok_or(FifoError::InvalidArgument)?;
        let mut buffers = RunlistBuffers::empty();
        buffers.entry_size = entry_size;
        for index in 0..MAX_RUNLIST_BUFFERS {
            match dma.alloc(size) {
                Ok(buf) => buffers.bufs[index] = Some(buf),
                Err(e) => {
                    error!("runlist buffer alloc ({} bytes) failed: {:?}", size, e);
                    buffers.free(dma);
                    return Err(e);
                }
            }
        }
        Ok(buffers)
    }

    /// Returns both buffers to |dma|. Safe to call more than once.
    pub fn free(&mut self, dma: &dyn DmaAllocator) {
        for buf in self.bufs.iter_mut() {
            if let Some(buf) = buf.take() {
                dma.free(buf);
            }
        }
        self.cur = None;
        self.count = 0;
    }

    pub fn current(&self) -> Option<usize> { self.cur }
    pub fn count(&self) -> usize { self.count }

    /// The buffer to build into next.
    pub fn inactive_index(&self) -> usize {
        match self.cur {
            Some(0) => 1,
            _ => 0,
        }
    }

    /// DMA address of buffer |index|; 0 when it is not allocated.
    pub fn iova(&self, index: usize) -> u64 { self.bufs[index].as_ref().map_or(0, |buf| buf.iova) }

    pub fn cursor(&mut self, index: usize) -> Option<RunlistCursor<'_>> {
        let entry_size = self.entry_size;
        self.bufs[index]
            .as_mut()
            .map(|buf| RunlistCursor::new(&mut buf.mem, entry_size))
    }

    /// Makes buffer |index| holding |count| entries the live one.
    pub fn commit(&mut self, index: usize, count: usize) {
        assert!(index < MAX_RUNLIST_BUFFERS);
        self.cur = Some(index);
        self.count = count;
    }

    /// The valid entries of the live buffer.
    pub fn current_entries(&self) -> &[u8] {
        self.cur
            .and_then(|index| self.bufs[index].as_ref())
            .map_or(&[][..], |buf| &buf.mem[..self.count * self.entry_size])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fake_fifo_hw::FakeFifoHw;

    #[test]
    fn test_cursor_capacity() {
        let mut mem = [0u8; 24];
        let mut cursor = RunlistCursor::new(&mut mem, 8);
        assert_eq!(cursor.capacity(), 3);
        for _ in 0..3 {
            assert_eq!(cursor.next_slot().map(|slot| slot.len()), Ok(8));
        }
        assert_eq!(cursor.count(), 3);
        assert_eq!(cursor.next_slot().err(), Some(RunlistFull));
        assert_eq!(cursor.count(), 3);
    }

    #[test]
    fn test_inactive_alternates() {
        let hw = FakeFifoHw::new();
        let mut buffers = RunlistBuffers::alloc(&hw, 8, 4).unwrap();
        assert_eq!(buffers.current(), None);
        assert_eq!(buffers.inactive_index(), 0);
        buffers.commit(0, 2);
        assert_eq!(buffers.inactive_index(), 1);
        assert_eq!(buffers.current_entries().len(), 16);
        buffers.commit(1, 0);
        assert_eq!(buffers.inactive_index(), 0);
        assert!(buffers.current_entries().is_empty());
        assert_ne!(buffers.iova(0), buffers.iova(1));
        buffers.free(&hw);
    }

    #[test]
    fn test_alloc_failure_unwinds() {
        let hw = FakeFifoHw::new();
        hw.fail_alloc_after(1);
        assert_eq!(
            RunlistBuffers::alloc(&hw, 8, 4).err(),
            Some(FifoError::NoMemory)
        );
        assert_eq!(hw.live_allocs(), 0);
    }

    #[test]
    fn test_free_twice() {
        let hw = FakeFifoHw::new();
        let mut buffers = RunlistBuffers::alloc(&hw, 8, 4).unwrap();
        assert_eq!(hw.live_allocs(), 2);
        buffers.free(&hw);
        buffers.free(&hw);
        assert_eq!(hw.live_allocs(), 0);
        assert_eq!(buffers.iova(0), 0);
        assert!(buffers.cursor(0).is_none());
    }
}
