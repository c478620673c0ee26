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

//! First-fit allocator for TSG and channel ids.

use bitvec::prelude::*;
#[cfg(feature = "TRACE_OPS")]
use log::trace;

pub struct IdPool {
    bits: BitBox<u8, Lsb0>,
    used: usize,
    name: &'static str,
}
impl IdPool {
    pub fn new(name: &'static str, size: usize) -> Self {
        IdPool {
            bits: bitvec![u8, Lsb0; 0; size].into_boxed_bitslice(),
            used: 0,
            name,
        }
    }

    pub fn used(&self) -> usize { self.used }
    pub fn free_ids(&self) -> usize { self.bits.len() - self.used }

    pub fn alloc(&mut self) -> Option<u32> {
        let id = self.bits.first_zero()?;
        self.bits.set(id, true);
        self.used += 1;
        #[cfg(feature = "TRACE_OPS")]
        trace!("{}:alloc {}", self.name, id);
        Some(id as u32)
    }

    pub fn free(&mut self, id: u32) {
        #[cfg(feature = "TRACE_OPS")]
        trace!("{}:free {}", self.name, id);
        let index = id as usize;
        assert!(
            index < self.bits.len() && self.bits[index],
            "{}: free of unallocated id {}",
            self.name,
            id
        );
        self.bits.set(index, false);
        self.used -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_fit() {
        let mut pool = IdPool::new("test", 4);
        assert_eq!(pool.alloc(), Some(0));
        assert_eq!(pool.alloc(), Some(1));
        assert_eq!(pool.alloc(), Some(2));
        pool.free(1);
        assert_eq!(pool.used(), 2);
        // first-fit so the hole is reused
        assert_eq!(pool.alloc(), Some(1));
        assert_eq!(pool.alloc(), Some(3));
        assert_eq!(pool.alloc(), None);
        assert_eq!(pool.free_ids(), 0);
    }

    #[test]
    #[should_panic]
    fn test_double_free() {
        let mut pool = IdPool::new("test", 4);
        let id = pool.alloc().unwrap();
        pool.free(id);
        pool.free(id);
    }
}
