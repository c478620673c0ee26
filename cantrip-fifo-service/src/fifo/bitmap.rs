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

//! Active-set bookkeeping for a runlist: one bit per channel or TSG id.

use bitvec::prelude::*;

pub struct ActiveBitmap {
    bits: BitBox<u8, Lsb0>,
    name: &'static str,
}
impl ActiveBitmap {
    pub fn new(name: &'static str, size: usize) -> Self {
        ActiveBitmap {
            bits: bitvec![u8, Lsb0; 0; size].into_boxed_bitslice(),
            name,
        }
    }

    pub fn len(&self) -> usize { self.bits.len() }
    pub fn is_empty(&self) -> bool { self.bits.is_empty() }

    fn check(&self, id: u32) -> usize {
        let index = id as usize;
        assert!(
            index < self.bits.len(),
            "{}: id {} out of range {}",
            self.name,
            id,
            self.bits.len()
        );
        index
    }

    pub fn set(&mut self, id: u32) {
        let index = self.check(id);
        self.bits.set(index, true);
    }
    pub fn clear(&mut self, id: u32) {
        let index = self.check(id);
        self.bits.set(index, false);
    }
    pub fn is_set(&self, id: u32) -> bool { self.bits[self.check(id)] }

    /// Sets |id| and returns its previous value.
    pub fn test_and_set(&mut self, id: u32) -> bool {
        let index = self.check(id);
        self.bits.replace(index, true)
    }
    /// Clears |id| and returns its previous value.
    pub fn test_and_clear(&mut self, id: u32) -> bool {
        let index = self.check(id);
        self.bits.replace(index, false)
    }

    /// Set ids in ascending order.
    pub fn iter_ones(&self) -> impl Iterator<Item = u32> + '_ {
        self.bits.iter_ones().map(|index| index as u32)
    }
    pub fn count_ones(&self) -> usize { self.bits.count_ones() }
    pub fn clear_all(&mut self) { self.bits.fill(false); }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_clear() {
        let mut bitmap = ActiveBitmap::new("test", 16);
        assert_eq!(bitmap.len(), 16);
        assert_eq!(bitmap.count_ones(), 0);
        bitmap.set(3);
        assert!(bitmap.is_set(3));
        assert!(!bitmap.is_set(4));
        bitmap.clear(3);
        assert!(!bitmap.is_set(3));
    }

    #[test]
    fn test_test_and_modify() {
        let mut bitmap = ActiveBitmap::new("test", 16);
        assert!(!bitmap.test_and_set(5));
        assert!(bitmap.test_and_set(5));
        assert!(bitmap.test_and_clear(5));
        assert!(!bitmap.test_and_clear(5));
        assert_eq!(bitmap.count_ones(), 0);
    }

    #[test]
    fn test_iter_ones_ascending() {
        let mut bitmap = ActiveBitmap::new("test", 64);
        for id in [40, 2, 17, 63, 0] {
            bitmap.set(id);
        }
        assert_eq!(bitmap.iter_ones().collect::<Vec<_>>(), [0, 2, 17, 40, 63]);
        assert_eq!(bitmap.count_ones(), 5);
        bitmap.clear_all();
        assert_eq!(bitmap.iter_ones().count(), 0);
    }

    #[test]
    #[should_panic]
    fn test_out_of_range() {
        let mut bitmap = ActiveBitmap::new("test", 8);
        bitmap.set(8);
    }
}
