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

//! Runlist entry layout for the fake front end.
//!
//! Both entry kinds are 8 bytes; bit 12 distinguishes a TSG header from a
//! channel entry. The TSG timeslice is stored as timeout << scale with an
//! 8-bit timeout and a 4-bit scale.

use cantrip_fifo_interface::{ChannelEntryDesc, ChannelId, RunlistId, TsgHeaderDesc, TsgId};
use log::error;
use modular_bitfield::prelude::*;
use static_assertions::const_assert_eq;

use alloc::vec::Vec;

pub const FAKE_ENTRY_SIZE: usize = 8;

const TIMESLICE_TIMEOUT_MAX: u32 = 0xff;
const TIMESLICE_SCALE_MAX: u8 = 0xf;

#[bitfield]
pub struct TsgEntry {
    pub id: B12,
    pub is_tsg: bool,
    pub timeslice_scale: B4,
    pub timeslice_timeout: B8,
    pub tsg_length: B8,
    #[skip]
    _unused: B31,
}
const_assert_eq!(core::mem::size_of::<TsgEntry>(), FAKE_ENTRY_SIZE);

#[bitfield]
pub struct ChannelEntry {
    pub id: B12,
    pub is_tsg: bool,
    pub runlist_id: B5,
    pub subctx_id: B6,
    #[skip]
    _unused: B8,
    pub inst_ptr_lo: B32,
}
const_assert_eq!(core::mem::size_of::<ChannelEntry>(), FAKE_ENTRY_SIZE);

/// Splits |timeslice| into (timeout, scale), saturating when it cannot be
/// represented.
pub fn encode_timeslice(timeslice: u32) -> (u8, u8) {
    let mut timeout = timeslice;
    let mut scale: u8 = 0;
    while timeout > TIMESLICE_TIMEOUT_MAX {
        timeout >>= 1;
        scale += 1;
    }
    if scale > TIMESLICE_SCALE_MAX {
        error!("timeslice {} out of range, saturating", timeslice);
        return (TIMESLICE_TIMEOUT_MAX as u8, TIMESLICE_SCALE_MAX);
    }
    (timeout as u8, scale)
}

pub fn decode_timeslice(timeout: u8, scale: u8) -> u32 { (timeout as u32) << scale }

pub fn encode_tsg_entry(desc: &TsgHeaderDesc) -> [u8; FAKE_ENTRY_SIZE] {
    let (timeout, scale) = encode_timeslice(desc.timeslice);
    TsgEntry::new()
        .with_id((desc.tsgid & 0xfff) as u16)
        .with_is_tsg(true)
        .with_timeslice_scale(scale)
        .with_timeslice_timeout(timeout)
        .with_tsg_length((desc.num_channels & 0xff) as u8)
        .into_bytes()
}

pub fn encode_channel_entry(desc: &ChannelEntryDesc) -> [u8; FAKE_ENTRY_SIZE] {
    ChannelEntry::new()
        .with_id((desc.chid & 0xfff) as u16)
        .with_is_tsg(false)
        .with_runlist_id((desc.runlist_id & 0x1f) as u8)
        .with_subctx_id((desc.subctx_id & 0x3f) as u8)
        .with_inst_ptr_lo(desc.inst_ptr as u32)
        .into_bytes()
}

/// A runlist entry read back from a buffer.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FakeEntry {
    Tsg {
        tsgid: TsgId,
        num_channels: u32,
        timeslice: u32,
    },
    Channel {
        chid: ChannelId,
        runlist_id: RunlistId,
        subctx_id: u32,
    },
}

/// Decodes the first |count| entries of |mem|.
pub fn decode_entries(mem: &[u8], count: usize) -> Vec<FakeEntry> {
    mem.chunks_exact(FAKE_ENTRY_SIZE)
        .take(count)
        .map(|chunk| {
            let mut bytes = [0u8; FAKE_ENTRY_SIZE];
            bytes.copy_from_slice(chunk);
            // Bit 12 sits at the same place in both layouts.
            if TsgEntry::from_bytes(bytes).is_tsg() {
                let tsg = TsgEntry::from_bytes(bytes);
                FakeEntry::Tsg {
                    tsgid: tsg.id() as TsgId,
                    num_channels: tsg.tsg_length() as u32,
                    timeslice: decode_timeslice(tsg.timeslice_timeout(), tsg.timeslice_scale()),
                }
            } else {
                let ch = ChannelEntry::from_bytes(bytes);
                FakeEntry::Channel {
                    chid: ch.id() as ChannelId,
                    runlist_id: ch.runlist_id() as RunlistId,
                    subctx_id: ch.subctx_id() as u32,
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeslice_encoding() {
        assert_eq!(encode_timeslice(200), (200, 0));
        assert_eq!(encode_timeslice(1000), (250, 2));
        assert_eq!(decode_timeslice(250, 2), 1000);
        // Low bits are lost once the value needs scaling.
        assert_eq!(encode_timeslice(1001), (250, 2));
        assert_eq!(encode_timeslice(u32::MAX), (0xff, 0xf));
    }

    #[test]
    fn test_decode_mixed_entries() {
        let mut mem = [0u8; 3 * FAKE_ENTRY_SIZE];
        mem[..8].copy_from_slice(&encode_tsg_entry(&TsgHeaderDesc {
            tsgid: 7,
            num_channels: 2,
            timeslice: 1000,
        }));
        mem[8..16].copy_from_slice(&encode_channel_entry(&ChannelEntryDesc {
            chid: 300,
            runlist_id: 1,
            subctx_id: 3,
            inst_ptr: 0xdead_b000,
        }));
        mem[16..].copy_from_slice(&encode_channel_entry(&ChannelEntryDesc {
            chid: 301,
            runlist_id: 1,
            subctx_id: 0,
            inst_ptr: 0,
        }));
        assert_eq!(
            decode_entries(&mem, 3),
            [
                FakeEntry::Tsg {
                    tsgid: 7,
                    num_channels: 2,
                    timeslice: 1000
                },
                FakeEntry::Channel {
                    chid: 300,
                    runlist_id: 1,
                    subctx_id: 3
                },
                FakeEntry::Channel {
                    chid: 301,
                    runlist_id: 1,
                    subctx_id: 0
                },
            ]
        );
        assert_eq!(decode_entries(&mem, 1).len(), 1);
    }
}
