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

//! Fake FIFO hardware for exercising the scheduler off-target.
//!
//! FakeFifoHw implements every collaborator the scheduler needs
//! (HardwareFifo, DmaAllocator, EngineInfo and RecoveryHandler) on top of
//! a shared, lockable state block. Clones share that state so a test can
//! hand one clone to the scheduler and inspect or steer it through another.

#![cfg_attr(not(test), no_std)]
#![allow(clippy::new_without_default)]

extern crate alloc;

mod entry;
pub use entry::*;

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use cantrip_fifo_interface::*;
use log::trace;
use spin::Mutex;

pub const FAKE_MAX_RUNLISTS: usize = 4;
pub const FAKE_MAX_ENTRIES: usize = 64;
pub const FAKE_NUM_SM: usize = 2;
// First iova handed out; zero is never a valid runlist address.
const FAKE_IOVA_BASE: u64 = 0x1_0000_0000;

/// A runlist submit as seen by the front end.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Submit {
    pub runlist_id: RunlistId,
    pub iova: u64,
    pub count: usize,
    pub buffer_index: usize,
}

#[derive(Debug, Default, Copy, Clone)]
struct FakeChannel {
    enabled: bool,
    hw_state: ChannelHwState,
    gp_get: u32,
}

struct FakeState {
    max_runlists: usize,
    max_entries: usize,
    num_sm: usize,
    ptimer_src_freq: u32,

    ack: AckStatus,
    submits: Vec<Submit>,
    enabled_mask: RunlistMask,

    sched_mutex_fail: bool,
    sched_mutex_acquired: usize,
    sched_mutex_released: usize,

    channels: BTreeMap<ChannelId, FakeChannel>,
    ctx_reloads: Vec<ChannelId>,
    preempt_result: Result<(), FifoError>,
    preempts: Vec<TsgId>,
    unbind_result: Result<(), FifoError>,
    unbinds: Vec<(TsgId, ChannelId)>,

    next_iova: u64,
    allocs_left: Option<usize>,
    live_allocs: usize,

    engines: BTreeMap<RunlistId, (EngineMask, EngineMask)>,

    runlist_timeouts: Vec<RunlistId>,
    tsg_timeouts: Vec<(TsgId, u32)>,
    aborted_channels: Vec<ChannelId>,
}

#[derive(Clone)]
pub struct FakeFifoHw {
    state: Arc<Mutex<FakeState>>,
}
impl FakeFifoHw {
    pub fn new() -> Self { Self::with_limits(FAKE_MAX_RUNLISTS, FAKE_MAX_ENTRIES) }

    pub fn with_limits(max_runlists: usize, max_entries: usize) -> Self {
        FakeFifoHw {
            state: Arc::new(Mutex::new(FakeState {
                max_runlists,
                max_entries,
                num_sm: FAKE_NUM_SM,
                ptimer_src_freq: PTIMER_REF_FREQ_HZ,
                ack: AckStatus::Acked,
                submits: Vec::new(),
                enabled_mask: !0,
                sched_mutex_fail: false,
                sched_mutex_acquired: 0,
                sched_mutex_released: 0,
                channels: BTreeMap::new(),
                ctx_reloads: Vec::new(),
                preempt_result: Ok(()),
                preempts: Vec::new(),
                unbind_result: Ok(()),
                unbinds: Vec::new(),
                next_iova: FAKE_IOVA_BASE,
                allocs_left: None,
                live_allocs: 0,
                engines: BTreeMap::new(),
                runlist_timeouts: Vec::new(),
                tsg_timeouts: Vec::new(),
                aborted_channels: Vec::new(),
            })),
        }
    }

    // Knobs.

    pub fn set_ack(&self, ack: AckStatus) { self.state.lock().ack = ack; }
    pub fn set_num_sm(&self, num_sm: usize) { self.state.lock().num_sm = num_sm; }
    pub fn set_ptimer_src_freq(&self, freq: u32) { self.state.lock().ptimer_src_freq = freq; }
    pub fn set_sched_mutex_fail(&self, fail: bool) { self.state.lock().sched_mutex_fail = fail; }
    pub fn set_preempt_result(&self, result: Result<(), FifoError>) {
        self.state.lock().preempt_result = result;
    }
    pub fn set_unbind_result(&self, result: Result<(), FifoError>) {
        self.state.lock().unbind_result = result;
    }
    pub fn set_channel_hw_state(&self, chid: ChannelId, hw_state: ChannelHwState) {
        self.state.lock().channels.entry(chid).or_default().hw_state = hw_state;
    }
    pub fn set_gp_get(&self, chid: ChannelId, gp_get: u32) {
        self.state.lock().channels.entry(chid).or_default().gp_get = gp_get;
    }
    /// Lets |count| more DMA allocations succeed; the rest fail.
    pub fn fail_alloc_after(&self, count: usize) { self.state.lock().allocs_left = Some(count); }
    pub fn set_runlist_engines(&self, runlist_id: RunlistId, engines: EngineMask, pbdmas: EngineMask) {
        self.state.lock().engines.insert(runlist_id, (engines, pbdmas));
    }

    // Observations.

    pub fn submits(&self) -> Vec<Submit> { self.state.lock().submits.clone() }
    pub fn last_submit(&self) -> Option<Submit> { self.state.lock().submits.last().copied() }
    pub fn enabled_mask(&self) -> RunlistMask { self.state.lock().enabled_mask }
    pub fn channel_enabled(&self, chid: ChannelId) -> bool {
        self.state.lock().channels.get(&chid).map_or(false, |ch| ch.enabled)
    }
    pub fn ctx_reloads(&self) -> Vec<ChannelId> { self.state.lock().ctx_reloads.clone() }
    pub fn preempts(&self) -> Vec<TsgId> { self.state.lock().preempts.clone() }
    pub fn unbinds(&self) -> Vec<(TsgId, ChannelId)> { self.state.lock().unbinds.clone() }
    pub fn live_allocs(&self) -> usize { self.state.lock().live_allocs }
    /// Returns (acquired, released) counts for the scheduling mutex.
    pub fn sched_mutex_counts(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.sched_mutex_acquired, state.sched_mutex_released)
    }
    pub fn runlist_timeouts(&self) -> Vec<RunlistId> { self.state.lock().runlist_timeouts.clone() }
    pub fn tsg_timeouts(&self) -> Vec<(TsgId, u32)> { self.state.lock().tsg_timeouts.clone() }
    pub fn aborted_channels(&self) -> Vec<ChannelId> { self.state.lock().aborted_channels.clone() }
}

impl HardwareFifo for FakeFifoHw {
    fn entry_size(&self) -> usize { FAKE_ENTRY_SIZE }
    fn max_runlists(&self) -> usize { self.state.lock().max_runlists }
    fn max_entries_per_runlist(&self) -> usize { self.state.lock().max_entries }
    fn ptimer_src_freq(&self) -> u32 { self.state.lock().ptimer_src_freq }
    fn num_sm(&self) -> usize { self.state.lock().num_sm }

    fn write_tsg_header(&self, desc: &TsgHeaderDesc, entry: &mut [u8]) {
        entry.copy_from_slice(&encode_tsg_entry(desc));
    }
    fn write_channel_entry(&self, desc: &ChannelEntryDesc, entry: &mut [u8]) {
        entry.copy_from_slice(&encode_channel_entry(desc));
    }

    fn submit(&self, runlist_id: RunlistId, iova: u64, count: usize, buffer_index: usize) {
        trace!("submit runlist {} iova {:#x} count {} buf {}", runlist_id, iova, count, buffer_index);
        self.state.lock().submits.push(Submit {
            runlist_id,
            iova,
            count,
            buffer_index,
        });
    }
    fn wait_for_ack(&self, _runlist_id: RunlistId) -> AckStatus { self.state.lock().ack }
    fn set_runlist_enabled_mask(&self, mask: RunlistMask, enabled: bool) {
        let mut state = self.state.lock();
        if enabled {
            state.enabled_mask |= mask;
        } else {
            state.enabled_mask &= !mask;
        }
    }

    fn sched_mutex_acquire(&self) -> Result<MutexToken, FifoError> {
        let mut state = self.state.lock();
        if state.sched_mutex_fail {
            return Err(FifoError::Busy);
        }
        state.sched_mutex_acquired += 1;
        Ok(state.sched_mutex_acquired as MutexToken)
    }
    fn sched_mutex_release(&self, _token: MutexToken) -> Result<(), FifoError> {
        self.state.lock().sched_mutex_released += 1;
        Ok(())
    }

    fn enable_channel(&self, chid: ChannelId) {
        self.state.lock().channels.entry(chid).or_default().enabled = true;
    }
    fn disable_channel(&self, chid: ChannelId) {
        self.state.lock().channels.entry(chid).or_default().enabled = false;
    }
    fn channel_hw_state(&self, chid: ChannelId) -> ChannelHwState {
        self.state.lock().channels.get(&chid).map(|ch| ch.hw_state).unwrap_or_default()
    }
    fn channel_gp_get(&self, chid: ChannelId) -> u32 {
        self.state.lock().channels.get(&chid).map_or(0, |ch| ch.gp_get)
    }
    fn force_ctx_reload(&self, chid: ChannelId) { self.state.lock().ctx_reloads.push(chid); }

    fn preempt_tsg(&self, _runlist_id: RunlistId, tsgid: TsgId) -> Result<(), FifoError> {
        let mut state = self.state.lock();
        state.preempts.push(tsgid);
        state.preempt_result
    }
    fn tsg_unbind_channel(&self, tsgid: TsgId, chid: ChannelId) -> Result<(), FifoError> {
        let mut state = self.state.lock();
        state.unbinds.push((tsgid, chid));
        state.unbind_result
    }
}

impl DmaAllocator for FakeFifoHw {
    fn alloc(&self, size: usize) -> Result<DmaBuffer, FifoError> {
        let mut state = self.state.lock();
        match state.allocs_left {
            Some(0) => return Err(FifoError::NoMemory),
            Some(n) => state.allocs_left = Some(n - 1),
            None => {}
        }
        let iova = state.next_iova;
        // Keep buffers page aligned and apart.
        state.next_iova += ((size as u64) + 0xfff) & !0xfff;
        state.live_allocs += 1;
        Ok(DmaBuffer {
            iova,
            mem: vec![0u8; size].into_boxed_slice(),
        })
    }
    fn free(&self, _buf: DmaBuffer) {
        let mut state = self.state.lock();
        assert!(state.live_allocs > 0, "free without alloc");
        state.live_allocs -= 1;
    }
}

impl EngineInfo for FakeFifoHw {
    fn runlist_engine_mask(&self, runlist_id: RunlistId) -> EngineMask {
        self.state.lock().engines.get(&runlist_id).map_or(0, |e| e.0)
    }
    fn runlist_pbdma_mask(&self, runlist_id: RunlistId) -> EngineMask {
        self.state.lock().engines.get(&runlist_id).map_or(0, |e| e.1)
    }
}

impl RecoveryHandler for FakeFifoHw {
    fn runlist_update_timeout(&self, runlist_id: RunlistId) {
        self.state.lock().runlist_timeouts.push(runlist_id);
    }
    fn tsg_ctxsw_timeout(&self, tsgid: TsgId, accumulated_ms: u32) {
        self.state.lock().tsg_timeouts.push((tsgid, accumulated_ms));
    }
    fn channel_abort_clean_up(&self, chid: ChannelId) {
        self.state.lock().aborted_channels.push(chid);
    }
}
