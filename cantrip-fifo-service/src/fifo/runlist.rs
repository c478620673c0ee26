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

//! Runlist controller: applies channel state changes to a runlist's
//! active sets, rebuilds the runlist into its inactive buffer and hands
//! it to the hardware.

use super::bitmap::ActiveBitmap;
use super::buffer::RunlistBuffers;
use super::builder::RunlistBuilder;
use super::lock::{RunlistLockAll, SchedMutexGuard};
use super::Fifo;
use alloc::vec::Vec;
use cantrip_fifo_interface::*;
use core::sync::atomic::Ordering;
use log::{debug, error, trace, warn};
use spin::Mutex;

pub struct RunlistInner {
    pub active_channels: ActiveBitmap,
    pub active_tsgs: ActiveBitmap,
    pub buffers: RunlistBuffers,
}

pub struct Runlist {
    pub id: RunlistId,
    pub inner: Mutex<RunlistInner>,
}
impl Runlist {
    pub fn new(id: RunlistId, num_channels: usize, num_tsgs: usize, buffers: RunlistBuffers) -> Self {
        Runlist {
            id,
            inner: Mutex::new(RunlistInner {
                active_channels: ActiveBitmap::new("active_channels", num_channels),
                active_tsgs: ActiveBitmap::new("active_tsgs", num_tsgs),
                buffers,
            }),
        }
    }

    /// A runlist without buffers; every update of it fails.
    pub fn empty(id: RunlistId, num_channels: usize, num_tsgs: usize) -> Self {
        Runlist::new(id, num_channels, num_tsgs, RunlistBuffers::empty())
    }
}

/// The live buffer of a runlist.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct CurrentRunlist {
    pub buffer_index: Option<usize>,
    pub count: usize,
}

impl Fifo {
    pub(crate) fn runlist(&self, runlist_id: RunlistId) -> Result<&Runlist, FifoError> {
        self.runlists
            .get(runlist_id as usize)
            .ok_or(FifoError::InvalidArgument)
    }

    // Moves |chid| in or out of the active sets. Returns false if it was
    // already there (or already gone).
    pub(crate) fn apply_channel_change(
        &self,
        inner: &mut RunlistInner,
        chid: ChannelId,
        tsgid: Option<TsgId>,
        add: bool,
    ) -> bool {
        if add {
            if inner.active_channels.test_and_set(chid) {
                return false;
            }
            if let Some(tsgid) = tsgid {
                self.tsgs[tsgid as usize]
                    .num_active_channels
                    .fetch_add(1, Ordering::SeqCst);
                inner.active_tsgs.set(tsgid);
            }
        } else {
            if !inner.active_channels.test_and_clear(chid) {
                return false;
            }
            if let Some(tsgid) = tsgid {
                let prev = self.tsgs[tsgid as usize]
                    .num_active_channels
                    .fetch_sub(1, Ordering::SeqCst);
                assert!(prev > 0, "tsg {} active count underflow", tsgid);
                if prev == 1 {
                    inner.active_tsgs.clear(tsgid);
                }
            }
        }
        true
    }

    // Writes the runlist into buffer |index| and returns its entry count.
    fn construct_locked(
        &self,
        runlist_id: RunlistId,
        inner: &mut RunlistInner,
        index: usize,
    ) -> Result<usize, FifoError> {
        let RunlistInner {
            active_channels,
            active_tsgs,
            buffers,
        } = inner;
        let builder = RunlistBuilder::new(
            &*self.hw,
            &self.tsgs,
            &self.channels,
            active_tsgs,
            active_channels,
            self.config.default_timeslice_us,
            self.scale10x,
        );
        let mut cursor = buffers.cursor(index).ok_or(FifoError::InvalidArgument)?;
        builder
            .construct(&mut cursor, self.config.runlist_interleave)
            .map_err(|_| {
                error!("runlist {} too large", runlist_id);
                FifoError::TooLarge
            })
    }

    // Core of every runlist update. The caller holds the runlist lock.
    // Nothing is changed when the new runlist cannot be built.
    pub(crate) fn update_locked(
        &self,
        runlist_id: RunlistId,
        inner: &mut RunlistInner,
        chid: Option<ChannelId>,
        add: bool,
        wait: bool,
    ) -> Result<UpdateStatus, FifoError> {
        let mut changed = None;
        if let Some(chid) = chid {
            let ch = self.channel(chid)?;
            if ch.runlist_id() != runlist_id {
                error!("ch {} is not on runlist {}", chid, runlist_id);
                return Err(FifoError::InvalidArgument);
            }
            let tsgid = ch.tsgid();
            if !self.apply_channel_change(inner, chid, tsgid, add) {
                return Ok(UpdateStatus::NoChange);
            }
            changed = Some((chid, tsgid));
        }

        let _sched = SchedMutexGuard::acquire(&*self.hw);

        let index = inner.buffers.inactive_index();
        let iova = inner.buffers.iova(index);
        let built = if iova == 0 {
            error!("runlist {} buffer {} has no memory", runlist_id, index);
            Err(FifoError::InvalidArgument)
        } else if chid.is_some() || add {
            self.construct_locked(runlist_id, inner, index)
        } else {
            // Empty list: the hardware runs nothing from this runlist.
            Ok(0)
        };
        let count = match built {
            Ok(count) => count,
            Err(e) => {
                if let Some((chid, tsgid)) = changed {
                    self.apply_channel_change(inner, chid, tsgid, !add);
                }
                return Err(e);
            }
        };

        self.hw.submit(runlist_id, iova, count, index);

        if wait {
            match self.hw.wait_for_ack(runlist_id) {
                AckStatus::Acked => {}
                AckStatus::TimedOut => {
                    error!("runlist {} update timed out", runlist_id);
                    return Err(FifoError::Timeout);
                }
                AckStatus::Interrupted => {
                    warn!("runlist {} update interrupted", runlist_id);
                    inner.buffers.commit(index, count);
                    return Err(FifoError::Interrupted);
                }
            }
        }
        inner.buffers.commit(index, count);
        Ok(UpdateStatus::Updated)
    }

    /// Adds (|add|) or removes |chid| on |runlist_id| and submits the
    /// resulting runlist. Without a channel the runlist is rebuilt from
    /// its active sets, or emptied when |add| is false. With |wait| the
    /// call blocks until the hardware acknowledges the new runlist; on a
    /// timeout the previous runlist stays current and recovery is
    /// notified.
    pub fn update_runlist(
        &self,
        runlist_id: RunlistId,
        chid: Option<ChannelId>,
        add: bool,
        wait: bool,
    ) -> Result<UpdateStatus, FifoError> {
        trace!("update_runlist {} ch {:?} add {} wait {}", runlist_id, chid, add, wait);
        let runlist = self.runlist(runlist_id)?;
        let result = {
            let mut inner = runlist.inner.lock();
            self.update_locked(runlist_id, &mut inner, chid, add, wait)
        };
        if result == Err(FifoError::Timeout) {
            self.recovery.runlist_update_timeout(runlist_id);
        }
        result
    }

    /// Updates the runlist |chid| is assigned to.
    pub fn update_for_channel(
        &self,
        chid: ChannelId,
        add: bool,
        wait: bool,
    ) -> Result<UpdateStatus, FifoError> {
        let runlist_id = self.channel(chid)?.runlist_id();
        self.update_runlist(runlist_id, Some(chid), add, wait)
    }

    pub fn reload(
        &self,
        runlist_id: RunlistId,
        add: bool,
        wait: bool,
    ) -> Result<UpdateStatus, FifoError> {
        self.update_runlist(runlist_id, None, add, wait)
    }

    /// Reloads every runlist in |mask|. All runlists are attempted; the
    /// last failure, if any, is returned.
    pub fn reload_many(&self, mask: RunlistMask, add: bool, wait: bool) -> Result<(), FifoError> {
        trace!("reload_many {:#x} add {}", mask, add);
        let mut result = Ok(());
        for runlist in self.runlists.iter().filter(|rl| mask & (1 << rl.id) != 0) {
            if let Err(e) = self.reload(runlist.id, add, wait) {
                error!("runlist {} reload failed: {:?}", runlist.id, e);
                result = Err(e);
            }
        }
        result
    }

    /// Locks every runlist, for callers that must rebuild several runlists
    /// without interleaving with other updates.
    pub fn lock_all_runlists(&self) -> RunlistLockAll<'_> { RunlistLockAll::lock(self.runlists.iter()) }

    /// Locks the runlists in |mask|.
    pub fn lock_runlists(&self, mask: RunlistMask) -> RunlistLockAll<'_> {
        RunlistLockAll::lock(self.runlists.iter().filter(|rl| mask & (1 << rl.id) != 0))
    }

    /// Reloads |runlist_id| whose lock is held in |locks|. A timeout is
    /// returned to the caller, which must run recovery once it drops the
    /// locks.
    pub fn reload_locked(
        &self,
        locks: &mut RunlistLockAll,
        runlist_id: RunlistId,
        add: bool,
        wait: bool,
    ) -> Result<UpdateStatus, FifoError> {
        let inner = locks.get_mut(runlist_id).ok_or_else(|| {
            error!("runlist {} not locked", runlist_id);
            FifoError::InvalidArgument
        })?;
        self.update_locked(runlist_id, inner, None, add, wait)
    }

    /// Resubmits the current runlist of |chid|'s runlist so the front end
    /// re-evaluates it. Fails with Busy instead of waiting for an update in
    /// progress.
    pub fn reschedule(&self, chid: ChannelId) -> Result<(), FifoError> {
        trace!("reschedule ch {}", chid);
        let runlist_id = self.channel(chid)?.runlist_id();
        let runlist = self.runlist(runlist_id)?;
        let result = {
            let inner = runlist.inner.try_lock().ok_or(FifoError::Busy)?;
            let index = match inner.buffers.current() {
                Some(index) => index,
                None => {
                    debug!("runlist {} never submitted", runlist_id);
                    return Ok(());
                }
            };
            let _sched = SchedMutexGuard::acquire(&*self.hw);
            self.hw
                .submit(runlist_id, inner.buffers.iova(index), inner.buffers.count(), index);
            match self.hw.wait_for_ack(runlist_id) {
                AckStatus::Acked => Ok(()),
                AckStatus::TimedOut => {
                    error!("runlist {} reschedule timed out", runlist_id);
                    Err(FifoError::Timeout)
                }
                AckStatus::Interrupted => Err(FifoError::Interrupted),
            }
        };
        if result == Err(FifoError::Timeout) {
            self.recovery.runlist_update_timeout(runlist_id);
        }
        result
    }

    /// Enables or disables scheduling of the runlists in |mask|.
    pub fn set_runlist_state(&self, mask: RunlistMask, enabled: bool) {
        trace!("set_runlist_state {:#x} enabled {}", mask, enabled);
        let _sched = SchedMutexGuard::acquire(&*self.hw);
        self.hw.set_runlist_enabled_mask(mask, enabled);
    }

    /// Runlists serving any engine in |engine_mask| or any PBDMA in
    /// |pbdma_mask|; all runlists when both masks are empty.
    pub fn runlists_mask(&self, engine_mask: EngineMask, pbdma_mask: EngineMask) -> RunlistMask {
        self.runlists
            .iter()
            .filter(|rl| {
                (engine_mask == 0 && pbdma_mask == 0)
                    || self.engines.runlist_engine_mask(rl.id) & engine_mask != 0
                    || self.engines.runlist_pbdma_mask(rl.id) & pbdma_mask != 0
            })
            .fold(0, |mask, rl| mask | (1 << rl.id))
    }

    pub fn current_runlist(&self, runlist_id: RunlistId) -> Result<CurrentRunlist, FifoError> {
        let inner = self.runlist(runlist_id)?.inner.lock();
        Ok(CurrentRunlist {
            buffer_index: inner.buffers.current(),
            count: inner.buffers.count(),
        })
    }

    /// Copy of the live runlist's entries.
    pub fn runlist_entries(&self, runlist_id: RunlistId) -> Result<Vec<u8>, FifoError> {
        let inner = self.runlist(runlist_id)?.inner.lock();
        Ok(inner.buffers.current_entries().to_vec())
    }

    pub fn runlist_active_tsgs(&self, runlist_id: RunlistId) -> Result<Vec<TsgId>, FifoError> {
        let inner = self.runlist(runlist_id)?.inner.lock();
        Ok(inner.active_tsgs.iter_ones().collect())
    }

    pub fn is_channel_active(&self, chid: ChannelId) -> Result<bool, FifoError> {
        let runlist_id = self.channel(chid)?.runlist_id();
        let inner = self.runlist(runlist_id)?.inner.lock();
        Ok(inner.active_channels.is_set(chid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fifo::tests::{bound_tsg, setup_fifo, setup_fifo_with};
    use fake_fifo_hw::{decode_entries, FakeEntry, FakeFifoHw};

    #[test]
    fn test_end_to_end_update() {
        let (hw, fifo) = setup_fifo(FifoConfig::default());
        let (tsgid, chids) = bound_tsg(&fifo, 1, 2);
        fifo.tsg_set_interleave(tsgid, InterleaveLevel::High.into()).unwrap();

        for chid in chids.iter() {
            assert_eq!(fifo.update_for_channel(*chid, true, true), Ok(UpdateStatus::Updated));
        }
        let current = fifo.current_runlist(1).unwrap();
        // Three submits: the interleave reload, then one per channel.
        assert_eq!(current.buffer_index, Some(0));
        assert_eq!(current.count, 3);
        assert_eq!(hw.last_submit().map(|s| (s.count, s.buffer_index)), Some((3, 0)));
        let entries = fifo.runlist_entries(1).unwrap();
        assert_eq!(
            decode_entries(&entries, 3),
            [
                FakeEntry::Tsg {
                    tsgid,
                    num_channels: 2,
                    timeslice: TSG_TIMESLICE_DEFAULT_US
                },
                FakeEntry::Channel {
                    chid: chids[0],
                    runlist_id: 1,
                    subctx_id: 0
                },
                FakeEntry::Channel {
                    chid: chids[1],
                    runlist_id: 1,
                    subctx_id: 0
                },
            ]
        );
        assert!(fifo.is_channel_active(chids[0]).unwrap());
        assert!(fifo.is_channel_active(chids[1]).unwrap());
        assert_eq!(fifo.runlist_active_tsgs(1).unwrap(), [tsgid]);
        assert_eq!(fifo.tsg_num_active_channels(tsgid), Ok(2));
        let (acquired, released) = hw.sched_mutex_counts();
        assert_eq!(acquired, released);
    }

    #[test]
    fn test_timeslice_scaled_to_ptimer_source() {
        for (freq, timeslice_us, expected) in [
            (PTIMER_REF_FREQ_HZ * 2, TSG_TIMESLICE_DEFAULT_US, 2048),
            (PTIMER_REF_FREQ_HZ / 2, TSG_TIMESLICE_DEFAULT_US, 512),
            // Scale factor 3.33 truncates to 3.
            (PTIMER_REF_FREQ_HZ * 3, 1229, 4096),
        ] {
            let hw = FakeFifoHw::new();
            hw.set_ptimer_src_freq(freq);
            let (_, fifo) = setup_fifo_with(hw, FifoConfig::default());
            let (tsgid, chids) = bound_tsg(&fifo, 0, 1);
            fifo.tsg_set_timeslice(tsgid, timeslice_us).unwrap();
            fifo.update_for_channel(chids[0], true, true).unwrap();
            assert_eq!(
                decode_entries(&fifo.runlist_entries(0).unwrap(), 1),
                [FakeEntry::Tsg {
                    tsgid,
                    num_channels: 1,
                    timeslice: expected
                }]
            );
        }
    }

    #[test]
    fn test_concurrent_updates() {
        let (hw, fifo) = setup_fifo(FifoConfig::default());
        let (tsg0, chids0) = bound_tsg(&fifo, 0, 2);
        let (tsg1, chids1) = bound_tsg(&fifo, 1, 2);
        std::thread::scope(|s| {
            for chid in chids0.iter().chain(chids1.iter()) {
                let fifo = &fifo;
                let chid = *chid;
                s.spawn(move || {
                    for _ in 0..200 {
                        assert_eq!(fifo.update_for_channel(chid, true, true), Ok(UpdateStatus::Updated));
                        assert_eq!(fifo.update_for_channel(chid, false, true), Ok(UpdateStatus::Updated));
                    }
                    assert_eq!(fifo.update_for_channel(chid, true, true), Ok(UpdateStatus::Updated));
                });
            }
        });
        for (runlist_id, tsgid, chids) in [(0, tsg0, &chids0), (1, tsg1, &chids1)] {
            assert!(chids.iter().all(|chid| fifo.is_channel_active(*chid).unwrap()));
            assert_eq!(fifo.tsg_num_active_channels(tsgid), Ok(2));
            assert_eq!(fifo.runlist_active_tsgs(runlist_id).unwrap(), [tsgid]);
            assert_eq!(fifo.current_runlist(runlist_id).unwrap().count, 3);
        }
        // Every state change reached the hardware.
        assert_eq!(hw.submits().len(), 4 * 401);
        let (acquired, released) = hw.sched_mutex_counts();
        assert_eq!(acquired, released);
    }

    #[test]
    fn test_update_no_change() {
        let (hw, fifo) = setup_fifo(FifoConfig::default());
        let (_tsgid, chids) = bound_tsg(&fifo, 0, 1);
        assert_eq!(fifo.update_for_channel(chids[0], true, true), Ok(UpdateStatus::Updated));
        let submits = hw.submits().len();
        assert_eq!(fifo.update_for_channel(chids[0], true, true), Ok(UpdateStatus::NoChange));
        assert_eq!(hw.submits().len(), submits);

        assert_eq!(fifo.update_for_channel(chids[0], false, true), Ok(UpdateStatus::Updated));
        assert_eq!(fifo.update_for_channel(chids[0], false, true), Ok(UpdateStatus::NoChange));
        assert!(fifo.runlist_active_tsgs(0).unwrap().is_empty());
        assert_eq!(fifo.current_runlist(0).unwrap().count, 0);
    }

    #[test]
    fn test_buffers_alternate() {
        let (hw, fifo) = setup_fifo(FifoConfig::default());
        for expected in [0, 1, 0, 1] {
            fifo.reload(0, true, true).unwrap();
            assert_eq!(fifo.current_runlist(0).unwrap().buffer_index, Some(expected));
            assert_eq!(hw.last_submit().unwrap().buffer_index, expected);
        }
    }

    #[test]
    fn test_timeout_keeps_current_buffer() {
        let (hw, fifo) = setup_fifo(FifoConfig::default());
        fifo.reload(2, true, true).unwrap();
        hw.set_ack(AckStatus::TimedOut);
        assert_eq!(fifo.reload(2, true, true), Err(FifoError::Timeout));
        // Submitted from buffer 1 but buffer 0 is still the live one.
        assert_eq!(hw.last_submit().unwrap().buffer_index, 1);
        assert_eq!(fifo.current_runlist(2).unwrap().buffer_index, Some(0));
        assert_eq!(hw.runlist_timeouts(), [2]);

        // No wait, no timeout.
        assert_eq!(fifo.reload(2, true, false), Ok(UpdateStatus::Updated));
        assert_eq!(fifo.current_runlist(2).unwrap().buffer_index, Some(1));
    }

    #[test]
    fn test_interrupted_still_swaps() {
        let (hw, fifo) = setup_fifo(FifoConfig::default());
        hw.set_ack(AckStatus::Interrupted);
        assert_eq!(fifo.reload(0, true, true), Err(FifoError::Interrupted));
        assert_eq!(fifo.current_runlist(0).unwrap().buffer_index, Some(0));
        assert!(hw.runlist_timeouts().is_empty());
    }

    #[test]
    fn test_clear_runlist() {
        let (hw, fifo) = setup_fifo(FifoConfig::default());
        let (_tsgid, chids) = bound_tsg(&fifo, 0, 2);
        for chid in chids.iter() {
            fifo.update_for_channel(*chid, true, true).unwrap();
        }
        assert_eq!(fifo.reload(0, false, true), Ok(UpdateStatus::Updated));
        assert_eq!(hw.last_submit().unwrap().count, 0);
        assert_eq!(fifo.current_runlist(0).unwrap().count, 0);
        // The active sets are untouched; a reload restores the list.
        assert_eq!(fifo.reload(0, true, true), Ok(UpdateStatus::Updated));
        assert_eq!(fifo.current_runlist(0).unwrap().count, 3);
    }

    #[test]
    fn test_too_large() {
        let hw = FakeFifoHw::with_limits(2, 2);
        let (_, fifo) = setup_fifo_with(hw.clone(), FifoConfig::default());
        let (tsgid, chids) = bound_tsg(&fifo, 0, 2);
        fifo.update_for_channel(chids[0], true, true).unwrap();
        let submits = hw.submits().len();
        assert_eq!(fifo.update_for_channel(chids[1], true, true), Err(FifoError::TooLarge));
        assert_eq!(hw.submits().len(), submits);
        assert_eq!(fifo.current_runlist(0).unwrap().count, 2);
        // The failed add left no trace.
        assert!(!fifo.is_channel_active(chids[1]).unwrap());
        assert_eq!(fifo.tsg_num_active_channels(tsgid), Ok(1));
        assert_eq!(fifo.runlist_active_tsgs(0).unwrap(), [tsgid]);
        assert_eq!(fifo.update_for_channel(chids[1], true, true), Err(FifoError::TooLarge));

        // Once there is room the same add goes through.
        assert_eq!(fifo.update_for_channel(chids[0], false, true), Ok(UpdateStatus::Updated));
        assert_eq!(fifo.update_for_channel(chids[1], true, true), Ok(UpdateStatus::Updated));
        assert!(fifo.is_channel_active(chids[1]).unwrap());
        assert_eq!(fifo.tsg_num_active_channels(tsgid), Ok(1));
        assert_eq!(
            decode_entries(&fifo.runlist_entries(0).unwrap(), 2)[1],
            FakeEntry::Channel {
                chid: chids[1],
                runlist_id: 0,
                subctx_id: 0
            }
        );
    }

    #[test]
    fn test_no_memory_leaves_sets_alone() {
        let (hw, mut fifo) = setup_fifo(FifoConfig::default());
        let (tsgid, chids) = bound_tsg(&fifo, 0, 1);
        fifo.cleanup();
        assert_eq!(fifo.update_for_channel(chids[0], true, true), Err(FifoError::InvalidArgument));
        assert!(!fifo.is_channel_active(chids[0]).unwrap());
        assert_eq!(fifo.tsg_num_active_channels(tsgid), Ok(0));
        assert!(fifo.runlist_active_tsgs(0).unwrap().is_empty());
        assert!(hw.submits().is_empty());
    }

    #[test]
    fn test_reload_many_last_error() {
        let (hw, fifo) = setup_fifo(FifoConfig::default());
        assert_eq!(fifo.reload_many(0b0101, true, true), Ok(()));
        assert_eq!(
            hw.submits().iter().map(|s| s.runlist_id).collect::<Vec<_>>(),
            [0, 2]
        );
        hw.set_ack(AckStatus::TimedOut);
        assert_eq!(fifo.reload_many(0b1111, true, true), Err(FifoError::Timeout));
        // Every runlist was attempted.
        assert_eq!(hw.runlist_timeouts(), [0, 1, 2, 3]);
    }

    #[test]
    fn test_reload_locked() {
        let (hw, fifo) = setup_fifo(FifoConfig::default());
        {
            let mut locks = fifo.lock_runlists(0b0110);
            assert_eq!(locks.len(), 2);
            assert_eq!(fifo.reload_locked(&mut locks, 1, true, true), Ok(UpdateStatus::Updated));
            assert_eq!(
                fifo.reload_locked(&mut locks, 0, true, true),
                Err(FifoError::InvalidArgument)
            );
        }
        let mut all = fifo.lock_all_runlists();
        assert_eq!(all.len(), 4);
        hw.set_ack(AckStatus::TimedOut);
        assert_eq!(fifo.reload_locked(&mut all, 3, true, true), Err(FifoError::Timeout));
        // Recovery is left to the caller.
        assert!(hw.runlist_timeouts().is_empty());
    }

    #[test]
    fn test_reschedule() {
        let (hw, fifo) = setup_fifo(FifoConfig::default());
        let (_tsgid, chids) = bound_tsg(&fifo, 0, 1);
        fifo.update_for_channel(chids[0], true, true).unwrap();
        let submits = hw.submits().len();
        assert_eq!(fifo.reschedule(chids[0]), Ok(()));
        assert_eq!(hw.submits().len(), submits + 1);
        assert_eq!(hw.last_submit().unwrap().count, 2);

        let _held = fifo.lock_all_runlists();
        assert_eq!(fifo.reschedule(chids[0]), Err(FifoError::Busy));
    }

    #[test]
    fn test_runlist_state_and_mask() {
        let (hw, fifo) = setup_fifo(FifoConfig::default());
        fifo.set_runlist_state(0b0011, false);
        assert_eq!(hw.enabled_mask() & 0b1111, 0b1100);
        fifo.set_runlist_state(0b0001, true);
        assert_eq!(hw.enabled_mask() & 0b1111, 0b1101);

        hw.set_runlist_engines(0, 0b001, 0b01);
        hw.set_runlist_engines(2, 0b110, 0b10);
        assert_eq!(fifo.runlists_mask(0b100, 0), 0b100);
        assert_eq!(fifo.runlists_mask(0, 0b01), 0b001);
        assert_eq!(fifo.runlists_mask(0b001, 0b10), 0b101);
        assert_eq!(fifo.runlists_mask(0b1000, 0), 0);
        assert_eq!(fifo.runlists_mask(0, 0), 0b1111);
    }

    #[test]
    fn test_invalid_runlist() {
        let (_hw, fifo) = setup_fifo(FifoConfig::default());
        assert_eq!(fifo.reload(9, true, true), Err(FifoError::InvalidArgument));
        assert_eq!(fifo.update_for_channel(7, true, true), Err(FifoError::InvalidArgument));
    }
}
