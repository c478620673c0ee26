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

//! Time-slice groups (TSGs).
//!
//! A TSG is the unit the hardware schedules: its channels share a
//! timeslice and an interleave level, and they are placed together in
//! the runlist after the TSG's header. The member list is guarded by a
//! reader/writer lock; runlist construction holds it for reading.
//!
//! Lock order: runlist, member list, TSG state, channel state.

use super::channel::Channel;
use super::Fifo;
use alloc::vec::Vec;
use cantrip_fifo_interface::*;
use core::sync::atomic::{AtomicU32, Ordering};
use log::{debug, error, trace, warn};
use smallvec::SmallVec;
use spin::{Mutex, RwLock};

pub const TSG_INLINE_CHANNELS: usize = 8;

pub type ChannelList = SmallVec<[ChannelId; TSG_INLINE_CHANNELS]>;

/// Graphics context bookkeeping; filled in by the graphics engine code.
#[derive(Debug, Default)]
pub struct GrCtx {
    pub ctx_id: Option<u32>,
}

#[derive(Debug, Default, Copy, Clone)]
pub struct TsgEvents {
    pub enabled: u32,
    pub pending: u32,
}

pub struct TsgState {
    pub in_use: bool,
    pub pid: u32,
    pub interleave_level: InterleaveLevel,
    // 0 selects the configured default.
    pub timeslice_us: u32,
    // Adopted from the first bound channel.
    pub runlist_id: Option<RunlistId>,
    pub gr_ctx: Option<GrCtx>,
    pub sm_error_states: Vec<SmErrorState>,
    pub sm_exception_mask: u32,
    pub events: TsgEvents,
}
impl TsgState {
    fn new() -> Self {
        TsgState {
            in_use: false,
            pid: 0,
            interleave_level: InterleaveLevel::Low,
            timeslice_us: 0,
            runlist_id: None,
            gr_ctx: None,
            sm_error_states: Vec::new(),
            sm_exception_mask: 0,
            events: TsgEvents::default(),
        }
    }
}

pub struct Tsg {
    pub tsgid: TsgId,
    pub state: Mutex<TsgState>,
    pub ch_list: RwLock<ChannelList>,
    // Members currently set in the runlist's active channel set.
    pub num_active_channels: AtomicU32,
    pub refcount: AtomicU32,
}
impl Tsg {
    pub fn new(tsgid: TsgId) -> Self {
        Tsg {
            tsgid,
            state: Mutex::new(TsgState::new()),
            ch_list: RwLock::new(ChannelList::new()),
            num_active_channels: AtomicU32::new(0),
            refcount: AtomicU32::new(0),
        }
    }

    fn init(&self, pid: u32, num_sm: usize) -> Result<(), FifoError> {
        if num_sm == 0 {
            error!("tsg {}: no SM's", self.tsgid);
            return Err(FifoError::InvalidArgument);
        }
        let mut sm_error_states = Vec::new();
        sm_error_states
            .try_reserve_exact(num_sm)
            .map_err(|_| FifoError::NoMemory)?;
        sm_error_states.resize(num_sm, SmErrorState::default());

        let mut state = self.state.lock();
        *state = TsgState::new();
        state.in_use = true;
        state.pid = pid;
        state.gr_ctx = Some(GrCtx::default());
        state.sm_error_states = sm_error_states;
        drop(state);

        self.ch_list.write().clear();
        self.num_active_channels.store(0, Ordering::SeqCst);
        self.refcount.store(1, Ordering::SeqCst);
        Ok(())
    }

    pub fn is_open(&self) -> bool { self.state.lock().in_use }
    pub fn interleave_level(&self) -> InterleaveLevel { self.state.lock().interleave_level }
    pub fn runlist_id(&self) -> Option<RunlistId> { self.state.lock().runlist_id }
    pub fn timeslice_us(&self, default_us: u32) -> u32 {
        match self.state.lock().timeslice_us {
            0 => default_us,
            us => us,
        }
    }
}

/// Result of one context-switch watchdog pass over a TSG.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct CtxswTimeoutCheck {
    /// The TSG made no progress for too long and must be recovered.
    pub recover: bool,
    pub debug_dump: bool,
    /// No-progress time of the channel that triggered recovery.
    pub accumulated_ms: u32,
}

impl Fifo {
    pub(crate) fn tsg(&self, tsgid: TsgId) -> Result<&Tsg, FifoError> {
        match self.tsgs.get(tsgid as usize) {
            Some(tsg) if tsg.is_open() => Ok(tsg),
            _ => {
                error!("invalid tsg {}", tsgid);
                Err(FifoError::InvalidArgument)
            }
        }
    }

    /// Allocates a TSG for |pid| with one reference held by the caller.
    pub fn tsg_open(&self, pid: u32) -> Result<TsgId, FifoError> {
        trace!("tsg_open pid {}", pid);
        let tsgid = self.tsg_pool.lock().alloc().ok_or_else(|| {
            error!("no free tsg");
            FifoError::NoTsgAvailable
        })?;
        if let Err(e) = self.tsgs[tsgid as usize].init(pid, self.hw.num_sm()) {
            error!("tsg {} init failed: {:?}", tsgid, e);
            self.tsg_pool.lock().free(tsgid);
            return Err(e);
        }
        debug!("tsg {} opened for pid {}", tsgid, pid);
        Ok(tsgid)
    }

    pub fn tsg_get(&self, tsgid: TsgId) -> Result<(), FifoError> {
        self.tsg(tsgid)?.refcount.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Drops a reference; the last one releases the TSG.
    pub fn tsg_put(&self, tsgid: TsgId) -> Result<(), FifoError> {
        let tsg = self.tsg(tsgid)?;
        let prev = tsg.refcount.fetch_sub(1, Ordering::SeqCst);
        assert!(prev > 0, "tsg {} refcount underflow", tsgid);
        if prev == 1 {
            self.tsg_release(tsg);
        }
        Ok(())
    }

    fn tsg_release(&self, tsg: &Tsg) {
        trace!("tsg_release {}", tsg.tsgid);
        if !tsg.ch_list.read().is_empty() {
            warn!("tsg {} released with channels bound", tsg.tsgid);
        }
        let mut state = tsg.state.lock();
        if let Some(gr_ctx) = state.gr_ctx.take() {
            if let Some(ctx_id) = gr_ctx.ctx_id {
                debug!("tsg {}: free gr ctx {}", tsg.tsgid, ctx_id);
            }
        }
        if state.events.pending != 0 {
            debug!("tsg {}: dropping events {:#x}", tsg.tsgid, state.events.pending);
        }
        *state = TsgState::new();
        drop(state);
        self.tsg_pool.lock().free(tsg.tsgid);
    }

    /// Adds |chid| to |tsgid|. The channel must be unbound, inactive, and
    /// on the TSG's runlist (the first bound channel picks the runlist).
    pub fn tsg_bind_channel(&self, tsgid: TsgId, chid: ChannelId) -> Result<(), FifoError> {
        trace!("tsg_bind_channel tsg {} ch {}", tsgid, chid);
        let tsg = self.tsg(tsgid)?;
        let ch = self.channel(chid)?;
        // Held across the check and the bind; updates see the channel
        // either unbound and inactive or fully bound.
        let runlist = self.runlist(ch.runlist_id())?.inner.lock();
        if runlist.active_channels.is_set(chid) {
            error!("ch {} is active, cannot bind to tsg {}", chid, tsgid);
            return Err(FifoError::InvalidArgument);
        }

        let mut ch_list = tsg.ch_list.write();
        let mut tsg_state = tsg.state.lock();
        let mut ch_state = ch.state.lock();
        if let Some(bound) = ch_state.tsgid {
            error!("ch {} already bound to tsg {}", chid, bound);
            return Err(FifoError::InvalidArgument);
        }
        if let Some(runlist_id) = tsg_state.runlist_id {
            if runlist_id != ch_state.runlist_id {
                error!(
                    "ch {} runlist {} does not match tsg {} runlist {}",
                    chid, ch_state.runlist_id, tsgid, runlist_id
                );
                return Err(FifoError::InvalidArgument);
            }
        }
        ch_list.try_reserve(1).map_err(|_| FifoError::NoMemory)?;
        ch_list.push(chid);
        tsg_state.runlist_id = Some(ch_state.runlist_id);
        ch_state.tsgid = Some(tsgid);
        drop(ch_state);
        drop(tsg_state);
        drop(ch_list);
        drop(runlist);

        tsg.refcount.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Removes |chid| from |tsgid|. The channel is taken off the runlist
    /// first; if that cannot be done cleanly the whole TSG is aborted and
    /// the channel removed regardless. The error is still returned.
    pub fn tsg_unbind_channel(&self, tsgid: TsgId, chid: ChannelId) -> Result<(), FifoError> {
        trace!("tsg_unbind_channel tsg {} ch {}", tsgid, chid);
        let tsg = self.tsg(tsgid)?;
        let ch = self.channel(chid)?;
        if ch.tsgid() != Some(tsgid) {
            error!("ch {} not bound to tsg {}", chid, tsgid);
            return Err(FifoError::InvalidArgument);
        }

        let mut result = self.tsg_unbind_channel_common(tsg, ch);
        if let Err(e) = result {
            error!("ch {} unbind from tsg {} failed: {:?}, aborting tsg", chid, tsgid, e);
            self.abort_tsg(tsg, true);
            // The channel may still be on the runlist.
            if let Err(e) = self.tsg_detach_channel(tsg, ch) {
                error!("ch {} runlist removal failed: {:?}", chid, e);
            }
        }

        if let Err(e) = self.hw.tsg_unbind_channel(tsgid, chid) {
            error!("ch {} hw unbind from tsg {} failed: {:?}", chid, tsgid, e);
            if result.is_ok() {
                result = Err(e);
            }
        }
        self.tsg_put(tsgid)?;
        result
    }

    fn tsg_unbind_channel_common(&self, tsg: &Tsg, ch: &Channel) -> Result<(), FifoError> {
        // A channel of a timed out TSG was marked unserviceable.
        let tsg_timedout = {
            let _ch_list = tsg.ch_list.write();
            ch.is_unserviceable()
        };

        self.disable_tsg(tsg);
        let result = self.tsg_unbind_channel_quiesced(tsg, ch);
        if !tsg_timedout {
            self.enable_tsg(tsg);
        }
        result
    }

    // Called with the TSG disabled.
    fn tsg_unbind_channel_quiesced(&self, tsg: &Tsg, ch: &Channel) -> Result<(), FifoError> {
        if let Some(runlist_id) = tsg.runlist_id() {
            self.hw.preempt_tsg(runlist_id, tsg.tsgid).map_err(|e| {
                error!("tsg {} preempt failed: {:?}", tsg.tsgid, e);
                e
            })?;
        }
        // A lone channel has no siblings to hand context state to.
        if tsg.ch_list.read().len() > 1 {
            self.tsg_unbind_check_hw_state(tsg, ch.chid)?;
        }
        self.tsg_detach_channel(tsg, ch)
    }

    fn tsg_unbind_check_hw_state(&self, tsg: &Tsg, chid: ChannelId) -> Result<(), FifoError> {
        let hw_state = self.hw.channel_hw_state(chid);
        if hw_state.next {
            error!("ch {} to be removed from tsg {} has NEXT set", chid, tsg.tsgid);
            return Err(FifoError::UnbindHwState);
        }
        if hw_state.ctx_reload {
            // Pass the pending context reload to another member.
            let ch_list = tsg.ch_list.read();
            if let Some(other) = ch_list.iter().find(|other| **other != chid) {
                debug!("ch {} ctx reload moved to ch {}", chid, other);
                self.hw.force_ctx_reload(*other);
            }
        }
        Ok(())
    }

    // Takes |ch| off its runlist and out of |tsg| under one hold of the
    // runlist lock. The channel leaves the active sets and the member list
    // even when the runlist update fails.
    fn tsg_detach_channel(&self, tsg: &Tsg, ch: &Channel) -> Result<(), FifoError> {
        let runlist_id = ch.runlist_id();
        let runlist = self.runlist(runlist_id)?;
        let result = {
            let mut inner = runlist.inner.lock();
            let result = self.update_locked(runlist_id, &mut inner, Some(ch.chid), false, true);
            if result.is_err() && inner.active_channels.is_set(ch.chid) {
                warn!("ch {} left in runlist {} hardware list", ch.chid, runlist_id);
                self.apply_channel_change(&mut inner, ch.chid, Some(tsg.tsgid), false);
            }
            self.tsg_remove_channel(tsg, ch);
            result
        };
        if result == Err(FifoError::Timeout) {
            self.recovery.runlist_update_timeout(runlist_id);
        }
        result.map(|_| ())
    }

    // Called with the channel's runlist locked.
    fn tsg_remove_channel(&self, tsg: &Tsg, ch: &Channel) {
        let mut ch_list = tsg.ch_list.write();
        ch_list.retain(|member| *member != ch.chid);
        let mut tsg_state = tsg.state.lock();
        if ch_list.is_empty() {
            tsg_state.runlist_id = None;
        }
        ch.state.lock().tsgid = None;
        // Another thread may have re-enabled it while it was on the list.
        self.hw.disable_channel(ch.chid);
    }

    fn disable_tsg(&self, tsg: &Tsg) {
        for chid in tsg.ch_list.read().iter() {
            self.hw.disable_channel(*chid);
        }
    }

    // Channels with NEXT or CTX_RELOAD pending are enabled before the
    // others; scheduling of the runlist is off meanwhile.
    fn enable_tsg(&self, tsg: &Tsg) {
        self.set_tsg_sched(tsg, false);
        {
            let ch_list = tsg.ch_list.read();
            let pending = |chid: ChannelId| {
                let hw_state = self.hw.channel_hw_state(chid);
                hw_state.next || hw_state.ctx_reload
            };
            for chid in ch_list.iter().filter(|chid| pending(**chid)) {
                self.hw.enable_channel(*chid);
            }
            for chid in ch_list.iter().filter(|chid| !pending(**chid)) {
                self.hw.enable_channel(*chid);
            }
        }
        self.set_tsg_sched(tsg, true);
    }

    fn set_tsg_sched(&self, tsg: &Tsg, enabled: bool) {
        if let Some(runlist_id) = tsg.runlist_id() {
            self.set_runlist_state(1 << runlist_id, enabled);
        }
    }

    pub fn tsg_enable(&self, tsgid: TsgId) -> Result<(), FifoError> {
        self.enable_tsg(self.tsg(tsgid)?);
        Ok(())
    }
    pub fn tsg_disable(&self, tsgid: TsgId) -> Result<(), FifoError> {
        self.disable_tsg(self.tsg(tsgid)?);
        Ok(())
    }
    pub fn tsg_enable_sched(&self, tsgid: TsgId) -> Result<(), FifoError> {
        self.set_tsg_sched(self.tsg(tsgid)?, true);
        Ok(())
    }
    pub fn tsg_disable_sched(&self, tsgid: TsgId) -> Result<(), FifoError> {
        self.set_tsg_sched(self.tsg(tsgid)?, false);
        Ok(())
    }

    /// Stops every channel of |tsgid| for good: disables them, optionally
    /// preempts the TSG and hands each channel to recovery clean-up.
    pub fn tsg_abort(&self, tsgid: TsgId, preempt: bool) -> Result<(), FifoError> {
        trace!("tsg_abort {} preempt {}", tsgid, preempt);
        self.abort_tsg(self.tsg(tsgid)?, preempt);
        Ok(())
    }

    fn abort_tsg(&self, tsg: &Tsg, preempt: bool) {
        self.disable_tsg(tsg);
        if preempt {
            if let Some(runlist_id) = tsg.runlist_id() {
                if let Err(e) = self.hw.preempt_tsg(runlist_id, tsg.tsgid) {
                    warn!("tsg {} abort preempt failed: {:?}", tsg.tsgid, e);
                }
            }
        }
        let ch_list = tsg.ch_list.read();
        for chid in ch_list.iter() {
            self.channels[*chid as usize].set_unserviceable();
            self.recovery.channel_abort_clean_up(*chid);
        }
    }

    /// Sets the interleave level from its raw value and rebuilds the
    /// TSG's runlist.
    pub fn tsg_set_interleave(&self, tsgid: TsgId, level: u32) -> Result<(), FifoError> {
        trace!("tsg_set_interleave {} level {}", tsgid, level);
        let tsg = self.tsg(tsgid)?;
        let level = InterleaveLevel::try_from(level).map_err(|_| {
            error!("tsg {}: invalid interleave level {}", tsgid, level);
            FifoError::InvalidArgument
        })?;
        let runlist_id = {
            let mut state = tsg.state.lock();
            state.interleave_level = level;
            state.runlist_id
        };
        match runlist_id {
            Some(runlist_id) => self.reload(runlist_id, true, true).map(|_| ()),
            None => Ok(()),
        }
    }

    pub fn tsg_interleave(&self, tsgid: TsgId) -> Result<InterleaveLevel, FifoError> {
        Ok(self.tsg(tsgid)?.interleave_level())
    }

    /// Sets the timeslice and rebuilds the TSG's runlist.
    pub fn tsg_set_timeslice(&self, tsgid: TsgId, timeslice_us: u32) -> Result<(), FifoError> {
        trace!("tsg_set_timeslice {} {}us", tsgid, timeslice_us);
        let tsg = self.tsg(tsgid)?;
        if timeslice_us < self.config.min_timeslice_us || timeslice_us > self.config.max_timeslice_us
        {
            error!("tsg {}: timeslice {}us out of range", tsgid, timeslice_us);
            return Err(FifoError::InvalidArgument);
        }
        let runlist_id = {
            let mut state = tsg.state.lock();
            state.timeslice_us = timeslice_us;
            state.runlist_id
        };
        match runlist_id {
            Some(runlist_id) => self.reload(runlist_id, true, true).map(|_| ()),
            None => Ok(()),
        }
    }

    /// Effective timeslice in microseconds.
    pub fn tsg_timeslice(&self, tsgid: TsgId) -> Result<u32, FifoError> {
        Ok(self
            .tsg(tsgid)?
            .timeslice_us(self.config.default_timeslice_us))
    }

    /// One watchdog pass: every member's no-progress time advances by the
    /// watchdog period unless its GP_GET moved. The pass stops at the first
    /// channel that made progress (all counters restart) or exceeded the
    /// limit (the TSG must be recovered).
    pub fn tsg_check_ctxsw_timeout(&self, tsgid: TsgId) -> Result<CtxswTimeoutCheck, FifoError> {
        let tsg = self.tsg(tsgid)?;
        let mut check = CtxswTimeoutCheck {
            recover: false,
            debug_dump: false,
            accumulated_ms: 0,
        };
        {
            let ch_list = tsg.ch_list.read();
            let mut progress = false;
            for chid in ch_list.iter() {
                let ch = &self.channels[*chid as usize];
                let sample = ch.update_and_check_ctxsw_timeout(
                    self.hw.channel_gp_get(*chid),
                    self.config.ctxsw_timeout_period_ms,
                    self.config.ctxsw_timeout_max_ms,
                    self.config.timeouts_enabled,
                );
                if sample.exceeded {
                    check.recover = true;
                    check.debug_dump = sample.debug_dump;
                    check.accumulated_ms = sample.accumulated_ms;
                    break;
                }
                if sample.progress {
                    progress = true;
                    break;
                }
            }
            if check.recover {
                for chid in ch_list.iter() {
                    self.channels[*chid as usize]
                        .set_error_notifier(ErrorNotifier::FifoErrorIdleTimeout);
                }
            } else if progress {
                for chid in ch_list.iter() {
                    self.channels[*chid as usize].reset_ctxsw_timeout();
                }
            }
        }
        if check.recover {
            error!("tsg {} ctxsw timeout after {}ms", tsgid, check.accumulated_ms);
            self.recovery.tsg_ctxsw_timeout(tsgid, check.accumulated_ms);
        }
        Ok(check)
    }

    pub fn tsg_from_channel(&self, chid: ChannelId) -> Option<TsgId> {
        self.channel(chid).ok()?.tsgid()
    }

    pub fn tsg_channels(&self, tsgid: TsgId) -> Result<Vec<ChannelId>, FifoError> {
        Ok(self.tsg(tsgid)?.ch_list.read().to_vec())
    }

    pub fn tsg_runlist_id(&self, tsgid: TsgId) -> Result<Option<RunlistId>, FifoError> {
        Ok(self.tsg(tsgid)?.runlist_id())
    }

    pub fn tsg_num_active_channels(&self, tsgid: TsgId) -> Result<u32, FifoError> {
        Ok(self.tsg(tsgid)?.num_active_channels.load(Ordering::SeqCst))
    }

    /// Marks every member unserviceable. Returns true if any of them wants
    /// a debug dump.
    pub fn tsg_mark_error(&self, tsgid: TsgId) -> Result<bool, FifoError> {
        let tsg = self.tsg(tsgid)?;
        let mut verbose = false;
        for chid in tsg.ch_list.read().iter() {
            verbose |= self.channels[*chid as usize].mark_error();
        }
        Ok(verbose)
    }

    pub fn tsg_set_error_notifier(
        &self,
        tsgid: TsgId,
        notifier: ErrorNotifier,
    ) -> Result<(), FifoError> {
        let tsg = self.tsg(tsgid)?;
        for chid in tsg.ch_list.read().iter() {
            self.channels[*chid as usize].set_error_notifier(notifier);
        }
        Ok(())
    }

    pub fn tsg_set_ctx_mmu_error(&self, tsgid: TsgId) -> Result<(), FifoError> {
        self.tsg_set_error_notifier(tsgid, ErrorNotifier::FifoErrorMmuErrFlt)
    }

    pub fn tsg_update_sm_error_state(
        &self,
        tsgid: TsgId,
        sm_id: usize,
        sm_error_state: &SmErrorState,
    ) -> Result<(), FifoError> {
        let mut state = self.tsg(tsgid)?.state.lock();
        let slot = state
            .sm_error_states
            .get_mut(sm_id)
            .ok_or(FifoError::InvalidArgument)?;
        *slot = *sm_error_state;
        Ok(())
    }

    pub fn tsg_sm_error_state(&self, tsgid: TsgId, sm_id: usize) -> Result<SmErrorState, FifoError> {
        let state = self.tsg(tsgid)?.state.lock();
        state
            .sm_error_states
            .get(sm_id)
            .copied()
            .ok_or(FifoError::InvalidArgument)
    }

    pub fn tsg_set_sm_exception_mask(&self, tsgid: TsgId, mask: u32) -> Result<(), FifoError> {
        self.tsg(tsgid)?.state.lock().sm_exception_mask = mask;
        Ok(())
    }

    pub fn tsg_event_subscribe(
        &self,
        tsgid: TsgId,
        event: TsgEvent,
        enable: bool,
    ) -> Result<(), FifoError> {
        let mut state = self.tsg(tsgid)?.state.lock();
        let bit = 1 << u32::from(event);
        if enable {
            state.events.enabled |= bit;
        } else {
            state.events.enabled &= !bit;
            state.events.pending &= !bit;
        }
        Ok(())
    }

    /// Records |event|; returns false when nobody subscribed to it.
    pub fn tsg_post_event(&self, tsgid: TsgId, event: TsgEvent) -> Result<bool, FifoError> {
        let mut state = self.tsg(tsgid)?.state.lock();
        let bit = 1 << u32::from(event);
        if state.events.enabled & bit == 0 {
            return Ok(false);
        }
        state.events.pending |= bit;
        Ok(true)
    }

    /// Returns and clears the pending event bits.
    pub fn tsg_event_poll(&self, tsgid: TsgId) -> Result<u32, FifoError> {
        let mut state = self.tsg(tsgid)?.state.lock();
        Ok(core::mem::take(&mut state.events.pending))
    }
}
