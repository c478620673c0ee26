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

//! Channel slots. The scheduler tracks only what it needs to place a
//! channel in a runlist and to watch it for context-switch timeouts.

use cantrip_fifo_interface::*;
use spin::Mutex;

pub struct ChannelState {
    pub in_use: bool,
    pub tsgid: Option<TsgId>,
    pub runlist_id: RunlistId,
    pub subctx_id: u32,
    pub inst_ptr: u64,
    // Set once the channel is torn down by recovery; never cleared.
    pub unserviceable: bool,
    pub error_notifier: Option<ErrorNotifier>,
    pub ctxsw_timeout_accumulated_ms: u32,
    pub ctxsw_timeout_gpfifo_get: u32,
    pub ctxsw_timeout_debug_dump: bool,
}
impl ChannelState {
    const fn new() -> Self {
        ChannelState {
            in_use: false,
            tsgid: None,
            runlist_id: 0,
            subctx_id: 0,
            inst_ptr: 0,
            unserviceable: false,
            error_notifier: None,
            ctxsw_timeout_accumulated_ms: 0,
            ctxsw_timeout_gpfifo_get: 0,
            ctxsw_timeout_debug_dump: true,
        }
    }
}

/// Outcome of one watchdog sample of a channel.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct CtxswSample {
    pub progress: bool,
    pub exceeded: bool,
    pub accumulated_ms: u32,
    pub debug_dump: bool,
}

pub struct Channel {
    pub chid: ChannelId,
    pub state: Mutex<ChannelState>,
}
impl Channel {
    pub fn new(chid: ChannelId) -> Self {
        Channel {
            chid,
            state: Mutex::new(ChannelState::new()),
        }
    }

    pub fn open(&self, runlist_id: RunlistId, subctx_id: u32, inst_ptr: u64) {
        let mut state = self.state.lock();
        *state = ChannelState::new();
        state.in_use = true;
        state.runlist_id = runlist_id;
        state.subctx_id = subctx_id;
        state.inst_ptr = inst_ptr;
    }
    pub fn close(&self) { *self.state.lock() = ChannelState::new(); }

    pub fn is_open(&self) -> bool { self.state.lock().in_use }
    pub fn tsgid(&self) -> Option<TsgId> { self.state.lock().tsgid }
    pub fn runlist_id(&self) -> RunlistId { self.state.lock().runlist_id }
    pub fn is_unserviceable(&self) -> bool { self.state.lock().unserviceable }
    pub fn set_unserviceable(&self) { self.state.lock().unserviceable = true; }
    /// Marks the channel unserviceable and returns whether its owner wants
    /// a debug dump.
    pub fn mark_error(&self) -> bool {
        let mut state = self.state.lock();
        state.unserviceable = true;
        state.ctxsw_timeout_debug_dump
    }
    pub fn error_notifier(&self) -> Option<ErrorNotifier> { self.state.lock().error_notifier }
    pub fn set_error_notifier(&self, notifier: ErrorNotifier) {
        self.state.lock().error_notifier = Some(notifier);
    }
    pub fn ctxsw_timeout_accumulated_ms(&self) -> u32 {
        self.state.lock().ctxsw_timeout_accumulated_ms
    }
    pub fn reset_ctxsw_timeout(&self) { self.state.lock().ctxsw_timeout_accumulated_ms = 0; }

    pub fn entry_desc(&self) -> ChannelEntryDesc {
        let state = self.state.lock();
        ChannelEntryDesc {
            chid: self.chid,
            runlist_id: state.runlist_id,
            subctx_id: state.subctx_id,
            inst_ptr: state.inst_ptr,
        }
    }

    /// Feeds one watchdog period into the channel's no-progress counter.
    /// |gp_get| is the channel's current GP_GET; an unchanged value since
    /// the last sample means no progress.
    pub fn update_and_check_ctxsw_timeout(
        &self,
        gp_get: u32,
        period_ms: u32,
        max_ms: u32,
        timeouts_enabled: bool,
    ) -> CtxswSample {
        let mut state = self.state.lock();
        let progress = gp_get != state.ctxsw_timeout_gpfifo_get;
        if progress {
            state.ctxsw_timeout_accumulated_ms = 0;
        } else {
            state.ctxsw_timeout_accumulated_ms =
                state.ctxsw_timeout_accumulated_ms.saturating_add(period_ms);
        }
        state.ctxsw_timeout_gpfifo_get = gp_get;
        CtxswSample {
            progress,
            exceeded: timeouts_enabled && state.ctxsw_timeout_accumulated_ms > max_ms,
            accumulated_ms: state.ctxsw_timeout_accumulated_ms,
            debug_dump: state.ctxsw_timeout_debug_dump,
        }
    }
}
