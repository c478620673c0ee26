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

//! The GPU FIFO scheduler state: runlists, TSGs and channel slots, plus
//! the collaborators used to drive the hardware.

use alloc::boxed::Box;
use alloc::vec::Vec;
use cantrip_fifo_interface::*;
use log::{error, info, trace, warn};
use spin::Mutex;

mod bitmap;
mod buffer;
mod builder;
mod channel;
mod lock;
mod pool;
mod runlist;
mod tsg;

pub use bitmap::ActiveBitmap;
pub use buffer::{RunlistBuffers, RunlistCursor, RunlistFull};
pub use builder::{flat_plan, interleaved_plan, RunlistBuilder, RunlistPlan};
pub use lock::{RunlistLockAll, SchedMutexGuard};
pub use runlist::CurrentRunlist;
pub use tsg::CtxswTimeoutCheck;

use channel::Channel;
use pool::IdPool;
use runlist::Runlist;
use tsg::Tsg;

pub struct Fifo {
    hw: Box<dyn HardwareFifo + Send + Sync>,
    dma: Box<dyn DmaAllocator + Send + Sync>,
    engines: Box<dyn EngineInfo + Send + Sync>,
    recovery: Box<dyn RecoveryHandler + Send + Sync>,
    config: FifoConfig,
    // 10x ratio between the reference and actual timer frequency.
    scale10x: u32,
    runlists: Vec<Runlist>,
    tsgs: Vec<Tsg>,
    channels: Vec<Channel>,
    tsg_pool: Mutex<IdPool>,
    channel_pool: Mutex<IdPool>,
}
impl Fifo {
    /// Sizes runlists, TSGs and channels from |config| and the hardware
    /// limits and allocates every runlist's buffers. On failure anything
    /// already allocated is returned.
    pub fn setup(
        config: FifoConfig,
        hw: Box<dyn HardwareFifo + Send + Sync>,
        dma: Box<dyn DmaAllocator + Send + Sync>,
        engines: Box<dyn EngineInfo + Send + Sync>,
        recovery: Box<dyn RecoveryHandler + Send + Sync>,
    ) -> Result<Fifo, FifoError> {
        let num_runlists = hw.max_runlists();
        let entry_size = hw.entry_size();
        let max_entries = hw.max_entries_per_runlist();
        let ptimer_src_freq = hw.ptimer_src_freq();
        if config.num_channels == 0
            || config.num_tsgs == 0
            || config.min_timeslice_us > config.max_timeslice_us
            || config.default_timeslice_us == 0
            || num_runlists == 0
            || num_runlists > MAX_RUNLISTS
            || entry_size == 0
            || max_entries == 0
            || ptimer_src_freq == 0
        {
            error!(
                "bad fifo setup: {:?} runlists {} entry size {} max entries {} ptimer {}",
                config, num_runlists, entry_size, max_entries, ptimer_src_freq
            );
            return Err(FifoError::InvalidArgument);
        }

        let mut fifo = Fifo {
            hw,
            dma,
            engines,
            recovery,
            config,
            scale10x: ptimer_scalingfactor10x(ptimer_src_freq),
            runlists: Vec::with_capacity(num_runlists),
            tsgs: (0..config.num_tsgs as TsgId).map(Tsg::new).collect(),
            channels: (0..config.num_channels as ChannelId).map(Channel::new).collect(),
            tsg_pool: Mutex::new(IdPool::new("tsg", config.num_tsgs)),
            channel_pool: Mutex::new(IdPool::new("channel", config.num_channels)),
        };
        for runlist_id in 0..num_runlists as RunlistId {
            match RunlistBuffers::alloc(&*fifo.dma, entry_size, max_entries) {
                Ok(buffers) => fifo.runlists.push(Runlist::new(
                    runlist_id,
                    config.num_channels,
                    config.num_tsgs,
                    buffers,
                )),
                Err(e) => {
                    error!("runlist {} setup failed: {:?}", runlist_id, e);
                    fifo.cleanup();
                    return Err(e);
                }
            }
        }
        info!(
            "fifo: {} runlists x {} entries, {} tsgs, {} channels",
            num_runlists, max_entries, config.num_tsgs, config.num_channels
        );
        Ok(fifo)
    }

    /// Returns all runlist memory. Safe to call more than once.
    pub fn cleanup(&mut self) {
        trace!("cleanup");
        for runlist in self.runlists.iter_mut() {
            runlist.inner.get_mut().buffers.free(&*self.dma);
        }
    }

    pub fn config(&self) -> &FifoConfig { &self.config }
    pub fn num_runlists(&self) -> usize { self.runlists.len() }

    pub(crate) fn channel(&self, chid: ChannelId) -> Result<&Channel, FifoError> {
        match self.channels.get(chid as usize) {
            Some(ch) if ch.is_open() => Ok(ch),
            _ => {
                error!("invalid channel {}", chid);
                Err(FifoError::InvalidArgument)
            }
        }
    }

    pub fn channel_error_notifier(&self, chid: ChannelId) -> Result<Option<ErrorNotifier>, FifoError> {
        Ok(self.channel(chid)?.error_notifier())
    }

    pub fn channel_is_unserviceable(&self, chid: ChannelId) -> Result<bool, FifoError> {
        Ok(self.channel(chid)?.is_unserviceable())
    }

    /// Allocates a channel slot served by |runlist_id|.
    pub fn channel_open(
        &self,
        runlist_id: RunlistId,
        subctx_id: u32,
        inst_ptr: u64,
    ) -> Result<ChannelId, FifoError> {
        trace!("channel_open runlist {} subctx {}", runlist_id, subctx_id);
        self.runlist(runlist_id)?;
        let chid = self.channel_pool.lock().alloc().ok_or_else(|| {
            error!("no free channel");
            FifoError::NoChannelAvailable
        })?;
        self.channels[chid as usize].open(runlist_id, subctx_id, inst_ptr);
        Ok(chid)
    }

    /// Takes |chid| out of its TSG and runlist and frees the slot.
    pub fn channel_close(&self, chid: ChannelId) -> Result<(), FifoError> {
        trace!("channel_close {}", chid);
        let ch = self.channel(chid)?;
        if let Some(tsgid) = ch.tsgid() {
            if let Err(e) = self.tsg_unbind_channel(tsgid, chid) {
                warn!("ch {} unbind from tsg {} on close: {:?}", chid, tsgid, e);
            }
        }
        if self.is_channel_active(chid)? {
            if let Err(e) = self.update_for_channel(chid, false, true) {
                warn!("ch {} runlist removal on close: {:?}", chid, e);
            }
        }
        ch.close();
        self.channel_pool.lock().free(chid);
        Ok(())
    }
}
impl Drop for Fifo {
    fn drop(&mut self) { self.cleanup(); }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use fake_fifo_hw::{FakeFifoHw, FAKE_MAX_RUNLISTS};

    pub(crate) fn setup_fifo_with(hw: FakeFifoHw, config: FifoConfig) -> (FakeFifoHw, Fifo) {
        let fifo = Fifo::setup(
            config,
            Box::new(hw.clone()),
            Box::new(hw.clone()),
            Box::new(hw.clone()),
            Box::new(hw.clone()),
        )
        .unwrap();
        (hw, fifo)
    }

    pub(crate) fn setup_fifo(config: FifoConfig) -> (FakeFifoHw, Fifo) {
        setup_fifo_with(FakeFifoHw::new(), config)
    }

    pub(crate) fn open_channel(fifo: &Fifo, runlist_id: RunlistId) -> ChannelId {
        fifo.channel_open(runlist_id, 0, 0x1000).unwrap()
    }

    // Opens a TSG with |count| fresh channels on |runlist_id| bound to it.
    pub(crate) fn bound_tsg(fifo: &Fifo, runlist_id: RunlistId, count: usize) -> (TsgId, Vec<ChannelId>) {
        let tsgid = fifo.tsg_open(1).unwrap();
        let chids: Vec<ChannelId> = (0..count).map(|_| open_channel(fifo, runlist_id)).collect();
        for chid in chids.iter() {
            fifo.tsg_bind_channel(tsgid, *chid).unwrap();
        }
        (tsgid, chids)
    }

    #[test]
    fn test_setup() {
        let (hw, fifo) = setup_fifo(FifoConfig::default());
        assert_eq!(fifo.num_runlists(), FAKE_MAX_RUNLISTS);
        assert_eq!(hw.live_allocs(), 2 * FAKE_MAX_RUNLISTS);
        assert_eq!(fifo.channels.len(), DEFAULT_NUM_CHANNELS);
        for runlist_id in 0..FAKE_MAX_RUNLISTS as RunlistId {
            assert_eq!(
                fifo.current_runlist(runlist_id),
                Ok(CurrentRunlist {
                    buffer_index: None,
                    count: 0
                })
            );
        }
    }

    #[test]
    fn test_setup_failure_unwinds() {
        let hw = FakeFifoHw::new();
        // Runlist 0 gets both buffers, runlist 1 only one.
        hw.fail_alloc_after(3);
        let result = Fifo::setup(
            FifoConfig::default(),
            Box::new(hw.clone()),
            Box::new(hw.clone()),
            Box::new(hw.clone()),
            Box::new(hw.clone()),
        );
        assert_eq!(result.err(), Some(FifoError::NoMemory));
        assert_eq!(hw.live_allocs(), 0);
    }

    #[test]
    fn test_setup_bad_config() {
        let hw = FakeFifoHw::with_limits(MAX_RUNLISTS + 1, 8);
        let result = Fifo::setup(
            FifoConfig::default(),
            Box::new(hw.clone()),
            Box::new(hw.clone()),
            Box::new(hw.clone()),
            Box::new(hw.clone()),
        );
        assert_eq!(result.err(), Some(FifoError::InvalidArgument));

        let hw = FakeFifoHw::new();
        let config = FifoConfig {
            num_tsgs: 0,
            ..Default::default()
        };
        let result = Fifo::setup(
            config,
            Box::new(hw.clone()),
            Box::new(hw.clone()),
            Box::new(hw.clone()),
            Box::new(hw.clone()),
        );
        assert_eq!(result.err(), Some(FifoError::InvalidArgument));
        assert_eq!(hw.live_allocs(), 0);
    }

    #[test]
    fn test_cleanup_idempotent() {
        let (hw, mut fifo) = setup_fifo(FifoConfig::default());
        fifo.reload(0, true, true).unwrap();
        fifo.cleanup();
        assert_eq!(hw.live_allocs(), 0);
        fifo.cleanup();
        assert_eq!(hw.live_allocs(), 0);
        // No memory behind the runlist anymore.
        assert_eq!(fifo.reload(0, true, true), Err(FifoError::InvalidArgument));
        drop(fifo);
        assert_eq!(hw.live_allocs(), 0);
    }

    #[test]
    fn test_channel_open_close() {
        let config = FifoConfig {
            num_channels: 2,
            ..Default::default()
        };
        let (hw, fifo) = setup_fifo(config);
        assert_eq!(fifo.channel_open(FAKE_MAX_RUNLISTS as RunlistId, 0, 0), Err(FifoError::InvalidArgument));
        let (tsgid, chids) = bound_tsg(&fifo, 0, 1);
        let loose = open_channel(&fifo, 0);
        assert_eq!(fifo.channel_open(0, 0, 0), Err(FifoError::NoChannelAvailable));

        fifo.update_for_channel(chids[0], true, true).unwrap();
        fifo.update_for_channel(loose, true, true).unwrap();
        fifo.channel_close(chids[0]).unwrap();
        assert_eq!(fifo.tsg_channels(tsgid), Ok(vec![]));
        assert_eq!(hw.unbinds(), [(tsgid, chids[0])]);
        fifo.channel_close(loose).unwrap();
        assert_eq!(fifo.is_channel_active(loose), Err(FifoError::InvalidArgument));
        assert_eq!(fifo.current_runlist(0).unwrap().count, 0);

        // Both slots are free again.
        assert_eq!(open_channel(&fifo, 1), 0);
        assert_eq!(open_channel(&fifo, 1), 1);
    }
}
