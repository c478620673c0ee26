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

//! Interfaces shared between the GPU FIFO scheduler and the hardware,
//! memory and recovery components it drives.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::boxed::Box;
use core::fmt;
use num_enum::{FromPrimitive, IntoPrimitive, TryFromPrimitive};

pub type ChannelId = u32;
pub type TsgId = u32;
pub type RunlistId = u32;
/// One bit per runlist id.
pub type RunlistMask = u32;
/// One bit per engine (or PBDMA) id.
pub type EngineMask = u32;
/// Token handed out by the hardware scheduling mutex.
pub type MutexToken = u32;

/// Runlists are addressed through a RunlistMask so there can be at most 32.
pub const MAX_RUNLISTS: usize = RunlistMask::BITS as usize;
/// Each runlist is double buffered.
pub const MAX_RUNLIST_BUFFERS: usize = 2;

// Timeslice bounds, in microseconds.
pub const TSG_TIMESLICE_LOW_PRIORITY_US: u32 = 1300;
pub const TSG_TIMESLICE_MEDIUM_PRIORITY_US: u32 = 2600;
pub const TSG_TIMESLICE_HIGH_PRIORITY_US: u32 = 5200;
pub const TSG_TIMESLICE_MIN_US: u32 = 1000;
pub const TSG_TIMESLICE_MAX_US: u32 = 50000;
pub const TSG_TIMESLICE_DEFAULT_US: u32 = 128 << 3;

pub const DEFAULT_NUM_CHANNELS: usize = 512;
pub const DEFAULT_CTXSW_TIMEOUT_PERIOD_MS: u32 = 100;
pub const DEFAULT_CTXSW_TIMEOUT_MAX_MS: u32 = 3000;

/// Reference frequency of the GPU timer that timeslices are expressed in.
pub const PTIMER_REF_FREQ_HZ: u32 = 31_250_000;

/// Returns 10x the ratio between the reference timer frequency and the
/// actual timer source frequency.
pub fn ptimer_scalingfactor10x(ptimer_src_freq: u32) -> u32 {
    assert!(ptimer_src_freq != 0, "ptimer source frequency not set");
    ((PTIMER_REF_FREQ_HZ as u64 * 10) / ptimer_src_freq as u64) as u32
}

/// Converts |timeout| (in reference timer units) to the timer source domain.
/// The result is truncated.
pub fn scale_ptimer(timeout: u32, scale10x: u32) -> u32 {
    assert!(scale10x != 0, "ptimer scaling factor is zero");
    let scaled = (timeout as u64 * 10) / scale10x as u64;
    assert!(scaled <= u32::MAX as u64, "scaled timeslice overflow");
    scaled as u32
}

/// Runlist interleave levels. Higher levels are re-inserted before each
/// lower level entry when the runlist is interleaved.
#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, TryFromPrimitive, IntoPrimitive)]
pub enum InterleaveLevel {
    Low = 0,
    Medium = 1,
    High = 2,
}
impl InterleaveLevel {
    pub const NUM_LEVELS: usize = 3;
    /// All levels, highest first.
    pub const HIGH_TO_LOW: [InterleaveLevel; InterleaveLevel::NUM_LEVELS] = [
        InterleaveLevel::High,
        InterleaveLevel::Medium,
        InterleaveLevel::Low,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            InterleaveLevel::Low => "LOW",
            InterleaveLevel::Medium => "MEDIUM",
            InterleaveLevel::High => "HIGH",
        }
    }
}
impl fmt::Display for InterleaveLevel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result { f.write_str(self.name()) }
}

/// Return codes from FifoService api's.
#[repr(usize)]
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, FromPrimitive, IntoPrimitive)]
pub enum FifoError {
    Success = 0,
    InvalidArgument,
    TooLarge, // Runlist construction ran out of entries
    Timeout,
    Interrupted,
    NoMemory,
    NoTsgAvailable,
    NoChannelAvailable,
    Busy,
    UnbindHwState, // Channel still has hardware state pending
    PreemptFailed,
    HardwareError,
    #[default]
    UnknownError,
}
impl From<FifoError> for Result<(), FifoError> {
    fn from(err: FifoError) -> Result<(), FifoError> {
        if err == FifoError::Success {
            Ok(())
        } else {
            Err(err)
        }
    }
}

/// Outcome of a successful runlist update.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum UpdateStatus {
    /// A new runlist was constructed and submitted.
    Updated,
    /// The channel was already in the requested state; nothing submitted.
    NoChange,
}

/// Result of waiting for the hardware to pick up a submitted runlist.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AckStatus {
    Acked,
    TimedOut,
    Interrupted,
}

/// Channel status bits consulted when a channel leaves its TSG.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct ChannelHwState {
    pub next: bool,
    pub ctx_reload: bool,
    pub busy: bool,
}

/// Error codes reported to channel owners.
#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum ErrorNotifier {
    FifoErrorIdleTimeout = 8,
    GrErrorSwNotify = 13,
    FifoErrorMmuErrFlt = 31,
    PbdmaError = 32,
    ResetChannelVerifError = 43,
    PbdmaPushbufferCrcMismatch = 80,
}

/// Events a client may wait on per TSG.
#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum TsgEvent {
    BptInt = 0,
    BptPause = 1,
    BlockingSync = 2,
    CilpPreemptionStarted = 3,
    CilpPreemptionComplete = 4,
    GrSemaphoreWriteAwaken = 5,
}

/// Per-SM error state captured for a TSG.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct SmErrorState {
    pub hww_global_esr: u32,
    pub hww_warp_esr: u32,
    pub hww_warp_esr_pc: u64,
    pub hww_global_esr_report_mask: u32,
    pub hww_warp_esr_report_mask: u32,
}

/// Contents of a TSG header runlist entry.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct TsgHeaderDesc {
    pub tsgid: TsgId,
    /// Number of channel entries that follow the header.
    pub num_channels: u32,
    /// Timeslice already scaled to the timer source domain.
    pub timeslice: u32,
}

/// Contents of a channel runlist entry.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ChannelEntryDesc {
    pub chid: ChannelId,
    pub runlist_id: RunlistId,
    pub subctx_id: u32,
    pub inst_ptr: u64,
}

/// DMA-visible memory used to back a runlist buffer.
#[derive(Debug)]
pub struct DmaBuffer {
    /// Address the GPU uses to fetch the buffer.
    pub iova: u64,
    /// CPU view of the buffer.
    pub mem: Box<[u8]>,
}
impl DmaBuffer {
    pub fn size(&self) -> usize { self.mem.len() }
}

/// Low-level runlist and channel control. Implemented by the chip
/// specific code and injected at setup.
pub trait HardwareFifo {
    // Constants queried once at setup.
    fn entry_size(&self) -> usize;
    fn max_runlists(&self) -> usize;
    fn max_entries_per_runlist(&self) -> usize;
    fn ptimer_src_freq(&self) -> u32;
    // Number of SM's; sizes the per-TSG error state.
    fn num_sm(&self) -> usize;

    // Runlist entry formatting. |entry| is exactly entry_size() bytes.
    fn write_tsg_header(&self, desc: &TsgHeaderDesc, entry: &mut [u8]);
    fn write_channel_entry(&self, desc: &ChannelEntryDesc, entry: &mut [u8]);

    // Points the front end at a new runlist.
    fn submit(&self, runlist_id: RunlistId, iova: u64, count: usize, buffer_index: usize);
    // Blocks until the front end has picked up the last submit.
    fn wait_for_ack(&self, runlist_id: RunlistId) -> AckStatus;
    fn set_runlist_enabled_mask(&self, mask: RunlistMask, enabled: bool);

    // Mutex shared with other masters of the scheduling hardware.
    fn sched_mutex_acquire(&self) -> Result<MutexToken, FifoError>;
    fn sched_mutex_release(&self, token: MutexToken) -> Result<(), FifoError>;

    fn enable_channel(&self, chid: ChannelId);
    fn disable_channel(&self, chid: ChannelId);
    fn channel_hw_state(&self, chid: ChannelId) -> ChannelHwState;
    // Current GP_GET pointer; used to detect forward progress.
    fn channel_gp_get(&self, chid: ChannelId) -> u32;
    fn force_ctx_reload(&self, chid: ChannelId);

    fn preempt_tsg(&self, runlist_id: RunlistId, tsgid: TsgId) -> Result<(), FifoError>;
    // Chip specific part of removing |chid| from |tsgid|.
    fn tsg_unbind_channel(&self, tsgid: TsgId, chid: ChannelId) -> Result<(), FifoError>;
}

/// Provider of DMA memory for runlist buffers.
pub trait DmaAllocator {
    fn alloc(&self, size: usize) -> Result<DmaBuffer, FifoError>;
    fn free(&self, buf: DmaBuffer);
}

/// Engine and PBDMA topology, by runlist.
pub trait EngineInfo {
    fn runlist_engine_mask(&self, runlist_id: RunlistId) -> EngineMask;
    fn runlist_pbdma_mask(&self, runlist_id: RunlistId) -> EngineMask;
}

/// Hooks into the system recovery path. None of these are called with a
/// runlist lock held; channel_abort_clean_up is called while the TSG's
/// channel list is read-locked and must not bind or unbind channels.
pub trait RecoveryHandler {
    fn runlist_update_timeout(&self, runlist_id: RunlistId);
    fn tsg_ctxsw_timeout(&self, tsgid: TsgId, accumulated_ms: u32);
    fn channel_abort_clean_up(&self, chid: ChannelId);
}

/// Scheduler tunables.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FifoConfig {
    pub num_channels: usize,
    pub num_tsgs: usize,
    // Interleave runlist entries by priority level; otherwise runlists
    // are flat (grouped by level, high first).
    pub runlist_interleave: bool,
    pub default_timeslice_us: u32,
    pub min_timeslice_us: u32,
    pub max_timeslice_us: u32,
    // How often the ctxsw watchdog runs; added to each idle channel's
    // accumulated timeout.
    pub ctxsw_timeout_period_ms: u32,
    pub ctxsw_timeout_max_ms: u32,
    pub timeouts_enabled: bool,
}
impl Default for FifoConfig {
    fn default() -> Self {
        FifoConfig {
            num_channels: DEFAULT_NUM_CHANNELS,
            num_tsgs: DEFAULT_NUM_CHANNELS,
            runlist_interleave: true,
            default_timeslice_us: TSG_TIMESLICE_DEFAULT_US,
            min_timeslice_us: TSG_TIMESLICE_MIN_US,
            max_timeslice_us: TSG_TIMESLICE_MAX_US,
            ctxsw_timeout_period_ms: DEFAULT_CTXSW_TIMEOUT_PERIOD_MS,
            ctxsw_timeout_max_ms: DEFAULT_CTXSW_TIMEOUT_MAX_MS,
            timeouts_enabled: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ptimer_scaling_truncates() {
        assert_eq!(scale_ptimer(100, 20), 50);
        assert_eq!(scale_ptimer(111, 20), 55);
        assert_eq!(scale_ptimer(10, 6), 16);
        assert_eq!(scale_ptimer(0, u32::MAX), 0);
        assert_eq!(scale_ptimer(100, 1), 1000);
    }

    #[test]
    fn test_ptimer_scalingfactor() {
        assert_eq!(ptimer_scalingfactor10x(PTIMER_REF_FREQ_HZ), 10);
        assert_eq!(ptimer_scalingfactor10x(100), PTIMER_REF_FREQ_HZ * 10 / 100);
        assert_eq!(ptimer_scalingfactor10x(97), PTIMER_REF_FREQ_HZ * 10 / 97);
        // Reference clock: timeslices pass through unchanged.
        let scale = ptimer_scalingfactor10x(PTIMER_REF_FREQ_HZ);
        assert_eq!(scale_ptimer(TSG_TIMESLICE_DEFAULT_US, scale), 1024);
    }

    #[test]
    #[should_panic]
    fn test_ptimer_scaling_overflow() { scale_ptimer(u32::MAX, 1); }

    #[test]
    fn test_interleave_level_conversion() {
        assert_eq!(InterleaveLevel::try_from(0u32).ok(), Some(InterleaveLevel::Low));
        assert_eq!(InterleaveLevel::try_from(2u32).ok(), Some(InterleaveLevel::High));
        assert!(InterleaveLevel::try_from(3u32).is_err());
        assert!(InterleaveLevel::High > InterleaveLevel::Medium);
        assert_eq!(InterleaveLevel::Medium.name(), "MEDIUM");
        assert_eq!(u32::from(InterleaveLevel::Medium), 1);
    }

    #[test]
    fn test_fifo_error_result() {
        assert_eq!(Result::<(), FifoError>::from(FifoError::Success), Ok(()));
        assert_eq!(
            Result::<(), FifoError>::from(FifoError::TooLarge),
            Err(FifoError::TooLarge)
        );
        assert_eq!(FifoError::from(1usize), FifoError::InvalidArgument);
        assert_eq!(FifoError::from(999usize), FifoError::UnknownError);
    }
}
