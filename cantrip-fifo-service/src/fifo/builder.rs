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

//! Runlist construction.
//!
//! A runlist is a sequence of TSG headers, each followed by the entries of
//! the TSG's active channels. Construction happens in two passes: first a
//! plan (the order TSGs appear in) is computed from the active TSGs and
//! their interleave levels, then the plan is written out entry by entry.
//!
//! Flat runlists list every HIGH TSG, then MEDIUM, then LOW. Interleaved
//! runlists give higher levels proportionally more slots: every MEDIUM
//! TSG is preceded by all HIGH TSGs, and every LOW TSG by the full MEDIUM
//! sequence followed by all HIGH TSGs. With no LOW TSGs the MEDIUM sequence
//! is used once; with no MEDIUM TSGs either, the HIGH TSGs once.

use super::bitmap::ActiveBitmap;
use super::buffer::{RunlistCursor, RunlistFull};
use super::channel::Channel;
use super::tsg::Tsg;
use cantrip_fifo_interface::*;
#[cfg(feature = "TRACE_OPS")]
use log::trace;
use smallvec::SmallVec;

/// Order in which TSGs are written to a runlist; a TSG may repeat.
pub type RunlistPlan = SmallVec<[TsgId; 16]>;

/// Plans a flat runlist from (tsgid, level) pairs given in tsgid order.
pub fn flat_plan(
    tsgs: &[(TsgId, InterleaveLevel)],
    capacity: usize,
) -> Result<RunlistPlan, RunlistFull> {
    if tsgs.len() > capacity {
        return Err(RunlistFull);
    }
    let mut plan = RunlistPlan::new();
    for level in InterleaveLevel::HIGH_TO_LOW {
        plan.extend(
            tsgs.iter()
                .filter(|(_, l)| *l == level)
                .map(|(tsgid, _)| *tsgid),
        );
    }
    Ok(plan)
}

/// Plans an interleaved runlist from (tsgid, level) pairs given in tsgid
/// order. Each planned TSG needs at least one entry so a plan longer than
/// |capacity| can never be written; expansion stops there.
pub fn interleaved_plan(
    tsgs: &[(TsgId, InterleaveLevel)],
    capacity: usize,
) -> Result<RunlistPlan, RunlistFull> {
    // Sequence contributed by each level, indexed by level.
    let mut seqs: [RunlistPlan; InterleaveLevel::NUM_LEVELS] = Default::default();
    for level in InterleaveLevel::HIGH_TO_LOW {
        let mut prefix = RunlistPlan::new();
        for higher in (level as usize + 1)..InterleaveLevel::NUM_LEVELS {
            prefix.extend_from_slice(&seqs[higher]);
        }
        let mut seq = RunlistPlan::new();
        for (tsgid, _) in tsgs.iter().filter(|(_, l)| *l == level) {
            if seq.len() + prefix.len() + 1 > capacity {
                return Err(RunlistFull);
            }
            seq.extend_from_slice(&prefix);
            seq.push(*tsgid);
        }
        seqs[level as usize] = seq;
    }
    // LOW, falling back to MEDIUM then HIGH when a level is empty.
    let first_nonempty = [InterleaveLevel::Low, InterleaveLevel::Medium, InterleaveLevel::High]
        .into_iter()
        .find(|level| !seqs[*level as usize].is_empty());
    Ok(match first_nonempty {
        Some(level) => core::mem::take(&mut seqs[level as usize]),
        None => RunlistPlan::new(),
    })
}

/// Writes runlist entries for the active TSGs of one runlist.
pub struct RunlistBuilder<'a> {
    hw: &'a dyn HardwareFifo,
    tsgs: &'a [Tsg],
    channels: &'a [Channel],
    active_tsgs: &'a ActiveBitmap,
    active_channels: &'a ActiveBitmap,
    default_timeslice_us: u32,
    scale10x: u32,
}
impl<'a> RunlistBuilder<'a> {
    pub fn new(
        hw: &'a dyn HardwareFifo,
        tsgs: &'a [Tsg],
        channels: &'a [Channel],
        active_tsgs: &'a ActiveBitmap,
        active_channels: &'a ActiveBitmap,
        default_timeslice_us: u32,
        scale10x: u32,
    ) -> Self {
        RunlistBuilder {
            hw,
            tsgs,
            channels,
            active_tsgs,
            active_channels,
            default_timeslice_us,
            scale10x,
        }
    }

    fn active_levels(&self) -> SmallVec<[(TsgId, InterleaveLevel); 16]> {
        self.active_tsgs
            .iter_ones()
            .map(|tsgid| (tsgid, self.tsgs[tsgid as usize].interleave_level()))
            .collect()
    }

    pub fn plan(&self, interleave: bool, capacity: usize) -> Result<RunlistPlan, RunlistFull> {
        let levels = self.active_levels();
        if interleave {
            interleaved_plan(&levels, capacity)
        } else {
            flat_plan(&levels, capacity)
        }
    }

    /// Fills |cursor| and returns the number of entries written.
    pub fn construct(
        &self,
        cursor: &mut RunlistCursor,
        interleave: bool,
    ) -> Result<usize, RunlistFull> {
        let plan = self.plan(interleave, cursor.remaining())?;
        let mut count: usize = 0;
        for tsgid in plan {
            count += self.append_tsg(cursor, tsgid)?;
        }
        assert_eq!(count, cursor.count(), "runlist entry count mismatch");
        Ok(count)
    }

    // Writes the TSG header followed by its active channels.
    fn append_tsg(&self, cursor: &mut RunlistCursor, tsgid: TsgId) -> Result<usize, RunlistFull> {
        let tsg = &self.tsgs[tsgid as usize];
        let timeslice = scale_ptimer(tsg.timeslice_us(self.default_timeslice_us), self.scale10x);
        let ch_list = tsg.ch_list.read();
        let members: SmallVec<[ChannelId; 8]> = ch_list
            .iter()
            .copied()
            .filter(|chid| self.active_channels.is_set(*chid))
            .collect();

        let header = TsgHeaderDesc {
            tsgid,
            num_channels: members.len() as u32,
            timeslice,
        };
        #[cfg(feature = "TRACE_OPS")]
        trace!("runlist tsg {} channels {} timeslice {}", tsgid, members.len(), timeslice);
        self.hw.write_tsg_header(&header, cursor.next_slot()?);

        for chid in members.iter() {
            let desc = self.channels[*chid as usize].entry_desc();
            #[cfg(feature = "TRACE_OPS")]
            trace!("runlist   ch {} subctx {}", desc.chid, desc.subctx_id);
            self.hw.write_channel_entry(&desc, cursor.next_slot()?);
        }
        Ok(1 + members.len())
    }
}
