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

//! Lock helpers for the runlist controller.

use super::runlist::{Runlist, RunlistInner};
use cantrip_fifo_interface::{HardwareFifo, MutexToken, RunlistId};
use log::warn;
use smallvec::SmallVec;
use spin::MutexGuard;

/// Holds several runlist locks at once. Locks are always taken in
/// ascending runlist id order and released in the reverse order.
pub struct RunlistLockAll<'a> {
    guards: SmallVec<[(RunlistId, MutexGuard<'a, RunlistInner>); 4]>,
}
impl<'a> RunlistLockAll<'a> {
    pub fn lock<I>(runlists: I) -> Self
    where
        I: IntoIterator<Item = &'a Runlist>,
    {
        let mut sorted: SmallVec<[&'a Runlist; 4]> = runlists.into_iter().collect();
        sorted.sort_unstable_by_key(|runlist| runlist.id);
        sorted.dedup_by_key(|runlist| runlist.id);
        RunlistLockAll {
            guards: sorted
                .into_iter()
                .map(|runlist| (runlist.id, runlist.inner.lock()))
                .collect(),
        }
    }

    pub fn len(&self) -> usize { self.guards.len() }
    pub fn is_empty(&self) -> bool { self.guards.is_empty() }
    pub fn ids(&self) -> impl Iterator<Item = RunlistId> + '_ {
        self.guards.iter().map(|(id, _)| *id)
    }

    pub fn get_mut(&mut self, runlist_id: RunlistId) -> Option<&mut RunlistInner> {
        self.guards
            .iter_mut()
            .find(|(id, _)| *id == runlist_id)
            .map(|(_, guard)| &mut **guard)
    }
}
impl Drop for RunlistLockAll<'_> {
    fn drop(&mut self) {
        while let Some((_id, guard)) = self.guards.pop() {
            drop(guard);
        }
    }
}

/// The scheduling mutex shared with other masters of the runlist
/// hardware. Failures to take or return it are logged and otherwise
/// ignored; the runlist lock still serializes this driver's updates.
pub struct SchedMutexGuard<'a> {
    hw: &'a dyn HardwareFifo,
    token: Option<MutexToken>,
}
impl<'a> SchedMutexGuard<'a> {
    pub fn acquire(hw: &'a dyn HardwareFifo) -> Self {
        let token = match hw.sched_mutex_acquire() {
            Ok(token) => Some(token),
            Err(e) => {
                warn!("sched mutex acquire failed: {:?}", e);
                None
            }
        };
        SchedMutexGuard { hw, token }
    }

    pub fn is_held(&self) -> bool { self.token.is_some() }
}
impl Drop for SchedMutexGuard<'_> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            if let Err(e) = self.hw.sched_mutex_release(token) {
                warn!("sched mutex release failed: {:?}", e);
            }
        }
    }
}
