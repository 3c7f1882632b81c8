// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Runtime-filter partial-result merger.
//!
//! Responsibilities:
//! - Rendezvous for the N build drivers of one partitioned join build node.
//! - Merges partial IN-filters into one sound union, or drops them when any
//!   partition's enumeration is incomplete.
//! - Constructs and fills total bloom filters sized to the whole build side.
//!
//! Key exported interfaces:
//! - Types: `PartialRuntimeFilterMerger`.
//!
//! Current limitations:
//! - Partial lists must be positionally aligned across builders; the
//!   builder boundary (`LocalInFilterSet`) guarantees this.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::bloom::RuntimeBloomFilter;
use super::{BloomFilterBuildDescriptor, BloomFilterBuildParam};
use crate::common::config;
use crate::exec::expr::InFilterContext;
use crate::flintrocks_logging::{debug, warn};

/// Merges the runtime in-filters and bloom filters generated by the build
/// drivers of one join node. When the build side is partitioned by a local
/// exchange, each driver builds a hash table over one partition and its
/// partial filters are unsound against the unpartitioned probe stream; they
/// only take effect after the last-arriving driver merges them into a total
/// filter set.
///
/// Each driver writes exclusively to its own slot and then decrements the
/// active-builder counter; the slot-lock release together with the `AcqRel`
/// decrement makes every slot write visible to the driver that observes the
/// counter reach zero, and only that driver reads the slots.
pub struct PartialRuntimeFilterMerger {
    in_filter_max_conditions: usize,
    bloom_row_limit: usize,
    num_builders: usize,
    active_builders: AtomicUsize,
    slots: Vec<Mutex<BuilderSlot>>,
    bloom_descriptors: Mutex<Vec<Arc<BloomFilterBuildDescriptor>>>,
    total_in_filters: Mutex<Vec<InFilterContext>>,
}

#[derive(Default)]
struct BuilderSlot {
    filled: bool,
    ht_row_count: usize,
    in_filters: Vec<Option<InFilterContext>>,
    bloom_params: Vec<BloomFilterBuildParam>,
}

impl PartialRuntimeFilterMerger {
    pub fn new(num_builders: usize, in_filter_max_conditions: usize, bloom_row_limit: usize) -> Self {
        let num_builders = num_builders.max(1);
        let slots = (0..num_builders)
            .map(|_| Mutex::new(BuilderSlot::default()))
            .collect();
        Self {
            in_filter_max_conditions,
            bloom_row_limit,
            num_builders,
            active_builders: AtomicUsize::new(num_builders),
            slots,
            bloom_descriptors: Mutex::new(Vec::new()),
            total_in_filters: Mutex::new(Vec::new()),
        }
    }

    /// Limits taken from the application config, the way the pipeline
    /// builder wires mergers for join build nodes.
    pub fn with_config_limits(num_builders: usize) -> Self {
        Self::new(
            num_builders,
            config::runtime_in_filter_max_conditions(),
            config::runtime_bloom_filter_row_limit(),
        )
    }

    pub fn num_builders(&self) -> usize {
        self.num_builders
    }

    /// Post a build driver's partial filters. Returns `Ok(true)` on exactly
    /// the call that completes the rendezvous; that caller runs the merge and
    /// must publish the totals. Every `idx` may be posted at most once.
    ///
    /// An IN-filter merge failure is returned to the last builder and leaves
    /// the totals unpublished; consumers then never observe a ready holder,
    /// which is the defined "no filter available" state.
    pub fn add_partial_filters(
        &self,
        idx: usize,
        ht_row_count: usize,
        in_filters: Vec<Option<InFilterContext>>,
        bloom_params: Vec<BloomFilterBuildParam>,
        bloom_descriptors: Vec<Arc<BloomFilterBuildDescriptor>>,
    ) -> Result<bool, String> {
        let Some(slot) = self.slots.get(idx) else {
            return Err(format!(
                "runtime filter builder index out of range: idx={} builders={}",
                idx, self.num_builders
            ));
        };
        {
            let mut guard = slot.lock().expect("runtime filter merger slot lock");
            if guard.filled {
                return Err(format!(
                    "runtime filter builder slot posted twice: idx={}",
                    idx
                ));
            }
            guard.filled = true;
            guard.ht_row_count = ht_row_count;
            guard.in_filters = in_filters;
            guard.bloom_params = bloom_params;
        }
        if self.active_builders.fetch_sub(1, Ordering::AcqRel) != 1 {
            return Ok(false);
        }

        // Last arriver: every slot write happens-before this point.
        // The descriptors are identical across builders, any copy suffices.
        let mut slots = self.drain_slots();
        let total_in_filters = self.merge_in_filters(&mut slots)?;
        self.merge_bloom_filters(&slots, &bloom_descriptors);
        debug!(
            "runtime filter merge complete: builders={} total_in_filters={} bloom_descriptors={}",
            self.num_builders,
            total_in_filters.len(),
            bloom_descriptors.len()
        );
        *self
            .total_in_filters
            .lock()
            .expect("runtime filter merger lock") = total_in_filters;
        *self
            .bloom_descriptors
            .lock()
            .expect("runtime filter merger lock") = bloom_descriptors;
        Ok(true)
    }

    /// The merged IN-filter list; empty when merging was abandoned. Drains.
    pub fn get_total_in_filters(&self) -> Vec<InFilterContext> {
        std::mem::take(
            &mut *self
                .total_in_filters
                .lock()
                .expect("runtime filter merger lock"),
        )
    }

    pub fn get_total_bloom_filters(&self) -> Vec<Arc<BloomFilterBuildDescriptor>> {
        self.bloom_descriptors
            .lock()
            .expect("runtime filter merger lock")
            .clone()
    }

    fn drain_slots(&self) -> Vec<BuilderSlot> {
        self.slots
            .iter()
            .map(|slot| {
                std::mem::take(&mut *slot.lock().expect("runtime filter merger slot lock"))
            })
            .collect()
    }

    /// Union the partial IN-filter lists, or abandon them.
    ///
    /// A builder over an empty hash table legitimately contributes an empty
    /// list and is skipped. A builder over a non-empty hash table that still
    /// contributed an empty list exceeded the IN-filter threshold, and its
    /// missing keys would make the union unsound, so the whole list is
    /// dropped. Publishing no IN-filter is always sound.
    fn merge_in_filters(
        &self,
        slots: &mut [BuilderSlot],
    ) -> Result<Vec<InFilterContext>, String> {
        let mut can_merge = true;
        let mut num_rows = 0usize;
        let mut retained: Vec<Vec<Option<InFilterContext>>> = Vec::new();
        for slot in slots.iter_mut() {
            // An empty in-filter list from an empty hash table is benign.
            if slot.ht_row_count == 0 {
                continue;
            }
            if slot.in_filters.is_empty() {
                can_merge = false;
                break;
            }
            num_rows = num_rows.max(slot.ht_row_count);
            retained.push(std::mem::take(&mut slot.in_filters));
        }

        if !can_merge || num_rows > self.in_filter_max_conditions || retained.is_empty() {
            debug!(
                "runtime in-filter merge abandoned: can_merge={} num_rows={} limit={} retained={}",
                can_merge,
                num_rows,
                self.in_filter_max_conditions,
                retained.len()
            );
            return Ok(Vec::new());
        }

        let mut retained = retained.into_iter();
        let mut total = retained.next().expect("retained in-filter list");
        for in_filters in retained {
            if in_filters.len() != total.len() {
                return Err(format!(
                    "runtime in-filter arity mismatch across builders: {} vs {}",
                    total.len(),
                    in_filters.len()
                ));
            }
            for (merged, partial) in total.iter_mut().zip(in_filters.iter()) {
                match (merged.as_mut(), partial.as_ref()) {
                    (Some(merged), Some(partial)) => {
                        merged.root_mut().merge(partial.root())?;
                    }
                    // A hole on either side poisons the position for all
                    // builders.
                    _ => *merged = None,
                }
            }
        }
        Ok(total.into_iter().flatten().collect())
    }

    /// Construct total bloom filters sized to the whole build side and fill
    /// them from every builder's captured key columns. Best-effort: a fill
    /// failure abandons that descriptor's filter and nothing else.
    fn merge_bloom_filters(
        &self,
        slots: &[BuilderSlot],
        descriptors: &[Arc<BloomFilterBuildDescriptor>],
    ) {
        let row_count: usize = slots.iter().map(|slot| slot.ht_row_count).sum();
        for desc in descriptors {
            desc.set_is_pipeline(true);
            if !desc.has_consumer() {
                continue;
            }
            // Oversized filters are only worth their memory when the network
            // saving of a remote consumer is in play.
            if !desc.has_remote_targets() && row_count > self.bloom_row_limit {
                continue;
            }
            let Some(mut filter) = RuntimeBloomFilter::create(desc.build_expr_type()) else {
                debug!(
                    "skip runtime bloom filter: filter_id={} unsupported build type {:?}",
                    desc.filter_id(),
                    desc.build_expr_type()
                );
                continue;
            };
            filter.init(row_count);
            filter.set_join_mode(desc.join_mode());
            desc.install_filter(filter);
        }

        for slot in slots {
            for (desc, param) in descriptors.iter().zip(slot.bloom_params.iter()) {
                if let Err(e) = desc.fill_from_param(param) {
                    warn!(
                        "runtime bloom filter fill failed: filter_id={} err={}",
                        desc.filter_id(),
                        e
                    );
                    desc.clear_filter();
                }
            }
        }
    }
}
