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
//! Probe-side runtime filter collection.
//!
//! Responsibilities:
//! - Registers the bloom filters a probe operator waits for and applies the
//!   installed ones to probe chunks.
//! - Wraps the collector in a split refcount so the sibling operator
//!   factories decomposed from one plan node share exactly-once
//!   prepare/open and close.
//!
//! Key exported interfaces:
//! - Types: `RowDescriptor`, `RuntimeFilterProbeDescriptor`,
//!   `RuntimeFilterProbeCollector`, `RefCountedRuntimeFilterProbeCollector`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::{BloomFilterBuildDescriptor, RuntimeBloomFilter};
use crate::common::ids::{SlotId, TupleId};
use crate::exec::chunk::Chunk;
use crate::flintrocks_logging::debug;
use crate::runtime::profile::{CounterUnit, RuntimeProfile};
use crate::runtime::runtime_state::RuntimeState;

/// Tuple layouts visible to one operator's input rows.
#[derive(Clone, Debug, Default)]
pub struct RowDescriptor {
    tuple_ids: Vec<TupleId>,
}

impl RowDescriptor {
    pub fn new(tuple_ids: Vec<TupleId>) -> Self {
        Self { tuple_ids }
    }

    pub fn tuple_ids(&self) -> &[TupleId] {
        &self.tuple_ids
    }
}

/// One runtime filter a probe operator consumes: identity of the filter plus
/// the probe column it applies to. The filter slot is populated once the
/// producing node's merged filter becomes visible.
#[derive(Debug)]
pub struct RuntimeFilterProbeDescriptor {
    filter_id: i32,
    probe_tuple_id: TupleId,
    probe_slot_id: SlotId,
    filter: Mutex<Option<Arc<RuntimeBloomFilter>>>,
}

impl RuntimeFilterProbeDescriptor {
    pub fn new(filter_id: i32, probe_tuple_id: TupleId, probe_slot_id: SlotId) -> Self {
        Self {
            filter_id,
            probe_tuple_id,
            probe_slot_id,
            filter: Mutex::new(None),
        }
    }

    pub fn filter_id(&self) -> i32 {
        self.filter_id
    }

    pub fn probe_tuple_id(&self) -> TupleId {
        self.probe_tuple_id
    }

    pub fn probe_slot_id(&self) -> SlotId {
        self.probe_slot_id
    }

    pub fn install(&self, filter: Arc<RuntimeBloomFilter>) {
        let mut guard = self.filter.lock().expect("runtime filter probe lock");
        *guard = Some(filter);
    }

    pub fn installed_filter(&self) -> Option<Arc<RuntimeBloomFilter>> {
        self.filter
            .lock()
            .expect("runtime filter probe lock")
            .clone()
    }
}

/// Registry of the runtime filters one consumer plan node waits for.
///
/// The collector is shared between sibling operator factories through
/// [`RefCountedRuntimeFilterProbeCollector`], so every method takes `&self`
/// and lifecycle transitions are one-shot.
#[derive(Debug, Default)]
pub struct RuntimeFilterProbeCollector {
    descriptors: Mutex<HashMap<i32, Arc<RuntimeFilterProbeDescriptor>>>,
    prepared_times: AtomicUsize,
    opened_times: AtomicUsize,
    closed_times: AtomicUsize,
    profile: Mutex<Option<RuntimeProfile>>,
}

impl RuntimeFilterProbeCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_descriptor(&self, descriptor: RuntimeFilterProbeDescriptor) {
        let mut guard = self.descriptors.lock().expect("runtime filter probe lock");
        guard.insert(descriptor.filter_id(), Arc::new(descriptor));
    }

    pub fn descriptors(&self) -> Vec<Arc<RuntimeFilterProbeDescriptor>> {
        let guard = self.descriptors.lock().expect("runtime filter probe lock");
        guard.values().cloned().collect()
    }

    pub fn prepare(
        &self,
        state: &RuntimeState,
        row_desc: &RowDescriptor,
        profile: &RuntimeProfile,
    ) -> Result<(), String> {
        {
            let guard = self.descriptors.lock().expect("runtime filter probe lock");
            for descriptor in guard.values() {
                if !row_desc.tuple_ids().contains(&descriptor.probe_tuple_id()) {
                    return Err(format!(
                        "runtime filter probe descriptor not bound to row descriptor: filter_id={} tuple_id={}",
                        descriptor.filter_id(),
                        descriptor.probe_tuple_id()
                    ));
                }
            }
        }
        profile.add_counter("RuntimeMembershipFilters", CounterUnit::Unit);
        profile.add_counter("RuntimeFilterRowsFiltered", CounterUnit::Unit);
        *self.profile.lock().expect("runtime filter probe lock") = Some(profile.clone());
        self.prepared_times.fetch_add(1, Ordering::AcqRel);
        debug!(
            "runtime filter probe collector prepared: query_id={:?} descriptors={}",
            state.query_id(),
            self.descriptors
                .lock()
                .expect("runtime filter probe lock")
                .len()
        );
        Ok(())
    }

    pub fn open(&self, _state: &RuntimeState) -> Result<(), String> {
        self.opened_times.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    pub fn close(&self, state: &RuntimeState) {
        self.closed_times.fetch_add(1, Ordering::AcqRel);
        debug!(
            "runtime filter probe collector closed: query_id={:?}",
            state.query_id()
        );
    }

    /// Install the merged bloom filters published by a producing node.
    pub fn update_filters(&self, build_descriptors: &[Arc<BloomFilterBuildDescriptor>]) {
        let guard = self.descriptors.lock().expect("runtime filter probe lock");
        let mut installed = 0i64;
        for build_desc in build_descriptors {
            let Some(probe_desc) = guard.get(&build_desc.filter_id()) else {
                continue;
            };
            let Some(filter) = build_desc.filter() else {
                continue;
            };
            probe_desc.install(Arc::new(filter));
            installed += 1;
        }
        if installed > 0 {
            if let Some(profile) = self.profile.lock().expect("runtime filter probe lock").as_ref()
            {
                profile.counter_add("RuntimeMembershipFilters", CounterUnit::Unit, installed);
            }
        }
    }

    /// Apply every installed filter to `chunk`. Filters whose probe column is
    /// absent from the chunk are skipped.
    pub fn evaluate(&self, chunk: Chunk) -> Result<Option<Chunk>, String> {
        if chunk.is_empty() {
            return Ok(Some(chunk));
        }
        let descriptors = self.descriptors();
        let mut keep = vec![true; chunk.len()];
        let mut applied = false;
        for descriptor in descriptors {
            let Some(filter) = descriptor.installed_filter() else {
                continue;
            };
            let Ok(column) = chunk.column_by_slot_id(descriptor.probe_slot_id()) else {
                continue;
            };
            filter.might_contain_array(&column, &mut keep)?;
            applied = true;
        }
        if !applied {
            return Ok(Some(chunk));
        }
        let filtered = keep.iter().filter(|v| !**v).count() as i64;
        if filtered > 0 {
            if let Some(profile) = self.profile.lock().expect("runtime filter probe lock").as_ref()
            {
                profile.counter_add("RuntimeFilterRowsFiltered", CounterUnit::Unit, filtered);
            }
        }
        chunk.filter_by_mask(&keep)
    }

    pub fn prepared_times(&self) -> usize {
        self.prepared_times.load(Ordering::Acquire)
    }

    pub fn opened_times(&self) -> usize {
        self.opened_times.load(Ordering::Acquire)
    }

    pub fn closed_times(&self) -> usize {
        self.closed_times.load(Ordering::Acquire)
    }
}

/// A plan node decomposes into more than one operator factory, and the
/// pipeline framework does not know which of them the runtime filters take
/// effect on. Every factory from the same node therefore shares one probe
/// collector through this wrapper, whose refcount guarantees the wrapped
/// prepare+open and close each run exactly once.
///
/// The low 32 bits count remaining prepares and the high 32 bits remaining
/// closes, both starting at the number of sibling factories. The close
/// arithmetic relies on the pipeline's guarantee that every operator that
/// will ever prepare has prepared before the first close; the wrapper does
/// not verify that precondition.
pub struct RefCountedRuntimeFilterProbeCollector {
    count: AtomicU64,
    num_operators_generated: u64,
    collector: RuntimeFilterProbeCollector,
}

impl RefCountedRuntimeFilterProbeCollector {
    pub fn new(num_operators_generated: usize, collector: RuntimeFilterProbeCollector) -> Self {
        let n = num_operators_generated as u64;
        Self {
            count: AtomicU64::new((n << 32) | n),
            num_operators_generated: n,
            collector,
        }
    }

    /// First caller runs the wrapped prepare then open, propagating the
    /// first failure; later callers return success immediately.
    pub fn prepare(
        &self,
        state: &RuntimeState,
        row_desc: &RowDescriptor,
        profile: &RuntimeProfile,
    ) -> Result<(), String> {
        if (self.count.fetch_sub(1, Ordering::AcqRel) & 0xffff_ffff) == self.num_operators_generated
        {
            self.collector.prepare(state, row_desc, profile)?;
            self.collector.open(state)?;
        }
        Ok(())
    }

    /// The wrapped close runs when the last sibling closes and no prepare
    /// can still arrive.
    pub fn close(&self, state: &RuntimeState) {
        const K: u64 = 1u64 << 32;
        if self.count.fetch_sub(K, Ordering::AcqRel) == K {
            self.collector.close(state);
        }
    }

    pub fn get_probe_collector(&self) -> &RuntimeFilterProbeCollector {
        &self.collector
    }
}
