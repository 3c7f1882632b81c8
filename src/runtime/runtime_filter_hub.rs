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
//! Per-plan-node publication of merged runtime filters.
//!
//! Responsibilities:
//! - Stores the merged filter set of each join build node in a holder cell
//!   that transitions empty -> ready exactly once.
//! - Lets probe-side consumers gather holders and select in-filters bound to
//!   their tuple layouts.
//!
//! Key exported interfaces:
//! - Types: `RuntimeFilterCollector`, `RuntimeFilterHolder`,
//!   `RuntimeFilterHub`.
//!
//! Current limitations:
//! - Holder ids must be registered during single-threaded plan construction;
//!   the id set is frozen before the hub is shared.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, OnceLock};

use crate::common::ids::TupleId;
use crate::exec::expr::{InFilterContext, TupleSlotMapping};
use crate::exec::runtime_filter::BloomFilterBuildDescriptor;
use crate::flintrocks_logging::debug;
use crate::runtime::runtime_state::RuntimeState;

/// Merged runtime in-filters and bloom-filter descriptors of one join build
/// node. Stored in the [`RuntimeFilterHub`]; interior filter state is only
/// mutated before publication.
pub struct RuntimeFilterCollector {
    in_filters: Vec<InFilterContext>,
    bloom_filters: Vec<Arc<BloomFilterBuildDescriptor>>,
}

impl RuntimeFilterCollector {
    pub fn new(
        in_filters: Vec<InFilterContext>,
        bloom_filters: Vec<Arc<BloomFilterBuildDescriptor>>,
    ) -> Self {
        Self {
            in_filters,
            bloom_filters,
        }
    }

    pub fn get_in_filters(&self) -> &[InFilterContext] {
        &self.in_filters
    }

    pub fn get_bloom_filters(&self) -> &[Arc<BloomFilterBuildDescriptor>] {
        &self.bloom_filters
    }

    /// In-filters are constructed by a node and may be pushed down to its
    /// descendant node. A descendant and its ancestor may reference the same
    /// column through different `(tuple id, slot id)` pairs (e.g. across a
    /// projection), so the ancestor's tuple-slot mappings are used to rebind
    /// the in-filters into the descendant's coordinate system.
    pub fn rewrite_in_filters(&mut self, mappings: &[TupleSlotMapping]) {
        for mapping in mappings {
            let bound_tuples = [mapping.to_tuple_id];
            for in_filter in self.in_filters.iter_mut() {
                if !in_filter.root().is_bound(&bound_tuples) {
                    continue;
                }
                // Only a root whose first child is a direct column reference
                // can be rebound; anything else is left untouched.
                let Some(column) = in_filter.root_mut().probe_column_mut() else {
                    continue;
                };
                if column.slot_id() == mapping.to_slot_id {
                    column.set_slot_id(mapping.from_slot_id);
                    column.set_tuple_id(mapping.from_tuple_id);
                }
            }
        }
    }

    /// Push-down selector used by probe operators.
    pub fn get_in_filters_bounded_by_tuple_ids(
        &self,
        tuple_ids: &[TupleId],
    ) -> Vec<&InFilterContext> {
        self.in_filters
            .iter()
            .filter(|in_filter| in_filter.root().is_bound(tuple_ids))
            .collect()
    }
}

/// Publish-once cell for one join build node's collector.
///
/// The producer installs the collector at most once; any number of readers
/// may poll concurrently and observe either empty or the installed value.
#[derive(Default)]
pub struct RuntimeFilterHolder {
    collector: OnceLock<Box<RuntimeFilterCollector>>,
}

impl RuntimeFilterHolder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the collector. Calling this twice on one holder is a
    /// programmer error and aborts.
    pub fn set_collector(&self, collector: Box<RuntimeFilterCollector>) {
        let installed = self.collector.set(collector).is_ok();
        assert!(installed, "runtime filter collector installed twice");
    }

    pub fn get_collector(&self) -> Option<&RuntimeFilterCollector> {
        self.collector.get().map(|c| c.as_ref())
    }

    pub fn is_ready(&self) -> bool {
        self.get_collector().is_some()
    }
}

/// RuntimeFilterHub is a mediator gathering the runtime filters generated by
/// join build operator instances. It owns one holder per build node id; the
/// last-arriving builder publishes the merged collector, and consumers of
/// runtime filters inspect the hub to find their bound filters. The id set
/// is reserved during plan construction, so lookups need no lock.
#[derive(Default)]
pub struct RuntimeFilterHub {
    holders: HashMap<i32, RuntimeFilterHolder>,
}

impl RuntimeFilterHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a holder for a join build node. Plan construction only.
    pub fn add_holder(&mut self, node_id: i32) {
        self.holders.insert(node_id, RuntimeFilterHolder::new());
    }

    /// Publish the merged collector for `node_id`. Called exactly once per
    /// node, by the last-arriving builder.
    pub fn set_collector(&self, node_id: i32, collector: Box<RuntimeFilterCollector>) {
        debug!(
            "runtime filter collector publish: node_id={} in_filters={} bloom_filters={}",
            node_id,
            collector.get_in_filters().len(),
            collector.get_bloom_filters().len()
        );
        self.get_holder(node_id).set_collector(collector);
    }

    pub fn get_bloom_filters(&self, node_id: i32) -> Option<&[Arc<BloomFilterBuildDescriptor>]> {
        self.get_holder(node_id)
            .get_collector()
            .map(|c| c.get_bloom_filters())
    }

    /// Holders for a consumer node's upstream producers. Some may still be
    /// empty; callers poll `is_ready` without blocking.
    pub fn gather_holders(&self, ids: &BTreeSet<i32>) -> Vec<&RuntimeFilterHolder> {
        let mut holders = Vec::with_capacity(ids.len());
        for id in ids {
            holders.push(self.get_holder(*id));
        }
        holders
    }

    /// Close every published in-filter's expression context. Pipeline
    /// teardown only.
    pub fn close_all_in_filters(&self, state: &RuntimeState) {
        for holder in self.holders.values() {
            if let Some(collector) = holder.get_collector() {
                for in_filter in collector.get_in_filters() {
                    in_filter.close(state);
                }
            }
        }
    }

    fn get_holder(&self, node_id: i32) -> &RuntimeFilterHolder {
        self.holders
            .get(&node_id)
            .expect("runtime filter holder registered for node")
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;

    use arrow::array::{ArrayRef, Int32Array};
    use arrow::datatypes::DataType;

    use super::{RuntimeFilterCollector, RuntimeFilterHolder, RuntimeFilterHub};
    use crate::common::ids::{SlotId, TupleId};
    use crate::exec::expr::{ColumnRef, Expr, InFilterContext, InPredicate, TupleSlotMapping};
    use crate::runtime::runtime_state::RuntimeState;

    fn in_filter(tuple_id: u32, slot_id: u32, values: &[i32]) -> InFilterContext {
        let column = Expr::ColumnRef(ColumnRef::new(TupleId::new(tuple_id), SlotId::new(slot_id)));
        let mut pred = InPredicate::try_new(column, &DataType::Int32).unwrap();
        let array: ArrayRef = Arc::new(Int32Array::from(values.to_vec()));
        pred.insert_array(&array).unwrap();
        InFilterContext::new(pred)
    }

    fn cast_in_filter(tuple_id: u32, slot_id: u32) -> InFilterContext {
        let cast = Expr::Cast {
            to: DataType::Int64,
            child: Box::new(Expr::ColumnRef(ColumnRef::new(
                TupleId::new(tuple_id),
                SlotId::new(slot_id),
            ))),
        };
        InFilterContext::new(InPredicate::try_new(cast, &DataType::Int64).unwrap())
    }

    #[test]
    fn test_holder_publish_once() {
        let holder = RuntimeFilterHolder::new();
        assert!(!holder.is_ready());
        assert!(holder.get_collector().is_none());
        holder.set_collector(Box::new(RuntimeFilterCollector::new(
            vec![in_filter(0, 1, &[1])],
            Vec::new(),
        )));
        assert!(holder.is_ready());
        assert_eq!(holder.get_collector().unwrap().get_in_filters().len(), 1);
    }

    #[test]
    fn test_rewrite_in_filters_is_idempotent() {
        let mut collector = RuntimeFilterCollector::new(
            vec![in_filter(5, 10, &[1, 2]), cast_in_filter(5, 10)],
            Vec::new(),
        );
        let mappings = [TupleSlotMapping {
            from_tuple_id: TupleId::new(2),
            from_slot_id: SlotId::new(3),
            to_tuple_id: TupleId::new(5),
            to_slot_id: SlotId::new(10),
        }];

        collector.rewrite_in_filters(&mappings);
        let column = collector.get_in_filters()[0].root().probe_column().unwrap();
        assert_eq!(column.tuple_id(), TupleId::new(2));
        assert_eq!(column.slot_id(), SlotId::new(3));
        // The cast-rooted filter cannot be rebound.
        assert!(collector.get_in_filters()[1].root().probe_column().is_none());

        // Mappings project to -> from, so a second application is a no-op.
        collector.rewrite_in_filters(&mappings);
        let column = collector.get_in_filters()[0].root().probe_column().unwrap();
        assert_eq!(column.tuple_id(), TupleId::new(2));
        assert_eq!(column.slot_id(), SlotId::new(3));
    }

    #[test]
    fn test_bounded_by_tuple_ids_selector() {
        let collector = RuntimeFilterCollector::new(
            vec![in_filter(1, 0, &[1]), in_filter(2, 0, &[2])],
            Vec::new(),
        );
        let selected = collector.get_in_filters_bounded_by_tuple_ids(&[TupleId::new(2)]);
        assert_eq!(selected.len(), 1);
        assert_eq!(
            selected[0].root().probe_column().unwrap().tuple_id(),
            TupleId::new(2)
        );
        assert!(
            collector
                .get_in_filters_bounded_by_tuple_ids(&[TupleId::new(9)])
                .is_empty()
        );
    }

    #[test]
    fn test_hub_gather_and_close_all() {
        let mut hub = RuntimeFilterHub::new();
        hub.add_holder(1);
        hub.add_holder(2);

        let ids = BTreeSet::from([1, 2]);
        let holders = hub.gather_holders(&ids);
        assert_eq!(holders.len(), 2);
        assert!(holders.iter().all(|h| !h.is_ready()));

        hub.set_collector(
            1,
            Box::new(RuntimeFilterCollector::new(
                vec![in_filter(0, 1, &[7])],
                Vec::new(),
            )),
        );
        let holders = hub.gather_holders(&ids);
        assert!(holders[0].is_ready());
        assert!(!holders[1].is_ready());

        let state = RuntimeState::default();
        hub.close_all_in_filters(&state);
        let collector = holders[0].get_collector().unwrap();
        assert!(collector.get_in_filters()[0].is_closed());
    }
}
