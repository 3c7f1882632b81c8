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
//! Integration tests for the runtime-filter subsystem: build-side merging,
//! hub publication and probe-side consumption across threads.

use std::collections::BTreeSet;
use std::sync::{Arc, Barrier};
use std::time::{Duration, Instant};

use arrow::array::{ArrayRef, Int64Array, RecordBatch};
use arrow::datatypes::{DataType, Field, Schema};
use rand::seq::SliceRandom;

use flintrocks::common::ids::{SlotId, TupleId, UniqueId};
use flintrocks::exec::chunk::{Chunk, field_with_slot_id};
use flintrocks::exec::runtime_filter::{
    JoinRuntimeFilterSpec, PartialRuntimeFilterMerger, RefCountedRuntimeFilterProbeCollector,
    RowDescriptor, RuntimeFilterBuildPublisher, RuntimeFilterProbeCollector,
    RuntimeFilterProbeDescriptor, build_bloom_descriptors,
};
use flintrocks::runtime::profile::RuntimeProfile;
use flintrocks::runtime::runtime_filter_hub::RuntimeFilterHub;
use flintrocks::runtime::runtime_state::RuntimeState;

const PROBE_SLOT: u32 = 1;
const PROBE_TUPLE: u32 = 0;

fn filter_spec(filter_id: i32) -> JoinRuntimeFilterSpec {
    JoinRuntimeFilterSpec {
        filter_id,
        expr_order: 0,
        probe_tuple_id: TupleId::new(PROBE_TUPLE),
        probe_slot_id: SlotId::new(PROBE_SLOT),
        eq_null: false,
        has_consumer: true,
        has_remote_targets: false,
        join_mode: 2,
    }
}

fn int64_keys(values: Vec<i64>) -> Vec<ArrayRef> {
    vec![Arc::new(Int64Array::from(values))]
}

fn int64_chunk(values: Vec<i64>) -> Chunk {
    let field = field_with_slot_id(
        Field::new("k", DataType::Int64, true),
        SlotId::new(PROBE_SLOT),
    );
    let schema = Arc::new(Schema::new(vec![field]));
    let array: ArrayRef = Arc::new(Int64Array::from(values));
    Chunk::try_new(RecordBatch::try_new(schema, vec![array]).unwrap()).unwrap()
}

/// Three partitioned build drivers finishing on separate threads, one of
/// them with an empty partition; the last arriver publishes, and the probe
/// side sees the union through both the in-filter and bloom paths.
#[test]
fn test_partitioned_build_to_probe_end_to_end() {
    let specs = vec![filter_spec(7)];
    let descriptors = build_bloom_descriptors(&specs, &[DataType::Int64]).unwrap();
    let merger = Arc::new(PartialRuntimeFilterMerger::new(3, 1024, 1_024_000));
    let mut hub = RuntimeFilterHub::new();
    hub.add_holder(5);
    let hub = Arc::new(hub);
    let state = RuntimeState::with_query_id(UniqueId::new(1, 1));

    let partitions: Vec<Vec<i64>> = vec![(1..=10).collect(), Vec::new(), (11..=30).collect()];
    let mut handles = Vec::new();
    for (driver_sequence, keys) in partitions.into_iter().enumerate() {
        let mut publisher = RuntimeFilterBuildPublisher::new(
            5,
            driver_sequence,
            specs.clone(),
            descriptors.clone(),
            Arc::clone(&merger),
            Arc::clone(&hub),
            Vec::new(),
        );
        let state = state.clone();
        handles.push(std::thread::spawn(move || {
            if !keys.is_empty() {
                publisher.add_build_chunk(&int64_keys(keys)).unwrap();
            }
            publisher.finish(&state).unwrap()
        }));
    }
    let merged_flags: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(merged_flags.iter().filter(|v| **v).count(), 1);

    let holders = hub.gather_holders(&BTreeSet::from([5]));
    let collector = holders[0].get_collector().expect("collector published");

    // The in-filter union covers every partition's keys.
    let in_filters = collector.get_in_filters_bounded_by_tuple_ids(&[TupleId::new(PROBE_TUPLE)]);
    assert_eq!(in_filters.len(), 1);
    assert_eq!(in_filters[0].root().num_values(), 30);
    let chunk = int64_chunk(vec![1, 30, 999]);
    let probe_array = chunk.column_by_slot_id(SlotId::new(PROBE_SLOT)).unwrap();
    let filtered = in_filters[0]
        .filter_chunk(&probe_array, chunk)
        .unwrap()
        .unwrap();
    assert_eq!(filtered.len(), 2);

    // The bloom path keeps every present key and prunes most absent ones.
    let probe_collector = RuntimeFilterProbeCollector::new();
    probe_collector.add_descriptor(RuntimeFilterProbeDescriptor::new(
        7,
        TupleId::new(PROBE_TUPLE),
        SlotId::new(PROBE_SLOT),
    ));
    let profile = RuntimeProfile::new("probe");
    probe_collector
        .prepare(
            &state,
            &RowDescriptor::new(vec![TupleId::new(PROBE_TUPLE)]),
            &profile,
        )
        .unwrap();
    probe_collector.update_filters(collector.get_bloom_filters());
    assert_eq!(profile.counter_value("RuntimeMembershipFilters"), Some(1));

    let present = probe_collector
        .evaluate(int64_chunk((1..=30).collect()))
        .unwrap()
        .unwrap();
    assert_eq!(present.len(), 30);

    let absent = probe_collector
        .evaluate(int64_chunk((1_000_000..1_010_000).collect()))
        .unwrap();
    let survivors = absent.map(|c| c.len()).unwrap_or(0);
    assert!(survivors < 1000, "too many false positives: {}", survivors);

    hub.close_all_in_filters(&state);
    assert!(collector.get_in_filters()[0].is_closed());
}

/// The merger produces a merged result on exactly the N-th post, for random
/// builder orderings, and the union is complete.
#[test]
fn test_rendezvous_fires_exactly_once_per_ordering() {
    let mut rng = rand::thread_rng();
    for _ in 0..20 {
        let num_builders = 6usize;
        let specs = vec![filter_spec(1)];
        let descriptors = build_bloom_descriptors(&specs, &[DataType::Int64]).unwrap();
        let merger = Arc::new(PartialRuntimeFilterMerger::new(num_builders, 1024, 1_024_000));
        let mut hub = RuntimeFilterHub::new();
        hub.add_holder(1);
        let hub = Arc::new(hub);
        let state = RuntimeState::default();

        let mut order: Vec<usize> = (0..num_builders).collect();
        order.shuffle(&mut rng);

        let barrier = Arc::new(Barrier::new(num_builders));
        let mut handles = Vec::new();
        for driver_sequence in order {
            let mut publisher = RuntimeFilterBuildPublisher::new(
                1,
                driver_sequence,
                specs.clone(),
                descriptors.clone(),
                Arc::clone(&merger),
                Arc::clone(&hub),
                Vec::new(),
            );
            let barrier = Arc::clone(&barrier);
            let state = state.clone();
            handles.push(std::thread::spawn(move || {
                let keys: Vec<i64> = (0..10)
                    .map(|i| (driver_sequence * 10 + i) as i64)
                    .collect();
                publisher.add_build_chunk(&int64_keys(keys)).unwrap();
                barrier.wait();
                publisher.finish(&state).unwrap()
            }));
        }
        let merged_flags: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(merged_flags.iter().filter(|v| **v).count(), 1);

        let holders = hub.gather_holders(&BTreeSet::from([1]));
        let collector = holders[0].get_collector().expect("collector published");
        assert_eq!(collector.get_in_filters().len(), 1);
        // Every builder's keys made it into the union.
        assert_eq!(
            collector.get_in_filters()[0].root().num_values(),
            num_builders * 10
        );
    }
}

/// A holder races one writer against many readers: every reader observes
/// either empty or the fully populated collector.
#[test]
fn test_holder_publication_is_atomic_for_readers() {
    let specs = vec![filter_spec(3)];
    let descriptors = build_bloom_descriptors(&specs, &[DataType::Int64]).unwrap();
    let merger = Arc::new(PartialRuntimeFilterMerger::new(1, 1024, 1_024_000));
    let mut hub = RuntimeFilterHub::new();
    hub.add_holder(3);
    let hub = Arc::new(hub);
    let state = RuntimeState::default();

    let num_readers = 8usize;
    let start = Arc::new(Barrier::new(num_readers + 1));
    let mut handles = Vec::new();
    for _ in 0..num_readers {
        let hub = Arc::clone(&hub);
        let start = Arc::clone(&start);
        handles.push(std::thread::spawn(move || {
            start.wait();
            let holders = hub.gather_holders(&BTreeSet::from([3]));
            let deadline = Instant::now() + Duration::from_secs(10);
            loop {
                if let Some(collector) = holders[0].get_collector() {
                    // Once ready, the payload is fully visible.
                    assert_eq!(collector.get_in_filters().len(), 1);
                    assert_eq!(collector.get_in_filters()[0].root().num_values(), 3);
                    assert_eq!(collector.get_bloom_filters().len(), 1);
                    return;
                }
                assert!(Instant::now() < deadline, "holder never became ready");
                std::hint::spin_loop();
            }
        }));
    }

    let mut publisher = RuntimeFilterBuildPublisher::new(
        3,
        0,
        specs,
        descriptors,
        merger,
        Arc::clone(&hub),
        Vec::new(),
    );
    publisher.add_build_chunk(&int64_keys(vec![1, 2, 3])).unwrap();
    start.wait();
    assert!(publisher.finish(&state).unwrap());

    for handle in handles {
        handle.join().unwrap();
    }
}

/// Concurrent siblings: every interleaving of N prepares followed by N
/// closes runs the wrapped prepare+open once and close once.
#[test]
fn test_refcounted_collector_concurrent_lifecycle() {
    let num_siblings = 8usize;
    let collector = RuntimeFilterProbeCollector::new();
    collector.add_descriptor(RuntimeFilterProbeDescriptor::new(
        1,
        TupleId::new(PROBE_TUPLE),
        SlotId::new(PROBE_SLOT),
    ));
    let shared = Arc::new(RefCountedRuntimeFilterProbeCollector::new(
        num_siblings,
        collector,
    ));
    let state = RuntimeState::default();
    // Close may only begin after every sibling that prepares has prepared.
    let prepared = Arc::new(Barrier::new(num_siblings));

    let mut handles = Vec::new();
    for _ in 0..num_siblings {
        let shared = Arc::clone(&shared);
        let state = state.clone();
        let prepared = Arc::clone(&prepared);
        handles.push(std::thread::spawn(move || {
            let row_desc = RowDescriptor::new(vec![TupleId::new(PROBE_TUPLE)]);
            let profile = RuntimeProfile::new("probe");
            shared.prepare(&state, &row_desc, &profile).unwrap();
            prepared.wait();
            shared.close(&state);
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(shared.get_probe_collector().prepared_times(), 1);
    assert_eq!(shared.get_probe_collector().opened_times(), 1);
    assert_eq!(shared.get_probe_collector().closed_times(), 1);
}

/// A build driver that overflows the IN-list threshold forces an empty
/// merged IN-list while blooms are still published, end to end.
#[test]
fn test_overflow_partition_poisons_in_filters_end_to_end() {
    let specs = vec![filter_spec(2)];
    let descriptors = build_bloom_descriptors(&specs, &[DataType::Int64]).unwrap();
    // Default limits: L = 1024 in-filter conditions, 1_024_000 bloom rows.
    let merger = Arc::new(PartialRuntimeFilterMerger::with_config_limits(2));
    let mut hub = RuntimeFilterHub::new();
    hub.add_holder(2);
    let hub = Arc::new(hub);
    let state = RuntimeState::default();

    let partitions: Vec<Vec<i64>> = vec![(0..2000).collect(), (0..100).collect()];
    let mut handles = Vec::new();
    for (driver_sequence, keys) in partitions.into_iter().enumerate() {
        let mut publisher = RuntimeFilterBuildPublisher::new(
            2,
            driver_sequence,
            specs.clone(),
            descriptors.clone(),
            Arc::clone(&merger),
            Arc::clone(&hub),
            Vec::new(),
        );
        let state = state.clone();
        handles.push(std::thread::spawn(move || {
            publisher.add_build_chunk(&int64_keys(keys)).unwrap();
            publisher.finish(&state).unwrap()
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let holders = hub.gather_holders(&BTreeSet::from([2]));
    let collector = holders[0].get_collector().expect("collector published");
    assert!(collector.get_in_filters().is_empty());
    let filter = collector.get_bloom_filters()[0].filter().unwrap();
    assert_eq!(filter.size(), 2100);
}
