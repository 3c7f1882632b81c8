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
//! Per-driver runtime-filter publication for join build sinks.
//!
//! Responsibilities:
//! - Accumulates one build driver's key columns into partial in-filters and
//!   bloom build parameters.
//! - Posts the partials to the merger on finish; the last-arriving driver
//!   rewrites and publishes the merged collector through the hub.
//!
//! Key exported interfaces:
//! - Types: `RuntimeFilterBuildPublisher`.
//! - Functions: `build_bloom_descriptors`.
//!
//! Current limitations:
//! - A publisher is only created for nodes with at least one runtime-filter
//!   spec; drivers of spec-less nodes have nothing to post.

use std::sync::Arc;

use arrow::array::{Array, ArrayRef};
use arrow::datatypes::DataType;

use super::{
    BloomFilterBuildDescriptor, BloomFilterBuildParam, JoinRuntimeFilterSpec, LocalInFilterSet,
    PartialRuntimeFilterMerger,
};
use crate::common::config;
use crate::exec::expr::{InFilterContext, TupleSlotMapping};
use crate::flintrocks_logging::{debug, warn};
use crate::runtime::runtime_filter_hub::{RuntimeFilterCollector, RuntimeFilterHub};
use crate::runtime::runtime_state::RuntimeState;

/// One shared descriptor per spec, in spec order. Every builder of the node
/// passes the same list to the merger.
pub fn build_bloom_descriptors(
    specs: &[JoinRuntimeFilterSpec],
    build_key_types: &[DataType],
) -> Result<Vec<Arc<BloomFilterBuildDescriptor>>, String> {
    let mut descriptors = Vec::with_capacity(specs.len());
    for spec in specs {
        let Some(build_type) = build_key_types.get(spec.expr_order) else {
            return Err(format!(
                "runtime filter {} expects build key index {} but only {} keys are available",
                spec.filter_id,
                spec.expr_order,
                build_key_types.len()
            ));
        };
        descriptors.push(Arc::new(BloomFilterBuildDescriptor::new(
            spec.filter_id,
            build_type.clone(),
            spec.join_mode,
            spec.has_consumer,
            spec.has_remote_targets,
        )));
    }
    Ok(descriptors)
}

/// Runtime-filter duties of one join build driver, split off the build sink:
/// feed it every build chunk's key arrays, then call [`finish`] once the
/// hash table is complete.
///
/// [`finish`]: RuntimeFilterBuildPublisher::finish
pub struct RuntimeFilterBuildPublisher {
    node_id: i32,
    driver_sequence: usize,
    specs: Vec<JoinRuntimeFilterSpec>,
    descriptors: Vec<Arc<BloomFilterBuildDescriptor>>,
    merger: Arc<PartialRuntimeFilterMerger>,
    hub: Arc<RuntimeFilterHub>,
    mappings: Vec<TupleSlotMapping>,
    in_filter_max_conditions: usize,
    in_filters: Option<LocalInFilterSet>,
    param_columns: Vec<Option<Vec<ArrayRef>>>,
    ht_row_count: usize,
    finished: bool,
}

impl RuntimeFilterBuildPublisher {
    pub fn new(
        node_id: i32,
        driver_sequence: usize,
        specs: Vec<JoinRuntimeFilterSpec>,
        descriptors: Vec<Arc<BloomFilterBuildDescriptor>>,
        merger: Arc<PartialRuntimeFilterMerger>,
        hub: Arc<RuntimeFilterHub>,
        mappings: Vec<TupleSlotMapping>,
    ) -> Self {
        let param_columns = vec![Some(Vec::new()); specs.len()];
        Self {
            node_id,
            driver_sequence,
            specs,
            descriptors,
            merger,
            hub,
            mappings,
            in_filter_max_conditions: config::runtime_in_filter_max_conditions(),
            in_filters: None,
            param_columns,
            ht_row_count: 0,
            finished: false,
        }
    }

    /// Accumulate one build chunk's evaluated key arrays.
    pub fn add_build_chunk(&mut self, key_arrays: &[ArrayRef]) -> Result<(), String> {
        if self.finished {
            return Err("runtime filter publisher already finished".to_string());
        }
        let Some(first) = key_arrays.first() else {
            return Err("runtime filters require join build keys".to_string());
        };
        self.ht_row_count = self.ht_row_count.saturating_add(first.len());

        if self.ht_row_count > self.in_filter_max_conditions {
            // Oversized build side: exact key enumeration stops here and the
            // driver will post an empty in-filter list.
            self.in_filters = None;
        } else {
            if self.in_filters.is_none() {
                self.in_filters = Some(LocalInFilterSet::new(&self.specs, key_arrays)?);
            }
            if let Some(filters) = self.in_filters.as_mut() {
                filters.add_build_arrays(key_arrays)?;
            }
        }

        for (idx, spec) in self.specs.iter().enumerate() {
            match key_arrays.get(spec.expr_order) {
                Some(array) => {
                    if let Some(Some(columns)) = self.param_columns.get_mut(idx) {
                        columns.push(Arc::clone(array));
                    }
                }
                None => {
                    warn!(
                        "runtime filter missing build key column: filter_id={} expr_order={}",
                        spec.filter_id, spec.expr_order
                    );
                    self.param_columns[idx] = None;
                }
            }
        }
        Ok(())
    }

    /// Post this driver's partials. Returns `Ok(true)` when this driver was
    /// the last one and the merged collector has been published to the hub.
    pub fn finish(&mut self, state: &RuntimeState) -> Result<bool, String> {
        if self.finished {
            return Err("runtime filter publisher already finished".to_string());
        }
        self.finished = true;

        let in_filters: Vec<Option<InFilterContext>> =
            if self.ht_row_count > 0 && self.ht_row_count <= self.in_filter_max_conditions {
                match self.in_filters.take() {
                    Some(filters) => filters.into_partial_filters(),
                    None => Vec::new(),
                }
            } else {
                Vec::new()
            };

        let params: Vec<BloomFilterBuildParam> = self
            .specs
            .iter()
            .enumerate()
            .map(|(idx, spec)| {
                BloomFilterBuildParam::new(
                    spec.eq_null,
                    self.param_columns[idx].take(),
                    self.ht_row_count,
                )
            })
            .collect();

        debug!(
            "runtime filter partials posted: node_id={} driver_sequence={} ht_row_count={} in_filters={}",
            self.node_id,
            self.driver_sequence,
            self.ht_row_count,
            in_filters.len()
        );
        let merged = self.merger.add_partial_filters(
            self.driver_sequence,
            self.ht_row_count,
            in_filters,
            params,
            self.descriptors.clone(),
        )?;
        if !merged {
            return Ok(false);
        }

        let total_in_filters = self.merger.get_total_in_filters();
        let total_bloom_filters = self.merger.get_total_bloom_filters();
        let mut collector = RuntimeFilterCollector::new(total_in_filters, total_bloom_filters);
        collector.rewrite_in_filters(&self.mappings);
        debug!(
            "runtime filter totals published: node_id={} driver_sequence={} query_id={:?}",
            self.node_id,
            self.driver_sequence,
            state.query_id()
        );
        self.hub.set_collector(self.node_id, Box::new(collector));
        Ok(true)
    }
}
