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
//! Builder-local accumulation of partial runtime in-filters.
//!
//! Responsibilities:
//! - Accumulates one IN-filter per runtime-filter spec, in spec order, from
//!   the build-key arrays of one partition.
//! - This ordering is the positional-alignment contract the merger relies
//!   on: every builder of a node emits its partial lists in identical order.
//!
//! Key exported interfaces:
//! - Types: `JoinRuntimeFilterSpec`, `LocalInFilterSet`.

use arrow::array::ArrayRef;

use crate::common::ids::{SlotId, TupleId};
use crate::exec::expr::{ColumnRef, Expr, InFilterContext, InPredicate};
use crate::flintrocks_logging::warn;

/// Runtime-filter requirements of one join node, as produced by plan
/// lowering. `expr_order` indexes the join's build-key expressions.
#[derive(Clone, Debug)]
pub struct JoinRuntimeFilterSpec {
    pub filter_id: i32,
    pub expr_order: usize,
    pub probe_tuple_id: TupleId,
    pub probe_slot_id: SlotId,
    pub eq_null: bool,
    pub has_consumer: bool,
    pub has_remote_targets: bool,
    pub join_mode: i8,
}

/// Spec-ordered container of the runtime in-filters one build driver is
/// accumulating. A spec whose key type cannot back an IN-filter keeps an
/// unfilled slot so positional alignment across builders is preserved.
#[derive(Debug)]
pub struct LocalInFilterSet {
    filters: Vec<Option<LocalInFilter>>,
}

#[derive(Debug)]
struct LocalInFilter {
    filter_id: i32,
    expr_order: usize,
    predicate: InPredicate,
}

impl LocalInFilterSet {
    pub fn new(specs: &[JoinRuntimeFilterSpec], key_arrays: &[ArrayRef]) -> Result<Self, String> {
        let mut filters = Vec::with_capacity(specs.len());
        for spec in specs {
            let Some(array) = key_arrays.get(spec.expr_order) else {
                return Err(format!(
                    "runtime filter {} expects build key index {} but only {} keys are available",
                    spec.filter_id,
                    spec.expr_order,
                    key_arrays.len()
                ));
            };
            let probe = Expr::ColumnRef(ColumnRef::new(spec.probe_tuple_id, spec.probe_slot_id));
            match InPredicate::try_new(probe, array.data_type()) {
                Ok(predicate) => filters.push(Some(LocalInFilter {
                    filter_id: spec.filter_id,
                    expr_order: spec.expr_order,
                    predicate,
                })),
                Err(e) => {
                    warn!(
                        "skip runtime in-filter: filter_id={} err={}",
                        spec.filter_id, e
                    );
                    filters.push(None);
                }
            }
        }
        Ok(Self { filters })
    }

    pub fn add_build_arrays(&mut self, key_arrays: &[ArrayRef]) -> Result<(), String> {
        for filter in self.filters.iter_mut().flatten() {
            let Some(array) = key_arrays.get(filter.expr_order) else {
                return Err(format!(
                    "runtime filter {} expects build key index {} but only {} keys are available",
                    filter.filter_id,
                    filter.expr_order,
                    key_arrays.len()
                ));
            };
            filter.predicate.insert_array(array)?;
        }
        Ok(())
    }

    /// One entry per spec, in spec order.
    pub fn into_partial_filters(self) -> Vec<Option<InFilterContext>> {
        self.filters
            .into_iter()
            .map(|filter| filter.map(|f| InFilterContext::new(f.predicate)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::{ArrayRef, BooleanArray, Int32Array, StringArray};

    use super::{JoinRuntimeFilterSpec, LocalInFilterSet};
    use crate::common::ids::{SlotId, TupleId};

    fn spec(filter_id: i32, expr_order: usize) -> JoinRuntimeFilterSpec {
        JoinRuntimeFilterSpec {
            filter_id,
            expr_order,
            probe_tuple_id: TupleId::new(0),
            probe_slot_id: SlotId::new(filter_id as u32),
            eq_null: false,
            has_consumer: true,
            has_remote_targets: false,
            join_mode: 2,
        }
    }

    #[test]
    fn test_accumulates_in_spec_order() {
        let keys: Vec<ArrayRef> = vec![
            Arc::new(Int32Array::from(vec![1, 2])),
            Arc::new(StringArray::from(vec!["a", "b"])),
        ];
        let specs = [spec(10, 1), spec(11, 0)];
        let mut set = LocalInFilterSet::new(&specs, &keys).unwrap();
        set.add_build_arrays(&keys).unwrap();
        let partial = set.into_partial_filters();
        assert_eq!(partial.len(), 2);
        // Slot order follows spec order, not key order.
        assert_eq!(
            partial[0]
                .as_ref()
                .unwrap()
                .root()
                .probe_column()
                .unwrap()
                .slot_id(),
            SlotId::new(10)
        );
        assert_eq!(partial[1].as_ref().unwrap().root().num_values(), 2);
    }

    #[test]
    fn test_unsupported_key_type_keeps_slot() {
        let keys: Vec<ArrayRef> = vec![
            Arc::new(BooleanArray::from(vec![true])),
            Arc::new(Int32Array::from(vec![5])),
        ];
        let specs = [spec(1, 0), spec(2, 1)];
        let mut set = LocalInFilterSet::new(&specs, &keys).unwrap();
        set.add_build_arrays(&keys).unwrap();
        let partial = set.into_partial_filters();
        assert_eq!(partial.len(), 2);
        assert!(partial[0].is_none());
        assert!(partial[1].is_some());
    }

    #[test]
    fn test_missing_build_key_is_an_error() {
        let keys: Vec<ArrayRef> = vec![Arc::new(Int32Array::from(vec![1]))];
        let specs = [spec(1, 3)];
        assert!(LocalInFilterSet::new(&specs, &keys).is_err());
    }
}
