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
//! IN-predicate expression contexts used by runtime filters.
//!
//! Responsibilities:
//! - Models the IN-predicate-over-column-reference shape that runtime
//!   in-filters are built from, with typed exact value sets.
//! - Supports tuple binding tests, slot rebinding and set-union merging.
//!
//! Key exported interfaces:
//! - Types: `ColumnRef`, `Expr`, `InPredicate`, `InFilterContext`,
//!   `TupleSlotMapping`.
//!
//! Current limitations:
//! - Only the expression shapes reachable from join build keys are modeled;
//!   anything else must be surfaced as an explicit runtime error.

use std::sync::atomic::{AtomicBool, Ordering};

use arrow::array::{
    Array, ArrayRef, Date32Array, Decimal128Array, Float64Array, Int8Array, Int16Array,
    Int32Array, Int64Array, StringArray,
};
use arrow::datatypes::DataType;
use hashbrown::HashSet;

use crate::common::ids::{SlotId, TupleId};
use crate::exec::chunk::Chunk;
use crate::flintrocks_logging::debug;
use crate::runtime::runtime_state::RuntimeState;

/// Projection of one column between a descendant and an ancestor schema.
///
/// `(to_tuple_id, to_slot_id)` names the column in the ancestor's coordinate
/// system, `(from_tuple_id, from_slot_id)` in the descendant's.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TupleSlotMapping {
    pub from_tuple_id: TupleId,
    pub from_slot_id: SlotId,
    pub to_tuple_id: TupleId,
    pub to_slot_id: SlotId,
}

#[derive(Clone, Debug, Eq, PartialEq)]
/// Reference to one column of one tuple layout.
pub struct ColumnRef {
    tuple_id: TupleId,
    slot_id: SlotId,
}

impl ColumnRef {
    pub fn new(tuple_id: TupleId, slot_id: SlotId) -> Self {
        Self { tuple_id, slot_id }
    }

    pub fn tuple_id(&self) -> TupleId {
        self.tuple_id
    }

    pub fn slot_id(&self) -> SlotId {
        self.slot_id
    }

    pub fn set_tuple_id(&mut self, tuple_id: TupleId) {
        self.tuple_id = tuple_id;
    }

    pub fn set_slot_id(&mut self, slot_id: SlotId) {
        self.slot_id = slot_id;
    }
}

#[derive(Clone, Debug)]
/// Probe-side expression under an IN-predicate root.
///
/// Runtime in-filters are only rewritable when the first child is a direct
/// column reference; a wrapped expression (e.g. a cast inserted by plan
/// lowering) still supports binding tests but is never rebound.
pub enum Expr {
    ColumnRef(ColumnRef),
    Cast { to: DataType, child: Box<Expr> },
}

impl Expr {
    pub fn is_bound(&self, tuple_ids: &[TupleId]) -> bool {
        match self {
            Expr::ColumnRef(column) => tuple_ids.contains(&column.tuple_id),
            Expr::Cast { child, .. } => child.is_bound(tuple_ids),
        }
    }

    pub fn as_column_ref(&self) -> Option<&ColumnRef> {
        match self {
            Expr::ColumnRef(column) => Some(column),
            Expr::Cast { .. } => None,
        }
    }

    pub fn as_column_ref_mut(&mut self) -> Option<&mut ColumnRef> {
        match self {
            Expr::ColumnRef(column) => Some(column),
            Expr::Cast { .. } => None,
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) enum InValues {
    Int8(HashSet<i8>),
    Int16(HashSet<i16>),
    Int32(HashSet<i32>),
    Int64(HashSet<i64>),
    Float64(HashSet<u64>),
    Utf8(HashSet<String>),
    Date32(HashSet<i32>),
    Decimal128 {
        values: HashSet<i128>,
        precision: u8,
        scale: i8,
    },
}

impl InValues {
    fn new(data_type: &DataType) -> Result<Self, String> {
        match data_type {
            DataType::Int8 => Ok(Self::Int8(HashSet::new())),
            DataType::Int16 => Ok(Self::Int16(HashSet::new())),
            DataType::Int32 => Ok(Self::Int32(HashSet::new())),
            DataType::Int64 => Ok(Self::Int64(HashSet::new())),
            DataType::Float64 => Ok(Self::Float64(HashSet::new())),
            DataType::Utf8 => Ok(Self::Utf8(HashSet::new())),
            DataType::Date32 => Ok(Self::Date32(HashSet::new())),
            DataType::Decimal128(precision, scale) => Ok(Self::Decimal128 {
                values: HashSet::new(),
                precision: *precision,
                scale: *scale,
            }),
            other => Err(format!("unsupported runtime in-filter type: {:?}", other)),
        }
    }

    fn len(&self) -> usize {
        match self {
            InValues::Int8(values) => values.len(),
            InValues::Int16(values) => values.len(),
            InValues::Int32(values) => values.len(),
            InValues::Int64(values) => values.len(),
            InValues::Float64(values) => values.len(),
            InValues::Utf8(values) => values.len(),
            InValues::Date32(values) => values.len(),
            InValues::Decimal128 { values, .. } => values.len(),
        }
    }

    fn insert_array(&mut self, array: &ArrayRef) -> Result<(), String> {
        match self {
            InValues::Int8(values) => {
                let arr = array
                    .as_any()
                    .downcast_ref::<Int8Array>()
                    .ok_or_else(|| "runtime in-filter type mismatch for Int8".to_string())?;
                for i in 0..arr.len() {
                    if arr.is_null(i) {
                        continue;
                    }
                    values.insert(arr.value(i));
                }
                Ok(())
            }
            InValues::Int16(values) => {
                let arr = array
                    .as_any()
                    .downcast_ref::<Int16Array>()
                    .ok_or_else(|| "runtime in-filter type mismatch for Int16".to_string())?;
                for i in 0..arr.len() {
                    if arr.is_null(i) {
                        continue;
                    }
                    values.insert(arr.value(i));
                }
                Ok(())
            }
            InValues::Int32(values) => {
                let arr = array
                    .as_any()
                    .downcast_ref::<Int32Array>()
                    .ok_or_else(|| "runtime in-filter type mismatch for Int32".to_string())?;
                for i in 0..arr.len() {
                    if arr.is_null(i) {
                        continue;
                    }
                    values.insert(arr.value(i));
                }
                Ok(())
            }
            InValues::Int64(values) => {
                let arr = array
                    .as_any()
                    .downcast_ref::<Int64Array>()
                    .ok_or_else(|| "runtime in-filter type mismatch for Int64".to_string())?;
                for i in 0..arr.len() {
                    if arr.is_null(i) {
                        continue;
                    }
                    values.insert(arr.value(i));
                }
                Ok(())
            }
            InValues::Float64(values) => {
                let arr = array
                    .as_any()
                    .downcast_ref::<Float64Array>()
                    .ok_or_else(|| "runtime in-filter type mismatch for Float64".to_string())?;
                for i in 0..arr.len() {
                    if arr.is_null(i) {
                        continue;
                    }
                    values.insert(arr.value(i).to_bits());
                }
                Ok(())
            }
            InValues::Utf8(values) => {
                let arr = array
                    .as_any()
                    .downcast_ref::<StringArray>()
                    .ok_or_else(|| "runtime in-filter type mismatch for Utf8".to_string())?;
                for i in 0..arr.len() {
                    if arr.is_null(i) {
                        continue;
                    }
                    values.insert(arr.value(i).to_string());
                }
                Ok(())
            }
            InValues::Date32(values) => {
                let arr = array
                    .as_any()
                    .downcast_ref::<Date32Array>()
                    .ok_or_else(|| "runtime in-filter type mismatch for Date32".to_string())?;
                for i in 0..arr.len() {
                    if arr.is_null(i) {
                        continue;
                    }
                    values.insert(arr.value(i));
                }
                Ok(())
            }
            InValues::Decimal128 {
                values,
                precision,
                scale,
            } => {
                let arr = array
                    .as_any()
                    .downcast_ref::<Decimal128Array>()
                    .ok_or_else(|| "runtime in-filter type mismatch for Decimal128".to_string())?;
                let DataType::Decimal128(arr_precision, arr_scale) = arr.data_type() else {
                    return Err("runtime in-filter type mismatch for Decimal128".to_string());
                };
                if *arr_precision != *precision || *arr_scale != *scale {
                    return Err("runtime in-filter decimal type mismatch".to_string());
                }
                for i in 0..arr.len() {
                    if arr.is_null(i) {
                        continue;
                    }
                    values.insert(arr.value(i));
                }
                Ok(())
            }
        }
    }

    fn contains(&self, array: &ArrayRef, row: usize) -> Result<bool, String> {
        match self {
            InValues::Int8(values) => {
                let arr = array
                    .as_any()
                    .downcast_ref::<Int8Array>()
                    .ok_or_else(|| "runtime in-filter type mismatch for Int8".to_string())?;
                Ok(values.contains(&arr.value(row)))
            }
            InValues::Int16(values) => {
                let arr = array
                    .as_any()
                    .downcast_ref::<Int16Array>()
                    .ok_or_else(|| "runtime in-filter type mismatch for Int16".to_string())?;
                Ok(values.contains(&arr.value(row)))
            }
            InValues::Int32(values) => {
                let arr = array
                    .as_any()
                    .downcast_ref::<Int32Array>()
                    .ok_or_else(|| "runtime in-filter type mismatch for Int32".to_string())?;
                Ok(values.contains(&arr.value(row)))
            }
            InValues::Int64(values) => {
                let arr = array
                    .as_any()
                    .downcast_ref::<Int64Array>()
                    .ok_or_else(|| "runtime in-filter type mismatch for Int64".to_string())?;
                Ok(values.contains(&arr.value(row)))
            }
            InValues::Float64(values) => {
                let arr = array
                    .as_any()
                    .downcast_ref::<Float64Array>()
                    .ok_or_else(|| "runtime in-filter type mismatch for Float64".to_string())?;
                Ok(values.contains(&arr.value(row).to_bits()))
            }
            InValues::Utf8(values) => {
                let arr = array
                    .as_any()
                    .downcast_ref::<StringArray>()
                    .ok_or_else(|| "runtime in-filter type mismatch for Utf8".to_string())?;
                Ok(values.contains(arr.value(row)))
            }
            InValues::Date32(values) => {
                let arr = array
                    .as_any()
                    .downcast_ref::<Date32Array>()
                    .ok_or_else(|| "runtime in-filter type mismatch for Date32".to_string())?;
                Ok(values.contains(&arr.value(row)))
            }
            InValues::Decimal128 {
                values,
                precision,
                scale,
            } => {
                let arr = array
                    .as_any()
                    .downcast_ref::<Decimal128Array>()
                    .ok_or_else(|| "runtime in-filter type mismatch for Decimal128".to_string())?;
                let DataType::Decimal128(arr_precision, arr_scale) = arr.data_type() else {
                    return Err("runtime in-filter type mismatch for Decimal128".to_string());
                };
                if *arr_precision != *precision || *arr_scale != *scale {
                    return Err("runtime in-filter decimal type mismatch".to_string());
                }
                Ok(values.contains(&arr.value(row)))
            }
        }
    }

    fn merge_from(&mut self, other: &InValues) -> Result<(), String> {
        match (self, other) {
            (InValues::Int8(lhs), InValues::Int8(rhs)) => {
                lhs.extend(rhs.iter().copied());
                Ok(())
            }
            (InValues::Int16(lhs), InValues::Int16(rhs)) => {
                lhs.extend(rhs.iter().copied());
                Ok(())
            }
            (InValues::Int32(lhs), InValues::Int32(rhs)) => {
                lhs.extend(rhs.iter().copied());
                Ok(())
            }
            (InValues::Int64(lhs), InValues::Int64(rhs)) => {
                lhs.extend(rhs.iter().copied());
                Ok(())
            }
            (InValues::Float64(lhs), InValues::Float64(rhs)) => {
                lhs.extend(rhs.iter().copied());
                Ok(())
            }
            (InValues::Utf8(lhs), InValues::Utf8(rhs)) => {
                lhs.extend(rhs.iter().cloned());
                Ok(())
            }
            (InValues::Date32(lhs), InValues::Date32(rhs)) => {
                lhs.extend(rhs.iter().copied());
                Ok(())
            }
            (
                InValues::Decimal128 {
                    values: lhs,
                    precision: lp,
                    scale: ls,
                },
                InValues::Decimal128 {
                    values: rhs,
                    precision: rp,
                    scale: rs,
                },
            ) => {
                if lp != rp || ls != rs {
                    return Err("runtime in-filter decimal type mismatch".to_string());
                }
                lhs.extend(rhs.iter().copied());
                Ok(())
            }
            _ => Err("runtime in-filter type mismatch".to_string()),
        }
    }
}

#[derive(Clone, Debug)]
/// IN-predicate root of a runtime in-filter expression.
///
/// Child 0 is the probe-side expression; the remaining conceptual children
/// are the enumerated build-side keys, stored as a typed value set.
pub struct InPredicate {
    probe: Expr,
    values: InValues,
}

impl InPredicate {
    pub fn try_new(probe: Expr, data_type: &DataType) -> Result<Self, String> {
        let values = InValues::new(data_type)?;
        Ok(Self { probe, values })
    }

    pub fn is_bound(&self, tuple_ids: &[TupleId]) -> bool {
        self.probe.is_bound(tuple_ids)
    }

    /// Child-0 column reference, when the probe expression is a direct one.
    pub fn probe_column(&self) -> Option<&ColumnRef> {
        self.probe.as_column_ref()
    }

    pub fn probe_column_mut(&mut self) -> Option<&mut ColumnRef> {
        self.probe.as_column_ref_mut()
    }

    pub fn num_values(&self) -> usize {
        self.values.len()
    }

    pub fn insert_array(&mut self, array: &ArrayRef) -> Result<(), String> {
        self.values.insert_array(array)
    }

    /// Union `other`'s value set into this predicate. The two predicates must
    /// enumerate keys of the same type.
    pub fn merge(&mut self, other: &InPredicate) -> Result<(), String> {
        self.values.merge_from(&other.values)
    }

    pub(crate) fn contains(&self, array: &ArrayRef, row: usize) -> Result<bool, String> {
        self.values.contains(array, row)
    }
}

#[derive(Debug)]
/// Expression context owning one runtime in-filter predicate.
///
/// The predicate is mutable until the owning collector is published; after
/// publication the context is shared read-only and only the one-shot close
/// flag may change.
pub struct InFilterContext {
    root: InPredicate,
    closed: AtomicBool,
}

impl Clone for InFilterContext {
    fn clone(&self) -> Self {
        Self {
            root: self.root.clone(),
            closed: AtomicBool::new(self.closed.load(Ordering::Acquire)),
        }
    }
}

impl InFilterContext {
    pub fn new(root: InPredicate) -> Self {
        Self {
            root,
            closed: AtomicBool::new(false),
        }
    }

    pub fn root(&self) -> &InPredicate {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut InPredicate {
        &mut self.root
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Release the context. Idempotent; later calls are no-ops.
    pub fn close(&self, state: &RuntimeState) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(
            "runtime in-filter context closed: query_id={:?} values={}",
            state.query_id(),
            self.root.num_values()
        );
    }

    /// Drop the rows of `chunk` whose probe key is null or not in the value
    /// set. `probe_array` must be the evaluated probe column for `chunk`.
    pub fn filter_chunk(
        &self,
        probe_array: &ArrayRef,
        chunk: Chunk,
    ) -> Result<Option<Chunk>, String> {
        if self.root.num_values() == 0 {
            return Ok(Some(chunk));
        }
        if chunk.is_empty() {
            return Ok(Some(chunk));
        }
        if probe_array.len() != chunk.len() {
            return Err("runtime in-filter array length mismatch".to_string());
        }
        let len = chunk.len();
        let mut keep = vec![true; len];
        for row in 0..len {
            if probe_array.is_null(row) {
                keep[row] = false;
                continue;
            }
            if !self.root.contains(probe_array, row)? {
                keep[row] = false;
            }
        }
        chunk.filter_by_mask(&keep)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::{ArrayRef, Int32Array, StringArray};
    use arrow::datatypes::DataType;

    use super::{ColumnRef, Expr, InFilterContext, InPredicate};
    use crate::common::ids::{SlotId, TupleId};
    use crate::runtime::runtime_state::RuntimeState;

    fn int32_predicate(tuple_id: u32, slot_id: u32, values: &[i32]) -> InPredicate {
        let column = Expr::ColumnRef(ColumnRef::new(TupleId::new(tuple_id), SlotId::new(slot_id)));
        let mut pred = InPredicate::try_new(column, &DataType::Int32).unwrap();
        let array: ArrayRef = Arc::new(Int32Array::from(values.to_vec()));
        pred.insert_array(&array).unwrap();
        pred
    }

    #[test]
    fn test_insert_and_contains() {
        let pred = int32_predicate(0, 1, &[1, 2, 3]);
        let array: ArrayRef = Arc::new(Int32Array::from(vec![2, 9]));
        assert!(pred.contains(&array, 0).unwrap());
        assert!(!pred.contains(&array, 1).unwrap());
        assert_eq!(pred.num_values(), 3);
    }

    #[test]
    fn test_merge_unions_values() {
        let mut lhs = int32_predicate(0, 1, &[1, 2, 3]);
        let rhs = int32_predicate(0, 1, &[3, 4, 5]);
        lhs.merge(&rhs).unwrap();
        assert_eq!(lhs.num_values(), 5);
    }

    #[test]
    fn test_merge_type_mismatch() {
        let mut lhs = int32_predicate(0, 1, &[1]);
        let column = Expr::ColumnRef(ColumnRef::new(TupleId::new(0), SlotId::new(1)));
        let mut rhs = InPredicate::try_new(column, &DataType::Utf8).unwrap();
        let array: ArrayRef = Arc::new(StringArray::from(vec!["a"]));
        rhs.insert_array(&array).unwrap();
        assert!(lhs.merge(&rhs).is_err());
    }

    #[test]
    fn test_binding_and_child0_access() {
        let mut pred = int32_predicate(3, 1, &[1]);
        assert!(pred.is_bound(&[TupleId::new(3)]));
        assert!(!pred.is_bound(&[TupleId::new(4)]));
        assert_eq!(pred.probe_column().unwrap().slot_id(), SlotId::new(1));

        let cast = Expr::Cast {
            to: DataType::Int64,
            child: Box::new(Expr::ColumnRef(ColumnRef::new(
                TupleId::new(3),
                SlotId::new(1),
            ))),
        };
        let wrapped = InPredicate::try_new(cast, &DataType::Int64).unwrap();
        assert!(wrapped.is_bound(&[TupleId::new(3)]));
        assert!(wrapped.probe_column().is_none());

        pred.probe_column_mut().unwrap().set_slot_id(SlotId::new(9));
        assert_eq!(pred.probe_column().unwrap().slot_id(), SlotId::new(9));
    }

    #[test]
    fn test_unsupported_type_rejected() {
        let column = Expr::ColumnRef(ColumnRef::new(TupleId::new(0), SlotId::new(0)));
        assert!(InPredicate::try_new(column, &DataType::Binary).is_err());
    }

    #[test]
    fn test_close_is_idempotent() {
        let ctx = InFilterContext::new(int32_predicate(0, 1, &[1]));
        let state = RuntimeState::default();
        assert!(!ctx.is_closed());
        ctx.close(&state);
        ctx.close(&state);
        assert!(ctx.is_closed());
    }
}
