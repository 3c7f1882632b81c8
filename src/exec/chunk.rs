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
use std::collections::HashMap;
use std::sync::Arc;

use arrow::array::{ArrayRef, BooleanArray, RecordBatch};
use arrow::compute::filter_record_batch;
use arrow::datatypes::{Field, SchemaRef};

use crate::common::ids::SlotId;

/// A chunk of data, consisting of multiple rows.
///
/// Wraps an Arrow RecordBatch whose every field carries a slot id in its
/// metadata, so columns are addressed by slot rather than by position.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub batch: RecordBatch,
    slot_ids: Arc<HashMap<SlotId, usize>>,
}

impl Chunk {
    /// Index the batch by slot id. Every field must carry slot metadata and
    /// no two fields may share a slot.
    pub fn try_new(batch: RecordBatch) -> Result<Self, String> {
        let schema = batch.schema();
        let mut slot_ids = HashMap::with_capacity(schema.fields().len());
        for (index, field) in schema.fields().iter().enumerate() {
            let slot_id = field_slot_id(field)?.ok_or_else(|| {
                format!(
                    "chunk field '{}' carries no {} metadata",
                    field.name(),
                    FIELD_META_SLOT_ID
                )
            })?;
            if slot_ids.insert(slot_id, index).is_some() {
                return Err(format!(
                    "chunk schema binds slot id {} to more than one column",
                    slot_id
                ));
            }
        }
        Ok(Self {
            batch,
            slot_ids: Arc::new(slot_ids),
        })
    }

    pub fn schema(&self) -> SchemaRef {
        self.batch.schema()
    }

    pub fn column_by_slot_id(&self, slot_id: SlotId) -> Result<ArrayRef, String> {
        match self.slot_ids.get(&slot_id) {
            // The index came from enumerating this batch's own schema, so it
            // is always in range.
            Some(&index) => Ok(Arc::clone(self.batch.column(index))),
            None => {
                let mut known: Vec<SlotId> = self.slot_ids.keys().copied().collect();
                known.sort();
                Err(format!(
                    "chunk has no column for slot id {}, known slots: {:?}",
                    slot_id, known
                ))
            }
        }
    }

    pub fn len(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keep only the rows selected by `keep`. Returns `None` when no row
    /// survives, and hands the chunk back untouched when every row does.
    pub fn filter_by_mask(self, keep: &[bool]) -> Result<Option<Chunk>, String> {
        if keep.len() != self.len() {
            return Err(format!(
                "chunk selection mask length mismatch: mask={} rows={}",
                keep.len(),
                self.len()
            ));
        }
        if keep.iter().all(|v| *v) {
            return Ok(Some(self));
        }
        if keep.iter().all(|v| !*v) {
            return Ok(None);
        }
        let mask = BooleanArray::from(keep.to_vec());
        let filtered_batch = filter_record_batch(&self.batch, &mask).map_err(|e| e.to_string())?;
        Ok(Some(Chunk {
            batch: filtered_batch,
            slot_ids: Arc::clone(&self.slot_ids),
        }))
    }
}

pub const FIELD_META_SLOT_ID: &str = "flintrocks.slot_id";

/// Attach a slot id to a schema field's metadata.
pub fn field_with_slot_id(field: Field, slot_id: SlotId) -> Field {
    let mut metadata = field.metadata().clone();
    metadata.insert(FIELD_META_SLOT_ID.to_string(), slot_id.to_string());
    field.with_metadata(metadata)
}

/// Slot id recorded in a field's metadata, if any.
pub fn field_slot_id(field: &Field) -> Result<Option<SlotId>, String> {
    match field.metadata().get(FIELD_META_SLOT_ID) {
        Some(raw) => raw.parse::<SlotId>().map(Some),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::{ArrayRef, Int64Array, RecordBatch};
    use arrow::datatypes::{DataType, Field, Schema};

    use super::{Chunk, field_with_slot_id};
    use crate::common::ids::SlotId;

    fn int64_chunk(slot_id: u32, values: &[i64]) -> Chunk {
        let field = field_with_slot_id(
            Field::new("c0", DataType::Int64, true),
            SlotId::new(slot_id),
        );
        let schema = Arc::new(Schema::new(vec![field]));
        let array: ArrayRef = Arc::new(Int64Array::from(values.to_vec()));
        Chunk::try_new(RecordBatch::try_new(schema, vec![array]).unwrap()).unwrap()
    }

    #[test]
    fn test_column_by_slot_id() {
        let chunk = int64_chunk(7, &[1, 2, 3]);
        assert!(chunk.column_by_slot_id(SlotId::new(7)).is_ok());
        assert!(chunk.column_by_slot_id(SlotId::new(8)).is_err());
    }

    #[test]
    fn test_field_without_slot_metadata_is_rejected() {
        let schema = Arc::new(Schema::new(vec![Field::new("c0", DataType::Int64, true)]));
        let array: ArrayRef = Arc::new(Int64Array::from(vec![1]));
        let batch = RecordBatch::try_new(schema, vec![array]).unwrap();
        assert!(Chunk::try_new(batch).is_err());
    }

    #[test]
    fn test_duplicate_slot_id_is_rejected() {
        let fields = vec![
            field_with_slot_id(Field::new("a", DataType::Int64, true), SlotId::new(3)),
            field_with_slot_id(Field::new("b", DataType::Int64, true), SlotId::new(3)),
        ];
        let schema = Arc::new(Schema::new(fields));
        let columns: Vec<ArrayRef> = vec![
            Arc::new(Int64Array::from(vec![1])),
            Arc::new(Int64Array::from(vec![2])),
        ];
        let batch = RecordBatch::try_new(schema, columns).unwrap();
        assert!(Chunk::try_new(batch).is_err());
    }

    #[test]
    fn test_filter_by_mask() {
        let chunk = int64_chunk(1, &[10, 20, 30]);
        let filtered = chunk
            .clone()
            .filter_by_mask(&[true, false, true])
            .unwrap()
            .unwrap();
        assert_eq!(filtered.len(), 2);

        assert!(chunk.clone().filter_by_mask(&[false; 3]).unwrap().is_none());
        assert_eq!(chunk.filter_by_mask(&[true; 3]).unwrap().unwrap().len(), 3);
    }
}
