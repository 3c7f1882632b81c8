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
//! Build-side bloom filter descriptors and partial build parameters.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use arrow::array::ArrayRef;
use arrow::datatypes::DataType;

use super::bloom::RuntimeBloomFilter;

/// Parameters used to build runtime bloom filters: one partial contribution
/// per builder per descriptor. `columns: None` marks a builder that could
/// not capture the key column.
#[derive(Clone, Debug)]
pub struct BloomFilterBuildParam {
    pub eq_null: bool,
    pub columns: Option<Vec<ArrayRef>>,
    pub ht_row_count: usize,
}

impl BloomFilterBuildParam {
    pub fn new(eq_null: bool, columns: Option<Vec<ArrayRef>>, ht_row_count: usize) -> Self {
        Self {
            eq_null,
            columns,
            ht_row_count,
        }
    }
}

/// Build specification of one runtime bloom filter, shared by every builder
/// of a join node. The filter slot is populated by the last-arriving builder
/// during merge and stays empty when construction is abandoned.
#[derive(Debug)]
pub struct BloomFilterBuildDescriptor {
    filter_id: i32,
    build_expr_type: DataType,
    join_mode: i8,
    has_consumer: bool,
    has_remote_targets: bool,
    is_pipeline: AtomicBool,
    filter: Mutex<Option<RuntimeBloomFilter>>,
}

impl BloomFilterBuildDescriptor {
    pub fn new(
        filter_id: i32,
        build_expr_type: DataType,
        join_mode: i8,
        has_consumer: bool,
        has_remote_targets: bool,
    ) -> Self {
        Self {
            filter_id,
            build_expr_type,
            join_mode,
            has_consumer,
            has_remote_targets,
            is_pipeline: AtomicBool::new(false),
            filter: Mutex::new(None),
        }
    }

    pub fn filter_id(&self) -> i32 {
        self.filter_id
    }

    pub fn build_expr_type(&self) -> &DataType {
        &self.build_expr_type
    }

    pub fn join_mode(&self) -> i8 {
        self.join_mode
    }

    pub fn has_consumer(&self) -> bool {
        self.has_consumer
    }

    pub fn has_remote_targets(&self) -> bool {
        self.has_remote_targets
    }

    pub fn is_pipeline(&self) -> bool {
        self.is_pipeline.load(Ordering::Acquire)
    }

    pub fn set_is_pipeline(&self, value: bool) {
        self.is_pipeline.store(value, Ordering::Release);
    }

    pub fn install_filter(&self, filter: RuntimeBloomFilter) {
        let mut guard = self.filter.lock().expect("bloom filter descriptor lock");
        *guard = Some(filter);
    }

    pub fn clear_filter(&self) {
        let mut guard = self.filter.lock().expect("bloom filter descriptor lock");
        *guard = None;
    }

    pub fn has_filter(&self) -> bool {
        self.filter
            .lock()
            .expect("bloom filter descriptor lock")
            .is_some()
    }

    /// Snapshot of the installed filter for probe-side installation.
    pub fn filter(&self) -> Option<RuntimeBloomFilter> {
        self.filter
            .lock()
            .expect("bloom filter descriptor lock")
            .clone()
    }

    /// Insert a builder's captured key columns into the installed filter.
    /// A descriptor without a filter or a param without columns is skipped.
    pub(crate) fn fill_from_param(&self, param: &BloomFilterBuildParam) -> Result<(), String> {
        let mut guard = self.filter.lock().expect("bloom filter descriptor lock");
        let Some(filter) = guard.as_mut() else {
            return Ok(());
        };
        let Some(columns) = param.columns.as_ref() else {
            return Ok(());
        };
        for column in columns {
            filter.insert_array(column, param.eq_null)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::{ArrayRef, Int64Array, StringArray};
    use arrow::datatypes::DataType;

    use super::{BloomFilterBuildDescriptor, BloomFilterBuildParam};
    use crate::exec::runtime_filter::RuntimeBloomFilter;

    #[test]
    fn test_fill_skips_descriptor_without_filter() {
        let desc = BloomFilterBuildDescriptor::new(1, DataType::Int64, 2, true, false);
        let columns: Vec<ArrayRef> = vec![Arc::new(Int64Array::from(vec![1, 2]))];
        let param = BloomFilterBuildParam::new(false, Some(columns), 2);
        desc.fill_from_param(&param).unwrap();
        assert!(!desc.has_filter());
    }

    #[test]
    fn test_fill_type_mismatch_errors() {
        let desc = BloomFilterBuildDescriptor::new(1, DataType::Int64, 2, true, false);
        let mut filter = RuntimeBloomFilter::create(&DataType::Int64).unwrap();
        filter.init(4);
        desc.install_filter(filter);

        let columns: Vec<ArrayRef> = vec![Arc::new(StringArray::from(vec!["a"]))];
        let param = BloomFilterBuildParam::new(false, Some(columns), 1);
        assert!(desc.fill_from_param(&param).is_err());
    }

    #[test]
    fn test_is_pipeline_flag() {
        let desc = BloomFilterBuildDescriptor::new(3, DataType::Int32, 1, false, true);
        assert!(!desc.is_pipeline());
        desc.set_is_pipeline(true);
        assert!(desc.is_pipeline());
    }
}
