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
//! Bloom-based runtime membership filter.
//!
//! Responsibilities:
//! - Implements a split block bloom filter over typed Arrow columns.
//! - Supports capacity-sized construction by the filter merger and
//!   probe-time membership pruning.
//!
//! Key exported interfaces:
//! - Types: `RuntimeBloomFilter`.
//!
//! Current limitations:
//! - Only the build-key types emitted by join plan lowering are hashable;
//!   `create` returns `None` for anything else.

use arrow::array::{
    Array, ArrayRef, Date32Array, Decimal128Array, Float64Array, Int8Array, Int16Array,
    Int32Array, Int64Array, StringArray,
};
use arrow::datatypes::DataType;

const CRC_HASH_SEED1: u32 = 0x811C9DC5;
const SALT: [u32; 8] = [
    0x47b6137b, 0x44974d91, 0x8824ad5b, 0xa2b7289d, 0x705495c7, 0x2df1424b, 0x9efc4947, 0x5c6bfb31,
];

/// Split block bloom filter: 32-byte buckets of eight 32-bit lanes, one bit
/// set per lane per key.
#[derive(Clone, Debug)]
pub(in crate::exec::runtime_filter) struct BlockBloomFilter {
    log_num_buckets: i32,
    directory_mask: u32,
    directory: Vec<u32>,
}

impl BlockBloomFilter {
    pub(in crate::exec::runtime_filter) fn with_expected_elements(num_elements: u64) -> Self {
        let nums = num_elements.max(1);
        let log_heap_space = (nums as f64).log2().ceil() as i32;
        let log_num_buckets = std::cmp::max(1, log_heap_space - 5);
        let directory_mask = ((1u64 << std::cmp::min(63, log_num_buckets as u32)) - 1) as u32;
        let bucket_count = 1usize << log_num_buckets.max(1);
        let directory = vec![0u32; bucket_count * 8];
        Self {
            log_num_buckets,
            directory_mask,
            directory,
        }
    }

    pub(in crate::exec::runtime_filter) fn is_usable(&self) -> bool {
        !self.directory.is_empty()
    }

    fn insert_hash(&mut self, hash: u64) {
        if !self.is_usable() {
            return;
        }
        let bucket_idx = (hash as u32) & self.directory_mask;
        let key = (hash >> (self.log_num_buckets as u32)) as u32;
        let masks = make_mask(key);
        let base = bucket_idx as usize * 8;
        for i in 0..8 {
            self.directory[base + i] |= masks[i];
        }
    }

    fn test_hash(&self, hash: u64) -> bool {
        if !self.is_usable() {
            return true;
        }
        let bucket_idx = (hash as u32) & self.directory_mask;
        let key = (hash >> (self.log_num_buckets as u32)) as u32;
        let masks = make_mask(key);
        let base = bucket_idx as usize * 8;
        for i in 0..8 {
            if (self.directory[base + i] & masks[i]) == 0 {
                return false;
            }
        }
        true
    }
}

fn make_mask(key: u32) -> [u32; 8] {
    let mut masks = [0u32; 8];
    for i in 0..8 {
        let mut v = key.wrapping_mul(SALT[i]);
        v >>= 27;
        masks[i] = 1u32 << v;
    }
    masks
}

fn phmap_mix_8(a: u64) -> u64 {
    let k: u64 = 0xde5fb9d2630458e9;
    let prod = (a as u128) * (k as u128);
    let l = prod as u64;
    let h = (prod >> 64) as u64;
    h.wrapping_add(l)
}

fn slice_hash(data: &[u8]) -> u64 {
    phmap_mix_8(crc32c::crc32c_append(CRC_HASH_SEED1, data) as u64)
}

/// Per-row hashes of a typed column; `None` marks a null row.
fn hash_array(array: &ArrayRef) -> Result<Vec<Option<u64>>, String> {
    let len = array.len();
    let mut hashes = Vec::with_capacity(len);
    match array.data_type() {
        DataType::Int8 => {
            let arr = array
                .as_any()
                .downcast_ref::<Int8Array>()
                .ok_or_else(|| "runtime bloom filter type mismatch for Int8".to_string())?;
            for i in 0..len {
                if arr.is_null(i) {
                    hashes.push(None);
                } else {
                    hashes.push(Some(phmap_mix_8(arr.value(i) as i64 as u64)));
                }
            }
        }
        DataType::Int16 => {
            let arr = array
                .as_any()
                .downcast_ref::<Int16Array>()
                .ok_or_else(|| "runtime bloom filter type mismatch for Int16".to_string())?;
            for i in 0..len {
                if arr.is_null(i) {
                    hashes.push(None);
                } else {
                    hashes.push(Some(phmap_mix_8(arr.value(i) as i64 as u64)));
                }
            }
        }
        DataType::Int32 => {
            let arr = array
                .as_any()
                .downcast_ref::<Int32Array>()
                .ok_or_else(|| "runtime bloom filter type mismatch for Int32".to_string())?;
            for i in 0..len {
                if arr.is_null(i) {
                    hashes.push(None);
                } else {
                    hashes.push(Some(phmap_mix_8(arr.value(i) as i64 as u64)));
                }
            }
        }
        DataType::Int64 => {
            let arr = array
                .as_any()
                .downcast_ref::<Int64Array>()
                .ok_or_else(|| "runtime bloom filter type mismatch for Int64".to_string())?;
            for i in 0..len {
                if arr.is_null(i) {
                    hashes.push(None);
                } else {
                    hashes.push(Some(phmap_mix_8(arr.value(i) as u64)));
                }
            }
        }
        DataType::Float64 => {
            let arr = array
                .as_any()
                .downcast_ref::<Float64Array>()
                .ok_or_else(|| "runtime bloom filter type mismatch for Float64".to_string())?;
            for i in 0..len {
                if arr.is_null(i) {
                    hashes.push(None);
                } else {
                    hashes.push(Some(phmap_mix_8(arr.value(i).to_bits())));
                }
            }
        }
        DataType::Date32 => {
            let arr = array
                .as_any()
                .downcast_ref::<Date32Array>()
                .ok_or_else(|| "runtime bloom filter type mismatch for Date32".to_string())?;
            for i in 0..len {
                if arr.is_null(i) {
                    hashes.push(None);
                } else {
                    hashes.push(Some(phmap_mix_8(arr.value(i) as i64 as u64)));
                }
            }
        }
        DataType::Utf8 => {
            let arr = array
                .as_any()
                .downcast_ref::<StringArray>()
                .ok_or_else(|| "runtime bloom filter type mismatch for Utf8".to_string())?;
            for i in 0..len {
                if arr.is_null(i) {
                    hashes.push(None);
                } else {
                    hashes.push(Some(slice_hash(arr.value(i).as_bytes())));
                }
            }
        }
        DataType::Decimal128(_, _) => {
            let arr = array
                .as_any()
                .downcast_ref::<Decimal128Array>()
                .ok_or_else(|| "runtime bloom filter type mismatch for Decimal128".to_string())?;
            for i in 0..len {
                if arr.is_null(i) {
                    hashes.push(None);
                } else {
                    hashes.push(Some(slice_hash(&arr.value(i).to_le_bytes())));
                }
            }
        }
        other => {
            return Err(format!(
                "unsupported runtime bloom filter type: {:?}",
                other
            ));
        }
    }
    Ok(hashes)
}

fn is_supported_build_type(data_type: &DataType) -> bool {
    matches!(
        data_type,
        DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::Float64
            | DataType::Date32
            | DataType::Utf8
            | DataType::Decimal128(_, _)
    )
}

#[derive(Clone, Debug)]
/// Typed runtime bloom filter built from join build keys.
pub struct RuntimeBloomFilter {
    build_type: DataType,
    has_null: bool,
    join_mode: i8,
    size: u64,
    bf: Option<BlockBloomFilter>,
}

impl RuntimeBloomFilter {
    /// `None` when the build type cannot be hashed; callers skip the
    /// descriptor in that case.
    pub fn create(build_type: &DataType) -> Option<Self> {
        if !is_supported_build_type(build_type) {
            return None;
        }
        Some(Self {
            build_type: build_type.clone(),
            has_null: false,
            join_mode: 0,
            size: 0,
            bf: None,
        })
    }

    /// Size the filter for an expected total row count. A zero row count
    /// leaves the filter empty, which prunes nothing.
    pub fn init(&mut self, row_count: usize) {
        self.size = row_count as u64;
        self.bf = if row_count > 0 {
            Some(BlockBloomFilter::with_expected_elements(row_count as u64))
        } else {
            None
        };
    }

    pub fn set_join_mode(&mut self, join_mode: i8) {
        self.join_mode = join_mode;
    }

    pub fn build_type(&self) -> &DataType {
        &self.build_type
    }

    pub fn join_mode(&self) -> i8 {
        self.join_mode
    }

    pub fn has_null(&self) -> bool {
        self.has_null
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.bf.is_none()
    }

    /// Insert the non-null values of `array`. With `eq_null`, null build keys
    /// match null probe keys, so null presence is recorded instead of dropped.
    pub fn insert_array(&mut self, array: &ArrayRef, eq_null: bool) -> Result<(), String> {
        if array.data_type() != &self.build_type {
            return Err(format!(
                "runtime bloom filter build type mismatch: expected={:?} actual={:?}",
                self.build_type,
                array.data_type()
            ));
        }
        let Some(bf) = self.bf.as_mut() else {
            return Ok(());
        };
        let hashes = hash_array(array)?;
        let mut saw_null = false;
        for hash in hashes {
            match hash {
                Some(hash) => bf.insert_hash(hash),
                None => saw_null = true,
            }
        }
        if saw_null && eq_null {
            self.has_null = true;
        }
        Ok(())
    }

    /// Clear `keep[i]` for every row that cannot be in the build side. An
    /// empty filter prunes nothing.
    pub fn might_contain_array(&self, array: &ArrayRef, keep: &mut [bool]) -> Result<(), String> {
        let Some(bf) = self.bf.as_ref() else {
            return Ok(());
        };
        if keep.len() != array.len() {
            return Err("runtime bloom filter selection size mismatch".to_string());
        }
        let hashes = hash_array(array)?;
        for (i, hash) in hashes.iter().enumerate() {
            if !keep[i] {
                continue;
            }
            match hash {
                Some(hash) => {
                    if !bf.test_hash(*hash) {
                        keep[i] = false;
                    }
                }
                None => {
                    keep[i] = self.has_null;
                }
            }
        }
        Ok(())
    }
}
