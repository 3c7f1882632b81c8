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
//! Runtime-filter module exports.
//!
//! Build drivers accumulate partial filters ([`LocalInFilterSet`],
//! [`BloomFilterBuildParam`]), the [`PartialRuntimeFilterMerger`] combines
//! them on the last builder's arrival, and probe operators consume the
//! merged result through the shared [`RefCountedRuntimeFilterProbeCollector`].

mod bloom;
mod descriptor;
mod local;
mod merger;
mod probe;
mod publisher;

pub use bloom::RuntimeBloomFilter;
pub use descriptor::{BloomFilterBuildDescriptor, BloomFilterBuildParam};
pub use local::{JoinRuntimeFilterSpec, LocalInFilterSet};
pub use merger::PartialRuntimeFilterMerger;
pub use probe::{
    RefCountedRuntimeFilterProbeCollector, RowDescriptor, RuntimeFilterProbeCollector,
    RuntimeFilterProbeDescriptor,
};
pub use publisher::{RuntimeFilterBuildPublisher, build_bloom_descriptors};
