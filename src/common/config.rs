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
use crate::flintrocks_config::config as flintrocks_app_config;

pub(crate) fn runtime_in_filter_max_conditions() -> usize {
    flintrocks_app_config()
        .ok()
        .map(|c| c.runtime.in_filter_max_conditions)
        .unwrap_or(1024)
}

pub(crate) fn runtime_bloom_filter_row_limit() -> usize {
    flintrocks_app_config()
        .ok()
        .map(|c| c.runtime.bloom_filter_row_limit)
        .unwrap_or(1_024_000)
}
