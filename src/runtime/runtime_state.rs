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
use std::sync::Arc;

use crate::common::ids::UniqueId;

/// RuntimeState is a per-fragment-instance execution context.
///
/// Today it mainly carries the query identity and the first-error latch;
/// more execution-time parameters can be migrated here over time.
#[derive(Clone, Debug, Default)]
pub struct RuntimeState {
    query_id: Option<UniqueId>,
    error_state: Arc<RuntimeErrorState>,
}

#[derive(Debug, Default)]
pub struct RuntimeErrorState {
    error: std::sync::Mutex<Option<String>>,
}

impl RuntimeErrorState {
    pub fn set_error(&self, err: String) {
        let mut guard = self.error.lock().expect("runtime error lock");
        if guard.is_none() {
            *guard = Some(err);
        }
    }

    pub fn error(&self) -> Option<String> {
        self.error.lock().expect("runtime error lock").clone()
    }
}

impl RuntimeState {
    pub fn with_query_id(query_id: UniqueId) -> Self {
        Self {
            query_id: Some(query_id),
            error_state: Arc::new(RuntimeErrorState::default()),
        }
    }

    pub fn query_id(&self) -> Option<UniqueId> {
        self.query_id
    }

    pub fn error_state(&self) -> &RuntimeErrorState {
        &self.error_state
    }

    pub fn set_error(&self, err: String) {
        self.error_state.set_error(err);
    }

    pub fn error(&self) -> Option<String> {
        self.error_state.error()
    }
}

#[cfg(test)]
mod tests {
    use super::RuntimeState;
    use crate::common::ids::UniqueId;

    #[test]
    fn test_first_error_wins() {
        let state = RuntimeState::with_query_id(UniqueId::new(1, 2));
        assert!(state.error().is_none());
        state.set_error("first".to_string());
        state.set_error("second".to_string());
        assert_eq!(state.error().as_deref(), Some("first"));
    }

    #[test]
    fn test_clone_shares_error_state() {
        let state = RuntimeState::default();
        let cloned = state.clone();
        cloned.set_error("boom".to_string());
        assert_eq!(state.error().as_deref(), Some("boom"));
    }
}
