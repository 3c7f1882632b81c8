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
//! Runtime profile tree for execution-time observability.
//!
//! Responsibilities:
//! - Collects named counters, info strings and child profiles per operator.
//! - Shared by cloning; all mutation goes through interior locks.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CounterUnit {
    Unit,
    Bytes,
    TimeNs,
}

#[derive(Clone, Debug)]
struct Counter {
    unit: CounterUnit,
    value: Arc<AtomicI64>,
}

#[derive(Clone, Debug)]
pub struct RuntimeProfile {
    inner: Arc<RuntimeProfileInner>,
}

#[derive(Debug)]
struct RuntimeProfileInner {
    name: String,
    counters: Mutex<HashMap<String, Counter>>,
    info_strings: Mutex<BTreeMap<String, String>>,
    children: Mutex<Vec<RuntimeProfile>>,
}

impl RuntimeProfile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(RuntimeProfileInner {
                name: name.into(),
                counters: Mutex::new(HashMap::new()),
                info_strings: Mutex::new(BTreeMap::new()),
                children: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn add_counter(&self, name: impl Into<String>, unit: CounterUnit) {
        let mut guard = self.inner.counters.lock().expect("runtime profile lock");
        guard.entry(name.into()).or_insert_with(|| Counter {
            unit,
            value: Arc::new(AtomicI64::new(0)),
        });
    }

    pub fn counter_add(&self, name: &str, unit: CounterUnit, delta: i64) {
        let counter = self.get_or_create_counter(name, unit);
        counter.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn counter_set(&self, name: &str, unit: CounterUnit, value: i64) {
        let counter = self.get_or_create_counter(name, unit);
        counter.value.store(value, Ordering::Relaxed);
    }

    pub fn counter_value(&self, name: &str) -> Option<i64> {
        let guard = self.inner.counters.lock().expect("runtime profile lock");
        guard.get(name).map(|c| c.value.load(Ordering::Relaxed))
    }

    pub fn counter_unit(&self, name: &str) -> Option<CounterUnit> {
        let guard = self.inner.counters.lock().expect("runtime profile lock");
        guard.get(name).map(|c| c.unit)
    }

    pub fn add_info_string(&self, key: impl Into<String>, value: impl Into<String>) {
        let mut guard = self
            .inner
            .info_strings
            .lock()
            .expect("runtime profile lock");
        guard.insert(key.into(), value.into());
    }

    pub fn info_string(&self, key: &str) -> Option<String> {
        let guard = self
            .inner
            .info_strings
            .lock()
            .expect("runtime profile lock");
        guard.get(key).cloned()
    }

    /// Get or create the child profile with the given name.
    pub fn child(&self, name: impl Into<String>) -> RuntimeProfile {
        let name = name.into();
        let mut children = self.inner.children.lock().expect("runtime profile lock");
        if let Some(existing) = children.iter().find(|c| c.name() == name) {
            return existing.clone();
        }
        let child = RuntimeProfile::new(name);
        children.push(child.clone());
        child
    }

    pub fn children(&self) -> Vec<RuntimeProfile> {
        self.inner
            .children
            .lock()
            .expect("runtime profile lock")
            .clone()
    }

    fn get_or_create_counter(&self, name: &str, unit: CounterUnit) -> Counter {
        let mut guard = self.inner.counters.lock().expect("runtime profile lock");
        guard
            .entry(name.to_string())
            .or_insert_with(|| Counter {
                unit,
                value: Arc::new(AtomicI64::new(0)),
            })
            .clone()
    }
}
