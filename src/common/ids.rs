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
use std::fmt;
use std::str::FromStr;

/// Column slot identifier assigned during plan lowering.
///
/// Execution code never interprets the value; it only serves as a key into
/// chunk schemas and runtime-filter specs.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct SlotId(u32);

impl SlotId {
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for SlotId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.parse::<u32>() {
            Ok(value) => Ok(Self(value)),
            Err(e) => Err(format!("cannot parse slot id from '{}': {}", s, e)),
        }
    }
}

/// Tuple layout identifier from a plan's row descriptor.
///
/// A descendant node and its ancestor may reference the same physical column
/// through different `(tuple id, slot id)` pairs; runtime in-filter rewriting
/// translates between the two coordinate systems.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct TupleId(u32);

impl TupleId {
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for TupleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// 128-bit identifier used for query and fragment-instance ids.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct UniqueId {
    pub hi: i64,
    pub lo: i64,
}

impl UniqueId {
    pub const fn new(hi: i64, lo: i64) -> Self {
        Self { hi, lo }
    }
}

impl fmt::Display for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}-{:x}", self.hi, self.lo)
    }
}

#[cfg(test)]
mod tests {
    use super::SlotId;

    #[test]
    fn test_slot_id_round_trips_through_display() {
        let slot = SlotId::new(42);
        assert_eq!(slot.to_string().parse::<SlotId>().unwrap(), slot);
    }

    #[test]
    fn test_slot_id_parse_error_keeps_reason() {
        let err = "not-a-number".parse::<SlotId>().unwrap_err();
        assert!(err.contains("not-a-number"));
        assert!(err.contains("invalid digit"));
    }
}
