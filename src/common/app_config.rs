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
use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static CONFIG: OnceLock<FlintrocksConfig> = OnceLock::new();

fn default_log_level() -> String {
    "info".to_string()
}

fn default_in_filter_max_conditions() -> usize {
    1024
}

fn default_bloom_filter_row_limit() -> usize {
    1_024_000
}

pub fn init_from_path(path: impl AsRef<Path>) -> Result<&'static FlintrocksConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = path.as_ref().to_path_buf();
    let cfg = FlintrocksConfig::load_from_file(&path)?;
    let _ = CONFIG.set(cfg);
    Ok(CONFIG.get().expect("CONFIG set"))
}

pub fn init_from_env_or_default() -> Result<&'static FlintrocksConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = config_path_from_env_or_default()?;
    let cfg = FlintrocksConfig::load_from_file(&path)?;
    let _ = CONFIG.set(cfg);
    Ok(CONFIG.get().expect("CONFIG set"))
}

pub fn config() -> Result<&'static FlintrocksConfig> {
    init_from_env_or_default()
}

fn config_path_from_env_or_default() -> Result<PathBuf> {
    if let Ok(p) = std::env::var("FLINTROCKS_CONFIG") {
        if !p.trim().is_empty() {
            return Ok(PathBuf::from(p));
        }
    }

    let candidates = [PathBuf::from("flintrocks.toml")];
    for p in candidates {
        if p.exists() {
            return Ok(p);
        }
    }

    Err(anyhow!(
        "missing config file: set $FLINTROCKS_CONFIG or create ./flintrocks.toml"
    ))
}

#[derive(Clone, Deserialize)]
pub struct FlintrocksConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional full tracing EnvFilter expression.
    /// If set, this takes precedence over `log_level`.
    /// Example: "flintrocks=debug"
    #[serde(default)]
    pub log_filter: Option<String>,

    #[serde(default)]
    pub runtime: RuntimeConfig,
}

#[derive(Clone, Deserialize)]
pub struct RuntimeConfig {
    /// Cardinality limit above which a build driver stops emitting a runtime
    /// IN-filter and the merger refuses to union partial IN-filters.
    #[serde(default = "default_in_filter_max_conditions")]
    pub in_filter_max_conditions: usize,

    /// Total build-row cap above which local-only runtime bloom filters are
    /// not constructed. Filters with remote consumers ignore the cap.
    #[serde(default = "default_bloom_filter_row_limit")]
    pub bloom_filter_row_limit: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            in_filter_max_conditions: default_in_filter_max_conditions(),
            bloom_filter_row_limit: default_bloom_filter_row_limit(),
        }
    }
}

impl FlintrocksConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("read config file: {}", path.display()))?;
        let cfg: FlintrocksConfig =
            toml::from_str(&s).with_context(|| format!("parse toml: {}", path.display()))?;
        Ok(cfg)
    }

    pub fn effective_log_filter(&self) -> String {
        match &self.log_filter {
            Some(filter) if !filter.trim().is_empty() => filter.clone(),
            _ => self.log_level.clone(),
        }
    }
}
