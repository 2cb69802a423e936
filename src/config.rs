// Copyright 2026 BadCompany
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::harness_core::constants::{config as env_keys, timeouts};
use crate::harness_core::errors::HarnessError;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarnessConfig {
    /// Fast-iteration mode: keep the association (and the engine runtime)
    /// alive between iterations instead of tearing everything down.
    pub reuse_association: bool,
    pub explicit_eor: bool,
    pub interleaving: bool,
    pub stream_reset: bool,
    pub finish_timeout_ms: u64,
    pub log_level: String,
    pub log_format: String, // "json" or "text"
}

fn env_flag(key: &str) -> bool {
    env::var(key)
        .map(|v| parse_flag(&v))
        .unwrap_or(false)
}

fn parse_flag(v: &str) -> bool {
    v.eq_ignore_ascii_case("true") || v == "1"
}

impl HarnessConfig {
    pub fn from_env() -> Result<Self, HarnessError> {
        let finish_timeout_ms = match env::var(env_keys::ENV_FINISH_TIMEOUT_MS) {
            Ok(v) => v.trim().parse::<u64>().map_err(|e| {
                HarnessError::Config(format!(
                    "{} must be a number of milliseconds: {}",
                    env_keys::ENV_FINISH_TIMEOUT_MS,
                    e
                ))
            })?,
            Err(_) => timeouts::DEFAULT_FINISH_TIMEOUT_MS,
        };

        Ok(Self {
            reuse_association: env_flag(env_keys::ENV_REUSE_ASSOCIATION),
            explicit_eor: env_flag(env_keys::ENV_EXPLICIT_EOR),
            interleaving: env_flag(env_keys::ENV_INTERLEAVING),
            stream_reset: env_flag(env_keys::ENV_STREAM_RESET),
            finish_timeout_ms,
            log_level: env::var(env_keys::ENV_LOG_LEVEL).unwrap_or_else(|_| "info".to_string()),
            log_format: env::var(env_keys::ENV_LOG_FORMAT).unwrap_or_else(|_| "text".to_string()),
        })
    }

    /// Fast-iteration preset used by the fuzz targets and benches.
    pub fn fast() -> Self {
        Self {
            reuse_association: true,
            ..Self::default()
        }
    }

    pub fn finish_timeout(&self) -> Duration {
        Duration::from_millis(self.finish_timeout_ms)
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            reuse_association: false,
            explicit_eor: false,
            interleaving: false,
            stream_reset: false,
            finish_timeout_ms: timeouts::DEFAULT_FINISH_TIMEOUT_MS,
            log_level: "info".to_string(),
            log_format: "text".to_string(),
        }
    }
}
