// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process configuration.
//!
//! Sources are merged with figment, lowest priority first:
//! 1. Built-in defaults
//! 2. An optional YAML file (`loggle.yaml` unless `LOGGLE_CONFIG` points elsewhere)
//! 3. `LOGGLE_` prefixed environment variables, `__` separating nested keys,
//!    e.g. `LOGGLE_EGRESS__KAFKA__TOPIC_NAME=logs`

use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::Deserialize;
use tracing::debug;

use loggle::config::{EgressConfig, LoggerOptions, TelemetryLimits};
use loggle::errors::ConfigError;

pub const ENV_PREFIX: &str = "LOGGLE_";
pub const CONFIG_PATH_ENV: &str = "LOGGLE_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "loggle.yaml";
pub const DEFAULT_RECEIVER_HOST: &str = "0.0.0.0";
pub const DEFAULT_RECEIVER_PORT: u16 = 4318;
pub const DEFAULT_MAX_REQUEST_CONTENT_LENGTH: usize = 4 * 1024 * 1024;

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    pub host: String,
    pub port: u16,
    pub max_request_content_length: usize,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_RECEIVER_HOST.to_string(),
            port: DEFAULT_RECEIVER_PORT,
            max_request_content_length: DEFAULT_MAX_REQUEST_CONTENT_LENGTH,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: String,
    pub receiver: ReceiverConfig,
    pub limits: TelemetryLimits,
    pub egress: EgressConfig,
    /// The server's own log lines shipped through the egress sink. Off unless a `self_logs`
    /// section is configured.
    pub self_logs: LoggerOptions,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            receiver: ReceiverConfig::default(),
            limits: TelemetryLimits::default(),
            egress: EgressConfig::default(),
            self_logs: LoggerOptions {
                enabled: false,
                ..LoggerOptions::default()
            },
        }
    }
}

impl Config {
    /// Loads and validates configuration from `path` (when given) and the environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::new();
        if let Some(path) = path {
            debug!("Loading configuration from {}", path.display());
            figment = figment.merge(Yaml::file(path));
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: Config = figment
            .extract()
            .map_err(|e| ConfigError::Load(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Path named by `LOGGLE_CONFIG`, or `loggle.yaml` in the working directory
    pub fn default_path() -> PathBuf {
        std::env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.receiver.max_request_content_length == 0 {
            return Err(ConfigError::Invalid(
                "receiver.max_request_content_length must be greater than 0".to_string(),
            ));
        }
        self.limits.validate()?;
        self.egress.validate()
    }
}
