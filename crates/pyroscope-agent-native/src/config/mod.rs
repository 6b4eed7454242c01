//! Configuration Module
//!
//! This module turns loosely-typed user input into the immutable [`Config`] the agent
//! runs with. Host bindings hand over whatever their users set (often with empty strings
//! standing in for "unset"), environment variables may override some of it, and the
//! resolver fills in everything else.
//!
//! ## Configuration Priority
//!
//! Sources are applied in the following order (later sources override earlier):
//!
//! 1. **Defaults** - see the table below
//! 2. **Environment variables** - `PYROSCOPE_*` variables ([`env::EnvConfigSource`])
//! 3. **Caller input** - the [`RawConfig`] passed to `initialize`
//! 4. **Adhoc override** - `PYROSCOPE_ADHOC_SERVER_ADDRESS` replaces the server address
//!    after everything else, so `pyroscope adhoc` can redirect an unmodified program
//!
//! ## Defaults
//!
//! | Field | Default |
//! |---|---|
//! | application name | empty string |
//! | server address | `http://localhost:4040` |
//! | sample rate | 100 |
//! | detect subprocesses | false |
//! | on-CPU only | true |
//! | report pid / thread id / thread name | false |
//! | autoinstrument | true |
//! | log level | `error` |
//! | compression | `gzip` |
//! | report encoding | `pprof` |
//! | tags | empty |
//!
//! ## Edge Cases and Behaviors
//!
//! - **Resolution never fails.** Malformed values are logged and ignored, and the field
//!   falls back to its default.
//! - **Empty server address**: an explicitly empty address is passed through as empty;
//!   the sampler decides whether it can work with it.
//! - **Sample rate 0**: treated as unset (100 Hz).
//! - **Empty tenant id**: treated as unset.
//! - **Tags**: accepted as a map or as the legacy `key=value,key=value` string.

pub mod compression;
pub mod credentials;
pub mod env;
pub mod http_headers;
pub mod log_level;
pub mod report_encoding;

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Deserializer, Serialize};
use serde_aux::prelude::deserialize_bool_from_anything;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error};

use crate::config::{
    compression::Compression, credentials::Credentials, env::EnvConfigSource,
    http_headers::parse_http_headers_json, log_level::LogLevel, report_encoding::ReportEncoding,
};
use crate::tags::legacy::string_to_tags;

pub const DEFAULT_SERVER_ADDRESS: &str = "http://localhost:4040";
pub const DEFAULT_SAMPLE_RATE: u32 = 100;
pub const ADHOC_SERVER_ADDRESS_ENV: &str = "PYROSCOPE_ADHOC_SERVER_ADDRESS";

/// Overwrites `$config.$field` with `$source.$field` when the source has a value.
macro_rules! merge_option {
    ($config:expr, $source:expr, $($field:ident),+ $(,)?) => {
        $(
            if $source.$field.is_some() {
                $config.$field.clone_from(&$source.$field);
            }
        )+
    };
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    ParseError(String),
}

/// A layer of configuration input. Every field is optional; `None` means "this layer
/// has nothing to say".
///
/// Field deserializers are lenient: a value of the wrong shape is logged and treated as
/// `None` so one bad variable never discards the rest of the layer.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct RawConfig {
    #[serde(deserialize_with = "deserialize_string_or_int")]
    pub application_name: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub server_address: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub auth_token: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub basic_auth_username: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub basic_auth_password: Option<String>,
    #[serde(deserialize_with = "deserialize_option_lossless")]
    pub sample_rate: Option<u32>,
    #[serde(deserialize_with = "deserialize_optional_bool_from_anything")]
    pub detect_subprocesses: Option<bool>,
    #[serde(deserialize_with = "deserialize_optional_bool_from_anything")]
    pub oncpu: Option<bool>,
    #[serde(deserialize_with = "deserialize_optional_bool_from_anything")]
    pub report_pid: Option<bool>,
    #[serde(deserialize_with = "deserialize_optional_bool_from_anything")]
    pub report_thread_id: Option<bool>,
    #[serde(deserialize_with = "deserialize_optional_bool_from_anything")]
    pub report_thread_name: Option<bool>,
    #[serde(deserialize_with = "deserialize_optional_bool_from_anything")]
    pub autoinstrument: Option<bool>,
    pub log_level: Option<LogLevel>,
    pub compression: Option<Compression>,
    pub report_encoding: Option<ReportEncoding>,
    #[serde(deserialize_with = "deserialize_string_or_int")]
    pub tenant_id: Option<String>,
    #[serde(deserialize_with = "deserialize_http_headers")]
    pub http_headers: Option<HashMap<String, String>>,
    #[serde(deserialize_with = "deserialize_tags")]
    pub tags: Option<BTreeMap<String, String>>,
}

impl RawConfig {
    /// Applies every field `other` sets on top of `self`.
    pub fn merge_from(&mut self, other: &RawConfig) {
        merge_option!(
            self,
            other,
            application_name,
            server_address,
            auth_token,
            basic_auth_username,
            basic_auth_password,
            sample_rate,
            detect_subprocesses,
            oncpu,
            report_pid,
            report_thread_id,
            report_thread_name,
            autoinstrument,
            log_level,
            compression,
            report_encoding,
            tenant_id,
            http_headers,
            tags,
        );
    }
}

/// Fully resolved agent configuration.
///
/// Built once per `initialize` call and never mutated afterwards. Equality is what makes
/// a repeated `initialize` with the same settings a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Config {
    pub application_name: String,
    pub server_address: String,
    pub credentials: Credentials,
    /// Sampling frequency in Hz. Always positive.
    pub sample_rate: u32,
    pub detect_subprocesses: bool,
    pub oncpu: bool,
    pub report_pid: bool,
    pub report_thread_id: bool,
    pub report_thread_name: bool,
    pub autoinstrument: bool,
    pub log_level: LogLevel,
    pub compression: Compression,
    pub report_encoding: ReportEncoding,
    pub tenant_id: Option<String>,
    #[serde(skip_serializing)]
    pub http_headers: BTreeMap<String, String>,
    /// Initial global tags, applied process-wide while the agent runs.
    pub tags: BTreeMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        resolve(&RawConfig::default())
    }
}

impl Config {
    /// Numeric severity of the configured log level (`trace`=10 … `error`=50).
    #[must_use]
    pub const fn log_severity(&self) -> u32 {
        self.log_level.severity()
    }
}

/// Resolves one layer of raw input into a complete [`Config`].
///
/// This is a pure function: it reads no environment and never fails.
#[must_use]
pub fn resolve(raw: &RawConfig) -> Config {
    let sample_rate = match raw.sample_rate {
        Some(0) => {
            debug!("Sample rate 0 is not usable, using {DEFAULT_SAMPLE_RATE}Hz");
            DEFAULT_SAMPLE_RATE
        }
        Some(rate) => rate,
        None => DEFAULT_SAMPLE_RATE,
    };

    Config {
        application_name: raw.application_name.clone().unwrap_or_default(),
        server_address: raw
            .server_address
            .clone()
            .unwrap_or_else(|| DEFAULT_SERVER_ADDRESS.to_string()),
        credentials: Credentials::from_parts(
            raw.auth_token.as_deref(),
            raw.basic_auth_username.as_deref(),
            raw.basic_auth_password.as_deref(),
        ),
        sample_rate,
        detect_subprocesses: raw.detect_subprocesses.unwrap_or(false),
        oncpu: raw.oncpu.unwrap_or(true),
        report_pid: raw.report_pid.unwrap_or(false),
        report_thread_id: raw.report_thread_id.unwrap_or(false),
        report_thread_name: raw.report_thread_name.unwrap_or(false),
        autoinstrument: raw.autoinstrument.unwrap_or(true),
        log_level: raw.log_level.unwrap_or_default(),
        compression: raw.compression.unwrap_or_default(),
        report_encoding: raw.report_encoding.unwrap_or_default(),
        tenant_id: raw
            .tenant_id
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string),
        http_headers: raw
            .http_headers
            .as_ref()
            .map(|h| h.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default(),
        tags: raw.tags.clone().unwrap_or_default(),
    }
}

#[allow(clippy::module_name_repetitions)]
pub trait ConfigSource {
    fn load(&self, config: &mut RawConfig) -> Result<(), ConfigError>;
}

/// Caller input is itself a source: it overrides whatever earlier layers set.
impl ConfigSource for RawConfig {
    fn load(&self, config: &mut RawConfig) -> Result<(), ConfigError> {
        config.merge_from(self);
        Ok(())
    }
}

#[derive(Default)]
#[allow(clippy::module_name_repetitions)]
pub struct ConfigBuilder {
    sources: Vec<Box<dyn ConfigSource>>,
    raw: RawConfig,
}

#[allow(clippy::module_name_repetitions)]
impl ConfigBuilder {
    #[must_use]
    pub fn add_source(mut self, source: Box<dyn ConfigSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn build(&mut self) -> Config {
        let mut failed_sources = 0;
        for source in &self.sources {
            match source.load(&mut self.raw) {
                Ok(()) => (),
                Err(e) => {
                    error!("Failed to load config: {}", e);
                    failed_sources += 1;
                }
            }
        }

        if !self.sources.is_empty() && failed_sources == self.sources.len() {
            debug!("All sources failed to load config, using default config.");
        }

        let mut config = resolve(&self.raw);

        if let Ok(adhoc) = std::env::var(ADHOC_SERVER_ADDRESS_ENV) {
            if adhoc.trim().is_empty() {
                debug!("{ADHOC_SERVER_ADDRESS_ENV} is set but empty, ignoring");
            } else {
                debug!("Using adhoc server address {}", adhoc);
                config.server_address = adhoc;
            }
        }

        config
    }
}

/// Loads configuration in priority order: defaults, `PYROSCOPE_*` environment variables,
/// then `caller`.
#[must_use]
pub fn get_config(caller: &RawConfig) -> Config {
    ConfigBuilder::default()
        .add_source(Box::new(EnvConfigSource))
        .add_source(Box::new(caller.clone()))
        .build()
}

pub fn deserialize_optional_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(Some(s)),
        Value::Null => Ok(None),
        other => {
            error!(
                "Failed to parse value, expected a string, got: {}, ignoring",
                other
            );
            Ok(None)
        }
    }
}

pub fn deserialize_string_or_int<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(Some(s)),
        Value::Number(n) => Ok(Some(n.to_string())),
        Value::Null => Ok(None),
        _ => {
            error!("Failed to parse value, expected a string or an integer, ignoring");
            Ok(None)
        }
    }
}

pub fn deserialize_optional_bool_from_anything<'de, D>(
    deserializer: D,
) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    let opt: Option<Value> = Option::deserialize(deserializer)?;

    match opt {
        None => Ok(None),
        Some(value) => match deserialize_bool_from_anything(value) {
            Ok(bool_result) => Ok(Some(bool_result)),
            Err(e) => {
                error!("Failed to parse bool value: {}, ignoring", e);
                Ok(None)
            }
        },
    }
}

pub fn deserialize_option_lossless<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    match Option::<T>::deserialize(deserializer) {
        Ok(value) => Ok(value),
        Err(e) => {
            error!("Failed to deserialize optional value: {}, ignoring", e);
            Ok(None)
        }
    }
}

/// Accepts headers either as a JSON object string or as an already-structured map.
pub fn deserialize_http_headers<'de, D>(
    deserializer: D,
) -> Result<Option<HashMap<String, String>>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        Value::String(s) => match parse_http_headers_json(&s) {
            Ok(headers) => Ok(Some(headers)),
            Err(e) => {
                error!("Failed to parse http headers: {}, ignoring", e);
                Ok(None)
            }
        },
        object @ Value::Object(_) => match parse_http_headers_json(&object.to_string()) {
            Ok(headers) => Ok(Some(headers)),
            Err(e) => {
                error!("Failed to parse http headers: {}, ignoring", e);
                Ok(None)
            }
        },
        other => {
            error!(
                "Failed to parse http headers, expected a JSON object, got: {}, ignoring",
                other
            );
            Ok(None)
        }
    }
}

/// Accepts tags as a map of string to scalar, or as the legacy `key=value,key=value`
/// string.
pub fn deserialize_tags<'de, D>(deserializer: D) -> Result<Option<BTreeMap<String, String>>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(string_to_tags(&s).into_iter().collect())),
        Value::Object(map) => {
            let mut tags = BTreeMap::new();
            for (key, value) in map {
                match value {
                    Value::String(v) => {
                        tags.insert(key, v);
                    }
                    Value::Number(n) => {
                        tags.insert(key, n.to_string());
                    }
                    Value::Bool(b) => {
                        tags.insert(key, b.to_string());
                    }
                    other => {
                        error!("Failed to parse tag '{}', got: {}, ignoring", key, other);
                    }
                }
            }
            Ok(Some(tags))
        }
        other => {
            error!(
                "Failed to parse tags, expected a map or 'key=value' list, got: {}, ignoring",
                other
            );
            Ok(None)
        }
    }
}
