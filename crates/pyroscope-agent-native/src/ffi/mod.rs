//! FFI (Foreign Function Interface) Module
//!
//! C-compatible bindings used by the Ruby and Python host bindings. Every function acts
//! on the process-wide agent in [`crate::agent::global`], so no handle is passed around.
//!
//! ## Failure reporting
//!
//! Functions return `bool`: `true` on success, `false` on any failure. Failures are
//! logged through `tracing` (see [`pyroscope_initialize_logging`]); nothing is retried.
//!
//! ## Panic Safety
//!
//! Every function runs its body under `std::panic::catch_unwind`. A panic is printed to
//! stderr and reported as `false` (or `0` for [`pyroscope_current_context_id`]); it never
//! crosses the `extern "C"` boundary, which would abort the host process.
//!
//! ## Thread tags
//!
//! `pyroscope_add_thread_tag` / `pyroscope_remove_thread_tag` take a `thread_id`:
//!
//! - `0`: the calling OS thread, resolved natively.
//! - anything else: a thread id supplied by the host (for example Python's
//!   `threading.get_ident()`), mapped with
//!   [`ExecutionContextId::from_host_thread_id`].
//!
//! ## Usage Example (C)
//!
//! ```c
//! #include "pyroscope_agent_native.h"
//!
//! int main() {
//!     pyroscope_initialize_logging(30);
//!
//!     PyroscopeAgentOptions options = {0};
//!     options.application_name = "checkout";
//!     options.server_address = "http://localhost:4040";
//!     options.detect_subprocesses = -1;
//!     options.oncpu = -1;
//!     options.report_pid = 1;
//!     options.report_thread_id = -1;
//!     options.report_thread_name = -1;
//!     options.tags = "region=us-east,host=web-1";
//!
//!     if (!pyroscope_agent_start(&options)) {
//!         return 1;
//!     }
//!
//!     pyroscope_add_thread_tag(0, "action", "orders/create");
//!     handle_request();
//!     pyroscope_remove_thread_tag(0, "action", "orders/create");
//!
//!     pyroscope_agent_stop();
//!     return 0;
//! }
//! ```

use std::any::Any;
use std::collections::BTreeMap;
use std::ffi::CStr;
use std::os::raw::{c_char, c_int};
use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::{error, warn};

use crate::agent::global;
use crate::config::compression::Compression;
use crate::config::http_headers::parse_http_headers_json;
use crate::config::log_level::LogLevel;
use crate::config::report_encoding::ReportEncoding;
use crate::config::{get_config, RawConfig};
use crate::tags::context::ThreadContextProvider;
use crate::tags::legacy::{string_to_tags, tags_from_json};
use crate::tags::{ContextProvider, ExecutionContextId};

/// Configuration options for `pyroscope_agent_start`.
///
/// All string fields should be null-terminated UTF-8 strings. NULL pointers are treated
/// as "not set": the environment (`PYROSCOPE_*`) or the built-in default applies.
///
/// Flag fields are tri-state: negative = not set, 0 = disabled, anything else = enabled.
#[repr(C)]
pub struct PyroscopeAgentOptions {
    /// Application name reported with every profile
    pub application_name: *const c_char,

    /// Ingestion server URL. Default: `http://localhost:4040`
    pub server_address: *const c_char,

    /// Bearer token; wins over basic auth when non-empty
    pub auth_token: *const c_char,

    pub basic_auth_username: *const c_char,
    pub basic_auth_password: *const c_char,

    /// Samples per second, 0 = not set (default 100)
    pub sample_rate: u32,

    /// Keep profiling in forked children
    pub detect_subprocesses: c_int,

    /// Sample only threads that are on CPU
    pub oncpu: c_int,

    pub report_pid: c_int,
    pub report_thread_id: c_int,
    pub report_thread_name: c_int,

    /// Log severity ordinal: 10=trace, 20=debug, 30=info, 40=warn, 50=error, 0 = not set
    pub log_level: u32,

    /// "gzip" (default) or "none"
    pub compression: *const c_char,

    /// "pprof" (default) or "collapsed"
    pub report_encoding: *const c_char,

    /// Tenant id for multi-tenant servers, empty = none
    pub tenant_id: *const c_char,

    /// Extra HTTP headers as a JSON object of strings, e.g. `{"X-Team":"payments"}`
    pub http_headers_json: *const c_char,

    /// Static tags, either legacy `key=value,key=value` or a JSON array/object
    pub tags: *const c_char,
}

/// Helper to safely convert C string to Rust String.
///
/// # Safety
/// * `ptr` must be either NULL or a valid pointer to a null-terminated C string
///
/// # Returns
/// * `Ok(None)` - NULL pointer ("not set")
/// * `Ok(Some(String))` - Successfully converted string
/// * `Err(())` - The string is not valid UTF-8
unsafe fn cstr_to_string(ptr: *const c_char) -> Result<Option<String>, ()> {
    if ptr.is_null() {
        return Ok(None);
    }

    match CStr::from_ptr(ptr).to_str() {
        Ok(s) => Ok(Some(s.to_string())),
        Err(_) => Err(()),
    }
}

/// Like [`cstr_to_string`], but logs and drops invalid UTF-8 for option fields.
unsafe fn option_string(ptr: *const c_char, field: &str) -> Option<String> {
    cstr_to_string(ptr).unwrap_or_else(|()| {
        warn!("Ignoring {}: not valid UTF-8", field);
        None
    })
}

const fn flag(value: c_int) -> Option<bool> {
    if value < 0 {
        None
    } else {
        Some(value != 0)
    }
}

fn panic_message(payload: &(dyn Any + Send), operation: &str) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("Panic during {operation}: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("Panic during {operation}: {s}")
    } else {
        format!("Panic during {operation} (unknown cause)")
    }
}

/// Runs `body`, turning a panic into `fallback`.
fn guarded<T>(operation: &str, fallback: T, body: impl FnOnce() -> T) -> T {
    match catch_unwind(AssertUnwindSafe(body)) {
        Ok(value) => value,
        Err(payload) => {
            eprintln!("{}", panic_message(payload.as_ref(), operation));
            fallback
        }
    }
}

fn parse_tags(input: &str) -> Option<BTreeMap<String, String>> {
    let trimmed = input.trim();
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        match tags_from_json(trimmed) {
            Ok(tags) => Some(tags.into_iter().map(|t| (t.key, t.value)).collect()),
            Err(e) => {
                error!("Ignoring tags: {}", e);
                None
            }
        }
    } else {
        Some(string_to_tags(trimmed).into_iter().collect())
    }
}

/// Builds the caller layer of the configuration from C options.
///
/// # Safety
/// Same contract as [`pyroscope_agent_start`].
unsafe fn raw_config_from_options(opts: &PyroscopeAgentOptions) -> RawConfig {
    let http_headers = option_string(opts.http_headers_json, "http_headers_json").and_then(
        |json| match parse_http_headers_json(&json) {
            Ok(headers) => Some(headers),
            Err(e) => {
                error!("Ignoring http_headers_json: {}", e);
                None
            }
        },
    );

    let compression = option_string(opts.compression, "compression").and_then(|value| {
        let parsed = Compression::from_env_str(&value);
        if parsed.is_none() {
            warn!("Unknown compression {:?}, using the default", value);
        }
        parsed
    });

    let report_encoding =
        option_string(opts.report_encoding, "report_encoding").and_then(|value| {
            let parsed = ReportEncoding::from_env_str(&value);
            if parsed.is_none() {
                warn!("Unknown report encoding {:?}, using the default", value);
            }
            parsed
        });

    RawConfig {
        application_name: option_string(opts.application_name, "application_name"),
        server_address: option_string(opts.server_address, "server_address"),
        auth_token: option_string(opts.auth_token, "auth_token"),
        basic_auth_username: option_string(opts.basic_auth_username, "basic_auth_username"),
        basic_auth_password: option_string(opts.basic_auth_password, "basic_auth_password"),
        sample_rate: (opts.sample_rate != 0).then_some(opts.sample_rate),
        detect_subprocesses: flag(opts.detect_subprocesses),
        oncpu: flag(opts.oncpu),
        report_pid: flag(opts.report_pid),
        report_thread_id: flag(opts.report_thread_id),
        report_thread_name: flag(opts.report_thread_name),
        autoinstrument: None,
        log_level: (opts.log_level != 0).then(|| LogLevel::from_severity(opts.log_level)),
        compression,
        report_encoding,
        tenant_id: option_string(opts.tenant_id, "tenant_id"),
        http_headers,
        tags: option_string(opts.tags, "tags").and_then(|tags| parse_tags(&tags)),
    }
}

/// Resolves the execution context a thread tag call applies to.
fn thread_context(thread_id: u64) -> ExecutionContextId {
    if thread_id == 0 {
        ThreadContextProvider.current_id()
    } else {
        ExecutionContextId::from_host_thread_id(thread_id, std::process::id())
    }
}

/// Reads a required, non-NULL UTF-8 argument.
unsafe fn required_str(ptr: *const c_char, argument: &str) -> Option<String> {
    match cstr_to_string(ptr) {
        Ok(Some(s)) => Some(s),
        Ok(None) => {
            error!("{} must not be NULL", argument);
            None
        }
        Err(()) => {
            error!("{} is not valid UTF-8", argument);
            None
        }
    }
}

/// Turns on agent logging at `severity` (10 trace, 20 debug, 30 info, 40 warn,
/// 50 error; anything else is error). Only the first call has an effect.
#[no_mangle]
pub extern "C" fn pyroscope_initialize_logging(severity: u32) -> bool {
    guarded("initialize_logging", false, || {
        crate::logger::initialize_logging(severity)
    })
}

/// Resolves the configuration and starts (or reconfigures) the process-wide agent.
///
/// Calling it again with options that resolve to the same configuration is a no-op.
///
/// # Safety
///
/// - `options` must be NULL or a valid pointer to a `PyroscopeAgentOptions` struct
/// - All string pointers in `options` must be valid null-terminated strings or NULL
///
/// A NULL `options` starts the agent from environment and defaults alone.
#[no_mangle]
pub unsafe extern "C" fn pyroscope_agent_start(options: *const PyroscopeAgentOptions) -> bool {
    guarded("agent start", false, || {
        let caller = if options.is_null() {
            RawConfig::default()
        } else {
            raw_config_from_options(&*options)
        };
        let config = get_config(&caller);

        match global::agent().initialize(config) {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to start agent: {}", e);
                false
            }
        }
    })
}

/// Flushes and stops the process-wide agent. Stopping a stopped agent succeeds.
#[no_mangle]
pub extern "C" fn pyroscope_agent_stop() -> bool {
    guarded("agent stop", false, || match global::agent().stop() {
        Ok(()) => true,
        Err(e) => {
            error!("Failed to stop agent: {}", e);
            false
        }
    })
}

/// Adds `key=value` to a thread's tags.
///
/// # Safety
///
/// - `key` and `value` must be valid pointers to null-terminated UTF-8 strings
#[no_mangle]
pub unsafe extern "C" fn pyroscope_add_thread_tag(
    thread_id: u64,
    key: *const c_char,
    value: *const c_char,
) -> bool {
    guarded("add_thread_tag", false, || {
        let (Some(key), Some(value)) = (required_str(key, "key"), required_str(value, "value"))
        else {
            return false;
        };
        let agent = global::agent();
        agent.handle_fork();

        match agent.tags().add_tag(thread_context(thread_id), key, value) {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to add thread tag: {}", e);
                false
            }
        }
    })
}

/// Removes the most recently added `key=value` from a thread's tags. Returns false
/// when the thread did not hold that pair.
///
/// # Safety
///
/// - `key` and `value` must be valid pointers to null-terminated UTF-8 strings
#[no_mangle]
pub unsafe extern "C" fn pyroscope_remove_thread_tag(
    thread_id: u64,
    key: *const c_char,
    value: *const c_char,
) -> bool {
    guarded("remove_thread_tag", false, || {
        let (Some(key), Some(value)) = (required_str(key, "key"), required_str(value, "value"))
        else {
            return false;
        };
        let agent = global::agent();
        agent.handle_fork();
        agent
            .tags()
            .remove_tag(thread_context(thread_id), &key, &value)
    })
}

/// Adds a process-wide tag, reported for every execution context.
///
/// # Safety
///
/// - `key` and `value` must be valid pointers to null-terminated UTF-8 strings
#[no_mangle]
pub unsafe extern "C" fn pyroscope_add_global_tag(
    key: *const c_char,
    value: *const c_char,
) -> bool {
    guarded("add_global_tag", false, || {
        let (Some(key), Some(value)) = (required_str(key, "key"), required_str(value, "value"))
        else {
            return false;
        };
        let agent = global::agent();
        agent.handle_fork();

        match agent.tags().add_global_tag(key, value) {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to add global tag: {}", e);
                false
            }
        }
    })
}

/// Removes one occurrence of a process-wide tag.
///
/// # Safety
///
/// - `key` and `value` must be valid pointers to null-terminated UTF-8 strings
#[no_mangle]
pub unsafe extern "C" fn pyroscope_remove_global_tag(
    key: *const c_char,
    value: *const c_char,
) -> bool {
    guarded("remove_global_tag", false, || {
        let (Some(key), Some(value)) = (required_str(key, "key"), required_str(value, "value"))
        else {
            return false;
        };
        let agent = global::agent();
        agent.handle_fork();
        agent.tags().remove_global_tag(&key, &value)
    })
}

/// Execution context id of the calling thread. Never 0 on success; 0 means a panic was
/// caught.
#[no_mangle]
pub extern "C" fn pyroscope_current_context_id() -> u64 {
    guarded("current_context_id", 0, || {
        ThreadContextProvider.current_id().as_u64()
    })
}

/// Get the library version string
///
/// # Returns
///
/// A pointer to a static null-terminated string. Do not free it.
#[no_mangle]
pub extern "C" fn pyroscope_version() -> *const c_char {
    static VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "\0");
    VERSION.as_ptr().cast::<c_char>()
}
