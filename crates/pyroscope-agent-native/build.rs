//! Build script for pyroscope-agent-native.
//!
//! This build script performs the following tasks at compile time:
//!
//! 1. **Build Timestamp**: Records when the agent was built (RFC3339 format)
//! 2. **C Bindings Generation**: Creates a C header file for the FFI functions
//!
//! # Generated Artifacts
//!
//! - **Environment Variables**:
//!   - `BUILD_TIMESTAMP`: ISO 8601 timestamp of build time
//!
//! - **C Header File**:
//!   - `pyroscope_agent_native.h`: declarations for every `#[no_mangle] pub extern "C"`
//!     function in `src/ffi/mod.rs`, written to the crate root
//!
//! # Incremental Builds
//!
//! The header is regenerated when `src/ffi/mod.rs` or `cbindgen.toml` change.

use std::env;

fn main() {
    let Ok(crate_dir) = env::var("CARGO_MANIFEST_DIR") else {
        panic!("CARGO_MANIFEST_DIR is not set");
    };

    let now = chrono::Utc::now();
    println!("cargo:rustc-env=BUILD_TIMESTAMP={}", now.to_rfc3339());

    let config = cbindgen::Config::from_root_or_default(&crate_dir);
    match cbindgen::Builder::new()
        .with_crate(&crate_dir)
        .with_config(config)
        .generate()
    {
        Ok(bindings) => {
            bindings.write_to_file("pyroscope_agent_native.h");
        }
        // Header generation is best effort; the library still builds without it.
        Err(e) => println!("cargo:warning=Unable to generate C bindings: {e}"),
    }

    println!("cargo:rerun-if-changed=src/ffi/mod.rs");
    println!("cargo:rerun-if-changed=cbindgen.toml");
}
