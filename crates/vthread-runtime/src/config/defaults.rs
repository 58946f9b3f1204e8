//! Compile-time scheduler defaults
//!
//! Generated by `build.rs`; override with a `VT_CONFIG_RS` file at build time.

include!(concat!(env!("OUT_DIR"), "/vt_merged_config.rs"));
