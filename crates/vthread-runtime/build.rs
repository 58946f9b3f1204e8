//! Build script for vthread-runtime
//!
//! Produces `OUT_DIR/vt_merged_config.rs`, the compile-time scheduler defaults.
//! When `VT_CONFIG_RS` names a Rust file of `pub const NAME: TYPE = VALUE;`
//! lines, its values replace the library defaults for the names it lists.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::Path;

/// (name, type, library default)
const PARAMS: &[(&str, &str, &str)] = &[
    ("PARALLELISM", "usize", "4"),
    ("MAX_CARRIERS", "usize", "256"),
    ("STACK_SIZE", "usize", "256 * 1024"),
    ("LOCAL_QUEUE_CAPACITY", "usize", "256"),
    ("IDLE_SPINS", "u32", "10"),
    ("PARK_TIMEOUT_MS", "u64", "100"),
    ("KEEP_ALIVE_MS", "u64", "1000"),
    ("TIME_SLICE_MS", "u64", "10"),
    ("MONITOR_INTERVAL_MS", "u64", "5"),
    ("PREEMPT_TIMEOUT_MS", "u64", "10"),
    ("ENABLE_FORCED_PREEMPT", "bool", "true"),
    ("RELEASE_FROZEN_STACKS", "bool", "true"),
    ("DEBUG_LOGGING", "bool", "false"),
];

fn main() {
    println!("cargo:rerun-if-env-changed=VT_CONFIG_RS");

    let mut values: BTreeMap<&str, String> = PARAMS
        .iter()
        .map(|(name, _, default)| (*name, default.to_string()))
        .collect();

    let user_path = env::var("VT_CONFIG_RS").ok();
    if let Some(path) = &user_path {
        println!("cargo:rerun-if-changed={}", path);
        match fs::read_to_string(path) {
            Ok(content) => {
                for (name, value) in parse_consts(&content) {
                    match PARAMS.iter().find(|(known, _, _)| *known == name) {
                        Some((known, _, _)) => {
                            values.insert(known, value);
                        }
                        None => println!("cargo:warning=Unknown config parameter: {}", name),
                    }
                }
                println!("cargo:warning=Using custom config: {}", path);
            }
            Err(e) => println!("cargo:warning=Failed to read VT_CONFIG_RS ({}): {}", path, e),
        }
    }

    let mut out = String::from("// Generated by build.rs from library defaults");
    if user_path.is_some() {
        out.push_str(" and VT_CONFIG_RS");
    }
    out.push_str("\n\n");
    for (name, ty, _) in PARAMS {
        out.push_str(&format!("pub const {}: {} = {};\n", name, ty, values[name]));
    }

    let out_dir = env::var("OUT_DIR").expect("OUT_DIR not set");
    fs::write(Path::new(&out_dir).join("vt_merged_config.rs"), out)
        .expect("failed to write merged config");
}

/// Extract `(NAME, VALUE)` from every `pub const NAME: TYPE = VALUE;` line
fn parse_consts(content: &str) -> Vec<(String, String)> {
    content
        .lines()
        .map(str::trim)
        .filter_map(|line| {
            let rest = line.strip_prefix("pub const ")?;
            let (name, rest) = rest.split_once(':')?;
            let (_, value) = rest.split_once('=')?;
            let value = value.trim().trim_end_matches(';').trim();
            Some((name.trim().to_string(), value.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_consts() {
        let parsed = parse_consts(
            r#"
            // carriers
            pub const PARALLELISM: usize = 8;
            pub const STACK_SIZE: usize = 64 * 1024;
            let ignored = 1;
            "#,
        );
        assert_eq!(
            parsed,
            vec![
                ("PARALLELISM".to_string(), "8".to_string()),
                ("STACK_SIZE".to_string(), "64 * 1024".to_string()),
            ]
        );
    }
}
