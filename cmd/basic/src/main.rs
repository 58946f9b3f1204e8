//! Basic virtual thread example
//!
//! Spawns a few virtual threads that yield back and forth, then joins them.
//!
//! # Environment Variables
//!
//! - `VT_FLUSH_EPRINT=1` - Flush debug output immediately (useful for crash debugging)
//! - `VT_LOG_LEVEL=debug` - Set log level (off, error, warn, info, debug, trace)
//! - `VT_PARALLELISM`, `VT_DEBUG`, ... - see `SchedulerConfig::from_env`

use vthread::{current_id, kdebug, kinfo, yield_now, Runtime, SchedulerConfig};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

// VT_LOG_LEVEL=debug VT_FLUSH_EPRINT=1 cargo run -p vthread-basic
fn main() {
    println!("=== vthread Basic Example ===\n");

    let config = SchedulerConfig::from_env().parallelism(4);
    let mut runtime = match Runtime::new(config) {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("bad configuration: {}", e);
            std::process::exit(1);
        }
    };

    let completed = Arc::new(AtomicUsize::new(0));

    runtime.block_on(|rt| {
        kinfo!("Spawning virtual threads...");

        let mut handles = Vec::new();
        for i in 1..=4 {
            let c = completed.clone();
            let spawned = rt.builder().name(format!("worker-{}", i)).spawn(move || {
                kdebug!("[vthread {}] started as {}", i, current_id());
                for j in 0..3 {
                    kdebug!("[vthread {}] iteration {}", i, j);
                    yield_now();
                }
                c.fetch_add(1, Ordering::SeqCst);
            });
            match spawned {
                Ok(handle) => {
                    println!("Spawned vthread {} (ID={})", i, handle.id());
                    handles.push(handle);
                }
                Err(e) => eprintln!("spawn failed: {}", e),
            }
        }

        println!("\nWaiting for {} virtual threads to complete...\n", handles.len());
        for handle in handles {
            if let Err(e) = handle.join() {
                eprintln!("join failed: {}", e);
            }
        }

        let stats = rt.stats();
        kinfo!("{} virtual thread(s) completed", completed.load(Ordering::SeqCst));
        println!("Stats: {:?}", stats);
    });

    println!("\n=== Example Complete ===");
}
