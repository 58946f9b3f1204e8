//! Forced preemption demo
//!
//! One carrier, one CPU-bound virtual thread that never yields on its own
//! (it only polls safepoints), and a few short ones queued behind it. The
//! monitor forces the spinner off the carrier after each time slice so the
//! short ones get to run.
//!
//! Usage: preemption [time_slice_ms]

use vthread::{kinfo, safepoint, CriticalSection, Runtime, SchedulerConfig};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn main() {
    println!("=== vthread Preemption Demo ===\n");

    let slice_ms: u64 = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(10);

    let config = SchedulerConfig::from_env()
        .parallelism(1)
        .time_slice(Duration::from_millis(slice_ms))
        .monitor_interval(Duration::from_millis((slice_ms / 2).max(1)))
        .enable_forced_preempt(true);

    let mut runtime = match Runtime::new(config) {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("bad configuration: {}", e);
            std::process::exit(1);
        }
    };

    let stop = Arc::new(AtomicBool::new(false));
    let spins = Arc::new(AtomicU64::new(0));

    runtime.block_on(|rt| {
        let spinner = {
            let (stop, spins) = (stop.clone(), spins.clone());
            rt.builder().name("spinner").spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    safepoint!();
                    spins.fetch_add(1, Ordering::Relaxed);
                    // Pinned stretch: preemption waits until it ends
                    if spins.load(Ordering::Relaxed) % 1_000_000 == 0 {
                        let _cs = CriticalSection::enter();
                        std::hint::black_box((0..10_000u64).sum::<u64>());
                    }
                }
            })
        };

        let start = Instant::now();
        let mut shorts = Vec::new();
        for i in 0..5 {
            let spawned = rt.spawn(move || {
                kinfo!("short vthread {} ran at {:?}", i, start.elapsed());
            });
            if let Ok(h) = spawned {
                shorts.push(h);
            }
        }
        for h in shorts {
            let _ = h.join();
        }
        println!("Short vthreads finished after {:?}", start.elapsed());

        stop.store(true, Ordering::Relaxed);
        if let Ok(h) = spinner {
            let _ = h.join();
        }

        let stats = rt.stats();
        println!("\nSpinner iterations: {}", spins.load(Ordering::Relaxed));
        println!("Forced preemptions: {}", stats.preempted);
        println!("Resubmissions:      {}", stats.resubmitted);
    });

    println!("\n=== Demo Complete ===");
}
