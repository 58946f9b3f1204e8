//! Stress test - many virtual threads
//!
//! Spawns a large number of virtual threads that each yield a few times.
//!
//! Usage: stress [count] [yields]

use vthread::{blocking, yield_now, JoinHandle, Runtime, SchedulerConfig};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn main() {
    println!("=== vthread Stress Test ===\n");

    let mut args = std::env::args().skip(1);
    let num_vthreads: usize = args.next().and_then(|s| s.parse().ok()).unwrap_or(10_000);
    let yields: usize = args.next().and_then(|s| s.parse().ok()).unwrap_or(10);

    println!("Spawning {} virtual threads ({} yields each)...", num_vthreads, yields);

    let config = SchedulerConfig::from_env().stack_size(64 * 1024);
    let mut runtime = match Runtime::new(config) {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("bad configuration: {}", e);
            std::process::exit(1);
        }
    };

    let completed = Arc::new(AtomicU64::new(0));

    runtime.block_on(|rt| {
        let start = Instant::now();
        let mut handles: Vec<JoinHandle> = Vec::with_capacity(num_vthreads);

        for i in 0..num_vthreads {
            let completed = completed.clone();
            let spawned = rt.spawn(move || {
                for _ in 0..yields {
                    yield_now();
                }
                // Every 1000th one blocks its carrier briefly
                if i % 1000 == 0 {
                    blocking(|| std::thread::sleep(Duration::from_millis(1)));
                }
                completed.fetch_add(1, Ordering::Relaxed);
            });
            match spawned {
                Ok(h) => handles.push(h),
                Err(e) => {
                    eprintln!("spawn failed at {}: {}", i, e);
                    break;
                }
            }

            if (i + 1) % 1000 == 0 {
                print!("\rSpawned: {}/{}", i + 1, num_vthreads);
            }
        }

        let spawn_time = start.elapsed();
        println!("\n\nSpawn time: {:?}", spawn_time);
        println!("Spawn rate: {:.0} vthreads/sec", num_vthreads as f64 / spawn_time.as_secs_f64());

        println!("\nWaiting for completion...");
        let run_start = Instant::now();
        let mut faulted = 0usize;
        for h in handles {
            if h.join().is_err() {
                faulted += 1;
            }
        }

        let total_time = start.elapsed();
        let stats = rt.stats();

        println!("\n=== Results ===");
        println!("Total vthreads:  {}", num_vthreads);
        println!("Completed:       {}", completed.load(Ordering::Relaxed));
        println!("Failed joins:    {}", faulted);
        println!("Resubmitted:     {}", stats.resubmitted);
        println!("Carriers now:    {}", stats.carriers);
        println!("Run time:        {:?}", run_start.elapsed());
        println!("Total time:      {:?}", total_time);
        println!("Throughput:      {:.0} vthreads/sec", num_vthreads as f64 / total_time.as_secs_f64());
    });

    println!("\n=== Stress Test Complete ===");
}
