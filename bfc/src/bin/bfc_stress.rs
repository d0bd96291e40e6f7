use bfc::{AllocatorConfig, DevicePtr, MIN_ALLOCATION_SIZE};
use log::info;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::env;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

const DEFAULT_THREADS: usize = 8;
const DEFAULT_ITERATIONS: usize = 100_000;
const MAX_REQUEST: usize = 64 << 10;
const MAX_LIVE_PER_THREAD: usize = 64;

fn main() {
    pretty_env_logger::init();
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("usage: {} <config.toml> [threads] [iterations]", args[0]);
        std::process::exit(1);
    }
    let config = match AllocatorConfig::load_config(&args[1]) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    };
    let num_threads = args
        .get(2)
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_THREADS);
    let iterations = args
        .get(3)
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_ITERATIONS);

    let alloc = Arc::new(bfc::initialize(&config));
    let start = Instant::now();
    let workers: Vec<_> = (0..num_threads)
        .map(|t| {
            let alloc = alloc.clone();
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(t as u64);
                let mut live: Vec<DevicePtr> = vec![];
                let mut failures = 0;
                for _ in 0..iterations {
                    if live.is_empty() || (live.len() < MAX_LIVE_PER_THREAD && rng.gen_bool(0.5)) {
                        let num_bytes = rng.gen_range(1..=MAX_REQUEST);
                        match alloc.allocate_raw(MIN_ALLOCATION_SIZE, num_bytes) {
                            Some(ptr) => live.push(ptr),
                            None => failures += 1,
                        }
                    } else {
                        let i = rng.gen_range(0..live.len());
                        alloc.deallocate_raw(live.swap_remove(i));
                    }
                }
                for ptr in live {
                    alloc.deallocate_raw(ptr);
                }
                failures
            })
        })
        .collect();
    let failures: usize = workers.into_iter().map(|w| w.join().unwrap()).sum();
    info!(
        "{} threads x {} iterations in {:?}, {} failed allocations",
        num_threads,
        iterations,
        start.elapsed(),
        failures
    );

    let stats = alloc.get_stats();
    println!("{stats}");
    println!("{}", alloc.render_occupancy());
    assert_eq!(stats.bytes_in_use, 0);
}
