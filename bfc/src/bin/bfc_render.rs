use bfc::{AllocatorConfig, MIN_ALLOCATION_SIZE};
use std::env;

fn main() {
    pretty_env_logger::init();
    let args: Vec<String> = env::args().collect();
    let config = match args.get(1) {
        Some(path) => match AllocatorConfig::load_config(path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("{err}");
                std::process::exit(1);
            }
        },
        None => AllocatorConfig::default(),
    };
    let alloc = bfc::initialize(&config);
    let unit = config.initial_region_size.max(MIN_ALLOCATION_SIZE * 16) / 16;
    println!("{:>12} {}", "start", alloc.render_occupancy());

    let mut live = vec![];
    for (i, num_bytes) in [unit, 2 * unit, unit / 3, 4 * unit, unit].into_iter().enumerate() {
        match alloc.allocate_raw(MIN_ALLOCATION_SIZE, num_bytes) {
            Some(ptr) => live.push(ptr),
            None => println!("allocation {i} of {num_bytes} bytes failed"),
        }
        println!("{:>12} {}", format!("alloc {num_bytes}"), alloc.render_occupancy());
    }
    for i in (0..live.len()).step_by(2).rev() {
        let ptr = live.remove(i);
        alloc.deallocate_raw(ptr);
        println!("{:>12} {}", format!("free {ptr}"), alloc.render_occupancy());
    }

    println!("{}", alloc.get_stats());
    alloc.dump_memory_log(8 * unit);
    for ptr in live {
        alloc.deallocate_raw(ptr);
    }
    println!("{:>12} {}", "end", alloc.render_occupancy());
}
