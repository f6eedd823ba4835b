#[macro_use]
extern crate cfg_if;
extern crate clap;
extern crate csv;

extern crate fr_list;

use crossbeam_utils::thread::scope;
use rand::distributions::Uniform;
use rand::prelude::*;
use std::cmp::max;
use std::path::Path;
use std::sync::{mpsc, Arc, Barrier};
use std::thread::available_parallelism;
use std::time::Instant;

use fr_list::config::set::{setup, BenchWriter, Config, Op, Perf, DS};
use fr_list::ds_impl::{ConcurrentSet, FRList, Key, LockList};

cfg_if! {
    if #[cfg(all(not(feature = "sanitize"), target_os = "linux"))] {
        extern crate tikv_jemallocator;

        #[global_allocator]
        static ALLOC: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;
    }
}

fn main() {
    env_logger::init();
    let (config, output) = setup(
        Path::new(file!())
            .file_stem()
            .and_then(|s| s.to_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| "bench".to_string()),
    );
    bench(&config, output);
}

fn bench(config: &Config, output: BenchWriter) {
    println!("{}", config);
    let perf = match config.ds {
        DS::FRList => bench_set::<FRList>(config),
        DS::LockList => bench_set::<LockList>(config),
    };
    output.write_record(config, &perf);
    println!("{}", perf);
}

/// Inserts `count` distinct random keys drawn from `key_dist` with all available cores.
fn prefill<S: ConcurrentSet + Send + Sync>(set: &S, count: usize, key_dist: &Uniform<Key>) {
    let threads = available_parallelism().map(|v| v.get()).unwrap_or(1);
    log::info!("prefilling {} keys with {} threads", count, threads);
    scope(|s| {
        for t in 0..threads {
            s.spawn(move |_| {
                let mut handle = S::handle();
                let rng = &mut rand::thread_rng();
                let mut left = count / threads + if t < count % threads { 1 } else { 0 };
                while left > 0 {
                    // Duplicates do not count.
                    if set.insert(&mut handle, key_dist.sample(rng)) {
                        left -= 1;
                    }
                }
            });
        }
    })
    .expect("a prefilling thread panicked");
    log::info!("prefilled {} keys", set.size());
}

fn bench_set<S: ConcurrentSet + Send + Sync>(config: &Config) -> Perf {
    let set = &S::new();
    prefill(set, config.prefill, &config.key_dist);

    let barrier = &Arc::new(Barrier::new(config.threads + config.aux_thread));
    let (ops_sender, ops_receiver) = mpsc::channel();
    let (mem_sender, mem_receiver) = mpsc::channel();

    scope(|s| {
        // sampling thread
        if config.aux_thread > 0 {
            let mem_sender = mem_sender.clone();
            s.spawn(move |_| {
                let mut samples = 0usize;
                let mut acc = 0usize;
                let mut peak = 0usize;
                let mut garb_acc = 0usize;
                let mut garb_peak = 0usize;
                barrier.clone().wait();

                let start = Instant::now();
                let mut next_sampling = start + config.sampling_period;
                while start.elapsed() < config.duration {
                    let now = Instant::now();
                    if now > next_sampling {
                        let allocated = config.mem_sampler.sample();
                        samples += 1;

                        acc += allocated;
                        peak = max(peak, allocated);

                        let garbages = hp_rs::DEFAULT_DOMAIN.num_garbages();
                        garb_acc += garbages;
                        garb_peak = max(garb_peak, garbages);

                        next_sampling = now + config.sampling_period;
                    }
                    std::thread::sleep(config.aux_thread_period);
                }

                if config.sampling && samples > 0 {
                    mem_sender
                        .send((peak, acc / samples, garb_peak, garb_acc / samples))
                        .unwrap();
                } else {
                    mem_sender.send((0, 0, 0, 0)).unwrap();
                }
            });
        } else {
            mem_sender.send((0, 0, 0, 0)).unwrap();
        }

        for _ in 0..config.threads {
            let ops_sender = ops_sender.clone();
            s.spawn(move |_| {
                let mut ops: u64 = 0;
                let mut rng = &mut rand::thread_rng();
                let mut handle = S::handle();
                barrier.clone().wait();
                let start = Instant::now();

                while start.elapsed() < config.duration {
                    let key = config.key_dist.sample(rng);
                    match Op::OPS[config.op_dist.sample(&mut rng)] {
                        Op::Get => {
                            set.contains(&mut handle, key);
                        }
                        Op::Insert => {
                            set.insert(&mut handle, key);
                        }
                        Op::Remove => {
                            set.remove(&mut handle, key);
                        }
                    }
                    ops += 1;
                }

                ops_sender.send(ops).unwrap();
            });
        }
    })
    .expect("a benchmark thread panicked");
    log::info!("end, {} keys left", set.size());

    let mut ops = 0;
    for _ in 0..config.threads {
        let local_ops = ops_receiver.recv().unwrap();
        ops += local_ops;
    }
    let ops_per_sec = ops / config.interval.max(1);
    let (peak_mem, avg_mem, peak_garb, avg_garb) = mem_receiver.recv().unwrap();
    Perf {
        ops_per_sec,
        peak_mem,
        avg_mem,
        peak_garb,
        avg_garb,
    }
}
