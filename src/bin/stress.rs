use crossbeam_utils::thread::scope;
use rand::prelude::*;
use std::cmp::max;
use std::hint::black_box;
use std::sync::{mpsc, Arc, Barrier};
use std::time::Instant;

use shrc::Shared;
use shrc_benchmark::config::stress::{setup, BenchWriter, Config, Op, Perf, MM};
use shrc_benchmark::handle::SharedHandle;
use shrc_benchmark::payload::{Payload, Tracker};

fn main() {
    env_logger::init();
    let (config, output) = setup();
    bench(&config, output);
}

fn bench(config: &Config, output: BenchWriter) {
    println!("{}", config);
    let perf = match config.mm {
        MM::Shrc => bench_handles::<Shared<Payload>>(config),
        MM::Arc => bench_handles::<Option<Arc<Payload>>>(config),
    };
    output.write_record(config, &perf);
    println!("{}", perf);
    if perf.constructed != perf.dropped {
        log::error!(
            "payloads leaked or double-freed: constructed {}, dropped {}",
            perf.constructed,
            perf.dropped
        );
        std::process::exit(1);
    }
}

fn bench_handles<H: SharedHandle<Payload>>(config: &Config) -> Perf {
    let tracker = Tracker::new();
    let roots: Vec<H> = (0..config.roots)
        .map(|key| H::new(Payload::new(key, &tracker)))
        .collect();
    log::info!("prefilled {} roots", roots.len());

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
                        next_sampling = now + config.sampling_period;
                    }
                    std::thread::sleep(config.aux_thread_period);
                }

                mem_sender
                    .send((peak, acc / max(samples, 1)))
                    .unwrap();
            });
        } else {
            mem_sender.send((0, 0)).unwrap();
        }

        for _ in 0..config.threads {
            let ops_sender = ops_sender.clone();
            let roots = &roots;
            s.spawn(move |_| {
                let mut ops: u64 = 0;
                let mut rng = &mut rand::thread_rng();
                let mut slots: Vec<H> = (0..config.locals)
                    .map(|_| roots[config.root_dist.sample(rng)].clone())
                    .collect();
                barrier.clone().wait();
                let start = Instant::now();

                while start.elapsed() < config.duration {
                    let root = &roots[config.root_dist.sample(rng)];
                    let slot = &mut slots[config.slot_dist.sample(rng)];
                    match Op::OPS[config.op_dist.sample(&mut rng)] {
                        Op::Get => {
                            if let Some(payload) = slot.get() {
                                black_box(payload.value);
                            }
                        }
                        Op::Clone => {
                            *slot = root.clone();
                        }
                        Op::Assign => {
                            slot.assign(root);
                        }
                        Op::Reset => {
                            slot.reset();
                        }
                    }
                    ops += 1;
                }

                ops_sender.send(ops).unwrap();
            });
        }
    })
    .unwrap();
    println!("end");

    let mut ops = 0;
    for _ in 0..config.threads {
        let local_ops = ops_receiver.recv().unwrap();
        ops += local_ops;
    }
    let ops_per_sec = ops / config.interval;
    let (peak_mem, avg_mem) = mem_receiver.recv().unwrap();

    let before = tracker.audit();
    drop(roots);
    let audit = tracker.audit();
    log::debug!("dropped {} payloads with the roots", audit.dropped - before.dropped);

    Perf {
        ops_per_sec,
        peak_mem,
        avg_mem,
        constructed: audit.constructed,
        dropped: audit.dropped,
    }
}
