use crate::MemSampler;
use clap::{value_parser, Arg, ArgAction, Command, ValueEnum};
use csv::Writer;
use rand::distributions::{Uniform, WeightedIndex};
use std::ffi::OsString;
use std::fmt;
use std::fs::{create_dir_all, File, OpenOptions};
use std::path::Path;
use std::time::Duration;

/// The handle implementation to drive.
#[derive(PartialEq, Debug, ValueEnum, Clone, Copy)]
pub enum MM {
    Shrc,
    Arc,
}

#[derive(PartialEq, Debug)]
pub enum Op {
    Get,
    Clone,
    Assign,
    Reset,
}

impl Op {
    pub const OPS: [Op; 4] = [Op::Get, Op::Clone, Op::Assign, Op::Reset];
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub enum GetRate {
    WriteOnly = 0,
    ReadWrite = 1,
    ReadIntensive = 2,
    ReadOnly = 3,
}

impl GetRate {
    /// Weights for [`Op::OPS`], in order `[get, clone, assign, reset]`.
    /// Rows give 0%, 50%, 90% and 100% reads; writes split evenly.
    fn op_weights(self) -> &'static [i32; 4] {
        match self {
            GetRate::WriteOnly => &[0, 1, 1, 1],
            GetRate::ReadWrite => &[3, 1, 1, 1],
            GetRate::ReadIntensive => &[27, 1, 1, 1],
            GetRate::ReadOnly => &[1, 0, 0, 0],
        }
    }
}

pub struct Config {
    pub mm: MM,
    pub threads: usize,
    pub roots: usize,
    pub locals: usize,

    pub aux_thread: usize,
    pub aux_thread_period: Duration,
    pub sampling: bool,
    pub sampling_period: Duration,

    pub get_rate: GetRate,
    pub op_dist: WeightedIndex<i32>,
    pub root_dist: Uniform<usize>,
    pub slot_dist: Uniform<usize>,
    pub interval: u64,
    pub duration: Duration,

    pub mem_sampler: MemSampler,
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} threads, {} roots, {} locals, g{}",
            self.mm.to_possible_value().unwrap().get_name(),
            self.threads,
            self.roots,
            self.locals,
            self.get_rate as u8,
        )
    }
}

pub struct BenchWriter {
    output: Option<Writer<File>>,
}

#[derive(Clone)]
pub struct Perf {
    pub ops_per_sec: u64,
    pub peak_mem: usize,
    pub avg_mem: usize,
    pub constructed: usize,
    pub dropped: usize,
}

impl fmt::Display for Perf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ops/s: {}, peak mem: {}, avg_mem: {}, constructed: {}, dropped: {}",
            self.ops_per_sec,
            readable_bytes(self.peak_mem),
            readable_bytes(self.avg_mem),
            self.constructed,
            self.dropped,
        )
    }
}

fn readable_bytes(num: usize) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    for (i, unit) in UNITS.iter().enumerate() {
        if num / 2usize.pow(i as u32 * 10) < 1000 {
            return format!("{:.3} {}", num as f64 / 2f64.powf(i as f64 * 10.0), unit);
        }
    }
    format!(
        "{:.3} {}",
        num as f64 / 2f64.powf((UNITS.len() - 1) as f64 * 10.0),
        UNITS[UNITS.len() - 1]
    )
}

const HEADER: [&str; 11] = [
    "mm",
    "threads",
    "roots",
    "locals",
    "get_rate",
    "sampling_period",
    "throughput",
    "peak_mem",
    "avg_mem",
    "balanced",
    "interval",
];

impl BenchWriter {
    pub fn write_record(self, config: &Config, perf: &Perf) {
        if let Some(mut output) = self.output {
            let record = [
                config
                    .mm
                    .to_possible_value()
                    .unwrap()
                    .get_name()
                    .to_string(),
                config.threads.to_string(),
                config.roots.to_string(),
                config.locals.to_string(),
                (config.get_rate as u8).to_string(),
                config.sampling_period.as_millis().to_string(),
                perf.ops_per_sec.to_string(),
                perf.peak_mem.to_string(),
                perf.avg_mem.to_string(),
                (perf.constructed == perf.dropped).to_string(),
                config.interval.to_string(),
            ];
            if let Err(e) = output.write_record(&record) {
                log::error!("failed to write the result record: {}", e);
                return;
            }
            if let Err(e) = output.flush() {
                log::error!("failed to flush the output: {}", e);
            }
        }
    }
}

fn open_output(output_name: &str) -> Writer<File> {
    let output_path = Path::new(output_name);
    if let Some(dir) = output_path.parent() {
        create_dir_all(dir).unwrap();
    }
    match OpenOptions::new().read(true).append(true).open(output_path) {
        Ok(f) => csv::Writer::from_writer(f),
        Err(_) => {
            log::info!("creating {}", output_path.display());
            let f = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(output_path)
                .unwrap();
            let mut output = csv::Writer::from_writer(f);
            // NOTE: `write_record` on `bench`
            output.write_record(HEADER).unwrap();
            output.flush().unwrap();
            output
        }
    }
}

fn command() -> Command {
    Command::new("stress")
        .about("Drives families of shared handles from many threads")
        .arg(
            Arg::new("memory manager")
                .short('m')
                .value_parser(value_parser!(MM))
                .ignore_case(true)
                .default_value("shrc")
                .help("Shared handle implementation"),
        )
        .arg(
            Arg::new("threads")
                .short('t')
                .value_parser(value_parser!(usize))
                .required(true)
                .help("Numbers of threads to run."),
        )
        .arg(
            Arg::new("roots")
                .short('r')
                .value_parser(value_parser!(u32).range(1..))
                .help("Number of handle families, each with one long-lived root handle")
                .default_value("64"),
        )
        .arg(
            Arg::new("locals")
                .short('l')
                .value_parser(value_parser!(u32).range(1..))
                .help("Number of handle slots owned by each thread")
                .default_value("16"),
        )
        .arg(
            Arg::new("get rate")
                .short('g')
                .help(
                    "The proportion of `get`(read) operations. \
                     0: 0%, 1: 50%, 2: 90%, 3: 100%",
                )
                .value_parser(value_parser!(u8).range(0..4))
                .default_value("1"),
        )
        .arg(
            Arg::new("interval")
                .short('i')
                .value_parser(value_parser!(u64).range(1..))
                .help("Time interval in seconds to run the benchmark")
                .default_value("10"),
        )
        .arg(
            Arg::new("sampling period")
                .short('s')
                .value_parser(value_parser!(u64))
                .help(
                    "The period to query jemalloc stats.allocated (ms). 0 for no sampling. \
                     Only supported on linux.",
                )
                .default_value("1"),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .help("Output CSV filename. Appends the data if the file already exists."),
        )
        .arg(
            Arg::new("dry run")
                .long("dry-run")
                .action(ArgAction::SetTrue)
                .help("Check whether the arguments are parsable, without running a benchmark"),
        )
}

pub fn setup() -> (Config, BenchWriter) {
    setup_from(std::env::args_os())
}

pub fn setup_from<I, T>(args: I) -> (Config, BenchWriter)
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let m = command().get_matches_from(args);

    let mm = m.get_one::<MM>("memory manager").copied().unwrap();
    let threads = m.get_one::<usize>("threads").copied().unwrap();
    let roots = m.get_one::<u32>("roots").copied().unwrap() as usize;
    let locals = m.get_one::<u32>("locals").copied().unwrap() as usize;
    let get_rate = match m.get_one::<u8>("get rate").copied().unwrap() {
        0 => GetRate::WriteOnly,
        1 => GetRate::ReadWrite,
        2 => GetRate::ReadIntensive,
        3 => GetRate::ReadOnly,
        _ => unreachable!("get_rate is invalid"),
    };
    let interval = m.get_one::<u64>("interval").copied().unwrap();
    let sampling_period = m.get_one::<u64>("sampling period").copied().unwrap();
    let sampling = sampling_period > 0 && cfg!(all(not(feature = "sanitize"), target_os = "linux"));
    let duration = Duration::from_secs(interval);

    let op_dist = WeightedIndex::new(get_rate.op_weights()).unwrap();

    let output = m
        .get_one::<String>("output")
        .map(|output_name| open_output(output_name));

    let config = Config {
        mm,
        threads,
        roots,
        locals,

        aux_thread: if sampling { 1 } else { 0 },
        aux_thread_period: Duration::from_millis(1),
        sampling,
        sampling_period: Duration::from_millis(sampling_period),

        get_rate,
        op_dist,
        root_dist: Uniform::from(0..roots),
        slot_dist: Uniform::from(0..locals),
        interval,
        duration,

        mem_sampler: MemSampler::new(),
    };
    log::debug!("parsed configuration: {}", config);

    if m.get_flag("dry run") {
        std::process::exit(0);
    }

    (config, BenchWriter { output })
}
