use crate::ds_impl::Key;
use crate::MemSampler;
use clap::{value_parser, Arg, ArgAction, Command, ValueEnum};
use csv::Writer;
use rand::distributions::{Uniform, WeightedIndex};
use std::fmt;
use std::fs::{create_dir_all, File, OpenOptions};
use std::path::Path;
use std::time::Duration;

#[derive(PartialEq, Eq, Debug, ValueEnum, Clone, Copy)]
pub enum DS {
    /// Lock-free list with flags, marks and back-links.
    FRList,
    /// Hand-over-hand locking list.
    LockList,
}

impl DS {
    fn name(self) -> String {
        self.to_possible_value()
            .map(|v| v.get_name().to_string())
            .unwrap_or_else(|| format!("{:?}", self))
    }
}

#[derive(PartialEq, Debug)]
pub enum Op {
    Get,
    Insert,
    Remove,
}

impl Op {
    pub const OPS: [Op; 3] = [Op::Get, Op::Insert, Op::Remove];
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GetRate {
    WriteOnly = 0,
    ReadWrite = 1,
    ReadIntensive = 2,
    ReadOnly = 3,
}

impl GetRate {
    fn from_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(GetRate::WriteOnly),
            1 => Some(GetRate::ReadWrite),
            2 => Some(GetRate::ReadIntensive),
            3 => Some(GetRate::ReadOnly),
            _ => None,
        }
    }

    /// Weights of `Op::OPS`.
    fn op_weights(self) -> &'static [i32; 3] {
        match self {
            GetRate::WriteOnly => &[0, 1, 1],
            GetRate::ReadWrite => &[2, 1, 1],
            GetRate::ReadIntensive => &[18, 1, 1],
            GetRate::ReadOnly => &[1, 0, 0],
        }
    }
}

pub struct Config {
    pub ds: DS,
    pub threads: usize,

    pub aux_thread: usize,
    pub aux_thread_period: Duration,
    pub sampling: bool,
    pub sampling_period: Duration,

    pub get_rate: GetRate,
    pub op_dist: WeightedIndex<i32>,
    pub key_dist: Uniform<Key>,
    pub prefill: usize,
    pub key_range: Key,
    pub interval: u64,
    pub duration: Duration,

    pub mem_sampler: MemSampler,
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} threads, g{}, r{}, {}s",
            self.ds.name(),
            self.threads,
            self.get_rate as u8,
            self.key_range,
            self.interval,
        )
    }
}

pub struct BenchWriter {
    output: Option<Writer<File>>,
}

#[derive(Clone, Debug, Default)]
pub struct Perf {
    pub ops_per_sec: u64,
    pub peak_mem: usize,
    pub avg_mem: usize,
    pub peak_garb: usize,
    pub avg_garb: usize,
}

impl fmt::Display for Perf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ops/s: {}, peak mem: {}, avg_mem: {}, peak garb: {}, avg garb: {}",
            self.ops_per_sec,
            readable_bytes(self.peak_mem),
            readable_bytes(self.avg_mem),
            self.peak_garb,
            self.avg_garb
        )
    }
}

fn readable_bytes(num: usize) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = num as f64;
    for unit in &UNITS[..UNITS.len() - 1] {
        if value < 1000.0 {
            return format!("{:.3} {}", value, unit);
        }
        value /= 1024.0;
    }
    format!("{:.3} {}", value, UNITS[UNITS.len() - 1])
}

const HEADER: [&str; 10] = [
    "ds",
    "threads",
    "sampling_period",
    "get_rate",
    "throughput",
    "peak_mem",
    "avg_mem",
    "peak_garb",
    "avg_garb",
    "key_range",
];

impl BenchWriter {
    pub fn write_record(self, config: &Config, perf: &Perf) {
        if let Some(mut output) = self.output {
            output
                .write_record(&[
                    config.ds.name(),
                    config.threads.to_string(),
                    config.sampling_period.as_millis().to_string(),
                    (config.get_rate as u8).to_string(),
                    perf.ops_per_sec.to_string(),
                    perf.peak_mem.to_string(),
                    perf.avg_mem.to_string(),
                    perf.peak_garb.to_string(),
                    perf.avg_garb.to_string(),
                    config.key_range.to_string(),
                ])
                .expect("failed to write the benchmark record");
            output.flush().expect("failed to flush the benchmark output");
        }
    }
}

/// Opens `output_path` for appending, writing the header if the file is new.
fn open_output(output_path: &Path) -> Writer<File> {
    if let Some(dir) = output_path.parent().filter(|d| !d.as_os_str().is_empty()) {
        create_dir_all(dir)
            .unwrap_or_else(|e| panic!("failed to create {}: {}", dir.display(), e));
    }
    match OpenOptions::new().read(true).append(true).open(output_path) {
        Ok(f) => csv::Writer::from_writer(f),
        Err(_) => {
            let f = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(output_path)
                .unwrap_or_else(|e| panic!("failed to open {}: {}", output_path.display(), e));
            let mut output = csv::Writer::from_writer(f);
            // NOTE: `write_record` on `bench`
            output
                .write_record(HEADER)
                .expect("failed to write the benchmark header");
            output.flush().expect("failed to flush the benchmark output");
            output
        }
    }
}

fn command(name: String) -> Command {
    Command::new(name)
        .arg(
            Arg::new("data structure")
                .short('d')
                .value_parser(value_parser!(DS))
                .required(true)
                .ignore_case(true)
                .help("Data structure(s)"),
        )
        .arg(
            Arg::new("threads")
                .short('t')
                .value_parser(value_parser!(usize))
                .required(true)
                .help("Numbers of threads to run."),
        )
        .arg(
            Arg::new("get rate")
                .short('g')
                .help(
                    "The proportion of `contains`(read) operations. \
                     0: 0%, 1: 50%, 2: 90%, 3: 100%",
                )
                .value_parser(value_parser!(u8).range(0..4))
                .default_value("0"),
        )
        .arg(
            Arg::new("range")
                .short('r')
                .value_parser(value_parser!(Key).range(1..))
                .help("Key range: [0..RANGE]")
                .default_value("1000"),
        )
        .arg(
            Arg::new("interval")
                .short('i')
                .value_parser(value_parser!(u64))
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

pub fn setup(name: String) -> (Config, BenchWriter) {
    let m = command(name).get_matches();

    // Every argument below is either required or has a default.
    let ds = *m.get_one::<DS>("data structure").expect("required");
    let threads = *m.get_one::<usize>("threads").expect("required");
    let get_rate = GetRate::from_level(*m.get_one::<u8>("get rate").expect("defaulted"))
        .expect("get rate is validated by its parser");
    let key_range = *m.get_one::<Key>("range").expect("defaulted");
    let prefill = (key_range / 2) as usize;
    let key_dist = Uniform::from(0..key_range);
    let interval = *m.get_one::<u64>("interval").expect("defaulted");
    let sampling_period = *m.get_one::<u64>("sampling period").expect("defaulted");
    let sampling = sampling_period > 0 && cfg!(all(not(feature = "sanitize"), target_os = "linux"));
    let duration = Duration::from_secs(interval);

    let op_dist =
        WeightedIndex::new(get_rate.op_weights()).expect("every get rate has a nonzero weight");

    let output = m
        .get_one::<String>("output")
        .map(|output_name| open_output(Path::new(output_name)));
    let mem_sampler = MemSampler::new();
    let config = Config {
        ds,
        threads,

        aux_thread: if sampling { 1 } else { 0 },
        aux_thread_period: Duration::from_millis(1),
        sampling,
        sampling_period: Duration::from_millis(sampling_period),

        get_rate,
        op_dist,
        key_dist,
        prefill,
        key_range,
        interval,
        duration,

        mem_sampler,
    };

    if m.get_flag("dry run") {
        std::process::exit(0);
    }

    (config, BenchWriter { output })
}

#[cfg(test)]
mod tests {
    use super::{command, readable_bytes, GetRate, DS};

    #[test]
    fn parses_arguments() {
        let m = command("bench".to_string())
            .try_get_matches_from(["bench", "-d", "fr-list", "-t", "4", "-g", "2", "-r", "64"])
            .unwrap();
        assert_eq!(m.get_one::<DS>("data structure"), Some(&DS::FRList));
        assert_eq!(m.get_one::<usize>("threads"), Some(&4));
        assert_eq!(
            GetRate::from_level(*m.get_one::<u8>("get rate").unwrap()),
            Some(GetRate::ReadIntensive)
        );
        assert_eq!(m.get_one::<i64>("range"), Some(&64));
        assert_eq!(m.get_one::<u64>("interval"), Some(&10));
    }

    #[test]
    fn rejects_bad_arguments() {
        let cmd = || command("bench".to_string());
        assert!(cmd().try_get_matches_from(["bench", "-t", "4"]).is_err());
        assert!(cmd()
            .try_get_matches_from(["bench", "-d", "skip-list", "-t", "4"])
            .is_err());
        assert!(cmd()
            .try_get_matches_from(["bench", "-d", "lock-list", "-t", "4", "-g", "4"])
            .is_err());
        assert!(cmd()
            .try_get_matches_from(["bench", "-d", "lock-list", "-t", "4", "-r", "0"])
            .is_err());
    }

    #[test]
    fn formats_bytes() {
        assert_eq!(readable_bytes(512), "512.000 B");
        assert_eq!(readable_bytes(2048), "2.000 KiB");
        assert_eq!(readable_bytes(3 * 1024 * 1024), "3.000 MiB");
    }
}
