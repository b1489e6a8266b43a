use std::{path::PathBuf, process};

use clap::{Parser as ClapParser, Subcommand, ValueEnum};
use log::{info, warn};

use sharefix::{
    FalseSharingFinder, FinderCreateInfo, GatherStrategy, Level, ThreadRegistry, TypeMetadata,
    sim::{FieldKind, SimRuntime, SimSettings, SimThreads, TypeTable},
    system,
};

// raw HITM load event of Haswell-EP, used when the host has none
const REPLAY_EVENT: u64 = 0x10D3;

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// How much of the pipeline runs
    #[arg(long, value_enum, default_value_t = CliLevel::Detect)]
    level: CliLevel,

    /// Events between two samples
    #[arg(long)]
    sampling_period: Option<u64>,

    /// How hits are attributed to objects
    #[arg(long, value_enum, default_value_t = CliGather::BlockStart)]
    gather: CliGather,

    /// Append the tab separated hit report to this file at shutdown
    #[arg(long)]
    hit_report: Option<PathBuf>,

    /// Record and print per-stage timings
    #[arg(long)]
    timing: bool,

    /// Debug logging (RUST_LOG still wins)
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check whether this machine can sample HITM loads
    Check,
    /// Run a contended counter workload on the simulated runtime
    Demo {
        #[arg(long, default_value_t = 64)]
        instances: usize,
        #[arg(long, default_value_t = 4)]
        threads: usize,
        /// Safepoints to run, each after one burst of accesses
        #[arg(long, default_value_t = 3)]
        rounds: usize,
    },
    /// Time the attribution of synthetic hits
    SpeedTest {
        #[arg(default_value_t = 100_000)]
        count: u32,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum CliLevel {
    None,
    Detect,
    Repair,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum CliGather {
    BlockStart,
    SpaceWalk,
}

impl Cli {
    fn create_info(&self) -> FinderCreateInfo {
        FinderCreateInfo {
            level: Some(match self.level {
                CliLevel::None => Level::None,
                CliLevel::Detect => Level::Detect,
                CliLevel::Repair => Level::RepairOnline,
            }),
            sampling_period: self.sampling_period,
            gather: Some(match self.gather {
                CliGather::BlockStart => GatherStrategy::BlockStart,
                CliGather::SpaceWalk => GatherStrategy::SpaceWalk,
            }),
            hit_report: self.hit_report.clone(),
            timing: Some(self.timing),
            ..Default::default()
        }
    }
}

fn main() {
    let cli = Cli::parse();
    let default_filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let result = match &cli.command {
        Command::Check => check(&cli),
        Command::Demo {
            instances,
            threads,
            rounds,
        } => demo(&cli, *instances, *threads, *rounds),
        Command::SpeedTest { count } => speed_test(&cli, *count),
    };
    if let Err(err) = result {
        eprintln!("Error: {err}");
        process::exit(1);
    }
}

fn check(cli: &Cli) -> sharefix::Result<()> {
    let finder = FalseSharingFinder::new(cli.create_info())?;
    println!("HITM events: {:x?}", finder.events());
    let mut sampler = finder.perf_sampler();
    finder.thread_starting(&mut sampler);
    if sampler.is_ok() {
        println!("sampling available on this thread");
    } else {
        println!("events detected but perf_event_open refused them");
    }
    sampler.close();
    Ok(())
}

fn host_events() -> Vec<u64> {
    match system::detect_hitm_events() {
        Ok(events) => events.to_vec(),
        Err(err) => {
            warn!("{err}, replaying on event {REPLAY_EVENT:#x}");
            vec![REPLAY_EVENT]
        }
    }
}

fn demo(cli: &Cli, instances: usize, thread_count: usize, rounds: usize) -> sharefix::Result<()> {
    let finder = FalseSharingFinder::with_events(cli.create_info(), &host_events())?;

    let mut types = TypeTable::new();
    let counter = types.define(
        "Counter",
        TypeTable::OBJECT,
        &[("hits", FieldKind::Value), ("misses", FieldKind::Value)],
    );
    let mut rt = SimRuntime::new(&SimSettings::default(), types);
    let mut roots = Vec::with_capacity(instances);
    for _ in 0..instances {
        let Some(obj) = rt.alloc(counter) else {
            warn!("heap full after {} instances", roots.len());
            break;
        };
        roots.push(rt.add_root(obj));
    }

    let mut threads = SimThreads::new();
    for _ in 0..thread_count {
        let index = threads.spawn(finder.events(), finder.settings().timed_samples);
        if let Some(sampler) = threads.sampler_mut(index) {
            finder.thread_starting(sampler);
        }
    }

    for round in 0..rounds {
        for thread in 0..thread_count {
            for &root in &roots {
                let obj = rt.root(root);
                if let Some(field) = rt.field_address(obj, "misses") {
                    threads.access(thread, field);
                    let value = rt.read_field(obj, "misses").unwrap_or(0);
                    rt.write_field(obj, "misses", value + 1);
                }
            }
        }
        finder.begin_safepoint(&mut rt, &mut threads);
        finder.end_safepoint(&mut threads);
        info!(
            "round {round}: Counter is {} bytes, misses at {:?}",
            rt.types().instance_size(counter),
            rt.types().field_offset(counter, "misses")
        );
    }

    for thread in 0..thread_count {
        if let Some(sampler) = threads.sampler_mut(thread) {
            finder.thread_ending(sampler);
        }
    }
    finder.done(&rt, &mut threads)
}

fn speed_test(cli: &Cli, count: u32) -> sharefix::Result<()> {
    let finder = FalseSharingFinder::with_events(cli.create_info(), &[REPLAY_EVENT])?;
    let mut types = TypeTable::new();
    let node = types.define(
        "Node",
        TypeTable::OBJECT,
        &[("value", FieldKind::Value), ("next", FieldKind::Reference)],
    );
    let mut rt = SimRuntime::new(&SimSettings::default(), types);
    while rt.alloc(node).is_some() {}
    finder.speed_test(&rt, count);
    Ok(())
}
