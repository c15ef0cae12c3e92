use std::{
    fs::File,
    path::{Path, PathBuf},
    sync::Mutex,
    time::Duration,
};

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use wtop_core::{
    audio::{select_device, DeviceInventory},
    AppConfig, Command, KernelSnapshotSource, MonitorContext, ProcessTelemetry, ProcessView,
    RefreshRate, SamplingScheduler, SpectrumExtractor,
};

mod sampler;
mod terminal;

use sampler::SysinfoSampler;
use terminal::{KeyboardInput, TerminalRenderer};

fn main() -> wtop_core::Result<()> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Run(RunArgs::default()));

    init_tracing(&log_sink(&command))?;

    let config = load_config(cli.config.as_deref())?;
    match command {
        Commands::Run(args) => run_monitor(config, &args),
        Commands::Snapshot { json, interval } => run_snapshot(&config, json, interval),
        Commands::Devices => list_devices(),
    }
}

fn load_config(path: Option<&Path>) -> wtop_core::Result<AppConfig> {
    match path {
        Some(path) => AppConfig::load(path),
        None => Ok(AppConfig::default()),
    }
}

fn run_monitor(config: AppConfig, args: &RunArgs) -> wtop_core::Result<()> {
    let rate = args.rate.unwrap_or(config.refresh.rate);
    tracing::info!(%rate, party = args.party, "starting monitor");

    let sampler = SysinfoSampler::new();
    let cpu_count = sampler.cpu_count();
    let telemetry = ProcessTelemetry::new(KernelSnapshotSource::new(&config.telemetry), cpu_count);
    let extractor = SpectrumExtractor::new(config.audio.clone(), cpu_count);

    let mut context = MonitorContext::new(rate);
    let mut scheduler = SamplingScheduler::new(telemetry, sampler, extractor, &context);
    if args.party {
        scheduler.handle(&mut context, Command::ToggleParty);
    }

    let mut renderer = TerminalRenderer::enter()?;
    let mut input = KeyboardInput::new(rate);
    scheduler.run(&mut context, &mut renderer, &mut input)
}

fn run_snapshot(config: &AppConfig, json: bool, interval_ms: u64) -> wtop_core::Result<()> {
    let cpu_count = std::thread::available_parallelism().map_or(1, |n| n.get());
    let mut telemetry =
        ProcessTelemetry::new(KernelSnapshotSource::new(&config.telemetry), cpu_count);

    telemetry.refresh()?;
    std::thread::sleep(Duration::from_millis(interval_ms));
    let processes = ProcessView::default().apply(&telemetry.refresh()?);
    tracing::info!(processes = processes.len(), interval_ms, "snapshot taken");

    if json {
        println!("{}", serde_json::to_string_pretty(&processes)?);
    } else {
        println!("{}", terminal::process_header());
        for process in &processes {
            println!("{}", terminal::process_row(process));
        }
    }
    Ok(())
}

fn list_devices() -> wtop_core::Result<()> {
    let inventory = DeviceInventory::scan()?;
    for device in inventory.descriptors() {
        println!(
            "{:>3}  in:{} out:{}{}  {}",
            device.index,
            device.input_channels,
            device.output_channels,
            if device.is_default_output { " default" } else { "" },
            device.name
        );
    }

    match select_device(inventory.descriptors()) {
        Some(candidate) => println!(
            "selected: #{} {} (rule {}, loopback {})",
            candidate.device_index,
            candidate.display_name,
            candidate.rule,
            candidate.requires_loopback
        ),
        None => println!("no usable capture source"),
    }
    Ok(())
}

/// Where log events are written.
#[derive(Debug, PartialEq, Eq)]
enum LogSink {
    File(PathBuf),
    Stderr,
    /// No subscriber at all.
    Discard,
}

/// The live screen owns the terminal, so run mode only logs to a file.
fn log_sink(command: &Commands) -> LogSink {
    match command {
        Commands::Run(args) => args
            .log_file
            .clone()
            .map_or(LogSink::Discard, LogSink::File),
        _ => LogSink::Stderr,
    }
}

fn init_tracing(sink: &LogSink) -> wtop_core::Result<()> {
    match sink {
        LogSink::File(path) => {
            let file = File::create(path)?;
            let _ = tracing_subscriber::fmt()
                .with_env_filter(env_filter("info"))
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init();
        }
        LogSink::Stderr => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(env_filter("info"))
                .with_writer(std::io::stderr)
                .try_init();
        }
        LogSink::Discard => {}
    }
    Ok(())
}

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Terminal process monitor with an audio-reactive party mode", long_about = None)]
struct Cli {
    /// JSON configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the live monitor (default).
    Run(RunArgs),
    /// Sample the process table twice and print CPU usage per process.
    Snapshot {
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
        /// Milliseconds between the two samples.
        #[arg(short, long, default_value_t = 1000)]
        interval: u64,
    },
    /// List audio endpoints and the capture source that would be used.
    Devices,
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Refresh rate: slow, medium, fast, superfast, ultrafast, `<n>ms` or seconds.
    #[arg(short, long)]
    rate: Option<RefreshRate>,

    /// Start in party mode.
    #[arg(long)]
    party: bool,

    /// Write logs to this file.
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_invocation_runs_the_monitor() {
        let cli = Cli::try_parse_from(["wtop"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn run_flags_parse() {
        let cli = Cli::try_parse_from([
            "wtop", "run", "--rate", "250ms", "--party", "--log-file", "wtop.log",
        ])
        .unwrap();
        let Some(Commands::Run(args)) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.rate, Some(RefreshRate::Custom(Duration::from_millis(250))));
        assert!(args.party);
        assert_eq!(args.log_file, Some(PathBuf::from("wtop.log")));
    }

    #[test]
    fn snapshot_defaults_to_one_second() {
        let cli = Cli::try_parse_from(["wtop", "--config", "cfg.json", "snapshot", "--json"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("cfg.json")));
        match cli.command {
            Some(Commands::Snapshot { json, interval }) => {
                assert!(json);
                assert_eq!(interval, 1000);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn unknown_rate_is_rejected() {
        assert!(Cli::try_parse_from(["wtop", "run", "--rate", "warp"]).is_err());
    }

    #[test]
    fn party_is_a_flag_not_a_rate() {
        assert!(Cli::try_parse_from(["wtop", "run", "--rate", "party"]).is_err());
        assert!(Cli::try_parse_from(["wtop", "run", "--party"]).is_ok());
    }

    #[test]
    fn run_mode_never_logs_to_the_terminal() {
        let run = Commands::Run(RunArgs::default());
        assert_eq!(log_sink(&run), LogSink::Discard);

        let cli = Cli::try_parse_from(["wtop", "run", "--log-file", "wtop.log"]).unwrap();
        assert_eq!(
            log_sink(&cli.command.unwrap()),
            LogSink::File(PathBuf::from("wtop.log"))
        );

        let snapshot = Commands::Snapshot {
            json: false,
            interval: 10,
        };
        assert_eq!(log_sink(&snapshot), LogSink::Stderr);
        assert_eq!(log_sink(&Commands::Devices), LogSink::Stderr);
    }
}
