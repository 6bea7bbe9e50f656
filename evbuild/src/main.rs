use argh::FromArgs;
use evbuild::align::TimeAlignment;
use evbuild::l1::L1Builder;
use evbuild::l2::L2Engine;
use evbuild::{files, TIME_SETTINGS_FILE};
use hittools::cfg::Settings;
use hittools::err::{Error, Result};
use std::path::{Path, PathBuf};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(FromArgs, Debug)]
/// offline event-builder pipeline for digitiser hit files
struct Cli {
    /// settings file (default: settings.json)
    #[argh(option, default = "String::from(\"settings.json\")")]
    settings: String,

    /// log filter, e.g. "info" or "evbuild=debug" (overrides RUST_LOG)
    #[argh(option)]
    log: Option<String>,

    /// pipeline stage to run
    #[argh(subcommand)]
    command: Command,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand)]
enum Command {
    Init(InitArgs),
    Time(TimeArgs),
    L1(L1Args),
    L2(L2Args),
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "init")]
/// write configuration templates into the working directory
struct InitArgs {
    /// number of modules
    #[argh(option, default = "11")]
    modules: u32,

    /// channels per module
    #[argh(option, default = "32")]
    channels: u32,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "time")]
/// compute per-channel time offsets from raw hit files
struct TimeArgs {}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "l1")]
/// build coincidence events from raw hit files
struct L1Args {}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "l2")]
/// filter L1 events by the condition program
struct L2Args {}

fn main() {
    let cli: Cli = argh::from_env();

    let filter = match &cli.log {
        Some(directive) => EnvFilter::new(directive),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(&cli) {
        Ok(()) => {}
        Err(e @ Error::Cancelled) => {
            info!("stopped by interrupt; partial outputs kept");
            std::process::exit(e.exit_code());
        }
        Err(e) => {
            error!("{e}");
            std::process::exit(e.exit_code());
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    let cwd = PathBuf::from(".");

    if let Command::Init(args) = &cli.command {
        files::write_templates(&cwd, args.modules, args.channels)?;
        info!("templates written; edit settings.json and channelSettings.json before running");
        return Ok(());
    }

    let settings = Settings::load(Path::new(&cli.settings))?;
    let n_workers = resolve_workers(settings.number_of_thread);

    match &cli.command {
        Command::Init(_) => unreachable!(),
        Command::Time(_) => {
            let files = input_files(&settings)?;
            let mut align = TimeAlignment::new(&cwd);
            align.load_channel_settings(Path::new(&settings.channel_settings))?;
            align.load_file_list(files)?;
            align.set_time_window(settings.time_window);
            align.cancel_token().hook_interrupt();
            align.run(n_workers)?;
        }
        Command::L1(_) => {
            let files = input_files(&settings)?;
            let mut builder = L1Builder::new(&cwd);
            builder.load_channel_settings(Path::new(&settings.channel_settings))?;
            builder.load_file_list(files)?;
            builder.load_time_offsets(&cwd.join(TIME_SETTINGS_FILE))?;
            builder.set_coincidence_window(settings.coincidence_window);
            builder.set_reference(
                settings.time_reference_mod as usize,
                settings.time_reference_ch as usize,
            );
            builder.cancel_token().hook_interrupt();
            builder.build(n_workers)?;
        }
        Command::L2(_) => {
            let mut engine = L2Engine::new(&cwd);
            engine.load_channel_settings(Path::new(&settings.channel_settings))?;
            engine.load_conditions(Path::new(&settings.l2_settings))?;
            engine.cancel_token().hook_interrupt();
            engine.build(n_workers)?;
        }
    }
    Ok(())
}

fn input_files(settings: &Settings) -> Result<Vec<PathBuf>> {
    let files = files::run_files(
        Path::new(&settings.directory),
        settings.run_number,
        settings.start_version,
        settings.end_version,
    )?;
    if files.is_empty() {
        return Err(Error::Validation(format!(
            "no input files for run {} versions {}..={} in {}",
            settings.run_number, settings.start_version, settings.end_version, settings.directory
        )));
    }
    info!(files = files.len(), "input files found");
    Ok(files)
}

fn resolve_workers(requested: u32) -> u32 {
    if requested > 0 {
        return requested;
    }
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1)
}
