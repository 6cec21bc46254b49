use std::{io, path::PathBuf, process::ExitCode, sync::Arc, time::Duration};

use clap::Parser;
use color_eyre as ey;
use curio_content::{
    AssetGuid, Curator, CuratorConfig, CuratorEvent, CuratorWatcher, DocumentType, PassthroughTransformer, TransformFlags,
};
use curio_shared::{
    itertools::Itertools,
    log::{self, info},
};
use ey::eyre::{eyre, Context};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CommandLineArguments {
    /// Configuration file of the curator
    #[arg(short, long, default_value = "curio.yaml")]
    config: PathBuf,

    /// Log everything down to trace messages
    #[arg(short, long)]
    verbose: bool,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Parser, Debug)]
enum Command {
    /// Scans the data directories and prints the assets
    Scan,
    /// Transforms all assets for a platform profile
    Transform {
        profile: String,

        /// Transform even if the output is up to date
        #[clap(short, long)]
        force: bool,
    },
    /// Prints the assets that depend on or reference an asset
    Uses {
        guid: String,

        /// Include indirect users
        #[clap(short, long)]
        transitive: bool,
    },
    /// Counts the assets per transform state
    Stats {
        /// Profile to evaluate. The active profile when omitted.
        profile: Option<String>,
    },
    /// Keeps watching the data directories and prints the events of the curator
    Watch,
}

fn setup_logging(verbose: bool) -> ey::Result<()> {
    let level = if verbose {
        log::LevelFilter::Trace
    } else {
        log::LevelFilter::Info
    };
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                curio_shared::chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(level)
        .level_for("notify", log::LevelFilter::Warn)
        .chain(io::stdout())
        .apply()
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
    Ok(())
}

fn create_curator(config: CuratorConfig) -> ey::Result<Curator> {
    let passthrough_types = config.passthrough_types.clone();
    let mut curator = Curator::new(config).wrap_err("Failed to create the curator")?;
    for passthrough_type in passthrough_types {
        let extensions = passthrough_type.extensions.iter().map(String::as_str).collect::<Vec<_>>();
        let document_type = DocumentType::new(&passthrough_type.name, &extensions, passthrough_type.version);
        curator = curator
            .register(document_type, Arc::new(PassthroughTransformer))
            .wrap_err_with(|| format!("Failed to register document type '{}'", passthrough_type.name))?;
    }
    Ok(curator)
}

fn main() -> ey::Result<ExitCode> {
    color_eyre::install()?;
    let command_line_arguments = CommandLineArguments::parse();
    setup_logging(command_line_arguments.verbose)?;

    #[cfg(feature = "deadlock_detection")]
    deadlock_detection::start().wrap_err("Failed to start the deadlock detection")?;

    let config = CuratorConfig::from_yaml_file(&command_line_arguments.config)
        .wrap_err_with(|| format!("Failed to read '{}'", command_line_arguments.config.display()))?;
    let curator = create_curator(config)?;

    let stats = curator.scan().wrap_err("Failed to scan the data directories")?;
    info!("Scan finished: {} files, {} hashed, {} skipped", stats.visited, stats.changed, stats.skipped);

    match &command_line_arguments.command {
        Command::Scan => {
            let lines = curator
                .assets()
                .iter()
                .filter_map(|guid| curator.asset_info(guid))
                .sorted_by(|a, b| a.path.cmp(&b.path))
                .map(|asset_info| format!("{} {:<16} {}", asset_info.guid, asset_info.document_type, asset_info.path.display()))
                .join("\n");
            println!("{lines}");
            for (path, guid) in curator.collisions() {
                println!("collision: '{}' claims {guid}", path.display());
            }
        }
        Command::Transform { profile, force } => {
            let mut flags = TransformFlags::TRIGGERED_MANUALLY;
            if *force {
                flags |= TransformFlags::FORCE_TRANSFORM;
            }
            let report = curator.transform_all(flags, profile)?;
            println!("{report}");
            for failure in &report.failures {
                println!("failed: {} {}", failure.guid, failure.message);
            }
            if !report.is_success() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Uses { guid, transitive } => {
            let guid: AssetGuid = guid.parse().map_err(|err| eyre!("Invalid GUID '{guid}': {err}"))?;
            if curator.asset_info(&guid).is_none() {
                return Err(eyre!("Unknown asset {guid}"));
            }
            let lines = curator
                .find_uses(&guid, *transitive)
                .iter()
                .map(|user| match curator.asset_info(user) {
                    Some(asset_info) => format!("{user} {}", asset_info.path.display()),
                    None => format!("{user} <missing>"),
                })
                .join("\n");
            println!("{lines}");
        }
        Command::Stats { profile } => {
            let profile = profile.clone().unwrap_or_else(|| curator.active_profile().name);
            let stats = curator.transform_stats(&profile)?;
            print!("{stats}");
        }
        Command::Watch => {
            let events = curator.observe();
            let curator = Arc::new(curator);
            let directories = curator.data_directories().to_vec();
            let _watcher = CuratorWatcher::new(curator.clone(), &directories, Duration::from_millis(500))?;
            info!("Watching for changes. Press Ctrl+C to stop.");
            for event in events {
                match event {
                    CuratorEvent::AssetStateChanged { guid, profile, old, new } => {
                        println!("{guid} [{profile}] {old} -> {new}")
                    }
                    event => println!("{event:?}"),
                }
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

#[cfg(feature = "deadlock_detection")]
mod deadlock_detection {
    use std::{
        io,
        thread::{self, JoinHandle},
        time::Duration,
    };

    use curio_shared::{
        log::{error, info},
        parking_lot::deadlock,
    };

    /// Checks the `parking_lot` locks for deadlocks once per second for the rest of the process.
    pub fn start() -> io::Result<JoinHandle<()>> {
        thread::Builder::new().name("Deadlock detection".to_owned()).spawn(|| {
            info!("Deadlock detection thread started");
            loop {
                thread::sleep(Duration::from_secs(1));
                report_deadlocks();
            }
        })
    }

    /// Logs all deadlocks and returns their number.
    pub fn report_deadlocks() -> usize {
        let deadlocks = deadlock::check_deadlock();
        if deadlocks.is_empty() {
            return 0;
        }

        error!("{} deadlocks detected", deadlocks.len());
        for (i, threads) in deadlocks.iter().enumerate() {
            error!("Deadlock #{i}");
            for t in threads {
                error!("Thread Id {:#?}", t.thread_id());
                error!("{:#?}", t.backtrace());
            }
        }
        deadlocks.len()
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn detection_thread_keeps_running() {
            let handle = start().unwrap();
            thread::sleep(Duration::from_millis(50));
            assert!(!handle.is_finished());
            assert_eq!(handle.thread().name(), Some("Deadlock detection"));
        }

        #[test]
        fn no_deadlocks_without_locks() {
            assert_eq!(report_deadlocks(), 0);
        }
    }
}
