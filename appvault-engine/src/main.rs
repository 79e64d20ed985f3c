//! AppVault - command line entry point
//!
//! One invocation handles one package. The action runs on a blocking worker
//! while the main task waits for SIGINT/SIGTERM and cancels it.

use anyhow::{anyhow, Result};
use appvault_engine::actions::{ActionContext, BackupAction, RestoreAction};
use appvault_engine::daemon::shutdown::ShutdownCoordinator;
use appvault_engine::model::backup::DATE_FORMAT;
use appvault_engine::model::{find_backups, ActionResult, Category, Mode, Package};
use appvault_engine::{config::Config, pipeline, utils, wifi};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Run commands as the current user against a local backup directory
    #[arg(long, global = true)]
    unprivileged: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Back up one package into a new instance
    Backup {
        package: String,
        #[arg(short, long, default_value_t = 0)]
        user: u32,
        /// Comma-separated categories (apk,data,de,ext,obb,media) or "all"
        #[arg(short, long, default_value = "all")]
        mode: String,
    },
    /// Restore one package from a backup instance
    Restore {
        package: String,
        #[arg(short, long, default_value_t = 0)]
        user: u32,
        #[arg(short, long, default_value = "all")]
        mode: String,
        /// Instance date (YYYY-MM-DD-HH-MM-SS); newest when omitted
        #[arg(long)]
        date: Option<String>,
    },
    /// List the backup instances of a package
    List {
        package: String,
        /// Only instances of this profile
        #[arg(short, long)]
        user: Option<u32>,
    },
    /// Print the network commands a WifiConfigStore.xml restores to
    WifiCommands { file: PathBuf },
    /// Print a new X25519 key pair for the [encryption] section
    Keygen,
}

fn parse_mode(mode: &str) -> Result<Mode> {
    if mode.trim().eq_ignore_ascii_case("all") {
        return Ok(Mode::ALL);
    }
    let categories = mode
        .split(',')
        .filter(|c| !c.trim().is_empty())
        .map(Category::parse)
        .collect::<appvault_engine::Result<Vec<_>>>()?;
    if categories.is_empty() {
        return Err(anyhow!("empty mode"));
    }
    Ok(Mode::from_categories(&categories))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        Config::from_file(config_path)?
    } else {
        Config::default()
    };
    if args.unprivileged {
        let local = Config::unprivileged(&config.storage.backup_dir, &config.storage.cache_dir);
        config.shell = local.shell;
        config.storage = local.storage;
    }

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    let code = match args.command {
        Command::Keygen => {
            let (secret, public) = pipeline::generate_keypair();
            println!("secret_key = \"{}\"", hex::encode(secret));
            println!("public_key = \"{}\"", hex::encode(public));
            0
        }
        Command::WifiCommands { file } => {
            let xml = std::fs::read_to_string(&file)?;
            for command in wifi::restore_commands(&wifi::parse_networks(&xml)?) {
                println!("{}", command);
            }
            0
        }
        command => run_action(config, command).await?,
    };
    std::process::exit(code)
}

async fn run_action(config: Config, command: Command) -> Result<i32> {
    tracing::info!("Starting appvault v{}", env!("CARGO_PKG_VERSION"));

    let shutdown_coordinator = ShutdownCoordinator::new();
    let ctx = ActionContext::from_config(config)?.with_cancel(shutdown_coordinator.token());

    let mut worker = tokio::task::spawn_blocking(move || execute(&ctx, command));
    let joined = tokio::select! {
        joined = &mut worker => joined,
        _ = shutdown_coordinator.wait_for_signal() => {
            tracing::warn!("Waiting for the running step to finish");
            worker.await
        }
    };
    joined?
}

fn execute(ctx: &ActionContext, command: Command) -> Result<i32> {
    match command {
        Command::Backup {
            package,
            user,
            mode,
        } => {
            if ctx.matcher.is_ignored(&package) {
                tracing::info!("{} is ignored, nothing to do", package);
                return Ok(0);
            }
            let mode = parse_mode(&mode)?;
            let package = ctx.packages.lookup(&package, user)?;
            Ok(report(BackupAction::new(ctx).run(&package, mode)))
        }
        Command::Restore {
            package,
            user,
            mode,
            date,
        } => {
            let mode = parse_mode(&mode)?;
            let backup = find_backups(&ctx.storage, &package)?
                .into_iter()
                .filter(|b| b.profile_id == user)
                .find(|b| {
                    date.as_deref()
                        .map_or(true, |d| b.backup_date.format(DATE_FORMAT).to_string() == d)
                })
                .ok_or_else(|| anyhow!("no matching backup of {} for user {}", package, user))?;
            // not installed yet: the APK restore installs it
            let target = match ctx.packages.lookup(&package, user) {
                Ok(installed) => installed,
                Err(e) => {
                    tracing::info!("{} is not installed ({}), restoring as new", package, e);
                    Package::app(&package, user)
                }
            };
            Ok(report(RestoreAction::new(ctx).run(&target, &backup, mode)))
        }
        Command::List { package, user } => {
            let backups = find_backups(&ctx.storage, &package)?
                .into_iter()
                .filter(|b| user.map_or(true, |u| b.profile_id == u));
            for backup in backups {
                let categories: Vec<String> = Category::ALL
                    .into_iter()
                    .filter(|c| backup.has(*c))
                    .map(|c| c.to_string())
                    .collect();
                println!(
                    "{}  {} ({})  [{}]  {} bytes{}",
                    backup.instance_dir_name(),
                    backup.version_name,
                    backup.version_code,
                    categories.join(","),
                    backup.size,
                    if backup.is_encrypted() { "  encrypted" } else { "" }
                );
            }
            Ok(0)
        }
        Command::WifiCommands { .. } | Command::Keygen => Ok(0),
    }
}

fn report(result: ActionResult) -> i32 {
    if result.succeeded {
        println!("{}: ok", result.package_name);
        0
    } else {
        eprintln!("{}: {}", result.package_name, result.message);
        1
    }
}
