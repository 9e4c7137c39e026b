mod commands;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use sysward::client::BusKind;
use sysward::{ActionHint, Config, TargetState};

#[derive(Parser)]
#[command(name = "sysward")]
#[command(about = "Keep groups of systemd units in the state you asked for")]
struct Args {
    /// Configuration file (drop-ins are read from <PATH>.d/*.conf)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Talk to the per-user service manager
    #[arg(long, global = true)]
    user: bool,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args)]
struct WaitArgs {
    /// Seconds to wait for the units to settle
    #[arg(long, default_value_t = 120)]
    timeout: u64,

    /// Return once every unit has been dispatched instead of waiting for
    /// it to settle (exits 2 unless everything already converged)
    #[arg(long)]
    no_wait: bool,
}

impl WaitArgs {
    fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

#[derive(Subcommand)]
enum Command {
    /// Bring targets up
    Up {
        #[arg(required = true)]
        names: Vec<String>,
        #[command(flatten)]
        wait: WaitArgs,
    },

    /// Bring targets down
    Down {
        #[arg(required = true)]
        names: Vec<String>,
        #[command(flatten)]
        wait: WaitArgs,
    },

    /// Restart targets' units
    Restart {
        #[arg(required = true)]
        names: Vec<String>,
        #[command(flatten)]
        wait: WaitArgs,
    },

    /// Reload targets' units (starting any that are not running)
    Reload {
        #[arg(required = true)]
        names: Vec<String>,
        #[command(flatten)]
        wait: WaitArgs,
    },

    /// Enable unit files and start the units
    Enable {
        #[arg(required = true)]
        names: Vec<String>,
        #[command(flatten)]
        wait: WaitArgs,
    },

    /// Disable unit files and stop the units
    Disable {
        #[arg(required = true)]
        names: Vec<String>,
        #[command(flatten)]
        wait: WaitArgs,
    },

    /// Show the current state of targets' units (all targets if none given)
    Status { names: Vec<String> },

    /// Drive targets to their configured state and follow progress
    Watch { names: Vec<String> },

    /// List configured targets
    List,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let path = args.config.unwrap_or_else(|| Config::default_path(args.user));
    let config = Config::load(&path).await?;
    log::debug!("Loaded {} target definition(s) from {}", config.targets.len(), path.display());

    let bus = if args.user { BusKind::Session } else { BusKind::System };

    let (names, target, hint, wait) = match args.command {
        Command::List => {
            commands::list(&config);
            return Ok(());
        }
        Command::Status { names } => {
            let code = commands::status(config, bus, &names).await?;
            std::process::exit(code);
        }
        Command::Watch { names } => {
            let code = commands::watch(config, bus, &names).await?;
            std::process::exit(code);
        }
        Command::Up { names, wait } => (names, TargetState::Active, ActionHint::None, wait),
        Command::Down { names, wait } => (names, TargetState::Inactive, ActionHint::None, wait),
        Command::Restart { names, wait } => (names, TargetState::Active, ActionHint::Restart, wait),
        Command::Reload { names, wait } => (names, TargetState::Active, ActionHint::Reload, wait),
        Command::Enable { names, wait } => (names, TargetState::Active, ActionHint::Enable, wait),
        Command::Disable { names, wait } => (names, TargetState::Inactive, ActionHint::Disable, wait),
    };

    let code = commands::converge(config, bus, &names, target, hint, wait.timeout(), !wait.no_wait).await?;
    std::process::exit(code);
}
