//! Bridge process entrypoint.

use clap::Parser;
use pushbridge::{BridgeConfig, BridgeResult, Supervisor};

/// Forward long-poll streaming events to message-bus sinks
#[derive(Debug, Parser)]
#[command(name = pushbridge::NAME, version = pushbridge::VERSION, about)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "pushbridge.toml")]
    config: String,

    /// Increase logging detail (-v: debug, -vv: debug including dependencies)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Args {
    /// Log level implied by the verbosity flags, unless the config overrides
    fn log_level(&self) -> Option<String> {
        match self.verbose {
            0 => None,
            1 => Some(format!("{}=debug", pushbridge::NAME)),
            _ => Some("debug".to_string()),
        }
    }
}

#[tokio::main]
async fn main() -> BridgeResult<()> {
    let args = Args::parse();

    let mut config = BridgeConfig::from_file(&args.config)?;
    config.apply_env_overrides();
    if let Some(level) = args.log_level() {
        config.log_level = level;
    }

    let mut supervisor = Supervisor::new(config)?;
    supervisor.run().await
}
