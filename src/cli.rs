//! Command-line argument parsing.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "qbouncer",
    version,
    about = "WireGuard NAT-PMP port bouncer for qBittorrent"
)]
pub struct Cli {
    /// Path to configuration file (TOML format)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose (DEBUG) logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Set log level
    #[arg(long, value_parser = ["DEBUG", "INFO", "WARNING", "ERROR"], default_value = "INFO")]
    pub log_level: String,
}

impl Cli {
    /// The log level to apply before configuration has been loaded:
    /// `--verbose` always wins, otherwise whatever `--log-level` resolved
    /// to (its own default is `INFO`).
    pub fn initial_log_level(&self) -> &str {
        if self.verbose {
            "DEBUG"
        } else {
            &self.log_level
        }
    }

    /// True if the user passed `--log-level` explicitly, rather than
    /// relying on its default — used to decide whether the configuration
    /// file's `log_level` should override it.
    pub fn log_level_explicit(&self) -> bool {
        self.log_level != "INFO"
    }
}
