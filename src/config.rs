//! Explicit run configuration.
//!
//! Replaces the Python original's `Config` (`config.py`), which routed
//! every attribute access through `__getattribute__` into a dict loaded
//! from YAML — any typo silently returned `None` instead of failing to
//! parse. This crate takes its configuration from `clap`-parsed CLI
//! arguments into a plain typed struct instead, per spec.md §9 Design
//! Notes; unknown flags are rejected by `clap` itself.

use clap::Parser;
use std::path::PathBuf;

/// A minimal leaf BitTorrent client.
#[derive(Debug, Parser)]
#[command(name = "leafbit", version, about)]
pub struct Cli {
    /// Path to the .torrent metainfo file.
    #[arg(short, long)]
    pub file: PathBuf,

    /// Directory to save downloaded files and piece cache under.
    #[arg(short, long, default_value = ".")]
    pub path: PathBuf,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long, default_value = "info")]
    pub log: String,

    /// Local TCP port to advertise to trackers.
    #[arg(long, default_value_t = crate::driver::DEFAULT_PORT)]
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub file_path: PathBuf,
    pub save_path: PathBuf,
    pub log_level: String,
    pub port: u16,
}

impl From<Cli> for Config {
    fn from(cli: Cli) -> Config {
        Config {
            file_path: cli.file,
            save_path: cli.path,
            log_level: cli.log,
            port: cli.port,
        }
    }
}
