//! CLI argument parsing

use crate::programmers;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Generate dynamic help text for the programmer argument
fn programmer_help() -> String {
    format!(
        "Programmer to use [available: {}]",
        programmers::programmer_names_short()
    )
}

#[derive(Parser)]
#[command(name = "avrprog")]
#[command(author, version, about = "AVR in-system programmer", long_about = None)]
pub struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path to part database file or directory (contains .ron files).
    /// Defaults to ./parts/ and /usr/share/avrprog/parts/, falling back to
    /// the built-in database
    #[arg(long, global = true)]
    pub part_db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Options shared by every command that talks to a device
#[derive(clap::Args, Debug, Clone)]
pub struct DeviceArgs {
    /// Programmer to use
    #[arg(short, long, help = programmer_help())]
    pub programmer: String,

    /// Part to program (short id or full name, e.g. "m328p")
    #[arg(short = 't', long)]
    pub part: String,

    /// Skip the device signature check
    #[arg(long)]
    pub force: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Read a memory to a file
    Read {
        #[command(flatten)]
        device: DeviceArgs,

        /// Memory to read
        #[arg(short, long, default_value = "flash")]
        memory: String,

        /// Output file path (raw binary)
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Write a file to a memory
    Write {
        #[command(flatten)]
        device: DeviceArgs,

        /// Memory to write
        #[arg(short, long, default_value = "flash")]
        memory: String,

        /// Input file path (raw binary)
        #[arg(short, long)]
        input: PathBuf,

        /// Don't verify after writing
        #[arg(long)]
        no_verify: bool,
    },

    /// Erase the whole chip
    Erase {
        #[command(flatten)]
        device: DeviceArgs,
    },

    /// Verify a memory against a file
    Verify {
        #[command(flatten)]
        device: DeviceArgs,

        /// Memory to verify
        #[arg(short, long, default_value = "flash")]
        memory: String,

        /// Input file path to verify against (raw binary)
        #[arg(short, long)]
        input: PathBuf,
    },

    /// Get or set configuration bitfields (fuses, lock bits)
    #[command(subcommand)]
    Config(ConfigCommands),

    /// List supported parts
    ListParts {
        /// Filter by part name
        #[arg(long)]
        filter: Option<String>,
    },

    /// List supported programmers
    ListProgrammers,
}

/// Configuration subcommands
#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show one configuration item, or all of them
    Get {
        #[command(flatten)]
        device: DeviceArgs,

        /// Item name or unambiguous prefix (omit to show all)
        name: Option<String>,
    },

    /// Set a configuration item
    Set {
        #[command(flatten)]
        device: DeviceArgs,

        /// Item name or unambiguous prefix
        name: String,

        /// New value: a number or one of the item's symbolic values
        value: String,
    },
}
