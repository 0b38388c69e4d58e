//! avrprog - an in-system programmer for AVR microcontrollers
//!
//! The core cache/codec machinery lives in `avrprog-core`; programmer
//! drivers implement `avrprog_core::programmer::Programmer` and are opened
//! by name through the registry in [`programmers`]. This binary is the thin
//! command-line surface over both.

mod cli;
mod commands;
mod programmers;

use clap::Parser;
use cli::{Cli, Commands, ConfigCommands};

use avrprog_core::part::PartDatabase;
use std::path::{Path, PathBuf};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.verbose {
        0 => {} // default (info)
        1 => log::set_max_level(log::LevelFilter::Debug),
        _ => log::set_max_level(log::LevelFilter::Trace),
    }

    let db = match load_part_database(cli.part_db.as_deref()) {
        Ok(db) => db,
        Err(e) => {
            eprintln!("Failed to load part database: {e}");
            std::process::exit(1);
        }
    };
    log::debug!("{} part definitions loaded", db.len());

    match cli.command {
        Commands::Read {
            device,
            memory,
            output,
        } => commands::read::run(&db, &device, &memory, &output),
        Commands::Write {
            device,
            memory,
            input,
            no_verify,
        } => commands::write::run(&db, &device, &memory, &input, !no_verify),
        Commands::Erase { device } => commands::erase::run(&db, &device),
        Commands::Verify {
            device,
            memory,
            input,
        } => commands::verify::run(&db, &device, &memory, &input),
        Commands::Config(subcmd) => match subcmd {
            ConfigCommands::Get { device, name } => {
                commands::config::get(&db, &device, name.as_deref())
            }
            ConfigCommands::Set {
                device,
                name,
                value,
            } => commands::config::set(&db, &device, &name, &value),
        },
        Commands::ListParts { filter } => {
            commands::list::list_parts(&db, filter.as_deref());
            Ok(())
        }
        Commands::ListProgrammers => {
            commands::list::list_programmers();
            Ok(())
        }
    }
}

/// Load the part database from the specified path or default locations
fn load_part_database(path: Option<&Path>) -> Result<PartDatabase, Box<dyn std::error::Error>> {
    let mut db = PartDatabase::new();

    if let Some(path) = path {
        if path.is_dir() {
            db.load_dir(path)?;
        } else if path.is_file() {
            db.load_file(path)?;
        } else {
            return Err(format!("part database path not found: {}", path.display()).into());
        }
    } else {
        let default_paths = [
            PathBuf::from("parts"),
            PathBuf::from("/usr/share/avrprog/parts"),
        ];
        for dir in &default_paths {
            if dir.is_dir() {
                match db.load_dir(dir) {
                    Ok(count) => {
                        log::debug!("loaded {} parts from {}", count, dir.display());
                    }
                    Err(e) => {
                        log::warn!("failed to load parts from {}: {}", dir.display(), e);
                    }
                }
            }
        }
    }

    if db.is_empty() {
        log::debug!("using the built-in part database");
        db = PartDatabase::builtin().clone();
    }
    Ok(db)
}
