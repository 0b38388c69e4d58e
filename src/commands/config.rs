//! Configuration (fuse/lock) command implementations

use avrprog_core::config;
use avrprog_core::part::PartDatabase;
use avrprog_core::Error;

use crate::cli::DeviceArgs;

/// Flatten an ambiguity error into a message listing the candidates
fn describe(err: Error) -> Box<dyn std::error::Error> {
    if let Error::AmbiguousConfig { name, candidates } = &err {
        return format!(
            "configuration name \"{}\" is ambiguous: {}",
            name,
            candidates.join(", ")
        )
        .into();
    }
    Box::new(err)
}

fn print_item(
    s: &mut super::Session,
    name: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let value = config::get_value(&mut s.pgm, &s.part, name).map_err(describe)?;
    let item = config::locate(&s.part.config, name, config::prefix_match).map_err(describe)?;
    match config::value_name(item, value) {
        Some(sym) => println!("{:12} = 0x{:02x} ({})", item.name, value, sym),
        None => println!("{:12} = 0x{:02x}", item.name, value),
    }
    Ok(())
}

/// Run `config get`
pub fn get(
    db: &PartDatabase,
    device: &DeviceArgs,
    name: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut s = super::open(db, &device.part, &device.programmer, device.force)?;

    match name {
        Some(name) => print_item(&mut s, name)?,
        None => {
            let names: Vec<String> = s.part.config.iter().map(|it| it.name.clone()).collect();
            for name in names {
                print_item(&mut s, &name)?;
            }
        }
    }
    Ok(())
}

/// Run `config set`
pub fn set(
    db: &PartDatabase,
    device: &DeviceArgs,
    name: &str,
    value_text: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut s = super::open(db, &device.part, &device.programmer, device.force)?;

    let value = {
        let item = config::locate(&s.part.config, name, config::prefix_match).map_err(describe)?;
        config::resolve_value(item, value_text).map_err(describe)?
    };

    config::set_value(&mut s.pgm, &s.part, name, value).map_err(describe)?;
    print_item(&mut s, name)?;
    Ok(())
}
