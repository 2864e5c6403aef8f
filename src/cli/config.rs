//! `tasksyncd config` - read and change configuration values

use std::path::Path;

use super::ConfigCommands;
use crate::error::{Error, Result};
use crate::repository::Repository;

pub fn run(data: &Path, command: &ConfigCommands) -> Result<()> {
    let mut repo = Repository::open(data)?;
    match command {
        ConfigCommands::Get { key } => {
            let value = repo
                .config()
                .get(key)
                .ok_or_else(|| Error::InvalidArgument(format!("unknown key: {key}")))?;
            println!("{value}");
        }
        ConfigCommands::Set { key, value } => {
            repo.config_mut().set(key, value);
            repo.config().save()?;
        }
    }
    Ok(())
}
