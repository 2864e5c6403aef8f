//! `tasksyncd add` - create organizations and users

use std::path::Path;

use super::AddCommands;
use crate::error::Result;
use crate::repository::Repository;

pub fn run(data: &Path, command: &AddCommands) -> Result<()> {
    let repo = Repository::open(data)?;
    match command {
        AddCommands::Org { name } => {
            let org = repo.new_org(name)?;
            println!("Organization created: {}", org.name);
        }
        AddCommands::User { org, name } => {
            let user = repo.add_user(org, name)?;
            println!("User created: {} ({})", user.name, user.org);
            println!("Key: {}", user.key);
        }
    }
    Ok(())
}
