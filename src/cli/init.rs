//! `tasksyncd init` - initialize an empty repository

use std::path::Path;

use crate::error::Result;
use crate::repository::Repository;

pub fn run(data: &Path) -> Result<()> {
    let repo = Repository::create(data)?;
    println!("Empty repository initialized: {}", repo.root().display());
    Ok(())
}
