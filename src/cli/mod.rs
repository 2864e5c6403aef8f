//! Command-line interface for tasksyncd
//!
//! This module defines the CLI structure using clap derive macros.
//! Each subcommand is defined in its own submodule.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::error::{Error, Result};

mod add;
mod config;
mod init;
mod server;

/// tasksyncd - Taskwarrior synchronization server
///
/// A drop-in replacement for taskd: organizations and users live in a
/// plain directory tree, and clients sync over mutually-authenticated TLS.
#[derive(Parser, Debug)]
#[command(name = "tasksyncd")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the server data directory
    #[arg(long, global = true, env = "TASKDDATA")]
    pub data: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a server instance at the data directory
    Init,

    /// Create a new organization or user
    #[command(subcommand)]
    Add(AddCommands),

    /// Read or change configuration values
    #[command(subcommand)]
    Config(ConfigCommands),

    /// Run the server
    Server,
}

#[derive(Subcommand, Debug)]
pub enum AddCommands {
    /// Create a new organization
    Org {
        /// Organization name (no path separators)
        name: String,
    },

    /// Create a new user; prints the generated key, which the client
    /// software uses to identify the user (display names need not be
    /// unique)
    User {
        /// Organization the user belongs to
        org: String,

        /// Display name for the user
        name: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Print one configuration value
    Get { key: String },

    /// Set a configuration value
    Set { key: String, value: String },
}

impl Cli {
    pub fn run(&self) -> Result<()> {
        let data = self.data_dir()?;
        match &self.command {
            Commands::Init => init::run(&data),
            Commands::Add(command) => add::run(&data, command),
            Commands::Config(command) => config::run(&data, command),
            Commands::Server => server::run(&data),
        }
    }

    fn data_dir(&self) -> Result<PathBuf> {
        self.data.clone().ok_or_else(|| {
            Error::InvalidArgument(
                "you have to define either the $TASKDDATA variable or the --data flag".into(),
            )
        })
    }
}
