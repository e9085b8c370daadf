//! Configuration CLI commands.

use clap::{Args, Subcommand};
use std::path::PathBuf;

use kvmgr::{Result, ServiceConfig};

/// Configuration commands
#[derive(Subcommand, Debug)]
pub enum ConfigCmd {
    /// Print the built-in defaults as TOML
    Default(DefaultCmd),

    /// Load, validate and print the effective configuration
    Show(ShowCmd),
}

impl ConfigCmd {
    pub fn run(self) -> Result<()> {
        match self {
            ConfigCmd::Default(cmd) => cmd.run(),
            ConfigCmd::Show(cmd) => cmd.run(),
        }
    }
}

/// Print the built-in defaults as TOML
#[derive(Args, Debug)]
pub struct DefaultCmd {}

impl DefaultCmd {
    pub fn run(self) -> Result<()> {
        print!("{}", ServiceConfig::default().to_toml()?);
        Ok(())
    }
}

/// Load, validate and print the effective configuration
#[derive(Args, Debug)]
pub struct ShowCmd {
    /// Path to a TOML config file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,
}

impl ShowCmd {
    pub fn run(self) -> Result<()> {
        let config = ServiceConfig::load(self.config.as_deref())?;
        config.validate()?;
        print!("{}", config.to_toml()?);
        Ok(())
    }
}
