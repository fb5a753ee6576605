//! `config path` / `config show`.

use crate::cli::{ConfigArgs, ConfigCommand, GlobalOpts};
use crate::error::CliError;

pub fn handle(args: &ConfigArgs, global: &GlobalOpts) -> Result<(), CliError> {
    match args.command {
        ConfigCommand::Path => {
            let path = global
                .config
                .clone()
                .unwrap_or_else(gatewatch_config::config_path);
            println!("{}", path.display());
        }
        ConfigCommand::Show => {
            let config = gatewatch_config::load_config(global.config.as_deref())?;
            print!("{}", config.redacted().to_toml()?);
        }
    }
    Ok(())
}
