//! Command dispatch.

mod config_cmd;
mod device;
mod serve;
mod watch;

use std::sync::Arc;

use gatewatch_config::{Config, DeviceRegistry, PlaintextSecrets};
use gatewatch_core::{DeviceSessionManager, SecretDecryptor};

use crate::cli::{Cli, Command, GlobalOpts};
use crate::error::CliError;

/// Loaded configuration plus the collaborators built from it.
pub struct Context {
    pub config: Config,
    pub registry: Arc<DeviceRegistry>,
    pub decryptor: Arc<dyn SecretDecryptor>,
}

impl Context {
    fn load(global: &GlobalOpts) -> Result<Self, CliError> {
        let config = gatewatch_config::load_config(global.config.as_deref())?;
        let registry = Arc::new(config.device_registry()?);
        tracing::debug!(devices = ?registry.ids(), "configuration loaded");
        Ok(Self {
            config,
            registry,
            decryptor: Arc::new(PlaintextSecrets),
        })
    }

    pub fn session_manager(&self) -> DeviceSessionManager {
        DeviceSessionManager::new(
            Arc::clone(&self.registry) as Arc<dyn gatewatch_core::DeviceConfigSource>,
            Arc::clone(&self.decryptor),
        )
    }
}

pub async fn dispatch(cli: Cli) -> Result<(), CliError> {
    let global = cli.global;
    tracing::debug!(command = ?cli.command, "dispatching command");
    match cli.command {
        // Config commands work without a valid device table.
        Command::Config(args) => config_cmd::handle(&args, &global),
        Command::Probe(args) => {
            device::probe(&Context::load(&global)?, &args.device, global.output).await
        }
        Command::Health(args) => {
            device::health(&Context::load(&global)?, &args.device, global.output).await
        }
        Command::Watch(args) => watch::handle(&Context::load(&global)?, &args, global.output).await,
        Command::Serve(args) => serve::handle(&Context::load(&global)?, &args).await,
    }
}
