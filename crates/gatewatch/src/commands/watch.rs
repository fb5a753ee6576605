//! `watch`: stream canonical events from one or more devices.

use std::sync::Arc;
use std::time::Duration;

use gatewatch_config::parse_event_types;
use gatewatch_core::{EventMonitor, MonitorOptions};
use tokio_stream::{StreamExt, StreamMap};
use tracing::{info, warn};

use super::Context;
use crate::cli::{OutputFormat, WatchArgs};
use crate::error::CliError;
use crate::output;

fn options(ctx: &Context, args: &WatchArgs) -> Result<MonitorOptions, CliError> {
    let mut options = ctx.config.monitor_options()?;
    if args.polling {
        options.use_websocket = false;
    }
    if let Some(types) = &args.types {
        options.event_types = parse_event_types(types)?;
    }
    if let Some(ms) = args.interval_ms {
        options.polling_interval = Duration::from_millis(ms);
    }
    if let Some(retries) = args.max_retries {
        options.max_retries = retries;
    }
    Ok(options)
}

pub async fn handle(ctx: &Context, args: &WatchArgs, format: OutputFormat) -> Result<(), CliError> {
    let options = options(ctx, args)?;
    let monitor = EventMonitor::new(Arc::clone(&ctx.decryptor));

    let mut streams = StreamMap::new();
    let mut first_error = None;
    for device_id in &args.devices {
        let config = ctx.registry.get(device_id)?;
        match monitor.subscribe_to_events(config, options.clone()).await {
            Ok(stream) => {
                streams.insert(device_id.clone(), stream);
            }
            Err(e) => {
                warn!(device_id, error = %e, "could not subscribe");
                first_error.get_or_insert_with(|| CliError::from_core(device_id, e));
            }
        }
    }
    if streams.is_empty() {
        if let Some(err) = first_error {
            return Err(err);
        }
        return Ok(());
    }
    info!(devices = ?monitor.active_subscriptions(), "watching; Ctrl-C to stop");

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                info!("interrupted");
                break;
            }
            next = streams.next() => match next {
                Some((_, event)) => output::print_line(&event)?,
                // Every subscription has ended.
                None => break,
            },
        }
    }

    drop(streams);
    for device_id in monitor.active_subscriptions() {
        if let Err(e) = monitor.unsubscribe_from_events(&device_id).await {
            warn!(device_id, error = %e, "unsubscribe failed");
        }
    }
    // Stats survive unsubscribe; cleanup clears them.
    let stats = monitor.all_monitoring_stats();
    monitor.cleanup().await;
    output::print(&stats, format)
}
