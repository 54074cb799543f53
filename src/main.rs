mod command;
mod config;
mod devices;
mod error;
mod events;
mod execution;
mod project;
mod transport;

use anyhow::Result;
use command::{CommandDispatcher, HandlerContext, Router};
use config::PlatformConfig;
use devices::{DeviceSynchronizer, ModelRegistry};
use events::{DeviceNotifier, EventHub, OutputSink};
use execution::ExecutionSupervisor;
use project::ProjectManager;
use std::sync::Arc;
use tokio::task::JoinSet;
use transport::{BleTransport, Transport, TransportContext, WebSocketTransport};

use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let config = PlatformConfig::load()?;
    info!("Control plane starting");
    info!("  Workspace: {}", config.workspace_root.display());
    info!("  WebSocket: {}", config.ws_addr);

    let hub = Arc::new(EventHub::new());

    let supervisor = Arc::new(
        ExecutionSupervisor::new(hub.clone()).with_heartbeat_timeout(config.heartbeat_timeout()),
    );
    let _watchdog = supervisor.start_watchdog(config.watchdog_interval());
    info!("Execution watchdog started");

    let devices = Arc::new(DeviceSynchronizer::new(ModelRegistry::with_builtin(), hub.clone()));
    let projects = Arc::new(ProjectManager::new(
        config.workspace_root.clone(),
        config.default_name.clone(),
    ));

    let router = Router::new(HandlerContext {
        supervisor: supervisor.clone(),
        devices: devices.clone(),
        projects: projects.clone(),
        model_file: config.model_file.clone(),
    });
    let (dispatcher, worker) = CommandDispatcher::spawn(Arc::new(router), config.dispatcher_queue);

    let ctx = TransportContext {
        dispatcher,
        supervisor: supervisor.clone(),
        devices: devices.clone(),
        projects,
    };

    let mut transports = JoinSet::new();
    let ws = Arc::new(WebSocketTransport::new(config.ws_addr.clone(), ctx.clone()));
    start(&mut transports, &hub, ws);

    if config.ble_enabled {
        let ble = Arc::new(BleTransport::new(ctx, config.fragment_staleness()));
        start(&mut transports, &hub, ble);
    } else {
        info!("BLE transport disabled");
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
            done = transports.join_next() => match done {
                Some(Ok((name, Ok(())))) => warn!("{} transport stopped", name),
                Some(Ok((name, Err(e)))) => error!("{} transport failed: {:#}", name, e),
                Some(Err(e)) => error!("Transport task panicked: {}", e),
                None => {
                    error!("No transports left");
                    break;
                }
            },
        }
    }

    supervisor.kill();
    worker.abort();
    devices.unload().await;
    Ok(())
}

/// Subscribe a transport to program output and device changes, then serve it
fn start<T>(set: &mut JoinSet<(&'static str, Result<()>)>, hub: &EventHub, transport: Arc<T>)
where
    T: Transport + 'static,
{
    hub.add_sink(transport.clone() as Arc<dyn OutputSink>);
    hub.add_notifier(transport.clone() as Arc<dyn DeviceNotifier>);

    let name = transport.name();
    info!("Starting {} transport", name);
    set.spawn(async move { (name, transport.serve().await) });
}
