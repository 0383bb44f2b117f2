use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use tokio::signal::unix::signal;
use tokio::signal::unix::SignalKind;
use utils::logging;
use utils::version;

use v4l2l_device_plugin::config::Cli;
use v4l2l_device_plugin::config::Commands;
use v4l2l_device_plugin::config::DaemonArgs;
use v4l2l_device_plugin::config::DiscoveryArgs;
use v4l2l_device_plugin::config::PluginConfig;
use v4l2l_device_plugin::device::DeviceEnumerator;
use v4l2l_device_plugin::device::DeviceRegistry;
use v4l2l_device_plugin::kubelet_watcher::KubeletWatcher;
use v4l2l_device_plugin::plugin::V4l2lDevicePlugin;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon(daemon_args) => run_daemon(*daemon_args).await,
        Commands::ListDevices(discovery_args) => run_list_devices(discovery_args),
    }
}

fn enumerator(args: &DiscoveryArgs) -> DeviceEnumerator {
    DeviceEnumerator::new(&args.sysfs_dir, &args.dev_dir)
}

async fn run_daemon(daemon_args: DaemonArgs) -> Result<()> {
    let _guard = logging::init(
        &daemon_args.discovery.log_level,
        daemon_args.log_file.as_deref(),
    );

    tracing::info!("Starting v4l2l device plugin {}", &**version::VERSION);

    let devices = enumerator(&daemon_args.discovery)
        .enumerate()
        .map_err(|e| anyhow::anyhow!("{e:?}"))?;
    let registry = Arc::new(DeviceRegistry::new(devices));
    tracing::info!("advertising {} devices", registry.len());

    let config = PluginConfig::from(&daemon_args);
    let mut kubelet_watcher = if daemon_args.watch_kubelet {
        let watcher = KubeletWatcher::new(&config.device_plugin_dir, &config.kubelet_socket_name)
            .map_err(|e| anyhow::anyhow!("{e:?}"))?;
        Some(watcher)
    } else {
        None
    };

    let mut plugin = V4l2lDevicePlugin::new(config, registry);
    plugin
        .serve()
        .await
        .map_err(|e| anyhow::anyhow!("{e:?}"))
        .context("failed to start device plugin")?;

    let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received Ctrl+C, shutting down...");
                break;
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, shutting down...");
                break;
            }
            _ = kubelet_restarted(&mut kubelet_watcher) => {
                tracing::info!("kubelet socket re-created, registering again");
                plugin
                    .restart()
                    .await
                    .map_err(|e| anyhow::anyhow!("{e:?}"))
                    .context("failed to re-register device plugin")?;
            }
        }
    }

    plugin
        .stop()
        .await
        .map_err(|e| anyhow::anyhow!("{e:?}"))
        .context("failed to stop device plugin")?;

    tracing::info!("Device plugin stopped");
    Ok(())
}

/// Resolves on a kubelet restart, never when watching is disabled.
async fn kubelet_restarted(watcher: &mut Option<KubeletWatcher>) {
    match watcher {
        Some(watcher) => watcher.restarted().await,
        None => std::future::pending().await,
    }
}

fn run_list_devices(discovery_args: DiscoveryArgs) -> Result<()> {
    let _guard = logging::init(&discovery_args.log_level, None);

    let devices = enumerator(&discovery_args)
        .enumerate()
        .map_err(|e| anyhow::anyhow!("{e:?}"))?;

    for device in devices {
        println!("{}\t{}", device.id, device.path.display());
    }
    Ok(())
}
