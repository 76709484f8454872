use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use tracing::info;

use gpu_device_plugin::config::Args;
use gpu_device_plugin::error::PluginError;
use gpu_device_plugin::logging;
use gpu_device_plugin::paths::find_executable;
use gpu_device_plugin::paths::NvidiaPathResolver;
use gpu_device_plugin::plugin::GpuDevicePlugin;
use gpu_device_plugin::source::NvmlDeviceSource;

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();

    let args = Args::parse();

    // Startup failures below are fatal and never retried; the
    // orchestrator restarts the process if it wants another attempt.
    let runtime = find_executable(&args.runtime_binary)
        .ok_or_else(|| PluginError::RuntimeNotFound(args.runtime_binary.clone()))?;
    info!("container runtime found at {}", runtime.display());

    let source = Arc::new(NvmlDeviceSource::load().map_err(PluginError::UnableToLoad)?);
    let paths = Arc::new(NvidiaPathResolver::new(&args.conf_dir));

    let plugin = GpuDevicePlugin::new(source, paths)?;

    plugin
        .clone()
        .serve(&args.plugin_socket())
        .await
        .context("could not start device plugin server")?;
    plugin
        .register_with_kubelet(&args.kubelet_socket_path(), &args.endpoint, &args.resource_name)
        .await
        .context("could not register with kubelet")?;

    wait_for_signal().await?;

    plugin.shutdown();
    Ok(())
}

async fn wait_for_signal() -> Result<()> {
    let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("could not install SIGTERM handler")?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        _ = term.recv() => info!("received SIGTERM"),
    }
    Ok(())
}
