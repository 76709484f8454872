use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::RwLock;

use device_plugin_pb::api::device_plugin_server::DevicePlugin;
use device_plugin_pb::api::device_plugin_server::DevicePluginServer;
use device_plugin_pb::api::registration_client::RegistrationClient;
use device_plugin_pb::api::AllocateRequest;
use device_plugin_pb::api::AllocateResponse;
use device_plugin_pb::api::DevicePluginOptions;
use device_plugin_pb::api::Empty;
use device_plugin_pb::api::ListAndWatchResponse;
use device_plugin_pb::api::PreStartContainerRequest;
use device_plugin_pb::api::PreStartContainerResponse;
use device_plugin_pb::api::PreferredAllocationRequest;
use device_plugin_pb::api::PreferredAllocationResponse;
use device_plugin_pb::api::RegisterRequest;
use futures::Stream;
use hyper_util::rt::TokioIo;
use tokio::net::UnixListener;
use tokio::net::UnixStream;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::transport::Endpoint;
use tonic::transport::Uri;
use tonic::Request;
use tonic::Response;
use tonic::Result as TonicResult;
use tonic::Status;
use tower::service_fn;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::allocate;
use crate::error::PluginError;
use crate::monitor::HealthMonitor;
use crate::paths::PathResolver;
use crate::registry::DeviceRegistry;
use crate::source::DeviceSource;

/// The GPU device plugin: device registry, health monitor, and
/// allocation broker behind the kubelet device-plugin protocol.
pub struct GpuDevicePlugin<S, P> {
    registry: Arc<RwLock<DeviceRegistry>>,
    monitor: HealthMonitor,
    source: Arc<S>,
    paths: Arc<P>,
    shutdown: CancellationToken,
    stopped: AtomicBool,
}

impl<S: DeviceSource + 'static, P: PathResolver + 'static> GpuDevicePlugin<S, P> {
    /// Builds the registry from a fresh enumeration, every device
    /// healthy, and starts health monitoring over the discovered ids.
    /// The registry is rebuilt from scratch on every startup; nothing
    /// survives a restart.
    pub fn new(source: Arc<S>, paths: Arc<P>) -> Result<Arc<Self>, PluginError> {
        let version = source.driver_version().map_err(PluginError::UnableToLoad)?;
        info!("found graphic driver of version {version}");

        let devices = source.enumerate_devices().map_err(PluginError::Enumeration)?;
        let registry = Arc::new(RwLock::new(DeviceRegistry::new(devices)?));

        let shutdown = CancellationToken::new();
        let ids = registry.read().expect("poisoned").ids();
        let monitor =
            HealthMonitor::start(source.clone(), registry.clone(), ids, shutdown.clone());

        Ok(Arc::new(Self {
            registry,
            monitor,
            source,
            paths,
            shutdown,
            stopped: AtomicBool::new(false),
        }))
    }

    /// Serves the device plugin API on `socket_path`, replacing any
    /// stale socket left behind by a previous run. The server runs
    /// until the shutdown signal is cancelled.
    pub async fn serve(self: Arc<Self>, socket_path: &Path) -> anyhow::Result<()> {
        info!("starting device plugin server on {}", socket_path.display());

        if socket_path.exists() {
            std::fs::remove_file(socket_path)?;
        }
        let listener = UnixListener::bind(socket_path)?;

        let token = self.shutdown.clone();
        let service = DevicePluginService::new(self);
        tokio::spawn(async move {
            let result = tonic::transport::Server::builder()
                .add_service(DevicePluginServer::new(service))
                .serve_with_incoming_shutdown(
                    tokio_stream::wrappers::UnixListenerStream::new(listener),
                    async move {
                        token.cancelled().await;
                        info!("shutting down device plugin server");
                    },
                )
                .await;
            if let Err(e) = result {
                error!("device plugin server failed: {e}");
            }
        });

        Ok(())
    }

    /// Announces this plugin's endpoint and resource name to the
    /// kubelet over its registration socket.
    pub async fn register_with_kubelet(
        &self,
        kubelet_socket: &Path,
        endpoint: &str,
        resource_name: &str,
    ) -> anyhow::Result<()> {
        info!("registering with kubelet at {}", kubelet_socket.display());

        let channel = uds_channel(kubelet_socket).await?;
        let mut client = RegistrationClient::new(channel);

        let request = RegisterRequest {
            version: device_plugin_pb::VERSION.to_string(),
            endpoint: endpoint.to_string(),
            resource_name: resource_name.to_string(),
            options: Some(plugin_options()),
        };
        client
            .register(Request::new(request))
            .await
            .map_err(|e| anyhow::anyhow!("registration failed: {e}"))?;

        info!("registered as {resource_name}");
        Ok(())
    }

    /// Cancels the shutdown signal and then releases the device
    /// source, in that order so in-flight streams and the monitor
    /// observe cancellation before the underlying resource goes away.
    /// Safe to call more than once.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("cancelling GPU monitoring");
        self.shutdown.cancel();
        if let Err(e) = self.source.shutdown() {
            warn!("device source shutdown failed: {e}");
        }
    }
}

/// Static capability set: no pre-start hook, no preferred-allocation
/// policy.
fn plugin_options() -> DevicePluginOptions {
    DevicePluginOptions {
        pre_start_required: false,
        get_preferred_allocation_available: false,
    }
}

/// Creates a client channel over a Unix domain socket. The HTTP URI
/// is a placeholder required by the endpoint builder; the connector
/// ignores it.
async fn uds_channel(socket_path: &Path) -> anyhow::Result<Channel> {
    let socket_path = socket_path.to_path_buf();

    let channel = Endpoint::from_static("http://localhost")
        .connect_with_connector(service_fn(move |_: Uri| {
            let socket_path = socket_path.clone();
            async move {
                match UnixStream::connect(socket_path).await {
                    Ok(stream) => Ok(TokioIo::new(stream)),
                    Err(e) => Err(Box::new(e) as Box<dyn std::error::Error + Send + Sync>),
                }
            }
        }))
        .await?;

    Ok(channel)
}

/// tonic service adapter over the plugin core.
pub struct DevicePluginService<S, P> {
    plugin: Arc<GpuDevicePlugin<S, P>>,
}

impl<S, P> DevicePluginService<S, P> {
    pub fn new(plugin: Arc<GpuDevicePlugin<S, P>>) -> Self {
        Self { plugin }
    }
}

#[tonic::async_trait]
impl<S: DeviceSource + 'static, P: PathResolver + 'static> DevicePlugin
    for DevicePluginService<S, P>
{
    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<DevicePluginOptions>> {
        debug!("reporting device plugin options");
        Ok(Response::new(plugin_options()))
    }

    type ListAndWatchStream =
        Pin<Box<dyn Stream<Item = Result<ListAndWatchResponse, Status>> + Send>>;

    /// Streams a full device snapshot immediately and again after
    /// every observed health change. Deltas are never sent; the
    /// receiver never has to reconcile partial updates.
    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<Self::ListAndWatchStream>> {
        info!("watch stream opened");

        let (tx, rx) = mpsc::unbounded_channel();
        let registry = self.plugin.registry.clone();
        let mut events = self.plugin.monitor.subscribe();
        let token = self.plugin.shutdown.clone();

        tokio::spawn(async move {
            let initial = ListAndWatchResponse {
                devices: registry.read().expect("poisoned").snapshot(),
            };
            debug!("sending initial device list: {initial:?}");
            if tx.send(Ok(initial)).is_err() {
                warn!("could not send initial device state, watcher is gone");
                return;
            }
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        info!("watch stream closed by shutdown");
                        return;
                    }
                    event = events.recv() => {
                        match event {
                            Ok(id) => {
                                registry.write().expect("poisoned").mark_unhealthy(&id);
                                warn!("device {id} is unhealthy");
                            }
                            // Skipped events were still applied to the
                            // registry; the snapshot below covers them.
                            Err(broadcast::error::RecvError::Lagged(missed)) => {
                                warn!("watch stream lagged by {missed} events");
                            }
                            Err(broadcast::error::RecvError::Closed) => return,
                        }
                        let snapshot = ListAndWatchResponse {
                            devices: registry.read().expect("poisoned").snapshot(),
                        };
                        if tx.send(Ok(snapshot)).is_err() {
                            warn!("could not send updated device state, watcher is gone");
                            return;
                        }
                    }
                }
            }
        });

        let stream = tokio_stream::wrappers::UnboundedReceiverStream::new(rx);
        Ok(Response::new(Box::pin(stream)))
    }

    async fn get_preferred_allocation(
        &self,
        request: Request<PreferredAllocationRequest>,
    ) -> TonicResult<Response<PreferredAllocationResponse>> {
        debug!("no allocation preference: {:?}", request.into_inner());
        Ok(Response::new(PreferredAllocationResponse {
            container_responses: Vec::new(),
        }))
    }

    /// Maps each container's requested device ids to concrete mount
    /// and device-spec instructions. Read-only with respect to the
    /// registry.
    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> TonicResult<Response<AllocateResponse>> {
        let req = request.into_inner();
        info!("allocating devices: {req:?}");

        let (lib_paths, bin_paths) = self
            .plugin
            .paths
            .accelerator_paths()
            .map_err(|e| Status::internal(format!("could not resolve accelerator paths: {e}")))?;
        debug!("accelerator libraries {lib_paths:?}, binaries {bin_paths:?}");

        let complementary = self.plugin.paths.complementary_devices().map_err(|e| {
            Status::internal(format!("could not enumerate complementary devices: {e}"))
        })?;
        debug!("complementary devices {complementary:?}");

        let mounts = allocate::build_mounts(&lib_paths, &bin_paths);

        let registry = self.plugin.registry.read().expect("poisoned");
        let mut container_responses = Vec::with_capacity(req.container_requests.len());
        for container_req in &req.container_requests {
            let response = allocate::container_response(
                &registry,
                &mounts,
                &complementary,
                &container_req.devices_ids,
            )
            .map_err(|e| Status::not_found(e.to_string()))?;
            container_responses.push(response);
        }

        Ok(Response::new(AllocateResponse { container_responses }))
    }

    async fn pre_start_container(
        &self,
        _request: Request<PreStartContainerRequest>,
    ) -> TonicResult<Response<PreStartContainerResponse>> {
        debug!("pre-start container is a no-op");
        Ok(Response::new(PreStartContainerResponse {}))
    }
}
