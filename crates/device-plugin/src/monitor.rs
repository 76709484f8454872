use std::collections::HashSet;
use std::sync::Arc;
use std::sync::RwLock;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::registry::DeviceRegistry;
use crate::source::DeviceSource;

/// Capacity of the failure-event fanout. Failures are rare and a
/// lagged receiver falls back to resending a full snapshot.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Fans device-failure events out to every watch stream and keeps the
/// registry current even while no stream is connected.
pub struct HealthMonitor {
    events: broadcast::Sender<String>,
}

impl HealthMonitor {
    /// Starts the background watch over `ids`. The blocking vendor
    /// watch runs on the blocking pool; a separate applier task marks
    /// devices unhealthy as events arrive, so a watcher that connects
    /// later still gets a correct first snapshot. Both tasks stop when
    /// `token` is cancelled.
    pub fn start<S: DeviceSource + 'static>(
        source: Arc<S>,
        registry: Arc<RwLock<DeviceRegistry>>,
        ids: HashSet<String>,
        token: CancellationToken,
    ) -> Self {
        let (events, _) = broadcast::channel::<String>(EVENT_CHANNEL_CAPACITY);

        let mut applier_rx = events.subscribe();
        let applier_token = token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = applier_token.cancelled() => return,
                    event = applier_rx.recv() => match event {
                        Ok(id) => registry.write().expect("poisoned").mark_unhealthy(&id),
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!("health applier lagged by {missed} events");
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                }
            }
        });

        let watch_tx = events.clone();
        tokio::task::spawn_blocking(move || {
            match source.watch_health(&ids, &token, &watch_tx) {
                Ok(()) => info!("GPU health watch stopped"),
                Err(e) => error!("GPU health watch failed: {e}"),
            }
        });

        Self { events }
    }

    /// A receiver of failed-device ids for one watch stream.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::Ordering;
    use std::sync::mpsc as std_mpsc;
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::registry::DeviceInfo;
    use crate::registry::HealthStatus;
    use crate::source::SourceError;

    /// Replays ids handed in through a channel, honoring the id-set
    /// filter and the cancellation contract of a real source.
    struct ScriptedSource {
        script: Mutex<std_mpsc::Receiver<String>>,
        stopped: AtomicBool,
    }

    impl ScriptedSource {
        fn new() -> (Arc<Self>, std_mpsc::Sender<String>) {
            let (tx, rx) = std_mpsc::channel();
            let source = Arc::new(Self {
                script: Mutex::new(rx),
                stopped: AtomicBool::new(false),
            });
            (source, tx)
        }
    }

    impl DeviceSource for ScriptedSource {
        fn driver_version(&self) -> Result<String, SourceError> {
            Ok("999.99".to_string())
        }

        fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>, SourceError> {
            Ok(Vec::new())
        }

        fn watch_health(
            &self,
            ids: &HashSet<String>,
            token: &CancellationToken,
            events: &broadcast::Sender<String>,
        ) -> Result<(), SourceError> {
            let script = self.script.lock().unwrap();
            loop {
                if token.is_cancelled() {
                    self.stopped.store(true, Ordering::SeqCst);
                    return Ok(());
                }
                match script.recv_timeout(Duration::from_millis(10)) {
                    Ok(id) => {
                        if ids.contains(&id) {
                            let _ = events.send(id);
                        }
                    }
                    Err(std_mpsc::RecvTimeoutError::Timeout) => continue,
                    Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                        // keep honoring the cancellation contract
                        std::thread::sleep(Duration::from_millis(10));
                    }
                }
            }
        }

        fn shutdown(&self) -> Result<(), SourceError> {
            Ok(())
        }
    }

    fn registry_of(ids: &[&str]) -> Arc<RwLock<DeviceRegistry>> {
        let devices = ids
            .iter()
            .map(|id| DeviceInfo {
                id: id.to_string(),
                host_path: format!("/dev/nvidia-{id}"),
            })
            .collect();
        Arc::new(RwLock::new(DeviceRegistry::new(devices).unwrap()))
    }

    async fn wait_until<F: Fn() -> bool>(what: &str, check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {what}");
    }

    #[tokio::test]
    async fn events_reach_subscribers() {
        let registry = registry_of(&["gpu-0", "gpu-1"]);
        let (source, script) = ScriptedSource::new();
        let token = CancellationToken::new();
        let ids = registry.read().unwrap().ids();

        let monitor = HealthMonitor::start(source, registry, ids, token.clone());
        let mut rx = monitor.subscribe();

        script.send("gpu-1".to_string()).unwrap();
        let id = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no event within deadline")
            .unwrap();
        assert_eq!(id, "gpu-1");

        token.cancel();
    }

    #[tokio::test]
    async fn out_of_set_ids_are_filtered() {
        let registry = registry_of(&["gpu-0"]);
        let (source, script) = ScriptedSource::new();
        let token = CancellationToken::new();
        let ids = registry.read().unwrap().ids();

        let monitor = HealthMonitor::start(source, registry, ids, token.clone());
        let mut rx = monitor.subscribe();

        script.send("gpu-9".to_string()).unwrap();
        script.send("gpu-0".to_string()).unwrap();

        let id = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no event within deadline")
            .unwrap();
        assert_eq!(id, "gpu-0", "the unknown id must never be emitted");

        token.cancel();
    }

    #[tokio::test]
    async fn registry_is_updated_without_any_watcher() {
        let registry = registry_of(&["gpu-0", "gpu-1"]);
        let (source, script) = ScriptedSource::new();
        let token = CancellationToken::new();
        let ids = registry.read().unwrap().ids();

        let _monitor = HealthMonitor::start(source, registry.clone(), ids, token.clone());

        script.send("gpu-1".to_string()).unwrap();
        wait_until("registry to mark gpu-1 unhealthy", || {
            registry.read().unwrap().health("gpu-1") == Some(HealthStatus::Unhealthy)
        })
        .await;
        assert_eq!(
            registry.read().unwrap().health("gpu-0"),
            Some(HealthStatus::Healthy)
        );

        token.cancel();
    }

    #[tokio::test]
    async fn cancellation_stops_the_watch_within_bounded_time() {
        let registry = registry_of(&["gpu-0"]);
        let (source, _script) = ScriptedSource::new();
        let token = CancellationToken::new();
        let ids = registry.read().unwrap().ids();

        let _monitor = HealthMonitor::start(source.clone(), registry, ids, token.clone());

        token.cancel();
        wait_until("the watch loop to observe cancellation", || {
            source.stopped.load(Ordering::SeqCst)
        })
        .await;
    }
}
