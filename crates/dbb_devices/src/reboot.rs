//! Rebooting every device attached to a bot.
//!
//! A [RebootCoordinator] reboots devices on a pool of at most [RebootConfig::max_workers]
//! tasks. Workers pull devices off a shared queue, so each device is rebooted exactly once
//! regardless of pool size. A device that never comes back is recorded as
//! [RebootOutcome::Unresponsive] and does not disturb its siblings; any other device error
//! aborts the whole operation.

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use dbb_utils::log_assert;
use dbb_utils::timeout_future::TimeoutFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::instrument;

use crate::{DeviceConnector, DeviceDiscovery, DeviceError, DeviceId};

/// Overall deadline for a fleet reboot.
pub const DEFAULT_REBOOT_TIMEOUT: Duration = Duration::from_secs(99_999);

pub const DEFAULT_MAX_REBOOT_WORKERS: usize = 16;

/// Configuration for a [RebootCoordinator].
#[derive(Debug, Clone)]
pub struct RebootConfig {
    /// Upper bound on concurrently rebooting devices.
    pub max_workers: NonZeroUsize,
    /// Deadline for all reboots to finish. Missing it is fatal.
    pub timeout: Duration,
    /// Skip all device I/O.
    pub dry_run: bool,
}

impl Default for RebootConfig {
    fn default() -> Self {
        Self {
            max_workers: NonZeroUsize::new(DEFAULT_MAX_REBOOT_WORKERS)
                .unwrap_or(NonZeroUsize::MIN),
            timeout: DEFAULT_REBOOT_TIMEOUT,
            dry_run: false,
        }
    }
}

#[derive(Debug)]
pub enum RebootOutcome {
    Healthy,
    Unresponsive(DeviceError),
}

impl RebootOutcome {
    pub fn is_healthy(&self) -> bool {
        matches!(self, RebootOutcome::Healthy)
    }
}

/// Per-device outcomes, in the order the devices were given.
#[derive(Debug, Default)]
pub struct RebootReport {
    outcomes: Vec<(DeviceId, RebootOutcome)>,
}

impl RebootReport {
    pub fn outcomes(&self) -> &[(DeviceId, RebootOutcome)] {
        &self.outcomes
    }

    pub fn devices(&self) -> impl Iterator<Item = &DeviceId> {
        self.outcomes.iter().map(|(device, _)| device)
    }

    /// Devices that failed to come back, in input order.
    pub fn failed_devices(&self) -> Vec<&DeviceId> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| !outcome.is_healthy())
            .map(|(device, _)| device)
            .collect()
    }

    pub fn all_healthy(&self) -> bool {
        self.outcomes.iter().all(|(_, outcome)| outcome.is_healthy())
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum RebootError {
    #[error("failed to reboot {device}: {source}")]
    Device {
        device: DeviceId,
        #[source]
        source: DeviceError,
    },
    #[error("device reboots did not complete within {0:?}")]
    TimedOut(Duration),
    #[error("reboot worker panicked: {0}")]
    WorkerPanicked(String),
    #[error("failed to list attached devices: {0}")]
    Discovery(#[source] DeviceError),
}

pub struct RebootCoordinator {
    config: RebootConfig,
    connector: Arc<dyn DeviceConnector>,
    discovery: Arc<dyn DeviceDiscovery>,
}

impl RebootCoordinator {
    pub fn new(
        config: RebootConfig,
        connector: Arc<dyn DeviceConnector>,
        discovery: Arc<dyn DeviceDiscovery>,
    ) -> Self {
        Self {
            config,
            connector,
            discovery,
        }
    }

    pub fn config(&self) -> &RebootConfig {
        &self.config
    }

    /// Attached physical devices. Always empty in a dry run.
    pub async fn attached_devices(&self) -> Result<Vec<DeviceId>, RebootError> {
        if self.config.dry_run {
            return Ok(vec![]);
        }
        self.discovery
            .list_attached_devices(false)
            .await
            .map_err(RebootError::Discovery)
    }

    /// Reboots all `devices` concurrently and waits for them to come back.
    pub async fn reboot_devices(&self, devices: &[DeviceId]) -> Result<RebootReport, RebootError> {
        if devices.is_empty() || self.config.dry_run {
            return Ok(RebootReport::default());
        }

        let pool_size = devices.len().min(self.config.max_workers.get());
        tracing::debug!(num_devices = devices.len(), pool_size, "starting reboot pool");

        let queue: DeviceQueue = Arc::new(Mutex::new(
            devices.iter().cloned().enumerate().collect(),
        ));
        let mut pool = RebootPool::start(pool_size, queue, &self.connector);

        let timeout = self.config.timeout;
        let mut outcomes = match TimeoutFuture::new(pool.join(), timeout).wait().await {
            Some(joined) => joined?,
            None => {
                tracing::error!(?timeout, "device reboots timed out");
                return Err(RebootError::TimedOut(timeout));
            }
        };

        outcomes.sort_by_key(|(index, _)| *index);
        log_assert!(
            outcomes.len() == devices.len(),
            num_outcomes = outcomes.len(),
            num_devices = devices.len(),
            "reboot pool lost track of a device"
        );

        let outcomes = devices
            .iter()
            .cloned()
            .zip(outcomes.into_iter().map(|(_, outcome)| outcome))
            .collect();

        Ok(RebootReport { outcomes })
    }
}

/// Devices still to be rebooted, tagged with their input position.
type DeviceQueue = Arc<Mutex<VecDeque<(usize, DeviceId)>>>;

type WorkerResult = Result<Vec<(usize, RebootOutcome)>, RebootError>;

struct RebootPool {
    workers: Vec<JoinHandle<WorkerResult>>,
}

impl RebootPool {
    fn start(size: usize, queue: DeviceQueue, connector: &Arc<dyn DeviceConnector>) -> Self {
        let workers = (1..=size)
            .map(|worker_id| {
                let queue = Arc::clone(&queue);
                let connector = Arc::clone(connector);
                tokio::spawn(reboot_worker(worker_id, queue, connector))
            })
            .collect();
        Self { workers }
    }

    /// Waits for every worker. Returns as soon as any worker fails.
    async fn join(&mut self) -> Result<Vec<(usize, RebootOutcome)>, RebootError> {
        let mut pending: FuturesUnordered<_> = self.workers.iter_mut().collect();
        let mut outcomes = vec![];

        while let Some(joined) = pending.next().await {
            match joined {
                Ok(Ok(worker_outcomes)) => outcomes.extend(worker_outcomes),
                Ok(Err(error)) => return Err(error),
                Err(join_error) => {
                    let reason = if join_error.is_panic() {
                        let payload = join_error.into_panic();
                        panic_message(payload)
                    } else {
                        join_error.to_string()
                    };
                    return Err(RebootError::WorkerPanicked(reason));
                }
            }
        }

        Ok(outcomes)
    }
}

impl Drop for RebootPool {
    fn drop(&mut self) {
        // No-op for workers that already finished.
        for worker in &self.workers {
            worker.abort();
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(msg) => *msg,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(msg) => msg.to_string(),
            Err(_) => "<non-string panic>".to_owned(),
        },
    }
}

#[instrument(level = "debug", skip(queue, connector))]
async fn reboot_worker(
    worker_id: usize,
    queue: DeviceQueue,
    connector: Arc<dyn DeviceConnector>,
) -> WorkerResult {
    let mut outcomes = vec![];
    loop {
        let next = queue.lock().pop_front();
        let Some((index, device)) = next else {
            break;
        };
        let outcome = reboot_one(connector.as_ref(), &device).await?;
        outcomes.push((index, outcome));
    }
    tracing::debug!(rebooted = outcomes.len(), "reboot worker done");
    Ok(outcomes)
}

async fn reboot_one(
    connector: &dyn DeviceConnector,
    device: &DeviceId,
) -> Result<RebootOutcome, RebootError> {
    let into_fatal = |source| RebootError::Device {
        device: device.clone(),
        source,
    };

    let rebooted = match connector.connect(device) {
        Ok(commands) => commands.reboot(true).await,
        Err(error) => Err(error),
    };
    match rebooted {
        Ok(()) => {
            tracing::debug!(%device, "device back online");
            Ok(RebootOutcome::Healthy)
        }
        Err(error) if error.is_unresponsive() => {
            tracing::warn!(%device, %error, "device did not come back after reboot");
            Ok(RebootOutcome::Unresponsive(error))
        }
        Err(error) => Err(into_fatal(error)),
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;
    use std::num::NonZeroUsize;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tracing_test::traced_test;

    use super::{RebootConfig, RebootCoordinator, RebootError, RebootOutcome};
    use crate::{DeviceCommands, DeviceConnector, DeviceDiscovery, DeviceError, DeviceId};

    #[derive(Clone, Copy, Debug)]
    enum Behavior {
        Healthy(Duration),
        Unresponsive,
        Broken,
        Hang,
        Panic,
        /// Fails before a device handle exists.
        Unreachable,
        UnreachableBroken,
    }

    #[derive(Default)]
    struct Fleet {
        behaviors: HashMap<DeviceId, Behavior>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        connects: AtomicUsize,
        rebooted: Mutex<Vec<DeviceId>>,
        listed: AtomicUsize,
    }

    impl Fleet {
        fn new(devices: &[(&str, Behavior)]) -> Arc<Self> {
            Arc::new(Self {
                behaviors: devices
                    .iter()
                    .map(|(d, b)| (DeviceId::from(*d), *b))
                    .collect(),
                ..Default::default()
            })
        }

        fn coordinator(self: &Arc<Self>, config: RebootConfig) -> RebootCoordinator {
            let fake = Arc::new(FakeFleet(Arc::clone(self)));
            RebootCoordinator::new(config, fake.clone(), fake)
        }
    }

    struct FakeDevice {
        fleet: Arc<Fleet>,
        device: DeviceId,
    }

    #[async_trait]
    impl DeviceCommands for FakeDevice {
        fn device(&self) -> &DeviceId {
            &self.device
        }

        async fn reboot(&self, block_until_ready: bool) -> Result<(), DeviceError> {
            assert!(block_until_ready);
            let now = self.fleet.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.fleet.max_in_flight.fetch_max(now, Ordering::SeqCst);

            let result = match self.fleet.behaviors[&self.device] {
                Behavior::Healthy(delay) => {
                    tokio::time::sleep(delay).await;
                    Ok(())
                }
                Behavior::Unresponsive => {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Err(DeviceError::unresponsive(&self.device, "no boot_completed"))
                }
                Behavior::Broken => Err(DeviceError::Parse("garbage".to_owned())),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(())
                }
                Behavior::Panic => panic!("fake device exploded"),
                Behavior::Unreachable | Behavior::UnreachableBroken => {
                    unreachable!("no handle for an unreachable device")
                }
            };

            self.fleet.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.fleet.rebooted.lock().push(self.device.clone());
            result
        }

        async fn restart_command_server(&self) -> Result<(), DeviceError> {
            Ok(())
        }
    }

    struct FakeFleet(Arc<Fleet>);

    impl DeviceConnector for FakeFleet {
        fn connect(&self, device: &DeviceId) -> Result<Arc<dyn DeviceCommands>, DeviceError> {
            self.0.connects.fetch_add(1, Ordering::SeqCst);
            match self.0.behaviors[device] {
                Behavior::Unreachable => {
                    return Err(DeviceError::unresponsive(device, "offline"));
                }
                Behavior::UnreachableBroken => {
                    return Err(DeviceError::Parse("bad serial".to_owned()));
                }
                _ => {}
            }
            Ok(Arc::new(FakeDevice {
                fleet: Arc::clone(&self.0),
                device: device.clone(),
            }))
        }
    }

    #[async_trait]
    impl DeviceDiscovery for FakeFleet {
        async fn list_attached_devices(
            &self,
            include_emulators: bool,
        ) -> Result<Vec<DeviceId>, DeviceError> {
            assert!(!include_emulators);
            self.0.listed.fetch_add(1, Ordering::SeqCst);
            let mut devices: Vec<_> = self.0.behaviors.keys().cloned().collect();
            devices.sort();
            Ok(devices)
        }

        async fn restart_command_server(&self) -> Result<(), DeviceError> {
            Ok(())
        }
    }

    fn ids(devices: &[&str]) -> Vec<DeviceId> {
        devices.iter().map(|d| DeviceId::from(*d)).collect()
    }

    const QUICK: Behavior = Behavior::Healthy(Duration::from_millis(1));

    #[tokio::test]
    async fn empty_device_set_is_a_noop() {
        let fleet = Fleet::new(&[]);
        let report = fleet
            .coordinator(RebootConfig::default())
            .reboot_devices(&[])
            .await
            .unwrap();

        assert!(report.is_empty());
        assert!(report.all_healthy());
        assert!(report.failed_devices().is_empty());
        assert_eq!(fleet.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    #[traced_test]
    async fn unresponsive_device_is_the_only_failure() {
        let fleet = Fleet::new(&[
            ("a", QUICK),
            ("b", QUICK),
            ("c", Behavior::Unresponsive),
            ("d", QUICK),
            ("e", QUICK),
        ]);

        let report = fleet
            .coordinator(RebootConfig::default())
            .reboot_devices(&ids(&["a", "b", "c", "d", "e"]))
            .await
            .unwrap();

        assert_eq!(report.failed_devices(), vec![&DeviceId::from("c")]);
        assert!(!report.all_healthy());
        assert_eq!(fleet.rebooted.lock().len(), 5);
        assert!(logs_contain("device did not come back after reboot"));
    }

    #[tokio::test]
    async fn report_follows_input_order() {
        let fleet = Fleet::new(&[
            ("slow", Behavior::Healthy(Duration::from_millis(40))),
            ("dead", Behavior::Unresponsive),
            ("fast", QUICK),
        ]);

        let input = ids(&["slow", "dead", "fast"]);
        let report = fleet
            .coordinator(RebootConfig::default())
            .reboot_devices(&input)
            .await
            .unwrap();

        let reported: Vec<_> = report.devices().cloned().collect();
        assert_eq!(reported, input);
        let healthy: Vec<_> = report
            .outcomes()
            .iter()
            .map(|(_, outcome)| outcome.is_healthy())
            .collect();
        assert_eq!(healthy, [true, false, true]);
        assert!(matches!(
            report.outcomes()[1].1,
            RebootOutcome::Unresponsive(DeviceError::Unresponsive { .. })
        ));
    }

    #[tokio::test]
    async fn other_device_errors_are_fatal() {
        let fleet = Fleet::new(&[("a", QUICK), ("b", Behavior::Broken), ("c", QUICK)]);

        let err = fleet
            .coordinator(RebootConfig::default())
            .reboot_devices(&ids(&["a", "b", "c"]))
            .await
            .unwrap_err();

        match err {
            RebootError::Device { device, source } => {
                assert_eq!(device, DeviceId::from("b"));
                assert!(matches!(source, DeviceError::Parse(_)));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn unresponsive_on_connect_is_recorded_per_device() {
        let fleet = Fleet::new(&[("a", QUICK), ("gone", Behavior::Unreachable), ("b", QUICK)]);

        let report = fleet
            .coordinator(RebootConfig::default())
            .reboot_devices(&ids(&["a", "gone", "b"]))
            .await
            .unwrap();

        assert_eq!(report.failed_devices(), vec![&DeviceId::from("gone")]);
        assert!(matches!(
            report.outcomes()[1].1,
            RebootOutcome::Unresponsive(DeviceError::Unresponsive { .. })
        ));
        assert_eq!(fleet.connects.load(Ordering::SeqCst), 3);
        assert_eq!(fleet.rebooted.lock().len(), 2);
    }

    #[tokio::test]
    async fn other_connect_errors_are_fatal() {
        let fleet = Fleet::new(&[("a", QUICK), ("bad", Behavior::UnreachableBroken)]);

        let err = fleet
            .coordinator(RebootConfig::default())
            .reboot_devices(&ids(&["a", "bad"]))
            .await
            .unwrap_err();

        assert!(
            matches!(&err, RebootError::Device { device, source: DeviceError::Parse(_) } if device == &DeviceId::from("bad")),
            "{err:?}"
        );
    }

    #[tokio::test]
    async fn pool_is_bounded_by_max_workers() {
        let names: Vec<String> = (0..8).map(|i| format!("dev{i}")).collect();
        let behaviors: Vec<_> = names
            .iter()
            .map(|n| (n.as_str(), Behavior::Healthy(Duration::from_millis(10))))
            .collect();
        let fleet = Fleet::new(&behaviors);

        let config = RebootConfig {
            max_workers: NonZeroUsize::new(3).unwrap(),
            ..Default::default()
        };
        let devices: Vec<_> = names.iter().map(|n| DeviceId::from(n.as_str())).collect();
        let report = fleet
            .coordinator(config)
            .reboot_devices(&devices)
            .await
            .unwrap();

        assert!(report.all_healthy());
        assert_eq!(report.outcomes().len(), 8);
        assert!(fleet.max_in_flight.load(Ordering::SeqCst) <= 3);
        assert_eq!(fleet.rebooted.lock().len(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn timing_out_is_fatal() {
        let fleet = Fleet::new(&[("a", QUICK), ("stuck", Behavior::Hang)]);

        let config = RebootConfig {
            timeout: Duration::from_secs(30),
            ..Default::default()
        };
        let err = fleet
            .coordinator(config)
            .reboot_devices(&ids(&["a", "stuck"]))
            .await
            .unwrap_err();

        assert!(matches!(err, RebootError::TimedOut(t) if t == Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn worker_panics_surface_as_errors() {
        let fleet = Fleet::new(&[("boom", Behavior::Panic)]);

        let err = fleet
            .coordinator(RebootConfig::default())
            .reboot_devices(&ids(&["boom"]))
            .await
            .unwrap_err();

        assert!(
            matches!(&err, RebootError::WorkerPanicked(msg) if msg.contains("fake device exploded")),
            "{err:?}"
        );
    }

    #[tokio::test]
    async fn reboots_attached_devices() {
        let fleet = Fleet::new(&[("y", QUICK), ("x", Behavior::Unresponsive)]);

        let coordinator = fleet.coordinator(RebootConfig::default());
        let devices = coordinator.attached_devices().await.unwrap();
        let report = coordinator.reboot_devices(&devices).await.unwrap();

        assert_eq!(report.devices().cloned().collect::<Vec<_>>(), ids(&["x", "y"]));
        assert_eq!(report.failed_devices(), vec![&DeviceId::from("x")]);
    }

    #[tokio::test]
    async fn dry_run_touches_nothing() {
        let fleet = Fleet::new(&[("a", QUICK)]);
        let config = RebootConfig {
            dry_run: true,
            ..Default::default()
        };

        let coordinator = fleet.coordinator(config);
        let devices = coordinator.attached_devices().await.unwrap();
        assert!(devices.is_empty());
        let report = coordinator
            .reboot_devices(&ids(&["a"]))
            .await
            .unwrap();

        assert!(report.is_empty());
        assert_eq!(fleet.listed.load(Ordering::SeqCst), 0);
        assert_eq!(fleet.connects.load(Ordering::SeqCst), 0);
    }
}
