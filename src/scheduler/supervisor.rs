//! Pool supervisor: keeps one worker process alive per slot.
//!
//! Slot `i` always consumes from `priorities.assign(i)`. The supervisor
//! launches every slot, then polls each one every `poll_interval`; a slot
//! whose process has terminated, for any reason, is relaunched with the
//! same queue assignment. There is no backoff and no retry ceiling, so a
//! worker that keeps crashing is restarted once per sweep for as long as
//! the supervisor runs.

use std::ffi::OsString;
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

use crate::metrics::{write_textfile, MetricsCollector};

use super::priority::{PriorityCounts, QueueAssignment};

/// Errors raised by the supervisor.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Invalid supervisor configuration: {0}")]
    InvalidConfig(String),

    /// Launching a worker failed. Logged and retried on the next sweep.
    #[error("Failed to spawn worker for slot {slot}: {reason}")]
    SpawnFailed { slot: usize, reason: String },
}

/// Configuration for the pool supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Number of worker slots.
    pub n_workers: usize,
    /// Workers dedicated to each tier.
    pub priorities: PriorityCounts,
    /// Time between liveness sweeps.
    pub poll_interval: Duration,
    /// Time to wait before the first launch, e.g. for the broker to come up.
    pub startup_delay: Duration,
    /// Consecutive spawn failures on one slot before they are logged as errors.
    pub spawn_failure_alert_threshold: u32,
    /// Directory for the `supervisor.prom` metrics snapshot.
    pub metrics_dir: Option<PathBuf>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            n_workers: 1,
            priorities: PriorityCounts::default(),
            poll_interval: Duration::from_secs(5),
            startup_delay: Duration::from_secs(10),
            spawn_failure_alert_threshold: 3,
            metrics_dir: None,
        }
    }
}

impl SupervisorConfig {
    /// Creates a new configuration with the specified number of workers.
    pub fn new(n_workers: usize) -> Self {
        Self {
            n_workers,
            ..Default::default()
        }
    }

    pub fn with_priorities(mut self, priorities: PriorityCounts) -> Self {
        self.priorities = priorities;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_startup_delay(mut self, delay: Duration) -> Self {
        self.startup_delay = delay;
        self
    }

    pub fn with_spawn_failure_alert_threshold(mut self, threshold: u32) -> Self {
        self.spawn_failure_alert_threshold = threshold;
        self
    }

    pub fn with_metrics_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.metrics_dir = Some(dir.into());
        self
    }

    /// Checks the configuration, warning about tier counts that leave no
    /// room for the pool size.
    pub fn validate(&self) -> Result<(), SupervisorError> {
        if self.n_workers == 0 {
            return Err(SupervisorError::InvalidConfig(
                "at least one worker is required".to_string(),
            ));
        }

        let dedicated = self.priorities.dedicated();
        if dedicated > self.n_workers {
            warn!(
                n_workers = self.n_workers,
                dedicated = dedicated,
                "Dedicated priority workers exceed the pool size; some tiers get fewer workers than requested"
            );
        }

        Ok(())
    }
}

/// A launched worker.
pub trait WorkerHandle: Send {
    /// OS process id, if known.
    fn id(&self) -> Option<u32>;

    /// Non-blocking liveness check. Returns true once the worker has
    /// terminated; the exit status is never inspected beyond logging.
    fn has_exited(&mut self) -> bool;

    /// Asks the worker to stop without waiting for it.
    fn terminate(&mut self);
}

/// Starts workers for slots.
pub trait WorkerLauncher: Send + Sync {
    fn launch(
        &self,
        slot: usize,
        queues: &QueueAssignment,
    ) -> Result<Box<dyn WorkerHandle>, SupervisorError>;
}

/// Launches workers as child processes: `<program> [global args] worker
/// --slot <i> --queues <names> [worker args]`.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    global_args: Vec<OsString>,
    worker_args: Vec<OsString>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            global_args: Vec::new(),
            worker_args: Vec::new(),
        }
    }

    /// Launcher that re-executes the running binary.
    pub fn current_exe() -> Result<Self, SupervisorError> {
        let exe = std::env::current_exe().map_err(|e| {
            SupervisorError::InvalidConfig(format!("Failed to get current executable: {}", e))
        })?;
        Ok(Self::new(exe))
    }

    /// Arguments placed before the `worker` subcommand.
    pub fn with_global_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.global_args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Arguments appended after the slot and queue flags.
    pub fn with_worker_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.worker_args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Full argument list for one slot.
    pub fn args_for(&self, slot: usize, queues: &QueueAssignment) -> Vec<OsString> {
        let mut args = self.global_args.clone();
        args.push("worker".into());
        args.push("--slot".into());
        args.push(slot.to_string().into());
        args.push("--queues".into());
        args.push(queues.to_string().into());
        args.extend(self.worker_args.iter().cloned());
        args
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(
        &self,
        slot: usize,
        queues: &QueueAssignment,
    ) -> Result<Box<dyn WorkerHandle>, SupervisorError> {
        let child = Command::new(&self.program)
            .args(self.args_for(slot, queues))
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SupervisorError::SpawnFailed {
                slot,
                reason: e.to_string(),
            })?;

        Ok(Box::new(ProcessHandle { slot, child }))
    }
}

/// A worker running as a child process.
#[derive(Debug)]
pub struct ProcessHandle {
    slot: usize,
    child: Child,
}

impl WorkerHandle for ProcessHandle {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn has_exited(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                info!(slot = self.slot, status = %status, "Worker process exited");
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!(slot = self.slot, error = %e, "Failed to poll worker process; treating it as dead");
                true
            }
        }
    }

    fn terminate(&mut self) {
        if let Err(e) = self.child.start_kill() {
            debug!(slot = self.slot, error = %e, "Failed to kill worker process");
        }
    }
}

/// One supervised slot.
struct WorkerSlot {
    index: usize,
    queues: QueueAssignment,
    handle: Option<Box<dyn WorkerHandle>>,
    launches: u64,
    consecutive_spawn_failures: u32,
}

impl WorkerSlot {
    fn new(index: usize, queues: QueueAssignment) -> Self {
        Self {
            index,
            queues,
            handle: None,
            launches: 0,
            consecutive_spawn_failures: 0,
        }
    }

    fn restarts(&self) -> u64 {
        self.launches.saturating_sub(1)
    }
}

/// Snapshot of a slot for reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotStatus {
    pub index: usize,
    pub queues: QueueAssignment,
    pub pid: Option<u32>,
    pub restarts: u64,
    pub consecutive_spawn_failures: u32,
}

/// Outcome of one supervision sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Slots examined.
    pub checked: usize,
    /// Slots that got a new worker.
    pub relaunched: usize,
    /// Slots whose launch failed and stay empty until the next sweep.
    pub spawn_failures: usize,
}

/// Aggregate supervisor statistics.
#[derive(Debug, Clone, Default)]
pub struct SupervisorStats {
    pub n_workers: usize,
    pub live_workers: usize,
    pub total_restarts: u64,
    /// Slots whose last launch attempt failed.
    pub failing_slots: usize,
}

/// Keeps `n_workers` worker processes alive.
pub struct PoolSupervisor {
    config: SupervisorConfig,
    launcher: Box<dyn WorkerLauncher>,
    slots: Vec<WorkerSlot>,
    started: bool,
    metrics: MetricsCollector,
}

impl PoolSupervisor {
    /// Creates a supervisor. Nothing is launched until [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// Returns `SupervisorError::InvalidConfig` if `n_workers` is zero.
    pub fn new(
        config: SupervisorConfig,
        launcher: impl WorkerLauncher + 'static,
    ) -> Result<Self, SupervisorError> {
        config.validate()?;

        let slots = (0..config.n_workers)
            .map(|i| WorkerSlot::new(i, config.priorities.assign(i)))
            .collect();

        Ok(Self {
            config,
            launcher: Box::new(launcher),
            slots,
            started: false,
            metrics: MetricsCollector::new(),
        })
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Launches a worker for every slot.
    pub fn start(&mut self) {
        for index in 0..self.slots.len() {
            self.launch_slot(index);
        }
        self.started = true;

        let live = self.live_workers();
        info!(
            n_workers = self.config.n_workers,
            live_workers = live,
            "Worker pool started"
        );
        self.publish_metrics();
    }

    /// One liveness sweep over every slot.
    ///
    /// Slots without a live worker get a new one with the same queue
    /// assignment they started with.
    pub fn supervise_once(&mut self) -> SweepReport {
        let mut report = SweepReport::default();

        for index in 0..self.slots.len() {
            report.checked += 1;

            let slot = &mut self.slots[index];
            let alive = match slot.handle.as_mut() {
                Some(handle) => !handle.has_exited(),
                None => false,
            };
            if alive {
                continue;
            }

            if let Some(dead) = slot.handle.take() {
                warn!(
                    slot = index,
                    pid = ?dead.id(),
                    queues = %slot.queues,
                    "Worker died, restarting"
                );
            }

            if self.launch_slot(index) {
                report.relaunched += 1;
            } else {
                report.spawn_failures += 1;
            }
        }

        self.publish_metrics();
        report
    }

    /// Runs the supervision loop forever.
    pub async fn run(&mut self) {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Runs the supervision loop until `shutdown` resolves, then terminates
    /// every live worker.
    pub async fn run_until<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        if !self.started {
            if !self.config.startup_delay.is_zero() {
                info!(delay = ?self.config.startup_delay, "Waiting before starting workers");
                tokio::select! {
                    _ = &mut shutdown => return,
                    _ = tokio::time::sleep(self.config.startup_delay) => {}
                }
            }
            self.start();
        }

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutting down worker pool");
                    self.terminate_all();
                    return;
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    let report = self.supervise_once();
                    if report.relaunched > 0 || report.spawn_failures > 0 {
                        debug!(
                            relaunched = report.relaunched,
                            spawn_failures = report.spawn_failures,
                            "Supervision sweep"
                        );
                    }
                }
            }
        }
    }

    /// Sends a stop request to every live worker and forgets it.
    pub fn terminate_all(&mut self) {
        for slot in &mut self.slots {
            if let Some(mut handle) = slot.handle.take() {
                info!(slot = slot.index, pid = ?handle.id(), "Stopping worker");
                handle.terminate();
            }
        }
        self.publish_metrics();
    }

    /// Per-slot snapshot.
    pub fn slots(&self) -> Vec<SlotStatus> {
        self.slots
            .iter()
            .map(|slot| SlotStatus {
                index: slot.index,
                queues: slot.queues,
                pid: slot.handle.as_ref().and_then(|h| h.id()),
                restarts: slot.restarts(),
                consecutive_spawn_failures: slot.consecutive_spawn_failures,
            })
            .collect()
    }

    pub fn stats(&self) -> SupervisorStats {
        SupervisorStats {
            n_workers: self.slots.len(),
            live_workers: self.live_workers(),
            total_restarts: self.slots.iter().map(WorkerSlot::restarts).sum(),
            failing_slots: self
                .slots
                .iter()
                .filter(|slot| slot.consecutive_spawn_failures > 0)
                .count(),
        }
    }

    fn live_workers(&self) -> usize {
        self.slots.iter().filter(|slot| slot.handle.is_some()).count()
    }

    /// Launches the worker for one slot. Returns false if the launch failed.
    fn launch_slot(&mut self, index: usize) -> bool {
        let queues = self.config.priorities.assign(index);
        let slot = &mut self.slots[index];
        debug_assert_eq!(queues, slot.queues);

        match self.launcher.launch(index, &queues) {
            Ok(handle) => {
                info!(slot = index, pid = ?handle.id(), queues = %queues, "Launched worker");
                slot.handle = Some(handle);
                slot.launches += 1;
                slot.consecutive_spawn_failures = 0;
                if slot.launches > 1 {
                    self.metrics.record_worker_restart(&queues.to_string());
                }
                true
            }
            Err(e) => {
                slot.consecutive_spawn_failures += 1;
                self.metrics.record_spawn_failure();

                let failures = slot.consecutive_spawn_failures;
                if failures >= self.config.spawn_failure_alert_threshold {
                    error!(
                        slot = index,
                        queues = %queues,
                        consecutive_failures = failures,
                        error = %e,
                        "Worker keeps failing to spawn"
                    );
                } else {
                    warn!(slot = index, queues = %queues, error = %e, "Failed to spawn worker");
                }
                false
            }
        }
    }

    fn publish_metrics(&self) {
        self.metrics.update_live_workers(self.live_workers());

        if let Some(dir) = &self.config.metrics_dir {
            let path = dir.join("supervisor.prom");
            if let Err(e) = write_textfile(&path) {
                warn!(path = %path.display(), error = %e, "Failed to write metrics snapshot");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::JobPriority;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct FakeState {
        launches: Vec<(usize, QueueAssignment)>,
        alive: Vec<Arc<AtomicBool>>,
        failing: HashSet<usize>,
    }

    #[derive(Clone, Default)]
    struct FakeLauncher {
        state: Arc<Mutex<FakeState>>,
    }

    struct FakeHandle {
        pid: u32,
        alive: Arc<AtomicBool>,
    }

    impl WorkerHandle for FakeHandle {
        fn id(&self) -> Option<u32> {
            Some(self.pid)
        }

        fn has_exited(&mut self) -> bool {
            !self.alive.load(Ordering::SeqCst)
        }

        fn terminate(&mut self) {
            self.alive.store(false, Ordering::SeqCst);
        }
    }

    impl WorkerLauncher for FakeLauncher {
        fn launch(
            &self,
            slot: usize,
            queues: &QueueAssignment,
        ) -> Result<Box<dyn WorkerHandle>, SupervisorError> {
            let mut state = self.state.lock().unwrap();
            if state.failing.contains(&slot) {
                return Err(SupervisorError::SpawnFailed {
                    slot,
                    reason: "fork refused".to_string(),
                });
            }

            let alive = Arc::new(AtomicBool::new(true));
            state.launches.push((slot, *queues));
            state.alive.push(Arc::clone(&alive));
            Ok(Box::new(FakeHandle {
                pid: 1000 + state.launches.len() as u32,
                alive,
            }))
        }
    }

    fn config(n: usize, high: usize, medium: usize, low: usize) -> SupervisorConfig {
        SupervisorConfig::new(n)
            .with_priorities(PriorityCounts::new(high, medium, low))
            .with_startup_delay(Duration::ZERO)
            .with_poll_interval(Duration::from_millis(10))
    }

    #[test]
    fn test_supervisor_config_default() {
        let config = SupervisorConfig::default();

        assert_eq!(config.n_workers, 1);
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.startup_delay, Duration::from_secs(10));
        assert_eq!(config.spawn_failure_alert_threshold, 3);
        assert!(config.metrics_dir.is_none());
    }

    #[test]
    fn test_rejects_empty_pool() {
        let err = PoolSupervisor::new(SupervisorConfig::new(0), FakeLauncher::default())
            .err()
            .expect("zero workers must be rejected");
        assert!(matches!(err, SupervisorError::InvalidConfig(_)));
    }

    #[test]
    fn test_oversubscribed_tiers_are_accepted() {
        let supervisor = PoolSupervisor::new(config(2, 3, 1, 1), FakeLauncher::default())
            .expect("oversubscription only warns");
        let queues: Vec<_> = supervisor.slots().iter().map(|s| s.queues).collect();
        assert_eq!(
            queues,
            vec![
                QueueAssignment::Single(JobPriority::High),
                QueueAssignment::Single(JobPriority::High)
            ]
        );
    }

    #[test]
    fn test_start_launches_every_slot_with_its_queues() {
        let launcher = FakeLauncher::default();
        let mut supervisor =
            PoolSupervisor::new(config(5, 2, 1, 0), launcher.clone()).expect("valid config");
        supervisor.start();

        let state = launcher.state.lock().unwrap();
        assert_eq!(
            state.launches,
            vec![
                (0, QueueAssignment::Single(JobPriority::High)),
                (1, QueueAssignment::Single(JobPriority::High)),
                (2, QueueAssignment::Single(JobPriority::Medium)),
                (3, QueueAssignment::All),
                (4, QueueAssignment::All),
            ]
        );
        assert_eq!(supervisor.stats().live_workers, 5);
    }

    #[test]
    fn test_healthy_sweep_launches_nothing() {
        let launcher = FakeLauncher::default();
        let mut supervisor =
            PoolSupervisor::new(config(3, 1, 1, 1), launcher.clone()).expect("valid config");
        supervisor.start();

        let report = supervisor.supervise_once();
        assert_eq!(
            report,
            SweepReport {
                checked: 3,
                relaunched: 0,
                spawn_failures: 0
            }
        );
        assert_eq!(launcher.state.lock().unwrap().launches.len(), 3);
    }

    #[test]
    fn test_dead_worker_respawns_with_same_queues() {
        let launcher = FakeLauncher::default();
        let mut supervisor =
            PoolSupervisor::new(config(5, 2, 1, 0), launcher.clone()).expect("valid config");
        supervisor.start();

        // Slot 2 serves MEDIUM; slot 4 serves every tier.
        {
            let state = launcher.state.lock().unwrap();
            state.alive[2].store(false, Ordering::SeqCst);
            state.alive[4].store(false, Ordering::SeqCst);
        }

        let report = supervisor.supervise_once();
        assert_eq!(report.relaunched, 2);

        let state = launcher.state.lock().unwrap();
        assert_eq!(
            &state.launches[5..],
            &[
                (2, QueueAssignment::Single(JobPriority::Medium)),
                (4, QueueAssignment::All)
            ]
        );
        drop(state);

        let slots = supervisor.slots();
        assert_eq!(slots[2].restarts, 1);
        assert_eq!(slots[0].restarts, 0);
        assert_eq!(supervisor.stats().total_restarts, 2);
    }

    #[test]
    fn test_crash_loop_restarts_every_sweep() {
        let launcher = FakeLauncher::default();
        let mut supervisor =
            PoolSupervisor::new(config(1, 1, 0, 0), launcher.clone()).expect("valid config");
        supervisor.start();

        for _ in 0..4 {
            let last = Arc::clone(launcher.state.lock().unwrap().alive.last().unwrap());
            last.store(false, Ordering::SeqCst);
            assert_eq!(supervisor.supervise_once().relaunched, 1);
        }

        assert_eq!(supervisor.slots()[0].restarts, 4);
        assert!(launcher
            .state
            .lock()
            .unwrap()
            .launches
            .iter()
            .all(|(_, q)| *q == QueueAssignment::Single(JobPriority::High)));
    }

    #[test]
    fn test_spawn_failure_is_retried_next_sweep() {
        let launcher = FakeLauncher::default();
        launcher.state.lock().unwrap().failing.insert(1);

        let mut supervisor =
            PoolSupervisor::new(config(2, 0, 0, 0), launcher.clone()).expect("valid config");
        supervisor.start();
        assert_eq!(supervisor.stats().live_workers, 1);
        assert_eq!(supervisor.slots()[1].consecutive_spawn_failures, 1);

        let report = supervisor.supervise_once();
        assert_eq!(report.spawn_failures, 1);
        assert_eq!(supervisor.slots()[1].consecutive_spawn_failures, 2);
        assert_eq!(supervisor.stats().failing_slots, 1);

        launcher.state.lock().unwrap().failing.clear();
        let report = supervisor.supervise_once();
        assert_eq!(report.relaunched, 1);

        let slot = &supervisor.slots()[1];
        assert_eq!(slot.consecutive_spawn_failures, 0);
        assert_eq!(slot.queues, QueueAssignment::All);
        assert_eq!(slot.restarts, 0);
        assert!(slot.pid.is_some());
    }

    #[test]
    fn test_process_launcher_args() {
        let launcher = ProcessLauncher::new("/usr/bin/abstract-pool")
            .with_global_args(["--log-level", "debug"])
            .with_worker_args(["--redis-url", "redis://queue:6379"]);

        let args = launcher.args_for(3, &QueueAssignment::All);
        let args: Vec<_> = args.iter().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(
            args,
            vec![
                "--log-level",
                "debug",
                "worker",
                "--slot",
                "3",
                "--queues",
                "HIGH,MEDIUM,LOW",
                "--redis-url",
                "redis://queue:6379"
            ]
        );
    }

    #[tokio::test]
    async fn test_run_until_terminates_workers() {
        let launcher = FakeLauncher::default();
        let mut supervisor =
            PoolSupervisor::new(config(3, 1, 1, 1), launcher.clone()).expect("valid config");

        supervisor
            .run_until(tokio::time::sleep(Duration::from_millis(50)))
            .await;

        let state = launcher.state.lock().unwrap();
        assert_eq!(state.launches.len(), 3);
        assert!(state.alive.iter().all(|a| !a.load(Ordering::SeqCst)));
        drop(state);
        assert_eq!(supervisor.stats().live_workers, 0);
    }

    #[test]
    fn test_supervisor_error_display() {
        let err = SupervisorError::SpawnFailed {
            slot: 4,
            reason: "EAGAIN".to_string(),
        };
        assert!(err.to_string().contains("slot 4"));
        assert!(err.to_string().contains("EAGAIN"));
    }
}
