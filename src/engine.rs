//! The port refresh engine.
//!
//! A single task owns the mapping, the gateway state and every managed
//! application's runtime state, and walks the
//! Initializing → Steady ⇄ Degraded → ShuttingDown machine.  All waits and
//! the gateway exchange itself are raced against the shutdown signal, so
//! cancellation is observed at every suspension point.  Observers only
//! ever see published [`StatusSnapshot`] copies.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use log::{info, warn};
use tokio::sync::watch;

use crate::apps::ManagedApp;
use crate::config::Config;
use crate::gateway::{AcquireError, GatewayClient};
use crate::status::StatusBoard;
use crate::types::{AppRuntimeState, GatewayState, Mapping, StatusSnapshot};

/// Engine timing knobs, lifted out of [`Config`] so tests can drive the
/// machine with scripted values.
#[derive(Debug, Clone)]
pub struct Tuning {
    /// Renewal cadence while the gateway answers.
    pub refresh: Duration,
    /// Single short retry after the gateway first goes away.
    pub retry_delay: Duration,
    /// Retry cadence while the gateway stays away.
    pub backoff: Duration,
    /// Settling time between a stop request and the follow-up start.
    pub stop_grace: Duration,
}

impl From<&Config> for Tuning {
    fn from(cfg: &Config) -> Self {
        Self {
            refresh: cfg.refresh(),
            retry_delay: cfg.retry_delay(),
            backoff: cfg.backoff(),
            stop_grace: cfg.stop_grace(),
        }
    }
}

/// Requests engine shutdown.  Cloneable and idempotent; the first call
/// wins and later calls are no-ops.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Phase {
    Steady,
    Degraded,
}

pub struct Engine {
    gateway: Box<dyn GatewayClient>,
    apps: Vec<ManagedApp>,
    tuning: Tuning,
    mapping: Mapping,
    /// Last successfully acquired port; survives outages so that a
    /// numerically identical recovery is not counted as a change.
    last_known_port: Option<u16>,
    gateway_state: GatewayState,
    last_failure: Option<String>,
    status_tx: watch::Sender<StatusSnapshot>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Engine {
    pub fn new(
        gateway: Box<dyn GatewayClient>,
        apps: Vec<ManagedApp>,
        tuning: Tuning,
    ) -> (Self, ShutdownHandle, StatusBoard) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let initial = StatusSnapshot::initial(apps.iter().map(|a| a.status()).collect());
        let (status_tx, status_rx) = watch::channel(initial);
        let engine = Self {
            gateway,
            apps,
            tuning,
            mapping: Mapping::empty(),
            last_known_port: None,
            gateway_state: GatewayState::Unreachable,
            last_failure: None,
            status_tx,
            shutdown_rx,
        };
        (
            engine,
            ShutdownHandle {
                tx: Arc::new(shutdown_tx),
            },
            StatusBoard::new(status_rx),
        )
    }

    pub fn mapping(&self) -> &Mapping {
        &self.mapping
    }

    pub fn gateway_state(&self) -> GatewayState {
        self.gateway_state
    }

    pub fn apps(&self) -> &[ManagedApp] {
        &self.apps
    }

    /// Drive the state machine until shutdown, then stop every managed
    /// application and return the final engine state.
    pub async fn run(mut self) -> Self {
        info!("Refresh engine starting");
        self.publish();

        // Initializing: a single attempt decides where we land.
        let mut phase = match self.try_acquire().await {
            None => return self.shut_down_all().await,
            Some(Ok(port)) => {
                self.adopt_port(port).await;
                Phase::Steady
            }
            Some(Err(err)) => {
                self.enter_degraded(err).await;
                Phase::Degraded
            }
        };

        'control: loop {
            if self.shutdown_requested() {
                break;
            }
            match phase {
                Phase::Steady => {
                    if self.wait(self.tuning.refresh).await {
                        break;
                    }
                    match self.try_acquire().await {
                        None => break 'control,
                        Some(Ok(port)) => self.adopt_port(port).await,
                        Some(Err(err)) => {
                            self.enter_degraded(err).await;
                            phase = Phase::Degraded;
                        }
                    }
                }
                Phase::Degraded => {
                    // One short retry, then an unbounded backoff loop.
                    let mut delay = self.tuning.retry_delay;
                    loop {
                        if self.wait(delay).await {
                            break 'control;
                        }
                        match self.try_acquire().await {
                            None => break 'control,
                            Some(Ok(port)) => {
                                self.adopt_port(port).await;
                                phase = Phase::Steady;
                                break;
                            }
                            Some(Err(err)) => {
                                self.record_failure(err);
                                delay = self.tuning.backoff;
                            }
                        }
                    }
                }
            }
        }

        self.shut_down_all().await
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Race the gateway exchange against shutdown.  `None` means shutdown
    /// was requested while the exchange was in flight.
    async fn try_acquire(&mut self) -> Option<Result<u16, AcquireError>> {
        let mut shutdown = self.shutdown_rx.clone();
        tokio::select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop) => None,
            result = self.gateway.request_mapping() => Some(result),
        }
    }

    /// Sleep for `duration` unless shutdown arrives first.  Returns true
    /// when interrupted by shutdown.
    async fn wait(&mut self, duration: Duration) -> bool {
        let mut shutdown = self.shutdown_rx.clone();
        tokio::select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop) => true,
            _ = tokio::time::sleep(duration) => false,
        }
    }

    /// Take a freshly acquired port on board and reconcile applications.
    async fn adopt_port(&mut self, port: u16) {
        let first = self.last_known_port.is_none();
        let changed = self.last_known_port.is_some_and(|prev| prev != port);
        let recovered = self.gateway_state == GatewayState::Unreachable && !first;

        if first {
            info!("Initial public port acquired: {}", port);
        } else if changed {
            info!("Public port changed to {}", port);
        }
        if changed {
            self.mapping.change_count += 1;
        }
        self.mapping.port = Some(port);
        self.mapping.acquired_at = Some(Utc::now());
        self.last_known_port = Some(port);
        self.gateway_state = GatewayState::Reachable;
        self.last_failure = None;
        info!(
            "Public port: {}, changed {} time(s)",
            port, self.mapping.change_count
        );

        // A changed port cycles every running application; a first
        // acquisition or an outage recovery brings stopped ones up.
        let restart = changed;
        let cold_start = first || recovered;

        if restart
            && self
                .apps
                .iter()
                .any(|a| a.state == AppRuntimeState::Running)
        {
            self.stop_matching(AppRuntimeState::Restarting, |a| {
                a.state == AppRuntimeState::Running
            })
            .await;
            self.publish();
            if self.wait(self.tuning.stop_grace).await {
                // Shutdown mid-grace; the final sweep settles the rest.
                return;
            }
        }

        let mut launches = Vec::new();
        for app in self.apps.iter_mut() {
            let due = match app.state {
                AppRuntimeState::Restarting => true,
                AppRuntimeState::Stopped => cold_start,
                AppRuntimeState::Running => false,
            };
            if due {
                launches.push(app.apply_and_start(port));
            }
        }
        join_all(launches).await;
        self.publish();
    }

    /// The gateway stopped answering: drop the mapping, stop every
    /// gateway-bound application in this same iteration.
    async fn enter_degraded(&mut self, err: AcquireError) {
        warn!("Failed to refresh public port: {}", err);
        self.last_failure = Some(err.to_string());
        self.gateway_state = GatewayState::Unreachable;
        self.mapping.port = None;
        self.mapping.acquired_at = None;
        self.stop_matching(AppRuntimeState::Stopped, |a| {
            a.config.gateway_required && a.state == AppRuntimeState::Running
        })
        .await;
        self.publish();
    }

    fn record_failure(&mut self, err: AcquireError) {
        warn!("Gateway still unreachable: {}", err);
        self.last_failure = Some(err.to_string());
        self.publish();
    }

    /// Issue concurrent stop requests to every app matching `pred` and
    /// record `next` as its state.  Per-app failures are isolated.
    async fn stop_matching(
        &mut self,
        next: AppRuntimeState,
        pred: impl Fn(&ManagedApp) -> bool,
    ) {
        let mut stops = Vec::new();
        for app in self.apps.iter_mut() {
            if pred(&*app) {
                stops.push(app.request_stop(next));
            }
        }
        join_all(stops).await;
    }

    async fn shut_down_all(mut self) -> Self {
        info!("Shutting down, stopping managed applications");
        self.stop_matching(AppRuntimeState::Stopped, |a| {
            matches!(
                a.state,
                AppRuntimeState::Running | AppRuntimeState::Restarting
            )
        })
        .await;
        self.publish();
        info!("Refresh engine stopped");
        self
    }

    fn publish(&self) {
        let snapshot = StatusSnapshot {
            gateway: self.gateway_state,
            gateway_detail: self.last_failure.clone(),
            mapping: self.mapping.clone(),
            apps: self.apps.iter().map(|a| a.status()).collect(),
            generated_at: Utc::now(),
        };
        let _ = self.status_tx.send(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apps::{AdapterError, AppAdapter};
    use crate::types::AppConfig;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Apply(String, u16),
        Start(String),
        Stop(String),
    }

    type CallLog = Arc<Mutex<Vec<Call>>>;

    struct ScriptedGateway {
        script: Mutex<VecDeque<Result<u16, AcquireError>>>,
        attempts: Mutex<Vec<tokio::time::Instant>>,
    }

    impl ScriptedGateway {
        fn new(script: Vec<Result<u16, AcquireError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                attempts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait::async_trait]
    impl GatewayClient for Arc<ScriptedGateway> {
        async fn request_mapping(&self) -> Result<u16, AcquireError> {
            self.attempts.lock().unwrap().push(tokio::time::Instant::now());
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(result) => result,
                // Script exhausted: hang until the test requests shutdown.
                None => std::future::pending().await,
            }
        }
    }

    struct RecordingAdapter {
        id: String,
        log: CallLog,
        fail_start: bool,
    }

    #[async_trait::async_trait]
    impl AppAdapter for RecordingAdapter {
        async fn apply(&mut self, port: u16) -> Result<(), AdapterError> {
            self.log
                .lock()
                .unwrap()
                .push(Call::Apply(self.id.clone(), port));
            Ok(())
        }

        async fn start(&mut self) -> Result<(), AdapterError> {
            self.log.lock().unwrap().push(Call::Start(self.id.clone()));
            if self.fail_start {
                Err(AdapterError::Lifecycle("launch refused".into()))
            } else {
                Ok(())
            }
        }

        async fn stop(&mut self) -> Result<(), AdapterError> {
            self.log.lock().unwrap().push(Call::Stop(self.id.clone()));
            Ok(())
        }

        fn describe(&self) -> String {
            format!("recording adapter {}", self.id)
        }
    }

    fn test_app(id: &str, gateway_required: bool, log: &CallLog) -> ManagedApp {
        ManagedApp::new(
            AppConfig {
                id: id.to_string(),
                gateway_required,
            },
            Box::new(RecordingAdapter {
                id: id.to_string(),
                log: log.clone(),
                fail_start: false,
            }),
        )
    }

    fn tuning() -> Tuning {
        Tuning {
            refresh: Duration::from_secs(45),
            retry_delay: Duration::from_secs(5),
            backoff: Duration::from_secs(30),
            stop_grace: Duration::from_secs(30),
        }
    }

    /// Run the engine against a scripted gateway on the paused clock; once
    /// the script is exhausted the gateway hangs and the controller below
    /// requests shutdown.
    async fn run_scripted(
        script: Vec<Result<u16, AcquireError>>,
        apps: Vec<ManagedApp>,
    ) -> (Engine, ShutdownHandle, StatusBoard) {
        let (engine, handle, board) = Engine::new(Box::new(ScriptedGateway::new(script)), apps, tuning());
        let controller = handle.clone();
        let (engine, ()) = tokio::join!(engine.run(), async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            controller.shutdown();
        });
        (engine, handle, board)
    }

    fn calls_for(log: &CallLog, id: &str) -> Vec<Call> {
        log.lock()
            .unwrap()
            .iter()
            .filter(|c| match c {
                Call::Apply(i, _) | Call::Start(i) | Call::Stop(i) => i == id,
            })
            .cloned()
            .collect()
    }

    /// Every start must be immediately preceded by an apply for the same
    /// app carrying the same port.
    fn assert_apply_precedes_start(log: &CallLog) {
        let calls = log.lock().unwrap().clone();
        for (i, call) in calls.iter().enumerate() {
            if let Call::Start(id) = call {
                let per_app: Vec<&Call> = calls[..i]
                    .iter()
                    .filter(|c| match c {
                        Call::Apply(j, _) | Call::Start(j) | Call::Stop(j) => j == id,
                    })
                    .collect();
                assert!(
                    matches!(per_app.last(), Some(Call::Apply(_, _))),
                    "start of '{}' not preceded by an apply: {:?}",
                    id,
                    calls
                );
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn change_count_ignores_first_acquisition() {
        let script = vec![Ok(100), Ok(101), Ok(101), Ok(102)];
        let (engine, _, _) = run_scripted(script, Vec::new()).await;
        assert_eq!(engine.mapping().change_count, 2);
        assert_eq!(engine.mapping().port, Some(102));
        assert_eq!(engine.gateway_state(), GatewayState::Reachable);
    }

    #[tokio::test(start_paused = true)]
    async fn single_restart_cycle_for_one_port_change() {
        let log: CallLog = Default::default();
        let apps = vec![test_app("folx", false, &log)];
        let script = vec![Ok(100), Ok(100), Ok(105), Ok(105)];
        let (engine, _, _) = run_scripted(script, apps).await;

        assert_eq!(engine.mapping().change_count, 1);
        assert_eq!(
            calls_for(&log, "folx"),
            vec![
                Call::Apply("folx".into(), 100),
                Call::Start("folx".into()),
                // the one restart cycle, between the 100 and 105 leases
                Call::Stop("folx".into()),
                Call::Apply("folx".into(), 105),
                Call::Start("folx".into()),
                // final shutdown sweep
                Call::Stop("folx".into()),
            ]
        );
        assert_apply_precedes_start(&log);
    }

    #[tokio::test(start_paused = true)]
    async fn apps_start_only_after_first_success() {
        let log: CallLog = Default::default();
        let apps = vec![test_app("transmission", true, &log), test_app("folx", false, &log)];
        let script = vec![
            Err(AcquireError::Timeout {
                timeout: Duration::from_secs(30),
            }),
            Ok(200),
        ];
        let (engine, _, _) = run_scripted(script, apps).await;

        assert_eq!(engine.mapping().change_count, 0);
        assert_eq!(engine.mapping().port, Some(200));
        for id in ["transmission", "folx"] {
            assert_eq!(
                calls_for(&log, id),
                vec![
                    Call::Apply(id.into(), 200),
                    Call::Start(id.into()),
                    Call::Stop(id.into()),
                ],
                "app '{}' must start exactly once, never during the outage",
                id
            );
        }
        assert_apply_precedes_start(&log);
    }

    #[tokio::test(start_paused = true)]
    async fn outage_cycles_gateway_required_apps_only() {
        let log: CallLog = Default::default();
        let apps = vec![test_app("transmission", true, &log), test_app("folx", false, &log)];
        let io_err = || Err(AcquireError::Io("no route to gateway".into()));
        let script = vec![Ok(300), io_err(), io_err(), io_err(), Ok(300)];
        let (engine, _, _) = run_scripted(script, apps).await;

        // Numerically unchanged port: no change counted, but the
        // gateway-bound app is still cycled because the old lease is gone.
        assert_eq!(engine.mapping().change_count, 0);
        assert_eq!(
            calls_for(&log, "transmission"),
            vec![
                Call::Apply("transmission".into(), 300),
                Call::Start("transmission".into()),
                Call::Stop("transmission".into()),
                Call::Apply("transmission".into(), 300),
                Call::Start("transmission".into()),
                Call::Stop("transmission".into()),
            ]
        );
        // The non-gateway-bound app rides out the outage untouched; its
        // only stop is the final shutdown sweep.
        assert_eq!(
            calls_for(&log, "folx"),
            vec![
                Call::Apply("folx".into(), 300),
                Call::Start("folx".into()),
                Call::Stop("folx".into()),
            ]
        );
        assert_apply_precedes_start(&log);
    }

    #[tokio::test(start_paused = true)]
    async fn degraded_retries_once_short_then_backs_off() {
        let gateway = ScriptedGateway::new(vec![
            Err(AcquireError::Timeout {
                timeout: Duration::from_secs(30),
            }),
            Err(AcquireError::Io("still down".into())),
            Err(AcquireError::Io("still down".into())),
            Ok(400),
        ]);
        let (engine, handle, _) =
            Engine::new(Box::new(gateway.clone()), Vec::new(), tuning());
        let controller = handle.clone();
        let (engine, ()) = tokio::join!(engine.run(), async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            controller.shutdown();
        });
        assert_eq!(engine.mapping().port, Some(400));

        let attempts = gateway.attempts.lock().unwrap().clone();
        assert_eq!(attempts.len(), 5, "4 scripted attempts plus the hung one");
        let deltas: Vec<u64> = attempts
            .windows(2)
            .map(|w| (w[1] - w[0]).as_secs())
            .collect();
        // init failure, +5s short retry, then 30s backoff until success,
        // then the next steady renewal 45s later.
        assert_eq!(deltas, vec![5, 30, 30, 45]);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_adapter_does_not_block_others() {
        let log: CallLog = Default::default();
        let broken = ManagedApp::new(
            AppConfig {
                id: "broken".to_string(),
                gateway_required: false,
            },
            Box::new(RecordingAdapter {
                id: "broken".to_string(),
                log: log.clone(),
                fail_start: true,
            }),
        );
        let apps = vec![broken, test_app("folx", false, &log)];
        let (engine, _, _) = run_scripted(vec![Ok(100)], apps).await;

        // The healthy app still runs its full cycle.
        assert_eq!(
            calls_for(&log, "folx"),
            vec![
                Call::Apply("folx".into(), 100),
                Call::Start("folx".into()),
                Call::Stop("folx".into()),
            ]
        );
        // The broken app never reached Running, so the shutdown sweep has
        // nothing to stop.
        assert_eq!(
            calls_for(&log, "broken"),
            vec![Call::Apply("broken".into(), 100), Call::Start("broken".into())]
        );
        assert_eq!(engine.apps()[0].state, AppRuntimeState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_is_idempotent() {
        let log: CallLog = Default::default();
        let apps = vec![test_app("folx", false, &log)];
        let (engine, handle, board) = run_scripted(vec![Ok(100)], apps).await;

        assert!(engine
            .apps()
            .iter()
            .all(|a| a.state == AppRuntimeState::Stopped));
        let before = calls_for(&log, "folx");

        // A second shutdown request changes nothing.
        handle.shutdown();
        assert_eq!(calls_for(&log, "folx"), before);
        assert!(board
            .snapshot()
            .apps
            .iter()
            .all(|a| a.state == AppRuntimeState::Stopped));
    }

    #[tokio::test(start_paused = true)]
    async fn snapshots_reflect_failures() {
        let script = vec![Err(AcquireError::Unsupported("no NAT-PMP".into()))];
        let (_, _, board) = run_scripted(script, Vec::new()).await;
        let snapshot = board.snapshot();
        assert_eq!(snapshot.gateway, GatewayState::Unreachable);
        assert!(snapshot
            .gateway_detail
            .as_deref()
            .unwrap_or_default()
            .contains("no NAT-PMP"));
        assert!(snapshot.mapping.port.is_none());
    }
}
