//! The supervisor: owns the authoritative status, applies transitions and
//! runs every side effect.
//!
//! All stimuli (user actions, probe/launch outcomes, watchdog rounds) funnel
//! into one event queue and are applied strictly in order, so exactly one
//! status is current at any time and no component ever races another for a
//! transition.

use crate::launcher::EngineLauncher;
use crate::probe::CapabilityProbe;
use crate::runner::ProcessRunner;
use crate::state::{next_status, StartupEvent, TransitionContext, UserAction};
use crate::watchdog::{ConnectionWatchdog, WatchdogEvent, WatchdogHandle};
use crate::SupervisorError;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use yaklink_config::{EnginePaths, LinkConfig, Settings, DEFAULT_LOCAL_PORT};
use yaklink_core::{ConnectionStatus, EngineCredential, EngineMode, EventBus, LinkEvent};
use yaklink_rpc::{EngineRpc, GrpcEngineRpc, RpcError};

/// Builds the rpc endpoint the watchdog pings. Injected so tests can
/// substitute a scripted endpoint for the tonic channel.
pub type RpcFactory =
    Arc<dyn Fn(&EngineCredential) -> Result<Arc<dyn EngineRpc>, RpcError> + Send + Sync>;

/// The production factory: a lazy tonic channel per credential.
pub fn grpc_rpc_factory() -> RpcFactory {
    Arc::new(|credential| {
        let rpc = GrpcEngineRpc::new(credential)?;
        Ok(Arc::new(rpc) as Arc<dyn EngineRpc>)
    })
}

/// Cloneable front door for user actions.
#[derive(Clone)]
pub struct SupervisorHandle {
    tx: mpsc::UnboundedSender<StartupEvent>,
}

impl SupervisorHandle {
    /// Queue a user action. Returns `false` once the supervisor is gone.
    pub fn action(&self, action: UserAction) -> bool {
        self.tx.send(StartupEvent::User(action)).is_ok()
    }

    /// Stop the supervisor's event loop.
    pub fn shutdown(&self) {
        let _ = self.tx.send(StartupEvent::Shutdown);
    }
}

pub struct Supervisor {
    paths: EnginePaths,
    config: LinkConfig,
    bus: EventBus,
    rpc_factory: RpcFactory,
    probe: Arc<CapabilityProbe>,
    launcher: Arc<EngineLauncher>,
    status: ConnectionStatus,
    credential: Option<EngineCredential>,
    port: u16,
    port_override: Option<u16>,
    settings: Settings,
    watchdog: Option<WatchdogHandle>,
    events_tx: mpsc::UnboundedSender<StartupEvent>,
    events_rx: mpsc::UnboundedReceiver<StartupEvent>,
}

impl Supervisor {
    pub fn new(
        paths: EnginePaths,
        config: LinkConfig,
        bus: EventBus,
        rpc_factory: RpcFactory,
    ) -> (Self, SupervisorHandle) {
        let runner = ProcessRunner::new(paths.clone(), bus.clone());
        let probe = Arc::new(CapabilityProbe::new(runner.clone(), config.clone()));
        let launcher = Arc::new(EngineLauncher::new(runner, config.clone()));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let handle = SupervisorHandle {
            tx: events_tx.clone(),
        };

        let supervisor = Self {
            paths,
            config,
            bus,
            rpc_factory,
            probe,
            launcher,
            status: ConnectionStatus::Idle,
            credential: None,
            port: DEFAULT_LOCAL_PORT,
            port_override: None,
            settings: Settings::default(),
            watchdog: None,
            events_tx,
            events_rx,
        };
        (supervisor, handle)
    }

    /// Pin the local port, overriding both the default and any persisted
    /// custom port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port_override = Some(port);
        self
    }

    /// Run until [`SupervisorHandle::shutdown`] is called.
    ///
    /// Resumes the path of the last successful link: remote users land on
    /// the remote form, everyone else starts the local pipeline.
    pub async fn run(mut self) -> Result<(), SupervisorError> {
        self.settings = Settings::load(&self.paths.settings_file()).await?;
        self.port = self
            .port_override
            .or(self.settings.custom_port)
            .unwrap_or(DEFAULT_LOCAL_PORT);

        match self.settings.last_mode {
            Some(EngineMode::Remote) => self.set_status(ConnectionStatus::Remote),
            _ => self.begin_local_attempt(),
        }

        while let Some(event) = self.events_rx.recv().await {
            if matches!(event, StartupEvent::Shutdown) {
                break;
            }
            self.handle_event(event).await;
        }

        self.stop_watchdog();
        info!("supervisor stopped");
        Ok(())
    }

    async fn handle_event(&mut self, event: StartupEvent) {
        // Side effects that fire whether or not the status moves.
        match &event {
            StartupEvent::User(UserAction::ChangePort(port))
                if self.status == ConnectionStatus::PortOccupied =>
            {
                self.port = *port;
                self.settings.custom_port = Some(*port);
                self.persist_settings().await;
            }
            StartupEvent::User(UserAction::KeepCurrentVersion)
                if self.status == ConnectionStatus::OldVersion =>
            {
                info!("user kept the current engine version, handing off to legacy flow");
                self.bus.publish(LinkEvent::LegacyLinkRequested);
            }
            StartupEvent::LaunchOutcome(outcome)
                if outcome.is_success() && self.status == ConnectionStatus::Ready =>
            {
                self.start_watchdog();
            }
            StartupEvent::WatchdogStopped { failures } => {
                self.watchdog = None;
                self.bus.publish(LinkEvent::WatchdogStopped {
                    failures: *failures,
                });
            }
            _ => {}
        }

        let ctx = TransitionContext {
            mode: self.credential.as_ref().map(|c| c.mode),
            bundled_available: self.paths.bundled_engine_version().is_some(),
            local_failure_threshold: self.config.local_failure_threshold,
        };
        if let Some(next) = next_status(self.status, &event, &ctx) {
            self.enter(next, &event).await;
        }
    }

    async fn enter(&mut self, next: ConnectionStatus, event: &StartupEvent) {
        use ConnectionStatus as S;

        match next {
            S::Idle => {
                let remote_drop = matches!(event, StartupEvent::WatchdogFailed { .. });
                self.abandon_attempts();
                self.set_status(S::Idle);
                if remote_drop {
                    self.bus.publish(LinkEvent::RemoteDisconnected);
                } else {
                    // User-driven entry (retry, select local, new port):
                    // kick the local pipeline immediately.
                    self.begin_local_attempt();
                }
            }

            S::Ready => match event {
                StartupEvent::ProbeOutcome(outcome) => {
                    let payload = outcome.payload.as_ref();
                    let port = payload.and_then(|p| p.port).unwrap_or(self.port);
                    let secret = payload
                        .and_then(|p| p.secret.clone())
                        .unwrap_or_else(generate_local_password);
                    let credential = EngineCredential::local(port, secret);
                    self.credential = Some(credential.clone());
                    self.set_status(S::Ready);
                    self.begin_launch(credential);
                }
                StartupEvent::User(UserAction::ConnectRemote {
                    host,
                    port,
                    secret,
                    tls,
                    ca_pem,
                }) => {
                    let credential =
                        EngineCredential::remote(host, *port, secret.clone(), *tls, ca_pem.clone());
                    self.credential = Some(credential);
                    self.set_status(S::Ready);
                    // No launch for remote engines; the watchdog connects
                    // straight away.
                    self.start_watchdog();
                }
                _ => self.set_status(S::Ready),
            },

            S::Link => {
                self.set_status(S::Link);
                if let Some(credential) = self.credential.clone() {
                    self.settings.last_mode = Some(credential.mode);
                    self.persist_settings().await;
                    self.bus.publish(LinkEvent::LinkEstablished(credential));
                }
            }

            S::Remote | S::Break | S::ControlRemote => {
                self.abandon_attempts();
                self.set_status(next);
            }

            // Failure and install pages carry no side effects beyond the
            // status itself.
            other => self.set_status(other),
        }
    }

    fn begin_local_attempt(&mut self) {
        if !self.paths.is_engine_installed() {
            let bundled_available = self.paths.bundled_engine_version().is_some();
            debug!(bundled_available, "engine binary not installed");
            let _ = self.events_tx.send(StartupEvent::EngineMissing { bundled_available });
            return;
        }

        let probe = Arc::clone(&self.probe);
        let tx = self.events_tx.clone();
        let port = self.port;
        tokio::spawn(async move {
            if let Some(outcome) = probe.probe_local(port).await {
                let _ = tx.send(StartupEvent::ProbeOutcome(outcome));
            }
        });
    }

    fn begin_launch(&self, credential: EngineCredential) {
        let launcher = Arc::clone(&self.launcher);
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            if let Some(outcome) = launcher.launch(credential.port, &credential.secret).await {
                let _ = tx.send(StartupEvent::LaunchOutcome(outcome));
            }
        });
    }

    fn start_watchdog(&mut self) {
        let Some(credential) = &self.credential else {
            return;
        };
        let rpc = match (self.rpc_factory)(credential) {
            Ok(rpc) => rpc,
            Err(e) => {
                warn!(error = %e, "could not build engine rpc endpoint");
                self.set_status(ConnectionStatus::Error);
                return;
            }
        };

        let watchdog = ConnectionWatchdog::new(
            rpc,
            self.config.watchdog_interval,
            self.config.failure_ceiling,
        );
        let (wd_tx, mut wd_rx) = mpsc::unbounded_channel();
        let handle = watchdog.spawn(wd_tx);

        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = wd_rx.recv().await {
                let mapped = match event {
                    WatchdogEvent::Ready => StartupEvent::WatchdogReady,
                    WatchdogEvent::Failed { consecutive } => {
                        StartupEvent::WatchdogFailed { consecutive }
                    }
                    WatchdogEvent::Stopped { failures } => {
                        StartupEvent::WatchdogStopped { failures }
                    }
                };
                if tx.send(mapped).is_err() {
                    break;
                }
            }
        });

        self.watchdog = Some(handle);
    }

    fn stop_watchdog(&mut self) {
        if let Some(handle) = self.watchdog.take() {
            handle.stop();
        }
    }

    /// Tear down everything tied to the current attempt or link: the
    /// watchdog, in-flight probe/launch attempts and the credential.
    fn abandon_attempts(&mut self) {
        self.stop_watchdog();
        self.probe.supersede();
        self.launcher.supersede();
        self.credential = None;
    }

    fn set_status(&mut self, next: ConnectionStatus) {
        if self.status != next {
            info!(from = %self.status, to = %next, "connection status changed");
            self.status = next;
            self.bus.publish(LinkEvent::StatusChanged(next));
        }
    }

    async fn persist_settings(&self) {
        if let Err(e) = self.settings.save(&self.paths.settings_file()).await {
            warn!(error = %e, "failed to persist settings");
        }
    }
}

/// 32 hex characters, used when the probe payload carries no secret.
fn generate_local_password() -> String {
    (0..4).map(|_| format!("{:08x}", rand::random::<u32>())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn generated_password_is_32_hex_chars() {
        let password = generate_local_password();
        assert_eq!(password.len(), 32);
        assert!(password.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn generated_passwords_differ() {
        assert_ne!(generate_local_password(), generate_local_password());
    }

    #[cfg(unix)]
    mod pipeline {
        use super::*;
        use async_trait::async_trait;
        use std::os::unix::fs::PermissionsExt;
        use std::sync::atomic::{AtomicBool, Ordering};
        use tempfile::TempDir;
        use tokio::sync::broadcast;

        /// Echo endpoint whose health can be flipped mid-test.
        struct SwitchableRpc {
            healthy: AtomicBool,
        }

        impl SwitchableRpc {
            fn new(healthy: bool) -> Arc<Self> {
                Arc::new(Self {
                    healthy: AtomicBool::new(healthy),
                })
            }
        }

        #[async_trait]
        impl EngineRpc for SwitchableRpc {
            async fn echo(&self, text: &str) -> Result<String, RpcError> {
                if self.healthy.load(Ordering::SeqCst) {
                    Ok(text.to_string())
                } else {
                    Err(RpcError::InvalidAddress("down".to_string()))
                }
            }
        }

        fn factory_for(rpc: Arc<SwitchableRpc>) -> RpcFactory {
            Arc::new(move |_credential| Ok(Arc::clone(&rpc) as Arc<dyn EngineRpc>))
        }

        fn fake_engine(dir: &TempDir) -> EnginePaths {
            let script = dir.path().join("yak");
            std::fs::write(
                &script,
                concat!(
                    "#!/bin/sh\n",
                    "case \"$1\" in\n",
                    "  check-secret-local-grpc)\n",
                    "    echo '<json-t1>{\"ok\": true, \"port\": 9011, \"secret\": \"pw-local\"}</json-t1>'\n",
                    "    ;;\n",
                    "  grpc)\n",
                    "    echo 'yak grpc ok'\n",
                    "    sleep 2\n",
                    "    ;;\n",
                    "esac\n",
                ),
            )
            .unwrap();
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
            EnginePaths::new(dir.path(), script)
        }

        fn fast_config() -> LinkConfig {
            LinkConfig {
                watchdog_interval: Duration::from_millis(10),
                ..LinkConfig::default()
            }
        }

        async fn next_status_change(rx: &mut broadcast::Receiver<LinkEvent>) -> ConnectionStatus {
            loop {
                let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                    .await
                    .expect("timed out waiting for a status change")
                    .expect("bus closed");
                if let LinkEvent::StatusChanged(status) = event {
                    return status;
                }
            }
        }

        #[tokio::test]
        async fn local_pipeline_reaches_link_with_probed_credential() {
            let tmp = TempDir::new().unwrap();
            let bus = EventBus::new();
            let mut rx = bus.subscribe();
            let rpc = SwitchableRpc::new(true);
            let (supervisor, handle) = Supervisor::new(
                fake_engine(&tmp),
                fast_config(),
                bus,
                factory_for(rpc),
            );
            let task = tokio::spawn(supervisor.run());

            assert_eq!(next_status_change(&mut rx).await, ConnectionStatus::Ready);
            assert_eq!(next_status_change(&mut rx).await, ConnectionStatus::Link);

            // The established credential is the one the probe minted.
            loop {
                let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                    .await
                    .unwrap()
                    .unwrap();
                if let LinkEvent::LinkEstablished(credential) = event {
                    assert_eq!(credential.port, 9011);
                    assert_eq!(credential.secret, "pw-local");
                    assert_eq!(credential.mode, EngineMode::Local);
                    break;
                }
            }

            handle.shutdown();
            task.await.unwrap().unwrap();
        }

        #[tokio::test]
        async fn missing_engine_surfaces_install_page() {
            let tmp = TempDir::new().unwrap();
            let paths = EnginePaths::new(tmp.path(), tmp.path().join("not-installed"));
            let bus = EventBus::new();
            let mut rx = bus.subscribe();
            let (supervisor, handle) = Supervisor::new(
                paths,
                fast_config(),
                bus,
                factory_for(SwitchableRpc::new(true)),
            );
            let task = tokio::spawn(supervisor.run());

            assert_eq!(
                next_status_change(&mut rx).await,
                ConnectionStatus::InstallNetwork
            );

            handle.shutdown();
            task.await.unwrap().unwrap();
        }

        #[tokio::test]
        async fn remote_link_drops_to_idle_on_first_failure() {
            let tmp = TempDir::new().unwrap();
            let bus = EventBus::new();
            let mut rx = bus.subscribe();
            let rpc = SwitchableRpc::new(true);
            let paths = EnginePaths::new(tmp.path(), tmp.path().join("not-installed"));
            let (supervisor, handle) = Supervisor::new(
                paths,
                fast_config(),
                bus,
                factory_for(Arc::clone(&rpc)),
            );
            let task = tokio::spawn(supervisor.run());

            // Skip the initial install page from the local default path.
            assert_eq!(
                next_status_change(&mut rx).await,
                ConnectionStatus::InstallNetwork
            );

            assert!(handle.action(UserAction::SelectRemote));
            assert_eq!(next_status_change(&mut rx).await, ConnectionStatus::Remote);

            assert!(handle.action(UserAction::ConnectRemote {
                host: "127.0.0.1:9012".to_string(),
                port: 9011,
                secret: "remote-pw".to_string(),
                tls: false,
                ca_pem: None,
            }));
            assert_eq!(next_status_change(&mut rx).await, ConnectionStatus::Ready);
            assert_eq!(next_status_change(&mut rx).await, ConnectionStatus::Link);

            rpc.healthy.store(false, Ordering::SeqCst);
            assert_eq!(next_status_change(&mut rx).await, ConnectionStatus::Idle);

            // The drop is announced and nothing auto-reconnects.
            loop {
                let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                    .await
                    .unwrap()
                    .unwrap();
                if matches!(event, LinkEvent::RemoteDisconnected) {
                    break;
                }
            }

            handle.shutdown();
            task.await.unwrap().unwrap();
        }

        #[tokio::test]
        async fn local_failures_surface_error_at_the_threshold() {
            let tmp = TempDir::new().unwrap();
            let bus = EventBus::new();
            let mut rx = bus.subscribe();
            let rpc = SwitchableRpc::new(true);
            let (supervisor, handle) = Supervisor::new(
                fake_engine(&tmp),
                fast_config(),
                bus,
                factory_for(Arc::clone(&rpc)),
            );
            let task = tokio::spawn(supervisor.run());

            assert_eq!(next_status_change(&mut rx).await, ConnectionStatus::Ready);
            assert_eq!(next_status_change(&mut rx).await, ConnectionStatus::Link);

            rpc.healthy.store(false, Ordering::SeqCst);
            // Silent through four failures, error on the fifth.
            assert_eq!(next_status_change(&mut rx).await, ConnectionStatus::Error);

            handle.shutdown();
            task.await.unwrap().unwrap();
        }

        #[tokio::test]
        async fn new_port_after_conflict_reprobes_with_that_port() {
            let tmp = TempDir::new().unwrap();
            // Conflict on the default port, credential on any other.
            let script = tmp.path().join("yak");
            std::fs::write(
                &script,
                concat!(
                    "#!/bin/sh\n",
                    "case \"$1\" in\n",
                    "  check-secret-local-grpc)\n",
                    "    if [ \"$3\" = \"9011\" ]; then\n",
                    "      echo 'bind: address already in use'\n",
                    "    else\n",
                    "      echo '<json-r2>{\"ok\": true, \"secret\": \"pw-retry\"}</json-r2>'\n",
                    "    fi\n",
                    "    ;;\n",
                    "  grpc)\n",
                    "    echo 'yak grpc ok'\n",
                    "    sleep 2\n",
                    "    ;;\n",
                    "esac\n",
                ),
            )
            .unwrap();
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
            let paths = EnginePaths::new(tmp.path(), script);

            let bus = EventBus::new();
            let mut rx = bus.subscribe();
            let (supervisor, handle) = Supervisor::new(
                paths,
                fast_config(),
                bus,
                factory_for(SwitchableRpc::new(true)),
            );
            let task = tokio::spawn(supervisor.run());

            assert_eq!(
                next_status_change(&mut rx).await,
                ConnectionStatus::PortOccupied
            );

            assert!(handle.action(UserAction::ChangePort(9012)));
            assert_eq!(next_status_change(&mut rx).await, ConnectionStatus::Idle);
            assert_eq!(next_status_change(&mut rx).await, ConnectionStatus::Ready);
            assert_eq!(next_status_change(&mut rx).await, ConnectionStatus::Link);

            // The payload carried no port, so the credential uses the
            // user-chosen one.
            loop {
                let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                    .await
                    .unwrap()
                    .unwrap();
                if let LinkEvent::LinkEstablished(credential) = event {
                    assert_eq!(credential.port, 9012);
                    assert_eq!(credential.secret, "pw-retry");
                    break;
                }
            }

            handle.shutdown();
            task.await.unwrap().unwrap();
        }

        #[tokio::test]
        async fn break_disconnects_until_the_user_acts() {
            let tmp = TempDir::new().unwrap();
            let bus = EventBus::new();
            let mut rx = bus.subscribe();
            let (supervisor, handle) = Supervisor::new(
                fake_engine(&tmp),
                fast_config(),
                bus,
                factory_for(SwitchableRpc::new(true)),
            );
            let task = tokio::spawn(supervisor.run());

            assert_eq!(next_status_change(&mut rx).await, ConnectionStatus::Ready);
            assert_eq!(next_status_change(&mut rx).await, ConnectionStatus::Link);

            assert!(handle.action(UserAction::Break));
            assert_eq!(next_status_change(&mut rx).await, ConnectionStatus::Break);

            assert!(handle.action(UserAction::Retry));
            assert_eq!(next_status_change(&mut rx).await, ConnectionStatus::Idle);
            assert_eq!(next_status_change(&mut rx).await, ConnectionStatus::Ready);

            handle.shutdown();
            task.await.unwrap().unwrap();
        }

        #[tokio::test]
        async fn last_remote_mode_resumes_on_the_remote_form() {
            let tmp = TempDir::new().unwrap();
            let paths = EnginePaths::new(tmp.path(), tmp.path().join("not-installed"));
            Settings {
                last_mode: Some(EngineMode::Remote),
                custom_port: None,
            }
            .save(&paths.settings_file())
            .await
            .unwrap();

            let bus = EventBus::new();
            let mut rx = bus.subscribe();
            let (supervisor, handle) = Supervisor::new(
                paths,
                fast_config(),
                bus,
                factory_for(SwitchableRpc::new(true)),
            );
            let task = tokio::spawn(supervisor.run());

            assert_eq!(next_status_change(&mut rx).await, ConnectionStatus::Remote);

            handle.shutdown();
            task.await.unwrap().unwrap();
        }
    }
}
