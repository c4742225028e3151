use async_trait::async_trait;
use nodelink_core::*;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info};

pub mod bootstrap;
pub mod notifications;

use bootstrap::BootstrapReconciler;
use notifications::build_notifier;

/// Consumer of one tailed log.
#[async_trait]
trait LineHandler: Send + Sync + 'static {
    async fn consume(&self, line: &str);
}

#[async_trait]
impl LineHandler for EnvelopeRouter {
    async fn consume(&self, line: &str) {
        EnvelopeRouter::handle_line(self, line).await;
    }
}

#[async_trait]
impl LineHandler for PresenceReconciler {
    async fn consume(&self, line: &str) {
        let applied = PresenceReconciler::handle_line(self, line).await;
        if applied > 0 {
            debug!("Applied {} presence update(s)", applied);
        }
    }
}

/// The local monitor: seeds the connection state, then follows the service
/// session log and the gateway activity log until told to stop.
pub struct Monitor {
    config: NodeLinkConfig,
    store: Arc<ConnectionStateStore>,
    notifier: Arc<dyn Notifier>,
    bootstrap: Option<BootstrapReconciler>,
}

impl Monitor {
    pub fn new(config: NodeLinkConfig) -> Self {
        let store = Arc::new(ConnectionStateStore::new(config.monitor.state_path()));
        let notifier = build_notifier(&config.notifications);
        let bootstrap = config
            .bootstrap
            .enabled
            .then(|| BootstrapReconciler::from_config(&config.bootstrap));

        Self {
            config,
            store,
            notifier,
            bootstrap,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_bootstrap(mut self, bootstrap: Option<BootstrapReconciler>) -> Self {
        self.bootstrap = bootstrap;
        self
    }

    pub fn store(&self) -> Arc<ConnectionStateStore> {
        Arc::clone(&self.store)
    }

    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let monitor = &self.config.monitor;
        info!("Starting NodeLink monitor");

        tokio::fs::create_dir_all(&monitor.output_dir).await?;

        if let Some(bootstrap) = &self.bootstrap {
            bootstrap.run(&self.store).await;
        }

        let router = EnvelopeRouter::new(&monitor.output_dir, monitor.envelope_marker.clone());
        let session_tailer = SessionTailer::new(
            Box::new(SessionIndex::new(
                &monitor.session_dir,
                monitor.service_session_key.clone(),
            )),
            monitor.poll_interval(),
            monitor.max_wait(),
        );

        let reconciler = PresenceReconciler::new(
            monitor.raw_inbound_marker.clone(),
            PresenceFilter::new(&monitor.host_keywords, &monitor.target_platform),
            Arc::clone(&self.store),
            Arc::clone(&self.notifier),
        )
        .with_message_style(
            self.config.notifications.app_label.clone(),
            Locale::parse(&self.config.notifications.locale),
        );
        let presence_tailer = SessionTailer::new(
            Box::new(FixedPath::new(&monitor.listener_log)),
            monitor.poll_interval(),
            monitor.max_wait(),
        );

        let envelopes = tokio::spawn(follow(
            "envelope",
            session_tailer,
            router,
            shutdown.clone(),
        ));
        let presence = tokio::spawn(follow("presence", presence_tailer, reconciler, shutdown));

        for (name, handle) in [("envelope", envelopes), ("presence", presence)] {
            if let Err(e) = handle.await {
                error!("{} watcher task failed: {}", name, e);
            }
        }

        info!("NodeLink monitor stopped");
        Ok(())
    }
}

async fn follow<H: LineHandler>(
    name: &'static str,
    mut tailer: SessionTailer,
    handler: H,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("{} watcher started", name);
    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            line = tailer.next_line() => handler.consume(&line).await,
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    info!("{} watcher stopped", name);
}

/// Run the monitor until SIGTERM or Ctrl-C.
pub async fn run_until_shutdown(config: NodeLinkConfig) -> Result<()> {
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = tx.send(true);
    });

    Monitor::new(config).run(rx).await
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use futures_util::stream::StreamExt;
        use signal_hook::consts::SIGTERM;
        use signal_hook_tokio::Signals;

        match Signals::new([SIGTERM]) {
            Ok(mut signals) => {
                tokio::select! {
                    _ = signals.next() => info!("Received SIGTERM, shutting down gracefully"),
                    _ = tokio::signal::ctrl_c() => info!("Received Ctrl-C, shutting down"),
                }
                signals.handle().close();
                return;
            }
            Err(e) => error!("Failed to create signal handler: {}", e),
        }
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl-C, shutting down"),
        Err(e) => {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

/// `<data_dir>/nodelink`, created owner-only.
pub fn runtime_dir() -> Result<PathBuf> {
    let path = dirs::data_dir()
        .ok_or_else(|| NodeLinkError::Config("Could not find data directory".to_string()))?
        .join("nodelink");

    std::fs::create_dir_all(&path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o700))?;
    }

    Ok(path)
}

pub fn pid_file_path() -> Result<PathBuf> {
    Ok(runtime_dir()?.join("nodelink.pid"))
}

pub fn log_file_path() -> Result<PathBuf> {
    Ok(runtime_dir()?.join("nodelink.log"))
}

pub fn write_pid_file() -> Result<()> {
    let pid_path = pid_file_path()?;
    std::fs::write(&pid_path, std::process::id().to_string())?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&pid_path, std::fs::Permissions::from_mode(0o600))?;
    }

    info!("PID file written to {}", pid_path.display());
    Ok(())
}

pub fn remove_pid_file() -> Result<()> {
    let pid_path = pid_file_path()?;
    if pid_path.exists() {
        std::fs::remove_file(&pid_path)?;
        debug!("PID file removed");
    }
    Ok(())
}

/// PID of the running monitor, if any. A stale PID file is removed.
pub fn running_pid() -> Result<Option<u32>> {
    let pid_path = pid_file_path()?;
    if !pid_path.exists() {
        return Ok(None);
    }

    let pid: u32 = std::fs::read_to_string(&pid_path)?
        .trim()
        .parse()
        .map_err(|_| NodeLinkError::Other("Invalid PID in PID file".to_string()))?;

    #[cfg(unix)]
    {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        match kill(Pid::from_raw(pid as i32), None) {
            Ok(()) => Ok(Some(pid)),
            Err(_) => {
                let _ = std::fs::remove_file(&pid_path);
                Ok(None)
            }
        }
    }

    #[cfg(not(unix))]
    {
        Ok(Some(pid))
    }
}

/// Ask the monitor with `pid` to shut down.
#[cfg(unix)]
pub fn request_stop(pid: u32) -> Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
        .map_err(|e| NodeLinkError::Other(format!("Failed to stop monitor: {}", e)))
}

#[cfg(not(unix))]
pub fn request_stop(pid: u32) -> Result<()> {
    Err(NodeLinkError::Other(format!(
        "Stopping the monitor is not supported on this platform (PID {})",
        pid
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use std::path::Path;
    use std::time::Duration;

    #[tokio::test]
    #[serial]
    async fn test_pid_file_operations() {
        write_pid_file().unwrap();
        assert_eq!(running_pid().unwrap(), Some(std::process::id()));

        remove_pid_file().unwrap();
        assert!(running_pid().unwrap().is_none());
    }

    #[tokio::test]
    #[serial]
    async fn test_runtime_paths() {
        let pid = pid_file_path().unwrap();
        let log = log_file_path().unwrap();
        assert!(pid.ends_with("nodelink/nodelink.pid"));
        assert!(log.ends_with("nodelink/nodelink.log"));
    }

    #[tokio::test]
    #[serial]
    async fn test_stale_pid_cleanup() {
        let pid_path = pid_file_path().unwrap();
        std::fs::write(&pid_path, "999999").unwrap();

        assert!(running_pid().unwrap().is_none());
        assert!(!pid_path.exists());
    }

    fn append(path: &Path, text: &str) {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        file.write_all(text.as_bytes()).unwrap();
    }

    async fn eventually<F: Fn() -> bool>(check: F) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !check() {
            assert!(tokio::time::Instant::now() < deadline, "condition not reached");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    fn test_config(root: &Path) -> NodeLinkConfig {
        let mut config = NodeLinkConfig::default();
        config.monitor.session_dir = root.join("sessions");
        config.monitor.listener_log = root.join("listener.log");
        config.monitor.output_dir = root.join("state");
        config.monitor.poll_interval_ms = 10;
        config.monitor.max_wait_ms = 40;
        config.monitor.host_keywords = vec!["macbook".to_string()];
        config.bootstrap.enabled = false;
        config
    }

    #[tokio::test]
    async fn test_monitor_routes_both_logs_until_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        std::fs::create_dir_all(&config.monitor.session_dir).unwrap();
        std::fs::write(
            config.monitor.session_dir.join("sessions.json"),
            r#"{"agent:main:clawsy-service": {"sessionId": "s1"}}"#,
        )
        .unwrap();
        let session_log = config.monitor.session_dir.join("s1.jsonl");
        append(&session_log, "");
        append(&config.monitor.listener_log, "");

        let notifier = Arc::new(MemoryNotifier::new());
        let monitor = Monitor::new(config.clone()).with_notifier(notifier.clone());
        let store = monitor.store();

        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(async move { monitor.run(rx).await });
        tokio::time::sleep(Duration::from_millis(300)).await;

        let presence = r#"RAW_IN {"event":"presence","payload":{"presence":[{"mode":"node","platform":"macos","deviceId":"abc123","host":"MacBook-Pro","reason":"connect","ts":1700000000000}]}}"#;
        append(&config.monitor.listener_log, &format!("{}\n{}\n", presence, presence));

        let envelope = serde_json::json!({
            "message": {"content": [{
                "type": "text",
                "text": serde_json::json!({"clawsy_envelope": {"type": "clipboard", "content": "hi"}}).to_string()
            }]}
        });
        append(&session_log, &format!("{}\n", envelope));

        let artifact = config.monitor.output_dir.join("clipboard-latest.json");
        eventually(|| artifact.exists()).await;
        eventually(|| config.monitor.state_path().exists()).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let state = store.snapshot().await;
        assert_eq!(state.status, ConnectionStatus::Connected);
        assert_eq!(state.device_id.as_deref(), Some("abc123"));
        assert_eq!(notifier.messages().len(), 1);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_monitor_stops_while_waiting_for_logs() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = Monitor::new(test_config(dir.path()))
            .with_notifier(Arc::new(MemoryNotifier::new()));

        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(async move { monitor.run(rx).await });
        tokio::time::sleep(Duration::from_millis(100)).await;

        drop(tx);
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
