use nodelink_core::{NotificationConfig, Notifier};
use notify_rust::Notification;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

/// Placeholder replaced with the message text in command templates.
pub const TEXT_PLACEHOLDER: &str = "{text}";

/// Runs an external command per message, e.g.
/// `openclaw system event --text {text} --mode now`.
#[derive(Debug, Clone)]
pub struct CommandNotifier {
    argv: Vec<String>,
}

impl CommandNotifier {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }

    pub fn render(&self, text: &str) -> Vec<String> {
        self.argv
            .iter()
            .map(|arg| arg.replace(TEXT_PLACEHOLDER, text))
            .collect()
    }
}

impl Notifier for CommandNotifier {
    fn notify(&self, text: &str) {
        let argv = self.render(text);
        let Some((program, args)) = argv.split_first() else {
            warn!("Notification command is empty, dropping: {}", text);
            return;
        };
        let Ok(handle) = Handle::try_current() else {
            warn!("No runtime to run notification command, dropping: {}", text);
            return;
        };

        let _guard = handle.enter();
        let spawned = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();

        match spawned {
            Ok(mut child) => {
                let program = program.clone();
                handle.spawn(async move {
                    match child.wait().await {
                        Ok(status) if status.success() => {
                            debug!("Notification command {} finished", program)
                        }
                        Ok(status) => {
                            warn!("Notification command {} exited with {}", program, status)
                        }
                        Err(e) => warn!("Failed to reap notification command {}: {}", program, e),
                    }
                });
            }
            Err(e) => warn!("Failed to run notification command {}: {}", program, e),
        }
    }
}

/// Desktop notification through the platform notification service.
#[derive(Debug, Clone)]
pub struct DesktopNotifier {
    app_name: String,
}

impl DesktopNotifier {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
        }
    }

    fn show(app_name: &str, text: &str) {
        let result = Notification::new()
            .summary(app_name)
            .body(text)
            .appname(app_name)
            .timeout(Duration::from_secs(5))
            .show();

        match result {
            Ok(_) => debug!("Notification shown: {}", text),
            Err(e) => warn!("Failed to show notification: {}", e),
        }
    }
}

impl Notifier for DesktopNotifier {
    fn notify(&self, text: &str) {
        let app_name = self.app_name.clone();
        let text = text.to_string();
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || Self::show(&app_name, &text));
            }
            Err(_) => Self::show(&app_name, &text),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, text: &str) {
        info!("Notification: {}", text);
    }
}

/// Select the backend named by `config.backend`.
pub fn build_notifier(config: &NotificationConfig) -> Arc<dyn Notifier> {
    match config.backend.trim().to_lowercase().as_str() {
        "command" => Arc::new(CommandNotifier::new(config.command.clone())),
        "desktop" => Arc::new(DesktopNotifier::new(config.app_label.clone())),
        "log" | "none" => Arc::new(LogNotifier),
        other => {
            warn!("Unknown notification backend '{}', logging only", other);
            Arc::new(LogNotifier)
        }
    }
}
