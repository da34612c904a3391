use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub icon: String,
    /// Notifications sharing a tag replace each other instead of stacking.
    pub tag: String,
    pub require_interaction: bool,
}

impl Default for Notification {
    fn default() -> Self {
        Self {
            title: "Alarm!".to_string(),
            body: "Your alarm is ringing!".to_string(),
            icon: "alarm-clock".to_string(),
            tag: "alarm".to_string(),
            require_interaction: true,
        }
    }
}

pub trait Notifier: Send + Sync {
    fn show(&self, notification: &Notification) -> Result<()>;
}

pub type ClickHandler = Arc<dyn Fn() + Send + Sync>;

const DEFAULT_ACTION: &str = "default";

/// Shows notifications through the desktop notification service.
pub struct DesktopNotifier {
    app_name: String,
    #[cfg_attr(not(all(unix, not(target_os = "macos"))), allow(dead_code))]
    shown_by_tag: Mutex<HashMap<String, u32>>,
    #[cfg_attr(not(all(unix, not(target_os = "macos"))), allow(dead_code))]
    on_click: Option<ClickHandler>,
    #[cfg_attr(not(all(unix, not(target_os = "macos"))), allow(dead_code))]
    generation: Arc<AtomicU64>,
}

impl DesktopNotifier {
    pub fn new(app_name: &str) -> Self {
        Self {
            app_name: app_name.to_string(),
            shown_by_tag: Mutex::new(HashMap::new()),
            on_click: None,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Runs `handler` when the user activates the most recent notification.
    /// Only the freedesktop backend reports activations.
    pub fn with_click_handler(mut self, handler: ClickHandler) -> Self {
        self.on_click = Some(handler);
        self
    }

    #[cfg(all(unix, not(target_os = "macos")))]
    fn show_tagged(&self, desktop: &mut notify_rust::Notification, tag: &str) -> Result<()> {
        let mut shown = self
            .shown_by_tag
            .lock()
            .map_err(|_| anyhow!("notification tag lock poisoned"))?;
        if let Some(previous) = shown.get(tag) {
            desktop.id(*previous);
        }
        desktop.urgency(notify_rust::Urgency::Critical);
        if self.on_click.is_some() {
            desktop.action(DEFAULT_ACTION, "Open");
        }
        let handle = desktop
            .show()
            .map_err(|err| anyhow!("desktop notification failed: {err}"))?;
        shown.insert(tag.to_string(), handle.id());

        let Some(on_click) = self.on_click.clone() else {
            return Ok(());
        };
        let shown_generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let generation = Arc::clone(&self.generation);
        // The notification server closes a notification once an action is invoked.
        std::thread::Builder::new()
            .name("notification-actions".to_string())
            .spawn(move || {
                handle.wait_for_action(|action| {
                    dispatch_action(action, shown_generation, &generation, on_click.as_ref());
                });
            })
            .map_err(|err| anyhow!("failed to watch notification actions: {err}"))?;
        Ok(())
    }

    #[cfg(not(all(unix, not(target_os = "macos"))))]
    fn show_tagged(&self, desktop: &mut notify_rust::Notification, _tag: &str) -> Result<()> {
        let _handle = desktop
            .show()
            .map_err(|err| anyhow!("desktop notification failed: {err}"))?;
        Ok(())
    }
}

impl Notifier for DesktopNotifier {
    fn show(&self, notification: &Notification) -> Result<()> {
        let mut desktop = notify_rust::Notification::new();
        desktop
            .appname(&self.app_name)
            .summary(&notification.title)
            .body(&notification.body)
            .icon(&notification.icon);
        if notification.require_interaction {
            desktop.timeout(notify_rust::Timeout::Never);
        }
        self.show_tagged(&mut desktop, &notification.tag)
    }
}

/// Forwards a click to `on_click` unless a newer notification replaced the
/// one that was clicked.
#[cfg_attr(not(all(unix, not(target_os = "macos"))), allow(dead_code))]
fn dispatch_action(
    action: &str,
    shown_generation: u64,
    latest_generation: &AtomicU64,
    on_click: &(dyn Fn() + Send + Sync),
) -> bool {
    if action != DEFAULT_ACTION {
        return false;
    }
    if latest_generation.load(Ordering::Relaxed) != shown_generation {
        return false;
    }
    on_click();
    true
}
