use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use crossbeam_channel::{Receiver, Sender, select};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::alarm::model::AlarmRequest;
use crate::notification::{Notification, Notifier};
use crate::protocol::{ClientMessage, ServerMessage};

const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(1);
/// Longest single wait. The monotonic clock stops while the machine sleeps,
/// so the wall clock is compared with the target at least this often.
const WALL_CLOCK_RECHECK: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct ClientHandle {
    pub id: String,
    pub instance_id: String,
}

/// Live foreground contexts the scheduler can reach at fire time.
pub trait ClientRegistry: Send + Sync {
    /// May legitimately be empty.
    fn match_all(&self) -> Vec<ClientHandle>;
    /// Queues `message` for `client`. Delivery is not confirmed.
    fn post_message(&self, client: &ClientHandle, message: &ServerMessage) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ArmOutcome {
    Armed(AlarmRequest),
    Superseded {
        previous: AlarmRequest,
        current: AlarmRequest,
    },
    Rejected,
}

/// The single alarm slot. Holds at most one pending request.
#[derive(Debug, Default)]
pub struct AlarmSlot {
    pending: Option<AlarmRequest>,
}

impl AlarmSlot {
    pub fn arm(&mut self, timestamp: Option<i64>, now_ms: i64) -> ArmOutcome {
        let Some(current) = AlarmRequest::accept(timestamp, now_ms) else {
            return ArmOutcome::Rejected;
        };
        match self.pending.replace(current) {
            Some(previous) => ArmOutcome::Superseded { previous, current },
            None => ArmOutcome::Armed(current),
        }
    }

    pub fn cancel(&mut self) -> Option<AlarmRequest> {
        self.pending.take()
    }

    pub fn is_armed(&self) -> bool {
        self.pending.is_some()
    }

    pub fn pending(&self) -> Option<AlarmRequest> {
        self.pending
    }

    /// Consumes the pending request once its timer has expired.
    pub fn take_due(&mut self) -> Option<AlarmRequest> {
        self.pending.take()
    }
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct SchedulerSnapshot {
    pub armed: bool,
    pub target_timestamp_ms: Option<i64>,
    pub fired_count: u64,
    pub last_fired_unix_ms: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct FireOutcome {
    pub recipients: usize,
    pub delivered: usize,
    pub notified: bool,
}

/// Runs the fire action: broadcast to every live context, then raise the
/// system notification. Neither step is skipped because the other failed.
pub fn fire_alarm(
    registry: &dyn ClientRegistry,
    notifier: &dyn Notifier,
    notification: &Notification,
    fired_at_ms: i64,
) -> FireOutcome {
    let message = ServerMessage::AlarmTriggered {
        timestamp: Some(fired_at_ms),
    };
    let clients = registry.match_all();
    let mut outcome = FireOutcome {
        recipients: clients.len(),
        ..FireOutcome::default()
    };
    for client in &clients {
        match registry.post_message(client, &message) {
            Ok(()) => outcome.delivered += 1,
            Err(err) => warn!(
                client_id = %client.id,
                instance_id = %client.instance_id,
                "could not deliver ALARM_TRIGGERED: {err:#}"
            ),
        }
    }
    debug!(
        recipients = outcome.recipients,
        delivered = outcome.delivered,
        "alarm broadcast finished"
    );

    match notifier.show(notification) {
        Ok(()) => outcome.notified = true,
        Err(err) => error!("failed to show alarm notification: {err:#}"),
    }
    outcome
}

/// What a click on the alarm notification should bring forward.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ClickTarget {
    Focus(ClientHandle),
    OpenNew,
}

/// Picks the longest-connected live context for a notification click, or
/// asks for a new one when none is open.
pub fn notification_clicked(registry: &dyn ClientRegistry) -> ClickTarget {
    match registry.match_all().into_iter().next() {
        Some(client) => {
            info!(
                client_id = %client.id,
                instance_id = %client.instance_id,
                "alarm notification clicked; focusing context"
            );
            ClickTarget::Focus(client)
        }
        None => {
            info!("alarm notification clicked with no open context; run `alarmclock watch`");
            ClickTarget::OpenNew
        }
    }
}

enum Command {
    Deliver(ClientMessage),
    Snapshot(Sender<SchedulerSnapshot>),
    Shutdown,
}

/// Cloneable sending side of the scheduler's ordered command channel.
#[derive(Clone)]
pub struct SchedulerHandle {
    commands: Sender<Command>,
}

impl SchedulerHandle {
    pub fn send(&self, message: ClientMessage) -> Result<()> {
        self.commands
            .send(Command::Deliver(message))
            .map_err(|_| anyhow!("alarm scheduler has stopped"))
    }

    pub fn snapshot(&self) -> Result<SchedulerSnapshot> {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        self.commands
            .send(Command::Snapshot(reply_tx))
            .map_err(|_| anyhow!("alarm scheduler has stopped"))?;
        reply_rx
            .recv_timeout(SNAPSHOT_TIMEOUT)
            .context("alarm scheduler did not answer the snapshot request")
    }
}

/// Owns the scheduler thread for the lifetime of the background process.
pub struct SchedulerService {
    handle: SchedulerHandle,
    join: Option<JoinHandle<()>>,
}

impl SchedulerService {
    pub fn spawn(
        registry: Arc<dyn ClientRegistry>,
        notifier: Arc<dyn Notifier>,
        notification: Notification,
    ) -> Result<Self> {
        let (commands_tx, commands_rx) = crossbeam_channel::unbounded();
        let worker = SchedulerWorker {
            slot: AlarmSlot::default(),
            timer: crossbeam_channel::never(),
            registry,
            notifier,
            notification,
            fired_count: 0,
            last_fired_unix_ms: None,
        };
        let join = thread::Builder::new()
            .name("alarm-scheduler".to_string())
            .spawn(move || worker.run(commands_rx))
            .context("failed to spawn alarm scheduler thread")?;
        Ok(Self {
            handle: SchedulerHandle {
                commands: commands_tx,
            },
            join: Some(join),
        })
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }
}

impl Drop for SchedulerService {
    fn drop(&mut self) {
        let _ = self.handle.commands.send(Command::Shutdown);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

struct SchedulerWorker {
    slot: AlarmSlot,
    timer: Receiver<Instant>,
    registry: Arc<dyn ClientRegistry>,
    notifier: Arc<dyn Notifier>,
    notification: Notification,
    fired_count: u64,
    last_fired_unix_ms: Option<i64>,
}

impl SchedulerWorker {
    fn run(mut self, commands: Receiver<Command>) {
        info!("alarm scheduler activated");
        let mut running = true;
        while running {
            let timer = self.timer.clone();
            select! {
                recv(commands) -> command => match command {
                    Ok(Command::Deliver(message)) => self.apply(message),
                    Ok(Command::Snapshot(reply)) => {
                        let _ = reply.send(self.snapshot());
                    }
                    Ok(Command::Shutdown) | Err(_) => running = false,
                },
                recv(timer) -> _ => self.on_timer(),
            }
        }
        info!("alarm scheduler stopped");
    }

    fn apply(&mut self, message: ClientMessage) {
        let now_ms = Utc::now().timestamp_millis();
        match message {
            ClientMessage::SetAlarm { timestamp } => match self.slot.arm(timestamp, now_ms) {
                ArmOutcome::Rejected => {
                    debug!(?timestamp, "ignoring SET_ALARM without a future timestamp");
                }
                ArmOutcome::Armed(request) => {
                    self.install_timer(request, now_ms);
                    log_armed(request, now_ms);
                }
                ArmOutcome::Superseded { previous, current } => {
                    info!(
                        previous_target_ms = previous.target_timestamp_ms,
                        "superseding pending alarm"
                    );
                    self.install_timer(current, now_ms);
                    log_armed(current, now_ms);
                }
            },
            ClientMessage::ClearAlarm => {
                self.timer = crossbeam_channel::never();
                match self.slot.cancel() {
                    Some(request) => info!(
                        target_timestamp_ms = request.target_timestamp_ms,
                        "alarm cleared"
                    ),
                    None => debug!("CLEAR_ALARM while idle"),
                }
            }
        }
    }

    fn install_timer(&mut self, request: AlarmRequest, now_ms: i64) {
        self.timer = crossbeam_channel::after(timer_delay(request, now_ms));
    }

    fn on_timer(&mut self) {
        let now_ms = Utc::now().timestamp_millis();
        match self.slot.pending() {
            Some(request) if request.is_due(now_ms) => self.fire(),
            Some(request) => {
                debug!(
                    target_timestamp_ms = request.target_timestamp_ms,
                    "alarm not due yet; waiting again"
                );
                self.install_timer(request, now_ms);
            }
            None => self.timer = crossbeam_channel::never(),
        }
    }

    fn fire(&mut self) {
        self.timer = crossbeam_channel::never();
        let Some(request) = self.slot.take_due() else {
            return;
        };
        let fired_at_ms = Utc::now().timestamp_millis();
        self.fired_count = self.fired_count.saturating_add(1);
        self.last_fired_unix_ms = Some(fired_at_ms);
        info!(
            target_timestamp_ms = request.target_timestamp_ms,
            "alarm fired"
        );
        let outcome = fire_alarm(
            self.registry.as_ref(),
            self.notifier.as_ref(),
            &self.notification,
            fired_at_ms,
        );
        debug!(
            recipients = outcome.recipients,
            delivered = outcome.delivered,
            notified = outcome.notified,
            "fire completed"
        );
    }

    fn snapshot(&self) -> SchedulerSnapshot {
        let pending = self.slot.pending();
        SchedulerSnapshot {
            armed: pending.is_some(),
            target_timestamp_ms: pending.map(|request| request.target_timestamp_ms),
            fired_count: self.fired_count,
            last_fired_unix_ms: self.last_fired_unix_ms,
        }
    }
}

/// Wait before the next wall-clock check for `request`.
fn timer_delay(request: AlarmRequest, now_ms: i64) -> Duration {
    request.delay_from(now_ms).min(WALL_CLOCK_RECHECK)
}

fn log_armed(request: AlarmRequest, now_ms: i64) {
    info!(
        target_timestamp_ms = request.target_timestamp_ms,
        seconds_until_alarm = request.delay_from(now_ms).as_secs(),
        "alarm armed"
    );
}
