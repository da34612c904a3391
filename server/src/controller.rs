use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Local, TimeZone};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::alarm::model::{
    AlarmTime, TimeDisplayMode, format_clock, format_countdown, next_alarm_in_tz,
};
use crate::audio::AlertPlayer;
use crate::link::SchedulerLink;
use crate::notification::{Notification, Notifier};
use crate::permission::{NotificationPermission, PermissionProvider};
use crate::protocol::{ClientMessage, ServerMessage};

#[derive(Debug, Error)]
pub enum ArmError {
    #[error("scheduler is not reachable; start it with `alarmclock serve` and retry")]
    SchedulerUnavailable,
    #[error("notification permission was not granted; alarm not set")]
    PermissionDenied,
    #[error("alarm time {0} has no upcoming occurrence in the local time zone")]
    Unresolvable(AlarmTime),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Local ringing effects of a foreground context.
pub struct LocalAlerts {
    pub notifier: Arc<dyn Notifier>,
    pub player: Box<dyn AlertPlayer>,
    pub notification: Notification,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DisplayState {
    pub clock: String,
    pub status: Option<String>,
    pub countdown: Option<String>,
    pub ringing: bool,
}

impl fmt::Display for DisplayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.clock)?;
        if let Some(status) = &self.status {
            write!(f, "  {status}")?;
        }
        if let Some(countdown) = &self.countdown {
            write!(f, "  (in {countdown})")?;
        }
        if self.ringing {
            write!(f, "  RINGING - press Enter to stop")?;
        }
        Ok(())
    }
}

/// User-facing side of the alarm: picks the instant, asks for permission and
/// drives the scheduler through its link.
pub struct AlarmController<L> {
    link: Option<L>,
    permissions: Box<dyn PermissionProvider>,
    alerts: LocalAlerts,
    alarm_time: Option<AlarmTime>,
    target_timestamp_ms: Option<i64>,
    ringing: bool,
}

impl<L: SchedulerLink> AlarmController<L> {
    pub fn new(
        link: Option<L>,
        permissions: Box<dyn PermissionProvider>,
        alerts: LocalAlerts,
    ) -> Self {
        Self {
            link,
            permissions,
            alerts,
            alarm_time: None,
            target_timestamp_ms: None,
            ringing: false,
        }
    }

    pub fn link(&self) -> Option<&L> {
        self.link.as_ref()
    }

    pub fn is_armed(&self) -> bool {
        self.target_timestamp_ms.is_some()
    }

    pub fn is_ringing(&self) -> bool {
        self.ringing
    }

    pub fn target_timestamp_ms(&self) -> Option<i64> {
        self.target_timestamp_ms
    }

    pub fn arm_alarm(&mut self, time: AlarmTime) -> Result<DateTime<Local>, ArmError> {
        self.arm_alarm_with_clock(time, Local::now)
    }

    pub fn arm_alarm_at<Tz>(
        &mut self,
        time: AlarmTime,
        now: &DateTime<Tz>,
    ) -> Result<DateTime<Tz>, ArmError>
    where
        Tz: TimeZone,
        Tz::Offset: Copy,
    {
        self.arm_alarm_with_clock(time, || now.clone())
    }

    /// Hands the next occurrence of `time` to the scheduler. Nothing is sent
    /// unless a link exists and notifications are granted. The clock is read
    /// after the permission prompt, which may block for a long time.
    pub fn arm_alarm_with_clock<Tz, C>(
        &mut self,
        time: AlarmTime,
        clock: C,
    ) -> Result<DateTime<Tz>, ArmError>
    where
        Tz: TimeZone,
        Tz::Offset: Copy,
        C: Fn() -> DateTime<Tz>,
    {
        if self.link.is_none() {
            return Err(ArmError::SchedulerUnavailable);
        }

        let permission = match self.permissions.current() {
            NotificationPermission::Granted => NotificationPermission::Granted,
            _ => self.permissions.request()?,
        };
        if permission != NotificationPermission::Granted {
            return Err(ArmError::PermissionDenied);
        }

        let now = clock();
        let target = next_alarm_in_tz(time, &now, &now.timezone())
            .ok_or(ArmError::Unresolvable(time))?;
        let timestamp = target.timestamp_millis();
        let Some(link) = self.link.as_ref() else {
            return Err(ArmError::SchedulerUnavailable);
        };
        link.post(&ClientMessage::SetAlarm {
            timestamp: Some(timestamp),
        })?;

        self.stop_ringing();
        self.alarm_time = Some(time);
        self.target_timestamp_ms = Some(timestamp);
        info!(alarm = %time, timestamp, "alarm armed");
        Ok(target)
    }

    /// Clears the alarm everywhere. Local state is reset even when the
    /// scheduler cannot be reached.
    pub fn cancel_alarm(&mut self) -> Result<()> {
        self.stop_ringing();
        self.alarm_time = None;
        self.target_timestamp_ms = None;

        let Some(link) = self.link.as_ref() else {
            return Err(ArmError::SchedulerUnavailable.into());
        };
        link.post(&ClientMessage::ClearAlarm)?;
        info!("alarm cleared");
        Ok(())
    }

    pub fn handle_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::AlarmTriggered { timestamp } => self.on_alarm_triggered(timestamp),
        }
    }

    pub fn on_alarm_triggered(&mut self, timestamp: Option<i64>) {
        info!(?timestamp, "alarm triggered");
        self.ringing = true;

        if self.permissions.current() == NotificationPermission::Granted {
            if let Err(err) = self.alerts.notifier.show(&self.alerts.notification) {
                warn!("local alarm notification failed: {err:#}");
            }
        } else {
            debug!("notification permission not granted; skipping local notification");
        }

        if let Err(err) = self.alerts.player.start() {
            warn!("alert sound unavailable: {err:#}");
        }
    }

    pub fn display<Tz>(&self, now: &DateTime<Tz>, mode: TimeDisplayMode) -> DisplayState
    where
        Tz: TimeZone,
        Tz::Offset: fmt::Display,
    {
        let countdown = match (self.target_timestamp_ms, self.ringing) {
            (Some(target), false) => Some(format_countdown(chrono::Duration::milliseconds(
                target.saturating_sub(now.timestamp_millis()),
            ))),
            _ => None,
        };
        DisplayState {
            clock: format_clock(now, mode),
            status: self.alarm_time.map(|time| format!("Alarm set for {time}")),
            countdown,
            ringing: self.ringing,
        }
    }

    fn stop_ringing(&mut self) {
        self.ringing = false;
        self.alerts.player.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chrono_tz::America::New_York;

    use super::*;
    use crate::permission::FixedPermission;

    #[derive(Default)]
    struct RecordingLink {
        sent: Mutex<Vec<ClientMessage>>,
    }

    impl RecordingLink {
        fn sent(&self) -> Vec<ClientMessage> {
            self.sent.lock().expect("lock").clone()
        }
    }

    impl SchedulerLink for RecordingLink {
        fn post(&self, message: &ClientMessage) -> Result<()> {
            self.sent.lock().expect("lock").push(*message);
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        shown: Mutex<Vec<Notification>>,
    }

    impl Notifier for RecordingNotifier {
        fn show(&self, notification: &Notification) -> Result<()> {
            self.shown.lock().expect("lock").push(notification.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct PlayerLog {
        starts: usize,
        stops: usize,
        playing: bool,
    }

    struct FakePlayer(Arc<Mutex<PlayerLog>>);

    impl AlertPlayer for FakePlayer {
        fn start(&mut self) -> Result<()> {
            let mut log = self.0.lock().expect("lock");
            log.starts += 1;
            log.playing = true;
            Ok(())
        }

        fn stop(&mut self) {
            let mut log = self.0.lock().expect("lock");
            log.stops += 1;
            log.playing = false;
        }

        fn is_playing(&self) -> bool {
            self.0.lock().expect("lock").playing
        }
    }

    struct Fixture {
        controller: AlarmController<RecordingLink>,
        notifier: Arc<RecordingNotifier>,
        player: Arc<Mutex<PlayerLog>>,
    }

    fn fixture(link: Option<RecordingLink>, permission: NotificationPermission) -> Fixture {
        let notifier = Arc::new(RecordingNotifier::default());
        let player = Arc::new(Mutex::new(PlayerLog::default()));
        let controller = AlarmController::new(
            link,
            Box::new(FixedPermission(permission)),
            LocalAlerts {
                notifier: notifier.clone(),
                player: Box::new(FakePlayer(Arc::clone(&player))),
                notification: Notification::default(),
            },
        );
        Fixture {
            controller,
            notifier,
            player,
        }
    }

    fn ny(day: u32, hour: u32, minute: u32) -> DateTime<chrono_tz::Tz> {
        New_York
            .with_ymd_and_hms(2026, 6, day, hour, minute, 0)
            .single()
            .expect("valid local time")
    }

    #[test]
    fn arming_later_today_sends_same_day_timestamp() {
        let mut fx = fixture(Some(RecordingLink::default()), NotificationPermission::Granted);
        let time = AlarmTime::new(23, 59).expect("valid");

        let target = fx
            .controller
            .arm_alarm_at(time, &ny(10, 23, 58))
            .expect("armed");

        assert_eq!(target, ny(10, 23, 59));
        let link = fx.controller.link().expect("link");
        assert_eq!(
            link.sent(),
            vec![ClientMessage::SetAlarm {
                timestamp: Some(ny(10, 23, 59).timestamp_millis())
            }]
        );
        assert!(fx.controller.is_armed());
    }

    #[test]
    fn arming_earlier_time_targets_tomorrow() {
        let mut fx = fixture(Some(RecordingLink::default()), NotificationPermission::Granted);
        let time = AlarmTime::new(8, 0).expect("valid");

        let target = fx
            .controller
            .arm_alarm_at(time, &ny(10, 9, 0))
            .expect("armed");

        assert_eq!(target, ny(11, 8, 0));
        assert_eq!(
            fx.controller.target_timestamp_ms(),
            Some(ny(11, 8, 0).timestamp_millis())
        );
    }

    /// Answers "granted" only after the shared clock has moved on.
    struct SlowPrompt {
        clock: Arc<Mutex<DateTime<chrono_tz::Tz>>>,
        answer_after: chrono::Duration,
        state: NotificationPermission,
    }

    impl PermissionProvider for SlowPrompt {
        fn current(&self) -> NotificationPermission {
            self.state
        }

        fn request(&mut self) -> Result<NotificationPermission> {
            let mut now = self.clock.lock().expect("lock");
            *now += self.answer_after;
            self.state = NotificationPermission::Granted;
            Ok(self.state)
        }
    }

    #[test]
    fn slow_permission_answer_never_sends_past_timestamp() {
        let clock = Arc::new(Mutex::new(
            New_York
                .with_ymd_and_hms(2026, 6, 10, 6, 59, 30)
                .single()
                .expect("valid local time"),
        ));
        let player = Arc::new(Mutex::new(PlayerLog::default()));
        let mut controller = AlarmController::new(
            Some(RecordingLink::default()),
            Box::new(SlowPrompt {
                clock: Arc::clone(&clock),
                answer_after: chrono::Duration::seconds(40),
                state: NotificationPermission::Default,
            }),
            LocalAlerts {
                notifier: Arc::new(RecordingNotifier::default()),
                player: Box::new(FakePlayer(player)),
                notification: Notification::default(),
            },
        );
        let time = AlarmTime::new(7, 0).expect("valid");

        let target = controller
            .arm_alarm_with_clock(time, || *clock.lock().expect("lock"))
            .expect("armed");

        let answered_at = *clock.lock().expect("lock");
        assert!(target > answered_at);
        assert_eq!(target, ny(11, 7, 0));
        assert_eq!(
            controller.link().expect("link").sent(),
            vec![ClientMessage::SetAlarm {
                timestamp: Some(ny(11, 7, 0).timestamp_millis())
            }]
        );
    }

    #[test]
    fn arming_without_scheduler_fails_and_sends_nothing() {
        let mut fx = fixture(None, NotificationPermission::Granted);
        let time = AlarmTime::new(7, 30).expect("valid");

        let err = fx
            .controller
            .arm_alarm_at(time, &ny(10, 6, 0))
            .expect_err("no scheduler");

        assert!(matches!(err, ArmError::SchedulerUnavailable));
        assert!(!fx.controller.is_armed());
    }

    #[test]
    fn denied_or_undecided_permission_aborts_arming() {
        for permission in [NotificationPermission::Denied, NotificationPermission::Default] {
            let mut fx = fixture(Some(RecordingLink::default()), permission);
            let time = AlarmTime::new(7, 30).expect("valid");

            let err = fx
                .controller
                .arm_alarm_at(time, &ny(10, 6, 0))
                .expect_err("permission not granted");

            assert!(matches!(err, ArmError::PermissionDenied));
            assert!(fx.controller.link().expect("link").sent().is_empty());
            assert!(!fx.controller.is_armed());
        }
    }

    #[test]
    fn cancel_twice_sends_clear_twice_and_resets_state() {
        let mut fx = fixture(Some(RecordingLink::default()), NotificationPermission::Granted);
        let time = AlarmTime::new(7, 30).expect("valid");
        fx.controller.arm_alarm_at(time, &ny(10, 6, 0)).expect("armed");

        fx.controller.cancel_alarm().expect("first cancel");
        fx.controller.cancel_alarm().expect("second cancel");

        let sent = fx.controller.link().expect("link").sent();
        assert_eq!(&sent[1..], &[ClientMessage::ClearAlarm, ClientMessage::ClearAlarm]);
        assert!(!fx.controller.is_armed());
        assert_eq!(fx.controller.display(&ny(10, 6, 0), TimeDisplayMode::Hour24).status, None);
    }

    #[test]
    fn cancel_without_scheduler_still_resets_local_state() {
        let mut fx = fixture(None, NotificationPermission::Granted);
        fx.controller.on_alarm_triggered(None);
        assert!(fx.controller.is_ringing());

        let err = fx.controller.cancel_alarm().expect_err("no scheduler");
        assert!(err.to_string().contains("scheduler is not reachable"));
        assert!(!fx.controller.is_ringing());
        assert!(!fx.player.lock().expect("lock").playing);
    }

    #[test]
    fn trigger_rings_and_shows_tagged_notification() {
        let mut fx = fixture(Some(RecordingLink::default()), NotificationPermission::Granted);

        fx.controller.handle_message(ServerMessage::AlarmTriggered {
            timestamp: Some(1_000),
        });

        assert!(fx.controller.is_ringing());
        assert_eq!(fx.player.lock().expect("lock").starts, 1);
        let shown = fx.notifier.shown.lock().expect("lock").clone();
        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].tag, "alarm");

        fx.controller.cancel_alarm().expect("stop");
        assert!(!fx.controller.is_ringing());
        assert!(!fx.player.lock().expect("lock").playing);
    }

    #[test]
    fn trigger_without_permission_still_rings() {
        let mut fx = fixture(Some(RecordingLink::default()), NotificationPermission::Default);

        fx.controller.on_alarm_triggered(None);

        assert!(fx.controller.is_ringing());
        assert_eq!(fx.player.lock().expect("lock").starts, 1);
        assert!(fx.notifier.shown.lock().expect("lock").is_empty());
    }

    #[test]
    fn display_shows_status_and_countdown() {
        let mut fx = fixture(Some(RecordingLink::default()), NotificationPermission::Granted);
        let time = AlarmTime::new(8, 0).expect("valid");
        fx.controller.arm_alarm_at(time, &ny(10, 6, 0)).expect("armed");

        let state = fx
            .controller
            .display(&ny(10, 6, 30), TimeDisplayMode::Hour24);
        assert_eq!(state.clock, "06:30:00");
        assert_eq!(state.status.as_deref(), Some("Alarm set for 08:00"));
        assert_eq!(state.countdown.as_deref(), Some("01:30:00"));
        assert!(!state.ringing);
        assert_eq!(
            state.to_string(),
            "06:30:00  Alarm set for 08:00  (in 01:30:00)"
        );

        fx.controller.on_alarm_triggered(None);
        let ringing = fx
            .controller
            .display(&ny(10, 8, 0), TimeDisplayMode::Hour24);
        assert_eq!(ringing.countdown, None);
        assert!(ringing.ringing);
    }
}
