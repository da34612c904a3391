mod alarm;
mod api;
mod audio;
mod config;
mod controller;
mod link;
mod notification;
mod permission;
mod protocol;
mod terminal;

use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::alarm::model::AlarmTime;
use crate::alarm::scheduler::{SchedulerService, notification_clicked};
use crate::api::{ApiServer, ApiServerConfig, ApiSharedState, SharedClientRegistry};
use crate::audio::SinkPlayer;
use crate::config::{AppConfig, load_app_config};
use crate::controller::{AlarmController, ArmError, LocalAlerts};
use crate::link::{ClientIdentity, HttpSchedulerLink};
use crate::notification::DesktopNotifier;
use crate::permission::{
    FixedPermission, NotificationPermission, PermissionProvider, PromptPermission,
};

const APP_NAME: &str = "alarmclock";
const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:8099";

#[derive(Parser, Debug)]
#[command(
    name = "alarmclock",
    version,
    about = "Alarm clock with a background scheduler and terminal controllers"
)]
struct Cli {
    #[arg(long, global = true, default_value = "alarmclock.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the background scheduler and its local HTTP channel.
    Serve {
        #[arg(long, default_value = "0.0.0.0")]
        bind: String,

        #[arg(long, default_value_t = 8099)]
        port: u16,
    },
    /// Set the alarm for the next occurrence of HH:MM.
    Arm {
        time: String,

        #[command(flatten)]
        server: ServerArgs,

        /// Grant notification permission without prompting.
        #[arg(long)]
        yes: bool,

        /// Stay open as a live context after arming.
        #[arg(long)]
        watch: bool,
    },
    /// Clear the alarm.
    Cancel {
        #[command(flatten)]
        server: ServerArgs,
    },
    /// Show the clock and ring when the alarm fires.
    Watch {
        #[command(flatten)]
        server: ServerArgs,

        #[arg(long)]
        yes: bool,
    },
    /// Print the scheduler state as JSON.
    State {
        #[command(flatten)]
        server: ServerArgs,
    },
}

#[derive(Args, Debug)]
struct ServerArgs {
    #[arg(long = "server", default_value = DEFAULT_SERVER_URL)]
    url: String,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = load_app_config(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;

    match cli.command {
        Command::Serve { bind, port } => serve(&config, bind, port),
        Command::Arm {
            time,
            server,
            yes,
            watch,
        } => {
            let time = time.parse::<AlarmTime>()?;
            let mut controller = build_controller(&server.url, yes, &config);
            let target = controller.arm_alarm(time)?;
            println!(
                "Alarm set for {time} ({})",
                target.format("%Y-%m-%d %H:%M %Z")
            );
            if watch {
                terminal::run_watch(
                    &mut controller,
                    Duration::from_millis(config.poll_interval_ms),
                    config.time_display,
                )?;
            }
            Ok(())
        }
        Command::Cancel { server } => {
            let mut controller = build_controller(&server.url, false, &config);
            controller.cancel_alarm()?;
            println!("Alarm cleared");
            Ok(())
        }
        Command::Watch { server, yes } => {
            let mut controller = build_controller(&server.url, yes, &config);
            if controller.link().is_none() {
                return Err(ArmError::SchedulerUnavailable.into());
            }
            terminal::run_watch(
                &mut controller,
                Duration::from_millis(config.poll_interval_ms),
                config.time_display,
            )
        }
        Command::State { server } => {
            let link = HttpSchedulerLink::connect(&server.url, ClientIdentity::detect())?;
            let state = link.state()?;
            println!("{}", serde_json::to_string_pretty(&state)?);
            Ok(())
        }
    }
}

fn serve(config: &AppConfig, bind: String, port: u16) -> Result<()> {
    let state = Arc::new(Mutex::new(ApiSharedState::default()));
    let registry = Arc::new(SharedClientRegistry::new(
        Arc::clone(&state),
        config.client_ttl_ms,
    ));
    let click_registry = Arc::clone(&registry);
    let notifier = Arc::new(DesktopNotifier::new(APP_NAME).with_click_handler(Arc::new(
        move || {
            notification_clicked(click_registry.as_ref());
        },
    )));
    let scheduler = SchedulerService::spawn(registry, notifier, config.notification.clone())?;

    let api_server = ApiServer::start(
        ApiServerConfig {
            bind_addr: bind.clone(),
            port,
            client_ttl_ms: config.client_ttl_ms,
        },
        state,
        scheduler.handle(),
    )
    .with_context(|| format!("failed to start local API at {bind}:{port}"))?;
    info!(port = api_server.port(), "scheduler ready");

    api_server.wait();
    drop(scheduler);
    Ok(())
}

fn build_controller(
    server_url: &str,
    yes: bool,
    config: &AppConfig,
) -> AlarmController<HttpSchedulerLink> {
    let link = match HttpSchedulerLink::connect(server_url, ClientIdentity::detect()) {
        Ok(link) => Some(link),
        Err(err) => {
            warn!("{err:#}");
            None
        }
    };
    let permissions: Box<dyn PermissionProvider> = if yes {
        Box::new(FixedPermission(NotificationPermission::Granted))
    } else {
        Box::new(PromptPermission::new(|| io::stdin().lock(), io::stdout()))
    };
    let alerts = LocalAlerts {
        notifier: Arc::new(DesktopNotifier::new(APP_NAME)),
        player: Box::new(SinkPlayer::new(config.alert_sound.clone())),
        notification: config.notification.clone(),
    };
    AlarmController::new(link, permissions, alerts)
}
