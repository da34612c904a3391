use std::io::{BufRead, Write};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Local;
use crossbeam_channel::{Receiver, select, tick, unbounded};
use tracing::{debug, warn};

use crate::alarm::model::TimeDisplayMode;
use crate::controller::AlarmController;
use crate::link::{HttpSchedulerLink, SchedulerLink};

#[derive(Debug, Clone, Eq, PartialEq)]
enum Input {
    Line(String),
    Closed,
}

fn spawn_stdin_reader() -> Result<Receiver<Input>> {
    let (tx, rx) = unbounded();
    thread::Builder::new()
        .name("stdin-reader".to_string())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else {
                    break;
                };
                if tx.send(Input::Line(line)).is_err() {
                    return;
                }
            }
            let _ = tx.send(Input::Closed);
        })
        .context("failed to spawn stdin reader")?;
    Ok(rx)
}

/// Runs a live foreground context until the user quits: refreshes the clock
/// line, drains the mailbox and stops a ringing alarm on Enter.
pub fn run_watch(
    controller: &mut AlarmController<HttpSchedulerLink>,
    poll_interval: Duration,
    mode: TimeDisplayMode,
) -> Result<()> {
    let input = spawn_stdin_reader()?;
    let mut input_open = true;
    let ticker = tick(poll_interval);
    let mut stdout = std::io::stdout();

    if let Some(link) = controller.link() {
        debug!(client_id = %link.identity().client_id, "watching for alarms");
    }
    eprintln!("Press Enter to stop a ringing alarm, q + Enter to quit.");

    let mut running = true;
    while running {
        let input_rx = if input_open {
            input.clone()
        } else {
            crossbeam_channel::never()
        };
        select! {
            recv(ticker) -> _ => {
                poll_mailbox(controller);
                let line = controller.display(&Local::now(), mode);
                write!(stdout, "\r\x1b[2K{line}").context("failed to write status line")?;
                stdout.flush().context("failed to flush status line")?;
            }
            recv(input_rx) -> event => match event {
                Ok(Input::Line(line)) => running = !handle_line(controller, line.trim()),
                Ok(Input::Closed) | Err(_) => input_open = false,
            },
        }
    }

    writeln!(stdout).context("failed to write newline")?;
    if let Some(link) = controller.link()
        && let Err(err) = link.disconnect()
    {
        debug!("disconnect on exit failed: {err:#}");
    }
    Ok(())
}

fn poll_mailbox(controller: &mut AlarmController<HttpSchedulerLink>) {
    let messages = match controller.link().map(HttpSchedulerLink::poll_messages) {
        Some(Ok(messages)) => messages,
        Some(Err(err)) => {
            warn!("mailbox poll failed: {err:#}");
            return;
        }
        None => return,
    };
    for message in messages {
        controller.handle_message(message);
    }
}

/// Returns true when the watch session should end. Enter only stops an alarm
/// that is ringing; an armed alarm is cleared with `alarmclock cancel`.
fn handle_line<L: SchedulerLink>(controller: &mut AlarmController<L>, line: &str) -> bool {
    match line {
        "q" | "quit" => true,
        "" if controller.is_ringing() => {
            if let Err(err) = controller.cancel_alarm() {
                warn!("failed to stop alarm: {err:#}");
            }
            false
        }
        _ => false,
    }
}
