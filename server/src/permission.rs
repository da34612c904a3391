use std::io::{BufRead, Write};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationPermission {
    Granted,
    Denied,
    /// Not decided yet; treated as "not granted".
    Default,
}

pub trait PermissionProvider {
    fn current(&self) -> NotificationPermission;

    /// Asks for permission. A previous denial is returned without asking again.
    fn request(&mut self) -> Result<NotificationPermission>;
}

/// Answers every request with a preset decision (`--yes`, tests).
#[derive(Debug, Clone, Copy)]
pub struct FixedPermission(pub NotificationPermission);

impl PermissionProvider for FixedPermission {
    fn current(&self) -> NotificationPermission {
        self.0
    }

    fn request(&mut self) -> Result<NotificationPermission> {
        Ok(self.0)
    }
}

/// Interactive y/N prompt. Closed input leaves the permission undecided.
///
/// The input is opened only for the duration of one answer, so a shared
/// stream such as stdin stays available to other readers afterwards.
pub struct PromptPermission<F, W> {
    open_input: F,
    output: W,
    state: NotificationPermission,
}

impl<F, R, W> PromptPermission<F, W>
where
    F: FnMut() -> R,
    R: BufRead,
    W: Write,
{
    pub fn new(open_input: F, output: W) -> Self {
        Self {
            open_input,
            output,
            state: NotificationPermission::Default,
        }
    }
}

impl<F, R, W> PermissionProvider for PromptPermission<F, W>
where
    F: FnMut() -> R,
    R: BufRead,
    W: Write,
{
    fn current(&self) -> NotificationPermission {
        self.state
    }

    fn request(&mut self) -> Result<NotificationPermission> {
        if self.state != NotificationPermission::Default {
            return Ok(self.state);
        }

        write!(self.output, "Allow alarm notifications? [y/N] ")
            .context("failed to write permission prompt")?;
        self.output.flush().context("failed to flush permission prompt")?;

        let mut answer = String::new();
        let read = (self.open_input)()
            .read_line(&mut answer)
            .context("failed to read permission answer")?;
        if read == 0 {
            return Ok(NotificationPermission::Default);
        }

        self.state = match answer.trim().to_ascii_lowercase().as_str() {
            "y" | "yes" => NotificationPermission::Granted,
            _ => NotificationPermission::Denied,
        };
        Ok(self.state)
    }
}
