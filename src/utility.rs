#![forbid(unsafe_code)]

//! Runs the extraction utility as a child process.
//!
//! Arguments are always passed as a vector; nothing is ever interpolated into
//! a shell string. On Unix the child leads its own process group, and the
//! whole group is killed if the deadline passes or the calling future is
//! dropped: the onefile yt-dlp builds fork a Python child that a plain kill of
//! the direct child would orphan.

use std::{path::Path, process::Stdio, time::Duration};

#[cfg(unix)]
use nix::{
    errno::Errno,
    sys::signal::{Signal, killpg},
    unistd::Pid,
};
use tokio::process::Command;
use tracing::{debug, warn};

const STDERR_LOG_LIMIT: usize = 2048;

#[derive(Debug)]
pub struct UtilityOutput {
    pub success: bool,
    pub exit: String,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, thiserror::Error)]
pub enum UtilityError {
    #[error("failed to launch {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },
    #[error("waiting for {binary} failed: {source}")]
    Wait {
        binary: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{binary} timed out after {limit:?}")]
    TimedOut { binary: String, limit: Duration },
}

pub async fn run_utility(
    binary: &Path,
    args: &[String],
    limit: Duration,
) -> Result<UtilityOutput, UtilityError> {
    let label = binary.display().to_string();
    debug!(binary = %label, ?args, "spawning utility");

    let mut command = Command::new(binary);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);
    let child = command.spawn().map_err(|source| UtilityError::Spawn {
        binary: label.clone(),
        source,
    })?;
    #[cfg(unix)]
    let mut group = ProcessGroup::led_by(child.id());

    // Dropping the wait future on timeout drops the child, which kills it;
    // `group` takes the grandchildren with it.
    let output = match tokio::time::timeout(limit, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            #[cfg(unix)]
            group.disarm();
            output
        }
        Ok(Err(source)) => {
            return Err(UtilityError::Wait {
                binary: label,
                source,
            });
        }
        Err(_) => {
            warn!(binary = %label, ?limit, "utility timed out, killed");
            return Err(UtilityError::TimedOut {
                binary: label,
                limit,
            });
        }
    };

    let result = UtilityOutput {
        success: output.status.success(),
        exit: output.status.to_string(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    };
    debug!(binary = %label, exit = %result.exit, "utility finished");
    Ok(result)
}

/// SIGKILLs the child's process group when dropped, unless disarmed after a
/// normal exit.
#[cfg(unix)]
struct ProcessGroup {
    leader: Option<Pid>,
}

#[cfg(unix)]
impl ProcessGroup {
    fn led_by(pid: Option<u32>) -> Self {
        Self {
            leader: pid
                .and_then(|pid| i32::try_from(pid).ok())
                .map(Pid::from_raw),
        }
    }

    fn disarm(&mut self) {
        self.leader = None;
    }
}

#[cfg(unix)]
impl Drop for ProcessGroup {
    fn drop(&mut self) {
        let Some(leader) = self.leader.take() else {
            return;
        };
        match killpg(leader, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(err) => warn!(pgid = leader.as_raw(), error = %err, "killing utility process group failed"),
        }
    }
}

/// Logs stderr for operators, cut to a bounded size.
pub fn log_stderr(context: &str, stderr: &str) {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        return;
    }
    warn!(context, stderr = truncate(trimmed, STDERR_LOG_LIMIT), "utility stderr");
}

fn truncate(value: &str, limit: usize) -> &str {
    if value.len() <= limit {
        return value;
    }
    let mut end = limit;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}
