//! Process launcher — builds and spawns an isolated subprocess from a
//! [`ServerSpec`](crate::config::ServerSpec).
//!
//! Image-based specs run under `docker run -i --rm` with each environment
//! variable forwarded via `-e KEY=VALUE`; executable specs are spawned
//! directly with the environment applied to the child. In both cases the
//! child's stdin, stdout, and stderr are piped so the caller owns the
//! streams. The launcher never retries — retry policy belongs to the caller.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

use crate::config::ServerSpec;
use crate::error::GatewayError;

/// Handle for a launched subprocess.
///
/// The pool entry that owns this handle is the only entity allowed to
/// terminate the process. `kill_on_drop` is set as a backstop so a dropped
/// handle cannot leak a container.
pub struct ProcessHandle {
    child: Child,
}

impl ProcessHandle {
    /// Take ownership of the child's stdin pipe. Returns `None` if already taken.
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.child.stdin.take()
    }

    /// Take ownership of the child's stdout pipe. Returns `None` if already taken.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    /// Take ownership of the child's stderr pipe. Returns `None` if already taken.
    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// OS process id, if the process is still running.
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Terminate the process: graceful signal first, forced kill after
    /// `grace` elapses without exit. Best-effort — errors are swallowed
    /// because the entry is removed regardless of exit outcome.
    pub async fn terminate(&mut self, grace: Duration) {
        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            // SAFETY: sending SIGTERM to our own child; a stale pid at worst
            // returns ESRCH, which the forced kill below covers.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
            if tokio::time::timeout(grace, self.child.wait()).await.is_ok() {
                return;
            }
        }
        #[cfg(not(unix))]
        let _ = grace;
        let _ = self.child.kill().await;
    }

    /// Wait for the process to exit.
    pub async fn wait(&mut self) -> std::io::Result<std::process::ExitStatus> {
        self.child.wait().await
    }
}

/// Build the concrete invocation for a launch spec.
fn build_command(spec: &ServerSpec) -> Option<Command> {
    let mut cmd = if let Some(image) = &spec.image {
        let mut cmd = Command::new("docker");
        cmd.args(["run", "-i", "--rm"]);
        for (key, value) in &spec.environment {
            cmd.arg("-e");
            cmd.arg(format!("{}={}", key, value));
        }
        cmd.arg(image);
        cmd.args(&spec.command);
        cmd
    } else {
        let executable = spec.executable.as_ref()?;
        let mut cmd = Command::new(executable);
        cmd.args(&spec.command);
        cmd.envs(&spec.environment);
        cmd
    };

    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);
    Some(cmd)
}

/// Spawn the subprocess described by `spec`.
///
/// Fails with [`GatewayError::Launch`] if the image/executable cannot be
/// found or the OS refuses to spawn. Not retried here.
pub fn launch(id: &str, spec: &ServerSpec) -> crate::Result<ProcessHandle> {
    let mut cmd = build_command(spec).ok_or_else(|| {
        GatewayError::InvalidConfig(
            id.to_string(),
            "server requires either 'image' or 'executable'".to_string(),
        )
    })?;

    tracing::info!(
        server = %id,
        command = ?cmd.as_std().get_program(),
        "launching server process"
    );

    let child = cmd
        .spawn()
        .map_err(|e| GatewayError::Launch(id.to_string(), e.to_string()))?;

    Ok(ProcessHandle { child })
}

/// Drain the child's stderr in a background task.
///
/// Each line is logged at debug level so the pipe can never fill up and
/// block the child. The task exits when the stream closes.
pub fn spawn_stderr_drain(id: String, stderr: ChildStderr) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(server = %id, line = %line, "server stderr");
        }
    });
}
