use portable_pty::{native_pty_system, CommandBuilder, PtyPair, PtySize};
use std::io::Read;
use thiserror::Error;

use crate::command::{CommandError, Shell};
use crate::connection::XFER_CHUNK_SIZE;

/// Environment variable carrying the shell's verbosity to the command.
pub const VERBOSITY_ENV: &str = "TELEMETRY_VERBOSITY";

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("failed to open pty: {0}")]
    OpenPty(#[source] anyhow::Error),

    #[error("failed to spawn command: {0}")]
    SpawnCommand(#[source] anyhow::Error),

    #[error("failed to clone reader: {0}")]
    CloneReader(#[source] anyhow::Error),

    #[error("failed to wait for child: {0}")]
    Wait(#[from] std::io::Error),
}

/// Executes a command, writing its output to a [`Shell`].
///
/// Runs on a blocking worker thread. Implementations must stop producing
/// output once a write to the shell fails.
pub trait CommandRunner: Send + Sync {
    fn run(&self, command: &str, shell: &mut dyn Shell) -> Result<(), CommandError>;
}

impl<F> CommandRunner for F
where
    F: Fn(&str, &mut dyn Shell) -> Result<(), CommandError> + Send + Sync,
{
    fn run(&self, command: &str, shell: &mut dyn Shell) -> Result<(), CommandError> {
        self(command, shell)
    }
}

/// Runs commands through `<shell> -c` inside a PTY.
pub struct PtyRunner {
    shell: String,
    rows: u16,
    cols: u16,
}

impl PtyRunner {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            rows: 24,
            cols: 120,
        }
    }
}

impl Default for PtyRunner {
    fn default() -> Self {
        // Use $SHELL or fall back to /bin/sh
        Self::new(std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string()))
    }
}

impl CommandRunner for PtyRunner {
    fn run(&self, command: &str, shell: &mut dyn Shell) -> Result<(), CommandError> {
        let size = PtySize {
            rows: self.rows,
            cols: self.cols,
            pixel_width: 0,
            pixel_height: 0,
        };
        let PtyPair { master, slave } = native_pty_system()
            .openpty(size)
            .map_err(PtyError::OpenPty)?;

        let mut cmd = CommandBuilder::new(&self.shell);
        cmd.arg("-c");
        cmd.arg(command);
        cmd.env("TERM", "dumb");
        cmd.env(VERBOSITY_ENV, shell.verbosity().to_string());

        let mut child = slave.spawn_command(cmd).map_err(PtyError::SpawnCommand)?;
        // Our copy of the slave must go, or the reader never sees EOF.
        drop(slave);

        let mut reader = master.try_clone_reader().map_err(PtyError::CloneReader)?;
        let mut buf = [0u8; XFER_CHUNK_SIZE];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if shell.write(&buf[..n]).is_err() {
                        tracing::debug!(command, "output sink closed, killing command");
                        let _ = child.kill();
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                // EIO once the child side has closed.
                Err(_) => break,
            }
        }

        let status = child.wait().map_err(PtyError::Wait)?;
        if !status.success() {
            tracing::debug!(command, exit_code = status.exit_code(), "command exited with failure");
        }
        Ok(())
    }
}
