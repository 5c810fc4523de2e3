use std::io::{Read, Write};
use std::path::Path;
use std::sync::Mutex;

use bytes::Bytes;
use log::debug;
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tokio::sync::{broadcast, watch};

/// Errors from PTY operations.
#[derive(Debug)]
pub enum PtyError {
    SpawnFailed(String),
    IoError(std::io::Error),
    ResizeFailed(String),
    LockPoisoned,
}

impl std::fmt::Display for PtyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PtyError::SpawnFailed(msg) => write!(f, "PTY spawn failed: {msg}"),
            PtyError::IoError(err) => write!(f, "PTY I/O error: {err}"),
            PtyError::ResizeFailed(msg) => write!(f, "PTY resize failed: {msg}"),
            PtyError::LockPoisoned => write!(f, "PTY state lock poisoned"),
        }
    }
}

impl std::error::Error for PtyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PtyError::IoError(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PtyError {
    fn from(err: std::io::Error) -> Self {
        PtyError::IoError(err)
    }
}

/// Host environment variables forwarded into spawned shells. Everything
/// else is stripped so host secrets never reach a user-controlled process.
const ENV_ALLOW_LIST: &[&str] = &[
    "COLORTERM", "LANG", "LC_ALL", "PATH", "HOME", "USER", "LOGNAME",
];

/// TERM is always overridden, regardless of what the host carries.
const FORCED_TERM: &str = "xterm-256color";

/// Output chunks buffered per host before slow subscribers start lagging.
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// Owns one PTY-backed shell process: master pair, writer, killer, and the
/// I/O thread that pumps output into a broadcast channel.
///
/// Output produced while nothing is subscribed is dropped; reconnecting
/// clients get no replay, only what the process prints from then on.
pub struct ProcessHost {
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    output_tx: broadcast::Sender<Bytes>,
    exit_rx: watch::Receiver<Option<i32>>,
}

impl ProcessHost {
    /// Spawn a shell in a fresh PTY with the given dimensions.
    ///
    /// If `shell` is `None`, uses the user's default shell (`$SHELL` or
    /// `/bin/sh`). `label` names the I/O thread for diagnostics.
    pub fn spawn(
        label: &str,
        cols: u16,
        rows: u16,
        cwd: Option<&Path>,
        shell: Option<&str>,
    ) -> Result<Self, PtyError> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::SpawnFailed(format!("failed to open PTY: {e}")))?;

        let shell_path = match shell {
            Some(s) => s.to_string(),
            None => default_shell(),
        };
        let mut cmd = CommandBuilder::new(&shell_path);
        cmd.env_clear();
        for key in ENV_ALLOW_LIST {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }
        cmd.env("TERM", FORCED_TERM);
        if let Some(dir) = cwd {
            cmd.cwd(dir);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::SpawnFailed(format!("failed to spawn command: {e}")))?;

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::SpawnFailed(format!("failed to clone reader: {e}")))?;

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::SpawnFailed(format!("failed to take writer: {e}")))?;

        let killer = child.clone_killer();

        let (output_tx, _) = broadcast::channel(OUTPUT_CHANNEL_CAPACITY);
        let (exit_tx, exit_rx) = watch::channel(None);
        start_io_thread(label, reader, child, output_tx.clone(), exit_tx)?;

        Ok(Self {
            master: Mutex::new(pair.master),
            writer: Mutex::new(writer),
            killer: Mutex::new(killer),
            output_tx,
            exit_rx,
        })
    }

    /// Write input bytes to the PTY master (user input -> shell).
    pub fn write(&self, data: &[u8]) -> Result<(), PtyError> {
        let mut writer = self.writer.lock().map_err(|_| PtyError::LockPoisoned)?;
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    /// Resize the PTY to new dimensions.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        let master = self.master.lock().map_err(|_| PtyError::LockPoisoned)?;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::ResizeFailed(format!("{e}")))
    }

    /// Kill the child process. No-op if it has already exited.
    pub fn kill(&self) {
        if self.has_exited() {
            return;
        }
        if let Ok(mut killer) = self.killer.lock() {
            // An error here means the process is already gone.
            let _ = killer.kill();
        }
    }

    /// Subscribe to the process output stream.
    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.output_tx.subscribe()
    }

    /// Watch for the process exit code. Holds `None` until the child exits.
    pub fn exit_status(&self) -> watch::Receiver<Option<i32>> {
        self.exit_rx.clone()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }
}

/// Start the blocking read loop on a dedicated OS thread.
///
/// The thread owns the PTY reader and the child handle: it pumps output
/// chunks into the broadcast channel until EOF, then reaps the child and
/// publishes its exit code on the watch channel.
fn start_io_thread(
    label: &str,
    mut reader: Box<dyn Read + Send>,
    mut child: Box<dyn Child + Send + Sync>,
    output_tx: broadcast::Sender<Bytes>,
    exit_tx: watch::Sender<Option<i32>>,
) -> Result<(), PtyError> {
    std::thread::Builder::new()
        .name(format!("pty-io-{label}"))
        .spawn(move || {
            let mut buf = [0u8; 65536];
            loop {
                let n = match reader.read(&mut buf) {
                    Ok(0) => break,  // EOF — PTY closed
                    Ok(n) => n,
                    Err(_) => break, // Read error — PTY likely closed
                };
                // No receivers just means nothing is bound right now;
                // unobserved output is not replayed later.
                let _ = output_tx.send(Bytes::copy_from_slice(&buf[..n]));
            }
            let code = match child.wait() {
                Ok(status) => status.exit_code() as i32,
                Err(_) => -1,
            };
            debug!("process exited with code {code}");
            let _ = exit_tx.send(Some(code));
        })
        .map_err(|e| PtyError::SpawnFailed(format!("failed to spawn I/O thread: {e}")))?;
    Ok(())
}

/// Returns the user's default shell, falling back to `/bin/sh`.
fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}
