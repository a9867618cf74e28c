//! Process launchers for agent sessions.
//!
//! Two implementations sit behind the [`Launcher`] trait: the native PTY
//! launcher used in production, and a pipe-based launcher for tests and
//! sandboxes without a PTY device. Both hand back a [`LaunchedProcess`] whose
//! read side carries merged child output and whose write side carries
//! operator input.

use std::io::Read;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::mpsc;

use portable_pty::CommandBuilder;
use portable_pty::PtySize;
use portable_pty::native_pty_system;
use thiserror::Error;

use crate::codex::Invocation;

/// Environment toggle that forces the pipe launcher.
pub const PIPE_LAUNCHER_ENV: &str = "OBI_PIPE_LAUNCHER";

#[cfg(target_os = "linux")]
const PTY_MULTIPLEXER: &str = "/dev/ptmx";

const READ_BUF_SIZE: usize = 8192;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("interactive mode requires a Unix-style PTY; this host is not supported")]
    UnsupportedHost,
    #[error("interactive mode requires {path} (PTY unavailable)")]
    PtyUnavailable { path: PathBuf },
    #[error("check {path}: {source}")]
    DeviceCheck {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("start agent PTY: {pty_error}")]
    CreateSession {
        #[source]
        pty_error: anyhow::Error,
    },
    #[error("spawn agent process: {source}")]
    Spawn {
        #[source]
        source: std::io::Error,
    },
}

impl LaunchError {
    fn create_session(pty_error: anyhow::Error) -> Self {
        Self::CreateSession { pty_error }
    }
}

/// A spawned agent process decomposed into the handles the session runner
/// needs. The waiter keeps the PTY master alive until the child exits.
pub struct LaunchedProcess {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
    pub waiter: Box<dyn FnOnce() -> std::io::Result<i32> + Send>,
    pub interrupter: Box<dyn Fn() -> std::io::Result<()> + Send + Sync>,
    pub killer: Box<dyn Fn() -> std::io::Result<()> + Send + Sync>,
}

impl std::fmt::Debug for LaunchedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaunchedProcess").finish_non_exhaustive()
    }
}

/// Spawns the agent attached to a terminal-shaped byte channel.
pub trait Launcher: Send + Sync {
    fn launch(
        &self,
        invocation: &Invocation,
        dir: Option<&Path>,
        env: &[(String, String)],
    ) -> Result<LaunchedProcess, LaunchError>;
}

/// Returns the launcher selected by the environment.
pub fn default_launcher() -> Arc<dyn Launcher> {
    if pipe_launcher_enabled() {
        Arc::new(PipeLauncher)
    } else {
        Arc::new(NativePtyLauncher)
    }
}

pub fn pipe_launcher_enabled() -> bool {
    std::env::var(PIPE_LAUNCHER_ENV).is_ok_and(|v| v == "1")
}

/// Verifies the host can allocate a PTY before any process is spawned.
pub fn preflight() -> Result<(), LaunchError> {
    if pipe_launcher_enabled() {
        return Ok(());
    }
    if !cfg!(unix) {
        return Err(LaunchError::UnsupportedHost);
    }
    #[cfg(target_os = "linux")]
    require_device(Path::new(PTY_MULTIPLEXER))?;
    Ok(())
}

#[cfg(target_os = "linux")]
fn require_device(path: &Path) -> Result<(), LaunchError> {
    match std::fs::metadata(path) {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            Err(LaunchError::PtyUnavailable {
                path: path.to_path_buf(),
            })
        }
        Err(err) => Err(LaunchError::DeviceCheck {
            path: path.to_path_buf(),
            source: err,
        }),
    }
}

/// Production launcher: allocates a PTY pair and attaches the agent to the
/// slave side, handing the master back as the byte channel.
pub struct NativePtyLauncher;

impl Launcher for NativePtyLauncher {
    fn launch(
        &self,
        invocation: &Invocation,
        dir: Option<&Path>,
        env: &[(String, String)],
    ) -> Result<LaunchedProcess, LaunchError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(LaunchError::create_session)?;

        let mut command = CommandBuilder::new(&invocation.binary);
        command.args(&invocation.args);
        if let Some(dir) = dir {
            command.cwd(dir);
        }
        for (key, value) in env {
            command.env(key, value);
        }

        let mut child = pair
            .slave
            .spawn_command(command)
            .map_err(LaunchError::create_session)?;
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(LaunchError::create_session)?;
        let writer = pair
            .master
            .take_writer()
            .map_err(LaunchError::create_session)?;

        let pid = child.process_id();
        let killer = Mutex::new(child.clone_killer());

        // The master must outlive the child or reads return EOF early; the
        // waiter owns it for exactly that window.
        let master = pair.master;
        let waiter = Box::new(move || {
            let status = child.wait();
            drop(master);
            status.map(|s| s.exit_code() as i32)
        });

        let interrupter: Box<dyn Fn() -> std::io::Result<()> + Send + Sync> = match pid {
            Some(pid) => Box::new(move || signal_pid(pid as i32, libc::SIGINT)),
            None => Box::new(|| {
                Err(std::io::Error::other("agent pid unavailable for interrupt"))
            }),
        };

        let killer: Box<dyn Fn() -> std::io::Result<()> + Send + Sync> = Box::new(move || {
            let mut guard = killer
                .lock()
                .map_err(|_| std::io::Error::other("killer poisoned"))?;
            guard.kill()
        });

        Ok(LaunchedProcess {
            reader,
            writer,
            waiter,
            interrupter,
            killer,
        })
    }
}

/// Test/sandbox launcher: plain pipes with stdout and stderr merged in
/// arrival order onto a single read side.
pub struct PipeLauncher;

impl Launcher for PipeLauncher {
    fn launch(
        &self,
        invocation: &Invocation,
        dir: Option<&Path>,
        env: &[(String, String)],
    ) -> Result<LaunchedProcess, LaunchError> {
        let mut command = std::process::Command::new(&invocation.binary);
        command
            .args(&invocation.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = dir {
            command.current_dir(dir);
        }
        for (key, value) in env {
            command.env(key, value);
        }

        let mut child = command
            .spawn()
            .map_err(|source| LaunchError::Spawn { source })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| LaunchError::Spawn {
                source: std::io::Error::other("child stdin unavailable"),
            })?;
        let stdout = child.stdout.take().ok_or_else(|| LaunchError::Spawn {
            source: std::io::Error::other("child stdout unavailable"),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| LaunchError::Spawn {
            source: std::io::Error::other("child stderr unavailable"),
        })?;

        let (tx, rx) = mpsc::channel::<Vec<u8>>();
        spawn_pump(Box::new(stdout), tx.clone());
        spawn_pump(Box::new(stderr), tx);

        let pid = child.id() as i32;
        let waiter = Box::new(move || {
            child
                .wait()
                .map(|status| status.code().unwrap_or(-1))
        });

        Ok(LaunchedProcess {
            reader: Box::new(ChannelReader::new(rx)),
            writer: Box::new(stdin),
            waiter,
            interrupter: Box::new(move || signal_pid(pid, libc::SIGINT)),
            killer: Box::new(move || signal_pid(pid, libc::SIGKILL)),
        })
    }
}

fn spawn_pump(mut source: Box<dyn Read + Send>, tx: mpsc::Sender<Vec<u8>>) {
    std::thread::spawn(move || {
        let mut buf = [0u8; READ_BUF_SIZE];
        loop {
            match source.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    });
}

fn signal_pid(pid: i32, signal: libc::c_int) -> std::io::Result<()> {
    // Safe: plain kill(2) on a pid we spawned.
    let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Read adapter over the merged stdout/stderr chunk channel. EOF once both
/// pump threads hang up.
struct ChannelReader {
    rx: mpsc::Receiver<Vec<u8>>,
    pending: Vec<u8>,
    offset: usize,
}

impl ChannelReader {
    fn new(rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            rx,
            pending: Vec::new(),
            offset: 0,
        }
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.offset >= self.pending.len() {
            match self.rx.recv() {
                Ok(chunk) => {
                    self.pending = chunk;
                    self.offset = 0;
                }
                Err(_) => return Ok(0),
            }
        }
        let available = &self.pending[self.offset..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.offset += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh_invocation(script: &str) -> Invocation {
        Invocation {
            binary: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
        }
    }

    #[test]
    fn pipe_launcher_merges_stdout_and_stderr() {
        let process = PipeLauncher
            .launch(&sh_invocation("echo out; echo err 1>&2"), None, &[])
            .expect("launch");
        let LaunchedProcess {
            mut reader, waiter, ..
        } = process;
        let code = waiter().expect("wait");
        assert_eq!(code, 0);
        let mut output = String::new();
        reader.read_to_string(&mut output).expect("read");
        assert!(output.contains("out"));
        assert!(output.contains("err"));
    }

    #[test]
    fn pipe_launcher_reports_exit_code() {
        let process = PipeLauncher
            .launch(&sh_invocation("exit 7"), None, &[])
            .expect("launch");
        assert_eq!((process.waiter)().expect("wait"), 7);
    }

    #[test]
    fn pipe_launcher_forwards_stdin() {
        let process = PipeLauncher
            .launch(&sh_invocation("read line; echo got:$line"), None, &[])
            .expect("launch");
        let LaunchedProcess {
            mut reader,
            mut writer,
            waiter,
            ..
        } = process;
        writer.write_all(b"hello\n").expect("write");
        writer.flush().expect("flush");
        drop(writer);
        waiter().expect("wait");
        let mut output = String::new();
        reader.read_to_string(&mut output).expect("read");
        assert!(output.contains("got:hello"));
    }

    #[test]
    fn pipe_launcher_env_reaches_child() {
        let process = PipeLauncher
            .launch(
                &sh_invocation("echo var=$OBI_TEST_VAR"),
                None,
                &[("OBI_TEST_VAR".to_string(), "present".to_string())],
            )
            .expect("launch");
        let LaunchedProcess {
            mut reader, waiter, ..
        } = process;
        waiter().expect("wait");
        let mut output = String::new();
        reader.read_to_string(&mut output).expect("read");
        assert!(output.contains("var=present"));
    }
}
