//! Long-lived scanner subprocesses.
//!
//! A [`Worker`] owns one scanner process bound to an egress address. Its
//! stdin is owned by a dedicated writer task fed over a channel, and its
//! stdout is drained by a reader task that forwards every line to the shared
//! response channel and stamps the worker's [`LivenessClock`].

pub mod pool;

pub use pool::{WorkerPool, STALL_THRESHOLD};

use eyre::{Result, WrapErr};
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// How long a dispatch may wait to hand a hostname to the writer task.
pub const DISPATCH_TIMEOUT: Duration = Duration::from_millis(500);

const INPUT_QUEUE_DEPTH: usize = 1024;

/// Time of the last line received from a worker.
///
/// Written by the worker's reader task, read by the dispatcher.
#[derive(Debug, Clone)]
pub struct LivenessClock(Arc<Mutex<Instant>>);

impl LivenessClock {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(Instant::now())))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Instant> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn touch(&self) {
        *self.lock() = Instant::now();
    }

    pub fn last(&self) -> Instant {
        *self.lock()
    }

    pub fn elapsed(&self) -> Duration {
        self.last().elapsed()
    }
}

impl Default for LivenessClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Program and arguments used to launch a scanner process.
#[derive(Debug, Clone)]
pub struct ScannerCommand {
    program: PathBuf,
    args: Vec<String>,
}

impl ScannerCommand {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// zgrab2 HTTPS module reading hostnames from stdin.
    pub fn zgrab2(program: impl Into<PathBuf>, senders: usize, read_limit_per_host: usize) -> Self {
        let args = vec![
            "http".to_string(),
            "--use-https".to_string(),
            "--port".to_string(),
            "443".to_string(),
            "--read-limit-per-host".to_string(),
            read_limit_per_host.to_string(),
            "--senders".to_string(),
            senders.to_string(),
            "--flush".to_string(),
        ];
        Self::new(program, args)
    }

    /// Arguments for a process bound to `identity`.
    pub fn args_for(&self, identity: Option<IpAddr>) -> Vec<String> {
        let mut args = self.args.clone();
        if let Some(ip) = identity {
            args.push("--source-ip".to_string());
            args.push(ip.to_string());
        }
        args
    }

    fn build(&self, identity: Option<IpAddr>) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.args_for(identity))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        cmd
    }
}

/// Result of handing a hostname to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Queued,
    /// The writer did not accept the hostname within [`DISPATCH_TIMEOUT`]
    TimedOut,
    /// The writer task has exited
    Closed,
}

pub struct Worker {
    identity: Option<IpAddr>,
    child: Child,
    input: mpsc::Sender<String>,
    writer: JoinHandle<()>,
    clock: LivenessClock,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("identity", &self.identity)
            .field("pid", &self.child.id())
            .field("last_response", &self.clock.last())
            .finish()
    }
}

impl Worker {
    /// Launch a scanner bound to `identity`, forwarding its output lines to
    /// `responses`.
    pub fn spawn(
        command: &ScannerCommand,
        identity: Option<IpAddr>,
        responses: mpsc::UnboundedSender<String>,
    ) -> Result<Self> {
        let mut child = command
            .build(identity)
            .spawn()
            .wrap_err_with(|| format!("Failed to spawn scanner {}", command.program.display()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| eyre::eyre!("Scanner stdin was not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| eyre::eyre!("Scanner stdout was not piped"))?;

        let pid = child.id().unwrap_or_default();
        let label = identity.map(|ip| ip.to_string()).unwrap_or_else(|| "any".to_string());
        log::info!("[worker] spawned: pid={} identity={} program={}",
            pid, label, command.program.display());

        let clock = LivenessClock::new();
        let (input, queue) = mpsc::channel(INPUT_QUEUE_DEPTH);
        let writer = tokio::spawn(write_hostnames(stdin, queue, pid));
        tokio::spawn(read_responses(stdout, responses, clock.clone(), pid));

        Ok(Self {
            identity,
            child,
            input,
            writer,
            clock,
        })
    }

    pub fn identity(&self) -> Option<IpAddr> {
        self.identity
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn clock(&self) -> &LivenessClock {
        &self.clock
    }

    pub fn is_stalled(&self, threshold: Duration) -> bool {
        self.clock.elapsed() > threshold
    }

    /// Queue `hostname` for the scanner's stdin.
    pub async fn dispatch(&self, hostname: &str) -> DispatchOutcome {
        match timeout(DISPATCH_TIMEOUT, self.input.send(hostname.to_string())).await {
            Ok(Ok(())) => DispatchOutcome::Queued,
            Ok(Err(_)) => {
                log::warn!("[worker] dispatch_closed: pid={:?} hostname={}", self.pid(), hostname);
                DispatchOutcome::Closed
            }
            Err(_) => {
                log::warn!("[worker] dispatch_timeout: pid={:?} hostname={} timeout={}ms",
                    self.pid(), hostname, DISPATCH_TIMEOUT.as_millis());
                DispatchOutcome::TimedOut
            }
        }
    }

    /// Close stdin, kill the process and wait for it to exit.
    ///
    /// Pending hostnames in the writer queue are discarded with the writer.
    pub async fn stop(&mut self) -> Result<ExitStatus> {
        let pid = self.child.id();
        self.writer.abort();
        let _ = (&mut self.writer).await;

        if let Err(e) = self.child.start_kill() {
            log::debug!("[worker] kill_skipped: pid={:?} error={}", pid, e);
        }
        let status = self
            .child
            .wait()
            .await
            .wrap_err("Failed to wait for scanner exit")?;

        log::info!("[worker] stopped: pid={:?} status={}", pid, status);
        Ok(status)
    }
}

async fn write_hostnames(mut stdin: ChildStdin, mut queue: mpsc::Receiver<String>, pid: u32) {
    while let Some(hostname) = queue.recv().await {
        let line = format!("{}\n", hostname);
        let written = match stdin.write_all(line.as_bytes()).await {
            Ok(()) => stdin.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            log::error!("[worker] write_failed: pid={} hostname={} error={}", pid, hostname, e);
            break;
        }
        log::trace!("[worker] sent: pid={} hostname={}", pid, hostname);
    }
    log::debug!("[worker] writer_exited: pid={}", pid);
}

async fn read_responses(
    stdout: ChildStdout,
    responses: mpsc::UnboundedSender<String>,
    clock: LivenessClock,
    pid: u32,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                clock.touch();
                if responses.send(line).is_err() {
                    log::debug!("[worker] response_channel_closed: pid={}", pid);
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                log::warn!("[worker] read_failed: pid={} error={}", pid, e);
                break;
            }
        }
    }
    log::debug!("[worker] reader_exited: pid={}", pid);
}
