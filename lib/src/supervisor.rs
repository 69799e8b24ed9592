//! Spawn and monitor the guest `init` subtree under the proot-style
//! binding launcher, and expose a boot-complete signal (C7).
//!
//! The subprocess builder follows the same description/args-then-run shape
//! as `lib/src/task.rs`'s `Task`, generalized from a run-to-completion
//! helper to a long-lived child whose merged output feeds a bounded ring
//! buffer and fans out to subscribed listeners on a background thread.

use crate::error::{DaemonError, Result};
use std::collections::VecDeque;
use std::io::{BufRead, BufReader};
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Most recent log lines retained from the guest's merged stdout/stderr.
const LOG_RING_CAPACITY: usize = 500;

/// Parameters for launching the guest `init` under the binding runtime.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Path to the proot-style binding launcher binary.
    pub launcher_path: PathBuf,
    /// Guest rootfs directory.
    pub rootfs_dir: PathBuf,
    /// The bind endpoint (host:port) the guest's render server listens on.
    pub bind_addr: String,
    /// Display geometry.
    pub width: u32,
    /// Display geometry.
    pub height: u32,
    /// Path to the renderer loader shared object.
    pub loader_path: PathBuf,
    /// Whether the active profile requests verbose guest logging.
    pub verbose: bool,
    /// Unix socket path the guest signals boot completion on.
    pub boot_socket_path: PathBuf,
}

/// A bounded, lock-protected ring of the most recent log lines, with a
/// channel-based fan-out to subscribers instead of a listener-interface
/// callback: a subscriber that stops polling its receiver is simply pruned
/// on the next push, so there is no throwing-listener hazard to isolate.
#[derive(Default)]
struct LogHub {
    lines: Mutex<VecDeque<String>>,
    subscribers: Mutex<Vec<mpsc::Sender<String>>>,
}

impl LogHub {
    fn push(&self, line: String) {
        {
            let mut lines = self.lines.lock().unwrap();
            if lines.len() >= LOG_RING_CAPACITY {
                lines.pop_front();
            }
            lines.push_back(line.clone());
        }
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|tx| tx.send(line.clone()).is_ok());
    }

    fn snapshot(&self) -> Vec<String> {
        self.lines.lock().unwrap().iter().cloned().collect()
    }

    fn subscribe(&self) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }
}

/// A latch that fires once, when the guest signals boot completion by
/// connecting to a Unix socket.
struct BootLatch {
    state: Mutex<bool>,
    cv: Condvar,
}

impl BootLatch {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(false),
            cv: Condvar::new(),
        })
    }

    fn fire(&self) {
        let mut done = self.state.lock().unwrap();
        *done = true;
        self.cv.notify_all();
    }

    /// Block until the latch fires or `deadline` elapses. Returns whether
    /// it fired in time.
    fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut done = self.state.lock().unwrap();
        while !*done {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let (guard, result) = self.cv.wait_timeout(done, remaining).unwrap();
            done = guard;
            if result.timed_out() && !*done {
                return false;
            }
        }
        true
    }
}

/// The running guest `init` subtree: its subprocess, captured logs, and
/// boot-complete latch.
pub struct ContainerHandle {
    child: Child,
    logs: Arc<LogHub>,
    latch: Arc<BootLatch>,
    active_profile: (String, String),
}

impl std::fmt::Debug for ContainerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerHandle")
            .field("pid", &self.child.id())
            .finish()
    }
}

/// Diagnostic snapshot recorded when a boot fails.
#[derive(Debug, Clone)]
pub struct BootFailure {
    /// The id of the profile that was booting.
    pub profile_id: String,
    /// The name of the profile that was booting.
    pub profile_name: String,
    /// The last log lines captured before the failure was detected.
    pub last_log_lines: Vec<String>,
}

impl ContainerHandle {
    /// Spawn the launcher with the stable argument vector from the design
    /// doc, start the background log reader, and start listening for the
    /// guest's boot-complete signal.
    pub fn spawn(spec: &LaunchSpec, profile_id: &str, profile_name: &str) -> Result<Self> {
        let mut cmd = Command::new(&spec.launcher_path);
        cmd.arg(&spec.rootfs_dir)
            .arg(&spec.bind_addr)
            .arg(spec.width.to_string())
            .arg(spec.height.to_string())
            .arg(&spec.loader_path);
        if spec.verbose {
            cmd.arg("--verbose");
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        tracing::debug!("spawning launcher: {cmd:?}");
        let mut child = cmd
            .spawn()
            .map_err(|e| DaemonError::Supervisor(format!("spawning launcher: {e}")))?;

        let logs = Arc::new(LogHub::default());
        spawn_reader(child.stdout.take(), logs.clone());
        spawn_reader(child.stderr.take(), logs.clone());

        let latch = BootLatch::new();
        spawn_boot_listener(spec.boot_socket_path.clone(), latch.clone());

        Ok(Self {
            child,
            logs,
            latch,
            active_profile: (profile_id.to_string(), profile_name.to_string()),
        })
    }

    /// Block until the guest signals boot completion or `timeout` elapses.
    pub fn wait_boot(&self, timeout: Duration) -> bool {
        self.latch.wait(timeout)
    }

    /// Whether the subprocess is still alive.
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Subscribe to new merged log lines as they arrive.
    pub fn subscribe(&self) -> mpsc::Receiver<String> {
        self.logs.subscribe()
    }

    /// Snapshot of the ring buffer's current contents.
    pub fn log_snapshot(&self) -> Vec<String> {
        self.logs.snapshot()
    }

    /// Build a [`BootFailure`] diagnostic from the current state.
    pub fn boot_failure(&self) -> BootFailure {
        BootFailure {
            profile_id: self.active_profile.0.clone(),
            profile_name: self.active_profile.1.clone(),
            last_log_lines: self.logs.snapshot(),
        }
    }

    /// Terminate the subprocess and wait for it to be reaped.
    pub fn stop(mut self) -> Result<()> {
        if matches!(self.child.try_wait(), Ok(None)) {
            let pid = self.child.id();
            let _ = Command::new("kill").arg("-TERM").arg(pid.to_string()).status();
        }
        self.child
            .wait()
            .map_err(|e| DaemonError::Supervisor(format!("waiting for launcher exit: {e}")))?;
        Ok(())
    }
}

fn spawn_reader<R: std::io::Read + Send + 'static>(stream: Option<R>, logs: Arc<LogHub>) {
    let Some(stream) = stream else { return };
    std::thread::spawn(move || {
        let reader = BufReader::new(stream);
        for line in reader.lines() {
            match line {
                Ok(line) => logs.push(line),
                Err(_) => break,
            }
        }
    });
}

fn spawn_boot_listener(socket_path: PathBuf, latch: Arc<BootLatch>) {
    std::thread::spawn(move || {
        let _ = std::fs::remove_file(&socket_path);
        if let Some(parent) = socket_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let listener = match UnixListener::bind(&socket_path) {
            Ok(l) => l,
            Err(e) => {
                tracing::error!("could not bind boot-done socket {socket_path:?}: {e}");
                return;
            }
        };
        if listener.accept().is_ok() {
            latch.fire();
        }
    });
}

/// Owns the single container instance allowed per daemon.
#[derive(Default)]
pub struct Supervisor {
    handle: Mutex<Option<ContainerHandle>>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let running = self
            .handle
            .lock()
            .unwrap()
            .as_mut()
            .map(|h| h.is_running())
            .unwrap_or(false);
        f.debug_struct("Supervisor").field("running", &running).finish()
    }
}

impl Supervisor {
    /// Start the container if one is not already running. Idempotent: a
    /// second call while one is alive does not spawn a duplicate process.
    pub fn start(&self, spec: &LaunchSpec, profile_id: &str, profile_name: &str) -> Result<()> {
        let mut guard = self.handle.lock().unwrap();
        if let Some(existing) = guard.as_mut() {
            if existing.is_running() {
                return Ok(());
            }
        }
        let handle = ContainerHandle::spawn(spec, profile_id, profile_name)?;
        *guard = Some(handle);
        Ok(())
    }

    /// Block until boot completes or `timeout` elapses. Returns `false`
    /// (without blocking further) if no container is running or it exits
    /// before booting.
    pub fn wait_boot(&self, timeout: Duration) -> bool {
        let guard = self.handle.lock().unwrap();
        match guard.as_ref() {
            Some(handle) => handle.wait_boot(timeout),
            None => false,
        }
    }

    /// Whether a container is currently running.
    pub fn is_running(&self) -> bool {
        let mut guard = self.handle.lock().unwrap();
        matches!(guard.as_mut(), Some(h) if h.is_running())
    }

    /// Stop the running container, if any.
    pub fn stop(&self) -> Result<()> {
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.stop()?;
        }
        Ok(())
    }

    /// Subscribe to log lines from the running container, if any.
    pub fn subscribe(&self) -> Option<mpsc::Receiver<String>> {
        self.handle.lock().unwrap().as_ref().map(|handle| handle.subscribe())
    }

    /// Build a boot-failure diagnostic and clear the handle.
    pub fn take_boot_failure(&self) -> Option<BootFailure> {
        let handle = self.handle.lock().unwrap().take()?;
        let failure = handle.boot_failure();
        let _ = handle.stop();
        Some(failure)
    }
}
