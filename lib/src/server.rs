//! TCP control-plane: one JSON-lines session per connection, multiplexed
//! over a single shared [`DaemonContext`] (C8).
//!
//! The accept-loop/per-connection-thread shape and the success/failure
//! reply envelope follow `src/daemon/mod.rs` and `src/ipc.rs`'s
//! `DaemonToClientReply<T>`, generalized from a single bincode client to
//! many concurrent JSON-lines sessions, and from accept-once-and-exit to a
//! long-lived listener.

use crate::bootprep;
use crate::context::DaemonContext;
use crate::error::{DaemonError, Result};
use crate::input::{InputRouter, KeyEvent, TouchEvent};
use crate::profile::ContainerMode;
use crate::rootfs;
use crate::screen::{self, ScreenFrame};
use crate::supervisor::LaunchSpec;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

/// How long [`Request::StartContainer`] waits for the boot-complete signal
/// before reporting `boot_failed`.
const BOOT_TIMEOUT: Duration = Duration::from_secs(15);

/// Coarse daemon lifecycle state, reported in the connect banner and by
/// `GetStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DaemonState {
    Idle,
    Booting,
    Running,
    BootFailed,
    SetupMode,
}

impl DaemonState {
    fn as_str(self) -> &'static str {
        match self {
            DaemonState::Idle => "idle",
            DaemonState::Booting => "booting",
            DaemonState::Running => "running",
            DaemonState::BootFailed => "boot_failed",
            DaemonState::SetupMode => "setup_mode",
        }
    }
}

/// Display geometry and renderer wiring fixed for the lifetime of the
/// listener.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// `host:port` to bind.
    pub listen_addr: String,
    /// Display geometry.
    pub width: u32,
    /// Display geometry.
    pub height: u32,
    /// Display density in dpi, written into `vendor/default.prop`.
    pub dpi: u32,
    /// Path to the proot-style binding launcher binary.
    pub launcher_path: std::path::PathBuf,
    /// Path to the renderer loader shared object.
    pub loader_path: std::path::PathBuf,
}

/// Shared, lock-protected state every connection thread reads and updates.
struct ServerState {
    ctx: Arc<DaemonContext>,
    config: ServerConfig,
    state: Mutex<DaemonState>,
    /// Senders for every connection currently in screen-stream mode (C10).
    /// A frame producer (outside this crate's scope; see the renderer ABI
    /// boundary in spec.md §1) would publish by locking this and sending
    /// to each registered sender, pruning any that have disconnected.
    screen_subscribers: Mutex<Vec<mpsc::Sender<ScreenFrame>>>,
}

/// A line-delimited JSON request from a client.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum Request {
    StartContainer,
    GetStatus,
    Ping,
    TouchEvent(TouchEvent),
    KeyEvent(KeyEvent),
    /// Request that the next `StartContainer` force a rootfs reinstall
    /// (bundled, or the sideloaded third-party archive if the active
    /// profile's `use_third_party_rom` is set), regardless of whether an
    /// upgrade is otherwise needed.
    ReinstallRom,
}

/// A line-delimited JSON response to a client, matching the dispatch
/// table's documented reply shapes.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum Response {
    ContainerStarted,
    Status { container_running: bool, rootfs_path: String, width: u32, height: u32 },
    Pong,
    Ok,
    Error { message: String },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Banner {
    status: String,
    width: u32,
    height: u32,
    setup_mode: bool,
    streaming: bool,
    scrcpy_mode: bool,
}

/// Bind `config.listen_addr` and serve connections until the process exits.
/// Each connection gets its own thread; all share `ctx`.
pub fn run(ctx: Arc<DaemonContext>, config: ServerConfig) -> Result<()> {
    let listener = TcpListener::bind(&config.listen_addr).map_err(DaemonError::Transport)?;
    tracing::info!("listening on {}", config.listen_addr);

    let state = Arc::new(ServerState {
        ctx,
        config,
        state: Mutex::new(DaemonState::Idle),
        screen_subscribers: Mutex::new(Vec::new()),
    });

    for stream in listener.incoming() {
        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("accept failed: {e}");
                continue;
            }
        };
        let state = state.clone();
        std::thread::spawn(move || {
            if let Err(e) = serve_connection(&state, stream) {
                tracing::debug!("session ended: {e:#}");
            }
        });
    }
    Ok(())
}

fn serve_connection(state: &Arc<ServerState>, stream: TcpStream) -> Result<()> {
    stream.set_nodelay(true).ok();
    let peer = stream.peer_addr().ok();
    tracing::debug!("client connected: {peer:?}");

    let mut writer = stream.try_clone().map_err(DaemonError::Transport)?;
    write_line(&mut writer, &banner(state))?;

    let mut reader = BufReader::new(stream);
    let mut first_line = String::new();
    loop {
        first_line.clear();
        let read = reader.read_line(&mut first_line).map_err(DaemonError::Transport)?;
        if read == 0 {
            tracing::debug!("client disconnected: {peer:?}");
            return Ok(());
        }
        if first_line.trim().is_empty() {
            continue;
        }
        break;
    }

    if first_line.as_bytes() == screen::STREAM_HANDSHAKE {
        return serve_screen_stream(state, writer);
    }

    let response = match serde_json::from_str::<Request>(first_line.trim()) {
        Ok(request) => dispatch(state, request),
        Err(e) => Response::Error { message: format!("malformed request: {e}") },
    };
    write_line(&mut writer, &response)?;

    for line in reader.lines() {
        let line = line.map_err(DaemonError::Transport)?;
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => dispatch(state, request),
            Err(e) => Response::Error { message: format!("malformed request: {e}") },
        };
        write_line(&mut writer, &response)?;
    }
    tracing::debug!("client disconnected: {peer:?}");
    Ok(())
}

/// Upgrade this connection to the binary frame stream (C10): register a
/// sender with the shared subscriber list and relay frames until the
/// client disconnects.
fn serve_screen_stream(state: &Arc<ServerState>, writer: TcpStream) -> Result<()> {
    let (tx, rx) = mpsc::channel();
    state.screen_subscribers.lock().unwrap().push(tx);
    screen::stream_frames(writer, rx)
}

fn write_line(writer: &mut impl Write, value: &impl Serialize) -> Result<()> {
    let mut line = serde_json::to_string(value).map_err(|e| DaemonError::Protocol(e.to_string()))?;
    line.push('\n');
    writer.write_all(line.as_bytes()).map_err(DaemonError::Transport)
}

fn banner(state: &ServerState) -> Banner {
    let profile = state.ctx.profiles.lock().unwrap().active();
    let rootfs_dir = state.ctx.active_rootfs_dir();
    Banner {
        status: current_state(state).as_str().to_string(),
        width: state.config.width,
        height: state.config.height,
        setup_mode: !rootfs::is_initialized(&rootfs_dir),
        streaming: profile.mode == ContainerMode::Server,
        scrcpy_mode: profile.mode == ContainerMode::Legacy,
    }
}

fn current_state(state: &ServerState) -> DaemonState {
    let rootfs_dir = state.ctx.active_rootfs_dir();
    if !rootfs::is_initialized(&rootfs_dir) {
        return DaemonState::SetupMode;
    }
    *state.state.lock().unwrap()
}

fn dispatch(state: &Arc<ServerState>, request: Request) -> Response {
    match request {
        Request::Ping => Response::Pong,
        Request::GetStatus => status_response(state),
        Request::StartContainer => start_container(state),
        Request::TouchEvent(event) => {
            input_router(state).send_touch(event);
            Response::Ok
        }
        Request::KeyEvent(event) => {
            input_router(state).send_key(event);
            Response::Ok
        }
        Request::ReinstallRom => {
            let mut profiles = state.ctx.profiles.lock().unwrap();
            let mut active = profiles.active();
            active.force_reinstall = true;
            profiles.update(&state.ctx.kv, active);
            Response::Ok
        }
    }
}

/// Build the `GetStatus` reply per spec.md §4.8's documented shape.
fn status_response(state: &ServerState) -> Response {
    let rootfs_dir = state.ctx.active_rootfs_dir();
    Response::Status {
        container_running: state.ctx.supervisor.is_running(),
        rootfs_path: rootfs_dir.to_string_lossy().into_owned(),
        width: state.config.width,
        height: state.config.height,
    }
}

fn input_router(state: &ServerState) -> InputRouter {
    let rootfs_dir = state.ctx.active_rootfs_dir();
    InputRouter::new(&rootfs_dir, "touch_dev", "key_dev")
}

fn start_container(state: &Arc<ServerState>) -> Response {
    if state.ctx.supervisor.is_running() {
        *state.state.lock().unwrap() = DaemonState::Running;
        return Response::ContainerStarted;
    }

    *state.state.lock().unwrap() = DaemonState::Booting;

    let profile = state.ctx.profiles.lock().unwrap().active();
    let rootfs_dir = state.ctx.active_rootfs_dir();

    if let Err(e) = prepare_rootfs(state, &profile, &rootfs_dir) {
        *state.state.lock().unwrap() = DaemonState::BootFailed;
        return Response::Error { message: e.to_string() };
    }

    if let Err(e) = bootprep::ensure_boot_files(&rootfs_dir, &state.ctx.paths.app_data, &state.config.loader_path) {
        *state.state.lock().unwrap() = DaemonState::BootFailed;
        return Response::Error { message: e.to_string() };
    }

    let spec = LaunchSpec {
        launcher_path: state.config.launcher_path.clone(),
        rootfs_dir: rootfs_dir.clone(),
        bind_addr: state.config.listen_addr.clone(),
        width: state.config.width,
        height: state.config.height,
        loader_path: state.config.loader_path.clone(),
        verbose: profile.verbose_debug,
        boot_socket_path: state.ctx.paths.boot_socket(),
    };

    if let Err(e) = state.ctx.supervisor.start(&spec, &profile.id, &profile.name) {
        *state.state.lock().unwrap() = DaemonState::BootFailed;
        return Response::Error { message: e.to_string() };
    }

    if state.ctx.supervisor.wait_boot(BOOT_TIMEOUT) {
        *state.state.lock().unwrap() = DaemonState::Running;
        Response::ContainerStarted
    } else {
        let failure = state.ctx.supervisor.take_boot_failure();
        *state.state.lock().unwrap() = DaemonState::BootFailed;
        let message = failure
            .map(|f| format!("{} did not boot in time: {:?}", f.profile_name, f.last_log_lines))
            .unwrap_or_else(|| "boot timed out".to_string());
        Response::Error { message }
    }
}

fn prepare_rootfs(
    state: &ServerState,
    profile: &crate::profile::Profile,
    rootfs_dir: &std::path::Path,
) -> Result<()> {
    let current_exists = rootfs::is_initialized(rootfs_dir);
    let current_info = crate::rominfo::info_from_dir(rootfs_dir);
    let bundled_info = crate::rominfo::info_from_archive(&state.ctx.paths.bundled_rom);
    let needs_upgrade = rootfs::profile_needs_upgrade(&current_info, &bundled_info);

    rootfs::install(
        rootfs_dir,
        &state.ctx.paths.bundled_rom,
        &state.ctx.paths.third_party_rom,
        current_exists,
        needs_upgrade,
        profile.force_reinstall,
        profile.use_third_party_rom,
    )?;

    if profile.force_reinstall {
        let mut cleared = profile.clone();
        cleared.force_reinstall = false;
        state.ctx.profiles.lock().unwrap().update(&state.ctx.kv, cleared);
    }

    let props = rootfs::HostVendorProps {
        lcd_density: state.config.dpi,
        ..rootfs::HostVendorProps::default()
    };
    rootfs::init(rootfs_dir, &props)
}
