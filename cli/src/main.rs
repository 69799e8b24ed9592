// Good defaults
#![forbid(unused_must_use)]
#![deny(unsafe_code)]

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use twoyi_core::context::{DaemonContext, Paths};
use twoyi_core::server::{self, ServerConfig};

/// Host a guest Android userspace rootfs and serve it over a TCP control
/// plane.
#[derive(Debug, Parser)]
#[command(name = "twoyi-server", version)]
struct Opt {
    /// Guest rootfs directory. Overrides the active profile's own rootfs
    /// path for this invocation.
    #[arg(long)]
    rootfs: PathBuf,

    /// Address to bind the control plane to.
    #[arg(long, default_value = "0.0.0.0:9876")]
    listen: String,

    /// Display width in pixels.
    #[arg(long, default_value_t = 720)]
    width: u32,

    /// Display height in pixels.
    #[arg(long, default_value_t = 1280)]
    height: u32,

    /// Display density in dpi.
    #[arg(long, default_value_t = 320)]
    dpi: u32,

    /// Path to the renderer loader shared object. Required if the active
    /// profile's legacy renderer path is used.
    #[arg(long)]
    loader: Option<PathBuf>,

    /// Path to the proot-style binding launcher binary. Defaults to
    /// `twoyi-launcher` resolved from `PATH`, matching the
    /// `[workspace.metadata.binary-dependencies]` convention.
    #[arg(long, default_value = "twoyi-launcher")]
    launcher: PathBuf,

    /// Archive to materialize into `--rootfs` before starting.
    #[arg(long)]
    extract_rootfs: Option<PathBuf>,

    /// Run the active profile with verbose guest logging.
    #[arg(long)]
    verbose: bool,

    /// Application data directory backing the profile store and kvstore.
    /// Defaults to `--rootfs`'s parent directory.
    #[arg(long)]
    app_data: Option<PathBuf>,
}

fn initialize_tracing() {
    let format = tracing_subscriber::fmt::format()
        .without_time()
        .with_target(false)
        .compact();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .event_format(format)
        .with_writer(std::io::stderr)
        .with_max_level(tracing::Level::INFO)
        .init();
}

fn run() -> Result<()> {
    initialize_tracing();
    let opt = Opt::parse();
    tracing::debug!(?opt, "starting");

    let app_data = opt
        .app_data
        .clone()
        .or_else(|| opt.rootfs.parent().map(PathBuf::from))
        .context("--rootfs has no parent directory to derive --app-data from")?;
    let loader = opt.loader.clone().unwrap_or_default();
    let paths = Paths::under(app_data, loader, opt.launcher.clone());
    let ctx = Arc::new(DaemonContext::new(paths));

    {
        let mut profiles = ctx.profiles.lock().unwrap();
        let mut active = profiles.active();
        active.rootfs_path = opt.rootfs.to_string_lossy().into_owned();
        if opt.verbose {
            active.verbose_debug = true;
        }
        profiles.update(&ctx.kv, active);
    }

    if let Some(archive) = &opt.extract_rootfs {
        twoyi_core::rootfs::install(
            &opt.rootfs,
            archive,
            archive,
            twoyi_core::rootfs::is_initialized(&opt.rootfs),
            false,
            true,
            false,
        )
        .context("extracting rootfs")?;
    }

    let config = ServerConfig {
        listen_addr: opt.listen,
        width: opt.width,
        height: opt.height,
        dpi: opt.dpi,
        launcher_path: opt.launcher,
        loader_path: opt.loader.unwrap_or_default(),
    };
    server::run(ctx, config).context("running control plane")
}

fn main() {
    if let Err(e) = run() {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
