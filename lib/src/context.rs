//! Daemon-scoped shared state (§9's redesign of the source's global
//! singletons: one context value, built once and handed out by `Arc`,
//! instead of process-wide statics for the profile store, container
//! handle, and listener list).

use crate::kvstore::KvStore;
use crate::profile::ProfileStore;
use crate::supervisor::Supervisor;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Paths the daemon needs, all relative to a single application-data root.
#[derive(Debug, Clone)]
pub struct Paths {
    /// The application's private data directory.
    pub app_data: PathBuf,
    /// Path to the staged bundled ROM archive.
    pub bundled_rom: PathBuf,
    /// Path to the staged third-party ROM archive.
    pub third_party_rom: PathBuf,
    /// Path to the renderer loader shared object.
    pub loader: PathBuf,
    /// Path to the proot-style binding launcher binary.
    pub launcher: PathBuf,
}

impl Paths {
    /// Derive the standard layout under `app_data`.
    pub fn under(app_data: impl Into<PathBuf>, loader: impl Into<PathBuf>, launcher: impl Into<PathBuf>) -> Self {
        let app_data = app_data.into();
        Self {
            bundled_rom: app_data.join("files/rootfs.tar.gz"),
            third_party_rom: app_data.join("files/rootfs_3rd.tar.gz"),
            loader: loader.into(),
            launcher: launcher.into(),
            app_data,
        }
    }

    /// The Unix socket the guest signals boot completion on.
    pub fn boot_socket(&self) -> PathBuf {
        self.app_data.join("socket/boot-done")
    }
}

/// The single piece of shared, explicitly-passed daemon state.
#[derive(Debug)]
pub struct DaemonContext {
    /// Durable configuration (C1).
    pub kv: KvStore,
    /// Profile lifecycle (C4); single-writer via this mutex.
    pub profiles: Mutex<ProfileStore>,
    /// The (at most one) running container (C7).
    pub supervisor: Supervisor,
    /// Filesystem layout for this installation.
    pub paths: Paths,
}

impl DaemonContext {
    /// Build a context rooted at `paths`, loading (or seeding) the
    /// profile store from a kvstore file under `paths.app_data`.
    pub fn new(paths: Paths) -> Self {
        let kv = KvStore::open(kv_path(&paths.app_data));
        let profiles = Mutex::new(ProfileStore::load(&kv));
        Self {
            kv,
            profiles,
            supervisor: Supervisor::default(),
            paths,
        }
    }

    /// The rootfs directory for the currently active profile.
    pub fn active_rootfs_dir(&self) -> PathBuf {
        let profile = self.profiles.lock().unwrap().active();
        ProfileStore::rootfs_dir(&profile, &self.paths.app_data)
    }
}

fn kv_path(app_data: &Path) -> PathBuf {
    app_data.join("twoyi-daemon.json")
}
