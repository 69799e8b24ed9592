//! CRUD over named profiles; enforce invariants; select active (C4).

use crate::kvstore::KvStore;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// A guest container instance: its own rootfs, ports, and display flags.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    /// Stable opaque identifier.
    pub id: String,
    /// Human-readable, unique case-insensitively per store.
    pub name: String,
    /// Empty means "derive from id" (see [`ProfileStore::rootfs_dir`]).
    pub rootfs_path: String,
    /// The control-plane TCP port, in `[1, 65535]`.
    pub control_port: u16,
    /// The ADB endpoint, as a `host:port` string (see DESIGN.md for why
    /// this representation was chosen over a bare port number).
    pub adb_port: String,
    /// Legacy vs. server renderer mode.
    pub mode: ContainerMode,
    /// Whether the guest init should run with extra logging.
    pub verbose_debug: bool,
    /// Whether a sideloaded third-party ROM should be installed instead of
    /// the bundled one.
    pub use_third_party_rom: bool,
    /// Set to force the next `StartContainer` to reinstall the rootfs
    /// (bundled, or the third-party archive if `use_third_party_rom` is
    /// also set) regardless of `needs_upgrade`. Cleared after the install
    /// it triggers runs.
    pub force_reinstall: bool,
    /// Milliseconds since epoch at creation.
    pub created_at: i64,
    /// Milliseconds since epoch at last activation.
    pub last_used_at: i64,
}

/// The renderer/runtime mode a profile boots under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerMode {
    /// The legacy single-process renderer path.
    Legacy,
    /// The server-rendered path used by the control plane.
    Server,
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

impl Profile {
    /// Build the `default` profile created on first use.
    fn default_profile() -> Self {
        let now = now_millis();
        Self {
            id: "default".to_string(),
            name: "Default".to_string(),
            rootfs_path: String::new(),
            control_port: 9876,
            adb_port: "127.0.0.1:5555".to_string(),
            mode: ContainerMode::Server,
            verbose_debug: false,
            use_third_party_rom: false,
            force_reinstall: false,
            created_at: now,
            last_used_at: now,
        }
    }
}

/// Sanitize a profile id for use as a directory suffix: keep
/// `[A-Za-z0-9-]`, truncate to 32 characters, default to `"default"` if
/// that leaves nothing (see the REDESIGN FLAGS note on collision risk).
fn sanitize_id(id: &str) -> String {
    let cleaned: String = id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .take(32)
        .collect();
    if cleaned.is_empty() {
        "default".to_string()
    } else {
        cleaned
    }
}

/// Whether `port` (the trailing `:port` segment of a `host:port` string,
/// or a bare number) lies in `[1, 65535]`.
fn port_in_range(port: &str) -> bool {
    port.rsplit(':')
        .next()
        .and_then(|p| p.parse::<u32>().ok())
        .is_some_and(|p| (1..=65535).contains(&p))
}

/// Whether `profile` satisfies the invariants `name` non-empty and
/// `control_port`/`adb_port` in `[1, 65535]` (spec §3).
fn is_valid(profile: &Profile) -> bool {
    !profile.name.is_empty() && profile.control_port >= 1 && port_in_range(&profile.adb_port)
}

const KEY_PROFILES: &str = "profiles.json";
const KEY_ACTIVE_ID: &str = "profiles.active_id";

/// Ordered collection of [`Profile`] plus the active id.
#[derive(Debug)]
pub struct ProfileStore {
    profiles: Vec<Profile>,
    active_id: String,
}

impl ProfileStore {
    /// Load the store from `kv`. On missing or corrupt data, seed a single
    /// `default` profile and persist it (invariant 1 / scenario S1).
    pub fn load(kv: &KvStore) -> Self {
        let raw = kv.get_string(KEY_PROFILES, "");
        let profiles: Vec<Profile> = if raw.is_empty() {
            Vec::new()
        } else {
            serde_json::from_str(&raw).unwrap_or_default()
        };

        let mut store = if profiles.is_empty() {
            let default = Profile::default_profile();
            Self {
                active_id: default.id.clone(),
                profiles: vec![default],
            }
        } else {
            let active_id = kv.get_string(KEY_ACTIVE_ID, "");
            let active_id = if profiles.iter().any(|p| p.id == active_id) {
                active_id
            } else {
                profiles[0].id.clone()
            };
            Self { profiles, active_id }
        };

        store.persist(kv);
        store
    }

    fn persist(&mut self, kv: &KvStore) {
        if let Ok(json) = serde_json::to_string(&self.profiles) {
            kv.set_string(KEY_PROFILES, json);
        }
        kv.set_string(KEY_ACTIVE_ID, self.active_id.clone());
    }

    /// Snapshot of profiles in insertion order.
    pub fn all(&self) -> Vec<Profile> {
        self.profiles.clone()
    }

    /// Snapshot ordered by `last_used_at` descending.
    pub fn sorted_by_last_used(&self) -> Vec<Profile> {
        let mut all = self.profiles.clone();
        all.sort_by(|a, b| b.last_used_at.cmp(&a.last_used_at));
        all
    }

    /// O(n) lookup by id.
    pub fn by_id(&self, id: &str) -> Option<Profile> {
        self.profiles.iter().find(|p| p.id == id).cloned()
    }

    /// The active profile. Always resolves per invariant 1.
    pub fn active(&self) -> Profile {
        self.by_id(&self.active_id)
            .unwrap_or_else(|| self.profiles[0].clone())
    }

    /// Switch the active profile. No-op if `id` is unknown.
    pub fn set_active(&mut self, kv: &KvStore, id: &str) {
        if self.profiles.iter().any(|p| p.id == id) {
            self.active_id = id.to_string();
            self.persist(kv);
        }
    }

    /// Append a profile and persist. The caller must ensure id/name
    /// uniqueness (e.g. via [`Self::is_name_unique`]). No-op, logged, if
    /// `profile` violates the name/port invariants.
    pub fn add(&mut self, kv: &KvStore, profile: Profile) {
        if !is_valid(&profile) {
            tracing::warn!("refusing to add invalid profile {:?}", profile.id);
            return;
        }
        self.profiles.push(profile);
        self.persist(kv);
    }

    /// Replace a profile by id. No-op if absent, or if `profile` violates
    /// the name/port invariants.
    pub fn update(&mut self, kv: &KvStore, profile: Profile) {
        if !is_valid(&profile) {
            tracing::warn!("refusing to update profile {} with invalid fields", profile.id);
            return;
        }
        if let Some(slot) = self.profiles.iter_mut().find(|p| p.id == profile.id) {
            *slot = profile;
            self.persist(kv);
        }
    }

    /// Delete a profile. Fails (returns `false`) if this would empty the
    /// store (invariant 3); promotes the first remaining profile to active
    /// if the active one was deleted (invariant 4).
    pub fn delete(&mut self, kv: &KvStore, id: &str) -> bool {
        if self.profiles.len() <= 1 {
            return false;
        }
        let Some(pos) = self.profiles.iter().position(|p| p.id == id) else {
            return false;
        };
        self.profiles.remove(pos);
        if self.active_id == id {
            self.active_id = self.profiles[0].id.clone();
        }
        self.persist(kv);
        true
    }

    /// Deep-copy a profile with a fresh id and a `" (Copy)"`-suffixed name.
    pub fn duplicate(&mut self, kv: &KvStore, id: &str) -> Option<Profile> {
        let source = self.by_id(id)?;
        let now = now_millis();
        let mut copy = source;
        copy.id = uuid::Uuid::new_v4().to_string();
        copy.name = format!("{} (Copy)", copy.name);
        copy.created_at = now;
        copy.last_used_at = now;
        self.add(kv, copy.clone());
        Some(copy)
    }

    /// Case-insensitive name-uniqueness check, excluding `exclude_id`.
    pub fn is_name_unique(&self, name: &str, exclude_id: &str) -> bool {
        !self
            .profiles
            .iter()
            .any(|p| p.id != exclude_id && p.name.eq_ignore_ascii_case(name))
    }

    /// Append ` 1`, ` 2`, ... to `base` until the result is unique.
    pub fn generate_unique_name(&self, base: &str) -> String {
        if self.is_name_unique(base, "") {
            return base.to_string();
        }
        let mut n = 1;
        loop {
            let candidate = format!("{base} {n}");
            if self.is_name_unique(&candidate, "") {
                return candidate;
            }
            n += 1;
        }
    }

    /// Resolve the rootfs directory for `profile` under `app_data`.
    pub fn rootfs_dir(profile: &Profile, app_data: &Path) -> PathBuf {
        let explicit = &profile.rootfs_path;
        if !explicit.is_empty() && !explicit.starts_with("content://") {
            let p = Path::new(explicit);
            if p.is_absolute() {
                return p.to_path_buf();
            }
        }
        if profile.id == "default" {
            app_data.join("rootfs")
        } else {
            app_data.join(format!("rootfs_{}", sanitize_id(&profile.id)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_kv() -> (tempfile::TempDir, KvStore) {
        let dir = tempfile::tempdir().unwrap();
        let kv = KvStore::open(dir.path().join("kv.json"));
        (dir, kv)
    }

    #[test]
    fn cold_start_creates_default() {
        let (_dir, kv) = temp_kv();
        let store = ProfileStore::load(&kv);
        assert_eq!(store.all().len(), 1);
        assert_eq!(store.active().id, "default");
    }

    #[test]
    fn delete_last_is_refused() {
        let (_dir, kv) = temp_kv();
        let mut store = ProfileStore::load(&kv);
        let id = store.active().id;
        assert!(!store.delete(&kv, &id));
        assert_eq!(store.all().len(), 1);
    }

    #[test]
    fn delete_active_promotes_first_remaining() {
        let (_dir, kv) = temp_kv();
        let mut store = ProfileStore::load(&kv);
        let mut extra = Profile::default_profile();
        extra.id = "work".to_string();
        extra.name = "Work".to_string();
        store.add(&kv, extra);

        let order_before: Vec<String> = store.all().into_iter().map(|p| p.id).collect();
        store.set_active(&kv, "default");
        assert!(store.delete(&kv, "default"));
        let remaining = order_before
            .into_iter()
            .filter(|id| id != "default")
            .collect::<Vec<_>>();
        assert_eq!(store.active().id, remaining[0]);
    }

    #[test]
    fn generate_unique_name_increments() {
        let (_dir, kv) = temp_kv();
        let mut store = ProfileStore::load(&kv);
        let mut work = Profile::default_profile();
        work.id = "w1".to_string();
        work.name = "Work".to_string();
        store.add(&kv, work);
        let mut work1 = Profile::default_profile();
        work1.id = "w2".to_string();
        work1.name = "Work 1".to_string();
        store.add(&kv, work1);

        assert_eq!(store.generate_unique_name("Work"), "Work 2");
    }

    #[test]
    fn name_uniqueness_is_case_insensitive() {
        let (_dir, kv) = temp_kv();
        let store = ProfileStore::load(&kv);
        assert!(!store.is_name_unique("default", "other-id"));
        assert!(store.is_name_unique("default", "default"));
    }

    #[test]
    fn profile_round_trips_through_json() {
        let profile = Profile::default_profile();
        let json = serde_json::to_string(&profile).unwrap();
        let back: Profile = serde_json::from_str(&json).unwrap();
        similar_asserts::assert_eq!(profile, back);
    }

    #[test]
    fn rootfs_dir_resolution() {
        let app_data = Path::new("/data/app");
        let default = Profile::default_profile();
        assert_eq!(
            ProfileStore::rootfs_dir(&default, app_data),
            app_data.join("rootfs")
        );

        let mut other = Profile::default_profile();
        other.id = "abc-123".to_string();
        assert_eq!(
            ProfileStore::rootfs_dir(&other, app_data),
            app_data.join("rootfs_abc-123")
        );

        let mut explicit = Profile::default_profile();
        explicit.rootfs_path = "/custom/path".to_string();
        assert_eq!(
            ProfileStore::rootfs_dir(&explicit, app_data),
            PathBuf::from("/custom/path")
        );

        let mut content_uri = Profile::default_profile();
        content_uri.id = "xyz".to_string();
        content_uri.rootfs_path = "content://com.twoyi/rootfs".to_string();
        assert_eq!(
            ProfileStore::rootfs_dir(&content_uri, app_data),
            app_data.join("rootfs_xyz")
        );
    }

    #[test]
    fn zero_control_port_is_rejected() {
        let (_dir, kv) = temp_kv();
        let mut store = ProfileStore::load(&kv);
        let mut bad = Profile::default_profile();
        bad.id = "bad".to_string();
        bad.name = "Bad".to_string();
        bad.control_port = 0;
        store.add(&kv, bad);
        assert_eq!(store.all().len(), 1);
    }

    #[test]
    fn malformed_adb_port_is_rejected() {
        let (_dir, kv) = temp_kv();
        let mut store = ProfileStore::load(&kv);
        let mut bad = Profile::default_profile();
        bad.id = "bad".to_string();
        bad.name = "Bad".to_string();
        bad.adb_port = "not-a-port".to_string();
        store.add(&kv, bad);
        assert_eq!(store.all().len(), 1);
    }

    #[test]
    fn update_with_invalid_port_is_ignored() {
        let (_dir, kv) = temp_kv();
        let mut store = ProfileStore::load(&kv);
        let mut broken = store.active();
        broken.adb_port = "127.0.0.1:999999".to_string();
        store.update(&kv, broken);
        assert_eq!(store.active().adb_port, "127.0.0.1:5555");
    }

    #[test]
    fn corrupt_store_resets_to_default() {
        let (_dir, kv) = temp_kv();
        kv.set_string(KEY_PROFILES, "not json");
        let store = ProfileStore::load(&kv);
        assert_eq!(store.all().len(), 1);
        assert_eq!(store.active().id, "default");
    }
}
