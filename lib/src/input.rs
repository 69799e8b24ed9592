//! Translate touch/key events into guest input-device writes (C9).

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

const O_NONBLOCK: i32 = 0o4000;

// Linux input-event constants (see <linux/input-event-codes.h>).
const EV_KEY: u16 = 0x01;
const EV_ABS: u16 = 0x03;
const EV_SYN: u16 = 0x00;
const SYN_REPORT: u16 = 0x00;
const ABS_MT_SLOT: u16 = 0x2f;
const ABS_MT_TRACKING_ID: u16 = 0x39;
const ABS_MT_POSITION_X: u16 = 0x35;
const ABS_MT_POSITION_Y: u16 = 0x36;
const ABS_MT_PRESSURE: u16 = 0x3a;

/// The maximum number of simultaneous touch slots the guest's multitouch
/// device exposes.
const MAX_SLOTS: usize = 10;

/// A touch action, already normalized to the guest's event-device coding.
/// Wire-encoded as the bare integer `0|1|2|3`, matching the data model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum TouchAction {
    /// A new pointer made contact.
    Down = 0,
    /// A pointer was lifted.
    Up = 1,
    /// An active pointer moved.
    Move = 2,
    /// The gesture was cancelled, or one of several pointers was lifted.
    Cancel = 3,
}

impl TryFrom<u8> for TouchAction {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(TouchAction::Down),
            1 => Ok(TouchAction::Up),
            2 => Ok(TouchAction::Move),
            3 => Ok(TouchAction::Cancel),
            other => Err(format!("invalid touch action code: {other}")),
        }
    }
}

impl From<TouchAction> for u8 {
    fn from(action: TouchAction) -> Self {
        action as u8
    }
}

/// One touch sample.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TouchEvent {
    /// The normalized action.
    pub action: TouchAction,
    /// Stable id for this contact across its DOWN..UP lifetime.
    pub pointer_id: u32,
    /// X in the server's declared resolution.
    pub x: i32,
    /// Y in the server's declared resolution.
    pub y: i32,
    /// Contact pressure, `0.0..=1.0`.
    pub pressure: f32,
}

/// One key sample.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyEvent {
    /// The Linux keycode.
    pub keycode: u16,
    /// Whether this is a press (`true`) or release (`false`).
    pub pressed: bool,
}

fn write_event(path: &Path, type_: u16, code: u16, value: i32) {
    let file = OpenOptions::new().write(true).custom_flags(O_NONBLOCK).open(path);
    let mut file = match file {
        Ok(f) => f,
        Err(e) => {
            tracing::debug!("input device {path:?} unavailable: {e}");
            return;
        }
    };

    let (tv_sec, tv_usec) = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| (d.as_secs() as i64, d.subsec_micros() as i64))
        .unwrap_or((0, 0));

    let mut buf = Vec::with_capacity(24);
    buf.extend_from_slice(&tv_sec.to_ne_bytes());
    buf.extend_from_slice(&tv_usec.to_ne_bytes());
    buf.extend_from_slice(&type_.to_ne_bytes());
    buf.extend_from_slice(&code.to_ne_bytes());
    buf.extend_from_slice(&value.to_ne_bytes());

    // Non-blocking: a busy device drops the event. The client resends
    // state, so this is acceptable (see the design doc's input error
    // policy).
    if let Err(e) = file.write_all(&buf) {
        if e.kind() != std::io::ErrorKind::WouldBlock {
            tracing::debug!("dropped input write to {path:?}: {e}");
        }
    }
}

/// Routes host touch/key events to the guest's `/dev/input` device nodes.
#[derive(Debug)]
pub struct InputRouter {
    touch_device: PathBuf,
    key_device: PathBuf,
    slots: Mutex<HashMap<u32, u8>>,
}

impl InputRouter {
    /// Build a router targeting the touch/key device nodes under
    /// `<rootfs>/dev/input`.
    pub fn new(rootfs_dir: &Path, touch_device: &str, key_device: &str) -> Self {
        Self {
            touch_device: rootfs_dir.join("dev/input").join(touch_device),
            key_device: rootfs_dir.join("dev/input").join(key_device),
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot_for(&self, pointer_id: u32, allocate: bool) -> Option<u8> {
        let mut slots = self.slots.lock().unwrap();
        if let Some(&slot) = slots.get(&pointer_id) {
            return Some(slot);
        }
        if !allocate {
            return None;
        }
        if slots.len() >= MAX_SLOTS {
            tracing::debug!("dropping touch event: all {MAX_SLOTS} slots in use");
            return None;
        }
        let used: std::collections::HashSet<u8> = slots.values().copied().collect();
        let slot = (0..MAX_SLOTS as u8).find(|s| !used.contains(s))?;
        slots.insert(pointer_id, slot);
        Some(slot)
    }

    fn release_slot(&self, pointer_id: u32) {
        self.slots.lock().unwrap().remove(&pointer_id);
    }

    /// Write a full multitouch sequence for one sample: slot, tracking id
    /// (on DOWN), position, pressure, then `SYN_REPORT`.
    pub fn send_touch(&self, event: TouchEvent) {
        let allocate = event.action == TouchAction::Down;
        let Some(slot) = self.slot_for(event.pointer_id, allocate) else {
            return;
        };

        write_event(&self.touch_device, EV_ABS, ABS_MT_SLOT, slot as i32);
        if event.action == TouchAction::Down {
            write_event(
                &self.touch_device,
                EV_ABS,
                ABS_MT_TRACKING_ID,
                event.pointer_id as i32,
            );
        }
        if matches!(event.action, TouchAction::Up | TouchAction::Cancel) {
            write_event(&self.touch_device, EV_ABS, ABS_MT_TRACKING_ID, -1);
            self.release_slot(event.pointer_id);
        } else {
            write_event(&self.touch_device, EV_ABS, ABS_MT_POSITION_X, event.x);
            write_event(&self.touch_device, EV_ABS, ABS_MT_POSITION_Y, event.y);
            write_event(
                &self.touch_device,
                EV_ABS,
                ABS_MT_PRESSURE,
                (event.pressure.clamp(0.0, 1.0) * 255.0) as i32,
            );
        }
        write_event(&self.touch_device, EV_SYN, SYN_REPORT, 0);
    }

    /// Write a key press/release followed by `SYN_REPORT`.
    pub fn send_key(&self, event: KeyEvent) {
        let value = if event.pressed { 1 } else { 0 };
        write_event(&self.key_device, EV_KEY, event.keycode, value);
        write_event(&self.key_device, EV_SYN, SYN_REPORT, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_allocation_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let router = InputRouter::new(dir.path(), "touch", "keys");
        for i in 0..MAX_SLOTS as u32 {
            assert!(router.slot_for(i, true).is_some());
        }
        assert!(router.slot_for(MAX_SLOTS as u32, true).is_none());
    }

    #[test]
    fn slot_is_released_on_up() {
        let dir = tempfile::tempdir().unwrap();
        let router = InputRouter::new(dir.path(), "touch", "keys");
        let slot = router.slot_for(1, true).unwrap();
        router.release_slot(1);
        assert_eq!(router.slot_for(2, true), Some(slot));
    }

    #[test]
    fn missing_device_does_not_panic() {
        let dir = tempfile::tempdir().unwrap();
        let router = InputRouter::new(dir.path(), "touch", "keys");
        router.send_touch(TouchEvent {
            action: TouchAction::Down,
            pointer_id: 0,
            x: 10,
            y: 20,
            pressure: 1.0,
        });
        router.send_key(KeyEvent { keycode: 1, pressed: true });
    }
}
