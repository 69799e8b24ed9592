//! Raw RGBA8888 frame streaming over a dedicated TCP connection (C10).
//!
//! Kept off the JSON-lines control socket entirely (see DESIGN.md's note on
//! the screen-stream open question): binary framing and line-delimited JSON
//! don't share a socket cleanly, so a client that wants frames opens a
//! second connection to the same listener and is upgraded by sending the
//! magic handshake below instead of a JSON request.

use crate::error::{DaemonError, Result};
use std::io::Write;
use std::net::TcpStream;

/// Sent by a client on a fresh connection to request the raw frame stream
/// instead of the JSON-lines protocol.
pub const STREAM_HANDSHAKE: &[u8] = b"TWOYI-SCREEN-STREAM\n";

/// The magic prefix written before every frame.
const FRAME_MAGIC: &[u8] = b"FRAME";

/// One decoded display frame, RGBA8888.
#[derive(Debug, Clone)]
pub struct ScreenFrame {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// `width * height * 4` bytes of RGBA8888 pixel data.
    pub pixels: Vec<u8>,
}

impl ScreenFrame {
    /// Write this frame's wire encoding: `"FRAME"`, little-endian
    /// `width`/`height`/`length` as `u32`, then the raw pixel bytes.
    pub fn write_to(&self, out: &mut impl Write) -> Result<()> {
        out.write_all(FRAME_MAGIC).map_err(DaemonError::Transport)?;
        out.write_all(&self.width.to_le_bytes()).map_err(DaemonError::Transport)?;
        out.write_all(&self.height.to_le_bytes()).map_err(DaemonError::Transport)?;
        out.write_all(&(self.pixels.len() as u32).to_le_bytes())
            .map_err(DaemonError::Transport)?;
        out.write_all(&self.pixels).map_err(DaemonError::Transport)
    }
}

/// Stream `frames` to `stream` until the channel closes or a write fails.
/// Intended to run on its own thread per connected screen-stream client.
pub fn stream_frames(
    mut stream: TcpStream,
    frames: std::sync::mpsc::Receiver<ScreenFrame>,
) -> Result<()> {
    stream.set_nodelay(true).ok();
    for frame in frames {
        frame.write_to(&mut stream)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_encoding_round_trips_header() {
        let frame = ScreenFrame { width: 4, height: 2, pixels: vec![0u8; 4 * 2 * 4] };
        let mut buf = Vec::new();
        frame.write_to(&mut buf).unwrap();

        assert_eq!(&buf[0..5], FRAME_MAGIC);
        assert_eq!(u32::from_le_bytes(buf[5..9].try_into().unwrap()), 4);
        assert_eq!(u32::from_le_bytes(buf[9..13].try_into().unwrap()), 2);
        assert_eq!(u32::from_le_bytes(buf[13..17].try_into().unwrap()), 32);
        assert_eq!(buf.len(), 17 + 32);
    }
}
