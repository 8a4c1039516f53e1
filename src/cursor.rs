//! Cursor ingest: parse pointer-queue messages into position/shape updates
//! (spec §3 "Cursor descriptor", §4.6/§9 "Cursor/frame queue decoupling").
//!
//! This mirrors [`crate::frame`]'s shape (wire struct + a thin ingest type
//! that tracks what changed across messages) but is considerably smaller:
//! there's no progress-aware reader and no GPU resource underneath it, just
//! flags/position/shape bookkeeping that the cursor thread hands off to the
//! renderer driver's `on_mouse_event`/`on_mouse_shape` hooks (spec §6).

use crate::error::{VmError, VmResult};
use crate::queue::Message;
use bytemuck::{Pod, Zeroable};

/// Bits set in a cursor message's `udata` word (spec §3 "flags
/// (visible/position/shape)").
pub mod flags {
    pub const VISIBLE: u32 = 1 << 0;
    pub const POSITION: u32 = 1 << 1;
    pub const SHAPE: u32 = 1 << 2;
}

/// Cursor shape encodings (spec §3 `type ∈ {COLOR, MONOCHROME, MASKED_COLOR}`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorType {
    Color,
    Monochrome,
    MaskedColor,
}

impl CursorType {
    fn from_wire(code: u32) -> VmResult<Self> {
        match code {
            0 => Ok(CursorType::Color),
            1 => Ok(CursorType::Monochrome),
            2 => Ok(CursorType::MaskedColor),
            other => Err(VmError::UnsupportedFrameType(other)),
        }
    }
}

/// On-wire cursor descriptor, at the front of a pointer-queue message's
/// payload. Shape bytes (if `flags::SHAPE` is set) follow immediately.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CursorDescriptorWire {
    pub x: i32,
    pub y: i32,
    pub cursor_type: u32,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
}

/// What a single cursor message asked the renderer to do, decoded from its
/// `udata` flags (spec §3, mirroring `cursorThread`'s `CURSOR_FLAG_*`
/// handling in the original client).
pub struct CursorUpdate<'a> {
    pub visible: bool,
    pub position: Option<(i32, i32)>,
    pub shape: Option<CursorShape<'a>>,
}

/// A decoded cursor shape update, ready for `on_mouse_shape`.
pub struct CursorShape<'a> {
    pub cursor_type: CursorType,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub bytes: &'a [u8],
}

/// Tracks cursor visibility/position across messages, the way
/// [`crate::frame::FrameIngest`] tracks source size.
#[derive(Default)]
pub struct CursorIngest {
    visible: bool,
    position: (i32, i32),
}

impl CursorIngest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn visible(&self) -> bool {
        self.visible
    }

    pub fn position(&self) -> (i32, i32) {
        self.position
    }

    /// Parse a pointer queue message (spec §3). Does not call
    /// `message_done` — the caller does that per the queue-subscriber
    /// discipline (spec §4.3).
    pub fn ingest<'a>(&mut self, msg: &Message<'a>) -> VmResult<CursorUpdate<'a>> {
        let header_len = std::mem::size_of::<CursorDescriptorWire>();
        let wire = msg
            .payload
            .get(0..header_len)
            .ok_or(VmError::Corrupt("cursor message shorter than descriptor"))?;
        let wire: &CursorDescriptorWire = bytemuck::from_bytes(wire);

        self.visible = msg.udata & flags::VISIBLE != 0;

        let position = if msg.udata & flags::POSITION != 0 {
            self.position = (wire.x, wire.y);
            Some(self.position)
        } else {
            None
        };

        let shape = if msg.udata & flags::SHAPE != 0 {
            let cursor_type = CursorType::from_wire(wire.cursor_type)?;
            let bytes = msg.payload.get(header_len..).unwrap_or(&[]);
            Some(CursorShape {
                cursor_type,
                width: wire.width,
                height: wire.height,
                pitch: wire.pitch,
                bytes,
            })
        } else {
            None
        };

        Ok(CursorUpdate {
            visible: self.visible,
            position,
            shape,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_cursor_message(udata: u32, x: i32, y: i32, cursor_type: u32, shape_bytes: &[u8]) -> (u32, Vec<u8>) {
        let wire = CursorDescriptorWire {
            x,
            y,
            cursor_type,
            width: 2,
            height: 2,
            pitch: 8,
        };
        let mut bytes = bytemuck::bytes_of(&wire).to_vec();
        bytes.extend_from_slice(shape_bytes);
        (udata, bytes)
    }

    #[test]
    fn position_only_message_updates_position_without_shape() {
        let mut ingest = CursorIngest::new();
        let (udata, bytes) = build_cursor_message(flags::VISIBLE | flags::POSITION, 10, 20, 0, &[]);
        let msg = Message { seq: 1, udata, payload: &bytes };
        let update = ingest.ingest(&msg).unwrap();
        assert!(update.visible);
        assert_eq!(update.position, Some((10, 20)));
        assert!(update.shape.is_none());
        assert_eq!(ingest.position(), (10, 20));
    }

    #[test]
    fn shape_message_decodes_type_and_bytes() {
        let mut ingest = CursorIngest::new();
        let shape_bytes = [1u8, 2, 3, 4];
        let (udata, bytes) = build_cursor_message(flags::SHAPE, 0, 0, 2, &shape_bytes);
        let msg = Message { seq: 1, udata, payload: &bytes };
        let update = ingest.ingest(&msg).unwrap();
        assert!(update.position.is_none());
        let shape = update.shape.unwrap();
        assert_eq!(shape.cursor_type, CursorType::MaskedColor);
        assert_eq!(shape.bytes, &shape_bytes);
    }

    #[test]
    fn invisible_without_position_or_shape_clears_visible_only() {
        let mut ingest = CursorIngest::new();
        let (udata, bytes) = build_cursor_message(0, 0, 0, 0, &[]);
        let msg = Message { seq: 1, udata, payload: &bytes };
        let update = ingest.ingest(&msg).unwrap();
        assert!(!update.visible);
        assert!(update.position.is_none());
        assert!(update.shape.is_none());
    }
}
