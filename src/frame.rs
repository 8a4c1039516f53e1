//! Frame ingest: parse frame descriptors, derive data size, and hand raw
//! bytes to the streaming texture (spec §4.4 — C4).

use crate::error::{VmError, VmResult};
use crate::queue::Message;
use bytemuck::{Pod, Zeroable};
use std::sync::atomic::{AtomicU64, Ordering};

/// Pixel formats the core understands (spec §4.5 pixel format table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Bgra,
    Rgba,
    Rgba10,
    Yuv420,
}

impl FrameType {
    fn from_wire(code: u32) -> VmResult<Self> {
        match code {
            0 => Ok(FrameType::Bgra),
            1 => Ok(FrameType::Rgba),
            2 => Ok(FrameType::Rgba10),
            3 => Ok(FrameType::Yuv420),
            other => Err(VmError::UnsupportedFrameType(other)),
        }
    }
}

/// On-wire frame descriptor, at the front of a frame queue message's
/// payload (spec §3 "Frame descriptor").
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct FrameDescriptorWire {
    pub frame_type: u32,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub pitch: u32,
    /// Byte offset of the [`FrameBuffer`] relative to the start of this
    /// message's payload (spec §4.4: "Locate FrameBuffer at frame_ptr +
    /// frame.offset").
    pub offset: u64,
}

/// A parsed frame descriptor plus the source size it carries.
#[derive(Debug, Clone, Copy)]
pub struct FrameDescriptor {
    pub frame_type: FrameType,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub pitch: u32,
}

impl FrameDescriptor {
    /// `dataSize` derivation (spec §4.4 step 1): 32bpp formats are
    /// `height * pitch`; YUV420 is `height * width * 3/2` (the plane-sum
    /// formulation in the original client reduces to this).
    pub fn data_size(&self) -> u64 {
        match self.frame_type {
            FrameType::Bgra | FrameType::Rgba | FrameType::Rgba10 => {
                self.height as u64 * self.pitch as u64
            }
            FrameType::Yuv420 => self.height as u64 * self.width as u64 * 3 / 2,
        }
    }
}

/// A `FrameBuffer`: a host-written progress counter followed by pixel
/// bytes (spec §3, §4.4 "progress-aware reader"). The counter lets the
/// consumer start copying rows before the producer has finished writing
/// the whole frame.
pub struct FrameBuffer<'a> {
    bytes: &'a [u8],
}

impl<'a> FrameBuffer<'a> {
    const COUNTER_LEN: usize = std::mem::size_of::<u64>();

    pub fn from_bytes(bytes: &'a [u8]) -> VmResult<Self> {
        if bytes.len() < Self::COUNTER_LEN {
            return Err(VmError::Corrupt("frame buffer shorter than progress counter"));
        }
        Ok(Self { bytes })
    }

    fn written_atomic(&self) -> &AtomicU64 {
        let ptr = self.bytes.as_ptr() as *mut u64;
        // SAFETY: length checked in `from_bytes`; the host writes this
        // counter with release semantics as it fills `data()`, 8-byte
        // alignment of the payload is guaranteed by the region layout.
        unsafe { AtomicU64::from_ptr(ptr) }
    }

    /// Pixel bytes following the progress counter.
    pub fn data(&self) -> &'a [u8] {
        &self.bytes[Self::COUNTER_LEN..]
    }
}

/// Progress-aware row copy (spec §4.4, §8 property 7): for each
/// destination row, spins until the producer has written at least that
/// row's worth of bytes, then copies it. Trades latency for a shorter
/// critical window versus waiting for the whole frame.
pub fn framebuffer_read(fb: &FrameBuffer<'_>, dst: &mut [u8], row_stride: usize, rows: usize) {
    let src = fb.data();
    for row in 0..rows {
        let required = (row as u64 + 1) * row_stride as u64;
        while fb.written_atomic().load(Ordering::Acquire) < required {
            std::hint::spin_loop();
        }
        let start = row * row_stride;
        let end = start + row_stride;
        dst[start..end].copy_from_slice(&src[start..end]);
    }
}

/// Tracks the current source size across frame messages so callers can
/// detect a geometry change (spec §4.4 step 2).
pub struct FrameIngest {
    current_size: Option<(u32, u32)>,
}

impl Default for FrameIngest {
    fn default() -> Self {
        Self { current_size: None }
    }
}

/// Result of parsing one frame message: the descriptor, whether the
/// source size changed since the previous frame, and a view of the raw
/// `FrameBuffer` ready for [`framebuffer_read`] or a direct `memcpy`.
pub struct IngestedFrame<'a> {
    pub descriptor: FrameDescriptor,
    pub geometry_changed: bool,
    pub buffer: FrameBuffer<'a>,
}

impl FrameIngest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a frame queue message (spec §4.4). Does not call
    /// `message_done` — the caller does that after handing the frame to
    /// the streaming texture, per the queue-subscriber discipline.
    pub fn ingest<'a>(&mut self, msg: &Message<'a>) -> VmResult<IngestedFrame<'a>> {
        let header_len = std::mem::size_of::<FrameDescriptorWire>();
        let wire = msg
            .payload
            .get(0..header_len)
            .ok_or(VmError::Corrupt("frame message shorter than descriptor"))?;
        let wire: &FrameDescriptorWire = bytemuck::from_bytes(wire);

        let frame_type = FrameType::from_wire(wire.frame_type)?;
        let descriptor = FrameDescriptor {
            frame_type,
            width: wire.width,
            height: wire.height,
            stride: wire.stride,
            pitch: wire.pitch,
        };

        let geometry_changed = self.current_size != Some((wire.width, wire.height));
        if geometry_changed {
            self.current_size = Some((wire.width, wire.height));
        }

        let fb_bytes = msg
            .payload
            .get(wire.offset as usize..)
            .ok_or(VmError::Corrupt("frame buffer offset out of bounds"))?;
        let buffer = FrameBuffer::from_bytes(fb_bytes)?;

        Ok(IngestedFrame {
            descriptor,
            geometry_changed,
            buffer,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_frame_message(frame_type: u32, width: u32, height: u32, pitch: u32, rows_data: &[u8]) -> Vec<u8> {
        let header_len = std::mem::size_of::<FrameDescriptorWire>();
        let wire = FrameDescriptorWire {
            frame_type,
            width,
            height,
            stride: pitch,
            pitch,
            offset: header_len as u64,
        };
        let mut bytes = bytemuck::bytes_of(&wire).to_vec();
        bytes.extend_from_slice(&0u64.to_ne_bytes()); // progress counter, starts at 0
        bytes.extend_from_slice(rows_data);
        bytes
    }

    #[test]
    fn data_size_for_32bpp_is_height_times_pitch() {
        let descriptor = FrameDescriptor {
            frame_type: FrameType::Bgra,
            width: 1920,
            height: 1080,
            stride: 7680,
            pitch: 7680,
        };
        assert_eq!(descriptor.data_size(), 1080 * 7680);
    }

    #[test]
    fn data_size_for_yuv420_matches_plane_sum() {
        let descriptor = FrameDescriptor {
            frame_type: FrameType::Yuv420,
            width: 640,
            height: 480,
            stride: 640,
            pitch: 640,
        };
        assert_eq!(descriptor.data_size(), 460_800);
    }

    #[test]
    fn unknown_frame_type_is_unsupported() {
        let err = FrameType::from_wire(99).unwrap_err();
        assert!(matches!(err, VmError::UnsupportedFrameType(99)));
    }

    #[test]
    fn ingest_reports_geometry_change_only_on_first_and_resize() {
        let mut ingest = FrameIngest::new();
        let bytes_a = build_frame_message(0, 4, 2, 4, &[0u8; 8]);
        let msg = Message {
            seq: 1,
            udata: 0,
            payload: &bytes_a,
        };
        let frame = ingest.ingest(&msg).unwrap();
        assert!(frame.geometry_changed);

        let bytes_b = build_frame_message(0, 4, 2, 4, &[0u8; 8]);
        let msg = Message {
            seq: 2,
            udata: 0,
            payload: &bytes_b,
        };
        let frame = ingest.ingest(&msg).unwrap();
        assert!(!frame.geometry_changed);
    }

    #[test]
    fn framebuffer_read_waits_for_each_rows_progress() {
        let row_stride = 4usize;
        let rows = 3usize;
        let mut data = Vec::new();
        data.extend_from_slice(&(rows as u64 * row_stride as u64).to_ne_bytes());
        for r in 0..rows {
            data.extend_from_slice(&[r as u8; 4]);
        }
        let fb = FrameBuffer::from_bytes(&data).unwrap();
        let mut dst = vec![0u8; rows * row_stride];
        framebuffer_read(&fb, &mut dst, row_stride, rows);
        for r in 0..rows {
            assert_eq!(&dst[r * row_stride..(r + 1) * row_stride], &[r as u8; 4]);
        }
    }
}
