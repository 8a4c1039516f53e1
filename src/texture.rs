//! Triple-buffered, PBO-backed streaming GPU texture (spec §4.5 — C5, the
//! core of the core).
//!
//! Four small indices `{w, u, s, d}` are packed into one atomic word and
//! advance in ring order `d ≤ s ≤ u ≤ w (mod TEXTURE_COUNT)` with no stage
//! crossing another (spec §3, §9 "Four-index state word"). Advancement
//! uses release on publish and acquire on load so that a subsequent stage
//! observes the memory writes that preceded it.
//!
//! GL's persistent/unsynchronized/invalidate-on-map PBO plus
//! `glFenceSync`/`glClientWaitSync`/`glTexSubImage2D` are expressed here in
//! terms of `blade-graphics`'s resource model — see the mapping table in
//! `SPEC_FULL.md`. `gpu::Buffer { memory: Memory::Upload }` gives a stable
//! CPU-writable pointer for the lifetime of the buffer (the persistent
//! mapping); `context.sync_buffer` plus a transfer-pass
//! `copy_buffer_to_texture` stand in for the unmap/`glTexSubImage2D`/remap
//! sequence; `Context::submit`/`Context::wait_for` stand in for the fence.
//!
//! The GPU-handle bookkeeping (`Context`, per-slot textures/views,
//! samplers, the command encoder) is owned by the render thread and
//! guarded by a `Mutex` purely so this type can be shared with the frame
//! thread without `unsafe impl Sync`; the mutex is never contended in
//! practice since only the render thread ever calls `setup`/`process`/
//! `bind`/`free`. The four-index state word itself is the real lock-free
//! primitive (spec §9).

use crate::error::{VmError, VmResult};
use crate::frame::{FrameBuffer, FrameType};
use blade_graphics as gpu;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Number of pipeline slots (spec §3: `TEXTURE_COUNT = 3`).
pub const TEXTURE_COUNT: u32 = 3;

/// Fence wait timeout in `bind()`, recovered from the original client
/// (spec's `SPEC_FULL.md` supplement).
const FENCE_WAIT_NS: u64 = 20_000_000;

/// The four pipeline-stage indices packed into one word (spec §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct State {
    w: u8,
    u: u8,
    s: u8,
    d: u8,
}

impl State {
    fn pack(self) -> u32 {
        (self.w as u32) | (self.u as u32) << 8 | (self.s as u32) << 16 | (self.d as u32) << 24
    }

    fn unpack(word: u32) -> Self {
        Self {
            w: (word & 0xff) as u8,
            u: ((word >> 8) & 0xff) as u8,
            s: ((word >> 16) & 0xff) as u8,
            d: ((word >> 24) & 0xff) as u8,
        }
    }
}

fn advance(index: u8) -> u8 {
    ((index as u32 + 1) % TEXTURE_COUNT) as u8
}

/// Per-plane layout metadata (spec §4.5 "Plane metadata per row").
#[derive(Debug, Clone, Copy)]
pub struct PlaneLayout {
    pub cols: u32,
    pub rows: u32,
    pub row_stride_px: u32,
}

struct FormatLayout {
    plane_count: u32,
    planes: Vec<PlaneLayout>,
    offsets: Vec<u64>,
    gpu_formats: Vec<gpu::TextureFormat>,
    pbo_buffer_size: u64,
}

/// Pixel format plane table (spec §4.5). The non-streaming `GL_UNPACK_ROW_LENGTH`
/// question from §9's Open Question is resolved per the spec's own
/// recommendation: both the streaming and non-streaming paths use
/// `row_stride_px`, never the tightly-packed column count.
fn format_layout(format: FrameType, width: u32, height: u32, stride: u32) -> FormatLayout {
    match format {
        FrameType::Bgra | FrameType::Rgba | FrameType::Rgba10 => {
            let gpu_format = match format {
                FrameType::Bgra => gpu::TextureFormat::Bgra8Unorm,
                FrameType::Rgba => gpu::TextureFormat::Rgba8Unorm,
                FrameType::Rgba10 => gpu::TextureFormat::Rgb10a2Unorm,
                FrameType::Yuv420 => unreachable!(),
            };
            FormatLayout {
                plane_count: 1,
                planes: vec![PlaneLayout {
                    cols: width,
                    rows: height,
                    row_stride_px: stride,
                }],
                offsets: vec![0],
                gpu_formats: vec![gpu_format],
                pbo_buffer_size: height as u64 * stride as u64 * 4,
            }
        }
        FrameType::Yuv420 => {
            let luma_size = height as u64 * stride as u64;
            let chroma_size = luma_size / 4;
            FormatLayout {
                plane_count: 3,
                planes: vec![
                    PlaneLayout {
                        cols: width,
                        rows: height,
                        row_stride_px: stride,
                    },
                    PlaneLayout {
                        cols: width / 2,
                        rows: height / 2,
                        row_stride_px: stride / 2,
                    },
                    PlaneLayout {
                        cols: width / 2,
                        rows: height / 2,
                        row_stride_px: stride / 2,
                    },
                ],
                offsets: vec![0, luma_size, luma_size + chroma_size],
                gpu_formats: vec![gpu::TextureFormat::R8Unorm; 3],
                pbo_buffer_size: luma_size + 2 * chroma_size,
            }
        }
    }
}

struct Slot {
    buffer: gpu::Buffer,
    textures: Vec<gpu::Texture>,
    views: Vec<gpu::TextureView>,
    fence: Option<gpu::SyncPoint>,
}

struct Resources {
    context: gpu::Context,
    command_encoder: gpu::CommandEncoder,
    samplers: Vec<gpu::Sampler>,
    slots: Vec<Slot>,
}

/// Public, immutable-once-set description of how the texture is currently
/// configured, used by `update`/`update_from_frame` without touching GPU
/// handles.
struct Layout {
    format: FrameType,
    width: u32,
    height: u32,
    stride: u32,
    streaming: bool,
    planes: Vec<PlaneLayout>,
    offsets: Vec<u64>,
    pbo_buffer_size: u64,
}

pub struct StreamingTexture {
    state: AtomicU32,
    ready: AtomicBool,
    slow_warned: AtomicBool,
    layout: Mutex<Option<Layout>>,
    resources: Mutex<Option<Resources>>,
}

impl StreamingTexture {
    /// `init()` (spec §4.5): uninitialized until the first `setup`.
    pub fn init(context: gpu::Context) -> Self {
        let command_encoder = context.create_command_encoder(gpu::CommandEncoderDesc {
            name: "vmdisplay-streaming-texture",
            buffer_count: 2,
        });
        Self {
            state: AtomicU32::new(State { w: 0, u: 0, s: 0, d: 0 }.pack()),
            ready: AtomicBool::new(false),
            slow_warned: AtomicBool::new(false),
            layout: Mutex::new(None),
            resources: Mutex::new(Some(Resources {
                context,
                command_encoder,
                samplers: Vec::new(),
                slots: Vec::new(),
            })),
        }
    }

    pub fn count(&self) -> u32 {
        self.layout
            .lock()
            .unwrap()
            .as_ref()
            .map(|l| l.planes.len() as u32)
            .unwrap_or(0)
    }

    /// `setup(fmt, w, h, stride, streaming)` (spec §4.5). Idempotent for
    /// identical parameters; reallocates GL objects only when the plane
    /// count changes, otherwise reuses the existing slots. Render-thread
    /// only.
    pub fn setup(
        &self,
        format: FrameType,
        width: u32,
        height: u32,
        stride: u32,
        streaming: bool,
    ) -> VmResult<()> {
        let new = format_layout(format, width, height, stride);

        let mut layout_guard = self.layout.lock().unwrap();
        let same_params = layout_guard.as_ref().is_some_and(|l| {
            l.format == format && l.width == width && l.height == height && l.stride == stride && l.streaming == streaming
        });
        if same_params {
            return Ok(());
        }
        let old_plane_count = layout_guard.as_ref().map(|l| l.planes.len()).unwrap_or(0);

        let mut resources_guard = self.resources.lock().unwrap();
        let resources = resources_guard.as_mut().ok_or(VmError::TexMapFailed)?;

        let slot_count = if streaming { TEXTURE_COUNT } else { 1 };
        if old_plane_count != new.planes.len() as usize || resources.slots.len() != slot_count as usize {
            for slot in resources.slots.drain(..) {
                for view in slot.views {
                    resources.context.destroy_texture_view(view);
                }
                for texture in slot.textures {
                    resources.context.destroy_texture(texture);
                }
                resources.context.destroy_buffer(slot.buffer);
            }
            for sampler in resources.samplers.drain(..) {
                resources.context.destroy_sampler(sampler);
            }

            resources.samplers = (0..new.plane_count)
                .map(|p| {
                    resources.context.create_sampler(gpu::SamplerDesc {
                        name: "vmdisplay-plane-sampler",
                        mag_filter: gpu::FilterMode::Linear,
                        min_filter: gpu::FilterMode::Linear,
                        ..Default::default()
                    })
                })
                .collect();

            for _ in 0..slot_count {
                let buffer = resources.context.create_buffer(gpu::BufferDesc {
                    name: "vmdisplay-pbo",
                    size: new.pbo_buffer_size,
                    memory: gpu::Memory::Upload,
                });

                let mut textures = Vec::with_capacity(new.plane_count as usize);
                let mut views = Vec::with_capacity(new.plane_count as usize);
                for (p, plane) in new.planes.iter().enumerate() {
                    let extent = gpu::Extent {
                        width: plane.cols,
                        height: plane.rows,
                        depth: 1,
                    };
                    let texture = resources.context.create_texture(gpu::TextureDesc {
                        name: "vmdisplay-plane",
                        format: new.gpu_formats[p],
                        size: extent,
                        dimension: gpu::TextureDimension::D2,
                        array_layer_count: 1,
                        mip_level_count: 1,
                        usage: gpu::TextureUsage::RESOURCE | gpu::TextureUsage::COPY,
                        sample_count: 1,
                        external: None,
                    });
                    let view = resources.context.create_texture_view(
                        texture,
                        gpu::TextureViewDesc {
                            name: "vmdisplay-plane-view",
                            format: new.gpu_formats[p],
                            dimension: gpu::ViewDimension::D2,
                            subresources: &Default::default(),
                        },
                    );
                    textures.push(texture);
                    views.push(view);
                }

                resources.slots.push(Slot {
                    buffer,
                    textures,
                    views,
                    fence: None,
                });
            }

            // Newly created textures need their layout initialized before
            // the first `copy_buffer_to_texture` targeting them, the same
            // as the teacher's own upload example.
            resources.command_encoder.start();
            for slot in &resources.slots {
                for &texture in &slot.textures {
                    resources.command_encoder.init_texture(texture);
                }
            }
            let sync_point = resources.context.submit(&mut resources.command_encoder);
            resources.context.wait_for(&sync_point, !0);
        }

        *layout_guard = Some(Layout {
            format,
            width,
            height,
            stride,
            streaming,
            planes: new.planes,
            offsets: new.offsets,
            pbo_buffer_size: new.pbo_buffer_size,
        });

        self.state.store(State { w: 0, u: 0, s: 0, d: 0 }.pack(), Ordering::Release);
        self.ready.store(false, Ordering::Release);
        Ok(())
    }

    /// `update(buf)` — producer side (spec §4.5). Non-blocking: on
    /// overrun, emits a one-shot warning and drops, returning `Ok(())`
    /// (spec §7 `OVERRUN` policy).
    pub fn update(&self, data: &[u8]) -> VmResult<()> {
        self.write_into_next_slot(|dst, layout| {
            let len = (layout.pbo_buffer_size as usize).min(dst.len()).min(data.len());
            dst[..len].copy_from_slice(&data[..len]);
        })
    }

    /// `update_from_frame(fb)` — producer side, progress-aware variant
    /// (spec §4.4 step 3, §4.5).
    pub fn update_from_frame(&self, fb: &FrameBuffer<'_>, row_stride: usize, rows: usize) -> VmResult<()> {
        self.write_into_next_slot(|dst, _layout| {
            crate::frame::framebuffer_read(fb, dst, row_stride, rows);
        })
    }

    fn write_into_next_slot(&self, fill: impl FnOnce(&mut [u8], &Layout)) -> VmResult<()> {
        let layout_guard = self.layout.lock().unwrap();
        let layout = layout_guard.as_ref().ok_or(VmError::TexMapFailed)?;

        let current = State::unpack(self.state.load(Ordering::Acquire));
        if advance(current.w) == current.u {
            if !self.slow_warned.swap(true, Ordering::Relaxed) {
                log::warn!("streaming texture producer outpaces the GPU; dropping frame");
            }
            return Ok(());
        }

        let resources_guard = self.resources.lock().unwrap();
        let resources = resources_guard.as_ref().ok_or(VmError::TexMapFailed)?;
        let slot = &resources.slots[current.w as usize];

        // SAFETY: `buffer` was created with `Memory::Upload`, giving a
        // stable CPU-writable pointer for the buffer's lifetime (the
        // persistent mapping); no other writer touches slot `w` while it
        // is not also `u`, `s`, or `d`.
        let dst = unsafe {
            std::slice::from_raw_parts_mut(slot.buffer.data(), layout.pbo_buffer_size as usize)
        };
        fill(dst, layout);
        resources.context.sync_buffer(slot.buffer);

        let next = State {
            w: advance(current.w),
            ..current
        };
        self.state.store(next.pack(), Ordering::Release);
        Ok(())
    }

    /// `process()` — uploader side (spec §4.5). Render-thread only.
    pub fn process(&self) -> Result<(), TextureBindError> {
        let layout_guard = self.layout.lock().unwrap();
        let layout = layout_guard.as_ref().ok_or(TextureBindError::NotReady)?;

        if !layout.streaming {
            self.ready.store(true, Ordering::Release);
            return Ok(());
        }

        let current = State::unpack(self.state.load(Ordering::Acquire));
        if current.u == current.w {
            return if self.ready.load(Ordering::Acquire) {
                Ok(())
            } else {
                Err(TextureBindError::NotReady)
            };
        }
        let next_u = advance(current.u);
        if next_u == current.s || next_u == current.d {
            return Ok(());
        }

        let mut resources_guard = self.resources.lock().unwrap();
        let resources = resources_guard.as_mut().ok_or(TextureBindError::NotReady)?;

        resources.command_encoder.start();
        {
            let slot = &resources.slots[current.u as usize];
            if let mut transfer = resources.command_encoder.transfer("vmdisplay-upload") {
                for (p, plane) in layout.planes.iter().enumerate() {
                    let bytes_per_row = plane.row_stride_px;
                    let extent = gpu::Extent {
                        width: plane.cols,
                        height: plane.rows,
                        depth: 1,
                    };
                    transfer.copy_buffer_to_texture(
                        gpu::BufferPiece {
                            buffer: slot.buffer,
                            offset: layout.offsets[p],
                        },
                        bytes_per_row,
                        gpu::TexturePiece {
                            texture: slot.textures[p],
                            ..Default::default()
                        },
                        extent,
                    );
                }
            }
        }
        let sync_point = resources.context.submit(&mut resources.command_encoder);
        resources.slots[current.u as usize].fence = Some(sync_point);

        let next = State {
            u: next_u,
            ..current
        };
        self.state.store(next.pack(), Ordering::Release);
        self.ready.store(true, Ordering::Release);
        Ok(())
    }

    /// `bind()` — renderer side (spec §4.5). Render-thread only.
    pub fn bind(&self) -> Result<(), TextureBindError> {
        let layout_guard = self.layout.lock().unwrap();
        let layout = layout_guard.as_ref().ok_or(TextureBindError::NotReady)?;

        if !layout.streaming {
            let resources_guard = self.resources.lock().unwrap();
            let resources = resources_guard.as_ref().ok_or(TextureBindError::NotReady)?;
            if !self.ready.load(Ordering::Acquire) {
                return Err(TextureBindError::NotReady);
            }
            let _ = &resources.slots[0];
            return Ok(());
        }

        if !self.ready.load(Ordering::Acquire) {
            return Err(TextureBindError::NotReady);
        }

        let mut resources_guard = self.resources.lock().unwrap();
        let resources = resources_guard.as_mut().ok_or(TextureBindError::NotReady)?;
        let current = State::unpack(self.state.load(Ordering::Acquire));

        if let Some(fence) = resources.slots[current.s as usize].fence.clone() {
            let signaled = resources.context.wait_for(&fence, FENCE_WAIT_NS);
            if signaled {
                resources.slots[current.s as usize].fence = None;
                let next = State {
                    s: advance(current.s),
                    ..current
                };
                self.state.store(next.pack(), Ordering::Release);
            }
            // Timeout: leave `s` unchanged and still bind the current `d`
            // (spec §4.5 `bind`). `blade-graphics`'s `wait_for` doesn't
            // distinguish a hard wait failure from a timeout at this API
            // surface, so `FenceWaitFailed` is not raised here; a wait
            // that never signals will simply keep retrying on later ticks.
        }

        let current = State::unpack(self.state.load(Ordering::Acquire));
        if current.d != current.s && advance(current.d) != current.s {
            let next = State {
                d: advance(current.d),
                ..current
            };
            self.state.store(next.pack(), Ordering::Release);
        }

        let current = State::unpack(self.state.load(Ordering::Acquire));
        let _ = &resources.slots[current.d as usize];
        Ok(())
    }

    /// The view/sampler pairs for the slot currently selected for display
    /// (`d`), one per plane, for the caller's draw call to bind (spec
    /// §4.5 `bind`: "Bind slot[d].texture[p] and samplers[p] to texture
    /// units 0..planeCount"). Empty before the first successful `bind`.
    pub fn current_planes(&self) -> Vec<(gpu::TextureView, gpu::Sampler)> {
        let resources_guard = self.resources.lock().unwrap();
        let Some(resources) = resources_guard.as_ref() else {
            return Vec::new();
        };
        if resources.slots.is_empty() {
            return Vec::new();
        }
        let current = State::unpack(self.state.load(Ordering::Acquire));
        let slot = &resources.slots[current.d as usize];
        slot.views.iter().copied().zip(resources.samplers.iter().copied()).collect()
    }

    /// Lends the GPU context to `f`, for the render thread's own surface
    /// acquisition, pipeline creation, and presentation — none of which
    /// this type knows anything about (spec §6: the renderer driver owns
    /// the window/swapchain, this type only owns the upload side).
    /// Render-thread only, like every other method here.
    pub fn with_context<T>(&self, f: impl FnOnce(&gpu::Context) -> T) -> Option<T> {
        let resources_guard = self.resources.lock().unwrap();
        resources_guard.as_ref().map(|r| f(&r.context))
    }

    /// `free()` (spec §4.5): unmaps all PBOs, deletes PBOs/textures/
    /// samplers/fences in that order.
    pub fn free(&self) {
        let mut resources_guard = self.resources.lock().unwrap();
        if let Some(resources) = resources_guard.take() {
            for slot in resources.slots {
                for view in slot.views {
                    resources.context.destroy_texture_view(view);
                }
                for texture in slot.textures {
                    resources.context.destroy_texture(texture);
                }
                resources.context.destroy_buffer(slot.buffer);
            }
            for sampler in resources.samplers {
                resources.context.destroy_sampler(sampler);
            }
            let mut encoder = resources.command_encoder;
            resources.context.destroy_command_encoder(&mut encoder);
        }
        *self.layout.lock().unwrap() = None;
        self.ready.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureBindError {
    NotReady,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_word_packs_and_unpacks_round_trip() {
        let s = State { w: 2, u: 1, s: 0, d: 2 };
        let word = s.pack();
        assert_eq!(State::unpack(word), s);
    }

    #[test]
    fn advance_wraps_at_texture_count() {
        assert_eq!(advance(0), 1);
        assert_eq!(advance(1), 2);
        assert_eq!(advance(2), 0);
    }

    #[test]
    fn yuv420_plane_offsets_match_spec_table() {
        let layout = format_layout(FrameType::Yuv420, 640, 480, 640);
        assert_eq!(layout.plane_count, 3);
        assert_eq!(layout.offsets, vec![0, 307_200, 384_000]);
        assert_eq!(layout.pbo_buffer_size, 460_800);
        assert_eq!(
            layout.planes.iter().map(|p| p.row_stride_px).collect::<Vec<_>>(),
            vec![640, 320, 320]
        );
    }

    #[test]
    fn bgra_plane_is_single_plane_four_bpp() {
        let layout = format_layout(FrameType::Bgra, 1920, 1080, 1920);
        assert_eq!(layout.plane_count, 1);
        assert_eq!(layout.offsets, vec![0]);
        assert_eq!(layout.pbo_buffer_size, 1080 * 1920 * 4);
    }
}
