//! Renderer driver interface (spec §6): consumed by the core, not
//! implemented here. Windowing-toolkit integration, on-screen FPS
//! rendering, and aspect-ratio math are all non-goals of this crate; this
//! module only names the seam the core calls through so `Core::run` (§9
//! "Global mutable state") can be generic over whatever renderer the rest
//! of the application provides.

use crate::frame::{FrameDescriptor, FrameBuffer};
use crate::cursor::CursorType;

/// A destination rectangle the renderer scales its output into, recomputed
/// when the source size or window size changes. Aspect-ratio math is a
/// non-goal; this is an opaque passthrough value the core forwards from
/// whatever the embedding application computed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DstRect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

/// The seam between the core and "everything else" (spec §1: window/event
/// loop, SPICE side channel, CLI, tray, crash handler). Implemented outside
/// this crate by whatever embeds it; a test-only stub lives in
/// [`NullRenderer`] below. `Send` because `Core` shares one instance across
/// the frame/cursor/render threads behind a `Mutex` (spec §5: the GL/GPU
/// context itself still has exactly one thread that ever drives it — the
/// render thread — the mutex only exists so the type can cross thread
/// boundaries at all).
pub trait RendererDriver: Send {
    /// Error type surfaced by fallible hooks.
    type Error: std::fmt::Debug;

    /// Renderer subsystem startup, called once from the render thread
    /// before the startup event is signaled (spec §4.6, §6
    /// `render_startup`).
    fn render_startup(&mut self) -> Result<(), Self::Error>;

    /// One render-thread tick: bind the current texture slot and draw
    /// (spec §4.6, §6 `render`). Returning `Err` stops the render loop the
    /// way `state.lgr->render` returning `false` breaks out of
    /// `renderThread` in the original client.
    fn render(&mut self) -> Result<(), Self::Error>;

    /// A frame message arrived; hand its format and buffer to the renderer
    /// (spec §6 `on_frame_event`). The core has already advanced the
    /// queue's consumer index by the time this returns — the renderer must
    /// copy or consume the buffer synchronously.
    fn on_frame_event(&mut self, format: FrameDescriptor, buffer: &FrameBuffer<'_>) -> Result<(), Self::Error>;

    /// Cursor position/visibility changed (spec §6 `on_mouse_event`).
    fn on_mouse_event(&mut self, visible: bool, x: i32, y: i32);

    /// Cursor shape changed (spec §6 `on_mouse_shape`).
    fn on_mouse_shape(&mut self, cursor_type: CursorType, width: u32, height: u32, pitch: u32, bytes: &[u8]) -> Result<(), Self::Error>;

    /// Source or window geometry changed (spec §6 `on_resize`).
    fn on_resize(&mut self, width: u32, height: u32, dst_rect: DstRect);

    /// Periodic FPS/UPS report; a no-op unless `AppParams::show_fps` (spec
    /// §6 `update_fps`). Showing the value on screen is a non-goal.
    fn update_fps(&mut self, ups: f32, fps: f32);

    /// Renderer subsystem teardown (spec §6 `deinitialize`).
    fn deinitialize(&mut self);
}

/// A [`RendererDriver`] that does nothing, used by `Core`'s own unit tests
/// and available to callers that want to exercise the thread/queue wiring
/// without a real GPU or window.
#[derive(Default)]
pub struct NullRenderer {
    pub frame_events: u32,
    pub mouse_events: u32,
    pub resizes: u32,
}

impl RendererDriver for NullRenderer {
    type Error = std::convert::Infallible;

    fn render_startup(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    fn render(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    fn on_frame_event(&mut self, _format: FrameDescriptor, _buffer: &FrameBuffer<'_>) -> Result<(), Self::Error> {
        self.frame_events += 1;
        Ok(())
    }

    fn on_mouse_event(&mut self, _visible: bool, _x: i32, _y: i32) {
        self.mouse_events += 1;
    }

    fn on_mouse_shape(&mut self, _cursor_type: CursorType, _width: u32, _height: u32, _pitch: u32, _bytes: &[u8]) -> Result<(), Self::Error> {
        Ok(())
    }

    fn on_resize(&mut self, _width: u32, _height: u32, _dst_rect: DstRect) {
        self.resizes += 1;
    }

    fn update_fps(&mut self, _ups: f32, _fps: f32) {}

    fn deinitialize(&mut self) {}
}
