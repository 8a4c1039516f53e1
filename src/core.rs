//! `Core`: the process-wide orchestration value that owns the
//! frame/cursor/render worker threads (spec §9 "Global mutable state": "In
//! the rewrite, encapsulate this as a `Core` value threaded through the
//! worker entrypoints").
//!
//! Grounded on `lg_run`/`lg_shutdown` in the original client: a single
//! `running` flag as the sole cancellation signal, a one-shot startup event
//! signaled by the render thread (even on a failed startup, so threads that
//! are already waiting don't block forever), and a fixed join order on
//! shutdown (render thread joins cursor, then frame).
//!
//! The event thread (owns the windowing event queue) and the SPICE
//! side-channel thread are both out of core scope (spec §1, §5); the
//! embedding application drives those and calls [`Core::request_stop`] when
//! the event thread sees a quit request.

use crate::config::AppParams;
use crate::cursor::CursorIngest;
use crate::error::VmError;
use crate::frame::FrameIngest;
use crate::queue::QueueSubscriber;
use crate::render::FixedTicker;
use crate::renderer::{DstRect, RendererDriver};
use crate::ring::QueueId;
use crate::session::Session;
use crate::texture::{StreamingTexture, TextureBindError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

/// Boolean one-shot startup signal (spec §6 "Startup event"), waited on by
/// the frame and cursor threads and signaled once by the render thread
/// after GL/GPU context init completes or fails.
struct StartupEvent {
    signaled: Mutex<bool>,
    condvar: Condvar,
}

impl StartupEvent {
    fn new() -> Self {
        Self {
            signaled: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    fn signal(&self) {
        let mut signaled = self.signaled.lock().unwrap();
        if !*signaled {
            *signaled = true;
            self.condvar.notify_all();
        }
    }

    fn wait(&self) {
        let mut signaled = self.signaled.lock().unwrap();
        while !*signaled {
            signaled = self.condvar.wait(signaled).unwrap();
        }
    }
}

/// Subscribe with the spec's `NO_SUCH_QUEUE` retry policy (§7: "Retry with
/// 1ms sleep"). Any other subscribe error is fatal: it sets `running` false
/// and returns `None`.
fn subscribe_with_retry(
    session: &Session<'_>,
    queue: QueueId,
    running: &AtomicBool,
) -> Option<crate::session::QueueHandle> {
    loop {
        if !running.load(Ordering::Acquire) {
            return None;
        }
        match session.subscribe(queue) {
            Ok(handle) => return Some(handle),
            Err(VmError::NoSuchQueue(_)) => {
                thread::sleep(std::time::Duration::from_millis(1));
                continue;
            }
            Err(err) => {
                log::error!("subscribe to {queue:?} failed: {err}");
                running.store(false, Ordering::Release);
                return None;
            }
        }
    }
}

fn frame_thread_main<R: RendererDriver>(
    session: &Session<'_>,
    texture: &StreamingTexture,
    renderer: &Mutex<R>,
    running: &AtomicBool,
    startup: &StartupEvent,
    params: &AppParams,
) {
    startup.wait();
    if !running.load(Ordering::Acquire) {
        return;
    }

    let Some(handle) = subscribe_with_retry(session, QueueId::Frame, running) else {
        return;
    };
    let mut sub = QueueSubscriber::new(session, handle);
    let mut ingest = FrameIngest::new();

    while running.load(Ordering::Acquire) {
        let msg = match sub.process() {
            Ok(msg) => msg,
            Err(VmError::QueueEmpty) => {
                thread::sleep(params.frame_poll_interval);
                continue;
            }
            Err(err) => {
                log::error!("frame queue process failed: {err}");
                running.store(false, Ordering::Release);
                break;
            }
        };

        let frame = match ingest.ingest(&msg) {
            Ok(frame) => frame,
            Err(err) => {
                // Spec §7: UNSUPPORTED_FRAME_TYPE (and any other ingest
                // failure) acks the message, then breaks the frame loop —
                // fatal for the stream, not for the process.
                log::error!("frame ingest failed: {err}");
                sub.message_done();
                running.store(false, Ordering::Release);
                break;
            }
        };

        if frame.geometry_changed {
            if let Err(err) = texture.setup(
                frame.descriptor.frame_type,
                frame.descriptor.width,
                frame.descriptor.height,
                frame.descriptor.stride,
                params.streaming,
            ) {
                log::error!("streaming texture setup failed: {err}");
                sub.message_done();
                running.store(false, Ordering::Release);
                break;
            }
        }

        let row_stride = frame.descriptor.pitch as usize;
        let rows = frame.descriptor.height as usize;
        if let Err(err) = texture.update_from_frame(&frame.buffer, row_stride, rows) {
            log::warn!("streaming texture update failed: {err}");
        }

        {
            let mut renderer = renderer.lock().unwrap();
            if let Err(err) = renderer.on_frame_event(frame.descriptor, &frame.buffer) {
                log::error!("on_frame_event failed: {err:?}");
            }
            if frame.geometry_changed && params.auto_resize {
                renderer.on_resize(
                    frame.descriptor.width,
                    frame.descriptor.height,
                    DstRect {
                        x: 0,
                        y: 0,
                        width: frame.descriptor.width,
                        height: frame.descriptor.height,
                    },
                );
            }
        }

        sub.message_done();
    }

    session.unsubscribe(sub.into_handle());
}

fn cursor_thread_main<R: RendererDriver>(
    session: &Session<'_>,
    renderer: &Mutex<R>,
    running: &AtomicBool,
    startup: &StartupEvent,
    params: &AppParams,
) {
    startup.wait();
    if !running.load(Ordering::Acquire) {
        return;
    }

    let Some(handle) = subscribe_with_retry(session, QueueId::Pointer, running) else {
        return;
    };
    let mut sub = QueueSubscriber::new(session, handle);
    let mut ingest = CursorIngest::new();

    while running.load(Ordering::Acquire) {
        let msg = match sub.process() {
            Ok(msg) => msg,
            Err(VmError::QueueEmpty) => {
                thread::sleep(params.cursor_poll_interval);
                continue;
            }
            Err(err) => {
                log::error!("cursor queue process failed: {err}");
                running.store(false, Ordering::Release);
                break;
            }
        };

        let update = match ingest.ingest(&msg) {
            Ok(update) => update,
            Err(err) => {
                log::error!("cursor ingest failed: {err}");
                sub.message_done();
                continue;
            }
        };

        let mut renderer = renderer.lock().unwrap();
        if let Some(shape) = &update.shape {
            if let Err(err) = renderer.on_mouse_shape(shape.cursor_type, shape.width, shape.height, shape.pitch, shape.bytes) {
                log::error!("on_mouse_shape failed: {err:?}");
                sub.message_done();
                continue;
            }
        }
        sub.message_done();

        let (x, y) = ingest.position();
        renderer.on_mouse_event(update.visible, x, y);
    }

    session.unsubscribe(sub.into_handle());
}

fn render_thread_main<R: RendererDriver>(
    texture: &StreamingTexture,
    renderer: &Mutex<R>,
    running: &AtomicBool,
    startup: &StartupEvent,
    params: &AppParams,
    refresh_rate_hz: f64,
) {
    {
        let mut renderer = renderer.lock().unwrap();
        if let Err(err) = renderer.render_startup() {
            log::error!("render_startup failed: {err:?}");
            running.store(false, Ordering::Release);
            // Signal even on failure (spec §9 supplement) so frame/cursor
            // threads already waiting don't block forever.
            startup.signal();
            return;
        }
    }
    startup.signal();

    let mut ticker = FixedTicker::new(params.tick_period(refresh_rate_hz));
    while running.load(Ordering::Acquire) {
        let _ = texture.process();
        let bind_result = texture.bind();

        let mut renderer = renderer.lock().unwrap();
        match bind_result {
            Ok(()) | Err(TextureBindError::NotReady) => {
                if let Err(err) = renderer.render() {
                    log::error!("render failed: {err:?}");
                    drop(renderer);
                    break;
                }
            }
            Err(TextureBindError::Error) => {
                log::error!("streaming texture bind failed");
            }
        }
        drop(renderer);

        ticker.wait_for_next_tick();
    }

    running.store(false, Ordering::Release);
    renderer.lock().unwrap().deinitialize();
}

/// Process-wide orchestration value (spec §9). Owns the cancellation flag,
/// the startup event, the streaming texture, and the shared renderer; its
/// `run` method spawns and joins the frame/cursor/render threads.
pub struct Core<R: RendererDriver> {
    params: AppParams,
    running: Arc<AtomicBool>,
    startup: StartupEvent,
    texture: Arc<StreamingTexture>,
    renderer: Mutex<R>,
}

impl<R: RendererDriver> Core<R> {
    pub fn new(params: AppParams, texture: Arc<StreamingTexture>, renderer: R) -> Self {
        Self {
            params,
            running: Arc::new(AtomicBool::new(true)),
            startup: StartupEvent::new(),
            texture,
            renderer: Mutex::new(renderer),
        }
    }

    pub fn texture(&self) -> &Arc<StreamingTexture> {
        &self.texture
    }

    /// The shared renderer instance, for the embedding application's event
    /// thread to forward window-system events (resize, etc.) that the core
    /// itself never sees (spec §5: window/event loop is out of scope).
    pub fn renderer(&self) -> &Mutex<R> {
        &self.renderer
    }

    /// A clonable handle to the single cancellation flag (spec §5
    /// "Cancellation"), for the embedding application's event thread to
    /// flip on quit.
    pub fn running_handle(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Signal shutdown and unblock any thread still waiting on startup.
    pub fn request_stop(&self) {
        self.running.store(false, Ordering::Release);
        self.startup.signal();
    }

    /// Run the frame/cursor/render worker threads to completion, joining
    /// in the same order as the original client's render-thread teardown:
    /// cursor, then frame (spec §9, `renderThread`'s shutdown sequence).
    /// Blocks until `running` becomes false and every thread has exited.
    pub fn run(&self, session: &Session<'_>, refresh_rate_hz: f64) {
        thread::scope(|scope| {
            let cursor_handle = scope.spawn(|| {
                cursor_thread_main(session, &self.renderer, &self.running, &self.startup, &self.params);
            });
            let frame_handle = scope.spawn(|| {
                frame_thread_main(session, &self.texture, &self.renderer, &self.running, &self.startup, &self.params);
            });

            render_thread_main(
                &self.texture,
                &self.renderer,
                &self.running,
                &self.startup,
                &self.params,
                refresh_rate_hz,
            );

            if let Err(err) = cursor_handle.join() {
                log::error!("cursor thread panicked: {err:?}");
            }
            if let Err(err) = frame_handle.join() {
                log::error!("frame thread panicked: {err:?}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::test_support::build_region;
    use crate::session::Session;
    use std::time::Duration;

    // `Core::run` itself needs a real `gpu::Context` inside its
    // `StreamingTexture`, which needs a GPU; these tests exercise the
    // thread-wiring primitives (`StartupEvent`, the subscribe-retry loop)
    // in isolation instead, the way the teacher's own examples keep GPU
    // setup out of anything that would need to run headless in CI.

    #[test]
    fn startup_event_wait_unblocks_after_signal() {
        let event = Arc::new(StartupEvent::new());
        let waiter = event.clone();
        let handle = thread::spawn(move || waiter.wait());

        thread::sleep(Duration::from_millis(20));
        event.signal();
        handle.join().unwrap();
    }

    #[test]
    fn startup_event_signal_is_idempotent() {
        let event = StartupEvent::new();
        event.signal();
        event.signal();
        event.wait(); // must not deadlock
    }

    #[test]
    fn subscribe_with_retry_returns_none_if_already_stopped() {
        let bytes = build_region(&[b"x"]);
        let session = Session::init(&bytes, Duration::from_secs(1)).unwrap();
        let running = AtomicBool::new(false);

        assert!(subscribe_with_retry(&session, QueueId::Frame, &running).is_none());
    }

    #[test]
    fn subscribe_with_retry_succeeds_on_active_queue() {
        let bytes = build_region(&[b"x"]);
        let session = Session::init(&bytes, Duration::from_secs(1)).unwrap();
        let running = AtomicBool::new(true);

        let handle = subscribe_with_retry(&session, QueueId::Frame, &running);
        assert!(handle.is_some());
        assert!(running.load(Ordering::Acquire));
    }

    #[test]
    fn subscribe_with_retry_on_inactive_queue_is_fatal_only_after_exhausting_frame_retries() {
        // `Pointer` starts inactive in `build_region`; a caller that never
        // activates it would retry forever in production, so this test
        // just checks the function keeps retrying (rather than treating
        // `NoSuchQueue` as immediately fatal) by bounding how long we wait
        // before flipping `running` false ourselves.
        let bytes = build_region(&[b"x"]);
        let session = Session::init(&bytes, Duration::from_secs(1)).unwrap();
        let running = Arc::new(AtomicBool::new(true));
        let stopper = running.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            stopper.store(false, Ordering::Release);
        });

        let result = subscribe_with_retry(&session, QueueId::Pointer, &running);
        assert!(result.is_none());
        handle.join().unwrap();
    }
}
