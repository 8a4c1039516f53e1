//! Binary entry point: the "everything else" named in spec §1/§5 that
//! embeds [`vmdisplay::Core`] — shared-region opener, GPU context, window,
//! and a [`vmdisplay::RendererDriver`] implementation. Windowing-toolkit
//! integration, input side-channel semantics, on-screen FPS overlay, and
//! aspect-ratio math are all non-goals of the core crate (spec §1); this
//! file provides the minimum of each needed to actually show something on
//! screen, not a full-featured client shell.

use blade_graphics as gpu;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use vmdisplay::core::Core;
use vmdisplay::cursor::CursorType;
use vmdisplay::frame::{FrameBuffer, FrameDescriptor};
use vmdisplay::renderer::{DstRect, RendererDriver};
use vmdisplay::texture::StreamingTexture;
use vmdisplay::{AppParams, Session};

const SHADER_SOURCE: &str = include_str!("shader.wgsl");

/// `gpu::ShaderData` binding for the one plane this binary actually draws
/// (spec §4.5 `bind`: "texture units 0..planeCount" — plane 0 only here,
/// see `shader.wgsl`).
struct PlaneParams {
    plane_texture: gpu::TextureView,
    plane_sampler: gpu::Sampler,
}

impl gpu::ShaderData for PlaneParams {
    fn layout() -> gpu::ShaderDataLayout {
        gpu::ShaderDataLayout {
            bindings: vec![
                ("plane_texture", gpu::ShaderBinding::Texture),
                ("plane_sampler", gpu::ShaderBinding::Sampler),
            ],
        }
    }

    fn fill(&self, mut ctx: gpu::PipelineContext) {
        use gpu::ShaderBindable as _;
        self.plane_texture.bind_to(&mut ctx, 0);
        self.plane_sampler.bind_to(&mut ctx, 1);
    }
}

/// A [`RendererDriver`] that presents the streaming texture's current slot
/// into a `winit` window (spec §6, consumed by the core). Owns the
/// swapchain surface and the draw pipeline; does not touch the GPU context
/// itself, which [`StreamingTexture`] owns — see
/// [`StreamingTexture::with_context`].
struct WindowRenderer {
    window: Arc<winit::window::Window>,
    texture: Arc<StreamingTexture>,
    surface: Option<gpu::Surface>,
    pipeline: Option<gpu::RenderPipeline>,
    command_encoder: Option<gpu::CommandEncoder>,
    prev_sync_point: Option<gpu::SyncPoint>,
    auto_resize: bool,
}

impl WindowRenderer {
    fn new(window: Arc<winit::window::Window>, texture: Arc<StreamingTexture>, auto_resize: bool) -> Self {
        Self {
            window,
            texture,
            surface: None,
            pipeline: None,
            command_encoder: None,
            prev_sync_point: None,
            auto_resize,
        }
    }

    fn surface_config(size: winit::dpi::PhysicalSize<u32>) -> gpu::SurfaceConfig {
        gpu::SurfaceConfig {
            size: gpu::Extent {
                width: size.width.max(1),
                height: size.height.max(1),
                depth: 1,
            },
            usage: gpu::TextureUsage::TARGET,
            display_sync: gpu::DisplaySync::Block,
            ..Default::default()
        }
    }

    /// The OS window was resized by the user; reconfigure the swapchain.
    /// Not part of [`RendererDriver`] — the core never sees window events,
    /// only the embedding event loop does (spec §5).
    fn handle_window_resize(&mut self, size: winit::dpi::PhysicalSize<u32>) {
        if size.width == 0 || size.height == 0 {
            return;
        }
        let Some(surface) = self.surface.as_mut() else {
            return;
        };
        self.texture.with_context(|ctx| {
            ctx.reconfigure_surface(surface, Self::surface_config(size));
        });
    }
}

impl RendererDriver for WindowRenderer {
    type Error = String;

    fn render_startup(&mut self) -> Result<(), Self::Error> {
        let window_size = self.window.inner_size();
        let window = self.window.clone();

        let built = self.texture.with_context(|ctx| {
            ctx.create_surface_configured(window.as_ref(), Self::surface_config(window_size))
                .map(|surface| {
                    let shader = ctx.create_shader(gpu::ShaderDesc { source: SHADER_SOURCE });
                    let layout = <PlaneParams as gpu::ShaderData>::layout();
                    let pipeline = ctx.create_render_pipeline(gpu::RenderPipelineDesc {
                        name: "vmdisplay-quad",
                        data_layouts: &[&layout],
                        vertex: shader.at("vs_main"),
                        vertex_fetches: &[],
                        fragment: Some(shader.at("fs_main")),
                        primitive: gpu::PrimitiveState {
                            topology: gpu::PrimitiveTopology::TriangleList,
                            ..Default::default()
                        },
                        depth_stencil: None,
                        color_targets: &[gpu::ColorTargetState {
                            format: surface.info().format,
                            blend: None,
                            write_mask: gpu::ColorWrites::ALL,
                        }],
                        multisample_state: gpu::MultisampleState::default(),
                    });
                    let command_encoder = ctx.create_command_encoder(gpu::CommandEncoderDesc {
                        name: "vmdisplay-present",
                        buffer_count: 2,
                    });
                    (surface, pipeline, command_encoder)
                })
        });

        match built {
            None => Err("streaming texture has no GPU context yet".to_string()),
            Some(Err(err)) => Err(format!("surface creation failed: {err:?}")),
            Some(Ok((surface, pipeline, command_encoder))) => {
                self.surface = Some(surface);
                self.pipeline = Some(pipeline);
                self.command_encoder = Some(command_encoder);
                Ok(())
            }
        }
    }

    fn render(&mut self) -> Result<(), Self::Error> {
        let Some((view, sampler)) = self.texture.current_planes().into_iter().next() else {
            // Nothing decoded yet; the render thread will tick again.
            return Ok(());
        };

        let surface = self.surface.take().ok_or_else(|| "render called before render_startup".to_string())?;
        let pipeline = self
            .pipeline
            .as_ref()
            .ok_or_else(|| "render called before render_startup".to_string())?;
        let encoder = self
            .command_encoder
            .take()
            .ok_or_else(|| "render called before render_startup".to_string())?;
        let previous_sync = self.prev_sync_point.take();

        let outcome = self.texture.with_context(move |ctx| {
            if let Some(sp) = &previous_sync {
                ctx.wait_for(sp, !0);
            }

            let frame = surface.acquire_frame();
            let mut encoder = encoder;
            encoder.start();
            if let mut pass = encoder.render(
                "vmdisplay-quad",
                gpu::RenderTargetSet {
                    colors: &[gpu::RenderTarget {
                        view: frame.texture_view(),
                        init_op: gpu::InitOp::Clear(gpu::TextureColor::OpaqueBlack),
                        finish_op: gpu::FinishOp::Store,
                    }],
                    depth_stencil: None,
                },
            ) {
                if let mut draw = pass.with(pipeline) {
                    draw.bind(
                        0,
                        &PlaneParams {
                            plane_texture: view,
                            plane_sampler: sampler,
                        },
                    );
                    draw.draw(0, 6, 0, 1);
                }
            }
            encoder.present(frame);
            let sync_point = ctx.submit(&mut encoder);
            (surface, encoder, sync_point)
        });

        match outcome {
            Some((surface, encoder, sync_point)) => {
                self.surface = Some(surface);
                self.command_encoder = Some(encoder);
                self.prev_sync_point = Some(sync_point);
                Ok(())
            }
            None => Err("render called with no GPU context".to_string()),
        }
    }

    fn on_frame_event(&mut self, _format: FrameDescriptor, _buffer: &FrameBuffer<'_>) -> Result<(), Self::Error> {
        // The streaming texture already has the pixels (frame thread calls
        // `update_from_frame` before this); nothing further to do here.
        Ok(())
    }

    fn on_mouse_event(&mut self, _visible: bool, _x: i32, _y: i32) {
        // Cursor overlay rendering is a non-goal; the host OS cursor is
        // left as-is.
    }

    fn on_mouse_shape(&mut self, _cursor_type: CursorType, _width: u32, _height: u32, _pitch: u32, _bytes: &[u8]) -> Result<(), Self::Error> {
        Ok(())
    }

    fn on_resize(&mut self, width: u32, height: u32, _dst_rect: DstRect) {
        if self.auto_resize {
            let _ = self
                .window
                .request_inner_size(winit::dpi::PhysicalSize::new(width, height));
        }
    }

    fn update_fps(&mut self, ups: f32, fps: f32) {
        log::debug!("ups={ups:.1} fps={fps:.1}");
    }

    fn deinitialize(&mut self) {
        if let Some(sp) = self.prev_sync_point.take() {
            self.texture.with_context(|ctx| ctx.wait_for(&sp, !0));
        }
        if let (Some(mut surface), Some(mut pipeline)) = (self.surface.take(), self.pipeline.take()) {
            self.texture.with_context(|ctx| {
                ctx.destroy_surface(&mut surface);
                ctx.destroy_render_pipeline(&mut pipeline);
            });
        }
        if let Some(mut encoder) = self.command_encoder.take() {
            self.texture.with_context(|ctx| ctx.destroy_command_encoder(&mut encoder));
        }
    }
}

/// Retries `Session::init` while the host is still (re)initializing the
/// region (spec §4.2: `INVALID_MAGIC`/`INVALID_SESSION` are transient),
/// bounded by `AppParams::session_init_timeout`.
fn wait_for_session<'a>(bytes: &'a [u8], params: &AppParams) -> Session<'a> {
    let deadline = Instant::now() + params.session_init_timeout;
    loop {
        match Session::init(bytes, params.heartbeat_timeout) {
            Ok(session) => return session,
            Err(err) if err.is_transient() && Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(err) => panic!("failed to attach to shared region: {err}"),
        }
    }
}

fn main() {
    env_logger::init();

    let params = AppParams::from_env();

    let shm_path = std::env::var("VMDISPLAY_SHM_PATH").unwrap_or_else(|_| "/dev/shm/vmdisplay".to_string());
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(&shm_path)
        .unwrap_or_else(|err| panic!("failed to open shared region '{shm_path}': {err}"));
    // SAFETY: the host process is expected to keep this mapping's backing
    // file sized for the lifetime of the session; this client never
    // truncates or remaps it.
    let mmap = unsafe {
        memmap2::MmapMut::map_mut(&file).unwrap_or_else(|err| panic!("failed to map shared region '{shm_path}': {err}"))
    };

    let session = wait_for_session(&mmap, &params);

    let event_loop = winit::event_loop::EventLoop::new().unwrap();
    let window_attributes = winit::window::Window::default_attributes().with_title("vmdisplay");
    let window = Arc::new(event_loop.create_window(window_attributes).unwrap());

    let context = unsafe {
        gpu::Context::init(gpu::ContextDesc {
            presentation: true,
            validation: cfg!(debug_assertions),
            timing: false,
            capture: false,
            overlay: false,
            device_id: 0,
        })
        .unwrap_or_else(|err| panic!("GPU context init failed: {err:?}"))
    };

    let texture = Arc::new(StreamingTexture::init(context));
    let renderer = WindowRenderer::new(window.clone(), texture.clone(), params.auto_resize);
    let core = Core::new(params, texture, renderer);
    let running = core.running_handle();

    let refresh_rate_hz = window
        .current_monitor()
        .and_then(|m| m.refresh_rate_millihertz())
        .map(|mhz| mhz as f64 / 1000.0)
        .unwrap_or(60.0);

    std::thread::scope(|scope| {
        scope.spawn(|| {
            core.run(&session, refresh_rate_hz);
        });

        let run_result = event_loop.run(|event, target| {
            target.set_control_flow(winit::event_loop::ControlFlow::Poll);

            if !running.load(Ordering::Acquire) {
                target.exit();
                return;
            }

            if let winit::event::Event::WindowEvent { event, .. } = event {
                match event {
                    winit::event::WindowEvent::Resized(size) => {
                        core.renderer().lock().unwrap().handle_window_resize(size);
                    }
                    winit::event::WindowEvent::CloseRequested => {
                        core.request_stop();
                        target.exit();
                    }
                    winit::event::WindowEvent::KeyboardInput {
                        event:
                            winit::event::KeyEvent {
                                physical_key: winit::keyboard::PhysicalKey::Code(key_code),
                                state: winit::event::ElementState::Pressed,
                                ..
                            },
                        ..
                    } => {
                        if key_code == winit::keyboard::KeyCode::Escape {
                            core.request_stop();
                            target.exit();
                        }
                    }
                    _ => {}
                }
            }
        });

        if let Err(err) = run_result {
            log::error!("event loop exited with an error: {err}");
        }
        core.request_stop();
    });
}
