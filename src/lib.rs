//! Low-latency display-mirroring core: shared-memory message queues
//! (SHM-QUEUE) feeding a triple-buffered, fence-synchronized GPU texture
//! pipeline (STREAMING-TEX).
//!
//! This crate is the core data path only (`guest -> shared region ->
//! client session -> queue subscriber -> frame ingest -> streaming texture
//! -> render loop`); windowing-toolkit integration, input/clipboard
//! side-channel semantics, platform tray/IPC, and crash-handler
//! installation are out of scope and live in whatever embeds this crate.

pub mod config;
pub mod core;
pub mod cursor;
pub mod error;
pub mod frame;
pub mod render;
pub mod renderer;
pub mod ring;
pub mod session;
pub mod queue;
pub mod texture;

pub use config::AppParams;
pub use core::Core;
pub use error::{VmError, VmResult};
pub use renderer::RendererDriver;
pub use session::Session;
pub use texture::StreamingTexture;
