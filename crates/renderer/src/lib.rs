//! Render pipelines built on the Ember RHI.
//!
//! This crate turns a [`Scene`] into presented frames:
//! - [`RenderPipeline`] is the capability every pipeline variant provides
//! - [`ForwardPipeline`] shades meshes directly into the backbuffer
//! - [`DeferredPipeline`] writes a G-buffer and lights it in a second subpass
//! - [`Renderer`] owns the RHI context and drives the active pipeline

pub mod deferred;
pub mod forward;
pub mod pipeline;
pub mod renderer;
pub mod scene;
pub mod uniforms;

pub use deferred::DeferredPipeline;
pub use forward::ForwardPipeline;
pub use pipeline::{PipelineKind, RenderPipeline, ShaderSet};
pub use renderer::Renderer;
pub use scene::{Mesh, Scene};
