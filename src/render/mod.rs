//! Rendering: culling, render targets, shaders and the frame orchestration
//!
//! The render thread owns a [`Renderer`]. Every frame it culls the scene into the
//! draw list of a [`RenderTarget`], refreshes the light block and shadow maps,
//! then draws the list pass by pass.

pub mod cull;
mod delete_queue;
mod renderer;
mod shader;
pub mod shaders;
mod state;
mod stats;
pub mod target;

pub use cull::{CullResult, DrawItem, RenderDataList, ViewParams};
pub use delete_queue::{DeleteQueue, GpuHandle};
pub use renderer::{pipeline_state, ExternalRenderFn, Renderer};
pub use shader::{BindLayouts, PipelineState, Shader, ShaderId, ShaderManager, ShaderSource, ShaderType};
pub use state::{RenderState, Viewport};
pub use stats::RenderStats;
pub use target::{Attachment, RenderTarget, RenderTexture, RenderTextureDescriptor, TargetPhase};
