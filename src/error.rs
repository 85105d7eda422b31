//! Renderer error types.

use crate::backend::BackendError;
use thiserror::Error;

/// Errors raised above the backend layer.
#[derive(Error, Debug)]
pub enum RenderError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("uniform '{0}' not found")]
    UniformNotFound(String),
    #[error("texture '{0}' not found")]
    TextureNotFound(String),
    #[error("uniform '{name}' is {actual}, not {expected}")]
    UniformTypeMismatch {
        name: String,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("bad uniform descriptor: {0}")]
    InvalidDescriptor(String),
    #[error("no shader registered for {0}")]
    ShaderNotFound(String),
    #[error("cannot render '{object}': {reason}")]
    ShaderDispatch { object: String, reason: String },
    #[error("shadow map layer {layer} is not renderable: {reason}")]
    ShadowTargetIncomplete { layer: u32, reason: String },
    #[error("all {max} shadow map layers are in use")]
    ShadowAtlasFull { max: u32 },
    #[error("render target is {actual}, expected {expected}")]
    InvalidTargetState {
        expected: &'static str,
        actual: &'static str,
    },
    #[error("readback buffer holds {provided} bytes, need {required}")]
    ReadbackBufferTooSmall { required: usize, provided: usize },
    #[error("scene object no longer exists")]
    UnknownObject,
    #[error("GPU objects can only be released on the context thread")]
    NotContextThread,
}

impl RenderError {
    /// Errors confined to one object's draw. The renderer logs these and draws
    /// the object with the error shader instead of failing the frame.
    pub fn is_per_object(&self) -> bool {
        match self {
            RenderError::UniformNotFound(_)
            | RenderError::TextureNotFound(_)
            | RenderError::UniformTypeMismatch { .. }
            | RenderError::ShaderNotFound(_)
            | RenderError::ShaderDispatch { .. } => true,
            RenderError::Backend(e) => matches!(
                e,
                BackendError::PipelineCreationFailed(_)
                    | BackendError::ShaderCreationFailed(_)
                    | BackendError::InvalidHandle { .. }
            ),
            _ => false,
        }
    }
}

pub type RenderResult<T> = Result<T, RenderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RenderError::ReadbackBufferTooSmall {
            required: 64,
            provided: 16,
        };
        assert_eq!(err.to_string(), "readback buffer holds 16 bytes, need 64");

        let err: RenderError = BackendError::DeviceLost.into();
        assert_eq!(err.to_string(), "Device lost");
        assert!(!err.is_per_object());
    }

    #[test]
    fn shader_failures_stay_per_object() {
        assert!(RenderError::TextureNotFound("u_texture".into()).is_per_object());
        let err: RenderError = BackendError::PipelineCreationFailed("bad wgsl".into()).into();
        assert!(err.is_per_object());
        assert!(!RenderError::ShadowAtlasFull { max: 4 }.is_per_object());
    }
}
