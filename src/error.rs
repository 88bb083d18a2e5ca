//! Error types shared by the backends, resources and the scene builder.

use thiserror::Error;

use crate::scene::{MaterialHandle, MeshHandle};

/// Errors that can occur in the GPU resource layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphicsError {
    #[error("Failed to initialize backend: {0}")]
    InitializationFailed(String),
    #[error("Failed to create resource: {0}")]
    ResourceCreationFailed(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("Buffer memory is not host visible")]
    MemoryNotHostVisible,
    #[error("Buffer is not mapped")]
    BufferNotMapped,
    #[error("Descriptor pool is out of memory")]
    OutOfPoolMemory,
    #[error("Descriptor pool is fragmented")]
    FragmentedPool,
    #[error("Descriptor pool exhausted after growing: {0}")]
    DescriptorPoolExhausted(String),
    #[error("Acceleration structure build failed: {0}")]
    AccelerationStructureBuildFailed(String),
    #[error("No bottom-level acceleration structure registered for {0:?}")]
    MissingBottomLevel(MeshHandle),
    #[error("Material {0:?} is not registered")]
    UnknownMaterial(MaterialHandle),
    #[error("Out of memory")]
    OutOfMemory,
    #[error("Device lost")]
    DeviceLost,
}

impl GraphicsError {
    /// Whether this is the recoverable "pool is full" condition a growable
    /// allocator reacts to by creating a new pool.
    pub fn is_pool_exhaustion(&self) -> bool {
        matches!(self, Self::OutOfPoolMemory | Self::FragmentedPool)
    }
}

pub type GraphicsResult<T> = Result<T, GraphicsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GraphicsError::OutOfMemory;
        assert_eq!(err.to_string(), "Out of memory");

        let err = GraphicsError::InvalidConfiguration("growth factor must exceed 1".to_string());
        assert_eq!(
            err.to_string(),
            "Invalid configuration: growth factor must exceed 1"
        );
    }

    #[test]
    fn test_pool_exhaustion_classification() {
        assert!(GraphicsError::OutOfPoolMemory.is_pool_exhaustion());
        assert!(GraphicsError::FragmentedPool.is_pool_exhaustion());
        assert!(!GraphicsError::DeviceLost.is_pool_exhaustion());
    }
}
