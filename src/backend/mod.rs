//! Backend abstraction layer
//!
//! Provides the device trait the resource layer is written against, plus the
//! Vulkan implementation and a dummy implementation used for testing.

pub mod dummy;
pub mod traits;
pub mod types;

#[cfg(feature = "vulkan-backend")]
pub mod vulkan;

pub use dummy::DummyDevice;
pub use traits::*;
pub use types::*;
