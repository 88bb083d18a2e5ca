//! GPU resources owned by the core: buffers, acceleration structures and
//! the submissions that keep transient buffers alive while the GPU uses them.

mod acceleration_structure;
mod buffer;
mod submission;

pub use acceleration_structure::AccelerationStructure;
pub use buffer::Buffer;
pub use submission::Submission;
