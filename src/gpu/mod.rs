//! Backend-neutral compute device layer.

pub mod backend;
pub mod buffer;
pub mod command;
pub mod descriptor;
pub mod device;
pub mod pipeline;
pub mod soft;
pub mod wgpu_backend;

pub use backend::{Backend, DeviceLimits};
pub use buffer::{Buffer, BufferUsage, Mapping, MemoryClass};
pub use command::{CommandBuffer, CommandBufferState};
pub use descriptor::{BoundBuffer, BoundDescriptorSet, DescriptorPool, DescriptorSet, LayoutSetMap};
pub use device::Device;
pub use pipeline::{DescriptorSetLayout, Pipeline, ShaderModule, SpecConstant, SpecValue};
pub use soft::{Fault, SoftBackend};
pub use wgpu_backend::WgpuBackend;
