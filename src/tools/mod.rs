//! Tool surface exposed inside every sandbox.

pub mod builtin;
mod registry;
mod tool;

pub use registry::ToolRegistry;
pub use tool::{Tool, ToolDescriptor, ToolError, ToolOutput};
