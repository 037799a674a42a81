//! Tools available in every sandbox unless the caller selects a subset.

mod echo;
mod shell;
mod sleep;
mod time;

pub use echo::EchoTool;
pub use shell::ExecuteCommandTool;
pub use sleep::SleepTool;
pub use time::TimeTool;
