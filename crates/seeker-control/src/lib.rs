pub mod filter;
pub mod mapper;
pub mod mode;
pub mod node;

pub use mapper::SafetyMapper;
pub use mode::{FailsafeTarget, ModeConfig};
