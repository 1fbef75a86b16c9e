//! 统一轨迹：回合类型与消息归一化

pub mod normalize;
pub mod types;

pub use normalize::normalize;
pub use types::{Trajectory, Turn};
