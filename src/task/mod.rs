//! 任务协作方：任务发现 / 验证与状态准备 / 清理

pub mod manager;
pub mod state;

pub use manager::{filter_tasks, DirectoryTaskManager, Task, TaskManager, VerificationOutput};
pub use state::{
    state_manager_for, FilesystemStateManager, NoopStateManager, StateManager, TaskResources,
};
