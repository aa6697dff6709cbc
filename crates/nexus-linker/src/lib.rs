pub mod linker;
pub mod storage;
pub mod task_cache;

pub use linker::{ConversationLinker, LinkResult};
pub use storage::{LinkerStorage, ParentCandidate};
pub use task_cache::{TaskInvocation, TaskInvocationCache};
