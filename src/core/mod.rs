//! 核心基础设施：错误分类、重试退避、注入的后端客户端、优雅关闭

pub mod backends;
pub mod error;
pub mod retry;
pub mod shutdown;

pub use backends::Backends;
pub use error::{BackendKind, MemoryError, MemoryResult};
pub use retry::{retry, RetryPolicy};
pub use shutdown::{PoolCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason};
