//! 记忆层：对话轮次、持久化数据模型、提示词与结构化输出解析、压缩状态机

pub mod conversation;
pub mod extraction;
pub mod keeper;
pub mod model;
pub mod prompts;
pub mod tokenizer;

pub use conversation::{Message, Role, Turn};
pub use keeper::{AppendOutcome, KeeperSettings, MemoryKeeper, SessionReport};
