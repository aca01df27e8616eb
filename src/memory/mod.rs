//! 记忆层：短期（对话）、长期（事实检索）、轮次提交

pub mod conversation;
pub mod long_term;
pub mod store;

pub use conversation::{ConversationMemory, Message, Role};
pub use long_term::{InMemoryLongTerm, LongTermMemory};
pub use store::{CommitStatus, InMemoryMemoryStore, JournalEntry, JournalMemoryStore, MemoryStore};
