//! LLM 层：后端请求类型、客户端抽象与实现（OpenAI 兼容 / Mock / 脚本化）

pub mod mock;
pub mod openai;
pub mod traits;
pub mod types;

pub use mock::{MockLlmClient, ScriptedLlmClient};
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::{ChunkStream, LlmClient, LlmError};
pub use types::{ChatRequest, ChatResponse, StreamChunk, ToolDeclaration};
