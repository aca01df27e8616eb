//! 记忆工具：remember（写入长期记忆）与 recall（检索长期记忆）

use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::memory::LongTermMemory;
use crate::tools::schema::{parameters_schema, parse_args};
use crate::tools::Tool;

#[derive(Debug, Deserialize, JsonSchema)]
struct RememberArgs {
    /// A single self-contained fact about the user, e.g. "User likes pizza"
    fact: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct RecallArgs {
    /// What to look up, e.g. "user name" or "food preferences"
    query: String,
    /// Maximum number of facts to return (default 5)
    #[serde(default)]
    limit: Option<usize>,
}

/// remember：把一条事实写入长期记忆
pub struct RememberTool {
    memory: Arc<dyn LongTermMemory>,
}

impl RememberTool {
    pub fn new(memory: Arc<dyn LongTermMemory>) -> Self {
        Self { memory }
    }
}

#[async_trait]
impl Tool for RememberTool {
    fn name(&self) -> &str {
        "remember"
    }

    fn description(&self) -> &str {
        "Store a fact about the user in long-term memory so it can be recalled in later conversations."
    }

    fn parameters_schema(&self) -> Value {
        parameters_schema::<RememberArgs>()
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let args: RememberArgs = parse_args(self.name(), args)?;
        let fact = args.fact.trim();
        if fact.is_empty() {
            return Err("fact must not be empty".to_string());
        }
        let stored = self.memory.add(fact);
        tracing::info!(fact = %fact, new = stored, "remember tool execute");
        Ok(json!({"stored": stored, "fact": fact}))
    }
}

/// recall：按关键词检索长期记忆
pub struct RecallTool {
    memory: Arc<dyn LongTermMemory>,
}

impl RecallTool {
    pub fn new(memory: Arc<dyn LongTermMemory>) -> Self {
        Self { memory }
    }
}

#[async_trait]
impl Tool for RecallTool {
    fn name(&self) -> &str {
        "recall"
    }

    fn description(&self) -> &str {
        "Search long-term memory for facts previously stored about the user."
    }

    fn parameters_schema(&self) -> Value {
        parameters_schema::<RecallArgs>()
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let args: RecallArgs = parse_args(self.name(), args)?;
        let hits = self.memory.search(&args.query, args.limit.unwrap_or(5).max(1));
        tracing::info!(query = %args.query, hits = hits.len(), "recall tool execute");
        Ok(json!({"facts": hits}))
    }
}
