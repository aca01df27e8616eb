//! 轮次流水线：分类 → 规划 → 通道执行（含标签式调用规范化）→ 工具分发，以及对外事件

pub mod classifier;
pub mod dispatcher;
pub mod events;
pub mod normalizer;
pub mod pass;
pub mod planner;

pub use classifier::{classify, OperationCategory, OperationClassifier, Precedence};
pub use dispatcher::{append_tool_round, ToolDispatcher};
pub use events::{EventSink, TurnEvent};
pub use normalizer::{normalize, Normalizer};
pub use pass::{merge_tool_calls, PassExecutor, PassRequest};
pub use planner::{plan, ExecutionMode, ExecutionPlan, PassPurpose, PassSpec};
