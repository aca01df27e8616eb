//! 核心编排层：错误、轮次状态机、轮次数据、后端并发闸门、会话监管、轮次编排器

pub mod error;
pub mod orchestrator;
pub mod session_supervisor;
pub mod state;
pub mod task_scheduler;
pub mod turn;

pub use error::{AgentError, MemoryStoreError};
pub use orchestrator::{PendingTurn, TurnOrchestrator, TurnOutcome};
pub use session_supervisor::SessionSupervisor;
pub use state::{TurnPhase, TurnState};
pub use task_scheduler::BackendGate;
pub use turn::{DispatchLedger, FailureKind, PassFailure, PassOutcome, TurnId, TurnRecord};
