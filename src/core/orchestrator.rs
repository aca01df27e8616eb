//! 轮次编排器：主控流程
//!
//! CLASSIFYING → PLANNING → EXECUTING → MERGING → COMMITTING → DONE（或 FAILED）。
//!
//! - 可见通道先取得后端许可，再派生副作用通道任务，保证本地后端串行时可见通道排在前面
//! - 调用方只看到可见通道的输出；副作用通道的正文丢弃，只取其工具调用
//! - 副作用通道在可见通道结束后最多再等 side_effect_timeout，超时放弃并记录
//! - 可见通道失败 → FAILED，不提交；已完成的副作用工具仍会执行
//! - 副作用通道失败 → 跳过提交，轮次仍为 DONE
//! - 提交失败只产生告警，不影响已交付的回复
//!
//! 另有 spawn_session：后台任务消费用户命令（Submit/Cancel/Clear/Reload/SetMode/Quit）驱动多轮对话。

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span};

use crate::config::{ConfigHandle, TurnSettings};
use crate::core::{
    BackendGate, DispatchLedger, FailureKind, MemoryStoreError, PassFailure, PassOutcome, SessionSupervisor, TurnId,
    TurnPhase, TurnRecord, TurnState,
};
use crate::llm::{LlmClient, ToolDeclaration};
use crate::memory::{ConversationMemory, MemoryStore, Message};
use crate::pipeline::{
    append_tool_round, plan, EventSink, ExecutionMode, OperationClassifier, PassExecutor, PassRequest, PassSpec,
    ToolDispatcher, TurnEvent,
};
use crate::tools::ToolResult;

/// 一轮结束后的结果
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub phase: TurnPhase,
    /// 经过的阶段
    pub trail: Vec<TurnPhase>,
    pub record: TurnRecord,
    /// 非致命告警（提交失败等）
    pub warnings: Vec<String>,
}

impl TurnOutcome {
    pub fn is_done(&self) -> bool {
        self.phase == TurnPhase::Done
    }

    pub fn turn_id(&self) -> &TurnId {
        &self.record.turn_id
    }

    pub fn visible_text(&self) -> &str {
        &self.record.final_visible_text
    }
}

struct SideEffectTask {
    index: usize,
    spec: PassSpec,
    handle: JoinHandle<PassOutcome>,
    abandon: CancellationToken,
}

pub struct TurnOrchestrator {
    config: ConfigHandle,
    passes: PassExecutor,
    dispatcher: ToolDispatcher,
    store: Arc<dyn MemoryStore>,
    gate: BackendGate,
}

impl TurnOrchestrator {
    /// 后端超时与并发上限在此时从配置读取；其余配置每轮读取
    pub fn new(
        config: ConfigHandle,
        llm: Arc<dyn LlmClient>,
        dispatcher: ToolDispatcher,
        store: Arc<dyn MemoryStore>,
    ) -> Self {
        let current = config.current();
        let passes = PassExecutor::new(
            llm,
            Duration::from_secs(current.llm.timeouts.request.max(1)),
            Duration::from_secs(current.llm.timeouts.stream_idle.max(1)),
        );
        let gate = BackendGate::new(current.llm.max_concurrent_requests);
        Self {
            config,
            passes,
            dispatcher,
            store,
            gate,
        }
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    pub fn dispatcher(&self) -> &ToolDispatcher {
        &self.dispatcher
    }

    /// 跑完一轮（含后台收尾）；不会 panic 也不返回错误，所有失败都体现在 TurnOutcome 中。
    /// 成功时把用户消息与可见回复追加到 conversation。
    pub async fn run_turn(
        &self,
        conversation: &mut ConversationMemory,
        user_message: &str,
        sink: &EventSink,
        cancel: CancellationToken,
    ) -> TurnOutcome {
        let pending = self.start_turn(conversation, user_message, sink, cancel).await;
        pending.record_exchange(conversation);
        pending.settle().await
    }

    /// 跑到可见回复交付为止；副作用通道的等待、分发与提交留给 PendingTurn::settle
    pub async fn start_turn(
        &self,
        conversation: &ConversationMemory,
        user_message: &str,
        sink: &EventSink,
        cancel: CancellationToken,
    ) -> PendingTurn {
        let turn_id = TurnId::new();
        let span = tracing::info_span!("turn", turn_id = %turn_id);
        self.deliver(turn_id, conversation, user_message, sink, cancel, span.clone())
            .instrument(span)
            .await
    }

    async fn deliver(
        &self,
        turn_id: TurnId,
        conversation: &ConversationMemory,
        user_message: &str,
        sink: &EventSink,
        cancel: CancellationToken,
        span: Span,
    ) -> PendingTurn {
        let mut state = TurnState::new();
        let config = self.config.current();

        // CLASSIFYING
        let category = OperationClassifier::new(config.execution.precedence)
            .with_extra_triggers(&config.execution.extra_write_triggers, &config.execution.extra_read_triggers)
            .classify(user_message);
        tracing::info!(category = %category, "classified");
        sink.send(TurnEvent::Classified {
            turn_id: turn_id.to_string(),
            category,
        });
        advance(&mut state, TurnPhase::Planning);

        // PLANNING：本轮只用这一份配置快照
        let settings = config.turn_settings(self.dispatcher.has_tools());
        let plan = plan(category, settings.mode, settings.tools_configured);
        tracing::info!(mode = %settings.mode, passes = plan.passes().len(), tools = settings.tools_configured, "planned");
        sink.send(TurnEvent::Planned {
            mode: settings.mode,
            passes: plan.passes().to_vec(),
            visible_from: plan.visible_from(),
        });
        let mut record = TurnRecord::new(turn_id, user_message, category, plan.clone());
        let tools = if settings.tools_configured {
            self.dispatcher.registry().declarations()
        } else {
            Vec::new()
        };
        let mut messages = Vec::with_capacity(conversation.len() + 2);
        messages.push(Message::system(config.system_prompt()));
        messages.extend(conversation.messages().iter().cloned());
        messages.push(Message::user(user_message));
        advance(&mut state, TurnPhase::Executing);

        // EXECUTING
        let visible_index = plan.visible_from();
        let visible_spec = plan.visible();
        let visible_permit = self.gate.acquire(&cancel).await;
        let side_task = match (&visible_permit, plan.side_effect()) {
            (Some(_), Some((index, spec))) => Some(self.spawn_side_effect(index, spec, &messages, &tools)),
            _ => None,
        };
        let mut visible = match visible_permit {
            Some(_permit) => {
                self.passes
                    .run(
                        PassRequest::new(visible_spec, &messages, &tools)
                            .with_sink(sink)
                            .with_cancel(cancel.clone()),
                    )
                    .await
            }
            None => PassOutcome::failed(
                visible_spec,
                String::new(),
                PassFailure::new(FailureKind::Cancelled, "cancelled before start"),
            ),
        };
        if visible_spec.streaming {
            match &visible.failure {
                None => {
                    sink.send(TurnEvent::MessageDone {
                        text: visible.text.clone(),
                    });
                }
                Some(f) => {
                    sink.send(TurnEvent::Notice {
                        text: format!("[response interrupted: {}]", f.message),
                    });
                }
            }
        }

        // MERGING：可见通道带工具时续写
        let mut ledger = DispatchLedger::new();
        if !visible.is_failed() {
            advance(&mut state, TurnPhase::Merging);
            if visible_spec.tools_enabled && !visible.tool_calls.is_empty() {
                visible = self
                    .continue_with_tools(
                        visible_index,
                        visible,
                        &messages,
                        &tools,
                        settings.max_tool_rounds,
                        &mut ledger,
                        &mut record.tool_results,
                        sink,
                        &cancel,
                    )
                    .await;
            }
        }
        if !visible_spec.streaming {
            if visible.is_failed() {
                notify_failure(sink, &visible);
            } else {
                if !visible.text.is_empty() {
                    sink.send(TurnEvent::TextDelta {
                        text: visible.text.clone(),
                    });
                }
                sink.send(TurnEvent::MessageDone {
                    text: visible.text.clone(),
                });
            }
        }
        record.final_visible_text = visible.text.clone();
        sink.send(TurnEvent::Delivered {
            turn_id: record.turn_id.to_string(),
            success: !visible.is_failed(),
        });

        PendingTurn {
            state,
            record,
            visible_index,
            visible,
            side_task,
            ledger,
            settings,
            dispatcher: self.dispatcher.clone(),
            store: self.store.clone(),
            sink: sink.clone(),
            span,
        }
    }

    fn spawn_side_effect(
        &self,
        index: usize,
        spec: PassSpec,
        messages: &[Message],
        tools: &[ToolDeclaration],
    ) -> SideEffectTask {
        let passes = self.passes.clone();
        let gate = self.gate.clone();
        let messages = messages.to_vec();
        let tools = tools.to_vec();
        let abandon = CancellationToken::new();
        let token = abandon.clone();
        let handle = tokio::spawn(
            async move {
                let Some(_permit) = gate.acquire(&token).await else {
                    return PassOutcome::failed(
                        spec,
                        String::new(),
                        PassFailure::new(FailureKind::Abandoned, "abandoned while queued"),
                    );
                };
                passes
                    .run(PassRequest::new(spec, &messages, &tools).with_cancel(token.clone()))
                    .await
            }
            .instrument(tracing::info_span!("side_effect", pass = index)),
        );
        SideEffectTask {
            index,
            spec,
            handle,
            abandon,
        }
    }

    /// 可见通道带工具时：分发 → 追加结果 → 续写，最多 max_rounds 轮。
    /// 返回最后一次续写的结果，tool_calls 为所有已分发的调用。
    #[allow(clippy::too_many_arguments)]
    async fn continue_with_tools(
        &self,
        index: usize,
        first: PassOutcome,
        messages: &[Message],
        tools: &[ToolDeclaration],
        max_rounds: usize,
        ledger: &mut DispatchLedger,
        results_out: &mut Vec<ToolResult>,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> PassOutcome {
        let spec = first.spec;
        let mut conversation = messages.to_vec();
        let mut dispatched = Vec::new();
        let mut current = first;
        let mut rounds = 0;
        loop {
            let results = self
                .dispatcher
                .dispatch_observed(index, &current.tool_calls, ledger, sink)
                .await;
            results_out.extend(results.iter().cloned());
            if rounds >= max_rounds {
                tracing::warn!(rounds, "Tool round limit reached");
                sink.send(TurnEvent::Notice {
                    text: "[tool round limit reached]".to_string(),
                });
                dispatched.append(&mut current.tool_calls);
                break;
            }
            rounds += 1;
            append_tool_round(&mut conversation, &current.text, &current.tool_calls, &results);
            dispatched.append(&mut current.tool_calls);

            tracing::debug!(round = rounds, "continuation");
            let next = match self.gate.acquire(cancel).await {
                Some(_permit) => {
                    self.passes
                        .run(
                            PassRequest::new(spec, &conversation, tools)
                                .with_sink(sink)
                                .with_cancel(cancel.clone()),
                        )
                        .await
                }
                None => PassOutcome::failed(spec, String::new(), PassFailure::new(FailureKind::Cancelled, "cancelled")),
            };
            current = next;
            if current.is_failed() || current.tool_calls.is_empty() {
                break;
            }
        }
        current.tool_calls = dispatched;
        current
    }
}

/// 可见回复已交付、尚未收尾的一轮
///
/// settle 不借用编排器，可以交给后台任务；调用方因此不必等副作用通道就能提交下一条消息。
pub struct PendingTurn {
    state: TurnState,
    record: TurnRecord,
    visible_index: usize,
    visible: PassOutcome,
    side_task: Option<SideEffectTask>,
    ledger: DispatchLedger,
    settings: TurnSettings,
    dispatcher: ToolDispatcher,
    store: Arc<dyn MemoryStore>,
    sink: EventSink,
    span: Span,
}

impl PendingTurn {
    pub fn turn_id(&self) -> &TurnId {
        &self.record.turn_id
    }

    /// 可见回复是否完整交付；只有交付成功的轮次才能到达 DONE
    pub fn delivered(&self) -> bool {
        !self.visible.is_failed()
    }

    pub fn visible_text(&self) -> &str {
        &self.record.final_visible_text
    }

    /// 交付成功时把本轮问答追加到对话；副作用通道的正文永不进入对话
    pub fn record_exchange(&self, conversation: &mut ConversationMemory) {
        if self.delivered() {
            conversation.push(Message::user(self.record.user_message.clone()));
            conversation.push(Message::assistant(self.record.final_visible_text.clone()));
        }
    }

    /// 等待副作用通道（有上限）、分发其工具调用并提交
    pub async fn settle(self) -> TurnOutcome {
        let span = self.span.clone();
        self.finish_turn().instrument(span).await
    }

    async fn finish_turn(self) -> TurnOutcome {
        let PendingTurn {
            mut state,
            mut record,
            visible_index,
            visible,
            side_task,
            mut ledger,
            settings,
            dispatcher,
            store,
            sink,
            ..
        } = self;

        let side = match side_task {
            Some(task) => Some((task.index, await_side_effect(task, settings.side_effect_timeout).await)),
            None => None,
        };

        // 用户发起的写入不因可见通道失败而丢失
        let visible_failed = visible.is_failed();
        let mut side_effect_ok = true;
        if let Some((index, outcome)) = &side {
            if outcome.is_failed() {
                side_effect_ok = false;
            } else if !outcome.tool_calls.is_empty() {
                tracing::info!(calls = outcome.tool_calls.len(), visible_failed, "Dispatching side-effect calls");
                let results = dispatcher
                    .dispatch_observed(*index, &outcome.tool_calls, &mut ledger, &sink)
                    .await;
                record.tool_results.extend(results);
            }
        }
        record.pass_outcomes = ordered_outcomes(visible_index, visible, side);

        if visible_failed {
            // 续写失败时已在 MERGING，经 COMMITTING 进入 FAILED
            if state.phase() == TurnPhase::Merging {
                advance(&mut state, TurnPhase::Committing);
            }
            advance(&mut state, TurnPhase::Failed);
            return finish(state, record, Vec::new(), &sink);
        }
        advance(&mut state, TurnPhase::Committing);

        // COMMITTING
        let mut warnings = Vec::new();
        if side_effect_ok {
            let committed = match timeout(settings.commit_timeout, store.commit(&record.turn_id, &record)).await {
                Ok(r) => r,
                Err(_) => Err(MemoryStoreError::Timeout),
            };
            match committed {
                Ok(status) => {
                    record.committed = true;
                    tracing::info!(status = ?status, "turn committed");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Memory commit failed");
                    let message = format!("memory commit failed: {}", e);
                    sink.send(TurnEvent::CommitWarning {
                        message: message.clone(),
                    });
                    warnings.push(message);
                }
            }
        } else {
            tracing::warn!("Side-effect pass failed, commit skipped");
        }
        advance(&mut state, TurnPhase::Done);
        finish(state, record, warnings, &sink)
    }
}

async fn await_side_effect(task: SideEffectTask, limit: Duration) -> PassOutcome {
    let SideEffectTask {
        spec,
        mut handle,
        abandon,
        ..
    } = task;
    match timeout(limit, &mut handle).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => {
            tracing::error!(error = %e, "Side-effect task did not complete");
            PassOutcome::failed(
                spec,
                String::new(),
                PassFailure::new(FailureKind::Abandoned, format!("side-effect task failed: {}", e)),
            )
        }
        Err(_) => {
            abandon.cancel();
            handle.abort();
            tracing::warn!(timeout_secs = limit.as_secs(), "Side-effect pass abandoned");
            PassOutcome::failed(
                spec,
                String::new(),
                PassFailure::new(FailureKind::Abandoned, format!("no result within {}s", limit.as_secs())),
            )
        }
    }
}

fn advance(state: &mut TurnState, next: TurnPhase) {
    if let Err(e) = state.advance(next) {
        tracing::error!(error = %e, "Turn state machine rejected transition");
    }
}

fn notify_failure(sink: &EventSink, outcome: &PassOutcome) {
    if let Some(f) = &outcome.failure {
        sink.send(TurnEvent::Notice {
            text: format!("[error: {}]", f.message),
        });
    }
}

/// 按计划中的下标排列通道结果
fn ordered_outcomes(visible_index: usize, visible: PassOutcome, side: Option<(usize, PassOutcome)>) -> Vec<PassOutcome> {
    let mut outcomes = vec![visible];
    if let Some((index, outcome)) = side {
        if index < visible_index {
            outcomes.insert(0, outcome);
        } else {
            outcomes.push(outcome);
        }
    }
    outcomes
}

fn finish(state: TurnState, mut record: TurnRecord, warnings: Vec<String>, sink: &EventSink) -> TurnOutcome {
    record.finished_at = Some(Utc::now());
    tracing::info!(
        phase = ?state.phase(),
        committed = record.committed,
        tool_results = record.tool_results.len(),
        "turn finished"
    );
    sink.send(TurnEvent::TurnFinished {
        turn_id: record.turn_id.to_string(),
        phase: state.phase(),
        committed: record.committed,
    });
    TurnOutcome {
        phase: state.phase(),
        trail: state.trail().to_vec(),
        record,
        warnings,
    }
}

/// 会话命令
#[derive(Debug, Clone)]
pub enum Command {
    /// 提交用户输入，开始一轮
    Submit(String),
    /// 取消当前轮的可见输出
    Cancel,
    /// 清空对话历史（长期记忆保留）
    Clear,
    /// 重新读取配置
    Reload,
    /// 切换执行模式（下一轮生效）
    SetMode(ExecutionMode),
    Quit,
}

/// 启动会话：返回命令发送端、事件接收端与后台任务句柄
///
/// 可见回复交付后即可处理下一条命令，本轮的副作用收尾在后台继续（以 TurnFinished 结束）。
/// 可见通道进行中收到的 Cancel / Quit 立即生效，其余命令排队到交付之后按序处理。
/// 会话退出前等待所有收尾任务完成。
pub fn spawn_session(
    orchestrator: Arc<TurnOrchestrator>,
) -> (
    mpsc::UnboundedSender<Command>,
    mpsc::UnboundedReceiver<TurnEvent>,
    JoinHandle<()>,
) {
    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<Command>();
    let (sink, event_rx) = EventSink::channel();
    let max_turns = orchestrator.config().current().app.max_context_turns;

    let handle = tokio::spawn(async move {
        let supervisor = SessionSupervisor::new();
        let mut conversation = ConversationMemory::new(max_turns);
        let mut backlog: VecDeque<Command> = VecDeque::new();
        let mut settling: JoinSet<TurnOutcome> = JoinSet::new();

        loop {
            let cmd = match backlog.pop_front() {
                Some(cmd) => cmd,
                None => tokio::select! {
                    Some(joined) = settling.join_next() => {
                        log_settled(joined);
                        continue;
                    }
                    cmd = cmd_rx.recv() => match cmd {
                        Some(cmd) => cmd,
                        None => break,
                    },
                },
            };
            match cmd {
                Command::Submit(input) => {
                    let token = supervisor.begin_turn();
                    let pending = {
                        let start = orchestrator.start_turn(&conversation, &input, &sink, token);
                        tokio::pin!(start);
                        let mut commands_open = true;
                        loop {
                            tokio::select! {
                                pending = &mut start => break pending,
                                cmd = cmd_rx.recv(), if commands_open => match cmd {
                                    Some(Command::Cancel) => supervisor.cancel(),
                                    Some(Command::Quit) => {
                                        supervisor.cancel();
                                        backlog.push_back(Command::Quit);
                                    }
                                    Some(other) => backlog.push_back(other),
                                    None => {
                                        supervisor.cancel();
                                        commands_open = false;
                                        backlog.push_back(Command::Quit);
                                    }
                                }
                            }
                        }
                    };
                    pending.record_exchange(&mut conversation);
                    settling.spawn(pending.settle());
                }
                Command::Cancel => {}
                Command::Clear => {
                    conversation.clear();
                    sink.send(TurnEvent::Notice {
                        text: "conversation cleared".to_string(),
                    });
                }
                Command::Reload => {
                    let text = match orchestrator.config().reload() {
                        Ok(c) => format!("config reloaded (mode = {}, tools = {})", c.execution.mode, c.tools.enabled),
                        Err(e) => format!("config reload failed, keeping previous config: {}", e),
                    };
                    sink.send(TurnEvent::Notice { text });
                }
                Command::SetMode(mode) => {
                    orchestrator.config().set_mode(mode);
                    tracing::info!(mode = %mode, "Execution mode changed");
                    sink.send(TurnEvent::Notice {
                        text: format!("execution mode = {}", mode),
                    });
                }
                Command::Quit => break,
            }
        }
        supervisor.shutdown();
        while let Some(joined) = settling.join_next().await {
            log_settled(joined);
        }
        tracing::info!("Session closed");
    });

    (cmd_tx, event_rx, handle)
}

fn log_settled(joined: Result<TurnOutcome, JoinError>) {
    match joined {
        Ok(outcome) => tracing::debug!(
            turn_id = %outcome.turn_id(),
            phase = ?outcome.phase,
            committed = outcome.record.committed,
            "turn settled"
        ),
        Err(e) => tracing::error!(error = %e, "Turn settle task failed"),
    }
}
