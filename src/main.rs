//! Duopass - 命令行入口
//!
//! 初始化日志、按配置组装编排器，读取 stdin 逐行提交，把可见回复流式打印到 stdout。
//! 命令：/mode <mode>、/reload、/clear、/cancel、/quit；Ctrl+C 取消当前轮。

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use duopass::agent::create_orchestrator;
use duopass::config::{AppConfig, ConfigHandle};
use duopass::core::orchestrator::{spawn_session, Command};
use duopass::{ExecutionMode, TurnEvent};
use tokio::io::{AsyncBufReadExt, BufReader};

fn prompt() {
    print!("> ");
    let _ = std::io::stdout().flush();
}

/// 解析一行输入；None 表示需要本地处理的无效命令（已打印提示）
fn parse_line(line: &str) -> Option<Command> {
    let line = line.trim();
    match line.split_once(' ').map(|(c, rest)| (c, rest.trim())).unwrap_or((line, "")) {
        ("/quit" | "/exit", _) => Some(Command::Quit),
        ("/reload", _) => Some(Command::Reload),
        ("/clear", _) => Some(Command::Clear),
        ("/cancel", _) => Some(Command::Cancel),
        ("/mode", arg) => match arg.parse::<ExecutionMode>() {
            Ok(mode) => Some(Command::SetMode(mode)),
            Err(e) => {
                println!("{} (expected single_pass | dual_pass_write_only | dual_pass_all)", e);
                None
            }
        },
        _ => Some(Command::Submit(line.to_string())),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let (config, load_error) = match ConfigHandle::load(config_path) {
        Ok(c) => (c, None),
        Err(e) => (ConfigHandle::new(AppConfig::default()), Some(e)),
    };
    duopass::observability::init(config.current().app.log_level.as_deref());
    if let Some(e) = load_error {
        tracing::warn!("Config load failed ({}), using defaults", e);
    }

    let orchestrator = Arc::new(
        create_orchestrator(config.clone())
            .await
            .context("Failed to create orchestrator")?,
    );
    let (cmd_tx, mut event_rx, session) = spawn_session(orchestrator);

    // 事件打印：只有可见回复写 stdout
    let printer = tokio::spawn(async move {
        let mut in_turn = false;
        while let Some(event) = event_rx.recv().await {
            match event {
                TurnEvent::Classified { .. } => in_turn = true,
                TurnEvent::TextDelta { text } => {
                    print!("{}", text);
                    let _ = std::io::stdout().flush();
                }
                TurnEvent::MessageDone { .. } => println!(),
                TurnEvent::Notice { text } => {
                    println!("{}", text);
                    if !in_turn {
                        prompt();
                    }
                }
                TurnEvent::CommitWarning { message } => eprintln!("warning: {}", message),
                // 副作用收尾在后台进行，交付后即可输入下一条
                TurnEvent::Delivered { .. } => {
                    in_turn = false;
                    prompt();
                }
                TurnEvent::Planned { .. }
                | TurnEvent::ToolCall { .. }
                | TurnEvent::ToolResult { .. }
                | TurnEvent::TurnFinished { .. } => {}
            }
        }
    });

    println!(
        "duopass (mode = {}). /mode <mode>, /reload, /clear, /cancel, /quit",
        config.current().execution.mode
    );
    prompt();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                if line.trim().is_empty() {
                    prompt();
                    continue;
                }
                let Some(cmd) = parse_line(&line) else {
                    prompt();
                    continue;
                };
                let quit = matches!(cmd, Command::Quit);
                if cmd_tx.send(cmd).is_err() || quit {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                let _ = cmd_tx.send(Command::Cancel);
            }
        }
    }

    let _ = cmd_tx.send(Command::Quit);
    drop(cmd_tx);
    session.await.context("Session task failed")?;
    printer.await.context("Printer task failed")?;
    Ok(())
}
