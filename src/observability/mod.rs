//! 可观测性：tracing 订阅器初始化
//!
//! 优先级：RUST_LOG > 配置中的 [app].log_level > info。日志写到 stderr，stdout 留给回复正文。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init(log_level: Option<&str>) {
    let fallback = log_level.filter(|l| !l.trim().is_empty()).unwrap_or("info");
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
