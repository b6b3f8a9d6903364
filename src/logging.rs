//! 日志初始化

use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// 初始化全局日志,返回的 guard 保证进程退出前刷完缓冲
pub fn init(debug: bool, debug_metadata: bool) -> tracing_appender::non_blocking::WorkerGuard {
    let level = if debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    let mut filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse().unwrap())
        .add_directive("reqwest=warn".parse().unwrap());
    if debug_metadata {
        // 元数据细节单独开关,远端模块放到 trace
        filter = filter.add_directive("mirrorsync_lib::remote=trace".parse().unwrap());
    }

    // 日志走标准错误,标准输出留给结构化报告
    let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false);

    let subscriber = tracing_subscriber::registry().with(filter).with(layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
    guard
}
