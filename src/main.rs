use anyhow::Result;
use mirrorsync_lib::config::SyncSettings;
use mirrorsync_lib::core::engine::{RunStatus, SyncConfig, SyncEngine};
use mirrorsync_lib::core::scanner::{LocalScanner, ScanConfig};
use mirrorsync_lib::logging;
use mirrorsync_lib::remote::auth::ClientCredentials;
use mirrorsync_lib::remote::GraphStore;
use mirrorsync_lib::render::{CommandRenderer, DocumentRenderer};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let settings = match SyncSettings::from_args(&args) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("配置错误: {:#}", e);
            std::process::exit(1);
        }
    };

    let _log_guard = logging::init(settings.debug, settings.debug_metadata);

    match run(settings).await {
        Ok(exit_code) => std::process::exit(exit_code),
        Err(e) => {
            // 致命错误: 不输出部分报告,直接以非零码退出
            error!("致命错误: {:#}", e);
            std::process::exit(1);
        }
    }
}

async fn run(settings: SyncSettings) -> Result<i32> {
    info!("目标站点: {}", settings.site_url());

    // 本地发现先行,空集在发起任何远端调用之前就报错
    let scanner = LocalScanner::new(ScanConfig {
        pattern: settings.source_pattern.clone(),
        recursive: settings.recursive,
        exclude_patterns: settings.exclude_patterns.clone(),
        render_documents: settings.render_documents,
    });
    let entries = scanner.scan()?;
    if entries.is_empty() {
        anyhow::bail!(
            "选择模式没有匹配到任何本地文件: {}",
            settings.source_pattern
        );
    }

    let tokens = Arc::new(ClientCredentials::new(&settings));
    let store = Arc::new(GraphStore::connect(&settings, tokens).await?);

    let renderer: Option<Arc<dyn DocumentRenderer>> = settings
        .render_documents
        .then(|| Arc::new(CommandRenderer::from_env()) as Arc<dyn DocumentRenderer>);

    let engine = SyncEngine::new(store, renderer, SyncConfig::from_settings(&settings));
    let report = engine.run(entries).await?;

    // 结构化报告走标准输出,供流水线消费
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(if report.status == RunStatus::Failed { 1 } else { 0 })
}
