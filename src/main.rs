//! Honeycomb - Rust 分层记忆服务
//!
//! 入口：初始化日志、加载并校验配置、构造 MemoryService，启动空闲清扫；
//! `--demo` 运行一段脚本对话，否则等待 Ctrl+C / SIGTERM 后持久化会话池并退出。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use honeycomb::config::{build_backends, load_config};
use honeycomb::core::{PoolCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason};
use honeycomb::memory::Role;
use honeycomb::{observability, MemoryService, RestoreMode, ServiceSettings};

const DEMO_USER: &str = "demo-user";

const DEMO_TURNS: &[(Role, &str)] = &[
    (Role::User, "Hi! I want to plan a trip to Japan next spring."),
    (Role::Assistant, "Great idea. Which cities are you considering?"),
    (Role::User, "I love Kyoto, and I prefer quiet ryokans over big hotels."),
    (Role::Assistant, "Noted. Kyoto ryokans book early for cherry blossom season."),
    (Role::User, "My goal is to keep the whole trip under 3000 dollars."),
    (Role::Assistant, "That is doable with a JR pass and mid-range stays."),
];

struct Args {
    config: Option<PathBuf>,
    demo: bool,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = Args {
        config: None,
        demo: false,
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--demo" => args.demo = true,
            "--config" => {
                let path = iter.next().context("--config requires a path")?;
                args.config = Some(PathBuf::from(path));
            }
            other => anyhow::bail!("unknown argument: {other} (expected --demo or --config <path>)"),
        }
    }
    Ok(args)
}

async fn run_demo(service: &MemoryService) -> anyhow::Result<()> {
    let resolved = service
        .resolve_session(DEMO_USER, None, RestoreMode::Auto)
        .await?;
    let session_id = resolved.session_id;
    tracing::info!(session_id = %session_id, "demo session started");

    for (role, content) in DEMO_TURNS {
        let outcome = service
            .append_turn(DEMO_USER, &session_id, *role, content)
            .await?;
        tracing::info!(?outcome, "turn appended");
    }
    println!("{}\n", service.get_context(DEMO_USER, &session_id).await?);

    let report = service.end_session(DEMO_USER, &session_id).await?;
    println!("Session summary: {}", report.summary.summary);
    for insight in &report.insights {
        println!("  [{}] {}", insight.category, insight.insight_text);
    }

    let outcome = service.run_longterm_reflection(DEMO_USER).await?;
    tracing::info!(updated = outcome.updated, consumed = outcome.consumed, "long-term reflection");
    if let Some(profile) = service.longterm_profile(DEMO_USER).await? {
        println!("\nLong-term profile:\n{}", profile.insight_text);
    }

    let answer = service
        .search_memory(DEMO_USER, &session_id, "where does the user like to stay", 3)
        .await?;
    println!("\n{}", answer.answer);
    println!("\nPool: {:?}", service.pool_stats());
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();
    let args = parse_args()?;

    let cfg = load_config(args.config).context("Failed to load config")?;
    cfg.validate().context("Invalid config")?;
    let backends = build_backends(&cfg)
        .await
        .context("Failed to build backends")?;
    let service = MemoryService::new(backends, ServiceSettings::from(&cfg))
        .context("Invalid memory settings")?;

    let manager = Arc::new(ShutdownManager::new());
    let sweeper = service.spawn_sweeper(manager.token());
    let mut coordinator = ShutdownCoordinator::new(manager.clone());
    coordinator.register(PoolCleanup::new(service.pool().clone()));

    if args.demo {
        run_demo(&service).await.context("Demo failed")?;
        manager.shutdown(ShutdownReason::Completed);
    } else {
        manager.install_signal_handlers();
        tracing::info!("honeycomb memory service running, press Ctrl+C to stop");
        manager.wait_for_shutdown().await;
    }

    coordinator.run_cleanup().await;
    sweeper.await.context("Sweeper task panicked")?;
    Ok(())
}
