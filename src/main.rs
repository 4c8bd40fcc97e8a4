//! Hive - Rust 编码助手编排引擎
//!
//! 入口：解析命令行、加载配置、初始化日志，然后进入交互模式或 eval 模式。

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use hive::config::load_config;
use hive::core::{resolve_workspace, OrchestratorBuilder, RunReport, TaskStatus};
use hive::hitl::AutoApprove;
use hive::observability;
use hive::ui::{run_eval, ConsoleApproval, ConsoleNotifier, EvalNotifier};

#[derive(Parser, Debug)]
#[command(name = "hive", version, about = "Plan, execute and debug coding tasks with an LLM")]
struct Cli {
    /// 要完成的请求（交互模式）
    request: Option<String>,

    /// 额外的 TOML 配置文件
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 从 stdin 读 {"prompt", "working_dir"}，向 stdout 输出 NDJSON
    #[arg(long, default_value_t = false)]
    eval: bool,

    /// 自动批准所有工具调用与计划
    #[arg(short = 'y', long, default_value_t = false)]
    yes: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    observability::init();

    let config = load_config(cli.config.clone()).context("Failed to load configuration")?;

    if cli.eval {
        let mut input = String::new();
        std::io::stdin()
            .read_to_string(&mut input)
            .context("Failed to read eval input from stdin")?;
        let success = run_eval(&input, config, Arc::new(EvalNotifier::stdout())).await;
        std::process::exit(if success { 0 } else { 1 });
    }

    let request = cli
        .request
        .context("No request given; pass it as an argument or use --eval")?;

    let workspace = resolve_workspace(&config);
    let mut builder = OrchestratorBuilder::new(config, workspace).with_notifier(Arc::new(ConsoleNotifier));
    builder = if cli.yes {
        builder.with_approval(Arc::new(AutoApprove))
    } else {
        builder.with_approval(Arc::new(ConsoleApproval))
    };
    let orchestrator = builder.build().context("Failed to build orchestrator")?;

    let cancel = orchestrator.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling run");
            cancel.cancel();
        }
    });

    let report = orchestrator.run(&request).await.context("Run failed")?;
    print_report(&report);

    if !report.summary.success {
        std::process::exit(1);
    }
    Ok(())
}

fn print_report(report: &RunReport) {
    let s = &report.summary;
    println!();
    for task in &report.tasks {
        let mark = match task.status {
            TaskStatus::Completed => "ok",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Pending => "skipped",
            TaskStatus::InProgress => "interrupted",
        };
        println!("[{mark}] {}: {}", task.id, task.title);
        if let Some(reason) = &task.failure_reason {
            println!("       reason: {reason}");
        } else if let Some(result) = &task.result {
            println!("       {}", result.lines().next().unwrap_or_default());
        }
    }
    println!(
        "\n{}/{} tasks completed, {} failed, {} ms{}",
        s.completed_tasks,
        s.total_tasks,
        s.failed_tasks,
        s.duration_ms,
        if report.cancelled { " (cancelled)" } else { "" }
    );
}
