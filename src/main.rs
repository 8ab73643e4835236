//! Beecode - Rust 编码助手
//!
//! 入口：解析命令行、初始化日志、构建引擎；默认启动 TUI，`beecode run "<prompt>"` 为单次 CLI 会话。

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use beecode::{
    cli,
    core::{create_agent, create_agent_builder, AgentBuilder},
    engine::SessionOutcome,
    observability::{self, LogTarget},
    ui::run_app,
};
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "beecode")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Workspace root (defaults to [app].workspace_root or the current directory)
    #[arg(short, long, global = true)]
    workspace: Option<PathBuf>,

    /// Turns before a checkpoint is taken
    #[arg(long, global = true)]
    turns_limit: Option<u32>,

    /// Restore the saved checkpoint before the first turn
    #[arg(long, global = true)]
    resume: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Interactive terminal UI (default)
    Tui,
    /// Run a single prompt to completion and print the answer
    Run {
        prompt: String,
        /// Approve every tool call that would need confirmation
        #[arg(short, long)]
        yes: bool,
    },
}

fn builder_from(cli: &Cli) -> AgentBuilder {
    let mut builder = create_agent_builder(cli.config.as_deref(), cli.workspace.clone());
    if let Some(limit) = cli.turns_limit {
        builder = builder.with_turns_limit(limit);
    }
    if cli.resume {
        builder = builder.with_restore_on_start(true);
    }
    builder
}

fn run_cli(cli: &Cli, prompt: &str, yes: bool) -> anyhow::Result<ExitCode> {
    observability::init(LogTarget::Stderr)?;
    let builder = builder_from(cli);
    match cli::run_once(&builder, prompt, yes) {
        Ok(SessionOutcome::Cancelled) => Ok(ExitCode::from(130)),
        Ok(outcome) => {
            println!("{}", outcome.answer().unwrap_or_default());
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            eprintln!("beecode: {e}");
            Ok(ExitCode::FAILURE)
        }
    }
}

fn run_tui(cli: &Cli) -> anyhow::Result<ExitCode> {
    let builder = builder_from(cli);
    observability::init(LogTarget::File(
        builder.workspace().join(".beecode").join("beecode.log"),
    ))?;

    // 单线程运行时：会话任务与 UI 协作式交替推进
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start runtime")?;
    runtime.block_on(async move {
        let (cmd_tx, state_rx) = create_agent(builder);
        run_app(state_rx, cmd_tx).await.context("App run failed")
    })?;
    Ok(ExitCode::SUCCESS)
}

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    match &cli.command {
        Some(Command::Run { prompt, yes }) => run_cli(&cli, prompt, *yes),
        Some(Command::Tui) | None => run_tui(&cli),
    }
}
