//! # Inspect CLI
//!
//! 多工位检测产线命令行工具。
//!
//! ```bash
//! # 生成默认 7 工位布局
//! inspect-cli config init --output stations.toml
//!
//! # 校验布局文件
//! inspect-cli config check stations.toml
//!
//! # 用 Mock I/O 和合成相机仿真运行产线（Ctrl-C 停止）
//! inspect-cli run --stations stations.toml --fail-rate 0.05
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod simulation;

use commands::{ConfigCommand, RunCommand};

/// 默认日志过滤（可被 RUST_LOG 覆盖）
const DEFAULT_LOG_FILTER: &str = "inspect_cli=info,inspect_driver=info";

/// Inspect CLI - 多工位检测产线命令行工具
#[derive(Parser, Debug)]
#[command(name = "inspect-cli")]
#[command(about = "Run and configure multi-station inspection lines", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 工位布局文件管理
    #[command(subcommand)]
    Config(ConfigCommand),

    /// 仿真运行产线
    Run {
        #[command(flatten)]
        args: RunCommand,
    },
}

fn main() -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Config(cmd) => cmd.execute(),
        Commands::Run { args } => args.execute(),
    }
}
