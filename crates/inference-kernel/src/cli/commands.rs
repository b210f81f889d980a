//! CLI 命令定义
//!
//! 使用 clap derive 宏定义命令行接口结构。

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// 推理内核命令行工具
#[derive(Parser, Debug)]
#[command(name = "inference-kernel")]
#[command(version, about = "前向链式规则推理内核")]
#[command(propagate_version = true)]
pub struct Cli {
    /// 日志级别 (trace, debug, info, warn, error)，覆盖配置文件
    #[arg(short, long)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// 子命令枚举
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 运行推理
    ///
    /// 结果以 JSON 输出到 stdout，失败停机时退出码非零。
    Run(RunArgs),

    /// 校验规则文件
    Check {
        /// 规则文件（JSON 数组或单条规则）
        #[arg(short, long)]
        rules: PathBuf,
    },

    /// 输出单条规则的评估追踪
    Explain(ExplainArgs),
}

/// run 子命令参数
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// 规则文件（JSON 数组或单条规则）
    #[arg(short, long)]
    pub rules: PathBuf,

    /// 初始事实文件（JSON 对象，键为事实键）
    #[arg(short, long)]
    pub facts: PathBuf,

    /// 外部变量文件（JSON 对象）
    #[arg(short, long)]
    pub bindings: Option<PathBuf>,

    /// 触发模式：first 或 all
    #[arg(short, long)]
    pub mode: Option<String>,

    /// 最大循环次数
    #[arg(long)]
    pub max_iterations: Option<u64>,

    /// 截止时间（毫秒）
    #[arg(long)]
    pub deadline_ms: Option<u64>,

    /// 把每轮循环事件写入日志
    #[arg(long)]
    pub trace: bool,
}

/// explain 子命令参数
#[derive(Args, Debug, Clone)]
pub struct ExplainArgs {
    /// 规则文件（JSON 数组或单条规则）
    #[arg(short, long)]
    pub rules: PathBuf,

    /// 事实文件（JSON 对象）
    #[arg(short, long)]
    pub facts: PathBuf,

    /// 外部变量文件（JSON 对象）
    #[arg(short, long)]
    pub bindings: Option<PathBuf>,

    /// 要评估的规则 ID
    #[arg(long)]
    pub rule_id: String,
}
