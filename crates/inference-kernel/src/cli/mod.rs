//! CLI 模块
//!
//! 提供命令行接口，支持以下功能：
//!
//! - `run` - 加载规则和初始事实，运行推理并输出结果
//! - `check` - 校验规则文件，逐条报告注册错误
//! - `explain` - 输出单条规则对给定事实的评估追踪
//!
//! # 使用示例
//!
//! ```bash
//! # 全匹配模式运行，最多 50 轮
//! inference-kernel run -r rules.json -f facts.json --mode all --max-iterations 50
//!
//! # 校验规则
//! inference-kernel check -r rules.json
//!
//! # 查看某条规则为何不匹配
//! inference-kernel explain -r rules.json -f facts.json --rule-id fever
//! ```

pub mod commands;
pub mod runner;

pub use commands::{Cli, Commands, ExplainArgs, RunArgs};
pub use runner::{CheckReport, CommandRunner};
