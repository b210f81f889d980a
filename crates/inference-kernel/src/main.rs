//! 推理内核命令行入口
//!
//! 日志写到 stderr，运行结果以 JSON 写到 stdout。

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use inference_kernel::cli::{Cli, CommandRunner, Commands};
use kernel_shared::config::AppConfig;
use kernel_shared::observability;
use tracing::info;

const SERVICE_NAME: &str = "inference-kernel";

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("错误: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<ExitCode> {
    let cli = Cli::parse();

    // 配置加载失败时使用默认配置
    let mut config = AppConfig::load(SERVICE_NAME).unwrap_or_else(|e| {
        eprintln!("Failed to load config, using defaults: {}", e);
        AppConfig::default()
    });
    if let Some(level) = &cli.log_level {
        config.observability.log_level = level.clone();
    }

    let obs_config = config.observability.clone().with_service_name(SERVICE_NAME);
    observability::init(&obs_config)?;

    info!(environment = %config.environment, "配置加载完成");
    let runner = CommandRunner::new(config.engine.clone());

    match cli.command {
        Commands::Run(args) => {
            let outcome = runner.run(&args)?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(if outcome.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(2)
            })
        }
        Commands::Check { rules } => {
            let report = runner.check(&rules)?;
            for rule_id in &report.valid {
                println!("ok     {}", rule_id);
            }
            for (rule_id, err) in &report.invalid {
                println!("failed {} [{}] {}", rule_id, err.code(), err);
            }
            Ok(if report.is_valid() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Commands::Explain(args) => {
            let evaluation = runner.explain(&args)?;
            for line in &evaluation.trace {
                println!("{}", line);
            }
            println!("=> {:?}", evaluation.outcome);
            Ok(ExitCode::SUCCESS)
        }
    }
}
