//! 命令执行器
//!
//! 负责执行各 CLI 子命令的具体逻辑：读取规则和事实文件、构建规则库和引擎。

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use kernel_shared::config::EngineSettings;
use serde_json::Value;
use tracing::{info, warn};

use super::commands::{ExplainArgs, RunArgs};
use crate::engine::{Engine, EngineConfig, FiringMode, RunOptions, RunOutcome};
use crate::error::RuleError;
use crate::facts::FactStore;
use crate::matcher::MatchEvaluation;
use crate::models::{Bindings, Rule};
use crate::registry::FunctionRegistry;
use crate::store::RuleBase;

/// 规则文件校验结果
#[derive(Debug, Default)]
pub struct CheckReport {
    pub valid: Vec<String>,
    pub invalid: Vec<(String, RuleError)>,
}

impl CheckReport {
    pub fn is_valid(&self) -> bool {
        self.invalid.is_empty()
    }
}

/// 命令执行器
pub struct CommandRunner {
    settings: EngineSettings,
    functions: FunctionRegistry,
}

impl CommandRunner {
    /// 创建命令执行器，注册内置宿主函数
    pub fn new(settings: EngineSettings) -> Self {
        Self {
            settings,
            functions: builtin_functions(),
        }
    }

    /// 替换 `$call` 可用的宿主函数
    pub fn with_functions(mut self, functions: FunctionRegistry) -> Self {
        self.functions = functions;
        self
    }

    /// 配置文件设置叠加命令行参数
    pub fn engine_config(&self, args: &RunArgs) -> Result<EngineConfig> {
        let mut config = EngineConfig::from_settings(&self.settings).context("引擎配置无效")?;

        if let Some(mode) = &args.mode {
            config.mode = FiringMode::parse(mode)?;
        }
        if let Some(max_iterations) = args.max_iterations {
            config.max_iterations = max_iterations;
        }
        if let Some(deadline_ms) = args.deadline_ms {
            config.deadline = Some(Duration::from_millis(deadline_ms));
        }
        if args.trace {
            config.trace = true;
        }

        Ok(config)
    }

    /// 执行 run 命令
    pub fn run(&self, args: &RunArgs) -> Result<RunOutcome> {
        let config = self.engine_config(args)?;
        let (rules, report) = load_rule_base(&args.rules)?;
        for (rule_id, err) in &report.invalid {
            warn!(rule_id = %rule_id, error = %err, "规则注册失败，已跳过");
        }

        let facts = read_facts(&args.facts)?;
        let bindings = read_bindings(args.bindings.as_deref())?;

        info!(
            rules = rules.len(),
            facts = facts.len(),
            mode = ?config.mode,
            "开始推理"
        );

        let mut options = RunOptions::from_config(&config);
        options.bindings = bindings;

        let mut engine = Engine::new(rules, config).with_functions(self.functions.clone());
        Ok(engine.run(facts, options))
    }

    /// 执行 check 命令
    pub fn check(&self, rules: &Path) -> Result<CheckReport> {
        let (_, report) = load_rule_base(rules)?;
        Ok(report)
    }

    /// 执行 explain 命令
    pub fn explain(&self, args: &ExplainArgs) -> Result<MatchEvaluation> {
        let (rules, report) = load_rule_base(&args.rules)?;
        if let Some((_, err)) = report.invalid.iter().find(|(id, _)| id == &args.rule_id) {
            bail!("规则 {} 注册失败: {}", args.rule_id, err);
        }

        let facts = read_facts(&args.facts)?;
        let bindings = read_bindings(args.bindings.as_deref())?;
        let engine = Engine::new(rules, EngineConfig::from_settings(&self.settings)?);
        Ok(engine.explain(&args.rule_id, &facts, &bindings)?)
    }
}

/// 内置宿主函数：`log` 记录绑定变量，`now` 返回当前 UTC 时间
fn builtin_functions() -> FunctionRegistry {
    let mut functions = FunctionRegistry::new();
    functions.register_fn("log", |bindings: &Bindings| {
        info!(bindings = ?bindings, "规则调用 log");
        Ok(None)
    });
    functions.register_fn("now", |_: &Bindings| {
        Ok(Some(Value::String(chrono::Utc::now().to_rfc3339())))
    });
    functions
}

/// 解析规则文件，每条规则单独解析以便逐条报告错误
pub fn parse_rules(json: &str) -> Result<Vec<(String, std::result::Result<Rule, RuleError>)>> {
    let value: Value = serde_json::from_str(json).context("规则文件不是合法的 JSON")?;
    let items = match value {
        Value::Array(items) => items,
        single @ Value::Object(_) => vec![single],
        _ => bail!("规则文件必须是规则对象或规则数组"),
    };

    Ok(items
        .into_iter()
        .enumerate()
        .map(|(index, item)| {
            let label = item
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("#{}", index));
            (label, serde_json::from_value::<Rule>(item).map_err(RuleError::from))
        })
        .collect())
}

/// 读取规则文件并注册到新的规则库
fn load_rule_base(path: &Path) -> Result<(RuleBase, CheckReport)> {
    let json = fs::read_to_string(path).with_context(|| format!("无法读取规则文件 {}", path.display()))?;
    let rules = RuleBase::new();
    let mut report = CheckReport::default();

    for (label, parsed) in parse_rules(&json)? {
        match parsed.and_then(|rule| rules.add(rule)) {
            Ok(()) => report.valid.push(label),
            Err(err) => report.invalid.push((label, err)),
        }
    }

    Ok((rules, report))
}

fn read_facts(path: &Path) -> Result<FactStore> {
    let json = fs::read_to_string(path).with_context(|| format!("无法读取事实文件 {}", path.display()))?;
    Ok(FactStore::from_json(&json)?)
}

fn read_bindings(path: Option<&Path>) -> Result<Bindings> {
    let Some(path) = path else {
        return Ok(Bindings::new());
    };
    let json = fs::read_to_string(path).with_context(|| format!("无法读取变量文件 {}", path.display()))?;
    serde_json::from_str(&json).context("变量文件必须是 JSON 对象")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::HaltReason;
    use serde_json::json;
    use tempfile::tempdir;

    fn fever_rules() -> Value {
        json!([
            {
                "id": "fever",
                "condition": {
                    "type": "group",
                    "operator": "AND",
                    "children": [
                        {"type": "condition", "field": "patient.temperature", "operator": "gt", "value": 100},
                        {"type": "not", "child": {"type": "condition", "field": "patient.alert", "operator": "exists"}}
                    ]
                },
                "actions": [{"$set": {"target": "patient.alert", "value": "fever"}}]
            },
            {
                "id": "broken",
                "condition": {"type": "condition", "field": "patient.temperature", "operator": "roughly", "value": 1}
            },
            {
                "condition": {"type": "condition", "field": "patient.temperature", "operator": "gt"}
            }
        ])
    }

    fn run_args(dir: &Path) -> RunArgs {
        fs::write(dir.join("rules.json"), fever_rules().to_string()).unwrap();
        fs::write(dir.join("facts.json"), json!({"patient": {"temperature": 105}}).to_string()).unwrap();
        RunArgs {
            rules: dir.join("rules.json"),
            facts: dir.join("facts.json"),
            bindings: None,
            mode: None,
            max_iterations: None,
            deadline_ms: None,
            trace: false,
        }
    }

    #[test]
    fn test_run_skips_invalid_rules() {
        let dir = tempdir().unwrap();
        let runner = CommandRunner::new(EngineSettings::default());

        let outcome = runner.run(&run_args(dir.path())).unwrap();

        assert_eq!(outcome.halt_reason, HaltReason::Completed);
        assert_eq!(outcome.fired_ids(), vec!["fever"]);
        assert_eq!(outcome.final_facts.get("patient").unwrap()["alert"], json!("fever"));
    }

    #[test]
    fn test_check_reports_each_rule() {
        let dir = tempdir().unwrap();
        let args = run_args(dir.path());
        let report = CommandRunner::new(EngineSettings::default()).check(&args.rules).unwrap();

        assert_eq!(report.valid, vec!["fever"]);
        assert_eq!(report.invalid.len(), 2);
        assert_eq!(report.invalid[0].0, "broken");
        assert_eq!(report.invalid[0].1.code(), "CONDITION_SYNTAX_ERROR");
        assert_eq!(report.invalid[1].0, "#2");
        assert_eq!(report.invalid[1].1.code(), "PARSE_ERROR");
        assert!(!report.is_valid());
    }

    #[test]
    fn test_cli_overrides_settings() {
        let dir = tempdir().unwrap();
        let mut args = run_args(dir.path());
        args.mode = Some("all".to_string());
        args.max_iterations = Some(3);
        args.deadline_ms = Some(100);

        let config = CommandRunner::new(EngineSettings::default()).engine_config(&args).unwrap();
        assert_eq!(config.mode, FiringMode::AllMatch);
        assert_eq!(config.max_iterations, 3);
        assert_eq!(config.deadline, Some(Duration::from_millis(100)));

        args.mode = Some("sometimes".to_string());
        assert!(CommandRunner::new(EngineSettings::default()).engine_config(&args).is_err());
    }

    #[test]
    fn test_explain() {
        let dir = tempdir().unwrap();
        let run = run_args(dir.path());
        let args = ExplainArgs {
            rules: run.rules,
            facts: run.facts,
            bindings: None,
            rule_id: "fever".to_string(),
        };

        let evaluation = CommandRunner::new(EngineSettings::default()).explain(&args).unwrap();
        assert!(evaluation.outcome.is_match());
        assert!(evaluation.trace.iter().any(|line| line.contains("patient.temperature")));
    }

    #[test]
    fn test_bindings_file() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("bindings.json"), r#"{"minAge": 65}"#).unwrap();

        let bindings = read_bindings(Some(&dir.path().join("bindings.json"))).unwrap();
        assert_eq!(bindings.get("minAge"), Some(&json!(65)));
        assert!(read_bindings(None).unwrap().is_empty());
    }

    #[test]
    fn test_parse_rules_accepts_single_object() {
        let parsed = parse_rules(r#"{"id": "solo", "condition": {"type": "condition", "field": "a.b", "operator": "exists"}}"#)
            .unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].0, "solo");
        assert!(parsed[0].1.is_ok());
        assert!(parse_rules("42").is_err());
    }
}
