//! 推理引擎主循环
//!
//! 状态机：`Idle → Matching → Resolving → Executing → (Matching | Halted)`。
//!
//! - Matching：对规则库中每条规则评估当前事实快照，收集匹配结果
//! - Resolving：冲突消解得到冲突集
//! - Executing：按触发模式执行冲突集条目，更新触发台账
//!
//! 截止时间只在每次 Matching 之前检查，不会打断正在执行的动作列表。

use crate::actions::ActionExecutor;
use crate::compiler::CompiledRule;
use crate::conflict::{ActivityLedger, AgendaEntry, ConflictResolver, RecencyPolicy, StandardResolver};
use crate::error::{Result, RuleError};
use crate::facts::{FactSnapshot, FactStore};
use crate::matcher::{MatchEvaluation, MatchOutcome, MatchResult, RuleMatcher};
use crate::models::Bindings;
use crate::registry::FunctionRegistry;
use crate::store::RuleBase;
use crate::trace::{CycleEvent, FiredRule, NoopSink, TraceSink, TracingSink};
use kernel_shared::config::EngineSettings;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// 触发模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FiringMode {
    /// 每轮只执行冲突集头部
    #[default]
    FirstMatch,
    /// 每轮按顺序执行整个冲突集
    AllMatch,
}

impl FiringMode {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "first" | "first_match" | "first-match" => Ok(Self::FirstMatch),
            "all" | "all_match" | "all-match" => Ok(Self::AllMatch),
            other => Err(RuleError::InvalidConfig(format!("未知的触发模式: '{}'", other))),
        }
    }
}

/// 引擎状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Idle,
    Matching,
    Resolving,
    Executing,
    Halted,
}

/// 停机原因
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum HaltReason {
    /// 冲突集为空，正常结束
    Completed,
    /// `$return` 提前结束
    Returned,
    /// 超过最大循环次数
    IterationLimitExceeded { limit: u64 },
    /// 超过调用方给定的截止时间
    DeadlineExceeded,
    /// 首匹配模式下动作执行失败
    ActionFailed { error: RuleError },
}

impl HaltReason {
    /// 是否为正常停机（完成或提前返回）
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed | Self::Returned)
    }
}

/// 引擎配置
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub mode: FiringMode,
    pub max_iterations: u64,
    pub deadline: Option<Duration>,
    pub recency: RecencyPolicy,
    /// 对依赖事实未变化的规则复用上一轮匹配结果
    pub memoize_matches: bool,
    /// 把循环事件写入 tracing
    pub trace: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mode: FiringMode::FirstMatch,
            max_iterations: 1000,
            deadline: None,
            recency: RecencyPolicy::FavorIdle,
            memoize_matches: true,
            trace: false,
        }
    }
}

impl EngineConfig {
    /// 从共享配置构建
    pub fn from_settings(settings: &EngineSettings) -> Result<Self> {
        Ok(Self {
            mode: FiringMode::parse(&settings.mode)?,
            max_iterations: settings.max_iterations,
            deadline: settings.deadline_ms.map(Duration::from_millis),
            recency: RecencyPolicy::parse(&settings.recency_policy)?,
            memoize_matches: settings.memoize_matches,
            trace: settings.trace,
        })
    }
}

/// 单次运行参数
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub mode: FiringMode,
    pub max_iterations: u64,
    pub deadline: Option<Instant>,
    /// 预先绑定的外部变量，每次匹配都可见
    pub bindings: Bindings,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按引擎配置生成运行参数，截止时间从现在开始计算
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            mode: config.mode,
            max_iterations: config.max_iterations,
            deadline: config.deadline.map(|d| Instant::now() + d),
            bindings: Bindings::new(),
        }
    }

    pub fn with_mode(mut self, mode: FiringMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: u64) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_binding(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.bindings.insert(name.into(), value.into());
        self
    }
}

/// 运行结果
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub final_facts: FactStore,
    pub fired_rules: Vec<FiredRule>,
    pub halt_reason: HaltReason,
    pub return_value: Option<Value>,
    /// 执行过的循环数
    pub cycles: u64,
    /// 运行中记录的动作错误
    pub errors: Vec<RuleError>,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.halt_reason.is_success()
    }

    /// 导致失败停机的错误
    pub fn error(&self) -> Option<RuleError> {
        match &self.halt_reason {
            HaltReason::ActionFailed { error } => Some(error.clone()),
            HaltReason::IterationLimitExceeded { limit } => {
                Some(RuleError::IterationLimitExceeded { limit: *limit })
            }
            _ => None,
        }
    }

    /// 按触发顺序列出规则 ID
    pub fn fired_ids(&self) -> Vec<&str> {
        self.fired_rules.iter().map(|f| f.rule_id.as_str()).collect()
    }
}

/// 匹配结果缓存，按规则 ID 和注册序号保存上一轮结果
#[derive(Default)]
struct MatchCache {
    entries: HashMap<String, (u64, MatchOutcome)>,
    /// 上次 Matching 之后发生变化的事实键，None 表示全部失效
    dirty: Option<BTreeSet<String>>,
}

impl MatchCache {
    fn lookup(&self, rule: &CompiledRule) -> Option<MatchOutcome> {
        let dirty = self.dirty.as_ref()?;
        match self.entries.get(rule.id()) {
            Some((sequence, outcome)) if *sequence == rule.sequence && !rule.depends_on(dirty) => {
                Some(outcome.clone())
            }
            _ => None,
        }
    }

    fn store(&mut self, rule: &CompiledRule, outcome: &MatchOutcome) {
        self.entries
            .insert(rule.id().to_string(), (rule.sequence, outcome.clone()));
    }

    fn invalidate(&mut self, changed: BTreeSet<String>) {
        if let Some(dirty) = self.dirty.as_mut() {
            dirty.extend(changed);
        }
    }

    fn settle(&mut self) {
        self.dirty = Some(BTreeSet::new());
    }
}

/// 推理引擎
///
/// 规则库可以在多个引擎之间共享，每个引擎独占自己的事实存储和触发台账。
pub struct Engine {
    rules: RuleBase,
    functions: FunctionRegistry,
    resolver: Box<dyn ConflictResolver>,
    sink: Arc<dyn TraceSink>,
    config: EngineConfig,
    activity: ActivityLedger,
    state: EngineState,
}

impl Engine {
    pub fn new(rules: RuleBase, config: EngineConfig) -> Self {
        let sink: Arc<dyn TraceSink> = if config.trace {
            Arc::new(TracingSink)
        } else {
            Arc::new(NoopSink)
        };

        Self {
            rules,
            functions: FunctionRegistry::new(),
            resolver: Box::new(StandardResolver::new(config.recency)),
            sink,
            config,
            activity: ActivityLedger::new(),
            state: EngineState::Idle,
        }
    }

    /// 设置 `$call` 可用的宿主函数
    pub fn with_functions(mut self, functions: FunctionRegistry) -> Self {
        self.functions = functions;
        self
    }

    /// 替换冲突消解策略
    pub fn with_resolver(mut self, resolver: Box<dyn ConflictResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// 设置循环事件接收端
    pub fn with_trace_sink(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn rules(&self) -> &RuleBase {
        &self.rules
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// 最近一次运行的触发台账
    pub fn activity(&self) -> &ActivityLedger {
        &self.activity
    }

    /// 使用引擎配置运行
    pub fn run_default(&mut self, initial_facts: FactStore) -> RunOutcome {
        let options = RunOptions::from_config(&self.config);
        self.run(initial_facts, options)
    }

    /// 对单条规则评估当前事实并返回评估追踪
    pub fn explain(&self, rule_id: &str, facts: &FactStore, bindings: &Bindings) -> Result<MatchEvaluation> {
        let rule = self
            .rules
            .get(rule_id)
            .ok_or_else(|| RuleError::RuleNotFound(rule_id.to_string()))?;
        Ok(RuleMatcher::new()
            .with_trace()
            .explain(&rule, &facts.snapshot(), bindings))
    }

    /// 运行前向链式推理直到停机
    #[instrument(
        skip_all,
        fields(mode = ?options.mode, max_iterations = options.max_iterations, rules = self.rules.len())
    )]
    pub fn run(&mut self, initial_facts: FactStore, options: RunOptions) -> RunOutcome {
        self.activity.reset();

        let matcher = RuleMatcher::new();
        let mut facts = initial_facts;
        let mut cache = MatchCache::default();
        let mut fired_rules = Vec::new();
        let mut errors = Vec::new();
        let mut return_value = None;
        let mut cycles = 0u64;

        let halt_reason = loop {
            if let Some(deadline) = options.deadline
                && Instant::now() >= deadline
            {
                warn!(cycles, "运行超过截止时间");
                break HaltReason::DeadlineExceeded;
            }

            self.state = EngineState::Matching;
            let snapshot = facts.snapshot();
            let matches = self.collect_matches(&snapshot, &options.bindings, &mut cache);

            self.state = EngineState::Resolving;
            let agenda = self.resolver.resolve(matches, &self.activity);
            if agenda.is_empty() {
                break HaltReason::Completed;
            }
            if cycles >= options.max_iterations {
                warn!(limit = options.max_iterations, "超过最大循环次数");
                break HaltReason::IterationLimitExceeded {
                    limit: options.max_iterations,
                };
            }

            cycles += 1;
            self.state = EngineState::Executing;

            let mut event = CycleEvent {
                cycle: cycles,
                facts_considered: snapshot.keys().map(str::to_string).collect(),
                conflict_set: agenda
                    .iter()
                    .map(|m| AgendaEntry::from_match(m, &self.activity))
                    .collect(),
                ..CycleEvent::default()
            };

            let selected = match options.mode {
                FiringMode::FirstMatch => 1,
                FiringMode::AllMatch => agenda.len(),
            };

            let mut halt = None;
            for (position, entry) in agenda.into_iter().take(selected).enumerate() {
                // 后续条目要对已被前面规则修改过的事实重新确认
                let entry = if position == 0 {
                    entry
                } else {
                    match matcher.match_rule(&entry.rule, &facts.snapshot(), &options.bindings) {
                        Some(refreshed) => refreshed,
                        None => {
                            debug!(rule_id = %entry.rule_id(), "规则不再匹配，跳过");
                            event.skipped.push(entry.rule_id().to_string());
                            continue;
                        }
                    }
                };

                let MatchResult { rule, bindings, .. } = entry;
                let mut report = ActionExecutor::new(&self.functions).execute(&rule, bindings.clone());
                match facts.apply(&report.changes) {
                    Ok(changed) => cache.invalidate(changed),
                    Err(err) => {
                        // 写入失败之前的修改已提交
                        cache.invalidate(report.changes.keys());
                        report.returned = None;
                        if report.error.is_none() {
                            report.error = Some(RuleError::ActionExecution {
                                rule_id: rule.id().to_string(),
                                action: "set".to_string(),
                                message: err.to_string(),
                            });
                        }
                    }
                }
                self.activity.record_fired(rule.id());

                let fired = FiredRule {
                    cycle: cycles,
                    rule_id: rule.id().to_string(),
                    bindings,
                    actions: report.applied,
                };
                event.fired.push(fired.clone());
                fired_rules.push(fired);

                if let Some(err) = report.error {
                    warn!(rule_id = %rule.id(), error = %err, "规则动作执行失败");
                    event.errors.push(err.to_string());
                    errors.push(err.clone());
                    if options.mode == FiringMode::FirstMatch {
                        halt = Some(HaltReason::ActionFailed { error: err });
                        break;
                    }
                }

                if let Some(value) = report.returned {
                    return_value = Some(value);
                    halt = Some(HaltReason::Returned);
                    break;
                }
            }

            self.sink.record(&event);
            debug!(
                cycle = cycles,
                conflict_set = event.conflict_set.len(),
                fired = event.fired.len(),
                skipped = event.skipped.len(),
                "循环结束"
            );

            if let Some(reason) = halt {
                break reason;
            }
        };

        self.state = EngineState::Halted;
        info!(
            cycles,
            fired = fired_rules.len(),
            halt_reason = ?halt_reason,
            "推理运行结束"
        );

        RunOutcome {
            final_facts: facts,
            fired_rules,
            halt_reason,
            return_value,
            cycles,
            errors,
        }
    }

    /// Matching 阶段：评估所有规则
    fn collect_matches(&self, snapshot: &FactSnapshot, bindings: &Bindings, cache: &mut MatchCache) -> Vec<MatchResult> {
        let matcher = RuleMatcher::new();
        let mut matches = Vec::new();

        for rule in self.rules.all() {
            let cached = if self.config.memoize_matches {
                cache.lookup(&rule)
            } else {
                None
            };

            let outcome = match cached {
                Some(outcome) => outcome,
                None => {
                    let outcome = matcher.evaluate(&rule.condition, snapshot, bindings);
                    if self.config.memoize_matches {
                        cache.store(&rule, &outcome);
                    }
                    outcome
                }
            };

            if let MatchOutcome::Match { bindings, specificity } = outcome {
                matches.push(MatchResult {
                    rule,
                    bindings,
                    specificity,
                });
            }
        }

        cache.settle();
        matches
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Action, Condition, Rule, RuleNode};
    use crate::trace::{MemorySink, MockTraceSink};
    use serde_json::json;

    fn counter_rule() -> Rule {
        Rule::new(
            "count",
            RuleNode::and(vec![
                Condition::new("counter.n", "lt", 3).bind("n").into(),
                RuleNode::leaf("counter.n", "exists", Value::Null),
            ]),
        )
        .with_action(Action::compute("counter.n", "$n + 1"))
    }

    fn counter_facts() -> FactStore {
        FactStore::from_value(json!({"counter": {"n": 0}})).unwrap()
    }

    #[test]
    fn test_engine_state_transitions() {
        let rules = RuleBase::new();
        rules.add(counter_rule()).unwrap();

        let mut engine = Engine::new(rules, EngineConfig::default());
        assert_eq!(engine.state(), EngineState::Idle);

        let outcome = engine.run(counter_facts(), RunOptions::new());
        assert_eq!(engine.state(), EngineState::Halted);
        assert_eq!(outcome.halt_reason, HaltReason::Completed);
        assert_eq!(outcome.cycles, 3);
        assert_eq!(outcome.final_facts.get("counter").unwrap()["n"], json!(3));
        assert_eq!(engine.activity().fire_count("count"), 3);
    }

    #[test]
    fn test_memoization_matches_full_evaluation() {
        let build = |memoize| {
            let rules = RuleBase::new();
            rules.add(counter_rule()).unwrap();
            rules
                .add(
                    Rule::new("unrelated", RuleNode::leaf("other.flag", "eq", true))
                        .with_action(Action::set("other.flag", false)),
                )
                .unwrap();
            let config = EngineConfig {
                memoize_matches: memoize,
                ..EngineConfig::default()
            };
            Engine::new(rules, config)
        };

        let facts = FactStore::from_value(json!({"counter": {"n": 0}, "other": {"flag": true}})).unwrap();
        let with_cache = build(true).run(facts.clone(), RunOptions::new());
        let without_cache = build(false).run(facts, RunOptions::new());

        assert_eq!(with_cache.fired_ids(), without_cache.fired_ids());
        assert_eq!(with_cache.final_facts, without_cache.final_facts);
    }

    #[test]
    fn test_trace_sink_receives_every_cycle() {
        let rules = RuleBase::new();
        rules.add(counter_rule()).unwrap();

        let mut sink = MockTraceSink::new();
        sink.expect_record()
            .withf(|event: &CycleEvent| event.fired.len() == 1 && event.conflict_set.len() == 1)
            .times(3)
            .return_const(());

        let mut engine = Engine::new(rules, EngineConfig::default()).with_trace_sink(Arc::new(sink));
        let outcome = engine.run(counter_facts(), RunOptions::new());
        assert!(outcome.is_success());
    }

    #[test]
    fn test_memory_sink_records_conflict_set_scores() {
        let rules = RuleBase::new();
        rules.add(counter_rule().with_priority(4)).unwrap();
        let sink = Arc::new(MemorySink::new());

        let mut engine = Engine::new(rules, EngineConfig::default()).with_trace_sink(sink.clone());
        engine.run(counter_facts(), RunOptions::new());

        let events = sink.events();
        assert_eq!(events.len(), 3);
        let head = &events[0].conflict_set[0];
        assert_eq!(head.rule_id, "count");
        assert_eq!(head.priority, 4);
        assert_eq!(head.specificity, 2);
        assert_eq!(head.last_fired_seq, None);
        assert_eq!(events[1].conflict_set[0].last_fired_seq, Some(1));
        assert_eq!(events[0].facts_considered, vec!["counter".to_string()]);
    }

    #[test]
    fn test_deadline_checked_before_matching() {
        let rules = RuleBase::new();
        rules.add(counter_rule()).unwrap();

        let mut engine = Engine::new(rules, EngineConfig::default());
        let options = RunOptions::new().with_deadline(Instant::now());
        let outcome = engine.run(counter_facts(), options);

        assert_eq!(outcome.halt_reason, HaltReason::DeadlineExceeded);
        assert_eq!(outcome.cycles, 0);
        assert!(!outcome.is_success());
    }

    #[test]
    fn test_explain_rule() {
        let rules = RuleBase::new();
        rules.add(counter_rule()).unwrap();
        let engine = Engine::new(rules, EngineConfig::default());

        let evaluation = engine.explain("count", &counter_facts(), &Bindings::new()).unwrap();
        assert!(evaluation.outcome.is_match());
        assert!(!evaluation.trace.is_empty());
        assert!(matches!(
            engine.explain("missing", &counter_facts(), &Bindings::new()),
            Err(RuleError::RuleNotFound(_))
        ));
    }

    #[test]
    fn test_config_from_settings() {
        let settings = EngineSettings {
            mode: "all_match".to_string(),
            deadline_ms: Some(50),
            recency_policy: "favor_recent".to_string(),
            ..EngineSettings::default()
        };

        let config = EngineConfig::from_settings(&settings).unwrap();
        assert_eq!(config.mode, FiringMode::AllMatch);
        assert_eq!(config.deadline, Some(Duration::from_millis(50)));
        assert_eq!(config.recency, RecencyPolicy::FavorRecent);

        let bad = EngineSettings {
            mode: "sometimes".to_string(),
            ..EngineSettings::default()
        };
        assert!(matches!(
            EngineConfig::from_settings(&bad),
            Err(RuleError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_halt_reason_serialization() {
        let json = serde_json::to_value(HaltReason::IterationLimitExceeded { limit: 5 }).unwrap();
        assert_eq!(json, json!({"reason": "iteration_limit_exceeded", "limit": 5}));
    }
}
