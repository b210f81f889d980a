//! 冲突消解
//!
//! 把本轮所有匹配结果排成确定的冲突集。默认策略 [`StandardResolver`] 的全序
//! （从前到后）：
//! 1. 规则优先级高者在前
//! 2. 本次匹配的特异度高者在前
//! 3. 近期性，由 [`RecencyPolicy`] 决定
//! 4. 规则 ID 字典序
//!
//! 近期性按引擎内部的逻辑触发序号比较，不依赖系统时钟精度。

use crate::error::{Result, RuleError};
use crate::matcher::MatchResult;
use crate::models::Bindings;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

/// 近期性排序方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecencyPolicy {
    /// 从未触发的规则最先，其次是空闲最久的规则
    #[default]
    FavorIdle,
    /// 最近触发的规则最先，从未触发的规则最后
    FavorRecent,
}

impl RecencyPolicy {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "favor_idle" | "idle" => Ok(Self::FavorIdle),
            "favor_recent" | "recent" => Ok(Self::FavorRecent),
            other => Err(RuleError::InvalidConfig(format!("未知的近期性策略: '{}'", other))),
        }
    }
}

/// 单条规则的触发记录
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RuleActivity {
    pub fire_count: u64,
    pub last_fired: Option<DateTime<Utc>>,
    /// 最近一次触发的逻辑序号
    pub last_fired_seq: Option<u64>,
}

/// 引擎的规则触发台账
#[derive(Debug, Clone, Default)]
pub struct ActivityLedger {
    rules: HashMap<String, RuleActivity>,
    clock: u64,
}

impl ActivityLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录一次触发
    pub fn record_fired(&mut self, rule_id: &str) {
        self.clock += 1;
        let activity = self.rules.entry(rule_id.to_string()).or_default();
        activity.fire_count += 1;
        activity.last_fired = Some(Utc::now());
        activity.last_fired_seq = Some(self.clock);
    }

    pub fn get(&self, rule_id: &str) -> Option<&RuleActivity> {
        self.rules.get(rule_id)
    }

    pub fn last_fired_seq(&self, rule_id: &str) -> Option<u64> {
        self.rules.get(rule_id).and_then(|a| a.last_fired_seq)
    }

    pub fn fire_count(&self, rule_id: &str) -> u64 {
        self.rules.get(rule_id).map_or(0, |a| a.fire_count)
    }

    /// 累计触发次数
    pub fn total_fired(&self) -> u64 {
        self.clock
    }

    pub fn reset(&mut self) {
        self.rules.clear();
        self.clock = 0;
    }
}

/// 冲突消解策略
pub trait ConflictResolver: Send + Sync {
    /// 对匹配结果排序，返回冲突集
    fn resolve(&self, matches: Vec<MatchResult>, activity: &ActivityLedger) -> Vec<MatchResult>;

    fn name(&self) -> &str;
}

/// 默认冲突消解：优先级、特异度、近期性、规则 ID
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardResolver {
    recency: RecencyPolicy,
}

impl StandardResolver {
    pub fn new(recency: RecencyPolicy) -> Self {
        Self { recency }
    }

    pub fn recency(&self) -> RecencyPolicy {
        self.recency
    }

    /// 两个冲突集条目的先后关系，`Less` 表示 `a` 在前
    pub fn compare(&self, a: &MatchResult, b: &MatchResult, activity: &ActivityLedger) -> Ordering {
        b.priority()
            .cmp(&a.priority())
            .then_with(|| b.specificity.cmp(&a.specificity))
            .then_with(|| {
                let (a_seq, b_seq) = (activity.last_fired_seq(a.rule_id()), activity.last_fired_seq(b.rule_id()));
                // Option 排序中 None 最小：从未触发视为最空闲
                match self.recency {
                    RecencyPolicy::FavorIdle => a_seq.cmp(&b_seq),
                    RecencyPolicy::FavorRecent => b_seq.cmp(&a_seq),
                }
            })
            .then_with(|| a.rule_id().cmp(b.rule_id()))
    }
}

impl ConflictResolver for StandardResolver {
    fn resolve(&self, mut matches: Vec<MatchResult>, activity: &ActivityLedger) -> Vec<MatchResult> {
        matches.sort_by(|a, b| self.compare(a, b, activity));
        matches
    }

    fn name(&self) -> &str {
        "standard"
    }
}

/// 冲突集条目摘要（用于追踪输出）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgendaEntry {
    pub rule_id: String,
    pub priority: i64,
    pub specificity: usize,
    pub last_fired_seq: Option<u64>,
    pub bindings: Bindings,
}

impl AgendaEntry {
    pub fn from_match(result: &MatchResult, activity: &ActivityLedger) -> Self {
        Self {
            rule_id: result.rule_id().to_string(),
            priority: result.priority(),
            specificity: result.specificity,
            last_fired_seq: activity.last_fired_seq(result.rule_id()),
            bindings: result.bindings.clone(),
        }
    }
}
