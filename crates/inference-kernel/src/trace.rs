//! 循环追踪
//!
//! 引擎每完成一轮执行就向 [`TraceSink`] 发送一个 [`CycleEvent`]，sink 决定
//! 事件如何存储或展示。

use crate::actions::AppliedAction;
use crate::conflict::AgendaEntry;
use crate::models::Bindings;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

/// 一次规则触发
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FiredRule {
    pub cycle: u64,
    pub rule_id: String,
    pub bindings: Bindings,
    pub actions: Vec<AppliedAction>,
}

/// 单轮循环的结构化事件
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CycleEvent {
    pub cycle: u64,
    /// 本轮匹配时事实存储中的事实键
    pub facts_considered: Vec<String>,
    /// 完整冲突集（含评分）
    pub conflict_set: Vec<AgendaEntry>,
    pub fired: Vec<FiredRule>,
    /// 全匹配模式下因前序规则修改事实而不再匹配、被跳过的规则
    pub skipped: Vec<String>,
    pub errors: Vec<String>,
}

/// 追踪事件接收端
#[cfg_attr(test, mockall::automock)]
pub trait TraceSink: Send + Sync {
    fn record(&self, event: &CycleEvent);
}

/// 丢弃所有事件
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl TraceSink for NoopSink {
    fn record(&self, _event: &CycleEvent) {}
}

/// 把事件写成结构化日志
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TraceSink for TracingSink {
    fn record(&self, event: &CycleEvent) {
        let fired: Vec<&str> = event.fired.iter().map(|f| f.rule_id.as_str()).collect();
        let detail = serde_json::to_string(event).unwrap_or_default();
        info!(
            cycle = event.cycle,
            conflict_set = event.conflict_set.len(),
            fired = ?fired,
            skipped = event.skipped.len(),
            errors = event.errors.len(),
            event = %detail,
            "推理循环完成"
        );
    }
}

/// 在内存中保存事件
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<CycleEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<CycleEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl TraceSink for MemorySink {
    fn record(&self, event: &CycleEvent) {
        self.events.lock().push(event.clone());
    }
}
