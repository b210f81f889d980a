//! 规则库
//!
//! 使用 DashMap 提供线程安全的规则缓存。规则编译后以 `Arc` 共享，规则库本身
//! 不保存任何运行期状态，可以同时被多个引擎实例只读使用。

use crate::compiler::{CompiledRule, RuleCompiler};
use crate::error::{Result, RuleError};
use crate::models::Rule;
use crate::registry::OperatorRegistry;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// 规则库
#[derive(Clone)]
pub struct RuleBase {
    /// 编译后的规则缓存
    rules: Arc<DashMap<String, Arc<CompiledRule>>>,
    /// 规则编译器
    compiler: Arc<parking_lot::Mutex<RuleCompiler>>,
}

impl RuleBase {
    /// 创建新的规则库
    pub fn new() -> Self {
        Self::with_operators(OperatorRegistry::new())
    }

    /// 使用宿主注册的自定义操作符创建规则库
    pub fn with_operators(operators: OperatorRegistry) -> Self {
        Self {
            rules: Arc::new(DashMap::new()),
            compiler: Arc::new(parking_lot::Mutex::new(RuleCompiler::with_operators(operators))),
        }
    }

    /// 获取当前规则数量
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// 添加规则，ID 已存在时失败
    #[instrument(skip(self, rule), fields(rule_id = %rule.id, priority = rule.priority))]
    pub fn add(&self, rule: Rule) -> Result<()> {
        if self.rules.contains_key(&rule.id) {
            warn!("规则已存在: {}", rule.id);
            return Err(RuleError::DuplicateRule(rule.id));
        }

        let compiled = self.compile(rule)?;
        self.insert_new(compiled)
    }

    /// 从 JSON 字符串添加规则
    #[instrument(skip(self, json))]
    pub fn load_from_json(&self, json: &str) -> Result<String> {
        let rule: Rule = serde_json::from_str(json)?;
        let rule_id = rule.id.clone();
        self.add(rule)?;
        Ok(rule_id)
    }

    /// 替换已存在的规则
    #[instrument(skip(self, rule), fields(rule_id = %rule.id))]
    pub fn replace(&self, rule: Rule) -> Result<()> {
        let rule_id = rule.id.clone();

        if !self.rules.contains_key(&rule_id) {
            warn!("替换不存在的规则: {}", rule_id);
            return Err(RuleError::RuleNotFound(rule_id));
        }

        let compiled = self.compile(rule)?;
        self.rules.insert(rule_id.clone(), Arc::new(compiled));
        info!("规则已替换: {}", rule_id);
        Ok(())
    }

    /// 删除规则
    #[instrument(skip(self))]
    pub fn remove(&self, rule_id: &str) -> Result<Arc<CompiledRule>> {
        match self.rules.remove(rule_id) {
            Some((_, rule)) => {
                info!("规则已删除: {}", rule_id);
                Ok(rule)
            }
            None => {
                warn!("删除不存在的规则: {}", rule_id);
                Err(RuleError::RuleNotFound(rule_id.to_string()))
            }
        }
    }

    /// 获取规则
    pub fn get(&self, rule_id: &str) -> Option<Arc<CompiledRule>> {
        self.rules.get(rule_id).map(|r| Arc::clone(r.value()))
    }

    /// 检查规则是否存在
    pub fn contains(&self, rule_id: &str) -> bool {
        self.rules.contains_key(rule_id)
    }

    /// 所有规则，按注册顺序排列
    pub fn all(&self) -> Vec<Arc<CompiledRule>> {
        let mut rules: Vec<Arc<CompiledRule>> = self.rules.iter().map(|r| Arc::clone(r.value())).collect();
        rules.sort_by_key(|r| r.sequence);
        rules
    }

    /// 获取所有规则 ID（按注册顺序）
    pub fn list_ids(&self) -> Vec<String> {
        self.all().iter().map(|r| r.id().to_string()).collect()
    }

    /// 条件引用了指定事实键的规则（按注册顺序）
    pub fn rules_for_fact(&self, fact_key: &str) -> Vec<Arc<CompiledRule>> {
        self.all()
            .into_iter()
            .filter(|r| r.fact_keys.contains(fact_key))
            .collect()
    }

    /// 批量加载规则，单条失败不影响其余规则
    #[instrument(skip(self, rules), fields(count = rules.len()))]
    pub fn load_batch(&self, rules: Vec<Rule>) -> BatchReport {
        let mut report = BatchReport::default();

        for rule in rules {
            let rule_id = rule.id.clone();
            match self.add(rule) {
                Ok(()) => report.loaded.push(rule_id),
                Err(e) => report.failed.push((rule_id, e)),
            }
        }

        if !report.failed.is_empty() {
            warn!("批量加载部分失败: {:?}", report.failed);
        }

        info!("批量加载完成: {} 成功, {} 失败", report.loaded.len(), report.failed.len());
        report
    }

    /// 从 JSON 数组批量加载规则
    pub fn load_batch_json(&self, json: &str) -> Result<BatchReport> {
        let rules: Vec<Rule> = serde_json::from_str(json)?;
        Ok(self.load_batch(rules))
    }

    /// 清空所有规则
    #[instrument(skip(self))]
    pub fn clear(&self) {
        let count = self.rules.len();
        self.rules.clear();
        info!("已清空 {} 条规则", count);
    }

    /// 获取规则库统计信息
    pub fn stats(&self) -> RuleBaseStats {
        let rules_count = self.rules.len();
        let mut total_fields = 0;
        let mut total_leaves = 0;
        let mut fact_keys = BTreeSet::new();
        for rule in self.rules.iter() {
            total_fields += rule.required_fields.len();
            total_leaves += rule.specificity;
            fact_keys.extend(rule.fact_keys.iter().cloned());
        }

        RuleBaseStats {
            rules_count,
            total_fields,
            total_leaves,
            fact_keys: fact_keys.len(),
            avg_fields_per_rule: if rules_count > 0 {
                total_fields as f64 / rules_count as f64
            } else {
                0.0
            },
        }
    }

    fn compile(&self, rule: Rule) -> Result<CompiledRule> {
        let mut compiler = self.compiler.lock();
        compiler.compile(rule)
    }

    fn insert_new(&self, compiled: CompiledRule) -> Result<()> {
        let rule_id = compiled.id().to_string();
        match self.rules.entry(rule_id.clone()) {
            Entry::Occupied(_) => Err(RuleError::DuplicateRule(rule_id)),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(compiled));
                info!("规则已加载: {}", rule_id);
                Ok(())
            }
        }
    }
}

impl Default for RuleBase {
    fn default() -> Self {
        Self::new()
    }
}

/// 批量加载结果
#[derive(Debug, Default)]
pub struct BatchReport {
    pub loaded: Vec<String>,
    pub failed: Vec<(String, RuleError)>,
}

impl BatchReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// 规则库统计信息
#[derive(Debug, Clone)]
pub struct RuleBaseStats {
    /// 规则总数
    pub rules_count: usize,
    /// 所有规则使用的字段总数
    pub total_fields: usize,
    /// 所有规则的叶子条件总数
    pub total_leaves: usize,
    /// 被引用的不同事实键数量
    pub fact_keys: usize,
    /// 平均每条规则使用的字段数
    pub avg_fields_per_rule: f64,
}
