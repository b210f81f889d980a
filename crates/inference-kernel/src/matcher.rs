//! 模式匹配
//!
//! 对事实快照评估编译后的条件树，产生变量绑定和特异度：
//! - AND 从左到右传递绑定，后面的子节点能看到前面捕获的变量，遇到不匹配立即短路
//! - OR 用同一份输入绑定评估所有分支，取特异度最高的分支（相同时取捕获变量多的，再相同取靠前的）
//! - NOT 子树不匹配时成立，子树中的绑定一律丢弃
//!
//! 叶子评估中的类型不匹配、引用未绑定变量都视为该叶子不匹配。

use crate::compiler::{CompiledCondition, CompiledLeaf, CompiledRule, LeafTest};
use crate::evaluator::ConditionEvaluator;
use crate::facts::FactSnapshot;
use crate::models::Bindings;
use serde_json::Value;
use std::sync::Arc;

/// 一次匹配尝试的结果
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    NoMatch,
    Match { bindings: Bindings, specificity: usize },
}

impl MatchOutcome {
    pub fn is_match(&self) -> bool {
        matches!(self, Self::Match { .. })
    }
}

/// 冲突集中的一项：规则加上本轮匹配得到的绑定
#[derive(Debug, Clone)]
pub struct MatchResult {
    pub rule: Arc<CompiledRule>,
    pub bindings: Bindings,
    pub specificity: usize,
}

impl MatchResult {
    pub fn rule_id(&self) -> &str {
        self.rule.id()
    }

    pub fn priority(&self) -> i64 {
        self.rule.priority()
    }
}

/// 带评估追踪的匹配结果
#[derive(Debug, Clone)]
pub struct MatchEvaluation {
    pub outcome: MatchOutcome,
    pub trace: Vec<String>,
}

struct Partial {
    bindings: Bindings,
    specificity: usize,
    captured: usize,
}

/// 规则匹配器
#[derive(Debug, Default)]
pub struct RuleMatcher {
    /// 是否记录详细评估追踪
    trace_enabled: bool,
}

impl RuleMatcher {
    pub fn new() -> Self {
        Self { trace_enabled: false }
    }

    /// 启用评估追踪
    pub fn with_trace(mut self) -> Self {
        self.trace_enabled = true;
        self
    }

    /// 评估条件树，`external` 是调用方预先绑定的变量
    pub fn evaluate(&self, condition: &CompiledCondition, facts: &FactSnapshot, external: &Bindings) -> MatchOutcome {
        let mut trace = Vec::new();
        self.outcome(condition, facts, external, &mut trace)
    }

    /// 评估规则并返回追踪信息
    pub fn explain(&self, rule: &CompiledRule, facts: &FactSnapshot, external: &Bindings) -> MatchEvaluation {
        let mut trace = Vec::new();
        let outcome = self.outcome(&rule.condition, facts, external, &mut trace);
        MatchEvaluation { outcome, trace }
    }

    /// 匹配单条规则，成功时生成冲突集条目
    pub fn match_rule(&self, rule: &Arc<CompiledRule>, facts: &FactSnapshot, external: &Bindings) -> Option<MatchResult> {
        match self.evaluate(&rule.condition, facts, external) {
            MatchOutcome::Match { bindings, specificity } => Some(MatchResult {
                rule: Arc::clone(rule),
                bindings,
                specificity,
            }),
            MatchOutcome::NoMatch => None,
        }
    }

    fn outcome(
        &self,
        condition: &CompiledCondition,
        facts: &FactSnapshot,
        external: &Bindings,
        trace: &mut Vec<String>,
    ) -> MatchOutcome {
        match self.evaluate_node(condition, facts, external, "root", trace) {
            Some(partial) => MatchOutcome::Match {
                bindings: partial.bindings,
                specificity: partial.specificity,
            },
            None => MatchOutcome::NoMatch,
        }
    }

    /// 递归评估条件节点
    fn evaluate_node(
        &self,
        node: &CompiledCondition,
        facts: &FactSnapshot,
        bindings: &Bindings,
        path: &str,
        trace: &mut Vec<String>,
    ) -> Option<Partial> {
        match node {
            CompiledCondition::Leaf(leaf) => self.evaluate_leaf(leaf, facts, bindings, trace),
            CompiledCondition::All(children) => {
                let mut current = Partial {
                    bindings: bindings.clone(),
                    specificity: 0,
                    captured: 0,
                };

                for (i, child) in children.iter().enumerate() {
                    let child_path = format!("{}.children[{}]", path, i);
                    let Some(next) = self.evaluate_node(child, facts, &current.bindings, &child_path, trace) else {
                        self.record(trace, || format!("{}: AND 短路 - 子节点 {} 不匹配", path, i));
                        return None;
                    };
                    current = Partial {
                        bindings: next.bindings,
                        specificity: current.specificity + next.specificity,
                        captured: current.captured + next.captured,
                    };
                }

                self.record(trace, || format!("{}: AND 组全部匹配", path));
                Some(current)
            }
            CompiledCondition::Any(children) => {
                let mut best: Option<(usize, Partial)> = None;

                for (i, child) in children.iter().enumerate() {
                    let child_path = format!("{}.children[{}]", path, i);
                    let Some(candidate) = self.evaluate_node(child, facts, bindings, &child_path, trace) else {
                        continue;
                    };
                    let better = best.as_ref().is_none_or(|(_, current)| {
                        (candidate.specificity, candidate.captured) > (current.specificity, current.captured)
                    });
                    if better {
                        best = Some((i, candidate));
                    }
                }

                match best {
                    Some((i, partial)) => {
                        self.record(trace, || {
                            format!("{}: OR 选择子节点 {} (特异度 {})", path, i, partial.specificity)
                        });
                        Some(partial)
                    }
                    None => {
                        self.record(trace, || format!("{}: OR 组无匹配", path));
                        None
                    }
                }
            }
            CompiledCondition::Not(child) => {
                let child_path = format!("{}.child", path);
                match self.evaluate_node(child, facts, bindings, &child_path, trace) {
                    Some(_) => {
                        self.record(trace, || format!("{}: NOT 子节点匹配，条件不成立", path));
                        None
                    }
                    None => Some(Partial {
                        bindings: bindings.clone(),
                        specificity: 1,
                        captured: 0,
                    }),
                }
            }
        }
    }

    /// 评估叶子条件，成立时处理变量捕获或合一
    fn evaluate_leaf(
        &self,
        leaf: &CompiledLeaf,
        facts: &FactSnapshot,
        bindings: &Bindings,
        trace: &mut Vec<String>,
    ) -> Option<Partial> {
        let field_value = facts.get_field(&leaf.field);

        let operand = match &leaf.test {
            LeafTest::Builtin(op) if op.is_unary() => Value::Null,
            _ => match leaf.operand.render(bindings) {
                Ok(value) => value,
                Err(err) => {
                    self.record(trace, || format!("{}: {} => NOT_MATCHED ({})", leaf.path, leaf.field, err));
                    return None;
                }
            },
        };

        let result = match &leaf.test {
            LeafTest::Builtin(op) => ConditionEvaluator::evaluate(field_value, *op, &operand),
            LeafTest::Regex(regex) => match field_value {
                Some(value) => ConditionEvaluator::regex_match(value, regex),
                None => Ok(false),
            },
            LeafTest::Type(ty) => Ok(field_value.is_some_and(|value| ty.matches(value))),
            LeafTest::Custom { operator, .. } => operator.evaluate(field_value, &operand),
        };

        let matched = match result {
            Ok(matched) => matched,
            Err(err) => {
                self.record(trace, || format!("{}: {} => NOT_MATCHED ({})", leaf.path, leaf.field, err));
                false
            }
        };

        self.record(trace, || {
            format!(
                "{}: {} {} {} => {}",
                leaf.path,
                leaf.field,
                leaf.test.name(),
                operand,
                if matched { "MATCHED" } else { "NOT_MATCHED" }
            )
        });

        if !matched {
            return None;
        }

        let Some(var) = &leaf.bind else {
            return Some(Partial {
                bindings: bindings.clone(),
                specificity: 1,
                captured: 0,
            });
        };

        let value = field_value.cloned().unwrap_or(Value::Null);
        match bindings.get(var) {
            Some(bound) if ConditionEvaluator::values_equal(bound, &value) => Some(Partial {
                bindings: bindings.clone(),
                specificity: 1,
                captured: 0,
            }),
            Some(bound) => {
                self.record(trace, || format!("{}: ${} 合一失败 ({} != {})", leaf.path, var, bound, value));
                None
            }
            None => {
                let mut next = bindings.clone();
                next.insert(var.clone(), value);
                Some(Partial {
                    bindings: next,
                    specificity: 1,
                    captured: 1,
                })
            }
        }
    }

    fn record(&self, trace: &mut Vec<String>, line: impl FnOnce() -> String) {
        if self.trace_enabled {
            trace.push(line());
        }
    }
}

/// 评估条件树（不记录追踪）
pub fn evaluate(condition: &CompiledCondition, facts: &FactSnapshot, external: &Bindings) -> MatchOutcome {
    RuleMatcher::new().evaluate(condition, facts, external)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::RuleCompiler;
    use crate::facts::FactStore;
    use crate::models::{Condition, Rule, RuleNode};
    use serde_json::json;

    fn facts() -> FactSnapshot {
        FactStore::from_value(json!({
            "patient": { "age": 70, "bp": 150, "name": "chen" },
            "order": { "amount": 1000, "customer": "chen", "tags": ["vip"] },
            "policy": { "minAge": 65 }
        }))
        .unwrap()
        .snapshot()
    }

    fn compile(node: RuleNode) -> CompiledRule {
        RuleCompiler::new().compile(Rule::new("r", node)).unwrap()
    }

    fn bound(pairs: &[(&str, Value)]) -> Bindings {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_and_threads_bindings() {
        let rule = compile(RuleNode::and(vec![
            Condition::new("patient.name", "exists", Value::Null).bind("who").into(),
            RuleNode::leaf("order.customer", "eq", "$who"),
        ]));

        match evaluate(&rule.condition, &facts(), &Bindings::new()) {
            MatchOutcome::Match { bindings, specificity } => {
                assert_eq!(bindings.get("who"), Some(&json!("chen")));
                assert_eq!(specificity, 2);
            }
            MatchOutcome::NoMatch => panic!("expected match"),
        }
    }

    #[test]
    fn test_unification_failure() {
        let rule = compile(RuleNode::and(vec![
            Condition::new("patient.name", "exists", Value::Null).bind("x").into(),
            Condition::new("order.amount", "exists", Value::Null).bind("x").into(),
        ]));
        assert_eq!(evaluate(&rule.condition, &facts(), &Bindings::new()), MatchOutcome::NoMatch);

        let rule = compile(RuleNode::and(vec![
            Condition::new("patient.name", "exists", Value::Null).bind("x").into(),
            Condition::new("order.customer", "exists", Value::Null).bind("x").into(),
        ]));
        assert!(evaluate(&rule.condition, &facts(), &Bindings::new()).is_match());
    }

    #[test]
    fn test_unbound_reference_is_no_match() {
        let rule = compile(RuleNode::leaf("patient.age", "gte", "$minAge"));
        assert_eq!(evaluate(&rule.condition, &facts(), &Bindings::new()), MatchOutcome::NoMatch);

        let external = bound(&[("minAge", json!(65))]);
        assert!(evaluate(&rule.condition, &facts(), &external).is_match());
    }

    #[test]
    fn test_or_prefers_most_specific_branch() {
        let rule = compile(RuleNode::or(vec![
            Condition::new("patient.age", "gt", 60).bind("a").into(),
            RuleNode::and(vec![
                Condition::new("patient.bp", "gt", 140).bind("b").into(),
                RuleNode::leaf("patient.age", "gt", 65),
            ]),
        ]));

        match evaluate(&rule.condition, &facts(), &Bindings::new()) {
            MatchOutcome::Match { bindings, specificity } => {
                assert_eq!(specificity, 2);
                assert!(bindings.contains_key("b"));
                assert!(!bindings.contains_key("a"));
            }
            MatchOutcome::NoMatch => panic!("expected match"),
        }
    }

    #[test]
    fn test_not_discards_bindings() {
        let rule = compile(RuleNode::and(vec![
            RuleNode::not(Condition::new("patient.alert", "exists", Value::Null).bind("hidden").into()),
            RuleNode::leaf("patient.age", "gt", 18),
        ]));

        match evaluate(&rule.condition, &facts(), &Bindings::new()) {
            MatchOutcome::Match { bindings, specificity } => {
                assert!(bindings.is_empty());
                assert_eq!(specificity, 2);
            }
            MatchOutcome::NoMatch => panic!("expected match"),
        }

        let rule = compile(RuleNode::not(RuleNode::leaf("patient.age", "gt", 18)));
        assert_eq!(evaluate(&rule.condition, &facts(), &Bindings::new()), MatchOutcome::NoMatch);
    }

    #[test]
    fn test_type_mismatch_is_no_match() {
        let rule = compile(RuleNode::leaf("order.tags", "gt", 5));
        assert_eq!(evaluate(&rule.condition, &facts(), &Bindings::new()), MatchOutcome::NoMatch);
    }

    #[test]
    fn test_missing_fact_is_no_match() {
        let rule = compile(RuleNode::leaf("ghost.value", "eq", 1));
        assert_eq!(evaluate(&rule.condition, &facts(), &Bindings::new()), MatchOutcome::NoMatch);
    }

    #[test]
    fn test_explain_records_trace() {
        let rule = compile(RuleNode::and(vec![
            RuleNode::leaf("patient.age", "gt", 80),
            RuleNode::leaf("patient.bp", "gt", 140),
        ]));

        let evaluation = RuleMatcher::new().with_trace().explain(&rule, &facts(), &Bindings::new());
        assert!(!evaluation.outcome.is_match());
        assert!(evaluation.trace.iter().any(|line| line.contains("NOT_MATCHED")));
        assert!(evaluation.trace.iter().any(|line| line.contains("短路")));
    }

    #[test]
    fn test_match_rule_builds_entry() {
        let rule = Arc::new(compile(Condition::new("order.amount", "gte", 500).bind("amount").into()));
        let entry = RuleMatcher::new()
            .match_rule(&rule, &facts(), &Bindings::new())
            .unwrap();
        assert_eq!(entry.rule_id(), "r");
        assert_eq!(entry.bindings.get("amount"), Some(&json!(1000)));
        assert_eq!(entry.specificity, 1);
    }
}
