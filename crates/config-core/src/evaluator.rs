//! Pure override evaluator: `(context, overrides, base) → (value, trace)`.
//!
//! No I/O, no randomness, no wall-clock reads. References must already be
//! rendered to literals (or the `Unresolved` sentinel) by
//! [`crate::reference`] before conditions reach this module.

use serde_json::Value;

use crate::condition::{Condition, ConditionValue};
use crate::segmentation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchResult {
    Matched,
    NotMatched,
    Unknown,
}

impl MatchResult {
    fn negate(self) -> Self {
        match self {
            MatchResult::Matched => MatchResult::NotMatched,
            MatchResult::NotMatched => MatchResult::Matched,
            MatchResult::Unknown => MatchResult::Unknown,
        }
    }
}

/// A single node's evaluation result within the trace tree.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConditionTrace {
    pub result: MatchResult,
    pub reason: String,
    pub children: Vec<ConditionTrace>,
}

impl ConditionTrace {
    fn leaf(result: MatchResult, reason: impl Into<String>) -> Self {
        Self {
            result,
            reason: reason.into(),
            children: Vec::new(),
        }
    }

    fn composite(result: MatchResult, reason: impl Into<String>, children: Vec<ConditionTrace>) -> Self {
        Self {
            result,
            reason: reason.into(),
            children,
        }
    }
}

/// Trace of one override's evaluation: the conjunction of its top-level
/// conditions, plus whether it was selected.
#[derive(Debug, Clone, serde::Serialize)]
pub struct OverrideTrace {
    pub name: String,
    pub result: MatchResult,
    pub conditions: Vec<ConditionTrace>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct EvaluationResult {
    pub final_value: Value,
    pub matched_override: Option<String>,
    pub trace: Vec<OverrideTrace>,
}

/// An evaluable override: a name, an implicitly-ANDed list of top-level
/// conditions, and the value to return when they all match.
#[derive(Debug, Clone)]
pub struct EvalOverride<'a> {
    pub name: &'a str,
    pub conditions: &'a [Condition],
    pub value: &'a Value,
}

/// Evaluate `overrides` in declared order against `context`, falling back
/// to `base_value` if none match. Overrides whose conjunction is `unknown`
/// are skipped but still recorded in the trace.
pub fn evaluate(
    base_value: &Value,
    overrides: &[EvalOverride<'_>],
    context: &Value,
) -> EvaluationResult {
    let mut trace = Vec::with_capacity(overrides.len());
    let mut matched: Option<(&str, &Value)> = None;

    for ov in overrides {
        if matched.is_some() {
            // Still evaluate remaining overrides so the trace reflects the
            // full declared order — only the first match wins a value.
        }
        let mut children = Vec::with_capacity(ov.conditions.len());
        let mut conjunction = MatchResult::Matched;
        for cond in ov.conditions {
            let t = evaluate_condition(cond, context);
            conjunction = and_fold(conjunction, t.result);
            children.push(t);
        }
        trace.push(OverrideTrace {
            name: ov.name.to_string(),
            result: conjunction,
            conditions: children,
        });
        if matched.is_none() && conjunction == MatchResult::Matched {
            matched = Some((ov.name, ov.value));
        }
    }

    match matched {
        Some((name, value)) => EvaluationResult {
            final_value: value.clone(),
            matched_override: Some(name.to_string()),
            trace,
        },
        None => EvaluationResult {
            final_value: base_value.clone(),
            matched_override: None,
            trace,
        },
    }
}

fn and_fold(acc: MatchResult, next: MatchResult) -> MatchResult {
    match (acc, next) {
        (MatchResult::NotMatched, _) | (_, MatchResult::NotMatched) => MatchResult::NotMatched,
        (MatchResult::Unknown, _) | (_, MatchResult::Unknown) => MatchResult::Unknown,
        (MatchResult::Matched, MatchResult::Matched) => MatchResult::Matched,
    }
}

fn or_fold(acc: MatchResult, next: MatchResult) -> MatchResult {
    match (acc, next) {
        (MatchResult::Matched, _) | (_, MatchResult::Matched) => MatchResult::Matched,
        (MatchResult::Unknown, _) | (_, MatchResult::Unknown) => MatchResult::Unknown,
        (MatchResult::NotMatched, MatchResult::NotMatched) => MatchResult::NotMatched,
    }
}

/// Evaluate a single condition node, producing its trace.
pub fn evaluate_condition(condition: &Condition, context: &Value) -> ConditionTrace {
    match condition {
        Condition::Equals { property, value } => {
            eval_leaf(property, value, context, "equals", |prop, val| {
                if prop == val {
                    (MatchResult::Matched, "values are equal".into())
                } else {
                    (MatchResult::NotMatched, "values differ".into())
                }
            })
        }
        Condition::In { property, value } => eval_set_membership(property, value, context, true),
        Condition::NotIn { property, value } => eval_set_membership(property, value, context, false),
        Condition::LessThan { property, value } => {
            eval_ordering(property, value, context, "less_than", |o| o.is_lt())
        }
        Condition::LessThanOrEqual { property, value } => {
            eval_ordering(property, value, context, "less_than_or_equal", |o| o.is_le())
        }
        Condition::GreaterThan { property, value } => {
            eval_ordering(property, value, context, "greater_than", |o| o.is_gt())
        }
        Condition::GreaterThanOrEqual { property, value } => {
            eval_ordering(property, value, context, "greater_than_or_equal", |o| o.is_ge())
        }
        Condition::Segmentation {
            property,
            from_percentage,
            to_percentage,
            seed,
        } => eval_segmentation(property, *from_percentage, *to_percentage, seed, context),
        Condition::And { conditions } => {
            let children: Vec<_> = conditions.iter().map(|c| evaluate_condition(c, context)).collect();
            let result = children
                .iter()
                .fold(MatchResult::Matched, |acc, t| and_fold(acc, t.result));
            ConditionTrace::composite(result, "and", children)
        }
        Condition::Or { conditions } => {
            let children: Vec<_> = conditions.iter().map(|c| evaluate_condition(c, context)).collect();
            let result = children
                .iter()
                .fold(MatchResult::NotMatched, |acc, t| or_fold(acc, t.result));
            ConditionTrace::composite(result, "or", children)
        }
        Condition::Not { condition } => {
            let child = evaluate_condition(condition, context);
            let result = child.result.negate();
            ConditionTrace::composite(result, "not", vec![child])
        }
    }
}

fn lookup<'a>(property: &str, context: &'a Value) -> Option<&'a Value> {
    context.as_object().and_then(|o| o.get(property))
}

/// Resolve a leaf's `ConditionValue` to a concrete literal, returning
/// `None` if it is unresolved (resolver sentinel) or still an unrendered
/// reference (should not happen post-resolution, but treated the same).
fn literal_of(value: &ConditionValue) -> Option<&Value> {
    match value {
        ConditionValue::Literal { value } => Some(value),
        ConditionValue::Reference { .. } | ConditionValue::Unresolved => None,
    }
}

fn eval_leaf(
    property: &str,
    value: &ConditionValue,
    context: &Value,
    op_name: &str,
    cmp: impl Fn(&Value, &Value) -> (MatchResult, String),
) -> ConditionTrace {
    let Some(prop_value) = lookup(property, context) else {
        return ConditionTrace::leaf(
            MatchResult::Unknown,
            format!("property {property:?} absent from context ({op_name})"),
        );
    };
    let Some(target) = literal_of(value) else {
        return ConditionTrace::leaf(
            MatchResult::Unknown,
            format!("{op_name}: unresolved reference value"),
        );
    };
    let (result, reason) = cmp(prop_value, target);
    ConditionTrace::leaf(result, reason)
}

fn eval_set_membership(
    property: &str,
    value: &ConditionValue,
    context: &Value,
    membership_matches: bool,
) -> ConditionTrace {
    let op_name = if membership_matches { "in" } else { "not_in" };
    let Some(prop_value) = lookup(property, context) else {
        return ConditionTrace::leaf(
            MatchResult::Unknown,
            format!("property {property:?} absent from context ({op_name})"),
        );
    };
    let Some(target) = literal_of(value) else {
        return ConditionTrace::leaf(
            MatchResult::Unknown,
            format!("{op_name}: unresolved reference value"),
        );
    };
    let Some(arr) = target.as_array() else {
        return ConditionTrace::leaf(
            MatchResult::Unknown,
            format!("{op_name}: reference did not resolve to an array"),
        );
    };
    let is_member = arr.iter().any(|item| item == prop_value);
    let matched = is_member == membership_matches;
    let result = if matched {
        MatchResult::Matched
    } else {
        MatchResult::NotMatched
    };
    ConditionTrace::leaf(result, format!("{op_name}: member={is_member}"))
}

/// Ordering comparison: numbers compare numerically, strings compare
/// lexicographically, mixed types are `unknown` (not an error).
fn eval_ordering(
    property: &str,
    value: &ConditionValue,
    context: &Value,
    op_name: &str,
    accept: impl Fn(std::cmp::Ordering) -> bool,
) -> ConditionTrace {
    let Some(prop_value) = lookup(property, context) else {
        return ConditionTrace::leaf(
            MatchResult::Unknown,
            format!("property {property:?} absent from context ({op_name})"),
        );
    };
    let Some(target) = literal_of(value) else {
        return ConditionTrace::leaf(
            MatchResult::Unknown,
            format!("{op_name}: unresolved reference value"),
        );
    };
    match (prop_value.as_f64(), target.as_f64()) {
        (Some(a), Some(b)) => {
            let Some(ord) = a.partial_cmp(&b) else {
                return ConditionTrace::leaf(MatchResult::Unknown, format!("{op_name}: NaN comparison"));
            };
            let result = if accept(ord) {
                MatchResult::Matched
            } else {
                MatchResult::NotMatched
            };
            return ConditionTrace::leaf(result, format!("{op_name}: numeric compare {ord:?}"));
        }
        _ => {}
    }
    match (prop_value.as_str(), target.as_str()) {
        (Some(a), Some(b)) => {
            let ord = a.cmp(b);
            let result = if accept(ord) {
                MatchResult::Matched
            } else {
                MatchResult::NotMatched
            };
            ConditionTrace::leaf(result, format!("{op_name}: lexicographic compare {ord:?}"))
        }
        _ => ConditionTrace::leaf(
            MatchResult::Unknown,
            format!("{op_name}: mixed/unorderable types"),
        ),
    }
}

fn eval_segmentation(
    property: &str,
    from_percentage: f64,
    to_percentage: f64,
    seed: &str,
    context: &Value,
) -> ConditionTrace {
    let Some(prop_value) = lookup(property, context) else {
        return ConditionTrace::leaf(
            MatchResult::Unknown,
            format!("property {property:?} absent from context (segmentation)"),
        );
    };
    let b = segmentation::bucket(seed, prop_value) as f64;
    let matched = b >= from_percentage && b < to_percentage;
    let result = if matched {
        MatchResult::Matched
    } else {
        MatchResult::NotMatched
    };
    ConditionTrace::leaf(
        result,
        format!("segmentation: bucket={b} range=[{from_percentage}, {to_percentage})"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn base_only_no_overrides() {
        let base = json!(true);
        let result = evaluate(&base, &[], &json!({}));
        assert_eq!(result.final_value, json!(true));
        assert!(result.matched_override.is_none());
        assert!(result.trace.is_empty());
    }

    #[test]
    fn equals_match_selects_override() {
        let base = json!("free");
        let vip_value = json!("paid");
        let conditions = vec![Condition::equals("plan", json!("premium"))];
        let overrides = vec![EvalOverride {
            name: "vip",
            conditions: &conditions,
            value: &vip_value,
        }];
        let result = evaluate(&base, &overrides, &json!({"plan": "premium"}));
        assert_eq!(result.final_value, json!("paid"));
        assert_eq!(result.matched_override.as_deref(), Some("vip"));
    }

    #[test]
    fn unknown_property_does_not_match() {
        let base = json!("free");
        let vip_value = json!("paid");
        let conditions = vec![Condition::equals("plan", json!("premium"))];
        let overrides = vec![EvalOverride {
            name: "vip",
            conditions: &conditions,
            value: &vip_value,
        }];
        let result = evaluate(&base, &overrides, &json!({}));
        assert_eq!(result.final_value, json!("free"));
        assert!(result.matched_override.is_none());
        assert_eq!(result.trace[0].result, MatchResult::Unknown);
        assert_eq!(result.trace[0].conditions[0].result, MatchResult::Unknown);
    }

    #[test]
    fn segmentation_routes_by_bucket() {
        let base = json!("A");
        let b_value = json!("B");
        let conditions = vec![Condition::segmentation("userId", 0.0, 50.0, "exp-1")];
        let overrides = vec![EvalOverride {
            name: "exp",
            conditions: &conditions,
            value: &b_value,
        }];
        // bucket("exp-1", "u-001") == 45 per golden vectors -> in [0, 50)
        let result = evaluate(&base, &overrides, &json!({"userId": "u-001"}));
        assert_eq!(result.final_value, json!("B"));
        // bucket("exp-1", "u-042") == 86 per golden vectors -> not in [0, 50)
        let result = evaluate(&base, &overrides, &json!({"userId": "u-042"}));
        assert_eq!(result.final_value, json!("A"));
    }

    #[test]
    fn and_short_circuits_on_not_matched() {
        let c = Condition::And {
            conditions: vec![
                Condition::equals("a", json!(1)),
                Condition::equals("b", json!(2)),
            ],
        };
        let t = evaluate_condition(&c, &json!({"a": 2, "b": 2}));
        assert_eq!(t.result, MatchResult::NotMatched);
    }

    #[test]
    fn and_is_unknown_when_no_not_matched_but_unknown_present() {
        let c = Condition::And {
            conditions: vec![
                Condition::equals("a", json!(1)),
                Condition::equals("missing", json!(2)),
            ],
        };
        let t = evaluate_condition(&c, &json!({"a": 1}));
        assert_eq!(t.result, MatchResult::Unknown);
    }

    #[test]
    fn or_matches_on_first_matched_child() {
        let c = Condition::Or {
            conditions: vec![
                Condition::equals("a", json!(1)),
                Condition::equals("missing", json!(2)),
            ],
        };
        let t = evaluate_condition(&c, &json!({"a": 1}));
        assert_eq!(t.result, MatchResult::Matched);
    }

    #[test]
    fn not_inverts_matched_and_not_matched_but_not_unknown() {
        let matched = Condition::Not {
            condition: Box::new(Condition::equals("a", json!(1))),
        };
        assert_eq!(
            evaluate_condition(&matched, &json!({"a": 1})).result,
            MatchResult::NotMatched
        );
        let unknown = Condition::Not {
            condition: Box::new(Condition::equals("missing", json!(1))),
        };
        assert_eq!(
            evaluate_condition(&unknown, &json!({})).result,
            MatchResult::Unknown
        );
    }

    #[test]
    fn empty_and_is_vacuously_matched() {
        let c = Condition::And { conditions: vec![] };
        assert_eq!(evaluate_condition(&c, &json!({})).result, MatchResult::Matched);
    }

    #[test]
    fn empty_or_is_vacuously_not_matched() {
        let c = Condition::Or { conditions: vec![] };
        assert_eq!(evaluate_condition(&c, &json!({})).result, MatchResult::NotMatched);
    }

    #[test]
    fn mixed_type_comparison_is_unknown_not_error() {
        let c = Condition::LessThan {
            property: "x".into(),
            value: ConditionValue::literal(json!("5")),
        };
        let t = evaluate_condition(&c, &json!({"x": 3}));
        assert_eq!(t.result, MatchResult::Unknown);
    }

    #[test]
    fn numeric_comparison_orders_numerically() {
        let c = Condition::LessThan {
            property: "x".into(),
            value: ConditionValue::literal(json!(10)),
        };
        assert_eq!(
            evaluate_condition(&c, &json!({"x": 3})).result,
            MatchResult::Matched
        );
    }

    #[test]
    fn string_comparison_orders_lexicographically() {
        let c = Condition::LessThan {
            property: "x".into(),
            value: ConditionValue::literal(json!("banana")),
        };
        assert_eq!(
            evaluate_condition(&c, &json!({"x": "apple"})).result,
            MatchResult::Matched
        );
    }

    #[test]
    fn first_match_wins_in_declared_order() {
        let base = json!("base");
        let first_value = json!("first");
        let second_value = json!("second");
        let always = vec![Condition::And { conditions: vec![] }];
        let overrides = vec![
            EvalOverride {
                name: "first",
                conditions: &always,
                value: &first_value,
            },
            EvalOverride {
                name: "second",
                conditions: &always,
                value: &second_value,
            },
        ];
        let result = evaluate(&base, &overrides, &json!({}));
        assert_eq!(result.final_value, json!("first"));
        assert_eq!(result.matched_override.as_deref(), Some("first"));
        assert_eq!(result.trace.len(), 2, "both overrides recorded in trace order");
    }

    #[test]
    fn determinism_across_repeated_calls() {
        let base = json!("base");
        let value = json!("override");
        let conditions = vec![Condition::equals("a", json!(1))];
        let overrides = vec![EvalOverride {
            name: "o",
            conditions: &conditions,
            value: &value,
        }];
        let ctx = json!({"a": 1});
        let r1 = evaluate(&base, &overrides, &ctx);
        let r2 = evaluate(&base, &overrides, &ctx);
        assert_eq!(r1.final_value, r2.final_value);
        assert_eq!(r1.matched_override, r2.matched_override);
    }
}
