//! Case and condition evaluation for branching nodes.
//!
//! An if-else node carries an ordered list of cases; the first case whose
//! conditions hold selects the outbound edge handle, otherwise the `false`
//! handle is taken.

use serde::{Deserialize, Serialize};

use crate::core::{Segment, Selector, VariablePool};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Case {
    pub case_id: String,
    #[serde(default)]
    pub logical_operator: LogicalOperator,
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub variable_selector: Selector,
    pub comparison_operator: ComparisonOperator,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicalOperator {
    #[default]
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComparisonOperator {
    #[serde(rename = "contains")]
    Contains,
    #[serde(rename = "not contains")]
    NotContains,
    #[serde(rename = "start with")]
    StartWith,
    #[serde(rename = "end with")]
    EndWith,
    #[serde(rename = "is")]
    Is,
    #[serde(rename = "is not")]
    IsNot,
    #[serde(rename = "empty")]
    Empty,
    #[serde(rename = "not empty")]
    NotEmpty,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "not in")]
    NotIn,
    #[serde(rename = "=", alias = "equal")]
    Equal,
    #[serde(rename = "≠", alias = "not equal")]
    NotEqual,
    #[serde(rename = ">", alias = "greater than")]
    GreaterThan,
    #[serde(rename = "<", alias = "less than")]
    LessThan,
    #[serde(rename = "≥", alias = "greater than or equal")]
    GreaterOrEqual,
    #[serde(rename = "≤", alias = "less than or equal")]
    LessOrEqual,
    #[serde(rename = "null")]
    Null,
    #[serde(rename = "not null")]
    NotNull,
}

/// Returns the handle of the first matching case, or `"false"`.
pub fn evaluate_cases(cases: &[Case], pool: &VariablePool) -> String {
    for case in cases {
        if evaluate_case(case, pool) {
            return case.case_id.clone();
        }
    }
    "false".to_string()
}

pub fn evaluate_case(case: &Case, pool: &VariablePool) -> bool {
    if case.conditions.is_empty() {
        return false;
    }
    match case.logical_operator {
        LogicalOperator::And => case.conditions.iter().all(|c| evaluate_condition(c, pool)),
        LogicalOperator::Or => case.conditions.iter().any(|c| evaluate_condition(c, pool)),
    }
}

pub fn evaluate_condition(condition: &Condition, pool: &VariablePool) -> bool {
    let actual = pool.get(&condition.variable_selector);
    let expected = condition.value.as_ref().map(Segment::from_value).unwrap_or_default();

    match condition.comparison_operator {
        ComparisonOperator::Contains => eval_contains(&actual, &expected),
        ComparisonOperator::NotContains => !eval_contains(&actual, &expected),
        ComparisonOperator::StartWith => actual
            .to_display_string()
            .starts_with(&expected.to_display_string()),
        ComparisonOperator::EndWith => actual
            .to_display_string()
            .ends_with(&expected.to_display_string()),
        ComparisonOperator::Is => actual.to_display_string() == expected.to_display_string(),
        ComparisonOperator::IsNot => actual.to_display_string() != expected.to_display_string(),
        ComparisonOperator::Empty => is_empty(&actual),
        ComparisonOperator::NotEmpty => !is_empty(&actual),
        ComparisonOperator::In => eval_in(&actual, &expected),
        ComparisonOperator::NotIn => !eval_in(&actual, &expected),
        ComparisonOperator::Equal => compare_numbers(&actual, &expected, |a, b| a == b),
        ComparisonOperator::NotEqual => compare_numbers(&actual, &expected, |a, b| a != b),
        ComparisonOperator::GreaterThan => compare_numbers(&actual, &expected, |a, b| a > b),
        ComparisonOperator::LessThan => compare_numbers(&actual, &expected, |a, b| a < b),
        ComparisonOperator::GreaterOrEqual => compare_numbers(&actual, &expected, |a, b| a >= b),
        ComparisonOperator::LessOrEqual => compare_numbers(&actual, &expected, |a, b| a <= b),
        ComparisonOperator::Null => actual.is_none(),
        ComparisonOperator::NotNull => !actual.is_none(),
    }
}

fn is_empty(segment: &Segment) -> bool {
    match segment {
        Segment::None => true,
        Segment::String(s) => s.is_empty(),
        Segment::Array(items) => items.is_empty(),
        Segment::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn eval_contains(actual: &Segment, expected: &Segment) -> bool {
    match actual {
        Segment::String(s) => s.contains(&expected.to_display_string()),
        Segment::Array(items) => items
            .iter()
            .any(|item| item.to_display_string() == expected.to_display_string()),
        _ => false,
    }
}

fn eval_in(actual: &Segment, expected: &Segment) -> bool {
    match expected {
        Segment::Array(items) => items
            .iter()
            .any(|item| item.to_display_string() == actual.to_display_string()),
        Segment::String(s) => s.contains(&actual.to_display_string()),
        _ => false,
    }
}

fn compare_numbers(actual: &Segment, expected: &Segment, op: fn(f64, f64) -> bool) -> bool {
    match (actual.as_f64(), expected.as_f64()) {
        (Some(a), Some(b)) => op(a, b),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pool_with(name: &str, value: serde_json::Value) -> VariablePool {
        let pool = VariablePool::new();
        pool.set("n", name, Segment::from_value(&value));
        pool
    }

    fn condition(name: &str, op: ComparisonOperator, value: Option<serde_json::Value>) -> Condition {
        Condition {
            variable_selector: Selector::new(["n", name]),
            comparison_operator: op,
            value,
        }
    }

    #[test]
    fn test_operator_serde_aliases() {
        let op: ComparisonOperator = serde_json::from_value(json!("≥")).unwrap();
        assert_eq!(op, ComparisonOperator::GreaterOrEqual);
        let op: ComparisonOperator =
            serde_json::from_value(json!("greater than or equal")).unwrap();
        assert_eq!(op, ComparisonOperator::GreaterOrEqual);
        let op: ComparisonOperator = serde_json::from_value(json!("not contains")).unwrap();
        assert_eq!(op, ComparisonOperator::NotContains);
    }

    #[test]
    fn test_contains() {
        let pool = pool_with("text", json!("hello world"));
        assert!(evaluate_condition(
            &condition("text", ComparisonOperator::Contains, Some(json!("world"))),
            &pool
        ));
        assert!(evaluate_condition(
            &condition("text", ComparisonOperator::NotContains, Some(json!("mars"))),
            &pool
        ));
    }

    #[test]
    fn test_contains_on_array() {
        let pool = pool_with("tags", json!(["a", "b"]));
        assert!(evaluate_condition(
            &condition("tags", ComparisonOperator::Contains, Some(json!("b"))),
            &pool
        ));
    }

    #[test]
    fn test_string_edges() {
        let pool = pool_with("text", json!("workflow"));
        assert!(evaluate_condition(
            &condition("text", ComparisonOperator::StartWith, Some(json!("work"))),
            &pool
        ));
        assert!(evaluate_condition(
            &condition("text", ComparisonOperator::EndWith, Some(json!("flow"))),
            &pool
        ));
        assert!(evaluate_condition(
            &condition("text", ComparisonOperator::Is, Some(json!("workflow"))),
            &pool
        ));
    }

    #[test]
    fn test_numeric_comparisons() {
        let pool = pool_with("score", json!(7));
        assert!(evaluate_condition(
            &condition("score", ComparisonOperator::GreaterThan, Some(json!(5))),
            &pool
        ));
        assert!(evaluate_condition(
            &condition("score", ComparisonOperator::LessOrEqual, Some(json!(7))),
            &pool
        ));
        assert!(!evaluate_condition(
            &condition("score", ComparisonOperator::NotEqual, Some(json!(7))),
            &pool
        ));
        // Numeric strings coerce.
        let pool = pool_with("score", json!("7.5"));
        assert!(evaluate_condition(
            &condition("score", ComparisonOperator::Equal, Some(json!(7.5))),
            &pool
        ));
    }

    #[test]
    fn test_empty_and_null() {
        let pool = pool_with("blank", json!(""));
        assert!(evaluate_condition(
            &condition("blank", ComparisonOperator::Empty, None),
            &pool
        ));
        assert!(evaluate_condition(
            &condition("missing", ComparisonOperator::Null, None),
            &pool
        ));
        assert!(evaluate_condition(
            &condition("blank", ComparisonOperator::NotNull, None),
            &pool
        ));
    }

    #[test]
    fn test_in_operators() {
        let pool = pool_with("kind", json!("b"));
        assert!(evaluate_condition(
            &condition("kind", ComparisonOperator::In, Some(json!(["a", "b"]))),
            &pool
        ));
        assert!(evaluate_condition(
            &condition("kind", ComparisonOperator::NotIn, Some(json!(["x", "y"]))),
            &pool
        ));
    }

    #[test]
    fn test_case_logic() {
        let pool = pool_with("x", json!(10));
        let case = Case {
            case_id: "case-1".into(),
            logical_operator: LogicalOperator::And,
            conditions: vec![
                condition("x", ComparisonOperator::GreaterThan, Some(json!(5))),
                condition("x", ComparisonOperator::LessThan, Some(json!(20))),
            ],
        };
        assert!(evaluate_case(&case, &pool));

        let or_case = Case {
            case_id: "case-2".into(),
            logical_operator: LogicalOperator::Or,
            conditions: vec![
                condition("x", ComparisonOperator::GreaterThan, Some(json!(100))),
                condition("x", ComparisonOperator::Equal, Some(json!(10))),
            ],
        };
        assert!(evaluate_case(&or_case, &pool));
    }

    #[test]
    fn test_first_matching_case_wins() {
        let pool = pool_with("x", json!(10));
        let cases = vec![
            Case {
                case_id: "too-big".into(),
                logical_operator: LogicalOperator::And,
                conditions: vec![condition("x", ComparisonOperator::GreaterThan, Some(json!(100)))],
            },
            Case {
                case_id: "true".into(),
                logical_operator: LogicalOperator::And,
                conditions: vec![condition("x", ComparisonOperator::GreaterThan, Some(json!(1)))],
            },
        ];
        assert_eq!(evaluate_cases(&cases, &pool), "true");
    }

    #[test]
    fn test_no_match_falls_through() {
        let pool = pool_with("x", json!(0));
        let cases = vec![Case {
            case_id: "positive".into(),
            logical_operator: LogicalOperator::And,
            conditions: vec![condition("x", ComparisonOperator::GreaterThan, Some(json!(0)))],
        }];
        assert_eq!(evaluate_cases(&cases, &pool), "false");
        assert_eq!(evaluate_cases(&[], &pool), "false");
    }

    #[test]
    fn test_empty_conditions_never_match() {
        let pool = VariablePool::new();
        let case = Case {
            case_id: "c".into(),
            logical_operator: LogicalOperator::And,
            conditions: vec![],
        };
        assert!(!evaluate_case(&case, &pool));
    }
}
