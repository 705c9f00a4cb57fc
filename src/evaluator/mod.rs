//! Condition evaluation used by branching nodes.

mod condition;

pub use condition::{
    evaluate_case, evaluate_cases, evaluate_condition, Case, ComparisonOperator, Condition,
    LogicalOperator,
};
