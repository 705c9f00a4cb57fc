//! Built-in control flow executors: start, end, answer, if-else and the
//! iteration entry marker.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::core::{RuntimeContext, Segment, Selector, VariablePool};
use crate::error::NodeError;
use crate::evaluator::{evaluate_cases, Case, Condition, LogicalOperator};
use crate::graph::NodeSpec;

use super::executor::{parse_variable_mappings, NodeExecutor, NodeRunResult, NodeStreamSink};

/// Mirrors declared user inputs into the node's outputs so downstream
/// selectors can address them as `[start_id, name]`.
pub struct StartExecutor;

#[async_trait]
impl NodeExecutor for StartExecutor {
    async fn run(
        &self,
        node: &NodeSpec,
        pool: &VariablePool,
        _ctx: &RuntimeContext,
        _sink: &NodeStreamSink,
    ) -> Result<NodeRunResult, NodeError> {
        let declared = parse_variable_mappings(&node.data);
        let outputs: HashMap<String, Segment> = if declared.is_empty() {
            pool.node_variables(crate::core::USER_INPUTS_NAMESPACE)
        } else {
            declared
                .iter()
                .map(|m| (m.variable.clone(), pool.user_input(&m.variable)))
                .collect()
        };
        let mut result = NodeRunResult::success(outputs);
        result.inputs = Some(json!(result
            .outputs
            .iter()
            .map(|(k, v)| (k.clone(), v.to_value()))
            .collect::<serde_json::Map<String, Value>>()));
        Ok(result)
    }
}

/// Collects the run's terminal outputs from declared selectors.
pub struct EndExecutor;

#[async_trait]
impl NodeExecutor for EndExecutor {
    async fn run(
        &self,
        node: &NodeSpec,
        pool: &VariablePool,
        _ctx: &RuntimeContext,
        _sink: &NodeStreamSink,
    ) -> Result<NodeRunResult, NodeError> {
        let outputs = resolve_output_mappings(&node.data, pool);
        Ok(NodeRunResult::success(outputs))
    }

    fn extract_variable_mapping(&self, config: &Value) -> Vec<super::executor::VariableMapping> {
        config
            .get("outputs")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }
}

fn resolve_output_mappings(config: &Value, pool: &VariablePool) -> HashMap<String, Segment> {
    let mappings: Vec<super::executor::VariableMapping> = config
        .get("outputs")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default();
    mappings
        .into_iter()
        .map(|m| {
            let value = pool.get(&m.value_selector);
            (m.variable, value)
        })
        .collect()
}

/// Renders the answer template and streams it as a single chunk.
///
/// Templates reference pool values with `{{#node_id.variable#}}` markers.
pub struct AnswerExecutor;

#[async_trait]
impl NodeExecutor for AnswerExecutor {
    async fn run(
        &self,
        node: &NodeSpec,
        pool: &VariablePool,
        _ctx: &RuntimeContext,
        sink: &NodeStreamSink,
    ) -> Result<NodeRunResult, NodeError> {
        let template = node
            .data
            .get("answer")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let answer = render_variable_template(template, pool);
        sink.chunk(answer.clone(), None);
        Ok(NodeRunResult::success(HashMap::from([(
            "answer".to_string(),
            Segment::String(answer),
        )])))
    }
}

/// Substitutes `{{#a.b#}}` markers with pool values.
pub fn render_variable_template(template: &str, pool: &VariablePool) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find("{{#") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 3..];
        match after.find("#}}") {
            Some(close) => {
                let selector = Selector::new(after[..close].trim().split('.'));
                out.push_str(&pool.get(&selector).to_display_string());
                rest = &after[close + 3..];
            }
            None => {
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Selects one outbound edge handle from its ordered case list.
pub struct IfElseExecutor;

#[async_trait]
impl NodeExecutor for IfElseExecutor {
    async fn run(
        &self,
        node: &NodeSpec,
        pool: &VariablePool,
        _ctx: &RuntimeContext,
        _sink: &NodeStreamSink,
    ) -> Result<NodeRunResult, NodeError> {
        let cases = parse_cases(&node.data)?;
        let selected = evaluate_cases(&cases, pool);
        let mut result = NodeRunResult::default().with_handle(selected.clone());
        result.outputs.insert(
            "result".to_string(),
            Segment::Boolean(selected != "false"),
        );
        result
            .outputs
            .insert("selected_case_id".to_string(), Segment::String(selected));
        Ok(result)
    }

    fn extract_variable_mapping(&self, config: &Value) -> Vec<super::executor::VariableMapping> {
        let Ok(cases) = parse_cases(config) else {
            return Vec::new();
        };
        cases
            .iter()
            .flat_map(|case| case.conditions.iter())
            .enumerate()
            .map(|(i, c)| super::executor::VariableMapping {
                variable: format!("condition_{i}"),
                value_selector: c.variable_selector.clone(),
            })
            .collect()
    }
}

/// Accepts both the `cases` form and the legacy single
/// `conditions`/`logical_operator` form, which maps to one `true` case.
fn parse_cases(config: &Value) -> Result<Vec<Case>, NodeError> {
    if let Some(cases) = config.get("cases") {
        return serde_json::from_value(cases.clone())
            .map_err(|e| NodeError::ConfigError(format!("invalid cases: {e}")));
    }
    let conditions: Vec<Condition> = config
        .get("conditions")
        .map(|v| {
            serde_json::from_value(v.clone())
                .map_err(|e| NodeError::ConfigError(format!("invalid conditions: {e}")))
        })
        .transpose()?
        .unwrap_or_default();
    if conditions.is_empty() {
        return Err(NodeError::ConfigError(
            "if-else node requires `cases` or `conditions`".to_string(),
        ));
    }
    let logical_operator = config
        .get("logical_operator")
        .and_then(|v| serde_json::from_value::<LogicalOperator>(v.clone()).ok())
        .unwrap_or_default();
    Ok(vec![Case {
        case_id: "true".to_string(),
        logical_operator,
        conditions,
    }])
}

/// Entry marker of an iteration body; does nothing by itself.
pub struct IterationStartExecutor;

#[async_trait]
impl NodeExecutor for IterationStartExecutor {
    async fn run(
        &self,
        _node: &NodeSpec,
        _pool: &VariablePool,
        _ctx: &RuntimeContext,
        _sink: &NodeStreamSink,
    ) -> Result<NodeRunResult, NodeError> {
        Ok(NodeRunResult::default())
    }
}

/// Executors for container nodes are never invoked; the engine runs their
/// subgraphs itself. Resolving one is a wiring mistake.
pub struct ContainerExecutor;

#[async_trait]
impl NodeExecutor for ContainerExecutor {
    async fn run(
        &self,
        node: &NodeSpec,
        _pool: &VariablePool,
        _ctx: &RuntimeContext,
        _sink: &NodeStreamSink,
    ) -> Result<NodeRunResult, NodeError> {
        Err(NodeError::ExecutionError(format!(
            "container node `{}` must be driven by the engine",
            node.id
        )))
    }
}
