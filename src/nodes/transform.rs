//! Value-shaping executors: template rendering, aggregation and
//! assignment.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::core::{RuntimeContext, Segment, Selector, VariablePool};
use crate::error::NodeError;
use crate::graph::NodeSpec;

use super::executor::{parse_variable_mappings, NodeExecutor, NodeRunResult, NodeStreamSink};

/// Renders a Jinja template over the declared variable mappings and writes
/// the result to `output`.
pub struct TemplateTransformExecutor;

#[async_trait]
impl NodeExecutor for TemplateTransformExecutor {
    async fn run(
        &self,
        node: &NodeSpec,
        pool: &VariablePool,
        _ctx: &RuntimeContext,
        _sink: &NodeStreamSink,
    ) -> Result<NodeRunResult, NodeError> {
        let template = node
            .data
            .get("template")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                NodeError::ConfigError("template-transform node requires `template`".to_string())
            })?;

        let mut vars: HashMap<String, Value> = HashMap::new();
        for mapping in parse_variable_mappings(&node.data) {
            vars.insert(mapping.variable, pool.get(&mapping.value_selector).to_value());
        }

        let mut env = minijinja::Environment::new();
        env.add_template("node", template)?;
        let rendered = env.get_template("node")?.render(&vars)?;

        let mut result = NodeRunResult::success(HashMap::from([(
            "output".to_string(),
            Segment::String(rendered),
        )]));
        result.inputs = Some(Value::Object(vars.into_iter().collect()));
        Ok(result)
    }
}

/// Emits the first non-empty value among its candidate selectors, the
/// fan-in counterpart of branching. The legacy `variable-assigner` tag
/// shares this behavior.
pub struct VariableAggregatorExecutor;

#[async_trait]
impl NodeExecutor for VariableAggregatorExecutor {
    async fn run(
        &self,
        node: &NodeSpec,
        pool: &VariablePool,
        _ctx: &RuntimeContext,
        _sink: &NodeStreamSink,
    ) -> Result<NodeRunResult, NodeError> {
        let selectors: Vec<Selector> = node
            .data
            .get("variables")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        let output = selectors
            .iter()
            .map(|s| pool.get(s))
            .find(|segment| !segment.is_none())
            .unwrap_or_default();
        Ok(NodeRunResult::success(HashMap::from([(
            "output".to_string(),
            output,
        )])))
    }

    fn extract_variable_mapping(&self, config: &Value) -> Vec<super::executor::VariableMapping> {
        let selectors: Vec<Selector> = config
            .get("variables")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        selectors
            .into_iter()
            .enumerate()
            .map(|(i, value_selector)| super::executor::VariableMapping {
                variable: format!("candidate_{i}"),
                value_selector,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum AssignOperation {
    OverWrite,
    Append,
    Clear,
}

#[derive(Debug, Deserialize)]
struct AssignItem {
    variable_selector: Selector,
    #[serde(default)]
    input_variable_selector: Option<Selector>,
    operation: AssignOperation,
}

/// Writes values into long-lived variables outside the node's own
/// namespace. The writes are declared on the result and applied by the
/// engine, keeping executors free of direct pool mutation.
pub struct ConversationVariableAssignerExecutor;

#[async_trait]
impl NodeExecutor for ConversationVariableAssignerExecutor {
    async fn run(
        &self,
        node: &NodeSpec,
        pool: &VariablePool,
        _ctx: &RuntimeContext,
        _sink: &NodeStreamSink,
    ) -> Result<NodeRunResult, NodeError> {
        let items: Vec<AssignItem> = node
            .data
            .get("items")
            .map(|v| {
                serde_json::from_value(v.clone())
                    .map_err(|e| NodeError::ConfigError(format!("invalid items: {e}")))
            })
            .transpose()?
            .unwrap_or_default();

        let mut result = NodeRunResult::default();
        for item in items {
            let target = item.variable_selector.clone();
            if !target.is_valid() {
                return Err(NodeError::ConfigError(format!(
                    "invalid assignment target `{target}`"
                )));
            }
            let value = match item.operation {
                AssignOperation::Clear => Segment::None,
                AssignOperation::OverWrite => {
                    let source = item.input_variable_selector.as_ref().ok_or_else(|| {
                        NodeError::ConfigError("over-write requires a source selector".into())
                    })?;
                    pool.get(source)
                }
                AssignOperation::Append => {
                    let source = item.input_variable_selector.as_ref().ok_or_else(|| {
                        NodeError::ConfigError("append requires a source selector".into())
                    })?;
                    let incoming = pool.get(source);
                    match pool.get(&target) {
                        Segment::Array(mut items) => {
                            items.push(incoming);
                            Segment::Array(items)
                        }
                        Segment::None => Segment::Array(vec![incoming]),
                        existing => Segment::Array(vec![existing, incoming]),
                    }
                }
            };
            result.variable_updates.push((target, value));
        }
        Ok(result)
    }
}
