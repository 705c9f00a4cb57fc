//! Node executors: the polymorphic contract, the compile-time registry
//! and the built-in implementations.

mod control_flow;
mod executor;
mod registry;
mod stubs;
mod transform;

pub use control_flow::{
    render_variable_template, AnswerExecutor, EndExecutor, IfElseExecutor,
    IterationStartExecutor, StartExecutor,
};
pub use executor::{
    parse_variable_mappings, NodeExecutor, NodeRunResult, NodeStreamSink, VariableMapping,
};
pub use registry::NodeRegistry;
pub use stubs::{QuestionClassifierStub, StubExecutor};
pub use transform::{
    ConversationVariableAssignerExecutor, TemplateTransformExecutor, VariableAggregatorExecutor,
};
