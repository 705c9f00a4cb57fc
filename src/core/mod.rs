//! Execution core: variable pool, runtime context, event model, stop
//! signal and the graph engine.

mod context;
mod engine;
mod event;
mod stop;
mod variable_pool;

pub use context::{
    FakeIdGenerator, FakeTimeProvider, IdGenerator, RealIdGenerator, RealTimeProvider,
    RuntimeContext, TimeProvider,
};
pub use engine::{GraphEngine, RunOutcome};
pub use event::{
    EventEmitter, GraphEngineEvent, IterationScope, NodeEventMeta, NodeRunStatus, ParallelScope,
    RouteNodeState,
};
pub use stop::{StopReason, StopSignal};
pub use variable_pool::{
    Segment, Selector, VariablePool, ENVIRONMENT_NAMESPACE, SYSTEM_NAMESPACE,
    USER_INPUTS_NAMESPACE,
};
