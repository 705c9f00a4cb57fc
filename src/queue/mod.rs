//! Task event queue: publication, streaming consumption and the KV-backed
//! ownership and stop-flag protocol.

mod kv;
mod manager;

pub use kv::{InMemoryKvStore, KvStore};
pub use manager::{
    task_belong_key, task_stopped_key, AppQueueManager, ControlEvent, InvokeFrom, PublishFrom,
    QueueEvent, QueueListener,
};
