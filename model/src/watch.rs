use serde::{Deserialize, Serialize};

use crate::kv::KeyValue;

pub type WatchId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchEventKind {
    Put,
    Delete,
}

/// A single change delivered on a watch stream (SPEC_FULL.md §3, Watch Stream).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub watch_id: WatchId,
    pub kind: WatchEventKind,
    pub kv: KeyValue,
    pub prev_kv: Option<KeyValue>,
}
