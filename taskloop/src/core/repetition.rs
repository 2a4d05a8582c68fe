//! Detection of an oracle stuck proposing the same action.

use std::collections::VecDeque;

use serde_json::Value;

use crate::core::types::ActionCall;

/// Number of identical consecutive signatures that aborts a run.
pub const REPETITION_WINDOW: usize = 4;

/// Canonical signature of an action call: name plus arguments serialized
/// with object keys sorted at every depth, so map iteration order never
/// affects equality.
pub fn signature(call: &ActionCall) -> String {
    let mut buf = String::with_capacity(call.name.len() + 32);
    buf.push_str(&call.name);
    buf.push('(');
    write_canonical(&Value::Object(call.args.clone()), &mut buf);
    buf.push(')');
    buf
}

fn write_canonical(value: &Value, buf: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            buf.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    buf.push(',');
                }
                buf.push_str(&Value::String((*key).clone()).to_string());
                buf.push(':');
                write_canonical(&map[key.as_str()], buf);
            }
            buf.push('}');
        }
        Value::Array(items) => {
            buf.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    buf.push(',');
                }
                write_canonical(item, buf);
            }
            buf.push(']');
        }
        scalar => buf.push_str(&scalar.to_string()),
    }
}

/// Rolling window over the last [`REPETITION_WINDOW`] signatures.
#[derive(Debug, Clone, Default)]
pub struct RepetitionGuard {
    window: VecDeque<String>,
}

impl RepetitionGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a signature. Returns `true` when the window is full and every
    /// entry is identical, meaning the run must stop.
    pub fn observe(&mut self, signature: String) -> bool {
        self.window.push_back(signature);
        while self.window.len() > REPETITION_WINDOW {
            self.window.pop_front();
        }
        self.window.len() == REPETITION_WINDOW
            && self.window.iter().all(|s| s == &self.window[0])
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }
}
