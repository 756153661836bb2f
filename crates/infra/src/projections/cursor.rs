//! Per-stream projection cursors.
//!
//! Remember the last applied `sequence_number` of every stream so a projection can ignore
//! redelivered events and notice missing ones.

use std::collections::HashMap;
use std::sync::RwLock;

use factorops_core::TenantId;
use factorops_events::StreamKey;

/// What to do with an incoming envelope.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CursorCheck {
    Apply,
    /// Already applied (duplicate delivery).
    Skip,
    /// A hole or a zero sequence number: the stream must be replayed.
    Gap { last: u64, found: u64 },
}

#[derive(Debug, Default)]
pub struct StreamCursors {
    inner: RwLock<HashMap<StreamKey, u64>>,
}

impl StreamCursors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last(&self, stream: StreamKey) -> u64 {
        self.inner
            .read()
            .ok()
            .and_then(|m| m.get(&stream).copied())
            .unwrap_or(0)
    }

    pub fn check(&self, stream: StreamKey, seq: u64) -> CursorCheck {
        let last = self.last(stream);
        match seq {
            0 => CursorCheck::Gap { last, found: 0 },
            s if s <= last => CursorCheck::Skip,
            // An unseen stream accepts any start (subscription opened mid-stream).
            s if last != 0 && s != last + 1 => CursorCheck::Gap { last, found: s },
            _ => CursorCheck::Apply,
        }
    }

    pub fn advance(&self, stream: StreamKey, seq: u64) {
        if let Ok(mut m) = self.inner.write() {
            m.insert(stream, seq);
        }
    }

    pub fn clear_tenant(&self, tenant_id: TenantId) {
        if let Ok(mut m) = self.inner.write() {
            m.retain(|k, _| k.tenant_id != tenant_id);
        }
    }
}
