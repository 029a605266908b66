//! Active call tracking and admission control.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Snapshot of one live call.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveCall {
    pub call_id: String,
    pub stream_sid: Option<String>,
    pub call_sid: Option<String>,
    pub started_at: DateTime<Utc>,
}

/// Registry of calls currently being relayed.
///
/// `max_calls == 0` means no limit.
pub struct CallRegistry {
    max_calls: usize,
    calls: Mutex<HashMap<String, ActiveCall>>,
}

impl CallRegistry {
    pub fn new(max_calls: usize) -> Arc<Self> {
        Arc::new(Self {
            max_calls,
            calls: Mutex::new(HashMap::new()),
        })
    }

    /// Reserve a slot for a new call. Returns `None` when at capacity.
    /// The slot is released when the returned guard is dropped.
    pub fn reserve(self: &Arc<Self>) -> Option<CallGuard> {
        let mut calls = self.calls.lock();
        if self.max_calls > 0 && calls.len() >= self.max_calls {
            return None;
        }
        let call_id = uuid::Uuid::new_v4().to_string();
        calls.insert(
            call_id.clone(),
            ActiveCall {
                call_id: call_id.clone(),
                stream_sid: None,
                call_sid: None,
                started_at: Utc::now(),
            },
        );
        Some(CallGuard {
            registry: Arc::clone(self),
            call_id,
        })
    }

    pub fn active_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn max_calls(&self) -> usize {
        self.max_calls
    }

    /// Live calls, oldest first.
    pub fn list(&self) -> Vec<ActiveCall> {
        let mut calls: Vec<ActiveCall> = self.calls.lock().values().cloned().collect();
        calls.sort_by_key(|c| c.started_at);
        calls
    }
}

/// Ownership of one registry slot.
#[derive(Debug)]
pub struct CallGuard {
    registry: Arc<CallRegistry>,
    call_id: String,
}

impl CallGuard {
    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    /// Record the telephony identifiers once the stream has started.
    pub fn attach(&self, stream_sid: &str, call_sid: Option<&str>) {
        if let Some(call) = self.registry.calls.lock().get_mut(&self.call_id) {
            call.stream_sid = Some(stream_sid.to_owned());
            call.call_sid = call_sid.map(str::to_owned);
        }
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.registry.calls.lock().remove(&self.call_id);
    }
}

impl std::fmt::Debug for CallRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallRegistry")
            .field("max_calls", &self.max_calls)
            .field("active", &self.active_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_drop_releases_slot() {
        let registry = CallRegistry::new(0);
        let guard = registry.reserve().unwrap();
        assert_eq!(registry.active_count(), 1);
        drop(guard);
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn capacity_is_enforced() {
        let registry = CallRegistry::new(2);
        let a = registry.reserve().unwrap();
        let _b = registry.reserve().unwrap();
        assert!(registry.reserve().is_none());

        drop(a);
        assert!(registry.reserve().is_some());
    }

    #[test]
    fn zero_means_unlimited() {
        let registry = CallRegistry::new(0);
        let guards: Vec<_> = (0..50).map(|_| registry.reserve().unwrap()).collect();
        assert_eq!(registry.active_count(), 50);
        drop(guards);
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn attach_records_telephony_ids() {
        let registry = CallRegistry::new(0);
        let guard = registry.reserve().unwrap();
        guard.attach("MZ1", Some("CA1"));

        let calls = registry.list();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].call_id, guard.call_id());
        assert_eq!(calls[0].stream_sid.as_deref(), Some("MZ1"));
        assert_eq!(calls[0].call_sid.as_deref(), Some("CA1"));
    }
}
