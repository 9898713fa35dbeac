use serde::{Deserialize, Serialize};

/// External events that can kick off a guidance check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Hotkey,
    Click,
    WindowShown,
}

pub type TriggerHandler = Box<dyn Fn() + Send + Sync>;

/// Event source registration point (global hotkey hook, OS click monitor,
/// window observer). Implemented by the host shell.
pub trait TriggerSource: Send + Sync {
    fn subscribe(&self, kind: TriggerKind, handler: TriggerHandler) -> Subscription;
}

/// Disposal handle for one registration. Dropping it unhooks the handler;
/// the owning session releases all of these on reset and teardown.
pub struct Subscription {
    kind: TriggerKind,
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(kind: TriggerKind, cancel: Box<dyn FnOnce() + Send>) -> Self {
        Self {
            kind,
            cancel: Some(cancel),
        }
    }

    pub fn kind(&self) -> TriggerKind {
        self.kind
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            tracing::debug!(kind = ?self.kind, "trigger subscription released");
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("kind", &self.kind)
            .field("live", &self.cancel.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_drop_runs_cancel_exactly_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let sub = Subscription::new(
            TriggerKind::Hotkey,
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(sub.kind(), TriggerKind::Hotkey);
        drop(sub);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
