pub mod uia;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::WaypostResult;

/// Semantic description of a UI element, independent of pixel coordinates.
/// Produced by the response parser, consumed by the element finder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetDescriptor {
    /// Visible text of the element (button label, menu title, ...).
    pub text: String,
    /// Element kind hint: "button", "tab", "menu", "input", ...
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Enclosing context hint (window or app name).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

/// Top-left + size box in physical screen pixels, as reported by the
/// platform accessibility tree.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ElementBounds {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Platform accessibility-tree lookup. Best effort: `Ok(None)` when the
/// element cannot be found or the platform exposes no tree at all.
#[async_trait]
pub trait ElementFinder: Send + Sync {
    async fn find(&self, target: &TargetDescriptor) -> WaypostResult<Option<ElementBounds>>;
}

/// Wraps a lookup in a deadline so a hung accessibility API can never block
/// the guidance loop. Timeout reads as "not found".
pub async fn find_with_timeout(
    finder: &dyn ElementFinder,
    target: &TargetDescriptor,
    timeout: Duration,
) -> Option<ElementBounds> {
    match tokio::time::timeout(timeout, finder.find(target)).await {
        Ok(Ok(bounds)) => bounds,
        Ok(Err(e)) => {
            tracing::warn!(error = %e, target = %target.text, "accessibility lookup failed");
            None
        }
        Err(_) => {
            tracing::warn!(target = %target.text, ?timeout, "accessibility lookup timed out");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SlowFinder;

    #[async_trait]
    impl ElementFinder for SlowFinder {
        async fn find(&self, _target: &TargetDescriptor) -> WaypostResult<Option<ElementBounds>> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Some(ElementBounds {
                x: 0.0,
                y: 0.0,
                width: 10.0,
                height: 10.0,
            }))
        }
    }

    struct FailingFinder;

    #[async_trait]
    impl ElementFinder for FailingFinder {
        async fn find(&self, _target: &TargetDescriptor) -> WaypostResult<Option<ElementBounds>> {
            Err(crate::errors::WaypostError::Accessibility("no tree".into()))
        }
    }

    fn target(text: &str) -> TargetDescriptor {
        TargetDescriptor {
            text: text.into(),
            kind: None,
            context: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_reads_as_not_found() {
        let found = find_with_timeout(&SlowFinder, &target("Save"), Duration::from_millis(50)).await;
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_lookup_error_reads_as_not_found() {
        let found =
            find_with_timeout(&FailingFinder, &target("Save"), Duration::from_secs(1)).await;
        assert!(found.is_none());
    }
}
