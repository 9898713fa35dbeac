//! Coordinate resolution: strict accessibility-first priority.
//!
//! The accessibility tree gives pixel-exact, resolution-independent
//! geometry when it resolves; the model's pixel guess covers what the tree
//! cannot see (canvas-rendered UI, custom widgets). The two are never
//! blended: they may not even share a coordinate space.
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::accessibility::{find_with_timeout, ElementFinder, TargetDescriptor};
use crate::guidance::parser::RawCoordinates;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinateSource {
    Accessibility,
    Ai,
}

/// The single best screen coordinate for the current step, plus provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedCoordinate {
    pub x: f64,
    pub y: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
    pub source: CoordinateSource,
}

pub struct CoordinateResolver {
    finder: Option<Arc<dyn ElementFinder>>,
    lookup_timeout: Duration,
}

impl CoordinateResolver {
    pub fn new(finder: Option<Arc<dyn ElementFinder>>, lookup_timeout: Duration) -> Self {
        Self {
            finder,
            lookup_timeout,
        }
    }

    /// Resolution order:
    /// 1. accessibility lookup on the target text → box center, tagged
    ///    `Accessibility`; every failure mode degrades silently to
    /// 2. the model's fallback coordinates as-is, tagged `Ai`;
    /// 3. `None` when neither exists.
    pub async fn resolve(
        &self,
        target: Option<&TargetDescriptor>,
        fallback: Option<&RawCoordinates>,
    ) -> Option<ResolvedCoordinate> {
        if let Some(target) = target.filter(|t| !t.text.is_empty()) {
            if let Some(finder) = &self.finder {
                if let Some(bounds) =
                    find_with_timeout(finder.as_ref(), target, self.lookup_timeout).await
                {
                    tracing::debug!(
                        target = %target.text,
                        x = bounds.x,
                        y = bounds.y,
                        "target resolved via accessibility tree"
                    );
                    return Some(ResolvedCoordinate {
                        x: bounds.x + bounds.width / 2.0,
                        y: bounds.y + bounds.height / 2.0,
                        width: Some(bounds.width),
                        height: Some(bounds.height),
                        source: CoordinateSource::Accessibility,
                    });
                }
            } else {
                tracing::debug!(target = %target.text, "no element finder configured");
            }
        }

        if let Some(coords) = fallback {
            tracing::debug!(x = coords.x, y = coords.y, "falling back to AI coordinates");
            return Some(ResolvedCoordinate {
                x: coords.x,
                y: coords.y,
                width: coords.width,
                height: coords.height,
                source: CoordinateSource::Ai,
            });
        }

        None
    }
}
