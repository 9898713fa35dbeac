use serde::{Deserialize, Serialize};

use crate::guidance::resolver::CoordinateSource;

/// Ephemeral on-screen pointer at the target element. Keyed by a generated
/// id; at most one active set exists, cleared before a new one is shown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Highlight {
    pub id: String,
    pub x: f64,
    pub y: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
    pub source: CoordinateSource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechBubble {
    pub text: String,
    pub x: f64,
    pub y: f64,
}

/// Presentation sink. Fire-and-forget from the core's perspective: the
/// overlay process may drop any of these on the floor without affecting the
/// guidance loop.
pub trait Presenter: Send + Sync {
    fn show_highlight(&self, highlight: &Highlight);
    fn clear_highlights(&self);
    fn show_speech_bubble(&self, bubble: &SpeechBubble);
    fn dismiss_speech_bubble(&self);
}

/// Presenter that drops everything; useful for headless hosts and tests.
pub struct NullPresenter;

impl Presenter for NullPresenter {
    fn show_highlight(&self, highlight: &Highlight) {
        tracing::debug!(id = %highlight.id, x = highlight.x, y = highlight.y, "highlight (null sink)");
    }

    fn clear_highlights(&self) {}

    fn show_speech_bubble(&self, bubble: &SpeechBubble) {
        tracing::debug!(len = bubble.text.len(), "speech bubble (null sink)");
    }

    fn dismiss_speech_bubble(&self) {}
}
