use async_trait::async_trait;

use crate::errors::WaypostResult;
use crate::llm::types::CallConfig;

/// Unified model provider trait. All providers implement this trait and
/// register with the `ProviderRegistry` under their config.toml key.
///
/// The same method serves both vision guidance (one or more frames) and
/// text-only triage calls (empty `frames`).
#[async_trait]
pub trait VisionProvider: Send + Sync {
    /// Returns the provider's identifier (matches config.toml key).
    fn name(&self) -> &str;

    /// Sends the prompt plus zero or more encoded frames, returning the
    /// model's free-form text response.
    async fn analyze(
        &self,
        frames: &[Vec<u8>],
        prompt: &str,
        system: Option<&str>,
        cfg: &CallConfig,
    ) -> WaypostResult<String>;
}
