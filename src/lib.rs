pub mod accessibility;
pub mod config;
pub mod errors;
pub mod guidance;
pub mod llm;
pub mod perception;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::accessibility::uia::UiaElementFinder;
use crate::errors::{WaypostError, WaypostResult};
use crate::guidance::monitor::BackgroundMonitor;
use crate::guidance::presenter::Presenter;
use crate::guidance::session::GuidanceSession;
use crate::llm::registry::ProviderRegistry;
use crate::perception::screenshot::XcapCapture;

pub use crate::guidance::session::TranscriptEntry;

/// One-time process setup: tracing subscriber and .env loading.
pub fn init() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load .env file if present (ignore error if not found)
    let _ = dotenvy::dotenv();
}

/// A fully wired session plus its background popup watcher.
pub struct Waypost {
    pub session: Arc<GuidanceSession>,
    pub monitor: BackgroundMonitor,
}

/// Builds a session with the stock capabilities: xcap capture, the platform
/// accessibility finder, and providers from config.toml. The host supplies
/// only the presentation sink.
pub fn bootstrap(presenter: Arc<dyn Presenter>) -> WaypostResult<Waypost> {
    // The monitor task needs a runtime to land on; fail early instead of
    // letting tokio::spawn panic.
    if tokio::runtime::Handle::try_current().is_err() {
        return Err(WaypostError::Config(
            "bootstrap must be called from within a tokio runtime".into(),
        ));
    }

    let config = config::load_config()?;
    let registry = Arc::new(Mutex::new(ProviderRegistry::from_config(&config)));

    let poll_interval = Duration::from_millis(config.detection.poll_interval_ms);
    let session = Arc::new(GuidanceSession::new(
        registry,
        Arc::new(XcapCapture),
        Some(Arc::new(UiaElementFinder)),
        presenter,
        config.detection,
        config.accessibility,
    ));

    let monitor = BackgroundMonitor::spawn(session.clone(), poll_interval);
    tracing::info!("waypost session bootstrapped");

    Ok(Waypost { session, monitor })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guidance::presenter::NullPresenter;

    #[test]
    fn test_bootstrap_outside_a_runtime_is_an_error() {
        let err = match bootstrap(Arc::new(NullPresenter)) {
            Err(e) => e,
            Ok(_) => panic!("bootstrap succeeded without a runtime"),
        };
        assert!(err.to_string().contains("tokio runtime"));
    }
}
