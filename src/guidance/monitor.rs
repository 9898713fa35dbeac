use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::guidance::session::GuidanceSession;

/// Background popup watcher: polls the screen every couple of seconds and
/// feeds frames through the session's change gate. The gate is what keeps
/// this cheap; the monitor itself captures unconditionally while a goal is
/// active and goes quiet otherwise.
pub struct BackgroundMonitor {
    stop: Arc<AtomicBool>,
    handle: tokio::task::JoinHandle<()>,
}

impl BackgroundMonitor {
    pub fn spawn(session: Arc<GuidanceSession>, interval: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        // Hold the session weakly so a dropped host tears the loop down.
        let weak = Arc::downgrade(&session);
        drop(session);

        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if flag.load(Ordering::Relaxed) {
                    break;
                }
                let Some(session) = weak.upgrade() else {
                    break;
                };
                if session.is_active() {
                    session.background_poll_once().await;
                }
            }
            tracing::debug!("background monitor stopped");
        });

        Self { stop, handle }
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for BackgroundMonitor {
    fn drop(&mut self) {
        self.stop();
        self.handle.abort();
    }
}
