use async_trait::async_trait;

use crate::errors::{WaypostError, WaypostResult};
use crate::perception::types::{CapturedFrame, FrameMeta};

/// Capability trait for grabbing a frame of the current display.
/// Implementations must exclude the assistant's own overlay where the
/// platform allows it; failure (permissions, no display) is an error the
/// loop degrades from, never a panic.
#[async_trait]
pub trait ScreenCapture: Send + Sync {
    async fn capture(&self) -> WaypostResult<CapturedFrame>;
}

/// Primary-monitor capture backed by `xcap`, encoded as PNG.
pub struct XcapCapture;

#[async_trait]
impl ScreenCapture for XcapCapture {
    async fn capture(&self) -> WaypostResult<CapturedFrame> {
        // xcap is blocking; keep it off the async threads.
        tokio::task::spawn_blocking(capture_primary_sync)
            .await
            .map_err(|e| WaypostError::Capture(format!("join: {e}")))?
    }
}

fn capture_primary_sync() -> WaypostResult<CapturedFrame> {
    let monitors = xcap::Monitor::all()
        .map_err(|e| WaypostError::Capture(format!("monitor enumeration: {e}")))?;

    let monitor = monitors
        .iter()
        .find(|m| m.is_primary())
        .or_else(|| monitors.first())
        .ok_or_else(|| WaypostError::Capture("no monitors available".into()))?;

    let rgba = monitor
        .capture_image()
        .map_err(|e| WaypostError::Capture(format!("capture: {e}")))?;

    let (width, height) = (rgba.width(), rgba.height());
    let mut png_bytes = Vec::new();
    image::DynamicImage::ImageRgba8(rgba)
        .write_to(
            &mut std::io::Cursor::new(&mut png_bytes),
            image::ImageFormat::Png,
        )
        .map_err(|e| WaypostError::Capture(format!("PNG encode: {e}")))?;

    tracing::debug!(
        width,
        height,
        bytes = png_bytes.len(),
        "primary monitor captured"
    );

    Ok(CapturedFrame {
        bytes: png_bytes,
        meta: FrameMeta {
            monitor_index: 0,
            scale_factor: monitor.scale_factor() as f64,
            physical_width: width,
            physical_height: height,
        },
    })
}
