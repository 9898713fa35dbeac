use serde::{Deserialize, Serialize};

use crate::perception::differ::Fingerprint;

/// One captured frame of the primary display, encoded as PNG.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub bytes: Vec<u8>,
    pub meta: FrameMeta,
}

impl CapturedFrame {
    pub fn byte_len(&self) -> u64 {
        self.bytes.len() as u64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameMeta {
    pub monitor_index: u32,
    pub scale_factor: f64,
    pub physical_width: u32,
    pub physical_height: u32,
}

/// The loop never retains frame pixels between cycles, only these stats,
/// which is all the change detectors need.
#[derive(Debug, Clone)]
pub struct FrameStats {
    pub fingerprint: Fingerprint,
    pub byte_len: u64,
}
