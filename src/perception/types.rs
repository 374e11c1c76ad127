use serde::{Deserialize, Serialize};

/// One compressed frame of the device screen.
///
/// `width`/`height` describe `image_bytes`; `original_*` the device frame
/// before scaling. `is_sensitive` marks a synthetic stand-in produced when
/// capture failed, never a real frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Screenshot {
    #[serde(skip)]
    pub image_bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub original_width: u32,
    pub original_height: u32,
    pub is_sensitive: bool,
}

/// Which mechanism kept the overlay out of a capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressionMode {
    /// Surface flagged as excluded from capture; still visible on screen.
    Excluded,
    /// Surface hidden for the duration of the capture.
    Hidden,
    /// Nothing to suppress.
    Untouched,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayState {
    pub visible: bool,
    pub capture_excluded: bool,
}

impl Default for OverlayState {
    fn default() -> Self {
        Self {
            visible: true,
            capture_excluded: false,
        }
    }
}
