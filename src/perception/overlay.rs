//! Overlay coordination for screen capture.
//!
//! The overlay is driven through an explicit [`OverlayControl`] capability.
//! [`OverlaySuppression`] takes it out of the next frame and puts it back
//! when dropped, on every exit path.

use std::sync::Arc;

use tokio::sync::watch;

use crate::perception::types::{OverlayState, SuppressionMode};

pub trait OverlayControl: Send + Sync {
    /// True when the surface can be excluded from capture without hiding it.
    fn supports_capture_exclusion(&self) -> bool;

    fn is_visible(&self) -> bool;

    fn set_visible(&self, visible: bool);

    fn set_capture_excluded(&self, excluded: bool);
}

/// For runs without any overlay surface.
pub struct NoOverlay;

impl OverlayControl for NoOverlay {
    fn supports_capture_exclusion(&self) -> bool {
        false
    }

    fn is_visible(&self) -> bool {
        false
    }

    fn set_visible(&self, _visible: bool) {}

    fn set_capture_excluded(&self, _excluded: bool) {}
}

/// Overlay state published on a watch channel; the UI owner subscribes and
/// applies each change to the real surface.
pub struct OverlayHandle {
    tx: watch::Sender<OverlayState>,
    exclusion_supported: bool,
}

impl OverlayHandle {
    pub fn new(exclusion_supported: bool) -> (Self, watch::Receiver<OverlayState>) {
        let (tx, rx) = watch::channel(OverlayState::default());
        (
            Self {
                tx,
                exclusion_supported,
            },
            rx,
        )
    }

    pub fn state(&self) -> OverlayState {
        *self.tx.borrow()
    }
}

impl OverlayControl for OverlayHandle {
    fn supports_capture_exclusion(&self) -> bool {
        self.exclusion_supported
    }

    fn is_visible(&self) -> bool {
        self.tx.borrow().visible
    }

    fn set_visible(&self, visible: bool) {
        self.tx.send_modify(|s| s.visible = visible);
    }

    fn set_capture_excluded(&self, excluded: bool) {
        self.tx.send_modify(|s| s.capture_excluded = excluded);
    }
}

/// Scoped suppression; restores the overlay on drop.
pub struct OverlaySuppression {
    overlay: Arc<dyn OverlayControl>,
    mode: SuppressionMode,
}

impl OverlaySuppression {
    pub fn engage(overlay: Arc<dyn OverlayControl>) -> Self {
        let mode = if overlay.supports_capture_exclusion() {
            overlay.set_capture_excluded(true);
            SuppressionMode::Excluded
        } else if overlay.is_visible() {
            overlay.set_visible(false);
            SuppressionMode::Hidden
        } else {
            SuppressionMode::Untouched
        };
        tracing::trace!(?mode, "overlay suppressed");
        Self { overlay, mode }
    }

    pub fn mode(&self) -> SuppressionMode {
        self.mode
    }
}

impl Drop for OverlaySuppression {
    fn drop(&mut self) {
        match self.mode {
            SuppressionMode::Excluded => self.overlay.set_capture_excluded(false),
            SuppressionMode::Hidden => self.overlay.set_visible(true),
            SuppressionMode::Untouched => {}
        }
        tracing::trace!(mode = ?self.mode, "overlay restored");
    }
}
