//! Screenshot acquisition.
//!
//! `capture()` never fails. The overlay is suppressed for the duration of the
//! capture, a raw frame is taken through the platform primitive when one is
//! available and through the shell otherwise, then scaled and compressed off
//! the async runtime. Any failure yields a synthetic black frame marked
//! sensitive.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use tokio::sync::Mutex;

use crate::config::ScreenshotConfig;
use crate::errors::{PilotError, PilotResult};
use crate::executor::command::quote_arg;
use crate::executor::platform::{DevicePlatform, PlatformError};
use crate::executor::CommandExecutor;
use crate::perception::encode::{process_frame, synthetic_frame, EncodeSettings};
use crate::perception::overlay::{OverlayControl, OverlaySuppression};
use crate::perception::types::{Screenshot, SuppressionMode};

pub struct ScreenshotPipeline {
    shell: Arc<dyn CommandExecutor>,
    platform: Option<Arc<dyn DevicePlatform>>,
    overlay: Arc<dyn OverlayControl>,
    cfg: ScreenshotConfig,
    /// One capture at a time; overlay state has a single owner.
    gate: Mutex<()>,
}

impl ScreenshotPipeline {
    pub fn new(
        shell: Arc<dyn CommandExecutor>,
        platform: Option<Arc<dyn DevicePlatform>>,
        overlay: Arc<dyn OverlayControl>,
        cfg: ScreenshotConfig,
    ) -> Self {
        Self {
            shell,
            platform,
            overlay,
            cfg,
            gate: Mutex::new(()),
        }
    }

    fn settings(&self) -> EncodeSettings {
        EncodeSettings {
            max_width: self.cfg.max_width,
            max_height: self.cfg.max_height,
            jpeg_quality: self.cfg.jpeg_quality,
        }
    }

    pub async fn capture(&self) -> Screenshot {
        let _turn = self.gate.lock().await;
        let settings = self.settings();
        let started = std::time::Instant::now();

        let suppression = OverlaySuppression::engage(self.overlay.clone());
        if suppression.mode() == SuppressionMode::Hidden && self.cfg.hide_settle_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.cfg.hide_settle_ms)).await;
        }

        let shot = match self.acquire_raw().await {
            Ok(raw) => encode_off_runtime(raw, settings).await,
            Err(e) => Err(e),
        };
        drop(suppression);

        match shot {
            Ok(shot) => {
                tracing::info!(
                    width = shot.width,
                    height = shot.height,
                    bytes = shot.image_bytes.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "screenshot captured"
                );
                shot
            }
            Err(e) => {
                tracing::warn!(error = %e, "screenshot failed, using synthetic frame");
                synthetic_frame(&settings)
            }
        }
    }

    async fn acquire_raw(&self) -> PilotResult<Vec<u8>> {
        if let Some(platform) = &self.platform {
            match platform.capture_png(None).await {
                Ok(png) if !png.is_empty() => return Ok(png),
                Ok(_) => tracing::warn!("platform capture returned an empty frame"),
                Err(PlatformError::Unsupported) => {
                    tracing::debug!("platform capture unsupported, using shell")
                }
                Err(e) => tracing::warn!(error = %e, "platform capture failed, using shell"),
            }
        }
        self.capture_via_shell().await
    }

    /// screencap to a device file, base64 it there and read it back in
    /// bounded slices. Temporary files are removed whatever the outcome.
    async fn capture_via_shell(&self) -> PilotResult<Vec<u8>> {
        let remote = self.cfg.remote_path.as_str();
        let encoded = format!("{remote}.b64");

        let result = self.read_back(remote, &encoded).await;

        let cleanup = self
            .shell
            .execute(&format!("rm -f {} {}", quote_arg(remote), quote_arg(&encoded)))
            .await;
        if !cleanup.is_success() {
            tracing::debug!(result = %cleanup, "temp file cleanup failed");
        }
        result
    }

    async fn read_back(&self, remote: &str, encoded: &str) -> PilotResult<Vec<u8>> {
        let remote_q = quote_arg(remote);
        let encoded_q = quote_arg(encoded);

        let shot = self.shell.execute(&format!("screencap -p {remote_q}")).await;
        if !shot.is_success() {
            return Err(PilotError::Perception(format!("screencap: {}", shot.body().trim())));
        }

        let sized = self
            .shell
            .execute(&format!(
                "base64 -w 0 {remote_q} > {encoded_q} && stat -c %s {encoded_q}"
            ))
            .await;
        if !sized.is_success() {
            return Err(PilotError::Perception(format!("base64: {}", sized.body().trim())));
        }
        let total: usize = sized
            .body()
            .trim()
            .parse()
            .map_err(|_| PilotError::Perception(format!("bad payload size: {:?}", sized.body())))?;

        let chunk = self.cfg.chunk_size.max(1);
        let mut payload = String::with_capacity(total);

        if total <= chunk {
            let out = self.shell.execute(&format!("cat {encoded_q}")).await;
            if !out.is_success() {
                return Err(PilotError::Perception(format!("read payload: {}", out.body().trim())));
            }
            push_clean(&mut payload, out.body());
        } else {
            let count = total.div_ceil(chunk);
            tracing::debug!(total, chunk, count, "reading screenshot in chunks");
            for i in 0..count {
                let out = self
                    .shell
                    .execute(&format!(
                        "dd if={encoded_q} bs={chunk} skip={i} count=1 2>/dev/null"
                    ))
                    .await;
                if !out.is_success() {
                    return Err(PilotError::Perception(format!(
                        "read chunk {i}/{count}: {}",
                        out.body().trim()
                    )));
                }
                push_clean(&mut payload, out.body());
            }
        }

        if payload.is_empty() {
            return Err(PilotError::Perception("empty screenshot payload".into()));
        }
        if payload.len() != total {
            tracing::warn!(expected = total, got = payload.len(), "payload size mismatch");
        }

        base64::engine::general_purpose::STANDARD
            .decode(payload.as_bytes())
            .map_err(|e| PilotError::Perception(format!("payload decode: {e}")))
    }
}

/// Append a chunk, dropping line breaks and other whitespace the transport adds.
fn push_clean(payload: &mut String, chunk: &str) {
    payload.extend(chunk.chars().filter(|c| !c.is_ascii_whitespace()));
}

async fn encode_off_runtime(raw: Vec<u8>, settings: EncodeSettings) -> PilotResult<Screenshot> {
    tokio::task::spawn_blocking(move || process_frame(&raw, &settings))
        .await
        .map_err(|e| PilotError::Perception(format!("join: {e}")))?
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use image::{DynamicImage, RgbImage};

    use super::*;
    use crate::executor::platform::testing::FakePlatform;
    use crate::executor::shell::testing::ScriptedShell;
    use crate::executor::shell::ShellExecutor;
    use crate::perception::overlay::{NoOverlay, OverlayHandle};

    fn png(w: u32, h: u32) -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(w, h, image::Rgb([10, 120, 240])));
        let mut out = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Png)
            .unwrap();
        out
    }

    fn cfg() -> ScreenshotConfig {
        ScreenshotConfig {
            max_width: 72,
            max_height: 128,
            chunk_size: 64,
            hide_settle_ms: 0,
            ..ScreenshotConfig::default()
        }
    }

    #[tokio::test]
    async fn platform_capture_preferred() {
        let shell = Arc::new(ScriptedShell::new());
        let platform = Arc::new(FakePlatform::with_png(png(144, 256)));
        let (overlay, rx) = OverlayHandle::new(true);
        let pipeline = ScreenshotPipeline::new(
            Arc::new(ShellExecutor::new(shell.clone())),
            Some(platform.clone()),
            Arc::new(overlay),
            cfg(),
        );

        let shot = pipeline.capture().await;
        assert!(!shot.is_sensitive);
        assert_eq!((shot.width, shot.height), (72, 128));
        assert_eq!((shot.original_width, shot.original_height), (144, 256));
        assert!(shell.calls().is_empty());
        assert_eq!(platform.calls(), vec!["capture None"]);
        assert!(!rx.borrow().capture_excluded);
    }

    #[tokio::test]
    async fn shell_path_reads_in_chunks() {
        let frame = png(40, 60);
        let b64 = base64::engine::general_purpose::STANDARD.encode(&frame);
        let chunk = 64;
        let count = b64.len().div_ceil(chunk);
        assert!(count > 1);

        let shell = Arc::new(ScriptedShell::new());
        shell.on("screencap -p", "", 0);
        shell.on("base64 -w 0", &format!("{}\n", b64.len()), 0);
        for piece in b64.as_bytes().chunks(chunk) {
            shell.on("dd if=", std::str::from_utf8(piece).unwrap(), 0);
        }

        let pipeline = ScreenshotPipeline::new(
            Arc::new(ShellExecutor::new(shell.clone())),
            Some(Arc::new(FakePlatform::unsupported())),
            Arc::new(NoOverlay),
            cfg(),
        );
        let shot = pipeline.capture().await;

        assert!(!shot.is_sensitive);
        assert_eq!((shot.width, shot.height), (40, 60));

        let calls = shell.calls();
        assert_eq!(calls.iter().filter(|c| c.starts_with("dd if=")).count(), count);
        assert!(calls.iter().any(|c| c.contains("bs=64 skip=1 count=1")));
        assert!(calls.last().unwrap().starts_with("rm -f "));
    }

    #[tokio::test]
    async fn small_payload_read_with_single_cat() {
        let frame = png(4, 4);
        let b64 = base64::engine::general_purpose::STANDARD.encode(&frame);

        let shell = Arc::new(ScriptedShell::new());
        shell.on("screencap -p", "", 0);
        shell.on("base64 -w 0", &b64.len().to_string(), 0);
        shell.on("cat ", &format!("{b64}\n"), 0);

        let pipeline = ScreenshotPipeline::new(
            Arc::new(ShellExecutor::new(shell.clone())),
            None,
            Arc::new(NoOverlay),
            ScreenshotConfig {
                chunk_size: 1 << 20,
                ..cfg()
            },
        );
        let shot = pipeline.capture().await;
        assert!(!shot.is_sensitive);
        assert!(!shell.calls().iter().any(|c| c.starts_with("dd ")));
    }

    #[tokio::test]
    async fn failure_gives_sensitive_frame_and_restores_overlay() {
        let shell = Arc::new(ScriptedShell::new());
        shell.on_stderr("screencap -p", "permission denied", 1);
        let (overlay, rx) = OverlayHandle::new(false);
        let pipeline = ScreenshotPipeline::new(
            Arc::new(ShellExecutor::new(shell.clone())),
            None,
            Arc::new(overlay),
            cfg(),
        );

        let shot = pipeline.capture().await;
        assert!(shot.is_sensitive);
        assert!(shot.width <= 72 && shot.height <= 128);
        assert!(!shot.image_bytes.is_empty());
        assert!(rx.borrow().visible);
        assert!(shell.calls().iter().any(|c| c.starts_with("rm -f ")));
    }

    /// Counts overlapping suppressions.
    #[derive(Default)]
    struct CountingOverlay {
        visible: AtomicBool,
        hidden_now: AtomicUsize,
        max_hidden: AtomicUsize,
    }

    impl OverlayControl for CountingOverlay {
        fn supports_capture_exclusion(&self) -> bool {
            false
        }

        fn is_visible(&self) -> bool {
            self.visible.load(Ordering::SeqCst)
        }

        fn set_visible(&self, visible: bool) {
            self.visible.store(visible, Ordering::SeqCst);
            if visible {
                self.hidden_now.fetch_sub(1, Ordering::SeqCst);
            } else {
                let now = self.hidden_now.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_hidden.fetch_max(now, Ordering::SeqCst);
            }
        }

        fn set_capture_excluded(&self, _excluded: bool) {}
    }

    #[tokio::test]
    async fn concurrent_captures_are_serialized() {
        let overlay = Arc::new(CountingOverlay::default());
        overlay.visible.store(true, Ordering::SeqCst);
        let pipeline = ScreenshotPipeline::new(
            Arc::new(ShellExecutor::new(Arc::new(ScriptedShell::new()))),
            Some(Arc::new(FakePlatform::with_png(png(8, 8)))),
            overlay.clone(),
            ScreenshotConfig {
                hide_settle_ms: 20,
                ..cfg()
            },
        );

        let (a, b) = tokio::join!(pipeline.capture(), pipeline.capture());
        assert!(!a.is_sensitive && !b.is_sensitive);
        assert_eq!(overlay.max_hidden.load(Ordering::SeqCst), 1);
        assert!(overlay.is_visible());
    }
}
