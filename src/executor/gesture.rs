//! Gesture synthesis on top of the text command interface.
//!
//! Paths with three or more points are replayed as raw multi-touch events
//! (`sendevent` against the touchscreen node, `usleep` between moves). When
//! raw events are unavailable the gesture degrades to a plain two-point
//! `input swipe` from the first to the last point.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use regex::Regex;
use tokio::sync::OnceCell;

use crate::executor::command::DeviceCommand;
use crate::executor::result::CommandResult;
use crate::executor::CommandExecutor;

/// Gap between the two taps of a double tap. Fixed by the action protocol.
pub const DOUBLE_TAP_INTERVAL: Duration = Duration::from_millis(100);

// Linux input event codes.
const EV_SYN: u16 = 0;
const EV_KEY: u16 = 1;
const EV_ABS: u16 = 3;
const SYN_REPORT: u16 = 0;
const BTN_TOUCH: u16 = 330;
const ABS_MT_POSITION_X: u16 = 53;
const ABS_MT_POSITION_Y: u16 = 54;
const ABS_MT_TRACKING_ID: u16 = 57;
/// `-1` as the kernel reads it; releases the tracked contact.
const TRACKING_ID_NONE: u32 = u32::MAX;

/// A point in physical pixel space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GesturePoint {
    pub x: i32,
    pub y: i32,
}

impl GesturePoint {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TouchDevice {
    pub path: String,
    pub max_x: Option<i32>,
    pub max_y: Option<i32>,
}

/// Pick the first device in `getevent -pl` output that reports both
/// multi-touch position axes.
pub fn parse_touch_device(getevent_output: &str) -> Option<TouchDevice> {
    let add_re = Regex::new(r"^add device \d+:\s*(\S+)").ok()?;
    let axis_re = Regex::new(r"(ABS_MT_POSITION_[XY])\s*:.*?\bmax\s+(-?\d+)").ok()?;

    let mut current: Option<TouchDevice> = None;
    let mut has_x = false;
    let mut has_y = false;

    for line in getevent_output.lines() {
        if let Some(caps) = add_re.captures(line.trim_start()) {
            if let Some(dev) = current.take() {
                if has_x && has_y {
                    return Some(dev);
                }
            }
            current = Some(TouchDevice {
                path: caps[1].to_string(),
                max_x: None,
                max_y: None,
            });
            has_x = false;
            has_y = false;
            continue;
        }
        let Some(dev) = current.as_mut() else {
            continue;
        };
        if let Some(caps) = axis_re.captures(line) {
            let max = caps[2].parse().ok();
            if &caps[1] == "ABS_MT_POSITION_X" {
                has_x = true;
                dev.max_x = max;
            } else {
                has_y = true;
                dev.max_y = max;
            }
        }
    }
    current.filter(|_| has_x && has_y)
}

/// Raw events are unusable when the node cannot be opened.
fn raw_events_unavailable(result: &CommandResult) -> bool {
    result.mentions("permission denied") || result.mentions("no such file")
}

fn scale_axis(v: i32, max: Option<i32>, screen: Option<u32>) -> i32 {
    match (max, screen) {
        (Some(max), Some(screen)) if screen > 0 && max > 0 => {
            ((v as i64 * (max as i64 + 1)) / screen as i64).clamp(0, max as i64) as i32
        }
        _ => v,
    }
}

pub struct GestureSynthesizer {
    executor: Arc<dyn CommandExecutor>,
    touch_device: OnceCell<TouchDevice>,
    display_size: Mutex<Option<(u32, u32)>>,
}

impl GestureSynthesizer {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            executor,
            touch_device: OnceCell::new(),
            display_size: Mutex::new(None),
        }
    }

    /// Physical screen size, used to map pixels onto the touch axis range.
    pub fn set_display_size(&self, width: u32, height: u32) {
        if let Ok(mut size) = self.display_size.lock() {
            *size = Some((width, height));
        }
    }

    pub async fn tap(&self, p: GesturePoint) -> CommandResult {
        self.executor
            .execute(&DeviceCommand::Tap { x: p.x, y: p.y }.to_string())
            .await
    }

    pub async fn double_tap(&self, p: GesturePoint) -> CommandResult {
        let first = self.tap(p).await;
        if !first.is_success() {
            return first;
        }
        tokio::time::sleep(DOUBLE_TAP_INTERVAL).await;
        self.tap(p).await
    }

    pub async fn long_press(&self, p: GesturePoint, duration_ms: u64) -> CommandResult {
        self.swipe(&[p, p], duration_ms).await
    }

    pub async fn swipe(&self, points: &[GesturePoint], duration_ms: u64) -> CommandResult {
        let (first, last) = match points {
            [first, .., last] => (*first, *last),
            _ => return CommandResult::error("swipe requires at least 2 points"),
        };

        if points.len() > 2 {
            match self.curved_swipe(points, duration_ms).await {
                Some(r) if r.is_success() && !raw_events_unavailable(&r) => return r,
                Some(r) => {
                    tracing::info!(result = %r.body(), "raw event swipe failed, using two-point swipe");
                }
                None => {
                    tracing::info!("no touch device for raw events, using two-point swipe");
                }
            }
        }

        self.simple_swipe(first, last, duration_ms).await
    }

    async fn simple_swipe(&self, from: GesturePoint, to: GesturePoint, duration_ms: u64) -> CommandResult {
        let cmd = DeviceCommand::Swipe {
            x1: from.x,
            y1: from.y,
            x2: to.x,
            y2: to.y,
            duration_ms: Some(duration_ms),
        };
        self.executor.execute(&cmd.to_string()).await
    }

    /// `None` when no touch device could be found.
    async fn curved_swipe(&self, points: &[GesturePoint], duration_ms: u64) -> Option<CommandResult> {
        let device = self.touch_device().await?;
        let display = self.display_size.lock().ok().and_then(|s| *s);
        let step_delay_us = duration_ms * 1000 / (points.len() as u64 - 1);
        let script = raw_swipe_script(device, points, step_delay_us, display);
        tracing::debug!(device = %device.path, points = points.len(), step_delay_us, "raw event swipe");
        Some(self.executor.execute(&script).await)
    }

    async fn touch_device(&self) -> Option<&TouchDevice> {
        self.touch_device
            .get_or_try_init(|| async {
                let out = self.executor.execute("getevent -pl").await;
                if raw_events_unavailable(&out) {
                    return Err(());
                }
                match parse_touch_device(out.body()) {
                    Some(dev) => {
                        tracing::info!(path = %dev.path, max_x = ?dev.max_x, max_y = ?dev.max_y, "touch device found");
                        Ok(dev)
                    }
                    None => Err(()),
                }
            })
            .await
            .ok()
    }
}

fn raw_swipe_script(
    dev: &TouchDevice,
    points: &[GesturePoint],
    step_delay_us: u64,
    display: Option<(u32, u32)>,
) -> String {
    let path = &dev.path;
    let ev = |ty: u16, code: u16, value: String| format!("sendevent {path} {ty} {code} {value}");
    let pos = |p: &GesturePoint| {
        (
            scale_axis(p.x, dev.max_x, display.map(|d| d.0)),
            scale_axis(p.y, dev.max_y, display.map(|d| d.1)),
        )
    };

    let mut cmds = Vec::with_capacity(points.len() * 4 + 8);
    let (x0, y0) = pos(&points[0]);
    cmds.push(ev(EV_ABS, ABS_MT_TRACKING_ID, "0".into()));
    cmds.push(ev(EV_ABS, ABS_MT_POSITION_X, x0.to_string()));
    cmds.push(ev(EV_ABS, ABS_MT_POSITION_Y, y0.to_string()));
    cmds.push(ev(EV_KEY, BTN_TOUCH, "1".into()));
    cmds.push(ev(EV_SYN, SYN_REPORT, "0".into()));

    for p in &points[1..] {
        let (x, y) = pos(p);
        cmds.push(format!("usleep {step_delay_us}"));
        cmds.push(ev(EV_ABS, ABS_MT_POSITION_X, x.to_string()));
        cmds.push(ev(EV_ABS, ABS_MT_POSITION_Y, y.to_string()));
        cmds.push(ev(EV_SYN, SYN_REPORT, "0".into()));
    }

    cmds.push(ev(EV_ABS, ABS_MT_TRACKING_ID, TRACKING_ID_NONE.to_string()));
    cmds.push(ev(EV_KEY, BTN_TOUCH, "0".into()));
    cmds.push(ev(EV_SYN, SYN_REPORT, "0".into()));
    cmds.join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::shell::testing::ScriptedShell;
    use crate::executor::shell::ShellExecutor;

    const GETEVENT: &str = "\
add device 1: /dev/input/event0
  name:     \"gpio-keys\"
  events:
    KEY (0001): KEY_VOLUMEDOWN KEY_VOLUMEUP
add device 2: /dev/input/event3
  name:     \"fts_ts\"
  events:
    ABS (0003): ABS_MT_SLOT           : value 0, min 0, max 9, fuzz 0, flat 0, resolution 0
                ABS_MT_POSITION_X     : value 0, min 0, max 1079, fuzz 0, flat 0, resolution 0
                ABS_MT_POSITION_Y     : value 0, min 0, max 2399, fuzz 0, flat 0, resolution 0
";

    fn synth(shell: &Arc<ScriptedShell>) -> GestureSynthesizer {
        GestureSynthesizer::new(Arc::new(ShellExecutor::new(shell.clone())))
    }

    fn pts(raw: &[(i32, i32)]) -> Vec<GesturePoint> {
        raw.iter().map(|&(x, y)| GesturePoint::new(x, y)).collect()
    }

    #[test]
    fn finds_multitouch_device() {
        let dev = parse_touch_device(GETEVENT).unwrap();
        assert_eq!(dev.path, "/dev/input/event3");
        assert_eq!(dev.max_x, Some(1079));
        assert_eq!(dev.max_y, Some(2399));
        assert!(parse_touch_device("add device 1: /dev/input/event0\n  name: \"keys\"\n").is_none());
    }

    #[tokio::test]
    async fn fewer_than_two_points_never_touches_backend() {
        let shell = Arc::new(ScriptedShell::new());
        let g = synth(&shell);

        let r = g.swipe(&pts(&[(1, 1)]), 300).await;
        assert!(r.contains("Error:"));
        assert_ne!(r.exit_code(), Some(0));
        let r = g.swipe(&[], 300).await;
        assert!(r.contains("Error:"));
        assert!(shell.calls().is_empty());
    }

    #[tokio::test]
    async fn two_points_use_simple_swipe_only() {
        let shell = Arc::new(ScriptedShell::new());
        let g = synth(&shell);

        let r = g.swipe(&pts(&[(10, 20), (30, 40)]), 400).await;
        assert!(r.is_success());
        assert_eq!(shell.calls(), vec!["input swipe 10 20 30 40 400"]);
    }

    #[tokio::test]
    async fn curved_swipe_emits_raw_events() {
        let shell = Arc::new(ScriptedShell::new());
        shell.on("getevent -pl", GETEVENT, 0);
        let g = synth(&shell);

        let r = g.swipe(&pts(&[(100, 200), (150, 250), (200, 300)]), 500).await;
        assert!(r.is_success());

        let calls = shell.calls();
        assert_eq!(calls.len(), 2);
        let script = &calls[1];
        assert!(script.starts_with("sendevent /dev/input/event3 3 57 0; sendevent /dev/input/event3 3 53 100"));
        assert_eq!(script.matches("usleep 250000").count(), 2);
        assert!(script.contains("sendevent /dev/input/event3 3 53 200; sendevent /dev/input/event3 3 54 300"));
        assert!(script.ends_with("sendevent /dev/input/event3 1 330 0; sendevent /dev/input/event3 0 0 0"));
    }

    #[tokio::test]
    async fn permission_denied_falls_back_to_endpoints() {
        let shell = Arc::new(ScriptedShell::new());
        shell.on("getevent -pl", GETEVENT, 0);
        shell.on_stderr("sendevent", "sendevent: /dev/input/event3: Permission denied", 1);
        let g = synth(&shell);

        let r = g.swipe(&pts(&[(1, 2), (3, 4), (5, 6), (7, 8)]), 900).await;
        assert!(r.is_success());
        assert_eq!(shell.calls().last().unwrap(), "input swipe 1 2 7 8 900");
    }

    #[tokio::test]
    async fn touch_device_is_discovered_once() {
        let shell = Arc::new(ScriptedShell::new());
        shell.on("getevent -pl", GETEVENT, 0);
        let g = synth(&shell);

        g.swipe(&pts(&[(1, 1), (2, 2), (3, 3)]), 200).await;
        g.swipe(&pts(&[(1, 1), (2, 2), (3, 3)]), 200).await;
        let discoveries = shell.calls().iter().filter(|c| c.starts_with("getevent")).count();
        assert_eq!(discoveries, 1);
    }

    #[tokio::test]
    async fn raw_coordinates_scale_to_axis_range() {
        let shell = Arc::new(ScriptedShell::new());
        shell.on("getevent -pl", GETEVENT, 0);
        let g = synth(&shell);
        g.set_display_size(540, 1200);

        g.swipe(&pts(&[(270, 600), (270, 700), (270, 800)]), 200).await;
        let script = shell.calls().pop().unwrap();
        assert!(script.contains("3 53 540"));
        assert!(script.contains("3 54 1200"));
    }

    #[tokio::test]
    async fn long_press_is_zero_travel_swipe() {
        let shell = Arc::new(ScriptedShell::new());
        let g = synth(&shell);

        g.long_press(GesturePoint::new(50, 60), 3000).await;
        assert_eq!(shell.calls(), vec!["input swipe 50 60 50 60 3000"]);
    }

    #[tokio::test]
    async fn double_tap_waits_fixed_interval() {
        let shell = Arc::new(ScriptedShell::new());
        let g = synth(&shell);

        let start = std::time::Instant::now();
        let r = g.double_tap(GesturePoint::new(5, 5)).await;
        assert!(r.is_success());
        assert!(start.elapsed() >= DOUBLE_TAP_INTERVAL);
        assert_eq!(shell.calls(), vec!["input tap 5 5", "input tap 5 5"]);
    }
}
