//! Turns parsed model actions into device operations.
//!
//! Model coordinates are relative (0-999 on both axes); they are converted to
//! physical pixels here, against the original size of the screenshot the
//! model was looking at.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::agent_engine::interaction::Interactor;
use crate::agent_engine::state::FailureKind;
use crate::executor::command::{DeviceCommand, LaunchTarget, ResolveQuery};
use crate::executor::gesture::{GesturePoint, GestureSynthesizer};
use crate::executor::result::CommandResult;
use crate::executor::text_input;
use crate::executor::CommandExecutor;
use crate::llm::action_parser::{ActionArgs, ArgValue, ParsedAction};
use crate::perception::types::Screenshot;

/// Foreground app name reported when nothing is focused.
pub const HOME_APP: &str = "System Home";

const DEFAULT_WAIT_SECS: f64 = 1.0;
const MAX_WAIT_SECS: f64 = 30.0;

/// What one action did.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionOutcome {
    pub success: bool,
    /// The run ends after this action.
    pub should_finish: bool,
    /// Fed back to the model on the next turn, or the final message.
    pub message: Option<String>,
    /// Set when `should_finish` ends the run as a failure.
    pub failure: Option<FailureKind>,
}

impl ActionOutcome {
    fn ok() -> Self {
        Self {
            success: true,
            should_finish: false,
            message: None,
            failure: None,
        }
    }

    fn ok_with(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::ok()
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            should_finish: false,
            message: Some(message.into()),
            failure: None,
        }
    }

    fn finish(message: impl Into<String>) -> Self {
        Self {
            success: true,
            should_finish: true,
            message: Some(message.into()),
            failure: None,
        }
    }

    fn abort(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            should_finish: true,
            message: Some(message.into()),
            failure: Some(kind),
        }
    }

    fn from_result(result: CommandResult) -> Self {
        if result.is_success() {
            Self::ok()
        } else {
            Self::failed(result.into_string())
        }
    }
}

/// Relative 0-999 coordinates to physical pixels.
pub fn to_pixels(rel: (i64, i64), width: u32, height: u32) -> GesturePoint {
    let x = rel.0.clamp(0, 999) as f64 / 1000.0 * width as f64;
    let y = rel.1.clamp(0, 999) as f64 / 1000.0 * height as f64;
    GesturePoint::new(x as i32, y as i32)
}

/// Swipe duration from travel distance, between one and two seconds.
fn swipe_duration_ms(from: GesturePoint, to: GesturePoint) -> u64 {
    let dx = (to.x - from.x) as i64;
    let dy = (to.y - from.y) as i64;
    ((dx * dx + dy * dy) / 1000).clamp(1000, 2000) as u64
}

/// Seconds from `"2 seconds"`, `"1.5"` or a bare number.
fn parse_wait_secs(value: Option<&ArgValue>) -> f64 {
    let secs = match value {
        Some(ArgValue::Int(n)) => *n as f64,
        Some(ArgValue::Float(f)) => *f,
        Some(v) => v
            .as_str()
            .and_then(|s| s.split_whitespace().next())
            .and_then(|n| n.parse().ok())
            .unwrap_or(DEFAULT_WAIT_SECS),
        None => DEFAULT_WAIT_SECS,
    };
    secs.clamp(0.0, MAX_WAIT_SECS)
}

/// Package of the focused window in `dumpsys window` output.
pub fn parse_focused_package(dumpsys: &str) -> Option<String> {
    let focus_re = Regex::new(r"(?:mCurrentFocus|mFocusedApp)=.*?([A-Za-z]\w*(?:\.\w+)+)/").ok()?;
    dumpsys
        .lines()
        .filter(|l| l.contains("mCurrentFocus") || l.contains("mFocusedApp"))
        .find_map(|l| focus_re.captures(l))
        .map(|c| c[1].to_string())
}

pub struct ActionHandler {
    executor: Arc<dyn CommandExecutor>,
    gestures: GestureSynthesizer,
    interactor: Interactor,
    /// Display name -> package.
    apps: HashMap<String, String>,
    long_press_ms: u64,
    notes: Vec<String>,
}

impl ActionHandler {
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        interactor: Interactor,
        apps: HashMap<String, String>,
        long_press_ms: u64,
    ) -> Self {
        Self {
            gestures: GestureSynthesizer::new(executor.clone()),
            executor,
            interactor,
            apps,
            long_press_ms,
            notes: Vec::new(),
        }
    }

    pub fn notes(&self) -> &[String] {
        &self.notes
    }

    pub fn clear_notes(&mut self) {
        self.notes.clear();
    }

    /// Display name of the foreground app, or its package when unknown.
    pub async fn current_app(&self) -> String {
        let out = self
            .executor
            .execute(&DeviceCommand::DumpWindow.to_string())
            .await;
        if !out.is_success() {
            tracing::debug!(result = %out, "dumpsys window failed");
            return HOME_APP.to_string();
        }
        match parse_focused_package(out.body()) {
            Some(pkg) => self
                .apps
                .iter()
                .find(|(_, p)| **p == pkg)
                .map(|(name, _)| name.clone())
                .unwrap_or(pkg),
            None => HOME_APP.to_string(),
        }
    }

    fn resolve_package(&self, app: &str) -> Option<String> {
        if let Some(pkg) = self.apps.get(app) {
            return Some(pkg.clone());
        }
        let lowered = app.to_lowercase();
        if let Some((_, pkg)) = self.apps.iter().find(|(name, _)| name.to_lowercase() == lowered) {
            return Some(pkg.clone());
        }
        // Looks like a package name already.
        (app.contains('.') && !app.contains(char::is_whitespace)).then(|| app.to_string())
    }

    pub async fn launch(&self, app: &str) -> ActionOutcome {
        let Some(package) = self.resolve_package(app) else {
            return ActionOutcome::failed(format!("App not found: {app}"));
        };

        let query = DeviceCommand::ResolveActivity(ResolveQuery {
            brief: true,
            action: Some("android.intent.action.MAIN".into()),
            category: Some("android.intent.category.LAUNCHER".into()),
            package: package.clone(),
        });
        let resolved = self.executor.execute(&query.to_string()).await;
        let component = resolved
            .is_success()
            .then(|| {
                resolved
                    .body()
                    .lines()
                    .map(str::trim)
                    .rfind(|l| l.contains('/') && !l.contains(' '))
                    .map(str::to_string)
            })
            .flatten();

        let target = match component {
            Some(c) => LaunchTarget::Component(c),
            None => {
                tracing::debug!(package = %package, "no launcher activity resolved, starting by package");
                LaunchTarget::Package(package.clone())
            }
        };
        let started = self
            .executor
            .execute(&DeviceCommand::StartActivity(target).to_string())
            .await;
        if !started.is_success() || started.body().contains("Error:") {
            return ActionOutcome::failed(format!("Launch {app} failed: {}", started.body().trim()));
        }
        tracing::info!(app, package = %package, "app launched");
        ActionOutcome::ok_with(format!("Launched {app}"))
    }

    fn point(&self, args: &ActionArgs, key: &str, shot: &Screenshot) -> Option<GesturePoint> {
        args.point(key)
            .map(|p| to_pixels(p, shot.original_width, shot.original_height))
    }

    /// Run one parsed action against the screen the model saw.
    pub async fn handle(
        &mut self,
        action: &ParsedAction,
        shot: &Screenshot,
        cancel: &CancellationToken,
    ) -> ActionOutcome {
        let (name, args) = match action {
            ParsedAction::Finish { message } => return ActionOutcome::finish(message.clone()),
            ParsedAction::Do { name, args } => (name.as_str(), args),
        };
        self.gestures
            .set_display_size(shot.original_width, shot.original_height);
        tracing::info!(action = name, "handling action");

        match name {
            "Launch" => match args.str("app") {
                Some(app) => self.launch(app).await,
                None => ActionOutcome::failed("Launch needs app=\"...\""),
            },

            "Tap" => {
                let Some(p) = self.point(args, "element", shot) else {
                    return ActionOutcome::failed("Tap needs element=[x,y]");
                };
                if let Some(message) = args.str("message") {
                    if !self.interactor.confirm(message, cancel).await {
                        return ActionOutcome::abort(
                            FailureKind::ActionFailures,
                            format!("Sensitive action declined: {message}"),
                        );
                    }
                }
                ActionOutcome::from_result(self.gestures.tap(p).await)
            }

            "Type" | "Type_Name" => match args.str("text") {
                Some(text) => {
                    ActionOutcome::from_result(text_input::type_text(self.executor.as_ref(), text).await)
                }
                None => ActionOutcome::failed("Type needs text=\"...\""),
            },

            "Swipe" => {
                let points: Vec<GesturePoint> = match args.get("points").and_then(ArgValue::as_list) {
                    Some(list) => list
                        .iter()
                        .filter_map(ArgValue::as_point)
                        .map(|p| to_pixels(p, shot.original_width, shot.original_height))
                        .collect(),
                    None => [self.point(args, "start", shot), self.point(args, "end", shot)]
                        .into_iter()
                        .flatten()
                        .collect(),
                };
                let [first, .., last] = points.as_slice() else {
                    return ActionOutcome::failed("Swipe needs start/end or at least two points");
                };
                let duration = swipe_duration_ms(*first, *last);
                ActionOutcome::from_result(self.gestures.swipe(&points, duration).await)
            }

            "Back" => self.key("KEYCODE_BACK").await,
            "Home" => self.key("KEYCODE_HOME").await,

            "Double Tap" => match self.point(args, "element", shot) {
                Some(p) => ActionOutcome::from_result(self.gestures.double_tap(p).await),
                None => ActionOutcome::failed("Double Tap needs element=[x,y]"),
            },

            "Long Press" => match self.point(args, "element", shot) {
                Some(p) => {
                    ActionOutcome::from_result(self.gestures.long_press(p, self.long_press_ms).await)
                }
                None => ActionOutcome::failed("Long Press needs element=[x,y]"),
            },

            "Wait" => {
                let secs = parse_wait_secs(args.get("duration"));
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(Duration::from_secs_f64(secs)) => {}
                }
                ActionOutcome::ok()
            }

            "Take_over" => {
                let message = args.str("message").unwrap_or("Please complete this step manually");
                if self.interactor.take_over(message, cancel).await {
                    ActionOutcome::ok_with("The user completed the manual step")
                } else {
                    ActionOutcome::abort(FailureKind::TakeOverDeclined, format!("Take over not completed: {message}"))
                }
            }

            "Interact" => {
                let message = args.str("message").unwrap_or("Please choose how to continue");
                match self.interactor.interact(message, cancel).await {
                    Some(answer) if !answer.is_empty() => ActionOutcome::ok_with(format!("User answered: {answer}")),
                    Some(_) => ActionOutcome::ok(),
                    None => ActionOutcome::failed("No answer from the user"),
                }
            }

            "Note" => {
                let note = args.str("message").unwrap_or_default().to_string();
                tracing::debug!(note = %note, "note recorded");
                self.notes.push(note);
                ActionOutcome::ok()
            }

            "Call_API" => {
                let instruction = args.str("instruction").unwrap_or_default();
                if self.notes.is_empty() {
                    ActionOutcome::ok_with(format!("No notes recorded for: {instruction}"))
                } else {
                    ActionOutcome::ok_with(format!("Notes for \"{instruction}\":\n{}", self.notes.join("\n")))
                }
            }

            other => ActionOutcome::failed(format!("Unknown action: {other}")),
        }
    }

    async fn key(&self, code: &str) -> ActionOutcome {
        let cmd = DeviceCommand::KeyEvent { code: code.into() };
        ActionOutcome::from_result(self.executor.execute(&cmd.to_string()).await)
    }
}
