use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::agent_engine::actions::ActionHandler;
use crate::agent_engine::loop_control::LoopController;
use crate::agent_engine::prompt;
use crate::agent_engine::state::{AgentState, FailureKind, RunControl, StepRecord, TaskOutcome};
use crate::config::AgentConfig;
use crate::llm::action_parser::parse_action;
use crate::llm::provider::LlmProvider;
use crate::llm::types::{ChatMessage, ModelError};
use crate::perception::screenshot::ScreenshotPipeline;

const NO_ACTION_HINT: &str =
    "Your last reply contained no action. Think briefly, then give exactly one do(...) or finish(...).";

/// Token and generation of the current run. `reset` bumps the generation so
/// a run that is winding down cannot overwrite the fresh Idle state.
struct RunSlot {
    generation: u64,
    cancel: CancellationToken,
}

struct Shared {
    control: watch::Sender<RunControl>,
    state: watch::Sender<AgentState>,
    run: Mutex<RunSlot>,
}

impl Shared {
    fn slot(&self) -> std::sync::MutexGuard<'_, RunSlot> {
        self.run.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn begin_run(&self) -> (u64, CancellationToken) {
        let mut slot = self.slot();
        if slot.cancel.is_cancelled() {
            slot.cancel = CancellationToken::new();
        }
        (slot.generation, slot.cancel.clone())
    }

    /// Publish `state` unless the run was reset in the meantime.
    fn publish(&self, generation: u64, state: AgentState) {
        let slot = self.slot();
        if slot.generation == generation {
            tracing::debug!(?state, "agent state");
            self.state.send_replace(state);
        }
    }
}

/// Control surface for a [`TaskAgent`], cheap to clone and usable from any task.
#[derive(Clone)]
pub struct AgentHandle {
    shared: Arc<Shared>,
}

impl AgentHandle {
    /// Stop before the next step until [`resume`](Self::resume).
    pub fn pause(&self) {
        tracing::info!("pause requested");
        self.shared.control.send_replace(RunControl::Paused);
    }

    pub fn resume(&self) {
        tracing::info!("resume requested");
        self.shared.control.send_replace(RunControl::Running);
    }

    /// Cancel the current run, aborting any model request in flight.
    /// A no-op when nothing runs.
    pub fn cancel(&self) {
        let slot = self.shared.slot();
        if !slot.cancel.is_cancelled() {
            tracing::info!("cancel requested");
            slot.cancel.cancel();
        }
    }

    /// Cancel whatever runs and return to Idle, unpaused.
    pub fn reset(&self) {
        let mut slot = self.shared.slot();
        slot.cancel.cancel();
        slot.cancel = CancellationToken::new();
        slot.generation += 1;
        self.shared.control.send_replace(RunControl::Running);
        self.shared.state.send_replace(AgentState::Idle);
        tracing::info!(generation = slot.generation, "agent reset");
    }

    pub fn state(&self) -> AgentState {
        self.shared.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<AgentState> {
        self.shared.state.subscribe()
    }
}

/// Drives capture -> model -> action, one step at a time.
pub struct TaskAgent {
    provider: Arc<dyn LlmProvider>,
    screenshots: Arc<ScreenshotPipeline>,
    actions: ActionHandler,
    cfg: AgentConfig,
    shared: Arc<Shared>,
}

enum Stop {
    Cancelled,
}

impl TaskAgent {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        screenshots: Arc<ScreenshotPipeline>,
        actions: ActionHandler,
        cfg: AgentConfig,
    ) -> Self {
        let (control, _) = watch::channel(RunControl::Running);
        let (state, _) = watch::channel(AgentState::Idle);
        Self {
            provider,
            screenshots,
            actions,
            cfg,
            shared: Arc::new(Shared {
                control,
                state,
                run: Mutex::new(RunSlot {
                    generation: 0,
                    cancel: CancellationToken::new(),
                }),
            }),
        }
    }

    pub fn handle(&self) -> AgentHandle {
        AgentHandle {
            shared: self.shared.clone(),
        }
    }

    /// Wait out a pause. Errs when the run is cancelled meanwhile.
    async fn checkpoint(&self, generation: u64, step: u32, cancel: &CancellationToken) -> Result<(), Stop> {
        let mut control = self.shared.control.subscribe();
        loop {
            if cancel.is_cancelled() {
                return Err(Stop::Cancelled);
            }
            if *control.borrow_and_update() == RunControl::Running {
                return Ok(());
            }
            self.shared.publish(generation, AgentState::Paused { step });
            tokio::select! {
                _ = cancel.cancelled() => return Err(Stop::Cancelled),
                changed = control.changed() => {
                    if changed.is_err() {
                        return Err(Stop::Cancelled);
                    }
                }
            }
        }
    }

    async fn sleep_or_cancel(&self, cancel: &CancellationToken, ms: u64) {
        if ms == 0 {
            return;
        }
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
        }
    }

    pub async fn run(&mut self, task: &str) -> TaskOutcome {
        let (generation, cancel) = self.shared.begin_run();
        tracing::info!(task, provider = self.provider.name(), "task started");

        let mut ctrl = LoopController::new(&self.cfg);
        let mut messages = vec![ChatMessage::system(prompt::system_prompt())];
        let mut steps: Vec<StepRecord> = Vec::new();
        let mut last_result: Option<String> = None;
        // Stays false until a user turn carrying the task got a reply.
        let mut task_delivered = false;
        self.actions.clear_notes();

        let final_state = loop {
            if self.checkpoint(generation, ctrl.steps(), &cancel).await.is_err() {
                break AgentState::Cancelled;
            }
            if let Some(kind) = ctrl.should_stop() {
                let message = match kind {
                    FailureKind::StepLimit => format!("step limit of {} reached", self.cfg.max_steps),
                    _ => format!("{} consecutive failed turns", ctrl.consecutive_failures()),
                };
                break AgentState::Failed { kind, message };
            }

            let step = ctrl.begin_step();
            self.shared.publish(generation, AgentState::Running { step });

            // Capture strictly before the request, dispatch strictly after it.
            let shot = self.screenshots.capture().await;
            if shot.is_sensitive {
                tracing::warn!(step, "screen unavailable, sending placeholder frame");
            }
            let current_app = self.actions.current_app().await;
            let text = if !task_delivered {
                prompt::first_turn(task, &current_app)
            } else {
                prompt::next_turn(&current_app, last_result.as_deref())
            };
            for m in messages.iter_mut() {
                m.strip_image();
            }
            messages.push(ChatMessage::user_with_image(text, shot.image_bytes.clone()));

            let response = match self.provider.request(&messages, &cancel).await {
                Ok(r) => {
                    task_delivered = true;
                    r
                }
                Err(ModelError::Cancelled) => break AgentState::Cancelled,
                Err(e) if e.is_network() => {
                    tracing::error!(step, error = %e, "model request failed");
                    break AgentState::Failed {
                        kind: FailureKind::Network,
                        message: e.to_string(),
                    };
                }
                Err(e) => {
                    tracing::warn!(step, error = %e, "unusable model reply");
                    messages.pop();
                    ctrl.record_failure(FailureKind::MalformedResponse);
                    last_result = Some(NO_ACTION_HINT.to_string());
                    continue;
                }
            };

            tracing::info!(
                step,
                thinking = %response.thinking,
                action = %response.action,
                ttft_ms = ?response.time_to_first_token_ms,
                "model turn"
            );
            messages.push(ChatMessage::assistant(prompt::assistant_turn(
                &response.thinking,
                &response.action,
            )));

            if !response.has_action() {
                ctrl.record_failure(FailureKind::MalformedResponse);
                steps.push(StepRecord {
                    step,
                    thinking: response.thinking,
                    action: String::new(),
                    success: false,
                    message: Some("no action".into()),
                    timestamp: chrono::Utc::now(),
                });
                last_result = Some(NO_ACTION_HINT.to_string());
                continue;
            }

            let parsed = match parse_action(&response.action) {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(step, error = %e, "action did not parse");
                    ctrl.record_failure(FailureKind::MalformedResponse);
                    let message = format!("Invalid action {}: {e}", response.action);
                    steps.push(StepRecord {
                        step,
                        thinking: response.thinking,
                        action: response.action,
                        success: false,
                        message: Some(message.clone()),
                        timestamp: chrono::Utc::now(),
                    });
                    last_result = Some(message);
                    continue;
                }
            };

            if cancel.is_cancelled() {
                break AgentState::Cancelled;
            }

            let outcome = self.actions.handle(&parsed, &shot, &cancel).await;
            tracing::info!(step, %parsed, success = outcome.success, "action done");
            steps.push(StepRecord {
                step,
                thinking: response.thinking,
                action: response.action,
                success: outcome.success,
                message: outcome.message.clone(),
                timestamp: chrono::Utc::now(),
            });

            if outcome.should_finish {
                let message = outcome.message.unwrap_or_default();
                break if outcome.success {
                    AgentState::Finished { message }
                } else {
                    AgentState::Failed {
                        kind: outcome.failure.unwrap_or(FailureKind::ActionFailures),
                        message,
                    }
                };
            }

            if outcome.success {
                ctrl.record_success();
            } else {
                ctrl.record_failure(FailureKind::ActionFailures);
            }
            last_result = outcome.message;

            self.sleep_or_cancel(&cancel, self.cfg.step_delay_ms).await;
        };

        match &final_state {
            AgentState::Finished { message } => tracing::info!(steps = steps.len(), message = %message, "task finished"),
            AgentState::Failed { kind, message } => tracing::warn!(?kind, message = %message, "task failed"),
            other => tracing::info!(state = ?other, "task stopped"),
        }
        self.shared.publish(generation, final_state.clone());

        TaskOutcome {
            state: final_state,
            steps,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use async_trait::async_trait;
    use image::{DynamicImage, RgbImage};

    use super::*;
    use crate::agent_engine::interaction::Interactor;
    use crate::config::ScreenshotConfig;
    use crate::executor::platform::testing::FakePlatform;
    use crate::executor::shell::testing::ScriptedShell;
    use crate::executor::shell::ShellExecutor;
    use crate::llm::action_parser::split_response;
    use crate::llm::types::ModelResponse;
    use crate::perception::overlay::NoOverlay;

    /// Replies from a queue; when the queue is empty it waits for cancellation.
    #[derive(Default)]
    struct ScriptedProvider {
        replies: std::sync::Mutex<VecDeque<Result<String, ModelError>>>,
        seen: std::sync::Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl ScriptedProvider {
        fn new(replies: Vec<Result<&str, ModelError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: std::sync::Mutex::new(
                    replies.into_iter().map(|r| r.map(str::to_string)).collect(),
                ),
                seen: Default::default(),
            })
        }

        fn requests(&self) -> Vec<Vec<ChatMessage>> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn request(
            &self,
            messages: &[ChatMessage],
            cancel: &CancellationToken,
        ) -> Result<ModelResponse, ModelError> {
            self.seen.lock().unwrap().push(messages.to_vec());
            let next = self.replies.lock().unwrap().pop_front();
            match next {
                Some(Ok(raw)) => {
                    let (thinking, action) = split_response(&raw);
                    Ok(ModelResponse {
                        thinking,
                        action,
                        raw_content: raw,
                        time_to_first_token_ms: Some(1),
                        total_time_ms: Some(2),
                    })
                }
                Some(Err(e)) => Err(e),
                None => {
                    cancel.cancelled().await;
                    Err(ModelError::Cancelled)
                }
            }
        }
    }

    fn png(w: u32, h: u32) -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(RgbImage::new(w, h));
        let mut out = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Png)
            .unwrap();
        out
    }

    fn agent(provider: Arc<ScriptedProvider>, shell: Arc<ScriptedShell>, max_failures: u32) -> TaskAgent {
        let executor = Arc::new(ShellExecutor::new(shell));
        let pipeline = ScreenshotPipeline::new(
            executor.clone(),
            Some(Arc::new(FakePlatform::with_png(png(200, 400)))),
            Arc::new(NoOverlay),
            ScreenshotConfig::default(),
        );
        let actions = ActionHandler::new(executor, Interactor::detached(false), Default::default(), 3000);
        TaskAgent::new(
            provider,
            Arc::new(pipeline),
            actions,
            AgentConfig {
                max_steps: 10,
                max_consecutive_failures: max_failures,
                step_delay_ms: 0,
                ..AgentConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn tap_then_finish() {
        let provider = ScriptedProvider::new(vec![
            Ok(r#"<think>open it</think><answer>do(action="Tap", element=[500,500])</answer>"#),
            Ok(r#"<think>done</think><answer>finish(message="Opened")</answer>"#),
        ]);
        let shell = Arc::new(ScriptedShell::new());
        let mut agent = agent(provider.clone(), shell.clone(), 3);
        let handle = agent.handle();

        let outcome = agent.run("open the app").await;
        assert!(outcome.succeeded());
        assert_eq!(outcome.state, AgentState::Finished { message: "Opened".into() });
        assert_eq!(outcome.steps.len(), 2);
        assert_eq!(handle.state(), outcome.state);
        assert!(shell.calls().contains(&"input tap 100 200".to_string()));

        // Only the newest user turn keeps its screenshot.
        let second = &provider.requests()[1];
        let with_images = second.iter().filter(|m| m.has_image()).count();
        assert_eq!(with_images, 1);
        assert!(second.last().unwrap().has_image());
        assert!(matches!(second[2], ChatMessage::Assistant(_)));
    }

    #[tokio::test]
    async fn network_error_fails_run() {
        let provider = ScriptedProvider::new(vec![Err(ModelError::Timeout)]);
        let mut agent = agent(provider, Arc::new(ScriptedShell::new()), 3);
        let outcome = agent.run("x").await;
        assert!(matches!(
            outcome.state,
            AgentState::Failed { kind: FailureKind::Network, .. }
        ));
    }

    #[tokio::test]
    async fn stalled_turns_hit_failure_limit() {
        let provider = ScriptedProvider::new(vec![
            Ok("just thinking"),
            Err(ModelError::ParseError(String::new())),
            Ok("still thinking"),
        ]);
        let mut agent = agent(provider.clone(), Arc::new(ScriptedShell::new()), 3);
        let outcome = agent.run("x").await;
        assert_eq!(
            outcome.state,
            AgentState::Failed {
                kind: FailureKind::MalformedResponse,
                message: "3 consecutive failed turns".into()
            }
        );
        assert_eq!(provider.requests().len(), 3);
    }

    #[tokio::test]
    async fn task_is_resent_after_unusable_first_reply() {
        let provider = ScriptedProvider::new(vec![
            Err(ModelError::ParseError(String::new())),
            Ok(r#"finish(message="ok")"#),
        ]);
        let mut agent = agent(provider.clone(), Arc::new(ScriptedShell::new()), 3);
        let outcome = agent.run("turn on airplane mode").await;
        assert!(outcome.succeeded());

        let second = &provider.requests()[1];
        assert_eq!(second.len(), 2);
        assert!(second[1].text().starts_with("turn on airplane mode"));
    }

    #[tokio::test]
    async fn cancel_aborts_pending_request() {
        let provider = ScriptedProvider::new(vec![]);
        let mut agent = agent(provider, Arc::new(ScriptedShell::new()), 3);
        let handle = agent.handle();
        let task = tokio::spawn(async move { agent.run("x").await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.cancel();
        handle.cancel();
        let outcome = task.await.unwrap();
        assert_eq!(outcome.state, AgentState::Cancelled);
        assert_eq!(handle.state(), AgentState::Cancelled);
    }

    #[tokio::test]
    async fn pause_holds_before_next_step() {
        let provider = ScriptedProvider::new(vec![Ok(r#"finish(message="ok")"#)]);
        let mut agent = agent(provider.clone(), Arc::new(ScriptedShell::new()), 3);
        let handle = agent.handle();
        handle.pause();
        let task = tokio::spawn(async move { agent.run("x").await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.state(), AgentState::Paused { step: 0 });
        assert!(provider.requests().is_empty());

        handle.resume();
        let outcome = task.await.unwrap();
        assert!(outcome.succeeded());
    }

    #[tokio::test]
    async fn reset_returns_to_idle() {
        let provider = ScriptedProvider::new(vec![]);
        let mut agent = agent(provider, Arc::new(ScriptedShell::new()), 3);
        let handle = agent.handle();
        let task = tokio::spawn(async move { agent.run("x").await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.reset();
        let outcome = task.await.unwrap();
        assert_eq!(outcome.state, AgentState::Cancelled);
        assert_eq!(handle.state(), AgentState::Idle);
    }
}
