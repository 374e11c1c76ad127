pub mod agent_engine;
pub mod config;
pub mod errors;
pub mod executor;
pub mod llm;
pub mod perception;

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::agent_engine::actions::ActionHandler;
use crate::agent_engine::engine::TaskAgent;
use crate::agent_engine::interaction::{InteractionRequest, Interactor};
use crate::config::AppConfig;
use crate::errors::PilotResult;
use crate::executor::build_backends;
use crate::llm::providers::openai_compatible::OpenAiCompatibleProvider;
use crate::perception::overlay::OverlayControl;
use crate::perception::screenshot::ScreenshotPipeline;

/// Install the tracing subscriber. `RUST_LOG` overrides the `info` default.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

/// Wire backends, screenshot pipeline, model client and action handler
/// into a ready-to-run agent.
///
/// `interactions` receives confirmation/take-over/interact requests; without
/// it confirmations follow `agent.auto_confirm_sensitive`.
pub fn build_agent(
    cfg: &AppConfig,
    overlay: Arc<dyn OverlayControl>,
    interactions: Option<mpsc::Sender<InteractionRequest>>,
) -> PilotResult<TaskAgent> {
    let backends = build_backends(&cfg.device);

    let screenshots = Arc::new(ScreenshotPipeline::new(
        backends.shell.clone(),
        backends.platform.clone(),
        overlay,
        cfg.screenshot.clone(),
    ));

    let provider = Arc::new(OpenAiCompatibleProvider::new(&cfg.llm)?);
    if cfg.llm.resolved_api_key().is_empty() {
        tracing::warn!("no API key configured; requests go out unauthenticated");
    }

    let actions = ActionHandler::new(
        backends.executor.clone(),
        Interactor::new(interactions, cfg.agent.auto_confirm_sensitive),
        cfg.apps.clone(),
        cfg.agent.long_press_ms,
    );

    tracing::info!(
        executor = backends.executor.name(),
        model = %cfg.llm.model,
        base_url = %cfg.llm.base_url,
        "agent assembled"
    );
    Ok(TaskAgent::new(provider, screenshots, actions, cfg.agent.clone()))
}
