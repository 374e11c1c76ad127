//! Human-in-the-loop requests.
//!
//! The agent sends an [`InteractionRequest`] and awaits the typed reply on the
//! request's oneshot. Whoever owns the receiving end (CLI prompt, UI) answers
//! with [`InteractionRequest::respond`].

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    /// Approve or reject a sensitive action.
    Confirm,
    /// Operator performs a step by hand (login, captcha) and reports back.
    TakeOver,
    /// Free-form answer or choice.
    Interact,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InteractionReply {
    Approved,
    Rejected,
    /// Manual step completed.
    Done,
    Answer(String),
}

#[derive(Debug)]
pub struct InteractionRequest {
    pub id: Uuid,
    pub kind: InteractionKind,
    pub message: String,
    reply: oneshot::Sender<InteractionReply>,
}

impl InteractionRequest {
    /// Deliver the answer. A requester that gave up is ignored.
    pub fn respond(self, reply: InteractionReply) {
        if self.reply.send(reply).is_err() {
            tracing::debug!(id = %self.id, "interaction answered after requester left");
        }
    }
}

pub fn interaction_channel(
    buffer: usize,
) -> (mpsc::Sender<InteractionRequest>, mpsc::Receiver<InteractionRequest>) {
    mpsc::channel(buffer)
}

/// Agent-side end of the interaction channel.
#[derive(Clone)]
pub struct Interactor {
    tx: Option<mpsc::Sender<InteractionRequest>>,
    auto_confirm: bool,
}

impl Interactor {
    pub fn new(tx: Option<mpsc::Sender<InteractionRequest>>, auto_confirm: bool) -> Self {
        Self { tx, auto_confirm }
    }

    /// Nobody listening: confirmations follow `auto_confirm`, everything else fails.
    pub fn detached(auto_confirm: bool) -> Self {
        Self::new(None, auto_confirm)
    }

    async fn ask(
        &self,
        kind: InteractionKind,
        message: &str,
        cancel: &CancellationToken,
    ) -> Option<InteractionReply> {
        let tx = self.tx.as_ref()?;
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = InteractionRequest {
            id: Uuid::new_v4(),
            kind,
            message: message.to_string(),
            reply: reply_tx,
        };
        tracing::info!(id = %request.id, ?kind, message, "waiting for operator");
        if tx.send(request).await.is_err() {
            tracing::warn!("interaction channel closed");
            return None;
        }
        tokio::select! {
            _ = cancel.cancelled() => None,
            reply = reply_rx => reply.ok(),
        }
    }

    pub async fn confirm(&self, message: &str, cancel: &CancellationToken) -> bool {
        if self.tx.is_none() {
            tracing::info!(approved = self.auto_confirm, message, "sensitive action, no operator");
            return self.auto_confirm;
        }
        matches!(
            self.ask(InteractionKind::Confirm, message, cancel).await,
            Some(InteractionReply::Approved)
        )
    }

    /// True when the operator reports the manual step as done.
    pub async fn take_over(&self, message: &str, cancel: &CancellationToken) -> bool {
        matches!(
            self.ask(InteractionKind::TakeOver, message, cancel).await,
            Some(InteractionReply::Done | InteractionReply::Approved)
        )
    }

    pub async fn interact(&self, message: &str, cancel: &CancellationToken) -> Option<String> {
        match self.ask(InteractionKind::Interact, message, cancel).await? {
            InteractionReply::Answer(a) => Some(a),
            InteractionReply::Approved | InteractionReply::Done => Some(String::new()),
            InteractionReply::Rejected => None,
        }
    }
}
