//! Front-end actions.
//!
//! Every front end exposes the same five actions: send a message, approve,
//! reject, refresh the index, and clear history. This module parses REPL
//! input into those actions and routes them to the [`AgentLoop`].

pub mod render;
pub mod repl;

use crate::agent_core::{AgentLoop, AgentReply, Decision};

use render::render_reply;

/// One user action from a front end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrontendAction {
    Send(String),
    /// Approve the whole batch, or one action by id.
    Approve(Option<String>),
    /// Reject the whole batch, or one action by id.
    Reject(Option<String>),
    RefreshIndex,
    ClearHistory,
    Help,
    Exit,
    Empty,
}

pub const HELP_TEXT: &str = "\
Type a message to talk to your vault.
  /approve [id]   approve pending changes (all, or one by id)
  /reject [id]    reject pending changes (all, or one by id)
  /refresh        rescan the vault
  /clear          forget this conversation
  /help           show this help
  /exit           quit
While changes are pending, `yes`, `no`, `approve 2`, and `reject 1` also work.";

/// Parse one line of REPL input.
///
/// Bare approval words are only treated as decisions while a batch is
/// pending; otherwise they are sent to the model as text.
pub fn parse_input(line: &str, has_pending: bool) -> FrontendAction {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return FrontendAction::Empty;
    }

    let mut words = trimmed.split_whitespace();
    let head = words.next().unwrap_or_default().to_lowercase();
    let arg = words.next().map(str::to_string);
    let single = arg.is_none() || words.next().is_none();

    match head.as_str() {
        "/approve" | "/confirm" if single => return FrontendAction::Approve(arg),
        "/reject" | "/deny" if single => return FrontendAction::Reject(arg),
        "/refresh" => return FrontendAction::RefreshIndex,
        "/clear" => return FrontendAction::ClearHistory,
        "/help" | "/?" => return FrontendAction::Help,
        "/exit" | "/quit" | "exit" | "quit" if arg.is_none() => return FrontendAction::Exit,
        _ => {}
    }

    if has_pending && single {
        match head.as_str() {
            "approve" | "confirm" | "yes" | "y" | "ok" => return FrontendAction::Approve(arg),
            "reject" | "deny" | "no" | "n" | "cancel" => return FrontendAction::Reject(arg),
            _ => {}
        }
    }

    FrontendAction::Send(trimmed.to_string())
}

/// Route an action to the agent loop.
///
/// Returns `None` for actions the front end handles itself (help, exit, empty).
pub async fn dispatch(
    agent: &AgentLoop,
    identity: &str,
    action: FrontendAction,
    interactive: bool,
) -> Option<AgentReply> {
    match action {
        FrontendAction::Send(text) => Some(agent.handle_message(identity, &text, interactive).await),
        FrontendAction::Approve(id) => {
            let decision = if id.is_some() {
                Decision::Confirm
            } else {
                Decision::ConfirmAll
            };
            Some(
                agent
                    .resolve_confirmation(identity, decision, id.as_deref(), interactive)
                    .await,
            )
        }
        FrontendAction::Reject(id) => Some(
            agent
                .resolve_confirmation(identity, Decision::Reject, id.as_deref(), interactive)
                .await,
        ),
        FrontendAction::RefreshIndex => Some(agent.refresh_index()),
        FrontendAction::ClearHistory => Some(agent.clear_history(identity).await),
        FrontendAction::Help | FrontendAction::Exit | FrontendAction::Empty => None,
    }
}

/// Handle a single line outside the REPL and return what to print.
///
/// Parsed like REPL input, so `knap -m yes` settles a pending batch.
pub async fn run_once(
    agent: &AgentLoop,
    identity: &str,
    line: &str,
    interactive: bool,
) -> Option<String> {
    let has_pending = match agent.pending_batch(identity) {
        Ok(batch) => batch.is_some(),
        Err(e) => {
            tracing::warn!(error = %e, "could not check pending batch");
            false
        }
    };
    match parse_input(line, has_pending) {
        FrontendAction::Help => Some(HELP_TEXT.to_string()),
        FrontendAction::Exit | FrontendAction::Empty => None,
        action => dispatch(agent, identity, action, interactive)
            .await
            .map(|reply| render_reply(&reply)),
    }
}
