//! Interactive terminal front end.

use std::io::Write;

use tokio::io::{AsyncBufReadExt, BufReader};

use super::render::render_reply;
use super::{dispatch, parse_input, FrontendAction, HELP_TEXT};
use crate::agent_core::AgentLoop;

const PROMPT: &str = "knap> ";
const PENDING_PROMPT: &str = "knap (approve/reject)> ";

/// Read lines from stdin until EOF or `/exit`.
pub async fn run_repl(agent: &AgentLoop, identity: &str, interactive: bool) -> std::io::Result<()> {
    tracing::info!(identity = %identity, interactive, "repl started");
    println!("Knap is ready. Type /help for commands.");

    // Re-show anything left pending from a previous session.
    if let Ok(Some(batch)) = agent.pending_batch(identity) {
        println!("{}", super::render::render_batch(&batch));
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let has_pending = match agent.pending_batch(identity) {
            Ok(batch) => batch.is_some(),
            Err(e) => {
                tracing::warn!(error = %e, "could not check pending batch");
                false
            }
        };
        print!("{}", if has_pending { PENDING_PROMPT } else { PROMPT });
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            println!();
            break;
        };

        match parse_input(&line, has_pending) {
            FrontendAction::Exit => break,
            FrontendAction::Empty => continue,
            FrontendAction::Help => println!("{HELP_TEXT}"),
            action => {
                if let Some(reply) = dispatch(agent, identity, action, interactive).await {
                    println!("{}\n", render_reply(&reply));
                }
            }
        }
    }

    tracing::info!(identity = %identity, "repl finished");
    Ok(())
}
