use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;

use knap::agent_core::{AgentDatabase, AgentLoop};
use knap::commands::render::render_reply;
use knap::commands::repl::run_repl;
use knap::commands::run_once;
use knap::inference::InferenceClient;
use knap::tools::{vault_tools, ToolContext};
use knap::transcription::{transcribe_or_notice, WhisperClient};
use knap::vault::{SettingsStore, Vault, VaultIndex};

/// Talk to your markdown vault.
#[derive(Debug, Parser)]
#[command(name = "knap", version, about)]
struct Cli {
    /// Send one line (a message, or `yes`/`no` for pending changes) and exit.
    #[arg(short = 'm', long)]
    message: Option<String>,

    /// Transcribe an audio file and send it as the message.
    #[arg(long, conflicts_with = "message")]
    audio: Option<PathBuf>,

    /// Forget the conversation history for this identity.
    #[arg(long)]
    clear_history: bool,

    /// Rescan the whole vault before doing anything else.
    #[arg(long)]
    refresh_index: bool,

    /// Apply changes without asking for approval.
    #[arg(long)]
    no_confirm: bool,

    /// Vault root (overrides `vault_path` in the config).
    #[arg(long)]
    vault: Option<PathBuf>,

    /// Config file (defaults to $KNAP_CONFIG or the nearest knap.yaml).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Conversation identity.
    #[arg(long, default_value = "local")]
    identity: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Err(e) = knap::init_tracing() {
        eprintln!("warning: file logging disabled: {e}");
    }

    let (config, _) = knap::config::load(cli.config.as_deref())?;
    let vault_root = config.resolve_vault(cli.vault.as_deref())?;
    let vault = Vault::open(&vault_root)
        .with_context(|| format!("cannot open vault at {}", vault_root.display()))?;

    let state_dir = config.resolve_state_dir(vault.root());
    std::fs::create_dir_all(&state_dir)
        .with_context(|| format!("cannot create state dir {}", state_dir.display()))?;
    tracing::info!(vault = %vault.root().display(), state_dir = %state_dir.display(), "vault opened");

    let settings = Arc::new(SettingsStore::load(state_dir.join("settings.json")));
    let index = Arc::new(VaultIndex::new(
        vault,
        config.index_freshness(),
        Some(state_dir.join("index.json")),
    ));
    let db = AgentDatabase::open(&state_dir.join("knap.db").to_string_lossy())?.shared();
    let model = InferenceClient::from_config(config.model.clone())?;

    let agent = AgentLoop::new(
        Arc::new(model),
        Arc::new(vault_tools()),
        ToolContext::new(index, settings),
        db,
        config.agent_loop_config(),
    );
    let interactive = !cli.no_confirm;
    let identity = cli.identity.as_str();

    let mut did_something = false;
    if cli.clear_history {
        println!("{}", render_reply(&agent.clear_history(identity).await));
        did_something = true;
    }
    if cli.refresh_index {
        println!("{}", render_reply(&agent.refresh_index()));
        did_something = true;
    }

    let message = match cli.audio {
        Some(audio) => {
            let Some(transcription) = config.transcription.clone() else {
                bail!("voice input is not configured: add a `transcription:` section to knap.yaml");
            };
            let client = WhisperClient::from_config(transcription)?;
            match transcribe_or_notice(&client, &audio).await {
                Ok(text) => {
                    println!("> {text}");
                    Some(text)
                }
                Err(notice) => {
                    println!("{notice}");
                    return Ok(());
                }
            }
        }
        None => cli.message,
    };

    if let Some(text) = message {
        if let Some(out) = run_once(&agent, identity, &text, interactive).await {
            println!("{out}");
        }
        return Ok(());
    }
    if did_something {
        return Ok(());
    }

    run_repl(&agent, identity, interactive).await?;
    Ok(())
}
