//! research-assistant CLI.
//!
//! Usage:
//!   research-assistant validate -p openai        Check an API key
//!   research-assistant models -p gemini          List a provider's models
//!   research-assistant chat "question" --stream  Ask, optionally streaming SSE frames
//!   research-assistant sessions list             Manage stored sessions

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use research_assistant::{
    init_tracing, ChatRequest, ChatService, Config, ConfigManager, Provider, StreamEvent, Storage,
};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(
    name = "research-assistant",
    version,
    about = "Multi-provider LLM research assistant with internet search"
)]
struct Cli {
    /// SQLite database file (overrides config)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Default log level when RUST_LOG is unset
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ProviderArgs {
    /// Provider identifier: openai, gemini, openrouter or anthropic
    #[arg(short, long)]
    provider: Option<String>,

    /// API key (falls back to config, then the provider's env variable)
    #[arg(short = 'k', long)]
    api_key: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Check whether an API key is accepted by the provider
    Validate {
        #[command(flatten)]
        provider: ProviderArgs,
    },

    /// List the models a provider offers
    Models {
        #[command(flatten)]
        provider: ProviderArgs,
    },

    /// Ask a question
    Chat {
        prompt: String,

        #[command(flatten)]
        provider: ProviderArgs,

        #[arg(short, long)]
        model: Option<String>,

        /// Append both turns to this session
        #[arg(short, long)]
        session: Option<i64>,

        #[arg(short, long)]
        temperature: Option<f32>,

        #[arg(long)]
        max_tokens: Option<u32>,

        /// Do not offer the search tool
        #[arg(long)]
        no_search: bool,

        /// Serper key for keyed search
        #[arg(long)]
        search_api_key: Option<String>,

        /// Print SSE frames as they arrive
        #[arg(long)]
        stream: bool,
    },

    /// Manage chat sessions
    Sessions {
        #[command(subcommand)]
        action: SessionCommands,
    },
}

#[derive(Subcommand)]
enum SessionCommands {
    /// List sessions, most recently updated first
    List {
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Create a session
    Create { name: Option<String> },
    /// Show a session's messages
    Show { id: i64 },
    /// Delete a session and its messages
    Delete { id: i64 },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let mut manager = ConfigManager::new();
    let cwd = std::env::current_dir().ok();
    manager
        .load(cwd.as_deref())
        .context("Failed to load configuration")?;
    let config = manager.config().clone();

    let db_path = cli.db.clone().unwrap_or_else(|| config.database_path());
    let storage = Storage::new(&db_path)
        .with_context(|| format!("Failed to open database at {}", db_path.display()))?;
    let service = ChatService::new(Arc::new(storage), &config);

    match cli.command {
        Commands::Validate { provider } => {
            let (provider, key) = resolve_provider(&config, &provider)?;
            let valid = service.validate_key(provider.as_str(), &key).await;
            println!("{}", if valid { "valid" } else { "invalid" });
        }
        Commands::Models { provider } => {
            let (provider, key) = resolve_provider(&config, &provider)?;
            for model in service.list_models(provider.as_str(), &key).await {
                println!("{:<40} {}", model.id, model.description);
            }
        }
        Commands::Chat {
            prompt,
            provider,
            model,
            session,
            temperature,
            max_tokens,
            no_search,
            search_api_key,
            stream,
        } => {
            let (provider, key) = resolve_provider(&config, &provider)?;
            let model = model.unwrap_or_else(|| config.default_model().to_string());
            let mut request = ChatRequest::new(provider.as_str(), key, model, prompt);
            request.session_id = session;
            request.max_tokens = max_tokens;
            request.enable_search = !no_search;
            request.search_api_key = search_api_key;
            if let Some(t) = temperature {
                request.temperature = t;
            }

            if stream {
                cmd_chat_stream(&service, request).await?;
            } else {
                let reply = service.chat(request).await?;
                println!("{}", reply.response);
            }
        }
        Commands::Sessions { action } => cmd_sessions(&service, action)?,
    }

    Ok(())
}

/// Provider from the flag or config; key from the flag, config, then environment.
fn resolve_provider(config: &Config, args: &ProviderArgs) -> Result<(Provider, String)> {
    let name = args
        .provider
        .as_deref()
        .unwrap_or_else(|| config.default_provider());
    let provider: Provider = name.parse()?;

    let key = args
        .api_key
        .clone()
        .or_else(|| config.provider(provider.as_str()).api_key)
        .filter(|k| !k.trim().is_empty())
        .or_else(|| std::env::var(provider.env_key()).ok())
        .ok_or_else(|| {
            anyhow!(
                "No API key for {}. Pass --api-key or set {}",
                provider,
                provider.env_key()
            )
        })?;
    Ok((provider, key))
}

async fn cmd_chat_stream(service: &ChatService, request: ChatRequest) -> Result<()> {
    let mut events = service.chat_stream(request);
    let mut stdout = io::stdout();
    let mut failed = None;

    while let Some(event) = events.next().await {
        stdout.write_all(event.to_sse_frame().as_bytes())?;
        stdout.flush()?;
        if let StreamEvent::Error(message) = event {
            failed = Some(message);
        }
    }

    match failed {
        Some(message) => Err(anyhow!(message)),
        None => Ok(()),
    }
}

fn cmd_sessions(service: &ChatService, action: SessionCommands) -> Result<()> {
    match action {
        SessionCommands::List { limit } => {
            let sessions = service.list_sessions(limit)?;
            if sessions.is_empty() {
                println!("No sessions.");
            }
            for s in sessions {
                println!(
                    "{:>5}  {:<30} {:>4} msgs  {}",
                    s.id,
                    s.name,
                    s.message_count,
                    s.updated_at.format("%Y-%m-%d %H:%M")
                );
            }
        }
        SessionCommands::Create { name } => {
            let session = service.create_session(name.as_deref())?;
            println!("Created session {} ({})", session.id, session.name);
        }
        SessionCommands::Show { id } => {
            let session = service.get_session(id)?;
            println!("# {} ({})", session.name, session.id);
            for turn in service.list_messages(id)? {
                match &turn.model_used {
                    Some(model) => println!("\n[{} via {}]", turn.role.as_str(), model),
                    None => println!("\n[{}]", turn.role.as_str()),
                }
                println!("{}", turn.content);
            }
        }
        SessionCommands::Delete { id } => {
            service.delete_session(id)?;
            println!("Deleted session {}", id);
        }
    }
    Ok(())
}
