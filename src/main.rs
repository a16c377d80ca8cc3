use std::collections::HashMap;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use skein_core::config::{dirs_home, AppConfig, ModelConfig};
use skein_core::traits::LlmClient;
use skein_core::types::SessionId;

use skein_agent::{
    LlmSessionFactory, SessionOptions, SessionRegistry, TravelAgents, TravelPlanPipeline,
};
use skein_memory::{create_embedder, ingest_samples, SqliteVectorIndex, VectorStore};

#[derive(Parser)]
#[command(name = "skein", version, about = "Workflow graphs, agent chains and vector retrieval")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "skein.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Plan a trip through the feasibility pipeline
    Plan {
        /// Trip description (read from stdin when empty)
        #[arg(trailing_var_arg = true)]
        text: Vec<String>,
        /// Run the route, flight and itinerary chain instead, streaming output
        #[arg(long)]
        guide: bool,
    },
    /// Chat through a registry session (interactive when no text is given)
    Chat {
        #[arg(long, default_value = "local")]
        user: String,
        /// Session ID (auto-generated if not provided)
        #[arg(long)]
        session: Option<String>,
        /// Named model from [models]; empty selects [model]
        #[arg(long, default_value = "")]
        model_type: String,
        #[arg(long)]
        title: Option<String>,
        /// System prompt for a new session
        #[arg(long)]
        system: Option<String>,
        #[arg(trailing_var_arg = true)]
        text: Vec<String>,
    },
    /// Embed and store content
    Ingest {
        /// JSON array of {id, content} objects
        #[arg(long)]
        file: Option<PathBuf>,
        #[arg(trailing_var_arg = true)]
        text: Vec<String>,
    },
    /// Find stored content closest to a query
    Query {
        /// Number of results (defaults to store.default_k)
        #[arg(short, long)]
        k: Option<usize>,
        #[arg(trailing_var_arg = true)]
        text: Vec<String>,
    },
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("skein=info,warn")),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "skein", &mut io::stdout());
        return Ok(());
    }

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Plan { text, guide } => {
            let description = text_or_stdin(text);
            let llm: Arc<dyn LlmClient> = Arc::from(skein_llm::create_app_client(&config));
            let agents = TravelAgents::llm_backed(llm.clone(), &config.model);
            let pipeline = TravelPlanPipeline::build(&config, llm, agents)?;

            if guide {
                // Each chunk is the agent's cumulative text; print only what is new.
                let mut previous = String::new();
                let mut on_chunk = |chunk: &str| {
                    match chunk.strip_prefix(previous.as_str()) {
                        Some(rest) => print!("{}", rest),
                        None => print!("\n\n{}", chunk),
                    }
                    io::stdout().flush().ok();
                    previous = chunk.to_string();
                };
                pipeline.guide(&description, Some(&mut on_chunk)).await?;
                println!();
            } else {
                let reply = pipeline.run(&description).await?;
                println!("{}", reply.content);
            }
        }
        Commands::Chat {
            user,
            session,
            model_type,
            title,
            system,
            text,
        } => {
            let session = session.map(|s| SessionId::from(s.as_str())).unwrap_or_default();
            let session = session.0;
            let registry = SessionRegistry::new(Arc::new(LlmSessionFactory::new(config)));
            let mut session_config = HashMap::new();
            if let Some(prompt) = system {
                session_config.insert("system_prompt".to_string(), serde_json::Value::String(prompt));
            }
            let options = match title {
                Some(t) => SessionOptions::default().with_title(t),
                None => SessionOptions::default(),
            };

            let message = text.join(" ");
            if !message.trim().is_empty() {
                let handle = registry
                    .get_or_create(&user, &session, &model_type, &session_config, options)
                    .await?;
                send_and_print(&handle, &message).await?;
                return Ok(());
            }

            info!(user = %user, session = %session, "Interactive chat, Ctrl-D to quit");
            let stdin = io::stdin();
            for line in stdin.lock().lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let handle = registry
                    .get_or_create(&user, &session, &model_type, &session_config, options.clone())
                    .await?;
                send_and_print(&handle, &line).await?;
            }
            for s in registry.list_sessions(&user).await {
                info!(session = %s.session_id, title = %s.title, "Session closed");
            }
        }
        Commands::Ingest { file, text } => {
            let store = open_store(&config)?;
            match file {
                Some(path) => {
                    let report = ingest_samples(&store, &path).await?;
                    println!(
                        "inserted {} / skipped {} / failed {} (total {})",
                        report.inserted, report.skipped, report.failed, report.total
                    );
                }
                None => {
                    let content = text_or_stdin(text);
                    let key = store.ingest(&content).await?;
                    println!("{}", key);
                }
            }
        }
        Commands::Query { k, text } => {
            let store = open_store(&config)?;
            let k = k.unwrap_or(config.store.default_k);
            let hits = store.query(&text_or_stdin(text), k).await?;
            if hits.is_empty() {
                eprintln!("No matches.");
            }
            for hit in hits {
                println!("{:.4}  {}", hit.score, hit.content);
            }
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}

async fn send_and_print(handle: &skein_agent::SessionHandle, text: &str) -> anyhow::Result<()> {
    let mut on_chunk = |chunk: &str| {
        print!("{}", chunk);
        io::stdout().flush().ok();
    };
    handle.send(text, &mut on_chunk).await?;
    println!();
    Ok(())
}

fn open_store(config: &AppConfig) -> anyhow::Result<VectorStore> {
    let index = Arc::new(SqliteVectorIndex::open(&config.store_path())?);
    let embedder = Arc::from(create_embedder(&config.embedding));
    Ok(VectorStore::new(embedder, index).with_config(&config.store))
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    if let Some(home) = dirs_home().map(|h| h.join(".skein").join("config.toml")) {
        if home.exists() {
            info!(path = %home.display(), "Loading config from home directory");
            return Ok(AppConfig::load(&home)?);
        }
    }
    eprintln!("Warning: No config file found. Set OPENAI_API_KEY or create skein.toml");
    eprintln!("See skein.toml.example for reference.");
    create_env_config()
}

fn create_env_config() -> anyhow::Result<AppConfig> {
    let (provider, model_id, api_key, base_url) = match std::env::var("OPENAI_API_KEY") {
        Ok(key) => ("openai", "gpt-4o-mini", Some(key), None),
        // Default to Ollama (local)
        Err(_) => (
            "ollama",
            "llama3.2",
            None,
            Some("http://localhost:11434/v1/chat/completions".to_string()),
        ),
    };

    let model = ModelConfig {
        provider: provider.to_string(),
        model_id: model_id.to_string(),
        api_key,
        base_url,
        max_tokens: 4096,
        temperature: 0.0,
        timeout_secs: 120,
        retry: None,
    };

    Ok(AppConfig {
        model,
        models: HashMap::new(),
        fallback_models: vec![],
        embedding: Default::default(),
        store: Default::default(),
        pipeline: Default::default(),
    })
}

fn text_or_stdin(words: Vec<String>) -> String {
    let text = words.join(" ");
    if !text.trim().is_empty() {
        return text;
    }
    let stdin = io::stdin();
    let lines: Vec<String> = stdin.lock().lines().map_while(|l| l.ok()).collect();
    lines.join("\n")
}
