//! EchoPersona - local GGUF chat, completion server and dataset tool

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use echopersona::chat::{run_repl, ChatSettings, DEFAULT_SYSTEM_PROMPT};
use echopersona::dataset::{self, HuggingFaceRows, OpenAiChat};
use echopersona::inference::{Completer, LlamaEngine};
use echopersona::server::{self, AppState};
use echopersona::types::config::ServerConfig;
use echopersona::types::message::Conversation;
use echopersona::types::model::ModelParams;

#[derive(Parser, Debug)]
#[command(name = "echopersona", version, about = "Local GGUF chat, completion server and dataset tool")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Interactive chat in the terminal
    Chat(ChatArgs),
    /// HTTP completion API and web UI, configured from the environment
    Serve,
    /// Generate an instruction dataset
    Dataset(DatasetArgs),
}

#[derive(clap::Args, Debug)]
struct ChatArgs {
    /// Path to the GGUF model file
    #[arg(short, long, env = "MODEL_PATH")]
    model: PathBuf,

    /// Context window size
    #[arg(long, default_value_t = 131072)]
    n_ctx: u32,

    /// Layers to offload to GPU (negative = all)
    #[arg(long, default_value_t = 999, allow_negative_numbers = true)]
    gpu_layers: i32,

    /// Prompt batch size
    #[arg(long, default_value_t = 512)]
    batch: u32,

    /// CPU threads for llama.cpp
    #[arg(long, default_value_t = 12)]
    threads: u32,

    /// Maximum tokens per reply
    #[arg(long, default_value_t = 384)]
    max_tokens: u32,

    /// Sampling temperature
    #[arg(long, default_value_t = 0.8)]
    temperature: f32,

    /// Nucleus sampling parameter
    #[arg(long, default_value_t = 0.95)]
    top_p: f32,

    /// System prompt that opens the conversation
    #[arg(long, default_value = DEFAULT_SYSTEM_PROMPT)]
    system: String,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Method {
    /// Ask a hosted chat model the seed questions
    Gpt,
    /// Sample a Hugging Face dataset
    Hf,
}

#[derive(clap::Args, Debug)]
struct DatasetArgs {
    /// Generation method
    #[arg(long, value_enum)]
    method: Method,

    /// Output file path
    #[arg(long, default_value = dataset::DEFAULT_OUTPUT)]
    output: PathBuf,

    /// Number of samples to generate
    #[arg(long, default_value_t = 20)]
    num: usize,

    /// Hugging Face dataset for `--method hf`
    #[arg(long, default_value = dataset::DEFAULT_CORPUS)]
    source: String,

    /// Dataset config (subset) for `--method hf`
    #[arg(long, default_value = "default")]
    config: String,

    /// Dataset split for `--method hf`
    #[arg(long, default_value = "train")]
    split: String,

    /// Remote chat model for `--method gpt`
    #[arg(long, default_value = dataset::remote::DEFAULT_CHAT_MODEL)]
    model: String,
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("echopersona=info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    match cli.command {
        Command::Chat(args) => run_chat(args),
        Command::Serve => run_serve(),
        Command::Dataset(args) => run_dataset(args),
    }
}

fn load_model(params: ModelParams) -> Result<Arc<LlamaEngine>> {
    let path = params.path.clone();
    let engine = LlamaEngine::load(params)
        .with_context(|| format!("failed to load model {}", path.display()))?;
    let info = engine.model_info();
    tracing::info!(
        "Model ready: {} ({} params, train ctx {})",
        info.path,
        info.param_count,
        info.context_length
    );
    Ok(Arc::new(engine))
}

fn run_chat(args: ChatArgs) -> Result<()> {
    let engine = load_model(ModelParams {
        path: args.model,
        n_ctx: args.n_ctx,
        n_gpu_layers: args.gpu_layers,
        n_batch: args.batch,
        n_threads: Some(args.threads),
    })?;
    let completer = Completer::warmed(engine);

    let settings = ChatSettings {
        max_tokens: args.max_tokens,
        temperature: args.temperature,
        top_p: args.top_p,
    };
    let mut conversation = Conversation::with_system(args.system);

    let stdin = std::io::stdin();
    run_repl(
        &completer,
        &mut conversation,
        &settings,
        stdin.lock(),
        std::io::stdout(),
    )
    .context("terminal I/O failed")
}

fn run_serve() -> Result<()> {
    let config = ServerConfig::from_env().context("invalid configuration")?;
    tracing::info!("Starting server with model {:?}", config.model_path);

    let engine = load_model(config.model_params())?;
    let completer = Completer::warmed(engine);

    let state = AppState::new(config, completer);
    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    runtime
        .block_on(server::serve(state))
        .context("server stopped")
}

fn run_dataset(args: DatasetArgs) -> Result<()> {
    if let Ok(path) = dotenvy::dotenv() {
        tracing::debug!("Loaded environment from {:?}", path);
    }

    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    let records = runtime.block_on(async {
        match args.method {
            Method::Gpt => {
                let api = OpenAiChat::from_env(args.model.as_str())?;
                dataset::generate_from_chat(&api, args.num).await
            }
            Method::Hf => {
                let corpus = HuggingFaceRows::new(args.source.as_str())?
                    .with_split(args.config.as_str(), args.split.as_str());
                dataset::generate_from_corpus(&corpus, args.num).await
            }
        }
    })?;

    dataset::write_dataset(&args.output, &records)
        .with_context(|| format!("failed to write {}", args.output.display()))?;
    println!("Saved {} records to {}", records.len(), args.output.display());
    Ok(())
}
