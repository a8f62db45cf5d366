//! CLI for tarifin-stream: serve, generate, chat.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tarifin_stream::config::{CheckpointGenerationConfig, ServiceConfig};
use tarifin_stream::inference::{Fragments, GenerationRequest, Pipeline};
use tarifin_stream::model::demo::DEMO_MAX_CONTEXT;
use tarifin_stream::model::{NgramModel, DEMO_CORPUS};
use tarifin_stream::tokenizer::{ByteTokenizer, HfTokenizer, TokenizerAdapter};
use tarifin_stream::Telemetry;
use tracing::info;

#[derive(Parser)]
#[command(name = "tarifin-stream")]
#[command(about = "Streaming recipe generation server")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct ModelArgs {
    /// JSON service config (server and generation settings)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Checkpoint directory: tokenizer.json and generation_config.json are read from it
    #[arg(long)]
    model_dir: Option<PathBuf>,

    /// Text corpus for the n-gram backend (blank-line separated documents)
    #[arg(long)]
    corpus: Option<PathBuf>,

    #[arg(long, default_value = "42")]
    seed: u64,

    /// Default token budget per request
    #[arg(long)]
    max_new_tokens: Option<usize>,
}

#[derive(Subcommand)]
enum Commands {
    /// Server mode (HTTP API)
    Serve {
        #[command(flatten)]
        model: ModelArgs,
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Generate once, streaming to stdout
    Generate {
        #[command(flatten)]
        model: ModelArgs,
        #[arg(long)]
        prompt: String,
    },

    /// Interactive mode: type a prompt, watch the recipe appear
    Chat {
        #[command(flatten)]
        model: ModelArgs,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { model, port } => run_serve(&model, port)?,
        Commands::Generate { model, prompt } => run_generate(&model, &prompt)?,
        Commands::Chat { model } => run_chat(&model)?,
    }
    Ok(())
}

fn load(args: &ModelArgs) -> Result<(ServiceConfig, Pipeline)> {
    let mut config = match &args.config {
        Some(path) => ServiceConfig::from_file(path)?,
        None => ServiceConfig::default(),
    };

    let mut tokenizer: Arc<dyn TokenizerAdapter> = Arc::new(ByteTokenizer::new());
    if let Some(dir) = &args.model_dir {
        let tok_path = dir.join("tokenizer.json");
        if tok_path.exists() {
            info!("Loading tokenizer from {:?}...", tok_path);
            tokenizer = Arc::new(HfTokenizer::from_file(&tok_path)?);
        } else {
            info!("No tokenizer.json in {:?}, using byte tokenizer", dir);
        }
        if let Some(ckpt) = CheckpointGenerationConfig::from_dir(dir) {
            config.generation.apply_checkpoint(&ckpt);
        }
    }
    if let Some(n) = args.max_new_tokens {
        config.generation.default_max_new_tokens = n.min(config.generation.max_new_tokens_ceiling);
    }

    let corpus = match &args.corpus {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("reading corpus {:?}", path))?,
        None => DEMO_CORPUS.to_string(),
    };
    info!("Fitting n-gram model (seed {})...", args.seed);
    let model = NgramModel::fit(tokenizer.as_ref(), &corpus, args.seed, DEMO_MAX_CONTEXT)?;

    let pipeline = Pipeline::new(Arc::new(model), tokenizer, config.generation.clone())?
        .with_telemetry(Arc::new(Telemetry::new()));
    Ok((config, pipeline))
}

fn run_serve(args: &ModelArgs, port: Option<u16>) -> Result<()> {
    let (mut config, pipeline) = load(args)?;
    if let Some(port) = port {
        config.server.port = port;
    }
    let rt = tokio::runtime::Runtime::new().context("tokio runtime")?;
    rt.block_on(tarifin_stream::server::run_server(
        Arc::new(pipeline),
        &config.server,
    ))
    .map_err(|e| anyhow::anyhow!("server: {}", e))
}

fn run_generate(args: &ModelArgs, prompt: &str) -> Result<()> {
    let (_, pipeline) = load(args)?;
    let session = pipeline.start(GenerationRequest::new(prompt))?;
    let mut stdout = std::io::stdout();
    for fragment in Fragments::new(session) {
        let fragment = fragment?;
        stdout.write_all(fragment.text.as_bytes())?;
        stdout.flush()?;
    }
    writeln!(stdout)?;
    Ok(())
}

fn run_chat(args: &ModelArgs) -> Result<()> {
    let (_, pipeline) = load(args)?;
    println!("Tarifin. Type 'quit' to exit.");
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let mut line = String::new();
        if std::io::stdin().read_line(&mut line)? == 0 || line.trim().eq_ignore_ascii_case("quit") {
            break;
        }
        if line.trim().is_empty() {
            continue;
        }
        let fragments = match pipeline.stream_blocking(line.trim_end()) {
            Ok(f) => f,
            Err(e) => {
                eprintln!("{}", e);
                continue;
            }
        };
        // Rendered text only ever grows; print what was appended since the last update.
        let mut shown = 0;
        for text in fragments.cumulative() {
            match text {
                Ok(text) => {
                    print!("{}", &text[shown..]);
                    std::io::stdout().flush()?;
                    shown = text.len();
                }
                Err(e) => {
                    eprintln!("\n[{}]", e);
                    break;
                }
            }
        }
        println!();
    }
    Ok(())
}
