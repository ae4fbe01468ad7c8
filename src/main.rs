use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Parser;
use log::{error, info};

use llama_server_client::resolve::resolve_model_file;
use llama_server_client::{logging, AppConfig, LlamaServer};

/// Launch llama-server for a model and stream a completion.
#[derive(Parser, Debug)]
#[command(name = "llama_server_cli", version)]
struct Cli {
    /// Model file, directory, or name under the models directory.
    #[arg(short, long)]
    model: String,

    /// llama-server executable (overrides config and LLAMA_SERVER_PATH).
    #[arg(short, long)]
    server: Option<PathBuf>,

    /// JSON settings file with `server` and `generation` sections.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Prompt text; read from stdin when omitted.
    #[arg(short, long)]
    prompt: Option<String>,

    /// Log launch flags and request payloads.
    #[arg(short, long)]
    verbose: bool,

    /// Print the prompt's token ids instead of generating.
    #[arg(long)]
    tokenize: bool,

    /// Print the top N next-token candidates instead of generating.
    #[arg(long, value_name = "N")]
    logits: Option<usize>,
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        error!("{e:#}");
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = match &cli.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    }
    .with_env_overrides();
    if let Some(server) = cli.server {
        config.server_path = Some(server);
    }
    config.verbose |= cli.verbose;

    if let Err(e) = logging::init(config.verbose, config.log_dir.as_deref()) {
        eprintln!("Failed to set up logging: {e}");
    }

    let prompt = match cli.prompt {
        Some(prompt) => prompt,
        None => io::read_to_string(io::stdin()).context("Failed to read prompt from stdin")?,
    };

    let options = config.server_options();
    let model_path = resolve_model_file(&options.model_resolver.resolve(&cli.model))
        .with_context(|| format!("Model not found: {}", cli.model))?;
    info!("[CLI] Loading {}", model_path.display());

    let mut server = LlamaServer::start(&model_path, &config.server, options)
        .context("Failed to start llama-server")?;

    if cli.tokenize {
        let tokens = server.tokenize(&prompt, config.generation.add_bos_token)?;
        println!("{tokens:?}");
        return Ok(());
    }

    if let Some(top_n) = cli.logits {
        if top_n == 0 {
            bail!("--logits must be at least 1");
        }
        for candidate in server.get_logits(&prompt, &config.generation, top_n, false)? {
            let score = candidate.logprob.or(candidate.prob).unwrap_or_default();
            println!("{:>8} {score:>10.4} {:?}", candidate.id, candidate.token);
        }
        return Ok(());
    }

    let mut stdout = io::stdout().lock();
    let mut printed = 0;
    for text in server.generate_streaming(&prompt, &config.generation)? {
        let text = text?;
        // Cumulative text; print only what is new
        stdout.write_all(&text.as_bytes()[printed..])?;
        stdout.flush()?;
        printed = text.len();
    }
    writeln!(stdout)?;

    info!("[CLI] Prompt tokens: {}", server.last_prompt_token_count());

    server.stop();
    Ok(())
}
