use std::io::Write;
use std::path::PathBuf;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokstream_cli::{
    build_engine, format_ranked, load_config, parse_token_input, CliError, GenerateFlags,
    Overrides,
};
use tracing_subscriber::EnvFilter;

/// tokstream: streaming token generation demo
#[derive(Parser)]
#[command(name = "tokstream")]
struct Cli {
    /// JSON engine config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// llama2.c tokenizer.bin to use instead of the built-in vocabulary.
    #[arg(long, global = true)]
    tokenizer: Option<PathBuf>,

    /// JSON model card for the demo backend.
    #[arg(long, global = true)]
    model: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args)]
struct GenerationArgs {
    /// Step budget counted in context positions (0 = model maximum).
    #[arg(short, long)]
    steps: Option<usize>,

    /// Sampling temperature (0 = greedy).
    #[arg(short, long)]
    temperature: Option<f32>,

    /// Nucleus sampling cutoff in (0, 1].
    #[arg(long)]
    top_p: Option<f32>,

    /// Random seed for reproducible sampling.
    #[arg(long)]
    seed: Option<u64>,

    /// Keep going (and print) when BOS/EOS is sampled.
    #[arg(long)]
    no_stop_on_boundary: bool,
}

impl GenerationArgs {
    fn flags(&self) -> GenerateFlags {
        GenerateFlags {
            steps: self.steps,
            temperature: self.temperature,
            top_p: self.top_p,
            seed: self.seed,
            no_stop_on_boundary: self.no_stop_on_boundary,
        }
    }
}

#[derive(clap::Subcommand)]
enum Command {
    /// Stream a completion of the prompt.
    Generate {
        /// Input prompt text.
        #[arg(short, long, default_value = "")]
        prompt: String,

        #[command(flatten)]
        generation: GenerationArgs,

        /// Print one completed word per line instead of raw tokens.
        #[arg(long)]
        words: bool,

        /// Emit notifications as JSON lines.
        #[arg(long)]
        json: bool,
    },
    /// Pick every token yourself from the ranked candidates.
    Manual {
        /// Input prompt text.
        #[arg(short, long, default_value = "")]
        prompt: String,

        #[command(flatten)]
        generation: GenerationArgs,

        /// Number of candidates to show per step.
        #[arg(long, default_value_t = 10)]
        top: usize,
    },
    /// Print the vocabulary.
    Vocab {
        /// Print at most this many entries.
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(Cli::parse()).await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let overrides = Overrides {
        config: cli.config,
        tokenizer: cli.tokenizer,
        model: cli.model,
    };
    let config = load_config(&overrides)?;
    let engine = build_engine(&config).await?;

    match cli.command {
        Command::Generate {
            prompt,
            generation,
            words,
            json,
        } => {
            let options = generation.flags().apply(engine.defaults());
            let session = engine.session()?;

            if json {
                session.on_token(|event| print_json(event));
                session.on_word(|event| print_json(event));
                session.on_finish(|event| print_json(event));
            } else if words {
                session.on_word(|event| {
                    if event.word.trim().is_empty() {
                        return;
                    }
                    println!("{}", event.word);
                });
            } else {
                session.on_token(|event| {
                    let mut out = std::io::stdout().lock();
                    let _ = out.write_all(event.token.text.as_bytes());
                    let _ = out.flush();
                });
            }

            let handle = session.generate(&prompt, options).await?;
            let text = handle.await?;
            if !json && !words {
                println!();
            }
            tracing::info!(chars = text.chars().count(), "done");
            if let Some(metrics) = session.last_metrics() {
                tracing::info!(
                    ttft_ms = metrics.ttft_ms,
                    tokens_per_sec = metrics.tokens_per_sec,
                    "run metrics"
                );
            }
        }
        Command::Manual {
            prompt,
            generation,
            top,
        } => {
            let options = generation.flags().apply(engine.defaults());
            let session = engine.session()?;
            let mut ranked = session.manual_start(&prompt, options).await?;

            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                print!("{}", format_ranked(&ranked, top));
                print!("text so far: {:?}\nnext> ", session.accumulated_text());
                std::io::stdout().flush()?;

                let Some(line) = lines.next_line().await? else {
                    break;
                };
                if line.is_empty() {
                    break;
                }
                match session.manual_next(parse_token_input(&line)).await {
                    Ok(next) => ranked = next,
                    Err(e @ tokstream_engine::GenerateError::InvalidToken(_)) => {
                        eprintln!("{e}");
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            println!("{}", session.accumulated_text());
        }
        Command::Vocab { limit } => {
            let vocab = engine.vocabulary()?;
            let limit = limit.unwrap_or(vocab.len());
            for (id, text) in vocab.iter().take(limit) {
                println!("{id:>6}  {text:?}");
            }
        }
    }

    Ok(())
}

fn print_json<T: serde::Serialize>(event: &T) {
    match serde_json::to_string(event) {
        Ok(line) => println!("{line}"),
        Err(e) => tracing::warn!(error = %e, "failed to serialize event"),
    }
}
