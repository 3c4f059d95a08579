use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use gallerycrawl::inspire::{read_results, write_results, DEFAULT_PROXY_URL};
use gallerycrawl::{
    extract_valid_prompts, InspirationClient, PromptInspirer, TextModel, LEDGER_FILE_NAME,
};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum InputMode {
    /// Inspire every description in a crawl ledger
    Ledger,
    /// Read descriptions from stdin until `q`
    Manual,
}

#[derive(Parser, Debug)]
#[command(
    name = "prompt_inspirer",
    about = "Turn captured gallery descriptions into inspired prompts"
)]
struct InspirerCli {
    /// Where descriptions come from.
    #[arg(long, value_enum, default_value_t = InputMode::Manual)]
    input: InputMode,

    /// Ledger to read in `ledger` mode.
    #[arg(long, env = "GALLERYCRAWL_INSPIRE_LEDGER", default_value = LEDGER_FILE_NAME)]
    ledger: PathBuf,

    /// Results document written in `ledger` mode and read by --extract-prompts.
    #[arg(long, env = "GALLERYCRAWL_INSPIRE_OUTPUT", default_value = "generated_prompts.json")]
    output: PathBuf,

    /// System prompt template; `MESSAGE` is replaced by the description.
    #[arg(long, env = "GALLERYCRAWL_SYSTEM_PROMPT", default_value = "prompt_inspiration.md")]
    system_prompt: PathBuf,

    /// Hosted model.
    #[arg(long, value_enum, default_value_t = TextModel::Gpt4o)]
    model: TextModel,

    /// Text-generation endpoint.
    #[arg(long, env = "GALLERYCRAWL_INSPIRE_URL", default_value = DEFAULT_PROXY_URL)]
    endpoint: String,

    /// Key sent as `x-api-key`.
    #[arg(long, env = "GALLERYCRAWL_INSPIRE_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Request timeout in seconds.
    #[arg(long, default_value_t = 420)]
    timeout_secs: u64,

    /// Only extract valid prompts from an existing results document.
    #[arg(long, default_value_t = false)]
    extract_prompts: bool,

    /// Destination of the extracted prompts, one per line.
    #[arg(long, default_value = "valid_prompts.tsv")]
    valid_prompts_file: PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
    let cli = InspirerCli::parse();

    if cli.extract_prompts {
        return extract(&cli.output, &cli.valid_prompts_file);
    }

    let client = InspirationClient::new(
        cli.api_key.as_deref().unwrap_or_default(),
        &cli.endpoint,
        cli.model,
        Duration::from_secs(cli.timeout_secs.max(1)),
    )
    .context("failed to configure text-generation client")?;
    let inspirer = PromptInspirer::from_template_file(&cli.system_prompt, client)
        .with_context(|| format!("failed to load {}", cli.system_prompt.display()))?;

    match cli.input {
        InputMode::Ledger => {
            let results = inspirer
                .inspire_ledger(&cli.ledger)
                .with_context(|| format!("failed to inspire {}", cli.ledger.display()))?;
            write_results(&cli.output, &results)?;
            println!(
                "wrote {} inspired prompts to {}",
                results.len(),
                cli.output.display()
            );
        }
        InputMode::Manual => {
            let stdin = io::stdin();
            let mut stdout = io::stdout();
            loop {
                println!("\nDescribe an image ('q' to quit):");
                stdout.flush()?;
                let mut line = String::new();
                if stdin.lock().read_line(&mut line)? == 0 {
                    break;
                }
                let description = line.trim();
                if description.eq_ignore_ascii_case("q") {
                    break;
                }
                if description.is_empty() {
                    continue;
                }
                let result = inspirer.inspire(description);
                println!("{}", serde_json::to_string_pretty(&result)?);
            }
        }
    }
    Ok(())
}

fn extract(results_path: &Path, destination: &Path) -> Result<()> {
    let results = read_results(results_path)
        .with_context(|| format!("failed to read {}", results_path.display()))?;
    let prompts = extract_valid_prompts(&results);
    let mut body = String::new();
    for prompt in &prompts {
        body.push_str(prompt);
        body.push('\n');
    }
    std::fs::write(destination, body)
        .with_context(|| format!("failed to write {}", destination.display()))?;
    println!(
        "extracted {} valid prompts to {}",
        prompts.len(),
        destination.display()
    );
    Ok(())
}
