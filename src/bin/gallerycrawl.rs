use anyhow::{Context, Result};
use clap::Parser;
use gallerycrawl::controls::{Cli, MiaohuaArgs, RecraftArgs, SourceCommand};
use gallerycrawl::{
    build_client, CrawlControls, PagedApiSource, PlannedRun, RunManager, SourceRun,
};
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;
    runtime.block_on(run(cli))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,gallerycrawl=info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; finishing in-flight downloads");
            on_signal.cancel();
        }
    });

    let controls = cli.build_controls();
    let client =
        build_client(controls.request_timeout()).context("failed to build HTTP client")?;
    let manager = RunManager::with_label(&cli.save_dir, cli.run_label.as_deref())
        .with_client(client.clone());
    let mut plans = Vec::new();
    match &cli.command {
        SourceCommand::Miaohua(args) => plans.push(miaohua_plan(args, &client, &controls)),
        SourceCommand::Recraft(args) => plans.push(recraft_plan(args, &controls).await?),
        SourceCommand::All { miaohua, recraft } => {
            plans.push(miaohua_plan(miaohua, &client, &controls));
            plans.push(recraft_plan(recraft, &controls).await?);
        }
    }

    match manager.run_all(plans, cancel).await {
        Ok(runs) => {
            report(&runs);
            Ok(())
        }
        Err(err) => {
            report(&err.completed);
            if let Some(summary) = err.source.partial_summary() {
                summary.report();
            }
            Err(err).context("crawl aborted")
        }
    }
}

fn report(runs: &[SourceRun]) {
    for run in runs {
        println!("output: {}", run.output_dir.display());
        run.summary.report();
    }
}

fn miaohua_plan(args: &MiaohuaArgs, client: &Client, controls: &CrawlControls) -> PlannedRun {
    PlannedRun {
        source: Box::new(PagedApiSource::new(client.clone(), args.source_config())),
        controls: controls.clone(),
    }
}

#[cfg(feature = "webdriver")]
async fn recraft_plan(args: &RecraftArgs, controls: &CrawlControls) -> Result<PlannedRun> {
    use gallerycrawl::sources::WebDriverPage;
    use gallerycrawl::ScrollSource;

    let page = WebDriverPage::connect(&args.webdriver_url, args.selector.clone())
        .await
        .with_context(|| format!("failed to start a browser via {}", args.webdriver_url))?;
    Ok(PlannedRun {
        source: Box::new(ScrollSource::new(page, args.source_config())),
        controls: controls.clone().with_time_budget(args.time_budget()),
    })
}

#[cfg(not(feature = "webdriver"))]
async fn recraft_plan(args: &RecraftArgs, _controls: &CrawlControls) -> Result<PlannedRun> {
    anyhow::bail!(
        "the recraft source drives a browser at {}; rebuild with `--features webdriver`",
        args.webdriver_url
    )
}
