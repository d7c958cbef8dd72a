use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use econcal_core::ImpactEncoding;
use econcal_storage::clean_file;
use econcal_sync::{CrawlConfig, CrawlOrchestrator};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "econcal-cli")]
#[command(about = "Economic calendar harvester")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Crawl from the last stored event up to now
    Crawl(CrawlArgs),
    /// Write the cleaned export of the calendar file
    Clean(CleanArgs),
}

#[derive(Debug, Default, Args)]
struct CrawlArgs {
    #[arg(long)]
    output: Option<PathBuf>,
    #[arg(long)]
    errors: Option<PathBuf>,
    /// Read days from captured fixture files instead of the live site
    #[arg(long)]
    fixtures: Option<PathBuf>,
    #[arg(long)]
    max_failure_rate: Option<f64>,
}

#[derive(Debug, Default, Args)]
struct CleanArgs {
    #[arg(long)]
    input: Option<PathBuf>,
    #[arg(long)]
    output: Option<PathBuf>,
    /// Map whole impact labels instead of the legacy substring rewrite
    #[arg(long)]
    exact_impact: bool,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();
    let config = CrawlConfig::from_env()?;

    match cli.command.unwrap_or(Commands::Crawl(CrawlArgs::default())) {
        Commands::Crawl(args) => crawl(config, args).await,
        Commands::Clean(args) => clean(config, args),
    }
}

async fn crawl(mut config: CrawlConfig, args: CrawlArgs) -> Result<ExitCode> {
    if let Some(output) = args.output {
        config.output_path = output;
    }
    if let Some(errors) = args.errors {
        config.errors_path = errors;
    }
    if let Some(dir) = args.fixtures {
        config.fixture_dir = Some(dir);
    }
    if let Some(rate) = args.max_failure_rate {
        config.max_failure_rate = rate;
    }
    let max_failure_rate = config.max_failure_rate;
    let output = config.output_path.clone();

    let summary = CrawlOrchestrator::from_config(config)?
        .with_progress(|date| {
            let mut stderr = std::io::stderr();
            let _ = write!(stderr, "\rProcessing: {date}");
            let _ = stderr.flush();
        })
        .run()
        .await;
    eprintln!();
    let summary = match summary {
        Ok(summary) => summary,
        Err(err) => {
            println!("{}", saved_line(&output));
            return Err(err);
        }
    };

    println!(
        "crawl complete: run_id={} days={} failed={} written={} dropped={} skipped={}",
        summary.run_id,
        summary.days_attempted,
        summary.days_failed,
        summary.events_written,
        summary.events_dropped,
        summary.events_skipped
    );
    println!("{}", saved_line(&output));

    if summary.exceeds(max_failure_rate) {
        eprintln!(
            "failure rate {:.2} exceeds threshold {:.2}",
            summary.failure_rate(),
            max_failure_rate
        );
        return Ok(ExitCode::from(2));
    }
    Ok(ExitCode::SUCCESS)
}

fn saved_line(output: &Path) -> String {
    format!("data saved to: {}", output.display())
}

fn clean(config: CrawlConfig, args: CleanArgs) -> Result<ExitCode> {
    let input = args.input.unwrap_or(config.output_path);
    let output = args.output.unwrap_or(config.cleaned_path);
    let encoding = if args.exact_impact {
        ImpactEncoding::ExactLabel
    } else {
        ImpactEncoding::Substring
    };

    let rows = clean_file(&input, &output, encoding)
        .with_context(|| format!("cleaning {} -> {}", input.display(), output.display()))?;
    println!("cleaned {rows} rows: {}", output.display());
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crawl_defaults_when_no_subcommand_given() {
        let cli = Cli::try_parse_from(["econcal-cli"]).unwrap();
        assert!(cli.command.is_none());

        let cli = Cli::try_parse_from(["econcal-cli", "clean", "--exact-impact"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Clean(CleanArgs { exact_impact: true, .. }))));
    }

    #[test]
    fn saved_line_names_the_output_file() {
        assert_eq!(
            saved_line(Path::new("out/forex_factory_catalog.csv")),
            "data saved to: out/forex_factory_catalog.csv"
        );
    }
}
