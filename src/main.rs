use anyhow::{Context, Result, bail};
use clap::Parser;
use uuid::Uuid;

use relay::app::Application;
use relay::cli::{Cli, Command};
use relay::config::RelayConfig;
use relay::dispatch::FileSource;
use relay::model::{PipelineInput, WorkItem};
use relay::{aggregate, logging, ui};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = RelayConfig::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    logging::init(if cli.verbose {
        "debug"
    } else {
        config.log_level.as_str()
    });
    config.validate()?;

    match cli.command {
        Command::Watch => {
            tracing::info!(queue = %config.queue_path.display(), "relay starting");
            Application::new(config)?.watch().await?;
            tracing::info!("relay stopped");
        }
        Command::Ask {
            question,
            category,
            json,
        } => {
            let app = Application::new(config)?;
            let input = PipelineInput::new(question).with_category(category);
            let outcome = if json {
                let outcome = app.ask(&input).await;
                println!("{}", serde_json::to_string_pretty(&outcome)?);
                outcome
            } else {
                let progress = ui::RunProgress::start(&input.text);
                let outcome = app.ask(&input).await;
                progress.complete(&outcome);
                outcome
            };
            if let Some(reason) = outcome.failure_reason() {
                bail!(reason);
            }
        }
        Command::Check => {
            let app = Application::new(config)?;
            if !ui::print_health(&app.health_check().await) {
                bail!("one or more components are unhealthy");
            }
        }
        Command::Status => {
            let queue = FileSource::new(config.queue_path);
            let counts = queue.counts().await?;
            println!("{}", queue.path().display());
            ui::print_counts(&counts);
        }
        Command::Add {
            text,
            priority,
            category,
        } => {
            let mut item =
                WorkItem::new(Uuid::new_v4().to_string(), text).with_priority(priority.into());
            item.category = category;
            let id = item.id.clone();
            FileSource::new(config.queue_path).enqueue(item).await?;
            println!("{id}");
        }
        Command::Aggregate { input, output } => {
            let summary = aggregate::aggregate(&input, &output)
                .await
                .with_context(|| format!("failed to aggregate {}", input.display()))?;
            ui::print_aggregate(&summary, &output);
        }
    }

    Ok(())
}
