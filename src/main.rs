/*
 *  Copyright 2025 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use metronome::api::{self, ApiState};
use metronome::broker::{LogPublisher, PubSubPublisher, PubSubSubscriber, Publisher};
use metronome::cli::{Cli, Commands};
use metronome::config::ServiceConfig;
use metronome::dal::DAL;
use metronome::database::Database;
use metronome::registry::TaskRegistry;
use metronome::request::ScheduleRequest;
use metronome::runner::Scheduler;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Start => run_service().await,
        Commands::Schedule { file } => run_schedule(file).await,
        Commands::Parse { file } => run_parse(file),
        Commands::Openapi => {
            println!(
                "{}",
                serde_json::to_string_pretty(&api::openapi_document())?
            );
            Ok(())
        }
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run_service() -> Result<()> {
    let config = ServiceConfig::from_env()?;

    let database = Database::new(
        &config.database_url,
        "metronome",
        config.scheduler.db_pool_size(),
    );

    let publisher: Arc<dyn Publisher> = if config.broker.project_id.is_some() {
        Arc::new(PubSubPublisher::new(
            &config.broker,
            config.scheduler.publish_timeout(),
        )?)
    } else {
        warn!("PUBSUB_PROJECT_ID not set; publishes will only be logged");
        Arc::new(LogPublisher)
    };

    let scheduler = Scheduler::new(database, publisher, config.scheduler.clone());
    scheduler.start();
    let cancel = scheduler.cancellation_token();

    if let Some(subscriber) =
        PubSubSubscriber::new(&config.broker, scheduler.registry(), scheduler.counters())?
    {
        tokio::spawn(subscriber.run(cancel.clone()));
    }

    let auth = match (config.api.username.clone(), config.api.password.clone()) {
        (Some(username), Some(password)) => Some((username, password)),
        _ => None,
    };
    let state = ApiState {
        registry: scheduler.registry(),
        counters: scheduler.counters(),
        auth,
    };
    let api_handle = tokio::spawn(api::serve(state, config.api.port, cancel.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");

    scheduler.shutdown().await;
    let _ = api_handle.await;

    Ok(())
}

async fn run_schedule(file: Option<PathBuf>) -> Result<()> {
    let request: ScheduleRequest =
        serde_json::from_str(&read_input(file)?).context("failed to parse schedule request")?;

    let config = ServiceConfig::from_env()?;
    let database = Database::new(&config.database_url, "metronome", 2);
    let registry = TaskRegistry::new(DAL::new(database));

    let receipt = registry
        .submit(request)
        .await
        .context("failed to schedule task")?;

    println!("{}", serde_json::to_string_pretty(&receipt)?);
    Ok(())
}

fn run_parse(file: Option<PathBuf>) -> Result<()> {
    let request: ScheduleRequest =
        serde_json::from_str(&read_input(file)?).context("failed to parse schedule request")?;

    let resolved = request
        .resolve(Utc::now())
        .context("schedule request is invalid")?;

    println!(
        "valid: {} -> {}",
        resolved
            .task_name
            .as_deref()
            .unwrap_or("(anonymous one-shot)"),
        resolved.data.target_topic
    );
    Ok(())
}

fn read_input(file: Option<PathBuf>) -> Result<String> {
    match file {
        Some(path) => std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display())),
        None => {
            let mut buffer = String::new();
            std::io::stdin()
                .read_to_string(&mut buffer)
                .context("failed to read stdin")?;
            Ok(buffer)
        }
    }
}
