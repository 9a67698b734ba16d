//! Line-oriented terminal host for the ei engine.
//!
//! Reads stdin: slash commands go to the command dispatcher, everything
//! else is a message to the focused persona. Engine output arrives over
//! the UI event channel and is printed as it comes.

use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

use ei_lib::commands::{self, Command};
use ei_lib::config::Config;
use ei_lib::engine::events::UiEvent;
use ei_lib::engine::{jobs, Engine};
use ei_lib::llm::gateway::LlmGateway;

#[tokio::main]
async fn main() {
    let config = Config::from_env();

    let default_filter = if config.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let exit_code = match run(config).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("fatal: {:#}", e);
            1
        }
    };

    std::process::exit(exit_code);
}

async fn run(config: Config) -> anyhow::Result<i32> {
    config.warn_if_inside_repo();

    let gateway = Arc::new(LlmGateway::new(config.clone()));
    let (engine, mut events) = Engine::new(config, gateway).await?;

    // Keep the job runner alive for the whole session; dropping it would
    // silently stop the ceremony and the staleness sweep.
    let _jobs = jobs::start_engine_jobs(engine.inner()).await?;

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                UiEvent::Response { persona, content } => {
                    println!("\n[{}] {}", persona, content);
                }
                UiEvent::Status { message } => println!("* {}", message),
                UiEvent::Error { message } => println!("! {}", message),
                UiEvent::Render { .. } => {}
            }
        }
    });

    let focused = engine.focused().await;
    println!("ei ready. Talking to '{}'. /status for an overview, /quit to leave.", focused);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut had_error = false;

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if line.starts_with('/') {
            match commands::parse(line) {
                Ok(Command::Quit { force }) => {
                    if !force && engine.has_pending_work().await? {
                        println!("* Work is still pending; /quit --force to leave anyway");
                        continue;
                    }
                    return finish(&engine, force && had_error).await;
                }
                Ok(command) => match engine.execute(command).await {
                    Ok(status) => println!("* {}", status),
                    Err(e) => {
                        println!("! {}", e);
                        had_error = true;
                    }
                },
                Err(usage) => println!("! {}", usage),
            }
        } else if let Err(e) = engine.submit(line).await {
            println!("! {}", e);
            had_error = true;
        }
    }

    // EOF on stdin is a clean exit.
    finish(&engine, false).await
}

async fn finish(engine: &Engine, forced_after_error: bool) -> anyhow::Result<i32> {
    match engine.shutdown().await {
        Ok(()) if !forced_after_error => Ok(0),
        Ok(()) => Ok(1),
        Err(e) => {
            eprintln!("cleanup failed: {:#}", e);
            Ok(1)
        }
    }
}
