use anyhow::{bail, Result};
use chorus_core::{
    telemetry, ChatMessage, ChatSession, FileSettings, MockAdapter, ModelConfig, Orchestrator,
    ProviderRegistry, ProviderSettings, StaticSettings, StreamEventKind, StreamStatus,
};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::sync::Arc;
use tokio::runtime::Runtime;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "xtask", version, about = "Automation helpers for Chorus")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a lightweight smoke test against the mock provider.
    Smoke,
    /// Stream one prompt to one or more real models.
    Ask {
        /// Composite model id such as `openai::gpt-4o`. Repeat to compare models.
        #[arg(short, long = "model", required = true)]
        models: Vec<String>,
        /// Overrides the conversation system prompt for every model.
        #[arg(long)]
        system: Option<String>,
        prompt: String,
    },
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    telemetry::init_tracing(telemetry::default_filter("info"))?;
    let cli = Cli::parse();
    let runtime = Runtime::new()?;

    match cli.command {
        Commands::Smoke => runtime.block_on(smoke_test()),
        Commands::Ask {
            models,
            system,
            prompt,
        } => runtime.block_on(ask(models, system, prompt)),
    }
}

async fn smoke_test() -> Result<()> {
    let mut registry = ProviderRegistry::new();
    registry.register(Arc::new(MockAdapter::echo("mock")));
    let settings = Arc::new(StaticSettings(ProviderSettings::default()));
    let session = ChatSession::new(Orchestrator::new(registry, settings));

    let models = [ModelConfig::new("mock::left"), ModelConfig::new("mock::right")];
    let fan_out = session.send_user_message(ChatMessage::user("ping from xtask"), &models, &[])?;
    for (model, status) in fan_out.join_all().await {
        if status? != StreamStatus::Completed {
            bail!("{model} did not complete");
        }
    }

    let conversation = session.conversation();
    info!(
        "messages" = conversation.len(),
        "smoke test conversation recorded"
    );
    Ok(())
}

async fn ask(models: Vec<String>, system: Option<String>, prompt: String) -> Result<()> {
    let orchestrator = Orchestrator::new(
        ProviderRegistry::with_defaults(),
        Arc::new(FileSettings::discover()),
    );
    let session = ChatSession::new(orchestrator);
    let models: Vec<ModelConfig> = models
        .into_iter()
        .map(|id| {
            let model = ModelConfig::new(id);
            match &system {
                Some(prompt) => model.with_system_prompt(prompt.clone()),
                None => model,
            }
        })
        .collect();

    let mut fan_out = session.send_user_message(ChatMessage::user(prompt), &models, &[])?;
    let single = models.len() == 1;
    let mut stdout = std::io::stdout();
    while let Some(event) = fan_out.events.recv().await {
        match event.kind {
            StreamEventKind::Chunk(delta) if single => {
                write!(stdout, "{delta}")?;
                stdout.flush()?;
            }
            StreamEventKind::Chunk(_) => {}
            StreamEventKind::Completed(completion) => {
                if single {
                    writeln!(stdout)?;
                } else {
                    writeln!(stdout, "== {} ==", event.model)?;
                    writeln!(stdout, "{}\n", completion.text.unwrap_or_default())?;
                }
                for call in completion.tool_calls.unwrap_or_default() {
                    writeln!(stdout, "[tool call {}] {}({})", call.id, call.name, call.arguments)?;
                }
            }
            StreamEventKind::Failed(message) => {
                writeln!(stdout, "== {} failed ==\n{message}\n", event.model)?;
            }
        }
    }
    fan_out.join_all().await;
    Ok(())
}
