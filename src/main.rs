use std::sync::Arc;

use anyhow::Context;
use muni_assist_sdk::cli::Console;
use muni_assist_sdk::conversation::FileConversationStore;
use muni_assist_sdk::llm::StreamFragment;
use muni_assist_sdk::logging::{self, LoggingConfig};
use muni_assist_sdk::tools::ToolRegistry;
use muni_assist_sdk::{ChatConfig, ChatError, ChatOrchestrator};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const SYSTEM_PROMPT: &str = "You are an assistant for municipal utility finance: budgets, \
enterprise funds, rates and compliance. Answer concisely and show the figures you rely on.";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = logging::init_logging(&LoggingConfig::default().with_log_dir("logs"))?;

    tracing::info!("=== Muni Assist Console Starting ===");

    // Optional config file as the first argument, then CHAT__* overrides
    let config = match std::env::args().nth(1) {
        Some(path) => ChatConfig::from_file(&path)
            .with_context(|| format!("failed to load config from {}", path))?,
        None => ChatConfig::new(),
    }
    .with_env_overrides();

    let tools = ToolRegistry::from_config(&config);
    let orchestrator = ChatOrchestrator::builder(config)
        .with_store(Arc::new(FileConversationStore::new()))
        .with_tools(tools)
        .build()?;

    let startup = CancellationToken::new();
    let model = orchestrator.initialize_model(&startup).await;

    let console = Console::new();
    console.print_banner(&model);
    console.print_health(&orchestrator.health_check(&startup).await);
    console.print_separator();

    let mut conversation_id = Uuid::new_v4().to_string();

    loop {
        let input = console.read_input()?;
        match input.as_str() {
            "" => continue,
            "/quit" | "/exit" => break,
            "/new" => {
                conversation_id = Uuid::new_v4().to_string();
                console.print_system(&format!("Started conversation {}", conversation_id));
                continue;
            }
            "/health" => {
                console.print_health(&orchestrator.health_check(&startup).await);
                continue;
            }
            _ => {}
        }

        // Ctrl-C cancels the current answer only
        let cancel = CancellationToken::new();
        let watcher = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    cancel.cancel();
                }
            })
        };

        console.print_assistant_prefix();
        let mut sink = |fragment: StreamFragment| console.print_fragment(&fragment);
        let result = orchestrator
            .ask(
                &input,
                Some(conversation_id.as_str()),
                Some(SYSTEM_PROMPT),
                &mut sink,
                &cancel,
            )
            .await;
        watcher.abort();

        match result {
            Ok(outcome) => console.print_outcome(&outcome),
            Err(ChatError::Cancelled) => {
                println!();
                console.print_system("Cancelled");
            }
            Err(e) => {
                tracing::error!("Ask failed: {}", e);
                console.print_error(&e.to_string());
                break;
            }
        }
        console.print_separator();
    }

    tracing::info!("=== Muni Assist Console Shutting Down ===");
    Ok(())
}
