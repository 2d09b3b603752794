use std::sync::Arc;

use tracing::{info, warn};

use tabula_agent::provider::LlmProvider;
use tabula_llm::ClaudeProvider;
use tabula_server::{router, state::AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    tabula_core::config::load_dotenv();
    let config = tabula_core::Config::from_env();
    config.log_summary();

    let provider: Option<Arc<dyn LlmProvider>> = match ClaudeProvider::from_config(&config.llm) {
        Some(provider) => Some(Arc::new(provider)),
        None => {
            warn!("ANTHROPIC_API_KEY not set — chat turns will be rejected");
            None
        }
    };

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let state = Arc::new(AppState::new(config, provider)?);
    let app = router::build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("server listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}
