use anyhow::{Context, Result};
use tributary_orchestrator::config::OrchestratorConfig;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration from the optional file and the environment
    let config = OrchestratorConfig::load()
        .context("Failed to load configuration")?;

    // Run the orchestrator using the library's run function
    tributary_orchestrator::run(config).await
        .context("Orchestrator error")?;

    Ok(())
}
