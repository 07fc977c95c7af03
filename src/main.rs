use anyhow::Context;
use clawchat::config::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = ServerConfig::from_env().context("invalid configuration")?;
    let addr = config.bind_addr()?;

    eprintln!("ClawChat v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Provider: {} ({})", config.llm.provider, config.llm.base_url);
    eprintln!("   Model: {}", config.llm.model);
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!(
        "   Routing: {}",
        if config.turn.classify_first { "classify first" } else { "direct" }
    );
    eprintln!("   API: http://{}/api/chat", addr);

    clawchat::server::run(&config)
        .await
        .with_context(|| format!("server on {addr} stopped"))?;
    Ok(())
}
