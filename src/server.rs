//! Server assembly: wires the store, the language-model clients and the
//! router together from a [`ServerConfig`].

use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;

use crate::chat::{AppState, ChatService, chat_routes};
use crate::config::ServerConfig;
use crate::error::Result;
use crate::llm::{CompletionClient, IntentClassifier};
use crate::orchestrator::Orchestrator;
use crate::store::LibSqlBackend;

/// Open the database and build every route.
pub async fn build(config: &ServerConfig) -> Result<Router> {
    let sessions = Arc::new(LibSqlBackend::new_local(&config.db_path).await?);
    let completion = Arc::new(CompletionClient::new(config.llm.clone())?);
    let classifier = Arc::new(IntentClassifier::new(
        config.llm.clone(),
        config.classify_context,
    )?);

    let chat = ChatService::new(
        sessions,
        completion,
        classifier,
        Arc::new(Orchestrator::new()),
        config.turn.clone(),
    );
    Ok(chat_routes(AppState {
        chat: Arc::new(chat),
        ai_provider: config.llm.provider.clone(),
        ai_model: config.llm.model.clone(),
    }))
}

/// Build the app and serve it on the configured address until shutdown.
pub async fn run(config: &ServerConfig) -> Result<()> {
    let addr = config.bind_addr()?;
    let app = build(config).await?;
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "ClawChat server started");
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use super::*;
    use crate::error::{ConfigError, Error};

    fn config(vars: &[(&str, String)]) -> ServerConfig {
        ServerConfig::from_lookup(|key| {
            vars.iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.clone())
        })
        .unwrap()
    }

    #[tokio::test]
    async fn build_opens_file_database_and_serves_health() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("nested").join("clawchat.db");
        let cfg = config(&[
            ("CLAWCHAT_DB_PATH", db.display().to_string()),
            ("AI_MODEL", "test-model".to_string()),
        ]);

        let app = build(&cfg).await.unwrap();
        assert!(db.exists());

        let resp = app
            .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(health["ai_model"], "test-model");
    }

    #[tokio::test]
    async fn unusable_host_is_a_config_error() {
        let cfg = config(&[("CLAWCHAT_HOST", "not a host".to_string())]);
        let err = run(&cfg).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Config(ConfigError::InvalidValue { ref key, .. }) if key == "CLAWCHAT_HOST"
        ));
    }
}
