//! Flow access tokens
//!
//! A running flow calls platform APIs with an access token issued for the
//! user who started it. Tokens are fetched while a flow is prepared, handed to
//! the first step of each execution, and revoked when the flow stops.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tributary_core::FlowId;

use crate::error::{OrchestratorError, OrchestratorResult};

/// Interface for the access token service
#[async_trait]
pub trait TokenStore: Send + Sync + Debug {
    /// Token of `user_id` for `flow_id`, issued on first request
    async fn get_token_for_flow_and_user(&self, flow_id: &FlowId, user_id: &str) -> OrchestratorResult<String>;

    /// Token previously issued for `flow_id`
    async fn get_token_by_flow_id(&self, flow_id: &FlowId) -> OrchestratorResult<String>;

    /// Revoke the token of `user_id` for `flow_id`
    async fn delete_token_for_flow_and_user(&self, flow_id: &FlowId, user_id: &str) -> OrchestratorResult<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct IssuedToken {
    user_id: String,
    token: String,
}

/// In-memory implementation of TokenStore
#[derive(Debug, Clone, Default)]
pub struct InMemoryTokenStore {
    tokens: Arc<RwLock<HashMap<FlowId, IssuedToken>>>,
    unavailable: Arc<RwLock<bool>>,
}

impl InMemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail, or recover
    pub async fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.write().await = unavailable;
    }

    pub async fn has_token(&self, flow_id: &FlowId) -> bool {
        self.tokens.read().await.contains_key(flow_id)
    }

    async fn ensure_available(&self) -> OrchestratorResult<()> {
        if *self.unavailable.read().await {
            return Err(OrchestratorError::CredentialError(
                "Token service unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn get_token_for_flow_and_user(&self, flow_id: &FlowId, user_id: &str) -> OrchestratorResult<String> {
        self.ensure_available().await?;
        let mut tokens = self.tokens.write().await;
        let issued = tokens.entry(flow_id.clone()).or_insert_with(|| IssuedToken {
            user_id: user_id.to_string(),
            token: format!("token-{}", uuid::Uuid::new_v4().simple()),
        });
        if issued.user_id != user_id {
            *issued = IssuedToken {
                user_id: user_id.to_string(),
                token: format!("token-{}", uuid::Uuid::new_v4().simple()),
            };
        }
        Ok(issued.token.clone())
    }

    async fn get_token_by_flow_id(&self, flow_id: &FlowId) -> OrchestratorResult<String> {
        self.ensure_available().await?;
        self.tokens
            .read()
            .await
            .get(flow_id)
            .map(|issued| issued.token.clone())
            .ok_or_else(|| OrchestratorError::NotFound(format!("Token for flow {}", flow_id)))
    }

    async fn delete_token_for_flow_and_user(&self, flow_id: &FlowId, user_id: &str) -> OrchestratorResult<()> {
        self.ensure_available().await?;
        let mut tokens = self.tokens.write().await;
        if tokens.get(flow_id).is_some_and(|issued| issued.user_id == user_id) {
            tokens.remove(flow_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_token_lifecycle() {
        let store = InMemoryTokenStore::new();
        let flow_id = FlowId::from("f1");

        assert!(store.get_token_by_flow_id(&flow_id).await.is_err());

        let token = store.get_token_for_flow_and_user(&flow_id, "u1").await.unwrap();
        assert_eq!(store.get_token_for_flow_and_user(&flow_id, "u1").await.unwrap(), token);
        assert_eq!(store.get_token_by_flow_id(&flow_id).await.unwrap(), token);

        store.delete_token_for_flow_and_user(&flow_id, "someone-else").await.unwrap();
        assert!(store.has_token(&flow_id).await);

        store.delete_token_for_flow_and_user(&flow_id, "u1").await.unwrap();
        assert!(!store.has_token(&flow_id).await);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails() {
        let store = InMemoryTokenStore::new();
        store.set_unavailable(true).await;
        assert!(matches!(
            store.get_token_for_flow_and_user(&FlowId::from("f1"), "u1").await,
            Err(OrchestratorError::CredentialError(_))
        ));
    }
}
