//! Continuation tokens
//!
//! Every message published to a step carries an HS256 token with the routing
//! and auth context of that step. The step echoes it back on the backchannel
//! and the orchestrator trusts nothing in the delivery that the token does not
//! vouch for.

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tributary_core::{FlowExecId, FlowId, SpecialFlags, StepId};

use crate::error::{OrchestratorError, OrchestratorResult};

/// Claims of a continuation token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinuationClaims {
    pub flow_id: FlowId,
    pub step_id: StepId,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub function: String,
    pub flow_exec_id: FlowExecId,
    #[serde(default)]
    pub secret_id: Option<String>,
    #[serde(default)]
    pub fields: Value,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub node_settings: Value,
    #[serde(default)]
    pub special_flags: SpecialFlags,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
}

/// Signs and verifies continuation tokens with a shared secret
#[derive(Clone)]
pub struct TokenSigner {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl std::fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSigner").finish_non_exhaustive()
    }
}

impl TokenSigner {
    /// Create a signer; the secret must not be empty
    pub fn new(secret: &str) -> OrchestratorResult<Self> {
        if secret.trim().is_empty() {
            return Err(OrchestratorError::ConfigError(
                "Token secret is required".to_string(),
            ));
        }
        Ok(Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        })
    }

    pub fn sign(&self, claims: &ContinuationClaims) -> OrchestratorResult<String> {
        Ok(jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            claims,
            &self.encoding,
        )?)
    }

    /// Verify the signature and decode the claims
    ///
    /// Continuation tokens carry no expiry; they live as long as the message.
    pub fn verify(&self, token: &str) -> OrchestratorResult<ContinuationClaims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.required_spec_claims.clear();
        validation.validate_exp = false;

        let data = jsonwebtoken::decode::<ContinuationClaims>(token, &self.decoding, &validation)?;
        Ok(data.claims)
    }
}
