//! Credential lookup and the text-generation collaborator.
//!
//! Credentials are injected as a handle rather than read ad hoc at call
//! sites, so tests can supply a fixed map and the provider stack can do its
//! capability checks against one source of truth.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::MnemoError;

/// Keyed credential lookup. Backed by the process environment in
/// production; a fixed map in tests.
#[derive(Clone)]
pub struct Credentials {
    overrides: Option<HashMap<String, String>>,
}

impl Credentials {
    pub fn from_env() -> Self {
        Self { overrides: None }
    }

    /// Fixed-map lookup that never touches the environment.
    pub fn from_map(map: HashMap<String, String>) -> Self {
        Self { overrides: Some(map) }
    }

    /// A credential counts only when present and non-empty.
    pub fn get(&self, name: &str) -> Option<String> {
        let value = match &self.overrides {
            Some(map) => map.get(name).cloned(),
            None => std::env::var(name).ok(),
        };
        value.filter(|v| !v.trim().is_empty())
    }

    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some()
    }
}

const GEN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f64,
}

#[derive(Serialize, Deserialize, Clone)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Text-generation collaborator, used only for chunk enrichment.
/// OpenAI-compatible chat endpoint; absent config disables enrichment.
#[derive(Clone)]
pub struct GenConfig {
    pub url: String,
    pub key: String,
    pub model: String,
    client: reqwest::Client,
}

impl GenConfig {
    /// Returns `None` if `MNEMO_LLM_URL` is not configured.
    pub fn from_credentials(creds: &Credentials) -> Option<Self> {
        let url = creds.get("MNEMO_LLM_URL")?;
        let key = creds.get("MNEMO_LLM_KEY").unwrap_or_default();
        let model = creds.get("MNEMO_LLM_MODEL").unwrap_or_else(|| "gpt-4o-mini".into());

        let client = reqwest::Client::builder()
            .timeout(GEN_TIMEOUT)
            .build()
            .expect("failed to build HTTP client");

        debug!(model = %model, "text generation configured");
        Some(Self { url, key, model, client })
    }

    /// Send a chat completion request, return the response text.
    pub async fn generate(&self, system: &str, user: &str) -> Result<String, MnemoError> {
        let req = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage { role: "system".into(), content: system.into() },
                ChatMessage { role: "user".into(), content: user.into() },
            ],
            temperature: 0.1,
        };

        let mut builder = self.client.post(&self.url).json(&req);
        if !self.key.is_empty() {
            builder = builder.header("Authorization", format!("Bearer {}", self.key));
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| MnemoError::Internal(format!("generation request failed: {e}")))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(MnemoError::Internal(format!("generation returned {status}: {body}")));
        }

        let chat: ChatResponse = resp
            .json()
            .await
            .map_err(|e| MnemoError::Internal(format!("generation response parse failed: {e}")))?;
        Ok(chat
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_lookup() {
        let mut map = HashMap::new();
        map.insert("A_KEY".to_string(), "secret".to_string());
        map.insert("EMPTY".to_string(), "  ".to_string());
        let creds = Credentials::from_map(map);

        assert!(creds.has("A_KEY"));
        assert_eq!(creds.get("A_KEY").as_deref(), Some("secret"));
        // whitespace-only counts as absent
        assert!(!creds.has("EMPTY"));
        assert!(!creds.has("MISSING"));
    }

    #[test]
    fn gen_config_requires_url() {
        let creds = Credentials::from_map(HashMap::new());
        assert!(GenConfig::from_credentials(&creds).is_none());
    }
}
