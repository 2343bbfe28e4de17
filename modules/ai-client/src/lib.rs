//! Minimal Anthropic client. Two call shapes cover everything the pipeline
//! needs: schema-forced structured extraction (config synthesis, alert
//! judgment) and plain one-shot completion (change summaries).

mod wire;

use std::time::Duration;

use anyhow::{anyhow, Result};
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use tracing::debug;

use wire::{ChatRequest, ChatResponse, ToolDefinitionWire, WireMessage};

const MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";

/// Types the model can be forced to produce. Blanket-implemented for
/// anything deriving `JsonSchema` + `Deserialize`.
pub trait StructuredOutput: JsonSchema + DeserializeOwned {
    fn output_schema() -> serde_json::Value {
        let schema = schemars::gen::SchemaSettings::draft07()
            .into_generator()
            .into_root_schema_for::<Self>();
        serde_json::to_value(schema).unwrap_or_default()
    }
}

impl<T: JsonSchema + DeserializeOwned> StructuredOutput for T {}

#[derive(Clone)]
pub struct Claude {
    api_key: String,
    model: String,
    base_url: Option<String>,
    timeout: Duration,
}

impl Claude {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            base_url: None,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn from_env(model: impl Into<String>) -> Result<Self> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| anyhow!("ANTHROPIC_API_KEY environment variable not set"))?;
        Ok(Self::new(api_key, model))
    }

    /// Override the Messages API base URL (tests, proxies).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Per-request wall-clock budget, including connection setup.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn endpoint(&self) -> String {
        match &self.base_url {
            Some(base) => format!("{}/messages", base.trim_end_matches('/')),
            None => MESSAGES_URL.to_string(),
        }
    }

    async fn send(&self, request: ChatRequest) -> Result<ChatResponse> {
        debug!(model = %request.model, "anthropic request");

        let http = reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .unwrap_or_default();

        let response = http
            .post(self.endpoint())
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&request)
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => Ok(response.json().await?),
            status => {
                let detail = response.text().await.unwrap_or_default();
                Err(anyhow!("anthropic API returned {status}: {detail}"))
            }
        }
    }

    /// Force a schema-shaped answer by routing the response through a
    /// single mandatory tool.
    pub async fn extract<T: StructuredOutput>(
        &self,
        system_prompt: impl Into<String>,
        user_prompt: impl Into<String>,
    ) -> Result<T> {
        let request = ChatRequest::new(&self.model)
            .system(system_prompt)
            .message(WireMessage::user(user_prompt))
            .temperature(0.0)
            .forced_tool(ToolDefinitionWire {
                name: "structured_response".to_string(),
                description: "Return the structured result.".to_string(),
                input_schema: T::output_schema(),
            });

        let response = self.send(request).await?;

        let input = response
            .tool_input()
            .ok_or_else(|| anyhow!("no structured output in Claude response"))?;
        serde_json::from_value(input.clone())
            .map_err(|e| anyhow!("failed to deserialize structured response: {e}"))
    }

    /// Plain single-turn completion.
    pub async fn chat_completion(
        &self,
        system: impl Into<String>,
        user: impl Into<String>,
    ) -> Result<String> {
        let request = ChatRequest::new(&self.model)
            .system(system)
            .message(WireMessage::user(user))
            .temperature(0.0);

        let response = self.send(request).await?;
        response
            .text()
            .ok_or_else(|| anyhow!("no text in Claude response"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use schemars::JsonSchema;
    use serde::Deserialize;

    #[derive(Deserialize, JsonSchema)]
    struct Verdict {
        #[allow(dead_code)]
        relevant: bool,
    }

    #[test]
    fn builder_records_overrides() {
        let ai = Claude::new("sk-ant-test", "claude-haiku-4-5-20251001")
            .with_base_url("http://127.0.0.1:9999/v1")
            .with_timeout(Duration::from_secs(5));
        assert_eq!(ai.model(), "claude-haiku-4-5-20251001");
        assert_eq!(ai.timeout, Duration::from_secs(5));
    }

    #[test]
    fn endpoint_appends_messages_to_the_override() {
        let ai = Claude::new("sk-ant-test", "m").with_base_url("http://127.0.0.1:9999/v1/");
        assert_eq!(ai.endpoint(), "http://127.0.0.1:9999/v1/messages");

        let default = Claude::new("sk-ant-test", "m");
        assert_eq!(default.endpoint(), MESSAGES_URL);
    }

    #[test]
    fn output_schema_is_an_object_schema() {
        let schema = Verdict::output_schema();
        assert_eq!(schema["type"], "object");
        assert!(schema["properties"]["relevant"].is_object());
    }
}
