//! Decision engine over an OpenAI-compatible `chat/completions` endpoint with tool calling.

use crate::config::LlmSettings;
use serde::{Deserialize, Serialize};
use sourcegate_core::{
    Decision, DecisionEngine, Error, Message, Result, Role, ToolCall, ToolSpec,
};
use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct OpenAiCompatClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    timeout: Duration,
}

impl OpenAiCompatClient {
    pub fn new(client: reqwest::Client, settings: &LlmSettings) -> Self {
        Self {
            client,
            base_url: settings.base_url.clone(),
            api_key: settings.api_key.clone(),
            model: settings.model.clone(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    fn endpoint_chat_completions(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[derive(Debug, Clone, Serialize)]
struct ChatCompletionsRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'static str>,
    stream: bool,
}

#[derive(Debug, Clone, Serialize)]
struct WireMessage {
    role: &'static str,
    content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<WireToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct WireTool<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunctionSpec<'a>,
}

#[derive(Debug, Clone, Serialize)]
struct WireFunctionSpec<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireToolCall {
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    function: WireFunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireFunctionCall {
    #[serde(default)]
    name: String,
    /// Usually a JSON string; some providers send an object.
    #[serde(default)]
    arguments: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatCompletionsResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Clone, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Clone, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

fn to_wire(m: &Message) -> WireMessage {
    WireMessage {
        role: role_str(m.role),
        content: m.content.clone(),
        tool_calls: m
            .tool_calls
            .iter()
            .map(|c| WireToolCall {
                id: Some(c.id.clone()),
                kind: Some("function".to_string()),
                function: WireFunctionCall {
                    name: c.name.clone(),
                    arguments: serde_json::Value::String(c.arguments.clone()),
                },
            })
            .collect(),
        tool_call_id: m.tool_call_id.clone(),
    }
}

fn arguments_text(v: serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn decision_from_response(parsed: ChatCompletionsResponse) -> Result<Decision> {
    let choice = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| Error::Decision("response has no choices".to_string()))?;
    let calls = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|c| ToolCall {
            // Empty ids are replaced when the call is appended to the conversation.
            id: c.id.unwrap_or_default(),
            name: c.function.name,
            arguments: arguments_text(c.function.arguments),
        })
        .collect();
    Ok(Decision::from_parts(choice.message.content, calls))
}

#[async_trait::async_trait]
impl DecisionEngine for OpenAiCompatClient {
    async fn decide(&self, conversation: &[Message], tools: &[ToolSpec]) -> Result<Decision> {
        let Some(api_key) = &self.api_key else {
            return Err(Error::NotConfigured(
                "missing SOURCEGATE_LLM_API_KEY (or OPENROUTER_API_KEY)".to_string(),
            ));
        };

        let req = ChatCompletionsRequest {
            model: &self.model,
            messages: conversation.iter().map(to_wire).collect(),
            tools: tools
                .iter()
                .map(|t| WireTool {
                    kind: "function",
                    function: WireFunctionSpec {
                        name: &t.name,
                        description: &t.description,
                        parameters: &t.parameters,
                    },
                })
                .collect(),
            tool_choice: (!tools.is_empty()).then_some("auto"),
            stream: false,
        };

        let resp = self
            .client
            .post(self.endpoint_chat_completions())
            .timeout(self.timeout)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(reqwest::header::AUTHORIZATION, format!("Bearer {api_key}"))
            .json(&req)
            .send()
            .await
            .map_err(|e| Error::Decision(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let body: String = body.chars().take(300).collect();
            return Err(Error::Decision(format!(
                "chat.completions HTTP {status}: {body}"
            )));
        }

        let parsed: ChatCompletionsResponse = resp
            .json()
            .await
            .map_err(|e| Error::Decision(format!("malformed reply: {e}")))?;
        decision_from_response(parsed)
    }
}
