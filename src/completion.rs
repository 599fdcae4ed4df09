use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::config::{CompletionKind, CompletionSettings, EmbeddingSettings};
use crate::error::{Error, Result};
use crate::process::{ProcessConfig, spawn_and_stream};

/// A chat-style completion endpoint: one system/user message pair in, free
/// text out.
pub trait CompletionClient: Send + Sync + 'static {
    fn complete(&self, system: &str, user: &str)
    -> impl Future<Output = Result<String>> + Send;
}

/// Encodes texts into vectors for similarity comparison.
pub trait VectorEncoder: Send + Sync {
    fn encode(&self, texts: &[String]) -> impl Future<Output = Result<Vec<Vec<f32>>>> + Send;
}

/// Runs an agent binary with the prompt on stdin and takes its stdout as
/// the completion.
pub struct CommandCompletion {
    binary: String,
    args: Vec<String>,
    working_dir: PathBuf,
    timeout: Option<Duration>,
}

impl CommandCompletion {
    pub fn new(binary: String, args: Vec<String>, timeout: Option<Duration>) -> Self {
        Self {
            binary,
            args,
            working_dir: PathBuf::from("."),
            timeout,
        }
    }

    pub fn build_input(system: &str, user: &str) -> String {
        format!("{system}\n\n{user}\n")
    }
}

impl CompletionClient for CommandCompletion {
    async fn complete(&self, system: &str, user: &str) -> Result<String> {
        let config = ProcessConfig {
            command: self.binary.clone(),
            args: self.args.clone(),
            working_dir: self.working_dir.clone(),
            timeout: self.timeout,
            log_prefix: "completion".to_string(),
            env: vec![],
            stdin_data: Some(Self::build_input(system, user)),
        };

        let output = spawn_and_stream(config).await?;

        if let Some(sig) = output.signal {
            return Err(Error::Completion(format!(
                "'{}' killed by signal {sig}",
                self.binary
            )));
        }
        if output.exit_code != 0 {
            return Err(Error::Completion(format!(
                "'{}' exited with code {}",
                self.binary, output.exit_code
            )));
        }

        Ok(output.stdout_lines.join("\n"))
    }
}

/// OpenAI-style `chat/completions` endpoint.
pub struct HttpCompletion {
    url: String,
    model: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl HttpCompletion {
    pub fn new(url: String, model: String, api_key: Option<String>, timeout: Duration) -> Self {
        Self {
            url,
            model,
            api_key,
            timeout,
        }
    }

    pub fn request_body(&self, system: &str, user: &str) -> serde_json::Value {
        serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user },
            ],
        })
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

fn chat_content(response: ChatResponse) -> Result<String> {
    response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| Error::Completion("completion response has no content".to_string()))
}

impl CompletionClient for HttpCompletion {
    async fn complete(&self, system: &str, user: &str) -> Result<String> {
        let body = self.request_body(system, user);
        let url = self.url.clone();
        let api_key = self.api_key.clone();
        let timeout = self.timeout;
        debug!(url = %url, model = %self.model, "requesting completion");

        let response: ChatResponse =
            blocking_post(url, api_key, timeout, body, Error::Completion).await?;
        chat_content(response)
    }
}

/// OpenAI-style `embeddings` endpoint.
pub struct HttpEncoder {
    url: String,
    model: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl HttpEncoder {
    pub fn new(url: String, model: String, api_key: Option<String>, timeout: Duration) -> Self {
        Self {
            url,
            model,
            api_key,
            timeout,
        }
    }

    pub fn from_settings(settings: &EmbeddingSettings) -> Self {
        Self::new(
            settings.url.clone(),
            settings.model.clone(),
            read_api_key(settings.api_key_env.as_deref()),
            Duration::from_secs(settings.timeout_secs),
        )
    }
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingItem {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

fn embedding_vectors(response: EmbeddingResponse) -> Vec<Vec<f32>> {
    let mut items = response.data;
    items.sort_by_key(|item| item.index);
    items.into_iter().map(|item| item.embedding).collect()
}

impl VectorEncoder for HttpEncoder {
    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let response: EmbeddingResponse = blocking_post(
            self.url.clone(),
            self.api_key.clone(),
            self.timeout,
            body,
            Error::DependencyUnavailable,
        )
        .await?;
        Ok(embedding_vectors(response))
    }
}

/// POST a JSON body on the blocking pool. Unreachable endpoints map to
/// `DependencyUnavailable`; HTTP and decoding failures go through `on_error`.
async fn blocking_post<T>(
    url: String,
    api_key: Option<String>,
    timeout: Duration,
    body: serde_json::Value,
    on_error: fn(String) -> Error,
) -> Result<T>
where
    T: serde::de::DeserializeOwned + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        let mut request = agent.post(&url).set("Content-Type", "application/json");
        if let Some(key) = api_key {
            request = request.set("Authorization", &format!("Bearer {key}"));
        }
        match request.send_json(&body) {
            Ok(response) => response
                .into_json::<T>()
                .map_err(|e| on_error(format!("failed to decode response from {url}: {e}"))),
            Err(ureq::Error::Status(code, _)) => {
                Err(on_error(format!("{url} returned HTTP {code}")))
            }
            Err(ureq::Error::Transport(e)) => Err(Error::DependencyUnavailable(format!(
                "{url} unreachable: {e}"
            ))),
        }
    })
    .await
    .map_err(|e| Error::Completion(format!("request task failed: {e}")))?
}

fn read_api_key(env_var: Option<&str>) -> Option<String> {
    env_var.and_then(|name| std::env::var(name).ok())
}

/// Enum dispatching to the configured completion backend.
pub enum AnyCompletion {
    Command(CommandCompletion),
    Http(HttpCompletion),
}

impl AnyCompletion {
    pub fn from_settings(settings: &CompletionSettings) -> Result<Self> {
        let timeout = Duration::from_secs(settings.timeout_secs);
        match settings.kind {
            CompletionKind::Command => {
                let binary = settings.binary.clone().ok_or_else(|| {
                    Error::ConfigValidation("completion.binary is required for kind \"command\"".to_string())
                })?;
                Ok(AnyCompletion::Command(CommandCompletion::new(
                    binary,
                    settings.args.clone(),
                    Some(timeout),
                )))
            }
            CompletionKind::Http => {
                let url = settings.url.clone().ok_or_else(|| {
                    Error::ConfigValidation("completion.url is required for kind \"http\"".to_string())
                })?;
                let model = settings.model.clone().unwrap_or_default();
                Ok(AnyCompletion::Http(HttpCompletion::new(
                    url,
                    model,
                    read_api_key(settings.api_key_env.as_deref()),
                    timeout,
                )))
            }
        }
    }
}

impl CompletionClient for AnyCompletion {
    async fn complete(&self, system: &str, user: &str) -> Result<String> {
        match self {
            AnyCompletion::Command(c) => c.complete(system, user).await,
            AnyCompletion::Http(c) => c.complete(system, user).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_body_shape() {
        let client = HttpCompletion::new(
            "http://localhost/v1/chat/completions".to_string(),
            "small".to_string(),
            None,
            Duration::from_secs(5),
        );
        let body = client.request_body("sys", "usr");
        assert_eq!(body["model"], "small");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][0]["content"], "sys");
        assert_eq!(body["messages"][1]["role"], "user");
        assert_eq!(body["messages"][1]["content"], "usr");
    }

    #[test]
    fn test_chat_content_takes_first_choice() {
        let response: ChatResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"role":"assistant","content":"[]"}},{"message":{"content":"x"}}]}"#,
        )
        .unwrap();
        assert_eq!(chat_content(response).unwrap(), "[]");
    }

    #[test]
    fn test_chat_content_missing() {
        let response: ChatResponse = serde_json::from_str(r#"{"choices":[]}"#).unwrap();
        assert!(matches!(chat_content(response), Err(Error::Completion(_))));
    }

    #[test]
    fn test_embedding_vectors_ordered_by_index() {
        let response: EmbeddingResponse = serde_json::from_str(
            r#"{"data":[{"index":1,"embedding":[0.0,1.0]},{"index":0,"embedding":[1.0,0.0]}]}"#,
        )
        .unwrap();
        assert_eq!(
            embedding_vectors(response),
            vec![vec![1.0, 0.0], vec![0.0, 1.0]]
        );
    }

    #[test]
    fn test_from_settings_requires_binary() {
        let settings = CompletionSettings {
            kind: CompletionKind::Command,
            binary: None,
            ..Default::default()
        };
        assert!(matches!(
            AnyCompletion::from_settings(&settings),
            Err(Error::ConfigValidation(_))
        ));
    }

    #[tokio::test]
    async fn test_command_completion_pipes_prompt() {
        let client = CommandCompletion::new("cat".to_string(), vec![], Some(Duration::from_secs(5)));
        let out = client.complete("system text", "user text").await.unwrap();
        assert_eq!(out, "system text\n\nuser text");
    }

    #[tokio::test]
    async fn test_command_completion_nonzero_exit() {
        let client = CommandCompletion::new("false".to_string(), vec![], Some(Duration::from_secs(5)));
        let err = client.complete("s", "u").await.unwrap_err();
        assert!(err.to_string().contains("exited with code 1"));
    }

    #[tokio::test]
    async fn test_unreachable_encoder_is_dependency_unavailable() {
        let encoder = HttpEncoder::new(
            "http://127.0.0.1:1/v1/embeddings".to_string(),
            "embed".to_string(),
            None,
            Duration::from_secs(2),
        );
        let err = encoder.encode(&["x".to_string()]).await.unwrap_err();
        assert!(matches!(err, Error::DependencyUnavailable(_)));
    }
}
