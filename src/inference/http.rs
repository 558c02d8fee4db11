//! Description engine backed by an OpenAI-responses compatible HTTP server
//! (vLLM, llama.cpp server, LM Studio, ...).
//!
//! The image is sent as a base64 PNG data URL. The server answers with the
//! whole text at once; the model replays it word by word through the token
//! callback so that streaming, cancellation and the token budget behave the
//! same as with an on-device model. A cancelled run abandons the request in
//! flight.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use log::{debug, info};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{GenError, GenResult},
    inference::engine::{
        DescriptionEngine, DescriptionInput, DescriptionModel, SamplingParams, TokenControl,
    },
};

#[derive(Debug, Clone)]
pub struct HttpEngineConfig {
    /// Server root, e.g. `http://localhost:8001`
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    /// Request timeout. Unset by default: a slow answer ends only when the
    /// description is cancelled.
    pub timeout: Option<Duration>,
    /// Upper bound sent to the server; the session enforces its own budget
    pub max_output_tokens: usize,
}

impl Default for HttpEngineConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8001".to_string(),
            model: "fastvlm".to_string(),
            api_key: None,
            timeout: None,
            max_output_tokens: 240,
        }
    }
}

pub struct HttpDescriptionEngine {
    config: HttpEngineConfig,
}

impl HttpDescriptionEngine {
    pub fn new(config: HttpEngineConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl DescriptionEngine for HttpDescriptionEngine {
    fn name(&self) -> &str {
        &self.config.model
    }

    async fn load(&self) -> GenResult<Arc<dyn DescriptionModel>> {
        let mut builder = Client::builder();
        if let Some(timeout) = self.config.timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().map_err(GenError::from)?;
        info!(
            "Using description server {} (model {})",
            self.config.base_url, self.config.model
        );
        Ok(Arc::new(HttpDescriptionModel {
            client,
            runtime: Handle::current(),
            config: self.config.clone(),
            pieces: Mutex::new(Vec::new()),
        }))
    }
}

struct HttpDescriptionModel {
    client: Client,
    runtime: Handle,
    config: HttpEngineConfig,
    /// Words of the last response; token ids index into it
    pieces: Mutex<Vec<String>>,
}

#[derive(Deserialize)]
struct ResponsesBody {
    #[serde(default)]
    output_text: Option<String>,
    #[serde(default)]
    output: Vec<OutputItem>,
}

#[derive(Deserialize)]
struct OutputItem {
    #[serde(default)]
    content: Vec<ContentPart>,
}

#[derive(Deserialize)]
struct ContentPart {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

impl ResponsesBody {
    fn text(self) -> Option<String> {
        if let Some(text) = self.output_text {
            return Some(text);
        }
        let text: String = self
            .output
            .into_iter()
            .flat_map(|item| item.content)
            .filter(|part| part.kind == "output_text")
            .filter_map(|part| part.text)
            .collect();
        (!text.is_empty()).then_some(text)
    }
}

/// Request body for one description.
pub fn request_body(
    config: &HttpEngineConfig,
    input: &DescriptionInput,
    params: SamplingParams,
) -> GenResult<Value> {
    let mut content = vec![json!({ "type": "input_text", "text": input.prompt })];
    for image in &input.images {
        let png = image.to_png()?;
        let data_url = format!(
            "data:image/png;base64,{}",
            general_purpose::STANDARD.encode(&png)
        );
        content.push(json!({ "type": "input_image", "image_url": data_url }));
    }
    Ok(json!({
        "model": config.model,
        "input": [{ "role": "user", "content": content }],
        "max_output_tokens": config.max_output_tokens,
        "temperature": params.temperature,
        "seed": params.seed,
    }))
}

impl HttpDescriptionModel {
    async fn request(&self, body: Value) -> GenResult<String> {
        let url = format!("{}/v1/responses", self.config.base_url.trim_end_matches('/'));
        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let details = response.text().await.unwrap_or_default();
            return Err(GenError::engine(
                "description",
                format!("server returned {status}: {details}"),
            ));
        }
        let body: ResponsesBody = response.json().await?;
        body.text()
            .ok_or_else(|| GenError::engine("description", "response contained no text"))
    }
}

impl DescriptionModel for HttpDescriptionModel {
    fn generate(
        &self,
        input: &DescriptionInput,
        params: SamplingParams,
        cancel: &CancellationToken,
        on_token: &mut dyn FnMut(&[u32]) -> TokenControl,
    ) -> GenResult<String> {
        let body = request_body(&self.config, input, params)?;
        let text = self.runtime.block_on(async {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Description request abandoned");
                    Err(GenError::cancelled("description request"))
                }
                result = self.request(body) => result,
            }
        })?;
        debug!("Description server answered with {} chars", text.len());

        let pieces: Vec<String> = text
            .split_inclusive(char::is_whitespace)
            .map(str::to_string)
            .collect();
        *self.pieces.lock().unwrap_or_else(|p| p.into_inner()) = pieces.clone();

        let mut tokens = Vec::with_capacity(pieces.len());
        for id in 0..pieces.len() as u32 {
            tokens.push(id);
            if on_token(&tokens) == TokenControl::Stop {
                break;
            }
        }
        Ok(self.decode(&tokens))
    }

    fn decode(&self, tokens: &[u32]) -> String {
        let pieces = self.pieces.lock().unwrap_or_else(|p| p.into_inner());
        let text: String = tokens
            .iter()
            .filter_map(|&id| pieces.get(id as usize))
            .map(String::as_str)
            .collect();
        text.trim().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::frame::RasterImage;

    #[test]
    fn body_carries_prompt_and_image() {
        let config = HttpEngineConfig::default();
        let input = DescriptionInput::new("Describe.", RasterImage::solid(2, 2, [0, 0, 0, 255]));
        let params = SamplingParams {
            temperature: 0.0,
            seed: 42,
        };
        let body = request_body(&config, &input, params).unwrap();

        let content = &body["input"][0]["content"];
        assert_eq!(content[0]["text"], "Describe.");
        let url = content[1]["image_url"].as_str().unwrap();
        assert!(url.starts_with("data:image/png;base64,"));
        assert_eq!(body["seed"], 42);
    }

    #[test]
    fn text_is_read_from_output_items() {
        let body: ResponsesBody = serde_json::from_value(json!({
            "output": [{ "content": [
                { "type": "output_text", "text": "A cat " },
                { "type": "refusal" },
                { "type": "output_text", "text": "on a sofa." }
            ]}]
        }))
        .unwrap();
        assert_eq!(body.text().as_deref(), Some("A cat on a sofa."));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_abandons_unanswered_request() {
        // Accepts connections but never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let engine = HttpDescriptionEngine::new(HttpEngineConfig {
            base_url: format!("http://{}", listener.local_addr().unwrap()),
            ..HttpEngineConfig::default()
        });
        assert!(engine.config.timeout.is_none());
        let model = engine.load().await.unwrap();

        let cancel = CancellationToken::new();
        let request = {
            let cancel = cancel.clone();
            tokio::task::spawn_blocking(move || {
                let input =
                    DescriptionInput::new("Describe.", RasterImage::solid(2, 2, [0, 0, 0, 255]));
                let params = SamplingParams {
                    temperature: 0.0,
                    seed: 1,
                };
                model.generate(&input, params, &cancel, &mut |_| TokenControl::More)
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!request.is_finished());

        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(2), request)
            .await
            .expect("request stops once cancelled")
            .unwrap();
        assert!(result.unwrap_err().is_cancellation());
        drop(listener);
    }

    #[test]
    fn output_text_shortcut_wins() {
        let body: ResponsesBody =
            serde_json::from_value(json!({ "output_text": "A dog." })).unwrap();
        assert_eq!(body.text().as_deref(), Some("A dog."));
    }
}
