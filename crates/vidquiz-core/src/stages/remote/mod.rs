//! Stage functions backed by HTTP inference servers.
//!
//! The stage traits are blocking and run on the blocking pool, so every
//! adapter drives its async `reqwest` client through the ambient tokio
//! handle. `load`/`unload` map to the server's model residency controls.

mod ollama;
mod transcribe;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::debug;

use super::StageError;

pub use ollama::{OllamaFrameAnalyzer, OllamaQuizGenerator, OllamaTitleGenerator};
pub use transcribe::OpenAiTranscriber;

/// Run `fut` to completion from a blocking-pool thread.
fn block_on<F: Future>(fut: F) -> Result<F::Output, StageError> {
    let handle = tokio::runtime::Handle::try_current()
        .map_err(|e| StageError::Unavailable(format!("no async runtime: {e}")))?;
    Ok(handle.block_on(fut))
}

fn http_error(e: reqwest::Error) -> StageError {
    if e.is_timeout() {
        StageError::Inference(format!("request timed out: {e}"))
    } else if e.is_connect() {
        StageError::Unavailable(e.to_string())
    } else {
        StageError::Inference(e.to_string())
    }
}

/// One model on an Ollama server.
///
/// Loading sends an empty generate request with a long `keep_alive`;
/// unloading sends `keep_alive: 0`, which evicts the model from GPU memory.
#[derive(Debug)]
pub struct OllamaSession {
    client: reqwest::Client,
    base_url: String,
    model: String,
    keep_alive: String,
    loaded: AtomicBool,
}

impl OllamaSession {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            model: model.into(),
            keep_alive: "30m".to_owned(),
            loaded: AtomicBool::new(false),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn set_keep_alive(&self, keep_alive: Value) -> Result<(), StageError> {
        let url = format!("{}/api/generate", self.base_url);
        let body = json!({ "model": self.model, "keep_alive": keep_alive });
        block_on(async {
            self.client
                .post(&url)
                .json(&body)
                .send()
                .await
                .and_then(reqwest::Response::error_for_status)
                .map(|_| ())
                .map_err(http_error)
        })?
    }

    pub fn load(&self) -> Result<(), StageError> {
        if self.loaded.load(Ordering::Acquire) {
            return Ok(());
        }
        self.set_keep_alive(json!(self.keep_alive))
            .map_err(|e| StageError::Load(format!("{}: {e}", self.model)))?;
        self.loaded.store(true, Ordering::Release);
        debug!(model = %self.model, "ollama model loaded");
        Ok(())
    }

    pub fn unload(&self) -> Result<(), StageError> {
        if !self.loaded.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        self.set_keep_alive(json!(0))
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    /// Single non-streaming completion. `images` are base64-encoded.
    pub fn generate(
        &self,
        prompt: &str,
        images: &[String],
        json_format: bool,
    ) -> Result<String, StageError> {
        let url = format!("{}/api/generate", self.base_url);
        let mut body = json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
            "keep_alive": self.keep_alive,
            "options": { "temperature": 0.3 },
        });
        if !images.is_empty() {
            body["images"] = json!(images);
        }
        if json_format {
            body["format"] = json!("json");
        }

        let reply: Value = block_on(async {
            let response = self
                .client
                .post(&url)
                .json(&body)
                .send()
                .await
                .and_then(reqwest::Response::error_for_status)
                .map_err(http_error)?;
            response.json::<Value>().await.map_err(http_error)
        })??;

        reply
            .get("response")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| StageError::InvalidOutput("missing `response` field".to_owned()))
    }
}

/// Parse the first JSON value of type `T` embedded in free model text.
///
/// Models often wrap JSON in prose or code fences; this scans for the first
/// `[` or `{` that starts a value of the expected shape.
pub fn parse_embedded_json<T: DeserializeOwned>(text: &str) -> Result<T, StageError> {
    let mut last_err = None;
    for (i, c) in text.char_indices() {
        if c != '[' && c != '{' {
            continue;
        }
        let mut stream = serde_json::Deserializer::from_str(&text[i..]).into_iter::<T>();
        match stream.next() {
            Some(Ok(value)) => return Ok(value),
            Some(Err(e)) => last_err = Some(e.to_string()),
            None => {}
        }
    }
    Err(StageError::InvalidOutput(
        last_err.unwrap_or_else(|| "no JSON found in model output".to_owned()),
    ))
}
