use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use super::{block_on, http_error};
use crate::model::TranscriptSpan;
use crate::stages::{ModelStage, StageError, Transcriber};

/// Transcriber for any server exposing the OpenAI
/// `POST /v1/audio/transcriptions` endpoint (whisper.cpp server,
/// faster-whisper-server, vLLM and friends).
///
/// `load` checks that the server answers; the model itself stays managed by
/// the server process, so `unload` only clears the local flag.
#[derive(Debug)]
pub struct OpenAiTranscriber {
    client: reqwest::Client,
    base_url: String,
    model: String,
    language: Option<String>,
    loaded: AtomicBool,
}

#[derive(Debug, Deserialize)]
struct VerboseTranscription {
    #[serde(default)]
    segments: Vec<VerboseSegment>,
    #[serde(default)]
    text: String,
    #[serde(default)]
    duration: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct VerboseSegment {
    start: f64,
    end: f64,
    text: String,
    #[serde(default)]
    avg_logprob: Option<f64>,
}

impl OpenAiTranscriber {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            model: model.into(),
            language: None,
            loaded: AtomicBool::new(false),
        }
    }

    /// Force the spoken language instead of letting the server detect it.
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }
}

impl ModelStage for OpenAiTranscriber {
    fn name(&self) -> &str {
        "transcriber"
    }

    fn load(&self) -> Result<(), StageError> {
        if self.loaded.load(Ordering::Acquire) {
            return Ok(());
        }
        let url = format!("{}/v1/models", self.base_url);
        block_on(async {
            self.client
                .get(&url)
                .send()
                .await
                .and_then(reqwest::Response::error_for_status)
                .map_err(|e| StageError::Load(e.to_string()))
        })??;
        self.loaded.store(true, Ordering::Release);
        Ok(())
    }

    fn unload(&self) -> Result<(), StageError> {
        self.loaded.store(false, Ordering::Release);
        Ok(())
    }

    fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }
}

impl Transcriber for OpenAiTranscriber {
    fn transcribe(&self, audio: &Path) -> Result<Vec<TranscriptSpan>, StageError> {
        let bytes = std::fs::read(audio)
            .map_err(|e| StageError::Inference(format!("cannot read {}: {e}", audio.display())))?;
        let file_name = audio
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audio.wav".to_owned());

        let url = format!("{}/v1/audio/transcriptions", self.base_url);
        let parsed: VerboseTranscription = block_on(async {
            let part = reqwest::multipart::Part::bytes(bytes)
                .file_name(file_name)
                .mime_str("audio/wav")
                .map_err(http_error)?;
            let mut form = reqwest::multipart::Form::new()
                .part("file", part)
                .text("model", self.model.clone())
                .text("response_format", "verbose_json");
            if let Some(lang) = &self.language {
                form = form.text("language", lang.clone());
            }
            self.client
                .post(&url)
                .multipart(form)
                .send()
                .await
                .and_then(reqwest::Response::error_for_status)
                .map_err(http_error)?
                .json::<VerboseTranscription>()
                .await
                .map_err(|e| StageError::InvalidOutput(e.to_string()))
        })??;

        let spans = into_spans(parsed);
        debug!(spans = spans.len(), "transcription finished");
        Ok(spans)
    }
}

fn into_spans(parsed: VerboseTranscription) -> Vec<TranscriptSpan> {
    if parsed.segments.is_empty() {
        let text = parsed.text.trim();
        if text.is_empty() {
            return Vec::new();
        }
        return vec![TranscriptSpan {
            start: 0.0,
            end: parsed.duration.unwrap_or(0.0),
            text: text.to_owned(),
            confidence: None,
        }];
    }
    parsed
        .segments
        .into_iter()
        .map(|s| TranscriptSpan {
            start: s.start,
            end: s.end,
            text: s.text.trim().to_owned(),
            confidence: s.avg_logprob.map(|lp| lp.exp().clamp(0.0, 1.0) as f32),
        })
        .collect()
}
