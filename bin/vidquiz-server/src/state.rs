//! Shared application state injected into every Axum handler.

use std::sync::Arc;

use vidquiz_core::archive::{ArtifactStore, DirectoryArchive};
use vidquiz_core::media::FfmpegToolkit;
use vidquiz_core::source::{HttpFetcher, RoutingFetcher, YtDlpFetcher};
use vidquiz_core::stages::remote::{
    OllamaFrameAnalyzer, OllamaQuizGenerator, OllamaSession, OllamaTitleGenerator,
    OpenAiTranscriber,
};
use vidquiz_core::{DurableStore, Orchestrator, PipelineDeps};

use crate::config::Config;
use crate::db::sqlite::SqliteStore;

/// State shared across all HTTP and WebSocket handlers.
#[derive(Clone, Debug)]
pub struct AppState {
    /// Server configuration (env-derived).
    pub config: Arc<Config>,
    /// Pipeline orchestrator; owns the in-memory task registry.
    pub orchestrator: Orchestrator,
    /// Durable task projection, read when a task has left memory.
    pub store: Arc<SqliteStore>,
}

/// Wire the remote stage clients, media tools and fetchers named by `cfg`.
///
/// Nothing here touches the network; clients connect on first use.
pub fn pipeline_deps(cfg: &Config, store: Arc<SqliteStore>) -> PipelineDeps {
    let max_bytes = cfg.pipeline.max_video_bytes();
    let download_timeout = cfg.pipeline.download_timeout;
    let ollama = |model: &str| OllamaSession::new(&cfg.ollama_url, model, cfg.inference_timeout);

    let mut transcriber =
        OpenAiTranscriber::new(&cfg.transcribe_url, &cfg.transcribe_model, cfg.inference_timeout);
    if let Some(language) = &cfg.transcribe_language {
        transcriber = transcriber.with_language(language);
    }

    PipelineDeps {
        transcriber: Arc::new(transcriber),
        frame_analyzer: Arc::new(OllamaFrameAnalyzer::new(ollama(&cfg.vision_model))),
        quiz_generator: Arc::new(OllamaQuizGenerator::new(
            ollama(&cfg.llm_model),
            cfg.quizzes_per_segment,
        )),
        title_generator: Arc::new(OllamaTitleGenerator::new(
            ollama(&cfg.llm_model),
            cfg.pipeline.title_max_chars,
        )),
        media: Arc::new(FfmpegToolkit::from_config(&cfg.pipeline)),
        fetcher: Arc::new(RoutingFetcher::new(
            Arc::new(HttpFetcher::new(max_bytes, download_timeout)),
            Arc::new(YtDlpFetcher::new(max_bytes, download_timeout)),
        )),
        store: store as Arc<dyn DurableStore>,
        archive: cfg
            .archive_dir
            .clone()
            .map(|dir| Arc::new(DirectoryArchive::new(dir)) as Arc<dyn ArtifactStore>),
    }
}

#[cfg(test)]
impl AppState {
    /// State over an in-memory database with scratch space under `dir`.
    pub async fn for_tests(dir: &std::path::Path) -> Arc<Self> {
        let mut config = Config::from_lookup(|_| None);
        config.database_url = "sqlite::memory:".to_owned();
        config.pipeline.temp_dir = dir.join("temp");

        let store = Arc::new(SqliteStore::connect(&config.database_url).await.unwrap());
        let orchestrator =
            Orchestrator::start(pipeline_deps(&config, Arc::clone(&store)), config.pipeline.clone());
        Arc::new(Self {
            config: Arc::new(config),
            orchestrator,
            store,
        })
    }
}
