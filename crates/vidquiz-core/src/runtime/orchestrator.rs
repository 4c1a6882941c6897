use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::archive::ArtifactStore;
use crate::config::PipelineConfig;
use crate::media::{self, MediaToolkit};
use crate::model::{FrameAnalysis, FrameRef, Quiz, Segment, TranscriptSpan, VideoMetadata};
use crate::runtime::events::{EventFanout, EventSink, SubscriberId, TaskEvent};
use crate::runtime::governor::ResourceGovernor;
use crate::runtime::storage::{ProgressView, TaskPatch, TaskRegistry, TaskSnapshot, TaskSource};
use crate::runtime::types::{PipelineError, ProcessingStage, RuntimeError, TaskId, TaskStatus};
use crate::source::{self, SourceError, SourceFetcher};
use crate::stages::{
    FrameAnalyzer, QuizGenerator, StageError, TitleGenerator, Transcriber, fallback,
};
use crate::store::{DurableStore, StoreError, StoredTask};

/// Collaborators a pipeline run calls out to.
#[derive(Clone)]
pub struct PipelineDeps {
    pub transcriber: Arc<dyn Transcriber>,
    pub frame_analyzer: Arc<dyn FrameAnalyzer>,
    pub quiz_generator: Arc<dyn QuizGenerator>,
    pub title_generator: Arc<dyn TitleGenerator>,
    pub media: Arc<dyn MediaToolkit>,
    pub fetcher: Arc<dyn SourceFetcher>,
    pub store: Arc<dyn DurableStore>,
    /// Where finished videos go. `None` keeps them on local disk.
    pub archive: Option<Arc<dyn ArtifactStore>>,
}

/// A request to process one video.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRequest {
    pub source: TaskSource,
    /// Language the quizzes are written in.
    pub language: String,
}

impl TaskRequest {
    pub fn upload(path: impl Into<PathBuf>, language: impl Into<String>) -> Self {
        Self {
            source: TaskSource::Upload { path: path.into() },
            language: language.into(),
        }
    }

    pub fn url(url: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            source: TaskSource::Url { url: url.into() },
            language: language.into(),
        }
    }
}

/// Outcome of [`Orchestrator::create`] and [`Orchestrator::submit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub task_id: TaskId,
    /// `true` when an existing task for the same URL and language was
    /// returned instead of creating a new one.
    pub reused: bool,
}

/// Commands sent to the orchestrator's dispatch loop.
#[derive(Debug)]
enum OrchestratorCommand {
    Run { task_id: TaskId },
}

type ActiveRuns = Arc<Mutex<HashSet<TaskId>>>;

/// The pipeline orchestrator.
///
/// Owns the task registry and event fan-out, accepts submissions into a
/// bounded queue, and drives each task through download, validation, audio,
/// transcription, frames, quizzes and title. At most `max_concurrent_tasks`
/// runs execute at once; model-bearing stages are further serialized by the
/// [`ResourceGovernor`].
///
/// ```rust,ignore
/// let orchestrator = Orchestrator::start(deps, PipelineConfig::default());
/// let submission = orchestrator.submit(TaskRequest::upload(path, "en")).await?;
/// ```
#[derive(Clone)]
pub struct Orchestrator {
    pipeline: Arc<Pipeline>,
    submit_tx: mpsc::Sender<OrchestratorCommand>,
    active: ActiveRuns,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("registry", &self.pipeline.registry)
            .field("governor", &self.pipeline.governor)
            .field("active_runs", &self.active_runs())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Start the orchestrator and spawn its dispatch loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(deps: PipelineDeps, config: PipelineConfig) -> Self {
        let governor = ResourceGovernor::new(config.hardware_profile);
        let (submit_tx, submit_rx) = mpsc::channel(config.queue_capacity.max(1));
        let workers = Arc::new(Semaphore::new(config.max_concurrent_tasks.max(1)));
        info!(
            profile = %config.hardware_profile,
            queue_capacity = config.queue_capacity,
            max_concurrent_tasks = config.max_concurrent_tasks,
            "orchestrator starting"
        );

        let pipeline = Arc::new(Pipeline {
            registry: TaskRegistry::new(),
            fanout: EventFanout::new(),
            governor,
            deps,
            config,
        });
        let active: ActiveRuns = Arc::default();

        tokio::spawn(Self::run_loop(
            submit_rx,
            Arc::clone(&pipeline),
            workers,
            Arc::clone(&active),
        ));

        Self {
            pipeline,
            submit_tx,
            active,
        }
    }

    async fn run_loop(
        mut rx: mpsc::Receiver<OrchestratorCommand>,
        pipeline: Arc<Pipeline>,
        workers: Arc<Semaphore>,
        active: ActiveRuns,
    ) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                OrchestratorCommand::Run { task_id } => {
                    let slot = RunSlot {
                        active: Arc::clone(&active),
                        task_id,
                    };
                    // Waiting here keeps the backlog in the bounded channel.
                    let Ok(permit) = Arc::clone(&workers).acquire_owned().await else {
                        break;
                    };
                    let pipeline = Arc::clone(&pipeline);
                    tokio::spawn(async move {
                        pipeline.execute(&slot.task_id).await;
                        drop(slot);
                        drop(permit);
                    });
                }
            }
        }
        debug!("orchestrator dispatch loop stopped");
    }

    // ─── Public API ───────────────────────────────────────────────────────────

    /// Create a task and queue it for execution.
    ///
    /// Returns as soon as the task is queued. A reused URL task is returned
    /// as-is without being queued again. When the queue is full the new task
    /// is marked failed and [`RuntimeError::QueueFull`] is returned.
    pub async fn submit(&self, request: TaskRequest) -> Result<Submission, RuntimeError> {
        let submission = self.create(request).await;
        if submission.reused {
            return Ok(submission);
        }
        let task_id = &submission.task_id;
        // Malformed URLs fail at creation and are never queued.
        if self.pipeline.registry.status(task_id).await != Some(TaskStatus::Pending) {
            return Ok(submission);
        }
        if let Err(e) = self.start_task(task_id).await {
            self.pipeline.fail(task_id, &e.to_string()).await;
            return Err(e);
        }
        Ok(submission)
    }

    /// Register a `Pending` task without starting it.
    ///
    /// URL sources are normalized first and deduplicated on
    /// `(url, language)`. A URL that does not parse still gets a task, which
    /// is failed immediately with the validation message.
    pub async fn create(&self, request: TaskRequest) -> Submission {
        let TaskRequest { source, language } = request;
        let registry = &self.pipeline.registry;

        let (task_id, reused, rejected) = match source {
            TaskSource::Url { url } => match source::normalize_url(&url) {
                Ok(normalized) => {
                    let (task_id, reused) = registry.create_or_reuse(&normalized, &language).await;
                    (task_id, reused, None)
                }
                Err(e) => {
                    let task_id = registry.create(TaskSource::Url { url }, &language).await;
                    (task_id, false, Some(e))
                }
            },
            upload => (registry.create(upload, &language).await, false, None),
        };

        if reused {
            info!(task_id = %task_id, language = %language, "reusing task for identical source");
            return Submission { task_id, reused };
        }

        if let Some(snapshot) = registry.get(&task_id).await {
            self.pipeline
                .persist(
                    &task_id,
                    "create",
                    self.pipeline.deps.store.persist_created(&snapshot),
                )
                .await;
        }
        info!(task_id = %task_id, language = %language, "task created");

        if let Some(e) = rejected {
            self.pipeline
                .fail(&task_id, &PipelineError::from(e).to_string())
                .await;
        }
        Submission {
            task_id,
            reused: false,
        }
    }

    /// Queue a `Pending` task for execution.
    ///
    /// A task that already has a queued or active run is refused with
    /// [`RuntimeError::AlreadyRunning`], so one identifier never has two runs.
    pub async fn start_task(&self, task_id: &str) -> Result<(), RuntimeError> {
        let status = self.pipeline.registry.status(task_id).await.ok_or_else(|| {
            RuntimeError::TaskNotFound {
                task_id: task_id.to_owned(),
            }
        })?;
        if status.is_in_progress() {
            return Err(RuntimeError::AlreadyRunning {
                task_id: task_id.to_owned(),
            });
        }
        if status != TaskStatus::Pending {
            return Err(RuntimeError::NotPending {
                task_id: task_id.to_owned(),
                status,
            });
        }
        if !self.claim(task_id) {
            return Err(RuntimeError::AlreadyRunning {
                task_id: task_id.to_owned(),
            });
        }

        self.submit_tx
            .try_send(OrchestratorCommand::Run {
                task_id: task_id.to_owned(),
            })
            .map_err(|e| {
                self.release(task_id);
                match e {
                    mpsc::error::TrySendError::Full(_) => RuntimeError::QueueFull,
                    mpsc::error::TrySendError::Closed(_) => RuntimeError::Shutdown,
                }
            })?;
        debug!(task_id, "task queued");
        Ok(())
    }

    /// Current snapshot of a task held in memory.
    pub async fn status(&self, task_id: &str) -> Option<TaskSnapshot> {
        self.pipeline.registry.get(task_id).await
    }

    /// Segments of a completed task; `None` for any other state.
    pub async fn segments(&self, task_id: &str) -> Option<Vec<Segment>> {
        self.pipeline
            .registry
            .get(task_id)
            .await
            .filter(|t| t.status == TaskStatus::Completed)
            .and_then(|t| t.segments)
    }

    /// Remove a task, its subscribers and its local files.
    ///
    /// An in-flight run is not interrupted; it stops at its next stage
    /// boundary once it notices the task is gone.
    pub async fn delete(&self, task_id: &str) -> bool {
        let Some(task) = self.pipeline.registry.remove(task_id).await else {
            return false;
        };
        self.pipeline.fanout.drop_task(task_id);
        let mut paths = task.scratch_paths();
        paths.push(self.pipeline.config.task_dir(task_id));
        media::remove_paths(&paths).await;
        info!(task_id, status = %task.status, "task deleted");
        true
    }

    /// Attach a live subscriber.
    ///
    /// The sink is greeted with `connected`. If the task already finished,
    /// its terminal event follows right away so late subscribers are not left
    /// waiting; a subscriber racing the finish may see it twice. Tasks swept
    /// from memory get their terminal event from the durable store.
    pub async fn subscribe(&self, task_id: &str, sink: Arc<dyn EventSink>) -> SubscriberId {
        let id = self.pipeline.fanout.subscribe(task_id, Arc::clone(&sink));
        let terminal = match self.pipeline.registry.get(task_id).await {
            Some(task) => terminal_event(&task),
            None => self.stored_terminal_event(task_id).await,
        };
        if let Some(event) = terminal {
            let _ = sink.send(&event);
        }
        id
    }

    /// Terminal event of a task that only the durable store still holds.
    async fn stored_terminal_event(&self, task_id: &str) -> Option<TaskEvent> {
        let limit = self.pipeline.config.store_timeout;
        let loaded = tokio::time::timeout(limit, self.pipeline.deps.store.load_task(task_id))
            .await
            .unwrap_or(Err(StoreError::Timeout));
        match loaded {
            Ok(stored) => stored.as_ref().and_then(row_terminal_event),
            Err(e) => {
                warn!(task_id, error = %e, "durable store read failed");
                None
            }
        }
    }

    pub fn unsubscribe(&self, task_id: &str, subscriber: SubscriberId) {
        self.pipeline.fanout.unsubscribe(task_id, subscriber);
    }

    /// Evict terminal tasks older than `max_age` and delete their files.
    /// Returns how many were removed.
    pub async fn sweep(&self, max_age: Duration) -> usize {
        let removed = self.pipeline.registry.sweep(max_age).await;
        for task in &removed {
            self.pipeline.fanout.drop_task(&task.task_id);
            media::remove_paths(&task.scratch_paths()).await;
        }
        if !removed.is_empty() {
            info!(count = removed.len(), "swept expired tasks");
        }
        removed.len()
    }

    /// Run [`sweep`](Self::sweep) every `interval` until the handle is
    /// aborted.
    pub fn spawn_reaper(&self, interval: Duration, max_age: Duration) -> JoinHandle<()> {
        let this = self.clone();
        let interval = interval.max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                this.sweep(max_age).await;
            }
        })
    }

    /// Load every stage model up front when the hardware profile keeps
    /// models resident. A no-op under the constrained profile.
    pub async fn preload_models(&self) -> Result<(), StageError> {
        let governor = &self.pipeline.governor;
        let deps = &self.pipeline.deps;
        governor.preload(Arc::clone(&deps.transcriber)).await?;
        governor.preload(Arc::clone(&deps.frame_analyzer)).await?;
        governor.preload(Arc::clone(&deps.quiz_generator)).await?;
        governor.preload(Arc::clone(&deps.title_generator)).await?;
        Ok(())
    }

    /// Number of tasks queued or running.
    pub fn active_runs(&self) -> usize {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.pipeline.config
    }

    pub fn governor(&self) -> &ResourceGovernor {
        &self.pipeline.governor
    }

    fn claim(&self, task_id: &str) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task_id.to_owned())
    }

    fn release(&self, task_id: &str) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(task_id);
    }
}

/// Marks a task as having a run until the run ends, even by panic.
struct RunSlot {
    active: ActiveRuns,
    task_id: TaskId,
}

impl Drop for RunSlot {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.task_id);
    }
}

fn terminal_event(task: &TaskSnapshot) -> Option<TaskEvent> {
    match task.status {
        TaskStatus::Completed => Some(TaskEvent::Completed {
            task_id: task.task_id.clone(),
            total_segments: task.segments.as_ref().map_or(0, Vec::len),
            title: task.title.clone().unwrap_or_default(),
            message: COMPLETED_MESSAGE.to_owned(),
        }),
        TaskStatus::Failed => Some(TaskEvent::Error {
            task_id: task.task_id.clone(),
            error: task.error.clone().unwrap_or_default(),
        }),
        _ => None,
    }
}

fn row_terminal_event(task: &StoredTask) -> Option<TaskEvent> {
    match task.status {
        TaskStatus::Completed => Some(TaskEvent::Completed {
            task_id: task.task_id.clone(),
            total_segments: task.segments.as_ref().map_or(0, Vec::len),
            title: task.title.clone().unwrap_or_default(),
            message: COMPLETED_MESSAGE.to_owned(),
        }),
        TaskStatus::Failed => Some(TaskEvent::Error {
            task_id: task.task_id.clone(),
            error: task.error.clone().unwrap_or_default(),
        }),
        _ => None,
    }
}

const COMPLETED_MESSAGE: &str = "Processing complete";

// ─── Pipeline run ─────────────────────────────────────────────────────────────

struct Pipeline {
    registry: TaskRegistry,
    fanout: EventFanout,
    governor: ResourceGovernor,
    deps: PipelineDeps,
    config: PipelineConfig,
}

/// Local files a run has created or taken over.
#[derive(Debug)]
struct Scratch {
    work_dir: PathBuf,
    video: Option<PathBuf>,
    audio: Option<PathBuf>,
    frames_dir: Option<PathBuf>,
}

impl Scratch {
    fn all(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self
            .video
            .iter()
            .chain(self.audio.iter())
            .chain(self.frames_dir.iter())
            .cloned()
            .collect();
        paths.push(self.work_dir.clone());
        paths
    }
}

struct Finished {
    segments: Vec<Segment>,
    title: String,
    metadata: VideoMetadata,
}

struct BatchOutcome {
    analyses: Vec<FrameAnalysis>,
    failed: usize,
    last_error: Option<StageError>,
}

impl Pipeline {
    async fn execute(&self, task_id: &str) {
        let Some(task) = self.registry.get(task_id).await else {
            debug!(task_id, "task removed before its run started");
            return;
        };
        info!(task_id, language = %task.language, "task started");

        let mut scratch = Scratch {
            work_dir: self.config.task_dir(task_id),
            video: None,
            audio: None,
            frames_dir: None,
        };
        match self.run(&task, &mut scratch).await {
            Ok(done) => self.finish(task_id, done, &scratch).await,
            Err(PipelineError::Deleted) => {
                info!(task_id, "task removed mid-run, stopping");
                media::remove_paths(&scratch.all()).await;
            }
            Err(e) => {
                self.fail(task_id, &e.to_string()).await;
                media::remove_paths(&scratch.all()).await;
            }
        }
    }

    async fn run(
        &self,
        task: &TaskSnapshot,
        scratch: &mut Scratch,
    ) -> Result<Finished, PipelineError> {
        let task_id = task.task_id.as_str();
        let cfg = &self.config;

        // 1. resolve the input to a local file
        let video = match &task.source {
            TaskSource::Url { url } => {
                self.advance(
                    task_id,
                    TaskPatch::stage(ProcessingStage::Download, 0.0)
                        .with_work_dir(scratch.work_dir.clone()),
                    "Downloading video",
                )
                .await?;
                tokio::fs::create_dir_all(&scratch.work_dir)
                    .await
                    .map_err(SourceError::from)?;
                let path = tokio::time::timeout(
                    cfg.download_timeout,
                    self.deps.fetcher.download(url, &scratch.work_dir),
                )
                .await
                .map_err(|_| SourceError::Timeout(cfg.download_timeout))??;
                scratch.video = Some(path.clone());
                self.persist(
                    task_id,
                    "video location",
                    self.deps
                        .store
                        .persist_video_location(task_id, &path.to_string_lossy()),
                )
                .await;
                path
            }
            TaskSource::Upload { path } => {
                scratch.video = Some(path.clone());
                tokio::fs::create_dir_all(&scratch.work_dir)
                    .await
                    .map_err(|e| PipelineError::media(ProcessingStage::Validation, e.into()))?;
                path.clone()
            }
        };

        // 2. validate
        self.advance(
            task_id,
            TaskPatch::stage(ProcessingStage::Validation, 5.0)
                .with_video_path(video.clone())
                .with_work_dir(scratch.work_dir.clone()),
            "Validating video",
        )
        .await?;
        let size = media::validate_file(&video, cfg).await?;

        // 3. probe
        self.advance(
            task_id,
            TaskPatch::stage(ProcessingStage::MetadataProbe, 10.0),
            "Reading video metadata",
        )
        .await?;
        let probe = self
            .deps
            .media
            .probe(&video)
            .await
            .map_err(|e| PipelineError::media(ProcessingStage::MetadataProbe, e))?;
        media::validate_probe(&probe, cfg)?;
        let mut metadata = probe.metadata;
        if metadata.size_bytes == 0 {
            metadata.size_bytes = size;
        }
        info!(
            task_id,
            duration = metadata.duration,
            width = metadata.width,
            height = metadata.height,
            "video probed"
        );

        // 4. audio
        self.advance(
            task_id,
            TaskPatch::stage(ProcessingStage::AudioExtraction, 15.0)
                .with_metadata(metadata.clone()),
            "Extracting audio",
        )
        .await?;
        let audio_out = scratch.work_dir.join("audio.wav");
        scratch.audio = Some(audio_out.clone());
        let audio = self
            .deps
            .media
            .extract_audio(&video, &audio_out)
            .await
            .map_err(|e| PipelineError::media(ProcessingStage::AudioExtraction, e))?;
        scratch.audio = Some(audio.clone());

        // 5. transcribe
        self.advance(
            task_id,
            TaskPatch::stage(ProcessingStage::Transcription, 25.0).with_audio_path(audio.clone()),
            "Transcribing audio",
        )
        .await?;
        let transcript = self
            .governor
            .guard(Arc::clone(&self.deps.transcriber), move |t| {
                t.transcribe(&audio)
            })
            .await
            .map_err(|e| PipelineError::stage(ProcessingStage::Transcription, e))?;
        info!(task_id, spans = transcript.len(), "transcription finished");
        self.advance(
            task_id,
            TaskPatch::stage(ProcessingStage::Transcription, 50.0)
                .with_transcription(transcript.clone()),
            "Transcription complete",
        )
        .await?;

        // 6. frames
        self.advance(
            task_id,
            TaskPatch::stage(ProcessingStage::FrameExtraction, 50.0),
            "Extracting frames",
        )
        .await?;
        let frames_dir = scratch.work_dir.join("frames");
        scratch.frames_dir = Some(frames_dir.clone());
        let frames = self
            .deps
            .media
            .extract_frames(&video, &frames_dir, &metadata)
            .await
            .map_err(|e| PipelineError::media(ProcessingStage::FrameExtraction, e))?;

        // 7. analyze frames
        self.advance(
            task_id,
            TaskPatch::stage(ProcessingStage::FrameAnalysis, 55.0),
            &format!("Analyzing {} frames", frames.len()),
        )
        .await?;
        let analyses = self.analyze_frames(task_id, frames).await?;
        self.advance(
            task_id,
            TaskPatch::stage(ProcessingStage::FrameAnalysis, 70.0)
                .with_frame_analyses(analyses.clone()),
            "Frame analysis complete",
        )
        .await?;

        // 8. segments and quizzes
        self.advance(
            task_id,
            TaskPatch::stage(ProcessingStage::Segmentation, 70.0),
            "Generating segments and quizzes",
        )
        .await?;
        let segments = self
            .build_segments(
                task_id,
                &task.language,
                transcript.clone(),
                analyses.clone(),
                metadata.duration,
            )
            .await?;
        self.advance(
            task_id,
            TaskPatch::stage(ProcessingStage::QuizGeneration, 90.0),
            &format!("Generated quizzes for {} segments", segments.len()),
        )
        .await?;

        // 9. title
        self.advance(
            task_id,
            TaskPatch::stage(ProcessingStage::TitleGeneration, 95.0),
            "Generating title",
        )
        .await?;
        let title = self
            .generate_title(task_id, transcript, analyses, metadata.duration)
            .await;

        // 10. finalize
        self.advance(
            task_id,
            TaskPatch::stage(ProcessingStage::Finalization, 98.0),
            "Saving results",
        )
        .await?;
        Ok(Finished {
            segments,
            title,
            metadata,
        })
    }

    /// Caption frames batch by batch under one governed load. A failing
    /// batch is skipped; the stage only fails when every batch failed.
    async fn analyze_frames(
        &self,
        task_id: &str,
        frames: Vec<FrameRef>,
    ) -> Result<Vec<FrameAnalysis>, PipelineError> {
        if frames.is_empty() {
            warn!(task_id, "no frames extracted, continuing without visual context");
            return Ok(Vec::new());
        }
        let batch_size = self.config.batch_size();
        let id = task_id.to_owned();

        let outcome = self
            .governor
            .guard(Arc::clone(&self.deps.frame_analyzer), move |analyzer| {
                let mut outcome = BatchOutcome {
                    analyses: Vec::with_capacity(frames.len()),
                    failed: 0,
                    last_error: None,
                };
                for (index, batch) in frames.chunks(batch_size).enumerate() {
                    match analyzer.analyze(batch) {
                        Ok(mut out) => outcome.analyses.append(&mut out),
                        Err(e) => {
                            warn!(task_id = %id, batch = index, error = %e, "frame batch failed, skipping");
                            outcome.failed += 1;
                            outcome.last_error = Some(e);
                        }
                    }
                }
                Ok(outcome)
            })
            .await
            .map_err(|e| PipelineError::stage(ProcessingStage::FrameAnalysis, e))?;

        let BatchOutcome {
            mut analyses,
            failed,
            last_error,
        } = outcome;
        match last_error {
            Some(e) if analyses.is_empty() => {
                return Err(PipelineError::stage(ProcessingStage::FrameAnalysis, e));
            }
            _ => {}
        }
        if failed > 0 {
            warn!(task_id, failed, kept = analyses.len(), "frame analysis partially failed");
        }
        analyses.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
        Ok(analyses)
    }

    /// Propose segments and fill each with quizzes under one governed load.
    ///
    /// Proposal failure falls back to time-based segments; a segment whose
    /// quizzes fail gets the fallback quiz. Each finished segment is
    /// published as `segment_ready` straight away.
    async fn build_segments(
        &self,
        task_id: &str,
        language: &str,
        transcript: Vec<TranscriptSpan>,
        frames: Vec<FrameAnalysis>,
        duration: f64,
    ) -> Result<Vec<Segment>, PipelineError> {
        let fanout = self.fanout.clone();
        let id = task_id.to_owned();
        let language = language.to_owned();

        self.governor
            .guard(Arc::clone(&self.deps.quiz_generator), move |generator| {
                let proposals = match generator.propose_segments(&transcript, &frames, duration) {
                    Ok(proposals) => {
                        let usable: Vec<_> = proposals
                            .into_iter()
                            .filter(|p| p.end_time > p.start_time)
                            .collect();
                        if usable.is_empty() {
                            warn!(task_id = %id, "no usable segments proposed, using time-based segments");
                            fallback::fallback_segments(duration, &transcript)
                        } else {
                            usable
                        }
                    }
                    Err(e) => {
                        warn!(task_id = %id, error = %e, "segmentation failed, using time-based segments");
                        fallback::fallback_segments(duration, &transcript)
                    }
                };

                let mut segments = Vec::with_capacity(proposals.len());
                for (index, proposal) in proposals.into_iter().enumerate() {
                    let quizzes =
                        match generator.generate_quizzes(&proposal, &transcript, &frames, &language) {
                            Ok(quizzes) => keep_valid(quizzes, &id, index),
                            Err(e) => {
                                warn!(task_id = %id, segment = index, error = %e, "quiz generation failed, using fallback quiz");
                                Vec::new()
                            }
                        };
                    let quizzes = if quizzes.is_empty() {
                        vec![fallback::fallback_quiz(&proposal.title, &language)]
                    } else {
                        quizzes
                    };

                    let segment = proposal.into_segment(quizzes);
                    fanout.publish(
                        &id,
                        TaskEvent::SegmentReady {
                            task_id: id.clone(),
                            index,
                            segment: segment.clone(),
                        },
                    );
                    segments.push(segment);
                }
                Ok(segments)
            })
            .await
            .map_err(|e| PipelineError::stage(ProcessingStage::QuizGeneration, e))
    }

    /// Never fails: any problem falls back to the leading transcript words.
    async fn generate_title(
        &self,
        task_id: &str,
        transcript: Vec<TranscriptSpan>,
        frames: Vec<FrameAnalysis>,
        duration: f64,
    ) -> String {
        let words = self.config.title_fallback_words;
        let max_chars = self.config.title_max_chars;
        let fallback_title = fallback::fallback_title(&transcript, words, max_chars);

        let generated = self
            .governor
            .guard(Arc::clone(&self.deps.title_generator), move |generator| {
                generator.generate_title(&transcript, &frames, duration)
            })
            .await;
        match generated.map(|t| fallback::clean_title(&t, max_chars)) {
            Ok(Some(title)) => title,
            Ok(None) => {
                warn!(task_id, "generated title was empty, using transcript words");
                fallback_title
            }
            Err(e) => {
                warn!(task_id, error = %e, "title generation failed, using transcript words");
                fallback_title
            }
        }
    }

    async fn finish(&self, task_id: &str, done: Finished, scratch: &Scratch) {
        let Finished {
            segments,
            title,
            metadata,
        } = done;
        let total = segments.len();

        let Some(view) = self
            .registry
            .update(task_id, TaskPatch::completed(segments.clone(), title.clone()))
            .await
        else {
            info!(task_id, "task removed before completion was recorded");
            media::remove_paths(&scratch.all()).await;
            return;
        };

        let store = &self.deps.store;
        self.persist(
            task_id,
            "status",
            store.persist_status(task_id, view.status, view.progress, None, None),
        )
        .await;
        self.persist(
            task_id,
            "results",
            store.persist_results(task_id, &segments, &metadata, &title),
        )
        .await;
        self.fanout.publish(
            task_id,
            TaskEvent::Completed {
                task_id: task_id.to_owned(),
                total_segments: total,
                title: title.clone(),
                message: COMPLETED_MESSAGE.to_owned(),
            },
        );
        info!(task_id, segments = total, title = %title, "task completed");

        self.archive_and_clean(task_id, scratch).await;
    }

    /// Upload the video if an archive is configured, then drop scratch files.
    /// The local video is only deleted once the archive holds a copy.
    async fn archive_and_clean(&self, task_id: &str, scratch: &Scratch) {
        let mut doomed: Vec<PathBuf> = scratch
            .audio
            .iter()
            .chain(scratch.frames_dir.iter())
            .cloned()
            .collect();

        let archived = match (&self.deps.archive, &scratch.video) {
            (Some(archive), Some(video)) => match archive.upload_video(task_id, video).await {
                Ok(key) => {
                    info!(task_id, key = %key, "video archived");
                    self.persist(
                        task_id,
                        "video location",
                        self.deps.store.persist_video_location(task_id, &key),
                    )
                    .await;
                    true
                }
                Err(e) => {
                    warn!(task_id, error = %e, "video archive failed, keeping local copy");
                    false
                }
            },
            _ => false,
        };

        if archived {
            doomed.extend(scratch.video.clone());
            doomed.push(scratch.work_dir.clone());
        } else if scratch
            .video
            .as_ref()
            .is_none_or(|v| !v.starts_with(&scratch.work_dir))
        {
            doomed.push(scratch.work_dir.clone());
        }
        media::remove_paths(&doomed).await;
    }

    /// Record a failure. A task that is already gone or terminal is left
    /// alone.
    async fn fail(&self, task_id: &str, message: &str) {
        error!(task_id, error = %message, "task failed");
        let Some(view) = self
            .registry
            .update(task_id, TaskPatch::failed(message))
            .await
        else {
            return;
        };
        self.persist(
            task_id,
            "status",
            self.deps.store.persist_status(
                task_id,
                view.status,
                view.progress,
                None,
                Some(message),
            ),
        )
        .await;
        self.fanout.publish(
            task_id,
            TaskEvent::Error {
                task_id: task_id.to_owned(),
                error: message.to_owned(),
            },
        );
    }

    /// Apply one transition: registry first, then the durable projection,
    /// then live subscribers.
    async fn advance(
        &self,
        task_id: &str,
        patch: TaskPatch,
        message: &str,
    ) -> Result<ProgressView, PipelineError> {
        let view = self
            .registry
            .update(task_id, patch)
            .await
            .ok_or(PipelineError::Deleted)?;
        info!(
            task_id,
            status = %view.status,
            progress = view.progress,
            stage = ?view.current_stage,
            "{message}"
        );

        self.persist(
            task_id,
            "status",
            self.deps.store.persist_status(
                task_id,
                view.status,
                view.progress,
                view.current_stage,
                None,
            ),
        )
        .await;
        self.fanout.publish(
            task_id,
            TaskEvent::Progress {
                task_id: task_id.to_owned(),
                status: view.status,
                progress: view.progress,
                current_stage: view.current_stage,
                message: message.to_owned(),
            },
        );
        Ok(view)
    }

    /// Await a store write with a deadline. Failures are logged only.
    async fn persist<F>(&self, task_id: &str, what: &'static str, write: F)
    where
        F: Future<Output = Result<(), StoreError>>,
    {
        match tokio::time::timeout(self.config.store_timeout, write).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(task_id, what, error = %e, "durable store write failed"),
            Err(_) => warn!(task_id, what, "durable store write timed out"),
        }
    }
}

/// Drop quizzes that break their own invariants.
fn keep_valid(quizzes: Vec<Quiz>, task_id: &str, segment: usize) -> Vec<Quiz> {
    quizzes
        .into_iter()
        .filter(|q| match q.validate() {
            Ok(()) => true,
            Err(reason) => {
                warn!(task_id, segment, reason = %reason, "discarding invalid quiz");
                false
            }
        })
        .collect()
}
