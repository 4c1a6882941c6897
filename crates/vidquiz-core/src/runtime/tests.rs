#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::mpsc;
    use tracing_test::traced_test;

    use crate::archive::{ArtifactStore, DirectoryArchive};
    use crate::config::PipelineConfig;
    use crate::media::{MediaError, MediaProbe, MediaToolkit};
    use crate::model::{
        FrameAnalysis, FrameRef, Quiz, QuizKind, Segment, SegmentProposal, TranscriptSpan,
        VideoMetadata,
    };
    use crate::runtime::events::TaskEvent;
    use crate::runtime::governor::HardwareProfile;
    use crate::runtime::orchestrator::{Orchestrator, PipelineDeps, TaskRequest};
    use crate::runtime::storage::TaskSnapshot;
    use crate::runtime::types::{ProcessingStage, RuntimeError, TaskId, TaskStatus};
    use crate::source::{SourceError, SourceFetcher};
    use crate::stages::{
        FrameAnalyzer, ModelStage, QuizGenerator, StageError, TitleGenerator, Transcriber,
    };
    use crate::store::{DurableStore, StoreError, StoredTask};

    // ── Mock stages ───────────────────────────────────────────────────────────

    #[derive(Default)]
    struct ModelState {
        loaded: AtomicBool,
        loads: AtomicUsize,
    }

    macro_rules! mock_model {
        ($ty:ty, $name:literal) => {
            impl ModelStage for $ty {
                fn name(&self) -> &str {
                    $name
                }
                fn load(&self) -> Result<(), StageError> {
                    self.model.loads.fetch_add(1, Ordering::SeqCst);
                    self.model.loaded.store(true, Ordering::SeqCst);
                    Ok(())
                }
                fn unload(&self) -> Result<(), StageError> {
                    self.model.loaded.store(false, Ordering::SeqCst);
                    Ok(())
                }
                fn is_loaded(&self) -> bool {
                    self.model.loaded.load(Ordering::SeqCst)
                }
            }
        };
    }

    enum Speech {
        Spans,
        Timeout,
        Slow(Duration),
        /// Works for a while, then gives up with a timeout.
        Stall(Duration),
    }

    struct MockTranscriber {
        model: ModelState,
        speech: Speech,
    }

    impl MockTranscriber {
        fn new(speech: Speech) -> Self {
            Self {
                model: ModelState::default(),
                speech,
            }
        }
    }

    mock_model!(MockTranscriber, "mock-transcriber");

    fn two_spans() -> Vec<TranscriptSpan> {
        vec![
            TranscriptSpan {
                start: 0.0,
                end: 18.0,
                text: "Welcome to the Rust ownership tour.".into(),
                confidence: Some(0.9),
            },
            TranscriptSpan {
                start: 18.0,
                end: 40.0,
                text: "Borrowing lets you share data safely.".into(),
                confidence: None,
            },
        ]
    }

    impl Transcriber for MockTranscriber {
        fn transcribe(&self, _audio: &Path) -> Result<Vec<TranscriptSpan>, StageError> {
            match self.speech {
                Speech::Spans => Ok(two_spans()),
                Speech::Timeout => Err(StageError::Timeout(Duration::from_secs(600))),
                Speech::Slow(delay) => {
                    std::thread::sleep(delay);
                    Ok(two_spans())
                }
                Speech::Stall(delay) => {
                    std::thread::sleep(delay);
                    Err(StageError::Timeout(delay))
                }
            }
        }
    }

    #[derive(Default)]
    struct MockAnalyzer {
        model: ModelState,
        fail_at: Option<f64>,
        fail_all: bool,
    }

    mock_model!(MockAnalyzer, "mock-vision");

    impl FrameAnalyzer for MockAnalyzer {
        fn analyze(&self, frames: &[FrameRef]) -> Result<Vec<FrameAnalysis>, StageError> {
            if self.fail_all || frames.iter().any(|f| Some(f.timestamp) == self.fail_at) {
                return Err(StageError::Inference("vision backend crashed".into()));
            }
            Ok(frames
                .iter()
                .map(|f| FrameAnalysis::from_description(f.timestamp, format!("Slide at {}s", f.timestamp)))
                .collect())
        }
    }

    #[derive(Default)]
    struct MockQuizGenerator {
        model: ModelState,
        fail_proposals: bool,
        fail_quizzes: bool,
    }

    mock_model!(MockQuizGenerator, "mock-quiz");

    impl QuizGenerator for MockQuizGenerator {
        fn propose_segments(
            &self,
            _transcript: &[TranscriptSpan],
            _frames: &[FrameAnalysis],
            duration: f64,
        ) -> Result<Vec<SegmentProposal>, StageError> {
            if self.fail_proposals {
                return Err(StageError::InvalidOutput("not json".into()));
            }
            Ok(vec![SegmentProposal {
                start_time: 0.0,
                end_time: duration,
                title: "Ownership basics".into(),
                summary: "Moves and borrows.".into(),
                keywords: vec!["ownership".into()],
            }])
        }

        fn generate_quizzes(
            &self,
            _segment: &SegmentProposal,
            _transcript: &[TranscriptSpan],
            _frames: &[FrameAnalysis],
            language: &str,
        ) -> Result<Vec<Quiz>, StageError> {
            if self.fail_quizzes {
                return Err(StageError::Inference("llm went away".into()));
            }
            Ok(vec![
                Quiz::multiple_choice(
                    language,
                    "What does a move do?",
                    vec![
                        "Copies the value".into(),
                        "Transfers ownership".into(),
                        "Frees memory".into(),
                        "Nothing".into(),
                    ],
                    1,
                ),
                Quiz::short_answer(language, "Name the Rust mascot.", vec!["Ferris".into()], false),
            ])
        }
    }

    #[derive(Default)]
    struct MockTitleGenerator {
        model: ModelState,
        fail: bool,
    }

    mock_model!(MockTitleGenerator, "mock-title");

    impl TitleGenerator for MockTitleGenerator {
        fn generate_title(
            &self,
            _transcript: &[TranscriptSpan],
            _frames: &[FrameAnalysis],
            _duration: f64,
        ) -> Result<String, StageError> {
            if self.fail {
                return Err(StageError::Unavailable("no title model".into()));
            }
            Ok("\"Rust Ownership Explained\"".into())
        }
    }

    // ── Mock collaborators ────────────────────────────────────────────────────

    struct MockMedia;

    #[async_trait]
    impl MediaToolkit for MockMedia {
        async fn probe(&self, _video: &Path) -> Result<MediaProbe, MediaError> {
            Ok(MediaProbe {
                metadata: VideoMetadata {
                    duration: 40.0,
                    fps: 30.0,
                    width: 1280,
                    height: 720,
                    size_bytes: 0,
                },
                has_video: true,
                has_audio: true,
            })
        }

        async fn extract_audio(&self, _video: &Path, output: &Path) -> Result<PathBuf, MediaError> {
            tokio::fs::write(output, b"RIFF").await?;
            Ok(output.to_path_buf())
        }

        async fn extract_frames(
            &self,
            _video: &Path,
            out_dir: &Path,
            _metadata: &VideoMetadata,
        ) -> Result<Vec<FrameRef>, MediaError> {
            tokio::fs::create_dir_all(out_dir).await?;
            let mut frames = Vec::new();
            for (i, ts) in [0.0, 10.0, 20.0].into_iter().enumerate() {
                let path = out_dir.join(format!("frame_{:05}.jpg", i + 1));
                tokio::fs::write(&path, b"jpeg").await?;
                frames.push(FrameRef {
                    timestamp: ts,
                    path,
                });
            }
            Ok(frames)
        }
    }

    struct MockFetcher;

    #[async_trait]
    impl SourceFetcher for MockFetcher {
        async fn download(&self, _url: &str, dest_dir: &Path) -> Result<PathBuf, SourceError> {
            let path = dest_dir.join("source.mp4");
            tokio::fs::write(&path, vec![7u8; 4096]).await?;
            Ok(path)
        }
    }

    #[derive(Default)]
    struct RecordingStore {
        created: Mutex<Vec<TaskId>>,
        statuses: Mutex<Vec<(TaskId, TaskStatus, f64)>>,
        results: Mutex<Vec<(TaskId, usize, String)>>,
        locations: Mutex<Vec<(TaskId, String)>>,
        /// Rows served by `load_task`.
        rows: Mutex<Vec<StoredTask>>,
        broken: bool,
    }

    impl RecordingStore {
        fn check(&self) -> Result<(), StoreError> {
            if self.broken {
                return Err(StoreError::Backend("disk full".into()));
            }
            Ok(())
        }

        fn progress_of(&self, task_id: &str) -> Vec<f64> {
            self.statuses
                .lock()
                .unwrap()
                .iter()
                .filter(|(id, _, _)| id == task_id)
                .map(|(_, _, p)| *p)
                .collect()
        }

        fn statuses_of(&self, task_id: &str) -> Vec<TaskStatus> {
            self.statuses
                .lock()
                .unwrap()
                .iter()
                .filter(|(id, _, _)| id == task_id)
                .map(|(_, s, _)| *s)
                .collect()
        }
    }

    #[async_trait]
    impl DurableStore for RecordingStore {
        async fn persist_created(&self, task: &TaskSnapshot) -> Result<(), StoreError> {
            self.check()?;
            self.created.lock().unwrap().push(task.task_id.clone());
            Ok(())
        }

        async fn persist_status(
            &self,
            task_id: &str,
            status: TaskStatus,
            progress: f64,
            _stage: Option<ProcessingStage>,
            _error: Option<&str>,
        ) -> Result<(), StoreError> {
            self.check()?;
            self.statuses
                .lock()
                .unwrap()
                .push((task_id.to_owned(), status, progress));
            Ok(())
        }

        async fn persist_video_location(
            &self,
            task_id: &str,
            location: &str,
        ) -> Result<(), StoreError> {
            self.check()?;
            self.locations
                .lock()
                .unwrap()
                .push((task_id.to_owned(), location.to_owned()));
            Ok(())
        }

        async fn persist_results(
            &self,
            task_id: &str,
            segments: &[Segment],
            _metadata: &VideoMetadata,
            title: &str,
        ) -> Result<(), StoreError> {
            self.check()?;
            self.results
                .lock()
                .unwrap()
                .push((task_id.to_owned(), segments.len(), title.to_owned()));
            Ok(())
        }

        async fn load_task(&self, task_id: &str) -> Result<Option<StoredTask>, StoreError> {
            self.check()?;
            Ok(self
                .rows
                .lock()
                .unwrap()
                .iter()
                .find(|row| row.task_id == task_id)
                .cloned())
        }
    }

    // ── Harness ───────────────────────────────────────────────────────────────

    struct Mocks {
        transcriber: Arc<MockTranscriber>,
        analyzer: Arc<MockAnalyzer>,
        quizzes: Arc<MockQuizGenerator>,
        titles: Arc<MockTitleGenerator>,
        store: Arc<RecordingStore>,
        archive: Option<Arc<dyn ArtifactStore>>,
    }

    impl Mocks {
        fn new() -> Self {
            Self {
                transcriber: Arc::new(MockTranscriber::new(Speech::Spans)),
                analyzer: Arc::new(MockAnalyzer::default()),
                quizzes: Arc::new(MockQuizGenerator::default()),
                titles: Arc::new(MockTitleGenerator::default()),
                store: Arc::new(RecordingStore::default()),
                archive: None,
            }
        }

        fn deps(&self) -> PipelineDeps {
            PipelineDeps {
                transcriber: self.transcriber.clone(),
                frame_analyzer: self.analyzer.clone(),
                quiz_generator: self.quizzes.clone(),
                title_generator: self.titles.clone(),
                media: Arc::new(MockMedia),
                fetcher: Arc::new(MockFetcher),
                store: self.store.clone(),
                archive: self.archive.clone(),
            }
        }

        fn any_model_loaded(&self) -> bool {
            self.transcriber.is_loaded()
                || self.analyzer.is_loaded()
                || self.quizzes.is_loaded()
                || self.titles.is_loaded()
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        video: PathBuf,
        config: PipelineConfig,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let video = dir.path().join("lecture.mp4");
        std::fs::write(&video, vec![0u8; 4096]).unwrap();
        let config = PipelineConfig {
            temp_dir: dir.path().join("work"),
            ..PipelineConfig::default()
        };
        Fixture { dir, video, config }
    }

    async fn collect_until_terminal(rx: &mut mpsc::Receiver<TaskEvent>) -> Vec<TaskEvent> {
        let mut events = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("event before deadline")
                .expect("channel open");
            let done = event.is_terminal();
            events.push(event);
            if done {
                return events;
            }
        }
    }

    async fn wait_idle(orchestrator: &Orchestrator) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while orchestrator.active_runs() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("runs finish");
    }

    /// Create a task, subscribe before it starts, run it to the end.
    async fn run_observed(
        orchestrator: &Orchestrator,
        request: TaskRequest,
    ) -> (TaskId, Vec<TaskEvent>) {
        let submission = orchestrator.create(request).await;
        let (tx, mut rx) = mpsc::channel(256);
        orchestrator.subscribe(&submission.task_id, Arc::new(tx)).await;
        orchestrator.start_task(&submission.task_id).await.unwrap();
        let events = collect_until_terminal(&mut rx).await;
        wait_idle(orchestrator).await;
        (submission.task_id, events)
    }

    fn kinds(events: &[TaskEvent]) -> Vec<&'static str> {
        events.iter().map(TaskEvent::kind).collect()
    }

    fn progress_values(events: &[TaskEvent]) -> Vec<f64> {
        events
            .iter()
            .filter_map(|e| match e {
                TaskEvent::Progress { progress, .. } => Some(*progress),
                _ => None,
            })
            .collect()
    }

    fn is_sorted(values: &[f64]) -> bool {
        values.windows(2).all(|w| w[0] <= w[1])
    }

    // ── End-to-end scenarios ──────────────────────────────────────────────────

    #[tokio::test]
    async fn local_file_completes_with_streamed_segment() {
        let fx = fixture();
        let mocks = Mocks::new();
        let orchestrator = Orchestrator::start(mocks.deps(), fx.config.clone());

        let (task_id, events) =
            run_observed(&orchestrator, TaskRequest::upload(&fx.video, "en")).await;

        let task = orchestrator.status(&task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress, Some(100.0));
        assert!(task.error.is_none());
        assert!(task.current_stage.is_none());
        assert_eq!(task.transcription.len(), 2);
        assert_eq!(task.frame_analyses.len(), 3);
        assert_eq!(task.title.as_deref(), Some("Rust Ownership Explained"));
        assert_eq!(task.metadata.as_ref().map(|m| m.size_bytes), Some(4096));

        let segments = orchestrator.segments(&task_id).await.unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].quizzes.len(), 2);
        assert!(matches!(
            segments[0].quizzes[0].kind,
            QuizKind::MultipleChoice { correct_index: 1, ref options } if options.len() == 4
        ));
        assert!(matches!(segments[0].quizzes[1].kind, QuizKind::ShortAnswer { .. }));

        let kinds = kinds(&events);
        assert_eq!(kinds.first(), Some(&"connected"));
        assert_eq!(kinds.iter().filter(|k| **k == "segment_ready").count(), 1);
        assert_eq!(kinds.iter().filter(|k| **k == "completed").count(), 1);
        assert_eq!(kinds.last(), Some(&"completed"));
        let ready = kinds.iter().position(|k| *k == "segment_ready").unwrap();
        assert!(ready < kinds.len() - 1);
        assert!(!kinds.contains(&"error"));
        assert!(is_sorted(&progress_values(&events)));

        // upload is a local file, not a download: no downloading state
        assert!(!mocks.store.statuses_of(&task_id).contains(&TaskStatus::Downloading));
        assert_eq!(mocks.store.results.lock().unwrap().len(), 1);
        assert!(!mocks.any_model_loaded());

        // scratch is gone, the only copy of the video stays
        assert!(!fx.config.task_dir(&task_id).exists());
        assert!(fx.video.exists());
    }

    #[tokio::test]
    async fn transcription_timeout_fails_the_task() {
        let fx = fixture();
        let mocks = Mocks {
            transcriber: Arc::new(MockTranscriber::new(Speech::Timeout)),
            ..Mocks::new()
        };
        let orchestrator = Orchestrator::start(mocks.deps(), fx.config.clone());

        let (task_id, events) =
            run_observed(&orchestrator, TaskRequest::upload(&fx.video, "en")).await;

        let task = orchestrator.status(&task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.segments.is_none());
        let error = task.error.unwrap();
        assert!(error.contains("timed out"), "{error}");
        assert!(error.starts_with("transcription failed"), "{error}");

        let kinds = kinds(&events);
        assert!(kinds.contains(&"progress"));
        assert_eq!(kinds.iter().filter(|k| **k == "error").count(), 1);
        assert_eq!(kinds.last(), Some(&"error"));
        assert!(!kinds.contains(&"completed"));

        assert!(!mocks.transcriber.is_loaded());
        assert_eq!(mocks.store.statuses_of(&task_id).last(), Some(&TaskStatus::Failed));
        assert!(orchestrator.segments(&task_id).await.is_none());
        assert!(!fx.config.task_dir(&task_id).exists());
    }

    #[tokio::test]
    async fn quiz_failure_yields_fallback_quiz() {
        let fx = fixture();
        let mocks = Mocks {
            quizzes: Arc::new(MockQuizGenerator {
                fail_quizzes: true,
                ..MockQuizGenerator::default()
            }),
            ..Mocks::new()
        };
        let orchestrator = Orchestrator::start(mocks.deps(), fx.config.clone());

        let (task_id, events) =
            run_observed(&orchestrator, TaskRequest::upload(&fx.video, "ru")).await;

        assert_eq!(orchestrator.status(&task_id).await.unwrap().status, TaskStatus::Completed);
        let segments = orchestrator.segments(&task_id).await.unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].quizzes.len(), 1);
        let quiz = &segments[0].quizzes[0];
        assert_eq!(quiz.language, "ru");
        assert!(quiz.question.contains("Ownership basics"));
        assert!(quiz.validate().is_ok());
        assert_eq!(kinds(&events).last(), Some(&"completed"));
    }

    #[tokio::test]
    async fn failed_proposals_fall_back_to_time_segments() {
        let fx = fixture();
        let mocks = Mocks {
            quizzes: Arc::new(MockQuizGenerator {
                fail_proposals: true,
                ..MockQuizGenerator::default()
            }),
            ..Mocks::new()
        };
        let orchestrator = Orchestrator::start(mocks.deps(), fx.config.clone());

        let (task_id, events) =
            run_observed(&orchestrator, TaskRequest::upload(&fx.video, "en")).await;

        let segments = orchestrator.segments(&task_id).await.unwrap();
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0].start_time, 0.0);
        assert!((segments[2].end_time - 40.0).abs() < 1e-9);
        assert!(segments.iter().all(|s| s.quizzes.len() == 2));
        assert_eq!(
            kinds(&events).iter().filter(|k| **k == "segment_ready").count(),
            3
        );
    }

    #[tokio::test]
    async fn title_failure_uses_transcript_words() {
        let fx = fixture();
        let mocks = Mocks {
            titles: Arc::new(MockTitleGenerator {
                fail: true,
                ..MockTitleGenerator::default()
            }),
            ..Mocks::new()
        };
        let orchestrator = Orchestrator::start(mocks.deps(), fx.config.clone());

        let (task_id, _) = run_observed(&orchestrator, TaskRequest::upload(&fx.video, "en")).await;

        let task = orchestrator.status(&task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(
            task.title.as_deref(),
            Some("Welcome to the Rust ownership tour. Borrowing lets")
        );
        assert!(!mocks.titles.is_loaded());
    }

    #[tokio::test]
    async fn one_failed_frame_batch_is_skipped() {
        let fx = fixture();
        let mocks = Mocks {
            analyzer: Arc::new(MockAnalyzer {
                fail_at: Some(10.0),
                ..MockAnalyzer::default()
            }),
            ..Mocks::new()
        };
        let orchestrator = Orchestrator::start(mocks.deps(), fx.config.clone());

        let (task_id, _) = run_observed(&orchestrator, TaskRequest::upload(&fx.video, "en")).await;

        let task = orchestrator.status(&task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        let stamps: Vec<f64> = task.frame_analyses.iter().map(|a| a.timestamp).collect();
        assert_eq!(stamps, vec![0.0, 20.0]);
    }

    #[tokio::test]
    async fn every_frame_batch_failing_fails_the_task() {
        let fx = fixture();
        let mocks = Mocks {
            analyzer: Arc::new(MockAnalyzer {
                fail_all: true,
                ..MockAnalyzer::default()
            }),
            ..Mocks::new()
        };
        let orchestrator = Orchestrator::start(mocks.deps(), fx.config.clone());

        let (task_id, events) =
            run_observed(&orchestrator, TaskRequest::upload(&fx.video, "en")).await;

        let task = orchestrator.status(&task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.unwrap().starts_with("frame_analysis failed"));
        assert_eq!(kinds(&events).last(), Some(&"error"));
        assert!(!mocks.analyzer.is_loaded());
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn duplicate_start_is_refused() {
        let fx = fixture();
        let mocks = Mocks {
            transcriber: Arc::new(MockTranscriber::new(Speech::Slow(Duration::from_millis(200)))),
            ..Mocks::new()
        };
        let orchestrator = Orchestrator::start(mocks.deps(), fx.config.clone());

        let submission = orchestrator.create(TaskRequest::upload(&fx.video, "en")).await;
        orchestrator.start_task(&submission.task_id).await.unwrap();

        let err = orchestrator.start_task(&submission.task_id).await.unwrap_err();
        assert!(matches!(err, RuntimeError::AlreadyRunning { .. }));
        assert_eq!(orchestrator.active_runs(), 1);

        wait_idle(&orchestrator).await;
        let err = orchestrator.start_task(&submission.task_id).await.unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::NotPending {
                status: TaskStatus::Completed,
                ..
            }
        ));
        assert!(matches!(
            orchestrator.start_task("missing").await,
            Err(RuntimeError::TaskNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn full_queue_rejects_and_fails_new_task() {
        let fx = fixture();
        let mocks = Mocks {
            transcriber: Arc::new(MockTranscriber::new(Speech::Slow(Duration::from_millis(300)))),
            ..Mocks::new()
        };
        let config = PipelineConfig {
            queue_capacity: 1,
            max_concurrent_tasks: 1,
            ..fx.config.clone()
        };
        let orchestrator = Orchestrator::start(mocks.deps(), config);

        // one run, one waiting in the dispatcher and one queued at most
        let mut accepted = Vec::new();
        let mut rejected = 0;
        for _ in 0..6 {
            match orchestrator.submit(TaskRequest::upload(&fx.video, "en")).await {
                Ok(submission) => accepted.push(submission.task_id),
                Err(RuntimeError::QueueFull) => rejected += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(rejected >= 3, "rejected {rejected}");
        assert!(orchestrator.active_runs() <= 3);

        let created = mocks.store.created.lock().unwrap().clone();
        assert_eq!(created.len(), 6);
        let mut failed = 0;
        for task_id in created.iter().filter(|id| !accepted.contains(id)) {
            let task = orchestrator.status(task_id).await.unwrap();
            assert_eq!(task.status, TaskStatus::Failed);
            assert_eq!(task.error.as_deref(), Some("submission queue is full"));
            failed += 1;
        }
        assert_eq!(failed, rejected);

        wait_idle(&orchestrator).await;
        for task_id in &accepted {
            let task = orchestrator.status(task_id).await.unwrap();
            assert_eq!(task.status, TaskStatus::Completed);
        }
    }

    #[tokio::test]
    async fn stalled_stage_is_unloaded_before_error_event() {
        let fx = fixture();
        let mocks = Mocks {
            transcriber: Arc::new(MockTranscriber::new(Speech::Stall(Duration::from_millis(200)))),
            ..Mocks::new()
        };
        let orchestrator = Orchestrator::start(mocks.deps(), fx.config.clone());

        let submission = orchestrator.create(TaskRequest::upload(&fx.video, "en")).await;
        let (tx, mut rx) = mpsc::channel(256);
        orchestrator.subscribe(&submission.task_id, Arc::new(tx)).await;
        orchestrator.start_task(&submission.task_id).await.unwrap();
        let events = collect_until_terminal(&mut rx).await;

        // checked at the terminal event, before the run winds down
        assert!(!mocks.transcriber.is_loaded());
        assert_eq!(mocks.transcriber.model.loads.load(Ordering::SeqCst), 1);
        assert_eq!(kinds(&events).last(), Some(&"error"));
        assert!(!kinds(&events).contains(&"segment_ready"));

        wait_idle(&orchestrator).await;
        let task = orchestrator.status(&submission.task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn delete_mid_run_stops_quietly() {
        let fx = fixture();
        let mocks = Mocks {
            transcriber: Arc::new(MockTranscriber::new(Speech::Slow(Duration::from_millis(300)))),
            ..Mocks::new()
        };
        let orchestrator = Orchestrator::start(mocks.deps(), fx.config.clone());

        let submission = orchestrator.submit(TaskRequest::upload(&fx.video, "en")).await.unwrap();
        let task_id = submission.task_id;

        tokio::time::timeout(Duration::from_secs(5), async {
            while orchestrator.status(&task_id).await.map(|t| t.status)
                != Some(TaskStatus::Transcribing)
            {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("run reaches transcription");

        assert!(orchestrator.delete(&task_id).await);
        assert!(orchestrator.status(&task_id).await.is_none());
        assert!(!orchestrator.delete(&task_id).await);

        wait_idle(&orchestrator).await;
        assert!(orchestrator.status(&task_id).await.is_none());
        let statuses = mocks.store.statuses_of(&task_id);
        assert!(!statuses.contains(&TaskStatus::Failed));
        assert!(!statuses.contains(&TaskStatus::Completed));
        assert!(!fx.config.task_dir(&task_id).exists());
        assert!(!mocks.any_model_loaded());
    }

    #[tokio::test]
    async fn persisted_progress_is_monotonic() {
        let fx = fixture();
        let mocks = Mocks::new();
        let orchestrator = Orchestrator::start(mocks.deps(), fx.config.clone());

        let (task_id, _) = run_observed(&orchestrator, TaskRequest::upload(&fx.video, "en")).await;

        let progress = mocks.store.progress_of(&task_id);
        assert!(progress.len() > 5);
        assert!(is_sorted(&progress));
        assert_eq!(progress.last(), Some(&100.0));
        assert_eq!(mocks.store.created.lock().unwrap().as_slice(), [task_id]);
    }

    #[tokio::test]
    async fn late_subscriber_gets_terminal_event() {
        let fx = fixture();
        let mocks = Mocks::new();
        let orchestrator = Orchestrator::start(mocks.deps(), fx.config.clone());
        let (task_id, _) = run_observed(&orchestrator, TaskRequest::upload(&fx.video, "en")).await;

        let (tx, mut rx) = mpsc::channel(8);
        orchestrator.subscribe(&task_id, Arc::new(tx)).await;
        let events = collect_until_terminal(&mut rx).await;
        assert_eq!(kinds(&events), ["connected", "completed"]);
    }

    #[tokio::test]
    async fn swept_task_subscriber_gets_stored_terminal_event() {
        let fx = fixture();
        let mocks = Mocks::new();
        let orchestrator = Orchestrator::start(mocks.deps(), fx.config.clone());
        let (task_id, _) = run_observed(&orchestrator, TaskRequest::upload(&fx.video, "en")).await;
        assert_eq!(orchestrator.sweep(Duration::ZERO).await, 1);

        let now = chrono::Utc::now();
        let row = |task_id: &str, status: TaskStatus, error: Option<&str>| StoredTask {
            task_id: task_id.to_owned(),
            status,
            progress: 100.0,
            current_stage: None,
            error: error.map(str::to_owned),
            language: "en".into(),
            source_url: None,
            video_location: None,
            title: Some("Rust Ownership Explained".into()),
            metadata: None,
            segments: Some(Vec::new()),
            created_at: now,
            updated_at: now,
        };
        {
            let mut rows = mocks.store.rows.lock().unwrap();
            rows.push(row(&task_id, TaskStatus::Completed, None));
            rows.push(row("failed-earlier", TaskStatus::Failed, Some("interrupted by restart")));
        }

        let (tx, mut rx) = mpsc::channel(8);
        orchestrator.subscribe(&task_id, Arc::new(tx)).await;
        let events = collect_until_terminal(&mut rx).await;
        assert_eq!(kinds(&events), ["connected", "completed"]);
        assert!(matches!(
            &events[1],
            TaskEvent::Completed { title, total_segments: 0, .. } if title == "Rust Ownership Explained"
        ));

        let (tx, mut rx) = mpsc::channel(8);
        orchestrator.subscribe("failed-earlier", Arc::new(tx)).await;
        let events = collect_until_terminal(&mut rx).await;
        assert!(matches!(
            events.last(),
            Some(TaskEvent::Error { error, .. }) if error == "interrupted by restart"
        ));
    }

    #[tokio::test]
    async fn sweep_evicts_finished_tasks() {
        let fx = fixture();
        let mocks = Mocks::new();
        let orchestrator = Orchestrator::start(mocks.deps(), fx.config.clone());
        let (task_id, _) = run_observed(&orchestrator, TaskRequest::upload(&fx.video, "en")).await;

        assert_eq!(orchestrator.sweep(Duration::from_secs(3600)).await, 0);
        assert_eq!(orchestrator.sweep(Duration::ZERO).await, 1);
        assert!(orchestrator.status(&task_id).await.is_none());
        // sweeping deletes the task's files, the uploaded video included
        assert!(!fx.video.exists());
    }

    // ── URL sources ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn url_task_downloads_and_archives() {
        let fx = fixture();
        let archive_root = fx.dir.path().join("archive");
        let mocks = Mocks {
            archive: Some(Arc::new(DirectoryArchive::new(&archive_root))),
            ..Mocks::new()
        };
        let orchestrator = Orchestrator::start(mocks.deps(), fx.config.clone());

        let (task_id, events) = run_observed(
            &orchestrator,
            TaskRequest::url("https://cdn.example.com/talk.mp4", "en"),
        )
        .await;

        assert_eq!(kinds(&events).last(), Some(&"completed"));
        let statuses = mocks.store.statuses_of(&task_id);
        assert_eq!(statuses.first(), Some(&TaskStatus::Downloading));

        assert!(archive_root.join(&task_id).join("source.mp4").exists());
        assert!(!fx.config.task_dir(&task_id).exists());
        let locations = mocks.store.locations.lock().unwrap();
        assert_eq!(locations.len(), 2);
        assert!(locations[0].1.ends_with("source.mp4"));
        assert!(locations[1].1.starts_with("file://"));
    }

    #[tokio::test]
    async fn same_url_and_language_reuses_task() {
        let fx = fixture();
        let mocks = Mocks::new();
        let orchestrator = Orchestrator::start(mocks.deps(), fx.config.clone());

        let first = orchestrator
            .submit(TaskRequest::url("https://youtu.be/dQw4w9WgXcQ", "en"))
            .await
            .unwrap();
        let again = orchestrator
            .submit(TaskRequest::url(
                "https://www.youtube.com/watch?v=dQw4w9WgXcQ&t=42",
                "en",
            ))
            .await
            .unwrap();
        let other = orchestrator
            .submit(TaskRequest::url("https://youtu.be/dQw4w9WgXcQ", "kk"))
            .await
            .unwrap();

        assert!(!first.reused);
        assert!(again.reused);
        assert_eq!(first.task_id, again.task_id);
        assert!(!other.reused);
        assert_ne!(first.task_id, other.task_id);
        wait_idle(&orchestrator).await;
    }

    #[tokio::test]
    #[traced_test]
    async fn malformed_url_fails_without_running() {
        let fx = fixture();
        let mocks = Mocks::new();
        let orchestrator = Orchestrator::start(mocks.deps(), fx.config.clone());

        let submission = orchestrator
            .submit(TaskRequest::url("ftp://example.com/v.mp4", "en"))
            .await
            .unwrap();

        let task = orchestrator.status(&submission.task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.unwrap().starts_with("malformed URL"));
        assert_eq!(orchestrator.active_runs(), 0);
        assert!(logs_contain("task failed"));
    }

    // ── Side effects and residency ────────────────────────────────────────────

    #[tokio::test]
    #[traced_test]
    async fn store_failures_never_fail_the_task() {
        let fx = fixture();
        let mocks = Mocks {
            store: Arc::new(RecordingStore {
                broken: true,
                ..RecordingStore::default()
            }),
            ..Mocks::new()
        };
        let orchestrator = Orchestrator::start(mocks.deps(), fx.config.clone());

        let (task_id, events) =
            run_observed(&orchestrator, TaskRequest::upload(&fx.video, "en")).await;

        assert_eq!(kinds(&events).last(), Some(&"completed"));
        assert_eq!(
            orchestrator.status(&task_id).await.unwrap().status,
            TaskStatus::Completed
        );
        assert!(logs_contain("durable store write failed"));
    }

    #[tokio::test]
    async fn ample_profile_preloads_and_keeps_models() {
        let fx = fixture();
        let mocks = Mocks::new();
        let config = PipelineConfig {
            hardware_profile: HardwareProfile::Ample,
            ..fx.config.clone()
        };
        let orchestrator = Orchestrator::start(mocks.deps(), config);

        orchestrator.preload_models().await.unwrap();
        assert!(mocks.transcriber.is_loaded() && mocks.titles.is_loaded());

        let (task_id, _) = run_observed(&orchestrator, TaskRequest::upload(&fx.video, "en")).await;
        assert_eq!(
            orchestrator.status(&task_id).await.unwrap().status,
            TaskStatus::Completed
        );
        assert!(mocks.transcriber.is_loaded());
        assert_eq!(mocks.transcriber.model.loads.load(Ordering::SeqCst), 1);
        assert_eq!(mocks.quizzes.model.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn constrained_preload_is_lazy() {
        let fx = fixture();
        let mocks = Mocks::new();
        let orchestrator = Orchestrator::start(mocks.deps(), fx.config.clone());
        orchestrator.preload_models().await.unwrap();
        assert!(!mocks.any_model_loaded());
    }
}
