use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{OllamaSession, parse_embedded_json};
use crate::model::{
    FrameAnalysis, FrameRef, Quiz, QuizKind, SegmentProposal, TranscriptSpan,
};
use crate::stages::{
    FrameAnalyzer, ModelStage, QuizGenerator, StageError, TitleGenerator, fallback,
};

macro_rules! delegate_model_stage {
    ($ty:ty, $name:literal) => {
        impl ModelStage for $ty {
            fn name(&self) -> &str {
                $name
            }
            fn load(&self) -> Result<(), StageError> {
                self.session.load()
            }
            fn unload(&self) -> Result<(), StageError> {
                self.session.unload()
            }
            fn is_loaded(&self) -> bool {
                self.session.is_loaded()
            }
        }
    };
}

// ─── Frame analysis ───────────────────────────────────────────────────────────

/// Captions frames with a vision-language model, one request per frame.
#[derive(Debug)]
pub struct OllamaFrameAnalyzer {
    session: OllamaSession,
}

impl OllamaFrameAnalyzer {
    pub fn new(session: OllamaSession) -> Self {
        Self { session }
    }
}

delegate_model_stage!(OllamaFrameAnalyzer, "vision");

const FRAME_PROMPT: &str = "Describe this video frame in 2-3 sentences for a student. \
Mention any visible text, diagrams, slides, code or people, quoting on-screen text exactly.";

impl FrameAnalyzer for OllamaFrameAnalyzer {
    fn analyze(&self, frames: &[FrameRef]) -> Result<Vec<FrameAnalysis>, StageError> {
        let mut out = Vec::with_capacity(frames.len());
        for frame in frames {
            let bytes = std::fs::read(&frame.path).map_err(|e| {
                StageError::Inference(format!("cannot read {}: {e}", frame.path.display()))
            })?;
            let image = STANDARD.encode(bytes);
            let description = self.session.generate(FRAME_PROMPT, &[image], false)?;
            let description = description.trim();
            if description.is_empty() {
                return Err(StageError::InvalidOutput(format!(
                    "empty description for frame at {:.1}s",
                    frame.timestamp
                )));
            }
            out.push(FrameAnalysis::from_description(frame.timestamp, description));
        }
        debug!(count = out.len(), "frames described");
        Ok(out)
    }
}

// ─── Segmentation and quizzes ─────────────────────────────────────────────────

/// Segments a transcript and writes quizzes with a text LLM.
#[derive(Debug)]
pub struct OllamaQuizGenerator {
    session: OllamaSession,
    quizzes_per_segment: usize,
}

impl OllamaQuizGenerator {
    pub fn new(session: OllamaSession, quizzes_per_segment: usize) -> Self {
        Self {
            session,
            quizzes_per_segment: quizzes_per_segment.max(1),
        }
    }
}

delegate_model_stage!(OllamaQuizGenerator, "quiz-llm");

#[derive(Debug, Deserialize)]
struct RawSegment {
    start_time: f64,
    end_time: f64,
    #[serde(alias = "topic")]
    title: String,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    keywords: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawQuiz {
    #[serde(default, rename = "type")]
    kind: Option<String>,
    question: String,
    #[serde(default)]
    options: Vec<String>,
    #[serde(default)]
    correct_index: Option<usize>,
    #[serde(default)]
    accepted_answers: Vec<String>,
    #[serde(default)]
    case_sensitive: bool,
    #[serde(default)]
    explanation: Option<String>,
}

impl RawQuiz {
    fn into_quiz(self, language: &str) -> Option<Quiz> {
        let short = self.kind.as_deref() == Some("short_answer")
            || (self.options.is_empty() && !self.accepted_answers.is_empty());
        let kind = if short {
            QuizKind::ShortAnswer {
                accepted_answers: self.accepted_answers,
                case_sensitive: self.case_sensitive,
            }
        } else {
            QuizKind::MultipleChoice {
                options: self.options,
                correct_index: self.correct_index?,
            }
        };
        let quiz = Quiz {
            language: language.to_owned(),
            question: self.question,
            explanation: self.explanation.filter(|e| !e.trim().is_empty()),
            kind,
        };
        quiz.validate().ok().map(|()| quiz)
    }
}

fn frame_context(frames: &[&FrameAnalysis], limit: usize) -> String {
    frames
        .iter()
        .take(limit)
        .map(|f| {
            let d: String = f.description.chars().take(100).collect();
            format!("At {:.1}s: {d}", f.timestamp)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn head(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

fn language_name(code: &str) -> &str {
    match code {
        "en" => "English",
        "ru" => "Russian",
        "kk" => "Kazakh",
        "de" => "German",
        "fr" => "French",
        "es" => "Spanish",
        other => other,
    }
}

impl QuizGenerator for OllamaQuizGenerator {
    fn propose_segments(
        &self,
        transcript: &[TranscriptSpan],
        frames: &[FrameAnalysis],
        duration: f64,
    ) -> Result<Vec<SegmentProposal>, StageError> {
        let text = transcript
            .iter()
            .map(|s| s.text.trim())
            .collect::<Vec<_>>()
            .join(" ");
        let frame_refs: Vec<&FrameAnalysis> = frames.iter().collect();
        let prompt = format!(
            "You segment educational videos into chapters.\n\n\
             Video duration: {duration:.1} seconds\n\n\
             Transcript:\n{}\n\n\
             Visual information:\n{}\n\n\
             Divide the video into 3-6 logical segments at topic changes. \
             Respond with only a JSON array of objects with the keys \
             start_time, end_time (seconds), title, summary (1-2 sentences) and keywords (array of strings).",
            head(&text, 2000),
            frame_context(&frame_refs, 10),
        );

        let reply = self.session.generate(&prompt, &[], false)?;
        let raw: Vec<RawSegment> = parse_embedded_json(&reply)?;

        let proposals: Vec<SegmentProposal> = raw
            .into_iter()
            .filter_map(|s| {
                let start = s.start_time.max(0.0);
                let end = if duration > 0.0 { s.end_time.min(duration) } else { s.end_time };
                (end > start && !s.title.trim().is_empty()).then(|| SegmentProposal {
                    start_time: start,
                    end_time: end,
                    title: fallback::truncate_chars(s.title.trim(), 80),
                    summary: s.summary,
                    keywords: s.keywords,
                })
            })
            .collect();
        if proposals.is_empty() {
            return Err(StageError::InvalidOutput("no usable segments".to_owned()));
        }
        Ok(proposals)
    }

    fn generate_quizzes(
        &self,
        segment: &SegmentProposal,
        transcript: &[TranscriptSpan],
        frames: &[FrameAnalysis],
        language: &str,
    ) -> Result<Vec<Quiz>, StageError> {
        let text = segment.transcript_text(transcript);
        let prompt = format!(
            "You write quiz questions for students about a video segment.\n\n\
             Segment: {title} ({start:.1}s - {end:.1}s)\n\
             Summary: {summary}\n\n\
             Transcript:\n{text}\n\n\
             Visual information:\n{visual}\n\n\
             Write {n} questions in {lang}. Prefer multiple-choice with 4 options; \
             short-answer questions are allowed for single facts. Respond with only a JSON array of objects: \
             {{\"type\": \"multiple_choice\", \"question\": \"...\", \"options\": [\"...\"], \"correct_index\": 0, \"explanation\": \"...\"}} or \
             {{\"type\": \"short_answer\", \"question\": \"...\", \"accepted_answers\": [\"...\"], \"case_sensitive\": false, \"explanation\": \"...\"}}",
            title = segment.title,
            start = segment.start_time,
            end = segment.end_time,
            summary = segment.summary,
            text = head(&text, 1500),
            visual = frame_context(&segment.frames(frames), 5),
            n = self.quizzes_per_segment,
            lang = language_name(language),
        );

        let reply = self.session.generate(&prompt, &[], false)?;
        let raw: Vec<RawQuiz> = parse_embedded_json(&reply)?;
        let total = raw.len();
        let quizzes: Vec<Quiz> = raw
            .into_iter()
            .filter_map(|q| q.into_quiz(language))
            .take(self.quizzes_per_segment)
            .collect();
        if quizzes.len() < total {
            warn!(
                segment = %segment.title,
                dropped = total - quizzes.len(),
                "discarded malformed or surplus quizzes"
            );
        }
        if quizzes.is_empty() {
            return Err(StageError::InvalidOutput("no valid quizzes".to_owned()));
        }
        Ok(quizzes)
    }
}

// ─── Title ────────────────────────────────────────────────────────────────────

/// Writes a short title for the whole video.
#[derive(Debug)]
pub struct OllamaTitleGenerator {
    session: OllamaSession,
    max_chars: usize,
}

impl OllamaTitleGenerator {
    pub fn new(session: OllamaSession, max_chars: usize) -> Self {
        Self { session, max_chars }
    }
}

delegate_model_stage!(OllamaTitleGenerator, "title-llm");

impl TitleGenerator for OllamaTitleGenerator {
    fn generate_title(
        &self,
        transcript: &[TranscriptSpan],
        frames: &[FrameAnalysis],
        duration: f64,
    ) -> Result<String, StageError> {
        let text = transcript
            .iter()
            .take(10)
            .map(|s| s.text.trim())
            .collect::<Vec<_>>()
            .join(" ");
        let frame_refs: Vec<&FrameAnalysis> = frames.iter().collect();
        let prompt = format!(
            "Write a short, descriptive title (at most {} characters) for an educational video.\n\n\
             Duration: {duration:.1} seconds\n\nTranscript excerpt:\n{}\n\nVisual information:\n{}\n\n\
             Respond with only the title text.",
            self.max_chars,
            head(&text, 1000),
            frame_context(&frame_refs, 5),
        );
        let reply = self.session.generate(&prompt, &[], false)?;
        fallback::clean_title(&reply, self.max_chars)
            .ok_or_else(|| StageError::InvalidOutput("title too short".to_owned()))
    }
}
