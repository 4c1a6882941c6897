//! Domain entities produced and consumed by the pipeline stages.
//!
//! Every entity here is a plain owned value that serializes to the JSON shape
//! clients see over HTTP and WebSocket.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Container-level facts about a video, filled in by the probe step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VideoMetadata {
    /// Duration in seconds.
    pub duration: f64,
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    pub size_bytes: u64,
}

/// One timed piece of transcribed speech.
///
/// Spans are ordered by `start`; adjacent spans may overlap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSpan {
    pub start: f64,
    pub end: f64,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

/// A sampled frame on disk, handed to the frame analyzer.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameRef {
    pub timestamp: f64,
    pub path: PathBuf,
}

/// Description of a single sampled frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameAnalysis {
    pub timestamp: f64,
    pub description: String,
    #[serde(default)]
    pub key_elements: Vec<String>,
}

impl FrameAnalysis {
    /// Build an analysis whose `key_elements` are derived from the description.
    pub fn from_description(timestamp: f64, description: impl Into<String>) -> Self {
        let description = description.into();
        let key_elements = extract_key_elements(&description);
        Self {
            timestamp,
            description,
            key_elements,
        }
    }
}

const MAX_KEY_ELEMENTS: usize = 10;

/// Pull salient terms out of a free-text frame description.
///
/// Quoted terms come first, followed by runs of capitalized words that do not
/// start a sentence. Duplicates are removed case-insensitively and the result
/// is capped at ten entries.
pub fn extract_key_elements(description: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let push = |term: &str, out: &mut Vec<String>| {
        let term = term.trim_matches(|c: char| !c.is_alphanumeric());
        if term.len() < 2 || out.len() >= MAX_KEY_ELEMENTS {
            return;
        }
        if !out.iter().any(|t| t.eq_ignore_ascii_case(term)) {
            out.push(term.to_owned());
        }
    };

    // quoted terms
    for (i, part) in description.split('"').enumerate() {
        if i % 2 == 1 {
            push(part, &mut out);
        }
    }

    // capitalized phrases, skipping sentence-initial words
    let mut phrase: Vec<&str> = Vec::new();
    let mut sentence_start = true;
    for word in description.split_whitespace() {
        let bare = word.trim_matches(|c: char| !c.is_alphanumeric());
        let capitalized = bare.chars().next().is_some_and(char::is_uppercase);
        if capitalized && !sentence_start {
            phrase.push(bare);
        } else if !phrase.is_empty() {
            push(&phrase.join(" "), &mut out);
            phrase.clear();
        }
        sentence_start = word.ends_with(['.', '!', '?']);
        if sentence_start && !phrase.is_empty() {
            push(&phrase.join(" "), &mut out);
            phrase.clear();
        }
    }
    if !phrase.is_empty() {
        push(&phrase.join(" "), &mut out);
    }

    out
}

/// A quiz question attached to a segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quiz {
    /// ISO-639-1 language code the question is written in.
    pub language: String,
    pub question: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(flatten)]
    pub kind: QuizKind,
}

/// Answer shape of a quiz: exactly one of the two variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QuizKind {
    MultipleChoice {
        options: Vec<String>,
        correct_index: usize,
    },
    ShortAnswer {
        accepted_answers: Vec<String>,
        #[serde(default)]
        case_sensitive: bool,
    },
}

impl Quiz {
    pub fn multiple_choice(
        language: impl Into<String>,
        question: impl Into<String>,
        options: Vec<String>,
        correct_index: usize,
    ) -> Self {
        Self {
            language: language.into(),
            question: question.into(),
            explanation: None,
            kind: QuizKind::MultipleChoice {
                options,
                correct_index,
            },
        }
    }

    pub fn short_answer(
        language: impl Into<String>,
        question: impl Into<String>,
        accepted_answers: Vec<String>,
        case_sensitive: bool,
    ) -> Self {
        Self {
            language: language.into(),
            question: question.into(),
            explanation: None,
            kind: QuizKind::ShortAnswer {
                accepted_answers,
                case_sensitive,
            },
        }
    }

    pub fn with_explanation(mut self, explanation: impl Into<String>) -> Self {
        self.explanation = Some(explanation.into());
        self
    }

    /// Check structural well-formedness of a generated quiz.
    pub fn validate(&self) -> Result<(), String> {
        if self.question.trim().is_empty() {
            return Err("quiz question is empty".to_owned());
        }
        match &self.kind {
            QuizKind::MultipleChoice {
                options,
                correct_index,
            } => {
                if options.len() < 2 {
                    return Err(format!(
                        "multiple-choice quiz needs at least 2 options, got {}",
                        options.len()
                    ));
                }
                if *correct_index >= options.len() {
                    return Err(format!(
                        "correct_index {correct_index} out of range for {} options",
                        options.len()
                    ));
                }
            }
            QuizKind::ShortAnswer {
                accepted_answers, ..
            } => {
                if accepted_answers.iter().all(|a| a.trim().is_empty()) {
                    return Err("short-answer quiz has no accepted answers".to_owned());
                }
            }
        }
        Ok(())
    }
}

/// Topic boundaries proposed for a video before quizzes are attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentProposal {
    pub start_time: f64,
    pub end_time: f64,
    pub title: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub keywords: Vec<String>,
}

impl SegmentProposal {
    /// Transcript text that falls inside this segment's time range.
    pub fn transcript_text(&self, transcript: &[TranscriptSpan]) -> String {
        transcript
            .iter()
            .filter(|s| s.end > self.start_time && s.start < self.end_time)
            .map(|s| s.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Frame analyses whose timestamp falls inside this segment.
    pub fn frames<'a>(&self, frames: &'a [FrameAnalysis]) -> Vec<&'a FrameAnalysis> {
        frames
            .iter()
            .filter(|f| f.timestamp >= self.start_time && f.timestamp < self.end_time)
            .collect()
    }

    pub fn into_segment(self, quizzes: Vec<Quiz>) -> Segment {
        Segment {
            start_time: self.start_time,
            end_time: self.end_time,
            title: self.title,
            summary: self.summary,
            keywords: self.keywords,
            quizzes,
        }
    }
}

/// A topical slice of a video with its quiz items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub start_time: f64,
    pub end_time: f64,
    pub title: String,
    pub summary: String,
    pub keywords: Vec<String>,
    pub quizzes: Vec<Quiz>,
}
