//! Deterministic substitutes used when a model stage cannot produce output.

use crate::model::{Quiz, SegmentProposal, TranscriptSpan};

pub const UNTITLED: &str = "Untitled Video";

const TOPIC_MAX_CHARS: usize = 50;

/// Truncate to at most `max_chars` characters, ending in `...` when cut.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_owned();
    }
    let keep = max_chars.saturating_sub(3);
    let mut out: String = text.chars().take(keep).collect();
    out.push_str("...");
    out
}

/// Single generic multiple-choice question about a segment's topic.
///
/// Localized for `en`, `ru` and `kk`; any other language gets English.
pub fn fallback_quiz(topic: &str, language: &str) -> Quiz {
    let topic = if topic.trim().is_empty() {
        "this content"
    } else {
        topic.trim()
    };
    let (question, distractors, explanation) = match language {
        "ru" => (
            format!("О чём говорится в этом сегменте про {topic}?"),
            ["Несвязанная тема А", "Несвязанная тема Б", "Другое"],
            format!("Этот сегмент посвящён {topic}."),
        ),
        "kk" => (
            format!("{topic} туралы бұл сегментте не талқыланады?"),
            ["Байланыссыз тақырып А", "Байланыссыз тақырып Б", "Басқа"],
            format!("Бұл сегмент {topic} туралы."),
        ),
        _ => (
            format!("What is discussed in the segment about {topic}?"),
            ["Unrelated topic A", "Unrelated topic B", "Other"],
            format!("This segment focuses on {topic}."),
        ),
    };

    let mut options = vec![topic.to_owned()];
    options.extend(distractors.iter().map(|d| (*d).to_owned()));
    let language = match language {
        "ru" | "kk" => language,
        _ => "en",
    };
    Quiz::multiple_choice(language, question, options, 0).with_explanation(explanation)
}

/// Split `[0, duration]` into 3 to 5 equal segments, one per started minute.
pub fn fallback_segments(duration: f64, transcript: &[TranscriptSpan]) -> Vec<SegmentProposal> {
    let duration = if duration.is_finite() && duration > 0.0 {
        duration
    } else {
        transcript.iter().map(|s| s.end).fold(0.0, f64::max).max(1.0)
    };
    let count = ((duration / 60.0) as usize).clamp(3, 5);
    let step = duration / count as f64;

    (0..count)
        .map(|i| {
            let start = i as f64 * step;
            let end = ((i + 1) as f64 * step).min(duration);
            let mut proposal = SegmentProposal {
                start_time: start,
                end_time: end,
                title: String::new(),
                summary: format!("Content from {start:.1}s to {end:.1}s"),
                keywords: Vec::new(),
            };
            let text = proposal.transcript_text(transcript);
            let words: Vec<&str> = text.split_whitespace().take(10).collect();
            proposal.title = if words.is_empty() {
                format!("Segment {}", i + 1)
            } else {
                truncate_chars(&words.join(" "), TOPIC_MAX_CHARS + 3)
            };
            proposal
        })
        .collect()
}

/// Title made of the first `max_words` words of the opening transcript spans.
pub fn fallback_title(transcript: &[TranscriptSpan], max_words: usize, max_chars: usize) -> String {
    let words: Vec<&str> = transcript
        .iter()
        .take(10)
        .flat_map(|s| s.text.split_whitespace())
        .take(max_words)
        .collect();
    if words.is_empty() {
        return UNTITLED.to_owned();
    }
    truncate_chars(&words.join(" "), max_chars)
}

/// Normalize raw model output into a title, or `None` if it is unusable.
pub fn clean_title(raw: &str, max_chars: usize) -> Option<String> {
    let line = raw.lines().map(str::trim).find(|l| !l.is_empty())?;
    let title = line.trim_matches(|c| c == '"' || c == '\'').trim();
    if title.chars().count() < 3 {
        return None;
    }
    Some(truncate_chars(title, max_chars))
}
