use serde_json::json;

use super::client::EmbeddedPayload;

pub const ASSESSMENT_PAYLOAD_KIND: &str = "assessment";

/// Fewer questions than this means the reply is ordinary prose.
pub const MIN_ASSESSMENT_QUESTIONS: usize = 3;

/// Asked at the end of every assessment, whatever the subject.
pub const COMMON_ASSESSMENT_QUESTIONS: [&str; 2] = [
    "How much time can you dedicate to learning per week?",
    "What is your preferred learning style (hands-on, reading, video tutorials)?",
];

/// Extracts question lines from a tutor reply, dropping list markers.
pub fn parse_questions(text: &str) -> Vec<String> {
    text.lines()
        .map(|line| {
            line.trim()
                .trim_start_matches(|c: char| c.is_ascii_digit() || matches!(c, '.' | '-' | ' ' | '*'))
                .trim()
        })
        .filter(|line| !line.is_empty() && line.ends_with('?'))
        .map(str::to_string)
        .collect()
}

/// Wraps a question-style reply as an embedded assessment the render surface can show as a form.
pub fn assessment_payload(reply: &str) -> Option<EmbeddedPayload> {
    let mut questions = parse_questions(reply);
    if questions.len() < MIN_ASSESSMENT_QUESTIONS {
        return None;
    }

    for common in COMMON_ASSESSMENT_QUESTIONS {
        if !questions.iter().any(|question| question.eq_ignore_ascii_case(common)) {
            questions.push(common.to_string());
        }
    }

    Some(EmbeddedPayload::new(
        ASSESSMENT_PAYLOAD_KIND,
        json!({ "questions": questions }),
    ))
}
