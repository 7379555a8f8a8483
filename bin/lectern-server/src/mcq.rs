//! Multiple-choice question generation from lecture transcripts.
//!
//! A transcript is cut into fixed-size word windows; each window becomes one
//! generation job whose prompt asks the model for a `{"mcqs": [...]}` JSON
//! document, checked by [`validate_mcq_set`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Words per transcript window when the caller does not choose.
pub const DEFAULT_WORDS_PER_SEGMENT: usize = 750;

/// Options every question must carry.
pub const OPTIONS_PER_QUESTION: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mcq {
    pub question: String,
    pub options: Vec<String>,
    pub answer: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct McqSet {
    pub mcqs: Vec<Mcq>,
}

/// Split `transcript` on whitespace into windows of at most
/// `words_per_segment` words, each re-joined with single spaces.
pub fn segment_transcript_by_words(transcript: &str, words_per_segment: usize) -> Vec<String> {
    let words: Vec<&str> = transcript.split_whitespace().collect();
    words
        .chunks(words_per_segment.max(1))
        .map(|chunk| chunk.join(" "))
        .collect()
}

pub fn mcq_prompt(segment: &str) -> String {
    format!(
        r#"You are an AI educator assistant.

TASK:
From the paragraph below, generate multiple-choice questions (MCQs) that test comprehension of different ideas in the text.

- Generate 2 to 5 MCQs that together cover different parts or ideas of the paragraph.
- For each MCQ:
  - Provide 1 clear question.
  - Provide 4 answer options labeled A to D.
  - Mark the correct option clearly.
- Use simple and relevant language suitable for learners.
- Do NOT repeat exact lines from the paragraph.
- Avoid duplicate or overly similar questions.

Respond ONLY in JSON format like this:

{{
  "mcqs": [
    {{
      "question": "...",
      "options": ["A", "B", "C", "D"],
      "answer": "..."
    }}
  ]
}}

PARAGRAPH:
"{segment}""#
    )
}

/// Schema check for generation output: at least one question, each with a
/// non-empty question and answer and exactly four options.
pub fn validate_mcq_set(value: &Value) -> Result<(), String> {
    let set: McqSet = serde_json::from_value(value.clone()).map_err(|e| e.to_string())?;
    if set.mcqs.is_empty() {
        return Err("`mcqs` is empty".into());
    }
    for (i, mcq) in set.mcqs.iter().enumerate() {
        if mcq.question.trim().is_empty() {
            return Err(format!("mcqs[{i}]: question is empty"));
        }
        if mcq.options.len() != OPTIONS_PER_QUESTION {
            return Err(format!(
                "mcqs[{i}]: expected {OPTIONS_PER_QUESTION} options, got {}",
                mcq.options.len()
            ));
        }
        if mcq.answer.trim().is_empty() {
            return Err(format!("mcqs[{i}]: answer is empty"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn segments_by_word_count() {
        let text = "one two  three\nfour five";
        assert_eq!(
            segment_transcript_by_words(text, 2),
            vec!["one two", "three four", "five"]
        );
        assert_eq!(segment_transcript_by_words(text, 750), vec!["one two three four five"]);
        assert!(segment_transcript_by_words("   ", 750).is_empty());
    }

    #[test]
    fn zero_window_is_treated_as_one_word() {
        assert_eq!(segment_transcript_by_words("a b", 0), vec!["a", "b"]);
    }

    #[test]
    fn prompt_embeds_segment_and_schema() {
        let prompt = mcq_prompt("Photosynthesis turns light into sugar.");
        assert!(prompt.contains("\"Photosynthesis turns light into sugar.\""));
        assert!(prompt.contains("\"mcqs\": ["));
        assert!(prompt.starts_with("You are an AI educator assistant."));
    }

    #[test]
    fn accepts_well_formed_set() {
        let value = json!({
            "mcqs": [{
                "question": "What does photosynthesis produce?",
                "options": ["Sugar", "Salt", "Iron", "Sand"],
                "answer": "Sugar"
            }]
        });
        assert!(validate_mcq_set(&value).is_ok());
    }

    #[test]
    fn rejects_malformed_sets() {
        assert!(validate_mcq_set(&json!({ "questions": [] })).is_err());
        assert!(validate_mcq_set(&json!({ "mcqs": [] })).is_err());
        let three_options = json!({
            "mcqs": [{ "question": "q", "options": ["a", "b", "c"], "answer": "a" }]
        });
        let err = validate_mcq_set(&three_options).unwrap_err();
        assert!(err.contains("expected 4 options"));
    }
}
