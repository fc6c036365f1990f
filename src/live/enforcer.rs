//! Structured-output enforcer (C6): parse/validate the tutor's 5-key
//! JSON response, repair it against the model when it doesn't validate,
//! and fall back to deterministic coercion (which cannot itself fail)
//! when repair is exhausted or disabled.

use serde_json::{Map, Value, json};

use super::config::TargetLanguage;
use super::llm::{LlmAdapter, Message, RequestOptions};

/// The five keys every structured tutor response must carry, in order.
pub const STRUCTURED_KEYS: [&str; 5] =
    ["answer", "steps", "examples", "common_mistakes", "next_exercises"];

/// A validated structured tutor response.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuredResponse {
    pub answer: String,
    pub steps: Vec<String>,
    pub examples: Vec<String>,
    pub common_mistakes: Vec<String>,
    pub next_exercises: Vec<String>,
}

impl StructuredResponse {
    pub fn to_json(&self) -> Value {
        json!({
            "answer": self.answer,
            "steps": self.steps,
            "examples": self.examples,
            "common_mistakes": self.common_mistakes,
            "next_exercises": self.next_exercises,
        })
    }

    /// Pretty-printed JSON, used for the `NOTES` frame payload.
    pub fn to_pretty_json(&self) -> String {
        serde_json::to_string_pretty(&self.to_json()).unwrap_or_default()
    }

    /// Flatten into speakable text: the answer plus up to 3 numbered
    /// steps plus up to 1 example, templated per target language.
    pub fn to_speakable_text(&self, language: TargetLanguage) -> String {
        let mut parts = vec![self.answer.clone()];
        let steps_header = match language {
            TargetLanguage::En => "Steps:",
            TargetLanguage::Ko => "단계:",
        };
        if !self.steps.is_empty() {
            let mut steps_text = String::from(steps_header);
            for (i, step) in self.steps.iter().take(3).enumerate() {
                steps_text.push_str(&format!(" {}. {}", i + 1, step));
            }
            parts.push(steps_text);
        }
        if let Some(example) = self.examples.first() {
            let example_header = match language {
                TargetLanguage::En => "Example:",
                TargetLanguage::Ko => "예:",
            };
            parts.push(format!("{example_header} {example}"));
        }
        parts.join(" ")
    }
}

/// Strip Markdown code fences, locate the first `{`, scan forward
/// tracking brace depth to find the matching `}`, and parse that
/// substring as JSON. Returns `None` on anything that doesn't look like
/// a single balanced JSON object — never panics on malformed input.
fn extract_json_object(text: &str) -> Option<Value> {
    let raw = text.trim();
    if raw.is_empty() {
        return None;
    }
    let raw = strip_code_fences(raw);

    let start = raw.find('{')?;
    let mut depth: i32 = 0;
    let mut end = None;
    for (idx, ch) in raw.char_indices().skip_while(|(i, _)| *i < start) {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    end = Some(idx);
                    break;
                }
            }
            _ => {}
        }
    }
    let end = end?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&raw[start..=end]).ok()
}

fn strip_code_fences(raw: &str) -> String {
    let mut s = raw;
    if let Some(rest) = s.strip_prefix("```json") {
        s = rest;
    } else if let Some(rest) = s.strip_prefix("```JSON") {
        s = rest;
    } else if let Some(rest) = s.strip_prefix("```") {
        s = rest;
    }
    let s = s.trim_start();
    s.strip_suffix("```").unwrap_or(s).trim().to_string()
}

/// Validate that a JSON value is exactly the required 5-key shape with
/// the right types: `answer` a string, the rest arrays of strings.
fn validate_structured(value: &Value) -> Option<StructuredResponse> {
    let obj = value.as_object()?;
    for key in STRUCTURED_KEYS {
        if !obj.contains_key(key) {
            return None;
        }
    }
    let answer = obj.get("answer")?.as_str()?.to_string();
    let steps = as_string_list(obj, "steps")?;
    let examples = as_string_list(obj, "examples")?;
    let common_mistakes = as_string_list(obj, "common_mistakes")?;
    let next_exercises = as_string_list(obj, "next_exercises")?;
    Some(StructuredResponse {
        answer,
        steps,
        examples,
        common_mistakes,
        next_exercises,
    })
}

fn as_string_list(obj: &Map<String, Value>, key: &str) -> Option<Vec<String>> {
    let arr = obj.get(key)?.as_array()?;
    arr.iter()
        .map(|v| v.as_str().map(str::to_string))
        .collect()
}

/// Parse arbitrary model text into a validated structured response, or
/// `None` if it doesn't parse/validate.
pub fn parse_structured(text: &str) -> Option<StructuredResponse> {
    extract_json_object(text).and_then(|v| validate_structured(&v))
}

/// The canned, always-valid fallback object for a language, used as the
/// terminal step of coercion and whenever the model call itself fails.
pub fn canned_fallback(language: TargetLanguage) -> StructuredResponse {
    match language {
        TargetLanguage::Ko => StructuredResponse {
            answer: "질문을 정확히 이해했는지 확인하고 싶어요. 핵심을 한 문장으로 다시 말해주실래요?"
                .to_string(),
            steps: vec![
                "질문의 핵심 개념을 확인하기".to_string(),
                "주어진 조건 정리하기".to_string(),
                "한 단계씩 풀이하기".to_string(),
            ],
            examples: vec!["예: 2x+3=11 이면 2x=8, x=4".to_string()],
            common_mistakes: vec!["조건을 빠뜨림".to_string(), "계산 부호 실수".to_string()],
            next_exercises: vec![
                "비슷한 문제 2개를 풀어보기".to_string(),
                "풀이 과정을 소리 내어 설명하기".to_string(),
            ],
        },
        TargetLanguage::En => StructuredResponse {
            answer: "I want to make sure I understood your question. Could you restate it in one short sentence?"
                .to_string(),
            steps: vec![
                "Identify the core concept".to_string(),
                "List given constraints".to_string(),
                "Solve one step at a time".to_string(),
            ],
            examples: vec!["Example: if 2x+3=11, then 2x=8, x=4".to_string()],
            common_mistakes: vec![
                "Skipping constraints".to_string(),
                "Sign errors in arithmetic".to_string(),
            ],
            next_exercises: vec![
                "Solve 2 similar problems".to_string(),
                "Explain your steps out loud".to_string(),
            ],
        },
    }
}

/// Deterministically coerce arbitrary model text into the required
/// response schema. Guarantees format compliance even when the model
/// emits malformed JSON — this function cannot itself fail.
pub fn coerce_from_text(text: &str, language: TargetLanguage) -> StructuredResponse {
    let base = canned_fallback(language);
    let raw = text.trim();
    if raw.is_empty() {
        return base;
    }
    if let Some(parsed) = parse_structured(raw) {
        return parsed;
    }

    let cleaned = strip_code_fences(raw);
    let lines: Vec<String> = cleaned
        .lines()
        .map(|ln| ln.trim_matches(|c: char| c == ' ' || c == '-' || c == '\t').to_string())
        .filter(|ln| !ln.is_empty())
        .collect();
    let answer = if let Some(first) = lines.first() {
        first.clone()
    } else {
        cleaned.chars().take(280).collect()
    };
    if answer.is_empty() {
        return base;
    }

    let bullets: Vec<&String> = lines.iter().skip(1).filter(|ln| ln.len() > 3).collect();
    let steps: Vec<String> = bullets.iter().take(3).map(|s| s.to_string()).collect();
    let examples: Vec<String> = bullets
        .iter()
        .filter(|b| b.chars().any(|c| c.is_ascii_digit()))
        .take(3)
        .map(|s| s.to_string())
        .collect();
    let mistakes: Vec<String> = bullets
        .iter()
        .filter(|b| {
            let lower = b.to_lowercase();
            ["mistake", "error", "wrong", "실수"].iter().any(|k| lower.contains(k))
        })
        .map(|s| s.to_string())
        .collect();
    let next_exercises: Vec<String> = bullets
        .iter()
        .filter(|b| {
            let lower = b.to_lowercase();
            ["next", "practice", "exercise", "연습", "다음"]
                .iter()
                .any(|k| lower.contains(k))
        })
        .map(|s| s.to_string())
        .collect();

    StructuredResponse {
        answer,
        steps: if steps.is_empty() { base.steps } else { steps },
        examples: if examples.is_empty() { base.examples } else { examples },
        common_mistakes: if mistakes.is_empty() { base.common_mistakes } else { mistakes },
        next_exercises: if next_exercises.is_empty() { base.next_exercises } else { next_exercises },
    }
}

/// System prompt instructing the model to emit bare structured JSON.
pub fn structured_system_prompt(language: TargetLanguage, translator_mode: bool) -> String {
    let lang_name = match language {
        TargetLanguage::Ko => "Korean (존댓말)",
        TargetLanguage::En => "English",
    };
    let translator = if translator_mode {
        "Translator mode is enabled. If user language differs from target output language, briefly interpret intent first."
    } else {
        "Translator mode is disabled."
    };
    format!(
        "You are a realtime tutor. Always answer in {lang_name}. {translator} \
         Return ONLY valid JSON with keys: answer, steps, examples, common_mistakes, next_exercises. \
         Do not include markdown, code fences, backticks, or prose before/after JSON. \
         Keep answer concise and practical."
    )
}

/// Enforce the structured-output contract on a turn's raw model text:
/// if it already validates, accept it; otherwise, when
/// `strict_structured_mode` is set, run up to 2 bounded repair passes
/// against the model; finally fall back to deterministic coercion,
/// which always succeeds.
///
/// `history` is the conversation sent to the model for this turn, used
/// to build each repair request.
pub async fn enforce(
    llm: &LlmAdapter,
    raw_text: &str,
    system_prompt: &str,
    history: &[Message],
    language: TargetLanguage,
    strict_structured_mode: bool,
) -> StructuredResponse {
    if let Some(parsed) = parse_structured(raw_text) {
        return parsed;
    }

    if strict_structured_mode {
        let mut repair_messages: Vec<Message> = history.to_vec();
        repair_messages.push(Message::assistant(vec![super::llm::ContentBlock::Text {
            text: raw_text.to_string(),
        }]));
        repair_messages.push(Message::user(
            "Output MUST be a valid minified JSON object only. Repair the previous answer. \
             Return ONLY strict JSON with keys answer, steps, examples, common_mistakes, \
             next_exercises. No markdown and no code fences.",
        ));

        for _ in 0..2 {
            let options = RequestOptions {
                max_tokens: 300,
                temperature: 0.0,
            };
            let result = llm.create(&repair_messages, &options, &[]).await;
            if let Ok(result) = result {
                if let Some(parsed) = parse_structured(&result.text) {
                    return parsed;
                }
                repair_messages.push(Message::assistant(vec![super::llm::ContentBlock::Text {
                    text: result.text,
                }]));
            }
        }
        let _ = system_prompt;
    }

    coerce_from_text(raw_text, language)
}
