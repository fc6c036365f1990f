//! Tool registry (C4): query-gated tool offering and execution.
//!
//! Two built-in tools, `math_solver` and `grammar_check`. Gating runs at
//! two points: an *offer* gate decides whether a tool is advertised to
//! the model for a given query, and an *execute* gate (the same
//! predicate, re-applied) decides whether a requested call actually
//! runs. Argument validation is strict — missing fields, wrong types, or
//! length overflows are rejected before a tool body ever executes.

use serde::Deserialize;
use serde_json::{Value, json};

use super::llm::ToolDefinition;

/// Result of a successful tool call, serialized into a `tool_result`
/// content block by the orchestrator.
pub type ToolOutput = Value;

/// Errors executing or validating a tool call. Always surfaced to the
/// model as a `tool_result` error, never fatal to the turn.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("tool execution failed: {0}")]
    ExecutionFailed(String),
}

#[derive(Debug, Deserialize)]
struct MathSolverArgs {
    expression: String,
}

#[derive(Debug, Deserialize)]
struct GrammarCheckArgs {
    text: String,
    #[serde(default)]
    target_language: Option<String>,
}

/// Keywords that suggest the query wants arithmetic help, independent of
/// the `digit operator digit` pattern below.
const MATH_KEYWORDS: &[&str] = &["solve", "calculate", "equation", "math", "계산", "풀어"];

/// Keywords that suggest the query wants grammar correction.
const GRAMMAR_KEYWORDS: &[&str] = &[
    "grammar",
    "correct my",
    "fix my sentence",
    "is this correct",
    "문법",
    "고쳐",
];

/// Keywords that, combined with translator mode, suggest a rewrite/
/// translation request (which routes through the grammar tool).
const REWRITE_KEYWORDS: &[&str] = &["translate", "rewrite", "번역", "다시 써"];

fn has_math_intent(query: &str) -> bool {
    let q = query.to_lowercase();
    if has_digit_operator_digit(&q) {
        return true;
    }
    MATH_KEYWORDS.iter().any(|k| q.contains(k))
}

/// Mirrors the original's `\d+\s*[+\-*/^]\s*\d+` regex without pulling in
/// a regex dependency for a single fixed pattern.
fn has_digit_operator_digit(q: &str) -> bool {
    let bytes = q.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i].is_ascii_digit() {
            let mut j = i;
            while j < bytes.len() && bytes[j].is_ascii_digit() {
                j += 1;
            }
            let mut k = j;
            while k < bytes.len() && bytes[k] == b' ' {
                k += 1;
            }
            if k < bytes.len() && matches!(bytes[k], b'+' | b'-' | b'*' | b'/' | b'^') {
                let mut m = k + 1;
                while m < bytes.len() && bytes[m] == b' ' {
                    m += 1;
                }
                if m < bytes.len() && bytes[m].is_ascii_digit() {
                    return true;
                }
            }
            i = j;
        } else {
            i += 1;
        }
    }
    false
}

fn has_grammar_intent(query: &str) -> bool {
    let q = query.to_lowercase();
    GRAMMAR_KEYWORDS.iter().any(|k| q.contains(k))
}

fn has_translation_rewrite_intent(query: &str) -> bool {
    let q = query.to_lowercase();
    REWRITE_KEYWORDS.iter().any(|k| q.contains(k))
}

/// Which built-in tools should be offered to the model for this query,
/// given whether translator mode is on.
pub fn available_tools_for_query(query: &str, translator_mode: bool) -> Vec<ToolDefinition> {
    let mut tools = Vec::new();
    if has_math_intent(query) {
        tools.push(math_solver_definition());
    }
    if has_grammar_intent(query) || (translator_mode && has_translation_rewrite_intent(query)) {
        tools.push(grammar_check_definition());
    }
    tools
}

fn math_solver_definition() -> ToolDefinition {
    ToolDefinition {
        name: "math_solver".into(),
        description: "Evaluate a simple arithmetic expression using +, -, *, /, ^ and parentheses."
            .into(),
        parameters: json!({
            "type": "object",
            "properties": {
                "expression": {
                    "type": "string",
                    "description": "The arithmetic expression to evaluate, e.g. \"2 + 3 * 4\"",
                    "minLength": 1,
                    "maxLength": 200
                }
            },
            "required": ["expression"]
        }),
    }
}

fn grammar_check_definition() -> ToolDefinition {
    ToolDefinition {
        name: "grammar_check".into(),
        description: "Check and correct grammar in a short piece of text.".into(),
        parameters: json!({
            "type": "object",
            "properties": {
                "text": {
                    "type": "string",
                    "minLength": 1,
                    "maxLength": 500
                },
                "target_language": {
                    "type": "string"
                }
            },
            "required": ["text"]
        }),
    }
}

/// Execute a tool call by name against its raw JSON arguments. Callers
/// (the orchestrator) are responsible for applying a per-call timeout —
/// this function itself never blocks beyond CPU-bound work.
pub fn execute_tool(name: &str, arguments: &Value) -> Result<ToolOutput, ToolError> {
    match name {
        "math_solver" => execute_math_solver(arguments),
        "grammar_check" => execute_grammar_check(arguments),
        other => Err(ToolError::UnknownTool(other.to_string())),
    }
}

fn execute_math_solver(arguments: &Value) -> Result<ToolOutput, ToolError> {
    let args: MathSolverArgs = serde_json::from_value(arguments.clone())
        .map_err(|e| ToolError::InvalidArguments(e.to_string()))?;
    if args.expression.is_empty() || args.expression.len() > 200 {
        return Err(ToolError::InvalidArguments(
            "expression must be 1-200 characters".into(),
        ));
    }
    let value = eval_expression(&args.expression)
        .map_err(|e| ToolError::ExecutionFailed(format!("could not evaluate expression: {e}")))?;
    let steps = vec![
        format!("Parse \"{}\" into numbers and operators.", args.expression),
        "Apply standard precedence: parentheses, then ^, then * and /, then + and -.".to_string(),
        format!("Result: {value}"),
    ];
    Ok(json!({ "expression": args.expression, "result": value, "steps": steps }))
}

fn execute_grammar_check(arguments: &Value) -> Result<ToolOutput, ToolError> {
    let args: GrammarCheckArgs = serde_json::from_value(arguments.clone())
        .map_err(|e| ToolError::InvalidArguments(e.to_string()))?;
    if args.text.is_empty() || args.text.len() > 500 {
        return Err(ToolError::InvalidArguments(
            "text must be 1-500 characters".into(),
        ));
    }
    let target_language = args.target_language.unwrap_or_else(|| "en".into());
    let (corrected_text, mistakes, explanations) = correct_grammar(&args.text);
    Ok(json!({
        "corrected_text": corrected_text,
        "explanations": explanations,
        "mistakes": mistakes,
        "target_language": target_language,
    }))
}

/// Deterministic, regex-free grammar fixups mirroring the original's
/// pattern-based corrector. Not an LLM call — this must be cheap and
/// side-effect free so it's safe to run inline under the tool timeout.
fn correct_grammar(text: &str) -> (String, Vec<String>, Vec<String>) {
    let mut corrected = text.trim().to_string();
    let mut mistakes = Vec::new();
    let mut explanations = Vec::new();

    let fixups: &[(&str, &str, &str)] = &[
        ("i am agree", "I agree", "\"I am agree\" should be \"I agree\""),
        ("i are", "I am", "\"I are\" should be \"I am\""),
        ("doesn't has", "doesn't have", "\"doesn't has\" should be \"doesn't have\""),
        ("didn't went", "didn't go", "\"didn't went\" should be \"didn't go\""),
        ("more better", "better", "\"more better\" is redundant; use \"better\""),
    ];
    for (pattern, replacement, explanation) in fixups {
        if corrected.to_lowercase().contains(pattern) {
            corrected = replace_case_insensitive(&corrected, pattern, replacement);
            mistakes.push((*pattern).to_string());
            explanations.push((*explanation).to_string());
        }
    }

    corrected = capitalize_first_letter(&corrected);
    if !corrected.ends_with(['.', '!', '?']) && !corrected.is_empty() {
        corrected.push('.');
        explanations.push("Added terminal punctuation.".to_string());
    }

    (corrected, mistakes, explanations)
}

fn replace_case_insensitive(haystack: &str, pattern: &str, replacement: &str) -> String {
    let lower_haystack = haystack.to_lowercase();
    let lower_pattern = pattern.to_lowercase();
    match lower_haystack.find(&lower_pattern) {
        Some(idx) => {
            let end = idx + lower_pattern.len();
            format!("{}{}{}", &haystack[..idx], replacement, &haystack[end..])
        }
        None => haystack.to_string(),
    }
}

fn capitalize_first_letter(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// A safe restricted-expression evaluator: numeric literals and
/// `+ - * / ^` with unary minus and parentheses only. No variables, no
/// function calls, no arbitrary code execution — per the forbidding note
/// in §4.4.
fn eval_expression(expr: &str) -> Result<f64, String> {
    let tokens = tokenize(expr)?;
    let mut parser = ExprParser { tokens: &tokens, pos: 0 };
    let value = parser.parse_expr()?;
    if parser.pos != parser.tokens.len() {
        return Err("trailing characters after expression".into());
    }
    if !value.is_finite() {
        return Err("result is not finite".into());
    }
    Ok(value)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    LParen,
    RParen,
}

fn tokenize(expr: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = expr.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' => i += 1,
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '^' => {
                tokens.push(Token::Caret);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let value = text
                    .parse::<f64>()
                    .map_err(|_| format!("invalid number literal: {text}"))?;
                tokens.push(Token::Number(value));
            }
            other => return Err(format!("unsupported character: {other:?}")),
        }
    }
    Ok(tokens)
}

/// Recursive-descent parser over `+ - * / ^` with standard precedence,
/// unary minus, and parentheses.
struct ExprParser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> ExprParser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn parse_expr(&mut self) -> Result<f64, String> {
        let mut value = self.parse_term()?;
        loop {
            match self.peek() {
                Some(Token::Plus) => {
                    self.pos += 1;
                    value += self.parse_term()?;
                }
                Some(Token::Minus) => {
                    self.pos += 1;
                    value -= self.parse_term()?;
                }
                _ => break,
            }
        }
        Ok(value)
    }

    fn parse_term(&mut self) -> Result<f64, String> {
        let mut value = self.parse_unary()?;
        loop {
            match self.peek() {
                Some(Token::Star) => {
                    self.pos += 1;
                    value *= self.parse_unary()?;
                }
                Some(Token::Slash) => {
                    self.pos += 1;
                    let divisor = self.parse_unary()?;
                    if divisor == 0.0 {
                        return Err("division by zero".into());
                    }
                    value /= divisor;
                }
                _ => break,
            }
        }
        Ok(value)
    }

    /// Unary minus binds *looser* than `^`, matching the usual
    /// mathematical convention (`-2 ^ 2 == -4`, not `4`): a leading sign
    /// wraps the whole power expression rather than just its base.
    fn parse_unary(&mut self) -> Result<f64, String> {
        if matches!(self.peek(), Some(Token::Minus)) {
            self.pos += 1;
            return Ok(-self.parse_unary()?);
        }
        if matches!(self.peek(), Some(Token::Plus)) {
            self.pos += 1;
            return self.parse_unary();
        }
        self.parse_power()
    }

    fn parse_power(&mut self) -> Result<f64, String> {
        let base = self.parse_atom()?;
        if matches!(self.peek(), Some(Token::Caret)) {
            self.pos += 1;
            let exponent = self.parse_unary()?;
            return Ok(base.powf(exponent));
        }
        Ok(base)
    }

    fn parse_atom(&mut self) -> Result<f64, String> {
        match self.peek() {
            Some(Token::Number(n)) => {
                let n = *n;
                self.pos += 1;
                Ok(n)
            }
            Some(Token::LParen) => {
                self.pos += 1;
                let value = self.parse_expr()?;
                match self.peek() {
                    Some(Token::RParen) => {
                        self.pos += 1;
                        Ok(value)
                    }
                    _ => Err("missing closing parenthesis".into()),
                }
            }
            _ => Err("expected a number or '('".into()),
        }
    }
}
