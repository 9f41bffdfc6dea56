//! Reference extraction (pass 1)
//!
//! Finds `ref()`, `source()` and literal `config()` calls in every `{{ }}`
//! and `{% %}` block without evaluating anything. Calls inside conditional
//! branches are extracted too; `{# #}` comments are ignored.

use crate::error::TemplateError;
use minijinja::Environment;
use serde::{Deserialize, Serialize};
use std::fmt;

/// `ref('name')` or `ref('package', 'name')`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RefCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package: Option<String>,
    pub name: String,
}

impl RefCall {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            package: None,
            name: name.into(),
        }
    }

    pub fn qualified(package: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            package: Some(package.into()),
            name: name.into(),
        }
    }
}

impl fmt::Display for RefCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.package {
            Some(package) => write!(f, "ref('{}', '{}')", package, self.name),
            None => write!(f, "ref('{}')", self.name),
        }
    }
}

/// `source('source', 'table')`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceCall {
    pub source: String,
    pub table: String,
}

impl SourceCall {
    pub fn new(source: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for SourceCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "source('{}', '{}')", self.source, self.table)
    }
}

/// Everything pass 1 learned about a body
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    /// Model references in order of first appearance, deduplicated
    pub refs: Vec<RefCall>,

    /// Source references in order of first appearance, deduplicated
    pub sources: Vec<SourceCall>,

    /// Literal keyword arguments of `config()` calls, later calls win
    pub config: serde_json::Map<String, serde_json::Value>,

    /// `ref`/`source` calls whose arguments are not literals
    pub dynamic_calls: Vec<String>,
}

impl Extraction {
    pub fn has_config(&self) -> bool {
        !self.config.is_empty()
    }
}

/// Check that a body parses as a template (no evaluation)
pub fn validate_syntax(node: &str, body: &str) -> Result<(), TemplateError> {
    let env = Environment::new();
    env.template_from_str(body)
        .map(|_| ())
        .map_err(|e| TemplateError::Syntax {
            node: node.to_string(),
            message: e.to_string(),
            line: e.line(),
        })
}

/// Run pass 1 over a body: syntax check plus call extraction
pub fn extract(node: &str, body: &str) -> Result<Extraction, TemplateError> {
    validate_syntax(node, body)?;
    Ok(scan(body))
}

/// Scan template blocks for reference and config calls
pub fn scan(body: &str) -> Extraction {
    let mut extraction = Extraction::default();

    for block in blocks(body) {
        let tokens = tokenize(block);
        collect_calls(&tokens, &mut extraction);
    }

    extraction
}

/// Contents of `{{ }}` and `{% %}` blocks, skipping `{# #}` comments
fn blocks(body: &str) -> Vec<&str> {
    let mut blocks = Vec::new();
    let mut rest = body;

    while let Some(open) = rest.find('{') {
        let after = &rest[open + 1..];
        let close = match after.chars().next() {
            Some('{') => "}}",
            Some('%') => "%}",
            Some('#') => "#}",
            _ => {
                rest = after;
                continue;
            }
        };

        let inner = &after[1..];
        let Some(end) = inner.find(close) else {
            break;
        };

        if close != "#}" {
            blocks.push(&inner[..end]);
        }
        rest = &inner[end + close.len()..];
    }

    blocks
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Number(String),
    Punct(char),
}

fn tokenize(src: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut chars = src.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == '\'' || c == '"' {
            chars.next();
            let mut value = String::new();
            while let Some(ch) = chars.next() {
                match ch {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    ch if ch == c => break,
                    ch => value.push(ch),
                }
            }
            tokens.push(Token::Str(value));
        } else if c.is_ascii_digit() {
            let mut value = String::new();
            while let Some(&ch) = chars.peek() {
                if ch.is_ascii_digit() || ch == '.' || ch == '_' {
                    value.push(ch);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(Token::Number(value));
        } else if c.is_alphabetic() || c == '_' {
            let mut value = String::new();
            while let Some(&ch) = chars.peek() {
                if ch.is_alphanumeric() || ch == '_' {
                    value.push(ch);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(Token::Ident(value));
        } else {
            tokens.push(Token::Punct(c));
            chars.next();
        }
    }

    tokens
}

#[derive(Default)]
struct Args {
    positional: Vec<serde_json::Value>,
    keywords: Vec<(String, serde_json::Value)>,
}

fn collect_calls(tokens: &[Token], extraction: &mut Extraction) {
    let mut i = 0;

    while i < tokens.len() {
        let is_call = matches!(&tokens[i], Token::Ident(name) if matches!(name.as_str(), "ref" | "source" | "config"))
            && tokens.get(i + 1) == Some(&Token::Punct('('))
            && (i == 0 || tokens[i - 1] != Token::Punct('.'));

        if !is_call {
            i += 1;
            continue;
        }

        let Token::Ident(function) = &tokens[i] else {
            i += 1;
            continue;
        };

        let (args, next) = parse_args(tokens, i + 2);
        i = next;

        match (function.as_str(), args) {
            ("ref", Some(args)) => match positional_strings(&args).as_deref() {
                Some([name]) => push_unique(&mut extraction.refs, RefCall::new(name.clone())),
                Some([package, name]) => {
                    push_unique(&mut extraction.refs, RefCall::qualified(package.clone(), name.clone()))
                }
                _ => extraction.dynamic_calls.push("ref".to_string()),
            },
            ("source", Some(args)) => match positional_strings(&args).as_deref() {
                Some([source, table]) => {
                    push_unique(&mut extraction.sources, SourceCall::new(source.clone(), table.clone()))
                }
                _ => extraction.dynamic_calls.push("source".to_string()),
            },
            ("config", Some(args)) => {
                for (key, value) in args.keywords {
                    extraction.config.insert(key, value);
                }
            }
            (function, None) => {
                if function != "config" {
                    extraction.dynamic_calls.push(function.to_string());
                }
            }
            _ => {}
        }
    }
}

fn push_unique<T: PartialEq>(items: &mut Vec<T>, item: T) {
    if !items.contains(&item) {
        items.push(item);
    }
}

fn positional_strings(args: &Args) -> Option<Vec<String>> {
    args.positional
        .iter()
        .map(|v| v.as_str().map(str::to_string))
        .collect()
}

/// Parse literal call arguments starting after `(`
///
/// Returns `None` for arguments that need evaluation, along with the
/// index just past the closing parenthesis.
fn parse_args(tokens: &[Token], start: usize) -> (Option<Args>, usize) {
    let mut args = Args::default();
    let mut j = start;

    if tokens.get(j) == Some(&Token::Punct(')')) {
        return (Some(args), j + 1);
    }

    loop {
        let keyword = match (tokens.get(j), tokens.get(j + 1), tokens.get(j + 2)) {
            (Some(Token::Ident(key)), Some(Token::Punct('=')), next) if next != Some(&Token::Punct('=')) => {
                Some(key.clone())
            }
            _ => None,
        };
        if keyword.is_some() {
            j += 2;
        }

        let Some((value, next)) = parse_literal(tokens, j) else {
            return (None, skip_call(tokens, j));
        };
        j = next;

        match keyword {
            Some(key) => args.keywords.push((key, value)),
            None => args.positional.push(value),
        }

        match tokens.get(j) {
            Some(Token::Punct(',')) => {
                j += 1;
                // Trailing comma
                if tokens.get(j) == Some(&Token::Punct(')')) {
                    return (Some(args), j + 1);
                }
            }
            Some(Token::Punct(')')) => return (Some(args), j + 1),
            _ => return (None, skip_call(tokens, j)),
        }
    }
}

fn parse_literal(tokens: &[Token], j: usize) -> Option<(serde_json::Value, usize)> {
    use serde_json::Value;

    match tokens.get(j)? {
        Token::Str(s) => Some((Value::String(s.clone()), j + 1)),
        Token::Number(n) => Some((parse_number(n, false)?, j + 1)),
        Token::Punct('-') => match tokens.get(j + 1)? {
            Token::Number(n) => Some((parse_number(n, true)?, j + 2)),
            _ => None,
        },
        Token::Ident(ident) => match ident.as_str() {
            "true" | "True" => Some((Value::Bool(true), j + 1)),
            "false" | "False" => Some((Value::Bool(false), j + 1)),
            "none" | "None" => Some((Value::Null, j + 1)),
            _ => None,
        },
        Token::Punct('[') => {
            let mut items = Vec::new();
            let mut k = j + 1;
            loop {
                if tokens.get(k) == Some(&Token::Punct(']')) {
                    return Some((Value::Array(items), k + 1));
                }
                let (item, next) = parse_literal(tokens, k)?;
                items.push(item);
                k = next;
                match tokens.get(k)? {
                    Token::Punct(',') => k += 1,
                    Token::Punct(']') => return Some((Value::Array(items), k + 1)),
                    _ => return None,
                }
            }
        }
        _ => None,
    }
}

fn parse_number(raw: &str, negative: bool) -> Option<serde_json::Value> {
    let cleaned = raw.replace('_', "");
    let signed = if negative { format!("-{}", cleaned) } else { cleaned };

    if let Ok(int) = signed.parse::<i64>() {
        return Some(serde_json::Value::from(int));
    }
    signed
        .parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(serde_json::Value::Number)
}

/// Index just past the parenthesis closing the current call
fn skip_call(tokens: &[Token], mut j: usize) -> usize {
    let mut depth = 1usize;
    while let Some(token) = tokens.get(j) {
        match token {
            Token::Punct('(') => depth += 1,
            Token::Punct(')') => {
                depth -= 1;
                if depth == 0 {
                    return j + 1;
                }
            }
            _ => {}
        }
        j += 1;
    }
    j
}
