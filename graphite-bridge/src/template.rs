//! Path templates for write rules.
//!
//! Rules render their output path from a small template language that is
//! source-compatible with the subset of Go's `text/template` used in rule
//! configurations:
//!
//! ```text
//! tmpl_1.{{ .shared | escape }}.{{ .labels.owner }}
//! test.{{ replace .labels.instance ":" "_" }}
//! ```
//!
//! - Text outside `{{ }}` is copied verbatim.
//! - An action holds a pipeline: commands separated by `|`. The value of each
//!   command is passed as the *last* argument of the next one.
//! - A command is a field reference (`.`, `.labels.owner`), a string literal
//!   (`"..."` or `` `...` ``), or a function call with operand arguments.
//! - `{{-` and `-}}` trim whitespace from the adjacent text.
//!
//! Functions are resolved against a fixed table while parsing, so a rule that
//! names an unknown function or passes the wrong number of arguments fails at
//! configuration load rather than at write time. Rendering cannot fail: a
//! missing field renders as the empty string.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::TemplateError;
use crate::escape::{escape, escape_tagged};

/// A parsed template, ready to render.
#[derive(Clone)]
pub struct Template {
    source: String,
    nodes: Vec<Node>,
}

#[derive(Debug, Clone)]
enum Node {
    Text(String),
    Action(Vec<Command>),
}

#[derive(Debug, Clone)]
enum Command {
    Operand(Operand),
    Call { func: Func, args: Vec<Operand> },
}

#[derive(Debug, Clone)]
enum Operand {
    /// Field path below the context root; empty means the root itself.
    Field(Vec<String>),
    Literal(String),
}

/// The template function table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Func {
    Escape,
    EscapeTagged,
    Replace,
    Lower,
    Upper,
    Trim,
}

impl Func {
    fn lookup(name: &str) -> Option<Self> {
        match name {
            "escape" => Some(Self::Escape),
            "escapeTagged" => Some(Self::EscapeTagged),
            "replace" => Some(Self::Replace),
            "lower" => Some(Self::Lower),
            "upper" => Some(Self::Upper),
            "trim" => Some(Self::Trim),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Escape => "escape",
            Self::EscapeTagged => "escapeTagged",
            Self::Replace => "replace",
            Self::Lower => "lower",
            Self::Upper => "upper",
            Self::Trim => "trim",
        }
    }

    fn arity(self) -> usize {
        match self {
            Self::Replace => 3,
            _ => 1,
        }
    }

    /// `args.len()` equals `self.arity()`; the parser guarantees it.
    fn call(self, args: &[String]) -> String {
        match self {
            Self::Escape => String::from_utf8_lossy(&escape(&args[0])).into_owned(),
            Self::EscapeTagged => String::from_utf8_lossy(&escape_tagged(&args[0])).into_owned(),
            Self::Replace => args[0].replace(&args[1], &args[2]),
            Self::Lower => args[0].to_lowercase(),
            Self::Upper => args[0].to_uppercase(),
            Self::Trim => args[0].trim().to_string(),
        }
    }
}

impl Template {
    /// Parses a template.
    ///
    /// # Errors
    ///
    /// Returns [`TemplateError`] on syntax errors, unknown functions, or
    /// functions called with the wrong number of arguments.
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        Ok(Self {
            source: source.to_string(),
            nodes: Parser::new(source).parse()?,
        })
    }

    /// Returns the template source text.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Renders the template against a context.
    ///
    /// Field references walk JSON objects; anything missing along the way
    /// renders as `""`. Non-string leaves render as their JSON text.
    pub fn render(&self, context: &Value) -> String {
        let mut out = String::with_capacity(self.source.len());
        for node in &self.nodes {
            match node {
                Node::Text(text) => out.push_str(text),
                Node::Action(pipeline) => out.push_str(&eval_pipeline(pipeline, context)),
            }
        }
        out
    }
}

impl fmt::Debug for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Template").field(&self.source).finish()
    }
}

impl PartialEq for Template {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl<'de> Deserialize<'de> for Template {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let source = String::deserialize(deserializer)?;
        Self::parse(&source).map_err(serde::de::Error::custom)
    }
}

impl Serialize for Template {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

fn eval_pipeline(pipeline: &[Command], context: &Value) -> String {
    let mut piped: Option<String> = None;
    for command in pipeline {
        let value = match command {
            Command::Operand(operand) => eval_operand(operand, context),
            Command::Call { func, args } => {
                let mut values: Vec<String> =
                    args.iter().map(|a| eval_operand(a, context)).collect();
                if let Some(prev) = piped.take() {
                    values.push(prev);
                }
                func.call(&values)
            }
        };
        piped = Some(value);
    }
    piped.unwrap_or_default()
}

fn eval_operand(operand: &Operand, context: &Value) -> String {
    match operand {
        Operand::Literal(s) => s.clone(),
        Operand::Field(path) => {
            let mut current = context;
            for segment in path {
                match current.get(segment) {
                    Some(next) => current = next,
                    None => return String::new(),
                }
            }
            value_to_string(current)
        }
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Field(Vec<String>),
    Str(String),
    Ident(String),
    Pipe,
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    fn error(&self, position: usize, reason: impl Into<String>) -> TemplateError {
        TemplateError::Syntax {
            position,
            reason: reason.into(),
        }
    }

    fn parse(mut self) -> Result<Vec<Node>, TemplateError> {
        let mut nodes = Vec::new();
        let mut trim_leading = false;

        loop {
            let rest = &self.src[self.pos..];
            let Some(open) = rest.find("{{") else {
                push_text(&mut nodes, rest, trim_leading, false);
                return Ok(nodes);
            };

            let action_start = self.pos + open;
            let mut body = action_start + 2;
            let trim_trailing = self.src[body..].starts_with("- ");
            if trim_trailing {
                body += 2;
            }
            push_text(&mut nodes, &rest[..open], trim_leading, trim_trailing);

            let (tokens, end, trim_next) = self.lex_action(body)?;
            nodes.push(Node::Action(self.parse_pipeline(tokens, action_start)?));
            self.pos = end;
            trim_leading = trim_next;
        }
    }

    /// Lexes one action body starting at `start`; returns the tokens, the
    /// byte offset just past the closing `}}`, and whether it was `-}}`.
    fn lex_action(&self, start: usize) -> Result<(Vec<Token>, usize, bool), TemplateError> {
        let bytes = self.src.as_bytes();
        let mut tokens = Vec::new();
        let mut i = start;
        let mut after_space = true;

        while i < bytes.len() {
            let b = bytes[i];
            if b.is_ascii_whitespace() {
                after_space = true;
                i += 1;
                continue;
            }
            if after_space && self.src[i..].starts_with("-}}") {
                return Ok((tokens, i + 3, true));
            }
            if self.src[i..].starts_with("}}") {
                return Ok((tokens, i + 2, false));
            }
            after_space = false;

            match b {
                b'|' => {
                    tokens.push(Token::Pipe);
                    i += 1;
                }
                b'"' => {
                    let (s, next) = self.lex_quoted(i)?;
                    tokens.push(Token::Str(s));
                    i = next;
                }
                b'`' => {
                    let Some(close) = self.src[i + 1..].find('`') else {
                        return Err(self.error(i, "unterminated raw quoted string"));
                    };
                    tokens.push(Token::Str(self.src[i + 1..i + 1 + close].to_string()));
                    i += close + 2;
                }
                b'.' => {
                    let end = scan_while(bytes, i, |c| c == b'.' || is_ident_byte(c));
                    tokens.push(Token::Field(self.field_path(i, &self.src[i..end])?));
                    i = end;
                }
                c if c.is_ascii_alphabetic() || c == b'_' => {
                    let end = scan_while(bytes, i, is_ident_byte);
                    tokens.push(Token::Ident(self.src[i..end].to_string()));
                    i = end;
                }
                _ => {
                    let c = self.src[i..].chars().next().unwrap_or_default();
                    return Err(self.error(i, format!("unexpected {c:?} in action")));
                }
            }
        }

        Err(self.error(start, "unclosed action"))
    }

    fn lex_quoted(&self, start: usize) -> Result<(String, usize), TemplateError> {
        let bytes = self.src.as_bytes();
        let mut out = Vec::new();
        let mut i = start + 1;
        while i < bytes.len() {
            match bytes[i] {
                b'"' => {
                    let s = String::from_utf8(out)
                        .map_err(|_| self.error(start, "invalid UTF-8 in string"))?;
                    return Ok((s, i + 1));
                }
                b'\\' => {
                    let escaped = match bytes.get(i + 1) {
                        Some(b'n') => b'\n',
                        Some(b't') => b'\t',
                        Some(b'\\') => b'\\',
                        Some(b'"') => b'"',
                        _ => return Err(self.error(i, "invalid escape in string")),
                    };
                    out.push(escaped);
                    i += 2;
                }
                b'\n' => return Err(self.error(i, "newline in string")),
                b => {
                    out.push(b);
                    i += 1;
                }
            }
        }
        Err(self.error(start, "unterminated quoted string"))
    }

    fn field_path(&self, position: usize, raw: &str) -> Result<Vec<String>, TemplateError> {
        if raw == "." {
            return Ok(Vec::new());
        }
        let segments: Vec<String> = raw[1..].split('.').map(str::to_string).collect();
        if segments.iter().any(String::is_empty) {
            return Err(self.error(position, format!("bad field reference {raw:?}")));
        }
        Ok(segments)
    }

    fn parse_pipeline(
        &self,
        tokens: Vec<Token>,
        position: usize,
    ) -> Result<Vec<Command>, TemplateError> {
        let mut commands = Vec::new();
        for (stage, group) in tokens.split(|t| *t == Token::Pipe).enumerate() {
            let Some((head, rest)) = group.split_first() else {
                return Err(self.error(position, "missing value for command"));
            };

            let command = match head {
                Token::Ident(name) => {
                    let func = Func::lookup(name)
                        .ok_or_else(|| TemplateError::UnknownFunction { name: name.clone() })?;
                    let args = rest
                        .iter()
                        .map(|t| self.operand(t, position))
                        .collect::<Result<Vec<_>, _>>()?;
                    let got = args.len() + usize::from(stage > 0);
                    if got != func.arity() {
                        return Err(TemplateError::Arity {
                            name: func.name().to_string(),
                            expected: func.arity(),
                            got,
                        });
                    }
                    Command::Call { func, args }
                }
                operand => {
                    if stage > 0 {
                        return Err(self.error(
                            position,
                            format!("non executable command in pipeline stage {}", stage + 1),
                        ));
                    }
                    if !rest.is_empty() {
                        return Err(self.error(position, "can't give argument to non-function"));
                    }
                    Command::Operand(self.operand(operand, position)?)
                }
            };
            commands.push(command);
        }
        Ok(commands)
    }

    fn operand(&self, token: &Token, position: usize) -> Result<Operand, TemplateError> {
        match token {
            Token::Field(path) => Ok(Operand::Field(path.clone())),
            Token::Str(s) => Ok(Operand::Literal(s.clone())),
            Token::Ident(name) => Err(self.error(
                position,
                format!("function {name:?} used as an argument"),
            )),
            Token::Pipe => Err(self.error(position, "unexpected pipe")),
        }
    }
}

fn push_text(nodes: &mut Vec<Node>, text: &str, trim_leading: bool, trim_trailing: bool) {
    let mut text = text;
    if trim_leading {
        text = text.trim_start();
    }
    if trim_trailing {
        text = text.trim_end();
    }
    if !text.is_empty() {
        nodes.push(Node::Text(text.to_string()));
    }
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

fn scan_while(bytes: &[u8], start: usize, pred: impl Fn(u8) -> bool) -> usize {
    let mut end = start;
    while end < bytes.len() && pred(bytes[end]) {
        end += 1;
    }
    end
}
