//! Splits a model reply into reasoning and one action expression.
//!
//! Replies look like `<think>...</think><answer>do(action="Tap", element=[500,120])</answer>`.
//! After the wrapper tags are removed the earliest `do(` or `finish(` is
//! located and its balanced span is taken as the action. Parentheses inside
//! quoted strings do not count, and a backslash escapes the next character.
//!
//! [`parse_action`] then turns the action text into a [`ParsedAction`] with a
//! small recursive-descent argument parser.

use std::fmt;

use thiserror::Error;

const WRAPPER_TAGS: [&str; 4] = ["<think>", "</think>", "<answer>", "</answer>"];
const ACTION_KEYWORDS: [&str; 2] = ["do", "finish"];

/// Reply text with wrapper tags removed and outer whitespace trimmed.
pub fn clean_content(raw: &str) -> String {
    let mut text = raw.to_string();
    for tag in WRAPPER_TAGS {
        text = text.replace(tag, "");
    }
    text.trim().to_string()
}

/// `(thinking, action)` for a raw reply. When no balanced action exists the
/// action is empty and the thinking is the whole cleaned text.
pub fn split_response(raw: &str) -> (String, String) {
    let cleaned = clean_content(raw);
    match find_action(&cleaned) {
        Some((start, end)) => (
            cleaned[..start].trim_end().to_string(),
            cleaned[start..end].to_string(),
        ),
        None => (cleaned, String::new()),
    }
}

/// Byte range of the earliest balanced action expression in `text`.
pub fn find_action(text: &str) -> Option<(usize, usize)> {
    let (start, open) = ACTION_KEYWORDS
        .iter()
        .filter_map(|kw| find_keyword_call(text, kw))
        .min_by_key(|(start, _)| *start)?;
    let close = matching_paren(text, open)?;
    Some((start, close + 1))
}

/// First `keyword` followed by optional whitespace and `(`, not glued to a
/// preceding identifier (`undo(` does not count). Returns (keyword start, paren index).
fn find_keyword_call(text: &str, keyword: &str) -> Option<(usize, usize)> {
    let mut from = 0;
    while let Some(rel) = text[from..].find(keyword) {
        let start = from + rel;
        let after = start + keyword.len();
        let glued = text[..start]
            .chars()
            .next_back()
            .is_some_and(|c| c.is_alphanumeric() || c == '_');
        if !glued {
            let rest = &text[after..];
            let skipped = rest.len() - rest.trim_start().len();
            if rest[skipped..].starts_with('(') {
                return Some((start, after + skipped));
            }
        }
        from = after;
    }
    None
}

/// Index of the `)` matching the `(` at `open`, skipping quoted spans.
fn matching_paren(text: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_single = false;
    let mut in_double = false;
    let mut escaped = false;

    for (i, b) in text.bytes().enumerate().skip(open) {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' => escaped = true,
            b'\'' if !in_double => in_single = !in_single,
            b'"' if !in_single => in_double = !in_double,
            b'(' if !in_single && !in_double => depth += 1,
            b')' if !in_single && !in_double => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Value of `message="..."` in a finish expression, with `\x` escapes resolved.
pub fn extract_finish_message(action: &str) -> Option<String> {
    let mut from = 0;
    let (quote, body_start) = loop {
        let rel = action[from..].find("message")?;
        let start = from + rel;
        let rest = action[start + "message".len()..].trim_start();
        if let Some(value) = rest.strip_prefix('=') {
            let value = value.trim_start();
            if let Some(q) = value.chars().next().filter(|c| *c == '"' || *c == '\'') {
                break (q, action.len() - value.len() + 1);
            }
        }
        from = start + "message".len();
    };

    let mut out = String::new();
    let mut chars = action[body_start..].chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => out.push(chars.next()?),
            c if c == quote => return Some(out),
            c => out.push(c),
        }
    }
    None
}

// ── Structured actions ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    List(Vec<ArgValue>),
    Map(Vec<(String, ArgValue)>),
    /// Unquoted token that is not a number or boolean.
    Word(String),
}

impl ArgValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) | Self::Word(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            Self::Float(f) => Some(f.round() as i64),
            Self::Str(s) | Self::Word(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// `[x, y]`.
    pub fn as_point(&self) -> Option<(i64, i64)> {
        match self {
            Self::List(items) if items.len() == 2 => Some((items[0].as_i64()?, items[1].as_i64()?)),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[ArgValue]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }
}

/// Named arguments of a `do(...)` call, in source order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionArgs(Vec<(String, ArgValue)>);

impl ActionArgs {
    pub fn get(&self, key: &str) -> Option<&ArgValue> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(ArgValue::as_str)
    }

    pub fn point(&self, key: &str) -> Option<(i64, i64)> {
        self.get(key).and_then(ArgValue::as_point)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, ArgValue)> {
        self.0.iter()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedAction {
    Do { name: String, args: ActionArgs },
    Finish { message: String },
}

impl fmt::Display for ParsedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Do { name, .. } => write!(f, "do({name})"),
            Self::Finish { message } => write!(f, "finish({message:?})"),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid action at offset {offset}: {reason}")]
pub struct ActionSyntaxError {
    pub offset: usize,
    pub reason: String,
}

pub fn parse_action(action: &str) -> Result<ParsedAction, ActionSyntaxError> {
    let mut p = ArgParser::new(action);
    p.skip_ws();
    let keyword = p.ident()?;
    let args = p.call_args()?;
    p.skip_ws();
    if !p.at_end() {
        return Err(p.error("trailing text after action"));
    }

    match keyword.as_str() {
        "do" => {
            let name = args
                .str("action")
                .ok_or_else(|| p.error("missing action name"))?
                .to_string();
            Ok(ParsedAction::Do { name, args })
        }
        "finish" => {
            let message = extract_finish_message(action)
                .or_else(|| args.str("message").map(str::to_string))
                .unwrap_or_default();
            Ok(ParsedAction::Finish { message })
        }
        other => Err(p.error(&format!("unknown keyword {other:?}"))),
    }
}

struct ArgParser {
    chars: Vec<char>,
    pos: usize,
}

impl ArgParser {
    fn new(text: &str) -> Self {
        Self {
            chars: text.chars().collect(),
            pos: 0,
        }
    }

    fn error(&self, reason: &str) -> ActionSyntaxError {
        ActionSyntaxError {
            offset: self.pos,
            reason: reason.to_string(),
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, want: char) -> Result<(), ActionSyntaxError> {
        self.skip_ws();
        match self.bump() {
            Some(c) if c == want => Ok(()),
            Some(c) => Err(self.error(&format!("expected {want:?}, found {c:?}"))),
            None => Err(self.error(&format!("expected {want:?}, found end"))),
        }
    }

    /// Consume `sep` if it is next; returns whether it did.
    fn eat(&mut self, sep: char) -> bool {
        self.skip_ws();
        if self.peek() == Some(sep) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn ident(&mut self) -> Result<String, ActionSyntaxError> {
        self.skip_ws();
        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_alphanumeric() || c == '_') {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(self.error("expected identifier"));
        }
        Ok(self.chars[start..self.pos].iter().collect())
    }

    /// `( key = value, ... )`, trailing comma allowed.
    fn call_args(&mut self) -> Result<ActionArgs, ActionSyntaxError> {
        self.expect('(')?;
        let mut args = Vec::new();
        loop {
            if self.eat(')') {
                break;
            }
            let key = self.ident()?;
            self.expect('=')?;
            let value = self.value()?;
            args.push((key, value));
            if !self.eat(',') {
                self.expect(')')?;
                break;
            }
        }
        Ok(ActionArgs(args))
    }

    fn value(&mut self) -> Result<ArgValue, ActionSyntaxError> {
        self.skip_ws();
        match self.peek() {
            Some(q @ ('"' | '\'')) => {
                self.pos += 1;
                self.string(q).map(ArgValue::Str)
            }
            Some('[') => {
                self.pos += 1;
                self.list()
            }
            Some('{') => {
                self.pos += 1;
                self.map()
            }
            Some(_) => self.bare(),
            None => Err(self.error("expected value, found end")),
        }
    }

    fn string(&mut self, quote: char) -> Result<String, ActionSyntaxError> {
        let mut out = String::new();
        loop {
            match self.bump() {
                Some('\\') => match self.bump() {
                    Some(c) => out.push(c),
                    None => return Err(self.error("dangling escape")),
                },
                Some(c) if c == quote => return Ok(out),
                Some(c) => out.push(c),
                None => return Err(self.error("unterminated string")),
            }
        }
    }

    fn list(&mut self) -> Result<ArgValue, ActionSyntaxError> {
        let mut items = Vec::new();
        loop {
            if self.eat(']') {
                break;
            }
            items.push(self.value()?);
            if !self.eat(',') {
                self.expect(']')?;
                break;
            }
        }
        Ok(ArgValue::List(items))
    }

    fn map(&mut self) -> Result<ArgValue, ActionSyntaxError> {
        let mut entries = Vec::new();
        loop {
            if self.eat('}') {
                break;
            }
            self.skip_ws();
            let key = match self.peek() {
                Some(q @ ('"' | '\'')) => {
                    self.pos += 1;
                    self.string(q)?
                }
                _ => self.ident()?,
            };
            if !self.eat(':') {
                self.expect('=')?;
            }
            entries.push((key, self.value()?));
            if !self.eat(',') {
                self.expect('}')?;
                break;
            }
        }
        Ok(ArgValue::Map(entries))
    }

    fn bare(&mut self) -> Result<ArgValue, ActionSyntaxError> {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| !c.is_whitespace() && !matches!(c, ',' | ')' | ']' | '}'))
        {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(self.error("expected value"));
        }
        let token: String = self.chars[start..self.pos].iter().collect();
        Ok(if let Ok(n) = token.parse::<i64>() {
            ArgValue::Int(n)
        } else if let Ok(f) = token.parse::<f64>() {
            ArgValue::Float(f)
        } else {
            match token.as_str() {
                "true" | "True" => ArgValue::Bool(true),
                "false" | "False" => ArgValue::Bool(false),
                _ => ArgValue::Word(token),
            }
        })
    }
}
