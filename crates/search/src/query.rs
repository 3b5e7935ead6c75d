//! Query evaluation interface and the bundled conjunction compiler
//!
//! Searches never interpret query text themselves: a [`QueryCompiler`]
//! turns it into a [`SpanEvaluator`] once per request, and the evaluator is
//! run against every candidate trace body.
//!
//! [`ConjunctionCompiler`] accepts a small subset of the trace query
//! language: `{}` or `{ cond && cond && ... }` where each condition is
//! `attribute op literal`.
//!
//! Attributes: `.key` (span, then resource), `span.key`, `resource.key`,
//! and the intrinsics `name`, `duration`, `status`, `kind`,
//! `rootServiceName`, `rootName`, `traceDuration`.
//!
//! Operators: `= != > >= < <=`. Literals: `"string"`, integers, floats,
//! `true`/`false`, durations (`10ms`, `1.5s`), status and kind words.

use spanstore_core::{
    AttrValue, Error, Resource, Result, Span, SpanKind, StatusCode, Trace, SERVICE_NAME_KEY,
};
use std::cmp::Ordering;
use std::sync::Arc;

/// Compiled query.
pub trait SpanEvaluator: Send + Sync {
    /// Spans of `trace` matching the query, in trace order. A trace matches
    /// when the result is non-empty.
    fn evaluate<'t>(&self, trace: &'t Trace) -> Vec<(&'t Resource, &'t Span)>;
}

/// Turns query text into an evaluator.
pub trait QueryCompiler: Send + Sync {
    /// Compile `query`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] if the query cannot be parsed.
    fn compile(&self, query: &str) -> Result<Arc<dyn SpanEvaluator>>;
}

/// Compiler for `{ a && b && ... }` span conditions.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConjunctionCompiler;

impl QueryCompiler for ConjunctionCompiler {
    fn compile(&self, query: &str) -> Result<Arc<dyn SpanEvaluator>> {
        let tokens = lex(query)?;
        let conditions = Parser { tokens, pos: 0 }.parse()?;
        Ok(Arc::new(Conjunction { conditions }))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Attr {
    Any(String),
    Span(String),
    Resource(String),
    Name,
    Duration,
    Status,
    Kind,
    RootServiceName,
    RootName,
    TraceDuration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl Op {
    fn holds(self, ord: Option<Ordering>) -> bool {
        let Some(ord) = ord else {
            return false;
        };
        match self {
            Op::Eq => ord == Ordering::Equal,
            Op::Ne => ord != Ordering::Equal,
            Op::Gt => ord == Ordering::Greater,
            Op::Ge => ord != Ordering::Less,
            Op::Lt => ord == Ordering::Less,
            Op::Le => ord != Ordering::Greater,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Literal {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Duration(u64),
    Status(StatusCode),
    Kind(SpanKind),
}

#[derive(Debug, Clone, PartialEq)]
struct Condition {
    attr: Attr,
    op: Op,
    value: Literal,
}

struct Conjunction {
    conditions: Vec<Condition>,
}

impl SpanEvaluator for Conjunction {
    fn evaluate<'t>(&self, trace: &'t Trace) -> Vec<(&'t Resource, &'t Span)> {
        trace
            .spans()
            .filter(|(resource, span)| {
                self.conditions
                    .iter()
                    .all(|c| c.matches(trace, resource, span))
            })
            .collect()
    }
}

impl Condition {
    fn matches(&self, trace: &Trace, resource: &Resource, span: &Span) -> bool {
        let ord = match &self.attr {
            Attr::Name => compare_str(&span.name, &self.value),
            Attr::RootServiceName => compare_str(&trace.root_service_name, &self.value),
            Attr::RootName => compare_str(&trace.root_span_name, &self.value),
            Attr::Duration => compare_duration(span.duration_nano(), &self.value),
            Attr::TraceDuration => compare_duration(trace.duration_nano, &self.value),
            Attr::Status => match &self.value {
                Literal::Status(s) => Some(eq_ord(span.status_code == *s)),
                _ => None,
            },
            Attr::Kind => match &self.value {
                Literal::Kind(k) => Some(eq_ord(span.kind == *k)),
                _ => None,
            },
            Attr::Span(key) => span_attr(span, key).and_then(|v| compare_value(&v, &self.value)),
            Attr::Resource(key) => {
                resource_attr(resource, key).and_then(|v| compare_value(&v, &self.value))
            }
            Attr::Any(key) => span_attr(span, key)
                .or_else(|| resource_attr(resource, key))
                .and_then(|v| compare_value(&v, &self.value)),
        };
        // Status and kind only support equality.
        if matches!(self.attr, Attr::Status | Attr::Kind)
            && !matches!(self.op, Op::Eq | Op::Ne)
        {
            return false;
        }
        self.op.holds(ord)
    }
}

fn eq_ord(equal: bool) -> Ordering {
    if equal {
        Ordering::Equal
    } else {
        Ordering::Less
    }
}

fn span_attr(span: &Span, key: &str) -> Option<AttrValue> {
    span.attrs
        .iter()
        .find(|a| a.key == key)
        .map(|a| a.value.clone())
}

fn resource_attr(resource: &Resource, key: &str) -> Option<AttrValue> {
    if key == SERVICE_NAME_KEY && !resource.service_name.is_empty() {
        return Some(AttrValue::Str(resource.service_name.clone()));
    }
    resource
        .attrs
        .iter()
        .find(|a| a.key == key)
        .map(|a| a.value.clone())
}

fn compare_str(actual: &str, literal: &Literal) -> Option<Ordering> {
    match literal {
        Literal::Str(s) => Some(actual.cmp(s.as_str())),
        _ => None,
    }
}

fn compare_duration(actual_nanos: u64, literal: &Literal) -> Option<Ordering> {
    match literal {
        Literal::Duration(d) => Some(actual_nanos.cmp(d)),
        Literal::Int(i) if *i >= 0 => Some(actual_nanos.cmp(&(*i as u64))),
        _ => None,
    }
}

fn compare_value(actual: &AttrValue, literal: &Literal) -> Option<Ordering> {
    match (actual, literal) {
        (AttrValue::Str(a), Literal::Str(b)) => Some(a.as_str().cmp(b.as_str())),
        (AttrValue::Int(a), Literal::Int(b)) => Some(a.cmp(b)),
        (AttrValue::Int(a), Literal::Float(b)) => (*a as f64).partial_cmp(b),
        (AttrValue::Double(a), Literal::Float(b)) => a.partial_cmp(b),
        (AttrValue::Double(a), Literal::Int(b)) => a.partial_cmp(&(*b as f64)),
        (AttrValue::Bool(a), Literal::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Open,
    Close,
    And,
    Op(Op),
    Ident(String),
    Str(String),
    Number(String),
}

fn invalid(msg: impl Into<String>) -> Error {
    Error::InvalidArgument(format!("query: {}", msg.into()))
}

fn lex(input: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '{' => {
                tokens.push(Token::Open);
                i += 1;
            }
            '}' => {
                tokens.push(Token::Close);
                i += 1;
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '=' => {
                tokens.push(Token::Op(Op::Eq));
                i += 1;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Op(Op::Ne));
                i += 2;
            }
            '>' | '<' => {
                let eq = chars.get(i + 1) == Some(&'=');
                let op = match (c, eq) {
                    ('>', true) => Op::Ge,
                    ('>', false) => Op::Gt,
                    ('<', true) => Op::Le,
                    _ => Op::Lt,
                };
                tokens.push(Token::Op(op));
                i += if eq { 2 } else { 1 };
            }
            '"' => {
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(invalid("unterminated string")),
                        Some('"') => {
                            i += 1;
                            break;
                        }
                        Some('\\') => {
                            let escaped = chars.get(i + 1).ok_or_else(|| invalid("bad escape"))?;
                            s.push(*escaped);
                            i += 2;
                        }
                        Some(ch) => {
                            s.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit()
                || (c == '-' && chars.get(i + 1).map_or(false, |n| n.is_ascii_digit())) =>
            {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '.') {
                    i += 1;
                }
                tokens.push(Token::Number(chars[start..i].iter().collect()));
            }
            c if c.is_alphabetic() || c == '.' || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '.' || chars[i] == '_')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(invalid(format!("unexpected character '{}'", other))),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn parse(mut self) -> Result<Vec<Condition>> {
        if self.next() != Some(Token::Open) {
            return Err(invalid("expected '{'"));
        }
        let mut conditions = Vec::new();
        if self.tokens.get(self.pos) == Some(&Token::Close) {
            self.pos += 1;
        } else {
            loop {
                conditions.push(self.condition()?);
                match self.next() {
                    Some(Token::And) => continue,
                    Some(Token::Close) => break,
                    _ => return Err(invalid("expected '&&' or '}'")),
                }
            }
        }
        if self.pos < self.tokens.len() {
            return Err(invalid("trailing input after '}'"));
        }
        Ok(conditions)
    }

    fn condition(&mut self) -> Result<Condition> {
        let attr = match self.next() {
            Some(Token::Ident(name)) => parse_attr(&name)?,
            _ => return Err(invalid("expected attribute")),
        };
        let op = match self.next() {
            Some(Token::Op(op)) => op,
            _ => return Err(invalid("expected operator")),
        };
        let value = match self.next() {
            Some(Token::Str(s)) => Literal::Str(s),
            Some(Token::Number(n)) => parse_number(&n)?,
            Some(Token::Ident(word)) => parse_word(&word)?,
            _ => return Err(invalid("expected value")),
        };
        Ok(Condition { attr, op, value })
    }
}

fn parse_attr(name: &str) -> Result<Attr> {
    let attr = match name {
        "name" => Attr::Name,
        "duration" => Attr::Duration,
        "status" => Attr::Status,
        "kind" => Attr::Kind,
        "rootServiceName" => Attr::RootServiceName,
        "rootName" => Attr::RootName,
        "traceDuration" => Attr::TraceDuration,
        _ => {
            if let Some(key) = name.strip_prefix("span.") {
                Attr::Span(key.to_string())
            } else if let Some(key) = name.strip_prefix("resource.") {
                Attr::Resource(key.to_string())
            } else if let Some(key) = name.strip_prefix('.') {
                Attr::Any(key.to_string())
            } else {
                return Err(invalid(format!("unknown attribute '{}'", name)));
            }
        }
    };
    match &attr {
        Attr::Any(k) | Attr::Span(k) | Attr::Resource(k) if k.is_empty() => {
            Err(invalid("empty attribute name"))
        }
        _ => Ok(attr),
    }
}

fn parse_number(text: &str) -> Result<Literal> {
    let split = text
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    if unit.is_empty() {
        if number.contains('.') {
            return number
                .parse::<f64>()
                .map(Literal::Float)
                .map_err(|_| invalid(format!("bad number '{}'", text)));
        }
        return number
            .parse::<i64>()
            .map(Literal::Int)
            .map_err(|_| invalid(format!("bad number '{}'", text)));
    }

    let scale: f64 = match unit {
        "ns" => 1.0,
        "us" | "µs" => 1e3,
        "ms" => 1e6,
        "s" => 1e9,
        "m" => 60e9,
        "h" => 3600e9,
        _ => return Err(invalid(format!("unknown duration unit '{}'", unit))),
    };
    let value: f64 = number
        .parse()
        .map_err(|_| invalid(format!("bad duration '{}'", text)))?;
    if value < 0.0 {
        return Err(invalid(format!("negative duration '{}'", text)));
    }
    Ok(Literal::Duration((value * scale).round() as u64))
}

fn parse_word(word: &str) -> Result<Literal> {
    let literal = match word {
        "true" => Literal::Bool(true),
        "false" => Literal::Bool(false),
        "ok" => Literal::Status(StatusCode::Ok),
        "error" => Literal::Status(StatusCode::Error),
        "unset" => Literal::Status(StatusCode::Unset),
        "unspecified" => Literal::Kind(SpanKind::Unspecified),
        "internal" => Literal::Kind(SpanKind::Internal),
        "server" => Literal::Kind(SpanKind::Server),
        "client" => Literal::Kind(SpanKind::Client),
        "producer" => Literal::Kind(SpanKind::Producer),
        "consumer" => Literal::Kind(SpanKind::Consumer),
        other => return Err(invalid(format!("unknown value '{}'", other))),
    };
    Ok(literal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use spanstore_core::{Attribute, ResourceSpans, ScopeSpans, TraceId};

    fn trace() -> Trace {
        let root = Span {
            span_id: vec![1; 8],
            name: "GET /users".into(),
            kind: SpanKind::Server,
            start_time_unix_nano: 1_000_000_000,
            end_time_unix_nano: 1_250_000_000,
            attrs: vec![Attribute::new("http.status_code", 200i64)],
            ..Default::default()
        };
        let child = Span {
            span_id: vec![2; 8],
            parent_span_id: vec![1; 8],
            name: "SELECT users".into(),
            kind: SpanKind::Client,
            status_code: StatusCode::Error,
            start_time_unix_nano: 1_010_000_000,
            end_time_unix_nano: 1_015_000_000,
            attrs: vec![Attribute::new("db.system", "postgres")],
            ..Default::default()
        };
        Trace::from_resource_spans(
            TraceId::from_slice(&[7; 16]).unwrap(),
            vec![ResourceSpans {
                resource: Resource {
                    service_name: "api".into(),
                    attrs: vec![Attribute::new("region", "eu")],
                },
                scope_spans: vec![ScopeSpans {
                    spans: vec![root, child],
                    ..Default::default()
                }],
            }],
        )
    }

    fn names(query: &str) -> Vec<String> {
        let t = trace();
        let evaluator = ConjunctionCompiler.compile(query).unwrap();
        evaluator
            .evaluate(&t)
            .into_iter()
            .map(|(_, s)| s.name.clone())
            .collect()
    }

    #[test]
    fn test_empty_query_matches_every_span() {
        assert_eq!(names("{}").len(), 2);
        assert_eq!(names("  {  }  ").len(), 2);
    }

    #[test]
    fn test_conjunction_of_conditions() {
        assert_eq!(
            names(r#"{ resource.service.name = "api" && status = error }"#),
            vec!["SELECT users"]
        );
        assert_eq!(names("{ span.http.status_code >= 200 && kind = server }"), vec!["GET /users"]);
        assert_eq!(names(r#"{ .region = "eu" && .db.system = "postgres" }"#).len(), 1);
    }

    #[test]
    fn test_durations() {
        assert_eq!(names("{ duration > 100ms }"), vec!["GET /users"]);
        assert_eq!(names("{ duration <= 5ms }"), vec!["SELECT users"]);
        assert_eq!(names("{ traceDuration = 250ms }").len(), 2);
    }

    #[test]
    fn test_type_mismatch_never_matches() {
        assert!(names(r#"{ span.http.status_code = "200" }"#).is_empty());
        assert!(names(r#"{ span.http.status_code != "200" }"#).is_empty());
        assert!(names("{ .missing = 1 }").is_empty());
        assert!(names("{ status > error }").is_empty());
    }

    #[test]
    fn test_parse_errors_are_invalid_argument() {
        for query in [
            "",
            "{",
            "{ name = }",
            "{ foo = 1 }",
            r#"{ name = "x" } extra"#,
            r#"{ name = "unterminated }"#,
            "{ duration > 5parsecs }",
            "{ name = \"a\" || name = \"b\" }",
        ] {
            let err = ConjunctionCompiler.compile(query).err().unwrap();
            assert!(matches!(err, Error::InvalidArgument(_)), "{}", query);
        }
    }
}
