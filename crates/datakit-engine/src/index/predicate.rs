//! Query predicates over index records.
//!
//! Grammar (keywords are case-insensitive, string comparison is not):
//!
//! ```text
//! predicate := condition ( AND condition )*
//! condition := field op literal
//!            | field LIKE string
//!            | field IN ( literal ( , literal )* )
//! op        := = | == | != | <> | < | <= | > | >=
//! literal   := number | 'string' | "string" | true | false
//! ```
//!
//! `LIKE` patterns use `%` for any run of characters and `_` for exactly one.

use std::cmp::Ordering;
use std::fmt;

use datakit_types::index::EpisodeIndexRecord;
use regex::Regex;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PredicateError {
    #[error("syntax error at offset {offset}: {message}")]
    Syntax { offset: usize, message: String },
    #[error("unknown field '{0}'")]
    UnknownField(String),
    #[error("field '{field}' expects a {expected} value")]
    TypeMismatch { field: String, expected: &'static str },
}

fn syntax(offset: usize, message: impl Into<String>) -> PredicateError {
    PredicateError::Syntax {
        offset,
        message: message.into(),
    }
}

// ---------------------------------------------------------------------------
// Fields
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Text,
    Integer,
    Float,
    Boolean,
}

impl Kind {
    fn name(self) -> &'static str {
        match self {
            Self::Text => "string",
            Self::Integer => "integer",
            Self::Float => "numeric",
            Self::Boolean => "boolean",
        }
    }
}

/// A queryable index field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    EpisodeId,
    DatasetId,
    SourceEpisodeIndex,
    Invalid,
    NumSteps,
    TaskId,
    TaskText,
    RobotId,
    Split,
    DurationSecs,
    CameraSet,
    ActionSpaceType,
    SourceUri,
    ShardId,
}

impl Field {
    pub const ALL: [Self; 14] = [
        Self::EpisodeId,
        Self::DatasetId,
        Self::SourceEpisodeIndex,
        Self::Invalid,
        Self::NumSteps,
        Self::TaskId,
        Self::TaskText,
        Self::RobotId,
        Self::Split,
        Self::DurationSecs,
        Self::CameraSet,
        Self::ActionSpaceType,
        Self::SourceUri,
        Self::ShardId,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EpisodeId => "episode_id",
            Self::DatasetId => "dataset_id",
            Self::SourceEpisodeIndex => "source_episode_index",
            Self::Invalid => "invalid",
            Self::NumSteps => "num_steps",
            Self::TaskId => "task_id",
            Self::TaskText => "task_text",
            Self::RobotId => "robot_id",
            Self::Split => "split",
            Self::DurationSecs => "duration_secs",
            Self::CameraSet => "camera_set",
            Self::ActionSpaceType => "action_space_type",
            Self::SourceUri => "source_uri",
            Self::ShardId => "shard_id",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.as_str() == raw)
    }

    fn kind(self) -> Kind {
        match self {
            Self::EpisodeId
            | Self::DatasetId
            | Self::TaskText
            | Self::RobotId
            | Self::Split
            | Self::CameraSet
            | Self::ActionSpaceType
            | Self::SourceUri => Kind::Text,
            Self::SourceEpisodeIndex | Self::NumSteps | Self::TaskId | Self::ShardId => Kind::Integer,
            Self::DurationSecs => Kind::Float,
            Self::Invalid => Kind::Boolean,
        }
    }

    fn value<'r>(self, record: &'r EpisodeIndexRecord) -> FieldValue<'r> {
        match self {
            Self::EpisodeId => FieldValue::Text(&record.episode_id),
            Self::DatasetId => FieldValue::Text(&record.dataset_id),
            Self::TaskText => FieldValue::Text(&record.task_text),
            Self::RobotId => FieldValue::Text(&record.robot_id),
            Self::Split => FieldValue::Text(&record.split),
            Self::CameraSet => FieldValue::Text(&record.camera_set),
            Self::ActionSpaceType => FieldValue::Text(&record.action_space_type),
            Self::SourceUri => FieldValue::Text(&record.source_uri),
            Self::SourceEpisodeIndex => FieldValue::Integer(i128::from(record.source_episode_index)),
            Self::NumSteps => FieldValue::Integer(i128::from(record.num_steps)),
            Self::TaskId => FieldValue::Integer(i128::from(record.task_id)),
            Self::ShardId => FieldValue::Integer(i128::from(record.data.shard_id)),
            Self::DurationSecs => FieldValue::Float(record.duration_secs),
            Self::Invalid => FieldValue::Boolean(record.invalid),
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

enum FieldValue<'r> {
    Text(&'r str),
    Integer(i128),
    Float(f64),
    Boolean(bool),
}

/// A literal on the right-hand side of a condition.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Text(String),
    Integer(i128),
    Float(f64),
    Boolean(bool),
}

impl Literal {
    fn fits(&self, kind: Kind) -> bool {
        matches!(
            (self, kind),
            (Self::Text(_), Kind::Text)
                | (Self::Integer(_) | Self::Float(_), Kind::Integer | Kind::Float)
                | (Self::Boolean(_), Kind::Boolean)
        )
    }

    #[allow(clippy::cast_precision_loss)]
    fn compare(&self, value: &FieldValue<'_>) -> Option<Ordering> {
        match (value, self) {
            (FieldValue::Text(v), Self::Text(l)) => Some((*v).cmp(l.as_str())),
            (FieldValue::Integer(v), Self::Integer(l)) => Some(v.cmp(l)),
            (FieldValue::Integer(v), Self::Float(l)) => (*v as f64).partial_cmp(l),
            (FieldValue::Float(v), Self::Float(l)) => v.partial_cmp(l),
            (FieldValue::Float(v), Self::Integer(l)) => v.partial_cmp(&(*l as f64)),
            (FieldValue::Boolean(v), Self::Boolean(l)) => Some(v.cmp(l)),
            _ => None,
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => write!(f, "'{}'", s.replace('\'', "''")),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Boolean(b) => write!(f, "{b}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Conditions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    fn holds(self, ordering: Ordering) -> bool {
        match self {
            Self::Eq => ordering == Ordering::Equal,
            Self::Ne => ordering != Ordering::Equal,
            Self::Lt => ordering == Ordering::Less,
            Self::Le => ordering != Ordering::Greater,
            Self::Gt => ordering == Ordering::Greater,
            Self::Ge => ordering != Ordering::Less,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Condition {
    Compare { field: Field, op: CmpOp, value: Literal },
    Like { field: Field, pattern: String, regex: Regex },
    In { field: Field, values: Vec<Literal> },
}

impl Condition {
    fn matches(&self, record: &EpisodeIndexRecord) -> bool {
        match self {
            Self::Compare { field, op, value } => {
                // NaN and mismatched kinds never match, `!=` included.
                value
                    .compare(&field.value(record))
                    .is_some_and(|ordering| op.holds(ordering))
            }
            Self::Like { field, regex, .. } => match field.value(record) {
                FieldValue::Text(text) => regex.is_match(text),
                _ => false,
            },
            Self::In { field, values } => {
                let actual = field.value(record);
                values
                    .iter()
                    .any(|v| v.compare(&actual) == Some(Ordering::Equal))
            }
        }
    }

    #[must_use]
    pub fn field(&self) -> Field {
        match self {
            Self::Compare { field, .. } | Self::Like { field, .. } | Self::In { field, .. } => *field,
        }
    }
}

fn like_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push_str("(?s)^");
    let mut literal = String::new();
    for c in pattern.chars() {
        match c {
            '%' | '_' => {
                re.push_str(&regex::escape(&literal));
                literal.clear();
                re.push_str(if c == '%' { ".*" } else { "." });
            }
            other => literal.push(other),
        }
    }
    re.push_str(&regex::escape(&literal));
    re.push('$');
    Regex::new(&re)
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Text(String),
    Number(String),
    Op(CmpOp),
    LParen,
    RParen,
    Comma,
}

fn tokenize(input: &str) -> Result<Vec<(usize, Token)>, PredicateError> {
    let chars: Vec<(usize, char)> = input.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let (offset, c) = chars[i];
        let next = chars.get(i + 1).map(|(_, c)| *c);
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push((offset, Token::LParen));
                i += 1;
            }
            ')' => {
                tokens.push((offset, Token::RParen));
                i += 1;
            }
            ',' => {
                tokens.push((offset, Token::Comma));
                i += 1;
            }
            '=' => {
                tokens.push((offset, Token::Op(CmpOp::Eq)));
                i += if next == Some('=') { 2 } else { 1 };
            }
            '!' if next == Some('=') => {
                tokens.push((offset, Token::Op(CmpOp::Ne)));
                i += 2;
            }
            '<' => {
                let (op, width) = match next {
                    Some('=') => (CmpOp::Le, 2),
                    Some('>') => (CmpOp::Ne, 2),
                    _ => (CmpOp::Lt, 1),
                };
                tokens.push((offset, Token::Op(op)));
                i += width;
            }
            '>' => {
                let (op, width) = if next == Some('=') { (CmpOp::Ge, 2) } else { (CmpOp::Gt, 1) };
                tokens.push((offset, Token::Op(op)));
                i += width;
            }
            '\'' | '"' => {
                let quote = c;
                let mut text = String::new();
                i += 1;
                loop {
                    let Some(&(_, ch)) = chars.get(i) else {
                        return Err(syntax(offset, "unterminated string literal"));
                    };
                    i += 1;
                    if ch == quote {
                        // A doubled quote is an escaped quote.
                        if chars.get(i).map(|(_, c)| *c) == Some(quote) {
                            text.push(quote);
                            i += 1;
                            continue;
                        }
                        break;
                    }
                    text.push(ch);
                }
                tokens.push((offset, Token::Text(text)));
            }
            c if c.is_ascii_digit() || ((c == '-' || c == '.') && next.is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while let Some(&(_, ch)) = chars.get(i) {
                    let exponent_sign = (ch == '-' || ch == '+')
                        && matches!(chars.get(i - 1).map(|(_, c)| *c), Some('e' | 'E'));
                    if ch.is_ascii_digit() || ch == '.' || ch == 'e' || ch == 'E' || exponent_sign {
                        i += 1;
                    } else {
                        break;
                    }
                }
                let text: String = chars[start..i].iter().map(|(_, c)| *c).collect();
                tokens.push((offset, Token::Number(text)));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while chars
                    .get(i)
                    .is_some_and(|(_, ch)| ch.is_alphanumeric() || *ch == '_' || *ch == '.')
                {
                    i += 1;
                }
                let text: String = chars[start..i].iter().map(|(_, c)| *c).collect();
                tokens.push((offset, Token::Ident(text)));
            }
            other => return Err(syntax(offset, format!("unexpected character '{other}'"))),
        }
    }
    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    len: usize,
}

impl Parser {
    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map_or(self.len, |(o, _)| *o)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        self.pos += 1;
        token
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn keyword(&self, word: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(w)) if w.eq_ignore_ascii_case(word))
    }

    fn literal(&mut self) -> Result<Literal, PredicateError> {
        let offset = self.offset();
        match self.next() {
            Some(Token::Text(s)) => Ok(Literal::Text(s)),
            Some(Token::Number(n)) => {
                if let Ok(i) = n.parse::<i128>() {
                    Ok(Literal::Integer(i))
                } else {
                    n.parse::<f64>()
                        .map(Literal::Float)
                        .map_err(|_| syntax(offset, format!("invalid number '{n}'")))
                }
            }
            Some(Token::Ident(w)) if w.eq_ignore_ascii_case("true") => Ok(Literal::Boolean(true)),
            Some(Token::Ident(w)) if w.eq_ignore_ascii_case("false") => Ok(Literal::Boolean(false)),
            Some(other) => Err(syntax(offset, format!("expected a literal, found {other:?}"))),
            None => Err(syntax(offset, "expected a literal, found end of input")),
        }
    }

    fn checked(field: Field, literal: Literal) -> Result<Literal, PredicateError> {
        if literal.fits(field.kind()) {
            Ok(literal)
        } else {
            Err(PredicateError::TypeMismatch {
                field: field.as_str().to_string(),
                expected: field.kind().name(),
            })
        }
    }

    fn condition(&mut self) -> Result<Condition, PredicateError> {
        let offset = self.offset();
        let name = match self.next() {
            Some(Token::Ident(name)) => name,
            Some(other) => return Err(syntax(offset, format!("expected a field name, found {other:?}"))),
            None => return Err(syntax(offset, "expected a field name, found end of input")),
        };
        let field = Field::parse(&name).ok_or(PredicateError::UnknownField(name))?;

        if self.keyword("like") {
            self.pos += 1;
            let offset = self.offset();
            let Some(Token::Text(pattern)) = self.next() else {
                return Err(syntax(offset, "LIKE expects a string pattern"));
            };
            if field.kind() != Kind::Text {
                return Err(PredicateError::TypeMismatch {
                    field: field.as_str().to_string(),
                    expected: Kind::Text.name(),
                });
            }
            let regex = like_regex(&pattern).map_err(|e| syntax(offset, e.to_string()))?;
            return Ok(Condition::Like { field, pattern, regex });
        }

        if self.keyword("in") {
            self.pos += 1;
            let offset = self.offset();
            if self.next() != Some(Token::LParen) {
                return Err(syntax(offset, "IN expects a parenthesised list"));
            }
            let mut values = vec![Self::checked(field, self.literal()?)?];
            loop {
                let offset = self.offset();
                match self.next() {
                    Some(Token::Comma) => values.push(Self::checked(field, self.literal()?)?),
                    Some(Token::RParen) => break,
                    _ => return Err(syntax(offset, "expected ',' or ')' in IN list")),
                }
            }
            return Ok(Condition::In { field, values });
        }

        let offset = self.offset();
        let Some(Token::Op(op)) = self.next() else {
            return Err(syntax(offset, format!("expected an operator after '{field}'")));
        };
        let value = Self::checked(field, self.literal()?)?;
        if field.kind() == Kind::Boolean && !matches!(op, CmpOp::Eq | CmpOp::Ne) {
            return Err(syntax(offset, format!("'{field}' only supports = and !=")));
        }
        Ok(Condition::Compare { field, op, value })
    }
}

// ---------------------------------------------------------------------------
// Predicate
// ---------------------------------------------------------------------------

/// A conjunction of conditions, evaluated left to right.
#[derive(Debug, Clone)]
pub struct Predicate {
    source: String,
    conditions: Vec<Condition>,
}

impl Predicate {
    /// The predicate that matches every record.
    #[must_use]
    pub fn all() -> Self {
        Self {
            source: String::new(),
            conditions: Vec::new(),
        }
    }

    /// # Errors
    ///
    /// Fails on malformed input, on fields the index does not have, and on
    /// literals of the wrong kind for their field.
    pub fn parse(input: &str) -> Result<Self, PredicateError> {
        let tokens = tokenize(input)?;
        if tokens.is_empty() {
            return Err(syntax(0, "empty predicate"));
        }
        let mut parser = Parser {
            tokens,
            pos: 0,
            len: input.len(),
        };
        let mut conditions = vec![parser.condition()?];
        while parser.peek().is_some() {
            if !parser.keyword("and") {
                return Err(syntax(parser.offset(), "expected AND between conditions"));
            }
            parser.pos += 1;
            conditions.push(parser.condition()?);
        }
        Ok(Self {
            source: input.trim().to_string(),
            conditions,
        })
    }

    #[must_use]
    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    #[must_use]
    pub fn is_all(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Evaluate against one record; stops at the first failing condition.
    #[must_use]
    pub fn matches(&self, record: &EpisodeIndexRecord) -> bool {
        self.conditions.iter().all(|c| c.matches(record))
    }

    /// The episode id pinned by an `episode_id = '...'` condition, if any.
    #[must_use]
    pub fn pinned_episode_id(&self) -> Option<&str> {
        self.conditions.iter().find_map(|c| match c {
            Condition::Compare {
                field: Field::EpisodeId,
                op: CmpOp::Eq,
                value: Literal::Text(id),
            } => Some(id.as_str()),
            _ => None,
        })
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_all() {
            f.write_str("<all>")
        } else {
            f.write_str(&self.source)
        }
    }
}

impl std::str::FromStr for Predicate {
    type Err = PredicateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
