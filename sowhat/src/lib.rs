//! SoWhat note parsing: a stateful lexer over single-line notes, three sub-parsers for
//! formulas, links and reactions, and an assembler that folds the token stream into a
//! structured record.
//!
//! The pipeline is total. Malformed input never fails a call; it surfaces as error tokens
//! collected on the record.

pub mod core {
    use chrono::{DateTime, Utc};
    use serde::Serialize;
    use std::{fmt, ops::Range};

    /* ------------------------------ Token kinds ------------------------------ */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
    #[serde(rename_all = "snake_case")]
    pub enum TokenType {
        Word,
        Space,
        Todo,
        Done,
        Pin,
        Date,
        Folder,
        Tag,
        Mention,
        Cell,
        Event,
        Url,
        Bean,
        LinkOpen,
        Href,
        Title,
        #[serde(rename = "img-src")]
        ImgSrc,
        #[serde(rename = "img-title")]
        ImgTitle,
        FormulaOpen,
        Operator,
        Arg,
        Lparen,
        Rparen,
        ReactionOpen,
        ReactionClose,
        TextBlob,
        Error,
        // Synthesized by the sub-parsers.
        Formula,
        Link,
        Reaction,
    }

    impl TokenType {
        pub fn as_str(self) -> &'static str {
            match self {
                TokenType::Word => "word",
                TokenType::Space => "space",
                TokenType::Todo => "todo",
                TokenType::Done => "done",
                TokenType::Pin => "pin",
                TokenType::Date => "date",
                TokenType::Folder => "folder",
                TokenType::Tag => "tag",
                TokenType::Mention => "mention",
                TokenType::Cell => "cell",
                TokenType::Event => "event",
                TokenType::Url => "url",
                TokenType::Bean => "bean",
                TokenType::LinkOpen => "link_open",
                TokenType::Href => "href",
                TokenType::Title => "title",
                TokenType::ImgSrc => "img-src",
                TokenType::ImgTitle => "img-title",
                TokenType::FormulaOpen => "formula_open",
                TokenType::Operator => "operator",
                TokenType::Arg => "arg",
                TokenType::Lparen => "lparen",
                TokenType::Rparen => "rparen",
                TokenType::ReactionOpen => "reaction_open",
                TokenType::ReactionClose => "reaction_close",
                TokenType::TextBlob => "text_blob",
                TokenType::Error => "error",
                TokenType::Formula => "formula",
                TokenType::Link => "link",
                TokenType::Reaction => "reaction",
            }
        }

        /// Words and whitespace; runs of these merge into a single chunk.
        pub fn is_plain_text(self) -> bool {
            matches!(self, TokenType::Word | TokenType::Space)
        }

        /// Kinds that describe the note rather than belong to its body.
        pub fn is_record_prefix(self) -> bool {
            matches!(
                self,
                TokenType::Date
                    | TokenType::Folder
                    | TokenType::Todo
                    | TokenType::Done
                    | TokenType::Pin
            )
        }
    }

    impl fmt::Display for TokenType {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.as_str())
        }
    }

    /* ------------------------------ Violations ------------------------------ */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
    #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
    pub enum ErrorKind {
        InvalidFolderFormat,
        InvalidTagFormat,
        InvalidMentionFormat,
        InvalidCellFormat,
        InvalidEventFormat,
        InvalidUrlFormat,
        InvalidBeanFormat,
        InvalidReactionFormat,
        InvalidFormulaOpenFormat,
        InvalidFormulaSetupNameFormat,
        InvalidFormulaSetupCloseFormat,
        InvalidFormulaFuncOpenFormat,
        InvalidFormulaFuncOperatorFormat,
        InvalidFormulaFuncFormat,
        InvalidOperatorFormat,
        InvalidFunctionFormat,
        InvalidLinkOpenFormat,
        InvalidLinkSetupFormat,
        InvalidLinkSetupTitleFormat,
        InvalidLinkSetupCloseFormat,
        InvalidLinkImageUrlFormat,
        InvalidLinkImageTitleFormat,
        InvalidLinkImageCloseFormat,
        InvalidDateFormat,
    }

    impl ErrorKind {
        pub fn as_str(self) -> &'static str {
            match self {
                ErrorKind::InvalidFolderFormat => "INVALID_FOLDER_FORMAT",
                ErrorKind::InvalidTagFormat => "INVALID_TAG_FORMAT",
                ErrorKind::InvalidMentionFormat => "INVALID_MENTION_FORMAT",
                ErrorKind::InvalidCellFormat => "INVALID_CELL_FORMAT",
                ErrorKind::InvalidEventFormat => "INVALID_EVENT_FORMAT",
                ErrorKind::InvalidUrlFormat => "INVALID_URL_FORMAT",
                ErrorKind::InvalidBeanFormat => "INVALID_BEAN_FORMAT",
                ErrorKind::InvalidReactionFormat => "INVALID_REACTION_FORMAT",
                ErrorKind::InvalidFormulaOpenFormat => "INVALID_FORMULA_OPEN_FORMAT",
                ErrorKind::InvalidFormulaSetupNameFormat => "INVALID_FORMULA_SETUP_NAME_FORMAT",
                ErrorKind::InvalidFormulaSetupCloseFormat => "INVALID_FORMULA_SETUP_CLOSE_FORMAT",
                ErrorKind::InvalidFormulaFuncOpenFormat => "INVALID_FORMULA_FUNC_OPEN_FORMAT",
                ErrorKind::InvalidFormulaFuncOperatorFormat => {
                    "INVALID_FORMULA_FUNC_OPERATOR_FORMAT"
                }
                ErrorKind::InvalidFormulaFuncFormat => "INVALID_FORMULA_FUNC_FORMAT",
                ErrorKind::InvalidOperatorFormat => "INVALID_OPERATOR_FORMAT",
                ErrorKind::InvalidFunctionFormat => "INVALID_FUNCTION_FORMAT",
                ErrorKind::InvalidLinkOpenFormat => "INVALID_LINK_OPEN_FORMAT",
                ErrorKind::InvalidLinkSetupFormat => "INVALID_LINK_SETUP_FORMAT",
                ErrorKind::InvalidLinkSetupTitleFormat => "INVALID_LINK_SETUP_TITLE_FORMAT",
                ErrorKind::InvalidLinkSetupCloseFormat => "INVALID_LINK_SETUP_CLOSE_FORMAT",
                ErrorKind::InvalidLinkImageUrlFormat => "INVALID_LINK_IMAGE_URL_FORMAT",
                ErrorKind::InvalidLinkImageTitleFormat => "INVALID_LINK_IMAGE_TITLE_FORMAT",
                ErrorKind::InvalidLinkImageCloseFormat => "INVALID_LINK_IMAGE_CLOSE_FORMAT",
                ErrorKind::InvalidDateFormat => "INVALID_DATE_FORMAT",
            }
        }

        /// Fixed human-readable message attached to violations of this kind, if any.
        pub fn default_message(self) -> Option<&'static str> {
            match self {
                ErrorKind::InvalidReactionFormat => Some("Missing end quote."),
                _ => None,
            }
        }
    }

    impl fmt::Display for ErrorKind {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.as_str())
        }
    }

    /// Domain error carried as the value of an error token.
    #[serde_with::skip_serializing_none]
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
    #[error("{kind}: {text:?}")]
    pub struct Violation {
        pub kind: ErrorKind,
        pub text: String,
        pub message: Option<String>,
    }

    impl Violation {
        pub fn new(kind: ErrorKind, text: impl Into<String>) -> Self {
            Self {
                kind,
                text: text.into(),
                message: kind.default_message().map(str::to_owned),
            }
        }

        pub fn with_message(mut self, message: impl Into<String>) -> Self {
            self.message = Some(message.into());
            self
        }
    }

    /* ---------------------------- Value Objects ---------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    pub enum Sign {
        #[serde(rename = "+")]
        Plus,
        #[serde(rename = "-")]
        Minus,
    }

    /// A signed quantity of a symbol: `+coffee:2`.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct Bean {
        pub sign: Sign,
        pub symbol: String,
        pub value: String,
    }

    /// A named measurement with an optional unit: `%weight:72.5,kg`.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct Cell {
        pub symbol: String,
        pub value: String,
        pub unit: Option<String>,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    #[serde(rename_all = "lowercase")]
    pub enum EventForm {
        Open,
        Close,
        Point,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Event {
        pub label: String,
        pub is_range: bool,
        pub form: EventForm,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    #[serde(untagged)]
    pub enum DateValue {
        Instant(DateTime<Utc>),
        Invalid(Violation),
    }

    impl DateValue {
        pub fn instant(&self) -> Option<DateTime<Utc>> {
            match self {
                DateValue::Instant(at) => Some(*at),
                DateValue::Invalid(_) => None,
            }
        }
    }

    /* ------------------------------ Sub-parser nodes ------------------------------ */

    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
    pub struct Formula {
        pub name: Option<String>,
        pub procedure: Option<FuncNode>,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    #[serde(rename_all = "lowercase")]
    pub enum NodeType {
        Func,
        Error,
    }

    /// One parenthesised call `(op arg ...)` of a formula.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct FuncNode {
        #[serde(rename = "type")]
        pub kind: NodeType,
        pub operator: Option<String>,
        pub args: Vec<Arg>,
        pub text: String,
        pub offset: usize,
        pub line: usize,
        pub col: usize,
        pub line_breaks: usize,
        pub error: Option<Violation>,
    }

    impl FuncNode {
        pub fn is_error(&self) -> bool {
            self.kind == NodeType::Error
        }
    }

    /// Call argument. `Skip` is the `-` placeholder and serializes as `null`.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    #[serde(untagged)]
    pub enum Arg {
        Skip,
        Value(String),
        Call(FuncNode),
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
    pub struct Link {
        pub href: Option<String>,
        pub title: Option<String>,
        #[serde(rename = "img-src")]
        pub img_src: Option<String>,
        #[serde(rename = "img-title")]
        pub img_title: Option<String>,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
    pub enum ReactionKind {
        Love,
        Like,
        Dislike,
        Laugh,
        Question,
        Emphasize,
    }

    impl ReactionKind {
        /// Maps an opener such as `Liked “` to its reaction.
        pub fn from_opener(opener: &str) -> Option<Self> {
            let verb = opener.trim_end_matches('“').trim_end().to_uppercase();
            match verb.as_str() {
                "LOVED" => Some(ReactionKind::Love),
                "LIKED" => Some(ReactionKind::Like),
                "DISLIKED" => Some(ReactionKind::Dislike),
                "LAUGHED AT" => Some(ReactionKind::Laugh),
                "QUESTIONED" => Some(ReactionKind::Question),
                "EMPHASIZED" => Some(ReactionKind::Emphasize),
                _ => None,
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct Reaction {
        pub reaction: Option<ReactionKind>,
        pub record: String,
    }

    /* -------------------------------- Tokens -------------------------------- */

    /// Decoded payload of a token.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    #[serde(untagged)]
    pub enum Value {
        Text(String),
        Arg(Option<String>),
        Bean(Bean),
        Cell(Cell),
        Event(Event),
        Date(DateValue),
        Error(Violation),
        Formula(Formula),
        Link(Link),
        Reaction(Reaction),
    }

    impl Value {
        pub fn as_text(&self) -> Option<&str> {
            match self {
                Value::Text(text) => Some(text),
                Value::Arg(arg) => arg.as_deref(),
                _ => None,
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Token {
        #[serde(rename = "type")]
        pub kind: TokenType,
        pub text: String,
        pub value: Value,
        /// Byte offset into the input.
        pub offset: usize,
        pub line: usize,
        /// 1-based, counted in characters.
        pub col: usize,
        pub line_breaks: usize,
    }

    impl Token {
        pub fn span(&self) -> Range<usize> {
            self.offset..self.offset + self.text.len()
        }

        pub fn violation(&self) -> Option<&Violation> {
            match &self.value {
                Value::Error(violation) => Some(violation),
                _ => None,
            }
        }

        /// Builds a node token spanning `parts`, positioned at the first of them.
        pub fn synthesize(kind: TokenType, value: Value, parts: &[Token]) -> Self {
            let (offset, line, col) = parts
                .first()
                .map(|t| (t.offset, t.line, t.col))
                .unwrap_or((0, 1, 1));
            Self {
                kind,
                text: parts.iter().map(|t| t.text.as_str()).collect(),
                value,
                offset,
                line,
                col,
                line_breaks: parts.iter().map(|t| t.line_breaks).sum(),
            }
        }
    }

    /// Outcome of a sub-parser run over a token slice.
    #[derive(Debug, Clone, PartialEq)]
    pub struct Parsed<T> {
        /// Number of tokens folded into `node`.
        pub consumed: usize,
        pub node: T,
        /// The lexer error token that ended the construct, if any.
        pub error: Option<Token>,
    }

    /* --------------------------- Record captures --------------------------- */

    /// A record field entry: the decoded value plus where it came from.
    #[serde_with::skip_serializing_none]
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Capture<T> {
        #[serde(rename = "type")]
        pub kind: TokenType,
        pub value: T,
        pub text: String,
        pub offset: usize,
        pub line: usize,
        pub col: usize,
        pub line_breaks: usize,
        pub error: Option<Violation>,
    }

    impl<T> Capture<T> {
        pub fn new(token: &Token, value: T, error: Option<Violation>) -> Self {
            Self {
                kind: token.kind,
                value,
                text: token.text.clone(),
                offset: token.offset,
                line: token.line,
                col: token.col,
                line_breaks: token.line_breaks,
                error,
            }
        }

        pub fn span(&self) -> Range<usize> {
            self.offset..self.offset + self.text.len()
        }
    }

}

pub mod config {
    //! User settings. Only the TODO/DONE keyword lists are configurable.

    use crate::core::TokenType;
    use serde::{Deserialize, Serialize};
    use std::{fs, path::Path, path::PathBuf};

    #[derive(Debug, thiserror::Error)]
    pub enum ConfigError {
        #[error("failed to read settings from {path:?}")]
        Read {
            path: PathBuf,
            #[source]
            source: std::io::Error,
        },
        #[error("invalid settings: {0}")]
        Json(#[from] serde_json::Error),
        #[error("pattern `{name}` failed to compile: {source}")]
        Pattern {
            name: &'static str,
            #[source]
            source: regex::Error,
        },
        #[error("`{list}` contains an empty keyword")]
        EmptyKeyword { list: &'static str },
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Settings {
        #[serde(default = "Settings::default_todo_keywords")]
        pub todo_keywords: Vec<String>,
        #[serde(default = "Settings::default_done_keywords")]
        pub done_keywords: Vec<String>,
    }

    impl Default for Settings {
        fn default() -> Self {
            Self {
                todo_keywords: Self::default_todo_keywords(),
                done_keywords: Self::default_done_keywords(),
            }
        }
    }

    impl Settings {
        fn default_todo_keywords() -> Vec<String> {
            vec!["todo".to_string()]
        }

        fn default_done_keywords() -> Vec<String> {
            vec!["done".to_string()]
        }

        pub fn from_json_str(input: &str) -> Result<Self, ConfigError> {
            let settings: Settings = serde_json::from_str(input)?;
            settings.validate()?;
            Ok(settings)
        }

        pub fn load(path: &Path) -> Result<Self, ConfigError> {
            let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            Self::from_json_str(&raw)
        }

        pub fn validate(&self) -> Result<(), ConfigError> {
            if self.todo_keywords.iter().any(|k| k.trim().is_empty()) {
                return Err(ConfigError::EmptyKeyword {
                    list: "todo_keywords",
                });
            }
            if self.done_keywords.iter().any(|k| k.trim().is_empty()) {
                return Err(ConfigError::EmptyKeyword {
                    list: "done_keywords",
                });
            }
            Ok(())
        }

        /// Classifies a whole word as TODO or DONE, ignoring case. TODO wins a tie.
        pub fn keyword(&self, word: &str) -> Option<TokenType> {
            let word = word.to_lowercase();
            let matches = |list: &[String]| list.iter().any(|k| k.to_lowercase() == word);
            if matches(&self.todo_keywords) {
                Some(TokenType::Todo)
            } else if matches(&self.done_keywords) {
                Some(TokenType::Done)
            } else {
                None
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn keywords_match_any_case() {
            let s = Settings::default();
            assert_eq!(s.keyword("TODO"), Some(TokenType::Todo));
            assert_eq!(s.keyword("tOdO"), Some(TokenType::Todo));
            assert_eq!(s.keyword("Done"), Some(TokenType::Done));
            assert_eq!(s.keyword("TODOnt"), None);
        }

        #[test]
        fn partial_json_falls_back_to_defaults() {
            let s = Settings::from_json_str(r#"{"todo_keywords": ["later", "next"]}"#).unwrap();
            assert_eq!(s.keyword("NEXT"), Some(TokenType::Todo));
            assert_eq!(s.keyword("todo"), None);
            assert_eq!(s.done_keywords, vec!["done".to_string()]);
        }

        #[test]
        fn rejects_empty_keywords_and_bad_json() {
            assert!(matches!(
                Settings::from_json_str(r#"{"done_keywords": [" "]}"#),
                Err(ConfigError::EmptyKeyword { list: "done_keywords" })
            ));
            assert!(matches!(
                Settings::from_json_str("{"),
                Err(ConfigError::Json(_))
            ));
        }

        #[test]
        fn load_reports_missing_file() {
            let dir = tempfile::tempdir().unwrap();
            let missing = dir.path().join("settings.json");
            assert!(matches!(
                Settings::load(&missing),
                Err(ConfigError::Read { .. })
            ));

            std::fs::write(&missing, r#"{"done_keywords": ["shipped"]}"#).unwrap();
            let s = Settings::load(&missing).unwrap();
            assert_eq!(s.keyword("Shipped"), Some(TokenType::Done));
        }
    }
}

pub mod patterns {
    //! Anchored token patterns. Every pattern is matched at the cursor only.

    use crate::config::ConfigError;
    use once_cell::sync::Lazy;
    use regex::Regex;

    const LEAD: &str = r"[\x{1000}-\x{10FFFF}a-zA-Z$\x{A2}-\x{A5}\x{58F}\x{60B}\x{9F2}\x{9F3}\x{9FB}\x{AF1}\x{BF9}\x{E3F}]";
    const TAIL: &str = r"[\x{1000}-\x{10FFFF}a-zA-Z0-9\-_$\x{A2}-\x{A5}\x{58F}\x{60B}\x{9F2}\x{9F3}\x{9FB}\x{AF1}\x{BF9}\x{E3F}]";
    const NUMBER: &str = r"(?:(?:[0-9]*\.?[0-9]+|[0-9]+\.?[0-9]*)(?:[eE][+\-]?[0-9]+)?)";
    /// A `"..."` string; a backslash escapes any character, line breaks included.
    const QUOTED_NAME: &str = r#""(?:[^"\\]|\\(?s:.))*""#;

    static QUOTED: Lazy<Regex> =
        Lazy::new(|| anchored("quoted", QUOTED_NAME).expect("quoted-name pattern compiles"));

    /// A quoted label, or up to 19 label characters.
    fn label() -> String {
        format!(r#"(?:"(?:[^"\\\n]|\\.)*"|{LEAD}{TAIL}{{0,18}})"#)
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum Pattern {
        Whitespace,
        Symbol,
        /// Everything left in the input.
        Remainder,
        Pin,
        DateTime,
        Folder,
        ReactionOpen,
        ReactionClose,
        TextBlob,
        Tag,
        Mention,
        Cell,
        Event,
        Url,
        Bean,
        Link,
        FormulaOpen,
        Lparen,
        Rparen,
        Operator,
        Argument,
        QuotedName,
    }

    #[derive(Debug, Clone)]
    pub struct PatternTable {
        whitespace: Regex,
        symbol: Regex,
        pin: Regex,
        date_time: Regex,
        folder: Regex,
        reaction_open: Regex,
        tag: Regex,
        mention: Regex,
        cell: Regex,
        event: Regex,
        url: Regex,
        bean: Regex,
        operator: Regex,
        argument: Regex,
        quoted_name: Regex,
    }

    fn anchored(name: &'static str, source: &str) -> Result<Regex, ConfigError> {
        Regex::new(&format!("^(?:{source})")).map_err(|source| ConfigError::Pattern { name, source })
    }

    impl PatternTable {
        pub fn compile() -> Result<Self, ConfigError> {
            let label = label();
            Ok(Self {
                whitespace: anchored("whitespace", r"\s+")?,
                symbol: anchored("symbol", r"\S+")?,
                pin: anchored("pin", r"\*[0-9]*")?,
                date_time: anchored(
                    "datetime",
                    r"[0-9]{4}-?(?:1[0-2]|0[1-9])-?(?:3[01]|0[1-9]|[12][0-9])(?:[\sT]?(?:2[0-3]|[01][0-9]):?[0-5][0-9]:?(?:[0-5][0-9])?(?:\.[0-9]+)?Z?)?",
                )?,
                folder: anchored("folder", &format!("/{label}?"))?,
                reaction_open: anchored(
                    "reaction",
                    "(?:Loved|Liked|Disliked|Laughed at|Emphasized|Questioned) “",
                )?,
                tag: anchored("tag", &format!("#{label}"))?,
                mention: anchored("mention", &format!("@{label}"))?,
                cell: anchored(
                    "cell",
                    &format!(r"%{label}(?::(?:-?{NUMBER})?)?(?:,{label})?"),
                )?,
                event: anchored(
                    "event",
                    &format!(r"!{label}(?:…|\.{{3}})?|(?:…|\.{{3}}){label}"),
                )?,
                url: anchored(
                    "url",
                    r"(?:[a-zA-Z][a-zA-Z0-9+.\-]*://|www\.)[A-Za-z0-9\-._~:/?#\[\]@!$&'()*+,;=%]+",
                )?,
                bean: anchored("bean", &format!(r"[+\-]{label}(?::{NUMBER})?"))?,
                operator: anchored("operator", r"[^\s()]{1,42}")?,
                argument: anchored("arg", &format!(r"{label}|-?{NUMBER}|-"))?,
                quoted_name: anchored("quoted", QUOTED_NAME)?,
            })
        }

        /// Byte length of the match of `pattern` at the start of `rest`. Empty matches count
        /// as no match.
        pub fn match_at(&self, pattern: Pattern, rest: &str) -> Option<usize> {
            let regex = match pattern {
                Pattern::Remainder => return non_empty(rest.len()),
                Pattern::TextBlob => return text_blob_len(rest),
                Pattern::ReactionClose => return literal(rest, "”"),
                Pattern::Link => return literal(rest, "://"),
                Pattern::FormulaOpen => return literal(rest, "$$"),
                Pattern::Lparen => return literal(rest, "("),
                Pattern::Rparen => return literal(rest, ")"),
                Pattern::Whitespace => &self.whitespace,
                Pattern::Symbol => &self.symbol,
                Pattern::Pin => &self.pin,
                Pattern::DateTime => &self.date_time,
                Pattern::Folder => &self.folder,
                Pattern::ReactionOpen => &self.reaction_open,
                Pattern::Tag => &self.tag,
                Pattern::Mention => &self.mention,
                Pattern::Cell => &self.cell,
                Pattern::Event => &self.event,
                Pattern::Url => &self.url,
                Pattern::Bean => &self.bean,
                Pattern::Operator => &self.operator,
                Pattern::Argument => &self.argument,
                Pattern::QuotedName => &self.quoted_name,
            };
            regex.find(rest).and_then(|m| non_empty(m.end()))
        }
    }

    fn non_empty(len: usize) -> Option<usize> {
        (len > 0).then_some(len)
    }

    fn literal(rest: &str, lit: &str) -> Option<usize> {
        rest.starts_with(lit).then_some(lit.len())
    }

    /// Reaction body: up to the closing quote, or everything but the last character when
    /// the quote never comes.
    fn text_blob_len(rest: &str) -> Option<usize> {
        match rest.find('”') {
            Some(end) => non_empty(end),
            None => rest.char_indices().last().and_then(|(last, _)| non_empty(last)),
        }
    }

    /// Length of a `"..."` string at the start of `s`, honoring backslash escapes.
    pub fn quoted_len(s: &str) -> Option<usize> {
        QUOTED.find(s).map(|m| m.end())
    }

    pub fn is_quoted(s: &str) -> bool {
        quoted_len(s) == Some(s.len())
    }

    pub fn is_pi(s: &str) -> bool {
        s == "🥧" || s.eq_ignore_ascii_case("pi")
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use rstest::rstest;

        fn table() -> PatternTable {
            PatternTable::compile().unwrap()
        }

        #[rstest]
        #[case(Pattern::Tag, "#foo bar", Some(4))]
        #[case(Pattern::Tag, "#\"foo bar\" baz", Some(10))]
        #[case(Pattern::Tag, "#", None)]
        #[case(Pattern::Tag, "#abcdefghijklmnopqrstuvwxyz", Some(20))]
        #[case(Pattern::Bean, "+$:100", Some(6))]
        #[case(Pattern::Bean, "-$:10.", Some(5))]
        #[case(Pattern::Bean, "-1", None)]
        #[case(Pattern::Cell, "%weight:72.5,kg", Some(15))]
        #[case(Pattern::Cell, "%temp:-3", Some(8))]
        #[case(Pattern::Event, "!foo...", Some(7))]
        #[case(Pattern::Event, "...foo", Some(6))]
        #[case(Pattern::Event, "!!", None)]
        #[case(Pattern::Url, "https://example.com/a?b=c ", Some(25))]
        #[case(Pattern::Url, "www.example.com", Some(15))]
        #[case(Pattern::DateTime, "2020-01-20 foo", Some(10))]
        #[case(Pattern::DateTime, "2020-01-20T10:30:00Z rest", Some(20))]
        #[case(Pattern::DateTime, "20200120", Some(8))]
        #[case(Pattern::DateTime, "2020-13-01", None)]
        #[case(Pattern::Folder, "/", Some(1))]
        #[case(Pattern::Folder, "/foo/bar", Some(4))]
        #[case(Pattern::Pin, "*12 x", Some(3))]
        #[case(Pattern::Argument, "- 1", Some(1))]
        #[case(Pattern::Argument, "-1.5e3)", Some(6))]
        #[case(Pattern::Operator, "BEAN bar", Some(4))]
        #[case(Pattern::ReactionOpen, "Laughed at “x”", Some(14))]
        fn anchored_matches(#[case] pattern: Pattern, #[case] input: &str, #[case] len: Option<usize>) {
            assert_eq!(table().match_at(pattern, input), len);
        }

        #[test]
        fn text_blob_stops_at_close_or_before_last_char() {
            assert_eq!(text_blob_len("foo #bar”"), Some(8));
            assert_eq!(text_blob_len("foo"), Some(2));
            assert_eq!(text_blob_len("z"), None);
            assert_eq!(text_blob_len("”"), None);
        }

        #[test]
        fn quoted_strings_honor_escapes() {
            assert_eq!(quoted_len(r#""a\"b" c"#), Some(6));
            assert_eq!(quoted_len(r#""open"#), None);
            assert!(is_quoted(r#""Foo bar""#));
            assert!(!is_quoted("foo"));
            assert_eq!(quoted_len("\"a\\\nb\""), Some(6));
        }

        #[rstest]
        #[case(r#""a b" c"#)]
        #[case(r#""a\"b""#)]
        #[case(r#""trailing\"#)]
        #[case("\"two\nlines\"")]
        #[case(r#"x"a""#)]
        fn link_names_and_dequoting_agree(#[case] input: &str) {
            assert_eq!(table().match_at(Pattern::QuotedName, input), quoted_len(input));
        }

        #[test]
        fn pi_is_whole_text_only() {
            assert!(is_pi("PI"));
            assert!(is_pi("🥧"));
            assert!(!is_pi("pie"));
        }
    }
}

pub mod extract {
    //! Value extractors: decode the matched text of a token into its value.

    use crate::core::*;
    use crate::patterns::{is_pi, is_quoted, quoted_len};
    use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
    use nom::{
        IResult,
        bytes::complete::take_while_m_n,
        character::complete::{char, digit1, satisfy},
        combinator::{map_res, opt},
        error::{VerboseError, VerboseErrorKind},
        sequence::preceded,
    };
    use std::str::FromStr;

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    pub fn decode(kind: TokenType, text: &str) -> Value {
        match kind {
            TokenType::Pin => Value::Text(pin(text)),
            TokenType::Date => Value::Date(date(text)),
            TokenType::Folder => Value::Text(folder(text)),
            TokenType::Tag | TokenType::Mention => Value::Text(sigil_label(text)),
            TokenType::Cell => Value::Cell(cell(text)),
            TokenType::Event => Value::Event(event(text)),
            TokenType::Bean => Value::Bean(bean(text)),
            TokenType::Arg => Value::Arg(arg(text)),
            TokenType::Href | TokenType::Title | TokenType::ImgSrc | TokenType::ImgTitle => {
                Value::Text(dequote(text).to_owned())
            }
            _ => Value::Text(text.to_owned()),
        }
    }

    /* ------------------------------- Labels ------------------------------- */

    fn dequote(s: &str) -> &str {
        if is_quoted(s) && s.len() >= 2 {
            &s[1..s.len() - 1]
        } else {
            s
        }
    }

    /// Quoted labels keep their case; bare labels are lowercased.
    pub fn label(s: &str) -> String {
        if is_quoted(s) {
            dequote(s).to_owned()
        } else {
            s.to_lowercase()
        }
    }

    fn without_sigil(text: &str) -> &str {
        let mut chars = text.chars();
        chars.next();
        chars.as_str()
    }

    fn sigil_label(text: &str) -> String {
        label(without_sigil(text))
    }

    pub fn folder(text: &str) -> String {
        format!("/{}", sigil_label(text))
    }

    pub fn pin(text: &str) -> String {
        match without_sigil(text) {
            "" => "0".to_string(),
            digits => digits.to_string(),
        }
    }

    pub fn arg(text: &str) -> Option<String> {
        match text {
            "-" => None,
            _ => Some(dequote(text).to_owned()),
        }
    }

    /// Argument as it appears in a call; a bare `pi` or 🥧 becomes π.
    pub fn call_arg(value: &Value) -> Arg {
        match value {
            Value::Arg(None) => Arg::Skip,
            Value::Arg(Some(v)) | Value::Text(v) if is_pi(v) => {
                Arg::Value(std::f64::consts::PI.to_string())
            }
            Value::Arg(Some(v)) | Value::Text(v) => Arg::Value(v.clone()),
            _ => Arg::Skip,
        }
    }

    /// Splits a leading symbol off `rest`: a quoted label, or everything before the first
    /// of `stops`.
    fn split_symbol<'a>(rest: &'a str, stops: &[char]) -> (String, &'a str) {
        match quoted_len(rest) {
            Some(n) => (dequote(&rest[..n]).to_owned(), &rest[n..]),
            None => {
                let end = rest.find(stops).unwrap_or(rest.len());
                (rest[..end].to_lowercase(), &rest[end..])
            }
        }
    }

    /* ------------------------------ Quantities ------------------------------ */

    pub fn bean(text: &str) -> Bean {
        let sign = if text.starts_with('-') {
            Sign::Minus
        } else {
            Sign::Plus
        };
        let (symbol, tail) = split_symbol(without_sigil(text), &[':']);
        let value = match tail.strip_prefix(':') {
            Some(v) if !v.is_empty() => v.to_string(),
            _ => "1".to_string(),
        };
        Bean {
            sign,
            symbol,
            value,
        }
    }

    pub fn cell(text: &str) -> Cell {
        let (symbol, tail) = split_symbol(without_sigil(text), &[':', ',']);
        let (measure, unit) = match tail.split_once(',') {
            Some((measure, unit)) => (measure, Some(label(unit))),
            None => (tail, None),
        };
        let value = match measure.strip_prefix(':') {
            Some("") => "0".to_string(),
            Some(v) => v.to_string(),
            None => "1".to_string(),
        };
        Cell {
            symbol,
            value,
            unit,
        }
    }

    pub fn event(text: &str) -> Event {
        let strip_suffix = |s: &str| -> Option<String> {
            s.strip_suffix('…')
                .or_else(|| s.strip_suffix("..."))
                .map(label)
        };
        let (label_text, form) = match text.strip_prefix('!') {
            Some(body) => match strip_suffix(body) {
                Some(l) => (l, EventForm::Open),
                None => (label(body), EventForm::Point),
            },
            None => {
                let body = text
                    .strip_prefix('…')
                    .or_else(|| text.strip_prefix("..."))
                    .unwrap_or(text);
                (label(body), EventForm::Close)
            }
        };
        Event {
            label: label_text,
            is_range: form != EventForm::Point,
            form,
        }
    }

    /* -------------------------------- Dates -------------------------------- */

    /// Dates without a zone designator are read as UTC.
    pub fn date(text: &str) -> DateValue {
        match parse_instant(text) {
            Ok(("", at)) => DateValue::Instant(at.and_utc()),
            _ => DateValue::Invalid(
                Violation::new(ErrorKind::InvalidDateFormat, text)
                    .with_message("not a calendar date"),
            ),
        }
    }

    fn parse_instant(i: &str) -> PResult<'_, NaiveDateTime> {
        let (i, date) = parse_date(i)?;
        let (i, time) = opt(preceded(opt(time_separator), parse_time))(i)?;
        let (i, _) = opt(zulu)(i)?;
        Ok((i, date.and_time(time.unwrap_or(NaiveTime::MIN))))
    }

    fn digits<T: FromStr>(n: usize) -> impl Fn(&str) -> PResult<'_, T> {
        move |i: &str| {
            map_res(take_while_m_n(n, n, |c: char| c.is_ascii_digit()), |s: &str| {
                s.parse::<T>()
            })(i)
        }
    }

    fn dash(i: &str) -> PResult<'_, Option<char>> {
        opt(char('-'))(i)
    }

    fn colon(i: &str) -> PResult<'_, Option<char>> {
        opt(char(':'))(i)
    }

    fn time_separator(i: &str) -> PResult<'_, char> {
        satisfy(|c| c.is_whitespace() || c == 'T')(i)
    }

    fn zulu(i: &str) -> PResult<'_, char> {
        char('Z')(i)
    }

    fn fraction(i: &str) -> PResult<'_, &str> {
        preceded(char('.'), digit1)(i)
    }

    fn parse_date(i: &str) -> PResult<'_, NaiveDate> {
        let (i, year) = digits::<i32>(4)(i)?;
        let (i, _) = dash(i)?;
        let (i, month) = digits::<u32>(2)(i)?;
        let (i, _) = dash(i)?;
        let (rest, day) = digits::<u32>(2)(i)?;
        match NaiveDate::from_ymd_opt(year, month, day) {
            Some(d) => Ok((rest, d)),
            None => Err(invalid(i, "invalid date")),
        }
    }

    fn parse_time(i: &str) -> PResult<'_, NaiveTime> {
        let (i, hour) = digits::<u32>(2)(i)?;
        let (i, _) = colon(i)?;
        let (i, minute) = digits::<u32>(2)(i)?;
        let (i, _) = colon(i)?;
        let (i, second) = opt(digits::<u32>(2))(i)?;
        let (rest, frac) = opt(fraction)(i)?;
        let nanos = frac.map(fraction_nanos).unwrap_or(0);
        match NaiveTime::from_hms_nano_opt(hour, minute, second.unwrap_or(0), nanos) {
            Some(t) => Ok((rest, t)),
            None => Err(invalid(i, "invalid time")),
        }
    }

    fn fraction_nanos(digits: &str) -> u32 {
        let mut padded: String = digits.chars().take(9).collect();
        while padded.len() < 9 {
            padded.push('0');
        }
        padded.parse().unwrap_or(0)
    }

    fn invalid<'a>(i: &'a str, what: &'static str) -> nom::Err<VerboseError<&'a str>> {
        nom::Err::Error(VerboseError {
            errors: vec![(i, VerboseErrorKind::Context(what))],
        })
    }

}

pub mod grammar {
    //! The lexer's state machine: per-state ordered rules, first match wins.

    use crate::config::{ConfigError, Settings};
    use crate::core::{ErrorKind, TokenType};
    use crate::patterns::{Pattern, PatternTable};
    use indexmap::IndexMap;
    use once_cell::sync::Lazy;
    use std::fmt;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum State {
        Main,
        Standard,
        Pin,
        Date,
        Folder,
        FolderStandardStart,
        Tag,
        Mention,
        Cell,
        Event,
        Url,
        Bean,
        Reaction,
        FormulaOpen,
        FormulaSetupName,
        FormulaSetupClose,
        FormulaFuncOpen,
        FormulaFuncOperator,
        FormulaFunc,
        Operator,
        Func,
        LinkOpen,
        LinkSetupUrl,
        LinkSetupTitle,
        LinkSetupClose,
        LinkImgOpen,
        LinkImgUrl,
        LinkImgTitle,
        LinkImgClose,
    }

    impl State {
        pub const ALL: [State; 29] = [
            State::Main,
            State::Standard,
            State::Pin,
            State::Date,
            State::Folder,
            State::FolderStandardStart,
            State::Tag,
            State::Mention,
            State::Cell,
            State::Event,
            State::Url,
            State::Bean,
            State::Reaction,
            State::FormulaOpen,
            State::FormulaSetupName,
            State::FormulaSetupClose,
            State::FormulaFuncOpen,
            State::FormulaFuncOperator,
            State::FormulaFunc,
            State::Operator,
            State::Func,
            State::LinkOpen,
            State::LinkSetupUrl,
            State::LinkSetupTitle,
            State::LinkSetupClose,
            State::LinkImgOpen,
            State::LinkImgUrl,
            State::LinkImgTitle,
            State::LinkImgClose,
        ];

        pub fn as_str(self) -> &'static str {
            match self {
                State::Main => "main",
                State::Standard => "standard",
                State::Pin => "pin",
                State::Date => "date",
                State::Folder => "folder",
                State::FolderStandardStart => "folder_standard_start",
                State::Tag => "tag",
                State::Mention => "mention",
                State::Cell => "cell",
                State::Event => "event",
                State::Url => "url",
                State::Bean => "bean",
                State::Reaction => "reaction",
                State::FormulaOpen => "formula-open",
                State::FormulaSetupName => "formula-setup-name",
                State::FormulaSetupClose => "formula-setup-close",
                State::FormulaFuncOpen => "formula-func-open",
                State::FormulaFuncOperator => "formula-func-operator",
                State::FormulaFunc => "formula-func",
                State::Operator => "operator",
                State::Func => "func",
                State::LinkOpen => "link-open",
                State::LinkSetupUrl => "link-setup-url",
                State::LinkSetupTitle => "link-setup-title",
                State::LinkSetupClose => "link-setup-close",
                State::LinkImgOpen => "link-img-open",
                State::LinkImgUrl => "link-img-url",
                State::LinkImgTitle => "link-img-title",
                State::LinkImgClose => "link-img-close",
            }
        }
    }

    impl fmt::Display for State {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.as_str())
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Transition {
        Stay,
        Next(State),
        Push(State),
        /// Return to the pushed state; `standard` when nothing was pushed.
        Pop,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Emit {
        Token(TokenType),
        /// A word, unless it spells a configured TODO/DONE keyword.
        Keyword,
        Error(ErrorKind),
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Rule {
        pub pattern: Pattern,
        pub emit: Emit,
        pub transition: Transition,
    }

    impl Rule {
        fn new(pattern: Pattern, kind: TokenType) -> Self {
            Self {
                pattern,
                emit: Emit::Token(kind),
                transition: Transition::Stay,
            }
        }

        fn error(kind: ErrorKind) -> Self {
            Self {
                pattern: Pattern::Symbol,
                emit: Emit::Error(kind),
                transition: Transition::Next(State::Standard),
            }
        }

        fn next(mut self, state: State) -> Self {
            self.transition = Transition::Next(state);
            self
        }

        fn push(mut self, state: State) -> Self {
            self.transition = Transition::Push(state);
            self
        }

        fn pop(mut self) -> Self {
            self.transition = Transition::Pop;
            self
        }
    }

    /// Error kind and landing state used when no rule of a state matches.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Recovery {
        pub kind: ErrorKind,
        pub state: State,
    }

    #[derive(Debug, Clone)]
    pub struct StateTable {
        pub rules: Vec<Rule>,
        /// Taken from the state's error rule. States without one read unmatched text as words.
        pub recovery: Option<Recovery>,
    }

    impl StateTable {
        fn new(rules: Vec<Rule>) -> Self {
            let recovery = rules
                .iter()
                .find_map(|r| match (r.emit, r.transition) {
                    (Emit::Error(kind), Transition::Next(state)) => Some(Recovery { kind, state }),
                    (Emit::Error(kind), _) => Some(Recovery {
                        kind,
                        state: State::Standard,
                    }),
                    _ => None,
                });
            Self { rules, recovery }
        }
    }

    #[derive(Debug, Clone)]
    pub struct Grammar {
        settings: Settings,
        patterns: PatternTable,
        states: IndexMap<State, StateTable>,
    }

    static STANDARD: Lazy<Grammar> = Lazy::new(|| {
        Grammar::new(Settings::default()).expect("built-in patterns compile")
    });

    impl Grammar {
        pub fn new(settings: Settings) -> Result<Self, ConfigError> {
            settings.validate()?;
            Ok(Self {
                settings,
                patterns: PatternTable::compile()?,
                states: build_states(),
            })
        }

        /// Grammar with the default keywords, compiled once per process.
        pub fn standard() -> &'static Grammar {
            &STANDARD
        }

        pub fn settings(&self) -> &Settings {
            &self.settings
        }

        pub fn patterns(&self) -> &PatternTable {
            &self.patterns
        }

        /// Every state gets a table in [`Grammar::new`].
        pub fn table(&self, state: State) -> &StateTable {
            &self.states[&state]
        }
    }

    fn space() -> Rule {
        Rule::new(Pattern::Whitespace, TokenType::Space)
    }

    /// Tokens allowed wherever free text is, followed by the word fallback.
    fn standard_set(word: Emit) -> Vec<Rule> {
        vec![
            Rule::new(Pattern::Tag, TokenType::Tag).push(State::Tag),
            Rule::new(Pattern::Mention, TokenType::Mention).push(State::Mention),
            Rule::new(Pattern::Cell, TokenType::Cell).push(State::Cell),
            Rule::new(Pattern::Event, TokenType::Event).push(State::Event),
            Rule::new(Pattern::Url, TokenType::Url).push(State::Url),
            Rule::new(Pattern::Bean, TokenType::Bean).push(State::Bean),
            Rule::new(Pattern::Link, TokenType::LinkOpen).push(State::LinkOpen),
            Rule::new(Pattern::FormulaOpen, TokenType::FormulaOpen).push(State::FormulaOpen),
            Rule {
                pattern: Pattern::Symbol,
                emit: word,
                transition: Transition::Next(State::Standard),
            },
        ]
    }

    fn with_space(mut rules: Vec<Rule>) -> Vec<Rule> {
        rules.push(space());
        rules
    }

    /// A one-token construct: must be followed by whitespace.
    fn single_token(kind: ErrorKind) -> StateTable {
        StateTable::new(vec![space().next(State::Standard), Rule::error(kind)])
    }

    fn formula_states(fallback: State) -> Vec<(State, StateTable)> {
        use ErrorKind::*;
        let lparen = || Rule::new(Pattern::Lparen, TokenType::Lparen);
        let rparen = || Rule::new(Pattern::Rparen, TokenType::Rparen);
        let arg = || Rule::new(Pattern::Argument, TokenType::Arg);
        let operator = || Rule::new(Pattern::Operator, TokenType::Operator);
        let fail = |kind| Rule::error(kind).next(fallback);
        vec![
            (
                State::FormulaOpen,
                StateTable::new(vec![
                    lparen().next(State::FormulaSetupName),
                    space(),
                    fail(InvalidFormulaOpenFormat),
                ]),
            ),
            (
                State::FormulaSetupName,
                StateTable::new(vec![
                    rparen().next(State::FormulaFuncOpen),
                    space(),
                    arg().next(State::FormulaSetupClose),
                    fail(InvalidFormulaSetupNameFormat),
                ]),
            ),
            (
                State::FormulaSetupClose,
                StateTable::new(vec![
                    rparen().next(State::FormulaFuncOpen),
                    space(),
                    fail(InvalidFormulaSetupCloseFormat),
                ]),
            ),
            (
                State::FormulaFuncOpen,
                StateTable::new(vec![
                    lparen().next(State::FormulaFuncOperator),
                    space(),
                    fail(InvalidFormulaFuncOpenFormat),
                ]),
            ),
            (
                State::FormulaFuncOperator,
                StateTable::new(vec![
                    operator().next(State::FormulaFunc),
                    space(),
                    fail(InvalidFormulaFuncOperatorFormat),
                ]),
            ),
            (
                State::FormulaFunc,
                StateTable::new(vec![
                    lparen().push(State::Operator),
                    rparen().next(fallback),
                    space(),
                    arg(),
                    fail(InvalidFormulaFuncFormat),
                ]),
            ),
            (
                State::Operator,
                StateTable::new(vec![
                    operator().next(State::Func),
                    space(),
                    fail(InvalidOperatorFormat),
                ]),
            ),
            (
                State::Func,
                StateTable::new(vec![
                    rparen().pop(),
                    lparen().push(State::Operator),
                    space(),
                    arg(),
                    fail(InvalidFunctionFormat),
                ]),
            ),
        ]
    }

    fn link_states(alternatives: Vec<Rule>) -> Vec<(State, StateTable)> {
        use ErrorKind::*;
        let lparen = || Rule::new(Pattern::Lparen, TokenType::Lparen);
        let rparen = || Rule::new(Pattern::Rparen, TokenType::Rparen);
        let quoted = |kind| Rule::new(Pattern::QuotedName, kind);
        let mut img_open = vec![space(), lparen().next(State::LinkImgUrl)];
        img_open.extend(alternatives);
        vec![
            (
                State::LinkOpen,
                StateTable::new(vec![
                    space(),
                    lparen().next(State::LinkSetupUrl),
                    Rule::error(InvalidLinkOpenFormat),
                ]),
            ),
            (
                State::LinkSetupUrl,
                StateTable::new(vec![
                    space(),
                    quoted(TokenType::Href).next(State::LinkSetupTitle),
                    rparen().next(State::LinkImgOpen),
                    Rule::error(InvalidLinkSetupFormat),
                ]),
            ),
            (
                State::LinkSetupTitle,
                StateTable::new(vec![
                    space(),
                    quoted(TokenType::Title).next(State::LinkSetupClose),
                    rparen().next(State::LinkImgOpen),
                    Rule::error(InvalidLinkSetupTitleFormat),
                ]),
            ),
            (
                State::LinkSetupClose,
                StateTable::new(vec![
                    space(),
                    rparen().next(State::LinkImgOpen),
                    Rule::error(InvalidLinkSetupCloseFormat),
                ]),
            ),
            (State::LinkImgOpen, StateTable::new(img_open)),
            (
                State::LinkImgUrl,
                StateTable::new(vec![
                    space(),
                    quoted(TokenType::ImgSrc).next(State::LinkImgTitle),
                    rparen().next(State::Standard),
                    Rule::error(InvalidLinkImageUrlFormat),
                ]),
            ),
            (
                State::LinkImgTitle,
                StateTable::new(vec![
                    space(),
                    quoted(TokenType::ImgTitle).next(State::LinkImgClose),
                    rparen().next(State::Standard),
                    Rule::error(InvalidLinkImageTitleFormat),
                ]),
            ),
            (
                State::LinkImgClose,
                StateTable::new(vec![
                    space(),
                    rparen().next(State::Standard),
                    Rule::error(InvalidLinkImageCloseFormat),
                ]),
            ),
        ]
    }

    fn build_states() -> IndexMap<State, StateTable> {
        use ErrorKind::*;
        let mut states = IndexMap::new();

        let mut main = vec![
            Rule::new(Pattern::Pin, TokenType::Pin).next(State::Pin),
            Rule::new(Pattern::DateTime, TokenType::Date).next(State::Date),
            Rule::new(Pattern::Folder, TokenType::Folder).next(State::Folder),
            Rule::new(Pattern::ReactionOpen, TokenType::ReactionOpen).next(State::Reaction),
        ];
        main.extend(with_space(standard_set(Emit::Keyword)));
        states.insert(State::Main, StateTable::new(main));

        let mut pin = vec![
            space(),
            Rule::new(Pattern::DateTime, TokenType::Date).next(State::Date),
            Rule::new(Pattern::Folder, TokenType::Folder).next(State::Folder),
        ];
        pin.extend(standard_set(Emit::Keyword));
        states.insert(State::Pin, StateTable::new(pin));

        let mut date = vec![
            space(),
            Rule::new(Pattern::Folder, TokenType::Folder).next(State::Folder),
        ];
        date.extend(standard_set(Emit::Keyword));
        states.insert(State::Date, StateTable::new(date));

        states.insert(
            State::Folder,
            StateTable::new(vec![
                Rule::new(Pattern::Folder, TokenType::Folder),
                space().next(State::FolderStandardStart),
                Rule::error(InvalidFolderFormat).next(State::FolderStandardStart),
            ]),
        );

        let mut folder_start = vec![space().next(State::Standard)];
        folder_start.extend(standard_set(Emit::Keyword));
        states.insert(State::FolderStandardStart, StateTable::new(folder_start));

        states.insert(
            State::Standard,
            StateTable::new(with_space(standard_set(Emit::Token(TokenType::Word)))),
        );

        states.insert(State::Tag, single_token(InvalidTagFormat));
        states.insert(State::Mention, single_token(InvalidMentionFormat));
        states.insert(State::Cell, single_token(InvalidCellFormat));
        states.insert(State::Event, single_token(InvalidEventFormat));
        states.insert(State::Url, single_token(InvalidUrlFormat));
        states.insert(State::Bean, single_token(InvalidBeanFormat));

        states.insert(
            State::Reaction,
            StateTable::new(vec![
                Rule::new(Pattern::ReactionClose, TokenType::ReactionClose).next(State::Standard),
                Rule::new(Pattern::TextBlob, TokenType::TextBlob),
                Rule {
                    pattern: Pattern::Remainder,
                    emit: Emit::Error(InvalidReactionFormat),
                    transition: Transition::Next(State::Standard),
                },
            ]),
        );

        states.extend(formula_states(State::Standard));
        states.extend(link_states(standard_set(Emit::Token(TokenType::Word))));
        states
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn every_state_has_a_table() {
            let g = Grammar::standard();
            for state in State::ALL {
                let table = g.table(state);
                assert!(!table.rules.is_empty(), "{state} has no rules");
            }
        }

        #[test]
        fn recovery_follows_declared_error_rule() {
            let g = Grammar::standard();
            let folder = g.table(State::Folder).recovery.unwrap();
            assert_eq!(folder.kind, ErrorKind::InvalidFolderFormat);
            assert_eq!(folder.state, State::FolderStandardStart);
            assert_eq!(g.table(State::Main).recovery, None);
            assert_eq!(g.table(State::Standard).recovery, None);
        }

        #[test]
        fn only_keyword_states_classify_words() {
            let g = Grammar::standard();
            let has_keyword = |s| {
                g.table(s)
                    .rules
                    .iter()
                    .any(|r| r.emit == Emit::Keyword)
            };
            assert!(has_keyword(State::Main));
            assert!(has_keyword(State::Pin));
            assert!(has_keyword(State::Date));
            assert!(has_keyword(State::FolderStandardStart));
            assert!(!has_keyword(State::Standard));
            assert!(!has_keyword(State::LinkImgOpen));
        }

        #[test]
        fn rejects_invalid_settings() {
            let settings = Settings {
                todo_keywords: vec![String::new()],
                ..Settings::default()
            };
            assert!(Grammar::new(settings).is_err());
        }
    }
}

pub mod lexer {
    //! Stateful tokenizer. Total over any input: unmatched text becomes error or word tokens.

    use crate::core::{Token, TokenType, Value, Violation};
    use crate::extract::decode;
    use crate::grammar::{Emit, Grammar, Recovery, State, Transition};
    use crate::patterns::Pattern;

    #[derive(Debug, Clone, Copy)]
    pub struct Lexer<'g> {
        grammar: &'g Grammar,
    }

    impl Default for Lexer<'static> {
        fn default() -> Self {
            Self::new(Grammar::standard())
        }
    }

    impl<'g> Lexer<'g> {
        pub fn new(grammar: &'g Grammar) -> Self {
            Self { grammar }
        }

        pub fn tokens<'i>(&self, input: &'i str) -> Tokens<'g, 'i> {
            Tokens {
                grammar: self.grammar,
                input,
                cursor: 0,
                line: 1,
                col: 1,
                state: State::Main,
                stack: Vec::new(),
            }
        }

        pub fn tokenize(&self, input: &str) -> Vec<Token> {
            self.tokens(input).collect()
        }
    }

    /// Lazy token stream over one input.
    #[derive(Debug, Clone)]
    pub struct Tokens<'g, 'i> {
        grammar: &'g Grammar,
        input: &'i str,
        cursor: usize,
        line: usize,
        col: usize,
        state: State,
        stack: Vec<State>,
    }

    impl Tokens<'_, '_> {
        fn transition(&mut self, transition: Transition) {
            let from = self.state;
            match transition {
                Transition::Stay => return,
                // Nothing pops back out of `standard`, so pending returns are dead.
                Transition::Next(State::Standard) => {
                    self.stack.clear();
                    self.state = State::Standard;
                }
                Transition::Next(state) => self.state = state,
                Transition::Push(state) => {
                    self.stack.push(self.state);
                    self.state = state;
                }
                Transition::Pop => self.state = self.stack.pop().unwrap_or(State::Standard),
            }
            log::trace!("{from} -> {} at byte {}", self.state, self.cursor);
        }

        /// Picks the first matching rule, or the state's recovery over the next symbol.
        fn select(&self, rest: &str) -> (usize, Emit, Transition) {
            let patterns = self.grammar.patterns();
            let table = self.grammar.table(self.state);
            for rule in &table.rules {
                if let Some(len) = patterns.match_at(rule.pattern, rest) {
                    return (len, rule.emit, rule.transition);
                }
            }
            let len = patterns
                .match_at(Pattern::Symbol, rest)
                .unwrap_or_else(|| first_char_len(rest));
            match table.recovery {
                Some(Recovery { kind, state }) => (len, Emit::Error(kind), Transition::Next(state)),
                None => (len, Emit::Token(TokenType::Word), Transition::Stay),
            }
        }
    }

    fn first_char_len(rest: &str) -> usize {
        rest.chars().next().map(char::len_utf8).unwrap_or(0)
    }

    impl Iterator for Tokens<'_, '_> {
        type Item = Token;

        fn next(&mut self) -> Option<Token> {
            let rest = &self.input[self.cursor..];
            if rest.is_empty() {
                return None;
            }
            let (len, emit, transition) = self.select(rest);
            let text = &rest[..len];

            let (kind, value) = match emit {
                Emit::Token(kind) => (kind, decode(kind, text)),
                Emit::Keyword => {
                    let kind = self.grammar.settings().keyword(text).unwrap_or(TokenType::Word);
                    (kind, Value::Text(text.to_owned()))
                }
                Emit::Error(kind) => {
                    log::debug!(
                        "{kind} in state {} at {}:{}: {text:?}",
                        self.state,
                        self.line,
                        self.col
                    );
                    (TokenType::Error, Value::Error(Violation::new(kind, text)))
                }
            };

            let line_breaks = text.matches('\n').count();
            let token = Token {
                kind,
                text: text.to_owned(),
                value,
                offset: self.cursor,
                line: self.line,
                col: self.col,
                line_breaks,
            };

            for c in text.chars() {
                if c == '\n' {
                    self.line += 1;
                    self.col = 1;
                } else {
                    self.col += 1;
                }
            }
            self.cursor += len;
            self.transition(transition);
            Some(token)
        }
    }

}

pub mod formula {
    //! Formula sub-parser: `$$(name) (op arg (op arg ...) ...)`.

    use crate::core::*;
    use crate::extract::call_arg;

    /// Folds the formula starting at `tokens[0]`. `None` unless it is a `$$` token.
    pub fn parse_formula(tokens: &[Token]) -> Option<Parsed<Token>> {
        tokens.first().filter(|t| t.kind == TokenType::FormulaOpen)?;
        let mut formula = Formula::default();
        let mut error = None;
        let mut i = 1;

        // (name)
        let mut setup_closed = false;
        while let Some(t) = tokens.get(i) {
            match t.kind {
                TokenType::Lparen | TokenType::Space => {}
                TokenType::Arg => {
                    if formula.name.is_none() {
                        formula.name = t.value.as_text().map(str::to_owned);
                    }
                }
                TokenType::Rparen => setup_closed = true,
                TokenType::Error => error = Some(t.clone()),
                _ => break,
            }
            i += 1;
            if setup_closed || error.is_some() {
                break;
            }
        }

        // (procedure)
        if setup_closed {
            while let Some(t) = tokens.get(i) {
                match t.kind {
                    TokenType::Space => i += 1,
                    TokenType::Lparen => {
                        let call = parse_func(&tokens[i..]);
                        i += call.consumed;
                        error = call.error;
                        formula.procedure = Some(call.node);
                        break;
                    }
                    TokenType::Error => {
                        error = Some(t.clone());
                        i += 1;
                        break;
                    }
                    _ => break,
                }
            }
        }

        let node = Token::synthesize(TokenType::Formula, Value::Formula(formula), &tokens[..i]);
        Some(Parsed {
            consumed: i,
            node,
            error,
        })
    }

    /// Folds one call whose `(` is `tokens[0]`.
    pub fn parse_func(tokens: &[Token]) -> Parsed<FuncNode> {
        let (offset, line, col) = tokens
            .first()
            .map(|t| (t.offset, t.line, t.col))
            .unwrap_or((0, 1, 1));
        let mut node = FuncNode {
            kind: NodeType::Func,
            operator: None,
            args: Vec::new(),
            text: String::new(),
            offset,
            line,
            col,
            line_breaks: 0,
            error: None,
        };
        let mut error = None;
        let mut i = 0;

        while let Some(t) = tokens.get(i) {
            match t.kind {
                TokenType::Lparen if i == 0 => {}
                TokenType::Lparen => {
                    let call = parse_func(&tokens[i..]);
                    i += call.consumed;
                    node.text.push_str(&call.node.text);
                    node.line_breaks += call.node.line_breaks;
                    node.args.push(Arg::Call(call.node));
                    if let Some(failed) = call.error {
                        node.kind = NodeType::Error;
                        node.error = failed.violation().cloned();
                        error = Some(failed);
                        break;
                    }
                    continue;
                }
                TokenType::Operator if node.operator.is_none() => {
                    node.operator = t.value.as_text().map(str::to_owned);
                }
                TokenType::Operator | TokenType::Space => {}
                TokenType::Arg => node.args.push(call_arg(&t.value)),
                TokenType::Rparen => {
                    absorb(&mut node, t);
                    i += 1;
                    break;
                }
                TokenType::Error => {
                    absorb(&mut node, t);
                    i += 1;
                    node.kind = NodeType::Error;
                    node.error = t.violation().cloned();
                    error = Some(t.clone());
                    break;
                }
                _ => break,
            }
            absorb(&mut node, t);
            i += 1;
        }

        Parsed {
            consumed: i,
            node,
            error,
        }
    }

    fn absorb(node: &mut FuncNode, token: &Token) {
        node.text.push_str(&token.text);
        node.line_breaks += token.line_breaks;
    }

}

pub mod link {
    //! Link sub-parser: `://("href" "title") ("img-src" "img-title")`.

    use crate::core::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Group {
        Setup,
        Image,
    }

    /// Folds the link starting at `tokens[0]`. `None` unless it is a `://` token.
    pub fn parse_link(tokens: &[Token]) -> Option<Parsed<Token>> {
        tokens.first().filter(|t| t.kind == TokenType::LinkOpen)?;
        let mut link = Link::default();
        let mut error = None;
        let mut i = 1;

        for group in [Group::Setup, Group::Image] {
            let start = skip_spaces(tokens, i);
            match tokens.get(start) {
                Some(t) if t.kind == TokenType::Lparen => i = start + 1,
                Some(t) if t.kind == TokenType::Error && group == Group::Setup => {
                    error = Some(t.clone());
                    i = start + 1;
                    break;
                }
                None if group == Group::Setup => {
                    i = start;
                    break;
                }
                _ => break,
            }

            let mut closed = false;
            while let Some(t) = tokens.get(i) {
                match t.kind {
                    TokenType::Space => {}
                    TokenType::Href => link.href = t.value.as_text().map(str::to_owned),
                    TokenType::Title => link.title = t.value.as_text().map(str::to_owned),
                    TokenType::ImgSrc => link.img_src = t.value.as_text().map(str::to_owned),
                    TokenType::ImgTitle => link.img_title = t.value.as_text().map(str::to_owned),
                    TokenType::Rparen => closed = true,
                    TokenType::Error => error = Some(t.clone()),
                    _ => break,
                }
                i += 1;
                if closed || error.is_some() {
                    break;
                }
            }
            if !closed {
                break;
            }
        }

        let node = Token::synthesize(TokenType::Link, Value::Link(link), &tokens[..i]);
        Some(Parsed {
            consumed: i,
            node,
            error,
        })
    }

    fn skip_spaces(tokens: &[Token], from: usize) -> usize {
        from + tokens[from.min(tokens.len())..]
            .iter()
            .take_while(|t| t.kind == TokenType::Space)
            .count()
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::lexer::Lexer;

        fn link(input: &str) -> (Parsed<Token>, Link) {
            let tokens = Lexer::default().tokenize(input);
            let parsed = parse_link(&tokens).expect("starts with ://");
            let value = match &parsed.node.value {
                Value::Link(l) => l.clone(),
                other => panic!("expected link, got {:?}", other),
            };
            (parsed, value)
        }

        #[test]
        fn href_and_title() {
            let (parsed, l) = link("://(\"https://example.com\" \"Example\") after");
            assert!(parsed.error.is_none());
            assert_eq!(parsed.node.text, "://(\"https://example.com\" \"Example\")");
            assert_eq!(l.href.as_deref(), Some("https://example.com"));
            assert_eq!(l.title.as_deref(), Some("Example"));
            assert_eq!(l.img_src, None);
        }

        #[test]
        fn image_group_takes_its_leading_space() {
            let (parsed, l) = link("://(\"a\") (\"b.png\" \"B\") c");
            assert_eq!(parsed.node.text, "://(\"a\") (\"b.png\" \"B\")");
            assert_eq!(l.img_src.as_deref(), Some("b.png"));
            assert_eq!(l.img_title.as_deref(), Some("B"));
        }

        #[test]
        fn space_without_image_stays_outside() {
            let (parsed, _) = link("://(\"a\") c");
            assert_eq!(parsed.node.text, "://(\"a\")");
            assert_eq!(parsed.consumed, 4);
        }

        #[test]
        fn malformed_links_bubble_their_error() {
            let (parsed, l) = link("://(\"a\" b)");
            assert_eq!(l.href.as_deref(), Some("a"));
            assert_eq!(parsed.node.text, "://(\"a\" b)");
            assert_eq!(
                parsed.error.and_then(|e| e.violation().map(|v| v.kind)),
                Some(ErrorKind::InvalidLinkSetupTitleFormat)
            );

            let (parsed, _) = link(":// foo");
            assert_eq!(parsed.node.text, ":// foo");
            assert!(parsed.error.is_some());
        }

        #[test]
        fn unterminated_link_has_no_error() {
            let (parsed, l) = link("://(\"a\"");
            assert!(parsed.error.is_none());
            assert_eq!(l.href.as_deref(), Some("a"));
            assert_eq!(parsed.node.text, "://(\"a\"");

            let (parsed, l) = link("://() x");
            assert!(parsed.error.is_none());
            assert_eq!(l, Link::default());
            assert_eq!(parsed.consumed, 3);
        }
    }
}

pub mod reaction {
    //! Reaction sub-parser: `Liked “quoted message”`.

    use crate::core::*;

    /// Folds the reaction starting at `tokens[0]`. `None` unless it is a reaction opener.
    pub fn parse_reaction(tokens: &[Token]) -> Option<Parsed<Token>> {
        let open = tokens.first().filter(|t| t.kind == TokenType::ReactionOpen)?;
        let mut reaction = Reaction {
            reaction: ReactionKind::from_opener(&open.text),
            record: String::new(),
        };
        let mut error = None;
        let mut i = 1;
        while let Some(t) = tokens.get(i) {
            match t.kind {
                TokenType::TextBlob => reaction.record = t.text.clone(),
                TokenType::ReactionClose => {
                    i += 1;
                    break;
                }
                TokenType::Error => {
                    error = Some(t.clone());
                    i += 1;
                    break;
                }
                _ => break,
            }
            i += 1;
        }

        let node = Token::synthesize(TokenType::Reaction, Value::Reaction(reaction), &tokens[..i]);
        Some(Parsed {
            consumed: i,
            node,
            error,
        })
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::lexer::Lexer;

        fn reaction(input: &str) -> (Parsed<Token>, Reaction) {
            let tokens = Lexer::default().tokenize(input);
            let parsed = parse_reaction(&tokens).expect("starts with a reaction");
            let value = match &parsed.node.value {
                Value::Reaction(r) => r.clone(),
                other => panic!("expected reaction, got {:?}", other),
            };
            (parsed, value)
        }

        #[test]
        fn closed_reaction() {
            let (parsed, r) = reaction("Liked “foo #bar !baz” after");
            assert!(parsed.error.is_none());
            assert_eq!(r.reaction, Some(ReactionKind::Like));
            assert_eq!(r.record, "foo #bar !baz");
            assert_eq!(parsed.node.text, "Liked “foo #bar !baz”");
        }

        #[test]
        fn missing_close_quote() {
            let (parsed, r) = reaction("Emphasized “foo #bar !baz");
            assert_eq!(r.reaction, Some(ReactionKind::Emphasize));
            assert_eq!(r.record, "foo #bar !ba");
            let err = parsed.error.expect("missing quote");
            let violation = err.violation().unwrap();
            assert_eq!(violation.kind, ErrorKind::InvalidReactionFormat);
            assert_eq!(violation.text, "z");
            assert_eq!(violation.message.as_deref(), Some("Missing end quote."));
            assert_eq!(parsed.node.text, "Emphasized “foo #bar !baz");
        }

        #[test]
        fn empty_reaction() {
            let (parsed, r) = reaction("Loved “”");
            assert!(parsed.error.is_none());
            assert_eq!(r.record, "");
            assert_eq!(parsed.consumed, 2);
        }
    }
}

pub mod record {
    //! Assembles a token stream into a [`Record`].

    use crate::core::*;
    use crate::{formula, link, reaction};
    use serde::Serialize;

    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
    pub struct Record {
        pub date: Option<Capture<DateValue>>,
        pub pin: Option<Capture<String>>,
        pub todo: Option<Capture<String>>,
        pub done: Option<Capture<String>>,
        pub reaction: Option<Capture<Reaction>>,
        pub folder: Vec<Capture<String>>,
        pub tag: Vec<Capture<String>>,
        pub mention: Vec<Capture<String>>,
        pub event: Vec<Capture<Event>>,
        pub url: Vec<Capture<String>>,
        pub bean: Vec<Capture<Bean>>,
        pub cell: Vec<Capture<Cell>>,
        pub link: Vec<Capture<Link>>,
        pub formula: Vec<Capture<Formula>>,
        pub error: Vec<Capture<Violation>>,
        /// The whole input, reconstructed from tokens.
        pub text: String,
        /// Text minus date, folder, pin and TODO/DONE tokens, trimmed.
        pub body: String,
        pub chunks: Vec<Capture<Value>>,
    }

    impl Record {
        pub fn has_errors(&self) -> bool {
            !self.error.is_empty()
        }

        pub fn is_dated(&self) -> bool {
            self.date
                .as_ref()
                .is_some_and(|d| d.value.instant().is_some())
        }

        fn push_error(&mut self, token: &Token) {
            if let Some(violation) = token.violation() {
                self.error.push(Capture::new(token, violation.clone(), None));
            }
        }

        fn fold(&mut self, token: &Token, error: Option<Violation>) {
            self.text.push_str(&token.text);
            if !token.kind.is_record_prefix() {
                self.body.push_str(&token.text);
            }
            match &token.value {
                Value::Date(date) => self.date = Some(Capture::new(token, date.clone(), error)),
                Value::Text(text) => {
                    let capture = Capture::new(token, text.clone(), error);
                    match token.kind {
                        TokenType::Pin => self.pin = Some(capture),
                        TokenType::Todo => self.todo = Some(capture),
                        TokenType::Done => self.done = Some(capture),
                        TokenType::Folder => self.folder.push(capture),
                        TokenType::Tag => self.tag.push(capture),
                        TokenType::Mention => self.mention.push(capture),
                        TokenType::Url => self.url.push(capture),
                        _ => {}
                    }
                }
                Value::Bean(bean) => self.bean.push(Capture::new(token, bean.clone(), error)),
                Value::Cell(cell) => self.cell.push(Capture::new(token, cell.clone(), error)),
                Value::Event(event) => self.event.push(Capture::new(token, event.clone(), error)),
                Value::Link(l) => self.link.push(Capture::new(token, l.clone(), error)),
                Value::Formula(f) => self.formula.push(Capture::new(token, f.clone(), error)),
                Value::Reaction(r) => self.reaction = Some(Capture::new(token, r.clone(), error)),
                Value::Error(_) => self.push_error(token),
                Value::Arg(_) => {}
            }
        }
    }

    /// Folds `tokens` into a record, running the sub-parsers at their openers.
    pub fn assemble(tokens: &[Token]) -> Record {
        let mut record = Record::default();
        let mut spans = Vec::with_capacity(tokens.len());
        let mut i = 0;

        while let Some(token) = tokens.get(i) {
            let rest = &tokens[i..];
            let parsed = match token.kind {
                TokenType::FormulaOpen => formula::parse_formula(rest),
                TokenType::LinkOpen => link::parse_link(rest),
                TokenType::ReactionOpen => reaction::parse_reaction(rest),
                _ => None,
            };
            let (node, error, consumed) = match parsed {
                Some(Parsed {
                    consumed,
                    node,
                    error,
                }) => {
                    if let Some(err) = &error {
                        log::debug!("{} bubbled an error at byte {}", node.kind, err.offset);
                        record.push_error(err);
                    }
                    let violation = error.as_ref().and_then(Token::violation).cloned();
                    (node, violation, consumed.max(1))
                }
                None => (token.clone(), None, 1),
            };
            record.fold(&node, error.clone());
            spans.push(Capture::new(&node, node.value.clone(), error));
            i += consumed;
        }

        record.body = record.body.trim().to_owned();
        record.chunks = chunks(spans);
        record
    }

    /// Merges adjacent word/space runs; every other capture stands alone.
    fn chunks(spans: Vec<Capture<Value>>) -> Vec<Capture<Value>> {
        let mut out: Vec<Capture<Value>> = Vec::with_capacity(spans.len());
        for span in spans {
            if let Some(last) = out.last_mut() {
                if last.kind.is_plain_text() && span.kind.is_plain_text() {
                    last.text.push_str(&span.text);
                    last.line_breaks += span.line_breaks;
                    if let Value::Text(v) = &mut last.value {
                        v.push_str(&span.text);
                    }
                    continue;
                }
            }
            out.push(span);
        }
        out
    }

    #[cfg(test)]
    mod tests {
        use crate::core::*;
        use crate::parse;
        use rstest::rstest;

        #[test]
        fn date_is_not_body() {
            let r = parse("2020-01-20 foo bar #baz");
            assert!(r.is_dated());
            assert_eq!(r.body, "foo bar #baz");
            assert_eq!(r.tag[0].value, "baz");
        }

        #[test]
        fn folders_chain() {
            let r = parse("/foo/bar/baz qux");
            let folders: Vec<_> = r.folder.iter().map(|f| f.value.as_str()).collect();
            assert_eq!(folders, vec!["/foo", "/bar", "/baz"]);
            assert_eq!(r.body, "qux");
        }

        #[test]
        fn broken_folder_reports_one_error() {
            let r = parse("/fo#o/bar/baz qux");
            assert_eq!(r.error.len(), 1);
            assert_eq!(r.error[0].value.kind, ErrorKind::InvalidFolderFormat);
            assert_eq!(r.body, "#o/bar/baz qux");
        }

        #[test]
        fn bean_value() {
            let r = parse("+$:100");
            assert_eq!(r.bean.len(), 1);
            assert_eq!(r.bean[0].value.sign, Sign::Plus);
            assert_eq!(r.bean[0].value.symbol, "$");
            assert_eq!(r.bean[0].value.value, "100");
        }

        #[rstest]
        #[case("-$:10.", 1, 1)]
        #[case("-1", 0, 0)]
        #[case("-$$$$$:1", 1, 0)]
        fn beans_and_errors(#[case] input: &str, #[case] beans: usize, #[case] errors: usize) {
            let r = parse(input);
            assert_eq!(r.bean.len(), beans);
            assert_eq!(r.error.len(), errors);
        }

        #[rstest]
        #[case("TODO foo", true, false, "foo")]
        #[case("foo TODO bar", false, false, "foo TODO bar")]
        #[case("/foo/ DONE bar", false, true, "bar")]
        #[case("TODOnt", false, false, "TODOnt")]
        #[case("2020-01-20 todo call", true, false, "call")]
        fn todo_and_done(#[case] input: &str, #[case] todo: bool, #[case] done: bool, #[case] body: &str) {
            let r = parse(input);
            assert_eq!(r.todo.is_some(), todo);
            assert_eq!(r.done.is_some(), done);
            assert_eq!(r.body, body);
        }

        #[test]
        fn events_by_form() {
            let r = parse("...foo bar baz");
            assert_eq!(r.event.len(), 1);
            assert_eq!(r.event[0].value.form, EventForm::Close);
            assert_eq!(r.event[0].value.label, "foo");

            let r = parse("!foo... bar");
            assert_eq!(r.event[0].value.form, EventForm::Open);

            for input in ["!!", "!", "...", "…"] {
                assert!(parse(input).event.is_empty(), "{input}");
            }
        }

        #[test]
        fn formula_in_record() {
            let r = parse("$$(foo) (+ 1 (BEAN bar))");
            assert_eq!(r.formula.len(), 1);
            assert_eq!(r.formula[0].value.name.as_deref(), Some("foo"));
            assert!(r.formula[0].error.is_none());
            assert!(!r.has_errors());
        }

        #[test]
        fn formula_error_reaches_record() {
            let r = parse("$$ (foo) (+ 1 1 !! foo");
            assert_eq!(r.formula.len(), 1);
            assert!(r.formula[0].error.is_some());
            assert_eq!(r.error.len(), 1);
            assert_eq!(r.error[0].value.kind, ErrorKind::InvalidFormulaFuncFormat);
        }

        #[test]
        fn three_formulas() {
            let r = parse("$$ ()(+ 1 1)  $$()(- 2 1) $$(x)(* 3 3)");
            assert_eq!(r.formula.len(), 3);
        }

        #[test]
        fn reactions() {
            let r = parse("Liked “foo #bar !baz”");
            let reaction = r.reaction.unwrap();
            assert_eq!(reaction.value.reaction, Some(ReactionKind::Like));
            assert_eq!(reaction.value.record, "foo #bar !baz");
            assert!(r.tag.is_empty());

            let r = parse("Liked “foo #bar !baz");
            let reaction = r.reaction.unwrap();
            assert_eq!(reaction.value.record, "foo #bar !ba");
            assert!(reaction.error.is_some());
            assert_eq!(r.error.len(), 1);
        }

        #[test]
        fn standard_tokens_follow_a_link_without_image() {
            let r = parse("://(\"a\") #tag @bob +$:1");
            assert_eq!(r.link.len(), 1);
            assert_eq!(r.link[0].text, "://(\"a\")");
            let tags: Vec<_> = r.tag.iter().map(|t| t.value.as_str()).collect();
            assert_eq!(tags, vec!["tag"]);
            assert_eq!(r.mention.len(), 1);
            assert_eq!(r.mention[0].value, "bob");
            assert_eq!(r.bean.len(), 1);
            assert_eq!(r.bean[0].value.value, "1");
            assert!(!r.has_errors());
        }

        #[test]
        fn links_in_record() {
            let r = parse("see ://(\"https://x.y\" \"X\") now");
            assert_eq!(r.link.len(), 1);
            assert_eq!(r.link[0].value.href.as_deref(), Some("https://x.y"));
            assert_eq!(r.link[0].offset, 4);
        }

        #[test]
        fn chunks_merge_plain_text() {
            let r = parse("/foo bar baz qux #quux a b c d   ");
            let kinds: Vec<_> = r.chunks.iter().map(|c| c.kind).collect();
            assert_eq!(
                kinds,
                vec![TokenType::Folder, TokenType::Space, TokenType::Tag, TokenType::Space]
            );
            assert_eq!(r.chunks[1].text, " bar baz qux ");
            assert_eq!(r.chunks[3].text, " a b c d   ");

            let r = parse("/foo $$()(+ 1 1)  aaaa bbb ccc ");
            assert_eq!(r.chunks.len(), 4);
            assert_eq!(r.chunks[2].kind, TokenType::Formula);
            assert_eq!(r.chunks[2].text, "$$()(+ 1 1)");
        }

        #[test]
        fn chunk_texts_rebuild_the_input() {
            let input = "*1 2020-01-20 /a TODO x #y $$()(+ 1 !) ://(\"u\") Liked “q”";
            let r = parse(input);
            let joined: String = r.chunks.iter().map(|c| c.text.as_str()).collect();
            assert_eq!(joined, input);
            assert_eq!(r.text, input);
        }

        #[test]
        fn pin_and_cells() {
            let r = parse("* %weight:72.5,kg");
            assert_eq!(r.pin.as_ref().map(|p| p.value.as_str()), Some("0"));
            assert_eq!(r.cell[0].value.unit.as_deref(), Some("kg"));
            assert_eq!(r.body, "%weight:72.5,kg");
        }

        #[test]
        fn invalid_date_is_kept_but_not_dated() {
            let r = parse("2021-02-30 foo");
            assert!(r.date.is_some());
            assert!(!r.is_dated());
        }

        #[test]
        fn record_json_shape() {
            let r = parse("#a");
            let json = serde_json::to_value(&r).unwrap();
            assert_eq!(json["tag"][0]["value"], "a");
            assert_eq!(json["tag"][0]["type"], "tag");
            assert_eq!(json["tag"][0]["lineBreaks"], 0);
            assert!(json["date"].is_null());
        }
    }
}

pub use crate::config::{ConfigError, Settings};
pub use crate::core::{Token, TokenType, Value};
pub use crate::grammar::Grammar;
pub use crate::lexer::Lexer;
pub use crate::record::{Record, assemble};

/// Tokenizes `input` with the default grammar.
pub fn tokenize(input: &str) -> Vec<Token> {
    Lexer::default().tokenize(input)
}

/// Tokenizes and assembles `input` with the default grammar.
pub fn parse(input: &str) -> Record {
    assemble(&tokenize(input))
}
