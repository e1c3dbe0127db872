//! Outline markup engine for org-style documents.
//! Modules are ordered leaf first: the token model in `core`, the grammar in
//! `dates` and `matchers`, the tokenizer in `parser`, and the live document
//! state in `index`, `commands` and `folding`, with the `agenda` read model
//! on top.
//! All ranges are UTF-8 byte offsets.

pub mod core {
    use crate::dates::DateAndTime;
    use anyhow::{Context, Result};
    use serde::{Deserialize, Serialize};
    use std::{cmp::Ordering, fs, path::Path};
    use uuid::Uuid;

    /* ------------------------------- IDs ------------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct HeadingId(pub Uuid);

    impl HeadingId {
        pub fn new() -> Self {
            Self(Uuid::new_v4())
        }
    }

    /* ------------------------------ Ranges ------------------------------ */

    /// Half-open byte range `[start, start + length)` into a document buffer.
    #[derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
    )]
    pub struct Range {
        pub start: usize,
        pub length: usize,
    }

    impl Range {
        pub fn new(start: usize, length: usize) -> Self {
            Self { start, length }
        }

        pub fn from_bounds(start: usize, end: usize) -> Self {
            Self {
                start,
                length: end.saturating_sub(start),
            }
        }

        /// Saturates at `usize::MAX`; use `checked_end` on untrusted ranges.
        pub fn end(&self) -> usize {
            self.start.saturating_add(self.length)
        }

        pub fn checked_end(&self) -> Option<usize> {
            self.start.checked_add(self.length)
        }

        pub fn is_empty(&self) -> bool {
            self.length == 0
        }

        pub fn contains(&self, pos: usize) -> bool {
            pos >= self.start && pos < self.end()
        }

        pub fn contains_range(&self, other: Range) -> bool {
            other.start >= self.start && other.end() <= self.end()
        }

        /// True when the two ranges share at least one position, or when an
        /// empty range sits strictly inside the other.
        pub fn intersects(&self, other: Range) -> bool {
            other.start < self.end() && self.start < other.end()
        }

        pub fn union(&self, other: Range) -> Range {
            Range::from_bounds(self.start.min(other.start), self.end().max(other.end()))
        }

        pub fn shifted(&self, delta: isize) -> Range {
            Range::new(self.start.saturating_add_signed(delta), self.length)
        }

        pub fn slice<'a>(&self, text: &'a str) -> &'a str {
            text.get(self.start..self.end()).unwrap_or("")
        }
    }

    /* ---------------------------- Token kinds ---------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum TextMarkKind {
        Bold,
        Italic,
        Underline,
        Strike,
        Code,
        Verbatim,
        Highlight,
    }

    impl TextMarkKind {
        /// Kinds in the order the tokenizer claims them. Code and verbatim go
        /// first so their contents are never re-read as other marks.
        pub const ALL: [TextMarkKind; 7] = [
            TextMarkKind::Code,
            TextMarkKind::Verbatim,
            TextMarkKind::Bold,
            TextMarkKind::Italic,
            TextMarkKind::Underline,
            TextMarkKind::Strike,
            TextMarkKind::Highlight,
        ];

        pub fn delimiter(self) -> char {
            match self {
                TextMarkKind::Bold => '*',
                TextMarkKind::Italic => '/',
                TextMarkKind::Underline => '_',
                TextMarkKind::Strike => '+',
                TextMarkKind::Code => '~',
                TextMarkKind::Verbatim => '=',
                TextMarkKind::Highlight => '^',
            }
        }

        /// Contents of literal marks are opaque to every other inline matcher.
        pub fn is_literal(self) -> bool {
            matches!(self, TextMarkKind::Code | TextMarkKind::Verbatim)
        }

        fn rank(self) -> u8 {
            Self::ALL
                .iter()
                .position(|kind| *kind == self)
                .unwrap_or(0) as u8
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum AttachmentKind {
        Text,
        Link,
        Image,
        Sketch,
        Audio,
        Video,
        Location,
    }

    impl AttachmentKind {
        pub fn from_name(name: &str) -> Option<Self> {
            match name {
                "text" => Some(AttachmentKind::Text),
                "link" => Some(AttachmentKind::Link),
                "image" => Some(AttachmentKind::Image),
                "sketch" => Some(AttachmentKind::Sketch),
                "audio" => Some(AttachmentKind::Audio),
                "video" => Some(AttachmentKind::Video),
                "location" => Some(AttachmentKind::Location),
                _ => None,
            }
        }

        pub fn as_str(self) -> &'static str {
            match self {
                AttachmentKind::Text => "text",
                AttachmentKind::Link => "link",
                AttachmentKind::Image => "image",
                AttachmentKind::Sketch => "sketch",
                AttachmentKind::Audio => "audio",
                AttachmentKind::Video => "video",
                AttachmentKind::Location => "location",
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum CheckState {
        Unchecked, // [ ]
        Partial,   // [-]
        Checked,   // [X]
    }

    impl CheckState {
        pub fn from_marker(c: char) -> Option<Self> {
            match c {
                ' ' => Some(CheckState::Unchecked),
                '-' => Some(CheckState::Partial),
                'x' | 'X' => Some(CheckState::Checked),
                _ => None,
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum BlockKind {
        Code,
        Quote,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum BlockEdge {
        Begin,
        End,
    }

    /* ------------------------------ Tokens ------------------------------ */

    /// A heading line together with the planning lines directly below it.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct HeadingToken {
        pub range: Range,
        pub level: usize,
        pub level_range: Range,
        pub planning_range: Option<Range>,
        pub priority_range: Option<Range>,
        pub title_range: Range,
        pub tags_range: Option<Range>,
        /// `SCHEDULED: <...>` including the marker.
        pub schedule_range: Option<Range>,
        /// `DEADLINE: <...>` including the marker.
        pub due_range: Option<Range>,
    }

    /// A classified, range-addressed fragment of document text.
    ///
    /// Begin/end block tokens share one primary range: the whole block, from
    /// the start of the begin line to the end of the end line. They are the
    /// only tokens whose range may contain other tokens' line-level ranges.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    #[serde(tag = "kind", rename_all = "snake_case")]
    pub enum Token {
        Heading(HeadingToken),
        Checkbox {
            range: Range,
            box_range: Range,
            status_range: Range,
            state: CheckState,
        },
        OrderedListItem {
            range: Range,
            prefix_range: Range,
            index_range: Range,
        },
        UnorderedListItem {
            range: Range,
            prefix_range: Range,
        },
        Separator {
            range: Range,
        },
        CodeBlockBegin {
            range: Range,
            marker_range: Range,
            language_range: Option<Range>,
            content_range: Range,
        },
        CodeBlockEnd {
            range: Range,
            marker_range: Range,
            content_range: Range,
        },
        QuoteBlockBegin {
            range: Range,
            marker_range: Range,
            content_range: Range,
        },
        QuoteBlockEnd {
            range: Range,
            marker_range: Range,
            content_range: Range,
        },
        Link {
            range: Range,
            url_range: Range,
            title_range: Range,
            scheme_range: Option<Range>,
        },
        Attachment {
            range: Range,
            attachment: AttachmentKind,
            type_range: Range,
            value_range: Range,
        },
        Timestamp {
            range: Range,
        },
        TextMark {
            range: Range,
            mark: TextMarkKind,
            content_range: Range,
        },
    }

    impl Token {
        pub fn range(&self) -> Range {
            match self {
                Token::Heading(h) => h.range,
                Token::Checkbox { range, .. }
                | Token::OrderedListItem { range, .. }
                | Token::UnorderedListItem { range, .. }
                | Token::Separator { range }
                | Token::CodeBlockBegin { range, .. }
                | Token::CodeBlockEnd { range, .. }
                | Token::QuoteBlockBegin { range, .. }
                | Token::QuoteBlockEnd { range, .. }
                | Token::Link { range, .. }
                | Token::Attachment { range, .. }
                | Token::Timestamp { range }
                | Token::TextMark { range, .. } => *range,
            }
        }

        pub fn kind_name(&self) -> &'static str {
            match self {
                Token::Heading(_) => "heading",
                Token::Checkbox { .. } => "checkbox",
                Token::OrderedListItem { .. } => "ordered_list_item",
                Token::UnorderedListItem { .. } => "unordered_list_item",
                Token::Separator { .. } => "separator",
                Token::CodeBlockBegin { .. } => "code_block_begin",
                Token::CodeBlockEnd { .. } => "code_block_end",
                Token::QuoteBlockBegin { .. } => "quote_block_begin",
                Token::QuoteBlockEnd { .. } => "quote_block_end",
                Token::Link { .. } => "link",
                Token::Attachment { .. } => "attachment",
                Token::Timestamp { .. } => "timestamp",
                Token::TextMark { .. } => "text_mark",
            }
        }

        pub fn as_heading(&self) -> Option<&HeadingToken> {
            match self {
                Token::Heading(h) => Some(h),
                _ => None,
            }
        }

        pub fn is_block(&self) -> bool {
            matches!(
                self,
                Token::CodeBlockBegin { .. }
                    | Token::CodeBlockEnd { .. }
                    | Token::QuoteBlockBegin { .. }
                    | Token::QuoteBlockEnd { .. }
            )
        }

        /// Semantic sub-ranges keyed by name, in a stable order.
        pub fn named_ranges(&self) -> Vec<(&'static str, Range)> {
            let mut out = Vec::new();
            let mut push = |key: &'static str, range: Option<Range>| {
                if let Some(range) = range {
                    out.push((key, range));
                }
            };
            match self {
                Token::Heading(h) => {
                    push("level", Some(h.level_range));
                    push("planning", h.planning_range);
                    push("priority", h.priority_range);
                    push("title", Some(h.title_range));
                    push("tags", h.tags_range);
                    push("schedule", h.schedule_range);
                    push("due", h.due_range);
                }
                Token::Checkbox {
                    box_range,
                    status_range,
                    ..
                } => {
                    push("box", Some(*box_range));
                    push("status", Some(*status_range));
                }
                Token::OrderedListItem {
                    prefix_range,
                    index_range,
                    ..
                } => {
                    push("prefix", Some(*prefix_range));
                    push("index", Some(*index_range));
                }
                Token::UnorderedListItem { prefix_range, .. } => {
                    push("prefix", Some(*prefix_range));
                }
                Token::Separator { .. } | Token::Timestamp { .. } => {}
                Token::CodeBlockBegin {
                    marker_range,
                    language_range,
                    content_range,
                    ..
                } => {
                    push("marker", Some(*marker_range));
                    push("language", *language_range);
                    push("content", Some(*content_range));
                }
                Token::CodeBlockEnd {
                    marker_range,
                    content_range,
                    ..
                }
                | Token::QuoteBlockBegin {
                    marker_range,
                    content_range,
                    ..
                }
                | Token::QuoteBlockEnd {
                    marker_range,
                    content_range,
                    ..
                } => {
                    push("marker", Some(*marker_range));
                    push("content", Some(*content_range));
                }
                Token::Link {
                    url_range,
                    title_range,
                    scheme_range,
                    ..
                } => {
                    push("url", Some(*url_range));
                    push("title", Some(*title_range));
                    push("scheme", *scheme_range);
                }
                Token::Attachment {
                    type_range,
                    value_range,
                    ..
                } => {
                    push("type", Some(*type_range));
                    push("value", Some(*value_range));
                }
                Token::TextMark { content_range, .. } => {
                    push("content", Some(*content_range));
                }
            }
            out
        }

        pub fn sub_range(&self, key: &str) -> Option<Range> {
            self.named_ranges()
                .into_iter()
                .find(|(name, _)| *name == key)
                .map(|(_, range)| range)
        }

        /// Moves every range of the token by `delta` bytes.
        pub fn shift(&mut self, delta: isize) {
            self.for_each_range_mut(|r| *r = r.shifted(delta));
        }

        fn for_each_range_mut(&mut self, mut f: impl FnMut(&mut Range)) {
            fn opt(r: &mut Option<Range>, f: &mut dyn FnMut(&mut Range)) {
                if let Some(r) = r.as_mut() {
                    f(r);
                }
            }
            match self {
                Token::Heading(h) => {
                    f(&mut h.range);
                    f(&mut h.level_range);
                    f(&mut h.title_range);
                    opt(&mut h.planning_range, &mut f);
                    opt(&mut h.priority_range, &mut f);
                    opt(&mut h.tags_range, &mut f);
                    opt(&mut h.schedule_range, &mut f);
                    opt(&mut h.due_range, &mut f);
                }
                Token::Checkbox {
                    range,
                    box_range,
                    status_range,
                    ..
                } => {
                    f(range);
                    f(box_range);
                    f(status_range);
                }
                Token::OrderedListItem {
                    range,
                    prefix_range,
                    index_range,
                } => {
                    f(range);
                    f(prefix_range);
                    f(index_range);
                }
                Token::UnorderedListItem {
                    range,
                    prefix_range,
                } => {
                    f(range);
                    f(prefix_range);
                }
                Token::Separator { range } | Token::Timestamp { range } => f(range),
                Token::CodeBlockBegin {
                    range,
                    marker_range,
                    language_range,
                    content_range,
                } => {
                    f(range);
                    f(marker_range);
                    f(content_range);
                    opt(language_range, &mut f);
                }
                Token::CodeBlockEnd {
                    range,
                    marker_range,
                    content_range,
                }
                | Token::QuoteBlockBegin {
                    range,
                    marker_range,
                    content_range,
                }
                | Token::QuoteBlockEnd {
                    range,
                    marker_range,
                    content_range,
                } => {
                    f(range);
                    f(marker_range);
                    f(content_range);
                }
                Token::Link {
                    range,
                    url_range,
                    title_range,
                    scheme_range,
                } => {
                    f(range);
                    f(url_range);
                    f(title_range);
                    opt(scheme_range, &mut f);
                }
                Token::Attachment {
                    range,
                    type_range,
                    value_range,
                    ..
                } => {
                    f(range);
                    f(type_range);
                    f(value_range);
                }
                Token::TextMark {
                    range,
                    content_range,
                    ..
                } => {
                    f(range);
                    f(content_range);
                }
            }
        }

        /// Tie-breaker for tokens sharing a primary range: containers first,
        /// begin markers before end markers.
        fn rank(&self) -> u8 {
            match self {
                Token::Heading(_) => 0,
                Token::CodeBlockBegin { .. } => 1,
                Token::CodeBlockEnd { .. } => 2,
                Token::QuoteBlockBegin { .. } => 3,
                Token::QuoteBlockEnd { .. } => 4,
                Token::Attachment { .. } => 5,
                Token::Separator { .. } => 6,
                Token::OrderedListItem { .. } => 7,
                Token::UnorderedListItem { .. } => 8,
                Token::Checkbox { .. } => 9,
                Token::Link { .. } => 10,
                Token::Timestamp { .. } => 11,
                Token::TextMark { mark, .. } => 12 + mark.rank(),
            }
        }
    }

    /// Document order: start ascending, enclosing ranges before enclosed ones.
    pub fn token_order(a: &Token, b: &Token) -> Ordering {
        let (ra, rb) = (a.range(), b.range());
        ra.start
            .cmp(&rb.start)
            .then_with(|| rb.end().cmp(&ra.end()))
            .then_with(|| a.rank().cmp(&b.rank()))
    }

    pub fn sort_tokens(tokens: &mut [Token]) {
        tokens.sort_by(token_order);
    }

    /* ------------------------------ Headings ------------------------------ */

    /// Heading entry kept by the document index. The paragraph range runs from
    /// the heading line start to just before the next heading of any level.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct Heading {
        pub id: HeadingId,
        pub token: HeadingToken,
        pub paragraph_range: Range,
    }

    impl Heading {
        pub fn level(&self) -> usize {
            self.token.level
        }

        pub fn range(&self) -> Range {
            self.token.range
        }

        pub fn title<'a>(&self, text: &'a str) -> &'a str {
            self.token.title_range.slice(text)
        }

        pub fn planning<'a>(&self, text: &'a str) -> Option<&'a str> {
            self.token.planning_range.map(|r| r.slice(text))
        }

        pub fn priority(&self, text: &str) -> Option<char> {
            self.token
                .priority_range
                .and_then(|r| r.slice(text).chars().nth(2))
        }

        pub fn tags<'a>(&self, text: &'a str) -> Vec<&'a str> {
            self.token
                .tags_range
                .map(|r| {
                    r.slice(text)
                        .split(':')
                        .filter(|tag| !tag.is_empty())
                        .collect()
                })
                .unwrap_or_default()
        }

        pub fn schedule(&self, text: &str) -> Option<DateAndTime> {
            self.token
                .schedule_range
                .and_then(|r| DateAndTime::from_schedule(r.slice(text)))
        }

        pub fn due(&self, text: &str) -> Option<DateAndTime> {
            self.token
                .due_range
                .and_then(|r| DateAndTime::from_due(r.slice(text)))
        }

        /// Everything after the heading token up to the end of the paragraph.
        pub fn body_range(&self) -> Range {
            let start = self.token.range.end().min(self.paragraph_range.end());
            Range::from_bounds(start, self.paragraph_range.end())
        }
    }

    /* ------------------------------- Config ------------------------------- */

    /// Tokenizer settings. Loaded from JSON; missing fields take defaults.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct ParserConfig {
        /// Words recognised as planning keywords right after the heading stars.
        pub planning_keywords: Vec<String>,
        /// Subset of `planning_keywords` that mark a heading as finished.
        pub finished_keywords: Vec<String>,
    }

    impl Default for ParserConfig {
        fn default() -> Self {
            Self {
                planning_keywords: vec!["TODO".into(), "DONE".into(), "CANCELED".into()],
                finished_keywords: vec!["DONE".into(), "CANCELED".into()],
            }
        }
    }

    impl ParserConfig {
        pub fn from_json_str(json: &str) -> Result<Self> {
            serde_json::from_str(json).context("decoding parser config")
        }

        pub fn from_path(path: &Path) -> Result<Self> {
            let json =
                fs::read_to_string(path).with_context(|| format!("reading config {:?}", path))?;
            Self::from_json_str(&json).with_context(|| format!("loading config {:?}", path))
        }

        pub fn is_finished(&self, keyword: &str) -> bool {
            self.finished_keywords.iter().any(|k| k == keyword)
        }
    }

    /* ---------------------------- Errors (index) ---------------------------- */

    #[derive(Debug, thiserror::Error, PartialEq, Eq)]
    pub enum IndexError {
        #[error("edit delta {delta} does not match the length change {old_len} -> {new_len}")]
        LengthMismatch {
            delta: isize,
            old_len: usize,
            new_len: usize,
        },
        #[error("edited range {start}..{end} is outside the text (length {len})")]
        OutOfBounds { start: usize, end: usize, len: usize },
        #[error("offset {0} is not on a character boundary")]
        NotCharBoundary(usize),
        #[error("edit replaces {replaced} bytes at {start}, which the old text (length {len}) does not have")]
        ReplacedOutOfBounds {
            start: usize,
            replaced: isize,
            len: usize,
        },
        #[error("text outside the edited range differs from the indexed document")]
        TextMismatch,
        #[error("document lock poisoned")]
        Poisoned,
    }

    /* --------------------------- Errors (commands) --------------------------- */

    #[derive(Debug, thiserror::Error, PartialEq, Eq)]
    pub enum CommandError {
        #[error("no heading at {0}")]
        NoHeading(usize),
        #[error("no checkbox at {0}")]
        NoCheckbox(usize),
        #[error("nothing to change")]
        Unchanged,
        #[error("invalid planning keyword {0:?}")]
        InvalidKeyword(String),
        #[error("invalid priority {0:?}, expected A-Z")]
        InvalidPriority(char),
        #[error("invalid tag {0:?}")]
        InvalidTag(String),
        #[error("heading level must be at least 1")]
        InvalidLevel,
        #[error(transparent)]
        Edit(#[from] IndexError),
    }

}

pub mod dates {
    //! Planning dates built on `nom` and `chrono`.
    //!
    //! Grammar of one active timestamp:
    //! `<YYYY-M-D [weekday] [H:MM[-H:MM]] [(+|++|.+)N(d|w|m|y)]>`.
    //! Weekday names are informational and never checked against the date.
    //! Every entry point returns `None` for text outside the grammar.

    use chrono::{Datelike, Duration, Months, NaiveDate, NaiveDateTime, NaiveTime};
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{tag, take_while, take_while1},
        character::complete::{char, digit1, one_of, space0, space1},
        combinator::{all_consuming, map_res, opt, recognize},
        error::{VerboseError, VerboseErrorKind},
        sequence::{delimited, pair, preceded, tuple},
    };
    use serde::Serialize;

    pub(crate) type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    /* ------------------------------ Values ------------------------------ */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
    #[serde(rename_all = "snake_case")]
    pub enum Repeat {
        None,
        Day(u32),
        Week(u32),
        Month(u32),
        Year(u32),
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
    #[serde(rename_all = "snake_case")]
    pub enum DateKind {
        Plain,
        Schedule,
        Due,
    }

    /// A parsed planning date. `duration` is in seconds; zero for a point in time.
    #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
    pub struct DateAndTime {
        pub date: NaiveDateTime,
        pub include_time: bool,
        pub duration: i64,
        pub repeat: Repeat,
        pub kind: DateKind,
    }

    /// Raw pieces of a single `<...>` timestamp.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct Stamp {
        pub date: NaiveDate,
        pub start: Option<NaiveTime>,
        pub end: Option<NaiveTime>,
        pub repeat: Repeat,
    }

    impl Stamp {
        fn instant(&self) -> NaiveDateTime {
            self.date.and_time(self.start.unwrap_or_default())
        }
    }

    impl DateAndTime {
        /// `SCHEDULED: <...>` anywhere in the fragment.
        pub fn from_schedule(fragment: &str) -> Option<Self> {
            Self::after_marker(fragment, "SCHEDULED:", DateKind::Schedule)
        }

        /// `DEADLINE: <...>` anywhere in the fragment.
        pub fn from_due(fragment: &str) -> Option<Self> {
            Self::after_marker(fragment, "DEADLINE:", DateKind::Due)
        }

        /// First `<date [weekday] HH:MM-HH:MM>` in the fragment.
        pub fn from_time_range(fragment: &str) -> Option<Self> {
            let open = fragment.find('<')?;
            let (_, s) = stamp(&fragment[open..]).ok()?;
            s.end?;
            Self::from_stamp(s, DateKind::Plain)
        }

        /// First `<date1>--<date2>` in the fragment; duration is the distance
        /// between the two instants, a missing time reading as midnight.
        pub fn from_date_range(fragment: &str) -> Option<Self> {
            let open = fragment.find('<')?;
            let (_, (first, second)) = date_range(&fragment[open..]).ok()?;
            Self::from_range(first, second, DateKind::Plain)
        }

        /// A fragment that is exactly one timestamp, surrounding blanks aside.
        pub fn from_timestamp(fragment: &str) -> Option<Self> {
            let (_, s) = all_consuming(delimited(space0, stamp, space0))(fragment).ok()?;
            Self::from_stamp(s, DateKind::Plain)
        }

        /// Tries every planning form in turn.
        pub fn parse(fragment: &str) -> Option<Self> {
            if fragment.contains("SCHEDULED:") {
                return Self::from_schedule(fragment);
            }
            if fragment.contains("DEADLINE:") {
                return Self::from_due(fragment);
            }
            Self::from_date_range(fragment)
                .or_else(|| Self::from_timestamp(fragment))
                .or_else(|| Self::from_time_range(fragment))
        }

        fn after_marker(fragment: &str, marker: &str, kind: DateKind) -> Option<Self> {
            let at = fragment.find(marker)? + marker.len();
            let rest = &fragment[at..];
            if let Ok((_, (first, second))) = preceded(space0, date_range)(rest) {
                return Self::from_range(first, second, kind);
            }
            let (_, s) = preceded(space0, stamp)(rest).ok()?;
            Self::from_stamp(s, kind)
        }

        fn from_stamp(s: Stamp, kind: DateKind) -> Option<Self> {
            let duration = match (s.start, s.end) {
                (Some(start), Some(end)) => {
                    let seconds = (end - start).num_seconds();
                    if seconds < 0 {
                        return None;
                    }
                    seconds
                }
                _ => 0,
            };
            Some(Self {
                date: s.instant(),
                include_time: s.start.is_some(),
                duration,
                repeat: s.repeat,
                kind,
            })
        }

        fn from_range(first: Stamp, second: Stamp, kind: DateKind) -> Option<Self> {
            let duration = (second.instant() - first.instant()).num_seconds();
            if duration < 0 {
                return None;
            }
            Some(Self {
                date: first.instant(),
                include_time: first.start.is_some(),
                duration,
                repeat: first.repeat,
                kind,
            })
        }

        pub fn end(&self) -> NaiveDateTime {
            self.date + Duration::seconds(self.duration)
        }

        /// Serializes back to planning syntax, e.g.
        /// `SCHEDULED: <2018-12-05 Wed 09:00 +1d>`.
        pub fn mark_string(&self) -> String {
            let prefix = match self.kind {
                DateKind::Plain => "",
                DateKind::Schedule => "SCHEDULED: ",
                DateKind::Due => "DEADLINE: ",
            };
            let end = self.end();
            let repeat = repeat_suffix(self.repeat);
            let body = if self.duration == 0 {
                format!("<{}{}>", self.format_instant(self.date), repeat)
            } else if self.include_time && end.date() == self.date.date() {
                format!(
                    "<{}-{}{}>",
                    self.format_instant(self.date),
                    end.format("%H:%M"),
                    repeat
                )
            } else {
                format!(
                    "<{}{}>--<{}>",
                    self.format_instant(self.date),
                    repeat,
                    self.format_instant(end)
                )
            };
            format!("{prefix}{body}")
        }

        fn format_instant(&self, at: NaiveDateTime) -> String {
            if self.include_time {
                at.format("%Y-%m-%d %a %H:%M").to_string()
            } else {
                at.format("%Y-%m-%d %a").to_string()
            }
        }

        /// First occurrence on or after `day`, following the repeat rule.
        /// Non-repeating dates in the past have no such occurrence.
        pub fn next_occurrence_on_or_after(&self, day: NaiveDate) -> Option<NaiveDateTime> {
            let start = self.date;
            if start.date() >= day {
                return Some(start);
            }
            let gap_days = (day - start.date()).num_days();
            match self.repeat {
                Repeat::None => None,
                Repeat::Day(n) => step_days(start, gap_days, i64::from(n)),
                Repeat::Week(n) => step_days(start, gap_days, 7 * i64::from(n)),
                Repeat::Month(n) => step_months(start, day, n),
                Repeat::Year(n) => step_months(start, day, n.checked_mul(12)?),
            }
        }
    }

    fn step_days(start: NaiveDateTime, gap_days: i64, every: i64) -> Option<NaiveDateTime> {
        let steps = (gap_days + every - 1) / every;
        start.checked_add_signed(Duration::days(steps * every))
    }

    fn step_months(start: NaiveDateTime, day: NaiveDate, every: u32) -> Option<NaiveDateTime> {
        let months_apart = (day.year() - start.year()) * 12 + day.month() as i32
            - start.month() as i32;
        let mut steps = (months_apart.max(0) as u32) / every;
        loop {
            let candidate = start.checked_add_months(Months::new(steps.checked_mul(every)?))?;
            if candidate.date() >= day {
                return Some(candidate);
            }
            steps += 1;
        }
    }

    fn repeat_suffix(repeat: Repeat) -> String {
        match repeat {
            Repeat::None => String::new(),
            Repeat::Day(n) => format!(" +{n}d"),
            Repeat::Week(n) => format!(" +{n}w"),
            Repeat::Month(n) => format!(" +{n}m"),
            Repeat::Year(n) => format!(" +{n}y"),
        }
    }

    /* ------------------------------ Grammar ------------------------------ */

    pub(crate) fn stamp(i: &str) -> PResult<'_, Stamp> {
        let (i, (_, date, _weekday, times, repeat, _, _)) = tuple((
            char('<'),
            parse_date,
            opt(preceded(space1, weekday)),
            opt(preceded(space1, time_span)),
            opt(preceded(space1, parse_repeat)),
            space0,
            char('>'),
        ))(i)?;
        let (start, end) = match times {
            Some((start, end)) => (Some(start), end),
            None => (None, None),
        };
        Ok((
            i,
            Stamp {
                date,
                start,
                end,
                repeat: repeat.unwrap_or(Repeat::None),
            },
        ))
    }

    pub(crate) fn date_range(i: &str) -> PResult<'_, (Stamp, Stamp)> {
        let (i, (first, _, second)) = tuple((stamp, tag("--"), stamp))(i)?;
        Ok((i, (first, second)))
    }

    /// Recognises a timestamp or a date range and returns the matched text.
    pub(crate) fn recognize_timestamp(i: &str) -> PResult<'_, &str> {
        recognize(pair(stamp, opt(pair(tag("--"), stamp))))(i)
    }

    fn weekday(i: &str) -> PResult<'_, &str> {
        take_while1(|c: char| c.is_alphabetic())(i)
    }

    fn time_span(i: &str) -> PResult<'_, (NaiveTime, Option<NaiveTime>)> {
        pair(parse_time, opt(preceded(char('-'), parse_time)))(i)
    }

    fn parse_repeat(i: &str) -> PResult<'_, Repeat> {
        let parsed: PResult<'_, (&str, u32, char)> = tuple((
            alt((tag("++"), tag(".+"), tag("+"))),
            map_res(digit1, |s: &str| s.parse::<u32>()),
            one_of("dwmy"),
        ))(i);
        let (i, (_, n, unit)) = parsed?;
        let repeat = match (n, unit) {
            (0, _) => Repeat::None,
            (n, 'd') => Repeat::Day(n),
            (n, 'w') => Repeat::Week(n),
            (n, 'm') => Repeat::Month(n),
            (n, _) => Repeat::Year(n),
        };
        Ok((i, repeat))
    }

    fn parse_date(i: &str) -> PResult<'_, NaiveDate> {
        map_res(
            tuple((
                map_res(take_while_m_n(4, 4, char_is_digit), |s: &str| {
                    s.parse::<i32>()
                }),
                char('-'),
                map_res(take_while_m_n(1, 2, char_is_digit), |s: &str| {
                    s.parse::<u32>()
                }),
                char('-'),
                map_res(take_while_m_n(1, 2, char_is_digit), |s: &str| {
                    s.parse::<u32>()
                }),
            )),
            |(y, _, m, _, d)| NaiveDate::from_ymd_opt(y, m, d).ok_or("invalid date"),
        )(i)
    }

    fn parse_time(i: &str) -> PResult<'_, NaiveTime> {
        map_res(
            tuple((
                map_res(take_while_m_n(1, 2, char_is_digit), |s: &str| {
                    s.parse::<u32>()
                }),
                char(':'),
                map_res(take_while_m_n(2, 2, char_is_digit), |s: &str| {
                    s.parse::<u32>()
                }),
            )),
            |(h, _, m)| NaiveTime::from_hms_opt(h, m, 0).ok_or("invalid time"),
        )(i)
    }

    pub(crate) fn take_while_m_n<F>(m: usize, n: usize, cond: F) -> impl Fn(&str) -> PResult<'_, &str>
    where
        F: Fn(char) -> bool + Copy,
    {
        move |i: &str| {
            let scanned: PResult<'_, &str> = take_while(cond)(i);
            let (rest, out) = scanned?;
            if out.len() < m || out.len() > n {
                Err(nom::Err::Error(VerboseError {
                    errors: vec![(i, VerboseErrorKind::Context("m_n"))],
                }))
            } else {
                Ok((rest, out))
            }
        }
    }

    fn char_is_digit(c: char) -> bool {
        c.is_ascii_digit()
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use rstest::rstest;

        fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
            NaiveDate::from_ymd_opt(y, m, d)
                .and_then(|date| date.and_hms_opt(h, min, 0))
                .expect("valid instant")
        }

        #[test]
        fn schedule_without_time_or_repeat() {
            let d = DateAndTime::from_schedule("SCHEDULED: <2018-12-05 Wed>").expect("schedule");
            assert_eq!(d.date, at(2018, 12, 5, 0, 0));
            assert!(!d.include_time);
            assert_eq!(d.repeat, Repeat::None);
            assert_eq!(d.kind, DateKind::Schedule);
            assert_eq!(d.duration, 0);
        }

        #[test]
        fn time_range_duration() {
            let d = DateAndTime::from_time_range("<2018-12-05 Wed 9:00-21:00>").expect("range");
            assert_eq!(d.date, at(2018, 12, 5, 9, 0));
            assert_eq!(d.duration, 43_200);
        }

        #[test]
        fn date_range_with_times() {
            let d = DateAndTime::from_date_range("<2018-12-05 Wed 9:00>--<2018-12-06 Thu 21:00>")
                .expect("range");
            assert_eq!(d.duration, 129_600);
            assert!(d.include_time);
        }

        #[test]
        fn date_range_without_times() {
            let d = DateAndTime::from_date_range("<2018-12-05>--<2018-12-06>").expect("range");
            assert_eq!(d.duration, 86_400);
            assert!(!d.include_time);
        }

        #[test]
        fn time_range_with_repeat() {
            let d = DateAndTime::parse("<2018-12-05 Wed 9:00-21:00 +1d>").expect("parse");
            assert_eq!(d.repeat, Repeat::Day(1));
            assert_eq!(d.duration, 43_200);
            let same = DateAndTime::from_time_range("<2018-12-05 Wed 9:00-21:00 +1d>");
            assert_eq!(same, Some(d));
        }

        #[rstest]
        #[case("DEADLINE: <2020-01-31 Fri 10:30 +2w>", DateKind::Due, Repeat::Week(2))]
        #[case("SCHEDULED: <2020-01-31 ++1m>", DateKind::Schedule, Repeat::Month(1))]
        #[case("SCHEDULED: <2020-01-31 Fri .+3y>", DateKind::Schedule, Repeat::Year(3))]
        #[case("<2020-1-3 Fri>", DateKind::Plain, Repeat::None)]
        #[case("  <2020-01-03 周五 8:05>  ", DateKind::Plain, Repeat::None)]
        fn parses_planning_forms(#[case] input: &str, #[case] kind: DateKind, #[case] repeat: Repeat) {
            let d = DateAndTime::parse(input).expect("parse");
            assert_eq!(d.kind, kind);
            assert_eq!(d.repeat, repeat);
        }

        #[rstest]
        #[case("")]
        #[case("SCHEDULED:")]
        #[case("SCHEDULED: 2018-12-05")]
        #[case("<2018-13-05>")]
        #[case("<2018-02-30 Fri>")]
        #[case("<2018-12-05 25:00>")]
        #[case("<2018-12-05 Wed 21:00-9:00>")]
        #[case("<2018-12-06>--<2018-12-05>")]
        #[case("<18-12-05>")]
        fn rejects_malformed_fragments(#[case] input: &str) {
            assert_eq!(DateAndTime::parse(input), None);
        }

        #[test]
        fn weekday_is_informational() {
            let wrong = DateAndTime::from_timestamp("<2018-12-05 Sun>").expect("parse");
            let right = DateAndTime::from_timestamp("<2018-12-05 Wed>").expect("parse");
            assert_eq!(wrong, right);
        }

        #[test]
        fn time_range_requires_end_time() {
            assert_eq!(DateAndTime::from_time_range("<2018-12-05 Wed 9:00>"), None);
        }

        #[test]
        fn schedule_with_date_range() {
            let d = DateAndTime::from_schedule("SCHEDULED: <2018-12-05>--<2018-12-07>")
                .expect("schedule");
            assert_eq!(d.duration, 2 * 86_400);
            assert_eq!(d.kind, DateKind::Schedule);
        }

        #[rstest]
        #[case("SCHEDULED: <2018-12-05 Wed>")]
        #[case("SCHEDULED: <2018-12-05 Wed 09:00 +1d>")]
        #[case("DEADLINE: <2018-12-05 Wed 09:00-21:00>")]
        #[case("<2018-12-05 Wed 09:00>--<2018-12-06 Thu 21:00>")]
        #[case("<2018-12-05 Wed>--<2018-12-06 Thu>")]
        fn mark_string_is_canonical(#[case] input: &str) {
            let d = DateAndTime::parse(input).expect("parse");
            assert_eq!(d.mark_string(), input);
        }

        #[test]
        fn repeats_expand_forward() {
            let daily = DateAndTime::parse("<2024-01-01 Mon 9:00 +3d>").expect("parse");
            let day = NaiveDate::from_ymd_opt(2024, 1, 5).expect("date");
            assert_eq!(daily.next_occurrence_on_or_after(day), Some(at(2024, 1, 7, 9, 0)));

            let monthly = DateAndTime::parse("<2024-01-31 Wed +1m>").expect("parse");
            let day = NaiveDate::from_ymd_opt(2024, 2, 10).expect("date");
            assert_eq!(monthly.next_occurrence_on_or_after(day), Some(at(2024, 2, 29, 0, 0)));

            let yearly = DateAndTime::parse("<2020-06-01 +2y>").expect("parse");
            let day = NaiveDate::from_ymd_opt(2021, 7, 1).expect("date");
            assert_eq!(yearly.next_occurrence_on_or_after(day), Some(at(2022, 6, 1, 0, 0)));

            let once = DateAndTime::parse("<2020-06-01>").expect("parse");
            assert_eq!(once.next_occurrence_on_or_after(day), None);
            let early = NaiveDate::from_ymd_opt(2019, 1, 1).expect("date");
            assert_eq!(once.next_occurrence_on_or_after(early), Some(at(2020, 6, 1, 0, 0)));
        }
    }
}

pub mod matchers {
    //! One matcher per markup element. A matcher is anchored at a byte offset
    //! and reports a primary range plus named sub-ranges; it never looks past
    //! the `limit` it is given. Line-level matchers are only tried at line
    //! starts. Matchers are pure: claiming and nesting rules live in the
    //! tokenizer.

    use crate::core::{AttachmentKind, BlockEdge, BlockKind, CheckState, ParserConfig, Range, TextMarkKind};
    use crate::dates::{PResult, recognize_timestamp, take_while_m_n};
    use indexmap::IndexMap;
    use nom::{
        branch::alt,
        bytes::complete::{is_not, tag, take_while1},
        character::complete::{char, one_of, space0, space1},
        combinator::opt,
        sequence::{preceded, terminated, tuple},
    };

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum Element {
        Heading,
        Checkbox,
        OrderedListItem,
        UnorderedListItem,
        Separator,
        Block(BlockKind, BlockEdge),
        Attachment,
        Link,
        RawLink,
        Timestamp,
        TextMark(TextMarkKind),
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Match {
        pub element: Element,
        pub range: Range,
        pub captures: IndexMap<&'static str, Range>,
    }

    impl Match {
        fn new(element: Element, range: Range) -> Self {
            Self {
                element,
                range,
                captures: IndexMap::new(),
            }
        }

        fn with(mut self, key: &'static str, range: Range) -> Self {
            self.captures.insert(key, range);
            self
        }

        fn with_opt(self, key: &'static str, range: Option<Range>) -> Self {
            match range {
                Some(range) => self.with(key, range),
                None => self,
            }
        }

        pub fn capture(&self, key: &str) -> Option<Range> {
            self.captures.get(key).copied()
        }
    }

    pub trait ElementMatcher {
        fn element(&self) -> Element;

        fn line_level(&self) -> bool {
            false
        }

        /// Match starting exactly at `at`, ending at or before `limit`.
        fn match_at(&self, text: &str, at: usize, limit: usize) -> Option<Match>;

        /// Non-overlapping matches inside `range`, left to right.
        fn find(&self, text: &str, range: Range) -> Vec<Match> {
            let limit = range.end().min(text.len());
            let mut out = Vec::new();
            let mut pos = range.start.min(limit);
            while pos < limit {
                let anchored = !self.line_level() || pos == 0 || text.as_bytes()[pos - 1] == b'\n';
                if anchored {
                    if let Some(m) = self.match_at(text, pos, limit) {
                        let next = m.range.end();
                        out.push(m);
                        if next > pos {
                            pos = next;
                            continue;
                        }
                    }
                }
                pos = if self.line_level() {
                    line_end(text, pos, limit) + 1
                } else {
                    pos + text[pos..].chars().next().map_or(1, char::len_utf8)
                };
            }
            out
        }
    }

    /* ------------------------------- Lines ------------------------------- */

    /// Position of the `\n` ending the line that contains `at`, or `limit`.
    pub fn line_end(text: &str, at: usize, limit: usize) -> usize {
        text.get(at..limit)
            .and_then(|s| s.find('\n'))
            .map_or(limit, |i| at + i)
    }

    pub fn line_start(text: &str, at: usize) -> usize {
        text.get(..at)
            .and_then(|s| s.rfind('\n'))
            .map_or(0, |i| i + 1)
    }

    pub fn is_blank(line: &str) -> bool {
        line.trim().is_empty()
    }

    /// One or more `*` at column zero followed by a space.
    pub fn is_heading_line(line: &str) -> bool {
        let stars = line.bytes().take_while(|b| *b == b'*').count();
        stars > 0 && line.as_bytes().get(stars) == Some(&b' ')
    }

    fn indent_len(line: &str) -> usize {
        line.bytes().take_while(|b| *b == b' ' || *b == b'\t').count()
    }

    fn ends_line(rest: &str) -> bool {
        rest.is_empty() || rest.starts_with([' ', '\t', '\r'])
    }

    fn blanks(i: &str) -> PResult<'_, &str> {
        space0(i)
    }

    /* ------------------------------ Headings ------------------------------ */

    #[derive(Debug, Clone)]
    pub struct HeadingMatcher {
        keywords: Vec<String>,
    }

    impl HeadingMatcher {
        pub fn new(config: &ParserConfig) -> Self {
            Self {
                keywords: config.planning_keywords.clone(),
            }
        }

        fn keyword_at(&self, rest: &str) -> Option<usize> {
            self.keywords
                .iter()
                .filter(|kw| !kw.is_empty() && rest.starts_with(kw.as_str()))
                .map(|kw| kw.len())
                .find(|len| ends_line(&rest[*len..]))
        }
    }

    fn is_tag_char(c: char) -> bool {
        c.is_alphanumeric() || matches!(c, '_' | '@' | '#' | '%')
    }

    pub(crate) fn is_tag_block(s: &str) -> bool {
        s.len() >= 3
            && s.starts_with(':')
            && s.ends_with(':')
            && s[1..s.len() - 1]
                .split(':')
                .all(|tag| !tag.is_empty() && tag.chars().all(is_tag_char))
    }

    fn priority_cookie(rest: &str) -> bool {
        let b = rest.as_bytes();
        b.len() >= 4
            && b[0] == b'['
            && b[1] == b'#'
            && b[2].is_ascii_uppercase()
            && b[3] == b']'
            && ends_line(&rest[4..])
    }

    /// Entries of a planning line, relative to the line start; `true` marks
    /// a schedule, `false` a deadline. `None` unless the whole line is planning.
    fn planning_entries(line: &str) -> Option<Vec<(bool, Range)>> {
        let (mut rest, _) = blanks(line).ok()?;
        let mut out = Vec::new();
        loop {
            let offset = line.len() - rest.len();
            let (after, (keyword, _, _)) = tuple((
                alt((tag("SCHEDULED:"), tag("DEADLINE:"))),
                blanks,
                recognize_timestamp,
            ))(rest)
            .ok()?;
            out.push((
                keyword == "SCHEDULED:",
                Range::new(offset, rest.len() - after.len()),
            ));
            let (after, _) = blanks(after).ok()?;
            rest = after;
            if is_blank(rest) {
                return Some(out);
            }
        }
    }

    impl ElementMatcher for HeadingMatcher {
        fn element(&self) -> Element {
            Element::Heading
        }

        fn line_level(&self) -> bool {
            true
        }

        fn match_at(&self, text: &str, at: usize, limit: usize) -> Option<Match> {
            let le = line_end(text, at, limit);
            let line = text.get(at..le)?;
            let parsed: PResult<'_, &str> =
                terminated(take_while1(|c: char| c == '*'), char(' '))(line);
            let (_, stars) = parsed.ok()?;
            let level_range = Range::new(at, stars.len());
            let mut pos = at + stars.len() + 1;
            pos += indent_len(&text[pos..le]);

            let planning = self.keyword_at(&text[pos..le]).map(|len| {
                let range = Range::new(pos, len);
                pos += len;
                pos += indent_len(&text[pos..le]);
                range
            });

            let priority = priority_cookie(&text[pos..le]).then(|| {
                let range = Range::new(pos, 4);
                pos += 4;
                pos += indent_len(&text[pos..le]);
                range
            });

            let content = text[pos..le].trim_end();
            let (title_len, tags) = match content.rfind([' ', '\t']) {
                Some(i) if is_tag_block(&content[i + 1..]) => (
                    content[..i].trim_end().len(),
                    Some(Range::new(pos + i + 1, content.len() - i - 1)),
                ),
                None if is_tag_block(content) => (0, Some(Range::new(pos, content.len()))),
                _ => (content.len(), None),
            };
            let title_range = Range::new(pos, title_len);

            let mut end = le;
            let mut schedule = None;
            let mut due = None;
            while end < limit {
                let next_start = end + 1;
                let next_end = line_end(text, next_start, limit);
                let Some(entries) = planning_entries(&text[next_start..next_end]) else {
                    break;
                };
                for (is_schedule, rel) in entries {
                    let range = Range::new(next_start + rel.start, rel.length);
                    let slot = if is_schedule { &mut schedule } else { &mut due };
                    slot.get_or_insert(range);
                }
                end = next_end;
            }

            Some(
                Match::new(Element::Heading, Range::from_bounds(at, end))
                    .with("level", level_range)
                    .with_opt("planning", planning)
                    .with_opt("priority", priority)
                    .with("title", title_range)
                    .with_opt("tags", tags)
                    .with_opt("schedule", schedule)
                    .with_opt("due", due),
            )
        }
    }

    /* ---------------------------- Line elements ---------------------------- */

    #[derive(Debug, Clone, Copy, Default)]
    pub struct AttachmentMatcher;

    const ATTACHMENT_MARKER: &str = "#+ATTACHMENT:";

    impl ElementMatcher for AttachmentMatcher {
        fn element(&self) -> Element {
            Element::Attachment
        }

        fn line_level(&self) -> bool {
            true
        }

        fn match_at(&self, text: &str, at: usize, limit: usize) -> Option<Match> {
            let le = line_end(text, at, limit);
            let line = text.get(at..le)?;
            let indent = indent_len(line);
            let body = &line[indent..];
            let parsed: PResult<'_, (&str, &str, char, &str)> = tuple((
                tag(ATTACHMENT_MARKER),
                take_while1(|c: char| c.is_ascii_lowercase()),
                char('='),
                take_while1(|c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_'),
            ))(body);
            let (rest, (_, kind, _, key)) = parsed.ok()?;
            if !is_blank(rest) {
                return None;
            }
            AttachmentKind::from_name(kind)?;
            let start = at + indent;
            let type_start = start + ATTACHMENT_MARKER.len();
            let value_start = type_start + kind.len() + 1;
            Some(
                Match::new(
                    Element::Attachment,
                    Range::from_bounds(start, value_start + key.len()),
                )
                .with("type", Range::new(type_start, kind.len()))
                .with("value", Range::new(value_start, key.len())),
            )
        }
    }

    #[derive(Debug, Clone, Copy, Default)]
    pub struct SeparatorMatcher;

    impl ElementMatcher for SeparatorMatcher {
        fn element(&self) -> Element {
            Element::Separator
        }

        fn line_level(&self) -> bool {
            true
        }

        fn match_at(&self, text: &str, at: usize, limit: usize) -> Option<Match> {
            let le = line_end(text, at, limit);
            let body = text.get(at..le)?.trim();
            (body.len() >= 5 && body.bytes().all(|b| b == b'-'))
                .then(|| Match::new(Element::Separator, Range::from_bounds(at, le)))
        }
    }

    /// Length of an ordered-list index and its delimiter (`12.`, `b)`).
    fn ordered_prefix(body: &str) -> Option<(usize, usize)> {
        let (rest, (index, _)) = tuple((
            alt((
                take_while_m_n(1, 3, |c: char| c.is_ascii_digit()),
                take_while_m_n(1, 1, |c: char| c.is_ascii_alphabetic()),
            )),
            one_of(".)"),
        ))(body)
        .ok()?;
        ends_line(rest).then_some((index.len() + 1, index.len()))
    }

    fn unordered_prefix(body: &str) -> Option<usize> {
        let first = body.as_bytes().first()?;
        (matches!(first, b'-' | b'+') && ends_line(&body[1..])).then_some(1)
    }

    #[derive(Debug, Clone, Copy, Default)]
    pub struct OrderedListMatcher;

    impl ElementMatcher for OrderedListMatcher {
        fn element(&self) -> Element {
            Element::OrderedListItem
        }

        fn line_level(&self) -> bool {
            true
        }

        fn match_at(&self, text: &str, at: usize, limit: usize) -> Option<Match> {
            let le = line_end(text, at, limit);
            let line = text.get(at..le)?;
            let indent = indent_len(line);
            let (prefix_len, index_len) = ordered_prefix(&line[indent..])?;
            let start = at + indent;
            Some(
                Match::new(Element::OrderedListItem, Range::from_bounds(at, le))
                    .with("prefix", Range::new(start, prefix_len))
                    .with("index", Range::new(start, index_len)),
            )
        }
    }

    #[derive(Debug, Clone, Copy, Default)]
    pub struct UnorderedListMatcher;

    impl ElementMatcher for UnorderedListMatcher {
        fn element(&self) -> Element {
            Element::UnorderedListItem
        }

        fn line_level(&self) -> bool {
            true
        }

        fn match_at(&self, text: &str, at: usize, limit: usize) -> Option<Match> {
            let le = line_end(text, at, limit);
            let line = text.get(at..le)?;
            let indent = indent_len(line);
            let prefix_len = unordered_prefix(&line[indent..])?;
            Some(
                Match::new(Element::UnorderedListItem, Range::from_bounds(at, le))
                    .with("prefix", Range::new(at + indent, prefix_len)),
            )
        }
    }

    /// `[ ]`, `[x]`, `[X]` or `[-]` right after a list prefix.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct CheckboxMatcher;

    impl ElementMatcher for CheckboxMatcher {
        fn element(&self) -> Element {
            Element::Checkbox
        }

        fn line_level(&self) -> bool {
            true
        }

        fn match_at(&self, text: &str, at: usize, limit: usize) -> Option<Match> {
            let le = line_end(text, at, limit);
            let line = text.get(at..le)?;
            let indent = indent_len(line);
            let body = &line[indent..];
            let prefix_len = unordered_prefix(body).or_else(|| ordered_prefix(body).map(|p| p.0))?;
            let parsed: PResult<'_, (&str, char, char, char)> =
                tuple((space1, char('['), one_of(" xX-"), char(']')))(&body[prefix_len..]);
            let (rest, (gap, _, status, _)) = parsed.ok()?;
            if !ends_line(rest) {
                return None;
            }
            CheckState::from_marker(status)?;
            let start = at + indent;
            let box_start = start + prefix_len + gap.len();
            Some(
                Match::new(Element::Checkbox, Range::from_bounds(start, box_start + 3))
                    .with("box", Range::new(box_start, 3))
                    .with("status", Range::new(box_start + 1, 1)),
            )
        }
    }

    /// `#+BEGIN_SRC lang`, `#+END_SRC`, `#+BEGIN_QUOTE`, `#+END_QUOTE` as a
    /// whole line, case-insensitive.
    #[derive(Debug, Clone, Copy)]
    pub struct BlockMarkerMatcher {
        pub kind: BlockKind,
        pub edge: BlockEdge,
    }

    impl BlockMarkerMatcher {
        fn marker(&self) -> &'static str {
            match (self.kind, self.edge) {
                (BlockKind::Code, BlockEdge::Begin) => "#+BEGIN_SRC",
                (BlockKind::Code, BlockEdge::End) => "#+END_SRC",
                (BlockKind::Quote, BlockEdge::Begin) => "#+BEGIN_QUOTE",
                (BlockKind::Quote, BlockEdge::End) => "#+END_QUOTE",
            }
        }
    }

    impl ElementMatcher for BlockMarkerMatcher {
        fn element(&self) -> Element {
            Element::Block(self.kind, self.edge)
        }

        fn line_level(&self) -> bool {
            true
        }

        fn match_at(&self, text: &str, at: usize, limit: usize) -> Option<Match> {
            let le = line_end(text, at, limit);
            let line = text.get(at..le)?;
            let indent = indent_len(line);
            let marker = self.marker();
            let head = line.get(indent..indent + marker.len())?;
            if !head.eq_ignore_ascii_case(marker) {
                return None;
            }
            let rest_start = indent + marker.len();
            let rest = &line[rest_start..];
            let language = match self.edge {
                BlockEdge::End if !is_blank(rest) => return None,
                BlockEdge::End => None,
                BlockEdge::Begin if !ends_line(rest) => return None,
                BlockEdge::Begin if self.kind == BlockKind::Code => {
                    let lead = indent_len(rest);
                    let word = rest[lead..]
                        .bytes()
                        .take_while(|b| !b.is_ascii_whitespace())
                        .count();
                    (word > 0).then(|| Range::new(at + rest_start + lead, word))
                }
                BlockEdge::Begin => None,
            };
            let range = Range::from_bounds(at, le);
            Some(
                Match::new(self.element(), range)
                    .with("marker", range)
                    .with_opt("language", language),
            )
        }
    }

    /* ------------------------------- Inline ------------------------------- */

    fn url_scheme_len(url: &str) -> Option<usize> {
        let first = url.chars().next()?;
        if !first.is_ascii_alphabetic() {
            return None;
        }
        let len = url
            .bytes()
            .take_while(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'.' | b'-'))
            .count();
        (url.as_bytes().get(len) == Some(&b':')).then_some(len)
    }

    /// `[[url][title]]` or `[[url]]`.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct LinkMatcher;

    impl ElementMatcher for LinkMatcher {
        fn element(&self) -> Element {
            Element::Link
        }

        fn match_at(&self, text: &str, at: usize, limit: usize) -> Option<Match> {
            let input = text.get(at..limit)?;
            let parsed: PResult<'_, (&str, &str, Option<&str>, &str)> = tuple((
                tag("[["),
                is_not("[]\n"),
                opt(preceded(tag("]["), is_not("[]\n"))),
                tag("]]"),
            ))(input);
            let (rest, (_, url, title, _)) = parsed.ok()?;
            let url_range = Range::new(at + 2, url.len());
            let title_range = match title {
                Some(title) => Range::new(url_range.end() + 2, title.len()),
                None => url_range,
            };
            Some(
                Match::new(Element::Link, Range::new(at, input.len() - rest.len()))
                    .with("url", url_range)
                    .with("title", title_range)
                    .with_opt("scheme", url_scheme_len(url).map(|len| Range::new(at + 2, len))),
            )
        }
    }

    /// Bare `http://` / `https://` links in running text.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct RawLinkMatcher;

    impl ElementMatcher for RawLinkMatcher {
        fn element(&self) -> Element {
            Element::RawLink
        }

        fn match_at(&self, text: &str, at: usize, limit: usize) -> Option<Match> {
            let before = text.get(..at)?.chars().next_back();
            if !matches!(before, None | Some('(')) && !before.is_some_and(char::is_whitespace) {
                return None;
            }
            let input = text.get(at..limit)?;
            let parsed: PResult<'_, (&str, &str, &str)> = tuple((
                alt((tag("https"), tag("http"))),
                tag("://"),
                take_while1(|c: char| !c.is_whitespace() && !"<>\"[]()".contains(c)),
            ))(input);
            let (_, (scheme, _, body)) = parsed.ok()?;
            let body = body.trim_end_matches(['.', ',', ';', ':', '!', '?', '\'']);
            if body.is_empty() {
                return None;
            }
            let range = Range::new(at, scheme.len() + 3 + body.len());
            Some(
                Match::new(Element::RawLink, range)
                    .with("url", range)
                    .with("title", range)
                    .with("scheme", Range::new(at, scheme.len())),
            )
        }
    }

    /// Active timestamps and date ranges outside planning lines.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct TimestampMatcher;

    impl ElementMatcher for TimestampMatcher {
        fn element(&self) -> Element {
            Element::Timestamp
        }

        fn match_at(&self, text: &str, at: usize, limit: usize) -> Option<Match> {
            let input = text.get(at..limit)?;
            let (_, stamp) = recognize_timestamp(input).ok()?;
            Some(Match::new(Element::Timestamp, Range::new(at, stamp.len())))
        }
    }

    const CJK_OPENING: &str = "，。：；、（「『“‘《【";
    const CJK_CLOSING: &str = "，。：；、）」』”’》】！？";
    const MARK_DELIMITERS: &str = "*/_+~=^";

    fn may_open_after(c: Option<char>) -> bool {
        match c {
            None => true,
            Some(c) => {
                c.is_whitespace()
                    || "({'\"".contains(c)
                    || MARK_DELIMITERS.contains(c)
                    || CJK_OPENING.contains(c)
            }
        }
    }

    fn may_close_before(c: Option<char>) -> bool {
        match c {
            None => true,
            Some(c) => {
                c.is_whitespace()
                    || "-.,:;!?'\")}]".contains(c)
                    || MARK_DELIMITERS.contains(c)
                    || CJK_CLOSING.contains(c)
            }
        }
    }

    /// Symmetric delimiter pair: the closer is the next occurrence of the
    /// delimiter; contents may wrap lines but never cross a blank line.
    #[derive(Debug, Clone, Copy)]
    pub struct TextMarkMatcher {
        pub kind: TextMarkKind,
    }

    impl ElementMatcher for TextMarkMatcher {
        fn element(&self) -> Element {
            Element::TextMark(self.kind)
        }

        fn match_at(&self, text: &str, at: usize, limit: usize) -> Option<Match> {
            let delim = self.kind.delimiter();
            let input = text.get(at..limit)?;
            if !input.starts_with(delim) || !may_open_after(text[..at].chars().next_back()) {
                return None;
            }
            let content_start = at + delim.len_utf8();
            let close = content_start + text[content_start..limit].find(delim)?;
            let content = &text[content_start..close];
            let (first, last) = (content.chars().next()?, content.chars().next_back()?);
            if first.is_whitespace() || last.is_whitespace() {
                return None;
            }
            if content.split('\n').any(is_blank) {
                return None;
            }
            let end = close + delim.len_utf8();
            if !may_close_before(text[end..].chars().next()) {
                return None;
            }
            Some(
                Match::new(self.element(), Range::from_bounds(at, end))
                    .with("content", Range::from_bounds(content_start, close)),
            )
        }
    }

    /* ------------------------------- Table ------------------------------- */

    /// The fixed matcher set, kept in tokenizer priority order.
    #[derive(Debug, Clone)]
    pub struct MatcherTable {
        pub blocks: [BlockMarkerMatcher; 4],
        pub heading: HeadingMatcher,
        pub attachment: AttachmentMatcher,
        pub separator: SeparatorMatcher,
        pub ordered_list: OrderedListMatcher,
        pub unordered_list: UnorderedListMatcher,
        pub checkbox: CheckboxMatcher,
        pub link: LinkMatcher,
        pub raw_link: RawLinkMatcher,
        pub timestamp: TimestampMatcher,
        pub marks: [TextMarkMatcher; 7],
    }

    impl MatcherTable {
        pub fn new(config: &ParserConfig) -> Self {
            let block = |kind, edge| BlockMarkerMatcher { kind, edge };
            Self {
                blocks: [
                    block(BlockKind::Code, BlockEdge::Begin),
                    block(BlockKind::Code, BlockEdge::End),
                    block(BlockKind::Quote, BlockEdge::Begin),
                    block(BlockKind::Quote, BlockEdge::End),
                ],
                heading: HeadingMatcher::new(config),
                attachment: AttachmentMatcher,
                separator: SeparatorMatcher,
                ordered_list: OrderedListMatcher,
                unordered_list: UnorderedListMatcher,
                checkbox: CheckboxMatcher,
                link: LinkMatcher,
                raw_link: RawLinkMatcher,
                timestamp: TimestampMatcher,
                marks: TextMarkKind::ALL.map(|kind| TextMarkMatcher { kind }),
            }
        }

        /// Every matcher, highest priority first.
        pub fn ordered(&self) -> Vec<&dyn ElementMatcher> {
            let mut out: Vec<&dyn ElementMatcher> = Vec::new();
            out.extend(self.blocks.iter().map(|m| m as &dyn ElementMatcher));
            out.push(&self.heading);
            out.push(&self.attachment);
            out.push(&self.separator);
            out.push(&self.ordered_list);
            out.push(&self.unordered_list);
            out.push(&self.checkbox);
            out.push(&self.link);
            out.push(&self.raw_link);
            out.push(&self.timestamp);
            out.extend(self.marks.iter().map(|m| m as &dyn ElementMatcher));
            out
        }

        /// The block marker on the line starting at `at`, if any.
        pub fn block_marker(&self, text: &str, at: usize, limit: usize) -> Option<Match> {
            self.blocks.iter().find_map(|m| m.match_at(text, at, limit))
        }
    }

}

pub mod parser {
    //! Tokenizer driving the matcher table over a range of a document.
    //!
    //! Passes, highest priority first:
    //! - block marker lines are paired; code content becomes opaque and quote
    //!   content only admits inline tokens,
    //! - line elements outside blocks: headings (with planning lines),
    //!   attachments, separators, list items and their checkboxes,
    //! - inline elements per segment: links, timestamps, then text marks.
    //!
    //! A segment is a run of lines without blank lines, block marker lines or
    //! code content, cut in front of every heading line. Inline tokens never
    //! leave their segment, which keeps any paragraph-aligned sub-range parse
    //! identical to the same span of a full parse.

    use crate::core::*;
    use crate::matchers::{
        Element, ElementMatcher, Match, MatcherTable, is_blank, is_heading_line, line_end,
        line_start,
    };
    use log::trace;

    /// Receives tokens in document order.
    pub trait TokenSink {
        fn started(&mut self, _range: Range) {}
        fn token(&mut self, token: Token);
        fn finished(&mut self) {}
    }

    impl TokenSink for Vec<Token> {
        fn token(&mut self, token: Token) {
            self.push(token);
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum LineState {
        Plain,
        Marker,
        CodeContent,
        QuoteContent,
    }

    #[derive(Debug, Clone, Copy)]
    struct Line {
        start: usize,
        end: usize,
        state: LineState,
    }

    /// Working state of one tokenizer run.
    struct Pass<'t> {
        text: &'t str,
        range: Range,
        lines: Vec<Line>,
        tokens: Vec<Token>,
        /// Regions inline tokens may contain but never enter or cut.
        claims: Vec<Range>,
        /// Line-level token ranges, sorted and disjoint.
        structure: Vec<Range>,
    }

    impl<'t> Pass<'t> {
        fn new(text: &'t str, range: Range) -> Self {
            let mut lines = Vec::new();
            let mut pos = range.start;
            loop {
                let end = line_end(text, pos, range.end());
                lines.push(Line {
                    start: pos,
                    end,
                    state: LineState::Plain,
                });
                if end >= range.end() {
                    break;
                }
                pos = end + 1;
            }
            Self {
                text,
                range,
                lines,
                tokens: Vec::new(),
                claims: Vec::new(),
                structure: Vec::new(),
            }
        }

        fn line_text(&self, line: &Line) -> &'t str {
            &self.text[line.start..line.end]
        }

        fn segments(&self) -> Vec<Range> {
            let mut out = Vec::new();
            let mut current: Option<(usize, usize)> = None;
            for line in &self.lines {
                let body = self.line_text(line);
                let opaque = matches!(line.state, LineState::Marker | LineState::CodeContent);
                if opaque || is_blank(body) || is_heading_line(body) {
                    if let Some((start, end)) = current.take() {
                        out.push(Range::from_bounds(start, end));
                    }
                    if opaque || is_blank(body) {
                        continue;
                    }
                }
                current = match current {
                    Some((start, _)) => Some((start, line.end)),
                    None => Some((line.start, line.end)),
                };
            }
            if let Some((start, end)) = current {
                out.push(Range::from_bounds(start, end));
            }
            out
        }
    }

    /// Entries of a sorted, disjoint range list that touch `window`.
    fn overlapping(sorted: &[Range], window: Range) -> &[Range] {
        let first = sorted.partition_point(|r| r.end() <= window.start);
        let last = first + sorted[first..].partition_point(|r| r.start < window.end());
        &sorted[first..last]
    }

    fn nests(a: Range, b: Range) -> bool {
        !a.intersects(b) || a.contains_range(b) || b.contains_range(a)
    }

    fn trigger(element: Element) -> char {
        match element {
            Element::Link => '[',
            Element::RawLink => 'h',
            Element::Timestamp => '<',
            Element::TextMark(kind) => kind.delimiter(),
            _ => '\n',
        }
    }

    /* --------------------------- Token builders --------------------------- */

    fn heading_token(m: &Match) -> Option<HeadingToken> {
        let level_range = m.capture("level")?;
        Some(HeadingToken {
            range: m.range,
            level: level_range.length,
            level_range,
            planning_range: m.capture("planning"),
            priority_range: m.capture("priority"),
            title_range: m.capture("title")?,
            tags_range: m.capture("tags"),
            schedule_range: m.capture("schedule"),
            due_range: m.capture("due"),
        })
    }

    fn line_token(text: &str, m: &Match) -> Option<Token> {
        Some(match m.element {
            Element::Attachment => {
                let type_range = m.capture("type")?;
                Token::Attachment {
                    range: m.range,
                    attachment: AttachmentKind::from_name(type_range.slice(text))?,
                    type_range,
                    value_range: m.capture("value")?,
                }
            }
            Element::Separator => Token::Separator { range: m.range },
            Element::OrderedListItem => Token::OrderedListItem {
                range: m.range,
                prefix_range: m.capture("prefix")?,
                index_range: m.capture("index")?,
            },
            Element::UnorderedListItem => Token::UnorderedListItem {
                range: m.range,
                prefix_range: m.capture("prefix")?,
            },
            Element::Checkbox => {
                let status_range = m.capture("status")?;
                Token::Checkbox {
                    range: m.range,
                    box_range: m.capture("box")?,
                    state: CheckState::from_marker(status_range.slice(text).chars().next()?)?,
                    status_range,
                }
            }
            _ => return None,
        })
    }

    fn inline_token(m: &Match) -> Option<Token> {
        Some(match m.element {
            Element::Link | Element::RawLink => Token::Link {
                range: m.range,
                url_range: m.capture("url")?,
                title_range: m.capture("title")?,
                scheme_range: m.capture("scheme"),
            },
            Element::Timestamp => Token::Timestamp { range: m.range },
            Element::TextMark(mark) => Token::TextMark {
                range: m.range,
                mark,
                content_range: m.capture("content")?,
            },
            _ => return None,
        })
    }

    /* ------------------------------ Tokenizer ------------------------------ */

    /// Stateless apart from its matcher table: equal inputs give equal output.
    #[derive(Debug, Clone)]
    pub struct Tokenizer {
        matchers: MatcherTable,
    }

    impl Tokenizer {
        pub fn new(config: &ParserConfig) -> Self {
            Self {
                matchers: MatcherTable::new(config),
            }
        }

        pub fn matchers(&self) -> &MatcherTable {
            &self.matchers
        }

        /// Tokens of `range` in document order.
        pub fn tokenize(&self, text: &str, range: Range) -> Vec<Token> {
            let mut out = Vec::new();
            self.tokenize_with(text, range, &mut out);
            out
        }

        pub fn tokenize_with(&self, text: &str, range: Range, sink: &mut impl TokenSink) {
            let range = line_aligned(text, range);
            sink.started(range);
            let mut pass = Pass::new(text, range);
            self.scan_blocks(&mut pass);
            let blocks = pass.tokens.len();
            self.scan_lines(&mut pass);
            let lines = pass.tokens.len() - blocks;
            self.scan_inline(&mut pass);
            trace!(
                "tokenized {:?}: {} block, {} line, {} inline tokens",
                range,
                blocks,
                lines,
                pass.tokens.len() - blocks - lines
            );
            sort_tokens(&mut pass.tokens);
            for token in pass.tokens {
                sink.token(token);
            }
            sink.finished();
        }

        /// Block marker lines inside `range`, in order.
        pub fn block_signature(&self, text: &str, range: Range) -> Vec<(BlockKind, BlockEdge)> {
            let range = line_aligned(text, range);
            Pass::new(text, range)
                .lines
                .iter()
                .filter_map(|line| match self.matchers.block_marker(text, line.start, line.end) {
                    Some(Match {
                        element: Element::Block(kind, edge),
                        ..
                    }) => Some((kind, edge)),
                    _ => None,
                })
                .collect()
        }

        fn scan_blocks(&self, pass: &mut Pass<'_>) {
            let text = pass.text;
            let markers: Vec<Option<Match>> = pass
                .lines
                .iter()
                .map(|line| self.matchers.block_marker(text, line.start, line.end))
                .collect();

            let mut i = 0;
            while i < pass.lines.len() {
                let Some(Match {
                    element: Element::Block(kind, BlockEdge::Begin),
                    ..
                }) = markers[i]
                else {
                    i += 1;
                    continue;
                };
                let begin = pass.lines[i];
                let close = (i + 1..pass.lines.len()).find(|&j| {
                    matches!(&markers[j], Some(m) if m.element == Element::Block(kind, BlockEdge::End))
                });
                let (block_end, content_end, last) = match close {
                    Some(j) => (pass.lines[j].end, pass.lines[j].start, j),
                    None => (pass.range.end(), pass.range.end(), pass.lines.len() - 1),
                };
                let range = Range::from_bounds(begin.start, block_end);
                let content_range =
                    Range::from_bounds((begin.end + 1).min(content_end), content_end);
                let marker_range = Range::from_bounds(begin.start, begin.end);
                let language_range = markers[i].as_ref().and_then(|m| m.capture("language"));

                let content_state = match kind {
                    BlockKind::Code => LineState::CodeContent,
                    BlockKind::Quote => LineState::QuoteContent,
                };
                pass.lines[i].state = LineState::Marker;
                for line in &mut pass.lines[i + 1..=last] {
                    line.state = content_state;
                }

                pass.tokens.push(match kind {
                    BlockKind::Code => Token::CodeBlockBegin {
                        range,
                        marker_range,
                        language_range,
                        content_range,
                    },
                    BlockKind::Quote => Token::QuoteBlockBegin {
                        range,
                        marker_range,
                        content_range,
                    },
                });
                if let Some(j) = close {
                    let end = pass.lines[j];
                    pass.lines[j].state = LineState::Marker;
                    let marker_range = Range::from_bounds(end.start, end.end);
                    pass.tokens.push(match kind {
                        BlockKind::Code => Token::CodeBlockEnd {
                            range,
                            marker_range,
                            content_range,
                        },
                        BlockKind::Quote => Token::QuoteBlockEnd {
                            range,
                            marker_range,
                            content_range,
                        },
                    });
                }
                i = last + 1;
            }
        }

        fn scan_lines(&self, pass: &mut Pass<'_>) {
            let text = pass.text;
            let limit = pass.range.end();
            let m = &self.matchers;
            let mut i = 0;
            while i < pass.lines.len() {
                let line = pass.lines[i];
                i += 1;
                if line.state != LineState::Plain {
                    continue;
                }

                if let Some(token) = m
                    .heading
                    .match_at(text, line.start, limit)
                    .as_ref()
                    .and_then(heading_token)
                {
                    let end = token.range.end();
                    pass.claims.push(token.level_range);
                    pass.structure.push(token.range);
                    pass.tokens.push(Token::Heading(token));
                    while i < pass.lines.len() && pass.lines[i].start < end {
                        i += 1;
                    }
                    continue;
                }

                let (start, end) = (line.start, line.end);
                if let Some(found) = m
                    .attachment
                    .match_at(text, start, end)
                    .or_else(|| m.separator.match_at(text, start, end))
                {
                    if let Some(token) = line_token(text, &found) {
                        pass.claims.push(found.range);
                        pass.structure.push(found.range);
                        pass.tokens.push(token);
                    }
                    continue;
                }

                let item = m
                    .ordered_list
                    .match_at(text, start, end)
                    .or_else(|| m.unordered_list.match_at(text, start, end));
                if let Some(item) = item {
                    let Some(token) = line_token(text, &item) else {
                        continue;
                    };
                    if let Some(prefix) = item.capture("prefix") {
                        pass.claims.push(prefix);
                    }
                    pass.structure.push(item.range);
                    pass.tokens.push(token);
                    if let Some(checkbox) = m
                        .checkbox
                        .match_at(text, start, end)
                        .and_then(|c| line_token(text, &c))
                    {
                        pass.tokens.push(checkbox);
                    }
                }
            }
        }

        fn scan_inline(&self, pass: &mut Pass<'_>) {
            let m = &self.matchers;
            let mut order: Vec<&dyn ElementMatcher> =
                vec![&m.link as &dyn ElementMatcher, &m.raw_link, &m.timestamp];
            order.extend(m.marks.iter().map(|mark| mark as &dyn ElementMatcher));

            for segment in pass.segments() {
                let text = pass.text;
                let mut claims = overlapping(&pass.claims, segment).to_vec();
                let structure = overlapping(&pass.structure, segment).to_vec();
                let mut inline: Vec<Range> = Vec::new();

                for matcher in &order {
                    let opener = trigger(matcher.element());
                    let mut pos = segment.start;
                    while let Some(offset) = text[pos..segment.end()].find(opener) {
                        let at = pos + offset;
                        pos = at + opener.len_utf8();
                        if claims.iter().any(|c| c.contains(at)) {
                            continue;
                        }
                        let Some(found) = matcher.match_at(text, at, segment.end()) else {
                            continue;
                        };
                        let candidate = found.range;
                        let fits = claims
                            .iter()
                            .all(|c| !c.intersects(candidate) || candidate.contains_range(*c))
                            && structure.iter().chain(&inline).all(|r| nests(*r, candidate));
                        if !fits {
                            continue;
                        }
                        let Some(token) = inline_token(&found) else {
                            continue;
                        };
                        match found.element {
                            Element::Link | Element::RawLink | Element::Timestamp => {
                                claims.push(candidate)
                            }
                            Element::TextMark(kind) if kind.is_literal() => {
                                if let Some(content) = found.capture("content") {
                                    claims.push(content);
                                }
                            }
                            _ => {}
                        }
                        inline.push(candidate);
                        pass.tokens.push(token);
                        pos = candidate.end();
                    }
                }
            }
        }
    }

    /// Clamps `range` to `text` and widens it to whole lines.
    pub fn line_aligned(text: &str, range: Range) -> Range {
        let len = text.len();
        let mut start = range.start.min(len);
        while !text.is_char_boundary(start) {
            start -= 1;
        }
        let mut end = range.end().min(len).max(start);
        while !text.is_char_boundary(end) {
            end += 1;
        }
        Range::from_bounds(line_start(text, start), line_end(text, end, len))
    }

}

pub mod index {
    //! Live document state: the authoritative token and heading lists of one
    //! buffer, kept current edit by edit.
    //!
    //! An edit re-tokenizes only a re-parse range. The range starts on a unit
    //! boundary (document start, a heading line, or a line after a blank
    //! line), ends on one, never cuts an existing token, and covers the rest
    //! of the document whenever the edit changes which block markers it holds.
    //! The tokenizer never carries state across such a boundary, so the
    //! spliced list equals a full re-parse of the new text.

    use crate::core::*;
    use crate::matchers::{is_blank, is_heading_line, line_end, line_start};
    use crate::parser::{Tokenizer, line_aligned};
    use log::debug;
    use serde::Serialize;
    use std::{
        collections::HashMap,
        sync::{Arc, RwLock},
    };

    /* ------------------------------- Edits ------------------------------- */

    /// A change reported by the editor. `edited_range` is the replacement in
    /// new-text coordinates and `delta` the change in document length.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct EditEvent {
        pub edited_range: Range,
        pub new_text: String,
        pub delta: isize,
    }

    impl EditEvent {
        /// Event for replacing `old_range` of `old_text` with `replacement`.
        pub fn replacement(
            old_text: &str,
            old_range: Range,
            replacement: &str,
        ) -> Result<Self, IndexError> {
            let len = old_text.len();
            let end = within(old_range, len)?;
            for pos in [old_range.start, end] {
                if !old_text.is_char_boundary(pos) {
                    return Err(IndexError::NotCharBoundary(pos));
                }
            }
            let mut new_text = String::with_capacity(len - old_range.length + replacement.len());
            new_text.push_str(&old_text[..old_range.start]);
            new_text.push_str(replacement);
            new_text.push_str(&old_text[end..]);
            Ok(Self {
                edited_range: Range::new(old_range.start, replacement.len()),
                new_text,
                delta: replacement.len() as isize - old_range.length as isize,
            })
        }
    }

    /// End of `range` when it lies inside a text of length `len`.
    fn within(range: Range, len: usize) -> Result<usize, IndexError> {
        match range.checked_end() {
            Some(end) if end <= len => Ok(end),
            _ => Err(IndexError::OutOfBounds {
                start: range.start,
                end: range.end(),
                len,
            }),
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    pub struct EditOutcome {
        /// Span of the new text that was tokenized again.
        pub reparse_range: Range,
        pub removed: usize,
        pub inserted: usize,
    }

    /// Old span `[start, start + old_len)` became `[start, start + new_len)`.
    #[derive(Debug, Clone, Copy)]
    struct Shift {
        start: usize,
        old_len: usize,
        new_len: usize,
    }

    impl Shift {
        fn delta(&self) -> isize {
            self.new_len as isize - self.old_len as isize
        }

        fn map_start(&self, pos: usize) -> usize {
            if pos < self.start {
                pos
            } else if pos >= self.start + self.old_len {
                pos - self.old_len + self.new_len
            } else {
                self.start
            }
        }

        fn map_end(&self, pos: usize) -> usize {
            if pos <= self.start {
                pos
            } else if pos >= self.start + self.old_len {
                pos - self.old_len + self.new_len
            } else {
                self.start + self.new_len
            }
        }

        /// Where an old range lands in the new text.
        fn map(&self, range: Range) -> Range {
            Range::from_bounds(self.map_start(range.start), self.map_end(range.end()))
        }

        /// The old span of a new range that covers the whole edit.
        fn unmap(&self, range: Range) -> Range {
            Range::from_bounds(range.start, range.end().saturating_add_signed(-self.delta()))
        }
    }

    /// Widens `range` to the enclosing unit: back to a heading line, a line
    /// after a blank line or the start; forward to just before a blank or
    /// heading line, or the end.
    fn unit_bounds(text: &str, range: Range) -> Range {
        let len = text.len();
        let mut start = line_start(text, range.start);
        while start > 0 {
            if is_heading_line(&text[start..line_end(text, start, len)]) {
                break;
            }
            let prev = line_start(text, start - 1);
            if is_blank(&text[prev..start - 1]) {
                break;
            }
            start = prev;
        }

        let mut end = line_end(text, range.end(), len);
        while end < len {
            let next_start = end + 1;
            let next_end = line_end(text, next_start, len);
            let next = &text[next_start..next_end];
            if is_blank(next) || is_heading_line(next) {
                break;
            }
            end = next_end;
        }
        Range::from_bounds(start, end)
    }

    /* ------------------------------ Read view ------------------------------ */

    /// Read access shared by the live index and its snapshots. Hierarchy is
    /// derived from heading levels and order on every call.
    pub trait OutlineView {
        fn text(&self) -> &str;
        fn tokens(&self) -> &[Token];
        fn headings(&self) -> &[Heading];

        /// Heading whose paragraph holds `location`; `None` in the preamble
        /// or past the end of the text.
        fn heading_at(&self, location: usize) -> Option<&Heading> {
            if location > self.text().len() {
                return None;
            }
            let headings = self.headings();
            let i = headings.partition_point(|h| h.paragraph_range.start <= location);
            i.checked_sub(1).map(|i| &headings[i])
        }

        /// Tokens whose range holds `location`, the end position included.
        fn tokens_at(&self, location: usize) -> Vec<&Token> {
            if location > self.text().len() {
                return Vec::new();
            }
            let tokens = self.tokens();
            let upper = tokens.partition_point(|t| t.range().start <= location);
            tokens[..upper]
                .iter()
                .filter(|t| t.range().end() >= location)
                .collect()
        }

        fn heading(&self, id: HeadingId) -> Option<&Heading> {
            self.headings().iter().find(|h| h.id == id)
        }

        fn heading_position(&self, id: HeadingId) -> Option<usize> {
            self.headings().iter().position(|h| h.id == id)
        }

        /// Closest preceding heading with a smaller level.
        fn parent(&self, id: HeadingId) -> Option<&Heading> {
            let i = self.heading_position(id)?;
            let headings = self.headings();
            let level = headings[i].level();
            headings[..i].iter().rev().find(|h| h.level() < level)
        }

        fn children(&self, id: HeadingId) -> Vec<&Heading> {
            let Some(i) = self.heading_position(id) else {
                return Vec::new();
            };
            let headings = self.headings();
            shallowest(&headings[i + 1..subtree_end(headings, i)])
        }

        /// Every heading below `id`, in document order.
        fn subheadings(&self, id: HeadingId) -> &[Heading] {
            match self.heading_position(id) {
                Some(i) => &self.headings()[i + 1..subtree_end(self.headings(), i)],
                None => &[],
            }
        }

        fn next_sibling(&self, id: HeadingId) -> Option<&Heading> {
            let siblings = match self.parent(id) {
                Some(parent) => self.children(parent.id),
                None => self.top_level_headings(),
            };
            let at = siblings.iter().position(|h| h.id == id)?;
            siblings.get(at + 1).copied()
        }

        fn top_level_headings(&self) -> Vec<&Heading> {
            shallowest(self.headings())
        }

        /// From the heading line to the end of its last descendant.
        fn subtree_range(&self, id: HeadingId) -> Option<Range> {
            let i = self.heading_position(id)?;
            let headings = self.headings();
            let end = headings
                .get(subtree_end(headings, i))
                .map_or(self.text().len(), |h| h.paragraph_range.start);
            Some(Range::from_bounds(headings[i].paragraph_range.start, end))
        }
    }

    fn subtree_end(headings: &[Heading], i: usize) -> usize {
        let level = headings[i].level();
        headings[i + 1..]
            .iter()
            .position(|h| h.level() <= level)
            .map_or(headings.len(), |p| i + 1 + p)
    }

    /// Headings of `run` without an ancestor inside `run`.
    fn shallowest(run: &[Heading]) -> Vec<&Heading> {
        let mut floor = usize::MAX;
        run.iter()
            .filter(|h| {
                let top = h.level() <= floor;
                floor = floor.min(h.level());
                top
            })
            .collect()
    }

    /* ------------------------------- Index ------------------------------- */

    #[derive(Debug, Clone)]
    pub struct DocumentIndex {
        config: ParserConfig,
        tokenizer: Tokenizer,
        text: String,
        tokens: Vec<Token>,
        headings: Vec<Heading>,
    }

    impl DocumentIndex {
        /// Full parse of a newly opened buffer.
        pub fn attach(text: impl Into<String>, config: &ParserConfig) -> Self {
            let text = text.into();
            let tokenizer = Tokenizer::new(config);
            let tokens = tokenizer.tokenize(&text, Range::new(0, text.len()));
            let mut index = Self {
                config: config.clone(),
                tokenizer,
                text,
                tokens,
                headings: Vec::new(),
            };
            index.rebuild_headings(None);
            debug!(
                "attached document: {} bytes, {} tokens, {} headings",
                index.text.len(),
                index.tokens.len(),
                index.headings.len()
            );
            index
        }

        pub fn config(&self) -> &ParserConfig {
            &self.config
        }

        /// Replaces `old_range` of the current text with `replacement`.
        pub fn replace(&mut self, old_range: Range, replacement: &str) -> Result<EditOutcome, IndexError> {
            let event = EditEvent::replacement(&self.text, old_range, replacement)?;
            self.apply_edit(event)
        }

        /// Brings the index up to date with an edited buffer. On error the
        /// index is left untouched.
        pub fn apply_edit(&mut self, event: EditEvent) -> Result<EditOutcome, IndexError> {
            let shift = self.validate(&event)?;
            let new_text = event.new_text;
            let reparse_range = self.reparse_range(&new_text, shift);
            let old_span = shift.unmap(reparse_range);
            let delta = shift.delta();

            let mut tokens = Vec::with_capacity(self.tokens.len());
            let mut following = Vec::new();
            let mut removed = 0;
            for mut token in std::mem::take(&mut self.tokens) {
                let range = token.range();
                if range.end() <= old_span.start {
                    tokens.push(token);
                } else if range.start >= old_span.end() {
                    token.shift(delta);
                    following.push(token);
                } else {
                    removed += 1;
                }
            }
            let fresh = self.tokenizer.tokenize(&new_text, reparse_range);
            let inserted = fresh.len();
            tokens.extend(fresh);
            tokens.append(&mut following);

            self.text = new_text;
            self.tokens = tokens;
            self.rebuild_headings(Some(shift));

            let outcome = EditOutcome {
                reparse_range,
                removed,
                inserted,
            };
            debug!(
                "edit at {} ({:+} bytes): re-parsed {:?}, {} tokens out, {} in",
                shift.start, delta, reparse_range, removed, inserted
            );
            Ok(outcome)
        }

        pub fn snapshot(&self) -> IndexSnapshot {
            IndexSnapshot {
                text: Arc::from(self.text.as_str()),
                tokens: Arc::from(self.tokens.as_slice()),
                headings: Arc::from(self.headings.as_slice()),
            }
        }

        fn validate(&self, event: &EditEvent) -> Result<Shift, IndexError> {
            let old_len = self.text.len();
            let new = event.new_text.as_str();
            if old_len as isize + event.delta != new.len() as isize {
                return Err(IndexError::LengthMismatch {
                    delta: event.delta,
                    old_len,
                    new_len: new.len(),
                });
            }
            let edited = event.edited_range;
            let end = within(edited, new.len())?;
            for pos in [edited.start, end] {
                if !new.is_char_boundary(pos) {
                    return Err(IndexError::NotCharBoundary(pos));
                }
            }
            let replaced = edited.length as isize - event.delta;
            if replaced < 0 || edited.start + replaced as usize > old_len {
                return Err(IndexError::ReplacedOutOfBounds {
                    start: edited.start,
                    replaced,
                    len: old_len,
                });
            }
            let shift = Shift {
                start: edited.start,
                old_len: replaced as usize,
                new_len: edited.length,
            };
            let (old, new) = (self.text.as_bytes(), new.as_bytes());
            if old[..shift.start] != new[..shift.start]
                || old[shift.start + shift.old_len..] != new[end..]
            {
                return Err(IndexError::TextMismatch);
            }
            Ok(shift)
        }

        fn reparse_range(&self, new_text: &str, shift: Shift) -> Range {
            let len = new_text.len();
            let old_len = self.text.len();
            let mut range = line_aligned(new_text, Range::new(shift.start, shift.new_len));
            loop {
                let mut next = unit_bounds(new_text, range);
                for token in &self.tokens {
                    let mut mapped = shift.map(token.range());
                    // An unterminated block runs to the end of the text, so
                    // text appended behind it lands inside it.
                    if token.is_block() && token.range().end() == old_len {
                        mapped = Range::from_bounds(mapped.start, len);
                    }
                    if mapped.intersects(next) && !next.contains_range(mapped) {
                        next = next.union(mapped);
                    }
                }
                next = line_aligned(new_text, next);
                if next.end() < len {
                    let before = self.tokenizer.block_signature(&self.text, shift.unmap(next));
                    let after = self.tokenizer.block_signature(new_text, next);
                    if before != after {
                        next = Range::from_bounds(next.start, len);
                    }
                }
                if next == range {
                    return range;
                }
                range = next;
            }
        }

        /// Derives headings and paragraph ranges from the token list. Ids are
        /// kept for headings whose start maps onto an old heading's start.
        fn rebuild_headings(&mut self, shift: Option<Shift>) {
            let mut known: HashMap<usize, HeadingId> = HashMap::new();
            for heading in std::mem::take(&mut self.headings) {
                let start = match shift {
                    Some(shift) => shift.map_start(heading.range().start),
                    None => heading.range().start,
                };
                known.entry(start).or_insert(heading.id);
            }

            let tokens: Vec<&HeadingToken> = self.tokens.iter().filter_map(Token::as_heading).collect();
            let len = self.text.len();
            self.headings = tokens
                .iter()
                .enumerate()
                .map(|(i, token)| {
                    let end = tokens.get(i + 1).map_or(len, |next| next.range.start);
                    Heading {
                        id: known.remove(&token.range.start).unwrap_or_else(HeadingId::new),
                        token: (*token).clone(),
                        paragraph_range: Range::from_bounds(token.range.start, end),
                    }
                })
                .collect();
        }
    }

    impl OutlineView for DocumentIndex {
        fn text(&self) -> &str {
            &self.text
        }

        fn tokens(&self) -> &[Token] {
            &self.tokens
        }

        fn headings(&self) -> &[Heading] {
            &self.headings
        }
    }

    /* ------------------------------ Sharing ------------------------------ */

    /// Immutable copy of an index for readers on other threads.
    #[derive(Debug, Clone)]
    pub struct IndexSnapshot {
        text: Arc<str>,
        tokens: Arc<[Token]>,
        headings: Arc<[Heading]>,
    }

    impl OutlineView for IndexSnapshot {
        fn text(&self) -> &str {
            &self.text
        }

        fn tokens(&self) -> &[Token] {
            &self.tokens
        }

        fn headings(&self) -> &[Heading] {
            &self.headings
        }
    }

    /// One document behind a lock: edits are serialized, snapshots can be
    /// taken from any thread.
    #[derive(Debug, Clone)]
    pub struct SharedDocument {
        inner: Arc<RwLock<DocumentIndex>>,
    }

    impl SharedDocument {
        pub fn new(index: DocumentIndex) -> Self {
            Self {
                inner: Arc::new(RwLock::new(index)),
            }
        }

        pub fn attach(text: impl Into<String>, config: &ParserConfig) -> Self {
            Self::new(DocumentIndex::attach(text, config))
        }

        pub fn apply_edit(&self, event: EditEvent) -> Result<EditOutcome, IndexError> {
            self.inner
                .write()
                .map_err(|_| IndexError::Poisoned)?
                .apply_edit(event)
        }

        pub fn replace(&self, old_range: Range, replacement: &str) -> Result<EditOutcome, IndexError> {
            self.inner
                .write()
                .map_err(|_| IndexError::Poisoned)?
                .replace(old_range, replacement)
        }

        pub fn snapshot(&self) -> Result<IndexSnapshot, IndexError> {
            self.read(DocumentIndex::snapshot)
        }

        pub fn read<R>(&self, f: impl FnOnce(&DocumentIndex) -> R) -> Result<R, IndexError> {
            let guard = self.inner.read().map_err(|_| IndexError::Poisoned)?;
            Ok(f(&guard))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use pretty_assertions::assert_eq;
        use rstest::rstest;
        use std::thread;

        const DOC: &str = "\
preamble line
* TODO Alpha :a:
SCHEDULED: <2024-03-01 Fri>
body of *alpha*

** Beta
- [ ] item
*** Gamma
#+BEGIN_SRC sh
echo hi
#+END_SRC
* Delta
text
";

        fn attach(text: &str) -> DocumentIndex {
            DocumentIndex::attach(text, &ParserConfig::default())
        }

        fn titles<'a>(view: &'a impl OutlineView, headings: &[&Heading]) -> Vec<&'a str> {
            headings.iter().map(|h| h.title(view.text())).collect()
        }

        fn id_of(view: &impl OutlineView, title: &str) -> HeadingId {
            view.headings()
                .iter()
                .find(|h| h.title(view.text()) == title)
                .map(|h| h.id)
                .expect("heading present")
        }

        /// Same tokens and headings as a fresh parse, ids aside.
        fn assert_matches_full(index: &DocumentIndex) {
            let full = attach(index.text());
            assert_eq!(index.tokens(), full.tokens());
            let shape = |v: &DocumentIndex| {
                v.headings()
                    .iter()
                    .map(|h| (h.token.clone(), h.paragraph_range))
                    .collect::<Vec<_>>()
            };
            assert_eq!(shape(index), shape(&full));
        }

        fn assert_paragraphs_cover(view: &impl OutlineView) {
            let headings = view.headings();
            let mut pos = headings.first().map_or(view.text().len(), |h| h.paragraph_range.start);
            for h in headings {
                assert_eq!(h.paragraph_range.start, pos);
                pos = h.paragraph_range.end();
            }
            assert_eq!(pos, view.text().len());
        }

        #[test]
        fn attach_derives_headings() {
            let index = attach(DOC);
            let all: Vec<&Heading> = index.headings().iter().collect();
            assert_eq!(titles(&index, &all), vec!["Alpha", "Beta", "Gamma", "Delta"]);
            assert_eq!(all[0].tags(DOC), vec!["a"]);
            assert_eq!(all[0].planning(DOC), Some("TODO"));
            assert!(all[0].schedule(DOC).is_some());
            assert_eq!(all[0].paragraph_range.start, DOC.find("* TODO").expect("alpha"));
            assert_paragraphs_cover(&index);
        }

        #[test]
        fn location_queries() {
            let index = attach(DOC);
            let len = DOC.len();
            assert!(index.heading_at(0).is_none());
            assert_eq!(index.heading_at(len).map(|h| h.title(DOC)), Some("Delta"));
            assert!(index.heading_at(len + 1).is_none());
            let echo = DOC.find("echo").expect("code");
            assert_eq!(index.heading_at(echo).map(|h| h.title(DOC)), Some("Gamma"));

            let mark = DOC.find("*alpha*").expect("mark");
            let names = |at| {
                index
                    .tokens_at(at)
                    .iter()
                    .map(|t| t.kind_name())
                    .collect::<Vec<_>>()
            };
            assert_eq!(names(mark + 1), vec!["text_mark"]);
            assert_eq!(names(mark + 7), vec!["text_mark"]);
            assert_eq!(names(echo), vec!["code_block_begin", "code_block_end"]);
            assert!(index.tokens_at(len + 1).is_empty());
        }

        #[test]
        fn hierarchy_is_derived_from_levels() {
            let index = attach(DOC);
            let (alpha, beta, gamma, delta) = (
                id_of(&index, "Alpha"),
                id_of(&index, "Beta"),
                id_of(&index, "Gamma"),
                id_of(&index, "Delta"),
            );
            assert_eq!(index.parent(gamma).map(|h| h.id), Some(beta));
            assert_eq!(index.parent(beta).map(|h| h.id), Some(alpha));
            assert!(index.parent(alpha).is_none());
            assert_eq!(titles(&index, &index.children(alpha)), vec!["Beta"]);
            assert_eq!(index.subheadings(alpha).len(), 2);
            assert_eq!(titles(&index, &index.top_level_headings()), vec!["Alpha", "Delta"]);
            assert_eq!(index.next_sibling(alpha).map(|h| h.id), Some(delta));
            assert!(index.next_sibling(beta).is_none());
            let start = DOC.find("* TODO").expect("alpha");
            let end = DOC.find("* Delta").expect("delta");
            assert_eq!(index.subtree_range(alpha), Some(Range::from_bounds(start, end)));
            assert_eq!(
                index.subtree_range(delta),
                Some(Range::from_bounds(end, DOC.len()))
            );
        }

        #[test]
        fn uneven_levels_share_a_parent() {
            let text = "* A\n*** B\n** C\n*** D\n";
            let index = attach(text);
            let a = id_of(&index, "A");
            let c = id_of(&index, "C");
            assert_eq!(titles(&index, &index.children(a)), vec!["B", "C"]);
            assert_eq!(index.next_sibling(id_of(&index, "B")).map(|h| h.id), Some(c));
            assert_eq!(index.parent(id_of(&index, "D")).map(|h| h.id), Some(c));
        }

        #[test]
        fn typing_in_a_paragraph_reparses_its_unit() {
            let mut index = attach(DOC);
            let at = DOC.find("body").expect("body") + 4;
            let outcome = index.replace(Range::new(at, 0), "x").expect("edit");
            let start = DOC.find("* TODO").expect("alpha");
            let end = DOC.find("*alpha*").expect("mark") + 8;
            assert_eq!(outcome.reparse_range, Range::from_bounds(start, end));
            assert_eq!(outcome.removed, 3);
            assert_eq!(outcome.inserted, 3);
            assert_matches_full(&index);
        }

        #[test]
        fn edit_inside_block_covers_the_block() {
            let mut index = attach(DOC);
            let at = DOC.find("echo").expect("code");
            let outcome = index.replace(Range::new(at, 4), "printf").expect("edit");
            let block = index.text().find("#+BEGIN_SRC").expect("begin");
            assert!(outcome.reparse_range.start <= block);
            assert!(outcome.reparse_range.end() >= index.text().find("#+END_SRC").expect("end") + 9);
            assert!(outcome.reparse_range.end() < index.text().len());
            assert_matches_full(&index);
        }

        #[rstest]
        #[case::open_block("body", 0, "#+BEGIN_SRC\n")]
        #[case::close_block_early("- [ ]", 0, "#+END_SRC\n")]
        #[case::drop_block_end("#+END_SRC\n", 10, "")]
        #[case::new_heading("text", 0, "** ")]
        #[case::break_heading("** Beta", 3, "Beta")]
        #[case::join_paragraphs("\n\n** Beta", 2, " ")]
        #[case::split_mark("alpha*", 3, "\n\n")]
        #[case::planning_gone("SCHEDULED", 9, "Scheduled")]
        #[case::planning_added("text", 0, "DEADLINE: <2024-04-01>\n")]
        #[case::retitle("Delta", 5, "Delta *bold* :x:")]
        #[case::preamble("preamble", 0, "* ")]
        #[case::at_end("text\n", 5, "more *x*\n")]
        #[case::wipe("preamble", 0, "")]
        fn edits_match_full_parse(#[case] anchor: &str, #[case] delete: usize, #[case] insert: &str) {
            let mut index = attach(DOC);
            let at = DOC.find(anchor).expect("anchor");
            index.replace(Range::new(at, delete), insert).expect("edit");
            assert_matches_full(&index);
            assert_paragraphs_cover(&index);
        }

        #[rstest]
        #[case::heading_after_code("#+BEGIN_SRC\nlet a = 1;\n\n", "* not a heading")]
        #[case::attachment_after_code("#+BEGIN_SRC _x\n\n", "#+ATTACHMENT:audio=A1")]
        #[case::list_after_quote("#+BEGIN_QUOTE\nsaid\n\n", "- [ ] item\n")]
        #[case::same_line("* A\n#+BEGIN_SRC\n", "x *y*")]
        #[case::closing_marker("#+BEGIN_SRC\ncode\n\n", "#+END_SRC\n* After\n")]
        fn appending_behind_an_open_block(#[case] text: &str, #[case] tail: &str) {
            let mut index = attach(text);
            index.replace(Range::new(text.len(), 0), tail).expect("append");
            assert_matches_full(&index);
            assert_paragraphs_cover(&index);
        }

        #[test]
        fn appended_heading_stays_code() {
            let text = "#+BEGIN_SRC\nlet a = 1;\n\n";
            let mut index = attach(text);
            let outcome = index.replace(Range::new(text.len(), 0), "* not a heading").expect("append");
            assert_eq!(outcome.reparse_range, Range::new(0, index.text().len()));
            assert!(index.headings().is_empty());
            let kinds: Vec<_> = index.tokens().iter().map(Token::kind_name).collect();
            assert_eq!(kinds, vec!["code_block_begin"]);
            assert_eq!(index.tokens()[0].range(), Range::new(0, index.text().len()));
        }

        #[test]
        fn delete_everything_then_retype() {
            let mut index = attach(DOC);
            index.replace(Range::new(0, DOC.len()), "").expect("clear");
            assert!(index.tokens().is_empty());
            assert!(index.headings().is_empty());
            index.replace(Range::new(0, 0), "* again\n").expect("type");
            assert_matches_full(&index);
        }

        #[test]
        fn heading_ids_follow_their_headings() {
            let mut index = attach(DOC);
            let before: Vec<HeadingId> = index.headings().iter().map(|h| h.id).collect();
            index.replace(Range::new(0, 0), "new first line\n").expect("prepend");
            let after: Vec<HeadingId> = index.headings().iter().map(|h| h.id).collect();
            assert_eq!(before, after);

            let beta = index.text().find("** Beta").expect("beta");
            index.replace(Range::new(beta, 3), "").expect("unstar");
            let kept: Vec<HeadingId> = index.headings().iter().map(|h| h.id).collect();
            assert_eq!(kept, vec![before[0], before[2], before[3]]);
        }

        #[test]
        fn invalid_edits_leave_the_index_alone() {
            let mut index = attach(DOC);
            let tokens = index.tokens().to_vec();
            let mut event = EditEvent::replacement(DOC, Range::new(0, 0), "x").expect("event");
            event.delta = 3;
            assert!(matches!(
                index.apply_edit(event),
                Err(IndexError::LengthMismatch { .. })
            ));
            assert!(matches!(
                index.replace(Range::new(DOC.len(), 1), ""),
                Err(IndexError::OutOfBounds { .. })
            ));
            let event = EditEvent {
                edited_range: Range::new(0, 1),
                new_text: format!("X{}", &DOC[1..]).replace("Delta", "Delte"),
                delta: 0,
            };
            assert_eq!(index.apply_edit(event), Err(IndexError::TextMismatch));
            let event = EditEvent {
                edited_range: Range::new(2, 0),
                new_text: DOC.to_string() + "xx",
                delta: 2,
            };
            assert!(matches!(
                index.apply_edit(event),
                Err(IndexError::ReplacedOutOfBounds { replaced: -2, .. })
            ));
            let event = EditEvent {
                edited_range: Range::new(2, 2),
                new_text: DOC.to_string() + "xx",
                delta: 2,
            };
            assert_eq!(index.apply_edit(event), Err(IndexError::TextMismatch));
            assert_eq!(index.text(), DOC);
            assert_eq!(index.tokens(), tokens.as_slice());
        }

        #[test]
        fn overflowing_ranges_are_out_of_bounds() {
            let mut index = attach(DOC);
            assert_eq!(
                index.replace(Range::new(usize::MAX, 2), ""),
                Err(IndexError::OutOfBounds {
                    start: usize::MAX,
                    end: usize::MAX,
                    len: DOC.len(),
                })
            );
            let event = EditEvent {
                edited_range: Range::new(usize::MAX, 5),
                new_text: DOC.to_string(),
                delta: 0,
            };
            assert!(matches!(
                index.apply_edit(event),
                Err(IndexError::OutOfBounds { start: usize::MAX, .. })
            ));
            assert_eq!(index.text(), DOC);
            assert_matches_full(&index);
        }

        #[test]
        fn multibyte_text_is_respected() {
            let text = "* Überblick\nnaïve *fett* text\n";
            let mut index = attach(text);
            assert_eq!(
                index.replace(Range::new(3, 0), "x"),
                Err(IndexError::NotCharBoundary(3))
            );
            let at = text.find("fett").expect("mark");
            index.replace(Range::new(at, 4), "grün").expect("edit");
            assert_matches_full(&index);
        }

        #[test]
        fn shared_document_serializes_edits() {
            let shared = SharedDocument::attach(DOC, &ParserConfig::default());
            let writer = {
                let shared = shared.clone();
                thread::spawn(move || {
                    for _ in 0..25 {
                        shared.replace(Range::new(0, 0), "x").expect("edit");
                    }
                })
            };
            let readers: Vec<_> = (0..3)
                .map(|_| {
                    let shared = shared.clone();
                    thread::spawn(move || {
                        for _ in 0..25 {
                            let snapshot = shared.snapshot().expect("snapshot");
                            assert_eq!(snapshot.headings().len(), 4);
                            assert_paragraphs_cover(&snapshot);
                        }
                    })
                })
                .collect();
            writer.join().expect("writer");
            for reader in readers {
                reader.join().expect("reader");
            }
            let text = shared.read(|index| index.text().to_string()).expect("read");
            assert!(text.starts_with(&"x".repeat(25)));
            shared.read(assert_matches_full).expect("read");
        }
    }
}

pub mod commands {
    //! Heading and checkbox edits built from token ranges. A builder reads a
    //! view and returns the `EditEvent` for `DocumentIndex::apply_edit`; it
    //! never changes the view itself.

    use crate::core::*;
    use crate::dates::{DateAndTime, DateKind};
    use crate::index::{EditEvent, OutlineView};
    use crate::matchers::{is_tag_block, line_end, line_start};

    pub const ARCHIVE_TAG: &str = "ARCHIVE";

    fn edit(view: &impl OutlineView, range: Range, text: &str) -> Result<EditEvent, CommandError> {
        Ok(EditEvent::replacement(view.text(), range, text)?)
    }

    fn heading_at(view: &impl OutlineView, location: usize) -> Result<&Heading, CommandError> {
        view.heading_at(location)
            .ok_or(CommandError::NoHeading(location))
    }

    fn blank(b: &u8) -> bool {
        *b == b' ' || *b == b'\t'
    }

    /// `range` plus the blanks after it on its line.
    fn with_trailing_blanks(text: &str, range: Range) -> Range {
        let rest = text.get(range.end()..).unwrap_or("");
        Range::new(range.start, range.length + rest.bytes().take_while(blank).count())
    }

    fn follows_blank(text: &str, at: usize) -> bool {
        text.get(..at)
            .and_then(|s| s.bytes().last())
            .is_some_and(|b| blank(&b))
    }

    /* ------------------------------ Checkboxes ------------------------------ */

    /// Checks an open box; clears a checked or partial one.
    pub fn toggle_checkbox(
        view: &impl OutlineView,
        location: usize,
    ) -> Result<EditEvent, CommandError> {
        let (status_range, state) = view
            .tokens_at(location)
            .into_iter()
            .find_map(|token| match token {
                Token::Checkbox {
                    status_range, state, ..
                } => Some((*status_range, *state)),
                _ => None,
            })
            .ok_or(CommandError::NoCheckbox(location))?;
        let status = match state {
            CheckState::Unchecked => "X",
            CheckState::Partial | CheckState::Checked => " ",
        };
        edit(view, status_range, status)
    }

    /* ------------------------------ Heading line ------------------------------ */

    /// Sets or clears the planning keyword of the heading holding `location`.
    pub fn set_planning(
        view: &impl OutlineView,
        location: usize,
        keyword: Option<&str>,
    ) -> Result<EditEvent, CommandError> {
        let text = view.text();
        let token = &heading_at(view, location)?.token;
        match (keyword, token.planning_range) {
            (Some(keyword), _) if keyword.is_empty() || keyword.contains(char::is_whitespace) => {
                Err(CommandError::InvalidKeyword(keyword.to_string()))
            }
            (Some(keyword), Some(range)) if range.slice(text) == keyword => {
                Err(CommandError::Unchanged)
            }
            (Some(keyword), Some(range)) => edit(view, range, keyword),
            (Some(keyword), None) => edit(
                view,
                Range::new(token.level_range.end() + 1, 0),
                &format!("{keyword} "),
            ),
            (None, Some(range)) => edit(view, with_trailing_blanks(text, range), ""),
            (None, None) => Err(CommandError::Unchanged),
        }
    }

    /// Sets or clears the `[#X]` cookie. Priorities are `A` to `Z`.
    pub fn set_priority(
        view: &impl OutlineView,
        location: usize,
        priority: Option<char>,
    ) -> Result<EditEvent, CommandError> {
        let text = view.text();
        let token = &heading_at(view, location)?.token;
        match (priority, token.priority_range) {
            (Some(p), _) if !p.is_ascii_uppercase() => Err(CommandError::InvalidPriority(p)),
            (Some(p), Some(range)) => {
                let cookie = format!("[#{p}]");
                if range.slice(text) == cookie {
                    Err(CommandError::Unchanged)
                } else {
                    edit(view, range, &cookie)
                }
            }
            (Some(p), None) => {
                let at = token.title_range.start;
                let cookie = if follows_blank(text, at) {
                    format!("[#{p}] ")
                } else {
                    format!(" [#{p}]")
                };
                edit(view, Range::new(at, 0), &cookie)
            }
            (None, Some(range)) => edit(view, with_trailing_blanks(text, range), ""),
            (None, None) => Err(CommandError::Unchanged),
        }
    }

    pub fn add_tag(
        view: &impl OutlineView,
        location: usize,
        tag: &str,
    ) -> Result<EditEvent, CommandError> {
        if tag.contains(':') || !is_tag_block(&format!(":{tag}:")) {
            return Err(CommandError::InvalidTag(tag.to_string()));
        }
        let text = view.text();
        let heading = heading_at(view, location)?;
        if heading.tags(text).contains(&tag) {
            return Err(CommandError::Unchanged);
        }
        match heading.token.tags_range {
            Some(range) => edit(view, Range::new(range.end(), 0), &format!("{tag}:")),
            None => {
                let at = line_end(text, heading.range().start, text.len());
                edit(view, Range::new(at, 0), &format!(" :{tag}:"))
            }
        }
    }

    /// Drops `tag`; the whole tag block goes with the last tag.
    pub fn remove_tag(
        view: &impl OutlineView,
        location: usize,
        tag: &str,
    ) -> Result<EditEvent, CommandError> {
        let text = view.text();
        let heading = heading_at(view, location)?;
        let tags = heading.tags(text);
        let Some(range) = heading.token.tags_range.filter(|_| tags.contains(&tag)) else {
            return Err(CommandError::Unchanged);
        };
        let kept: Vec<&str> = tags.into_iter().filter(|t| *t != tag).collect();
        if !kept.is_empty() {
            return edit(view, range, &format!(":{}:", kept.join(":")));
        }
        // Keep the space after the stars so the line stays a heading.
        let floor = (heading.token.level_range.end() + 1).min(range.start);
        let gap = text[floor..range.start].bytes().rev().take_while(blank).count();
        edit(view, Range::from_bounds(range.start - gap, range.end()), "")
    }

    pub fn archive(view: &impl OutlineView, location: usize) -> Result<EditEvent, CommandError> {
        add_tag(view, location, ARCHIVE_TAG)
    }

    pub fn unarchive(view: &impl OutlineView, location: usize) -> Result<EditEvent, CommandError> {
        remove_tag(view, location, ARCHIVE_TAG)
    }

    pub fn change_level(
        view: &impl OutlineView,
        location: usize,
        level: usize,
    ) -> Result<EditEvent, CommandError> {
        if level == 0 {
            return Err(CommandError::InvalidLevel);
        }
        let token = &heading_at(view, location)?.token;
        if token.level == level {
            return Err(CommandError::Unchanged);
        }
        edit(view, token.level_range, &"*".repeat(level))
    }

    /* ------------------------------- Planning ------------------------------- */

    /// Writes the `SCHEDULED:` entry from `date`. A new entry goes on its own
    /// line under the heading line; `None` removes it.
    pub fn set_schedule(
        view: &impl OutlineView,
        location: usize,
        date: Option<&DateAndTime>,
    ) -> Result<EditEvent, CommandError> {
        set_planning_date(view, location, date, DateKind::Schedule)
    }

    /// Same as `set_schedule` for the `DEADLINE:` entry.
    pub fn set_due(
        view: &impl OutlineView,
        location: usize,
        date: Option<&DateAndTime>,
    ) -> Result<EditEvent, CommandError> {
        set_planning_date(view, location, date, DateKind::Due)
    }

    fn set_planning_date(
        view: &impl OutlineView,
        location: usize,
        date: Option<&DateAndTime>,
        kind: DateKind,
    ) -> Result<EditEvent, CommandError> {
        let text = view.text();
        let token = &heading_at(view, location)?.token;
        let current = match kind {
            DateKind::Due => token.due_range,
            _ => token.schedule_range,
        };
        let Some(date) = date else {
            return match current {
                Some(entry) => edit(view, planning_entry_span(text, entry), ""),
                None => Err(CommandError::Unchanged),
            };
        };
        let mark = DateAndTime {
            kind,
            ..date.clone()
        }
        .mark_string();
        match current {
            Some(entry) if entry.slice(text) == mark => Err(CommandError::Unchanged),
            Some(entry) => edit(view, entry, &mark),
            None => {
                let at = line_end(text, token.range.start, text.len());
                edit(view, Range::new(at, 0), &format!("\n{mark}"))
            }
        }
    }

    /// The whole line, with its leading line break, when the entry is alone
    /// on it; otherwise the entry and the blanks after it.
    fn planning_entry_span(text: &str, entry: Range) -> Range {
        let start = line_start(text, entry.start);
        let end = line_end(text, entry.start, text.len());
        if text[start..end].trim() == entry.slice(text) {
            Range::from_bounds(start.saturating_sub(1), end)
        } else {
            with_trailing_blanks(text, entry)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::index::DocumentIndex;
        use pretty_assertions::assert_eq;
        use rstest::rstest;

        const DOC: &str = "\
* TODO [#B] Plan :work:
SCHEDULED: <2024-03-01 Fri>
- [ ] first
- [X] second
- [-] third
** Notes
body
";

        fn attach(text: &str) -> DocumentIndex {
            DocumentIndex::attach(text, &ParserConfig::default())
        }

        /// Applies the edit, then checks the index against a fresh parse.
        fn apply(event: Result<EditEvent, CommandError>, index: &mut DocumentIndex) {
            let event = event.expect("command");
            index.apply_edit(event).expect("apply");
            let full = attach(index.text());
            assert_eq!(index.tokens(), full.tokens());
            let shape = |v: &DocumentIndex| {
                v.headings()
                    .iter()
                    .map(|h| (h.token.clone(), h.paragraph_range))
                    .collect::<Vec<_>>()
            };
            assert_eq!(shape(index), shape(&full));
        }

        fn first_line(index: &DocumentIndex) -> &str {
            index.text().lines().next().unwrap_or("")
        }

        fn notes(index: &DocumentIndex) -> usize {
            index.text().find("** Notes").expect("notes")
        }

        #[rstest]
        #[case::check("- [ ] first", "- [X] first", CheckState::Checked)]
        #[case::clear("- [X] second", "- [ ] second", CheckState::Unchecked)]
        #[case::clear_partial("- [-] third", "- [ ] third", CheckState::Unchecked)]
        fn toggles_checkboxes(
            #[case] line: &str,
            #[case] expected: &str,
            #[case] after: CheckState,
        ) {
            let mut index = attach(DOC);
            let at = DOC.find(line).expect("line") + 3;
            apply(toggle_checkbox(&index, at), &mut index);
            assert!(index.text().contains(expected));
            let now = index.tokens_at(at).into_iter().find_map(|t| match t {
                Token::Checkbox { state, .. } => Some(*state),
                _ => None,
            });
            assert_eq!(now, Some(after));
        }

        #[test]
        fn checkbox_toggle_needs_a_checkbox() {
            let index = attach(DOC);
            assert_eq!(toggle_checkbox(&index, 0), Err(CommandError::NoCheckbox(0)));
        }

        #[test]
        fn planning_keyword_is_set_and_cleared() {
            let mut index = attach(DOC);
            apply(set_planning(&index, 0, Some("DONE")), &mut index);
            assert_eq!(first_line(&index), "* DONE [#B] Plan :work:");
            assert_eq!(index.headings()[0].planning(index.text()), Some("DONE"));
            assert_eq!(set_planning(&index, 0, Some("DONE")), Err(CommandError::Unchanged));

            apply(set_planning(&index, 0, None), &mut index);
            assert_eq!(first_line(&index), "* [#B] Plan :work:");
            assert_eq!(index.headings()[0].planning(index.text()), None);
            assert_eq!(set_planning(&index, 0, None), Err(CommandError::Unchanged));

            let at = notes(&index);
            apply(set_planning(&index, at, Some("TODO")), &mut index);
            assert!(index.text().contains("\n** TODO Notes\n"));
            assert_eq!(index.headings()[1].planning(index.text()), Some("TODO"));
            assert_eq!(
                set_planning(&index, 0, Some("NOT NOW")),
                Err(CommandError::InvalidKeyword("NOT NOW".into()))
            );
        }

        #[test]
        fn priority_is_set_and_cleared() {
            let mut index = attach(DOC);
            assert_eq!(set_priority(&index, 0, Some('B')), Err(CommandError::Unchanged));
            apply(set_priority(&index, 0, Some('A')), &mut index);
            assert_eq!(index.headings()[0].priority(index.text()), Some('A'));

            apply(set_priority(&index, 0, None), &mut index);
            assert_eq!(first_line(&index), "* TODO Plan :work:");
            assert_eq!(index.headings()[0].priority(index.text()), None);

            let at = notes(&index);
            apply(set_priority(&index, at, Some('C')), &mut index);
            assert!(index.text().contains("\n** [#C] Notes\n"));
            assert_eq!(set_priority(&index, 0, Some('c')), Err(CommandError::InvalidPriority('c')));
        }

        #[test]
        fn priority_after_a_bare_keyword() {
            let mut index = attach("* TODO\n");
            apply(set_priority(&index, 0, Some('A')), &mut index);
            assert_eq!(index.text(), "* TODO [#A]\n");
            assert_eq!(index.headings()[0].priority(index.text()), Some('A'));
        }

        #[test]
        fn tags_are_added_and_removed() {
            let mut index = attach(DOC);
            apply(add_tag(&index, 0, "home"), &mut index);
            assert_eq!(index.headings()[0].tags(index.text()), vec!["work", "home"]);
            assert_eq!(add_tag(&index, 0, "work"), Err(CommandError::Unchanged));

            apply(remove_tag(&index, 0, "work"), &mut index);
            assert_eq!(first_line(&index), "* TODO [#B] Plan :home:");
            apply(remove_tag(&index, 0, "home"), &mut index);
            assert_eq!(first_line(&index), "* TODO [#B] Plan");
            assert!(index.headings()[0].tags(index.text()).is_empty());
            assert_eq!(remove_tag(&index, 0, "home"), Err(CommandError::Unchanged));

            let at = notes(&index);
            apply(add_tag(&index, at, "x"), &mut index);
            assert!(index.text().contains("\n** Notes :x:\n"));
            assert_eq!(
                add_tag(&index, 0, "a:b"),
                Err(CommandError::InvalidTag("a:b".into()))
            );
            assert_eq!(add_tag(&index, 0, ""), Err(CommandError::InvalidTag(String::new())));
        }

        #[test]
        fn archive_round_trip() {
            let mut index = attach(DOC);
            let at = notes(&index);
            apply(archive(&index, at), &mut index);
            assert_eq!(index.headings()[1].tags(index.text()), vec![ARCHIVE_TAG]);
            apply(unarchive(&index, at), &mut index);
            assert!(index.text().contains("\n** Notes\n"));
            assert!(index.headings()[1].tags(index.text()).is_empty());
        }

        #[test]
        fn tag_removal_keeps_a_bare_heading() {
            let mut index = attach("* :solo:\nbody\n");
            apply(remove_tag(&index, 0, "solo"), &mut index);
            assert_eq!(index.text(), "* \nbody\n");
            assert_eq!(index.headings().len(), 1);
        }

        #[test]
        fn schedule_and_due_are_rewritten() {
            let date = DateAndTime::from_timestamp("<2024-04-02 Tue>").expect("date");
            let mut index = attach(DOC);
            apply(set_schedule(&index, 0, Some(&date)), &mut index);
            assert!(index.text().contains("\nSCHEDULED: <2024-04-02 Tue>\n"));
            assert!(!index.text().contains("2024-03-01"));
            let schedule = index.headings()[0].schedule(index.text()).expect("schedule");
            assert_eq!(schedule.date, date.date);
            assert_eq!(set_schedule(&index, 0, Some(&date)), Err(CommandError::Unchanged));

            apply(set_due(&index, 0, Some(&date)), &mut index);
            assert!(index
                .text()
                .starts_with("* TODO [#B] Plan :work:\nDEADLINE: <2024-04-02 Tue>\nSCHEDULED:"));
            let heading = &index.headings()[0];
            assert_eq!(heading.due(index.text()).map(|d| d.date), Some(date.date));
            assert!(heading.schedule(index.text()).is_some());

            apply(set_schedule(&index, 0, None), &mut index);
            assert!(!index.text().contains("SCHEDULED"));
            assert!(index.headings()[0].schedule(index.text()).is_none());
            assert!(index.headings()[0].due(index.text()).is_some());

            let at = notes(&index);
            assert_eq!(set_due(&index, at, None), Err(CommandError::Unchanged));
        }

        #[test]
        fn entry_sharing_a_line_leaves_the_other() {
            let text = "* A\nSCHEDULED: <2024-01-01 Mon> DEADLINE: <2024-01-05 Fri>\nbody\n";
            let mut index = attach(text);
            apply(set_schedule(&index, 0, None), &mut index);
            assert_eq!(index.text(), "* A\nDEADLINE: <2024-01-05 Fri>\nbody\n");
            assert!(index.headings()[0].due(index.text()).is_some());
        }

        #[test]
        fn heading_level_changes_the_outline() {
            let mut index = attach(DOC);
            let at = notes(&index);
            let notes_id = index.headings()[1].id;
            assert!(index.parent(notes_id).is_some());
            apply(change_level(&index, at, 1), &mut index);
            assert!(index.text().contains("\n* Notes\n"));
            assert_eq!(index.headings()[1].id, notes_id);
            assert!(index.parent(notes_id).is_none());
            assert_eq!(index.top_level_headings().len(), 2);

            assert_eq!(change_level(&index, at, 1), Err(CommandError::Unchanged));
            assert_eq!(change_level(&index, at, 0), Err(CommandError::InvalidLevel));
        }

        #[test]
        fn preamble_has_no_heading() {
            let index = attach("intro\n* A\n");
            assert_eq!(set_priority(&index, 0, Some('A')), Err(CommandError::NoHeading(0)));
            assert_eq!(change_level(&index, 2, 2), Err(CommandError::NoHeading(2)));
        }
    }
}

pub mod folding {
    //! Fold state as a side table keyed by heading id. Hidden ranges are
    //! derived from the current headings on every query, so they follow edits
    //! without bookkeeping.

    use crate::core::{Heading, HeadingId, Range};
    use crate::index::OutlineView;
    use std::collections::BTreeSet;

    /// What a fold of `heading` hides: from just past the heading token's line
    /// break to the end of its paragraph. `None` for an empty body.
    pub fn hidden_range(text: &str, heading: &Heading) -> Option<Range> {
        let token_end = heading.token.range.end();
        let start = match text.as_bytes().get(token_end) {
            Some(b'\n') => token_end + 1,
            _ => token_end,
        };
        let end = heading.paragraph_range.end();
        (start < end).then(|| Range::from_bounds(start, end))
    }

    /// The range in `ranges` holding `at`, widened through every range that
    /// touches it without a gap.
    ///
    /// Hidden ranges of one index never touch: each ends where the next
    /// heading line starts, and that line stays visible. Merging only joins
    /// ranges from other sources, such as folds of several views.
    pub fn merge_adjacent(ranges: &[Range], at: usize) -> Option<Range> {
        let mut sorted = ranges.to_vec();
        sorted.sort();
        let i = sorted.iter().position(|r| r.contains(at))?;
        let mut merged = sorted[i];
        for r in sorted[..i].iter().rev() {
            if r.end() < merged.start {
                break;
            }
            merged = merged.union(*r);
        }
        for r in &sorted[i + 1..] {
            if r.start > merged.end() {
                break;
            }
            merged = merged.union(*r);
        }
        Some(merged)
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct FoldingState {
        folded: BTreeSet<HeadingId>,
    }

    impl FoldingState {
        pub fn new() -> Self {
            Self::default()
        }

        /// Returns false when the heading was already folded.
        pub fn fold(&mut self, heading: &Heading) -> bool {
            self.folded.insert(heading.id)
        }

        pub fn unfold(&mut self, id: HeadingId) -> bool {
            self.folded.remove(&id)
        }

        /// Flips the fold and returns the new state.
        pub fn toggle(&mut self, id: HeadingId) -> bool {
            if self.folded.remove(&id) {
                false
            } else {
                self.folded.insert(id)
            }
        }

        pub fn is_folded(&self, id: HeadingId) -> bool {
            self.folded.contains(&id)
        }

        pub fn folded_ids(&self) -> impl Iterator<Item = HeadingId> + '_ {
            self.folded.iter().copied()
        }

        /// Hidden ranges in document order.
        pub fn folded_ranges(&self, view: &impl OutlineView) -> Vec<Range> {
            view.headings()
                .iter()
                .filter(|h| self.folded.contains(&h.id))
                .filter_map(|h| hidden_range(view.text(), h))
                .collect()
        }

        pub fn folded_range(&self, view: &impl OutlineView, at: usize) -> Option<Range> {
            self.folded_ranges(view).into_iter().find(|r| r.contains(at))
        }

        /// Like `folded_range`, merged with the folds it touches.
        pub fn merged_folded_range(&self, view: &impl OutlineView, at: usize) -> Option<Range> {
            merge_adjacent(&self.folded_ranges(view), at)
        }

        /// Folds every heading with a body and returns how many folds it added.
        pub fn fold_all(&mut self, view: &impl OutlineView) -> usize {
            let mut added = 0;
            for heading in view.headings() {
                if hidden_range(view.text(), heading).is_some() && self.folded.insert(heading.id) {
                    added += 1;
                }
            }
            added
        }

        pub fn unfold_all(&mut self) {
            self.folded.clear();
        }

        /// Folds the heading whose paragraph holds `location`.
        pub fn fold_to(&mut self, view: &impl OutlineView, location: usize) -> bool {
            view.heading_at(location)
                .is_some_and(|heading| self.fold(heading))
        }

        /// Unfolds the heading whose paragraph holds `location` and all of its
        /// ancestors. Returns how many folds were removed.
        pub fn unfold_to(&mut self, view: &impl OutlineView, location: usize) -> usize {
            let mut removed = 0;
            let mut current = view.heading_at(location);
            while let Some(heading) = current {
                if self.folded.remove(&heading.id) {
                    removed += 1;
                }
                current = view.parent(heading.id);
            }
            removed
        }

        /// Forgets folds of headings that no longer exist.
        pub fn retain_existing(&mut self, view: &impl OutlineView) {
            self.folded
                .retain(|id| view.headings().iter().any(|h| h.id == *id));
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::core::ParserConfig;
        use crate::index::DocumentIndex;

        const DOC: &str = "* One\nSCHEDULED: <2024-01-02>\nfirst body\n* Two\n* Three\nthird\nbody\n";

        fn index() -> DocumentIndex {
            DocumentIndex::attach(DOC, &ParserConfig::default())
        }

        #[test]
        fn fold_hides_the_body_only() {
            let index = index();
            let mut folds = FoldingState::new();
            let one = &index.headings()[0];
            assert!(folds.fold(one));
            assert!(!folds.fold(one));

            let body = DOC.find("first").expect("body");
            let two = DOC.find("* Two").expect("two");
            assert_eq!(folds.folded_range(&index, body), Some(Range::from_bounds(body, two)));
            assert_eq!(folds.folded_range(&index, 0), None);
            assert_eq!(folds.folded_range(&index, DOC.find("SCHEDULED").expect("planning")), None);
            assert_eq!(folds.folded_range(&index, two), None);

            assert!(folds.unfold(one.id));
            assert_eq!(folds.folded_range(&index, body), None);
        }

        #[test]
        fn empty_body_hides_nothing() {
            let index = index();
            let mut folds = FoldingState::new();
            let two = &index.headings()[1];
            assert!(folds.toggle(two.id));
            assert!(folds.is_folded(two.id));
            assert!(folds.folded_ranges(&index).is_empty());
            assert!(!folds.toggle(two.id));
        }

        #[test]
        fn folds_follow_edits() {
            let mut index = index();
            let mut folds = FoldingState::new();
            folds.fold(&index.headings()[2]);
            index.replace(Range::new(0, 0), "intro\n\n").expect("edit");
            let third = index.text().find("third").expect("body");
            assert_eq!(
                folds.folded_range(&index, third),
                Some(Range::from_bounds(third, index.text().len()))
            );

            let three = index.text().find("* Three").expect("three");
            index.replace(Range::new(three, 2), "").expect("unstar");
            folds.retain_existing(&index);
            assert_eq!(folds.folded_ids().count(), 0);
        }

        #[test]
        fn merge_extends_through_touching_ranges() {
            let ranges = [Range::new(20, 5), Range::new(4, 6), Range::new(10, 4), Range::new(15, 5)];
            assert_eq!(merge_adjacent(&ranges, 5), Some(Range::new(4, 10)));
            assert_eq!(merge_adjacent(&ranges, 13), Some(Range::new(4, 10)));
            assert_eq!(merge_adjacent(&ranges, 16), Some(Range::new(15, 10)));
            assert_eq!(merge_adjacent(&ranges, 14), None);
            assert_eq!(merge_adjacent(&[], 0), None);
        }

        #[test]
        fn neighbouring_folds_stay_apart() {
            let text = "* A\na body\n** B\nb body\n* C\nc body\n";
            let index = DocumentIndex::attach(text, &ParserConfig::default());
            let mut folds = FoldingState::new();
            assert_eq!(folds.fold_all(&index), 3);
            let ranges = folds.folded_ranges(&index);
            for pair in ranges.windows(2) {
                assert!(pair[0].end() < pair[1].start);
            }
            for range in &ranges {
                assert_eq!(folds.merged_folded_range(&index, range.start), Some(*range));
            }
        }

        #[test]
        fn fold_all_skips_empty_bodies() {
            let index = index();
            let mut folds = FoldingState::new();
            assert_eq!(folds.fold_all(&index), 2);
            assert!(!folds.is_folded(index.headings()[1].id));
            assert_eq!(folds.fold_all(&index), 0);
            assert_eq!(folds.folded_ranges(&index).len(), 2);
            folds.unfold_all();
            assert_eq!(folds.folded_ids().count(), 0);
        }

        #[test]
        fn unfold_to_opens_the_path() {
            let text = "* A\na body\n** B\nb body\n*** C\nc body\n* D\nd body\n";
            let index = DocumentIndex::attach(text, &ParserConfig::default());
            let mut folds = FoldingState::new();
            assert_eq!(folds.fold_all(&index), 4);

            let c_body = text.find("c body").expect("c");
            assert_eq!(folds.unfold_to(&index, c_body), 3);
            assert_eq!(folds.folded_range(&index, c_body), None);
            let d = &index.headings()[3];
            assert!(folds.is_folded(d.id));
            assert_eq!(folds.unfold_to(&index, c_body), 0);

            let b_body = text.find("b body").expect("b");
            assert!(folds.fold_to(&index, b_body));
            assert!(!folds.fold_to(&index, b_body));
            assert_eq!(
                folds.folded_range(&index, b_body),
                Some(Range::from_bounds(b_body, text.find("*** C").expect("c heading")))
            );
            assert!(!folds.fold_to(&DocumentIndex::attach("intro\n", &ParserConfig::default()), 0));
        }
    }
}

pub mod agenda {
    //! Read-model helpers for planning views: projections of scheduled and
    //! deadline headings, built from any `OutlineView`.

    use crate::core::{HeadingId, ParserConfig};
    use crate::dates::DateAndTime;
    use crate::index::OutlineView;
    use chrono::{NaiveDate, NaiveDateTime};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum AgendaWhenKind {
        Scheduled,
        Deadline,
    }

    /// Denormalized slice of a heading for agenda lists.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct AgendaItem {
        pub heading_id: HeadingId,
        pub when_kind: AgendaWhenKind,
        pub date: DateAndTime,
        pub title: String,
        pub planning: Option<String>,
        pub priority: Option<char>,
        pub finished: bool,
        pub tags: Vec<String>,
        pub context_path: Vec<String>, // ancestor titles, outermost first
    }

    impl AgendaItem {
        /// First occurrence of this item inside `range`, repeats expanded.
        pub fn occurrence_within(&self, range: &AgendaRange) -> Option<NaiveDateTime> {
            self.date
                .next_occurrence_on_or_after(range.from)
                .filter(|at| range.contains(*at))
        }
    }

    /// Inclusive day range for multi-day agendas.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct AgendaRange {
        pub from: NaiveDate,
        pub to: NaiveDate,
    }

    impl AgendaRange {
        pub fn contains(&self, at: NaiveDateTime) -> bool {
            let day = at.date();
            day >= self.from && day <= self.to
        }
    }

    /// One item per schedule and per deadline, in document order.
    pub fn project(view: &impl OutlineView, config: &ParserConfig) -> Vec<AgendaItem> {
        let text = view.text();
        let mut out = Vec::new();
        let mut path: Vec<(usize, String)> = Vec::new();
        for h in view.headings() {
            while path.last().is_some_and(|(level, _)| *level >= h.level()) {
                path.pop();
            }
            let context_path: Vec<String> = path.iter().map(|(_, title)| title.clone()).collect();
            let title = h.title(text).to_string();
            let planning = h.planning(text).map(str::to_string);
            let finished = planning.as_deref().is_some_and(|kw| config.is_finished(kw));

            let dates = [
                (AgendaWhenKind::Scheduled, h.schedule(text)),
                (AgendaWhenKind::Deadline, h.due(text)),
            ];
            for (when_kind, date) in dates {
                let Some(date) = date else { continue };
                out.push(AgendaItem {
                    heading_id: h.id,
                    when_kind,
                    date,
                    title: title.clone(),
                    planning: planning.clone(),
                    priority: h.priority(text),
                    finished,
                    tags: h.tags(text).into_iter().map(str::to_string).collect(),
                    context_path: context_path.clone(),
                });
            }
            path.push((h.level(), title));
        }
        out
    }

    /// Items occurring inside `range`, ordered by occurrence.
    pub fn within<'a>(
        items: &'a [AgendaItem],
        range: &AgendaRange,
    ) -> Vec<(NaiveDateTime, &'a AgendaItem)> {
        let mut out: Vec<_> = items
            .iter()
            .filter_map(|item| item.occurrence_within(range).map(|at| (at, item)))
            .collect();
        out.sort_by_key(|(at, _)| *at);
        out
    }

}
