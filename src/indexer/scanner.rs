//! Comment- and string-aware scanning of brace-delimited source.
//!
//! Every block-boundary finder in the crate goes through [`Scanner`], a small
//! state machine over `Normal`, `InLineComment`, `InBlockComment` and
//! `InString(quote)`. Which transitions are live depends on the [`ScanMode`]:
//! modern AL, legacy C/AL code bodies, or legacy structural sections.

/// Lexical state a character belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Normal,
    InLineComment,
    InBlockComment,
    InString(char),
}

/// Which lexical features are recognized while scanning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanMode {
    /// `// ...` until end of line
    pub line_comments: bool,
    /// `/* ... */`
    pub slash_star_comments: bool,
    /// `{ ... }` is a comment (C/AL code bodies), not a nesting brace
    pub brace_comments: bool,
    /// Characters that open and close string literals
    pub quotes: &'static [char],
}

impl ScanMode {
    /// Modern AL source
    pub const AL: ScanMode = ScanMode {
        line_comments: true,
        slash_star_comments: true,
        brace_comments: false,
        quotes: &['\'', '"'],
    };

    /// C/AL code between `CODE {` and its closing brace
    pub const LEGACY_CODE: ScanMode = ScanMode {
        line_comments: true,
        slash_star_comments: false,
        brace_comments: true,
        quotes: &['\''],
    };

    /// C/AL object sections (FIELDS, CONTROLS, ...). Captions may hold stray
    /// apostrophes and slashes, so only braces are significant.
    pub const STRUCTURE: ScanMode = ScanMode {
        line_comments: false,
        slash_star_comments: false,
        brace_comments: false,
        quotes: &[],
    };
}

/// Iterator yielding `(byte_index, char, state)` for every character of `text`
/// starting at `start`.
pub struct Scanner<'a> {
    text: &'a str,
    pos: usize,
    mode: ScanMode,
    state: ScanState,
    // the '*' of "/*" and the '/' of "*/" still belong to the comment
    opening: bool,
    closing: bool,
}

impl<'a> Scanner<'a> {
    pub fn new(text: &'a str, start: usize, mode: ScanMode) -> Self {
        Self {
            text,
            pos: start.min(text.len()),
            mode,
            state: ScanState::Normal,
            opening: false,
            closing: false,
        }
    }

    fn peek_at(&self, idx: usize) -> Option<char> {
        self.text.get(idx..).and_then(|s| s.chars().next())
    }
}

impl Iterator for Scanner<'_> {
    type Item = (usize, char, ScanState);

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.pos;
        let c = self.peek_at(idx)?;
        self.pos += c.len_utf8();
        let next = self.peek_at(self.pos);

        let reported = match self.state {
            ScanState::Normal => {
                if self.mode.line_comments && c == '/' && next == Some('/') {
                    self.state = ScanState::InLineComment;
                    ScanState::InLineComment
                } else if self.mode.slash_star_comments && c == '/' && next == Some('*') {
                    self.opening = true;
                    self.state = ScanState::InBlockComment;
                    ScanState::InBlockComment
                } else if self.mode.brace_comments && c == '{' {
                    self.state = ScanState::InBlockComment;
                    ScanState::InBlockComment
                } else if self.mode.quotes.contains(&c) {
                    self.state = ScanState::InString(c);
                    ScanState::InString(c)
                } else {
                    ScanState::Normal
                }
            }
            ScanState::InLineComment => {
                if c == '\n' {
                    self.state = ScanState::Normal;
                }
                ScanState::InLineComment
            }
            ScanState::InBlockComment => {
                if self.opening {
                    self.opening = false;
                } else if self.closing {
                    self.closing = false;
                    self.state = ScanState::Normal;
                } else if self.mode.brace_comments && c == '}' {
                    self.state = ScanState::Normal;
                } else if self.mode.slash_star_comments && c == '*' && next == Some('/') {
                    self.closing = true;
                }
                ScanState::InBlockComment
            }
            ScanState::InString(quote) => {
                if c == quote {
                    self.state = ScanState::Normal;
                }
                ScanState::InString(quote)
            }
        };

        Some((idx, c, reported))
    }
}

/// Given the index of an opening `{`, find the index of its closing `}`.
///
/// In modes with `brace_comments`, inner `{...}` pairs are comments and the first
/// `}` in normal state closes the block.
pub fn find_matching_brace(text: &str, open_idx: usize, mode: ScanMode) -> Option<usize> {
    if text.as_bytes().get(open_idx) != Some(&b'{') {
        return None;
    }
    let mut depth = 0usize;
    for (idx, c, state) in Scanner::new(text, open_idx + 1, mode) {
        if state != ScanState::Normal {
            continue;
        }
        match c {
            '{' => depth += 1,
            '}' if depth == 0 => return Some(idx),
            '}' => depth -= 1,
            _ => {}
        }
    }
    None
}

/// Byte span of a keyword-introduced block: `open` is the `{`, `close` the `}`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSpan {
    pub keyword_start: usize,
    pub open: usize,
    pub close: usize,
}

impl BlockSpan {
    /// Text strictly between the braces
    pub fn inner<'a>(&self, text: &'a str) -> &'a str {
        &text[self.open + 1..self.close]
    }
}

/// Outcome of looking for a named block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockLookup {
    Found(BlockSpan),
    Missing,
    /// Keyword and opening brace were found but braces never balance
    Malformed { keyword_start: usize },
}

impl BlockLookup {
    pub fn span(&self) -> Option<BlockSpan> {
        match self {
            BlockLookup::Found(span) => Some(*span),
            _ => None,
        }
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '-'
}

/// Find `keyword` (case-insensitive, whole word) followed by optional whitespace
/// and `{`, skipping comments and strings per `mode`, and locate its block.
pub fn locate_block(text: &str, keyword: &str, mode: ScanMode) -> BlockLookup {
    locate_block_with(text, 0, keyword, mode, mode)
}

/// Like [`locate_block`], but the keyword is searched with `find_mode` from byte
/// `from` and the block body is balanced with `body_mode`.
pub fn locate_block_with(
    text: &str,
    from: usize,
    keyword: &str,
    find_mode: ScanMode,
    body_mode: ScanMode,
) -> BlockLookup {
    let kw_len = keyword.len();
    let mut prev: Option<char> = None;
    for (idx, c, state) in Scanner::new(text, from, find_mode) {
        let boundary = prev.map_or(true, |p| !is_word_char(p));
        prev = Some(c);
        if state != ScanState::Normal || !boundary {
            continue;
        }
        let Some(candidate) = text.get(idx..idx + kw_len) else {
            continue;
        };
        if !candidate.eq_ignore_ascii_case(keyword) {
            continue;
        }
        let rest = &text[idx + kw_len..];
        if rest.chars().next().is_some_and(is_word_char) {
            continue;
        }
        let trimmed = rest.trim_start();
        if !trimmed.starts_with('{') {
            continue;
        }
        let open = idx + kw_len + (rest.len() - trimmed.len());
        return match find_matching_brace(text, open, body_mode) {
            Some(close) => BlockLookup::Found(BlockSpan {
                keyword_start: idx,
                open,
                close,
            }),
            None => BlockLookup::Malformed { keyword_start: idx },
        };
    }
    BlockLookup::Missing
}

/// Every top-level `{ ... }` record inside `text`, as `(open, close)` pairs.
/// Scanning stops at the first unbalanced record.
pub fn top_level_records(text: &str, mode: ScanMode) -> Vec<(usize, usize)> {
    let mut records = Vec::new();
    let mut cursor = 0;
    while let Some(rel) = text[cursor..].find('{') {
        let open = cursor + rel;
        match find_matching_brace(text, open, mode) {
            Some(close) => {
                records.push((open, close));
                cursor = close + 1;
            }
            None => break,
        }
    }
    records
}

/// Byte offsets of every whole-word, case-insensitive occurrence of `keyword` in
/// normal state.
pub fn keyword_positions(text: &str, keyword: &str, mode: ScanMode) -> Vec<usize> {
    let mut positions = Vec::new();
    let mut word_start: Option<usize> = None;
    let check = |start: usize, end: usize, positions: &mut Vec<usize>| {
        if text[start..end].eq_ignore_ascii_case(keyword) {
            positions.push(start);
        }
    };
    for (idx, c, state) in Scanner::new(text, 0, mode) {
        let in_word = state == ScanState::Normal && is_word_char(c);
        match (word_start, in_word) {
            (None, true) => word_start = Some(idx),
            (Some(start), false) => {
                check(start, idx, &mut positions);
                word_start = None;
            }
            _ => {}
        }
    }
    if let Some(start) = word_start {
        check(start, text.len(), &mut positions);
    }
    positions
}

/// Replace comment characters with spaces, keeping newlines and byte offsets.
pub fn strip_comments(text: &str, mode: ScanMode) -> String {
    Scanner::new(text, 0, mode)
        .map(|(_, c, state)| match state {
            ScanState::InLineComment | ScanState::InBlockComment if c != '\n' => {
                " ".repeat(c.len_utf8())
            }
            _ => c.to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_matching_brace_ignores_comments_and_strings() {
        let text = "x { a := '}'; // } here\n /* } */ { inner } }";
        let open = text.find('{').unwrap();
        let close = find_matching_brace(text, open, ScanMode::AL).unwrap();
        assert_eq!(close, text.len() - 1);
    }

    #[test]
    fn test_brace_comments_in_legacy_code() {
        let text = "CODE\n{\n  x := 1; { it's a comment }\n  BEGIN\n  END.\n}\ntrailer }";
        let block = locate_block(text, "CODE", ScanMode::LEGACY_CODE).span().unwrap();
        assert!(block.inner(text).contains("END."));
        assert_eq!(&text[block.close + 1..block.close + 2], "\n");
    }

    #[test]
    fn test_locate_block_word_boundary() {
        let text = "OBJECT-PROPERTIES\n{\n Date=1;\n}\nPROPERTIES\n{\n X=1;\n}";
        let block = locate_block(text, "PROPERTIES", ScanMode::STRUCTURE).span().unwrap();
        assert_eq!(block.inner(text).trim(), "X=1;");
        let object_props = locate_block(text, "object-properties", ScanMode::STRUCTURE)
            .span()
            .unwrap();
        assert_eq!(object_props.keyword_start, 0);
    }

    #[test]
    fn test_malformed_block() {
        let text = "dataset\n{\n  dataitem(Customer; Customer)\n  {\n";
        assert_eq!(
            locate_block(text, "dataset", ScanMode::AL),
            BlockLookup::Malformed { keyword_start: 0 }
        );
        assert_eq!(locate_block(text, "requestpage", ScanMode::AL), BlockLookup::Missing);
    }

    #[test]
    fn test_keyword_inside_comment_is_skipped() {
        let text = "// dataset { }\ndataset { x }";
        let block = locate_block(text, "dataset", ScanMode::AL).span().unwrap();
        assert_eq!(block.keyword_start, text.rfind("dataset").unwrap());
    }

    #[test]
    fn test_top_level_records() {
        let text = "  { 1 ; A }\n  { 2 ; B ; OnValidate=BEGIN { c } END; }\n";
        let records = top_level_records(text, ScanMode::STRUCTURE);
        assert_eq!(records.len(), 2);
        assert!(text[records[1].0..=records[1].1].ends_with("END; }"));
    }

    #[test]
    fn test_keyword_positions_skip_comments() {
        let text = "BEGIN x; END;\nBEGIN\n{ BEGIN of history }\nEND.";
        let found = keyword_positions(text, "begin", ScanMode::LEGACY_CODE);
        assert_eq!(found, vec![0, 14]);
    }

    #[test]
    fn test_strip_comments_preserves_offsets() {
        let text = "field(1; \"A\"; Code[20]) // field(2; B; Integer)\n/* x */y";
        let stripped = strip_comments(text, ScanMode::AL);
        assert_eq!(stripped.len(), text.len());
        assert!(!stripped.contains("field(2"));
        assert!(stripped.ends_with('y'));
    }

    proptest! {
        #[test]
        fn prop_scanner_never_panics(text in "\\PC{0,200}") {
            for mode in [ScanMode::AL, ScanMode::LEGACY_CODE, ScanMode::STRUCTURE] {
                let _ = locate_block(&text, "fields", mode);
                let _ = top_level_records(&text, mode);
                prop_assert_eq!(strip_comments(&text, mode).len(), text.len());
            }
        }

        #[test]
        fn prop_balanced_braces_match(depth in 0usize..20) {
            let text = format!("{}{}", "{".repeat(depth + 1), "}".repeat(depth + 1));
            prop_assert_eq!(find_matching_brace(&text, 0, ScanMode::AL), Some(text.len() - 1));
        }
    }
}
