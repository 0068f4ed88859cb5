//! Lexical pre-scan bounding bracket nesting before the source is parsed.
//!
//! The scan keeps its own mode stack instead of recursing, so its memory use
//! is independent of how deeply the input nests. Regular expression literals
//! are told apart from division by the preceding token. Whenever the lexical
//! view turns out inconsistent (a literal cut off by a newline or the end of
//! input) the source is recounted counting every bracket.

/// Keywords after which a `/` starts a regular expression, not a division.
const REGEX_PRECEDING_KEYWORDS: [&str; 14] = [
    "return", "typeof", "instanceof", "in", "of", "new", "delete", "void", "throw", "case", "do",
    "else", "yield", "await",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Code,
    LineComment,
    BlockComment,
    Quoted(char),
    Regex { in_class: bool },
    Template,
    /// Code inside `${ ... }`; holds the depth at which the substitution opened.
    Substitution(usize),
}

/// Byte offset of the first bracket that pushes nesting beyond `limit`.
pub fn excess_nesting(source: &str, limit: usize) -> Option<usize> {
    let mut modes = vec![Mode::Code];
    let mut depth = 0usize;
    let mut chars = source.char_indices().peekable();

    while let Some((offset, ch)) = chars.next() {
        let mode = modes.last().copied().unwrap_or(Mode::Code);
        let next = chars.peek().map(|(_, c)| *c);
        match mode {
            Mode::Code | Mode::Substitution(_) => match ch {
                '/' if next == Some('/') => {
                    chars.next();
                    modes.push(Mode::LineComment);
                }
                '/' if next == Some('*') => {
                    chars.next();
                    modes.push(Mode::BlockComment);
                }
                '/' if starts_regex(&source[..offset]) => {
                    modes.push(Mode::Regex { in_class: false });
                }
                '\'' | '"' => modes.push(Mode::Quoted(ch)),
                '`' => modes.push(Mode::Template),
                '(' | '[' | '{' => {
                    depth += 1;
                    if depth > limit {
                        return Some(offset);
                    }
                }
                ')' | ']' => depth = depth.saturating_sub(1),
                '}' => {
                    if mode == Mode::Substitution(depth) {
                        modes.pop();
                    }
                    depth = depth.saturating_sub(1);
                }
                _ => {}
            },
            Mode::LineComment => {
                if ch == '\n' {
                    modes.pop();
                }
            }
            Mode::BlockComment => {
                if ch == '*' && next == Some('/') {
                    chars.next();
                    modes.pop();
                }
            }
            Mode::Quoted(quote) => match ch {
                '\\' => {
                    chars.next();
                }
                '\n' => return bracket_count_excess(source, limit),
                _ if ch == quote => {
                    modes.pop();
                }
                _ => {}
            },
            Mode::Regex { in_class } => match ch {
                '\\' => {
                    chars.next();
                }
                '\n' => return bracket_count_excess(source, limit),
                '[' => set_top(&mut modes, Mode::Regex { in_class: true }),
                ']' if in_class => set_top(&mut modes, Mode::Regex { in_class: false }),
                '/' if !in_class => {
                    modes.pop();
                }
                _ => {}
            },
            Mode::Template => match ch {
                '\\' => {
                    chars.next();
                }
                '`' => {
                    modes.pop();
                }
                '$' if next == Some('{') => {
                    chars.next();
                    depth += 1;
                    if depth > limit {
                        return Some(offset);
                    }
                    modes.push(Mode::Substitution(depth));
                }
                _ => {}
            },
        }
    }

    match modes.last() {
        None | Some(Mode::Code | Mode::LineComment) => None,
        Some(_) => bracket_count_excess(source, limit),
    }
}

fn set_top(modes: &mut [Mode], mode: Mode) {
    if let Some(top) = modes.last_mut() {
        *top = mode;
    }
}

/// Whether a `/` following `before` opens a regular expression literal.
fn starts_regex(before: &str) -> bool {
    let before = before.trim_end();
    let Some(last) = before.chars().next_back() else {
        return true;
    };
    if matches!(last, ')' | ']') {
        return false;
    }
    if last.is_alphanumeric() || last == '_' || last == '$' {
        let word_start = before
            .char_indices()
            .rev()
            .take_while(|(_, c)| c.is_alphanumeric() || *c == '_' || *c == '$')
            .last()
            .map_or(0, |(index, _)| index);
        return REGEX_PRECEDING_KEYWORDS.contains(&&before[word_start..]);
    }
    true
}

/// Mode-blind fallback: every bracket counts, wherever it appears.
fn bracket_count_excess(source: &str, limit: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (offset, ch) in source.char_indices() {
        match ch {
            '(' | '[' | '{' => {
                depth += 1;
                if depth > limit {
                    return Some(offset);
                }
            }
            ')' | ']' | '}' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    None
}
