//! Just enough of a JavaScript lexer to tell code apart from strings,
//! template literals, regex literals and comments, and to check bracket
//! structure. It is not a parser.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ScanError {
    Unterminated { what: &'static str, line: usize },
    Mismatched { open: char, close: char, line: usize },
    UnexpectedClose { close: char, line: usize },
    Unclosed { open: char, line: usize },
}

impl fmt::Display for ScanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unterminated { what, line } => write!(f, "unterminated {what} starting on line {line}"),
            Self::Mismatched { open, close, line } => {
                write!(f, "mismatched '{close}' on line {line} (expected to close '{open}')")
            }
            Self::UnexpectedClose { close, line } => write!(f, "unexpected '{close}' on line {line}"),
            Self::Unclosed { open, line } => write!(f, "unclosed '{open}' opened on line {line}"),
        }
    }
}

#[derive(Debug)]
pub(crate) struct Scan {
    /// Source with string, template, regex and comment bodies blanked to
    /// spaces. Delimiters and newlines are kept.
    pub masked: String,
    /// Source with comments removed; everything else verbatim.
    pub stripped: String,
    pub max_brace_depth: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Open {
    Paren,
    Bracket,
    Brace,
    /// `${` inside a template literal.
    TemplateExpr,
}

impl Open {
    fn char(self) -> char {
        match self {
            Self::Paren => '(',
            Self::Bracket => '[',
            Self::Brace => '{',
            Self::TemplateExpr => '$',
        }
    }

    fn closer(self) -> char {
        match self {
            Self::Paren => ')',
            Self::Bracket => ']',
            Self::Brace | Self::TemplateExpr => '}',
        }
    }
}

/// Keywords after which a `/` starts a regex literal rather than a division.
const REGEX_PREFIX_KEYWORDS: [&str; 14] = [
    "return", "typeof", "instanceof", "in", "of", "new", "delete", "void", "throw", "case", "do",
    "else", "yield", "await",
];

fn is_ident(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    masked: String,
    stripped: String,
    stack: Vec<(Open, usize)>,
    brace_depth: usize,
    max_brace_depth: usize,
    /// Last non-whitespace code character.
    prev: Option<char>,
    /// Identifier ending at `prev`, if `prev` ended one.
    last_word: String,
    /// The previous character continued an identifier.
    in_word: bool,
}

impl Lexer {
    fn at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn emit(&mut self, masked: char, stripped: char) {
        self.masked.push(masked);
        self.stripped.push(stripped);
        if stripped == '\n' {
            self.line += 1;
        }
    }

    /// Emit a character that belongs to a literal body.
    fn emit_hidden(&mut self, c: char) {
        let blank = if c == '\n' { '\n' } else { ' ' };
        self.emit(blank, c);
    }

    fn regex_allowed(&self) -> bool {
        match self.prev {
            None => true,
            Some(c) if is_ident(c) => REGEX_PREFIX_KEYWORDS.contains(&self.last_word.as_str()),
            Some(')' | ']' | '\'' | '"' | '`') => false,
            Some(_) => true,
        }
    }

    fn run(mut self) -> Result<Scan, ScanError> {
        while let Some(c) = self.at(0) {
            if is_ident(c) {
                if !self.in_word {
                    self.last_word.clear();
                }
                self.last_word.push(c);
                self.in_word = true;
                self.prev = Some(c);
                self.emit(c, c);
                self.pos += 1;
                continue;
            }
            self.in_word = false;
            match c {
                '/' if self.at(1) == Some('/') => self.line_comment(),
                '/' if self.at(1) == Some('*') => self.block_comment()?,
                '/' if self.regex_allowed() => self.regex()?,
                '\'' | '"' => self.string(c)?,
                '`' => self.template()?,
                '(' | '[' | '{' => {
                    let open = match c {
                        '(' => Open::Paren,
                        '[' => Open::Bracket,
                        _ => Open::Brace,
                    };
                    self.open(open);
                    self.punct(c);
                }
                ')' | ']' | '}' => {
                    self.punct(c);
                    if self.close(c)? {
                        // `}` closed a `${`; resume the template body.
                        self.template_body(self.line)?;
                    }
                }
                _ if c.is_whitespace() => {
                    self.emit(c, c);
                    self.pos += 1;
                }
                _ => self.punct(c),
            }
        }

        if let Some((open, line)) = self.stack.last() {
            return Err(ScanError::Unclosed {
                open: open.char(),
                line: *line,
            });
        }
        Ok(Scan {
            masked: self.masked,
            stripped: self.stripped,
            max_brace_depth: self.max_brace_depth,
        })
    }

    fn punct(&mut self, c: char) {
        self.emit(c, c);
        self.pos += 1;
        self.prev = Some(c);
        self.last_word.clear();
    }

    fn open(&mut self, open: Open) {
        if open == Open::Brace {
            self.brace_depth += 1;
            self.max_brace_depth = self.max_brace_depth.max(self.brace_depth);
        }
        self.stack.push((open, self.line));
    }

    /// Pop the matching opener. Returns `true` when it was a template `${`.
    fn close(&mut self, close: char) -> Result<bool, ScanError> {
        let Some((open, _)) = self.stack.pop() else {
            return Err(ScanError::UnexpectedClose {
                close,
                line: self.line,
            });
        };
        if open.closer() != close {
            return Err(ScanError::Mismatched {
                open: open.char(),
                close,
                line: self.line,
            });
        }
        if open == Open::Brace {
            self.brace_depth = self.brace_depth.saturating_sub(1);
        }
        Ok(open == Open::TemplateExpr)
    }

    fn line_comment(&mut self) {
        while let Some(c) = self.at(0) {
            if c == '\n' {
                break;
            }
            self.masked.push(' ');
            self.pos += 1;
        }
        self.stripped.push(' ');
    }

    fn block_comment(&mut self) -> Result<(), ScanError> {
        let start = self.line;
        self.pos += 2;
        self.masked.push_str("  ");
        let mut newlines = 0;
        loop {
            match self.at(0) {
                None => {
                    return Err(ScanError::Unterminated {
                        what: "block comment",
                        line: start,
                    });
                }
                Some('*') if self.at(1) == Some('/') => {
                    self.pos += 2;
                    self.masked.push_str("  ");
                    break;
                }
                Some('\n') => {
                    newlines += 1;
                    self.masked.push('\n');
                    self.pos += 1;
                }
                Some(_) => {
                    self.masked.push(' ');
                    self.pos += 1;
                }
            }
        }
        // Keep tokens apart and line numbers stable.
        if newlines == 0 {
            self.stripped.push(' ');
        }
        for _ in 0..newlines {
            self.stripped.push('\n');
        }
        self.line += newlines;
        Ok(())
    }

    fn string(&mut self, quote: char) -> Result<(), ScanError> {
        let start = self.line;
        self.emit(quote, quote);
        self.pos += 1;
        loop {
            match self.at(0) {
                None | Some('\n') => {
                    return Err(ScanError::Unterminated {
                        what: "string literal",
                        line: start,
                    });
                }
                Some('\\') => {
                    self.emit_hidden('\\');
                    self.pos += 1;
                    if let Some(next) = self.at(0) {
                        self.emit_hidden(next);
                        self.pos += 1;
                    }
                }
                Some(c) if c == quote => {
                    self.emit(quote, quote);
                    self.pos += 1;
                    break;
                }
                Some(c) => {
                    self.emit_hidden(c);
                    self.pos += 1;
                }
            }
        }
        self.prev = Some(quote);
        self.last_word.clear();
        Ok(())
    }

    fn regex(&mut self) -> Result<(), ScanError> {
        let start = self.line;
        self.emit('/', '/');
        self.pos += 1;
        let mut in_class = false;
        loop {
            match self.at(0) {
                None | Some('\n') => {
                    return Err(ScanError::Unterminated {
                        what: "regular expression",
                        line: start,
                    });
                }
                Some('\\') => {
                    self.emit_hidden('\\');
                    self.pos += 1;
                    if let Some(next) = self.at(0).filter(|c| *c != '\n') {
                        self.emit_hidden(next);
                        self.pos += 1;
                    }
                }
                Some('[') => {
                    in_class = true;
                    self.emit_hidden('[');
                    self.pos += 1;
                }
                Some(']') => {
                    in_class = false;
                    self.emit_hidden(']');
                    self.pos += 1;
                }
                Some('/') if !in_class => {
                    self.emit('/', '/');
                    self.pos += 1;
                    break;
                }
                Some(c) => {
                    self.emit_hidden(c);
                    self.pos += 1;
                }
            }
        }
        while let Some(flag) = self.at(0).filter(char::is_ascii_alphabetic) {
            self.emit(flag, flag);
            self.pos += 1;
        }
        self.prev = Some('/');
        self.last_word.clear();
        Ok(())
    }

    fn template(&mut self) -> Result<(), ScanError> {
        let start = self.line;
        self.emit('`', '`');
        self.pos += 1;
        self.template_body(start)
    }

    /// Consume template text up to the closing backtick or the next `${`.
    fn template_body(&mut self, start: usize) -> Result<(), ScanError> {
        loop {
            match self.at(0) {
                None => {
                    return Err(ScanError::Unterminated {
                        what: "template literal",
                        line: start,
                    });
                }
                Some('\\') => {
                    self.emit_hidden('\\');
                    self.pos += 1;
                    if let Some(next) = self.at(0) {
                        self.emit_hidden(next);
                        self.pos += 1;
                    }
                }
                Some('`') => {
                    self.emit('`', '`');
                    self.pos += 1;
                    self.prev = Some('`');
                    self.last_word.clear();
                    return Ok(());
                }
                Some('$') if self.at(1) == Some('{') => {
                    self.emit('$', '$');
                    self.emit('{', '{');
                    self.pos += 2;
                    self.stack.push((Open::TemplateExpr, self.line));
                    self.prev = Some('{');
                    self.last_word.clear();
                    return Ok(());
                }
                Some(c) => {
                    self.emit_hidden(c);
                    self.pos += 1;
                }
            }
        }
    }
}

/// Lex `code`, reporting the first structural problem.
pub(crate) fn scan(code: &str) -> Result<Scan, ScanError> {
    Lexer {
        chars: code.chars().collect(),
        pos: 0,
        line: 1,
        masked: String::with_capacity(code.len()),
        stripped: String::with_capacity(code.len()),
        stack: Vec::new(),
        brace_depth: 0,
        max_brace_depth: 0,
        prev: None,
        last_word: String::new(),
        in_word: false,
    }
    .run()
}
