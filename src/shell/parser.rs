//! Shell command parser
//!
//! Splits one command line into an argument vector plus redirections
//! and the background flag. Supported syntax:
//! - whitespace-separated words, single or double quotes
//! - `< file` stdin redirection
//! - `> file` / `>> file` stdout redirection (truncate / append)
//! - trailing `&` for background execution

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    /// Program name and arguments; never empty.
    pub argv: Vec<String>,
    pub stdin: Option<String>,
    pub stdout: Option<String>,
    /// `>>` instead of `>`.
    pub append: bool,
    pub background: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    UnterminatedQuote,
    MissingRedirectTarget(&'static str),
    BackgroundNotLast,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::UnterminatedQuote => write!(f, "unterminated quote"),
            ParseError::MissingRedirectTarget(op) => {
                write!(f, "missing file after '{}'", op)
            }
            ParseError::BackgroundNotLast => write!(f, "'&' must be the last token"),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Token {
    Word(String),
    RedirectIn,
    RedirectOut,
    RedirectAppend,
    Background,
}

fn tokenize(line: &str) -> Result<Vec<Token>, ParseError> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' => {
                chars.next();
            }
            '<' => {
                chars.next();
                tokens.push(Token::RedirectIn);
            }
            '>' => {
                chars.next();
                if chars.peek() == Some(&'>') {
                    chars.next();
                    tokens.push(Token::RedirectAppend);
                } else {
                    tokens.push(Token::RedirectOut);
                }
            }
            '&' => {
                chars.next();
                tokens.push(Token::Background);
            }
            _ => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    match c {
                        ' ' | '\t' | '<' | '>' | '&' => break,
                        '\'' | '"' => {
                            let quote = c;
                            chars.next();
                            let mut closed = false;
                            for qc in chars.by_ref() {
                                if qc == quote {
                                    closed = true;
                                    break;
                                }
                                word.push(qc);
                            }
                            if !closed {
                                return Err(ParseError::UnterminatedQuote);
                            }
                        }
                        _ => {
                            word.push(c);
                            chars.next();
                        }
                    }
                }
                tokens.push(Token::Word(word));
            }
        }
    }
    Ok(tokens)
}

/// Parse one line. `Ok(None)` means the line held no command.
pub fn parse_line(line: &str) -> Result<Option<ParsedCommand>, ParseError> {
    let tokens = tokenize(line)?;
    if tokens.is_empty() {
        return Ok(None);
    }

    let mut argv = Vec::new();
    let mut stdin = None;
    let mut stdout = None;
    let mut append = false;
    let mut background = false;

    let mut iter = tokens.into_iter().peekable();
    while let Some(token) = iter.next() {
        if background {
            return Err(ParseError::BackgroundNotLast);
        }
        match token {
            Token::Word(w) => argv.push(w),
            Token::RedirectIn => match iter.next() {
                Some(Token::Word(w)) => stdin = Some(w),
                _ => return Err(ParseError::MissingRedirectTarget("<")),
            },
            Token::RedirectOut => match iter.next() {
                Some(Token::Word(w)) => {
                    stdout = Some(w);
                    append = false;
                }
                _ => return Err(ParseError::MissingRedirectTarget(">")),
            },
            Token::RedirectAppend => match iter.next() {
                Some(Token::Word(w)) => {
                    stdout = Some(w);
                    append = true;
                }
                _ => return Err(ParseError::MissingRedirectTarget(">>")),
            },
            Token::Background => background = true,
        }
    }

    if argv.is_empty() {
        return Ok(None);
    }
    Ok(Some(ParsedCommand {
        argv,
        stdin,
        stdout,
        append,
        background,
    }))
}
