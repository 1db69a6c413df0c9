use crate::runtime::error::RuntimeError;

#[derive(Debug, PartialEq, Clone)]
pub enum Tok {
    Name(String),
    Int(i64),
    Float(f64),
    Str(String),
    Def,
    If,
    Elif,
    Else,
    While,
    Try,
    Except,
    Return,
    Raise,
    Pass,
    Break,
    Continue,
    True,
    False,
    None,
    Not,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Colon,
    Assign,
    PlusAssign,
    MinusAssign,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Lt,
    Le,
    Gt,
    Ge,
    EqEq,
    NotEq,
    Newline,
    Indent,
    Dedent,
    Eof,
}

impl Tok {
    fn keyword(word: &str) -> Option<Tok> {
        let tok = match word {
            "def" => Tok::Def,
            "if" => Tok::If,
            "elif" => Tok::Elif,
            "else" => Tok::Else,
            "while" => Tok::While,
            "try" => Tok::Try,
            "except" => Tok::Except,
            "return" => Tok::Return,
            "raise" => Tok::Raise,
            "pass" => Tok::Pass,
            "break" => Tok::Break,
            "continue" => Tok::Continue,
            "True" => Tok::True,
            "False" => Tok::False,
            "None" => Tok::None,
            "not" => Tok::Not,
            _ => return None,
        };
        Some(tok)
    }
}

#[derive(Debug, PartialEq, Clone)]
pub struct Token {
    pub tok: Tok,
    pub line: u32,
}

/// Split source text into tokens. Indentation changes produce `Indent`/`Dedent`,
/// each logical line ends with `Newline`. Blank and comment-only lines produce nothing.
pub fn tokenize(source: &str) -> Result<Vec<Token>, RuntimeError> {
    let mut tokens = vec![];
    let mut indents: Vec<usize> = vec![0];
    let mut last_line = 0;

    for (idx, raw_line) in source.lines().enumerate() {
        let line = idx as u32 + 1;
        let content = raw_line.trim_start_matches(' ');
        if content.trim().is_empty() || content.starts_with('#') {
            continue;
        }
        if content.starts_with('\t') {
            return Err(RuntimeError::syntax(line, "tabs are not allowed in indentation"));
        }
        last_line = line;

        let indent = raw_line.len() - content.len();
        let current = *indents.last().expect("indent stack never empty");
        if indent > current {
            indents.push(indent);
            tokens.push(Token {
                tok: Tok::Indent,
                line,
            });
        } else {
            while indent < *indents.last().expect("indent stack never empty") {
                indents.pop();
                tokens.push(Token {
                    tok: Tok::Dedent,
                    line,
                });
            }
            if indent != *indents.last().expect("indent stack never empty") {
                return Err(RuntimeError::syntax(line, "inconsistent dedent"));
            }
        }

        LineScanner::new(content, line).scan(&mut tokens)?;
        tokens.push(Token {
            tok: Tok::Newline,
            line,
        });
    }

    for _ in 1..indents.len() {
        tokens.push(Token {
            tok: Tok::Dedent,
            line: last_line,
        });
    }
    tokens.push(Token {
        tok: Tok::Eof,
        line: last_line,
    });
    Ok(tokens)
}

struct LineScanner<'a> {
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    text: &'a str,
    line: u32,
}

impl<'a> LineScanner<'a> {
    fn new(text: &'a str, line: u32) -> Self {
        Self {
            chars: text.char_indices().peekable(),
            text,
            line,
        }
    }

    fn push(&self, tokens: &mut Vec<Token>, tok: Tok) {
        tokens.push(Token {
            tok,
            line: self.line,
        })
    }

    /// Consume next char if it equals to `expected`.
    fn eat(&mut self, expected: char) -> bool {
        if self.chars.peek().map(|(_, c)| *c) == Some(expected) {
            self.chars.next();
            return true;
        }
        false
    }

    fn scan(mut self, tokens: &mut Vec<Token>) -> Result<(), RuntimeError> {
        while let Some((pos, ch)) = self.chars.next() {
            let tok = match ch {
                ' ' | '\t' | '\r' => continue,
                '#' => break,
                '(' => Tok::LParen,
                ')' => Tok::RParen,
                '[' => Tok::LBracket,
                ']' => Tok::RBracket,
                ',' => Tok::Comma,
                ':' => Tok::Colon,
                '*' => Tok::Star,
                '/' => Tok::Slash,
                '%' => Tok::Percent,
                '+' if self.eat('=') => Tok::PlusAssign,
                '+' => Tok::Plus,
                '-' if self.eat('=') => Tok::MinusAssign,
                '-' => Tok::Minus,
                '<' if self.eat('=') => Tok::Le,
                '<' => Tok::Lt,
                '>' if self.eat('=') => Tok::Ge,
                '>' => Tok::Gt,
                '=' if self.eat('=') => Tok::EqEq,
                '=' => Tok::Assign,
                '!' if self.eat('=') => Tok::NotEq,
                '"' | '\'' => self.string(ch)?,
                c if c.is_ascii_digit() => self.number(pos, c)?,
                c if c.is_alphabetic() || c == '_' => self.word(pos, c),
                other => {
                    return Err(RuntimeError::syntax(
                        self.line,
                        format!("unexpected character `{other}`"),
                    ))
                }
            };
            self.push(tokens, tok);
        }
        Ok(())
    }

    fn take_while(&mut self, start: usize, first: char, pred: impl Fn(char) -> bool) -> &'a str {
        let mut end = start + first.len_utf8();
        while let Some((pos, c)) = self.chars.peek().copied() {
            if !pred(c) {
                break;
            }
            end = pos + c.len_utf8();
            self.chars.next();
        }
        &self.text[start..end]
    }

    fn word(&mut self, start: usize, first: char) -> Tok {
        let word = self.take_while(start, first, |c| c.is_alphanumeric() || c == '_');
        Tok::keyword(word).unwrap_or_else(|| Tok::Name(word.to_string()))
    }

    fn number(&mut self, start: usize, first: char) -> Result<Tok, RuntimeError> {
        let literal = self.take_while(start, first, |c| c.is_ascii_digit() || c == '.' || c == '_');
        let literal = literal.replace('_', "");
        let tok = if literal.contains('.') {
            literal.parse().map(Tok::Float).ok()
        } else {
            literal.parse().map(Tok::Int).ok()
        };
        tok.ok_or_else(|| RuntimeError::syntax(self.line, format!("invalid number `{literal}`")))
    }

    fn string(&mut self, quote: char) -> Result<Tok, RuntimeError> {
        let mut value = String::new();
        loop {
            match self.chars.next() {
                None => return Err(RuntimeError::syntax(self.line, "unterminated string")),
                Some((_, c)) if c == quote => return Ok(Tok::Str(value)),
                Some((_, '\\')) => match self.chars.next() {
                    Some((_, 'n')) => value.push('\n'),
                    Some((_, 't')) => value.push('\t'),
                    Some((_, c)) => value.push(c),
                    None => return Err(RuntimeError::syntax(self.line, "unterminated string")),
                },
                Some((_, c)) => value.push(c),
            }
        }
    }
}
