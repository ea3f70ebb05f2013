//! Pure helpers for handling SQL text produced by models.

use std::sync::LazyLock;

use regex::Regex;

static FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```[a-zA-Z]*\s*\n(.*?)```").unwrap());

/// Statement heads allowed to reach the warehouse.
const READ_HEADS: &[&str] = &["SELECT", "WITH"];

/// Body of the first markdown code fence in `reply`, or the trimmed reply.
pub fn strip_code_fence(reply: &str) -> &str {
    match FENCE_RE.captures(reply).and_then(|caps| caps.get(1)) {
        Some(body) => body.as_str().trim(),
        None => reply.trim(),
    }
}

/// Pull the statement out of a model reply.
///
/// Models often wrap SQL in a markdown fence; the first fenced block wins.
pub fn extract_sql(reply: &str) -> String {
    strip_code_fence(reply).to_string()
}

/// Return the head of the first statement that is not a read query.
///
/// Every statement must start with `SELECT` or `WITH`, optionally behind
/// parentheses. Anything else (DML, DDL, `EXECUTE IMMEDIATE`, `CALL`,
/// scripting blocks) is reported by its upper-cased first word. Comments and
/// quoted literals are skipped, so `;` or `--` inside a string never hides a
/// following statement.
pub fn write_statement_keyword(sql: &str) -> Option<String> {
    statement_heads(sql)
        .into_iter()
        .find(|head| !READ_HEADS.contains(&head.as_str()))
}

#[derive(Debug, PartialEq)]
enum Token {
    Word(String),
    Literal,
    Semicolon,
    Punct(char),
}

fn statement_heads(sql: &str) -> Vec<String> {
    let mut heads = Vec::new();
    let mut at_start = true;
    for token in tokenize(sql) {
        match token {
            Token::Semicolon => at_start = true,
            _ if !at_start => {}
            Token::Punct('(') => {}
            Token::Word(word) => {
                heads.push(word.to_ascii_uppercase());
                at_start = false;
            }
            Token::Literal => {
                heads.push("LITERAL".to_string());
                at_start = false;
            }
            Token::Punct(c) => {
                heads.push(c.to_string());
                at_start = false;
            }
        }
    }
    heads
}

/// Split GoogleSQL into words, literals and punctuation.
///
/// Unterminated literals and comments run to the end of the input.
fn tokenize(sql: &str) -> Vec<Token> {
    let chars: Vec<char> = sql.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while let Some(&c) = chars.get(i) {
        let next = chars.get(i + 1).copied();
        match c {
            _ if c.is_whitespace() => i += 1,
            '-' if next == Some('-') => i = skip_line(&chars, i),
            '#' => i = skip_line(&chars, i),
            '/' if next == Some('*') => {
                i += 2;
                while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                    i += 1;
                }
                i = (i + 2).min(chars.len());
            }
            '\'' | '"' | '`' => {
                i = skip_literal(&chars, i);
                tokens.push(Token::Literal);
            }
            ';' => {
                tokens.push(Token::Semicolon);
                i += 1;
            }
            _ if c.is_alphanumeric() || c == '_' => {
                let start = i;
                while chars.get(i).is_some_and(|c| c.is_alphanumeric() || *c == '_') {
                    i += 1;
                }
                tokens.push(Token::Word(chars[start..i].iter().collect()));
            }
            _ => {
                tokens.push(Token::Punct(c));
                i += 1;
            }
        }
    }
    tokens
}

fn skip_line(chars: &[char], mut i: usize) -> usize {
    while i < chars.len() && chars[i] != '\n' {
        i += 1;
    }
    i
}

/// Index just past the literal opened at `start`; handles triple quotes and
/// backslash escapes.
fn skip_literal(chars: &[char], start: usize) -> usize {
    let quote = chars[start];
    let triple = quote != '`'
        && chars.get(start + 1) == Some(&quote)
        && chars.get(start + 2) == Some(&quote);
    let mut i = start + if triple { 3 } else { 1 };
    while i < chars.len() {
        match chars[i] {
            '\\' => i += 2,
            c if c == quote => {
                if !triple {
                    return i + 1;
                }
                if chars.get(i + 1) == Some(&quote) && chars.get(i + 2) == Some(&quote) {
                    return i + 3;
                }
                i += 1;
            }
            _ => i += 1,
        }
    }
    chars.len()
}

/// Text of `sql` at a 1-indexed `(line, column)` position, up to the end of that line.
pub fn fragment_at(sql: &str, line: usize, column: usize) -> Option<String> {
    let text = sql.lines().nth(line.checked_sub(1)?)?;
    let start = column.saturating_sub(1);
    let fragment: String = text.chars().skip(start).collect();
    let fragment = fragment.trim();
    if fragment.is_empty() {
        None
    } else {
        Some(fragment.to_string())
    }
}
