// Copyright 2011 Google Inc. All Rights Reserved.
// Copyright 2018 The Majak Project Developers. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use nom::branch::alt;
use nom::bytes::complete::{tag, take, take_while, take_while1};
use nom::character::complete::char;
use nom::combinator::{eof, map, opt, value};
use nom::multi::fold_many0;
use nom::sequence::{delimited, preceded};
use nom::{IResult, Offset};

use crate::eval_env::EvalString;

#[derive(PartialEq, Clone, Copy, Debug)]
pub enum LexerToken {
    Error,
    Build,
    Colon,
    Default,
    Equals,
    Ident,
    Include,
    Indent,
    Newline,
    Pipe,
    Pipe2,
    Pool,
    Rule,
    Subninja,
    Teof,
}

impl LexerToken {
    /// Return a human-readable form of a token, used in error messages.
    pub fn name(&self) -> &'static str {
        match *self {
            LexerToken::Error => "lexing error",
            LexerToken::Build => "'build'",
            LexerToken::Colon => "':'",
            LexerToken::Default => "'default'",
            LexerToken::Equals => "'='",
            LexerToken::Ident => "identifier",
            LexerToken::Include => "'include'",
            LexerToken::Indent => "indent",
            LexerToken::Newline => "newline",
            LexerToken::Pipe => "'|'",
            LexerToken::Pipe2 => "'||'",
            LexerToken::Pool => "'pool'",
            LexerToken::Rule => "'rule'",
            LexerToken::Subninja => "'subninja'",
            LexerToken::Teof => "eof",
        }
    }

    /// Return a human-readable token hint, used in error messages.
    pub fn error_hint(&self) -> &'static str {
        match *self {
            LexerToken::Colon => " ($ also escapes ':')",
            _ => "",
        }
    }
}

fn is_simple_varname_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

fn is_varname_char(c: char) -> bool {
    is_simple_varname_char(c) || c == '.'
}

fn is_comment_char(c: char) -> bool {
    c != '\0' && c != '\n'
}

fn is_text_char(c: char) -> bool {
    !matches!(c, '$' | ' ' | ':' | '\r' | '\n' | '|' | '\0')
}

fn is_sp_char(c: char) -> bool {
    c == ' '
}

fn skip_comments(input: &str) -> IResult<&str, ()> {
    fold_many0(
        preceded(
            take_while(is_sp_char),
            delimited(char('#'), take_while(is_comment_char), char('\n')),
        ),
        || (),
        |_, _| (),
    )(input)
}

fn skip_whitespace(input: &str) -> IResult<&str, ()> {
    fold_many0(
        alt((
            value((), take_while1(is_sp_char)),
            value((), tag("$\r\n")),
            value((), tag("$\n")),
        )),
        || (),
        |_, _| (),
    )(input)
}

fn keyword_or_ident(word: &str) -> LexerToken {
    match word {
        "build" => LexerToken::Build,
        "pool" => LexerToken::Pool,
        "rule" => LexerToken::Rule,
        "default" => LexerToken::Default,
        "include" => LexerToken::Include,
        "subninja" => LexerToken::Subninja,
        _ => LexerToken::Ident,
    }
}

fn read_one_token(input: &str) -> IResult<&str, LexerToken> {
    alt((
        value(
            LexerToken::Newline,
            preceded(take_while(is_sp_char), preceded(opt(char('\r')), char('\n'))),
        ),
        value(LexerToken::Indent, take_while1(is_sp_char)),
        value(LexerToken::Equals, tag("=")),
        value(LexerToken::Colon, tag(":")),
        value(LexerToken::Pipe2, tag("||")),
        value(LexerToken::Pipe, tag("|")),
        map(take_while1(is_varname_char), keyword_or_ident),
        value(LexerToken::Teof, char('\0')),
        value(LexerToken::Error, take(1usize)),
        value(LexerToken::Teof, eof),
    ))(input)
}

pub struct Lexer<'a> {
    filename: &'a str,
    input: &'a str,
    last_token_offset: usize,
    offset: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(filename: &'a str, input: &'a str) -> Self {
        Lexer {
            filename,
            input,
            last_token_offset: 0,
            offset: 0,
        }
    }

    /// Helper ctor useful for tests.
    #[cfg(test)]
    pub(crate) fn new_with_input(input: &'a str) -> Self {
        Lexer::new("input", input)
    }

    /// If the last token read was an Error token, provide more info
    /// or the empty string.
    pub fn describe_last_error(&self) -> &'static str {
        match self.input.as_bytes().get(self.last_token_offset) {
            Some(&b'\t') => "tabs are not allowed, use spaces",
            _ => "lexing error",
        }
    }

    /// Read a token from the token enum.
    pub fn read_token(&mut self) -> LexerToken {
        let mut rest = &self.input[self.offset..];
        if let Ok((after_comments, ())) = skip_comments(rest) {
            rest = after_comments;
        }

        self.last_token_offset = self.input.offset(rest);

        let token = match read_one_token(rest) {
            Ok((after_token, token)) => {
                rest = after_token;
                token
            }
            // read_one_token always matches: it falls back to a one-char
            // Error token or eof.
            Err(_) => LexerToken::Teof,
        };

        self.offset = self.input.offset(rest);

        match token {
            LexerToken::Newline | LexerToken::Teof => {}
            _ => self.eat_whitespace(),
        }

        token
    }

    /// Rewind to the last read token.
    pub fn unread_token(&mut self) {
        self.offset = self.last_token_offset;
    }

    /// If the next token is |token|, read it and return true.
    pub fn peek_token(&mut self, token: LexerToken) -> bool {
        if self.read_token() == token {
            return true;
        }
        self.unread_token();
        false
    }

    /// Read a simple identifier (a rule or variable name).
    pub fn read_ident(&mut self, message: &str) -> Result<&'a str, String> {
        let rest = &self.input[self.offset..];
        self.last_token_offset = self.offset;
        let (after, ident) = take_while1::<_, _, nom::error::Error<&str>>(is_varname_char)(rest)
            .map_err(|_| self.error(message))?;
        self.offset = self.input.offset(after);
        self.eat_whitespace();
        Ok(ident)
    }

    /// Read a path (complete with $escapes).
    /// The parsed path may be empty if a delimiter (space, newline) is hit.
    pub fn read_path(&mut self, path: &mut EvalString) -> Result<(), String> {
        self.read_evalstring(path, true)
    }

    /// Read the value side of a var = value line (complete with $escapes).
    pub fn read_var_value(&mut self, value: &mut EvalString) -> Result<(), String> {
        self.read_evalstring(value, false)
    }

    /// Construct an error message with context.
    pub fn error(&self, message: &str) -> String {
        // Compute line/column of the last token.
        let context = &self.input[..self.last_token_offset];
        let line = context.matches('\n').count() + 1;
        let line_start = context.rfind('\n').map(|pos| pos + 1).unwrap_or(0);
        let col = self.last_token_offset - line_start;

        let mut err = format!("{}:{}: {}\n", self.filename, line, message);

        const TRUNCATE_COLUMN: usize = 72;
        if col < TRUNCATE_COLUMN {
            let full_line = self.input[line_start..]
                .split(|c| c == '\n' || c == '\0')
                .next()
                .unwrap_or("");
            let truncated = full_line.len() >= TRUNCATE_COLUMN;
            let shown = if truncated {
                full_line.get(..TRUNCATE_COLUMN).unwrap_or(full_line)
            } else {
                full_line
            };
            err += shown;
            if truncated {
                err += "...";
            }
            err += "\n";
            err += &" ".repeat(col);
            err += "^ near here";
        }
        err
    }

    /// Skip past whitespace (called after each read token/ident/etc.).
    fn eat_whitespace(&mut self) {
        let rest = &self.input[self.offset..];
        if let Ok((after, ())) = skip_whitespace(rest) {
            self.offset = self.input.offset(after);
        }
    }

    /// Read a $-escaped string: either a path (stopping at unescaped
    /// structural characters) or a variable value (stopping at newline).
    fn read_evalstring(&mut self, eval: &mut EvalString, path: bool) -> Result<(), String> {
        loop {
            let rest = &self.input[self.offset..];
            let bytes = rest.as_bytes();

            // Longest run of plain text first.
            let text_len = rest
                .char_indices()
                .find(|&(_, c)| !is_text_char(c))
                .map(|(i, _)| i)
                .unwrap_or(rest.len());
            if text_len > 0 {
                eval.add_text(&rest[..text_len]);
                self.offset += text_len;
                continue;
            }

            if bytes.is_empty() || bytes[0] == 0 {
                self.last_token_offset = self.offset;
                return Err(self.error("unexpected EOF"));
            }

            match bytes[0] {
                b'\r' if bytes.get(1) == Some(&b'\n') => {
                    self.last_token_offset = self.offset;
                    if !path {
                        self.offset += 2;
                    }
                    break;
                }
                b' ' | b':' | b'|' if path => {
                    self.last_token_offset = self.offset;
                    break;
                }
                b'\n' => {
                    self.last_token_offset = self.offset;
                    if !path {
                        self.offset += 1;
                    }
                    break;
                }
                b' ' | b':' | b'|' => {
                    eval.add_text(&rest[..1]);
                    self.offset += 1;
                }
                b'$' => match bytes.get(1) {
                    Some(b'$') => {
                        eval.add_text("$");
                        self.offset += 2;
                    }
                    Some(b' ') => {
                        eval.add_text(" ");
                        self.offset += 2;
                    }
                    Some(b':') => {
                        eval.add_text(":");
                        self.offset += 2;
                    }
                    Some(b'\r') if bytes.get(2) == Some(&b'\n') => {
                        // Line continuation; skip it and the indent after it.
                        self.offset += 3;
                        let skipped = rest[3..]
                            .find(|c: char| c != ' ')
                            .unwrap_or(rest.len() - 3);
                        self.offset += skipped;
                    }
                    Some(b'\n') => {
                        self.offset += 2;
                        let skipped = rest[2..]
                            .find(|c: char| c != ' ')
                            .unwrap_or(rest.len() - 2);
                        self.offset += skipped;
                    }
                    Some(b'{') => {
                        let name_len = rest[2..]
                            .char_indices()
                            .find(|&(_, c)| !is_varname_char(c))
                            .map(|(i, _)| i)
                            .unwrap_or(rest.len() - 2);
                        if name_len > 0 && rest.as_bytes().get(2 + name_len) == Some(&b'}') {
                            eval.add_special(&rest[2..2 + name_len]);
                            self.offset += 2 + name_len + 1;
                        } else {
                            self.last_token_offset = self.offset;
                            return Err(
                                self.error("bad $-escape (literal $ must be written as $$)")
                            );
                        }
                    }
                    Some(&c) if is_simple_varname_char(c as char) => {
                        let name_len = rest[1..]
                            .char_indices()
                            .find(|&(_, c)| !is_simple_varname_char(c))
                            .map(|(i, _)| i)
                            .unwrap_or(rest.len() - 1);
                        eval.add_special(&rest[1..1 + name_len]);
                        self.offset += 1 + name_len;
                    }
                    _ => {
                        self.last_token_offset = self.offset;
                        return Err(self.error("bad $-escape (literal $ must be written as $$)"));
                    }
                },
                _ => {
                    self.last_token_offset = self.offset;
                    return Err(self.error(self.describe_last_error()));
                }
            }
        }

        if path {
            self.eat_whitespace();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lexer_read_var_value() {
        let mut lexer = Lexer::new_with_input("plain text $var $VaR ${x}\n");
        let mut eval = EvalString::new();
        assert_eq!(Ok(()), lexer.read_var_value(&mut eval));
        assert_eq!("[plain text ][$var][ ][$VaR][ ][$x]", eval.serialize());
    }

    #[test]
    fn lexer_read_evalstring_escapes() {
        let mut lexer = Lexer::new_with_input("$ $$ab c$: $\ncde\n");
        let mut eval = EvalString::new();
        assert_eq!(Ok(()), lexer.read_var_value(&mut eval));
        assert_eq!("[ $ab c: cde]", eval.serialize());
    }

    #[test]
    fn lexer_read_ident() {
        let mut lexer = Lexer::new_with_input("foo baR baz_123 foo-bar");
        assert_eq!(Ok("foo"), lexer.read_ident("read_ident"));
        assert_eq!(Ok("baR"), lexer.read_ident("read_ident"));
        assert_eq!(Ok("baz_123"), lexer.read_ident("read_ident"));
        assert_eq!(Ok("foo-bar"), lexer.read_ident("read_ident"));
    }

    #[test]
    fn lexer_read_ident_curlies() {
        // read_ident includes dots in the name, but an expansion $bar.dots
        // stops at the dot.
        let mut lexer = Lexer::new_with_input("foo.dots $bar.dots ${bar.dots}\n");
        assert_eq!(Ok("foo.dots"), lexer.read_ident("read_ident"));

        let mut eval = EvalString::new();
        assert_eq!(Ok(()), lexer.read_var_value(&mut eval));
        assert_eq!("[$bar][.dots ][$bar.dots]", eval.serialize());
    }

    #[test]
    fn lexer_error() {
        let mut lexer = Lexer::new_with_input("foo$\nbad $");
        let mut eval = EvalString::new();
        assert_eq!(
            Err(concat!(
                "input:2: bad $-escape (literal $ must be written as $$)\n",
                "bad $\n",
                "    ^ near here",
            )
            .to_owned()),
            lexer.read_var_value(&mut eval)
        );
    }

    #[test]
    fn lexer_comment_eof() {
        // Don't run off the end of the string when the EOF is mid-comment.
        let mut lexer = Lexer::new_with_input("# foo");
        assert_eq!(LexerToken::Error, lexer.read_token());
    }

    #[test]
    fn lexer_tabs() {
        // A useful error is printed on a disallowed character.
        let mut lexer = Lexer::new_with_input("   \tfoobar");
        assert_eq!(LexerToken::Indent, lexer.read_token());
        assert_eq!(LexerToken::Error, lexer.read_token());
        assert_eq!(
            "tabs are not allowed, use spaces",
            lexer.describe_last_error()
        );
    }

    #[test]
    fn lexer_keywords_and_paths() {
        let mut lexer = Lexer::new_with_input("build foo: cat bar | baz || quux\n");
        assert_eq!(LexerToken::Build, lexer.read_token());

        let mut path = EvalString::new();
        lexer.read_path(&mut path).unwrap();
        assert_eq!("[foo]", path.serialize());

        assert_eq!(LexerToken::Colon, lexer.read_token());
        assert_eq!(Ok("cat"), lexer.read_ident("rule name"));

        let mut path = EvalString::new();
        lexer.read_path(&mut path).unwrap();
        assert_eq!("[bar]", path.serialize());

        assert_eq!(LexerToken::Pipe, lexer.read_token());
        let mut path = EvalString::new();
        lexer.read_path(&mut path).unwrap();
        assert_eq!("[baz]", path.serialize());

        assert_eq!(LexerToken::Pipe2, lexer.read_token());
        let mut path = EvalString::new();
        lexer.read_path(&mut path).unwrap();
        assert_eq!("[quux]", path.serialize());

        assert_eq!(LexerToken::Newline, lexer.read_token());
        assert_eq!(LexerToken::Teof, lexer.read_token());
    }

    #[test]
    fn lexer_peek_and_unread() {
        let mut lexer = Lexer::new_with_input("rule cat\n");
        assert!(!lexer.peek_token(LexerToken::Build));
        assert!(lexer.peek_token(LexerToken::Rule));
        assert_eq!(Ok("cat"), lexer.read_ident("rule name"));
    }
}
