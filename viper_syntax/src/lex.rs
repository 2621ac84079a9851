use crate::{
    error::{Error, ErrorMsg},
    token::{TextRange, Token, TokenKind},
};
use log::trace;
use std::{iter::Peekable, str::CharIndices};

#[derive(Debug)]
pub struct Lexer<'a> {
    source: &'a str,
    stream: Peekable<CharIndices<'a>>,
    line: usize,
    start_line: usize,
    start: usize,
    current: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        Self {
            source,
            stream: source.char_indices().peekable(),
            line: 1,
            start_line: 1,
            start: 0,
            current: 0,
        }
    }

    pub fn lex_all(mut self) -> Result<Vec<Token>, Vec<Error>> {
        let mut tokens: Vec<Token> = Vec::default();
        let mut errors: Vec<Error> = Vec::default();
        loop {
            match self.lex() {
                Ok(t) => {
                    if t.kind == TokenKind::EOF {
                        break;
                    } else {
                        tokens.push(t);
                    }
                }
                Err(e) => errors.push(e),
            }
        }
        if errors.is_empty() {
            Ok(tokens)
        } else {
            Err(errors)
        }
    }

    /// Same as [`Lexer::lex_all`], with whitespace and comments dropped
    pub fn lex_all_sanitised(self) -> Result<Vec<Token>, Vec<Error>> {
        self.lex_all()
            .map(|tokens| tokens.into_iter().filter(|t| !t.kind.is_trivia()).collect())
    }

    /// Pulls the next meaningful token, skipping whitespace and comments.
    /// Once the source is exhausted, every call returns an `EOF` token.
    pub fn next_token(&mut self) -> Result<Token, Error> {
        loop {
            let token = self.lex()?;
            if !token.kind.is_trivia() {
                trace!("Token {:?} '{}'", token.kind, token.lexeme);
                return Ok(token);
            }
        }
    }

    pub fn lex(&mut self) -> Result<Token, Error> {
        self.start = self.current;
        self.start_line = self.line;
        match self.advance() {
            Some(c) => match c {
                '!' => Ok(self.lookahead_for_token('=', TokenKind::BANG_EQUAL, TokenKind::BANG)),
                '=' => Ok(self.lookahead_for_token('=', TokenKind::EQUAL_EQUAL, TokenKind::EQUAL)),
                '>' => Ok(self.lookahead_for_token(
                    '=',
                    TokenKind::GREATER_EQUAL,
                    TokenKind::GREATER,
                )),
                '<' => Ok(self.lookahead_for_token('=', TokenKind::LESS_EQUAL, TokenKind::LESS)),
                '+' => Ok(self.lookahead_for_token('=', TokenKind::PLUS_EQUAL, TokenKind::PLUS)),
                '-' => Ok(self.lookahead_for_token('=', TokenKind::MINUS_EQUAL, TokenKind::MINUS)),
                '*' => Ok(self.lookahead_for_token('=', TokenKind::STAR_EQUAL, TokenKind::STAR)),
                '%' => Ok(self.lookahead_for_token(
                    '=',
                    TokenKind::MODULO_EQUAL,
                    TokenKind::MODULO,
                )),
                '"' => self.lex_string(),
                '/' => self.lex_slash_or_comment(),
                _ => {
                    if let Some(t) = TokenKind::from_char(c) {
                        Ok(self.make_token(t))
                    } else if c.is_ascii_alphabetic() || c == '_' {
                        Ok(self.lex_ident())
                    } else if c.is_ascii_digit() {
                        self.lex_number()
                    } else {
                        Err(self.error(ErrorMsg::UnexpectedChar))
                    }
                }
            },
            None => Ok(Token::new(
                TokenKind::EOF,
                self.text_range(),
                self.line,
                String::default(),
            )),
        }
    }

    fn lex_ident(&mut self) -> Token {
        self.advance_while(|c| c.is_ascii_alphanumeric() || c == '_');
        if let Some(t) = TokenKind::from_keyword(self.lexeme_from_range()) {
            self.make_token(t)
        } else {
            self.make_token(TokenKind::IDENT)
        }
    }

    fn lex_number(&mut self) -> Result<Token, Error> {
        // Consume numbers
        self.advance_while(|c| c.is_ascii_digit());
        // Check if dot is present
        if self.advance_if(|c| c == '.').is_some() {
            // Ensure the next character is a number
            if self.advance_while(|c| c.is_ascii_digit()).is_none() {
                return Err(self.error(ErrorMsg::MalformedNumber));
            }
        }
        Ok(self.make_token(TokenKind::NUMBER))
    }

    fn lex_string(&mut self) -> Result<Token, Error> {
        // Strings may span lines, so only the end of input terminates them early
        self.advance_while(|c| c != '"');
        if self.advance_if(|c| c == '"').is_none() {
            return Err(self.error(ErrorMsg::UnterminatedString));
        }
        // The lexeme excludes both quotes
        let range = TextRange {
            start: self.start + 1,
            end: self.current - 1,
        };
        Ok(Token::new(
            TokenKind::STRING,
            range,
            self.start_line,
            self.source[range.start..range.end].to_string(),
        ))
    }

    fn lex_slash_or_comment(&mut self) -> Result<Token, Error> {
        if self.advance_if(|c| c == '/').is_some() {
            self.advance_while(|c| c != '\n');
            Ok(self.make_token(TokenKind::COMMENT))
        } else if self.advance_if(|c| c == '*').is_some() {
            self.lex_block_comment()
        } else {
            Ok(self.lookahead_for_token('=', TokenKind::SLASH_EQUAL, TokenKind::SLASH))
        }
    }

    /// Block comments nest, so `/* a /* b */ c */` is a single comment
    fn lex_block_comment(&mut self) -> Result<Token, Error> {
        let mut depth = 1;
        while depth > 0 {
            match self.advance() {
                Some('/') if self.advance_if(|c| c == '*').is_some() => depth += 1,
                Some('*') if self.advance_if(|c| c == '/').is_some() => depth -= 1,
                Some(_) => (),
                None => return Err(self.error(ErrorMsg::UnterminatedComment)),
            }
        }
        Ok(self.make_token(TokenKind::COMMENT))
    }

    fn make_token(&self, kind: TokenKind) -> Token {
        Token::new(
            kind,
            self.text_range(),
            self.start_line,
            self.lexeme_from_range().to_string(),
        )
    }

    fn lexeme_from_range(&self) -> &'a str {
        &self.source[self.start..self.current]
    }

    fn text_range(&self) -> TextRange {
        TextRange {
            start: self.start,
            end: self.current,
        }
    }

    fn advance(&mut self) -> Option<char> {
        let (idx, c) = self.stream.next()?;
        self.current = idx + c.len_utf8();
        if c == '\n' {
            self.line += 1;
        }
        Some(c)
    }

    fn advance_if<F>(&mut self, cond: F) -> Option<char>
    where
        F: FnOnce(char) -> bool,
    {
        if self.stream.peek().filter(|&&(_, c)| cond(c)).is_some() {
            self.advance()
        } else {
            None
        }
    }

    fn advance_while<F>(&mut self, cond: F) -> Option<usize>
    where
        F: Fn(char) -> bool,
    {
        let mut count: usize = 0;
        while self.stream.peek().filter(|&&(_, c)| cond(c)).is_some() {
            count += 1;
            self.advance();
        }
        count.ne(&0).then_some(count)
    }

    fn lookahead_for_token(
        &mut self,
        match_char: char,
        if_match: TokenKind,
        no_match: TokenKind,
    ) -> Token {
        if self.advance_if(|c| c == match_char).is_some() {
            self.make_token(if_match)
        } else {
            self.make_token(no_match)
        }
    }

    fn error(&self, msg: ErrorMsg) -> Error {
        Error {
            line: self.start_line,
            msg,
            lexeme: self.lexeme_from_range().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(input: &str) -> Vec<TokenKind> {
        Lexer::new(input)
            .lex_all_sanitised()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    fn lex_err(input: &str) -> ErrorMsg {
        Lexer::new(input).lex_all().unwrap_err().remove(0).msg
    }

    #[test]
    fn keywords_and_idents() {
        assert_eq!(
            kinds("var fn class switch case default _x print"),
            vec![
                TokenKind::VAR,
                TokenKind::FN,
                TokenKind::CLASS,
                TokenKind::SWITCH,
                TokenKind::CASE,
                TokenKind::DEFAULT,
                TokenKind::IDENT,
                TokenKind::PRINT,
            ]
        );
    }

    #[test]
    fn operators() {
        assert_eq!(
            kinds("+= -= *= /= %= != == <= >= ? : [ ]"),
            vec![
                TokenKind::PLUS_EQUAL,
                TokenKind::MINUS_EQUAL,
                TokenKind::STAR_EQUAL,
                TokenKind::SLASH_EQUAL,
                TokenKind::MODULO_EQUAL,
                TokenKind::BANG_EQUAL,
                TokenKind::EQUAL_EQUAL,
                TokenKind::LESS_EQUAL,
                TokenKind::GREATER_EQUAL,
                TokenKind::QUESTION,
                TokenKind::COLON,
                TokenKind::LBRACKET,
                TokenKind::RBRACKET,
            ]
        );
    }

    #[test]
    fn string_lexeme_drops_quotes() {
        let tokens = Lexer::new("\"hello\nworld\" x").lex_all_sanitised().unwrap();
        assert_eq!(tokens[0].kind, TokenKind::STRING);
        assert_eq!(tokens[0].lexeme, "hello\nworld");
        assert_eq!(tokens[1].line, 2);
    }

    #[test]
    fn numbers() {
        let tokens = Lexer::new("12 3.25").lex_all_sanitised().unwrap();
        assert_eq!(tokens[0].lexeme, "12");
        assert_eq!(tokens[1].lexeme, "3.25");
    }

    #[test]
    fn comments_are_trivia() {
        assert_eq!(
            kinds("a // line\n/* block /* nested */ still */ b"),
            vec![TokenKind::IDENT, TokenKind::IDENT]
        );
    }

    #[test]
    fn errors() {
        assert_eq!(lex_err("\"open"), ErrorMsg::UnterminatedString);
        assert_eq!(lex_err("/* open"), ErrorMsg::UnterminatedComment);
        assert_eq!(lex_err("1."), ErrorMsg::MalformedNumber);
        assert_eq!(lex_err("@"), ErrorMsg::UnexpectedChar);
    }

    #[test]
    fn eof_repeats() {
        let mut lexer = Lexer::new("x");
        assert_eq!(lexer.next_token().unwrap().kind, TokenKind::IDENT);
        assert_eq!(lexer.next_token().unwrap().kind, TokenKind::EOF);
        assert_eq!(lexer.next_token().unwrap().kind, TokenKind::EOF);
    }
}
