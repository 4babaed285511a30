// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Tests for the scanner.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use proptest::prelude::*;

use super::{Scanner, Token, TokenKind};

fn scan_all(source: &str) -> Vec<Token<'_>> {
    let mut scanner = Scanner::new(source);
    let mut tokens = Vec::new();
    loop {
        let token = scanner.scan_token();
        let done = token.kind == TokenKind::Eof;
        tokens.push(token);
        if done {
            break;
        }
    }
    tokens
}

fn kinds(source: &str) -> Vec<TokenKind> {
    scan_all(source).iter().map(|t| t.kind).collect()
}

#[test]
fn empty_source_is_just_eof() {
    assert_eq!(kinds(""), vec![TokenKind::Eof]);
    assert_eq!(kinds("   \t\r\n"), vec![TokenKind::Eof]);
}

#[test]
fn punctuation() {
    assert_eq!(
        kinds("(){};,.-+/*"),
        vec![
            TokenKind::LeftParen,
            TokenKind::RightParen,
            TokenKind::LeftBrace,
            TokenKind::RightBrace,
            TokenKind::Semicolon,
            TokenKind::Comma,
            TokenKind::Dot,
            TokenKind::Minus,
            TokenKind::Plus,
            TokenKind::Slash,
            TokenKind::Star,
            TokenKind::Eof,
        ]
    );
}

#[test]
fn one_and_two_character_operators() {
    assert_eq!(
        kinds("! != = == < <= > >="),
        vec![
            TokenKind::Bang,
            TokenKind::BangEqual,
            TokenKind::Equal,
            TokenKind::EqualEqual,
            TokenKind::Less,
            TokenKind::LessEqual,
            TokenKind::Greater,
            TokenKind::GreaterEqual,
            TokenKind::Eof,
        ]
    );
}

#[test]
fn keywords_and_identifiers() {
    assert_eq!(
        kinds("and class else false for fun if nil or return super this true var while"),
        vec![
            TokenKind::And,
            TokenKind::Class,
            TokenKind::Else,
            TokenKind::False,
            TokenKind::For,
            TokenKind::Fun,
            TokenKind::If,
            TokenKind::Nil,
            TokenKind::Or,
            TokenKind::Return,
            TokenKind::Super,
            TokenKind::This,
            TokenKind::True,
            TokenKind::Var,
            TokenKind::While,
            TokenKind::Eof,
        ]
    );

    // Prefixes of keywords are plain identifiers.
    assert_eq!(
        kinds("an classy force thistle _var"),
        vec![
            TokenKind::Identifier,
            TokenKind::Identifier,
            TokenKind::Identifier,
            TokenKind::Identifier,
            TokenKind::Identifier,
            TokenKind::Eof,
        ]
    );
}

#[test]
fn numbers() {
    let tokens = scan_all("12 3.5 0.25 7.");
    assert_eq!(tokens[0].kind, TokenKind::Number);
    assert_eq!(tokens[0].lexeme, "12");
    assert_eq!(tokens[1].kind, TokenKind::Number);
    assert_eq!(tokens[1].lexeme, "3.5");
    assert_eq!(tokens[2].lexeme, "0.25");
    // A trailing dot is not part of the number.
    assert_eq!(tokens[3].lexeme, "7");
    assert_eq!(tokens[4].kind, TokenKind::Dot);
}

#[test]
fn strings_keep_their_quotes_in_the_lexeme() {
    let tokens = scan_all("\"hello world\"");
    assert_eq!(tokens[0].kind, TokenKind::String);
    assert_eq!(tokens[0].lexeme, "\"hello world\"");
}

#[test]
fn multiline_strings_count_lines() {
    let tokens = scan_all("\"a\nb\" x");
    assert_eq!(tokens[0].kind, TokenKind::String);
    assert_eq!(tokens[0].line, 1);
    assert_eq!(tokens[1].kind, TokenKind::Identifier);
    assert_eq!(tokens[1].line, 2);
}

#[test]
fn unterminated_string_is_an_error_token() {
    let tokens = scan_all("\"oops");
    assert_eq!(tokens[0].kind, TokenKind::Error);
    assert_eq!(tokens[0].lexeme, "unterminated string");
}

#[test]
fn unexpected_character_is_an_error_token() {
    let tokens = scan_all("@");
    assert_eq!(tokens[0].kind, TokenKind::Error);
    assert_eq!(tokens[0].lexeme, "unexpected character");
}

#[test]
fn comments_run_to_end_of_line() {
    assert_eq!(
        kinds("1 // the rest is ignored ;;;\n2"),
        vec![TokenKind::Number, TokenKind::Number, TokenKind::Eof]
    );
    // A lone slash is division.
    assert_eq!(
        kinds("1 / 2"),
        vec![
            TokenKind::Number,
            TokenKind::Slash,
            TokenKind::Number,
            TokenKind::Eof,
        ]
    );
}

#[test]
fn line_numbers_advance_on_newlines() {
    let tokens = scan_all("a\nb\n\nc");
    assert_eq!(tokens[0].line, 1);
    assert_eq!(tokens[1].line, 2);
    assert_eq!(tokens[2].line, 4);
}

#[test]
fn eof_repeats_forever() {
    let mut scanner = Scanner::new("x");
    assert_eq!(scanner.scan_token().kind, TokenKind::Identifier);
    assert_eq!(scanner.scan_token().kind, TokenKind::Eof);
    assert_eq!(scanner.scan_token().kind, TokenKind::Eof);
}

proptest! {
    /// Scanning arbitrary input terminates and never panics; every token
    /// consumes at least one byte, so the token count is bounded by the
    /// source length.
    #[test]
    fn scanning_is_total(source in ".*") {
        let mut scanner = Scanner::new(&source);
        let mut count = 0usize;
        loop {
            let token = scanner.scan_token();
            if token.kind == TokenKind::Eof {
                break;
            }
            count += 1;
            prop_assert!(count <= source.len());
        }
    }
}
