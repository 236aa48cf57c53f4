use std::io::{self, Write};

use crate::frontend::lexer::Spanned;
use crate::frontend::token::Token;

pub struct TokenDumper {
    pub color: bool,
    pub show_debug_repr: bool, // if false, prints the source form of each token
}

impl Default for TokenDumper {
    fn default() -> Self {
        Self {
            color: true,
            show_debug_repr: true,
        }
    }
}

impl TokenDumper {
    // ANSI colors
    const RESET: &'static str = "\x1b[0m";
    const DIM: &'static str = "\x1b[2m";
    const GRN: &'static str = "\x1b[32m";
    const YEL: &'static str = "\x1b[33m";
    const BLU: &'static str = "\x1b[34m";
    const CYN: &'static str = "\x1b[36m";
    const MAG: &'static str = "\x1b[35m";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn no_color(mut self) -> Self {
        self.color = false;
        self
    }

    pub fn pretty(mut self) -> Self {
        self.show_debug_repr = false;
        self
    }

    pub fn dump(&self, tokens: &[Spanned]) -> io::Result<()> {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        self.write_all(&mut out, tokens)
    }

    pub fn write_all(&self, out: &mut dyn Write, tokens: &[Spanned]) -> io::Result<()> {
        for s in tokens {
            self.write_one(out, s)?;
        }
        Ok(())
    }

    fn write_one(&self, out: &mut dyn Write, s: &Spanned) -> io::Result<()> {
        let line = s.span.line;
        let col = s.span.col;

        let kind = self.kind(&s.token);
        let colr = if self.color { self.color(&s.token) } else { "" };
        let reset = if self.color { Self::RESET } else { "" };

        if self.show_debug_repr {
            writeln!(
                out,
                "[{:02}:{:02}] {}{:<8} {:?}{}",
                line, col, colr, kind, s.token, reset
            )
        } else {
            match &s.token {
                Token::Comment(c) => writeln!(
                    out,
                    "[{:02}:{:02}] {}{:<8} COMMENT: {}{}",
                    line, col, colr, kind, c, reset
                ),
                _ => writeln!(
                    out,
                    "[{:02}:{:02}] {}{:<8} {}{}",
                    line, col, colr, kind, s.token, reset
                ),
            }
        }
    }

    fn kind(&self, t: &Token) -> &'static str {
        use Token::*;
        match t {
            Newline => "NEWLINE",
            Comment(_) => "COMMENT",
            Eof => "EOF",

            Number(_) => "NUMBER",
            String(_) => "STRING",
            True | False | None => "LITERAL",

            Ident(_) => "IDENT",

            LParen | RParen | Comma | Colon => "PUNCT",

            Plus | Minus | Star | Slash | Bang | Amp | Pipe | Caret | Tilde | ShiftLeft
            | ShiftRight => "OP",
            EqEq | NotEq | Lt | LtEq | Gt | GtEq => "CMP",
            Assign | PlusPlus | MinusMinus | PlusAssign | MinusAssign | StarAssign
            | SlashAssign | AmpAssign | PipeAssign | CaretAssign | ShiftLeftAssign
            | ShiftRightAssign => "ASSIGN",

            _ => "KEYWORD",
        }
    }

    fn color(&self, t: &Token) -> &'static str {
        match self.kind(t) {
            "NEWLINE" | "COMMENT" | "EOF" => Self::DIM,
            "STRING" => Self::GRN,
            "NUMBER" | "LITERAL" => Self::CYN,
            "IDENT" => Self::YEL,
            "OP" | "CMP" | "ASSIGN" => Self::MAG,
            "KEYWORD" => Self::BLU,
            _ => Self::RESET,
        }
    }
}
