#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Literals
    Number(std::string::String),
    String(std::string::String),
    True,
    False,
    None,

    // Declarations
    Rat,
    Runnable,
    EndRunnable,
    Return,

    // Control flow
    If,
    Else,
    EndIf,
    While,
    EndWhile,
    Repeat,
    EndRepeat,

    // Logic
    And,
    Or,
    Bang,

    // Arithmetic
    Plus,
    Minus,
    Star,
    Slash,

    // Bitwise
    Amp,
    Pipe,
    Caret,
    Tilde,
    ShiftLeft,
    ShiftRight,

    // Comparison
    EqEq,
    NotEq,
    Lt,
    Gt,
    LtEq,
    GtEq,

    // Assignment
    Assign,
    PlusPlus,
    MinusMinus,
    PlusAssign,
    MinusAssign,
    StarAssign,
    SlashAssign,
    AmpAssign,
    PipeAssign,
    CaretAssign,
    ShiftLeftAssign,
    ShiftRightAssign,

    // Delimiters
    LParen,
    RParen,
    Comma,
    Colon,

    Ident(std::string::String),

    // Special
    Comment(std::string::String),
    Newline,
    Eof,
}

impl Token {
    /// Keyword lookup for a scanned identifier.
    pub fn keyword(ident: &str) -> Option<Token> {
        let token = match ident {
            "true" => Token::True,
            "false" => Token::False,
            "none" => Token::None,
            "rat" => Token::Rat,
            "runnable" => Token::Runnable,
            "endrunnable" => Token::EndRunnable,
            "return" => Token::Return,
            "if" => Token::If,
            "else" => Token::Else,
            "endif" => Token::EndIf,
            "while" => Token::While,
            "endwhile" => Token::EndWhile,
            "repeat" => Token::Repeat,
            "endrepeat" => Token::EndRepeat,
            "and" => Token::And,
            "or" => Token::Or,
            _ => return Option::None,
        };
        Some(token)
    }

    /// Tokens that close a block opened by a `:` header.
    pub fn is_block_end(&self) -> bool {
        matches!(
            self,
            Token::Else | Token::EndIf | Token::EndWhile | Token::EndRepeat | Token::EndRunnable
        )
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Number(n) => write!(f, "{}", n),
            Token::String(s) => write!(f, "\"{}\"", s),
            Token::True => write!(f, "true"),
            Token::False => write!(f, "false"),
            Token::None => write!(f, "none"),
            Token::Rat => write!(f, "rat"),
            Token::Runnable => write!(f, "runnable"),
            Token::EndRunnable => write!(f, "endrunnable"),
            Token::Return => write!(f, "return"),
            Token::If => write!(f, "if"),
            Token::Else => write!(f, "else"),
            Token::EndIf => write!(f, "endif"),
            Token::While => write!(f, "while"),
            Token::EndWhile => write!(f, "endwhile"),
            Token::Repeat => write!(f, "repeat"),
            Token::EndRepeat => write!(f, "endrepeat"),
            Token::And => write!(f, "and"),
            Token::Or => write!(f, "or"),
            Token::Bang => write!(f, "!"),
            Token::Plus => write!(f, "+"),
            Token::Minus => write!(f, "-"),
            Token::Star => write!(f, "*"),
            Token::Slash => write!(f, "/"),
            Token::Amp => write!(f, "&"),
            Token::Pipe => write!(f, "|"),
            Token::Caret => write!(f, "^"),
            Token::Tilde => write!(f, "~"),
            Token::ShiftLeft => write!(f, "<<"),
            Token::ShiftRight => write!(f, ">>"),
            Token::EqEq => write!(f, "=="),
            Token::NotEq => write!(f, "!="),
            Token::Lt => write!(f, "<"),
            Token::Gt => write!(f, ">"),
            Token::LtEq => write!(f, "<="),
            Token::GtEq => write!(f, ">="),
            Token::Assign => write!(f, "="),
            Token::PlusPlus => write!(f, "++"),
            Token::MinusMinus => write!(f, "--"),
            Token::PlusAssign => write!(f, "+="),
            Token::MinusAssign => write!(f, "-="),
            Token::StarAssign => write!(f, "*="),
            Token::SlashAssign => write!(f, "/="),
            Token::AmpAssign => write!(f, "&="),
            Token::PipeAssign => write!(f, "|="),
            Token::CaretAssign => write!(f, "^="),
            Token::ShiftLeftAssign => write!(f, "<<="),
            Token::ShiftRightAssign => write!(f, ">>="),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::Comma => write!(f, ","),
            Token::Colon => write!(f, ":"),
            Token::Ident(s) => write!(f, "{}", s),
            Token::Comment(s) => write!(f, "# {}", s),
            Token::Newline => write!(f, "\\n"),
            Token::Eof => write!(f, "EOF"),
        }
    }
}
