use plume_core::string::StringId;
use std::fmt;

/// Source location span.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Span {
    pub line: u32,
    pub column: u32,
}

/// A token with its source location.
#[derive(Clone, Debug, PartialEq)]
pub struct SpannedToken {
    pub token: Token,
    pub span: Span,
}

/// Operator carried by a compound assignment token (`+=`, `..=`, `??=`, ...).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompoundOp {
    Add,
    Sub,
    Mul,
    Div,
    IDiv,
    Mod,
    Pow,
    Concat,
    BOr,
    BAnd,
    Shl,
    Shr,
    Coalesce,
}

impl CompoundOp {
    pub fn symbol(self) -> &'static str {
        match self {
            CompoundOp::Add => "+=",
            CompoundOp::Sub => "-=",
            CompoundOp::Mul => "*=",
            CompoundOp::Div => "/=",
            CompoundOp::IDiv => "//=",
            CompoundOp::Mod => "%=",
            CompoundOp::Pow => "^=",
            CompoundOp::Concat => "..=",
            CompoundOp::BOr => "|=",
            CompoundOp::BAnd => "&=",
            CompoundOp::Shl => "<<=",
            CompoundOp::Shr => ">>=",
            CompoundOp::Coalesce => "??=",
        }
    }
}

/// All plume tokens: the Lua 5.4 set plus the dialect's extra keywords and operators.
#[derive(Clone, Debug, PartialEq)]
pub enum Token {
    // --- Keywords ---
    And,
    Break,
    Case,
    Continue,
    Default,
    Do,
    Else,
    ElseIf,
    End,
    False,
    For,
    Function,
    Goto,
    If,
    In,
    Local,
    Nil,
    Not,
    Or,
    Repeat,
    Return,
    Switch,
    Then,
    True,
    Until,
    When,
    While,

    // --- Literals ---
    Integer(i64),
    Float(f64),
    String(StringId),
    Name(StringId),

    // --- Single-char operators/punctuation ---
    Plus,        // +
    Minus,       // -
    Star,        // *
    Slash,       // /
    Percent,     // %
    Caret,       // ^ and **
    Hash,        // #
    Ampersand,   // &
    Tilde,       // ~
    Pipe,        // |
    Less,        // <
    Greater,     // >
    Assign,      // =
    LParen,      // (
    RParen,      // )
    LBrace,      // {
    RBrace,      // }
    LBracket,    // [
    RBracket,    // ]
    DoubleColon, // ::
    Semi,        // ;
    Colon,       // :
    Comma,       // ,
    Dot,         // .
    Question,    // ?

    // --- Multi-char operators ---
    ShiftLeft,  // <<
    ShiftRight, // >>
    FloorDiv,   // //
    Equal,      // ==
    NotEqual,   // ~= and !=
    LessEq,     // <=
    GreaterEq,  // >=
    DotDot,     // ..
    DotDotDot,  // ...
    Coalesce,   // ??
    Arrow,      // ->
    OpAssign(CompoundOp),

    // --- EOF ---
    Eof,
}

impl Token {
    /// Try to match a keyword from an identifier string.
    pub fn keyword_from_str(s: &str) -> Option<Token> {
        match s {
            "and" => Some(Token::And),
            "break" => Some(Token::Break),
            "case" => Some(Token::Case),
            "continue" => Some(Token::Continue),
            "default" => Some(Token::Default),
            "do" => Some(Token::Do),
            "else" => Some(Token::Else),
            "elseif" => Some(Token::ElseIf),
            "end" => Some(Token::End),
            "false" => Some(Token::False),
            "for" => Some(Token::For),
            "function" => Some(Token::Function),
            "goto" => Some(Token::Goto),
            "if" => Some(Token::If),
            "in" => Some(Token::In),
            "local" => Some(Token::Local),
            "nil" => Some(Token::Nil),
            "not" => Some(Token::Not),
            "or" => Some(Token::Or),
            "repeat" => Some(Token::Repeat),
            "return" => Some(Token::Return),
            "switch" => Some(Token::Switch),
            "then" => Some(Token::Then),
            "true" => Some(Token::True),
            "until" => Some(Token::Until),
            "when" => Some(Token::When),
            "while" => Some(Token::While),
            _ => None,
        }
    }

    /// Spelling of a keyword that may still serve as a field name (`t.default`,
    /// `{ case = 1 }`). Value keywords (`nil`, `true`, `false`) are excluded.
    pub fn non_value_keyword(&self) -> Option<&'static str> {
        let s = match self {
            Token::And => "and",
            Token::Break => "break",
            Token::Case => "case",
            Token::Continue => "continue",
            Token::Default => "default",
            Token::Do => "do",
            Token::Else => "else",
            Token::ElseIf => "elseif",
            Token::End => "end",
            Token::For => "for",
            Token::Function => "function",
            Token::Goto => "goto",
            Token::If => "if",
            Token::In => "in",
            Token::Local => "local",
            Token::Not => "not",
            Token::Or => "or",
            Token::Repeat => "repeat",
            Token::Return => "return",
            Token::Switch => "switch",
            Token::Then => "then",
            Token::Until => "until",
            Token::When => "when",
            Token::While => "while",
            _ => return None,
        };
        Some(s)
    }

    /// Whether this token closes a block: `else`, `elseif`, `end` and EOF
    /// always, the `repeat` terminators only when `with_until` is set.
    pub fn is_block_follow(&self, with_until: bool) -> bool {
        match self {
            Token::Else | Token::ElseIf | Token::End | Token::Eof => true,
            Token::Until | Token::When => with_until,
            _ => false,
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(kw) = self.non_value_keyword() {
            return write!(f, "{kw}");
        }
        match self {
            Token::False => write!(f, "false"),
            Token::Nil => write!(f, "nil"),
            Token::True => write!(f, "true"),
            Token::Integer(i) => write!(f, "{i}"),
            Token::Float(fl) => write!(f, "{fl}"),
            Token::String(_) => write!(f, "<string>"),
            Token::Name(_) => write!(f, "<name>"),
            Token::Plus => write!(f, "+"),
            Token::Minus => write!(f, "-"),
            Token::Star => write!(f, "*"),
            Token::Slash => write!(f, "/"),
            Token::Percent => write!(f, "%"),
            Token::Caret => write!(f, "^"),
            Token::Hash => write!(f, "#"),
            Token::Ampersand => write!(f, "&"),
            Token::Tilde => write!(f, "~"),
            Token::Pipe => write!(f, "|"),
            Token::Less => write!(f, "<"),
            Token::Greater => write!(f, ">"),
            Token::Assign => write!(f, "="),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::LBrace => write!(f, "{{"),
            Token::RBrace => write!(f, "}}"),
            Token::LBracket => write!(f, "["),
            Token::RBracket => write!(f, "]"),
            Token::DoubleColon => write!(f, "::"),
            Token::Semi => write!(f, ";"),
            Token::Colon => write!(f, ":"),
            Token::Comma => write!(f, ","),
            Token::Dot => write!(f, "."),
            Token::Question => write!(f, "?"),
            Token::ShiftLeft => write!(f, "<<"),
            Token::ShiftRight => write!(f, ">>"),
            Token::FloorDiv => write!(f, "//"),
            Token::Equal => write!(f, "=="),
            Token::NotEqual => write!(f, "~="),
            Token::LessEq => write!(f, "<="),
            Token::GreaterEq => write!(f, ">="),
            Token::DotDot => write!(f, ".."),
            Token::DotDotDot => write!(f, "..."),
            Token::Coalesce => write!(f, "??"),
            Token::Arrow => write!(f, "->"),
            Token::OpAssign(op) => write!(f, "{}", op.symbol()),
            Token::Eof => write!(f, "<eof>"),
            _ => Ok(()),
        }
    }
}
