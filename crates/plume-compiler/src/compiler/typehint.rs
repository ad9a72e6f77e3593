//! Static type hints (`local n: number`, `function f(): string`).
//!
//! Hints never change the emitted code. They only feed the mismatch warnings
//! raised when a statically known value lands in a hinted variable or return.
use super::Compiler;
use crate::diagnostic::CompileError;
use crate::token::Token;
use std::fmt;

/// Statically known category of a value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueType {
    Number,
    Table,
    String,
    Boolean,
    Nil,
    Function,
}

impl ValueType {
    pub fn name(self) -> &'static str {
        match self {
            ValueType::Number => "number",
            ValueType::Table => "table",
            ValueType::String => "string",
            ValueType::Boolean => "boolean",
            ValueType::Nil => "nil",
            ValueType::Function => "function",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Result of looking up a hint name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HintName {
    Known(ValueType),
    /// Accepted, but places no constraint on the value (`userdata`).
    Unconstrained,
    Unknown,
}

pub fn classify(name: &str) -> HintName {
    match name {
        "number" => HintName::Known(ValueType::Number),
        "table" => HintName::Known(ValueType::Table),
        "string" => HintName::Known(ValueType::String),
        "boolean" | "bool" => HintName::Known(ValueType::Boolean),
        "nil" => HintName::Known(ValueType::Nil),
        "function" => HintName::Known(ValueType::Function),
        "userdata" => HintName::Unconstrained,
        _ => HintName::Unknown,
    }
}

/// What the compiler statically knows about an expression.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TypeInfo {
    /// Type of the value itself.
    pub ty: Option<ValueType>,
    /// For functions: type of the first returned value.
    pub returns: Option<ValueType>,
}

impl TypeInfo {
    pub fn of(ty: ValueType) -> Self {
        TypeInfo {
            ty: Some(ty),
            returns: None,
        }
    }
}

/// `Some((hinted, actual))` when both are known and disagree.
pub fn mismatch(
    hint: Option<ValueType>,
    actual: Option<ValueType>,
) -> Option<(ValueType, ValueType)> {
    match (hint, actual) {
        (Some(h), Some(a)) if h != a => Some((h, a)),
        _ => None,
    }
}

impl Compiler<'_> {
    /// TYPEHINT -> [':' NAME]
    pub(super) fn type_hint(&mut self) -> Result<Option<ValueType>, CompileError> {
        if !self.test_next(&Token::Colon)? {
            return Ok(None);
        }
        let name = match self.current()? {
            // keywords that double as type names
            Token::Nil | Token::Function => {
                let tok = self.current()?;
                self.advance()?;
                tok.to_string()
            }
            _ => {
                let id = self.check_name()?;
                self.lexer.strings.get_str(id).into_owned()
            }
        };
        match classify(&name) {
            HintName::Known(ty) => Ok(Some(ty)),
            HintName::Unconstrained => Ok(None),
            HintName::Unknown => Err(self.error(format!("unknown type hint '{name}'"))),
        }
    }

    /// Record a value assigned to local `vidx`, warning when it contradicts the hint.
    pub(super) fn process_assign(&mut self, vidx: usize, produced: TypeInfo) {
        let var = self.local_var(vidx);
        let (name, hint) = (var.name, var.hint);
        if let Some((hinted, actual)) = mismatch(hint, produced.ty) {
            let message = format!(
                "{} was type-hinted as {hinted} but is assigned a {actual} value",
                self.lexer.strings.get_str(name)
            );
            let line = self.lexer.lastline;
            self.warn(line, message, Some("type mismatch".to_string()));
        }
        self.local_var(vidx).known = produced;
    }
}
