//! Single-pass compiler: tokens in, a tree of [`Proto`]s out.
//!
//! There is no syntax tree. Each grammar rule emits bytecode as it recognizes
//! its input, so expression descriptors, pending jump lists and the register
//! stack all live on [`Compiler`] while a function is being parsed.
mod code;
mod expr;
mod scope;
mod stmt;
mod typehint;

pub use typehint::ValueType;

use crate::diagnostic::{CompileError, Diagnostic, Severity};
use crate::lexer::{LexError, Lexer};
use crate::opcode::{OpCode, MAX_BX};
use crate::options::CompileOptions;
use crate::proto::{Proto, UpvalDesc, VarKind};
use crate::token::Token;
use code::ConstKey;
use expr::{ExprDesc, ExprKind};
use indexmap::IndexMap;
use plume_core::string::{StringId, StringInterner};
use scope::{BlockCnt, BlockKind, LabelInfo, PendingGoto, VarDesc};
use tracing::{debug, warn};

/// Syntactic nesting allowed before compilation gives up.
const MAX_DEPTH: usize = 200;

/// Output of a successful compilation.
#[derive(Debug)]
pub struct Chunk {
    /// The main function; every other function is nested inside it.
    pub proto: Proto,
    /// Names and string constants referenced by the prototypes.
    pub strings: StringInterner,
    /// Non-fatal diagnostics, in source order.
    pub warnings: Vec<Diagnostic>,
}

/// State of one function being compiled.
struct FuncState {
    proto: Proto,
    /// Index of the function's first entry in the shared active-variable list.
    first_local: usize,
    /// Index of the function's first entry in the shared label list.
    first_label: usize,
    /// Active variables, compile-time constants included.
    nactvar: usize,
    /// First free register.
    free_reg: usize,
    /// Some return must close upvalues.
    needclose: bool,
    /// Instructions since the last absolute line checkpoint.
    iwthabs: u8,
    /// Line of the last instruction that saved line info.
    previous_line: u32,
    /// pc of the last jump target.
    last_target: usize,
    blocks: Vec<BlockCnt>,
    k_cache: IndexMap<ConstKey, u32>,
}

impl FuncState {
    fn new(line_defined: u32, first_local: usize, first_label: usize) -> Self {
        let mut proto = Proto::new();
        proto.line_defined = line_defined;
        FuncState {
            proto,
            first_local,
            first_label,
            nactvar: 0,
            free_reg: 0,
            needclose: false,
            iwthabs: 0,
            previous_line: line_defined,
            last_target: 0,
            blocks: Vec::new(),
            k_cache: IndexMap::new(),
        }
    }
}

/// Interned names the compiler refers to on its own.
struct Names {
    env: StringId,
    /// Label name behind `break`.
    break_: StringId,
    self_: StringId,
    /// Hidden loop control variables.
    for_state: StringId,
    /// Hidden local holding a `switch` value.
    switch: StringId,
}

/// Parser and code generator for one chunk.
pub struct Compiler<'a> {
    lexer: Lexer<'a>,
    /// Function being compiled.
    fs: FuncState,
    /// Lexically enclosing functions, outermost first.
    enclosing: Vec<FuncState>,
    /// Declared variables of all open functions.
    actvar: Vec<VarDesc>,
    /// Visible labels of all open functions.
    labels: Vec<LabelInfo>,
    /// Pending gotos of all open functions.
    gotos: Vec<PendingGoto>,
    names: Names,
    options: CompileOptions,
    warnings: Vec<Diagnostic>,
    /// Chunk name used in diagnostics.
    source: String,
    depth: usize,
}

/// Compile `source` with default options.
pub fn compile(source: &[u8], name: &str) -> Result<Chunk, CompileError> {
    compile_with(source, name, &CompileOptions::default())
}

/// Compile `source`. A leading `=` or `@` on `name` is dropped, as chunk
/// loaders use those to mark literal and file names.
pub fn compile_with(
    source: &[u8],
    name: &str,
    options: &CompileOptions,
) -> Result<Chunk, CompileError> {
    let name = name.strip_prefix(['=', '@']).unwrap_or(name);
    let mut compiler = Compiler::new(source, name, options.clone());
    let proto = compiler.main_func()?;
    Ok(Chunk {
        proto,
        warnings: compiler.warnings,
        strings: compiler.lexer.into_strings(),
    })
}

impl<'a> Compiler<'a> {
    fn new(source: &'a [u8], name: &str, options: CompileOptions) -> Self {
        let mut lexer = Lexer::new(source);
        let names = Names {
            env: lexer.strings.intern(b"_ENV"),
            break_: lexer.strings.intern(b"break"),
            self_: lexer.strings.intern(b"self"),
            for_state: lexer.strings.intern(b"(for state)"),
            switch: lexer.strings.intern(b"(switch)"),
        };
        Compiler {
            lexer,
            fs: FuncState::new(0, 0, 0),
            enclosing: Vec::new(),
            actvar: Vec::new(),
            labels: Vec::new(),
            gotos: Vec::new(),
            names,
            options,
            warnings: Vec::new(),
            source: name.to_string(),
            depth: 0,
        }
    }

    /// The main function: vararg, with `_ENV` as its only upvalue.
    fn main_func(&mut self) -> Result<Proto, CompileError> {
        self.fs.proto.source = Some(self.lexer.strings.intern(self.source.as_bytes()));
        self.enter_block(BlockKind::Plain);
        self.set_vararg(0);
        self.fs.proto.upvalues.push(UpvalDesc {
            name: Some(self.names.env),
            in_stack: true,
            index: 0,
            kind: VarKind::Regular,
        });
        self.statlist()?;
        if !self.check(&Token::Eof) {
            return Err(self.error_expected(&Token::Eof));
        }
        self.close_func()
    }

    // ---- Function states ----

    /// Start compiling a nested function defined at `line`.
    fn open_func(&mut self, line: u32) {
        let mut fs = FuncState::new(line, self.actvar.len(), self.labels.len());
        fs.proto.source = self.fs.proto.source;
        let parent = std::mem::replace(&mut self.fs, fs);
        self.enclosing.push(parent);
        self.enter_block(BlockKind::Plain);
    }

    /// Finish the current function and return to its parent.
    fn close_func(&mut self) -> Result<Proto, CompileError> {
        let level = self.nvarstack() as u8;
        self.ret(level, 0);
        self.leave_block()?;
        debug_assert!(self.fs.blocks.is_empty(), "function closed with open blocks");
        self.finish()?;
        let parent = self.enclosing.pop().unwrap_or_else(|| FuncState::new(0, 0, 0));
        let fs = std::mem::replace(&mut self.fs, parent);
        let mut proto = fs.proto;
        proto.shrink_to_fit();
        debug!(
            line = proto.line_defined,
            instructions = proto.code.len(),
            constants = proto.constants.len(),
            max_stack = proto.max_stack_size,
            "closed function"
        );
        Ok(proto)
    }

    /// Attach a finished child prototype and emit the `CLOSURE` creating it.
    fn code_closure(&mut self, proto: Proto) -> Result<ExprDesc, CompileError> {
        let idx = self.fs.proto.protos.len();
        if idx >= MAX_BX as usize {
            let line = self.fs.proto.line_defined;
            return Err(self.error_limit(line, MAX_BX as usize, "functions"));
        }
        self.fs.proto.protos.push(proto);
        let pc = self.code_abx(OpCode::Closure, 0, idx as u32);
        let mut e = ExprDesc::new(ExprKind::Reloc(pc));
        self.exp2nextreg(&mut e)?;
        Ok(e)
    }

    // ---- Nesting ----

    fn enter_level(&mut self) -> Result<(), CompileError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(self.error("chunk has too many syntax levels"));
        }
        Ok(())
    }

    fn leave_level(&mut self) {
        self.depth -= 1;
    }

    // ---- Diagnostics ----

    fn excerpt(&self, line: u32) -> Option<String> {
        self.lexer.source_line(line).map(|text| text.into_owned())
    }

    fn diagnostic(&self, severity: Severity, line: u32, message: String, here: Option<String>) -> Diagnostic {
        Diagnostic {
            severity,
            source: self.source.clone(),
            line,
            message,
            here,
            excerpt: self.excerpt(line),
        }
    }

    fn error_at(&self, line: u32, message: impl Into<String>, here: Option<String>) -> CompileError {
        let diag = self.diagnostic(Severity::Error, line, message.into(), here);
        CompileError::from_diagnostic(&diag, self.options.color, self.options.short_errors)
    }

    /// Fatal error at the current token.
    fn error(&self, message: impl Into<String>) -> CompileError {
        self.error_at(self.line(), message, None)
    }

    /// Fatal error on the last consumed token, with an annotation.
    fn error_here(&self, message: impl Into<String>, here: impl Into<String>) -> CompileError {
        self.error_at(self.lexer.lastline, message, Some(here.into()))
    }

    /// Fatal error naming the offending token.
    fn syntax_error(&self, message: impl Into<String>) -> CompileError {
        self.error(format!("{} near {}", message.into(), self.near()))
    }

    fn error_limit(&self, line_defined: u32, limit: usize, what: &str) -> CompileError {
        let place = match line_defined {
            0 => "main function".to_string(),
            line => format!("function at line {line}"),
        };
        self.error(format!("too many {what} (limit is {limit}) in {place}"))
    }

    fn error_expected(&self, tok: &Token) -> CompileError {
        let (message, here) = match tok {
            Token::In => ("expected 'in' to delimit loop iterator.", "expected 'in' symbol."),
            Token::Do => (
                "expected 'do' to establish block.",
                "you need to append this with the 'do' symbol.",
            ),
            Token::End => (
                "expected 'end' to terminate block.",
                "expected 'end' symbol after or on this line.",
            ),
            Token::Then => ("expected 'then' to delimit condition.", "expected 'then' symbol."),
            Token::Pipe => (
                "expected '|' to control parameters.",
                "expected '|' to begin and terminate the lambda's parameter list.",
            ),
            Token::Arrow => (
                "improper lambda definition",
                "expected '->' arrow syntax for lambda expression.",
            ),
            _ => {
                let message = format!("'{tok}' expected (got {})", self.near());
                return self.error_here(message, "this is invalid syntax.");
            }
        };
        self.error_here(message, here)
    }

    fn lex_error(&self, e: LexError) -> CompileError {
        self.error_at(e.line, e.message, None)
    }

    /// Report a non-fatal diagnostic.
    fn warn(&mut self, line: u32, message: impl Into<String>, here: Option<String>) {
        if !self.options.warnings {
            return;
        }
        let diag = self.diagnostic(Severity::Warning, line, message.into(), here);
        warn!(source = %diag.source, line, "{}", diag.message);
        self.warnings.push(diag);
    }

    // ---- Tokens ----

    fn current(&self) -> Result<Token, CompileError> {
        match self.lexer.current() {
            Ok(st) => Ok(st.token.clone()),
            Err(e) => Err(self.lex_error(e.clone())),
        }
    }

    fn lookahead(&mut self) -> Result<Token, CompileError> {
        let ahead = self.lexer.lookahead().map(Token::clone);
        ahead.map_err(|e| self.lex_error(e))
    }

    fn advance(&mut self) -> Result<(), CompileError> {
        let consumed = self.lexer.advance();
        consumed.map(|_| ()).map_err(|e| self.lex_error(e))
    }

    fn line(&self) -> u32 {
        self.lexer.line()
    }

    /// The current token as quoted in messages.
    fn near(&self) -> String {
        match self.lexer.current() {
            Ok(st) if st.token == Token::Eof => "<eof>".to_string(),
            _ => format!("'{}'", self.lexer.token_text()),
        }
    }

    fn check(&self, tok: &Token) -> bool {
        matches!(self.lexer.current(), Ok(st) if st.token == *tok)
    }

    fn test_next(&mut self, tok: &Token) -> Result<bool, CompileError> {
        if self.check(tok) {
            self.advance()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn check_next(&mut self, tok: &Token) -> Result<(), CompileError> {
        if self.test_next(tok)? {
            Ok(())
        } else {
            Err(self.error_expected(tok))
        }
    }

    /// Consume `what`, which closes the `who` opened on line `line`.
    fn check_match(&mut self, what: &Token, who: &Token, line: u32) -> Result<(), CompileError> {
        if self.test_next(what)? {
            return Ok(());
        }
        if line == self.line() {
            return Err(self.error_expected(what));
        }
        if *what != Token::End {
            return Err(self.error(format!("'{what}' expected (to close '{who}' at line {line})")));
        }
        let construct = match who {
            Token::If => "'if' statement",
            Token::Do => "'do' block",
            Token::For => "'for' block",
            Token::While => "'while' block",
            Token::Function => "'function' block",
            _ => return Err(self.error_here("missing 'end' to terminate block.", "missing termination.")),
        };
        Err(self.error_here(
            format!("missing 'end' to terminate {construct}."),
            "this was the last statement.",
        ))
    }

    /// A plain identifier.
    fn check_name(&mut self) -> Result<StringId, CompileError> {
        match self.current()? {
            Token::Name(id) => {
                self.advance()?;
                Ok(id)
            }
            _ => Err(self.error_here("expected an identifier.", "this needs a name.")),
        }
    }

    /// An identifier or a keyword that does not denote a value.
    fn check_field_name(&mut self) -> Result<StringId, CompileError> {
        let tok = self.current()?;
        if let Some(word) = tok.non_value_keyword() {
            self.advance()?;
            return Ok(self.lexer.strings.intern(word.as_bytes()));
        }
        self.check_name()
    }
}
