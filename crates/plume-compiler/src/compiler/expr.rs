/// Expression descriptors and the expression grammar.
use super::typehint::{mismatch, TypeInfo, ValueType};
use super::Compiler;
use crate::diagnostic::CompileError;
use crate::opcode::{Instruction, OpCode, MAX_INDEX_RK};
use crate::token::{CompoundOp, Token};
use plume_core::string::StringId;

/// Head of a chain of pending `JMP` instructions, linked through their `sJ` operands.
pub type JumpList = Option<usize>;

/// Target register and pending exits of a safely navigated suffix chain.
pub(super) type Navigation = Option<(u8, JumpList)>;

/// Value of a compile-time constant.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ConstValue {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(StringId),
}

/// Describes where an expression's value currently lives.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ExprKind {
    /// Empty expression list (or the end of one).
    Void,
    Nil,
    True,
    False,
    /// Entry in the constant pool.
    K(u32),
    KFlt(f64),
    KInt(i64),
    KStr(StringId),
    /// Value fixed in a register.
    NonReloc(u8),
    /// Register-backed local; `vidx` is relative to the function's first local.
    Local { reg: u8, vidx: usize },
    Upval(u8),
    /// Compile-time constant local; index into the shared active-variable list.
    Const(usize),
    /// `t[key]` with both in registers.
    Indexed { t: u8, key: u8 },
    /// Upvalue table indexed by a short-string constant.
    IndexUp { t: u8, key: u8 },
    /// Register table indexed by a small integer.
    IndexInt { t: u8, key: u8 },
    /// Register table indexed by a short-string constant.
    IndexStr { t: u8, key: u8 },
    /// Comparison; the value is the jump at this pc.
    Jmp(usize),
    /// Instruction at this pc whose destination register is still open.
    Reloc(usize),
    Call(usize),
    Vararg(usize),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ExprDesc {
    pub kind: ExprKind,
    /// Patch list of "exit when true".
    pub t: JumpList,
    /// Patch list of "exit when false".
    pub f: JumpList,
    pub types: TypeInfo,
}

impl ExprDesc {
    pub fn new(kind: ExprKind) -> Self {
        ExprDesc {
            kind,
            t: None,
            f: None,
            types: TypeInfo::default(),
        }
    }

    pub fn typed(kind: ExprKind, ty: ValueType) -> Self {
        ExprDesc {
            types: TypeInfo::of(ty),
            ..ExprDesc::new(kind)
        }
    }

    pub fn void() -> Self {
        ExprDesc::new(ExprKind::Void)
    }

    pub fn string(s: StringId) -> Self {
        ExprDesc::typed(ExprKind::KStr(s), ValueType::String)
    }

    pub fn from_const(value: ConstValue) -> Self {
        match value {
            ConstValue::Nil => ExprDesc::typed(ExprKind::Nil, ValueType::Nil),
            ConstValue::Bool(true) => ExprDesc::typed(ExprKind::True, ValueType::Boolean),
            ConstValue::Bool(false) => ExprDesc::typed(ExprKind::False, ValueType::Boolean),
            ConstValue::Int(i) => ExprDesc::typed(ExprKind::KInt(i), ValueType::Number),
            ConstValue::Float(n) => ExprDesc::typed(ExprKind::KFlt(n), ValueType::Number),
            ConstValue::Str(s) => ExprDesc::string(s),
        }
    }

    pub fn has_jumps(&self) -> bool {
        self.t != self.f
    }

    /// Calls and `...` may produce any number of values.
    pub fn is_multret(&self) -> bool {
        matches!(self.kind, ExprKind::Call(_) | ExprKind::Vararg(_))
    }

    /// Whether the expression can be assigned to.
    pub fn is_var(&self) -> bool {
        matches!(
            self.kind,
            ExprKind::Local { .. }
                | ExprKind::Upval(_)
                | ExprKind::Const(_)
                | ExprKind::Indexed { .. }
                | ExprKind::IndexUp { .. }
                | ExprKind::IndexInt { .. }
                | ExprKind::IndexStr { .. }
        )
    }

    pub fn is_indexed(&self) -> bool {
        matches!(
            self.kind,
            ExprKind::Indexed { .. }
                | ExprKind::IndexUp { .. }
                | ExprKind::IndexInt { .. }
                | ExprKind::IndexStr { .. }
        )
    }

    /// Register of a fixed value.
    pub fn reg(&self) -> Option<u8> {
        match self.kind {
            ExprKind::NonReloc(r) => Some(r),
            _ => None,
        }
    }
}

/// Binary operators, including the `??` nil-coalescing operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Mod,
    Pow,
    Div,
    IDiv,
    BAnd,
    BOr,
    BXor,
    Shl,
    Shr,
    Concat,
    Eq,
    Lt,
    Le,
    Ne,
    Gt,
    Ge,
    And,
    Or,
    Coalesce,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnOp {
    Minus,
    BNot,
    Not,
    Len,
}

/// Binding power of unary operators.
pub const UNARY_PRIORITY: u8 = 12;

impl BinOp {
    pub fn from_token(tok: &Token) -> Option<BinOp> {
        let op = match tok {
            Token::Plus => BinOp::Add,
            Token::Minus => BinOp::Sub,
            Token::Star => BinOp::Mul,
            Token::Percent => BinOp::Mod,
            Token::Caret => BinOp::Pow,
            Token::Slash => BinOp::Div,
            Token::FloorDiv => BinOp::IDiv,
            Token::Ampersand => BinOp::BAnd,
            Token::Pipe => BinOp::BOr,
            Token::Tilde => BinOp::BXor,
            Token::ShiftLeft => BinOp::Shl,
            Token::ShiftRight => BinOp::Shr,
            Token::DotDot => BinOp::Concat,
            Token::NotEqual => BinOp::Ne,
            Token::Equal => BinOp::Eq,
            Token::Less => BinOp::Lt,
            Token::LessEq => BinOp::Le,
            Token::Greater => BinOp::Gt,
            Token::GreaterEq => BinOp::Ge,
            Token::And => BinOp::And,
            Token::Or => BinOp::Or,
            Token::Coalesce => BinOp::Coalesce,
            _ => return None,
        };
        Some(op)
    }

    pub fn from_compound(op: CompoundOp) -> BinOp {
        match op {
            CompoundOp::Add => BinOp::Add,
            CompoundOp::Sub => BinOp::Sub,
            CompoundOp::Mul => BinOp::Mul,
            CompoundOp::Div => BinOp::Div,
            CompoundOp::IDiv => BinOp::IDiv,
            CompoundOp::Mod => BinOp::Mod,
            CompoundOp::Pow => BinOp::Pow,
            CompoundOp::Concat => BinOp::Concat,
            CompoundOp::BOr => BinOp::BOr,
            CompoundOp::BAnd => BinOp::BAnd,
            CompoundOp::Shl => BinOp::Shl,
            CompoundOp::Shr => BinOp::Shr,
            CompoundOp::Coalesce => BinOp::Coalesce,
        }
    }

    /// (left, right) binding powers; left > right means right-associative.
    pub fn priority(self) -> (u8, u8) {
        match self {
            BinOp::Add | BinOp::Sub => (10, 10),
            BinOp::Mul | BinOp::Mod => (11, 11),
            BinOp::Pow => (14, 13),
            BinOp::Div | BinOp::IDiv => (11, 11),
            BinOp::BAnd => (6, 6),
            BinOp::BOr => (4, 4),
            BinOp::BXor => (5, 5),
            BinOp::Shl | BinOp::Shr => (7, 7),
            BinOp::Concat => (9, 8),
            BinOp::Eq | BinOp::Lt | BinOp::Le | BinOp::Ne | BinOp::Gt | BinOp::Ge => (3, 3),
            BinOp::And => (2, 2),
            BinOp::Or | BinOp::Coalesce => (1, 1),
        }
    }

    /// Arithmetic and bitwise operators, the ones eligible for constant folding.
    pub fn is_arith(self) -> bool {
        matches!(
            self,
            BinOp::Add
                | BinOp::Sub
                | BinOp::Mul
                | BinOp::Mod
                | BinOp::Pow
                | BinOp::Div
                | BinOp::IDiv
                | BinOp::BAnd
                | BinOp::BOr
                | BinOp::BXor
                | BinOp::Shl
                | BinOp::Shr
        )
    }

    pub fn result_type(self, lhs: Option<ValueType>, rhs: Option<ValueType>) -> Option<ValueType> {
        use ValueType::*;
        match self {
            _ if self.is_arith() => {
                (lhs == Some(Number) && rhs == Some(Number)).then_some(Number)
            }
            BinOp::Concat => {
                let stringy = |t| matches!(t, Some(String) | Some(Number));
                (stringy(lhs) && stringy(rhs)).then_some(String)
            }
            BinOp::Eq | BinOp::Lt | BinOp::Le | BinOp::Ne | BinOp::Gt | BinOp::Ge => {
                Some(Boolean)
            }
            BinOp::Coalesce => match lhs {
                Some(Nil) => rhs,
                Some(t) => Some(t),
                None => None,
            },
            _ => (lhs == rhs).then_some(lhs).flatten(),
        }
    }
}

impl UnOp {
    pub fn from_token(tok: &Token) -> Option<UnOp> {
        match tok {
            Token::Not => Some(UnOp::Not),
            Token::Minus => Some(UnOp::Minus),
            Token::Tilde => Some(UnOp::BNot),
            Token::Hash => Some(UnOp::Len),
            _ => None,
        }
    }

    pub fn result_type(self, operand: Option<ValueType>) -> Option<ValueType> {
        match self {
            UnOp::Not => Some(ValueType::Boolean),
            UnOp::Minus | UnOp::BNot => {
                (operand == Some(ValueType::Number)).then_some(ValueType::Number)
            }
            UnOp::Len => (operand == Some(ValueType::String)).then_some(ValueType::Number),
        }
    }
}

/// Items per `SETLIST` flush.
pub(super) const LFIELDS_PER_FLUSH: usize = 50;

/// Table constructor bookkeeping.
struct ConsControl {
    /// Last list item read, not yet stored.
    v: ExprDesc,
    /// Register holding the table.
    table: u8,
    /// Number of record entries.
    nh: usize,
    /// Array items already stored.
    na: usize,
    /// Array items pending a flush.
    tostore: usize,
}

impl Compiler<'_> {
    pub(super) fn expr(&mut self) -> Result<ExprDesc, CompileError> {
        Ok(self.subexpr(0)?.0)
    }

    /// Precedence climbing: parse while binary operators bind tighter than `limit`.
    /// Returns the first operator left untreated.
    fn subexpr(&mut self, limit: u8) -> Result<(ExprDesc, Option<BinOp>), CompileError> {
        self.enter_level()?;
        let tok = self.current()?;
        let mut v = if let Some(op) = UnOp::from_token(&tok) {
            let line = self.line();
            self.advance()?;
            let (mut e, _) = self.subexpr(UNARY_PRIORITY)?;
            let ty = op.result_type(e.types.ty);
            self.prefix(op, &mut e, line)?;
            e.types = TypeInfo { ty, returns: None };
            e
        } else if tok == Token::If {
            self.ifexpr()?
        } else if tok == Token::Plus {
            // pseudo-unary '+' leaves its operand untouched
            self.advance()?;
            self.subexpr(UNARY_PRIORITY)?.0
        } else {
            self.simpleexp()?
        };

        let mut op = BinOp::from_token(&self.current()?);
        while let Some(bop) = op.filter(|o| o.priority().0 > limit) {
            let line = self.line();
            self.advance()?;
            let lhs_ty = v.types.ty;
            if bop == BinOp::Coalesce {
                let skip = self.coalesce_head(&mut v, false)?;
                let (v2, next) = self.subexpr(bop.priority().1)?;
                let rhs_ty = v2.types.ty;
                self.coalesce_tail(&mut v, v2, skip)?;
                v.types = TypeInfo {
                    ty: bop.result_type(lhs_ty, rhs_ty),
                    returns: None,
                };
                op = next;
            } else {
                self.infix(bop, &mut v)?;
                let (mut v2, next) = self.subexpr(bop.priority().1)?;
                let rhs_ty = v2.types.ty;
                self.posfix(bop, &mut v, &mut v2, line)?;
                v.types = TypeInfo {
                    ty: bop.result_type(lhs_ty, rhs_ty),
                    returns: None,
                };
                op = next;
            }
        }
        self.leave_level();
        Ok((v, op))
    }

    /// Evaluate the left operand of `??` and emit the nil test guarding the right one.
    /// With `in_place`, a local operand is tested (and later overwritten) in its own register.
    pub(super) fn coalesce_head(
        &mut self,
        v: &mut ExprDesc,
        in_place: bool,
    ) -> Result<usize, CompileError> {
        let reg = match v.kind {
            ExprKind::Local { reg, .. } if in_place && !v.has_jumps() => reg,
            _ => self.exp2nextreg(v)?,
        };
        v.kind = ExprKind::NonReloc(reg);
        let nil = self.nil_k()?;
        // falls into the right operand only when the left one is nil
        let skip = if nil <= MAX_INDEX_RK {
            self.cond_jump(OpCode::EqK, reg, nil as u8, 0, false)
        } else {
            let tmp = self.fs.free_reg as u8;
            self.reserve_regs(1)?;
            self.nil_(tmp, 1);
            let j = self.cond_jump(OpCode::Eq, reg, tmp, 0, false);
            self.free_register(tmp);
            j
        };
        Ok(skip)
    }

    pub(super) fn coalesce_tail(
        &mut self,
        v: &mut ExprDesc,
        mut rhs: ExprDesc,
        skip: usize,
    ) -> Result<(), CompileError> {
        let Some(reg) = v.reg() else {
            return Err(self.error("malformed '??' operand"));
        };
        // a call must own its result register before it can be released
        self.discharge_vars(&mut rhs);
        self.free_exp(&rhs);
        self.exp2reg(&mut rhs, reg)?;
        self.patch_to_here(Some(skip))?;
        *v = ExprDesc::new(ExprKind::NonReloc(reg));
        Ok(())
    }

    fn simpleexp(&mut self) -> Result<ExprDesc, CompileError> {
        let mut v = match self.current()? {
            Token::Float(n) => ExprDesc::typed(ExprKind::KFlt(n), ValueType::Number),
            Token::Integer(i) => ExprDesc::typed(ExprKind::KInt(i), ValueType::Number),
            Token::String(s) => ExprDesc::string(s),
            Token::Nil => ExprDesc::typed(ExprKind::Nil, ValueType::Nil),
            Token::True => ExprDesc::typed(ExprKind::True, ValueType::Boolean),
            Token::False => ExprDesc::typed(ExprKind::False, ValueType::Boolean),
            Token::DotDotDot => {
                if !self.fs.proto.is_vararg {
                    return Err(self.syntax_error("cannot use '...' outside a vararg function"));
                }
                let pc = self.code_abc(OpCode::VarArg, 0, 0, 1, false);
                ExprDesc::new(ExprKind::Vararg(pc))
            }
            Token::LBrace => return self.constructor(),
            Token::Function => {
                let line = self.line();
                self.advance()?;
                return self.body(false, line);
            }
            Token::Pipe => return self.lambda(),
            _ => return self.suffixedexp(),
        };
        self.advance()?;
        // method call on a literal: ("%d"):format(1) without the parentheses
        if self.check(&Token::Colon) {
            let line = self.line();
            self.advance()?;
            let mut key = self.field_key()?;
            let base = self.self_(&mut v, &mut key)?;
            self.funcargs(&mut v, base, line)?;
        }
        Ok(v)
    }

    fn primaryexp(&mut self) -> Result<ExprDesc, CompileError> {
        match self.current()? {
            Token::LParen => {
                let line = self.line();
                self.advance()?;
                let mut v = self.expr()?;
                self.check_match(&Token::RParen, &Token::LParen, line)?;
                self.discharge_vars(&mut v);
                Ok(v)
            }
            Token::Name(name) => {
                self.advance()?;
                self.singlevar(name)
            }
            Token::LBrace => Err(self.error_here(
                "unfinished table constructor",
                "did you mean to close with '}'?",
            )),
            Token::RBrace => Err(self.error_here(
                "unfinished table constructor",
                "did you mean to enter with '{'?",
            )),
            Token::Pipe => Err(self.error_here(
                "unexpected symbol",
                "improper or stranded lambda expression.",
            )),
            _ => Err(self.error_here(
                format!("unexpected symbol near {}", self.near()),
                "unexpected symbol.",
            )),
        }
    }

    pub(super) fn suffixedexp(&mut self) -> Result<ExprDesc, CompileError> {
        let (v, nav) = self.suffixed_chain()?;
        self.close_navigation(v, nav)
    }

    /// primary { '.' NAME | '[' exp ']' | ':' NAME args | args | '?' ('.' NAME | '[' exp ']') }
    ///
    /// When the chain used safe navigation, the second value holds the register
    /// the chain's value must land in and the exits of every '?' test; the caller
    /// settles them with `close_navigation` (or drops the value of a call statement).
    pub(super) fn suffixed_chain(&mut self) -> Result<(ExprDesc, Navigation), CompileError> {
        let line = self.line();
        let mut v = self.primaryexp()?;
        // register holding the chain's value, and the exits of every '?' test
        let mut nav: Navigation = None;
        loop {
            match self.current()? {
                Token::Question => self.safe_navigation(&mut v, &mut nav)?,
                Token::Dot => self.fieldsel(&mut v)?,
                Token::LBracket => {
                    self.exp2anyregup(&mut v)?;
                    let mut key = self.yindex()?;
                    self.indexed(&mut v, &mut key)?;
                }
                Token::Colon => {
                    self.advance()?;
                    let mut key = self.field_key()?;
                    let base = self.self_(&mut v, &mut key)?;
                    self.funcargs(&mut v, base, line)?;
                }
                Token::LParen | Token::String(_) | Token::LBrace => {
                    let base = self.exp2nextreg(&mut v)?;
                    self.funcargs(&mut v, base, line)?;
                }
                _ => break,
            }
        }
        Ok((v, nav))
    }

    /// Land the value of a safely navigated chain in its register; a skipped
    /// chain leaves the falsy value that stopped it there.
    pub(super) fn close_navigation(
        &mut self,
        mut v: ExprDesc,
        nav: Navigation,
    ) -> Result<ExprDesc, CompileError> {
        let Some((reg, exits)) = nav else {
            return Ok(v);
        };
        let r = self.exp2nextreg(&mut v)?;
        if r != reg {
            self.code_abc(OpCode::Move, reg, r, 0, false);
        }
        self.fs.free_reg = reg as usize + 1;
        self.patch_to_here(exits)?;
        Ok(ExprDesc::new(ExprKind::NonReloc(reg)))
    }

    /// `?.name` / `?[key]`: skip the rest of the chain when the value so far is falsy.
    fn safe_navigation(
        &mut self,
        v: &mut ExprDesc,
        nav: &mut Navigation,
    ) -> Result<(), CompileError> {
        self.advance()?;
        let mut reg = self.exp2nextreg(v)?;
        let mut exits = None;
        if let Some((base, pending)) = *nav {
            if reg != base {
                self.code_abc(OpCode::Move, base, reg, 0, false);
                self.fs.free_reg = base as usize + 1;
                reg = base;
                *v = ExprDesc::new(ExprKind::NonReloc(base));
            }
            exits = pending;
        }
        self.code_abc(OpCode::Test, reg, 0, 0, false);
        let j = self.jump();
        self.concat(&mut exits, Some(j))?;
        *nav = Some((reg, exits));

        let mut key = match self.current()? {
            Token::LBracket => self.yindex()?,
            Token::Dot => {
                self.advance()?;
                self.field_key()?
            }
            _ => return Err(self.syntax_error("unexpected symbol")),
        };
        self.indexed(v, &mut key)
    }

    /// fieldsel -> ['.' | ':'] NAME
    pub(super) fn fieldsel(&mut self, v: &mut ExprDesc) -> Result<(), CompileError> {
        self.exp2anyregup(v)?;
        self.advance()?;
        let mut key = self.field_key()?;
        self.indexed(v, &mut key)
    }

    /// A field name as a string-constant key; non-value keywords are allowed.
    fn field_key(&mut self) -> Result<ExprDesc, CompileError> {
        let name = self.check_field_name()?;
        Ok(ExprDesc::string(name))
    }

    /// index -> '[' expr ']'
    fn yindex(&mut self) -> Result<ExprDesc, CompileError> {
        self.advance()?;
        let mut key = self.expr()?;
        self.exp2val(&mut key)?;
        self.check_next(&Token::RBracket)?;
        Ok(key)
    }

    /// Parse call arguments and emit the `CALL` for the function in `base`.
    fn funcargs(&mut self, f: &mut ExprDesc, base: u8, line: u32) -> Result<(), CompileError> {
        let mut args = match self.current()? {
            Token::LParen => {
                self.advance()?;
                let args = if self.check(&Token::RParen) {
                    ExprDesc::void()
                } else {
                    let (mut args, _) = self.explist()?;
                    if args.is_multret() {
                        self.set_multret(&mut args)?;
                    }
                    args
                };
                self.check_match(&Token::RParen, &Token::LParen, line)?;
                args
            }
            Token::LBrace => self.constructor()?,
            Token::String(s) => {
                self.advance()?;
                ExprDesc::string(s)
            }
            _ => return Err(self.syntax_error("function arguments expected")),
        };
        let nparams = if args.is_multret() {
            -1
        } else {
            if args.kind != ExprKind::Void {
                self.exp2nextreg(&mut args)?;
            }
            self.fs.free_reg as i32 - (base as i32 + 1)
        };
        let returns = f.types.returns;
        let pc = self.code_abc(OpCode::Call, base, (nparams + 1) as u8, 2, false);
        *f = ExprDesc::new(ExprKind::Call(pc));
        f.types.ty = returns;
        self.fix_line(line);
        // the call leaves one result in 'base' unless changed later
        self.fs.free_reg = base as usize + 1;
        Ok(())
    }

    /// explist -> expr { ',' expr }
    ///
    /// Every expression but the last is fixed in consecutive registers; the last is
    /// returned open. The static type of each expression is reported in order.
    pub(super) fn explist(&mut self) -> Result<(ExprDesc, Vec<TypeInfo>), CompileError> {
        let mut v = self.expr()?;
        let mut types = vec![v.types];
        while self.test_next(&Token::Comma)? {
            self.exp2nextreg(&mut v)?;
            v = self.expr()?;
            types.push(v.types);
        }
        Ok((v, types))
    }

    /// cond -> expr; returns the jumps taken when the condition is false.
    pub(super) fn cond(&mut self) -> Result<JumpList, CompileError> {
        let mut v = self.expr()?;
        if v.kind == ExprKind::Nil {
            v.kind = ExprKind::False;
        }
        self.go_if_true(&mut v)?;
        Ok(v.f)
    }

    /// `if c then a {elseif c then b} else d` as an expression. Only the taken
    /// branch is evaluated; every branch lands in the same register.
    fn ifexpr(&mut self) -> Result<ExprDesc, CompileError> {
        self.advance()?;
        let mut escape = None;
        let mut target: Option<u8> = None;
        let mut ty = None;
        let mut first = true;
        loop {
            let jf = self.cond()?;
            self.check_next(&Token::Then)?;
            let e = self.expr()?;
            let branch_ty = e.types.ty;
            self.land_in(e, &mut target)?;
            ty = if first || ty == branch_ty { branch_ty } else { None };
            first = false;
            let j = self.jump();
            self.concat(&mut escape, Some(j))?;
            self.patch_to_here(jf)?;
            if !self.test_next(&Token::ElseIf)? {
                break;
            }
        }
        self.check_next(&Token::Else)?;
        let e = self.expr()?;
        if ty != e.types.ty {
            ty = None;
        }
        let reg = self.land_in(e, &mut target)?;
        self.patch_to_here(escape)?;
        let mut v = ExprDesc::new(ExprKind::NonReloc(reg));
        v.types.ty = ty;
        Ok(v)
    }

    /// Put a branch result in the shared target register, allocating it on first use.
    fn land_in(&mut self, mut e: ExprDesc, target: &mut Option<u8>) -> Result<u8, CompileError> {
        match *target {
            Some(reg) => {
                self.discharge_vars(&mut e);
                self.free_exp(&e);
                self.exp2reg(&mut e, reg)?;
                Ok(reg)
            }
            None => {
                let reg = self.exp2nextreg(&mut e)?;
                *target = Some(reg);
                Ok(reg)
            }
        }
    }

    // ---- Table constructors ----

    /// constructor -> '{' [ field { sep field } [sep] ] '}'
    pub(super) fn constructor(&mut self) -> Result<ExprDesc, CompileError> {
        let line = self.line();
        let pc = self.code_abc(OpCode::NewTable, 0, 0, 0, false);
        // room for the EXTRAARG written by set_table_size
        self.code(Instruction::ax(OpCode::ExtraArg, 0));
        let table = self.fs.free_reg as u8;
        let t = ExprDesc::typed(ExprKind::NonReloc(table), ValueType::Table);
        self.reserve_regs(1)?;
        let mut cc = ConsControl {
            v: ExprDesc::void(),
            table,
            nh: 0,
            na: 0,
            tostore: 0,
        };
        self.check_next(&Token::LBrace)?;
        loop {
            if self.check(&Token::RBrace) {
                break;
            }
            self.close_list_field(&mut cc)?;
            self.field(&mut cc, &t)?;
            if !(self.test_next(&Token::Comma)? || self.test_next(&Token::Semi)?) {
                break;
            }
        }
        self.check_match(&Token::RBrace, &Token::LBrace, line)?;
        self.last_list_field(&mut cc)?;
        self.set_table_size(pc, table, cc.na, cc.nh);
        Ok(t)
    }

    fn close_list_field(&mut self, cc: &mut ConsControl) -> Result<(), CompileError> {
        if cc.v.kind == ExprKind::Void {
            return Ok(());
        }
        self.exp2nextreg(&mut cc.v)?;
        cc.v = ExprDesc::void();
        if cc.tostore == LFIELDS_PER_FLUSH {
            self.set_list(cc.table, cc.na, cc.tostore as i32);
            cc.na += cc.tostore;
            cc.tostore = 0;
        }
        Ok(())
    }

    fn last_list_field(&mut self, cc: &mut ConsControl) -> Result<(), CompileError> {
        if cc.tostore == 0 {
            return Ok(());
        }
        if cc.v.is_multret() {
            self.set_multret(&mut cc.v)?;
            self.set_list(cc.table, cc.na, -1);
            // the open item is not counted as an array element
            cc.na -= 1;
        } else {
            if cc.v.kind != ExprKind::Void {
                self.exp2nextreg(&mut cc.v)?;
            }
            self.set_list(cc.table, cc.na, cc.tostore as i32);
        }
        cc.na += cc.tostore;
        Ok(())
    }

    /// field -> listfield | recfield | funcfield
    fn field(&mut self, cc: &mut ConsControl, t: &ExprDesc) -> Result<(), CompileError> {
        match self.current()? {
            Token::Name(_) => {
                if self.lookahead()? == Token::Assign {
                    self.recfield(cc, t)
                } else {
                    self.listfield(cc)
                }
            }
            Token::LBracket => self.recfield(cc, t),
            Token::Function => {
                if self.lookahead()? == Token::LParen {
                    self.listfield(cc)
                } else {
                    self.funcfield(cc, t)
                }
            }
            tok if tok.non_value_keyword().is_some() && self.lookahead()? == Token::Assign => {
                self.recfield(cc, t)
            }
            _ => self.listfield(cc),
        }
    }

    fn listfield(&mut self, cc: &mut ConsControl) -> Result<(), CompileError> {
        cc.v = self.expr()?;
        cc.tostore += 1;
        Ok(())
    }

    /// recfield -> (NAME | '[' exp ']') '=' exp
    fn recfield(&mut self, cc: &mut ConsControl, t: &ExprDesc) -> Result<(), CompileError> {
        let reg = self.fs.free_reg;
        let mut key = if self.check(&Token::LBracket) {
            self.yindex()?
        } else {
            self.field_key()?
        };
        cc.nh += 1;
        self.check_next(&Token::Assign)?;
        let mut tab = *t;
        self.indexed(&mut tab, &mut key)?;
        let mut val = self.expr()?;
        self.store_var(&tab, &mut val)?;
        self.fs.free_reg = reg;
        Ok(())
    }

    /// funcfield -> FUNCTION NAME body, a method with an implicit `self`.
    fn funcfield(&mut self, cc: &mut ConsControl, t: &ExprDesc) -> Result<(), CompileError> {
        let reg = self.fs.free_reg;
        cc.nh += 1;
        self.advance()?;
        let mut key = self.field_key()?;
        let mut tab = *t;
        self.indexed(&mut tab, &mut key)?;
        let line = self.line();
        let mut val = self.body(true, line)?;
        self.store_var(&tab, &mut val)?;
        self.fs.free_reg = reg;
        Ok(())
    }

    // ---- Function bodies ----

    /// body -> '(' parlist ')' [':' hint] block END
    pub(super) fn body(&mut self, is_method: bool, line: u32) -> Result<ExprDesc, CompileError> {
        self.open_func(line);
        self.check_next(&Token::LParen)?;
        if is_method {
            let name = self.names.self_;
            self.new_localvar(name)?;
            self.adjust_localvars(1);
        }
        self.parlist()?;
        self.check_next(&Token::RParen)?;
        let hint = self.type_hint()?;
        let returns = self.statlist()?.flatten();
        if let Some((hinted, actual)) = mismatch(hint, returns) {
            self.warn(
                line,
                format!("function was hinted to return {hinted} but actually returns {actual}"),
                None,
            );
        }
        self.fs.proto.last_line_defined = self.line();
        self.check_match(&Token::End, &Token::Function, line)?;
        let proto = self.close_func()?;
        let mut e = self.code_closure(proto)?;
        e.types = TypeInfo {
            ty: Some(ValueType::Function),
            returns,
        };
        Ok(e)
    }

    /// `|params| -> expr`, shorthand for `function(params) return expr end`.
    fn lambda(&mut self) -> Result<ExprDesc, CompileError> {
        let line = self.line();
        self.open_func(line);
        self.check_next(&Token::Pipe)?;
        self.parlist()?;
        self.check_next(&Token::Pipe)?;
        self.check_next(&Token::Arrow)?;
        let mut e = self.expr()?;
        let returns = e.types.ty;
        let reg = self.exp2anyreg(&mut e)?;
        self.ret(reg, 1);
        self.fs.proto.last_line_defined = self.line();
        let proto = self.close_func()?;
        let mut e = self.code_closure(proto)?;
        e.types = TypeInfo {
            ty: Some(ValueType::Function),
            returns,
        };
        Ok(e)
    }

    /// parlist -> [ {NAME [hint] ','} (NAME [hint] | '...') ]
    fn parlist(&mut self) -> Result<(), CompileError> {
        let mut nparams = 0;
        let mut vararg = false;
        if !self.check(&Token::RParen) && !self.check(&Token::Pipe) {
            loop {
                match self.current()? {
                    Token::Name(name) => {
                        self.advance()?;
                        let vidx = self.new_localvar(name)?;
                        let hint = self.type_hint()?;
                        self.local_var(vidx).hint = hint;
                        nparams += 1;
                    }
                    Token::DotDotDot => {
                        self.advance()?;
                        vararg = true;
                    }
                    _ => return Err(self.syntax_error("<name> or '...' expected")),
                }
                if vararg || !self.test_next(&Token::Comma)? {
                    break;
                }
            }
        }
        self.adjust_localvars(nparams);
        let nactvar = self.fs.nactvar;
        self.fs.proto.num_params = nactvar as u8;
        if vararg {
            self.set_vararg(nactvar as u8);
        }
        self.reserve_regs(nactvar)
    }
}
