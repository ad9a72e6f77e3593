/// Statement grammar: control flow, declarations and assignments.
use super::expr::{BinOp, ExprDesc, ExprKind, JumpList};
use super::scope::BlockKind;
use super::typehint::{TypeInfo, ValueType};
use super::Compiler;
use crate::diagnostic::CompileError;
use crate::opcode::{OpCode, MAX_BX};
use crate::proto::VarKind;
use crate::token::{CompoundOp, Token};
use plume_core::string::StringId;

/// Return paths seen in a statement or block: `None` when there are none,
/// otherwise the statically known type of the first returned value, if the
/// paths agree on one.
pub(super) type ReturnInfo = Option<Option<ValueType>>;

fn merge_returns(a: ReturnInfo, b: ReturnInfo) -> ReturnInfo {
    match (a, b) {
        (None, r) | (r, None) => r,
        (Some(x), Some(y)) => Some(if x == y { x } else { None }),
    }
}

/// Descriptor of a literal token.
fn literal(tok: &Token) -> Option<ExprDesc> {
    let e = match *tok {
        Token::Integer(i) => ExprDesc::typed(ExprKind::KInt(i), ValueType::Number),
        Token::Float(n) => ExprDesc::typed(ExprKind::KFlt(n), ValueType::Number),
        Token::String(s) => ExprDesc::string(s),
        Token::Nil => ExprDesc::typed(ExprKind::Nil, ValueType::Nil),
        Token::True => ExprDesc::typed(ExprKind::True, ValueType::Boolean),
        Token::False => ExprDesc::typed(ExprKind::False, ValueType::Boolean),
        _ => return None,
    };
    Some(e)
}

impl Compiler<'_> {
    /// statlist -> { stat [';'] }
    pub(super) fn statlist(&mut self) -> Result<ReturnInfo, CompileError> {
        let mut info = None;
        while !self.current()?.is_block_follow(true) {
            if self.check(&Token::Return) {
                // 'return' must be the last statement
                let ret = self.statement()?;
                return Ok(merge_returns(info, ret));
            }
            let stat = self.statement()?;
            info = merge_returns(info, stat);
        }
        Ok(info)
    }

    /// block -> statlist, in a scope of its own.
    fn block(&mut self) -> Result<ReturnInfo, CompileError> {
        self.enter_block(BlockKind::Plain);
        let info = self.statlist()?;
        self.leave_block()?;
        Ok(info)
    }

    fn statement(&mut self) -> Result<ReturnInfo, CompileError> {
        let line = self.line();
        self.enter_level()?;
        // declarations and jumps leave no temporaries behind, unlike calls,
        // returns and stores through indexed targets
        let settles = matches!(
            self.current()?,
            Token::Local | Token::Semi | Token::DoubleColon | Token::Goto | Token::Break | Token::Continue
        );
        let info = match self.current()? {
            Token::Semi => {
                self.advance()?;
                None
            }
            Token::If => self.if_stat(line)?,
            Token::While => self.while_stat(line)?,
            Token::Do => {
                self.advance()?;
                let info = self.block()?;
                self.check_match(&Token::End, &Token::Do, line)?;
                info
            }
            Token::For => self.for_stat(line)?,
            Token::Repeat => self.repeat_stat(line)?,
            Token::Function => {
                self.func_stat(line)?;
                None
            }
            Token::Local => {
                self.advance()?;
                if self.test_next(&Token::Function)? {
                    self.local_func()?;
                } else {
                    self.local_stat()?;
                }
                None
            }
            Token::DoubleColon => {
                self.advance()?;
                let name = self.check_name()?;
                self.label_stat(name, line)?;
                None
            }
            Token::Return => {
                self.advance()?;
                Some(self.ret_stat()?)
            }
            Token::Break => {
                self.break_stat()?;
                None
            }
            Token::Continue => {
                self.continue_stat()?;
                None
            }
            Token::Goto => {
                self.advance()?;
                self.goto_stat()?;
                None
            }
            Token::Case => {
                return Err(self.error_here(
                    "inappropriate 'case' statement.",
                    "outside of 'switch' block.",
                ))
            }
            Token::Default => {
                return Err(self.error_here(
                    "inappropriate 'default' statement.",
                    "outside of 'switch' block.",
                ))
            }
            Token::Switch => self.switch_stat(line)?,
            _ => {
                self.expr_stat()?;
                None
            }
        };
        debug_assert!(
            self.fs.proto.max_stack_size as usize >= self.fs.free_reg
                && self.fs.free_reg >= self.nvarstack(),
            "register stack out of sync at end of statement"
        );
        debug_assert!(
            !settles || self.fs.free_reg == self.nvarstack(),
            "statement at line {line} left {} temporaries",
            self.fs.free_reg - self.nvarstack()
        );
        self.fs.free_reg = self.nvarstack();
        self.leave_level();
        Ok(info)
    }

    // ---- Conditionals ----

    /// ifstat -> IF cond THEN block {ELSEIF cond THEN block} [ELSE block] END
    fn if_stat(&mut self, line: u32) -> Result<ReturnInfo, CompileError> {
        let mut escapes = None;
        let mut info = self.test_then_block(&mut escapes)?;
        while self.check(&Token::ElseIf) {
            let branch = self.test_then_block(&mut escapes)?;
            info = merge_returns(info, branch);
        }
        if self.test_next(&Token::Else)? {
            let branch = self.block()?;
            info = merge_returns(info, branch);
        }
        self.check_match(&Token::End, &Token::If, line)?;
        self.patch_to_here(escapes)?;
        Ok(info)
    }

    /// [IF | ELSEIF] cond THEN block
    fn test_then_block(&mut self, escapes: &mut JumpList) -> Result<ReturnInfo, CompileError> {
        self.advance()?;
        let mut v = self.expr()?;
        self.check_next(&Token::Then)?;
        let skip;
        if self.check(&Token::Break) {
            // 'if x then break': the condition jumps straight out of the loop
            let line = self.line();
            self.go_if_false(&mut v)?;
            self.advance()?;
            self.enter_block(BlockKind::Plain);
            let name = self.names.break_;
            self.new_goto_entry(name, line, v.t);
            while self.test_next(&Token::Semi)? {}
            if self.current()?.is_block_follow(false) {
                self.leave_block()?;
                return Ok(None);
            }
            skip = Some(self.jump());
        } else {
            self.go_if_true(&mut v)?;
            self.enter_block(BlockKind::Plain);
            skip = v.f;
        }
        let info = self.statlist()?;
        self.leave_block()?;
        if self.check(&Token::Else) || self.check(&Token::ElseIf) {
            let j = self.jump();
            self.concat(escapes, Some(j))?;
        }
        self.patch_to_here(skip)?;
        Ok(info)
    }

    // ---- Loops ----

    /// Take the pending `continue` jumps of the innermost block.
    fn take_scope_end(&mut self, depth: usize) -> JumpList {
        let n = self.fs.blocks.len();
        n.checked_sub(depth + 1)
            .and_then(|i| self.fs.blocks[i].scope_end.take())
    }

    /// whilestat -> WHILE cond DO block END
    fn while_stat(&mut self, line: u32) -> Result<ReturnInfo, CompileError> {
        self.advance()?;
        let init = self.get_label();
        let exit = self.cond()?;
        self.enter_block(BlockKind::Loop);
        self.check_next(&Token::Do)?;
        let info = self.block()?;
        let back = self.jump();
        self.patch_list(Some(back), init)?;
        let cont = self.take_scope_end(0);
        self.patch_list(cont, init)?;
        self.check_match(&Token::End, &Token::While, line)?;
        self.leave_block()?;
        self.patch_to_here(exit)?;
        Ok(info)
    }

    /// repeatstat -> REPEAT block (UNTIL | WHEN) cond
    ///
    /// The condition sees the body's locals. `until` leaves the loop when it
    /// holds, `when` while it holds.
    fn repeat_stat(&mut self, line: u32) -> Result<ReturnInfo, CompileError> {
        let init = self.get_label();
        self.enter_block(BlockKind::Loop);
        self.enter_block(BlockKind::Plain);
        self.advance()?;
        let info = self.statlist()?;
        let cont = self.take_scope_end(1);
        self.patch_to_here(cont)?;
        let mut exit = if self.test_next(&Token::When)? {
            let mut v = self.expr()?;
            if v.kind == ExprKind::Nil {
                v.kind = ExprKind::False;
            }
            self.go_if_false(&mut v)?;
            v.t
        } else {
            self.check_match(&Token::Until, &Token::Repeat, line)?;
            self.cond()?
        };
        let scope = self.leave_block()?;
        if scope.upval {
            // repeating must close the body's upvalues first
            let normal = self.jump();
            self.patch_to_here(exit)?;
            let level = self.reg_level(scope.nactvar) as u8;
            self.code_abc(OpCode::Close, level, 0, 0, false);
            exit = Some(self.jump());
            self.patch_to_here(Some(normal))?;
        }
        self.patch_list(exit, init)?;
        self.leave_block()?;
        Ok(info)
    }

    /// Evaluate an expression into the next register.
    fn exp1(&mut self) -> Result<(), CompileError> {
        let mut e = self.expr()?;
        self.exp2nextreg(&mut e)?;
        Ok(())
    }

    /// Point the `Bx` offset of the loop instruction at `pc` to `dest`.
    fn fix_for_jump(&mut self, pc: usize, dest: usize, back: bool) -> Result<(), CompileError> {
        let offset = if back {
            pc + 1 - dest
        } else {
            dest - (pc + 1)
        };
        if offset > MAX_BX as usize {
            return Err(self.syntax_error("control structure too long"));
        }
        self.fs.proto.code[pc].set_bx(offset as u32);
        Ok(())
    }

    /// forstat -> FOR (fornum | forlist) END
    fn for_stat(&mut self, line: u32) -> Result<ReturnInfo, CompileError> {
        self.enter_block(BlockKind::Loop);
        self.advance()?;
        let var = self.check_name()?;
        let info = match self.current()? {
            Token::Assign => self.for_num(var, line)?,
            Token::Comma | Token::In => self.for_list(var)?,
            _ => return Err(self.syntax_error("'=' or 'in' expected")),
        };
        self.check_match(&Token::End, &Token::For, line)?;
        // 'break' lands here
        self.leave_block()?;
        Ok(info)
    }

    /// fornum -> NAME = exp, exp [, exp] forbody
    fn for_num(&mut self, var: StringId, line: u32) -> Result<ReturnInfo, CompileError> {
        let base = self.fs.free_reg as u8;
        let hidden = self.names.for_state;
        for _ in 0..3 {
            self.new_localvar(hidden)?;
        }
        self.new_localvar(var)?;
        self.check_next(&Token::Assign)?;
        self.exp1()?;
        self.check_next(&Token::Comma)?;
        self.exp1()?;
        if self.test_next(&Token::Comma)? {
            self.exp1()?;
        } else {
            let reg = self.fs.free_reg as u8;
            self.code_asbx(OpCode::LoadI, reg, 1);
            self.reserve_regs(1)?;
        }
        self.adjust_localvars(3);
        self.for_body(base, line, 1, false)
    }

    /// forlist -> NAME {, NAME} IN explist forbody
    fn for_list(&mut self, first: StringId) -> Result<ReturnInfo, CompileError> {
        let base = self.fs.free_reg as u8;
        let hidden = self.names.for_state;
        // iterator, state, control and closing value
        for _ in 0..4 {
            self.new_localvar(hidden)?;
        }
        self.new_localvar(first)?;
        let mut nvars = 1;
        while self.test_next(&Token::Comma)? {
            let name = self.check_name()?;
            self.new_localvar(name)?;
            nvars += 1;
        }
        self.check_next(&Token::In)?;
        let line = self.line();
        let (mut e, types) = self.explist()?;
        self.adjust_assign(4, types.len(), &mut e)?;
        self.adjust_localvars(4);
        self.mark_to_be_closed();
        // room to call the iterator
        self.check_stack(3)?;
        self.for_body(base, line, nvars, true)
    }

    /// forbody -> DO block
    fn for_body(
        &mut self,
        base: u8,
        line: u32,
        nvars: usize,
        generic: bool,
    ) -> Result<ReturnInfo, CompileError> {
        let (prep_op, loop_op) = if generic {
            (OpCode::TForPrep, OpCode::TForLoop)
        } else {
            (OpCode::ForPrep, OpCode::ForLoop)
        };
        self.check_next(&Token::Do)?;
        let prep = self.code_abx(prep_op, base, 0);
        self.enter_block(BlockKind::Plain);
        self.adjust_localvars(nvars);
        self.reserve_regs(nvars)?;
        let info = self.block()?;
        self.leave_block()?;
        let step = self.get_label();
        self.fix_for_jump(prep, step, false)?;
        let cont = self.take_scope_end(0);
        self.patch_to_here(cont)?;
        if generic {
            self.code_abc(OpCode::TForCall, base, 0, nvars as u8, false);
            self.fix_line(line);
        }
        let end = self.code_abx(loop_op, base, 0);
        self.fix_for_jump(end, prep + 1, true)?;
        self.fix_line(line);
        Ok(info)
    }

    // ---- Jumps ----

    fn break_stat(&mut self) -> Result<(), CompileError> {
        let line = self.line();
        self.advance()?;
        let j = self.jump();
        let name = self.names.break_;
        self.new_goto_entry(name, line, Some(j));
        Ok(())
    }

    /// continue [N]: jump to the step of the Nth enclosing loop.
    fn continue_stat(&mut self) -> Result<(), CompileError> {
        self.advance()?;
        let mut depth = 1;
        if let Token::Integer(n) = self.current()? {
            depth = n;
            self.advance()?;
        }
        let mut upval = false;
        let mut target = None;
        for (i, bl) in self.fs.blocks.iter().enumerate().rev() {
            if bl.kind == BlockKind::Loop {
                depth -= 1;
                if depth == 0 {
                    target = Some(i);
                    break;
                }
            }
            upval |= bl.upval;
        }
        let Some(i) = target else {
            return Err(self.error_here("continue outside of loop", "this is not within a loop."));
        };
        if upval {
            // close what the loop body declared, not the loop's own control variables
            let nactvar = self.fs.blocks.get(i + 1).map_or(self.fs.blocks[i].nactvar, |bl| bl.nactvar);
            let level = self.reg_level(nactvar) as u8;
            self.code_abc(OpCode::Close, level, 0, 0, false);
        }
        let j = self.jump();
        let mut list = self.fs.blocks[i].scope_end;
        self.concat(&mut list, Some(j))?;
        self.fs.blocks[i].scope_end = list;
        Ok(())
    }

    fn goto_stat(&mut self) -> Result<(), CompileError> {
        let line = self.line();
        let name = self.check_name()?;
        match self.find_label(name) {
            None => {
                // forward jump, resolved when the label shows up
                let j = self.jump();
                self.new_goto_entry(name, line, Some(j));
            }
            Some(label) => {
                let level = self.reg_level(label.nactvar);
                if self.nvarstack() > level {
                    self.code_abc(OpCode::Close, level as u8, 0, 0, false);
                }
                let j = self.jump();
                self.patch_list(Some(j), label.pc)?;
            }
        }
        Ok(())
    }

    /// label -> '::' NAME '::'
    fn label_stat(&mut self, name: StringId, line: u32) -> Result<(), CompileError> {
        self.check_next(&Token::DoubleColon)?;
        while self.check(&Token::Semi) || self.check(&Token::DoubleColon) {
            self.statement()?;
        }
        self.check_repeated(name)?;
        let last = self.current()?.is_block_follow(false);
        self.create_label(name, line, last)?;
        Ok(())
    }

    /// retstat -> RETURN [explist] [';']
    fn ret_stat(&mut self) -> Result<Option<ValueType>, CompileError> {
        let mut first = self.nvarstack() as u8;
        let tok = self.current()?;
        let (nret, ty) = if tok.is_block_follow(true) || tok == Token::Semi {
            (0, None)
        } else {
            let (mut e, types) = self.explist()?;
            let ty = types[0].ty;
            if e.is_multret() {
                self.set_multret(&mut e)?;
                let inside_tbc = self.fs.blocks.last().is_some_and(|bl| bl.inside_tbc);
                if let (ExprKind::Call(pc), 1, false) = (e.kind, types.len(), inside_tbc) {
                    self.fs.proto.code[pc].set_opcode(OpCode::TailCall);
                }
                (-1, ty)
            } else if types.len() == 1 {
                first = self.exp2anyreg(&mut e)?;
                (1, ty)
            } else {
                self.exp2nextreg(&mut e)?;
                (types.len() as i32, ty)
            }
        };
        self.ret(first, nret);
        self.test_next(&Token::Semi)?;
        Ok(ty)
    }

    // ---- Switch ----

    /// switchstat -> SWITCH ['('] expr [')'] DO {CASE value ':' caselist} [DEFAULT ':' caselist] END
    ///
    /// Each case tests the saved value with a single not-equal jump over its
    /// body; a body that runs into the next case jumps past that case's test.
    fn switch_stat(&mut self, line: u32) -> Result<ReturnInfo, CompileError> {
        self.advance()?;
        self.enter_block(BlockKind::Switch);
        let paren_line = self.line();
        let parens = self.test_next(&Token::LParen)?;
        let mut ctrl = self.expr()?;
        let reg = self.exp2nextreg(&mut ctrl)?;
        if parens {
            self.check_match(&Token::RParen, &Token::LParen, paren_line)?;
        }
        self.check_next(&Token::Do)?;
        let name = self.names.switch;
        let vidx = self.new_localvar(name)?;
        self.adjust_localvars(1);
        let saved = ExprDesc::new(ExprKind::Local { reg, vidx });

        let mut info = None;
        let mut fallthrough: JumpList = None;
        while !self.check(&Token::End) && !self.check(&Token::Default) {
            if !self.test_next(&Token::Case)? {
                return Err(self.error_expected(&Token::Case));
            }
            let mut value = self.case_value()?;
            self.check_next(&Token::Colon)?;
            let mut test = saved;
            self.infix(BinOp::Ne, &mut test)?;
            self.posfix(BinOp::Ne, &mut test, &mut value, line)?;
            let ExprKind::Jmp(skip) = test.kind else {
                return Err(self.malformed_case());
            };
            self.patch_to_here(fallthrough.take())?;
            self.enter_block(BlockKind::Plain);
            let body = self.case_list(false)?;
            info = merge_returns(info, body);
            self.leave_block()?;
            if self.check(&Token::Case) {
                fallthrough = Some(self.jump());
            }
            self.patch_to_here(Some(skip))?;
        }
        if self.test_next(&Token::Default)? {
            self.check_next(&Token::Colon)?;
            self.enter_block(BlockKind::Plain);
            let body = self.case_list(true)?;
            info = merge_returns(info, body);
            self.leave_block()?;
        }
        self.check_match(&Token::End, &Token::Switch, line)?;
        self.leave_block()?;
        Ok(info)
    }

    fn malformed_case(&self) -> CompileError {
        self.error_here(
            "malformed 'case' expression.",
            "expression must be compile-time constant.",
        )
    }

    /// A case label: a literal, a signed numeral or a compile-time constant.
    fn case_value(&mut self) -> Result<ExprDesc, CompileError> {
        if self.test_next(&Token::Minus)? {
            let kind = match self.current()? {
                Token::Integer(i) => ExprKind::KInt(i.wrapping_neg()),
                Token::Float(n) => ExprKind::KFlt(-n),
                _ => {
                    return Err(self.error_here(
                        "unexpected symbol in 'case' expression.",
                        "unary '-' on non-numeral type.",
                    ))
                }
            };
            self.advance()?;
            return Ok(ExprDesc::typed(kind, ValueType::Number));
        }
        self.test_next(&Token::Plus)?;
        let tok = self.current()?;
        let e = match literal(&tok) {
            Some(e) => {
                self.advance()?;
                e
            }
            None if matches!(tok, Token::Name(_)) => self.suffixedexp()?,
            None => return Err(self.malformed_case()),
        };
        match self.exp2const(&e) {
            Some(value) => Ok(ExprDesc::from_const(value)),
            None => Err(self.malformed_case()),
        }
    }

    /// Statements of one case body.
    fn case_list(&mut self, is_default: bool) -> Result<ReturnInfo, CompileError> {
        let mut info = None;
        loop {
            let tok = self.current()?;
            if matches!(tok, Token::Case | Token::Default | Token::End | Token::Eof) {
                return Ok(info);
            }
            // a trailing 'break' in the default case has nothing left to skip
            if is_default && tok == Token::Break && self.lookahead()? == Token::End {
                self.advance()?;
                continue;
            }
            if tok == Token::Continue {
                return Err(self.error_here(
                    "'continue' outside of loop.",
                    "'case' statements are not loops.",
                ));
            }
            let stat = self.statement()?;
            info = merge_returns(info, stat);
        }
    }

    // ---- Declarations ----

    /// ATTRIB -> ['<' NAME '>']
    fn local_attribute(&mut self) -> Result<VarKind, CompileError> {
        if !self.test_next(&Token::Less)? {
            return Ok(VarKind::Regular);
        }
        let id = self.check_name()?;
        let attr = self.lexer.strings.get_str(id).into_owned();
        self.check_next(&Token::Greater)?;
        match attr.as_str() {
            "const" => Ok(VarKind::Const),
            "close" => Ok(VarKind::ToClose),
            _ => Err(self.error(format!("unknown attribute '{attr}'"))),
        }
    }

    /// Mark the variable at `level` as to-be-closed and emit its `TBC`.
    fn check_to_close(&mut self, level: Option<usize>) {
        if let Some(level) = level {
            self.mark_to_be_closed();
            let reg = self.reg_level(level) as u8;
            self.code_abc(OpCode::Tbc, reg, 0, 0, false);
        }
    }

    /// stat -> LOCAL NAME [hint] ATTRIB {',' NAME [hint] ATTRIB} ['=' explist]
    fn local_stat(&mut self) -> Result<(), CompileError> {
        let mut toclose = None;
        let mut nvars = 0;
        let mut vidx;
        loop {
            let name = self.check_name()?;
            vidx = self.new_localvar(name)?;
            let hint = self.type_hint()?;
            let kind = self.local_attribute()?;
            let var = self.local_var(vidx);
            var.hint = hint;
            var.kind = kind;
            if kind == VarKind::ToClose {
                if toclose.is_some() {
                    return Err(self.error("multiple to-be-closed variables in local list"));
                }
                toclose = Some(self.fs.nactvar + nvars);
            }
            nvars += 1;
            if !self.test_next(&Token::Comma)? {
                break;
            }
        }
        let (mut e, types) = if self.test_next(&Token::Assign)? {
            self.explist()?
        } else {
            (ExprDesc::void(), Vec::new())
        };
        let nexps = types.len();
        let last_kind = self.local_var(vidx).kind;
        let folded = match last_kind {
            VarKind::Const if nvars == nexps => self.exp2const(&e),
            _ => None,
        };
        if let Some(value) = folded {
            // the last variable becomes a compile-time constant with no register
            let var = self.local_var(vidx);
            var.kind = VarKind::CompileTimeConst;
            var.value = Some(value);
            var.known = e.types;
            self.adjust_localvars(nvars - 1);
            self.fs.nactvar += 1;
        } else {
            let first = vidx + 1 - nvars;
            for (i, produced) in types.iter().take(nvars).enumerate() {
                self.process_assign(first + i, *produced);
            }
            self.adjust_assign(nvars, nexps, &mut e)?;
            self.adjust_localvars(nvars);
        }
        self.check_to_close(toclose);
        Ok(())
    }

    /// stat -> LOCAL FUNCTION NAME body
    fn local_func(&mut self) -> Result<(), CompileError> {
        let name = self.check_name()?;
        let fvar = self.new_localvar(name)?;
        self.adjust_localvars(1);
        let line = self.line();
        let b = self.body(false, line)?;
        self.local_var(fvar).known = b.types;
        // debug info only sees the variable once the closure exists
        let pc = self.fs.proto.code.len() as u32;
        let pidx = self.local_var(fvar).pidx;
        if let Some(pidx) = pidx {
            self.fs.proto.local_vars[pidx].start_pc = pc;
        }
        Ok(())
    }

    /// funcname -> NAME {'.' NAME} [':' NAME]
    fn func_name(&mut self) -> Result<(ExprDesc, bool), CompileError> {
        let name = self.check_name()?;
        let mut v = self.singlevar(name)?;
        while self.check(&Token::Dot) {
            self.fieldsel(&mut v)?;
        }
        if self.check(&Token::Colon) {
            self.fieldsel(&mut v)?;
            return Ok((v, true));
        }
        Ok((v, false))
    }

    /// funcstat -> FUNCTION funcname body
    fn func_stat(&mut self, line: u32) -> Result<(), CompileError> {
        self.advance()?;
        let (v, is_method) = self.func_name()?;
        let mut b = self.body(is_method, line)?;
        self.check_readonly(&v)?;
        if let ExprKind::Local { vidx, .. } = v.kind {
            self.process_assign(vidx, b.types);
        }
        self.store_var(&v, &mut b)?;
        // the definition happens on the first line
        self.fix_line(line);
        Ok(())
    }

    // ---- Assignment ----

    /// Make `nexps` values in `e` fill exactly `nvars` registers.
    fn adjust_assign(&mut self, nvars: usize, nexps: usize, e: &mut ExprDesc) -> Result<(), CompileError> {
        let needed = nvars as i32 - nexps as i32;
        if e.is_multret() {
            // the call or vararg supplies the difference
            self.set_returns(e, (needed + 1).max(0))?;
        } else {
            if e.kind != ExprKind::Void {
                self.exp2nextreg(e)?;
            }
            if needed > 0 {
                let reg = self.fs.free_reg as u8;
                self.nil_(reg, needed as u8);
            }
        }
        if needed > 0 {
            self.reserve_regs(needed as usize)?;
        } else {
            self.fs.free_reg = (self.fs.free_reg as i32 + needed) as usize;
        }
        Ok(())
    }

    /// stat -> func | assignment
    fn expr_stat(&mut self) -> Result<(), CompileError> {
        let (v, nav) = self.suffixed_chain()?;
        if matches!(
            self.current()?,
            Token::Assign | Token::Comma | Token::OpAssign(_)
        ) {
            let v = self.close_navigation(v, nav)?;
            let mut targets = vec![v];
            return self.rest_assign(&mut targets);
        }
        match v.kind {
            ExprKind::Call(pc) => {
                // a call statement keeps no results, guarded or not
                self.fs.proto.code[pc].set_c(1);
                if let Some((_, exits)) = nav {
                    self.patch_to_here(exits)?;
                }
                Ok(())
            }
            _ => Err(self.syntax_error("syntax error")),
        }
    }

    /// A target of a multiple assignment is about to be overwritten; earlier
    /// targets that index through it must use a copy of its current value.
    fn check_conflict(&mut self, targets: &mut [ExprDesc], v: &ExprDesc) -> Result<(), CompileError> {
        let extra = self.fs.free_reg as u8;
        let mut conflict = false;
        for target in targets.iter_mut() {
            match (target.kind, v.kind) {
                (ExprKind::IndexUp { t, key }, ExprKind::Upval(up)) if t == up => {
                    conflict = true;
                    target.kind = ExprKind::IndexStr { t: extra, key };
                }
                (
                    ExprKind::IndexStr { t, key }
                    | ExprKind::IndexInt { t, key },
                    ExprKind::Local { reg, .. },
                ) if t == reg => {
                    conflict = true;
                    target.kind = match target.kind {
                        ExprKind::IndexStr { .. } => ExprKind::IndexStr { t: extra, key },
                        _ => ExprKind::IndexInt { t: extra, key },
                    };
                }
                (ExprKind::Indexed { t, key }, ExprKind::Local { reg, .. }) if t == reg || key == reg => {
                    conflict = true;
                    target.kind = ExprKind::Indexed {
                        t: if t == reg { extra } else { t },
                        key: if key == reg { extra } else { key },
                    };
                }
                _ => {}
            }
        }
        if conflict {
            match v.kind {
                ExprKind::Local { reg, .. } => {
                    self.code_abc(OpCode::Move, extra, reg, 0, false);
                }
                ExprKind::Upval(idx) => {
                    self.code_abc(OpCode::GetUpval, extra, idx, 0, false);
                }
                _ => {}
            }
            self.reserve_regs(1)?;
        }
        Ok(())
    }

    /// restassign -> {',' suffixedexp} ('=' explist | compound-op expr)
    fn rest_assign(&mut self, targets: &mut Vec<ExprDesc>) -> Result<(), CompileError> {
        loop {
            let last = targets[targets.len() - 1];
            if !last.is_var() {
                return Err(self.syntax_error("syntax error"));
            }
            self.check_readonly(&last)?;
            if !self.test_next(&Token::Comma)? {
                break;
            }
            self.enter_level()?;
            let v = self.suffixedexp()?;
            if !v.is_indexed() {
                self.check_conflict(targets, &v)?;
            }
            targets.push(v);
        }
        let nvars = targets.len();
        for _ in 1..nvars {
            self.leave_level();
        }

        if let Token::OpAssign(op) = self.current()? {
            if nvars != 1 {
                return Err(self.syntax_error("unsupported tuple assignment"));
            }
            return self.compound_assign(targets[0], op);
        }
        self.check_next(&Token::Assign)?;
        let (mut e, types) = self.explist()?;
        let nexps = types.len();
        for (i, target) in targets.iter().enumerate() {
            if let ExprKind::Local { vidx, .. } = target.kind {
                let produced = types.get(i).copied().unwrap_or_default();
                self.process_assign(vidx, produced);
            }
        }
        if nexps == nvars {
            self.set_oneret(&mut e);
            self.store_var(&targets[nvars - 1], &mut e)?;
        } else {
            self.adjust_assign(nvars, nexps, &mut e)?;
            let mut top = ExprDesc::new(ExprKind::NonReloc(self.fs.free_reg as u8 - 1));
            self.store_var(&targets[nvars - 1], &mut top)?;
        }
        // remaining targets take the values below, last first
        for target in targets[..nvars - 1].iter().rev() {
            let mut top = ExprDesc::new(ExprKind::NonReloc(self.fs.free_reg as u8 - 1));
            self.store_var(target, &mut top)?;
        }
        Ok(())
    }

    /// `v op= expr`. A local is updated in its own register; any other target
    /// is read once through the registers that address it, then written back.
    fn compound_assign(&mut self, v: ExprDesc, op: CompoundOp) -> Result<(), CompileError> {
        self.advance()?;
        let line = self.line();
        let bop = BinOp::from_compound(op);
        let local = match v.kind {
            ExprKind::Local { vidx, .. } => Some(vidx),
            _ => None,
        };
        let mut e = match local {
            Some(_) => v,
            None => self.discharge_copy(&v),
        };
        self.enter_level()?;
        let rhs_ty = if bop == BinOp::Coalesce {
            let skip = self.coalesce_head(&mut e, true)?;
            let rhs = self.expr()?;
            let ty = rhs.types.ty;
            self.coalesce_tail(&mut e, rhs, skip)?;
            ty
        } else {
            self.infix(bop, &mut e)?;
            let mut v2 = self.expr()?;
            let ty = v2.types.ty;
            self.posfix(bop, &mut e, &mut v2, line)?;
            ty
        };
        self.leave_level();
        if let Some(vidx) = local {
            let ty = bop.result_type(self.local_var(vidx).known.ty, rhs_ty);
            self.process_assign(vidx, TypeInfo { ty, returns: None });
        } else {
            self.exp2nextreg(&mut e)?;
        }
        self.set_oneret(&mut e);
        self.store_var(&v, &mut e)
    }
}
