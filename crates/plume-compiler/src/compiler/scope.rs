/// Scope tracking: active variables, upvalue capture, blocks, labels and gotos.
///
/// Active variables, labels and pending gotos live in three arrays owned by the
/// compiler and shared by every function being compiled; each function and
/// block only records where its own window starts.
use super::expr::{ConstValue, ExprDesc, ExprKind, JumpList};
use super::typehint::{TypeInfo, ValueType};
use super::{Compiler, FuncState};
use crate::diagnostic::CompileError;
use crate::opcode::OpCode;
use crate::proto::{LocalVar, UpvalDesc, VarKind};
use plume_core::string::StringId;
use tracing::trace;

/// Local variables per function.
pub(super) const MAX_VARS: usize = 200;

/// Upvalues per function.
pub(super) const MAX_UPVALUES: usize = 255;

/// A declared local variable.
#[derive(Clone, Debug)]
pub(super) struct VarDesc {
    pub name: StringId,
    pub kind: VarKind,
    /// Register holding the variable; meaningless for compile-time constants.
    pub reg: u8,
    /// Index of the variable's debug entry in `Proto::local_vars`.
    pub pidx: Option<usize>,
    /// Line of the declaration.
    pub line: u32,
    pub hint: Option<ValueType>,
    /// What is statically known about the last value assigned.
    pub known: TypeInfo,
    /// Value of a compile-time constant.
    pub value: Option<ConstValue>,
}

impl VarDesc {
    pub fn new(name: StringId, line: u32) -> Self {
        VarDesc {
            name,
            kind: VarKind::Regular,
            reg: 0,
            pidx: None,
            line,
            hint: None,
            known: TypeInfo::default(),
            value: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum BlockKind {
    Plain,
    Loop,
    /// Body of a `switch`: a `break` target, but not a loop for `continue`.
    Switch,
}

/// An open lexical block.
#[derive(Clone, Copy, Debug)]
pub(super) struct BlockCnt {
    pub kind: BlockKind,
    /// Index of the first label of this block.
    pub first_label: usize,
    /// Index of the first pending goto of this block.
    pub first_goto: usize,
    /// Active variables outside the block.
    pub nactvar: usize,
    /// Some variable of the block is captured by a closure.
    pub upval: bool,
    /// Inside the scope of a to-be-closed variable.
    pub inside_tbc: bool,
    /// `continue` jumps, patched to the loop's step code.
    pub scope_end: JumpList,
}

/// A visible label.
#[derive(Clone, Copy, Debug)]
pub(super) struct LabelInfo {
    pub name: StringId,
    pub pc: usize,
    pub line: u32,
    /// Active variables at the label.
    pub nactvar: usize,
}

/// A goto (or break) waiting for its label.
#[derive(Clone, Copy, Debug)]
pub(super) struct PendingGoto {
    pub name: StringId,
    /// Jumps to patch; empty for a jump that can never be taken.
    pub pc: JumpList,
    pub line: u32,
    /// Active variables at the goto; lowered as the goto leaves blocks.
    pub nactvar: usize,
    /// Leaving the goto's blocks must close upvalues.
    pub close: bool,
}

impl Compiler<'_> {
    // ---- Variables ----

    /// First register above the first `nvar` active variables.
    pub(super) fn reg_level(&self, nvar: usize) -> usize {
        let first = self.fs.first_local;
        self.actvar[first..first + nvar]
            .iter()
            .rev()
            .find(|vd| vd.kind != VarKind::CompileTimeConst)
            .map_or(0, |vd| vd.reg as usize + 1)
    }

    /// Registers occupied by active variables.
    pub(super) fn nvarstack(&self) -> usize {
        self.reg_level(self.fs.nactvar)
    }

    fn is_hidden(&self, name: StringId) -> bool {
        name == self.names.for_state || name == self.names.switch
    }

    /// Declare a variable (not yet active). Returns its index within the function.
    pub(super) fn new_localvar(&mut self, name: StringId) -> Result<usize, CompileError> {
        let line = self.lexer.lastline;
        if self.options.shadowing_enabled() && !self.is_hidden(name) {
            let first = self.fs.first_local;
            let shadowed = self.actvar[first..first + self.fs.nactvar]
                .iter()
                .rev()
                .find(|vd| vd.name == name)
                .map(|vd| vd.line);
            if let Some(original) = shadowed {
                self.warn(
                    line,
                    "duplicate local declaration",
                    Some(format!(
                        "this shadows the value of the initial declaration on line {original}."
                    )),
                );
            }
        }
        let count = self.actvar.len() + 1 - self.fs.first_local;
        if count > MAX_VARS {
            let defined = self.fs.proto.line_defined;
            return Err(self.error_limit(defined, MAX_VARS, "local variables"));
        }
        self.actvar.push(VarDesc::new(name, line));
        Ok(self.actvar.len() - 1 - self.fs.first_local)
    }

    /// Descriptor of the variable at `vidx` in the current function.
    pub(super) fn local_var(&mut self, vidx: usize) -> &mut VarDesc {
        let first = self.fs.first_local;
        &mut self.actvar[first + vidx]
    }

    fn register_localvar(&mut self, name: StringId) -> usize {
        let pc = self.fs.proto.code.len() as u32;
        let locals = &mut self.fs.proto.local_vars;
        locals.push(LocalVar {
            name,
            start_pc: pc,
            end_pc: 0,
        });
        locals.len() - 1
    }

    /// Activate the last `nvars` declared variables, giving them registers.
    pub(super) fn adjust_localvars(&mut self, nvars: usize) {
        let mut level = self.nvarstack();
        for _ in 0..nvars {
            let vidx = self.fs.nactvar;
            self.fs.nactvar += 1;
            let name = self.local_var(vidx).name;
            let pidx = self.register_localvar(name);
            let var = self.local_var(vidx);
            var.reg = level as u8;
            var.pidx = Some(pidx);
            level += 1;
        }
    }

    /// Deactivate variables down to `level`, stamping their debug end pc.
    /// Descriptors stay in the array until the enclosing block is left.
    fn remove_vars(&mut self, level: usize) {
        let pc = self.fs.proto.code.len() as u32;
        while self.fs.nactvar > level {
            self.fs.nactvar -= 1;
            let var = &self.actvar[self.fs.first_local + self.fs.nactvar];
            if let (Some(pidx), false) = (var.pidx, var.kind == VarKind::CompileTimeConst) {
                self.fs.proto.local_vars[pidx].end_pc = pc;
            }
        }
    }

    // ---- Name resolution ----

    fn func_at(&self, level: usize) -> &FuncState {
        self.enclosing.get(level).unwrap_or(&self.fs)
    }

    fn func_at_mut(&mut self, level: usize) -> &mut FuncState {
        match self.enclosing.get_mut(level) {
            Some(fs) => fs,
            None => &mut self.fs,
        }
    }

    /// Active variable `name` of the function at `level`.
    fn search_var(&self, level: usize, name: StringId) -> Option<ExprDesc> {
        let fs = self.func_at(level);
        let active = &self.actvar[fs.first_local..fs.first_local + fs.nactvar];
        let (vidx, vd) = active.iter().enumerate().rev().find(|(_, vd)| vd.name == name)?;
        let mut e = if vd.kind == VarKind::CompileTimeConst {
            ExprDesc::new(ExprKind::Const(fs.first_local + vidx))
        } else {
            ExprDesc::new(ExprKind::Local { reg: vd.reg, vidx })
        };
        // calling a local function yields its hinted return type
        e.types.returns = vd.known.returns;
        Some(e)
    }

    fn search_upvalue(&self, level: usize, name: StringId) -> Option<u8> {
        self.func_at(level)
            .proto
            .upvalues
            .iter()
            .position(|up| up.name == Some(name))
            .map(|idx| idx as u8)
    }

    /// Mark the block declaring variable `vidx` as having a captured variable.
    fn mark_upval(&mut self, level: usize, vidx: usize) {
        let fs = self.func_at_mut(level);
        if let Some(bl) = fs.blocks.iter_mut().rev().find(|bl| bl.nactvar <= vidx) {
            bl.upval = true;
        }
        fs.needclose = true;
    }

    pub(super) fn mark_to_be_closed(&mut self) {
        if let Some(bl) = self.fs.blocks.last_mut() {
            bl.upval = true;
            bl.inside_tbc = true;
        }
        self.fs.needclose = true;
    }

    /// Capture `v` (a local or upvalue of the function at `level - 1`) in the function at `level`.
    fn new_upvalue(&mut self, level: usize, name: StringId, v: &ExprDesc) -> Result<u8, CompileError> {
        let count = self.func_at(level).proto.upvalues.len();
        if count >= MAX_UPVALUES {
            let defined = self.func_at(level).proto.line_defined;
            return Err(self.error_limit(defined, MAX_UPVALUES, "upvalues"));
        }
        let parent = self.func_at(level - 1);
        let desc = match v.kind {
            ExprKind::Local { reg, vidx } => UpvalDesc {
                name: Some(name),
                in_stack: true,
                index: reg,
                kind: self.actvar[parent.first_local + vidx].kind,
            },
            ExprKind::Upval(idx) => UpvalDesc {
                name: Some(name),
                in_stack: false,
                index: idx,
                kind: parent.proto.upvalues[idx as usize].kind,
            },
            _ => return Err(self.error("cannot capture a non-variable")),
        };
        let upvalues = &mut self.func_at_mut(level).proto.upvalues;
        upvalues.push(desc);
        Ok((upvalues.len() - 1) as u8)
    }

    /// Resolve `name` in the function at `level`: local, then upvalue, then
    /// recursively in enclosing functions. `Void` means a global.
    fn singlevaraux(&mut self, level: usize, name: StringId, base: bool) -> Result<ExprDesc, CompileError> {
        if let Some(e) = self.search_var(level, name) {
            if let (ExprKind::Local { vidx, .. }, false) = (e.kind, base) {
                // used by an inner function
                self.mark_upval(level, vidx);
            }
            return Ok(e);
        }
        if let Some(idx) = self.search_upvalue(level, name) {
            return Ok(ExprDesc::new(ExprKind::Upval(idx)));
        }
        if level == 0 {
            return Ok(ExprDesc::void());
        }
        let outer = self.singlevaraux(level - 1, name, false)?;
        match outer.kind {
            ExprKind::Local { .. } | ExprKind::Upval(_) => {
                let idx = self.new_upvalue(level, name, &outer)?;
                Ok(ExprDesc::new(ExprKind::Upval(idx)))
            }
            // a global or a compile-time constant
            _ => Ok(outer),
        }
    }

    /// Resolve a name; globals become `_ENV[name]`.
    pub(super) fn singlevar(&mut self, name: StringId) -> Result<ExprDesc, CompileError> {
        let level = self.enclosing.len();
        let var = self.singlevaraux(level, name, true)?;
        if var.kind != ExprKind::Void {
            return Ok(var);
        }
        let env = self.names.env;
        let mut var = self.singlevaraux(level, env, true)?;
        self.exp2anyregup(&mut var)?;
        let mut key = ExprDesc::string(name);
        self.indexed(&mut var, &mut key)?;
        Ok(var)
    }

    /// Reject assignments to `<const>`, `<close>` and compile-time constant variables.
    pub(super) fn check_readonly(&self, e: &ExprDesc) -> Result<(), CompileError> {
        let name = match e.kind {
            ExprKind::Const(idx) => Some(self.actvar[idx].name),
            ExprKind::Local { vidx, .. } => {
                let vd = &self.actvar[self.fs.first_local + vidx];
                vd.kind.is_readonly().then_some(vd.name)
            }
            ExprKind::Upval(idx) => {
                let up = &self.fs.proto.upvalues[idx as usize];
                up.name.filter(|_| up.kind.is_readonly())
            }
            _ => None,
        };
        match name {
            Some(name) => Err(self.error_here(
                format!("attempt to reassign constant '{}'", self.lexer.strings.get_str(name)),
                "this variable is constant, and cannot be reassigned.",
            )),
            None => Ok(()),
        }
    }

    // ---- Labels and gotos ----

    /// Label `name` visible in the current function.
    pub(super) fn find_label(&self, name: StringId) -> Option<LabelInfo> {
        self.labels[self.fs.first_label..]
            .iter()
            .find(|lb| lb.name == name)
            .copied()
    }

    pub(super) fn check_repeated(&self, name: StringId) -> Result<(), CompileError> {
        match self.find_label(name) {
            Some(lb) => Err(self.error(format!(
                "label '{}' already defined on line {}",
                self.lexer.strings.get_str(name),
                lb.line
            ))),
            None => Ok(()),
        }
    }

    pub(super) fn new_goto_entry(&mut self, name: StringId, line: u32, pc: JumpList) {
        self.gotos.push(PendingGoto {
            name,
            pc,
            line,
            nactvar: self.fs.nactvar,
            close: false,
        });
    }

    /// Patch pending goto `g` to `label` and drop it from the list.
    fn solve_goto(&mut self, g: usize, label: &LabelInfo) -> Result<(), CompileError> {
        let gt = self.gotos[g];
        if gt.nactvar < label.nactvar {
            let var = self.local_var(gt.nactvar).name;
            return Err(self.error(format!(
                "<goto {}> at line {} jumps into the scope of local '{}'",
                self.lexer.strings.get_str(gt.name),
                gt.line,
                self.lexer.strings.get_str(var)
            )));
        }
        self.patch_list(gt.pc, label.pc)?;
        trace!(
            label = %self.lexer.strings.get_str(label.name),
            from = ?gt.pc,
            to = label.pc,
            "resolved goto"
        );
        self.gotos.remove(g);
        Ok(())
    }

    /// Resolve the current block's pending gotos to `label`. True when one of
    /// them needs upvalues closed.
    fn solve_gotos(&mut self, label: &LabelInfo) -> Result<bool, CompileError> {
        let mut i = self.fs.blocks.last().map_or(0, |bl| bl.first_goto);
        let mut needs_close = false;
        while i < self.gotos.len() {
            if self.gotos[i].name == label.name {
                needs_close |= self.gotos[i].close;
                self.solve_goto(i, label)?;
            } else {
                i += 1;
            }
        }
        Ok(needs_close)
    }

    /// Create a label at the current pc. A label that ends its block sees the
    /// block's locals as already out of scope. True when a `CLOSE` was emitted.
    pub(super) fn create_label(&mut self, name: StringId, line: u32, last: bool) -> Result<bool, CompileError> {
        let pc = self.get_label();
        let nactvar = match (last, self.fs.blocks.last()) {
            (true, Some(bl)) => bl.nactvar,
            _ => self.fs.nactvar,
        };
        let label = LabelInfo {
            name,
            pc,
            line,
            nactvar,
        };
        self.labels.push(label);
        if self.solve_gotos(&label)? {
            let level = self.nvarstack() as u8;
            self.code_abc(OpCode::Close, level, 0, 0, false);
            return Ok(true);
        }
        Ok(false)
    }

    /// Hand the pending gotos of a closed block to the enclosing block.
    fn move_gotos_out(&mut self, bl: &BlockCnt) {
        let outer_level = self.reg_level(bl.nactvar);
        for i in bl.first_goto..self.gotos.len() {
            let gt = self.gotos[i];
            let close = self.reg_level(gt.nactvar) > outer_level && bl.upval;
            let gt = &mut self.gotos[i];
            gt.close |= close;
            gt.nactvar = bl.nactvar;
        }
    }

    fn undef_goto(&self, gt: &PendingGoto) -> CompileError {
        let msg = if gt.name == self.names.break_ {
            format!("break outside loop at line {}", gt.line)
        } else {
            format!(
                "no visible label '{}' for <goto> at line {}",
                self.lexer.strings.get_str(gt.name),
                gt.line
            )
        };
        self.error(msg)
    }

    // ---- Blocks ----

    pub(super) fn enter_block(&mut self, kind: BlockKind) {
        let inside_tbc = self.fs.blocks.last().is_some_and(|bl| bl.inside_tbc);
        self.fs.blocks.push(BlockCnt {
            kind,
            first_label: self.labels.len(),
            first_goto: self.gotos.len(),
            nactvar: self.fs.nactvar,
            upval: false,
            inside_tbc,
            scope_end: None,
        });
        debug_assert_eq!(self.fs.free_reg, self.nvarstack(), "temporaries live across a block boundary");
    }

    /// Close the innermost block and return its final state.
    pub(super) fn leave_block(&mut self) -> Result<BlockCnt, CompileError> {
        let Some(&bl) = self.fs.blocks.last() else {
            return Err(self.error("no open block"));
        };
        let nested = self.fs.blocks.len() > 1;
        let stklevel = self.reg_level(bl.nactvar);
        self.remove_vars(bl.nactvar);
        let has_close = match bl.kind {
            BlockKind::Loop | BlockKind::Switch => {
                let name = self.names.break_;
                self.create_label(name, 0, false)?
            }
            BlockKind::Plain => false,
        };
        if !has_close && nested && bl.upval {
            self.code_abc(OpCode::Close, stklevel as u8, 0, 0, false);
        }
        self.fs.free_reg = stklevel;
        self.labels.truncate(bl.first_label);
        self.fs.blocks.pop();
        if nested {
            self.move_gotos_out(&bl);
        }
        self.actvar.truncate(self.fs.first_local + self.fs.nactvar);
        if !nested {
            if let Some(gt) = self.gotos.get(bl.first_goto) {
                return Err(self.undef_goto(gt));
            }
        }
        Ok(bl)
    }
}
