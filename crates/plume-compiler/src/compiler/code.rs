//! Bytecode emission: jump lists, register allocation, the constant pool and
//! the discharge of expression descriptors into registers.
//!
//! A jump list is threaded through the `sJ` operands of its own `JMP`
//! instructions; an offset of -1 ends the list. Conditional jumps are always
//! a test instruction immediately followed by the `JMP` it controls.
use super::expr::{BinOp, ConstValue, ExprDesc, ExprKind, JumpList, UnOp};
use super::Compiler;
use crate::diagnostic::CompileError;
use crate::opcode::{
    fits_sbx, fits_sc, int_to_sc, Instruction, OpCode, TagMethod, MAX_AX, MAX_BX, MAX_C,
    MAX_INDEX_RK, MAX_REGS, MAX_SJ, NO_REG, OFFSET_SJ,
};
use crate::proto::{AbsLineInfo, Constant, ABS_LINE_INFO, MAX_INSTRUCTIONS_WITHOUT_ABS};
use plume_core::string::StringId;

/// Marks the end of a jump list inside an `sJ` operand.
const NO_JUMP: i32 = -1;

/// Largest line delta stored relatively.
const LIMIT_LINE_DIFF: i64 = 0x80;

/// Strings longer than this are never used as `GETFIELD`-style keys.
const MAX_SHORT_LEN: usize = 40;

/// Key used to de-duplicate entries of a function's constant pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(super) enum ConstKey {
    Nil,
    Bool(bool),
    Int(i64),
    /// Bit pattern, so `0.0` and `-0.0` stay distinct.
    Float(u64),
    Str(StringId),
}

/// Numeric operand of a foldable operation.
#[derive(Clone, Copy, Debug, PartialEq)]
enum Numeral {
    Int(i64),
    Flt(f64),
}

impl Numeral {
    fn as_float(self) -> f64 {
        match self {
            Numeral::Int(i) => i as f64,
            Numeral::Flt(f) => f,
        }
    }

    fn as_int(self) -> Option<i64> {
        match self {
            Numeral::Int(i) => Some(i),
            Numeral::Flt(f) => float_to_int(f),
        }
    }

    fn is_zero(self) -> bool {
        match self {
            Numeral::Int(i) => i == 0,
            Numeral::Flt(f) => f == 0.0,
        }
    }
}

/// Exact float-to-integer conversion; fails for fractional or out-of-range values.
pub(super) fn float_to_int(f: f64) -> Option<i64> {
    // 2^63 as a float; the valid range is [-2^63, 2^63)
    const LIMIT: f64 = 9_223_372_036_854_775_808.0;
    (f.floor() == f && (-LIMIT..LIMIT).contains(&f)).then(|| f as i64)
}

/// `x << y` with logical shifts; negative `y` shifts right.
fn shift_left(x: i64, y: i64) -> i64 {
    if y < 0 {
        if y <= -64 {
            0
        } else {
            ((x as u64) >> (-y) as u32) as i64
        }
    } else if y >= 64 {
        0
    } else {
        ((x as u64) << y as u32) as i64
    }
}

fn int_floor_div(a: i64, b: i64) -> i64 {
    if b == -1 {
        return a.wrapping_neg();
    }
    let q = a / b;
    if (a % b != 0) && ((a ^ b) < 0) {
        q - 1
    } else {
        q
    }
}

fn int_mod(a: i64, b: i64) -> i64 {
    if b == -1 {
        return 0;
    }
    let m = a % b;
    if m != 0 && (m ^ b) < 0 {
        m + b
    } else {
        m
    }
}

fn float_mod(a: f64, b: f64) -> f64 {
    let m = a % b;
    if (m > 0.0 && b < 0.0) || (m < 0.0 && b > 0.0) {
        m + b
    } else {
        m
    }
}

/// Whether `op` may be folded for these operands: bitwise operators need
/// integral operands and division-like operators a nonzero divisor.
fn valid_fold(op: BinOp, a: Numeral, b: Numeral) -> bool {
    match op {
        BinOp::BAnd | BinOp::BOr | BinOp::BXor | BinOp::Shl | BinOp::Shr => {
            a.as_int().is_some() && b.as_int().is_some()
        }
        BinOp::Div | BinOp::IDiv | BinOp::Mod => !b.is_zero(),
        _ => true,
    }
}

/// Arithmetic with the runtime's integer/float semantics.
fn fold_arith(op: BinOp, a: Numeral, b: Numeral) -> Option<Numeral> {
    use Numeral::*;
    let result = match (op, a, b) {
        (BinOp::BAnd, ..) => Int(a.as_int()? & b.as_int()?),
        (BinOp::BOr, ..) => Int(a.as_int()? | b.as_int()?),
        (BinOp::BXor, ..) => Int(a.as_int()? ^ b.as_int()?),
        (BinOp::Shl, ..) => Int(shift_left(a.as_int()?, b.as_int()?)),
        (BinOp::Shr, ..) => Int(shift_left(a.as_int()?, b.as_int()?.wrapping_neg())),
        (BinOp::Div, ..) => Flt(a.as_float() / b.as_float()),
        (BinOp::Pow, ..) => Flt(a.as_float().powf(b.as_float())),
        (BinOp::Add, Int(x), Int(y)) => Int(x.wrapping_add(y)),
        (BinOp::Sub, Int(x), Int(y)) => Int(x.wrapping_sub(y)),
        (BinOp::Mul, Int(x), Int(y)) => Int(x.wrapping_mul(y)),
        (BinOp::IDiv, Int(x), Int(y)) => Int(int_floor_div(x, y)),
        (BinOp::Mod, Int(x), Int(y)) => Int(int_mod(x, y)),
        (BinOp::Add, ..) => Flt(a.as_float() + b.as_float()),
        (BinOp::Sub, ..) => Flt(a.as_float() - b.as_float()),
        (BinOp::Mul, ..) => Flt(a.as_float() * b.as_float()),
        (BinOp::IDiv, ..) => Flt((a.as_float() / b.as_float()).floor()),
        (BinOp::Mod, ..) => Flt(float_mod(a.as_float(), b.as_float())),
        _ => return None,
    };
    Some(result)
}

/// Register opcode, constant-operand opcode and metamethod event of an arithmetic operator.
fn arith_opcodes(op: BinOp) -> (OpCode, Option<OpCode>, TagMethod) {
    match op {
        BinOp::Add => (OpCode::Add, Some(OpCode::AddK), TagMethod::Add),
        BinOp::Sub => (OpCode::Sub, Some(OpCode::SubK), TagMethod::Sub),
        BinOp::Mul => (OpCode::Mul, Some(OpCode::MulK), TagMethod::Mul),
        BinOp::Mod => (OpCode::Mod, Some(OpCode::ModK), TagMethod::Mod),
        BinOp::Pow => (OpCode::Pow, Some(OpCode::PowK), TagMethod::Pow),
        BinOp::Div => (OpCode::Div, Some(OpCode::DivK), TagMethod::Div),
        BinOp::IDiv => (OpCode::IDiv, Some(OpCode::IDivK), TagMethod::IDiv),
        BinOp::BAnd => (OpCode::BAnd, Some(OpCode::BAndK), TagMethod::BAnd),
        BinOp::BOr => (OpCode::BOr, Some(OpCode::BOrK), TagMethod::BOr),
        BinOp::BXor => (OpCode::BXor, Some(OpCode::BXorK), TagMethod::BXor),
        BinOp::Shl => (OpCode::Shl, None, TagMethod::Shl),
        _ => (OpCode::Shr, None, TagMethod::Shr),
    }
}

fn ceil_log2(x: usize) -> u32 {
    usize::BITS - (x - 1).leading_zeros()
}

impl Compiler<'_> {
    // ---- Instructions and line info ----

    fn save_line_info(&mut self, line: u32) {
        let fs = &mut self.fs;
        let pc = fs.proto.code.len() - 1;
        let mut delta = line as i64 - fs.previous_line as i64;
        let absolute = delta.abs() >= LIMIT_LINE_DIFF || {
            let run = fs.iwthabs;
            fs.iwthabs += 1;
            run >= MAX_INSTRUCTIONS_WITHOUT_ABS
        };
        if absolute {
            fs.proto.abs_line_info.push(AbsLineInfo { pc: pc as u32, line });
            delta = ABS_LINE_INFO as i64;
            fs.iwthabs = 1;
        }
        fs.proto.line_info.push(delta as i8);
        fs.previous_line = line;
    }

    fn remove_last_line_info(&mut self) {
        let fs = &mut self.fs;
        match fs.proto.line_info.pop() {
            Some(ABS_LINE_INFO) => {
                fs.proto.abs_line_info.pop();
                fs.iwthabs = MAX_INSTRUCTIONS_WITHOUT_ABS + 1;
            }
            Some(delta) => {
                fs.previous_line = (fs.previous_line as i64 - delta as i64) as u32;
                fs.iwthabs = fs.iwthabs.saturating_sub(1);
            }
            None => {}
        }
    }

    fn remove_last_instruction(&mut self) {
        self.remove_last_line_info();
        self.fs.proto.code.pop();
    }

    /// Re-attribute the last emitted instruction to `line`.
    pub(super) fn fix_line(&mut self, line: u32) {
        self.remove_last_line_info();
        self.save_line_info(line);
    }

    pub(super) fn code(&mut self, inst: Instruction) -> usize {
        self.fs.proto.code.push(inst);
        let line = self.lexer.lastline;
        self.save_line_info(line);
        self.fs.proto.code.len() - 1
    }

    pub(super) fn code_abc(&mut self, op: OpCode, a: u8, b: u8, c: u8, k: bool) -> usize {
        self.code(Instruction::abc(op, a, b, c, k))
    }

    pub(super) fn code_abx(&mut self, op: OpCode, a: u8, bx: u32) -> usize {
        self.code(Instruction::abx(op, a, bx))
    }

    pub(super) fn code_asbx(&mut self, op: OpCode, a: u8, sbx: i32) -> usize {
        self.code(Instruction::asbx(op, a, sbx))
    }

    fn code_extra_arg(&mut self, ax: u32) -> usize {
        self.code(Instruction::ax(OpCode::ExtraArg, ax))
    }

    /// Load constant `k` into `reg`, spilling large indices into an `EXTRAARG`.
    fn code_k(&mut self, reg: u8, k: u32) -> usize {
        if k <= MAX_BX {
            self.code_abx(OpCode::LoadK, reg, k)
        } else {
            let pc = self.code_abx(OpCode::LoadKX, reg, 0);
            self.code_extra_arg(k);
            pc
        }
    }

    fn load_int(&mut self, reg: u8, i: i64) -> Result<(), CompileError> {
        if fits_sbx(i) {
            self.code_asbx(OpCode::LoadI, reg, i as i32);
        } else {
            let k = self.int_k(i)?;
            self.code_k(reg, k);
        }
        Ok(())
    }

    fn load_float(&mut self, reg: u8, f: f64) -> Result<(), CompileError> {
        match float_to_int(f).filter(|&i| fits_sbx(i)) {
            Some(i) => {
                self.code_asbx(OpCode::LoadF, reg, i as i32);
            }
            None => {
                let k = self.number_k(f)?;
                self.code_k(reg, k);
            }
        }
        Ok(())
    }

    /// The last instruction, unless it may be a jump target.
    fn previous_instruction(&self) -> Option<usize> {
        let pc = self.fs.proto.code.len();
        (pc > self.fs.last_target && pc > 0).then(|| pc - 1)
    }

    /// Set `n` registers from `from` to nil, merging with a preceding `LOADNIL` when they touch.
    pub(super) fn nil_(&mut self, from: u8, n: u8) {
        let mut first = from as i32;
        let mut last = first + n as i32 - 1;
        if let Some(pc) = self.previous_instruction() {
            let prev = &mut self.fs.proto.code[pc];
            if prev.opcode() == OpCode::LoadNil {
                let pfrom = prev.a() as i32;
                let pl = pfrom + prev.b() as i32;
                if (pfrom <= first && first <= pl + 1) || (first <= pfrom && pfrom <= last + 1) {
                    first = first.min(pfrom);
                    last = last.max(pl);
                    prev.set_a(first as u8);
                    prev.set_b((last - first) as u8);
                    return;
                }
            }
        }
        self.code_abc(OpCode::LoadNil, from, n - 1, 0, false);
    }

    /// Emit a return of `nret` values starting at `first`; -1 means "up to the top".
    pub(super) fn ret(&mut self, first: u8, nret: i32) {
        let op = match nret {
            0 => OpCode::Return0,
            1 => OpCode::Return1,
            _ => OpCode::Return,
        };
        self.code_abc(op, first, (nret + 1) as u8, 0, false);
    }

    pub(super) fn set_vararg(&mut self, nparams: u8) {
        self.fs.proto.is_vararg = true;
        self.code_abc(OpCode::VarArgPrep, nparams, 0, 0, false);
    }

    // ---- Jumps ----

    pub(super) fn jump(&mut self) -> usize {
        self.code(Instruction::sj(OpCode::Jmp, NO_JUMP))
    }

    /// Emit a test followed by its controlled jump; returns the jump's pc.
    pub(super) fn cond_jump(&mut self, op: OpCode, a: u8, b: u8, c: u8, k: bool) -> usize {
        self.code_abc(op, a, b, c, k);
        self.jump()
    }

    /// Current pc, marked as a jump target.
    pub(super) fn get_label(&mut self) -> usize {
        let pc = self.fs.proto.code.len();
        self.fs.last_target = pc;
        pc
    }

    fn get_jump(&self, pc: usize) -> Option<usize> {
        match self.fs.proto.code[pc].get_sj() {
            NO_JUMP => None,
            offset => Some((pc as i64 + 1 + offset as i64) as usize),
        }
    }

    pub(super) fn fix_jump(&mut self, pc: usize, dest: usize) -> Result<(), CompileError> {
        let offset = dest as i64 - (pc as i64 + 1);
        if !(-(OFFSET_SJ as i64)..=(MAX_SJ as i64 - OFFSET_SJ as i64)).contains(&offset) {
            return Err(self.syntax_error("control structure too long"));
        }
        self.fs.proto.code[pc].set_sj(offset as i32);
        Ok(())
    }

    /// Append list `l2` to list `l1`.
    pub(super) fn concat(&mut self, l1: &mut JumpList, l2: JumpList) -> Result<(), CompileError> {
        let Some(l2) = l2 else {
            return Ok(());
        };
        match *l1 {
            None => *l1 = Some(l2),
            Some(mut list) => {
                while let Some(next) = self.get_jump(list) {
                    list = next;
                }
                self.fix_jump(list, l2)?;
            }
        }
        Ok(())
    }

    /// The instruction controlling the jump at `pc`: its test, if any.
    fn get_jump_control(&self, pc: usize) -> usize {
        if pc >= 1 && self.fs.proto.code[pc - 1].opcode().is_test() {
            pc - 1
        } else {
            pc
        }
    }

    /// Point the `TESTSET` controlling `node` at `reg`, or degrade it to a
    /// plain `TEST` when no value is needed. False if `node` has no `TESTSET`.
    fn patch_test_reg(&mut self, node: usize, reg: u8) -> bool {
        let i = self.get_jump_control(node);
        let inst = &mut self.fs.proto.code[i];
        if inst.opcode() != OpCode::TestSet {
            return false;
        }
        if reg != NO_REG && reg != inst.b() {
            inst.set_a(reg);
        } else {
            *inst = Instruction::abc(OpCode::Test, inst.b(), 0, 0, inst.k());
        }
        true
    }

    fn remove_values(&mut self, mut list: JumpList) {
        while let Some(pc) = list {
            self.patch_test_reg(pc, NO_REG);
            list = self.get_jump(pc);
        }
    }

    /// Jumps whose test produces a value go to `vtarget`; the others to `dtarget`.
    fn patch_list_aux(
        &mut self,
        mut list: JumpList,
        vtarget: usize,
        reg: u8,
        dtarget: usize,
    ) -> Result<(), CompileError> {
        while let Some(pc) = list {
            let next = self.get_jump(pc);
            if self.patch_test_reg(pc, reg) {
                self.fix_jump(pc, vtarget)?;
            } else {
                self.fix_jump(pc, dtarget)?;
            }
            list = next;
        }
        Ok(())
    }

    pub(super) fn patch_list(&mut self, list: JumpList, target: usize) -> Result<(), CompileError> {
        self.patch_list_aux(list, target, NO_REG, target)
    }

    pub(super) fn patch_to_here(&mut self, list: JumpList) -> Result<(), CompileError> {
        let here = self.get_label();
        self.patch_list(list, here)
    }

    /// Whether some jump in the list is not a `TESTSET`, so the value must be materialized.
    fn need_value(&self, mut list: JumpList) -> bool {
        while let Some(pc) = list {
            let i = self.get_jump_control(pc);
            if self.fs.proto.code[i].opcode() != OpCode::TestSet {
                return true;
            }
            list = self.get_jump(pc);
        }
        false
    }

    // ---- Registers ----

    pub(super) fn check_stack(&mut self, n: usize) -> Result<(), CompileError> {
        let needed = self.fs.free_reg + n;
        if needed > self.fs.proto.max_stack_size as usize {
            if needed >= MAX_REGS {
                return Err(
                    self.syntax_error("function or expression needs too many registers")
                );
            }
            self.fs.proto.max_stack_size = needed as u8;
        }
        Ok(())
    }

    pub(super) fn reserve_regs(&mut self, n: usize) -> Result<(), CompileError> {
        self.check_stack(n)?;
        self.fs.free_reg += n;
        Ok(())
    }

    /// Release `reg` if it is a temporary; locals are never freed here.
    pub(super) fn free_register(&mut self, reg: u8) {
        if reg as usize >= self.nvarstack() {
            self.fs.free_reg -= 1;
            debug_assert_eq!(reg as usize, self.fs.free_reg, "registers freed out of order");
        }
    }

    fn free_registers(&mut self, r1: u8, r2: u8) {
        if r1 > r2 {
            self.free_register(r1);
            self.free_register(r2);
        } else {
            self.free_register(r2);
            self.free_register(r1);
        }
    }

    pub(super) fn free_exp(&mut self, e: &ExprDesc) {
        if let ExprKind::NonReloc(r) = e.kind {
            self.free_register(r);
        }
    }

    fn free_exps(&mut self, e1: &ExprDesc, e2: &ExprDesc) {
        match (e1.kind, e2.kind) {
            (ExprKind::NonReloc(r1), ExprKind::NonReloc(r2)) => self.free_registers(r1, r2),
            (ExprKind::NonReloc(r1), _) => self.free_register(r1),
            (_, ExprKind::NonReloc(r2)) => self.free_register(r2),
            _ => {}
        }
    }

    // ---- Constants ----

    fn add_k(&mut self, key: ConstKey, value: Constant) -> Result<u32, CompileError> {
        if let Some(&idx) = self.fs.k_cache.get(&key) {
            return Ok(idx);
        }
        let idx = self.fs.proto.constants.len();
        if idx > MAX_AX as usize {
            let line = self.fs.proto.line_defined;
            return Err(self.error_limit(line, MAX_AX as usize, "constants"));
        }
        self.fs.proto.constants.push(value);
        self.fs.k_cache.insert(key, idx as u32);
        Ok(idx as u32)
    }

    pub(super) fn string_k(&mut self, s: StringId) -> Result<u32, CompileError> {
        self.add_k(ConstKey::Str(s), Constant::String(s))
    }

    fn int_k(&mut self, i: i64) -> Result<u32, CompileError> {
        self.add_k(ConstKey::Int(i), Constant::Integer(i))
    }

    fn number_k(&mut self, f: f64) -> Result<u32, CompileError> {
        self.add_k(ConstKey::Float(f.to_bits()), Constant::Float(f))
    }

    fn bool_k(&mut self, b: bool) -> Result<u32, CompileError> {
        self.add_k(ConstKey::Bool(b), Constant::Boolean(b))
    }

    pub(super) fn nil_k(&mut self) -> Result<u32, CompileError> {
        self.add_k(ConstKey::Nil, Constant::Nil)
    }

    fn str2k(&mut self, e: &mut ExprDesc) -> Result<(), CompileError> {
        if let ExprKind::KStr(s) = e.kind {
            e.kind = ExprKind::K(self.string_k(s)?);
        }
        Ok(())
    }

    /// A short-string constant addressable as an 8-bit key operand.
    fn is_kstr(&self, e: &ExprDesc) -> bool {
        match e.kind {
            ExprKind::K(idx) if !e.has_jumps() && idx <= MAX_INDEX_RK => matches!(
                self.fs.proto.constants[idx as usize],
                Constant::String(s) if self.lexer.strings.get_bytes(s).len() <= MAX_SHORT_LEN
            ),
            _ => false,
        }
    }

    fn is_kint(e: &ExprDesc) -> Option<i64> {
        match e.kind {
            ExprKind::KInt(i) if !e.has_jumps() => Some(i),
            _ => None,
        }
    }

    /// Integer constant fitting an unsigned C operand.
    fn is_cint(e: &ExprDesc) -> Option<u8> {
        Self::is_kint(e).filter(|&i| (0..=MAX_C as i64).contains(&i)).map(|i| i as u8)
    }

    /// Integer constant fitting a signed sC operand.
    fn is_sc_int(e: &ExprDesc) -> bool {
        Self::is_kint(e).is_some_and(fits_sc)
    }

    /// Integral numeric constant fitting sC: (encoded operand, was float).
    fn is_sc_number(e: &ExprDesc) -> Option<(u8, bool)> {
        if e.has_jumps() {
            return None;
        }
        let (i, is_float) = match e.kind {
            ExprKind::KInt(i) => (i, false),
            ExprKind::KFlt(f) => (float_to_int(f)?, true),
            _ => return None,
        };
        fits_sc(i).then(|| (int_to_sc(i as i32), is_float))
    }

    fn to_numeral(e: &ExprDesc) -> Option<Numeral> {
        if e.has_jumps() {
            return None;
        }
        match e.kind {
            ExprKind::KInt(i) => Some(Numeral::Int(i)),
            ExprKind::KFlt(f) => Some(Numeral::Flt(f)),
            _ => None,
        }
    }

    /// Compile-time value of `e`, if it has one.
    pub(super) fn exp2const(&self, e: &ExprDesc) -> Option<ConstValue> {
        if e.has_jumps() {
            return None;
        }
        match e.kind {
            ExprKind::Nil => Some(ConstValue::Nil),
            ExprKind::True => Some(ConstValue::Bool(true)),
            ExprKind::False => Some(ConstValue::Bool(false)),
            ExprKind::KStr(s) => Some(ConstValue::Str(s)),
            ExprKind::KInt(i) => Some(ConstValue::Int(i)),
            ExprKind::KFlt(f) => Some(ConstValue::Float(f)),
            ExprKind::Const(idx) => self.actvar[idx].value,
            _ => None,
        }
    }

    /// Try to turn `e` into a constant operand (`K` kind). False when it is not
    /// constant or its index does not fit an operand.
    fn exp2k(&mut self, e: &mut ExprDesc) -> Result<bool, CompileError> {
        if e.has_jumps() {
            return Ok(false);
        }
        let idx = match e.kind {
            ExprKind::True => self.bool_k(true)?,
            ExprKind::False => self.bool_k(false)?,
            ExprKind::Nil => self.nil_k()?,
            ExprKind::KInt(i) => self.int_k(i)?,
            ExprKind::KFlt(f) => self.number_k(f)?,
            ExprKind::KStr(s) => self.string_k(s)?,
            ExprKind::K(idx) => idx,
            _ => return Ok(false),
        };
        if idx <= MAX_INDEX_RK {
            e.kind = ExprKind::K(idx);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Constant operand when possible, register otherwise. True for a constant.
    fn exp2rk(&mut self, e: &mut ExprDesc) -> Result<bool, CompileError> {
        if self.exp2k(e)? {
            Ok(true)
        } else {
            self.exp2anyreg(e)?;
            Ok(false)
        }
    }

    fn operand(e: &ExprDesc) -> u8 {
        match e.kind {
            ExprKind::K(idx) => idx as u8,
            ExprKind::NonReloc(r) => r,
            _ => 0,
        }
    }

    fn code_abrk(&mut self, op: OpCode, a: u8, b: u8, ec: &mut ExprDesc) -> Result<(), CompileError> {
        let k = self.exp2rk(ec)?;
        let c = Self::operand(ec);
        self.code_abc(op, a, b, c, k);
        Ok(())
    }

    // ---- Discharging ----

    pub(super) fn set_returns(&mut self, e: &mut ExprDesc, nresults: i32) -> Result<(), CompileError> {
        match e.kind {
            ExprKind::Call(pc) => self.fs.proto.code[pc].set_c((nresults + 1) as u8),
            ExprKind::Vararg(pc) => {
                let free = self.fs.free_reg as u8;
                let inst = &mut self.fs.proto.code[pc];
                inst.set_c((nresults + 1) as u8);
                inst.set_a(free);
                self.reserve_regs(1)?;
            }
            _ => {}
        }
        Ok(())
    }

    pub(super) fn set_multret(&mut self, e: &mut ExprDesc) -> Result<(), CompileError> {
        self.set_returns(e, -1)
    }

    /// Restrict a call or vararg to exactly one result.
    pub(super) fn set_oneret(&mut self, e: &mut ExprDesc) {
        match e.kind {
            ExprKind::Call(pc) => e.kind = ExprKind::NonReloc(self.fs.proto.code[pc].a()),
            ExprKind::Vararg(pc) => {
                self.fs.proto.code[pc].set_c(2);
                e.kind = ExprKind::Reloc(pc);
            }
            _ => {}
        }
    }

    /// Turn a variable into a value: locals become fixed registers, everything
    /// else becomes a relocatable load.
    pub(super) fn discharge_vars(&mut self, e: &mut ExprDesc) {
        let kind = match e.kind {
            ExprKind::Const(idx) => {
                let value = self.actvar[idx].value.unwrap_or(ConstValue::Nil);
                ExprDesc::from_const(value).kind
            }
            ExprKind::Local { reg, .. } => ExprKind::NonReloc(reg),
            ExprKind::Upval(idx) => {
                ExprKind::Reloc(self.code_abc(OpCode::GetUpval, 0, idx, 0, false))
            }
            ExprKind::IndexUp { t, key } => {
                ExprKind::Reloc(self.code_abc(OpCode::GetTabUp, 0, t, key, false))
            }
            ExprKind::IndexInt { t, key } => {
                self.free_register(t);
                ExprKind::Reloc(self.code_abc(OpCode::GetI, 0, t, key, false))
            }
            ExprKind::IndexStr { t, key } => {
                self.free_register(t);
                ExprKind::Reloc(self.code_abc(OpCode::GetField, 0, t, key, false))
            }
            ExprKind::Indexed { t, key } => {
                self.free_registers(t, key);
                ExprKind::Reloc(self.code_abc(OpCode::GetTable, 0, t, key, false))
            }
            ExprKind::Call(_) | ExprKind::Vararg(_) => {
                self.set_oneret(e);
                return;
            }
            _ => return,
        };
        e.kind = kind;
    }

    /// Load the current value of a variable without releasing the registers
    /// that address it, so the same variable can be stored to afterwards.
    pub(super) fn discharge_copy(&mut self, e: &ExprDesc) -> ExprDesc {
        let pc = match e.kind {
            ExprKind::Upval(idx) => self.code_abc(OpCode::GetUpval, 0, idx, 0, false),
            ExprKind::IndexUp { t, key } => self.code_abc(OpCode::GetTabUp, 0, t, key, false),
            ExprKind::IndexInt { t, key } => self.code_abc(OpCode::GetI, 0, t, key, false),
            ExprKind::IndexStr { t, key } => self.code_abc(OpCode::GetField, 0, t, key, false),
            ExprKind::Indexed { t, key } => self.code_abc(OpCode::GetTable, 0, t, key, false),
            _ => return *e,
        };
        ExprDesc {
            kind: ExprKind::Reloc(pc),
            ..*e
        }
    }

    fn discharge2reg(&mut self, e: &mut ExprDesc, reg: u8) -> Result<(), CompileError> {
        self.discharge_vars(e);
        match e.kind {
            ExprKind::Nil => self.nil_(reg, 1),
            ExprKind::False => {
                self.code_abc(OpCode::LoadFalse, reg, 0, 0, false);
            }
            ExprKind::True => {
                self.code_abc(OpCode::LoadTrue, reg, 0, 0, false);
            }
            ExprKind::KStr(s) => {
                let k = self.string_k(s)?;
                self.code_k(reg, k);
            }
            ExprKind::K(k) => {
                self.code_k(reg, k);
            }
            ExprKind::KFlt(f) => self.load_float(reg, f)?,
            ExprKind::KInt(i) => self.load_int(reg, i)?,
            ExprKind::Reloc(pc) => self.fs.proto.code[pc].set_a(reg),
            ExprKind::NonReloc(r) => {
                if r != reg {
                    self.code_abc(OpCode::Move, reg, r, 0, false);
                }
            }
            // a comparison keeps its jump; exp2reg materializes it
            _ => return Ok(()),
        }
        e.kind = ExprKind::NonReloc(reg);
        Ok(())
    }

    fn discharge2anyreg(&mut self, e: &mut ExprDesc) -> Result<(), CompileError> {
        if !matches!(e.kind, ExprKind::NonReloc(_)) {
            self.reserve_regs(1)?;
            let reg = (self.fs.free_reg - 1) as u8;
            self.discharge2reg(e, reg)?;
        }
        Ok(())
    }

    fn code_loadbool(&mut self, reg: u8, op: OpCode) -> usize {
        self.get_label();
        self.code_abc(op, reg, 0, 0, false)
    }

    /// Put the final value of `e`, jump lists included, into `reg`.
    pub(super) fn exp2reg(&mut self, e: &mut ExprDesc, reg: u8) -> Result<(), CompileError> {
        self.discharge2reg(e, reg)?;
        if let ExprKind::Jmp(pc) = e.kind {
            self.concat(&mut e.t, Some(pc))?;
        }
        if e.has_jumps() {
            let mut load_false = None;
            let mut load_true = None;
            if self.need_value(e.t) || self.need_value(e.f) {
                let skip = if matches!(e.kind, ExprKind::Jmp(_)) {
                    None
                } else {
                    Some(self.jump())
                };
                load_false = Some(self.code_loadbool(reg, OpCode::LFalseSkip));
                load_true = Some(self.code_loadbool(reg, OpCode::LoadTrue));
                self.patch_to_here(skip)?;
            }
            let end = self.get_label();
            self.patch_list_aux(e.f, end, reg, load_false.unwrap_or(end))?;
            self.patch_list_aux(e.t, end, reg, load_true.unwrap_or(end))?;
        }
        e.t = None;
        e.f = None;
        e.kind = ExprKind::NonReloc(reg);
        Ok(())
    }

    /// Put `e` in the next free register and return that register.
    pub(super) fn exp2nextreg(&mut self, e: &mut ExprDesc) -> Result<u8, CompileError> {
        self.discharge_vars(e);
        self.free_exp(e);
        self.reserve_regs(1)?;
        let reg = (self.fs.free_reg - 1) as u8;
        self.exp2reg(e, reg)?;
        Ok(reg)
    }

    /// Put `e` in some register, reusing its own when it already has one.
    pub(super) fn exp2anyreg(&mut self, e: &mut ExprDesc) -> Result<u8, CompileError> {
        self.discharge_vars(e);
        if let ExprKind::NonReloc(reg) = e.kind {
            if !e.has_jumps() {
                return Ok(reg);
            }
            if reg as usize >= self.nvarstack() {
                self.exp2reg(e, reg)?;
                return Ok(reg);
            }
        }
        self.exp2nextreg(e)
    }

    /// Like `exp2anyreg`, but an upvalue without jumps may stay where it is.
    pub(super) fn exp2anyregup(&mut self, e: &mut ExprDesc) -> Result<(), CompileError> {
        if !matches!(e.kind, ExprKind::Upval(_)) || e.has_jumps() {
            self.exp2anyreg(e)?;
        }
        Ok(())
    }

    /// Make `e` a register or a constant.
    pub(super) fn exp2val(&mut self, e: &mut ExprDesc) -> Result<(), CompileError> {
        if e.has_jumps() {
            self.exp2anyreg(e)?;
        } else {
            self.discharge_vars(e);
        }
        Ok(())
    }

    /// Store `ex` into the variable `var`.
    pub(super) fn store_var(&mut self, var: &ExprDesc, ex: &mut ExprDesc) -> Result<(), CompileError> {
        match var.kind {
            ExprKind::Local { reg, .. } => {
                self.free_exp(ex);
                return self.exp2reg(ex, reg);
            }
            ExprKind::Upval(idx) => {
                let e = self.exp2anyreg(ex)?;
                self.code_abc(OpCode::SetUpval, e, idx, 0, false);
            }
            ExprKind::IndexUp { t, key } => self.code_abrk(OpCode::SetTabUp, t, key, ex)?,
            ExprKind::IndexInt { t, key } => self.code_abrk(OpCode::SetI, t, key, ex)?,
            ExprKind::IndexStr { t, key } => self.code_abrk(OpCode::SetField, t, key, ex)?,
            ExprKind::Indexed { t, key } => self.code_abrk(OpCode::SetTable, t, key, ex)?,
            _ => {}
        }
        self.free_exp(ex);
        Ok(())
    }

    /// `obj:key` becomes `SELF base obj key`; returns `base`, which holds the
    /// method with `obj` right above it.
    pub(super) fn self_(&mut self, e: &mut ExprDesc, key: &mut ExprDesc) -> Result<u8, CompileError> {
        let obj = self.exp2anyreg(e)?;
        self.free_exp(e);
        let base = self.fs.free_reg as u8;
        *e = ExprDesc::new(ExprKind::NonReloc(base));
        self.reserve_regs(2)?;
        self.code_abrk(OpCode::Self_, base, obj, key)?;
        self.free_exp(key);
        Ok(base)
    }

    /// Turn `t` into the indexed variable `t[k]`.
    pub(super) fn indexed(&mut self, t: &mut ExprDesc, k: &mut ExprDesc) -> Result<(), CompileError> {
        self.str2k(k)?;
        if matches!(t.kind, ExprKind::Upval(_)) && !self.is_kstr(k) {
            self.exp2anyreg(t)?;
        }
        let kind = match t.kind {
            ExprKind::Upval(up) => ExprKind::IndexUp {
                t: up,
                key: Self::operand(k),
            },
            kind => {
                let table = match kind {
                    ExprKind::Local { reg, .. } => reg,
                    ExprKind::NonReloc(r) => r,
                    _ => self.exp2anyreg(t)?,
                };
                if self.is_kstr(k) {
                    ExprKind::IndexStr {
                        t: table,
                        key: Self::operand(k),
                    }
                } else if let Some(i) = Self::is_cint(k) {
                    ExprKind::IndexInt { t: table, key: i }
                } else {
                    let key = self.exp2anyreg(k)?;
                    ExprKind::Indexed { t: table, key }
                }
            }
        };
        t.kind = kind;
        t.types = Default::default();
        Ok(())
    }

    // ---- Conditions ----

    fn negate_condition(&mut self, pc: usize) {
        let i = self.get_jump_control(pc);
        let inst = &mut self.fs.proto.code[i];
        let k = inst.k();
        inst.set_k(!k);
    }

    /// Jump if `e` is `cond`; a preceding `NOT` is folded into the test.
    fn jump_on_cond(&mut self, e: &mut ExprDesc, cond: bool) -> Result<usize, CompileError> {
        if let ExprKind::Reloc(pc) = e.kind {
            let inst = self.fs.proto.code[pc];
            if inst.opcode() == OpCode::Not {
                self.remove_last_instruction();
                return Ok(self.cond_jump(OpCode::Test, inst.b(), 0, 0, !cond));
            }
        }
        self.discharge2anyreg(e)?;
        self.free_exp(e);
        let reg = Self::operand(e);
        Ok(self.cond_jump(OpCode::TestSet, NO_REG, reg, 0, cond))
    }

    /// Fall through when `e` is true, jump (via `e.f`) when false.
    pub(super) fn go_if_true(&mut self, e: &mut ExprDesc) -> Result<(), CompileError> {
        self.discharge_vars(e);
        let jump = match e.kind {
            ExprKind::Jmp(pc) => {
                self.negate_condition(pc);
                Some(pc)
            }
            ExprKind::K(_)
            | ExprKind::KFlt(_)
            | ExprKind::KInt(_)
            | ExprKind::KStr(_)
            | ExprKind::True => None,
            _ => Some(self.jump_on_cond(e, false)?),
        };
        self.concat(&mut e.f, jump)?;
        self.patch_to_here(e.t)?;
        e.t = None;
        Ok(())
    }

    /// Fall through when `e` is false, jump (via `e.t`) when true.
    pub(super) fn go_if_false(&mut self, e: &mut ExprDesc) -> Result<(), CompileError> {
        self.discharge_vars(e);
        let jump = match e.kind {
            ExprKind::Jmp(pc) => Some(pc),
            ExprKind::Nil | ExprKind::False => None,
            _ => Some(self.jump_on_cond(e, true)?),
        };
        self.concat(&mut e.t, jump)?;
        self.patch_to_here(e.f)?;
        e.f = None;
        Ok(())
    }

    fn code_not(&mut self, e: &mut ExprDesc) -> Result<(), CompileError> {
        match e.kind {
            ExprKind::Nil | ExprKind::False => e.kind = ExprKind::True,
            ExprKind::K(_)
            | ExprKind::KFlt(_)
            | ExprKind::KInt(_)
            | ExprKind::KStr(_)
            | ExprKind::True => e.kind = ExprKind::False,
            ExprKind::Jmp(pc) => self.negate_condition(pc),
            ExprKind::Reloc(_) | ExprKind::NonReloc(_) => {
                self.discharge2anyreg(e)?;
                self.free_exp(e);
                let reg = Self::operand(e);
                e.kind = ExprKind::Reloc(self.code_abc(OpCode::Not, 0, reg, 0, false));
            }
            _ => {}
        }
        std::mem::swap(&mut e.t, &mut e.f);
        self.remove_values(e.f);
        self.remove_values(e.t);
        Ok(())
    }

    // ---- Operators ----

    /// Fold `e1 op e2` when both are numeric constants. The result replaces `e1`.
    fn const_folding(op: BinOp, e1: &mut ExprDesc, e2: &ExprDesc) -> bool {
        let (Some(a), Some(b)) = (Self::to_numeral(e1), Self::to_numeral(e2)) else {
            return false;
        };
        if !valid_fold(op, a, b) {
            return false;
        }
        match fold_arith(op, a, b) {
            Some(Numeral::Int(i)) => e1.kind = ExprKind::KInt(i),
            // NaN and zero results are left to the runtime
            Some(Numeral::Flt(f)) if !f.is_nan() && f != 0.0 => e1.kind = ExprKind::KFlt(f),
            _ => return false,
        }
        true
    }

    fn fold_unary(op: UnOp, e: &mut ExprDesc) -> bool {
        let Some(n) = Self::to_numeral(e) else {
            return false;
        };
        let folded = match (op, n) {
            (UnOp::Minus, Numeral::Int(i)) => Numeral::Int(i.wrapping_neg()),
            (UnOp::Minus, Numeral::Flt(f)) => Numeral::Flt(-f),
            (UnOp::BNot, n) => match n.as_int() {
                Some(i) => Numeral::Int(!i),
                None => return false,
            },
            _ => return false,
        };
        match folded {
            Numeral::Int(i) => e.kind = ExprKind::KInt(i),
            Numeral::Flt(f) if !f.is_nan() && f != 0.0 => e.kind = ExprKind::KFlt(f),
            _ => return false,
        }
        true
    }

    fn code_unexpval(&mut self, op: OpCode, e: &mut ExprDesc, line: u32) -> Result<(), CompileError> {
        let r = self.exp2anyreg(e)?;
        self.free_exp(e);
        e.kind = ExprKind::Reloc(self.code_abc(op, 0, r, 0, false));
        self.fix_line(line);
        Ok(())
    }

    pub(super) fn prefix(&mut self, op: UnOp, e: &mut ExprDesc, line: u32) -> Result<(), CompileError> {
        self.discharge_vars(e);
        match op {
            UnOp::Minus | UnOp::BNot => {
                if Self::fold_unary(op, e) {
                    return Ok(());
                }
                let code = if op == UnOp::Minus { OpCode::Unm } else { OpCode::BNot };
                self.code_unexpval(code, e, line)
            }
            UnOp::Len => self.code_unexpval(OpCode::Len, e, line),
            UnOp::Not => self.code_not(e),
        }
    }

    /// Prepare the left operand before the right one is parsed.
    pub(super) fn infix(&mut self, op: BinOp, v: &mut ExprDesc) -> Result<(), CompileError> {
        self.discharge_vars(v);
        match op {
            BinOp::And => self.go_if_true(v)?,
            BinOp::Or => self.go_if_false(v)?,
            BinOp::Concat => {
                self.exp2nextreg(v)?;
            }
            BinOp::Eq | BinOp::Ne => {
                if Self::to_numeral(v).is_none() {
                    self.exp2rk(v)?;
                }
            }
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                if Self::is_sc_number(v).is_none() {
                    self.exp2anyreg(v)?;
                }
            }
            BinOp::Coalesce => {}
            _ => {
                if Self::to_numeral(v).is_none() {
                    self.exp2anyreg(v)?;
                }
            }
        }
        Ok(())
    }

    /// Emit `e1 op e2`; the result replaces `e1`.
    pub(super) fn posfix(
        &mut self,
        op: BinOp,
        e1: &mut ExprDesc,
        e2: &mut ExprDesc,
        line: u32,
    ) -> Result<(), CompileError> {
        self.discharge_vars(e2);
        if op.is_arith() && Self::const_folding(op, e1, e2) {
            return Ok(());
        }
        match op {
            BinOp::And => {
                debug_assert!(e1.t.is_none());
                self.concat(&mut e2.f, e1.f)?;
                *e1 = *e2;
            }
            BinOp::Or => {
                debug_assert!(e1.f.is_none());
                self.concat(&mut e2.t, e1.t)?;
                *e1 = *e2;
            }
            BinOp::Concat => {
                self.exp2nextreg(e2)?;
                self.code_concat(e1, e2, line);
            }
            BinOp::Add | BinOp::Mul => self.code_commutative(op, e1, e2, line)?,
            BinOp::Sub => {
                if !self.finish_binexp_neg(e1, e2, OpCode::AddI, line, TagMethod::Sub)? {
                    self.code_arith(op, e1, e2, false, line)?;
                }
            }
            BinOp::Div | BinOp::IDiv | BinOp::Mod | BinOp::Pow => {
                self.code_arith(op, e1, e2, false, line)?
            }
            BinOp::BAnd | BinOp::BOr | BinOp::BXor => self.code_bitwise(op, e1, e2, line)?,
            BinOp::Shl => {
                if Self::is_sc_int(e1) {
                    std::mem::swap(e1, e2);
                    self.code_bini(OpCode::ShlI, e1, e2, true, line, TagMethod::Shl)?;
                } else if !self.finish_binexp_neg(e1, e2, OpCode::ShrI, line, TagMethod::Shl)? {
                    self.code_binexpval(op, e1, e2, line)?;
                }
            }
            BinOp::Shr => {
                if Self::is_sc_int(e2) {
                    self.code_bini(OpCode::ShrI, e1, e2, false, line, TagMethod::Shr)?;
                } else {
                    self.code_binexpval(op, e1, e2, line)?;
                }
            }
            BinOp::Eq | BinOp::Ne => self.code_eq(op, e1, e2)?,
            BinOp::Gt | BinOp::Ge => {
                // a > b is b < a; a >= b is b <= a
                std::mem::swap(e1, e2);
                let swapped = if op == BinOp::Gt { BinOp::Lt } else { BinOp::Le };
                self.code_order(swapped, e1, e2)?;
            }
            BinOp::Lt | BinOp::Le => self.code_order(op, e1, e2)?,
            BinOp::Coalesce => {}
        }
        Ok(())
    }

    /// Emit a binary instruction and the `MMBIN*` fallback that follows it.
    #[allow(clippy::too_many_arguments)]
    fn finish_binexpval(
        &mut self,
        e1: &mut ExprDesc,
        e2: &ExprDesc,
        op: OpCode,
        v2: u8,
        flip: bool,
        line: u32,
        mmop: OpCode,
        event: TagMethod,
    ) -> Result<(), CompileError> {
        let v1 = self.exp2anyreg(e1)?;
        let pc = self.code_abc(op, 0, v1, v2, false);
        self.free_exps(e1, e2);
        e1.kind = ExprKind::Reloc(pc);
        self.fix_line(line);
        self.code_abc(mmop, v1, v2, event as u8, flip);
        self.fix_line(line);
        Ok(())
    }

    fn code_binexpval(
        &mut self,
        op: BinOp,
        e1: &mut ExprDesc,
        e2: &mut ExprDesc,
        line: u32,
    ) -> Result<(), CompileError> {
        let (opcode, _, event) = arith_opcodes(op);
        let v2 = self.exp2anyreg(e2)?;
        self.finish_binexpval(e1, e2, opcode, v2, false, line, OpCode::MMBin, event)
    }

    fn code_bini(
        &mut self,
        op: OpCode,
        e1: &mut ExprDesc,
        e2: &ExprDesc,
        flip: bool,
        line: u32,
        event: TagMethod,
    ) -> Result<(), CompileError> {
        let imm = Self::is_kint(e2).unwrap_or(0);
        let v2 = int_to_sc(imm as i32);
        self.finish_binexpval(e1, e2, op, v2, flip, line, OpCode::MMBinI, event)
    }

    fn code_bink(
        &mut self,
        op: BinOp,
        e1: &mut ExprDesc,
        e2: &ExprDesc,
        flip: bool,
        line: u32,
    ) -> Result<(), CompileError> {
        let (opcode, kop, event) = arith_opcodes(op);
        let v2 = Self::operand(e2);
        let opcode = kop.unwrap_or(opcode);
        self.finish_binexpval(e1, e2, opcode, v2, flip, line, OpCode::MMBinK, event)
    }

    /// `e1 - k` as `e1 + (-k)` (and `e1 << k` as `e1 >> -k`) for small integer `k`.
    fn finish_binexp_neg(
        &mut self,
        e1: &mut ExprDesc,
        e2: &ExprDesc,
        op: OpCode,
        line: u32,
        event: TagMethod,
    ) -> Result<bool, CompileError> {
        let Some(i2) = Self::is_kint(e2) else {
            return Ok(false);
        };
        if !(fits_sc(i2) && i2.checked_neg().is_some_and(fits_sc)) {
            return Ok(false);
        }
        let v2 = i2 as i32;
        self.finish_binexpval(e1, e2, op, int_to_sc(-v2), false, line, OpCode::MMBinI, event)?;
        // the metamethod sees the original operand
        if let Some(mm) = self.fs.proto.code.last_mut() {
            mm.set_b(int_to_sc(v2));
        }
        Ok(true)
    }

    fn code_bin_nok(
        &mut self,
        op: BinOp,
        e1: &mut ExprDesc,
        e2: &mut ExprDesc,
        flip: bool,
        line: u32,
    ) -> Result<(), CompileError> {
        if flip {
            std::mem::swap(e1, e2);
        }
        self.code_binexpval(op, e1, e2, line)
    }

    fn code_arith(
        &mut self,
        op: BinOp,
        e1: &mut ExprDesc,
        e2: &mut ExprDesc,
        flip: bool,
        line: u32,
    ) -> Result<(), CompileError> {
        if Self::to_numeral(e2).is_some() && self.exp2k(e2)? {
            self.code_bink(op, e1, e2, flip, line)
        } else {
            self.code_bin_nok(op, e1, e2, flip, line)
        }
    }

    fn code_commutative(
        &mut self,
        op: BinOp,
        e1: &mut ExprDesc,
        e2: &mut ExprDesc,
        line: u32,
    ) -> Result<(), CompileError> {
        let mut flip = false;
        if Self::to_numeral(e1).is_some() {
            std::mem::swap(e1, e2);
            flip = true;
        }
        if op == BinOp::Add && Self::is_sc_int(e2) {
            self.code_bini(OpCode::AddI, e1, e2, flip, line, TagMethod::Add)
        } else {
            self.code_arith(op, e1, e2, flip, line)
        }
    }

    fn code_bitwise(
        &mut self,
        op: BinOp,
        e1: &mut ExprDesc,
        e2: &mut ExprDesc,
        line: u32,
    ) -> Result<(), CompileError> {
        let mut flip = false;
        if matches!(e1.kind, ExprKind::KInt(_)) {
            std::mem::swap(e1, e2);
            flip = true;
        }
        if matches!(e2.kind, ExprKind::KInt(_)) && self.exp2k(e2)? {
            self.code_bink(op, e1, e2, flip, line)
        } else {
            self.code_bin_nok(op, e1, e2, flip, line)
        }
    }

    /// Extend a `CONCAT` produced by the right operand, or start a new one.
    fn code_concat(&mut self, e1: &mut ExprDesc, e2: &ExprDesc, line: u32) {
        let first = Self::operand(e1);
        if let Some(pc) = self.previous_instruction() {
            let inst = self.fs.proto.code[pc];
            if inst.opcode() == OpCode::Concat {
                let n = inst.b();
                debug_assert_eq!(first + 1, inst.a());
                self.free_exp(e2);
                let inst = &mut self.fs.proto.code[pc];
                inst.set_a(first);
                inst.set_b(n + 1);
                return;
            }
        }
        self.code_abc(OpCode::Concat, first, 2, 0, false);
        self.free_exp(e2);
        self.fix_line(line);
    }

    fn code_eq(&mut self, op: BinOp, e1: &mut ExprDesc, e2: &mut ExprDesc) -> Result<(), CompileError> {
        if !matches!(e1.kind, ExprKind::NonReloc(_)) {
            // e1 is a constant operand; compare with the register on the left
            std::mem::swap(e1, e2);
        }
        let r1 = self.exp2anyreg(e1)?;
        let (opcode, r2, is_float) = if let Some((imm, is_float)) = Self::is_sc_number(e2) {
            (OpCode::EqI, imm, is_float)
        } else if self.exp2rk(e2)? {
            (OpCode::EqK, Self::operand(e2), false)
        } else {
            let r2 = self.exp2anyreg(e2)?;
            (OpCode::Eq, r2, false)
        };
        self.free_exps(e1, e2);
        let pc = self.cond_jump(opcode, r1, r2, is_float as u8, op == BinOp::Eq);
        e1.kind = ExprKind::Jmp(pc);
        Ok(())
    }

    fn code_order(&mut self, op: BinOp, e1: &mut ExprDesc, e2: &mut ExprDesc) -> Result<(), CompileError> {
        let less = op == BinOp::Lt;
        let (opcode, r1, r2, is_float) = if let Some((imm, is_float)) = Self::is_sc_number(e2) {
            let r1 = self.exp2anyreg(e1)?;
            let opcode = if less { OpCode::LtI } else { OpCode::LeI };
            (opcode, r1, imm, is_float)
        } else if let Some((imm, is_float)) = Self::is_sc_number(e1) {
            // k < b is b > k; k <= b is b >= k
            let r1 = self.exp2anyreg(e2)?;
            let opcode = if less { OpCode::GtI } else { OpCode::GeI };
            (opcode, r1, imm, is_float)
        } else {
            let r1 = self.exp2anyreg(e1)?;
            let r2 = self.exp2anyreg(e2)?;
            let opcode = if less { OpCode::Lt } else { OpCode::Le };
            (opcode, r1, r2, false)
        };
        self.free_exps(e1, e2);
        let pc = self.cond_jump(opcode, r1, r2, is_float as u8, true);
        e1.kind = ExprKind::Jmp(pc);
        Ok(())
    }

    // ---- Tables ----

    /// Fill in the size hints of the `NEWTABLE` at `pc` and its `EXTRAARG`.
    pub(super) fn set_table_size(&mut self, pc: usize, reg: u8, array: usize, hash: usize) {
        let rb = if hash != 0 { ceil_log2(hash) + 1 } else { 0 };
        let extra = array / (MAX_C as usize + 1);
        let rc = array % (MAX_C as usize + 1);
        let code = &mut self.fs.proto.code;
        code[pc] = Instruction::abc(OpCode::NewTable, reg, rb as u8, rc as u8, extra > 0);
        code[pc + 1] = Instruction::ax(OpCode::ExtraArg, extra as u32);
    }

    /// Store `tostore` pending list items (-1: up to the top) after `nelems` stored ones.
    pub(super) fn set_list(&mut self, base: u8, nelems: usize, tostore: i32) {
        let tostore = if tostore == -1 { 0 } else { tostore as u8 };
        if nelems <= MAX_C as usize {
            self.code_abc(OpCode::SetList, base, tostore, nelems as u8, false);
        } else {
            let extra = nelems / (MAX_C as usize + 1);
            let low = nelems % (MAX_C as usize + 1);
            self.code_abc(OpCode::SetList, base, tostore, low as u8, true);
            self.code_extra_arg(extra as u32);
        }
        self.fs.free_reg = base as usize + 1;
    }

    // ---- Finishing ----

    /// Final pass over a completed function: settle return flavors and
    /// short-circuit jump chains.
    pub(super) fn finish(&mut self) -> Result<(), CompileError> {
        let needclose = self.fs.needclose;
        let is_vararg = self.fs.proto.is_vararg;
        let nparams = self.fs.proto.num_params;
        for pc in 0..self.fs.proto.code.len() {
            let inst = &mut self.fs.proto.code[pc];
            match inst.opcode() {
                op @ (OpCode::Return0 | OpCode::Return1 | OpCode::Return | OpCode::TailCall) => {
                    if matches!(op, OpCode::Return0 | OpCode::Return1) {
                        if !(needclose || is_vararg) {
                            continue;
                        }
                        inst.set_opcode(OpCode::Return);
                    }
                    if needclose {
                        inst.set_k(true);
                    }
                    if is_vararg {
                        inst.set_c(nparams + 1);
                    }
                }
                OpCode::Jmp => {
                    let target = self.final_target(pc);
                    self.fix_jump(pc, target)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Follow a chain of unconditional jumps (bounded, so cycles terminate).
    fn final_target(&self, mut pc: usize) -> usize {
        let code = &self.fs.proto.code;
        for _ in 0..100 {
            let inst = code[pc];
            if inst.opcode() != OpCode::Jmp {
                break;
            }
            pc = (pc as i64 + inst.get_sj() as i64 + 1) as usize;
        }
        pc
    }
}
