/// Instruction set and encoding.
///
/// Instructions are 32 bits wide:
/// - iABC: `op:7 | A:8 | k:1 | B:8 | C:8`
/// - iABx: `op:7 | A:8 | Bx:17` (unsigned)
/// - iAsBx: `op:7 | A:8 | sBx:17` (excess-K signed)
/// - iAx: `op:7 | Ax:25`
/// - isJ: `op:7 | sJ:25` (excess-K signed)
use std::fmt;

const SIZE_OP: u32 = 7;
const SIZE_A: u32 = 8;
const SIZE_B: u32 = 8;
const SIZE_C: u32 = 8;
const SIZE_BX: u32 = SIZE_C + SIZE_B + 1; // 17
const SIZE_AX: u32 = SIZE_BX + SIZE_A; // 25
const SIZE_SJ: u32 = SIZE_BX + SIZE_A; // 25

const POS_OP: u32 = 0;
const POS_A: u32 = POS_OP + SIZE_OP; // 7
const POS_K: u32 = POS_A + SIZE_A; // 15
const POS_B: u32 = POS_K + 1; // 16
const POS_C: u32 = POS_B + SIZE_B; // 24
const POS_BX: u32 = POS_K;
const POS_AX: u32 = POS_A;
const POS_SJ: u32 = POS_A;

const fn mask(n: u32) -> u32 {
    (1 << n) - 1
}

pub const MAX_A: u32 = mask(SIZE_A);
pub const MAX_B: u32 = mask(SIZE_B);
pub const MAX_C: u32 = mask(SIZE_C);
pub const MAX_BX: u32 = mask(SIZE_BX);
pub const MAX_AX: u32 = mask(SIZE_AX);
pub const MAX_SJ: u32 = mask(SIZE_SJ);

pub const OFFSET_SBX: i32 = (MAX_BX >> 1) as i32;
pub const OFFSET_SJ: i32 = (MAX_SJ >> 1) as i32;
pub const OFFSET_SC: i32 = (MAX_C >> 1) as i32;

/// "No register" marker used when patching `TESTSET`.
pub const NO_REG: u8 = MAX_A as u8;

/// Largest register count a function may use.
pub const MAX_REGS: usize = 255;

/// Largest constant index addressable by an RK operand.
pub const MAX_INDEX_RK: u32 = MAX_B;

/// Whether `i` fits a signed `sBx` operand.
pub fn fits_sbx(i: i64) -> bool {
    (-(OFFSET_SBX as i64)..=(MAX_BX as i64 - OFFSET_SBX as i64)).contains(&i)
}

/// Whether `i` fits a signed `sC` operand.
pub fn fits_sc(i: i64) -> bool {
    (-(OFFSET_SC as i64)..=(MAX_C as i64 - OFFSET_SC as i64)).contains(&i)
}

/// Encode a signed value into an excess-K `sC` operand.
pub fn int_to_sc(i: i32) -> u8 {
    (i + OFFSET_SC) as u8
}

/// Decode an excess-K `sC`/`sB` operand.
pub fn sc_to_int(c: u8) -> i32 {
    c as i32 - OFFSET_SC
}

/// All 83 opcodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Move = 0,
    LoadI,
    LoadF,
    LoadK,
    LoadKX,
    LoadFalse,
    LFalseSkip,
    LoadTrue,
    LoadNil,
    GetUpval,
    SetUpval,
    GetTabUp,
    GetTable,
    GetI,
    GetField,
    SetTabUp,
    SetTable,
    SetI,
    SetField,
    NewTable,
    Self_,
    AddI,
    AddK,
    SubK,
    MulK,
    ModK,
    PowK,
    DivK,
    IDivK,
    BAndK,
    BOrK,
    BXorK,
    ShrI,
    ShlI,
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
    MMBin,
    MMBinI,
    MMBinK,
    Unm,
    BNot,
    Not,
    Len,
    Concat,
    Close,
    Tbc,
    Jmp,
    Eq,
    Lt,
    Le,
    EqK,
    EqI,
    LtI,
    LeI,
    GtI,
    GeI,
    Test,
    TestSet,
    Call,
    TailCall,
    Return,
    Return0,
    Return1,
    ForLoop,
    ForPrep,
    TForPrep,
    TForCall,
    TForLoop,
    SetList,
    Closure,
    VarArg,
    VarArgPrep,
    ExtraArg,
}

const ALL_OPCODES: [OpCode; OpCode::COUNT] = {
    use OpCode::*;
    [
        Move, LoadI, LoadF, LoadK, LoadKX, LoadFalse, LFalseSkip, LoadTrue, LoadNil, GetUpval,
        SetUpval, GetTabUp, GetTable, GetI, GetField, SetTabUp, SetTable, SetI, SetField, NewTable,
        Self_, AddI, AddK, SubK, MulK, ModK, PowK, DivK, IDivK, BAndK, BOrK, BXorK, ShrI, ShlI, Add,
        Sub, Mul, Mod, Pow, Div, IDiv, BAnd, BOr, BXor, Shl, Shr, MMBin, MMBinI, MMBinK, Unm, BNot,
        Not, Len, Concat, Close, Tbc, Jmp, Eq, Lt, Le, EqK, EqI, LtI, LeI, GtI, GeI, Test, TestSet,
        Call, TailCall, Return, Return0, Return1, ForLoop, ForPrep, TForPrep, TForCall, TForLoop,
        SetList, Closure, VarArg, VarArgPrep, ExtraArg,
    ]
};

impl OpCode {
    /// Number of opcodes.
    pub const COUNT: usize = 83;

    /// Get the opcode from a u8 value.
    pub fn from_u8(val: u8) -> Option<OpCode> {
        ALL_OPCODES.get(val as usize).copied()
    }

    /// Get the instruction format for this opcode.
    pub fn format(self) -> InstructionFormat {
        use OpCode::*;
        match self {
            ExtraArg => InstructionFormat::IAx,
            Jmp => InstructionFormat::IsJ,
            LoadI | LoadF | ForLoop | ForPrep | TForPrep | TForLoop => InstructionFormat::IAsBx,
            LoadK | LoadKX | Closure => InstructionFormat::IABx,
            _ => InstructionFormat::IABC,
        }
    }

    /// Whether the instruction is a test: the next instruction must be a jump.
    pub fn is_test(self) -> bool {
        use OpCode::*;
        matches!(
            self,
            Eq | Lt | Le | EqK | EqI | LtI | LeI | GtI | GeI | Test | TestSet
        )
    }

    /// Whether the instruction writes register A.
    pub fn sets_a(self) -> bool {
        use OpCode::*;
        !matches!(
            self,
            SetUpval
                | SetTabUp
                | SetTable
                | SetI
                | SetField
                | MMBin
                | MMBinI
                | MMBinK
                | Close
                | Tbc
                | Jmp
                | Eq
                | Lt
                | Le
                | EqK
                | EqI
                | LtI
                | LeI
                | GtI
                | GeI
                | Test
                | Return
                | Return0
                | Return1
                | TForPrep
                | TForCall
                | SetList
                | VarArgPrep
                | ExtraArg
        )
    }

    /// Get the name of this opcode.
    pub fn name(self) -> &'static str {
        use OpCode::*;
        match self {
            Move => "MOVE",
            LoadI => "LOADI",
            LoadF => "LOADF",
            LoadK => "LOADK",
            LoadKX => "LOADKX",
            LoadFalse => "LOADFALSE",
            LFalseSkip => "LFALSESKIP",
            LoadTrue => "LOADTRUE",
            LoadNil => "LOADNIL",
            GetUpval => "GETUPVAL",
            SetUpval => "SETUPVAL",
            GetTabUp => "GETTABUP",
            GetTable => "GETTABLE",
            GetI => "GETI",
            GetField => "GETFIELD",
            SetTabUp => "SETTABUP",
            SetTable => "SETTABLE",
            SetI => "SETI",
            SetField => "SETFIELD",
            NewTable => "NEWTABLE",
            Self_ => "SELF",
            AddI => "ADDI",
            AddK => "ADDK",
            SubK => "SUBK",
            MulK => "MULK",
            ModK => "MODK",
            PowK => "POWK",
            DivK => "DIVK",
            IDivK => "IDIVK",
            BAndK => "BANDK",
            BOrK => "BORK",
            BXorK => "BXORK",
            ShrI => "SHRI",
            ShlI => "SHLI",
            Add => "ADD",
            Sub => "SUB",
            Mul => "MUL",
            Mod => "MOD",
            Pow => "POW",
            Div => "DIV",
            IDiv => "IDIV",
            BAnd => "BAND",
            BOr => "BOR",
            BXor => "BXOR",
            Shl => "SHL",
            Shr => "SHR",
            MMBin => "MMBIN",
            MMBinI => "MMBINI",
            MMBinK => "MMBINK",
            Unm => "UNM",
            BNot => "BNOT",
            Not => "NOT",
            Len => "LEN",
            Concat => "CONCAT",
            Close => "CLOSE",
            Tbc => "TBC",
            Jmp => "JMP",
            Eq => "EQ",
            Lt => "LT",
            Le => "LE",
            EqK => "EQK",
            EqI => "EQI",
            LtI => "LTI",
            LeI => "LEI",
            GtI => "GTI",
            GeI => "GEI",
            Test => "TEST",
            TestSet => "TESTSET",
            Call => "CALL",
            TailCall => "TAILCALL",
            Return => "RETURN",
            Return0 => "RETURN0",
            Return1 => "RETURN1",
            ForLoop => "FORLOOP",
            ForPrep => "FORPREP",
            TForPrep => "TFORPREP",
            TForCall => "TFORCALL",
            TForLoop => "TFORLOOP",
            SetList => "SETLIST",
            Closure => "CLOSURE",
            VarArg => "VARARG",
            VarArgPrep => "VARARGPREP",
            ExtraArg => "EXTRAARG",
        }
    }
}

/// Metamethod events, as encoded in the C operand of `MMBIN*`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TagMethod {
    Index = 0,
    NewIndex,
    Gc,
    Mode,
    Len,
    Eq,
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
    Unm,
    BNot,
    Lt,
    Le,
    Concat,
    Call,
    Close,
}

/// Instruction format types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstructionFormat {
    IABC,
    IABx,
    IAsBx,
    IAx,
    IsJ,
}

/// A 32-bit bytecode instruction.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Instruction(pub u32);

impl Instruction {
    // ---- Constructors ----

    /// Create an iABC instruction.
    pub fn abc(op: OpCode, a: u8, b: u8, c: u8, k: bool) -> Self {
        Instruction(
            (op as u32) << POS_OP
                | (a as u32) << POS_A
                | (k as u32) << POS_K
                | (b as u32) << POS_B
                | (c as u32) << POS_C,
        )
    }

    /// Create an iABx instruction.
    pub fn abx(op: OpCode, a: u8, bx: u32) -> Self {
        debug_assert!(bx <= MAX_BX, "Bx out of range: {bx}");
        Instruction((op as u32) << POS_OP | (a as u32) << POS_A | bx << POS_BX)
    }

    /// Create an iAsBx instruction.
    pub fn asbx(op: OpCode, a: u8, sbx: i32) -> Self {
        debug_assert!(fits_sbx(sbx as i64), "sBx out of range: {sbx}");
        Self::abx(op, a, (sbx + OFFSET_SBX) as u32)
    }

    /// Create an iAx instruction.
    pub fn ax(op: OpCode, ax: u32) -> Self {
        debug_assert!(ax <= MAX_AX, "Ax out of range: {ax}");
        Instruction((op as u32) << POS_OP | ax << POS_AX)
    }

    /// Create an isJ instruction.
    pub fn sj(op: OpCode, sj: i32) -> Self {
        let biased = (sj + OFFSET_SJ) as u32;
        debug_assert!(biased <= MAX_SJ, "sJ out of range: {sj}");
        Instruction((op as u32) << POS_OP | biased << POS_SJ)
    }

    // ---- Decoders ----

    fn field(&self, pos: u32, size: u32) -> u32 {
        (self.0 >> pos) & mask(size)
    }

    fn set_field(&mut self, pos: u32, size: u32, value: u32) {
        self.0 = (self.0 & !(mask(size) << pos)) | ((value & mask(size)) << pos);
    }

    pub fn opcode(&self) -> OpCode {
        OpCode::from_u8(self.field(POS_OP, SIZE_OP) as u8).unwrap_or(OpCode::ExtraArg)
    }

    pub fn k(&self) -> bool {
        self.field(POS_K, 1) != 0
    }

    pub fn a(&self) -> u8 {
        self.field(POS_A, SIZE_A) as u8
    }

    pub fn b(&self) -> u8 {
        self.field(POS_B, SIZE_B) as u8
    }

    pub fn c(&self) -> u8 {
        self.field(POS_C, SIZE_C) as u8
    }

    pub fn bx(&self) -> u32 {
        self.field(POS_BX, SIZE_BX)
    }

    pub fn sbx(&self) -> i32 {
        self.bx() as i32 - OFFSET_SBX
    }

    pub fn get_ax(&self) -> u32 {
        self.field(POS_AX, SIZE_AX)
    }

    pub fn get_sj(&self) -> i32 {
        self.field(POS_SJ, SIZE_SJ) as i32 - OFFSET_SJ
    }

    // ---- Mutators (for backpatching) ----

    pub fn set_opcode(&mut self, op: OpCode) {
        self.set_field(POS_OP, SIZE_OP, op as u32);
    }

    pub fn set_a(&mut self, a: u8) {
        self.set_field(POS_A, SIZE_A, a as u32);
    }

    pub fn set_b(&mut self, b: u8) {
        self.set_field(POS_B, SIZE_B, b as u32);
    }

    pub fn set_c(&mut self, c: u8) {
        self.set_field(POS_C, SIZE_C, c as u32);
    }

    pub fn set_k(&mut self, k: bool) {
        self.set_field(POS_K, 1, k as u32);
    }

    pub fn set_bx(&mut self, bx: u32) {
        self.set_field(POS_BX, SIZE_BX, bx);
    }

    pub fn set_sj(&mut self, sj: i32) {
        self.set_field(POS_SJ, SIZE_SJ, (sj + OFFSET_SJ) as u32);
    }
}

impl fmt::Debug for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = self.opcode();
        write!(f, "{}", op.name())?;
        match op.format() {
            InstructionFormat::IABC => {
                write!(f, " A={} B={} C={}", self.a(), self.b(), self.c())?;
                if self.k() {
                    write!(f, " k")?;
                }
            }
            InstructionFormat::IABx => write!(f, " A={} Bx={}", self.a(), self.bx())?,
            InstructionFormat::IAsBx => write!(f, " A={} sBx={}", self.a(), self.sbx())?,
            InstructionFormat::IAx => write!(f, " Ax={}", self.get_ax())?,
            InstructionFormat::IsJ => write!(f, " sJ={}", self.get_sj())?,
        }
        Ok(())
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
