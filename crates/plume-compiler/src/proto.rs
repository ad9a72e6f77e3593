/// Function prototype: holds compiled bytecode, constants, and debug info.
use crate::opcode::Instruction;
use plume_core::string::StringId;

/// Marker in `line_info` meaning "look up this pc in `abs_line_info`".
pub const ABS_LINE_INFO: i8 = i8::MIN;

/// Max instructions between two absolute line checkpoints.
pub const MAX_INSTRUCTIONS_WITHOUT_ABS: u8 = 128;

/// A constant value in the constant pool.
#[derive(Clone, Debug, PartialEq)]
pub enum Constant {
    Nil,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(StringId),
}

/// How a variable was declared.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum VarKind {
    /// Plain register-backed local.
    #[default]
    Regular,
    /// `<const>` local whose value was not a compile-time constant.
    Const,
    /// `<close>` local.
    ToClose,
    /// `<const>` local folded into a compile-time constant; it has no register.
    CompileTimeConst,
}

impl VarKind {
    /// Whether assignments to the variable are rejected.
    pub fn is_readonly(self) -> bool {
        self != VarKind::Regular
    }
}

/// Description of an upvalue.
#[derive(Clone, Debug, PartialEq)]
pub struct UpvalDesc {
    /// Name of the upvalue (for debug info).
    pub name: Option<StringId>,
    /// True if the upvalue lives in the enclosing function's registers.
    pub in_stack: bool,
    /// Register index if `in_stack`, upvalue index in the parent otherwise.
    pub index: u8,
    pub kind: VarKind,
}

/// A local variable debug entry.
#[derive(Clone, Debug, PartialEq)]
pub struct LocalVar {
    pub name: StringId,
    /// First PC where the variable is active.
    pub start_pc: u32,
    /// First PC where the variable is dead.
    pub end_pc: u32,
}

/// Absolute line checkpoint.
#[derive(Clone, Debug, PartialEq)]
pub struct AbsLineInfo {
    pub pc: u32,
    pub line: u32,
}

/// A compiled function prototype.
#[derive(Clone, Debug, Default)]
pub struct Proto {
    /// Bytecode instructions.
    pub code: Vec<Instruction>,
    /// Constant pool.
    pub constants: Vec<Constant>,
    /// Nested function prototypes.
    pub protos: Vec<Proto>,
    /// Upvalue descriptors.
    pub upvalues: Vec<UpvalDesc>,
    /// Number of fixed parameters.
    pub num_params: u8,
    /// Whether this function accepts varargs.
    pub is_vararg: bool,
    /// Maximum stack size needed.
    pub max_stack_size: u8,
    /// Source name (for error messages).
    pub source: Option<StringId>,
    pub line_defined: u32,
    pub last_line_defined: u32,

    // --- Debug info ---
    /// Line delta from the previous instruction, or `ABS_LINE_INFO`.
    pub line_info: Vec<i8>,
    /// Absolute checkpoints for large deltas and long runs.
    pub abs_line_info: Vec<AbsLineInfo>,
    /// Local variable debug info.
    pub local_vars: Vec<LocalVar>,
}

impl Proto {
    /// Create a new empty prototype.
    pub fn new() -> Self {
        Proto {
            max_stack_size: 2,
            ..Default::default()
        }
    }

    /// Get the number of instructions.
    pub fn code_len(&self) -> usize {
        self.code.len()
    }

    /// Source line of the instruction at `pc`.
    pub fn line_of(&self, pc: usize) -> u32 {
        if pc >= self.line_info.len() {
            return 0;
        }
        // nearest checkpoint at or before pc, or the function header
        let idx = self.abs_line_info.partition_point(|abs| abs.pc as usize <= pc);
        let (mut line, start) = match idx.checked_sub(1).map(|i| &self.abs_line_info[i]) {
            Some(abs) => (abs.line as i64, abs.pc as usize + 1),
            None => (self.line_defined as i64, 0),
        };
        for &delta in &self.line_info[start..=pc] {
            if delta != ABS_LINE_INFO {
                line += delta as i64;
            }
        }
        line as u32
    }

    /// Name of the local variable occupying register `reg` at `pc`, if any.
    pub fn local_name(&self, reg: u8, pc: usize) -> Option<StringId> {
        let pc = pc as u32;
        self.local_vars
            .iter()
            .filter(|v| v.start_pc <= pc && pc < v.end_pc)
            .nth(reg as usize)
            .map(|v| v.name)
    }

    /// Drop spare capacity once the prototype is complete.
    pub fn shrink_to_fit(&mut self) {
        self.code.shrink_to_fit();
        self.constants.shrink_to_fit();
        self.protos.shrink_to_fit();
        self.upvalues.shrink_to_fit();
        self.line_info.shrink_to_fit();
        self.abs_line_info.shrink_to_fit();
        self.local_vars.shrink_to_fit();
    }
}
