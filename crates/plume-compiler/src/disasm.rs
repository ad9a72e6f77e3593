/// Bytecode listings in the style of `luac -l -l`.
use crate::opcode::{sc_to_int, Instruction, InstructionFormat, OpCode, OFFSET_SC};
use crate::proto::{Constant, Proto};
use plume_core::string::StringInterner;
use std::fmt::{self, Write};

/// Render a prototype and all its nested functions.
pub fn disassemble(proto: &Proto, strings: &StringInterner) -> String {
    Listing { proto, strings }.to_string()
}

/// A prototype tree paired with the strings its constants refer to.
pub struct Listing<'a> {
    pub proto: &'a Proto,
    pub strings: &'a StringInterner,
}

impl fmt::Display for Listing<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut path = Vec::new();
        self.write_proto(f, self.proto, &mut path)
    }
}

impl Listing<'_> {
    fn write_proto(&self, f: &mut impl Write, p: &Proto, path: &mut Vec<usize>) -> fmt::Result {
        let what = if path.is_empty() { "main" } else { "function" };
        let id: Vec<String> = path.iter().map(|i| i.to_string()).collect();
        let vararg = if p.is_vararg { "+" } else { "" };
        writeln!(
            f,
            "{what} <{}:{}> ({} instructions)",
            if id.is_empty() { "0".to_string() } else { id.join(".") },
            p.line_defined,
            p.code.len()
        )?;
        writeln!(
            f,
            "{}{vararg} params, {} slots, {} upvalues, {} locals, {} constants, {} functions",
            p.num_params,
            p.max_stack_size,
            p.upvalues.len(),
            p.local_vars.len(),
            p.constants.len(),
            p.protos.len(),
        )?;

        for (pc, inst) in p.code.iter().enumerate() {
            let line = p.line_of(pc);
            write!(f, "\t{}\t[{line}]\t{:<10}\t", pc + 1, inst.opcode().name())?;
            self.write_operands(f, p, pc, *inst)?;
            writeln!(f)?;
        }

        writeln!(f, "constants ({}):", p.constants.len())?;
        for (i, k) in p.constants.iter().enumerate() {
            write!(f, "\t{i}\t")?;
            self.write_constant(f, k)?;
            writeln!(f)?;
        }
        writeln!(f, "locals ({}):", p.local_vars.len())?;
        for (i, var) in p.local_vars.iter().enumerate() {
            writeln!(
                f,
                "\t{i}\t{}\t{}\t{}",
                self.strings.get_str(var.name),
                var.start_pc + 1,
                var.end_pc + 1
            )?;
        }
        writeln!(f, "upvalues ({}):", p.upvalues.len())?;
        for (i, up) in p.upvalues.iter().enumerate() {
            let name = up.name.map_or("-".into(), |id| self.strings.get_str(id));
            writeln!(f, "\t{i}\t{name}\t{}\t{}", u8::from(up.in_stack), up.index)?;
        }

        for (i, child) in p.protos.iter().enumerate() {
            writeln!(f)?;
            path.push(i);
            self.write_proto(f, child, path)?;
            path.pop();
        }
        Ok(())
    }

    fn write_operands(&self, f: &mut impl Write, p: &Proto, pc: usize, inst: Instruction) -> fmt::Result {
        let op = inst.opcode();
        match op.format() {
            InstructionFormat::IABC => {
                write!(f, "{} {} {}", inst.a(), inst.b(), inst.c())?;
                if inst.k() {
                    write!(f, "k")?;
                }
            }
            InstructionFormat::IABx => write!(f, "{} {}", inst.a(), inst.bx())?,
            InstructionFormat::IAsBx => write!(f, "{} {}", inst.a(), inst.sbx())?,
            InstructionFormat::IAx => write!(f, "{}", inst.get_ax())?,
            InstructionFormat::IsJ => write!(f, "{}", inst.get_sj())?,
        }

        let k = |idx: u32| p.constants.get(idx as usize);
        match op {
            OpCode::LoadK => self.comment_constant(f, k(inst.bx()))?,
            OpCode::GetTabUp | OpCode::GetField => self.comment_constant(f, k(inst.c() as u32))?,
            OpCode::SetTabUp | OpCode::SetField => {
                self.comment_constant(f, k(inst.b() as u32))?;
                if inst.k() {
                    write!(f, " ")?;
                    self.write_opt_constant(f, k(inst.c() as u32))?;
                }
            }
            OpCode::SetTable | OpCode::SetI | OpCode::Self_ if inst.k() => {
                self.comment_constant(f, k(inst.c() as u32))?;
            }
            OpCode::AddK
            | OpCode::SubK
            | OpCode::MulK
            | OpCode::ModK
            | OpCode::PowK
            | OpCode::DivK
            | OpCode::IDivK
            | OpCode::BAndK
            | OpCode::BOrK
            | OpCode::BXorK => self.comment_constant(f, k(inst.c() as u32))?,
            OpCode::EqK => self.comment_constant(f, k(inst.b() as u32))?,
            OpCode::AddI | OpCode::ShrI | OpCode::ShlI => write!(f, "\t; {}", sc_to_int(inst.c()))?,
            OpCode::EqI | OpCode::LtI | OpCode::LeI | OpCode::GtI | OpCode::GeI => {
                write!(f, "\t; {}", sc_to_int(inst.b()))?
            }
            OpCode::MMBinI => write!(f, "\t; {}", inst.b() as i32 - OFFSET_SC)?,
            OpCode::Jmp => write!(f, "\t; to {}", pc as i64 + inst.get_sj() as i64 + 2)?,
            OpCode::ForPrep | OpCode::TForPrep => write!(f, "\t; to {}", pc + inst.bx() as usize + 2)?,
            OpCode::ForLoop | OpCode::TForLoop => {
                write!(f, "\t; to {}", (pc + 2).saturating_sub(inst.bx() as usize))?
            }
            OpCode::Closure => write!(f, "\t; function {}", inst.bx())?,
            OpCode::GetUpval | OpCode::SetUpval => {
                let name = p.upvalues.get(inst.b() as usize).and_then(|up| up.name);
                if let Some(id) = name {
                    write!(f, "\t; {}", self.strings.get_str(id))?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn comment_constant(&self, f: &mut impl Write, k: Option<&Constant>) -> fmt::Result {
        write!(f, "\t; ")?;
        self.write_opt_constant(f, k)
    }

    fn write_opt_constant(&self, f: &mut impl Write, k: Option<&Constant>) -> fmt::Result {
        match k {
            Some(k) => self.write_constant(f, k),
            None => write!(f, "?"),
        }
    }

    fn write_constant(&self, f: &mut impl Write, k: &Constant) -> fmt::Result {
        match k {
            Constant::Nil => write!(f, "nil"),
            Constant::Boolean(b) => write!(f, "{b}"),
            Constant::Integer(i) => write!(f, "{i}"),
            Constant::Float(n) if n.fract() == 0.0 && n.is_finite() => write!(f, "{n:.1}"),
            Constant::Float(n) => write!(f, "{n}"),
            Constant::String(id) => write!(f, "{:?}", self.strings.get_str(*id)),
        }
    }
}
