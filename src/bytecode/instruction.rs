use std::fmt;

/// A stack-based bytecode operation with its optional typed operand.
///
/// Only the opcode families the analysis pipeline actually reasons about are
/// modeled explicitly; everything else collapses into [`Opcode::Other`] with
/// an explicit stack delta so the resolver's walk still balances.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub offset: u32,
    pub opcode: Opcode,
    pub operand: Operand,
}

impl Instruction {
    pub fn new(offset: u32, opcode: Opcode, operand: Operand) -> Self {
        Self {
            offset,
            opcode,
            operand,
        }
    }

    /// `(pops, pushes)` for this instruction, per the CIL stack-behavior table.
    pub fn stack_delta(&self) -> (u16, u16) {
        match &self.opcode {
            Opcode::Call | Opcode::CallVirt => {
                let (params, has_this, returns_void) = match &self.operand {
                    Operand::Method(m) => (m.param_count, m.has_this, m.returns_void),
                    _ => (0, false, true),
                };
                (params + u16::from(has_this), u16::from(!returns_void))
            }
            Opcode::NewObj => {
                let params = match &self.operand {
                    Operand::Method(m) => m.param_count,
                    _ => 0,
                };
                (params, 1)
            }
            Opcode::LdStr
            | Opcode::LdcI4
            | Opcode::LdNull
            | Opcode::LdLoc(_)
            | Opcode::LdArg(_)
            | Opcode::LdFld(_)
            | Opcode::LdsFld(_)
            | Opcode::LdFtn(_)
            | Opcode::LdToken(_) => (0, 1),
            Opcode::StLoc(_) | Opcode::StArg(_) => (1, 0),
            Opcode::StFld(_) | Opcode::StsFld(_) => (1, 0),
            Opcode::Box => (1, 1),
            Opcode::Dup => (1, 2),
            Opcode::Pop => (1, 0),
            Opcode::Nop | Opcode::Other { .. } => match &self.opcode {
                Opcode::Other { pops, pushes, .. } => (*pops, *pushes),
                _ => (0, 0),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Opcode {
    Call,
    CallVirt,
    NewObj,
    LdStr,
    LdcI4,
    LdNull,
    LdLoc(u16),
    StLoc(u16),
    LdArg(u16),
    StArg(u16),
    LdFld(FieldRef),
    StFld(FieldRef),
    LdsFld(FieldRef),
    StsFld(FieldRef),
    LdFtn(MethodRef),
    LdToken(TokenRef),
    Box,
    Dup,
    Pop,
    Nop,
    /// Any opcode not otherwise modeled; stack effect is still tracked so
    /// the backward slice never desyncs on unrecognized instructions.
    Other {
        mnemonic: &'static str,
        pops: u16,
        pushes: u16,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Method(MethodRef),
    Field(FieldRef),
    Type(TypeRef),
    Token(TokenRef),
    Local(u16),
    Arg(u16),
    String(String),
    Int(i64),
    SByte(i8),
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodRef {
    pub declaring_type: String,
    pub name: String,
    pub param_count: u16,
    pub has_this: bool,
    pub returns_void: bool,
}

impl MethodRef {
    /// `Namespace.Type.Method` without the declaring assembly, used both for
    /// display and as half of the call-graph dedup key.
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.declaring_type, self.name)
    }
}

impl fmt::Display for MethodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.full_name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldRef {
    pub declaring_type: String,
    pub name: String,
    pub is_static: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TypeRef {
    pub full_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TokenRef {
    Method(MethodRef),
    Field(FieldRef),
    Type(TypeRef),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn void_call(name: &str, params: u16, has_this: bool) -> Instruction {
        Instruction::new(
            0,
            Opcode::Call,
            Operand::Method(MethodRef {
                declaring_type: "System.Console".into(),
                name: name.into(),
                param_count: params,
                has_this,
                returns_void: true,
            }),
        )
    }

    #[test]
    fn call_pops_args_plus_this() {
        let i = void_call("WriteLine", 1, false);
        assert_eq!(i.stack_delta(), (1, 0));
    }

    #[test]
    fn instance_call_pops_receiver_too() {
        let i = void_call("Dispose", 0, true);
        assert_eq!(i.stack_delta(), (1, 0));
    }

    #[test]
    fn newobj_always_pushes_one() {
        let i = Instruction::new(
            0,
            Opcode::NewObj,
            Operand::Method(MethodRef {
                declaring_type: "System.Diagnostics.ProcessStartInfo".into(),
                name: ".ctor".into(),
                param_count: 1,
                has_this: true,
                returns_void: true,
            }),
        );
        assert_eq!(i.stack_delta(), (1, 1));
    }
}
