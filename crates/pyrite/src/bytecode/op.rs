use strum::FromRepr;

/// Bytecode instruction opcodes.
///
/// Operand encoding is little-endian and noted per variant. Jump operands are
/// i16 offsets relative to the position after the operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u8)]
pub(crate) enum Opcode {
    /// u16 constant pool index.
    LoadConst,
    LoadNone,
    LoadTrue,
    LoadFalse,
    /// i8 immediate integer.
    LoadSmallInt,

    Pop,
    Nop,

    /// u8 local slot.
    LoadLocal,
    /// u16 local slot.
    LoadLocalW,
    /// u8 local slot.
    StoreLocal,
    /// u16 local slot.
    StoreLocalW,
    /// u8 cell index (own cells first, then captured).
    LoadCell,
    /// u8 cell index.
    StoreCell,
    /// u16 global slot.
    LoadGlobal,
    /// u16 global slot.
    StoreGlobal,

    /// u16 attribute name id.
    LoadAttr,
    /// u16 attribute name id; stack: value, obj -> .
    StoreAttr,
    /// stack: obj, key -> value.
    LoadIndex,
    /// stack: value, obj, key -> .
    StoreIndex,

    Add,
    Sub,
    Mul,
    FloorDiv,
    Mod,
    UnaryNeg,
    UnaryNot,

    CompareEq,
    CompareNe,
    CompareLt,
    CompareLe,
    CompareGt,
    CompareGe,

    /// i16 offset.
    Jump,
    /// i16 offset; pops the condition.
    JumpIfFalse,
    /// i16 offset; pops the condition.
    JumpIfTrue,
    /// i16 offset; jumps keeping the value, otherwise pops.
    JumpIfFalseOrPop,
    /// i16 offset; jumps keeping the value, otherwise pops.
    JumpIfTrueOrPop,
    /// stack: iterable -> iterator.
    GetIter,
    /// i16 offset; pushes the next value, or pops the iterator and jumps when exhausted.
    ForIter,

    /// u8 argument count; stack: callee, args... -> result.
    CallFunction,
    /// u8 builtin id + u8 argument count; stack: args... -> result.
    CallBuiltin,
    /// u16 method name id + u8 argument count; stack: obj, args... -> result.
    CallMethod,
    ReturnValue,

    /// u16 element count.
    BuildList,
    /// u16 entry count; stack: k1, v1, ... -> dict.
    BuildDict,
    /// u16 class name id + u8 method count + per method (u16 name id, u16 function id).
    BuildClass,
    /// u16 function id.
    MakeFunction,
    /// u16 function id + u8 capture count + per capture u8 enclosing cell index.
    MakeClosure,

    /// u8 has-prompt flag; suspends the VM until the host supplies input.
    Input,
}

impl Opcode {
    /// Fixed stack effect, or `None` when it depends on operands.
    pub(crate) fn stack_effect(self) -> Option<i16> {
        match self {
            Self::LoadConst
            | Self::LoadNone
            | Self::LoadTrue
            | Self::LoadFalse
            | Self::LoadSmallInt
            | Self::LoadLocal
            | Self::LoadLocalW
            | Self::LoadCell
            | Self::LoadGlobal
            | Self::MakeFunction
            | Self::MakeClosure
            | Self::BuildClass => Some(1),
            Self::Nop | Self::Jump | Self::LoadAttr | Self::GetIter | Self::UnaryNeg | Self::UnaryNot => Some(0),
            Self::Pop
            | Self::StoreLocal
            | Self::StoreLocalW
            | Self::StoreCell
            | Self::StoreGlobal
            | Self::JumpIfFalse
            | Self::JumpIfTrue
            | Self::ReturnValue => Some(-1),
            Self::StoreAttr => Some(-2),
            Self::LoadIndex
            | Self::Add
            | Self::Sub
            | Self::Mul
            | Self::FloorDiv
            | Self::Mod
            | Self::CompareEq
            | Self::CompareNe
            | Self::CompareLt
            | Self::CompareLe
            | Self::CompareGt
            | Self::CompareGe => Some(-1),
            Self::StoreIndex => Some(-3),
            // Operand-dependent effects handled by the builder.
            Self::Input
            | Self::CallFunction
            | Self::CallBuiltin
            | Self::CallMethod
            | Self::BuildList
            | Self::BuildDict
            | Self::JumpIfFalseOrPop
            | Self::JumpIfTrueOrPop
            | Self::ForIter => None,
        }
    }
}
