/// Bytecode opcodes.
///
/// Every instruction is one opcode byte followed by little-endian operands
/// whose layout is given by [`Opcode::shape`]. Branch offsets are relative to
/// the start of the branching instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    // ========================================
    // Constants and stack
    // ========================================
    Nop = 0x00,
    PushUndefined = 0x01,
    PushNull = 0x02,
    PushTrue = 0x03,
    PushFalse = 0x04,
    PushInt = 0x05,      // i32
    PushDouble = 0x06,   // u64 bit pattern
    PushString = 0x07,   // u32 constant index
    PushFunction = 0x08, // u32 function index (raw code reference)
    NewClosure = 0x09,   // u32 function index, captures the current env
    PushNative = 0x0A,   // u16 native id
    PushThis = 0x0B,
    Pop = 0x0C,
    Dup = 0x0D,
    Swap = 0x0E,

    // ========================================
    // Variables
    // ========================================
    LoadArg = 0x10,     // u16
    StoreArg = 0x11,    // u16
    LoadLocal = 0x12,   // u16
    StoreLocal = 0x13,  // u16
    LoadGlobal = 0x14,  // u16
    StoreGlobal = 0x15, // u16
    LoadEnv = 0x16,     // u8 depth, u16 slot
    StoreEnv = 0x17,    // u8 depth, u16 slot
    EnterEnv = 0x18,    // u16 slot count
    LeaveEnv = 0x19,
    GetArguments = 0x1A,

    // ========================================
    // Arithmetic (dynamic numeric domain)
    // ========================================
    Add = 0x20,
    Sub = 0x21,
    Mul = 0x22,
    Div = 0x23,
    Rem = 0x24,
    BitAnd = 0x25,
    BitOr = 0x26,
    BitXor = 0x27,
    Shl = 0x28,
    Shr = 0x29,
    UShr = 0x2A,
    Neg = 0x2B,
    Plus = 0x2C,
    BitNot = 0x2D,
    Not = 0x2E,
    Typeof = 0x2F,
    PrimBinary = 0x30, // u8 op, u8 primitive type

    // ========================================
    // Comparison
    // ========================================
    Eq = 0x38,
    Ne = 0x39,
    StrictEq = 0x3A,
    StrictNe = 0x3B,
    Lt = 0x3C,
    Le = 0x3D,
    Gt = 0x3E,
    Ge = 0x3F,

    // ========================================
    // Control flow
    // ========================================
    Jump = 0x40,        // i32
    JumpIfTrue = 0x41,  // i32
    JumpIfFalse = 0x42, // i32
    Switch = 0x43,      // i32 low, u16 count, i32 default, i32 * count

    // ========================================
    // Objects
    // ========================================
    NewObject = 0x50,
    NewArray = 0x51,       // u16 element count
    GetProp = 0x52,        // [obj, key] -> [value]
    SetProp = 0x53,        // [obj, key, value] -> [value]
    GetPropByName = 0x54,  // u32 constant index
    SetPropByName = 0x55,  // u32 constant index
    InitPropByName = 0x56, // u32 constant index; [obj, value] -> [obj]
    DeleteProp = 0x57,
    In = 0x58,
    InstanceOf = 0x59,

    // ========================================
    // Calls
    // ========================================
    Call = 0x60,       // u32 function index, u8 argc; [this, args..]
    CallValue = 0x61,  // u8 argc; [callee, this, args..]
    New = 0x62,        // u8 argc; [callee, args..]
    CallNative = 0x63, // u16 native id, u8 argc; [this, args..]
    Return = 0x64,
    ReturnUndefined = 0x65,

    // ========================================
    // Exceptions
    // ========================================
    Try = 0x70, // i32 catch, i32 finally (0 = absent)
    Catch = 0x71,
    Finally = 0x72,
    EndTry = 0x73,
    Throw = 0x74,
    Gosub = 0x75, // i32
    Retsub = 0x76,

    // ========================================
    // Reserved indirect access (no semantics)
    // ========================================
    IReadFpOff32 = 0xF0,
    IAssignFpOff32 = 0xF1,
    IRead32 = 0xF2,
    IAssign32 = 0xF3,
}

/// Operand layout following the opcode byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    None,
    U8,
    U16,
    U32,
    I32,
    U64,
    /// u8 depth, u16 slot
    EnvSlot,
    /// u8 op, u8 primitive type
    Prim,
    /// u32 function index, u8 argc
    CallFn,
    /// u16 native id, u8 argc
    CallNative,
    /// i32 catch, i32 finally
    Try,
    /// Variable width
    Switch,
}

impl Shape {
    /// Operand bytes, or None for variable-width shapes.
    pub fn len(self) -> Option<usize> {
        Some(match self {
            Shape::None => 0,
            Shape::U8 => 1,
            Shape::U16 => 2,
            Shape::U32 | Shape::I32 => 4,
            Shape::U64 => 8,
            Shape::EnvSlot => 3,
            Shape::Prim => 2,
            Shape::CallFn => 5,
            Shape::CallNative => 3,
            Shape::Try => 8,
            Shape::Switch => return None,
        })
    }
}

impl Opcode {
    pub fn from_u8(byte: u8) -> Option<Opcode> {
        use Opcode::*;
        Some(match byte {
            0x00 => Nop,
            0x01 => PushUndefined,
            0x02 => PushNull,
            0x03 => PushTrue,
            0x04 => PushFalse,
            0x05 => PushInt,
            0x06 => PushDouble,
            0x07 => PushString,
            0x08 => PushFunction,
            0x09 => NewClosure,
            0x0A => PushNative,
            0x0B => PushThis,
            0x0C => Pop,
            0x0D => Dup,
            0x0E => Swap,
            0x10 => LoadArg,
            0x11 => StoreArg,
            0x12 => LoadLocal,
            0x13 => StoreLocal,
            0x14 => LoadGlobal,
            0x15 => StoreGlobal,
            0x16 => LoadEnv,
            0x17 => StoreEnv,
            0x18 => EnterEnv,
            0x19 => LeaveEnv,
            0x1A => GetArguments,
            0x20 => Add,
            0x21 => Sub,
            0x22 => Mul,
            0x23 => Div,
            0x24 => Rem,
            0x25 => BitAnd,
            0x26 => BitOr,
            0x27 => BitXor,
            0x28 => Shl,
            0x29 => Shr,
            0x2A => UShr,
            0x2B => Neg,
            0x2C => Plus,
            0x2D => BitNot,
            0x2E => Not,
            0x2F => Typeof,
            0x30 => PrimBinary,
            0x38 => Eq,
            0x39 => Ne,
            0x3A => StrictEq,
            0x3B => StrictNe,
            0x3C => Lt,
            0x3D => Le,
            0x3E => Gt,
            0x3F => Ge,
            0x40 => Jump,
            0x41 => JumpIfTrue,
            0x42 => JumpIfFalse,
            0x43 => Switch,
            0x50 => NewObject,
            0x51 => NewArray,
            0x52 => GetProp,
            0x53 => SetProp,
            0x54 => GetPropByName,
            0x55 => SetPropByName,
            0x56 => InitPropByName,
            0x57 => DeleteProp,
            0x58 => In,
            0x59 => InstanceOf,
            0x60 => Call,
            0x61 => CallValue,
            0x62 => New,
            0x63 => CallNative,
            0x64 => Return,
            0x65 => ReturnUndefined,
            0x70 => Try,
            0x71 => Catch,
            0x72 => Finally,
            0x73 => EndTry,
            0x74 => Throw,
            0x75 => Gosub,
            0x76 => Retsub,
            0xF0 => IReadFpOff32,
            0xF1 => IAssignFpOff32,
            0xF2 => IRead32,
            0xF3 => IAssign32,
            _ => return None,
        })
    }

    pub fn shape(self) -> Shape {
        use Opcode::*;
        match self {
            PushInt => Shape::I32,
            PushDouble => Shape::U64,
            PushString | PushFunction | NewClosure => Shape::U32,
            PushNative => Shape::U16,
            LoadArg | StoreArg | LoadLocal | StoreLocal | LoadGlobal | StoreGlobal | EnterEnv => Shape::U16,
            LoadEnv | StoreEnv => Shape::EnvSlot,
            PrimBinary => Shape::Prim,
            Jump | JumpIfTrue | JumpIfFalse | Gosub => Shape::I32,
            Switch => Shape::Switch,
            NewArray => Shape::U16,
            GetPropByName | SetPropByName | InitPropByName => Shape::U32,
            Call => Shape::CallFn,
            CallValue | New => Shape::U8,
            CallNative => Shape::CallNative,
            Try => Shape::Try,
            _ => Shape::None,
        }
    }

    /// Mnemonic used by the disassembler.
    pub fn mnemonic(self) -> &'static str {
        use Opcode::*;
        match self {
            Nop => "nop",
            PushUndefined => "push.undefined",
            PushNull => "push.null",
            PushTrue => "push.true",
            PushFalse => "push.false",
            PushInt => "push.int",
            PushDouble => "push.double",
            PushString => "push.string",
            PushFunction => "push.function",
            NewClosure => "new.closure",
            PushNative => "push.native",
            PushThis => "push.this",
            Pop => "pop",
            Dup => "dup",
            Swap => "swap",
            LoadArg => "load.arg",
            StoreArg => "store.arg",
            LoadLocal => "load.local",
            StoreLocal => "store.local",
            LoadGlobal => "load.global",
            StoreGlobal => "store.global",
            LoadEnv => "load.env",
            StoreEnv => "store.env",
            EnterEnv => "enter.env",
            LeaveEnv => "leave.env",
            GetArguments => "get.arguments",
            Add => "add",
            Sub => "sub",
            Mul => "mul",
            Div => "div",
            Rem => "rem",
            BitAnd => "bitand",
            BitOr => "bitor",
            BitXor => "bitxor",
            Shl => "shl",
            Shr => "shr",
            UShr => "ushr",
            Neg => "neg",
            Plus => "plus",
            BitNot => "bitnot",
            Not => "not",
            Typeof => "typeof",
            PrimBinary => "prim",
            Eq => "eq",
            Ne => "ne",
            StrictEq => "stricteq",
            StrictNe => "strictne",
            Lt => "lt",
            Le => "le",
            Gt => "gt",
            Ge => "ge",
            Jump => "jump",
            JumpIfTrue => "jump.true",
            JumpIfFalse => "jump.false",
            Switch => "switch",
            NewObject => "new.object",
            NewArray => "new.array",
            GetProp => "get.prop",
            SetProp => "set.prop",
            GetPropByName => "get.named",
            SetPropByName => "set.named",
            InitPropByName => "init.named",
            DeleteProp => "delete.prop",
            In => "in",
            InstanceOf => "instanceof",
            Call => "call",
            CallValue => "call.value",
            New => "new",
            CallNative => "call.native",
            Return => "return",
            ReturnUndefined => "return.undefined",
            Try => "try",
            Catch => "catch",
            Finally => "finally",
            EndTry => "endtry",
            Throw => "throw",
            Gosub => "gosub",
            Retsub => "retsub",
            IReadFpOff32 => "iread.fpoff32",
            IAssignFpOff32 => "iassign.fpoff32",
            IRead32 => "iread32",
            IAssign32 => "iassign32",
        }
    }
}

/// Binary operator of a `PrimBinary` instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PrimOp {
    Add = 0,
    Sub = 1,
    Mul = 2,
    Div = 3,
    Rem = 4,
    And = 5,
    Or = 6,
    Xor = 7,
    Shl = 8,
    Shr = 9,
}

impl PrimOp {
    pub fn from_u8(b: u8) -> Option<PrimOp> {
        use PrimOp::*;
        Some(match b {
            0 => Add,
            1 => Sub,
            2 => Mul,
            3 => Div,
            4 => Rem,
            5 => And,
            6 => Or,
            7 => Xor,
            8 => Shl,
            9 => Shr,
            _ => return None,
        })
    }
}

/// Fixed-width integer type of a `PrimBinary` instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PrimType {
    I8 = 0,
    U8 = 1,
    I16 = 2,
    U16 = 3,
    I32 = 4,
    U32 = 5,
}

impl PrimType {
    pub fn from_u8(b: u8) -> Option<PrimType> {
        use PrimType::*;
        Some(match b {
            0 => I8,
            1 => U8,
            2 => I16,
            3 => U16,
            4 => I32,
            5 => U32,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            PrimType::I8 => "i8",
            PrimType::U8 => "u8",
            PrimType::I16 => "i16",
            PrimType::U16 => "u16",
            PrimType::I32 => "i32",
            PrimType::U32 => "u32",
        }
    }

    /// Reduce a 64-bit intermediate to this type's range.
    pub fn wrap(self, x: i64) -> i64 {
        match self {
            PrimType::I8 => x as i8 as i64,
            PrimType::U8 => x as u8 as i64,
            PrimType::I16 => x as i16 as i64,
            PrimType::U16 => x as u16 as i64,
            PrimType::I32 => x as i32 as i64,
            PrimType::U32 => x as u32 as i64,
        }
    }

    pub fn bits(self) -> u32 {
        match self {
            PrimType::I8 | PrimType::U8 => 8,
            PrimType::I16 | PrimType::U16 => 16,
            PrimType::I32 | PrimType::U32 => 32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_opcode_byte_roundtrips() {
        for byte in 0..=u8::MAX {
            if let Some(op) = Opcode::from_u8(byte) {
                assert_eq!(op as u8, byte, "{}", op.mnemonic());
            }
        }
    }

    #[test]
    fn test_unassigned_bytes() {
        assert_eq!(Opcode::from_u8(0x0F), None);
        assert_eq!(Opcode::from_u8(0xFF), None);
    }

    #[test]
    fn test_prim_wrap() {
        assert_eq!(PrimType::I8.wrap(130), -126);
        assert_eq!(PrimType::U8.wrap(-1), 255);
        assert_eq!(PrimType::U16.wrap(65536 + 7), 7);
        assert_eq!(PrimType::U32.wrap(-1), u32::MAX as i64);
    }
}
