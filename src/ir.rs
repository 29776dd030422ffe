//! SSA IR data model: references, opcodes, typed instructions, and the
//! growable buffer that backs one recording/trace (spec.md §3, §4.1).
//!
//! Constants and instructions share one 16-bit reference space, split by a
//! fixed `bias`: references below the bias name constants, references at or
//! above it name instructions. The original C implementation keeps both
//! halves in one pointer-indexed array so that a single compare tells them
//! apart; here they live in two `Vec`s indexed relative to the bias, which
//! keeps the same O(1) lookup and the same compare-based classification
//! without unsafe pointer arithmetic (see the "Overlapping IR layout" design
//! note in spec.md §9 -- the spec permits either layout).

use std::fmt;

use crate::error::{Result, TraceError};
use crate::snapshot::RegSp;

/// A 16-bit IR reference. Values `< REF_BIAS` name constants, values
/// `>= REF_BIAS` name instructions.
pub type Ref = u16;

/// The fixed point separating constants (below) from instructions (at and
/// above). Constants grow downward from here, instructions grow upward.
pub const REF_BIAS: Ref = 0x8000;

/// Reserved primitive-constant references, growing down from the bias.
pub const REF_TRUE: Ref = REF_BIAS - 3;
pub const REF_FALSE: Ref = REF_BIAS - 2;
pub const REF_NIL: Ref = REF_BIAS - 1;

/// The ref of the trace's `BASE` instruction (current stack base).
pub const REF_BASE: Ref = REF_BIAS;

/// The first ref available to ordinary recorded instructions.
pub const REF_FIRST: Ref = REF_BIAS + 1;

/// Sentinel meaning "no reference" / "this PHI was eliminated".
pub const REF_DROP: Ref = 0xffff;

/// True if `r` names a constant (including the primitive `nil`/`true`/
/// `false` sentinels).
#[inline]
pub fn ref_is_const(r: Ref) -> bool {
    r < REF_BIAS
}

/// Full IR opcode set, in the order `lj_ir.h`'s `IRDEF` defines them. Order
/// matters: `EQ`/`NE`, `LT`/`GE`, `LE`/`GT` and the unordered variants are
/// laid out so that flipping bit 0 negates a comparison and flipping bit 2
/// swaps ordered for unordered, which the backend's `guardcc` lowering
/// exploits (spec.md §4.1 "Rationale").
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
#[repr(u8)]
pub enum Op {
    // Miscellaneous.
    Nop,
    Base,
    Loop,
    Phi,
    Rename,

    // Constants.
    Kpri,
    Kint,
    Kgc,
    Kptr,
    Knull,
    Knum,
    Kslot,

    // Guarded comparisons. EQ^1 == NE, LT^1 == GE, LE^1 == GT, LT^4 == ULT.
    Eq,
    Ne,

    Abc,
    Frame,

    Lt,
    Ge,
    Le,
    Gt,

    Ult,
    Uge,
    Ule,
    Ugt,

    // Bit ops.
    Bnot,
    Bswap,
    Band,
    Bor,
    Bxor,
    Bshl,
    Bshr,
    Bsar,
    Brol,
    Bror,

    // Arithmetic.
    Add,
    Sub,
    Mul,
    Div,

    Fpmath,
    Powi,

    Neg,
    Abs,
    Atan2,
    Ldexp,
    Min,
    Max,

    // Overflow-checked arithmetic.
    Addov,
    Subov,

    // Memory references.
    Aref,
    Hrefk,
    Href,
    Newref,
    Urefo,
    Urefc,
    Fref,
    Strref,

    // Loads. Must stay in the same relative order as the matching stores.
    Aload,
    Hload,
    Uload,
    Fload,
    Sload,
    Xload,

    // Stores. `opcode(store) - opcode(load) == STORE_DELTA`.
    Astore,
    Hstore,
    Ustore,
    Fstore,

    // String ops.
    Snew,

    // Table ops.
    Tnew,
    Tdup,
    Tlen,
    Tbar,
    Obar,

    // Conversions.
    Tonum,
    Toint,
    Tobit,
    Tostr,
    Strto,
}

/// Constant delta between a LOAD opcode and its matching STORE, per
/// spec.md's invariant 3 (§8). `Aload..Fload` and `Astore..Fstore` are laid
/// out in lockstep so a single offset converts between them.
pub const STORE_DELTA: i8 = (Op::Astore as i8) - (Op::Aload as i8);

impl Op {
    pub const COUNT: usize = Op::Strto as usize + 1;

    /// The matching STORE opcode for a LOAD opcode, if any.
    pub fn matching_store(self) -> Option<Op> {
        match self {
            Op::Aload => Some(Op::Astore),
            Op::Hload => Some(Op::Hstore),
            Op::Uload => Some(Op::Ustore),
            Op::Fload => Some(Op::Fstore),
            _ => None,
        }
    }

    pub fn is_load(self) -> bool {
        matches!(
            self,
            Op::Aload | Op::Hload | Op::Uload | Op::Fload | Op::Sload | Op::Xload
        )
    }

    pub fn is_store(self) -> bool {
        matches!(self, Op::Astore | Op::Hstore | Op::Ustore | Op::Fstore)
    }

    pub fn is_guard(self) -> bool {
        mode_of(self).guard
    }

    pub fn is_commutative(self) -> bool {
        mode_of(self).commutative
    }

    /// Pure instructions with no side effect, safe to hoist freely without
    /// re-checking anything. The loop optimizer's "Normal (pure, no side
    /// effect)" test (spec.md §4.3) is exactly `kind == Normal && !guard`.
    pub fn is_normal(self) -> bool {
        let m = mode_of(self);
        m.kind == OpKind::Normal && !m.guard
    }

    /// Eligible for the CSE chain walk: `Normal`-kind ops, guards included.
    /// Unlike [`Op::is_normal`], this does not exclude guards -- a guard
    /// still carries no *memory* side effect, so re-emitting one with the
    /// same operands as an existing dominating guard is redundant and the
    /// new guard can fold back to it (spec.md's "guards can be CSE'd and
    /// hoisted for free"). Load/Store/Alloc-kind ops are excluded since
    /// their ordering relative to other memory ops isn't tracked by the
    /// chain walk.
    pub fn is_cse_eligible(self) -> bool {
        mode_of(self).kind == OpKind::Normal
    }

    /// `side_effect = kind >= Store OR guard` (spec.md mode-byte row).
    pub fn has_side_effect(self) -> bool {
        let m = mode_of(self);
        m.kind == OpKind::Store || m.guard
    }
}

/// Operand-kind classification for an opcode's two operand slots.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum OperandMode {
    /// A 16-bit IR reference.
    Ref,
    /// A 16-bit unsigned literal, always `< REF_BIAS` so operand rewriting
    /// stays uniform with `Ref` operands.
    Lit,
    /// A constant payload (int/num/gc/ptr), stored out-of-line.
    Cst,
    /// Operand slot unused by this opcode.
    None,
}

/// Coarse classification driving side-effect and fusion decisions. Order
/// matters for `has_side_effect`: `Normal`/`Ref` share a level, then
/// `Alloc`, then `Load`, then `Store` -- mirroring `IRM_N`/`IRM_R` sharing a
/// bit pattern in the original and `IRM_A`/`IRM_L`/`IRM_S` each one step up.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum OpKind {
    Normal = 0,
    Alloc = 1,
    Load = 2,
    Store = 3,
}

#[derive(Copy, Clone, Debug)]
pub struct OpMode {
    pub op1: OperandMode,
    pub op2: OperandMode,
    pub kind: OpKind,
    pub commutative: bool,
    pub guard: bool,
}

const fn m(op1: OperandMode, op2: OperandMode, kind: OpKind, commutative: bool, guard: bool) -> OpMode {
    OpMode { op1, op2, kind, commutative, guard }
}

use OpKind::*;
use OperandMode::{Cst, Lit, None as ONone, Ref as ORef};

/// Returns the operand/side-effect/commutativity mode for `op`, the Rust
/// equivalent of indexing `lj_ir_mode[]` in the original.
pub fn mode_of(op: Op) -> OpMode {
    match op {
        Op::Nop => m(ONone, ONone, Normal, false, false),
        Op::Base => m(Lit, Lit, Normal, false, false),
        Op::Loop => m(ONone, ONone, Normal, false, true),
        Op::Phi => m(ORef, ORef, Store, false, false),
        Op::Rename => m(ORef, Lit, Store, false, false),

        Op::Kpri => m(ONone, ONone, Normal, false, false),
        Op::Kint => m(Cst, ONone, Normal, false, false),
        Op::Kgc => m(Cst, ONone, Normal, false, false),
        Op::Kptr => m(Cst, ONone, Normal, false, false),
        Op::Knull => m(Cst, ONone, Normal, false, false),
        Op::Knum => m(Cst, ONone, Normal, false, false),
        Op::Kslot => m(ORef, Lit, Normal, false, false),

        Op::Eq => m(ORef, ORef, Normal, true, true),
        Op::Ne => m(ORef, ORef, Normal, true, true),
        Op::Abc => m(ORef, ORef, Normal, false, true),
        Op::Frame => m(ORef, ORef, Normal, false, true),
        Op::Lt => m(ORef, ORef, Normal, false, true),
        Op::Ge => m(ORef, ORef, Normal, false, true),
        Op::Le => m(ORef, ORef, Normal, false, true),
        Op::Gt => m(ORef, ORef, Normal, false, true),
        Op::Ult => m(ORef, ORef, Normal, false, true),
        Op::Uge => m(ORef, ORef, Normal, false, true),
        Op::Ule => m(ORef, ORef, Normal, false, true),
        Op::Ugt => m(ORef, ORef, Normal, false, true),

        Op::Bnot => m(ORef, ONone, Normal, false, false),
        Op::Bswap => m(ORef, ONone, Normal, false, false),
        Op::Band => m(ORef, ORef, Normal, true, false),
        Op::Bor => m(ORef, ORef, Normal, true, false),
        Op::Bxor => m(ORef, ORef, Normal, true, false),
        Op::Bshl => m(ORef, ORef, Normal, false, false),
        Op::Bshr => m(ORef, ORef, Normal, false, false),
        Op::Bsar => m(ORef, ORef, Normal, false, false),
        Op::Brol => m(ORef, ORef, Normal, false, false),
        Op::Bror => m(ORef, ORef, Normal, false, false),

        Op::Add => m(ORef, ORef, Normal, true, false),
        Op::Sub => m(ORef, ORef, Normal, false, false),
        Op::Mul => m(ORef, ORef, Normal, true, false),
        Op::Div => m(ORef, ORef, Normal, false, false),
        Op::Fpmath => m(ORef, Lit, Normal, false, false),
        Op::Powi => m(ORef, ORef, Normal, false, false),
        Op::Neg => m(ORef, ORef, Normal, false, false),
        Op::Abs => m(ORef, ORef, Normal, false, false),
        Op::Atan2 => m(ORef, ORef, Normal, false, false),
        Op::Ldexp => m(ORef, ORef, Normal, false, false),
        Op::Min => m(ORef, ORef, Normal, true, false),
        Op::Max => m(ORef, ORef, Normal, true, false),

        Op::Addov => m(ORef, ORef, Normal, true, true),
        Op::Subov => m(ORef, ORef, Normal, false, true),

        Op::Aref => m(ORef, ORef, Normal, false, false),
        Op::Hrefk => m(ORef, ORef, Normal, false, true),
        Op::Href => m(ORef, ORef, Load, false, false),
        Op::Newref => m(ORef, ORef, Store, false, false),
        Op::Urefo => m(ORef, Lit, Load, false, true),
        Op::Urefc => m(ORef, Lit, Load, false, true),
        Op::Fref => m(ORef, Lit, Normal, false, false),
        Op::Strref => m(ORef, ORef, Normal, false, false),

        Op::Aload => m(ORef, ONone, Load, false, true),
        Op::Hload => m(ORef, ONone, Load, false, true),
        Op::Uload => m(ORef, ONone, Load, false, true),
        Op::Fload => m(ORef, Lit, Load, false, false),
        Op::Sload => m(Lit, Lit, Load, false, true),
        Op::Xload => m(ORef, Lit, Load, false, false),

        Op::Astore => m(ORef, ORef, Store, false, false),
        Op::Hstore => m(ORef, ORef, Store, false, false),
        Op::Ustore => m(ORef, ORef, Store, false, false),
        Op::Fstore => m(ORef, ORef, Store, false, false),

        Op::Snew => m(ORef, ORef, Normal, false, false),

        Op::Tnew => m(Lit, Lit, Alloc, false, false),
        Op::Tdup => m(ORef, ONone, Alloc, false, false),
        Op::Tlen => m(ORef, ONone, Load, false, false),
        Op::Tbar => m(ORef, ONone, Store, false, false),
        Op::Obar => m(ORef, ORef, Store, false, false),

        Op::Tonum => m(ORef, ONone, Normal, false, false),
        Op::Toint => m(ORef, Lit, Normal, false, false),
        Op::Tobit => m(ORef, ORef, Normal, false, false),
        Op::Tostr => m(ORef, ONone, Normal, false, false),
        Op::Strto => m(ORef, ONone, Normal, false, true),
    }
}

/// FPMATH sub-function selector, stored in an `Fpmath` instruction's literal
/// operand (`lj_ir.h`'s `IRFPMDEF`). Not named in spec.md's opcode table but
/// required to give `Op::Fpmath` a concrete meaning (spec.md §6 names the
/// matching runtime entry points `vm_floor`/`vm_ceil`/`vm_trunc`/`vm_exp`/
/// `vm_exp2`).
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum FpMathOp {
    Floor,
    Ceil,
    Trunc,
    Sqrt,
    Exp,
    Exp2,
    Log,
    Log2,
    Log10,
    Sin,
    Cos,
    Tan,
    Other,
}

/// Field identifiers for `FREF`'s literal operand (`lj_ir.h`'s `IRFLDEF`),
/// giving `fuse_fref` (spec.md §4.4.3) concrete field offsets to fuse
/// against.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum FieldId {
    StrLen,
    FuncEnv,
    TabMeta,
    TabArray,
    TabNode,
    TabAsize,
    TabHmask,
    TabNomm,
    UdataMeta,
}

/// `SLOAD` mode bits, packed into `op2` (`lj_ir.h`).
pub mod sload {
    pub const INHERIT: u16 = 1;
    pub const READONLY: u16 = 2;
    pub const PARENT: u16 = 4;
}

/// `XLOAD` mode bits, packed into `op2`.
pub mod xload {
    pub const UNALIGNED: u16 = 1;
}

/// `TOINT` mode, packed into `op2`, ordered by strength of the checks.
pub mod toint {
    pub const CHECK: u16 = 0;
    pub const INDEX: u16 = 1;
    pub const ANY: u16 = 2;
    pub const TOBIT: u16 = 3;
}

bitflags::bitflags! {
    /// Flags stored alongside an instruction's type tag (spec.md §3's
    /// "type/flag byte"): `GUARD`/`PHI`/`MARK`.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct TypeFlags: u8 {
        const MARK  = 0x20;
        const GUARD = 0x40;
        const IS_PHI = 0x80;
    }
}

/// Result type tag, matching `lj_ir.h`'s `IRType` enumeration (map of
/// itypes, contiguous integer sub-range, one `MARK`/`GUARD`/`ISPHI` flag
/// byte layered on top via [`TypeFlags`]).
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum TypeTag {
    Nil,
    False,
    True,
    LightUserdata,
    Str,
    Ptr,
    Thread,
    Proto,
    Func,
    Tab = 10,
    Udata,
    Num,
    Int,
    I8,
    U8,
    I16,
    U16,
}

impl TypeTag {
    pub fn is_primitive(self) -> bool {
        matches!(self, TypeTag::Nil | TypeTag::False | TypeTag::True)
    }

    pub fn is_integer(self) -> bool {
        matches!(self, TypeTag::Int | TypeTag::I8 | TypeTag::U8 | TypeTag::I16 | TypeTag::U16)
    }

    pub fn is_number(self) -> bool {
        matches!(self, TypeTag::Num) || self.is_integer()
    }
}

/// Combined type tag + flag bits, the stored `IRType1` byte.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct IrType {
    tag: u8,
    flags: TypeFlags,
}

impl fmt::Debug for IrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}{:?}", self.tag(), self.flags)
    }
}

impl IrType {
    pub fn new(tag: TypeTag) -> Self {
        IrType { tag: tag as u8, flags: TypeFlags::empty() }
    }

    pub fn guarded(tag: TypeTag) -> Self {
        let mut t = Self::new(tag);
        t.flags |= TypeFlags::GUARD;
        t
    }

    pub fn tag(self) -> TypeTag {
        // Safety-free decode: only ever constructed from a valid TypeTag.
        match self.tag {
            0 => TypeTag::Nil,
            1 => TypeTag::False,
            2 => TypeTag::True,
            3 => TypeTag::LightUserdata,
            4 => TypeTag::Str,
            5 => TypeTag::Ptr,
            6 => TypeTag::Thread,
            7 => TypeTag::Proto,
            8 => TypeTag::Func,
            10 => TypeTag::Tab,
            11 => TypeTag::Udata,
            12 => TypeTag::Num,
            13 => TypeTag::Int,
            14 => TypeTag::I8,
            15 => TypeTag::U8,
            16 => TypeTag::I16,
            _ => TypeTag::U16,
        }
    }

    pub fn same_type(self, other: IrType) -> bool {
        self.tag == other.tag
    }

    pub fn is_guard(self) -> bool {
        self.flags.contains(TypeFlags::GUARD)
    }
    pub fn is_marked(self) -> bool {
        self.flags.contains(TypeFlags::MARK)
    }
    pub fn is_phi(self) -> bool {
        self.flags.contains(TypeFlags::IS_PHI)
    }
    pub fn set_mark(&mut self) {
        self.flags |= TypeFlags::MARK;
    }
    pub fn clear_mark(&mut self) {
        self.flags.remove(TypeFlags::MARK);
    }
    pub fn set_phi(&mut self) {
        self.flags |= TypeFlags::IS_PHI;
    }
    pub fn clear_phi(&mut self) {
        self.flags.remove(TypeFlags::IS_PHI);
    }
}

/// One IR instruction (spec.md §3 "IR instruction"). `prev` is valid only
/// before register allocation (CSE chain anchor); `regsp` is valid only
/// after. Both fields are kept (rather than overlaid in one word) per the
/// relaxation spec.md §9 explicitly allows.
#[derive(Clone, Copy, Debug)]
pub struct IrIns {
    pub op: Op,
    pub ty: IrType,
    pub op1: Ref,
    pub op2: Ref,
    /// Pre-allocation: previous instruction with the same opcode, for CSE.
    pub prev: Ref,
    /// Post-allocation: assigned register + spill slot.
    pub regsp: RegSp,
}

impl IrIns {
    pub fn new(op: Op, ty: IrType, op1: Ref, op2: Ref) -> Self {
        IrIns { op, ty, op1, op2, prev: 0, regsp: RegSp::UNALLOCATED }
    }
}

/// Out-of-line constant payload for `KINT`/`KNUM`/`KGC`/`KPTR`/`KNULL`.
#[derive(Clone, Copy, PartialEq, Debug)]
pub enum ConstVal {
    Int(i32),
    Num(u64), // bit pattern, so NaN/+-0 canonicalization is explicit (see below)
    Gc(u64),
    Ptr(usize),
    Null,
}

impl ConstVal {
    /// Canonicalizes `+0.0`/`-0.0` and NaN payloads. Per spec.md §9's open
    /// question, this crate performs canonicalization here, in the
    /// assembler's constant pool, rather than at the recorder boundary.
    pub fn num(v: f64) -> Self {
        let bits = if v == 0.0 {
            0u64 // canonical +0.0, folding -0.0 into it
        } else if v.is_nan() {
            f64::NAN.to_bits() // canonical quiet NaN payload
        } else {
            v.to_bits()
        };
        ConstVal::Num(bits)
    }

    pub fn as_f64(self) -> Option<f64> {
        match self {
            ConstVal::Num(bits) => Some(f64::from_bits(bits)),
            _ => None,
        }
    }
}

/// The growable instruction/constant buffer backing one recording or trace
/// (spec.md §4.1). Emission is append-only in `instrs` and `consts`;
/// [`IrBuffer::rollback`] truncates both back to a previously recorded
/// high-water mark.
#[derive(Clone, Debug, Default)]
pub struct IrBuffer {
    consts: Vec<ConstVal>,
    instrs: Vec<IrIns>,
    /// Per-opcode CSE chain anchors (`lj_jit.h`'s `chain[IR__MAX]`).
    chain: [Ref; Op::COUNT],
}

/// Maximum instruction count before `IR_OVERFLOW` (spec.md §4.1). Kept well
/// below `u16::MAX - REF_BIAS` so snapshot/PHI bookkeeping never has to
/// worry about ref overflow separately.
pub const MAX_INSTRS: usize = 0x7000;

impl IrBuffer {
    pub fn new() -> Self {
        let mut b = IrBuffer { consts: Vec::new(), instrs: Vec::new(), chain: [0; Op::COUNT] };
        // REF_BASE is always instruction #0.
        b.instrs.push(IrIns::new(Op::Base, IrType::new(TypeTag::Nil), 0, 0));
        b
    }

    #[inline]
    fn const_index(r: Ref) -> usize {
        debug_assert!(ref_is_const(r) && r < REF_NIL);
        (REF_NIL - 1 - r) as usize
    }

    #[inline]
    fn instr_index(r: Ref) -> usize {
        debug_assert!(!ref_is_const(r));
        (r - REF_BIAS) as usize
    }

    pub fn next_ref(&self) -> Ref {
        REF_BIAS + self.instrs.len() as Ref
    }

    pub fn get(&self, r: Ref) -> &IrIns {
        &self.instrs[Self::instr_index(r)]
    }

    pub fn get_mut(&mut self, r: Ref) -> &mut IrIns {
        &mut self.instrs[Self::instr_index(r)]
    }

    pub fn const_val(&self, r: Ref) -> ConstVal {
        match r {
            REF_NIL => ConstVal::Null,
            REF_TRUE | REF_FALSE => ConstVal::Null,
            _ => self.consts[Self::const_index(r)],
        }
    }

    /// Intern (or find) a constant, returning its ref. Constants are
    /// deduplicated by value, matching CSE for `KINT`/`KNUM`/`KGC`/`KPTR`.
    pub fn intern_const(&mut self, v: ConstVal) -> Result<Ref> {
        if let Some(pos) = self.consts.iter().position(|c| *c == v) {
            return Ok(REF_NIL - 1 - pos as Ref);
        }
        let pos = self.consts.len();
        if REF_NIL as usize - pos == REF_FIRST as usize {
            return Err(TraceError::IrOverflow);
        }
        self.consts.push(v);
        Ok(REF_NIL - 1 - pos as Ref)
    }

    /// Append an instruction, bypassing fold/CSE. Used by [`crate::fold`]
    /// once it has decided the instruction cannot be eliminated.
    pub fn emit_raw(&mut self, op: Op, ty: IrType, op1: Ref, op2: Ref) -> Result<Ref> {
        if self.instrs.len() >= MAX_INSTRS {
            return Err(TraceError::IrOverflow);
        }
        let r = self.next_ref();
        let mut ins = IrIns::new(op, ty, op1, op2);
        ins.prev = self.chain[op as usize];
        self.chain[op as usize] = r;
        self.instrs.push(ins);
        Ok(r)
    }

    /// Fold-state-driven emit: tries constant folding and CSE first via
    /// [`crate::fold::fold`], falling back to [`IrBuffer::emit_raw`].
    pub fn emit(&mut self, op: Op, ty: IrType, op1: Ref, op2: Ref) -> Result<Ref> {
        crate::fold::fold(self, op, ty, op1, op2)
    }

    /// Walk the CSE chain for `op`, yielding refs from most to least recent.
    pub fn chain_of(&self, op: Op) -> impl Iterator<Item = Ref> + '_ {
        ChainIter { buf: self, next: self.chain[op as usize] }
    }

    /// Truncate the buffer back to `to_ref` (exclusive), undoing every
    /// instruction emitted since. Used by the loop optimizer on retry
    /// (spec.md §4.1 `rollback`).
    pub fn rollback(&mut self, to_ref: Ref) {
        // Repair CSE chains first, walking `prev` pointers through the
        // still-intact (pre-truncation) instruction array.
        for anchor in self.chain.iter_mut() {
            while *anchor >= to_ref {
                *anchor = self.instrs[Self::instr_index(*anchor)].prev;
            }
        }
        let keep = Self::instr_index(to_ref).max(1); // never drop BASE
        self.instrs.truncate(keep);
    }

    pub fn len(&self) -> usize {
        self.instrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instrs.len() <= 1
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = (Ref, &IrIns)> {
        self.instrs
            .iter()
            .enumerate()
            .map(|(i, ins)| (REF_BIAS + i as Ref, ins))
    }
}

struct ChainIter<'a> {
    buf: &'a IrBuffer,
    next: Ref,
}

impl<'a> Iterator for ChainIter<'a> {
    type Item = Ref;
    fn next(&mut self) -> Option<Ref> {
        if self.next < REF_BIAS {
            return None;
        }
        let r = self.next;
        self.next = self.buf.get(r).prev;
        Some(r)
    }
}
