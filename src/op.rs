use indexmap::IndexMap;
use thiserror::Error;

/// One decoded opcode of the postfix program.
///
/// The opcode sequence *is* the intermediate representation: there is no
/// later rewriting beyond [`dedup_prop_access`], and validity (arity, stack
/// depth, clip references) is checked while the code generator walks the
/// sequence against its symbolic stack.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// Load one SIMD batch of pixels from input clip `clip`.
    MemLoad { clip: usize },
    /// Push a literal. Integral values fold to integer lanes at generation
    /// time so arithmetic between integer operands can stay integral.
    Constant { value: f32 },
    /// Push a per-frame scalar, splatted over all lanes.
    LoadConst { which: ConstLoad },
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Sqrt,
    Abs,
    Max,
    Min,
    Cmp { kind: Cmp },
    Trunc,
    Round,
    Floor,
    And,
    Or,
    Xor,
    Not,
    Exp,
    Log,
    Pow,
    Sin,
    Cos,
    Ternary,
    Dup { depth: u32 },
    Swap { depth: u32 },
}

impl Op {
    /// Stack operands consumed. `Dup`/`Swap` consume nothing but instead
    /// require the stack to be deeper than their depth immediate.
    pub fn arity(&self) -> usize {
        match self {
            Op::Add
            | Op::Sub
            | Op::Mul
            | Op::Div
            | Op::Mod
            | Op::Max
            | Op::Min
            | Op::Cmp { .. }
            | Op::And
            | Op::Or
            | Op::Xor
            | Op::Pow => 2,
            Op::Sqrt
            | Op::Abs
            | Op::Trunc
            | Op::Round
            | Op::Floor
            | Op::Not
            | Op::Exp
            | Op::Log
            | Op::Sin
            | Op::Cos => 1,
            Op::Ternary => 3,
            Op::MemLoad { .. }
            | Op::Constant { .. }
            | Op::LoadConst { .. }
            | Op::Dup { .. }
            | Op::Swap { .. } => 0,
        }
    }
}

/// Comparison sub-kind. The discriminants are load-bearing: bit 2 negates
/// the underlying predicate, and the code generator keys its lowering table
/// on the raw value, so they must not be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Cmp {
    Eq = 0,
    Lt = 1,
    Le = 2,
    Neq = 4,
    Nlt = 5,
    Nle = 6,
}

/// Scalar-constant selector for [`Op::LoadConst`].
#[derive(Debug, Clone, PartialEq)]
pub enum ConstLoad {
    /// Frame number, stored as an `i32` bit pattern in consts slot 0.
    N,
    /// Column index vector `[x, x+1, .., x+L-1]`.
    X,
    /// Row index, splatted.
    Y,
    /// A `clip.name` frame-property access as decoded. Rewritten to
    /// [`ConstLoad::PropSlot`] before code generation.
    Prop { clip: usize, name: String },
    /// A deduplicated property access reading consts slot `1 + id`.
    PropSlot { id: usize },
}

/// One entry of the compiled artifact's property table: the host fetches
/// property `name` from clip `clip`'s frame and stores it, in table order,
/// into the scalar-constants buffer starting at slot 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropAccess {
    pub clip: usize,
    pub name: String,
}

/// Expression-validity errors raised while walking the opcode sequence.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("reference to undefined clip: {0}")]
    UndefinedClip(String),
    #[error("insufficient values on stack: {0}")]
    StackUnderflow(String),
    #[error("empty expression: {0}")]
    EmptyExpression(String),
    #[error("unconsumed values on stack: {0}")]
    UnconsumedValues(String),
}

/// Rewrites every `clip.name` property load to a dense slot id assigned in
/// first-use order and returns the resulting property table.
///
/// Running the pass again on already-rewritten opcodes is a no-op: slots
/// stay slots, so the opcode list is stable under repetition.
pub fn dedup_prop_access(
    ops: &mut [Op],
    tokens: &[&str],
    num_inputs: usize,
) -> Result<Vec<PropAccess>, CompileError> {
    let mut slots: IndexMap<(usize, String), usize> = IndexMap::new();

    for (i, op) in ops.iter_mut().enumerate() {
        if let Op::LoadConst { which } = op {
            if let ConstLoad::Prop { clip, name } = &*which {
                if *clip >= num_inputs {
                    return Err(CompileError::UndefinedClip(tokens[i].to_string()));
                }
                let next = slots.len();
                let id = *slots.entry((*clip, name.clone())).or_insert(next);
                *which = ConstLoad::PropSlot { id };
            }
        }
    }

    Ok(slots
        .into_iter()
        .map(|((clip, name), _)| PropAccess { clip, name })
        .collect())
}
