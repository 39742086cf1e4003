use std::fmt;

use serde::{Deserialize, Serialize};

/// SSA value identifier, unique within a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueId(pub u32);

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    Int(i64),
    Float(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    AddI,
    SubI,
    MulI,
    DivSI,
    RemSI,
    AndI,
    OrI,
    XOrI,
    AddF,
    SubF,
    MulF,
    DivF,
}

impl BinaryOp {
    pub fn is_float(self) -> bool {
        matches!(
            self,
            BinaryOp::AddF | BinaryOp::SubF | BinaryOp::MulF | BinaryOp::DivF
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            BinaryOp::AddI => "arith.addi",
            BinaryOp::SubI => "arith.subi",
            BinaryOp::MulI => "arith.muli",
            BinaryOp::DivSI => "arith.divsi",
            BinaryOp::RemSI => "arith.remsi",
            BinaryOp::AndI => "arith.andi",
            BinaryOp::OrI => "arith.ori",
            BinaryOp::XOrI => "arith.xori",
            BinaryOp::AddF => "arith.addf",
            BinaryOp::SubF => "arith.subf",
            BinaryOp::MulF => "arith.mulf",
            BinaryOp::DivF => "arith.divf",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    AbsI,
    AbsF,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CmpIPredicate {
    Eq,
    Ne,
    Slt,
    Sle,
    Sgt,
    Sge,
    Ult,
    Ule,
    Ugt,
    Uge,
}

impl CmpIPredicate {
    pub fn name(self) -> &'static str {
        match self {
            CmpIPredicate::Eq => "eq",
            CmpIPredicate::Ne => "ne",
            CmpIPredicate::Slt => "slt",
            CmpIPredicate::Sle => "sle",
            CmpIPredicate::Sgt => "sgt",
            CmpIPredicate::Sge => "sge",
            CmpIPredicate::Ult => "ult",
            CmpIPredicate::Ule => "ule",
            CmpIPredicate::Ugt => "ugt",
            CmpIPredicate::Uge => "uge",
        }
    }
}

/// Float comparison predicates. `O*` are false when either side is NaN, `U*` true.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CmpFPredicate {
    Oeq,
    One,
    Olt,
    Ole,
    Ogt,
    Oge,
    Ueq,
    Une,
    Ult,
    Ule,
    Ugt,
    Uge,
}

impl CmpFPredicate {
    pub fn name(self) -> &'static str {
        match self {
            CmpFPredicate::Oeq => "oeq",
            CmpFPredicate::One => "one",
            CmpFPredicate::Olt => "olt",
            CmpFPredicate::Ole => "ole",
            CmpFPredicate::Ogt => "ogt",
            CmpFPredicate::Oge => "oge",
            CmpFPredicate::Ueq => "ueq",
            CmpFPredicate::Une => "une",
            CmpFPredicate::Ult => "ult",
            CmpFPredicate::Ule => "ule",
            CmpFPredicate::Ugt => "ugt",
            CmpFPredicate::Uge => "uge",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CastOp {
    ExtF,
    TruncF,
    ExtSI,
    ExtUI,
    TruncI,
    SIToFP,
    UIToFP,
    FPToSI,
    Bitcast,
}

impl CastOp {
    pub fn name(self) -> &'static str {
        match self {
            CastOp::ExtF => "arith.extf",
            CastOp::TruncF => "arith.truncf",
            CastOp::ExtSI => "arith.extsi",
            CastOp::ExtUI => "arith.extui",
            CastOp::TruncI => "arith.trunci",
            CastOp::SIToFP => "arith.sitofp",
            CastOp::UIToFP => "arith.uitofp",
            CastOp::FPToSI => "arith.fptosi",
            CastOp::Bitcast => "tt.bitcast",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProgramIdDim {
    X,
    Y,
    Z,
}

impl ProgramIdDim {
    pub fn index(self) -> usize {
        match self {
            ProgramIdDim::X => 0,
            ProgramIdDim::Y => 1,
            ProgramIdDim::Z => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ProgramIdDim::X => "x",
            ProgramIdDim::Y => "y",
            ProgramIdDim::Z => "z",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Padding {
    Zero,
}

/// Operation kinds. Operand layout per kind is documented on the variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpKind {
    /// Splat of a literal over the result type.
    Constant(Constant),
    Binary(BinaryOp),
    Unary(UnaryOp),
    CmpI(CmpIPredicate),
    CmpF(CmpFPredicate),
    /// `[cond, on_true, on_false]`
    Select,
    Cast(CastOp),
    ExternElementwise {
        library: String,
        path: String,
        symbol: String,
        pure: bool,
    },
    Splat,
    Broadcast,
    ExpandDims {
        axis: usize,
    },
    MakeRange {
        start: i32,
        end: i32,
    },
    GetProgramId(ProgramIdDim),
    /// `[ptr, offset]`
    AddPtr,
    /// `[base, shape.., strides.., offsets..]`, block shape from the result type.
    MakeTensorPtr {
        order: Vec<i32>,
    },
    /// `[block_ptr, offsets..]`
    Advance,
    Load {
        boundary_check: Vec<usize>,
        padding: Option<Padding>,
    },
    /// `[ptr, value]`
    Store {
        boundary_check: Vec<usize>,
    },
    /// `[lhs, rhs, acc]`
    Dot {
        allow_tf32: bool,
    },
    /// `[lhs, rhs, acc, meta]`
    SparseDot,
    /// One region with two scalar arguments, terminated by `ReduceReturn`.
    Reduce {
        axis: usize,
    },
    ReduceReturn,
    /// `[lower, upper, step, inits..]`, body arguments `[iv, iters..]`.
    For,
    Yield,
    Return,
}

impl OpKind {
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Constant(_) => "arith.constant",
            OpKind::Binary(op) => op.name(),
            OpKind::Unary(UnaryOp::AbsI) => "math.absi",
            OpKind::Unary(UnaryOp::AbsF) => "math.absf",
            OpKind::CmpI(_) => "arith.cmpi",
            OpKind::CmpF(_) => "arith.cmpf",
            OpKind::Select => "arith.select",
            OpKind::Cast(op) => op.name(),
            OpKind::ExternElementwise { .. } => "tt.extern_elementwise",
            OpKind::Splat => "tt.splat",
            OpKind::Broadcast => "tt.broadcast",
            OpKind::ExpandDims { .. } => "tt.expand_dims",
            OpKind::MakeRange { .. } => "tt.make_range",
            OpKind::GetProgramId(_) => "tt.get_program_id",
            OpKind::AddPtr => "tt.addptr",
            OpKind::MakeTensorPtr { .. } => "tt.make_tensor_ptr",
            OpKind::Advance => "tt.advance",
            OpKind::Load { .. } => "tt.load",
            OpKind::Store { .. } => "tt.store",
            OpKind::Dot { .. } => "tt.dot",
            OpKind::SparseDot => "triton_gpu.sparse_dot",
            OpKind::Reduce { .. } => "tt.reduce",
            OpKind::ReduceReturn => "tt.reduce.return",
            OpKind::For => "scf.for",
            OpKind::Yield => "scf.yield",
            OpKind::Return => "tt.return",
        }
    }

    pub fn is_terminator(&self) -> bool {
        matches!(self, OpKind::ReduceReturn | OpKind::Yield | OpKind::Return)
    }

    /// Operations that write memory or end a block.
    pub fn has_side_effects(&self) -> bool {
        matches!(self, OpKind::Store { .. }) || self.is_terminator()
    }

    /// Operations whose result depends only on operands and attributes.
    pub fn is_cse_candidate(&self) -> bool {
        !self.has_side_effects()
            && !matches!(
                self,
                OpKind::Load { .. } | OpKind::For | OpKind::Reduce { .. }
            )
            && !matches!(self, OpKind::ExternElementwise { pure: false, .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub kind: OpKind,
    pub operands: Vec<ValueId>,
    pub results: Vec<ValueId>,
    #[serde(default)]
    pub regions: Vec<Block>,
}

impl Operation {
    pub fn result(&self) -> Option<ValueId> {
        self.results.first().copied()
    }

    /// True when this op or any op nested in its regions writes memory.
    pub fn writes_memory(&self) -> bool {
        matches!(self.kind, OpKind::Store { .. })
            || self
                .regions
                .iter()
                .any(|block| block.ops.iter().any(Operation::writes_memory))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub args: Vec<ValueId>,
    pub ops: Vec<Operation>,
}

impl Block {
    pub fn terminator(&self) -> Option<&Operation> {
        self.ops.last().filter(|op| op.kind.is_terminator())
    }

    /// Visits every operation, including nested regions, in program order.
    pub fn walk<'a>(&'a self, f: &mut impl FnMut(&'a Operation)) {
        for op in &self.ops {
            f(op);
            for region in &op.regions {
                region.walk(f);
            }
        }
    }

    pub fn walk_mut(&mut self, f: &mut impl FnMut(&mut Operation)) {
        for op in &mut self.ops {
            f(op);
            for region in &mut op.regions {
                region.walk_mut(f);
            }
        }
    }

    pub fn replace_all_uses(&mut self, from: ValueId, to: ValueId) {
        self.walk_mut(&mut |op| {
            for operand in &mut op.operands {
                if *operand == from {
                    *operand = to;
                }
            }
        });
    }
}
