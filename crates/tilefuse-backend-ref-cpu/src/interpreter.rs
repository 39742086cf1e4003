use std::collections::HashMap;

use thiserror::Error;
use tilefuse::ir::{
    BinaryOp, Block, CastOp, CmpFPredicate, CmpIPredicate, Constant, Func, OpKind, Operation,
    ScalarType, Type, UnaryOp, ValueId,
};

use crate::buffer::{Elems, HostBuffer, Scalar};
use crate::numeric::{
    as_signed, as_unsigned, float_from_bits, float_to_bits, float_to_int, math_base_name,
    math_function, round_to_tf32, wrap_int,
};

#[derive(Debug, Error)]
pub enum InterpError {
    #[error("kernel expects {expected} arguments, got {actual}")]
    ArgumentCount { expected: usize, actual: usize },
    #[error("argument {index}: kernel expects {expected}, buffer holds {actual}")]
    ArgumentType {
        index: usize,
        expected: String,
        actual: ScalarType,
    },
    #[error("{op}: value {value} is not available")]
    MissingValue { op: &'static str, value: ValueId },
    #[error("{op}: element {address} is outside argument {arg} of {len} elements")]
    OutOfBounds {
        op: &'static str,
        arg: usize,
        address: i64,
        len: usize,
    },
    #[error("{op}: coordinate {coord} of unchecked dimension {dim} is outside [0, {bound})")]
    UncheckedAccess {
        op: &'static str,
        dim: usize,
        coord: i64,
        bound: i64,
    },
    #[error("{op}: {message}")]
    Invalid { op: &'static str, message: String },
}

impl InterpError {
    fn invalid(op: &'static str, message: impl Into<String>) -> Self {
        InterpError::Invalid {
            op,
            message: message.into(),
        }
    }
}

pub type InterpResult<T> = Result<T, InterpError>;

/// Executes a kernel function over a launch grid, one program instance at a time.
pub struct Interpreter<'f> {
    func: &'f Func,
}

impl<'f> Interpreter<'f> {
    pub fn new(func: &'f Func) -> Self {
        Self { func }
    }

    /// Runs every program id of `grid` (x fastest) against `buffers`, which are
    /// bound to the function arguments in order.
    pub fn launch(&self, grid: [i64; 3], buffers: &mut [HostBuffer]) -> InterpResult<()> {
        self.check_arguments(buffers)?;
        tracing::debug!(
            kernel = %self.func.name,
            grid = ?grid,
            "running kernel on host"
        );
        let arg_count = buffers.len();
        for z in 0..grid[2] {
            for y in 0..grid[1] {
                for x in 0..grid[0] {
                    let mut program = Program {
                        func: self.func,
                        pid: [x, y, z],
                        buffers: &mut *buffers,
                        values: HashMap::new(),
                    };
                    let args = (0..arg_count)
                        .map(|arg| Value::Ptr { arg, offset: 0 })
                        .collect();
                    program.run_block(&self.func.body, args)?;
                }
            }
        }
        Ok(())
    }

    fn check_arguments(&self, buffers: &[HostBuffer]) -> InterpResult<()> {
        let arg_types = self.func.arg_types();
        if arg_types.len() != buffers.len() {
            return Err(InterpError::ArgumentCount {
                expected: arg_types.len(),
                actual: buffers.len(),
            });
        }
        for (index, (ty, buffer)) in arg_types.iter().zip(buffers.iter()).enumerate() {
            match ty {
                Type::Ptr(elem) if *elem == buffer.elem() => {}
                other => {
                    return Err(InterpError::ArgumentType {
                        index,
                        expected: other.to_string(),
                        actual: buffer.elem(),
                    })
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Tile {
    shape: Vec<usize>,
    elem: ScalarType,
    data: Elems,
}

impl Tile {
    fn from_fn(shape: &[usize], elem: ScalarType, mut f: impl FnMut(usize) -> Scalar) -> Self {
        let len = shape.iter().product();
        let mut data = Elems::zeros(elem, len);
        for index in 0..len {
            data.set(elem, index, f(index));
        }
        Self {
            shape: shape.to_vec(),
            elem,
            data,
        }
    }

    fn filled(shape: &[usize], elem: ScalarType, value: Scalar) -> Self {
        Self::from_fn(shape, elem, |_| value)
    }

    fn scalar(elem: ScalarType, value: Scalar) -> Self {
        Self::filled(&[], elem, value)
    }

    fn len(&self) -> usize {
        self.data.len()
    }

    fn get(&self, index: usize) -> Scalar {
        self.data.get(index)
    }
}

#[derive(Debug, Clone, PartialEq)]
struct BlockPtr {
    arg: usize,
    base: i64,
    shape: Vec<i64>,
    strides: Vec<i64>,
    offsets: Vec<i64>,
    block: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Tile(Tile),
    Ptr { arg: usize, offset: i64 },
    Block(BlockPtr),
}

struct Program<'a> {
    func: &'a Func,
    pid: [i64; 3],
    buffers: &'a mut [HostBuffer],
    values: HashMap<ValueId, Value>,
}

fn dims_of(ty: &Type) -> Vec<usize> {
    ty.shape().iter().map(|d| *d as usize).collect()
}

fn operand(op: &Operation, index: usize) -> InterpResult<ValueId> {
    op.operands.get(index).copied().ok_or_else(|| {
        InterpError::invalid(op.kind.name(), format!("missing operand {index}"))
    })
}

fn unravel_index(mut index: usize, dims: &[usize]) -> Vec<usize> {
    let mut coords = vec![0; dims.len()];
    for (i, dim) in dims.iter().enumerate().rev() {
        coords[i] = index % *dim;
        index /= *dim;
    }
    coords
}

fn compute_strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![0; dims.len()];
    let mut acc = 1usize;
    for (i, dim) in dims.iter().enumerate().rev() {
        strides[i] = acc;
        acc *= *dim;
    }
    strides
}

impl<'a> Program<'a> {
    fn value(&self, op: &'static str, id: ValueId) -> InterpResult<&Value> {
        self.values
            .get(&id)
            .ok_or(InterpError::MissingValue { op, value: id })
    }

    fn tile(&self, op: &'static str, id: ValueId) -> InterpResult<&Tile> {
        match self.value(op, id)? {
            Value::Tile(tile) => Ok(tile),
            _ => Err(InterpError::invalid(op, format!("{id} is a pointer"))),
        }
    }

    fn scalar_int(&self, op: &'static str, id: ValueId) -> InterpResult<i64> {
        let tile = self.tile(op, id)?;
        if tile.len() != 1 {
            return Err(InterpError::invalid(op, format!("{id} is not a scalar")));
        }
        Ok(tile.get(0).as_i64())
    }

    fn result_type(&self, op: &Operation) -> InterpResult<&'a Type> {
        let func = self.func;
        op.result()
            .and_then(|result| func.value_type(result))
            .ok_or_else(|| InterpError::invalid(op.kind.name(), "result has no type"))
    }

    fn run_block(&mut self, block: &Block, args: Vec<Value>) -> InterpResult<Vec<Value>> {
        if args.len() != block.args.len() {
            return Err(InterpError::invalid(
                "block",
                format!("expected {} arguments, got {}", block.args.len(), args.len()),
            ));
        }
        for (id, value) in block.args.iter().zip(args) {
            self.values.insert(*id, value);
        }
        for op in &block.ops {
            if op.kind.is_terminator() {
                let name = op.kind.name();
                return op
                    .operands
                    .iter()
                    .map(|v| self.value(name, *v).cloned())
                    .collect();
            }
            let results = self.eval(op)?;
            for (id, value) in op.results.iter().zip(results) {
                self.values.insert(*id, value);
            }
        }
        Err(InterpError::invalid("block", "missing terminator"))
    }

    fn eval(&mut self, op: &Operation) -> InterpResult<Vec<Value>> {
        let name = op.kind.name();
        let value = match &op.kind {
            OpKind::Constant(constant) => {
                let ty = self.result_type(op)?;
                let literal = match constant {
                    Constant::Int(v) => Scalar::Int(*v),
                    Constant::Float(v) => Scalar::Float(*v),
                };
                Value::Tile(Tile::filled(&dims_of(ty), ty.element_type(), literal))
            }
            OpKind::Binary(binary) => {
                let lhs = self.tile(name, operand(op, 0)?)?;
                let rhs = self.tile(name, operand(op, 1)?)?;
                Value::Tile(op_binary(*binary, lhs, rhs)?)
            }
            OpKind::Unary(unary) => {
                let input = self.tile(name, operand(op, 0)?)?;
                Value::Tile(op_unary(*unary, input))
            }
            OpKind::CmpI(pred) => {
                let lhs = self.tile(name, operand(op, 0)?)?;
                let rhs = self.tile(name, operand(op, 1)?)?;
                Value::Tile(op_cmpi(*pred, lhs, rhs))
            }
            OpKind::CmpF(pred) => {
                let lhs = self.tile(name, operand(op, 0)?)?;
                let rhs = self.tile(name, operand(op, 1)?)?;
                Value::Tile(op_cmpf(*pred, lhs, rhs))
            }
            OpKind::Select if !matches!(self.value(name, operand(op, 1)?)?, Value::Tile(_)) => {
                // Pointer selects take a scalar condition.
                let take = self.scalar_int(name, operand(op, 0)?)? & 1 == 1;
                let chosen = if take { operand(op, 1)? } else { operand(op, 2)? };
                self.value(name, chosen)?.clone()
            }
            OpKind::Select => {
                let cond = self.tile(name, operand(op, 0)?)?;
                let on_true = self.tile(name, operand(op, 1)?)?;
                let on_false = self.tile(name, operand(op, 2)?)?;
                Value::Tile(op_select(cond, on_true, on_false)?)
            }
            OpKind::Cast(cast) => {
                let elem = self.result_type(op)?.element_type();
                let input = self.tile(name, operand(op, 0)?)?;
                Value::Tile(op_cast(*cast, input, elem))
            }
            OpKind::ExternElementwise { symbol, .. } => {
                let elem = self.result_type(op)?.element_type();
                let args = op
                    .operands
                    .iter()
                    .map(|v| self.tile(name, *v))
                    .collect::<InterpResult<Vec<_>>>()?;
                Value::Tile(op_extern(symbol, &args, elem)?)
            }
            OpKind::Splat => {
                let shape = dims_of(self.result_type(op)?);
                let input = self.tile(name, operand(op, 0)?)?;
                Value::Tile(Tile::filled(&shape, input.elem, input.get(0)))
            }
            OpKind::Broadcast => {
                let shape = dims_of(self.result_type(op)?);
                let input = self.tile(name, operand(op, 0)?)?;
                Value::Tile(op_broadcast(input, &shape))
            }
            OpKind::ExpandDims { .. } => {
                let shape = dims_of(self.result_type(op)?);
                let mut tile = self.tile(name, operand(op, 0)?)?.clone();
                tile.shape = shape;
                Value::Tile(tile)
            }
            OpKind::MakeRange { start, end } => {
                let len = (end - start) as usize;
                Value::Tile(Tile::from_fn(&[len], ScalarType::I32, |i| {
                    Scalar::Int(i64::from(*start) + i as i64)
                }))
            }
            OpKind::GetProgramId(dim) => {
                Value::Tile(Tile::scalar(ScalarType::I32, Scalar::Int(self.pid[dim.index()])))
            }
            OpKind::AddPtr => {
                let delta = self.scalar_int(name, operand(op, 1)?)?;
                match self.value(name, operand(op, 0)?)? {
                    Value::Ptr { arg, offset } => Value::Ptr {
                        arg: *arg,
                        offset: offset + delta,
                    },
                    _ => return Err(InterpError::invalid(name, "expects a scalar pointer")),
                }
            }
            OpKind::MakeTensorPtr { .. } => Value::Block(self.make_tensor_ptr(op)?),
            OpKind::Advance => {
                let Value::Block(mut ptr) = self.value(name, operand(op, 0)?)?.clone() else {
                    return Err(InterpError::invalid(name, "expects a block pointer"));
                };
                for (dim, offset) in op.operands[1..].iter().enumerate() {
                    ptr.offsets[dim] += self.scalar_int(name, *offset)?;
                }
                Value::Block(ptr)
            }
            OpKind::Load { boundary_check, .. } => self.load(op, boundary_check)?,
            OpKind::Store { boundary_check } => {
                self.store(op, boundary_check)?;
                return Ok(Vec::new());
            }
            OpKind::Dot { allow_tf32 } => {
                let lhs = self.tile(name, operand(op, 0)?)?;
                let rhs = self.tile(name, operand(op, 1)?)?;
                let acc = self.tile(name, operand(op, 2)?)?;
                Value::Tile(op_dot(lhs, rhs, acc, *allow_tf32)?)
            }
            OpKind::SparseDot => {
                let lhs = self.tile(name, operand(op, 0)?)?;
                let rhs = self.tile(name, operand(op, 1)?)?;
                let acc = self.tile(name, operand(op, 2)?)?;
                let meta = self.tile(name, operand(op, 3)?)?;
                Value::Tile(op_sparse_dot(lhs, rhs, acc, meta)?)
            }
            OpKind::Reduce { axis } => Value::Tile(self.reduce(op, *axis)?),
            OpKind::For => return self.run_for(op),
            OpKind::ReduceReturn | OpKind::Yield | OpKind::Return => {
                return Err(InterpError::invalid(name, "terminator outside block end"));
            }
        };
        Ok(vec![value])
    }

    fn make_tensor_ptr(&self, op: &Operation) -> InterpResult<BlockPtr> {
        let name = op.kind.name();
        let block = dims_of(self.result_type(op)?);
        let rank = block.len();
        let Value::Ptr { arg, offset } = self.value(name, operand(op, 0)?)? else {
            return Err(InterpError::invalid(name, "base must be a scalar pointer"));
        };
        let group = |start: usize| -> InterpResult<Vec<i64>> {
            (0..rank)
                .map(|i| self.scalar_int(name, operand(op, start + i)?))
                .collect()
        };
        Ok(BlockPtr {
            arg: *arg,
            base: *offset,
            shape: group(1)?,
            strides: group(1 + rank)?,
            offsets: group(1 + 2 * rank)?,
            block,
        })
    }

    /// Linear element address of `index` within the block, `None` when a
    /// boundary-checked dimension falls outside the tensor.
    fn locate(
        op: &'static str,
        ptr: &BlockPtr,
        index: &[usize],
        checked: &[usize],
    ) -> InterpResult<Option<i64>> {
        let mut address = ptr.base;
        for (dim, idx) in index.iter().enumerate() {
            let coord = ptr.offsets[dim] + *idx as i64;
            if coord < 0 || coord >= ptr.shape[dim] {
                if checked.contains(&dim) {
                    return Ok(None);
                }
                return Err(InterpError::UncheckedAccess {
                    op,
                    dim,
                    coord,
                    bound: ptr.shape[dim],
                });
            }
            address += coord * ptr.strides[dim];
        }
        Ok(Some(address))
    }

    fn checked_address(&self, op: &'static str, arg: usize, address: i64) -> InterpResult<usize> {
        let len = self.buffers[arg].len();
        if address < 0 || address as usize >= len {
            return Err(InterpError::OutOfBounds {
                op,
                arg,
                address,
                len,
            });
        }
        Ok(address as usize)
    }

    fn load(&self, op: &Operation, checked: &[usize]) -> InterpResult<Value> {
        let name = op.kind.name();
        let elem = self.result_type(op)?.element_type();
        match self.value(name, operand(op, 0)?)? {
            Value::Ptr { arg, offset } => {
                let index = self.checked_address(name, *arg, *offset)?;
                let value = self.buffers[*arg].get(index);
                Ok(Value::Tile(Tile::scalar(elem, value)))
            }
            Value::Block(ptr) => {
                let len: usize = ptr.block.iter().product();
                let mut data = Elems::zeros(elem, len);
                for linear in 0..len {
                    let index = unravel_index(linear, &ptr.block);
                    if let Some(address) = Self::locate(name, ptr, &index, checked)? {
                        let address = self.checked_address(name, ptr.arg, address)?;
                        data.set(elem, linear, self.buffers[ptr.arg].get(address));
                    }
                }
                Ok(Value::Tile(Tile {
                    shape: ptr.block.clone(),
                    elem,
                    data,
                }))
            }
            Value::Tile(_) => Err(InterpError::invalid(name, "cannot load through a tensor")),
        }
    }

    fn store(&mut self, op: &Operation, checked: &[usize]) -> InterpResult<()> {
        let name = op.kind.name();
        let value = self.tile(name, operand(op, 1)?)?.clone();
        match self.value(name, operand(op, 0)?)?.clone() {
            Value::Ptr { arg, offset } => {
                let index = self.checked_address(name, arg, offset)?;
                self.buffers[arg].set(index, value.get(0));
                Ok(())
            }
            Value::Block(ptr) => {
                for linear in 0..value.len() {
                    let index = unravel_index(linear, &ptr.block);
                    if let Some(address) = Self::locate(name, &ptr, &index, checked)? {
                        let address = self.checked_address(name, ptr.arg, address)?;
                        self.buffers[ptr.arg].set(address, value.get(linear));
                    }
                }
                Ok(())
            }
            Value::Tile(_) => Err(InterpError::invalid(name, "cannot store through a tensor")),
        }
    }

    fn reduce(&mut self, op: &Operation, axis: usize) -> InterpResult<Tile> {
        let name = op.kind.name();
        let input = self.tile(name, operand(op, 0)?)?.clone();
        let region = op
            .regions
            .first()
            .ok_or_else(|| InterpError::invalid(name, "missing reducer region"))?;
        if axis >= input.shape.len() {
            return Err(InterpError::invalid(name, format!("axis {axis} out of range")));
        }
        let axis_len = input.shape[axis];
        let outer: usize = input.shape[..axis].iter().product();
        let inner: usize = input.shape[axis + 1..].iter().product();
        let mut shape = input.shape.clone();
        shape.remove(axis);

        let elem = input.elem;
        let mut data = Elems::zeros(elem, outer * inner);
        for o in 0..outer {
            for i in 0..inner {
                let at = |r: usize| o * axis_len * inner + r * inner + i;
                let mut acc = input.get(at(0));
                for r in 1..axis_len {
                    let args = vec![
                        Value::Tile(Tile::scalar(elem, acc)),
                        Value::Tile(Tile::scalar(elem, input.get(at(r)))),
                    ];
                    let returned = self.run_block(region, args)?;
                    acc = match returned.first() {
                        Some(Value::Tile(tile)) => tile.get(0),
                        _ => return Err(InterpError::invalid(name, "reducer returned no value")),
                    };
                }
                data.set(elem, o * inner + i, acc);
            }
        }
        Ok(Tile { shape, elem, data })
    }

    fn run_for(&mut self, op: &Operation) -> InterpResult<Vec<Value>> {
        let name = op.kind.name();
        let lower = self.scalar_int(name, operand(op, 0)?)?;
        let upper = self.scalar_int(name, operand(op, 1)?)?;
        let step = self.scalar_int(name, operand(op, 2)?)?;
        if step <= 0 {
            return Err(InterpError::invalid(name, format!("non-positive step {step}")));
        }
        let bound_elem = self.tile(name, operand(op, 0)?)?.elem;
        let body = op
            .regions
            .first()
            .ok_or_else(|| InterpError::invalid(name, "missing body"))?;
        let mut iters = op.operands[3..]
            .iter()
            .map(|v| self.value(name, *v).cloned())
            .collect::<InterpResult<Vec<_>>>()?;
        let mut iv = lower;
        while iv < upper {
            let mut args = Vec::with_capacity(iters.len() + 1);
            args.push(Value::Tile(Tile::scalar(bound_elem, Scalar::Int(iv))));
            args.extend(iters);
            iters = self.run_block(body, args)?;
            iv += step;
        }
        Ok(iters)
    }
}

fn same_shape(op: &'static str, lhs: &Tile, rhs: &Tile) -> InterpResult<()> {
    if lhs.shape != rhs.shape {
        return Err(InterpError::invalid(
            op,
            format!("shape mismatch {:?} vs {:?}", lhs.shape, rhs.shape),
        ));
    }
    Ok(())
}

fn op_binary(op: BinaryOp, lhs: &Tile, rhs: &Tile) -> InterpResult<Tile> {
    let name = op.name();
    same_shape(name, lhs, rhs)?;
    let elem = lhs.elem;
    match (&lhs.data, &rhs.data) {
        (Elems::Int(a), Elems::Int(b)) => {
            let mut out = Vec::with_capacity(a.len());
            for (x, y) in a.iter().zip(b) {
                let (x, y) = (as_signed(elem, *x), as_signed(elem, *y));
                let value = match op {
                    BinaryOp::AddI => x.wrapping_add(y),
                    BinaryOp::SubI => x.wrapping_sub(y),
                    BinaryOp::MulI => x.wrapping_mul(y),
                    BinaryOp::DivSI | BinaryOp::RemSI if y == 0 => {
                        return Err(InterpError::invalid(name, "integer division by zero"));
                    }
                    BinaryOp::DivSI => x.wrapping_div(y),
                    BinaryOp::RemSI => x.wrapping_rem(y),
                    BinaryOp::AndI => x & y,
                    BinaryOp::OrI => x | y,
                    BinaryOp::XOrI => x ^ y,
                    _ => return Err(InterpError::invalid(name, "float op on integers")),
                };
                out.push(wrap_int(elem, value));
            }
            Ok(Tile {
                shape: lhs.shape.clone(),
                elem,
                data: Elems::Int(out),
            })
        }
        (Elems::Float(a), Elems::Float(b)) => {
            if !op.is_float() {
                return Err(InterpError::invalid(name, "integer op on floats"));
            }
            Ok(Tile::from_fn(&lhs.shape, elem, |i| {
                let (x, y) = (a[i], b[i]);
                Scalar::Float(match op {
                    BinaryOp::AddF => x + y,
                    BinaryOp::SubF => x - y,
                    BinaryOp::MulF => x * y,
                    _ => x / y,
                })
            }))
        }
        _ => Err(InterpError::invalid(name, "operand kinds differ")),
    }
}

fn op_unary(op: UnaryOp, input: &Tile) -> Tile {
    Tile::from_fn(&input.shape, input.elem, |i| match (op, input.get(i)) {
        (_, Scalar::Int(v)) => Scalar::Int(as_signed(input.elem, v).wrapping_abs()),
        (_, Scalar::Float(v)) => Scalar::Float(v.abs()),
    })
}

fn op_cmpi(pred: CmpIPredicate, lhs: &Tile, rhs: &Tile) -> Tile {
    let elem = lhs.elem;
    Tile::from_fn(&lhs.shape, ScalarType::I1, |i| {
        let (a, b) = (lhs.get(i).as_i64(), rhs.get(i).as_i64());
        let (sa, sb) = (as_signed(elem, a), as_signed(elem, b));
        let (ua, ub) = (as_unsigned(elem, a), as_unsigned(elem, b));
        let result = match pred {
            CmpIPredicate::Eq => ua == ub,
            CmpIPredicate::Ne => ua != ub,
            CmpIPredicate::Slt => sa < sb,
            CmpIPredicate::Sle => sa <= sb,
            CmpIPredicate::Sgt => sa > sb,
            CmpIPredicate::Sge => sa >= sb,
            CmpIPredicate::Ult => ua < ub,
            CmpIPredicate::Ule => ua <= ub,
            CmpIPredicate::Ugt => ua > ub,
            CmpIPredicate::Uge => ua >= ub,
        };
        Scalar::Int(i64::from(result))
    })
}

fn op_cmpf(pred: CmpFPredicate, lhs: &Tile, rhs: &Tile) -> Tile {
    Tile::from_fn(&lhs.shape, ScalarType::I1, |i| {
        let (a, b) = (lhs.get(i).as_f64(), rhs.get(i).as_f64());
        let unordered = a.is_nan() || b.is_nan();
        let result = match pred {
            CmpFPredicate::Oeq => !unordered && a == b,
            CmpFPredicate::One => !unordered && a != b,
            CmpFPredicate::Olt => !unordered && a < b,
            CmpFPredicate::Ole => !unordered && a <= b,
            CmpFPredicate::Ogt => !unordered && a > b,
            CmpFPredicate::Oge => !unordered && a >= b,
            CmpFPredicate::Ueq => unordered || a == b,
            CmpFPredicate::Une => unordered || a != b,
            CmpFPredicate::Ult => unordered || a < b,
            CmpFPredicate::Ule => unordered || a <= b,
            CmpFPredicate::Ugt => unordered || a > b,
            CmpFPredicate::Uge => unordered || a >= b,
        };
        Scalar::Int(i64::from(result))
    })
}

fn op_select(cond: &Tile, on_true: &Tile, on_false: &Tile) -> InterpResult<Tile> {
    same_shape("arith.select", on_true, on_false)?;
    let uniform = cond.shape.is_empty();
    if !uniform && cond.shape != on_true.shape {
        return Err(InterpError::invalid(
            "arith.select",
            format!("condition shape {:?} mismatches {:?}", cond.shape, on_true.shape),
        ));
    }
    Ok(Tile::from_fn(&on_true.shape, on_true.elem, |i| {
        let take = cond.get(if uniform { 0 } else { i }).as_i64() & 1 == 1;
        if take {
            on_true.get(i)
        } else {
            on_false.get(i)
        }
    }))
}

fn op_cast(op: CastOp, input: &Tile, dst: ScalarType) -> Tile {
    let src = input.elem;
    Tile::from_fn(&input.shape, dst, |i| {
        let value = input.get(i);
        match op {
            CastOp::ExtF | CastOp::TruncF => Scalar::Float(value.as_f64()),
            CastOp::ExtSI => Scalar::Int(as_signed(src, value.as_i64())),
            CastOp::ExtUI => Scalar::Int(as_unsigned(src, value.as_i64()) as i64),
            CastOp::TruncI => Scalar::Int(value.as_i64()),
            CastOp::SIToFP => Scalar::Float(as_signed(src, value.as_i64()) as f64),
            CastOp::UIToFP => Scalar::Float(as_unsigned(src, value.as_i64()) as f64),
            CastOp::FPToSI => Scalar::Int(float_to_int(dst, value.as_f64())),
            CastOp::Bitcast => {
                let bits = if src.is_float() {
                    float_to_bits(src, value.as_f64())
                } else {
                    as_unsigned(src, value.as_i64())
                };
                if dst.is_float() {
                    Scalar::Float(float_from_bits(dst, bits))
                } else {
                    Scalar::Int(bits as i64)
                }
            }
        }
    })
}

fn op_extern(symbol: &str, args: &[&Tile], elem: ScalarType) -> InterpResult<Tile> {
    let name = math_base_name(symbol);
    let first = args
        .first()
        .ok_or_else(|| InterpError::invalid("tt.extern_elementwise", "no arguments"))?;
    if math_function(name, &vec![1.0; args.len()]).is_none() {
        return Err(InterpError::invalid(
            "tt.extern_elementwise",
            format!("unknown device function {symbol}"),
        ));
    }
    Ok(Tile::from_fn(&first.shape, elem, |i| {
        let inputs: Vec<f64> = args.iter().map(|arg| arg.get(i).as_f64()).collect();
        Scalar::Float(math_function(name, &inputs).unwrap_or(f64::NAN))
    }))
}

fn op_broadcast(input: &Tile, shape: &[usize]) -> Tile {
    let src_strides = compute_strides(&input.shape);
    Tile::from_fn(shape, input.elem, |linear| {
        let coords = unravel_index(linear, shape);
        let index = coords
            .iter()
            .zip(&input.shape)
            .zip(&src_strides)
            .map(|((coord, dim), stride)| if *dim == 1 { 0 } else { coord * stride })
            .sum();
        input.get(index)
    })
}

fn dot_shapes(lhs: &Tile, rhs: &Tile, acc: &Tile, sparse: bool) -> InterpResult<(usize, usize, usize)> {
    let op = if sparse { "triton_gpu.sparse_dot" } else { "tt.dot" };
    if lhs.shape.len() != 2 || rhs.shape.len() != 2 || acc.shape.len() != 2 {
        return Err(InterpError::invalid(op, "operands must be rank 2"));
    }
    let (m, n) = (lhs.shape[0], rhs.shape[1]);
    let k = rhs.shape[0];
    let lhs_k = if sparse { lhs.shape[1] * 2 } else { lhs.shape[1] };
    if lhs_k != k || acc.shape != [m, n] {
        return Err(InterpError::invalid(
            op,
            format!(
                "incompatible shapes {:?} x {:?} + {:?}",
                lhs.shape, rhs.shape, acc.shape
            ),
        ));
    }
    Ok((m, n, k))
}

fn op_dot(lhs: &Tile, rhs: &Tile, acc: &Tile, allow_tf32: bool) -> InterpResult<Tile> {
    let (_, n, k) = dot_shapes(lhs, rhs, acc, false)?;
    let tf32 = allow_tf32 && lhs.elem == ScalarType::F32;
    let input = |tile: &Tile, index: usize| {
        let value = tile.get(index).as_f64();
        if tf32 {
            round_to_tf32(value)
        } else {
            value
        }
    };
    Ok(Tile::from_fn(&acc.shape, acc.elem, |index| {
        let (row, col) = (index / n, index % n);
        let sum: f64 = (0..k)
            .map(|kk| input(lhs, row * k + kk) * input(rhs, kk * n + col))
            .sum();
        if acc.elem.is_float() {
            Scalar::Float(acc.get(index).as_f64() + sum)
        } else {
            Scalar::Int(acc.get(index).as_i64().wrapping_add(sum as i64))
        }
    }))
}

/// 2:4 sparse product. Each group of four K positions keeps two LHS values;
/// their positions are 2-bit indices packed eight per 16-bit metadata word.
fn op_sparse_dot(lhs: &Tile, rhs: &Tile, acc: &Tile, meta: &Tile) -> InterpResult<Tile> {
    let (m, n, k) = dot_shapes(lhs, rhs, acc, true)?;
    let groups = k / 4;
    let words = k / 16;
    if meta.shape != [m, words] {
        return Err(InterpError::invalid(
            "triton_gpu.sparse_dot",
            format!("metadata shape {:?} does not cover K={k}", meta.shape),
        ));
    }
    let packed = k / 2;
    Ok(Tile::from_fn(&acc.shape, acc.elem, |index| {
        let (row, col) = (index / n, index % n);
        let mut sum = 0.0;
        for group in 0..groups {
            let word = as_unsigned(ScalarType::I16, meta.get(row * words + group / 4).as_i64());
            let shift = (group % 4) * 4;
            for slot in 0..2 {
                let position = ((word >> (shift + 2 * slot)) & 3) as usize;
                let kk = group * 4 + position;
                let a = lhs.get(row * packed + group * 2 + slot).as_f64();
                sum += a * rhs.get(kk * n + col).as_f64();
            }
        }
        Scalar::Float(acc.get(index).as_f64() + sum)
    }))
}
