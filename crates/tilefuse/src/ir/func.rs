use serde::{Deserialize, Serialize};

use super::ops::{
    BinaryOp, Block, CastOp, CmpFPredicate, CmpIPredicate, Constant, OpKind, Operation, Padding,
    ProgramIdDim, UnaryOp, ValueId,
};
use super::types::{ScalarType, TensorType, Type};
use super::verify::VerifyError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgAttrs {
    /// Alignment hint in elements (`tt.divisibility`).
    pub divisibility: Option<u32>,
}

/// A kernel function. The entry block arguments are the function parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Func {
    pub name: String,
    pub body: Block,
    pub arg_attrs: Vec<ArgAttrs>,
    types: Vec<Type>,
}

impl Func {
    pub fn args(&self) -> &[ValueId] {
        &self.body.args
    }

    pub fn value_type(&self, value: ValueId) -> Option<&Type> {
        self.types.get(value.0 as usize)
    }

    pub fn num_values(&self) -> usize {
        self.types.len()
    }

    pub fn arg_types(&self) -> Vec<&Type> {
        self.body
            .args
            .iter()
            .filter_map(|arg| self.value_type(*arg))
            .collect()
    }

    /// Number of operations including those nested in regions.
    pub fn op_count(&self) -> usize {
        let mut count = 0;
        self.body.walk(&mut |_| count += 1);
        count
    }

    /// Operations of one kind in program order.
    pub fn ops_named(&self, name: &str) -> Vec<&Operation> {
        let mut found = Vec::new();
        self.body.walk(&mut |op| {
            if op.kind.name() == name {
                found.push(op);
            }
        });
        found
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    pub func: Func,
}

/// Builder context for a kernel function.
///
/// Holds the value table and a stack of open blocks. New operations are
/// appended to the innermost open block, so loop bodies and reducer regions
/// are built by opening a block, emitting into it, and closing it before the
/// owning operation is created.
pub struct FuncBuilder {
    name: String,
    types: Vec<Type>,
    arg_attrs: Vec<ArgAttrs>,
    entry: Block,
    nested: Vec<Block>,
}

impl FuncBuilder {
    pub fn new(name: impl Into<String>, arg_types: &[Type]) -> Self {
        let mut builder = Self {
            name: name.into(),
            types: Vec::new(),
            arg_attrs: vec![ArgAttrs::default(); arg_types.len()],
            entry: Block::default(),
            nested: Vec::new(),
        };
        let args = arg_types
            .iter()
            .map(|ty| builder.new_value(ty.clone()))
            .collect();
        builder.entry.args = args;
        builder
    }

    pub fn arg(&self, index: usize) -> ValueId {
        self.entry.args[index]
    }

    pub fn num_args(&self) -> usize {
        self.entry.args.len()
    }

    pub fn set_arg_divisibility(&mut self, index: usize, divisibility: u32) {
        if let Some(attrs) = self.arg_attrs.get_mut(index) {
            attrs.divisibility = Some(divisibility);
        }
    }

    pub fn ty(&self, value: ValueId) -> &Type {
        &self.types[value.0 as usize]
    }

    pub fn elem(&self, value: ValueId) -> ScalarType {
        self.ty(value).element_type()
    }

    fn new_value(&mut self, ty: Type) -> ValueId {
        let id = ValueId(self.types.len() as u32);
        self.types.push(ty);
        id
    }

    /// Opens a nested block and returns its argument values.
    pub fn begin_block(&mut self, arg_types: &[Type]) -> Vec<ValueId> {
        let args: Vec<ValueId> = arg_types.iter().map(|ty| self.new_value(ty.clone())).collect();
        self.nested.push(Block {
            args: args.clone(),
            ops: Vec::new(),
        });
        args
    }

    /// Closes the innermost nested block. The entry block cannot be closed.
    pub fn end_block(&mut self) -> Option<Block> {
        self.nested.pop()
    }

    pub fn create(
        &mut self,
        kind: OpKind,
        operands: &[ValueId],
        result_types: Vec<Type>,
        regions: Vec<Block>,
    ) -> Vec<ValueId> {
        let results: Vec<ValueId> = result_types
            .into_iter()
            .map(|ty| self.new_value(ty))
            .collect();
        let block = self.nested.last_mut().unwrap_or(&mut self.entry);
        block.ops.push(Operation {
            kind,
            operands: operands.to_vec(),
            results: results.clone(),
            regions,
        });
        results
    }

    fn create1(&mut self, kind: OpKind, operands: &[ValueId], result_type: Type) -> ValueId {
        self.create(kind, operands, vec![result_type], Vec::new())[0]
    }

    /// Constant of type `ty`; the literal is coerced to the element kind.
    pub fn constant(&mut self, ty: &Type, value: Constant) -> ValueId {
        let value = match (ty.element_type().is_float(), value) {
            (true, Constant::Int(v)) => Constant::Float(v as f64),
            (false, Constant::Float(v)) => Constant::Int(v as i64),
            (_, value) => value,
        };
        self.create1(OpKind::Constant(value), &[], ty.clone())
    }

    pub fn int_const(&mut self, ty: &Type, value: i64) -> ValueId {
        self.constant(ty, Constant::Int(value))
    }

    pub fn float_const(&mut self, ty: &Type, value: f64) -> ValueId {
        self.constant(ty, Constant::Float(value))
    }

    pub fn const_i32(&mut self, value: i64) -> ValueId {
        self.int_const(&Type::Scalar(ScalarType::I32), value)
    }

    pub fn const_i64(&mut self, value: i64) -> ValueId {
        self.int_const(&Type::Scalar(ScalarType::I64), value)
    }

    pub fn binary(&mut self, op: BinaryOp, lhs: ValueId, rhs: ValueId) -> ValueId {
        let ty = self.ty(lhs).clone();
        self.create1(OpKind::Binary(op), &[lhs, rhs], ty)
    }

    pub fn unary(&mut self, op: UnaryOp, operand: ValueId) -> ValueId {
        let ty = self.ty(operand).clone();
        self.create1(OpKind::Unary(op), &[operand], ty)
    }

    pub fn cmpi(&mut self, pred: CmpIPredicate, lhs: ValueId, rhs: ValueId) -> ValueId {
        let ty = self.ty(lhs).with_element(ScalarType::I1);
        self.create1(OpKind::CmpI(pred), &[lhs, rhs], ty)
    }

    pub fn cmpf(&mut self, pred: CmpFPredicate, lhs: ValueId, rhs: ValueId) -> ValueId {
        let ty = self.ty(lhs).with_element(ScalarType::I1);
        self.create1(OpKind::CmpF(pred), &[lhs, rhs], ty)
    }

    pub fn select(&mut self, cond: ValueId, on_true: ValueId, on_false: ValueId) -> ValueId {
        let ty = self.ty(on_true).clone();
        self.create1(OpKind::Select, &[cond, on_true, on_false], ty)
    }

    pub fn cast(&mut self, op: CastOp, operand: ValueId, elem: ScalarType) -> ValueId {
        let ty = self.ty(operand).with_element(elem);
        self.create1(OpKind::Cast(op), &[operand], ty)
    }

    pub fn extern_elementwise(
        &mut self,
        library: &str,
        path: &str,
        symbol: &str,
        pure: bool,
        args: &[ValueId],
        elem: ScalarType,
    ) -> ValueId {
        let ty = self.ty(args[0]).with_element(elem);
        self.create1(
            OpKind::ExternElementwise {
                library: library.to_string(),
                path: path.to_string(),
                symbol: symbol.to_string(),
                pure,
            },
            args,
            ty,
        )
    }

    pub fn splat(&mut self, operand: ValueId, shape: &[i64]) -> ValueId {
        let ty = Type::tensor(shape, self.elem(operand));
        self.create1(OpKind::Splat, &[operand], ty)
    }

    pub fn broadcast(&mut self, operand: ValueId, shape: &[i64]) -> ValueId {
        let ty = Type::tensor(shape, self.elem(operand));
        self.create1(OpKind::Broadcast, &[operand], ty)
    }

    pub fn expand_dims(&mut self, operand: ValueId, axis: usize) -> ValueId {
        let mut shape = self.ty(operand).shape().to_vec();
        shape.insert(axis.min(shape.len()), 1);
        let ty = Type::tensor(&shape, self.elem(operand));
        self.create1(OpKind::ExpandDims { axis }, &[operand], ty)
    }

    /// `[start, end)` as an `i32` tensor.
    pub fn make_range(&mut self, start: i32, end: i32) -> ValueId {
        let ty = Type::tensor(&[i64::from(end - start)], ScalarType::I32);
        self.create1(OpKind::MakeRange { start, end }, &[], ty)
    }

    pub fn program_id(&mut self, dim: ProgramIdDim) -> ValueId {
        self.create1(
            OpKind::GetProgramId(dim),
            &[],
            Type::Scalar(ScalarType::I32),
        )
    }

    pub fn add_ptr(&mut self, ptr: ValueId, offset: ValueId) -> ValueId {
        let ty = self.ty(ptr).clone();
        self.create1(OpKind::AddPtr, &[ptr, offset], ty)
    }

    pub fn make_tensor_ptr(
        &mut self,
        base: ValueId,
        shape: &[ValueId],
        strides: &[ValueId],
        offsets: &[ValueId],
        block_shape: &[i64],
        order: &[i32],
    ) -> ValueId {
        let ty = Type::BlockPtr(TensorType::new(block_shape, self.elem(base)));
        let mut operands = Vec::with_capacity(1 + shape.len() * 3);
        operands.push(base);
        operands.extend_from_slice(shape);
        operands.extend_from_slice(strides);
        operands.extend_from_slice(offsets);
        self.create1(
            OpKind::MakeTensorPtr {
                order: order.to_vec(),
            },
            &operands,
            ty,
        )
    }

    pub fn advance(&mut self, ptr: ValueId, offsets: &[ValueId]) -> ValueId {
        let ty = self.ty(ptr).clone();
        let mut operands = vec![ptr];
        operands.extend_from_slice(offsets);
        self.create1(OpKind::Advance, &operands, ty)
    }

    pub fn load(
        &mut self,
        ptr: ValueId,
        boundary_check: &[usize],
        padding: Option<Padding>,
    ) -> ValueId {
        let ty = self
            .ty(ptr)
            .pointee()
            .unwrap_or_else(|| self.ty(ptr).clone());
        self.create1(
            OpKind::Load {
                boundary_check: boundary_check.to_vec(),
                padding,
            },
            &[ptr],
            ty,
        )
    }

    pub fn store(&mut self, ptr: ValueId, value: ValueId, boundary_check: &[usize]) {
        self.create(
            OpKind::Store {
                boundary_check: boundary_check.to_vec(),
            },
            &[ptr, value],
            Vec::new(),
            Vec::new(),
        );
    }

    pub fn dot(&mut self, lhs: ValueId, rhs: ValueId, acc: ValueId, allow_tf32: bool) -> ValueId {
        let ty = self.ty(acc).clone();
        self.create1(OpKind::Dot { allow_tf32 }, &[lhs, rhs, acc], ty)
    }

    pub fn sparse_dot(
        &mut self,
        lhs: ValueId,
        rhs: ValueId,
        acc: ValueId,
        meta: ValueId,
    ) -> ValueId {
        let ty = self.ty(acc).clone();
        self.create1(OpKind::SparseDot, &[lhs, rhs, acc, meta], ty)
    }

    /// Reduces `input` along `axis` with `region`. Reducing the last axis of a
    /// rank-1 tensor yields a scalar.
    pub fn reduce(&mut self, input: ValueId, axis: usize, region: Block) -> ValueId {
        let mut shape = self.ty(input).shape().to_vec();
        if axis < shape.len() {
            shape.remove(axis);
        }
        let elem = self.elem(input);
        let ty = if shape.is_empty() {
            Type::Scalar(elem)
        } else {
            Type::tensor(&shape, elem)
        };
        self.create(OpKind::Reduce { axis }, &[input], vec![ty], vec![region])[0]
    }

    pub fn reduce_return(&mut self, value: ValueId) {
        self.create(OpKind::ReduceReturn, &[value], Vec::new(), Vec::new());
    }

    /// `scf.for` over `[lower, upper)`; `body` must end with a yield.
    pub fn for_loop(
        &mut self,
        lower: ValueId,
        upper: ValueId,
        step: ValueId,
        inits: &[ValueId],
        body: Block,
    ) -> Vec<ValueId> {
        let result_types = inits.iter().map(|init| self.ty(*init).clone()).collect();
        let mut operands = vec![lower, upper, step];
        operands.extend_from_slice(inits);
        self.create(OpKind::For, &operands, result_types, vec![body])
    }

    pub fn yield_values(&mut self, values: &[ValueId]) {
        self.create(OpKind::Yield, values, Vec::new(), Vec::new());
    }

    pub fn ret(&mut self) {
        self.create(OpKind::Return, &[], Vec::new(), Vec::new());
    }

    /// Seals the function. Fails if a nested block was left open.
    pub fn finish(self) -> Result<Func, VerifyError> {
        if !self.nested.is_empty() {
            return Err(VerifyError::structure(
                "func",
                format!("{} nested blocks left open", self.nested.len()),
            ));
        }
        Ok(Func {
            name: self.name,
            body: self.entry,
            arg_attrs: self.arg_attrs,
            types: self.types,
        })
    }
}
