use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tilefuse::ir::{BinaryOp, Func, FuncBuilder, Padding, ProgramIdDim, ScalarType, Type};
use tilefuse_backend_ref_cpu::{HostBuffer, InterpError, Interpreter};

const BLOCK: i64 = 8;

/// `out[i] = x[i] + y[i]` over `len` elements, one block of 8 per program.
fn vector_add(len: i64, checked: bool) -> Func {
    let ptr = Type::Ptr(ScalarType::F32);
    let mut b = FuncBuilder::new("vector_add", &[ptr.clone(), ptr.clone(), ptr]);
    let pid = b.program_id(ProgramIdDim::X);
    let block = b.const_i32(BLOCK);
    let offset = b.binary(BinaryOp::MulI, pid, block);
    let boundary: &[usize] = if checked { &[0] } else { &[] };

    let block_ptr = |b: &mut FuncBuilder, arg: usize| {
        let base = b.arg(arg);
        let shape = b.const_i64(len);
        let stride = b.const_i64(1);
        let zero = b.const_i32(0);
        let ptr = b.make_tensor_ptr(base, &[shape], &[stride], &[zero], &[BLOCK], &[0]);
        b.advance(ptr, &[offset])
    };
    let x_ptr = block_ptr(&mut b, 0);
    let y_ptr = block_ptr(&mut b, 1);
    let out_ptr = block_ptr(&mut b, 2);
    let x = b.load(x_ptr, boundary, checked.then_some(Padding::Zero));
    let y = b.load(y_ptr, boundary, checked.then_some(Padding::Zero));
    let sum = b.binary(BinaryOp::AddF, x, y);
    b.store(out_ptr, sum, boundary);
    b.ret();
    b.finish().unwrap()
}

#[test]
fn vector_add_masks_the_ragged_tail() {
    let len = 10usize;
    let mut rng = StdRng::seed_from_u64(7);
    let x: Vec<f32> = (0..len).map(|_| rng.gen_range(-4.0..4.0)).collect();
    let y: Vec<f32> = (0..len).map(|_| rng.gen_range(-4.0..4.0)).collect();
    let mut buffers = vec![
        HostBuffer::from_f32(&x),
        HostBuffer::from_f32(&y),
        HostBuffer::zeros(ScalarType::F32, len),
    ];

    let func = vector_add(len as i64, true);
    Interpreter::new(&func)
        .launch([2, 1, 1], &mut buffers)
        .unwrap();

    let out = buffers[2].to_f32_vec();
    for i in 0..len {
        assert_eq!(out[i], x[i] + y[i], "element {i}");
    }
}

#[test]
fn unchecked_out_of_range_access_is_reported() {
    let mut buffers = vec![
        HostBuffer::zeros(ScalarType::F32, 10),
        HostBuffer::zeros(ScalarType::F32, 10),
        HostBuffer::zeros(ScalarType::F32, 10),
    ];
    let func = vector_add(10, false);
    let err = Interpreter::new(&func)
        .launch([2, 1, 1], &mut buffers)
        .unwrap_err();
    assert!(
        matches!(err, InterpError::UncheckedAccess { dim: 0, .. }),
        "unexpected error: {err}"
    );
}

#[test]
fn argument_types_must_match_buffers() {
    let func = vector_add(8, true);
    let mut buffers = vec![
        HostBuffer::from_i32(&[0; 8]),
        HostBuffer::zeros(ScalarType::F32, 8),
        HostBuffer::zeros(ScalarType::F32, 8),
    ];
    let err = Interpreter::new(&func)
        .launch([1, 1, 1], &mut buffers)
        .unwrap_err();
    assert!(matches!(err, InterpError::ArgumentType { index: 0, .. }));
}

#[test]
fn row_sums_run_the_reducer_region() {
    let rows = 3i64;
    let ptr = Type::Ptr(ScalarType::F32);
    let mut b = FuncBuilder::new("row_sum", &[ptr.clone(), ptr]);
    let pid = b.program_id(ProgramIdDim::X);
    let pid64 = b.cast(tilefuse::ir::CastOp::ExtSI, pid, ScalarType::I64);
    let width = b.const_i64(BLOCK);
    let row_offset = b.binary(BinaryOp::MulI, pid64, width);
    let row_base = b.add_ptr(b.arg(0), row_offset);
    let shape = b.const_i64(BLOCK);
    let stride = b.const_i64(1);
    let zero = b.const_i32(0);
    let row_ptr = b.make_tensor_ptr(row_base, &[shape], &[stride], &[zero], &[BLOCK], &[0]);
    let row = b.load(row_ptr, &[], None);

    let f32_ty = Type::Scalar(ScalarType::F32);
    let args = b.begin_block(&[f32_ty.clone(), f32_ty]);
    let partial = b.binary(BinaryOp::AddF, args[0], args[1]);
    b.reduce_return(partial);
    let region = b.end_block().unwrap();
    let total = b.reduce(row, 0, region);

    let out = b.add_ptr(b.arg(1), pid);
    b.store(out, total, &[]);
    b.ret();
    let func = b.finish().unwrap();
    tilefuse::ir::verify_func(&func).unwrap();

    let input: Vec<f32> = (0..rows * BLOCK).map(|i| i as f32).collect();
    let mut buffers = vec![
        HostBuffer::from_f32(&input),
        HostBuffer::zeros(ScalarType::F32, rows as usize),
    ];
    Interpreter::new(&func)
        .launch([rows, 1, 1], &mut buffers)
        .unwrap();

    let sums = buffers[1].to_f32_vec();
    for row in 0..rows as usize {
        let expected: f32 = input[row * 8..row * 8 + 8].iter().sum();
        assert_eq!(sums[row], expected);
    }
}
