use tilefuse::ir::passes::run_cleanup_pipeline;
use tilefuse::ir::{
    print_module, verify_func, BinaryOp, CmpIPredicate, FuncBuilder, Module, ProgramIdDim,
    ScalarType, Type,
};

fn accumulate_kernel() -> FuncBuilder {
    let f32_tile = Type::tensor(&[16], ScalarType::F32);
    let mut b = FuncBuilder::new("accumulate", &[Type::Ptr(ScalarType::F32)]);
    b.set_arg_divisibility(0, 16);
    let out = b.arg(0);

    let pid = b.program_id(ProgramIdDim::X);
    let zero = b.const_i32(0);
    let four = b.const_i32(4);
    let one = b.const_i32(1);
    let acc0 = b.float_const(&f32_tile, 0.0);

    let args = b.begin_block(&[Type::Scalar(ScalarType::I32), f32_tile.clone()]);
    let (iv, acc) = (args[0], args[1]);
    let iv_plus_zero = b.binary(BinaryOp::AddI, iv, zero);
    let as_float = b.cast(tilefuse::ir::CastOp::SIToFP, iv_plus_zero, ScalarType::F32);
    let splat = b.splat(as_float, &[16]);
    let next = b.binary(BinaryOp::AddF, acc, splat);
    b.yield_values(&[next]);
    let body = b.end_block().expect("loop body is open");
    let results = b.for_loop(zero, four, one, &[acc0], body);

    let wide_pid = b.cast(tilefuse::ir::CastOp::ExtSI, pid, ScalarType::I64);
    let sixteen = b.const_i64(16);
    let offset = b.binary(BinaryOp::MulI, wide_pid, sixteen);
    let base = b.add_ptr(out, offset);
    let size = b.const_i64(64);
    let stride = b.const_i64(1);
    let tile = b.make_tensor_ptr(base, &[size], &[stride], &[zero], &[16], &[0]);
    b.store(tile, results[0], &[0]);
    let _unused = b.cmpi(CmpIPredicate::Slt, pid, four);
    b.ret();
    b
}

#[test]
fn built_kernel_verifies_and_prints() {
    let func = accumulate_kernel().finish().expect("all blocks closed");
    verify_func(&func).expect("kernel should verify");

    let text = print_module(&Module {
        name: "m".to_string(),
        func,
    });
    assert!(text.contains("tt.func public @accumulate(%0: !tt.ptr<f32> {tt.divisibility = 16 : i32})"));
    assert!(text.contains("scf.for"));
    assert!(text.contains("scf.yield"));
    assert!(text.contains("tt.make_tensor_ptr"));
    assert!(text.contains("boundaryCheck = array<i32: 0>"));
}

#[test]
fn cleanup_removes_dead_and_identity_ops() {
    let mut func = accumulate_kernel().finish().expect("all blocks closed");
    let before = func.op_count();
    let result = run_cleanup_pipeline(&mut func);
    assert!(result.changed);
    assert!(func.op_count() < before);
    assert!(func.ops_named("arith.cmpi").is_empty());
    assert!(func.ops_named("arith.addi").is_empty());
    assert_eq!(func.ops_named("tt.store").len(), 1);
    verify_func(&func).expect("cleanup keeps the kernel valid");
}

#[test]
fn unclosed_blocks_are_reported() {
    let mut b = FuncBuilder::new("k", &[]);
    b.begin_block(&[]);
    assert!(b.finish().is_err());
}
