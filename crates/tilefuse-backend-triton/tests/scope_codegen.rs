use half::bf16;
use tilefuse::analysis::Scope;
use tilefuse::config::DeviceDescription;
use tilefuse::hlo::{ComputationId, HloModule, Opcode, PrimitiveType, Shape};
use tilefuse::ir::{Func, FuncBuilder, ScalarType, Type, ValueId};
use tilefuse_backend_ref_cpu::{HostBuffer, Interpreter};
use tilefuse_backend_triton::codegen::types::cast;
use tilefuse_backend_triton::codegen::{emit_parameter_load, emit_scope, EmitContext, ValueEnv};

const LEN: i64 = 4;

fn block_pointer(b: &mut FuncBuilder, arg: usize) -> ValueId {
    let base = b.arg(arg);
    let shape = b.const_i64(LEN);
    let stride = b.const_i64(1);
    let zero = b.const_i32(0);
    b.make_tensor_ptr(base, &[shape], &[stride], &[zero], &[LEN], &[0])
}

fn binary_computation(opcode: Opcode) -> (HloModule, ComputationId) {
    let mut module = HloModule::new("m");
    let mut b = module.builder("fused");
    let x = b.parameter(0, Shape::array(PrimitiveType::F32, &[LEN]));
    let y = b.parameter(1, Shape::array(PrimitiveType::F32, &[LEN]));
    let root = b.elementwise(opcode, &[x, y]);
    let computation = b.finish(root);
    (module, computation)
}

/// `out = opcode(x, y)` over four f32 lanes.
fn binary_kernel(opcode: Opcode) -> Func {
    let (module, computation) = binary_computation(opcode);
    let device = DeviceDescription::a100();
    let cx = EmitContext {
        module: &module,
        device: &device,
    };
    let ptr = Type::Ptr(ScalarType::F32);
    let mut b = FuncBuilder::new("binary", &[ptr.clone(), ptr.clone(), ptr]);
    let mut values = ValueEnv::new();
    for (number, &parameter) in module.computation(computation).parameters.iter().enumerate() {
        let pointer = block_pointer(&mut b, number);
        let loaded = emit_parameter_load(&mut b, pointer, &[]);
        values.insert(parameter, loaded).unwrap();
    }
    let result = emit_scope(
        &mut b,
        &cx,
        None,
        Scope::Output,
        &[],
        &module.post_order(computation),
        &mut values,
    )
    .unwrap();
    let out = block_pointer(&mut b, 2);
    b.store(out, result, &[]);
    b.ret();
    b.finish().unwrap()
}

fn run_binary(opcode: Opcode, x: &[f32], y: &[f32]) -> Vec<f32> {
    let func = binary_kernel(opcode);
    let mut buffers = vec![
        HostBuffer::from_f32(x),
        HostBuffer::from_f32(y),
        HostBuffer::zeros(ScalarType::F32, LEN as usize),
    ];
    Interpreter::new(&func).launch([1, 1, 1], &mut buffers).unwrap();
    buffers[2].to_f32_vec()
}

#[test]
fn maximum_and_minimum_propagate_nan() {
    let x = [1.0, f32::NAN, f32::NAN, 5.0];
    let y = [f32::NAN, 2.0, f32::NAN, 3.0];
    for opcode in [Opcode::Maximum, Opcode::Minimum] {
        let out = run_binary(opcode, &x, &y);
        assert!(out[..3].iter().all(|v| v.is_nan()), "{opcode:?}: {out:?}");
    }
    assert_eq!(run_binary(Opcode::Maximum, &x, &y)[3], 5.0);
    assert_eq!(run_binary(Opcode::Minimum, &x, &y)[3], 3.0);
}

#[test]
fn signed_zero_maximum_is_deterministic() {
    let x = [0.0, -0.0, 0.0, -0.0];
    let y = [-0.0, 0.0, 0.0, -0.0];
    let first = run_binary(Opcode::Maximum, &x, &y);
    let second = run_binary(Opcode::Maximum, &x, &y);
    let bits = |values: &[f32]| values.iter().map(|v| v.to_bits()).collect::<Vec<_>>();
    assert_eq!(bits(&first), bits(&second));
    assert!(first.iter().all(|v| *v == 0.0));
}

#[test]
fn math_library_ops_call_device_functions() {
    let func = binary_kernel(Opcode::Power);
    let calls = func.ops_named("tt.extern_elementwise");
    assert_eq!(calls.len(), 1);
    match &calls[0].kind {
        tilefuse::ir::OpKind::ExternElementwise { symbol, path, .. } => {
            assert_eq!(symbol, "__nv_powf");
            assert_eq!(path, &DeviceDescription::a100().libdevice_path);
        }
        other => panic!("unexpected op {other:?}"),
    }

    let out = {
        let mut buffers = vec![
            HostBuffer::from_f32(&[2.0, 3.0, 4.0, 9.0]),
            HostBuffer::from_f32(&[3.0, 2.0, 0.5, 0.5]),
            HostBuffer::zeros(ScalarType::F32, LEN as usize),
        ];
        Interpreter::new(&func).launch([1, 1, 1], &mut buffers).unwrap();
        buffers[2].to_f32_vec()
    };
    assert_eq!(out, vec![8.0, 9.0, 2.0, 3.0]);
}

#[test]
fn unsupported_opcodes_are_reported() {
    let mut module = HloModule::new("m");
    let mut hb = module.builder("fused");
    let x = hb.parameter(0, Shape::array(PrimitiveType::F32, &[LEN]));
    let iota = hb.reshape_like(Opcode::Iota, x, Shape::array(PrimitiveType::F32, &[LEN]));
    let computation = hb.finish(iota);

    let device = DeviceDescription::a100();
    let cx = EmitContext {
        module: &module,
        device: &device,
    };
    let mut b = FuncBuilder::new("k", &[Type::Ptr(ScalarType::F32)]);
    let pointer = block_pointer(&mut b, 0);
    let loaded = emit_parameter_load(&mut b, pointer, &[]);
    let mut values = ValueEnv::new();
    values.insert(x, loaded).unwrap();
    let err = emit_scope(
        &mut b,
        &cx,
        None,
        Scope::Output,
        &[],
        &module.post_order(computation),
        &mut values,
    )
    .unwrap_err();
    let message = err.to_string();
    assert!(message.starts_with("unsupported: Unsupported operation"), "{message}");
    assert!(message.contains("(iota)"), "{message}");
}

/// Loads `src`, widens to `wide`, narrows back and stores.
fn round_trip_kernel(src: ScalarType, wide: ScalarType) -> Func {
    let ptr = Type::Ptr(src);
    let mut b = FuncBuilder::new("round_trip", &[ptr.clone(), ptr]);
    let input = block_pointer(&mut b, 0);
    let loaded = emit_parameter_load(&mut b, input, &[]);
    let widened = cast(&mut b, loaded, wide).unwrap();
    let narrowed = cast(&mut b, widened, src).unwrap();
    let output = block_pointer(&mut b, 1);
    b.store(output, narrowed, &[]);
    b.ret();
    b.finish().unwrap()
}

fn round_trip(input: HostBuffer, wide: ScalarType) -> HostBuffer {
    let elem = input.elem();
    let func = round_trip_kernel(elem, wide);
    let mut buffers = vec![input, HostBuffer::zeros(elem, LEN as usize)];
    Interpreter::new(&func).launch([1, 1, 1], &mut buffers).unwrap();
    buffers.pop().unwrap()
}

#[test]
fn widening_and_narrowing_back_is_exact() {
    let floats = [1.5f32, -0.25, 1024.0, -3.0];
    let bf16_values: Vec<bf16> = floats.iter().map(|v| bf16::from_f32(*v)).collect();
    for wide in [ScalarType::F32, ScalarType::F64] {
        let out = round_trip(HostBuffer::from_bf16(&bf16_values), wide);
        assert_eq!(out.to_f32_vec(), floats.to_vec(), "bf16 via {wide:?}");
    }
    let out = round_trip(HostBuffer::from_f32(&floats), ScalarType::F64);
    assert_eq!(out.to_f32_vec(), floats.to_vec());

    let ints = [-128i8, -1, 0, 127];
    for wide in [ScalarType::I32, ScalarType::F32, ScalarType::Bf16] {
        let out = round_trip(HostBuffer::from_i8(&ints), wide);
        assert_eq!(out.to_i64_vec(), vec![-128, -1, 0, 127], "i8 via {wide:?}");
    }
    let shorts = [-32768i16, -5, 300, 32767];
    let out = round_trip(HostBuffer::from_i16(&shorts), ScalarType::F32);
    assert_eq!(out.to_i64_vec(), vec![-32768, -5, 300, 32767]);
}
