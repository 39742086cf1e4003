use tilefuse::analysis::{AffineExpr, RowTileAnalysis, SymbolicTiling};
use tilefuse::hlo::{scalar_reducer, HloModule, Literal, Opcode, PrimitiveType, Shape};

fn softmax_module(rows: i64, row_len: i64) -> (HloModule, tilefuse::hlo::ComputationId) {
    let mut module = HloModule::new("softmax");
    let max = scalar_reducer(&mut module, "max", Opcode::Maximum);
    let mut b = module.builder("fused_softmax");
    let x = b.parameter(0, Shape::array(PrimitiveType::F32, &[rows, row_len]));
    let init = b.constant(Literal::Float(f64::NEG_INFINITY), PrimitiveType::F32);
    let row_max = b.reduce(x, init, &[1], max, Shape::array(PrimitiveType::F32, &[rows]));
    let spread = b.broadcast(row_max, Shape::array(PrimitiveType::F32, &[rows, row_len]), &[0]);
    let shifted = b.elementwise(Opcode::Subtract, &[x, spread]);
    let root = b.elementwise(Opcode::Exp, &[shifted]);
    let comp = b.finish(root);
    (module, comp)
}

#[test]
fn row_tiling_covers_every_reachable_node_once() {
    let (module, comp) = softmax_module(6, 100);
    let tiled = RowTileAnalysis::new(&module, comp)
        .compute_tiled_computation(&[1, 100])
        .expect("softmax should tile by rows");

    let nodes: Vec<_> = tiled.instructions.iter().map(|t| t.node).collect();
    assert_eq!(nodes.len(), 7);
    assert_eq!(*nodes.last().unwrap(), module.computation(comp).root);

    let param = &tiled.instructions[0];
    assert_eq!(module.node(param.node).opcode, Opcode::Parameter);
    assert_eq!(param.tile_sizes, vec![1, 100]);
    assert_eq!(param.tile_strides, vec![1, 1]);
    assert_eq!(param.tile_offsets[0].eval(4), 4);
    assert_eq!(param.tile_offsets[1], AffineExpr::Const(0));

    let reduce = tiled
        .instructions
        .iter()
        .find(|t| module.node(t.node).opcode == Opcode::Reduce)
        .unwrap();
    assert_eq!(reduce.tile_sizes, vec![1]);
    assert_eq!(reduce.operands.len(), 2);
}

#[test]
fn row_tiling_rejects_non_innermost_reductions() {
    let mut module = HloModule::new("m");
    let add = scalar_reducer(&mut module, "add", Opcode::Add);
    let mut b = module.builder("fused");
    let x = b.parameter(0, Shape::array(PrimitiveType::F32, &[8, 16]));
    let zero = b.constant(Literal::Float(0.0), PrimitiveType::F32);
    let root = b.reduce(x, zero, &[0], add, Shape::array(PrimitiveType::F32, &[16]));
    let comp = b.finish(root);

    let err = RowTileAnalysis::new(&module, comp)
        .compute_tiled_computation(&[16])
        .unwrap_err();
    assert!(err.contains("innermost"), "{err}");
}
