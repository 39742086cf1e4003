use std::fmt::Write as _;

use super::func::{Func, Module};
use super::ops::{Block, Constant, OpKind, Operation, Padding, ValueId};

/// Renders a module in an MLIR-like textual form.
pub fn print_module(module: &Module) -> String {
    let mut printer = Printer::new(&module.func);
    printer.line(&format!("module @{} {{", module.name));
    printer.indent += 1;
    printer.func();
    printer.indent -= 1;
    printer.line("}");
    printer.out
}

struct Printer<'f> {
    func: &'f Func,
    out: String,
    indent: usize,
}

impl<'f> Printer<'f> {
    fn new(func: &'f Func) -> Self {
        Self {
            func,
            out: String::new(),
            indent: 0,
        }
    }

    fn line(&mut self, text: &str) {
        for _ in 0..self.indent {
            self.out.push_str("  ");
        }
        self.out.push_str(text);
        self.out.push('\n');
    }

    fn ty(&self, value: ValueId) -> String {
        self.func
            .value_type(value)
            .map(|ty| ty.to_string())
            .unwrap_or_else(|| "<unknown>".to_string())
    }

    fn func(&mut self) {
        let func = self.func;
        let args = func
            .args()
            .iter()
            .zip(&func.arg_attrs)
            .map(|(arg, attrs)| {
                let mut text = format!("{arg}: {}", self.ty(*arg));
                if let Some(divisibility) = attrs.divisibility {
                    let _ = write!(text, " {{tt.divisibility = {divisibility} : i32}}");
                }
                text
            })
            .collect::<Vec<_>>()
            .join(", ");
        self.line(&format!("tt.func public @{}({args}) {{", func.name));
        self.indent += 1;
        self.block_ops(&func.body);
        self.indent -= 1;
        self.line("}");
    }

    fn block_ops(&mut self, block: &Block) {
        for op in &block.ops {
            self.op(op);
        }
    }

    fn list(values: &[ValueId]) -> String {
        values
            .iter()
            .map(ValueId::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn op(&mut self, op: &Operation) {
        let results = Self::list(&op.results);
        let lhs = if results.is_empty() {
            String::new()
        } else {
            format!("{results} = ")
        };
        let name = op.kind.name();
        let operands = Self::list(&op.operands);
        let result_ty = op.result().map(|r| self.ty(r)).unwrap_or_default();
        let operand_ty = op.operands.first().map(|v| self.ty(*v)).unwrap_or_default();

        let body = match &op.kind {
            OpKind::Constant(Constant::Int(value)) => format!("{name} {value} : {result_ty}"),
            OpKind::Constant(Constant::Float(value)) => {
                format!("{name} {value:e} : {result_ty}")
            }
            OpKind::Binary(_) | OpKind::Unary(_) | OpKind::Select => {
                format!("{name} {operands} : {result_ty}")
            }
            OpKind::CmpI(pred) => format!("{name} {}, {operands} : {operand_ty}", pred.name()),
            OpKind::CmpF(pred) => format!("{name} {}, {operands} : {operand_ty}", pred.name()),
            OpKind::Cast(_)
            | OpKind::Splat
            | OpKind::Broadcast => format!("{name} {operands} : {operand_ty} -> {result_ty}"),
            OpKind::ExpandDims { axis } => format!(
                "{name} {operands} {{axis = {axis} : i32}} : {operand_ty} -> {result_ty}"
            ),
            OpKind::ExternElementwise {
                library,
                path,
                symbol,
                pure,
            } => format!(
                "{name} {operands} {{libname = \"{library}\", libpath = \"{path}\", pure = {pure}, symbol = \"{symbol}\"}} : -> {result_ty}"
            ),
            OpKind::MakeRange { start, end } => {
                format!("{name} {{end = {end} : i32, start = {start} : i32}} : {result_ty}")
            }
            OpKind::GetProgramId(dim) => format!("{name} {} : {result_ty}", dim.name()),
            OpKind::AddPtr => {
                let offset_ty = op.operands.get(1).map(|v| self.ty(*v)).unwrap_or_default();
                format!("{name} {operands} : {result_ty}, {offset_ty}")
            }
            OpKind::MakeTensorPtr { order } => {
                let rank = order.len();
                let base = op.operands.first().map(ValueId::to_string).unwrap_or_default();
                let group = |start: usize| Self::list(op.operands.get(start..start + rank).unwrap_or(&[]));
                let order = order
                    .iter()
                    .map(i32::to_string)
                    .collect::<Vec<_>>()
                    .join(", ");
                format!(
                    "{name} {base}, [{}], [{}], [{}] {{order = array<i32: {order}>}} : {result_ty}",
                    group(1),
                    group(1 + rank),
                    group(1 + 2 * rank)
                )
            }
            OpKind::Advance => {
                let (ptr, offsets) = op
                    .operands
                    .split_first()
                    .map(|(ptr, rest)| (ptr.to_string(), Self::list(rest)))
                    .unwrap_or_default();
                format!("{name} {ptr}, [{offsets}] : {result_ty}")
            }
            OpKind::Load {
                boundary_check,
                padding,
            } => {
                let mut attrs = format!("boundaryCheck = array<i32: {}>", join(boundary_check));
                if let Some(Padding::Zero) = padding {
                    attrs.push_str(", padding = 1 : i32");
                }
                format!("{name} {operands} {{{attrs}}} : {operand_ty}")
            }
            OpKind::Store { boundary_check } => format!(
                "{name} {operands} {{boundaryCheck = array<i32: {}>}} : {operand_ty}",
                join(boundary_check)
            ),
            OpKind::Dot { allow_tf32 } => {
                let precision = if *allow_tf32 { "tf32" } else { "ieee" };
                let rhs_ty = op.operands.get(1).map(|v| self.ty(*v)).unwrap_or_default();
                format!(
                    "{name} {operands}, inputPrecision = {precision} : {operand_ty} * {rhs_ty} -> {result_ty}"
                )
            }
            OpKind::SparseDot => format!("{name} {operands} : -> {result_ty}"),
            OpKind::Reduce { axis } => {
                self.region_op(
                    &format!("{lhs}\"{name}\"({operands}) ({{"),
                    &op.regions,
                    &format!("}}) {{axis = {axis} : i32}} : ({operand_ty}) -> {result_ty}"),
                );
                return;
            }
            OpKind::For => {
                let (bounds, inits) = op.operands.split_at(3.min(op.operands.len()));
                let body = op.regions.first();
                let iv = body
                    .and_then(|b| b.args.first())
                    .map(ValueId::to_string)
                    .unwrap_or_default();
                let iter_args = body
                    .map(|b| {
                        b.args
                            .iter()
                            .skip(1)
                            .zip(inits)
                            .map(|(arg, init)| format!("{arg} = {init}"))
                            .collect::<Vec<_>>()
                            .join(", ")
                    })
                    .unwrap_or_default();
                let types = op
                    .results
                    .iter()
                    .map(|r| self.ty(*r))
                    .collect::<Vec<_>>()
                    .join(", ");
                let header = format!(
                    "{lhs}{name} {iv} = {} to {} step {} iter_args({iter_args}) -> ({types}) : {operand_ty} {{",
                    bounds.first().map(ValueId::to_string).unwrap_or_default(),
                    bounds.get(1).map(ValueId::to_string).unwrap_or_default(),
                    bounds.get(2).map(ValueId::to_string).unwrap_or_default(),
                );
                self.line(&header);
                self.indent += 1;
                if let Some(body) = body {
                    self.block_ops(body);
                }
                self.indent -= 1;
                self.line("}");
                return;
            }
            OpKind::ReduceReturn | OpKind::Yield => {
                let types = op
                    .operands
                    .iter()
                    .map(|v| self.ty(*v))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("{name} {operands} : {types}")
            }
            OpKind::Return => name.to_string(),
        };
        self.line(&format!("{lhs}{body}"));
    }

    fn region_op(&mut self, header: &str, regions: &[Block], footer: &str) {
        self.line(header);
        for region in regions {
            let args = region
                .args
                .iter()
                .map(|arg| format!("{arg}: {}", self.ty(*arg)))
                .collect::<Vec<_>>()
                .join(", ");
            self.line(&format!("^bb0({args}):"));
            self.indent += 1;
            self.block_ops(region);
            self.indent -= 1;
        }
        self.line(footer);
    }
}

fn join(values: &[usize]) -> String {
    values
        .iter()
        .map(usize::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
