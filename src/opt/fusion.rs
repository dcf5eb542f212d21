//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::rc::Rc;

use log::{debug, warn};
use smallvec::SmallVec;

use crate::ErrPack;
use crate::graph::{Graph, NodeIndex, ValueIndex};
use crate::op::{Op, TensorType};
use crate::scalar::{CompositeBuilder, ScalarArg, ScalarOp};

use super::{GraphPass, OptConfig, PassReport, RewriteError};

//--------------------------------------------------------------------------------------------------

/// Merges chains of elementwise nodes into single nodes running a composite scalar
/// program, so intermediate tensors are never materialized.
///
/// A producer is absorbed only if its result has no other consumer and its scalar
/// operator has kernel text. Fusions whose kernel parameters would not fit in
/// `kernel_arg_limit` bytes are rejected.
pub struct FusionOptimizer {
	kernel_arg_limit: usize,
}

// Rough size of the parameters passed to a kernel for one tensor: a data pointer and
// one stride per dimension.
fn arg_size(ty: &TensorType) -> usize {
	4 + 4 * ty.ndim()
}

impl FusionOptimizer {
	pub fn new(config: &OptConfig) -> Self {
		Self { kernel_arg_limit: config.kernel_arg_limit }
	}

	/// Builds a fused replacement for the output of `node`, inlining every input
	/// produced by a fusable elementwise node.
	pub fn fuse(
		&self,
		graph: &mut Graph,
		node: NodeIndex,
	) -> Result<Option<ValueIndex>, ErrPack<RewriteError>> {
		let Some(scalar) = graph.op(node).scalar_op().cloned() else {
			return Ok(None);
		};

		let mut builder = CompositeBuilder::new();
		let mut new_inputs: SmallVec<[ValueIndex; 8]> = SmallVec::new();
		let mut args: SmallVec<[ScalarArg; 4]> = SmallVec::new();
		let mut fused = false;
		for &input in graph.inputs(node) {
			if let Some((producer, op)) = graph.owner_op(input)
				&& let Some(inner) = op.scalar_op()
				&& graph.clients(input).len() <= 1
				&& inner.has_c_code()
			{
				let mut inner_args: SmallVec<[ScalarArg; 4]> = SmallVec::new();
				for &v in graph.inputs(producer) {
					new_inputs.push(v);
					inner_args.push(builder.input());
				}
				args.push(builder.apply(inner, &inner_args));
				fused = true;
			} else {
				new_inputs.push(input);
				args.push(builder.input());
			}
		}
		if !fused {
			return Ok(None);
		}

		let out = builder.apply(&scalar, &args);
		let composite = ScalarOp::Composite(Rc::new(builder.finish(out)));
		if !composite.has_c_code() {
			debug!("elemwise_fusion: {node:?} has no kernel text");
			return Ok(None);
		}

		let out_ty = graph.ty(graph.output(node));
		let size = new_inputs.first().map_or(4, |&v| arg_size(graph.ty(v)))
			+ new_inputs.iter().map(|&v| arg_size(graph.ty(v))).sum::<usize>()
			+ arg_size(out_ty);
		if size >= self.kernel_arg_limit {
			warn!(
				"elemwise_fusion: not fusing {node:?}, {} inputs need {size} bytes of kernel arguments (limit {})",
				new_inputs.len(),
				self.kernel_arg_limit
			);
			return Ok(None);
		}

		Ok(Some(graph.apply(Op::elemwise(composite), &new_inputs)?))
	}
}

impl GraphPass for FusionOptimizer {
	fn name(&self) -> &str {
		"elemwise_fusion"
	}

	/// Every successful fusion removes at least one node, so the loop terminates.
	fn apply(&self, graph: &mut Graph) -> PassReport {
		let mut report = PassReport::new("elemwise_fusion");
		loop {
			report.rounds += 1;
			let mut did_something = false;
			for node in graph.topo_order() {
				let new = match self.fuse(graph, node) {
					Ok(Some(new)) => new,
					Ok(None) => continue,
					Err(err) => {
						debug!("elemwise_fusion: cannot fuse {node:?}: {err}");
						continue;
					},
				};
				let old = graph.output(node);
				match graph.replace_validate(old, new, "elemwise_fusion") {
					Ok(()) => {
						report.rewrites += 1;
						did_something = true;
						break;
					},
					Err(err) => debug!("elemwise_fusion: fusion of {node:?} rejected: {err}"),
				}
			}
			if !did_something {
				break;
			}
		}
		report
	}
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;
	use crate::backend::NdarrayBackend;
	use crate::dtype::DType;
	use crate::literal::Literal;
	use crate::scalar::OpaqueScalarOp;
	use assert_approx_eq::assert_approx_eq;

	fn fusion() -> FusionOptimizer {
		FusionOptimizer::new(&OptConfig::default())
	}

	fn elemwise_count(graph: &Graph) -> usize {
		graph.count_nodes(|op| matches!(op, Op::Elemwise(_)))
	}

	#[test]
	fn test_chain_is_fused_into_one_node() {
		let mut g = Graph::new();
		let x = g.add_input(TensorType::new(DType::F64, &[false]), "x");
		let y = g.add_input(TensorType::new(DType::F64, &[false]), "y");
		let e = g.elemwise(ScalarOp::Exp, &[x]).unwrap();
		let s = g.elemwise(ScalarOp::Add, &[e, y]).unwrap();
		let r = g.elemwise(ScalarOp::Sqrt, &[s]).unwrap();
		g.set_outputs(&[r]);
		let inputs = [Literal::vector(DType::F64, &[0.0, 1.0]), Literal::vector(DType::F64, &[3.0, 2.0])];
		let before = g.evaluate(&NdarrayBackend, &inputs).unwrap();

		let report = fusion().apply(&mut g);
		assert_eq!(report.rewrites, 2);
		assert_eq!(elemwise_count(&g), 1);
		let (node, op) = g.owner_op(g.graph_outputs()[0]).unwrap();
		assert!(matches!(op.scalar_op(), Some(ScalarOp::Composite(_))));
		assert_eq!(g.inputs(node), &[x, y]);

		let after = g.evaluate(&NdarrayBackend, &inputs).unwrap();
		for (a, b) in before[0].data().iter().zip(after[0].data()) {
			assert_approx_eq!(a, b, 1e-12);
		}
	}

	#[test]
	fn test_shared_producer_is_not_fused() {
		let mut g = Graph::new();
		let x = g.add_input(TensorType::new(DType::F64, &[false]), "x");
		let e = g.elemwise(ScalarOp::Exp, &[x]).unwrap();
		let a = g.elemwise(ScalarOp::Neg, &[e]).unwrap();
		let b = g.elemwise(ScalarOp::Sqr, &[e]).unwrap();
		g.set_outputs(&[a, b]);

		assert_eq!(fusion().apply(&mut g).rewrites, 0);
		assert_eq!(elemwise_count(&g), 3);
	}

	#[test]
	fn test_large_kernel_is_rejected() {
		let mut g = Graph::new();
		let ty = TensorType::new(DType::F32, &[false; 8]);
		let [a, b, c, d, e] = ["a", "b", "c", "d", "e"].map(|n| g.add_input(ty.clone(), n));
		let ea = g.elemwise(ScalarOp::Exp, &[a]).unwrap();
		let sum = g.elemwise(ScalarOp::Add, &[ea, b, c, d, e]).unwrap();
		g.set_outputs(&[sum]);
		let before = g.structure();

		// 36 + 5 * 36 + 36 = 252 bytes
		assert_eq!(fusion().apply(&mut g).rewrites, 0);
		assert_eq!(g.structure(), before);

		let config = OptConfig { kernel_arg_limit: 512, ..OptConfig::default() };
		assert_eq!(FusionOptimizer::new(&config).apply(&mut g).rewrites, 1);
	}

	#[test]
	fn test_opaque_op_blocks_fusion() {
		let opaque = ScalarOp::Opaque(Rc::new(OpaqueScalarOp {
			name: "softsign".into(),
			arity: 1,
			eval: |x| x[0] / (1.0 + x[0].abs()),
		}));
		let mut g = Graph::new();
		let x = g.add_input(TensorType::new(DType::F64, &[false]), "x");
		let e = g.elemwise(ScalarOp::Exp, &[x]).unwrap();
		let o = g.elemwise(opaque, &[e]).unwrap();
		let n = g.elemwise(ScalarOp::Neg, &[o]).unwrap();
		g.set_outputs(&[n]);

		assert_eq!(fusion().apply(&mut g).rewrites, 0);
		assert_eq!(elemwise_count(&g), 3);
	}
}

//--------------------------------------------------------------------------------------------------
