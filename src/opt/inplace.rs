//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use log::debug;
use smallvec::SmallVec;

use crate::graph::{Graph, ValueIndex};
use crate::op::{Elemwise, InplacePattern, Op};

use super::{GraphPass, PassReport};

//--------------------------------------------------------------------------------------------------

/// Lets elementwise nodes write their result into the storage of an input.
///
/// Greedy: for each elementwise node in topological order and each output not yet
/// in place, the inputs are tried in order and the first one the graph accepts as
/// destroyable is taken. Every attempt goes through `replace_all_validate()`, so
/// an input that is still needed elsewhere is never overwritten.
pub struct InplaceOptimizer;

impl InplaceOptimizer {
	pub fn new() -> Self {
		Self
	}
}

impl GraphPass for InplaceOptimizer {
	fn name(&self) -> &str {
		"inplace_opt"
	}

	fn apply(&self, graph: &mut Graph) -> PassReport {
		let mut report = PassReport::new("inplace_opt");
		report.rounds = 1;
		for node in graph.topo_order() {
			let Op::Elemwise(e) = graph.op(node) else {
				continue;
			};
			let scalar = e.scalar.clone();
			let mut baseline: InplacePattern = e.inplace.clone();
			let mut node = node;
			let n_inputs = graph.inputs(node).len();
			let candidate_outputs: SmallVec<[usize; 1]> = (0..graph.outputs(node).len())
				.filter(|o| !baseline.iter().any(|(bo, _)| bo == o))
				.collect();
			let mut candidate_inputs: SmallVec<[usize; 4]> =
				(0..n_inputs).filter(|i| !baseline.iter().any(|(_, bi)| bi == i)).collect();

			for output in candidate_outputs {
				let mut taken = None;
				for (pos, &input) in candidate_inputs.iter().enumerate() {
					let mut pattern = baseline.clone();
					pattern.push((output, input));
					let op = Op::Elemwise(Elemwise { scalar: scalar.clone(), inplace: pattern.clone() });
					let inputs = graph.inputs(node).to_vec();
					let new = match graph.apply(op, &inputs) {
						Ok(new) => new,
						Err(err) => {
							debug!("inplace_opt: {node:?} cannot overwrite input {input}: {err}");
							continue;
						},
					};
					let pairs: SmallVec<[(ValueIndex, ValueIndex); 1]> =
						graph.outputs(node).iter().map(|&old| (old, new)).collect();
					if let Err(err) = graph.replace_all_validate(&pairs, "inplace_opt") {
						debug!("inplace_opt: {node:?} cannot overwrite input {input}: {err}");
						continue;
					}
					report.rewrites += 1;
					if let Some(owner) = graph.owner(new) {
						node = owner;
					}
					baseline = pattern;
					taken = Some(pos);
					break;
				}
				if let Some(pos) = taken {
					candidate_inputs.remove(pos);
				}
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
	use crate::op::TensorType;
	use crate::scalar::ScalarOp;

	fn destructive_count(graph: &Graph) -> usize {
		graph.count_nodes(|op| !op.destroy_map().is_empty())
	}

	#[test]
	fn test_single_consumer_becomes_destructive() {
		let mut g = Graph::new();
		let x = g.add_input(TensorType::new(DType::F64, &[false]), "x");
		let y = g.add_input(TensorType::new(DType::F64, &[false]), "y");
		let e = g.elemwise(ScalarOp::Exp, &[x]).unwrap();
		let s = g.elemwise(ScalarOp::Add, &[e, y]).unwrap();
		g.set_outputs(&[s]);
		let inputs = [Literal::vector(DType::F64, &[0.0, 1.0]), Literal::vector(DType::F64, &[1.0, 1.0])];
		let before = g.evaluate(&NdarrayBackend, &inputs).unwrap();

		let report = InplaceOptimizer::new().apply(&mut g);
		assert_eq!(report.rewrites, 1);
		assert_eq!(destructive_count(&g), 1);
		let (_, op) = g.owner_op(g.graph_outputs()[0]).unwrap();
		assert_eq!(op.destroy_map(), &[(0, 0)]);

		// graph inputs are never overwritten
		let (node, _) = g.owner_op(g.graph_outputs()[0]).unwrap();
		let (_, exp) = g.owner_op(g.inputs(node)[0]).unwrap();
		assert!(exp.destroy_map().is_empty());

		assert_eq!(g.evaluate(&NdarrayBackend, &inputs).unwrap(), before);
	}

	#[test]
	fn test_shared_input_stays_intact() {
		let mut g = Graph::new();
		let x = g.add_input(TensorType::new(DType::F64, &[false]), "x");
		let y = g.add_input(TensorType::new(DType::F64, &[false]), "y");
		let e = g.elemwise(ScalarOp::Exp, &[x]).unwrap();
		let a = g.elemwise(ScalarOp::Add, &[e, y]).unwrap();
		let m = g.elemwise(ScalarOp::Mul, &[e, y]).unwrap();
		g.set_outputs(&[a, m]);
		let before = g.structure();

		assert_eq!(InplaceOptimizer::new().apply(&mut g).rewrites, 0);
		assert_eq!(g.structure(), before);
	}

	#[test]
	fn test_second_input_is_tried() {
		let mut g = Graph::new();
		let x = g.add_input(TensorType::new(DType::F64, &[false]), "x");
		let e = g.elemwise(ScalarOp::Exp, &[x]).unwrap();
		// x cannot be overwritten, exp(x) can
		let s = g.elemwise(ScalarOp::Sub, &[x, e]).unwrap();
		g.set_outputs(&[s]);

		assert_eq!(InplaceOptimizer::new().apply(&mut g).rewrites, 1);
		let (_, op) = g.owner_op(g.graph_outputs()[0]).unwrap();
		assert_eq!(op.destroy_map(), &[(0, 1)]);
	}
}

//--------------------------------------------------------------------------------------------------
