//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use log::debug;
use smallvec::smallvec;

use crate::ErrPack;
use crate::dtype::DType;
use crate::graph::{Graph, NodeIndex};
use crate::op::Op;
use crate::scalar::ScalarOp;

use super::canonize::{Canonical, Canonizer, Term};
use super::{LocalRule, OptConfig, Replacement, RewriteError};

//--------------------------------------------------------------------------------------------------

/// Moves factors of a product into a sum when that saves multiplications or divisions:
///
/// 	(a/x + b/y) * x * y  ->  a*y + b*x
/// 	(a/x + b) * x        ->  a + b*x
///
/// `(a + b) * x` is left alone because distributing it costs an extra multiplication.
/// A division counts as `div_cost` multiplications.
pub struct GreedyDistributor {
	mul: Canonizer,
	add: Canonizer,
	div_cost: f64,
	min_score: f64,
}

struct Pairs {
	pos: Vec<Canonical>,
	neg: Vec<Canonical>,
}

impl GreedyDistributor {
	pub fn new(config: &OptConfig) -> Self {
		Self {
			mul: Canonizer::mul(),
			add: Canonizer::add(),
			div_cost: config.div_cost,
			min_score: config.distribute_min_score,
		}
	}

	fn cost(&self, c: &Canonical) -> f64 {
		#[allow(clippy::cast_precision_loss)]
		let cost = c.num.len() as f64 + self.div_cost * c.denum.len() as f64;
		cost
	}

	/// Adds `factor` to every term of the sum. Returns the new terms if the number of
	/// operations saved is above `min_score`.
	fn distribute_greedy(
		&self,
		graph: &Graph,
		pairs: &Pairs,
		factor: &Canonical,
		dtype: DType,
	) -> Result<Option<Pairs>, ErrPack<RewriteError>> {
		let mut score = self.cost(factor);
		let mut distribute = |terms: &[Canonical]| -> Result<Vec<Canonical>, ErrPack<RewriteError>> {
			let mut result = Vec::with_capacity(terms.len());
			for term in terms {
				let mut num = term.num.clone();
				num.extend_from_slice(&factor.num);
				let mut denum = term.denum.clone();
				denum.extend_from_slice(&factor.denum);
				let new = self.mul.simplify(graph, Canonical::new(num, denum), dtype)?;
				score += self.cost(term) - self.cost(&new);
				result.push(new);
			}
			Ok(result)
		};
		let pos = distribute(&pairs.pos)?;
		let neg = distribute(&pairs.neg)?;
		if score <= self.min_score {
			return Ok(None);
		}
		Ok(Some(Pairs { pos, neg }))
	}

	fn decompose_term(&self, graph: &Graph, term: &Term) -> Canonical {
		match term {
			Term::Value(v) => self.mul.decompose(graph, *v),
			Term::Const(_) => Canonical::new(vec![term.clone()], Vec::new()),
		}
	}

	/// Tries to move each of `num` and `denum` into the sum `factor`. The ones that
	/// moved are removed. Returns the rewritten sum if anything moved.
	fn attempt_distribution(
		&self,
		graph: &mut Graph,
		factor: &Term,
		num: &mut Vec<Term>,
		denum: &mut Vec<Term>,
		dtype: DType,
	) -> Result<Option<Term>, ErrPack<RewriteError>> {
		let Term::Value(factor) = factor else {
			return Ok(None);
		};
		let sum = self.add.decompose(graph, *factor);
		if sum.num.len() == 1 && sum.denum.is_empty() {
			return Ok(None);
		}
		let mut pairs = Pairs {
			pos: sum.num.iter().map(|t| self.decompose_term(graph, t)).collect(),
			neg: sum.denum.iter().map(|t| self.decompose_term(graph, t)).collect(),
		};

		let mut change = false;
		for n in num.clone() {
			let candidate = Canonical::new(vec![n.clone()], Vec::new());
			if let Some(new) = self.distribute_greedy(graph, &pairs, &candidate, dtype)? {
				pairs = new;
				change = true;
				if let Some(i) = num.iter().position(|t| *t == n) {
					num.remove(i);
				}
			}
		}
		for d in denum.clone() {
			let candidate = Canonical::new(Vec::new(), vec![d.clone()]);
			if let Some(new) = self.distribute_greedy(graph, &pairs, &candidate, dtype)? {
				pairs = new;
				change = true;
				if let Some(i) = denum.iter().position(|t| *t == d) {
					denum.remove(i);
				}
			}
		}
		if !change {
			return Ok(None);
		}

		let mut merge_all = |terms: &[Canonical]| -> Result<Vec<Term>, ErrPack<RewriteError>> {
			let mut result = Vec::with_capacity(terms.len());
			for term in terms {
				result.push(Term::Value(self.mul.merge(graph, term)?));
			}
			Ok(result)
		};
		let pos = merge_all(&pairs.pos)?;
		let neg = merge_all(&pairs.neg)?;
		let new = self.add.merge(graph, &Canonical::new(pos, neg))?;
		Ok(Some(Term::Value(new)))
	}
}

impl LocalRule for GreedyDistributor {
	fn name(&self) -> &'static str {
		"local_greedy_distributor"
	}

	fn transform(
		&self,
		graph: &mut Graph,
		node: NodeIndex,
	) -> Result<Option<Replacement>, ErrPack<RewriteError>> {
		let is_product = match graph.op(node) {
			Op::Elemwise(e) if e.inplace.is_empty() => {
				matches!(e.scalar, ScalarOp::Mul | ScalarOp::TrueDiv | ScalarOp::Inv)
			},
			_ => false,
		};
		if !is_product {
			return Ok(None);
		}
		let out = graph.output(node);
		let out_ty = graph.ty(out).clone();
		let Canonical { mut num, mut denum } = self.mul.decompose(graph, out);
		if num.len() == 1 && denum.is_empty() {
			return Ok(None);
		}

		let mut change = false;
		let mut new_num = Vec::new();
		for candidate in num.clone() {
			let Some(i) = num.iter().position(|t| *t == candidate) else {
				continue;
			};
			num.remove(i);
			let distributed =
				self.attempt_distribution(graph, &candidate, &mut num, &mut denum, out_ty.dtype)?;
			change |= distributed.is_some();
			new_num.push(distributed.unwrap_or(candidate));
		}
		let mut new_denum = Vec::new();
		for candidate in denum.clone() {
			let Some(i) = denum.iter().position(|t| *t == candidate) else {
				continue;
			};
			denum.remove(i);
			let distributed =
				self.attempt_distribution(graph, &candidate, &mut denum, &mut num, out_ty.dtype)?;
			change |= distributed.is_some();
			new_denum.push(distributed.unwrap_or(candidate));
		}
		if !change {
			return Ok(None);
		}

		new_num.append(&mut num);
		new_denum.append(&mut denum);
		let new = self.mul.merge(graph, &Canonical::new(new_num, new_denum))?;
		if *graph.ty(new) != out_ty {
			debug!("local_greedy_distributor: result type {} differs from {out_ty}", graph.ty(new));
			return Ok(None);
		}
		Ok(Some(smallvec![new]))
	}
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;
	use crate::backend::NdarrayBackend;
	use crate::graph::ValueIndex;
	use crate::literal::Literal;
	use crate::op::TensorType;
	use crate::opt::{GraphPass, Order, TopoOptimizer};
	use assert_approx_eq::assert_approx_eq;
	use std::rc::Rc;

	fn vector(graph: &mut Graph, name: &'static str) -> ValueIndex {
		graph.add_input(TensorType::new(DType::F64, &[false]), name)
	}

	fn distribute(graph: &mut Graph) -> usize {
		let rule = GreedyDistributor::new(&OptConfig::default());
		let pass = TopoOptimizer::new("distribute", vec![Rc::new(rule)], Order::InToOut, 16);
		pass.apply(graph).rewrites
	}

	fn count(graph: &Graph, scalar: ScalarOp) -> usize {
		graph.count_nodes(|op| op.is_elemwise_of(&scalar))
	}

	fn check_same_values(before: &Graph, after: &Graph, n_inputs: usize) {
		let inputs: Vec<Literal> = (0..n_inputs)
			.map(|i| {
				#[allow(clippy::cast_precision_loss)]
				let base = i as f64 + 1.5;
				Literal::vector(DType::F64, &[base, -0.5 * base, 2.0])
			})
			.collect();
		let expected = before.evaluate(&NdarrayBackend, &inputs).unwrap();
		let actual = after.evaluate(&NdarrayBackend, &inputs).unwrap();
		for (x, y) in expected[0].data().iter().zip(actual[0].data()) {
			assert_approx_eq!(x, y, 1e-9);
		}
	}

	#[test]
	fn test_distribute_over_fractions() {
		let mut g = Graph::new();
		let [a, b, x, y] = ["a", "b", "x", "y"].map(|n| vector(&mut g, n));
		let ax = g.elemwise(ScalarOp::TrueDiv, &[a, x]).unwrap();
		let by = g.elemwise(ScalarOp::TrueDiv, &[b, y]).unwrap();
		let s = g.elemwise(ScalarOp::Add, &[ax, by]).unwrap();
		let m = g.elemwise(ScalarOp::Mul, &[s, x, y]).unwrap();
		g.set_outputs(&[m]);
		let before = g.clone();

		assert_eq!(distribute(&mut g), 1);
		assert_eq!(count(&g, ScalarOp::TrueDiv), 0);
		assert_eq!(count(&g, ScalarOp::Mul), 2);
		assert_eq!(count(&g, ScalarOp::Add), 1);
		check_same_values(&before, &g, 4);
	}

	#[test]
	fn test_distribute_partial() {
		let mut g = Graph::new();
		let [a, b, x] = ["a", "b", "x"].map(|n| vector(&mut g, n));
		let ax = g.elemwise(ScalarOp::TrueDiv, &[a, x]).unwrap();
		let s = g.elemwise(ScalarOp::Add, &[ax, b]).unwrap();
		let m = g.elemwise(ScalarOp::Mul, &[s, x]).unwrap();
		g.set_outputs(&[m]);
		let before = g.clone();

		assert_eq!(distribute(&mut g), 1);
		// a + b * x
		assert_eq!(count(&g, ScalarOp::TrueDiv), 0);
		assert_eq!(count(&g, ScalarOp::Mul), 1);
		check_same_values(&before, &g, 3);
	}

	#[test]
	fn test_no_distribution_without_savings() {
		let mut g = Graph::new();
		let [a, b, x] = ["a", "b", "x"].map(|n| vector(&mut g, n));
		let s = g.elemwise(ScalarOp::Add, &[a, b]).unwrap();
		let m = g.elemwise(ScalarOp::Mul, &[s, x]).unwrap();
		g.set_outputs(&[m]);
		let before = g.structure();

		assert_eq!(distribute(&mut g), 0);
		assert_eq!(g.structure(), before);
	}

	#[test]
	fn test_score_never_gets_worse() {
		let config = OptConfig::default();
		let mut g = Graph::new();
		let [a, b, c, x, y] = ["a", "b", "c", "x", "y"].map(|n| vector(&mut g, n));
		// (a/x - b*c) / y * x
		let ax = g.elemwise(ScalarOp::TrueDiv, &[a, x]).unwrap();
		let bc = g.elemwise(ScalarOp::Mul, &[b, c]).unwrap();
		let d = g.elemwise(ScalarOp::Sub, &[ax, bc]).unwrap();
		let q = g.elemwise(ScalarOp::TrueDiv, &[d, y]).unwrap();
		let m = g.elemwise(ScalarOp::Mul, &[q, x]).unwrap();
		g.set_outputs(&[m]);
		let before = g.clone();

		let ops = |g: &Graph| {
			#[allow(clippy::cast_precision_loss)]
			let cost = (count(g, ScalarOp::Mul) + count(g, ScalarOp::Inv)) as f64
				+ config.div_cost * count(g, ScalarOp::TrueDiv) as f64;
			cost
		};
		let cost_before = ops(&g);
		distribute(&mut g);
		assert!(ops(&g) <= cost_before);
		check_same_values(&before, &g, 5);
	}
}

//--------------------------------------------------------------------------------------------------
