//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use log::warn;
use smallvec::smallvec;

use crate::dtype::DType;
use crate::graph::{Client, Graph, NodeIndex, ValueIndex};
use crate::literal::{Literal, zip_map};
use crate::op::{Op, TypeError};
use crate::scalar::ScalarOp;
use crate::{ErrPack, cold_path};

use super::{LocalRule, Replacement, RewriteError, fill_chain};

//--------------------------------------------------------------------------------------------------

/// Operand of a canonical form. Folded constants do not exist in the graph until
/// the form is turned back into nodes.
#[derive(Clone, Debug, PartialEq)]
pub enum Term {
	Value(ValueIndex),
	Const(Literal),
}

/// `inverse(main(num...), main(denum...))`
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Canonical {
	pub num: Vec<Term>,
	pub denum: Vec<Term>,
}

impl Canonical {
	pub fn new(num: Vec<Term>, denum: Vec<Term>) -> Self {
		Self { num, denum }
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Role {
	Main,
	Inverse,
	Reciprocal,
}

/// Flattens chains of an associative operator (`main`), its binary inverse and its
/// unary reciprocal into a numerator and a denominator, cancels and folds, and
/// rebuilds the shortest equivalent expression.
///
/// `add` / `sub` / `neg` and `mul` / `true_div` / `inv` are the two instances.
pub struct Canonizer {
	name: &'static str,
	main: ScalarOp,
	inverse: ScalarOp,
	reciprocal: ScalarOp,
	neutral: f64,

	/// With `false`, a lone denominator is written as `inverse(neutral, d)`.
	use_reciprocal: bool,
}

impl Canonizer {
	pub fn add() -> Self {
		Self {
			name: "local_add_canonizer",
			main: ScalarOp::Add,
			inverse: ScalarOp::Sub,
			reciprocal: ScalarOp::Neg,
			neutral: 0.0,
			use_reciprocal: true,
		}
	}

	pub fn mul() -> Self {
		Self {
			name: "local_mul_canonizer",
			main: ScalarOp::Mul,
			inverse: ScalarOp::TrueDiv,
			reciprocal: ScalarOp::Inv,
			neutral: 1.0,
			use_reciprocal: false,
		}
	}

	fn role(&self, op: &Op) -> Option<Role> {
		let Op::Elemwise(e) = op else {
			return None;
		};
		if !e.inplace.is_empty() {
			return None;
		}
		if e.scalar == self.main {
			Some(Role::Main)
		} else if e.scalar == self.inverse {
			Some(Role::Inverse)
		} else if e.scalar == self.reciprocal {
			Some(Role::Reciprocal)
		} else {
			None
		}
	}

	/// Splits `value` into numerator and denominator.
	///
	/// A value with more than one consumer is a leaf, so work shared with other
	/// consumers is never duplicated. Left-padding dimshuffles are looked through.
	pub fn decompose(&self, graph: &Graph, value: ValueIndex) -> Canonical {
		let mut result = Canonical::default();
		self.decompose_into(graph, value, &mut result.num, &mut result.denum);
		result
	}

	fn decompose_into(
		&self,
		graph: &Graph,
		value: ValueIndex,
		num: &mut Vec<Term>,
		denum: &mut Vec<Term>,
	) {
		if graph.clients(value).len() > 1 {
			num.push(Term::Value(value));
			return;
		}
		let Some((node, op)) = graph.owner_op(value) else {
			num.push(Term::Value(value));
			return;
		};
		let inputs = graph.inputs(node);
		match self.role(op) {
			Some(Role::Main) => {
				for &input in inputs {
					self.decompose_into(graph, input, num, denum);
				}
			},
			Some(Role::Inverse) => {
				self.decompose_into(graph, inputs[0], num, denum);
				self.decompose_into(graph, inputs[1], denum, num);
			},
			Some(Role::Reciprocal) => {
				self.decompose_into(graph, inputs[0], denum, num);
			},
			None => match op {
				Op::DimShuffle(ds) if ds.is_left_pad() => {
					self.decompose_into(graph, inputs[0], num, denum);
				},
				_ => num.push(Term::Value(value)),
			},
		}
	}

	fn constant<'a>(graph: &'a Graph, term: &'a Term) -> Option<&'a Literal> {
		match term {
			Term::Const(literal) => Some(literal),
			Term::Value(v) => graph.literal(*v),
		}
	}

	fn same_term(graph: &Graph, a: &Term, b: &Term) -> bool {
		match (a, b) {
			(Term::Value(a), Term::Value(b)) => a == b,
			_ => match (Self::constant(graph, a), Self::constant(graph, b)) {
				(Some(a), Some(b)) => a.data() == b.data(),
				_ => false,
			},
		}
	}

	fn same(graph: &Graph, a: &[Term], b: &[Term]) -> bool {
		a.len() == b.len() && a.iter().zip(b).all(|(a, b)| Self::same_term(graph, a, b))
	}

	/// `inverse(main(num...), main(denum...))` evaluated on literals.
	pub fn calculate(
		&self,
		num: &[&Literal],
		denum: &[&Literal],
		dtype: DType,
	) -> Result<Literal, ErrPack<RewriteError>> {
		let n = num.len();
		let arrays: Vec<_> = num.iter().chain(denum).map(|l| l.data()).collect();
		let data = match self.main {
			ScalarOp::Add => zip_map(&arrays, |args| {
				args[..n].iter().sum::<f64>() - args[n..].iter().sum::<f64>()
			})?,
			_ => zip_map(&arrays, |args| {
				let num: f64 = args[..n].iter().product();
				let denum: f64 = args[n..].iter().product();
				if dtype.is_float() { num / denum } else { (num / denum).trunc() }
			})?,
		};
		Ok(Literal::new(dtype, data))
	}

	/// Removes values present in both numerator and denominator.
	pub fn simplify_factors(&self, graph: &Graph, mut c: Canonical) -> Canonical {
		let mut i = 0;
		while i < c.num.len() {
			if let Some(j) = c.denum.iter().position(|d| Self::same_term(graph, d, &c.num[i]))
				&& matches!(c.num[i], Term::Value(_))
			{
				c.num.remove(i);
				c.denum.remove(j);
			} else {
				i += 1;
			}
		}
		c
	}

	/// Folds every constant into one leading numerator constant, which is dropped if
	/// it is the neutral element.
	pub fn simplify_constants(
		&self,
		graph: &Graph,
		orig: Canonical,
		dtype: DType,
	) -> Result<Canonical, ErrPack<RewriteError>> {
		let mut num: Vec<Term> = Vec::with_capacity(orig.num.len());
		let mut num_ct: Vec<&Literal> = Vec::new();
		for term in &orig.num {
			match Self::constant(graph, term) {
				Some(literal) => num_ct.push(literal),
				None => num.push(term.clone()),
			}
		}
		let mut denum: Vec<Term> = Vec::with_capacity(orig.denum.len());
		let mut denum_ct: Vec<&Literal> = Vec::new();
		for term in &orig.denum {
			match Self::constant(graph, term) {
				Some(literal) => denum_ct.push(literal),
				None => denum.push(term.clone()),
			}
		}

		let ct = self.calculate(&num_ct, &denum_ct, dtype)?;
		let keep = !(self.use_reciprocal || !num.is_empty()) || !ct.all_equal(self.neutral);

		// A single constant that already leads the numerator is left alone. Rebuilding
		// it would produce an equal expression and the rule would fire forever.
		if keep
			&& num_ct.len() == 1
			&& denum_ct.is_empty()
			&& let Some(first) = orig.num.first()
			&& Self::constant(graph, first).is_some_and(|c| c.data() == ct.data())
		{
			return Ok(orig);
		}

		if keep {
			num.insert(0, Term::Const(ct));
		}
		Ok(Canonical { num, denum })
	}

	pub fn simplify(
		&self,
		graph: &Graph,
		c: Canonical,
		dtype: DType,
	) -> Result<Canonical, ErrPack<RewriteError>> {
		let c = self.simplify_factors(graph, c);
		self.simplify_constants(graph, c, dtype)
	}

	fn term_value(graph: &mut Graph, term: &Term) -> ValueIndex {
		match term {
			Term::Value(v) => *v,
			Term::Const(literal) => graph.add_constant(literal.clone()),
		}
	}

	fn neutral_value(&self, graph: &mut Graph) -> ValueIndex {
		graph.add_constant(Literal::scalar(DType::I8, self.neutral))
	}

	fn merge_main(&self, graph: &mut Graph, terms: &[Term]) -> Result<ValueIndex, ErrPack<TypeError>> {
		match terms {
			[] => Ok(self.neutral_value(graph)),
			[term] => Ok(Self::term_value(graph, term)),
			_ => {
				let values: Vec<ValueIndex> = terms.iter().map(|t| Self::term_value(graph, t)).collect();
				graph.elemwise(self.main.clone(), &values)
			},
		}
	}

	/// Builds the smallest expression for `c`:
	///
	/// 	n=0, d=0: neutral
	/// 	n=1, d=0: num[0]
	/// 	n=0, d>0: reciprocal(main(denum...))
	/// 	otherwise: inverse(main(num...), main(denum...))
	pub fn merge(&self, graph: &mut Graph, c: &Canonical) -> Result<ValueIndex, ErrPack<TypeError>> {
		if c.denum.is_empty() {
			return self.merge_main(graph, &c.num);
		}
		let denum = self.merge_main(graph, &c.denum)?;
		if c.num.is_empty() && self.use_reciprocal {
			return graph.elemwise(self.reciprocal.clone(), &[denum]);
		}
		let num = self.merge_main(graph, &c.num)?;
		graph.elemwise(self.inverse.clone(), &[num, denum])
	}

	/// Consumer of `node` after skipping single-consumer dimshuffles.
	fn bypass_dimshuffle(graph: &Graph, mut node: NodeIndex) -> Option<NodeIndex> {
		loop {
			if !matches!(graph.op(node), Op::DimShuffle(_)) {
				return Some(node);
			}
			match graph.clients(graph.output(node)) {
				[] => return Some(node),
				[Client::Node { node: next, .. }] => node = *next,
				[Client::Output(_)] => return None,
				_ => return Some(node),
			}
		}
	}
}

impl LocalRule for Canonizer {
	fn name(&self) -> &'static str {
		self.name
	}

	fn transform(
		&self,
		graph: &mut Graph,
		node: NodeIndex,
	) -> Result<Option<Replacement>, ErrPack<RewriteError>> {
		if self.role(graph.op(node)).is_none() {
			return Ok(None);
		}
		let out = graph.output(node);

		// a consumer in the same chain will canonize the whole thing
		for client in graph.clients(out) {
			if let Client::Node { node: consumer, .. } = *client
				&& let Some(consumer) = Self::bypass_dimshuffle(graph, consumer)
				&& self.role(graph.op(consumer)).is_some()
			{
				return Ok(None);
			}
		}

		let out_ty = graph.ty(out).clone();
		let orig = self.decompose(graph, out);
		let c = self.simplify(graph, orig.clone(), out_ty.dtype)?;
		if Self::same(graph, &orig.num, &c.num) && Self::same(graph, &orig.denum, &c.denum) {
			return Ok(None);
		}

		let mut new = self.merge(graph, &c)?;
		if graph.ty(new).dtype != out_ty.dtype {
			new = graph.elemwise(ScalarOp::Cast(out_ty.dtype), &[new])?;
		}
		if *graph.ty(new) != out_ty {
			let inputs = graph.inputs(node).to_vec();
			new = fill_chain(graph, new, &inputs)?;
		}
		if *graph.ty(new) != out_ty {
			cold_path();
			warn!("{}: cannot restore type {out_ty} (got {})", self.name, graph.ty(new));
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
	use crate::op::TensorType;
	use crate::opt::{GraphPass, Order, TopoOptimizer};
	use assert_approx_eq::assert_approx_eq;
	use std::rc::Rc;

	fn vector(graph: &mut Graph, name: &'static str) -> ValueIndex {
		graph.add_input(TensorType::new(DType::F64, &[false]), name)
	}

	fn values(c: &[Term]) -> Vec<ValueIndex> {
		c.iter()
			.filter_map(|t| match t {
				Term::Value(v) => Some(*v),
				Term::Const(_) => None,
			})
			.collect()
	}

	fn canonicalize(graph: &mut Graph, rule: Canonizer) -> usize {
		let pass = TopoOptimizer::new("canonicalize", vec![Rc::new(rule)], Order::InToOut, 16);
		pass.apply(graph).rewrites
	}

	#[test]
	fn test_decompose() {
		let mut g = Graph::new();
		let [a, b, c, d] = ["a", "b", "c", "d"].map(|n| vector(&mut g, n));
		let ab = g.elemwise(ScalarOp::TrueDiv, &[a, b]).unwrap();
		let abc = g.elemwise(ScalarOp::Mul, &[ab, c]).unwrap();
		let abcd = g.elemwise(ScalarOp::TrueDiv, &[abc, d]).unwrap();
		let bc = g.elemwise(ScalarOp::TrueDiv, &[b, c]).unwrap();
		let a_bc = g.elemwise(ScalarOp::TrueDiv, &[a, bc]).unwrap();
		let ia = g.elemwise(ScalarOp::Inv, &[a]).unwrap();
		let ib = g.elemwise(ScalarOp::Inv, &[b]).unwrap();
		let iaib = g.elemwise(ScalarOp::Mul, &[ia, ib]).unwrap();
		g.set_outputs(&[abcd, a_bc, iaib]);

		let mul = Canonizer::mul();
		let r = mul.decompose(&g, abcd);
		assert_eq!((values(&r.num), values(&r.denum)), (vec![a, c], vec![b, d]));
		let r = mul.decompose(&g, a_bc);
		assert_eq!((values(&r.num), values(&r.denum)), (vec![a, c], vec![b]));
		let r = mul.decompose(&g, iaib);
		assert_eq!((values(&r.num), values(&r.denum)), (vec![], vec![a, b]));
	}

	#[test]
	fn test_shared_value_is_a_leaf() {
		let mut g = Graph::new();
		let x = vector(&mut g, "x");
		let y = vector(&mut g, "y");
		let p = g.elemwise(ScalarOp::Mul, &[x, y]).unwrap();
		let q = g.elemwise(ScalarOp::TrueDiv, &[p, x]).unwrap();
		let r = g.elemwise(ScalarOp::Exp, &[p]).unwrap();
		g.set_outputs(&[q, r]);

		let c = Canonizer::mul().decompose(&g, q);
		assert_eq!((values(&c.num), values(&c.denum)), (vec![p], vec![x]));
	}

	#[test]
	fn test_cancellation() {
		let mut g = Graph::new();
		let x = vector(&mut g, "x");
		let y = vector(&mut g, "y");
		let xx = g.elemwise(ScalarOp::TrueDiv, &[x, x]).unwrap();
		let xy = g.elemwise(ScalarOp::Mul, &[x, y]).unwrap();
		let xyx = g.elemwise(ScalarOp::TrueDiv, &[xy, x]).unwrap();
		g.set_outputs(&[xx, xyx]);

		let mul = Canonizer::mul();
		let c = mul.simplify_factors(&g, mul.decompose(&g, xx));
		assert!(c.num.is_empty() && c.denum.is_empty());
		let c = mul.simplify(&g, mul.decompose(&g, xyx), DType::F64).unwrap();
		assert_eq!(c, Canonical::new(vec![Term::Value(y)], vec![]));
	}

	#[test]
	fn test_constant_folding() {
		let mut g = Graph::new();
		let x = vector(&mut g, "x");
		let y = vector(&mut g, "y");
		let z = vector(&mut g, "z");
		let k = |g: &mut Graph, v: f64| Term::Value(g.add_constant(Literal::scalar(DType::F64, v)));
		let mul = Canonizer::mul();

		let c = Canonical::new(vec![k(&mut g, 2.0), k(&mut g, 3.0), Term::Value(x)], vec![]);
		let c = mul.simplify(&g, c, DType::F64).unwrap();
		assert_eq!(c.num, vec![Term::Const(Literal::scalar(DType::F64, 6.0)), Term::Value(x)]);

		let c = Canonical::new(
			vec![Term::Value(x), Term::Value(y), k(&mut g, 2.0)],
			vec![k(&mut g, 4.0), Term::Value(z)],
		);
		let c = mul.simplify(&g, c, DType::F64).unwrap();
		assert_eq!(c.num[0], Term::Const(Literal::scalar(DType::F64, 0.5)));
		assert_eq!(values(&c.num), vec![x, y]);
		assert_eq!(c.denum, vec![Term::Value(z)]);

		// [x, 2, y] / [z, 2]: the constants cancel to the neutral element
		let c = Canonical::new(
			vec![Term::Value(x), k(&mut g, 2.0), Term::Value(y)],
			vec![Term::Value(z), k(&mut g, 2.0)],
		);
		let c = mul.simplify(&g, c, DType::F64).unwrap();
		assert_eq!(c, Canonical::new(vec![Term::Value(x), Term::Value(y)], vec![Term::Value(z)]));

		// a leading constant that is already folded is kept verbatim
		let two = k(&mut g, 2.0);
		let orig = Canonical::new(vec![two, Term::Value(x)], vec![]);
		assert_eq!(mul.simplify(&g, orig.clone(), DType::F64).unwrap(), orig);
	}

	#[test]
	fn test_round_trip_and_idempotence() {
		let mut g = Graph::new();
		let [a, b, c, d] = ["a", "b", "c", "d"].map(|n| vector(&mut g, n));
		let two = g.add_constant(Literal::scalar(DType::F64, 2.0));
		let four = g.add_constant(Literal::scalar(DType::F64, 4.0));
		// ((2 * a) / b) * (b / c) / (4 * inv(d)) / a * c
		let a2 = g.elemwise(ScalarOp::Mul, &[two, a]).unwrap();
		let t1 = g.elemwise(ScalarOp::TrueDiv, &[a2, b]).unwrap();
		let t2 = g.elemwise(ScalarOp::TrueDiv, &[b, c]).unwrap();
		let id = g.elemwise(ScalarOp::Inv, &[d]).unwrap();
		let t3 = g.elemwise(ScalarOp::Mul, &[four, id]).unwrap();
		let t12 = g.elemwise(ScalarOp::Mul, &[t1, t2]).unwrap();
		let t = g.elemwise(ScalarOp::TrueDiv, &[t12, t3]).unwrap();
		let ta = g.elemwise(ScalarOp::TrueDiv, &[t, a]).unwrap();
		let out = g.elemwise(ScalarOp::Mul, &[ta, c]).unwrap();
		g.set_outputs(&[out]);

		let inputs: Vec<Literal> = [[1.5, -2.0], [3.0, 0.25], [-1.0, 7.0], [0.5, 2.0]]
			.iter()
			.map(|v| Literal::vector(DType::F64, v))
			.collect();
		let before = g.evaluate(&NdarrayBackend, &inputs).unwrap();

		assert!(canonicalize(&mut g, Canonizer::mul()) > 0);
		let after = g.evaluate(&NdarrayBackend, &inputs).unwrap();
		for (x, y) in before[0].data().iter().zip(after[0].data()) {
			assert_approx_eq!(x, y, 1e-12);
		}
		// 0.5 * d
		let div = |op: &Op| op.is_elemwise_of(&ScalarOp::TrueDiv);
		assert_eq!(g.count_nodes(div), 0);
		assert_eq!(g.count_nodes(|op| op.is_elemwise_of(&ScalarOp::Mul)), 1);

		assert_eq!(canonicalize(&mut g, Canonizer::mul()), 0);
	}

	#[test]
	fn test_add_canonizer() {
		let mut g = Graph::new();
		let x = vector(&mut g, "x");
		let y = vector(&mut g, "y");
		let one = g.add_constant(Literal::scalar(DType::F64, 1.0));
		// (x + y + 1) - (x + 1)  ->  y
		let s1 = g.elemwise(ScalarOp::Add, &[x, y, one]).unwrap();
		let s2 = g.elemwise(ScalarOp::Add, &[x, one]).unwrap();
		let d = g.elemwise(ScalarOp::Sub, &[s1, s2]).unwrap();
		g.set_outputs(&[d]);

		assert_eq!(canonicalize(&mut g, Canonizer::add()), 1);
		assert_eq!(g.graph_outputs(), &[y]);
	}

	#[test]
	fn test_type_is_restored() {
		let mut g = Graph::new();
		let x = g.add_input(TensorType::new(DType::F32, &[false, false]), "x");
		// x / x has the shape of x but simplifies to a scalar constant
		let q = g.elemwise(ScalarOp::TrueDiv, &[x, x]).unwrap();
		g.set_outputs(&[q]);
		let ty = g.ty(q).clone();

		assert_eq!(canonicalize(&mut g, Canonizer::mul()), 1);
		let out = g.graph_outputs()[0];
		assert_eq!(*g.ty(out), ty);
		assert!(g.owner_op(out).is_some_and(|(_, op)| op.is_elemwise_of(&ScalarOp::Second)));

		let x_val = Literal::from_shape_vec(DType::F32, &[2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
		let result = g.evaluate(&NdarrayBackend, &[x_val]).unwrap();
		assert_eq!(result[0].shape(), &[2, 2]);
		assert!(result[0].all_equal(1.0));
	}
}

//--------------------------------------------------------------------------------------------------
