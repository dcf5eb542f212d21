//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::rc::Rc;

use ndarray::{ArrayD, IxDyn};
use smallvec::{SmallVec, smallvec};

use crate::ErrPack;
use crate::backend::{Backend, NdarrayBackend};
use crate::dtype::DType;
use crate::graph::{Graph, NodeIndex, ValueIndex};
use crate::literal::{INLINE_DIMS, Literal};
use crate::op::{DimEntry, DimShuffle, Op, SubtensorIndex, TypeError, encompasses_broadcastable};
use crate::scalar::ScalarOp;

use super::{LocalRule, Replacement, RewriteError, RuleDb, Stage, fill_chain, precondition};

//--------------------------------------------------------------------------------------------------

type Transform = fn(&mut Graph, NodeIndex) -> Result<Option<Replacement>, ErrPack<RewriteError>>;

/// Local rule backed by a plain function.
pub struct FnRule {
	name: &'static str,
	transform: Transform,
}

impl FnRule {
	pub fn new(name: &'static str, transform: Transform) -> Rc<dyn LocalRule> {
		Rc::new(Self { name, transform })
	}
}

impl LocalRule for FnRule {
	fn name(&self) -> &'static str {
		self.name
	}

	fn transform(
		&self,
		graph: &mut Graph,
		node: NodeIndex,
	) -> Result<Option<Replacement>, ErrPack<RewriteError>> {
		(self.transform)(graph, node)
	}
}

/// Shape-level cleanups of the canonicalize stage.
pub fn register_structural(db: &mut RuleDb) {
	use Stage::{Canonicalize, Specialize};
	db.register(Canonicalize, FnRule::new("local_dimshuffle_lift", dimshuffle_lift), &["canonicalize"]);
	let shape_lift = FnRule::new("local_shape_lift_elemwise", shape_lift_elemwise);
	db.register(Canonicalize, shape_lift.clone(), &["canonicalize", "shape_lift"]);
	db.register(Specialize, shape_lift, &["specialize", "shape_lift"]);
	db.register(
		Canonicalize,
		FnRule::new("local_shape_lift_sum", shape_lift_sum),
		&["canonicalize", "shape_lift"],
	);
	db.register(
		Canonicalize,
		FnRule::new("local_subtensor_make_vector", subtensor_make_vector),
		&["canonicalize"],
	);
	db.register(Canonicalize, FnRule::new("local_reshape_chain", reshape_chain), &["canonicalize"]);
	db.register(Canonicalize, FnRule::new("local_fill_cut", fill_cut), &["canonicalize"]);
	db.register(Canonicalize, FnRule::new("remove_tensor_copy", remove_tensor_copy), &["canonicalize"]);
	db.register(Canonicalize, FnRule::new("local_fill_sink", fill_sink), &["canonicalize"]);
}

/// Arithmetic rules of both stages.
pub fn register_algebraic(db: &mut RuleDb) {
	use Stage::{Canonicalize, Specialize};
	db.register(Canonicalize, FnRule::new("local_neg_to_mul", neg_to_mul), &["canonicalize"]);
	db.register(Canonicalize, FnRule::new("local_mul_zero", mul_zero), &["canonicalize"]);
	db.register(Canonicalize, FnRule::new("local_pow_canonicalize", pow_canonicalize), &["canonicalize"]);

	let specialize: [(&'static str, Transform); 9] = [
		("local_sum_mul_by_scalar", sum_mul_by_scalar),
		("local_mul_to_neg", mul_to_neg),
		("local_neg_neg", neg_neg),
		("local_neg_div_neg", neg_div_neg),
		("local_div_to_inv", div_to_inv),
		("local_pow_specialize", pow_specialize),
		("local_mul_specialize", mul_specialize),
		("local_add_specialize", add_specialize),
		("local_log1p", log1p),
	];
	for (name, transform) in specialize {
		db.register(Specialize, FnRule::new(name, transform), &["specialize"]);
	}
}

//--------------------------------------------------------------------------------------------------

fn single(v: ValueIndex) -> Option<Replacement> {
	Some(smallvec![v])
}

/// `(model, filling)` if `v` is `second(model, filling)`.
fn fill_parts(graph: &Graph, v: ValueIndex) -> Option<(ValueIndex, ValueIndex)> {
	let (node, op) = graph.owner_op(v)?;
	if !op.is_elemwise_of(&ScalarOp::Second) {
		return None;
	}
	let inputs = graph.inputs(node);
	Some((inputs[0], inputs[1]))
}

/// Constant behind any number of dimshuffles.
fn constant(graph: &Graph, mut v: ValueIndex) -> Option<&Literal> {
	loop {
		if let Some(literal) = graph.literal(v) {
			return Some(literal);
		}
		let (node, op) = graph.owner_op(v)?;
		if !matches!(op, Op::DimShuffle(_)) {
			return None;
		}
		v = graph.inputs(node)[0];
	}
}

fn is_constant(graph: &Graph, v: ValueIndex, value: f64) -> bool {
	constant(graph, v).is_some_and(|literal| literal.all_equal(value))
}

/// Constant of rank `ndim` with every dimension broadcastable.
fn broadcast_constant(graph: &mut Graph, dtype: DType, ndim: usize, value: f64) -> ValueIndex {
	let dims: SmallVec<[usize; INLINE_DIMS]> = smallvec![1; ndim];
	graph.add_constant(Literal::new(dtype, ArrayD::from_elem(IxDyn(&dims), value)))
}

fn restore_dtype(
	graph: &mut Graph,
	v: ValueIndex,
	dtype: DType,
) -> Result<ValueIndex, ErrPack<TypeError>> {
	if graph.ty(v).dtype == dtype {
		return Ok(v);
	}
	graph.elemwise(ScalarOp::Cast(dtype), &[v])
}

fn pure_scalar(graph: &Graph, node: NodeIndex) -> Option<ScalarOp> {
	graph.op(node).scalar_op().cloned()
}

//--------------------------------------------------------------------------------------------------
// structural

/// Moves dimshuffles towards the inputs and merges consecutive ones:
///
/// 	dimshuffle(f(x, y)) -> f(dimshuffle(x), dimshuffle(y))
/// 	dimshuffle(dimshuffle(x)) -> dimshuffle(x), or x if the composition is an identity
fn dimshuffle_lift(
	graph: &mut Graph,
	node: NodeIndex,
) -> Result<Option<Replacement>, ErrPack<RewriteError>> {
	let Op::DimShuffle(ds) = graph.op(node) else {
		return Ok(None);
	};
	let ds = ds.clone();
	let input = graph.inputs(node)[0];
	let Some((inner, inner_op)) = graph.owner_op(input) else {
		return Ok(None);
	};
	let inner_op = inner_op.clone();
	match inner_op {
		Op::Elemwise(ref e) if e.inplace.is_empty() && graph.clients(input).len() == 1 => {
			let inner_inputs = graph.inputs(inner).to_vec();
			let mut lifted: SmallVec<[ValueIndex; 4]> = SmallVec::with_capacity(inner_inputs.len());
			for v in inner_inputs {
				let shuffle = DimShuffle::new(&graph.ty(v).broadcastable.clone(), &ds.new_order);
				lifted.push(graph.apply(Op::DimShuffle(shuffle), &[v])?);
			}
			Ok(single(graph.apply(inner_op.clone(), &lifted)?))
		},
		Op::DimShuffle(inner_ds) => {
			let mut new_order: SmallVec<[DimEntry; INLINE_DIMS]> = SmallVec::new();
			for &entry in &ds.new_order {
				new_order.push(match entry {
					DimEntry::Broadcast => DimEntry::Broadcast,
					DimEntry::Axis(i) => match inner_ds.new_order.get(i) {
						Some(&e) => e,
						None => return precondition("dimshuffle axis out of range"),
					},
				});
			}
			let source = graph.inputs(inner)[0];
			let composed = DimShuffle::new(&inner_ds.input_broadcastable, &new_order);
			if composed.is_identity() {
				return Ok(single(source));
			}
			Ok(single(graph.apply(Op::DimShuffle(composed), &[source])?))
		},
		_ => Ok(None),
	}
}

/// shape(f(..., x, ...)) -> shape(x) where x has the broadcast pattern of the result.
fn shape_lift_elemwise(
	graph: &mut Graph,
	node: NodeIndex,
) -> Result<Option<Replacement>, ErrPack<RewriteError>> {
	if !matches!(graph.op(node), Op::Shape) {
		return Ok(None);
	}
	let value = graph.inputs(node)[0];
	let Some((parent, Op::Elemwise(_))) = graph.owner_op(value) else {
		return Ok(None);
	};
	let pattern = &graph.ty(value).broadcastable;
	let Some(source) =
		graph.inputs(parent).iter().copied().find(|&i| graph.ty(i).broadcastable == *pattern)
	else {
		return Ok(None);
	};
	Ok(single(graph.apply(Op::Shape, &[source])?))
}

/// shape(sum{axes}(x)) -> make_vector(shape(x)[i] for every i not in axes)
fn shape_lift_sum(
	graph: &mut Graph,
	node: NodeIndex,
) -> Result<Option<Replacement>, ErrPack<RewriteError>> {
	if !matches!(graph.op(node), Op::Shape) {
		return Ok(None);
	}
	let value = graph.inputs(node)[0];
	let Some((sum, Op::Sum { axes })) = graph.owner_op(value) else {
		return Ok(None);
	};
	let axes = axes.clone();
	let x = graph.inputs(sum)[0];
	let ndim = graph.ty(x).ndim();
	let shape = graph.apply(Op::Shape, &[x])?;
	let mut dims: SmallVec<[ValueIndex; INLINE_DIMS]> = SmallVec::new();
	for i in 0..ndim {
		if axes.as_ref().is_some_and(|axes| !axes.contains(&i)) {
			dims.push(graph.apply(Op::Subtensor { index: SubtensorIndex::Index(i) }, &[shape])?);
		}
	}
	Ok(single(graph.apply(Op::MakeVector { dtype: DType::I64 }, &dims)?))
}

/// [a, b, c][0] -> a, [a, b, c][0:2] -> [a, b]
fn subtensor_make_vector(
	graph: &mut Graph,
	node: NodeIndex,
) -> Result<Option<Replacement>, ErrPack<RewriteError>> {
	let Op::Subtensor { index } = graph.op(node) else {
		return Ok(None);
	};
	let index = index.clone();
	let out = graph.output(node);
	let Some((vector, &Op::MakeVector { dtype })) = graph.owner_op(graph.inputs(node)[0]) else {
		return Ok(None);
	};
	let elements = graph.inputs(vector).to_vec();
	match index {
		SubtensorIndex::Index(i) => match elements.get(i) {
			Some(&v) if graph.ty(v) == graph.ty(out) => Ok(single(v)),
			_ => Ok(None),
		},
		SubtensorIndex::Slice(a, b) => {
			let Some(slice) = elements.get(a..b) else {
				return Ok(None);
			};
			Ok(single(graph.apply(Op::MakeVector { dtype }, slice)?))
		},
	}
}

/// reshape(reshape(x, s1), s2) -> reshape(x, s2)
fn reshape_chain(
	graph: &mut Graph,
	node: NodeIndex,
) -> Result<Option<Replacement>, ErrPack<RewriteError>> {
	let &Op::Reshape { ndim } = graph.op(node) else {
		return Ok(None);
	};
	let [x, shape] = *graph.inputs(node) else {
		return Ok(None);
	};
	let Some((inner, Op::Reshape { .. })) = graph.owner_op(x) else {
		return Ok(None);
	};
	let source = graph.inputs(inner)[0];
	Ok(single(graph.apply(Op::Reshape { ndim }, &[source, shape])?))
}

/// f(fill(a, b), c) -> f(b, c) if c has the type of the result.
fn fill_cut(graph: &mut Graph, node: NodeIndex) -> Result<Option<Replacement>, ErrPack<RewriteError>> {
	let Some(scalar) = pure_scalar(graph, node) else {
		return Ok(None);
	};
	let out_ty = graph.ty(graph.output(node)).clone();
	let inputs = graph.inputs(node).to_vec();
	let Some(reference) =
		inputs.iter().copied().find(|&v| *graph.ty(v) == out_ty && fill_parts(graph, v).is_none())
	else {
		return Ok(None);
	};
	let pattern = graph.ty(reference).broadcastable.clone();

	let mut changed = false;
	let mut new_inputs: SmallVec<[ValueIndex; 4]> = SmallVec::with_capacity(inputs.len());
	for &v in &inputs {
		if let Some((_, filling)) = fill_parts(graph, v)
			&& encompasses_broadcastable(&pattern, &graph.ty(filling).broadcastable)
		{
			new_inputs.push(filling);
			changed = true;
		} else {
			new_inputs.push(v);
		}
	}
	if !changed {
		return Ok(None);
	}
	Ok(single(graph.elemwise(scalar, &new_inputs)?))
}

/// f(fill(a, b), fill(c, d), e) -> fill(a, fill(c, f(b, d, e)))
fn fill_sink(graph: &mut Graph, node: NodeIndex) -> Result<Option<Replacement>, ErrPack<RewriteError>> {
	let Some(scalar) = pure_scalar(graph, node) else {
		return Ok(None);
	};
	if scalar == ScalarOp::Second {
		return Ok(None);
	}
	let mut models: SmallVec<[ValueIndex; 4]> = SmallVec::new();
	let mut new_inputs: SmallVec<[ValueIndex; 4]> = SmallVec::new();
	for &v in graph.inputs(node) {
		match fill_parts(graph, v) {
			Some((model, filling)) => {
				models.push(model);
				new_inputs.push(filling);
			},
			None => new_inputs.push(v),
		}
	}
	if models.is_empty() {
		return Ok(None);
	}
	let mut result = graph.elemwise(scalar, &new_inputs)?;
	for model in models {
		result = graph.elemwise(ScalarOp::Second, &[model, result])?;
	}
	Ok(single(result))
}

fn remove_tensor_copy(
	graph: &mut Graph,
	node: NodeIndex,
) -> Result<Option<Replacement>, ErrPack<RewriteError>> {
	if !graph.op(node).is_elemwise_of(&ScalarOp::Identity) {
		return Ok(None);
	}
	Ok(single(graph.inputs(node)[0]))
}

//--------------------------------------------------------------------------------------------------
// algebraic, canonicalize stage

/// neg(x) -> mul(-1, x)
fn neg_to_mul(graph: &mut Graph, node: NodeIndex) -> Result<Option<Replacement>, ErrPack<RewriteError>> {
	if !graph.op(node).is_elemwise_of(&ScalarOp::Neg) {
		return Ok(None);
	}
	let x = graph.inputs(node)[0];
	let minus_one = graph.add_constant(Literal::scalar(DType::I8, -1.0));
	Ok(single(graph.elemwise(ScalarOp::Mul, &[minus_one, x])?))
}

/// mul(..., 0, ...) -> 0, filled to the shape of every input.
fn mul_zero(graph: &mut Graph, node: NodeIndex) -> Result<Option<Replacement>, ErrPack<RewriteError>> {
	if !graph.op(node).is_elemwise_of(&ScalarOp::Mul) {
		return Ok(None);
	}
	let inputs = graph.inputs(node).to_vec();
	if !inputs.iter().any(|&v| is_constant(graph, v, 0.0)) {
		return Ok(None);
	}
	let dtype = graph.ty(graph.output(node)).dtype;
	let zero = graph.add_constant(Literal::scalar(dtype, 0.0));
	Ok(single(fill_chain(graph, zero, &inputs)?))
}

/// x ** 1 -> fill(y, x), x ** 0 -> fill(x, fill(y, 1))
fn pow_canonicalize(
	graph: &mut Graph,
	node: NodeIndex,
) -> Result<Option<Replacement>, ErrPack<RewriteError>> {
	if !graph.op(node).is_elemwise_of(&ScalarOp::Pow) {
		return Ok(None);
	}
	let [x, y] = *graph.inputs(node) else {
		return Ok(None);
	};
	let dtype = graph.ty(graph.output(node)).dtype;
	let result = if is_constant(graph, y, 1.0) {
		let x = restore_dtype(graph, x, dtype)?;
		graph.elemwise(ScalarOp::Second, &[y, x])?
	} else if is_constant(graph, y, 0.0) {
		let one = graph.add_constant(Literal::scalar(dtype, 1.0));
		let filled = graph.elemwise(ScalarOp::Second, &[y, one])?;
		graph.elemwise(ScalarOp::Second, &[x, filled])?
	} else {
		return Ok(None);
	};
	Ok(single(result))
}

//--------------------------------------------------------------------------------------------------
// algebraic, specialize stage

/// sum(s * x) -> s * sum(x) for broadcastable `s`, sum(-x) -> -sum(x)
fn sum_mul_by_scalar(
	graph: &mut Graph,
	node: NodeIndex,
) -> Result<Option<Replacement>, ErrPack<RewriteError>> {
	let Op::Sum { .. } = graph.op(node) else {
		return Ok(None);
	};
	let sum = graph.op(node).clone();
	let summed = graph.inputs(node)[0];
	let Some((inner, inner_op)) = graph.owner_op(summed) else {
		return Ok(None);
	};

	if inner_op.is_elemwise_of(&ScalarOp::Neg) {
		let x = graph.inputs(inner)[0];
		let s = graph.apply(sum, &[x])?;
		return Ok(single(graph.elemwise(ScalarOp::Neg, &[s])?));
	}
	if !inner_op.is_elemwise_of(&ScalarOp::Mul) {
		return Ok(None);
	}

	let terms = graph.inputs(inner).to_vec();
	let mut scalars: SmallVec<[ValueIndex; 4]> = SmallVec::new();
	let mut others: SmallVec<[ValueIndex; 4]> = SmallVec::new();
	for t in terms {
		let ty = graph.ty(t);
		if !ty.broadcastable.iter().all(|&b| b) {
			others.push(t);
		} else if ty.ndim() == 0 {
			scalars.push(t);
		} else {
			let drop_all = DimShuffle::new(&ty.broadcastable.clone(), &[]);
			scalars.push(graph.apply(Op::DimShuffle(drop_all), &[t])?);
		}
	}
	if scalars.is_empty() {
		return Ok(None);
	}

	let scalar = match scalars.as_slice() {
		[s] => *s,
		_ => graph.elemwise(ScalarOp::Mul, &scalars)?,
	};
	let rest = match others.as_slice() {
		[] => return Ok(single(scalar)),
		[x] => *x,
		_ => graph.elemwise(ScalarOp::Mul, &others)?,
	};
	let s = graph.apply(sum, &[rest])?;
	Ok(single(graph.elemwise(ScalarOp::Mul, &[scalar, s])?))
}

/// mul(-1, x, y) -> neg(mul(x, y))
fn mul_to_neg(graph: &mut Graph, node: NodeIndex) -> Result<Option<Replacement>, ErrPack<RewriteError>> {
	if !graph.op(node).is_elemwise_of(&ScalarOp::Mul) {
		return Ok(None);
	}
	let inputs = graph.inputs(node).to_vec();
	let [first, ref rest @ ..] = *inputs else {
		return Ok(None);
	};
	if rest.is_empty() || !is_constant(graph, first, -1.0) {
		return Ok(None);
	}
	let product = match rest {
		[x] => *x,
		_ => graph.elemwise(ScalarOp::Mul, rest)?,
	};
	Ok(single(graph.elemwise(ScalarOp::Neg, &[product])?))
}

fn neg_neg(graph: &mut Graph, node: NodeIndex) -> Result<Option<Replacement>, ErrPack<RewriteError>> {
	if !graph.op(node).is_elemwise_of(&ScalarOp::Neg) {
		return Ok(None);
	}
	let Some((inner, op)) = graph.owner_op(graph.inputs(node)[0]) else {
		return Ok(None);
	};
	if !op.is_elemwise_of(&ScalarOp::Neg) {
		return Ok(None);
	}
	Ok(single(graph.inputs(inner)[0]))
}

/// -(-a / b) -> a / b, -(c / b) -> (-c) / b for a broadcastable constant `c`
fn neg_div_neg(graph: &mut Graph, node: NodeIndex) -> Result<Option<Replacement>, ErrPack<RewriteError>> {
	if !graph.op(node).is_elemwise_of(&ScalarOp::Neg) {
		return Ok(None);
	}
	let frac = graph.inputs(node)[0];
	let Some((div, op)) = graph.owner_op(frac) else {
		return Ok(None);
	};
	if !op.is_elemwise_of(&ScalarOp::TrueDiv) || graph.clients(frac).len() != 1 {
		return Ok(None);
	}
	let [num, denum] = *graph.inputs(div) else {
		return Ok(None);
	};
	if let Some((neg, op)) = graph.owner_op(num)
		&& op.is_elemwise_of(&ScalarOp::Neg)
	{
		let a = graph.inputs(neg)[0];
		return Ok(single(graph.elemwise(ScalarOp::TrueDiv, &[a, denum])?));
	}
	if let Some(c) = graph.literal(num)
		&& c.broadcastable().iter().all(|&b| b)
	{
		let negated = Literal::new(c.dtype(), c.data().mapv(|v| -v));
		let negated = graph.add_constant(negated);
		return Ok(single(graph.elemwise(ScalarOp::TrueDiv, &[negated, denum])?));
	}
	Ok(None)
}

/// true_div(1, x) -> inv(x)
fn div_to_inv(graph: &mut Graph, node: NodeIndex) -> Result<Option<Replacement>, ErrPack<RewriteError>> {
	if !graph.op(node).is_elemwise_of(&ScalarOp::TrueDiv) {
		return Ok(None);
	}
	let [one, x] = *graph.inputs(node) else {
		return Ok(None);
	};
	if !is_constant(graph, one, 1.0) {
		return Ok(None);
	}
	Ok(single(graph.elemwise(ScalarOp::Inv, &[x])?))
}

/// pow(x, c) for c in {2, 1, 0, 0.5, -0.5, -1, -2} -> cheaper unary ops
fn pow_specialize(
	graph: &mut Graph,
	node: NodeIndex,
) -> Result<Option<Replacement>, ErrPack<RewriteError>> {
	if !graph.op(node).is_elemwise_of(&ScalarOp::Pow) {
		return Ok(None);
	}
	let [x, y] = *graph.inputs(node) else {
		return Ok(None);
	};
	if !encompasses_broadcastable(&graph.ty(x).broadcastable, &graph.ty(y).broadcastable) {
		return Ok(None);
	}
	let Some(exponent) = constant(graph, y) else {
		return Ok(None);
	};
	let Some(&e) = [2.0, 1.0, 0.0, 0.5, -0.5, -1.0, -2.0].iter().find(|&&e| exponent.all_equal(e))
	else {
		return Ok(None);
	};
	let dtype = graph.ty(graph.output(node)).dtype;

	let result = if e == 2.0 {
		graph.elemwise(ScalarOp::Sqr, &[x])?
	} else if e == 1.0 {
		x
	} else if e == 0.0 {
		let one = graph.add_constant(Literal::scalar(dtype, 1.0));
		graph.elemwise(ScalarOp::Second, &[x, one])?
	} else if e == 0.5 {
		graph.elemwise(ScalarOp::Sqrt, &[x])?
	} else if e == -0.5 {
		let root = graph.elemwise(ScalarOp::Sqrt, &[x])?;
		graph.elemwise(ScalarOp::Inv, &[root])?
	} else if e == -1.0 {
		graph.elemwise(ScalarOp::Inv, &[x])?
	} else {
		let square = graph.elemwise(ScalarOp::Sqr, &[x])?;
		graph.elemwise(ScalarOp::Inv, &[square])?
	};
	Ok(single(restore_dtype(graph, result, dtype)?))
}

/// Drops factors of 1, folds factors of -1 into a negation and collapses a product
/// with a factor of 0.
fn mul_specialize(
	graph: &mut Graph,
	node: NodeIndex,
) -> Result<Option<Replacement>, ErrPack<RewriteError>> {
	if !graph.op(node).is_elemwise_of(&ScalarOp::Mul) {
		return Ok(None);
	}
	let inputs = graph.inputs(node).to_vec();
	let out_ty = graph.ty(graph.output(node)).clone();
	let mut neg = false;
	let mut kept: SmallVec<[ValueIndex; 4]> = SmallVec::new();
	for &v in &inputs {
		let factor = constant(graph, v).and_then(|c| [1.0, -1.0, 0.0].into_iter().find(|&k| c.all_equal(k)));
		match factor {
			Some(1.0) => {},
			Some(-1.0) => neg = !neg,
			Some(_) => return Ok(single(fill_chain(graph, v, &inputs)?)),
			None => kept.push(v),
		}
	}
	if kept.len() == inputs.len() {
		return Ok(None);
	}

	let result = match kept.as_slice() {
		[] => {
			let value = if neg { -1.0 } else { 1.0 };
			broadcast_constant(graph, out_ty.dtype, out_ty.ndim(), value)
		},
		_ => {
			let product = match kept.as_slice() {
				[x] => *x,
				_ => graph.elemwise(ScalarOp::Mul, &kept)?,
			};
			let signed = if neg { graph.elemwise(ScalarOp::Neg, &[product])? } else { product };
			restore_dtype(graph, signed, out_ty.dtype)?
		},
	};
	Ok(single(fill_chain(graph, result, &inputs)?))
}

/// Constant behind dimshuffles and the filling side of fills.
fn constant_through_fills(graph: &Graph, mut v: ValueIndex) -> Option<&Literal> {
	loop {
		if let Some(literal) = graph.literal(v) {
			return Some(literal);
		}
		let (node, op) = graph.owner_op(v)?;
		v = match op {
			Op::DimShuffle(_) => graph.inputs(node)[0],
			_ if op.is_elemwise_of(&ScalarOp::Second) => graph.inputs(node)[1],
			_ => return None,
		};
	}
}

/// Drops terms that are 0.
fn add_specialize(
	graph: &mut Graph,
	node: NodeIndex,
) -> Result<Option<Replacement>, ErrPack<RewriteError>> {
	if !graph.op(node).is_elemwise_of(&ScalarOp::Add) {
		return Ok(None);
	}
	let inputs = graph.inputs(node).to_vec();
	let out_ty = graph.ty(graph.output(node)).clone();
	let kept: SmallVec<[ValueIndex; 4]> = inputs
		.iter()
		.copied()
		.filter(|&v| !constant_through_fills(graph, v).is_some_and(|c| c.all_equal(0.0)))
		.collect();
	if kept.len() == inputs.len() {
		return Ok(None);
	}
	let result = match kept.as_slice() {
		[] => broadcast_constant(graph, out_ty.dtype, out_ty.ndim(), 0.0),
		[x] => restore_dtype(graph, *x, out_ty.dtype)?,
		_ => {
			let sum = graph.elemwise(ScalarOp::Add, &kept)?;
			restore_dtype(graph, sum, out_ty.dtype)?
		},
	};
	Ok(single(fill_chain(graph, result, &inputs)?))
}

/// Scalar value behind dimshuffles and fills, and the models of the fills passed.
fn constant_with_fills(graph: &Graph, mut v: ValueIndex, fills: &mut Vec<ValueIndex>) -> Option<f64> {
	loop {
		if let Some(literal) = graph.literal(v) {
			let first = literal.first()?;
			return literal.all_equal(first).then_some(first);
		}
		let (node, op) = graph.owner_op(v)?;
		let inputs = graph.inputs(node);
		v = match op {
			Op::DimShuffle(_) => inputs[0],
			_ if op.is_elemwise_of(&ScalarOp::Second) => {
				fills.push(inputs[0]);
				inputs[1]
			},
			_ => return None,
		};
	}
}

fn is_close(a: f64, b: f64) -> bool {
	(a - b).abs() <= 1e-8 + 1e-5 * b.abs()
}

/// log(1 + x) -> log1p(x), with the constant terms summing to 1.
fn log1p(graph: &mut Graph, node: NodeIndex) -> Result<Option<Replacement>, ErrPack<RewriteError>> {
	if !graph.op(node).is_elemwise_of(&ScalarOp::Log) {
		return Ok(None);
	}
	let Some((add, op)) = graph.owner_op(graph.inputs(node)[0]) else {
		return Ok(None);
	};
	if !op.is_elemwise_of(&ScalarOp::Add) {
		return Ok(None);
	}
	let mut total = 0.0;
	let mut fills = Vec::new();
	let mut others: SmallVec<[ValueIndex; 4]> = SmallVec::new();
	for &v in graph.inputs(add) {
		let mut f = Vec::new();
		match constant_with_fills(graph, v, &mut f) {
			Some(c) => {
				total += c;
				fills.append(&mut f);
			},
			None => others.push(v),
		}
	}
	if others.is_empty() || !is_close(total, 1.0) {
		return Ok(None);
	}
	let x = match others.as_slice() {
		[x] => *x,
		_ => graph.elemwise(ScalarOp::Add, &others)?,
	};
	let dtype = graph.ty(graph.output(node)).dtype;
	let result = graph.elemwise(ScalarOp::Log1p, &[x])?;
	let result = restore_dtype(graph, result, dtype)?;
	Ok(single(fill_chain(graph, result, &fills)?))
}

//--------------------------------------------------------------------------------------------------

/// Evaluates nodes whose inputs are all constants.
pub struct ConstantFolding<B: Backend = NdarrayBackend> {
	backend: B,
}

impl<B: Backend> ConstantFolding<B> {
	pub fn new(backend: B) -> Self {
		Self { backend }
	}
}

impl<B: Backend> LocalRule for ConstantFolding<B> {
	fn name(&self) -> &'static str {
		"constant_folding"
	}

	fn transform(
		&self,
		graph: &mut Graph,
		node: NodeIndex,
	) -> Result<Option<Replacement>, ErrPack<RewriteError>> {
		if !graph.op(node).destroy_map().is_empty() {
			return Ok(None);
		}
		let results = {
			let mut literals: SmallVec<[&Literal; 4]> = SmallVec::new();
			for &v in graph.inputs(node) {
				let Some(literal) = graph.literal(v) else {
					return Ok(None);
				};
				literals.push(literal);
			}
			self.backend.perform(graph.op(node), &literals)?
		};
		let outputs = graph.outputs(node).to_vec();
		let mut replacement = Replacement::new();
		for (literal, out) in results.into_iter().zip(outputs) {
			let ty = graph.ty(out).clone();
			replacement.push(graph.add_typed_constant(ty, literal)?);
		}
		Ok(Some(replacement))
	}
}

//--------------------------------------------------------------------------------------------------


//--------------------------------------------------------------------------------------------------
