//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::borrow::Cow;
use std::fmt;
use std::rc::Rc;

use bit_set::BitSet;
use log::debug;
use smallvec::SmallVec;

use crate::backend::{Backend, PerformError};
use crate::literal::Literal;
use crate::op::{DimShuffle, Op, TensorType, TypeError};
use crate::scalar::ScalarOp;
use crate::util::index_vec::IndexVec;
use crate::{ErrPack, cold_path, define_index_type};

//--------------------------------------------------------------------------------------------------

define_index_type!(ValueIndex);
define_index_type!(NodeIndex);

/// Consumer of a value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Client {
	Node { node: NodeIndex, slot: usize },

	/// Graph output slot.
	Output(usize),
}

#[derive(Clone)]
struct ValueData {
	ty: TensorType,
	owner: Option<(NodeIndex, usize)>,
	constant: Option<Rc<Literal>>,
	name: Option<Cow<'static, str>>,
	clients: Vec<Client>,
}

#[derive(Clone)]
struct NodeData {
	op: Op,
	inputs: SmallVec<[ValueIndex; 4]>,
	outputs: SmallVec<[ValueIndex; 1]>,

	/// Attached nodes are reachable from the graph outputs and registered as clients
	/// of their inputs. Nodes created by rewrite rules stay detached until a
	/// transaction commits them.
	attached: bool,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ReplaceError {
	TypeMismatch,
	Cycle,
	DestroyConflict,
	NotInGraph,
}

enum Undo {
	Clients(ValueIndex, Vec<Client>),
	Attached(NodeIndex, bool),
	Input(NodeIndex, usize, ValueIndex),
	Outputs(Vec<ValueIndex>),
}

#[derive(Default)]
struct Journal {
	undo: Vec<Undo>,
	saved_clients: BitSet,
}

/// Comparable snapshot of the attached part of a graph.
#[derive(Clone, Debug, PartialEq)]
pub struct GraphStructure {
	outputs: Vec<ValueIndex>,
	nodes: Vec<(NodeIndex, Op, SmallVec<[ValueIndex; 4]>)>,
	clients: Vec<(ValueIndex, Vec<Client>)>,
}

//--------------------------------------------------------------------------------------------------

/// Expression DAG. Values and nodes live in arenas and are never freed; replaced
/// subgraphs become detached instead.
#[derive(Clone)]
pub struct Graph {
	values: IndexVec<ValueIndex, ValueData>,
	nodes: IndexVec<NodeIndex, NodeData>,
	inputs: Vec<ValueIndex>,
	outputs: Vec<ValueIndex>,
}

impl Default for Graph {
	fn default() -> Self {
		Self::new()
	}
}

impl Graph {
	pub fn new() -> Self {
		Self {
			values: IndexVec::new(),
			nodes: IndexVec::new(),
			inputs: Vec::new(),
			outputs: Vec::new(),
		}
	}

	pub fn add_input<S: Into<Cow<'static, str>>>(&mut self, ty: TensorType, name: S) -> ValueIndex {
		let value = self.values.push(ValueData {
			ty,
			owner: None,
			constant: None,
			name: Some(name.into()),
			clients: Vec::new(),
		});
		self.inputs.push(value);
		value
	}

	pub fn add_constant(&mut self, literal: Literal) -> ValueIndex {
		let ty = TensorType { dtype: literal.dtype(), broadcastable: literal.broadcastable() };
		self.values.push(ValueData {
			ty,
			owner: None,
			constant: Some(Rc::new(literal)),
			name: None,
			clients: Vec::new(),
		})
	}

	/// Constant with an explicit static type. Used when folding a node, so the constant
	/// keeps the type of the value it replaces.
	pub fn add_typed_constant(
		&mut self,
		ty: TensorType,
		literal: Literal,
	) -> Result<ValueIndex, ErrPack<TypeError>> {
		let fits = ty.dtype == literal.dtype()
			&& ty.ndim() == literal.ndim()
			&& ty.broadcastable.iter().zip(literal.shape()).all(|(&b, &d)| !b || d == 1);
		if !fits {
			cold_path();
			return Err(ErrPack::with_message(
				TypeError::BroadcastMismatch,
				format!("literal of shape {:?} does not fit {ty}", literal.shape()),
			));
		}
		Ok(self.values.push(ValueData {
			ty,
			owner: None,
			constant: Some(Rc::new(literal)),
			name: None,
			clients: Vec::new(),
		}))
	}

	/// Creates a detached node and returns its output.
	pub fn apply(&mut self, op: Op, inputs: &[ValueIndex]) -> Result<ValueIndex, ErrPack<TypeError>> {
		let out_types = {
			let in_types: SmallVec<[&TensorType; 4]> = inputs.iter().map(|&v| self.ty(v)).collect();
			op.infer_types(&in_types)?
		};
		let node = self.nodes.next_index();
		let outputs: SmallVec<[ValueIndex; 1]> = out_types
			.into_iter()
			.enumerate()
			.map(|(i, ty)| {
				self.values.push(ValueData {
					ty,
					owner: Some((node, i)),
					constant: None,
					name: None,
					clients: Vec::new(),
				})
			})
			.collect();
		let first = outputs[0];
		self.nodes.push(NodeData {
			op,
			inputs: SmallVec::from_slice(inputs),
			outputs,
			attached: false,
		});
		Ok(first)
	}

	/// Elementwise application. Inputs of lower rank are left-padded with broadcastable
	/// dimensions.
	pub fn elemwise(
		&mut self,
		scalar: ScalarOp,
		inputs: &[ValueIndex],
	) -> Result<ValueIndex, ErrPack<TypeError>> {
		let ndim = inputs.iter().map(|&v| self.ty(v).ndim()).max().unwrap_or(0);
		let mut padded: SmallVec<[ValueIndex; 4]> = SmallVec::with_capacity(inputs.len());
		for &v in inputs {
			let ty = self.ty(v);
			if ty.ndim() < ndim {
				let ds = DimShuffle::left_pad(&ty.broadcastable, ndim);
				padded.push(self.apply(Op::DimShuffle(ds), &[v])?);
			} else {
				padded.push(v);
			}
		}
		self.apply(Op::elemwise(scalar), &padded)
	}

	/// Sets the graph outputs and attaches everything they depend on.
	pub fn set_outputs(&mut self, outputs: &[ValueIndex]) {
		let mut journal = Journal::default();
		let old = std::mem::take(&mut self.outputs);
		for (i, &v) in old.iter().enumerate() {
			self.remove_client(&mut journal, v, Client::Output(i));
		}
		for (i, &v) in outputs.iter().enumerate() {
			self.attach_value(&mut journal, v);
			self.clients_mut(&mut journal, v).push(Client::Output(i));
		}
		self.outputs = outputs.to_vec();
		for v in old {
			self.prune(&mut journal, v);
		}
	}

	//----------------------------------------------------------------------------------------------

	pub fn ty(&self, value: ValueIndex) -> &TensorType {
		&self.values[value].ty
	}

	pub fn owner(&self, value: ValueIndex) -> Option<NodeIndex> {
		self.values[value].owner.map(|(node, _)| node)
	}

	pub fn literal(&self, value: ValueIndex) -> Option<&Literal> {
		self.values[value].constant.as_deref()
	}

	pub fn name(&self, value: ValueIndex) -> Option<&str> {
		self.values[value].name.as_deref()
	}

	pub fn clients(&self, value: ValueIndex) -> &[Client] {
		&self.values[value].clients
	}

	pub fn op(&self, node: NodeIndex) -> &Op {
		&self.nodes[node].op
	}

	pub fn inputs(&self, node: NodeIndex) -> &[ValueIndex] {
		&self.nodes[node].inputs
	}

	pub fn outputs(&self, node: NodeIndex) -> &[ValueIndex] {
		&self.nodes[node].outputs
	}

	pub fn output(&self, node: NodeIndex) -> ValueIndex {
		self.nodes[node].outputs[0]
	}

	/// Number of nodes ever created, attached or not. Nodes created later have
	/// higher indices.
	pub fn node_count(&self) -> usize {
		self.nodes.len()
	}

	pub fn is_attached(&self, node: NodeIndex) -> bool {
		self.nodes[node].attached
	}

	pub fn graph_inputs(&self) -> &[ValueIndex] {
		&self.inputs
	}

	pub fn graph_outputs(&self) -> &[ValueIndex] {
		&self.outputs
	}

	/// Producer of `value` together with its operator, if any.
	pub fn owner_op(&self, value: ValueIndex) -> Option<(NodeIndex, &Op)> {
		self.owner(value).map(|node| (node, self.op(node)))
	}

	/// Value of a constant whose elements are all equal. Looks through broadcasts,
	/// fills and casts of such constants.
	pub fn scalar_constant(&self, value: ValueIndex) -> Option<f64> {
		if let Some(literal) = self.literal(value) {
			let first = literal.first()?;
			return literal.all_equal(first).then_some(first);
		}
		let (node, op) = self.owner_op(value)?;
		match op {
			Op::DimShuffle(_) => self.scalar_constant(self.inputs(node)[0]),
			Op::Elemwise(e) => match &e.scalar {
				ScalarOp::Second => self.scalar_constant(self.inputs(node)[1]),
				ScalarOp::Cast(dtype) => self.scalar_constant(self.inputs(node)[0]).map(|v| dtype.cast_value(v)),
				_ => None,
			},
			_ => None,
		}
	}

	/// Attached nodes reachable from the outputs, producers before consumers.
	/// Deterministic: depth-first post-order over inputs in slot order.
	pub fn topo_order(&self) -> Vec<NodeIndex> {
		self.dfs().0
	}

	fn dfs(&self) -> (Vec<NodeIndex>, bool) {
		let mut order = Vec::new();
		let mut cycle = false;
		let mut done = BitSet::with_capacity(self.nodes.len());
		let mut active = BitSet::with_capacity(self.nodes.len());
		let mut stack: Vec<(NodeIndex, usize)> = Vec::new();
		for &out in &self.outputs {
			let Some(root) = self.owner(out) else {
				continue;
			};
			if done.contains(root.raw) {
				continue;
			}
			active.insert(root.raw);
			stack.push((root, 0));
			while let Some(top) = stack.last_mut() {
				let (node, slot) = *top;
				top.1 += 1;
				if let Some(&input) = self.nodes[node].inputs.get(slot) {
					if let Some(producer) = self.owner(input) {
						if active.contains(producer.raw) {
							cold_path();
							cycle = true;
						} else if !done.contains(producer.raw) {
							active.insert(producer.raw);
							stack.push((producer, 0));
						}
					}
				} else {
					stack.pop();
					active.remove(node.raw);
					done.insert(node.raw);
					order.push(node);
				}
			}
		}
		(order, cycle)
	}

	/// Number of attached nodes whose operator matches `pred`.
	pub fn count_nodes(&self, pred: impl Fn(&Op) -> bool) -> usize {
		self.topo_order().into_iter().filter(|&n| pred(self.op(n))).count()
	}

	pub fn structure(&self) -> GraphStructure {
		GraphStructure {
			outputs: self.outputs.clone(),
			nodes: self
				.nodes
				.indexes()
				.filter(|&n| self.nodes[n].attached)
				.map(|n| (n, self.nodes[n].op.clone(), self.nodes[n].inputs.clone()))
				.collect(),
			clients: self
				.values
				.indexes()
				.filter(|&v| !self.values[v].clients.is_empty())
				.map(|v| (v, self.values[v].clients.clone()))
				.collect(),
		}
	}

	//----------------------------------------------------------------------------------------------

	pub fn replace_validate(
		&mut self,
		old: ValueIndex,
		new: ValueIndex,
		reason: &str,
	) -> Result<(), ErrPack<ReplaceError>> {
		self.replace_all_validate(&[(old, new)], reason)
	}

	/// Replaces every `old` with its `new` in one transaction. Clients of `old` are
	/// redirected to `new`, the subgraph of `new` is attached and whatever becomes
	/// unreachable is detached. If the result has a cycle or an unsafe destructive
	/// operation, the graph is restored exactly to its previous state.
	pub fn replace_all_validate(
		&mut self,
		pairs: &[(ValueIndex, ValueIndex)],
		reason: &str,
	) -> Result<(), ErrPack<ReplaceError>> {
		for &(old, new) in pairs {
			if self.ty(old) != self.ty(new) {
				cold_path();
				return Err(ErrPack::with_message(
					ReplaceError::TypeMismatch,
					format!("{reason}: cannot replace {old:?}: {} with {new:?}: {}", self.ty(old), self.ty(new)),
				));
			}
			if !self.is_in_graph(old) {
				cold_path();
				return Err(ErrPack::with_message(
					ReplaceError::NotInGraph,
					format!("{reason}: {old:?} is not part of the graph"),
				));
			}
		}

		let mut journal = Journal::default();
		for &(old, new) in pairs {
			if old != new {
				self.redirect(&mut journal, old, new);
			}
		}

		if let Err(err) = self.validate() {
			cold_path();
			self.rollback(journal);
			debug!("{reason}: rolled back: {err}");
			return Err(err);
		}
		debug!("{reason}: committed {} replacement(s)", pairs.len());
		Ok(())
	}

	fn is_in_graph(&self, value: ValueIndex) -> bool {
		match self.values[value].owner {
			Some((node, _)) => self.nodes[node].attached,
			None => !self.values[value].clients.is_empty() || self.inputs.contains(&value),
		}
	}

	fn redirect(&mut self, journal: &mut Journal, old: ValueIndex, new: ValueIndex) {
		// clients are taken before `new` is attached, so uses of `old` inside the
		// replacement subgraph stay in place
		let clients = self.values[old].clients.clone();
		self.attach_value(journal, new);
		for client in clients {
			match client {
				Client::Node { node, slot } => {
					journal.undo.push(Undo::Input(node, slot, old));
					self.nodes[node].inputs[slot] = new;
				},
				Client::Output(i) => {
					journal.undo.push(Undo::Outputs(self.outputs.clone()));
					self.outputs[i] = new;
				},
			}
			self.remove_client(journal, old, client);
			self.clients_mut(journal, new).push(client);
		}
		self.prune(journal, old);
	}

	fn attach_value(&mut self, journal: &mut Journal, value: ValueIndex) {
		let Some((root, _)) = self.values[value].owner else {
			return;
		};
		let mut stack = vec![root];
		while let Some(node) = stack.pop() {
			if self.nodes[node].attached {
				continue;
			}
			journal.undo.push(Undo::Attached(node, false));
			self.nodes[node].attached = true;
			let inputs = self.nodes[node].inputs.clone();
			for (slot, input) in inputs.into_iter().enumerate() {
				self.clients_mut(journal, input).push(Client::Node { node, slot });
				if let Some((producer, _)) = self.values[input].owner {
					stack.push(producer);
				}
			}
		}
	}

	/// Detaches the producer of `value` and its ancestors once none of their outputs
	/// has a client.
	fn prune(&mut self, journal: &mut Journal, value: ValueIndex) {
		let mut stack = vec![value];
		while let Some(value) = stack.pop() {
			let Some((node, _)) = self.values[value].owner else {
				continue;
			};
			let data = &self.nodes[node];
			if !data.attached || data.outputs.iter().any(|&o| !self.values[o].clients.is_empty()) {
				continue;
			}
			journal.undo.push(Undo::Attached(node, true));
			self.nodes[node].attached = false;
			let inputs = self.nodes[node].inputs.clone();
			for (slot, input) in inputs.into_iter().enumerate() {
				self.remove_client(journal, input, Client::Node { node, slot });
				stack.push(input);
			}
		}
	}

	fn clients_mut(&mut self, journal: &mut Journal, value: ValueIndex) -> &mut Vec<Client> {
		if journal.saved_clients.insert(value.raw) {
			journal.undo.push(Undo::Clients(value, self.values[value].clients.clone()));
		}
		&mut self.values[value].clients
	}

	fn remove_client(&mut self, journal: &mut Journal, value: ValueIndex, client: Client) {
		let clients = self.clients_mut(journal, value);
		if let Some(pos) = clients.iter().position(|&c| c == client) {
			clients.remove(pos);
		}
	}

	fn rollback(&mut self, journal: Journal) {
		for undo in journal.undo.into_iter().rev() {
			match undo {
				Undo::Clients(value, clients) => self.values[value].clients = clients,
				Undo::Attached(node, attached) => self.nodes[node].attached = attached,
				Undo::Input(node, slot, value) => self.nodes[node].inputs[slot] = value,
				Undo::Outputs(outputs) => self.outputs = outputs,
			}
		}
	}

	fn validate(&self) -> Result<(), ErrPack<ReplaceError>> {
		let (order, cycle) = self.dfs();
		if cycle {
			cold_path();
			return Err(ErrPack::with_message(ReplaceError::Cycle, "replacement introduces a cycle"));
		}
		self.validate_destroyers(&order)
	}

	/// Operators whose output aliases their first input.
	fn view_of(&self, value: ValueIndex) -> Option<ValueIndex> {
		let (node, op) = self.owner_op(value)?;
		match op {
			Op::DimShuffle(_) | Op::Reshape { .. } | Op::Subtensor { .. } => Some(self.inputs(node)[0]),
			_ => None,
		}
	}

	/// A destroyed value, and every value it is a view of, must be consumed only by
	/// the destroying node and must not be a graph input or a constant. No buffer may
	/// be destroyed twice.
	/// Only the live nodes in `order` are checked.
	fn validate_destroyers(&self, order: &[NodeIndex]) -> Result<(), ErrPack<ReplaceError>> {
		let mut destroyed = BitSet::new();
		for &node in order {
			let data = &self.nodes[node];
			for &(_, input) in data.op.destroy_map() {
				let Some(&value) = data.inputs.get(input) else {
					cold_path();
					return Err(ErrPack::new(ReplaceError::DestroyConflict));
				};
				let mut current = Some(value);
				while let Some(v) = current {
					let vd = &self.values[v];
					if vd.clients.len() != 1 || vd.constant.is_some() || vd.owner.is_none() {
						cold_path();
						return Err(ErrPack::with_message(
							ReplaceError::DestroyConflict,
							format!("{node:?} cannot destroy {v:?}"),
						));
					}
					if !destroyed.insert(v.raw) {
						cold_path();
						return Err(ErrPack::with_message(
							ReplaceError::DestroyConflict,
							format!("{v:?} is destroyed twice"),
						));
					}
					current = self.view_of(v);
				}
			}
		}
		Ok(())
	}

	//----------------------------------------------------------------------------------------------

	/// Runs the graph on `inputs`, one literal per graph input.
	pub fn evaluate(
		&self,
		backend: &dyn Backend,
		inputs: &[Literal],
	) -> Result<Vec<Literal>, ErrPack<PerformError>> {
		if inputs.len() != self.inputs.len() {
			cold_path();
			return Err(ErrPack::with_message(
				PerformError::TypeMismatch,
				format!("expected {} inputs, got {}", self.inputs.len(), inputs.len()),
			));
		}
		let mut env: Vec<Option<Rc<Literal>>> = vec![None; self.values.len()];
		for (&v, literal) in self.inputs.iter().zip(inputs) {
			env[v.raw] = Some(Rc::new(literal.clone()));
		}
		let lookup = |env: &[Option<Rc<Literal>>], v: ValueIndex| -> Option<Rc<Literal>> {
			env[v.raw].clone().or_else(|| self.values[v].constant.clone())
		};
		for node in self.topo_order() {
			let data = &self.nodes[node];
			let mut args: SmallVec<[Rc<Literal>; 4]> = SmallVec::new();
			for &input in &data.inputs {
				let Some(literal) = lookup(&env, input) else {
					cold_path();
					return Err(ErrPack::with_message(
						PerformError::TypeMismatch,
						format!("no value for {input:?}"),
					));
				};
				args.push(literal);
			}
			let arg_refs: SmallVec<[&Literal; 4]> = args.iter().map(|a| a.as_ref()).collect();
			let results = backend.perform(&data.op, &arg_refs)?;
			for (&out, literal) in data.outputs.iter().zip(results) {
				env[out.raw] = Some(Rc::new(literal));
			}
		}
		let mut outputs = Vec::with_capacity(self.outputs.len());
		for &v in &self.outputs {
			let Some(literal) = lookup(&env, v) else {
				cold_path();
				return Err(ErrPack::new(PerformError::TypeMismatch));
			};
			outputs.push(literal.as_ref().clone());
		}
		Ok(outputs)
	}

	fn fmt_value(&self, f: &mut fmt::Formatter<'_>, value: ValueIndex) -> fmt::Result {
		if let Some(name) = self.name(value) {
			write!(f, "{name}")
		} else if let Some(c) = self.scalar_constant(value)
			&& self.literal(value).is_some()
		{
			write!(f, "{c}")
		} else {
			write!(f, "v{}", value.raw)
		}
	}
}

impl fmt::Display for Graph {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		for node in self.topo_order() {
			let data = &self.nodes[node];
			for (i, &out) in data.outputs.iter().enumerate() {
				if i > 0 {
					write!(f, ", ")?;
				}
				self.fmt_value(f, out)?;
			}
			write!(f, " = {}(", data.op)?;
			for (i, &input) in data.inputs.iter().enumerate() {
				if i > 0 {
					write!(f, ", ")?;
				}
				self.fmt_value(f, input)?;
			}
			writeln!(f, ")")?;
		}
		write!(f, "return ")?;
		for (i, &out) in self.outputs.iter().enumerate() {
			if i > 0 {
				write!(f, ", ")?;
			}
			self.fmt_value(f, out)?;
		}
		Ok(())
	}
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;
	use crate::backend::NdarrayBackend;
	use crate::dtype::DType;
	use crate::op::Elemwise;
	use assert_approx_eq::assert_approx_eq;
	use smallvec::smallvec;

	fn vector(graph: &mut Graph, name: &'static str) -> ValueIndex {
		graph.add_input(TensorType::new(DType::F64, &[false]), name)
	}

	#[test]
	fn test_build_and_clients() {
		let mut g = Graph::new();
		let x = vector(&mut g, "x");
		let y = vector(&mut g, "y");
		let s = g.elemwise(ScalarOp::Add, &[x, y]).unwrap();
		let p = g.elemwise(ScalarOp::Mul, &[s, x]).unwrap();

		// nothing is attached before the outputs are set
		assert!(g.clients(x).is_empty());
		g.set_outputs(&[p]);

		assert_eq!(g.clients(x).len(), 2);
		assert_eq!(g.clients(s), &[Client::Node { node: g.owner(p).unwrap(), slot: 0 }]);
		assert_eq!(g.clients(p), &[Client::Output(0)]);
		assert_eq!(g.topo_order(), vec![g.owner(s).unwrap(), g.owner(p).unwrap()]);
	}

	#[test]
	fn test_elemwise_pads_rank() {
		let mut g = Graph::new();
		let x = g.add_input(TensorType::new(DType::F32, &[false, false]), "x");
		let two = g.add_constant(Literal::scalar(DType::F32, 2.0));
		let y = g.elemwise(ScalarOp::Mul, &[x, two]).unwrap();
		assert_eq!(g.ty(y), &TensorType::new(DType::F32, &[false, false]));
		let pad = g.inputs(g.owner(y).unwrap())[1];
		assert!(matches!(g.owner_op(pad), Some((_, Op::DimShuffle(ds))) if ds.is_left_pad()));
		assert_eq!(g.scalar_constant(pad), Some(2.0));
	}

	#[test]
	fn test_replace_prunes_old_subgraph() {
		let mut g = Graph::new();
		let x = vector(&mut g, "x");
		let e = g.elemwise(ScalarOp::Exp, &[x]).unwrap();
		let n = g.elemwise(ScalarOp::Neg, &[e]).unwrap();
		g.set_outputs(&[n]);

		let l = g.elemwise(ScalarOp::Log, &[x]).unwrap();
		g.replace_validate(n, l, "test").unwrap();

		assert_eq!(g.graph_outputs(), &[l]);
		assert!(!g.is_attached(g.owner(n).unwrap()));
		assert!(!g.is_attached(g.owner(e).unwrap()));
		assert_eq!(g.clients(x), &[Client::Node { node: g.owner(l).unwrap(), slot: 0 }]);
		assert_eq!(g.topo_order(), vec![g.owner(l).unwrap()]);
	}

	#[test]
	fn test_replacement_may_use_old_value() {
		let mut g = Graph::new();
		let x = vector(&mut g, "x");
		let e = g.elemwise(ScalarOp::Exp, &[x]).unwrap();
		let n = g.elemwise(ScalarOp::Neg, &[e]).unwrap();
		g.set_outputs(&[n]);

		let c = g.elemwise(ScalarOp::Sqr, &[e]).unwrap();
		g.replace_validate(e, c, "test").unwrap();
		assert_eq!(g.inputs(g.owner(n).unwrap()), &[c]);
		assert_eq!(g.inputs(g.owner(c).unwrap()), &[e]);
		assert_eq!(g.topo_order().len(), 3);
	}

	#[test]
	fn test_failed_transaction_is_atomic() {
		let mut g = Graph::new();
		let x = vector(&mut g, "x");
		let y = vector(&mut g, "y");
		let a = g.elemwise(ScalarOp::Add, &[x, y]).unwrap();
		let b = g.elemwise(ScalarOp::Exp, &[a]).unwrap();
		let c = g.elemwise(ScalarOp::Mul, &[b, y]).unwrap();
		g.set_outputs(&[c, a]);
		let before = g.structure();

		// first pair closes a cycle: a := log(b), and b depends on a
		let m = g.elemwise(ScalarOp::Sub, &[x, y]).unwrap();
		let l = g.elemwise(ScalarOp::Log, &[b]).unwrap();
		let err = g.replace_all_validate(&[(a, l), (c, m)], "test").unwrap_err();
		assert_eq!(err.code, ReplaceError::Cycle);
		assert_eq!(g.structure(), before);

		// type mismatch is rejected before anything changes
		let s = g.add_input(TensorType::scalar(DType::F64), "s");
		let err = g.replace_validate(c, s, "test").unwrap_err();
		assert_eq!(err.code, ReplaceError::TypeMismatch);
		assert_eq!(g.structure(), before);
	}

	#[test]
	fn test_destroy_validation() {
		let mut g = Graph::new();
		let x = vector(&mut g, "x");
		let e = g.elemwise(ScalarOp::Exp, &[x]).unwrap();
		let s = g.elemwise(ScalarOp::Sqr, &[e]).unwrap();
		let l = g.elemwise(ScalarOp::Log, &[e]).unwrap();
		g.set_outputs(&[s, l]);
		let before = g.structure();

		// `e` has two clients
		let op = Op::Elemwise(Elemwise { scalar: ScalarOp::Sqr, inplace: smallvec![(0, 0)] });
		let s2 = g.apply(op, &[e]).unwrap();
		let err = g.replace_validate(s, s2, "test").unwrap_err();
		assert_eq!(err.code, ReplaceError::DestroyConflict);
		assert_eq!(g.structure(), before);

		// graph inputs are never destroyed
		let e2 = g.apply(Op::Elemwise(Elemwise { scalar: ScalarOp::Exp, inplace: smallvec![(0, 0)] }), &[x])
			.unwrap();
		let err = g.replace_validate(e, e2, "test").unwrap_err();
		assert_eq!(err.code, ReplaceError::DestroyConflict);
	}

	#[test]
	fn test_rejected_proposals_are_not_validated() {
		let mut g = Graph::new();
		let x = vector(&mut g, "x");
		let e = g.elemwise(ScalarOp::Exp, &[x]).unwrap();
		let s = g.elemwise(ScalarOp::Sqr, &[e]).unwrap();
		g.set_outputs(&[s]);

		let bad = g.apply(Op::Elemwise(Elemwise { scalar: ScalarOp::Exp, inplace: smallvec![(0, 0)] }), &[x])
			.unwrap();
		assert_eq!(g.replace_validate(e, bad, "test").unwrap_err().code, ReplaceError::DestroyConflict);

		// the detached proposal still destroys `x`, but it is not part of the graph
		let good = g.apply(Op::Elemwise(Elemwise { scalar: ScalarOp::Sqr, inplace: smallvec![(0, 0)] }), &[e])
			.unwrap();
		g.replace_validate(s, good, "test").unwrap();
		assert_eq!(g.count_nodes(|op| !op.destroy_map().is_empty()), 1);
		assert_eq!(g.topo_order().len(), 2);
	}

	#[test]
	fn test_evaluate() {
		let mut g = Graph::new();
		let x = vector(&mut g, "x");
		let half = g.add_constant(Literal::scalar(DType::F64, 0.5));
		let p = g.elemwise(ScalarOp::Pow, &[x, half]).unwrap();
		let s = g.apply(Op::Sum { axes: None }, &[p]).unwrap();
		g.set_outputs(&[s]);

		let out = g.evaluate(&NdarrayBackend, &[Literal::vector(DType::F64, &[4.0, 9.0])]).unwrap();
		assert_approx_eq!(out[0].first().unwrap(), 5.0, 1e-12);
		// the rank-0 exponent is padded before it reaches the pow
		let text = g.to_string();
		assert!(text.contains("DimShuffle{x}(0.5)"));
		assert!(text.contains("Elemwise{pow}(x, v"));
	}
}

//--------------------------------------------------------------------------------------------------
