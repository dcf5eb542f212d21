//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::borrow::Cow;
use std::collections::VecDeque;
use std::rc::Rc;

use bit_set::BitSet;
use log::{debug, error, info, warn};
use smallvec::SmallVec;
use thin_vec::ThinVec;

use crate::backend::{NdarrayBackend, PerformError};
use crate::graph::{Client, Graph, NodeIndex, ValueIndex};
use crate::literal::LiteralError;
use crate::op::TypeError;
use crate::scalar::ScalarOp;
use crate::{ErrExtra, ErrPack, cold_path};

pub mod canonize;
pub mod distribute;
pub mod fusion;
pub mod inplace;
pub mod rules;

//--------------------------------------------------------------------------------------------------

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RewriteError {
	/// The node does not have the shape the rule expects. The rule does not apply.
	Precondition,

	/// The numeric backend failed while folding constants.
	Perform,
}

impl From<ErrPack<TypeError>> for ErrPack<RewriteError> {
	#[cold]
	#[inline(never)]
	fn from(err: ErrPack<TypeError>) -> Self {
		Self {
			code: RewriteError::Precondition,
			extra: Some(Box::new(ErrExtra {
				message: "replacement does not type check".into(),
				nested: Some(Box::new(err)),
			})),
		}
	}
}

impl From<ErrPack<PerformError>> for ErrPack<RewriteError> {
	#[cold]
	#[inline(never)]
	fn from(err: ErrPack<PerformError>) -> Self {
		Self {
			code: RewriteError::Perform,
			extra: Some(Box::new(ErrExtra { message: "".into(), nested: Some(Box::new(err)) })),
		}
	}
}

impl From<ErrPack<LiteralError>> for ErrPack<RewriteError> {
	#[cold]
	#[inline(never)]
	fn from(err: ErrPack<LiteralError>) -> Self {
		Self {
			code: RewriteError::Precondition,
			extra: Some(Box::new(ErrExtra {
				message: "constants do not combine".into(),
				nested: Some(Box::new(err)),
			})),
		}
	}
}

pub(crate) fn precondition<T>(message: &'static str) -> Result<T, ErrPack<RewriteError>> {
	cold_path();
	Err(ErrPack::with_message(RewriteError::Precondition, message))
}

/// Wraps `value` in `second(model, value)` for each model, so the result has the
/// broadcast pattern of all of them.
pub(crate) fn fill_chain(
	graph: &mut Graph,
	mut value: ValueIndex,
	models: &[ValueIndex],
) -> Result<ValueIndex, ErrPack<TypeError>> {
	for &model in models {
		value = graph.elemwise(ScalarOp::Second, &[model, value])?;
	}
	Ok(value)
}

/// New values for the outputs of a node, in output order.
pub type Replacement = SmallVec<[ValueIndex; 1]>;

/// Pattern-triggered rewrite of a single node.
///
/// A rule only builds detached nodes. The driver commits the returned replacement
/// through `Graph::replace_all_validate()`.
pub trait LocalRule {
	fn name(&self) -> &'static str;

	fn transform(
		&self,
		graph: &mut Graph,
		node: NodeIndex,
	) -> Result<Option<Replacement>, ErrPack<RewriteError>>;
}

/// Whole-graph optimization step.
pub trait GraphPass {
	fn name(&self) -> &str;

	/// Never fails. Problems are logged and recorded in the report.
	fn apply(&self, graph: &mut Graph) -> PassReport;
}

#[derive(Clone, Debug, Default)]
pub struct PassReport {
	pub name: Cow<'static, str>,
	pub rewrites: usize,
	pub rounds: usize,
	pub diagnostics: ThinVec<String>,
}

impl PassReport {
	pub fn new<S: Into<Cow<'static, str>>>(name: S) -> Self {
		Self { name: name.into(), ..Self::default() }
	}
}

//--------------------------------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct OptConfig {
	/// Register elemwise fusion in the `fast_run` profile.
	pub fusion: bool,

	/// Fused kernels whose estimated parameter size reaches this limit are rejected.
	pub kernel_arg_limit: usize,

	/// Cost of a division relative to a multiplication, used by the distributor.
	pub div_cost: f64,

	/// A factor is distributed only if it saves strictly more than this.
	pub distribute_min_score: f64,

	/// Upper bound on the rounds of a rewrite driver.
	pub max_rounds: usize,
}

impl Default for OptConfig {
	fn default() -> Self {
		Self {
			fusion: true,
			kernel_arg_limit: 200,
			div_cost: 1.5,
			distribute_min_score: 0.0,
			max_rounds: 64,
		}
	}
}

impl OptConfig {
	/// Defaults overridden by `X17OPT_FUSION` (`0` or `1`) and `X17OPT_MAX_ROUNDS`.
	pub fn from_env() -> Self {
		let mut config = Self::default();
		if let Ok(v) = std::env::var("X17OPT_FUSION") {
			match v.trim() {
				"0" | "false" => config.fusion = false,
				"1" | "true" => config.fusion = true,
				_ => warn!("X17OPT_FUSION: ignoring invalid value {v:?}"),
			}
		}
		if let Ok(v) = std::env::var("X17OPT_MAX_ROUNDS") {
			match v.trim().parse::<usize>() {
				Ok(n) if n > 0 => config.max_rounds = n,
				_ => warn!("X17OPT_MAX_ROUNDS: ignoring invalid value {v:?}"),
			}
		}
		config
	}
}

//--------------------------------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Order {
	InToOut,
	OutToIn,
}

/// Offers every node to a group of local rules and commits the first replacement
/// that validates.
///
/// Nodes are kept on a work-list. After a commit the new nodes and the consumers of
/// the replaced outputs are queued, so a round never restarts from scratch. With
/// `iterate` set, rounds repeat until one of them changes nothing.
pub struct TopoOptimizer {
	name: Cow<'static, str>,
	rules: Vec<Rc<dyn LocalRule>>,
	order: Order,
	iterate: bool,
	max_rounds: usize,
}

impl TopoOptimizer {
	pub fn new<S: Into<Cow<'static, str>>>(
		name: S,
		rules: Vec<Rc<dyn LocalRule>>,
		order: Order,
		max_rounds: usize,
	) -> Self {
		Self { name: name.into(), rules, order, iterate: true, max_rounds }
	}

	pub fn single_pass(mut self) -> Self {
		self.iterate = false;
		self
	}

	fn initial_queue(&self, graph: &Graph) -> VecDeque<NodeIndex> {
		let order = graph.topo_order();
		match self.order {
			Order::InToOut => order.into(),
			Order::OutToIn => order.into_iter().rev().collect(),
		}
	}

	/// Tries the rules on `node` until one commits. Returns the rule and the new values.
	fn process_node(
		&self,
		graph: &mut Graph,
		node: NodeIndex,
		report: &mut PassReport,
		broken: &mut BitSet,
	) -> Option<(&'static str, Replacement)> {
		for rule in &self.rules {
			let new_outputs = match rule.transform(graph, node) {
				Ok(Some(new_outputs)) => new_outputs,
				Ok(None) => continue,
				Err(err) if err.code == RewriteError::Precondition => {
					debug!("{}: {} does not apply to {node:?}: {err}", self.name, rule.name());
					continue;
				},
				Err(err) => {
					cold_path();
					error!("{}: {} failed on {node:?}: {err}", self.name, rule.name());
					report.diagnostics.push(format!("{}: {err}", rule.name()));
					broken.insert(node.raw);
					return None;
				},
			};
			let old_outputs = graph.outputs(node);
			if new_outputs.len() != old_outputs.len() {
				cold_path();
				debug!("{}: {} returned a wrong number of outputs", self.name, rule.name());
				continue;
			}
			let pairs: SmallVec<[(ValueIndex, ValueIndex); 1]> = old_outputs
				.iter()
				.copied()
				.zip(new_outputs.iter().copied())
				.filter(|(old, new)| old != new)
				.collect();
			if pairs.is_empty() {
				continue;
			}
			match graph.replace_all_validate(&pairs, rule.name()) {
				Ok(()) => return Some((rule.name(), new_outputs)),
				Err(err) => {
					debug!("{}: {} rejected on {node:?}: {err}", self.name, rule.name());
				},
			}
		}
		None
	}
}

impl GraphPass for TopoOptimizer {
	fn name(&self) -> &str {
		&self.name
	}

	fn apply(&self, graph: &mut Graph) -> PassReport {
		let mut report = PassReport::new(self.name.clone());
		let mut broken = BitSet::new();
		loop {
			report.rounds += 1;
			let mut changed = false;
			let mut queue = self.initial_queue(graph);
			let mut queued: BitSet = queue.iter().map(|n| n.raw).collect();
			let budget = self.max_rounds.saturating_mul(queue.len() + 1);
			let mut commits = 0;
			while let Some(node) = queue.pop_front() {
				queued.remove(node.raw);
				if !graph.is_attached(node) || broken.contains(node.raw) {
					continue;
				}
				let mark = graph.node_count();
				let Some((rule, new_outputs)) = self.process_node(graph, node, &mut report, &mut broken)
				else {
					continue;
				};
				debug!("{}: {rule} rewrote {node:?}", self.name);
				report.rewrites += 1;
				changed = true;
				commits += 1;
				if commits > budget {
					cold_path();
					warn!("{}: too many rewrites in round {}", self.name, report.rounds);
					report.diagnostics.push(format!("round {} exceeded its rewrite budget", report.rounds));
					return report;
				}

				// new nodes, then the consumers that now see the new values
				let mut candidates: Vec<NodeIndex> = (mark..graph.node_count()).map(NodeIndex::new).collect();
				candidates.push(node);
				for &v in &new_outputs {
					for client in graph.clients(v) {
						if let Client::Node { node: consumer, .. } = *client {
							candidates.push(consumer);
						}
					}
				}
				for n in candidates {
					if graph.is_attached(n) && queued.insert(n.raw) {
						queue.push_back(n);
					}
				}
			}
			if !changed || !self.iterate {
				break;
			}
			if report.rounds >= self.max_rounds {
				warn!("{}: no fixpoint after {} rounds", self.name, report.rounds);
				report.diagnostics.push(format!("stopped after {} rounds", report.rounds));
				break;
			}
		}
		report
	}
}

//--------------------------------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
	Canonicalize,
	Specialize,
}

struct RuleEntry {
	stage: Stage,
	tags: SmallVec<[&'static str; 2]>,
	rule: Rc<dyn LocalRule>,
}

/// Local rules grouped by stage, in registration order.
pub struct RuleDb {
	entries: Vec<RuleEntry>,
}

impl RuleDb {
	pub fn new() -> Self {
		Self { entries: Vec::new() }
	}

	pub fn register(&mut self, stage: Stage, rule: Rc<dyn LocalRule>, tags: &[&'static str]) {
		self.entries.push(RuleEntry { stage, tags: SmallVec::from_slice(tags), rule });
	}

	/// Rules of `stage` that carry none of the `exclude` tags.
	pub fn select(&self, stage: Stage, exclude: &[&str]) -> Vec<Rc<dyn LocalRule>> {
		self.entries
			.iter()
			.filter(|e| e.stage == stage && !e.tags.iter().any(|t| exclude.contains(t)))
			.map(|e| e.rule.clone())
			.collect()
	}

	pub fn standard(config: &OptConfig) -> Self {
		let mut db = Self::new();
		rules::register_structural(&mut db);
		db.register(Stage::Canonicalize, Rc::new(canonize::Canonizer::mul()), &["canonicalize"]);
		rules::register_algebraic(&mut db);
		db.register(Stage::Canonicalize, Rc::new(canonize::Canonizer::add()), &["canonicalize"]);
		db.register(
			Stage::Canonicalize,
			Rc::new(distribute::GreedyDistributor::new(config)),
			&["canonicalize"],
		);
		// folding runs last in both stages
		let folding: Rc<dyn LocalRule> = Rc::new(rules::ConstantFolding::new(NdarrayBackend));
		db.register(Stage::Canonicalize, folding.clone(), &[]);
		db.register(Stage::Specialize, folding, &[]);
		db
	}
}

//--------------------------------------------------------------------------------------------------

pub struct OptEntry {
	pub name: &'static str,
	pub priority: f64,
	pub tags: SmallVec<[&'static str; 4]>,
	pub pass: Rc<dyn GraphPass>,
}

/// Named passes with priorities and tags. Built once per optimization session.
pub struct OptDb {
	entries: Vec<OptEntry>,
}

impl OptDb {
	pub fn new() -> Self {
		Self { entries: Vec::new() }
	}

	pub fn register(&mut self, name: &'static str, priority: f64, tags: &[&'static str], pass: Rc<dyn GraphPass>) {
		self.entries.push(OptEntry { name, priority, tags: SmallVec::from_slice(tags), pass });
	}

	pub fn standard(config: &OptConfig) -> Self {
		let rules = RuleDb::standard(config);
		let mut db = Self::new();
		db.register(
			"canonicalize",
			1.0,
			&["fast_run", "fast_compile"],
			Rc::new(TopoOptimizer::new(
				"canonicalize",
				rules.select(Stage::Canonicalize, &[]),
				Order::InToOut,
				config.max_rounds,
			)),
		);
		db.register(
			"specialize",
			2.0,
			&["fast_run"],
			Rc::new(TopoOptimizer::new(
				"specialize",
				rules.select(Stage::Specialize, &[]),
				Order::InToOut,
				config.max_rounds,
			)),
		);
		let fusion_tags: &[&'static str] =
			if config.fusion { &["fast_run", "fusion"] } else { &["fusion"] };
		db.register("elemwise_fusion", 71.0, fusion_tags, Rc::new(fusion::FusionOptimizer::new(config)));
		db.register(
			"inplace_opt",
			75.0,
			&["fast_run", "inplace"],
			Rc::new(inplace::InplaceOptimizer::new()),
		);
		db
	}

	/// Entries carrying at least one `include` tag and no `exclude` tag, by priority.
	pub fn query(&self, include: &[&str], exclude: &[&str]) -> Vec<&OptEntry> {
		let mut selected: Vec<&OptEntry> = self
			.entries
			.iter()
			.filter(|e| e.tags.iter().any(|t| include.contains(t)))
			.filter(|e| !e.tags.iter().any(|t| exclude.contains(t)))
			.collect();
		selected.sort_by(|a, b| a.priority.total_cmp(&b.priority));
		selected
	}
}

/// Runs the passes selected by `include` / `exclude` in priority order.
pub fn optimize(graph: &mut Graph, db: &OptDb, include: &[&str], exclude: &[&str]) -> Vec<PassReport> {
	let mut reports = Vec::new();
	for entry in db.query(include, exclude) {
		let report = entry.pass.apply(graph);
		info!(
			"{}: {} rewrite(s) in {} round(s), {} diagnostic(s)",
			entry.name,
			report.rewrites,
			report.rounds,
			report.diagnostics.len()
		);
		reports.push(report);
	}
	reports
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;
	use crate::dtype::DType;
	use crate::literal::Literal;
	use crate::op::{Op, TensorType};
	use assert_approx_eq::assert_approx_eq;

	fn names(db: &OptDb, include: &[&str], exclude: &[&str]) -> Vec<&'static str> {
		db.query(include, exclude).iter().map(|e| e.name).collect()
	}

	struct CollapseNegNeg;

	impl LocalRule for CollapseNegNeg {
		fn name(&self) -> &'static str {
			"collapse_neg_neg"
		}

		fn transform(
			&self,
			graph: &mut Graph,
			node: NodeIndex,
		) -> Result<Option<Replacement>, ErrPack<RewriteError>> {
			if !graph.op(node).is_elemwise_of(&ScalarOp::Neg) {
				return Ok(None);
			}
			match graph.owner_op(graph.inputs(node)[0]) {
				Some((inner, op)) if op.is_elemwise_of(&ScalarOp::Neg) => {
					Ok(Some(Replacement::from_slice(&graph.inputs(inner)[..1])))
				},
				_ => Ok(None),
			}
		}
	}

	fn neg_chain(len: usize) -> (Graph, ValueIndex) {
		let mut g = Graph::new();
		let x = g.add_input(TensorType::new(DType::F64, &[false]), "x");
		let mut v = x;
		for _ in 0..len {
			v = g.elemwise(ScalarOp::Neg, &[v]).unwrap();
		}
		g.set_outputs(&[v]);
		(g, x)
	}

	#[test]
	fn test_driver_orders() {
		for order in [Order::InToOut, Order::OutToIn] {
			let (mut g, x) = neg_chain(4);
			let rules: Vec<Rc<dyn LocalRule>> = vec![Rc::new(CollapseNegNeg)];
			let report = TopoOptimizer::new("test", rules, order, 8).apply(&mut g);
			assert_eq!(report.rewrites, 2);
			assert_eq!(report.rounds, 2);
			assert_eq!(g.graph_outputs(), &[x]);
			assert_eq!(g.count_nodes(|_| true), 0);
		}
	}

	// Proposes a replacement of the wrong rank for every negation.
	struct SumOfNeg;

	impl LocalRule for SumOfNeg {
		fn name(&self) -> &'static str {
			"sum_of_neg"
		}

		fn transform(
			&self,
			graph: &mut Graph,
			node: NodeIndex,
		) -> Result<Option<Replacement>, ErrPack<RewriteError>> {
			if !graph.op(node).is_elemwise_of(&ScalarOp::Neg) {
				return Ok(None);
			}
			let input = graph.inputs(node)[0];
			let sum = graph.apply(Op::Sum { axes: None }, &[input])?;
			Ok(Some(Replacement::from_slice(&[sum])))
		}
	}

	#[test]
	fn test_driver_continues_after_rejected_replacement() {
		let (mut g, x) = neg_chain(3);
		let rules: Vec<Rc<dyn LocalRule>> = vec![Rc::new(SumOfNeg), Rc::new(CollapseNegNeg)];
		let report = TopoOptimizer::new("test", rules, Order::InToOut, 8).apply(&mut g);
		assert_eq!(report.rewrites, 1);
		assert!(report.diagnostics.is_empty());
		let (node, op) = g.owner_op(g.graph_outputs()[0]).unwrap();
		assert!(op.is_elemwise_of(&ScalarOp::Neg));
		assert_eq!(g.inputs(node), &[x]);

		// nothing but rejected proposals leaves the graph as it was
		let (mut g, _) = neg_chain(2);
		let before = g.structure();
		let rules: Vec<Rc<dyn LocalRule>> = vec![Rc::new(SumOfNeg)];
		let report = TopoOptimizer::new("test", rules, Order::OutToIn, 8).apply(&mut g);
		assert_eq!(report.rewrites, 0);
		assert_eq!(report.rounds, 1);
		assert!(report.diagnostics.is_empty());
		assert_eq!(g.structure(), before);
	}

	#[test]
	fn test_driver_single_pass() {
		let (mut g, x) = neg_chain(5);
		let rules: Vec<Rc<dyn LocalRule>> = vec![Rc::new(CollapseNegNeg)];
		let report = TopoOptimizer::new("test", rules, Order::InToOut, 8).single_pass().apply(&mut g);
		assert_eq!(report.rounds, 1);
		assert_eq!(report.rewrites, 2);
		let (node, _) = g.owner_op(g.graph_outputs()[0]).unwrap();
		assert_eq!(g.inputs(node), &[x]);
	}

	#[test]
	fn test_query_orders_by_priority() {
		let db = OptDb::standard(&OptConfig::default());
		assert_eq!(
			names(&db, &["fast_run"], &[]),
			["canonicalize", "specialize", "elemwise_fusion", "inplace_opt"]
		);
		assert_eq!(names(&db, &["fast_compile"], &[]), ["canonicalize"]);
		assert_eq!(names(&db, &["fast_run"], &["inplace"]), ["canonicalize", "specialize", "elemwise_fusion"]);
	}

	#[test]
	fn test_fusion_can_be_disabled() {
		let config = OptConfig { fusion: false, ..OptConfig::default() };
		let db = OptDb::standard(&config);
		assert_eq!(names(&db, &["fast_run"], &[]), ["canonicalize", "specialize", "inplace_opt"]);
		assert_eq!(names(&db, &["fusion"], &[]), ["elemwise_fusion"]);
	}

	#[test]
	fn test_rule_db_exclude() {
		let db = RuleDb::standard(&OptConfig::default());
		let canonicalize = db.select(Stage::Canonicalize, &[]);
		assert_eq!(canonicalize.last().map(|r| r.name()), Some("constant_folding"));
		let rest: Vec<&str> =
			db.select(Stage::Canonicalize, &["canonicalize"]).iter().map(|r| r.name()).collect();
		assert_eq!(rest, ["constant_folding"]);
		assert!(db.select(Stage::Specialize, &["shape_lift"]).iter().all(|r| r.name() != "local_shape_lift_elemwise"));
	}

	#[test]
	fn test_default_config() {
		let config = OptConfig::default();
		assert!(config.fusion);
		assert_eq!(config.kernel_arg_limit, 200);
		assert_approx_eq!(config.div_cost, 1.5);
		assert_approx_eq!(config.distribute_min_score, 0.0);
	}

	#[test]
	fn test_config_from_env() {
		// SAFETY: no other test reads or writes these variables
		unsafe {
			std::env::set_var("X17OPT_FUSION", "0");
			std::env::set_var("X17OPT_MAX_ROUNDS", "many");
		}
		let config = OptConfig::from_env();
		assert!(!config.fusion);
		assert_eq!(config.max_rounds, OptConfig::default().max_rounds);

		unsafe {
			std::env::set_var("X17OPT_FUSION", "yes");
			std::env::set_var("X17OPT_MAX_ROUNDS", "0");
		}
		let config = OptConfig::from_env();
		assert!(config.fusion);
		assert_eq!(config.max_rounds, OptConfig::default().max_rounds);

		unsafe {
			std::env::set_var("X17OPT_MAX_ROUNDS", " 5 ");
			std::env::remove_var("X17OPT_FUSION");
		}
		assert_eq!(OptConfig::from_env().max_rounds, 5);

		unsafe {
			std::env::remove_var("X17OPT_MAX_ROUNDS");
		}
	}

	#[test]
	fn test_fast_run_pipeline() {
		let mut g = Graph::new();
		let ty = TensorType::new(DType::F64, &[false]);
		let x = g.add_input(ty.clone(), "x");
		let y = g.add_input(ty.clone(), "y");
		let z = g.add_input(ty, "z");
		let xy = g.elemwise(ScalarOp::Mul, &[x, y]).unwrap();
		let q = g.elemwise(ScalarOp::TrueDiv, &[xy, x]).unwrap();
		let e = g.elemwise(ScalarOp::Exp, &[z]).unwrap();
		let s = g.elemwise(ScalarOp::Add, &[q, e]).unwrap();
		let r = g.elemwise(ScalarOp::Sqrt, &[s]).unwrap();
		g.set_outputs(&[r]);
		let inputs = [
			Literal::vector(DType::F64, &[2.0, -4.0, 0.5]),
			Literal::vector(DType::F64, &[1.0, 3.0, 0.25]),
			Literal::vector(DType::F64, &[0.0, -1.0, 2.0]),
		];
		let before = g.evaluate(&NdarrayBackend, &inputs).unwrap();

		let reports = optimize(&mut g, &OptDb::standard(&OptConfig::default()), &["fast_run"], &[]);
		let passes: Vec<&str> = reports.iter().map(|r| r.name.as_ref()).collect();
		assert_eq!(passes, ["canonicalize", "specialize", "elemwise_fusion", "inplace_opt"]);
		assert!(reports[0].rewrites >= 1);
		assert!(reports.iter().all(|r| r.diagnostics.is_empty()));

		assert_eq!(g.count_nodes(|op| op.is_elemwise_of(&ScalarOp::TrueDiv)), 0);
		assert_eq!(g.count_nodes(|op| matches!(op, Op::Elemwise(_))), 1);

		let after = g.evaluate(&NdarrayBackend, &inputs).unwrap();
		for (a, b) in before[0].data().iter().zip(after[0].data()) {
			assert_approx_eq!(a, b, 1e-12);
		}
	}
}

//--------------------------------------------------------------------------------------------------
