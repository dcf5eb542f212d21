//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use x17opt::backend::NdarrayBackend;
use x17opt::dtype::DType;
use x17opt::literal::Literal;
use x17opt::op::{TensorType, TypeError};
use x17opt::scalar::ScalarOp;
use x17opt::{ErrPack, Graph, OptConfig, OptDb, optimize};

// (a/x + b/y) * x * y + exp(a * 1) * x / x
fn build_graph() -> Result<Graph, ErrPack<TypeError>> {
	let mut g = Graph::new();
	let ty = TensorType::new(DType::F64, &[false]);
	let a = g.add_input(ty.clone(), "a");
	let b = g.add_input(ty.clone(), "b");
	let x = g.add_input(ty.clone(), "x");
	let y = g.add_input(ty, "y");

	let ax = g.elemwise(ScalarOp::TrueDiv, &[a, x])?;
	let by = g.elemwise(ScalarOp::TrueDiv, &[b, y])?;
	let sum = g.elemwise(ScalarOp::Add, &[ax, by])?;
	let prod = g.elemwise(ScalarOp::Mul, &[sum, x, y])?;

	let one = g.add_constant(Literal::scalar(DType::F64, 1.0));
	let a1 = g.elemwise(ScalarOp::Mul, &[a, one])?;
	let e = g.elemwise(ScalarOp::Exp, &[a1])?;
	let ex = g.elemwise(ScalarOp::Mul, &[e, x])?;
	let exx = g.elemwise(ScalarOp::TrueDiv, &[ex, x])?;

	let out = g.elemwise(ScalarOp::Add, &[prod, exx])?;
	g.set_outputs(&[out]);
	Ok(g)
}

fn main() {
	let verbosity = std::env::var("X17OPT_VERBOSITY").ok().and_then(|v| v.parse::<usize>().ok());
	if let Err(err) = stderrlog::new().module("x17opt").verbosity(verbosity.unwrap_or(2)).init() {
		eprintln!("cannot initialize logging: {err}");
	}

	let mut graph = match build_graph() {
		Ok(graph) => graph,
		Err(err) => {
			log::error!("cannot build the demo graph: {err}");
			std::process::exit(1);
		},
	};
	println!("before:\n{graph}");

	let inputs = [
		Literal::vector(DType::F64, &[1.0, 2.0, 3.0]),
		Literal::vector(DType::F64, &[0.5, -1.0, 4.0]),
		Literal::vector(DType::F64, &[2.0, 0.25, -3.0]),
		Literal::vector(DType::F64, &[1.5, 8.0, 0.125]),
	];
	let before = graph.evaluate(&NdarrayBackend, &inputs);

	let db = OptDb::standard(&OptConfig::from_env());
	let reports = optimize(&mut graph, &db, &["fast_run"], &[]);
	println!("after:\n{graph}");
	for report in &reports {
		println!("{:>16}: {} rewrite(s), {} round(s)", report.name, report.rewrites, report.rounds);
		for diagnostic in &report.diagnostics {
			println!("{:>16}  {diagnostic}", "");
		}
	}

	match (before, graph.evaluate(&NdarrayBackend, &inputs)) {
		(Ok(before), Ok(after)) => {
			println!("before = {}", before[0].data());
			println!("after  = {}", after[0].data());
		},
		(Err(err), _) | (_, Err(err)) => log::error!("evaluation failed: {err}"),
	}
}
