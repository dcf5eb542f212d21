//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::borrow::Cow;
use std::fmt;
use std::rc::Rc;

use smallvec::SmallVec;

use crate::cold_path;
use crate::dtype::{DType, common_dtype, to_float_dtype};

//--------------------------------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Arity {
	Exact(usize),

	/// One or more arguments.
	Variadic,
}

impl Arity {
	pub fn accepts(self, n: usize) -> bool {
		match self {
			Self::Exact(e) => e == n,
			Self::Variadic => n >= 1,
		}
	}
}

/// Per-element operator. `Elemwise` lifts these to tensors.
#[derive(Clone, Debug, PartialEq)]
pub enum ScalarOp {
	Add,
	Sub,
	Mul,
	TrueDiv,
	Neg,
	Inv,
	Pow,
	Sqr,
	Sqrt,
	Exp,
	Log,
	Log1p,

	/// Plain copy.
	Identity,
	Cast(DType),

	/// `second(a, b)` returns `b`. Used to broadcast `b` to the shape of `a` (a "fill").
	Second,

	Composite(Rc<Composite>),
	Opaque(Rc<OpaqueScalarOp>),
}

/// Scalar operator provided from outside with an evaluation function but no kernel text.
pub struct OpaqueScalarOp {
	pub name: Cow<'static, str>,
	pub arity: usize,
	pub eval: fn(&[f64]) -> f64,
}

impl fmt::Debug for OpaqueScalarOp {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "Opaque({}/{})", self.name, self.arity)
	}
}

impl PartialEq for OpaqueScalarOp {
	fn eq(&self, other: &Self) -> bool {
		self.name == other.name && self.arity == other.arity
	}
}

impl ScalarOp {
	pub fn arity(&self) -> Arity {
		match self {
			Self::Add | Self::Mul => Arity::Variadic,
			Self::Sub | Self::TrueDiv | Self::Pow | Self::Second => Arity::Exact(2),
			Self::Neg
			| Self::Inv
			| Self::Sqr
			| Self::Sqrt
			| Self::Exp
			| Self::Log
			| Self::Log1p
			| Self::Identity
			| Self::Cast(_) => Arity::Exact(1),
			Self::Composite(c) => Arity::Exact(c.n_inputs),
			Self::Opaque(o) => Arity::Exact(o.arity),
		}
	}

	pub fn name(&self) -> Cow<'static, str> {
		match self {
			Self::Add => "add".into(),
			Self::Sub => "sub".into(),
			Self::Mul => "mul".into(),
			Self::TrueDiv => "true_div".into(),
			Self::Neg => "neg".into(),
			Self::Inv => "inv".into(),
			Self::Pow => "pow".into(),
			Self::Sqr => "sqr".into(),
			Self::Sqrt => "sqrt".into(),
			Self::Exp => "exp".into(),
			Self::Log => "log".into(),
			Self::Log1p => "log1p".into(),
			Self::Identity => "identity".into(),
			Self::Cast(dtype) => format!("cast{{{dtype}}}").into(),
			Self::Second => "second".into(),
			Self::Composite(c) => format!("composite{{{}}}", c.instrs.len()).into(),
			Self::Opaque(o) => o.name.clone(),
		}
	}

	/// Returns `None` if the argument count does not fit the operator.
	pub fn out_dtype(&self, inputs: &[DType]) -> Option<DType> {
		if !self.arity().accepts(inputs.len()) {
			cold_path();
			return None;
		}
		let common = || inputs.iter().copied().reduce(common_dtype);
		match self {
			Self::Add
			| Self::Sub
			| Self::Mul
			| Self::Neg
			| Self::Pow
			| Self::Sqr
			| Self::Identity
			| Self::Opaque(_) => common(),
			Self::TrueDiv | Self::Inv | Self::Sqrt | Self::Exp | Self::Log | Self::Log1p => {
				common().map(to_float_dtype)
			},
			Self::Cast(dtype) => Some(*dtype),
			Self::Second => inputs.get(1).copied(),
			Self::Composite(c) => c.out_dtype(inputs),
		}
	}

	pub fn eval(&self, args: &[f64]) -> f64 {
		match self {
			Self::Add => args.iter().sum(),
			Self::Sub => args[0] - args[1],
			Self::Mul => args.iter().product(),
			Self::TrueDiv => args[0] / args[1],
			Self::Neg => -args[0],
			Self::Inv => 1.0 / args[0],
			Self::Pow => args[0].powf(args[1]),
			Self::Sqr => args[0] * args[0],
			Self::Sqrt => args[0].sqrt(),
			Self::Exp => args[0].exp(),
			Self::Log => args[0].ln(),
			Self::Log1p => args[0].ln_1p(),
			Self::Identity => args[0],
			Self::Cast(dtype) => dtype.cast_value(args[0]),
			Self::Second => args[1],
			Self::Composite(c) => c.eval(args),
			Self::Opaque(o) => (o.eval)(args),
		}
	}

	/// Text of the per-element kernel expression, or `None` if the operator
	/// has no low-level implementation.
	pub fn c_code(&self, args: &[String]) -> Option<String> {
		if !self.arity().accepts(args.len()) {
			cold_path();
			return None;
		}
		let a = args.first()?;
		let code = match self {
			Self::Add => format!("({})", args.join(" + ")),
			Self::Mul => format!("({})", args.join(" * ")),
			Self::Sub => format!("({a} - {})", args.get(1)?),
			Self::TrueDiv => format!("({a} / {})", args.get(1)?),
			Self::Neg => format!("(-{a})"),
			Self::Inv => format!("(1.0 / {a})"),
			Self::Pow => format!("pow({a}, {})", args.get(1)?),
			Self::Sqr => format!("({a} * {a})"),
			Self::Sqrt => format!("sqrt({a})"),
			Self::Exp => format!("exp({a})"),
			Self::Log => format!("log({a})"),
			Self::Log1p => format!("log1p({a})"),
			Self::Identity => a.clone(),
			Self::Cast(dtype) => format!("(({dtype}) {a})"),
			Self::Second => args.get(1)?.clone(),
			Self::Composite(c) => return c.c_code(args),
			Self::Opaque(_) => return None,
		};
		Some(code)
	}

	pub fn has_c_code(&self) -> bool {
		let Arity::Exact(n) = self.arity() else {
			return true;
		};
		let args: Vec<String> = (0..n).map(|i| format!("x{i}")).collect();
		self.c_code(&args).is_some()
	}
}

impl fmt::Display for ScalarOp {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.name())
	}
}

//--------------------------------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScalarArg {
	Input(usize),
	Instr(usize),
}

#[derive(Clone, Debug, PartialEq)]
pub struct ScalarInstr {
	pub op: ScalarOp,
	pub args: SmallVec<[ScalarArg; 2]>,
}

/// Straight-line scalar program. The result is the value of the last instruction.
///
/// Instructions never contain another `Composite`; nested composites are inlined
/// by `CompositeBuilder`.
#[derive(Clone, Debug, PartialEq)]
pub struct Composite {
	n_inputs: usize,
	instrs: Vec<ScalarInstr>,
}

impl Composite {
	pub fn n_inputs(&self) -> usize {
		self.n_inputs
	}

	pub fn instrs(&self) -> &[ScalarInstr] {
		&self.instrs
	}

	fn out_dtype(&self, inputs: &[DType]) -> Option<DType> {
		let mut dtypes: Vec<DType> = Vec::with_capacity(self.instrs.len());
		let mut args: SmallVec<[DType; 4]> = SmallVec::new();
		for instr in &self.instrs {
			args.clear();
			for &arg in &instr.args {
				args.push(match arg {
					ScalarArg::Input(i) => *inputs.get(i)?,
					ScalarArg::Instr(i) => dtypes[i],
				});
			}
			dtypes.push(instr.op.out_dtype(&args)?);
		}
		dtypes.last().copied()
	}

	fn eval(&self, inputs: &[f64]) -> f64 {
		let mut values: SmallVec<[f64; 8]> = SmallVec::with_capacity(self.instrs.len());
		let mut args: SmallVec<[f64; 4]> = SmallVec::new();
		for instr in &self.instrs {
			args.clear();
			args.extend(instr.args.iter().map(|&arg| match arg {
				ScalarArg::Input(i) => inputs[i],
				ScalarArg::Instr(i) => values[i],
			}));
			values.push(instr.op.eval(&args));
		}
		values.last().copied().unwrap_or(f64::NAN)
	}

	fn c_code(&self, inputs: &[String]) -> Option<String> {
		let mut code: Vec<String> = Vec::with_capacity(self.instrs.len());
		for instr in &self.instrs {
			let mut args: Vec<String> = Vec::with_capacity(instr.args.len());
			for &arg in &instr.args {
				args.push(match arg {
					ScalarArg::Input(i) => inputs.get(i)?.clone(),
					ScalarArg::Instr(i) => code.get(i)?.clone(),
				});
			}
			code.push(instr.op.c_code(&args)?);
		}
		code.pop()
	}
}

pub struct CompositeBuilder {
	n_inputs: usize,
	instrs: Vec<ScalarInstr>,
}

impl CompositeBuilder {
	pub fn new() -> Self {
		Self { n_inputs: 0, instrs: Vec::new() }
	}

	pub fn input(&mut self) -> ScalarArg {
		let arg = ScalarArg::Input(self.n_inputs);
		self.n_inputs += 1;
		arg
	}

	pub fn apply(&mut self, op: &ScalarOp, args: &[ScalarArg]) -> ScalarArg {
		if let ScalarOp::Composite(inner) = op {
			let base = self.instrs.len();
			for instr in &inner.instrs {
				let args = instr
					.args
					.iter()
					.map(|&a| match a {
						ScalarArg::Input(i) => args.get(i).copied().unwrap_or(ScalarArg::Input(i)),
						ScalarArg::Instr(i) => ScalarArg::Instr(base + i),
					})
					.collect();
				self.instrs.push(ScalarInstr { op: instr.op.clone(), args });
			}
			return ScalarArg::Instr(self.instrs.len() - 1);
		}
		self.instrs.push(ScalarInstr { op: op.clone(), args: args.iter().copied().collect() });
		ScalarArg::Instr(self.instrs.len() - 1)
	}

	pub fn finish(mut self, out: ScalarArg) -> Composite {
		match out {
			ScalarArg::Instr(i) if i + 1 == self.instrs.len() => {},
			_ => {
				self.instrs.push(ScalarInstr {
					op: ScalarOp::Identity,
					args: SmallVec::from_slice(&[out]),
				});
			},
		}
		Composite { n_inputs: self.n_inputs, instrs: self.instrs }
	}
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;
	use assert_approx_eq::assert_approx_eq;

	fn square_plus_one() -> ScalarOp {
		let mut b = CompositeBuilder::new();
		let x = b.input();
		let sq = b.apply(&ScalarOp::Sqr, &[x]);
		let one = b.input();
		let out = b.apply(&ScalarOp::Add, &[sq, one]);
		ScalarOp::Composite(Rc::new(b.finish(out)))
	}

	#[test]
	fn test_eval_and_dtype() {
		assert_eq!(ScalarOp::Add.eval(&[1.0, 2.0, 3.0]), 6.0);
		assert_eq!(ScalarOp::Second.eval(&[1.0, 2.0]), 2.0);
		assert_approx_eq!(ScalarOp::Log1p.eval(&[1.0]), 2.0_f64.ln(), 1e-12);
		assert_eq!(ScalarOp::TrueDiv.out_dtype(&[DType::I32, DType::I32]), Some(DType::F64));
		assert_eq!(ScalarOp::Mul.out_dtype(&[DType::F32, DType::F32]), Some(DType::F32));
		assert_eq!(ScalarOp::Sub.out_dtype(&[DType::F32]), None);
	}

	#[test]
	fn test_composite_inlining() {
		let inner = square_plus_one();
		let mut b = CompositeBuilder::new();
		let a = b.input();
		let c = b.input();
		let e = b.apply(&ScalarOp::Exp, &[a]);
		let out = b.apply(&inner, &[e, c]);
		let composite = b.finish(out);

		// nested composites are flattened
		assert!(composite.instrs().iter().all(|i| !matches!(i.op, ScalarOp::Composite(_))));
		assert_eq!(composite.n_inputs(), 2);

		let op = ScalarOp::Composite(Rc::new(composite));
		assert_approx_eq!(op.eval(&[0.5, 2.0]), 0.5_f64.exp().powi(2) + 2.0, 1e-12);
		assert_eq!(op.c_code(&["a".into(), "b".into()]).unwrap(), "((exp(a) * exp(a)) + b)");
		assert_eq!(op.out_dtype(&[DType::F32, DType::F32]), Some(DType::F32));
	}

	#[test]
	fn test_opaque_has_no_code() {
		let op = ScalarOp::Opaque(Rc::new(OpaqueScalarOp {
			name: "erfish".into(),
			arity: 1,
			eval: |x| x[0].tanh(),
		}));
		assert!(!op.has_c_code());
		assert!(ScalarOp::Pow.has_c_code());

		let mut b = CompositeBuilder::new();
		let x = b.input();
		let y = b.apply(&op, &[x]);
		let z = b.apply(&ScalarOp::Neg, &[y]);
		let composite = ScalarOp::Composite(Rc::new(b.finish(z)));
		assert!(!composite.has_c_code());
		assert_approx_eq!(composite.eval(&[0.3]), -(0.3_f64.tanh()), 1e-12);
	}
}

//--------------------------------------------------------------------------------------------------
