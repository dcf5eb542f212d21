//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::fmt;

use smallvec::{SmallVec, smallvec};

use crate::dtype::DType;
use crate::literal::{Broadcastable, INLINE_DIMS};
use crate::scalar::ScalarOp;
use crate::{ErrPack, cold_path};

//--------------------------------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TensorType {
	pub dtype: DType,

	/// One flag per dimension. `true` means the dimension is statically known to have size 1.
	pub broadcastable: Broadcastable,
}

impl TensorType {
	pub fn new(dtype: DType, broadcastable: &[bool]) -> Self {
		Self { dtype, broadcastable: SmallVec::from_slice(broadcastable) }
	}

	pub fn scalar(dtype: DType) -> Self {
		Self { dtype, broadcastable: SmallVec::new() }
	}

	pub fn ndim(&self) -> usize {
		self.broadcastable.len()
	}
}

impl fmt::Display for TensorType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let dims: Vec<&str> =
			self.broadcastable.iter().map(|&b| if b { "1" } else { "?" }).collect();
		write!(f, "{}[{}]", self.dtype, dims.join(","))
	}
}

/// Returns true if `b2` can be broadcast to `b1` (and not the other way around).
pub fn encompasses_broadcastable(b1: &[bool], b2: &[bool]) -> bool {
	if b1.len() < b2.len() {
		return false;
	}
	let b1 = &b1[b1.len() - b2.len()..];
	!b1.iter().zip(b2).any(|(&v1, &v2)| v1 && !v2)
}

//--------------------------------------------------------------------------------------------------

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TypeError {
	WrongArity,
	NDimMismatch,
	BroadcastMismatch,
	DTypeMismatch,
	InvalidAxis,
	InplaceType,
}

fn type_error<T>(code: TypeError, message: String) -> Result<T, ErrPack<TypeError>> {
	cold_path();
	Err(ErrPack::with_message(code, message))
}

//--------------------------------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DimEntry {
	Axis(usize),

	/// New dimension of size 1.
	Broadcast,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DimShuffle {
	pub input_broadcastable: Broadcastable,
	pub new_order: SmallVec<[DimEntry; INLINE_DIMS]>,
}

impl DimShuffle {
	pub fn new(input_broadcastable: &[bool], new_order: &[DimEntry]) -> Self {
		Self {
			input_broadcastable: SmallVec::from_slice(input_broadcastable),
			new_order: SmallVec::from_slice(new_order),
		}
	}

	/// Prepends `ndim - input_ndim` broadcastable dimensions.
	pub fn left_pad(input_broadcastable: &[bool], ndim: usize) -> Self {
		let input_ndim = input_broadcastable.len();
		let mut new_order: SmallVec<[DimEntry; INLINE_DIMS]> = SmallVec::new();
		new_order.extend((input_ndim..ndim).map(|_| DimEntry::Broadcast));
		new_order.extend((0..input_ndim).map(DimEntry::Axis));
		Self { input_broadcastable: SmallVec::from_slice(input_broadcastable), new_order }
	}

	/// True if the shuffle only prepends broadcastable dimensions.
	pub fn is_left_pad(&self) -> bool {
		let n = self.input_broadcastable.len();
		if self.new_order.len() < n {
			return false;
		}
		let k = self.new_order.len() - n;
		self.new_order[..k].iter().all(|&e| e == DimEntry::Broadcast)
			&& self.new_order[k..].iter().enumerate().all(|(i, &e)| e == DimEntry::Axis(i))
	}

	pub fn is_identity(&self) -> bool {
		self.new_order.len() == self.input_broadcastable.len() && self.is_left_pad()
	}

	fn out_broadcastable(&self) -> Result<Broadcastable, ErrPack<TypeError>> {
		let n = self.input_broadcastable.len();
		let mut used: SmallVec<[bool; INLINE_DIMS]> = smallvec![false; n];
		let mut out = Broadcastable::with_capacity(self.new_order.len());
		for &entry in &self.new_order {
			match entry {
				DimEntry::Broadcast => out.push(true),
				DimEntry::Axis(i) => {
					if i >= n || used[i] {
						return type_error(
							TypeError::InvalidAxis,
							format!("DimShuffle: invalid or repeated axis {i}"),
						);
					}
					used[i] = true;
					out.push(self.input_broadcastable[i]);
				},
			}
		}
		for i in 0..n {
			if !used[i] && !self.input_broadcastable[i] {
				return type_error(
					TypeError::InvalidAxis,
					format!("DimShuffle: cannot drop non-broadcastable axis {i}"),
				);
			}
		}
		Ok(out)
	}
}

//--------------------------------------------------------------------------------------------------

/// `(output, input)` pairs: the output overwrites the storage of the input.
pub type InplacePattern = SmallVec<[(usize, usize); 1]>;

#[derive(Clone, Debug, PartialEq)]
pub struct Elemwise {
	pub scalar: ScalarOp,
	pub inplace: InplacePattern,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubtensorIndex {
	Index(usize),
	Slice(usize, usize),
}

#[derive(Clone, Debug, PartialEq)]
pub enum Op {
	Elemwise(Elemwise),
	DimShuffle(DimShuffle),

	/// `None` reduces over every axis.
	Sum { axes: Option<SmallVec<[usize; INLINE_DIMS]>> },

	/// Inputs: tensor, integer shape vector.
	Reshape { ndim: usize },

	Shape,

	/// Packs scalars into a vector.
	MakeVector { dtype: DType },

	/// Constant indexing along the first axis.
	Subtensor { index: SubtensorIndex },
}

impl Op {
	pub fn elemwise(scalar: ScalarOp) -> Self {
		Self::Elemwise(Elemwise { scalar, inplace: SmallVec::new() })
	}

	pub fn as_elemwise(&self) -> Option<&Elemwise> {
		match self {
			Self::Elemwise(e) => Some(e),
			_ => None,
		}
	}

	/// Scalar operator if this is a pure (non-destructive) `Elemwise`.
	pub fn scalar_op(&self) -> Option<&ScalarOp> {
		match self {
			Self::Elemwise(e) if e.inplace.is_empty() => Some(&e.scalar),
			_ => None,
		}
	}

	pub fn is_elemwise_of(&self, scalar: &ScalarOp) -> bool {
		self.scalar_op() == Some(scalar)
	}

	/// `(output, input)` pairs of inputs overwritten by the operator.
	pub fn destroy_map(&self) -> &[(usize, usize)] {
		match self {
			Self::Elemwise(e) => &e.inplace,
			_ => &[],
		}
	}

	pub fn n_outputs(&self) -> usize {
		1
	}

	pub fn infer_types(
		&self,
		inputs: &[&TensorType],
	) -> Result<SmallVec<[TensorType; 1]>, ErrPack<TypeError>> {
		let out = match self {
			Self::Elemwise(e) => Self::elemwise_type(e, inputs)?,
			Self::DimShuffle(ds) => {
				let [input] = inputs else {
					return type_error(TypeError::WrongArity, "DimShuffle: expected 1 input".into());
				};
				if input.broadcastable != ds.input_broadcastable {
					return type_error(
						TypeError::BroadcastMismatch,
						format!("DimShuffle: input type {input} does not match the operator"),
					);
				}
				TensorType { dtype: input.dtype, broadcastable: ds.out_broadcastable()? }
			},
			Self::Sum { axes } => {
				let [input] = inputs else {
					return type_error(TypeError::WrongArity, "Sum: expected 1 input".into());
				};
				let mut broadcastable = Broadcastable::new();
				for (i, &b) in input.broadcastable.iter().enumerate() {
					if axes.as_ref().is_some_and(|axes| !axes.contains(&i)) {
						broadcastable.push(b);
					}
				}
				if let Some(axes) = axes
					&& axes.iter().any(|&a| a >= input.ndim())
				{
					return type_error(TypeError::InvalidAxis, format!("Sum: invalid axes {axes:?}"));
				}
				TensorType { dtype: input.dtype, broadcastable }
			},
			Self::Reshape { ndim } => {
				let [input, shape] = inputs else {
					return type_error(TypeError::WrongArity, "Reshape: expected 2 inputs".into());
				};
				if shape.ndim() != 1 || shape.dtype.is_float() {
					return type_error(
						TypeError::DTypeMismatch,
						format!("Reshape: shape must be an integer vector, got {shape}"),
					);
				}
				TensorType { dtype: input.dtype, broadcastable: smallvec![false; *ndim] }
			},
			Self::Shape => {
				let [_] = inputs else {
					return type_error(TypeError::WrongArity, "Shape: expected 1 input".into());
				};
				TensorType::new(DType::I64, &[false])
			},
			Self::MakeVector { dtype } => {
				if let Some(bad) = inputs.iter().find(|t| t.ndim() != 0) {
					return type_error(
						TypeError::NDimMismatch,
						format!("MakeVector: expected scalars, got {bad}"),
					);
				}
				TensorType::new(*dtype, &[false])
			},
			Self::Subtensor { index } => {
				let [input] = inputs else {
					return type_error(TypeError::WrongArity, "Subtensor: expected 1 input".into());
				};
				if input.ndim() == 0 {
					return type_error(TypeError::NDimMismatch, "Subtensor: cannot index a scalar".into());
				}
				let mut broadcastable = input.broadcastable.clone();
				match index {
					SubtensorIndex::Index(_) => {
						broadcastable.remove(0);
					},
					SubtensorIndex::Slice(..) => broadcastable[0] = false,
				}
				TensorType { dtype: input.dtype, broadcastable }
			},
		};
		Ok(smallvec![out])
	}

	fn elemwise_type(
		e: &Elemwise,
		inputs: &[&TensorType],
	) -> Result<TensorType, ErrPack<TypeError>> {
		if !e.scalar.arity().accepts(inputs.len()) {
			return type_error(
				TypeError::WrongArity,
				format!("Elemwise{{{}}}: {} inputs", e.scalar, inputs.len()),
			);
		}
		let ndim = inputs.first().map_or(0, |t| t.ndim());
		if inputs.iter().any(|t| t.ndim() != ndim) {
			return type_error(
				TypeError::NDimMismatch,
				format!("Elemwise{{{}}}: inputs have different ranks", e.scalar),
			);
		}
		let mut broadcastable: Broadcastable = smallvec![true; ndim];
		for t in inputs {
			for (out, &b) in broadcastable.iter_mut().zip(&t.broadcastable) {
				*out &= b;
			}
		}
		let dtypes: SmallVec<[DType; 4]> = inputs.iter().map(|t| t.dtype).collect();
		let Some(dtype) = e.scalar.out_dtype(&dtypes) else {
			return type_error(
				TypeError::DTypeMismatch,
				format!("Elemwise{{{}}}: unsupported input types", e.scalar),
			);
		};
		let out = TensorType { dtype, broadcastable };

		let mut seen: SmallVec<[usize; 2]> = SmallVec::new();
		for &(o, i) in &e.inplace {
			if o != 0 || seen.contains(&i) {
				return type_error(TypeError::InplaceType, format!("invalid inplace pattern {:?}", e.inplace));
			}
			seen.push(i);
			match inputs.get(i) {
				Some(&input) if *input == out => {},
				_ => {
					return type_error(
						TypeError::InplaceType,
						format!("Elemwise{{{}}}: output {out} cannot overwrite input {i}", e.scalar),
					);
				},
			}
		}
		Ok(out)
	}
}

impl fmt::Display for Op {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Elemwise(e) => {
				if e.inplace.is_empty() {
					write!(f, "Elemwise{{{}}}", e.scalar)
				} else {
					let pattern: Vec<String> =
						e.inplace.iter().map(|(o, i)| format!("{o}:{i}")).collect();
					write!(f, "Elemwise{{{},inplace{{{}}}}}", e.scalar, pattern.join(","))
				}
			},
			Self::DimShuffle(ds) => {
				let order: Vec<String> = ds
					.new_order
					.iter()
					.map(|e| match e {
						DimEntry::Axis(i) => i.to_string(),
						DimEntry::Broadcast => "x".to_string(),
					})
					.collect();
				write!(f, "DimShuffle{{{}}}", order.join(","))
			},
			Self::Sum { axes } => match axes {
				Some(axes) => write!(f, "Sum{{{axes:?}}}"),
				None => write!(f, "Sum"),
			},
			Self::Reshape { ndim } => write!(f, "Reshape{{{ndim}}}"),
			Self::Shape => write!(f, "Shape"),
			Self::MakeVector { dtype } => write!(f, "MakeVector{{{dtype}}}"),
			Self::Subtensor { index } => match index {
				SubtensorIndex::Index(i) => write!(f, "Subtensor{{{i}}}"),
				SubtensorIndex::Slice(a, b) => write!(f, "Subtensor{{{a}:{b}}}"),
			},
		}
	}
}

//--------------------------------------------------------------------------------------------------


//--------------------------------------------------------------------------------------------------
