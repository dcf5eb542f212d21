//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use ndarray::{ArrayD, Axis, IxDyn, Slice};
use smallvec::SmallVec;

use crate::dtype::DType;
use crate::literal::{Literal, LiteralError, zip_map};
use crate::op::{DimEntry, DimShuffle, Op, SubtensorIndex};
use crate::{ErrExtra, ErrPack, cold_path};

//--------------------------------------------------------------------------------------------------

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum PerformError {
	TypeMismatch,
	CannotBroadcast,
	InvalidShape,
	IndexOutOfBounds,
}

impl From<ErrPack<LiteralError>> for ErrPack<PerformError> {
	#[cold]
	#[inline(never)]
	fn from(err: ErrPack<LiteralError>) -> Self {
		Self {
			code: PerformError::CannotBroadcast,
			extra: Some(Box::new(ErrExtra { message: "".into(), nested: Some(Box::new(err)) })),
		}
	}
}

/// Executes operators on literal inputs. Used by constant folding and by tests
/// comparing graphs before and after optimization.
pub trait Backend {
	fn perform(&self, op: &Op, inputs: &[&Literal]) -> Result<Vec<Literal>, ErrPack<PerformError>>;
}

//--------------------------------------------------------------------------------------------------

/// Reference backend on top of `ndarray`.
pub struct NdarrayBackend;

impl Backend for NdarrayBackend {
	fn perform(&self, op: &Op, inputs: &[&Literal]) -> Result<Vec<Literal>, ErrPack<PerformError>> {
		let out_dtype = out_dtype(op, inputs)?;

		let data = match op {
			Op::Elemwise(e) => {
				let arrays: SmallVec<[&ArrayD<f64>; 4]> = inputs.iter().map(|l| l.data()).collect();
				zip_map(&arrays, |args| e.scalar.eval(args))?
			},
			Op::DimShuffle(ds) => {
				let input = single(inputs)?;
				dimshuffle(ds, input.data())?
			},
			Op::Sum { axes } => {
				let input = single(inputs)?;
				match axes {
					None => ArrayD::from_elem(IxDyn(&[]), input.data().sum()),
					Some(axes) => {
						let mut axes: SmallVec<[usize; 4]> = axes.clone();
						axes.sort_unstable();
						axes.dedup();
						if axes.last().is_some_and(|&a| a >= input.ndim()) {
							cold_path();
							return Err(ErrPack::new(PerformError::InvalidShape));
						}
						let mut data = input.data().clone();
						for &axis in axes.iter().rev() {
							data = data.sum_axis(Axis(axis));
						}
						data
					},
				}
			},
			Op::Reshape { .. } => {
				let [input, shape] = inputs else {
					cold_path();
					return Err(ErrPack::new(PerformError::TypeMismatch));
				};
				let mut new_shape: SmallVec<[usize; 4]> = SmallVec::new();
				for &d in shape.data() {
					if d < 0.0 {
						cold_path();
						return Err(ErrPack::with_message(
							PerformError::InvalidShape,
							format!("negative dimension {d} in reshape"),
						));
					}
					#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
					new_shape.push(d as usize);
				}
				match input.data().clone().into_shape_with_order(IxDyn(&new_shape)) {
					Ok(data) => data,
					Err(_) => {
						cold_path();
						return Err(ErrPack::with_message(
							PerformError::InvalidShape,
							format!("cannot reshape {:?} into {new_shape:?}", input.shape()),
						));
					},
				}
			},
			Op::Shape => {
				let input = single(inputs)?;
				#[allow(clippy::cast_precision_loss)]
				let dims: Vec<f64> = input.shape().iter().map(|&d| d as f64).collect();
				ndarray::Array1::from_vec(dims).into_dyn()
			},
			Op::MakeVector { .. } => {
				let values: Vec<f64> = inputs.iter().map(|l| l.first().unwrap_or(0.0)).collect();
				ndarray::Array1::from_vec(values).into_dyn()
			},
			Op::Subtensor { index } => {
				let input = single(inputs)?;
				let len = input.shape().first().copied().unwrap_or(0);
				match *index {
					SubtensorIndex::Index(i) if i < len => {
						input.data().index_axis(Axis(0), i).to_owned()
					},
					SubtensorIndex::Slice(a, b) if a <= b && b <= len => {
						input.data().slice_axis(Axis(0), Slice::from(a..b)).to_owned()
					},
					_ => {
						cold_path();
						return Err(ErrPack::with_message(
							PerformError::IndexOutOfBounds,
							format!("{op} out of bounds for length {len}"),
						));
					},
				}
			},
		};
		Ok(vec![Literal::new(out_dtype, data)])
	}
}

// Static broadcast flags are not rechecked here. A runtime dimension of size 1
// is valid for a value whose type does not declare it broadcastable.
fn out_dtype(op: &Op, inputs: &[&Literal]) -> Result<DType, ErrPack<PerformError>> {
	let dtype = match op {
		Op::Elemwise(e) => {
			let dtypes: SmallVec<[DType; 4]> = inputs.iter().map(|l| l.dtype()).collect();
			e.scalar.out_dtype(&dtypes)
		},
		Op::DimShuffle(_) | Op::Sum { .. } | Op::Reshape { .. } | Op::Subtensor { .. } => {
			inputs.first().map(|l| l.dtype())
		},
		Op::Shape => Some(DType::I64),
		Op::MakeVector { dtype } => Some(*dtype),
	};
	let Some(dtype) = dtype else {
		cold_path();
		return Err(ErrPack::with_message(
			PerformError::TypeMismatch,
			format!("{op}: {} unsupported inputs", inputs.len()),
		));
	};
	Ok(dtype)
}

fn single<'a>(inputs: &[&'a Literal]) -> Result<&'a Literal, ErrPack<PerformError>> {
	match inputs {
		[input] => Ok(input),
		_ => {
			cold_path();
			Err(ErrPack::new(PerformError::TypeMismatch))
		},
	}
}

fn dimshuffle(ds: &DimShuffle, data: &ArrayD<f64>) -> Result<ArrayD<f64>, ErrPack<PerformError>> {
	let ndim = data.ndim();
	let kept: SmallVec<[usize; 4]> = ds
		.new_order
		.iter()
		.filter_map(|e| match e {
			DimEntry::Axis(i) => Some(*i),
			DimEntry::Broadcast => None,
		})
		.collect();
	if kept.iter().enumerate().any(|(n, &i)| i >= ndim || kept[..n].contains(&i)) {
		cold_path();
		return Err(ErrPack::new(PerformError::InvalidShape));
	}

	let mut view = data.view();
	for axis in (0..ndim).rev() {
		if !kept.contains(&axis) {
			if view.shape()[axis] != 1 {
				cold_path();
				return Err(ErrPack::new(PerformError::InvalidShape));
			}
			view.index_axis_inplace(Axis(axis), 0);
		}
	}

	// axis numbers after dropping
	let perm: SmallVec<[usize; 4]> =
		kept.iter().map(|&i| i - (0..i).filter(|a| !kept.contains(a)).count()).collect();
	let mut view = view.permuted_axes(IxDyn(&perm));
	for (pos, entry) in ds.new_order.iter().enumerate() {
		if *entry == DimEntry::Broadcast {
			view.insert_axis_inplace(Axis(pos));
		}
	}
	Ok(view.to_owned())
}

//--------------------------------------------------------------------------------------------------


//--------------------------------------------------------------------------------------------------
