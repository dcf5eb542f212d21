//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use ndarray::{ArrayD, ArrayViewD, IxDyn};
use smallvec::SmallVec;

use crate::dtype::DType;
use crate::{ErrPack, cold_path};

//--------------------------------------------------------------------------------------------------

pub const INLINE_DIMS: usize = 4;

pub type Broadcastable = SmallVec<[bool; INLINE_DIMS]>;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum LiteralError {
	ShapeMismatch,
	CannotBroadcast,
}

/// Constant tensor payload. Values are stored as `f64` and rounded to `dtype` on construction.
#[derive(Clone, Debug, PartialEq)]
pub struct Literal {
	dtype: DType,
	data: ArrayD<f64>,
}

impl Literal {
	pub fn new(dtype: DType, mut data: ArrayD<f64>) -> Self {
		if dtype != DType::F64 {
			data.mapv_inplace(|v| dtype.cast_value(v));
		}
		Self { dtype, data }
	}

	pub fn scalar(dtype: DType, value: f64) -> Self {
		Self::new(dtype, ArrayD::from_elem(IxDyn(&[]), value))
	}

	pub fn vector(dtype: DType, values: &[f64]) -> Self {
		Self::new(dtype, ndarray::Array1::from_vec(values.to_vec()).into_dyn())
	}

	pub fn from_shape_vec(
		dtype: DType,
		shape: &[usize],
		values: Vec<f64>,
	) -> Result<Self, ErrPack<LiteralError>> {
		let Ok(data) = ArrayD::from_shape_vec(IxDyn(shape), values) else {
			cold_path();
			return Err(ErrPack::with_message(
				LiteralError::ShapeMismatch,
				format!("element count does not match shape {shape:?}"),
			));
		};
		Ok(Self::new(dtype, data))
	}

	pub fn dtype(&self) -> DType {
		self.dtype
	}

	pub fn data(&self) -> &ArrayD<f64> {
		&self.data
	}

	pub fn into_data(self) -> ArrayD<f64> {
		self.data
	}

	pub fn shape(&self) -> &[usize] {
		self.data.shape()
	}

	pub fn ndim(&self) -> usize {
		self.data.ndim()
	}

	/// Dimensions of size 1 are broadcastable.
	pub fn broadcastable(&self) -> Broadcastable {
		self.data.shape().iter().map(|&d| d == 1).collect()
	}

	/// True if every element equals `value`. Vacuously true for empty literals.
	pub fn all_equal(&self, value: f64) -> bool {
		self.data.iter().all(|&v| v == value)
	}

	pub fn first(&self) -> Option<f64> {
		self.data.iter().next().copied()
	}

	pub fn cast(&self, dtype: DType) -> Self {
		Self::new(dtype, self.data.clone())
	}
}

//--------------------------------------------------------------------------------------------------

/// Numpy-style broadcast of right-aligned shapes.
pub fn broadcast_shapes(shapes: &[&[usize]]) -> Option<SmallVec<[usize; INLINE_DIMS]>> {
	let ndim = shapes.iter().map(|s| s.len()).max().unwrap_or(0);
	let mut result: SmallVec<[usize; INLINE_DIMS]> = SmallVec::from_elem(1, ndim);
	for shape in shapes {
		let skip = ndim - shape.len();
		for (i, &size) in shape.iter().enumerate() {
			let out = &mut result[skip + i];
			if *out == 1 {
				*out = size;
			} else if size != 1 && size != *out {
				cold_path();
				return None;
			}
		}
	}
	Some(result)
}

/// Applies `f` element by element over the broadcast of `inputs`.
pub fn zip_map(
	inputs: &[&ArrayD<f64>],
	mut f: impl FnMut(&[f64]) -> f64,
) -> Result<ArrayD<f64>, ErrPack<LiteralError>> {
	let shapes: SmallVec<[&[usize]; 4]> = inputs.iter().map(|a| a.shape()).collect();
	let Some(shape) = broadcast_shapes(&shapes) else {
		cold_path();
		return Err(ErrPack::with_message(
			LiteralError::CannotBroadcast,
			format!("cannot broadcast shapes {shapes:?}"),
		));
	};
	let mut views: SmallVec<[ArrayViewD<f64>; 4]> = SmallVec::with_capacity(inputs.len());
	for input in inputs {
		let Some(view) = input.broadcast(IxDyn(&shape)) else {
			cold_path();
			return Err(ErrPack::new(LiteralError::CannotBroadcast));
		};
		views.push(view);
	}
	let mut args: SmallVec<[f64; 4]> = SmallVec::with_capacity(inputs.len());
	Ok(ArrayD::from_shape_fn(IxDyn(&shape), |idx| {
		args.clear();
		args.extend(views.iter().map(|v| v[&idx]));
		f(&args)
	}))
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_broadcast_shapes() {
		assert_eq!(broadcast_shapes(&[&[2, 3], &[3]]).unwrap().as_slice(), &[2, 3]);
		assert_eq!(broadcast_shapes(&[&[2, 1], &[1, 4]]).unwrap().as_slice(), &[2, 4]);
		assert_eq!(broadcast_shapes(&[&[], &[5]]).unwrap().as_slice(), &[5]);
		assert!(broadcast_shapes(&[&[2], &[3]]).is_none());
	}

	#[test]
	fn test_zip_map() {
		let a = Literal::from_shape_vec(DType::F64, &[2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
		let b = Literal::scalar(DType::F64, 10.0);
		let out = zip_map(&[a.data(), b.data()], |x| x[0] * x[1]).unwrap();
		assert_eq!(out.shape(), &[2, 2]);
		assert_eq!(out.iter().copied().collect::<Vec<_>>(), vec![10.0, 20.0, 30.0, 40.0]);
	}

	#[test]
	fn test_int_literal_is_rounded() {
		let a = Literal::vector(DType::I32, &[1.5, -2.5]);
		assert_eq!(a.data().iter().copied().collect::<Vec<_>>(), vec![1.0, -2.0]);
		assert!(Literal::scalar(DType::F64, 1.0).all_equal(1.0));
		assert_eq!(a.broadcastable().as_slice(), &[false]);
	}
}

//--------------------------------------------------------------------------------------------------
