//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::fmt;
use std::num::NonZeroU8;

use crate::cold_path;

//--------------------------------------------------------------------------------------------------

#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub struct DType {
	pub kind: DTypeKind,
	pub bits: NonZeroU8,
}

#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum DTypeKind {
	Float,
	Int,
	Uint,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct UnknownDTypeError;

#[allow(clippy::unwrap_used)]
impl DType {
	pub const F32: Self = Self { kind: DTypeKind::Float, bits: NonZeroU8::new(32).unwrap() };
	pub const F64: Self = Self { kind: DTypeKind::Float, bits: NonZeroU8::new(64).unwrap() };
	pub const I8: Self = Self { kind: DTypeKind::Int, bits: NonZeroU8::new(8).unwrap() };
	pub const I32: Self = Self { kind: DTypeKind::Int, bits: NonZeroU8::new(32).unwrap() };
	pub const I64: Self = Self { kind: DTypeKind::Int, bits: NonZeroU8::new(64).unwrap() };
	pub const U8: Self = Self { kind: DTypeKind::Uint, bits: NonZeroU8::new(8).unwrap() };
}

impl DType {
	pub fn is_float(&self) -> bool {
		self.kind == DTypeKind::Float
	}

	pub fn bits(&self) -> usize {
		usize::from(self.bits.get())
	}

	pub fn bytes(&self) -> usize {
		usize::from(self.bits.get()) / 8
	}

	/// Rounds `value` the way storing it into an element of this type would.
	#[allow(clippy::cast_possible_truncation)]
	pub fn cast_value(&self, value: f64) -> f64 {
		match self.kind {
			DTypeKind::Float => {
				if self.bits() <= 32 {
					f64::from(value as f32)
				} else {
					value
				}
			},
			DTypeKind::Int | DTypeKind::Uint => {
				if value.is_finite() {
					value.trunc()
				} else {
					cold_path();
					0.0
				}
			},
		}
	}
}

/// Smallest float type that represents every value of `dtype`.
pub fn to_float_dtype(dtype: DType) -> DType {
	match dtype.kind {
		DTypeKind::Float => dtype,
		DTypeKind::Int | DTypeKind::Uint => {
			if dtype.bits() <= 16 {
				DType::F32
			} else {
				DType::F64
			}
		},
	}
}

/// Result type of an arithmetic operation between `a` and `b`.
pub fn common_dtype(mut a: DType, mut b: DType) -> DType {
	if a.kind != b.kind {
		if a.is_float() || b.is_float() {
			a = to_float_dtype(a);
			b = to_float_dtype(b);
		} else {
			// signed / unsigned mix
			let bits = a.bits().max(b.bits());
			return if bits >= 32 { DType::I64 } else { DType::I32 };
		}
	}
	if a.bits >= b.bits { a } else { b }
}

impl fmt::Display for DType {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		let kind = match self.kind {
			DTypeKind::Float => "f",
			DTypeKind::Int => "i",
			DTypeKind::Uint => "u",
		};
		write!(f, "{}{}", kind, self.bits)
	}
}

impl std::str::FromStr for DType {
	type Err = UnknownDTypeError;

	fn from_str(s: &str) -> Result<Self, UnknownDTypeError> {
		match s {
			"f32" => Ok(Self::F32),
			"f64" => Ok(Self::F64),
			"i8" => Ok(Self::I8),
			"i32" => Ok(Self::I32),
			"i64" => Ok(Self::I64),
			"u8" => Ok(Self::U8),
			_ => {
				cold_path();
				Err(UnknownDTypeError)
			},
		}
	}
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_common_dtype() {
		assert_eq!(common_dtype(DType::F32, DType::F64), DType::F64);
		assert_eq!(common_dtype(DType::I8, DType::F32), DType::F32);
		assert_eq!(common_dtype(DType::I64, DType::F32), DType::F64);
		assert_eq!(common_dtype(DType::I8, DType::I32), DType::I32);
		assert_eq!(common_dtype(DType::U8, DType::I8), DType::I32);
	}

	#[test]
	fn test_cast_value() {
		assert_eq!(DType::I32.cast_value(2.7), 2.0);
		assert_eq!(DType::I32.cast_value(-2.7), -2.0);
		assert_eq!(DType::F64.cast_value(0.1), 0.1);
		assert_eq!("f32".parse::<DType>(), Ok(DType::F32));
		assert_eq!(DType::I64.to_string(), "i64");
	}
}

//--------------------------------------------------------------------------------------------------
