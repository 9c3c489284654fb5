//! Property values, and their text form.

use std::fmt;

/// Type of a property's values.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ValueKind {
	Bool,
	Int,
	/// Integer which may exceed `i64`
	UInt,
	Float,
	Text,
	/// Link to another object, by identity
	Ref,
}

impl fmt::Display for ValueKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			Self::Bool => "bool",
			Self::Int => "integer",
			Self::UInt => "unsigned integer",
			Self::Float => "float",
			Self::Text => "text",
			Self::Ref => "object reference",
		};
		f.write_str(name)
	}
}

/// A single property value.
#[derive(Clone, Debug, PartialEq)]
pub enum PropertyValue {
	Bool(bool),
	Int(i64),
	UInt(u64),
	Float(f64),
	Text(String),
	/// Identity of target object, 0 for none
	Ref(u64),
}

impl PropertyValue {
	pub fn kind(&self) -> ValueKind {
		match self {
			Self::Bool(_) => ValueKind::Bool,
			Self::Int(_) => ValueKind::Int,
			Self::UInt(_) => ValueKind::UInt,
			Self::Float(_) => ValueKind::Float,
			Self::Text(_) => ValueKind::Text,
			Self::Ref(_) => ValueKind::Ref,
		}
	}

	/// Text form of value.
	pub fn to_text(&self) -> String {
		match self {
			Self::Bool(value) => value.to_string(),
			Self::Int(value) => value.to_string(),
			Self::UInt(value) => value.to_string(),
			// `{:?}` always includes a decimal point or exponent, and round-trips
			Self::Float(value) => format!("{value:?}"),
			Self::Text(value) => value.clone(),
			Self::Ref(id) => id.to_string(),
		}
	}

	/// Parse value of kind `kind` from its text form.
	pub fn parse(kind: ValueKind, text: &str) -> Result<Self, String> {
		let malformed = || format!("`{text}` is not a valid {kind}");
		match kind {
			ValueKind::Bool => match text {
				"true" | "1" => Ok(Self::Bool(true)),
				"false" | "0" => Ok(Self::Bool(false)),
				_ => Err(malformed()),
			},
			ValueKind::Int => text.trim().parse().map(Self::Int).map_err(|_| malformed()),
			ValueKind::UInt => text.trim().parse().map(Self::UInt).map_err(|_| malformed()),
			ValueKind::Float => text.trim().parse().map(Self::Float).map_err(|_| malformed()),
			ValueKind::Text => Ok(Self::Text(text.to_string())),
			ValueKind::Ref => text.trim().parse().map(Self::Ref).map_err(|_| malformed()),
		}
	}
}

impl fmt::Display for PropertyValue {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.to_text())
	}
}

/// Rust types which can be the value of a property.
pub trait PropertyType: Sized {
	const KIND: ValueKind;

	fn to_value(&self) -> PropertyValue;

	/// Convert from a value. `None` if value is of the wrong kind, or out of
	/// range for this type.
	fn from_value(value: PropertyValue) -> Option<Self>;
}

impl PropertyType for bool {
	const KIND: ValueKind = ValueKind::Bool;

	fn to_value(&self) -> PropertyValue {
		PropertyValue::Bool(*self)
	}

	fn from_value(value: PropertyValue) -> Option<Self> {
		match value {
			PropertyValue::Bool(value) => Some(value),
			_ => None,
		}
	}
}

macro_rules! impl_int {
	($kind:ident, $variant:ident, $wide:ty: $($ty:ty),*) => {
		$(
			impl PropertyType for $ty {
				const KIND: ValueKind = ValueKind::$kind;

				fn to_value(&self) -> PropertyValue {
					PropertyValue::$variant(*self as $wide)
				}

				fn from_value(value: PropertyValue) -> Option<Self> {
					match value {
						PropertyValue::Int(value) => <$ty>::try_from(value).ok(),
						PropertyValue::UInt(value) => <$ty>::try_from(value).ok(),
						_ => None,
					}
				}
			}
		)*
	};
}

impl_int!(Int, Int, i64: i8, i16, i32, i64, u8, u16, u32);
impl_int!(UInt, UInt, u64: u64, usize);

macro_rules! impl_float {
	($($ty:ty),*) => {
		$(
			impl PropertyType for $ty {
				const KIND: ValueKind = ValueKind::Float;

				fn to_value(&self) -> PropertyValue {
					PropertyValue::Float(*self as f64)
				}

				fn from_value(value: PropertyValue) -> Option<Self> {
					match value {
						PropertyValue::Float(value) => Some(value as $ty),
						_ => None,
					}
				}
			}
		)*
	};
}

impl_float!(f32, f64);

impl PropertyType for String {
	const KIND: ValueKind = ValueKind::Text;

	fn to_value(&self) -> PropertyValue {
		PropertyValue::Text(self.clone())
	}

	fn from_value(value: PropertyValue) -> Option<Self> {
		match value {
			PropertyValue::Text(value) => Some(value),
			_ => None,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parse_values() {
		assert_eq!(PropertyValue::parse(ValueKind::Bool, "true"), Ok(PropertyValue::Bool(true)));
		assert_eq!(PropertyValue::parse(ValueKind::Int, "-12"), Ok(PropertyValue::Int(-12)));
		assert_eq!(PropertyValue::parse(ValueKind::Float, "2.5"), Ok(PropertyValue::Float(2.5)));
		assert_eq!(PropertyValue::parse(ValueKind::Ref, "7"), Ok(PropertyValue::Ref(7)));
		assert!(PropertyValue::parse(ValueKind::Int, "1.5").is_err());
		assert!(PropertyValue::parse(ValueKind::Bool, "yes").is_err());
	}

	#[test]
	fn float_text_round_trips() {
		for value in [0.1f64, -3.0, 1e-300, f64::MAX] {
			let text = PropertyValue::Float(value).to_text();
			assert_eq!(PropertyValue::parse(ValueKind::Float, &text), Ok(PropertyValue::Float(value)));
		}
	}

	#[test]
	fn int_range_checked() {
		assert_eq!(u8::from_value(PropertyValue::Int(255)), Some(255));
		assert_eq!(u8::from_value(PropertyValue::Int(256)), None);
		assert_eq!(i32::from_value(PropertyValue::Float(1.0)), None);
	}

	#[test]
	fn full_range_u64() {
		assert_eq!(u64::KIND, ValueKind::UInt);
		assert_eq!(u64::MAX.to_value().to_text(), "18446744073709551615");
		let parsed = PropertyValue::parse(ValueKind::UInt, "18446744073709551615").unwrap();
		assert_eq!(u64::from_value(parsed), Some(u64::MAX));
		assert!(PropertyValue::parse(ValueKind::UInt, "-1").is_err());

		assert_eq!(u64::from_value(PropertyValue::Int(5)), Some(5));
		assert_eq!(u64::from_value(PropertyValue::Int(-5)), None);
		assert_eq!(i64::from_value(PropertyValue::UInt(u64::MAX)), None);
		assert_eq!(u32::from_value(PropertyValue::UInt(7)), Some(7));
	}
}
