//! Shape-shaped options: one value per spatial dimension.
//!
//! Every convolution option that depends on the number of spatial dimensions
//! accepts either a single value, applied to every dimension, or one value
//! per dimension.

use nativenn_core::engine::ConvPadding;
use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// One extent per spatial dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Size<const D: usize>(pub [i64; D]);

impl<const D: usize> Size<D> {
    /// The same extent in every dimension.
    pub const fn uniform(value: i64) -> Self {
        Self([value; D])
    }

    /// Extents in dimension order.
    pub fn as_slice(&self) -> &[i64] {
        &self.0
    }

    /// Product of the extents.
    pub fn product(&self) -> i64 {
        self.0.iter().product()
    }

    pub(crate) fn all(&self, predicate: impl Fn(i64) -> bool) -> bool {
        self.0.iter().all(|&v| predicate(v))
    }
}

impl<const D: usize> From<i64> for Size<D> {
    fn from(value: i64) -> Self {
        Self::uniform(value)
    }
}

impl<const D: usize> From<[i64; D]> for Size<D> {
    fn from(values: [i64; D]) -> Self {
        Self(values)
    }
}

impl From<(i64, i64)> for Size<2> {
    fn from((a, b): (i64, i64)) -> Self {
        Self([a, b])
    }
}

impl From<(i64, i64, i64)> for Size<3> {
    fn from((a, b, c): (i64, i64, i64)) -> Self {
        Self([a, b, c])
    }
}

impl<const D: usize> fmt::Display for Size<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

#[cfg(feature = "serde")]
impl<const D: usize> Serialize for Size<D> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.0.iter())
    }
}

#[cfg(feature = "serde")]
impl<'de, const D: usize> Deserialize<'de> for Size<D> {
    fn deserialize<De: Deserializer<'de>>(deserializer: De) -> Result<Self, De::Error> {
        let values = Vec::<i64>::deserialize(deserializer)?;
        let len = values.len();
        <[i64; D]>::try_from(values).map(Self).map_err(|_| {
            serde::de::Error::invalid_length(len, &format!("{D} extents").as_str())
        })
    }
}

/// Convolution padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Padding<const D: usize> {
    /// Explicit amount per spatial dimension
    Explicit(Size<D>),
    /// No padding
    Valid,
    /// Keep the spatial shape; requires unit stride
    Same,
}

impl<const D: usize> Default for Padding<D> {
    fn default() -> Self {
        Self::Explicit(Size::uniform(0))
    }
}

impl<const D: usize> From<i64> for Padding<D> {
    fn from(value: i64) -> Self {
        Self::Explicit(Size::uniform(value))
    }
}

impl<const D: usize> From<[i64; D]> for Padding<D> {
    fn from(values: [i64; D]) -> Self {
        Self::Explicit(Size(values))
    }
}

impl<const D: usize> From<Size<D>> for Padding<D> {
    fn from(size: Size<D>) -> Self {
        Self::Explicit(size)
    }
}

impl<const D: usize> From<Padding<D>> for ConvPadding {
    fn from(padding: Padding<D>) -> Self {
        match padding {
            Padding::Explicit(size) => Self::Explicit(size.0.to_vec()),
            Padding::Valid => Self::Valid,
            Padding::Same => Self::Same,
        }
    }
}

impl<const D: usize> fmt::Display for Padding<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Explicit(size) => fmt::Display::fmt(size, f),
            Self::Valid => f.write_str("valid"),
            Self::Same => f.write_str("same"),
        }
    }
}
