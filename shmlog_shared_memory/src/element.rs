//! Element types storable in a shared buffer.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Numeric element type of a shared buffer, as recorded in its header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u32)]
pub enum ElementType {
    U8 = 1,
    I8 = 2,
    U16 = 3,
    I16 = 4,
    U32 = 5,
    I32 = 6,
    U64 = 7,
    I64 = 8,
    F32 = 9,
    F64 = 10,
}

impl ElementType {
    /// Every supported element type.
    pub const ALL: [ElementType; 10] = [
        Self::U8,
        Self::I8,
        Self::U16,
        Self::I16,
        Self::U32,
        Self::I32,
        Self::U64,
        Self::I64,
        Self::F32,
        Self::F64,
    ];

    /// Size of one element in bytes.
    #[inline]
    pub const fn size(self) -> usize {
        match self {
            Self::U8 | Self::I8 => 1,
            Self::U16 | Self::I16 => 2,
            Self::U32 | Self::I32 | Self::F32 => 4,
            Self::U64 | Self::I64 | Self::F64 => 8,
        }
    }

    /// Header code of this type.
    #[inline]
    pub const fn code(self) -> u32 {
        self as u32
    }

    /// Convert from a header code. Returns `None` for unknown codes.
    pub const fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::U8),
            2 => Some(Self::I8),
            3 => Some(Self::U16),
            4 => Some(Self::I16),
            5 => Some(Self::U32),
            6 => Some(Self::I32),
            7 => Some(Self::U64),
            8 => Some(Self::I64),
            9 => Some(Self::F32),
            10 => Some(Self::F64),
            _ => None,
        }
    }

    /// Lowercase type name, e.g. `f64`.
    pub const fn name(self) -> &'static str {
        match self {
            Self::U8 => "u8",
            Self::I8 => "i8",
            Self::U16 => "u16",
            Self::I16 => "i16",
            Self::U32 => "u32",
            Self::I32 => "i32",
            Self::U64 => "u64",
            Self::I64 => "i64",
            Self::F32 => "f32",
            Self::F64 => "f64",
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

mod sealed {
    pub trait Sealed {}
}

/// A Rust type that can live inside a shared buffer.
///
/// Implemented only for plain numeric primitives, for which every bit
/// pattern is a valid value. The trait is sealed.
pub trait Element:
    sealed::Sealed + Copy + Default + PartialEq + fmt::Debug + Send + Sync + 'static
{
    /// Header tag of this type.
    const TYPE: ElementType;
}

macro_rules! impl_element {
    ($($ty:ty => $tag:ident),* $(,)?) => {
        $(
            impl sealed::Sealed for $ty {}
            impl Element for $ty {
                const TYPE: ElementType = ElementType::$tag;
            }
        )*
    };
}

impl_element! {
    u8 => U8,
    i8 => I8,
    u16 => U16,
    i16 => I16,
    u32 => U32,
    i32 => I32,
    u64 => U64,
    i64 => I64,
    f32 => F32,
    f64 => F64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_roundtrip() {
        for ty in ElementType::ALL {
            assert_eq!(ElementType::from_code(ty.code()), Some(ty));
        }
        assert_eq!(ElementType::from_code(0), None);
        assert_eq!(ElementType::from_code(11), None);
    }

    #[test]
    fn test_sizes_match_rust_types() {
        assert_eq!(<u8 as Element>::TYPE.size(), size_of::<u8>());
        assert_eq!(<i16 as Element>::TYPE.size(), size_of::<i16>());
        assert_eq!(<f32 as Element>::TYPE.size(), size_of::<f32>());
        assert_eq!(<u64 as Element>::TYPE.size(), size_of::<u64>());
        assert_eq!(<f64 as Element>::TYPE.size(), size_of::<f64>());
    }

    #[test]
    fn test_serde_names_are_lowercase() {
        #[derive(Serialize, Deserialize)]
        struct Wrapper {
            ty: ElementType,
        }
        let text = toml::to_string(&Wrapper {
            ty: ElementType::F64,
        })
        .unwrap();
        assert!(text.contains("\"f64\""));
        let back: Wrapper = toml::from_str("ty = \"i16\"").unwrap();
        assert_eq!(back.ty, ElementType::I16);
    }
}
