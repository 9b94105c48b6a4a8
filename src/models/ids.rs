//! Newtype wrappers for catalog identifiers.
//!
//! Category ids are comparable across sources (they are derived from the
//! category name), merchant ids are not: they are whatever the upstream
//! network assigned.

use serde::{Deserialize, Serialize};

/// Macro to define a newtype ID wrapping a `Copy` inner type.
macro_rules! define_copy_id {
    (
        $(#[$meta:meta])*
        $name:ident($inner:ty)
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name($inner);

        impl $name {
            /// Creates a new identifier from the given value.
            #[inline]
            #[must_use]
            pub const fn new(value: $inner) -> Self {
                Self(value)
            }

            /// Consumes the wrapper and returns the inner value.
            #[inline]
            #[must_use]
            pub const fn into_inner(self) -> $inner {
                self.0
            }
        }

        impl core::fmt::Display for $name {
            #[inline]
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<$inner> for $name {
            #[inline]
            fn from(value: $inner) -> Self {
                Self(value)
            }
        }
    };
}

/// Macro to define a newtype ID wrapping a `String` inner type.
macro_rules! define_string_id {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates a new identifier from the given string.
            #[inline]
            #[must_use]
            pub const fn new(value: String) -> Self {
                Self(value)
            }

            /// Returns a reference to the inner string.
            #[inline]
            #[must_use]
            pub fn as_inner(&self) -> &str {
                &self.0
            }
        }

        impl core::fmt::Display for $name {
            #[inline]
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<String> for $name {
            #[inline]
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

define_copy_id! {
    /// Category identifier in `1..=999_999`, derived from the category name.
    CategoryId(u32)
}

define_string_id! {
    /// Upstream merchant/program identifier. Only unique within one source.
    MerchantId
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_id_serializes_as_number() {
        let id = CategoryId::new(515_018);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "515018");
        let deserialized: CategoryId = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, id);
    }

    #[test]
    fn merchant_id_serializes_as_string() {
        let id = MerchantId::new("prog-42".to_owned());
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, r#""prog-42""#);
    }

    #[test]
    fn category_ids_order_numerically() {
        let mut ids = vec![CategoryId::new(30), CategoryId::new(2), CategoryId::new(100)];
        ids.sort();
        assert_eq!(ids, vec![CategoryId::new(2), CategoryId::new(30), CategoryId::new(100)]);
    }

    #[test]
    fn id_display_and_conversions() {
        let id: CategoryId = 7_u32.into();
        assert_eq!(id.to_string(), "7");
        assert_eq!(id.into_inner(), 7);

        let id: MerchantId = "m-1".to_owned().into();
        assert_eq!(id.as_inner(), "m-1");
        assert_eq!(id.to_string(), "m-1");
    }
}
