//! Category model and name-derived category identity.
//!
//! Both source fetchers hash the category name the same way, so a
//! category called "Mode" on one network and " mode " on the other end
//! up with the same [`CategoryId`] without any shared lookup table.

use serde::{Deserialize, Serialize};

use super::{CategoryId, Merchant};

/// Initial DJB2 hash value.
const DJB2_SEED: i32 = 5381;

/// Category ids are reduced into `0..ID_MODULUS`.
const ID_MODULUS: u32 = 1_000_000;

/// Category used for records whose upstream category is missing.
pub const FALLBACK_CATEGORY: &str = "Diverse";

/// A named group of merchants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    /// Identifier derived from `name` via [`generate_category_id`].
    pub id: CategoryId,
    /// Display name.
    pub name: String,
    /// Merchants in insertion order.
    pub merchants: Vec<Merchant>,
}

/// Normalizes a category name for hashing and matching: trimmed and
/// lower-cased.
#[inline]
#[must_use]
pub fn normalize_category_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Derives the category id for `name`.
///
/// DJB2 over the UTF-16 code units of the normalized name with 32-bit
/// wrapping arithmetic, then `abs(hash) % 1_000_000`. Zero is mapped to 1
/// so the id is always in `1..=999_999`.
#[must_use]
#[inline]
pub fn generate_category_id(name: &str) -> CategoryId {
    let normalized = normalize_category_name(name);
    let hash = normalized.encode_utf16().fold(DJB2_SEED, |hash, unit| {
        hash.wrapping_mul(33).wrapping_add(i32::from(unit))
    });
    let reduced = hash.unsigned_abs() % ID_MODULUS;
    CategoryId::new(if reduced == 0 { 1 } else { reduced })
}

/// Returns `name` unless it is missing or blank, in which case the
/// fallback category is used.
#[inline]
#[must_use]
pub fn category_name_or_fallback(name: Option<&str>) -> &str {
    match name.map(str::trim) {
        Some(trimmed) if !trimmed.is_empty() => trimmed,
        _ => FALLBACK_CATEGORY,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_ids_are_stable() {
        assert_eq!(generate_category_id("Mode"), CategoryId::new(515_018));
        assert_eq!(generate_category_id("Elektronik"), CategoryId::new(613_757));
        assert_eq!(generate_category_id(FALLBACK_CATEGORY), CategoryId::new(612_663));
    }

    #[test]
    fn id_ignores_case_and_surrounding_whitespace() {
        let reference = generate_category_id("mode");
        for variant in ["Mode", "  MODE ", "\tmode\n", "mOdE"] {
            assert_eq!(generate_category_id(variant), reference, "{variant:?}");
        }
    }

    #[test]
    fn id_equals_id_of_normalized_name() {
        for name in ["Rejser & Oplevelser", " Sko", "Børn og baby", "Hus/Have"] {
            assert_eq!(
                generate_category_id(name),
                generate_category_id(&normalize_category_name(name))
            );
        }
    }

    #[test]
    fn ids_stay_in_range() {
        let long_name = "x".repeat(500);
        let names = [
            "",
            "a",
            "Mode",
            "Elektronik",
            "Bøger",
            long_name.as_str(),
            "Sport & Fritid",
            "Helse og skønhed",
            "日本語",
        ];
        for name in names {
            let id = generate_category_id(name).into_inner();
            assert!((1..=999_999).contains(&id), "{name:?} -> {id}");
        }
    }

    #[test]
    fn different_names_usually_differ() {
        assert_ne!(generate_category_id("Mode"), generate_category_id("Sko"));
    }

    #[test]
    fn fallback_applies_to_missing_and_blank_names() {
        assert_eq!(category_name_or_fallback(None), FALLBACK_CATEGORY);
        assert_eq!(category_name_or_fallback(Some("   ")), FALLBACK_CATEGORY);
        assert_eq!(category_name_or_fallback(Some(" Mode ")), "Mode");
    }
}
