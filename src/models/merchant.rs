//! Merchant model.

use serde::{Deserialize, Serialize};

use super::{CategoryId, MerchantId, Source};

/// A merchant (affiliate program) listed in a catalog.
///
/// Merchants from different sources are matched on their normalized
/// [`clean_url`](Self::clean_url), never on `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Merchant {
    /// Upstream identifier, unique within `source` only.
    pub id: MerchantId,
    /// Name shown to users.
    pub display_name: String,
    /// Merchant home page without tracking parameters.
    pub clean_url: String,
    /// Tracking link that credits the affiliate.
    pub affiliate_url: String,
    /// Category the merchant is listed under.
    pub category_id: CategoryId,
    /// Upstream approval/activity status.
    pub status: String,
    /// Network the record came from.
    pub source: Source,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialize_merchant() {
        let json = r#"{
            "id": "1042",
            "displayName": "Zalando",
            "cleanUrl": "https://www.zalando.dk",
            "affiliateUrl": "https://track.example/c?pid=1&id=1042",
            "categoryId": 515018,
            "status": "approved",
            "source": "xml"
        }"#;
        let merchant: Merchant = serde_json::from_str(json).unwrap();
        assert_eq!(merchant.id, MerchantId::new("1042".to_owned()));
        assert_eq!(merchant.display_name, "Zalando");
        assert_eq!(merchant.category_id, CategoryId::new(515_018));
        assert_eq!(merchant.source, Source::Xml);
    }

    #[test]
    fn serialize_uses_camel_case_fields() {
        let merchant = Merchant {
            id: MerchantId::new("7".to_owned()),
            display_name: "H&M".to_owned(),
            clean_url: "https://hm.com".to_owned(),
            affiliate_url: "https://track.example/hm".to_owned(),
            category_id: CategoryId::new(1),
            status: "approved".to_owned(),
            source: Source::Json,
        };
        let json = serde_json::to_string(&merchant).unwrap();
        assert!(json.contains(r#""displayName":"H&M""#));
        assert!(json.contains(r#""cleanUrl":"https://hm.com""#));
        assert!(json.contains(r#""categoryId":1"#));
    }
}
