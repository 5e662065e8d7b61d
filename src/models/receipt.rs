use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::models::subscription::Tier;

enum ExpiryField {
    Millis(&'static str),
    Timestamp(&'static str),
}

/// Provider payload fields that may carry an entitlement expiry, highest priority first.
const EXPIRY_FIELDS: [ExpiryField; 6] = [
    ExpiryField::Millis("expiryTimeMillis"),
    ExpiryField::Millis("expiresDateMs"),
    ExpiryField::Millis("expires_date_ms"),
    ExpiryField::Timestamp("expiryTime"),
    ExpiryField::Timestamp("end_date"),
    ExpiryField::Timestamp("endDate"),
];

/// First parseable expiry among the known provider field names.
pub fn expiry_from_fields(fields: &Map<String, Value>) -> Option<DateTime<Utc>> {
    EXPIRY_FIELDS.iter().find_map(|field| match field {
        ExpiryField::Millis(name) => fields.get(*name).and_then(parse_millis),
        ExpiryField::Timestamp(name) => fields
            .get(*name)
            .and_then(Value::as_str)
            .and_then(parse_timestamp),
    })
}

pub fn parse_millis(value: &Value) -> Option<DateTime<Utc>> {
    let millis = match value {
        Value::Number(n) => n.as_i64()?,
        Value::String(s) => s.trim().parse::<i64>().ok()?,
        _ => return None,
    };
    Utc.timestamp_millis_opt(millis).single()
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Client-submitted proof of purchase: a bag of provider-specific fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Receipt(pub Map<String, Value>);

impl Receipt {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// Non-empty string field.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.0
            .get(name)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    pub fn purchase_token(&self) -> Option<&str> {
        self.field("purchaseToken")
    }

    pub fn product_id(&self) -> Option<&str> {
        self.field("productId")
    }

    pub fn package_name(&self) -> Option<&str> {
        self.field("packageName")
    }

    pub fn platform(&self) -> Option<&str> {
        self.field("platform")
    }

    pub fn expiry(&self) -> Option<DateTime<Utc>> {
        expiry_from_fields(&self.0)
    }

    pub fn to_json_string(&self) -> String {
        Value::Object(self.0.clone()).to_string()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VerificationResult {
    pub verified: bool,
    pub tier: Tier,
    pub expiry: Option<DateTime<Utc>>,
    pub purchase_token: String,
    pub product_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_expiry_priority_order() {
        let map = fields(json!({
            "end_date": "2030-01-01T00:00:00Z",
            "expiryTimeMillis": "1893456000000"
        }));
        let expiry = expiry_from_fields(&map).unwrap();
        assert_eq!(expiry.timestamp_millis(), 1_893_456_000_000);
    }

    #[test]
    fn test_expiry_skips_unparseable_fields() {
        let map = fields(json!({
            "expiryTimeMillis": "soon",
            "endDate": "2031-05-01T12:00:00.250"
        }));
        let expiry = expiry_from_fields(&map).unwrap();
        assert_eq!(expiry.to_rfc3339(), "2031-05-01T12:00:00.250+00:00");
    }

    #[test]
    fn test_expiry_accepts_numeric_millis() {
        let map = fields(json!({ "expiresDateMs": 1_700_000_000_000i64 }));
        assert_eq!(
            expiry_from_fields(&map).unwrap().timestamp_millis(),
            1_700_000_000_000
        );
        assert!(expiry_from_fields(&Map::new()).is_none());
    }

    #[test]
    fn test_receipt_accessors() {
        let receipt = Receipt::new(fields(json!({
            "purchaseToken": "tok-1",
            "productId": "  ",
            "packageName": "com.example.news"
        })));
        assert_eq!(receipt.purchase_token(), Some("tok-1"));
        assert_eq!(receipt.product_id(), None);
        assert_eq!(receipt.package_name(), Some("com.example.news"));
        assert!(receipt.to_json_string().contains("\"purchaseToken\":\"tok-1\""));
    }
}
