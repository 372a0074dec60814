//! User records as they travel through the import pipeline.
//!
//! The same types serve as the JSON wire payload for queued messages and
//! as the line format of the backup file. Absent optional fields are
//! omitted from the JSON rather than written as empty strings, so a record
//! survives a serialize/deserialize cycle unchanged.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Postal address owned by exactly one [`User`].
///
/// Fields are individually optional. Addresses are only ever inserted in the
/// same transaction as their owner, right after the owner row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub street: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zip_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
}

/// A user record.
///
/// `id` is the surrogate key assigned by the store on insert. `uuid` is the
/// external identifier; once set it never changes, and it is carried through
/// every fallback tier so duplicate deliveries can be recognised.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    pub email: String,
    #[serde(default)]
    pub phone_number: String,
    #[serde(default)]
    pub addresses: Vec<Address>,
}

impl User {
    /// Create a user with the required fields only.
    pub fn new(email: impl Into<String>, phone_number: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            phone_number: phone_number.into(),
            ..Default::default()
        }
    }

    /// Return the external identifier, assigning a fresh one if unset.
    pub fn ensure_uuid(&mut self) -> Uuid {
        *self.uuid.get_or_insert_with(Uuid::new_v4)
    }

    /// Serialize to the JSON wire payload.
    pub fn to_payload(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Deserialize from the JSON wire payload.
    pub fn from_payload(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_user() -> User {
        User {
            id: None,
            uuid: Some(Uuid::new_v4()),
            first_name: Some("Ada".to_string()),
            last_name: None,
            email: "ada@example.com".to_string(),
            phone_number: "+44 20 7946 0000".to_string(),
            addresses: vec![
                Address {
                    street: Some("12 Analytical Row".to_string()),
                    city: Some("London".to_string()),
                    state: None,
                    zip_code: Some("N1 9GU".to_string()),
                    country: Some("UK".to_string()),
                },
                Address::default(),
            ],
        }
    }

    #[test]
    fn test_payload_round_trip_preserves_absent_fields() {
        let user = full_user();
        let bytes = user.to_payload().unwrap();
        let decoded = User::from_payload(&bytes).unwrap();

        assert_eq!(decoded, user);
        assert!(decoded.last_name.is_none());
        assert!(decoded.addresses[0].state.is_none());
    }

    #[test]
    fn test_absent_fields_are_omitted_not_empty() {
        let user = User::new("a@b.c", "123");
        let json: serde_json::Value = serde_json::from_slice(&user.to_payload().unwrap()).unwrap();

        let obj = json.as_object().unwrap();
        assert!(!obj.contains_key("first_name"));
        assert!(!obj.contains_key("last_name"));
        assert!(!obj.contains_key("id"));
        assert_eq!(obj["email"], "a@b.c");
        assert_eq!(obj["addresses"], serde_json::json!([]));
    }

    #[test]
    fn test_decode_source_record() {
        let raw = br#"{
            "first_name": "Grace",
            "email": "grace@example.com",
            "phone_number": "555-0100",
            "addresses": [{"street": "1 Navy Way", "city": "Arlington", "zip_code": "22202"}]
        }"#;

        let user = User::from_payload(raw).unwrap();
        assert_eq!(user.first_name.as_deref(), Some("Grace"));
        assert!(user.last_name.is_none());
        assert!(user.uuid.is_none());
        assert_eq!(user.addresses.len(), 1);
        assert_eq!(user.addresses[0].zip_code.as_deref(), Some("22202"));
        assert!(user.addresses[0].country.is_none());
    }

    #[test]
    fn test_missing_email_is_rejected() {
        let raw = br#"{"first_name": "NoMail", "phone_number": "1"}"#;
        assert!(User::from_payload(raw).is_err());
    }

    #[test]
    fn test_ensure_uuid_is_stable() {
        let mut user = User::new("x@y.z", "1");
        let first = user.ensure_uuid();
        let second = user.ensure_uuid();
        assert_eq!(first, second);
        assert_eq!(user.uuid, Some(first));
    }
}
