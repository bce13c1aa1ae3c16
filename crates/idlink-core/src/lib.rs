use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub mod resolve;

/// One stored observation of an email/phone pair. Contacts are append-only:
/// the only mutation a row ever sees is a primary being demoted under an
/// older primary when two clusters merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub id: i64,
    pub email: Option<String>,
    pub phone_number: Option<String>,
    pub link_precedence: LinkPrecedence,
    pub linked_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Contact {
    pub fn is_primary(&self) -> bool {
        self.link_precedence == LinkPrecedence::Primary
    }

    /// The id of the primary governing this contact's cluster: itself for a
    /// primary, its linked id for a secondary.
    pub fn governing_primary_id(&self) -> i64 {
        match self.link_precedence {
            LinkPrecedence::Primary => self.id,
            LinkPrecedence::Secondary => self.linked_id.unwrap_or(self.id),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LinkPrecedence {
    Primary,
    Secondary,
}

impl LinkPrecedence {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkPrecedence::Primary => "primary",
            LinkPrecedence::Secondary => "secondary",
        }
    }
}

impl fmt::Display for LinkPrecedence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LinkPrecedence {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "primary" => Ok(LinkPrecedence::Primary),
            "secondary" => Ok(LinkPrecedence::Secondary),
            other => Err(format!("Unknown link precedence: {other}")),
        }
    }
}

/// Wire-level identify request. `phoneNumber` arrives as a JSON string or
/// number depending on the client, so it gets a tolerant deserializer.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct IdentifyRequest {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(
        default,
        rename = "phoneNumber",
        deserialize_with = "deserialize_phone_value"
    )]
    pub phone_number: Option<String>,
}

impl IdentifyRequest {
    /// Trim both fields, lower-case the email, and treat empty strings as
    /// absent. At least one identifier must survive normalization.
    pub fn normalize(self) -> Result<ContactFragment, ValidationError> {
        let email = self
            .email
            .map(|value| value.trim().to_lowercase())
            .filter(|value| !value.is_empty());
        let phone_number = self
            .phone_number
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        if email.is_none() && phone_number.is_none() {
            return Err(ValidationError::MissingIdentifier);
        }

        Ok(ContactFragment {
            email,
            phone_number,
        })
    }
}

/// A normalized contact fragment with at least one identifier present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactFragment {
    pub email: Option<String>,
    pub phone_number: Option<String>,
}

/// Consolidated identity view returned for a resolved fragment.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidatedIdentity {
    pub primary_contact_id: i64,
    pub emails: Vec<String>,
    pub phone_numbers: Vec<String>,
    pub secondary_contact_ids: Vec<i64>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("email or phoneNumber required")]
    MissingIdentifier,
}

/// Deserialize a phone number that can be either a string or a number into
/// an optional String.
fn deserialize_phone_value<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(text)) => Ok(Some(text)),
        Some(Value::Number(number)) => Ok(Some(number.to_string())),
        Some(_) => Err(serde::de::Error::custom(
            "expected string or number for phoneNumber",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_trims_and_lowercases_email() {
        let request = IdentifyRequest {
            email: Some("  Jane.Doe@Example.COM ".to_string()),
            phone_number: Some(" +111 ".to_string()),
        };
        let fragment = request.normalize().expect("valid fragment");
        assert_eq!(fragment.email.as_deref(), Some("jane.doe@example.com"));
        assert_eq!(fragment.phone_number.as_deref(), Some("+111"));
    }

    #[test]
    fn normalize_treats_empty_strings_as_absent() {
        let request = IdentifyRequest {
            email: Some("   ".to_string()),
            phone_number: Some("+222".to_string()),
        };
        let fragment = request.normalize().expect("phone still present");
        assert_eq!(fragment.email, None);
        assert_eq!(fragment.phone_number.as_deref(), Some("+222"));
    }

    #[test]
    fn normalize_rejects_when_both_identifiers_are_missing() {
        let request = IdentifyRequest {
            email: Some("  ".to_string()),
            phone_number: None,
        };
        assert_eq!(
            request.normalize(),
            Err(ValidationError::MissingIdentifier)
        );
    }

    #[test]
    fn phone_number_accepts_string_and_number() {
        let from_string: IdentifyRequest =
            serde_json::from_str(r#"{"phoneNumber":"+111"}"#).expect("string phone");
        assert_eq!(from_string.phone_number.as_deref(), Some("+111"));

        let from_number: IdentifyRequest =
            serde_json::from_str(r#"{"phoneNumber":123456}"#).expect("numeric phone");
        assert_eq!(from_number.phone_number.as_deref(), Some("123456"));

        let from_null: IdentifyRequest =
            serde_json::from_str(r#"{"phoneNumber":null,"email":"a@x.com"}"#).expect("null phone");
        assert_eq!(from_null.phone_number, None);
    }

    #[test]
    fn phone_number_rejects_other_json_types() {
        let result: Result<IdentifyRequest, _> = serde_json::from_str(r#"{"phoneNumber":[1]}"#);
        assert!(result.is_err());
    }

    #[test]
    fn link_precedence_roundtrips_through_strings() {
        for precedence in [LinkPrecedence::Primary, LinkPrecedence::Secondary] {
            let parsed: LinkPrecedence = precedence.as_str().parse().expect("parse");
            assert_eq!(parsed, precedence);
        }
        assert!("tertiary".parse::<LinkPrecedence>().is_err());
    }

    #[test]
    fn response_serializes_with_wire_field_names() {
        let identity = ConsolidatedIdentity {
            primary_contact_id: 1,
            emails: vec!["a@x.com".to_string()],
            phone_numbers: vec!["+111".to_string()],
            secondary_contact_ids: vec![2, 3],
        };
        let json = serde_json::to_value(&identity).expect("serialize");
        assert_eq!(json["primaryContactId"], 1);
        assert_eq!(json["emails"][0], "a@x.com");
        assert_eq!(json["phoneNumbers"][0], "+111");
        assert_eq!(json["secondaryContactIds"][1], 3);
    }
}
