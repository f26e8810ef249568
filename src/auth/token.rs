use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize};

/// Introspection result returned by an IndieAuth token endpoint.
///
/// Only `me` is required.  Whether the token is acceptable for this server is
/// decided by the caller comparing `me` with the configured site identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub me: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub client_id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub scope: String,
    #[serde(default)]
    pub issued_at: Option<i64>,
    #[serde(default)]
    pub issued_by: Option<String>,
}

/// `null` decodes like a missing key.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl Token {
    /// Flatten into field/value pairs for an HSET.
    ///
    /// Every field is written, absent ones as empty strings, so a rewrite
    /// replaces whatever an earlier entry held under the same key.
    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            ("me".to_string(), self.me.clone()),
            ("client_id".to_string(), self.client_id.clone()),
            ("scope".to_string(), self.scope.clone()),
            (
                "issued_at".to_string(),
                self.issued_at.map(|at| at.to_string()).unwrap_or_default(),
            ),
            (
                "issued_by".to_string(),
                self.issued_by.clone().unwrap_or_default(),
            ),
        ]
    }

    /// Rebuild from an HGETALL result.  Returns `None` when the fields do not
    /// describe a token (no `me`, or an unparsable `issued_at`).  Empty
    /// optional fields read back as `None`.
    pub fn from_fields(mut fields: HashMap<String, String>) -> Option<Self> {
        let me = fields.remove("me").filter(|me| !me.is_empty())?;
        let issued_at = match fields.remove("issued_at").filter(|raw| !raw.is_empty()) {
            Some(raw) => Some(raw.parse().ok()?),
            None => None,
        };
        Some(Self {
            me,
            client_id: fields.remove("client_id").unwrap_or_default(),
            scope: fields.remove("scope").unwrap_or_default(),
            issued_at,
            issued_by: fields.remove("issued_by").filter(|by| !by.is_empty()),
        })
    }

    /// Whether the token's identity is exactly `site_me`.
    pub fn is_for(&self, site_me: &str) -> bool {
        self.me == site_me
    }
}

/// Extract the raw token from an `Authorization: Bearer <value>` header.
pub fn bearer_value(header: &str) -> Option<&str> {
    header
        .strip_prefix("Bearer ")
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_token() -> Token {
        Token {
            me: "https://example.com/".to_string(),
            client_id: "https://client.example.net/".to_string(),
            scope: "read follow channels".to_string(),
            issued_at: Some(1_700_000_000),
            issued_by: Some("https://tokens.example.com/token".to_string()),
        }
    }

    // ── bearer_value ─────────────────────────────────────────────────

    #[test]
    fn bearer_value_extracts_token() {
        assert_eq!(bearer_value("Bearer xyz"), Some("xyz"));
        assert_eq!(bearer_value("Bearer a b"), Some("a b"));
    }

    #[test]
    fn bearer_value_rejects_other_shapes() {
        for header in ["", "Bearer", "Bearer ", "bearer xyz", "Basic dXNlcjpwYXNz", " Bearer xyz", "xyz"] {
            assert_eq!(bearer_value(header), None, "{header:?}");
        }
    }

    // ── field flattening ─────────────────────────────────────────────

    #[test]
    fn fields_survive_a_cache_trip() {
        let token = full_token();
        let map: HashMap<String, String> = token.to_fields().into_iter().collect();
        assert_eq!(Token::from_fields(map), Some(token));
    }

    #[test]
    fn absent_optional_fields_are_written_empty() {
        let token = Token {
            me: "https://example.com/".to_string(),
            ..Token::default()
        };
        let fields = token.to_fields();
        let names: Vec<&str> = fields.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(names, ["me", "client_id", "scope", "issued_at", "issued_by"]);
        assert_eq!(fields[3].1, "");
        assert_eq!(fields[4].1, "");

        let map: HashMap<String, String> = fields.into_iter().collect();
        assert_eq!(Token::from_fields(map), Some(token));
    }

    #[test]
    fn rewrite_replaces_garbled_issued_at() {
        let mut stored: HashMap<String, String> = HashMap::new();
        stored.insert("me".to_string(), "https://example.com/".to_string());
        stored.insert("issued_at".to_string(), "yesterday".to_string());

        let fresh = Token {
            me: "https://example.com/".to_string(),
            ..Token::default()
        };
        // HSET semantics: merge into the existing hash.
        stored.extend(fresh.to_fields());
        assert_eq!(Token::from_fields(stored), Some(fresh));
    }

    #[test]
    fn from_fields_requires_me() {
        let mut map: HashMap<String, String> = full_token().to_fields().into_iter().collect();
        map.remove("me");
        assert_eq!(Token::from_fields(map), None);

        let mut map: HashMap<String, String> = full_token().to_fields().into_iter().collect();
        map.insert("me".to_string(), String::new());
        assert_eq!(Token::from_fields(map), None);
    }

    #[test]
    fn from_fields_rejects_garbled_issued_at() {
        let mut map: HashMap<String, String> = full_token().to_fields().into_iter().collect();
        map.insert("issued_at".to_string(), "yesterday".to_string());
        assert_eq!(Token::from_fields(map), None);
    }

    // ── JSON ─────────────────────────────────────────────────────────

    #[test]
    fn decodes_token_endpoint_response() {
        let json = r#"{"me":"https://example.com/","client_id":"https://c.example/","scope":"read","issued_at":1700000000,"issued_by":"https://t.example/","nonce":42}"#;
        let token: Token = serde_json::from_str(json).unwrap();
        assert_eq!(token.me, "https://example.com/");
        assert_eq!(token.scope, "read");
        assert_eq!(token.issued_at, Some(1_700_000_000));
    }

    #[test]
    fn null_optional_fields_decode_as_absent() {
        let json = r#"{"me":"https://example.com/","client_id":null,"scope":null,"issued_at":null,"issued_by":null}"#;
        let token: Token = serde_json::from_str(json).unwrap();
        assert_eq!(
            token,
            Token {
                me: "https://example.com/".to_string(),
                ..Token::default()
            }
        );
    }

    #[test]
    fn json_without_me_is_rejected() {
        assert!(serde_json::from_str::<Token>(r#"{"scope":"read"}"#).is_err());
    }

    #[test]
    fn identity_comparison_is_exact() {
        let token = full_token();
        assert!(token.is_for("https://example.com/"));
        assert!(!token.is_for("https://example.com"));
        assert!(!token.is_for("https://EXAMPLE.com/"));
    }
}
