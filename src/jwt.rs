//! Unverified JWT claim decoding.
//!
//! Tokens are only inspected for their expiry and for display; signature
//! verification is the resource server's job.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{OidcError, Result};

/// The `aud` claim, which is a single string or a list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    One(String),
    Many(Vec<String>),
}

impl Audience {
    pub fn contains(&self, audience: &str) -> bool {
        match self {
            Self::One(one) => one == audience,
            Self::Many(many) => many.iter().any(|a| a == audience),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        let items: &[String] = match self {
            Self::One(one) => std::slice::from_ref(one),
            Self::Many(many) => many,
        };
        items.iter().map(String::as_str)
    }
}

/// Registered claims plus everything else the provider put in the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JwtClaims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<Audience>,
    /// Expiry, Unix seconds.
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl JwtClaims {
    /// Expiry as Unix milliseconds.
    pub fn expires_at_millis(&self) -> i64 {
        self.exp.saturating_mul(1000)
    }

    /// Roles granted to the token's audiences, then realm-wide roles.
    pub fn roles(&self) -> Vec<String> {
        let mut roles = Vec::new();

        if let (Some(aud), Some(Value::Object(resources))) =
            (&self.aud, self.extra.get("resource_access"))
        {
            for audience in aud.iter() {
                if let Some(resource) = resources.get(audience) {
                    roles.extend(string_list(resource.get("roles")));
                }
            }
        }
        if let Some(realm) = self.extra.get("realm_access") {
            roles.extend(string_list(realm.get("roles")));
        }

        roles
    }
}

fn string_list(value: Option<&Value>) -> impl Iterator<Item = String> + '_ {
    value
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|v| v.as_str().map(str::to_string))
}

/// Decode the payload of a compact JWS without checking its signature.
pub fn decode(token: &str) -> Result<JwtClaims> {
    let mut segments = token.split('.');
    let payload = match (segments.next(), segments.next(), segments.next()) {
        (Some(_), Some(payload), Some(_)) if !payload.is_empty() => payload,
        _ => return Err(OidcError::ClaimDecode("Invalid token specified: missing part #2".into())),
    };

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| {
            OidcError::ClaimDecode(format!(
                "Invalid token specified: invalid base64 for part #2 ({e})"
            ))
        })?;

    serde_json::from_slice(&bytes).map_err(|e| {
        OidcError::ClaimDecode(format!(
            "Invalid token specified: invalid json for part #2 ({e})"
        ))
    })
}

/// Build an unsigned token around `claims`. Test helper shared by the crate's tests.
#[cfg(test)]
pub(crate) fn encode_unsigned(claims: &Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{header}.{payload}.sig")
}
