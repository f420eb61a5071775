use axum::http::HeaderMap;

use llmgate_common::GatewayError;

/// Client-facing and admin-facing API key sets, compared in constant time.
#[derive(Debug, Clone)]
pub struct AuthKeys {
    client_keys: Vec<String>,
    admin_keys: Vec<String>,
}

impl AuthKeys {
    pub fn new(client_keys: Vec<String>, admin_keys: Vec<String>) -> Self {
        Self {
            client_keys,
            admin_keys,
        }
    }

    /// Accepts `Authorization: Bearer <key>` or `X-API-Key: <key>` against `client_keys`.
    /// An empty `client_keys` set means the client surface is unauthenticated.
    pub fn check_client(&self, headers: &HeaderMap) -> Result<(), GatewayError> {
        if self.client_keys.is_empty() {
            return Ok(());
        }
        let presented = extract_key(headers).ok_or(GatewayError::Unauthorized)?;
        if any_matches(&self.client_keys, &presented) {
            Ok(())
        } else {
            Err(GatewayError::Unauthorized)
        }
    }

    /// Requires `X-API-Key: <admin-key>` against `admin_keys`; never falls open.
    pub fn check_admin(&self, headers: &HeaderMap) -> Result<(), GatewayError> {
        let presented = extract_key(headers).ok_or(GatewayError::Unauthorized)?;
        if !self.admin_keys.is_empty() && any_matches(&self.admin_keys, &presented) {
            Ok(())
        } else {
            Err(GatewayError::Unauthorized)
        }
    }
}

fn any_matches(keys: &[String], presented: &str) -> bool {
    // Every candidate is compared, win or lose, so the search never short-circuits on
    // the first constant-time match and its timing doesn't betray which key it was.
    let mut found = false;
    for key in keys {
        if constant_time_eq(key.as_bytes(), presented.as_bytes()) {
            found = true;
        }
    }
    found
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn extract_key(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = header_str(headers, "x-api-key") {
        return Some(value);
    }
    let auth = header_str(headers, "authorization")?;
    let trimmed = auth.trim();
    trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))
        .map(|token| token.trim().to_string())
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with(name: &str, value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
            value.parse().unwrap(),
        );
        headers
    }

    #[test]
    fn accepts_bearer_token() {
        let auth = AuthKeys::new(vec!["secret".into()], vec![]);
        let headers = headers_with("authorization", "Bearer secret");
        assert!(auth.check_client(&headers).is_ok());
    }

    #[test]
    fn accepts_x_api_key_header() {
        let auth = AuthKeys::new(vec!["secret".into()], vec![]);
        let headers = headers_with("x-api-key", "secret");
        assert!(auth.check_client(&headers).is_ok());
    }

    #[test]
    fn rejects_unknown_key() {
        let auth = AuthKeys::new(vec!["secret".into()], vec![]);
        let headers = headers_with("x-api-key", "wrong");
        assert!(auth.check_client(&headers).is_err());
    }

    #[test]
    fn admin_never_falls_open_on_empty_admin_keys() {
        let auth = AuthKeys::new(vec![], vec![]);
        let headers = headers_with("x-api-key", "whatever");
        assert!(auth.check_admin(&headers).is_err());
    }
}
