//! `Basic` (RFC 7617): Base64 of `identity:secret`.

use base64::Engine;
use crate::error::WebError;
use crate::request::Request;
use super::{secrets_match, AuthScheme, Challenge, Credentials, CredentialsProvider, Mode};

pub struct BasicScheme;

impl AuthScheme for BasicScheme {
    fn name(&self) -> &str {
        "basic"
    }

    fn create_authorization(
        &self, provider: &dyn CredentialsProvider, challenge: Option<&Challenge>,
        request: &Request,
    ) -> Result<Option<String>, WebError> {
        let credentials = provider.provide(Mode::Retrieve, "basic", None, None, challenge, request);
        let credentials = match credentials {
            Some(c) => c,
            None => return Ok(None),
        };
        let secret = credentials.secret.unwrap_or_default();
        let token = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", credentials.identity, secret));
        Ok(Some(format!("Basic {}", token)))
    }

    fn verify_authorization(
        &self, header: &str, provider: &dyn CredentialsProvider, request: &Request,
    ) -> Result<Credentials, WebError> {
        let token = header.strip_prefix("Basic ").ok_or_else(|| {
            WebError::auth_scheme_error("expected a Basic authorization header", None)
        })?;
        let decoded = base64::engine::general_purpose::STANDARD.decode(token.trim())
            .map_err(|_| WebError::auth_scheme_error("malformed Basic token", basic_challenge()))?;
        let decoded = String::from_utf8(decoded).map_err(|_| {
            WebError::auth_scheme_error("Basic token is not valid UTF-8", basic_challenge())
        })?;

        // `/([^:]*):?(.*)/`: identity is everything up to the first colon,
        // secret is everything after it (absent colon means no secret).
        let (identity, secret) = match decoded.split_once(':') {
            Some((identity, secret)) => (identity.to_string(), Some(secret.to_string())),
            None => (decoded, None),
        };

        let expected = provider.provide(
            Mode::Verify, "basic", Some(&identity), Some(header), None, request,
        ).ok_or_else(|| {
            WebError::auth_scheme_error("unknown identity", basic_challenge())
        })?;

        let supplied_secret = secret.unwrap_or_default();
        let expected_secret = expected.secret.clone().unwrap_or_default();
        if !secrets_match(&supplied_secret, &expected_secret) {
            return Err(WebError::auth_scheme_error("invalid credentials", basic_challenge()))
        }

        Ok(expected)
    }

    fn is_compatible_credentials(&self, credentials: &Credentials) -> bool {
        credentials.secret.is_some()
    }
}

fn basic_challenge() -> Option<String> {
    Some(Challenge::new("Basic").to_string())
}


#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    fn provider(identity: &'static str, secret: &'static str) -> impl CredentialsProvider {
        move |mode: Mode, _scheme: &str, requested: Option<&str>, _auth: Option<&str>, _challenge: Option<&Challenge>, _request: &Request| {
            match mode {
                Mode::Retrieve => Some(Credentials::new(identity).with_secret(secret)),
                Mode::Verify if requested == Some(identity) => {
                    Some(Credentials::new(identity).with_secret(secret))
                }
                Mode::Verify => None,
            }
        }
    }

    fn request() -> Request {
        Request::new(
            hyper::Method::GET, "/".parse().unwrap(), hyper::HeaderMap::new(),
            bytes::Bytes::new(), None, crate::registry::register_builtins(),
            Arc::new(crate::blob::MemoryBlobStore::new()), &crate::config::Config::default(),
        )
    }

    #[test]
    fn round_trips_create_and_verify() {
        let scheme = BasicScheme;
        let creds = provider("alice", "hunter2");
        let request = request();
        let header = scheme.create_authorization(&creds, None, &request).unwrap().unwrap();
        assert!(header.starts_with("Basic "));
        let verified = scheme.verify_authorization(&header, &creds, &request).unwrap();
        assert_eq!(verified.identity, "alice");
    }

    #[test]
    fn rejects_wrong_secret() {
        let scheme = BasicScheme;
        let token = base64::engine::general_purpose::STANDARD.encode("alice:wrong");
        let header = format!("Basic {}", token);
        let creds = provider("alice", "hunter2");
        let err = scheme.verify_authorization(&header, &creds, &request()).unwrap_err();
        assert_eq!(err.status(), hyper::StatusCode::UNAUTHORIZED);
        assert!(err.challenge().is_some());
    }

    #[test]
    fn identity_with_no_colon_has_no_secret() {
        let scheme = BasicScheme;
        let token = base64::engine::general_purpose::STANDARD.encode("alice");
        let header = format!("Basic {}", token);
        let creds = provider("alice", "");
        let verified = scheme.verify_authorization(&header, &creds, &request()).unwrap();
        assert_eq!(verified.identity, "alice");
    }
}
