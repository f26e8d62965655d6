//! `Bearer` (RFC 6750): an opaque token used directly as the identity.

use crate::error::WebError;
use crate::request::Request;
use super::{secrets_match, AuthScheme, Challenge, Credentials, CredentialsProvider, Mode};

pub struct BearerScheme;

impl AuthScheme for BearerScheme {
    fn name(&self) -> &str {
        "bearer"
    }

    fn create_authorization(
        &self, provider: &dyn CredentialsProvider, challenge: Option<&Challenge>,
        request: &Request,
    ) -> Result<Option<String>, WebError> {
        let credentials = provider.provide(Mode::Retrieve, "bearer", None, None, challenge, request);
        Ok(credentials.map(|c| format!("Bearer {}", c.identity)))
    }

    fn verify_authorization(
        &self, header: &str, provider: &dyn CredentialsProvider, request: &Request,
    ) -> Result<Credentials, WebError> {
        let token = header.strip_prefix("Bearer ").ok_or_else(|| {
            WebError::auth_scheme_error("expected a Bearer authorization header", None)
        })?.trim();

        let expected = provider.provide(
            Mode::Verify, "bearer", Some(token), Some(header), None, request,
        ).ok_or_else(|| {
            WebError::auth_scheme_error("unknown token", bearer_challenge())
        })?;

        if !secrets_match(token, &expected.identity) {
            return Err(WebError::auth_scheme_error("invalid token", bearer_challenge()))
        }

        Ok(expected)
    }

    fn is_compatible_credentials(&self, _credentials: &Credentials) -> bool {
        true
    }
}

fn bearer_challenge() -> Option<String> {
    Some(Challenge::new("Bearer").to_string())
}


#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    fn provider(token: &'static str) -> impl CredentialsProvider {
        move |mode: Mode, _scheme: &str, requested: Option<&str>, _auth: Option<&str>, _challenge: Option<&Challenge>, _request: &Request| {
            match mode {
                Mode::Retrieve => Some(Credentials::new(token)),
                Mode::Verify if requested == Some(token) => Some(Credentials::new(token)),
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
        let scheme = BearerScheme;
        let creds = provider("abc123");
        let request = request();
        let header = scheme.create_authorization(&creds, None, &request).unwrap().unwrap();
        assert_eq!(header, "Bearer abc123");
        let verified = scheme.verify_authorization(&header, &creds, &request).unwrap();
        assert_eq!(verified.identity, "abc123");
    }

    #[test]
    fn rejects_unknown_token() {
        let scheme = BearerScheme;
        let creds = provider("abc123");
        let err = scheme.verify_authorization("Bearer wrong", &creds, &request()).unwrap_err();
        assert_eq!(err.status(), hyper::StatusCode::UNAUTHORIZED);
    }
}
