//! Outbound `Authorization` composition (spec §4.2's "outbound clients
//! consult the same registry when composing requests").
//!
//! Scoped narrowly to header composition: this does not wrap `reqwest`
//! in a new client abstraction, it just builds the one header an outbound
//! caller needs from the same [`AuthScheme`]/[`CredentialsProvider`] pair
//! the inbound side uses, the way the teacher's `units::json::Json`
//! builds its own `reqwest::Client` directly rather than through a
//! wrapper.

use crate::auth::{AuthRegistry, Challenge, CredentialsProvider};
use crate::error::WebError;
use crate::request::Request;

/// Composes outbound `Authorization` headers against an [`AuthRegistry`].
pub struct AuthClient {
    schemes: AuthRegistry,
}

impl AuthClient {
    pub fn new(schemes: AuthRegistry) -> Self {
        AuthClient { schemes }
    }

    /// Attaches an `Authorization` header for `scheme_name` onto `builder`,
    /// or returns it unchanged if the scheme has nothing to offer yet
    /// (e.g. a digest scheme waiting on a server challenge).
    pub fn authorize(
        &self,
        builder: reqwest::RequestBuilder,
        scheme_name: &str,
        provider: &dyn CredentialsProvider,
        challenge: Option<&Challenge>,
        request: &Request,
    ) -> Result<reqwest::RequestBuilder, WebError> {
        let scheme = self.schemes.lookup(scheme_name);
        match scheme.create_authorization(provider, challenge, request)? {
            Some(header) => Ok(builder.header(reqwest::header::AUTHORIZATION, header)),
            None => Ok(builder),
        }
    }

    /// Re-authorizes a request after a `401` carrying `WWW-Authenticate`,
    /// the retry path spec §4.2 describes for challenge-based schemes.
    pub fn reauthorize_on_challenge(
        &self,
        builder: reqwest::RequestBuilder,
        scheme_name: &str,
        provider: &dyn CredentialsProvider,
        response: &reqwest::Response,
        request: &Request,
    ) -> Result<reqwest::RequestBuilder, WebError> {
        let challenge = response.headers()
            .get(reqwest::header::WWW_AUTHENTICATE)
            .and_then(|value| value.to_str().ok())
            .map(parse_challenge);
        self.authorize(builder, scheme_name, provider, challenge.as_ref(), request)
    }
}

/// Parses a `WWW-Authenticate` header value into a [`Challenge`]:
/// `Scheme key="value", key2="value2"`.
fn parse_challenge(header: &str) -> Challenge {
    let mut parts = header.splitn(2, ' ');
    let scheme = parts.next().unwrap_or("").to_string();
    let mut challenge = Challenge::new(scheme);
    if let Some(rest) = parts.next() {
        for pair in rest.split(',') {
            let pair = pair.trim();
            let Some((key, value)) = pair.split_once('=') else { continue };
            let key = key.trim();
            let value = value.trim().trim_matches('"');
            if key.eq_ignore_ascii_case("realm") {
                challenge.realm = Some(value.to_string());
            } else {
                challenge.params.push((key.to_string(), value.to_string()));
            }
        }
    }
    challenge
}
