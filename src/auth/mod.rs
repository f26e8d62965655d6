//! The AuthScheme registry (spec C2, §4.2).
//!
//! Same write-once/read-lock-free `ArcSwap` shape as [`crate::registry`];
//! the two registries are kept as siblings rather than unified because
//! they key on different things (media type vs. scheme name) and have
//! unrelated capability sets.

mod basic;
mod bearer;

pub use basic::BasicScheme;
pub use bearer::BearerScheme;

use std::collections::HashMap;
use std::sync::Arc;
use arc_swap::ArcSwap;
use constant_time_eq::constant_time_eq;
use crate::error::WebError;
use crate::request::Request;

//------------ Credentials -----------------------------------------------------

/// `Credentials = { identity } [+ secret]` (spec §4.2).
///
/// `PasswordCredentials` in the spec's terms is just this struct with
/// `secret` populated; there is no separate type because every built-in
/// scheme either needs a secret or ignores it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credentials {
    pub identity: String,
    pub secret: Option<String>,
}

impl Credentials {
    pub fn new(identity: impl Into<String>) -> Self {
        Credentials { identity: identity.into(), secret: None }
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }
}

//------------ Challenge -------------------------------------------------------

/// A `WWW-Authenticate` challenge: scheme, optional realm, and parameters.
#[derive(Clone, Debug, Default)]
pub struct Challenge {
    pub scheme: String,
    pub realm: Option<String>,
    pub params: Vec<(String, String)>,
}

impl Challenge {
    pub fn new(scheme: impl Into<String>) -> Self {
        Challenge { scheme: scheme.into(), realm: None, params: Vec::new() }
    }

    pub fn with_realm(mut self, realm: impl Into<String>) -> Self {
        self.realm = Some(realm.into());
        self
    }
}

impl std::fmt::Display for Challenge {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.scheme)?;
        let mut parts = Vec::new();
        if let Some(realm) = &self.realm {
            parts.push(format!("realm=\"{}\"", realm));
        }
        for (key, value) in &self.params {
            parts.push(format!("{}=\"{}\"", key, value));
        }
        if !parts.is_empty() {
            write!(f, " {}", parts.join(", "))?;
        }
        Ok(())
    }
}

//------------ CredentialsProvider ---------------------------------------------

/// `mode` in the credentials-provider callable signature (spec §4.2).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Mode {
    /// Supply outbound credentials, possibly informed by a prior challenge.
    Retrieve,
    /// Return the expected credentials for an inbound identity.
    Verify,
}

/// `(mode, authScheme, identity?, authorization?, challenge?, request?) →
/// credentials?`
///
/// Implemented as a trait with a blanket impl for closures, mirroring the
/// teacher's `ProcessRequest`/`Source` pattern, so embedding applications
/// can hand over a plain `Fn` instead of writing out an impl block. The
/// trailing `request` is the inbound request the scheme is being
/// consulted for, letting a provider key credentials off something
/// besides the identity (a tenant header, the remote address).
pub trait CredentialsProvider: Send + Sync {
    fn provide(
        &self,
        mode: Mode,
        scheme: &str,
        identity: Option<&str>,
        authorization: Option<&str>,
        challenge: Option<&Challenge>,
        request: &Request,
    ) -> Option<Credentials>;
}

impl<F> CredentialsProvider for F
where
    F: Fn(Mode, &str, Option<&str>, Option<&str>, Option<&Challenge>, &Request) -> Option<Credentials>
        + Send + Sync,
{
    fn provide(
        &self,
        mode: Mode,
        scheme: &str,
        identity: Option<&str>,
        authorization: Option<&str>,
        challenge: Option<&Challenge>,
        request: &Request,
    ) -> Option<Credentials> {
        (self)(mode, scheme, identity, authorization, challenge, request)
    }
}

/// Constant-time comparison helper built-in schemes use when checking a
/// caller-supplied secret against the provider's expected value (spec
/// §4.2: "comparisons use constant-time byte equality").
pub(crate) fn secrets_match(supplied: &str, expected: &str) -> bool {
    constant_time_eq(supplied.as_bytes(), expected.as_bytes())
}

//------------ AuthScheme -------------------------------------------------------

/// The capability set spec §9 calls out: `createAuthorization`,
/// `verifyAuthorization`, `verifyAuthenticationInfo`,
/// `isCompatibleCredentials`.
pub trait AuthScheme: Send + Sync {
    fn name(&self) -> &str;

    /// Builds an outbound `Authorization` header, or `None` if this scheme
    /// has nothing to offer without more information (spec §4.2).
    fn create_authorization(
        &self,
        provider: &dyn CredentialsProvider,
        challenge: Option<&Challenge>,
        request: &Request,
    ) -> Result<Option<String>, WebError>;

    /// Verifies an inbound `Authorization` header against the provider's
    /// expected credentials. Fails with `auth-scheme-error` (optionally
    /// carrying a challenge) on mismatch.
    fn verify_authorization(
        &self,
        header: &str,
        provider: &dyn CredentialsProvider,
        request: &Request,
    ) -> Result<Credentials, WebError>;

    /// Verifies an `Authentication-Info` response header. Optional per
    /// scheme (spec §4.2); the default is a no-op pass.
    fn verify_authentication_info(&self, _header: &str) -> Result<(), WebError> {
        Ok(())
    }

    fn is_compatible_credentials(&self, credentials: &Credentials) -> bool;
}

//------------ UnknownScheme ----------------------------------------------------

/// The sentinel an unregistered scheme name resolves to: every method
/// fails (spec §4.2: "unknown scheme produces a sentinel that throws on
/// every method").
struct UnknownScheme(String);

impl AuthScheme for UnknownScheme {
    fn name(&self) -> &str {
        &self.0
    }

    fn create_authorization(
        &self, _provider: &dyn CredentialsProvider, _challenge: Option<&Challenge>,
        _request: &Request,
    ) -> Result<Option<String>, WebError> {
        Err(WebError::auth_scheme_error(
            format!("unknown auth scheme: {}", self.0), None
        ))
    }

    fn verify_authorization(
        &self, _header: &str, _provider: &dyn CredentialsProvider, _request: &Request,
    ) -> Result<Credentials, WebError> {
        Err(WebError::auth_scheme_error(
            format!("unknown auth scheme: {}", self.0), None
        ))
    }

    fn is_compatible_credentials(&self, _credentials: &Credentials) -> bool {
        false
    }
}

//------------ AuthRegistry ------------------------------------------------------

/// The scheme-name-keyed registry; same write-once/read-lock-free shape
/// as `registry::Registry`.
#[derive(Clone)]
pub struct AuthRegistry {
    schemes: Arc<ArcSwap<HashMap<String, Arc<dyn AuthScheme>>>>,
}

impl Default for AuthRegistry {
    fn default() -> Self {
        AuthRegistry { schemes: Arc::new(ArcSwap::new(Arc::new(HashMap::new()))) }
    }
}

impl AuthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, scheme: Arc<dyn AuthScheme>) {
        let mut next = (**self.schemes.load()).clone();
        next.insert(name.to_ascii_lowercase(), scheme);
        self.schemes.store(Arc::new(next));
    }

    /// Looks up a scheme by name, falling back to `UnknownScheme` (never
    /// fails: the failure surfaces only when the sentinel's methods run).
    pub fn lookup(&self, name: &str) -> Arc<dyn AuthScheme> {
        self.schemes.load()
            .get(&name.to_ascii_lowercase())
            .cloned()
            .unwrap_or_else(|| Arc::new(UnknownScheme(name.to_string())))
    }
}

/// Registers the built-in `Basic` and `Bearer` schemes.
pub fn register_builtins() -> AuthRegistry {
    let registry = AuthRegistry::new();
    registry.register("basic", Arc::new(BasicScheme));
    registry.register("bearer", Arc::new(BearerScheme));
    registry
}


#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> Request {
        Request::new(
            hyper::Method::GET, "/".parse().unwrap(), hyper::HeaderMap::new(),
            bytes::Bytes::new(), None, crate::registry::register_builtins(),
            Arc::new(crate::blob::MemoryBlobStore::new()), &crate::config::Config::default(),
        )
    }

    #[test]
    fn unknown_scheme_fails_every_method() {
        let registry = AuthRegistry::new();
        let scheme = registry.lookup("digest");
        let provider = |_: Mode, _: &str, _: Option<&str>, _: Option<&str>, _: Option<&Challenge>, _: &Request| None;
        let request = request();
        assert!(scheme.create_authorization(&provider, None, &request).is_err());
        assert!(scheme.verify_authorization("whatever", &provider, &request).is_err());
    }

    #[test]
    fn challenge_display_includes_realm() {
        let challenge = Challenge::new("Basic").with_realm("my-api");
        assert_eq!(challenge.to_string(), "Basic realm=\"my-api\"");
    }
}
