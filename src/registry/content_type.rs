//! Content-type values with parameters (`charset`, `boundary`, ...).

use std::collections::BTreeMap;
use std::fmt;

/// A parsed `Content-Type` header value: an essence (`type/subtype`, always
/// lower-cased) plus an ordered set of parameters.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ContentType {
    essence: String,
    params: BTreeMap<String, String>,
}

impl ContentType {
    pub fn new(essence: impl Into<String>) -> Self {
        ContentType { essence: essence.into().to_ascii_lowercase(), params: BTreeMap::new() }
    }

    /// Parses a full header value, e.g. `multipart/form-data; boundary=X`.
    pub fn parse(value: &str) -> Self {
        let mut parts = value.split(';');
        let essence = parts.next().unwrap_or("").trim().to_ascii_lowercase();
        let mut params = BTreeMap::new();
        for part in parts {
            let part = part.trim();
            if part.is_empty() {
                continue
            }
            if let Some((key, val)) = part.split_once('=') {
                let key = key.trim().to_ascii_lowercase();
                let val = val.trim().trim_matches('"').to_string();
                params.insert(key, val);
            }
        }
        ContentType { essence, params }
    }

    pub fn essence(&self) -> &str {
        &self.essence
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn with_param(
        mut self, name: impl Into<String>, value: impl Into<String>,
    ) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn charset(&self) -> &str {
        self.param("charset").unwrap_or("utf-8")
    }

    /// Type and subtype, e.g. `("application", "json")`.
    pub fn type_subtype(&self) -> (&str, &str) {
        match self.essence.split_once('/') {
            Some((t, s)) => (t, s),
            None => (self.essence.as_str(), ""),
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.essence)?;
        for (key, val) in &self.params {
            write!(f, "; {}={}", key, val)?;
        }
        Ok(())
    }
}

impl From<&str> for ContentType {
    fn from(value: &str) -> Self {
        ContentType::parse(value)
    }
}
