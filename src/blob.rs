//! The `cache:` temp-blob interface (spec §6).
//!
//! Concrete `file:`/`http:`/`data:` URI handlers are out of scope for this
//! crate (spec §1); the multipart parser only needs an opaque sink it can
//! spill oversized or binary parts into and later `remove()`. This module
//! defines that narrow interface plus an in-memory default implementation
//! so the crate is usable (and testable) without an external cache.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use bytes::Bytes;
use rand::RngCore;
use crate::error::WebError;
use crate::registry::ContentType;

//------------ BlobStore ------------------------------------------------------

/// A factory for blob sinks, reachable from anywhere a parser runs.
pub trait BlobStore: Send + Sync {
    /// Creates a new, empty blob for the given content type and returns it.
    fn create(&self, content_type: &ContentType) -> Result<Arc<dyn Blob>, WebError>;
}

//------------ Blob ------------------------------------------------------------

/// A single spilled part, addressable by its `uri()`.
pub trait Blob: Send + Sync {
    /// The `cache:`-scheme URI identifying this blob.
    fn uri(&self) -> &str;

    /// Writes the full body into the blob, replacing any prior content.
    fn save(&self, data: Bytes) -> Result<(), WebError>;

    /// Reads the blob's current content back out.
    fn load(&self) -> Result<Bytes, WebError>;

    /// Removes the blob. Safe to call more than once.
    fn remove(&self) -> Result<(), WebError>;
}

//------------ MemoryBlobStore -------------------------------------------------

/// A `BlobStore` that keeps spilled parts in memory, keyed by a random id.
///
/// This is what `register_builtins` installs by default. Embedding
/// applications that want parts spilled to disk provide their own
/// `BlobStore` and pass it into the request pipeline instead.
#[derive(Clone, Default)]
pub struct MemoryBlobStore {
    blobs: Arc<Mutex<HashMap<String, Bytes>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the blob for `uri` has not been created or has
    /// already been removed. Used by tests to check property `P8`.
    pub fn contains(&self, uri: &str) -> bool {
        self.blobs.lock().unwrap().contains_key(uri)
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlobStore for MemoryBlobStore {
    fn create(&self, _content_type: &ContentType) -> Result<Arc<dyn Blob>, WebError> {
        let mut id_bytes = [0u8; 18];
        rand::rng().fill_bytes(&mut id_bytes);
        let uri = format!("cache:{}", base64_url(&id_bytes));
        self.blobs.lock().unwrap().insert(uri.clone(), Bytes::new());
        Ok(Arc::new(MemoryBlob { uri, store: self.blobs.clone() }))
    }
}

struct MemoryBlob {
    uri: String,
    store: Arc<Mutex<HashMap<String, Bytes>>>,
}

impl Blob for MemoryBlob {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn save(&self, data: Bytes) -> Result<(), WebError> {
        self.store.lock().unwrap().insert(self.uri.clone(), data);
        Ok(())
    }

    fn load(&self) -> Result<Bytes, WebError> {
        self.store.lock().unwrap().get(&self.uri).cloned().ok_or_else(|| {
            WebError::internal_server_error(
                format!("blob {} has already been removed", self.uri)
            )
        })
    }

    fn remove(&self) -> Result<(), WebError> {
        self.store.lock().unwrap().remove(&self.uri);
        Ok(())
    }
}

fn base64_url(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}
