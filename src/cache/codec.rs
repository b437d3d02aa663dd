//! Payload Codecs
//!
//! The engine stores typed values. When the system of record speaks bytes,
//! [`CodecStore`] sits at the boundary and converts in both directions.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::backend::BackingStore;
use super::entry::CacheKey;
use crate::error::Result;

/// Converts values to and from bytes
pub trait Codec<T>: Send + Sync {
    fn encode(&self, value: &T) -> Result<Bytes>;
    fn decode(&self, bytes: &[u8]) -> Result<T>;
}

/// JSON codec backed by serde_json
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl<T> Codec<T> for JsonCodec
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &T) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }

    fn decode(&self, bytes: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Presents a byte-oriented backing store as a typed one
pub struct CodecStore<T, C> {
    inner: Arc<dyn BackingStore<Bytes>>,
    codec: C,
    _marker: PhantomData<fn() -> T>,
}

impl<T, C> CodecStore<T, C> {
    pub fn new(inner: Arc<dyn BackingStore<Bytes>>, codec: C) -> Self {
        Self {
            inner,
            codec,
            _marker: PhantomData,
        }
    }
}

impl<T> CodecStore<T, JsonCodec> {
    /// JSON-encoded view of `inner`
    pub fn json(inner: Arc<dyn BackingStore<Bytes>>) -> Self {
        Self::new(inner, JsonCodec)
    }
}

#[async_trait]
impl<T, C> BackingStore<T> for CodecStore<T, C>
where
    T: Send + Sync + 'static,
    C: Codec<T> + 'static,
{
    async fn load(&self, key: &CacheKey) -> Result<Option<T>> {
        match self.inner.load(key).await? {
            Some(bytes) => self.codec.decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    async fn save(&self, key: &CacheKey, value: &T) -> Result<()> {
        let bytes = self.codec.encode(value)?;
        self.inner.save(key, &bytes).await
    }

    async fn save_batch(&self, entries: &[(CacheKey, T)]) -> Vec<Result<()>> {
        let mut results: Vec<Result<()>> = Vec::with_capacity(entries.len());
        let mut encoded = Vec::with_capacity(entries.len());
        let mut slots = Vec::with_capacity(entries.len());

        for (idx, (key, value)) in entries.iter().enumerate() {
            match self.codec.encode(value) {
                Ok(bytes) => {
                    encoded.push((key.clone(), bytes));
                    slots.push(idx);
                    results.push(Ok(()));
                }
                Err(e) => results.push(Err(e)),
            }
        }

        let saved = self.inner.save_batch(&encoded).await;
        for (idx, result) in slots.into_iter().zip(saved) {
            results[idx] = result;
        }
        results
    }
}
