//! Object fetching
//!
//! [`ObjectFetcher`] is what the queue consumer needs from object storage:
//! fetch `(bucket, key)` with its transport metadata, or learn that the
//! object is gone. [`ObjectStoreFetcher`] implements it on top of the
//! `object_store` crate with one store per bucket, created lazily.

use crate::codec::TransportHints;
use crate::error::{ConnectorError, ConnectorResult};
use async_trait::async_trait;
use bytes::Bytes;
use object_store::path::Path as ObjectPath;
use object_store::{Attribute, ObjectStore};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// A fetched object
#[derive(Debug, Clone)]
pub struct Blob {
    pub data: Bytes,
    pub hints: TransportHints,
}

/// Fetches objects named by notifications
#[async_trait]
pub trait ObjectFetcher: Send + Sync {
    /// `Ok(None)` when the object does not exist
    async fn fetch(&self, bucket: &str, key: &str) -> ConnectorResult<Option<Blob>>;
}

type StoreFactory = dyn Fn(&str) -> ConnectorResult<Arc<dyn ObjectStore>> + Send + Sync;

/// [`ObjectFetcher`] backed by `object_store`
pub struct ObjectStoreFetcher {
    factory: Box<StoreFactory>,
    stores: Mutex<HashMap<String, Arc<dyn ObjectStore>>>,
}

impl std::fmt::Debug for ObjectStoreFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStoreFetcher")
            .field("buckets", &self.stores.lock().keys().cloned().collect::<Vec<_>>())
            .finish()
    }
}

impl ObjectStoreFetcher {
    /// Fetcher that builds the store for a bucket with `factory` on first use
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(&str) -> ConnectorResult<Arc<dyn ObjectStore>> + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
            stores: Mutex::new(HashMap::new()),
        }
    }

    /// Fetcher limited to preconfigured buckets
    pub fn fixed() -> Self {
        Self::new(|bucket| {
            Err(ConnectorError::config(format!(
                "no object store configured for bucket '{}'",
                bucket
            )))
        })
    }

    /// Register a store for one bucket
    pub fn with_store(self, bucket: impl Into<String>, store: Arc<dyn ObjectStore>) -> Self {
        self.stores.lock().insert(bucket.into(), store);
        self
    }

    /// Amazon S3 (or S3-compatible) buckets, credentials from the environment
    #[cfg(feature = "s3")]
    pub fn s3(region: Option<String>, endpoint: Option<String>) -> Self {
        use object_store::aws::AmazonS3Builder;

        Self::new(move |bucket| {
            let mut builder = AmazonS3Builder::from_env().with_bucket_name(bucket);
            if let Some(region) = &region {
                builder = builder.with_region(region);
            }
            if let Some(endpoint) = &endpoint {
                builder = builder.with_endpoint(endpoint).with_allow_http(true);
            }
            let store = builder
                .build()
                .map_err(|e| ConnectorError::config(format!("S3 store for '{}': {}", bucket, e)))?;
            Ok(Arc::new(store) as Arc<dyn ObjectStore>)
        })
    }

    fn store_for(&self, bucket: &str) -> ConnectorResult<Arc<dyn ObjectStore>> {
        let mut stores = self.stores.lock();
        if let Some(store) = stores.get(bucket) {
            return Ok(store.clone());
        }
        let store = (self.factory)(bucket)?;
        stores.insert(bucket.to_string(), store.clone());
        Ok(store)
    }
}

#[async_trait]
impl ObjectFetcher for ObjectStoreFetcher {
    async fn fetch(&self, bucket: &str, key: &str) -> ConnectorResult<Option<Blob>> {
        let store = self.store_for(bucket)?;
        // Keys arrive decoded; `Path::from` would percent-encode them again
        let path = ObjectPath::parse(key).map_err(|e| {
            ConnectorError::poison(format!("invalid object key {}/{}: {}", bucket, key, e))
        })?;

        let result = match store.get(&path).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(e) => {
                return Err(ConnectorError::Storage(format!(
                    "get {}/{}: {}",
                    bucket, key, e
                )))
            }
        };

        let hints = TransportHints {
            content_encoding: result
                .attributes
                .get(&Attribute::ContentEncoding)
                .map(|v| v.to_string()),
            content_type: result
                .attributes
                .get(&Attribute::ContentType)
                .map(|v| v.to_string()),
        };

        let data = result.bytes().await.map_err(|e| {
            ConnectorError::Storage(format!("read {}/{}: {}", bucket, key, e))
        })?;

        debug!(bucket, key, bytes = data.len(), "Fetched object");
        Ok(Some(Blob { data, hints }))
    }
}
