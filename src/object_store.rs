//! # Object Store
//!
//! A synchronous facade over whatever actually stores the bytes. The engine
//! above this trait never sees `async` — worker pools are plain OS threads
//! communicating over [`crossbeam_channel`], matching the blocking execution
//! model the rest of this crate assumes.
//!
//! [`S3ObjectStore`] is the production backend. It owns a small multi-thread
//! Tokio runtime purely as a bridge: every trait method does `rt.block_on`
//! around one `aws-sdk-s3` call and returns. No `async fn` crosses the trait
//! boundary.

use crate::error::{ObjectStoreError, Result};
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};

/// Backend-agnostic access to bucket and object operations.
///
/// Implemented by [`S3ObjectStore`] for production use and by
/// [`InMemoryObjectStore`] for tests that want to exercise the envoy without
/// a real bucket.
pub trait ObjectStore: Send + Sync {
    fn bucket_exists(&self, bucket: &str) -> Result<bool>;
    fn bucket_create(&self, bucket: &str) -> Result<()>;
    fn put_object(&self, bucket: &str, key: &str, data: Vec<u8>) -> Result<()>;
    fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>>;
    /// Returns object keys under `prefix`, sorted lexicographically by the
    /// backend (S3 `ListObjectsV2` already guarantees this).
    fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>>;
    fn delete_object(&self, bucket: &str, key: &str) -> Result<()>;
    fn delete_objects(&self, bucket: &str, keys: &[String]) -> Result<()> {
        for key in keys {
            self.delete_object(bucket, key)?;
        }
        Ok(())
    }
}

/// Connection parameters for an S3-compatible endpoint.
pub struct S3Config {
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub max_attempts: u32,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            access_key: String::new(),
            secret_key: String::new(),
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(10),
            max_attempts: 2,
        }
    }
}

/// Production [`ObjectStore`] backed by an S3-compatible service.
pub struct S3ObjectStore {
    client: Client,
    runtime: Runtime,
}

impl S3ObjectStore {
    pub fn new(config: S3Config) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .map_err(|e| ObjectStoreError::Backend(e.to_string()))?;

        let endpoint = if config.endpoint.contains("://") {
            config.endpoint.clone()
        } else {
            format!("https://{}", config.endpoint)
        };

        let credentials = Credentials::new(
            &config.access_key,
            &config.secret_key,
            None,
            None,
            "spare-static",
        );

        let sdk_config = runtime.block_on(
            aws_config::defaults(aws_config::BehaviorVersion::latest())
                .region(Region::new("us-east-1"))
                .endpoint_url(&endpoint)
                .credentials_provider(credentials)
                .load(),
        );

        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(true)
            .retry_config(
                aws_sdk_s3::config::retry::RetryConfig::standard()
                    .with_max_attempts(config.max_attempts),
            )
            .build();

        Ok(Self {
            client: Client::from_conf(s3_config),
            runtime,
        })
    }
}

impl ObjectStore for S3ObjectStore {
    fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        use aws_sdk_s3::operation::head_bucket::HeadBucketError;

        self.runtime.block_on(async {
            match self.client.head_bucket().bucket(bucket).send().await {
                Ok(_) => Ok(true),
                Err(aws_sdk_s3::error::SdkError::ServiceError(e))
                    if matches!(e.err(), HeadBucketError::NotFound(_)) =>
                {
                    Ok(false)
                }
                Err(err) => Err(ObjectStoreError::Backend(err.to_string()).into()),
            }
        })
    }

    fn bucket_create(&self, bucket: &str) -> Result<()> {
        self.runtime.block_on(async {
            self.client
                .create_bucket()
                .bucket(bucket)
                .send()
                .await
                .map_err(|e| ObjectStoreError::Backend(e.to_string()))?;
            Ok(())
        })
    }

    fn put_object(&self, bucket: &str, key: &str, data: Vec<u8>) -> Result<()> {
        self.runtime.block_on(async {
            self.client
                .put_object()
                .bucket(bucket)
                .key(key)
                .body(ByteStream::from(data))
                .send()
                .await
                .map_err(|e| ObjectStoreError::Backend(e.to_string()))?;
            Ok(())
        })
    }

    fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        use aws_sdk_s3::operation::get_object::GetObjectError;

        self.runtime.block_on(async {
            let output = self
                .client
                .get_object()
                .bucket(bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| match &e {
                    aws_sdk_s3::error::SdkError::ServiceError(se)
                        if matches!(se.err(), GetObjectError::NoSuchKey(_)) =>
                    {
                        ObjectStoreError::NoSuchKey(key.to_string())
                    }
                    _ => ObjectStoreError::Backend(e.to_string()),
                })?;

            let bytes = output
                .body
                .collect()
                .await
                .map_err(|e| ObjectStoreError::Backend(e.to_string()))?;
            Ok(bytes.into_bytes().to_vec())
        })
    }

    fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        self.runtime.block_on(async {
            let mut keys = Vec::new();
            let mut continuation: Option<String> = None;

            loop {
                let mut req = self
                    .client
                    .list_objects_v2()
                    .bucket(bucket)
                    .prefix(prefix);
                if let Some(token) = &continuation {
                    req = req.continuation_token(token);
                }

                let output = req
                    .send()
                    .await
                    .map_err(|e| ObjectStoreError::Backend(e.to_string()))?;

                for object in output.contents() {
                    if let Some(key) = object.key() {
                        keys.push(key.to_string());
                    }
                }

                match output.next_continuation_token() {
                    Some(token) => continuation = Some(token.to_string()),
                    None => break,
                }
            }

            Ok(keys)
        })
    }

    fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        self.runtime.block_on(async {
            self.client
                .delete_object()
                .bucket(bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| ObjectStoreError::Backend(e.to_string()))?;
            Ok(())
        })
    }
}

/// In-memory [`ObjectStore`] test double. Mirrors the `moto`-backed fixture
/// the original test suite used, minus the network.
#[cfg(test)]
pub mod memory {
    use super::*;
    use std::collections::{BTreeMap, HashSet};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct InMemoryObjectStore {
        buckets: Mutex<HashSet<String>>,
        objects: Mutex<BTreeMap<(String, String), Vec<u8>>>,
    }

    impl InMemoryObjectStore {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl ObjectStore for InMemoryObjectStore {
        fn bucket_exists(&self, bucket: &str) -> Result<bool> {
            Ok(self.buckets.lock().unwrap().contains(bucket))
        }

        fn bucket_create(&self, bucket: &str) -> Result<()> {
            self.buckets.lock().unwrap().insert(bucket.to_string());
            Ok(())
        }

        fn put_object(&self, bucket: &str, key: &str, data: Vec<u8>) -> Result<()> {
            if !self.bucket_exists(bucket)? {
                return Err(ObjectStoreError::NoSuchBucket(bucket.to_string()).into());
            }
            self.objects
                .lock()
                .unwrap()
                .insert((bucket.to_string(), key.to_string()), data);
            Ok(())
        }

        fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
            self.objects
                .lock()
                .unwrap()
                .get(&(bucket.to_string(), key.to_string()))
                .cloned()
                .ok_or_else(|| ObjectStoreError::NoSuchKey(key.to_string()).into())
        }

        fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
            Ok(self
                .objects
                .lock()
                .unwrap()
                .keys()
                .filter(|(b, k)| b == bucket && k.starts_with(prefix))
                .map(|(_, k)| k.clone())
                .collect())
        }

        fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
            self.objects
                .lock()
                .unwrap()
                .remove(&(bucket.to_string(), key.to_string()));
            Ok(())
        }
    }

    #[test]
    fn put_then_get_roundtrips() {
        let store = InMemoryObjectStore::new();
        store.bucket_create("b").unwrap();
        store.put_object("b", "k", b"hello".to_vec()).unwrap();
        assert_eq!(store.get_object("b", "k").unwrap(), b"hello");
    }

    #[test]
    fn put_fails_on_missing_bucket() {
        let store = InMemoryObjectStore::new();
        assert!(store.put_object("missing", "k", vec![]).is_err());
    }

    #[test]
    fn list_filters_by_prefix() {
        let store = InMemoryObjectStore::new();
        store.bucket_create("b").unwrap();
        store.put_object("b", "a/1", vec![]).unwrap();
        store.put_object("b", "a/2", vec![]).unwrap();
        store.put_object("b", "z/1", vec![]).unwrap();

        let mut keys = store.list_objects("b", "a/").unwrap();
        keys.sort();
        assert_eq!(keys, vec!["a/1".to_string(), "a/2".to_string()]);
    }

    #[test]
    fn delete_removes_object() {
        let store = InMemoryObjectStore::new();
        store.bucket_create("b").unwrap();
        store.put_object("b", "k", vec![1]).unwrap();
        store.delete_object("b", "k").unwrap();
        assert!(store.get_object("b", "k").is_err());
    }
}
