//! S3 object store for state storage

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::ServerSideEncryption;

use super::object_store::{
    DEFAULT_ROOT, ObjectResult, ObjectStore, ObjectStoreBackend, ObjectStoreError, PutCondition,
    StoredObject,
};
use crate::backend::{BackendConfig, BackendError, BackendResult, TerraformBackend};

/// S3-based object store
pub struct S3ObjectStore {
    /// S3 client
    client: Client,
    /// Bucket name
    bucket: String,
    /// Whether to encrypt stored objects (default: true)
    encrypt: bool,
}

impl S3ObjectStore {
    pub fn new(client: Client, bucket: impl Into<String>, encrypt: bool) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            encrypt,
        }
    }

    /// Get the bucket name
    pub fn bucket_name(&self) -> &str {
        &self.bucket
    }
}

impl ObjectStoreBackend<S3ObjectStore> {
    /// Create an S3-backed state backend from configuration
    ///
    /// Attributes: `bucket` and `region` (required), `root`, `encrypt`
    /// (default: true) and `endpoint` for S3-compatible stores.
    pub async fn from_config(config: &BackendConfig) -> BackendResult<Self> {
        let bucket = config.require_string("bucket")?.to_string();
        let region = config.require_string("region")?.to_string();
        let root = config.get_string("root").unwrap_or(DEFAULT_ROOT).to_string();
        let encrypt = config.get_bool_or("encrypt", true);
        let endpoint = config.get_string("endpoint").map(str::to_string);

        if bucket.is_empty() {
            return Err(BackendError::configuration("Attribute bucket must not be empty"));
        }

        // Load AWS config with the specified region
        let aws_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(region.clone()))
            .load()
            .await;

        let client = match &endpoint {
            Some(url) => {
                let s3_config = aws_sdk_s3::config::Builder::from(&aws_config)
                    .endpoint_url(url)
                    .force_path_style(true)
                    .build();
                Client::from_conf(s3_config)
            }
            None => Client::new(&aws_config),
        };

        log::debug!("Using S3 state bucket {} ({}), root {}", bucket, region, root);

        let engine = engine_backend(&bucket, &region, encrypt, endpoint.as_deref());
        Ok(Self::new(
            S3ObjectStore::new(client, bucket, encrypt),
            root,
            engine,
        ))
    }
}

/// Engine `s3` backend settings pointing at the same bucket
fn engine_backend(
    bucket: &str,
    region: &str,
    encrypt: bool,
    endpoint: Option<&str>,
) -> TerraformBackend {
    let mut config = serde_json::json!({
        "bucket": bucket,
        "region": region,
        "encrypt": encrypt,
    });
    if let (Some(url), Some(map)) = (endpoint, config.as_object_mut()) {
        map.insert("endpoints".to_string(), serde_json::json!({ "s3": url }));
        map.insert("use_path_style".to_string(), serde_json::Value::Bool(true));
    }

    TerraformBackend {
        provider: "s3".to_string(),
        config,
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn get(&self, key: &str) -> ObjectResult<StoredObject> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(output) => {
                let etag = output.e_tag().map(str::to_string);
                let body = output
                    .body
                    .collect()
                    .await
                    .map_err(|e| ObjectStoreError::Request(e.to_string()))?;
                Ok(StoredObject {
                    body: body.into_bytes().to_vec(),
                    etag,
                })
            }
            Err(err) => {
                let no_such_key = err
                    .as_service_error()
                    .is_some_and(|e| e.is_no_such_key());
                if no_such_key || is_not_found_error(&err) {
                    Err(ObjectStoreError::NotFound(key.to_string()))
                } else {
                    Err(ObjectStoreError::Request(err.to_string()))
                }
            }
        }
    }

    async fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        condition: PutCondition,
    ) -> ObjectResult<Option<String>> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type("application/json");

        if self.encrypt {
            request = request.server_side_encryption(ServerSideEncryption::Aes256);
        }

        request = match condition {
            PutCondition::None => request,
            PutCondition::IfAbsent => request.if_none_match("*"),
            PutCondition::IfMatch(etag) => request.if_match(etag),
        };

        match request.send().await {
            Ok(output) => Ok(output.e_tag().map(str::to_string)),
            Err(err) if is_precondition_error(&err) => {
                Err(ObjectStoreError::PreconditionFailed(key.to_string()))
            }
            Err(err) => Err(ObjectStoreError::Request(err.to_string())),
        }
    }

    async fn delete(&self, key: &str) -> ObjectResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| ObjectStoreError::Request(e.to_string()))?;

        Ok(())
    }

    async fn list_children(&self, prefix: &str) -> ObjectResult<Vec<String>> {
        let mut children = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let output = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .delimiter("/")
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| ObjectStoreError::Request(e.to_string()))?;

            children.extend(
                output
                    .common_prefixes()
                    .iter()
                    .filter_map(|p| p.prefix())
                    .filter_map(|p| child_name(prefix, p)),
            );

            match output.next_continuation_token() {
                Some(token) if output.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        children.sort();
        Ok(children)
    }
}

/// Turn a common prefix like `root/name/` into `name`
fn child_name(parent: &str, common_prefix: &str) -> Option<String> {
    let name = common_prefix.strip_prefix(parent)?.trim_end_matches('/');
    (!name.is_empty()).then(|| name.to_string())
}

fn response_status<E>(err: &SdkError<E>) -> Option<u16> {
    err.raw_response().map(|raw| raw.status().as_u16())
}

/// Check if an S3 error means the object key does not exist
///
/// A missing bucket is also a 404 but is reported as a request failure.
fn is_not_found_error<E: ProvideErrorMetadata>(err: &SdkError<E>) -> bool {
    let code = err.as_service_error().and_then(|e| e.code());
    is_missing_key(response_status(err), code)
}

fn is_missing_key(status: Option<u16>, code: Option<&str>) -> bool {
    match code {
        Some("NoSuchKey") => true,
        Some(_) => false,
        None => status == Some(404),
    }
}

/// Check if an S3 error means a conditional write lost
///
/// 412 is a failed `If-Match`/`If-None-Match`; 409 is S3's
/// ConditionalRequestConflict for a racing conditional write.
fn is_precondition_error<E>(err: &SdkError<E>) -> bool {
    is_precondition_status(response_status(err))
}

fn is_precondition_status(status: Option<u16>) -> bool {
    matches!(status, Some(409) | Some(412))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_child_name() {
        assert_eq!(
            child_name("cluster-managers/", "cluster-managers/prod/"),
            Some("prod".to_string())
        );
        assert_eq!(child_name("cluster-managers/", "cluster-managers/"), None);
        assert_eq!(child_name("cluster-managers/", "other/prod/"), None);
    }

    #[test]
    fn test_precondition_status() {
        assert!(is_precondition_status(Some(412)));
        assert!(is_precondition_status(Some(409)));
        assert!(!is_precondition_status(Some(404)));
        assert!(!is_precondition_status(None));
    }

    #[test]
    fn test_missing_key_classification() {
        assert!(is_missing_key(Some(404), Some("NoSuchKey")));
        assert!(is_missing_key(Some(404), None));
        assert!(!is_missing_key(Some(404), Some("NoSuchBucket")));
        assert!(!is_missing_key(Some(403), Some("AccessDenied")));
        assert!(!is_missing_key(None, None));
    }

    #[test]
    fn test_engine_backend() {
        let engine = engine_backend("states", "eu-west-1", true, None);
        assert_eq!(engine.provider, "s3");
        assert_eq!(
            engine.config,
            json!({"bucket": "states", "region": "eu-west-1", "encrypt": true})
        );

        let engine = engine_backend("states", "us-east-1", false, Some("http://minio:9000"));
        assert_eq!(engine.config["endpoints"]["s3"], "http://minio:9000");
        assert_eq!(engine.config["use_path_style"], true);
    }

    #[tokio::test]
    async fn test_from_config_requires_bucket_and_region() {
        let config = BackendConfig::new("s3").with_attribute("region", json!("eu-west-1"));
        let err = ObjectStoreBackend::<S3ObjectStore>::from_config(&config).await.err().unwrap();
        assert_eq!(
            err.to_string(),
            "Backend configuration error: Missing required attribute: bucket"
        );

        let config = BackendConfig::new("s3").with_attribute("bucket", json!("states"));
        let err = ObjectStoreBackend::<S3ObjectStore>::from_config(&config).await.err().unwrap();
        assert!(matches!(err, BackendError::Configuration(_)));
    }
}
