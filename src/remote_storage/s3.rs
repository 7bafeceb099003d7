use std::collections::HashMap;
use std::env;

use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::types::Delete;
use aws_sdk_s3::types::ObjectIdentifier;
use aws_sdk_s3::Client;
use sha2::Digest;
use sha2::Sha256;
use tracing::debug;
use tracing::info;

use crate::errors::ConfigError;
use crate::errors::StorageError;
use crate::remote_storage::BucketOverrides;
use crate::remote_storage::MockS3Server;
use crate::remote_storage::RemoteStorageUser;
use crate::Result;

/// Bucket names cap at 63 characters.
const MAX_BUCKET_NAME_LEN: usize = 63;
/// S3 DeleteObjects accepts at most this many keys per request.
const MAX_KEYS_PER_DELETE: usize = 1000;

const BUCKET_ENV: &str = "REMOTE_STORAGE_S3_BUCKET";
const REGION_ENV: &str = "REMOTE_STORAGE_S3_REGION";

/// Object-store backend, covering both the worker-local mock server and a
/// real bucket shared across CI runs.
///
/// Mock runs get a bucket of their own; real runs share one bucket and are
/// isolated by a run-unique key prefix instead.
#[derive(Debug, Clone)]
pub struct S3Storage {
    pub bucket_name: String,
    pub bucket_region: String,
    pub prefix_in_bucket: Option<String>,
    pub endpoint: Option<String>,
    /// Whether [`S3Storage::do_cleanup`] actually deletes anything
    pub cleanup: bool,
    /// True when backed by a real bucket rather than the mock server
    pub real: bool,
    access_key: Option<String>,
    secret_key: Option<String>,
    session_token: Option<String>,
    aws_profile: Option<String>,
    client: Client,
}

/// Derive a valid bucket name from a test identifier.
///
/// Lowercased with every non-alphanumeric run collapsed to a single dash.
/// Identifiers longer than the 63-character cap keep a 30-character prefix
/// for readability plus a 32-hex-digit digest of the full identifier for
/// uniqueness.
pub fn to_bucket_name(ident: &str) -> String {
    let mut sanitized = String::with_capacity(ident.len());
    let mut last_dash = false;
    for ch in ident.chars() {
        if ch.is_ascii_alphanumeric() {
            sanitized.extend(ch.to_lowercase());
            last_dash = false;
        } else if !last_dash {
            sanitized.push('-');
            last_dash = true;
        }
    }
    let sanitized = sanitized.trim_matches('-').to_owned();

    if sanitized.len() <= MAX_BUCKET_NAME_LEN {
        return sanitized;
    }
    let digest = Sha256::digest(ident.as_bytes());
    let mut hex = String::with_capacity(32);
    for byte in digest.iter().take(16) {
        hex.push_str(&format!("{byte:02x}"));
    }
    format!("{}-{hex}", &sanitized[..30])
}

impl S3Storage {
    /// Backend against the worker's mock server: provisions a fresh bucket
    /// named after the test, path-style addressing, static test credentials.
    pub async fn mock(
        server: &MockS3Server,
        user: RemoteStorageUser,
        test_ident: &str,
    ) -> Result<Self> {
        let bucket_name = to_bucket_name(&format!("{user}-{test_ident}"));
        let endpoint = server.endpoint();
        let credentials = Credentials::new(
            server.access_key(),
            server.secret_key(),
            None,
            None,
            "mock-object-store",
        );
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(server.region().to_owned()))
            .endpoint_url(&endpoint)
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();
        let client = Client::from_conf(config);

        info!("Creating mock bucket {bucket_name} at {endpoint}");
        client
            .create_bucket()
            .bucket(&bucket_name)
            .send()
            .await
            .map_err(|e| StorageError::ObjectStore(format!("create bucket {bucket_name}: {e}")))?;

        Ok(Self {
            bucket_name,
            bucket_region: server.region().to_owned(),
            prefix_in_bucket: Some(user.as_str().to_owned()),
            endpoint: Some(endpoint),
            cleanup: false,
            real: false,
            access_key: Some(server.access_key().to_owned()),
            secret_key: Some(server.secret_key().to_owned()),
            session_token: None,
            aws_profile: None,
            client,
        })
    }

    /// Backend against a real shared bucket, isolated by a run-unique key
    /// prefix. Credentials come from `AWS_PROFILE` or the static key pair in
    /// the environment.
    pub async fn real(
        run_id: &str,
        test_ident: &str,
        user: RemoteStorageUser,
        overrides: Option<BucketOverrides>,
    ) -> Result<Self> {
        let overrides = overrides.unwrap_or_default();
        let bucket_name = match overrides.bucket_name.or_else(|| env_non_empty(BUCKET_ENV)) {
            Some(name) => name,
            None => {
                return Err(ConfigError::MissingCredentials(format!(
                    "{BUCKET_ENV} must name the shared test bucket"
                ))
                .into())
            }
        };
        let bucket_region = match overrides.bucket_region.or_else(|| env_non_empty(REGION_ENV)) {
            Some(region) => region,
            None => {
                return Err(ConfigError::MissingCredentials(format!(
                    "{REGION_ENV} must name the bucket region"
                ))
                .into())
            }
        };

        let aws_profile = env_non_empty("AWS_PROFILE");
        let access_key = env_non_empty("AWS_ACCESS_KEY_ID");
        let secret_key = env_non_empty("AWS_SECRET_ACCESS_KEY");
        let session_token = env_non_empty("AWS_SESSION_TOKEN");
        if aws_profile.is_none() && (access_key.is_none() || secret_key.is_none()) {
            return Err(ConfigError::MissingCredentials(
                "set AWS_PROFILE or the AWS_ACCESS_KEY_ID/AWS_SECRET_ACCESS_KEY pair".to_owned(),
            )
            .into());
        }

        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(bucket_region.clone()))
            .load()
            .await;
        let client = Client::new(&sdk_config);

        let prefix = format!("{run_id}/{}/{user}", to_bucket_name(test_ident));
        Ok(Self {
            bucket_name,
            bucket_region,
            prefix_in_bucket: Some(prefix),
            endpoint: None,
            cleanup: true,
            real: true,
            access_key,
            secret_key,
            session_token,
            aws_profile,
            client,
        })
    }

    pub fn with_cleanup(mut self, cleanup: bool) -> Self {
        self.cleanup = cleanup;
        self
    }

    /// Credential variables to forward to tools that open their own client,
    /// such as the metadata scrubber.
    pub fn access_env_vars(&self) -> HashMap<String, String> {
        let mut vars = HashMap::new();
        if let Some(profile) = &self.aws_profile {
            vars.insert("AWS_PROFILE".to_owned(), profile.clone());
            return vars;
        }
        if let Some(key) = &self.access_key {
            vars.insert("AWS_ACCESS_KEY_ID".to_owned(), key.clone());
        }
        if let Some(secret) = &self.secret_key {
            vars.insert("AWS_SECRET_ACCESS_KEY".to_owned(), secret.clone());
        }
        if let Some(token) = &self.session_token {
            vars.insert("AWS_SESSION_TOKEN".to_owned(), token.clone());
        }
        vars
    }

    pub fn to_toml_inline_table(&self) -> String {
        let mut fields = vec![
            format!("bucket_name = \"{}\"", self.bucket_name),
            format!("bucket_region = \"{}\"", self.bucket_region),
        ];
        if let Some(prefix) = &self.prefix_in_bucket {
            fields.push(format!("prefix_in_bucket = \"{prefix}\""));
        }
        if let Some(endpoint) = &self.endpoint {
            fields.push(format!("endpoint = \"{endpoint}\""));
        }
        format!("{{ {} }}", fields.join(", "))
    }

    /// Delete everything under this backend's prefix, paginating the listing
    /// and batching deletes at the API's per-request cap.
    pub async fn do_cleanup(&self) -> Result<()> {
        if !self.cleanup {
            debug!(
                "Keeping bucket {} (cleanup disabled) for inspection",
                self.bucket_name
            );
            return Ok(());
        }
        info!(
            "Removing bucket content: {}/{}",
            self.bucket_name,
            self.prefix_in_bucket.as_deref().unwrap_or("")
        );

        let mut continuation_token: Option<String> = None;
        let mut deleted = 0usize;
        loop {
            let mut request = self.client.list_objects_v2().bucket(&self.bucket_name);
            if let Some(prefix) = &self.prefix_in_bucket {
                request = request.prefix(prefix);
            }
            if let Some(token) = &continuation_token {
                request = request.continuation_token(token);
            }
            let page = request
                .send()
                .await
                .map_err(|e| StorageError::ObjectStore(format!("list objects: {e}")))?;

            let mut identifiers = Vec::new();
            for object in page.contents() {
                if let Some(key) = object.key() {
                    let identifier = ObjectIdentifier::builder()
                        .key(key)
                        .build()
                        .map_err(|e| StorageError::ObjectStore(format!("object key: {e}")))?;
                    identifiers.push(identifier);
                }
            }
            deleted += identifiers.len();

            for chunk in identifiers.chunks(MAX_KEYS_PER_DELETE) {
                let delete = Delete::builder()
                    .set_objects(Some(chunk.to_vec()))
                    .build()
                    .map_err(|e| StorageError::ObjectStore(format!("delete batch: {e}")))?;
                self.client
                    .delete_objects()
                    .bucket(&self.bucket_name)
                    .delete(delete)
                    .send()
                    .await
                    .map_err(|e| StorageError::ObjectStore(format!("delete objects: {e}")))?;
            }

            if page.is_truncated() == Some(true) {
                continuation_token = page.next_continuation_token().map(str::to_owned);
            } else {
                break;
            }
        }
        debug!("Deleted {deleted} objects from {}", self.bucket_name);
        Ok(())
    }
}

fn env_non_empty(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

#[cfg(test)]
mod s3_test {
    use super::*;

    #[test]
    fn short_idents_pass_through_sanitized() {
        assert_eq!(to_bucket_name("Storage-test_simple[42]"), "storage-test-simple-42");
    }

    #[test]
    fn collapses_symbol_runs_and_trims_edges() {
        assert_eq!(to_bucket_name("__a//b..c__"), "a-b-c");
    }

    #[test]
    fn long_idents_truncate_to_the_cap() {
        let ident = "storage-test_remote_storage_backup_and_restore[real_s3-release-pg16]";
        let name = to_bucket_name(ident);
        assert_eq!(name.len(), MAX_BUCKET_NAME_LEN);
        assert!(name.starts_with("storage-test-remote-storage-ba"));
        // prefix, dash, then a 32-hex-digit digest
        let digest = &name[31..];
        assert_eq!(digest.len(), 32);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn long_idents_differing_past_the_prefix_stay_distinct() {
        let a = to_bucket_name(&format!("{}-variant-one", "x".repeat(70)));
        let b = to_bucket_name(&format!("{}-variant-two", "x".repeat(70)));
        assert_ne!(a, b);
        assert_eq!(&a[..31], &b[..31]);
    }
}
