// dbshuttle/src/s3/mod.rs
use aws_sdk_s3 as s3;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use regex::Regex;
use s3::config::Region;
use s3::error::SdkError;
use s3::primitives::ByteStream;
use s3::types::{CompletedMultipartUpload, CompletedPart};
use std::path::Path;
use std::sync::OnceLock;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc::Sender;
use url::Url;

use crate::config::{SpacesConfig, TargetDescriptor};
use crate::errors::{AppError, Result};
use crate::progress::ProgressHandle;

/// Part size for multipart uploads; 5 MiB is the smallest the store accepts
/// for any part but the last.
const PART_SIZE: usize = 5 * 1024 * 1024;

/// One object-store entry from a listing. Immutable once constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferDescriptor {
    pub key: String,
    pub last_modified: DateTime<Utc>,
    pub size_bytes: i64,
    pub display_name: String,
}

/// Streaming client for an S3-compatible object storage service (like
/// DigitalOcean Spaces).
pub struct SpacesClient {
    client: s3::Client,
    bucket: String,
    folder_prefix: Option<String>,
}

impl SpacesClient {
    pub async fn connect(spaces_config: &SpacesConfig) -> Self {
        let sdk_config = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .endpoint_url(&spaces_config.endpoint_url)
            .region(Region::new(spaces_config.region.clone()))
            .credentials_provider(s3::config::Credentials::new(
                &spaces_config.access_key_id,
                &spaces_config.secret_access_key,
                None, // session_token
                None, // expiry
                "Static",
            ))
            .load()
            .await;

        SpacesClient {
            client: s3::Client::new(&sdk_config),
            bucket: spaces_config.bucket_name.clone(),
            folder_prefix: spaces_config.folder_prefix.clone(),
        }
    }

    /// Targets a different bucket than the configured one, e.g. when the
    /// restore source is a full `s3://bucket/key` URI.
    pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = bucket.into();
        self
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Prepends the configured folder prefix to a file name.
    pub fn object_key(&self, file_name: &str) -> String {
        match &self.folder_prefix {
            Some(prefix) => format!("{}/{}", prefix.trim_end_matches('/'), file_name),
            None => file_name.to_string(),
        }
    }

    /// Streams a local file to the store as a multipart upload so payloads
    /// of any size never need buffering whole. A progress sample is emitted
    /// per part and the 100% sample is delivered before this returns.
    ///
    /// No retries here: a failed part aborts the multipart upload and fails
    /// the run, and any retry policy belongs to the caller.
    pub async fn upload(
        &self,
        file_path: &Path,
        key: &str,
        size_hint: u64,
        progress: &ProgressHandle,
    ) -> Result<u64> {
        println!(
            "Uploading {} to bucket {} as {}",
            file_path.display(),
            self.bucket,
            key
        );
        progress.report(0, Some(size_hint)).await;

        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                AppError::Transfer(format!("Failed to initiate multipart upload for {}: {}", key, e))
            })?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| {
                AppError::Transfer(format!("No upload id returned for multipart upload of {}", key))
            })?
            .to_string();

        let file = tokio::fs::File::open(file_path).await?;
        let mut reader = tokio::io::BufReader::new(file);
        let mut part_number = 1i32;
        let mut completed_parts = Vec::new();
        let mut uploaded = 0u64;

        loop {
            let mut buffer = vec![0u8; PART_SIZE];
            let mut filled = 0usize;
            while filled < PART_SIZE {
                let n = reader.read(&mut buffer[filled..]).await?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled == 0 && part_number > 1 {
                break;
            }
            buffer.truncate(filled);

            match self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(&upload_id)
                .part_number(part_number)
                .body(ByteStream::from(buffer))
                .send()
                .await
            {
                Ok(part) => {
                    completed_parts.push(
                        CompletedPart::builder()
                            .part_number(part_number)
                            .e_tag(part.e_tag().unwrap_or_default())
                            .build(),
                    );
                }
                Err(e) => {
                    // Abort so orphaned parts do not accumulate; its own
                    // outcome must not mask the upload error.
                    let _ = self
                        .client
                        .abort_multipart_upload()
                        .bucket(&self.bucket)
                        .key(key)
                        .upload_id(&upload_id)
                        .send()
                        .await;
                    return Err(AppError::Transfer(format!(
                        "Part {} upload failed for {}: {}",
                        part_number, key, e
                    )));
                }
            }

            uploaded += filled as u64;
            progress.report(uploaded, Some(size_hint)).await;
            if filled < PART_SIZE {
                break;
            }
            part_number += 1;
        }

        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();
        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(&upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| {
                AppError::Transfer(format!("Failed to complete multipart upload for {}: {}", key, e))
            })?;

        progress.complete(size_hint.max(uploaded)).await;
        println!("✓ Uploaded {} bytes to bucket {} as {}", uploaded, self.bucket, key);
        Ok(uploaded)
    }

    /// Probes the object's size, then streams its body into `tx` chunk by
    /// chunk, reporting progress against the known total.
    pub async fn download(
        &self,
        key: &str,
        tx: Sender<Bytes>,
        progress: &ProgressHandle,
    ) -> Result<u64> {
        let head = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| AppError::Transfer(format!("Failed to probe object {}: {}", key, e)))?;
        let total = head.content_length().unwrap_or(0).max(0) as u64;
        println!(
            "Downloading s3://{}/{} ({} bytes)",
            self.bucket, key, total
        );
        progress.report(0, Some(total)).await;

        let object = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| AppError::Transfer(format!("Failed to get object {}: {}", key, e)))?;

        let mut body = object.body;
        let mut downloaded = 0u64;
        loop {
            let chunk = body.try_next().await.map_err(|e| {
                AppError::Transfer(format!("Failed while streaming object {}: {}", key, e))
            })?;
            let Some(chunk) = chunk else { break };
            downloaded += chunk.len() as u64;
            if tx.send(chunk).await.is_err() {
                return Ok(downloaded);
            }
            progress.report(downloaded, Some(total)).await;
        }

        progress.complete(total.max(downloaded)).await;
        Ok(downloaded)
    }

    /// Whether an object exists. A not-found answer (the modeled error or
    /// a bare 404 status) is `false`; anything else is a transfer failure.
    pub async fn exists(&self, key: &str) -> Result<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) => {
                if let SdkError::ServiceError(service_err) = &err {
                    if service_err.err().is_not_found()
                        || service_err.raw().status().as_u16() == 404
                    {
                        return Ok(false);
                    }
                }
                Err(AppError::Transfer(format!(
                    "Existence check for {} failed: {}",
                    key, err
                )))
            }
        }
    }

    /// Lists entries whose key ends with `suffix`, most recent first.
    pub async fn list(&self, suffix: &str) -> Result<Vec<TransferDescriptor>> {
        let mut entries: Vec<(String, DateTime<Utc>, i64)> = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let mut request = self.client.list_objects_v2().bucket(&self.bucket);
            if let Some(prefix) = &self.folder_prefix {
                request = request.prefix(format!("{}/", prefix.trim_end_matches('/')));
            }
            if let Some(token) = &continuation {
                request = request.continuation_token(token);
            }
            let response = request
                .send()
                .await
                .map_err(|e| AppError::Transfer(format!("Failed to list objects: {}", e)))?;

            for object in response.contents() {
                let Some(key) = object.key() else { continue };
                let last_modified = object
                    .last_modified()
                    .and_then(|t| DateTime::<Utc>::from_timestamp(t.secs(), t.subsec_nanos()))
                    .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
                entries.push((key.to_string(), last_modified, object.size().unwrap_or(0)));
            }

            match response.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }
        Ok(collect_descriptors(entries, suffix))
    }
}

/// Filters listing entries by key suffix and orders them newest first.
fn collect_descriptors(
    entries: Vec<(String, DateTime<Utc>, i64)>,
    suffix: &str,
) -> Vec<TransferDescriptor> {
    let mut descriptors: Vec<TransferDescriptor> = entries
        .into_iter()
        .filter(|(key, _, _)| key.ends_with(suffix))
        .map(|(key, last_modified, size_bytes)| TransferDescriptor {
            display_name: display_name(&key),
            key,
            last_modified,
            size_bytes,
        })
        .collect();
    descriptors.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));
    descriptors
}

/// Builds the storage key for a backup. The shape is load-bearing: existing
/// listings parse it back, so it must stay bit-for-bit stable.
pub fn backup_key(target: &TargetDescriptor, now: DateTime<Utc>) -> String {
    let timestamp = now
        .format("%Y-%m-%dT%H:%M:%S%.3fZ")
        .to_string()
        .replace([':', '.'], "-");
    format!("{}-{}.sql.gz", target.key_name(), timestamp)
}

static DISPLAY_NAME_RE: OnceLock<Regex> = OnceLock::new();

/// Human-readable name for a backup key.
///
/// `mydb-2023-12-01T10-30-00-000Z.sql.gz` becomes
/// `mydb (2023-12-01 10:30:00)`; any key that does not match the shape is
/// returned unchanged, reduced to its last path segment.
pub fn display_name(key: &str) -> String {
    let file_name = key.rsplit('/').next().unwrap_or(key);
    let re = DISPLAY_NAME_RE.get_or_init(|| {
        Regex::new(
            r"^(?P<name>.+)-(?P<date>\d{4}-\d{2}-\d{2})T(?P<h>\d{2})-(?P<m>\d{2})-(?P<s>\d{2})-\d{3}Z\.sql\.gz$",
        )
        .expect("display name pattern")
    });
    match re.captures(file_name) {
        Some(caps) => format!(
            "{} ({} {}:{}:{})",
            &caps["name"], &caps["date"], &caps["h"], &caps["m"], &caps["s"]
        ),
        None => file_name.to_string(),
    }
}

/// Parses an S3 URI (s3://bucket/key) into bucket and key.
pub fn parse_s3_uri(s3_uri: &str) -> Result<(String, String)> {
    let uri = Url::parse(s3_uri)?;
    if uri.scheme() != "s3" {
        return Err(AppError::Config("S3 URI must start with s3://".to_string()));
    }
    let bucket = uri
        .host_str()
        .ok_or_else(|| AppError::Config("S3 URI missing bucket name".to_string()))?
        .to_string();
    let key = uri.path().trim_start_matches('/').to_string();
    if key.is_empty() {
        return Err(AppError::Config(
            "S3 URI missing key (object path)".to_string(),
        ));
    }
    Ok((bucket, key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn display_name_extracts_database_and_timestamp() {
        assert_eq!(
            display_name("mydb-2023-12-01T10-30-00-000Z.sql.gz"),
            "mydb (2023-12-01 10:30:00)"
        );
    }

    #[test]
    fn display_name_passes_unrecognized_keys_through() {
        assert_eq!(display_name("custom-backup.sql.gz"), "custom-backup.sql.gz");
    }

    #[test]
    fn display_name_uses_the_last_path_segment() {
        assert_eq!(
            display_name("nightly/mydb-2023-12-01T10-30-00-000Z.sql.gz"),
            "mydb (2023-12-01 10:30:00)"
        );
        assert_eq!(display_name("nightly/custom-backup.sql.gz"), "custom-backup.sql.gz");
    }

    #[test]
    fn display_name_handles_dashed_database_names() {
        assert_eq!(
            display_name("app-billing-2024-02-29T23-59-59-999Z.sql.gz"),
            "app-billing (2024-02-29 23:59:59)"
        );
    }

    #[test]
    fn backup_key_shape_is_stable() {
        let now = Utc.with_ymd_and_hms(2023, 12, 1, 10, 30, 0).unwrap();
        assert_eq!(
            backup_key(&TargetDescriptor::Single("mydb".to_string()), now),
            "mydb-2023-12-01T10-30-00-000Z.sql.gz"
        );
        assert_eq!(
            backup_key(
                &TargetDescriptor::Schemas(vec!["app".to_string(), "billing".to_string()]),
                now
            ),
            "app-billing-2023-12-01T10-30-00-000Z.sql.gz"
        );
        assert_eq!(
            backup_key(&TargetDescriptor::All, now),
            "all-2023-12-01T10-30-00-000Z.sql.gz"
        );
    }

    #[test]
    fn backup_keys_round_trip_through_display_name() {
        let now = Utc.with_ymd_and_hms(2024, 6, 15, 8, 5, 42).unwrap();
        let key = backup_key(&TargetDescriptor::Single("sessions".to_string()), now);
        assert_eq!(display_name(&key), "sessions (2024-06-15 08:05:42)");
    }

    #[test]
    fn listing_filters_by_suffix_and_sorts_newest_first() {
        let t1 = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap();
        let entries = vec![
            ("a-2023-01-01T00-00-00-000Z.sql.gz".to_string(), t1, 10),
            ("b-2023-06-01T00-00-00-000Z.sql.gz".to_string(), t2, 20),
            ("notes.txt".to_string(), t2, 5),
        ];
        let descriptors = collect_descriptors(entries, ".sql.gz");
        let keys: Vec<&str> = descriptors.iter().map(|d| d.key.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                "b-2023-06-01T00-00-00-000Z.sql.gz",
                "a-2023-01-01T00-00-00-000Z.sql.gz"
            ]
        );
    }

    #[test]
    fn listing_with_no_matches_is_empty() {
        let t = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
        let entries = vec![("notes.txt".to_string(), t, 5)];
        assert!(collect_descriptors(entries, ".sql.gz").is_empty());
    }

    #[test]
    fn parses_s3_uris() {
        let (bucket, key) = parse_s3_uri("s3://backups/nightly/app.sql.gz").unwrap();
        assert_eq!(bucket, "backups");
        assert_eq!(key, "nightly/app.sql.gz");
    }

    #[test]
    fn rejects_non_s3_uris_and_missing_keys() {
        assert!(parse_s3_uri("https://backups/app.sql.gz").is_err());
        assert!(parse_s3_uri("s3://backups").is_err());
    }
}
