use crate::{config::S3Settings, descriptor::read_object_key, errors::BenchError};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Method, StatusCode};
use sha2::{Digest, Sha256};
use std::{collections::BTreeMap, time::Duration};
use tracing::{debug, info};

type HmacSha256 = Hmac<Sha256>;

const SERVICE: &str = "s3";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketStatus {
    Exists,
    Missing,
}

/// The handful of object store calls needed to set up a run. None of them are part of the
/// timed measurement.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn head_bucket(&self, bucket: &str) -> anyhow::Result<BucketStatus>;

    async fn create_bucket(&self, bucket: &str) -> anyhow::Result<()>;

    async fn put_object(&self, bucket: &str, key: &str, body: Bytes) -> anyhow::Result<()>;
}

/// Minimal S3 client signing requests with AWS Signature V4. Buckets are addressed path-style
/// (`<endpoint>/<bucket>/<key>`), which MinIO and most self-hosted stores expect.
pub struct S3Client {
    http: reqwest::Client,
    endpoint: String,
    host: String,
    region: String,
    access_key: String,
    secret_key: String,
}

impl S3Client {
    pub fn new(s3: &S3Settings) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Unable to build HTTP client")?;

        Ok(S3Client {
            http,
            endpoint: s3.endpoint.trim_end_matches('/').to_string(),
            host: s3.host().trim_end_matches('/').to_string(),
            region: s3.region.clone(),
            access_key: s3.access_key.clone(),
            secret_key: s3.secret_key.clone(),
        })
    }

    /// Builds the `Authorization` header value for a request and adds the signed headers
    /// (`host`, `x-amz-date`, `x-amz-content-sha256`) to `headers`.
    fn sign_headers(
        &self,
        method: &Method,
        canonical_uri: &str,
        headers: &mut BTreeMap<String, String>,
        payload_hash: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<String> {
        let (amz_date, date_stamp) = amz_dates(now);
        headers.insert("host".to_string(), self.host.clone());
        headers.insert("x-amz-date".to_string(), amz_date.clone());
        headers.insert("x-amz-content-sha256".to_string(), payload_hash.to_string());

        let mut canonical_headers = String::new();
        for (key, val) in headers.iter() {
            canonical_headers.push_str(&format!("{}:{}\n", key.to_ascii_lowercase(), val.trim()));
        }
        let signed_headers = headers
            .keys()
            .map(|key| key.to_ascii_lowercase())
            .collect::<Vec<_>>()
            .join(";");

        let canonical_request = format!(
            "{}\n{}\n\n{}\n{}\n{}",
            method.as_str(),
            canonical_uri,
            canonical_headers,
            signed_headers,
            payload_hash
        );

        let credential_scope = format!("{}/{}/{}/aws4_request", date_stamp, self.region, SERVICE);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            sha256_hex(canonical_request.as_bytes())
        );
        let key = signing_key(&self.secret_key, &date_stamp, &self.region, SERVICE)?;
        let signature = hex_lower(&hmac_sha256(&key, string_to_sign.as_bytes())?);

        Ok(format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.access_key, credential_scope, signed_headers, signature
        ))
    }

    async fn send(
        &self,
        method: Method,
        canonical_uri: &str,
        body: Bytes,
        mut headers: BTreeMap<String, String>,
    ) -> anyhow::Result<reqwest::Response> {
        let payload_hash = sha256_hex(&body);
        headers.insert("content-length".to_string(), body.len().to_string());
        let auth = self.sign_headers(&method, canonical_uri, &mut headers, &payload_hash, Utc::now())?;

        let url = format!("{}{}", self.endpoint, canonical_uri);
        debug!("{} {}", method, url);

        let mut req = self
            .http
            .request(method, &url)
            .header("authorization", auth);
        for (key, val) in headers {
            req = req.header(key, val);
        }

        req.body(body)
            .send()
            .await
            .with_context(|| format!("Request to {} failed", url))
    }
}

#[async_trait]
impl ObjectStore for S3Client {
    async fn head_bucket(&self, bucket: &str) -> anyhow::Result<BucketStatus> {
        let resp = self
            .send(Method::HEAD, &bucket_uri(bucket), Bytes::new(), BTreeMap::new())
            .await?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        classify_head(status, &body)
    }

    async fn create_bucket(&self, bucket: &str) -> anyhow::Result<()> {
        let mut headers = BTreeMap::new();
        let body = if self.region == "us-east-1" {
            Bytes::new()
        } else {
            headers.insert("content-type".to_string(), "application/xml".to_string());
            Bytes::from(format!(
                "<CreateBucketConfiguration xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\">\
                 <LocationConstraint>{}</LocationConstraint></CreateBucketConfiguration>",
                self.region
            ))
        };

        let resp = self
            .send(Method::PUT, &bucket_uri(bucket), body, headers)
            .await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            Err(anyhow!("create bucket failed ({}): {}", status, text))
        }
    }

    async fn put_object(&self, bucket: &str, key: &str, body: Bytes) -> anyhow::Result<()> {
        let resp = self
            .send(Method::PUT, &object_uri(bucket, key), body, BTreeMap::new())
            .await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            Err(anyhow!("put object failed ({}): {}", status, text))
        }
    }
}

/// Maps a HEAD bucket response onto the bucket's state. Only a plain "not found" means the
/// bucket may be created, every other failure is a provisioning error.
fn classify_head(status: StatusCode, body: &str) -> anyhow::Result<BucketStatus> {
    if status.is_success() {
        Ok(BucketStatus::Exists)
    } else if status == StatusCode::NOT_FOUND || body.contains("<Code>NoSuchBucket</Code>") {
        Ok(BucketStatus::Missing)
    } else {
        Err(BenchError::Provisioning(format!("head bucket returned {}", status)).into())
    }
}

/// Makes sure the bucket exists, creating it when the store reports it missing.
pub async fn ensure_bucket_exists(store: &dyn ObjectStore, bucket: &str) -> anyhow::Result<()> {
    let status = store
        .head_bucket(bucket)
        .await
        .map_err(|err| provisioning_error(err, format!("Unable to look up bucket '{}'", bucket)))?;

    match status {
        BucketStatus::Exists => println!("Bucket '{}' already exists.", bucket),
        BucketStatus::Missing => {
            println!("Creating bucket '{}'...", bucket);
            store.create_bucket(bucket).await.map_err(|err| {
                provisioning_error(err, format!("Unable to create bucket '{}'", bucket))
            })?;
            println!("Bucket '{}' created.", bucket);
        }
    }

    Ok(())
}

/// Uploads the objects read by the read workload, keys `r/o0000` onwards.
///
/// # Arguments
///
/// * `store` - Where to upload.
/// * `bucket` - Target bucket, must already exist.
/// * `count` - Number of objects.
/// * `object_size` - Size of every object in bytes.
pub async fn prepare_read_objects(
    store: &dyn ObjectStore,
    bucket: &str,
    count: u32,
    object_size: u64,
) -> anyhow::Result<()> {
    println!("Preparing {} objects for read test...", count);

    let size = usize::try_from(object_size)
        .map_err(|_| BenchError::Config(format!("object size {} is too large", object_size)))?;
    let data = Bytes::from(vec![b'x'; size]);

    for idx in 0..count {
        let key = read_object_key(idx);
        store
            .put_object(bucket, &key, data.clone())
            .await
            .map_err(|err| provisioning_error(err, format!("Unable to upload {}", key)))?;
    }

    info!("Prepared {} read objects in {}", count, bucket);
    println!("Prepared {} objects.", count);
    Ok(())
}

fn provisioning_error(err: anyhow::Error, what: String) -> anyhow::Error {
    match err.downcast::<BenchError>() {
        Ok(bench_err) => bench_err.into(),
        Err(err) => BenchError::Provisioning(format!("{}: {:#}", what, err)).into(),
    }
}

fn bucket_uri(bucket: &str) -> String {
    format!("/{}", pct_encode(bucket))
}

fn object_uri(bucket: &str, key: &str) -> String {
    format!("/{}/{}", pct_encode(bucket), pct_encode_path(key))
}

fn amz_dates(now: DateTime<Utc>) -> (String, String) {
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date_stamp = now.format("%Y%m%d").to_string();
    (amz_date, date_stamp)
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex_lower(&hasher.finalize())
}

fn hex_lower(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        out.push(HEX[(b >> 4) as usize] as char);
        out.push(HEX[(b & 0x0f) as usize] as char);
    }
    out
}

fn hmac_sha256(key: &[u8], msg: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|e| anyhow!("hmac key: {}", e))?;
    mac.update(msg);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn signing_key(secret: &str, date: &str, region: &str, service: &str) -> anyhow::Result<Vec<u8>> {
    let k_date = hmac_sha256(format!("AWS4{}", secret).as_bytes(), date.as_bytes())?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, service.as_bytes())?;
    hmac_sha256(&k_service, b"aws4_request")
}

fn is_unreserved(c: u8) -> bool {
    matches!(c, b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~')
}

fn pct_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for &b in input.as_bytes() {
        if is_unreserved(b) {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

fn pct_encode_path(path: &str) -> String {
    path.split('/').map(pct_encode).collect::<Vec<_>>().join("/")
}
