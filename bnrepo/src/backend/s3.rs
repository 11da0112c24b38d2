//! S3-compatible backend adapter.
//!
//! Handles AWS S3 and S3-compatible services through path-style addressing.
//! Uses reqwest with manual AWS Signature V4 signing so no SDK dependency is
//! needed. Keys live in a flat namespace; directories are synthesized from
//! key prefixes when listing.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::blocking::{Body, Client, Response};
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use bnrepo_common::backend::{BackendAdapter, Capabilities, UrlOptions};
use bnrepo_common::content_type::guess_from_key;
use bnrepo_common::error::{Result, StorageError};
use bnrepo_common::key::{normalize_path, KeyQuery};
use bnrepo_common::listing::synthesize_flat;

use super::local::stream_atomic;

pub const DEFAULT_ACL: &str = "bucket-owner-full-control";

/// Presigned URLs are valid for at most (and by default) one week.
pub const MAX_PRESIGN_VALIDITY: Duration = Duration::from_secs(7 * 24 * 3600);

const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

#[derive(Clone, Debug)]
pub struct S3Config {
    pub bucket: String,
    /// Key prefix all objects of the repository live under.
    pub root: String,
    pub region: String,
    pub endpoint: Option<String>, // Custom endpoint for S3-compatible APIs
    pub access_key_id: String,
    pub secret_access_key: String,
    pub default_acl: String,
    pub storage_class: Option<String>,
    /// Create the bucket when it does not exist.
    pub create: bool,
}

pub struct S3Adapter {
    config: S3Config,
    client: Client,
    bucket_ready: AtomicBool,
}

impl S3Adapter {
    pub fn new(config: S3Config) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(300))
            .build()?;
        Ok(Self {
            config,
            client,
            bucket_ready: AtomicBool::new(false),
        })
    }

    fn service_url(&self) -> String {
        match &self.config.endpoint {
            Some(ep) => ep.trim_end_matches('/').to_string(),
            None => format!("https://s3.{}.amazonaws.com", self.config.region),
        }
    }

    fn object_key(&self, key: &str) -> String {
        normalize_path(&self.config.root, key)
    }

    /// Canonical (encoded) request path for a key, bucket included.
    fn object_path(&self, key: &str) -> String {
        format!(
            "/{}/{}",
            self.config.bucket,
            encode_key(&self.object_key(key))
        )
    }

    fn bucket_path(&self) -> String {
        format!("/{}", self.config.bucket)
    }

    fn is_public(&self) -> bool {
        matches!(
            self.config.default_acl.as_str(),
            "public-read" | "public-read-write"
        )
    }

    /// Send a signed request. `headers` must use lowercase names.
    fn send(
        &self,
        method: Method,
        path: &str,
        query: &BTreeMap<String, String>,
        mut headers: BTreeMap<String, String>,
        body: Option<Body>,
        payload_hash: &str,
    ) -> Result<Response> {
        let now = Utc::now();
        let base = self.service_url();
        let query_string = canonical_query(query);

        headers.insert("host".to_string(), url_host(&base));
        headers.insert("x-amz-content-sha256".to_string(), payload_hash.to_string());
        headers.insert("x-amz-date".to_string(), amz_date_time(&now));

        let auth = sign(
            &self.config,
            method.as_str(),
            path,
            &query_string,
            &headers,
            payload_hash,
            &now,
        );

        let url = if query_string.is_empty() {
            format!("{}{}", base, path)
        } else {
            format!("{}{}?{}", base, path, query_string)
        };

        let mut req = self.client.request(method, &url);
        for (name, value) in headers.iter().filter(|(k, _)| k.as_str() != "host") {
            req = req.header(name.as_str(), value.as_str());
        }
        req = req.header("Authorization", auth);
        if let Some(body) = body {
            req = req.body(body);
        }
        Ok(req.send()?)
    }

    fn send_empty(&self, method: Method, path: &str, headers: BTreeMap<String, String>) -> Result<Response> {
        self.send(method, path, &BTreeMap::new(), headers, None, &sha256_hex(b""))
    }

    fn ensure_bucket(&self) -> Result<()> {
        if self.bucket_ready.load(Ordering::Acquire) {
            return Ok(());
        }
        let resp = self.send_empty(Method::HEAD, &self.bucket_path(), BTreeMap::new())?;
        match resp.status() {
            s if s.is_success() => {}
            StatusCode::NOT_FOUND if self.config.create => self.create_bucket()?,
            StatusCode::NOT_FOUND => {
                return Err(StorageError::Backend(format!(
                    "The configured bucket \"{}\" does not exist",
                    self.config.bucket
                )))
            }
            status => {
                return Err(StorageError::Backend(format!(
                    "S3 HEAD bucket failed: HTTP {}",
                    status
                )))
            }
        }
        self.bucket_ready.store(true, Ordering::Release);
        Ok(())
    }

    fn create_bucket(&self) -> Result<()> {
        let body = create_bucket_body(&self.config.region);
        let hash = sha256_hex(body.as_bytes());
        let mut headers = BTreeMap::new();
        headers.insert("content-length".to_string(), body.len().to_string());
        let resp = self.send(
            Method::PUT,
            &self.bucket_path(),
            &BTreeMap::new(),
            headers,
            Some(Body::from(body)),
            &hash,
        )?;
        check(resp, "PUT bucket", &self.config.bucket)?;
        info!(bucket = %self.config.bucket, region = %self.config.region, "Created S3 bucket");
        Ok(())
    }

    fn head(&self, key: &str) -> Result<HeaderMap> {
        self.ensure_bucket()?;
        let resp = self.send_empty(Method::HEAD, &self.object_path(key), BTreeMap::new())?;
        Ok(check(resp, "HEAD", key)?.headers().clone())
    }

    /// Headers of a server-side copy from `source_key`.
    fn copy_headers(&self, source_key: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("x-amz-copy-source".to_string(), self.object_path(source_key)),
            ("x-amz-acl".to_string(), self.config.default_acl.clone()),
        ])
    }

    /// ListObjectsV2 prefix covering the directory of `query`.
    fn listing_prefix(&self, query: &KeyQuery) -> String {
        listing_base(&self.config.root, &query.directory)
    }

    fn put_headers(&self, key: &str) -> BTreeMap<String, String> {
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), guess_from_key(key));
        headers.insert("x-amz-acl".to_string(), self.config.default_acl.clone());
        if let Some(ref sc) = self.config.storage_class {
            headers.insert("x-amz-storage-class".to_string(), sc.clone());
        }
        headers
    }

    fn list_objects(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let mut query = BTreeMap::new();
            query.insert("list-type".to_string(), "2".to_string());
            query.insert("prefix".to_string(), prefix.to_string());
            if let Some(token) = continuation.take() {
                query.insert("continuation-token".to_string(), token);
            }
            let resp = self.send(
                Method::GET,
                &self.bucket_path(),
                &query,
                BTreeMap::new(),
                None,
                &sha256_hex(b""),
            )?;
            let body = check(resp, "LIST", prefix)?.text()?;
            let page = parse_list_page(&body);
            keys.extend(page.keys);
            match page.next_token {
                Some(token) if page.truncated => continuation = Some(token),
                _ => break,
            }
        }
        Ok(keys)
    }

    /// Presigned GET URL for `key`.
    pub fn presigned_url(&self, key: &str, options: &UrlOptions, now: DateTime<Utc>) -> String {
        let validity = options
            .validity
            .unwrap_or(MAX_PRESIGN_VALIDITY)
            .min(MAX_PRESIGN_VALIDITY);

        let mut params = BTreeMap::new();
        if let Some(ref name) = options.filename {
            params.insert(
                "response-content-disposition".to_string(),
                format!("attachment; filename=\"{}\"", name),
            );
        }
        if let Some(ref ct) = options.content_type {
            params.insert("response-content-type".to_string(), ct.clone());
        }

        let base = self.service_url();
        let path = self.object_path(key);
        let query = presign_query(
            &self.config,
            &url_host(&base),
            &path,
            params,
            validity.as_secs(),
            &now,
        );
        format!("{}{}?{}", base, path, query)
    }
}

impl BackendAdapter for S3Adapter {
    fn backend_name(&self) -> &'static str {
        "s3"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            url_aware: true,
            uploadable: true,
            downloadable: true,
            appendable: false,
            time_aware: false,
        }
    }

    fn exists(&self, key: &str) -> Result<bool> {
        match self.head(key) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn read(&self, key: &str) -> Result<Bytes> {
        self.ensure_bucket()?;
        let resp = self.send_empty(Method::GET, &self.object_path(key), BTreeMap::new())?;
        Ok(check(resp, "GET", key)?.bytes()?)
    }

    fn write(&self, key: &str, data: &[u8]) -> Result<u64> {
        self.ensure_bucket()?;
        let hash = sha256_hex(data);
        let mut headers = self.put_headers(key);
        headers.insert("content-length".to_string(), data.len().to_string());
        let resp = self.send(
            Method::PUT,
            &self.object_path(key),
            &BTreeMap::new(),
            headers,
            Some(Body::from(data.to_vec())),
            &hash,
        )?;
        check(resp, "PUT", key)?;
        debug!(key = %key, bytes = data.len(), "S3 upload complete");
        Ok(data.len() as u64)
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.ensure_bucket()?;
        let resp = self.send_empty(Method::DELETE, &self.object_path(key), BTreeMap::new())?;
        ignore_missing(check(resp, "DELETE", key).map(drop))?;
        debug!(key = %key, "S3 delete complete");
        Ok(())
    }

    fn rename(&self, key: &str, new_key: &str) -> Result<()> {
        self.ensure_bucket()?;
        let resp = self.send_empty(Method::PUT, &self.object_path(new_key), self.copy_headers(key))?;
        check(resp, "COPY", key)?;
        self.delete(key)?;
        debug!(from = %key, to = %new_key, "S3 rename complete");
        Ok(())
    }

    fn mtime(&self, key: &str) -> Result<DateTime<Utc>> {
        let headers = self.head(key)?;
        let value = header_str(&headers, "last-modified")
            .ok_or_else(|| StorageError::Backend(format!("no Last-Modified for {}", key)))?;
        parse_http_date(value)
    }

    fn size(&self, key: &str) -> Result<u64> {
        let headers = self.head(key)?;
        header_str(&headers, "content-length")
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| StorageError::Backend(format!("no Content-Length for {}", key)))
    }

    /// Best effort: a key with no object behind it is treated as a directory
    /// prefix. This cannot tell a prefix from a key that simply does not exist.
    fn is_directory(&self, key: &str) -> Result<bool> {
        Ok(!self.exists(key)?)
    }

    fn content_type(&self, key: &str) -> Result<String> {
        let headers = self.head(key)?;
        Ok(header_str(&headers, "content-type")
            .map(str::to_string)
            .unwrap_or_else(|| guess_from_key(key)))
    }

    fn list_keys(&self, prefix: Option<&str>, include_directories: bool) -> Result<Vec<String>> {
        self.ensure_bucket()?;
        let query = KeyQuery::parse(prefix);
        let base = self.listing_prefix(&query);
        let objects = self.list_objects(&base)?;
        Ok(synthesize_flat(&base, &query, objects, include_directories))
    }

    fn url(&self, key: &str, options: &UrlOptions) -> Result<String> {
        if let Some(public) = &options.download_url {
            return Ok(public.clone());
        }
        if self.is_public() {
            return Ok(format!("{}{}", self.service_url(), self.object_path(key)));
        }
        Ok(self.presigned_url(key, options, Utc::now()))
    }

    fn upload_file(&self, local: &Path, key: &str) -> Result<()> {
        self.ensure_bucket()?;
        let file = std::fs::File::open(local)?;
        let len = file.metadata()?.len();
        let mut headers = self.put_headers(key);
        headers.insert("content-length".to_string(), len.to_string());
        let resp = self.send(
            Method::PUT,
            &self.object_path(key),
            &BTreeMap::new(),
            headers,
            Some(Body::from(file)),
            UNSIGNED_PAYLOAD,
        )?;
        check(resp, "PUT", key)?;
        debug!(key = %key, local = %local.display(), bytes = len, "S3 file upload complete");
        Ok(())
    }

    fn download_file(&self, key: &str, local: &Path) -> Result<()> {
        self.ensure_bucket()?;
        let resp = self.send_empty(Method::GET, &self.object_path(key), BTreeMap::new())?;
        let mut resp = check(resp, "GET", key)?;
        let bytes = stream_atomic(local, &mut resp)?;
        debug!(key = %key, local = %local.display(), bytes, "S3 file download complete");
        Ok(())
    }
}

/// Pass successful responses through, map the rest with [`status_error`].
fn check(resp: Response, operation: &str, key: &str) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = match status {
        StatusCode::NOT_FOUND => String::new(),
        _ => resp.text().unwrap_or_default(),
    };
    Err(status_error(status, operation, key, &body))
}

/// 404 becomes `NotFound(key)`, every other failure a backend error carrying
/// the response body.
fn status_error(status: StatusCode, operation: &str, key: &str, body: &str) -> StorageError {
    if status == StatusCode::NOT_FOUND {
        return StorageError::NotFound(key.to_string());
    }
    StorageError::Backend(format!(
        "S3 {} of {} failed: HTTP {} - {}",
        operation, key, status, body
    ))
}

/// Deleting a synthesized directory (no object behind it) succeeds.
fn ignore_missing(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn parse_http_date(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::backend(format!("invalid date '{}'", value), e))
}

/// String prefix sent to ListObjectsV2 for a query directory.
fn listing_base(root: &str, directory: &str) -> String {
    let base = normalize_path(root, directory);
    if base.is_empty() {
        base
    } else {
        format!("{}/", base)
    }
}

fn create_bucket_body(region: &str) -> String {
    if region == "us-east-1" {
        return String::new();
    }
    format!(
        "<CreateBucketConfiguration xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\">\
         <LocationConstraint>{}</LocationConstraint></CreateBucketConfiguration>",
        region
    )
}

/// URI-encode each segment of an object key, keeping the separators.
fn encode_key(key: &str) -> String {
    key.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn canonical_query(params: &BTreeMap<String, String>) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

fn amz_date_time(now: &DateTime<Utc>) -> String {
    now.format("%Y%m%dT%H%M%SZ").to_string()
}

fn amz_date(now: &DateTime<Utc>) -> String {
    now.format("%Y%m%d").to_string()
}

fn credential_scope(config: &S3Config, date: &str) -> String {
    format!("{}/{}/s3/aws4_request", date, config.region)
}

fn signature(config: &S3Config, canonical_request: &str, now: &DateTime<Utc>) -> String {
    let date = amz_date(now);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        amz_date_time(now),
        credential_scope(config, &date),
        sha256_hex(canonical_request.as_bytes())
    );
    let key = signing_key(&config.secret_access_key, &date, &config.region);
    hex::encode(hmac_sha256(&key, string_to_sign.as_bytes()))
}

/// Compute the AWS Signature V4 `Authorization` header for a request.
fn sign(
    config: &S3Config,
    method: &str,
    path: &str,
    query: &str,
    headers: &BTreeMap<String, String>,
    payload_hash: &str,
    now: &DateTime<Utc>,
) -> String {
    let canonical_headers: String = headers
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v.trim()))
        .collect();
    let signed_headers: String = headers.keys().cloned().collect::<Vec<_>>().join(";");

    let canonical_request = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        method, path, query, canonical_headers, signed_headers, payload_hash
    );

    format!(
        "AWS4-HMAC-SHA256 Credential={}/{},SignedHeaders={},Signature={}",
        config.access_key_id,
        credential_scope(config, &amz_date(now)),
        signed_headers,
        signature(config, &canonical_request, now)
    )
}

/// Query string (signature included) of a presigned GET request.
fn presign_query(
    config: &S3Config,
    host: &str,
    path: &str,
    mut params: BTreeMap<String, String>,
    expires_secs: u64,
    now: &DateTime<Utc>,
) -> String {
    params.insert("X-Amz-Algorithm".to_string(), "AWS4-HMAC-SHA256".to_string());
    params.insert(
        "X-Amz-Credential".to_string(),
        format!("{}/{}", config.access_key_id, credential_scope(config, &amz_date(now))),
    );
    params.insert("X-Amz-Date".to_string(), amz_date_time(now));
    params.insert("X-Amz-Expires".to_string(), expires_secs.to_string());
    params.insert("X-Amz-SignedHeaders".to_string(), "host".to_string());

    let query = canonical_query(&params);
    let canonical_request = format!(
        "GET\n{}\n{}\nhost:{}\n\nhost\n{}",
        path, query, host, UNSIGNED_PAYLOAD
    );
    format!(
        "{}&X-Amz-Signature={}",
        query,
        signature(config, &canonical_request, now)
    )
}

/// Key for one day of S3 requests in `region`: the secret chained through
/// each part of the credential scope.
fn signing_key(secret: &str, date: &str, region: &str) -> Vec<u8> {
    let seed = hmac_sha256(format!("AWS4{}", secret).as_bytes(), date.as_bytes());
    [region.as_bytes(), b"s3", b"aws4_request"]
        .iter()
        .fold(seed, |key, part| hmac_sha256(&key, part))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    Hmac::<Sha256>::new_from_slice(key)
        .expect("HMAC key length ok")
        .chain_update(data)
        .finalize()
        .into_bytes()
        .to_vec()
}

/// Hex SHA-256, the payload hash S3 expects in `x-amz-content-sha256`.
fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// One page of a ListObjectsV2 response.
#[derive(Debug, Default, PartialEq)]
struct ListPage {
    keys: Vec<String>,
    truncated: bool,
    next_token: Option<String>,
}

fn parse_list_page(xml: &str) -> ListPage {
    ListPage {
        keys: parse_tag_values(xml, "Key"),
        truncated: parse_tag_values(xml, "IsTruncated")
            .first()
            .map(|v| v == "true")
            .unwrap_or(false),
        next_token: parse_tag_values(xml, "NextContinuationToken").into_iter().next(),
    }
}

/// Extract `<tag>…</tag>` values from an S3 XML response, unescaped.
fn parse_tag_values(xml: &str, tag: &str) -> Vec<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let mut values = Vec::new();
    let mut remaining = xml;
    while let Some(start) = remaining.find(&open) {
        remaining = &remaining[start + open.len()..];
        match remaining.find(&close) {
            Some(end) => {
                values.push(xml_unescape(&remaining[..end]));
                remaining = &remaining[end + close.len()..];
            }
            None => break,
        }
    }
    values
}

fn xml_unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// `host[:port]` of the service URL, as signed in the `host` header.
fn url_host(service_url: &str) -> String {
    let authority = service_url
        .split_once("://")
        .map_or(service_url, |(_, rest)| rest);
    match authority.find('/') {
        Some(end) => authority[..end].to_string(),
        None => authority.to_string(),
    }
}
