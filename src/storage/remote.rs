//! S3-compatible remote storage backend.
//!
//! Containers are buckets and object paths are keys. Requests are
//! path-style (`endpoint/bucket/key`) and signed with AWS Signature
//! Version 4, so the store works against AWS S3 as well as MinIO and other
//! compatible servers. The HTTP agent is blocking.

use std::collections::BTreeMap;
use std::io::{self, Read};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, warn};
use ureq::{Agent, AgentBuilder, Response};

use crate::path::StoragePath;
use crate::storage::listing::{self, ListingCache};
use crate::storage::sigv4::{self, Signer};
use crate::storage::{ObjectMeta, ObjectStore, StorageError, StorageResult};

/// Part size for uploads of unknown length.
pub const PART_SIZE: u64 = 10 * 1024 * 1024;

const DEFAULT_REGION: &str = "us-east-1";

/// Connection settings for a remote store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteConfig {
    /// Base URL, e.g. `http://localhost:9000`.
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
    /// Staleness window of the listing cache.
    pub listing_ttl: Duration,
    /// Number of listings kept in the cache.
    pub listing_capacity: usize,
}

impl RemoteConfig {
    pub fn new(
        endpoint: impl Into<String>,
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            region: DEFAULT_REGION.to_string(),
            listing_ttl: listing::DEFAULT_TTL,
            listing_capacity: listing::DEFAULT_CAPACITY,
        }
    }

    /// Parse the compact `user:password@host:port` address form.
    ///
    /// A `http://` or `https://` scheme may precede the credentials; plain
    /// `http` is assumed otherwise.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::InvalidArgument` if credentials or host are missing.
    pub fn from_address(address: &str) -> StorageResult<Self> {
        let (scheme, rest) = match address.split_once("://") {
            Some((scheme @ ("http" | "https"), rest)) => (scheme, rest),
            Some((scheme, _)) => {
                return Err(StorageError::InvalidArgument(format!(
                    "unsupported scheme {scheme} in address"
                )));
            }
            None => ("http", address),
        };
        let (credentials, host) = rest.rsplit_once('@').ok_or_else(|| {
            StorageError::InvalidArgument("address must have the form user:password@host:port".to_string())
        })?;
        let (access_key, secret_key) = credentials.split_once(':').ok_or_else(|| {
            StorageError::InvalidArgument("address credentials must have the form user:password".to_string())
        })?;
        let host = host.trim_end_matches('/');
        if access_key.is_empty() || host.is_empty() {
            return Err(StorageError::InvalidArgument(
                "address needs a user name and a host".to_string(),
            ));
        }
        Ok(Self::new(format!("{scheme}://{host}"), access_key, secret_key))
    }

    /// The `Host` header value for the endpoint, without a default port.
    fn host(&self) -> StorageResult<String> {
        let (scheme, rest) = self.endpoint.split_once("://").ok_or_else(|| {
            StorageError::InvalidArgument(format!("endpoint {} has no scheme", self.endpoint))
        })?;
        let authority = rest.split('/').next().unwrap_or_default();
        if authority.is_empty() {
            return Err(StorageError::InvalidArgument(format!(
                "endpoint {} has no host",
                self.endpoint
            )));
        }
        let host = match (scheme, authority.rsplit_once(':')) {
            ("http", Some((host, "80"))) | ("https", Some((host, "443"))) => host,
            _ => authority,
        };
        Ok(host.to_string())
    }
}

// ---------------------------------------------------------------------------
// XML responses
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListBucketResult {
    #[serde(default)]
    contents: Vec<Contents>,
    #[serde(default)]
    is_truncated: bool,
    next_continuation_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Contents {
    key: String,
    last_modified: String,
    size: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListAllMyBucketsResult {
    #[serde(default)]
    buckets: BucketList,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BucketList {
    #[serde(default)]
    bucket: Vec<Bucket>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Bucket {
    name: String,
    creation_date: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InitiateMultipartUploadResult {
    upload_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ErrorBody {
    code: String,
    #[serde(default)]
    message: String,
}

fn parse_xml<T: for<'de> Deserialize<'de>>(context: &str, body: &str) -> StorageResult<T> {
    quick_xml::de::from_str(body)
        .map_err(|e| StorageError::Unavailable(format!("{context}: malformed response: {e}")))
}

fn parse_time(context: &str, value: &str) -> StorageResult<SystemTime> {
    DateTime::parse_from_rfc3339(value)
        .map(SystemTime::from)
        .map_err(|e| StorageError::Unavailable(format!("{context}: bad timestamp {value}: {e}")))
}

fn complete_multipart_body(etags: &[String]) -> String {
    let mut body = String::from("<CompleteMultipartUpload>");
    for (i, etag) in etags.iter().enumerate() {
        body.push_str(&format!(
            "<Part><PartNumber>{}</PartNumber><ETag>{etag}</ETag></Part>",
            i + 1
        ));
    }
    body.push_str("</CompleteMultipartUpload>");
    body
}

/// Translate a failed request; 404 becomes `NotFound`.
fn request_error(context: &str, e: ureq::Error) -> StorageError {
    match e {
        ureq::Error::Status(404, _) => StorageError::NotFound(context.to_string()),
        ureq::Error::Status(code, response) => {
            let body = response.into_string().unwrap_or_default();
            match quick_xml::de::from_str::<ErrorBody>(&body) {
                Ok(err) => StorageError::Unavailable(format!(
                    "{context}: HTTP {code} {} {}",
                    err.code, err.message
                )),
                Err(_) => StorageError::Unavailable(format!("{context}: HTTP {code}")),
            }
        }
        ureq::Error::Transport(t) => StorageError::Unavailable(format!("{context}: {t}")),
    }
}

fn read_body(context: &str, response: Response) -> StorageResult<String> {
    response
        .into_string()
        .map_err(|e| StorageError::Unavailable(format!("{context}: {e}")))
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// One request before signing.
struct Call<'a> {
    method: &'static str,
    bucket: Option<&'a str>,
    key: &'a str,
    query: Vec<(String, String)>,
    /// Headers that take part in the signature.
    headers: Vec<(String, String)>,
}

impl<'a> Call<'a> {
    fn new(method: &'static str, bucket: Option<&'a str>, key: &'a str) -> Self {
        Self {
            method,
            bucket,
            key,
            query: Vec::new(),
            headers: Vec::new(),
        }
    }

    fn object(method: &'static str, path: &'a StoragePath) -> Self {
        Self::new(method, Some(path.container()), path.key())
    }

    fn query(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.push((key.to_string(), value.into()));
        self
    }

    fn header(mut self, key: &str, value: impl Into<String>) -> Self {
        self.headers.push((key.to_ascii_lowercase(), value.into()));
        self
    }

    /// Canonical, URI-encoded request path.
    fn path(&self) -> String {
        let mut path = String::from("/");
        if let Some(bucket) = self.bucket {
            path.push_str(&sigv4::encode(bucket, false));
            if !self.key.is_empty() {
                path.push('/');
                path.push_str(&sigv4::encode(self.key, true));
            }
        }
        path
    }

    fn query_string(&self) -> String {
        let mut pairs: Vec<(String, String)> = self
            .query
            .iter()
            .map(|(k, v)| (sigv4::encode(k, false), sigv4::encode(v, false)))
            .collect();
        pairs.sort();
        pairs
            .iter()
            .map(|(k, v)| if v.is_empty() { format!("{k}=") } else { format!("{k}={v}") })
            .collect::<Vec<_>>()
            .join("&")
    }
}

struct BucketCache {
    fetched: Instant,
    created: BTreeMap<String, SystemTime>,
}

/// Object store talking to an S3-compatible server.
pub struct RemoteObjectStore {
    agent: Agent,
    endpoint: String,
    host: String,
    region: String,
    signer: Signer,
    ttl: Duration,
    listings: ListingCache,
    buckets: Mutex<Option<BucketCache>>,
}

impl std::fmt::Debug for RemoteObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteObjectStore")
            .field("endpoint", &self.endpoint)
            .field("signer", &self.signer)
            .finish_non_exhaustive()
    }
}

impl RemoteObjectStore {
    /// Create a client. No request is made until the first operation.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::InvalidArgument` if the endpoint is malformed.
    pub fn new(config: &RemoteConfig) -> StorageResult<Self> {
        let host = config.host()?;
        let agent = AgentBuilder::new()
            .timeout_connect(Duration::from_secs(10))
            .timeout_read(Duration::from_secs(60))
            .build();
        Ok(Self {
            agent,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            host,
            region: config.region.clone(),
            signer: Signer::new(&config.access_key, &config.secret_key, &config.region),
            ttl: config.listing_ttl,
            listings: ListingCache::new(config.listing_capacity, config.listing_ttl),
            buckets: Mutex::new(None),
        })
    }

    /// Sign a call and build the HTTP request for it.
    fn request(&self, call: &Call<'_>, payload_hash: &str) -> ureq::Request {
        let path = call.path();
        let query = call.query_string();
        let url = if query.is_empty() {
            format!("{}{path}", self.endpoint)
        } else {
            format!("{}{path}?{query}", self.endpoint)
        };

        let now = Utc::now();
        let mut headers = call.headers.clone();
        headers.push(("host".to_string(), self.host.clone()));
        headers.push(("x-amz-date".to_string(), sigv4::amz_date(now)));
        headers.push(("x-amz-content-sha256".to_string(), payload_hash.to_string()));
        let authorization =
            self.signer
                .authorization(call.method, &path, &call.query, &headers, payload_hash, now);

        let mut request = self.agent.request(call.method, &url);
        for (name, value) in headers.iter().filter(|(name, _)| name != "host") {
            request = request.set(name, value);
        }
        request.set("Authorization", &authorization)
    }

    fn send_empty(&self, call: &Call<'_>) -> Result<Response, ureq::Error> {
        self.request(call, &sigv4::hash_hex(b"")).call()
    }

    fn send_bytes(&self, call: &Call<'_>, data: &[u8]) -> Result<Response, ureq::Error> {
        self.request(call, &sigv4::hash_hex(data)).send_bytes(data)
    }

    fn send_stream(&self, call: &Call<'_>, reader: impl Read, len: u64) -> Result<Response, ureq::Error> {
        self.request(call, sigv4::UNSIGNED_PAYLOAD)
            .set("Content-Length", &len.to_string())
            .send(reader)
    }

    fn bucket_cache(&self) -> std::sync::MutexGuard<'_, Option<BucketCache>> {
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fetch_buckets(&self) -> StorageResult<BTreeMap<String, SystemTime>> {
        let response = self
            .send_empty(&Call::new("GET", None, ""))
            .map_err(|e| request_error("list buckets", e))?;
        let body = read_body("list buckets", response)?;
        let result: ListAllMyBucketsResult = parse_xml("list buckets", &body)?;

        let mut created = BTreeMap::new();
        for bucket in result.buckets.bucket {
            let time = parse_time(&bucket.name, &bucket.creation_date)?;
            created.insert(bucket.name, time);
        }
        *self.bucket_cache() = Some(BucketCache {
            fetched: Instant::now(),
            created: created.clone(),
        });
        Ok(created)
    }

    fn forget_buckets(&self) {
        *self.bucket_cache() = None;
    }

    /// Fresh recursive listing of everything below `prefix`.
    fn fetch_listing(&self, prefix: &StoragePath) -> StorageResult<Vec<ObjectMeta>> {
        let context = prefix.to_string();
        let mut objects = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let mut call = Call::new("GET", Some(prefix.container()), "").query("list-type", "2");
            if !prefix.key().is_empty() {
                call = call.query("prefix", prefix.key());
            }
            if let Some(token) = token.take() {
                call = call.query("continuation-token", token);
            }
            let response = self
                .send_empty(&call)
                .map_err(|e| request_error(&context, e))?;
            let body = read_body(&context, response)?;
            let page: ListBucketResult = parse_xml(&context, &body)?;

            for item in page.contents {
                let path = StoragePath::new(prefix.container(), &item.key);
                // the key prefix also matches siblings such as "/a.json.lock" for "/a.json"
                if !prefix.contains(&path) || item.key.ends_with('/') {
                    continue;
                }
                objects.push(ObjectMeta {
                    last_modified: parse_time(&item.key, &item.last_modified)?,
                    size: item.size,
                    path,
                });
            }

            match page.next_continuation_token {
                Some(next) if page.is_truncated => token = Some(next),
                _ => break,
            }
        }
        debug!(prefix = %prefix, count = objects.len(), "listed remote objects");
        Ok(objects)
    }

    /// Listing entry for one object, served from the listing of its parent.
    fn cached_meta(&self, path: &StoragePath) -> StorageResult<ObjectMeta> {
        let parent = path
            .parent()
            .ok_or_else(|| StorageError::NotFound(path.to_string()))?;
        let find = |objects: &[ObjectMeta]| objects.iter().find(|m| &m.path == path).cloned();

        if let Some(cached) = self.listings.get(&parent)
            && let Some(meta) = find(cached.as_slice())
        {
            return Ok(meta);
        }
        let fresh = self.listings.insert(&parent, self.fetch_listing(&parent)?);
        find(fresh.as_slice()).ok_or_else(|| StorageError::NotFound(path.to_string()))
    }

    fn put_single(&self, path: &StoragePath, data: &[u8]) -> StorageResult<()> {
        self.send_bytes(&Call::object("PUT", path), data)
            .map_err(|e| request_error(&path.to_string(), e))?;
        Ok(())
    }

    /// Upload a stream of unknown length in `PART_SIZE` parts.
    fn put_multipart(&self, path: &StoragePath, reader: &mut dyn Read) -> StorageResult<u64> {
        let context = path.to_string();
        let mut part = Vec::new();
        fill_part(reader, &mut part).map_err(|e| StorageError::write(path, e))?;
        if (part.len() as u64) < PART_SIZE {
            self.put_single(path, &part)?;
            return Ok(part.len() as u64);
        }

        let response = self
            .send_empty(&Call::object("POST", path).query("uploads", ""))
            .map_err(|e| request_error(&context, e))?;
        let body = read_body(&context, response)?;
        let upload: InitiateMultipartUploadResult = parse_xml(&context, &body)?;

        match self.upload_parts(path, &upload.upload_id, reader, part) {
            Ok(n) => Ok(n),
            Err(e) => {
                let abort = Call::object("DELETE", path).query("uploadId", upload.upload_id.as_str());
                if let Err(abort_err) = self.send_empty(&abort) {
                    warn!(path = %path, error = %abort_err, "failed to abort multipart upload");
                }
                Err(e)
            }
        }
    }

    fn upload_parts(
        &self,
        path: &StoragePath,
        upload_id: &str,
        reader: &mut dyn Read,
        first: Vec<u8>,
    ) -> StorageResult<u64> {
        let context = path.to_string();
        let mut etags = Vec::new();
        let mut total = 0u64;
        let mut part = first;
        while !part.is_empty() {
            let number = etags.len() + 1;
            let call = Call::object("PUT", path)
                .query("partNumber", number.to_string())
                .query("uploadId", upload_id);
            let response = self
                .send_bytes(&call, &part)
                .map_err(|e| request_error(&context, e))?;
            let etag = response
                .header("ETag")
                .ok_or_else(|| StorageError::Unavailable(format!("{context}: part {number} without ETag")))?;
            etags.push(etag.to_string());
            total += part.len() as u64;
            debug!(path = %path, part = number, bytes = part.len(), "uploaded part");

            part.clear();
            fill_part(reader, &mut part).map_err(|e| StorageError::write(path, e))?;
        }

        let complete = Call::object("POST", path).query("uploadId", upload_id);
        self.send_bytes(&complete, complete_multipart_body(&etags).as_bytes())
            .map_err(|e| request_error(&context, e))?;
        Ok(total)
    }
}

fn fill_part(reader: &mut dyn Read, part: &mut Vec<u8>) -> io::Result<()> {
    reader.take(PART_SIZE).read_to_end(part)?;
    Ok(())
}

impl ObjectStore for RemoteObjectStore {
    fn make_container(&self, container: &str) -> StorageResult<()> {
        let call = Call::new("PUT", Some(container), "");
        let result = if self.region == DEFAULT_REGION {
            self.send_empty(&call)
        } else {
            let body = format!(
                "<CreateBucketConfiguration><LocationConstraint>{}</LocationConstraint></CreateBucketConfiguration>",
                self.region
            );
            self.send_bytes(&call, body.as_bytes())
        };
        self.forget_buckets();
        match result {
            // BucketAlreadyOwnedByYou
            Ok(_) | Err(ureq::Error::Status(409, _)) => Ok(()),
            Err(e) => Err(request_error(&format!("create bucket {container}"), e)),
        }
    }

    fn container_exists(&self, container: &str) -> StorageResult<bool> {
        match self.send_empty(&Call::new("HEAD", Some(container), "")) {
            Ok(_) => Ok(true),
            Err(ureq::Error::Status(404, _)) => Ok(false),
            Err(e) => Err(request_error(&format!("bucket {container}"), e)),
        }
    }

    fn list_containers(&self) -> StorageResult<Vec<String>> {
        Ok(self.fetch_buckets()?.into_keys().collect())
    }

    fn container_created(&self, container: &str) -> StorageResult<SystemTime> {
        {
            let cache = self.bucket_cache();
            if let Some(cache) = cache.as_ref()
                && cache.fetched.elapsed() < self.ttl
                && let Some(created) = cache.created.get(container)
            {
                return Ok(*created);
            }
        }
        self.fetch_buckets()?
            .get(container)
            .copied()
            .ok_or_else(|| StorageError::NotFound(format!("bucket {container}")))
    }

    fn remove_container(&self, container: &str) -> StorageResult<()> {
        let result = self.send_empty(&Call::new("DELETE", Some(container), ""));
        self.forget_buckets();
        self.listings.invalidate(&StoragePath::root(container));
        match result {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(404, _)) => {
                Err(StorageError::NotFound(format!("bucket {container}")))
            }
            Err(ureq::Error::Status(409, _)) => Err(StorageError::WriteError(format!(
                "bucket {container} is not empty"
            ))),
            Err(e) => Err(request_error(&format!("bucket {container}"), e)),
        }
    }

    fn write(&self, path: &StoragePath, data: &[u8]) -> StorageResult<()> {
        let result = self.put_single(path, data);
        self.listings.invalidate(path);
        result
    }

    fn write_from(
        &self,
        path: &StoragePath,
        reader: &mut dyn Read,
        len: Option<u64>,
    ) -> StorageResult<u64> {
        let result = match len {
            Some(n) => self
                .send_stream(&Call::object("PUT", path), reader.take(n), n)
                .map(|_| n)
                .map_err(|e| request_error(&path.to_string(), e)),
            None => self.put_multipart(path, reader),
        };
        self.listings.invalidate(path);
        result
    }

    fn create_new(&self, path: &StoragePath, data: &[u8]) -> StorageResult<bool> {
        let call = Call::object("PUT", path).header("if-none-match", "*");
        let result = self.send_bytes(&call, data);
        self.listings.invalidate(path);
        match result {
            Ok(_) => Ok(true),
            // 412: exists; 409: a concurrent conditional write won
            Err(ureq::Error::Status(412 | 409, _)) => Ok(false),
            Err(e) => Err(request_error(&path.to_string(), e)),
        }
    }

    fn read(&self, path: &StoragePath) -> StorageResult<Box<dyn Read + Send>> {
        let response = self
            .send_empty(&Call::object("GET", path))
            .map_err(|e| request_error(&path.to_string(), e))?;
        Ok(Box::new(response.into_reader()))
    }

    fn read_from(&self, path: &StoragePath, offset: u64) -> StorageResult<Box<dyn Read + Send>> {
        let call = Call::object("GET", path).header("range", format!("bytes={offset}-"));
        match self.send_empty(&call) {
            Ok(response) => Ok(Box::new(response.into_reader())),
            Err(ureq::Error::Status(416, _)) => Ok(Box::new(io::empty())),
            Err(e) => Err(request_error(&path.to_string(), e)),
        }
    }

    fn read_range(
        &self,
        path: &StoragePath,
        offset: u64,
        len: u64,
    ) -> StorageResult<Box<dyn Read + Send>> {
        if len == 0 {
            return Ok(Box::new(io::empty()));
        }
        let last = offset.saturating_add(len - 1);
        let call = Call::object("GET", path).header("range", format!("bytes={offset}-{last}"));
        match self.send_empty(&call) {
            // servers without range support answer 200 with the whole object
            Ok(response) if response.status() == 200 => {
                let mut reader = response.into_reader();
                io::copy(&mut (&mut reader).take(offset), &mut io::sink())
                    .map_err(|e| StorageError::read(path, e))?;
                Ok(Box::new(reader.take(len)))
            }
            Ok(response) => Ok(Box::new(response.into_reader())),
            Err(ureq::Error::Status(416, _)) => Ok(Box::new(io::empty())),
            Err(e) => Err(request_error(&path.to_string(), e)),
        }
    }

    fn exists(&self, path: &StoragePath) -> StorageResult<bool> {
        match self.send_empty(&Call::object("HEAD", path)) {
            Ok(_) => Ok(true),
            Err(ureq::Error::Status(404, _)) => Ok(false),
            Err(e) => Err(request_error(&path.to_string(), e)),
        }
    }

    fn remove(&self, path: &StoragePath) -> StorageResult<()> {
        let result = self.send_empty(&Call::object("DELETE", path));
        self.listings.invalidate(path);
        result
            .map(|_| ())
            .map_err(|e| request_error(&path.to_string(), e))
    }

    fn list(&self, prefix: &StoragePath) -> StorageResult<Vec<ObjectMeta>> {
        let objects = self.fetch_listing(prefix)?;
        Ok(self.listings.insert(prefix, objects).to_vec())
    }

    fn last_modified(&self, path: &StoragePath) -> StorageResult<SystemTime> {
        Ok(self.cached_meta(path)?.last_modified)
    }

    fn size(&self, path: &StoragePath) -> StorageResult<u64> {
        Ok(self.cached_meta(path)?.size)
    }

    fn stat(&self, path: &StoragePath) -> StorageResult<ObjectMeta> {
        self.cached_meta(path)
    }

    fn disk_usage(&self, prefix: &StoragePath) -> StorageResult<u64> {
        let objects = self
            .listings
            .get_or_fetch(prefix, || self.fetch_listing(prefix))?;
        Ok(objects.iter().map(|m| m.size).sum())
    }

    fn copy(&self, from: &StoragePath, to: &StoragePath) -> StorageResult<()> {
        let source = format!(
            "/{}/{}",
            sigv4::encode(from.container(), false),
            sigv4::encode(from.key(), true)
        );
        let call = Call::object("PUT", to).header("x-amz-copy-source", source);
        let result = self.send_empty(&call);
        self.listings.invalidate(to);
        result
            .map(|_| ())
            .map_err(|e| request_error(&format!("copy {from} to {to}"), e))
    }
}
