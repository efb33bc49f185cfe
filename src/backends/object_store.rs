//! S3-compatible object store backend.
//!
//! Requests are path-style (`{endpoint}/{bucket}/{key}`). When credentials
//! are configured every request carries an AWS Signature V4 header with an
//! unsigned payload.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url, header};
use sha2::{Digest, Sha256};
use std::{collections::HashMap, io};
use tokio::io::AsyncReadExt;
use tokio_util::io::StreamReader;

use super::{
    BackendConfigError, BackendKind, BoxedReader, StorageBackend, UriParts, ensure_uri_safe,
};
use crate::services::checksum::Checksums;

type HmacSha256 = Hmac<Sha256>;

const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";
const SIGNED_HEADERS: &str = "host;x-amz-content-sha256;x-amz-date";

#[derive(Clone)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
}

#[derive(Clone)]
pub struct ObjectStoreBackend {
    client: Client,
    endpoint: Url,
    bucket: String,
    region: String,
    key_prefix: Option<String>,
    credentials: Option<Credentials>,
}

impl ObjectStoreBackend {
    pub fn from_options(options: &HashMap<String, String>) -> Result<Self, BackendConfigError> {
        let get = |key: &str| {
            options
                .get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let endpoint = get("endpoint").ok_or(BackendConfigError::MissingOption("endpoint"))?;
        let endpoint = Url::parse(&endpoint)
            .map_err(|err| BackendConfigError::Invalid(format!("endpoint `{}`: {}", endpoint, err)))?;
        if endpoint.host_str().is_none() {
            return Err(BackendConfigError::Invalid("endpoint has no host".into()));
        }
        let bucket = get("bucket").ok_or(BackendConfigError::MissingOption("bucket"))?;
        let credentials = match (get("access_key"), get("secret_key")) {
            (Some(access_key), Some(secret_key)) => Some(Credentials {
                access_key,
                secret_key,
            }),
            (None, None) => None,
            _ => {
                return Err(BackendConfigError::Invalid(
                    "access_key and secret_key must be set together".into(),
                ));
            }
        };

        Ok(Self {
            client: Client::new(),
            endpoint,
            bucket,
            region: get("region").unwrap_or_else(|| "us-east-1".into()),
            key_prefix: get("key_prefix").map(|p| p.trim_matches('/').to_string()),
            credentials,
        })
    }

    fn canonical_path(&self, key: &str) -> String {
        let base = self.endpoint.path().trim_end_matches('/');
        format!("{}/{}/{}", base, uri_encode(&self.bucket, false), uri_encode(key, true))
    }

    fn host(&self) -> String {
        let host = self.endpoint.host_str().unwrap_or_default();
        match self.endpoint.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        }
    }

    fn request(&self, method: Method, key: &str) -> io::Result<RequestBuilder> {
        ensure_uri_safe(key)?;
        let path = self.canonical_path(key);
        let mut url = self.endpoint.clone();
        url.set_path(&path);

        let mut builder = self.client.request(method.clone(), url);
        if let Some(creds) = &self.credentials {
            let now = Utc::now();
            let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
            let authorization =
                self.authorization(creds, method.as_str(), &path, &self.host(), now);
            builder = builder
                .header("x-amz-date", amz_date)
                .header("x-amz-content-sha256", UNSIGNED_PAYLOAD)
                .header(header::AUTHORIZATION, authorization);
        }
        Ok(builder)
    }

    fn authorization(
        &self,
        creds: &Credentials,
        method: &str,
        canonical_path: &str,
        host: &str,
        now: DateTime<Utc>,
    ) -> String {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();
        let scope = format!("{}/{}/s3/aws4_request", date, self.region);

        let canonical_request = format!(
            "{}\n{}\n\nhost:{}\nx-amz-content-sha256:{}\nx-amz-date:{}\n\n{}\n{}",
            method, canonical_path, host, UNSIGNED_PAYLOAD, amz_date, SIGNED_HEADERS, UNSIGNED_PAYLOAD
        );
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            scope,
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );
        let key = signing_key(&creds.secret_key, &date, &self.region, "s3");
        let signature = hex::encode(hmac_sha256(&key, string_to_sign.as_bytes()));

        format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            creds.access_key, scope, SIGNED_HEADERS, signature
        )
    }

    async fn send(&self, method: Method, key: &str, body: Option<Bytes>) -> io::Result<Response> {
        let mut builder = self.request(method, key)?;
        if let Some(body) = body {
            builder = builder.body(body);
        }
        let response = builder.send().await.map_err(io::Error::other)?;
        check_status(response, key)
    }

    async fn head(&self, key: &str) -> io::Result<Response> {
        self.send(Method::HEAD, key, None).await
    }
}

#[async_trait]
impl StorageBackend for ObjectStoreBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::ObjectStore
    }

    fn remote_locator(&self, uri: &str) -> Option<String> {
        Some(format!("{}{}", self.host(), self.canonical_path(uri)))
    }

    fn build_uri(&self, parts: &UriParts<'_>) -> Option<String> {
        self.key_prefix
            .as_deref()
            .filter(|p| !p.is_empty())
            .map(|prefix| format!("{}/{}", prefix, parts.default_uri()))
    }

    async fn open_read(&self, uri: &str) -> io::Result<BoxedReader> {
        let response = self.send(Method::GET, uri, None).await?;
        let stream = response.bytes_stream().map_err(io::Error::other);
        Ok(Box::pin(StreamReader::new(stream)))
    }

    /// S3 needs a Content-Length up front, so the body is buffered.
    async fn write(&self, uri: &str, mut reader: BoxedReader) -> io::Result<u64> {
        let mut body = Vec::new();
        reader.read_to_end(&mut body).await?;
        let len = body.len() as u64;
        self.send(Method::PUT, uri, Some(Bytes::from(body))).await?;
        Ok(len)
    }

    async fn size(&self, uri: &str) -> io::Result<u64> {
        content_length(&self.head(uri).await?)
    }

    async fn delete(&self, uri: &str) -> io::Result<()> {
        match self.send(Method::DELETE, uri, None).await {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// The ETag of a single-part upload is the MD5 of the object.
    async fn native_checksums(&self, uri: &str) -> io::Result<Option<Checksums>> {
        let response = self.head(uri).await?;
        let size = content_length(&response)?;
        let etag = response
            .headers()
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim_matches('"').to_ascii_lowercase());
        Ok(etag
            .filter(|e| e.len() == 32 && e.chars().all(|c| c.is_ascii_hexdigit()))
            .map(|md5| Checksums {
                md5: Some(md5),
                sha512: None,
                size,
            }))
    }
}

fn check_status(response: Response, key: &str) -> io::Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let kind = match status {
        StatusCode::NOT_FOUND => io::ErrorKind::NotFound,
        StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => io::ErrorKind::PermissionDenied,
        StatusCode::METHOD_NOT_ALLOWED | StatusCode::NOT_IMPLEMENTED => io::ErrorKind::Unsupported,
        _ => io::ErrorKind::Other,
    };
    Err(io::Error::new(
        kind,
        format!("object store returned {} for `{}`", status, key),
    ))
}

fn content_length(response: &Response) -> io::Result<u64> {
    response
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .ok_or_else(|| io::Error::other("object store response missing content-length"))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Derive the SigV4 signing key for a date (`YYYYMMDD`), region and service.
pub fn signing_key(secret: &str, date: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(format!("AWS4{}", secret).as_bytes(), date.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// RFC 3986 percent-encoding as SigV4 expects; `/` is kept when encoding keys.
pub fn uri_encode(value: &str, keep_slash: bool) -> String {
    let mut out = String::with_capacity(value.len());
    for b in value.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            b'/' if keep_slash => out.push('/'),
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}
