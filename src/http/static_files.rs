//! Dumb-protocol file serving and the response cache header policies.

use std::io::SeekFrom;
use std::path::{Component, Path};

use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, NaiveDateTime, Utc};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::debug;

use super::handler::AppError;

pub const TEXT_PLAIN: &str = "text/plain";
pub const TEXT_PLAIN_UTF8: &str = "text/plain; charset=utf-8";
pub const LOOSE_OBJECT: &str = "application/x-git-loose-object";
pub const PACKED_OBJECTS: &str = "application/x-git-packed-objects";
pub const PACKED_OBJECTS_TOC: &str = "application/x-git-packed-objects-toc";

const HTTP_DATE: &str = "%a, %d %b %Y %H:%M:%S GMT";
const ONE_YEAR_SECS: i64 = 31_536_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    /// Mutable metadata (refs, HEAD, alternates).
    NoCache,
    /// Content-addressed data that never changes once written.
    Forever,
}

/// Format a timestamp as an RFC 7231 HTTP date.
pub fn http_date(at: DateTime<Utc>) -> String {
    at.format(HTTP_DATE).to_string()
}

fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value.trim(), HTTP_DATE)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Add the caching headers for `policy` to `headers`.
pub fn apply_cache_policy(headers: &mut HeaderMap, policy: CachePolicy) {
    match policy {
        CachePolicy::NoCache => {
            headers.insert(
                header::EXPIRES,
                HeaderValue::from_static("Fri, 01 Jan 1980 00:00:00 GMT"),
            );
            headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
            headers.insert(
                header::CACHE_CONTROL,
                HeaderValue::from_static("no-cache, max-age=0, must-revalidate"),
            );
        }
        CachePolicy::Forever => {
            let now = Utc::now();
            let expires = now + chrono::Duration::seconds(ONE_YEAR_SECS);
            if let Ok(v) = HeaderValue::from_str(&http_date(now)) {
                headers.insert(header::DATE, v);
            }
            if let Ok(v) = HeaderValue::from_str(&http_date(expires)) {
                headers.insert(header::EXPIRES, v);
            }
            headers.insert(
                header::CACHE_CONTROL,
                HeaderValue::from_static("public, max-age=31536000"),
            );
        }
    }
}

/// The part of a file a `Range` header asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ByteRange {
    /// No usable range; send the whole file.
    Full,
    /// Inclusive byte offsets.
    Partial { start: u64, end: u64 },
    Unsatisfiable,
}

/// Interpret a single `bytes=` range against a file of `len` bytes.
///
/// Multi-range and malformed headers are ignored, as RFC 9110 allows.
fn parse_range(value: Option<&str>, len: u64) -> ByteRange {
    let Some(spec) = value.and_then(|v| v.trim().strip_prefix("bytes=")) else {
        return ByteRange::Full;
    };
    if spec.contains(',') {
        return ByteRange::Full;
    }
    let Some((first, last)) = spec.trim().split_once('-') else {
        return ByteRange::Full;
    };

    if first.is_empty() {
        // Suffix range: the final `n` bytes.
        return match last.parse::<u64>() {
            Ok(0) => ByteRange::Unsatisfiable,
            Ok(_) if len == 0 => ByteRange::Unsatisfiable,
            Ok(n) => ByteRange::Partial {
                start: len.saturating_sub(n),
                end: len - 1,
            },
            Err(_) => ByteRange::Full,
        };
    }

    let Ok(start) = first.parse::<u64>() else {
        return ByteRange::Full;
    };
    let end = if last.is_empty() {
        None
    } else {
        match last.parse::<u64>() {
            Ok(end) if end >= start => Some(end),
            _ => return ByteRange::Full,
        }
    };
    if start >= len {
        return ByteRange::Unsatisfiable;
    }
    ByteRange::Partial {
        start,
        end: end.unwrap_or(len - 1).min(len - 1),
    }
}

/// Serve `dir/file` with `content_type` and the given cache policy.
///
/// Anything that is not an existing regular file inside `dir` is a 404.  A
/// single `bytes=` range yields a 206, or a 416 when it lies past the end.
pub async fn send_file(
    dir: &Path,
    file: &str,
    request_headers: &HeaderMap,
    content_type: &'static str,
    policy: CachePolicy,
) -> Result<Response, AppError> {
    let relative = Path::new(file);
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(AppError::NotFound);
    }
    let path = dir.join(relative);

    let meta = match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.is_file() => meta,
        _ => {
            debug!(path = %path.display(), "requested file not found");
            return Err(AppError::NotFound);
        }
    };

    let modified: Option<DateTime<Utc>> = meta.modified().ok().map(DateTime::<Utc>::from);

    let mut headers = HeaderMap::new();
    apply_cache_policy(&mut headers, policy);
    if let Some(modified) = modified {
        if let Ok(v) = HeaderValue::from_str(&http_date(modified)) {
            headers.insert(header::LAST_MODIFIED, v);
        }
    }

    if not_modified_since(request_headers, modified) {
        return Ok((StatusCode::NOT_MODIFIED, headers).into_response());
    }

    let len = meta.len();
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));

    let range = parse_range(
        request_headers
            .get(header::RANGE)
            .and_then(|v| v.to_str().ok()),
        len,
    );
    if range == ByteRange::Unsatisfiable {
        debug!(path = %path.display(), len, "range not satisfiable");
        if let Ok(v) = HeaderValue::from_str(&format!("bytes */{len}")) {
            headers.insert(header::CONTENT_RANGE, v);
        }
        return Ok((StatusCode::RANGE_NOT_SATISFIABLE, headers).into_response());
    }

    let mut file = tokio::fs::File::open(&path).await.map_err(|e| {
        debug!(path = %path.display(), error = %e, "failed to open file");
        AppError::NotFound
    })?;

    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));

    match range {
        ByteRange::Partial { start, end } => {
            let count = end - start + 1;
            file.seek(SeekFrom::Start(start)).await.map_err(|e| {
                AppError::Internal(anyhow::Error::new(e).context(format!(
                    "failed to seek {} to {start}",
                    path.display()
                )))
            })?;
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(count));
            if let Ok(v) = HeaderValue::from_str(&format!("bytes {start}-{end}/{len}")) {
                headers.insert(header::CONTENT_RANGE, v);
            }
            let body = Body::from_stream(ReaderStream::new(file.take(count)));
            Ok((StatusCode::PARTIAL_CONTENT, headers, body).into_response())
        }
        _ => {
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
            let body = Body::from_stream(ReaderStream::new(file));
            Ok((StatusCode::OK, headers, body).into_response())
        }
    }
}

/// True when the client's `If-Modified-Since` is at or after `modified`
/// (compared at one-second resolution).
fn not_modified_since(request_headers: &HeaderMap, modified: Option<DateTime<Utc>>) -> bool {
    let Some(modified) = modified else {
        return false;
    };
    request_headers
        .get(header::IF_MODIFIED_SINCE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_http_date)
        .is_some_and(|since| since.timestamp() >= modified.timestamp())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_date_format() {
        let at = DateTime::<Utc>::from_timestamp(0, 0).unwrap();
        assert_eq!(http_date(at), "Thu, 01 Jan 1970 00:00:00 GMT");
        assert_eq!(parse_http_date("Thu, 01 Jan 1970 00:00:00 GMT"), Some(at));
        assert_eq!(parse_http_date("yesterday"), None);
    }

    #[test]
    fn no_cache_headers() {
        let mut h = HeaderMap::new();
        apply_cache_policy(&mut h, CachePolicy::NoCache);
        assert_eq!(h[header::EXPIRES], "Fri, 01 Jan 1980 00:00:00 GMT");
        assert_eq!(h[header::PRAGMA], "no-cache");
        assert_eq!(h[header::CACHE_CONTROL], "no-cache, max-age=0, must-revalidate");
    }

    #[test]
    fn forever_headers_expire_a_year_out() {
        let mut h = HeaderMap::new();
        apply_cache_policy(&mut h, CachePolicy::Forever);
        assert_eq!(h[header::CACHE_CONTROL], "public, max-age=31536000");

        let date = parse_http_date(h[header::DATE].to_str().unwrap()).unwrap();
        let expires = parse_http_date(h[header::EXPIRES].to_str().unwrap()).unwrap();
        assert_eq!((expires - date).num_seconds(), ONE_YEAR_SECS);
        assert!(!h.contains_key(header::PRAGMA));
    }

    #[tokio::test]
    async fn serves_file_with_length_and_type() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("HEAD"), "ref: refs/heads/main\n").unwrap();

        let resp = send_file(tmp.path(), "HEAD", &HeaderMap::new(), TEXT_PLAIN, CachePolicy::NoCache)
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], TEXT_PLAIN);
        assert_eq!(resp.headers()[header::CONTENT_LENGTH], "21");
        assert_eq!(resp.headers()[header::ACCEPT_RANGES], "bytes");
        assert!(resp.headers().contains_key(header::LAST_MODIFIED));

        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"ref: refs/heads/main\n");
    }

    #[tokio::test]
    async fn missing_file_directory_and_traversal_are_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("objects/info")).unwrap();

        for file in ["objects/ab/missing", "objects/info", "objects/info/..", "../etc/passwd"] {
            let result = send_file(
                tmp.path(),
                file,
                &HeaderMap::new(),
                LOOSE_OBJECT,
                CachePolicy::Forever,
            )
            .await;
            assert!(matches!(result, Err(AppError::NotFound)), "{file}");
        }
    }

    #[tokio::test]
    async fn if_modified_since_returns_304() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("packs");
        std::fs::write(&path, "P pack-x.pack\n").unwrap();
        let modified = DateTime::<Utc>::from(std::fs::metadata(&path).unwrap().modified().unwrap());

        let mut req = HeaderMap::new();
        req.insert(
            header::IF_MODIFIED_SINCE,
            HeaderValue::from_str(&http_date(modified)).unwrap(),
        );
        let resp = send_file(tmp.path(), "packs", &req, TEXT_PLAIN_UTF8, CachePolicy::Forever)
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_MODIFIED);

        let earlier = modified - chrono::Duration::seconds(60);
        req.insert(
            header::IF_MODIFIED_SINCE,
            HeaderValue::from_str(&http_date(earlier)).unwrap(),
        );
        let resp = send_file(tmp.path(), "packs", &req, TEXT_PLAIN_UTF8, CachePolicy::Forever)
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[test]
    fn range_header_forms() {
        assert_eq!(parse_range(None, 10), ByteRange::Full);
        assert_eq!(
            parse_range(Some("bytes=2-5"), 10),
            ByteRange::Partial { start: 2, end: 5 }
        );
        assert_eq!(
            parse_range(Some("bytes=4-"), 10),
            ByteRange::Partial { start: 4, end: 9 }
        );
        assert_eq!(
            parse_range(Some("bytes=8-100"), 10),
            ByteRange::Partial { start: 8, end: 9 }
        );
        assert_eq!(
            parse_range(Some("bytes=-3"), 10),
            ByteRange::Partial { start: 7, end: 9 }
        );
        assert_eq!(
            parse_range(Some("bytes=-30"), 10),
            ByteRange::Partial { start: 0, end: 9 }
        );
        assert_eq!(parse_range(Some("bytes=10-"), 10), ByteRange::Unsatisfiable);
        assert_eq!(parse_range(Some("bytes=-0"), 10), ByteRange::Unsatisfiable);
        assert_eq!(parse_range(Some("bytes=0-"), 0), ByteRange::Unsatisfiable);

        for ignored in ["items=0-1", "bytes=0-1,4-5", "bytes=5-2", "bytes=x-", "bytes=3"] {
            assert_eq!(parse_range(Some(ignored), 10), ByteRange::Full, "{ignored}");
        }
    }

    #[tokio::test]
    async fn range_request_resumes_pack_download() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("pack-x.pack"), "PACKabcdefgh").unwrap();

        let mut req = HeaderMap::new();
        req.insert(header::RANGE, HeaderValue::from_static("bytes=4-"));
        let resp = send_file(tmp.path(), "pack-x.pack", &req, PACKED_OBJECTS, CachePolicy::Forever)
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(resp.headers()[header::CONTENT_RANGE], "bytes 4-11/12");
        assert_eq!(resp.headers()[header::CONTENT_LENGTH], "8");
        assert_eq!(resp.headers()[header::ACCEPT_RANGES], "bytes");
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"abcdefgh");

        req.insert(header::RANGE, HeaderValue::from_static("bytes=1-3"));
        let resp = send_file(tmp.path(), "pack-x.pack", &req, PACKED_OBJECTS, CachePolicy::Forever)
            .await
            .unwrap();
        assert_eq!(resp.headers()[header::CONTENT_RANGE], "bytes 1-3/12");
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"ACK");
    }

    #[tokio::test]
    async fn range_past_end_is_not_satisfiable() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("pack-x.pack"), "PACKabcdefgh").unwrap();

        let mut req = HeaderMap::new();
        req.insert(header::RANGE, HeaderValue::from_static("bytes=12-20"));
        let resp = send_file(tmp.path(), "pack-x.pack", &req, PACKED_OBJECTS, CachePolicy::Forever)
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(resp.headers()[header::CONTENT_RANGE], "bytes */12");

        // Unusable headers fall back to the whole file.
        req.insert(header::RANGE, HeaderValue::from_static("bytes=0-1,4-5"));
        let resp = send_file(tmp.path(), "pack-x.pack", &req, PACKED_OBJECTS, CachePolicy::Forever)
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_LENGTH], "12");
    }
}
