//! Range Server: byte-range GET/HEAD downloads of the original source file.

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

use crate::error::{PlayError, Result};

/// A parsed, validated byte range, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

/// Parse a `Range: bytes=start-end` header value against a known total size.
///
/// Missing start means 0; missing end means `size-1`. Returns `Err(RangeNotSatisfiable)` for
/// `start > end`, or `end >= size`.
pub fn parse_range(header_value: &str, size: u64) -> Result<ByteRange> {
    let spec = header_value
        .strip_prefix("bytes=")
        .ok_or(PlayError::RangeNotSatisfiable)?;
    let (start_s, end_s) = spec.split_once('-').ok_or(PlayError::RangeNotSatisfiable)?;

    let (start, end) = if start_s.is_empty() {
        // suffix form: bytes=-100 means "last 100 bytes"
        let suffix_len: u64 = end_s.parse().map_err(|_| PlayError::RangeNotSatisfiable)?;
        if suffix_len == 0 || suffix_len > size {
            (0, size.saturating_sub(1))
        } else {
            (size - suffix_len, size - 1)
        }
    } else {
        let start: u64 = start_s.parse().map_err(|_| PlayError::RangeNotSatisfiable)?;
        let end: u64 = if end_s.is_empty() {
            size.saturating_sub(1)
        } else {
            end_s.parse().map_err(|_| PlayError::RangeNotSatisfiable)?
        };
        (start, end)
    };

    if start > end || end >= size {
        return Err(PlayError::RangeNotSatisfiable);
    }
    Ok(ByteRange { start, end })
}

/// Serve a file with full Range Server semantics.
pub async fn serve_file(
    method: &Method,
    headers: &HeaderMap,
    path: &std::path::Path,
    content_type: &str,
) -> Response {
    let meta = match tokio::fs::metadata(path).await {
        Ok(m) => m,
        Err(_) => return PlayError::NoMetadata(path.display().to_string()).into_response(),
    };
    let size = meta.len();

    let common_headers = |resp: &mut Response| {
        let h = resp.headers_mut();
        h.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        h.insert(header::CONTENT_ENCODING, HeaderValue::from_static("identity"));
        h.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        h.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_str(content_type).unwrap_or(HeaderValue::from_static("application/octet-stream")),
        );
    };

    let range_header = headers.get(header::RANGE).and_then(|v| v.to_str().ok());

    if method == Method::HEAD || range_header.is_none() {
        let mut resp = Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_LENGTH, size)
            .body(Body::empty())
            .unwrap();
        common_headers(&mut resp);
        return resp;
    }

    let range = match parse_range(range_header.unwrap(), size) {
        Ok(r) => r,
        Err(e) => return e.into_response(),
    };

    let mut file = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(e) => return PlayError::Io(e).into_response(),
    };
    if file.seek(std::io::SeekFrom::Start(range.start)).await.is_err() {
        return PlayError::RangeNotSatisfiable.into_response();
    }

    let len = range.end - range.start + 1;
    let limited = file.take(len);
    let stream = ReaderStream::new(limited);
    let body = Body::from_stream(stream);

    let mut resp = Response::builder()
        .status(StatusCode::PARTIAL_CONTENT)
        .header(header::CONTENT_LENGTH, len)
        .header(
            header::CONTENT_RANGE,
            format!("bytes {}-{}/{}", range.start, range.end, size),
        )
        .body(body)
        .unwrap();
    common_headers(&mut resp);
    resp
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_range_basic() {
        let r = parse_range("bytes=0-499", 1000).unwrap();
        assert_eq!(r, ByteRange { start: 0, end: 499 });
    }

    #[test]
    fn test_parse_range_suffix() {
        let r = parse_range("bytes=-100", 1000).unwrap();
        assert_eq!(r, ByteRange { start: 900, end: 999 });
    }

    #[test]
    fn test_parse_range_missing_end() {
        let r = parse_range("bytes=500-", 1000).unwrap();
        assert_eq!(r, ByteRange { start: 500, end: 999 });
    }

    #[test]
    fn test_parse_range_out_of_bounds_is_416() {
        let err = parse_range("bytes=500-1500", 1000).unwrap_err();
        assert!(matches!(err, PlayError::RangeNotSatisfiable));
    }

    #[test]
    fn test_parse_range_start_after_end_is_416() {
        let err = parse_range("bytes=500-100", 1000).unwrap_err();
        assert!(matches!(err, PlayError::RangeNotSatisfiable));
    }
}
