use crate::backend::policy::{CompressionAlgorithm, CompressionPolicy};
use async_compression::tokio::bufread::{BrotliEncoder, GzipEncoder};
use async_compression::Level;
use bytes::Bytes;
use futures_util::stream::{self, Stream, StreamExt};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Body, Frame, Incoming};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncBufRead, AsyncReadExt, BufReader};
use tokio_util::io::StreamReader;

pub type AnyBody = BoxBody<Bytes, hyper::Error>;

/// Parses `Accept-Encoding` with quality-value awareness (`q=0` excluded)
/// and returns the policy's most-preferred algorithm the client accepts.
/// `br` is preferred over `gzip` when both are acceptable.
pub fn negotiate_encoding(
    policy: &CompressionPolicy,
    accept_encoding: Option<&HeaderValue>,
) -> Option<CompressionAlgorithm> {
    let header = accept_encoding?.to_str().ok()?;
    let mut accepted: Vec<(String, f32)> = Vec::new();
    for part in header.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let mut pieces = part.split(';');
        let coding = pieces.next().unwrap_or("").trim().to_ascii_lowercase();
        let mut q = 1.0f32;
        for p in pieces {
            let p = p.trim();
            if let Some(v) = p.strip_prefix("q=") {
                q = v.parse().unwrap_or(1.0);
            }
        }
        accepted.push((coding, q));
    }

    let accepts = |name: &str| -> bool {
        accepted.iter().any(|(c, q)| (c == name || c == "*") && *q > 0.0)
    };

    for alg in &policy.algorithms {
        match alg {
            CompressionAlgorithm::Brotli if accepts("br") || accepts("brotli") => {
                return Some(CompressionAlgorithm::Brotli)
            }
            CompressionAlgorithm::Gzip if accepts("gzip") => return Some(CompressionAlgorithm::Gzip),
            _ => {}
        }
    }
    None
}

/// Eligibility per §3 `CompressionPolicy`: non-WebSocket (caller ensures
/// this by only calling on ordinary responses), no existing
/// `Content-Encoding`, method != HEAD, status in the eligible set,
/// `Content-Type` matches the prefix list, declared length (if known) is at
/// least `min_size`.
pub fn is_eligible(
    policy: &CompressionPolicy,
    method: &Method,
    status: StatusCode,
    headers: &HeaderMap,
) -> bool {
    if !policy.enabled || method == Method::HEAD {
        return false;
    }
    if headers.contains_key(http::header::CONTENT_ENCODING) {
        return false;
    }
    let status_ok = match status.as_u16() {
        204 | 304 => false,
        200..=299 => true,
        other => other < 500,
    };
    if !status_ok {
        return false;
    }
    let content_type = headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !policy.content_type_allowed(content_type) {
        return false;
    }
    if let Some(len) = headers
        .get(http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
    {
        if len < policy.min_size {
            return false;
        }
    }
    true
}

/// Adapts a hyper body into a byte stream so it can be piped through an
/// async-compression encoder without buffering the whole response.
struct BodyStream {
    body: Incoming,
}

impl Stream for BodyStream {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            let body = Pin::new(&mut self.body);
            match body.poll_frame(cx) {
                Poll::Ready(Some(Ok(frame))) => {
                    if let Ok(data) = frame.into_data() {
                        return Poll::Ready(Some(Ok(data)));
                    }
                    continue;
                }
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Some(Err(io::Error::new(io::ErrorKind::Other, e))))
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

fn read_loop_body(reader: impl AsyncBufRead + Unpin + Send + 'static) -> AnyBody {
    let s = stream::unfold(Box::pin(reader), |mut reader| async move {
        let mut buf = vec![0u8; 8192];
        match reader.read(&mut buf).await {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                Some((Ok::<Frame<Bytes>, hyper::Error>(Frame::data(Bytes::from(buf))), reader))
            }
            Err(_) => None,
        }
    });
    BoxBody::new(StreamBody::new(s))
}

/// Streams `incoming` through a compressor for `algorithm`, returning a body
/// ready to be sent downstream. Caller is responsible for also stripping
/// `Content-Length`, setting `Content-Encoding`, and adding
/// `Vary: Accept-Encoding` on the response headers.
pub fn compress_body(incoming: Incoming, algorithm: CompressionAlgorithm, level: Level) -> AnyBody {
    let stream = BodyStream { body: incoming };
    let reader = StreamReader::new(stream.map(|r| r.map_err(|e| io::Error::new(io::ErrorKind::Other, e))));
    let buffered = BufReader::new(reader);
    match algorithm {
        CompressionAlgorithm::Gzip => {
            read_loop_body(GzipEncoder::with_quality(buffered, level))
        }
        CompressionAlgorithm::Brotli => {
            read_loop_body(BrotliEncoder::with_quality(buffered, level))
        }
    }
}

pub fn encoding_token(algorithm: CompressionAlgorithm) -> &'static str {
    match algorithm {
        CompressionAlgorithm::Brotli => "br",
        CompressionAlgorithm::Gzip => "gzip",
    }
}

/// Adds `Vary: Accept-Encoding`, preserving any existing `Vary` values —
/// the teacher's compression path was missing this header entirely.
pub fn add_vary_accept_encoding(headers: &mut HeaderMap) {
    match headers.get(http::header::VARY).and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.split(',').any(|v| v.trim().eq_ignore_ascii_case("accept-encoding")) => {
            let merged = format!("{existing}, Accept-Encoding");
            if let Ok(v) = HeaderValue::from_str(&merged) {
                headers.insert(http::header::VARY, v);
            }
        }
        None => {
            headers.insert(http::header::VARY, HeaderValue::from_static("Accept-Encoding"));
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> CompressionPolicy {
        CompressionPolicy::default()
    }

    #[test]
    fn negotiate_prefers_br_over_gzip() {
        let header = HeaderValue::from_static("gzip, br");
        assert_eq!(
            negotiate_encoding(&policy(), Some(&header)),
            Some(CompressionAlgorithm::Brotli)
        );
    }

    #[test]
    fn negotiate_respects_q0_exclusion() {
        let header = HeaderValue::from_static("br;q=0, gzip");
        assert_eq!(
            negotiate_encoding(&policy(), Some(&header)),
            Some(CompressionAlgorithm::Gzip)
        );
    }

    #[test]
    fn negotiate_wildcard_accepts_any() {
        let header = HeaderValue::from_static("*");
        assert_eq!(
            negotiate_encoding(&policy(), Some(&header)),
            Some(CompressionAlgorithm::Brotli)
        );
    }

    #[test]
    fn negotiate_none_when_absent() {
        assert_eq!(negotiate_encoding(&policy(), None), None);
    }

    #[test]
    fn eligibility_rejects_head_and_existing_encoding() {
        let p = policy();
        let mut headers = HeaderMap::new();
        assert!(is_eligible(&p, &Method::GET, StatusCode::OK, &headers));
        assert!(!is_eligible(&p, &Method::HEAD, StatusCode::OK, &headers));
        headers.insert(http::header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        assert!(!is_eligible(&p, &Method::GET, StatusCode::OK, &headers));
    }

    #[test]
    fn eligibility_rejects_small_bodies() {
        let p = CompressionPolicy {
            min_size: 1000,
            ..policy()
        };
        let mut headers = HeaderMap::new();
        headers.insert(http::header::CONTENT_LENGTH, HeaderValue::from_static("10"));
        assert!(!is_eligible(&p, &Method::GET, StatusCode::OK, &headers));
    }

    #[test]
    fn eligibility_rejects_204_and_304() {
        let p = policy();
        let headers = HeaderMap::new();
        assert!(!is_eligible(&p, &Method::GET, StatusCode::NO_CONTENT, &headers));
        assert!(!is_eligible(&p, &Method::GET, StatusCode::NOT_MODIFIED, &headers));
    }

    #[test]
    fn vary_header_added_when_absent() {
        let mut headers = HeaderMap::new();
        add_vary_accept_encoding(&mut headers);
        assert_eq!(headers.get(http::header::VARY).unwrap(), "Accept-Encoding");
    }

    #[test]
    fn vary_header_merged_when_present() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::VARY, HeaderValue::from_static("Origin"));
        add_vary_accept_encoding(&mut headers);
        assert_eq!(headers.get(http::header::VARY).unwrap(), "Origin, Accept-Encoding");
    }
}
