use crate::config::CompressionConfig;
use crate::server::body::BoxBody;
use bytes::Bytes;
use http::header::{CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING};
use http::{HeaderValue, Response};
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;

/// Content types that arrive already compressed — re-encoding them wastes
/// CPU for negative gain.
const PRECOMPRESSED_PREFIXES: &[&str] = &["image/", "video/", "audio/"];
const PRECOMPRESSED_EXACT: &[&str] = &[
    "application/zip",
    "application/gzip",
    "application/x-brotli",
    "application/pdf",
];

/// Negotiate the best encoding from the client's `Accept-Encoding` against
/// the configured allow-list. Quality values are honored: `br;q=0` never
/// selects brotli. Preference order: `br`, `gzip`, `deflate`.
pub fn negotiate_encoding(accept_encoding: &str, allowed: &[String]) -> Option<&'static str> {
    let mut br_ok = false;
    let mut gzip_ok = false;
    let mut deflate_ok = false;

    for part in accept_encoding.split(',') {
        let part = part.trim();
        let mut tokens = part.splitn(2, ';');
        let encoding = tokens.next().unwrap_or("").trim().to_ascii_lowercase();

        let q: f32 = tokens
            .next()
            .and_then(|params| {
                params.split(';').find_map(|p| {
                    let p = p.trim();
                    p.strip_prefix("q=").and_then(|v| v.trim().parse::<f32>().ok())
                })
            })
            .unwrap_or(1.0);

        if q <= 0.0 {
            continue;
        }

        match encoding.as_str() {
            "br" => br_ok = true,
            "gzip" => gzip_ok = true,
            "deflate" => deflate_ok = true,
            "*" => {
                br_ok = true;
                gzip_ok = true;
                deflate_ok = true;
            }
            _ => {}
        }
    }

    let permitted = |name: &str| allowed.iter().any(|a| a == name);
    if br_ok && permitted("br") {
        Some("br")
    } else if gzip_ok && permitted("gzip") {
        Some("gzip")
    } else if deflate_ok && permitted("deflate") {
        Some("deflate")
    } else {
        None
    }
}

fn is_precompressed(content_type: &str) -> bool {
    let ct = content_type
        .split(';')
        .next()
        .unwrap_or(content_type)
        .trim()
        .to_ascii_lowercase();
    PRECOMPRESSED_PREFIXES.iter().any(|p| ct.starts_with(p))
        || PRECOMPRESSED_EXACT.iter().any(|e| ct == *e)
}

/// Compress the response when the config, body size, content type, and the
/// client's `Accept-Encoding` all permit it. Streaming: the body is encoded
/// chunk by chunk, never buffered whole.
pub fn maybe_compress(
    config: &CompressionConfig,
    accept_encoding: Option<&str>,
    response: Response<BoxBody>,
) -> Response<BoxBody> {
    if !config.enabled {
        return response;
    }
    if response.headers().contains_key(CONTENT_ENCODING) {
        return response;
    }
    if let Some(ct) = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
    {
        if is_precompressed(ct) {
            return response;
        }
    }
    // Bodies at or under the threshold go out as-is; an unknown length
    // (streaming body) is assumed large enough.
    if let Some(len) = response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
    {
        if len <= config.threshold_bytes {
            return response;
        }
    }

    let encoding = match accept_encoding.and_then(|ae| negotiate_encoding(ae, &config.algorithms)) {
        Some(e) => e,
        None => return response,
    };

    compress_response(response, encoding)
}

/// Wrap the response body stream with the chosen encoder.
fn compress_response(resp: Response<BoxBody>, encoding: &'static str) -> Response<BoxBody> {
    let version = resp.version();
    let (mut parts, body) = resp.into_parts();

    let body_reader = tokio_util::io::StreamReader::new(BodyStream(body));
    let buf_reader = tokio::io::BufReader::new(body_reader);

    let compressed: BoxBody = match encoding {
        "br" => {
            let encoder = async_compression::tokio::bufread::BrotliEncoder::with_quality(
                buf_reader,
                async_compression::Level::Fastest,
            );
            wrap_encoder_as_body(encoder)
        }
        "gzip" => {
            let encoder = async_compression::tokio::bufread::GzipEncoder::new(buf_reader);
            wrap_encoder_as_body(encoder)
        }
        "deflate" => {
            let encoder = async_compression::tokio::bufread::DeflateEncoder::new(buf_reader);
            wrap_encoder_as_body(encoder)
        }
        _ => unreachable!(),
    };

    parts
        .headers
        .insert(CONTENT_ENCODING, HeaderValue::from_static(encoding));
    // The compressed size is unknown for a streaming body.
    parts.headers.remove(CONTENT_LENGTH);
    if version == http::Version::HTTP_11 || version == http::Version::HTTP_10 {
        parts
            .headers
            .insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
    }

    Response::from_parts(parts, compressed)
}

/// Read chunks out of an encoder and yield them as HTTP body frames.
fn wrap_encoder_as_body<R>(encoder: R) -> BoxBody
where
    R: tokio::io::AsyncRead + Send + Sync + 'static,
{
    use tokio::io::AsyncReadExt;

    let encoder = Box::pin(encoder);
    let stream = futures_util::stream::unfold(encoder, |mut enc| async move {
        let mut buf = vec![0u8; 8192];
        match enc.read(&mut buf).await {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                let frame: Result<Frame<Bytes>, hyper::Error> = Ok(Frame::data(Bytes::from(buf)));
                Some((frame, enc))
            }
            Err(_) => None,
        }
    });
    BodyExt::boxed(StreamBody::new(stream))
}

/// Bridge hyper's body framing to tokio's I/O traits so the encoders can
/// consume the body as a byte stream.
struct BodyStream(BoxBody);

impl futures_util::Stream for BodyStream {
    type Item = std::io::Result<Bytes>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        use hyper::body::Body;

        loop {
            match std::pin::Pin::new(&mut self.0).poll_frame(cx) {
                std::task::Poll::Ready(Some(Ok(frame))) => {
                    if let Ok(data) = frame.into_data() {
                        return std::task::Poll::Ready(Some(Ok(data)));
                    }
                    continue;
                }
                std::task::Poll::Ready(Some(Err(e))) => {
                    return std::task::Poll::Ready(Some(Err(std::io::Error::other(e.to_string()))));
                }
                std::task::Poll::Ready(None) => return std::task::Poll::Ready(None),
                std::task::Poll::Pending => return std::task::Poll::Pending,
            }
        }
    }
}
