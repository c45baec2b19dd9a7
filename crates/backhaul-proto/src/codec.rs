//! Single-message HTTP/1.1 codec for the ephemeral data-plane connection.
//!
//! Each leg of a proxied exchange is one complete serialized HTTP message:
//! request line (or status line), headers, and body, sent as a single
//! binary frame. Because the message is atomic there is no incremental
//! framing; `Content-Length` is normalized to the actual body length on
//! encode and any `Transfer-Encoding` is dropped.

use bytes::Bytes;
use http::{Request, Response};
use thiserror::Error;

/// Maximum number of headers accepted in a serialized message.
const MAX_HEADERS: usize = 100;

/// Errors decoding or encoding a serialized HTTP message.
///
/// These are protocol faults scoped to a single request; they never tear
/// down the tunnel that carried the identifier.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("serialized message ended before headers were complete")]
    Incomplete,

    #[error("malformed HTTP message: {0}")]
    Malformed(#[from] httparse::Error),

    #[error("invalid {0} in serialized message")]
    Invalid(&'static str),
}

/// Serialize a captured request into a single wire message.
pub fn encode_request(req: &Request<Bytes>) -> Vec<u8> {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let mut out = Vec::with_capacity(256 + req.body().len());
    out.extend_from_slice(req.method().as_str().as_bytes());
    out.push(b' ');
    out.extend_from_slice(path.as_bytes());
    out.extend_from_slice(b" HTTP/1.1\r\n");
    encode_headers(&mut out, req.headers(), req.body().len());
    out.extend_from_slice(req.body());
    out
}

/// Serialize a response into a single wire message.
pub fn encode_response(resp: &Response<Bytes>) -> Vec<u8> {
    let status = resp.status();
    let mut out = Vec::with_capacity(256 + resp.body().len());
    out.extend_from_slice(b"HTTP/1.1 ");
    out.extend_from_slice(status.as_str().as_bytes());
    out.push(b' ');
    out.extend_from_slice(status.canonical_reason().unwrap_or("").as_bytes());
    out.extend_from_slice(b"\r\n");
    encode_headers(&mut out, resp.headers(), resp.body().len());
    out.extend_from_slice(resp.body());
    out
}

fn encode_headers(out: &mut Vec<u8>, headers: &http::HeaderMap, body_len: usize) {
    for (name, value) in headers {
        // Normalized below; a stale length or chunked encoding would
        // contradict the atomic body we append.
        if *name == http::header::CONTENT_LENGTH || *name == http::header::TRANSFER_ENCODING {
            continue;
        }
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(format!("content-length: {body_len}\r\n\r\n").as_bytes());
}

/// Parse a single wire message back into a request.
pub fn decode_request(data: &[u8]) -> Result<Request<Bytes>, CodecError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut headers);

    match parsed.parse(data)? {
        httparse::Status::Complete(header_len) => {
            let method = parsed.method.ok_or(CodecError::Invalid("method"))?;
            let path = parsed.path.ok_or(CodecError::Invalid("path"))?;

            let mut builder = Request::builder().method(method).uri(path);
            for header in parsed.headers.iter() {
                builder = builder.header(header.name, header.value);
            }

            builder
                .body(Bytes::copy_from_slice(&data[header_len..]))
                .map_err(|_| CodecError::Invalid("request"))
        }
        httparse::Status::Partial => Err(CodecError::Incomplete),
    }
}

/// Parse a single wire message back into a response.
pub fn decode_response(data: &[u8]) -> Result<Response<Bytes>, CodecError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Response::new(&mut headers);

    match parsed.parse(data)? {
        httparse::Status::Complete(header_len) => {
            let code = parsed.code.ok_or(CodecError::Invalid("status"))?;

            let mut builder = Response::builder().status(code);
            for header in parsed.headers.iter() {
                builder = builder.header(header.name, header.value);
            }

            builder
                .body(Bytes::copy_from_slice(&data[header_len..]))
                .map_err(|_| CodecError::Invalid("response"))
        }
        httparse::Status::Partial => Err(CodecError::Incomplete),
    }
}
