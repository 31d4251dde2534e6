/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to
 * deal in the Software without restriction, including without limitation the
 * rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
 * sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
 * IN THE SOFTWARE.
 *
 */

//! Helpers for custom metadata carried in gRPC headers and trailers.
//!
//! Keys ending in `-bin` carry binary values, base64-encoded on the wire.
//! Senders omit padding; receivers accept padded and unpadded values.

use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};

use crate::{Status, status};

const BIN_SUFFIX: &str = "-bin";

// Headers owned by the protocol itself; never surfaced as custom metadata.
const RESERVED: &[&str] = &[
    status::GRPC_STATUS_HEADER,
    status::GRPC_MESSAGE_HEADER,
    "grpc-encoding",
    "grpc-accept-encoding",
    "grpc-timeout",
    "content-type",
    "te",
];

/// Whether a metadata key carries a base64-encoded binary value.
pub fn is_bin_key(name: &HeaderName) -> bool {
    name.as_str().ends_with(BIN_SUFFIX)
}

fn is_reserved(name: &HeaderName) -> bool {
    RESERVED.contains(&name.as_str())
}

/// Base64-encode a binary metadata value for the wire.
pub fn encode_bin_value(value: &[u8]) -> HeaderValue {
    let encoded = STANDARD_NO_PAD.encode(value);
    // Base64 output is always a valid header value.
    HeaderValue::from_str(&encoded).unwrap_or_else(|_| HeaderValue::from_static(""))
}

/// Decode a binary metadata value received from the wire.
pub fn decode_bin_value(value: &HeaderValue) -> Result<Bytes, Status> {
    let raw = value.as_bytes();
    let trimmed = raw.strip_suffix(b"==").or_else(|| raw.strip_suffix(b"=")).unwrap_or(raw);
    STANDARD_NO_PAD
        .decode(trimmed)
        .or_else(|_| STANDARD.decode(raw))
        .map(Bytes::from)
        .map_err(|err| Status::internal(format!("invalid base64 in binary metadata: {err}")))
}

/// Extract the custom (application) metadata from a header block, dropping
/// everything the protocol owns.
pub(crate) fn custom_metadata(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        if !is_reserved(name) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}
