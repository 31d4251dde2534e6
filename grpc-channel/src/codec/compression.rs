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

use std::{borrow::Cow, fmt};

use bytes::{BufMut, BytesMut};
#[cfg(feature = "deflate")]
use flate2::read::{ZlibDecoder, ZlibEncoder};
#[cfg(feature = "gzip")]
use flate2::read::{GzDecoder, GzEncoder};

use crate::Status;

pub(crate) const ENCODING_HEADER: &str = "grpc-encoding";
pub(crate) const ACCEPT_ENCODING_HEADER: &str = "grpc-accept-encoding";

/// The message compression encodings the channel supports.
///
/// `identity` is the absence of an encoding rather than a variant: a message
/// with no negotiated encoding travels uncompressed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum CompressionEncoding {
    #[allow(missing_docs)]
    #[cfg(feature = "gzip")]
    Gzip,
    #[allow(missing_docs)]
    #[cfg(feature = "deflate")]
    Deflate,
}

impl CompressionEncoding {
    pub(crate) const ENCODINGS: &'static [CompressionEncoding] = &[
        #[cfg(feature = "gzip")]
        CompressionEncoding::Gzip,
        #[cfg(feature = "deflate")]
        CompressionEncoding::Deflate,
    ];

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            #[cfg(feature = "gzip")]
            CompressionEncoding::Gzip => "gzip",
            #[cfg(feature = "deflate")]
            CompressionEncoding::Deflate => "deflate",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            #[cfg(feature = "gzip")]
            "gzip" => Some(CompressionEncoding::Gzip),
            #[cfg(feature = "deflate")]
            "deflate" => Some(CompressionEncoding::Deflate),
            _ => None,
        }
    }

    pub(crate) fn into_header_value(self) -> http::HeaderValue {
        http::HeaderValue::from_static(self.as_str())
    }

    /// Read the `grpc-encoding` header of a response.
    ///
    /// The server chooses the inbound encoding unilaterally; a choice the
    /// client does not know about is a protocol-level failure.
    pub(crate) fn from_response_encoding_header(
        headers: &http::HeaderMap,
    ) -> Result<Option<Self>, Status> {
        let Some(value) = headers.get(ENCODING_HEADER) else {
            return Ok(None);
        };
        match value.as_bytes() {
            b"identity" => Ok(None),
            other => match std::str::from_utf8(other).ok().and_then(Self::from_name) {
                Some(encoding) => Ok(Some(encoding)),
                None => Err(Status::internal(
                    "server picked a compression algorithm the client does not know about",
                )),
            },
        }
    }

    /// Read the `grpc-encoding` header of a request, as a server would.
    ///
    /// At most one value is allowed; an unsupported value fails with
    /// `Unimplemented` and a `grpc-accept-encoding` entry in the status
    /// metadata listing the supported algorithms.
    pub(crate) fn from_request_encoding_header(
        headers: &http::HeaderMap,
        enabled: EnabledCompressionEncodings,
    ) -> Result<Option<Self>, Status> {
        let mut values = headers.get_all(ENCODING_HEADER).iter();
        let Some(value) = values.next() else {
            return Ok(None);
        };
        if values.next().is_some() {
            return Err(unsupported_encoding_status("multiple values", enabled));
        }
        match value.as_bytes() {
            b"identity" => Ok(None),
            other => {
                let name = std::str::from_utf8(other).ok();
                match name.and_then(Self::from_name) {
                    Some(encoding) if enabled.is_enabled(encoding) => Ok(Some(encoding)),
                    _ => {
                        let other = match name {
                            Some(s) => Cow::Borrowed(s),
                            None => Cow::Owned(format!("{other:?}")),
                        };
                        Err(unsupported_encoding_status(&other, enabled))
                    }
                }
            }
        }
    }

    /// Based on the peer's `grpc-accept-encoding` header, pick an encoding to
    /// use for outbound messages.
    pub(crate) fn from_accept_encoding_header(
        headers: &http::HeaderMap,
        enabled: EnabledCompressionEncodings,
    ) -> Option<Self> {
        if enabled.is_empty() {
            return None;
        }
        let value = headers.get(ACCEPT_ENCODING_HEADER)?;
        let value = value.to_str().ok()?;
        value
            .split(',')
            .map(|s| s.trim())
            .find_map(|name| Self::from_name(name).filter(|e| enabled.is_enabled(*e)))
    }
}

impl fmt::Display for CompressionEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn unsupported_encoding_status(
    encoding: &str,
    enabled: EnabledCompressionEncodings,
) -> Status {
    let mut status = Status::unimplemented(format!(
        "content is compressed with `{encoding}` which isn't supported"
    ));
    let value = enabled
        .into_accept_encoding_header_value()
        .unwrap_or_else(|| http::HeaderValue::from_static("identity"));
    status.metadata_mut().insert(ACCEPT_ENCODING_HEADER, value);
    status
}

/// The ordered set of compression encodings enabled on a channel.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnabledCompressionEncodings {
    inner: [Option<CompressionEncoding>; 2],
}

impl EnabledCompressionEncodings {
    /// Enable a [`CompressionEncoding`], appending it to the preference list.
    pub fn enable(&mut self, encoding: CompressionEncoding) {
        for slot in self.inner.iter_mut() {
            match slot {
                Some(existing) if *existing == encoding => return,
                None => {
                    *slot = Some(encoding);
                    return;
                }
                _ => continue,
            }
        }
    }

    /// Check if a [`CompressionEncoding`] is enabled.
    pub fn is_enabled(&self, encoding: CompressionEncoding) -> bool {
        self.inner.contains(&Some(encoding))
    }

    /// Check if any [`CompressionEncoding`]s are enabled.
    pub fn is_empty(&self) -> bool {
        self.inner.iter().all(|e| e.is_none())
    }

    /// Render the `grpc-accept-encoding` header value, always terminated with
    /// `identity`. Returns `None` when nothing is enabled.
    pub(crate) fn into_accept_encoding_header_value(self) -> Option<http::HeaderValue> {
        let mut value = BytesMut::new();
        for encoding in self.inner.into_iter().flatten() {
            value.put_slice(encoding.as_str().as_bytes());
            value.put_u8(b',');
        }
        if value.is_empty() {
            return None;
        }
        value.put_slice(b"identity");
        http::HeaderValue::from_maybe_shared(value.freeze()).ok()
    }
}

/// Compress `len` bytes from `uncompressed_buf` into `out_buf`.
#[allow(unused_variables)]
pub(crate) fn compress(
    encoding: CompressionEncoding,
    uncompressed_buf: &[u8],
    out_buf: &mut BytesMut,
    len: usize,
) -> Result<(), std::io::Error> {
    let mut out_writer = out_buf.writer();
    match encoding {
        #[cfg(feature = "gzip")]
        CompressionEncoding::Gzip => {
            let mut encoder =
                GzEncoder::new(&uncompressed_buf[..len], flate2::Compression::new(6));
            std::io::copy(&mut encoder, &mut out_writer)?;
        }
        #[cfg(feature = "deflate")]
        CompressionEncoding::Deflate => {
            let mut encoder =
                ZlibEncoder::new(&uncompressed_buf[..len], flate2::Compression::new(6));
            std::io::copy(&mut encoder, &mut out_writer)?;
        }
    }
    Ok(())
}

/// Decompress `len` bytes from `compressed_buf` into `out_buf`, reading at
/// most `limit + 1` bytes of output so an oversized message is detected
/// without buffering it whole.
#[allow(unused_variables)]
pub(crate) fn decompress(
    encoding: CompressionEncoding,
    compressed_buf: &[u8],
    out_buf: &mut BytesMut,
    len: usize,
    limit: usize,
) -> Result<usize, std::io::Error> {
    use std::io::Read as _;

    let cap = (limit as u64).saturating_add(1);
    let mut out_writer = out_buf.writer();
    let written = match encoding {
        #[cfg(feature = "gzip")]
        CompressionEncoding::Gzip => {
            let decoder = GzDecoder::new(&compressed_buf[..len]);
            std::io::copy(&mut decoder.take(cap), &mut out_writer)?
        }
        #[cfg(feature = "deflate")]
        CompressionEncoding::Deflate => {
            let decoder = ZlibDecoder::new(&compressed_buf[..len]);
            std::io::copy(&mut decoder.take(cap), &mut out_writer)?
        }
    };
    Ok(written as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_enabled() -> EnabledCompressionEncodings {
        let mut enabled = EnabledCompressionEncodings::default();
        for &encoding in CompressionEncoding::ENCODINGS {
            enabled.enable(encoding);
        }
        enabled
    }

    #[test]
    #[cfg(all(feature = "gzip", feature = "deflate"))]
    fn accept_encoding_header_value() {
        assert_eq!(
            all_enabled().into_accept_encoding_header_value().unwrap(),
            http::HeaderValue::from_static("gzip,deflate,identity"),
        );
        assert!(
            EnabledCompressionEncodings::default()
                .into_accept_encoding_header_value()
                .is_none()
        );
    }

    #[test]
    fn response_identity_is_no_encoding() {
        let mut headers = http::HeaderMap::new();
        headers.insert(ENCODING_HEADER, http::HeaderValue::from_static("identity"));
        assert!(
            CompressionEncoding::from_response_encoding_header(&headers)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn response_unknown_encoding_is_internal() {
        let mut headers = http::HeaderMap::new();
        headers.insert(ENCODING_HEADER, http::HeaderValue::from_static("br"));
        let err = CompressionEncoding::from_response_encoding_header(&headers).unwrap_err();
        assert_eq!(err.code(), crate::Code::Internal);
        assert_eq!(
            err.message(),
            "server picked a compression algorithm the client does not know about"
        );
    }

    #[test]
    fn request_unknown_encoding_is_unimplemented_with_accept_list() {
        let mut headers = http::HeaderMap::new();
        headers.insert(ENCODING_HEADER, http::HeaderValue::from_static("br"));
        let err =
            CompressionEncoding::from_request_encoding_header(&headers, all_enabled()).unwrap_err();
        assert_eq!(err.code(), crate::Code::Unimplemented);
        assert!(err.metadata().contains_key(ACCEPT_ENCODING_HEADER));
    }

    #[test]
    #[cfg(feature = "gzip")]
    fn request_multiple_encodings_rejected() {
        let mut headers = http::HeaderMap::new();
        headers.append(ENCODING_HEADER, http::HeaderValue::from_static("gzip"));
        headers.append(ENCODING_HEADER, http::HeaderValue::from_static("identity"));
        let err =
            CompressionEncoding::from_request_encoding_header(&headers, all_enabled()).unwrap_err();
        assert_eq!(err.code(), crate::Code::Unimplemented);
    }

    #[test]
    #[cfg(feature = "deflate")]
    fn accept_encoding_picks_first_supported() {
        let mut headers = http::HeaderMap::new();
        headers.insert(
            ACCEPT_ENCODING_HEADER,
            http::HeaderValue::from_static("br, deflate, gzip"),
        );
        assert_eq!(
            CompressionEncoding::from_accept_encoding_header(&headers, all_enabled()),
            Some(CompressionEncoding::Deflate),
        );
    }

    #[test]
    #[cfg(feature = "gzip")]
    fn gzip_round_trip() {
        let input = b"hello hello hello hello hello".repeat(10);
        let mut compressed = BytesMut::new();
        compress(CompressionEncoding::Gzip, &input, &mut compressed, input.len()).unwrap();
        assert!(compressed.len() < input.len());

        let mut out = BytesMut::new();
        let n = decompress(
            CompressionEncoding::Gzip,
            &compressed,
            &mut out,
            compressed.len(),
            usize::MAX,
        )
        .unwrap();
        assert_eq!(n, input.len());
        assert_eq!(&out[..], &input[..]);
    }

    #[test]
    #[cfg(feature = "deflate")]
    fn deflate_round_trip() {
        let input = b"the quick brown fox jumps over the lazy dog ".repeat(8);
        let mut compressed = BytesMut::new();
        compress(
            CompressionEncoding::Deflate,
            &input,
            &mut compressed,
            input.len(),
        )
        .unwrap();

        let mut out = BytesMut::new();
        decompress(
            CompressionEncoding::Deflate,
            &compressed,
            &mut out,
            compressed.len(),
            usize::MAX,
        )
        .unwrap();
        assert_eq!(&out[..], &input[..]);
    }

    #[test]
    #[cfg(feature = "gzip")]
    fn decompress_stops_past_limit() {
        let input = vec![0u8; 64 * 1024];
        let mut compressed = BytesMut::new();
        compress(CompressionEncoding::Gzip, &input, &mut compressed, input.len()).unwrap();

        let mut out = BytesMut::new();
        let n = decompress(
            CompressionEncoding::Gzip,
            &compressed,
            &mut out,
            compressed.len(),
            1024,
        )
        .unwrap();
        assert_eq!(n, 1025);
    }
}
