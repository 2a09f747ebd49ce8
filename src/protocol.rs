//! Wire codec for the prime protocol.
//!
//! The protocol is raw ASCII text with no framing:
//!
//! ```text
//! Request:  <n>            (decimal digits, one request per read)
//! Response: <nth prime>\n
//!
//! Request:  abc
//! Response: Invalid number - invalid digit in 'abc'\n
//! ```
//!
//! Each chunk returned by a single read is treated as exactly one request.

use bytes::{BufMut, Bytes, BytesMut};
use std::num::{IntErrorKind, NonZeroU64};

/// Maximum number of bytes read from a connection per request.
pub const MAX_READ_SIZE: usize = 1024;

/// Prefix of every error response.
const ERROR_PREFIX: &[u8] = b"Invalid number - ";

/// Reasons a payload is not a valid request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Payload was empty or only whitespace.
    Empty,
    /// Payload was not valid UTF-8.
    NotUtf8,
    /// Payload contained something other than decimal digits.
    InvalidDigit(String),
    /// Payload parsed, but is zero or negative.
    NotPositive(String),
    /// Payload does not fit in a 64-bit integer.
    TooLarge(String),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Empty => write!(f, "empty payload"),
            DecodeError::NotUtf8 => write!(f, "payload is not valid text"),
            DecodeError::InvalidDigit(text) => write!(f, "invalid digit in '{text}'"),
            DecodeError::NotPositive(text) => write!(f, "'{text}' is not a positive integer"),
            DecodeError::TooLarge(text) => write!(f, "'{text}' is too large"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Decode a chunk as a non-negative decimal integer.
///
/// Surrounding whitespace is ignored so line-oriented clients work too.
/// A well-formed negative number is rejected as [`DecodeError::NotPositive`].
pub fn decode_integer(chunk: &[u8]) -> Result<u64, DecodeError> {
    let text = std::str::from_utf8(chunk).map_err(|_| DecodeError::NotUtf8)?;
    let text = text.trim();

    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    // A sign is only valid in front of digits.
    if negative && digits.starts_with(['+', '-']) {
        return Err(DecodeError::InvalidDigit(text.to_string()));
    }

    let value = digits.parse::<u64>().map_err(|e| match e.kind() {
        IntErrorKind::Empty if !negative => DecodeError::Empty,
        IntErrorKind::PosOverflow => DecodeError::TooLarge(text.to_string()),
        _ => DecodeError::InvalidDigit(text.to_string()),
    })?;

    if negative && value > 0 {
        return Err(DecodeError::NotPositive(text.to_string()));
    }
    Ok(value)
}

/// Decode a chunk as a request for the Nth prime.
pub fn decode_request(chunk: &[u8]) -> Result<NonZeroU64, DecodeError> {
    let value = decode_integer(chunk)?;
    NonZeroU64::new(value).ok_or_else(|| DecodeError::NotPositive(value.to_string()))
}

/// Encode an integer response line.
pub fn encode_integer(value: u64) -> Bytes {
    let text = value.to_string();
    let mut out = BytesMut::with_capacity(text.len() + 1);
    out.put_slice(text.as_bytes());
    out.put_u8(b'\n');
    out.freeze()
}

/// Encode an error response line.
pub fn encode_error(err: &DecodeError) -> Bytes {
    let detail = err.to_string();
    let mut out = BytesMut::with_capacity(ERROR_PREFIX.len() + detail.len() + 1);
    out.put_slice(ERROR_PREFIX);
    out.put_slice(detail.as_bytes());
    out.put_u8(b'\n');
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_request() {
        assert_eq!(decode_request(b"5").unwrap().get(), 5);
        assert_eq!(decode_request(b"10000").unwrap().get(), 10000);
    }

    #[test]
    fn test_decode_trims_whitespace() {
        assert_eq!(decode_request(b"13\n").unwrap().get(), 13);
        assert_eq!(decode_request(b"  7\r\n").unwrap().get(), 7);
    }

    #[test]
    fn test_decode_non_numeric() {
        assert_eq!(
            decode_request(b"abc"),
            Err(DecodeError::InvalidDigit("abc".to_string()))
        );
        assert_eq!(
            decode_request(b"1 2"),
            Err(DecodeError::InvalidDigit("1 2".to_string()))
        );
    }

    #[test]
    fn test_decode_empty() {
        assert_eq!(decode_request(b""), Err(DecodeError::Empty));
        assert_eq!(decode_request(b" \n"), Err(DecodeError::Empty));
    }

    #[test]
    fn test_decode_not_utf8() {
        assert_eq!(decode_request(&[0xff, 0xfe]), Err(DecodeError::NotUtf8));
    }

    #[test]
    fn test_decode_not_positive() {
        assert_eq!(
            decode_request(b"0"),
            Err(DecodeError::NotPositive("0".to_string()))
        );
        assert_eq!(
            decode_request(b"-3"),
            Err(DecodeError::NotPositive("-3".to_string()))
        );
    }

    #[test]
    fn test_decode_too_large() {
        assert!(matches!(
            decode_request(b"99999999999999999999999"),
            Err(DecodeError::TooLarge(_))
        ));
    }

    #[test]
    fn test_integer_round_trip() {
        for value in [0u64, 1, 2, 11, 104_729, i64::MAX as u64, i64::MAX as u64 + 1, u64::MAX] {
            let encoded = encode_integer(value);
            assert_eq!(decode_integer(&encoded), Ok(value));
        }
    }

    #[test]
    fn test_decode_signs() {
        assert_eq!(decode_integer(b"+5"), Ok(5));
        assert_eq!(decode_integer(b"-0"), Ok(0));
        assert_eq!(
            decode_integer(b"-18446744073709551615"),
            Err(DecodeError::NotPositive("-18446744073709551615".to_string()))
        );
        assert_eq!(
            decode_integer(b"-"),
            Err(DecodeError::InvalidDigit("-".to_string()))
        );
        assert_eq!(
            decode_integer(b"--3"),
            Err(DecodeError::InvalidDigit("--3".to_string()))
        );
        assert_eq!(
            decode_integer(b"-+3"),
            Err(DecodeError::InvalidDigit("-+3".to_string()))
        );
    }

    #[test]
    fn test_decode_beyond_u64() {
        assert_eq!(
            decode_integer(b"18446744073709551616"),
            Err(DecodeError::TooLarge("18446744073709551616".to_string()))
        );
        assert_eq!(
            decode_integer(b"-18446744073709551616"),
            Err(DecodeError::TooLarge("-18446744073709551616".to_string()))
        );
    }

    #[test]
    fn test_encode_integer() {
        assert_eq!(&encode_integer(11)[..], b"11\n");
    }

    #[test]
    fn test_encode_error() {
        let err = decode_request(b"abc").unwrap_err();
        let encoded = encode_error(&err);
        assert!(encoded.starts_with(b"Invalid number - "));
        assert!(encoded.ends_with(b"\n"));
        assert_eq!(&encoded[..], b"Invalid number - invalid digit in 'abc'\n");
    }
}
