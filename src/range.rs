//! Chunk header parsing.
//!
//! Turns the `Content-Range` / `Content-Disposition` headers of an inbound
//! request into a normalized [`ChunkDescriptor`].  Pure functions, no side
//! effects.  A request missing either header is not a chunk request at all;
//! [`parse_chunk_headers`] signals that with `Ok(None)` so the dispatcher
//! can fall back to the normal, non-chunked flow.

use axum::http::HeaderMap;

use crate::errors::UploadError;

/// One request's worth of bytes for a logical upload, located by its byte
/// range within the whole file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDescriptor {
    /// Byte offset of this chunk within the whole file.
    pub offset: u64,
    /// Number of bytes in this chunk.
    pub chunk_length: u64,
    /// Declared total size of the whole file.
    pub total_length: u64,
    /// Filename declared by the client.
    pub filename: String,
    /// Content type declared by the client (advisory).
    pub mime_type_hint: String,
}

impl ChunkDescriptor {
    /// Whether this chunk is the terminal chunk of its upload.
    pub fn is_terminal(&self) -> bool {
        self.offset + self.chunk_length == self.total_length
    }
}

/// Parse the chunk headers of a request.
///
/// Returns `Ok(None)` when either `Content-Range` or `Content-Disposition`
/// is absent (a normal, non-chunked request), `Ok(Some(descriptor))` for a
/// well-formed chunk request, and `MalformedRange` for anything in between.
pub fn parse_chunk_headers(headers: &HeaderMap) -> Result<Option<ChunkDescriptor>, UploadError> {
    let range = headers.get("content-range").and_then(|v| v.to_str().ok());
    let disposition = headers
        .get("content-disposition")
        .and_then(|v| v.to_str().ok());

    let (range, disposition) = match (range, disposition) {
        (Some(r), Some(d)) => (r, d),
        _ => return Ok(None),
    };

    let (offset, chunk_length, total_length) = parse_content_range(range)?;
    let filename = parse_disposition_filename(disposition)?;
    let mime_type_hint = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();

    Ok(Some(ChunkDescriptor {
        offset,
        chunk_length,
        total_length,
        filename,
        mime_type_hint,
    }))
}

/// Parse `bytes {start}-{end}/{total}` into `(offset, chunk_length, total)`.
///
/// `end` is inclusive, per RFC 9110. The unsatisfied-range form (`bytes */N`)
/// and wildcard totals (`bytes 0-9/*`) are rejected: a chunked upload must
/// declare its total up front so completion can be detected.
pub fn parse_content_range(value: &str) -> Result<(u64, u64, u64), UploadError> {
    let malformed = |message: &str| UploadError::MalformedRange {
        message: format!("invalid Content-Range '{value}': {message}"),
    };

    let spec = value
        .trim()
        .strip_prefix("bytes")
        .ok_or_else(|| malformed("expected 'bytes' unit"))?
        .trim_start();

    let (range_part, total_part) = spec
        .split_once('/')
        .ok_or_else(|| malformed("missing '/total'"))?;

    let total_length: u64 = total_part
        .trim()
        .parse()
        .map_err(|_| malformed("total is not a number"))?;

    let (start_s, end_s) = range_part
        .trim()
        .split_once('-')
        .ok_or_else(|| malformed("missing '-' in range"))?;

    let start: u64 = start_s
        .trim()
        .parse()
        .map_err(|_| malformed("start is not a number"))?;
    let end: u64 = end_s
        .trim()
        .parse()
        .map_err(|_| malformed("end is not a number"))?;

    if end < start {
        return Err(malformed("end precedes start"));
    }

    // Checked arithmetic: start, end, and total are attacker-controlled and
    // may sit anywhere in the u64 domain.
    let chunk_length = end
        .checked_sub(start)
        .and_then(|width| width.checked_add(1))
        .ok_or_else(|| malformed("range width overflows"))?;

    // Protocol invariant, not a warning: the chunk must fit in the file.
    let range_end = start
        .checked_add(chunk_length)
        .ok_or_else(|| malformed("range extends past declared total"))?;
    if range_end > total_length {
        return Err(malformed("range extends past declared total"));
    }

    Ok((start, chunk_length, total_length))
}

/// Extract the filename from a `Content-Disposition` header value.
///
/// Prefers the RFC 5987 `filename*` parameter when present, otherwise the
/// plain `filename` parameter. Path components are stripped so a hostile
/// client cannot steer the final file out of its destination folder.
pub fn parse_disposition_filename(value: &str) -> Result<String, UploadError> {
    let malformed = |message: &str| UploadError::MalformedRange {
        message: format!("invalid Content-Disposition: {message}"),
    };

    let mut plain: Option<String> = None;
    let mut extended: Option<String> = None;

    for param in value.split(';').skip(1) {
        let Some((key, raw)) = param.split_once('=') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        let raw = raw.trim();

        if key == "filename*" {
            // RFC 5987: charset'language'percent-encoded-value
            let encoded = raw
                .rsplit_once('\'')
                .map(|(_, v)| v)
                .ok_or_else(|| malformed("bad filename* encoding"))?;
            let decoded = percent_encoding::percent_decode_str(encoded)
                .decode_utf8()
                .map_err(|_| malformed("filename* is not valid UTF-8"))?;
            extended = Some(decoded.into_owned());
        } else if key == "filename" {
            plain = Some(raw.trim_matches('"').to_string());
        }
    }

    let filename = extended
        .or(plain)
        .ok_or_else(|| malformed("no filename parameter"))?;

    // Keep only the basename.
    let filename = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or("")
        .to_string();

    if filename.is_empty() || filename == "." || filename == ".." {
        return Err(malformed("filename is empty or a path traversal"));
    }

    Ok(filename)
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(range: Option<&str>, disposition: Option<&str>) -> HeaderMap {
        let mut h = HeaderMap::new();
        if let Some(r) = range {
            h.insert("content-range", HeaderValue::from_str(r).unwrap());
        }
        if let Some(d) = disposition {
            h.insert("content-disposition", HeaderValue::from_str(d).unwrap());
        }
        h
    }

    #[test]
    fn test_parse_valid_chunk() {
        let h = headers(
            Some("bytes 0-4/10"),
            Some("attachment; filename=\"photo.jpg\""),
        );
        let d = parse_chunk_headers(&h).unwrap().unwrap();
        assert_eq!(d.offset, 0);
        assert_eq!(d.chunk_length, 5);
        assert_eq!(d.total_length, 10);
        assert_eq!(d.filename, "photo.jpg");
        assert!(!d.is_terminal());
    }

    #[test]
    fn test_terminal_chunk() {
        let h = headers(
            Some("bytes 5-9/10"),
            Some("attachment; filename=\"photo.jpg\""),
        );
        let d = parse_chunk_headers(&h).unwrap().unwrap();
        assert!(d.is_terminal());
    }

    #[test]
    fn test_missing_headers_is_not_a_chunk() {
        // Neither header.
        assert!(parse_chunk_headers(&headers(None, None)).unwrap().is_none());
        // Only one of the two.
        assert!(parse_chunk_headers(&headers(Some("bytes 0-4/10"), None))
            .unwrap()
            .is_none());
        assert!(
            parse_chunk_headers(&headers(None, Some("attachment; filename=\"a\"")))
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_mime_type_hint_default() {
        let h = headers(Some("bytes 0-0/1"), Some("attachment; filename=\"a\""));
        let d = parse_chunk_headers(&h).unwrap().unwrap();
        assert_eq!(d.mime_type_hint, "application/octet-stream");
    }

    #[test]
    fn test_content_range_forms() {
        assert_eq!(parse_content_range("bytes 0-99/1000").unwrap(), (0, 100, 1000));
        assert_eq!(
            parse_content_range("bytes 900-999/1000").unwrap(),
            (900, 100, 1000)
        );
        // Single byte.
        assert_eq!(parse_content_range("bytes 5-5/10").unwrap(), (5, 1, 10));
    }

    #[test]
    fn test_content_range_rejects_malformed() {
        for bad in [
            "bits 0-4/10",
            "bytes 0-4",
            "bytes */10",
            "bytes 0-4/*",
            "bytes 4-0/10",
            "bytes a-4/10",
            "bytes 0-b/10",
            "bytes 0-4/c",
            "",
            // u64 edge values must not overflow the width computation.
            "bytes 0-18446744073709551615/18446744073709551615",
            "bytes 1-18446744073709551615/18446744073709551615",
        ] {
            let err = parse_content_range(bad).unwrap_err();
            assert_eq!(err.code(), "MalformedRange", "input: {bad}");
        }
    }

    #[test]
    fn test_content_range_rejects_overflowing_range() {
        // 0-10 is 11 bytes but total is 10.
        let err = parse_content_range("bytes 0-10/10").unwrap_err();
        assert_eq!(err.code(), "MalformedRange");
    }

    #[test]
    fn test_disposition_plain_filename() {
        assert_eq!(
            parse_disposition_filename("attachment; filename=\"report.pdf\"").unwrap(),
            "report.pdf"
        );
        assert_eq!(
            parse_disposition_filename("form-data; name=\"assets-upload\"; filename=\"a.png\"")
                .unwrap(),
            "a.png"
        );
    }

    #[test]
    fn test_disposition_rfc5987_filename() {
        let v = "attachment; filename*=UTF-8''na%C3%AFve%20file.txt";
        assert_eq!(parse_disposition_filename(v).unwrap(), "naïve file.txt");
    }

    #[test]
    fn test_disposition_extended_wins_over_plain() {
        let v = "attachment; filename=\"fallback.txt\"; filename*=UTF-8''real.txt";
        assert_eq!(parse_disposition_filename(v).unwrap(), "real.txt");
    }

    #[test]
    fn test_disposition_strips_path_components() {
        assert_eq!(
            parse_disposition_filename("attachment; filename=\"../../etc/passwd\"").unwrap(),
            "passwd"
        );
        assert_eq!(
            parse_disposition_filename("attachment; filename=\"C:\\temp\\evil.exe\"").unwrap(),
            "evil.exe"
        );
    }

    #[test]
    fn test_disposition_rejects_missing_or_empty_filename() {
        assert!(parse_disposition_filename("attachment").is_err());
        assert!(parse_disposition_filename("attachment; filename=\"\"").is_err());
        assert!(parse_disposition_filename("attachment; filename=\"..\"").is_err());
    }
}
