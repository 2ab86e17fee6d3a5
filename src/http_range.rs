//! `Range` and `Content-Range` header handling.
//!
//! Intervals are half-open `[start, end)` internally; the wire form is
//! inclusive (`bytes start-(end-1)/total`).

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeSpec {
    pub start: u64,
    pub end: u64,
}

impl RangeSpec {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum RangeError {
    Invalid,
    Unsatisfiable,
}

/// Parses a single-range `Range` header against a known resource size.
///
/// Accepted shapes: `bytes=A-B`, `bytes=A-`, `bytes=-N`. Multipart ranges,
/// malformed syntax, out-of-bounds indices, and `A > B` are rejected; the
/// caller answers all rejections with `416`.
pub fn parse_range(header: &str, size: u64) -> Result<RangeSpec, RangeError> {
    let header = header.trim();
    let Some(range) = header.strip_prefix("bytes=") else {
        return Err(RangeError::Invalid);
    };
    if range.is_empty() || range.contains(',') {
        return Err(RangeError::Invalid);
    }
    let Some((start_str, end_str)) = range.split_once('-') else {
        return Err(RangeError::Invalid);
    };
    let start_str = start_str.trim();
    let end_str = end_str.trim();

    if start_str.is_empty() {
        // suffix range: bytes=-N
        let suffix: u64 = end_str.parse().map_err(|_| RangeError::Invalid)?;
        if suffix == 0 || size == 0 {
            return Err(RangeError::Unsatisfiable);
        }
        return Ok(RangeSpec {
            start: size.saturating_sub(suffix),
            end: size,
        });
    }

    let start: u64 = start_str.parse().map_err(|_| RangeError::Invalid)?;
    if start >= size {
        return Err(RangeError::Unsatisfiable);
    }

    let end = if end_str.is_empty() {
        size
    } else {
        let last: u64 = end_str.parse().map_err(|_| RangeError::Invalid)?;
        if last < start || last >= size {
            return Err(RangeError::Unsatisfiable);
        }
        last + 1
    };

    Ok(RangeSpec { start, end })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    pub size: u64,
}

/// Parses `Content-Range: bytes start-end/size` (inclusive wire form).
pub fn parse_content_range(header: &str) -> Option<ContentRange> {
    let header = header.trim();
    let rest = header.strip_prefix("bytes")?.trim_start();
    let (range_part, size_part) = rest.split_once('/')?;
    let size: u64 = size_part.trim().parse().ok()?;
    let (start_str, end_str) = range_part.trim().split_once('-')?;
    let start: u64 = start_str.parse().ok()?;
    let end: u64 = end_str.parse().ok()?;
    Some(ContentRange { start, end, size })
}

pub fn build_content_range(start: u64, end: u64, size: u64) -> String {
    format!("bytes {}-{}/{}", start, end, size)
}

pub fn build_unsatisfied_range(size: u64) -> String {
    format!("bytes */{}", size)
}

pub fn build_range_header(spec: RangeSpec) -> String {
    format!("bytes={}-{}", spec.start, spec.end - 1)
}
