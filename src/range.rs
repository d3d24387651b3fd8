//! Range 请求头解析（单区间，宽松策略）。
//!
//! Only the first range of a multi-range header is honoured. An empty start
//! means offset 0 and an empty end means the last byte, so `bytes=-500`
//! selects `0-500` rather than a suffix. Syntax the parser cannot read is
//! reported as [`RangeRequest::Malformed`] and callers serve the request as
//! if no Range header had been sent.

/// Inclusive byte offsets, always within `0..total_size`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn content_range(&self, total_size: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, total_size)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RangeRequest {
    Absent,
    Malformed,
    Satisfiable(ByteRange),
    Unsatisfiable,
}

pub fn parse_range(value: Option<&str>, file_size: u64) -> RangeRequest {
    let Some(value) = value else {
        return RangeRequest::Absent;
    };
    let Some((unit, specs)) = value.trim().split_once('=') else {
        return RangeRequest::Malformed;
    };
    if !unit.trim().eq_ignore_ascii_case("bytes") {
        return RangeRequest::Malformed;
    }
    let first = specs.split(',').next().unwrap_or_default().trim();
    let Some((start_part, end_part)) = first.split_once('-') else {
        return RangeRequest::Malformed;
    };
    let (start_part, end_part) = (start_part.trim(), end_part.trim());

    let start = if start_part.is_empty() {
        0
    } else {
        match start_part.parse::<u64>() {
            Ok(value) => value,
            Err(_) => return RangeRequest::Malformed,
        }
    };
    let requested_end = if end_part.is_empty() {
        None
    } else {
        match end_part.parse::<u64>() {
            Ok(value) => Some(value),
            Err(_) => return RangeRequest::Malformed,
        }
    };
    if let Some(end) = requested_end
        && end < start
    {
        return RangeRequest::Malformed;
    }

    if file_size == 0 || start >= file_size {
        return RangeRequest::Unsatisfiable;
    }
    let last = file_size - 1;
    let end = requested_end.map_or(last, |end| end.min(last));
    RangeRequest::Satisfiable(ByteRange { start, end })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn satisfiable(start: u64, end: u64) -> RangeRequest {
        RangeRequest::Satisfiable(ByteRange { start, end })
    }

    #[test]
    fn parses_closed_and_open_ranges() {
        assert_eq!(parse_range(Some("bytes=1000-1999"), 5000), satisfiable(1000, 1999));
        assert_eq!(parse_range(Some("bytes=1000-"), 5000), satisfiable(1000, 4999));
        assert_eq!(parse_range(Some("bytes=-1999"), 5000), satisfiable(0, 1999));
        assert_eq!(parse_range(Some("bytes=-"), 5000), satisfiable(0, 4999));
        assert_eq!(parse_range(Some("Bytes = 5 - 9"), 5000), satisfiable(5, 9));
    }

    #[test]
    fn clamps_end_to_last_byte() {
        assert_eq!(parse_range(Some("bytes=10-999999"), 100), satisfiable(10, 99));
    }

    #[test]
    fn uses_first_range_of_multi_range_header() {
        assert_eq!(parse_range(Some("bytes=0-9, 20-29"), 100), satisfiable(0, 9));
    }

    #[test]
    fn malformed_syntax_is_reported_not_rejected() {
        for value in ["bytes=abc-def", "items=0-10", "bytes 0-10", "bytes=10", "bytes=20-10"] {
            assert_eq!(parse_range(Some(value), 100), RangeRequest::Malformed, "{value}");
        }
        assert_eq!(parse_range(None, 100), RangeRequest::Absent);
    }

    #[test]
    fn start_past_end_of_file_is_unsatisfiable() {
        assert_eq!(parse_range(Some("bytes=100-"), 100), RangeRequest::Unsatisfiable);
        assert_eq!(parse_range(Some("bytes=0-"), 0), RangeRequest::Unsatisfiable);
    }

    #[test]
    fn byte_range_reports_length_and_header() {
        let range = ByteRange { start: 1000, end: 1999 };
        assert_eq!(range.len(), 1000);
        assert_eq!(range.content_range(5000), "bytes 1000-1999/5000");
    }
}
