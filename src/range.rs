#![forbid(unsafe_code)]

use axum::http::HeaderValue;

/// Byte span a client asked for with `Range: bytes=<start>-[<end>]`.
///
/// The total length of the resource is unknown here (it lives upstream), so
/// only the forms that do not need it are accepted. Suffix and multi-range
/// requests are treated as if no header had been sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeWindow {
    pub start: u64,
    /// Inclusive; `None` means open-ended.
    pub end: Option<u64>,
}

impl RangeWindow {
    pub fn parse(value: &HeaderValue) -> Option<Self> {
        let value = value.to_str().ok()?.trim();
        let (unit, spec) = value.split_once('=')?;
        if !unit.trim().eq_ignore_ascii_case("bytes") {
            return None;
        }
        let spec = spec.trim();
        if spec.is_empty() || spec.contains(',') {
            return None;
        }
        let (start_str, end_str) = spec.split_once('-')?;
        let (start_str, end_str) = (start_str.trim(), end_str.trim());
        if start_str.is_empty() {
            return None;
        }

        let start: u64 = start_str.parse().ok()?;
        let end = if end_str.is_empty() {
            None
        } else {
            Some(end_str.parse::<u64>().ok()?)
        };
        if end.is_some_and(|end| end < start) {
            return None;
        }
        Some(Self { start, end })
    }

    /// Inclusive window to request upstream. Open-ended requests are capped
    /// to `chunk_size` bytes so each upstream fetch stays short.
    pub fn bounded(self, chunk_size: u64) -> (u64, u64) {
        let end = self
            .end
            .unwrap_or_else(|| self.start.saturating_add(chunk_size.max(1) - 1));
        (self.start, end)
    }
}

pub fn range_header(start: u64, end: u64) -> String {
    format!("bytes={start}-{end}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(value: &str) -> Option<RangeWindow> {
        RangeWindow::parse(&HeaderValue::from_str(value).unwrap())
    }

    #[test]
    fn parses_closed_range() {
        assert_eq!(
            parse("bytes=0-999999"),
            Some(RangeWindow {
                start: 0,
                end: Some(999_999)
            })
        );
        assert_eq!(
            parse(" bytes = 10 - 20 "),
            Some(RangeWindow {
                start: 10,
                end: Some(20)
            })
        );
    }

    #[test]
    fn parses_open_range() {
        assert_eq!(
            parse("bytes=4096-"),
            Some(RangeWindow {
                start: 4096,
                end: None
            })
        );
    }

    #[test]
    fn single_byte_range_is_valid() {
        assert_eq!(
            parse("bytes=7-7"),
            Some(RangeWindow {
                start: 7,
                end: Some(7)
            })
        );
    }

    #[test]
    fn rejects_unsupported_forms() {
        assert_eq!(parse("bytes=-500"), None);
        assert_eq!(parse("bytes=0-1,5-6"), None);
        assert_eq!(parse("items=0-10"), None);
        assert_eq!(parse("bytes=20-10"), None);
        assert_eq!(parse("bytes=abc-"), None);
        assert_eq!(parse("bytes="), None);
        assert_eq!(parse("bytes"), None);
    }

    #[test]
    fn open_range_is_bounded_to_chunk() {
        let window = parse("bytes=500-").unwrap();
        let (start, end) = window.bounded(1_000);
        assert_eq!((start, end), (500, 1_499));
        assert_eq!(end - start + 1, 1_000);
    }

    #[test]
    fn closed_range_is_kept() {
        let window = parse("bytes=0-999999").unwrap();
        assert_eq!(window.bounded(10), (0, 999_999));
    }

    #[test]
    fn bounding_saturates_near_u64_max() {
        let window = RangeWindow {
            start: u64::MAX - 1,
            end: None,
        };
        assert_eq!(window.bounded(1_000).1, u64::MAX);
    }

    #[test]
    fn zero_chunk_still_requests_one_byte() {
        let window = RangeWindow {
            start: 9,
            end: None,
        };
        assert_eq!(window.bounded(0), (9, 9));
    }

    #[test]
    fn formats_header() {
        assert_eq!(range_header(0, 99), "bytes=0-99");
    }
}
