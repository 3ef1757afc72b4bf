//! Log level to OTLP severity mapping.

/// Maps a logging library's level name to an OTLP severity number.
///
/// Matching ignores case. `WARNING`, `CRITICAL` and `ALL` are accepted as
/// aliases of `WARN`, `FATAL` and `TRACE`. The numbered forms (`INFO2` …
/// `INFO4`) step within a level's range. Unknown names map to 0
/// (unspecified).
pub fn severity_number(level: &str) -> i32 {
    let upper = level.trim().to_ascii_uppercase();
    let (name, step) = match upper.as_bytes().last() {
        Some(digit @ b'2'..=b'4') => (&upper[..upper.len() - 1], i32::from(digit - b'1')),
        _ => (upper.as_str(), 0),
    };

    let base = match name {
        "TRACE" | "ALL" => 1,
        "DEBUG" => 5,
        "INFO" => 9,
        "WARN" | "WARNING" => 13,
        "ERROR" => 17,
        "FATAL" | "CRITICAL" => 21,
        _ => return 0,
    };
    base + step
}

/// Returns the severity text recorded alongside the number.
pub fn severity_text(level: &str) -> String {
    level.trim().to_ascii_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_levels() {
        assert_eq!(severity_number("TRACE"), 1);
        assert_eq!(severity_number("DEBUG"), 5);
        assert_eq!(severity_number("INFO"), 9);
        assert_eq!(severity_number("WARN"), 13);
        assert_eq!(severity_number("ERROR"), 17);
        assert_eq!(severity_number("FATAL"), 21);
    }

    #[test]
    fn test_numbered_levels() {
        assert_eq!(severity_number("TRACE2"), 2);
        assert_eq!(severity_number("debug3"), 7);
        assert_eq!(severity_number("Info4"), 12);
        assert_eq!(severity_number("FATAL4"), 24);
        assert_eq!(severity_number("INFO5"), 0);
        assert_eq!(severity_number("INFO1"), 0);
    }

    #[test]
    fn test_aliases_ignore_case() {
        assert_eq!(severity_number("warning"), 13);
        assert_eq!(severity_number("Critical"), 21);
        assert_eq!(severity_number("all"), 1);
        assert_eq!(severity_number("warning2"), 14);
    }

    #[test]
    fn test_unknown_level() {
        assert_eq!(severity_number("NOTICE"), 0);
        assert_eq!(severity_number(""), 0);
        assert_eq!(severity_text(" info "), "INFO");
    }
}
