use crate::telemetry::Telemetry;
use std::borrow::Cow;

const UNKNOWN: &str = "unknown";
const INVALID_U32: u32 = u32::MAX;

fn is_unsafe(c: char) -> bool {
    matches!(c, ',' | ' ' | '=' | '\n' | '\r' | '"' | '\'' | '\\')
}

/// Makes a value safe to use as a line-protocol symbol.
/// Blank values become `unknown`; an empty tag would reject the whole write.
pub fn sanitize_symbol(value: &str) -> Cow<'_, str> {
    if !value.contains(is_unsafe) {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Cow::Borrowed(UNKNOWN);
        }
        return Cow::Borrowed(trimmed);
    }
    let replaced: String = value
        .chars()
        .map(|c| if is_unsafe(c) { '_' } else { c })
        .collect();
    Cow::Owned(replaced.trim().to_string())
}

pub fn validate_double(value: f64) -> f64 {
    if !value.is_finite() || value == f64::MAX || value == f64::MIN {
        return 0.0;
    }
    value
}

pub fn validate_int(value: u32) -> i64 {
    if value == INVALID_U32 {
        return 0;
    }
    i64::from(value)
}

/// Rows without any identifying column are useless downstream.
pub fn is_valid_record(record: &Telemetry) -> bool {
    !record.session_id.is_empty() || !record.track_name.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbols_lose_protocol_characters() {
        assert_eq!(sanitize_symbol(""), "unknown");
        assert_eq!(sanitize_symbol("spa"), "spa");
        assert_eq!(sanitize_symbol("Spa Francorchamps"), "Spa_Francorchamps");
        assert_eq!(sanitize_symbol("a,b=c\"d'e\\f"), "a_b_c_d_e_f");
        assert_eq!(sanitize_symbol("line\r\n"), "line__");
        assert_eq!(sanitize_symbol("\ttabbed\t"), "tabbed");
    }

    #[test]
    fn whitespace_only_symbols_become_unknown() {
        assert_eq!(sanitize_symbol("\t"), "unknown");
        assert_eq!(sanitize_symbol("\u{a0}"), "unknown");
        assert_eq!(sanitize_symbol("\t\u{a0}\t"), "unknown");
        // spaces are replaced before trimming, so they never come back empty
        assert_eq!(sanitize_symbol("  "), "__");
    }

    #[test]
    fn doubles_are_normalised() {
        assert_eq!(validate_double(f64::NAN), 0.0);
        assert_eq!(validate_double(f64::INFINITY), 0.0);
        assert_eq!(validate_double(f64::NEG_INFINITY), 0.0);
        assert_eq!(validate_double(f64::MAX), 0.0);
        assert_eq!(validate_double(f64::MIN), 0.0);
        assert_eq!(validate_double(-12.5), -12.5);
    }

    #[test]
    fn u32_sentinel_becomes_zero() {
        assert_eq!(validate_int(u32::MAX), 0);
        assert_eq!(validate_int(7), 7);
    }

    #[test]
    fn record_needs_session_or_track() {
        let mut record = Telemetry::default();
        assert!(!is_valid_record(&record));
        record.track_name = "monza".to_string();
        assert!(is_valid_record(&record));
        record.track_name.clear();
        record.session_id = "42".to_string();
        assert!(is_valid_record(&record));
    }
}
