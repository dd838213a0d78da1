//! Text encodings of KDBX XML values

use crate::database::KdbxVersion;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use uuid::Uuid;

/// Seconds between 0001-01-01T00:00:00Z and the Unix epoch
const DOTNET_EPOCH_OFFSET: i64 = 62_135_596_800;

const ISO_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

pub fn parse_time(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if text.contains('-') && text.contains(':') {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, ISO_FORMAT) {
            return Some(Utc.from_utc_datetime(&naive));
        }
        return DateTime::parse_from_rfc3339(text)
            .ok()
            .map(|dt| dt.with_timezone(&Utc));
    }
    let bytes: [u8; 8] = BASE64.decode(text).ok()?.try_into().ok()?;
    let seconds = i64::from_le_bytes(bytes).checked_sub(DOTNET_EPOCH_OFFSET)?;
    Utc.timestamp_opt(seconds, 0).single()
}

pub fn format_time(time: &DateTime<Utc>, version: KdbxVersion) -> String {
    match version {
        KdbxVersion::Kdbx31 => time.format(ISO_FORMAT).to_string(),
        KdbxVersion::Kdbx40 => {
            let seconds = time.timestamp().saturating_add(DOTNET_EPOCH_OFFSET);
            BASE64.encode(seconds.to_le_bytes())
        }
    }
}

pub fn parse_uuid(text: &str) -> Option<Uuid> {
    let bytes = BASE64.decode(text.trim()).ok()?;
    Uuid::from_slice(&bytes).ok()
}

pub fn format_uuid(uuid: &Uuid) -> String {
    BASE64.encode(uuid.as_bytes())
}

/// `True`/`False` in any case; `null` and empty mean unset
pub fn parse_bool(text: &str) -> Option<bool> {
    let text = text.trim();
    if text.eq_ignore_ascii_case("true") {
        Some(true)
    } else if text.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

pub fn format_bool(value: bool) -> &'static str {
    if value {
        "True"
    } else {
        "False"
    }
}

pub fn format_optional_bool(value: Option<bool>) -> &'static str {
    match value {
        Some(v) => format_bool(v),
        None => "null",
    }
}

pub fn parse_tags(text: &str) -> Vec<String> {
    text.split([';', ','])
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn decode_base64(text: &str) -> Option<Vec<u8>> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    BASE64.decode(compact).ok()
}

pub fn encode_base64(data: &[u8]) -> String {
    BASE64.encode(data)
}

/// Drop characters XML 1.0 cannot carry
pub fn xml_safe(text: &str) -> std::borrow::Cow<'_, str> {
    fn valid(c: char) -> bool {
        matches!(c,
            '\u{9}' | '\u{A}' | '\u{D}'
            | '\u{20}'..='\u{D7FF}'
            | '\u{E000}'..='\u{FFFD}'
            | '\u{10000}'..='\u{10FFFF}')
    }
    if text.chars().all(valid) {
        std::borrow::Cow::Borrowed(text)
    } else {
        std::borrow::Cow::Owned(text.chars().filter(|c| valid(*c)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_forms() {
        let time = Utc.with_ymd_and_hms(2021, 3, 4, 5, 6, 7).single().unwrap();
        let iso = format_time(&time, KdbxVersion::Kdbx31);
        assert_eq!(iso, "2021-03-04T05:06:07Z");
        assert_eq!(parse_time(&iso), Some(time));

        let binary = format_time(&time, KdbxVersion::Kdbx40);
        assert_eq!(parse_time(&binary), Some(time));
        assert_eq!(parse_time("garbage"), None);
    }

    #[test]
    fn test_dotnet_epoch() {
        // 0001-01-01T00:00:00Z is zero seconds
        assert_eq!(
            parse_time("AAAAAAAAAAA="),
            Utc.with_ymd_and_hms(1, 1, 1, 0, 0, 0).single()
        );
    }

    #[test]
    fn test_bool_forms() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool("false"), Some(false));
        assert_eq!(parse_bool("null"), None);
        assert_eq!(format_optional_bool(None), "null");
    }

    #[test]
    fn test_tags_split_on_both_separators() {
        assert_eq!(parse_tags("a; b,c;;"), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_xml_safe_strips_control_characters() {
        assert_eq!(xml_safe("a\u{1}b\u{FFFE}c\td"), "abc\td");
        assert!(matches!(xml_safe("plain"), std::borrow::Cow::Borrowed(_)));
    }
}
