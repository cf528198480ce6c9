/// Return the current UTC timestamp in ISO 8601 format.
pub fn utc_now() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Format a tag timestamp component: `YYYYMMDDThhmmss`.
pub fn tag_timestamp(now: chrono::DateTime<chrono::Utc>) -> String {
    now.format("%Y%m%dT%H%M%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utc_now_format() {
        let ts = utc_now();
        assert!(ts.ends_with('Z'));
        assert_eq!(ts.len(), 20);
        assert_eq!(&ts[4..5], "-");
        assert_eq!(&ts[10..11], "T");
    }

    #[test]
    fn test_tag_timestamp_format() {
        let now = chrono::DateTime::parse_from_rfc3339("2024-03-05T12:30:45Z")
            .unwrap()
            .with_timezone(&chrono::Utc);
        assert_eq!(tag_timestamp(now), "20240305T123045");
    }
}
