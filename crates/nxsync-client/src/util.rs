/// Parse a boolean-like environment flag.
/// Accepts common values such as 1/0, true/false, yes/no, on/off (case-insensitive).
pub fn parse_bool_flag(raw: &str) -> Option<bool> {
    let normalized = raw.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Read an environment variable and parse it as a boolean flag using [`parse_bool_flag`].
pub fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .and_then(|raw| parse_bool_flag(&raw))
}

pub fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
}

pub fn env_i64(key: &str) -> Option<i64> {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse::<i64>().ok())
}

pub fn env_f64(key: &str) -> Option<f64> {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
}

/// Non-empty, trimmed value of `key`.
pub fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Ensures a trailing slash so relative joins stay under the base path.
pub fn with_trailing_slash(url: &str) -> String {
    if url.ends_with('/') {
        url.to_string()
    } else {
        format!("{url}/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn parse_bool_flag_recognizes_common_values() {
        assert_eq!(parse_bool_flag("true"), Some(true));
        assert_eq!(parse_bool_flag("YES"), Some(true));
        assert_eq!(parse_bool_flag("0"), Some(false));
        assert_eq!(parse_bool_flag("off"), Some(false));
        assert_eq!(parse_bool_flag("maybe"), None);
        assert_eq!(parse_bool_flag(""), None);
    }

    #[test]
    #[serial]
    fn env_helpers_read_env() {
        std::env::set_var("NXSYNC_TEST_BOOL", "on");
        assert_eq!(env_bool("NXSYNC_TEST_BOOL"), Some(true));
        std::env::set_var("NXSYNC_TEST_BOOL", "No");
        assert_eq!(env_bool("NXSYNC_TEST_BOOL"), Some(false));
        std::env::remove_var("NXSYNC_TEST_BOOL");
        assert_eq!(env_bool("NXSYNC_TEST_BOOL"), None);

        std::env::set_var("NXSYNC_TEST_NUM", " -1 ");
        assert_eq!(env_i64("NXSYNC_TEST_NUM"), Some(-1));
        assert_eq!(env_u64("NXSYNC_TEST_NUM"), None);
        assert_eq!(env_f64("NXSYNC_TEST_NUM"), Some(-1.0));
        std::env::set_var("NXSYNC_TEST_NUM", "   ");
        assert_eq!(env_string("NXSYNC_TEST_NUM"), None);
        std::env::remove_var("NXSYNC_TEST_NUM");
    }

    #[test]
    fn trailing_slash_is_added_once() {
        assert_eq!(with_trailing_slash("http://h/nuxeo"), "http://h/nuxeo/");
        assert_eq!(with_trailing_slash("http://h/nuxeo/"), "http://h/nuxeo/");
    }
}
