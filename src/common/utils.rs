//! Utility functions for eip-manager

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};

/// Percent-encoding set for KV key paths (`/` is kept as the path separator)
const KEY_PATH_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b'%')
    .add(b' ')
    .add(b'?')
    .add(b'#')
    .add(b'&')
    .add(b'+');

/// Encode a KV key for use in a URL path
pub fn encode_key_path(key: &str) -> String {
    utf8_percent_encode(key, KEY_PATH_ENCODE_SET).to_string()
}

/// Parse duration string (e.g., "30s", "5m", "1h", "7d")
pub fn parse_duration(s: &str) -> crate::Result<std::time::Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(crate::Error::InvalidConfig("empty duration".into()));
    }

    let (num_str, unit) = if let Some(num) = s.strip_suffix("ms") {
        (num, "ms")
    } else {
        s.split_at(s.len() - s.chars().last().map_or(0, char::len_utf8))
    };

    let num: u64 = num_str
        .parse()
        .map_err(|_| crate::Error::InvalidConfig(format!("invalid duration: {}", s)))?;

    let secs_per_unit = match unit {
        "ms" => return Ok(std::time::Duration::from_millis(num)),
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86400,
        _ => {
            return Err(crate::Error::InvalidConfig(format!(
                "unknown duration unit: {}",
                unit
            )))
        }
    };

    num.checked_mul(secs_per_unit)
        .map(std::time::Duration::from_secs)
        .ok_or_else(|| crate::Error::InvalidConfig(format!("duration overflow: {}", s)))
}

/// Render a duration the way Consul expects it (`"15s"`)
pub fn consul_duration(d: std::time::Duration) -> String {
    if d.subsec_millis() == 0 {
        format!("{}s", d.as_secs())
    } else {
        format!("{}ms", d.as_millis())
    }
}

/// Validate a directory prefix (non-empty, no control characters)
pub fn validate_prefix(prefix: &str) -> crate::Result<()> {
    if prefix.is_empty() {
        return Err(crate::Error::InvalidConfig("prefix cannot be empty".into()));
    }

    if prefix.len() > 512 {
        return Err(crate::Error::InvalidConfig(
            "prefix too long (max 512 bytes)".into(),
        ));
    }

    if prefix.chars().any(|c| c.is_control()) {
        return Err(crate::Error::InvalidConfig(
            "prefix contains invalid characters".into(),
        ));
    }

    Ok(())
}
