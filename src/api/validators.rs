use std::collections::HashMap;

/// Decoded query parameters. Later duplicates win, which matches what the
/// upstream frameworks we interoperate with do.
pub fn parse_query(raw_query: &str) -> HashMap<String, String> {
    url::form_urlencoded::parse(raw_query.as_bytes())
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect()
}

/// Country filter: exactly two letters, upper-cased; anything else empty.
pub fn sanitize_country(value: &str) -> String {
    let value = value.trim();
    if value.len() != 2 || !value.chars().all(|c| c.is_ascii_alphabetic()) {
        return String::new();
    }
    value.to_uppercase()
}

pub fn sanitize_protocol(value: &str) -> String {
    let value = value.trim().to_lowercase();
    match value.as_str() {
        "http" | "https" | "socks4" | "socks5" => value,
        _ => String::new(),
    }
}

pub fn sanitize_anonymity(value: &str) -> String {
    let value = value.trim().to_lowercase();
    match value.as_str() {
        "elite" | "anonymous" | "transparent" => value,
        _ => String::new(),
    }
}

/// Free-form label filter (city, region): trimmed, capped at 64 chars,
/// reduced to letters, digits, spaces, `-`, `'` and `.`.
pub fn sanitize_label(value: &str) -> String {
    let value = value.trim();
    if value.is_empty() {
        return String::new();
    }
    let capped: String = value.chars().take(64).collect();
    let cleaned: String = capped
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == ' ' || *c == '-' || *c == '\'' || *c == '.')
        .collect();
    cleaned.trim().to_string()
}

pub fn parse_port(value: &str) -> i64 {
    match value.trim().parse::<i64>() {
        Ok(port) if (1..=65535).contains(&port) => port,
        _ => 0,
    }
}

pub fn parse_asn(value: &str) -> i64 {
    match value.trim().parse::<i64>() {
        Ok(asn) if asn > 0 => asn,
        _ => 0,
    }
}

pub fn parse_offset(value: &str) -> i64 {
    match value.trim().parse::<i64>() {
        Ok(offset) if offset >= 0 => offset.min(100_000),
        _ => 0,
    }
}

pub fn parse_limit(value: &str, fallback: i64, max: i64) -> i64 {
    match value.trim().parse::<i64>() {
        Ok(limit) if limit > 0 => limit.min(max),
        _ => fallback,
    }
}

pub fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "y" | "on"
    )
}
