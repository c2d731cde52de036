//! Byte quantities and durations as written in configuration and recipe files.
//!
//! Sizes accept Kubernetes-style suffixes: binary (`Ki`, `Mi`, `Gi`, `Ti`) and
//! decimal (`K`, `M`, `G`, `T`, also lowercase `k`). A bare number is bytes.
//! Durations accept `s`, `m`, `h`, `d`, `w`; a bare number is seconds.

use std::time::Duration;

use serde::{Deserialize, Deserializer};

const KIB: u64 = 1024;

/// Parse a quantity such as `"500Gi"`, `"80G"`, or `"1048576"` into bytes.
pub fn parse_bytes(input: &str) -> Result<u64, String> {
    let input = input.trim();
    if input.is_empty() {
        return Err("empty quantity".to_string());
    }

    let split = input
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(input.len());
    let (number, suffix) = input.split_at(split);

    let multiplier: u64 = match suffix {
        "" => 1,
        "Ki" => KIB,
        "Mi" => KIB.pow(2),
        "Gi" => KIB.pow(3),
        "Ti" => KIB.pow(4),
        "k" | "K" => 1_000,
        "M" => 1_000_000,
        "G" => 1_000_000_000,
        "T" => 1_000_000_000_000,
        other => return Err(format!("unknown quantity suffix {other:?} in {input:?}")),
    };

    if number.contains('.') {
        let value: f64 = number
            .parse()
            .map_err(|_| format!("invalid quantity: {input}"))?;
        if value < 0.0 {
            return Err(format!("negative quantity: {input}"));
        }
        Ok((value * multiplier as f64).round() as u64)
    } else {
        let value: u64 = number
            .parse()
            .map_err(|_| format!("invalid quantity: {input}"))?;
        value
            .checked_mul(multiplier)
            .ok_or_else(|| format!("quantity overflows u64: {input}"))
    }
}

/// Bytes in `gib` gibibytes
pub const fn gib(gib: u64) -> u64 {
    gib * KIB * KIB * KIB
}

/// Render bytes as GiB with two decimals, for logs and CLI output
pub fn format_gib(bytes: u64) -> String {
    format!("{:.2} GiB", bytes as f64 / gib(1) as f64)
}

/// Serde helper: accept either an integer byte count or a quantity string
pub fn deserialize_bytes<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => parse_bytes(&s).map_err(serde::de::Error::custom),
    }
}

/// Serde helper for optional quantities
pub fn deserialize_opt_bytes<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct Wrapper(#[serde(deserialize_with = "deserialize_bytes")] u64);

    Ok(Option::<Wrapper>::deserialize(deserializer)?.map(|Wrapper(n)| n))
}

/// Parse a human-friendly duration such as `"500ms"`, `"30m"`, or `"7d"`.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    let (number, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => s.split_at(idx),
        None => (s, "s"),
    };
    let n: u64 = number
        .parse()
        .map_err(|_| format!("invalid duration '{input}', expected e.g. 30m, 24h, 7d"))?;
    if unit == "ms" {
        return Ok(Duration::from_millis(n));
    }
    let secs_per_unit = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3_600,
        "d" => 86_400,
        "w" => 604_800,
        _ => return Err(format!("invalid duration '{input}', expected e.g. 30m, 24h, 7d")),
    };
    n.checked_mul(secs_per_unit)
        .map(Duration::from_secs)
        .ok_or_else(|| format!("duration overflows: {input}"))
}

/// Serde helper for optional durations given as strings or bare seconds
pub fn deserialize_opt_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Seconds(n)) => Ok(Some(Duration::from_secs(n))),
        Some(Raw::Text(s)) => parse_duration(&s).map(Some).map_err(serde::de::Error::custom),
    }
}

/// Serde helper for required durations
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    deserialize_opt_duration(deserializer)?
        .ok_or_else(|| serde::de::Error::custom("duration must not be null"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_and_decimal_suffixes() {
        assert_eq!(parse_bytes("500Gi").unwrap(), gib(500));
        assert_eq!(parse_bytes("512Mi").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_bytes("80G").unwrap(), 80_000_000_000);
        assert_eq!(parse_bytes("2k").unwrap(), 2_000);
        assert_eq!(parse_bytes("1Ti").unwrap(), gib(1024));
    }

    #[test]
    fn bare_numbers_are_bytes() {
        assert_eq!(parse_bytes("1048576").unwrap(), 1_048_576);
        assert_eq!(parse_bytes(" 42 ").unwrap(), 42);
    }

    #[test]
    fn fractional_quantities() {
        assert_eq!(parse_bytes("1.5Gi").unwrap(), gib(3) / 2);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_bytes("").is_err());
        assert!(parse_bytes("lots").is_err());
        assert!(parse_bytes("10Xi").is_err());
        assert!(parse_bytes("99999999999999999999Ti").is_err());
    }

    #[test]
    fn serde_accepts_both_forms() {
        #[derive(Deserialize)]
        struct Doc {
            #[serde(deserialize_with = "deserialize_bytes")]
            capacity: u64,
            #[serde(default, deserialize_with = "deserialize_opt_bytes")]
            limit: Option<u64>,
        }
        let doc: Doc = serde_json::from_str(r#"{"capacity": "100Gi"}"#).unwrap();
        assert_eq!(doc.capacity, gib(100));
        assert_eq!(doc.limit, None);

        let doc: Doc = serde_json::from_str(r#"{"capacity": 7, "limit": "1Ki"}"#).unwrap();
        assert_eq!(doc.capacity, 7);
        assert_eq!(doc.limit, Some(1024));
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("30m").unwrap(), Duration::from_secs(1800));
        assert_eq!(parse_duration("24h").unwrap(), Duration::from_secs(86_400));
        assert_eq!(parse_duration("7d").unwrap(), Duration::from_secs(604_800));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert!(parse_duration("7y").is_err());
        assert!(parse_duration("").is_err());
        assert!(parse_duration("h").is_err());
    }

    #[test]
    fn serde_durations() {
        #[derive(Deserialize)]
        struct Doc {
            #[serde(default, deserialize_with = "deserialize_opt_duration")]
            retention: Option<Duration>,
            #[serde(deserialize_with = "deserialize_duration")]
            grace: Duration,
        }
        let doc: Doc = serde_json::from_str(r#"{"retention": "2d", "grace": 30}"#).unwrap();
        assert_eq!(doc.retention, Some(Duration::from_secs(172_800)));
        assert_eq!(doc.grace, Duration::from_secs(30));

        let doc: Doc = serde_json::from_str(r#"{"grace": "10s"}"#).unwrap();
        assert_eq!(doc.retention, None);
    }

    #[test]
    fn formats_gib() {
        assert_eq!(format_gib(gib(60)), "60.00 GiB");
    }
}
