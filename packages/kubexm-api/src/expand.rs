use crate::error::{ConfigError, Result};
use once_cell::sync::Lazy;
use regex::Regex;

static RANGE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<prefix>[^\[\]]*)\[(?P<lo>\d+):(?P<hi>\d+)\](?P<suffix>[^\[\]]*)$")
        .expect("range pattern regex")
});

/// Expand a `prefix[N:M]suffix` host range pattern.
///
/// Zero padding is preserved from the left bound when it has a leading
/// zero: `host[01:03]` -> `host01 host02 host03`, `host[1:3]` ->
/// `host1 host2 host3`. A pattern without brackets expands to itself.
/// Reversed bounds and malformed brackets fail.
pub fn expand(pattern: &str) -> Result<Vec<String>> {
    if !pattern.contains('[') && !pattern.contains(']') {
        return Ok(vec![pattern.to_string()]);
    }

    let caps = RANGE_RE
        .captures(pattern)
        .ok_or_else(|| ConfigError::InvalidRange(pattern.to_string()))?;

    let lo_raw = &caps["lo"];
    let hi_raw = &caps["hi"];
    let lo: u64 = lo_raw
        .parse()
        .map_err(|_| ConfigError::InvalidRange(pattern.to_string()))?;
    let hi: u64 = hi_raw
        .parse()
        .map_err(|_| ConfigError::InvalidRange(pattern.to_string()))?;

    if lo > hi {
        return Err(ConfigError::ReversedRange(pattern.to_string()));
    }

    let width = if lo_raw.starts_with('0') { lo_raw.len() } else { 0 };
    let prefix = &caps["prefix"];
    let suffix = &caps["suffix"];

    Ok((lo..=hi)
        .map(|n| {
            if width > 0 {
                format!("{}{:0width$}{}", prefix, n, suffix, width = width)
            } else {
                format!("{}{}{}", prefix, n, suffix)
            }
        })
        .collect())
}
