//! CRUSH location strings

use castle_common::{Error, Result};
use regex::Regex;

/// Key of the host bucket in a location
pub const HOST_KEY: &str = "hostName";
const ROOT_KEY: &str = "root";
const DEFAULT_ROOT: &str = "default";

/// Parse a comma separated `key=value` location and add the host and root
/// defaults when they are not set
pub fn format_location(location: &str, hostname: &str) -> Result<Vec<String>> {
    let pair_re = Regex::new("^.+=.+$").map_err(|e| Error::external(e.to_string()))?;
    let mut pairs: Vec<String> = Vec::new();
    if !location.is_empty() {
        for pair in location.split(',') {
            if !pair_re.is_match(pair) {
                return Err(Error::invalid_input(format!(
                    "invalid CRUSH location pair '{pair}' in '{location}'"
                )));
            }
            pairs.push(pair.to_string());
        }
    }

    let has = |pairs: &[String], key: &str| {
        pairs
            .iter()
            .any(|p| p.split_once('=').is_some_and(|(k, _)| k == key))
    };
    if !has(&pairs, HOST_KEY) {
        pairs.push(format!("{HOST_KEY}={hostname}"));
    }
    if !has(&pairs, ROOT_KEY) {
        pairs.push(format!("{ROOT_KEY}={DEFAULT_ROOT}"));
    }
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_added() {
        assert_eq!(
            format_location("", "node1").unwrap(),
            vec!["hostName=node1", "root=default"]
        );
        assert_eq!(
            format_location("rack=r1,root=fast", "node1").unwrap(),
            vec!["rack=r1", "root=fast", "hostName=node1"]
        );
        assert_eq!(
            format_location("hostName=h", "node1").unwrap(),
            vec!["hostName=h", "root=default"]
        );
    }

    #[test]
    fn test_malformed_pairs() {
        for bad in ["rack", "rack=", "=r1", "rack=r1,,root=x"] {
            let err = format_location(bad, "n").unwrap_err();
            assert!(matches!(err, Error::InvalidInput(_)), "{bad}");
        }
    }
}
