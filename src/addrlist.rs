use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// Parse an address list into a deduplicated list of addresses, in order of
/// first appearance.
///
/// Supported formats per line:
/// - one address: `udp://239.1.1.1:5000`
/// - comments: lines starting with `#` are ignored (so `#EXTINF` playlist lines drop out)
/// - whitespace and blank lines are ignored
pub fn parse_address_list(s: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    for raw_line in s.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if seen.insert(line) {
            out.push(line.to_string());
        }
    }
    out
}

/// Load an address list from a file path.
pub fn load_address_list(path: impl AsRef<Path>) -> Result<Vec<String>> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("failed to read address list: {}", path.as_ref().display()))?;
    Ok(parse_address_list(&content))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skips_comments_and_dedups() {
        let input = r#"
            #EXTM3U
            #EXTINF:-1,News
            http://h/1.ts
            udp://239.1.1.1:5000

            http://h/1.ts
        "#;
        assert_eq!(
            parse_address_list(input),
            vec!["http://h/1.ts", "udp://239.1.1.1:5000"]
        );
    }

    #[test]
    fn missing_file_errors() {
        assert!(load_address_list("/definitely/not/here.txt").is_err());
    }
}
