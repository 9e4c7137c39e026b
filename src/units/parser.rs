//! INI-style parser for supervisor configuration
//!
//! Same dialect as systemd unit files: `[Section]` headers, `Key=Value`
//! lines, `#`/`;` comments, case-insensitive keys, repeated keys accumulate.

use std::collections::HashMap;
use std::path::Path;

/// A section contains key-value pairs, where each key can have multiple values
/// The u32 is the order the value appeared (for stable ordering)
pub type ParsedSection = HashMap<String, Vec<(u32, String)>>;

/// A parsed file is a map of section headers (brackets included) to their contents
pub type ParsedFile = HashMap<String, ParsedSection>;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("Section '{0}' appears more than once")]
    DuplicateSection(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Generic(String),
}

/// Parse a configuration file from a string
pub fn parse_file(content: &str) -> Result<ParsedFile, ParseError> {
    let mut sections = HashMap::new();
    let lines: Vec<&str> = content.lines().map(|s| s.trim()).collect();

    let mut lines_iter = lines.iter().peekable();

    // Skip lines before the first section
    while lines_iter.peek().is_some_and(|l| !l.starts_with('[')) {
        lines_iter.next();
    }

    let Some(first_section) = lines_iter.next() else {
        return Ok(sections);
    };
    check_header(first_section)?;

    let mut current_section_name = first_section.to_string();
    let mut current_section_lines = Vec::new();

    for line in lines_iter {
        if line.starts_with('[') {
            check_header(line)?;
            if sections.contains_key(&current_section_name) {
                return Err(ParseError::DuplicateSection(current_section_name));
            }
            sections.insert(
                current_section_name.clone(),
                parse_section(&current_section_lines),
            );
            current_section_name = line.to_string();
            current_section_lines.clear();
        } else {
            current_section_lines.push(*line);
        }
    }

    if sections.contains_key(&current_section_name) {
        return Err(ParseError::DuplicateSection(current_section_name));
    }
    sections.insert(current_section_name, parse_section(&current_section_lines));

    Ok(sections)
}

fn check_header(line: &str) -> Result<(), ParseError> {
    if line.ends_with(']') && line.len() > 2 {
        Ok(())
    } else {
        Err(ParseError::Generic(format!("Malformed section header: {}", line)))
    }
}

/// Keys that accept space-separated multiple values
const SPACE_SEPARATED_KEYS: &[&str] = &["UNITS"];

/// Parse a single section's lines into key-value pairs
fn parse_section(lines: &[&str]) -> ParsedSection {
    let mut entries: ParsedSection = HashMap::new();
    let mut entry_number = 0u32;

    for line in lines {
        if line.starts_with('#') || line.starts_with(';') || line.is_empty() {
            continue;
        }

        let Some(pos) = line.find('=') else {
            log::debug!("Ignoring config line without '=': {}", line);
            continue;
        };

        let (name, value) = line.split_at(pos);
        let value = value.trim_start_matches('=').trim();
        let name = name.trim().to_uppercase();

        let values: Vec<String> = if SPACE_SEPARATED_KEYS.contains(&name.as_str()) {
            value.split_whitespace().map(|s| s.to_string()).collect()
        } else {
            value.split(',').map(|x| x.trim().to_string()).collect()
        };

        // An empty assignment resets the list, as in unit files
        if values.iter().all(|v| v.is_empty()) {
            entries.insert(name, Vec::new());
            continue;
        }

        let vec = entries.entry(name).or_default();
        for v in values {
            if !v.is_empty() {
                vec.push((entry_number, v));
                entry_number += 1;
            }
        }
    }

    entries
}

/// Values of a key in appearance order
pub fn section_values(section: &ParsedSection, key: &str) -> Vec<String> {
    let mut entries = section.get(key).cloned().unwrap_or_default();
    entries.sort_by_key(|(order, _)| *order);
    entries.into_iter().map(|(_, v)| v).collect()
}

/// Parse a configuration file from disk
pub async fn parse_config_file(path: &Path) -> Result<ParsedFile, ParseError> {
    let content = tokio::fs::read_to_string(path).await?;
    parse_file(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_config() {
        let content = r#"
[Supervisor]
MaxRetries=3

[Target web]
Units=nginx.service php-fpm.service
Expect=active
"#;
        let parsed = parse_file(content).unwrap();

        assert!(parsed.contains_key("[Supervisor]"));
        assert!(parsed.contains_key("[Target web]"));

        let web = &parsed["[Target web]"];
        assert_eq!(
            section_values(web, "UNITS"),
            vec!["nginx.service", "php-fpm.service"]
        );
        assert_eq!(section_values(web, "EXPECT"), vec!["active"]);
    }

    #[test]
    fn test_empty_file() {
        let parsed = parse_file("").unwrap();
        assert!(parsed.is_empty());
    }

    #[test]
    fn test_comments_only() {
        let content = "# This is a comment\n; Another comment\n";
        let parsed = parse_file(content).unwrap();
        assert!(parsed.is_empty());
    }

    #[test]
    fn test_comments_inside_section() {
        let content = r#"
[Target db]
# primary
Units=postgresql
; replica later
Expect=active
"#;
        let parsed = parse_file(content).unwrap();
        assert_eq!(parsed["[Target db]"].len(), 2);
    }

    #[test]
    fn test_repeated_units_accumulate() {
        let content = r#"
[Target web]
Units=nginx
Units=php-fpm haproxy
"#;
        let parsed = parse_file(content).unwrap();
        assert_eq!(
            section_values(&parsed["[Target web]"], "UNITS"),
            vec!["nginx", "php-fpm", "haproxy"]
        );
    }

    #[test]
    fn test_empty_assignment_resets() {
        let content = r#"
[Target web]
Units=nginx
Units=
Units=caddy
"#;
        let parsed = parse_file(content).unwrap();
        assert_eq!(section_values(&parsed["[Target web]"], "UNITS"), vec!["caddy"]);
    }

    #[test]
    fn test_key_case_insensitive() {
        let content = r#"
[Target web]
units=a
UNITS=b
Units=c
"#;
        let parsed = parse_file(content).unwrap();
        assert_eq!(section_values(&parsed["[Target web]"], "UNITS").len(), 3);
    }

    #[test]
    fn test_whitespace_handling() {
        let content = "[Supervisor]\n   MaxRetries   =   7\n";
        let parsed = parse_file(content).unwrap();
        assert_eq!(section_values(&parsed["[Supervisor]"], "MAXRETRIES"), vec!["7"]);
    }

    #[test]
    fn test_duplicate_section_error() {
        let content = r#"
[Target web]
Units=nginx

[Target web]
Units=caddy
"#;
        let result = parse_file(content);
        assert!(matches!(result.unwrap_err(), ParseError::DuplicateSection(_)));
    }

    #[test]
    fn test_malformed_header() {
        let result = parse_file("[Target web\nUnits=nginx\n");
        assert!(matches!(result.unwrap_err(), ParseError::Generic(_)));
    }

    #[test]
    fn test_lines_before_first_section() {
        let content = r#"
# Header comment
stray=value

[Supervisor]
MaxRetries=2
"#;
        let parsed = parse_file(content).unwrap();
        assert_eq!(parsed.len(), 1);
        assert!(parsed.contains_key("[Supervisor]"));
    }
}
