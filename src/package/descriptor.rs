//! `plugin.yml` manifest parsing.

use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;

use crate::{LuaCordError, Result};

/// Path of the manifest inside a package.
pub const DESCRIPTOR_PATH: &str = "plugin.yml";

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9 _.-]+$").expect("valid name pattern"))
}

/// Manifest as written by plugin authors.
#[derive(Debug, Deserialize)]
struct RawDescriptor {
    name: Option<String>,
    version: Option<serde_yml::Value>,
    main: Option<String>,
    description: Option<String>,
    author: Option<String>,
    #[serde(default)]
    authors: Vec<String>,
    website: Option<String>,
    #[serde(default)]
    depend: Vec<String>,
    #[serde(default)]
    softdepend: Vec<String>,
}

/// Parsed, validated package manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct PackageDescriptor {
    /// Unique name, compared case-insensitively.
    pub name: String,
    /// Version string.
    pub version: String,
    /// Relative path of the entry script.
    pub main: String,
    /// Free-text description.
    pub description: Option<String>,
    /// `author` followed by every entry of `authors`.
    pub authors: Vec<String>,
    /// Project website.
    pub website: Option<String>,
    /// Hard dependency names. Parsed, never resolved.
    pub depend: Vec<String>,
    /// Soft dependency names. Parsed, never resolved.
    pub softdepend: Vec<String>,
}

impl PackageDescriptor {
    /// Parse manifest bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| LuaCordError::Descriptor(format!("manifest is not UTF-8: {e}")))?;
        let raw: RawDescriptor = serde_yml::from_str(text)
            .map_err(|e| LuaCordError::Descriptor(format!("malformed manifest: {e}")))?;

        let name = required(raw.name, "name")?;
        if !name_pattern().is_match(&name) {
            return Err(LuaCordError::Descriptor(format!(
                "name '{name}' contains invalid characters"
            )));
        }

        let version = match raw.version {
            Some(serde_yml::Value::String(s)) => s,
            Some(serde_yml::Value::Number(n)) => n.to_string(),
            Some(_) => {
                return Err(LuaCordError::Descriptor(
                    "version must be a string".to_string(),
                ))
            }
            None => return Err(missing("version")),
        };
        let main = required(raw.main, "main")?;

        let mut authors = Vec::new();
        if let Some(author) = raw.author {
            authors.push(author);
        }
        authors.extend(raw.authors);

        Ok(Self {
            name,
            version,
            main,
            description: raw.description,
            authors,
            website: raw.website,
            depend: raw.depend,
            softdepend: raw.softdepend,
        })
    }

    /// `<name> v<version>`.
    pub fn full_name(&self) -> String {
        format!("{} v{}", self.name, self.version)
    }
}

fn missing(field: &str) -> LuaCordError {
    LuaCordError::Descriptor(format!("missing field `{field}`"))
}

fn required(value: Option<String>, field: &str) -> Result<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(missing(field)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_manifest() {
        let yaml = r#"
name: Greeter
version: "1.2.0"
main: main.lua
description: Says hello
author: alice
authors: [bob, carol]
depend: [Economy]
softdepend: [Chat]
"#;
        let desc = PackageDescriptor::parse(yaml.as_bytes()).unwrap();
        assert_eq!(desc.name, "Greeter");
        assert_eq!(desc.version, "1.2.0");
        assert_eq!(desc.main, "main.lua");
        assert_eq!(desc.description.as_deref(), Some("Says hello"));
        assert_eq!(desc.authors, vec!["alice", "bob", "carol"]);
        assert_eq!(desc.depend, vec!["Economy"]);
        assert_eq!(desc.softdepend, vec!["Chat"]);
        assert_eq!(desc.full_name(), "Greeter v1.2.0");
    }

    #[test]
    fn test_numeric_version() {
        let desc = PackageDescriptor::parse(b"name: A\nversion: 1.5\nmain: m.lua\n").unwrap();
        assert_eq!(desc.version, "1.5");
    }

    #[test]
    fn test_missing_main() {
        let err = PackageDescriptor::parse(b"name: A\nversion: '1'\n").unwrap_err();
        assert!(matches!(err, LuaCordError::Descriptor(msg) if msg.contains("main")));
    }

    #[test]
    fn test_missing_name() {
        let err = PackageDescriptor::parse(b"version: '1'\nmain: m.lua\n").unwrap_err();
        assert!(matches!(err, LuaCordError::Descriptor(msg) if msg.contains("name")));
    }

    #[test]
    fn test_invalid_name() {
        let err = PackageDescriptor::parse(b"name: 'a/b'\nversion: '1'\nmain: m.lua\n").unwrap_err();
        assert!(matches!(err, LuaCordError::Descriptor(_)));
    }

    #[test]
    fn test_malformed_yaml() {
        let err = PackageDescriptor::parse(b"name: [unclosed\n").unwrap_err();
        assert!(matches!(err, LuaCordError::Descriptor(_)));
    }
}
