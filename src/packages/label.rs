//! Target labels (`//package/path:name`)

use std::fmt;
use std::sync::OnceLock;

use regex_lite::Regex;
use serde::{Deserialize, Serialize};

/// Errors parsing or deriving a label
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LabelError {
    #[error("invalid label '{input}': labels must start with '//'")]
    NotAbsolute { input: String },

    #[error("invalid package name '{package}': {reason}")]
    InvalidPackage { package: String, reason: &'static str },

    #[error("invalid target name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },
}

fn name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_.+=,@~\-]+$").expect("static regex"))
}

fn package_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_.\-]+(/[A-Za-z0-9_.\-]+)*$").expect("static regex"))
}

/// An absolute reference to a target in a package
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Label {
    package: String,
    name: String,
}

impl Label {
    /// Parse `//pkg:name`, `//pkg` (name = last package component) or `//:name`
    pub fn parse_absolute(input: &str) -> Result<Self, LabelError> {
        let rest = input.strip_prefix("//").ok_or_else(|| LabelError::NotAbsolute {
            input: input.to_string(),
        })?;

        let (package, name) = match rest.split_once(':') {
            Some((package, name)) => (package, name),
            None => {
                let name = rest.rsplit('/').next().unwrap_or(rest);
                (rest, name)
            }
        };

        validate_package(package)?;
        validate_name(name)?;
        Ok(Self {
            package: package.to_string(),
            name: name.to_string(),
        })
    }

    /// A label for `name` in the same package
    pub fn get_relative(&self, name: &str) -> Result<Self, LabelError> {
        validate_name(name)?;
        Ok(Self {
            package: self.package.clone(),
            name: name.to_string(),
        })
    }

    pub fn package(&self) -> &str {
        &self.package
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Workspace-relative path of the file this label names
    pub fn package_relative_path(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.package).join(&self.name)
    }
}

fn validate_package(package: &str) -> Result<(), LabelError> {
    if package.is_empty() || package_re().is_match(package) {
        return Ok(());
    }
    Err(LabelError::InvalidPackage {
        package: package.to_string(),
        reason: "package names may contain letters, digits, '_', '-', '.' and '/' separators",
    })
}

fn validate_name(name: &str) -> Result<(), LabelError> {
    let reason = if name.is_empty() {
        "empty target name"
    } else if name == "." || name == ".." {
        "target names may not be '.' or '..'"
    } else if !name_re().is_match(name) {
        "target names may not contain whitespace, '/' or ':'"
    } else {
        return Ok(());
    };
    Err(LabelError::InvalidName {
        name: name.to_string(),
        reason,
    })
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "//{}:{}", self.package, self.name)
    }
}

impl TryFrom<String> for Label {
    type Error = LabelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Label::parse_absolute(&value)
    }
}

impl From<Label> for String {
    fn from(label: Label) -> Self {
        label.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_forms() {
        let label = Label::parse_absolute("//tools/cpp:toolchain").unwrap();
        assert_eq!(label.package(), "tools/cpp");
        assert_eq!(label.name(), "toolchain");

        let short = Label::parse_absolute("//tools/cpp").unwrap();
        assert_eq!(short.name(), "cpp");

        let root = Label::parse_absolute("//:profile.zip").unwrap();
        assert_eq!(root.package(), "");
        assert_eq!(root.to_string(), "//:profile.zip");
    }

    #[test]
    fn test_not_absolute() {
        assert!(matches!(
            Label::parse_absolute("pkg:name"),
            Err(LabelError::NotAbsolute { .. })
        ));
    }

    #[test]
    fn test_get_relative_validates_name() {
        let top = Label::parse_absolute("//tools/cpp:toolchain").unwrap();

        let ok = top.get_relative("cc-compiler-k8").unwrap();
        assert_eq!(ok.to_string(), "//tools/cpp:cc-compiler-k8");

        for bad in ["cc-compiler-k 8", "cc-compiler-a/b", "cc:x", "..", ""] {
            assert!(
                matches!(top.get_relative(bad), Err(LabelError::InvalidName { .. })),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_bad_package() {
        assert!(matches!(
            Label::parse_absolute("//a//b:c"),
            Err(LabelError::InvalidPackage { .. })
        ));
    }

    #[test]
    fn test_serde_as_string() {
        let label = Label::parse_absolute("//pkg:foo_test").unwrap();
        let json = serde_json::to_string(&label).unwrap();
        assert_eq!(json, "\"//pkg:foo_test\"");
        let back: Label = serde_json::from_str(&json).unwrap();
        assert_eq!(back, label);
    }
}
