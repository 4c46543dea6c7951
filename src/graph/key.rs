//! Graph keys
//!
//! The set of key kinds is closed. A key's kind selects the producer that
//! resolves it; equality of kind and payload is the cache lookup contract.

use std::fmt;
use std::path::PathBuf;

use crate::action::ActionId;
use crate::configuration::{BuildOptions, ConfigurationKey};
use crate::packages::Label;

/// Producer selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyKind {
    Precomputed,
    AstFileLookup,
    Target,
    Redirect,
    ToolchainDescriptor,
    ConfigurationFragment,
    BuildConfiguration,
    FileState,
    ActionExecution,
}

impl KeyKind {
    pub fn name(&self) -> &'static str {
        match self {
            KeyKind::Precomputed => "precomputed",
            KeyKind::AstFileLookup => "ast-file-lookup",
            KeyKind::Target => "target",
            KeyKind::Redirect => "redirect",
            KeyKind::ToolchainDescriptor => "toolchain-descriptor",
            KeyKind::ConfigurationFragment => "configuration-fragment",
            KeyKind::BuildConfiguration => "build-configuration",
            KeyKind::FileState => "file-state",
            KeyKind::ActionExecution => "action-execution",
        }
    }
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    /// Driver-injected value by name
    Precomputed(String),
    /// Parsed build file at a workspace-relative path
    AstFileLookup(PathBuf),
    Target(Label),
    /// Final label after following aliases
    Redirect(Label),
    /// Toolchain descriptor of a (redirect-resolved) crosstool top
    ToolchainDescriptor(Label),
    ConfigurationFragment(ConfigurationKey),
    BuildConfiguration(BuildOptions),
    /// Digest of an exec-root relative source path
    FileState(PathBuf),
    ActionExecution(ActionId),
}

impl Key {
    pub fn kind(&self) -> KeyKind {
        match self {
            Key::Precomputed(_) => KeyKind::Precomputed,
            Key::AstFileLookup(_) => KeyKind::AstFileLookup,
            Key::Target(_) => KeyKind::Target,
            Key::Redirect(_) => KeyKind::Redirect,
            Key::ToolchainDescriptor(_) => KeyKind::ToolchainDescriptor,
            Key::ConfigurationFragment(_) => KeyKind::ConfigurationFragment,
            Key::BuildConfiguration(_) => KeyKind::BuildConfiguration,
            Key::FileState(_) => KeyKind::FileState,
            Key::ActionExecution(_) => KeyKind::ActionExecution,
        }
    }

    pub fn precomputed(name: impl Into<String>) -> Self {
        Key::Precomputed(name.into())
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.kind())?;
        match self {
            Key::Precomputed(name) => write!(f, "{name}"),
            Key::AstFileLookup(path) | Key::FileState(path) => write!(f, "{}", path.display()),
            Key::Target(label) | Key::Redirect(label) | Key::ToolchainDescriptor(label) => {
                write!(f, "{label}")
            }
            Key::ConfigurationFragment(key) => write!(
                f,
                "{}[cpu={}, crosstool_top={}]",
                key.fragment, key.options.cpu, key.options.crosstool_top
            ),
            Key::BuildConfiguration(options) => {
                write!(f, "cpu={}, crosstool_top={}", options.cpu, options.crosstool_top)
            }
            Key::ActionExecution(id) => write!(f, "{id}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_equality_is_kind_and_payload() {
        let label = Label::parse_absolute("//tools/cpp:toolchain").unwrap();
        let a = Key::Target(label.clone());
        let b = Key::Redirect(label.clone());

        assert_ne!(a, b);
        assert_eq!(a, Key::Target(label));

        let set: HashSet<Key> = [a.clone(), a, b].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_display() {
        let key = Key::FileState(PathBuf::from("pkg/foo_test"));
        assert_eq!(key.to_string(), "file-state:pkg/foo_test");
        assert_eq!(key.kind(), KeyKind::FileState);
    }
}
