//! Targets and the package resolver collaborator

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::label::Label;

/// A resolved target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Target {
    /// A source file checked into the workspace
    InputFile { label: Label },
    /// An instance of a rule class
    Rule { label: Label, rule_class: String },
    /// A target that forwards to another label
    Alias { label: Label, actual: Label },
}

impl Target {
    pub fn label(&self) -> &Label {
        match self {
            Target::InputFile { label } | Target::Rule { label, .. } | Target::Alias { label, .. } => {
                label
            }
        }
    }

    pub fn is_input_file(&self) -> bool {
        matches!(self, Target::InputFile { .. })
    }

    /// True for a rule of exactly `class`
    pub fn is_rule_of(&self, class: &str) -> bool {
        matches!(self, Target::Rule { rule_class, .. } if rule_class == class)
    }
}

/// Result of a target lookup. A missing target is a value, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetLookup {
    Found(Target),
    NotFound { label: Label, reason: String },
}

/// Resolver failures that are not "target not found"
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("no such package '{0}'")]
    NoSuchPackage(String),

    #[error("no such target '{0}'")]
    NoSuchTarget(Label),

    #[error("redirect cycle: {}", format_chain(.0))]
    RedirectCycle(Vec<Label>),
}

fn format_chain(chain: &[Label]) -> String {
    chain
        .iter()
        .map(Label::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Package/target lookup used by the configuration producers.
pub trait PackageResolver: Send + Sync {
    fn resolve_label(&self, label: &Label) -> Result<TargetLookup, ResolveError>;

    /// Follow aliases from `label` to the first non-alias target
    fn follow_redirects(&self, label: &Label) -> Result<Label, ResolveError>;
}

/// Resolver backed by an in-memory target table
#[derive(Debug, Clone, Default)]
pub struct StaticPackageResolver {
    packages: BTreeSet<String>,
    targets: HashMap<Label, Target>,
}

impl StaticPackageResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a package without adding targets to it
    pub fn add_package(&mut self, package: impl Into<String>) -> &mut Self {
        self.packages.insert(package.into());
        self
    }

    pub fn add_target(&mut self, target: Target) -> &mut Self {
        self.packages.insert(target.label().package().to_string());
        self.targets.insert(target.label().clone(), target);
        self
    }

    pub fn add_input_file(&mut self, label: Label) -> &mut Self {
        self.add_target(Target::InputFile { label })
    }

    pub fn add_rule(&mut self, label: Label, rule_class: impl Into<String>) -> &mut Self {
        self.add_target(Target::Rule {
            label,
            rule_class: rule_class.into(),
        })
    }

    pub fn add_alias(&mut self, label: Label, actual: Label) -> &mut Self {
        self.add_target(Target::Alias { label, actual })
    }

    pub fn has_package(&self, package: &str) -> bool {
        self.packages.contains(package)
    }
}

impl PackageResolver for StaticPackageResolver {
    fn resolve_label(&self, label: &Label) -> Result<TargetLookup, ResolveError> {
        if !self.packages.contains(label.package()) {
            return Ok(TargetLookup::NotFound {
                label: label.clone(),
                reason: format!("no such package '{}'", label.package()),
            });
        }
        Ok(match self.targets.get(label) {
            Some(target) => TargetLookup::Found(target.clone()),
            None => TargetLookup::NotFound {
                label: label.clone(),
                reason: format!(
                    "no such target '{}': target '{}' not declared in package '{}'",
                    label,
                    label.name(),
                    label.package()
                ),
            },
        })
    }

    fn follow_redirects(&self, label: &Label) -> Result<Label, ResolveError> {
        let mut seen = HashSet::new();
        let mut chain = vec![label.clone()];
        let mut current = label.clone();
        loop {
            if !seen.insert(current.clone()) {
                return Err(ResolveError::RedirectCycle(chain));
            }
            match self.targets.get(&current) {
                Some(Target::Alias { actual, .. }) => {
                    chain.push(actual.clone());
                    current = actual.clone();
                }
                Some(_) => return Ok(current),
                None if self.packages.contains(current.package()) => {
                    return Err(ResolveError::NoSuchTarget(current))
                }
                None => return Err(ResolveError::NoSuchPackage(current.package().to_string())),
            }
        }
    }
}

/// Path of the build file that declares `label`
pub fn build_file_path(label: &Label) -> PathBuf {
    std::path::Path::new(label.package()).join("BUILD")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn label(s: &str) -> Label {
        Label::parse_absolute(s).unwrap()
    }

    fn resolver() -> StaticPackageResolver {
        let mut r = StaticPackageResolver::new();
        r.add_rule(label("//tools/cpp:cc-compiler-k8"), "cc_toolchain")
            .add_input_file(label("//fdo:profile.zip"))
            .add_alias(label("//tools/cpp:default"), label("//tools/cpp:toolchain"))
            .add_rule(label("//tools/cpp:toolchain"), "cc_toolchain_suite");
        r
    }

    #[test]
    fn test_resolve_found_and_missing() {
        let r = resolver();

        let found = r.resolve_label(&label("//fdo:profile.zip")).unwrap();
        assert!(matches!(found, TargetLookup::Found(ref t) if t.is_input_file()));

        let missing = r.resolve_label(&label("//fdo:other.zip")).unwrap();
        assert!(matches!(missing, TargetLookup::NotFound { .. }));

        let no_pkg = r.resolve_label(&label("//nowhere:x")).unwrap();
        match no_pkg {
            TargetLookup::NotFound { reason, .. } => assert!(reason.contains("no such package")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_follow_redirects() {
        let r = resolver();
        assert_eq!(
            r.follow_redirects(&label("//tools/cpp:default")).unwrap(),
            label("//tools/cpp:toolchain")
        );
        assert_eq!(
            r.follow_redirects(&label("//tools/cpp:toolchain")).unwrap(),
            label("//tools/cpp:toolchain")
        );
    }

    #[test]
    fn test_redirect_cycle() {
        let mut r = StaticPackageResolver::new();
        r.add_alias(label("//a:x"), label("//a:y"))
            .add_alias(label("//a:y"), label("//a:x"));

        let err = r.follow_redirects(&label("//a:x")).unwrap_err();
        assert_eq!(err.to_string(), "redirect cycle: //a:x -> //a:y -> //a:x");
    }

    #[test]
    fn test_rule_class_check() {
        let t = Target::Rule {
            label: label("//tools/cpp:cc-compiler-k8"),
            rule_class: "cc_toolchain".to_string(),
        };
        assert!(t.is_rule_of("cc_toolchain"));
        assert!(!t.is_rule_of("cc_library"));
        assert!(!t.is_input_file());
    }
}
