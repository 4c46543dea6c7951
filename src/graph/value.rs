//! Graph values
//!
//! Values are immutable once committed. Large payloads sit behind `Arc` so
//! handing a value to a dependent is a pointer copy.

use std::sync::Arc;

use super::error::EvalError;
use super::key::KeyKind;
use crate::action::ActionOutcome;
use crate::collab::FileState;
use crate::configuration::{BuildConfiguration, CppConfigurationParameters, ToolchainFile};
use crate::packages::{AstFileLookupValue, Label, TargetLookup};

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Text(Option<String>),
    AstFile(AstFileLookupValue),
    Target(TargetLookup),
    Label(Label),
    Toolchains(Arc<ToolchainFile>),
    CppParameters(Arc<CppConfigurationParameters>),
    Configuration(Arc<BuildConfiguration>),
    FileState(FileState),
    Action(Arc<ActionOutcome>),
}

macro_rules! accessor {
    ($fn_name:ident, $variant:ident, $ty:ty, $kind:expr) => {
        pub fn $fn_name(&self) -> Result<&$ty, EvalError> {
            match self {
                Value::$variant(inner) => Ok(inner),
                other => Err(other.mismatch($kind)),
            }
        }
    };
}

impl Value {
    accessor!(as_text, Text, Option<String>, KeyKind::Precomputed);
    accessor!(as_ast_file, AstFile, AstFileLookupValue, KeyKind::AstFileLookup);
    accessor!(as_target, Target, TargetLookup, KeyKind::Target);
    accessor!(as_label, Label, Label, KeyKind::Redirect);
    accessor!(as_toolchains, Toolchains, Arc<ToolchainFile>, KeyKind::ToolchainDescriptor);
    accessor!(
        as_cpp_parameters,
        CppParameters,
        Arc<CppConfigurationParameters>,
        KeyKind::ConfigurationFragment
    );
    accessor!(
        as_configuration,
        Configuration,
        Arc<BuildConfiguration>,
        KeyKind::BuildConfiguration
    );
    accessor!(as_file_state, FileState, FileState, KeyKind::FileState);
    accessor!(as_action, Action, Arc<ActionOutcome>, KeyKind::ActionExecution);

    /// Whether the value may be reused by a later evaluation call
    pub fn is_cacheable(&self) -> bool {
        match self {
            Value::Action(outcome) => outcome.cacheable,
            _ => true,
        }
    }

    fn variant_name(&self) -> &'static str {
        match self {
            Value::Text(_) => "Text",
            Value::AstFile(_) => "AstFile",
            Value::Target(_) => "Target",
            Value::Label(_) => "Label",
            Value::Toolchains(_) => "Toolchains",
            Value::CppParameters(_) => "CppParameters",
            Value::Configuration(_) => "Configuration",
            Value::FileState(_) => "FileState",
            Value::Action(_) => "Action",
        }
    }

    fn mismatch(&self, expected: KeyKind) -> EvalError {
        EvalError::Internal(format!(
            "expected a {expected} value, found {}",
            self.variant_name()
        ))
    }
}
