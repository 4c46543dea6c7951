//! Build options, toolchain descriptors and configuration producers

mod build;
mod cpp;
mod options;
mod toolchain;

pub use build::{BuildConfiguration, BuildConfigurationProducer, CppConfiguration, CLIENT_ENV_PREFIX};
pub use cpp::{
    ConfigurationFragmentProducer, CppConfigurationParameters, CpuTransformer, CC_TOOLCHAIN_PREFIX,
    CC_TOOLCHAIN_RULE,
};
pub use options::{BuildOptions, ConfigurationKey, FragmentKind, TestEnvEntry};
pub use toolchain::{
    DescriptorError, LocalToolchainLoader, Toolchain, ToolchainDescriptorProducer, ToolchainFile,
    ToolchainLoader, DESCRIPTOR_FILE_NAME,
};
