//! Labels, targets and the package-level producers

mod build_file;
mod label;
mod target;

pub use build_file::{
    AstFileLookupProducer, AstFileLookupValue, BuildFileAst, BuildFileParser,
    LocalBuildFileParser, RedirectProducer, TargetProducer,
};
pub use label::{Label, LabelError};
pub use target::{
    build_file_path, PackageResolver, ResolveError, StaticPackageResolver, Target, TargetLookup,
};
