//! Release pipeline: target triples, packaging and publishing.

pub mod action;
pub mod package;
pub mod publish;
pub mod target;

pub use action::{compile_and_release, ReleaseParams, ReleasedAsset};
pub use package::{archive_name, package, ArtifactSet, PackageRequest};
pub use publish::{
    AssetPublisher, DirectoryPublisher, GithubReleasePublisher, MemoryPublisher, PublishedAsset,
};
pub use target::{ArchiveFormat, TargetOs, TargetTriple, DEFAULT_TARGETS};
