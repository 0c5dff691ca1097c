//! Target triples for the release matrix.

use serde::{Deserialize, Serialize};

use crate::error::{CiError, CiResult};

/// Triples built for every release unless configured otherwise.
pub const DEFAULT_TARGETS: &[&str] = &[
    "x86_64-pc-windows-gnu",
    "x86_64-unknown-linux-musl",
    "x86_64-apple-darwin",
];

/// Operating system family of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetOs {
    Windows,
    Linux,
    MacOs,
    Other,
}

/// Archive used to bundle a target's artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveFormat {
    Zip,
    TarGz,
}

impl ArchiveFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ArchiveFormat::Zip => "zip",
            ArchiveFormat::TarGz => "tar.gz",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ArchiveFormat::Zip => "application/zip",
            ArchiveFormat::TarGz => "application/gzip",
        }
    }
}

/// A platform/architecture/toolchain identifier, e.g. `x86_64-unknown-linux-musl`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TargetTriple(String);

impl TargetTriple {
    pub fn parse(triple: &str) -> CiResult<Self> {
        let triple = triple.trim();
        let parts: Vec<&str> = triple.split('-').collect();
        let well_formed = parts.len() >= 3
            && parts.iter().all(|p| {
                !p.is_empty()
                    && p.chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
            });
        if !well_formed {
            return Err(CiError::InvalidTarget(triple.to_string()));
        }
        Ok(TargetTriple(triple.to_string()))
    }

    /// The default release matrix.
    pub fn defaults() -> Vec<Self> {
        DEFAULT_TARGETS
            .iter()
            .map(|t| TargetTriple(t.to_string()))
            .collect()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn arch(&self) -> &str {
        self.0.split('-').next().unwrap_or_default()
    }

    pub fn os(&self) -> TargetOs {
        if self.0.contains("-windows") {
            TargetOs::Windows
        } else if self.0.contains("-darwin") {
            TargetOs::MacOs
        } else if self.0.contains("-linux") {
            TargetOs::Linux
        } else {
            TargetOs::Other
        }
    }

    /// File suffix of executables built for this target.
    pub fn binary_suffix(&self) -> &'static str {
        match self.os() {
            TargetOs::Windows => ".exe",
            _ => "",
        }
    }

    pub fn archive_format(&self) -> ArchiveFormat {
        match self.os() {
            TargetOs::Windows => ArchiveFormat::Zip,
            _ => ArchiveFormat::TarGz,
        }
    }
}

impl TryFrom<String> for TargetTriple {
    type Error = CiError;

    fn try_from(s: String) -> CiResult<Self> {
        TargetTriple::parse(&s)
    }
}

impl From<TargetTriple> for String {
    fn from(t: TargetTriple) -> Self {
        t.0
    }
}

impl std::fmt::Display for TargetTriple {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
