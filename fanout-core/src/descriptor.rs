//! Worker descriptors: `name[-installation[-sdkVersion]]`.
//!
//! The same logical identity can run several independent installations
//! (`alice-a`, `alice-b`), each optionally pinned to a specific SDK version
//! (`alice-b-4.2.6`). A bare `alice` means installation `a` on the default
//! version.

use std::fmt;
use thiserror::Error;

/// Installation used when a descriptor does not name one.
pub const DEFAULT_INSTALLATION: &str = "a";

/// Errors from [`WorkerDescriptor::parse`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptorError {
    /// Empty descriptor or empty segment
    #[error("worker descriptor is empty")]
    Empty,

    /// Base name contains characters other than ASCII alphanumerics and `_`
    #[error("invalid worker name: {0}")]
    InvalidName(String),

    /// Version segment not in the registry
    #[error("unknown sdk version {version} in descriptor {descriptor}")]
    UnknownVersion {
        /// Full descriptor
        descriptor: String,
        /// Offending version
        version: String,
    },

    /// More than three segments
    #[error("too many segments in worker descriptor: {0}")]
    TooManySegments(String),
}

/// Parsed worker descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerDescriptor {
    /// Logical identity
    pub base_name: String,
    /// Installation suffix
    pub installation: String,
    /// Pinned SDK version, if any
    pub sdk_version: Option<String>,
}

impl WorkerDescriptor {
    /// Descriptor for the default installation of `base_name`.
    pub fn new(base_name: impl Into<String>) -> Self {
        Self {
            base_name: base_name.into(),
            installation: DEFAULT_INSTALLATION.to_string(),
            sdk_version: None,
        }
    }

    /// Parse a descriptor against the set of known SDK versions.
    ///
    /// A two-segment descriptor whose second segment is a known version is
    /// read as `name-version` on the default installation.
    pub fn parse(input: &str, known_versions: &[&str]) -> Result<Self, DescriptorError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(DescriptorError::Empty);
        }

        // Versions contain dots but never dashes, so a plain split is safe
        let parts: Vec<&str> = input.split('-').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(DescriptorError::Empty);
        }

        let base_name = parts[0];
        if !base_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(DescriptorError::InvalidName(base_name.to_string()));
        }

        let check_version = |version: &str| {
            if known_versions.contains(&version) {
                Ok(Some(version.to_string()))
            } else {
                Err(DescriptorError::UnknownVersion {
                    descriptor: input.to_string(),
                    version: version.to_string(),
                })
            }
        };

        let (installation, sdk_version) = match parts.as_slice() {
            [_] => (DEFAULT_INSTALLATION.to_string(), None),
            [_, second] if known_versions.contains(second) => {
                (DEFAULT_INSTALLATION.to_string(), Some(second.to_string()))
            }
            [_, installation] => (installation.to_string(), None),
            [_, installation, version] => (installation.to_string(), check_version(version)?),
            _ => return Err(DescriptorError::TooManySegments(input.to_string())),
        };

        Ok(Self {
            base_name: base_name.to_string(),
            installation,
            sdk_version,
        })
    }

    /// Label used for the worker: the base name for the default
    /// installation, `name-installation` otherwise.
    pub fn label(&self) -> String {
        if self.installation == DEFAULT_INSTALLATION {
            self.base_name.clone()
        } else {
            format!("{}-{}", self.base_name, self.installation)
        }
    }
}

impl fmt::Display for WorkerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.base_name, self.installation)?;
        if let Some(version) = &self.sdk_version {
            write!(f, "-{}", version)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VERSIONS: &[&str] = &["4.0.3", "4.2.6", "4.5.0"];

    #[test]
    fn bare_name_uses_default_installation() {
        let d = WorkerDescriptor::parse("alice", VERSIONS).unwrap();
        assert_eq!(d, WorkerDescriptor::new("alice"));
        assert_eq!(d.label(), "alice");
    }

    #[test]
    fn installation_suffix() {
        let d = WorkerDescriptor::parse("bob-b", VERSIONS).unwrap();
        assert_eq!(d.base_name, "bob");
        assert_eq!(d.installation, "b");
        assert_eq!(d.sdk_version, None);
        assert_eq!(d.label(), "bob-b");
    }

    #[test]
    fn version_without_installation() {
        let d = WorkerDescriptor::parse("carol-4.2.6", VERSIONS).unwrap();
        assert_eq!(d.installation, DEFAULT_INSTALLATION);
        assert_eq!(d.sdk_version.as_deref(), Some("4.2.6"));
    }

    #[test]
    fn full_descriptor() {
        let d = WorkerDescriptor::parse("dave-c-4.0.3", VERSIONS).unwrap();
        assert_eq!(d.to_string(), "dave-c-4.0.3");
    }

    #[test]
    fn unknown_version_rejected() {
        let err = WorkerDescriptor::parse("erin-a-9.9.9", VERSIONS).unwrap_err();
        assert!(matches!(err, DescriptorError::UnknownVersion { version, .. } if version == "9.9.9"));
    }

    #[test]
    fn malformed_descriptors_rejected() {
        assert_eq!(WorkerDescriptor::parse("", VERSIONS), Err(DescriptorError::Empty));
        assert_eq!(WorkerDescriptor::parse("a--b", VERSIONS), Err(DescriptorError::Empty));
        assert!(matches!(
            WorkerDescriptor::parse("a-b-4.0.3-x", VERSIONS),
            Err(DescriptorError::TooManySegments(_))
        ));
        assert!(matches!(
            WorkerDescriptor::parse("al ice", VERSIONS),
            Err(DescriptorError::InvalidName(_))
        ));
    }
}
