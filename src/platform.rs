//! Target platform parsing and host detection.
//!
//! Images are pulled for an explicit `os/arch[/variant]` platform which
//! defaults to the host. Multi-platform indexes are resolved against it.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// An OCI platform triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Platform {
    /// Operating system (`linux`, `windows`, ...).
    pub os: String,
    /// CPU architecture in OCI/GOARCH spelling (`amd64`, `arm64`, ...).
    pub architecture: String,
    /// Architecture variant (`v7`, `v8`), if any.
    pub variant: Option<String>,
}

impl Platform {
    /// Returns the platform of the running host.
    pub fn host() -> Self {
        let architecture = Self::detect_arch();
        let variant = match architecture {
            "arm" => Some("v7".to_string()),
            _ => None,
        };
        Self {
            os: Self::detect_os().to_string(),
            architecture: architecture.to_string(),
            variant,
        }
    }

    fn detect_os() -> &'static str {
        #[cfg(target_os = "linux")]
        return "linux";

        #[cfg(target_os = "macos")]
        return "darwin";

        #[cfg(target_os = "windows")]
        return "windows";

        #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
        return "unknown";
    }

    fn detect_arch() -> &'static str {
        #[cfg(target_arch = "x86_64")]
        return "amd64";

        #[cfg(target_arch = "aarch64")]
        return "arm64";

        #[cfg(target_arch = "arm")]
        return "arm";

        #[cfg(target_arch = "s390x")]
        return "s390x";

        #[cfg(target_arch = "powerpc64")]
        return "ppc64le";

        #[cfg(target_arch = "riscv64")]
        return "riscv64";

        #[cfg(not(any(
            target_arch = "x86_64",
            target_arch = "aarch64",
            target_arch = "arm",
            target_arch = "s390x",
            target_arch = "powerpc64",
            target_arch = "riscv64"
        )))]
        return "unknown";
    }

    /// Returns true if an index entry with these fields satisfies this
    /// platform. An unset variant on either side matches any variant.
    pub fn matches(&self, os: &str, architecture: &str, variant: Option<&str>) -> bool {
        if self.os != os || self.architecture != architecture {
            return false;
        }
        match (self.variant.as_deref(), variant) {
            (Some(want), Some(have)) => want == have,
            _ => true,
        }
    }
}

impl FromStr for Platform {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.trim().split('/').collect();
        let invalid = || Error::InvalidConfig(format!("invalid platform '{}': want os/arch[/variant]", s));

        match parts.as_slice() {
            [os, arch] if !os.is_empty() && !arch.is_empty() => Ok(Self {
                os: os.to_lowercase(),
                architecture: normalize_arch(arch),
                variant: None,
            }),
            [os, arch, variant] if !os.is_empty() && !arch.is_empty() && !variant.is_empty() => {
                Ok(Self {
                    os: os.to_lowercase(),
                    architecture: normalize_arch(arch),
                    variant: Some(variant.to_lowercase()),
                })
            }
            _ => Err(invalid()),
        }
    }
}

/// Maps common architecture aliases onto the OCI spelling.
fn normalize_arch(arch: &str) -> String {
    match arch.to_lowercase().as_str() {
        "x86_64" | "x86-64" => "amd64".to_string(),
        "aarch64" => "arm64".to_string(),
        other => other.to_string(),
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.variant {
            Some(variant) => write!(f, "{}/{}/{}", self.os, self.architecture, variant),
            None => write!(f, "{}/{}", self.os, self.architecture),
        }
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self::host()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_platform_string() {
        let platform = Platform::host();
        assert!(platform.to_string().contains('/'));
    }

    #[test]
    fn test_parse_with_variant() {
        let platform: Platform = "linux/arm/v7".parse().unwrap();
        assert_eq!(platform.os, "linux");
        assert_eq!(platform.architecture, "arm");
        assert_eq!(platform.variant.as_deref(), Some("v7"));
        assert_eq!(platform.to_string(), "linux/arm/v7");
    }

    #[test]
    fn test_parse_normalizes_arch() {
        let platform: Platform = "linux/x86_64".parse().unwrap();
        assert_eq!(platform.architecture, "amd64");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("linux".parse::<Platform>().is_err());
        assert!("linux//".parse::<Platform>().is_err());
        assert!("a/b/c/d".parse::<Platform>().is_err());
    }

    #[test]
    fn test_matches_ignores_missing_variant() {
        let platform: Platform = "linux/arm64".parse().unwrap();
        assert!(platform.matches("linux", "arm64", Some("v8")));
        assert!(!platform.matches("linux", "amd64", None));

        let pinned: Platform = "linux/arm/v7".parse().unwrap();
        assert!(!pinned.matches("linux", "arm", Some("v6")));
        assert!(pinned.matches("linux", "arm", None));
    }
}
