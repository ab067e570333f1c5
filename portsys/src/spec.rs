/*!
Package, feature, and triplet specifiers.

A `PackageSpec` names one buildable artifact: a port qualified by the triplet
it is built for. A `FeatureSpec` additionally names one feature of that
artifact, where the feature `"core"` means the bare package.
*/

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// An opaque identifier naming a target build configuration, e.g. `x64-linux`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub(crate) struct Triplet(String);

impl Triplet {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub(crate) fn as_str(&self) -> &str {
        &self.0
    }

    /// The `-`-separated segments of the triplet name. Each segment becomes a
    /// truthy dep-info variable, so `x64-linux` satisfies the platform
    /// expression `linux`.
    pub(crate) fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('-').filter(|s| !s.is_empty())
    }
}

impl Display for Triplet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Triplet {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Unique identity of a buildable artifact in a plan.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct PackageSpec {
    pub(crate) name: String,
    pub(crate) triplet: Triplet,
}

impl PackageSpec {
    pub(crate) fn new(name: impl Into<String>, triplet: Triplet) -> Self {
        Self {
            name: name.into(),
            triplet,
        }
    }
}

impl Display for PackageSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.triplet)
    }
}

/// One feature of a package spec. `core` is the bare package.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct FeatureSpec {
    pub(crate) spec: PackageSpec,
    pub(crate) feature: String,
}

pub(crate) const CORE_FEATURE: &str = "core";
pub(crate) const DEFAULT_FEATURES: &str = "default";

impl FeatureSpec {
    pub(crate) fn new(spec: PackageSpec, feature: impl Into<String>) -> Self {
        Self {
            spec,
            feature: feature.into(),
        }
    }

    pub(crate) fn core(spec: PackageSpec) -> Self {
        Self::new(spec, CORE_FEATURE)
    }
}

impl Display for FeatureSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]:{}", self.spec.name, self.feature, self.spec.triplet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_forms() {
        let spec = PackageSpec::new("zlib", Triplet::from("x64-linux"));
        assert_eq!(spec.to_string(), "zlib:x64-linux");
        assert_eq!(
            FeatureSpec::new(spec.clone(), "bzip2").to_string(),
            "zlib[bzip2]:x64-linux"
        );
        assert_eq!(FeatureSpec::core(spec).feature, "core");
    }

    #[test]
    fn triplet_segments() {
        let triplet = Triplet::from("arm64-osx-dynamic");
        let segments: Vec<&str> = triplet.segments().collect();
        assert_eq!(segments, vec!["arm64", "osx", "dynamic"]);
    }
}
