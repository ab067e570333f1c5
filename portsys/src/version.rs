/*!
Version text and the schemes under which it is interpreted.

Every port declares the scheme its version string follows. Two versions can
only be ordered when their schemes agree; comparing across schemes yields
[`VersionComp::Unknown`], which callers must surface rather than collapse to
"less" or "greater". Ties on the version text are broken by the port revision.
*/

use serde::{Deserialize, Serialize};
use snafu::{ensure, OptionExt, ResultExt, Snafu};
use std::fmt::{self, Display};
use std::str::FromStr;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub(crate) enum Error {
    #[snafu(display("empty version text"))]
    EmptyVersion,

    #[snafu(display("invalid port revision in '{text}': {source}"))]
    PortRevision {
        text: String,
        source: std::num::ParseIntError,
    },

    #[snafu(display("'{text}' is not a valid {scheme} version: {reason}"))]
    SchemeMismatch {
        text: String,
        scheme: VersionScheme,
        reason: String,
    },

    #[snafu(display("'{text}' is not a valid semver version: {source}"))]
    Semver {
        text: String,
        source: semver::Error,
    },
}

type Result<T> = std::result::Result<T, Error>;

/// The interpretation rule for a version string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub(crate) enum VersionScheme {
    /// Opaque text; equality only.
    String,
    /// Dot-separated decimal integers, compared component-wise.
    #[default]
    Relaxed,
    /// SemVer 2.0.0.
    Semver,
    /// `YYYY-MM-DD` with an optional relaxed suffix.
    Date,
}

impl Display for VersionScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            VersionScheme::String => "string",
            VersionScheme::Relaxed => "relaxed",
            VersionScheme::Semver => "semver",
            VersionScheme::Date => "date",
        })
    }
}

/// A version string plus its port revision. The revision counts changes to
/// the port's build recipe that do not change the upstream version.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct Version {
    pub(crate) text: String,
    pub(crate) port_revision: u32,
}

impl Version {
    pub(crate) fn new(text: impl Into<String>, port_revision: u32) -> Self {
        Self {
            text: text.into(),
            port_revision,
        }
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.port_revision == 0 {
            f.write_str(&self.text)
        } else {
            write!(f, "{}#{}", self.text, self.port_revision)
        }
    }
}

/// Parses `text` or `text#revision`.
impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ensure!(!s.is_empty(), EmptyVersionSnafu);
        match s.split_once('#') {
            None => Ok(Version::new(s, 0)),
            Some((text, revision)) => {
                ensure!(!text.is_empty(), EmptyVersionSnafu);
                let port_revision = revision.parse().context(PortRevisionSnafu { text: s })?;
                Ok(Version::new(text, port_revision))
            }
        }
    }
}

/// A version tagged with the scheme it must be interpreted under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SchemedVersion {
    pub(crate) scheme: VersionScheme,
    pub(crate) version: Version,
}

impl SchemedVersion {
    pub(crate) fn new(scheme: VersionScheme, version: Version) -> Self {
        Self { scheme, version }
    }
}

impl Display for SchemedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.version, self.scheme)
    }
}

/// Outcome of a version comparison. `Unknown` means the two versions do not
/// share an order: different schemes, or unequal opaque strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum VersionComp {
    Lt,
    Eq,
    Gt,
    Unknown,
}

/// Validate that `text` (without revision) is well formed under `scheme`.
pub(crate) fn parse_version(text: &str, scheme: VersionScheme) -> Result<Version> {
    let version: Version = text.parse()?;
    match scheme {
        VersionScheme::String => {}
        VersionScheme::Relaxed => {
            relaxed_parts(&version.text).context(SchemeMismatchSnafu {
                text,
                scheme,
                reason: "expected dot-separated decimal integers",
            })?;
        }
        VersionScheme::Semver => {
            semver::Version::parse(&version.text).context(SemverSnafu { text })?;
        }
        VersionScheme::Date => {
            date_parts(&version.text).context(SchemeMismatchSnafu {
                text,
                scheme,
                reason: "expected YYYY-MM-DD with an optional dotted suffix",
            })?;
        }
    }
    Ok(version)
}

/// Compare two schemed versions. Differing schemes are `Unknown`; equal
/// version text falls through to the port revision.
pub(crate) fn compare(a: &SchemedVersion, b: &SchemedVersion) -> VersionComp {
    if a.scheme != b.scheme {
        return VersionComp::Unknown;
    }

    let text_comp = match a.scheme {
        VersionScheme::String => {
            if a.version.text == b.version.text {
                VersionComp::Eq
            } else {
                return VersionComp::Unknown;
            }
        }
        VersionScheme::Relaxed => compare_relaxed(&a.version.text, &b.version.text),
        VersionScheme::Semver => compare_semver(&a.version.text, &b.version.text),
        VersionScheme::Date => compare_date(&a.version.text, &b.version.text),
    };

    match text_comp {
        VersionComp::Eq => from_ordering(a.version.port_revision.cmp(&b.version.port_revision)),
        other => other,
    }
}

fn from_ordering(ordering: std::cmp::Ordering) -> VersionComp {
    match ordering {
        std::cmp::Ordering::Less => VersionComp::Lt,
        std::cmp::Ordering::Equal => VersionComp::Eq,
        std::cmp::Ordering::Greater => VersionComp::Gt,
    }
}

fn relaxed_parts(text: &str) -> Option<Vec<u64>> {
    text.split('.')
        .map(|part| {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                None
            } else {
                part.parse().ok()
            }
        })
        .collect()
}

fn compare_relaxed(a: &str, b: &str) -> VersionComp {
    match (relaxed_parts(a), relaxed_parts(b)) {
        (Some(a), Some(b)) => from_ordering(a.cmp(&b)),
        _ => VersionComp::Unknown,
    }
}

fn compare_semver(a: &str, b: &str) -> VersionComp {
    match (semver::Version::parse(a), semver::Version::parse(b)) {
        (Ok(a), Ok(b)) => from_ordering(a.cmp(&b)),
        _ => VersionComp::Unknown,
    }
}

/// Split a date version into the `YYYY-MM-DD` prefix and the numeric parts of
/// its optional `.N.N…` suffix.
fn date_parts(text: &str) -> Option<(String, Vec<u64>)> {
    let (date, suffix) = match text.split_once('.') {
        Some((date, suffix)) => (date, Some(suffix)),
        None => (text, None),
    };

    let bytes = date.as_bytes();
    if bytes.len() != 10 || bytes[4] != b'-' || bytes[7] != b'-' {
        return None;
    }
    let digits_ok = |range: std::ops::Range<usize>| bytes[range].iter().all(u8::is_ascii_digit);
    if !digits_ok(0..4) || !digits_ok(5..7) || !digits_ok(8..10) {
        return None;
    }

    let suffix = match suffix {
        None => Vec::new(),
        Some(suffix) => relaxed_parts(suffix)?,
    };
    Some((date.to_string(), suffix))
}

fn compare_date(a: &str, b: &str) -> VersionComp {
    match (date_parts(a), date_parts(b)) {
        (Some(a), Some(b)) => from_ordering(a.cmp(&b)),
        _ => VersionComp::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schemed(text: &str, scheme: VersionScheme) -> SchemedVersion {
        SchemedVersion::new(scheme, text.parse().unwrap())
    }

    #[test]
    fn parses_port_revision() {
        let version: Version = "1.2.3#4".parse().unwrap();
        assert_eq!(version.text, "1.2.3");
        assert_eq!(version.port_revision, 4);
        assert_eq!(version.to_string(), "1.2.3#4");
        assert_eq!("1.2.3".parse::<Version>().unwrap().port_revision, 0);
        assert!("".parse::<Version>().is_err());
        assert!("1.0#x".parse::<Version>().is_err());
    }

    #[test]
    fn scheme_validation() {
        assert!(parse_version("anything goes", VersionScheme::String).is_ok());
        assert!(parse_version("1.2.3", VersionScheme::Relaxed).is_ok());
        assert!(parse_version("1.2.a", VersionScheme::Relaxed).is_err());
        assert!(parse_version("1.2.3-rc1", VersionScheme::Semver).is_ok());
        assert!(parse_version("2020-01-01", VersionScheme::Date).is_ok());
        assert!(parse_version("2020-01-01.5", VersionScheme::Date).is_ok());
        assert!(parse_version("2020-1-1", VersionScheme::Date).is_err());
    }

    #[test]
    fn relaxed_ordering() {
        let a = schemed("1.2", VersionScheme::Relaxed);
        let b = schemed("1.10", VersionScheme::Relaxed);
        assert_eq!(compare(&a, &b), VersionComp::Lt);
        assert_eq!(compare(&b, &a), VersionComp::Gt);
        // A longer version sorts after its prefix.
        let c = schemed("1.2.0", VersionScheme::Relaxed);
        assert_eq!(compare(&a, &c), VersionComp::Lt);
    }

    #[test]
    fn semver_ordering() {
        let a = schemed("1.0.0-alpha", VersionScheme::Semver);
        let b = schemed("1.0.0", VersionScheme::Semver);
        assert_eq!(compare(&a, &b), VersionComp::Lt);
    }

    #[test]
    fn date_ordering() {
        let a = schemed("2020-01-01", VersionScheme::Date);
        let b = schemed("2020-02-01.3", VersionScheme::Date);
        assert_eq!(compare(&a, &b), VersionComp::Lt);
        let c = schemed("2020-02-01.10", VersionScheme::Date);
        assert_eq!(compare(&b, &c), VersionComp::Lt);
    }

    #[test]
    fn string_scheme_is_equality_only() {
        let a = schemed("vista", VersionScheme::String);
        let b = schemed("xp", VersionScheme::String);
        assert_eq!(compare(&a, &b), VersionComp::Unknown);
        assert_eq!(compare(&a, &a.clone()), VersionComp::Eq);
    }

    #[test]
    fn differing_schemes_are_unknown() {
        let a = schemed("1.0.0", VersionScheme::Semver);
        let b = schemed("2020-01-01", VersionScheme::Date);
        assert_eq!(compare(&a, &b), VersionComp::Unknown);
    }

    #[test]
    fn port_revision_breaks_ties() {
        let a = schemed("1.0", VersionScheme::Relaxed);
        let b = schemed("1.0#2", VersionScheme::Relaxed);
        assert_eq!(compare(&a, &b), VersionComp::Lt);
        assert_eq!(compare(&b, &b.clone()), VersionComp::Eq);
    }
}
