//! Version shapes and the Talos/Kubernetes support matrix.
use std::ops::RangeInclusive;

use semver::Version;
use snafu::{ResultExt, Snafu};

/// Kubernetes minor versions (of Kubernetes 1.x) supported by each Talos 1.x minor version.
const SUPPORT_MATRIX: &[(u64, RangeInclusive<u64>)] = &[
    (3, 24..=26),
    (4, 25..=27),
    (5, 26..=28),
    (6, 24..=29),
    (7, 25..=30),
    (8, 26..=31),
    (9, 27..=32),
    (10, 28..=33),
    (11, 29..=34),
];

#[derive(Debug, Snafu)]
#[snafu(display("{input:?} is not a version of the form vMAJOR.MINOR.PATCH"))]
pub struct ParseVersionError {
    source: semver::Error,
    input: String,
}

/// Parses versions like `v1.9.5` (the leading `v` is optional).
pub fn parse_version(input: &str) -> Result<Version, ParseVersionError> {
    let trimmed = input.trim();
    Version::parse(trimmed.strip_prefix('v').unwrap_or(trimmed)).context(ParseVersionSnafu { input })
}

/// The outcome of looking up a version pair in the support matrix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Compatibility {
    Supported,

    /// The Kubernetes version is outside of the supported range.
    Unsupported { supported: RangeInclusive<u64> },

    /// The Talos version is not in the matrix, so nothing can be said.
    Unknown,
}

pub fn compatibility(talos: &Version, kubernetes: &Version) -> Compatibility {
    if talos.major != 1 {
        return Compatibility::Unknown;
    }

    let Some((_, supported)) = SUPPORT_MATRIX.iter().find(|(minor, _)| *minor == talos.minor) else {
        return Compatibility::Unknown;
    };

    if kubernetes.major == 1 && supported.contains(&kubernetes.minor) {
        Compatibility::Supported
    } else {
        Compatibility::Unsupported {
            supported: supported.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("v1.9.5", "v1.32.3", Compatibility::Supported)]
    #[case("1.9.0", "1.27.0", Compatibility::Supported)]
    #[case("v1.9.5", "v1.33.0", Compatibility::Unsupported { supported: 27..=32 })]
    #[case("v1.6.0", "v1.23.9", Compatibility::Unsupported { supported: 24..=29 })]
    #[case("v1.9.5", "v2.0.0", Compatibility::Unsupported { supported: 27..=32 })]
    #[case("v1.99.0", "v1.32.3", Compatibility::Unknown)]
    #[case("v2.0.0", "v1.32.3", Compatibility::Unknown)]
    fn support_matrix(#[case] talos: &str, #[case] kubernetes: &str, #[case] expected: Compatibility) {
        let talos = parse_version(talos).unwrap();
        let kubernetes = parse_version(kubernetes).unwrap();
        assert_eq!(compatibility(&talos, &kubernetes), expected);
    }

    #[rstest]
    #[case("v1.9")]
    #[case("latest")]
    #[case("")]
    fn rejects_malformed_versions(#[case] input: &str) {
        assert!(parse_version(input).is_err());
    }
}
