//! Syntactic checks for names, addresses and network ranges.
//!
//! The DNS name formats follow Kubernetes' `apimachinery/pkg/util/validation`.
use std::{
    fmt::Display,
    net::{IpAddr, Ipv4Addr},
    sync::LazyLock,
};

use const_format::concatcp;
use regex::Regex;
use snafu::{OptionExt, ResultExt, Snafu, ensure};

const RFC_1123_LABEL_MAX_LENGTH: usize = 63;
const RFC_1123_LABEL_FMT: &str = "[a-z0-9]([-a-z0-9]*[a-z0-9])?";

const RFC_1123_SUBDOMAIN_MAX_LENGTH: usize = 253;
const RFC_1123_SUBDOMAIN_FMT: &str =
    concatcp!(RFC_1123_LABEL_FMT, "(\\.", RFC_1123_LABEL_FMT, ")*");
const RFC_1123_SUBDOMAIN_ERROR_MSG: &str = "must consist of lower case alphanumeric characters, '-' or '.', and must start and end with an alphanumeric character";

/// Like [`RFC_1123_SUBDOMAIN_FMT`], but allows upper case characters and a trailing dot.
const DOMAIN_FMT: &str = "[a-zA-Z0-9]([-a-zA-Z0-9]*[a-zA-Z0-9])?(\\.[a-zA-Z0-9]([-a-zA-Z0-9]*[a-zA-Z0-9])?)*\\.?";
const DOMAIN_ERROR_MSG: &str = "must consist of alphanumeric characters, '-' or '.', and must start with an alphanumeric character and end with an alphanumeric character or '.'";

static RFC_1123_SUBDOMAIN_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!("^{RFC_1123_SUBDOMAIN_FMT}$"))
        .expect("failed to compile RFC 1123 subdomain regex")
});

static DOMAIN_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!("^{DOMAIN_FMT}$")).expect("failed to compile domain regex")
});

#[derive(Debug, PartialEq, Snafu)]
pub enum Error {
    #[snafu(display("must not be empty"))]
    Empty,

    #[snafu(display("is {length} bytes long but must be no more than {max_length}"))]
    TooLong { length: usize, max_length: usize },

    #[snafu(display("{message} (regex used for validation is {regex:?})"))]
    Mismatch {
        message: &'static str,
        regex: &'static str,
    },

    #[snafu(display("{label:?} is longer than {RFC_1123_LABEL_MAX_LENGTH} characters"))]
    LabelTooLong { label: String },

    #[snafu(display("is neither an IP address nor a DNS name"))]
    NotAnAddress,

    #[snafu(display("is not an IP address"))]
    NotAnIpAddress { source: std::net::AddrParseError },

    #[snafu(display("is not in CIDR notation (ADDRESS/PREFIX)"))]
    NotCidr,

    #[snafu(display("has an invalid prefix length {prefix:?}, must be at most {max}"))]
    InvalidPrefixLength { prefix: String, max: u8 },
}

/// A collection of errors found while checking one value.
#[derive(Debug, PartialEq)]
pub struct Errors(Vec<Error>);

impl Display for Errors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (index, error) in self.0.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Errors {}

type Result<T = (), E = Errors> = std::result::Result<T, E>;

fn validate_length(value: &str, max_length: usize) -> Result<(), Error> {
    ensure!(!value.is_empty(), EmptySnafu);
    ensure!(
        value.len() <= max_length,
        TooLongSnafu {
            length: value.len(),
            max_length,
        }
    );
    Ok(())
}

fn validate_regex(value: &str, regex: &'static Regex, message: &'static str) -> Result<(), Error> {
    ensure!(
        regex.is_match(value),
        MismatchSnafu {
            message,
            regex: regex.as_str().trim_start_matches('^').trim_end_matches('$'),
        }
    );
    Ok(())
}

/// Every label between the dots is limited separately.
fn validate_labels(value: &str) -> Result<(), Error> {
    match value
        .trim_end_matches('.')
        .split('.')
        .find(|label| label.len() > RFC_1123_LABEL_MAX_LENGTH)
    {
        Some(label) => LabelTooLongSnafu { label }.fail(),
        None => Ok(()),
    }
}

/// Returns [`Ok`] if every check passed, all failures otherwise.
fn validate_all(checks: impl IntoIterator<Item = Result<(), Error>>) -> Result {
    let errors: Vec<_> = checks.into_iter().filter_map(|check| check.err()).collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(Errors(errors))
    }
}

/// A DNS name as used for hostnames, e.g. `cp-1` or `cp-1.lab.example.com`.
pub fn is_rfc_1123_subdomain(value: &str) -> Result {
    validate_all([
        validate_length(value, RFC_1123_SUBDOMAIN_MAX_LENGTH),
        validate_regex(value, &RFC_1123_SUBDOMAIN_REGEX, RFC_1123_SUBDOMAIN_ERROR_MSG),
        validate_labels(value),
    ])
}

/// A DNS domain like `cluster.local` or `example.com.`.
pub fn is_domain(value: &str) -> Result {
    validate_all([
        validate_length(value, RFC_1123_SUBDOMAIN_MAX_LENGTH),
        validate_regex(value, &DOMAIN_REGEX, DOMAIN_ERROR_MSG),
        validate_labels(value),
    ])
}

pub fn is_ip_address(value: &str) -> Result<IpAddr, Error> {
    value.parse().context(NotAnIpAddressSnafu)
}

/// An IP address or a name that can be resolved to one.
pub fn is_address(value: &str) -> Result<(), Error> {
    if is_ip_address(value).is_ok() || is_domain(value).is_ok() {
        Ok(())
    } else {
        NotAnAddressSnafu.fail()
    }
}

/// A network range like `10.244.0.0/16` or `fd00::/64`.
pub fn is_cidr(value: &str) -> Result<(IpAddr, u8), Error> {
    let (address, prefix) = value.split_once('/').context(NotCidrSnafu)?;
    let address = is_ip_address(address)?;
    let max = match address {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    };

    let length = prefix
        .parse::<u8>()
        .ok()
        .filter(|length| *length <= max)
        .context(InvalidPrefixLengthSnafu { prefix, max })?;
    Ok((address, length))
}

/// An interface address, which is usually given in CIDR notation but may also be a plain
/// address.
pub fn is_interface_address(value: &str) -> Result<(), Error> {
    if value.contains('/') {
        is_cidr(value).map(|_| ())
    } else {
        is_ip_address(value).map(|_| ())
    }
}

/// A route destination. Default routes may also be written as a bare `0.0.0.0`.
pub fn is_route_network(value: &str) -> Result<(), Error> {
    match is_cidr(value) {
        Ok(_) => Ok(()),
        Err(_) if value == Ipv4Addr::UNSPECIFIED.to_string() => Ok(()),
        Err(error) => Err(error),
    }
}
