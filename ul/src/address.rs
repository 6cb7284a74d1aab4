//! Addressing of application entities in a DICOM network.
//!
//! DICOM nodes are reached through a network endpoint
//! plus an application entity title,
//! conventionally written as `{ae_title}@{host}:{port}`.
//! [`AeAddr`] covers the case where the title is not known yet
//! (it can be filled in later from configuration),
//! while [`FullAeAddr`] guarantees one is present.
//!
//! The network part is kept unresolved,
//! so host names are welcome;
//! name resolution happens when a connection is opened.

use std::fmt;
use std::str::FromStr;

use snafu::{ensure, OptionExt, Snafu};

/// The AE title field is at most 16 characters long.
const AE_TITLE_MAX: usize = 16;

/// An error parsing an application entity address.
#[derive(Debug, Clone, Eq, PartialEq, Snafu)]
#[non_exhaustive]
pub enum AddressParseError {
    #[snafu(display(
        "invalid AE title `{}` (must be 1 to 16 characters, no `@`)",
        ae_title
    ))]
    InvalidAeTitle { ae_title: String },

    #[snafu(display("no port in network address `{}`", address))]
    MissingPort { address: String },

    /// the address carries no AE title
    MissingAeTitle,
}

fn validated_ae_title(ae_title: &str) -> Result<String, AddressParseError> {
    let ae_title = ae_title.trim();
    ensure!(
        !ae_title.is_empty()
            && ae_title.len() <= AE_TITLE_MAX
            && ae_title.bytes().all(|c| (b' '..=b'~').contains(&c)),
        InvalidAeTitleSnafu { ae_title }
    );
    Ok(ae_title.to_string())
}

fn validated_network_address(address: &str) -> Result<String, AddressParseError> {
    // the host part may be a name, so only the port can be checked here
    let has_port = address
        .rsplit_once(':')
        .is_some_and(|(host, port)| {
            !host.is_empty() && !port.is_empty() && port.bytes().all(|c| c.is_ascii_digit())
        });
    ensure!(has_port, MissingPortSnafu { address });
    Ok(address.to_string())
}

/// An address to a DICOM node
/// whose application entity title may be absent.
///
/// Parses from `{ae_title}@{host}:{port}` as well as plain `{host}:{port}`.
/// Use [`with_ae_title`](AeAddr::with_ae_title)
/// or [`with_default_ae_title`](AeAddr::with_default_ae_title)
/// to promote it to a [`FullAeAddr`].
///
/// # Example
///
/// ```
/// # use radlink_ul::address::AeAddr;
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let peer: AeAddr = "pacs.hospital.example:11112".parse()?;
/// assert_eq!(peer.ae_title(), None);
///
/// // promote with a title from configuration
/// let peer = peer.with_default_ae_title("ARCHIVE");
/// assert_eq!(peer.ae_title(), "ARCHIVE");
/// assert_eq!(peer.to_string(), "ARCHIVE@pacs.hospital.example:11112");
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct AeAddr {
    ae_title: Option<String>,
    address: String,
}

impl AeAddr {
    /// Create an address with no AE title
    /// from a `{host}:{port}` network address.
    pub fn new(address: impl Into<String>) -> Self {
        AeAddr {
            ae_title: None,
            address: address.into(),
        }
    }

    /// The application entity title, if one is known.
    pub fn ae_title(&self) -> Option<&str> {
        self.ae_title.as_deref()
    }

    /// The unresolved `{host}:{port}` network address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Promote to a full address,
    /// replacing whatever AE title this address may carry.
    pub fn with_ae_title(self, ae_title: impl Into<String>) -> FullAeAddr {
        FullAeAddr {
            ae_title: ae_title.into(),
            address: self.address,
        }
    }

    /// Promote to a full address,
    /// falling back to the given AE title
    /// only when this address carries none.
    pub fn with_default_ae_title(self, ae_title: impl Into<String>) -> FullAeAddr {
        FullAeAddr {
            ae_title: self.ae_title.unwrap_or_else(|| ae_title.into()),
            address: self.address,
        }
    }
}

impl FromStr for AeAddr {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('@') {
            Some((ae_title, address)) => Ok(AeAddr {
                ae_title: Some(validated_ae_title(ae_title)?),
                address: validated_network_address(address)?,
            }),
            None => Ok(AeAddr {
                ae_title: None,
                address: validated_network_address(s)?,
            }),
        }
    }
}

impl fmt::Display for AeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.ae_title {
            Some(ae_title) => write!(f, "{}@{}", ae_title, self.address),
            None => f.write_str(&self.address),
        }
    }
}

/// An address to a DICOM node
/// with a mandatory application entity title.
///
/// # Example
///
/// ```
/// # use radlink_ul::address::FullAeAddr;
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let peer: FullAeAddr = "ARCHIVE@10.0.0.7:11112".parse()?;
/// assert_eq!(peer.ae_title(), "ARCHIVE");
/// assert_eq!(peer.address(), "10.0.0.7:11112");
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct FullAeAddr {
    ae_title: String,
    address: String,
}

impl FullAeAddr {
    /// Create a full address from an AE title
    /// and a `{host}:{port}` network address.
    pub fn new(ae_title: impl Into<String>, address: impl Into<String>) -> Self {
        FullAeAddr {
            ae_title: ae_title.into(),
            address: address.into(),
        }
    }

    /// The application entity title.
    pub fn ae_title(&self) -> &str {
        &self.ae_title
    }

    /// The unresolved `{host}:{port}` network address.
    pub fn address(&self) -> &str {
        &self.address
    }
}

impl From<FullAeAddr> for AeAddr {
    fn from(full: FullAeAddr) -> Self {
        AeAddr {
            ae_title: Some(full.ae_title),
            address: full.address,
        }
    }
}

impl FromStr for FullAeAddr {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let addr: AeAddr = s.parse()?;
        let ae_title = addr.ae_title.context(MissingAeTitleSnafu)?;
        Ok(FullAeAddr {
            ae_title,
            address: addr.address,
        })
    }
}

impl fmt::Display for FullAeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.ae_title, self.address)
    }
}
