use std::fmt::{self, Display};
use std::fs;
use std::path::{self, Path, PathBuf};
use std::str::FromStr;

use log::debug;

use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};

use crate::{Error, SIGNATURE_LEN};

/// A reference to a signing or verifying key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyRef {
    /// PEM key file on disk
    File(PathBuf),
    /// Hardware-resident key (signing only)
    Pkcs11(Pkcs11Uri),
}

impl KeyRef {
    /// Parse a key reference
    ///
    /// An existing file wins over URI parsing; anything that is neither an existing file
    /// nor a well-formed PKCS#11 URI is rejected.
    pub fn parse(key: &str) -> Result<Self, Error> {
        let path = Path::new(key);

        if path.is_file() {
            let path = path::absolute(path)?;

            debug!("Using key file `{}`", path.display());

            Ok(Self::File(path))
        } else if key.starts_with(Pkcs11Uri::SCHEME) {
            let uri = key.parse()?;

            debug!("Using PKCS#11 key `{}`", key);

            Ok(Self::Pkcs11(uri))
        } else {
            Err(Error::InvalidKeyRef(key.to_owned()))
        }
    }
}

/// A PKCS#11 URI (RFC 7512) identifying a key on a hardware token
///
/// Only the shape of the URI is checked: a `pkcs11:` scheme followed by `;`-separated
/// `name=value` path attributes and an optional `?`-introduced, `&`-separated query.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Pkcs11Uri(String);

impl Pkcs11Uri {
    const SCHEME: &'static str = "pkcs11:";

    /// The URI as passed to the PKCS#11 engine
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn attributes_valid(attrs: &str, separator: char) -> bool {
        attrs.split(separator).all(|attr| match attr.split_once('=') {
            Some((name, _)) => {
                !name.is_empty()
                    && name
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
            }
            None => false,
        })
    }
}

impl FromStr for Pkcs11Uri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidKeyRef(s.to_owned());

        let rest = s.strip_prefix(Self::SCHEME).ok_or_else(invalid)?;

        let (attrs, query) = match rest.split_once('?') {
            Some((attrs, query)) => (attrs, Some(query)),
            None => (rest, None),
        };

        if attrs.is_empty() || !Self::attributes_valid(attrs, ';') {
            Err(invalid())?;
        }

        if let Some(query) = query {
            if query.is_empty() || !Self::attributes_valid(query, '&') {
                Err(invalid())?;
            }
        }

        Ok(Self(s.to_owned()))
    }
}

impl Display for Pkcs11Uri {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Load an RSA-2048 private key from a PEM file (PKCS#8, or PKCS#1 as a fallback)
pub fn load_private_key(path: &Path) -> Result<RsaPrivateKey, Error> {
    debug!("Loading signing key from `{}`...", path.display());

    let pem = fs::read_to_string(path)?;

    let key = RsaPrivateKey::from_pkcs8_pem(&pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(&pem))
        .map_err(|e| {
            Error::Key(format!(
                "Parsing PEM signing key `{}` failed: {}",
                path.display(),
                e
            ))
        })?;

    if key.size() != SIGNATURE_LEN {
        Err(Error::UnsupportedKeySize(key.size() * 8))?;
    }

    debug!("Signing key loaded");

    Ok(key)
}

/// Load an RSA public key from a PEM file (SPKI, or PKCS#1 as a fallback)
pub fn load_public_key(path: &Path) -> Result<RsaPublicKey, Error> {
    debug!("Loading public key from `{}`...", path.display());

    let pem = fs::read_to_string(path)?;

    RsaPublicKey::from_public_key_pem(&pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(&pem))
        .map_err(|e| {
            Error::Key(format!(
                "Parsing PEM public key `{}` failed: {}",
                path.display(),
                e
            ))
        })
}
