use std::fmt::{self, Display};
use std::fs;
use std::io::Write as _;
use std::path::Path;
use std::str::FromStr;

use log::debug;

use tempfile::NamedTempFile;

use crate::{Error, Scratch};

/// A signature file: image digest, timestamp and optional RSA-2048 signature
///
/// Serialized as UTF-8 text, one field per line:
/// ```text
/// <64 lowercase hex chars>
/// ts: <unix-seconds>
/// rsa2048: <hex signature>
/// ```
/// The `rsa2048:` line is only present for signed images.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureRecord {
    /// SHA-256 of the image bytes
    digest: [u8; 32],
    /// Informational update timestamp, never verified
    timestamp: u64,
    /// Hex-encoded signature, kept verbatim
    signature: Option<String>,
}

impl SignatureRecord {
    const TIMESTAMP_LABEL: &'static str = "ts:";
    const SIGNATURE_LABEL: &'static str = "rsa2048:";

    /// Create a new signature record
    ///
    /// # Arguments
    /// * `digest` - SHA-256 of the image
    /// * `timestamp` - Unix timestamp in seconds
    /// * `signature` - Optional hex-encoded RSA-2048 signature of the image
    pub fn new(digest: [u8; 32], timestamp: u64, signature: Option<String>) -> Self {
        Self {
            digest,
            timestamp,
            signature,
        }
    }

    /// SHA-256 of the image
    pub fn digest(&self) -> &[u8; 32] {
        &self.digest
    }

    /// Timestamp of the record
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Hex-encoded signature, if the image was signed
    pub fn signature(&self) -> Option<&str> {
        self.signature.as_deref()
    }

    /// Decode the signature field into raw signature bytes
    pub fn signature_bytes(&self) -> Result<Vec<u8>, Error> {
        let signature = self.signature().ok_or(Error::MissingSignature)?;

        Ok(hex::decode(signature)?)
    }

    /// Load a signature record from a file
    pub fn load(path: &Path) -> Result<Self, Error> {
        fs::read_to_string(path)?.parse()
    }

    /// Save the signature record to a file
    ///
    /// The record is written to a temporary file in the same directory and renamed
    /// over `path`, so readers never observe a truncated record.
    ///
    /// # Arguments
    /// * `path` - Destination of the record
    /// * `scratch` - Handle tracking the staging file while it exists, so that an
    ///   interrupt can delete it
    pub fn save(&self, path: &Path, scratch: &Scratch) -> Result<(), Error> {
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };

        let file = tempfile::Builder::new()
            .prefix(".imgsig")
            .tempfile_in(dir)?;

        scratch.stage(Some(file.path()));

        let result = self.persist(file, path);

        scratch.stage(None);

        result?;

        debug!("Signature record saved to `{}`", path.display());

        Ok(())
    }

    fn persist(&self, mut file: NamedTempFile, path: &Path) -> Result<(), Error> {
        write!(file, "{}", self)?;
        file.as_file().sync_all()?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;

            file.as_file()
                .set_permissions(fs::Permissions::from_mode(0o644))?;
        }

        file.persist(path).map_err(|e| Error::Io(e.error))?;

        Ok(())
    }
}

impl Display for SignatureRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "{}", hex::encode(self.digest))?;
        writeln!(f, "{} {}", Self::TIMESTAMP_LABEL, self.timestamp)?;

        if let Some(signature) = &self.signature {
            writeln!(f, "{} {}", Self::SIGNATURE_LABEL, signature)?;
        }

        Ok(())
    }
}

impl FromStr for SignatureRecord {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut lines = s.lines();

        let first = lines
            .next()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .ok_or_else(|| Error::InvalidRecord("missing digest line".into()))?;

        let mut digest = [0; 32];
        hex::decode_to_slice(first, &mut digest)
            .map_err(|_| Error::InvalidRecord(format!("malformed digest line `{}`", first)))?;

        let mut timestamp = None;
        let mut signature = None;

        for line in lines {
            if let Some(ts) = line.strip_prefix(Self::TIMESTAMP_LABEL) {
                let ts = ts.trim();

                timestamp = Some(ts.parse::<u64>().map_err(|_| {
                    Error::InvalidRecord(format!("malformed timestamp `{}`", ts))
                })?);
            } else if let Some(sig) = line.strip_prefix(Self::SIGNATURE_LABEL) {
                signature = Some(sig.trim().to_owned());
            } else if !line.trim().is_empty() {
                debug!("Ignoring unknown signature file line `{}`", line);
            }
        }

        let timestamp =
            timestamp.ok_or_else(|| Error::InvalidRecord("missing `ts:` field".into()))?;

        Ok(Self::new(digest, timestamp, signature))
    }
}
