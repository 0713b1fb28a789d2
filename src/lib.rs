//! Utilities for generating and verifying sidecar signature files for binary images
//!
//! A signature file is a short text record stored next to an image (an EEPROM blob,
//! a boot image) which carries:
//! - the SHA-256 digest of the image, as lowercase hex on the first line;
//! - the update timestamp, as `ts: <unix-seconds>`;
//! - optionally an RSA-2048 PKCS#1 v1.5 / SHA-256 signature of the image bytes,
//!   as `rsa2048: <hex>`.
//!
//! The digest lets firmware-update tooling detect file-system corruption, while the
//! signature can act as one link of a secure-boot verification chain.
//!
//! Signing is done either in-process with a PEM private key, through a PKCS#11 engine of
//! the crypto backend (`openssl` by default) for hardware-resident keys, or by delegating
//! to an external HSM wrapper executable.

use std::ffi::OsStr;
use std::fmt::{self, Display};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};

use self::rsa::{Pkcs1v15Sign, RsaPublicKey};

use sha2::{Digest, Sha256};

pub use key::{KeyRef, Pkcs11Uri};
pub use record::SignatureRecord;
pub use scratch::Scratch;
pub use signer::{HsmSigner, KeySigner, Pkcs11Signer, Signer};

mod key;
mod record;
mod scratch;
mod signer;

/// The RSA crate is re-exported for user convenience
/// so that users of the lib do not have to explicitly depend on it
pub mod rsa {
    pub use ::rsa::*;
}

/// Size of an RSA-2048 signature in bytes
pub const SIGNATURE_LEN: usize = 256;

/// Algorithm identifier passed to HSM wrappers
pub const ALGORITHM: &str = "rsa2048-sha256";

/// Default crypto backend used for PKCS#11 signing
pub const DEFAULT_BACKEND: &str = "openssl";

/// Size of the buffer used when streaming an image through the hasher
const BUF_SIZE: usize = 65536;

/// Errors that can occur while generating or verifying a signature file
#[derive(Debug)]
pub enum Error {
    /// IO error
    Io(io::Error),
    /// A required external executable could not be found
    MissingDependency(String),
    /// A required option was not supplied
    MissingArgument(&'static str),
    /// Image path does not exist or is not a regular file
    InvalidImage(PathBuf),
    /// Key reference is neither an existing file nor a well-formed PKCS#11 URI
    InvalidKeyRef(String),
    /// Key could not be loaded or parsed
    Key(String),
    /// Key is not an RSA-2048 key (size in bits)
    UnsupportedKeySize(usize),
    /// Signature file has no `rsa2048:` field
    MissingSignature,
    /// Signature file is malformed
    InvalidRecord(String),
    /// Signature field is not valid hex
    InvalidHex(hex::FromHexError),
    /// Signing failed (in-process signer, PKCS#11 backend or HSM wrapper)
    Signer(String),
    /// RSA signature does not match the image
    InvalidSignature,
    /// Requested combination of options is not supported
    Unsupported(&'static str),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<hex::FromHexError> for Error {
    fn from(e: hex::FromHexError) -> Self {
        Self::InvalidHex(e)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "IO error: {}", e),
            Self::MissingDependency(name) => write!(f, "Required executable `{}` not found", name),
            Self::MissingArgument(what) => write!(f, "Missing {}", what),
            Self::InvalidImage(path) => {
                write!(f, "Image `{}` does not exist or is not a file", path.display())
            }
            Self::InvalidKeyRef(key) => write!(
                f,
                "Key `{}` is neither an existing file nor a PKCS#11 URI",
                key
            ),
            Self::Key(msg) => write!(f, "Invalid key: {}", msg),
            Self::UnsupportedKeySize(bits) => {
                write!(f, "Unsupported key size {} bits, expected 2048", bits)
            }
            Self::MissingSignature => write!(f, "Signature file has no `rsa2048:` field"),
            Self::InvalidRecord(msg) => write!(f, "Invalid signature file: {}", msg),
            Self::InvalidHex(e) => write!(f, "Invalid hex signature: {}", e),
            Self::Signer(msg) => write!(f, "Signing failed: {}", msg),
            Self::InvalidSignature => write!(f, "Invalid signature"),
            Self::Unsupported(msg) => write!(f, "Unsupported: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::InvalidHex(e) => Some(e),
            _ => None,
        }
    }
}

/// Compute the SHA-256 digest of an image
///
/// # Arguments
/// * `buf` - Buffer to use for reading the image
/// * `image` - Image to hash
pub fn digest<R>(buf: &mut [u8], mut image: R) -> Result<[u8; 32], Error>
where
    R: Read,
{
    let mut hasher = Sha256::new();
    let mut size: usize = 0;

    loop {
        let read = match image.read(buf) {
            Ok(read) => read,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };

        if read == 0 {
            break;
        }

        hasher.update(&buf[..read]);
        size += read;
    }

    debug!("Hashed {size}B");

    let mut digest = [0; 32];
    digest.copy_from_slice(hasher.finalize().as_ref());

    Ok(digest)
}

/// Open an image, making sure it is a regular file
fn open_image(path: &Path) -> Result<File, Error> {
    match fs::metadata(path) {
        Ok(meta) if meta.is_file() => Ok(File::open(path)?),
        _ => Err(Error::InvalidImage(path.to_path_buf())),
    }
}

/// Stream an image from disk through the hasher
fn digest_file(path: &Path) -> Result<[u8; 32], Error> {
    let mut buf = vec![0; BUF_SIZE];

    digest(&mut buf, open_image(path)?)
}

/// Resolve an executable either by path or by searching `PATH`
fn find_executable(name: &OsStr) -> Result<PathBuf, Error> {
    which::which(name).map_err(|_| Error::MissingDependency(name.to_string_lossy().into_owned()))
}

/// How (and whether) the image gets signed during generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signing {
    /// Digest only, no signature line
    None,
    /// Delegate to an external HSM wrapper executable
    Hsm(PathBuf),
    /// Sign in-process with a PEM private key
    Key(PathBuf),
    /// Sign with a hardware-resident key through the PKCS#11 engine of the crypto backend
    Pkcs11 {
        /// Resolved crypto backend executable
        backend: PathBuf,
        /// Key identifier
        uri: Pkcs11Uri,
    },
}

impl Signing {
    /// Pick the signing method from the supplied key reference and HSM wrapper
    ///
    /// The HSM wrapper takes precedence over the key. External executables are resolved
    /// eagerly so that a missing dependency is reported before any work is done.
    ///
    /// # Arguments
    /// * `key` - Optional key reference (PEM file path or PKCS#11 URI)
    /// * `hsm_wrapper` - Optional HSM wrapper executable
    /// * `backend` - Crypto backend executable used for PKCS#11 keys
    pub fn select(
        key: Option<&str>,
        hsm_wrapper: Option<&Path>,
        backend: &OsStr,
    ) -> Result<Self, Error> {
        if let Some(wrapper) = hsm_wrapper {
            if key.is_some() {
                warn!("Both a key and an HSM wrapper were supplied, using the HSM wrapper");
            }

            return Ok(Self::Hsm(find_executable(wrapper.as_os_str())?));
        }

        let signing = match key.map(KeyRef::parse).transpose()? {
            None => Self::None,
            Some(KeyRef::File(path)) => Self::Key(path),
            Some(KeyRef::Pkcs11(uri)) => Self::Pkcs11 {
                backend: find_executable(backend)?,
                uri,
            },
        };

        Ok(signing)
    }
}

/// Generate a fresh signature file for an image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generate {
    /// Image to hash and optionally sign
    pub image: PathBuf,
    /// Signature file to create or overwrite
    pub output: PathBuf,
    /// Signing method
    pub signing: Signing,
    /// Timestamp (unix seconds) written to the `ts:` line
    pub timestamp: u64,
}

impl Generate {
    /// Hash (and optionally sign) the image and save the signature file
    ///
    /// The output file is only replaced once the whole record is available,
    /// so a failure never leaves a partial signature file behind.
    /// The scratch directory is removed before returning, whatever the outcome.
    ///
    /// # Arguments
    /// * `scratch` - Scratch directory for intermediate signature material, also
    ///   tracking the output staging file while the record is saved
    pub fn run(&self, scratch: &Scratch) -> Result<SignatureRecord, Error> {
        let result = self.create(scratch);

        scratch.remove();

        let record = result?;

        record.save(&self.output, scratch)?;

        Ok(record)
    }

    /// Create the signature record for the image without saving it
    pub fn create(&self, scratch: &Scratch) -> Result<SignatureRecord, Error> {
        // Load the key before hashing so that key errors surface early
        let signer: Option<Box<dyn Signer + '_>> = match &self.signing {
            Signing::None => None,
            Signing::Hsm(wrapper) => Some(Box::new(HsmSigner::new(wrapper))),
            Signing::Key(path) => Some(Box::new(KeySigner::load(path)?)),
            Signing::Pkcs11 { backend, uri } => {
                Some(Box::new(Pkcs11Signer::new(backend, uri, scratch)))
            }
        };

        info!("Hashing image `{}`...", self.image.display());

        let digest = digest_file(&self.image)?;

        let signature = signer
            .map(|signer| {
                info!("Signing image `{}`...", self.image.display());

                signer.sign(&self.image, &digest)
            })
            .transpose()?;

        Ok(SignatureRecord::new(digest, self.timestamp, signature))
    }
}

/// Verify an image against the RSA signature of an existing signature file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verify {
    /// Image to verify
    pub image: PathBuf,
    /// Signature file carrying the `rsa2048:` field
    pub signature: PathBuf,
    /// PEM public key
    pub public_key: PathBuf,
}

impl Verify {
    /// Verify the image
    ///
    /// Only the RSA signature decides the outcome; a stale digest line is reported
    /// as a warning.
    pub fn run(&self) -> Result<(), Error> {
        let record = SignatureRecord::load(&self.signature)?;
        let signature = record.signature_bytes()?;

        let pub_key = key::load_public_key(&self.public_key)?;

        debug!("Verifying image `{}`...", self.image.display());

        let digest = digest_file(&self.image)?;

        if digest != *record.digest() {
            warn!(
                "Digest in `{}` does not match image `{}`",
                self.signature.display(),
                self.image.display()
            );
        }

        Self::verify_digest(&pub_key, &digest, &signature)
    }

    /// Verify a SHA-256 image digest against a raw RSA PKCS#1 v1.5 signature
    ///
    /// # Arguments
    /// * `pub_key` - Public key to verify with
    /// * `digest` - SHA-256 digest of the image bytes
    /// * `signature` - Raw signature bytes
    pub fn verify_digest(
        pub_key: &RsaPublicKey,
        digest: &[u8; 32],
        signature: &[u8],
    ) -> Result<(), Error> {
        pub_key
            .verify(Pkcs1v15Sign::new::<Sha256>(), digest, signature)
            .map_err(|_| Error::InvalidSignature)
    }
}

/// The single operation performed by one invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Generate a signature file
    Generate(Generate),
    /// Verify an image against a signature file
    Verify(Verify),
}

/// Raw options as supplied by the user, before validation
///
/// With the `clap` feature these double as the command-line arguments.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "clap", derive(clap::Args))]
pub struct Options {
    /// The image to hash, sign or verify
    #[cfg_attr(feature = "clap", arg(short = 'i', long))]
    pub image: PathBuf,

    /// Signature file output (not needed when verifying)
    #[cfg_attr(feature = "clap", arg(short = 'o', long, required_unless_present = "verify"))]
    pub output: Option<PathBuf>,

    /// Private key PEM file or PKCS#11 URI for signing, public key PEM file for verifying
    #[cfg_attr(feature = "clap", arg(short = 'k', long))]
    pub key: Option<String>,

    /// HSM wrapper to sign with, invoked as `<wrapper> -a rsa2048-sha256 <image>` (takes precedence over the key)
    #[cfg_attr(feature = "clap", arg(short = 'H', long))]
    pub hsm_wrapper: Option<PathBuf>,

    /// Verify the image against this existing signature file (requires a public key)
    #[cfg_attr(feature = "clap", arg(short = 'v', long, value_name = "SIGNATURE"))]
    pub verify: Option<PathBuf>,

    /// Timestamp (unix seconds) for reproducible builds (defaults to the current time)
    #[cfg_attr(feature = "clap", arg(long, env = "SOURCE_DATE_EPOCH"))]
    pub timestamp: Option<u64>,

    /// Crypto backend used for signing with PKCS#11 keys
    #[cfg_attr(feature = "clap", arg(long, env = "OPENSSL", default_value = DEFAULT_BACKEND))]
    pub backend: String,
}

impl Options {
    /// Validate the options and turn them into the operation to perform
    pub fn into_operation(self) -> Result<Operation, Error> {
        if let Some(signature) = self.verify {
            if self.hsm_wrapper.is_some() {
                Err(Error::Unsupported("an HSM wrapper cannot be used for verification"))?;
            }

            let key = self
                .key
                .ok_or(Error::MissingArgument("public key (-k) for verification"))?;

            let public_key = match KeyRef::parse(&key)? {
                KeyRef::File(path) => path,
                KeyRef::Pkcs11(_) => Err(Error::Unsupported(
                    "PKCS#11 keys cannot be used for verification",
                ))?,
            };

            if self.output.is_some() {
                debug!("Ignoring output path when verifying");
            }

            open_image(&self.image)?;

            Ok(Operation::Verify(Verify {
                image: self.image,
                signature,
                public_key,
            }))
        } else {
            let output = self
                .output
                .ok_or(Error::MissingArgument("output signature file (-o)"))?;

            let signing = Signing::select(
                self.key.as_deref(),
                self.hsm_wrapper.as_deref(),
                OsStr::new(&self.backend),
            )?;

            open_image(&self.image)?;

            let timestamp = self.timestamp.unwrap_or_else(|| {
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or_default()
            });

            Ok(Operation::Generate(Generate {
                image: self.image,
                output,
                signing,
                timestamp,
            }))
        }
    }
}
