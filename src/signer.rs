use std::fs;
use std::path::Path;
use std::process::{Command, Stdio};

use log::{debug, info};

use rsa::{Pkcs1v15Sign, RsaPrivateKey};

use sha2::Sha256;

use crate::{key, Error, Pkcs11Uri, Scratch, ALGORITHM, SIGNATURE_LEN};

/// Something that can produce an RSA-2048 / SHA-256 signature of an image
pub trait Signer {
    /// Sign an image, returning the hex-encoded signature
    ///
    /// # Arguments
    /// * `image` - Path of the image to sign
    /// * `digest` - SHA-256 digest of the image bytes
    fn sign(&self, image: &Path, digest: &[u8; 32]) -> Result<String, Error>;
}

/// In-process signer using a PEM private key
pub struct KeySigner {
    key: RsaPrivateKey,
}

impl KeySigner {
    /// Create a signer from an already loaded RSA-2048 private key
    pub fn new(key: RsaPrivateKey) -> Self {
        Self { key }
    }

    /// Load the private key from a PEM file
    pub fn load(path: &Path) -> Result<Self, Error> {
        Ok(Self::new(key::load_private_key(path)?))
    }
}

impl Signer for KeySigner {
    fn sign(&self, _image: &Path, digest: &[u8; 32]) -> Result<String, Error> {
        // PKCS#1 v1.5 over the image digest is the same as signing the image bytes
        let signature = self
            .key
            .sign(Pkcs1v15Sign::new::<Sha256>(), digest)
            .map_err(|e| Error::Signer(e.to_string()))?;

        Ok(hex::encode(signature))
    }
}

/// Signer delegating to an external HSM wrapper
///
/// The wrapper is invoked as `<wrapper> -a rsa2048-sha256 <image>` and must print the
/// hex-encoded signature to stdout and exit with status 0.
pub struct HsmSigner<'a> {
    wrapper: &'a Path,
}

impl<'a> HsmSigner<'a> {
    /// Create a signer for the given HSM wrapper executable
    pub fn new(wrapper: &'a Path) -> Self {
        Self { wrapper }
    }
}

impl Signer for HsmSigner<'_> {
    fn sign(&self, image: &Path, _digest: &[u8; 32]) -> Result<String, Error> {
        info!("Signing with HSM wrapper `{}`...", self.wrapper.display());

        let output = Command::new(self.wrapper)
            .arg("-a")
            .arg(ALGORITHM)
            .arg(image)
            .stdin(Stdio::null())
            .stderr(Stdio::inherit())
            .output()
            .map_err(|e| {
                Error::Signer(format!(
                    "Running HSM wrapper `{}` failed: {}",
                    self.wrapper.display(),
                    e
                ))
            })?;

        if !output.status.success() {
            Err(Error::Signer(format!(
                "HSM wrapper `{}` failed: {}",
                self.wrapper.display(),
                output.status
            )))?;
        }

        let signature = String::from_utf8(output.stdout).map_err(|_| {
            Error::Signer(format!(
                "HSM wrapper `{}` printed a non-UTF-8 signature",
                self.wrapper.display()
            ))
        })?;

        let signature = signature.trim_end();

        if signature.is_empty() {
            Err(Error::Signer(format!(
                "HSM wrapper `{}` printed no signature",
                self.wrapper.display()
            )))?;
        }

        // The signature must fit on the single `rsa2048:` line
        if signature.contains(char::is_whitespace) {
            Err(Error::Signer(format!(
                "HSM wrapper `{}` printed a signature spanning several words or lines",
                self.wrapper.display()
            )))?;
        }

        debug!("HSM wrapper returned a {}-char signature", signature.len());

        Ok(signature.to_owned())
    }
}

/// Signer using a hardware-resident key through the PKCS#11 engine of the crypto backend
///
/// The backend is invoked as
/// `<backend> dgst -sha256 -engine pkcs11 -keyform engine -sign <uri> -out <scratch>/image.sig <image>`
/// and the raw signature is read back from the scratch directory.
pub struct Pkcs11Signer<'a> {
    backend: &'a Path,
    uri: &'a Pkcs11Uri,
    scratch: &'a Scratch,
}

impl<'a> Pkcs11Signer<'a> {
    /// Create a signer for a PKCS#11 key
    ///
    /// # Arguments
    /// * `backend` - Crypto backend executable
    /// * `uri` - Key identifier
    /// * `scratch` - Scratch directory for the raw signature
    pub fn new(backend: &'a Path, uri: &'a Pkcs11Uri, scratch: &'a Scratch) -> Self {
        Self {
            backend,
            uri,
            scratch,
        }
    }
}

impl Signer for Pkcs11Signer<'_> {
    fn sign(&self, image: &Path, _digest: &[u8; 32]) -> Result<String, Error> {
        info!("Signing with PKCS#11 key `{}`...", self.uri);

        let out = self.scratch.path()?.join("image.sig");

        let status = Command::new(self.backend)
            .args(["dgst", "-sha256", "-engine", "pkcs11", "-keyform", "engine"])
            .arg("-sign")
            .arg(self.uri.as_str())
            .arg("-out")
            .arg(&out)
            .arg(image)
            .stdin(Stdio::null())
            .status()
            .map_err(|e| {
                Error::Signer(format!(
                    "Running `{}` failed: {}",
                    self.backend.display(),
                    e
                ))
            })?;

        if !status.success() {
            Err(Error::Signer(format!(
                "`{}` failed to sign with `{}`: {}",
                self.backend.display(),
                self.uri,
                status
            )))?;
        }

        let signature = fs::read(&out)?;

        if signature.len() != SIGNATURE_LEN {
            Err(Error::Signer(format!(
                "Expected a {}B signature, got {}B",
                SIGNATURE_LEN,
                signature.len()
            )))?;
        }

        Ok(hex::encode(signature))
    }
}
