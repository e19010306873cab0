//! OpenSSH `ssh-ed25519-cert-v01@openssh.com` user certificates.

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, TimeZone, Utc};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};

use super::{decode_public_key, public_key_blob, KeyPair, SshReader, SshWriter, ED25519_KEY_TYPE};
use crate::{VirshboxError, VirshboxResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The certificate key type written in front of the encoded certificate.
pub const ED25519_CERT_TYPE: &str = "ssh-ed25519-cert-v01@openssh.com";

/// The certificate type of user certificates.
pub const USER_CERT: u32 = 1;

/// The extensions `ssh-keygen` grants user certificates by default, sorted by name.
pub const DEFAULT_EXTENSIONS: [&str; 5] = [
    "permit-X11-forwarding",
    "permit-agent-forwarding",
    "permit-port-forwarding",
    "permit-pty",
    "permit-user-rc",
];

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The fields of an OpenSSH user certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshCertificate {
    /// Random bytes that make the signed body unique.
    pub nonce: Vec<u8>,

    /// The certified public key.
    pub public_key: VerifyingKey,

    /// The CA-chosen serial number.
    pub serial: u64,

    /// The identity logged by sshd when the certificate is used.
    pub key_id: String,

    /// The usernames the certificate is valid for.
    pub principals: Vec<String>,

    /// Seconds since the epoch from which the certificate is valid.
    pub valid_after: u64,

    /// Seconds since the epoch at which the certificate stops being valid.
    pub valid_before: u64,

    /// Critical options as `(name, value)` pairs, sorted by name.
    pub critical_options: Vec<(String, String)>,

    /// Extension names, sorted.
    pub extensions: Vec<String>,

    /// The CA key that signed the certificate.
    pub signature_key: Option<VerifyingKey>,

    /// The CA's signature over every preceding field.
    pub signature: Option<Signature>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SshCertificate {
    /// Signs the certificate with `ca`, recording the CA's public key.
    pub fn sign(&mut self, ca: &KeyPair) {
        self.signature_key = Some(ca.verifying_key());
        let body = self.signed_body(&ca.verifying_key());
        self.signature = Some(ca.sign(&body));
    }

    /// Checks the signature against the embedded CA key.
    pub fn verify(&self) -> VirshboxResult<()> {
        let (Some(ca), Some(signature)) = (&self.signature_key, &self.signature) else {
            return Err(VirshboxError::InvalidKey("certificate is not signed".to_string()));
        };

        ca.verify(&self.signed_body(ca), signature)
            .map_err(|e| VirshboxError::InvalidKey(format!("bad certificate signature: {e}")))
    }

    /// The certificate in wire format, signature included.
    pub fn to_bytes(&self) -> VirshboxResult<Vec<u8>> {
        let (Some(ca), Some(signature)) = (&self.signature_key, &self.signature) else {
            return Err(VirshboxError::InvalidKey("certificate is not signed".to_string()));
        };

        let mut signature_blob = SshWriter::new();
        signature_blob
            .put_string(ED25519_KEY_TYPE)
            .put_string(signature.to_bytes());

        let mut writer = SshWriter::new();
        writer
            .put_raw(&self.signed_body(ca))
            .put_string(signature_blob.as_bytes());
        Ok(writer.into_bytes())
    }

    /// Renders the `ssh-ed25519-cert-v01@openssh.com <base64> <comment>` line sshd reads.
    pub fn to_line(&self, comment: &str) -> VirshboxResult<String> {
        let encoded = STANDARD.encode(self.to_bytes()?);
        if comment.is_empty() {
            Ok(format!("{ED25519_CERT_TYPE} {encoded}"))
        } else {
            Ok(format!("{ED25519_CERT_TYPE} {encoded} {comment}"))
        }
    }

    /// Parses a certificate line.
    pub fn parse(line: &str) -> VirshboxResult<Self> {
        let mut fields = line.split_whitespace();
        if fields.next() != Some(ED25519_CERT_TYPE) {
            return Err(VirshboxError::InvalidKey(format!(
                "expected a {ED25519_CERT_TYPE} line"
            )));
        }

        let encoded = fields
            .next()
            .ok_or_else(|| VirshboxError::InvalidKey("certificate has no data".to_string()))?;
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| VirshboxError::InvalidKey(format!("certificate is not base64: {e}")))?;

        Self::from_bytes(&bytes)
    }

    /// Decodes a certificate from wire format.
    pub fn from_bytes(bytes: &[u8]) -> VirshboxResult<Self> {
        let mut reader = SshReader::new(bytes);
        if reader.read_str()? != ED25519_CERT_TYPE {
            return Err(VirshboxError::InvalidKey(
                "unsupported certificate type".to_string(),
            ));
        }

        let nonce = reader.read_string()?.to_vec();
        let public_key: [u8; 32] = reader
            .read_string()?
            .try_into()
            .map_err(|_| VirshboxError::InvalidKey("certified key must be 32 bytes".to_string()))?;
        let public_key = VerifyingKey::from_bytes(&public_key)
            .map_err(|e| VirshboxError::InvalidKey(e.to_string()))?;
        let serial = reader.read_u64()?;

        if reader.read_u32()? != USER_CERT {
            return Err(VirshboxError::InvalidKey(
                "only user certificates are supported".to_string(),
            ));
        }

        let key_id = reader.read_str()?.to_string();

        let mut principals = Vec::new();
        let mut inner = SshReader::new(reader.read_string()?);
        while !inner.is_empty() {
            principals.push(inner.read_str()?.to_string());
        }

        let valid_after = reader.read_u64()?;
        let valid_before = reader.read_u64()?;

        let mut critical_options = Vec::new();
        let mut inner = SshReader::new(reader.read_string()?);
        while !inner.is_empty() {
            let name = inner.read_str()?.to_string();
            let value = SshReader::new(inner.read_string()?).read_str()?.to_string();
            critical_options.push((name, value));
        }

        let mut extensions = Vec::new();
        let mut inner = SshReader::new(reader.read_string()?);
        while !inner.is_empty() {
            extensions.push(inner.read_str()?.to_string());
            inner.read_string()?;
        }

        let _reserved = reader.read_string()?;
        let signature_key = decode_public_key(&mut SshReader::new(reader.read_string()?))?;

        let mut signature_blob = SshReader::new(reader.read_string()?);
        if signature_blob.read_str()? != ED25519_KEY_TYPE {
            return Err(VirshboxError::InvalidKey(
                "unsupported signature algorithm".to_string(),
            ));
        }
        let signature = Signature::from_slice(signature_blob.read_string()?)
            .map_err(|e| VirshboxError::InvalidKey(e.to_string()))?;

        Ok(Self {
            nonce,
            public_key,
            serial,
            key_id,
            principals,
            valid_after,
            valid_before,
            critical_options,
            extensions,
            signature_key: Some(signature_key),
            signature: Some(signature),
        })
    }

    /// `valid_after` as a timestamp.
    pub fn valid_after_time(&self) -> DateTime<Utc> {
        epoch_to_time(self.valid_after)
    }

    /// `valid_before` as a timestamp.
    pub fn valid_before_time(&self) -> DateTime<Utc> {
        epoch_to_time(self.valid_before)
    }

    fn signed_body(&self, ca: &VerifyingKey) -> Vec<u8> {
        let mut principals = SshWriter::new();
        for principal in &self.principals {
            principals.put_string(principal);
        }

        let mut options = SshWriter::new();
        for (name, value) in &self.critical_options {
            let mut inner = SshWriter::new();
            inner.put_string(value);
            options.put_string(name).put_string(inner.as_bytes());
        }

        let mut extensions = SshWriter::new();
        for name in &self.extensions {
            extensions.put_string(name).put_string(b"");
        }

        let mut writer = SshWriter::new();
        writer
            .put_string(ED25519_CERT_TYPE)
            .put_string(&self.nonce)
            .put_string(self.public_key.as_bytes())
            .put_u64(self.serial)
            .put_u32(USER_CERT)
            .put_string(&self.key_id)
            .put_string(principals.as_bytes())
            .put_u64(self.valid_after)
            .put_u64(self.valid_before)
            .put_string(options.as_bytes())
            .put_string(extensions.as_bytes())
            .put_string(b"")
            .put_string(public_key_blob(ca));
        writer.into_bytes()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn epoch_to_time(secs: u64) -> DateTime<Utc> {
    let secs = i64::try_from(secs).unwrap_or(i64::MAX);
    Utc.timestamp_opt(secs, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
