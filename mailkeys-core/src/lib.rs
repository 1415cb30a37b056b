use std::fmt;

use thiserror::Error;

/// Sanitizes untrusted text for display in a terminal.
///
/// User IDs and certificate subjects are attacker-controlled and may contain
/// control characters or ANSI escape sequences. Control bytes are escaped so
/// diagnostic output cannot be used to manipulate the terminal.
pub fn sanitize_for_terminal(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '\n' | '\r' | '\t' => out.push(' '),
            c if c.is_control() => {
                let code = c as u32;
                if code <= 0xFF {
                    out.push_str(&format!("\\x{code:02X}"));
                } else {
                    out.push_str(&format!("\\u{{{code:X}}}"));
                }
            }
            c => out.push(c),
        }
    }
    out
}

/// The cryptographic ecosystem a key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyFamily {
    OpenPgp,
    X509,
}

impl KeyFamily {
    pub fn as_str(self) -> &'static str {
        match self {
            KeyFamily::OpenPgp => "openpgp",
            KeyFamily::X509 => "x509",
        }
    }
}

impl fmt::Display for KeyFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Algorithm preset used when generating a new OpenPGP key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyPreset {
    #[default]
    Curve25519,
    Rsa2048,
    Rsa4096,
}

impl KeyPreset {
    pub fn as_str(self) -> &'static str {
        match self {
            KeyPreset::Curve25519 => "curve25519",
            KeyPreset::Rsa2048 => "rsa2048",
            KeyPreset::Rsa4096 => "rsa4096",
        }
    }
}

impl std::str::FromStr for KeyPreset {
    type Err = MailkeysError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "curve25519" | "cv25519" | "ecc" => Ok(KeyPreset::Curve25519),
            "rsa2048" | "rsa2k" => Ok(KeyPreset::Rsa2048),
            "rsa4096" | "rsa4k" => Ok(KeyPreset::Rsa4096),
            other => Err(MailkeysError::InvalidInput(format!(
                "unknown key preset: {other}"
            ))),
        }
    }
}

/// Public-key algorithm of the primary key (OpenPGP) or certificate key (X.509).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyAlgo {
    pub algorithm: String,
    pub bits: Option<usize>,
    pub curve: Option<String>,
}

impl fmt::Display for KeyAlgo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.algorithm)?;
        if let Some(bits) = self.bits {
            write!(f, " {bits}")?;
        }
        if let Some(curve) = &self.curve {
            write!(f, " ({curve})")?;
        }
        Ok(())
    }
}

/// A user identity bound to a key.
///
/// OpenPGP self-certifications may be revoked or fail to verify; such
/// identities are kept and flagged rather than dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub email: Option<String>,
    pub primary: bool,
    pub valid: bool,
    pub revoked: bool,
}

/// Outcome of checking a signature against a set of candidate keys.
///
/// `matched` is `Some(true)` for a cryptographically valid signature made by one
/// of the supplied keys, `Some(false)` when the signer's key was supplied but
/// the signature does not verify, and `None` when no supplied key corresponds
/// to the signer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VerifyResult {
    pub matched: Option<bool>,
    pub signer_longids: Vec<String>,
    pub signer_fingerprint: Option<String>,
    pub error: Option<String>,
    pub is_err_fatal: bool,
}

impl VerifyResult {
    pub fn fatal(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            is_err_fatal: true,
            ..Self::default()
        }
    }
}

/// Classification of a failed message decryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecryptErrorKind {
    KeyMismatch,
    UsePassword,
    WrongPassword,
    NeedPassphrase,
    NoMdc,
    BadMdc,
    Format,
    Other,
}

impl DecryptErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DecryptErrorKind::KeyMismatch => "key_mismatch",
            DecryptErrorKind::UsePassword => "use_password",
            DecryptErrorKind::WrongPassword => "wrong_password",
            DecryptErrorKind::NeedPassphrase => "need_passphrase",
            DecryptErrorKind::NoMdc => "no_mdc",
            DecryptErrorKind::BadMdc => "bad_mdc",
            DecryptErrorKind::Format => "format",
            DecryptErrorKind::Other => "other",
        }
    }
}

impl fmt::Display for DecryptErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key ids involved in a decryption attempt, reported back to the caller so a
/// UI can tell the user which key (or passphrase) is missing.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DecryptLongids {
    /// Key ids the message is encrypted for.
    pub message: Vec<String>,
    /// Supplied private key ids that appear in `message`.
    pub matching: Vec<String>,
    /// Key ids that were actually attempted.
    pub chosen: Vec<String>,
    /// Matching keys that could not be used without a passphrase.
    pub need_passphrase: Vec<String>,
}

/// Supplies passphrases for locked private keys.
///
/// Returning `None` means the passphrase is not known; the engine then reports
/// the key under `need_passphrase` instead of failing.
pub trait PassphraseProvider {
    fn passphrase_for(&self, key_id: &str) -> Option<String>;
}

impl PassphraseProvider for std::collections::HashMap<String, String> {
    fn passphrase_for(&self, key_id: &str) -> Option<String> {
        self.get(key_id).cloned()
    }
}

#[derive(Debug, Error)]
pub enum MailkeysError {
    #[error("malformed armor: {0}")]
    MalformedArmor(String),
    #[error("unknown key family: {0}")]
    UnknownKeyFamily(String),
    #[error("found {0} keys where exactly one was expected")]
    TooManyKeys(usize),
    #[error("certificate does not match the private key")]
    CertificateKeyMismatch,
    #[error("certificate has no usable email address: {0}")]
    InvalidRecipientEmail(String),
    #[error("invalid fingerprint format: {0}")]
    InvalidFingerprintFormat(String),
    #[error("key {0} has no private material")]
    NotPrivate(String),
    #[error("key {0} is locked; decrypt it with its passphrase first")]
    KeyLocked(String),
    #[error("key {0} is revoked and cannot be used for signing or encryption")]
    RevokedKeySigningOrEncrypting(String),
    #[error("no decryption key packets found")]
    NoDecryptionKeyPacketsFound,
    #[error("incorrect passphrase")]
    IncorrectPassphrase,
    #[error(
        "security: message is not integrity protected (missing MDC) and was not decrypted"
    )]
    NoMdcIntegrityProtection,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("backend error: {0}")]
    Backend(String),
    #[error("io error: {0}")]
    Io(String),
}

impl MailkeysError {
    pub fn backend(context: &str, err: impl fmt::Display) -> Self {
        MailkeysError::Backend(format!("{context}: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, MailkeysError>;
