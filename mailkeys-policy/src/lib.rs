use std::time::SystemTime;

use openpgp::cert::prelude::*;
use openpgp::packet::key::{KeyParts, KeyRole};
use openpgp::packet::{Key, SEIP, Tag};
use openpgp::parse::Parse;
use openpgp::policy::Policy;
use openpgp::types::{PublicKeyAlgorithm, RevocationStatus};
use openpgp::{Cert, KeyHandle, KeyID, Packet, PacketPile};
use sequoia_openpgp as openpgp;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("policy parse error: {0}")]
    Parse(String),
    #[error("policy violation: {0}")]
    Violation(String),
}

/// Smallest RSA/DSA/ElGamal modulus accepted for any operation.
pub const MIN_RSA_BITS: usize = 2048;

/// Whether an algorithm/size combination is too weak to ever be used.
///
/// This is judged independently of time: a weak key is neither usable nor
/// "usable but expired".
#[allow(deprecated)]
pub fn is_weak_algo(algo: PublicKeyAlgorithm, bits: Option<usize>) -> bool {
    use PublicKeyAlgorithm::*;
    match algo {
        RSAEncryptSign | RSAEncrypt | RSASign | DSA | ElGamalEncrypt | ElGamalEncryptSign => {
            bits.is_none_or(|b| b < MIN_RSA_BITS)
        }
        _ => false,
    }
}

pub fn key_is_weak<P: KeyParts, R: KeyRole>(key: &Key<P, R>) -> bool {
    is_weak_algo(key.pk_algo(), key.mpis().bits())
}

/// The operation a (sub)key must be flagged for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Encryption,
    Signing,
}

/// Interval during which one capable (sub)key could be used.
///
/// `from` is the later of the subkey and primary creation times; `until` is
/// the earlier of the subkey binding expiration and the primary expiration,
/// `None` meaning it never expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidityWindow {
    pub from: SystemTime,
    pub until: Option<SystemTime>,
}

impl ValidityWindow {
    pub fn new(from: SystemTime, until: Option<SystemTime>) -> Self {
        Self { from, until }
    }

    fn open_at(&self, now: SystemTime) -> bool {
        self.until.is_none_or(|until| until > now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Usability {
    /// Some capable key is valid now. `until` is the expiration of the key as a
    /// whole for this capability (`None` when some window never closes).
    Usable { until: Option<SystemTime> },
    /// Capable keys existed but every window has closed; `at` is the latest
    /// point at which any of them was still valid.
    Expired { at: SystemTime },
    /// No capable, non-revoked, sufficiently strong key exists at all.
    Never,
}

impl Usability {
    pub fn is_usable(&self) -> bool {
        matches!(self, Usability::Usable { .. })
    }

    pub fn is_expired(&self) -> bool {
        matches!(self, Usability::Expired { .. })
    }

    pub fn expiration(&self) -> Option<SystemTime> {
        match self {
            Usability::Usable { until } => *until,
            Usability::Expired { at } => Some(*at),
            Usability::Never => None,
        }
    }
}

/// Collects the validity windows of every key in `cert` flagged for
/// `capability`.
///
/// Revoked subkeys and weak algorithms contribute no window. A weak primary
/// key disqualifies the whole certificate.
pub fn capable_windows(
    cert: &Cert,
    capability: Capability,
    policy: &dyn Policy,
    now: SystemTime,
) -> Vec<ValidityWindow> {
    let Ok(vc) = cert.with_policy(policy, now) else {
        return Vec::new();
    };
    let primary = vc.primary_key();
    if key_is_weak(primary.key()) {
        return Vec::new();
    }
    let primary_created = primary.key().creation_time();
    let primary_until = primary.key_expiration_time();

    let mut windows = Vec::new();
    for ka in vc.keys().supported() {
        if matches!(ka.revocation_status(), RevocationStatus::Revoked(_)) {
            continue;
        }
        let Some(flags) = ka.key_flags() else {
            continue;
        };
        let capable = match capability {
            Capability::Encryption => {
                flags.for_transport_encryption() || flags.for_storage_encryption()
            }
            Capability::Signing => flags.for_signing(),
        };
        if !capable || key_is_weak(ka.key()) {
            continue;
        }
        let from = ka.key().creation_time().max(primary_created);
        let until = earliest(ka.key_expiration_time(), primary_until);
        windows.push(ValidityWindow::new(from, until));
    }
    windows
}

/// Applies the expiration rule to a set of windows.
pub fn usability(windows: &[ValidityWindow], now: SystemTime) -> Usability {
    if windows.is_empty() {
        return Usability::Never;
    }
    if windows.iter().any(|w| w.open_at(now)) {
        return Usability::Usable {
            until: expiration(windows),
        };
    }
    match windows.iter().filter_map(|w| w.until).max() {
        Some(at) => Usability::Expired { at },
        None => Usability::Never,
    }
}

/// Maximum `until` across windows; `None` if any window never closes or there
/// are no windows.
pub fn expiration(windows: &[ValidityWindow]) -> Option<SystemTime> {
    if windows.iter().any(|w| w.until.is_none()) {
        return None;
    }
    windows.iter().filter_map(|w| w.until).max()
}

fn earliest(a: Option<SystemTime>, b: Option<SystemTime>) -> Option<SystemTime> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

/// Integrity protection of the encrypted container of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Integrity {
    #[default]
    NotEncrypted,
    /// SEIPD v1 (Modification Detection Code).
    Mdc,
    /// SEIPD v2 or the AED draft packet.
    Aead,
    /// Legacy symmetrically encrypted data without any integrity protection.
    Missing,
}

/// What can be learnt about a message without decrypting it.
#[derive(Debug, Clone, Default)]
pub struct MessageInfo {
    pub recipients: Vec<KeyHandle>,
    pub wildcard_recipients: usize,
    pub password_packets: usize,
    pub signers: Vec<KeyHandle>,
    pub integrity: Integrity,
}

impl MessageInfo {
    pub fn is_encrypted(&self) -> bool {
        !matches!(self.integrity, Integrity::NotEncrypted)
            || !self.recipients.is_empty()
            || self.wildcard_recipients > 0
            || self.password_packets > 0
    }

    /// Longids of the recipients the message names explicitly.
    pub fn recipient_longids(&self) -> Vec<String> {
        unique_longids(&self.recipients)
    }

    pub fn signer_longids(&self) -> Vec<String> {
        unique_longids(&self.signers)
    }
}

/// Scans the top-level packets of a (possibly armored) message.
pub fn inspect_message(bytes: &[u8]) -> Result<MessageInfo, PolicyError> {
    let pile = PacketPile::from_bytes(bytes)
        .map_err(|err| PolicyError::Parse(format!("parse message failed: {err}")))?;
    let mut info = MessageInfo::default();
    let mut saw_unprotected = false;
    for packet in pile.descendants() {
        match packet {
            Packet::PKESK(pkesk) => match pkesk.recipient() {
                Some(handle) => info.recipients.push(handle),
                None => info.wildcard_recipients += 1,
            },
            Packet::SKESK(_) => info.password_packets += 1,
            Packet::SEIP(SEIP::V2(_)) => info.integrity = Integrity::Aead,
            Packet::SEIP(_) => {
                if info.integrity != Integrity::Aead {
                    info.integrity = Integrity::Mdc;
                }
            }
            Packet::Signature(sig) => {
                for issuer in sig.get_issuers() {
                    if !info.signers.iter().any(|s| s.aliases(&issuer)) {
                        info.signers.push(issuer);
                    }
                }
            }
            other => match other.tag() {
                Tag::SED => saw_unprotected = true,
                Tag::AED => info.integrity = Integrity::Aead,
                _ => {}
            },
        }
    }
    if saw_unprotected {
        info.integrity = Integrity::Missing;
    }
    Ok(info)
}

pub fn ensure_integrity_protected(info: &MessageInfo) -> Result<(), PolicyError> {
    if info.integrity == Integrity::Missing {
        return Err(PolicyError::Violation(
            "encrypted data is not integrity protected (missing MDC)".to_string(),
        ));
    }
    Ok(())
}

/// Issuers named by a detached signature.
///
/// Anything other than signature packets is rejected so a message cannot be
/// passed off as a detached signature.
pub fn signature_issuers(bytes: &[u8]) -> Result<Vec<KeyHandle>, PolicyError> {
    let pile = PacketPile::from_bytes(bytes)
        .map_err(|err| PolicyError::Parse(format!("parse signature failed: {err}")))?;
    let mut sig_count = 0usize;
    let mut issuers: Vec<KeyHandle> = Vec::new();
    for packet in pile.descendants() {
        match packet {
            Packet::Signature(sig) => {
                sig_count += 1;
                for issuer in sig.get_issuers() {
                    if !issuers.iter().any(|i| i.aliases(&issuer)) {
                        issuers.push(issuer);
                    }
                }
            }
            other => {
                return Err(PolicyError::Violation(format!(
                    "unexpected packet in detached signature: {:?}",
                    other.tag()
                )));
            }
        }
    }
    if sig_count == 0 {
        return Err(PolicyError::Violation("no signatures found".to_string()));
    }
    Ok(issuers)
}

/// 16-hex-digit key id for a handle (fingerprints are truncated the way their
/// version prescribes).
pub fn handle_to_longid(handle: &KeyHandle) -> String {
    match handle {
        KeyHandle::Fingerprint(fpr) => KeyID::from(fpr).to_hex(),
        KeyHandle::KeyID(id) => id.to_hex(),
    }
}

fn unique_longids(handles: &[KeyHandle]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for handle in handles {
        let longid = handle_to_longid(handle);
        if !out.contains(&longid) {
            out.push(longid);
        }
    }
    out
}
