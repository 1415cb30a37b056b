use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use mailkeys_core::{Identity, KeyAlgo, KeyFamily, MailkeysError, Result};
use openssl::x509::X509;
use sequoia_openpgp::Cert;
use tracing::debug;

use crate::armor::{self, ArmorKind};
use crate::blocks::{BlockIter, normalize};
use crate::smime::SmimeMaterial;
use crate::{pgp, smime};

#[derive(Clone)]
pub(crate) enum KeyMaterial {
    OpenPgp(Cert),
    X509(SmimeMaterial),
}

/// Derived, read-only description of a key.
///
/// Recomputed whenever the underlying material changes, so it always agrees
/// with the key it belongs to. Times are milliseconds since the Unix epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyInfo {
    /// Uppercase hex: the primary fingerprint (OpenPGP) or SHA-1 thumbprint (X.509).
    pub id: String,
    pub family: KeyFamily,
    /// Ids of the primary key and every subkey.
    pub all_ids: Vec<String>,
    pub is_public: bool,
    pub is_private: bool,
    pub fully_decrypted: bool,
    pub fully_encrypted: bool,
    pub created: u64,
    pub expiration: Option<u64>,
    pub revoked: bool,
    pub usable_for_encryption: bool,
    pub usable_for_signing: bool,
    pub usable_for_encryption_but_expired: bool,
    pub usable_for_signing_but_expired: bool,
    pub missing_private_key_for_decryption: bool,
    pub missing_private_key_for_signing: bool,
    /// Lowercased addresses, primary identity first.
    pub emails: Vec<String>,
    pub identities: Vec<Identity>,
    pub algo: KeyAlgo,
    /// DER IssuerAndSerialNumber, X.509 only.
    pub issuer_and_serial_number: Option<Vec<u8>>,
}

/// A parsed OpenPGP certificate or X.509 certificate, with optional private
/// material.
///
/// Keys are immutable apart from [`decrypt_key`] and [`encrypt_key`], which
/// swap the private material in place. They are `Send + Sync`.
#[derive(Clone)]
pub struct Key {
    material: KeyMaterial,
    info: KeyInfo,
}

impl Key {
    pub(crate) fn from_cert(cert: Cert) -> Result<Key> {
        Key::build(KeyMaterial::OpenPgp(cert))
    }

    pub(crate) fn from_smime(material: SmimeMaterial) -> Result<Key> {
        Key::build(KeyMaterial::X509(material))
    }

    fn build(material: KeyMaterial) -> Result<Key> {
        let info = describe(&material, SystemTime::now())?;
        Ok(Key { material, info })
    }

    pub(crate) fn replace_material(&mut self, material: KeyMaterial) -> Result<()> {
        self.info = describe(&material, SystemTime::now())?;
        self.material = material;
        Ok(())
    }

    pub(crate) fn material(&self) -> &KeyMaterial {
        &self.material
    }

    pub fn info(&self) -> &KeyInfo {
        &self.info
    }

    pub fn id(&self) -> &str {
        &self.info.id
    }

    pub fn family(&self) -> KeyFamily {
        self.info.family
    }

    pub fn is_private(&self) -> bool {
        self.info.is_private
    }

    pub fn fully_decrypted(&self) -> bool {
        self.info.fully_decrypted
    }

    pub fn as_cert(&self) -> Option<&Cert> {
        match &self.material {
            KeyMaterial::OpenPgp(cert) => Some(cert),
            KeyMaterial::X509(_) => None,
        }
    }

    pub fn as_x509(&self) -> Option<&X509> {
        match &self.material {
            KeyMaterial::OpenPgp(_) => None,
            KeyMaterial::X509(material) => Some(&material.cert),
        }
    }

    /// The same key without any private material.
    pub fn to_public(&self) -> Result<Key> {
        match &self.material {
            KeyMaterial::OpenPgp(cert) => {
                Key::from_cert(cert.clone().strip_secret_key_material())
            }
            KeyMaterial::X509(material) => Key::from_smime(SmimeMaterial {
                cert: material.cert.clone(),
                private: None,
            }),
        }
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Key")
            .field("id", &self.info.id)
            .field("family", &self.info.family)
            .field("is_private", &self.info.is_private)
            .field("fully_decrypted", &self.info.fully_decrypted)
            .finish_non_exhaustive()
    }
}

fn describe(material: &KeyMaterial, now: SystemTime) -> Result<KeyInfo> {
    match material {
        KeyMaterial::OpenPgp(cert) => pgp::describe(cert, now),
        KeyMaterial::X509(material) => smime::describe(material, now),
    }
}

pub(crate) fn to_millis(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    OpenPgpArmor,
    Pem,
    OpenPgpBinary,
    DerCertificate,
}

type Detector = fn(&[u8]) -> Option<Format>;

/// Tried in order; the first match decides the family.
const DETECTORS: [Detector; 4] = [
    detect_openpgp_armor,
    detect_pem,
    detect_openpgp_binary,
    detect_der_certificate,
];

fn sniff_text(input: &[u8]) -> Option<ArmorKind> {
    std::str::from_utf8(input).ok().and_then(armor::sniff)
}

fn detect_openpgp_armor(input: &[u8]) -> Option<Format> {
    sniff_text(input)
        .filter(|kind| kind.is_openpgp_key())
        .map(|_| Format::OpenPgpArmor)
}

fn detect_pem(input: &[u8]) -> Option<Format> {
    sniff_text(input)
        .filter(|kind| *kind == ArmorKind::Certificate || kind.is_pem_private_key())
        .map(|_| Format::Pem)
}

fn detect_openpgp_binary(input: &[u8]) -> Option<Format> {
    let first = *input.first()?;
    if first & 0x80 == 0 {
        return None;
    }
    let tag = if first & 0x40 != 0 {
        first & 0x3F
    } else {
        (first >> 2) & 0x0F
    };
    // Public-Key (6) or Secret-Key (5) packet.
    matches!(tag, 5 | 6).then_some(Format::OpenPgpBinary)
}

fn detect_der_certificate(input: &[u8]) -> Option<Format> {
    (input.first() == Some(&0x30) && X509::from_der(input).is_ok())
        .then_some(Format::DerCertificate)
}

fn detect_format(input: &[u8]) -> Result<Format> {
    DETECTORS
        .iter()
        .find_map(|detect| detect(input))
        .ok_or_else(|| {
            MailkeysError::UnknownKeyFamily(
                "input is neither an OpenPGP key nor an X.509 certificate".to_string(),
            )
        })
}

/// Parses exactly one key of either family.
pub fn parse(input: &[u8]) -> Result<Key> {
    let format = detect_format(input)?;
    debug!(?format, len = input.len(), "parsing key");
    match format {
        Format::OpenPgpArmor | Format::OpenPgpBinary => pgp::parse(input),
        Format::Pem => {
            let text = std::str::from_utf8(input)
                .map_err(|err| MailkeysError::InvalidInput(format!("PEM is not UTF-8: {err}")))?;
            smime::parse_pem(text)
        }
        Format::DerCertificate => smime::parse_der(input),
    }
}

#[derive(Debug, Default)]
pub struct ReadManyResult {
    pub keys: Vec<Key>,
    pub errors: Vec<MailkeysError>,
}

/// Parses every key in `input`. Failures are collected per key instead of
/// aborting the whole read.
pub fn read_many(input: &[u8]) -> ReadManyResult {
    let mut out = ReadManyResult::default();
    match std::str::from_utf8(input) {
        Ok(text) if armor::sniff(text).is_some() => read_many_text(text, &mut out),
        _ => match detect_format(input) {
            Ok(Format::OpenPgpBinary) => {
                let (keys, errors) = pgp::read_certs(input);
                out.keys.extend(keys);
                out.errors.extend(errors);
            }
            Ok(Format::DerCertificate) => match smime::parse_der(input) {
                Ok(key) => out.keys.push(key),
                Err(err) => out.errors.push(err),
            },
            Ok(_) => {}
            Err(err) => out.errors.push(err),
        },
    }
    if out.keys.is_empty() && out.errors.is_empty() {
        out.errors
            .push(MailkeysError::UnknownKeyFamily("no keys found".to_string()));
    }
    out
}

fn read_many_text(text: &str, out: &mut ReadManyResult) {
    let normalized = normalize(text);
    // A PEM certificate and its private key block(s), in either order.
    let mut pem_group: Option<PemGroup> = None;
    for block in BlockIter::new(&normalized) {
        let Some(kind) = block.armor else {
            report_malformed(&block.content, out);
            continue;
        };
        if kind.is_openpgp_key() {
            flush_pem(&mut pem_group, out);
            let (keys, errors) = pgp::read_certs(block.content.as_bytes());
            out.keys.extend(keys);
            out.errors.extend(errors);
        } else if kind == ArmorKind::Certificate {
            match pem_group.as_mut() {
                Some(group) if !group.has_cert => group.push(&block.content, true),
                _ => {
                    flush_pem(&mut pem_group, out);
                    pem_group = Some(PemGroup::new(&block.content, true));
                }
            }
        } else if kind.is_pem_private_key() {
            match pem_group.as_mut() {
                Some(group) => group.push(&block.content, false),
                None => pem_group = Some(PemGroup::new(&block.content, false)),
            }
        }
    }
    flush_pem(&mut pem_group, out);
}

/// Key-bearing begin lines left in plain text failed to decode; report them
/// instead of dropping them silently.
fn report_malformed(plain: &str, out: &mut ReadManyResult) {
    let mut line_start = 0;
    while line_start < plain.len() {
        let end = plain[line_start..]
            .find('\n')
            .map_or(plain.len(), |i| line_start + i);
        if let Some(kind) = ArmorKind::begin_line_at(&plain[line_start..end])
            && (kind.is_openpgp_key()
                || kind == ArmorKind::Certificate
                || kind.is_pem_private_key())
            && let Err(err) = armor::dearmor(&plain[line_start..])
        {
            debug!(?kind, %err, "skipping malformed armored key");
            out.errors.push(err);
        }
        line_start = end + 1;
    }
}

struct PemGroup {
    text: String,
    has_cert: bool,
}

impl PemGroup {
    fn new(block: &str, is_cert: bool) -> Self {
        Self {
            text: block.to_string(),
            has_cert: is_cert,
        }
    }

    fn push(&mut self, block: &str, is_cert: bool) {
        self.text.push('\n');
        self.text.push_str(block);
        self.has_cert |= is_cert;
    }
}

fn flush_pem(group: &mut Option<PemGroup>, out: &mut ReadManyResult) {
    if let Some(group) = group.take() {
        match smime::parse_pem(&group.text) {
            Ok(key) => out.keys.push(key),
            Err(err) => out.errors.push(err),
        }
    }
}

/// Armored text of the key, including private material when present.
pub fn armor_key(key: &Key) -> Result<String> {
    match &key.material {
        KeyMaterial::OpenPgp(cert) => pgp::armor_cert(cert),
        KeyMaterial::X509(material) => smime::armor(material),
    }
}

/// Unlocks the private material in place.
///
/// Returns `Ok(false)` and leaves the key untouched when the passphrase is
/// wrong. An already unlocked key yields `Ok(true)`.
pub fn decrypt_key(key: &mut Key, passphrase: &str) -> Result<bool> {
    if !key.is_private() {
        return Err(MailkeysError::NotPrivate(key.id().to_string()));
    }
    if key.fully_decrypted() {
        return Ok(true);
    }
    let updated = match &key.material {
        KeyMaterial::OpenPgp(cert) => pgp::decrypt_cert(cert, passphrase)?.map(KeyMaterial::OpenPgp),
        KeyMaterial::X509(material) => {
            smime::decrypt_private(material, passphrase)?.map(KeyMaterial::X509)
        }
    };
    match updated {
        Some(material) => {
            key.replace_material(material)?;
            debug!(key = %key.id(), "private key unlocked");
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Protects the private material with `passphrase` in place.
pub fn encrypt_key(key: &mut Key, passphrase: &str) -> Result<()> {
    if !key.is_private() {
        return Err(MailkeysError::NotPrivate(key.id().to_string()));
    }
    if passphrase.is_empty() {
        return Err(MailkeysError::InvalidInput(
            "passphrase must not be empty".to_string(),
        ));
    }
    let material = match &key.material {
        KeyMaterial::OpenPgp(cert) => KeyMaterial::OpenPgp(pgp::encrypt_cert(cert, passphrase)?),
        KeyMaterial::X509(material) => {
            KeyMaterial::X509(smime::encrypt_private(material, passphrase)?)
        }
    };
    key.replace_material(material)
}

/// Identifiers that may appear in messages addressed to, or signed by, this key.
///
/// OpenPGP: the 16-hex key id of the primary key and of every subkey.
/// X.509: the hex IssuerAndSerialNumber, as named by CMS RecipientInfos.
pub fn longids(key: &Key) -> Vec<String> {
    match &key.material {
        KeyMaterial::OpenPgp(cert) => cert.keys().map(|ka| ka.key().keyid().to_hex()).collect(),
        KeyMaterial::X509(_) => key
            .info
            .issuer_and_serial_number
            .iter()
            .map(hex::encode_upper)
            .collect(),
    }
}
