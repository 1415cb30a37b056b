//! Message encryption, decryption, signing and signature verification for
//! both key families.

use std::error::Error as StdError;
use std::fmt;
use std::io::{Read, Write};

use mailkeys_core::{
    DecryptErrorKind, DecryptLongids, KeyFamily, MailkeysError, PassphraseProvider, Result,
    VerifyResult,
};
use mailkeys_policy::{
    MessageInfo, ensure_integrity_protected, handle_to_longid, inspect_message, signature_issuers,
};
use openpgp::armor::Kind as PgpArmorKind;
use openpgp::cert::prelude::*;
use openpgp::crypto::{KeyPair, SessionKey};
use openpgp::packet::key::{SecretParts, UnspecifiedRole};
use openpgp::packet::{Key as PgpKey, PKESK, SKESK};
use openpgp::parse::Parse;
use openpgp::parse::stream::{
    DecryptionHelper, DecryptorBuilder, DetachedVerifierBuilder, MessageLayer, MessageStructure,
    VerificationError, VerificationHelper, VerifierBuilder,
};
use openpgp::policy::{Policy, StandardPolicy};
use openpgp::serialize::stream::{Armorer, Encryptor, LiteralWriter, Message, Signer};
use openpgp::types::{RevocationStatus, SymmetricAlgorithm};
use openpgp::{Cert, KeyHandle};
use openssl::x509::X509;
use sequoia_openpgp as openpgp;
use tracing::{debug, warn};

use crate::key::{Key, KeyMaterial, decrypt_key, longids};
use crate::smime;

/// Parameters for [`encrypt_message`].
#[derive(Debug, Clone, Copy)]
pub struct EncryptOptions<'a> {
    pub pubkeys: &'a [Key],
    pub data: &'a [u8],
    pub armor: bool,
    /// Also sign the OpenPGP message with this (unlocked) key.
    pub signing_key: Option<&'a Key>,
}

/// One encoding per recipient family present.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncryptedMessage {
    pub openpgp: Option<Vec<u8>>,
    pub smime: Option<Vec<u8>>,
}

/// Encrypts `data` once for all OpenPGP recipients and once for all X.509
/// recipients.
pub fn encrypt_message(opts: &EncryptOptions<'_>) -> Result<EncryptedMessage> {
    if opts.pubkeys.is_empty() {
        return Err(MailkeysError::InvalidInput(
            "at least one recipient key is required".to_string(),
        ));
    }
    let mut seen: Vec<&str> = Vec::new();
    let mut certs: Vec<&Cert> = Vec::new();
    let mut x509s: Vec<&X509> = Vec::new();
    for key in opts.pubkeys {
        if key.info().revoked {
            warn!(key = %key.id(), "refusing to encrypt to revoked key");
            return Err(MailkeysError::RevokedKeySigningOrEncrypting(
                key.id().to_string(),
            ));
        }
        if seen.contains(&key.id()) {
            continue;
        }
        seen.push(key.id());
        match key.material() {
            KeyMaterial::OpenPgp(cert) => certs.push(cert),
            KeyMaterial::X509(material) => x509s.push(&material.cert),
        }
    }

    let mut out = EncryptedMessage::default();
    if !certs.is_empty() {
        out.openpgp = Some(encrypt_openpgp(&certs, opts)?);
    }
    if !x509s.is_empty() {
        if opts.signing_key.is_some() {
            return Err(MailkeysError::Unsupported(
                "signed S/MIME encryption".to_string(),
            ));
        }
        out.smime = Some(smime::encrypt(&x509s, opts.data, opts.armor)?);
    }
    Ok(out)
}

fn encrypt_openpgp(certs: &[&Cert], opts: &EncryptOptions<'_>) -> Result<Vec<u8>> {
    let policy = StandardPolicy::new();
    let mut recipients: Vec<openpgp::serialize::stream::Recipient<'_>> = Vec::new();
    for cert in certs {
        let key = cert
            .keys()
            .with_policy(&policy, None)
            .supported()
            .alive()
            .revoked(false)
            .for_transport_encryption()
            .for_storage_encryption()
            .next()
            .ok_or_else(|| {
                MailkeysError::InvalidInput(format!(
                    "no encryption-capable key in {}",
                    cert.fingerprint()
                ))
            })?;
        recipients.push(key.into());
    }
    let signer = opts.signing_key.map(signing_keypair).transpose()?;

    let mut sink = Vec::new();
    let mut message = Message::new(&mut sink);
    if opts.armor {
        message = Armorer::new(message)
            .build()
            .map_err(|err| MailkeysError::Backend(format!("armor failed: {err}")))?;
    }
    let mut message = Encryptor::for_recipients(message, recipients)
        .build()
        .map_err(|err| MailkeysError::Backend(format!("encryptor failed: {err}")))?;
    if let Some(keypair) = signer {
        message = Signer::new(message, keypair)
            .map_err(|err| MailkeysError::Backend(format!("signer failed: {err}")))?
            .build()
            .map_err(|err| MailkeysError::Backend(format!("signer build failed: {err}")))?;
    }
    let mut message = LiteralWriter::new(message)
        .build()
        .map_err(|err| MailkeysError::Backend(format!("literal writer failed: {err}")))?;
    message
        .write_all(opts.data)
        .map_err(|err| MailkeysError::Io(format!("write failed: {err}")))?;
    message
        .finalize()
        .map_err(|err| MailkeysError::Backend(format!("finalize failed: {err}")))?;
    debug!(recipients = certs.len(), "OpenPGP message encrypted");
    Ok(sink)
}

/// Key ids an encrypted message is addressed to: 16-hex OpenPGP key ids, or
/// hex IssuerAndSerialNumber values for PKCS#7.
pub fn recipient_longids(encrypted: &[u8]) -> Result<Vec<String>> {
    if smime::looks_like_pkcs7(encrypted) {
        return smime::recipient_longids(encrypted);
    }
    let info = inspect_message(encrypted)
        .map_err(|err| MailkeysError::InvalidInput(err.to_string()))?;
    Ok(info.recipient_longids())
}

/// Keypair of the newest valid signing-capable key of an unlocked private key.
fn signing_keypair(key: &Key) -> Result<KeyPair> {
    let cert = key.as_cert().ok_or_else(|| {
        MailkeysError::Unsupported("X.509 keys cannot sign OpenPGP messages".to_string())
    })?;
    let policy = StandardPolicy::new();
    if let RevocationStatus::Revoked(_) = cert.revocation_status(&policy, None) {
        warn!(key = %key.id(), "refusing to sign with revoked key");
        return Err(MailkeysError::RevokedKeySigningOrEncrypting(
            key.id().to_string(),
        ));
    }
    if !cert.is_tsk() {
        return Err(MailkeysError::NotPrivate(key.id().to_string()));
    }
    let mut candidates: Vec<PgpKey<SecretParts, UnspecifiedRole>> = cert
        .keys()
        .secret()
        .with_policy(&policy, None)
        .supported()
        .alive()
        .revoked(false)
        .for_signing()
        .map(|ka| ka.key().clone())
        .collect();
    let signing = candidates.pop().ok_or_else(|| {
        MailkeysError::InvalidInput(format!("no usable signing key in {}", key.id()))
    })?;
    if signing.secret().is_encrypted() {
        return Err(MailkeysError::KeyLocked(key.id().to_string()));
    }
    signing
        .into_keypair()
        .map_err(|err| MailkeysError::Backend(format!("keypair failed: {err}")))
}

/// Signs `data` with a private key.
///
/// OpenPGP keys produce an armored detached signature or, with
/// `detached == false`, a cleartext-signed message. X.509 keys produce a
/// detached PKCS#7 signature only.
pub fn sign(key: &Key, data: &[u8], detached: bool) -> Result<String> {
    match key.material() {
        KeyMaterial::X509(material) => {
            if !detached {
                return Err(MailkeysError::Unsupported(
                    "cleartext signatures with X.509 keys".to_string(),
                ));
            }
            smime::sign_detached(material, data)
        }
        KeyMaterial::OpenPgp(_) => {
            let keypair = signing_keypair(key)?;
            let mut sink = Vec::new();
            let message = Message::new(&mut sink);
            let mut signer = if detached {
                let message = Armorer::new(message)
                    .kind(PgpArmorKind::Signature)
                    .build()
                    .map_err(|err| MailkeysError::Backend(format!("armor failed: {err}")))?;
                Signer::new(message, keypair)
                    .map_err(|err| MailkeysError::Backend(format!("signer failed: {err}")))?
                    .detached()
                    .build()
            } else {
                Signer::new(message, keypair)
                    .map_err(|err| MailkeysError::Backend(format!("signer failed: {err}")))?
                    .cleartext()
                    .build()
            }
            .map_err(|err| MailkeysError::Backend(format!("signer build failed: {err}")))?;
            signer
                .write_all(data)
                .map_err(|err| MailkeysError::Io(format!("write failed: {err}")))?;
            signer
                .finalize()
                .map_err(|err| MailkeysError::Backend(format!("finalize failed: {err}")))?;
            String::from_utf8(sink)
                .map_err(|err| MailkeysError::Backend(format!("signature is not text: {err}")))
        }
    }
}

/// Checks a detached signature over `data` against the supplied public keys.
///
/// Never fails: parse problems come back as a fatal [`VerifyResult`].
pub fn verify_detached(data: &[u8], signature: &[u8], pubkeys: &[Key]) -> VerifyResult {
    if smime::looks_like_pkcs7(signature) {
        let certs: Vec<&X509> = pubkeys.iter().filter_map(Key::as_x509).collect();
        return smime::verify_detached(signature, data, &certs);
    }

    let issuers = match signature_issuers(signature) {
        Ok(issuers) => issuers,
        Err(err) => return VerifyResult::fatal(err.to_string()),
    };
    let signer_longids = unique_longids(&issuers);
    let candidates: Vec<Cert> = pubkeys
        .iter()
        .filter_map(Key::as_cert)
        .filter(|cert| {
            cert.keys()
                .any(|ka| issuers.iter().any(|id| ka.key().key_handle().aliases(id)))
        })
        .cloned()
        .collect();
    if candidates.is_empty() {
        debug!(signers = ?signer_longids, "no supplied key made this signature");
        return VerifyResult {
            signer_longids,
            ..VerifyResult::default()
        };
    }

    let helper = MessageHelper::verifying(candidates);
    let p = &StandardPolicy::new();
    let mut verifier = match DetachedVerifierBuilder::from_bytes(signature)
        .and_then(|builder| builder.with_policy(p, None, helper))
    {
        Ok(verifier) => verifier,
        Err(err) => return VerifyResult::fatal(format!("verifier failed: {err}")),
    };
    if let Err(err) = verifier.verify_bytes(data) {
        debug!(%err, "detached verification reported an error");
    }
    let mut result = verifier.into_helper().verify_result();
    if result.signer_longids.is_empty() {
        result.signer_longids = signer_longids;
    }
    result
}

/// A private key offered for decryption, with its passphrase if known.
#[derive(Clone)]
pub struct PrvKeyInfo {
    pub key: Key,
    pub passphrase: Option<String>,
}

impl fmt::Debug for PrvKeyInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrvKeyInfo")
            .field("key", &self.key)
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Parameters for [`decrypt_message`].
#[derive(Clone, Copy, Default)]
pub struct DecryptOptions<'a> {
    pub keys: &'a [PrvKeyInfo],
    pub encrypted_data: &'a [u8],
    /// Public keys used to check embedded signatures.
    pub verification_pubs: &'a [Key],
    /// Consulted for locked keys supplied without a passphrase.
    pub passphrases: Option<&'a dyn PassphraseProvider>,
    /// Allow revoked keys to decrypt (archived mail).
    pub allow_revoked_keys: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptSuccess {
    pub content: Vec<u8>,
    pub is_encrypted: bool,
    /// Present when the message carried at least one signature.
    pub signature: Option<VerifyResult>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptError {
    pub kind: DecryptErrorKind,
    pub message: String,
    pub longids: DecryptLongids,
    pub is_encrypted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecryptResult {
    Success(DecryptSuccess),
    Error(DecryptError),
}

impl DecryptResult {
    pub fn is_success(&self) -> bool {
        matches!(self, DecryptResult::Success(_))
    }

    pub fn content(&self) -> Option<&[u8]> {
        match self {
            DecryptResult::Success(success) => Some(&success.content),
            DecryptResult::Error(_) => None,
        }
    }

    pub fn error_kind(&self) -> Option<DecryptErrorKind> {
        match self {
            DecryptResult::Success(_) => None,
            DecryptResult::Error(err) => Some(err.kind),
        }
    }
}

fn failure(
    kind: DecryptErrorKind,
    message: impl Into<String>,
    longids: DecryptLongids,
    is_encrypted: bool,
) -> DecryptResult {
    let message = message.into();
    debug!(kind = kind.as_str(), %message, "decryption failed");
    DecryptResult::Error(DecryptError {
        kind,
        message,
        longids,
        is_encrypted,
    })
}

/// Entries of `key_ids` that also appear in `message_ids`, in `key_ids` order,
/// compared case-insensitively and without duplicates.
pub fn matching_keyids(key_ids: &[String], message_ids: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for id in key_ids {
        if message_ids.iter().any(|m| m.eq_ignore_ascii_case(id))
            && !out.iter().any(|o| o.eq_ignore_ascii_case(id))
        {
            out.push(id.clone());
        }
    }
    out
}

/// Ranking of the supplied private keys against one message.
#[derive(Debug, Default)]
struct SortedKeys {
    /// Indices of keys that one of the message's key ids belongs to.
    prv_matching: Vec<usize>,
    signed_by: Vec<String>,
    encrypted_for: Vec<String>,
    /// Indices of keys worth attempting, matching keys only unless the
    /// message hides its recipients.
    prv_for_decrypt: Vec<usize>,
    /// Subset of `prv_for_decrypt` usable without a passphrase.
    prv_for_decrypt_decrypted: Vec<usize>,
}

fn sort_keys(keys: &[PrvKeyInfo], info: &MessageInfo, allow_revoked: bool) -> SortedKeys {
    let mut sorted = SortedKeys {
        signed_by: info.signer_longids(),
        encrypted_for: info.recipient_longids(),
        ..SortedKeys::default()
    };
    let eligible: Vec<usize> = keys
        .iter()
        .enumerate()
        .filter(|(_, ki)| ki.key.family() == KeyFamily::OpenPgp && ki.key.is_private())
        .filter(|(_, ki)| {
            let skip = ki.key.info().revoked && !allow_revoked;
            if skip {
                debug!(key = %ki.key.id(), "skipping revoked key");
            }
            !skip
        })
        .map(|(idx, _)| idx)
        .collect();
    sorted.prv_matching = eligible
        .iter()
        .copied()
        .filter(|idx| !matching_keyids(&longids(&keys[*idx].key), &sorted.encrypted_for).is_empty())
        .collect();
    sorted.prv_for_decrypt = if !sorted.prv_matching.is_empty() {
        sorted.prv_matching.clone()
    } else if sorted.encrypted_for.is_empty() || info.wildcard_recipients > 0 {
        eligible
    } else {
        Vec::new()
    };
    sorted.prv_for_decrypt_decrypted = sorted
        .prv_for_decrypt
        .iter()
        .copied()
        .filter(|idx| keys[*idx].key.fully_decrypted())
        .collect();
    sorted
}

enum Unlock {
    Ready(Key),
    WrongPassphrase,
    NeedPassphrase,
    Unusable,
}

/// Unlocks a copy of the key; the caller's key is never modified.
fn unlock(ki: &PrvKeyInfo, provider: Option<&dyn PassphraseProvider>) -> Unlock {
    if ki.key.fully_decrypted() {
        return Unlock::Ready(ki.key.clone());
    }
    let passphrase = ki
        .passphrase
        .clone()
        .or_else(|| provider.and_then(|p| p.passphrase_for(ki.key.id())));
    let Some(passphrase) = passphrase else {
        return Unlock::NeedPassphrase;
    };
    let mut key = ki.key.clone();
    match decrypt_key(&mut key, &passphrase) {
        Ok(true) => Unlock::Ready(key),
        Ok(false) => Unlock::WrongPassphrase,
        Err(err) => {
            warn!(key = %ki.key.id(), %err, "cannot unlock key");
            Unlock::Unusable
        }
    }
}

/// Longids to report for a key: the ones the message names, or its primary.
fn reported_longids(key: &Key, message_ids: &[String]) -> Vec<String> {
    let ids = longids(key);
    let matching = matching_keyids(&ids, message_ids);
    if matching.is_empty() {
        ids.into_iter().take(1).collect()
    } else {
        matching
    }
}

/// Decrypts an OpenPGP or PKCS#7 message, or verifies a signed but
/// unencrypted OpenPGP message.
///
/// Never fails: every problem, including wrong or missing passphrases, comes
/// back as a classified [`DecryptResult::Error`].
pub fn decrypt_message(opts: &DecryptOptions<'_>) -> DecryptResult {
    if smime::looks_like_pkcs7(opts.encrypted_data) {
        return decrypt_smime(opts);
    }
    let info = match inspect_message(opts.encrypted_data) {
        Ok(info) => info,
        Err(err) => {
            return failure(
                DecryptErrorKind::Format,
                err.to_string(),
                DecryptLongids::default(),
                false,
            );
        }
    };
    if !info.is_encrypted() {
        return verify_signed(opts);
    }

    let mut report = DecryptLongids {
        message: info.recipient_longids(),
        ..DecryptLongids::default()
    };
    if let Err(err) = ensure_integrity_protected(&info) {
        warn!(%err, "refusing to decrypt message without integrity protection");
        return failure(
            DecryptErrorKind::NoMdc,
            MailkeysError::NoMdcIntegrityProtection.to_string(),
            report,
            true,
        );
    }
    if info.recipients.is_empty() && info.wildcard_recipients == 0 {
        return failure(
            DecryptErrorKind::UsePassword,
            "message is encrypted with a password only",
            report,
            true,
        );
    }

    let sorted = sort_keys(opts.keys, &info, opts.allow_revoked_keys);
    debug!(
        encrypted_for = ?sorted.encrypted_for,
        signed_by = ?sorted.signed_by,
        matching = sorted.prv_matching.len(),
        candidates = sorted.prv_for_decrypt.len(),
        ready = sorted.prv_for_decrypt_decrypted.len(),
        "ranked private keys"
    );
    for idx in &sorted.prv_matching {
        for id in matching_keyids(&longids(&opts.keys[*idx].key), &report.message) {
            if !report.matching.contains(&id) {
                report.matching.push(id);
            }
        }
    }
    if sorted.prv_for_decrypt.is_empty() {
        return failure(
            DecryptErrorKind::KeyMismatch,
            "none of the supplied keys can decrypt this message",
            report,
            true,
        );
    }

    let mut ready: Vec<Cert> = Vec::new();
    let mut wrong_passphrase = false;
    for idx in &sorted.prv_for_decrypt {
        let ki = &opts.keys[*idx];
        let unlocked = if sorted.prv_for_decrypt_decrypted.contains(idx) {
            Unlock::Ready(ki.key.clone())
        } else {
            unlock(ki, opts.passphrases)
        };
        match unlocked {
            Unlock::Ready(key) => {
                report
                    .chosen
                    .extend(reported_longids(&key, &report.message));
                if let Some(cert) = key.as_cert() {
                    ready.push(cert.clone());
                }
            }
            Unlock::WrongPassphrase => wrong_passphrase = true,
            Unlock::NeedPassphrase => {
                let ids = reported_longids(&ki.key, &report.message);
                report.need_passphrase.extend(ids);
            }
            Unlock::Unusable => {}
        }
    }
    if ready.is_empty() {
        let kind = if wrong_passphrase {
            DecryptErrorKind::WrongPassword
        } else {
            DecryptErrorKind::NeedPassphrase
        };
        let message = if wrong_passphrase {
            MailkeysError::IncorrectPassphrase.to_string()
        } else {
            "a passphrase is needed to unlock the private key".to_string()
        };
        return failure(kind, message, report, true);
    }

    let policy = StandardPolicy::new();
    if ready
        .iter()
        .all(|cert| decryption_keys(cert, &policy, opts.allow_revoked_keys).is_empty())
    {
        return failure(
            DecryptErrorKind::Other,
            MailkeysError::NoDecryptionKeyPacketsFound.to_string(),
            report,
            true,
        );
    }

    let waiting = !report.need_passphrase.is_empty();
    let helper = MessageHelper::decrypting(
        ready,
        verification_certs(opts.verification_pubs),
        opts.allow_revoked_keys,
    );
    let p = &StandardPolicy::new();
    let mut decryptor = match DecryptorBuilder::from_bytes(opts.encrypted_data)
        .and_then(|builder| builder.with_policy(p, None, helper))
    {
        Ok(decryptor) => decryptor,
        Err(err) => {
            let root: &(dyn StdError + 'static) = &*err;
            let kind = failure_kind(openpgp_cause(Some(root)), waiting, wrong_passphrase);
            return failure(kind, format!("decryption failed: {err}"), report, true);
        }
    };
    let mut content = Vec::new();
    if let Err(err) = decryptor.read_to_end(&mut content) {
        let cause = openpgp_cause(err.get_ref().map(|e| e as &(dyn StdError + 'static)));
        let kind = failure_kind(cause, waiting, wrong_passphrase);
        return failure(kind, format!("read failed: {err}"), report, true);
    }
    let helper = decryptor.into_helper();
    if let Some(used) = &helper.used_key {
        debug!(key = %used, "message decrypted");
    }
    DecryptResult::Success(DecryptSuccess {
        content,
        is_encrypted: true,
        signature: helper.saw_signature.then(|| helper.verify_result()),
    })
}

/// Signed (or plain literal) OpenPGP data that is not encrypted.
fn verify_signed(opts: &DecryptOptions<'_>) -> DecryptResult {
    let helper = MessageHelper::verifying(verification_certs(opts.verification_pubs));
    let p = &StandardPolicy::new();
    let mut verifier = match VerifierBuilder::from_bytes(opts.encrypted_data)
        .and_then(|builder| builder.with_policy(p, None, helper))
    {
        Ok(verifier) => verifier,
        Err(err) => {
            return failure(
                DecryptErrorKind::Format,
                format!("cannot read message: {err}"),
                DecryptLongids::default(),
                false,
            );
        }
    };
    let mut content = Vec::new();
    if let Err(err) = verifier.read_to_end(&mut content) {
        return failure(
            DecryptErrorKind::Format,
            format!("read failed: {err}"),
            DecryptLongids::default(),
            false,
        );
    }
    let helper = verifier.into_helper();
    DecryptResult::Success(DecryptSuccess {
        content,
        is_encrypted: false,
        signature: helper.saw_signature.then(|| helper.verify_result()),
    })
}

fn decrypt_smime(opts: &DecryptOptions<'_>) -> DecryptResult {
    let message_ids = match smime::recipient_longids(opts.encrypted_data) {
        Ok(ids) => ids,
        Err(err) => {
            return failure(
                DecryptErrorKind::Format,
                err.to_string(),
                DecryptLongids::default(),
                true,
            );
        }
    };
    let mut report = DecryptLongids {
        message: message_ids,
        ..DecryptLongids::default()
    };
    let mut wrong_passphrase = false;
    let mut last_error: Option<String> = None;
    for ki in opts.keys {
        if ki.key.family() != KeyFamily::X509 || !ki.key.is_private() {
            continue;
        }
        let matching = matching_keyids(&longids(&ki.key), &report.message);
        if matching.is_empty() {
            continue;
        }
        report.matching.extend(matching.iter().cloned());
        match unlock(ki, opts.passphrases) {
            Unlock::Ready(key) => {
                report.chosen.extend(matching);
                let KeyMaterial::X509(material) = key.material() else {
                    continue;
                };
                match smime::decrypt(opts.encrypted_data, material) {
                    Ok(content) => {
                        return DecryptResult::Success(DecryptSuccess {
                            content,
                            is_encrypted: true,
                            signature: None,
                        });
                    }
                    Err(err) => last_error = Some(err.to_string()),
                }
            }
            Unlock::WrongPassphrase => wrong_passphrase = true,
            Unlock::NeedPassphrase => report.need_passphrase.extend(matching),
            Unlock::Unusable => {}
        }
    }

    if let Some(err) = last_error {
        failure(DecryptErrorKind::Other, err, report, true)
    } else if report.matching.is_empty() {
        failure(
            DecryptErrorKind::KeyMismatch,
            "none of the supplied certificates can decrypt this message",
            report,
            true,
        )
    } else if wrong_passphrase {
        failure(
            DecryptErrorKind::WrongPassword,
            MailkeysError::IncorrectPassphrase.to_string(),
            report,
            true,
        )
    } else {
        failure(
            DecryptErrorKind::NeedPassphrase,
            "a passphrase is needed to unlock the private key",
            report,
            true,
        )
    }
}

fn verification_certs(pubkeys: &[Key]) -> Vec<Cert> {
    pubkeys.iter().filter_map(Key::as_cert).cloned().collect()
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

/// Unlocked secret keys of `cert` able to decrypt. Expired keys qualify,
/// revoked ones only when explicitly allowed.
fn decryption_keys(
    cert: &Cert,
    policy: &dyn Policy,
    allow_revoked: bool,
) -> Vec<PgpKey<SecretParts, UnspecifiedRole>> {
    if !allow_revoked
        && matches!(
            cert.revocation_status(policy, None),
            RevocationStatus::Revoked(_)
        )
    {
        return Vec::new();
    }
    let mut keys = cert
        .keys()
        .secret()
        .with_policy(policy, None)
        .supported()
        .for_transport_encryption()
        .for_storage_encryption();
    if !allow_revoked {
        keys = keys.revoked(false);
    }
    keys.filter(|ka| !ka.key().secret().is_encrypted())
        .map(|ka| ka.key().clone())
        .collect()
}

fn openpgp_cause<'a>(
    mut cur: Option<&'a (dyn StdError + 'static)>,
) -> Option<&'a openpgp::Error> {
    while let Some(err) = cur {
        if let Some(found) = err.downcast_ref::<openpgp::Error>() {
            return Some(found);
        }
        cur = err.source();
    }
    None
}

fn failure_kind(
    cause: Option<&openpgp::Error>,
    waiting_for_passphrase: bool,
    wrong_passphrase: bool,
) -> DecryptErrorKind {
    match cause {
        Some(openpgp::Error::MissingSessionKey(_)) if wrong_passphrase => {
            DecryptErrorKind::WrongPassword
        }
        Some(openpgp::Error::MissingSessionKey(_)) if waiting_for_passphrase => {
            DecryptErrorKind::NeedPassphrase
        }
        Some(openpgp::Error::MissingSessionKey(_)) => DecryptErrorKind::KeyMismatch,
        Some(openpgp::Error::ManipulatedMessage) => DecryptErrorKind::BadMdc,
        Some(openpgp::Error::MalformedMessage(_) | openpgp::Error::MalformedPacket(_)) => {
            DecryptErrorKind::Format
        }
        _ => DecryptErrorKind::Other,
    }
}

/// Streaming helper shared by decryption and verification.
struct MessageHelper {
    decryption_certs: Vec<Cert>,
    verification_certs: Vec<Cert>,
    allow_revoked: bool,
    used_key: Option<String>,
    signer_longids: Vec<String>,
    good_signers: Vec<(String, String)>,
    bad: Option<String>,
    malformed: Option<String>,
    saw_signature: bool,
}

impl MessageHelper {
    fn verifying(verification_certs: Vec<Cert>) -> Self {
        Self::decrypting(Vec::new(), verification_certs, false)
    }

    fn decrypting(
        decryption_certs: Vec<Cert>,
        verification_certs: Vec<Cert>,
        allow_revoked: bool,
    ) -> Self {
        Self {
            decryption_certs,
            verification_certs,
            allow_revoked,
            used_key: None,
            signer_longids: Vec::new(),
            good_signers: Vec::new(),
            bad: None,
            malformed: None,
            saw_signature: false,
        }
    }

    fn note_signer(&mut self, longid: String) {
        if !self.signer_longids.contains(&longid) {
            self.signer_longids.push(longid);
        }
    }

    fn verify_result(&self) -> VerifyResult {
        let mut result = VerifyResult {
            signer_longids: self.signer_longids.clone(),
            ..VerifyResult::default()
        };
        if let Some((fingerprint, _)) = self.good_signers.first() {
            result.matched = Some(true);
            result.signer_fingerprint = Some(fingerprint.clone());
        } else if let Some(err) = &self.bad {
            result.matched = Some(false);
            result.error = Some(err.clone());
        } else if let Some(err) = &self.malformed {
            result.error = Some(err.clone());
            result.is_err_fatal = true;
        }
        result
    }
}

impl VerificationHelper for MessageHelper {
    fn get_certs(&mut self, ids: &[KeyHandle]) -> openpgp::Result<Vec<Cert>> {
        for id in ids {
            self.note_signer(handle_to_longid(id));
        }
        if ids.is_empty() {
            return Ok(self.verification_certs.clone());
        }
        Ok(self
            .verification_certs
            .iter()
            .filter(|cert| {
                ids.iter().any(|id| {
                    cert.fingerprint().aliases(id)
                        || cert.keys().any(|ka| ka.key().fingerprint().aliases(id))
                })
            })
            .cloned()
            .collect())
    }

    fn check(&mut self, structure: MessageStructure) -> openpgp::Result<()> {
        for layer in structure.iter() {
            let MessageLayer::SignatureGroup { results } = layer else {
                continue;
            };
            for result in results {
                self.saw_signature = true;
                match result {
                    Ok(good) => {
                        let fingerprint = good.ka.cert().fingerprint().to_hex();
                        let longid = good.ka.key().keyid().to_hex();
                        self.note_signer(longid.clone());
                        if !self.good_signers.iter().any(|(f, _)| *f == fingerprint) {
                            self.good_signers.push((fingerprint, longid));
                        }
                    }
                    Err(VerificationError::MissingKey { .. }) => {}
                    Err(VerificationError::MalformedSignature { error, .. }) => {
                        self.malformed = Some(format!("malformed signature: {error}"));
                    }
                    Err(
                        VerificationError::BadSignature { error, .. }
                        | VerificationError::BadKey { error, .. }
                        | VerificationError::UnboundKey { error, .. },
                    ) => {
                        self.bad = Some(format!("signature does not verify: {error}"));
                    }
                    Err(other) => {
                        self.malformed = Some(format!("unusable signature: {other}"));
                    }
                }
            }
        }
        Ok(())
    }
}

impl DecryptionHelper for MessageHelper {
    fn decrypt(
        &mut self,
        pkesks: &[PKESK],
        _skesks: &[SKESK],
        sym_algo: Option<SymmetricAlgorithm>,
        decrypt: &mut dyn FnMut(Option<SymmetricAlgorithm>, &SessionKey) -> bool,
    ) -> openpgp::Result<Option<Cert>> {
        let policy = StandardPolicy::new();
        // Named recipients first; anonymous ones have to be tried against every key.
        let ordered = pkesks
            .iter()
            .filter(|pkesk| pkesk.recipient().is_some())
            .chain(pkesks.iter().filter(|pkesk| pkesk.recipient().is_none()));
        for pkesk in ordered {
            let recipient = pkesk.recipient();
            for cert in &self.decryption_certs {
                for key in decryption_keys(cert, &policy, self.allow_revoked) {
                    if let Some(handle) = &recipient
                        && !key.key_handle().aliases(handle)
                    {
                        continue;
                    }
                    let keyid = key.keyid().to_hex();
                    let mut keypair = key.into_keypair()?;
                    if let Some((algo, sk)) = pkesk.decrypt(&mut keypair, sym_algo)
                        && decrypt(algo, &sk)
                    {
                        self.used_key = Some(keyid);
                        return Ok(Some(cert.clone()));
                    }
                }
            }
        }
        Ok(None)
    }
}
