//! X.509 certificates for S/MIME: parsing (PEM, DER, PKCS#12), derived
//! properties, and PKCS#7 enveloped and detached-signed data.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use mailkeys_core::{Identity, KeyAlgo, KeyFamily, MailkeysError, Result, VerifyResult};
use mailkeys_policy::MIN_RSA_BITS;
use openssl::asn1::{Asn1Time, Asn1TimeRef};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkcs7::{Pkcs7, Pkcs7Flags};
use openssl::pkcs12::Pkcs12;
use openssl::pkey::{Id, PKey, PKeyRef, Private, Public};
use openssl::stack::Stack;
use openssl::symm::Cipher;
use openssl::x509::store::X509StoreBuilder;
use openssl::x509::{X509, X509NameRef, X509Ref};
use tracing::{debug, warn};

use crate::armor::{self, ArmorKind, Armored};
use crate::der;
use crate::email::is_valid_email;
use crate::key::{Key, KeyInfo, to_millis};

#[derive(Clone)]
pub(crate) struct SmimeMaterial {
    pub(crate) cert: X509,
    pub(crate) private: Option<PrivateMaterial>,
}

#[derive(Clone)]
pub(crate) enum PrivateMaterial {
    Unlocked(PKey<Private>),
    /// PEM of an encrypted PKCS#8 key.
    Locked(String),
}

/// Uppercase hex SHA-1 digest of the DER certificate.
pub(crate) fn thumbprint(cert: &X509Ref) -> Result<String> {
    let digest = cert
        .digest(MessageDigest::sha1())
        .map_err(|err| MailkeysError::backend("certificate digest failed", err))?;
    Ok(hex::encode_upper(&*digest))
}

/// DER `IssuerAndSerialNumber`, as used by CMS to name a recipient or signer.
pub(crate) fn issuer_and_serial_number(cert: &X509Ref) -> Result<Vec<u8>> {
    let mut content = cert
        .issuer_name()
        .to_der()
        .map_err(|err| MailkeysError::backend("issuer encoding failed", err))?;
    let cert_der = cert
        .to_der()
        .map_err(|err| MailkeysError::backend("certificate encoding failed", err))?;
    let serial = der::certificate_serial(&cert_der).ok_or_else(|| {
        MailkeysError::InvalidInput("certificate has no serial number".to_string())
    })?;
    content.extend_from_slice(serial);
    Ok(der::encode(der::TAG_SEQUENCE, &content))
}

pub(crate) fn name_text(name: &X509NameRef) -> String {
    name.entries()
        .map(|entry| {
            let key = entry.object().nid().short_name().unwrap_or("?");
            let value = entry
                .data()
                .as_utf8()
                .map(|s| s.to_string())
                .unwrap_or_default();
            format!("{key}={value}")
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Email addresses from subjectAltName rfc822Name entries, falling back to a
/// subject CN or emailAddress that is itself an address.
pub(crate) fn cert_emails(cert: &X509Ref) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    if let Some(names) = cert.subject_alt_names() {
        for name in names.iter() {
            if let Some(email) = name.email() {
                push_email(email, &mut out);
            }
        }
    }
    if out.is_empty() {
        for nid in [Nid::COMMONNAME, Nid::PKCS9_EMAILADDRESS] {
            for entry in cert.subject_name().entries_by_nid(nid) {
                if let Ok(value) = entry.data().as_utf8() {
                    push_email(&value, &mut out);
                }
            }
        }
    }
    out
}

fn push_email(raw: &str, out: &mut Vec<String>) {
    let email = raw.trim().to_lowercase();
    if is_valid_email(&email) && !out.contains(&email) {
        out.push(email);
    }
}

fn asn1_to_system_time(time: &Asn1TimeRef) -> Result<SystemTime> {
    let epoch =
        Asn1Time::from_unix(0).map_err(|err| MailkeysError::backend("asn1 time failed", err))?;
    let diff = epoch
        .diff(time)
        .map_err(|err| MailkeysError::backend("asn1 time diff failed", err))?;
    let secs = i64::from(diff.days) * 86_400 + i64::from(diff.secs);
    Ok(if secs >= 0 {
        UNIX_EPOCH + Duration::from_secs(secs as u64)
    } else {
        UNIX_EPOCH
            .checked_sub(Duration::from_secs(secs.unsigned_abs()))
            .unwrap_or(UNIX_EPOCH)
    })
}

fn key_algo(pkey: &PKeyRef<Public>) -> KeyAlgo {
    let id = pkey.id();
    let (algorithm, curve) = if id == Id::RSA {
        ("RSA".to_string(), None)
    } else if id == Id::EC {
        let curve = pkey
            .ec_key()
            .ok()
            .and_then(|ec| ec.group().curve_name())
            .and_then(|nid| nid.short_name().ok().map(str::to_string));
        ("ECDSA".to_string(), curve)
    } else if id == Id::ED25519 {
        ("EdDSA".to_string(), Some("Ed25519".to_string()))
    } else if id == Id::DSA {
        ("DSA".to_string(), None)
    } else {
        (format!("pkey-{}", id.as_raw()), None)
    };
    KeyAlgo {
        algorithm,
        bits: Some(pkey.bits() as usize),
        curve,
    }
}

fn is_weak(pkey: &PKeyRef<Public>) -> bool {
    let id = pkey.id();
    (id == Id::RSA || id == Id::DSA) && (pkey.bits() as usize) < MIN_RSA_BITS
}

pub(crate) fn describe(material: &SmimeMaterial, now: SystemTime) -> Result<KeyInfo> {
    let cert = &material.cert;
    let id = thumbprint(cert)?;
    let pkey = cert
        .public_key()
        .map_err(|err| MailkeysError::backend("certificate public key failed", err))?;
    let not_before = asn1_to_system_time(cert.not_before())?;
    let not_after = asn1_to_system_time(cert.not_after())?;
    let emails = cert_emails(cert);

    let weak = is_weak(&pkey);
    let expired = now >= not_after;
    let usable = !weak && !emails.is_empty() && now >= not_before && !expired;
    let but_expired = !weak && !emails.is_empty() && expired;

    let identities = emails
        .iter()
        .enumerate()
        .map(|(idx, email)| Identity {
            user_id: email.clone(),
            email: Some(email.clone()),
            primary: idx == 0,
            valid: true,
            revoked: false,
        })
        .collect();

    let (is_private, locked) = match &material.private {
        None => (false, false),
        Some(PrivateMaterial::Unlocked(_)) => (true, false),
        Some(PrivateMaterial::Locked(_)) => (true, true),
    };

    Ok(KeyInfo {
        all_ids: vec![id.clone()],
        id,
        family: KeyFamily::X509,
        is_public: true,
        is_private,
        fully_decrypted: !locked,
        fully_encrypted: locked,
        created: to_millis(not_before),
        expiration: Some(to_millis(not_after)),
        // Revocation (CRL/OCSP) is not consulted.
        revoked: false,
        usable_for_encryption: usable,
        usable_for_signing: usable,
        usable_for_encryption_but_expired: but_expired,
        usable_for_signing_but_expired: but_expired,
        missing_private_key_for_decryption: false,
        missing_private_key_for_signing: false,
        emails,
        identities,
        algo: key_algo(&pkey),
        issuer_and_serial_number: Some(issuer_and_serial_number(cert)?),
    })
}

fn ensure_matches(cert: &X509Ref, pkey: &PKeyRef<Private>) -> Result<()> {
    let public = cert
        .public_key()
        .map_err(|err| MailkeysError::backend("certificate public key failed", err))?;
    if !public.public_eq(pkey) {
        return Err(MailkeysError::CertificateKeyMismatch);
    }
    Ok(())
}

fn build_key(cert: X509, private: Option<PrivateMaterial>) -> Result<Key> {
    if let Some(PrivateMaterial::Unlocked(pkey)) = &private {
        ensure_matches(&cert, pkey)?;
    }
    if cert_emails(&cert).is_empty() {
        return Err(MailkeysError::InvalidRecipientEmail(name_text(
            cert.subject_name(),
        )));
    }
    Key::from_smime(SmimeMaterial { cert, private })
}

fn private_from_block(block: &Armored) -> Result<PrivateMaterial> {
    match block.kind {
        ArmorKind::EncryptedPkcs8 => Ok(PrivateMaterial::Locked(armor::armor(
            ArmorKind::EncryptedPkcs8,
            &block.data,
        )?)),
        ArmorKind::RsaPrivateKey
            if block
                .headers
                .iter()
                .any(|(name, value)| name == "Proc-Type" && value.contains("ENCRYPTED")) =>
        {
            Err(MailkeysError::Unsupported(
                "legacy encrypted PEM keys; convert to encrypted PKCS#8".to_string(),
            ))
        }
        kind => {
            let pem = armor::armor(kind, &block.data)?;
            let pkey = PKey::private_key_from_pem(pem.as_bytes())
                .map_err(|err| MailkeysError::InvalidInput(format!("invalid private key: {err}")))?;
            Ok(PrivateMaterial::Unlocked(pkey))
        }
    }
}

/// A PEM certificate, optionally followed (or preceded) by its private key.
/// Additional certificates (a chain) are ignored.
pub(crate) fn parse_pem(text: &str) -> Result<Key> {
    let mut cert = None;
    let mut private = None;
    for block in armor::dearmor_all(text)? {
        if block.kind == ArmorKind::Certificate {
            if cert.is_none() {
                cert = Some(X509::from_der(&block.data).map_err(|err| {
                    MailkeysError::InvalidInput(format!("invalid certificate: {err}"))
                })?);
            }
        } else if block.kind.is_pem_private_key() && private.is_none() {
            private = Some(private_from_block(&block)?);
        }
    }
    let cert = cert.ok_or_else(|| {
        MailkeysError::InvalidInput("no certificate found next to the private key".to_string())
    })?;
    build_key(cert, private)
}

pub(crate) fn parse_der(bytes: &[u8]) -> Result<Key> {
    let cert = X509::from_der(bytes)
        .map_err(|err| MailkeysError::InvalidInput(format!("invalid certificate: {err}")))?;
    build_key(cert, None)
}

/// Opens a PKCS#12 bundle and returns its certificate with the (unlocked)
/// private key.
pub fn parse_pkcs12(bytes: &[u8], passphrase: &str) -> Result<Key> {
    let bundle = Pkcs12::from_der(bytes)
        .map_err(|err| MailkeysError::InvalidInput(format!("not a PKCS#12 bundle: {err}")))?;
    let parsed = bundle.parse2(passphrase).map_err(|_| {
        MailkeysError::InvalidInput("cannot open PKCS#12 bundle (wrong passphrase?)".to_string())
    })?;
    let cert = parsed.cert.ok_or_else(|| {
        MailkeysError::InvalidInput("PKCS#12 bundle has no certificate".to_string())
    })?;
    debug!(subject = %name_text(cert.subject_name()), "opened PKCS#12 bundle");
    build_key(cert, parsed.pkey.map(PrivateMaterial::Unlocked))
}

pub(crate) fn armor(material: &SmimeMaterial) -> Result<String> {
    let der = material
        .cert
        .to_der()
        .map_err(|err| MailkeysError::backend("certificate encoding failed", err))?;
    let mut out = armor::armor(ArmorKind::Certificate, &der)?;
    match &material.private {
        None => {}
        Some(PrivateMaterial::Unlocked(pkey)) => {
            let pem = pkey
                .private_key_to_pem_pkcs8()
                .map_err(|err| MailkeysError::backend("private key encoding failed", err))?;
            out.push_str(&String::from_utf8_lossy(&pem));
        }
        Some(PrivateMaterial::Locked(pem)) => out.push_str(pem),
    }
    Ok(out)
}

pub(crate) fn decrypt_private(
    material: &SmimeMaterial,
    passphrase: &str,
) -> Result<Option<SmimeMaterial>> {
    match &material.private {
        None => Err(MailkeysError::NotPrivate(thumbprint(&material.cert)?)),
        Some(PrivateMaterial::Unlocked(_)) => Ok(Some(material.clone())),
        Some(PrivateMaterial::Locked(pem)) => {
            match PKey::private_key_from_pem_passphrase(pem.as_bytes(), passphrase.as_bytes()) {
                Ok(pkey) => {
                    ensure_matches(&material.cert, &pkey)?;
                    Ok(Some(SmimeMaterial {
                        cert: material.cert.clone(),
                        private: Some(PrivateMaterial::Unlocked(pkey)),
                    }))
                }
                Err(_) => {
                    warn!("passphrase does not unlock PKCS#8 key");
                    Ok(None)
                }
            }
        }
    }
}

pub(crate) fn encrypt_private(material: &SmimeMaterial, passphrase: &str) -> Result<SmimeMaterial> {
    match &material.private {
        None => Err(MailkeysError::NotPrivate(thumbprint(&material.cert)?)),
        Some(PrivateMaterial::Locked(_)) => Ok(material.clone()),
        Some(PrivateMaterial::Unlocked(pkey)) => {
            let pem = pkey
                .private_key_to_pem_pkcs8_passphrase(Cipher::aes_256_cbc(), passphrase.as_bytes())
                .map_err(|err| MailkeysError::backend("private key encryption failed", err))?;
            Ok(SmimeMaterial {
                cert: material.cert.clone(),
                private: Some(PrivateMaterial::Locked(
                    String::from_utf8_lossy(&pem).into_owned(),
                )),
            })
        }
    }
}

fn unlocked_pkey(material: &SmimeMaterial) -> Result<&PKey<Private>> {
    match &material.private {
        Some(PrivateMaterial::Unlocked(pkey)) => Ok(pkey),
        Some(PrivateMaterial::Locked(_)) => {
            Err(MailkeysError::KeyLocked(thumbprint(&material.cert)?))
        }
        None => Err(MailkeysError::NotPrivate(thumbprint(&material.cert)?)),
    }
}

/// DER bytes of a PKCS#7 structure given as PEM text or DER.
pub(crate) fn pkcs7_der(input: &[u8]) -> Result<Vec<u8>> {
    if let Ok(text) = std::str::from_utf8(input)
        && armor::sniff(text) == Some(ArmorKind::Pkcs7)
    {
        return Ok(armor::dearmor(text)?.data);
    }
    Ok(input.to_vec())
}

pub(crate) fn looks_like_pkcs7(input: &[u8]) -> bool {
    match std::str::from_utf8(input).ok().and_then(armor::sniff) {
        Some(kind) => kind == ArmorKind::Pkcs7,
        None => input.first() == Some(&0x30) && Pkcs7::from_der(input).is_ok(),
    }
}

/// Encrypts `data` to every certificate, each at most once.
pub(crate) fn encrypt(certs: &[&X509], data: &[u8], armored: bool) -> Result<Vec<u8>> {
    let mut stack =
        Stack::new().map_err(|err| MailkeysError::backend("stack allocation failed", err))?;
    let mut seen: Vec<String> = Vec::new();
    for cert in certs {
        let id = thumbprint(cert)?;
        if seen.contains(&id) {
            continue;
        }
        seen.push(id);
        stack
            .push((*cert).clone())
            .map_err(|err| MailkeysError::backend("stack push failed", err))?;
    }
    let p7 = Pkcs7::encrypt(&stack, data, Cipher::aes_256_cbc(), Pkcs7Flags::BINARY)
        .map_err(|err| MailkeysError::backend("PKCS#7 encrypt failed", err))?;
    let der = p7
        .to_der()
        .map_err(|err| MailkeysError::backend("PKCS#7 encoding failed", err))?;
    debug!(recipients = seen.len(), "PKCS#7 enveloped data created");
    if armored {
        Ok(armor::armor(ArmorKind::Pkcs7, &der)?.into_bytes())
    } else {
        Ok(der)
    }
}

/// Hex IssuerAndSerialNumber of every recipient of an enveloped message.
pub(crate) fn recipient_longids(input: &[u8]) -> Result<Vec<String>> {
    let der = pkcs7_der(input)?;
    let ids = der::enveloped_recipient_ids(&der).ok_or_else(|| {
        MailkeysError::InvalidInput("not a PKCS#7 enveloped-data message".to_string())
    })?;
    Ok(ids.iter().map(hex::encode_upper).collect())
}

pub(crate) fn decrypt(input: &[u8], material: &SmimeMaterial) -> Result<Vec<u8>> {
    let pkey = unlocked_pkey(material)?;
    let der = pkcs7_der(input)?;
    let p7 = Pkcs7::from_der(&der)
        .map_err(|err| MailkeysError::InvalidInput(format!("invalid PKCS#7: {err}")))?;
    p7.decrypt(pkey, &material.cert, Pkcs7Flags::BINARY)
        .map_err(|err| MailkeysError::backend("PKCS#7 decrypt failed", err))
}

/// Detached PKCS#7 signature over `data`, PEM armored.
pub(crate) fn sign_detached(material: &SmimeMaterial, data: &[u8]) -> Result<String> {
    let pkey = unlocked_pkey(material)?;
    let extra = Stack::new().map_err(|err| MailkeysError::backend("stack allocation failed", err))?;
    let p7 = Pkcs7::sign(
        &material.cert,
        pkey,
        &extra,
        data,
        Pkcs7Flags::DETACHED | Pkcs7Flags::BINARY,
    )
    .map_err(|err| MailkeysError::backend("PKCS#7 sign failed", err))?;
    let der = p7
        .to_der()
        .map_err(|err| MailkeysError::backend("PKCS#7 encoding failed", err))?;
    armor::armor(ArmorKind::Pkcs7, &der)
}

/// Checks a detached PKCS#7 signature against the candidate certificates only;
/// certificates embedded in the signature are not trusted.
pub(crate) fn verify_detached(signature: &[u8], data: &[u8], candidates: &[&X509]) -> VerifyResult {
    let p7 = match pkcs7_der(signature).and_then(|der| {
        Pkcs7::from_der(&der)
            .map_err(|err| MailkeysError::InvalidInput(format!("invalid PKCS#7: {err}")))
    }) {
        Ok(p7) => p7,
        Err(err) => return VerifyResult::fatal(err.to_string()),
    };
    let stack = match candidate_stack(candidates) {
        Ok(stack) => stack,
        Err(err) => return VerifyResult::fatal(err.to_string()),
    };
    let signers = match p7.signers(&stack, Pkcs7Flags::empty()) {
        Ok(signers) => signers,
        Err(err) => return VerifyResult::fatal(format!("cannot read signers: {err}")),
    };

    let mut result = VerifyResult::default();
    let mut signer_fingerprint = None;
    for signer in signers.iter() {
        if let Ok(isn) = issuer_and_serial_number(signer) {
            result.signer_longids.push(hex::encode_upper(isn));
        }
        let Ok(id) = thumbprint(signer) else {
            continue;
        };
        if candidates
            .iter()
            .any(|c| thumbprint(c).is_ok_and(|cid| cid == id))
        {
            signer_fingerprint = Some(id);
        }
    }
    let Some(signer_fingerprint) = signer_fingerprint else {
        return result;
    };

    let store = match X509StoreBuilder::new() {
        Ok(builder) => builder.build(),
        Err(err) => return VerifyResult::fatal(format!("store failed: {err}")),
    };
    match p7.verify(
        &stack,
        &store,
        Some(data),
        None,
        Pkcs7Flags::NOVERIFY | Pkcs7Flags::NOINTERN | Pkcs7Flags::BINARY,
    ) {
        Ok(()) => {
            result.matched = Some(true);
            result.signer_fingerprint = Some(signer_fingerprint);
        }
        Err(err) => {
            result.matched = Some(false);
            result.error = Some(format!("signature does not verify: {err}"));
        }
    }
    result
}

fn candidate_stack(candidates: &[&X509]) -> Result<Stack<X509>> {
    let mut stack =
        Stack::new().map_err(|err| MailkeysError::backend("stack allocation failed", err))?;
    for cert in candidates {
        stack
            .push((*cert).clone())
            .map_err(|err| MailkeysError::backend("stack push failed", err))?;
    }
    Ok(stack)
}
