//! Support diagnostics: an ordered key/value trace of what a key contains and
//! whether it actually works.

use std::fmt;

use mailkeys_core::{KeyFamily, sanitize_for_terminal};
use openpgp::cert::amalgamation::ValidateAmalgamation;
use openpgp::policy::StandardPolicy;
use openpgp::types::KeyFlags;
use sequoia_openpgp as openpgp;

use crate::key::{Key, KeyMaterial, decrypt_key, to_millis};
use crate::msg::{
    DecryptOptions, DecryptResult, EncryptOptions, PrvKeyInfo, decrypt_message, encrypt_message,
    sign, verify_detached,
};
use crate::pgp::key_algo;
use crate::smime::{self, PrivateMaterial};

const SAMPLE: &[u8] = b"mailkeys diagnostic sample";

/// Ordered diagnostic entries. Failures are entries too.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyDiagnosis {
    entries: Vec<(String, String)>,
}

impl KeyDiagnosis {
    fn push(&mut self, name: impl Into<String>, value: impl fmt::Display) {
        self.entries.push((name.into(), value.to_string()));
    }

    pub fn entries(&self) -> &[(String, String)] {
        &self.entries
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

impl fmt::Display for KeyDiagnosis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.entries {
            writeln!(f, "{name}: {value}")?;
        }
        Ok(())
    }
}

fn flags_text(flags: Option<KeyFlags>) -> String {
    let Some(flags) = flags else {
        return "none".to_string();
    };
    let mut out = String::new();
    if flags.for_certification() {
        out.push('C');
    }
    if flags.for_signing() {
        out.push('S');
    }
    if flags.for_transport_encryption() || flags.for_storage_encryption() {
        out.push('E');
    }
    if flags.for_authentication() {
        out.push('A');
    }
    if out.is_empty() {
        out.push('-');
    }
    out
}

/// Describes `key` and exercises it: unlocking with `passphrase`, then a
/// sign/verify and an encrypt/decrypt round trip when private material is
/// available. Never fails.
pub fn diagnose(key: &Key, passphrase: Option<&str>) -> KeyDiagnosis {
    let mut report = KeyDiagnosis::default();
    let info = key.info();
    report.push("family", key.family());
    report.push("id", &info.id);
    report.push("algo", &info.algo);
    report.push("created", info.created);
    report.push(
        "expiration",
        info.expiration
            .map_or_else(|| "never".to_string(), |t| t.to_string()),
    );
    report.push("is_private", info.is_private);
    report.push("fully_decrypted", info.fully_decrypted);
    report.push("fully_encrypted", info.fully_encrypted);
    report.push("revoked", info.revoked);
    report.push("usable_for_encryption", info.usable_for_encryption);
    report.push("usable_for_signing", info.usable_for_signing);
    report.push(
        "usable_for_encryption_but_expired",
        info.usable_for_encryption_but_expired,
    );
    report.push(
        "usable_for_signing_but_expired",
        info.usable_for_signing_but_expired,
    );
    report.push("emails", info.emails.join(", "));

    match key.material() {
        KeyMaterial::OpenPgp(cert) => describe_openpgp(cert, &mut report),
        KeyMaterial::X509(material) => describe_x509(material, &mut report),
    }

    if !key.is_private() {
        return report;
    }
    let mut unlocked = key.clone();
    if !unlocked.fully_decrypted() {
        match passphrase {
            None => {
                report.push("decrypt_key", "skipped: no passphrase");
                return report;
            }
            Some(passphrase) => match decrypt_key(&mut unlocked, passphrase) {
                Ok(true) => report.push("decrypt_key", "ok"),
                Ok(false) => {
                    report.push("decrypt_key", "wrong passphrase");
                    return report;
                }
                Err(err) => {
                    report.push("decrypt_key", format!("error: {err}"));
                    return report;
                }
            },
        }
    }
    round_trips(&unlocked, &mut report);
    report
}

fn describe_openpgp(cert: &openpgp::Cert, report: &mut KeyDiagnosis) {
    let policy = StandardPolicy::new();
    for (idx, ua) in cert.userids().enumerate() {
        let text = String::from_utf8_lossy(ua.userid().value()).into_owned();
        report.push(format!("user[{idx}]"), sanitize_for_terminal(&text));
    }
    report.push(
        "primary.verify",
        match cert.with_policy(&policy, None) {
            Ok(_) => "valid".to_string(),
            Err(err) => format!("invalid: {err}"),
        },
    );
    report.push(
        "primary.secret",
        secret_state(cert.primary_key().key().optional_secret()),
    );

    for (idx, ka) in cert.keys().subkeys().enumerate() {
        let key = ka.key();
        let prefix = format!("subkey[{idx}]");
        report.push(format!("{prefix}.fingerprint"), key.fingerprint());
        report.push(format!("{prefix}.algo"), key_algo(key));
        report.push(
            format!("{prefix}.created"),
            to_millis(key.creation_time()),
        );
        report.push(
            format!("{prefix}.secret"),
            secret_state(key.optional_secret()),
        );
        match ka.with_policy(&policy, None) {
            Ok(valid) => {
                report.push(format!("{prefix}.flags"), flags_text(valid.key_flags()));
                report.push(format!("{prefix}.binding"), "valid");
            }
            Err(err) => report.push(format!("{prefix}.binding"), format!("invalid: {err}")),
        }
    }
}

fn secret_state(secret: Option<&openpgp::packet::key::SecretKeyMaterial>) -> &'static str {
    match secret {
        None => "missing",
        Some(secret) if secret.is_encrypted() => "encrypted",
        Some(_) => "unencrypted",
    }
}

fn describe_x509(material: &smime::SmimeMaterial, report: &mut KeyDiagnosis) {
    let cert = &material.cert;
    report.push(
        "subject",
        sanitize_for_terminal(&smime::name_text(cert.subject_name())),
    );
    report.push(
        "issuer",
        sanitize_for_terminal(&smime::name_text(cert.issuer_name())),
    );
    report.push(
        "serial",
        cert.serial_number()
            .to_bn()
            .and_then(|bn| bn.to_hex_str().map(|s| s.to_string()))
            .unwrap_or_else(|err| format!("error: {err}")),
    );
    report.push("not_before", cert.not_before());
    report.push("not_after", cert.not_after());
    match smime::issuer_and_serial_number(cert) {
        Ok(isn) => report.push("issuer_and_serial_number", hex::encode_upper(isn)),
        Err(err) => report.push("issuer_and_serial_number", format!("error: {err}")),
    }
    report.push(
        "private",
        match &material.private {
            None => "missing",
            Some(PrivateMaterial::Locked(_)) => "encrypted",
            Some(PrivateMaterial::Unlocked(_)) => "unencrypted",
        },
    );
}

fn round_trips(key: &Key, report: &mut KeyDiagnosis) {
    let public = match key.to_public() {
        Ok(public) => public,
        Err(err) => {
            report.push("public", format!("error: {err}"));
            return;
        }
    };

    let sign_verify = match sign(key, SAMPLE, true) {
        Ok(signature) => {
            let result = verify_detached(SAMPLE, signature.as_bytes(), std::slice::from_ref(&public));
            match (result.matched, result.error) {
                (Some(true), _) => "ok".to_string(),
                (matched, error) => format!(
                    "failed: match={matched:?} error={}",
                    error.unwrap_or_default()
                ),
            }
        }
        Err(err) => format!("sign error: {err}"),
    };
    report.push("sign_verify", sign_verify);

    let encrypt_decrypt = match encrypt_message(&EncryptOptions {
        pubkeys: std::slice::from_ref(&public),
        data: SAMPLE,
        armor: true,
        signing_key: None,
    }) {
        Ok(encrypted) => {
            let data = match key.family() {
                KeyFamily::OpenPgp => encrypted.openpgp,
                KeyFamily::X509 => encrypted.smime,
            }
            .unwrap_or_default();
            let keys = [PrvKeyInfo {
                key: key.clone(),
                passphrase: None,
            }];
            match decrypt_message(&DecryptOptions {
                keys: &keys,
                encrypted_data: &data,
                ..DecryptOptions::default()
            }) {
                DecryptResult::Success(success) if success.content == SAMPLE => "ok".to_string(),
                DecryptResult::Success(_) => "failed: content mismatch".to_string(),
                DecryptResult::Error(err) => format!("failed: {} {}", err.kind, err.message),
            }
        }
        Err(err) => format!("encrypt error: {err}"),
    };
    report.push("encrypt_decrypt", encrypt_decrypt);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pgp::{self, KeyGenOptions};

    fn generated(passphrase: Option<&str>) -> Key {
        pgp::create(&KeyGenOptions {
            user_ids: vec!["Diag <diag@example.com>".to_string()],
            passphrase: passphrase.map(str::to_string),
            ..KeyGenOptions::default()
        })
        .expect("keygen")
        .key
    }

    #[test]
    fn healthy_key_passes_round_trips() {
        let report = diagnose(&generated(Some("pp")), Some("pp"));
        assert_eq!(report.get("family"), Some("openpgp"));
        assert_eq!(report.get("decrypt_key"), Some("ok"));
        assert_eq!(report.get("sign_verify"), Some("ok"));
        assert_eq!(report.get("encrypt_decrypt"), Some("ok"));
        assert_eq!(report.get("subkey[0].binding"), Some("valid"));
        assert_eq!(report.entries()[0].0, "family");
    }

    #[test]
    fn wrong_passphrase_is_an_entry() {
        let report = diagnose(&generated(Some("pp")), Some("nope"));
        assert_eq!(report.get("decrypt_key"), Some("wrong passphrase"));
        assert!(report.get("sign_verify").is_none());
    }

    #[test]
    fn public_key_skips_round_trips() {
        let public = generated(None).to_public().expect("public");
        let report = diagnose(&public, None);
        assert_eq!(report.get("is_private"), Some("false"));
        assert_eq!(report.get("primary.secret"), Some("missing"));
        assert!(report.get("encrypt_decrypt").is_none());
        assert!(report.to_string().contains("primary.verify: valid"));
    }

    #[test]
    fn report_is_deterministic() {
        let key = generated(None);
        let first: Vec<String> = diagnose(&key, None)
            .entries()
            .iter()
            .map(|(n, _)| n.clone())
            .collect();
        let second: Vec<String> = diagnose(&key, None)
            .entries()
            .iter()
            .map(|(n, _)| n.clone())
            .collect();
        assert_eq!(first, second);
    }
}
