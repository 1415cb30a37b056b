#![allow(dead_code)]

use std::time::{SystemTime, UNIX_EPOCH};

use mailkeys_engine::pgp::{self, GeneratedKey, KeyGenOptions};
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::extension::SubjectAlternativeName;
use openssl::x509::{X509, X509NameBuilder};

pub fn pgp_key(email: &str, passphrase: Option<&str>) -> GeneratedKey {
    pgp::create(&KeyGenOptions {
        user_ids: vec![format!("Test <{email}>")],
        passphrase: passphrase.map(str::to_string),
        ..KeyGenOptions::default()
    })
    .expect("keygen")
}

/// Options for a self-signed test certificate.
pub struct CertSpec<'a> {
    pub common_name: &'a str,
    pub san_email: Option<&'a str>,
    pub serial: i64,
    pub rsa_bits: u32,
    /// Validity relative to now, in days.
    pub not_before_days: i64,
    pub not_after_days: i64,
}

impl Default for CertSpec<'_> {
    fn default() -> Self {
        Self {
            common_name: "Test Person",
            san_email: Some("person@example.com"),
            serial: 1,
            rsa_bits: 2048,
            not_before_days: -1,
            not_after_days: 30,
        }
    }
}

fn asn1_days_from_now(days: i64) -> Asn1Time {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_secs() as i64;
    Asn1Time::from_unix(now + days * 86_400).expect("asn1 time")
}

pub fn x509(opts: &CertSpec<'_>) -> (X509, PKey<Private>) {
    let pkey = PKey::from_rsa(Rsa::generate(opts.rsa_bits).expect("rsa")).expect("pkey");
    let mut name = X509NameBuilder::new().expect("name");
    name.append_entry_by_nid(Nid::COMMONNAME, opts.common_name)
        .expect("cn");
    let name = name.build();
    let mut builder = X509::builder().expect("builder");
    builder.set_version(2).expect("version");
    let serial = BigNum::from_dec_str(&opts.serial.to_string())
        .and_then(|bn| bn.to_asn1_integer())
        .expect("serial");
    builder.set_serial_number(&serial).expect("serial");
    builder.set_subject_name(&name).expect("subject");
    builder.set_issuer_name(&name).expect("issuer");
    builder.set_pubkey(&pkey).expect("pubkey");
    builder
        .set_not_before(&asn1_days_from_now(opts.not_before_days))
        .expect("not before");
    builder
        .set_not_after(&asn1_days_from_now(opts.not_after_days))
        .expect("not after");
    if let Some(email) = opts.san_email {
        let san = SubjectAlternativeName::new()
            .email(email)
            .build(&builder.x509v3_context(None, None))
            .expect("san");
        builder.append_extension(san).expect("extension");
    }
    builder.sign(&pkey, MessageDigest::sha256()).expect("sign");
    (builder.build(), pkey)
}

pub fn cert_pem(cert: &X509) -> String {
    String::from_utf8(cert.to_pem().expect("pem")).expect("utf8")
}

pub fn cert_and_key_pem(cert: &X509, pkey: &PKey<Private>) -> String {
    cert_pem(cert)
        + &String::from_utf8(pkey.private_key_to_pem_pkcs8().expect("pkcs8")).expect("utf8")
}

pub fn pkcs12(cert: &X509, pkey: &PKey<Private>, passphrase: &str) -> Vec<u8> {
    Pkcs12::builder()
        .name("test")
        .pkey(pkey)
        .cert(cert)
        .build2(passphrase)
        .expect("pkcs12")
        .to_der()
        .expect("der")
}

pub fn thumbprint(cert: &X509) -> String {
    hex::encode_upper(&*cert.digest(MessageDigest::sha1()).expect("digest"))
}

pub fn squash(text: &str) -> String {
    text.chars().filter(|c| !c.is_whitespace()).collect()
}
