use mailkeys_core::{KeyAlgo, KeyFamily, KeyPreset, sanitize_for_terminal};

#[test]
fn default_preset_is_curve25519() {
    assert_eq!(KeyPreset::default(), KeyPreset::Curve25519);
    assert_eq!("RSA4096".parse::<KeyPreset>().expect("preset"), KeyPreset::Rsa4096);
    assert!("dsa1024".parse::<KeyPreset>().is_err());
}

#[test]
fn family_names() {
    assert_eq!(KeyFamily::OpenPgp.to_string(), "openpgp");
    assert_eq!(KeyFamily::X509.as_str(), "x509");
}

#[test]
fn algo_display_includes_bits_and_curve() {
    let rsa = KeyAlgo {
        algorithm: "RSA".into(),
        bits: Some(2048),
        curve: None,
    };
    assert_eq!(rsa.to_string(), "RSA 2048");
    let ecc = KeyAlgo {
        algorithm: "EdDSA".into(),
        bits: Some(256),
        curve: Some("Ed25519".into()),
    };
    assert_eq!(ecc.to_string(), "EdDSA 256 (Ed25519)");
}

#[test]
fn sanitize_escapes_control_characters() {
    assert_eq!(sanitize_for_terminal("a\x1b[31mb"), "a\\x1B[31mb");
    assert_eq!(sanitize_for_terminal("line\nbreak"), "line break");
}
