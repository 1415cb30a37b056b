mod common;

use common::{CertSpec, cert_pem, pgp_key, x509};
use mailkeys_engine::blocks::{BlockType, detect_blocks};
use mailkeys_engine::msg::{EncryptOptions, encrypt_message, sign};

fn kinds(text: &str) -> Vec<BlockType> {
    detect_blocks(text).blocks.iter().map(|b| b.kind).collect()
}

fn mail_body() -> String {
    let alice = pgp_key("alice@example.com", None);
    let encrypted = encrypt_message(&EncryptOptions {
        pubkeys: std::slice::from_ref(&alice.key),
        data: b"inner",
        armor: true,
        signing_key: None,
    })
    .expect("encrypt")
    .openpgp
    .expect("openpgp");
    let signed = sign(&alice.key, b"clear text\n", false).expect("sign");
    let (cert, _) = x509(&CertSpec::default());
    format!(
        "Hello,\r\n\r\nmy key:\r\n{}{}\r\nA message:\n{}\nSigned:\n{}\nand a cert\n{}-- \nbye",
        alice.public,
        alice.public,
        String::from_utf8(encrypted).expect("utf8"),
        signed,
        cert_pem(&cert)
    )
}

#[test]
fn blocks_cover_normalized_text_exactly() {
    let detected = detect_blocks(&mail_body());
    let rebuilt: String = detected.blocks.iter().map(|b| b.content.as_str()).collect();
    assert_eq!(rebuilt, detected.normalized);
    let mut offset = 0;
    for block in &detected.blocks {
        assert_eq!(block.range.start, offset);
        offset = block.range.end;
    }
    assert_eq!(offset, detected.normalized.len());
}

#[test]
fn detection_is_idempotent_on_normalized_text() {
    let first = detect_blocks(&mail_body());
    let second = detect_blocks(&first.normalized);
    assert_eq!(first, second);
}

#[test]
fn back_to_back_blocks_are_each_recognized() {
    let found: Vec<BlockType> = kinds(&mail_body())
        .into_iter()
        .filter(|k| *k != BlockType::PlainText)
        .collect();
    assert_eq!(
        found,
        vec![
            BlockType::PublicKey,
            BlockType::PublicKey,
            BlockType::EncryptedMsg,
            BlockType::SignedMsg,
            BlockType::Certificate,
        ]
    );
}

#[test]
fn corrupted_armor_stays_plain_text() {
    let alice = pgp_key("alice@example.com", None);
    let corrupted = alice.public.replacen('A', "*", 1);
    let text = format!("see:\n{corrupted}");
    assert_eq!(kinds(&text), vec![BlockType::PlainText]);
}
