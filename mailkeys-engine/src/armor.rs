//! ASCII armor for OpenPGP (RFC 4880 radix-64 with CRC-24) and PEM (RFC 7468).

use std::io::{Read, Write};

use base64::{Engine, engine::general_purpose};
use mailkeys_core::{MailkeysError, Result};
use openpgp::armor::{Kind as PgpArmorKind, Reader as ArmorReader, ReaderMode, Writer as ArmorWriter};
use sequoia_openpgp as openpgp;

const LINE_WIDTH: usize = 64;
const BEGIN_PREFIX: &str = "-----BEGIN ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArmorKind {
    PublicKey,
    PrivateKey,
    Message,
    SignedMessage,
    Signature,
    Certificate,
    Pkcs7,
    Pkcs8,
    EncryptedPkcs8,
    RsaPrivateKey,
}

impl ArmorKind {
    pub const ALL: [ArmorKind; 10] = [
        ArmorKind::PublicKey,
        ArmorKind::PrivateKey,
        ArmorKind::Message,
        ArmorKind::SignedMessage,
        ArmorKind::Signature,
        ArmorKind::Certificate,
        ArmorKind::Pkcs7,
        ArmorKind::Pkcs8,
        ArmorKind::EncryptedPkcs8,
        ArmorKind::RsaPrivateKey,
    ];

    pub fn label(self) -> &'static str {
        match self {
            ArmorKind::PublicKey => "PGP PUBLIC KEY BLOCK",
            ArmorKind::PrivateKey => "PGP PRIVATE KEY BLOCK",
            ArmorKind::Message => "PGP MESSAGE",
            ArmorKind::SignedMessage => "PGP SIGNED MESSAGE",
            ArmorKind::Signature => "PGP SIGNATURE",
            ArmorKind::Certificate => "CERTIFICATE",
            ArmorKind::Pkcs7 => "PKCS7",
            ArmorKind::Pkcs8 => "PRIVATE KEY",
            ArmorKind::EncryptedPkcs8 => "ENCRYPTED PRIVATE KEY",
            ArmorKind::RsaPrivateKey => "RSA PRIVATE KEY",
        }
    }

    pub fn from_label(label: &str) -> Option<ArmorKind> {
        ArmorKind::ALL.into_iter().find(|k| k.label() == label)
    }

    pub fn begin_marker(self) -> String {
        format!("-----BEGIN {}-----", self.label())
    }

    /// A clear-signed message ends with the trailing signature block.
    pub fn end_marker(self) -> String {
        match self {
            ArmorKind::SignedMessage => ArmorKind::Signature.end_marker(),
            other => format!("-----END {}-----", other.label()),
        }
    }

    /// Whether the block carries OpenPGP radix-64 (headers + CRC-24).
    pub fn is_openpgp(self) -> bool {
        matches!(
            self,
            ArmorKind::PublicKey
                | ArmorKind::PrivateKey
                | ArmorKind::Message
                | ArmorKind::SignedMessage
                | ArmorKind::Signature
        )
    }

    pub fn is_openpgp_key(self) -> bool {
        matches!(self, ArmorKind::PublicKey | ArmorKind::PrivateKey)
    }

    pub fn is_pem_private_key(self) -> bool {
        matches!(
            self,
            ArmorKind::Pkcs8 | ArmorKind::EncryptedPkcs8 | ArmorKind::RsaPrivateKey
        )
    }

    /// Sequoia's armor kind for the radix-64 kinds that have a binary form.
    fn sequoia_kind(self) -> Option<PgpArmorKind> {
        match self {
            ArmorKind::PublicKey => Some(PgpArmorKind::PublicKey),
            ArmorKind::PrivateKey => Some(PgpArmorKind::SecretKey),
            ArmorKind::Message => Some(PgpArmorKind::Message),
            ArmorKind::Signature => Some(PgpArmorKind::Signature),
            _ => None,
        }
    }

    /// Kind of the begin line that `text` starts with. Only trailing
    /// whitespace may follow the marker on its line, and nothing past the
    /// marker's line is read.
    pub fn begin_line_at(text: &str) -> Option<ArmorKind> {
        let rest = text.strip_prefix(BEGIN_PREFIX)?;
        ArmorKind::ALL.into_iter().find(|kind| {
            rest.strip_prefix(kind.label())
                .and_then(|after| after.strip_prefix("-----"))
                .is_some_and(|after| {
                    let after = after.trim_start_matches([' ', '\t', '\r']);
                    after.is_empty() || after.starts_with('\n')
                })
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Armored {
    pub kind: ArmorKind,
    pub headers: Vec<(String, String)>,
    pub data: Vec<u8>,
}

/// Wraps `data` in begin/end markers. OpenPGP kinds go through sequoia's
/// armor writer and carry a CRC-24 trailer; PEM kinds are plain RFC 7468.
pub fn armor(kind: ArmorKind, data: &[u8]) -> Result<String> {
    if kind == ArmorKind::SignedMessage {
        return Err(MailkeysError::InvalidInput(
            "clear-signed messages are produced by the signer, not the armor codec".to_string(),
        ));
    }
    if data.is_empty() {
        return Err(MailkeysError::InvalidInput("nothing to armor".to_string()));
    }
    match kind.sequoia_kind() {
        Some(pgp_kind) => armor_openpgp(pgp_kind, data),
        None => Ok(armor_pem(kind, data)),
    }
}

fn armor_openpgp(kind: PgpArmorKind, data: &[u8]) -> Result<String> {
    let mut writer = ArmorWriter::new(Vec::new(), kind)
        .map_err(|err| MailkeysError::backend("armor failed", err))?;
    writer
        .write_all(data)
        .map_err(|err| MailkeysError::backend("armor failed", err))?;
    let bytes = writer
        .finalize()
        .map_err(|err| MailkeysError::backend("armor finalize failed", err))?;
    String::from_utf8(bytes).map_err(|err| MailkeysError::backend("armor failed", err))
}

fn armor_pem(kind: ArmorKind, data: &[u8]) -> String {
    let encoded = general_purpose::STANDARD.encode(data);
    let mut out = String::with_capacity(encoded.len() + encoded.len() / LINE_WIDTH + 64);
    out.push_str(&kind.begin_marker());
    out.push('\n');
    for chunk in encoded.as_bytes().chunks(LINE_WIDTH) {
        out.push_str(&String::from_utf8_lossy(chunk));
        out.push('\n');
    }
    out.push_str(&kind.end_marker());
    out.push('\n');
    out
}

/// Decodes the first armored block found in `text`.
pub fn dearmor(text: &str) -> Result<Armored> {
    dearmor_from(text, 0).map(|(armored, _)| armored)
}

/// Decodes every armored block in `text`, in order.
pub fn dearmor_all(text: &str) -> Result<Vec<Armored>> {
    let mut out = Vec::new();
    let mut pos = 0;
    while find_begin(text, pos).is_some() {
        let (armored, end) = dearmor_from(text, pos)?;
        out.push(armored);
        pos = end;
    }
    if out.is_empty() {
        return Err(MailkeysError::MalformedArmor(
            "missing begin marker".to_string(),
        ));
    }
    Ok(out)
}

/// Kind of the first known begin marker in `text`.
pub fn sniff(text: &str) -> Option<ArmorKind> {
    find_begin(text, 0).map(|(_, kind)| kind)
}

/// Returns `text` from the first known begin marker onwards, so a partially
/// pasted block can be recovered from surrounding chatter.
pub fn clip_incomplete(text: &str) -> Option<&str> {
    find_begin(text, 0).map(|(start, _)| &text[start..])
}

fn find_begin(text: &str, from: usize) -> Option<(usize, ArmorKind)> {
    let mut search = from;
    while let Some(rel) = text.get(search..)?.find(BEGIN_PREFIX) {
        let start = search + rel;
        if let Some(kind) = ArmorKind::begin_line_at(&text[start..]) {
            return Some((start, kind));
        }
        search = start + BEGIN_PREFIX.len();
    }
    None
}

fn is_base64_line(line: &str) -> bool {
    line.bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'='))
}

/// Structure of one armored block.
struct Frame<'a> {
    /// Offset just past the end marker.
    end: usize,
    headers: Vec<(String, String)>,
    /// Base64 body lines joined.
    body: String,
    /// The `=XXXX` line of an OpenPGP block, without the `=`.
    checksum: Option<&'a str>,
}

/// Checks the block structure starting at `start`.
fn frame(text: &str, start: usize, kind: ArmorKind) -> Result<Frame<'_>> {
    let end_marker = kind.end_marker();
    let mut headers = Vec::new();
    let mut body = String::new();
    let mut checksum = None;
    let mut in_headers = true;
    let mut offset = start;

    let mut lines = text[start..].split_inclusive('\n');
    // Skip the begin line itself.
    if let Some(first) = lines.next() {
        offset += first.len();
    }
    for raw in lines {
        let line_start = offset;
        offset += raw.len();
        let line = raw.trim_end_matches(['\n', '\r']).trim_end();

        if line.starts_with("-----END ") {
            if line != end_marker {
                return Err(MailkeysError::MalformedArmor(format!(
                    "end marker {line:?} does not match {:?}",
                    kind.begin_marker()
                )));
            }
            let end = line_start + raw.trim_end_matches(['\n', '\r']).len();
            return Ok(Frame {
                end,
                headers,
                body,
                checksum,
            });
        }
        if line.starts_with(BEGIN_PREFIX) {
            return Err(MailkeysError::MalformedArmor(
                "begin marker inside armored block".to_string(),
            ));
        }
        if in_headers {
            if line.is_empty() {
                in_headers = false;
                continue;
            }
            if let Some((name, value)) = line.split_once(": ")
                && !name.is_empty()
                && !name.contains(' ')
            {
                headers.push((name.to_string(), value.to_string()));
                continue;
            }
            in_headers = false;
        }
        if line.is_empty() {
            continue;
        }
        if !is_base64_line(line) {
            return Err(MailkeysError::MalformedArmor(
                "invalid base64 character".to_string(),
            ));
        }
        if kind.is_openpgp() && line.len() == 5 && line.starts_with('=') {
            checksum = Some(&line[1..]);
            continue;
        }
        if checksum.is_some() {
            return Err(MailkeysError::MalformedArmor(
                "data after checksum line".to_string(),
            ));
        }
        body.push_str(line);
    }
    Err(MailkeysError::MalformedArmor(format!(
        "missing end marker {end_marker:?}"
    )))
}

fn dearmor_from(text: &str, from: usize) -> Result<(Armored, usize)> {
    let (start, kind) = find_begin(text, from)
        .ok_or_else(|| MailkeysError::MalformedArmor("missing begin marker".to_string()))?;
    if kind == ArmorKind::SignedMessage {
        return Err(MailkeysError::MalformedArmor(
            "clear-signed message has no binary form".to_string(),
        ));
    }
    let Some(pgp_kind) = kind.sequoia_kind() else {
        let frame = frame(text, start, kind)?;
        let data = general_purpose::STANDARD
            .decode(frame.body.as_bytes())
            .map_err(|err| MailkeysError::MalformedArmor(format!("invalid base64: {err}")))?;
        return finish(kind, frame.headers, data, frame.end);
    };

    let frame = frame(text, start, kind)?;
    let end = frame.end;
    let mut reader = ArmorReader::from_bytes(
        text[start..end].as_bytes(),
        ReaderMode::Tolerant(Some(pgp_kind)),
    );
    let mut data = Vec::new();
    reader
        .read_to_end(&mut data)
        .map_err(|err| MailkeysError::MalformedArmor(format!("invalid armor: {err}")))?;
    let headers = reader
        .headers()
        .map_err(|err| MailkeysError::MalformedArmor(format!("invalid armor headers: {err}")))?
        .to_vec();
    if let Some(expected) = frame.checksum
        && !data.is_empty()
        && checksum_of(pgp_kind, &data)?.as_deref() != Some(expected)
    {
        return Err(MailkeysError::MalformedArmor(
            "checksum mismatch".to_string(),
        ));
    }
    finish(kind, headers, data, end)
}

/// CRC-24 line sequoia writes for `data`, without the `=`.
fn checksum_of(kind: PgpArmorKind, data: &[u8]) -> Result<Option<String>> {
    let armored = armor_openpgp(kind, data)?;
    Ok(armored
        .lines()
        .find(|line| line.len() == 5 && line.starts_with('='))
        .map(|line| line[1..].to_string()))
}

fn finish(
    kind: ArmorKind,
    headers: Vec<(String, String)>,
    data: Vec<u8>,
    end: usize,
) -> Result<(Armored, usize)> {
    if data.is_empty() {
        return Err(MailkeysError::MalformedArmor("empty armored block".to_string()));
    }
    Ok((
        Armored {
            kind,
            headers,
            data,
        },
        end,
    ))
}
