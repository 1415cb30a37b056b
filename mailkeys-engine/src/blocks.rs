//! Splits free text (an email body) into plain text and armored blocks.

use std::ops::Range;

use crate::armor::{self, ArmorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    PlainText,
    PublicKey,
    PrivateKey,
    Certificate,
    SignedMsg,
    EncryptedMsg,
    Signature,
}

impl BlockType {
    pub fn as_str(self) -> &'static str {
        match self {
            BlockType::PlainText => "plainText",
            BlockType::PublicKey => "publicKey",
            BlockType::PrivateKey => "privateKey",
            BlockType::Certificate => "certificate",
            BlockType::SignedMsg => "signedMsg",
            BlockType::EncryptedMsg => "encryptedMsg",
            BlockType::Signature => "signature",
        }
    }

    fn from_armor(kind: ArmorKind) -> BlockType {
        match kind {
            ArmorKind::PublicKey => BlockType::PublicKey,
            ArmorKind::PrivateKey
            | ArmorKind::Pkcs8
            | ArmorKind::EncryptedPkcs8
            | ArmorKind::RsaPrivateKey => BlockType::PrivateKey,
            ArmorKind::Certificate => BlockType::Certificate,
            ArmorKind::Message | ArmorKind::Pkcs7 => BlockType::EncryptedMsg,
            ArmorKind::SignedMessage => BlockType::SignedMsg,
            ArmorKind::Signature => BlockType::Signature,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgBlock {
    pub kind: BlockType,
    /// Armor type of non-plain blocks.
    pub armor: Option<ArmorKind>,
    /// Byte range within the normalized text.
    pub range: Range<usize>,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedBlocks {
    pub blocks: Vec<MsgBlock>,
    pub normalized: String,
}

/// Converts CRLF to LF and non-breaking spaces to plain spaces.
pub fn normalize(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\u{a0}', " ")
}

/// Normalizes `text` and splits it into consecutive blocks that together
/// cover it exactly. Armored blocks are only recognized when the begin marker
/// starts a line, a matching end marker follows, and the content decodes.
pub fn detect_blocks(text: &str) -> DetectedBlocks {
    let normalized = normalize(text);
    let blocks = BlockIter::new(&normalized).collect();
    DetectedBlocks { blocks, normalized }
}

/// Lazy block iterator over already normalized text.
pub struct BlockIter<'a> {
    text: &'a str,
    pos: usize,
    pending: Option<MsgBlock>,
}

impl<'a> BlockIter<'a> {
    pub fn new(text: &'a str) -> Self {
        Self {
            text,
            pos: 0,
            pending: None,
        }
    }

    fn block(&self, kind: BlockType, armor: Option<ArmorKind>, range: Range<usize>) -> MsgBlock {
        MsgBlock {
            kind,
            armor,
            content: self.text[range.clone()].to_string(),
            range,
        }
    }
}

impl Iterator for BlockIter<'_> {
    type Item = MsgBlock;

    fn next(&mut self) -> Option<MsgBlock> {
        if let Some(block) = self.pending.take() {
            return Some(block);
        }
        if self.pos >= self.text.len() {
            return None;
        }
        let start = self.pos;
        match find_armored(self.text, start) {
            Some((range, kind)) => {
                self.pos = range.end;
                let armored = self.block(BlockType::from_armor(kind), Some(kind), range.clone());
                if range.start > start {
                    self.pending = Some(armored);
                    Some(self.block(BlockType::PlainText, None, start..range.start))
                } else {
                    Some(armored)
                }
            }
            None => {
                self.pos = self.text.len();
                Some(self.block(BlockType::PlainText, None, start..self.text.len()))
            }
        }
    }
}

fn at_line_start(text: &str, idx: usize) -> bool {
    idx == 0 || text.as_bytes().get(idx - 1) == Some(&b'\n')
}

fn line_end(text: &str, from: usize) -> usize {
    text[from..].find('\n').map_or(text.len(), |i| from + i)
}

/// A begin line still waiting for its end marker.
struct OpenBlock {
    start: usize,
    kind: ArmorKind,
    end_marker: String,
    /// Start of the trailing signature of a clear-signed message.
    signature: Option<usize>,
}

impl OpenBlock {
    fn new(start: usize, kind: ArmorKind) -> Self {
        Self {
            start,
            kind,
            end_marker: kind.end_marker(),
            signature: None,
        }
    }

    fn decodes(&self, text: &str, end: usize) -> bool {
        if self.kind == ArmorKind::SignedMessage {
            // The cleartext part is free-form; the trailing signature must decode.
            return self
                .signature
                .is_some_and(|sig| armor::dearmor(&text[sig..end]).is_ok());
        }
        armor::dearmor(&text[self.start..end]).is_ok_and(|armored| armored.kind == self.kind)
    }
}

/// Next valid armored block at or after `from`, found in one pass over the
/// lines. A later begin line abandons an unterminated one, so every line is
/// visited once and every candidate block is decoded at most once.
fn find_armored(text: &str, from: usize) -> Option<(Range<usize>, ArmorKind)> {
    let mut line_start = if at_line_start(text, from) {
        from
    } else {
        line_end(text, from) + 1
    };
    let mut open: Option<OpenBlock> = None;
    while line_start < text.len() {
        let end = line_end(text, line_start);
        let line = &text[line_start..end];
        if line.starts_with("-----") {
            if let Some(kind) = ArmorKind::begin_line_at(line) {
                match open.as_mut() {
                    Some(block)
                        if block.kind == ArmorKind::SignedMessage
                            && kind == ArmorKind::Signature =>
                    {
                        block.signature = Some(line_start);
                    }
                    _ => open = Some(OpenBlock::new(line_start, kind)),
                }
            } else if open
                .as_ref()
                .is_some_and(|block| line.starts_with(block.end_marker.as_str()))
                && let Some(block) = open.take()
            {
                let block_end = line_start + block.end_marker.len();
                if block.decodes(text, block_end) {
                    return Some((block.start..block_end, block.kind));
                }
            }
        }
        line_start = end + 1;
    }
    None
}
