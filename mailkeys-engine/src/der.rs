//! Minimal DER reading and writing for the few CMS structures openssl does
//! not expose (IssuerAndSerialNumber, RecipientInfo identifiers).

const TAG_INTEGER: u8 = 0x02;
const TAG_OID: u8 = 0x06;
pub(crate) const TAG_SEQUENCE: u8 = 0x30;
const TAG_SET: u8 = 0x31;
const TAG_CONTEXT_0: u8 = 0xA0;

/// id-envelopedData, 1.2.840.113549.1.7.3
const OID_ENVELOPED_DATA: [u8; 9] = [0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x07, 0x03];

#[derive(Debug, Clone, Copy)]
pub(crate) struct Tlv<'a> {
    pub tag: u8,
    pub content: &'a [u8],
    /// Tag, length and content bytes.
    pub raw: &'a [u8],
}

/// Reads one definite-length TLV, returning it and the remaining input.
pub(crate) fn read_tlv(input: &[u8]) -> Option<(Tlv<'_>, &[u8])> {
    let tag = *input.first()?;
    let first = *input.get(1)? as usize;
    let (len, header) = if first < 0x80 {
        (first, 2)
    } else {
        let count = first & 0x7F;
        if count == 0 || count > 4 {
            return None;
        }
        let bytes = input.get(2..2 + count)?;
        let len = bytes.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize);
        (len, 2 + count)
    };
    let end = header.checked_add(len)?;
    let content = input.get(header..end)?;
    Some((
        Tlv {
            tag,
            content,
            raw: &input[..end],
        },
        &input[end..],
    ))
}

pub(crate) fn children(mut content: &[u8]) -> Option<Vec<Tlv<'_>>> {
    let mut out = Vec::new();
    while !content.is_empty() {
        let (tlv, rest) = read_tlv(content)?;
        out.push(tlv);
        content = rest;
    }
    Some(out)
}

pub(crate) fn encode(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(content.len() + 6);
    out.push(tag);
    let len = content.len();
    if len < 0x80 {
        out.push(len as u8);
    } else {
        let bytes = len.to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count();
        out.push(0x80 | (bytes.len() - skip) as u8);
        out.extend_from_slice(&bytes[skip..]);
    }
    out.extend_from_slice(content);
    out
}

/// The serialNumber INTEGER of a DER certificate, exactly as encoded.
/// Serials are two's complement and may be negative in the wild.
pub(crate) fn certificate_serial(cert: &[u8]) -> Option<&[u8]> {
    let (outer, _) = read_tlv(cert)?;
    let (tbs, _) = read_tlv(outer.content)?;
    if outer.tag != TAG_SEQUENCE || tbs.tag != TAG_SEQUENCE {
        return None;
    }
    let mut fields = children(tbs.content)?.into_iter();
    let mut serial = fields.next()?;
    if serial.tag == TAG_CONTEXT_0 {
        serial = fields.next()?;
    }
    (serial.tag == TAG_INTEGER).then_some(serial.raw)
}

/// Identifiers (`rid`) of every KeyTransRecipientInfo in a DER-encoded
/// PKCS#7 enveloped-data ContentInfo, in encoding order. Recipients addressed
/// by subject key identifier are returned as their `[0]` raw bytes.
pub(crate) fn enveloped_recipient_ids(content_info: &[u8]) -> Option<Vec<Vec<u8>>> {
    let (outer, _) = read_tlv(content_info)?;
    if outer.tag != TAG_SEQUENCE {
        return None;
    }
    let parts = children(outer.content)?;
    let oid = parts.first()?;
    if oid.tag != TAG_OID || oid.content != OID_ENVELOPED_DATA {
        return None;
    }
    let explicit = parts.get(1).filter(|p| p.tag == TAG_CONTEXT_0)?;
    let (enveloped, _) = read_tlv(explicit.content)?;
    let fields = children(enveloped.content)?;
    let infos = fields.iter().find(|f| f.tag == TAG_SET)?;
    let mut out = Vec::new();
    for info in children(infos.content)? {
        let items = children(info.content)?;
        let rid = items.get(1)?;
        out.push(rid.raw.to_vec());
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_form_lengths_round_trip() {
        let content = vec![7u8; 300];
        let encoded = encode(TAG_SEQUENCE, &content);
        assert_eq!(&encoded[..4], &[0x30, 0x82, 0x01, 0x2C]);
        let (tlv, rest) = read_tlv(&encoded).expect("tlv");
        assert!(rest.is_empty());
        assert_eq!(tlv.content.len(), 300);
        assert_eq!(tlv.raw.len(), encoded.len());
    }

    #[test]
    fn serial_is_read_past_the_version_field() {
        let version = encode(TAG_CONTEXT_0, &encode(TAG_INTEGER, &[2]));
        let serial = encode(TAG_INTEGER, &[0xED, 0x29, 0x79]);
        let issuer = encode(TAG_SEQUENCE, &[]);
        let tbs = encode(TAG_SEQUENCE, &[version, serial.clone(), issuer].concat());
        let cert = encode(TAG_SEQUENCE, &tbs);
        assert_eq!(
            certificate_serial(&cert),
            Some(&[0x02, 0x03, 0xED, 0x29, 0x79][..])
        );

        let v1 = encode(TAG_SEQUENCE, &encode(TAG_SEQUENCE, &serial));
        assert_eq!(certificate_serial(&v1), Some(serial.as_slice()));
        assert!(certificate_serial(&encode(TAG_SEQUENCE, &[])).is_none());
    }

    #[test]
    fn truncated_input_is_rejected() {
        assert!(read_tlv(&[0x30, 0x05, 0x01]).is_none());
        assert!(read_tlv(&[0x30, 0x80]).is_none());
        assert!(enveloped_recipient_ids(&[0x30, 0x00]).is_none());
    }
}
