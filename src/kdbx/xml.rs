//! Protected-value helpers for the XML binding layer.
//!
//! Values marked `Protected="True"` are stored base64 encoded with the
//! inner stream keystream XORed over them. The binding must touch them in
//! document order on both sides, once each, or the keystream positions
//! drift. Values decoded here stay masked in memory as [`XorredBuffer`]s;
//! pairing the ciphertext with its keystream span happens at parse time, so
//! the stream cipher state can move on while the value stays recoverable.

use std::io::Read;
use xml::reader::{EventReader, ParserConfig, XmlEvent};

use crate::crypto::inner_stream::CryptoRandomStream;
use crate::error::Error;
use crate::security::{SafeBytes, XorredBuffer};

use super::header::KdbxHeader;

pub const ATTR_PROTECTED: &str = "Protected";
pub const VAL_TRUE: &str = "True";
const ELEM_HEADER_HASH: &str = "HeaderHash";

fn reader_config() -> ParserConfig {
    ParserConfig::new()
        .trim_whitespace(true)
        .ignore_comments(true)
        .cdata_to_characters(true)
        .coalesce_characters(true)
}

/// Decode one protected value: pair the base64 ciphertext with the next
/// keystream span. Consumes exactly `value` bytes of keystream.
pub fn protected_value(
    crs: &mut CryptoRandomStream,
    base64_text: &str,
) -> Result<XorredBuffer, Error> {
    let masked = base64::decode(base64_text.trim().as_bytes())
        .map_err(|_| Error::Xml("protected value is not valid base64"))?;

    let mut data = SafeBytes::with_capacity(masked.len() * 2)?;
    data.extend_from_slice(&masked)?;
    data.extend_zeroed(masked.len())?;
    let pad_start = masked.len();
    crs.get_random_bytes(&mut data.as_mut_slice()[pad_start..]);
    XorredBuffer::wrap(data)
}

/// Mask one value for writing: XOR the next keystream span over it and
/// base64 encode. The write-side counterpart of [`protected_value`].
pub fn protect_value(crs: &mut CryptoRandomStream, plaintext: &[u8]) -> Result<String, Error> {
    let mut masked = SafeBytes::from_slice(plaintext)?;
    crs.process_in_place(masked.as_mut_slice());
    Ok(base64::encode(masked.as_slice()))
}

/// Walk a plaintext XML document and collect every protected value in
/// document order. This is the traversal the binding layer performs; it is
/// also what the round-trip tests drive.
pub fn read_protected_values<R: Read>(
    input: R,
    crs: &mut CryptoRandomStream,
) -> Result<Vec<XorredBuffer>, Error> {
    let mut xml = EventReader::new_with_config(input, reader_config());
    let mut values = Vec::new();

    let mut in_protected = false;
    let mut text = String::new();

    loop {
        match xml.next() {
            Ok(XmlEvent::StartElement { attributes, .. }) => {
                in_protected = attributes
                    .iter()
                    .any(|attr| attr.name.local_name == ATTR_PROTECTED && attr.value == VAL_TRUE);
                text.clear();
            }
            Ok(XmlEvent::Characters(chunk)) => {
                if in_protected {
                    text.push_str(&chunk);
                }
            }
            Ok(XmlEvent::EndElement { .. }) => {
                if in_protected {
                    values.push(protected_value(crs, &text)?);
                    in_protected = false;
                    text.clear();
                }
            }
            Ok(XmlEvent::EndDocument) => break,
            Ok(_) => {}
            Err(_) => return Err(Error::Xml("invalid XML document")),
        }
    }

    Ok(values)
}

/// Check the `<Meta><HeaderHash>` element against the header image, when
/// the document carries one. A mismatch means the unencrypted header was
/// tampered with after the file was written.
pub fn verify_header_hash<R: Read>(input: R, header: &KdbxHeader) -> Result<(), Error> {
    let mut xml = EventReader::new_with_config(input, reader_config());

    let mut in_header_hash = false;
    let mut stored: Option<String> = None;

    loop {
        match xml.next() {
            Ok(XmlEvent::StartElement { name, .. }) => {
                in_header_hash = name.local_name == ELEM_HEADER_HASH;
            }
            Ok(XmlEvent::Characters(text)) => {
                if in_header_hash {
                    stored = Some(text);
                }
            }
            Ok(XmlEvent::EndElement { .. }) => {
                in_header_hash = false;
            }
            Ok(XmlEvent::EndDocument) => break,
            Ok(_) => {}
            Err(_) => return Err(Error::Xml("invalid XML document")),
        }
    }

    if let Some(stored) = stored {
        let decoded = base64::decode(stored.trim().as_bytes())
            .map_err(|_| Error::Xml("header hash is not valid base64"))?;
        if decoded != header.header_hash() {
            return Err(Error::IntegrityFailure("header hash mismatch"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crypto::inner_stream::CrsAlgorithm;
    use crate::kdbx::header::KdbxHeaderBuilder;
    use crate::kdbx::PwCompressionAlgorithm;

    fn stream_pair() -> (CryptoRandomStream, CryptoRandomStream) {
        let key = [0x5Au8; 32];
        (
            CryptoRandomStream::new(CrsAlgorithm::Salsa20, &key).unwrap(),
            CryptoRandomStream::new(CrsAlgorithm::Salsa20, &key).unwrap(),
        )
    }

    #[test]
    fn three_values_round_trip_in_document_order() {
        let (mut masker, mut unmasker) = stream_pair();

        let document = format!(
            "<KeePassFile><Root><Entry>\
             <String><Key>Title</Key><Value Protected=\"True\">{}</Value></String>\
             <String><Key>UserName</Key><Value>visible</Value></String>\
             <String><Key>Password</Key><Value Protected=\"True\">{}</Value></String>\
             <String><Key>Notes</Key><Value Protected=\"True\">{}</Value></String>\
             </Entry></Root></KeePassFile>",
            protect_value(&mut masker, b"a").unwrap(),
            protect_value(&mut masker, b"bc").unwrap(),
            protect_value(&mut masker, b"def").unwrap(),
        );

        let values = read_protected_values(document.as_bytes(), &mut unmasker).unwrap();
        assert_eq!(values.len(), 3);
        assert_eq!(values[0].reveal().unwrap().as_slice(), b"a");
        assert_eq!(values[1].reveal().unwrap().as_slice(), b"bc");
        assert_eq!(values[2].reveal().unwrap().as_slice(), b"def");
    }

    #[test]
    fn out_of_order_decoding_does_not_recover_values() {
        let (mut masker, mut unmasker) = stream_pair();

        let first = protect_value(&mut masker, b"a").unwrap();
        let second = protect_value(&mut masker, b"bc").unwrap();
        let third = protect_value(&mut masker, b"def").unwrap();

        // Swapped order misaligns every keystream span.
        let scrambled = protected_value(&mut unmasker, &third).unwrap();
        let _ = protected_value(&mut unmasker, &second).unwrap();
        let _ = protected_value(&mut unmasker, &first).unwrap();
        assert_ne!(scrambled.reveal().unwrap().as_slice(), b"def");
    }

    #[test]
    fn empty_protected_values_do_not_advance_the_keystream() {
        let (mut masker, mut unmasker) = stream_pair();

        let empty = protect_value(&mut masker, b"").unwrap();
        assert!(empty.is_empty());
        let value = protect_value(&mut masker, b"secret").unwrap();

        let decoded_empty = protected_value(&mut unmasker, "").unwrap();
        assert_eq!(decoded_empty.len(), 0);
        let decoded = protected_value(&mut unmasker, &value).unwrap();
        assert_eq!(decoded.reveal().unwrap().as_slice(), b"secret");
    }

    #[test]
    fn header_hash_verification() {
        let header = KdbxHeaderBuilder::new()
            .compression(PwCompressionAlgorithm::None)
            .transform_rounds(2)
            .complete()
            .unwrap();

        let document = format!(
            "<KeePassFile><Meta><HeaderHash>{}</HeaderHash></Meta><Root/></KeePassFile>",
            base64::encode(&header.header_hash())
        );
        verify_header_hash(document.as_bytes(), &header).unwrap();

        let tampered = format!(
            "<KeePassFile><Meta><HeaderHash>{}</HeaderHash></Meta><Root/></KeePassFile>",
            base64::encode(&[0u8; 32])
        );
        match verify_header_hash(tampered.as_bytes(), &header) {
            Err(Error::IntegrityFailure(_)) => {}
            other => panic!("expected an integrity failure, got {:?}", other),
        }

        // A document without the element passes; the hash is optional.
        verify_header_hash("<KeePassFile><Root/></KeePassFile>".as_bytes(), &header).unwrap();
    }
}
