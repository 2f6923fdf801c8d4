//! End-to-end scenarios: store a database, load it back, and poke at the
//! ciphertext in between.

use std::io::{Cursor, Read, Write};

use kdbx3::{
    load_kdbx, load_kdbx_file, store_kdbx, CompositeKey, Error, KcpKeyFile, KcpPassword,
    KdbxHeaderBuilder, PwCompressionAlgorithm, UserKey,
};

const MINIMAL_XML: &[u8] = b"<KeePassFile><Root/></KeePassFile>";

fn password_key(password: &str) -> CompositeKey {
    let mut key = CompositeKey::new();
    key.add_user_key(UserKey::Password(KcpPassword::new(password)))
        .unwrap();
    key
}

fn store_to_vec(
    key: &mut CompositeKey,
    compression: PwCompressionAlgorithm,
    rounds: u64,
    xml: &[u8],
) -> Vec<u8> {
    let header = KdbxHeaderBuilder::new()
        .compression(compression)
        .transform_rounds(rounds)
        .complete()
        .unwrap();
    store_kdbx(Vec::new(), key, &header, Cursor::new(xml.to_vec())).unwrap()
}

fn load_to_vec(key: &mut CompositeKey, file: &[u8]) -> Result<Vec<u8>, Error> {
    let (_header, mut stream) = load_kdbx(Cursor::new(file.to_vec()), key)?;
    let mut xml = Vec::new();
    stream.read_to_end(&mut xml).map_err(Error::from)?;
    stream.close()?;
    Ok(xml)
}

#[test]
fn minimal_database_round_trips() {
    let mut key = password_key("hunter2");
    let file = store_to_vec(
        &mut key,
        PwCompressionAlgorithm::None,
        2,
        MINIMAL_XML,
    );

    let mut reload_key = password_key("hunter2");
    let xml = load_to_vec(&mut reload_key, &file).unwrap();
    assert_eq!(xml, MINIMAL_XML);
}

#[test]
fn compressed_database_round_trips_and_shrinks() {
    // 5 MiB of a repeating pattern.
    let payload: Vec<u8> = (0..5 * 1024 * 1024u32).map(|n| (n % 10) as u8 + b'0').collect();

    let mut key = password_key("hunter2");
    let file = store_to_vec(&mut key, PwCompressionAlgorithm::GZip, 2, &payload);
    assert!(
        file.len() < payload.len() / 100,
        "ciphertext is {} bytes for {} bytes of plaintext",
        file.len(),
        payload.len()
    );

    let mut reload_key = password_key("hunter2");
    let xml = load_to_vec(&mut reload_key, &file).unwrap();
    assert_eq!(xml, payload);
}

#[test]
fn key_file_and_password_round_trip() {
    let mut key_file_doc = Vec::new();
    let key_file = KcpKeyFile::create_xml(&mut key_file_doc).unwrap();

    let mut key = password_key("hunter2");
    key.add_user_key(UserKey::KeyFile(key_file)).unwrap();
    let file = store_to_vec(&mut key, PwCompressionAlgorithm::GZip, 4, MINIMAL_XML);

    let mut reload_key = password_key("hunter2");
    reload_key
        .add_user_key(UserKey::KeyFile(
            KcpKeyFile::from_bytes(&key_file_doc).unwrap(),
        ))
        .unwrap();
    assert_eq!(load_to_vec(&mut reload_key, &file).unwrap(), MINIMAL_XML);

    // Password alone no longer opens the database.
    let mut wrong_key = password_key("hunter2");
    match load_to_vec(&mut wrong_key, &file) {
        Err(Error::BadPassword) => {}
        other => panic!("expected BadPassword, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn wrong_password_is_rejected_up_front() {
    let mut key = password_key("A");
    let file = store_to_vec(&mut key, PwCompressionAlgorithm::None, 2, MINIMAL_XML);

    let mut wrong = password_key("B");
    match load_kdbx(Cursor::new(file), &mut wrong) {
        Err(Error::BadPassword) => {}
        other => panic!("expected BadPassword, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn flipped_byte_late_in_the_file_is_an_integrity_failure() {
    // Uncompressed and large enough for several hashed blocks.
    let payload: Vec<u8> = (0..2 * 1024 * 1024u32).map(|n| (n % 251) as u8).collect();

    let mut key = password_key("hunter2");
    let mut file = store_to_vec(&mut key, PwCompressionAlgorithm::None, 2, &payload);

    // Into the second hashed block, far past the stream start bytes.
    let flip_at = file.len() * 3 / 4;
    file[flip_at] ^= 0x01;

    let mut reload_key = password_key("hunter2");
    match load_to_vec(&mut reload_key, &file) {
        Err(Error::IntegrityFailure(_)) => {}
        other => panic!("expected IntegrityFailure, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn flipped_byte_in_the_first_cipher_block_is_a_bad_password() {
    let mut key = password_key("hunter2");
    let header = KdbxHeaderBuilder::new()
        .compression(PwCompressionAlgorithm::None)
        .transform_rounds(2)
        .complete()
        .unwrap();
    let header_len = header.image().len();
    let mut file = store_kdbx(
        Vec::new(),
        &mut key,
        &header,
        Cursor::new(MINIMAL_XML.to_vec()),
    )
    .unwrap();

    // First ciphertext byte: decrypts into the stream start bytes.
    file[header_len] ^= 0x01;

    let mut reload_key = password_key("hunter2");
    match load_to_vec(&mut reload_key, &file) {
        Err(Error::BadPassword) => {}
        other => panic!("expected BadPassword, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn truncated_file_does_not_load_cleanly() {
    let mut key = password_key("hunter2");
    let file = store_to_vec(&mut key, PwCompressionAlgorithm::None, 2, MINIMAL_XML);

    let cut = &file[0..file.len() - 16];
    let mut reload_key = password_key("hunter2");
    match load_to_vec(&mut reload_key, cut) {
        Err(Error::IntegrityFailure(_)) | Err(Error::CorruptFrame(_)) => {}
        other => panic!("expected a corruption error, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn abandoning_a_load_reports_cancellation() {
    // Big enough that the pipeline cannot have drained when we stop.
    let payload: Vec<u8> = (0..4 * 1024 * 1024u32).map(|n| (n % 7) as u8).collect();

    let mut key = password_key("hunter2");
    let file = store_to_vec(&mut key, PwCompressionAlgorithm::None, 2, &payload);

    let mut reload_key = password_key("hunter2");
    let (_header, mut stream) = load_kdbx(Cursor::new(file), &mut reload_key).unwrap();

    let mut first = [0u8; 1024];
    stream.read_exact(&mut first).unwrap();
    match stream.close() {
        Err(Error::Cancelled) => {}
        other => panic!("expected Cancelled, got {:?}", other),
    }
}

#[test]
fn database_files_round_trip_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.kdbx");

    let mut key = password_key("on-disk");
    let header = KdbxHeaderBuilder::new()
        .transform_rounds(2)
        .complete()
        .unwrap();
    let file = std::fs::File::create(&path).unwrap();
    let mut sink = store_kdbx(file, &mut key, &header, Cursor::new(MINIMAL_XML.to_vec())).unwrap();
    sink.flush().unwrap();

    let mut reload_key = password_key("on-disk");
    let (loaded_header, mut stream) = load_kdbx_file(&path, &mut reload_key).unwrap();
    assert_eq!(loaded_header.transform_rounds(), 2);

    let mut xml = Vec::new();
    stream.read_to_end(&mut xml).unwrap();
    stream.close().unwrap();
    assert_eq!(xml, MINIMAL_XML);
}

#[test]
fn header_image_reloads_with_identical_metadata() {
    let mut key = password_key("meta");
    let header = KdbxHeaderBuilder::new()
        .compression(PwCompressionAlgorithm::GZip)
        .transform_rounds(77)
        .complete()
        .unwrap();
    let file = store_kdbx(
        Vec::new(),
        &mut key,
        &header,
        Cursor::new(MINIMAL_XML.to_vec()),
    )
    .unwrap();

    let mut reload_key = password_key("meta");
    let (loaded, stream) = load_kdbx(Cursor::new(file), &mut reload_key).unwrap();
    assert_eq!(loaded.image(), header.image());
    assert_eq!(loaded.header_hash(), header.header_hash());
    assert_eq!(loaded.transform_rounds(), 77);
    assert_eq!(loaded.compression(), PwCompressionAlgorithm::GZip);
    drop(stream);
}
