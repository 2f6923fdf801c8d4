pub mod cipher;
pub mod compress;
pub mod hashed_block;
pub mod inner_stream;
pub mod kdf;
