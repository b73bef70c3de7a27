//! Hashing and encryption of token plaintexts.

pub mod crypto;
