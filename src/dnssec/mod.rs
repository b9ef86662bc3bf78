//! DNSSEC: keys, signatures and delegation digests.

pub mod ds;
pub mod keys;
pub mod sign;
pub mod signer;

pub use keys::{FileKeyStore, KeyState, KeyStore, KeyTimings, SigningKey};
pub use sign::SignContext;
