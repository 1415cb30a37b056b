//! Key and message handling for OpenPGP and X.509/S-MIME behind one [`Key`]
//! type.
//!
//! A [`Key`] is exclusively owned: [`decrypt_key`] and [`encrypt_key`] swap its
//! private material in place, so callers sharing one must serialize those
//! calls. Everything else is a pure function over its inputs.

pub mod armor;
pub mod blocks;
mod der;
mod diagnose;
mod email;
mod key;
pub mod msg;
pub mod pgp;
pub mod smime;

pub use diagnose::{KeyDiagnosis, diagnose};
pub use email::is_valid_email;
pub use key::{
    Key, KeyInfo, ReadManyResult, armor_key, decrypt_key, encrypt_key, longids, parse, read_many,
};
pub use smime::parse_pkcs12;
