//! Quicrypt - encrypt a file or folder in place with a passphrase, or
//! decrypt it if it already is
//!
//! Encrypted files are OpenPGP passphrase-encrypted messages that
//! `gpg --decrypt` can read, and `gpg --symmetric --cipher-algo AES256`
//! output can be decrypted here. Folders travel as bzip2-compressed tar
//! archives inside the message.

#![forbid(unsafe_code)]

pub mod archive;
pub mod armor;
pub mod error;
pub mod file_ops;
pub mod packet;
pub mod passphrase;
pub mod s2k;
pub mod seipd;
pub mod sniff;
pub mod symcrypt;
