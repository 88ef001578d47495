//! Client-side password encodings
//!
//! Many appliances hash or encode the password in browser JavaScript before
//! posting it. The template names the transform so the engine can reproduce it.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use md5::{Digest as _, Md5};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::Sha256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PasswordEncoding {
    #[default]
    None,
    Md5,
    Md5Upper,
    Sha1,
    Sha256,
    Base64,
    /// base64 of the lowercase hex md5 digest
    Md5Base64,
}

impl PasswordEncoding {
    /// Apply the transform to a plaintext password.
    pub fn apply(&self, password: &str) -> String {
        match self {
            PasswordEncoding::None => password.to_string(),
            PasswordEncoding::Md5 => hex::encode(Md5::digest(password.as_bytes())),
            PasswordEncoding::Md5Upper => {
                hex::encode(Md5::digest(password.as_bytes())).to_uppercase()
            }
            PasswordEncoding::Sha1 => hex::encode(Sha1::digest(password.as_bytes())),
            PasswordEncoding::Sha256 => hex::encode(Sha256::digest(password.as_bytes())),
            PasswordEncoding::Base64 => STANDARD.encode(password.as_bytes()),
            PasswordEncoding::Md5Base64 => {
                let digest = hex::encode(Md5::digest(password.as_bytes()));
                STANDARD.encode(digest.as_bytes())
            }
        }
    }
}
