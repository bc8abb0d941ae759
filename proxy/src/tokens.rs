use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,
    #[error("token signature mismatch")]
    BadSignature,
}

/// Issues and checks the per-user tokens embedded in playlist URLs.
///
/// A token is `{user}-{signature}`, the signature being the URL-safe base64
/// HMAC-SHA256 of the user name keyed with the configured salt.
#[derive(Clone)]
pub struct TokenSigner {
    salt: Vec<u8>,
}

impl TokenSigner {
    pub fn new(salt: &str) -> Self {
        TokenSigner {
            salt: salt.as_bytes().to_vec(),
        }
    }

    fn mac(&self, user: &str) -> HmacSha256 {
        // HMAC accepts keys of any length.
        let mut mac = HmacSha256::new_from_slice(&self.salt)
            .unwrap_or_else(|_| unreachable!("hmac key of any size is valid"));
        mac.update(user.as_bytes());
        mac
    }

    pub fn issue(&self, user: &str) -> String {
        let signature = self.mac(user).finalize().into_bytes();
        format!("{user}-{}", URL_SAFE_NO_PAD.encode(signature))
    }

    /// Returns the user the token was issued to.
    pub fn verify<'a>(&self, token: &'a str) -> Result<&'a str, TokenError> {
        let (user, signature) = token.split_once('-').ok_or(TokenError::Malformed)?;
        if user.is_empty() {
            return Err(TokenError::Malformed);
        }

        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| TokenError::Malformed)?;

        self.mac(user)
            .verify_slice(&signature)
            .map_err(|_| TokenError::BadSignature)?;

        Ok(user)
    }
}
