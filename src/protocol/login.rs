//! # Login Credential Rewriter
//!
//! Detects the client's login request, decrypts the credentials, lets a
//! [`CredentialResolver`] pick a substitute pair and splices the re-encrypted
//! pair back into the datagram.
//!
//! ## Login Request Layout
//! ```text
//! [00 03] [04] [00 15 00 ...]   Combined envelope holding an app packet
//! ...                           14 bytes of envelope/app header
//! [LoginBaseMessage(10)]        sequence(4) compressed(1) encrypt_type(1) unk(4)
//! [DES-CBC ciphertext]          "user\0pass\0" zero-padded to 8 bytes
//! ```
//!
//! Byte 7 is a running length field that must equal `datagram_len - 8` after a
//! rewrite.
//!
//! ## Failure Policy
//! Nothing here ever drops a login. Crypto or resolver failures are logged and
//! the original datagram is forwarded unchanged.

use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use tracing::{debug, info, instrument, warn};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{constants, ProxyError, Result};
use crate::service::resolver::CredentialResolver;

type DesCbcEnc = cbc::Encryptor<des::Des>;
type DesCbcDec = cbc::Decryptor<des::Des>;

/// Leading bytes of every login request.
pub const LOGIN_MAGIC: [u8; 6] = [0x00, 0x03, 0x04, 0x00, 0x15, 0x00];

/// Shortest datagram that can carry a login request.
pub const LOGIN_MIN_LEN: usize = 30;

/// Size of the login base message preceding the ciphertext.
pub const LOGIN_BASE_MESSAGE_LEN: usize = 10;

/// Offset of the DES-CBC ciphertext.
pub const LOGIN_CIPHERTEXT_OFFSET: usize = 14 + LOGIN_BASE_MESSAGE_LEN;

/// Offset of the running length byte patched after a rewrite.
pub const LOGIN_LENGTH_OFFSET: usize = 7;

const DES_BLOCK: usize = 8;

/// A username/password pair as raw bytes.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Credentials {
    username: Vec<u8>,
    password: Vec<u8>,
}

impl Credentials {
    /// Build a pair, rejecting empty usernames and embedded NULs.
    pub fn new(username: impl Into<Vec<u8>>, password: impl Into<Vec<u8>>) -> Result<Self> {
        let username = username.into();
        let password = password.into();
        if username.is_empty() {
            return Err(ProxyError::InvalidCredentials("empty username".to_string()));
        }
        if username.contains(&0) || password.contains(&0) {
            return Err(ProxyError::InvalidCredentials("embedded NUL byte".to_string()));
        }
        Ok(Self { username, password })
    }

    /// Split a decrypted login plaintext into its two fields.
    ///
    /// Trailing zero padding is trimmed first, so `user\0\0...` (a blank
    /// password) leaves no separator and yields an empty password.
    pub fn from_plaintext(plaintext: &[u8]) -> Result<Self> {
        let end = plaintext.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
        let trimmed = &plaintext[..end];
        let (username, password) = match trimmed.iter().position(|&b| b == 0) {
            Some(split) => {
                let rest = &trimmed[split + 1..];
                (&trimmed[..split], rest.split(|&b| b == 0).next().unwrap_or_default())
            }
            None => (trimmed, &[][..]),
        };
        if username.is_empty() {
            return Err(ProxyError::Decryption(constants::ERR_EMPTY_USERNAME));
        }
        Ok(Self {
            username: username.to_vec(),
            password: password.to_vec(),
        })
    }

    pub fn username(&self) -> &[u8] {
        &self.username
    }

    pub fn password(&self) -> &[u8] {
        &self.password
    }

    /// Lowercased username, the key used for account lookups.
    pub fn account_name(&self) -> String {
        String::from_utf8_lossy(&self.username).to_lowercase()
    }

    /// `user\0pass\0`, zero-padded past the next 8-byte boundary.
    fn to_plaintext(&self) -> Zeroizing<Vec<u8>> {
        let len = self.username.len() + self.password.len() + 2;
        let padded = (len / DES_BLOCK + 1) * DES_BLOCK;
        let mut out = Zeroizing::new(Vec::with_capacity(padded));
        out.extend_from_slice(&self.username);
        out.push(0);
        out.extend_from_slice(&self.password);
        out.push(0);
        out.resize(padded, 0);
        out
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &String::from_utf8_lossy(&self.username))
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Static-key DES-CBC used by the login request.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct LoginCipher {
    key: [u8; 8],
    iv: [u8; 8],
}

impl LoginCipher {
    pub fn new(key: [u8; 8], iv: [u8; 8]) -> Self {
        Self { key, iv }
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        if ciphertext.is_empty() || ciphertext.len() % DES_BLOCK != 0 {
            return Err(ProxyError::Decryption(constants::ERR_CIPHERTEXT_ALIGNMENT));
        }
        DesCbcDec::new(&self.key.into(), &self.iv.into())
            .decrypt_padded_vec_mut::<NoPadding>(ciphertext)
            .map(Zeroizing::new)
            .map_err(|_| ProxyError::Decryption(constants::ERR_CIPHERTEXT_ALIGNMENT))
    }

    /// Encrypt block-aligned plaintext.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        if plaintext.len() % DES_BLOCK != 0 {
            return Err(ProxyError::Encryption);
        }
        Ok(DesCbcEnc::new(&self.key.into(), &self.iv.into())
            .encrypt_padded_vec_mut::<NoPadding>(plaintext))
    }

    pub fn decrypt_credentials(&self, ciphertext: &[u8]) -> Result<Credentials> {
        let plaintext = self.decrypt(ciphertext)?;
        Credentials::from_plaintext(&plaintext)
    }

    pub fn encrypt_credentials(&self, credentials: &Credentials) -> Result<Vec<u8>> {
        self.encrypt(&credentials.to_plaintext())
    }
}

impl std::fmt::Debug for LoginCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LoginCipher { .. }")
    }
}

/// Whether a client datagram is a login request.
#[inline]
pub fn is_login_request(buf: &[u8]) -> bool {
    buf.len() >= LOGIN_MIN_LEN && buf.starts_with(&LOGIN_MAGIC)
}

/// A decrypted login request awaiting a resolution decision.
#[derive(Debug)]
pub struct LoginRequest {
    original: Vec<u8>,
    credentials: Credentials,
}

impl LoginRequest {
    /// Decrypt `buf` if it is a login request. `Ok(None)` means "not a login".
    pub fn parse(buf: &[u8], cipher: &LoginCipher) -> Result<Option<Self>> {
        if !is_login_request(buf) {
            return Ok(None);
        }
        let credentials = cipher.decrypt_credentials(&buf[LOGIN_CIPHERTEXT_OFFSET..])?;
        Ok(Some(Self {
            original: buf.to_vec(),
            credentials,
        }))
    }

    /// Parse `buf` as a login, handing it back untouched when it is not one or
    /// cannot be decrypted.
    pub fn intercept(buf: Vec<u8>, cipher: &LoginCipher) -> std::result::Result<Self, Vec<u8>> {
        match Self::parse(&buf, cipher) {
            Ok(Some(request)) => Ok(request),
            Ok(None) => Err(buf),
            Err(e) => {
                warn!(error = %e, "Failed to decrypt login request, forwarding original");
                Err(buf)
            }
        }
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn original(&self) -> &[u8] {
        &self.original
    }

    pub fn into_original(self) -> Vec<u8> {
        self.original
    }

    /// Build the datagram carrying `replacement` in place of the client's pair.
    pub fn rewrite(&self, replacement: &Credentials, cipher: &LoginCipher) -> Result<Vec<u8>> {
        let ciphertext = cipher.encrypt_credentials(replacement)?;
        let mut out = Vec::with_capacity(LOGIN_CIPHERTEXT_OFFSET + ciphertext.len());
        out.extend_from_slice(&self.original[..LOGIN_CIPHERTEXT_OFFSET]);
        out.extend_from_slice(&ciphertext);
        let running_len = out.len() - 8;
        out[LOGIN_LENGTH_OFFSET] =
            u8::try_from(running_len).map_err(|_| ProxyError::LengthOverflow(out.len()))?;
        Ok(out)
    }

    /// Apply a resolver result; a failed resolution forwards the original.
    pub fn settle(self, outcome: Result<Option<Credentials>>, cipher: &LoginCipher) -> (Vec<u8>, bool) {
        let resolved = match outcome {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!(
                    username = %self.credentials.account_name(),
                    error = %e,
                    "Credential resolution failed, forwarding original login"
                );
                None
            }
        };
        self.finish(resolved, cipher)
    }

    /// Apply a resolution outcome. Returns the datagram to forward and whether it changed.
    pub fn finish(self, resolved: Option<Credentials>, cipher: &LoginCipher) -> (Vec<u8>, bool) {
        let Some(replacement) = resolved else {
            debug!(username = %self.credentials.account_name(), "No substitution, forwarding login as-is");
            return (self.into_original(), false);
        };
        match self.rewrite(&replacement, cipher) {
            Ok(rewritten) => {
                info!(
                    username = %self.credentials.account_name(),
                    substitute = %replacement.account_name(),
                    "Login credentials substituted"
                );
                (rewritten, true)
            }
            Err(e) => {
                warn!(error = %e, "Failed to re-encrypt login, forwarding original");
                (self.into_original(), false)
            }
        }
    }
}

/// Rewrite a login request through `resolver`; any other datagram is returned as-is.
///
/// This is the one-shot form of what [`LoginProxy`](crate::service::LoginProxy)
/// does across its event loop with [`LoginRequest::intercept`] and
/// [`LoginRequest::settle`].
#[instrument(level = "debug", skip_all, fields(bytes = buf.len()))]
pub async fn maybe_rewrite_login(
    buf: Vec<u8>,
    cipher: &LoginCipher,
    resolver: &dyn CredentialResolver,
) -> Vec<u8> {
    let request = match LoginRequest::intercept(buf, cipher) {
        Ok(request) => request,
        Err(buf) => return buf,
    };
    let outcome = resolver.resolve(request.credentials()).await;
    request.settle(outcome, cipher).0
}
