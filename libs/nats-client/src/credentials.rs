//! Credential provider: turns a server nonce into a signature without the
//! private seed ever leaving this process.
//!
//! Three sources are supported behind the one [`Credentials`] type:
//! - a `.creds` bundle holding a user JWT and the matching NKEY seed,
//! - a bare NKEY seed file (the public key is presented instead of a JWT),
//! - user supplied callbacks.
//!
//! Files are read at handshake time, not at construction, so rotated
//! credentials are picked up on the next reconnect.

use std::{
    fmt, fs,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use nkeys::KeyPair;
use tracing::trace;

use crate::error::{ClientError, ClientResult};

/// Boxed error a credential callback may fail with.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Signs a nonce and returns the raw signature bytes.
pub type SignatureFn = Arc<dyn Fn(&[u8]) -> Result<Vec<u8>, BoxError> + Send + Sync>;

/// Produces a string credential (a user JWT or a public NKEY).
pub type StringFn = Arc<dyn Fn() -> Result<String, BoxError> + Send + Sync>;

/// Where the signing capability comes from. Exactly one per connection.
#[derive(Clone)]
pub enum Credentials {
    /// A combined JWT + seed bundle on disk.
    FileBundle(PathBuf),
    /// A bare NKEY seed on disk.
    RawSeed(PathBuf),
    /// User supplied functions.
    Callbacks(CallbackCredentials),
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::FileBundle(path) => f.debug_tuple("FileBundle").field(path).finish(),
            Credentials::RawSeed(path) => f.debug_tuple("RawSeed").field(path).finish(),
            Credentials::Callbacks(cb) => f.debug_tuple("Callbacks").field(cb).finish(),
        }
    }
}

impl Credentials {
    /// Credentials from a `.creds` bundle.
    pub fn creds_file(path: impl Into<PathBuf>) -> Self {
        Credentials::FileBundle(path.into())
    }

    /// Credentials from a bare seed file.
    pub fn seed_file(path: impl Into<PathBuf>) -> Self {
        Credentials::RawSeed(path.into())
    }

    /// Sign the server nonce.
    pub fn signature(&self, nonce: &[u8]) -> ClientResult<Vec<u8>> {
        match self {
            Credentials::FileBundle(path) => {
                let bundle = read_bundle(path)?;
                sign_with_seed(&bundle.seed, nonce)
            }
            Credentials::RawSeed(path) => sign_with_seed(&read_seed(path)?, nonce),
            Credentials::Callbacks(cb) => cb.signature(nonce),
        }
    }

    /// The user JWT, if this source has one.
    pub fn token(&self) -> ClientResult<Option<String>> {
        match self {
            Credentials::FileBundle(path) => Ok(Some(read_bundle(path)?.jwt)),
            Credentials::RawSeed(_) => Ok(None),
            Credentials::Callbacks(cb) => cb.token(),
        }
    }

    /// The public NKEY to present when there's no JWT.
    pub fn public_key(&self) -> ClientResult<Option<String>> {
        match self {
            // the JWT already names the user key
            Credentials::FileBundle(_) => Ok(None),
            Credentials::RawSeed(path) => Ok(Some(public_key_of(&read_seed(path)?)?)),
            Credentials::Callbacks(cb) => cb.public_key(),
        }
    }
}

/// User supplied credential functions.
///
/// Each function records how many times it ran so that callers can observe
/// that the handshake actually consulted them.
#[derive(Clone)]
pub struct CallbackCredentials {
    signature: SignatureFn,
    token: Option<StringFn>,
    nkey: Option<StringFn>,
    counters: Arc<CallCounters>,
}

#[derive(Debug, Default)]
struct CallCounters {
    signature: AtomicUsize,
    token: AtomicUsize,
    nkey: AtomicUsize,
}

impl fmt::Debug for CallbackCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackCredentials")
            .field("has_token", &self.token.is_some())
            .field("has_nkey", &self.nkey.is_some())
            .field("counters", &self.counters)
            .finish()
    }
}

impl CallbackCredentials {
    /// Callback credentials with only a signature function.
    pub fn new<F>(signature: F) -> Self
    where
        F: Fn(&[u8]) -> Result<Vec<u8>, BoxError> + Send + Sync + 'static,
    {
        Self::from_arc(Arc::new(signature))
    }

    pub(crate) fn from_arc(signature: SignatureFn) -> Self {
        Self {
            signature,
            token: None,
            nkey: None,
            counters: Arc::new(CallCounters::default()),
        }
    }

    /// Add a JWT callback.
    pub fn with_token<F>(mut self, token: F) -> Self
    where
        F: Fn() -> Result<String, BoxError> + Send + Sync + 'static,
    {
        self.token = Some(Arc::new(token));
        self
    }

    /// Add a public NKEY callback.
    pub fn with_nkey<F>(mut self, nkey: F) -> Self
    where
        F: Fn() -> Result<String, BoxError> + Send + Sync + 'static,
    {
        self.nkey = Some(Arc::new(nkey));
        self
    }

    pub(crate) fn set_token(&mut self, token: StringFn) {
        self.token = Some(token);
    }

    pub(crate) fn set_nkey(&mut self, nkey: StringFn) {
        self.nkey = Some(nkey);
    }

    /// times the signature callback ran
    pub fn signature_calls(&self) -> usize {
        self.counters.signature.load(Ordering::Acquire)
    }

    /// times the JWT callback ran
    pub fn token_calls(&self) -> usize {
        self.counters.token.load(Ordering::Acquire)
    }

    /// times the NKEY callback ran
    pub fn nkey_calls(&self) -> usize {
        self.counters.nkey.load(Ordering::Acquire)
    }

    fn signature(&self, nonce: &[u8]) -> ClientResult<Vec<u8>> {
        self.counters.signature.fetch_add(1, Ordering::AcqRel);
        trace!("invoking user signature callback");
        (self.signature)(nonce)
            .map_err(|e| ClientError::Credential(format!("signature callback failed: {e}")))
    }

    fn token(&self) -> ClientResult<Option<String>> {
        let Some(ref token) = self.token else {
            return Ok(None);
        };
        self.counters.token.fetch_add(1, Ordering::AcqRel);
        trace!("invoking user jwt callback");
        token()
            .map(Some)
            .map_err(|e| ClientError::Credential(format!("jwt callback failed: {e}")))
    }

    fn public_key(&self) -> ClientResult<Option<String>> {
        let Some(ref nkey) = self.nkey else {
            return Ok(None);
        };
        self.counters.nkey.fetch_add(1, Ordering::AcqRel);
        trace!("invoking user nkey callback");
        nkey()
            .map(Some)
            .map_err(|e| ClientError::Credential(format!("nkey callback failed: {e}")))
    }
}

/// Signature function backed by a `.creds` bundle, for wrapping in a callback.
pub fn signature_from_creds_file(
    path: impl AsRef<Path>,
) -> impl Fn(&[u8]) -> Result<Vec<u8>, BoxError> + Send + Sync + 'static {
    let path = path.as_ref().to_path_buf();
    move |nonce| {
        let bundle = read_bundle(&path)?;
        Ok(sign_with_seed(&bundle.seed, nonce)?)
    }
}

/// JWT function backed by a `.creds` bundle, for wrapping in a callback.
pub fn token_from_creds_file(
    path: impl AsRef<Path>,
) -> impl Fn() -> Result<String, BoxError> + Send + Sync + 'static {
    let path = path.as_ref().to_path_buf();
    move || Ok(read_bundle(&path)?.jwt)
}

/// Signature function backed by a seed file, for wrapping in a callback.
pub fn signature_from_seed_file(
    path: impl AsRef<Path>,
) -> impl Fn(&[u8]) -> Result<Vec<u8>, BoxError> + Send + Sync + 'static {
    let path = path.as_ref().to_path_buf();
    move |nonce| Ok(sign_with_seed(&read_seed(&path)?, nonce)?)
}

/// Public key function backed by a seed file, for wrapping in a callback.
pub fn public_key_from_seed_file(
    path: impl AsRef<Path>,
) -> impl Fn() -> Result<String, BoxError> + Send + Sync + 'static {
    let path = path.as_ref().to_path_buf();
    move || Ok(public_key_of(&read_seed(&path)?)?)
}

/// The two halves of a `.creds` bundle.
#[derive(Clone, PartialEq, Eq)]
pub(crate) struct Bundle {
    pub(crate) jwt: String,
    pub(crate) seed: String,
}

impl fmt::Debug for Bundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bundle")
            .field("jwt", &self.jwt)
            .finish_non_exhaustive()
    }
}

fn read_file(path: &Path) -> ClientResult<String> {
    fs::read_to_string(path).map_err(|e| {
        ClientError::Credential(format!(
            "failed to read credentials file '{}': {e}",
            path.display()
        ))
    })
}

fn read_bundle(path: &Path) -> ClientResult<Bundle> {
    parse_bundle(&read_file(path)?).map_err(|e| match e {
        ClientError::Credential(msg) => {
            ClientError::Credential(format!("{msg} in '{}'", path.display()))
        }
        other => other,
    })
}

fn read_seed(path: &Path) -> ClientResult<String> {
    let contents = read_file(path)?;
    // a seed file may be bare or use the same decorated blocks as a bundle
    let seed = decorated_blocks(&contents)
        .into_iter()
        .find(|block| block.starts_with('S'))
        .or_else(|| {
            contents
                .lines()
                .map(str::trim)
                .find(|line| line.starts_with('S') && !line.is_empty())
                .map(str::to_owned)
        })
        .ok_or_else(|| {
            ClientError::Credential(format!("no nkey seed found in '{}'", path.display()))
        })?;
    Ok(seed)
}

/// Parse a `.creds` bundle: the first decorated block is the JWT, the second
/// is the seed.
pub(crate) fn parse_bundle(contents: &str) -> ClientResult<Bundle> {
    let mut blocks = decorated_blocks(contents).into_iter();
    let jwt = blocks
        .next()
        .ok_or_else(|| ClientError::Credential("no user jwt found".into()))?;
    let seed = blocks
        .next()
        .ok_or_else(|| ClientError::Credential("no nkey seed found".into()))?;
    Ok(Bundle { jwt, seed })
}

fn is_marker(line: &str) -> bool {
    line.len() >= 6 && line.starts_with("---") && line.ends_with("---")
}

/// Bodies of `-----BEGIN ...-----` / `------END ...------` blocks, in order.
fn decorated_blocks(contents: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut lines = contents.lines().map(str::trim);
    while let Some(line) = lines.next() {
        if !(is_marker(line) && line.contains("BEGIN")) {
            continue;
        }
        match lines.by_ref().find(|l| !l.is_empty()) {
            Some(body) if !is_marker(body) => blocks.push(body.to_owned()),
            _ => {}
        }
    }
    blocks
}

fn key_pair(seed: &str) -> ClientResult<KeyPair> {
    KeyPair::from_seed(seed.trim())
        .map_err(|e| ClientError::Credential(format!("invalid nkey seed: {e}")))
}

fn sign_with_seed(seed: &str, nonce: &[u8]) -> ClientResult<Vec<u8>> {
    key_pair(seed)?
        .sign(nonce)
        .map_err(|e| ClientError::Credential(format!("failed to sign nonce: {e}")))
}

fn public_key_of(seed: &str) -> ClientResult<String> {
    Ok(key_pair(seed)?.public_key())
}
