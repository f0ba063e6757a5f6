//! Test identities, generated fresh for every test.

use std::path::{Path, PathBuf};

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use nkeys::KeyPair;
use serde_json::json;
use tempfile::TempDir;

/// An account key that signs user JWTs.
pub struct Account {
    pub key: KeyPair,
}

impl Account {
    pub fn new() -> Self {
        Self {
            key: KeyPair::new_account(),
        }
    }

    pub fn public_key(&self) -> String {
        self.key.public_key()
    }

    /// Issue a user under this account and write its credential files.
    pub fn issue_user(&self, name: &str) -> User {
        let key = KeyPair::new_user();
        let jwt = issue_jwt(&self.key, &key.public_key(), name);
        let seed = key.seed().unwrap();
        let dir = tempfile::tempdir().unwrap();

        let creds_path = dir.path().join(format!("{name}.creds"));
        std::fs::write(&creds_path, creds_file(&jwt, &seed)).unwrap();
        let seed_path = dir.path().join(format!("{name}.nk"));
        std::fs::write(&seed_path, format!("{seed}\n")).unwrap();

        User {
            key,
            jwt,
            creds_path,
            seed_path,
            _dir: dir,
        }
    }
}

/// A user identity with its files on disk.
pub struct User {
    pub key: KeyPair,
    pub jwt: String,
    pub creds_path: PathBuf,
    pub seed_path: PathBuf,
    _dir: TempDir,
}

impl User {
    pub fn public_key(&self) -> String {
        self.key.public_key()
    }

    pub fn creds(&self) -> &Path {
        &self.creds_path
    }

    pub fn seed(&self) -> &Path {
        &self.seed_path
    }
}

/// `header.payload.sig`, signed by `account` over `header.payload`.
pub fn issue_jwt(account: &KeyPair, user: &str, name: &str) -> String {
    let header = URL_SAFE_NO_PAD.encode(json!({"typ": "JWT", "alg": "ed25519-nkey"}).to_string());
    let claims = URL_SAFE_NO_PAD.encode(
        json!({
            "sub": user,
            "iss": account.public_key(),
            "name": name,
            "nats": {"type": "user", "version": 2},
        })
        .to_string(),
    );
    let signing_input = format!("{header}.{claims}");
    let sig = account.sign(signing_input.as_bytes()).unwrap();
    format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(sig))
}

pub fn creds_file(jwt: &str, seed: &str) -> String {
    format!(
        "-----BEGIN NATS USER JWT-----\n{jwt}\n------END NATS USER JWT------\n\n\
         ************************* IMPORTANT *************************\n\
         NKEY Seed printed below can be used to sign and prove identity.\n\
         NKEYs are sensitive and should be treated as secrets.\n\n\
         -----BEGIN USER NKEY SEED-----\n{seed}\n------END USER NKEY SEED------\n\n\
         *************************************************************\n"
    )
}
