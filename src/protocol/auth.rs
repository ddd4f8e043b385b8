//! Verifier-based login handshake (SRP-6a over the RFC 5054 2048-bit group,
//! SHA-256).
//!
//! The client sends its identity; the server answers with a salt and its
//! ephemeral public value `B`; the client derives the session key through
//! modular exponentiation and a hash chain, sends its own ephemeral public
//! value `A` plus proof `M1`, and finally validates the server's proof `M2`
//! in constant time before trusting the key.
//!
//! Handshake state is session-scoped: one [`AuthSession`] per peer, never
//! shared, zeroized on drop. Ephemeral secrets come from the OS CSPRNG.
//!
//! [`server`] holds the server half of the math. The engine is client-only,
//! but verifier registration tooling and the loopback tests need it.

use crate::error::{ProtocolError, Result};
use num_bigint::BigUint;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{debug, instrument};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// RFC 5054 2048-bit group prime, big-endian hex
const N_HEX: &str = "AC6BDB41324A9A9BF166DE5E1389582FAF72B6651987EE07FC3192943DB56050\
                     A37329CBB4A099ED8193E0757767A13DD52312AB4B03310DCD7F48A9DA04FD50\
                     E8083969EDB767B0CF6095179A163AB3661A05FBD5FAAAE82918A9962F0B93B8\
                     55F97993EC975EEAA80D740ADBF4FF747359D041D5C33EA71D281E446B14773B\
                     CA97B43A23FB801676BD207A436C6481F1D2B9078717461A5B9D32E688F87748\
                     544523B524B0D57D5EA77A2775D2ECFA032CFBDBF52FB3786160279004E57AE6\
                     AF874E7303CE53299CCC041C7BC308D82A5698F3A8D0C38271AE35F8E9DBFBB6\
                     94B5C803D89F7AE435DE236D525F54759B65E372FCD68EF20FA7111F9E4AFF73";

/// Group generator
const G: u32 = 2;

/// Byte length of the group prime; all public values are padded to this
const N_LEN: usize = 256;

fn group_n() -> BigUint {
    let hex: String = N_HEX.chars().filter(|c| !c.is_whitespace()).collect();
    BigUint::parse_bytes(hex.as_bytes(), 16).unwrap_or_default()
}

fn group_g() -> BigUint {
    BigUint::from(G)
}

/// Left-pad a group element to the prime's byte length
fn pad(value: &BigUint) -> Vec<u8> {
    let raw = value.to_bytes_be();
    let mut out = vec![0u8; N_LEN.saturating_sub(raw.len())];
    out.extend_from_slice(&raw);
    out
}

fn hash(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Multiplier parameter k = H(N || PAD(g))
fn multiplier_k(n: &BigUint) -> BigUint {
    BigUint::from_bytes_be(&hash(&[&pad(n), &pad(&group_g())]))
}

/// Private key x = H(salt || H(name ":" password))
fn private_x(name: &str, password: &[u8], salt: &[u8]) -> BigUint {
    let inner = hash(&[name.as_bytes(), b":", password]);
    BigUint::from_bytes_be(&hash(&[salt, &inner]))
}

/// Scrambling parameter u = H(PAD(A) || PAD(B))
fn scramble_u(a_pub: &BigUint, b_pub: &BigUint) -> BigUint {
    BigUint::from_bytes_be(&hash(&[&pad(a_pub), &pad(b_pub)]))
}

fn random_exponent() -> Result<Vec<u8>> {
    let mut raw = [0u8; 32];
    getrandom::fill(&mut raw).map_err(|e| {
        ProtocolError::AuthenticationFailed(format!("no entropy source available: {e}"))
    })?;
    Ok(raw.to_vec())
}

/// Login handshake progress for one peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Init,
    SentHello,
    ReceivedChallenge,
    SentProof,
    Authenticated,
    Failed,
}

/// Client side of the verifier handshake. One per peer; the derived key is
/// scoped to that peer and discarded with the session.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct AuthSession {
    #[zeroize(skip)]
    state: AuthState,
    #[zeroize(skip)]
    name: String,
    password: Vec<u8>,
    secret_a: Vec<u8>,
    public_a: Vec<u8>,
    session_key: Vec<u8>,
    expected_m2: Vec<u8>,
}

impl AuthSession {
    pub fn new(name: &str, password: &str) -> Self {
        Self {
            state: AuthState::Init,
            name: name.to_string(),
            password: password.as_bytes().to_vec(),
            secret_a: Vec::new(),
            public_a: Vec::new(),
            session_key: Vec::new(),
            expected_m2: Vec::new(),
        }
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Derived session key; only present once the server's proof validated
    pub fn shared_key(&self) -> Option<&[u8]> {
        (self.state == AuthState::Authenticated).then_some(self.session_key.as_slice())
    }

    /// Mark the identity announcement as sent
    pub fn hello_sent(&mut self) -> Result<()> {
        if self.state != AuthState::Init {
            return Err(ProtocolError::InvalidState("auth hello already sent"));
        }
        self.state = AuthState::SentHello;
        Ok(())
    }

    /// Process the server challenge (salt + ephemeral public `B`) and
    /// produce this client's public value `A` and proof `M1`.
    ///
    /// # Errors
    /// `AuthenticationFailed` if `B` is not a valid group element or the
    /// challenge arrives out of order.
    #[instrument(skip_all, fields(player = %self.name))]
    pub fn handle_challenge(&mut self, salt: &[u8], server_b: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
        if self.state != AuthState::SentHello {
            self.state = AuthState::Failed;
            return Err(ProtocolError::AuthenticationFailed(
                "challenge received out of order".into(),
            ));
        }
        self.state = AuthState::ReceivedChallenge;

        let n = group_n();
        let b_pub = BigUint::from_bytes_be(server_b);
        if is_zero_mod(&b_pub, &n) {
            self.state = AuthState::Failed;
            return Err(ProtocolError::AuthenticationFailed(
                "server ephemeral value is zero mod N".into(),
            ));
        }

        self.secret_a = random_exponent()?;
        let a = BigUint::from_bytes_be(&self.secret_a);
        let a_pub = group_g().modpow(&a, &n);
        self.public_a = pad(&a_pub);

        let u = scramble_u(&a_pub, &b_pub);
        let x = private_x(&self.name, &self.password, salt);
        let k = multiplier_k(&n);

        // S = (B - k * g^x) ^ (a + u * x) mod N
        let g_x = group_g().modpow(&x, &n);
        let base = (&b_pub + (&n - (k * g_x) % &n)) % &n;
        let exponent = a + u * x;
        let premaster = base.modpow(&exponent, &n);

        let key = hash(&[&pad(&premaster)]);
        let m1 = hash(&[&self.public_a, &pad(&b_pub), &key]);
        let m2 = hash(&[&self.public_a, &m1, &key]);

        self.session_key = key.to_vec();
        self.expected_m2 = m2.to_vec();
        self.state = AuthState::SentProof;

        debug!("derived session key, sending proof");
        Ok((self.public_a.clone(), m1.to_vec()))
    }

    /// Validate the server's proof `M2`. Constant-time comparison; a
    /// mismatch poisons the session permanently.
    #[instrument(skip_all, fields(player = %self.name))]
    pub fn handle_result(&mut self, server_m2: &[u8]) -> Result<()> {
        if self.state != AuthState::SentProof {
            self.state = AuthState::Failed;
            return Err(ProtocolError::AuthenticationFailed(
                "proof result received out of order".into(),
            ));
        }

        if server_m2.len() != self.expected_m2.len()
            || server_m2.ct_eq(&self.expected_m2).unwrap_u8() != 1
        {
            self.state = AuthState::Failed;
            self.session_key.zeroize();
            return Err(ProtocolError::AuthenticationFailed(
                "server proof mismatch".into(),
            ));
        }

        self.state = AuthState::Authenticated;
        debug!("server proof validated, session authenticated");
        Ok(())
    }
}

/// A public value congruent to zero would collapse the shared secret
fn is_zero_mod(value: &BigUint, n: &BigUint) -> bool {
    (value % n) == BigUint::default()
}

/// Server half of the exchange: verifier registration and challenge
/// generation. The engine never runs this against live traffic; tooling and
/// the loopback tests do.
pub mod server {
    use super::*;

    /// Password verifier v = g^x mod N, stored server-side at registration
    pub fn verifier(name: &str, password: &str, salt: &[u8]) -> Vec<u8> {
        let n = group_n();
        let x = private_x(name, password.as_bytes(), salt);
        pad(&group_g().modpow(&x, &n))
    }

    /// In-flight server exchange for one login attempt
    pub struct ServerExchange {
        verifier: BigUint,
        secret_b: BigUint,
        public_b: Vec<u8>,
    }

    impl ServerExchange {
        /// Generate the ephemeral pair; `public_b()` goes into the challenge
        pub fn start(verifier_bytes: &[u8]) -> Result<Self> {
            let n = group_n();
            let v = BigUint::from_bytes_be(verifier_bytes);
            let b = BigUint::from_bytes_be(&random_exponent()?);
            // B = k*v + g^b mod N
            let b_pub = (multiplier_k(&n) * &v + group_g().modpow(&b, &n)) % &n;
            Ok(Self {
                verifier: v,
                secret_b: b,
                public_b: pad(&b_pub),
            })
        }

        pub fn public_b(&self) -> &[u8] {
            &self.public_b
        }

        /// Validate the client's proof `M1` and produce the session key and
        /// the server proof `M2`.
        pub fn finish(&self, client_a: &[u8], client_m1: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
            let n = group_n();
            let a_pub = BigUint::from_bytes_be(client_a);
            if is_zero_mod(&a_pub, &n) {
                return Err(ProtocolError::AuthenticationFailed(
                    "client ephemeral value is zero mod N".into(),
                ));
            }

            let b_pub = BigUint::from_bytes_be(&self.public_b);
            let u = scramble_u(&a_pub, &b_pub);

            // S = (A * v^u) ^ b mod N
            let premaster =
                ((&a_pub % &n) * self.verifier.modpow(&u, &n) % &n).modpow(&self.secret_b, &n);
            let key = hash(&[&pad(&premaster)]);

            let expected_m1 = hash(&[&pad(&a_pub), &self.public_b, &key]);
            if client_m1.len() != expected_m1.len()
                || client_m1.ct_eq(&expected_m1).unwrap_u8() != 1
            {
                return Err(ProtocolError::AuthenticationFailed(
                    "client proof mismatch".into(),
                ));
            }

            let m2 = hash(&[&pad(&a_pub), &expected_m1, &key]);
            Ok((key.to_vec(), m2.to_vec()))
        }
    }
}
