/// SCRAM (RFC 5802 / RFC 7677) over a pluggable hash.
///
/// One implementation serves SCRAM-SHA-1, SCRAM-SHA-256, and SCRAM-SHA-512;
/// the digest type decides the mechanism name and every key length. Channel
/// binding is not used: the GS2 header is fixed to `n,,` and the client
/// final message carries `c=biws`, its Base64 form.
///
/// The password copy, the salted password, and the derived keys are wiped
/// as soon as the exchange completes, successfully or not.
use std::marker::PhantomData;

use base64::engine::general_purpose::{STANDARD as B64, URL_SAFE_NO_PAD};
use base64::Engine;
use digest::core_api::BlockSizeUser;
use digest::Digest;
use hmac::{Mac, SimpleHmac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use tracing::warn;
use zeroize::{Zeroize, Zeroizing};

use crate::error::{Error, Result};
use crate::sasl::{Mechanism, SaslContext};

/// RFC 5802 hard floor for the server-advertised iteration count.
const MIN_ITERATIONS: u32 = 4096;
/// OWASP 2023 recommendation; lower counts are logged at warn level.
const OWASP_ITERATIONS: u32 = 600_000;

pub type ScramSha1 = Scram<Sha1>;
pub type ScramSha256 = Scram<Sha256>;
pub type ScramSha512 = Scram<Sha512>;

pub trait ScramDigest {
    const NAME: &'static str;
}

impl ScramDigest for Sha1 {
    const NAME: &'static str = "SCRAM-SHA-1";
}

impl ScramDigest for Sha256 {
    const NAME: &'static str = "SCRAM-SHA-256";
}

impl ScramDigest for Sha512 {
    const NAME: &'static str = "SCRAM-SHA-512";
}

enum State {
    Initial,
    AwaitingChallenge {
        client_first_bare: String,
    },
    AwaitingOutcome {
        salted_password: Zeroizing<Vec<u8>>,
        auth_message: String,
        /// Set when the server signature already arrived in a final
        /// challenge rather than in the success content.
        server_verified: bool,
    },
    Complete,
    Failed,
}

pub struct Scram<D> {
    username: String,
    password: Zeroizing<Vec<u8>>,
    min_iterations: u32,
    client_nonce: String,
    state: State,
    _digest: PhantomData<D>,
}

impl<D> Scram<D>
where
    D: Digest + BlockSizeUser + ScramDigest + Clone + Sync + Send + 'static,
{
    pub fn new(ctx: &SaslContext) -> Self {
        let mut nonce = [0u8; 32];
        OsRng.fill_bytes(&mut nonce);
        Self::with_client_nonce(ctx, &URL_SAFE_NO_PAD.encode(nonce))
    }

    fn with_client_nonce(ctx: &SaslContext, nonce: &str) -> Self {
        Self {
            username: ctx.username.clone(),
            password: ctx.password.clone(),
            min_iterations: ctx.min_scram_iterations.max(MIN_ITERATIONS),
            client_nonce: nonce.to_string(),
            state: State::Initial,
            _digest: PhantomData,
        }
    }

    fn fail(&mut self, message: String) -> Error {
        self.wipe();
        self.state = State::Failed;
        Error::Auth(message)
    }

    fn wipe(&mut self) {
        self.password.zeroize();
    }

    fn compute_final(
        &mut self,
        client_first_bare: &str,
        server_first: &str,
    ) -> Result<(Vec<u8>, State)> {
        let (combined_nonce, salt_b64, iterations) = parse_server_first(server_first)
            .map_err(|e| self.fail(e))?;

        if !combined_nonce.starts_with(&self.client_nonce) {
            return Err(self.fail("server nonce does not extend the client nonce".into()));
        }
        if iterations < self.min_iterations {
            return Err(self.fail(format!(
                "server iteration count {iterations} below the required minimum {}",
                self.min_iterations
            )));
        }
        if iterations < OWASP_ITERATIONS {
            warn!(
                mechanism = D::NAME,
                iterations, "server iteration count is below the OWASP recommendation"
            );
        }
        let salt = B64
            .decode(&salt_b64)
            .map_err(|e| self.fail(format!("undecodable salt: {e}")))?;

        let mut salted_password = Zeroizing::new(vec![0u8; <D as Digest>::output_size()]);
        pbkdf2::pbkdf2::<SimpleHmac<D>>(&self.password, &salt, iterations, &mut salted_password)
            .map_err(|_| self.fail("PBKDF2 output length mismatch".into()))?;

        let client_key = Zeroizing::new(hmac::<D>(&salted_password, b"Client Key")?);
        let stored_key = Zeroizing::new(D::digest(&client_key).to_vec());

        let client_final_without_proof = format!("c=biws,r={combined_nonce}");
        let auth_message =
            format!("{client_first_bare},{server_first},{client_final_without_proof}");

        let client_signature = Zeroizing::new(hmac::<D>(&stored_key, auth_message.as_bytes())?);
        let client_proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(k, s)| k ^ s)
            .collect();

        let client_final =
            format!("{client_final_without_proof},p={}", B64.encode(&client_proof));

        Ok((
            client_final.into_bytes(),
            State::AwaitingOutcome {
                salted_password,
                auth_message,
                server_verified: false,
            },
        ))
    }

    /// Constant-time check of the server signature from `v=...` / `e=...`.
    fn verify_server_final(
        salted_password: &[u8],
        auth_message: &str,
        data: &[u8],
    ) -> Result<()> {
        let text = std::str::from_utf8(data)
            .map_err(|_| Error::Auth("server final message is not UTF-8".into()))?;
        if let Some(err) = text.strip_prefix("e=") {
            return Err(Error::Auth(format!("server reported SCRAM error: {err}")));
        }
        let signature_b64 = text
            .strip_prefix("v=")
            .ok_or_else(|| Error::Auth("server final message carries no signature".into()))?
            .trim_end_matches(',');
        let signature = B64
            .decode(signature_b64)
            .map_err(|e| Error::Auth(format!("undecodable server signature: {e}")))?;

        let server_key = Zeroizing::new(hmac::<D>(salted_password, b"Server Key")?);
        let mut mac = SimpleHmac::<D>::new_from_slice(&server_key)
            .map_err(|_| Error::Auth("HMAC key setup failed".into()))?;
        mac.update(auth_message.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| Error::Auth("server signature mismatch".into()))
    }
}

impl<D> Mechanism for Scram<D>
where
    D: Digest + BlockSizeUser + ScramDigest + Clone + Sync + Send + 'static,
{
    fn name(&self) -> &'static str {
        D::NAME
    }

    fn initial(&mut self) -> Result<Vec<u8>> {
        match self.state {
            State::Initial => {
                let client_first_bare = format!(
                    "n={},r={}",
                    saslname_escape(&self.username),
                    self.client_nonce
                );
                let message = format!("n,,{client_first_bare}");
                self.state = State::AwaitingChallenge { client_first_bare };
                Ok(message.into_bytes())
            }
            _ => Err(Error::Auth("SCRAM initial response requested twice".into())),
        }
    }

    fn respond(&mut self, challenge: &[u8]) -> Result<Vec<u8>> {
        let challenge = std::str::from_utf8(challenge)
            .map_err(|_| self.fail("SCRAM challenge is not UTF-8".into()))?
            .to_string();

        match std::mem::replace(&mut self.state, State::Failed) {
            State::AwaitingChallenge { client_first_bare } => {
                let (response, next) = self.compute_final(&client_first_bare, &challenge)?;
                self.state = next;
                Ok(response)
            }
            // Some servers deliver the server-final message as one more
            // challenge expecting an empty response.
            State::AwaitingOutcome {
                salted_password,
                auth_message,
                ..
            } => {
                Self::verify_server_final(&salted_password, &auth_message, challenge.as_bytes())
                    .map_err(|e| self.fail(e.to_string()))?;
                self.state = State::AwaitingOutcome {
                    salted_password,
                    auth_message,
                    server_verified: true,
                };
                Ok(Vec::new())
            }
            _ => Err(self.fail("SCRAM challenge in unexpected state".into())),
        }
    }

    fn verify_success(&mut self, data: Option<&[u8]>) -> Result<()> {
        match std::mem::replace(&mut self.state, State::Failed) {
            State::AwaitingOutcome {
                salted_password,
                auth_message,
                server_verified,
            } => {
                let outcome = match data {
                    Some(bytes) => {
                        Self::verify_server_final(&salted_password, &auth_message, bytes)
                    }
                    None if server_verified => Ok(()),
                    None => Err(Error::Auth(
                        "server completed SCRAM without proving itself".into(),
                    )),
                };
                self.wipe();
                match outcome {
                    Ok(()) => {
                        self.state = State::Complete;
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            State::Complete => {
                self.state = State::Complete;
                Ok(())
            }
            _ => Err(self.fail("SCRAM success in unexpected state".into())),
        }
    }

    fn is_complete(&self) -> bool {
        matches!(self.state, State::Complete)
    }
}

fn hmac<D>(key: &[u8], data: &[u8]) -> Result<Vec<u8>>
where
    D: Digest + BlockSizeUser + Clone,
{
    let mut mac = SimpleHmac::<D>::new_from_slice(key)
        .map_err(|_| Error::Auth("HMAC key setup failed".into()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// RFC 5802 saslname encoding for the `n=` attribute.
fn saslname_escape(name: &str) -> String {
    name.replace('=', "=3D").replace(',', "=2C")
}

/// Parses `r=<nonce>,s=<b64 salt>,i=<iterations>` from the server-first
/// message, ignoring optional extensions.
fn parse_server_first(msg: &str) -> std::result::Result<(String, String, u32), String> {
    let mut nonce = None;
    let mut salt = None;
    let mut iterations = None;

    for part in msg.split(',') {
        if let Some(val) = part.strip_prefix("r=") {
            nonce = Some(val.to_string());
        } else if let Some(val) = part.strip_prefix("s=") {
            salt = Some(val.to_string());
        } else if let Some(val) = part.strip_prefix("i=") {
            iterations = Some(
                val.parse::<u32>()
                    .map_err(|_| format!("bad iteration count '{val}'"))?,
            );
        } else if part.starts_with("m=") {
            return Err("server requires a mandatory extension we do not support".into());
        }
    }

    Ok((
        nonce.ok_or("missing nonce in server-first message")?,
        salt.ok_or("missing salt in server-first message")?,
        iterations.ok_or("missing iteration count in server-first message")?,
    ))
}
