/// SASL PLAIN (RFC 4616): a single message carrying the credentials in
/// clear. Only selectable over TLS unless the configuration says
/// otherwise; the gate lives in the mechanism registry.
use zeroize::{Zeroize, Zeroizing};

use crate::error::{Error, Result};
use crate::sasl::{Mechanism, SaslContext};

pub struct Plain {
    authzid: Option<String>,
    username: String,
    password: Zeroizing<Vec<u8>>,
    complete: bool,
}

impl Plain {
    pub fn new(ctx: &SaslContext) -> Self {
        Self {
            authzid: ctx.authzid.clone(),
            username: ctx.username.clone(),
            password: ctx.password.clone(),
            complete: false,
        }
    }
}

impl Mechanism for Plain {
    fn name(&self) -> &'static str {
        "PLAIN"
    }

    fn initial(&mut self) -> Result<Vec<u8>> {
        // An empty authzid authorizes as the authenticated identity.
        let mut payload = Vec::with_capacity(2 + self.username.len() + self.password.len());
        if let Some(authzid) = &self.authzid {
            payload.extend_from_slice(authzid.as_bytes());
        }
        payload.push(0);
        payload.extend_from_slice(self.username.as_bytes());
        payload.push(0);
        payload.extend_from_slice(&self.password);
        Ok(payload)
    }

    fn respond(&mut self, _challenge: &[u8]) -> Result<Vec<u8>> {
        Err(Error::Auth("PLAIN received an unexpected challenge".into()))
    }

    fn verify_success(&mut self, _data: Option<&[u8]>) -> Result<()> {
        self.password.zeroize();
        self.complete = true;
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.complete
    }
}
