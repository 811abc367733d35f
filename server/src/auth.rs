//! Challenge/response sequencing between a joining client and the
//! pluggable [`Authenticator`].

use crate::error::CloseReason;
use log::{debug, warn};
use rand::Rng;
use shared::{ClientId, PacketCipher};
use std::collections::HashMap;
use std::net::SocketAddr;

/// Why an authenticator refused a client. Only ever logged; the peer is told
/// `NotAuthorized` whatever the reason.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthRejection {
    #[error("wrong password")]
    WrongPassword,
    #[error("invalid or unknown key")]
    InvalidKey,
    #[error("response to a challenge that was never issued")]
    NoChallenge,
    #[error("{0}")]
    Other(String),
}

/// Verdict on one authentication reply.
pub enum AuthOutcome {
    Accepted {
        peer_public_key: Option<String>,
        /// Installed on the session for every later frame.
        cipher: Option<Box<dyn PacketCipher>>,
    },
    Rejected(AuthRejection),
    /// Send this as the next challenge.
    NeedMoreSteps(Vec<u8>),
}

/// The cryptographic side of authentication, consumed as a black box.
pub trait Authenticator: Send {
    /// Produces the first challenge for `client`.
    fn begin(&mut self, client: ClientId) -> Vec<u8>;

    fn respond(&mut self, client: ClientId, reply: &[u8]) -> AuthOutcome;

    /// Drops any per-client state when the client goes away mid-exchange.
    fn abandon(&mut self, _client: ClientId) {}
}

/// Shared-secret authenticator.
///
/// The challenge is an 8-byte random nonce; the reply must be the nonce
/// followed by the password. Without a configured password every reply is
/// accepted.
pub struct PasswordAuthenticator {
    password: Option<String>,
    nonces: HashMap<ClientId, [u8; 8]>,
}

impl PasswordAuthenticator {
    pub fn new(password: Option<String>) -> Self {
        Self {
            password: password.filter(|p| !p.is_empty()),
            nonces: HashMap::new(),
        }
    }

    /// The reply a client holding `password` gives to `challenge`.
    pub fn reply_for(challenge: &[u8], password: &str) -> Vec<u8> {
        let mut reply = challenge.to_vec();
        reply.extend_from_slice(password.as_bytes());
        reply
    }
}

impl Authenticator for PasswordAuthenticator {
    fn begin(&mut self, client: ClientId) -> Vec<u8> {
        let nonce: [u8; 8] = rand::thread_rng().gen();
        self.nonces.insert(client, nonce);
        nonce.to_vec()
    }

    fn respond(&mut self, client: ClientId, reply: &[u8]) -> AuthOutcome {
        let Some(nonce) = self.nonces.remove(&client) else {
            return AuthOutcome::Rejected(AuthRejection::NoChallenge);
        };

        let Some(password) = &self.password else {
            return AuthOutcome::Accepted {
                peer_public_key: None,
                cipher: None,
            };
        };

        if reply == Self::reply_for(&nonce, password).as_slice() {
            AuthOutcome::Accepted {
                peer_public_key: None,
                cipher: None,
            }
        } else {
            AuthOutcome::Rejected(AuthRejection::WrongPassword)
        }
    }

    fn abandon(&mut self, client: ClientId) {
        self.nonces.remove(&client);
    }
}

/// Next step after a reply was judged.
pub enum AuthStep {
    Done {
        peer_public_key: Option<String>,
        cipher: Option<Box<dyn PacketCipher>>,
    },
    Challenge(Vec<u8>),
}

/// Sequences the exchange for the server and normalizes rejections.
pub struct AuthGateway {
    authenticator: Box<dyn Authenticator>,
}

impl AuthGateway {
    pub fn new(authenticator: Box<dyn Authenticator>) -> Self {
        Self { authenticator }
    }

    pub fn begin(&mut self, client: ClientId) -> Vec<u8> {
        debug!("Client {} starting authentication", client);
        self.authenticator.begin(client)
    }

    pub fn respond(
        &mut self,
        client: ClientId,
        address: SocketAddr,
        reply: &[u8],
    ) -> Result<AuthStep, CloseReason> {
        match self.authenticator.respond(client, reply) {
            AuthOutcome::Accepted {
                peer_public_key,
                cipher,
            } => Ok(AuthStep::Done {
                peer_public_key,
                cipher,
            }),
            AuthOutcome::NeedMoreSteps(challenge) => Ok(AuthStep::Challenge(challenge)),
            AuthOutcome::Rejected(reason) => {
                warn!(
                    "Client {} from {} failed authentication: {}",
                    client, address, reason
                );
                Err(CloseReason::AuthRejected(reason.to_string()))
            }
        }
    }

    pub fn abandon(&mut self, client: ClientId) {
        self.authenticator.abandon(client);
    }
}
