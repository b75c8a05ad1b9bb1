//! Authentication-flow responses. The engine recognises them only to
//! fail the handshake cleanly; no challenge/response flow is driven.

use crate::frame::frame_errors::ParseError;
use crate::frame::types;

/// AUTHENTICATE: the server demands authentication before READY.
#[derive(Debug)]
pub struct Authenticate {
    /// Fully qualified class name of the server-side authenticator.
    pub authenticator_name: String,
}

impl Authenticate {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let authenticator_name = types::read_string(buf)?.to_owned();
        Ok(Authenticate { authenticator_name })
    }
}

#[derive(Debug)]
pub struct AuthChallenge {
    pub authenticate_message: Option<Vec<u8>>,
}

impl AuthChallenge {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let authenticate_message = types::read_bytes_opt(buf)?.map(|b| b.to_owned());
        Ok(Self {
            authenticate_message,
        })
    }
}

#[derive(Debug)]
pub struct AuthSuccess {
    pub success_message: Option<Vec<u8>>,
}

impl AuthSuccess {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let success_message = types::read_bytes_opt(buf)?.map(|b| b.to_owned());
        Ok(Self { success_message })
    }
}
