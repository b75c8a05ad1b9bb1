//! CQL responses received from the server.

pub mod authenticate;
pub mod error;
pub mod event;
pub mod result;
pub mod supported;

use num_enum::TryFromPrimitive;

pub use error::Error;
pub use event::Event;
pub use supported::Supported;

use super::frame_errors::ParseError;

/// Opcode identifying the response type in a frame header.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, TryFromPrimitive)]
#[repr(u8)]
pub enum ResponseOpcode {
    Error = 0x00,
    Ready = 0x02,
    Authenticate = 0x03,
    Supported = 0x06,
    Result = 0x08,
    Event = 0x0C,
    AuthChallenge = 0x0E,
    AuthSuccess = 0x10,
}

/// A decoded response body, tagged by opcode.
#[derive(Debug)]
pub enum Response {
    Error(Error),
    Ready,
    Authenticate(authenticate::Authenticate),
    Supported(Supported),
    Result(result::Result),
    Event(Event),
    AuthChallenge(authenticate::AuthChallenge),
    AuthSuccess(authenticate::AuthSuccess),
}

impl Response {
    pub fn deserialize(opcode: ResponseOpcode, buf: &mut &[u8]) -> Result<Response, ParseError> {
        let response = match opcode {
            ResponseOpcode::Error => Response::Error(Error::deserialize(buf)?),
            ResponseOpcode::Ready => Response::Ready,
            ResponseOpcode::Authenticate => {
                Response::Authenticate(authenticate::Authenticate::deserialize(buf)?)
            }
            ResponseOpcode::Supported => Response::Supported(Supported::deserialize(buf)?),
            ResponseOpcode::Result => Response::Result(result::deserialize(buf)?),
            ResponseOpcode::Event => Response::Event(Event::deserialize(buf)?),
            ResponseOpcode::AuthChallenge => {
                Response::AuthChallenge(authenticate::AuthChallenge::deserialize(buf)?)
            }
            ResponseOpcode::AuthSuccess => {
                Response::AuthSuccess(authenticate::AuthSuccess::deserialize(buf)?)
            }
        };
        Ok(response)
    }

    /// Response kind name for diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Response::Error(_) => "ERROR",
            Response::Ready => "READY",
            Response::Authenticate(_) => "AUTHENTICATE",
            Response::Supported(_) => "SUPPORTED",
            Response::Result(_) => "RESULT",
            Response::Event(_) => "EVENT",
            Response::AuthChallenge(_) => "AUTH_CHALLENGE",
            Response::AuthSuccess(_) => "AUTH_SUCCESS",
        }
    }
}
