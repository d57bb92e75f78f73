//! Messages exchanged by the participants.

use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use crate::{
    agreement::{CloseEnvelope, CloseSignatures, OpenEnvelope, OpenSignatures},
    keys::PublicKey,
    ledger,
};

/// One message between the participants
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Introduce the sender
    Hello {
        /// Channel account of the sender
        channel_account: PublicKey,
        /// Signer of the sender
        signer: PublicKey,
    },
    /// Open proposed or confirmed
    OpenRequest(OpenEnvelope),
    /// Signatures completing an open
    OpenResponse(OpenSignatures),
    /// Payment proposed
    PaymentRequest(CloseEnvelope),
    /// Signatures completing a payment
    PaymentResponse(CloseSignatures),
    /// Coordinated close proposed
    CloseRequest(CloseEnvelope),
    /// Signatures completing a coordinated close
    CloseResponse(CloseSignatures),
}

impl Message {
    /// Name of the variant, for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::OpenRequest(_) => "open request",
            Self::OpenResponse(_) => "open response",
            Self::PaymentRequest(_) => "payment request",
            Self::PaymentResponse(_) => "payment response",
            Self::CloseRequest(_) => "close request",
            Self::CloseResponse(_) => "close response",
        }
    }

    /// Encode for the transport
    pub fn to_bytes(&self) -> Result<Vec<u8>, ledger::Error> {
        ledger::encode(self)
    }

    /// Decode from the transport
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ledger::Error> {
        ledger::decode(bytes)
    }
}

/// Framing of messages over a byte stream
pub mod frame {
    use snafu::{ensure, Snafu};

    use super::*;

    /// Largest accepted frame
    pub const MAX_FRAME_LEN: usize = 1 << 20;

    /// Errors of the framing
    #[derive(Debug, Snafu)]
    pub enum Error {
        /// Announced length above [`MAX_FRAME_LEN`]
        #[snafu(display("frame of {} bytes is too large", len))]
        TooLarge {
            /// Announced length
            len: usize,
        },
        /// Fewer bytes than announced
        #[snafu(display("truncated frame"))]
        Truncated,
        /// Body is not a message
        #[snafu(display("message: {}", source))]
        Codec {
            /// Cause
            source: ledger::Error,
        },
    }

    /// Message prefixed with its big-endian length
    pub fn encode(message: &Message) -> Result<Vec<u8>, Error> {
        let body = message.to_bytes().context(Codec)?;
        ensure!(body.len() <= MAX_FRAME_LEN, TooLarge { len: body.len() });

        let len = body.len() as u32;
        let mut framed = Vec::with_capacity(4 + body.len());
        framed.extend_from_slice(&len.to_be_bytes());
        framed.extend_from_slice(&body);

        Ok(framed)
    }

    /// First message of `buffer` and the bytes it took, `None` if more bytes are needed
    pub fn decode(buffer: &[u8]) -> Result<Option<(Message, usize)>, Error> {
        if buffer.len() < 4 {
            return Ok(None);
        }
        let mut len = [0; 4];
        len.copy_from_slice(&buffer[..4]);
        let len = u32::from_be_bytes(len) as usize;
        ensure!(len <= MAX_FRAME_LEN, TooLarge { len });

        let end = 4 + len;
        if buffer.len() < end {
            return Ok(None);
        }
        let message = Message::from_bytes(&buffer[4..end]).context(Codec)?;

        Ok(Some((message, end)))
    }

    /// Decode a buffer holding exactly one frame
    pub fn decode_exact(buffer: &[u8]) -> Result<Message, Error> {
        match decode(buffer)? {
            Some((message, len)) if len == buffer.len() => Ok(message),
            _ => Truncated.fail(),
        }
    }
}
