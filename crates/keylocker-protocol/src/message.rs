use crate::error::ProtocolError;

/// Envelope message types exchanged between keylocker nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MsgType {
    /// A request that arrived directly from a client of this node.
    DirectRequest = 0x01,
    /// A get-key request relayed from a peer whose local backend missed.
    RelayRequest = 0x02,
    /// The answer to a relayed get-key request.
    GetKeyResponse = 0x03,
}

impl MsgType {
    pub fn from_u16(v: u16) -> Result<Self, ProtocolError> {
        match v {
            0x01 => Ok(Self::DirectRequest),
            0x02 => Ok(Self::RelayRequest),
            0x03 => Ok(Self::GetKeyResponse),
            other => Err(ProtocolError::UnknownMsgType(other)),
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Returns true if this message type travels on the request protocol.
    pub fn is_request(self) -> bool {
        matches!(self, Self::DirectRequest | Self::RelayRequest)
    }
}

impl std::fmt::Display for MsgType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::DirectRequest => "DIRECT_REQUEST",
            Self::RelayRequest => "RELAY_REQUEST",
            Self::GetKeyResponse => "GET_KEY_RESPONSE",
        };
        write!(f, "{}", name)
    }
}
