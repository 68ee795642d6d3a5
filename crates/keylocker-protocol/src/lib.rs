pub mod constants;
pub mod envelope;
pub mod error;
pub mod keylocker;
pub mod message;

pub use constants::*;
pub use envelope::Envelope;
pub use error::ProtocolError;
pub use message::MsgType;
