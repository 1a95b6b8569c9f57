pub mod config;
pub mod error;
mod peer;
mod receiver;
mod sender;

pub use config::{IceConfig, IceServer};
pub use error::WebrtcError;
pub use peer::{Peer, PeerConnectionState, PeerEvent};
pub use receiver::Receiver;
pub use sender::Sender;
