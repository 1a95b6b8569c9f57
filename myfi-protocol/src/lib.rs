pub mod ws;

pub use ws::{CallerInfo, IceCandidate, SdpKind, SessionDescription, SignalingMessage};
