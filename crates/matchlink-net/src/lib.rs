//! Matchmaking networking: transports, message envelopes, request dispatch, and connection lifecycle.

pub mod connection;
pub mod framing;
pub mod memory;
pub mod message_manager;
pub mod messages;
pub mod platform;
pub mod tcp_transport;
pub mod transport;

pub use connection::{ConnectionManager, RetryPolicy, RetryState};
pub use framing::{FrameConfig, FrameError, RoutedFrame, read_frame, write_frame};
pub use memory::{MemoryTransport, SentFrame};
pub use message_manager::{Inbound, InboundHandler, MessageManager, RequestId};
pub use messages::{
    Envelope, MatchPoolDescriptor, Message, MessageError, MsgType, PROTOCOL_VERSION,
    RoutingConfig, decode_envelope, encode_envelope,
};
pub use platform::{SocketConfig, configure_stream};
pub use tcp_transport::TcpTransport;
pub use transport::{
    ConnectOptions, ConnectionState, ConnectionStateWatch, Transport, TransportError,
    TransportEvent,
};
