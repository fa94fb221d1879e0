//! abacus-services: the peer replication transport.
//!
//! Address resolution, backoff, reassembly, the UDP and hybrid messengers,
//! the resend coordinator and the inbound apply loop all live here.

pub mod address;
pub mod backoff;
pub mod hybrid;
pub mod inbound;
pub mod messenger;
pub mod reassembly;
pub mod resend;
pub mod stats;
pub mod store;
pub mod udp;

pub use address::{AddressResolver, Channel};
pub use backoff::{Backoff, BackoffLimits};
pub use hybrid::HybridPeerMessenger;
pub use inbound::apply_inbound;
pub use messenger::{build_messenger, MessengerError, MessengerSettings, PeerMessenger};
pub use reassembly::{Accepted, Reassembler};
pub use resend::{ResendCoordinator, ResendHandle};
pub use stats::{StatsSnapshot, TransportStats};
pub use store::{MemoryStore, MessageStore, PeerAddress, PeerDirectory, PeerTable};
pub use udp::UdpPeerMessenger;
