//! phasing-tunnel: Reverse SSH tunnel for phasing
//!
//! Opens an SSH session to the in-cluster agent, asks it to listen on the
//! redirected Service's port, and relays every connection it accepts to a
//! process on the developer's machine.

pub mod copier;
pub mod forwarder;
pub mod session;

pub use copier::{relay, RelayStats};
pub use forwarder::{Forwarder, Inbound, TunnelListener};
pub use session::{ForwardedListener, HostKeyPolicy, TunnelOptions, TunnelSession};
