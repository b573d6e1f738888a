//! Out-of-process instrument bridge.
//!
//! Some vendor drivers cannot be loaded into the controller process — the
//! tone-burst pulser SDK here only ships as a 32-bit build while the
//! controller runs 64-bit. The bridge models that constraint generically
//! as an out-of-process capability boundary: a dedicated child worker
//! hosts the incompatible driver, and the controller talks to it over a
//! line-delimited JSON request/response channel with exactly one request
//! outstanding at a time.
//!
//! - [`session::BridgeSession`] — controller side: spawn, handshake,
//!   serialized calls, deterministic teardown.
//! - [`worker::serve`] — worker side: the dispatch loop a worker binary
//!   runs on its stdio.
//! - [`protocol`] — the shared wire format.

pub mod protocol;
pub mod session;
pub mod worker;

pub use protocol::{Request, Response, Status};
pub use session::{BridgeConfig, BridgeSession};
pub use worker::{serve, BridgeHandler};
