//! Client side of the lease protocol.

pub mod controller;
pub mod transport;

pub use controller::{ControllerState, LeaseController, LeaseView};
pub use transport::{HttpLeaseApi, LeaseApi, LocalLeaseApi};
