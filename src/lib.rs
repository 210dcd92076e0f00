//! Supervisor that keeps a BitTorrent client's listening port reachable
//! behind a NAT-PMP capable VPN tunnel.
//!
//! Six collaborators, one state machine: [`vpn`] watches tunnel health,
//! [`natpmp`] leases a forwarded port from the gateway, [`qbt`] pushes that
//! port into the torrent client, [`killswitch`] optionally confines a local
//! user's traffic to the tunnel, [`state`] persists progress across
//! restarts, and [`supervisor`] drives all of them through its states.

pub mod cli;
pub mod config;
pub mod error;
pub mod killswitch;
pub mod logging;
pub mod natpmp;
pub mod notify;
pub mod qbt;
pub mod state;
pub mod supervisor;
pub mod vpn;

pub use error::{Error, Result};
