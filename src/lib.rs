//! Building occupancy tracking.
//!
//! QR scans and manual counts move people in and out of buildings. The
//! [`ledger::OccupancyLedger`] turns each of them into one clamped count update
//! plus one log row, committed together through a [`store::LedgerStore`].

pub mod compactor;
pub mod config;
pub mod http;
pub mod ledger;
pub mod limits;
pub mod model;
pub mod observability;
pub mod seed;
pub mod store;
pub mod wal;
