#![cfg_attr(docsrs, feature(doc_cfg))]
//! # bluettibt_lib
//!
//! This crate reads data from Bluetti power stations over Bluetooth Low
//! Energy. The devices speak a MODBUS-like register protocol on top of GATT
//! notifications, optionally wrapped in a vendor encryption handshake.
//!
//! A polling cycle connects (with retries), subscribes to notifications,
//! negotiates link encryption when the device advertises it, reads every
//! register the device profile declares (including per-battery-pack reads)
//! and returns one aggregated snapshot. Individual failed reads are skipped;
//! a cycle that cannot produce any data returns nothing instead of an error.
//!
//! ## Features
//!
//! This crate uses a feature-based system to keep dependencies minimal.
//!
//! - `default`: Enables `bin-dependencies`, which is intended for compiling
//!   the `bluettibt` command-line tool.
//!
//! ### Transport Features
//! - `bluest-transport`: Enables the [`ble`] module, a [`transport::Transport`]
//!   implementation backed by the `bluest` crate. Without it, callers supply
//!   their own transport.
//!
//! ### Utility Features
//! - `protocol_serde`: Enables `serde` support for decoded field values.
//! - `bin-dependencies`: Enables all features required by the `bluettibt`
//!   binary executable.

/// Contains error types for the library.
mod error;
/// Opaque vendor link-encryption service and handshake states.
pub mod crypt;
/// Device profiles: which registers exist and how to decode them.
pub mod device;
/// Register field tables and decoded values.
pub mod fields;
/// Defines the MODBUS-like command protocol.
pub mod protocol;
/// The polling core: session, handshake and register reads.
pub mod reader;
/// The BLE transport contract consumed by the reader.
pub mod transport;

pub use error::Error;

/// BLE transport backed by the `bluest` crate.
#[cfg_attr(docsrs, doc(cfg(feature = "bluest-transport")))]
#[cfg(feature = "bluest-transport")]
pub mod ble;
