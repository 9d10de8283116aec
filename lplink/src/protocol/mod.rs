//! Wire formats spoken over the Launchpad serial link.
//!
//! - [`app`]: command/reply frames of the Launchpad firmware
//! - [`bsl`]: packets of the MSPM0 ROM bootstrap loader
//! - [`crc`]: the CRC-32 variant used by the bootstrap loader

pub mod app;
pub mod bsl;
pub mod crc;
