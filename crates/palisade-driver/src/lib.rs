//! # palisade-driver
//!
//! Driver SPI, error taxonomy and data model for the palisade connection
//! pool.
//!
//! This crate defines the seam between the pool and a real database
//! driver: a driver implements [`Driver`], [`DriverConnection`],
//! [`DriverStatement`] and [`DriverRows`], and the pool takes care of
//! lifecycle management, interception and statistics. No wire protocol
//! lives here.
//!
//! Every palisade crate reports failures through the shared [`Error`]
//! type; [`Error::kind`] yields the [`ErrorKind`] discriminator that
//! filters and retry logic branch on.

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod driver;
pub mod error;
pub mod value;

pub use driver::{ConnectSpec, Driver, DriverConnection, DriverRows, DriverStatement};
pub use error::{Error, ErrorKind, Result};
pub use value::{Row, Value};
