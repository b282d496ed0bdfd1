//! # Rowsync Protocol
//!
//! Wire protocol types for rowsync.
//!
//! This crate provides:
//! - The record data model (`ObjectKey`, `LocalData`, `CloudData`)
//! - Millisecond-precision UTC timestamps
//! - Binary frame encoding (`u32 length | type name | payload`)
//! - Protocol messages (Identify, Register, Login, GetChanges, Upload, ...)
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod messages;
mod record;
mod timestamp;
pub mod wire;

pub use error::{ProtocolError, ProtocolResult};
pub use messages::{
    Account, Changed, Changes, ChangesDone, GetChanges, Identify, Login, Message, Register,
    Upload, UploadAck, Welcome,
};
pub use record::{
    decode_fields, encode_fields, CloudData, FieldValue, Fields, LocalData, ObjectKey,
};
pub use timestamp::Timestamp;
