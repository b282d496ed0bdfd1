//! Protocol messages.
//!
//! A message body on the wire is `type name | payload`. The type name is a
//! length-prefixed string so an unknown message can be skipped and logged
//! without understanding its payload.

use crate::error::{ProtocolError, ProtocolResult};
use crate::record::{CloudData, ObjectKey};
use crate::timestamp::Timestamp;
use crate::wire::{WireReader, WireWriter};

/// Size of the server challenge nonce.
pub const NONCE_SIZE: usize = 32;

/// Size of a device id.
pub const DEVICE_ID_SIZE: usize = 16;

/// Server challenge opening every connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identify {
    /// Challenge nonce to be signed by the device.
    pub nonce: [u8; NONCE_SIZE],
}

/// First-contact device registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Register {
    /// Human-readable device name.
    pub name: String,
    /// The server's challenge nonce, echoed back.
    pub nonce: [u8; NONCE_SIZE],
    /// Public signing key.
    pub sign_key: Vec<u8>,
    /// Public encryption key.
    pub crypt_key: Vec<u8>,
    /// Signature over nonce and keys.
    pub proof: Vec<u8>,
}

/// Server reply to a successful registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    /// The newly assigned device id.
    pub device_id: [u8; DEVICE_ID_SIZE],
}

/// Login of an already registered device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Login {
    /// The persisted device id.
    pub device_id: [u8; DEVICE_ID_SIZE],
    /// Human-readable device name.
    pub name: String,
    /// Signature over the challenge nonce.
    pub nonce_sig: Vec<u8>,
}

/// Server acceptance of a login.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Welcome;

/// Request for all records of a table changed after `since`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetChanges {
    /// Table to pull.
    pub table: String,
    /// Lower bound; records with `modified > since` are returned.
    pub since: Timestamp,
}

/// One batch of changed records, ascending by `modified`.
#[derive(Debug, Clone, PartialEq)]
pub struct Changes {
    /// Table the records belong to.
    pub table: String,
    /// The batch.
    pub records: Vec<CloudData>,
}

/// Marks the end of a change stream for one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangesDone {
    /// Table whose stream is exhausted.
    pub table: String,
}

/// Uploads a single record.
#[derive(Debug, Clone, PartialEq)]
pub struct Upload {
    /// The record to store.
    pub record: CloudData,
}

/// Server acknowledgement of one upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadAck {
    /// Key of the acknowledged record.
    pub key: ObjectKey,
    /// The `modified` timestamp the server stored.
    pub modified: Timestamp,
}

/// Live-push notification that a table has new data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Changed {
    /// Table with remote changes.
    pub table: String,
}

/// Any protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Server challenge.
    Identify(Identify),
    /// Device registration.
    Register(Register),
    /// Registration reply.
    Account(Account),
    /// Device login.
    Login(Login),
    /// Login accepted.
    Welcome(Welcome),
    /// Pull request.
    GetChanges(GetChanges),
    /// Pull batch.
    Changes(Changes),
    /// Pull stream end.
    ChangesDone(ChangesDone),
    /// Record upload.
    Upload(Upload),
    /// Upload acknowledgement.
    UploadAck(UploadAck),
    /// Live-push notification.
    Changed(Changed),
}

impl Message {
    /// Returns the wire type name.
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Identify(_) => "Identify",
            Message::Register(_) => "Register",
            Message::Account(_) => "Account",
            Message::Login(_) => "Login",
            Message::Welcome(_) => "Welcome",
            Message::GetChanges(_) => "GetChanges",
            Message::Changes(_) => "Changes",
            Message::ChangesDone(_) => "ChangesDone",
            Message::Upload(_) => "Upload",
            Message::UploadAck(_) => "UploadAck",
            Message::Changed(_) => "Changed",
        }
    }

    /// Encodes to a frame body (without the outer length prefix).
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.write_str(self.type_name());
        match self {
            Message::Identify(m) => w.write_raw(&m.nonce),
            Message::Register(m) => {
                w.write_str(&m.name);
                w.write_raw(&m.nonce);
                w.write_bytes(&m.sign_key);
                w.write_bytes(&m.crypt_key);
                w.write_bytes(&m.proof);
            }
            Message::Account(m) => w.write_raw(&m.device_id),
            Message::Login(m) => {
                w.write_raw(&m.device_id);
                w.write_str(&m.name);
                w.write_bytes(&m.nonce_sig);
            }
            Message::Welcome(_) => {}
            Message::GetChanges(m) => {
                w.write_str(&m.table);
                w.write_str(&m.since.to_iso());
            }
            Message::Changes(m) => {
                w.write_str(&m.table);
                w.write_u32(m.records.len() as u32);
                for record in &m.records {
                    record.write(&mut w);
                }
            }
            Message::ChangesDone(m) => w.write_str(&m.table),
            Message::Upload(m) => m.record.write(&mut w),
            Message::UploadAck(m) => {
                m.key.write(&mut w);
                w.write_str(&m.modified.to_iso());
            }
            Message::Changed(m) => w.write_str(&m.table),
        }
        w.into_bytes()
    }

    /// Decodes from a frame body.
    pub fn decode(body: &[u8]) -> ProtocolResult<Self> {
        let mut r = WireReader::new(body);
        let name = r.read_str()?;
        let message = match name.as_str() {
            "Identify" => Message::Identify(Identify {
                nonce: read_array::<NONCE_SIZE>(&mut r, "nonce")?,
            }),
            "Register" => Message::Register(Register {
                name: r.read_str()?,
                nonce: read_array::<NONCE_SIZE>(&mut r, "nonce")?,
                sign_key: r.read_bytes()?,
                crypt_key: r.read_bytes()?,
                proof: r.read_bytes()?,
            }),
            "Account" => Message::Account(Account {
                device_id: read_array::<DEVICE_ID_SIZE>(&mut r, "device id")?,
            }),
            "Login" => Message::Login(Login {
                device_id: read_array::<DEVICE_ID_SIZE>(&mut r, "device id")?,
                name: r.read_str()?,
                nonce_sig: r.read_bytes()?,
            }),
            "Welcome" => Message::Welcome(Welcome),
            "GetChanges" => Message::GetChanges(GetChanges {
                table: r.read_str()?,
                since: Timestamp::parse_iso(&r.read_str()?)?,
            }),
            "Changes" => {
                let table = r.read_str()?;
                let len = r.read_len()?;
                let mut records = Vec::with_capacity(len);
                for _ in 0..len {
                    records.push(CloudData::read(&mut r)?);
                }
                Message::Changes(Changes { table, records })
            }
            "ChangesDone" => Message::ChangesDone(ChangesDone {
                table: r.read_str()?,
            }),
            "Upload" => Message::Upload(Upload {
                record: CloudData::read(&mut r)?,
            }),
            "UploadAck" => Message::UploadAck(UploadAck {
                key: ObjectKey::read(&mut r)?,
                modified: Timestamp::parse_iso(&r.read_str()?)?,
            }),
            "Changed" => Message::Changed(Changed {
                table: r.read_str()?,
            }),
            _ => return Err(ProtocolError::UnknownMessage { name }),
        };
        r.finish()?;
        Ok(message)
    }
}

fn read_array<const N: usize>(
    r: &mut WireReader<'_>,
    what: &'static str,
) -> ProtocolResult<[u8; N]> {
    let bytes = r.read_raw(N)?;
    bytes
        .try_into()
        .map_err(|_| ProtocolError::invalid(what, format!("expected {N} bytes")))
}
