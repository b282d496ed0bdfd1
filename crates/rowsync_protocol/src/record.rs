//! The record data model: keys, field values, local and cloud records.

use crate::error::{ProtocolError, ProtocolResult};
use crate::timestamp::Timestamp;
use crate::wire::{WireReader, WireWriter};
use std::collections::BTreeMap;
use std::fmt;

/// Uniquely identifies one logical record across all devices.
///
/// `type_name` is the prefixed table name, so keys can never collide with
/// user tables; `id` is the primary-key value rendered as text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Prefixed table name.
    pub type_name: String,
    /// Primary-key value as text.
    pub id: String,
}

impl ObjectKey {
    /// Creates a new key.
    pub fn new(type_name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            id: id.into(),
        }
    }

    pub(crate) fn write(&self, w: &mut WireWriter) {
        w.write_str(&self.type_name);
        w.write_str(&self.id);
    }

    pub(crate) fn read(r: &mut WireReader<'_>) -> ProtocolResult<Self> {
        Ok(Self {
            type_name: r.read_str()?,
            id: r.read_str()?,
        })
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.type_name, self.id)
    }
}

/// A single field value, mirroring SQLite's storage classes.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// SQL NULL.
    Null,
    /// 64-bit signed integer.
    Integer(i64),
    /// 64-bit float; serialized as its IEEE-754 bit pattern so the
    /// encoding is byte-stable.
    Real(f64),
    /// UTF-8 text.
    Text(String),
    /// Raw bytes.
    Blob(Vec<u8>),
}

impl FieldValue {
    fn tag(&self) -> u8 {
        match self {
            FieldValue::Null => 0,
            FieldValue::Integer(_) => 1,
            FieldValue::Real(_) => 2,
            FieldValue::Text(_) => 3,
            FieldValue::Blob(_) => 4,
        }
    }

    fn write(&self, w: &mut WireWriter) {
        w.write_u8(self.tag());
        match self {
            FieldValue::Null => {}
            FieldValue::Integer(v) => w.write_i64(*v),
            FieldValue::Real(v) => w.write_f64(*v),
            FieldValue::Text(v) => w.write_str(v),
            FieldValue::Blob(v) => w.write_bytes(v),
        }
    }

    fn read(r: &mut WireReader<'_>) -> ProtocolResult<Self> {
        match r.read_u8()? {
            0 => Ok(FieldValue::Null),
            1 => Ok(FieldValue::Integer(r.read_i64()?)),
            2 => Ok(FieldValue::Real(r.read_f64()?)),
            3 => Ok(FieldValue::Text(r.read_str()?)),
            4 => Ok(FieldValue::Blob(r.read_bytes()?)),
            other => Err(ProtocolError::invalid(
                "field value",
                format!("unknown tag {other}"),
            )),
        }
    }
}

/// A record's field map. `BTreeMap` keeps the field ordering canonical.
pub type Fields = BTreeMap<String, FieldValue>;

/// Encodes a field map to its canonical byte form.
///
/// Identical maps always produce identical bytes; this is what gets
/// encrypted for the cloud and what integrity tags are computed over.
pub fn encode_fields(fields: &Fields) -> Vec<u8> {
    let mut w = WireWriter::new();
    w.write_u32(fields.len() as u32);
    for (name, value) in fields {
        w.write_str(name);
        value.write(&mut w);
    }
    w.into_bytes()
}

/// Decodes a field map from its canonical byte form.
pub fn decode_fields(bytes: &[u8]) -> ProtocolResult<Fields> {
    let mut r = WireReader::new(bytes);
    let len = r.read_len()?;
    let mut fields = Fields::new();
    for _ in 0..len {
        let name = r.read_str()?;
        let value = FieldValue::read(&mut r)?;
        fields.insert(name, value);
    }
    r.finish()?;
    Ok(fields)
}

/// A record in the clear, as it lives in the local database.
///
/// `data == None` is a tombstone: the row was deleted at `modified`.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalData {
    /// The record's key.
    pub key: ObjectKey,
    /// Logical modification timestamp.
    pub modified: Timestamp,
    /// Field values, or `None` for a tombstone.
    pub data: Option<Fields>,
}

impl LocalData {
    /// Creates a record carrying data.
    pub fn new(key: ObjectKey, modified: Timestamp, data: Fields) -> Self {
        Self {
            key,
            modified,
            data: Some(data),
        }
    }

    /// Creates a tombstone.
    pub fn tombstone(key: ObjectKey, modified: Timestamp) -> Self {
        Self {
            key,
            modified,
            data: None,
        }
    }

    /// Returns true if this record encodes a deletion.
    pub fn is_tombstone(&self) -> bool {
        self.data.is_none()
    }
}

/// An opaque record as it travels to and from the object store.
///
/// `payload` is the encrypted field map (absent for tombstones); `tag`
/// authenticates (key, modified, key_version, payload) so tombstones are
/// covered too. `key_version` selects the decryption key, letting records
/// written under rotated-out keys stay readable.
#[derive(Debug, Clone, PartialEq)]
pub struct CloudData {
    /// The record's key.
    pub key: ObjectKey,
    /// Logical modification timestamp.
    pub modified: Timestamp,
    /// Version of the key that sealed this record.
    pub key_version: u32,
    /// Encrypted payload, or `None` for a tombstone.
    pub payload: Option<Vec<u8>>,
    /// Integrity tag.
    pub tag: Vec<u8>,
}

impl CloudData {
    /// Returns true if this record encodes a deletion.
    pub fn is_tombstone(&self) -> bool {
        self.payload.is_none()
    }

    /// Writes the wire representation.
    pub fn write(&self, w: &mut WireWriter) {
        self.key.write(w);
        w.write_str(&self.modified.to_iso());
        w.write_u32(self.key_version);
        w.write_opt_bytes(self.payload.as_deref());
        w.write_bytes(&self.tag);
    }

    /// Reads the wire representation.
    pub fn read(r: &mut WireReader<'_>) -> ProtocolResult<Self> {
        let key = ObjectKey::read(r)?;
        let modified = Timestamp::parse_iso(&r.read_str()?)?;
        let key_version = r.read_u32()?;
        let payload = r.read_opt_bytes()?;
        let tag = r.read_bytes()?;
        Ok(Self {
            key,
            modified,
            key_version,
            payload,
            tag,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_fields() -> Fields {
        let mut fields = Fields::new();
        fields.insert("title".into(), FieldValue::Text("hello".into()));
        fields.insert("count".into(), FieldValue::Integer(7));
        fields.insert("ratio".into(), FieldValue::Real(0.25));
        fields.insert("raw".into(), FieldValue::Blob(vec![1, 2, 3]));
        fields.insert("gone".into(), FieldValue::Null);
        fields
    }

    #[test]
    fn fields_roundtrip() {
        let fields = sample_fields();
        let bytes = encode_fields(&fields);
        assert_eq!(decode_fields(&bytes).unwrap(), fields);
    }

    #[test]
    fn fields_encoding_is_canonical() {
        // Insertion order must not matter.
        let mut a = Fields::new();
        a.insert("b".into(), FieldValue::Integer(2));
        a.insert("a".into(), FieldValue::Integer(1));

        let mut b = Fields::new();
        b.insert("a".into(), FieldValue::Integer(1));
        b.insert("b".into(), FieldValue::Integer(2));

        assert_eq!(encode_fields(&a), encode_fields(&b));
    }

    #[test]
    fn cloud_data_roundtrip() {
        let record = CloudData {
            key: ObjectKey::new("__qtds_notes", "42"),
            modified: Timestamp::from_millis(1_700_000_000_000),
            key_version: 3,
            payload: Some(vec![0xCA, 0xFE]),
            tag: vec![0u8; 32],
        };
        let mut w = WireWriter::new();
        record.write(&mut w);
        let bytes = w.into_bytes();

        let mut r = WireReader::new(&bytes);
        assert_eq!(CloudData::read(&mut r).unwrap(), record);
        r.finish().unwrap();
    }

    #[test]
    fn tombstone_cloud_data_roundtrip() {
        let record = CloudData {
            key: ObjectKey::new("__qtds_notes", "9"),
            modified: Timestamp::from_millis(50),
            key_version: 1,
            payload: None,
            tag: vec![7u8; 32],
        };
        let mut w = WireWriter::new();
        record.write(&mut w);
        let bytes = w.into_bytes();

        let decoded = CloudData::read(&mut WireReader::new(&bytes)).unwrap();
        assert!(decoded.is_tombstone());
        assert_eq!(decoded, record);
    }

    proptest! {
        #[test]
        fn fields_roundtrip_prop(entries in proptest::collection::btree_map(
            "[a-z]{1,12}",
            prop_oneof![
                Just(FieldValue::Null),
                any::<i64>().prop_map(FieldValue::Integer),
                any::<f64>().prop_filter("finite", |f| f.is_finite()).prop_map(FieldValue::Real),
                ".{0,24}".prop_map(FieldValue::Text),
                proptest::collection::vec(any::<u8>(), 0..32).prop_map(FieldValue::Blob),
            ],
            0..8,
        )) {
            let bytes = encode_fields(&entries);
            prop_assert_eq!(decode_fields(&bytes).unwrap(), entries);
        }
    }
}
