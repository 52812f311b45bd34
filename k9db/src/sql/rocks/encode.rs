//! Byte encoding for keys, rows and index entries.
//!
//! Logical keys and values are sequences of fields, each terminated by a
//! reserved separator byte. Null is a single `0x00` byte; the subfields of a
//! composite index value are joined with `0x01`. Extracting a field is a
//! linear scan and a shard prefix is a byte prefix, which is what makes
//! bounded prefix seeks possible.

use bytes::{BufMut, BytesMut};
use k9db_sqlast::{ColumnType, Value};

use crate::dataflow::record::Record;
use crate::dataflow::schema::SchemaRef;
use crate::util::ShardName;

pub const SEPARATOR: u8 = 30;
pub const NULL_BYTE: u8 = 0;
pub const COMPOSITE_SEPARATOR: u8 = 1;

/// Encode one value as field bytes (no terminating separator).
pub fn encode_value(value: &Value) -> Vec<u8> {
    match value {
        Value::Null => vec![NULL_BYTE],
        Value::Uint(u) => u.to_string().into_bytes(),
        Value::Int(i) => i.to_string().into_bytes(),
        Value::Text(s) | Value::Datetime(s) => s.as_bytes().to_vec(),
    }
}

pub fn encode_values(values: &[Value]) -> Vec<Vec<u8>> {
    values.iter().map(encode_value).collect()
}

/// Decode field bytes into a value of the given column type.
pub fn decode_value(bytes: &[u8], column_type: ColumnType) -> Value {
    if bytes == [NULL_BYTE] {
        return Value::Null;
    }
    let text = std::str::from_utf8(bytes).expect("non-utf8 field in sequence");
    match column_type {
        ColumnType::Uint => Value::Uint(text.parse().expect("corrupt uint field")),
        ColumnType::Int => Value::Int(text.parse().expect("corrupt int field")),
        ColumnType::Text => Value::Text(text.into()),
        ColumnType::Datetime => Value::Datetime(text.into()),
    }
}

/// A separator-terminated sequence of encoded fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Sequence {
    data: BytesMut,
}

impl Sequence {
    pub fn new() -> Sequence {
        Sequence::default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Sequence {
        Sequence {
            data: BytesMut::from(bytes),
        }
    }

    /// Encode a full record, one field per column.
    pub fn from_record(record: &Record) -> Sequence {
        let mut sequence = Sequence::new();
        for value in record.values() {
            sequence.append_value(value);
        }
        sequence
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data.to_vec()
    }

    pub fn append_value(&mut self, value: &Value) {
        self.data.put_slice(&encode_value(value));
        self.data.put_u8(SEPARATOR);
    }

    pub fn append_shard(&mut self, shard: &ShardName) {
        self.data.put_slice(&shard.as_bytes());
        self.data.put_u8(SEPARATOR);
    }

    /// Append field bytes that are already encoded.
    pub fn append_encoded(&mut self, bytes: &[u8]) {
        self.data.put_slice(bytes);
        self.data.put_u8(SEPARATOR);
    }

    /// Append several encoded subfields as one composite field.
    pub fn append_composite(&mut self, parts: &[&[u8]]) {
        for (i, part) in parts.iter().enumerate() {
            if i > 0 {
                self.data.put_u8(COMPOSITE_SEPARATOR);
            }
            self.data.put_slice(part);
        }
        self.data.put_u8(SEPARATOR);
    }

    /// The field at `pos`, without its separator.
    pub fn at(&self, pos: usize) -> &[u8] {
        self.split().nth(pos).expect("field out of range")
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.split().count()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Iterate fields in order.
    pub fn split(&self) -> impl Iterator<Item = &[u8]> {
        let mut fields: Vec<&[u8]> = self.data[..].split(|b| *b == SEPARATOR).collect();
        // Every field is separator-terminated, so the final chunk is empty.
        if matches!(fields.last(), Some(f) if f.is_empty()) {
            fields.pop();
        }
        fields.into_iter()
    }

    /// Decode into a record of the given schema.
    pub fn decode_record(&self, schema: &SchemaRef, positive: bool) -> Record {
        let fields: Vec<&[u8]> = self.split().collect();
        assert_eq!(
            fields.len(),
            schema.size(),
            "row does not match schema {}",
            schema
        );
        let values = fields
            .iter()
            .enumerate()
            .map(|(i, f)| decode_value(f, schema.type_of(i)))
            .collect();
        Record::from_values(schema.clone(), positive, values)
    }
}

/// A stored row: `(shard ⨾ pk)` key and all-columns value.
#[derive(Debug, Clone)]
pub struct RowRecord {
    pub key: Sequence,
    pub value: Sequence,
}

impl RowRecord {
    pub fn from_record(shard: &ShardName, record: &Record) -> RowRecord {
        let pk_column = record.schema().keys()[0];
        let mut key = Sequence::new();
        key.append_shard(shard);
        key.append_value(&record.get_value(pk_column));
        RowRecord {
            key,
            value: Sequence::from_record(record),
        }
    }

    pub fn shard(&self) -> &[u8] {
        self.key.at(0)
    }

    pub fn pk(&self) -> &[u8] {
        self.key.at(1)
    }
}

/// The `(shard ⨾ pk)` pair an index lookup yields.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IndexRecord {
    data: Sequence,
}

impl IndexRecord {
    pub fn new(shard: &[u8], pk: &[u8]) -> IndexRecord {
        let mut data = Sequence::new();
        data.append_encoded(shard);
        data.append_encoded(pk);
        IndexRecord { data }
    }

    pub fn from_sequence(data: Sequence) -> IndexRecord {
        IndexRecord { data }
    }

    pub fn shard(&self) -> &[u8] {
        self.data.at(0)
    }

    pub fn pk(&self) -> &[u8] {
        self.data.at(1)
    }

    pub fn shard_name(&self) -> ShardName {
        ShardName::from_bytes(self.shard())
    }

    pub fn sequence(&self) -> &Sequence {
        &self.data
    }

    pub fn into_sequence(self) -> Sequence {
        self.data
    }
}

/// The physical entry stored in a secondary index column family:
/// `composite value ⨾ shard ⨾ pk` with an empty cell value.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    data: Sequence,
}

impl IndexEntry {
    pub fn new(index_values: &[&[u8]], shard: &[u8], pk: &[u8]) -> IndexEntry {
        let mut data = Sequence::new();
        data.append_composite(index_values);
        data.append_encoded(shard);
        data.append_encoded(pk);
        IndexEntry { data }
    }

    pub fn from_bytes(bytes: &[u8]) -> IndexEntry {
        IndexEntry {
            data: Sequence::from_bytes(bytes),
        }
    }

    pub fn value(&self) -> &[u8] {
        self.data.at(0)
    }

    pub fn shard(&self) -> &[u8] {
        self.data.at(1)
    }

    pub fn pk(&self) -> &[u8] {
        self.data.at(2)
    }

    /// The `(shard, pk)` this entry points at.
    pub fn target(&self) -> IndexRecord {
        IndexRecord::new(self.shard(), self.pk())
    }

    pub fn data(&self) -> &[u8] {
        self.data.data()
    }
}

/// The physical value stored in the PK index: the list of shards holding
/// the key's row.
#[derive(Debug, Clone, Default)]
pub struct PkIndexValue {
    data: Sequence,
}

impl PkIndexValue {
    pub fn from_bytes(bytes: &[u8]) -> PkIndexValue {
        PkIndexValue {
            data: Sequence::from_bytes(bytes),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn append_shard(&mut self, shard: &[u8]) {
        self.data.append_encoded(shard);
    }

    pub fn remove_shard(&mut self, shard: &[u8]) {
        let remaining: Vec<Vec<u8>> = self
            .data
            .split()
            .filter(|s| *s != shard)
            .map(|s| s.to_vec())
            .collect();
        let mut data = Sequence::new();
        for shard in remaining {
            data.append_encoded(&shard);
        }
        self.data = data;
    }

    pub fn contains(&self, shard: &[u8]) -> bool {
        self.data.split().any(|s| s == shard)
    }

    pub fn shards(&self) -> Vec<Vec<u8>> {
        self.data.split().map(|s| s.to_vec()).collect()
    }

    pub fn count(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[u8] {
        self.data.data()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k9db_sqlast::ColumnType;

    #[test]
    fn sequence_round_trip() {
        let schema = SchemaRef::new(
            vec!["id".into(), "name".into(), "note".into()],
            vec![ColumnType::Int, ColumnType::Text, ColumnType::Text],
            vec![0],
        );
        let record = Record::from_values(
            schema.clone(),
            true,
            vec![Value::Int(-3), Value::Text("bob".into()), Value::Null],
        );
        let sequence = Sequence::from_record(&record);
        assert_eq!(sequence.len(), 3);
        assert_eq!(sequence.at(0), b"-3");
        assert_eq!(sequence.at(2), &[NULL_BYTE]);
        assert_eq!(sequence.decode_record(&schema, true), record);
    }

    #[test]
    fn row_record_layout() {
        let schema = SchemaRef::new(
            vec!["id".into(), "body".into()],
            vec![ColumnType::Int, ColumnType::Text],
            vec![0],
        );
        let record =
            Record::from_values(schema, true, vec![Value::Int(10), Value::Text("x".into())]);
        let shard = ShardName::new("User", "1");
        let row = RowRecord::from_record(&shard, &record);
        assert_eq!(row.shard(), shard.as_bytes().as_slice());
        assert_eq!(row.pk(), b"10");
    }

    #[test]
    fn index_entry_layout() {
        let shard = ShardName::new("User", "1").as_bytes();
        let entry = IndexEntry::new(&[b"a", b"b"], &shard, b"10");
        assert_eq!(entry.value(), b"a\x01b");
        assert_eq!(entry.pk(), b"10");
        assert_eq!(entry.target().shard(), shard.as_slice());
    }

    #[test]
    fn pk_index_value_shards() {
        let mut value = PkIndexValue::default();
        let user1 = ShardName::new("User", "1").as_bytes();
        let user2 = ShardName::new("User", "2").as_bytes();
        value.append_shard(&user1);
        value.append_shard(&user2);
        assert_eq!(value.count(), 2);
        assert!(value.contains(&user1));
        value.remove_shard(&user1);
        assert_eq!(value.count(), 1);
        assert!(!value.contains(&user1));
        value.remove_shard(&user2);
        assert!(value.is_empty());
    }
}
