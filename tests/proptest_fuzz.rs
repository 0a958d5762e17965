//! Property-based tests (fuzzing) for the remote-tier row codec and the
//! async queue payloads.
//!
//! Uses proptest to generate random/malformed inputs and verify decoding
//! never panics, only returns clean errors.
//!
//! Run with: `cargo test --test proptest_fuzz`

use std::sync::Arc;

use async_trait::async_trait;
use proptest::prelude::*;

use tierdb::codec::{decode_row, encode_row};
use tierdb::schema::fingerprint;
use tierdb::storage::traits::{DbRow, ExecResult};
use tierdb::{
    AsyncOperation, Database, Dialect, EngineConfig, Entity, EntityDef, EntitySchema, FieldDef, FieldKind,
    MemoryCache, OrmError, Registry, StorageError, Transaction, Value, ValueReader,
};

// =============================================================================
// Fixture schema
// =============================================================================

#[derive(Clone, Debug, Default)]
struct Sample {
    id: u64,
    count: i64,
    size: u32,
    flag: bool,
    score: f64,
    label: String,
    blob: Vec<u8>,
    maybe: Option<i32>,
}

impl Entity for Sample {
    fn definition() -> EntityDef {
        EntityDef::new("samples")
            .tags("redisCache")
            .field(FieldDef::new("ID", FieldKind::Id))
            .field(FieldDef::new("Count", FieldKind::I64))
            .field(FieldDef::new("Size", FieldKind::U32))
            .field(FieldDef::new("Flag", FieldKind::Bool))
            .field(FieldDef::new("Score", FieldKind::F64))
            .field(FieldDef::new("Label", FieldKind::String))
            .field(FieldDef::new("Blob", FieldKind::Bytes))
            .field(FieldDef::new("Maybe", FieldKind::I32).optional())
    }
    fn id(&self) -> u64 {
        self.id
    }
    fn set_id(&mut self, id: u64) {
        self.id = id
    }
    fn to_values(&self) -> Vec<Value> {
        vec![
            self.id.into(),
            self.count.into(),
            self.size.into(),
            self.flag.into(),
            self.score.into(),
            self.label.as_str().into(),
            self.blob.clone().into(),
            self.maybe.into(),
        ]
    }
    fn from_values(values: Vec<Value>) -> Result<Self, OrmError> {
        let mut r = ValueReader::new(values);
        Ok(Self {
            id: r.read()?,
            count: r.read()?,
            size: r.read()?,
            flag: r.read()?,
            score: r.read()?,
            label: r.read()?,
            blob: r.read()?,
            maybe: r.read()?,
        })
    }
}

/// Registration needs a SQL pool; nothing here ever reaches it.
struct OfflineDatabase;

#[async_trait]
impl Database for OfflineDatabase {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }
    async fn exec(&self, _sql: &str, _args: &[Value]) -> Result<ExecResult, StorageError> {
        Err(StorageError::Backend("offline".into()))
    }
    async fn query(&self, _sql: &str, _args: &[Value]) -> Result<Vec<DbRow>, StorageError> {
        Err(StorageError::Backend("offline".into()))
    }
    async fn begin(&self) -> Result<Box<dyn Transaction>, StorageError> {
        Err(StorageError::Backend("offline".into()))
    }
}

fn schema() -> Arc<EntitySchema> {
    let mut registry = Registry::new(EngineConfig::default());
    registry
        .register_mysql_pool("default", Arc::new(OfflineDatabase))
        .register_redis_pool("default", Arc::new(MemoryCache::new()))
        .register_entity::<Sample>();
    let engine = registry.validate().unwrap();
    let schema = engine.schema::<Sample>().unwrap().clone();
    schema
}

// =============================================================================
// Strategies
// =============================================================================

fn sample_strategy() -> impl Strategy<Value = Sample> {
    (
        1u64..u64::MAX,
        any::<i64>(),
        any::<u32>(),
        any::<bool>(),
        -1_000_000i32..1_000_000,
        "[a-zA-Z0-9 äöü]{0,40}",
        prop::collection::vec(any::<u8>(), 0..200),
        prop::option::of(any::<i32>()),
    )
        .prop_map(|(id, count, size, flag, milli, label, blob, maybe)| Sample {
            id,
            count,
            size,
            flag,
            score: f64::from(milli) / 1000.0,
            label,
            blob,
            maybe,
        })
}

// =============================================================================
// Row codec
// =============================================================================

proptest! {
    /// Arbitrary bytes decode to a clean error or a row, never a panic.
    #[test]
    fn fuzz_decode_random_bytes(bytes in prop::collection::vec(any::<u8>(), 0..2000)) {
        let schema = schema();
        let _ = decode_row(&schema, &bytes);
    }

    /// Encoding is a pure function of the row and decodes back to it.
    #[test]
    fn prop_encoding_is_deterministic(sample in sample_strategy()) {
        let schema = schema();
        let row = schema.normalize_row(sample.to_values()).unwrap();
        let first = encode_row(&schema, &row).unwrap();
        let second = encode_row(&schema, &row).unwrap();
        prop_assert_eq!(&first, &second);
        prop_assert!(!first.is_empty(), "an encoded row must not look like a tombstone");
        prop_assert_eq!(decode_row(&schema, &first).unwrap(), row);
    }

    /// Every strict prefix of a valid encoding is rejected.
    #[test]
    fn prop_truncated_rows_are_rejected(sample in sample_strategy(), cut in any::<prop::sample::Index>()) {
        let schema = schema();
        let row = schema.normalize_row(sample.to_values()).unwrap();
        let encoded = encode_row(&schema, &row).unwrap();
        let len = cut.index(encoded.len());
        let result = decode_row(&schema, &encoded[..len]);
        prop_assert!(matches!(result, Err(OrmError::Codec(_))));
    }

    /// Flipped bytes never panic the decoder.
    #[test]
    fn fuzz_corrupted_rows(
        sample in sample_strategy(),
        corruption in prop::collection::vec(any::<u8>(), 1..16),
        position in any::<prop::sample::Index>(),
    ) {
        let schema = schema();
        let row = schema.normalize_row(sample.to_values()).unwrap();
        let mut encoded = encode_row(&schema, &row).unwrap();
        let start = position.index(encoded.len());
        for (i, b) in corruption.iter().enumerate() {
            let idx = (start + i) % encoded.len();
            encoded[idx] ^= b;
        }
        let _ = decode_row(&schema, &encoded);
    }

    /// Trailing garbage after a valid row is an error.
    #[test]
    fn prop_trailing_bytes_are_rejected(
        sample in sample_strategy(),
        extra in prop::collection::vec(any::<u8>(), 1..8),
    ) {
        let schema = schema();
        let row = schema.normalize_row(sample.to_values()).unwrap();
        let mut encoded = encode_row(&schema, &row).unwrap();
        encoded.extend(extra);
        prop_assert!(decode_row(&schema, &encoded).is_err());
    }
}

#[test]
fn test_empty_bytes_are_never_a_row() {
    let schema = schema();
    assert!(matches!(decode_row(&schema, &[]), Err(OrmError::Codec(_))));
}

// =============================================================================
// Fingerprints
// =============================================================================

proptest! {
    /// Moving characters between parts changes the fingerprint.
    #[test]
    fn prop_fingerprint_respects_part_boundaries(a in "[a-z]{1,10}", b in "[a-z]{1,10}") {
        let joined = fingerprint(&[format!("{a}{b}")]);
        let split = fingerprint(&[a.clone(), b.clone()]);
        prop_assert_ne!(&joined, &split);
        prop_assert_eq!(split, fingerprint(&[a, b]));
    }
}

// =============================================================================
// Async queue payloads
// =============================================================================

proptest! {
    /// Queue items that are not operations fail to decode cleanly.
    #[test]
    fn fuzz_async_operation_from_random_bytes(bytes in prop::collection::vec(any::<u8>(), 0..4000)) {
        let _ = AsyncOperation::decode(&bytes);
    }

    /// Arguments keep their exact variant through the queue encoding.
    #[test]
    fn prop_async_operation_args_survive(
        id in any::<u64>(),
        ints in prop::collection::vec(any::<i64>(), 0..8),
        text in ".{0,64}",
    ) {
        let mut args: Vec<Value> = ints.into_iter().map(Value::Int).collect();
        args.push(Value::Uint(id));
        args.push(Value::Str(text));
        args.push(Value::Nil);
        let operation = AsyncOperation {
            table: "samples".into(),
            pool: "default".into(),
            kind: tierdb::ChangeAction::Update,
            id,
            sql: "UPDATE `samples` SET `Count`=? WHERE `ID`=?".into(),
            args,
        };
        let decoded = AsyncOperation::decode(&operation.encode().unwrap()).unwrap();
        prop_assert_eq!(decoded, operation);
    }
}
