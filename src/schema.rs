//! Canonical trip schema shared by the loader, synchronizer and validator.
//!
//! [`CANONICAL_FIELDS`] is the single definition of the field set every trip
//! carries. The loader fills it from source rows, the synchronizer projects it
//! into [`ReplicatedDocument`]s, and the validator reads the monetary total back
//! out of both sides.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Sentinel for a missing vendor code.
pub const DEFAULT_VENDOR_ID: &str = "1";
/// Sentinel for a missing store-and-forward flag.
pub const DEFAULT_STORE_AND_FWD_FLAG: &str = "N";

/// Canonical string form for timestamps written to the document store.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// Storage type of a canonical field in the record store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Integer,
    Decimal,
    Timestamp,
}

/// One canonical field and the source column names that map onto it.
#[derive(Debug, Clone, Copy)]
pub struct CanonicalField {
    pub name: &'static str,
    pub kind: FieldKind,
    /// Source column names, canonical name included.
    pub aliases: &'static [&'static str],
}

const fn field(
    name: &'static str,
    kind: FieldKind,
    aliases: &'static [&'static str],
) -> CanonicalField {
    CanonicalField {
        name,
        kind,
        aliases,
    }
}

/// The fixed, total field set of a trip, in column order.
pub const CANONICAL_FIELDS: [CanonicalField; 19] = [
    field("vendor_id", FieldKind::Text, &["VendorID", "vendor_id"]),
    field(
        "pickup_datetime",
        FieldKind::Timestamp,
        &["tpep_pickup_datetime", "pickup_datetime"],
    ),
    field(
        "dropoff_datetime",
        FieldKind::Timestamp,
        &["tpep_dropoff_datetime", "dropoff_datetime"],
    ),
    field("passenger_count", FieldKind::Integer, &["passenger_count"]),
    field("trip_distance", FieldKind::Decimal, &["trip_distance"]),
    field("rate_code_id", FieldKind::Integer, &["RatecodeID", "rate_code_id"]),
    field("store_and_fwd_flag", FieldKind::Text, &["store_and_fwd_flag"]),
    field("pu_location_id", FieldKind::Integer, &["PULocationID", "pu_location_id"]),
    field("do_location_id", FieldKind::Integer, &["DOLocationID", "do_location_id"]),
    field("payment_type", FieldKind::Integer, &["payment_type"]),
    field("fare_amount", FieldKind::Decimal, &["fare_amount"]),
    field("extra", FieldKind::Decimal, &["extra"]),
    field("mta_tax", FieldKind::Decimal, &["mta_tax"]),
    field("tip_amount", FieldKind::Decimal, &["tip_amount"]),
    field("tolls_amount", FieldKind::Decimal, &["tolls_amount"]),
    field(
        "improvement_surcharge",
        FieldKind::Decimal,
        &["improvement_surcharge"],
    ),
    field("total_amount", FieldKind::Decimal, &["total_amount"]),
    field(
        "congestion_surcharge",
        FieldKind::Decimal,
        &["congestion_surcharge"],
    ),
    field("airport_fee", FieldKind::Decimal, &["Airport_fee", "airport_fee"]),
];

/// Look up a canonical field by name.
pub fn canonical_field(name: &str) -> Option<&'static CanonicalField> {
    CANONICAL_FIELDS.iter().find(|f| f.name == name)
}

/// The Unix epoch, used as the zero value for missing timestamps.
pub fn epoch() -> NaiveDateTime {
    NaiveDateTime::default()
}

// ---------------------------------------------------------------------------
// Field values
// ---------------------------------------------------------------------------

/// A typed canonical field value as held by the record store.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    Decimal(Decimal),
    Timestamp(NaiveDateTime),
}

impl FieldValue {
    pub fn kind(&self) -> FieldKind {
        match self {
            Self::Text(_) => FieldKind::Text,
            Self::Integer(_) => FieldKind::Integer,
            Self::Decimal(_) => FieldKind::Decimal,
            Self::Timestamp(_) => FieldKind::Timestamp,
        }
    }
}

/// A source value that could not be coerced into its canonical kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: &'static str,
    pub value: String,
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cannot coerce {:?} into {}", self.value, self.field)
    }
}

impl std::error::Error for FieldError {}

/// Coerce a raw source value into the canonical kind for `field`.
///
/// `Ok(None)` means the value is missing (null or blank) and the caller should
/// keep the field default.
pub fn coerce(field: &CanonicalField, raw: &Value) -> Result<Option<FieldValue>, FieldError> {
    let fail = || FieldError {
        field: field.name,
        value: raw.to_string(),
    };

    if is_missing(raw) {
        return Ok(None);
    }

    let value = match field.kind {
        FieldKind::Text => FieldValue::Text(coerce_text(raw)),
        FieldKind::Integer => FieldValue::Integer(coerce_integer(raw).ok_or_else(fail)?),
        FieldKind::Decimal => FieldValue::Decimal(coerce_decimal(raw).ok_or_else(fail)?),
        FieldKind::Timestamp => FieldValue::Timestamp(coerce_timestamp(raw).ok_or_else(fail)?),
    };
    Ok(Some(value))
}

fn is_missing(raw: &Value) -> bool {
    match raw {
        Value::Null => true,
        Value::String(s) => {
            let s = s.trim();
            s.is_empty() || s.eq_ignore_ascii_case("nan") || s.eq_ignore_ascii_case("null")
        }
        Value::Number(n) => n.as_f64().is_some_and(f64::is_nan),
        _ => false,
    }
}

/// Integral floats lose their fractional part so vendor codes read as `"2"`,
/// not `"2.0"`.
fn coerce_text(raw: &Value) -> String {
    match raw {
        Value::String(s) => {
            let s = s.trim();
            match s.parse::<f64>() {
                Ok(f) if f.fract() == 0.0 && s.contains('.') => format!("{}", f as i64),
                _ => s.to_string(),
            }
        }
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => i.to_string(),
            (None, Some(f)) if f.fract() == 0.0 => format!("{}", f as i64),
            _ => n.to_string(),
        },
        Value::Bool(true) => "Y".to_string(),
        Value::Bool(false) => "N".to_string(),
        other => other.to_string(),
    }
}

fn coerce_integer(raw: &Value) -> Option<i64> {
    let from_f64 = |f: f64| (f.is_finite() && f.fract() == 0.0).then_some(f as i64);
    match raw {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().and_then(from_f64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().and_then(from_f64))
        }
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

fn coerce_decimal(raw: &Value) -> Option<Decimal> {
    let parse = |s: &str| {
        Decimal::from_str(s)
            .or_else(|_| Decimal::from_scientific(s))
            .ok()
    };
    match raw {
        Value::Number(n) => parse(&n.to_string()),
        Value::String(s) => parse(s.trim()),
        _ => None,
    }
}

const TIMESTAMP_INPUT_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%m/%d/%Y %I:%M:%S %p",
    "%m/%d/%Y %H:%M:%S",
];

fn coerce_timestamp(raw: &Value) -> Option<NaiveDateTime> {
    match raw {
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.naive_utc());
            }
            // Parquet's JSON rendering appends an offset: "2023-01-01 00:32:10 +00:00".
            if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f %:z") {
                return Some(dt.naive_utc());
            }
            TIMESTAMP_INPUT_FORMATS
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
                .or_else(|| (s.parse::<f64>().ok() == Some(0.0)).then(epoch))
        }
        Value::Number(n) => n
            .as_i64()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .map(|dt| dt.naive_utc()),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Trip rows
// ---------------------------------------------------------------------------

/// A canonical trip before the record store has assigned it an identifier.
///
/// Decimal fields serialize as strings so the row survives non-self-describing
/// encodings such as bincode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTrip {
    pub vendor_id: String,
    pub pickup_datetime: NaiveDateTime,
    pub dropoff_datetime: NaiveDateTime,
    pub passenger_count: i64,
    #[serde(with = "rust_decimal::serde::str")]
    pub trip_distance: Decimal,
    pub rate_code_id: i64,
    pub store_and_fwd_flag: String,
    pub pu_location_id: i64,
    pub do_location_id: i64,
    pub payment_type: i64,
    #[serde(with = "rust_decimal::serde::str")]
    pub fare_amount: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub extra: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub mta_tax: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub tip_amount: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub tolls_amount: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub improvement_surcharge: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub total_amount: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub congestion_surcharge: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub airport_fee: Decimal,
}

impl Default for NewTrip {
    fn default() -> Self {
        Self {
            vendor_id: DEFAULT_VENDOR_ID.to_string(),
            pickup_datetime: epoch(),
            dropoff_datetime: epoch(),
            passenger_count: 0,
            trip_distance: Decimal::ZERO,
            rate_code_id: 0,
            store_and_fwd_flag: DEFAULT_STORE_AND_FWD_FLAG.to_string(),
            pu_location_id: 0,
            do_location_id: 0,
            payment_type: 0,
            fare_amount: Decimal::ZERO,
            extra: Decimal::ZERO,
            mta_tax: Decimal::ZERO,
            tip_amount: Decimal::ZERO,
            tolls_amount: Decimal::ZERO,
            improvement_surcharge: Decimal::ZERO,
            total_amount: Decimal::ZERO,
            congestion_surcharge: Decimal::ZERO,
            airport_fee: Decimal::ZERO,
        }
    }
}

impl NewTrip {
    /// Read a canonical field by name.
    pub fn get(&self, name: &str) -> Option<FieldValue> {
        use FieldValue as V;
        let value = match name {
            "vendor_id" => V::Text(self.vendor_id.clone()),
            "pickup_datetime" => V::Timestamp(self.pickup_datetime),
            "dropoff_datetime" => V::Timestamp(self.dropoff_datetime),
            "passenger_count" => V::Integer(self.passenger_count),
            "trip_distance" => V::Decimal(self.trip_distance),
            "rate_code_id" => V::Integer(self.rate_code_id),
            "store_and_fwd_flag" => V::Text(self.store_and_fwd_flag.clone()),
            "pu_location_id" => V::Integer(self.pu_location_id),
            "do_location_id" => V::Integer(self.do_location_id),
            "payment_type" => V::Integer(self.payment_type),
            "fare_amount" => V::Decimal(self.fare_amount),
            "extra" => V::Decimal(self.extra),
            "mta_tax" => V::Decimal(self.mta_tax),
            "tip_amount" => V::Decimal(self.tip_amount),
            "tolls_amount" => V::Decimal(self.tolls_amount),
            "improvement_surcharge" => V::Decimal(self.improvement_surcharge),
            "total_amount" => V::Decimal(self.total_amount),
            "congestion_surcharge" => V::Decimal(self.congestion_surcharge),
            "airport_fee" => V::Decimal(self.airport_fee),
            _ => return None,
        };
        Some(value)
    }

    /// Write a canonical field. Returns `false` when the name is unknown or
    /// the value kind does not match the field.
    pub fn set(&mut self, name: &str, value: FieldValue) -> bool {
        use FieldValue as V;
        match (name, value) {
            ("vendor_id", V::Text(v)) => self.vendor_id = v,
            ("pickup_datetime", V::Timestamp(v)) => self.pickup_datetime = v,
            ("dropoff_datetime", V::Timestamp(v)) => self.dropoff_datetime = v,
            ("passenger_count", V::Integer(v)) => self.passenger_count = v,
            ("trip_distance", V::Decimal(v)) => self.trip_distance = v,
            ("rate_code_id", V::Integer(v)) => self.rate_code_id = v,
            ("store_and_fwd_flag", V::Text(v)) => self.store_and_fwd_flag = v,
            ("pu_location_id", V::Integer(v)) => self.pu_location_id = v,
            ("do_location_id", V::Integer(v)) => self.do_location_id = v,
            ("payment_type", V::Integer(v)) => self.payment_type = v,
            ("fare_amount", V::Decimal(v)) => self.fare_amount = v,
            ("extra", V::Decimal(v)) => self.extra = v,
            ("mta_tax", V::Decimal(v)) => self.mta_tax = v,
            ("tip_amount", V::Decimal(v)) => self.tip_amount = v,
            ("tolls_amount", V::Decimal(v)) => self.tolls_amount = v,
            ("improvement_surcharge", V::Decimal(v)) => self.improvement_surcharge = v,
            ("total_amount", V::Decimal(v)) => self.total_amount = v,
            ("congestion_surcharge", V::Decimal(v)) => self.congestion_surcharge = v,
            ("airport_fee", V::Decimal(v)) => self.airport_fee = v,
            _ => return false,
        }
        true
    }
}

/// A canonical trip as stored in the record store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripRecord {
    pub trip_id: i64,
    pub trip: NewTrip,
}

// ---------------------------------------------------------------------------
// Replicated documents
// ---------------------------------------------------------------------------

/// A document-store native value. There is deliberately no decimal or
/// timestamp variant: those must be converted before a document exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DocValue {
    Int(i64),
    Float(f64),
    Text(String),
}

/// A trip row could not be projected into a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionError {
    pub trip_id: i64,
    pub field: &'static str,
    pub reason: String,
}

impl std::fmt::Display for ConversionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "trip {}: field {} not convertible: {}",
            self.trip_id, self.field, self.reason
        )
    }
}

impl std::error::Error for ConversionError {}

/// Document-store projection of a [`TripRecord`], keyed by `trip_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicatedDocument {
    pub trip_id: i64,
    pub synced_at: String,
    #[serde(flatten)]
    pub fields: BTreeMap<String, DocValue>,
}

impl ReplicatedDocument {
    /// Project a record into its document form, converting decimals to `f64`
    /// and timestamps to [`TIMESTAMP_FORMAT`] strings.
    pub fn from_record(
        record: &TripRecord,
        synced_at: DateTime<Utc>,
    ) -> Result<Self, ConversionError> {
        let mut fields = BTreeMap::new();
        for canonical in &CANONICAL_FIELDS {
            let Some(value) = record.trip.get(canonical.name) else {
                continue;
            };
            let doc_value = match value {
                FieldValue::Text(s) => DocValue::Text(s),
                FieldValue::Integer(i) => DocValue::Int(i),
                FieldValue::Timestamp(ts) => {
                    DocValue::Text(ts.format(TIMESTAMP_FORMAT).to_string())
                }
                FieldValue::Decimal(d) => {
                    let f = d
                        .to_f64()
                        .filter(|f| f.is_finite())
                        .ok_or_else(|| ConversionError {
                            trip_id: record.trip_id,
                            field: canonical.name,
                            reason: format!("decimal {d} has no finite f64 form"),
                        })?;
                    DocValue::Float(f)
                }
            };
            fields.insert(canonical.name.to_string(), doc_value);
        }
        Ok(Self {
            trip_id: record.trip_id,
            synced_at: synced_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            fields,
        })
    }

    /// Numeric field as `f64`, accepting integer-valued fields.
    pub fn number(&self, name: &str) -> Option<f64> {
        match self.fields.get(name)? {
            DocValue::Float(f) => Some(*f),
            DocValue::Int(i) => Some(*i as f64),
            DocValue::Text(_) => None,
        }
    }

    /// Check that every numeric value is finite and the key is positive.
    pub fn check_well_formed(&self) -> Result<(), String> {
        if self.trip_id <= 0 {
            return Err(format!("trip_id must be positive, got {}", self.trip_id));
        }
        for (name, value) in &self.fields {
            if let DocValue::Float(f) = value {
                if !f.is_finite() {
                    return Err(format!("field {name} is not a finite number"));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn default_trip_carries_sentinels() {
        let trip = NewTrip::default();
        assert_eq!(trip.vendor_id, "1");
        assert_eq!(trip.store_and_fwd_flag, "N");
        assert_eq!(trip.total_amount, Decimal::ZERO);
        assert_eq!(trip.pickup_datetime, epoch());
    }

    #[test]
    fn get_and_set_cover_every_canonical_field() {
        let mut trip = NewTrip::default();
        for field in &CANONICAL_FIELDS {
            let value = trip.get(field.name).unwrap();
            assert_eq!(value.kind(), field.kind, "{}", field.name);
            assert!(trip.set(field.name, value));
        }
        assert!(!trip.set("total_amount", FieldValue::Integer(3)));
        assert!(trip.get("no_such_field").is_none());
    }

    #[test]
    fn vendor_code_coerces_to_integer_string() {
        let vendor = canonical_field("vendor_id").unwrap();
        assert_eq!(
            coerce(vendor, &json!(2)).unwrap(),
            Some(FieldValue::Text("2".into()))
        );
        assert_eq!(
            coerce(vendor, &json!(2.0)).unwrap(),
            Some(FieldValue::Text("2".into()))
        );
        assert_eq!(
            coerce(vendor, &json!("1.0")).unwrap(),
            Some(FieldValue::Text("1".into()))
        );
    }

    #[test]
    fn blank_and_null_values_are_missing() {
        let fare = canonical_field("fare_amount").unwrap();
        assert_eq!(coerce(fare, &Value::Null).unwrap(), None);
        assert_eq!(coerce(fare, &json!("  ")).unwrap(), None);
        assert_eq!(coerce(fare, &json!("NaN")).unwrap(), None);
    }

    #[test]
    fn unparseable_value_is_an_error() {
        let fare = canonical_field("fare_amount").unwrap();
        let err = coerce(fare, &json!("twelve")).unwrap_err();
        assert_eq!(err.field, "fare_amount");

        let passengers = canonical_field("passenger_count").unwrap();
        assert!(coerce(passengers, &json!(1.5)).is_err());
        assert_eq!(
            coerce(passengers, &json!(2.0)).unwrap(),
            Some(FieldValue::Integer(2))
        );
    }

    #[test]
    fn decimals_keep_their_textual_precision() {
        let total = canonical_field("total_amount").unwrap();
        assert_eq!(
            coerce(total, &json!(7.3)).unwrap(),
            Some(FieldValue::Decimal(dec("7.3")))
        );
        assert_eq!(
            coerce(total, &json!("14.85")).unwrap(),
            Some(FieldValue::Decimal(dec("14.85")))
        );
    }

    #[test]
    fn timestamps_accept_csv_and_parquet_renderings() {
        let pickup = canonical_field("pickup_datetime").unwrap();
        let expected = NaiveDateTime::parse_from_str("2023-01-01 00:32:10", "%Y-%m-%d %H:%M:%S")
            .unwrap();
        for raw in [
            "2023-01-01 00:32:10",
            "2023-01-01T00:32:10",
            "2023-01-01 00:32:10 +00:00",
            "01/01/2023 12:32:10 AM",
        ] {
            assert_eq!(
                coerce(pickup, &json!(raw)).unwrap(),
                Some(FieldValue::Timestamp(expected)),
                "{raw}"
            );
        }
        assert_eq!(
            coerce(pickup, &json!("0")).unwrap(),
            Some(FieldValue::Timestamp(epoch()))
        );
    }

    #[test]
    fn document_holds_only_native_values() {
        let record = TripRecord {
            trip_id: 42,
            trip: NewTrip {
                total_amount: dec("7.30"),
                pickup_datetime: NaiveDateTime::parse_from_str(
                    "2023-01-01 00:32:10",
                    "%Y-%m-%d %H:%M:%S",
                )
                .unwrap(),
                ..NewTrip::default()
            },
        };
        let doc = ReplicatedDocument::from_record(&record, Utc::now()).unwrap();
        assert_eq!(doc.fields.len(), CANONICAL_FIELDS.len());
        assert_eq!(doc.number("total_amount"), Some(7.3));
        assert_eq!(
            doc.fields.get("pickup_datetime"),
            Some(&DocValue::Text("2023-01-01T00:32:10".into()))
        );
        assert_eq!(doc.fields.get("passenger_count"), Some(&DocValue::Int(0)));
    }

    #[test]
    fn document_json_round_trips_field_types() {
        let record = TripRecord {
            trip_id: 7,
            trip: NewTrip {
                fare_amount: dec("5.0"),
                ..NewTrip::default()
            },
        };
        let doc = ReplicatedDocument::from_record(&record, Utc::now()).unwrap();
        let json = serde_json::to_string(&doc).unwrap();
        let back: ReplicatedDocument = serde_json::from_str(&json).unwrap();
        assert_eq!(back, doc);
        assert_eq!(back.fields.get("fare_amount"), Some(&DocValue::Float(5.0)));
    }

    #[test]
    fn well_formed_check_rejects_non_finite_numbers() {
        let record = TripRecord {
            trip_id: 1,
            trip: NewTrip::default(),
        };
        let mut doc = ReplicatedDocument::from_record(&record, Utc::now()).unwrap();
        assert!(doc.check_well_formed().is_ok());
        doc.fields
            .insert("total_amount".into(), DocValue::Float(f64::NAN));
        assert!(doc.check_well_formed().is_err());
    }

    #[test]
    fn trip_survives_bincode_with_exact_decimals() {
        let trip = NewTrip {
            vendor_id: "2".into(),
            trip_distance: dec("0.97"),
            fare_amount: dec("9.30"),
            total_amount: dec("14.30"),
            ..NewTrip::default()
        };
        let bytes = bincode::serialize(&trip).unwrap();
        let back: NewTrip = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, trip);
        assert_eq!(back.fare_amount.to_string(), "9.30");
    }
}
