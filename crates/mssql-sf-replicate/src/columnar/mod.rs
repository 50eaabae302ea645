//! Columnar batch building.
//!
//! A raw batch of source rows becomes an Arrow [`RecordBatch`] labelled with
//! the table's destination column names. Each array's type follows the
//! runtime type of the column's first non-null value. Naive timestamps are
//! then stamped with the run's timezone, since the destination rejects
//! timestamps without one.
//!
//! The run timezone is `UTC`, a fixed offset such as `+02:00`, or an IANA
//! zone such as `America/New_York`. Under a named zone a wall-clock value
//! repeated by a DST fall-back resolves to its earlier instant, and a value
//! skipped by a spring-forward fails the batch.

use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, AsArray, BinaryBuilder, BooleanBuilder, Date32Builder, Float32Builder,
    Float64Builder, Int16Builder, Int32Builder, Int64Builder, StringArray, StringBuilder,
    Time64MicrosecondBuilder, TimestampMicrosecondBuilder,
};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit, TimestampMicrosecondType};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Datelike, FixedOffset, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

use crate::error::{ReplicateError, Result};
use crate::extract::RawBatch;
use crate::manifest::Table;
use crate::source::{SqlRow, SqlValue};

/// Days from 0001-01-01 to 1970-01-01.
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

/// Timezone tag applied to offset-aware source timestamps.
pub const UTC: &str = "UTC";

/// A named, ordered columnar batch ready for loading.
#[derive(Debug, Clone)]
pub struct ColumnarBatch {
    /// `<table>_<offset>`
    pub batch_id: String,
    /// Source table name.
    pub table: String,
    pub offset: usize,
    pub record_batch: RecordBatch,
}

impl ColumnarBatch {
    pub fn num_rows(&self) -> usize {
        self.record_batch.num_rows()
    }

    /// Field labels in column order.
    pub fn column_names(&self) -> Vec<String> {
        self.record_batch
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect()
    }
}

/// Build a columnar batch from a raw batch and normalize its timestamps.
pub fn build(raw: &RawBatch, table: &Table, timezone: &str) -> Result<ColumnarBatch> {
    let record_batch = to_record_batch(&raw.rows, table)?;
    let record_batch = normalize_timestamps(record_batch, timezone, &table.name)?;
    Ok(ColumnarBatch {
        batch_id: format!("{}_{}", table.name, raw.offset),
        table: table.name.clone(),
        offset: raw.offset,
        record_batch,
    })
}

/// Convert rows to a record batch without any timestamp tagging.
pub fn to_record_batch(rows: &[SqlRow], table: &Table) -> Result<RecordBatch> {
    let width = table.columns.len();
    if let Some((i, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != width) {
        return Err(ReplicateError::extract(
            &table.name,
            format!("row {} has {} values, expected {}", i, row.len(), width),
        ));
    }

    let mut fields = Vec::with_capacity(width);
    let mut arrays = Vec::with_capacity(width);
    for (idx, col) in table.columns.iter().enumerate() {
        let name = col.destination_name();
        let array = build_array(rows, idx, &table.name, &name)?;
        fields.push(Field::new(name, array.data_type().clone(), true));
        arrays.push(array);
    }

    Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)?)
}

macro_rules! build_with {
    ($builder:expr, $values:expr, $mismatch:expr, $($pat:pat => $val:expr),+ $(,)?) => {{
        let mut builder = $builder;
        for value in $values {
            match value {
                SqlValue::Null(_) => builder.append_null(),
                $($pat => builder.append_value($val),)+
                other => return Err($mismatch(other)),
            }
        }
        Arc::new(builder.finish()) as ArrayRef
    }};
}

fn build_array(rows: &[SqlRow], idx: usize, table: &str, column: &str) -> Result<ArrayRef> {
    let n = rows.len();
    let values = rows.iter().map(|r| &r[idx]);
    let first = rows.iter().map(|r| &r[idx]).find(|v| !v.is_null());
    let mismatch = |other: &SqlValue| {
        ReplicateError::extract(
            table,
            format!(
                "column {} mixes {:?} with {:?} values",
                column,
                first.map(SqlValue::value_type),
                other.value_type()
            ),
        )
    };

    let array = match first {
        None => Arc::new(StringArray::new_null(n)) as ArrayRef,
        Some(SqlValue::Bool(_)) => build_with!(
            BooleanBuilder::with_capacity(n), values, mismatch,
            SqlValue::Bool(v) => *v,
        ),
        Some(SqlValue::I16(_)) => build_with!(
            Int16Builder::with_capacity(n), values, mismatch,
            SqlValue::I16(v) => *v,
        ),
        Some(SqlValue::I32(_)) => build_with!(
            Int32Builder::with_capacity(n), values, mismatch,
            SqlValue::I32(v) => *v,
        ),
        Some(SqlValue::I64(_)) => build_with!(
            Int64Builder::with_capacity(n), values, mismatch,
            SqlValue::I64(v) => *v,
        ),
        Some(SqlValue::F32(_)) => build_with!(
            Float32Builder::with_capacity(n), values, mismatch,
            SqlValue::F32(v) => *v,
        ),
        Some(SqlValue::F64(_)) => build_with!(
            Float64Builder::with_capacity(n), values, mismatch,
            SqlValue::F64(v) => *v,
        ),
        Some(SqlValue::Text(_) | SqlValue::Uuid(_) | SqlValue::Decimal(_)) => build_with!(
            StringBuilder::with_capacity(n, n * 16), values, mismatch,
            SqlValue::Text(v) => v.as_str(),
            SqlValue::Uuid(v) => v.to_string(),
            SqlValue::Decimal(v) => v.to_string(),
            // money that did not fit a decimal
            SqlValue::F64(v) => v.to_string(),
        ),
        Some(SqlValue::Bytes(_)) => build_with!(
            BinaryBuilder::with_capacity(n, n * 16), values, mismatch,
            SqlValue::Bytes(v) => v.as_slice(),
        ),
        Some(SqlValue::Date(_)) => build_with!(
            Date32Builder::with_capacity(n), values, mismatch,
            SqlValue::Date(v) => v.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE,
        ),
        Some(SqlValue::Time(_)) => build_with!(
            Time64MicrosecondBuilder::with_capacity(n), values, mismatch,
            SqlValue::Time(v) => {
                v.num_seconds_from_midnight() as i64 * 1_000_000 + (v.nanosecond() / 1_000) as i64
            },
        ),
        Some(SqlValue::DateTime(_)) => build_with!(
            TimestampMicrosecondBuilder::with_capacity(n), values, mismatch,
            SqlValue::DateTime(v) => v.and_utc().timestamp_micros(),
        ),
        Some(SqlValue::DateTimeOffset(_)) => build_with!(
            TimestampMicrosecondBuilder::with_capacity(n).with_timezone(UTC), values, mismatch,
            SqlValue::DateTimeOffset(v) => v.timestamp_micros(),
        ),
        Some(SqlValue::Null(_)) => Arc::new(StringArray::new_null(n)) as ArrayRef,
    };
    Ok(array)
}

/// Timezone applied to naive source timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunTimezone {
    Fixed(FixedOffset),
    Named(Tz),
}

impl RunTimezone {
    /// Arrow timezone label.
    pub fn label(&self) -> String {
        match self {
            RunTimezone::Fixed(offset) if offset.local_minus_utc() == 0 => UTC.to_string(),
            RunTimezone::Fixed(offset) => offset.to_string(),
            RunTimezone::Named(tz) => tz.name().to_string(),
        }
    }

    /// The instant a wall-clock value names, or `None` when the zone skips it.
    pub fn localize(&self, naive: &NaiveDateTime) -> Option<DateTime<Utc>> {
        match self {
            RunTimezone::Fixed(offset) => offset
                .from_local_datetime(naive)
                .single()
                .map(|d| d.with_timezone(&Utc)),
            RunTimezone::Named(tz) => tz
                .from_local_datetime(naive)
                .earliest()
                .map(|d| d.with_timezone(&Utc)),
        }
    }
}

/// Parse a run timezone: `UTC`, `Z`, a fixed `+HH:MM` / `-HH:MM` offset, or
/// an IANA zone name.
pub fn parse_timezone(tz: &str) -> Result<RunTimezone> {
    let tz = tz.trim();
    let invalid = || {
        ReplicateError::Config(format!(
            "unsupported timezone '{}': use UTC, a fixed offset like +02:00 or an IANA name",
            tz
        ))
    };

    if tz.eq_ignore_ascii_case("utc") || tz == "Z" {
        return FixedOffset::east_opt(0).map(RunTimezone::Fixed).ok_or_else(invalid);
    }

    let (sign, rest) = match tz.as_bytes().first() {
        Some(b'+') => (1, &tz[1..]),
        Some(b'-') => (-1, &tz[1..]),
        _ => return tz.parse::<Tz>().map(RunTimezone::Named).map_err(|_| invalid()),
    };
    let (hours, minutes) = rest.split_once(':').ok_or_else(invalid)?;
    let hours: i32 = hours.parse().map_err(|_| invalid())?;
    let minutes: i32 = minutes.parse().map_err(|_| invalid())?;
    if hours > 23 || minutes > 59 {
        return Err(invalid());
    }

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
        .map(RunTimezone::Fixed)
        .ok_or_else(invalid)
}

/// Stamp every naive timestamp column of `table` with `timezone`.
///
/// Naive values are read as wall-clock time in that timezone and stored as
/// the corresponding instant. Already-tagged columns are left alone.
pub fn normalize_timestamps(batch: RecordBatch, timezone: &str, table: &str) -> Result<RecordBatch> {
    let tz = parse_timezone(timezone)?;
    let label = tz.label();

    let schema = batch.schema();
    if !schema
        .fields()
        .iter()
        .any(|f| f.data_type() == &DataType::Timestamp(TimeUnit::Microsecond, None))
    {
        return Ok(batch);
    }

    let mut fields = Vec::with_capacity(schema.fields().len());
    let mut columns = Vec::with_capacity(schema.fields().len());
    for (field, column) in schema.fields().iter().zip(batch.columns()) {
        if field.data_type() == &DataType::Timestamp(TimeUnit::Microsecond, None) {
            let stamped = column
                .as_primitive::<TimestampMicrosecondType>()
                .try_unary::<_, TimestampMicrosecondType, ReplicateError>(|v| {
                    let wall = DateTime::from_timestamp_micros(v)
                        .map(|d| d.naive_utc())
                        .ok_or_else(|| {
                            ReplicateError::extract(
                                table,
                                format!("column {}: timestamp {} out of range", field.name(), v),
                            )
                        })?;
                    tz.localize(&wall)
                        .map(|instant| instant.timestamp_micros())
                        .ok_or_else(|| {
                            ReplicateError::extract(
                                table,
                                format!(
                                    "column {}: {} does not exist in timezone {}",
                                    field.name(),
                                    wall,
                                    label
                                ),
                            )
                        })
                })?
                .with_timezone(label.as_str());
            fields.push(Field::new(
                field.name(),
                stamped.data_type().clone(),
                field.is_nullable(),
            ));
            columns.push(Arc::new(stamped) as ArrayRef);
        } else {
            fields.push(field.as_ref().clone());
            columns.push(column.clone());
        }
    }

    Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)?)
}
