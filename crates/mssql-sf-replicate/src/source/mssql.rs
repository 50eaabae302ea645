//! MSSQL source over Tiberius with bb8 connection pooling.

use std::time::Duration;

use async_trait::async_trait;
use bb8::{Pool, PooledConnection};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use futures::StreamExt;
use rust_decimal::Decimal;
use tiberius::xml::XmlData;
use tiberius::{AuthMethod, Client, ColumnData, Config, EncryptionLevel, FromSql, Row};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    ColumnRow, ConnectSource, PrimaryKeyRow, RowStream, SourceConnection, SqlNullType, SqlRow,
    SqlValue,
};
use crate::config::SourceConfig;
use crate::error::{ReplicateError, Result};

/// Maximum TDS packet size.
const TDS_MAX_PACKET_SIZE: u32 = 32767;

/// Connection acquisition timeout from pool.
const POOL_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Idle connection timeout.
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// TCP keepalive interval. Long extractions hold a connection for minutes.
const TCP_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

type TdsClient = Client<Compat<TcpStream>>;

/// Connection manager for bb8 pool with Tiberius.
#[derive(Clone)]
struct TiberiusConnectionManager {
    config: SourceConfig,
}

impl TiberiusConnectionManager {
    fn new(config: SourceConfig) -> Self {
        Self { config }
    }

    fn build_config(&self) -> Config {
        let mut config = Config::new();
        config.host(&self.config.host);
        config.port(self.config.port);
        config.application_name(&self.config.app_name);
        config.authentication(AuthMethod::sql_server(
            &self.config.user,
            &self.config.password,
        ));

        if self.config.encrypt {
            if self.config.trust_server_cert {
                config.trust_cert();
            }
            config.encryption(EncryptionLevel::Required);
        } else {
            config.encryption(EncryptionLevel::NotSupported);
        }

        config.packet_size(TDS_MAX_PACKET_SIZE);
        config
    }
}

fn io_error(e: std::io::Error, context: &str) -> tiberius::error::Error {
    tiberius::error::Error::Io {
        kind: e.kind(),
        message: format!("{}: {}", context, e),
    }
}

#[async_trait]
impl bb8::ManageConnection for TiberiusConnectionManager {
    type Connection = TdsClient;
    type Error = tiberius::error::Error;

    async fn connect(&self) -> std::result::Result<Self::Connection, Self::Error> {
        let config = self.build_config();
        let tcp = TcpStream::connect(config.get_addr())
            .await
            .map_err(|e| io_error(e, "connecting to SQL Server"))?;
        tcp.set_nodelay(true).ok();

        let std_tcp = tcp
            .into_std()
            .map_err(|e| io_error(e, "detaching socket"))?;
        let socket = socket2::Socket::from(std_tcp);
        let keepalive = socket2::TcpKeepalive::new()
            .with_time(TCP_KEEPALIVE_INTERVAL)
            .with_interval(TCP_KEEPALIVE_INTERVAL);
        if let Err(e) = socket.set_tcp_keepalive(&keepalive) {
            warn!("Failed to set TCP keepalive on MSSQL connection: {}", e);
        }

        let std_tcp: std::net::TcpStream = socket.into();
        std_tcp.set_nonblocking(true).ok();
        let tcp = TcpStream::from_std(std_tcp).map_err(|e| io_error(e, "reattaching socket"))?;

        Client::connect(config, tcp.compat_write()).await
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> std::result::Result<(), Self::Error> {
        conn.simple_query("SELECT 1").await?.into_row().await?;
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

/// Pool of MSSQL connections. Each [`ConnectSource::connect`] call checks out
/// one connection that returns to the pool when dropped.
pub struct MssqlPool {
    pool: Pool<TiberiusConnectionManager>,
}

impl MssqlPool {
    /// Build the pool and verify connectivity.
    pub async fn new(config: SourceConfig, max_size: u32) -> Result<Self> {
        let manager = TiberiusConnectionManager::new(config.clone());
        let pool = Pool::builder()
            .max_size(max_size.max(1))
            .connection_timeout(POOL_CONNECTION_TIMEOUT)
            .idle_timeout(Some(POOL_IDLE_TIMEOUT))
            .test_on_check_out(true)
            .build(manager)
            .await
            .map_err(|e| ReplicateError::pool(e, "creating MSSQL connection pool"))?;

        {
            let mut conn = pool
                .get()
                .await
                .map_err(|e| ReplicateError::pool(e, "testing MSSQL connection"))?;
            conn.simple_query("SELECT 1").await?.into_row().await?;
        }

        info!(
            "Connected to MSSQL: {}:{} as {} (pool_size={})",
            config.host, config.port, config.user, max_size
        );

        Ok(Self { pool })
    }
}

#[async_trait]
impl ConnectSource for MssqlPool {
    async fn connect(&self) -> Result<Box<dyn SourceConnection>> {
        let conn = self
            .pool
            .get_owned()
            .await
            .map_err(|e| ReplicateError::pool(e, "getting MSSQL connection from pool"))?;
        Ok(Box::new(MssqlConnection { conn }))
    }
}

/// One checked-out MSSQL connection.
struct MssqlConnection {
    conn: PooledConnection<'static, TiberiusConnectionManager>,
}

impl MssqlConnection {
    async fn query_all(&mut self, sql: &str) -> Result<Vec<Row>> {
        debug!("Catalog query: {}", sql);
        let rows = self
            .conn
            .simple_query(sql.to_owned())
            .await?
            .into_first_result()
            .await?;
        Ok(rows)
    }
}

#[async_trait]
impl SourceConnection for MssqlConnection {
    async fn primary_key_rows(&mut self, sql: &str) -> Result<Vec<PrimaryKeyRow>> {
        self.query_all(sql)
            .await?
            .iter()
            .map(|row| {
                Ok(PrimaryKeyRow {
                    table_catalog: get_string(row, 0)?,
                    table_schema: get_string(row, 1)?,
                    table_name: get_string(row, 2)?,
                    primary_key_columns: get_string(row, 3)?,
                })
            })
            .collect()
    }

    async fn column_rows(&mut self, sql: &str) -> Result<Vec<ColumnRow>> {
        self.query_all(sql)
            .await?
            .iter()
            .map(|row| {
                Ok(ColumnRow {
                    table_catalog: get_string(row, 0)?,
                    table_schema: get_string(row, 1)?,
                    table_name: get_string(row, 2)?,
                    column_name: get_string(row, 3)?,
                    ordinal_position: row.try_get::<i32, _>(4)?.unwrap_or(0),
                    data_type: get_string(row, 5)?,
                    numeric_precision: row.try_get::<i32, _>(6)?,
                    numeric_scale: row.try_get::<i32, _>(7)?,
                })
            })
            .collect()
    }

    async fn stream_rows<'a>(
        &'a mut self,
        sql: &str,
        column_types: &[String],
    ) -> Result<RowStream<'a>> {
        debug!("Extract query: {}", sql);
        let column_types = column_types.to_vec();
        let stream = self
            .conn
            .simple_query(sql.to_owned())
            .await?
            .into_row_stream();

        Ok(stream
            .map(move |row| {
                let row = row?;
                decode_row(&row, &column_types)
            })
            .boxed())
    }
}

fn get_string(row: &Row, idx: usize) -> Result<String> {
    Ok(row.try_get::<&str, _>(idx)?.unwrap_or_default().to_string())
}

/// Decode a row. Cells past the declared types are decoded by their wire
/// type so a width mismatch surfaces when the batch is built.
fn decode_row(row: &Row, column_types: &[String]) -> Result<SqlRow> {
    row.cells()
        .enumerate()
        .map(|(idx, (_, data))| {
            let data_type = column_types.get(idx).map(String::as_str).unwrap_or_default();
            convert_cell(data, decoder_for(data_type)).map_err(|e| {
                // the extractor fills in the table name
                ReplicateError::extract("", format!("column {} ({}): {}", idx + 1, data_type, e))
            })
        })
        .collect()
}

/// How a cell is read, chosen from the column's declared source type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decoder {
    Bool,
    TinyInt,
    SmallInt,
    Int,
    BigInt,
    Real,
    Float,
    Uuid,
    DateTime,
    DateTimeOffset,
    Date,
    Time,
    Bytes,
    Decimal,
    Xml,
    Text,
    /// Undeclared or variant-typed: decode by the wire type.
    Any,
}

fn decoder_for(data_type: &str) -> Decoder {
    match data_type.to_lowercase().as_str() {
        "bit" => Decoder::Bool,
        "tinyint" => Decoder::TinyInt,
        "smallint" => Decoder::SmallInt,
        "int" => Decoder::Int,
        "bigint" => Decoder::BigInt,
        "real" => Decoder::Real,
        "float" => Decoder::Float,
        "uniqueidentifier" => Decoder::Uuid,
        "datetime" | "datetime2" | "smalldatetime" => Decoder::DateTime,
        "datetimeoffset" => Decoder::DateTimeOffset,
        "date" => Decoder::Date,
        "time" => Decoder::Time,
        "decimal" | "numeric" | "money" | "smallmoney" => Decoder::Decimal,
        "xml" => Decoder::Xml,
        // CLR types arrive as their serialized bytes
        "binary" | "varbinary" | "image" | "rowversion" | "timestamp" | "hierarchyid"
        | "geometry" | "geography" => Decoder::Bytes,
        "char" | "varchar" | "nchar" | "nvarchar" | "text" | "ntext" | "sysname" => Decoder::Text,
        _ => Decoder::Any,
    }
}

/// Decode one cell. A wire value the decoder cannot read is an error, never a NULL.
fn convert_cell(
    data: &ColumnData<'static>,
    decoder: Decoder,
) -> std::result::Result<SqlValue, tiberius::error::Error> {
    let value = match decoder {
        Decoder::Bool => bool::from_sql(data)?
            .map(SqlValue::Bool)
            .unwrap_or(SqlValue::Null(SqlNullType::Bool)),
        Decoder::TinyInt => u8::from_sql(data)?
            .map(|v| SqlValue::I16(v.into()))
            .unwrap_or(SqlValue::Null(SqlNullType::I16)),
        Decoder::SmallInt => i16::from_sql(data)?
            .map(SqlValue::I16)
            .unwrap_or(SqlValue::Null(SqlNullType::I16)),
        Decoder::Int => i32::from_sql(data)?
            .map(SqlValue::I32)
            .unwrap_or(SqlValue::Null(SqlNullType::I32)),
        Decoder::BigInt => i64::from_sql(data)?
            .map(SqlValue::I64)
            .unwrap_or(SqlValue::Null(SqlNullType::I64)),
        Decoder::Real => f32::from_sql(data)?
            .map(SqlValue::F32)
            .unwrap_or(SqlValue::Null(SqlNullType::F32)),
        Decoder::Float => f64::from_sql(data)?
            .map(SqlValue::F64)
            .unwrap_or(SqlValue::Null(SqlNullType::F64)),
        Decoder::Uuid => Uuid::from_sql(data)?
            .map(SqlValue::Uuid)
            .unwrap_or(SqlValue::Null(SqlNullType::Uuid)),
        Decoder::DateTime => NaiveDateTime::from_sql(data)?
            .map(SqlValue::DateTime)
            .unwrap_or(SqlValue::Null(SqlNullType::DateTime)),
        Decoder::DateTimeOffset => DateTime::<FixedOffset>::from_sql(data)?
            .map(SqlValue::DateTimeOffset)
            .unwrap_or(SqlValue::Null(SqlNullType::DateTimeOffset)),
        Decoder::Date => NaiveDate::from_sql(data)?
            .map(SqlValue::Date)
            .unwrap_or(SqlValue::Null(SqlNullType::Date)),
        Decoder::Time => NaiveTime::from_sql(data)?
            .map(SqlValue::Time)
            .unwrap_or(SqlValue::Null(SqlNullType::Time)),
        Decoder::Bytes => <&[u8]>::from_sql(data)?
            .map(|v| SqlValue::Bytes(v.to_vec()))
            .unwrap_or(SqlValue::Null(SqlNullType::Bytes)),
        Decoder::Decimal => match data {
            // money travels as a float on the wire
            ColumnData::F64(v) => v
                .map(money_value)
                .unwrap_or(SqlValue::Null(SqlNullType::Decimal)),
            _ => Decimal::from_sql(data)?
                .map(SqlValue::Decimal)
                .unwrap_or(SqlValue::Null(SqlNullType::Decimal)),
        },
        Decoder::Xml => <&XmlData>::from_sql(data)?
            .map(|v| SqlValue::Text(v.to_string()))
            .unwrap_or(SqlValue::Null(SqlNullType::String)),
        Decoder::Text => <&str>::from_sql(data)?
            .map(|v| SqlValue::Text(v.to_string()))
            .unwrap_or(SqlValue::Null(SqlNullType::String)),
        Decoder::Any => wire_value(data)?,
    };
    Ok(value)
}

fn money_value(v: f64) -> SqlValue {
    Decimal::try_from(v)
        .map(SqlValue::Decimal)
        .unwrap_or(SqlValue::F64(v))
}

/// Decode a cell by what the server actually sent.
fn wire_value(data: &ColumnData<'static>) -> std::result::Result<SqlValue, tiberius::error::Error> {
    let value = match data {
        ColumnData::U8(v) => v
            .map(|v| SqlValue::I16(v.into()))
            .unwrap_or(SqlValue::Null(SqlNullType::I16)),
        ColumnData::I16(v) => v.map(SqlValue::I16).unwrap_or(SqlValue::Null(SqlNullType::I16)),
        ColumnData::I32(v) => v.map(SqlValue::I32).unwrap_or(SqlValue::Null(SqlNullType::I32)),
        ColumnData::I64(v) => v.map(SqlValue::I64).unwrap_or(SqlValue::Null(SqlNullType::I64)),
        ColumnData::F32(v) => v.map(SqlValue::F32).unwrap_or(SqlValue::Null(SqlNullType::F32)),
        ColumnData::F64(v) => v.map(SqlValue::F64).unwrap_or(SqlValue::Null(SqlNullType::F64)),
        ColumnData::Bit(v) => v.map(SqlValue::Bool).unwrap_or(SqlValue::Null(SqlNullType::Bool)),
        ColumnData::Guid(v) => v.map(SqlValue::Uuid).unwrap_or(SqlValue::Null(SqlNullType::Uuid)),
        ColumnData::String(_) => convert_cell(data, Decoder::Text)?,
        ColumnData::Xml(_) => convert_cell(data, Decoder::Xml)?,
        ColumnData::Binary(_) => convert_cell(data, Decoder::Bytes)?,
        ColumnData::Numeric(_) => convert_cell(data, Decoder::Decimal)?,
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
            convert_cell(data, Decoder::DateTime)?
        }
        ColumnData::DateTimeOffset(_) => convert_cell(data, Decoder::DateTimeOffset)?,
        ColumnData::Date(_) => convert_cell(data, Decoder::Date)?,
        ColumnData::Time(_) => convert_cell(data, Decoder::Time)?,
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::borrow::Cow;
    use tiberius::numeric::Numeric;

    fn config() -> SourceConfig {
        SourceConfig {
            host: "sql.internal".into(),
            port: 1444,
            user: "etl".into(),
            password: "secret".into(),
            app_name: "nightly-load".into(),
            encrypt: false,
            trust_server_cert: false,
        }
    }

    #[test]
    fn test_build_config_address() {
        let manager = TiberiusConnectionManager::new(config());
        let tds = manager.build_config();
        assert_eq!(tds.get_addr(), "sql.internal:1444");
    }

    #[test]
    fn test_decoder_for_declared_types() {
        let cases = [
            ("bit", Decoder::Bool),
            ("TINYINT", Decoder::TinyInt),
            ("int", Decoder::Int),
            ("datetime2", Decoder::DateTime),
            ("datetimeoffset", Decoder::DateTimeOffset),
            ("money", Decoder::Decimal),
            ("xml", Decoder::Xml),
            ("hierarchyid", Decoder::Bytes),
            ("geography", Decoder::Bytes),
            ("rowversion", Decoder::Bytes),
            ("nvarchar", Decoder::Text),
            ("sysname", Decoder::Text),
            ("sql_variant", Decoder::Any),
            ("", Decoder::Any),
        ];
        for (data_type, expected) in cases {
            assert_eq!(decoder_for(data_type), expected, "{}", data_type);
        }
    }

    #[test]
    fn test_xml_decodes_to_text() {
        let data = ColumnData::Xml(Some(Cow::Owned(XmlData::new("<order id=\"7\"/>"))));
        assert_eq!(
            convert_cell(&data, decoder_for("xml")).unwrap(),
            SqlValue::Text("<order id=\"7\"/>".into())
        );
        assert_eq!(
            convert_cell(&ColumnData::Xml(None), Decoder::Xml).unwrap(),
            SqlValue::Null(SqlNullType::String)
        );
    }

    #[test]
    fn test_clr_types_decode_to_bytes() {
        let data = ColumnData::Binary(Some(Cow::Owned(vec![0x58, 0x40])));
        assert_eq!(
            convert_cell(&data, decoder_for("hierarchyid")).unwrap(),
            SqlValue::Bytes(vec![0x58, 0x40])
        );
    }

    #[test]
    fn test_decimal_and_money() {
        let numeric = ColumnData::Numeric(Some(Numeric::new_with_scale(12345, 2)));
        assert_eq!(
            convert_cell(&numeric, Decoder::Decimal).unwrap(),
            SqlValue::Decimal(Decimal::new(12345, 2))
        );
        assert_eq!(
            convert_cell(&ColumnData::F64(Some(19.5)), decoder_for("money")).unwrap(),
            SqlValue::Decimal(Decimal::new(195, 1))
        );
    }

    #[test]
    fn test_mismatched_wire_type_is_an_error() {
        let data = ColumnData::String(Some(Cow::Borrowed("not a number")));
        assert!(convert_cell(&data, decoder_for("int")).is_err());
    }

    #[test]
    fn test_null_keeps_declared_type() {
        assert_eq!(
            convert_cell(&ColumnData::I64(None), decoder_for("bigint")).unwrap(),
            SqlValue::Null(SqlNullType::I64)
        );
    }

    #[test]
    fn test_undeclared_cells_decode_by_wire_type() {
        assert_eq!(
            convert_cell(&ColumnData::I32(Some(42)), Decoder::Any).unwrap(),
            SqlValue::I32(42)
        );
        let data = ColumnData::String(Some(Cow::Borrowed("abc")));
        assert_eq!(
            convert_cell(&data, Decoder::Any).unwrap(),
            SqlValue::Text("abc".into())
        );
    }
}
