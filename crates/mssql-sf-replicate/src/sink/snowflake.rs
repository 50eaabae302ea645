//! Snowflake sink over the session REST endpoints.
//!
//! A sink logs in once with the configured password authenticator, then
//! turns every batch into a single multi-row `INSERT ... VALUES (?, ...)`
//! with array bindings. One statement per batch means a batch commits as a
//! unit.
//!
//! Transient failures (transport errors, HTTP 5xx and 429) are retried with
//! linear backoff. Retries reuse the original request id and set
//! `retry=true`, which lets the warehouse recognize a request that already
//! landed.

use std::time::Duration;

use arrow::array::{Array, AsArray};
use arrow::datatypes::{DataType, TimeUnit, TimestampMicrosecondType};
use arrow::util::display::{ArrayFormatter, FormatOptions};
use async_trait::async_trait;
use chrono::DateTime;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{BatchSink, ConnectSink, LoadOutcome};
use crate::columnar::ColumnarBatch;
use crate::config::TargetConfig;
use crate::error::{ReplicateError, Result};
use crate::manifest::TableRef;

const LOGIN_PATH: &str = "/session/v1/login-request";
const QUERY_PATH: &str = "/queries/v1/query-request";
const LOGOUT_PATH: &str = "/session";

/// Base delay between retry attempts. Linear: delay * attempt.
const LOAD_RETRY_DELAY_MS: u64 = 500;

/// Interval between polls of a statement still executing.
const RESULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Codes returned while a statement is still running.
const QUERY_IN_PROGRESS_CODES: &[&str] = &["333333", "333334"];

const USER_AGENT_VALUE: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Response envelope shared by the session and query endpoints.
#[derive(Debug, Deserialize)]
struct SnowflakeResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

impl SnowflakeResponse {
    fn failure_message(&self) -> String {
        format!(
            "{} (code {})",
            self.message.as_deref().unwrap_or("request failed"),
            self.code.as_deref().unwrap_or("none")
        )
    }

    fn in_progress_url(&self) -> Option<String> {
        let code = self.code.as_deref()?;
        if !QUERY_IN_PROGRESS_CODES.contains(&code) {
            return None;
        }
        self.data
            .as_ref()?
            .get("getResultUrl")?
            .as_str()
            .map(str::to_string)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
    sql_text: &'a str,
    async_exec: bool,
    sequence_id: u64,
    bindings: Map<String, Value>,
}

/// Creates logged-in [`SnowflakeSink`]s.
#[derive(Clone)]
pub struct SnowflakeSinkFactory {
    config: TargetConfig,
    client: Client,
    load_retries: u32,
}

impl SnowflakeSinkFactory {
    pub fn new(config: TargetConfig, load_retries: u32) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT_VALUE)
            .build()
            .map_err(|e| ReplicateError::Destination(format!("building HTTP client: {}", e)))?;
        Ok(Self {
            config,
            client,
            load_retries,
        })
    }
}

#[async_trait]
impl ConnectSink for SnowflakeSinkFactory {
    async fn connect(&self) -> Result<Box<dyn BatchSink>> {
        let sink = SnowflakeSink::login(self.client.clone(), &self.config, self.load_retries).await?;
        Ok(Box::new(sink))
    }
}

/// One Snowflake session.
pub struct SnowflakeSink {
    client: Client,
    base_url: String,
    /// `Authorization` value for the session token.
    auth: HeaderValue,
    load_retries: u32,
    sequence_id: u64,
}

impl SnowflakeSink {
    /// Open a session with password authentication.
    pub async fn login(client: Client, config: &TargetConfig, load_retries: u32) -> Result<Self> {
        let base_url = config.base_url();

        let mut params: Vec<(&str, String)> = vec![("request_id", Uuid::new_v4().to_string())];
        let optional = [
            ("warehouse", &config.warehouse),
            ("databaseName", &config.database),
            ("schemaName", &config.schema),
            ("roleName", &config.role),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                params.push((key, value.clone()));
            }
        }

        let body = json!({
            "data": {
                "CLIENT_APP_ID": env!("CARGO_PKG_NAME"),
                "CLIENT_APP_VERSION": env!("CARGO_PKG_VERSION"),
                "ACCOUNT_NAME": config.account,
                "LOGIN_NAME": config.user,
                "PASSWORD": config.password,
                "AUTHENTICATOR": config.authenticator.to_uppercase(),
            }
        });

        let response = client
            .post(format!("{}{}", base_url, LOGIN_PATH))
            .query(&params)
            .headers(json_headers())
            .json(&body)
            .send()
            .await
            .map_err(|e| ReplicateError::Destination(format!("login request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ReplicateError::Destination(format!(
                "login returned {}: {}",
                status, text
            )));
        }

        let parsed: SnowflakeResponse = response
            .json()
            .await
            .map_err(|e| ReplicateError::Destination(format!("reading login response: {}", e)))?;
        if !parsed.success {
            return Err(ReplicateError::Destination(format!(
                "login rejected: {}",
                parsed.failure_message()
            )));
        }

        let token = parsed
            .data
            .as_ref()
            .and_then(|d| d.get("token"))
            .and_then(Value::as_str)
            .ok_or_else(|| ReplicateError::Destination("login response carried no token".into()))?;
        let auth = HeaderValue::from_str(&format!("Snowflake Token=\"{}\"", token)).map_err(|_| {
            ReplicateError::Destination("login token is not a valid header value".into())
        })?;

        info!("Logged in to Snowflake account {} as {}", config.account, config.user);

        Ok(Self {
            client,
            base_url,
            auth,
            load_retries,
            sequence_id: 0,
        })
    }

    fn auth_headers(&self) -> HeaderMap {
        let mut headers = json_headers();
        headers.insert(AUTHORIZATION, self.auth.clone());
        headers
    }

    /// Run one statement, retrying transient failures under one request id.
    async fn execute(&mut self, table: &str, sql: &str, bindings: Map<String, Value>) -> Result<u32> {
        self.sequence_id += 1;
        let request_id = Uuid::new_v4().to_string();
        let body = QueryRequest {
            sql_text: sql,
            async_exec: false,
            sequence_id: self.sequence_id,
            bindings,
        };
        let url = format!("{}{}", self.base_url, QUERY_PATH);

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let mut params = vec![("requestId", request_id.as_str())];
            if attempt > 1 {
                params.push(("retry", "true"));
            }

            let sent = self
                .client
                .post(&url)
                .query(&params)
                .headers(self.auth_headers())
                .json(&body)
                .send()
                .await;

            let transient = match sent {
                Ok(response) if response.status().is_success() => {
                    let parsed: SnowflakeResponse = response.json().await.map_err(|e| {
                        ReplicateError::load(table, format!("reading query response: {}", e))
                    })?;
                    self.await_result(table, parsed).await?;
                    return Ok(attempt);
                }
                Ok(response) if is_retryable_status(response.status()) => {
                    format!("HTTP {}", response.status())
                }
                Ok(response) => {
                    let status = response.status();
                    let text = response.text().await.unwrap_or_default();
                    return Err(ReplicateError::load(
                        table,
                        format!("query returned {}: {}", status, text),
                    ));
                }
                Err(e) => e.to_string(),
            };

            if attempt > self.load_retries {
                return Err(ReplicateError::load(
                    table,
                    format!("giving up after {} attempts: {}", attempt, transient),
                ));
            }

            let delay = Duration::from_millis(LOAD_RETRY_DELAY_MS * attempt as u64);
            warn!(
                "Load of {} failed ({}), retry {}/{} in {:?}",
                table, transient, attempt, self.load_retries, delay
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Follow a still-running statement until it finishes.
    async fn await_result(&self, table: &str, mut response: SnowflakeResponse) -> Result<()> {
        while let Some(path) = response.in_progress_url() {
            tokio::time::sleep(RESULT_POLL_INTERVAL).await;
            debug!("Polling {} for {}", path, table);
            response = self
                .client
                .get(format!("{}{}", self.base_url, path))
                .headers(self.auth_headers())
                .send()
                .await
                .map_err(|e| ReplicateError::load(table, format!("polling result: {}", e)))?
                .json()
                .await
                .map_err(|e| ReplicateError::load(table, format!("reading result: {}", e)))?;
        }

        if response.success {
            Ok(())
        } else {
            Err(ReplicateError::load(table, response.failure_message()))
        }
    }
}

#[async_trait]
impl BatchSink for SnowflakeSink {
    async fn write_batch(
        &mut self,
        target: TableRef<'_>,
        batch: &ColumnarBatch,
    ) -> Result<LoadOutcome> {
        let destination = target.table.destination_name();
        let sql = insert_sql(&destination, &batch.column_names());
        let bindings = array_bindings(batch)?;
        debug!("{} ({} rows)", sql, batch.num_rows());

        let attempts = self.execute(&target.table.name, &sql, bindings).await?;
        Ok(LoadOutcome {
            rows: batch.num_rows(),
            attempts,
            location: destination,
        })
    }

    async fn finish(&mut self) -> Result<()> {
        let result = self
            .client
            .post(format!("{}{}", self.base_url, LOGOUT_PATH))
            .query(&[("delete", "true")])
            .headers(self.auth_headers())
            .send()
            .await;
        match result {
            Ok(response) if !response.status().is_success() => {
                warn!("Snowflake logout returned {}", response.status());
            }
            Ok(_) => debug!("Snowflake session closed"),
            Err(e) => warn!("Snowflake logout failed: {}", e),
        }
        Ok(())
    }
}

fn json_headers() -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(3);
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));
    headers
}

fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

fn quote(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// `INSERT INTO "T" ("A", "B") VALUES (?, ?)`
pub fn insert_sql(table: &str, columns: &[String]) -> String {
    let cols = columns.iter().map(|c| quote(c)).collect::<Vec<_>>().join(", ");
    let params = vec!["?"; columns.len()].join(", ");
    format!("INSERT INTO {} ({}) VALUES ({})", quote(table), cols, params)
}

/// Binding type for an arrow column.
fn binding_type(data_type: &DataType) -> &'static str {
    match data_type {
        DataType::Int8 | DataType::Int16 | DataType::Int32 | DataType::Int64 => "FIXED",
        DataType::Float32 | DataType::Float64 => "REAL",
        DataType::Boolean => "BOOLEAN",
        DataType::Binary => "BINARY",
        _ => "TEXT",
    }
}

/// One positional array binding per column, values rendered as strings.
pub fn array_bindings(batch: &ColumnarBatch) -> Result<Map<String, Value>> {
    let record_batch = &batch.record_batch;
    let options = FormatOptions::default();
    let mut bindings = Map::with_capacity(record_batch.num_columns());

    for (idx, column) in record_batch.columns().iter().enumerate() {
        let values: Vec<Value> = match column.data_type() {
            // stored as UTC instants regardless of the tag
            DataType::Timestamp(TimeUnit::Microsecond, _) => {
                let array = column.as_primitive::<TimestampMicrosecondType>();
                (0..array.len())
                    .map(|i| {
                        if array.is_null(i) {
                            return Value::Null;
                        }
                        DateTime::from_timestamp_micros(array.value(i))
                            .map(|ts| Value::String(ts.format("%Y-%m-%d %H:%M:%S%.6f +00:00").to_string()))
                            .unwrap_or(Value::Null)
                    })
                    .collect()
            }
            _ => {
                let formatter = ArrayFormatter::try_new(column.as_ref(), &options)?;
                (0..column.len())
                    .map(|i| {
                        if column.is_null(i) {
                            Value::Null
                        } else {
                            Value::String(formatter.value(i).to_string())
                        }
                    })
                    .collect()
            }
        };

        bindings.insert(
            (idx + 1).to_string(),
            json!({ "type": binding_type(column.data_type()), "value": values }),
        );
    }

    Ok(bindings)
}
