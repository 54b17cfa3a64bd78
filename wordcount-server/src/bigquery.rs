//! BigQuery v2 REST client: `jobs.query` followed by `jobs.getQueryResults`
//! until the job is complete and every page has been read.

use crate::config::BigQueryConfig;
use crate::credentials::{self, TokenProvider};
use crate::error::{InitError, QueryError};
use crate::query::{QueryRequest, ResultRow, Warehouse};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

// How long the service may hold each call open waiting for the job.
const SERVER_WAIT_MS: u64 = 10_000;

pub struct BigQueryClient {
    http: Client,
    base_url: String,
    project: String,
    location: Option<String>,
    tokens: TokenProvider,
}

impl BigQueryClient {
    /// Discovers ambient credentials and the billing project. Does not
    /// contact the BigQuery API itself.
    pub async fn connect(cfg: &BigQueryConfig, timeout: Duration) -> Result<Self, InitError> {
        Url::parse(&cfg.api_url).map_err(|_| InitError::InvalidEndpoint(cfg.api_url.clone()))?;

        let http = Client::builder().timeout(timeout).build()?;
        debug!("HTTP client created with timeout: {:?}", timeout);

        let (creds, project) = credentials::discover(cfg, &http).await?;
        Ok(BigQueryClient {
            base_url: cfg.api_url.trim_end_matches('/').to_string(),
            project,
            location: cfg.location.clone(),
            tokens: TokenProvider::new(creds, http.clone()),
            http,
        })
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    fn queries_url(&self) -> String {
        format!("{}/projects/{}/queries", self.base_url, self.project)
    }

    async fn start(&self, request: &QueryRequest) -> Result<QueryResponse, QueryError> {
        let body = JobsQueryRequest {
            query: &request.sql,
            use_legacy_sql: false,
            parameter_mode: "NAMED",
            query_parameters: request
                .params
                .iter()
                .map(|p| QueryParameter {
                    name: &p.name,
                    parameter_type: ParameterType { r#type: "STRING" },
                    parameter_value: ParameterValue { value: &p.value },
                })
                .collect(),
            timeout_ms: SERVER_WAIT_MS,
            location: self.location.as_deref(),
        };
        let token = self.tokens.token().await?;
        let resp = self
            .http
            .post(self.queries_url())
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;
        decode(resp).await
    }

    async fn results(
        &self,
        job: &JobReference,
        page_token: Option<&str>,
    ) -> Result<QueryResponse, QueryError> {
        let url = format!("{}/{}", self.queries_url(), job.job_id);
        let mut params: Vec<(&str, String)> = vec![("timeoutMs", SERVER_WAIT_MS.to_string())];
        if let Some(location) = job.location.as_deref().or(self.location.as_deref()) {
            params.push(("location", location.to_string()));
        }
        if let Some(page) = page_token {
            params.push(("pageToken", page.to_string()));
        }
        let token = self.tokens.token().await?;
        let resp = self
            .http
            .get(url)
            .bearer_auth(token)
            .query(&params)
            .send()
            .await?;
        decode(resp).await
    }
}

#[async_trait]
impl Warehouse for BigQueryClient {
    async fn query(&self, request: &QueryRequest) -> Result<Vec<ResultRow>, QueryError> {
        let mut page = self.start(request).await?;
        let mut schema: Option<Schema> = None;
        let mut rows = Vec::new();

        loop {
            if !page.job_complete {
                let job = page.job_reference.take().ok_or_else(|| {
                    QueryError::Decode("incomplete job without a job reference".into())
                })?;
                debug!("Job {} still running, polling", job.job_id);
                page = self.results(&job, None).await?;
                continue;
            }

            if schema.is_none() {
                schema = page.schema.take();
            }
            if let Some(raw_rows) = page.rows.take() {
                let fields = schema
                    .as_ref()
                    .ok_or_else(|| QueryError::Decode("rows without a schema".into()))?;
                for raw in raw_rows {
                    rows.push(decode_row(&fields.fields, raw)?);
                }
            }

            match (page.page_token.take(), page.job_reference.take()) {
                (Some(token), Some(job)) => {
                    debug!("Fetching next page of job {}", job.job_id);
                    page = self.results(&job, Some(&token)).await?;
                }
                _ => break,
            }
        }
        Ok(rows)
    }
}

async fn decode(resp: reqwest::Response) -> Result<QueryResponse, QueryError> {
    let status = resp.status();
    let bytes = resp.bytes().await?;
    if !status.is_success() {
        let message = serde_json::from_slice::<ErrorEnvelope>(&bytes)
            .map(|e| e.error.message)
            .unwrap_or_else(|_| String::from_utf8_lossy(&bytes).trim().to_string());
        return Err(QueryError::Api {
            status: status.as_u16(),
            message,
        });
    }
    serde_json::from_slice(&bytes).map_err(|e| QueryError::Decode(e.to_string()))
}

fn decode_row(fields: &[Field], raw: RawRow) -> Result<ResultRow, QueryError> {
    if raw.f.len() != fields.len() {
        return Err(QueryError::Decode(format!(
            "row has {} cells but schema has {} fields",
            raw.f.len(),
            fields.len()
        )));
    }
    let mut row = ResultRow::new();
    for (field, cell) in fields.iter().zip(raw.f) {
        row.push(field.name.clone(), typed_cell(&field.r#type, cell.v));
    }
    Ok(row)
}

// BigQuery sends every scalar as a string; the schema says what it really is.
// NUMERIC and BIGNUMERIC stay strings: f64 cannot hold their precision.
fn typed_cell(kind: &str, v: Value) -> Value {
    let s = match v {
        Value::String(s) => s,
        other => return other,
    };
    match kind {
        "INTEGER" | "INT64" => s.parse::<i64>().map(Value::from).unwrap_or(Value::String(s)),
        "FLOAT" | "FLOAT64" => s
            .parse::<f64>()
            .ok()
            .and_then(|f| serde_json::Number::from_f64(f).map(Value::Number))
            .unwrap_or(Value::String(s)),
        "BOOLEAN" | "BOOL" if s == "true" || s == "false" => Value::Bool(s == "true"),
        _ => Value::String(s),
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JobsQueryRequest<'a> {
    query: &'a str,
    use_legacy_sql: bool,
    parameter_mode: &'static str,
    query_parameters: Vec<QueryParameter<'a>>,
    timeout_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    location: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryParameter<'a> {
    name: &'a str,
    parameter_type: ParameterType,
    parameter_value: ParameterValue<'a>,
}

#[derive(Serialize)]
struct ParameterType {
    r#type: &'static str,
}

#[derive(Serialize)]
struct ParameterValue<'a> {
    value: &'a str,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct QueryResponse {
    job_reference: Option<JobReference>,
    job_complete: bool,
    schema: Option<Schema>,
    rows: Option<Vec<RawRow>>,
    page_token: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
    location: Option<String>,
}

#[derive(Deserialize)]
struct Schema {
    #[serde(default)]
    fields: Vec<Field>,
}

#[derive(Deserialize)]
struct Field {
    name: String,
    r#type: String,
}

#[derive(Deserialize)]
struct RawRow {
    f: Vec<RawCell>,
}

#[derive(Deserialize)]
struct RawCell {
    v: Value,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}
