//! HTTP transport for the remote table service.

use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder};
use serde_json::{Value, json};
use tracing::{debug, instrument};
use url::Url;

use crate::config::RemoteConfig;
use crate::error::{Result, SyncError};
use crate::io::remote::{Fields, Page, RemoteApi};
use crate::model::ExternalId;

const ID_FIELD: &str = "Id";
const TIMEOUT: Duration = Duration::from_secs(30);

/// [`RemoteApi`] implementation talking to the service's REST endpoints.
pub struct HttpRemote {
    client: Client,
    base_url: Url,
    auth_header: String,
    token: String,
}

impl HttpRemote {
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        if config.base_url.trim().is_empty() {
            return Err(SyncError::InvalidConfig("remote.base_url is empty".into()));
        }
        let base_url = Url::parse(config.base_url.trim()).map_err(|error| {
            SyncError::InvalidConfig(format!("remote.base_url '{}': {error}", config.base_url))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(SyncError::InvalidConfig(format!(
                "remote.base_url '{base_url}' cannot carry a path"
            )));
        }
        let client = Client::builder().timeout(TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url,
            auth_header: config.auth_header.clone(),
            token: config.api_token.clone(),
        })
    }

    fn records_url(&self, table: &str) -> Result<Url> {
        endpoint(&self.base_url, &["tables", table, "records"])
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        if self.auth_header.eq_ignore_ascii_case("authorization") {
            request.bearer_auth(&self.token)
        } else {
            request.header(self.auth_header.as_str(), &self.token)
        }
    }

    fn send(&self, request: RequestBuilder) -> Result<Value> {
        let response = self.authorize(request).send()?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            let reason = match status.as_u16() {
                401 | 403 => "authentication failed",
                429 => "rate limited",
                _ => "request failed",
            };
            return Err(SyncError::RemoteApi(format!("{reason} ({status}): {body}")));
        }
        Ok(response.json::<Value>()?)
    }
}

impl RemoteApi for HttpRemote {
    #[instrument(level = "debug", skip(self))]
    fn fetch_page(
        &self,
        table: &str,
        view: Option<&str>,
        offset: usize,
        limit: usize,
    ) -> Result<Page> {
        let mut query = vec![("offset", offset.to_string()), ("limit", limit.to_string())];
        if let Some(view) = view {
            query.push(("viewId", view.to_string()));
        }
        let body = self.send(self.client.get(self.records_url(table)?).query(&query))?;
        decode_page(body)
    }

    #[instrument(level = "debug", skip(self, fields))]
    fn create_row(&self, table: &str, fields: &Fields) -> Result<ExternalId> {
        let body = self.send(self.client.post(self.records_url(table)?).json(fields))?;
        let id = decode_created(&body)?;
        debug!(%id, "remote row created");
        Ok(id)
    }

    #[instrument(level = "debug", skip(self, fields))]
    fn update_row(&self, table: &str, id: &ExternalId, fields: &Fields) -> Result<()> {
        let mut payload = fields.clone();
        payload.insert(ID_FIELD.to_string(), id.to_value());
        self.send(
            self.client
                .patch(self.records_url(table)?)
                .json(&Value::Array(vec![Value::Object(payload)])),
        )?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self))]
    fn link_rows(
        &self,
        table: &str,
        link_field: &str,
        id: &ExternalId,
        targets: &[ExternalId],
    ) -> Result<()> {
        let url = endpoint(
            &self.base_url,
            &["tables", table, "links", link_field, "records", id.as_str()],
        )?;
        let payload: Vec<Value> = targets
            .iter()
            .map(|target| json!({ ID_FIELD: target.to_value() }))
            .collect();
        self.send(self.client.post(url).json(&payload))?;
        Ok(())
    }
}

/// Appends percent-encoded path segments to the base URL.
fn endpoint(base: &Url, segments: &[&str]) -> Result<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|()| SyncError::InvalidConfig(format!("remote.base_url '{base}' cannot carry a path")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// Decodes a `{ "list": [...], "pageInfo": { "isLastPage": .. } }` body.
/// A missing page info counts as the last page.
pub fn decode_page(body: Value) -> Result<Page> {
    let Value::Object(mut body) = body else {
        return Err(SyncError::RemoteApi("page body is not an object".into()));
    };
    let is_last = body
        .get("pageInfo")
        .and_then(|info| info.get("isLastPage"))
        .and_then(Value::as_bool)
        .unwrap_or(true);
    let rows = match body.remove("list") {
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Value::Object(fields) => Ok(fields),
                other => Err(SyncError::RemoteApi(format!("row is not an object: {other}"))),
            })
            .collect::<Result<Vec<_>>>()?,
        Some(other) => {
            return Err(SyncError::RemoteApi(format!("'list' is not an array: {other}")));
        }
        None => return Err(SyncError::RemoteApi("page body has no 'list'".into())),
    };
    Ok(Page { rows, is_last })
}

fn decode_created(body: &Value) -> Result<ExternalId> {
    let record = match body {
        Value::Array(items) => items.first(),
        other => Some(other),
    };
    record
        .and_then(|record| record.get(ID_FIELD))
        .and_then(ExternalId::from_value)
        .ok_or_else(|| SyncError::RemoteApi(format!("create response carries no id: {body}")))
}
