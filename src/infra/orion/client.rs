use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderValue};
use reqwest::{Method, Request, StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::entity::{Entity, latest_observed_at};
use crate::error::BrokerError;
use crate::fetch::HttpClient;
use crate::model::EntityId;
use crate::services::broker_api::{BrokerApi, UpsertResponse};

const LD_JSON: &str = "application/ld+json";
const PAGE_LIMIT: usize = 1000;
/// Ids per existence query, kept small so the query string stays short.
const LOOKUP_CHUNK: usize = 100;

/// NGSI-LD batch operation result, returned with 207 and some 400 responses.
#[derive(Debug, Default, Deserialize)]
struct BatchOperationResult {
    #[serde(default)]
    errors: Vec<BatchEntityError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchEntityError {
    entity_id: String,
    #[serde(default)]
    error: Value,
}

/// Orion-LD over its NGSI-LD HTTP API.
pub struct OrionLdClient<C: HttpClient> {
    base_url: String,
    client: C,
}

impl<C: HttpClient> OrionLdClient<C> {
    pub fn new(base_url: impl Into<String>, client: C) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    fn url(&self, path: &str) -> Result<Url, BrokerError> {
        let raw = format!("{}{}", self.base_url, path);
        Url::parse(&raw).map_err(|e| BrokerError::Rejected {
            status: 0,
            reason: format!("invalid broker url {raw}: {e}"),
        })
    }

    async fn send(&self, mut req: Request) -> Result<(StatusCode, String), BrokerError> {
        let method = req.method().clone();
        let url = req.url().path().to_string();
        if !req.headers().contains_key(ACCEPT) {
            req.headers_mut()
                .insert(ACCEPT, HeaderValue::from_static("application/json"));
        }
        let resp = self.client.execute(req).await?;
        let status = resp.status();
        let body = resp.text().await?;
        debug!(%method, path = %url, status = status.as_u16(), "Broker responded");
        Ok((status, body))
    }

    async fn post_json(&self, url: Url, body: &Value) -> Result<(StatusCode, String), BrokerError> {
        let mut req = Request::new(Method::POST, url);
        req.headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static(LD_JSON));
        *req.body_mut() = Some(body.to_string().into());
        self.send(req).await
    }
}

#[async_trait]
impl<C: HttpClient> BrokerApi for OrionLdClient<C> {
    async fn ready(&self) -> Result<(), BrokerError> {
        let (status, body) = self.send(Request::new(Method::GET, self.url("/version")?)).await?;
        if !status.is_success() {
            return Err(BrokerError::from_status(status.as_u16(), body));
        }
        Ok(())
    }

    async fn lookup(
        &self,
        ids: &[EntityId],
    ) -> Result<HashMap<EntityId, Option<DateTime<Utc>>>, BrokerError> {
        let mut found = HashMap::new();
        for chunk in ids.chunks(LOOKUP_CHUNK) {
            let mut url = self.url("/ngsi-ld/v1/entities")?;
            let joined = chunk.iter().map(EntityId::as_str).collect::<Vec<_>>().join(",");
            url.query_pairs_mut()
                .append_pair("id", &joined)
                .append_pair("limit", &PAGE_LIMIT.to_string());

            let (status, body) = self.send(Request::new(Method::GET, url)).await?;
            if !status.is_success() {
                return Err(BrokerError::from_status(status.as_u16(), body));
            }
            for entity in parse_entities(&body)? {
                if let Some(id) = entity.get("id").and_then(Value::as_str).and_then(EntityId::from_urn) {
                    found.insert(id, latest_observed_at(&entity));
                }
            }
        }
        Ok(found)
    }

    async fn upsert(&self, entities: &[Entity]) -> Result<UpsertResponse, BrokerError> {
        let mut url = self.url("/ngsi-ld/v1/entityOperations/upsert")?;
        url.query_pairs_mut().append_pair("options", "update");
        let body = Value::Array(entities.iter().map(Entity::to_ngsi_ld).collect());

        let (status, text) = self.post_json(url, &body).await?;
        match status.as_u16() {
            200 | 201 | 204 => Ok(UpsertResponse::default()),
            207 | 400 => match upsert_errors(&text) {
                Some(errors) if !errors.is_empty() => {
                    warn!(rejected = errors.len(), total = entities.len(), "Broker rejected part of batch");
                    Ok(UpsertResponse { errors })
                }
                _ if status.as_u16() == 207 => Ok(UpsertResponse::default()),
                _ => Err(BrokerError::from_status(400, text)),
            },
            other => Err(BrokerError::from_status(other, text)),
        }
    }

    async fn list_ids(
        &self,
        entity_type: &str,
        context: &[String],
        id_prefix: &str,
    ) -> Result<Vec<EntityId>, BrokerError> {
        let mut ids = Vec::new();
        let mut offset = 0;
        loop {
            let mut url = self.url("/ngsi-ld/v1/entities")?;
            url.query_pairs_mut()
                .append_pair("type", entity_type)
                .append_pair("idPattern", &format!("^{}.*", escape_pattern(id_prefix)))
                .append_pair("limit", &PAGE_LIMIT.to_string())
                .append_pair("offset", &offset.to_string());

            let mut req = Request::new(Method::GET, url);
            if let Some(link) = context.first().and_then(|ctx| link_header(ctx)) {
                req.headers_mut().insert("Link", link);
            }
            let (status, body) = self.send(req).await?;
            if !status.is_success() {
                return Err(BrokerError::from_status(status.as_u16(), body));
            }

            let page = parse_entities(&body)?;
            let count = page.len();
            ids.extend(
                page.iter()
                    .filter_map(|e| e.get("id").and_then(Value::as_str))
                    .filter_map(EntityId::from_urn),
            );
            if count < PAGE_LIMIT {
                break;
            }
            offset += PAGE_LIMIT;
        }
        Ok(ids)
    }

    async fn delete(&self, ids: &[EntityId]) -> Result<(), BrokerError> {
        for chunk in ids.chunks(PAGE_LIMIT) {
            let url = self.url("/ngsi-ld/v1/entityOperations/delete")?;
            let body = Value::Array(chunk.iter().map(|id| Value::String(id.to_string())).collect());
            let (status, text) = self.post_json(url, &body).await?;
            // 207 lists ids that were already gone, which is fine here
            if !status.is_success() {
                return Err(BrokerError::from_status(status.as_u16(), text));
            }
        }
        Ok(())
    }
}

fn parse_entities(body: &str) -> Result<Vec<Value>, BrokerError> {
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Array(items)) => Ok(items),
        Ok(other) => Err(BrokerError::Transient(format!("unexpected entity listing: {other}"))),
        Err(e) => Err(BrokerError::Transient(format!("unreadable entity listing: {e}"))),
    }
}

fn upsert_errors(body: &str) -> Option<HashMap<EntityId, String>> {
    let result: BatchOperationResult = serde_json::from_str(body).ok()?;
    Some(
        result
            .errors
            .into_iter()
            .filter_map(|e| {
                let id = EntityId::from_urn(&e.entity_id)?;
                let reason = ["title", "detail"]
                    .iter()
                    .filter_map(|k| e.error.get(*k).and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join(": ");
                Some((id, if reason.is_empty() { e.error.to_string() } else { reason }))
            })
            .collect(),
    )
}

fn link_header(context: &str) -> Option<HeaderValue> {
    HeaderValue::from_str(&format!(
        "<{context}>; rel=\"http://www.w3.org/ns/json-ld#context\"; type=\"application/ld+json\""
    ))
    .ok()
}

/// Escapes regex metacharacters so an id prefix matches literally.
fn escape_pattern(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if "\\.+*?()|[]{}^$".contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
