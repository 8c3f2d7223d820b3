use super::RemoteSource;
use crate::error::{ErrorKind, Result};
use crate::id::ResourceId;
use crate::limiter::{RateLimiter, parse_retry_after};
use crate::models::{Block, BlockKind, Resource, ResourceKind};
use async_trait::async_trait;
use exn::ResultExt;
use futures::FutureExt;
use futures::future::BoxFuture;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

const PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone)]
pub struct HttpSourceConfig {
    pub base_url: String,
    pub token: String,
    /// Value of the API version header.
    pub version: String,
    pub timeout: Duration,
}

/// [`RemoteSource`] backed by the hosted workspace's REST API.
pub struct HttpSource {
    client: Client,
    config: HttpSourceConfig,
    limiter: Arc<RateLimiter>,
    cancel: CancellationToken,
}

impl HttpSource {
    /// `limiter` and `cancel` gate the follow-up requests this source makes on
    /// its own (pagination and nested children); they should be the same ones
    /// the caller uses.
    pub fn new(config: HttpSourceConfig, limiter: Arc<RateLimiter>, cancel: CancellationToken) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("pagesync/", env!("CARGO_PKG_VERSION")))
            .build()
            .or_raise(|| ErrorKind::Network("could not build HTTP client".to_string()))?;
        Ok(Self {
            client,
            config,
            limiter,
            cancel,
        })
    }

    /// Name of the integration the token belongs to. The call is admitted by
    /// the caller, like the [`RemoteSource`] methods.
    #[instrument(skip(self))]
    pub async fn current_user(&self) -> Result<String> {
        let user = self.send(self.api(Method::GET, "users/me"), "users/me").await?;
        Ok(user_name(&user))
    }

    fn api(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/{}", self.config.base_url.trim_end_matches('/'), path);
        self.client
            .request(method, url)
            .bearer_auth(&self.config.token)
            .header("Notion-Version", &self.config.version)
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> Result<Value> {
        let response = request.send().await.or_raise(|| ErrorKind::Network(what.to_string()))?;
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = parse_retry_after(response.headers().get(RETRY_AFTER).and_then(|v| v.to_str().ok()));
            exn::bail!(ErrorKind::Throttled { retry_after });
        }
        let bytes = response.bytes().await.or_raise(|| ErrorKind::Network(what.to_string()))?;
        let body: Option<Value> = serde_json::from_slice(&bytes).ok();
        if status.is_success() {
            return body.ok_or_else(|| exn::Exn::from(ErrorKind::InvalidResponse(what.to_string())));
        }
        Err(exn::Exn::from(classify_failure(status, body.as_ref(), what)))
    }

    /// Run a follow-up request through the limiter.
    async fn follow_up(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Value> {
        self.limiter
            .execute(&self.cancel, || {
                let mut request = self.api(method.clone(), path);
                if let Some(body) = body {
                    request = request.json(body);
                }
                self.send(request, path)
            })
            .await
    }

    fn fetch_blocks<'a>(&'a self, parent: &'a str, admitted: bool) -> BoxFuture<'a, Result<Vec<Block>>> {
        async move {
            let mut blocks = Vec::new();
            let mut cursor: Option<String> = None;
            let mut first = admitted;
            loop {
                let mut path = format!("blocks/{parent}/children?page_size={PAGE_SIZE}");
                if let Some(cursor) = &cursor {
                    path.push_str("&start_cursor=");
                    path.push_str(cursor);
                }
                let page = if first {
                    first = false;
                    self.send(self.api(Method::GET, &path), &path).await?
                } else {
                    self.follow_up(Method::GET, &path, None).await?
                };
                for raw in results(&page, &path)? {
                    let mut block = parse_block(raw);
                    let descend = raw["has_children"].as_bool().unwrap_or(false)
                        && !matches!(block.kind, BlockKind::ChildPage | BlockKind::ChildCollection);
                    if descend {
                        block.children = self.fetch_blocks(&block.id, false).await?;
                    }
                    blocks.push(block);
                }
                match next_cursor(&page) {
                    Some(next) => cursor = Some(next),
                    None => break,
                }
            }
            Ok(blocks)
        }
        .boxed()
    }
}

#[async_trait]
impl RemoteSource for HttpSource {
    fn name(&self) -> &str {
        "http"
    }

    #[instrument(skip(self, id), fields(id = %id))]
    async fn get_resource(&self, id: &ResourceId) -> Result<Resource> {
        let page_path = format!("pages/{id}");
        match self.send(self.api(Method::GET, &page_path), &page_path).await {
            Ok(page) => return parse_page(&page, &page_path),
            Err(err) if err.is_not_found() => {
                tracing::debug!("Not a page; trying as a collection");
            },
            Err(err) => return Err(err),
        }
        let collection_path = format!("databases/{id}");
        match self.follow_up(Method::GET, &collection_path, None).await {
            Ok(collection) => parse_collection(&collection, &collection_path),
            Err(err) if err.is_not_found() => Err(err.raise(ErrorKind::NotFound(id.to_string()))),
            Err(err) => Err(err),
        }
    }

    #[instrument(skip(self, id), fields(id = %id))]
    async fn get_children(&self, id: &ResourceId) -> Result<Vec<Block>> {
        self.fetch_blocks(id.as_str(), true).await
    }

    #[instrument(skip(self, id), fields(id = %id))]
    async fn query_collection(&self, id: &ResourceId) -> Result<Vec<Resource>> {
        let path = format!("databases/{id}/query");
        let mut entries = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let mut body = json!({ "page_size": PAGE_SIZE });
            if let Some(cursor) = &cursor {
                body["start_cursor"] = Value::String(cursor.clone());
            }
            let page = if cursor.is_none() {
                self.send(self.api(Method::POST, &path).json(&body), &path).await?
            } else {
                self.follow_up(Method::POST, &path, Some(&body)).await?
            };
            for raw in results(&page, &path)? {
                entries.push(parse_page(raw, &path)?.with_parent(id.clone()));
            }
            match next_cursor(&page) {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        tracing::debug!(entries = entries.len(), "Queried collection");
        Ok(entries)
    }

    #[instrument(skip(self, url))]
    async fn download(&self, url: &str) -> Result<Vec<u8>> {
        // File URLs are pre-signed; the API token must not be sent along.
        let response = self
            .client
            .get(url)
            .send()
            .await
            .or_raise(|| ErrorKind::Network("attachment download".to_string()))?;
        match response.status() {
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = parse_retry_after(response.headers().get(RETRY_AFTER).and_then(|v| v.to_str().ok()));
                exn::bail!(ErrorKind::Throttled { retry_after })
            },
            StatusCode::NOT_FOUND | StatusCode::FORBIDDEN => {
                exn::bail!(ErrorKind::NotFound("attachment".to_string()))
            },
            status if !status.is_success() => {
                exn::bail!(ErrorKind::Network(format!("attachment download returned {status}")))
            },
            _ => {},
        }
        let bytes = response
            .bytes()
            .await
            .or_raise(|| ErrorKind::Network("attachment download".to_string()))?;
        Ok(bytes.to_vec())
    }
}

fn classify_failure(status: StatusCode, body: Option<&Value>, what: &str) -> ErrorKind {
    let code = body.and_then(|b| b["code"].as_str()).unwrap_or_default();
    let message = body.and_then(|b| b["message"].as_str()).unwrap_or_default();
    match (status, code) {
        (_, "rate_limited") => ErrorKind::Throttled {
            retry_after: parse_retry_after(None),
        },
        (StatusCode::NOT_FOUND, _) | (_, "object_not_found") => ErrorKind::NotFound(what.to_string()),
        (_, "validation_error") => ErrorKind::WrongType(what.to_string()),
        (StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN, _) | (_, "unauthorized" | "restricted_resource") => {
            ErrorKind::Unauthorized
        },
        _ => ErrorKind::Network(format!("{what}: {status} {message}").trim_end().to_string()),
    }
}

fn user_name(user: &Value) -> String {
    user["name"]
        .as_str()
        .filter(|n| !n.is_empty())
        .or_else(|| user["id"].as_str())
        .unwrap_or("unknown")
        .to_string()
}

fn results<'a>(page: &'a Value, what: &str) -> Result<&'a Vec<Value>> {
    page["results"]
        .as_array()
        .ok_or_else(|| exn::Exn::from(ErrorKind::InvalidResponse(format!("{what}: missing results"))))
}

fn next_cursor(page: &Value) -> Option<String> {
    if !page["has_more"].as_bool().unwrap_or(false) {
        return None;
    }
    page["next_cursor"].as_str().filter(|c| !c.is_empty()).map(str::to_string)
}

fn plain_text(rich: &Value) -> String {
    rich.as_array()
        .map(|parts| parts.iter().filter_map(|p| p["plain_text"].as_str()).collect())
        .unwrap_or_default()
}

fn parse_common(raw: &Value, what: &str) -> Result<(ResourceId, OffsetDateTime)> {
    let id = raw["id"]
        .as_str()
        .ok_or_else(|| exn::Exn::from(ErrorKind::InvalidResponse(format!("{what}: missing id"))))?;
    let id = ResourceId::parse(id).or_raise(|| ErrorKind::InvalidResponse(format!("{what}: bad id")))?;
    let edited = raw["last_edited_time"].as_str().unwrap_or_default();
    let edited = OffsetDateTime::parse(edited, &Rfc3339)
        .or_raise(|| ErrorKind::InvalidResponse(format!("{what}: bad last_edited_time")))?;
    Ok((id, edited))
}

fn parse_page(raw: &Value, what: &str) -> Result<Resource> {
    let (id, edited) = parse_common(raw, what)?;
    let mut title = String::new();
    let mut properties = BTreeMap::new();
    if let Some(props) = raw["properties"].as_object() {
        for (name, prop) in props {
            if prop["type"] == "title" {
                title = plain_text(&prop["title"]);
            } else if let Some(value) = property_text(prop).filter(|v| !v.is_empty()) {
                properties.insert(name.clone(), value);
            }
        }
    }
    let parent = raw["parent"]["database_id"].as_str().and_then(|p| ResourceId::parse(p).ok());
    Ok(Resource {
        id,
        kind: ResourceKind::Page,
        title,
        last_modified: edited,
        parent,
        properties,
    })
}

fn parse_collection(raw: &Value, what: &str) -> Result<Resource> {
    let (id, edited) = parse_common(raw, what)?;
    Ok(Resource::collection(id, plain_text(&raw["title"]), edited))
}

/// Flatten a property value to plain text.
fn property_text(prop: &Value) -> Option<String> {
    let kind = prop["type"].as_str()?;
    let value = &prop[kind];
    let text = match kind {
        "rich_text" => plain_text(value),
        "number" => value.as_f64().map(|n| n.to_string())?,
        "select" | "status" => value["name"].as_str()?.to_string(),
        "multi_select" => value
            .as_array()?
            .iter()
            .filter_map(|o| o["name"].as_str())
            .collect::<Vec<_>>()
            .join(", "),
        "date" => match (value["start"].as_str(), value["end"].as_str()) {
            (Some(start), Some(end)) => format!("{start} → {end}"),
            (Some(start), None) => start.to_string(),
            _ => return None,
        },
        "checkbox" => value.as_bool()?.to_string(),
        "url" | "email" | "phone_number" | "created_time" | "last_edited_time" => value.as_str()?.to_string(),
        "people" => value
            .as_array()?
            .iter()
            .filter_map(|p| p["name"].as_str())
            .collect::<Vec<_>>()
            .join(", "),
        _ => return None,
    };
    Some(text)
}

fn parse_block(raw: &Value) -> Block {
    let wire = raw["type"].as_str().unwrap_or_default();
    let data = &raw[wire];
    let kind = BlockKind::from_wire(wire);
    let text = match kind {
        BlockKind::ChildPage | BlockKind::ChildCollection => data["title"].as_str().unwrap_or_default().to_string(),
        BlockKind::Image | BlockKind::File | BlockKind::Pdf | BlockKind::Audio | BlockKind::Video => {
            plain_text(&data["caption"])
        },
        _ => plain_text(&data["rich_text"]),
    };
    let url = match kind {
        BlockKind::Bookmark => data["url"].as_str().map(str::to_string),
        _ if kind.is_attachment() => {
            let source = data["type"].as_str().unwrap_or("external");
            data[source]["url"].as_str().map(str::to_string)
        },
        _ => None,
    };
    Block {
        id: raw["id"].as_str().unwrap_or_default().to_string(),
        checked: data["checked"].as_bool(),
        language: data["language"].as_str().map(str::to_string),
        kind,
        text,
        url,
        children: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(StatusCode::NOT_FOUND, json!({"code": "object_not_found"}), "not_found")]
    #[case(StatusCode::BAD_REQUEST, json!({"code": "validation_error"}), "wrong_type")]
    #[case(StatusCode::UNAUTHORIZED, json!({"code": "unauthorized"}), "unauthorized")]
    #[case(StatusCode::BAD_GATEWAY, json!({}), "network")]
    fn test_classify_failure(#[case] status: StatusCode, #[case] body: Value, #[case] expected: &str) {
        let kind = classify_failure(status, Some(&body), "pages/x");
        let actual = match kind {
            ErrorKind::NotFound(_) => "not_found",
            ErrorKind::WrongType(_) => "wrong_type",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Network(_) => "network",
            _ => "other",
        };
        assert_eq!(actual, expected);
    }

    #[test]
    fn test_parse_page_with_properties() {
        let raw = json!({
            "id": "01234567-89ab-cdef-0123-456789abcdef",
            "last_edited_time": "2024-03-01T10:00:00.000Z",
            "parent": {"type": "database_id", "database_id": "fedcba98-7654-3210-fedc-ba9876543210"},
            "properties": {
                "Name": {"type": "title", "title": [{"plain_text": "Launch "}, {"plain_text": "plan"}]},
                "Status": {"type": "status", "status": {"name": "Done"}},
                "Tags": {"type": "multi_select", "multi_select": [{"name": "a"}, {"name": "b"}]},
                "Empty": {"type": "rich_text", "rich_text": []}
            }
        });
        let page = parse_page(&raw, "test").unwrap();
        assert_eq!(page.title, "Launch plan");
        assert_eq!(page.kind, ResourceKind::Page);
        assert_eq!(page.properties.get("Status").map(String::as_str), Some("Done"));
        assert_eq!(page.properties.get("Tags").map(String::as_str), Some("a, b"));
        assert!(!page.properties.contains_key("Empty"));
        assert_eq!(page.parent.unwrap().as_str(), "fedcba98-7654-3210-fedc-ba9876543210");
    }

    #[test]
    fn test_parse_page_rejects_bad_timestamp() {
        let raw = json!({"id": "0123456789abcdef0123456789abcdef", "last_edited_time": "yesterday"});
        assert!(matches!(&*parse_page(&raw, "test").unwrap_err(), ErrorKind::InvalidResponse(_)));
    }

    #[test]
    fn test_parse_attachment_block() {
        let raw = json!({
            "id": "blk",
            "type": "image",
            "has_children": false,
            "image": {"type": "file", "file": {"url": "https://files.example/a.png?X-Amz=1"}, "caption": []}
        });
        let block = parse_block(&raw);
        assert_eq!(block.kind, BlockKind::Image);
        assert_eq!(block.attachment_url(), Some("https://files.example/a.png?X-Amz=1"));
    }

    #[rstest]
    #[case(json!({"object": "user", "id": "u1", "name": "Notes export", "type": "bot"}), "Notes export")]
    #[case(json!({"object": "user", "id": "u1", "name": null}), "u1")]
    #[case(json!({}), "unknown")]
    fn test_user_name(#[case] user: Value, #[case] expected: &str) {
        assert_eq!(user_name(&user), expected);
    }

    #[test]
    fn test_next_cursor() {
        assert_eq!(next_cursor(&json!({"has_more": true, "next_cursor": "abc"})), Some("abc".to_string()));
        assert_eq!(next_cursor(&json!({"has_more": false, "next_cursor": "abc"})), None);
        assert_eq!(next_cursor(&json!({})), None);
    }
}
