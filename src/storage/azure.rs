//! REST client for the Azure Queue and Blob services (or the local emulator).

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use reqwest::{Client, Method, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument, warn};

use super::account::{Credentials, StorageAccount};
use super::auth::{authorization, string_to_sign, CanonicalRequest};
use super::xml;
use super::{MessageReceipt, StorageBackend, StorageError};
use crate::poll::retry::{with_retry, RetryConfig};

const API_VERSION: &str = "2021-08-06";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Service maximum for a single Get Messages call.
const MAX_MESSAGES_PER_READ: u32 = 32;
const VISIBILITY_TIMEOUT_SECS: u32 = 30;
const MAX_ERROR_DETAIL: usize = 512;

/// How queue message text is encoded on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageEncoding {
    /// Base64 text, the functions runtime default. Reads fall back to the raw
    /// text when it does not decode to UTF-8.
    #[default]
    Base64,
    Plain,
}

impl MessageEncoding {
    fn encode(self, body: &str) -> String {
        match self {
            MessageEncoding::Base64 => STANDARD.encode(body),
            MessageEncoding::Plain => body.to_string(),
        }
    }

    fn decode(self, text: String) -> String {
        match self {
            MessageEncoding::Base64 => STANDARD
                .decode(text.as_bytes())
                .ok()
                .and_then(|raw| String::from_utf8(raw).ok())
                .unwrap_or(text),
            MessageEncoding::Plain => text,
        }
    }
}

#[derive(Clone, Copy)]
enum Service {
    Blob,
    Queue,
}

struct StorageRequest {
    operation: &'static str,
    method: Method,
    service: Service,
    /// Path relative to the service endpoint, already percent-encoded.
    path: String,
    query: Vec<(&'static str, String)>,
    headers: Vec<(&'static str, String)>,
    content_type: Option<&'static str>,
    body: Bytes,
    retry: bool,
}

impl StorageRequest {
    fn new(operation: &'static str, method: Method, service: Service, path: String) -> Self {
        Self {
            operation,
            method,
            service,
            path,
            query: Vec::new(),
            headers: Vec::new(),
            content_type: None,
            body: Bytes::new(),
            retry: true,
        }
    }

    /// Reads made while polling are retried by the poller, and a retried
    /// put could enqueue the message twice.
    fn single_attempt(mut self) -> Self {
        self.retry = false;
        self
    }

    fn query(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.query.push((name, value.into()));
        self
    }

    fn header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    fn body(mut self, content_type: &'static str, body: Bytes) -> Self {
        self.content_type = Some(content_type);
        self.body = body;
        self
    }
}

pub struct AzureStorageClient {
    http: Client,
    account: StorageAccount,
    retry: RetryConfig,
    encoding: MessageEncoding,
}

impl AzureStorageClient {
    pub fn new(account: StorageAccount) -> Result<Self, StorageError> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| StorageError::Network(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            account,
            retry: RetryConfig::default(),
            encoding: MessageEncoding::default(),
        })
    }

    pub fn from_connection_string(connection_string: &str) -> Result<Self, StorageError> {
        Self::new(StorageAccount::from_connection_string(connection_string)?)
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_message_encoding(mut self, encoding: MessageEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn account(&self) -> &StorageAccount {
        &self.account
    }

    fn endpoint(&self, service: Service) -> &str {
        match service {
            Service::Blob => &self.account.blob_endpoint,
            Service::Queue => &self.account.queue_endpoint,
        }
    }

    fn build(&self, request: &StorageRequest) -> Result<reqwest::RequestBuilder, StorageError> {
        let base = format!("{}{}", self.endpoint(request.service), request.path);
        let mut url = match &self.account.credentials {
            Credentials::Sas(sas) => Url::parse(&format!("{base}?{sas}")),
            Credentials::SharedKey { .. } => Url::parse(&base),
        }
        .map_err(|e| StorageError::InvalidConnectionString(format!("bad endpoint {base}: {e}")))?;
        if !request.query.is_empty() {
            url.query_pairs_mut()
                .extend_pairs(request.query.iter().map(|(k, v)| (*k, v.as_str())));
        }

        let mut ms_headers = request.headers.clone();
        ms_headers.push(("x-ms-version", API_VERSION.to_string()));
        ms_headers.push((
            "x-ms-date",
            chrono::Utc::now()
                .format("%a, %d %b %Y %H:%M:%S GMT")
                .to_string(),
        ));

        let mut builder = self.http.request(request.method.clone(), url.clone());
        if let Credentials::SharedKey { account, key } = &self.account.credentials {
            let canonical = CanonicalRequest {
                method: request.method.as_str(),
                content_length: request.body.len(),
                content_type: request.content_type,
                ms_headers: &ms_headers,
                path: url.path(),
                query: &request.query,
            };
            let signature = authorization(account, key, &string_to_sign(account, &canonical))?;
            builder = builder.header(reqwest::header::AUTHORIZATION, signature);
        }
        for (name, value) in &ms_headers {
            builder = builder.header(*name, value.as_str());
        }
        if let Some(content_type) = request.content_type {
            builder = builder.header(reqwest::header::CONTENT_TYPE, content_type);
        }
        Ok(builder.body(request.body.clone()))
    }

    /// Sends, retrying transient failures unless the request is single
    /// attempt. Any non-5xx status is handed back for the caller to interpret.
    async fn send(&self, request: StorageRequest) -> Result<reqwest::Response, StorageError> {
        let single = RetryConfig::none();
        let retry = if request.retry { &self.retry } else { &single };
        let request = &request;
        with_retry(retry, request.operation, move || async move {
            let response = self.build(request)?.send().await.map_err(|e| {
                if e.is_timeout() {
                    StorageError::Timeout
                } else {
                    StorageError::Network(e.to_string())
                }
            })?;
            if response.status().is_server_error() {
                return Err(http_error(request.operation, response).await);
            }
            Ok(response)
        })
        .await
    }

    async fn get_messages(&self, queue: &str, count: u32) -> Result<Vec<String>, StorageError> {
        let request = StorageRequest::new(
            "get_messages",
            Method::GET,
            Service::Queue,
            format!("/{}/messages", segment(queue)),
        )
        .query("numofmessages", count.to_string())
        .query("visibilitytimeout", VISIBILITY_TIMEOUT_SECS.to_string())
        .single_attempt();
        let response = self.send(request).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(not_found("queue", queue));
        }
        let response = expect_status(response, "get_messages", &[StatusCode::OK]).await?;
        let body = response
            .text()
            .await
            .map_err(|e| StorageError::Decode(e.to_string()))?;

        let mut bodies = Vec::new();
        for message in xml::parse_messages(&body) {
            // An undeleted message becomes visible again once the visibility
            // timeout lapses, so it is left for a later read.
            if let Err(e) = self
                .delete_message(queue, &message.message_id, &message.pop_receipt)
                .await
            {
                warn!(
                    queue,
                    message_id = %message.message_id,
                    error = %e,
                    "failed to delete dequeued message"
                );
                continue;
            }
            bodies.push(self.encoding.decode(message.message_text.unwrap_or_default()));
        }
        debug!(queue, count = bodies.len(), "dequeued messages");
        Ok(bodies)
    }

    async fn delete_message(
        &self,
        queue: &str,
        message_id: &str,
        pop_receipt: &str,
    ) -> Result<(), StorageError> {
        let request = StorageRequest::new(
            "delete_message",
            Method::DELETE,
            Service::Queue,
            format!("/{}/messages/{}", segment(queue), segment(message_id)),
        )
        .query("popreceipt", pop_receipt);
        let response = self.send(request).await?;
        // Already gone once another reader deleted it.
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        expect_status(response, "delete_message", &[StatusCode::NO_CONTENT]).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl StorageBackend for AzureStorageClient {
    #[instrument(name = "create_queue", skip(self))]
    async fn create_queue(&self, queue: &str) -> Result<(), StorageError> {
        let request = StorageRequest::new(
            "create_queue",
            Method::PUT,
            Service::Queue,
            format!("/{}", segment(queue)),
        );
        let response = self.send(request).await?;
        expect_status(
            response,
            "create_queue",
            &[StatusCode::CREATED, StatusCode::NO_CONTENT],
        )
        .await?;
        Ok(())
    }

    #[instrument(name = "delete_queue", skip(self))]
    async fn delete_queue(&self, queue: &str) -> Result<(), StorageError> {
        let request = StorageRequest::new(
            "delete_queue",
            Method::DELETE,
            Service::Queue,
            format!("/{}", segment(queue)),
        );
        let response = self.send(request).await?;
        expect_status(
            response,
            "delete_queue",
            &[StatusCode::NO_CONTENT, StatusCode::NOT_FOUND],
        )
        .await?;
        Ok(())
    }

    #[instrument(name = "insert_message", skip(self, body), fields(len = body.len()))]
    async fn insert_message(
        &self,
        queue: &str,
        body: &str,
    ) -> Result<MessageReceipt, StorageError> {
        let envelope = xml::put_message_body(&self.encoding.encode(body));
        let request = StorageRequest::new(
            "put_message",
            Method::POST,
            Service::Queue,
            format!("/{}/messages", segment(queue)),
        )
        .body("application/xml", Bytes::from(envelope))
        .single_attempt();
        let response = self.send(request).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(not_found("queue", queue));
        }
        let response = expect_status(response, "put_message", &[StatusCode::CREATED]).await?;
        let text = response
            .text()
            .await
            .map_err(|e| StorageError::Decode(e.to_string()))?;
        let message_id = xml::element(&text, "MessageId")
            .ok_or_else(|| StorageError::Decode("put_message response has no MessageId".into()))?
            .to_string();
        debug!(queue, %message_id, "inserted message");
        Ok(MessageReceipt { message_id })
    }

    async fn read_message(&self, queue: &str) -> Result<Option<String>, StorageError> {
        Ok(self.get_messages(queue, 1).await?.into_iter().next())
    }

    async fn read_all_messages(&self, queue: &str) -> Result<Vec<String>, StorageError> {
        let mut drained = Vec::new();
        loop {
            let batch = self.get_messages(queue, MAX_MESSAGES_PER_READ).await?;
            if batch.is_empty() {
                return Ok(drained);
            }
            drained.extend(batch);
        }
    }

    #[instrument(name = "create_container", skip(self))]
    async fn create_container(&self, container: &str) -> Result<(), StorageError> {
        let request = StorageRequest::new(
            "create_container",
            Method::PUT,
            Service::Blob,
            format!("/{}", segment(container)),
        )
        .query("restype", "container");
        let response = self.send(request).await?;
        // 409 ContainerAlreadyExists
        expect_status(
            response,
            "create_container",
            &[StatusCode::CREATED, StatusCode::CONFLICT],
        )
        .await?;
        Ok(())
    }

    #[instrument(name = "delete_container", skip(self))]
    async fn delete_container(&self, container: &str) -> Result<(), StorageError> {
        let request = StorageRequest::new(
            "delete_container",
            Method::DELETE,
            Service::Blob,
            format!("/{}", segment(container)),
        )
        .query("restype", "container");
        let response = self.send(request).await?;
        expect_status(
            response,
            "delete_container",
            &[StatusCode::ACCEPTED, StatusCode::NOT_FOUND],
        )
        .await?;
        Ok(())
    }

    #[instrument(name = "upload_blob", skip(self, content), fields(len = content.len()))]
    async fn upload_blob(
        &self,
        container: &str,
        name: &str,
        content: Bytes,
    ) -> Result<(), StorageError> {
        let request = StorageRequest::new(
            "put_blob",
            Method::PUT,
            Service::Blob,
            format!("/{}/{}", segment(container), blob_path(name)),
        )
        .header("x-ms-blob-type", "BlockBlob")
        .body("application/octet-stream", content);
        let response = self.send(request).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(not_found("container", container));
        }
        expect_status(response, "put_blob", &[StatusCode::CREATED]).await?;
        Ok(())
    }

    async fn download_blob(
        &self,
        container: &str,
        name: &str,
    ) -> Result<Option<Bytes>, StorageError> {
        let request = StorageRequest::new(
            "get_blob",
            Method::GET,
            Service::Blob,
            format!("/{}/{}", segment(container), blob_path(name)),
        )
        .single_attempt();
        let response = self.send(request).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = expect_status(response, "get_blob", &[StatusCode::OK]).await?;
        let content = response
            .bytes()
            .await
            .map_err(|e| StorageError::Decode(e.to_string()))?;
        Ok(Some(content))
    }
}

fn segment(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}

/// Blob names may contain `/` as a virtual directory separator.
fn blob_path(name: &str) -> String {
    name.split('/').map(segment).collect::<Vec<_>>().join("/")
}

fn not_found(kind: &str, name: &str) -> StorageError {
    StorageError::NotFound {
        resource: format!("{kind} '{name}'"),
    }
}

async fn expect_status(
    response: reqwest::Response,
    operation: &'static str,
    accepted: &[StatusCode],
) -> Result<reqwest::Response, StorageError> {
    if accepted.contains(&response.status()) {
        Ok(response)
    } else {
        Err(http_error(operation, response).await)
    }
}

async fn http_error(operation: &'static str, response: reqwest::Response) -> StorageError {
    let status = response.status().as_u16();
    let mut detail = response.text().await.unwrap_or_default();
    if let Some(code_start) = detail.find("<Code>") {
        if let Some(code) = xml::element(&detail[code_start..], "Code") {
            detail = code.to_string();
        }
    }
    if detail.len() > MAX_ERROR_DETAIL {
        let mut cut = MAX_ERROR_DETAIL;
        while !detail.is_char_boundary(cut) {
            cut -= 1;
        }
        detail.truncate(cut);
    }
    StorageError::Http {
        status,
        operation,
        detail,
    }
}
