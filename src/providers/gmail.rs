//! Gmail API provider implementation.
//!
//! This module provides a [`MailProvider`] backed by the Gmail REST API.
//! Authentication takes an OAuth bearer token obtained out of band; the
//! provider validates it against the profile endpoint and records the
//! account's address as provenance.
//!
//! # API Usage
//!
//! This provider uses the Gmail API v1:
//! - `users.getProfile` to validate the token
//! - `users.messages.list` for paginated listing
//! - `users.messages.get` with `format=full` for message content
//! - `users.messages.attachments.get` for attachment bytes

use async_trait::async_trait;
use base64::prelude::*;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, RETRY_AFTER};
use serde::Deserialize;

use super::markdown::html_to_markdown;
use super::{
    Capabilities, Credentials, ListQuery, MailProvider, MessagePage, MessageRef, ProviderError,
    QuotaInfo, Result,
};
use crate::domain::{
    Address, AttachmentRef, Body, NormalizedMessage, Provenance, ProviderMessageId, ThreadId,
};

/// Registry name.
pub const GMAIL_PROVIDER: &str = "gmail";

/// Default API root for the authenticated user.
pub const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users/me";

const GMAIL_DAILY_QUOTA_UNITS: u64 = 1_000_000_000;
const GMAIL_PER_USER_QUOTA_UNITS: u64 = 250;

/// Gmail profile response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfileResponse {
    email_address: String,
}

/// Gmail API message list response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageListResponse {
    messages: Option<Vec<GmailMessageRef>>,
    next_page_token: Option<String>,
    result_size_estimate: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailMessageRef {
    id: String,
    thread_id: Option<String>,
}

/// Gmail API message.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailMessage {
    id: String,
    thread_id: Option<String>,
    label_ids: Option<Vec<String>>,
    payload: Option<GmailPart>,
    internal_date: Option<String>,
}

/// Gmail message part. The top-level payload has the same shape.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailPart {
    mime_type: Option<String>,
    filename: Option<String>,
    headers: Option<Vec<GmailHeader>>,
    body: Option<GmailBody>,
    parts: Option<Vec<GmailPart>>,
}

/// Gmail message header.
#[derive(Debug, Deserialize)]
struct GmailHeader {
    name: String,
    value: String,
}

/// Gmail message body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailBody {
    data: Option<String>,
    size: Option<u64>,
    attachment_id: Option<String>,
}

/// Gmail attachment response.
#[derive(Debug, Deserialize)]
struct AttachmentResponse {
    data: String,
}

/// Text bodies and attachment manifest gathered from a part tree.
#[derive(Debug, Default)]
struct ExtractedParts {
    plain: Option<String>,
    html: Option<String>,
    attachments: Vec<AttachmentRef>,
}

/// Gmail API provider.
///
/// # Example
///
/// ```ignore
/// let mut provider = GmailProvider::new(GMAIL_API_BASE);
/// provider
///     .authenticate(&Credentials::BearerToken { access_token })
///     .await?;
/// let page = provider.list_messages(&ListQuery { max_results: 100, ..Default::default() }).await?;
/// ```
pub struct GmailProvider {
    /// HTTP client for API requests.
    client: reqwest::Client,
    /// API root, ending at `users/me`.
    base_url: String,
    /// Current OAuth access token.
    access_token: Option<String>,
    /// Address reported by the profile endpoint.
    account: Option<String>,
    /// Whether the token has been validated.
    authenticated: bool,
}

impl GmailProvider {
    /// Creates an unauthenticated provider against `base_url`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            access_token: None,
            authenticated: false,
            account: None,
        }
    }

    /// Preloads a token so that `authenticate(&Credentials::None)` can validate it.
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// Builds authorization headers for API requests.
    fn auth_headers(&self) -> Result<HeaderMap> {
        let token = self
            .access_token
            .as_ref()
            .ok_or_else(|| ProviderError::Authentication("not authenticated".to_string()))?;

        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| ProviderError::Internal(format!("invalid header: {}", e)))?,
        );
        Ok(headers)
    }

    /// Makes an authenticated GET request to the Gmail API.
    async fn get<T: for<'de> Deserialize<'de>>(
        &self,
        endpoint: &str,
        params: &[(&str, String)],
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, endpoint);
        let headers = self.auth_headers()?;

        let response = self
            .client
            .get(&url)
            .headers(headers)
            .query(params)
            .send()
            .await
            .map_err(|e| ProviderError::Connection(e.to_string()))?;

        Self::handle_response(response).await
    }

    /// Handles API response, checking for errors.
    async fn handle_response<T: for<'de> Deserialize<'de>>(response: reqwest::Response) -> Result<T> {
        if !response.status().is_success() {
            return Err(Self::handle_error(response).await);
        }

        response
            .json()
            .await
            .map_err(|e| ProviderError::Internal(format!("parse response: {}", e)))
    }

    /// Handles API error responses.
    async fn handle_error(response: reqwest::Response) -> ProviderError {
        let status = response.status();
        let retry_after_secs = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let body = response.text().await.unwrap_or_default();

        match status.as_u16() {
            401 | 403 => ProviderError::Authentication(format!("unauthorized: {}", body)),
            404 => ProviderError::NotFound(body),
            429 => ProviderError::RateLimited { retry_after_secs },
            _ => ProviderError::Provider(format!("API error ({}): {}", status, body)),
        }
    }

    /// Combines the caller's search expression with date bounds.
    fn search_expression(query: &ListQuery) -> Option<String> {
        let mut terms: Vec<String> = Vec::new();
        if let Some(q) = query.query.as_deref().map(str::trim).filter(|q| !q.is_empty()) {
            terms.push(q.to_string());
        }
        if let Some(start) = query.date_range.start {
            terms.push(format!("after:{}", start.timestamp()));
        }
        if let Some(end) = query.date_range.end {
            terms.push(format!("before:{}", end.timestamp()));
        }
        (!terms.is_empty()).then(|| terms.join(" "))
    }

    /// Walks a part tree collecting the first plain and html bodies and every
    /// part that names a downloadable attachment.
    fn extract_parts(part: &GmailPart, out: &mut ExtractedParts) {
        let mime = part.mime_type.as_deref().unwrap_or("");
        let filename = part.filename.as_deref().unwrap_or("");

        if !filename.is_empty() {
            if let Some(body) = &part.body {
                if let Some(attachment_id) = &body.attachment_id {
                    out.attachments.push(AttachmentRef {
                        attachment_id: attachment_id.clone(),
                        filename: filename.to_string(),
                        declared_mime: part.mime_type.clone().filter(|m| !m.is_empty()),
                        size_bytes: body.size.unwrap_or(0),
                    });
                }
            }
        } else if mime == "text/plain" && out.plain.is_none() {
            out.plain = part.body.as_ref().and_then(Self::decode_text);
        } else if mime == "text/html" && out.html.is_none() {
            out.html = part.body.as_ref().and_then(Self::decode_text);
        } else if mime.is_empty() && part.parts.is_none() && out.plain.is_none() {
            // Single-part messages without a declared type.
            out.plain = part.body.as_ref().and_then(Self::decode_text);
        }

        // Recurse into nested parts
        for nested in part.parts.iter().flatten() {
            Self::extract_parts(nested, out);
        }
    }

    fn decode_text(body: &GmailBody) -> Option<String> {
        let bytes = decode_base64url(body.data.as_deref()?).ok()?;
        String::from_utf8(bytes).ok()
    }

    /// Converts a Gmail message to a [`NormalizedMessage`].
    fn normalize(&self, msg: GmailMessage) -> NormalizedMessage {
        let payload = msg.payload.unwrap_or_default();
        let headers = payload.headers.as_deref().unwrap_or_default();

        let get_header = |name: &str| -> Option<&str> {
            headers
                .iter()
                .find(|hdr| hdr.name.eq_ignore_ascii_case(name))
                .map(|hdr| hdr.value.as_str())
        };

        let from = get_header("From")
            .map(Address::parse)
            .unwrap_or_else(|| Address::new("unknown@unknown"));
        let to = get_header("To").map(Address::parse_list).unwrap_or_default();
        let cc = get_header("Cc").map(Address::parse_list).unwrap_or_default();
        let bcc = get_header("Bcc").map(Address::parse_list).unwrap_or_default();
        let subject = get_header("Subject")
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or("(No Subject)")
            .to_string();

        let date = msg
            .internal_date
            .as_ref()
            .and_then(|d| d.parse::<i64>().ok())
            .and_then(DateTime::from_timestamp_millis)
            .or_else(|| {
                get_header("Date")
                    .and_then(|d| DateTime::parse_from_rfc2822(d.trim()).ok())
                    .map(|d| d.with_timezone(&Utc))
            })
            .unwrap_or_else(Utc::now);

        let mut extracted = ExtractedParts::default();
        Self::extract_parts(&payload, &mut extracted);

        let markdown = extracted
            .plain
            .clone()
            .filter(|p| !p.trim().is_empty())
            .or_else(|| extracted.html.as_deref().map(html_to_markdown));

        NormalizedMessage {
            id: ProviderMessageId::from(msg.id),
            thread_id: msg.thread_id.map(ThreadId::from),
            subject,
            from,
            to,
            cc,
            bcc,
            date,
            body: Body {
                plain: extracted.plain,
                html: extracted.html,
                markdown,
            },
            labels: msg.label_ids.unwrap_or_default(),
            attachments: extracted.attachments,
            provenance: Provenance::new(GMAIL_PROVIDER, self.account.clone()),
        }
    }
}

/// Decodes Gmail's URL-safe base64, with or without padding.
fn decode_base64url(data: &str) -> std::result::Result<Vec<u8>, base64::DecodeError> {
    BASE64_URL_SAFE_NO_PAD.decode(data.trim().trim_end_matches('='))
}

#[async_trait]
impl MailProvider for GmailProvider {
    fn name(&self) -> &str {
        GMAIL_PROVIDER
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            labels: true,
            threading: true,
            search: true,
        }
    }

    fn account(&self) -> Option<String> {
        self.account.clone()
    }

    fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    fn quota_info(&self) -> Option<QuotaInfo> {
        Some(QuotaInfo {
            daily_limit: Some(GMAIL_DAILY_QUOTA_UNITS),
            per_user_limit: Some(GMAIL_PER_USER_QUOTA_UNITS),
            note: Some("Gmail API quotas are managed in the Google Cloud Console".to_string()),
        })
    }

    async fn authenticate(&mut self, credentials: &Credentials) -> Result<()> {
        if let Credentials::BearerToken { access_token } = credentials {
            self.access_token = Some(access_token.clone());
        }
        if self.access_token.is_none() {
            return Err(ProviderError::Authentication(
                "no access token configured".to_string(),
            ));
        }

        match self.get::<ProfileResponse>("/profile", &[]).await {
            Ok(profile) => {
                tracing::info!(account = %profile.email_address, "Gmail token validated");
                self.account = Some(profile.email_address);
                self.authenticated = true;
                Ok(())
            }
            Err(e) => {
                self.authenticated = false;
                Err(e)
            }
        }
    }

    async fn test_connection(&self) -> bool {
        if !self.authenticated {
            return false;
        }
        match self.get::<ProfileResponse>("/profile", &[]).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!("Gmail connection test failed: {}", e);
                false
            }
        }
    }

    async fn list_messages(&self, query: &ListQuery) -> Result<MessagePage> {
        let mut params = vec![("maxResults", query.max_results.max(1).to_string())];
        if let Some(q) = Self::search_expression(query) {
            params.push(("q", q));
        }
        if let Some(token) = &query.page_token {
            params.push(("pageToken", token.clone()));
        }

        let response: MessageListResponse = self.get("/messages", &params).await?;
        let refs = response
            .messages
            .unwrap_or_default()
            .into_iter()
            .map(|m| MessageRef {
                id: ProviderMessageId::from(m.id),
                thread_id: m.thread_id.map(ThreadId::from),
            })
            .collect::<Vec<_>>();

        tracing::debug!(count = refs.len(), "Listed Gmail messages");

        Ok(MessagePage {
            refs,
            next_page_token: response.next_page_token.filter(|t| !t.is_empty()),
            total_estimate: response.result_size_estimate,
        })
    }

    async fn get_message(&self, id: &ProviderMessageId) -> Result<NormalizedMessage> {
        let endpoint = format!("/messages/{}", id);
        let msg: GmailMessage = self
            .get(&endpoint, &[("format", "full".to_string())])
            .await?;
        Ok(self.normalize(msg))
    }

    async fn get_attachment(
        &self,
        message_id: &ProviderMessageId,
        attachment_id: &str,
    ) -> Result<Vec<u8>> {
        let endpoint = format!("/messages/{}/attachments/{}", message_id, attachment_id);
        let response: AttachmentResponse = self.get(&endpoint, &[]).await?;
        decode_base64url(&response.data)
            .map_err(|e| ProviderError::Provider(format!("invalid attachment encoding: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use httpmock::Method::GET;
    use httpmock::MockServer;
    use serde_json::json;

    fn encode(text: &str) -> String {
        BASE64_URL_SAFE_NO_PAD.encode(text.as_bytes())
    }

    async fn authenticated(server: &MockServer) -> GmailProvider {
        server
            .mock_async(|when, then| {
                when.method(GET).path("/profile");
                then.status(200)
                    .json_body(json!({"emailAddress": "me@example.com", "messagesTotal": 3}));
            })
            .await;

        let mut provider = GmailProvider::new(server.base_url());
        provider
            .authenticate(&Credentials::BearerToken {
                access_token: "token".to_string(),
            })
            .await
            .unwrap();
        provider
    }

    #[tokio::test]
    async fn authenticate_records_account() {
        let server = MockServer::start_async().await;
        let provider = authenticated(&server).await;

        assert!(provider.is_authenticated());
        assert_eq!(provider.account().as_deref(), Some("me@example.com"));
        assert!(provider.test_connection().await);
    }

    #[tokio::test]
    async fn authenticate_rejects_bad_token() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/profile");
                then.status(401).body("invalid credentials");
            })
            .await;

        let mut provider = GmailProvider::new(server.base_url()).with_access_token("stale");
        let result = provider.authenticate(&Credentials::None).await;

        assert!(matches!(result, Err(ProviderError::Authentication(_))));
        assert!(!provider.is_authenticated());
        assert!(!provider.test_connection().await);
    }

    #[tokio::test]
    async fn authenticate_without_token() {
        let mut provider = GmailProvider::new("http://127.0.0.1:9");
        let result = provider.authenticate(&Credentials::None).await;
        assert!(matches!(result, Err(ProviderError::Authentication(_))));
    }

    #[test]
    fn publishes_api_quota() {
        let quota = GmailProvider::new("http://127.0.0.1:9").quota_info().unwrap();
        assert_eq!(quota.daily_limit, Some(1_000_000_000));
        assert_eq!(quota.per_user_limit, Some(250));
    }

    #[tokio::test]
    async fn list_messages_passes_query_and_cursor() {
        let server = MockServer::start_async().await;
        let provider = authenticated(&server).await;
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();

        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/messages")
                    .query_param("maxResults", "2")
                    .query_param("pageToken", "page-2")
                    .query_param("q", format!("from:alice after:{}", start.timestamp()));
                then.status(200).json_body(json!({
                    "messages": [
                        {"id": "m1", "threadId": "t1"},
                        {"id": "m2", "threadId": "t1"}
                    ],
                    "nextPageToken": "page-3",
                    "resultSizeEstimate": 7
                }));
            })
            .await;

        let page = provider
            .list_messages(&ListQuery {
                query: Some("from:alice".to_string()),
                max_results: 2,
                page_token: Some("page-2".to_string()),
                date_range: crate::providers::DateRange::since(start),
            })
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(page.refs.len(), 2);
        assert_eq!(page.refs[0].id.as_str(), "m1");
        assert_eq!(page.next_page_token.as_deref(), Some("page-3"));
        assert_eq!(page.total_estimate, Some(7));
    }

    #[tokio::test]
    async fn last_page_has_no_token() {
        let server = MockServer::start_async().await;
        let provider = authenticated(&server).await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/messages");
                then.status(200).json_body(json!({"resultSizeEstimate": 0}));
            })
            .await;

        let page = provider
            .list_messages(&ListQuery {
                max_results: 50,
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(page.refs.is_empty());
        assert!(page.next_page_token.is_none());
    }

    #[tokio::test]
    async fn get_message_normalizes_multipart() {
        let server = MockServer::start_async().await;
        let provider = authenticated(&server).await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/messages/m1")
                    .query_param("format", "full");
                then.status(200).json_body(json!({
                    "id": "m1",
                    "threadId": "t1",
                    "labelIds": ["INBOX", "IMPORTANT"],
                    "internalDate": "1736942400000",
                    "payload": {
                        "mimeType": "multipart/mixed",
                        "headers": [
                            {"name": "From", "value": "Alice Smith <alice@example.com>"},
                            {"name": "To", "value": "bob@example.com, \"Carol, C\" <carol@example.com>"},
                            {"name": "Subject", "value": "Quarterly report"}
                        ],
                        "parts": [
                            {
                                "mimeType": "multipart/alternative",
                                "parts": [
                                    {"mimeType": "text/html", "body": {"data": encode("<p>Numbers <b>inside</b></p>")}}
                                ]
                            },
                            {
                                "partId": "2",
                                "mimeType": "application/pdf",
                                "filename": "report.pdf",
                                "body": {"attachmentId": "att-1", "size": 2048}
                            }
                        ]
                    }
                }));
            })
            .await;

        let msg = provider
            .get_message(&ProviderMessageId::from("m1"))
            .await
            .unwrap();

        assert_eq!(msg.subject, "Quarterly report");
        assert_eq!(msg.from.email, "alice@example.com");
        assert_eq!(msg.from.name.as_deref(), Some("Alice Smith"));
        assert_eq!(msg.to.len(), 2);
        assert_eq!(msg.thread_id, Some(ThreadId::from("t1")));
        assert_eq!(msg.date, Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).unwrap());
        assert_eq!(msg.labels, vec!["INBOX", "IMPORTANT"]);
        assert!(msg.body.plain.is_none());
        let markdown = msg.body.markdown.as_deref().unwrap();
        assert!(markdown.contains("Numbers **inside**"));
        assert!(!markdown.contains("<b>"));
        assert_eq!(msg.attachments.len(), 1);
        assert_eq!(msg.attachments[0].attachment_id, "att-1");
        assert_eq!(msg.attachments[0].declared_mime.as_deref(), Some("application/pdf"));
        assert_eq!(msg.attachments[0].size_bytes, 2048);
        assert_eq!(msg.provenance.provider, "gmail");
        assert_eq!(msg.provenance.account.as_deref(), Some("me@example.com"));
    }

    #[tokio::test]
    async fn missing_subject_gets_placeholder() {
        let server = MockServer::start_async().await;
        let provider = authenticated(&server).await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/messages/m2");
                then.status(200).json_body(json!({
                    "id": "m2",
                    "payload": {
                        "mimeType": "text/plain",
                        "headers": [{"name": "From", "value": "x@example.com"}],
                        "body": {"data": encode("plain body")}
                    }
                }));
            })
            .await;

        let msg = provider
            .get_message(&ProviderMessageId::from("m2"))
            .await
            .unwrap();
        assert_eq!(msg.subject, "(No Subject)");
        assert_eq!(msg.body.plain.as_deref(), Some("plain body"));
        assert_eq!(msg.body.markdown.as_deref(), Some("plain body"));
    }

    #[tokio::test]
    async fn error_statuses_map_to_provider_errors() {
        let server = MockServer::start_async().await;
        let provider = authenticated(&server).await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/messages/missing");
                then.status(404).body("not found");
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/messages/busy");
                then.status(429).header("Retry-After", "12");
            })
            .await;

        let missing = provider
            .get_message(&ProviderMessageId::from("missing"))
            .await;
        assert!(matches!(missing, Err(ProviderError::NotFound(_))));

        let busy = provider.get_message(&ProviderMessageId::from("busy")).await;
        assert!(matches!(
            busy,
            Err(ProviderError::RateLimited {
                retry_after_secs: Some(12)
            })
        ));
    }

    #[tokio::test]
    async fn get_attachment_decodes_padded_data() {
        let server = MockServer::start_async().await;
        let provider = authenticated(&server).await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/messages/m1/attachments/att-1");
                then.status(200)
                    .json_body(json!({"size": 4, "data": BASE64_URL_SAFE.encode(b"%PDF")}));
            })
            .await;

        let data = provider
            .get_attachment(&ProviderMessageId::from("m1"), "att-1")
            .await
            .unwrap();
        assert_eq!(data, b"%PDF");
    }

    #[test]
    fn requests_fail_before_authentication() {
        let provider = GmailProvider::new(GMAIL_API_BASE);
        assert!(matches!(
            provider.auth_headers(),
            Err(ProviderError::Authentication(_))
        ));
    }
}
