//! Local `.eml` archive provider.
//!
//! Every `*.eml` file directly inside the configured directory is one
//! message; its file stem is the provider message id. Listing walks the
//! files in name order and the page token is the offset of the next file,
//! so any page can be re-requested from its token alone.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mail_parser::{Message as ParsedMessage, MessageParser, MimeHeaders, PartType};

use super::markdown::html_to_markdown;
use super::{
    Capabilities, Credentials, ListQuery, MailProvider, MessagePage, MessageRef, ProviderError,
    Result,
};
use crate::domain::{Address, AttachmentRef, Body, NormalizedMessage, Provenance, ProviderMessageId};

/// Registry name.
pub const LOCAL_PROVIDER: &str = "local";

const EML_EXTENSION: &str = "eml";

/// Provider over a directory of RFC 5322 files.
pub struct LocalProvider {
    directory: PathBuf,
    account: Option<String>,
    authenticated: bool,
}

impl LocalProvider {
    /// Creates a provider over `directory`. Nothing is read until [`authenticate`](MailProvider::authenticate).
    pub fn new(directory: impl Into<PathBuf>, account: Option<String>) -> Self {
        Self {
            directory: directory.into(),
            account,
            authenticated: false,
        }
    }

    /// Directory being read.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn require_auth(&self) -> Result<()> {
        if self.authenticated {
            Ok(())
        } else {
            Err(ProviderError::Authentication("not authenticated".to_string()))
        }
    }

    /// Resolves a message id to its file, refusing anything that would leave the directory.
    fn message_path(&self, id: &ProviderMessageId) -> Result<PathBuf> {
        let stem = id.as_str();
        if stem.is_empty() || stem.contains(['/', '\\']) || stem.contains("..") {
            return Err(ProviderError::InvalidRequest(format!(
                "invalid message id: {}",
                stem
            )));
        }
        Ok(self.directory.join(format!("{}.{}", stem, EML_EXTENSION)))
    }

    async fn read_message_file(&self, id: &ProviderMessageId) -> Result<Vec<u8>> {
        let path = self.message_path(id)?;
        tokio::fs::read(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ProviderError::NotFound(id.to_string()),
            _ => ProviderError::Provider(format!("read {}: {}", path.display(), e)),
        })
    }

    fn normalize(&self, id: &ProviderMessageId, message: &ParsedMessage<'_>) -> NormalizedMessage {
        let from = addresses(message.from())
            .into_iter()
            .next()
            .unwrap_or_else(|| Address::new("unknown@unknown"));

        let subject = message
            .subject()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or("(No Subject)")
            .to_string();

        let plain = message.text_part(0).and_then(|part| match &part.body {
            PartType::Text(text) => Some(text.to_string()),
            _ => None,
        });
        let html = message.html_part(0).and_then(|part| match &part.body {
            PartType::Html(html) => Some(html.to_string()),
            _ => None,
        });
        let markdown = plain
            .clone()
            .filter(|p| !p.trim().is_empty())
            .or_else(|| html.as_deref().map(html_to_markdown));

        let attachments = message
            .attachments()
            .enumerate()
            .map(|(index, part)| AttachmentRef {
                attachment_id: index.to_string(),
                filename: part
                    .attachment_name()
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("attachment-{}", index)),
                declared_mime: part.content_type().map(|ct| match ct.subtype() {
                    Some(sub) => format!("{}/{}", ct.ctype(), sub),
                    None => ct.ctype().to_string(),
                }),
                size_bytes: part.contents().len() as u64,
            })
            .collect();

        NormalizedMessage {
            id: id.clone(),
            thread_id: None,
            subject,
            from,
            to: addresses(message.to()),
            cc: addresses(message.cc()),
            bcc: addresses(message.bcc()),
            date: message_date(message),
            body: Body {
                plain,
                html,
                markdown,
            },
            labels: Vec::new(),
            attachments,
            provenance: Provenance::new(LOCAL_PROVIDER, self.account.clone()),
        }
    }
}

/// Flattens a header's address list, including group members.
fn addresses(addr: Option<&mail_parser::Address<'_>>) -> Vec<Address> {
    let Some(addr) = addr else {
        return Vec::new();
    };
    let convert = |a: &mail_parser::Addr<'_>| {
        a.address().map(|email| Address {
            email: email.to_string(),
            name: a.name().map(str::to_string).filter(|n| !n.is_empty()),
        })
    };
    match addr {
        mail_parser::Address::List(list) => list.iter().filter_map(convert).collect(),
        mail_parser::Address::Group(groups) => groups
            .iter()
            .flat_map(|g| g.addresses.iter().filter_map(convert))
            .collect(),
    }
}

fn message_date(message: &ParsedMessage<'_>) -> DateTime<Utc> {
    message
        .date()
        .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0))
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Whether a parsed file satisfies the listing filters.
fn matches_query(message: &ParsedMessage<'_>, query: &ListQuery) -> bool {
    if !query.date_range.contains(&message_date(message)) {
        return false;
    }
    let Some(needle) = query
        .query
        .as_deref()
        .map(str::trim)
        .filter(|q| !q.is_empty())
    else {
        return true;
    };
    let needle = needle.to_lowercase();
    let subject = message.subject().unwrap_or_default().to_lowercase();
    subject.contains(&needle)
        || addresses(message.from())
            .iter()
            .any(|a| a.display().to_lowercase().contains(&needle))
}

/// Sorted `.eml` stems in `directory`.
fn eml_stems(directory: &Path) -> std::io::Result<Vec<String>> {
    let mut stems = Vec::new();
    for entry in std::fs::read_dir(directory)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let is_eml = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e == EML_EXTENSION);
        if let (true, Some(stem)) = (is_eml, path.file_stem().and_then(|s| s.to_str())) {
            stems.push(stem.to_string());
        }
    }
    stems.sort();
    Ok(stems)
}

/// Stems passing the filters, in name order.
fn matching_stems(directory: &Path, query: &ListQuery) -> std::io::Result<Vec<String>> {
    let stems = eml_stems(directory)?;
    let filtered = query.query.as_deref().is_some_and(|q| !q.trim().is_empty())
        || query.date_range.start.is_some()
        || query.date_range.end.is_some();
    if !filtered {
        return Ok(stems);
    }

    let mut matching = Vec::new();
    for stem in stems {
        let raw = std::fs::read(directory.join(format!("{}.{}", stem, EML_EXTENSION)))?;
        match MessageParser::default().parse(&raw) {
            Some(message) if matches_query(&message, query) => matching.push(stem),
            Some(_) => {}
            None => tracing::warn!(file = %stem, "Skipping unparseable message during filtered listing"),
        }
    }
    Ok(matching)
}

#[async_trait]
impl MailProvider for LocalProvider {
    fn name(&self) -> &str {
        LOCAL_PROVIDER
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            labels: false,
            threading: false,
            search: false,
        }
    }

    fn account(&self) -> Option<String> {
        self.account.clone()
    }

    fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    async fn authenticate(&mut self, _credentials: &Credentials) -> Result<()> {
        let is_dir = tokio::fs::metadata(&self.directory)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if !is_dir {
            self.authenticated = false;
            return Err(ProviderError::Authentication(format!(
                "mail directory not found: {}",
                self.directory.display()
            )));
        }
        self.authenticated = true;
        tracing::info!(directory = %self.directory.display(), "Local mail directory opened");
        Ok(())
    }

    async fn test_connection(&self) -> bool {
        self.authenticated
            && tokio::fs::metadata(&self.directory)
                .await
                .map(|m| m.is_dir())
                .unwrap_or(false)
    }

    async fn list_messages(&self, query: &ListQuery) -> Result<MessagePage> {
        self.require_auth()?;

        let offset = match &query.page_token {
            Some(token) => token.parse::<usize>().map_err(|_| {
                ProviderError::InvalidRequest(format!("invalid page token: {}", token))
            })?,
            None => 0,
        };

        let directory = self.directory.clone();
        let owned_query = query.clone();
        let stems = tokio::task::spawn_blocking(move || matching_stems(&directory, &owned_query))
            .await
            .map_err(|e| ProviderError::Internal(format!("listing task failed: {}", e)))?
            .map_err(|e| ProviderError::Provider(format!("read directory: {}", e)))?;

        let total = stems.len();
        let page_size = query.max_results.max(1) as usize;
        let end = offset.saturating_add(page_size).min(total);
        let refs = stems
            .get(offset..end)
            .unwrap_or_default()
            .iter()
            .map(|stem| MessageRef {
                id: ProviderMessageId::from(stem.as_str()),
                thread_id: None,
            })
            .collect();

        Ok(MessagePage {
            refs,
            next_page_token: (end < total).then(|| end.to_string()),
            total_estimate: Some(total as u64),
        })
    }

    async fn get_message(&self, id: &ProviderMessageId) -> Result<NormalizedMessage> {
        self.require_auth()?;
        let raw = self.read_message_file(id).await?;
        let message = MessageParser::default()
            .parse(&raw)
            .ok_or_else(|| ProviderError::Provider(format!("unparseable message: {}", id)))?;
        Ok(self.normalize(id, &message))
    }

    async fn get_attachment(
        &self,
        message_id: &ProviderMessageId,
        attachment_id: &str,
    ) -> Result<Vec<u8>> {
        self.require_auth()?;
        let index = attachment_id.parse::<usize>().map_err(|_| {
            ProviderError::InvalidRequest(format!("invalid attachment id: {}", attachment_id))
        })?;
        let raw = self.read_message_file(message_id).await?;
        let message = MessageParser::default()
            .parse(&raw)
            .ok_or_else(|| ProviderError::Provider(format!("unparseable message: {}", message_id)))?;
        message
            .attachments()
            .nth(index)
            .map(|part| part.contents().to_vec())
            .ok_or_else(|| ProviderError::NotFound(format!("{}/{}", message_id, attachment_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::DateRange;
    use chrono::TimeZone;
    use tempfile::TempDir;

    const PLAIN: &str = "From: Alice Smith <alice@example.com>\r\n\
To: bob@example.com, carol@example.com\r\n\
Subject: Lunch plans\r\n\
Date: Wed, 15 Jan 2025 12:00:00 +0000\r\n\
\r\n\
Tacos on Friday?\r\n";

    const WITH_ATTACHMENT: &str = "From: billing@vendor.test\r\n\
To: bob@example.com\r\n\
Subject: Invoice\r\n\
Date: Mon, 03 Mar 2025 09:30:00 +0000\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/mixed; boundary=\"b1\"\r\n\
\r\n\
--b1\r\n\
Content-Type: text/html; charset=utf-8\r\n\
\r\n\
<p>Please find the <b>invoice</b> attached.</p>\r\n\
--b1\r\n\
Content-Type: application/pdf\r\n\
Content-Disposition: attachment; filename=\"invoice.pdf\"\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
JVBERi0xLjQK\r\n\
--b1--\r\n";

    fn archive(files: &[(&str, &str)]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for (name, contents) in files {
            std::fs::write(dir.path().join(name), contents).unwrap();
        }
        dir
    }

    async fn provider(dir: &TempDir) -> LocalProvider {
        let mut provider = LocalProvider::new(dir.path(), Some("archive".to_string()));
        provider.authenticate(&Credentials::None).await.unwrap();
        provider
    }

    #[tokio::test]
    async fn authenticate_requires_directory() {
        let mut provider = LocalProvider::new("/nonexistent/mailvault-test", None);
        let result = provider.authenticate(&Credentials::None).await;
        assert!(matches!(result, Err(ProviderError::Authentication(_))));
        assert!(!provider.test_connection().await);
        assert!(provider.quota_info().is_none());
    }

    #[tokio::test]
    async fn lists_in_name_order_with_offset_tokens() {
        let dir = archive(&[
            ("c.eml", PLAIN),
            ("a.eml", PLAIN),
            ("b.eml", PLAIN),
            ("notes.txt", "ignored"),
        ]);
        let provider = provider(&dir).await;

        let first = provider
            .list_messages(&ListQuery {
                max_results: 2,
                ..Default::default()
            })
            .await
            .unwrap();
        let ids: Vec<_> = first.refs.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(first.next_page_token.as_deref(), Some("2"));
        assert_eq!(first.total_estimate, Some(3));

        let second = provider
            .list_messages(&ListQuery {
                max_results: 2,
                page_token: first.next_page_token.clone(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(second.refs.len(), 1);
        assert_eq!(second.refs[0].id.as_str(), "c");
        assert!(second.next_page_token.is_none());
    }

    #[tokio::test]
    async fn listing_filters_by_query_and_date() {
        let dir = archive(&[("lunch.eml", PLAIN), ("invoice.eml", WITH_ATTACHMENT)]);
        let provider = provider(&dir).await;

        let by_sender = provider
            .list_messages(&ListQuery {
                query: Some("VENDOR".to_string()),
                max_results: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_sender.refs.len(), 1);
        assert_eq!(by_sender.refs[0].id.as_str(), "invoice");

        let since_feb = provider
            .list_messages(&ListQuery {
                max_results: 10,
                date_range: DateRange::since(Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(since_feb.refs.len(), 1);
        assert_eq!(since_feb.refs[0].id.as_str(), "invoice");
    }

    #[tokio::test]
    async fn get_message_normalizes_plain_text() {
        let dir = archive(&[("lunch.eml", PLAIN)]);
        let provider = provider(&dir).await;

        let msg = provider
            .get_message(&ProviderMessageId::from("lunch"))
            .await
            .unwrap();
        assert_eq!(msg.subject, "Lunch plans");
        assert_eq!(msg.from.email, "alice@example.com");
        assert_eq!(msg.from.name.as_deref(), Some("Alice Smith"));
        assert_eq!(msg.to.len(), 2);
        assert_eq!(msg.date, Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).unwrap());
        assert!(msg.body.plain.as_deref().unwrap().contains("Tacos on Friday?"));
        assert!(msg.attachments.is_empty());
        assert_eq!(msg.provenance.provider, "local");
        assert_eq!(msg.provenance.account.as_deref(), Some("archive"));
    }

    #[tokio::test]
    async fn attachments_are_listed_and_downloadable() {
        let dir = archive(&[("invoice.eml", WITH_ATTACHMENT)]);
        let provider = provider(&dir).await;
        let id = ProviderMessageId::from("invoice");

        let msg = provider.get_message(&id).await.unwrap();
        assert_eq!(msg.attachments.len(), 1);
        assert_eq!(msg.attachments[0].filename, "invoice.pdf");
        assert_eq!(msg.attachments[0].declared_mime.as_deref(), Some("application/pdf"));
        assert!(msg
            .body
            .markdown
            .as_deref()
            .unwrap()
            .contains("**invoice**"));

        let data = provider.get_attachment(&id, "0").await.unwrap();
        assert!(data.starts_with(b"%PDF-1.4"));

        let missing = provider.get_attachment(&id, "3").await;
        assert!(matches!(missing, Err(ProviderError::NotFound(_))));
    }

    #[tokio::test]
    async fn rejects_ids_outside_directory() {
        let dir = archive(&[("lunch.eml", PLAIN)]);
        let provider = provider(&dir).await;

        let escaped = provider
            .get_message(&ProviderMessageId::from("../lunch"))
            .await;
        assert!(matches!(escaped, Err(ProviderError::InvalidRequest(_))));

        let missing = provider.get_message(&ProviderMessageId::from("gone")).await;
        assert!(matches!(missing, Err(ProviderError::NotFound(_))));
    }
}
