//! IMAP connector (LOGIN over TLS) using async-imap with tokio-rustls.

use std::sync::Arc;

use async_imap::types::{Fetch, Name};
use async_imap::{Client, Session};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use rustls_native_certs::load_native_certs;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerName};
use tokio_rustls::TlsConnector;
use tokio_util::compat::TokioAsyncReadCompatExt;
use tracing::{debug, warn};

use crate::parsing::HeaderInfo;
use crate::types::{Account, AccountKind};

pub type ImapSession =
    Session<tokio_util::compat::Compat<tokio_rustls::client::TlsStream<TcpStream>>>;

pub const GMAIL_IMAP_HOST: &str = "imap.gmail.com";
pub const ZOHO_IMAP_HOST: &str = "imap.zoho.com";

const HEADER_FIELDS_FETCH: &str =
    "(UID BODY.PEEK[HEADER.FIELDS (MESSAGE-ID DATE FROM TO CC SUBJECT IN-REPLY-TO REFERENCES)])";

/// All IMAP failures collapse to one kind; `transient` marks the
/// socket/timeout/server-busy classes that the engines count per-message
/// instead of aborting on.
#[derive(Error, Debug)]
#[error("{message}")]
pub struct ImapError {
    message: String,
    transient: bool,
}

impl ImapError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.transient
    }
}

impl From<async_imap::error::Error> for ImapError {
    fn from(err: async_imap::error::Error) -> Self {
        use async_imap::error::Error as E;
        match &err {
            E::Io(_) | E::ConnectionLost => Self::transient(err.to_string()),
            // NO responses are typically throttling or a busy server.
            E::No(_) => Self::transient(err.to_string()),
            _ => Self::fatal(err.to_string()),
        }
    }
}

impl From<std::io::Error> for ImapError {
    fn from(err: std::io::Error) -> Self {
        Self::transient(err.to_string())
    }
}

#[derive(Clone, Debug)]
pub struct FolderEntry {
    pub flags: String,
    pub delimiter: String,
    pub name: String,
    pub count: Option<u32>,
}

pub struct ImapClient {
    host: String,
    port: u16,
    session: Option<ImapSession>,
}

impl ImapClient {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            session: None,
        }
    }

    /// Resolve the connection profile for an account: gmail and zoho have
    /// well-known hosts, generic accounts must configure one.
    pub fn for_account(account: &Account) -> Result<Self, ImapError> {
        if let Some(host) = &account.host {
            return Ok(Self::new(host.clone(), account.port));
        }
        match account.kind {
            AccountKind::Gmail => Ok(Self::new(GMAIL_IMAP_HOST, account.port)),
            AccountKind::Zoho => Ok(Self::new(ZOHO_IMAP_HOST, account.port)),
            AccountKind::Generic => Err(ImapError::fatal(format!(
                "account '{}' has type generic but no host configured",
                account.name
            ))),
        }
    }

    pub async fn connect(&mut self, user: &str, password: &str) -> Result<(), ImapError> {
        let mut root_store = RootCertStore::empty();
        for cert in load_native_certs()
            .map_err(|e| ImapError::fatal(format!("failed to load native certs: {e}")))?
        {
            root_store
                .add(&tokio_rustls::rustls::Certificate(cert.0))
                .map_err(|e| ImapError::fatal(format!("failed to add cert to root store: {e}")))?;
        }

        let config = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        let connector = TlsConnector::from(Arc::new(config));

        let tcp = TcpStream::connect((self.host.as_str(), self.port)).await?;

        let server_name = ServerName::try_from(self.host.as_str())
            .map_err(|_| ImapError::fatal(format!("invalid DNS name {}", self.host)))?;
        let tls_stream = connector.connect(server_name, tcp).await?;

        let mut client = Client::new(tls_stream.compat());

        let greeting = client.read_response().await.map_err(ImapError::from)?;
        if greeting.is_none() {
            return Err(ImapError::transient(
                "unexpected end of stream, expected greeting",
            ));
        }

        // Auth failures are fatal regardless of how the server phrases them.
        let session = client
            .login(user, password)
            .await
            .map_err(|(err, _client)| ImapError::fatal(format!("LOGIN failed: {err}")))?;

        debug!(host = %self.host, port = self.port, "IMAP session established");
        self.session = Some(session);
        Ok(())
    }

    pub async fn disconnect(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.logout().await {
                warn!(error = %e, "IMAP logout failed");
            }
        }
    }

    fn session(&mut self) -> Result<&mut ImapSession, ImapError> {
        self.session
            .as_mut()
            .ok_or_else(|| ImapError::fatal("not connected"))
    }

    /// SELECT (or EXAMINE when readonly) a folder; returns
    /// `(message_count, uidvalidity)`.
    pub async fn select(&mut self, folder: &str, readonly: bool) -> Result<(u32, u32), ImapError> {
        let session = self.session()?;
        let mailbox = if readonly {
            session.examine(folder).await?
        } else {
            session.select(folder).await?
        };
        Ok((mailbox.exists, mailbox.uid_validity.unwrap_or(0)))
    }

    /// `UID SEARCH <criteria>`, returned in ascending UID order.
    pub async fn uid_search(&mut self, criteria: &str) -> Result<Vec<u32>, ImapError> {
        let session = self.session()?;
        let uid_set = session.uid_search(criteria).await?;
        let mut uids: Vec<u32> = uid_set.into_iter().collect();
        uids.sort_unstable();
        Ok(uids)
    }

    /// Fetch threading-relevant headers for one UID without marking it seen.
    pub async fn fetch_headers(&mut self, uid: u32) -> Result<HeaderInfo, ImapError> {
        let fetch = self.fetch_one(uid, HEADER_FIELDS_FETCH).await?;
        let header_bytes = fetch
            .header()
            .or_else(|| fetch.body())
            .ok_or_else(|| ImapError::transient(format!("UID {uid}: no header data returned")))?;
        HeaderInfo::parse(header_bytes)
            .map_err(|e| ImapError::fatal(format!("UID {uid}: {e:#}")))
    }

    /// Fetch the full RFC 5322 bytes for one UID. An empty body is treated
    /// as a transient server error.
    pub async fn fetch_raw(&mut self, uid: u32) -> Result<Vec<u8>, ImapError> {
        let fetch = self.fetch_one(uid, "(UID RFC822)").await?;
        let body = fetch
            .body()
            .ok_or_else(|| ImapError::transient(format!("UID {uid}: no message body returned")))?;
        if body.is_empty() {
            return Err(ImapError::transient(format!("UID {uid}: empty message body")));
        }
        Ok(body.to_vec())
    }

    async fn fetch_one(&mut self, uid: u32, query: &str) -> Result<Fetch, ImapError> {
        let session = self.session()?;
        let stream = session.uid_fetch(uid.to_string(), query).await?;
        let fetches: Vec<Fetch> = stream.try_collect().await.map_err(ImapError::from)?;
        fetches
            .into_iter()
            .find(|f| f.uid == Some(uid) || f.uid.is_none())
            .ok_or_else(|| ImapError::transient(format!("UID {uid}: fetch returned no data")))
    }

    /// Fetch Message-IDs for a set of UIDs in chunked batch FETCHes.
    /// UIDs the server does not answer for come back as `None`.
    pub async fn fetch_message_ids(
        &mut self,
        uids: &[u32],
    ) -> Result<Vec<(u32, Option<String>)>, ImapError> {
        const BATCH_SIZE: usize = 1000;

        let mut out: Vec<(u32, Option<String>)> = Vec::with_capacity(uids.len());
        for chunk in uids.chunks(BATCH_SIZE) {
            let uid_seq = build_uid_sequence(chunk);
            let session = self.session()?;
            let stream = session
                .uid_fetch(&uid_seq, "(UID BODY.PEEK[HEADER.FIELDS (MESSAGE-ID)])")
                .await?;
            let fetches: Vec<Fetch> = stream.try_collect().await.map_err(ImapError::from)?;

            let mut seen = std::collections::HashMap::new();
            for fetch in &fetches {
                let Some(uid) = fetch.uid else { continue };
                let message_id = fetch
                    .header()
                    .or_else(|| fetch.body())
                    .and_then(|bytes| HeaderInfo::parse(bytes).ok())
                    .and_then(|info| info.message_id);
                seen.insert(uid, message_id);
            }
            for &uid in chunk {
                out.push((uid, seen.remove(&uid).flatten()));
            }
        }
        Ok(out)
    }

    /// APPEND raw message bytes, preserving the original date as the
    /// internal date when known.
    pub async fn append(
        &mut self,
        folder: &str,
        raw: &[u8],
        internal_date: Option<DateTime<Utc>>,
    ) -> Result<(), ImapError> {
        let session = self.session()?;
        let internal_date_str =
            internal_date.map(|d| d.fixed_offset().format("%d-%b-%Y %H:%M:%S %z").to_string());
        session
            .append(folder, None, internal_date_str.as_deref(), raw)
            .await?;
        Ok(())
    }

    /// LIST all folders; message counts come from a readonly SELECT and are
    /// absent for folders that refuse selection.
    pub async fn list_folders(&mut self, with_counts: bool) -> Result<Vec<FolderEntry>, ImapError> {
        let names: Vec<Name> = {
            let session = self.session()?;
            let stream = session.list(Some(""), Some("*")).await?;
            stream.try_collect().await.map_err(ImapError::from)?
        };

        let mut folders = Vec::with_capacity(names.len());
        for name in &names {
            let count = if with_counts {
                self.select(name.name(), true).await.ok().map(|(c, _)| c)
            } else {
                None
            };
            folders.push(FolderEntry {
                flags: name
                    .attributes()
                    .iter()
                    .map(|a| format!("{a:?}"))
                    .collect::<Vec<_>>()
                    .join(" "),
                delimiter: name.delimiter().unwrap_or("/").to_string(),
                name: name.name().to_string(),
                count,
            });
        }
        Ok(folders)
    }
}

fn build_uid_sequence(uids: &[u32]) -> String {
    uids.iter()
        .map(|u| u.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Sender/recipient filters expanded into an IMAP SEARCH query.
///
/// `addresses` and `domains` match To/From/Cc; the `from_*` fields only
/// match From. Terms are folded left-to-right into nested ORs.
#[derive(Clone, Debug, Default)]
pub struct FilterConfig {
    pub addresses: Vec<String>,
    pub domains: Vec<String>,
    pub from_addresses: Vec<String>,
    pub from_domains: Vec<String>,
}

impl FilterConfig {
    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
            && self.domains.is_empty()
            && self.from_addresses.is_empty()
            && self.from_domains.is_empty()
    }

    pub fn build_imap_query(&self) -> String {
        let mut terms: Vec<String> = Vec::new();

        for addr in self.addresses.iter().chain(self.domains.iter()) {
            terms.push(format!("TO \"{addr}\""));
            terms.push(format!("FROM \"{addr}\""));
            terms.push(format!("CC \"{addr}\""));
        }
        for addr in self.from_addresses.iter().chain(self.from_domains.iter()) {
            terms.push(format!("FROM \"{addr}\""));
        }

        if terms.is_empty() {
            return "ALL".to_string();
        }

        let mut result = terms[0].clone();
        for term in &terms[1..] {
            result = format!("OR {result} {term}");
        }
        format!("({result})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uid_sequence_is_comma_separated() {
        assert_eq!(build_uid_sequence(&[1, 5, 9]), "1,5,9");
        assert_eq!(build_uid_sequence(&[42]), "42");
    }

    #[test]
    fn empty_filter_is_all() {
        assert_eq!(FilterConfig::default().build_imap_query(), "ALL");
    }

    #[test]
    fn single_term_is_parenthesized() {
        let filters = FilterConfig {
            from_addresses: vec!["a@x.com".into()],
            ..Default::default()
        };
        assert_eq!(filters.build_imap_query(), "(FROM \"a@x.com\")");
    }

    #[test]
    fn terms_fold_left() {
        let filters = FilterConfig {
            from_addresses: vec!["a".into(), "b".into(), "c".into()],
            ..Default::default()
        };
        assert_eq!(
            filters.build_imap_query(),
            "(OR OR FROM \"a\" FROM \"b\" FROM \"c\")"
        );
    }

    #[test]
    fn address_expands_to_three_fields() {
        let filters = FilterConfig {
            addresses: vec!["a@x.com".into()],
            ..Default::default()
        };
        assert_eq!(
            filters.build_imap_query(),
            "(OR OR TO \"a@x.com\" FROM \"a@x.com\" CC \"a@x.com\")"
        );
    }
}
