//! Header and body extraction over `mailparse`.

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use mailparse::{MailHeaderMap, ParsedMail};

/// Lightweight per-message metadata, parsed from a
/// `BODY.PEEK[HEADER.FIELDS (...)]` response or from a full message.
#[derive(Clone, Debug, Default)]
pub struct HeaderInfo {
    pub message_id: Option<String>,
    pub date: Option<DateTime<Utc>>,
    pub from_addr: String,
    pub to_addr: String,
    pub cc_addr: String,
    pub subject: String,
    pub in_reply_to: Option<String>,
    pub references: Option<String>,
}

impl HeaderInfo {
    pub fn parse(header_bytes: &[u8]) -> Result<Self> {
        let (headers, _) =
            mailparse::parse_headers(header_bytes).context("parsing message headers")?;

        let date = headers
            .get_first_value("Date")
            .and_then(|raw| parse_rfc2822_date(&raw));

        Ok(Self {
            message_id: non_empty(headers.get_first_value("Message-ID")),
            date,
            from_addr: headers.get_first_value("From").unwrap_or_default(),
            to_addr: headers.get_first_value("To").unwrap_or_default(),
            cc_addr: headers.get_first_value("Cc").unwrap_or_default(),
            subject: headers.get_first_value("Subject").unwrap_or_default(),
            in_reply_to: non_empty(headers.get_first_value("In-Reply-To")),
            references: non_empty(
                headers
                    .get_first_value("References")
                    .map(|r| r.split_whitespace().collect::<Vec<_>>().join(" ")),
            ),
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Parse an RFC 2822 `Date:` value into UTC. Unparseable dates are treated
/// as absent.
pub fn parse_rfc2822_date(raw: &str) -> Option<DateTime<Utc>> {
    let secs = mailparse::dateparse(raw).ok()?;
    Utc.timestamp_opt(secs, 0).single()
}

/// Extract the plain-text body for FTS indexing.
///
/// Prefers the first `text/plain` MIME part; a single-part message that is
/// not `text/html` contributes its whole decoded body. Anything unreadable
/// yields an empty string rather than an error.
pub fn extract_body_text(raw: &[u8]) -> String {
    let Ok(parsed) = mailparse::parse_mail(raw) else {
        return String::new();
    };

    if parsed.subparts.is_empty() {
        if parsed.ctype.mimetype.eq_ignore_ascii_case("text/html") {
            return String::new();
        }
        return parsed.get_body().unwrap_or_default();
    }

    first_text_plain(&parsed).unwrap_or_default()
}

fn first_text_plain(part: &ParsedMail) -> Option<String> {
    if part.ctype.mimetype.eq_ignore_ascii_case("text/plain") {
        return part.get_body().ok();
    }
    part.subparts.iter().find_map(first_text_plain)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_info_extracts_threading_fields() {
        let raw = concat!(
            "Message-ID: <a@example.com>\r\n",
            "Date: Mon, 10 Mar 2024 14:30:00 +0000\r\n",
            "From: alice@example.com\r\n",
            "To: bob@example.com\r\n",
            "Subject: hello\r\n",
            "In-Reply-To: <root@example.com>\r\n",
            "References: <root@example.com>   <mid@example.com>\r\n",
            "\r\n",
        );

        let info = HeaderInfo::parse(raw.as_bytes()).unwrap();
        assert_eq!(info.message_id.as_deref(), Some("<a@example.com>"));
        assert_eq!(info.in_reply_to.as_deref(), Some("<root@example.com>"));
        assert_eq!(
            info.references.as_deref(),
            Some("<root@example.com> <mid@example.com>")
        );
        assert!(info.date.is_some());
    }

    #[test]
    fn body_text_prefers_text_plain_part() {
        let raw = concat!(
            "Subject: t\r\n",
            "Content-Type: multipart/alternative; boundary=\"b\"\r\n",
            "\r\n",
            "--b\r\n",
            "Content-Type: text/html\r\n",
            "\r\n",
            "<p>nope</p>\r\n",
            "--b\r\n",
            "Content-Type: text/plain\r\n",
            "\r\n",
            "plain body\r\n",
            "--b--\r\n",
        );

        assert_eq!(extract_body_text(raw.as_bytes()).trim(), "plain body");
    }

    #[test]
    fn body_text_skips_single_part_html() {
        let raw = concat!(
            "Subject: t\r\n",
            "Content-Type: text/html\r\n",
            "\r\n",
            "<p>nope</p>\r\n",
        );
        assert_eq!(extract_body_text(raw.as_bytes()), "");
    }
}
