//! Inbound MIME parsing
//!
//! Thin wrapper over mail-parser that reduces an accepted DATA payload to
//! what the inbox and forwarding pipeline need: a decoded subject, the
//! text body, and the attachment parts.

use mail_parser::{MessageParser, MimeHeaders};

/// Parsed inbound email
#[derive(Debug, Clone, Default)]
pub struct ParsedEmail {
    pub subject: String,
    pub body: String,
    pub attachments: Vec<ParsedAttachment>,
}

/// Decoded attachment part
#[derive(Debug, Clone)]
pub struct ParsedAttachment {
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

/// Parse a raw RFC 5322 message. RFC 2047 subjects, transfer encodings
/// (base64, quoted-printable), legacy charsets (GBK, ISO-8859-1,
/// Windows-1252, …), and nested multiparts are handled by the parser;
/// a message that cannot be parsed at all degrades to an empty result
/// rather than failing the SMTP session.
pub fn parse_message(raw: &[u8]) -> ParsedEmail {
    let message = match MessageParser::default().parse(raw) {
        Some(message) => message,
        None => return ParsedEmail::default(),
    };

    let subject = message.subject().unwrap_or_default().to_string();

    // Concatenate every text part, matching how a human reads the mail.
    let mut body = String::new();
    for i in 0..message.text_body.len() {
        if let Some(text) = message.body_text(i) {
            body.push_str(&text);
        }
    }

    let attachments = message
        .attachments()
        .map(|part| {
            let filename = part
                .attachment_name()
                .unwrap_or("attachment")
                .to_string();
            let content_type = part
                .content_type()
                .map(|ct| match ct.subtype() {
                    Some(subtype) => format!("{}/{}", ct.ctype(), subtype),
                    None => ct.ctype().to_string(),
                })
                .unwrap_or_else(|| "application/octet-stream".to_string());
            ParsedAttachment {
                filename,
                content_type,
                data: part.contents().to_vec(),
            }
        })
        .collect();

    ParsedEmail {
        subject,
        body,
        attachments,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_part() {
        let raw = b"From: a@x.test\r\nTo: b@y.test\r\nSubject: Plain\r\nContent-Type: text/plain\r\n\r\nBody text here\r\n";
        let parsed = parse_message(raw);
        assert_eq!(parsed.subject, "Plain");
        assert!(parsed.body.contains("Body text here"));
        assert!(parsed.attachments.is_empty());
    }

    #[test]
    fn decodes_rfc2047_subject() {
        let raw = b"From: a@x.test\r\nSubject: =?UTF-8?B?SGVsbG8gV29ybGQ=?=\r\n\r\nhi\r\n";
        let parsed = parse_message(raw);
        assert_eq!(parsed.subject, "Hello World");
    }

    #[test]
    fn extracts_multipart_attachment() {
        let raw = concat!(
            "From: a@x.test\r\n",
            "To: support@mail.x.test\r\n",
            "Subject: With attachment\r\n",
            "MIME-Version: 1.0\r\n",
            "Content-Type: multipart/mixed; boundary=\"xyz\"\r\n",
            "\r\n",
            "--xyz\r\n",
            "Content-Type: text/plain\r\n",
            "\r\n",
            "See attached.\r\n",
            "--xyz\r\n",
            "Content-Type: application/pdf; name=\"doc.pdf\"\r\n",
            "Content-Disposition: attachment; filename=\"doc.pdf\"\r\n",
            "Content-Transfer-Encoding: base64\r\n",
            "\r\n",
            "JVBERi0xLjQ=\r\n",
            "--xyz--\r\n",
        )
        .as_bytes();

        let parsed = parse_message(raw);
        assert_eq!(parsed.subject, "With attachment");
        assert!(parsed.body.contains("See attached."));
        assert_eq!(parsed.attachments.len(), 1);
        assert_eq!(parsed.attachments[0].filename, "doc.pdf");
        assert_eq!(parsed.attachments[0].content_type, "application/pdf");
        assert_eq!(parsed.attachments[0].data, b"%PDF-1.4");
    }

    #[test]
    fn quoted_printable_body_is_decoded() {
        let raw = concat!(
            "From: a@x.test\r\n",
            "Subject: QP\r\n",
            "Content-Type: text/plain; charset=utf-8\r\n",
            "Content-Transfer-Encoding: quoted-printable\r\n",
            "\r\n",
            "Caf=C3=A9\r\n",
        )
        .as_bytes();

        let parsed = parse_message(raw);
        assert!(parsed.body.contains("Café"));
    }

    #[test]
    fn garbage_degrades_to_empty() {
        let parsed = parse_message(b"");
        assert!(parsed.subject.is_empty());
        assert!(parsed.body.is_empty());
    }
}
