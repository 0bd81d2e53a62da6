//! RFC 5322 message construction

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::Utc;
use uuid::Uuid;

/// An attachment with its content already resolved to bytes.
#[derive(Debug, Clone)]
pub struct ResolvedAttachment {
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

/// Build the raw message: headers, HTML body, and attachments in a
/// multipart/mixed container. The result is what gets DKIM-signed and
/// written to the wire verbatim.
pub fn build_message(
    from: &str,
    to: &str,
    subject: &str,
    html_body: &str,
    attachments: &[ResolvedAttachment],
) -> Vec<u8> {
    let mut message = String::new();

    let domain = mailforge_common::types::extract_domain(from);
    let message_id = format!(
        "<{}.{}@{}>",
        Uuid::new_v4().simple(),
        Utc::now().timestamp_millis(),
        if domain.is_empty() { "localhost" } else { domain }
    );

    message.push_str(&format!("Message-ID: {}\r\n", message_id));
    message.push_str(&format!(
        "Date: {}\r\n",
        Utc::now().format("%a, %d %b %Y %H:%M:%S +0000")
    ));
    message.push_str(&format!("From: {}\r\n", sanitize_header_value(from)));
    message.push_str(&format!("To: {}\r\n", sanitize_header_value(to)));
    message.push_str(&format!("Subject: {}\r\n", encode_header_if_needed(subject)));
    message.push_str("MIME-Version: 1.0\r\n");

    if attachments.is_empty() {
        message.push_str("Content-Type: text/html; charset=utf-8\r\n\r\n");
        message.push_str(html_body);
        message.push_str("\r\n");
        return message.into_bytes();
    }

    let boundary = format!("----=_Part_{}", Uuid::new_v4().simple());
    message.push_str(&format!(
        "Content-Type: multipart/mixed; boundary=\"{}\"\r\n\r\n",
        boundary
    ));

    message.push_str(&format!("--{}\r\n", boundary));
    message.push_str("Content-Type: text/html; charset=utf-8\r\n\r\n");
    message.push_str(html_body);
    message.push_str("\r\n");

    for attachment in attachments {
        let content_type = if attachment.content_type.is_empty() {
            "application/octet-stream"
        } else {
            &attachment.content_type
        };
        let filename = sanitize_header_value(&attachment.filename).replace('"', "");

        message.push_str(&format!("--{}\r\n", boundary));
        message.push_str(&format!(
            "Content-Type: {}; name=\"{}\"\r\n",
            sanitize_header_value(content_type),
            filename
        ));
        message.push_str("Content-Transfer-Encoding: base64\r\n");
        message.push_str(&format!(
            "Content-Disposition: attachment; filename=\"{}\"\r\n\r\n",
            filename
        ));

        // 76-char lines per RFC 2045.
        let encoded = BASE64.encode(&attachment.data);
        for chunk in encoded.as_bytes().chunks(76) {
            message.push_str(std::str::from_utf8(chunk).unwrap_or_default());
            message.push_str("\r\n");
        }
    }

    message.push_str(&format!("--{}--\r\n", boundary));
    message.into_bytes()
}

/// Strip CR/LF so caller-supplied values cannot inject headers.
pub fn sanitize_header_value(value: &str) -> String {
    value.chars().filter(|c| *c != '\r' && *c != '\n').collect()
}

/// RFC 2047 encode a header value when it contains non-ASCII characters.
pub fn encode_header_if_needed(value: &str) -> String {
    if value.is_ascii() {
        return sanitize_header_value(value);
    }
    let encoded = BASE64.encode(sanitize_header_value(value).as_bytes());
    format!("=?UTF-8?B?{}?=", encoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_message_headers() {
        let raw = build_message("a@x.test", "b@y.test", "Hi", "<p>x</p>", &[]);
        let text = String::from_utf8(raw).unwrap();
        assert!(text.contains("From: a@x.test\r\n"));
        assert!(text.contains("To: b@y.test\r\n"));
        assert!(text.contains("Subject: Hi\r\n"));
        assert!(text.contains("Message-ID: <"));
        assert!(text.contains("Content-Type: text/html; charset=utf-8\r\n\r\n<p>x</p>"));
    }

    #[test]
    fn attachment_gets_base64_part() {
        let attachment = ResolvedAttachment {
            filename: "doc.pdf".to_string(),
            content_type: "application/pdf".to_string(),
            data: b"%PDF-1.4".to_vec(),
        };
        let raw = build_message("a@x.test", "b@y.test", "Hi", "<p>x</p>", &[attachment]);
        let text = String::from_utf8(raw).unwrap();
        assert!(text.contains("Content-Type: multipart/mixed; boundary="));
        assert!(text.contains("Content-Disposition: attachment; filename=\"doc.pdf\""));
        assert!(text.contains(&BASE64.encode(b"%PDF-1.4")));
    }

    #[test]
    fn empty_content_type_defaults_to_octet_stream() {
        let attachment = ResolvedAttachment {
            filename: "blob".to_string(),
            content_type: String::new(),
            data: vec![1, 2, 3],
        };
        let raw = build_message("a@x.test", "b@y.test", "Hi", "", &[attachment]);
        let text = String::from_utf8(raw).unwrap();
        assert!(text.contains("Content-Type: application/octet-stream; name=\"blob\""));
    }

    #[test]
    fn header_injection_is_stripped() {
        let raw = build_message("a@x.test", "b@y.test\r\nBcc: evil@z.test", "Hi", "", &[]);
        let text = String::from_utf8(raw).unwrap();
        assert!(text.contains("To: b@y.testBcc: evil@z.test\r\n"));
        assert!(!text.contains("\r\nBcc:"));
    }

    #[test]
    fn non_ascii_subject_is_rfc2047_encoded() {
        let raw = build_message("a@x.test", "b@y.test", "Héllo", "", &[]);
        let text = String::from_utf8(raw).unwrap();
        assert!(text.contains("Subject: =?UTF-8?B?"));
    }
}
