//! Rule-based spam tagging
//!
//! Inbound mail is never rejected for spam; matches only add a tag so
//! the inbox can surface them.

use regex::Regex;

/// Keywords matched case-insensitively against subject and body.
const SPAM_KEYWORDS: &[&str] = &[
    "viagra",
    "cialis",
    "lottery",
    "winner",
    "congratulations",
    "nigerian prince",
    "inheritance",
    "million dollars",
    "click here",
    "act now",
    "limited time",
    "free money",
    "make money fast",
    "work from home",
    "earn cash",
    "no obligation",
    "risk free",
    "weight loss",
    "diet pills",
];

/// Links beyond this count mark the message.
const MAX_LINKS: usize = 10;

/// Result of the spam heuristic
#[derive(Debug, Clone, Default)]
pub struct SpamVerdict {
    pub flagged: bool,
    pub reason: String,
}

/// Keyword match, too-many-links, and shouting-subject heuristics.
pub fn detect_spam(subject: &str, body: &str) -> SpamVerdict {
    let lower_subject = subject.to_lowercase();
    let lower_body = body.to_lowercase();

    for keyword in SPAM_KEYWORDS {
        if lower_subject.contains(keyword) {
            return SpamVerdict {
                flagged: true,
                reason: format!("subject contains spam keyword: {}", keyword),
            };
        }
        if lower_body.contains(keyword) {
            return SpamVerdict {
                flagged: true,
                reason: format!("body contains spam keyword: {}", keyword),
            };
        }
    }

    let link_re = Regex::new(r"https?://").expect("static regex");
    let link_count = link_re.find_iter(&lower_body).count();
    if link_count > MAX_LINKS {
        return SpamVerdict {
            flagged: true,
            reason: format!("too many links: {}", link_count),
        };
    }

    if subject.len() > 10
        && subject == subject.to_uppercase()
        && subject.chars().any(|c| c.is_alphabetic())
    {
        return SpamVerdict {
            flagged: true,
            reason: "subject is all uppercase".to_string(),
        };
    }

    SpamVerdict::default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_mail_passes() {
        let verdict = detect_spam("Meeting notes", "See you at three.");
        assert!(!verdict.flagged);
    }

    #[test]
    fn keyword_flags() {
        let verdict = detect_spam("You are a WINNER", "claim your prize");
        assert!(verdict.flagged);
        assert!(verdict.reason.contains("winner"));
    }

    #[test]
    fn link_flood_flags() {
        let body = "http://a.test ".repeat(11);
        let verdict = detect_spam("hi", &body);
        assert!(verdict.flagged);
        assert!(verdict.reason.contains("too many links"));
    }

    #[test]
    fn shouting_subject_flags() {
        let verdict = detect_spam("BUY EVERYTHING TODAY", "calm body");
        assert!(verdict.flagged);
        assert_eq!(verdict.reason, "subject is all uppercase");
    }

    #[test]
    fn short_caps_subject_passes() {
        assert!(!detect_spam("HI ALL", "ok").flagged);
    }
}
