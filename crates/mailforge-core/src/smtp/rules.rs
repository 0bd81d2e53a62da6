//! Forward rule resolution
//!
//! Maps an inbound recipient address to a forwarding rule. Precedence is
//! exact > prefix > all; within one match type the earliest-created
//! (lowest id) rule wins, because rules are scanned in insertion order.

use mailforge_common::types::EmailAddress;
use mailforge_storage::{Database, Domain, DomainRepository, ForwardRule, ForwardRuleRepository};

/// Resolve the forwarding rule for an inbound address. Returns None when
/// the domain is not registered or no enabled rule matches.
pub async fn resolve_forward_rule(
    db: &Database,
    email: &str,
) -> Result<Option<(ForwardRule, Domain)>, sqlx::Error> {
    let (local_part, domain_name) = match EmailAddress::parse(email) {
        Some(addr) => (addr.local.to_lowercase(), addr.domain.to_lowercase()),
        None => return Ok(None),
    };

    let domains = DomainRepository::new(db.pool().clone());
    let domain = match domains.find_by_name(&domain_name).await? {
        Some(domain) => domain,
        None => return Ok(None),
    };

    let rules = ForwardRuleRepository::new(db.pool().clone());
    let rules = rules.enabled_for_domain(domain.id).await?;

    for rule in &rules {
        if rule.match_type == "exact" && rule.match_addr.to_lowercase() == local_part {
            return Ok(Some((rule.clone(), domain)));
        }
    }
    for rule in &rules {
        if rule.match_type == "prefix" && local_part.starts_with(&rule.match_addr.to_lowercase()) {
            return Ok(Some((rule.clone(), domain)));
        }
    }
    for rule in &rules {
        if rule.match_type == "all" {
            return Ok(Some((rule.clone(), domain)));
        }
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailforge_storage::repository::forward::ForwardRuleInput;

    async fn setup() -> Database {
        let db = Database::connect_memory().await.unwrap();
        db.init().await.unwrap();
        DomainRepository::new(db.pool().clone())
            .create("mail.x.test", "default", "key", "pub", "")
            .await
            .unwrap();
        db
    }

    fn rule(domain_id: i64, match_type: &str, match_addr: &str, forward_to: &str) -> ForwardRuleInput {
        ForwardRuleInput {
            domain_id,
            match_type: match_type.to_string(),
            match_addr: match_addr.to_string(),
            forward_to: forward_to.to_string(),
            enabled: true,
            remark: String::new(),
        }
    }

    #[tokio::test]
    async fn precedence_exact_over_prefix_over_all() {
        let db = setup().await;
        let repo = ForwardRuleRepository::new(db.pool().clone());
        repo.create(&rule(1, "all", "", "all@y.test")).await.unwrap();
        repo.create(&rule(1, "prefix", "sup", "prefix@y.test")).await.unwrap();
        repo.create(&rule(1, "exact", "support", "exact@y.test")).await.unwrap();

        let (hit, _) = resolve_forward_rule(&db, "support@mail.x.test")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.forward_to, "exact@y.test");

        let (hit, _) = resolve_forward_rule(&db, "supreme@mail.x.test")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.forward_to, "prefix@y.test");

        let (hit, _) = resolve_forward_rule(&db, "anything@mail.x.test")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.forward_to, "all@y.test");
    }

    #[tokio::test]
    async fn earliest_rule_wins_within_a_type() {
        let db = setup().await;
        let repo = ForwardRuleRepository::new(db.pool().clone());
        repo.create(&rule(1, "prefix", "sup", "first@y.test")).await.unwrap();
        repo.create(&rule(1, "prefix", "support", "second@y.test")).await.unwrap();

        let (hit, _) = resolve_forward_rule(&db, "support@mail.x.test")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.forward_to, "first@y.test");
    }

    #[tokio::test]
    async fn unknown_domain_and_disabled_rules_miss() {
        let db = setup().await;
        let repo = ForwardRuleRepository::new(db.pool().clone());
        let mut input = rule(1, "all", "", "all@y.test");
        input.enabled = false;
        repo.create(&input).await.unwrap();

        assert!(resolve_forward_rule(&db, "a@mail.x.test").await.unwrap().is_none());
        assert!(resolve_forward_rule(&db, "a@elsewhere.test").await.unwrap().is_none());
        assert!(resolve_forward_rule(&db, "bogus").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn domain_match_is_case_insensitive() {
        let db = setup().await;
        let repo = ForwardRuleRepository::new(db.pool().clone());
        repo.create(&rule(1, "exact", "Support", "x@y.test")).await.unwrap();

        assert!(resolve_forward_rule(&db, "SUPPORT@MAIL.X.TEST")
            .await
            .unwrap()
            .is_some());
    }
}
