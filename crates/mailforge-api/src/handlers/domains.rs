//! Sending domain management: DKIM keypair generation, DNS records,
//! on-demand verification

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use mailforge_common::config::generate_dkim_keypair;
use mailforge_core::dkim::dns_txt_record;
use mailforge_storage::{Domain, DomainRepository};
use serde::{Deserialize, Serialize};
use tracing::info;
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

use crate::auth::AppState;
use crate::handlers::{db_err, err, not_found, ApiResult};

#[derive(Debug, Deserialize)]
pub struct CreateDomainRequest {
    pub name: String,
    #[serde(default = "default_selector")]
    pub dkim_selector: String,
    #[serde(default)]
    pub mail_subdomain_prefix: String,
}

fn default_selector() -> String {
    "default".to_string()
}

/// Domain plus the DNS records the admin must publish
#[derive(Debug, Serialize)]
pub struct DomainWithRecords {
    #[serde(flatten)]
    pub domain: Domain,
    pub dns_records: DnsRecords,
}

#[derive(Debug, Serialize)]
pub struct DnsRecords {
    pub dkim: String,
    pub spf: String,
    pub dmarc: String,
}

fn dns_records(domain: &Domain) -> DnsRecords {
    DnsRecords {
        dkim: dns_txt_record(&domain.dkim_public_key).unwrap_or_default(),
        spf: "v=spf1 a mx ~all".to_string(),
        dmarc: format!("v=DMARC1; p=none; rua=mailto:postmaster@{}", domain.name),
    }
}

pub async fn list(State(state): State<AppState>) -> ApiResult<Json<Vec<Domain>>> {
    let repo = DomainRepository::new(state.db.pool().clone());
    Ok(Json(repo.list().await.map_err(db_err)?))
}

pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<DomainWithRecords>> {
    let repo = DomainRepository::new(state.db.pool().clone());
    let domain = repo.get(id).await.map_err(db_err)?.ok_or_else(|| not_found("Domain"))?;
    let records = dns_records(&domain);
    Ok(Json(DomainWithRecords {
        domain,
        dns_records: records,
    }))
}

/// POST /api/v1/domains — a DKIM keypair is generated on creation.
pub async fn create(
    State(state): State<AppState>,
    Json(input): Json<CreateDomainRequest>,
) -> ApiResult<(StatusCode, Json<DomainWithRecords>)> {
    let name = input.name.trim().to_lowercase();
    if name.is_empty() || !name.contains('.') {
        return Err(err(StatusCode::BAD_REQUEST, "validation_error", "Invalid domain name"));
    }

    let (private_pem, public_pem) = generate_dkim_keypair()
        .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", e.to_string()))?;

    let repo = DomainRepository::new(state.db.pool().clone());
    let domain = repo
        .create(
            &name,
            &input.dkim_selector,
            &private_pem,
            &public_pem,
            &input.mail_subdomain_prefix,
        )
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.message().contains("UNIQUE") => {
                err(StatusCode::CONFLICT, "conflict", "Domain already exists")
            }
            other => db_err(other),
        })?;

    info!(domain = %domain.name, "Domain created with DKIM keypair");
    let records = dns_records(&domain);
    Ok((
        StatusCode::CREATED,
        Json(DomainWithRecords {
            domain,
            dns_records: records,
        }),
    ))
}

pub async fn delete(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<StatusCode> {
    let repo = DomainRepository::new(state.db.pool().clone());
    if repo.delete(id).await.map_err(db_err)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found("Domain"))
    }
}

/// POST /api/v1/domains/:id/verify — refresh the advisory verification
/// flags with live DNS lookups.
pub async fn verify(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Domain>> {
    let repo = DomainRepository::new(state.db.pool().clone());
    let domain = repo.get(id).await.map_err(db_err)?.ok_or_else(|| not_found("Domain"))?;

    let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());

    let spf = txt_contains(&resolver, &domain.name, "v=spf1").await;
    let dkim_host = format!("{}._domainkey.{}", domain.dkim_selector, domain.name);
    let dkim = txt_contains(&resolver, &dkim_host, "v=DKIM1").await;
    let dmarc_host = format!("_dmarc.{}", domain.name);
    let dmarc = txt_contains(&resolver, &dmarc_host, "v=DMARC1").await;
    let mx = resolver
        .mx_lookup(domain.name.as_str())
        .await
        .map(|r| r.iter().next().is_some())
        .unwrap_or(false);

    repo.update_verification(id, spf, dkim, dmarc, mx)
        .await
        .map_err(db_err)?;
    info!(domain = %domain.name, spf, dkim, dmarc, mx, "Domain verification refreshed");

    repo.get(id)
        .await
        .map_err(db_err)?
        .map(Json)
        .ok_or_else(|| not_found("Domain"))
}

async fn txt_contains(resolver: &TokioAsyncResolver, host: &str, needle: &str) -> bool {
    match resolver.txt_lookup(host).await {
        Ok(lookup) => lookup.iter().any(|record| {
            record
                .txt_data()
                .iter()
                .map(|d| String::from_utf8_lossy(d))
                .collect::<String>()
                .contains(needle)
        }),
        Err(_) => false,
    }
}
