//! API routes

use axum::{
    middleware,
    routing::{delete, get, post, put},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::auth::{auth_middleware, AppState};
use crate::handlers::{
    auth, campaigns, channels, contacts, domains, files, inbox, keys, receiver, rules, send,
    stats, templates, tracking,
};

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    // Public: login, captcha, and the tracking hooks.
    let public = Router::new()
        .route("/login", post(auth::login))
        .route("/captcha", get(auth::get_captcha))
        .route("/track/open/:id", get(tracking::open))
        .route("/track/click/:id", get(tracking::click))
        .route("/track/unsubscribe/:id", get(tracking::unsubscribe));

    let channel_routes = Router::new()
        .route("/", get(channels::list).post(channels::create))
        .route("/:id", put(channels::update).delete(channels::delete));

    let domain_routes = Router::new()
        .route("/", get(domains::list).post(domains::create))
        .route("/:id", get(domains::get).delete(domains::delete))
        .route("/:id/verify", post(domains::verify));

    let template_routes = Router::new()
        .route("/", get(templates::list).post(templates::create))
        .route("/:id", put(templates::update).delete(templates::delete));

    let group_routes = Router::new()
        .route("/", get(contacts::list_groups).post(contacts::create_group))
        .route("/:id", delete(contacts::delete_group));

    let contact_routes = Router::new()
        .route("/", get(contacts::list_contacts).post(contacts::create_contact))
        .route(
            "/:id",
            put(contacts::update_contact).delete(contacts::delete_contact),
        );

    let campaign_routes = Router::new()
        .route("/", get(campaigns::list).post(campaigns::create))
        .route(
            "/:id",
            get(campaigns::get)
                .put(campaigns::update)
                .delete(campaigns::delete),
        )
        .route("/:id/start", post(campaigns::start))
        .route("/:id/pause", post(campaigns::pause))
        .route("/:id/resume", post(campaigns::resume))
        .route("/:id/test", post(campaigns::test));

    let rule_routes = Router::new()
        .route("/", get(rules::list).post(rules::create))
        .route("/:id", put(rules::update).delete(rules::delete));

    let inbox_routes = Router::new()
        .route("/", get(inbox::list))
        .route("/:id", get(inbox::get).delete(inbox::delete))
        .route("/:id/unread", post(inbox::mark_unread));

    let file_routes = Router::new()
        .route("/", get(files::list))
        .route("/:id", delete(files::delete));

    let key_routes = Router::new()
        .route("/", get(keys::list).post(keys::create))
        .route("/:id", delete(keys::delete));

    let protected = Router::new()
        .route("/send", post(send::send_email))
        .route("/logs", get(send::list_logs))
        .route("/stats", get(stats::get_stats))
        .route("/cleanup", post(stats::run_cleanup))
        .route("/password", post(auth::change_password))
        .route(
            "/receiver-config",
            get(receiver::get).put(receiver::update),
        )
        .nest("/channels", channel_routes)
        .nest("/domains", domain_routes)
        .nest("/templates", template_routes)
        .nest("/groups", group_routes)
        .nest("/contacts", contact_routes)
        .nest("/campaigns", campaign_routes)
        .nest("/rules", rule_routes)
        .route("/forward-logs", get(rules::list_logs))
        .nest("/inbox", inbox_routes)
        .nest("/files", file_routes)
        .nest("/keys", key_routes)
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .nest("/api/v1", public.merge(protected))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
