//! SMTP ingress: listener, session FSM, rate limiting, TLS, and rule
//! resolution

pub mod rate_limit;
pub mod rules;
pub mod server;
pub mod session;
pub mod tls;

pub use rate_limit::RateLimiter;
pub use rules::resolve_forward_rule;
pub use server::SmtpIngress;
pub use session::SmtpSession;
