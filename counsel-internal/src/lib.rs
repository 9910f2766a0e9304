pub mod auth; // bearer token verification
pub mod cache; // answer cache keyed by question fingerprint
pub mod confidence; // heuristic answer confidence
pub mod config_parser; // counsel.toml config file
pub mod endpoints; // API endpoints
pub mod error; // error handling
pub mod gateway_util; // utilities for gateway
pub mod inference; // upstream model calls
pub mod moderation; // input blocking and output redaction
pub mod observability; // utilities for observability (logs, metrics, etc.)
pub mod pipeline; // the ordered question-answering stages
pub mod plan; // plan tiers and their limits
pub mod prompt; // system prompts
pub mod rate_limit; // rate limiting
pub mod redis_client; // redis client
pub mod retry;
mod testing;
pub mod usage_limit; // daily question quotas
pub mod usage_log; // per-request usage records
pub mod validation; // question validation and sanitizing
