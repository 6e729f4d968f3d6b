//! HTTP boundary: admission middleware and the server.

mod middleware;
mod server;

pub use middleware::{
    enforce, Admission, AdmissionGuard, Rejection, X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING,
};
pub use server::HttpServer;
