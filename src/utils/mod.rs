pub mod http;

pub use http::{fetch_and_save, fetch_text, RateLimiter};
