use std::time::Duration;

use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};

/// Builds the retrying HTTP client shared by every `Venue` call. Exponential
/// backoff with jitter, base 0.5s / cap 60s, three attempts total —
/// `reqwest-retry` only retries what it considers a transient failure
/// (connect errors, 5xx, 429), which lines up with the runtime's own
/// `Retryable`/`RateLimited` retry policy.
pub fn build_http_client(headers: reqwest::header::HeaderMap) -> ClientWithMiddleware {
    let retry_policy = ExponentialBackoff::builder()
        .retry_bounds(Duration::from_millis(500), Duration::from_secs(60))
        .build_with_max_retries(3);

    let inner = reqwest::Client::builder()
        .default_headers(headers)
        .build()
        .expect("failed to build reqwest client");

    ClientBuilder::new(inner)
        .with(RetryTransientMiddleware::new_with_policy(retry_policy))
        .build()
}
