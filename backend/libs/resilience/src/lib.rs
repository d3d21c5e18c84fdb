/// Resilience patterns for the CDC pipeline
///
/// - **Retry**: Exponential backoff with jitter, bounded attempts and a
///   consecutive-failure alert threshold for loops that must not give up
/// - **Timeout**: Time limits on broker reads and store commits
/// - **Preset Configurations**: Pre-tuned settings for store writes, broker
///   reconnects and dead-letter publishing
///
/// # Example: Store write with classified retry
///
/// ```rust,no_run
/// use resilience::{presets, retry::with_retry_if};
///
/// #[tokio::main]
/// async fn main() {
///     let config = presets::store_write_config();
///
///     let result = with_retry_if(
///         config.retry,
///         |e: &String| e.starts_with("transient"),
///         || async { Ok::<_, String>(()) },
///     )
///     .await;
/// }
/// ```
pub mod presets;
pub mod retry;
pub mod timeout;

pub use presets::{
    broker_reconnect_config, dead_letter_publish_config, store_write_config, ServiceConfig,
};
pub use retry::{with_retry, with_retry_if, Backoff, RetryConfig, RetryError};
pub use timeout::{with_timeout_result, TimeoutConfig, TimeoutError};
