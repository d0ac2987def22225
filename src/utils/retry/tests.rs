use super::*;
use backon::BackoffBuilder;

#[test]
fn test_default_config() {
    let config = RetryConfig::default();
    assert_eq!(config.base_delay, Duration::from_millis(500));
    assert_eq!(config.max_delay, Duration::from_secs(5));
    assert_eq!(config.max_attempts, 3);
    assert!(config.jitter);
}

#[test]
fn test_exponential_backoff() {
    let delays: Vec<Duration> = RetryConfig::for_finders()
        .without_jitter()
        .backoff()
        .build()
        .collect();

    assert_eq!(
        delays,
        vec![Duration::from_millis(500), Duration::from_millis(1000)]
    );
}

#[test]
fn test_delay_capped_at_max() {
    let config = RetryConfig {
        base_delay: Duration::from_millis(400),
        max_delay: Duration::from_millis(500),
        max_attempts: 4,
        jitter: false,
    };

    let delays: Vec<Duration> = config.backoff().build().collect();
    assert_eq!(delays.len(), 3);
    assert!(delays.iter().all(|d| *d <= Duration::from_millis(500)));
}

#[test]
fn test_single_attempt_never_retries() {
    let config = RetryConfig {
        max_attempts: 1,
        ..RetryConfig::for_finders().without_jitter()
    };
    assert_eq!(config.max_retries(), 0);
    assert_eq!(config.backoff().build().count(), 0);
}

#[test]
fn test_from_finder_settings() {
    let settings = FinderSettings {
        timeout_secs: 30,
        retry_attempts: 5,
        retry_base_ms: 50,
    };
    let config = RetryConfig::from(&settings);
    assert_eq!(config.base_delay, Duration::from_millis(50));
    assert_eq!(config.max_attempts, 5);

    let zero = FinderSettings {
        retry_attempts: 0,
        ..settings
    };
    assert_eq!(RetryConfig::from(&zero).max_attempts, 1);
}

#[test]
fn test_default_policy_allows_two_retries() {
    assert_eq!(RetryConfig::default().backoff().build().count(), 2);
}
