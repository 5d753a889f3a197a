//! Integration tests for typesync-core infrastructure

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use typesync_core::{
    config_error, init_logging, not_found_error, storage_error, validation_error, with_timeout,
    EntitlementRecord, ErrorContext, LoggingConfig, SingleFlight, SubscriptionTier, TaskGroup,
    TypesyncConfig, TypesyncError,
};

#[tokio::test]
async fn test_error_handling() {
    // Test error creation with context
    let error = storage_error!("Test storage error", "test_component");

    match &error {
        TypesyncError::Storage {
            message, context, ..
        } => {
            assert_eq!(message, "Test storage error");
            assert_eq!(context.component, "test_component");
            assert!(!context.error_id.is_empty());
        }
        _ => panic!("Expected Storage error"),
    }

    // Test error logging (should not panic)
    error.log();

    let network_error = TypesyncError::Network {
        message: "Connection failed".to_string(),
        source: None,
        context: ErrorContext::new("test"),
    };
    assert!(network_error.is_recoverable());

    let config_error = config_error!("Invalid config", "test");
    assert!(!config_error.is_recoverable());

    let validation = validation_error!("bad tier", "tier", "test");
    assert!(matches!(validation, TypesyncError::Validation { field: Some(ref f), .. } if f == "tier"));

    let missing = not_found_error!("users/abc", "test");
    assert!(missing.to_string().contains("users/abc"));
}

#[tokio::test]
async fn test_logging_initialization() {
    let config = LoggingConfig {
        level: "debug".to_string(),
        format: typesync_core::LogFormat::Compact,
        include_location: false,
        include_thread: false,
        log_to_file: false,
        log_file_path: None,
        enable_performance_monitoring: false,
        filter_directives: vec!["typesync_core=debug".to_string()],
    };

    // The global subscriber can only be installed once per process, so a
    // second call must report an error instead of panicking
    let _ = init_logging(&config);
    assert!(init_logging(&config).is_err());
}

#[tokio::test]
async fn test_logging_requires_file_path() {
    let config = LoggingConfig {
        log_to_file: true,
        log_file_path: None,
        ..LoggingConfig::default()
    };

    assert!(init_logging(&config).is_err());
}

#[tokio::test]
async fn test_single_flight_shares_one_run() {
    let flight = Arc::new(SingleFlight::<Result<u32, String>>::new());
    let runs = Arc::new(AtomicUsize::new(0));

    let mut joins = Vec::new();
    for _ in 0..5 {
        let flight = Arc::clone(&flight);
        let runs = Arc::clone(&runs);
        joins.push(tokio::spawn(async move {
            flight
                .run(|| {
                    let runs = Arc::clone(&runs);
                    async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        sleep(Duration::from_millis(50)).await;
                        Ok(7)
                    }
                })
                .await
        }));
    }

    for join in joins {
        assert_eq!(join.await.unwrap(), Ok(7));
    }
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(!flight.is_in_flight());

    // A completed run does not satisfy the next caller
    let again = flight
        .run(|| {
            let runs = Arc::clone(&runs);
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Err("boom".to_string())
            }
        })
        .await;
    assert_eq!(again, Err("boom".to_string()));
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_timeout_mechanism() {
    let quick_operation = async {
        sleep(Duration::from_millis(10)).await;
        "Success"
    };

    let result = with_timeout(quick_operation, 100, "quick_test").await;
    assert_eq!(result.unwrap(), "Success");

    let slow_operation = async {
        sleep(Duration::from_millis(200)).await;
        "Should not reach here"
    };

    match with_timeout(slow_operation, 50, "slow_test").await.unwrap_err() {
        TypesyncError::Timeout {
            operation,
            duration_ms,
            ..
        } => {
            assert_eq!(operation, "slow_test");
            assert_eq!(duration_ms, 50);
        }
        _ => panic!("Expected Timeout error"),
    }
}

#[tokio::test]
async fn test_task_group_aborts_on_drop() {
    let ticks = Arc::new(AtomicUsize::new(0));
    let group = TaskGroup::new();

    {
        let ticks = Arc::clone(&ticks);
        group.spawn(async move {
            loop {
                ticks.fetch_add(1, Ordering::SeqCst);
                sleep(Duration::from_millis(5)).await;
            }
        });
    }
    sleep(Duration::from_millis(20)).await;
    assert_eq!(group.active(), 1);

    drop(group);
    sleep(Duration::from_millis(10)).await;
    let after_drop = ticks.load(Ordering::SeqCst);
    sleep(Duration::from_millis(30)).await;
    assert_eq!(ticks.load(Ordering::SeqCst), after_drop);
}

#[tokio::test]
async fn test_config_validation() {
    let mut config = TypesyncConfig::default();
    assert!(config.validate().is_ok());

    config.session.default_duration_days = 0;
    match config.validate().unwrap_err() {
        TypesyncError::Config { message, .. } => {
            assert!(message.contains("session.default_duration_days"));
        }
        _ => panic!("Expected Config error"),
    }

    let mut config = TypesyncConfig::default();
    config.entitlement.channel_name = "  ".to_string();
    assert!(config.validate().is_err());
}

#[tokio::test]
async fn test_config_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("typesync.toml");

    let mut config = TypesyncConfig::default();
    config.entitlement.poll_interval_secs = 20;
    config.save_to_file(&path).unwrap();

    let loaded = TypesyncConfig::from_file(&path).unwrap();
    assert_eq!(loaded.entitlement.poll_interval_secs, 20);
    assert_eq!(loaded.redeem_tier(" typesync-pro "), Some(SubscriptionTier::Pro));
    assert_eq!(loaded.redeem_tier("nope"), None);
}

#[test]
fn test_free_entitlement_features() {
    let free = EntitlementRecord::free(chrono::Utc::now());
    assert_eq!(free.tier, SubscriptionTier::Free);
    assert_eq!(free.features.themes_unlocked, 2);
    assert_eq!(free.features.lessons_unlocked, 3);
    assert!(free.covers(SubscriptionTier::Free));
    assert!(!free.covers(SubscriptionTier::Premium));
    assert!(SubscriptionTier::Pro > SubscriptionTier::Premium);
}
