//! Session lifecycle: expiry, device binding, extension and teardown

use chrono::Duration;
use std::sync::Arc;
use typesync_client::session::RejectionReason;
use typesync_client::store::keys;
use typesync_client::{
    BrowserProfile, ClientError, EnvironmentSignals, InMemoryBackend, SessionConfig,
    SessionConfigUpdate, SessionEvent, SessionManager, TabEnvironment,
};
use typesync_core::{ManualClock, Principal, SessionSettings};

fn principal() -> Principal {
    Principal {
        uid: "uid_ada".to_string(),
        email: "ada@example.com".to_string(),
        display_name: Some("Ada".to_string()),
    }
}

fn other_device() -> EnvironmentSignals {
    EnvironmentSignals {
        screen_width: 1280,
        screen_height: 800,
        timezone: "Europe/Berlin".to_string(),
        ..EnvironmentSignals::default()
    }
}

fn manager(tab: &TabEnvironment, backend: &Arc<InMemoryBackend>, clock: &ManualClock) -> SessionManager {
    SessionManager::new(
        tab,
        backend.clone(),
        Arc::new(clock.clone()),
        &SessionSettings::default(),
    )
}

struct Fixture {
    profile: BrowserProfile,
    backend: Arc<InMemoryBackend>,
    clock: ManualClock,
}

impl Fixture {
    fn new() -> Self {
        let clock = ManualClock::default();
        Self {
            profile: BrowserProfile::in_memory(),
            backend: InMemoryBackend::new(Arc::new(clock.clone())),
            clock,
        }
    }

    fn manager(&self, signals: EnvironmentSignals) -> SessionManager {
        let tab = self.profile.open_tab(signals);
        manager(&tab, &self.backend, &self.clock)
    }
}

#[tokio::test]
async fn test_session_invalid_after_expiry() {
    let fixture = Fixture::new();
    let sessions = fixture.manager(EnvironmentSignals::default());

    let record = sessions
        .create_session(&principal(), SessionConfig::default())
        .await
        .unwrap();
    assert_eq!(record.expires_at - record.login_time, Duration::days(7));
    assert!(sessions.validate_existing_session().await);

    fixture.clock.advance(Duration::days(7) + Duration::seconds(1));
    assert!(!sessions.validate_existing_session().await);
    assert!(sessions.current_session().is_none());
}

#[tokio::test]
async fn test_expired_session_emits_rejection() {
    let fixture = Fixture::new();
    let sessions = fixture.manager(EnvironmentSignals::default());
    sessions
        .create_session(&principal(), SessionConfig::default())
        .await
        .unwrap();

    let mut events = sessions.subscribe();
    fixture.clock.advance(Duration::days(8));
    assert!(!sessions.validate_existing_session().await);

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(seen.contains(&SessionEvent::Rejected(RejectionReason::Expired)));
}

#[tokio::test]
async fn test_foreign_fingerprint_rejected_on_untrusted_device() {
    let fixture = Fixture::new();
    let here = fixture.manager(EnvironmentSignals::default());
    here.create_session(&principal(), SessionConfig::default())
        .await
        .unwrap();

    let elsewhere = fixture.manager(other_device());
    assert_ne!(here.fingerprint(), elsewhere.fingerprint());
    assert!(!elsewhere.is_device_trusted());

    // Unexpired, but bound to another device
    assert!(!elsewhere.validate_existing_session().await);
    assert!(elsewhere.current_session().is_none());
}

#[tokio::test]
async fn test_foreign_fingerprint_accepted_on_trusted_device() {
    let fixture = Fixture::new();
    let here = fixture.manager(EnvironmentSignals::default());
    here.create_session(&principal(), SessionConfig::default())
        .await
        .unwrap();

    let elsewhere = fixture.manager(other_device());
    elsewhere
        .add_trusted_device(Some("Laptop".to_string()))
        .unwrap();

    assert!(elsewhere.validate_existing_session().await);
}

#[tokio::test]
async fn test_extend_then_validate_succeeds() {
    let fixture = Fixture::new();
    let sessions = fixture.manager(EnvironmentSignals::default());
    let config = SessionConfig {
        session_duration_days: 1,
        ..SessionConfig::default()
    };
    let created = sessions.create_session(&principal(), config).await.unwrap();

    fixture.clock.advance(Duration::hours(23));
    let extended = sessions.extend_session().await.unwrap();
    assert!(extended.expires_at > created.expires_at);

    // Past the original expiry, within the extended one
    fixture.clock.advance(Duration::hours(23));
    assert!(sessions.validate_existing_session().await);
}

#[tokio::test]
async fn test_expired_session_cannot_be_extended() {
    let fixture = Fixture::new();
    let sessions = fixture.manager(EnvironmentSignals::default());
    sessions
        .create_session(&principal(), SessionConfig::default())
        .await
        .unwrap();
    let mut events = sessions.subscribe();

    fixture.clock.advance(Duration::days(30));
    let result = sessions.extend_session().await;

    assert!(matches!(result, Err(ClientError::Session { .. })));
    assert!(sessions.current_session().is_none());
    assert!(!sessions.validate_existing_session().await);

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(seen.contains(&SessionEvent::Rejected(RejectionReason::Expired)));
    assert!(!seen
        .iter()
        .any(|event| matches!(event, SessionEvent::Extended { .. })));
}

#[tokio::test]
async fn test_duration_change_does_not_revive_expired_session() {
    let fixture = Fixture::new();
    let sessions = fixture.manager(EnvironmentSignals::default());
    sessions
        .create_session(&principal(), SessionConfig::default())
        .await
        .unwrap();

    fixture.clock.advance(Duration::days(30));
    let update = SessionConfigUpdate {
        session_duration_days: Some(14),
        ..SessionConfigUpdate::default()
    };
    assert!(matches!(
        sessions.update_session_config(update).await,
        Err(ClientError::Session { .. })
    ));

    assert!(sessions.current_session().is_none());
    assert!(!sessions.validate_existing_session().await);
}

#[tokio::test]
async fn test_untrusted_device_cannot_extend_foreign_session() {
    let fixture = Fixture::new();
    let here = fixture.manager(EnvironmentSignals::default());
    let created = here
        .create_session(&principal(), SessionConfig::default())
        .await
        .unwrap();

    let elsewhere = fixture.manager(other_device());
    assert!(matches!(
        elsewhere.extend_session().await,
        Err(ClientError::Session { .. })
    ));
    // The foreign record was dropped, not pushed out
    assert!(here.current_session().is_none());
    assert!(created.expires_at > fixture.clock_now());
}

#[tokio::test(start_paused = true)]
async fn test_open_session_reports_expiry() {
    let fixture = Fixture::new();
    let sessions = fixture.manager(EnvironmentSignals::default());
    let record = sessions
        .create_session(&principal(), SessionConfig::default())
        .await
        .unwrap();
    let mut events = sessions.subscribe();

    // Wall clock jumps past the expiry while the tab stays open
    fixture.clock.advance(Duration::days(8));
    tokio::time::sleep(std::time::Duration::from_secs(61)).await;

    assert_eq!(
        events.try_recv().unwrap(),
        SessionEvent::Expired {
            expires_at: record.expires_at
        }
    );
    assert!(!sessions.is_expiry_warning_scheduled());
}

#[tokio::test]
async fn test_extend_without_session_fails() {
    let fixture = Fixture::new();
    let sessions = fixture.manager(EnvironmentSignals::default());
    assert!(sessions.extend_session().await.is_err());
}

#[tokio::test]
async fn test_duration_change_recomputes_expiry() {
    let fixture = Fixture::new();
    let sessions = fixture.manager(EnvironmentSignals::default());
    sessions
        .create_session(&principal(), SessionConfig::default())
        .await
        .unwrap();

    fixture.clock.advance(Duration::days(2));
    let config = sessions
        .update_session_config(SessionConfigUpdate {
            session_duration_days: Some(30),
            ..SessionConfigUpdate::default()
        })
        .await
        .unwrap();
    assert_eq!(config.session_duration_days, 30);

    let record = sessions.current_session().unwrap();
    assert_eq!(record.expires_at, fixture.clock_now() + Duration::days(30));

    // Other fields alone leave the expiry where it is
    sessions
        .update_session_config(SessionConfigUpdate {
            auto_login: Some(true),
            ..SessionConfigUpdate::default()
        })
        .await
        .unwrap();
    assert_eq!(sessions.current_session().unwrap().expires_at, record.expires_at);
    assert!(sessions.session_config().auto_login);
}

#[tokio::test]
async fn test_non_positive_duration_rejected() {
    let fixture = Fixture::new();
    let sessions = fixture.manager(EnvironmentSignals::default());

    let config = SessionConfig {
        session_duration_days: 0,
        ..SessionConfig::default()
    };
    assert!(sessions.create_session(&principal(), config).await.is_err());

    let update = SessionConfigUpdate {
        session_duration_days: Some(-1),
        ..SessionConfigUpdate::default()
    };
    assert!(sessions.update_session_config(update).await.is_err());
}

#[tokio::test]
async fn test_trusted_sign_in_registers_device() {
    let fixture = Fixture::new();
    let sessions = fixture.manager(EnvironmentSignals::default());

    sessions
        .create_session(&principal(), SessionConfig::for_sign_in(true, 30))
        .await
        .unwrap();

    assert!(sessions.is_device_trusted());
    let devices = sessions.trusted_devices();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].user_agent_signature, "Chrome on Windows");
    assert_eq!(&devices[0].fingerprint, sessions.fingerprint());
}

#[tokio::test]
async fn test_clear_session_survives_remote_failure() {
    let fixture = Fixture::new();
    let sessions = fixture.manager(EnvironmentSignals::default());
    sessions
        .create_session(&principal(), SessionConfig::for_sign_in(true, 30))
        .await
        .unwrap();
    assert!(sessions.is_expiry_warning_scheduled());

    fixture.backend.set_offline(true);
    sessions.clear_session().await;

    assert!(sessions.current_session().is_none());
    assert!(!sessions.is_expiry_warning_scheduled());
    assert!(sessions.time_remaining().is_none());
    // Device trust outlives the session
    assert!(sessions.is_device_trusted());
}

#[tokio::test]
async fn test_revoked_device_no_longer_trusted() {
    let fixture = Fixture::new();
    let sessions = fixture.manager(EnvironmentSignals::default());
    sessions.add_trusted_device(None).unwrap();

    let fingerprint = sessions.fingerprint().clone();
    assert!(sessions.remove_trusted_device(&fingerprint).unwrap());
    assert!(!sessions.is_device_trusted());
    assert!(!sessions.remove_trusted_device(&fingerprint).unwrap());
}

#[tokio::test]
async fn test_corrupt_record_reads_as_no_session() {
    let fixture = Fixture::new();
    let tab = fixture.profile.open_tab(EnvironmentSignals::default());
    let sessions = manager(&tab, &fixture.backend, &fixture.clock);
    let mut events = sessions.subscribe();

    tab.durable_store()
        .set_raw(keys::SESSION, "{\"v\":1,\"payload\":\"???\"}")
        .unwrap();

    assert!(!sessions.validate_existing_session().await);
    assert_eq!(tab.durable_store().get_raw(keys::SESSION).unwrap(), None);
    assert_eq!(
        events.try_recv().unwrap(),
        SessionEvent::Rejected(RejectionReason::Corrupt)
    );
}

#[tokio::test]
async fn test_activity_does_not_move_expiry() {
    let fixture = Fixture::new();
    let sessions = fixture.manager(EnvironmentSignals::default());
    let created = sessions
        .create_session(&principal(), SessionConfig::default())
        .await
        .unwrap();

    fixture.clock.advance(Duration::minutes(5));
    sessions.touch_activity().unwrap();

    let record = sessions.current_session().unwrap();
    assert_eq!(record.expires_at, created.expires_at);
    assert_eq!(record.last_activity, created.login_time + Duration::minutes(5));
}

impl Fixture {
    fn clock_now(&self) -> chrono::DateTime<chrono::Utc> {
        use typesync_core::Clock;
        self.clock.now()
    }
}
