use std::net::{IpAddr, Ipv4Addr};
use std::sync::Once;

use archiver_core::{
    plan_transition, Archive, ArchiveContent, ArchiveState, ContentUpdate, Failure,
    FailureReason, MetadataBag, RetryKind, Stage, StageMetrics, TransitionError, Trigger,
};
use chrono::{TimeZone, Utc};
use pretty_assertions::assert_eq;

fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(archiver_logging::initialize_for_tests);
}

fn sample_content() -> ArchiveContent {
    let mut metadata = MetadataBag::new();
    metadata.insert_namespaced("og", "title", "An article");
    ArchiveContent {
        content_html: "<div><p>Body</p></div>".to_string(),
        content_text: "Body".to_string(),
        title: Some("An article".to_string()),
        description: None,
        image_url: None,
        final_url: "https://example.com/article".to_string(),
        metadata,
        fetched_at: Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap(),
    }
}

fn step(archive: &mut Archive, trigger: Trigger) -> Result<(), TransitionError> {
    let plan = plan_transition(archive.state, trigger)?;
    plan.apply(archive, Utc::now());
    Ok(())
}

#[test]
fn happy_path_goes_through_processing() {
    init_logging();
    let mut archive = Archive::new_pending("link-1", "https://example.com/article", Utc::now());
    assert!(!archive.has_content());

    step(&mut archive, Trigger::Start { attempt: 1 }).unwrap();
    assert_eq!(archive.state, ArchiveState::Processing);
    assert!(!archive.has_content());

    step(
        &mut archive,
        Trigger::Complete {
            content: Box::new(sample_content()),
            metrics: StageMetrics {
                attempt: 1,
                byte_count: Some(512),
                ..StageMetrics::default()
            },
        },
    )
    .unwrap();
    assert_eq!(archive.state, ArchiveState::Completed);
    assert_eq!(archive.title.as_deref(), Some("An article"));
    assert_eq!(archive.content_text.as_deref(), Some("Body"));
    assert_eq!(archive.error_message, None);
    assert!(archive.fetched_at.is_some());
}

#[test]
fn pending_cannot_complete_directly() {
    init_logging();
    let archive = Archive::new_pending("link-1", "https://example.com", Utc::now());
    let err = plan_transition(
        archive.state,
        Trigger::Complete {
            content: Box::new(sample_content()),
            metrics: StageMetrics::default(),
        },
    )
    .unwrap_err();
    assert_eq!(
        err,
        TransitionError::NotAllowed {
            from: ArchiveState::Pending,
            to: ArchiveState::Completed,
        }
    );
}

#[test]
fn failure_metadata_records_stage_reason_and_status() {
    init_logging();
    let failure = Failure::new(FailureReason::HttpStatus, "404 Not Found").with_http_status(404);
    let plan = plan_transition(
        ArchiveState::Processing,
        Trigger::Fail {
            failure,
            metrics: StageMetrics {
                attempt: 1,
                duration_ms: Some(30),
                resolved_ip: Some(IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34))),
                ..StageMetrics::default()
            },
        },
    )
    .unwrap();

    assert_eq!(plan.to, ArchiveState::Failed);
    assert_eq!(plan.content, ContentUpdate::Clear);
    assert_eq!(plan.metadata.stage, Some(Stage::Fetch));
    assert_eq!(plan.metadata.reason, Some(FailureReason::HttpStatus));
    assert_eq!(plan.metadata.http_status, Some(404));
    assert_eq!(plan.metadata.resolved_ip.as_deref(), Some("93.184.216.34"));
    assert_eq!(plan.metadata.duration_ms, Some(30));
    assert_eq!(
        plan.error_message.as_deref(),
        Some("fetch failed (http_status): 404 Not Found")
    );
}

#[test]
fn failure_resolved_ip_overrides_metrics() {
    init_logging();
    let blocked = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 50));
    let failure = Failure::new(FailureReason::PrivateIpBlocked, "blocked").with_resolved_ip(blocked);
    let plan = plan_transition(
        ArchiveState::Processing,
        Trigger::Fail {
            failure,
            metrics: StageMetrics {
                attempt: 1,
                resolved_ip: Some(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1))),
                ..StageMetrics::default()
            },
        },
    )
    .unwrap();
    assert_eq!(plan.metadata.resolved_ip.as_deref(), Some("192.168.1.50"));
    assert_eq!(plan.metadata.stage, Some(Stage::Validation));
}

#[test]
fn failure_records_the_stage_it_was_raised_at() {
    init_logging();
    let blocked = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7));
    let failure = Failure::new(FailureReason::PrivateIpBlocked, "redirect target blocked")
        .at_stage(Stage::Fetch)
        .with_resolved_ip(blocked);
    let plan = plan_transition(
        ArchiveState::Processing,
        Trigger::Fail {
            failure,
            metrics: StageMetrics {
                attempt: 1,
                ..StageMetrics::default()
            },
        },
    )
    .unwrap();
    assert_eq!(plan.metadata.stage, Some(Stage::Fetch));
    assert_eq!(plan.metadata.reason, Some(FailureReason::PrivateIpBlocked));
    assert_eq!(
        plan.error_message.as_deref(),
        Some("fetch failed (private_ip_blocked): redirect target blocked")
    );
}

#[test]
fn retry_reenters_processing_and_clears_error() {
    init_logging();
    let mut archive = Archive::new_pending("link-1", "https://example.com", Utc::now());
    step(&mut archive, Trigger::Start { attempt: 1 }).unwrap();
    step(
        &mut archive,
        Trigger::Fail {
            failure: Failure::new(FailureReason::Timeout, "read timed out"),
            metrics: StageMetrics {
                attempt: 1,
                ..StageMetrics::default()
            },
        },
    )
    .unwrap();
    assert_eq!(archive.state, ArchiveState::Failed);
    assert!(archive.error_message.is_some());

    let plan = plan_transition(
        archive.state,
        Trigger::Retry {
            attempt: 2,
            kind: RetryKind::Automatic,
        },
    )
    .unwrap();
    assert_eq!(plan.metadata.trigger.as_deref(), Some("retry"));
    assert_eq!(plan.metadata.attempt, Some(2));
    plan.apply(&mut archive, Utc::now());
    assert_eq!(archive.state, ArchiveState::Processing);
    assert_eq!(archive.error_message, None);
}

#[test]
fn completed_archives_cannot_be_retried() {
    init_logging();
    let err = plan_transition(
        ArchiveState::Completed,
        Trigger::Retry {
            attempt: 2,
            kind: RetryKind::Manual,
        },
    )
    .unwrap_err();
    assert!(matches!(err, TransitionError::NotAllowed { .. }));
}

#[test]
fn start_is_only_valid_from_pending() {
    init_logging();
    for state in [
        ArchiveState::Processing,
        ArchiveState::Completed,
        ArchiveState::Failed,
    ] {
        assert!(plan_transition(state, Trigger::Start { attempt: 1 }).is_err());
    }
}
