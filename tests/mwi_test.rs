//! MWI fan-out through the PBX facade

mod common;

use common::{build_pbx, FakeSignaling};
use pbx_core::config::PbxConfig;
use pbx_core::interface::api::MwiStatusDto;
use std::sync::Arc;

const AOR: &str = "sip:1001@pbx.local";

#[tokio::test]
async fn test_one_failing_subscriber_does_not_stop_fanout() {
    let signaling = Arc::new(FakeSignaling::new().failing_contact("sip:1001@10.0.0.2:5060"));
    let pbx = build_pbx(PbxConfig::default(), signaling.clone()).await;
    let mwi = pbx.mwi().unwrap();

    mwi.subscribe(AOR, "sip:1001@10.0.0.1:5060", 3600).await.unwrap();
    mwi.subscribe(AOR, "sip:1001@10.0.0.2:5060", 3600).await.unwrap();
    mwi.subscribe(AOR, "sip:1001@10.0.0.3:5060", 3600).await.unwrap();
    signaling.notifies.lock().clear();

    let report = mwi.update_state(AOR, 2, 5).await;
    assert_eq!(report.attempted, 3);
    assert_eq!(report.delivered, 2);
    assert_eq!(report.failed, 1);

    let notifies = signaling.notifies.lock().clone();
    assert_eq!(notifies.len(), 2);
    for (_, body) in &notifies {
        assert!(body.contains("Messages-Waiting: yes"));
        assert!(body.contains("Voice-Message: 2/5 (0/0)"));
    }
}

#[tokio::test]
async fn test_update_state_is_idempotent() {
    let signaling = Arc::new(FakeSignaling::new());
    let pbx = build_pbx(PbxConfig::default(), signaling.clone()).await;
    let mwi = pbx.mwi().unwrap();

    let first = mwi.subscribe(AOR, "sip:1001@10.0.0.1:5060", 600).await.unwrap();
    let again = mwi.subscribe(AOR, "sip:1001@10.0.0.1:5060", 900).await.unwrap();
    assert_eq!(first, again);

    mwi.update_state(AOR, 1, 0).await;
    mwi.update_state(AOR, 1, 0).await;
    let state = mwi.get_state(AOR).unwrap();
    assert_eq!((state.new_messages, state.old_messages), (1, 0));

    let report = mwi.notify_all_subscribers(AOR).await;
    assert_eq!(report.attempted, 1);

    let status = MwiStatusDto::from_manager(pbx.mwi().map(|m| m.as_ref()));
    assert!(status.enabled);
    assert_eq!(status.mailboxes.len(), 1);
    assert!(status.mailboxes[0].messages_waiting);
    assert_eq!(status.subscriptions.len(), 1);
}

#[tokio::test]
async fn test_no_subscribers_reports_zero() {
    let pbx = build_pbx(PbxConfig::default(), Arc::new(FakeSignaling::new())).await;
    let report = pbx.mwi().unwrap().notify_all_subscribers(AOR).await;
    assert_eq!(report.attempted, 0);
}
