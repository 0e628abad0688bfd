//! ZRTP, SRTP and hold-audio behavior through the PBX facade

mod common;

use common::{active_call, build_pbx, FakeSignaling};
use pbx_core::config::{PbxConfig, ZrtpConfig};
use pbx_core::domain::audio::wav::{encode_pcm, WavErrorCode};
use pbx_core::infrastructure::media::zrtp::SecurityWarningKind;
use pbx_core::infrastructure::media::{
    CryptoAttribute, SrtpProfile, ZrtpManager, ZrtpSessionInfo, ZrtpState,
};
use pbx_core::interface::api::SecurityStatus;
use pbx_core::DomainError;
use std::sync::Arc;

/// Drive both ends of a DH exchange up to SAS comparison
fn key_agreement(
    local: &ZrtpManager,
    remote: &ZrtpManager,
    call_id: &str,
) -> (ZrtpSessionInfo, ZrtpSessionInfo) {
    local.start(call_id, remote.local_zid()).unwrap();
    remote.start(call_id, local.local_zid()).unwrap();
    local.hello_acknowledged(call_id).unwrap();
    remote.hello_acknowledged(call_id).unwrap();

    let local_pk = local.local_public_key(call_id).unwrap();
    let remote_pk = remote.local_public_key(call_id).unwrap();
    let local_rs1 = local.local_rs1_id(call_id).unwrap();
    let remote_rs1 = remote.local_rs1_id(call_id).unwrap();

    let ours = local
        .complete_key_agreement(call_id, &remote_pk, remote_rs1)
        .unwrap();
    let theirs = remote
        .complete_key_agreement(call_id, &local_pk, local_rs1)
        .unwrap();
    (ours, theirs)
}

fn silence(sample_rate: u32, secs: u32) -> Vec<u8> {
    encode_pcm(sample_rate, 1, 16, &vec![0u8; (sample_rate * secs * 2) as usize])
}

#[tokio::test]
async fn test_zrtp_sas_then_cached_call() {
    let pbx = build_pbx(PbxConfig::default(), Arc::new(FakeSignaling::new())).await;
    let zrtp = pbx.zrtp().unwrap();
    let phone = ZrtpManager::new(ZrtpConfig::default()).unwrap();

    let (ours, theirs) = key_agreement(zrtp, &phone, "z1");
    assert_eq!(ours.state, ZrtpState::Negotiating);
    assert!(ours.sas.is_some());
    assert_eq!(ours.sas, theirs.sas);

    // no SRTP keys until the users confirm
    assert!(zrtp.srtp_keys("z1").is_none());
    let secured = zrtp.verify_sas("z1", true).unwrap();
    phone.verify_sas("z1", true).unwrap();
    assert_eq!(secured.state, ZrtpState::Secured);
    assert!(secured.sas_verified);
    assert!(!secured.is_cached);
    assert!(zrtp.srtp_keys("z1").is_some());

    let (ours, theirs) = key_agreement(zrtp, &phone, "z2");
    assert_eq!(ours.state, ZrtpState::Secured);
    assert!(ours.is_cached);
    assert!(theirs.is_cached);
}

#[tokio::test]
async fn test_sas_mismatch_fails_and_warns() {
    let pbx = build_pbx(PbxConfig::default(), Arc::new(FakeSignaling::new())).await;
    let zrtp = pbx.zrtp().unwrap();
    let phone = ZrtpManager::new(ZrtpConfig::default()).unwrap();
    let mut warnings = zrtp.subscribe_warnings();

    key_agreement(zrtp, &phone, "z1");
    let failed = zrtp.verify_sas("z1", false).unwrap();
    assert_eq!(failed.state, ZrtpState::Failed);
    assert_eq!(failed.failure_reason.as_deref(), Some("SAS mismatch"));

    let warning = warnings.try_recv().unwrap();
    assert_eq!(warning.call_id, "z1");
    assert_eq!(warning.kind, SecurityWarningKind::SasMismatch);

    // the disputed secret is never reused
    assert!(zrtp.cache().get(&phone.local_zid()).is_none());
    let err = zrtp.verify_sas("z1", true).unwrap_err();
    assert!(matches!(err, DomainError::InvalidStateTransition { .. }));
}

#[tokio::test]
async fn test_hangup_destroys_zrtp_session() {
    let pbx = build_pbx(PbxConfig::default(), Arc::new(FakeSignaling::new())).await;
    let zrtp = pbx.zrtp().unwrap();
    let phone = ZrtpManager::new(ZrtpConfig::default()).unwrap();

    active_call(&pbx, "z1", "15551110000");
    key_agreement(zrtp, &phone, "z1");
    assert_eq!(zrtp.state_counts().negotiating, 1);

    pbx.hangup("z1", "caller_hangup").unwrap();
    assert!(zrtp.get("z1").is_none());
    assert!(zrtp.list().is_empty());
}

#[tokio::test]
async fn test_srtp_negotiation_follows_policy() {
    let mut config = PbxConfig::default();
    let pbx = build_pbx(config.clone(), Arc::new(FakeSignaling::new())).await;
    let srtp = pbx.srtp().unwrap();

    let sdp = srtp
        .offer()
        .iter()
        .map(|(attribute, _)| attribute.to_string())
        .collect::<Vec<_>>()
        .join("\r\n");
    let offers = CryptoAttribute::from_sdp(&sdp);
    assert_eq!(offers.len(), 4);

    let selection = srtp.negotiate(&offers).unwrap().unwrap();
    assert_eq!(selection.profile, SrtpProfile::AeadAes256Gcm);
    assert_eq!(selection.answer.tag, offers[0].tag);

    // plain RTP is tolerated until SRTP becomes mandatory
    assert!(srtp.negotiate(&[]).unwrap().is_none());
    config.srtp.require_srtp = true;
    pbx.reload(&config).unwrap();
    assert!(srtp.negotiate(&[]).is_err());
}

#[tokio::test]
async fn test_hold_audio_validation() {
    let pbx = build_pbx(PbxConfig::default(), Arc::new(FakeSignaling::new())).await;
    let moh = pbx.moh().unwrap();
    assert!(moh.asset().is_none());

    let info = moh.load_bytes("welcome.wav", &silence(8000, 2)).unwrap();
    assert_eq!(info.sample_rate, 8000);
    assert_eq!(moh.asset().unwrap().source, "welcome.wav");

    let err = moh.load_bytes("cd.wav", &silence(44100, 2)).unwrap_err();
    assert_eq!(err.code, WavErrorCode::InvalidSampleRate);
    let err = moh.load_bytes("blip.wav", &silence(8000, 0)).unwrap_err();
    assert_eq!(err.code, WavErrorCode::FileTooShort);
    let err = moh.load_bytes("notes.txt", b"hello").unwrap_err();
    assert_eq!(err.code, WavErrorCode::InvalidFormat);

    // rejected uploads leave the previous asset in place
    assert_eq!(moh.asset().unwrap().source, "welcome.wav");
}

#[tokio::test]
async fn test_security_status_reflects_features() {
    let pbx = build_pbx(PbxConfig::default(), Arc::new(FakeSignaling::new())).await;
    let phone = ZrtpManager::new(ZrtpConfig::default()).unwrap();
    key_agreement(pbx.zrtp().unwrap(), &phone, "z1");

    let status = SecurityStatus::collect(&pbx);
    assert!(!status.tls.enabled);
    assert!(status.tls.certificate.is_none());
    assert!(status.srtp.enabled);
    assert_eq!(status.srtp.profiles[0], "AEAD_AES_256_GCM");
    assert!(status.zrtp.enabled);
    assert_eq!(status.zrtp.sessions.len(), 1);
    assert_eq!(status.zrtp.summary.unwrap().sessions.negotiating, 1);

    let mut config = PbxConfig::default();
    config.zrtp.enabled = false;
    config.srtp.enabled = false;
    let pbx = build_pbx(config, Arc::new(FakeSignaling::new())).await;
    let status = SecurityStatus::collect(&pbx);
    assert!(!status.zrtp.enabled);
    assert!(!status.srtp.enabled);
    assert!(status.srtp.profiles.is_empty());
}
