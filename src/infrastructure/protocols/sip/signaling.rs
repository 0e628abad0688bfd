//! Outbound in-dialog signaling: re-INVITE, REFER and NOTIFY
//!
//! Managers talk to the [`SignalingClient`] port and never hold a registry
//! lock while a request is in flight. [`UdpSignaling`] is the production
//! adapter: it renders requests with `rsip`, sends them over one UDP socket
//! and waits for the final response matched by Call-ID and CSeq.

use super::sdp::{self, MediaDirection, SdpSession};
use crate::config::SipConfig;
use crate::domain::call::CallSession;
use crate::domain::mwi::{MwiNotifier, MwiSubscription};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignalingError {
    #[error("no final response within {0:?}")]
    Timeout(Duration),

    #[error("peer answered {code} {reason}")]
    Rejected { code: u16, reason: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

/// Port used by the hold, transfer and MWI managers
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SignalingClient: Send + Sync {
    /// re-INVITE carrying the session's SDP rewritten to `direction`
    async fn send_reinvite(
        &self,
        session: &CallSession,
        direction: MediaDirection,
    ) -> Result<(), SignalingError>;

    /// REFER towards `target`, with a Replaces parameter for attended transfer
    async fn send_refer(
        &self,
        session: &CallSession,
        target: &str,
        replaces: Option<String>,
    ) -> Result<(), SignalingError>;

    /// message-summary NOTIFY inside a subscription dialog
    async fn send_notify(
        &self,
        subscription: &MwiSubscription,
        body: &str,
        terminated: bool,
    ) -> Result<(), SignalingError>;

    /// Drop any per-call dialog state once the call is over
    fn call_ended(&self, _call_id: &str) {}
}

/// Lets the MWI manager deliver through any signaling client
pub struct SignalingNotifier {
    client: Arc<dyn SignalingClient>,
}

impl SignalingNotifier {
    pub fn new(client: Arc<dyn SignalingClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MwiNotifier for SignalingNotifier {
    async fn notify(
        &self,
        subscription: &MwiSubscription,
        body: &str,
        terminated: bool,
    ) -> std::result::Result<(), String> {
        self.client
            .send_notify(subscription, body, terminated)
            .await
            .map_err(|e| e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TransactionKey {
    call_id: String,
    cseq: u32,
}

#[derive(Debug)]
struct FinalResponse {
    code: u16,
    reason: String,
    to_tag: Option<String>,
}

/// Tags identifying one dialog, reused by every in-dialog request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialogTags {
    pub local_tag: String,
    pub remote_tag: Option<String>,
}

impl DialogTags {
    fn fresh() -> Self {
        Self {
            local_tag: Uuid::new_v4().simple().to_string()[..8].to_string(),
            remote_tag: None,
        }
    }
}

type PendingMap = Arc<Mutex<HashMap<TransactionKey, oneshot::Sender<FinalResponse>>>>;

/// Strip the `Name:` prefix rsip puts on a rendered header
fn header_value(header: &rsip::Header, name: &str) -> String {
    let raw = header.to_string();
    let trimmed = raw.trim();
    match trimmed.split_once(':') {
        Some((prefix, value)) if prefix.trim().eq_ignore_ascii_case(name) => {
            value.trim().to_string()
        }
        _ => trimmed.to_string(),
    }
}

fn transaction_key(headers: &rsip::Headers) -> Option<TransactionKey> {
    let mut call_id = None;
    let mut cseq = None;
    for header in headers.iter() {
        match header {
            rsip::Header::CallId(_) => call_id = Some(header_value(header, "Call-ID")),
            rsip::Header::CSeq(_) => {
                cseq = header_value(header, "CSeq")
                    .split_whitespace()
                    .next()
                    .and_then(|n| n.parse::<u32>().ok());
            }
            _ => {}
        }
    }
    Some(TransactionKey {
        call_id: call_id?,
        cseq: cseq?,
    })
}

/// Resolve `sip:user@host[:port]` to a socket address
async fn resolve_uri(uri: &str) -> Result<SocketAddr, SignalingError> {
    let uri = rsip::Uri::try_from(uri.trim_matches(|c| c == '<' || c == '>'))
        .map_err(|e| SignalingError::InvalidMessage(format!("bad URI {}: {}", uri, e)))?;
    let host = uri.host_with_port.host.to_string();
    let port = uri
        .host_with_port
        .port
        .as_ref()
        .and_then(|p| p.to_string().parse::<u16>().ok())
        .unwrap_or(5060);

    let mut addrs = tokio::net::lookup_host((host.as_str(), port))
        .await
        .map_err(|e| SignalingError::Transport(format!("resolve {}: {}", host, e)))?;
    addrs
        .next()
        .ok_or_else(|| SignalingError::Transport(format!("no address for {}", host)))
}

/// `tag` parameter of a From/To value, ignoring parameters inside `<...>`
fn tag_param(value: &str) -> Option<String> {
    let params = value.rsplit_once('>').map(|(_, rest)| rest).unwrap_or(value);
    params
        .split(';')
        .skip(1)
        .find_map(|p| p.trim().strip_prefix("tag="))
        .filter(|tag| !tag.is_empty())
        .map(str::to_string)
}

/// rsip-backed UDP client
pub struct UdpSignaling {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    config: RwLock<SipConfig>,
    cseq: AtomicU32,
    pending: PendingMap,
    /// Last SDP we sent per call; hold/resume rewrite it
    local_sdp: RwLock<HashMap<String, String>>,
    /// From/To tags per call or subscription dialog
    dialogs: RwLock<HashMap<String, DialogTags>>,
}

impl UdpSignaling {
    /// Bind the socket and start the response reader
    pub async fn bind(config: SipConfig, shutdown: CancellationToken) -> Result<Arc<Self>, SignalingError> {
        let bind = format!("{}:{}", config.bind_address, config.bind_port);
        let socket = UdpSocket::bind(&bind)
            .await
            .map_err(|e| SignalingError::Transport(format!("bind {}: {}", bind, e)))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| SignalingError::Transport(e.to_string()))?;
        info!("SIP signaling bound to {}", local_addr);

        let client = Arc::new(Self {
            socket: Arc::new(socket),
            local_addr,
            config: RwLock::new(config),
            cseq: AtomicU32::new(1),
            pending: Arc::new(Mutex::new(HashMap::new())),
            local_sdp: RwLock::new(HashMap::new()),
            dialogs: RwLock::new(HashMap::new()),
        });

        tokio::spawn(Self::receive_loop(
            client.socket.clone(),
            client.pending.clone(),
            shutdown,
        ));
        Ok(client)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn reload(&self, config: SipConfig) {
        *self.config.write() = config;
    }

    /// Remember the SDP negotiated for a call
    pub fn set_local_sdp(&self, call_id: &str, sdp: &str) {
        self.local_sdp
            .write()
            .insert(call_id.to_string(), sdp.to_string());
    }

    /// Adopt the tags of the dialog that established a call
    pub fn set_dialog_tags(&self, call_id: &str, local_tag: &str, remote_tag: Option<&str>) {
        self.dialogs.write().insert(
            call_id.to_string(),
            DialogTags {
                local_tag: local_tag.to_string(),
                remote_tag: remote_tag.map(str::to_string),
            },
        );
    }

    pub fn dialog_tags(&self, dialog_id: &str) -> Option<DialogTags> {
        self.dialogs.read().get(dialog_id).cloned()
    }

    /// Tags for the next request in a dialog; the first request mints our tag
    fn dialog_for(&self, dialog_id: &str) -> DialogTags {
        self.dialogs
            .write()
            .entry(dialog_id.to_string())
            .or_insert_with(DialogTags::fresh)
            .clone()
    }

    fn learn_remote_tag(&self, dialog_id: &str, tag: String) {
        if let Some(dialog) = self.dialogs.write().get_mut(dialog_id) {
            if dialog.remote_tag.is_none() {
                dialog.remote_tag = Some(tag);
            }
        }
    }

    pub fn forget_call(&self, call_id: &str) {
        self.local_sdp.write().remove(call_id);
        self.dialogs.write().remove(call_id);
    }

    async fn receive_loop(socket: Arc<UdpSocket>, pending: PendingMap, shutdown: CancellationToken) {
        let mut buf = vec![0u8; 65535];
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("SIP receive loop stopped");
                    return;
                }
                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, source)) => Self::dispatch(&pending, &buf[..len], source),
                    Err(e) => warn!("SIP receive error: {}", e),
                }
            }
        }
    }

    fn dispatch(pending: &PendingMap, data: &[u8], source: SocketAddr) {
        let response = match rsip::Response::try_from(data) {
            Ok(response) => response,
            Err(_) => {
                debug!("Ignoring non-response datagram from {}", source);
                return;
            }
        };
        let code: u16 = response.status_code.clone().into();
        if code < 200 {
            return;
        }
        let Some(key) = transaction_key(&response.headers) else {
            debug!("Response from {} without Call-ID/CSeq", source);
            return;
        };
        let to_tag = response.headers.iter().find_map(|h| match h {
            rsip::Header::To(_) => tag_param(&header_value(h, "To")),
            _ => None,
        });
        if let Some(waiter) = pending.lock().remove(&key) {
            let _ = waiter.send(FinalResponse {
                code,
                reason: response.status_code.to_string(),
                to_tag,
            });
        } else {
            debug!("Unmatched {} response for {:?}", code, key);
        }
    }

    fn next_cseq(&self) -> u32 {
        self.cseq.fetch_add(1, Ordering::Relaxed)
    }

    fn default_sdp(&self) -> String {
        let ip: IpAddr = if self.local_addr.ip().is_unspecified() {
            IpAddr::from([127, 0, 0, 1])
        } else {
            self.local_addr.ip()
        };
        SdpSession::create_audio_session(ip, 10000).to_string()
    }

    /// Render and validate a request through rsip
    #[allow(clippy::too_many_arguments)]
    fn build_request(
        &self,
        method: &str,
        request_uri: &str,
        from: &str,
        to: &str,
        call_id: &str,
        dialog: &DialogTags,
        cseq: u32,
        extra_headers: &[(String, String)],
        content_type: Option<&str>,
        body: &str,
    ) -> Result<rsip::Request, SignalingError> {
        let config = self.config.read();
        let strip = |uri: &str| uri.trim_matches(|c| c == '<' || c == '>').to_string();

        let mut text = format!("{} {} SIP/2.0\r\n", method, strip(request_uri));
        text.push_str(&format!(
            "Via: SIP/2.0/UDP {};branch=z9hG4bK{}\r\n",
            self.local_addr,
            Uuid::new_v4().simple()
        ));
        text.push_str("Max-Forwards: 70\r\n");
        text.push_str(&format!("From: <{}>;tag={}\r\n", strip(from), dialog.local_tag));
        match &dialog.remote_tag {
            Some(tag) => text.push_str(&format!("To: <{}>;tag={}\r\n", strip(to), tag)),
            None => text.push_str(&format!("To: <{}>\r\n", strip(to))),
        }
        text.push_str(&format!("Call-ID: {}\r\n", call_id));
        text.push_str(&format!("CSeq: {} {}\r\n", cseq, method));
        text.push_str(&format!("Contact: <sip:pbx@{}>\r\n", self.local_addr));
        text.push_str(&format!("User-Agent: {}\r\n", config.user_agent));
        for (name, value) in extra_headers {
            text.push_str(&format!("{}: {}\r\n", name, value));
        }
        if let Some(content_type) = content_type {
            text.push_str(&format!("Content-Type: {}\r\n", content_type));
        }
        text.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));
        text.push_str(body);

        rsip::Request::try_from(text.as_bytes())
            .map_err(|e| SignalingError::InvalidMessage(format!("{} request: {}", method, e)))
    }

    /// Send a request and wait for its final response
    async fn transact(
        &self,
        request: rsip::Request,
        destination: SocketAddr,
        call_id: &str,
        cseq: u32,
    ) -> Result<(), SignalingError> {
        let key = TransactionKey {
            call_id: call_id.to_string(),
            cseq,
        };
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(key.clone(), tx);

        let method = request.method.to_string();
        if let Err(e) = self
            .socket
            .send_to(request.to_string().as_bytes(), destination)
            .await
        {
            self.pending.lock().remove(&key);
            return Err(SignalingError::Transport(format!("send to {}: {}", destination, e)));
        }
        debug!("{} sent to {} (Call-ID {}, CSeq {})", method, destination, call_id, cseq);

        let timeout = self.config.read().request_timeout();
        let outcome = tokio::time::timeout(timeout, rx).await;
        self.pending.lock().remove(&key);

        match outcome {
            Err(_) => Err(SignalingError::Timeout(timeout)),
            Ok(Err(_)) => Err(SignalingError::Transport("response channel closed".to_string())),
            Ok(Ok(final_response)) if (200..300).contains(&final_response.code) => {
                if let Some(tag) = final_response.to_tag {
                    self.learn_remote_tag(call_id, tag);
                }
                Ok(())
            }
            Ok(Ok(final_response)) => Err(SignalingError::Rejected {
                code: final_response.code,
                reason: final_response.reason,
            }),
        }
    }

    async fn send_ack(&self, session: &CallSession, cseq: u32, destination: SocketAddr) {
        let dialog = self.dialog_for(&session.call_id);
        let ack = match self.build_request(
            "ACK",
            &session.remote_uri,
            &session.local_uri,
            &session.remote_uri,
            &session.call_id,
            &dialog,
            cseq,
            &[],
            None,
            "",
        ) {
            Ok(ack) => ack,
            Err(e) => {
                warn!("Cannot build ACK for {}: {}", session.call_id, e);
                return;
            }
        };
        if let Err(e) = self
            .socket
            .send_to(ack.to_string().as_bytes(), destination)
            .await
        {
            warn!("ACK for {} not sent: {}", session.call_id, e);
        }
    }
}

/// `Replaces` value escaped for use inside a Refer-To URI
fn escape_replaces(replaces: &str) -> String {
    replaces
        .replace('%', "%25")
        .replace(';', "%3B")
        .replace('=', "%3D")
        .replace('@', "%40")
}

#[async_trait]
impl SignalingClient for UdpSignaling {
    async fn send_reinvite(
        &self,
        session: &CallSession,
        direction: MediaDirection,
    ) -> Result<(), SignalingError> {
        let destination = resolve_uri(&session.remote_uri).await?;
        let current = self
            .local_sdp
            .read()
            .get(&session.call_id)
            .cloned()
            .unwrap_or_else(|| self.default_sdp());
        let body = sdp::set_direction(&current, direction);

        let cseq = self.next_cseq();
        let dialog = self.dialog_for(&session.call_id);
        let request = self.build_request(
            "INVITE",
            &session.remote_uri,
            &session.local_uri,
            &session.remote_uri,
            &session.call_id,
            &dialog,
            cseq,
            &[],
            Some("application/sdp"),
            &body,
        )?;

        self.transact(request, destination, &session.call_id, cseq)
            .await?;
        self.send_ack(session, cseq, destination).await;
        self.set_local_sdp(&session.call_id, &body);
        info!("re-INVITE ({}) accepted for {}", direction, session.call_id);
        Ok(())
    }

    async fn send_refer(
        &self,
        session: &CallSession,
        target: &str,
        replaces: Option<String>,
    ) -> Result<(), SignalingError> {
        let destination = resolve_uri(&session.remote_uri).await?;
        let target = target.trim_matches(|c| c == '<' || c == '>');
        let refer_to = match &replaces {
            Some(replaces) => format!("<{}?Replaces={}>", target, escape_replaces(replaces)),
            None => format!("<{}>", target),
        };

        let cseq = self.next_cseq();
        let dialog = self.dialog_for(&session.call_id);
        let request = self.build_request(
            "REFER",
            &session.remote_uri,
            &session.local_uri,
            &session.remote_uri,
            &session.call_id,
            &dialog,
            cseq,
            &[
                ("Refer-To".to_string(), refer_to),
                ("Referred-By".to_string(), format!("<{}>", session.local_uri)),
            ],
            None,
            "",
        )?;

        self.transact(request, destination, &session.call_id, cseq)
            .await?;
        info!("REFER for {} accepted (target {})", session.call_id, target);
        Ok(())
    }

    async fn send_notify(
        &self,
        subscription: &MwiSubscription,
        body: &str,
        terminated: bool,
    ) -> Result<(), SignalingError> {
        let destination = resolve_uri(&subscription.contact).await?;
        let state = if terminated {
            "terminated;reason=noresource".to_string()
        } else {
            format!(
                "active;expires={}",
                subscription.time_until_expiry().max(0)
            )
        };

        let cseq = self.next_cseq();
        let dialog = self.dialog_for(&subscription.dialog_id);
        let request = self.build_request(
            "NOTIFY",
            &subscription.contact,
            &subscription.aor,
            &subscription.contact,
            &subscription.dialog_id,
            &dialog,
            cseq,
            &[
                ("Event".to_string(), "message-summary".to_string()),
                ("Subscription-State".to_string(), state),
            ],
            Some("application/simple-message-summary"),
            body,
        )?;

        self.transact(request, destination, &subscription.dialog_id, cseq)
            .await?;
        if terminated {
            self.dialogs.write().remove(&subscription.dialog_id);
        }
        Ok(())
    }

    fn call_ended(&self, call_id: &str) {
        self.forget_call(call_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::call::CallDirection;

    fn test_config() -> SipConfig {
        SipConfig {
            bind_address: "127.0.0.1".to_string(),
            bind_port: 0,
            request_timeout_ms: 500,
            ..SipConfig::default()
        }
    }

    /// Answers every request with `code`, echoing Call-ID and CSeq
    async fn spawn_peer(code: u16) -> (SocketAddr, tokio::sync::mpsc::Receiver<String>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let (tx, rx) = tokio::sync::mpsc::channel(8);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65535];
            loop {
                let Ok((len, source)) = socket.recv_from(&mut buf).await else {
                    return;
                };
                let text = String::from_utf8_lossy(&buf[..len]).to_string();
                let _ = tx.send(text.clone()).await;
                if text.starts_with("ACK") {
                    continue;
                }
                let echo: Vec<String> = text
                    .lines()
                    .filter(|l| {
                        ["Via:", "From:", "To:", "Call-ID:", "CSeq:"]
                            .iter()
                            .any(|name| l.starts_with(name))
                    })
                    .map(|l| {
                        if l.starts_with("To:") && !l.contains("tag=") {
                            format!("{};tag=peer42", l)
                        } else {
                            l.to_string()
                        }
                    })
                    .collect();
                let response = format!(
                    "SIP/2.0 {} {}\r\n{}\r\nContent-Length: 0\r\n\r\n",
                    code,
                    if code == 200 { "OK" } else { "Busy Here" },
                    echo.join("\r\n")
                );
                let _ = socket.send_to(response.as_bytes(), source).await;
            }
        });
        (addr, rx)
    }

    fn session_towards(peer: SocketAddr) -> CallSession {
        CallSession::new(
            "call-sig-1",
            CallDirection::Outbound,
            "1001",
            "+15550001111",
            "sip:1001@127.0.0.1",
            format!("sip:bob@{}", peer),
        )
    }

    #[tokio::test]
    async fn test_reinvite_accepted_and_acked() {
        let (peer, mut seen) = spawn_peer(200).await;
        let token = CancellationToken::new();
        let client = UdpSignaling::bind(test_config(), token.clone()).await.unwrap();
        let session = session_towards(peer);

        client
            .send_reinvite(&session, MediaDirection::SendOnly)
            .await
            .unwrap();

        let invite = seen.recv().await.unwrap();
        assert!(invite.starts_with("INVITE "));
        assert!(invite.contains("a=sendonly"));
        let ack = seen.recv().await.unwrap();
        assert!(ack.starts_with("ACK "));
        token.cancel();
    }

    #[tokio::test]
    async fn test_refer_rejected() {
        let (peer, mut seen) = spawn_peer(486).await;
        let token = CancellationToken::new();
        let client = UdpSignaling::bind(test_config(), token.clone()).await.unwrap();
        let session = session_towards(peer);

        let err = client
            .send_refer(&session, "sip:carol@pbx.local", Some("c2;to-tag=a;from-tag=b".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, SignalingError::Rejected { code: 486, .. }));

        let refer = seen.recv().await.unwrap();
        assert!(refer.starts_with("REFER "));
        assert!(refer.contains("sip:carol@pbx.local?Replaces=c2%3Bto-tag%3Da%3Bfrom-tag%3Db"));
        token.cancel();
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let token = CancellationToken::new();
        let client = UdpSignaling::bind(test_config(), token.clone()).await.unwrap();
        let session = session_towards(silent.local_addr().unwrap());

        let err = client
            .send_reinvite(&session, MediaDirection::SendRecv)
            .await
            .unwrap_err();
        assert!(matches!(err, SignalingError::Timeout(_)));
        token.cancel();
    }

    fn header_line<'a>(message: &'a str, name: &str) -> &'a str {
        message
            .lines()
            .find(|l| l.starts_with(name))
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn test_dialog_tags_persist_across_requests() {
        let (peer, mut seen) = spawn_peer(200).await;
        let token = CancellationToken::new();
        let client = UdpSignaling::bind(test_config(), token.clone()).await.unwrap();
        let session = session_towards(peer);

        client
            .send_reinvite(&session, MediaDirection::SendOnly)
            .await
            .unwrap();
        let first = seen.recv().await.unwrap();
        let ack = seen.recv().await.unwrap();
        let local_tag = tag_param(header_line(&first, "From:")).unwrap();
        assert_eq!(tag_param(header_line(&first, "To:")), None);
        assert_eq!(tag_param(header_line(&ack, "From:")), Some(local_tag.clone()));
        assert_eq!(tag_param(header_line(&ack, "To:")).as_deref(), Some("peer42"));

        client
            .send_refer(&session, "sip:carol@pbx.local", None)
            .await
            .unwrap();
        let refer = seen.recv().await.unwrap();
        assert_eq!(tag_param(header_line(&refer, "From:")), Some(local_tag.clone()));
        assert_eq!(tag_param(header_line(&refer, "To:")).as_deref(), Some("peer42"));

        client.call_ended(&session.call_id);
        assert!(client.dialog_tags(&session.call_id).is_none());
        token.cancel();
    }

    #[tokio::test]
    async fn test_established_dialog_tags_are_adopted() {
        let (peer, mut seen) = spawn_peer(200).await;
        let token = CancellationToken::new();
        let client = UdpSignaling::bind(test_config(), token.clone()).await.unwrap();
        let session = session_towards(peer);
        client.set_dialog_tags(&session.call_id, "ours1", Some("theirs1"));

        client
            .send_reinvite(&session, MediaDirection::SendRecv)
            .await
            .unwrap();
        let invite = seen.recv().await.unwrap();
        assert_eq!(tag_param(header_line(&invite, "From:")).as_deref(), Some("ours1"));
        assert_eq!(tag_param(header_line(&invite, "To:")).as_deref(), Some("theirs1"));
        assert_eq!(
            client.dialog_tags(&session.call_id).unwrap().remote_tag.as_deref(),
            Some("theirs1")
        );
        token.cancel();
    }

    #[test]
    fn test_tag_param() {
        assert_eq!(tag_param("<sip:a@b;lr>;tag=abc").as_deref(), Some("abc"));
        assert_eq!(tag_param("<sip:a@b;tag=inner>"), None);
        assert_eq!(tag_param("sip:a@b;tag=x1").as_deref(), Some("x1"));
    }

    #[tokio::test]
    async fn test_resolve_uri() {
        let addr = resolve_uri("<sip:bob@127.0.0.1:5070>").await.unwrap();
        assert_eq!(addr, "127.0.0.1:5070".parse().unwrap());
        assert_eq!(resolve_uri("sip:bob@127.0.0.1").await.unwrap().port(), 5060);
    }

    #[test]
    fn test_escape_replaces() {
        assert_eq!(escape_replaces("a@b;to-tag=1"), "a%40b%3Bto-tag%3D1");
    }
}
