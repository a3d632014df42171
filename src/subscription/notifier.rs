use super::DEFAULT_EXPIRES;
use crate::{
    dialog::{dialog::SubscriptionDialog, DialogId},
    event::{EventHeader, SubState, SubscriptionStateHeader},
    rsip_ext::{content_type_value, header_value},
    transaction::{
        make_tag, Credential, IncomingRequest, TransactionEvent, TransactionEventReceiver,
    },
    useragent::{ScheduledTask, Subscription, UserAgent, UserAgentRef},
    Error, Result,
};
use rsip::{
    prelude::{HeadersExt, ToTypedHeader, UntypedHeader},
    Header, Method, StatusCode, StatusCodeKind,
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, Weak,
};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Notifier-side subscription state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NotifierState {
    Pending = 0,
    Active = 1,
    Terminated = 2,
}

impl std::fmt::Display for NotifierState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotifierState::Pending => write!(f, "pending"),
            NotifierState::Active => write!(f, "active"),
            NotifierState::Terminated => write!(f, "terminated"),
        }
    }
}

/// Why the notifier terminated. Disjoint from the subscriber's codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifierTerminationCode {
    NotifyResponseTimeout,
    NotifyTransportError,
    NotifyNonOkResponse,
    NotifyFailedAuthentication,
    SendFinalNotify,
    ReceiveUnsubscribe,
    SubscriptionExpired,
}

impl std::fmt::Display for NotifierTerminationCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NotifierTerminationCode::NotifyResponseTimeout => "notify_response_timeout",
            NotifierTerminationCode::NotifyTransportError => "notify_transport_error",
            NotifierTerminationCode::NotifyNonOkResponse => "notify_non_ok_response",
            NotifierTerminationCode::NotifyFailedAuthentication => "notify_failed_authentication",
            NotifierTerminationCode::SendFinalNotify => "send_final_notify",
            NotifierTerminationCode::ReceiveUnsubscribe => "receive_unsubscribe",
            NotifierTerminationCode::SubscriptionExpired => "subscription_expired",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone)]
pub enum NotifierEvent {
    /// Every inbound SUBSCRIBE, the initial one included.
    Subscribe {
        is_unsubscribe: bool,
        request: rsip::Request,
        body: String,
        content_type: String,
    },
    /// Terminal event, emitted at most once. `send_final_notify` tells
    /// the application whether a final NOTIFY is still owed to the
    /// peer, true only on the expiry path.
    Terminated {
        code: NotifierTerminationCode,
        send_final_notify: bool,
    },
}

pub struct NotifierOptions {
    pub content_type: String,
    /// Start in `pending` instead of `active`.
    pub pending: bool,
    /// Extra headers for outgoing NOTIFYs; a Contact here overrides the
    /// user agent's own.
    pub extra_headers: Vec<Header>,
    pub allow_events: Option<String>,
    pub credential: Option<Credential>,
}

pub struct NotifierInner {
    weak_self: Weak<NotifierInner>,
    pub(crate) dialog: SubscriptionDialog,
    event: EventHeader,
    content_type: String,
    extra_headers: Vec<Header>,
    allow_events: Option<String>,
    expires: Mutex<u32>,
    expires_at: Mutex<Instant>,
    useragent: UserAgentRef,
    listener: Mutex<Option<Arc<dyn Fn(NotifierEvent) + Send + Sync>>>,
    state: Mutex<NotifierState>,
    terminated: AtomicBool,
    final_notify_sent: AtomicBool,
    first_notify_response: AtomicBool,
    terminal_reason: Mutex<Option<String>>,
    terminal_retry_after: Mutex<Option<u32>>,
    expiry_timer: Mutex<Option<u64>>,
    initial_request: IncomingRequest,
}

/// Notifier side of an RFC 6665 subscription, created from the inbound
/// initial SUBSCRIBE.
///
/// `start()` replays that SUBSCRIBE through the normal receive path so
/// the application sees the first `subscribe` event only after it had
/// the chance to register its handler.
#[derive(Clone)]
pub struct Notifier {
    pub(crate) inner: Arc<NotifierInner>,
}

impl Notifier {
    pub fn new(
        useragent: &UserAgent,
        incoming: IncomingRequest,
        options: NotifierOptions,
    ) -> Result<Notifier> {
        if options.content_type.trim().is_empty() {
            return Err(Error::InvalidConfig("content_type is required".to_string()));
        }
        if incoming.request.method != Method::Subscribe {
            return Err(Error::InvalidConfig(
                "notifier requires an initial SUBSCRIBE".to_string(),
            ));
        }

        let event = match header_value(&incoming.request.headers, "Event") {
            Some(value) => EventHeader::parse(&value)?,
            None => {
                return Err(Error::HeaderParseError(
                    "SUBSCRIBE without Event header".to_string(),
                ))
            }
        };

        let expires = match incoming.request.expires_header() {
            Some(header) => header.value().parse::<u32>().unwrap_or(DEFAULT_EXPIRES),
            None => {
                debug!("SUBSCRIBE without Expires, assuming {}", DEFAULT_EXPIRES);
                DEFAULT_EXPIRES
            }
        };

        // Contact override from the configured extra headers, the rest
        // go out on every NOTIFY.
        let mut contact = useragent.inner.contact.clone();
        let mut extra_headers = Vec::with_capacity(options.extra_headers.len());
        for header in options.extra_headers {
            match header {
                Header::Contact(c) => match c.typed() {
                    Ok(c) => contact = c,
                    Err(e) => warn!("unusable Contact in extra headers: {}", e),
                },
                other => extra_headers.push(other),
            }
        }

        let dialog = SubscriptionDialog::new_uas(
            &incoming.request,
            make_tag(),
            contact,
            options.credential,
            useragent.inner.request_sender.clone(),
        )?;

        let state = if options.pending {
            NotifierState::Pending
        } else {
            NotifierState::Active
        };

        let inner = Arc::new_cyclic(|weak| NotifierInner {
            weak_self: weak.clone(),
            dialog,
            event,
            content_type: options.content_type,
            extra_headers,
            allow_events: options.allow_events,
            expires: Mutex::new(expires),
            expires_at: Mutex::new(Instant::now() + Duration::from_secs(expires as u64)),
            useragent: useragent.inner.clone(),
            listener: Mutex::new(None),
            state: Mutex::new(state),
            terminated: AtomicBool::new(false),
            final_notify_sent: AtomicBool::new(false),
            first_notify_response: AtomicBool::new(true),
            terminal_reason: Mutex::new(None),
            terminal_retry_after: Mutex::new(None),
            expiry_timer: Mutex::new(None),
            initial_request: incoming,
        });

        let notifier = Notifier {
            inner: inner.clone(),
        };
        let id = inner.dialog.id();
        useragent
            .inner
            .new_dialog(id.clone(), Subscription::Notifier(notifier.clone()));
        info!(%id, event = %inner.event, "notifier created");

        // fetch-subscribe (Expires: 0) never arms the expiry timer
        if expires > 0 {
            inner.arm_expiry_timer(expires);
        }
        Ok(notifier)
    }

    /// Register the application event handler, then call `start`.
    pub fn on_event<F>(&self, handler: F)
    where
        F: Fn(NotifierEvent) + Send + Sync + 'static,
    {
        *self.inner.listener.lock().unwrap() = Some(Arc::new(handler));
    }

    /// Replay the captured initial SUBSCRIBE so the application sees
    /// the first `subscribe` event.
    pub fn start(&self) -> Result<()> {
        self.inner
            .receive_request(self.inner.initial_request.clone())
    }

    /// pending -> active; a no-op in any other state.
    pub fn set_active_state(&self) {
        let mut state = self.inner.state.lock().unwrap();
        if *state == NotifierState::Pending {
            debug!(id = %self.inner.dialog.id(), "state pending -> active");
            *state = NotifierState::Active;
        }
    }

    pub fn notify(&self, body: Option<String>) -> Result<()> {
        self.inner.notify(body)
    }

    /// Send the final NOTIFY and terminate. Safe to call from inside
    /// the `subscribe` event handler; repeated calls are no-ops.
    pub fn terminate(
        &self,
        body: Option<String>,
        reason: Option<String>,
        retry_after: Option<u32>,
    ) -> Result<()> {
        self.inner.finalize(
            body,
            reason,
            retry_after,
            NotifierTerminationCode::SendFinalNotify,
        )
    }

    pub fn state(&self) -> NotifierState {
        *self.inner.state.lock().unwrap()
    }

    pub fn id(&self) -> DialogId {
        self.inner.dialog.id()
    }

    pub(crate) fn receive_request(&self, incoming: IncomingRequest) -> Result<()> {
        self.inner.receive_request(incoming)
    }
}

impl NotifierInner {
    fn emit(&self, event: NotifierEvent) {
        let listener = self.listener.lock().unwrap().clone();
        match listener {
            Some(listener) => listener(event),
            None => debug!(id = %self.dialog.id(), "no notifier listener, event dropped"),
        }
    }

    fn arm_expiry_timer(&self, expires: u32) {
        let timer = self.useragent.timers.schedule(
            Duration::from_secs(expires as u64),
            ScheduledTask::NotifierExpiry(self.weak_self.clone()),
        );
        if let Some(old) = self.expiry_timer.lock().unwrap().replace(timer) {
            self.useragent.timers.cancel(old);
        }
    }

    pub(crate) fn receive_request(&self, incoming: IncomingRequest) -> Result<()> {
        let request = &incoming.request;

        if request.method != Method::Subscribe {
            info!(id = %self.dialog.id(), method = %request.method, "unexpected in-dialog request");
            let resp =
                self.dialog
                    .make_response(request, StatusCode::MethodNotAllowed, vec![], None);
            incoming.replies.send(resp)?;
            return Ok(());
        }

        let cseq = request.cseq_header()?.seq()?;
        if !self.dialog.validate_remote_seq(cseq) {
            debug!(id = %self.dialog.id(), cseq, "stale SUBSCRIBE discarded");
            return Ok(());
        }

        let expires = match request.expires_header() {
            Some(header) => header.value().parse::<u32>().unwrap_or(DEFAULT_EXPIRES),
            None => {
                debug!(id = %self.dialog.id(), "SUBSCRIBE without Expires, assuming {}", DEFAULT_EXPIRES);
                DEFAULT_EXPIRES
            }
        };

        let resp = self.dialog.make_response(
            request,
            StatusCode::OK,
            vec![Header::Expires(expires.into())],
            None,
        );
        incoming.replies.send(resp)?;

        let is_unsubscribe = expires == 0;
        if !is_unsubscribe {
            *self.expires.lock().unwrap() = expires;
            *self.expires_at.lock().unwrap() =
                Instant::now() + Duration::from_secs(expires as u64);
            if !self.terminated.load(Ordering::SeqCst) {
                self.arm_expiry_timer(expires);
            }
        }

        let body = String::from_utf8_lossy(&request.body).to_string();
        let content_type = content_type_value(&request.headers).unwrap_or_default();
        self.emit(NotifierEvent::Subscribe {
            is_unsubscribe,
            request: request.clone(),
            body,
            content_type,
        });

        // The handler above may already have terminated us via
        // terminate(); the funnel swallows this second trigger.
        if is_unsubscribe {
            info!(id = %self.dialog.id(), "unsubscribe received");
            self.dialog_terminated(NotifierTerminationCode::ReceiveUnsubscribe);
        }
        Ok(())
    }

    pub(crate) fn notify(&self, body: Option<String>) -> Result<()> {
        if self.final_notify_sent.load(Ordering::SeqCst) {
            debug!(id = %self.dialog.id(), "final NOTIFY already sent, ignored");
            return Ok(());
        }

        let state = *self.state.lock().unwrap();
        let sub_state = if state == NotifierState::Terminated {
            self.final_notify_sent.store(true, Ordering::SeqCst);
            SubscriptionStateHeader {
                state: SubState::Terminated,
                expires: None,
                reason: self.terminal_reason.lock().unwrap().clone(),
                retry_after: *self.terminal_retry_after.lock().unwrap(),
            }
        } else {
            let remaining = self
                .expires_at
                .lock()
                .unwrap()
                .saturating_duration_since(Instant::now())
                .as_secs() as u32;
            SubscriptionStateHeader {
                state: match state {
                    NotifierState::Pending => SubState::Pending,
                    _ => SubState::Active,
                },
                expires: Some(remaining),
                reason: None,
                retry_after: None,
            }
        };

        let mut headers = vec![
            Header::Other("Event".into(), self.event.to_string()),
            Header::Other("Subscription-State".into(), sub_state.to_string()),
        ];
        if let Some(allow) = &self.allow_events {
            headers.push(Header::Other("Allow-Events".into(), allow.clone()));
        }
        headers.extend(self.extra_headers.iter().cloned());
        let body = body.filter(|b| !b.is_empty());
        if body.is_some() {
            headers.push(Header::ContentType(self.content_type.clone().into()));
        }

        let receiver =
            self.dialog
                .send_request(Method::Notify, headers, body.map(String::into_bytes))?;
        self.spawn_transaction_pump(receiver);
        Ok(())
    }

    fn spawn_transaction_pump(&self, mut receiver: TransactionEventReceiver) {
        let Some(inner) = self.weak_self.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                if inner.on_transaction_event(event) {
                    break;
                }
            }
        });
    }

    /// Returns true once the transaction reached a final outcome.
    fn on_transaction_event(&self, event: TransactionEvent) -> bool {
        match event {
            TransactionEvent::Authenticated => {
                self.dialog.increment_local_seq();
                false
            }
            TransactionEvent::Response(resp) => self.on_notify_response(resp),
            TransactionEvent::Timeout => {
                info!(id = %self.dialog.id(), "NOTIFY transaction timed out");
                self.dialog_terminated(NotifierTerminationCode::NotifyResponseTimeout);
                true
            }
            TransactionEvent::TransportError(e) => {
                warn!(id = %self.dialog.id(), "NOTIFY transport error: {}", e);
                self.dialog_terminated(NotifierTerminationCode::NotifyTransportError);
                true
            }
        }
    }

    fn on_notify_response(&self, resp: rsip::Response) -> bool {
        if resp.status_code.kind() == StatusCodeKind::Provisional {
            return false;
        }

        if matches!(
            resp.status_code,
            StatusCode::Unauthorized | StatusCode::ProxyAuthenticationRequired
        ) {
            info!(id = %self.dialog.id(), "authentication rejected after retry");
            self.dialog_terminated(NotifierTerminationCode::NotifyFailedAuthentication);
            return true;
        }

        if resp.status_code.kind() != StatusCodeKind::Successful {
            info!(id = %self.dialog.id(), status = %resp.status_code, "NOTIFY rejected");
            self.dialog_terminated(NotifierTerminationCode::NotifyNonOkResponse);
            return true;
        }

        if self.first_notify_response.swap(false, Ordering::SeqCst) {
            self.dialog.update_route_set_from_response(&resp);
        }
        true
    }

    pub(crate) fn on_expiry(&self) {
        if self.terminated.load(Ordering::SeqCst) || self.final_notify_sent.load(Ordering::SeqCst)
        {
            return;
        }
        info!(id = %self.dialog.id(), "subscription expired without refresh");
        if let Err(e) = self.finalize(
            None,
            Some("timeout".to_string()),
            None,
            NotifierTerminationCode::SubscriptionExpired,
        ) {
            warn!(id = %self.dialog.id(), "expiry NOTIFY failed: {}", e);
        }
    }

    /// Mark terminated first so the composed Subscription-State carries
    /// reason/retry-after and no expires, then send the final NOTIFY
    /// and run the funnel.
    pub(crate) fn finalize(
        &self,
        body: Option<String>,
        reason: Option<String>,
        retry_after: Option<u32>,
        code: NotifierTerminationCode,
    ) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            if *state != NotifierState::Terminated {
                debug!(id = %self.dialog.id(), "state {} -> terminated", *state);
                *state = NotifierState::Terminated;
            }
        }
        if reason.is_some() {
            *self.terminal_reason.lock().unwrap() = reason;
        }
        if retry_after.is_some() {
            *self.terminal_retry_after.lock().unwrap() = retry_after;
        }
        let sent = self.notify(body);
        self.dialog_terminated(code);
        sent
    }

    /// The one terminal funnel; only the first caller gets through.
    fn dialog_terminated(&self, code: NotifierTerminationCode) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.state.lock().unwrap() = NotifierState::Terminated;

        if let Some(timer) = self.expiry_timer.lock().unwrap().take() {
            self.useragent.timers.cancel(timer);
        }

        let id = self.dialog.id();
        self.useragent.destroy_dialog(&id);

        let send_final_notify = code == NotifierTerminationCode::SubscriptionExpired;
        info!(%id, %code, send_final_notify, "subscription terminated");
        self.emit(NotifierEvent::Terminated {
            code,
            send_final_notify,
        });
    }
}
