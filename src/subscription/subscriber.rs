use super::{
    refresh_delay, DEFAULT_EXPIRES, DIALOG_LINGER, RESCHEDULE_THRESHOLD, UNSUBSCRIBE_GUARD,
};
use crate::{
    dialog::{dialog::SubscriptionDialog, DialogId},
    event::{EventHeader, SubState, SubscriptionStateHeader},
    rsip_ext::{content_type_value, extract_uri_from_contact, header_value},
    transaction::{
        make_call_id, make_tag, Credential, IncomingRequest, TransactionEvent,
        TransactionEventReceiver,
    },
    useragent::{ScheduledTask, Subscription, UserAgent, UserAgentRef},
    Error, Result,
};
use rsip::{
    prelude::{HeadersExt, UntypedHeader},
    Header, Method, StatusCode, StatusCodeKind,
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, Weak,
};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Subscriber-side subscription state.
///
/// `Init` until the first SUBSCRIBE goes out, `NotifyWait` until the
/// notifier's first NOTIFY arrives, then whatever Subscription-State
/// the notifier reports. `Terminated` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    Init,
    NotifyWait,
    Pending,
    Active,
    Terminated,
}

impl std::fmt::Display for SubscriberState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubscriberState::Init => write!(f, "init"),
            SubscriberState::NotifyWait => write!(f, "notify_wait"),
            SubscriberState::Pending => write!(f, "pending"),
            SubscriberState::Active => write!(f, "active"),
            SubscriberState::Terminated => write!(f, "terminated"),
        }
    }
}

/// Why the subscriber terminated. Disjoint from the notifier's codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberTerminationCode {
    SubscribeResponseTimeout,
    SubscribeTransportError,
    SubscribeNonOkResponse,
    SubscribeFailedAuthentication,
    UnsubscribeTimeout,
    ReceiveFinalNotify,
    ReceiveBadNotify,
}

impl std::fmt::Display for SubscriberTerminationCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SubscriberTerminationCode::SubscribeResponseTimeout => "subscribe_response_timeout",
            SubscriberTerminationCode::SubscribeTransportError => "subscribe_transport_error",
            SubscriberTerminationCode::SubscribeNonOkResponse => "subscribe_non_ok_response",
            SubscriberTerminationCode::SubscribeFailedAuthentication => {
                "subscribe_failed_authentication"
            }
            SubscriberTerminationCode::UnsubscribeTimeout => "unsubscribe_timeout",
            SubscriberTerminationCode::ReceiveFinalNotify => "receive_final_notify",
            SubscriberTerminationCode::ReceiveBadNotify => "receive_bad_notify",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone)]
pub enum SubscriberEvent {
    /// The remote tag is bound and the dialog registered, once per
    /// subscription.
    DialogCreated(DialogId),
    /// First transition into the active state.
    Active,
    /// A NOTIFY carrying a body.
    Notify {
        is_final: bool,
        request: rsip::Request,
        body: String,
        content_type: String,
    },
    /// Terminal event, emitted at most once.
    Terminated {
        code: SubscriberTerminationCode,
        reason: Option<String>,
        retry_after: Option<u32>,
    },
}

pub struct SubscriberOptions {
    pub target: rsip::Uri,
    pub from: rsip::Uri,
    pub event: String,
    pub event_id: Option<String>,
    pub accept: String,
    pub expires: u32,
    pub content_type: Option<String>,
    pub extra_headers: Vec<Header>,
    pub allow_events: Option<String>,
    pub credential: Option<Credential>,
}

pub struct SubscriberInner {
    weak_self: Weak<SubscriberInner>,
    pub(crate) dialog: SubscriptionDialog,
    event: EventHeader,
    accept: String,
    expires: Mutex<u32>,
    expires_at: Mutex<Instant>,
    content_type: Option<String>,
    extra_headers: Vec<Header>,
    allow_events: Option<String>,
    useragent: UserAgentRef,
    listener: Mutex<Option<Arc<dyn Fn(SubscriberEvent) + Send + Sync>>>,
    state: Mutex<SubscriberState>,
    terminated: AtomicBool,
    unsubscribe_sent: AtomicBool,
    dialog_registered: AtomicBool,
    refresh_timer: Mutex<Option<u64>>,
    unsubscribe_timer: Mutex<Option<u64>>,
}

/// Subscriber side of an RFC 6665 subscription.
///
/// Created in `init`, driven by `subscribe`/`unsubscribe` and the
/// dialog layer feeding `receive_request`; reports to the application
/// through the registered event handler.
#[derive(Clone)]
pub struct Subscriber {
    pub(crate) inner: Arc<SubscriberInner>,
}

impl Subscriber {
    pub fn new(useragent: &UserAgent, options: SubscriberOptions) -> Result<Subscriber> {
        if options.event.trim().is_empty() {
            return Err(Error::InvalidConfig(
                "event package name is required".to_string(),
            ));
        }
        if options.accept.trim().is_empty() {
            return Err(Error::InvalidConfig("accept is required".to_string()));
        }

        let event = EventHeader::new(&options.event, options.event_id.as_deref());
        let call_id = make_call_id(None).value().to_string();
        let from_tag = make_tag();
        let dialog = SubscriptionDialog::new_uac(
            call_id,
            from_tag,
            options.from,
            options.target,
            useragent.inner.contact.clone(),
            options.credential,
            useragent.inner.request_sender.clone(),
        );

        Ok(Subscriber {
            inner: Arc::new_cyclic(|weak| SubscriberInner {
                weak_self: weak.clone(),
                dialog,
                event,
                accept: options.accept,
                expires: Mutex::new(options.expires),
                expires_at: Mutex::new(Instant::now()),
                content_type: options.content_type,
                extra_headers: options.extra_headers,
                allow_events: options.allow_events,
                useragent: useragent.inner.clone(),
                listener: Mutex::new(None),
                state: Mutex::new(SubscriberState::Init),
                terminated: AtomicBool::new(false),
                unsubscribe_sent: AtomicBool::new(false),
                dialog_registered: AtomicBool::new(false),
                refresh_timer: Mutex::new(None),
                unsubscribe_timer: Mutex::new(None),
            }),
        })
    }

    /// Register the application event handler. Events raised before
    /// registration are dropped with a debug log, register before
    /// calling `subscribe`.
    pub fn on_event<F>(&self, handler: F)
    where
        F: Fn(SubscriberEvent) + Send + Sync + 'static,
    {
        *self.inner.listener.lock().unwrap() = Some(Arc::new(handler));
    }

    pub fn subscribe(&self, body: Option<String>) -> Result<()> {
        self.inner.send_subscribe(body)
    }

    pub fn unsubscribe(&self, body: Option<String>) -> Result<()> {
        self.inner.send_unsubscribe(body)
    }

    pub fn state(&self) -> SubscriberState {
        *self.inner.state.lock().unwrap()
    }

    pub fn id(&self) -> DialogId {
        self.inner.dialog.id()
    }

    pub(crate) fn receive_request(&self, incoming: IncomingRequest) -> Result<()> {
        self.inner.receive_request(incoming)
    }
}

impl SubscriberInner {
    fn emit(&self, event: SubscriberEvent) {
        let listener = self.listener.lock().unwrap().clone();
        match listener {
            Some(listener) => listener(event),
            None => debug!(id = %self.dialog.id(), "no subscriber listener, event dropped"),
        }
    }

    pub(crate) fn send_subscribe(&self, body: Option<String>) -> Result<()> {
        if self.terminated.load(Ordering::SeqCst) {
            warn!(id = %self.dialog.id(), "subscribe on terminated subscription ignored");
            return Ok(());
        }
        if body.is_some() && self.content_type.is_none() {
            return Err(Error::InvalidConfig(
                "content_type is required when a body is set".to_string(),
            ));
        }

        {
            let mut state = self.state.lock().unwrap();
            if *state == SubscriberState::Init {
                debug!(id = %self.dialog.id(), "state init -> notify_wait");
                *state = SubscriberState::NotifyWait;
            }
        }

        let expires = *self.expires.lock().unwrap();
        let receiver = self.send_subscribe_request(expires, body)?;
        self.spawn_transaction_pump(receiver);
        Ok(())
    }

    pub(crate) fn send_unsubscribe(&self, body: Option<String>) -> Result<()> {
        if self.terminated.load(Ordering::SeqCst) {
            warn!(id = %self.dialog.id(), "unsubscribe on terminated subscription ignored");
            return Ok(());
        }
        if body.is_some() && self.content_type.is_none() {
            return Err(Error::InvalidConfig(
                "content_type is required when a body is set".to_string(),
            ));
        }
        if self.unsubscribe_sent.swap(true, Ordering::SeqCst) {
            warn!(id = %self.dialog.id(), "unsubscribe already sent, ignored");
            return Ok(());
        }

        if let Some(timer) = self.refresh_timer.lock().unwrap().take() {
            self.useragent.timers.cancel(timer);
        }

        let receiver = self.send_subscribe_request(0, body)?;
        self.spawn_transaction_pump(receiver);

        let timer = self.useragent.timers.schedule(
            UNSUBSCRIBE_GUARD,
            ScheduledTask::SubscriberUnsubscribeGuard(self.weak_self.clone()),
        );
        self.unsubscribe_timer.lock().unwrap().replace(timer);
        Ok(())
    }

    fn send_subscribe_request(
        &self,
        expires: u32,
        body: Option<String>,
    ) -> Result<TransactionEventReceiver> {
        let mut headers = vec![
            Header::Other("Event".into(), self.event.to_string()),
            Header::Other("Accept".into(), self.accept.clone()),
            Header::Expires(expires.into()),
        ];
        if let Some(allow) = &self.allow_events {
            headers.push(Header::Other("Allow-Events".into(), allow.clone()));
        }
        headers.extend(self.extra_headers.iter().cloned());
        if body.is_some() {
            if let Some(content_type) = &self.content_type {
                headers.push(Header::ContentType(content_type.clone().into()));
            }
        }
        self.dialog
            .send_request(Method::Subscribe, headers, body.map(String::into_bytes))
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
                // the transaction layer re-sent with a fresh CSeq
                self.dialog.increment_local_seq();
                false
            }
            TransactionEvent::Response(resp) => self.on_subscribe_response(resp),
            TransactionEvent::Timeout => {
                info!(id = %self.dialog.id(), "SUBSCRIBE transaction timed out");
                self.dialog_terminated(
                    SubscriberTerminationCode::SubscribeResponseTimeout,
                    None,
                    None,
                );
                true
            }
            TransactionEvent::TransportError(e) => {
                warn!(id = %self.dialog.id(), "SUBSCRIBE transport error: {}", e);
                self.dialog_terminated(
                    SubscriberTerminationCode::SubscribeTransportError,
                    None,
                    None,
                );
                true
            }
        }
    }

    fn on_subscribe_response(&self, resp: rsip::Response) -> bool {
        if resp.status_code.kind() == StatusCodeKind::Provisional {
            return false;
        }

        if matches!(
            resp.status_code,
            StatusCode::Unauthorized | StatusCode::ProxyAuthenticationRequired
        ) {
            info!(id = %self.dialog.id(), "authentication rejected after retry");
            self.dialog_terminated(
                SubscriberTerminationCode::SubscribeFailedAuthentication,
                None,
                None,
            );
            return true;
        }

        if resp.status_code.kind() != StatusCodeKind::Successful {
            info!(id = %self.dialog.id(), status = %resp.status_code, "SUBSCRIBE rejected");
            self.dialog_terminated(SubscriberTerminationCode::SubscribeNonOkResponse, None, None);
            return true;
        }

        if !self.dialog.id().is_established() {
            if let Ok(to) = resp.to_header() {
                if let Ok(Some(tag)) = to.tag() {
                    self.dialog.update_remote_tag(tag.value());
                    self.register_dialog();
                }
            }
            self.dialog.update_route_set_from_response(&resp);
            if let Ok(contact) = resp.contact_header() {
                if let Ok(uri) = extract_uri_from_contact(contact.value()) {
                    self.dialog.set_remote_target(uri);
                }
            }
        }

        let expires = match resp.expires_header() {
            Some(expires) => match expires.value().parse::<u32>() {
                Ok(expires) => expires,
                Err(_) => {
                    debug!(id = %self.dialog.id(), "unparsable Expires in 2xx, assuming {}", DEFAULT_EXPIRES);
                    DEFAULT_EXPIRES
                }
            },
            None => {
                debug!(id = %self.dialog.id(), "2xx without Expires, assuming {}", DEFAULT_EXPIRES);
                DEFAULT_EXPIRES
            }
        };

        *self.expires.lock().unwrap() = expires;
        *self.expires_at.lock().unwrap() = Instant::now() + Duration::from_secs(expires as u64);
        if expires > 0
            && !self.unsubscribe_sent.load(Ordering::SeqCst)
            && !self.terminated.load(Ordering::SeqCst)
        {
            self.schedule_refresh(expires);
        }
        true
    }

    fn register_dialog(&self) {
        if self.dialog_registered.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(inner) = self.weak_self.upgrade() else {
            return;
        };
        let id = self.dialog.id();
        self.useragent
            .new_dialog(id.clone(), Subscription::Subscriber(Subscriber { inner }));
        info!(%id, "subscription dialog created");
        self.emit(SubscriberEvent::DialogCreated(id));
    }

    fn schedule_refresh(&self, expires: u32) {
        let delay = refresh_delay(expires);
        debug!(id = %self.dialog.id(), delay = delay.as_secs(), "refresh scheduled");
        let timer = self
            .useragent
            .timers
            .schedule(delay, ScheduledTask::SubscriberRefresh(self.weak_self.clone()));
        if let Some(old) = self.refresh_timer.lock().unwrap().replace(timer) {
            self.useragent.timers.cancel(old);
        }
    }

    pub(crate) fn refresh(&self) {
        if self.terminated.load(Ordering::SeqCst) || self.unsubscribe_sent.load(Ordering::SeqCst) {
            return;
        }
        debug!(id = %self.dialog.id(), "refreshing subscription");
        if let Err(e) = self.send_subscribe(None) {
            warn!(id = %self.dialog.id(), "refresh SUBSCRIBE failed: {}", e);
        }
    }

    pub(crate) fn on_unsubscribe_guard(&self) {
        if self.terminated.load(Ordering::SeqCst) {
            return;
        }
        info!(id = %self.dialog.id(), "no final NOTIFY after unsubscribe");
        self.dialog_terminated(SubscriberTerminationCode::UnsubscribeTimeout, None, None);
    }

    pub(crate) fn receive_request(&self, incoming: IncomingRequest) -> Result<()> {
        let request = &incoming.request;

        if request.method != Method::Notify {
            info!(id = %self.dialog.id(), method = %request.method, "unexpected in-dialog request");
            let resp =
                self.dialog
                    .make_response(request, StatusCode::MethodNotAllowed, vec![], None);
            incoming.replies.send(resp)?;
            return Ok(());
        }

        let event_matches = matches!(
            header_value(&request.headers, "Event")
                .as_deref()
                .map(EventHeader::parse),
            Some(Ok(ref event)) if *event == self.event
        );
        if !event_matches {
            info!(id = %self.dialog.id(), "NOTIFY with missing or mismatched Event header");
            let resp = self
                .dialog
                .make_response(request, StatusCode::BadEvent, vec![], None);
            incoming.replies.send(resp)?;
            self.dialog_terminated(SubscriberTerminationCode::ReceiveBadNotify, None, None);
            return Ok(());
        }

        let sub_state = match header_value(&request.headers, "Subscription-State")
            .as_deref()
            .map(SubscriptionStateHeader::parse)
        {
            Some(Ok(sub_state)) => sub_state,
            _ => {
                info!(id = %self.dialog.id(), "NOTIFY without Subscription-State header");
                let resp =
                    self.dialog
                        .make_response(request, StatusCode::BadRequest, vec![], None);
                incoming.replies.send(resp)?;
                self.dialog_terminated(SubscriberTerminationCode::ReceiveBadNotify, None, None);
                return Ok(());
            }
        };

        // A NOTIFY racing ahead of the SUBSCRIBE 2xx also establishes
        // the dialog; the notifier's tag travels in its From header.
        if !self.dialog.id().is_established() {
            if let Ok(Some(tag)) = request.from_header()?.tag() {
                self.dialog.update_remote_tag(tag.value());
                self.register_dialog();
            }
        }

        let resp = self.dialog.make_response(request, StatusCode::OK, vec![], None);
        incoming.replies.send(resp)?;

        // the dialog lingers after termination exactly so a late final
        // NOTIFY can be answered; it no longer produces events
        if self.terminated.load(Ordering::SeqCst) {
            debug!(id = %self.dialog.id(), "NOTIFY after termination absorbed");
            return Ok(());
        }

        let is_final = sub_state.is_terminated();
        let mut entered_active = false;
        if !is_final {
            let mut state = self.state.lock().unwrap();
            if *state != SubscriberState::Terminated {
                let adopted = match sub_state.state {
                    SubState::Active => Some(SubscriberState::Active),
                    SubState::Pending => Some(SubscriberState::Pending),
                    _ => None,
                };
                if let Some(adopted) = adopted {
                    if adopted != *state {
                        debug!(id = %self.dialog.id(), "state {} -> {}", *state, adopted);
                        entered_active = adopted == SubscriberState::Active;
                        *state = adopted;
                    }
                }
            }
        }
        if entered_active {
            info!(id = %self.dialog.id(), "subscription active");
            self.emit(SubscriberEvent::Active);
        }

        if let Some(expires) = sub_state.expires {
            let new_deadline = Instant::now() + Duration::from_secs(expires as u64);
            let moved_earlier = self
                .expires_at
                .lock()
                .unwrap()
                .saturating_duration_since(new_deadline)
                > RESCHEDULE_THRESHOLD;
            if moved_earlier && !is_final {
                debug!(id = %self.dialog.id(), expires, "peer shortened expiration, rescheduling refresh");
                *self.expires.lock().unwrap() = expires;
                *self.expires_at.lock().unwrap() = new_deadline;
                if expires > 0
                    && !self.terminated.load(Ordering::SeqCst)
                    && !self.unsubscribe_sent.load(Ordering::SeqCst)
                {
                    self.schedule_refresh(expires);
                }
            }
        }

        if !request.body.is_empty() {
            let body = String::from_utf8_lossy(&request.body).to_string();
            let content_type = content_type_value(&request.headers).unwrap_or_default();
            self.emit(SubscriberEvent::Notify {
                is_final,
                request: request.clone(),
                body,
                content_type,
            });
        }

        if is_final {
            self.dialog_terminated(
                SubscriberTerminationCode::ReceiveFinalNotify,
                sub_state.reason.clone(),
                sub_state.retry_after,
            );
        }
        Ok(())
    }

    /// The one terminal funnel: every failure path ends up here, and
    /// only the first caller gets through.
    fn dialog_terminated(
        &self,
        code: SubscriberTerminationCode,
        reason: Option<String>,
        retry_after: Option<u32>,
    ) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.state.lock().unwrap() = SubscriberState::Terminated;

        if let Some(timer) = self.refresh_timer.lock().unwrap().take() {
            self.useragent.timers.cancel(timer);
        }
        if let Some(timer) = self.unsubscribe_timer.lock().unwrap().take() {
            self.useragent.timers.cancel(timer);
        }

        if self.dialog_registered.load(Ordering::SeqCst) {
            // keep the dialog routable so a final NOTIFY crossing the
            // unsubscribe still reaches us
            self.useragent.timers.schedule(
                DIALOG_LINGER,
                ScheduledTask::SubscriberDestroy(self.weak_self.clone()),
            );
        }

        info!(id = %self.dialog.id(), %code, "subscription terminated");
        self.emit(SubscriberEvent::Terminated {
            code,
            reason,
            retry_after,
        });
    }
}
