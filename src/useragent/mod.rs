use crate::{
    dialog::DialogId,
    rsip_ext::make_plain_response,
    subscription::{notifier::NotifierInner, subscriber::SubscriberInner, Notifier, Subscriber},
    timer::Timer,
    transaction::{make_instance_id, IncomingRequest, RequestSender},
    Error, Result,
};
use std::{
    collections::HashMap,
    sync::{Arc, RwLock, Weak},
    time::{Duration, Instant},
};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const TIMER_INTERVAL: Duration = Duration::from_millis(200);

/// Either side of a subscription, as stored in the dialog table.
#[derive(Clone)]
pub enum Subscription {
    Subscriber(Subscriber),
    Notifier(Notifier),
}

impl Subscription {
    pub fn id(&self) -> DialogId {
        match self {
            Subscription::Subscriber(s) => s.id(),
            Subscription::Notifier(n) => n.id(),
        }
    }

    pub(crate) fn receive_request(&self, incoming: IncomingRequest) -> Result<()> {
        match self {
            Subscription::Subscriber(s) => s.receive_request(incoming),
            Subscription::Notifier(n) => n.receive_request(incoming),
        }
    }
}

/// Work the timer wheel owes a subscription. Weak references keep the
/// wheel from pinning inners whose subscription is already gone.
pub(crate) enum ScheduledTask {
    SubscriberRefresh(Weak<SubscriberInner>),
    SubscriberUnsubscribeGuard(Weak<SubscriberInner>),
    SubscriberDestroy(Weak<SubscriberInner>),
    NotifierExpiry(Weak<NotifierInner>),
}

pub struct UserAgentBuilder {
    contact: Option<rsip::Uri>,
    instance_id: Option<String>,
    request_sender: Option<RequestSender>,
    cancel_token: Option<CancellationToken>,
    timer_interval: Option<Duration>,
}

pub struct UserAgentInner {
    pub contact: rsip::typed::Contact,
    pub(crate) request_sender: RequestSender,
    pub(crate) timers: Timer<ScheduledTask>,
    subscriptions: RwLock<HashMap<DialogId, Subscription>>,
    cancel_token: CancellationToken,
    timer_interval: Duration,
}

pub type UserAgentRef = Arc<UserAgentInner>;

/// Owner of the subscription dialog table and the timer wheel.
///
/// The surrounding stack feeds in-dialog requests through `dispatch`
/// and consumes outbound requests from the channel behind
/// `request_sender`; `serve` drives the timers until `shutdown`.
#[derive(Clone)]
pub struct UserAgent {
    pub inner: UserAgentRef,
}

impl UserAgentBuilder {
    pub fn new() -> Self {
        UserAgentBuilder {
            contact: None,
            instance_id: None,
            request_sender: None,
            cancel_token: None,
            timer_interval: None,
        }
    }

    pub fn contact(&mut self, contact: rsip::Uri) -> &mut Self {
        self.contact.replace(contact);
        self
    }

    pub fn instance_id(&mut self, instance_id: &str) -> &mut Self {
        self.instance_id.replace(instance_id.to_string());
        self
    }

    pub fn request_sender(&mut self, request_sender: RequestSender) -> &mut Self {
        self.request_sender.replace(request_sender);
        self
    }

    pub fn cancel_token(&mut self, cancel_token: CancellationToken) -> &mut Self {
        self.cancel_token.replace(cancel_token);
        self
    }

    pub fn timer_interval(&mut self, timer_interval: Duration) -> &mut Self {
        self.timer_interval.replace(timer_interval);
        self
    }

    pub fn build(&mut self) -> Result<UserAgent> {
        let contact_uri = self
            .contact
            .take()
            .ok_or_else(|| Error::InvalidConfig("contact is required".to_string()))?;
        let request_sender = self
            .request_sender
            .take()
            .ok_or_else(|| Error::InvalidConfig("request_sender is required".to_string()))?;

        let instance_id = self.instance_id.take().unwrap_or_else(make_instance_id);
        let contact = rsip::typed::Contact {
            display_name: None,
            uri: contact_uri,
            params: vec![rsip::Param::Other(
                "+sip.instance".into(),
                Some(format!("\"<urn:uuid:{}>\"", instance_id).into()),
            )],
        };

        Ok(UserAgent {
            inner: Arc::new(UserAgentInner {
                contact,
                request_sender,
                timers: Timer::new(),
                subscriptions: RwLock::new(HashMap::new()),
                cancel_token: self.cancel_token.take().unwrap_or_default(),
                timer_interval: self.timer_interval.take().unwrap_or(TIMER_INTERVAL),
            }),
        })
    }
}

impl Default for UserAgentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl UserAgentInner {
    pub(crate) fn new_dialog(&self, id: DialogId, subscription: Subscription) {
        debug!(%id, "dialog registered");
        self.subscriptions
            .write()
            .unwrap()
            .insert(id, subscription);
    }

    pub(crate) fn destroy_dialog(&self, id: &DialogId) {
        if self.subscriptions.write().unwrap().remove(id).is_some() {
            debug!(%id, "dialog destroyed");
        }
    }

    /// Run everything due at `now`. Tests drive this with a virtual
    /// clock; `serve` drives it with the wall clock.
    pub fn poll_timers(&self, now: Instant) {
        for task in self.timers.poll(now) {
            match task {
                ScheduledTask::SubscriberRefresh(inner) => {
                    if let Some(inner) = inner.upgrade() {
                        inner.refresh();
                    }
                }
                ScheduledTask::SubscriberUnsubscribeGuard(inner) => {
                    if let Some(inner) = inner.upgrade() {
                        inner.on_unsubscribe_guard();
                    }
                }
                ScheduledTask::SubscriberDestroy(inner) => {
                    if let Some(inner) = inner.upgrade() {
                        self.destroy_dialog(&inner.dialog.id());
                    }
                }
                ScheduledTask::NotifierExpiry(inner) => {
                    if let Some(inner) = inner.upgrade() {
                        inner.on_expiry();
                    }
                }
            }
        }
    }
}

impl UserAgent {
    /// Route an inbound in-dialog request to its subscription. Requests
    /// matching no registered dialog get a 481.
    pub fn dispatch(&self, incoming: IncomingRequest) -> Result<()> {
        let id = DialogId::try_from(&incoming.request)?;
        let subscription = self.inner.subscriptions.read().unwrap().get(&id).cloned();
        match subscription {
            Some(subscription) => subscription.receive_request(incoming),
            None => {
                info!(%id, method = %incoming.request.method, "no subscription for request, replying 481");
                let resp = make_plain_response(
                    &incoming.request,
                    rsip::StatusCode::CallTransactionDoesNotExist,
                );
                incoming.replies.send(resp).map_err(Into::into)
            }
        }
    }

    pub fn dialog_count(&self) -> usize {
        self.inner.subscriptions.read().unwrap().len()
    }

    pub fn poll_timers(&self, now: Instant) {
        self.inner.poll_timers(now)
    }

    pub async fn serve(&self) {
        loop {
            select! {
                _ = self.inner.cancel_token.cancelled() => {
                    info!("useragent cancelled");
                    break;
                }
                _ = tokio::time::sleep(self.inner.timer_interval) => {
                    self.inner.poll_timers(Instant::now());
                }
            }
        }
        info!("useragent shutdown");
    }

    pub fn shutdown(&self) {
        info!("useragent shutdown requested");
        self.inner.cancel_token.cancel();
    }
}
