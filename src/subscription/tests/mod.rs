//! Subscription state machine tests, driven entirely through the
//! channel seams: captured outbound requests play the transaction
//! layer, handcrafted inbound requests play the peer.

use crate::transaction::{IncomingRequest, RequestReceiver};
use crate::useragent::{UserAgent, UserAgentBuilder};
use rsip::{headers::*, prelude::UntypedHeader, Header, Request, Response, StatusCode};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};


pub(super) fn create_useragent(contact: &str) -> (UserAgent, RequestReceiver) {
    let (sender, receiver) = unbounded_channel();
    let useragent = UserAgentBuilder::new()
        .contact(rsip::Uri::try_from(contact).unwrap())
        .instance_id("f47ac10b-58cc-4372-a567-0e02b2c3d479")
        .request_sender(sender)
        .build()
        .unwrap();
    (useragent, receiver)
}

/// Shared event sink for listener closures.
pub(super) struct Events<E>(Arc<Mutex<Vec<E>>>);

impl<E> Events<E> {
    pub(super) fn new() -> Self {
        Events(Arc::new(Mutex::new(Vec::new())))
    }

    pub(super) fn push(&self, event: E) {
        self.0.lock().unwrap().push(event);
    }

    pub(super) fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

impl<E: Clone> Events<E> {
    pub(super) fn all(&self) -> Vec<E> {
        self.0.lock().unwrap().clone()
    }
}

impl<E> Clone for Events<E> {
    fn clone(&self) -> Self {
        Events(self.0.clone())
    }
}

/// Give spawned transaction pumps a chance to run.
pub(super) async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

pub(super) fn incoming(request: Request) -> (IncomingRequest, UnboundedReceiver<Response>) {
    let (replies, receiver) = unbounded_channel();
    (IncomingRequest { request, replies }, receiver)
}

/// 2xx to a captured SUBSCRIBE, as the notifier's stack would send it.
pub(super) fn ok_response(request: &Request, to_tag: &str, expires: Option<u32>) -> Response {
    response_to(request, StatusCode::OK, to_tag, expires)
}

pub(super) fn response_to(
    request: &Request,
    status: StatusCode,
    to_tag: &str,
    expires: Option<u32>,
) -> Response {
    let mut headers = request
        .headers
        .iter()
        .filter(|h| {
            matches!(
                h,
                Header::Via(_) | Header::From(_) | Header::CSeq(_) | Header::CallId(_)
            )
        })
        .cloned()
        .collect::<Vec<_>>();
    let to = rsip::prelude::HeadersExt::to_header(request)
        .map(|to| to.value().to_string())
        .unwrap_or_else(|_| "<sip:weather@example.com>".to_string());
    headers.push(To::new(format!("{};tag={}", to, to_tag)).into());
    headers.push(Contact::new("<sip:weather@server.example.com>").into());
    if let Some(expires) = expires {
        headers.push(Header::Expires(expires.into()));
    }
    Response {
        status_code: status,
        version: rsip::Version::V2,
        headers: headers.into(),
        body: vec![],
    }
}

/// NOTIFY as the subscriber receives it: the notifier's tag travels in
/// From, the subscriber's own tag in To.
pub(super) fn notify_request(
    call_id: &str,
    notifier_tag: &str,
    subscriber_tag: &str,
    event: &str,
    sub_state: &str,
    body: &str,
    content_type: Option<&str>,
) -> Request {
    let mut headers: Vec<Header> = vec![
        Via::new("SIP/2.0/WSS server.example.com;branch=z9hG4bKn1").into(),
        CSeq::new("1 NOTIFY").into(),
        From::new(&format!("<sip:weather@example.com>;tag={}", notifier_tag)).into(),
        To::new(&format!("<sip:alice@example.com>;tag={}", subscriber_tag)).into(),
        CallId::new(call_id).into(),
        Contact::new("<sip:weather@server.example.com>").into(),
        Header::Other("Event".into(), event.into()),
        Header::Other("Subscription-State".into(), sub_state.into()),
        MaxForwards::new("70").into(),
    ];
    if let Some(content_type) = content_type {
        headers.push(Header::ContentType(content_type.into()));
    }
    Request {
        method: rsip::Method::Notify,
        uri: rsip::Uri::try_from("sip:alice@client.example.com").unwrap(),
        headers: headers.into(),
        version: rsip::Version::V2,
        body: body.as_bytes().to_vec(),
    }
}

/// Inbound SUBSCRIBE as a notifier's stack would hand it over.
pub(super) fn subscribe_request(
    call_id: &str,
    from_tag: &str,
    event: &str,
    expires: Option<u32>,
    body: &str,
    content_type: Option<&str>,
) -> Request {
    let mut headers: Vec<Header> = vec![
        Via::new("SIP/2.0/WSS client.example.com;branch=z9hG4bKs1").into(),
        CSeq::new("1 SUBSCRIBE").into(),
        From::new(&format!("<sip:alice@example.com>;tag={}", from_tag)).into(),
        To::new("<sip:weather@example.com>").into(),
        CallId::new(call_id).into(),
        Contact::new("<sip:alice@client.example.com;transport=ws>").into(),
        Header::Other("Event".into(), event.into()),
        Header::Other("Accept".into(), "application/text, text/plain".into()),
        MaxForwards::new("70").into(),
    ];
    if let Some(expires) = expires {
        headers.push(Header::Expires(expires.into()));
    }
    if let Some(content_type) = content_type {
        headers.push(Header::ContentType(content_type.into()));
    }
    Request {
        method: rsip::Method::Subscribe,
        uri: rsip::Uri::try_from("sip:weather@example.com").unwrap(),
        headers: headers.into(),
        version: rsip::Version::V2,
        body: body.as_bytes().to_vec(),
    }
}
