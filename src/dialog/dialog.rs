use super::DialogId;
use crate::{
    rsip_ext::{extract_uri_from_contact, reversed_record_route},
    transaction::{Credential, PendingRequest, RequestSender, TransactionEventReceiver},
    Error, Result,
};
use rsip::{
    headers::Route,
    prelude::{HeadersExt, ToTypedHeader, UntypedHeader},
    Header, Param, Request, Response, StatusCode,
};
use std::sync::{
    atomic::{AtomicU32, Ordering},
    Mutex,
};
use tokio::sync::mpsc::unbounded_channel;
use tracing::{debug, info};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DialogRole {
    Uac,
    Uas,
}

/// Dialog substrate shared by subscriber and notifier.
///
/// Owns what RFC 3261 section 12 calls the dialog state: the id, the
/// two CSeq spaces, the remote target, and the route set. Requests and
/// responses for the subscription are composed here; sending goes
/// through the transaction seam, so this type never touches transport
/// and never adds a Via (the transaction layer owns it).
pub struct SubscriptionDialog {
    pub role: DialogRole,
    pub id: Mutex<DialogId>,
    pub local_seq: AtomicU32,
    pub remote_seq: AtomicU32,
    pub from: rsip::typed::From,
    pub to: Mutex<rsip::typed::To>,
    pub remote_uri: Mutex<rsip::Uri>,
    pub local_contact: rsip::typed::Contact,
    pub route_set: Mutex<Vec<Route>>,
    pub credential: Option<Credential>,
    pub(crate) request_sender: RequestSender,
}

impl SubscriptionDialog {
    /// Client-side dialog for an outgoing SUBSCRIBE. The remote tag is
    /// unknown until the peer answers.
    pub fn new_uac(
        call_id: String,
        from_tag: rsip::param::Tag,
        local_uri: rsip::Uri,
        target: rsip::Uri,
        local_contact: rsip::typed::Contact,
        credential: Option<Credential>,
        request_sender: RequestSender,
    ) -> Self {
        let from = rsip::typed::From {
            display_name: None,
            uri: local_uri,
            params: vec![],
        }
        .with_tag(from_tag.clone());

        let to = rsip::typed::To {
            display_name: None,
            uri: target.clone(),
            params: vec![],
        };

        let id = DialogId {
            call_id,
            from_tag: from_tag.value().to_string(),
            to_tag: "".to_string(),
        };

        SubscriptionDialog {
            role: DialogRole::Uac,
            id: Mutex::new(id),
            local_seq: AtomicU32::new(0),
            remote_seq: AtomicU32::new(0),
            from,
            to: Mutex::new(to),
            remote_uri: Mutex::new(target),
            local_contact,
            route_set: Mutex::new(vec![]),
            credential,
            request_sender,
        }
    }

    /// Server-side dialog built from an inbound SUBSCRIBE. Fails when
    /// the request carries no usable Contact, there is no remote target
    /// to notify then.
    pub fn new_uas(
        request: &Request,
        to_tag: rsip::param::Tag,
        local_contact: rsip::typed::Contact,
        credential: Option<Credential>,
        request_sender: RequestSender,
    ) -> Result<Self> {
        let mut id = DialogId::try_from(request)?;
        id.to_tag = to_tag.value().to_string();

        let remote_uri = match request.contact_header() {
            Ok(contact) => extract_uri_from_contact(contact.value())?,
            Err(_) => {
                return Err(Error::DialogError(
                    "SUBSCRIBE without Contact".to_string(),
                    id,
                ))
            }
        };

        let from = request.from_header()?.typed()?;
        let mut to = request.to_header()?.typed()?;
        if !to.params.iter().any(|p| matches!(p, Param::Tag(_))) {
            to.params.push(Param::Tag(to_tag));
        }

        // UAS route set keeps the Record-Route order as received.
        let route_set = request
            .headers
            .iter()
            .filter_map(|h| match h {
                Header::RecordRoute(rr) => Some(Route::from(rr.value().to_string())),
                _ => None,
            })
            .collect::<Vec<_>>();

        let remote_seq = request.cseq_header()?.seq()?;

        Ok(SubscriptionDialog {
            role: DialogRole::Uas,
            id: Mutex::new(id),
            local_seq: AtomicU32::new(0),
            remote_seq: AtomicU32::new(remote_seq),
            from,
            to: Mutex::new(to),
            remote_uri: Mutex::new(remote_uri),
            local_contact,
            route_set: Mutex::new(route_set),
            credential,
            request_sender,
        })
    }

    pub fn id(&self) -> DialogId {
        self.id.lock().unwrap().clone()
    }

    pub fn get_local_seq(&self) -> u32 {
        self.local_seq.load(Ordering::Relaxed)
    }

    pub fn increment_local_seq(&self) -> u32 {
        self.local_seq.fetch_add(1, Ordering::Relaxed);
        self.local_seq.load(Ordering::Relaxed)
    }

    /// Reject a request replaying an old CSeq; otherwise record it.
    pub fn validate_remote_seq(&self, cseq: u32) -> bool {
        let remote_seq = self.remote_seq.load(Ordering::Relaxed);
        if remote_seq > 0 && cseq < remote_seq {
            return false;
        }
        self.remote_seq
            .compare_exchange(remote_seq, cseq, Ordering::Relaxed, Ordering::Relaxed)
            .ok();
        true
    }

    pub fn update_remote_tag(&self, tag: &str) {
        self.id.lock().unwrap().to_tag = tag.to_string();
        let mut to = self.to.lock().unwrap();
        *to = to.clone().with_tag(tag.into());
    }

    pub fn set_remote_target(&self, uri: rsip::Uri) {
        *self.remote_uri.lock().unwrap() = uri;
    }

    /// Record-Route from the first 2xx, reversed, becomes the route set.
    pub fn update_route_set_from_response(&self, resp: &Response) {
        let route_set = reversed_record_route(&resp.headers);
        if !route_set.is_empty() {
            debug!(id = %self.id(), "route set updated from response");
        }
        *self.route_set.lock().unwrap() = route_set;
    }

    pub fn make_request(
        &self,
        method: rsip::Method,
        headers: Vec<Header>,
        body: Option<Vec<u8>>,
    ) -> Request {
        let mut headers = headers;
        headers.push(Header::CallId(
            self.id.lock().unwrap().call_id.clone().into(),
        ));
        let seq = self.increment_local_seq();
        headers.push(Header::CSeq(rsip::typed::CSeq { seq, method }.into()));

        let to = self.to.lock().unwrap().clone();
        match self.role {
            DialogRole::Uac => {
                headers.push(Header::From(self.from.clone().into()));
                headers.push(Header::To(to.into()));
            }
            DialogRole::Uas => {
                let from_from_to = rsip::typed::From {
                    display_name: to.display_name.clone(),
                    uri: to.uri.clone(),
                    params: to.params.clone(),
                };
                let from = self.from.clone();
                let to_from_from = rsip::typed::To {
                    display_name: from.display_name.clone(),
                    uri: from.uri.clone(),
                    params: from.params.clone(),
                };
                headers.push(Header::From(from_from_to.into()));
                headers.push(Header::To(to_from_from.into()));
            }
        }

        headers.push(self.local_contact.clone().into());
        {
            let route_set = self.route_set.lock().unwrap();
            headers.extend(route_set.iter().cloned().map(Header::Route));
        }
        headers.push(Header::MaxForwards(70.into()));
        headers.push(Header::ContentLength(
            body.as_ref().map_or(0u32, |b| b.len() as u32).into(),
        ));

        Request {
            method,
            uri: self.remote_uri.lock().unwrap().clone(),
            headers: headers.into(),
            body: body.unwrap_or_default(),
            version: rsip::Version::V2,
        }
    }

    pub fn make_response(
        &self,
        request: &Request,
        status: StatusCode,
        headers: Vec<Header>,
        body: Option<Vec<u8>>,
    ) -> Response {
        let local_tag = {
            let id = self.id.lock().unwrap();
            match self.role {
                DialogRole::Uac => id.from_tag.clone(),
                DialogRole::Uas => id.to_tag.clone(),
            }
        };

        let mut resp_headers = rsip::Headers::default();
        for header in request.headers.iter() {
            match header {
                Header::Via(via) => resp_headers.push(Header::Via(via.clone())),
                Header::From(from) => resp_headers.push(Header::From(from.clone())),
                Header::To(to) => {
                    let mut to = match to.clone().typed() {
                        Ok(to) => to,
                        Err(e) => {
                            info!("error parsing to header {}", e);
                            continue;
                        }
                    };
                    if !to.params.iter().any(|p| matches!(p, Param::Tag(_))) {
                        to.params.push(Param::Tag(local_tag.clone().into()));
                    }
                    resp_headers.push(Header::To(to.into()));
                }
                Header::CSeq(cseq) => resp_headers.push(Header::CSeq(cseq.clone())),
                Header::CallId(call_id) => resp_headers.push(Header::CallId(call_id.clone())),
                Header::RecordRoute(rr) => resp_headers.push(Header::RecordRoute(rr.clone())),
                _ => {}
            }
        }

        resp_headers.push(self.local_contact.clone().into());
        for header in headers {
            resp_headers.unique_push(header);
        }

        resp_headers.retain(|h| !matches!(h, Header::ContentLength(_)));
        resp_headers.push(Header::ContentLength(
            body.as_ref().map_or(0u32, |b| b.len() as u32).into(),
        ));

        Response {
            status_code: status,
            headers: resp_headers,
            body: body.unwrap_or_default(),
            version: request.version().clone(),
        }
    }

    /// Compose and hand a request to the transaction layer; the caller
    /// consumes the returned event stream.
    pub fn send_request(
        &self,
        method: rsip::Method,
        headers: Vec<Header>,
        body: Option<Vec<u8>>,
    ) -> Result<TransactionEventReceiver> {
        let request = self.make_request(method, headers, body);
        let (events, receiver) = unbounded_channel();
        debug!(id = %self.id(), %method, "sending in-dialog request");
        self.request_sender.send(PendingRequest {
            request,
            credential: self.credential.clone(),
            events,
        })?;
        Ok(receiver)
    }
}
