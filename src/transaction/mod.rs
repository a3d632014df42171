use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

pub const TAG_LEN: usize = 8;
pub const CALL_ID_LEN: usize = 22;

/// Outcome of an outbound request, reported by the transaction layer.
///
/// The core owns no retransmission and no authentication challenge
/// handling. The lower layer retries a challenged request itself and
/// signals `Authenticated` so the dialog can keep its CSeq in step; a
/// 401/407 surfacing here means the retry was already spent.
#[derive(Debug)]
pub enum TransactionEvent {
    Authenticated,
    Response(rsip::Response),
    Timeout,
    TransportError(String),
}

pub type TransactionEventSender = UnboundedSender<TransactionEvent>;
pub type TransactionEventReceiver = UnboundedReceiver<TransactionEvent>;

/// Digest credential handed through to the transaction layer, which
/// answers 401/407 challenges on the core's behalf.
#[derive(Clone)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .finish()
    }
}

/// An outbound request on its way to the transaction layer, paired with
/// the channel its transaction events come back on.
pub struct PendingRequest {
    pub request: rsip::Request,
    pub credential: Option<Credential>,
    pub events: TransactionEventSender,
}

pub type RequestSender = UnboundedSender<PendingRequest>;
pub type RequestReceiver = UnboundedReceiver<PendingRequest>;

/// An inbound in-dialog request as handed over by the dialog layer,
/// paired with the channel responses travel back on.
#[derive(Clone)]
pub struct IncomingRequest {
    pub request: rsip::Request,
    pub replies: UnboundedSender<rsip::Response>,
}

pub fn random_text(count: usize) -> String {
    use rand::Rng;
    rand::rng()
        .sample_iter(rand::distr::Alphanumeric)
        .take(count)
        .map(char::from)
        .collect::<String>()
}

pub fn make_tag() -> rsip::param::Tag {
    random_text(TAG_LEN).into()
}

pub fn make_call_id(domain: Option<&str>) -> rsip::headers::CallId {
    format!(
        "{}@{}",
        random_text(CALL_ID_LEN),
        domain.unwrap_or("rsipevent.local")
    )
    .into()
}

pub fn make_instance_id() -> String {
    format!(
        "{}-{}-{}-{}-{}",
        random_text(8),
        random_text(4),
        random_text(4),
        random_text(4),
        random_text(12)
    )
    .to_lowercase()
}
