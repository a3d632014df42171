use crate::Result;
use rsip::{headers::Route, prelude::UntypedHeader, Header, Headers};

/// Look up a header carried as `Header::Other`, case-insensitively.
///
/// RFC 6665 headers (Event, Subscription-State, Allow-Events) have no
/// dedicated rsip variant in this stack, both sides carry them as raw
/// name/value pairs.
pub fn header_value(headers: &Headers, name: &str) -> Option<String> {
    headers.iter().find_map(|h| match h {
        Header::Other(n, v) if n.eq_ignore_ascii_case(name) => Some(v.clone()),
        _ => None,
    })
}

pub fn content_type_value(headers: &Headers) -> Option<String> {
    headers.iter().find_map(|h| match h {
        Header::ContentType(ct) => Some(ct.value().to_string()),
        _ => None,
    })
}

/// Extract the URI from a Contact header value, with or without angle
/// brackets or a display name.
pub fn extract_uri_from_contact(value: &str) -> Result<rsip::Uri> {
    let raw = match (value.find('<'), value.find('>')) {
        (Some(start), Some(end)) if start < end => &value[start + 1..end],
        _ => value.trim(),
    };
    rsip::Uri::try_from(raw).map_err(Into::into)
}

/// Collect Record-Route entries in reverse order, the route set a UAC
/// derives from a 2xx response.
pub fn reversed_record_route(headers: &Headers) -> Vec<Route> {
    let mut route_set = headers
        .iter()
        .filter_map(|h| match h {
            Header::RecordRoute(rr) => Some(Route::from(rr.value().to_string())),
            _ => None,
        })
        .collect::<Vec<_>>();
    route_set.reverse();
    route_set
}

/// Build a response outside any dialog context, echoing the headers a
/// response must carry per RFC 3261.
pub fn make_plain_response(req: &rsip::Request, status_code: rsip::StatusCode) -> rsip::Response {
    let mut headers = req.headers.clone();
    headers.retain(|h| {
        matches!(
            h,
            Header::Via(_)
                | Header::CallId(_)
                | Header::From(_)
                | Header::To(_)
                | Header::CSeq(_)
        )
    });
    headers.push(Header::ContentLength(0.into()));
    rsip::Response {
        status_code,
        version: req.version().clone(),
        headers,
        body: vec![],
    }
}
