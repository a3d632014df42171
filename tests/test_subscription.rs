//! Public-API round trip: a subscriber and a notifier wired together
//! through the transaction seams, the test relaying both directions.

use rsipevent::subscription::{
    Notifier, NotifierEvent, NotifierOptions, NotifierTerminationCode, Subscriber,
    SubscriberEvent, SubscriberOptions, SubscriberState, SubscriberTerminationCode,
};
use rsipevent::transaction::{IncomingRequest, PendingRequest, TransactionEvent};
use rsipevent::useragent::UserAgent;
use rsipevent::UserAgentBuilder;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

fn create_useragent(contact: &str) -> (UserAgent, UnboundedReceiver<PendingRequest>) {
    let (sender, receiver) = unbounded_channel();
    let useragent = UserAgentBuilder::new()
        .contact(rsip::Uri::try_from(contact).unwrap())
        .request_sender(sender)
        .build()
        .unwrap();
    (useragent, receiver)
}

fn incoming(request: rsip::Request) -> (IncomingRequest, UnboundedReceiver<rsip::Response>) {
    let (replies, receiver) = unbounded_channel();
    (IncomingRequest { request, replies }, receiver)
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

#[tokio::test]
async fn test_subscribe_notify_terminate_round_trip() {
    let (subscriber_ua, mut subscriber_out) =
        create_useragent("sip:alice@client.example.com;transport=ws");
    let (notifier_ua, mut notifier_out) =
        create_useragent("sip:weather@server.example.com;transport=ws");

    let subscriber = Subscriber::new(
        &subscriber_ua,
        SubscriberOptions {
            target: rsip::Uri::try_from("sip:weather@example.com").unwrap(),
            from: rsip::Uri::try_from("sip:alice@example.com").unwrap(),
            event: "weather".to_string(),
            event_id: None,
            accept: "application/text, text/plain".to_string(),
            expires: 3600,
            content_type: Some("text/plain".to_string()),
            extra_headers: vec![],
            allow_events: None,
            credential: None,
        },
    )
    .unwrap();

    let subscriber_events = Arc::new(Mutex::new(Vec::new()));
    let sink = subscriber_events.clone();
    subscriber.on_event(move |event| sink.lock().unwrap().push(event));

    subscriber
        .subscribe(Some("Please report the weather condition".to_string()))
        .unwrap();
    let pending_subscribe = subscriber_out.try_recv().unwrap();

    // notifier side picks up the SUBSCRIBE
    let (incoming_subscribe, mut subscribe_replies) = incoming(pending_subscribe.request.clone());
    let notifier = Notifier::new(
        &notifier_ua,
        incoming_subscribe,
        NotifierOptions {
            content_type: "text/plain".to_string(),
            pending: false,
            extra_headers: vec![],
            allow_events: None,
            credential: None,
        },
    )
    .unwrap();

    let notifier_events = Arc::new(Mutex::new(Vec::new()));
    let sink = notifier_events.clone();
    let handle = notifier.clone();
    notifier.on_event(move |event| {
        let is_unsubscribe = matches!(
            &event,
            NotifierEvent::Subscribe {
                is_unsubscribe: true,
                ..
            }
        );
        sink.lock().unwrap().push(event);
        if is_unsubscribe {
            handle
                .terminate(Some("+20..+24°C, no precipitation, light wind".to_string()), None, None)
                .unwrap();
        }
    });
    notifier.start().unwrap();

    // 200 OK back to the subscriber
    let ok = subscribe_replies.try_recv().unwrap();
    assert_eq!(ok.status_code, rsip::StatusCode::OK);
    pending_subscribe
        .events
        .send(TransactionEvent::Response(ok))
        .unwrap();
    settle().await;
    assert!(subscriber.id().is_established());

    // weather report travels subscriber-ward
    notifier
        .notify(Some("+20..+24°C, no precipitation, light wind".to_string()))
        .unwrap();
    let pending_notify = notifier_out.try_recv().unwrap();
    let (incoming_notify, mut notify_replies) = incoming(pending_notify.request.clone());
    subscriber_ua.dispatch(incoming_notify).unwrap();
    pending_notify
        .events
        .send(TransactionEvent::Response(notify_replies.try_recv().unwrap()))
        .unwrap();
    settle().await;
    assert_eq!(subscriber.state(), SubscriberState::Active);

    // unsubscribe; the handler above answers with the final NOTIFY
    subscriber.unsubscribe(None).unwrap();
    let pending_unsubscribe = subscriber_out.try_recv().unwrap();
    let (incoming_unsubscribe, mut unsubscribe_replies) =
        incoming(pending_unsubscribe.request.clone());
    notifier_ua.dispatch(incoming_unsubscribe).unwrap();
    pending_unsubscribe
        .events
        .send(TransactionEvent::Response(unsubscribe_replies.try_recv().unwrap()))
        .unwrap();

    let pending_final = notifier_out.try_recv().unwrap();
    let (incoming_final, mut final_replies) = incoming(pending_final.request.clone());
    subscriber_ua.dispatch(incoming_final).unwrap();
    pending_final
        .events
        .send(TransactionEvent::Response(final_replies.try_recv().unwrap()))
        .unwrap();
    settle().await;

    let subscriber_events = subscriber_events.lock().unwrap();
    assert!(matches!(
        subscriber_events.first(),
        Some(SubscriberEvent::DialogCreated(_))
    ));
    assert!(subscriber_events
        .iter()
        .any(|e| matches!(e, SubscriberEvent::Active)));
    assert!(matches!(
        subscriber_events.last(),
        Some(SubscriberEvent::Terminated {
            code: SubscriberTerminationCode::ReceiveFinalNotify,
            ..
        })
    ));

    let notifier_events = notifier_events.lock().unwrap();
    assert!(matches!(
        notifier_events.last(),
        Some(NotifierEvent::Terminated {
            code: NotifierTerminationCode::SendFinalNotify,
            send_final_notify: false,
        })
    ));
    assert_eq!(notifier_ua.dialog_count(), 0);
}
