//! End-to-end pipeline tests: outbox → in-memory broker → consumer → mailer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures::{Stream, StreamExt};
use tokio::sync::watch;

use deskmail::error::{QueueError, SendError};
use deskmail::outbox::{password_reset_email, verification_email};
use deskmail::{
    consume_queue, Acknowledger, ConsumerExit, Dispatcher, EmailEvent, EmailQueue,
    EventPublisher, Inbound, Mailer, OutboxPublisher, OutgoingMail, TemplateRenderer,
};

const TEMPLATE_DIR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/templates");
const APP_URL: &str = "http://localhost:3000";

/// Routes encoded events to one channel per queue.
struct MemoryBroker {
    queues: HashMap<EmailQueue, UnboundedSender<Vec<u8>>>,
}

impl MemoryBroker {
    fn new() -> (Self, HashMap<EmailQueue, UnboundedReceiver<Vec<u8>>>) {
        let mut queues = HashMap::new();
        let mut receivers = HashMap::new();
        for queue in EmailQueue::ALL {
            let (tx, rx) = unbounded();
            queues.insert(queue, tx);
            receivers.insert(queue, rx);
        }
        (Self { queues }, receivers)
    }
}

#[async_trait]
impl EventPublisher for MemoryBroker {
    async fn publish_email_event(
        &self,
        queue: EmailQueue,
        event: &EmailEvent,
    ) -> Result<(), QueueError> {
        let body = event.encode().map_err(QueueError::Encode)?;
        self.queues[&queue]
            .unbounded_send(body)
            .map_err(|_| QueueError::NotInitialized)
    }
}

#[derive(Default)]
struct MailSink {
    sent: Mutex<Vec<OutgoingMail>>,
}

#[async_trait]
impl Mailer for MailSink {
    async fn send_mail(&self, mail: OutgoingMail) -> Result<(), SendError> {
        self.sent.lock().unwrap().push(mail);
        Ok(())
    }
}

#[derive(Default)]
struct Ledger {
    acks: AtomicUsize,
    rejects: AtomicUsize,
}

#[async_trait]
impl Acknowledger for Ledger {
    async fn acknowledge(&self) -> Result<(), lapin::Error> {
        self.acks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reject(&self) -> Result<(), lapin::Error> {
        self.rejects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn deliveries(
    rx: UnboundedReceiver<Vec<u8>>,
    ledger: Arc<Ledger>,
) -> impl Stream<Item = Result<Inbound<Arc<Ledger>>, lapin::Error>> + Unpin {
    rx.enumerate().map(move |(i, data)| {
        Ok(Inbound {
            delivery_tag: i as u64 + 1,
            data,
            acker: Arc::clone(&ledger),
        })
    })
}

fn dispatcher(mailer: Arc<MailSink>) -> Arc<Dispatcher> {
    let renderer = TemplateRenderer::new(TEMPLATE_DIR);
    Arc::new(Dispatcher::new(renderer, mailer, "noreply@example.com"))
}

#[tokio::test]
async fn test_verification_email_end_to_end() {
    let (broker, mut receivers) = MemoryBroker::new();
    let outbox = OutboxPublisher::new(broker);
    let mailer = Arc::new(MailSink::default());
    let ledger = Arc::new(Ledger::default());

    let (queue, draft) = verification_email("a@b.com", "Ada", APP_URL, "tok123").unwrap();
    let event = outbox.publish_email_event(queue, draft).await.unwrap();
    drop(outbox);

    let rx = receivers.remove(&EmailQueue::UserRegistration).unwrap();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let report = consume_queue(
        EmailQueue::UserRegistration,
        deliveries(rx, ledger.clone()),
        dispatcher(mailer.clone()),
        1,
        shutdown_rx,
    )
    .await;

    assert_eq!(report.exit, ConsumerExit::StreamClosed);
    assert_eq!(report.sent, 1);
    assert_eq!(ledger.acks.load(Ordering::SeqCst), 1);
    assert_eq!(ledger.rejects.load(Ordering::SeqCst), 0);

    let sent = mailer.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "a@b.com");
    assert_eq!(sent[0].from, "noreply@example.com");
    assert_eq!(sent[0].subject, "Verify your email address");
    assert!(sent[0].html.contains("Ada"));

    let url = event.template_data["VerificationURL"].as_str().unwrap();
    assert_eq!(
        url,
        "http://localhost:3000/verify-email?email=a%40b.com&token=tok123"
    );
    assert!(sent[0].html.contains(&handlebars::html_escape(url)));
}

#[tokio::test]
async fn test_queues_are_consumed_independently() {
    let (broker, mut receivers) = MemoryBroker::new();
    let outbox = OutboxPublisher::new(broker);

    for i in 0..3 {
        let (queue, draft) =
            verification_email(&format!("new{i}@example.com"), "New", APP_URL, "t").unwrap();
        outbox.publish_email_event(queue, draft).await.unwrap();

        let (queue, draft) =
            password_reset_email(&format!("old{i}@example.com"), APP_URL, "t").unwrap();
        outbox.publish_email_event(queue, draft).await.unwrap();
    }
    drop(outbox);

    let registration_mail = Arc::new(MailSink::default());
    let reset_mail = Arc::new(MailSink::default());
    let registration_ledger = Arc::new(Ledger::default());
    let reset_ledger = Arc::new(Ledger::default());
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let registration = tokio::spawn(consume_queue(
        EmailQueue::UserRegistration,
        deliveries(
            receivers.remove(&EmailQueue::UserRegistration).unwrap(),
            registration_ledger.clone(),
        ),
        dispatcher(registration_mail.clone()),
        1,
        shutdown_rx.clone(),
    ));
    let reset = tokio::spawn(consume_queue(
        EmailQueue::PasswordReset,
        deliveries(
            receivers.remove(&EmailQueue::PasswordReset).unwrap(),
            reset_ledger.clone(),
        ),
        dispatcher(reset_mail.clone()),
        1,
        shutdown_rx,
    ));

    let registration = registration.await.unwrap();
    let reset = reset.await.unwrap();

    assert_eq!(registration.sent, 3);
    assert_eq!(reset.sent, 3);
    assert_eq!(registration_ledger.acks.load(Ordering::SeqCst), 3);
    assert_eq!(reset_ledger.acks.load(Ordering::SeqCst), 3);

    for mail in registration_mail.sent.lock().unwrap().iter() {
        assert!(mail.to.starts_with("new"));
        assert_eq!(mail.subject, "Verify your email address");
    }
    for mail in reset_mail.sent.lock().unwrap().iter() {
        assert!(mail.to.starts_with("old"));
        assert_eq!(mail.subject, "Reset your password");
        assert!(mail.html.contains("forgot-password"));
    }
}

#[tokio::test]
async fn test_stale_event_is_acked_without_sending() {
    let (broker, mut receivers) = MemoryBroker::new();
    let (queue, draft) = password_reset_email("late@example.com", APP_URL, "t").unwrap();
    let stale = draft.stamp(deskmail::dispatch::now_ms() - 301_000);
    broker.publish_email_event(queue, &stale).await.unwrap();
    drop(broker);

    let mailer = Arc::new(MailSink::default());
    let ledger = Arc::new(Ledger::default());
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let report = consume_queue(
        EmailQueue::PasswordReset,
        deliveries(
            receivers.remove(&EmailQueue::PasswordReset).unwrap(),
            ledger.clone(),
        ),
        dispatcher(mailer.clone()),
        1,
        shutdown_rx,
    )
    .await;

    assert_eq!(report.discarded, 1);
    assert_eq!(report.sent, 0);
    assert_eq!(ledger.acks.load(Ordering::SeqCst), 1);
    assert!(mailer.sent.lock().unwrap().is_empty());
}
