//! Orchestrates login, messaging, and zaps over one relay connection.

use std::collections::BTreeMap;
use std::sync::Arc;

use secp256k1::SecretKey;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::cipher;
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::event::{self, Event, EventDraft, Tag, KIND_DM};
use crate::identity::Identity;
use crate::relay::{Filter, RelayLink, SubscriptionHandle};
use crate::zap::{self, PaymentExecutor, PaymentOutcome};

/// One logged-in session: identity, relay link, standing DM subscription,
/// and an ordered append-only stream of display lines.
///
/// All display lines flow through a single channel, so the UI sees incoming
/// messages, local echoes, and zap statuses in one consistent order.
pub struct Session {
    identity: Identity,
    relay: RelayLink,
    subscription: SubscriptionHandle,
    lines_tx: mpsc::UnboundedSender<String>,
    lines_rx: mpsc::UnboundedReceiver<String>,
    http: reqwest::Client,
    executor: Option<Arc<dyn PaymentExecutor>>,
    settings: Settings,
}

impl Session {
    /// Import the identity, connect to the relay, and open the standing
    /// subscription for direct messages addressed to self. Failures here
    /// abort the login; nothing is left running.
    pub async fn login(settings: Settings, nsec: &str) -> Result<Self> {
        Self::login_with_executor(settings, nsec, None).await
    }

    /// `login` with an explicit payment executor capability.
    pub async fn login_with_executor(
        settings: Settings,
        nsec: &str,
        executor: Option<Arc<dyn PaymentExecutor>>,
    ) -> Result<Self> {
        let identity = Identity::from_nsec(nsec)?;
        let relay = RelayLink::connect(
            &settings.relay_url,
            settings.tor_socks.as_deref(),
            settings.connect_timeout,
        )
        .await?;

        let mut tags = BTreeMap::new();
        tags.insert("#p".to_string(), vec![identity.public_key().to_string()]);
        let filter = Filter {
            kinds: Some(vec![KIND_DM]),
            tags,
            ..Default::default()
        };
        let (subscription, events) = relay.subscribe(&filter).await?;

        let (lines_tx, lines_rx) = mpsc::unbounded_channel();
        tokio::spawn(deliver(
            events,
            identity.keypair().secret_key(),
            lines_tx.clone(),
        ));

        let http = reqwest::Client::builder()
            .timeout(settings.http_timeout)
            .build()
            .map_err(|e| Error::Connection(format!("http client: {e}")))?;

        Ok(Self {
            identity,
            relay,
            subscription,
            lines_tx,
            lines_rx,
            http,
            executor,
            settings,
        })
    }

    /// Hex public key of the logged-in identity.
    pub fn public_key(&self) -> &str {
        self.identity.public_key()
    }

    /// Encrypt, sign, and publish a direct message, then echo it locally.
    /// No acknowledgment is awaited; a failure aborts only this send.
    pub async fn send_message(&self, peer: &str, text: &str) -> Result<()> {
        if peer.is_empty() {
            return Err(Error::Decode("peer public key required".into()));
        }
        if text.trim().is_empty() {
            return Err(Error::Decode("message is blank".into()));
        }
        let shared = cipher::shared_secret(&self.identity.keypair().secret_key(), peer)?;
        let envelope = cipher::encrypt(&shared, text);
        let draft = EventDraft::new(
            KIND_DM,
            self.identity.public_key(),
            event::unix_now(),
            vec![Tag::p(peer)],
            envelope,
        );
        let signed = draft.sign(self.identity.keypair())?;
        self.relay.publish(&signed).await?;
        self.push_line(format!("Me: {text}"));
        Ok(())
    }

    /// Run the zap flow end to end. A missing endpoint reports and publishes
    /// nothing; any failure aborts only the zap, leaving the session intact.
    pub async fn send_zap(&self, peer: &str, amount_sats: u64) -> Result<()> {
        if peer.is_empty() {
            return Err(Error::Decode("peer public key required".into()));
        }
        let endpoint =
            zap::resolve_endpoint(&self.relay, peer, self.settings.query_timeout).await?;
        let Some(endpoint) = endpoint else {
            self.push_line("no zap endpoint for peer".into());
            return Ok(());
        };
        let url = zap::normalize_endpoint(&endpoint);
        let signed = zap::zap_request(
            &self.identity,
            peer,
            amount_sats,
            &self.settings.zap_relays,
            &self.settings.zap_comment,
        )?;
        let invoice = zap::request_invoice(&self.http, &url, amount_sats, &signed).await?;
        match zap::execute_payment(self.executor.as_deref(), invoice).await {
            PaymentOutcome::Paid => {
                self.push_line(format!("zap sent ({amount_sats} sats)"));
            }
            PaymentOutcome::Manual(pr) => {
                self.push_line(format!("invoice (pay manually): {pr}"));
            }
        }
        Ok(())
    }

    /// Next display line, in order. `None` once the session is logged out
    /// and every pending line has been drained.
    pub async fn next_line(&mut self) -> Option<String> {
        self.lines_rx.recv().await
    }

    /// Cancel the subscription, close the link, discard identity material.
    pub async fn logout(mut self) {
        self.subscription.cancel().await;
        self.relay.close().await;
        // Identity zeroes its secret on drop.
    }

    fn push_line(&self, line: String) {
        let _ = self.lines_tx.send(line);
    }
}

/// Receive loop for the standing subscription: verify, decrypt, display.
/// Bad events are logged and skipped; nothing here ends the subscription.
async fn deliver(
    mut events: mpsc::UnboundedReceiver<Event>,
    secret: SecretKey,
    lines: mpsc::UnboundedSender<String>,
) {
    while let Some(ev) = events.recv().await {
        if let Err(e) = ev.verify() {
            warn!("dropping event {}: {e}", ev.id);
            continue;
        }
        let shared = match cipher::shared_secret(&secret, &ev.pubkey) {
            Ok(s) => s,
            Err(e) => {
                warn!("dropping event {}: {e}", ev.id);
                continue;
            }
        };
        match cipher::decrypt(&shared, &ev.content) {
            Ok(text) => {
                let author = ev.pubkey.get(..16).unwrap_or(&ev.pubkey);
                if lines.send(format!("{author}...: {text}")).is_err() {
                    break;
                }
            }
            Err(e) => debug!("dropping undecryptable event {}: {e}", ev.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;
    use tokio_tungstenite::{accept_async, tungstenite::Message as TMsg};

    fn settings(relay_url: String) -> Settings {
        Settings {
            relay_url,
            tor_socks: None,
            zap_relays: vec!["wss://zap.example".into()],
            zap_comment: "Zap!".into(),
            query_timeout: Duration::from_secs(5),
            http_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
        }
    }

    fn dm_event(from: &Identity, to: &Identity, text: &str) -> Event {
        let shared =
            cipher::shared_secret(&from.keypair().secret_key(), to.public_key()).unwrap();
        EventDraft::new(
            KIND_DM,
            from.public_key(),
            42,
            vec![Tag::p(to.public_key())],
            cipher::encrypt(&shared, text),
        )
        .sign(from.keypair())
        .unwrap()
    }

    #[tokio::test]
    async fn login_subscribes_to_own_dms() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (req_tx, req_rx) = oneshot::channel();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            if let Some(Ok(TMsg::Text(txt))) = ws.next().await {
                let _ = req_tx.send(txt);
            }
        });

        let (id, nsec) = Identity::generate().unwrap();
        let session = Session::login(settings(format!("ws://{addr}")), &nsec)
            .await
            .unwrap();
        assert_eq!(session.public_key(), id.public_key());

        let req = req_rx.await.unwrap();
        let val: Value = serde_json::from_str(&req).unwrap();
        assert_eq!(val[0], "REQ");
        assert_eq!(val[2]["kinds"], json!([4]));
        assert_eq!(val[2]["#p"], json!([id.public_key()]));
        session.logout().await;
    }

    #[tokio::test]
    async fn incoming_dm_becomes_display_line() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (me, nsec) = Identity::generate().unwrap();
        let (peer, _) = Identity::generate().unwrap();
        let good = dm_event(&peer, &me, "hello there");
        let mut forged = dm_event(&peer, &me, "forged");
        forged.content = "tampered".into();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let msg = ws.next().await.unwrap().unwrap();
            let val: Value = serde_json::from_str(msg.to_text().unwrap()).unwrap();
            let sub = val[1].as_str().unwrap().to_string();
            // A tampered event first: it must be dropped, not displayed.
            ws.send(TMsg::Text(json!(["EVENT", sub, forged]).to_string()))
                .await
                .unwrap();
            ws.send(TMsg::Text(json!(["EVENT", sub, good]).to_string()))
                .await
                .unwrap();
        });

        let mut session = Session::login(settings(format!("ws://{addr}")), &nsec)
            .await
            .unwrap();
        let line = session.next_line().await.unwrap();
        assert!(line.ends_with(": hello there"));
        assert!(line.starts_with(&peer.public_key()[..16]));
        session.logout().await;
    }

    #[tokio::test]
    async fn undecryptable_dm_is_skipped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (me, nsec) = Identity::generate().unwrap();
        let (peer, _) = Identity::generate().unwrap();
        // Valid signature but garbage content: decryption fails, event skipped.
        let garbage = EventDraft::new(
            KIND_DM,
            peer.public_key(),
            42,
            vec![Tag::p(me.public_key())],
            "not an envelope",
        )
        .sign(peer.keypair())
        .unwrap();
        let good = dm_event(&peer, &me, "after the bad one");
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let msg = ws.next().await.unwrap().unwrap();
            let val: Value = serde_json::from_str(msg.to_text().unwrap()).unwrap();
            let sub = val[1].as_str().unwrap().to_string();
            ws.send(TMsg::Text(json!(["EVENT", sub, garbage]).to_string()))
                .await
                .unwrap();
            ws.send(TMsg::Text(json!(["EVENT", sub, good]).to_string()))
                .await
                .unwrap();
        });

        let mut session = Session::login(settings(format!("ws://{addr}")), &nsec)
            .await
            .unwrap();
        let line = session.next_line().await.unwrap();
        assert!(line.ends_with(": after the bad one"));
        session.logout().await;
    }

    #[tokio::test]
    async fn send_message_publishes_encrypted_kind4() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (published_tx, published_rx) = oneshot::channel();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let _req = ws.next().await; // subscription REQ
            if let Some(Ok(TMsg::Text(txt))) = ws.next().await {
                let _ = published_tx.send(txt);
            }
        });

        let (me, nsec) = Identity::generate().unwrap();
        let (peer, _) = Identity::generate().unwrap();
        let mut session = Session::login(settings(format!("ws://{addr}")), &nsec)
            .await
            .unwrap();
        session.send_message(peer.public_key(), "hi").await.unwrap();

        let frame = published_rx.await.unwrap();
        let val: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(val[0], "EVENT");
        let ev: Event = serde_json::from_value(val[1].clone()).unwrap();
        assert_eq!(ev.kind, KIND_DM);
        assert_eq!(ev.pubkey, me.public_key());
        assert_eq!(Tag::value(&ev.tags, "p"), Some(peer.public_key()));
        assert_ne!(ev.content, "hi");
        ev.verify().unwrap();
        // The peer can decrypt it.
        let shared =
            cipher::shared_secret(&peer.keypair().secret_key(), me.public_key()).unwrap();
        assert_eq!(cipher::decrypt(&shared, &ev.content).unwrap(), "hi");

        // Local echo appears in the display stream.
        assert_eq!(session.next_line().await.unwrap(), "Me: hi");
        session.logout().await;
    }

    #[tokio::test]
    async fn send_message_validates_input() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            while ws.next().await.is_some() {}
        });

        let (_, nsec) = Identity::generate().unwrap();
        let session = Session::login(settings(format!("ws://{addr}")), &nsec)
            .await
            .unwrap();
        assert!(session.send_message("", "hi").await.is_err());
        assert!(session.send_message("peer", "   ").await.is_err());
        session.logout().await;
    }

    #[tokio::test]
    async fn zap_without_endpoint_reports_and_publishes_nothing() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (frames_tx, mut frames_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            while let Some(Ok(TMsg::Text(txt))) = ws.next().await {
                let val: Value = serde_json::from_str(&txt).unwrap();
                if val[0] == "REQ" && val[2]["kinds"] == json!([0]) {
                    let sub = val[1].as_str().unwrap().to_string();
                    ws.send(TMsg::Text(json!(["EOSE", sub]).to_string()))
                        .await
                        .unwrap();
                }
                let _ = frames_tx.send(val);
            }
        });

        let (_, nsec) = Identity::generate().unwrap();
        let (peer, _) = Identity::generate().unwrap();
        let mut session = Session::login(settings(format!("ws://{addr}")), &nsec)
            .await
            .unwrap();
        session.send_zap(peer.public_key(), 21).await.unwrap();
        assert_eq!(
            session.next_line().await.unwrap(),
            "no zap endpoint for peer"
        );
        session.logout().await;

        // The relay saw the DM REQ, the profile REQ, and its CLOSE, but no
        // EVENT publish of any kind.
        while let Some(frame) = frames_rx.recv().await {
            assert_ne!(frame[0], "EVENT");
        }
    }

    #[tokio::test]
    async fn send_does_not_block_on_delivery() {
        // The relay feeds events continuously; publishing must still work.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (me, nsec) = Identity::generate().unwrap();
        let (peer, _) = Identity::generate().unwrap();
        let flood: Vec<Event> = (0..50).map(|i| dm_event(&peer, &me, &format!("m{i}"))).collect();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let msg = ws.next().await.unwrap().unwrap();
            let val: Value = serde_json::from_str(msg.to_text().unwrap()).unwrap();
            let sub = val[1].as_str().unwrap().to_string();
            for ev in flood {
                ws.send(TMsg::Text(json!(["EVENT", sub, ev]).to_string()))
                    .await
                    .unwrap();
            }
            // Keep reading so the publish has somewhere to go.
            while ws.next().await.is_some() {}
        });

        let mut session = Session::login(settings(format!("ws://{addr}")), &nsec)
            .await
            .unwrap();
        session
            .send_message(peer.public_key(), "outbound")
            .await
            .unwrap();
        // Both inbound lines and the echo eventually surface.
        let mut saw_echo = false;
        let mut inbound = 0;
        for _ in 0..51 {
            match session.next_line().await {
                Some(line) if line == "Me: outbound" => saw_echo = true,
                Some(_) => inbound += 1,
                None => break,
            }
        }
        assert!(saw_echo);
        assert!(inbound >= 50);
        session.logout().await;
    }
}
