use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::errors::SubscriptionError;
use crate::fanout::FanoutBroadcaster;
use crate::feed::UpstreamControl;
use crate::models::{
    ExchangeCode, InstrumentKey, MarketUpdate, Rejection, SessionId, SubscribeReport,
    SubscribeRequest,
};
use crate::subscription::SubscriptionRegistry;

/// Validate one request item into a key the upstream feed can subscribe to
pub fn parse_request(request: &SubscribeRequest) -> Result<InstrumentKey, SubscriptionError> {
    let exchange: ExchangeCode = request.exchange.parse()?;
    if exchange.exchange_type().is_none() {
        return Err(SubscriptionError::UnmappedExchange(exchange));
    }
    InstrumentKey::new(exchange, &request.token)
}

fn reject(session: SessionId, request: &SubscribeRequest, error: &SubscriptionError) -> Rejection {
    if error.is_client_error() {
        debug!("Session {} item {}/{} rejected: {}", session, request.exchange, request.token, error);
    } else {
        warn!("Session {} item {}/{} rejected: {}", session, request.exchange, request.token, error);
    }

    Rejection {
        token: request.token.clone(),
        exchange: request.exchange.clone(),
        reason: error.to_string(),
    }
}

/// Translates downstream session events into registry changes and upstream
/// instructions
///
/// Every mutation runs under `sequencer` together with the upstream call it
/// produces, so the feed sees subscribe and unsubscribe instructions in the
/// same order the registry applied them.
pub struct SessionSubscriptionHandler {
    registry: Arc<SubscriptionRegistry>,
    broadcaster: FanoutBroadcaster,
    upstream: Arc<dyn UpstreamControl>,
    sequencer: Mutex<()>,
}

impl SessionSubscriptionHandler {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        broadcaster: FanoutBroadcaster,
        upstream: Arc<dyn UpstreamControl>,
    ) -> Self {
        Self {
            registry,
            broadcaster,
            upstream,
            sequencer: Mutex::new(()),
        }
    }

    /// Register a new session and hand back its update stream
    pub fn on_connect(&self, session: SessionId) -> mpsc::Receiver<MarketUpdate> {
        info!("🔗 Session {} connected", session);
        self.broadcaster.attach_session(session)
    }

    /// Add interest for each valid item
    ///
    /// Invalid items are rejected individually. Keys no session held
    /// before this call are forwarded upstream in a single instruction.
    pub fn on_subscribe(&self, session: SessionId, requests: Vec<SubscribeRequest>) -> SubscribeReport {
        let mut report = SubscribeReport::default();

        if !self.broadcaster.has_session(session) {
            let error = SubscriptionError::UnknownSession(session);
            report.rejected = requests.iter().map(|r| reject(session, r, &error)).collect();
            return report;
        }

        let _guard = self.sequencer.lock();
        let mut first_requested = BTreeSet::new();

        for request in &requests {
            let key = match parse_request(request) {
                Ok(key) => key,
                Err(e) => {
                    report.rejected.push(reject(session, request, &e));
                    continue;
                }
            };

            if !self.registry.add_interest(key.clone(), session).already_subscribed_upstream {
                first_requested.insert(key.clone());
            }
            if !report.accepted.contains(&key) {
                report.accepted.push(key);
            }
        }

        if !first_requested.is_empty() {
            let keys: Vec<InstrumentKey> = first_requested.into_iter().collect();
            info!("➕ {} new instruments requested by session {}", keys.len(), session);
            // Interest stays registered on failure and is replayed on reconnect
            if let Err(e) = self.upstream.subscribe(keys) {
                warn!("Upstream subscribe not queued: {}", e);
            }
        }

        report
    }

    /// Drop interest for each valid item, pruning idle instruments upstream
    pub fn on_unsubscribe(&self, session: SessionId, requests: Vec<SubscribeRequest>) -> SubscribeReport {
        let mut report = SubscribeReport::default();
        let _guard = self.sequencer.lock();
        let mut emptied = BTreeSet::new();

        for request in &requests {
            let key = match parse_request(request) {
                Ok(key) => key,
                Err(e) => {
                    report.rejected.push(reject(session, request, &e));
                    continue;
                }
            };

            if self.registry.remove_interest(&key, session).now_empty {
                emptied.insert(key.clone());
            }
            if !report.accepted.contains(&key) {
                report.accepted.push(key);
            }
        }

        self.prune(session, emptied.into_iter().collect());
        report
    }

    /// Remove every interest the session held and detach its sink
    pub fn on_disconnect(&self, session: SessionId) {
        {
            let _guard = self.sequencer.lock();
            let emptied = self.registry.remove_session(session);
            self.prune(session, emptied);
        }

        self.broadcaster.detach_session(session);
        info!("🔌 Session {} disconnected", session);
    }

    fn prune(&self, session: SessionId, keys: Vec<InstrumentKey>) {
        if keys.is_empty() {
            return;
        }

        info!("➖ {} instruments idle after session {}", keys.len(), session);
        if let Err(e) = self.upstream.unsubscribe(keys) {
            warn!("Upstream unsubscribe not queued: {}", e);
        }
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn broadcaster(&self) -> &FanoutBroadcaster {
        &self.broadcaster
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::FeedError;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Subscribe(Vec<String>),
        Unsubscribe(Vec<String>),
    }

    #[derive(Default)]
    struct RecordingUpstream {
        calls: Mutex<Vec<Call>>,
    }

    impl RecordingUpstream {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().clone()
        }
    }

    fn tokens(keys: &[InstrumentKey]) -> Vec<String> {
        keys.iter().map(|k| k.token().to_string()).collect()
    }

    impl UpstreamControl for RecordingUpstream {
        fn subscribe(&self, keys: Vec<InstrumentKey>) -> Result<(), FeedError> {
            self.calls.lock().push(Call::Subscribe(tokens(&keys)));
            Ok(())
        }

        fn unsubscribe(&self, keys: Vec<InstrumentKey>) -> Result<(), FeedError> {
            self.calls.lock().push(Call::Unsubscribe(tokens(&keys)));
            Ok(())
        }
    }

    fn setup() -> (SessionSubscriptionHandler, Arc<RecordingUpstream>) {
        let registry = Arc::new(SubscriptionRegistry::new());
        let broadcaster = FanoutBroadcaster::new(Arc::clone(&registry));
        let upstream = Arc::new(RecordingUpstream::default());
        let handler = SessionSubscriptionHandler::new(registry, broadcaster, upstream.clone());
        (handler, upstream)
    }

    fn nse(token: &str) -> SubscribeRequest {
        SubscribeRequest::new(token, "NSE")
    }

    #[test]
    fn test_first_subscribe_forwards_once() {
        let (handler, upstream) = setup();
        let (s1, s2) = (SessionId::new(), SessionId::new());
        let _rx1 = handler.on_connect(s1);
        let _rx2 = handler.on_connect(s2);

        let report = handler.on_subscribe(s1, vec![nse("99926000"), nse("2885")]);
        assert!(report.is_fully_accepted());
        assert_eq!(report.accepted.len(), 2);

        // Already subscribed upstream: no second instruction
        handler.on_subscribe(s2, vec![nse("2885")]);

        assert_eq!(
            upstream.calls(),
            vec![Call::Subscribe(vec!["2885".to_string(), "99926000".to_string()])]
        );
    }

    #[test]
    fn test_invalid_items_rejected_individually() {
        let (handler, upstream) = setup();
        let s1 = SessionId::new();
        let _rx = handler.on_connect(s1);

        let report = handler.on_subscribe(
            s1,
            vec![
                nse("2885"),
                SubscribeRequest::new("1594", "LSE"),
                SubscribeRequest::new("234230", "MCX"),
                nse("   "),
            ],
        );

        assert_eq!(tokens(&report.accepted), vec!["2885".to_string()]);
        assert_eq!(report.rejected.len(), 3);
        assert!(report.rejected[0].reason.contains("Unknown exchange"));
        assert!(report.rejected[1].reason.contains("not supported"));
        assert!(report.rejected[2].reason.contains("Invalid token"));
        assert_eq!(upstream.calls(), vec![Call::Subscribe(vec!["2885".to_string()])]);
    }

    #[test]
    fn test_subscribe_from_unknown_session_rejected() {
        let (handler, upstream) = setup();
        let report = handler.on_subscribe(SessionId::new(), vec![nse("2885")]);

        assert!(report.accepted.is_empty());
        assert!(report.rejected[0].reason.contains("Unknown session"));
        assert_eq!(handler.registry().stats().instrument_count, 0);
        assert!(upstream.calls().is_empty());
    }

    #[test]
    fn test_item_errors_are_client_errors() {
        let bad = [
            SubscribeRequest::new("1594", "LSE"),
            SubscribeRequest::new("234230", "MCX"),
            SubscribeRequest::new("", "NSE"),
            SubscribeRequest::new("28 85", "NSE"),
        ];
        for request in &bad {
            assert!(parse_request(request).unwrap_err().is_client_error());
        }

        // Only a session-level failure is logged as a server-side problem
        assert!(!SubscriptionError::UnknownSession(SessionId::new()).is_client_error());
    }

    #[test]
    fn test_disconnect_prunes_sole_subscriber() {
        let (handler, upstream) = setup();
        let (s1, s2) = (SessionId::new(), SessionId::new());
        let _rx1 = handler.on_connect(s1);
        let _rx2 = handler.on_connect(s2);

        handler.on_subscribe(s1, vec![nse("X"), nse("SHARED")]);
        handler.on_subscribe(s2, vec![nse("SHARED")]);

        handler.on_disconnect(s1);

        assert_eq!(
            upstream.calls().last(),
            Some(&Call::Unsubscribe(vec!["X".to_string()]))
        );
        assert!(!handler.broadcaster().has_session(s1));
        assert_eq!(handler.registry().upstream_instruments().len(), 1);
    }

    #[test]
    fn test_unsubscribe_keeps_shared_interest() {
        let (handler, upstream) = setup();
        let (s1, s2) = (SessionId::new(), SessionId::new());
        let _rx1 = handler.on_connect(s1);
        let _rx2 = handler.on_connect(s2);

        handler.on_subscribe(s1, vec![nse("2885")]);
        handler.on_subscribe(s2, vec![nse("2885")]);

        handler.on_unsubscribe(s1, vec![nse("2885")]);
        assert_eq!(upstream.calls().len(), 1);

        let report = handler.on_unsubscribe(s2, vec![nse("2885"), SubscribeRequest::new("1", "XYZ")]);
        assert_eq!(report.accepted.len(), 1);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(
            upstream.calls().last(),
            Some(&Call::Unsubscribe(vec!["2885".to_string()]))
        );
    }

    #[test]
    fn test_disconnect_without_subscriptions() {
        let (handler, upstream) = setup();
        let s1 = SessionId::new();
        let _rx = handler.on_connect(s1);

        handler.on_disconnect(s1);
        handler.on_disconnect(s1);

        assert!(upstream.calls().is_empty());
    }

    #[test]
    fn test_parse_request() {
        let key = parse_request(&SubscribeRequest::new(" 2885 ", "nse")).unwrap();
        assert_eq!(key.exchange(), ExchangeCode::Nse);
        assert_eq!(key.token(), "2885");

        assert_eq!(
            parse_request(&SubscribeRequest::new("1", "BFO")),
            Err(SubscriptionError::UnmappedExchange(ExchangeCode::Bfo))
        );
    }
}
