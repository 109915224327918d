use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::RuleEngineHandle;
use crate::event::SecurityEvent;
use crate::ingress::request::ParsedRequest;
use crate::ingress::response;
use crate::metrics;
use crate::ruleset::Phase;

/// Long-lived worker: dequeues parsed requests, drives the rule engine
/// through both phases, replies with the in-band verdict, and emits security
/// events downstream.
pub struct Runner {
    pub id: Uuid,
    pub queue: Arc<Mutex<mpsc::Receiver<ParsedRequest>>>,
    pub engine: RuleEngineHandle,
    pub events: mpsc::Sender<SecurityEvent>,
    pub labels: BTreeMap<String, String>,
}

impl Runner {
    pub async fn run(mut self) {
        debug!(runner = %self.id, "appsec runner started");
        loop {
            // Holding the queue lock across the recv keeps this a fair
            // multi-consumer handoff: whichever runner holds the lock takes
            // the next request, releases, and processes while another waits.
            let request = { self.queue.lock().await.recv().await };
            let Some(request) = request else {
                break;
            };
            self.process(request).await;
        }
        info!(
            runner = %self.id,
            evaluations = self.engine.evaluations(),
            "appsec runner drained, exiting"
        );
    }

    async fn process(&mut self, mut request: ParsedRequest) {
        let started = Instant::now();
        let source = request.remote_addr_normalized.clone();
        let engine_name = request.engine_name.clone();
        let reply = request.reply.take();
        let mut state = std::mem::take(&mut request.state);

        let inband_started = Instant::now();
        let inband = catch_unwind(AssertUnwindSafe(|| {
            self.engine.run_phase(Phase::InBand, &request, &mut state);
        }));
        metrics::observe_inband(&source, &engine_name, inband_started.elapsed());

        let verdict = match &inband {
            Ok(()) => response::render_in_band(&state.in_band, self.engine.ruleset()),
            Err(_) => {
                error!(
                    runner = %self.id,
                    request = %request.id,
                    "in-band evaluation panicked, synthesizing allow verdict"
                );
                response::panic_verdict()
            }
        };

        // The reply must be delivered exactly once, whatever happened above.
        if let Some(reply) = reply
            && reply.send(verdict).is_err()
        {
            debug!(request = %request.id, "handler gone before in-band verdict delivery");
        }

        if inband.is_ok() {
            let outofband_started = Instant::now();
            let outofband = catch_unwind(AssertUnwindSafe(|| {
                self.engine.run_phase(Phase::OutOfBand, &request, &mut state);
            }));
            metrics::observe_outofband(&source, &engine_name, outofband_started.elapsed());
            if outofband.is_err() {
                error!(
                    runner = %self.id,
                    request = %request.id,
                    "out-of-band evaluation panicked, phase result discarded"
                );
            }
        }

        for rule in &state.in_band.matched_rules {
            metrics::record_rule_hit(rule, Phase::InBand.as_str(), &source, &engine_name);
        }
        for rule in &state.out_of_band.matched_rules {
            metrics::record_rule_hit(rule, Phase::OutOfBand.as_str(), &source, &engine_name);
        }

        if state.in_band.disposition.is_interrupt() || state.out_of_band.disposition.is_interrupt()
        {
            let event = SecurityEvent::from_evaluation(&request, &state, self.labels.clone());
            if self.events.send(event).await.is_err() {
                warn!(request = %request.id, "event sink closed, dropping security event");
            }
        }

        metrics::observe_processing(&source, &engine_name, started.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EvaluationState;
    use crate::ingress::request::test_request;
    use crate::ruleset::compile::compile;
    use crate::ruleset::loader::RawRuleSet;
    use http::Method;
    use std::path::Path;
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn compiled(yaml: &str) -> Arc<crate::ruleset::CompiledRuleSet> {
        let raw: RawRuleSet = serde_yaml::from_str(yaml).expect("parse raw rule set");
        Arc::new(
            compile(raw, "test", Path::new("."))
                .expect("compile")
                .process_on_load()
                .expect("on_load"),
        )
    }

    fn runner(
        yaml: &str,
        queue: mpsc::Receiver<ParsedRequest>,
        events: mpsc::Sender<SecurityEvent>,
    ) -> Runner {
        Runner {
            id: Uuid::new_v4(),
            queue: Arc::new(Mutex::new(queue)),
            engine: RuleEngineHandle::new(compiled(yaml)),
            events,
            labels: BTreeMap::new(),
        }
    }

    fn queued_request(method: Method, path: &str) -> (ParsedRequest, oneshot::Receiver<crate::ingress::response::InBandVerdict>) {
        let mut request = test_request(method, path, &[], b"");
        let (tx, rx) = oneshot::channel();
        request.reply = Some(tx);
        (request, rx)
    }

    #[tokio::test]
    async fn runner_replies_before_emitting_event() {
        let (queue_tx, queue_rx) = mpsc::channel(1);
        let (event_tx, mut event_rx) = mpsc::channel(8);
        let worker = runner(
            "inband_rules:\n  - name: block-all\n",
            queue_rx,
            event_tx,
        );
        let handle = tokio::spawn(worker.run());

        let (request, reply_rx) = queued_request(Method::GET, "/");
        queue_tx.send(request).await.expect("enqueue");

        let verdict = tokio::time::timeout(Duration::from_secs(1), reply_rx)
            .await
            .expect("reply within timeout")
            .expect("verdict delivered");
        assert_eq!(verdict.status, http::StatusCode::FORBIDDEN);
        assert!(verdict.interrupt);

        let event = tokio::time::timeout(Duration::from_secs(1), event_rx.recv())
            .await
            .expect("event within timeout")
            .expect("event emitted");
        assert_eq!(event.inband.matched_rules, vec!["block-all".to_string()]);

        drop(queue_tx);
        handle.await.expect("runner exits cleanly");
    }

    #[tokio::test]
    async fn outofband_match_emits_event_but_allows() {
        let (queue_tx, queue_rx) = mpsc::channel(1);
        let (event_tx, mut event_rx) = mpsc::channel(8);
        let worker = runner("outofband_rules:\n  - name: oob-watch\n", queue_rx, event_tx);
        let handle = tokio::spawn(worker.run());

        let (request, reply_rx) = queued_request(Method::GET, "/x");
        queue_tx.send(request).await.expect("enqueue");

        let verdict = reply_rx.await.expect("verdict delivered");
        assert_eq!(verdict.status, http::StatusCode::OK);
        assert!(!verdict.interrupt);

        let event = tokio::time::timeout(Duration::from_secs(1), event_rx.recv())
            .await
            .expect("event within timeout")
            .expect("event emitted");
        assert_eq!(event.outofband.matched_rules, vec!["oob-watch".to_string()]);
        assert_eq!(event.outofband.disposition, "deny");

        drop(queue_tx);
        handle.await.expect("runner exits cleanly");
    }

    #[tokio::test]
    async fn allow_path_emits_no_event() {
        let (queue_tx, queue_rx) = mpsc::channel(1);
        let (event_tx, mut event_rx) = mpsc::channel(8);
        let worker = runner("{}", queue_rx, event_tx);
        let handle = tokio::spawn(worker.run());

        let (request, reply_rx) = queued_request(Method::GET, "/");
        queue_tx.send(request).await.expect("enqueue");
        let verdict = reply_rx.await.expect("verdict delivered");
        assert_eq!(verdict.status, http::StatusCode::OK);

        drop(queue_tx);
        handle.await.expect("runner exits cleanly");
        assert!(event_rx.recv().await.is_none(), "no event expected");
    }

    #[tokio::test]
    async fn runner_survives_request_with_dropped_handler() {
        let (queue_tx, queue_rx) = mpsc::channel(1);
        let (event_tx, _event_rx) = mpsc::channel(8);
        let worker = runner("{}", queue_rx, event_tx);
        let handle = tokio::spawn(worker.run());

        let (request, reply_rx) = queued_request(Method::GET, "/");
        drop(reply_rx);
        queue_tx.send(request).await.expect("enqueue");

        // a second request must still be processed normally
        let (request, reply_rx) = queued_request(Method::GET, "/");
        queue_tx.send(request).await.expect("enqueue");
        let verdict = reply_rx.await.expect("verdict delivered");
        assert_eq!(verdict.status, http::StatusCode::OK);

        drop(queue_tx);
        handle.await.expect("runner exits cleanly");
    }

    #[tokio::test]
    async fn panic_in_evaluation_still_delivers_reply() {
        let (queue_tx, queue_rx) = mpsc::channel(1);
        let (event_tx, mut event_rx) = mpsc::channel(8);
        let mut worker = runner("inband_rules:\n  - name: block-all\n", queue_rx, event_tx);
        worker.engine.panic_next = true;
        let handle = tokio::spawn(worker.run());

        let (request, reply_rx) = queued_request(Method::GET, "/");
        queue_tx.send(request).await.expect("enqueue");

        let verdict = tokio::time::timeout(Duration::from_secs(1), reply_rx)
            .await
            .expect("reply within timeout even on panic")
            .expect("verdict delivered");
        assert_eq!(verdict.status, http::StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(verdict.body["action"], "allow");
        assert!(!verdict.interrupt);

        // the next request is evaluated normally by the same runner
        let (request, reply_rx) = queued_request(Method::GET, "/");
        queue_tx.send(request).await.expect("enqueue");
        let verdict = reply_rx.await.expect("verdict delivered");
        assert_eq!(verdict.status, http::StatusCode::FORBIDDEN);

        drop(queue_tx);
        handle.await.expect("runner exits cleanly");
        // the panicked request never reached the out-of-band phase, so the
        // only event comes from the second, denied request
        let event = event_rx.recv().await.expect("event for second request");
        assert_eq!(event.inband.matched_rules, vec!["block-all".to_string()]);
        assert!(event_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn evaluation_state_defaults_are_empty() {
        let state = EvaluationState::default();
        assert!(state.in_band.matched_rules.is_empty());
        assert!(state.out_of_band.matched_rules.is_empty());
    }
}
