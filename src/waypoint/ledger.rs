//! In-flight non-blocking operations

use crate::transport::{Completion, Request};

use super::broadcast::SentCallback;

/// What to do once an operation completes
pub(crate) enum Continuation {
    /// Invoke the submitter's callback with the send result
    Send(SentCallback),
    /// Hand the message to receive handlers and re-arm
    Receive,
}

/// An operation submitted to the transport and not yet dispatched
pub(crate) struct PendingOperation {
    request: Box<dyn Request>,
    continuation: Continuation,
}

impl PendingOperation {
    pub fn send(request: Box<dyn Request>, callback: SentCallback) -> Self {
        Self {
            request,
            continuation: Continuation::Send(callback),
        }
    }

    pub fn receive(request: Box<dyn Request>) -> Self {
        Self {
            request,
            continuation: Continuation::Receive,
        }
    }

    pub fn is_receive(&self) -> bool {
        matches!(self.continuation, Continuation::Receive)
    }

    pub fn into_continuation(self) -> Continuation {
        self.continuation
    }
}

/// A completed operation waiting to be dispatched
pub(crate) struct ReadyOperation {
    pub completion: Completion,
    pub continuation: Continuation,
}

/// Ordered set of in-flight operations
#[derive(Default)]
pub(crate) struct Ledger {
    in_flight: Vec<PendingOperation>,
}

impl Ledger {
    /// Append newly submitted operations, keeping submission order
    pub fn admit(&mut self, operations: impl IntoIterator<Item = PendingOperation>) {
        self.in_flight.extend(operations);
    }

    /// Test every operation once and remove the finished ones.
    ///
    /// Both the returned ready operations and the retained ones keep their
    /// relative submission order.
    pub fn collect_ready(&mut self) -> Vec<ReadyOperation> {
        let mut ready = Vec::new();
        let mut retained = Vec::with_capacity(self.in_flight.len());

        for mut operation in self.in_flight.drain(..) {
            match operation.request.test() {
                Some(completion) => ready.push(ReadyOperation {
                    completion,
                    continuation: operation.continuation,
                }),
                None => retained.push(operation),
            }
        }

        self.in_flight = retained;
        ready
    }

    /// Remove everything still in flight
    pub fn drain(&mut self) -> Vec<PendingOperation> {
        std::mem::take(&mut self.in_flight)
    }

    pub fn len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn receives(&self) -> usize {
        self.in_flight.iter().filter(|op| op.is_receive()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    /// Completes once `gate` is opened
    struct Gated {
        gate: Arc<AtomicBool>,
        source: usize,
    }

    impl Request for Gated {
        fn test(&mut self) -> Option<Completion> {
            self.gate
                .load(Ordering::SeqCst)
                .then(|| Completion::sent(self.source, 0))
        }
    }

    fn gated(gate: &Arc<AtomicBool>, source: usize) -> PendingOperation {
        PendingOperation::send(
            Box::new(Gated {
                gate: Arc::clone(gate),
                source,
            }),
            Box::new(|_| {}),
        )
    }

    #[test]
    fn test_partition_is_stable() {
        let open = Arc::new(AtomicBool::new(true));
        let shut = Arc::new(AtomicBool::new(false));

        let mut ledger = Ledger::default();
        ledger.admit(vec![
            gated(&open, 0),
            gated(&shut, 1),
            gated(&open, 2),
            gated(&shut, 3),
            gated(&open, 4),
        ]);

        let ready: Vec<_> = ledger
            .collect_ready()
            .into_iter()
            .map(|r| r.completion.source)
            .collect();
        assert_eq!(ready, vec![0, 2, 4]);
        assert_eq!(ledger.len(), 2);

        shut.store(true, Ordering::SeqCst);
        let ready: Vec<_> = ledger
            .collect_ready()
            .into_iter()
            .map(|r| r.completion.source)
            .collect();
        assert_eq!(ready, vec![1, 3]);
        assert_eq!(ledger.len(), 0);
    }

    #[test]
    fn test_counts_receives() {
        let shut = Arc::new(AtomicBool::new(false));
        let mut ledger = Ledger::default();
        ledger.admit(vec![
            gated(&shut, 0),
            PendingOperation::receive(Box::new(Gated {
                gate: Arc::clone(&shut),
                source: 1,
            })),
        ]);

        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger.receives(), 1);
        assert_eq!(ledger.drain().len(), 2);
        assert_eq!(ledger.len(), 0);
    }
}
