//! Completion events of submitted computations.
//!
//! The cluster reports the progress of all computations of a user on one ordered stream of
//! [`ComputeEvent`]s. A single computation is awaited with [`ComputeEvents::wait_for`]. When
//! several computations share the stream, the [`EventRouter`] owns it and hands the terminal
//! event of each computation to whoever waits for it through an [`EventRouterHandle`].

use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque, btree_map},
    ops::ControlFlow,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::{
    cluster::ComputeId,
    error::{Error, ErrorKind, Stage},
    values::Value,
};

/// The named outputs of a finished computation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ComputeResult {
    outputs: BTreeMap<String, Value>,
}

impl ComputeResult {
    /// Wraps the outputs of a computation.
    pub fn new(outputs: BTreeMap<String, Value>) -> Self {
        Self { outputs }
    }

    /// The output `name`.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.outputs.get(name)
    }

    /// All outputs ordered by name.
    pub fn iter(&self) -> btree_map::Iter<'_, String, Value> {
        self.outputs.iter()
    }

    /// Consumes the result, returning the outputs.
    pub fn into_outputs(self) -> BTreeMap<String, Value> {
        self.outputs
    }
}

impl<S: Into<String>> FromIterator<(S, Value)> for ComputeResult {
    fn from_iter<T: IntoIterator<Item = (S, Value)>>(iter: T) -> Self {
        Self::new(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// Progress of a computation as reported by the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ComputeEvent {
    /// The computation is waiting for its turn.
    Queued {
        /// The computation.
        compute_id: ComputeId,
    },
    /// The nodes are executing the computation.
    Running {
        /// The computation.
        compute_id: ComputeId,
    },
    /// The computation finished successfully.
    Finished {
        /// The computation.
        compute_id: ComputeId,
        /// Its outputs.
        result: ComputeResult,
    },
    /// The computation failed.
    Error {
        /// The computation.
        compute_id: ComputeId,
        /// Why it failed, as reported by the cluster.
        cause: String,
    },
}

impl ComputeEvent {
    /// The computation this event belongs to.
    pub fn compute_id(&self) -> ComputeId {
        match self {
            ComputeEvent::Queued { compute_id }
            | ComputeEvent::Running { compute_id }
            | ComputeEvent::Finished { compute_id, .. }
            | ComputeEvent::Error { compute_id, .. } => *compute_id,
        }
    }

    /// Whether no further events follow for this computation.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ComputeEvent::Finished { .. } | ComputeEvent::Error { .. }
        )
    }

    fn into_outcome(self) -> Option<Outcome> {
        match self {
            ComputeEvent::Finished { result, .. } => Some(Ok(result)),
            ComputeEvent::Error { cause, .. } => Some(Err(cause)),
            ComputeEvent::Queued { .. } | ComputeEvent::Running { .. } => None,
        }
    }
}

type Outcome = Result<ComputeResult, String>;

fn outcome_into_result(compute_id: ComputeId, outcome: Outcome) -> Result<ComputeResult, Error> {
    outcome.map_err(|cause| {
        Error::new(
            Stage::ComputeAwait,
            ErrorKind::ComputeFailure { compute_id, cause },
        )
    })
}

fn closed(compute_id: ComputeId) -> Error {
    Error::new(
        Stage::ComputeAwait,
        ErrorKind::EventStreamClosed { compute_id },
    )
}

async fn with_deadline<F>(
    compute_id: ComputeId,
    deadline: Option<Duration>,
    fut: F,
) -> Result<ComputeResult, Error>
where
    F: Future<Output = Result<ComputeResult, Error>>,
{
    match deadline {
        None => fut.await,
        Some(after) => tokio::time::timeout(after, fut).await.unwrap_or_else(|_| {
            Err(Error::new(
                Stage::ComputeAwait,
                ErrorKind::Timeout { compute_id, after },
            ))
        }),
    }
}

/// The ordered stream of events for the computations of one user.
#[derive(Debug)]
pub struct ComputeEvents {
    rx: mpsc::Receiver<ComputeEvent>,
}

impl ComputeEvents {
    /// Create a stream and the sender feeding it.
    pub fn channel(buffer: usize) -> (mpsc::Sender<ComputeEvent>, Self) {
        let (tx, rx) = mpsc::channel(buffer);
        (tx, Self { rx })
    }

    /// The next event in delivery order, `None` once the stream is closed.
    pub async fn next_event(&mut self) -> Option<ComputeEvent> {
        self.rx.recv().await
    }

    /// Waits for the terminal event of `compute_id`.
    ///
    /// Events of other computations and progress events are consumed and skipped. Without a
    /// `deadline` this waits until the terminal event arrives or the stream is closed.
    ///
    /// Cancelling this future does not lose the event it was currently waiting on.
    pub async fn wait_for(
        &mut self,
        compute_id: ComputeId,
        deadline: Option<Duration>,
    ) -> Result<ComputeResult, Error> {
        let wait = async {
            loop {
                let Some(event) = self.next_event().await else {
                    return Err(closed(compute_id));
                };
                if event.compute_id() != compute_id {
                    warn!(
                        event_compute_id = %event.compute_id(),
                        %compute_id,
                        "skipping event of another computation"
                    );
                    continue;
                }
                match event.into_outcome() {
                    Some(outcome) => return outcome_into_result(compute_id, outcome),
                    None => debug!(%compute_id, "computation is in progress"),
                }
            }
        };
        with_deadline(compute_id, deadline, wait).await
    }
}

impl From<mpsc::Receiver<ComputeEvent>> for ComputeEvents {
    fn from(rx: mpsc::Receiver<ComputeEvent>) -> Self {
        Self { rx }
    }
}

type Ret<R> = oneshot::Sender<R>;

/// Number of results of untracked computations an [`EventRouter`] keeps.
pub const UNTRACKED_RESULTS: usize = 256;

#[derive(Debug)]
enum RouterCmd {
    Wait(ComputeId, Ret<Outcome>),
    Track(ComputeId),
}

/// Routes the terminal events of one [`ComputeEvents`] stream to concurrent waiters.
///
/// The result of a tracked computation (see [`EventRouterHandle::track`]) is kept until it is
/// claimed. Of the computations nobody tracks or waits for, only the last
/// [`UNTRACKED_RESULTS`] results are kept. Once the stream is closed, waiters of unfinished
/// computations are released with [`ErrorKind::EventStreamClosed`] and the router stops when
/// the last handle is dropped.
pub struct EventRouter {
    events: Option<ComputeEvents>,
    cmd_rx: mpsc::Receiver<RouterCmd>,
    waiters: HashMap<ComputeId, Vec<Ret<Outcome>>>,
    tracked: HashSet<ComputeId>,
    unclaimed: HashMap<ComputeId, Outcome>,
    untracked: VecDeque<(ComputeId, Outcome)>,
}

impl EventRouter {
    /// Create a router for `events`.
    ///
    /// The router does nothing until [`EventRouter::start`] is awaited.
    pub fn new(events: ComputeEvents) -> (Self, EventRouterHandle) {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        (
            Self {
                events: Some(events),
                cmd_rx,
                waiters: HashMap::new(),
                tracked: HashSet::new(),
                unclaimed: HashMap::new(),
                untracked: VecDeque::new(),
            },
            EventRouterHandle(cmd_tx),
        )
    }

    /// Spawns the router onto the current tokio runtime.
    pub fn spawn(events: ComputeEvents) -> EventRouterHandle {
        let (router, handle) = Self::new(events);
        tokio::spawn(router.start());
        handle
    }

    /// Runs the router until the event stream is closed and all handles are dropped.
    pub async fn start(mut self) {
        loop {
            let step = match &mut self.events {
                Some(events) => tokio::select! {
                    cmd = self.cmd_rx.recv() => Step::Cmd(cmd),
                    event = events.next_event() => Step::Event(event),
                },
                None => Step::Cmd(self.cmd_rx.recv().await),
            };
            let flow = match step {
                Step::Cmd(Some(cmd)) => self.handle_cmd(cmd),
                Step::Cmd(None) => ControlFlow::Break(()),
                Step::Event(Some(event)) => self.handle_event(event),
                Step::Event(None) => self.handle_closed(),
            };
            if flow.is_break() {
                debug!("event router stopped");
                return;
            }
        }
    }

    fn handle_cmd(&mut self, cmd: RouterCmd) -> ControlFlow<()> {
        match cmd {
            RouterCmd::Wait(compute_id, ret) => {
                if let Some(outcome) = self.take_result(&compute_id) {
                    if let Err(outcome) = ret.send(outcome) {
                        self.keep(compute_id, outcome);
                    } else {
                        self.tracked.remove(&compute_id);
                    }
                } else if self.events.is_some() {
                    let waiters = self.waiters.entry(compute_id).or_default();
                    waiters.retain(|waiter| !waiter.is_closed());
                    waiters.push(ret);
                }
                // otherwise the stream is closed and dropping `ret` releases the waiter
            }
            RouterCmd::Track(compute_id) => {
                if let Some(pos) = self.untracked.iter().position(|(id, _)| id == &compute_id)
                    && let Some((_, outcome)) = self.untracked.remove(pos)
                {
                    self.unclaimed.insert(compute_id, outcome);
                }
                self.tracked.insert(compute_id);
            }
        }
        ControlFlow::Continue(())
    }

    fn handle_event(&mut self, event: ComputeEvent) -> ControlFlow<()> {
        let compute_id = event.compute_id();
        let Some(outcome) = event.into_outcome() else {
            debug!(%compute_id, "computation is in progress");
            return ControlFlow::Continue(());
        };
        let mut served = 0;
        for ret in self.waiters.remove(&compute_id).unwrap_or_default() {
            if !ret.is_closed() && ret.send(outcome.clone()).is_ok() {
                served += 1;
            }
        }
        if served > 0 {
            debug!(%compute_id, waiters = served, "delivered result");
            self.tracked.remove(&compute_id);
        } else {
            self.keep(compute_id, outcome);
        }
        ControlFlow::Continue(())
    }

    fn handle_closed(&mut self) -> ControlFlow<()> {
        if !self.waiters.is_empty() {
            warn!(
                waiting = self.waiters.len(),
                "event stream closed with computations still awaited"
            );
        }
        self.events = None;
        self.waiters.clear();
        ControlFlow::Continue(())
    }

    fn take_result(&mut self, compute_id: &ComputeId) -> Option<Outcome> {
        if let Some(outcome) = self.unclaimed.remove(compute_id) {
            return Some(outcome);
        }
        let pos = self.untracked.iter().position(|(id, _)| id == compute_id)?;
        self.untracked.remove(pos).map(|(_, outcome)| outcome)
    }

    /// Keeps a result nobody received.
    fn keep(&mut self, compute_id: ComputeId, outcome: Outcome) {
        if self.tracked.contains(&compute_id) {
            debug!(%compute_id, "keeping result until it is claimed");
            self.unclaimed.insert(compute_id, outcome);
            return;
        }
        self.untracked.push_back((compute_id, outcome));
        if self.untracked.len() > UNTRACKED_RESULTS
            && let Some((dropped, _)) = self.untracked.pop_front()
        {
            debug!(compute_id = %dropped, "dropping unclaimed result of untracked computation");
        }
    }
}

enum Step {
    Cmd(Option<RouterCmd>),
    Event(Option<ComputeEvent>),
}

/// A cheaply clonable handle to a running [`EventRouter`].
#[derive(Debug, Clone)]
pub struct EventRouterHandle(mpsc::Sender<RouterCmd>);

impl EventRouterHandle {
    /// Waits for the terminal event of `compute_id`.
    ///
    /// Can be called concurrently for different computations. If the deadline elapses, a
    /// terminal event arriving later is kept and can be claimed by another call.
    pub async fn wait_for(
        &self,
        compute_id: ComputeId,
        deadline: Option<Duration>,
    ) -> Result<ComputeResult, Error> {
        let wait = async {
            let (ret_tx, ret_rx) = oneshot::channel();
            self.0
                .send(RouterCmd::Wait(compute_id, ret_tx))
                .await
                .map_err(|_| closed(compute_id))?;
            let outcome = ret_rx.await.map_err(|_| closed(compute_id))?;
            outcome_into_result(compute_id, outcome)
        };
        with_deadline(compute_id, deadline, wait).await
    }

    /// Keeps the result of `compute_id` until it is claimed with
    /// [`EventRouterHandle::wait_for`].
    pub async fn track(&self, compute_id: ComputeId) {
        if self.0.send(RouterCmd::Track(compute_id)).await.is_err() {
            debug!(%compute_id, "event router is gone, not tracking computation");
        }
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    fn id(n: u128) -> ComputeId {
        ComputeId(Uuid::from_u128(n))
    }

    fn result(values: &[i64]) -> ComputeResult {
        [("out", Value::integers(values.iter().copied()))]
            .into_iter()
            .collect()
    }

    #[tokio::test]
    async fn skips_other_computations() {
        let (tx, mut events) = ComputeEvents::channel(8);
        tx.send(ComputeEvent::Error {
            compute_id: id(7),
            cause: "boom".to_string(),
        })
        .await
        .unwrap();
        tx.send(ComputeEvent::Finished {
            compute_id: id(3),
            result: result(&[0, 1, 2]),
        })
        .await
        .unwrap();
        let res = events.wait_for(id(3), None).await.unwrap();
        assert_eq!(res, result(&[0, 1, 2]));
    }

    #[tokio::test]
    async fn matching_error_is_a_compute_failure() {
        let (tx, mut events) = ComputeEvents::channel(8);
        tx.send(ComputeEvent::Queued { compute_id: id(1) })
            .await
            .unwrap();
        tx.send(ComputeEvent::Running { compute_id: id(1) })
            .await
            .unwrap();
        tx.send(ComputeEvent::Error {
            compute_id: id(1),
            cause: "node unreachable".to_string(),
        })
        .await
        .unwrap();
        let err = events.wait_for(id(1), None).await.unwrap_err();
        assert_eq!(err.stage(), Stage::ComputeAwait);
        assert!(matches!(
            err.kind(),
            ErrorKind::ComputeFailure { cause, .. } if cause == "node unreachable"
        ));
    }

    #[tokio::test]
    async fn closed_stream_and_timeout() {
        let (tx, mut events) = ComputeEvents::channel(8);
        let err = events
            .wait_for(id(1), Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Timeout { .. }));

        tx.send(ComputeEvent::Running { compute_id: id(1) })
            .await
            .unwrap();
        drop(tx);
        let err = events.wait_for(id(1), None).await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::EventStreamClosed { .. }));
    }

    #[test]
    fn events_serialize_tagged() {
        let event = ComputeEvent::Queued { compute_id: id(1) };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "queued");
        assert_eq!(serde_json::from_value::<ComputeEvent>(json).unwrap(), event);
    }

    #[tokio::test]
    async fn router_serves_concurrent_waiters() {
        let (tx, events) = ComputeEvents::channel(8);
        let router = EventRouter::spawn(events);

        // finishes before anyone waits for it
        tx.send(ComputeEvent::Finished {
            compute_id: id(2),
            result: result(&[2]),
        })
        .await
        .unwrap();

        let first = tokio::spawn({
            let router = router.clone();
            async move { router.wait_for(id(1), None).await }
        });
        let third = tokio::spawn({
            let router = router.clone();
            async move { router.wait_for(id(3), None).await }
        });
        assert_eq!(router.wait_for(id(2), None).await.unwrap(), result(&[2]));

        tx.send(ComputeEvent::Error {
            compute_id: id(3),
            cause: "boom".to_string(),
        })
        .await
        .unwrap();
        tx.send(ComputeEvent::Finished {
            compute_id: id(1),
            result: result(&[1]),
        })
        .await
        .unwrap();

        assert_eq!(first.await.unwrap().unwrap(), result(&[1]));
        let err = third.await.unwrap().unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::ComputeFailure { .. }));
    }

    #[tokio::test]
    async fn router_releases_waiters_on_close() {
        let (tx, events) = ComputeEvents::channel(8);
        let router = EventRouter::spawn(events);
        let waiting = tokio::spawn({
            let router = router.clone();
            async move { router.wait_for(id(1), None).await }
        });
        tokio::task::yield_now().await;
        drop(tx);
        let err = waiting.await.unwrap().unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::EventStreamClosed { .. }));
        let err = router.wait_for(id(9), None).await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::EventStreamClosed { .. }));
    }

    #[tokio::test]
    async fn router_serves_live_waiter_after_another_timed_out() {
        let (tx, events) = ComputeEvents::channel(8);
        let router = EventRouter::spawn(events);
        let patient = tokio::spawn({
            let router = router.clone();
            async move { router.wait_for(id(1), None).await }
        });
        tokio::task::yield_now().await;
        let err = router
            .wait_for(id(1), Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Timeout { .. }));

        tx.send(ComputeEvent::Finished {
            compute_id: id(1),
            result: result(&[1]),
        })
        .await
        .unwrap();
        assert_eq!(patient.await.unwrap().unwrap(), result(&[1]));
    }

    #[test]
    fn router_serves_every_waiter_of_a_computation() {
        let (_tx, events) = ComputeEvents::channel(8);
        let (mut router, _handle) = EventRouter::new(events);
        let (first_tx, mut first_rx) = oneshot::channel();
        let (gone_tx, gone_rx) = oneshot::channel();
        let (last_tx, mut last_rx) = oneshot::channel();
        let _ = router.handle_cmd(RouterCmd::Wait(id(1), first_tx));
        let _ = router.handle_cmd(RouterCmd::Wait(id(1), gone_tx));
        let _ = router.handle_cmd(RouterCmd::Wait(id(1), last_tx));
        drop(gone_rx);

        let _ = router.handle_event(ComputeEvent::Finished {
            compute_id: id(1),
            result: result(&[1]),
        });
        assert_eq!(first_rx.try_recv().unwrap(), Ok(result(&[1])));
        assert_eq!(last_rx.try_recv().unwrap(), Ok(result(&[1])));
        assert!(router.unclaimed.is_empty());
        assert!(router.untracked.is_empty());
    }

    #[test]
    fn router_bounds_results_of_untracked_computations() {
        let (_tx, events) = ComputeEvents::channel(8);
        let (mut router, _handle) = EventRouter::new(events);
        let _ = router.handle_cmd(RouterCmd::Track(id(0)));
        let _ = router.handle_event(ComputeEvent::Finished {
            compute_id: id(0),
            result: result(&[0]),
        });
        for n in 1..=(UNTRACKED_RESULTS as u128 + 10) {
            let _ = router.handle_event(ComputeEvent::Finished {
                compute_id: id(n),
                result: result(&[]),
            });
        }
        assert_eq!(router.untracked.len(), UNTRACKED_RESULTS);
        assert_eq!(router.unclaimed.len(), 1);
        assert!(router.take_result(&id(1)).is_none());
        assert!(router.take_result(&id(UNTRACKED_RESULTS as u128 + 10)).is_some());

        let (ret, mut rx) = oneshot::channel();
        let _ = router.handle_cmd(RouterCmd::Wait(id(0), ret));
        assert_eq!(rx.try_recv().unwrap(), Ok(result(&[0])));
        assert!(router.unclaimed.is_empty());
        assert!(router.tracked.is_empty());
    }

    #[test]
    fn tracking_after_the_result_arrived_keeps_it() {
        let (_tx, events) = ComputeEvents::channel(8);
        let (mut router, _handle) = EventRouter::new(events);
        let _ = router.handle_event(ComputeEvent::Error {
            compute_id: id(5),
            cause: "boom".to_string(),
        });
        let _ = router.handle_cmd(RouterCmd::Track(id(5)));
        assert!(router.untracked.is_empty());
        assert_eq!(router.unclaimed.get(&id(5)), Some(&Err("boom".to_string())));
    }
}
