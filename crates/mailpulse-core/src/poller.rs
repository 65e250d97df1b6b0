//! The background loop that polls the unseen count.
//!
//! One task runs the cycles back to back: query, evaluate, wait. Cycles
//! never overlap, so [`PollState`] lives in the loop without locking.
//! Failed queries are logged and the loop keeps going. Cancellation is
//! checked before each cycle and raced against the wait.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ConfigSource;
use crate::notifier::{ChangeNotifier, NewMailDetected, Subscribers};
use crate::snapshot::MailboxSnapshot;
use crate::transport::MailTransport;

/// Shortest wait between polls, whatever the settings say.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Applies the [`MIN_POLL_INTERVAL`] floor to a configured interval.
#[must_use]
pub fn effective_interval(seconds: u64) -> Duration {
    Duration::from_secs(seconds).max(MIN_POLL_INTERVAL)
}

/// Abstraction over waiting, so tests can drive the loop without real
/// timers.
pub trait Sleeper: Send + Sync {
    /// Completes after `duration`.
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send;
}

/// Sleeps on the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }
}

/// Where the loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PollPhase {
    /// Created, not started.
    #[default]
    Idle,
    /// Started, between steps.
    Running,
    /// Waiting on the unseen-count query.
    Querying,
    /// Comparing the new count and notifying.
    Evaluating,
    /// Sleeping until the next cycle.
    Waiting,
    /// Finished after cancellation.
    Stopped,
}

/// State carried from one cycle to the next.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollState {
    notifier: ChangeNotifier,
    cycles: u64,
    failed_cycles: u64,
}

impl PollState {
    /// Last successfully observed unseen count.
    #[must_use]
    pub const fn last_unseen(&self) -> Option<u32> {
        self.notifier.last_unseen()
    }

    /// Cycles started, including failed and cancelled ones.
    #[must_use]
    pub const fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Cycles whose query failed.
    #[must_use]
    pub const fn failed_cycles(&self) -> u64 {
        self.failed_cycles
    }
}

/// Polls the unseen count and notifies subscribers when it changes.
#[derive(Debug)]
pub struct PollingLoop<T, C, Sl = TokioSleeper> {
    snapshot: MailboxSnapshot<T, C>,
    subscribers: Arc<Subscribers>,
    sleeper: Sl,
    phase: PollPhase,
    state: PollState,
}

impl<T, C> PollingLoop<T, C>
where
    T: MailTransport,
    C: ConfigSource,
{
    /// Creates a loop that sleeps on the tokio timer.
    #[must_use]
    pub fn new(snapshot: MailboxSnapshot<T, C>, subscribers: Arc<Subscribers>) -> Self {
        Self {
            snapshot,
            subscribers,
            sleeper: TokioSleeper,
            phase: PollPhase::Idle,
            state: PollState::default(),
        }
    }
}

impl<T, C, Sl> PollingLoop<T, C, Sl>
where
    T: MailTransport,
    C: ConfigSource,
    Sl: Sleeper,
{
    /// Replaces the sleeper.
    #[must_use]
    pub fn with_sleeper<S2: Sleeper>(self, sleeper: S2) -> PollingLoop<T, C, S2> {
        PollingLoop {
            snapshot: self.snapshot,
            subscribers: self.subscribers,
            sleeper,
            phase: self.phase,
            state: self.state,
        }
    }

    /// Current phase.
    #[must_use]
    pub const fn phase(&self) -> PollPhase {
        self.phase
    }

    /// State after the cycles run so far.
    #[must_use]
    pub const fn state(&self) -> &PollState {
        &self.state
    }

    /// Runs cycles until `cancel` fires.
    pub async fn run(&mut self, cancel: &CancellationToken) {
        self.phase = PollPhase::Running;
        tracing::info!("mail polling started");

        while !cancel.is_cancelled() {
            self.poll_once(cancel).await;
            if cancel.is_cancelled() {
                break;
            }

            self.phase = PollPhase::Waiting;
            let seconds = self.snapshot.config().current().await.polling_interval_seconds;
            let interval = effective_interval(seconds);
            tracing::debug!(?interval, "waiting for next poll");

            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = self.sleeper.sleep(interval) => {}
            }
        }

        self.phase = PollPhase::Stopped;
        tracing::info!(
            cycles = self.state.cycles,
            failed = self.state.failed_cycles,
            "mail polling stopped"
        );
    }

    /// Runs one query and evaluation.
    ///
    /// Returns the event dispatched to subscribers, if the count changed.
    pub async fn poll_once(&mut self, cancel: &CancellationToken) -> Option<NewMailDetected> {
        self.phase = PollPhase::Querying;
        self.state.cycles += 1;

        let result = self.snapshot.unseen_count(cancel).await;
        let event = match result {
            Ok(unseen) => {
                self.phase = PollPhase::Evaluating;
                let event = self.state.notifier.observe(unseen);
                if let Some(event) = &event {
                    tracing::info!(unseen = event.unseen_count, "unseen count changed");
                    self.subscribers.dispatch(event);
                }
                event
            }
            Err(error) if error.is_cancelled() => {
                tracing::debug!("poll cancelled during query");
                None
            }
            Err(error) => {
                self.state.failed_cycles += 1;
                tracing::error!(%error, "failed to check for new mail");
                None
            }
        };

        self.phase = PollPhase::Running;
        event
    }
}

impl<T, C, Sl> PollingLoop<T, C, Sl>
where
    T: MailTransport + 'static,
    C: ConfigSource + 'static,
    Sl: Sleeper + 'static,
{
    /// Runs the loop on a new task; the handle yields the final state.
    pub fn spawn(mut self, cancel: CancellationToken) -> JoinHandle<PollState> {
        tokio::spawn(async move {
            self.run(&cancel).await;
            self.state
        })
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;
    use crate::config::{FileConfig, ImapSettings, Settings, SharedConfig, SmtpSettings};
    use crate::error::{Error, Result};
    use crate::snapshot::MessageSummary;
    use crate::transport::{OutgoingEmail, cancellable};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, Copy)]
    enum Step {
        Count(u32),
        Fail,
        Hang,
    }

    #[derive(Debug, Default)]
    struct ScriptedTransport {
        script: Mutex<VecDeque<Step>>,
        calls: AtomicUsize,
        endpoints: Mutex<Vec<(String, String)>>,
    }

    impl ScriptedTransport {
        fn new(steps: &[Step]) -> Self {
            Self {
                script: Mutex::new(steps.iter().copied().collect()),
                calls: AtomicUsize::new(0),
                endpoints: Mutex::new(Vec::new()),
            }
        }

        fn endpoints(&self) -> Vec<(String, String)> {
            self.endpoints.lock().unwrap().clone()
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl MailTransport for ScriptedTransport {
        async fn send(&self, _: &OutgoingEmail, _: &SmtpSettings, _: &CancellationToken) -> Result<()> {
            Ok(())
        }

        async fn query_unseen_count(&self, config: &ImapSettings, cancel: &CancellationToken) -> Result<u32> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.endpoints
                .lock()
                .unwrap()
                .push((config.host.clone(), config.folder().to_string()));
            let step = self.script.lock().unwrap().pop_front().unwrap_or(Step::Count(0));
            match step {
                Step::Count(n) => Ok(n),
                Step::Fail => Err(Error::Config("server unreachable".into())),
                Step::Hang => cancellable(cancel, std::future::pending()).await,
            }
        }

        async fn query_recent(
            &self,
            _: &ImapSettings,
            _: usize,
            _: &CancellationToken,
        ) -> Result<Vec<MessageSummary>> {
            Ok(Vec::new())
        }
    }

    /// Returns immediately for the first `budget` sleeps, then cancels the
    /// token and never completes.
    struct StepSleeper {
        budget: usize,
        cancel: CancellationToken,
        waits: Mutex<Vec<Duration>>,
        on_sleep: Box<dyn Fn(usize) + Send + Sync>,
    }

    impl StepSleeper {
        fn new(budget: usize, cancel: &CancellationToken) -> Self {
            Self {
                budget,
                cancel: cancel.clone(),
                waits: Mutex::new(Vec::new()),
                on_sleep: Box::new(|_| {}),
            }
        }
    }

    impl Sleeper for StepSleeper {
        fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send {
            let index = {
                let mut waits = self.waits.lock().unwrap();
                waits.push(duration);
                waits.len() - 1
            };
            (self.on_sleep)(index);
            let exhausted = index >= self.budget;
            if exhausted {
                self.cancel.cancel();
            }
            async move {
                if exhausted {
                    std::future::pending::<()>().await;
                }
            }
        }
    }

    fn settings(interval: u64) -> Settings {
        Settings {
            polling_interval_seconds: interval,
            ..Settings::default()
        }
    }

    fn polling_loop(
        transport: &Arc<ScriptedTransport>,
        config: &Arc<SharedConfig>,
        subscribers: &Arc<Subscribers>,
    ) -> PollingLoop<ScriptedTransport, SharedConfig> {
        let snapshot = MailboxSnapshot::new(Arc::clone(transport), Arc::clone(config));
        PollingLoop::new(snapshot, Arc::clone(subscribers))
    }

    fn recorder(subscribers: &Subscribers) -> Arc<Mutex<Vec<u32>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        subscribers.subscribe(move |e| sink.lock().unwrap().push(e.unseen_count));
        seen
    }

    #[test]
    fn interval_has_a_floor() {
        assert_eq!(effective_interval(0), MIN_POLL_INTERVAL);
        assert_eq!(effective_interval(1), Duration::from_secs(5));
        assert_eq!(effective_interval(60), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn emits_only_on_change() {
        use Step::Count;
        let transport = Arc::new(ScriptedTransport::new(&[Count(0), Count(0), Count(3), Count(3), Count(0)]));
        let config = Arc::new(SharedConfig::new(settings(60)));
        let subscribers = Arc::new(Subscribers::new());
        let seen = recorder(&subscribers);
        let cancel = CancellationToken::new();

        let mut polling = polling_loop(&transport, &config, &subscribers)
            .with_sleeper(StepSleeper::new(4, &cancel));
        assert_eq!(polling.phase(), PollPhase::Idle);
        polling.run(&cancel).await;

        assert_eq!(transport.calls(), 5);
        assert_eq!(*seen.lock().unwrap(), vec![0, 3, 0]);
        assert_eq!(polling.phase(), PollPhase::Stopped);
        assert_eq!(polling.state().last_unseen(), Some(0));
    }

    #[tokio::test]
    async fn failed_query_keeps_state_and_continues() {
        use Step::{Count, Fail};
        let transport = Arc::new(ScriptedTransport::new(&[Count(2), Fail, Count(2), Count(5)]));
        let config = Arc::new(SharedConfig::new(settings(60)));
        let subscribers = Arc::new(Subscribers::new());
        let seen = recorder(&subscribers);
        let cancel = CancellationToken::new();

        let mut polling = polling_loop(&transport, &config, &subscribers)
            .with_sleeper(StepSleeper::new(3, &cancel));
        polling.run(&cancel).await;

        assert_eq!(*seen.lock().unwrap(), vec![2, 5]);
        assert_eq!(polling.state().cycles(), 4);
        assert_eq!(polling.state().failed_cycles(), 1);
        assert_eq!(polling.state().last_unseen(), Some(5));
    }

    #[tokio::test]
    async fn failure_before_first_success_leaves_sentinel() {
        let transport = Arc::new(ScriptedTransport::new(&[Step::Fail]));
        let config = Arc::new(SharedConfig::new(settings(60)));
        let subscribers = Arc::new(Subscribers::new());
        let cancel = CancellationToken::new();

        let mut polling = polling_loop(&transport, &config, &subscribers);
        assert_eq!(polling.poll_once(&cancel).await, None);
        assert_eq!(polling.state().last_unseen(), None);
        assert_eq!(
            polling.poll_once(&cancel).await,
            Some(NewMailDetected { unseen_count: 0 })
        );
    }

    #[tokio::test]
    async fn cancel_during_wait_runs_no_further_cycle() {
        let transport = Arc::new(ScriptedTransport::new(&[]));
        let config = Arc::new(SharedConfig::new(settings(60)));
        let subscribers = Arc::new(Subscribers::new());
        let cancel = CancellationToken::new();

        let sleeper = StepSleeper::new(0, &cancel);
        let mut polling = polling_loop(&transport, &config, &subscribers).with_sleeper(sleeper);
        polling.run(&cancel).await;

        assert_eq!(transport.calls(), 1);
        assert_eq!(polling.state().cycles(), 1);
    }

    #[tokio::test]
    async fn cancel_during_query_is_not_a_failure() {
        let transport = Arc::new(ScriptedTransport::new(&[Step::Hang]));
        let config = Arc::new(SharedConfig::new(settings(60)));
        let subscribers = Arc::new(Subscribers::new());
        let cancel = CancellationToken::new();

        let handle = polling_loop(&transport, &config, &subscribers).spawn(cancel.clone());
        while transport.calls() == 0 {
            tokio::task::yield_now().await;
        }
        cancel.cancel();
        let state = handle.await.unwrap();

        assert_eq!(transport.calls(), 1);
        assert_eq!(state.failed_cycles(), 0);
        assert_eq!(state.last_unseen(), None);
    }

    #[tokio::test]
    async fn already_cancelled_loop_never_queries() {
        let transport = Arc::new(ScriptedTransport::new(&[]));
        let config = Arc::new(SharedConfig::new(settings(60)));
        let subscribers = Arc::new(Subscribers::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let state = polling_loop(&transport, &config, &subscribers)
            .spawn(cancel)
            .await
            .unwrap();
        assert_eq!(state.cycles(), 0);
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn interval_is_reread_every_cycle() {
        let transport = Arc::new(ScriptedTransport::new(&[]));
        let config = Arc::new(SharedConfig::new(settings(1)));
        let subscribers = Arc::new(Subscribers::new());
        let cancel = CancellationToken::new();

        let mut sleeper = StepSleeper::new(2, &cancel);
        let reloaded = Arc::clone(&config);
        sleeper.on_sleep = Box::new(move |index| {
            if index == 0 {
                reloaded.update(|s| s.polling_interval_seconds = 30);
            }
        });

        let mut polling = polling_loop(&transport, &config, &subscribers).with_sleeper(sleeper);
        polling.run(&cancel).await;

        let waits = polling.sleeper.waits.lock().unwrap().clone();
        assert_eq!(
            waits,
            vec![Duration::from_secs(5), Duration::from_secs(30), Duration::from_secs(30)]
        );
    }

    #[tokio::test]
    async fn endpoint_change_applies_next_cycle() {
        let mut initial = settings(60);
        initial.imap.host = "imap.one.example".into();
        let transport = Arc::new(ScriptedTransport::new(&[]));
        let config = Arc::new(SharedConfig::new(initial));
        let subscribers = Arc::new(Subscribers::new());
        let cancel = CancellationToken::new();

        let mut sleeper = StepSleeper::new(1, &cancel);
        let reloaded = Arc::clone(&config);
        sleeper.on_sleep = Box::new(move |index| {
            if index == 0 {
                reloaded.update(|s| {
                    s.imap.host = "imap.two.example".into();
                    s.imap.folder = "Archive".into();
                });
            }
        });

        let mut polling = polling_loop(&transport, &config, &subscribers).with_sleeper(sleeper);
        polling.run(&cancel).await;

        assert_eq!(
            transport.endpoints(),
            vec![
                ("imap.one.example".to_string(), "INBOX".to_string()),
                ("imap.two.example".to_string(), "Archive".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn file_edits_reach_the_next_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"imap": {"host": "imap.one.example"}}"#).unwrap();
        let config = Arc::new(FileConfig::open(&path).await.unwrap());

        let transport = Arc::new(ScriptedTransport::new(&[]));
        let subscribers = Arc::new(Subscribers::new());
        let cancel = CancellationToken::new();

        let mut sleeper = StepSleeper::new(1, &cancel);
        sleeper.on_sleep = Box::new(move |index| {
            if index == 0 {
                std::fs::write(&path, r#"{"imap": {"host": "imap.two.example", "folder": "Sent"}}"#)
                    .unwrap();
            }
        });

        let snapshot = MailboxSnapshot::new(Arc::clone(&transport), config);
        let mut polling = PollingLoop::new(snapshot, subscribers).with_sleeper(sleeper);
        polling.run(&cancel).await;

        assert_eq!(
            transport.endpoints(),
            vec![
                ("imap.one.example".to_string(), "INBOX".to_string()),
                ("imap.two.example".to_string(), "Sent".to_string()),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn short_interval_still_waits_five_seconds() {
        let transport = Arc::new(ScriptedTransport::new(&[]));
        let config = Arc::new(SharedConfig::new(settings(1)));
        let subscribers = Arc::new(Subscribers::new());
        let cancel = CancellationToken::new();

        let handle = polling_loop(&transport, &config, &subscribers).spawn(cancel.clone());

        tokio::time::sleep(Duration::from_millis(4_900)).await;
        assert_eq!(transport.calls(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(transport.calls(), 2);

        cancel.cancel();
        let state = handle.await.unwrap();
        assert_eq!(state.cycles(), 2);
    }
}
