//! Request orchestration for the claim progress and chat streams.
//!
//! [`ClaimPipeline`] and [`ChatSession`] drive requests from dispatch to a
//! terminal state. A chat session has one question in flight at most; a
//! claim pipeline publishes only its latest submission:
//!
//! ```text
//! Idle -> Dispatching -> Streaming -> Completed | Failed
//! ```
//!
//! Terminal state is applied by drop guards, so it is reached on every exit
//! path: a returned error, a panic in an observer, or the caller dropping
//! the request future part way through the body.
//!
//! The two types share nothing. A claim can be resubmitted while a chat
//! answer is still streaming and the other way round.

use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::{Stream, StreamExt, pin_mut};
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::{
    chat::{CHAT_ERROR_MESSAGE, ChatObserver, ChatTurn, Conversation, TextAccumulator},
    client::ClaimsClient,
    decoder::decode_records,
    error::{Result, StreamError},
    history::ClaimHistory,
    progress::{ProgressObserver, ProgressState, RequestPhase},
    record::StreamRecord,
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Short description of a finished run for the history list
pub fn summarize(state: &ProgressState) -> Option<String> {
    if let Some(error) = &state.error {
        return Some(error.clone());
    }
    state.records.iter().find_map(|record| {
        record
            .str_field("error")
            .or_else(|| record.str_field("summary"))
            .or_else(|| record.str_field("decision"))
            .map(str::to_string)
    })
}

/// Drives claim text and file submissions through the progress stream
pub struct ClaimPipeline {
    client: ClaimsClient,
    state: Arc<Mutex<ProgressState>>,
    observers: Vec<Arc<dyn ProgressObserver>>,
    history: Option<ClaimHistory>,
}

impl ClaimPipeline {
    pub fn new(client: ClaimsClient) -> Self {
        Self {
            client,
            state: Arc::new(Mutex::new(ProgressState::new())),
            observers: Vec::new(),
            history: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Record each submission in `history` and resolve it when the run ends
    pub fn with_history(mut self, history: ClaimHistory) -> Self {
        self.history = Some(history);
        self
    }

    pub fn snapshot(&self) -> ProgressState {
        lock(&self.state).clone()
    }

    pub fn is_active(&self) -> bool {
        lock(&self.state).is_active
    }

    /// Submit free-text claim input and stream the pipeline's progress
    pub async fn submit_text(&self, claim_description: &str) -> Result<ProgressState> {
        if claim_description.trim().is_empty() {
            return Err(StreamError::EmptyClaim);
        }
        self.run("text", claim_description, async {
            let response = self.client.process_claim(claim_description).await?;
            Ok::<_, StreamError>(response.bytes_stream())
        })
        .await
    }

    /// Upload a claim document and stream the pipeline's progress
    pub async fn submit_file(&self, path: &Path) -> Result<ProgressState> {
        let label = path.display().to_string();
        self.run("file", &label, async {
            let response = self.client.process_file(path).await?;
            Ok::<_, StreamError>(response.bytes_stream())
        })
        .await
    }

    /// Run one request. `open_body` dispatches it and resolves to the body once headers arrive.
    async fn run<F, S, B, E>(&self, kind: &str, label: &str, open_body: F) -> Result<ProgressState>
    where
        F: Future<Output = Result<S>>,
        S: Stream<Item = std::result::Result<B, E>>,
        B: AsRef<[u8]>,
        E: Into<BoxError>,
    {
        let request_id = Uuid::new_v4();
        let span = info_span!("claim_run", request_id = %request_id, kind = %kind);

        async move {
            let mut guard = RunGuard::begin(self, request_id);
            info!("Dispatching claim request");

            if let Some(history) = &self.history {
                match history.create(label).await {
                    Ok(entry) => guard.entry_id = Some(entry.id),
                    Err(e) => warn!(error = %e, "Failed to record claim in history"),
                }
            }

            let outcome = self.stream_body(&mut guard, open_body).await;
            let final_state = match &outcome {
                Ok(()) => guard.finish(RequestPhase::Completed, None),
                Err(e) => {
                    error!(error = %e, "Claim run failed");
                    guard.finish(RequestPhase::Failed, Some(e.to_string()))
                }
            };
            info!(
                records = final_state.records.len(),
                stages = final_state.seen_stages.len(),
                phase = ?final_state.phase,
                "Claim run finished"
            );

            if let (Some(history), Some(entry_id)) = (&self.history, guard.entry_id) {
                resolve_history(history, entry_id, &final_state).await;
            }

            outcome.map(|()| final_state)
        }
        .instrument(span)
        .await
    }

    async fn stream_body<F, S, B, E>(&self, guard: &mut RunGuard<'_>, open_body: F) -> Result<()>
    where
        F: Future<Output = Result<S>>,
        S: Stream<Item = std::result::Result<B, E>>,
        B: AsRef<[u8]>,
        E: Into<BoxError>,
    {
        let body = open_body.await?;
        guard.streaming();

        let records = decode_records(body);
        pin_mut!(records);
        while let Some(record) = records.next().await {
            guard.apply(record?);
        }
        Ok(())
    }
}

/// Marks a run active on creation and inactive exactly once afterwards.
///
/// The guard keeps its own copy of the run's progress. The shared state and
/// the observers only see a run while it is the latest one submitted; once
/// a newer run has called `begin`, an older run keeps streaming into its
/// own copy alone.
struct RunGuard<'a> {
    pipeline: &'a ClaimPipeline,
    request_id: Uuid,
    entry_id: Option<Uuid>,
    local: ProgressState,
    finished: bool,
}

impl<'a> RunGuard<'a> {
    fn begin(pipeline: &'a ClaimPipeline, request_id: Uuid) -> Self {
        let mut local = ProgressState::new();
        local.begin(request_id);
        *lock(&pipeline.state) = local.clone();
        for observer in &pipeline.observers {
            observer.on_reset(request_id);
        }
        Self {
            pipeline,
            request_id,
            entry_id: None,
            local,
            finished: false,
        }
    }

    /// Run `update` on the local copy, and on the shared state if this run still owns it.
    /// Returns the shared snapshot when it was updated.
    fn update(&mut self, update: impl Fn(&mut ProgressState)) -> Option<ProgressState> {
        update(&mut self.local);
        let mut state = lock(&self.pipeline.state);
        if state.request_id != Some(self.request_id) {
            return None;
        }
        update(&mut *state);
        Some(state.clone())
    }

    fn streaming(&mut self) {
        if self
            .update(|state| state.phase = RequestPhase::Streaming)
            .is_some()
        {
            for observer in &self.pipeline.observers {
                observer.on_streaming(self.request_id);
            }
        }
    }

    fn apply(&mut self, record: StreamRecord) {
        match self.update(|state| {
            state.apply(record.clone());
        }) {
            Some(snapshot) => {
                for observer in &self.pipeline.observers {
                    observer.on_record(&record, &snapshot);
                }
            }
            None => debug!(stage = %record.stage, "Record from superseded run kept out of shared state"),
        }
    }

    fn finish(&mut self, phase: RequestPhase, error: Option<String>) -> ProgressState {
        self.finished = true;
        let owned = self.update(|state| {
            state.is_active = false;
            state.phase = phase;
            state.error = error.clone();
        });
        if let Some(snapshot) = owned {
            for observer in &self.pipeline.observers {
                observer.on_finished(&snapshot);
            }
        }
        self.local.clone()
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        warn!(request_id = %self.request_id, "Claim run dropped before completion");
        let state = self.finish(RequestPhase::Failed, Some(StreamError::Cancelled.to_string()));

        // history writes are async, hand them to the runtime if there is one
        if let (Some(history), Some(entry_id)) = (self.pipeline.history.clone(), self.entry_id) {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { resolve_history(&history, entry_id, &state).await });
            }
        }
    }
}

async fn resolve_history(history: &ClaimHistory, entry_id: Uuid, state: &ProgressState) {
    let summary = summarize(state);
    let failed = state.phase == RequestPhase::Failed || state.has_error_stage();
    let result = if failed {
        history.fail(entry_id, summary).await
    } else {
        history.complete(entry_id, summary).await
    };
    if let Err(e) = result {
        warn!(entry_id = %entry_id, error = %e, "Failed to update claim history");
    }
}

/// Follow-up questions over a finished claim, answered as raw text streams
pub struct ChatSession {
    client: ClaimsClient,
    conversation: Arc<Mutex<Conversation>>,
    in_flight: AtomicBool,
    observers: Vec<Arc<dyn ChatObserver>>,
}

impl ChatSession {
    pub fn new(client: ClaimsClient) -> Self {
        Self {
            client,
            conversation: Arc::new(Mutex::new(Conversation::new())),
            in_flight: AtomicBool::new(false),
            observers: Vec::new(),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn ChatObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn conversation(&self) -> Conversation {
        lock(&self.conversation).clone()
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn clear(&self) {
        lock(&self.conversation).clear();
    }

    /// Ask `question` about `claim_data` and stream the answer into a new assistant turn.
    ///
    /// Fails with [`StreamError::ChatBusy`] while another answer is streaming.
    /// On any other failure the assistant turn is sealed with
    /// [`CHAT_ERROR_MESSAGE`] before the error is returned.
    pub async fn send(&self, claim_data: &str, question: &str) -> Result<ChatTurn> {
        self.exchange(question, async {
            let response = self.client.chat(claim_data, question).await?;
            Ok::<_, StreamError>(response.bytes_stream())
        })
        .await
    }

    async fn exchange<F, S, B, E>(&self, question: &str, open_body: F) -> Result<ChatTurn>
    where
        F: Future<Output = Result<S>>,
        S: Stream<Item = std::result::Result<B, E>>,
        B: AsRef<[u8]>,
        E: Into<BoxError>,
    {
        if question.trim().is_empty() {
            return Err(StreamError::EmptyQuestion);
        }
        let _flight = InFlight::acquire(&self.in_flight)?;

        let request_id = Uuid::new_v4();
        let span = info_span!("chat_send", request_id = %request_id);

        async move {
            let turn = {
                let mut conversation = lock(&self.conversation);
                conversation.push_user(question);
                conversation.open_assistant()?
            };
            for observer in &self.observers {
                observer.on_turn_opened(&turn);
            }

            let mut seal = TurnGuard {
                session: self,
                sealed: false,
            };
            info!(turn_id = %turn.id, "Dispatching chat question");

            match self.stream_answer(turn.id, open_body).await {
                Ok(answer) => {
                    info!(turn_id = %turn.id, length = answer.len(), "Chat answer complete");
                    Ok(seal.seal(Some(answer.as_str()), false).unwrap_or(turn))
                }
                Err(e) => {
                    error!(turn_id = %turn.id, error = %e, "Chat stream failed");
                    seal.seal(Some(CHAT_ERROR_MESSAGE), true);
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn stream_answer<F, S, B, E>(&self, turn_id: Uuid, open_body: F) -> Result<String>
    where
        F: Future<Output = Result<S>>,
        S: Stream<Item = std::result::Result<B, E>>,
        B: AsRef<[u8]>,
        E: Into<BoxError>,
    {
        let body = open_body.await?;
        pin_mut!(body);

        let mut answer = TextAccumulator::new();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| StreamError::Body(e.into()))?;
            let content = answer.push(chunk.as_ref());
            lock(&self.conversation).update_open(content);
            for observer in &self.observers {
                observer.on_chunk(turn_id, content);
            }
        }
        Ok(answer.finish())
    }
}

/// Holds the chat in-flight flag for the lifetime of one send
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| Self(flag))
            .map_err(|_| StreamError::ChatBusy)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Seals the open assistant turn exactly once
struct TurnGuard<'a> {
    session: &'a ChatSession,
    sealed: bool,
}

impl TurnGuard<'_> {
    fn seal(&mut self, content: Option<&str>, failed: bool) -> Option<ChatTurn> {
        self.sealed = true;
        let turn = lock(&self.session.conversation).seal_open(content)?;
        for observer in &self.session.observers {
            observer.on_turn_sealed(&turn, failed);
        }
        Some(turn)
    }
}

impl Drop for TurnGuard<'_> {
    fn drop(&mut self) {
        if !self.sealed {
            self.seal(Some(CHAT_ERROR_MESSAGE), true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use futures::stream;
    use std::sync::atomic::AtomicUsize;

    type Chunk = std::result::Result<Vec<u8>, std::io::Error>;

    fn client() -> ClaimsClient {
        ClaimsClient::new(ClientConfig::default()).unwrap()
    }

    fn ok(bytes: &str) -> Chunk {
        Ok(bytes.as_bytes().to_vec())
    }

    fn opened<S>(body: S) -> std::future::Ready<Result<S>> {
        std::future::ready(Ok(body))
    }

    fn reset() -> Chunk {
        Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "connection reset"))
    }

    #[derive(Default)]
    struct Recorder {
        resets: AtomicUsize,
        finished: AtomicUsize,
        active_when_finished: AtomicUsize,
        stages: Mutex<Vec<String>>,
        chunks: Mutex<Vec<String>>,
        sealed_failed: Mutex<Vec<bool>>,
    }

    impl ProgressObserver for Recorder {
        fn on_reset(&self, _request_id: Uuid) {
            self.resets.fetch_add(1, Ordering::SeqCst);
        }

        fn on_record(&self, record: &StreamRecord, state: &ProgressState) {
            assert!(state.is_active);
            lock(&self.stages).push(record.stage.clone());
        }

        fn on_finished(&self, state: &ProgressState) {
            self.finished.fetch_add(1, Ordering::SeqCst);
            if state.is_active {
                self.active_when_finished.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    impl ChatObserver for Recorder {
        fn on_chunk(&self, _turn_id: Uuid, content: &str) {
            lock(&self.chunks).push(content.to_string());
        }

        fn on_turn_sealed(&self, _turn: &ChatTurn, failed: bool) {
            lock(&self.sealed_failed).push(failed);
        }
    }

    #[tokio::test]
    async fn test_claim_run_completes() {
        let recorder = Arc::new(Recorder::default());
        let pipeline = ClaimPipeline::new(client()).with_observer(recorder.clone());

        let chunks = vec![
            ok("{\"node\":\"Intake Node\",\"data\":{\"member_id\":\"M1\"}}\n{\"node\":\"Risk"),
            ok(" Analyze Node\",\"data\":{\"risk_score\":10}}\n"),
        ];
        let state = pipeline
            .run("text", "claim", opened(stream::iter(chunks)))
            .await
            .unwrap();

        assert_eq!(state.phase, RequestPhase::Completed);
        assert!(!state.is_active);
        assert_eq!(state.seen_stages, vec!["Intake Node", "Risk Analyze Node"]);
        assert_eq!(*lock(&recorder.stages), vec!["Intake Node", "Risk Analyze Node"]);
        assert_eq!(recorder.resets.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.finished.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.active_when_finished.load(Ordering::SeqCst), 0);
        assert!(!pipeline.is_active());
    }

    #[tokio::test]
    async fn test_claim_run_body_failure_keeps_partial_records() {
        let recorder = Arc::new(Recorder::default());
        let pipeline = ClaimPipeline::new(client()).with_observer(recorder.clone());

        let chunks = vec![ok("{\"node\":\"Intake Node\",\"data\":{}}\n"), reset()];
        let result = pipeline
            .run("text", "claim", opened(stream::iter(chunks)))
            .await;

        assert!(matches!(result, Err(StreamError::Body(_))));
        let state = pipeline.snapshot();
        assert_eq!(state.phase, RequestPhase::Failed);
        assert!(!state.is_active);
        assert_eq!(state.records.len(), 1);
        assert!(state.error.as_deref().unwrap().contains("connection reset"));
        assert_eq!(recorder.finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_claim_run_dispatch_failure_never_streams() {
        let pipeline = ClaimPipeline::new(client());
        let result = pipeline
            .run(
                "text",
                "claim",
                std::future::ready(Result::<stream::Iter<std::vec::IntoIter<Chunk>>>::Err(
                    StreamError::Http {
                        status: 502,
                        body: "bad gateway".to_string(),
                    },
                )),
            )
            .await;

        assert!(matches!(result, Err(StreamError::Http { status: 502, .. })));
        let state = pipeline.snapshot();
        assert_eq!(state.phase, RequestPhase::Failed);
        assert!(state.records.is_empty());
        assert!(state.error.unwrap().contains("bad gateway"));
    }

    #[tokio::test]
    async fn test_dropped_run_is_resolved() {
        let recorder = Arc::new(Recorder::default());
        let history = ClaimHistory::in_memory();
        let pipeline = ClaimPipeline::new(client())
            .with_observer(recorder.clone())
            .with_history(history.clone());

        let chunks = stream::iter(vec![ok("{\"node\":\"Intake Node\",\"data\":{}}\n")])
            .chain(stream::pending());
        let run = pipeline.run("text", "claim", opened(chunks));
        let timed_out =
            tokio::time::timeout(std::time::Duration::from_millis(50), run).await;
        assert!(timed_out.is_err());

        let state = pipeline.snapshot();
        assert!(!state.is_active);
        assert_eq!(state.phase, RequestPhase::Failed);
        assert_eq!(state.records.len(), 1);
        assert_eq!(recorder.finished.load(Ordering::SeqCst), 1);

        // the history update was spawned from the guard
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let entries = history.list().await.unwrap();
        assert_eq!(entries[0].status, crate::history::ClaimStatus::Failed);
    }

    #[tokio::test]
    async fn test_resubmit_discards_previous_results() {
        let pipeline = ClaimPipeline::new(client());
        let first = vec![ok("{\"node\":\"Intake Node\",\"data\":{}}\n{\"node\":\"Policy Node\",\"data\":{}}\n")];
        pipeline
            .run("text", "first", opened(stream::iter(first)))
            .await
            .unwrap();

        let second = vec![ok("{\"node\":\"Routing Node\",\"data\":{}}")];
        let state = pipeline
            .run("text", "second", opened(stream::iter(second)))
            .await
            .unwrap();
        assert_eq!(state.seen_stages, vec!["Routing Node"]);
        assert_eq!(state.records.len(), 1);
    }

    async fn until(mut done: impl FnMut() -> bool) {
        while !done() {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_superseded_run_leaves_newer_run_alone() {
        let recorder = Arc::new(Recorder::default());
        let pipeline = Arc::new(ClaimPipeline::new(client()).with_observer(recorder.clone()));
        let (tx_a, rx_a) = futures::channel::mpsc::unbounded::<Chunk>();
        let (tx_b, rx_b) = futures::channel::mpsc::unbounded::<Chunk>();

        let first = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.run("text", "first", opened(rx_a)).await })
        };
        until(|| pipeline.snapshot().phase == RequestPhase::Streaming).await;
        let first_id = pipeline.snapshot().request_id;

        let second = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.run("text", "second", opened(rx_b)).await })
        };
        until(|| pipeline.snapshot().request_id != first_id).await;

        tx_a.unbounded_send(ok("{\"node\":\"Stale Node\"}\n")).unwrap();
        drop(tx_a);
        let stale = first.await.unwrap().unwrap();
        assert_eq!(stale.seen_stages, vec!["Stale Node"]);
        assert_eq!(stale.phase, RequestPhase::Completed);

        // the older run ended without touching the newer one
        let state = pipeline.snapshot();
        assert!(state.is_active);
        assert_eq!(state.phase, RequestPhase::Streaming);
        assert!(state.records.is_empty());
        assert_eq!(recorder.finished.load(Ordering::SeqCst), 0);

        tx_b.unbounded_send(ok("{\"node\":\"Routing Node\"}\n")).unwrap();
        drop(tx_b);
        let state = second.await.unwrap().unwrap();
        assert_eq!(state.seen_stages, vec!["Routing Node"]);
        assert_eq!(pipeline.snapshot().seen_stages, vec!["Routing Node"]);
        assert!(!pipeline.is_active());
        assert_eq!(*lock(&recorder.stages), vec!["Routing Node"]);
        assert_eq!(recorder.resets.load(Ordering::SeqCst), 2);
        assert_eq!(recorder.finished.load(Ordering::SeqCst), 1);
    }

    /// Store whose writes wait until permits are added
    struct GatedStore {
        inner: crate::history::InMemoryStore,
        gate: tokio::sync::Semaphore,
    }

    #[async_trait::async_trait]
    impl crate::history::KeyValueStore for GatedStore {
        async fn read(&self, key: &str) -> Result<Option<String>> {
            self.inner.read(key).await
        }

        async fn write(&self, key: &str, value: String) -> Result<()> {
            let _permit = self
                .gate
                .acquire()
                .await
                .map_err(|e| StreamError::Storage(e.to_string()))?;
            self.inner.write(key, value).await
        }

        async fn remove(&self, key: &str) -> Result<()> {
            self.inner.remove(key).await
        }
    }

    #[tokio::test]
    async fn test_run_is_active_before_history_write() {
        let store = Arc::new(GatedStore {
            inner: crate::history::InMemoryStore::new(),
            gate: tokio::sync::Semaphore::new(0),
        });
        let history = ClaimHistory::new(store.clone());
        let pipeline = Arc::new(ClaimPipeline::new(client()).with_history(history.clone()));

        let chunks = vec![ok("{\"node\":\"Intake Node\",\"data\":{}}\n")];
        let run = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.run("text", "claim", opened(stream::iter(chunks))).await })
        };
        until(|| pipeline.is_active()).await;
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        let state = pipeline.snapshot();
        assert_eq!(state.phase, RequestPhase::Dispatching);
        assert!(state.records.is_empty());

        store.gate.add_permits(16);
        let state = run.await.unwrap().unwrap();
        assert_eq!(state.records.len(), 1);
        let entries = history.list().await.unwrap();
        assert_eq!(entries[0].status, crate::history::ClaimStatus::Completed);
    }

    #[tokio::test]
    async fn test_chat_progressive_content() {
        let recorder = Arc::new(Recorder::default());
        let session = ChatSession::new(client()).with_observer(recorder.clone());

        let chunks = vec![ok("Hel"), ok("lo, "), ok("world")];
        let turn = session
            .exchange("What was decided?", opened(stream::iter(chunks)))
            .await
            .unwrap();

        assert_eq!(turn.content, "Hello, world");
        assert!(!turn.open);
        assert_eq!(*lock(&recorder.chunks), vec!["Hel", "Hello, ", "Hello, world"]);
        assert_eq!(*lock(&recorder.sealed_failed), vec![false]);

        let conversation = session.conversation();
        assert_eq!(conversation.turns().len(), 2);
        assert_eq!(conversation.turns()[0].content, "What was decided?");
        assert!(conversation.open_turn().is_none());
        assert!(!session.is_in_flight());
    }

    #[tokio::test]
    async fn test_chat_mid_stream_failure_overwrites_answer() {
        let recorder = Arc::new(Recorder::default());
        let session = ChatSession::new(client()).with_observer(recorder.clone());

        let chunks = vec![ok("The claim was "), reset()];
        let result = session
            .exchange("Why?", opened(stream::iter(chunks)))
            .await;

        assert!(matches!(result, Err(StreamError::Body(_))));
        let conversation = session.conversation();
        let answer = &conversation.turns()[1];
        assert_eq!(answer.content, CHAT_ERROR_MESSAGE);
        assert!(!answer.open);
        assert_eq!(*lock(&recorder.chunks), vec!["The claim was "]);
        assert_eq!(*lock(&recorder.sealed_failed), vec![true]);
        assert!(!session.is_in_flight());

        // a failed turn does not block the next question
        let retry = session
            .exchange("Why?", opened(stream::iter(vec![ok("Because.")])))
            .await
            .unwrap();
        assert_eq!(retry.content, "Because.");
    }

    #[tokio::test]
    async fn test_chat_second_send_is_blocked() {
        let session = ChatSession::new(client());
        let (tx, rx) = futures::channel::mpsc::unbounded::<Chunk>();

        let first = session.exchange("first", opened(rx));
        let second = async {
            tokio::task::yield_now().await;
            let blocked = session
                .exchange("second", opened(stream::iter(Vec::<Chunk>::new())))
                .await;
            assert!(matches!(blocked, Err(StreamError::ChatBusy)));
            tx.unbounded_send(ok("done")).unwrap();
            drop(tx);
        };

        let (first, ()) = tokio::join!(first, second);
        assert_eq!(first.unwrap().content, "done");
        assert_eq!(session.conversation().turns().len(), 2);
    }

    #[tokio::test]
    async fn test_blank_inputs_rejected() {
        let pipeline = ClaimPipeline::new(client());
        assert!(matches!(
            pipeline.submit_text("   ").await,
            Err(StreamError::EmptyClaim)
        ));
        assert_eq!(pipeline.snapshot().phase, RequestPhase::Idle);

        let session = ChatSession::new(client());
        assert!(matches!(
            session.send("[]", "\n").await,
            Err(StreamError::EmptyQuestion)
        ));
        assert!(session.conversation().turns().is_empty());
    }

    #[test]
    fn test_summarize_prefers_error_then_summary() {
        let mut state = ProgressState::new();
        let record = |stage: &str, json: serde_json::Value| {
            StreamRecord::new(stage, serde_json::from_value(json).unwrap())
        };
        state.apply(record("Intake Node", serde_json::json!({"summary": "Fever consult"})));
        state.apply(record("Policy Node", serde_json::json!({"decision": "APPROVED"})));
        assert_eq!(summarize(&state).as_deref(), Some("Fever consult"));

        state.error = Some("HTTP 500".to_string());
        assert_eq!(summarize(&state).as_deref(), Some("HTTP 500"));
    }
}
