//! Unread-mail retrieval pipeline
//!
//! [`retrieve`] drives one session through connect, folder select, unseen
//! search and a batched fetch. Every fetched body is parsed on the blocking
//! pool while the fetch keeps reading; a [`CompletionBarrier`] joins the
//! parse tasks, whose number is only known once the fetch stream ends.
//!
//! Fatal errors close the session before they surface. A message that fails
//! to parse is logged and left out of the result.

use std::future::Future;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::barrier::CompletionBarrier;
use crate::errors::{AppError, AppResult};
use crate::mime::{self, ParsedMessage};
use crate::transport::{
    FetchedMessage, FolderHandle, MailSession, MailTransport, SequenceSet, WindowBasis,
};

/// Time LOGOUT may take past the deadline, or after cancellation
const FORCED_CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Parameters of one `read_emails` call
#[derive(Debug, Clone)]
pub struct RetrievalRequest {
    pub folder: String,
    /// Maximum number of messages to fetch
    pub count: u32,
    pub window: WindowBasis,
    /// Deadline for the whole operation, measured from the call
    pub timeout: Duration,
}

/// Pipeline states; each arm of [`retrieve`]'s loop handles one
enum Stage<S> {
    Connecting,
    SelectingFolder(S),
    Searching(S, FolderHandle),
    Fetching(S, SequenceSet),
    Closing(S, Vec<ParsedMessage>),
    Failed(S, AppError),
}

impl<S> Stage<S> {
    fn name(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::SelectingFolder(_) => "selecting_folder",
            Self::Searching(..) => "searching",
            Self::Fetching(..) => "fetching",
            Self::Closing(..) => "closing",
            Self::Failed(..) => "failed",
        }
    }
}

/// Deadline and cancellation shared by every step of one retrieval
struct StepGuard<'a> {
    deadline: Instant,
    cancel: &'a CancellationToken,
}

impl StepGuard<'_> {
    async fn run<T>(
        &self,
        step: &'static str,
        fut: impl Future<Output = AppResult<T>>,
    ) -> AppResult<T> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => {
                Err(AppError::Cancelled(format!("retrieval cancelled while {step}")))
            }
            res = timeout_at(self.deadline, fut) => res.unwrap_or_else(|_| {
                Err(AppError::Timeout(format!("retrieval deadline exceeded while {step}")))
            }),
        }
    }

    /// Close `session` within the deadline, granting at least the grace period
    ///
    /// Cancellation during the close cuts it short after the grace period.
    async fn close<S: MailSession>(&self, session: S) {
        let limit = self.deadline.max(Instant::now() + FORCED_CLOSE_GRACE);
        let cancelled = async {
            self.cancel.cancelled().await;
            sleep(FORCED_CLOSE_GRACE).await;
        };
        tokio::select! {
            biased;
            res = timeout_at(limit, session.close()) => {
                if res.is_err() {
                    warn!("session close did not finish in time; connection dropped");
                }
            }
            () = cancelled => warn!("session close cancelled; connection dropped"),
        }
    }
}

/// Retrieve up to `request.count` unread messages from one folder
///
/// Returns parsed messages in the order their parses finished. The session is
/// opened and closed within this call and never shared.
///
/// # Errors
///
/// - `Connection`, `AuthFailed` or `InvalidInput` if the session cannot open
/// - `Folder` if the folder cannot be selected
/// - `Search` or `Fetch` for protocol failures
/// - `Timeout` when the deadline passes, `Cancelled` when `cancel` fires
pub async fn retrieve<T: MailTransport>(
    transport: &T,
    request: &RetrievalRequest,
    cancel: &CancellationToken,
) -> AppResult<Vec<ParsedMessage>> {
    let guard = StepGuard {
        deadline: Instant::now() + request.timeout,
        cancel,
    };
    let mut stage = Stage::Connecting;

    loop {
        debug!(stage = stage.name(), folder = %request.folder, "retrieval stage");
        stage = match stage {
            Stage::Connecting => {
                let session = guard.run("connecting", transport.open()).await?;
                Stage::SelectingFolder(session)
            }
            Stage::SelectingFolder(mut session) => {
                match guard
                    .run("selecting folder", session.select_folder(&request.folder))
                    .await
                {
                    Ok(folder) => Stage::Searching(session, folder),
                    Err(e) => Stage::Failed(session, e),
                }
            }
            Stage::Searching(mut session, folder) => {
                match guard.run("searching", session.search_unseen()).await {
                    Ok(unseen) if unseen.is_empty() => {
                        info!(folder = %folder.name, "no unread messages");
                        Stage::Closing(session, Vec::new())
                    }
                    Ok(unseen) => {
                        let set = request.window.sequence_set(&folder, &unseen, request.count);
                        debug!(
                            folder = %folder.name,
                            total = folder.total,
                            unseen = unseen.len(),
                            set = %set,
                            "fetch window computed"
                        );
                        if set.is_empty() {
                            Stage::Closing(session, Vec::new())
                        } else {
                            Stage::Fetching(session, set)
                        }
                    }
                    Err(e) => Stage::Failed(session, e),
                }
            }
            Stage::Fetching(mut session, set) => {
                match guard.run("fetching", fetch_and_parse(&mut session, set)).await {
                    Ok(messages) => Stage::Closing(session, messages),
                    Err(e) => Stage::Failed(session, e),
                }
            }
            Stage::Closing(session, messages) => {
                guard.close(session).await;
                info!(
                    folder = %request.folder,
                    returned = messages.len(),
                    "retrieval finished"
                );
                return Ok(messages);
            }
            Stage::Failed(session, err) => {
                warn!(folder = %request.folder, "retrieval failed: {err}");
                guard.close(session).await;
                return Err(err);
            }
        };
    }
}

/// Fetch `set` and parse every delivered message concurrently
///
/// The fetch loop holds its own barrier registration until the stream ends,
/// so the barrier cannot settle while further messages may still arrive.
async fn fetch_and_parse<S: MailSession>(
    session: &mut S,
    set: SequenceSet,
) -> AppResult<Vec<ParsedMessage>> {
    let requested = set.count();
    let (barrier, settled) = CompletionBarrier::with_signal();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let producer = barrier.register();
    let mut stream = session.fetch(set.clone()).await?;
    while let Some(item) = stream.next().await {
        let FetchedMessage { seq, body } = item?;
        if !set.contains(seq) {
            warn!(seq, "ignoring FETCH response outside the requested set");
            continue;
        }

        let pending = barrier.register();
        let tx = tx.clone();
        tokio::task::spawn_blocking(move || {
            match mime::parse_message(seq, &body) {
                Ok(parsed) => {
                    let _ = tx.send(parsed);
                }
                Err(e) => warn!("dropping message: {e}"),
            }
            pending.complete();
        });
    }
    drop(stream);
    drop(tx);
    debug!(in_flight = barrier.outstanding() - 1, "fetch stream drained");
    producer.complete();

    settled
        .await
        .map_err(|_| AppError::Internal("completion barrier dropped before settling".to_owned()))?;
    debug_assert!(barrier.is_settled());

    let mut messages = Vec::new();
    while let Ok(parsed) = rx.try_recv() {
        messages.push(parsed);
    }
    debug!(requested, parsed = messages.len(), "batch settled");
    Ok(messages)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use futures::StreamExt;
    use futures::stream::{self, BoxStream};
    use tokio_util::sync::CancellationToken;

    use super::{RetrievalRequest, retrieve};
    use crate::errors::{AppError, AppResult};
    use crate::transport::{
        FetchedMessage, FolderHandle, MailSession, MailTransport, SequenceSet, WindowBasis,
    };

    #[derive(Debug, Clone)]
    struct FakeMessage {
        raw: Vec<u8>,
        seen: bool,
    }

    /// How the fake server misbehaves, if at all
    #[derive(Debug, Clone, Copy, Default, PartialEq)]
    enum Fault {
        #[default]
        None,
        Connect,
        Search,
        /// Deliver the first message, then fail the stream
        FetchMidway,
        /// Never finish the fetch stream
        StallFetch,
        /// Never finish LOGOUT
        StallClose,
    }

    #[derive(Debug, Default)]
    struct Activity {
        opened: usize,
        closed: usize,
        fetched: Vec<String>,
    }

    #[derive(Clone, Default)]
    struct FakeTransport {
        folders: BTreeMap<String, Vec<FakeMessage>>,
        fault: Fault,
        activity: Arc<Mutex<Activity>>,
    }

    struct FakeSession {
        folders: BTreeMap<String, Vec<FakeMessage>>,
        fault: Fault,
        selected: Option<String>,
        activity: Arc<Mutex<Activity>>,
    }

    impl FakeTransport {
        fn with_folder(mut self, name: &str, messages: Vec<FakeMessage>) -> Self {
            self.folders.insert(name.to_owned(), messages);
            self
        }

        fn with_fault(mut self, fault: Fault) -> Self {
            self.fault = fault;
            self
        }

        fn opened(&self) -> usize {
            self.activity.lock().expect("activity lock").opened
        }

        fn closed(&self) -> usize {
            self.activity.lock().expect("activity lock").closed
        }

        fn fetched(&self) -> Vec<String> {
            self.activity.lock().expect("activity lock").fetched.clone()
        }
    }

    impl MailTransport for FakeTransport {
        type Session = FakeSession;

        async fn open(&self) -> AppResult<FakeSession> {
            if self.fault == Fault::Connect {
                return Err(AppError::Connection("connection refused".to_owned()));
            }
            self.activity.lock().expect("activity lock").opened += 1;
            Ok(FakeSession {
                folders: self.folders.clone(),
                fault: self.fault,
                selected: None,
                activity: Arc::clone(&self.activity),
            })
        }
    }

    impl FakeSession {
        fn messages(&self) -> &[FakeMessage] {
            self.selected
                .as_ref()
                .and_then(|name| self.folders.get(name))
                .map_or(&[], Vec::as_slice)
        }
    }

    impl MailSession for FakeSession {
        async fn select_folder(&mut self, folder: &str) -> AppResult<FolderHandle> {
            let name = folder.to_uppercase();
            let Some(messages) = self.folders.get(&name) else {
                return Err(AppError::Folder(format!("cannot select folder '{name}'")));
            };
            let total = u32::try_from(messages.len()).expect("small folder");
            self.selected = Some(name.clone());
            Ok(FolderHandle { name, total })
        }

        async fn search_unseen(&mut self) -> AppResult<Vec<u32>> {
            if self.fault == Fault::Search {
                return Err(AppError::Search("BAD search".to_owned()));
            }
            Ok(self
                .messages()
                .iter()
                .zip(1u32..)
                .filter(|(m, _)| !m.seen)
                .map(|(_, seq)| seq)
                .collect())
        }

        async fn fetch(
            &mut self,
            set: SequenceSet,
        ) -> AppResult<BoxStream<'_, AppResult<FetchedMessage>>> {
            self.activity
                .lock()
                .expect("activity lock")
                .fetched
                .push(set.to_string());

            // Deliver newest first so arrival order differs from fetch order.
            let mut items: Vec<AppResult<FetchedMessage>> = self
                .messages()
                .iter()
                .zip(1u32..)
                .filter(|(_, seq)| set.contains(*seq))
                .map(|(m, seq)| {
                    Ok(FetchedMessage {
                        seq,
                        body: m.raw.clone(),
                    })
                })
                .collect();
            items.reverse();

            match self.fault {
                Fault::StallFetch => return Ok(stream::pending().boxed()),
                Fault::FetchMidway => {
                    items.truncate(1);
                    items.push(Err(AppError::Fetch("connection reset".to_owned())));
                }
                _ => {}
            }

            Ok(stream::iter(items)
                .then(|item| async move {
                    tokio::task::yield_now().await;
                    item
                })
                .boxed())
        }

        async fn close(self) {
            self.activity.lock().expect("activity lock").closed += 1;
            if self.fault == Fault::StallClose {
                std::future::pending::<()>().await;
            }
        }
    }

    fn message(subject: &str, seen: bool) -> FakeMessage {
        FakeMessage {
            raw: format!(
                "From: sender@example.com\r\nTo: me@example.com\r\nSubject: {subject}\r\nDate: Wed, 1 Jan 2025 00:00:00 +0000\r\n\r\nbody of {subject}"
            )
            .into_bytes(),
            seen,
        }
    }

    fn broken(seen: bool) -> FakeMessage {
        FakeMessage {
            raw: Vec::new(),
            seen,
        }
    }

    fn request(folder: &str, count: u32, window: WindowBasis) -> RetrievalRequest {
        RetrievalRequest {
            folder: folder.to_owned(),
            count,
            window,
            timeout: Duration::from_secs(5),
        }
    }

    fn sorted_subjects(messages: &[crate::mime::ParsedMessage]) -> Vec<String> {
        let mut subjects: Vec<String> = messages
            .iter()
            .filter_map(|m| m.subject.clone())
            .collect();
        subjects.sort();
        subjects
    }

    fn five_unread() -> Vec<FakeMessage> {
        (1..=5).map(|i| message(&format!("m{i}"), false)).collect()
    }

    #[tokio::test]
    async fn fetches_newest_two_of_five_and_closes_once() {
        for window in [WindowBasis::Folder, WindowBasis::Unseen] {
            let transport = FakeTransport::default().with_folder("INBOX", five_unread());
            let out = retrieve(
                &transport,
                &request("INBOX", 2, window),
                &CancellationToken::new(),
            )
            .await
            .expect("retrieval succeeds");

            assert_eq!(transport.fetched(), vec!["4:5".to_owned()]);
            assert_eq!(sorted_subjects(&out), vec!["m4", "m5"]);
            assert_eq!(transport.opened(), 1);
            assert_eq!(transport.closed(), 1);
        }
    }

    #[tokio::test]
    async fn folder_name_is_case_normalized() {
        let transport = FakeTransport::default().with_folder("INBOX", five_unread());
        let out = retrieve(
            &transport,
            &request("inbox", 1, WindowBasis::Unseen),
            &CancellationToken::new(),
        )
        .await
        .expect("lower-case folder resolves");
        assert_eq!(sorted_subjects(&out), vec!["m5"]);
    }

    #[tokio::test]
    async fn no_unread_messages_resolves_empty_without_fetch() {
        let seen = (1..=3).map(|i| message(&format!("m{i}"), true)).collect();
        let transport = FakeTransport::default().with_folder("INBOX", seen);
        let out = retrieve(
            &transport,
            &request("INBOX", 5, WindowBasis::Unseen),
            &CancellationToken::new(),
        )
        .await
        .expect("empty result is not an error");

        assert!(out.is_empty());
        assert!(transport.fetched().is_empty());
        assert_eq!(transport.closed(), 1);
    }

    #[tokio::test]
    async fn empty_folder_resolves_empty_without_fetch() {
        let transport = FakeTransport::default().with_folder("INBOX", Vec::new());
        let out = retrieve(
            &transport,
            &request("INBOX", 3, WindowBasis::Folder),
            &CancellationToken::new(),
        )
        .await
        .expect("empty folder is not an error");
        assert!(out.is_empty());
        assert!(transport.fetched().is_empty());
        assert_eq!(transport.closed(), 1);
    }

    #[tokio::test]
    async fn zero_count_skips_fetch() {
        let transport = FakeTransport::default().with_folder("INBOX", five_unread());
        let out = retrieve(
            &transport,
            &request("INBOX", 0, WindowBasis::Folder),
            &CancellationToken::new(),
        )
        .await
        .expect("zero count is not an error");
        assert!(out.is_empty());
        assert!(transport.fetched().is_empty());
        assert_eq!(transport.closed(), 1);
    }

    #[tokio::test]
    async fn missing_folder_fails_without_streaming() {
        let transport = FakeTransport::default().with_folder("INBOX", five_unread());
        let err = retrieve(
            &transport,
            &request("Nonexistent", 2, WindowBasis::Unseen),
            &CancellationToken::new(),
        )
        .await
        .expect_err("folder does not exist");

        assert!(matches!(err, AppError::Folder(_)), "got {err}");
        assert!(transport.fetched().is_empty());
        assert_eq!(transport.closed(), 1);
    }

    #[tokio::test]
    async fn connection_failure_is_fatal() {
        let transport = FakeTransport::default()
            .with_folder("INBOX", five_unread())
            .with_fault(Fault::Connect);
        let err = retrieve(
            &transport,
            &request("INBOX", 2, WindowBasis::Unseen),
            &CancellationToken::new(),
        )
        .await
        .expect_err("connect fails");
        assert!(matches!(err, AppError::Connection(_)), "got {err}");
        assert_eq!(transport.opened(), 0);
        assert_eq!(transport.closed(), 0);
    }

    #[tokio::test]
    async fn search_failure_closes_session() {
        let transport = FakeTransport::default()
            .with_folder("INBOX", five_unread())
            .with_fault(Fault::Search);
        let err = retrieve(
            &transport,
            &request("INBOX", 2, WindowBasis::Unseen),
            &CancellationToken::new(),
        )
        .await
        .expect_err("search fails");
        assert!(matches!(err, AppError::Search(_)), "got {err}");
        assert!(transport.fetched().is_empty());
        assert_eq!(transport.closed(), 1);
    }

    #[tokio::test]
    async fn fetch_stream_failure_returns_no_partial_results() {
        let transport = FakeTransport::default()
            .with_folder("INBOX", five_unread())
            .with_fault(Fault::FetchMidway);
        let err = retrieve(
            &transport,
            &request("INBOX", 3, WindowBasis::Unseen),
            &CancellationToken::new(),
        )
        .await
        .expect_err("fetch stream fails");
        assert!(matches!(err, AppError::Fetch(_)), "got {err}");
        assert_eq!(transport.closed(), 1);
    }

    #[tokio::test]
    async fn parse_failure_drops_only_that_message() {
        let messages = vec![
            message("m1", false),
            message("m2", false),
            broken(false),
            message("m4", false),
        ];
        let transport = FakeTransport::default().with_folder("INBOX", messages);
        let out = retrieve(
            &transport,
            &request("INBOX", 3, WindowBasis::Folder),
            &CancellationToken::new(),
        )
        .await
        .expect("partial failure still resolves");

        assert_eq!(transport.fetched(), vec!["2:4".to_owned()]);
        assert_eq!(sorted_subjects(&out), vec!["m2", "m4"]);
        assert!(out.iter().all(|m| m.seq != 3));
        assert_eq!(transport.closed(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn all_messages_failing_to_parse_still_resolves() {
        let messages = (0..6).map(|_| broken(false)).collect();
        let transport = FakeTransport::default().with_folder("INBOX", messages);
        let out = retrieve(
            &transport,
            &request("INBOX", 6, WindowBasis::Unseen),
            &CancellationToken::new(),
        )
        .await
        .expect("resolves with nothing parsed");
        assert!(out.is_empty());
        assert_eq!(transport.closed(), 1);
    }

    #[tokio::test]
    async fn window_basis_decides_which_messages_are_fetched() {
        let messages = vec![
            message("m1", false),
            message("m2", false),
            message("m3", true),
            message("m4", true),
            message("m5", true),
        ];

        let transport = FakeTransport::default().with_folder("INBOX", messages.clone());
        let out = retrieve(
            &transport,
            &request("INBOX", 2, WindowBasis::Unseen),
            &CancellationToken::new(),
        )
        .await
        .expect("retrieval succeeds");
        assert_eq!(transport.fetched(), vec!["1:2".to_owned()]);
        assert_eq!(sorted_subjects(&out), vec!["m1", "m2"]);

        let transport = FakeTransport::default().with_folder("INBOX", messages);
        let out = retrieve(
            &transport,
            &request("INBOX", 2, WindowBasis::Folder),
            &CancellationToken::new(),
        )
        .await
        .expect("retrieval succeeds");
        assert_eq!(transport.fetched(), vec!["4:5".to_owned()]);
        assert_eq!(sorted_subjects(&out), vec!["m4", "m5"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn repeated_retrieval_is_idempotent() {
        let messages: Vec<FakeMessage> = (1..=30)
            .map(|i| message(&format!("m{i:02}"), i % 3 == 0))
            .collect();
        let transport = FakeTransport::default().with_folder("INBOX", messages);
        let req = request("INBOX", 12, WindowBasis::Unseen);

        let first = retrieve(&transport, &req, &CancellationToken::new())
            .await
            .expect("first run");
        let second = retrieve(&transport, &req, &CancellationToken::new())
            .await
            .expect("second run");

        assert_eq!(first.len(), 12);
        assert_eq!(sorted_subjects(&first), sorted_subjects(&second));
        assert_eq!(transport.closed(), 2);
    }

    #[tokio::test]
    async fn deadline_fails_with_timeout_and_closes() {
        let transport = FakeTransport::default()
            .with_folder("INBOX", five_unread())
            .with_fault(Fault::StallFetch);
        let mut req = request("INBOX", 2, WindowBasis::Unseen);
        req.timeout = Duration::from_millis(50);

        let err = retrieve(&transport, &req, &CancellationToken::new())
            .await
            .expect_err("stalled fetch hits the deadline");
        assert!(matches!(err, AppError::Timeout(_)), "got {err}");
        assert_eq!(transport.closed(), 1);
    }

    #[tokio::test]
    async fn cancellation_fails_and_closes() {
        let transport = FakeTransport::default()
            .with_folder("INBOX", five_unread())
            .with_fault(Fault::StallFetch);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = retrieve(&transport, &request("INBOX", 2, WindowBasis::Unseen), &cancel)
            .await
            .expect_err("cancelled mid-fetch");
        assert!(matches!(err, AppError::Cancelled(_)), "got {err}");
        assert_eq!(transport.closed(), 1);
    }

    #[tokio::test]
    async fn stalled_logout_after_failure_is_bounded() {
        let transport = FakeTransport::default()
            .with_folder("INBOX", five_unread())
            .with_fault(Fault::StallClose);
        let mut req = request("Nonexistent", 2, WindowBasis::Unseen);
        req.timeout = Duration::from_millis(50);

        let result = tokio::time::timeout(
            Duration::from_secs(3),
            retrieve(&transport, &req, &CancellationToken::new()),
        )
        .await
        .expect("retrieval returns despite a stalled logout");
        let err = result.expect_err("folder does not exist");
        assert!(matches!(err, AppError::Folder(_)), "got {err}");
        assert_eq!(transport.closed(), 1);
    }

    #[tokio::test]
    async fn stalled_logout_after_success_keeps_results() {
        let transport = FakeTransport::default()
            .with_folder("INBOX", five_unread())
            .with_fault(Fault::StallClose);
        let mut req = request("INBOX", 2, WindowBasis::Unseen);
        req.timeout = Duration::from_millis(200);

        let result = tokio::time::timeout(
            Duration::from_secs(3),
            retrieve(&transport, &req, &CancellationToken::new()),
        )
        .await
        .expect("retrieval returns despite a stalled logout");
        let out = result.expect("messages were already parsed");
        assert_eq!(sorted_subjects(&out), vec!["m4", "m5"]);
        assert_eq!(transport.closed(), 1);
    }

    #[tokio::test]
    async fn cancellation_cuts_a_stalled_logout_short() {
        let transport = FakeTransport::default()
            .with_folder("INBOX", five_unread())
            .with_fault(Fault::StallClose);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let mut req = request("INBOX", 2, WindowBasis::Unseen);
        req.timeout = Duration::from_secs(60);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let result =
            tokio::time::timeout(Duration::from_secs(3), retrieve(&transport, &req, &cancel))
                .await
                .expect("cancellation bounds the logout");
        assert!(result.is_ok(), "fetch finished before cancellation");
        assert_eq!(transport.closed(), 1);
    }
}
