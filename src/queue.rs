//! Async work queue implementation.
//!
//! A named, file-locked on-disk queue directory per [`Queue`], `bincode`-
//! framed payloads, and `RecvGuard` commit/rollback semantics, wrapped in
//! envelope fields for the retry/backoff/priority/delay this domain needs,
//! since `yaque` itself has none of those primitives natively.

use std::{fmt::Debug, marker::PhantomData, ops::Deref, path::PathBuf, time::Duration as StdDuration};

use error_stack::{Report, ResultExt};
use indoc::{formatdoc, indoc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use strum::Display;
use time::{Duration, OffsetDateTime};

use crate::{
    ext::{
        error_stack::{DescribeContext, ErrorHelper},
        io,
    },
    AppContext,
};

/// Priority tiers, highest first. Each worker opens one underlying `yaque`
/// queue per tier and drains them in that order, so a
/// `High` envelope is always delivered before a `Normal` or `Low` one
/// enqueued earlier.
#[derive(Debug, Display, PartialEq, Eq, Clone, Copy, Default)]
pub enum Priority {
    /// Drained before any other tier.
    High,
    /// The default tier for ordinary work.
    #[default]
    Normal,
    /// Drained only once `High` and `Normal` are both empty.
    Low,
}

/// Errors encountered using the queue.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An underlying IO operation failed.
    #[error("underlying IO operation")]
    IO,

    /// Couldn't construct the queue, which usually means that the named queue is already in use.
    #[error("open queue")]
    Open,

    /// When sending to the queue, the item is serialized.
    /// If that serialize operation fails, this error is returned.
    #[error("serialize item")]
    Serialize,

    /// When receiving from the queue, the item is deserialized.
    /// If that deserialize operation fails, this error is returned.
    #[error("deserialize item")]
    Deserialize,
}

/// Queues supported by the application.
#[derive(Debug, Display, PartialEq, Eq, Clone, Copy)]
pub enum Queue {
    /// The queue of commit scan tasks consumed by the Commit Executor.
    Scan,

    /// The queue of metrics-export tasks consumed by the Metrics Exporter.
    Export,

    /// The queue of CSV ingestion jobs consumed by the ingestion pipeline.
    Ingest,
}

/// An envelope wraps a payload with the bookkeeping this crate's retry,
/// dead-letter and delay requirements need, since the task payload types
/// themselves (`CommitTask`, export jobs, ...) stay plain domain data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    /// The wrapped domain payload.
    pub payload: T,

    /// How many times this envelope has previously been redelivered.
    ///
    /// Incremented by the caller (not this module) each time a handler
    /// fails and chooses to redeliver rather than dead-letter; this module
    /// only carries the counter through send/receive.
    pub retry_count: i64,

    /// The envelope is not visible to receivers until this time, if set.
    #[serde(with = "time::serde::rfc3339::option")]
    pub not_before: Option<OffsetDateTime>,
}

impl<T> Envelope<T> {
    /// Wrap a payload for immediate delivery.
    pub fn new(payload: T) -> Self {
        Self {
            payload,
            retry_count: 0,
            not_before: None,
        }
    }

    /// Wrap a payload for delivery no earlier than `delay` from now.
    pub fn delayed(payload: T, delay: StdDuration) -> Self {
        let delay = Duration::new(delay.as_secs() as i64, delay.subsec_nanos() as i32);
        Self {
            payload,
            retry_count: 0,
            not_before: OffsetDateTime::now_utc().checked_add(delay),
        }
    }

    /// Build a redelivery envelope, carrying the prior retry count forward
    /// incremented by one, not visible again until `delay` has elapsed.
    pub fn redeliver(payload: T, prior_retry_count: i64, delay: StdDuration) -> Self {
        let mut envelope = Self::delayed(payload, delay);
        envelope.retry_count = prior_retry_count + 1;
        envelope
    }

    /// Whether this envelope is eligible for delivery right now.
    fn is_ready(&self) -> bool {
        match self.not_before {
            Some(at) => OffsetDateTime::now_utc() >= at,
            None => true,
        }
    }
}

/// Open every priority tier's send and receive sides for the named queue.
pub async fn open<T>(ctx: &AppContext, queue: Queue) -> Result<(Sender<T>, Receiver<T>), Report<Error>>
where
    T: Serialize + DeserializeOwned,
{
    tokio::try_join!(Sender::open(ctx, queue), Receiver::open(ctx, queue))
}

fn queue_location(ctx: &AppContext, queue: Queue, priority: Priority) -> PathBuf {
    crate::data_dir!(ctx)
        .join(queue.to_string())
        .join(priority.to_string())
}

/// The sender side of the queue: one underlying `yaque` sender per priority tier.
pub struct Sender<T> {
    t: PhantomData<T>,
    high: yaque::Sender,
    normal: yaque::Sender,
    low: yaque::Sender,
}

impl<T> Debug for Sender<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Sender([OPAQUE yaque::Sender; one per priority tier])")
    }
}

impl<T> Sender<T>
where
    T: Serialize,
{
    /// Opens the named queue for sending, across all priority tiers.
    ///
    /// # Access
    ///
    /// Access to each tier is exclusive and controlled by a lock file in
    /// that tier's working directory.
    ///
    /// # Errors
    ///
    /// This function errors if any tier of the named queue is already in
    /// use for sending (indicated by a lock file), or if an underlying IO
    /// error occurs.
    pub async fn open(ctx: &AppContext, queue: Queue) -> Result<Self, Report<Error>> {
        let (high, normal, low) = tokio::try_join!(
            open_sender(queue_location(ctx, queue, Priority::High)),
            open_sender(queue_location(ctx, queue, Priority::Normal)),
            open_sender(queue_location(ctx, queue, Priority::Low)),
        )?;
        Ok(Self {
            t: PhantomData,
            high,
            normal,
            low,
        })
    }

    /// Sends an item into the queue at the given priority, visible for
    /// delivery immediately. One send is always atomic.
    ///
    /// # Errors
    ///
    /// This function returns any underlying errors encountered while
    /// writing or flushing the queue, or while encoding the type.
    pub async fn send(&mut self, item: T, priority: Priority) -> Result<(), Report<Error>> {
        self.send_envelope(Envelope::new(item), priority).await
    }

    /// Sends an item into the queue, not visible for delivery until `delay`
    /// has elapsed. Backs re-queue-with-delay cases like admission denial
    /// and reconciler re-delivery.
    pub async fn send_delayed(
        &mut self,
        item: T,
        priority: Priority,
        delay: StdDuration,
    ) -> Result<(), Report<Error>> {
        self.send_envelope(Envelope::delayed(item, delay), priority).await
    }

    /// Sends a fully-constructed envelope, e.g. one built with
    /// [`Envelope::redeliver`] by a caller implementing its own retry
    /// policy on top of the queue's retry counter.
    pub async fn send_envelope(&mut self, envelope: Envelope<T>, priority: Priority) -> Result<(), Report<Error>> {
        let encoded = bincode::serialize(&envelope).context(Error::Serialize)?;
        let tier = match priority {
            Priority::High => &mut self.high,
            Priority::Normal => &mut self.normal,
            Priority::Low => &mut self.low,
        };
        tier.send(&encoded).await.context(Error::IO)
    }
}

async fn open_sender(path: PathBuf) -> Result<yaque::Sender, Report<Error>> {
    let lock_path = path.join("send.lock");
    io::spawn_blocking_stacked(move || {
        std::fs::create_dir_all(&path).context(Error::IO)?;
        yaque::Sender::open(&path).context(Error::IO)
    })
    .await
    .change_context(Error::Open)
    .help(indoc! {"
    This may be caused by an underlying filesystem error, or the queue may already be open for sending.
    If you are certain no other instance of this tool is running, deleting the lock file may recover this error.
    "})
    .describe_lazy(|| formatdoc! {"
    Queue working state is stored on disk, and relies on a lockfile to guard access.
    For this particular queue tier, this lock file is located at '{}'.
    ", lock_path.display()})
}

/// The receiver side of the queue: one underlying `yaque` receiver per
/// priority tier, drained highest-priority-first.
pub struct Receiver<T> {
    t: PhantomData<T>,
    high: yaque::Receiver,
    normal: yaque::Receiver,
    low: yaque::Receiver,
}

impl<T> Debug for Receiver<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Receiver([OPAQUE yaque::Receiver; one per priority tier])")
    }
}

impl<T> Receiver<T>
where
    T: DeserializeOwned,
{
    /// Opens the named queue for receiving, across all priority tiers.
    ///
    /// # Access
    ///
    /// Access to each tier is exclusive and controlled by a lock file in
    /// that tier's working directory.
    ///
    /// # Errors
    ///
    /// This function errors if any tier of the named queue is already in
    /// use for receiving (indicated by a lock file), or if an underlying IO
    /// error occurs.
    ///
    /// # Panics
    ///
    /// This function panics if it is not able to set up a notification
    /// handler to watch for file changes, per `yaque`'s own semantics.
    pub async fn open(ctx: &AppContext, queue: Queue) -> Result<Self, Report<Error>> {
        let (high, normal, low) = tokio::try_join!(
            open_receiver(queue_location(ctx, queue, Priority::High)),
            open_receiver(queue_location(ctx, queue, Priority::Normal)),
            open_receiver(queue_location(ctx, queue, Priority::Low)),
        )?;
        Ok(Self {
            t: PhantomData,
            high,
            normal,
            low,
        })
    }

    /// Retrieves the next ready envelope from the highest-priority
    /// non-empty tier. The returned guard only commits state changes to
    /// the queue when [`RecvGuard::commit`] is called (or is dropped
    /// without rollback, in a best-effort policy matching `yaque`'s own).
    ///
    /// Races all three tiers' blocking `recv`, preferring `High` over
    /// `Normal` over `Low` when more than one is simultaneously ready.
    /// Envelopes whose `not_before` has not yet elapsed are rolled back
    /// immediately and skipped, so a not-yet-ready envelope at the head of
    /// one tier only blocks that tier, not the others — a documented
    /// simplification of a true delay queue atop a FIFO on-disk queue.
    pub async fn recv(&mut self) -> Result<RecvGuard<'_, T>, Report<Error>> {
        loop {
            let guard = tokio::select! {
                biased;
                g = self.high.recv() => g,
                g = self.normal.recv() => g,
                g = self.low.recv() => g,
            }
            .context(Error::IO)?;

            let candidate = RecvGuard::<T>::from(guard);
            if candidate.not_before_elapsed() {
                return Ok(candidate);
            }
            candidate.rollback()?;
        }
    }
}

async fn open_receiver(path: PathBuf) -> Result<yaque::Receiver, Report<Error>> {
    let lock_path = path.join("recv.lock");
    io::spawn_blocking_stacked(move || {
        std::fs::create_dir_all(&path).context(Error::IO)?;
        yaque::Receiver::open(&path).context(Error::IO)
    })
    .await
    .change_context(Error::Open)
    .help(indoc! {"
    This may be caused by an underlying filesystem error, or the queue may already be open for receiving.
    If you are certain no other instance of this tool is running, deleting the lock file may recover this error.
    "})
    .describe_lazy(|| formatdoc! {"
    Queue working state is stored on disk, and relies on a lockfile to guard access.
    For this particular queue tier, this lock file is located at '{}'.
    ", lock_path.display()})
}

/// A guard that will only log changes on the queue state when dropped.
///
/// If it is dropped without a call to [`RecvGuard::commit`], changes will be
/// rolled back in a "best effort" policy: if any IO error is encountered
/// during rollback, the state will be committed. If you *can* do something
/// with the IO error, use [`RecvGuard::rollback`] explicitly to catch it.
pub struct RecvGuard<'a, T> {
    t: PhantomData<T>,
    internal: yaque::queue::RecvGuard<'a, Vec<u8>>,
}

impl<'a, T> RecvGuard<'a, T>
where
    T: DeserializeOwned,
{
    /// Commits the changes to the queue, consuming this `RecvGuard`.
    pub fn commit(self) -> Result<(), Report<Error>> {
        self.internal.commit().context(Error::IO)
    }

    /// Rolls the reader back to the previous point, negating the changes made
    /// on the queue. This is also done on drop. However, on drop, the possible
    /// IO error is ignored (but logged as an error) because we cannot have
    /// errors inside drops. Use this if you want to control errors at rollback.
    ///
    /// # Errors
    ///
    /// If there is some error while moving the reader back, this error will be
    /// returned.
    pub fn rollback(self) -> Result<(), Report<Error>> {
        self.internal.rollback().context(Error::IO)
    }

    /// Returns a decoded form of the element received, including queue
    /// bookkeeping (retry counter, delay).
    pub fn envelope(&self) -> Result<Envelope<T>, Report<Error>> {
        bincode::deserialize(self.data()).context(Error::Deserialize)
    }

    /// Returns a decoded form of just the wrapped payload, discarding
    /// bookkeeping. Most callers that aren't implementing retry/dead-letter
    /// logic themselves only need this.
    pub fn item(&self) -> Result<T, Report<Error>> {
        self.envelope().map(|envelope| envelope.payload)
    }

    fn not_before_elapsed(&self) -> bool {
        match self.envelope() {
            Ok(envelope) => envelope.is_ready(),
            // If we can't even decode the envelope, don't get stuck retrying forever;
            // let the caller's normal deserialize-error handling take over.
            Err(_) => true,
        }
    }

    /// Returns a reference to the encoded element received.
    fn data(&self) -> &[u8] {
        self.internal.deref()
    }
}

impl<'a, T> From<yaque::queue::RecvGuard<'a, Vec<u8>>> for RecvGuard<'a, T> {
    fn from(internal: yaque::queue::RecvGuard<'a, Vec<u8>>) -> Self {
        Self {
            t: PhantomData,
            internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;

    #[tokio::test]
    async fn sender_lockfile_location_per_tier() {
        let tmp = tempdir().expect("must create temporary directory");
        let path = tmp.path().join("scan").join(Priority::Normal.to_string());

        let _tx = open_sender(path.clone()).await.expect("must open sender");

        let lockfile = path.join("send.lock");
        assert!(
            fs::metadata(&lockfile).is_ok(),
            "must create lockfile at {lockfile:?}"
        );
    }

    #[tokio::test]
    async fn receiver_lockfile_location_per_tier() {
        let tmp = tempdir().expect("must create temporary directory");
        let path = tmp.path().join("scan").join(Priority::Normal.to_string());

        let _rx = open_receiver(path.clone()).await.expect("must open receiver");

        let lockfile = path.join("recv.lock");
        assert!(
            fs::metadata(&lockfile).is_ok(),
            "must create lockfile at {lockfile:?}"
        );
    }

    #[tokio::test]
    async fn round_trips_payload_and_drains_highest_priority_first() {
        let tmp = tempdir().expect("must create temporary directory");
        let ctx = AppContext::new(tmp.path().to_path_buf());

        let (mut tx, mut rx) = open::<String>(&ctx, Queue::Scan).await.expect("must open queue");

        tx.send("low one".to_string(), Priority::Low).await.expect("send low");
        tx.send("high one".to_string(), Priority::High).await.expect("send high");

        let first = rx.recv().await.expect("must receive");
        assert_eq!(first.item().expect("decode"), "high one");
        first.commit().expect("commit");

        let second = rx.recv().await.expect("must receive");
        assert_eq!(second.item().expect("decode"), "low one");
        second.commit().expect("commit");
    }

    #[tokio::test]
    async fn delayed_envelope_is_not_delivered_before_not_before() {
        let tmp = tempdir().expect("must create temporary directory");
        let ctx = AppContext::new(tmp.path().to_path_buf());

        let (mut tx, mut rx) = open::<String>(&ctx, Queue::Scan).await.expect("must open queue");
        tx.send_delayed("later".to_string(), Priority::Normal, StdDuration::from_millis(200))
            .await
            .expect("send delayed");

        let started = std::time::Instant::now();
        let guard = rx.recv().await.expect("must eventually receive");
        assert_eq!(guard.item().expect("decode"), "later");
        assert!(started.elapsed() >= StdDuration::from_millis(150));
        guard.commit().expect("commit");
    }

    #[tokio::test]
    async fn redeliver_increments_retry_count() {
        let tmp = tempdir().expect("must create temporary directory");
        let ctx = AppContext::new(tmp.path().to_path_buf());

        let (mut tx, mut rx) = open::<String>(&ctx, Queue::Scan).await.expect("must open queue");
        let envelope = Envelope::redeliver("retried".to_string(), 2, StdDuration::ZERO);
        tx.send_envelope(envelope, Priority::Normal).await.expect("send");

        let guard = rx.recv().await.expect("must receive");
        assert_eq!(guard.envelope().expect("decode").retry_count, 3);
        guard.commit().expect("commit");
    }
}
