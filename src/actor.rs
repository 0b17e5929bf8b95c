//! Mailbox helpers shared by the pipeline actors.
//!
//! Every actor owns a bounded `mpsc` receiver and drains it in a
//! `while let Some(msg) = rx.recv().await` loop, so messages are handled in
//! arrival order. Two ways to talk to an actor:
//!
//! - [`post`]: fire-and-forget, never blocks. Used between actors and from
//!   listener callbacks running on another actor's task.
//! - [`call`]: the message carries a [`Reply`] and the caller awaits it.
//!   Used by external callers for configuration-style operations.
//!
//! Mailboxes are sized with [`queue_depth_for`] so that `post` cannot
//! overflow while the pipeline holds at most its depth of requests.

use hal_core::config::CameraCapabilities;
use hal_core::{HalError, HalResult};
use std::future::Future;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn, Instrument};

/// Reply channel carried by synchronous messages.
pub type Reply<T> = oneshot::Sender<HalResult<T>>;

/// Mailbox capacity for the actors of one camera: `requested`, raised to
/// the camera's minimum.
pub fn queue_depth_for(caps: &CameraCapabilities, requested: usize) -> usize {
    let min = caps.min_message_queue_depth();
    if requested < min {
        warn!(camera_id = caps.id, requested, min, "message queue depth raised");
        return min;
    }
    requested
}

/// Post `msg` without waiting.
///
/// A full queue means an actor fell far behind its producers; it is
/// reported as `NoMemory` and the message is dropped.
pub fn post<M>(tx: &mpsc::Sender<M>, actor: &'static str, msg: M) -> HalResult<()> {
    match tx.try_send(msg) {
        Ok(()) => Ok(()),
        Err(mpsc::error::TrySendError::Full(_)) => {
            error!(actor, "message queue full, dropping message");
            Err(HalError::NoMemory(format!("{actor} queue full")))
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!(actor, "actor stopped, dropping message");
            Err(HalError::NoInit)
        }
    }
}

/// Send a message built around a fresh reply channel and wait for the answer.
pub async fn call<M, T>(
    tx: &mpsc::Sender<M>,
    actor: &'static str,
    make: impl FnOnce(Reply<T>) -> M,
) -> HalResult<T> {
    let (reply, rx) = oneshot::channel();
    tx.send(make(reply)).await.map_err(|_| HalError::NoInit)?;
    rx.await
        .map_err(|_| HalError::UnknownError(format!("{actor} dropped the reply")))?
}

/// Answer a synchronous message. A caller that gave up is not an error.
pub fn respond<T>(reply: Reply<T>, result: HalResult<T>) {
    if reply.send(result).is_err() {
        debug!("caller went away before the reply");
    }
}

/// Spawn an actor loop inside a span named after the actor.
pub fn spawn_actor<F>(name: &'static str, camera_id: i32, fut: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(fut.instrument(tracing::info_span!("actor", name, camera_id)))
}

#[cfg(test)]
mod tests {
    use super::*;

    enum Msg {
        Add(i32, Reply<i32>),
        Note(i32),
    }

    async fn run(mut rx: mpsc::Receiver<Msg>) {
        let mut total = 0;
        while let Some(msg) = rx.recv().await {
            match msg {
                Msg::Add(n, reply) => {
                    total += n;
                    respond(reply, Ok(total));
                }
                Msg::Note(n) => total += n,
            }
        }
    }

    #[test]
    fn test_queue_depth_is_raised_to_the_camera_minimum() {
        let caps = CameraCapabilities::default();
        let min = caps.min_message_queue_depth();
        assert_eq!(queue_depth_for(&caps, 2), min);
        assert_eq!(queue_depth_for(&caps, 0), min);
        assert_eq!(queue_depth_for(&caps, min + 10), min + 10);
    }

    #[tokio::test]
    async fn test_post_then_call_preserves_order() {
        let (tx, rx) = mpsc::channel(4);
        spawn_actor("adder", 0, run(rx));

        post(&tx, "adder", Msg::Note(2)).unwrap();
        post(&tx, "adder", Msg::Note(3)).unwrap();
        let total = call(&tx, "adder", |r| Msg::Add(5, r)).await.unwrap();
        assert_eq!(total, 10);
    }

    #[tokio::test]
    async fn test_post_to_full_queue_is_no_memory() {
        let (tx, _rx) = mpsc::channel(1);
        post(&tx, "stalled", Msg::Note(1)).unwrap();
        assert!(matches!(
            post(&tx, "stalled", Msg::Note(1)),
            Err(HalError::NoMemory(_))
        ));
    }

    #[tokio::test]
    async fn test_call_to_stopped_actor() {
        let (tx, rx) = mpsc::channel::<Msg>(1);
        drop(rx);
        let result = call(&tx, "gone", |r| Msg::Add(1, r)).await;
        assert!(matches!(result, Err(HalError::NoInit)));
    }

    #[tokio::test]
    async fn test_dropped_reply_is_unknown_error() {
        let (tx, mut rx) = mpsc::channel::<Msg>(1);
        tokio::spawn(async move {
            // Drop the message, and with it the reply sender.
            let _ = rx.recv().await;
        });
        let result = call(&tx, "forgetful", |r| Msg::Add(1, r)).await;
        assert!(matches!(result, Err(HalError::UnknownError(_))));
    }
}
