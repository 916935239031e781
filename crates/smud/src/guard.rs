//! Mutual exclusion over the instrument.
//!
//! One actor task owns the [`Instrument`] and runs queued operations one at a
//! time in arrival order. An operation may issue any number of calls; nothing
//! else reaches the instrument until it finishes.

use std::{future::Future, pin::Pin};

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::{error::CommandError, instrument::Instrument};

const GUARD_QUEUE: usize = 64;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

type Operation = Box<dyn for<'a> FnOnce(&'a mut Instrument) -> BoxFuture<'a, ()> + Send>;

enum GuardMsg {
    Run(Operation),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct InstrumentGuard {
    tx: mpsc::Sender<GuardMsg>,
}

impl InstrumentGuard {
    /// Moves `instrument` into a new actor task.
    pub fn spawn(instrument: Instrument) -> Self {
        let (tx, rx) = mpsc::channel(GUARD_QUEUE);
        tokio::spawn(run_guard(instrument, rx));
        Self { tx }
    }

    /// Runs `operation` with exclusive access to the instrument.
    pub async fn execute<T, F>(&self, operation: F) -> Result<T, CommandError>
    where
        T: Send + 'static,
        F: for<'a> FnOnce(&'a mut Instrument) -> BoxFuture<'a, Result<T, CommandError>>
            + Send
            + 'static,
    {
        let (reply, rx) = oneshot::channel();
        let job = boxed(move |instrument| {
            Box::pin(async move {
                let result = operation(instrument).await;
                let _ = reply.send(result);
            })
        });
        self.tx
            .send(GuardMsg::Run(job))
            .await
            .map_err(|_| CommandError::Unavailable)?;
        rx.await.map_err(|_| CommandError::Unavailable)?
    }

    /// Queues the safe-shutdown sequence behind every pending operation and
    /// stops the actor once it has run.
    pub async fn shutdown(&self) -> Result<(), CommandError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(GuardMsg::Shutdown(reply))
            .await
            .map_err(|_| CommandError::Unavailable)?;
        rx.await.map_err(|_| CommandError::Unavailable)
    }
}

fn boxed<F>(operation: F) -> Operation
where
    F: for<'a> FnOnce(&'a mut Instrument) -> BoxFuture<'a, ()> + Send + 'static,
{
    Box::new(operation)
}

async fn run_guard(mut instrument: Instrument, mut rx: mpsc::Receiver<GuardMsg>) {
    while let Some(msg) = rx.recv().await {
        match msg {
            GuardMsg::Run(operation) => operation(&mut instrument).await,
            GuardMsg::Shutdown(reply) => {
                instrument.safe_shutdown().await;
                let _ = reply.send(());
                break;
            }
        }
    }
    debug!("instrument guard stopped");
}
