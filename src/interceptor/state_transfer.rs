//! Retry of commands that ran against a stale topology.

use crate::error::{Error, Result, TopologyError};
use crate::interceptor::{
    Command, CommandHandler, CommandResult, InvocationContext, InvocationRole, Next,
};
use crate::metrics::StateTransferMetrics;
use crate::statetransfer::StateTransferLock;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// First handler of the chain.
///
/// On the originator it retries a command that failed because the topology
/// changed under it, because an owner became unreachable, or because a read
/// found only owners still receiving the key's segment. Each retry first
/// waits for a newer topology, up to `max_retries` times. On remote nodes it
/// holds the command until the topology the sender used is installed, and
/// for transactional commands until that topology's transactions arrived.
#[derive(Debug)]
pub struct StateTransferHandler {
    lock: Arc<StateTransferLock>,
    metrics: Arc<StateTransferMetrics>,
    max_retries: usize,
    topology_wait_timeout: Duration,
}

impl StateTransferHandler {
    pub fn new(
        lock: Arc<StateTransferLock>,
        metrics: Arc<StateTransferMetrics>,
        max_retries: usize,
        topology_wait_timeout: Duration,
    ) -> Self {
        Self {
            lock,
            metrics,
            max_retries,
            topology_wait_timeout,
        }
    }

    /// Topology to wait for before retrying after `error`.
    fn retry_topology(&self, error: &Error) -> u64 {
        match error {
            Error::Topology(TopologyError::Outdated { installed, .. }) => {
                (*installed).max(self.lock.topology_id())
            }
            _ => self.lock.topology_id() + 1,
        }
    }

    async fn invoke_with_retry(
        &self,
        ctx: &mut InvocationContext,
        cmd: &Command,
        next: Next<'_>,
    ) -> Result<CommandResult> {
        let mut last = None;
        for attempt in 0..=self.max_retries {
            ctx.topology_id = None;
            match next.run(ctx, cmd).await {
                Err(e)
                    if e.is_outdated_topology() || e.is_suspect() || e.is_segment_receiving() =>
                {
                    let wait_for = self.retry_topology(&e);
                    debug!(
                        command = cmd.name(),
                        attempt,
                        wait_for,
                        error = %e,
                        "Retrying command on a newer topology"
                    );
                    if attempt < self.max_retries {
                        self.metrics.command_retries.inc();
                        // a suspect that never turns into a view change still gets retried
                        let _ = self
                            .lock
                            .wait_for_topology(wait_for, self.topology_wait_timeout)
                            .await;
                    }
                    last = Some(e);
                }
                other => return other,
            }
        }
        Err(Error::RetriesExhausted {
            attempts: self.max_retries + 1,
            last: Box::new(last.unwrap_or(Error::Timeout)),
        })
    }
}

#[async_trait]
impl CommandHandler for StateTransferHandler {
    async fn handle(
        &self,
        ctx: &mut InvocationContext,
        cmd: &Command,
        next: Next<'_>,
    ) -> Result<CommandResult> {
        if ctx.role == InvocationRole::Originator {
            return self.invoke_with_retry(ctx, cmd, next).await;
        }
        if let Some(topology_id) = ctx.topology_id {
            self.lock
                .wait_for_topology(topology_id, self.topology_wait_timeout)
                .await?;
            if cmd.is_transactional() {
                self.lock
                    .wait_for_transaction_data(topology_id, self.topology_wait_timeout)
                    .await?;
            }
        }
        next.run(ctx, cmd).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheMode;
    use crate::error::{NetworkError, TransferError};
    use crate::interceptor::InterceptorChain;
    use crate::partitioning::ConsistentHashFactory;
    use crate::topology::CacheTopology;
    use parking_lot::Mutex;

    /// Fails with the queued errors, then succeeds.
    #[derive(Debug)]
    struct Flaky {
        errors: Mutex<Vec<Error>>,
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl CommandHandler for Flaky {
        async fn handle(
            &self,
            _ctx: &mut InvocationContext,
            _cmd: &Command,
            _next: Next<'_>,
        ) -> Result<CommandResult> {
            *self.calls.lock() += 1;
            match self.errors.lock().pop() {
                Some(e) => Err(e),
                None => Ok(CommandResult::Done),
            }
        }
    }

    fn install(lock: &StateTransferLock, id: u64) {
        let f = ConsistentHashFactory::new(CacheMode::Distributed, 1, 4).unwrap();
        lock.notify_topology_installed(Arc::new(CacheTopology::stable(
            id,
            1,
            f.create(&[1]).unwrap(),
            vec![],
        )));
    }

    type Setup = (
        InterceptorChain,
        Arc<Flaky>,
        Arc<StateTransferLock>,
        Arc<StateTransferMetrics>,
    );

    fn setup(errors: Vec<Error>, max_retries: usize) -> Setup {
        let lock = Arc::new(StateTransferLock::new());
        install(&lock, 5);
        let metrics = Arc::new(StateTransferMetrics::new());
        let flaky = Arc::new(Flaky {
            errors: Mutex::new(errors),
            calls: Mutex::new(0),
        });
        let chain = InterceptorChain::new(vec![
            Arc::new(StateTransferHandler::new(
                lock.clone(),
                metrics.clone(),
                max_retries,
                Duration::from_millis(200),
            )),
            flaky.clone(),
        ]);
        (chain, flaky, lock, metrics)
    }

    fn outdated() -> Error {
        TopologyError::Outdated {
            requested: 4,
            installed: 5,
        }
        .into()
    }

    #[tokio::test]
    async fn test_outdated_is_retried() {
        let (chain, flaky, _lock, metrics) = setup(vec![outdated(), outdated()], 3);
        let result = chain.invoke(InvocationContext::local(1), &Command::Clear).await;
        assert_eq!(result.unwrap(), CommandResult::Done);
        assert_eq!(*flaky.calls.lock(), 3);
        assert_eq!(metrics.command_retries.get(), 2);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let errors = (0..5).map(|_| NetworkError::Suspect(2).into()).collect();
        let (chain, flaky, _lock, _metrics) = setup(errors, 2);
        let err = chain
            .invoke(InvocationContext::local(1), &Command::Clear)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(*flaky.calls.lock(), 3);
    }

    #[tokio::test]
    async fn test_incomplete_read_owner_is_retried() {
        let receiving = TransferError::SegmentReceiving { node: 2, segment: 1 }.into();
        let (chain, flaky, _lock, metrics) = setup(vec![receiving], 2);
        let result = chain
            .invoke(InvocationContext::local(1), &Command::Get { key: "k".into() })
            .await;
        assert_eq!(result.unwrap(), CommandResult::Done);
        assert_eq!(*flaky.calls.lock(), 2);
        assert_eq!(metrics.command_retries.get(), 1);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let (chain, flaky, _lock, _metrics) = setup(vec![Error::Internal("x".into())], 3);
        assert!(chain
            .invoke(InvocationContext::local(1), &Command::Clear)
            .await
            .is_err());
        assert_eq!(*flaky.calls.lock(), 1);
    }

    #[tokio::test]
    async fn test_remote_command_waits_for_topology() {
        let (chain, flaky, lock, _metrics) = setup(vec![], 0);
        let ctx = InvocationContext {
            origin: 2,
            role: InvocationRole::Backup,
            topology_id: Some(6),
        };
        let pending = {
            let chain = chain.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { chain.invoke(ctx, &Command::Clear).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(*flaky.calls.lock(), 0);
        install(&lock, 6);
        assert!(pending.await.unwrap().is_ok());

        // no newer topology shows up: the wait times out
        let ctx = InvocationContext {
            topology_id: Some(9),
            ..ctx
        };
        assert!(matches!(
            chain.invoke(ctx, &Command::Clear).await,
            Err(Error::Timeout)
        ));
    }
}
