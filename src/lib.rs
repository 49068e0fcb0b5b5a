//! LDAP directory server request-processing core.
//!
//! Owns the path from a decoded request to a worker thread and back:
//!
//! - **connection**: fixed-capacity connection table, lifecycle state
//!   machine and the serialized write path
//! - **operation**: pooled operation objects with a fixed header and a
//!   recyclable body
//! - **scheduler**: per-connection admission and backpressure, the worker
//!   pool, dispatch, completion and rescheduling
//! - **txn**: per-thread read-snapshot reuse and per-operation bindings
//!
//! The wire codec, operation semantics and storage engine are external and
//! plugged in through [`protocol::PduSource`], [`handler::OperationHandler`],
//! [`transport::Transport`], [`transport::ResponseEncoder`] and
//! [`txn::StorageEnv`].

pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod operation;
pub mod protocol;
pub mod scheduler;
pub mod shutdown;
pub mod stats;
pub mod telemetry;
pub mod transport;
pub mod txn;

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use config::CoreConfig;
pub use error::{CoreError, ResultCode};
pub use handler::{HandlerOutcome, OpContext, OperationHandler};
pub use scheduler::{Dispatcher, Received};
pub use shutdown::ShutdownResult;

/// A running core: the dispatcher plus its maintenance task.
pub struct DirectoryCore {
    config: CoreConfig,
    dispatcher: Dispatcher,
    maintenance: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl DirectoryCore {
    /// Build the dispatcher and start the worker pool.
    pub fn new(
        config: CoreConfig,
        handler: Arc<dyn OperationHandler>,
        encoder: Arc<dyn transport::ResponseEncoder>,
    ) -> Result<Self, CoreError> {
        let config = config.normalized();
        let dispatcher = Dispatcher::new(&config, handler, encoder)?;
        Ok(Self { config, dispatcher, maintenance: None, cancel: CancellationToken::new() })
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Start the periodic sweeper. Requires a tokio runtime.
    pub fn spawn_maintenance(&mut self) {
        if self.maintenance.is_none() {
            self.maintenance = Some(scheduler::spawn_sweeper(
                self.dispatcher.clone(),
                self.config.sweep_interval(),
                self.cancel.clone(),
            ));
        }
    }

    /// Stop maintenance and drain the dispatcher within the configured
    /// shutdown timeout.
    pub fn shutdown(&mut self) -> ShutdownResult {
        self.cancel.cancel();
        if let Some(task) = self.maintenance.take() {
            task.abort();
        }
        self.dispatcher.shutdown(self.config.shutdown_timeout())
    }
}
