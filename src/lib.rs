//! Worker brokerage: the wire protocol, coordinator, and brokerage layer a
//! distributed build system uses to find and register compile workers.

pub mod brokerage;
pub mod coordinator;
pub mod error;
pub mod net;
pub mod registry;

pub use brokerage::{find_workers, BrokerageArgs, BrokerageConfig, BrokerageServer, Mode, WorkerSettings};
pub use coordinator::{CoordinatorService, COORDINATOR_PORT, EXIT_CODE_BIND_FAILED};
pub use error::{BrokerError, Result};
pub use net::{Address, ConnectionPool, Handler, Message};
pub use registry::{WorkerFilter, WorkerRecord, WorkerRegistry, WORKER_TIMEOUT};
