//! Connection management

mod health;
mod pool;
mod session;
mod supervisor;

pub use health::{HealthMonitor, SweepReport};
pub use pool::ConnectionPool;
pub use session::{Session, SessionId, SessionReader, OUTBOUND_QUEUE_CAPACITY};
pub use supervisor::{CandidateSource, Endpoint, Supervisor};
