//! The tokio backend.
//!
//! Every task is first passed through [`asynchronize`], so workers only ever
//! await. Blocking callables are pushed onto an [`Executor`]; generators are
//! driven as streams on the event loop. Stage runners, queues and the
//! sentinel protocol mirror the threaded backend.

mod adapter;
mod executor;
mod io;
mod queue;
mod stage;

pub use adapter::asynchronize;
pub use executor::{BlockingJob, BlockingPoolExecutor, Executor, Executors, IsolatedExecutor};
pub use io::{AsyncDequeue, AsyncEnqueue};
pub use queue::AsyncStageQueue;
pub use stage::{AsyncProducer, AsyncProducerConsumer};
