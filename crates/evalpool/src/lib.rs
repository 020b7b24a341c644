// evalpool: pools of out-of-process script evaluators over pipe-framed RPC.

pub mod config;
pub mod error;
pub mod evaluator;
pub mod session;
pub mod wire;
pub mod worker;

mod handle;
mod pool;
mod proc;
mod reaper;
mod registry;
mod rpc;

pub use config::{default_worker_path, PoolConfig, PoolOptions, WORKER_BIN_NAME};
pub use error::{ErrorCode, PoolError};
pub use evaluator::{EvalOutput, Evaluator};
pub use pool::{active, configure, pool_config};
pub use registry::shutdown;
pub use session::Session;
pub use worker::{parse_worker_args, run_worker, WorkerArgs, WorkerError};
