pub mod binding;
pub mod cleanup;
pub mod config;
pub mod executor;
pub mod health;
pub mod listener;
pub mod lock;
pub mod mapping;
pub mod processors;
pub mod scheduler;
pub mod schema;
pub mod sources;
pub mod tasks;

pub use executor::{ExecuteType, ExecutorRequest, ExecutorResponse, InterfaceExecutor};
pub use lock::{DistributedLock, MemoryLock, RedisLock};
pub use scheduler::{Scheduler, SchedulerCommand};
pub use sources::{CreateDataSource, DataSourceService};
pub use tasks::{CreateSyncTask, SyncTaskService};
