mod errors;
mod execution;
mod id;
mod interface;
mod schedule;
mod source;
mod status;
mod task;

pub use errors::{Error, Result};
pub use execution::{ExecutionType, SyncTaskExecution, SyncTaskInterface};
pub use id::{Id, IdGenerator, ParseIdError};
pub use interface::{
    normalize_fields, ColumnType, DataInterface, IncrementalConfig, InterfaceType, TableField,
};
pub use schedule::ScheduleConfig;
pub use source::{DataSource, Library, LibraryType, SourceCategory, SourceStatus, SourceType};
pub use status::{DataSourceStatus, InterfaceStatus, ProbeState};
pub use task::{
    validate_trigger, ExecutionStatus, SyncTask, TaskStatus, TaskType, TriggerType,
};
