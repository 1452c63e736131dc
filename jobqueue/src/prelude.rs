//! The purpose of this module is to alleviate the need to import many of the `[jobqueue]` types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use jobqueue::prelude::*;
//! ```
pub use crate::auth::{AuthProvider, StaticTokens, Unauthorized};
pub use crate::backoff::{BackoffStrategy, Jitter, Strategy};
pub use crate::config::{BackoffConfig, QueueConfig};
pub use crate::job::{Job, JobId, JobStatus, JobStatusView, TenantId};
pub use crate::retry::{RetryDecision, RetryPolicy};
pub use crate::store::{Store, StoreError};
pub use crate::work::{ErrorType, WorkContext, WorkError, WorkFunction};
pub use crate::{JobQueue, JobQueueError};
