//! Scheduled, batched delivery of mailings.
//!
//! A mailing is armed on a [`Scheduler`] at its send time. When the job fires, the
//! [`RecipientResolver`] supplies the current audience and the [`BatchDispatcher`]
//! pushes it through a [`Transport`] in fixed-size, independently retried batches.

pub mod dispatcher;
pub mod resolver;
pub mod scheduler;
pub mod transport;

pub use dispatcher::{
    Backoff, BatchDispatcher, BatchReport, DispatchOutcome, DispatchPlan, DispatchPolicy, DispatchReport,
};
pub use resolver::{RecipientCache, RecipientResolver, SubscriberSource};
pub use scheduler::{JobController, Scheduler, TokioScheduler};
pub use transport::{DeliveryError, LogTransport, Message, Transport};
