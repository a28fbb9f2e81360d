//! Contract between the messaging client and the application's writers.

use std::{collections::BTreeSet, path::PathBuf};

use thiserror::Error;

use crate::messages::{ConsumerDescription, EvaluationDescription, StatisticsMessage};

/// Failure raised by a consumer. The client reports it on the status channel.
#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("{0}")]
    Failed(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConsumerError {
    pub fn failed(reason: impl Into<String>) -> Self {
        ConsumerError::Failed(reason.into())
    }
}

pub type ConsumerResult<T> = Result<T, ConsumerError>;

/// A stateful sink for the statistics of one scope: a whole evaluation or one group.
///
/// Calls for one scope are serialized; `accept` and `finalize` run on the
/// blocking pool and may perform file i/o. Statistics within a scope may arrive
/// in any order.
pub trait Consumer: Send {
    fn accept(&mut self, statistics: &StatisticsMessage) -> ConsumerResult<()>;

    /// Called once after every statistics message of the scope was accepted.
    /// Returns the locations of the artifacts written.
    fn finalize(&mut self) -> ConsumerResult<BTreeSet<PathBuf>>;
}

/// Produces consumers on demand, supplied by the hosting application.
pub trait ConsumerFactory: Send + Sync {
    /// Consumer for the ungrouped statistics of an evaluation.
    fn get_consumer(&self, description: &EvaluationDescription) -> ConsumerResult<Box<dyn Consumer>>;

    /// Consumer for the statistics of one group.
    fn get_grouped_consumer(
        &self,
        description: &EvaluationDescription,
        group_id: &str,
    ) -> ConsumerResult<Box<dyn Consumer>>;

    fn consumer_description(&self) -> ConsumerDescription;
}
