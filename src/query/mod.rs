pub mod engine;
pub mod statistics;

pub use engine::{QueryEngine, QueryOptions, ViewResult, ViewRow};
pub use statistics::{answer_statistics, AnswerStatistics, Combination, RoundStatistics};
