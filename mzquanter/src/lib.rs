mod args;
mod driver;
mod proc;
mod progress;
mod time_range;
mod types;

pub use args::{FixedLabelArg, LabelArgError, MetabolicLabelArg};
pub use driver::{MZQuanter, MZQuanterError};
pub use progress::ProgressRecord;
pub use time_range::{TimeRange, TimeRangeParseError};
