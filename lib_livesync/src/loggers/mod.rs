/// Console and daily-file logging on top of `tracing-subscriber`.
pub mod loggerlocal;

pub use loggerlocal::init_logging;
