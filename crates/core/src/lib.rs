pub mod config;
pub mod duration;
pub mod errors;

pub use config::AppConfig;
pub use duration::{parse_duration, print_duration};
pub use errors::{ErrorList, FlowlordError, FlowlordResult};
