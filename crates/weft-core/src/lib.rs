pub mod config;
pub mod error;
pub mod event;
pub mod namespace;
pub mod steering;
pub mod template;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{
    CompileError, LexError, ParseError, Result, RuntimeError, SteeringError, ValidationError,
    WeftError,
};
pub use event::{EventBus, RunSubscription};
pub use namespace::Registry;
pub use types::*;
