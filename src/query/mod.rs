//! Query routing, cancellation tokens and execution.

pub mod executor;
pub mod routing;
pub mod tokens;

pub use executor::{ExecutionSummary, PreparedQuery, QueryExecutor, QueryRequest};
pub use routing::{resolve_profile, Route, RouteSource, FILE_AUTO_PROFILE_ID};
pub use tokens::{QuerySessionRegistry, QueryToken};
