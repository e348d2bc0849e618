//! HTTP surface of the stepwise runtime: one streaming route per lane plus
//! run history reads.

pub mod config;
pub mod http;
pub mod state;
pub mod transport;

pub use config::ServerConfig;
pub use http::{router, ApiError, IDENTITY_HEADER};
pub use state::AppState;
